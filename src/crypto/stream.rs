//! Sealed-box frame streams
//!
//! An encrypted stream is a sequence of frames, each a `u32` big-endian
//! length followed by that many ciphertext bytes; a zero length terminates
//! the stream. Note the length prefix is big-endian, unlike the Wisp packet
//! codec, and the two must not be unified.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use crypto_box::aead::OsRng;
use crypto_box::{PublicKey, SecretKey};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

use super::CryptoError;

/// Plaintext chunk size per sealed box.
pub const CHUNK_SIZE: usize = 8192;

/// Frame length prefix size.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Bytes a sealed box adds to its plaintext: a 32-byte ephemeral public key
/// and a 16-byte Poly1305 tag.
pub const SEAL_OVERHEAD: usize = 32 + 16;

/// Exact number of ciphertext bytes produced for `size` plaintext bytes.
pub fn encrypted_size(size: u64) -> u64 {
    let boxes = size.div_ceil(CHUNK_SIZE as u64);
    size + boxes * (LENGTH_PREFIX_SIZE + SEAL_OVERHEAD) as u64
}

/// Wrap `reader`, sealing every chunk of up to [`CHUNK_SIZE`] bytes to
/// `recipient` and framing it with a big-endian length prefix.
///
/// Frames are produced lazily as the output is read. The output carries no
/// zero-length terminator; the surrounding framing supplies one.
pub fn encrypt_reader<R>(reader: R, recipient: &PublicKey) -> impl AsyncRead + Send + Unpin
where
    R: AsyncRead + Send + Unpin,
{
    let recipient = recipient.clone();
    let frames = futures_util::stream::try_unfold(
        (reader, recipient),
        |(mut reader, recipient)| async move {
            let mut chunk = [0u8; CHUNK_SIZE];
            let n = read_full(&mut reader, &mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            let sealed = recipient
                .seal(&mut OsRng, &chunk[..n])
                .map_err(|_| io::Error::new(io::ErrorKind::Other, CryptoError::SealFailed))?;
            let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + sealed.len());
            frame.put_u32(sealed.len() as u32);
            frame.extend_from_slice(&sealed);
            Ok::<_, io::Error>(Some((frame.freeze(), (reader, recipient))))
        },
    );
    StreamReader::new(Box::pin(frames))
}

/// Wrap `reader`, opening length-prefixed sealed boxes with `secret`.
///
/// Reading stops with end-of-stream at the first zero-length frame (the
/// terminator is consumed) or at a clean end of the underlying reader. A box
/// that fails to open is a fatal [`CryptoError::InvalidBox`], surfaced as an
/// `InvalidData` I/O error.
pub fn decrypt_reader<R>(reader: R, secret: &SecretKey) -> impl AsyncRead + Send + Unpin
where
    R: AsyncRead + Send + Unpin,
{
    let secret = secret.clone();
    let frames =
        futures_util::stream::try_unfold((reader, secret), |(mut reader, secret)| async move {
            let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
            let n = read_full(&mut reader, &mut len_buf).await?;
            if n == 0 {
                return Ok(None);
            }
            if n < LENGTH_PREFIX_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame length",
                ));
            }
            let frame_len = u32::from_be_bytes(len_buf) as usize;
            if frame_len == 0 {
                return Ok(None);
            }
            let mut sealed = vec![0u8; frame_len];
            reader.read_exact(&mut sealed).await?;
            let plain = secret
                .unseal(&sealed)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, CryptoError::InvalidBox))?;
            Ok::<_, io::Error>(Some((Bytes::from(plain), (reader, secret))))
        });
    StreamReader::new(Box::pin(frames))
}

/// Read until `buf` is full or the reader ends; a short final read is fine.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
