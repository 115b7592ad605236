//! Report object layout
//!
//! A stored report is the concatenation of:
//!
//! ```text
//! "EncryptedReport\0Meta"        (20 bytes)
//! encrypted metadata JSON        (sealed-box frame stream)
//! "\0\0\0\0Data"                 (8 bytes; zeros terminate the metadata)
//! encrypted payload              (sealed-box frame stream)
//! "\0\0\0\0EOF\0"                (8 bytes)
//! ```
//!
//! The total length is computable up front, which the ingest path needs to
//! declare the object size before streaming it.

use std::io::Cursor;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::{decrypt_reader, encrypt_reader, encrypted_size, PublicKey, SecretKey};

/// Leading marker; the trailing "Meta" labels the metadata stream.
pub const FILE_HEADER: &[u8] = b"EncryptedReport\x00Meta";

/// Metadata terminator plus the "Data" section label.
pub const DATA_HEADER: &[u8] = b"\x00\x00\x00\x00Data";

/// Payload terminator plus the end marker.
pub const FOOTER: &[u8] = b"\x00\x00\x00\x00EOF\x00";

/// Metadata document embedded in every report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub subnet: String,
    #[serde(rename = "contentLength")]
    pub content_length: i64,
}

/// Errors reading a stored report object.
#[derive(Debug, Error)]
pub enum ReportObjectError {
    #[error("bad file header")]
    BadFileHeader,

    #[error("bad data header")]
    BadDataHeader,

    #[error("bad footer")]
    BadFooter,

    #[error("invalid metadata document: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exact object size for the given metadata and payload lengths.
pub fn report_object_size(metadata_len: u64, content_len: u64) -> u64 {
    FILE_HEADER.len() as u64
        + encrypted_size(metadata_len)
        + DATA_HEADER.len() as u64
        + encrypted_size(content_len)
        + FOOTER.len() as u64
}

/// Assemble the streaming report object around `metadata` and `data`.
///
/// Both sections are encrypted lazily as the returned reader is consumed, so
/// backpressure from the consumer reaches `data`.
pub fn report_object<R>(
    metadata: Vec<u8>,
    data: R,
    recipient: &PublicKey,
) -> impl AsyncRead + Send + Unpin
where
    R: AsyncRead + Send + Unpin,
{
    FILE_HEADER
        .chain(encrypt_reader(Cursor::new(metadata), recipient))
        .chain(DATA_HEADER)
        .chain(encrypt_reader(data, recipient))
        .chain(FOOTER)
}

/// A fully decoded report.
#[derive(Debug)]
pub struct ReportContents {
    pub metadata: ReportMetadata,
    pub payload: Vec<u8>,
}

/// Read a stored report object, verifying every literal marker.
///
/// `decrypt_inner` additionally peels the client-side encryption layer from
/// the payload (reports uploaded by the web client are encrypted once before
/// transmission and once more at ingest).
pub async fn read_report<R>(
    mut reader: R,
    secret: &SecretKey,
    decrypt_inner: bool,
) -> Result<ReportContents, ReportObjectError>
where
    R: AsyncRead + Send + Unpin,
{
    let mut header = [0u8; FILE_HEADER.len()];
    reader.read_exact(&mut header).await?;
    if header != FILE_HEADER {
        return Err(ReportObjectError::BadFileHeader);
    }

    let mut metadata_json = Vec::new();
    decrypt_reader(&mut reader, secret)
        .read_to_end(&mut metadata_json)
        .await?;
    let metadata: ReportMetadata = serde_json::from_slice(&metadata_json)?;

    // The metadata decryptor consumed the four zero bytes; the label remains.
    let mut marker = [0u8; 4];
    reader.read_exact(&mut marker).await?;
    if &marker != b"Data" {
        return Err(ReportObjectError::BadDataHeader);
    }

    let mut payload = Vec::new();
    {
        let mut outer = decrypt_reader(&mut reader, secret);
        if decrypt_inner {
            decrypt_reader(&mut outer, secret)
                .read_to_end(&mut payload)
                .await?;
        } else {
            outer.read_to_end(&mut payload).await?;
        }
    }

    reader.read_exact(&mut marker).await?;
    if &marker != b"EOF\x00" {
        return Err(ReportObjectError::BadFooter);
    }

    Ok(ReportContents { metadata, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn sample_metadata() -> ReportMetadata {
        ReportMetadata {
            subnet: "10.1.2.0/24".to_string(),
            content_length: 11,
        }
    }

    #[tokio::test]
    async fn test_object_layout() {
        let (_, public) = generate_keypair();
        let metadata = serde_json::to_vec(&sample_metadata()).unwrap();
        let metadata_len = metadata.len() as u64;
        let payload = b"hello world".to_vec();

        let mut object = Vec::new();
        report_object(metadata, Cursor::new(payload.clone()), &public)
            .read_to_end(&mut object)
            .await
            .unwrap();

        let expected_len = report_object_size(metadata_len, payload.len() as u64);
        assert_eq!(object.len() as u64, expected_len);

        // Markers sit at the exact offsets the size function implies.
        assert_eq!(&object[..20], FILE_HEADER);
        let data_header_at = 20 + encrypted_size(metadata_len) as usize;
        assert_eq!(&object[data_header_at..data_header_at + 8], DATA_HEADER);
        assert_eq!(&object[object.len() - 8..], FOOTER);
    }

    #[tokio::test]
    async fn test_read_report_roundtrip() {
        let (secret, public) = generate_keypair();
        let metadata = sample_metadata();
        let payload = b"hello world".to_vec();

        let mut object = Vec::new();
        report_object(
            serde_json::to_vec(&metadata).unwrap(),
            Cursor::new(payload.clone()),
            &public,
        )
        .read_to_end(&mut object)
        .await
        .unwrap();

        let report = read_report(Cursor::new(object), &secret, false)
            .await
            .unwrap();
        assert_eq!(report.metadata, metadata);
        assert_eq!(report.payload, payload);
    }

    #[tokio::test]
    async fn test_read_report_inner_layer() {
        let (secret, public) = generate_keypair();
        let metadata = sample_metadata();

        // Client-side pre-encrypted payload, terminated like any frame stream.
        let mut inner = Vec::new();
        encrypt_reader(Cursor::new(b"inner secret".to_vec()), &public)
            .read_to_end(&mut inner)
            .await
            .unwrap();
        inner.extend_from_slice(&[0, 0, 0, 0]);

        let mut object = Vec::new();
        report_object(
            serde_json::to_vec(&metadata).unwrap(),
            Cursor::new(inner),
            &public,
        )
        .read_to_end(&mut object)
        .await
        .unwrap();

        let report = read_report(Cursor::new(object), &secret, true).await.unwrap();
        assert_eq!(report.payload, b"inner secret");
    }

    #[tokio::test]
    async fn test_read_report_rejects_bad_header() {
        let (secret, _) = generate_keypair();
        let object = b"NotAReportFile\x00Xxxxxx".to_vec();
        let err = read_report(Cursor::new(object), &secret, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ReportObjectError::BadFileHeader));
    }
}
