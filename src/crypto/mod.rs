//! Streaming hybrid encryption
//!
//! Plaintext is carved into fixed-size chunks and each chunk is sealed as an
//! anonymous box (X25519 + XSalsa20-Poly1305) to the recipient's public key.
//! Senders are ephemeral and unauthenticated; only the holder of the
//! recipient secret key can open the stream.

mod stream;

pub use stream::{decrypt_reader, encrypt_reader, encrypted_size, CHUNK_SIZE, SEAL_OVERHEAD};

pub use crypto_box::{PublicKey, SecretKey};

use crypto_box::aead::OsRng;
use thiserror::Error;

/// Length of the Curve25519 keys in bytes.
pub const KEY_LEN: usize = 32;

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid box")]
    InvalidBox,

    #[error("sealing failed")]
    SealFailed,
}

/// Generate a fresh recipient keypair.
pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let secret = SecretKey::generate(&mut OsRng);
    let public = secret.public_key();
    (secret, public)
}

/// Derive the public key matching a stored 32-byte secret key.
pub fn public_key_for(secret: &[u8; KEY_LEN]) -> PublicKey {
    SecretKey::from(*secret).public_key()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_derivation_is_stable() {
        let (secret, public) = generate_keypair();
        let derived = public_key_for(&secret.to_bytes());
        assert_eq!(derived, public);
    }
}
