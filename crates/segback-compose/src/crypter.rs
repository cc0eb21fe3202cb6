//! Encryption seam applied to archive slots and uploaded segment files.
//!
//! The algorithm lives outside this crate; the composer only needs something
//! that turns plaintext bytes into the bytes that get stored.

use bytes::Bytes;

use crate::error::Result;

/// Transforms object content before it is written to storage.
pub trait Crypter: Send + Sync {
    /// Encrypt the full content of the object stored under `key`.
    fn encrypt(&self, key: &str, plaintext: Bytes) -> Result<Bytes>;
}

/// Pass-through crypter for unencrypted backups.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCrypter;

impl Crypter for NoopCrypter {
    fn encrypt(&self, _key: &str, plaintext: Bytes) -> Result<Bytes> {
        Ok(plaintext)
    }
}
