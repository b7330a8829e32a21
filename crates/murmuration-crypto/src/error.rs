use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// OCB2 tag mismatch, or too many consecutive bad packets since the
    /// last good one. The caller should request a `CryptSetup` resync
    /// rather than keep feeding packets to a desynced decrypt stream.
    #[error("voice decrypt failed: {0}")]
    DecryptFailed(String),
}
