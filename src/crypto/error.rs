//! Crypto codec error types

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("random source unavailable: {0}")]
    RandomSource(String),

    #[error("failed to seal value")]
    Seal,

    #[error("failed to open value: authentication failed")]
    Open,

    #[error("malformed ciphertext envelope")]
    MalformedEnvelope,

    #[error("invalid base64 in ciphertext envelope")]
    InvalidBase64,

    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,

    /// The plain column holds a hash but the shadow column is empty, so the
    /// original value cannot be recovered.
    #[error("hashed value has no ciphertext to recover it from")]
    MissingCiphertext,
}
