//! Field-level encryption and lookup hashing for card data at rest.
//!
//! Values produced here are self-describing:
//! - `enc:<base64 nonce>:<base64 ciphertext+tag>` for AES-256-GCM ciphertext
//! - `h:<hex>` for the HMAC-SHA256 lookup surrogate
//!
//! Both keys are derived from a single operator secret. An empty secret yields
//! a passthrough codec where every operation is the identity.

pub mod error;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

pub use error::{CryptoError, CryptoResult};

type HmacSha256 = Hmac<Sha256>;

pub const ENC_PREFIX: &str = "enc:";
pub const HASH_PREFIX: &str = "h:";

/// AES-GCM nonce length (96 bits)
const NONCE_LEN: usize = 12;

const ENC_KEY_LABEL: &[u8] = b"noebs/data-key/enc/v1";
const MAC_KEY_LABEL: &[u8] = b"noebs/data-key/mac/v1";

/// Returns true when `value` carries the lookup-hash prefix.
pub fn is_hash(value: &str) -> bool {
    value.starts_with(HASH_PREFIX)
}

/// Returns true when `value` carries the ciphertext envelope prefix.
pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENC_PREFIX)
}

struct CodecKeys {
    cipher: Aes256Gcm,
    mac: HmacSha256,
}

/// Stateless codec over keys derived once at construction.
///
/// Cloning is cheap and the codec is safe to share across tasks.
#[derive(Clone)]
pub struct DataCodec {
    keys: Option<Arc<CodecKeys>>,
}

impl DataCodec {
    /// Build a codec from the operator secret. An empty secret disables
    /// encryption entirely.
    pub fn new(secret: &str) -> Self {
        if secret.is_empty() {
            return Self::disabled();
        }

        let enc_key = derive_key(ENC_KEY_LABEL, secret);
        let mac_key = derive_key(MAC_KEY_LABEL, secret);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&enc_key));
        // HMAC takes keys of any length
        let mac = <HmacSha256 as Mac>::new_from_slice(&mac_key)
            .expect("HMAC-SHA256 accepts 32-byte keys");

        Self {
            keys: Some(Arc::new(CodecKeys { cipher, mac })),
        }
    }

    /// Passthrough codec: encrypt, decrypt and hash return their input.
    pub fn disabled() -> Self {
        Self { keys: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.keys.is_some()
    }

    /// Seal `plaintext` under a fresh random nonce.
    ///
    /// Empty input and values already in envelope form are returned as-is.
    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let Some(keys) = &self.keys else {
            return Ok(plaintext.to_string());
        };
        if plaintext.is_empty() || is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| CryptoError::RandomSource(e.to_string()))?;

        let sealed = keys
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Seal)?;

        Ok(format!(
            "{}{}:{}",
            ENC_PREFIX,
            BASE64.encode(nonce_bytes),
            BASE64.encode(sealed)
        ))
    }

    /// Open an `enc:` envelope. Values without the prefix are legacy
    /// plaintext and are returned unchanged; a prefixed value that fails to
    /// parse or authenticate is an error.
    pub fn decrypt(&self, value: &str) -> CryptoResult<String> {
        let Some(keys) = &self.keys else {
            return Ok(value.to_string());
        };
        let Some(envelope) = value.strip_prefix(ENC_PREFIX) else {
            return Ok(value.to_string());
        };

        let (nonce_b64, sealed_b64) = envelope
            .split_once(':')
            .ok_or(CryptoError::MalformedEnvelope)?;
        let nonce = BASE64
            .decode(nonce_b64)
            .map_err(|_| CryptoError::InvalidBase64)?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::MalformedEnvelope);
        }
        let sealed = BASE64
            .decode(sealed_b64)
            .map_err(|_| CryptoError::InvalidBase64)?;

        let plaintext = keys
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| CryptoError::Open)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }

    /// Deterministic keyed hash used as the searchable surrogate.
    pub fn hash(&self, plaintext: &str) -> String {
        let Some(keys) = &self.keys else {
            return plaintext.to_string();
        };
        if plaintext.is_empty() || is_hash(plaintext) {
            return plaintext.to_string();
        }

        let mut mac = keys.mac.clone();
        mac.update(plaintext.as_bytes());
        format!("{}{}", HASH_PREFIX, hex::encode(mac.finalize().into_bytes()))
    }

    pub fn is_hash(&self, value: &str) -> bool {
        is_hash(value)
    }

    pub fn is_encrypted(&self, value: &str) -> bool {
        is_encrypted(value)
    }
}

impl fmt::Debug for DataCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCodec")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn derive_key(label: &[u8], secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(label);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}
