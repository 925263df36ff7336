use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::GatewayError;

/// Fixed derivation salt — versioned so a future scheme change can
/// re-derive without ambiguity about which formula produced a blob.
const DERIVE_SALT: &[u8] = b"loadgate.at-rest.v1";
const DERIVE_ROUNDS: u32 = 100_000;
const NONCE_LEN: usize = 12;

/// Data-at-rest encryption service.
///
/// The 256-bit cipher key is stretched from `ENCRYPTION_KEY` with
/// PBKDF2-SHA256. Ciphertext layout is `base64(nonce || gcm_output)`
/// with a random 12-byte nonce per encryption.
#[derive(Clone)]
pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryptor").finish_non_exhaustive()
    }
}

impl Encryptor {
    pub fn new(encryption_key: &str) -> Result<Self, GatewayError> {
        if encryption_key.is_empty() {
            return Err(GatewayError::Crypto("empty encryption key".into()));
        }
        let mut derived = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            encryption_key.as_bytes(),
            DERIVE_SALT,
            DERIVE_ROUNDS,
            &mut derived,
        );
        let cipher = Aes256Gcm::new_from_slice(&derived)
            .map_err(|e| GatewayError::Crypto(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, GatewayError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| GatewayError::Crypto(e.to_string()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(B64.encode(blob))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, GatewayError> {
        let blob = B64
            .decode(ciphertext)
            .map_err(|e| GatewayError::Crypto(format!("bad base64: {e}")))?;
        if blob.len() <= NONCE_LEN {
            return Err(GatewayError::Crypto("ciphertext too short".into()));
        }
        let (nonce, sealed) = blob.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| GatewayError::Crypto("decryption failed".into()))?;
        String::from_utf8(plain).map_err(|e| GatewayError::Crypto(e.to_string()))
    }
}

/// Deterministic fingerprint of a key value, safe to index and log.
pub fn hash_key(plaintext: &str) -> String {
    let digest = Sha256::digest(plaintext.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Constant-time string equality for credentials.
/// Length differences are handled inside `ct_eq` without early exit.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
