//! Secret handling for webhook targets.
//!
//! Targets and signing secrets are encrypted at rest and only decrypted at
//! send time, through an explicit cipher call scoped to the point of use.
//! Decrypted values travel inside [`SecretString`], which never appears in
//! Debug output or logs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use zeroize::Zeroize;

use crate::error::CommonError;

const NONCE_LEN: usize = 12;

/// A decrypted secret. Redacted in Debug; callers reach the plaintext only
/// through [`SecretString::expose`].
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: String) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString(******)")
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        // Overwrite before release so the plaintext does not linger in
        // freed heap memory.
        self.0.zeroize();
    }
}

/// Encryption seam for secrets at rest. The production implementation is
/// [`AeadCipher`]; tests substitute a passthrough.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CommonError>;
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, CommonError>;
}

/// ChaCha20-Poly1305 cipher with key rotation: encryption always uses the
/// current key, decryption tries current then previous.
pub struct AeadCipher {
    keys: Vec<ChaCha20Poly1305>,
}

impl AeadCipher {
    /// Build from base64-encoded 32-byte keys.
    pub fn new(current_key: &str, previous_key: Option<&str>) -> Result<Self, CommonError> {
        let mut keys = vec![Self::parse_key(current_key)?];
        if let Some(previous) = previous_key {
            keys.push(Self::parse_key(previous)?);
        }
        Ok(Self { keys })
    }

    fn parse_key(encoded: &str) -> Result<ChaCha20Poly1305, CommonError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|_| CommonError::Config("encryption key is not valid base64".into()))?;
        ChaCha20Poly1305::new_from_slice(&bytes)
            .map_err(|_| CommonError::Config("encryption key must decode to 32 bytes".into()))
    }
}

impl SecretCipher for AeadCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CommonError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self.keys[0]
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CommonError::Crypto("encryption failed".into()))?;

        let mut wire = Vec::with_capacity(NONCE_LEN + sealed.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&sealed);
        Ok(BASE64.encode(wire))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, CommonError> {
        let wire = BASE64
            .decode(ciphertext.trim())
            .map_err(|_| CommonError::Crypto("ciphertext is not valid base64".into()))?;
        if wire.len() <= NONCE_LEN {
            return Err(CommonError::Crypto("ciphertext too short".into()));
        }

        let nonce = Nonce::from_slice(&wire[..NONCE_LEN]);
        for key in &self.keys {
            if let Ok(plain) = key.decrypt(nonce, &wire[NONCE_LEN..]) {
                let text = String::from_utf8(plain)
                    .map_err(|_| CommonError::Crypto("decrypted secret is not UTF-8".into()))?;
                return Ok(SecretString::new(text));
            }
        }
        Err(CommonError::Crypto(
            "unable to decrypt secret with configured keys".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        BASE64.encode([7u8; 32])
    }

    fn other_key() -> String {
        BASE64.encode([9u8; 32])
    }

    #[test]
    fn round_trip() {
        let cipher = AeadCipher::new(&test_key(), None).unwrap();
        let sealed = cipher.encrypt("https://example.com/hook").unwrap();
        assert_ne!(sealed, "https://example.com/hook");
        let opened = cipher.decrypt(&sealed).unwrap();
        assert_eq!(opened.expose(), "https://example.com/hook");
    }

    #[test]
    fn nonce_makes_ciphertexts_differ() {
        let cipher = AeadCipher::new(&test_key(), None).unwrap();
        let a = cipher.encrypt("secret").unwrap();
        let b = cipher.encrypt("secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn previous_key_still_decrypts() {
        let old = AeadCipher::new(&other_key(), None).unwrap();
        let sealed = old.encrypt("bot-token").unwrap();

        let rotated = AeadCipher::new(&test_key(), Some(&other_key())).unwrap();
        assert_eq!(rotated.decrypt(&sealed).unwrap().expose(), "bot-token");
    }

    #[test]
    fn unknown_key_fails() {
        let a = AeadCipher::new(&test_key(), None).unwrap();
        let sealed = a.encrypt("secret").unwrap();
        let b = AeadCipher::new(&other_key(), None).unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn rejects_short_key() {
        let short = BASE64.encode([1u8; 16]);
        assert!(AeadCipher::new(&short, None).is_err());
    }

    #[test]
    fn secret_string_debug_is_redacted() {
        let secret = SecretString::new("very-secret".into());
        assert_eq!(format!("{secret:?}"), "SecretString(******)");
    }
}
