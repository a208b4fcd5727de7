//! Credential vault
//!
//! Provider secrets are stored sealed in `accounts.credentials` as a
//! ChaCha20-Poly1305 envelope: `enc:v1:{key_id}:{nonce}:{ciphertext}`, both
//! parts URL-safe base64 without padding.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use kindling_common::config::VaultConfig;
use kindling_common::{Error, Result};
use serde::{Deserialize, Serialize};

const ENVELOPE_PREFIX: &str = "enc:v1:";

/// Encrypts and decrypts secrets at rest
pub trait CredentialVault: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, sealed: &str) -> Result<String>;

    /// Seal a serializable value as JSON
    fn seal_secrets(&self, secrets: &AccountSecrets) -> Result<String> {
        let json = serde_json::to_string(secrets)
            .map_err(|e| Error::Internal(format!("Failed to encode secrets: {}", e)))?;
        self.encrypt(&json)
    }

    fn open_secrets(&self, sealed: &str) -> Result<AccountSecrets> {
        let json = self.decrypt(sealed)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Internal(format!("Stored credentials are malformed: {}", e)))
    }
}

/// ChaCha20-Poly1305 vault with a single active key
pub struct ChaChaVault {
    key_id: String,
    cipher: ChaCha20Poly1305,
}

impl ChaChaVault {
    pub fn new(key_id: impl Into<String>, key: [u8; 32]) -> Self {
        Self {
            key_id: key_id.into(),
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Build from configuration. The key is 32 bytes, standard or URL-safe base64.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let encoded = config
            .key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::Config("vault.key is required".to_string()))?;

        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .or_else(|_| STANDARD.decode(encoded))
            .map_err(|e| Error::Config(format!("vault.key is not valid base64: {}", e)))?;

        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            Error::Config(format!(
                "vault.key must decode to 32 bytes, got {}",
                bytes.len()
            ))
        })?;

        Ok(Self::new(config.key_id.clone(), key))
    }
}

impl CredentialVault for ChaChaVault {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Internal(format!("Failed to encrypt secret: {}", e)))?;

        Ok(format!(
            "{ENVELOPE_PREFIX}{}:{}:{}",
            self.key_id,
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    fn decrypt(&self, sealed: &str) -> Result<String> {
        let rest = sealed
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| Error::Internal("Secret envelope is invalid".to_string()))?;

        let parts: Vec<&str> = rest.split(':').collect();
        let [key_id, nonce_b64, ciphertext_b64] = parts.as_slice() else {
            return Err(Error::Internal("Secret envelope is invalid".to_string()));
        };

        if *key_id != self.key_id {
            return Err(Error::Internal(format!(
                "Secret key id {} is not configured",
                key_id
            )));
        }

        let nonce_raw = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|e| Error::Internal(format!("Failed to decode secret nonce: {}", e)))?;
        if nonce_raw.len() != 12 {
            return Err(Error::Internal("Secret nonce length is invalid".to_string()));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64)
            .map_err(|e| Error::Internal(format!("Failed to decode secret payload: {}", e)))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_raw), ciphertext.as_ref())
            .map_err(|e| Error::Internal(format!("Failed to decrypt secret: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Internal(format!("Secret plaintext is invalid utf8: {}", e)))
    }
}

/// Connection security for SMTP and IMAP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Security {
    /// TLS from the first byte
    Tls,
    /// Plaintext upgraded with STARTTLS
    #[default]
    StartTls,
    /// No encryption, local test servers only
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub security: Security,
}

/// SMTP and IMAP login for `smtp` and `app_password` accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxLogin {
    pub smtp: ServerSettings,
    pub imap: ServerSettings,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Google service-account key, as downloaded from the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub client_id: String,
    pub private_key: String,
    #[serde(default = "default_google_token_uri")]
    pub token_uri: String,
}

fn default_google_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// Everything sealed into an account's credential column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountSecrets {
    Mailbox(MailboxLogin),
    OAuth(OAuthTokens),
    ServiceAccount(ServiceAccountKey),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vault() -> ChaChaVault {
        ChaChaVault::new("k1", [7u8; 32])
    }

    #[test]
    fn test_envelope_shape_and_roundtrip() {
        let vault = vault();
        let sealed = vault.encrypt("hunter2").unwrap();

        assert!(sealed.starts_with("enc:v1:k1:"));
        assert!(!sealed.contains("hunter2"));
        assert_eq!(vault.decrypt(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn test_nonce_differs_per_call() {
        let vault = vault();
        assert_ne!(vault.encrypt("same").unwrap(), vault.encrypt("same").unwrap());
    }

    #[test]
    fn test_wrong_key_id_is_rejected() {
        let sealed = vault().encrypt("secret").unwrap();
        let other = ChaChaVault::new("k2", [7u8; 32]);
        assert!(matches!(other.decrypt(&sealed), Err(Error::Internal(_))));
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let vault = vault();
        let sealed = vault.encrypt("secret").unwrap();
        let mut tampered = sealed.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });

        assert!(vault.decrypt(&tampered).is_err());
        assert!(vault.decrypt("plaintext").is_err());
    }

    #[test]
    fn test_from_config_validates_key() {
        let mut config = VaultConfig::default();
        assert!(matches!(
            ChaChaVault::from_config(&config),
            Err(Error::Config(_))
        ));

        config.key = Some(STANDARD.encode([1u8; 16]));
        assert!(matches!(
            ChaChaVault::from_config(&config),
            Err(Error::Config(_))
        ));

        config.key = Some(STANDARD.encode([1u8; 32]));
        assert!(ChaChaVault::from_config(&config).is_ok());
    }

    #[test]
    fn test_secrets_roundtrip_through_vault() {
        let vault = vault();
        let secrets = AccountSecrets::OAuth(OAuthTokens {
            access_token: "ya29.a".to_string(),
            refresh_token: Some("1//r".to_string()),
        });

        let sealed = vault.seal_secrets(&secrets).unwrap();
        assert_eq!(vault.open_secrets(&sealed).unwrap(), secrets);
    }
}
