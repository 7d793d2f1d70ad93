//! Cryptographic operations for vault security
//!
//! - AES-256-GCM for per-field encryption, keyed to the current OS user
//! - Argon2id digests for the master password
//! - Secure memory handling with zeroization

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use argon2::{Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret, SecretString};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use tokio::fs;
use zeroize::Zeroize;

use crate::error::{VaultError, VaultResult};
use crate::models::{EncryptedField, VaultConfig};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of AES-GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Size of the master password salt in bytes
pub const SALT_SIZE: usize = 16;

/// Size of the Argon2 output stored for the master password
pub const DIGEST_SIZE: usize = 32;

/// Shown in place of a credential that cannot be decrypted
pub const DECRYPTION_FAILED: &str = "[Decryption Failed]";

/// Identity key file name
const IDENTITY_FILE: &str = "identity.key";

/// Domain separation for the field key
const FIELD_KEY_CONTEXT: &[u8] = b"rdp-vault/field-key/v1";

/// The OS account that owns the vault.
///
/// Field keys are derived from the account name plus a random secret that
/// lives in a file only that account can read, so ciphertext copied to
/// another account (or another machine) does not decrypt.
pub struct UserIdentity {
    name: String,
    secret: Secret<[u8; KEY_SIZE]>,
}

impl UserIdentity {
    pub fn new(name: impl Into<String>, secret: [u8; KEY_SIZE]) -> Self {
        Self {
            name: name.into(),
            secret: Secret::new(secret),
        }
    }

    /// Account name bound into every ciphertext
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the invoking OS user
    pub fn current_user_name() -> String {
        std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "default".to_string())
    }

    /// Load the identity key for the current user, creating it on first use
    pub async fn load_or_create(base_dir: &Path) -> VaultResult<Self> {
        let path = base_dir.join(IDENTITY_FILE);
        let name = Self::current_user_name();

        if path.exists() {
            let mut bytes = fs::read(&path).await?;
            if bytes.len() != KEY_SIZE {
                bytes.zeroize();
                return Err(VaultError::KeyError(format!(
                    "{} has unexpected length",
                    path.display()
                )));
            }
            let mut secret = [0u8; KEY_SIZE];
            secret.copy_from_slice(&bytes);
            bytes.zeroize();
            return Ok(Self::new(name, secret));
        }

        let mut secret = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut secret);
        crate::storage::write_private_file(&path, &secret).await?;
        tracing::info!("Created identity key at {}", path.display());

        Ok(Self::new(name, secret))
    }
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserIdentity")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Result of decrypting a field
#[derive(Debug)]
pub enum Decrypted {
    Plain(SecretString),
    Failed,
}

impl Decrypted {
    pub fn is_failed(&self) -> bool {
        matches!(self, Decrypted::Failed)
    }

    /// Plaintext, or [`DECRYPTION_FAILED`] when the field was unreadable
    pub fn reveal_or_sentinel(&self) -> &str {
        match self {
            Decrypted::Plain(value) => value.expose_secret(),
            Decrypted::Failed => DECRYPTION_FAILED,
        }
    }

    pub fn into_secret(self) -> Option<SecretString> {
        match self {
            Decrypted::Plain(value) => Some(value),
            Decrypted::Failed => None,
        }
    }
}

/// Encrypts and decrypts individual credential fields
pub struct SecretCipher {
    cipher: Aes256Gcm,
    /// Associated data binding each ciphertext to the identity
    owner: String,
}

impl SecretCipher {
    pub fn new(identity: &UserIdentity) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FIELD_KEY_CONTEXT);
        hasher.update(identity.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(identity.secret.expose_secret());
        let mut key_bytes: [u8; KEY_SIZE] = hasher.finalize().into();

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        key_bytes.zeroize();

        Self {
            cipher,
            owner: identity.name.clone(),
        }
    }

    /// Encrypt a field with a fresh random nonce
    pub fn encrypt(&self, plaintext: &str) -> VaultResult<EncryptedField> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: self.owner.as_bytes(),
                },
            )
            .map_err(|e| VaultError::KeyError(format!("Encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(EncryptedField::from_encoded(STANDARD.encode(blob)))
    }

    /// Decrypt a field. Never fails: unreadable input yields [`Decrypted::Failed`].
    pub fn decrypt(&self, field: &EncryptedField) -> Decrypted {
        let blob = match STANDARD.decode(field.as_str()) {
            Ok(blob) => blob,
            Err(_) => {
                tracing::debug!("Credential field is not valid base64");
                return Decrypted::Failed;
            }
        };

        if blob.len() < NONCE_SIZE + TAG_SIZE {
            tracing::debug!("Credential field too short to be ciphertext");
            return Decrypted::Failed;
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        let plaintext = match self.cipher.decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: self.owner.as_bytes(),
            },
        ) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                tracing::debug!("Credential field failed authentication");
                return Decrypted::Failed;
            }
        };

        match String::from_utf8(plaintext) {
            Ok(value) => Decrypted::Plain(SecretString::new(value)),
            Err(err) => {
                let mut bytes = err.into_bytes();
                bytes.zeroize();
                Decrypted::Failed
            }
        }
    }
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCipher")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Derive the Argon2id digest of a master password
pub fn derive_password_digest(
    password: &[u8],
    salt: &[u8; SALT_SIZE],
    config: &VaultConfig,
) -> VaultResult<[u8; DIGEST_SIZE]> {
    let params = Params::new(
        config.argon2_memory_kb,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(DIGEST_SIZE),
    )
    .map_err(|e| VaultError::KeyError(e.to_string()))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; DIGEST_SIZE];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| VaultError::KeyError(e.to_string()))?;

    Ok(output)
}

/// Generate a cryptographically secure random salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Constant-time comparison to prevent timing attacks
pub(crate) fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn light_config() -> VaultConfig {
        VaultConfig {
            argon2_memory_kb: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            ..VaultConfig::default()
        }
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = SecretCipher::new(&UserIdentity::new("alice", [1u8; KEY_SIZE]));

        for plaintext in ["admin", "p@ss w0rd!", "", "pässwörd-日本"] {
            let field = cipher.encrypt(plaintext).unwrap();
            assert_eq!(cipher.decrypt(&field).reveal_or_sentinel(), plaintext);
        }
    }

    #[test]
    fn test_same_plaintext_gets_distinct_ciphertext() {
        let cipher = SecretCipher::new(&UserIdentity::new("alice", [1u8; KEY_SIZE]));
        assert_ne!(cipher.encrypt("admin").unwrap(), cipher.encrypt("admin").unwrap());
    }

    #[test]
    fn test_other_user_name_yields_sentinel() {
        let alice = SecretCipher::new(&UserIdentity::new("alice", [1u8; KEY_SIZE]));
        let bob = SecretCipher::new(&UserIdentity::new("bob", [1u8; KEY_SIZE]));

        let field = alice.encrypt("secret").unwrap();
        let result = bob.decrypt(&field);
        assert!(result.is_failed());
        assert_eq!(result.reveal_or_sentinel(), DECRYPTION_FAILED);
    }

    #[test]
    fn test_other_key_material_yields_sentinel() {
        let first = SecretCipher::new(&UserIdentity::new("alice", [1u8; KEY_SIZE]));
        let second = SecretCipher::new(&UserIdentity::new("alice", [2u8; KEY_SIZE]));

        assert!(second.decrypt(&first.encrypt("secret").unwrap()).is_failed());
    }

    #[test]
    fn test_garbage_and_tampered_input_yield_sentinel() {
        let cipher = SecretCipher::new(&UserIdentity::new("alice", [1u8; KEY_SIZE]));

        assert!(cipher.decrypt(&EncryptedField::from_encoded("not base64!")).is_failed());
        assert!(cipher.decrypt(&EncryptedField::from_encoded("QUJD")).is_failed());

        let field = cipher.encrypt("secret").unwrap();
        let mut blob = STANDARD.decode(field.as_str()).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = EncryptedField::from_encoded(STANDARD.encode(blob));
        assert!(cipher.decrypt(&tampered).is_failed());
    }

    #[tokio::test]
    async fn test_identity_key_is_persistent() {
        let temp_dir = TempDir::new().unwrap();

        let first = UserIdentity::load_or_create(temp_dir.path()).await.unwrap();
        let field = SecretCipher::new(&first).encrypt("admin").unwrap();

        let second = UserIdentity::load_or_create(temp_dir.path()).await.unwrap();
        assert_eq!(
            SecretCipher::new(&second).decrypt(&field).reveal_or_sentinel(),
            "admin"
        );
    }

    #[tokio::test]
    async fn test_truncated_identity_key_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(IDENTITY_FILE), b"short").unwrap();

        let result = UserIdentity::load_or_create(temp_dir.path()).await;
        assert!(matches!(result, Err(VaultError::KeyError(_))));
    }

    #[test]
    fn test_password_digest_is_deterministic_per_salt() {
        let config = light_config();
        let salt = generate_salt();

        let a = derive_password_digest(b"pw", &salt, &config).unwrap();
        let b = derive_password_digest(b"pw", &salt, &config).unwrap();
        let c = derive_password_digest(b"pw", &generate_salt(), &config).unwrap();

        assert!(constant_time_compare(&a, &b));
        assert!(!constant_time_compare(&a, &c));
    }

    #[test]
    fn test_salt_uniqueness() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
