//! Data models for server records and vault configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::crypto::{Decrypted, SecretCipher};
use crate::error::VaultResult;

/// Opaque base64 ciphertext of a single credential field.
///
/// Only [`SecretCipher`] can interpret the contents; everywhere else this is
/// an ordinary string that round-trips through the server list file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedField(String);

impl EncryptedField {
    /// Wrap an already-encoded ciphertext
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Base64 text as stored on disk
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Ciphertext is not secret, but it is long and useless in logs.
impl fmt::Debug for EncryptedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedField({} bytes)", self.0.len())
    }
}

/// A stored remote desktop server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Unique identifier
    pub id: Uuid,

    /// Display name (e.g., "build-box")
    pub name: String,

    /// Host name or IP address handed to the remote client
    pub address: String,

    /// Encrypted login name
    pub username: EncryptedField,

    /// Encrypted login password
    pub password: EncryptedField,

    /// When the record was created
    pub created_at: DateTime<Utc>,

    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Create a record, encrypting both credential fields
    pub fn create(
        cipher: &SecretCipher,
        name: impl Into<String>,
        address: impl Into<String>,
        username: &str,
        password: &str,
    ) -> VaultResult<Self> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            address: address.into(),
            username: cipher.encrypt(username)?,
            password: cipher.encrypt(password)?,
            created_at: now,
            updated_at: now,
        })
    }

    /// Decrypt the username on demand
    pub fn username(&self, cipher: &SecretCipher) -> Decrypted {
        cipher.decrypt(&self.username)
    }

    /// Decrypt the password on demand
    pub fn password(&self, cipher: &SecretCipher) -> Decrypted {
        cipher.decrypt(&self.password)
    }

    /// Replace the username with an already encrypted value
    pub fn set_username(&mut self, username: EncryptedField) {
        self.username = username;
        self.updated_at = Utc::now();
    }

    /// Replace the password with an already encrypted value
    pub fn set_password(&mut self, password: EncryptedField) {
        self.password = password;
        self.updated_at = Utc::now();
    }

    /// Rename and/or readdress; `None` keeps the current value
    pub fn update_details(&mut self, name: Option<String>, address: Option<String>) {
        if let Some(name) = name {
            self.name = name;
        }
        if let Some(address) = address {
            self.address = address;
        }
        self.updated_at = Utc::now();
    }
}

/// Vault configuration (non-sensitive, stored in plaintext)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    /// Consecutive failed password prompts before the session exits
    pub max_unlock_attempts: u32,

    /// How long exposed credentials stay in the OS credential cache
    pub exposure_timeout_seconds: u64,

    /// Argon2 memory cost in KB
    pub argon2_memory_kb: u32,

    /// Argon2 iterations
    pub argon2_iterations: u32,

    /// Argon2 parallelism
    pub argon2_parallelism: u32,

    /// Program used to add/delete cached credentials
    pub credential_tool: String,

    /// Remote desktop client program
    pub remote_client: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            max_unlock_attempts: 5,
            exposure_timeout_seconds: 60,
            argon2_memory_kb: 19456, // 19 MB
            argon2_iterations: 2,
            argon2_parallelism: 1,
            credential_tool: "cmdkey".to_string(),
            remote_client: "mstsc".to_string(),
        }
    }
}
