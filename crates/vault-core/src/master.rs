//! Master password gate
//!
//! The vault directory holds a single `auth.dat` file whose only content is
//! the base64 of `salt || argon2id(password, salt)`. Absent or empty file
//! means no password has been set yet. Failed attempts are counted per
//! prompt loop only; nothing about lockout is persisted.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::audit::{record, AuditEvent, AuditSink};
use crate::crypto::{
    constant_time_compare, derive_password_digest, generate_salt, DIGEST_SIZE, SALT_SIZE,
};
use crate::error::{VaultError, VaultResult};
use crate::models::VaultConfig;
use crate::storage::write_private_file;

/// Master password file name
const MASTER_FILE: &str = "auth.dat";

/// Stores and verifies the master password digest
pub struct PasswordVault {
    path: PathBuf,
    config: VaultConfig,
    audit: Option<Arc<dyn AuditSink>>,
}

impl PasswordVault {
    pub fn new(base_dir: &Path, config: VaultConfig) -> Self {
        Self {
            path: base_dir.join(MASTER_FILE),
            config,
            audit: None,
        }
    }

    /// Record authentication events to `audit`
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True iff the master file exists and holds more than whitespace
    pub async fn is_initialized(&self) -> bool {
        fs::read_to_string(&self.path)
            .await
            .map(|content| !content.trim().is_empty())
            .unwrap_or(false)
    }

    /// Store the digest of `password`.
    ///
    /// Overwrites an existing digest; callers gate on [`Self::is_initialized`].
    pub async fn initialize(&self, password: &str) -> VaultResult<()> {
        self.write_digest(password).await?;
        info!("Master password set");
        self.audit(AuditEvent::PasswordSet).await;
        Ok(())
    }

    /// Check `candidate` against the stored digest
    pub async fn verify(&self, candidate: &str) -> VaultResult<bool> {
        let (salt, expected) = self.read_digest().await?;
        let mut computed = derive_password_digest(candidate.as_bytes(), &salt, &self.config)?;
        let matches = constant_time_compare(&computed, &expected);
        computed.zeroize();
        Ok(matches)
    }

    /// Prompt until the password verifies or `max_attempts` consecutive
    /// failures occur.
    ///
    /// `prompt` receives the 1-based attempt number. Exhaustion returns
    /// [`VaultError::LockedOut`]; a prompt I/O error aborts the loop.
    pub async fn verify_with_retry_loop<F>(&self, max_attempts: u32, mut prompt: F) -> VaultResult<()>
    where
        F: FnMut(u32) -> std::io::Result<String>,
    {
        let max_attempts = max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let mut candidate = prompt(attempt)?;
            let verified = self.verify(&candidate).await;
            candidate.zeroize();

            if verified? {
                return Ok(());
            }

            warn!("Incorrect master password (attempt {attempt}/{max_attempts})");
            self.audit(AuditEvent::UnlockFailed { attempt }).await;
        }

        warn!("Locked out after {max_attempts} failed attempts");
        self.audit(AuditEvent::LockedOut {
            attempts: max_attempts,
        })
        .await;

        Err(VaultError::LockedOut(max_attempts))
    }

    /// Replace the digest with that of `next`, only if `current` verifies.
    ///
    /// Returns `false` and leaves the file untouched on a wrong `current`.
    pub async fn change(&self, current: &str, next: &str) -> VaultResult<bool> {
        if !self.verify(current).await? {
            warn!("Master password change rejected");
            self.audit(AuditEvent::PasswordChangeRejected).await;
            return Ok(false);
        }

        self.write_digest(next).await?;
        info!("Master password changed");
        self.audit(AuditEvent::PasswordChanged).await;
        Ok(true)
    }

    async fn write_digest(&self, password: &str) -> VaultResult<()> {
        let salt = generate_salt();
        let mut digest = derive_password_digest(password.as_bytes(), &salt, &self.config)?;

        let mut blob = Vec::with_capacity(SALT_SIZE + DIGEST_SIZE);
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&digest);
        digest.zeroize();

        let encoded = STANDARD.encode(&blob);
        blob.zeroize();

        write_private_file(&self.path, encoded.as_bytes()).await
    }

    async fn read_digest(&self) -> VaultResult<([u8; SALT_SIZE], [u8; DIGEST_SIZE])> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotInitialized)
            }
            Err(e) => return Err(e.into()),
        };

        let encoded = content.trim();
        if encoded.is_empty() {
            return Err(VaultError::NotInitialized);
        }

        let blob = STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::VaultCorrupted)?;
        if blob.len() != SALT_SIZE + DIGEST_SIZE {
            return Err(VaultError::VaultCorrupted);
        }

        let mut salt = [0u8; SALT_SIZE];
        let mut digest = [0u8; DIGEST_SIZE];
        salt.copy_from_slice(&blob[..SALT_SIZE]);
        digest.copy_from_slice(&blob[SALT_SIZE..]);

        Ok((salt, digest))
    }

    async fn audit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            if let Err(e) = record(sink.as_ref(), event).await {
                warn!("Failed to write audit entry: {e}");
            }
        }
    }
}

impl std::fmt::Debug for PasswordVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordVault")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
