//! Append-only audit log for vault operations
//!
//! Records connections, credential revocation, and authentication events
//! without ever including credential values. One text line per event:
//!
//! ```text
//! 2026-10-19T08:15:02.113Z [connected] Connected to web (10.0.0.5)
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::{VaultError, VaultResult};

/// Audit log file name
const AUDIT_FILE: &str = "log.txt";

/// Types of auditable events
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    /// Credentials were handed to the OS cache and the remote client launched
    Connected { name: String, address: String },

    /// Exposed credentials were removed from the OS cache
    CredentialsRevoked { name: String, address: String },

    /// Removing exposed credentials failed; they may still be cached
    RevokeFailed { address: String, reason: String },

    /// Wrong master password on one attempt
    UnlockFailed { attempt: u32 },

    /// Attempt limit reached, session terminated
    LockedOut { attempts: u32 },

    /// Master password set for the first time (or reset)
    PasswordSet,

    /// Master password changed
    PasswordChanged,

    /// Change requested with the wrong current password
    PasswordChangeRejected,

    ServerAdded { name: String },

    ServerUpdated { name: String },

    ServerRemoved { name: String },
}

impl AuditEvent {
    /// Short tag written in brackets
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Connected { .. } => "connected",
            AuditEvent::CredentialsRevoked { .. } => "revoked",
            AuditEvent::RevokeFailed { .. } => "revoke-failed",
            AuditEvent::UnlockFailed { .. } => "unlock-failed",
            AuditEvent::LockedOut { .. } => "locked-out",
            AuditEvent::PasswordSet => "password-set",
            AuditEvent::PasswordChanged => "password-changed",
            AuditEvent::PasswordChangeRejected => "password-change-rejected",
            AuditEvent::ServerAdded { .. } => "server-added",
            AuditEvent::ServerUpdated { .. } => "server-updated",
            AuditEvent::ServerRemoved { .. } => "server-removed",
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEvent::Connected { name, address } => {
                write!(f, "Connected to {name} ({address})")
            }
            AuditEvent::CredentialsRevoked { name, address } => {
                write!(f, "Credentials revoked for {name} ({address})")
            }
            AuditEvent::RevokeFailed { address, reason } => {
                write!(f, "Failed to revoke credentials for {address}: {reason}")
            }
            AuditEvent::UnlockFailed { attempt } => {
                write!(f, "Incorrect master password (attempt {attempt})")
            }
            AuditEvent::LockedOut { attempts } => {
                write!(f, "Locked out after {attempts} failed attempts")
            }
            AuditEvent::PasswordSet => write!(f, "Master password set"),
            AuditEvent::PasswordChanged => write!(f, "Master password changed"),
            AuditEvent::PasswordChangeRejected => {
                write!(f, "Master password change rejected: incorrect current password")
            }
            AuditEvent::ServerAdded { name } => write!(f, "Server added: {name}"),
            AuditEvent::ServerUpdated { name } => write!(f, "Server updated: {name}"),
            AuditEvent::ServerRemoved { name } => write!(f, "Server removed: {name}"),
        }
    }
}

/// Destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, timestamp: DateTime<Utc>, event: &AuditEvent) -> VaultResult<()>;
}

/// Record an event stamped with the current time
pub async fn record(sink: &dyn AuditSink, event: AuditEvent) -> VaultResult<()> {
    sink.append(Utc::now(), &event).await
}

/// A line read back from the log
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
}

impl AuditRecord {
    fn parse(line: &str) -> Option<Self> {
        let (timestamp, rest) = line.split_once(' ')?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp).ok()?.with_timezone(&Utc);
        let rest = rest.strip_prefix('[')?;
        let (kind, message) = rest.split_once("] ")?;
        Some(Self {
            timestamp,
            kind: kind.to_string(),
            message: message.to_string(),
        })
    }
}

/// Plain-text audit log in the vault directory
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            path: base_dir.join(AUDIT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last `limit` entries, oldest first. Unparseable lines are skipped.
    pub async fn read_recent(&self, limit: usize) -> VaultResult<Vec<AuditRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).await?;
        let records: Vec<AuditRecord> = content.lines().filter_map(AuditRecord::parse).collect();

        let skip = records.len().saturating_sub(limit);
        Ok(records.into_iter().skip(skip).collect())
    }

    /// Count entries in audit log
    pub async fn count_entries(&self) -> VaultResult<usize> {
        if !self.path.exists() {
            return Ok(0);
        }

        let content = fs::read_to_string(&self.path).await?;
        Ok(content.lines().filter(|l| !l.trim().is_empty()).count())
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn append(&self, timestamp: DateTime<Utc>, event: &AuditEvent) -> VaultResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| VaultError::AuditError(format!("{}: {e}", self.path.display())))?;

        let line = format!(
            "{} [{}] {}\n",
            timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event.kind(),
            event
        );
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }
}
