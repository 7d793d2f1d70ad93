//! Unlocked vault state shared by one-shot commands and the menu

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use vault_core::{
    load_config, record, system_exposure, AuditEvent, AuditLog, AuditSink, ExposureSession,
    PasswordVault, SecretCipher, ServerRecord, ServerStore, UserIdentity, VaultConfig, VaultError,
};

use crate::{password_vault, prompt_password};

/// Everything needed after the master password gate has passed
pub struct VaultContext {
    config: VaultConfig,
    vault: PasswordVault,
    cipher: SecretCipher,
    store: ServerStore,
    audit: Arc<AuditLog>,
}

impl VaultContext {
    /// Pass the master password gate, then load the server list.
    ///
    /// Fails with [`VaultError::NotInitialized`] if no password is set and
    /// [`VaultError::LockedOut`] after too many wrong attempts.
    pub async fn unlock(vault_dir: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let config = load_config(vault_dir).await?;
        let vault = password_vault(vault_dir, &config);

        if !vault.is_initialized().await {
            return Err(VaultError::NotInitialized.into());
        }

        gate(&vault, &config).await?;
        Self::open(vault_dir, config, vault).await
    }

    /// Load everything behind an already-passed gate
    pub async fn open(
        vault_dir: &Path,
        config: VaultConfig,
        vault: PasswordVault,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let identity = UserIdentity::load_or_create(vault_dir).await?;
        let cipher = SecretCipher::new(&identity);
        let store = ServerStore::open(vault_dir).await?;

        Ok(Self {
            config,
            vault,
            cipher,
            store,
            audit: Arc::new(AuditLog::new(vault_dir)),
        })
    }

    pub fn vault(&self) -> &PasswordVault {
        &self.vault
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn store(&self) -> &ServerStore {
        &self.store
    }

    pub fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    pub fn exposure_timeout(&self) -> Duration {
        Duration::from_secs(self.config.exposure_timeout_seconds)
    }

    pub fn print_servers(&self) {
        if self.store.is_empty() {
            println!("No servers found.");
            return;
        }

        for (i, server) in self.store.servers().iter().enumerate() {
            let username = server.username(&self.cipher);
            println!(
                "{}. Name: {}, Address: {}, Username: {}",
                i + 1,
                server.name,
                server.address,
                username.reveal_or_sentinel()
            );
        }
    }

    pub async fn add_server(
        &mut self,
        name: &str,
        address: &str,
        username: &str,
        password: &str,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let name = name.trim();
        let address = address.trim();
        if name.is_empty() || address.is_empty() {
            return Err(VaultError::InvalidInput("name and address are required".to_string()).into());
        }

        let server = ServerRecord::create(&self.cipher, name, address, username, password)?;
        self.store.add(server).await?;
        self.audit_event(AuditEvent::ServerAdded {
            name: name.to_string(),
        })
        .await;
        Ok(())
    }

    /// Apply an edit; `None` fields keep their current value
    pub async fn edit_server(
        &mut self,
        index: usize,
        name: Option<String>,
        address: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let username = username.map(|u| self.cipher.encrypt(&u)).transpose()?;
        let password = password.map(|p| self.cipher.encrypt(&p)).transpose()?;

        self.store
            .update(index, |server| {
                server.update_details(
                    name.map(|n| n.trim().to_string()),
                    address.map(|a| a.trim().to_string()),
                );
                if let Some(username) = username {
                    server.set_username(username);
                }
                if let Some(password) = password {
                    server.set_password(password);
                }
            })
            .await?;

        let name = self.store.get(index)?.name.clone();
        self.audit_event(AuditEvent::ServerUpdated { name }).await;
        Ok(())
    }

    pub async fn remove_server(&mut self, index: usize) -> Result<ServerRecord, Box<dyn std::error::Error>> {
        let removed = self.store.remove(index).await?;
        self.audit_event(AuditEvent::ServerRemoved {
            name: removed.name.clone(),
        })
        .await;
        Ok(removed)
    }

    /// Expose the server's credentials and schedule their revoke
    pub async fn connect(
        &self,
        index: usize,
        timeout: Duration,
    ) -> Result<ExposureSession, Box<dyn std::error::Error>> {
        let server = self.store.get(index)?;
        let target = Arc::new(system_exposure(&self.config));
        let audit: Arc<dyn AuditSink> = self.audit.clone();

        let session = ExposureSession::open(server, &self.cipher, target, audit, timeout).await?;
        Ok(session)
    }

    async fn audit_event(&self, event: AuditEvent) {
        if let Err(e) = record(self.audit.as_ref(), event).await {
            tracing::warn!("Failed to write audit entry: {e}");
        }
    }
}

/// Run the retry loop against the terminal
async fn gate(vault: &PasswordVault, config: &VaultConfig) -> Result<(), VaultError> {
    vault
        .verify_with_retry_loop(config.max_unlock_attempts, |attempt| {
            if attempt > 1 {
                println!("Incorrect password. Try again.");
            }
            prompt_password("Enter app password: ")
        })
        .await
}
