//! File storage for vault data
//!
//! Handles reading/writing the vault directory with:
//! - Atomic writes (write to temp, then rename)
//! - Automatic backups before server list writes
//! - Owner-only permissions on Unix

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{VaultError, VaultResult};
use crate::models::{ServerRecord, VaultConfig};

/// Default vault directory name
const VAULT_DIR: &str = ".rdp-vault";

/// Environment override for the vault directory
pub const VAULT_DIR_ENV: &str = "RDPVAULT_DIR";

/// Server list file name
const SERVERS_FILE: &str = "servers.json";

/// Backup of the previous server list
const SERVERS_BACKUP_FILE: &str = "servers.json.backup";

/// Config file name
const CONFIG_FILE: &str = "config.toml";

/// Get the default vault directory path
pub fn default_vault_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(VAULT_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(VAULT_DIR)
}

/// Get the server list path
pub fn servers_file_path(base_dir: &Path) -> PathBuf {
    base_dir.join(SERVERS_FILE)
}

/// Get the server list backup path
pub fn servers_backup_path(base_dir: &Path) -> PathBuf {
    base_dir.join(SERVERS_BACKUP_FILE)
}

/// Get the config file path
pub fn config_file_path(base_dir: &Path) -> PathBuf {
    base_dir.join(CONFIG_FILE)
}

/// Ensure the vault directory exists with proper permissions
pub async fn ensure_vault_dir(base_dir: &Path) -> VaultResult<()> {
    if !base_dir.exists() {
        fs::create_dir_all(base_dir).await?;

        // Set directory permissions to 700 (owner only) on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(base_dir, perms)?;
        }
    }
    Ok(())
}

/// Atomically replace `path` with `data`, readable by the owner only
pub async fn write_private_file(path: &Path, data: &[u8]) -> VaultResult<()> {
    if let Some(parent) = path.parent() {
        ensure_vault_dir(parent).await?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!("{file_name}.tmp"));

    let mut file = fs::File::create(&temp_path).await?;

    // Set file permissions to 600 (owner only) on Unix
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&temp_path, perms)?;
    }

    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Load vault configuration
pub async fn load_config(base_dir: &Path) -> VaultResult<VaultConfig> {
    let config_path = config_file_path(base_dir);

    if !config_path.exists() {
        return Ok(VaultConfig::default());
    }

    let content = fs::read_to_string(&config_path).await?;
    let config: VaultConfig =
        toml::from_str(&content).map_err(|e| VaultError::ConfigError(e.to_string()))?;

    Ok(config)
}

/// Save vault configuration
pub async fn save_config(base_dir: &Path, config: &VaultConfig) -> VaultResult<()> {
    ensure_vault_dir(base_dir).await?;

    let config_path = config_file_path(base_dir);
    let content =
        toml::to_string_pretty(config).map_err(|e| VaultError::ConfigError(e.to_string()))?;

    fs::write(&config_path, content).await?;

    Ok(())
}

/// In-memory server list bound to its file.
///
/// Indices are zero-based; the CLI shows them one-based.
#[derive(Debug)]
pub struct ServerStore {
    base_dir: PathBuf,
    servers: Vec<ServerRecord>,
}

impl ServerStore {
    /// Load the server list, or start empty if none has been saved yet
    pub async fn open(base_dir: &Path) -> VaultResult<Self> {
        let path = servers_file_path(base_dir);

        let servers = if path.exists() {
            let data = fs::read(&path).await?;
            serde_json::from_slice(&data)?
        } else {
            Vec::new()
        };

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            servers,
        })
    }

    pub fn servers(&self) -> &[ServerRecord] {
        &self.servers
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn get(&self, index: usize) -> VaultResult<&ServerRecord> {
        self.servers
            .get(index)
            .ok_or_else(|| VaultError::ServerNotFound(format!("#{}", index + 1)))
    }

    pub async fn add(&mut self, record: ServerRecord) -> VaultResult<()> {
        let mut next = self.servers.clone();
        next.push(record);
        self.commit(next).await
    }

    /// Apply `edit` to the record at `index` and persist
    pub async fn update<F>(&mut self, index: usize, edit: F) -> VaultResult<()>
    where
        F: FnOnce(&mut ServerRecord),
    {
        let mut next = self.servers.clone();
        let record = next
            .get_mut(index)
            .ok_or_else(|| VaultError::ServerNotFound(format!("#{}", index + 1)))?;
        edit(record);
        self.commit(next).await
    }

    pub async fn remove(&mut self, index: usize) -> VaultResult<ServerRecord> {
        if index >= self.servers.len() {
            return Err(VaultError::ServerNotFound(format!("#{}", index + 1)));
        }
        let mut next = self.servers.clone();
        let removed = next.remove(index);
        self.commit(next).await?;
        Ok(removed)
    }

    /// Write the list (creates backup first)
    pub async fn save(&self) -> VaultResult<()> {
        write_servers(&self.base_dir, &self.servers).await
    }

    /// Memory only changes once `servers` is on disk
    async fn commit(&mut self, servers: Vec<ServerRecord>) -> VaultResult<()> {
        write_servers(&self.base_dir, &servers).await?;
        self.servers = servers;
        Ok(())
    }
}

async fn write_servers(base_dir: &Path, servers: &[ServerRecord]) -> VaultResult<()> {
    let path = servers_file_path(base_dir);
    let backup_path = servers_backup_path(base_dir);

    if path.exists() {
        fs::copy(&path, &backup_path).await?;
    }

    let data = serde_json::to_vec_pretty(servers)?;
    write_private_file(&path, &data).await
}
