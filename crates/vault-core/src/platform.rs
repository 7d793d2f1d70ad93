//! OS integrations for the exposure window
//!
//! Windows: `cmdkey` writes the credential into Credential Manager so that
//! `mstsc` can pick it up without prompting. Both program names come from
//! [`VaultConfig`] so other platforms can point at compatible wrappers.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ExposureError, ExposureResult};
use crate::exposure::{CredentialCache, RemoteLauncher, SystemExposure};
use crate::models::VaultConfig;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Credential cache driven by `cmdkey`
#[derive(Debug, Clone)]
pub struct CmdkeyCache {
    program: String,
}

impl CmdkeyCache {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[String], action: &str) -> ExposureResult<()> {
        let mut command = Command::new(&self.program);
        command.args(args);
        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        // Arguments carry the password; never log them
        let output = command.output().await.map_err(|e| {
            ExposureError::Process(format!("failed to run {}: {e}", self.program))
        })?;

        if !output.status.success() {
            return Err(ExposureError::Process(format!(
                "{} {action} exited with {}",
                self.program, output.status
            )));
        }

        debug!("{} {action} succeeded", self.program);
        Ok(())
    }
}

#[async_trait]
impl CredentialCache for CmdkeyCache {
    async fn add(&self, address: &str, username: &str, password: &str) -> ExposureResult<()> {
        let args = [
            format!("/add:{address}"),
            format!("/user:{username}"),
            format!("/pass:{password}"),
        ];
        self.run(&args, "add").await
    }

    async fn delete(&self, address: &str) -> ExposureResult<()> {
        self.run(&[format!("/delete:{address}")], "delete").await
    }
}

/// Remote desktop client launched as `mstsc /v:<address>`
#[derive(Debug, Clone)]
pub struct MstscLauncher {
    program: String,
}

impl MstscLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl RemoteLauncher for MstscLauncher {
    async fn launch(&self, address: &str) -> ExposureResult<()> {
        let child = Command::new(&self.program)
            .arg(format!("/v:{address}"))
            .spawn()
            .map_err(|e| ExposureError::Process(format!("failed to start {}: {e}", self.program)))?;

        debug!("Started {} (pid {:?}) for {address}", self.program, child.id());
        Ok(())
    }
}

/// Exposure target built from the configured programs
pub fn system_exposure(config: &VaultConfig) -> SystemExposure<CmdkeyCache, MstscLauncher> {
    SystemExposure::new(
        CmdkeyCache::new(&config.credential_tool),
        MstscLauncher::new(&config.remote_client),
    )
}
