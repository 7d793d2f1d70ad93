//! RDP Vault CLI
//!
//! Remote desktop credentials that live on disk only encrypted, and in the
//! OS credential cache only for as long as it takes to connect.

mod context;
mod menu;

use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vault_core::{
    config_file_path, default_vault_dir, load_config, save_config, AuditLog, PasswordVault,
    VaultError, VaultConfig,
};

use crate::context::VaultContext;

/// Minimum master password length accepted by `init`
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Parser)]
#[command(name = "rdpvault")]
#[command(version)]
#[command(about = "RDP Vault - remote desktop credentials, exposed only while connecting")]
#[command(after_help = "EXAMPLES:
  rdpvault                          Interactive menu
  rdpvault init                     Set the master password
  rdpvault add web 10.0.0.5         Add a server (prompts for credentials)
  rdpvault list                     List servers
  rdpvault connect 1                Connect to server #1")]
struct Cli {
    /// Vault directory (default: $RDPVAULT_DIR or ~/.rdp-vault)
    #[arg(long, global = true)]
    vault_dir: Option<PathBuf>,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Set the master password
    Init,

    /// List stored servers
    List,

    /// Add a server (prompts for username and password)
    Add {
        /// Display name
        name: String,
        /// Host name or IP address
        address: String,
    },

    /// Edit a server (blank input keeps the current value)
    Edit {
        /// Server number as shown by `list`
        index: usize,
    },

    /// Remove a server
    Remove {
        /// Server number as shown by `list`
        index: usize,
    },

    /// Connect to a server; credentials are revoked after the timeout
    #[command(after_help = "Waits until the credentials are revoked before exiting.
Ctrl-C revokes immediately.")]
    Connect {
        /// Server number as shown by `list`
        index: usize,
        /// Seconds before cached credentials are revoked
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Change the master password
    Passwd,

    /// View audit log
    Audit {
        /// Number of entries to show
        #[arg(long, default_value = "20")]
        last: usize,
    },
}

/// Initialize logging
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let vault_dir = cli.vault_dir.unwrap_or_else(default_vault_dir);
    tracing::debug!("Using vault directory: {}", vault_dir.display());

    let result = match cli.command {
        None => menu::run(&vault_dir).await,
        Some(cmd) => handle_command(&vault_dir, cmd).await,
    };

    if let Err(e) = result {
        if let Some(VaultError::LockedOut(_)) = e.downcast_ref::<VaultError>() {
            println!("Too many failed attempts. Exiting.");
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}

async fn handle_command(vault_dir: &Path, cmd: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        Commands::Init => {
            handle_init(vault_dir).await?;
        }
        Commands::List => {
            let ctx = VaultContext::unlock(vault_dir).await?;
            ctx.print_servers();
        }
        Commands::Add { name, address } => {
            let mut ctx = VaultContext::unlock(vault_dir).await?;
            let username = read_line("Enter username: ")?;
            let password = prompt_password("Enter password: ")?;
            ctx.add_server(&name, &address, &username, &password).await?;
            println!("Server '{}' added.", name.trim());
        }
        Commands::Edit { index } => {
            let index = parse_index(index)?;
            let mut ctx = VaultContext::unlock(vault_dir).await?;
            menu::edit_server(&mut ctx, index).await?;
        }
        Commands::Remove { index } => {
            let index = parse_index(index)?;
            let mut ctx = VaultContext::unlock(vault_dir).await?;
            menu::delete_server(&mut ctx, index).await?;
        }
        Commands::Connect { index, timeout } => {
            let index = parse_index(index)?;
            let ctx = VaultContext::unlock(vault_dir).await?;
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| ctx.exposure_timeout());
            handle_connect(&ctx, index, timeout).await?;
        }
        Commands::Passwd => {
            let ctx = VaultContext::unlock(vault_dir).await?;
            menu::change_password(&ctx).await?;
        }
        Commands::Audit { last } => {
            let ctx = VaultContext::unlock(vault_dir).await?;
            handle_audit(ctx.audit_log(), last).await?;
        }
    }

    Ok(())
}

// === Command Handlers ===

async fn handle_init(vault_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(vault_dir).await?;
    let vault = password_vault(vault_dir, &config);

    if vault.is_initialized().await {
        println!("Master password already set for {}", vault_dir.display());
        println!("Use 'rdpvault passwd' to change it.");
        return Ok(());
    }

    println!("Creating new vault at {}", vault_dir.display());
    println!();

    set_master_password(&vault).await?;
    write_default_config(vault_dir, &config).await?;

    println!();
    println!("Settings: {}", config_file_path(vault_dir).display());
    println!();
    println!("Next steps:");
    println!("  rdpvault add <name> <address>   Add a server");
    println!("  rdpvault connect <number>       Connect to it");

    Ok(())
}

async fn handle_connect(
    ctx: &VaultContext,
    index: usize,
    timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = ctx.connect(index, timeout).await?;

    println!("Opening Remote Desktop to {}...", session.address());
    println!(
        "Cached credentials will be revoked in {}s (Ctrl-C to revoke now).",
        timeout.as_secs()
    );

    let interrupted = tokio::select! {
        _ = session.wait() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        session.scrub_now().await;
    }

    println!("Exposure window for {} closed.", session.address());
    Ok(())
}

async fn handle_audit(log: &AuditLog, last: usize) -> Result<(), Box<dyn std::error::Error>> {
    let entries = log.read_recent(last).await?;

    if entries.is_empty() {
        println!("No audit entries found.");
        return Ok(());
    }

    let total = log.count_entries().await?;
    println!("Audit Log (last {} of {} entries)", entries.len(), total);
    println!("===========================");
    println!();

    for entry in &entries {
        println!(
            "{} [{}] {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.kind,
            entry.message
        );
    }

    Ok(())
}

// === Helper Functions ===

pub(crate) fn password_vault(vault_dir: &Path, config: &VaultConfig) -> PasswordVault {
    let audit = std::sync::Arc::new(AuditLog::new(vault_dir));
    PasswordVault::new(vault_dir, config.clone()).with_audit(audit)
}

/// Write `config` as `config.toml` unless the operator already has one
pub(crate) async fn write_default_config(
    vault_dir: &Path,
    config: &VaultConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if !config_file_path(vault_dir).exists() {
        save_config(vault_dir, config).await?;
    }
    Ok(())
}

/// Prompt for a new master password with confirmation and store it
pub(crate) async fn set_master_password(
    vault: &PasswordVault,
) -> Result<(), Box<dyn std::error::Error>> {
    let password = prompt_password("Set new app password: ")?;
    let confirm = prompt_password("Confirm app password: ")?;

    if password != confirm {
        return Err("Passwords do not match".into());
    }

    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!("Password must be at least {MIN_PASSWORD_LEN} characters").into());
    }

    vault.initialize(&password).await?;
    println!("Password saved.");
    Ok(())
}

pub(crate) fn prompt_password(prompt: &str) -> io::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;
    rpassword::read_password()
}

/// Read one line from stdin without the trailing newline.
///
/// End of input is reported as `UnexpectedEof`.
pub(crate) fn read_line(prompt: &str) -> io::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "input closed"));
    }
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}

/// Convert a 1-based server number to an index
pub(crate) fn parse_index(number: usize) -> Result<usize, Box<dyn std::error::Error>> {
    number.checked_sub(1).ok_or_else(|| "Invalid index.".into())
}

/// `None` for blank input, so edits keep the current value
pub(crate) fn non_blank(input: String) -> Option<String> {
    if input.trim().is_empty() {
        None
    } else {
        Some(input)
    }
}
