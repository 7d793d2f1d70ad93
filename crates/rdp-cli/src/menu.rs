//! Interactive menu loop

use std::io;
use std::path::Path;

use vault_core::{load_config, ExposureSession};

use crate::context::VaultContext;
use crate::{
    non_blank, parse_index, password_vault, prompt_password, read_line, set_master_password,
    write_default_config, MIN_PASSWORD_LEN,
};

pub async fn run(vault_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(vault_dir).await?;
    let vault = password_vault(vault_dir, &config);

    let mut ctx = if vault.is_initialized().await {
        VaultContext::unlock(vault_dir).await?
    } else {
        set_master_password(&vault).await?;
        write_default_config(vault_dir, &config).await?;
        VaultContext::open(vault_dir, config, vault).await?
    };

    let mut sessions: Vec<ExposureSession> = Vec::new();
    let result = menu_loop(&mut ctx, &mut sessions).await;
    close_out(&mut sessions, result).await
}

async fn menu_loop(
    ctx: &mut VaultContext,
    sessions: &mut Vec<ExposureSession>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        println!();
        println!("==== RDP Vault ====");
        println!("1. View Servers");
        println!("2. Add Server");
        println!("3. Edit Server");
        println!("4. Delete Server");
        println!("5. Connect to Server (RDP)");
        println!("6. Change App Password");
        println!("7. Exit");

        let choice = match read_line("Choose an option: ") {
            Ok(choice) => choice,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        };

        let result = match choice.trim() {
            "1" => {
                ctx.print_servers();
                Ok(())
            }
            "2" => add_server(ctx).await,
            "3" => match select_server(ctx, "edit")? {
                Some(index) => edit_server(ctx, index).await,
                None => Ok(()),
            },
            "4" => match select_server(ctx, "delete")? {
                Some(index) => delete_server(ctx, index).await,
                None => Ok(()),
            },
            "5" => match select_server(ctx, "connect")? {
                Some(index) => connect(ctx, index, sessions).await,
                None => Ok(()),
            },
            "6" => change_password(ctx).await,
            "7" => break,
            _ => {
                println!("Invalid choice.");
                Ok(())
            }
        };

        if let Err(e) = result {
            if is_input_closed(e.as_ref()) {
                break;
            }
            println!("Error: {}", e);
        }

        sessions.retain(ExposureSession::is_live);

        if read_line("\nPress Enter to continue...").is_err() {
            break;
        }
    }

    Ok(())
}

/// Runs on every way out of the menu, error or not. Closed input counts as
/// a normal exit.
async fn close_out(
    sessions: &mut [ExposureSession],
    result: Result<(), Box<dyn std::error::Error>>,
) -> Result<(), Box<dyn std::error::Error>> {
    revoke_pending(sessions).await;
    match result {
        Err(e) if is_input_closed(e.as_ref()) => Ok(()),
        other => other,
    }
}

fn is_input_closed(e: &(dyn std::error::Error + 'static)) -> bool {
    e.downcast_ref::<io::Error>()
        .is_some_and(|e| e.kind() == io::ErrorKind::UnexpectedEof)
}

/// Show the list and ask for a server number
fn select_server(ctx: &VaultContext, verb: &str) -> io::Result<Option<usize>> {
    ctx.print_servers();
    if ctx.store().is_empty() {
        return Ok(None);
    }

    let input = read_line(&format!("Enter server number to {verb}: "))?;
    let index = input
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|number| parse_index(number).ok())
        .filter(|index| *index < ctx.store().len());

    if index.is_none() {
        println!("Invalid index.");
    }
    Ok(index)
}

async fn add_server(ctx: &mut VaultContext) -> Result<(), Box<dyn std::error::Error>> {
    let name = read_line("Enter server name: ")?;
    let address = read_line("Enter address: ")?;
    let username = read_line("Enter username: ")?;
    let password = prompt_password("Enter password: ")?;

    ctx.add_server(&name, &address, &username, &password).await?;
    println!("Server added.");
    Ok(())
}

pub async fn edit_server(ctx: &mut VaultContext, index: usize) -> Result<(), Box<dyn std::error::Error>> {
    let server = ctx.store().get(index)?;
    let current_name = server.name.clone();
    let current_address = server.address.clone();
    let current_username = server.username(ctx.cipher());

    let name = read_line(&format!("New Name ({current_name}): "))?;
    let address = read_line(&format!("New Address ({current_address}): "))?;
    let username = read_line(&format!(
        "New Username ({}): ",
        current_username.reveal_or_sentinel()
    ))?;
    drop(current_username);
    let password = prompt_password("New Password: ")?;

    ctx.edit_server(
        index,
        non_blank(name),
        non_blank(address),
        non_blank(username),
        non_blank(password),
    )
    .await?;

    println!("Server updated.");
    Ok(())
}

pub async fn delete_server(ctx: &mut VaultContext, index: usize) -> Result<(), Box<dyn std::error::Error>> {
    let name = ctx.store().get(index)?.name.clone();

    let confirm = read_line(&format!("Delete server '{name}'? [y/N]: "))?;
    if !confirm.trim().eq_ignore_ascii_case("y") {
        println!("Cancelled.");
        return Ok(());
    }

    ctx.remove_server(index).await?;
    println!("Server deleted.");
    Ok(())
}

async fn connect(
    ctx: &VaultContext,
    index: usize,
    sessions: &mut Vec<ExposureSession>,
) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = ctx.exposure_timeout();
    let session = ctx.connect(index, timeout).await?;

    println!("Opening Remote Desktop to {}...", session.address());
    println!(
        "Cached credentials will be revoked in {}s.",
        timeout.as_secs()
    );

    sessions.push(session);
    Ok(())
}

pub async fn change_password(ctx: &VaultContext) -> Result<(), Box<dyn std::error::Error>> {
    let current = prompt_password("Enter current password: ")?;
    let next = prompt_password("Enter new password: ")?;
    let confirm = prompt_password("Confirm new password: ")?;

    if next != confirm {
        return Err("Passwords do not match".into());
    }

    if next.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!("Password must be at least {MIN_PASSWORD_LEN} characters").into());
    }

    if ctx.vault().change(&current, &next).await? {
        println!("Password changed.");
    } else {
        println!("Incorrect current password.");
    }
    Ok(())
}

/// Revoke windows still open when the menu exits, since their timers
/// would not survive the process
async fn revoke_pending(sessions: &mut [ExposureSession]) {
    for session in sessions.iter_mut().filter(|s| s.is_live()) {
        println!("Revoking cached credentials for {}...", session.address());
        session.scrub_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use vault_core::{
        AuditLog, ExposureResult, ExposureTarget, SecretCipher, ServerRecord, UserIdentity,
    };

    #[derive(Default)]
    struct RecordingTarget {
        revoked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExposureTarget for RecordingTarget {
        async fn expose(&self, _address: &str, _username: &str, _password: &str) -> ExposureResult<()> {
            Ok(())
        }

        async fn revoke(&self, address: &str) -> ExposureResult<()> {
            self.revoked.lock().unwrap().push(address.to_string());
            Ok(())
        }
    }

    async fn open_session(target: &Arc<RecordingTarget>, temp: &TempDir) -> ExposureSession {
        let cipher = SecretCipher::new(&UserIdentity::new("alice", [3u8; 32]));
        let server = ServerRecord::create(&cipher, "web", "10.0.0.5", "admin", "p@ss").unwrap();
        ExposureSession::open(
            &server,
            &cipher,
            target.clone(),
            Arc::new(AuditLog::new(temp.path())),
            Duration::from_secs(60),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_closed_input_revokes_and_exits_cleanly() {
        let temp = TempDir::new().unwrap();
        let target = Arc::new(RecordingTarget::default());
        let mut sessions = vec![open_session(&target, &temp).await];

        let closed = io::Error::new(io::ErrorKind::UnexpectedEof, "input closed");
        let result = close_out(&mut sessions, Err(closed.into())).await;

        assert!(result.is_ok());
        assert_eq!(*target.revoked.lock().unwrap(), vec!["10.0.0.5".to_string()]);
        assert!(sessions.iter().all(|s| !s.is_live()));
    }

    #[tokio::test]
    async fn test_error_exit_still_revokes() {
        let temp = TempDir::new().unwrap();
        let target = Arc::new(RecordingTarget::default());
        let mut sessions = vec![open_session(&target, &temp).await];

        let broken = io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed");
        let result = close_out(&mut sessions, Err(broken.into())).await;

        assert!(result.is_err());
        assert_eq!(target.revoked.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_is_input_closed() {
        let eof: Box<dyn std::error::Error> =
            io::Error::new(io::ErrorKind::UnexpectedEof, "input closed").into();
        let other: Box<dyn std::error::Error> = "Passwords do not match".into();

        assert!(is_input_closed(eof.as_ref()));
        assert!(!is_input_closed(other.as_ref()));
    }
}
