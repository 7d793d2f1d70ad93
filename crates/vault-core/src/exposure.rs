//! Time-bounded credential exposure
//!
//! Connecting to a server hands its decrypted username and password to the
//! OS credential cache and launches the remote desktop client. A background
//! timer then removes the cached credential after a fixed timeout, whether or
//! not the remote session is still open. The window is bounded by time, not
//! by the lifetime of the client process.
//!
//! Known limitations:
//! - Overlapping windows on the same server are allowed; each one revokes
//!   independently.
//! - If the process exits before the timeout, the revoke never runs. Callers
//!   that can should use [`ExposureSession::scrub_now`] or
//!   [`ExposureSession::wait`] before exiting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{record, AuditEvent, AuditSink};
use crate::crypto::SecretCipher;
use crate::error::{ExposureError, ExposureResult};
use crate::models::ServerRecord;

/// OS-level credential cache (e.g. Windows Credential Manager via `cmdkey`)
#[async_trait]
pub trait CredentialCache: Send + Sync {
    async fn add(&self, address: &str, username: &str, password: &str) -> ExposureResult<()>;
    async fn delete(&self, address: &str) -> ExposureResult<()>;
}

/// Starts a remote desktop viewer. Does not wait for it to exit.
#[async_trait]
pub trait RemoteLauncher: Send + Sync {
    async fn launch(&self, address: &str) -> ExposureResult<()>;
}

/// Where credentials go during an exposure window, and how they are taken back
#[async_trait]
pub trait ExposureTarget: Send + Sync {
    async fn expose(&self, address: &str, username: &str, password: &str) -> ExposureResult<()>;
    async fn revoke(&self, address: &str) -> ExposureResult<()>;
}

/// Caches the credential, then launches the client
#[derive(Debug)]
pub struct SystemExposure<C, L> {
    cache: C,
    launcher: L,
}

impl<C, L> SystemExposure<C, L>
where
    C: CredentialCache,
    L: RemoteLauncher,
{
    pub fn new(cache: C, launcher: L) -> Self {
        Self { cache, launcher }
    }
}

#[async_trait]
impl<C, L> ExposureTarget for SystemExposure<C, L>
where
    C: CredentialCache,
    L: RemoteLauncher,
{
    async fn expose(&self, address: &str, username: &str, password: &str) -> ExposureResult<()> {
        self.cache.add(address, username, password).await?;

        if let Err(e) = self.launcher.launch(address).await {
            // No session will be created, so nothing else would remove it
            if let Err(cleanup) = self.cache.delete(address).await {
                warn!("Failed to remove cached credential for {address}: {cleanup}");
            }
            return Err(e);
        }

        Ok(())
    }

    async fn revoke(&self, address: &str) -> ExposureResult<()> {
        self.cache.delete(address).await
    }
}

const PENDING: u8 = 0;
const REVOKING: u8 = 1;
const SCRUBBED: u8 = 2;
const CANCELLED: u8 = 3;

/// Shared between the session handle and its timer task
struct Scrubber {
    name: String,
    address: String,
    target: Arc<dyn ExposureTarget>,
    audit: Arc<dyn AuditSink>,
    state: AtomicU8,
}

impl Scrubber {
    /// Revoke the credential. Only the first call does anything.
    async fn scrub(&self) -> bool {
        if self
            .state
            .compare_exchange(PENDING, REVOKING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let event = match self.target.revoke(&self.address).await {
            Ok(()) => {
                info!("Revoked cached credentials for {}", self.address);
                AuditEvent::CredentialsRevoked {
                    name: self.name.clone(),
                    address: self.address.clone(),
                }
            }
            Err(e) => {
                warn!("Failed to revoke credentials for {}: {e}", self.address);
                AuditEvent::RevokeFailed {
                    address: self.address.clone(),
                    reason: e.to_string(),
                }
            }
        };

        if let Err(e) = record(self.audit.as_ref(), event).await {
            warn!("Failed to write audit entry: {e}");
        }
        self.state.store(SCRUBBED, Ordering::Release);
        true
    }

    fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One exposure window for one server
pub struct ExposureSession {
    record_id: Uuid,
    started_at: DateTime<Utc>,
    timeout: Duration,
    scrubber: Arc<Scrubber>,
    cancel_tx: Option<oneshot::Sender<()>>,
    timer: Option<JoinHandle<()>>,
}

impl ExposureSession {
    /// Expose `server`'s credentials through `target` and schedule the revoke.
    ///
    /// Returns as soon as the credentials are exposed. If either field
    /// cannot be decrypted, or `target` fails, nothing is scheduled.
    /// Must be called within a tokio runtime.
    pub async fn open(
        server: &ServerRecord,
        cipher: &SecretCipher,
        target: Arc<dyn ExposureTarget>,
        audit: Arc<dyn AuditSink>,
        timeout: Duration,
    ) -> ExposureResult<Self> {
        let (username, password) = match (
            server.username(cipher).into_secret(),
            server.password(cipher).into_secret(),
        ) {
            (Some(username), Some(password)) => (username, password),
            _ => return Err(ExposureError::Undecryptable(server.name.clone())),
        };

        target
            .expose(
                &server.address,
                username.expose_secret(),
                password.expose_secret(),
            )
            .await?;
        drop(username);
        drop(password);

        let started_at = Utc::now();
        info!(
            "Exposed credentials for {} ({}); revoking in {}s",
            server.name,
            server.address,
            timeout.as_secs()
        );

        let connected = AuditEvent::Connected {
            name: server.name.clone(),
            address: server.address.clone(),
        };
        if let Err(e) = record(audit.as_ref(), connected).await {
            warn!("Failed to write audit entry: {e}");
        }

        let scrubber = Arc::new(Scrubber {
            name: server.name.clone(),
            address: server.address.clone(),
            target,
            audit,
            state: AtomicU8::new(PENDING),
        });

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let timer = tokio::spawn(run_timer(scrubber.clone(), timeout, cancel_rx));

        Ok(Self {
            record_id: server.id,
            started_at,
            timeout,
            scrubber,
            cancel_tx: Some(cancel_tx),
            timer: Some(timer),
        })
    }

    pub fn record_id(&self) -> Uuid {
        self.record_id
    }

    pub fn name(&self) -> &str {
        &self.scrubber.name
    }

    pub fn address(&self) -> &str {
        &self.scrubber.address
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When the scheduled revoke fires
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|timeout| self.started_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Revoke has run to completion (successfully or not) and been audited
    pub fn is_scrubbed(&self) -> bool {
        self.scrubber.state.load(Ordering::Acquire) == SCRUBBED
    }

    /// Neither cancelled nor finished revoking. A revoke in flight counts
    /// as live.
    pub fn is_live(&self) -> bool {
        matches!(
            self.scrubber.state.load(Ordering::Acquire),
            PENDING | REVOKING
        )
    }

    /// Stop the pending timer without revoking.
    ///
    /// Returns `false` if the revoke already ran or the session was already
    /// cancelled. The credential stays cached after a successful cancel.
    pub fn cancel(&mut self) -> bool {
        let cancelled = self.scrubber.cancel();
        if cancelled {
            debug!("Cancelled pending revoke for {}", self.scrubber.address);
            self.stop_timer();
        }
        cancelled
    }

    /// Revoke immediately instead of waiting for the timeout.
    ///
    /// Returns `false` if the timer got there first or the session was
    /// cancelled. Either way, no revoke is in flight once this returns.
    pub async fn scrub_now(&mut self) -> bool {
        let scrubbed = self.scrubber.scrub().await;
        self.stop_timer();
        self.wait().await;
        scrubbed
    }

    /// Wait for the timer task to finish (revoke or cancel)
    pub async fn wait(&mut self) {
        if let Some(timer) = self.timer.take() {
            if let Err(e) = timer.await {
                warn!("Revoke task for {} ended abnormally: {e}", self.scrubber.address);
            }
        }
    }

    fn stop_timer(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for ExposureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposureSession")
            .field("record_id", &self.record_id)
            .field("address", &self.scrubber.address)
            .field("started_at", &self.started_at)
            .field("timeout", &self.timeout)
            .field("scrubbed", &self.is_scrubbed())
            .finish()
    }
}

/// Sleeps for `timeout`, then revokes. An explicit cancel ends it early;
/// dropping the session handle does not.
async fn run_timer(scrubber: Arc<Scrubber>, timeout: Duration, cancel_rx: oneshot::Receiver<()>) {
    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            scrubber.scrub().await;
        }
        Ok(()) = cancel_rx => {
            debug!("Revoke timer for {} stopped", scrubber.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testing::MemoryAudit;
    use crate::crypto::UserIdentity;
    use crate::models::EncryptedField;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        exposed: Mutex<Vec<(String, String, String)>>,
        revoked: Mutex<Vec<String>>,
        fail_expose: bool,
        fail_revoke: bool,
        revoke_delay: Duration,
    }

    impl RecordingTarget {
        fn exposed(&self) -> Vec<(String, String, String)> {
            self.exposed.lock().unwrap().clone()
        }

        fn revoked(&self) -> Vec<String> {
            self.revoked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExposureTarget for RecordingTarget {
        async fn expose(&self, address: &str, username: &str, password: &str) -> ExposureResult<()> {
            if self.fail_expose {
                return Err(ExposureError::Process("mstsc not found".to_string()));
            }
            self.exposed.lock().unwrap().push((
                address.to_string(),
                username.to_string(),
                password.to_string(),
            ));
            Ok(())
        }

        async fn revoke(&self, address: &str) -> ExposureResult<()> {
            tokio::time::sleep(self.revoke_delay).await;
            self.revoked.lock().unwrap().push(address.to_string());
            if self.fail_revoke {
                return Err(ExposureError::Process("cmdkey exited with 1".to_string()));
            }
            Ok(())
        }
    }

    fn cipher() -> SecretCipher {
        SecretCipher::new(&UserIdentity::new("alice", [9u8; 32]))
    }

    fn server(cipher: &SecretCipher) -> ServerRecord {
        ServerRecord::create(cipher, "web", "10.0.0.5", "admin", "p@ss").unwrap()
    }

    async fn open(
        target: &Arc<RecordingTarget>,
        audit: &Arc<MemoryAudit>,
        timeout: Duration,
    ) -> ExposureResult<ExposureSession> {
        let cipher = cipher();
        ExposureSession::open(
            &server(&cipher),
            &cipher,
            target.clone(),
            audit.clone(),
            timeout,
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_expose_then_revoke_after_timeout() {
        let target = Arc::new(RecordingTarget::default());
        let audit = Arc::new(MemoryAudit::default());
        let opened_at = tokio::time::Instant::now();

        let mut session = open(&target, &audit, Duration::from_secs(5)).await.unwrap();

        assert_eq!(
            target.exposed(),
            vec![("10.0.0.5".to_string(), "admin".to_string(), "p@ss".to_string())]
        );
        assert!(target.revoked().is_empty());
        assert!(session.is_live());

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(target.revoked().is_empty());
        assert!(!session.is_scrubbed());

        session.wait().await;
        assert!(opened_at.elapsed() >= Duration::from_secs(5));
        assert_eq!(target.revoked(), vec!["10.0.0.5".to_string()]);
        assert!(session.is_scrubbed());

        // Still exactly once, well past the timeout
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(target.revoked().len(), 1);
        assert_eq!(target.exposed().len(), 1);

        assert_eq!(
            audit.events(),
            vec![
                AuditEvent::Connected {
                    name: "web".to_string(),
                    address: "10.0.0.5".to_string()
                },
                AuditEvent::CredentialsRevoked {
                    name: "web".to_string(),
                    address: "10.0.0.5".to_string()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_fires_after_handle_dropped() {
        let target = Arc::new(RecordingTarget::default());
        let audit = Arc::new(MemoryAudit::default());

        let session = open(&target, &audit, Duration::from_secs(5)).await.unwrap();
        drop(session);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(target.revoked(), vec!["10.0.0.5".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expose_failure_creates_no_session() {
        let target = Arc::new(RecordingTarget {
            fail_expose: true,
            ..RecordingTarget::default()
        });
        let audit = Arc::new(MemoryAudit::default());

        let result = open(&target, &audit, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ExposureError::Process(_))));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(target.revoked().is_empty());
        assert!(audit.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revoke_failure_is_audited_not_retried() {
        let target = Arc::new(RecordingTarget {
            fail_revoke: true,
            ..RecordingTarget::default()
        });
        let audit = Arc::new(MemoryAudit::default());

        let mut session = open(&target, &audit, Duration::from_secs(5)).await.unwrap();
        session.wait().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(target.revoked().len(), 1);
        assert!(session.is_scrubbed());
        assert!(matches!(
            audit.events().last(),
            Some(AuditEvent::RevokeFailed { address, .. }) if address == "10.0.0.5"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecryptable_record_is_not_exposed() {
        let target = Arc::new(RecordingTarget::default());
        let audit = Arc::new(MemoryAudit::default());
        let cipher = cipher();

        let mut broken = server(&cipher);
        broken.password = EncryptedField::from_encoded("corrupted");

        let result =
            ExposureSession::open(&broken, &cipher, target.clone(), audit.clone(), Duration::from_secs(5))
                .await;
        assert!(matches!(result, Err(ExposureError::Undecryptable(name)) if name == "web"));
        assert!(target.exposed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_revoke() {
        let target = Arc::new(RecordingTarget::default());
        let audit = Arc::new(MemoryAudit::default());

        let mut session = open(&target, &audit, Duration::from_secs(5)).await.unwrap();
        assert!(session.cancel());
        assert!(!session.cancel());

        session.wait().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(target.revoked().is_empty());
        assert!(!session.is_live());
        assert!(!session.is_scrubbed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scrub_now_runs_once() {
        let target = Arc::new(RecordingTarget::default());
        let audit = Arc::new(MemoryAudit::default());

        let mut session = open(&target, &audit, Duration::from_secs(60)).await.unwrap();
        assert!(session.scrub_now().await);
        assert!(!session.scrub_now().await);
        assert!(!session.cancel());

        session.wait().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(target.revoked(), vec!["10.0.0.5".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scrub_now_waits_for_revoke_in_flight() {
        let target = Arc::new(RecordingTarget {
            revoke_delay: Duration::from_secs(2),
            ..RecordingTarget::default()
        });
        let audit = Arc::new(MemoryAudit::default());

        let mut session = open(&target, &audit, Duration::from_secs(5)).await.unwrap();

        // Timer fired at 5s and is still inside revoke until 7s
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(target.revoked().is_empty());
        assert!(session.is_live());
        assert!(!session.is_scrubbed());

        assert!(!session.scrub_now().await);
        assert_eq!(target.revoked(), vec!["10.0.0.5".to_string()]);
        assert!(session.is_scrubbed());
        assert!(!session.is_live());
        assert!(matches!(
            audit.events().last(),
            Some(AuditEvent::CredentialsRevoked { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_windows_revoke_independently() {
        let target = Arc::new(RecordingTarget::default());
        let audit = Arc::new(MemoryAudit::default());

        let mut first = open(&target, &audit, Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut second = open(&target, &audit, Duration::from_secs(5)).await.unwrap();

        first.wait().await;
        assert_eq!(target.revoked().len(), 1);
        assert!(second.is_live());

        second.wait().await;
        assert_eq!(target.revoked().len(), 2);
        assert_eq!(target.exposed().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_accessors() {
        let target = Arc::new(RecordingTarget::default());
        let audit = Arc::new(MemoryAudit::default());
        let session = open(&target, &audit, Duration::from_secs(5)).await.unwrap();

        assert_eq!(
            session.expires_at() - session.started_at(),
            chrono::Duration::seconds(5)
        );
        assert_eq!(session.timeout(), Duration::from_secs(5));
        assert_eq!(session.address(), "10.0.0.5");
        assert_eq!(session.name(), "web");
    }

    // SystemExposure wiring

    #[derive(Default)]
    struct FakeCache {
        entries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CredentialCache for Arc<FakeCache> {
        async fn add(&self, address: &str, _username: &str, _password: &str) -> ExposureResult<()> {
            self.entries.lock().unwrap().push(address.to_string());
            Ok(())
        }

        async fn delete(&self, address: &str) -> ExposureResult<()> {
            self.entries.lock().unwrap().retain(|a| a != address);
            Ok(())
        }
    }

    struct FakeLauncher {
        fail: bool,
    }

    #[async_trait]
    impl RemoteLauncher for FakeLauncher {
        async fn launch(&self, _address: &str) -> ExposureResult<()> {
            if self.fail {
                Err(ExposureError::Process("launch failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_system_exposure_caches_then_revokes() {
        let cache = Arc::new(FakeCache::default());
        let exposure = SystemExposure::new(cache.clone(), FakeLauncher { fail: false });

        exposure.expose("10.0.0.5", "admin", "p@ss").await.unwrap();
        assert_eq!(*cache.entries.lock().unwrap(), vec!["10.0.0.5".to_string()]);

        exposure.revoke("10.0.0.5").await.unwrap();
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_system_exposure_rolls_back_on_launch_failure() {
        let cache = Arc::new(FakeCache::default());
        let exposure = SystemExposure::new(cache.clone(), FakeLauncher { fail: true });

        assert!(exposure.expose("10.0.0.5", "admin", "p@ss").await.is_err());
        assert!(cache.entries.lock().unwrap().is_empty());
    }
}
