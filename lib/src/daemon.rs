//! The daemon root object and its main loop.
//!
//! One owned value: the daemon exclusively owns the sysroot view, the
//! client registry and the transaction coordinator; background tasks get a
//! handle at spawn time. The loop exits on SIGTERM or after the configured
//! idle timeout (plus a small jitter that avoids phase-locking with
//! periodic external pollers).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use rand::Rng;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::auth::{DenyAllPolicy, PolicyEngine};
use crate::client::ClientRegistry;
use crate::config::{DaemonConfig, UpdatePolicy};
use crate::coordinator::TransactionCoordinator;
use crate::store::{LocalBackend, StoreBackend, Sysroot};
use crate::sysroot::SysrootView;
use crate::transaction::TxnEnv;

/// Environment variable disabling idle exit, for debugging.
pub const DISABLE_IDLE_EXIT_ENV: &str = "RPMOSTREE_DEBUG_DISABLE_DAEMON_IDLE_EXIT";

/// Internal lifecycle events, serialized through the main loop.
#[derive(Debug)]
pub(crate) enum Event {
    /// The store monitor saw filesystem activity.
    StoreChanged,
    /// A transaction's body returned.
    TxnExecuted {
        /// Endpoint address identifying the transaction.
        address: Utf8PathBuf,
    },
    /// A transaction tore down its endpoint.
    TxnClosed {
        /// Endpoint address identifying the transaction.
        address: Utf8PathBuf,
    },
    /// A client or transaction asked for a system reboot.
    RebootRequested,
    /// The client registry changed; recompute idleness.
    ClientsChanged,
}

/// Paths the daemon operates on.
#[derive(Debug, Clone)]
pub struct DaemonOpts {
    /// The sysroot to serve.
    pub sysroot: Utf8PathBuf,
    /// Location of the ini configuration.
    pub config_path: Utf8PathBuf,
    /// Where to listen for clients.
    pub socket_path: Utf8PathBuf,
    /// Where per-transaction endpoint sockets are created.
    pub run_dir: Utf8PathBuf,
}

impl Default for DaemonOpts {
    fn default() -> Self {
        Self {
            sysroot: "/".into(),
            config_path: crate::config::CONFIG_PATH.into(),
            socket_path: crate::ipc::SOCKET_PATH.into(),
            run_dir: crate::ipc::RUN_DIR.into(),
        }
    }
}

struct IdleTasks {
    exit_task: Option<tokio::task::JoinHandle<()>>,
    ticker: Option<tokio::task::JoinHandle<()>>,
}

/// The singleton daemon.
pub struct Daemon {
    opts: DaemonOpts,
    config: Mutex<DaemonConfig>,
    policy_prop: watch::Sender<UpdatePolicy>,
    /// The live sysroot view.
    pub sysroot: SysrootView,
    /// Registered callers.
    pub clients: ClientRegistry,
    /// The single-writer gate.
    pub coordinator: Arc<TransactionCoordinator>,
    backend: Arc<dyn StoreBackend>,
    policy_engine: Arc<dyn PolicyEngine>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    rebooting: AtomicBool,
    shutdown: CancellationToken,
    idle: Mutex<IdleTasks>,
    conn_counter: AtomicU64,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("sysroot", &self.opts.sysroot)
            .field("rebooting", &self.rebooting)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Construct the daemon with the default (deny-all) policy engine;
    /// uid 0 callers bypass it.
    pub fn new(opts: DaemonOpts) -> Result<Arc<Self>> {
        Self::new_with_policy(opts, Arc::new(DenyAllPolicy))
    }

    /// Construct the daemon with an explicit policy engine.
    #[context("Initializing daemon")]
    pub fn new_with_policy(opts: DaemonOpts, policy_engine: Arc<dyn PolicyEngine>) -> Result<Arc<Self>> {
        let config = DaemonConfig::load(&opts.config_path)?;
        let sysroot = Sysroot::new(opts.sysroot.clone());
        let view = SysrootView::new(sysroot.clone())?;
        let backend: Arc<dyn StoreBackend> = Arc::new(LocalBackend::new(sysroot));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (policy_prop, _) = watch::channel(config.automatic_update_policy);
        Ok(Arc::new(Self {
            opts,
            config: Mutex::new(config),
            policy_prop,
            sysroot: view,
            clients: ClientRegistry::default(),
            coordinator: Arc::new(TransactionCoordinator::default()),
            backend,
            policy_engine,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            rebooting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            idle: Mutex::new(IdleTasks {
                exit_task: None,
                ticker: None,
            }),
            conn_counter: AtomicU64::new(0),
        }))
    }

    /// The lower-level store machinery.
    pub(crate) fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    /// The configured policy engine.
    pub(crate) fn policy_engine(&self) -> &dyn PolicyEngine {
        self.policy_engine.as_ref()
    }

    /// The event-loop sender, for tasks that need to talk back.
    pub(crate) fn events(&self) -> &mpsc::UnboundedSender<Event> {
        &self.events_tx
    }

    /// The currently configured automatic update policy.
    pub fn automatic_update_policy(&self) -> UpdatePolicy {
        *self.policy_prop.borrow()
    }

    /// Whether a reboot has been initiated; refuses new transactions.
    pub fn is_rebooting(&self) -> bool {
        self.rebooting.load(Ordering::SeqCst)
    }

    pub(crate) fn set_rebooting(&self) {
        self.rebooting.store(true, Ordering::SeqCst);
    }

    /// Ask the main loop to exit cleanly.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Next synthetic bus address for an accepted connection.
    pub(crate) fn next_address(&self) -> String {
        let n = self.conn_counter.fetch_add(1, Ordering::SeqCst);
        format!(":1.{n}")
    }

    /// Bundle of everything a new transaction borrows from us.
    pub(crate) fn txn_env(&self) -> TxnEnv {
        TxnEnv {
            sysroot: self.sysroot.sysroot().clone(),
            backend: self.backend.clone(),
            run_dir: self.opts.run_dir.clone(),
            props: self.coordinator.props.clone(),
            events: self.events_tx.clone(),
        }
    }

    /// Re-read the configuration and re-scan the sysroot. Idempotent and
    /// safe at any time.
    #[context("Reloading configuration")]
    pub fn reload_config(&self) -> Result<bool> {
        let fresh = DaemonConfig::load(&self.opts.config_path)?;
        let mut changed = false;
        {
            let mut config = self.config.lock().unwrap();
            if *config != fresh {
                tracing::info!("Configuration changed: {fresh:?}");
                self.policy_prop.send_replace(fresh.automatic_update_policy);
                *config = fresh;
                changed = true;
            }
        }
        let sysroot_changed = self.sysroot.reload_if_changed()?;
        Ok(changed || sysroot_changed)
    }

    /// Serve clients until SIGTERM or idle exit.
    #[context("Running daemon")]
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let mut events_rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("Daemon main loop started twice"))?;

        if let Some(parent) = self.opts.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Creating {parent}"))?;
        }
        match std::fs::remove_file(self.opts.socket_path.as_std_path()) {
            Ok(()) => tracing::debug!("Removed stale socket {}", self.opts.socket_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Removing stale {}", self.opts.socket_path))
            }
        }
        let listener = UnixListener::bind(self.opts.socket_path.as_std_path())
            .with_context(|| format!("Binding {}", self.opts.socket_path))?;
        tracing::info!("Listening on {}", self.opts.socket_path);

        // Bridge filesystem notifications into the event loop; the watcher
        // handle must stay alive for the daemon's lifetime
        let (monitor_tx, mut monitor_rx) = mpsc::unbounded_channel();
        let _watcher = crate::sysroot::spawn_store_monitor(self.sysroot.sysroot(), monitor_tx)?;
        let bridge_events = self.events_tx.clone();
        tokio::spawn(async move {
            while monitor_rx.recv().await.is_some() {
                if bridge_events.send(Event::StoreChanged).is_err() {
                    break;
                }
            }
        });

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Installing SIGTERM handler")?;

        sd_notify_ready();
        self.update_status();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, exiting");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let daemon = self.clone();
                            let address = self.next_address();
                            tokio::spawn(async move {
                                crate::service::serve_connection(daemon, stream, address).await;
                            });
                        }
                        Err(e) => tracing::warn!("Accept failed: {e}"),
                    }
                }
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
            }
        }

        if let Err(e) = std::fs::remove_file(self.opts.socket_path.as_std_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Removing {}: {e}", self.opts.socket_path);
            }
        }
        sd_notify_status("Shutting down");
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, event: Event) {
        tracing::trace!(?event, "main loop event");
        match event {
            Event::StoreChanged => match self.sysroot.reload_if_changed() {
                Ok(true) => self.update_status(),
                Ok(false) => {}
                Err(e) => tracing::warn!("Reloading sysroot: {e:#}"),
            },
            Event::TxnExecuted { address } => {
                self.coordinator.arm_force_close(&address);
                self.update_status();
            }
            Event::TxnClosed { address } => {
                self.coordinator.finish(&address);
                self.update_status();
            }
            Event::ClientsChanged => self.update_status(),
            Event::RebootRequested => {
                // The requesting client already has its reply; now it is
                // safe to hand control to the init system
                self.set_rebooting();
                self.update_status();
                if let Err(e) = crate::reboot::reboot().await {
                    tracing::error!("Reboot failed: {e:#}");
                }
            }
        }
    }

    /// Recompute idleness, (re)arming or cancelling the exit callback, and
    /// refresh the exported status string.
    pub(crate) fn update_status(self: &Arc<Self>) {
        let n_clients = self.clients.len();
        let active = self.coordinator.active();
        let timeout = self.config.lock().unwrap().idle_exit_timeout;
        let exit_disabled = std::env::var_os(DISABLE_IDLE_EXIT_ENV).is_some();
        let currently_idle =
            active.is_none() && n_clients == 0 && timeout > 0 && !exit_disabled;

        let mut idle = self.idle.lock().unwrap();
        if currently_idle && idle.exit_task.is_none() {
            let delay = idle_exit_delay(timeout);
            tracing::info!(
                "In idle state; will auto-exit in {} seconds",
                delay.as_secs()
            );
            sd_notify_status(&format!(
                "clients=0; idle; auto-exit in {} seconds",
                delay.as_secs()
            ));
            let daemon = self.clone();
            idle.exit_task = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                tracing::info!("Exiting due to idle");
                sd_notify_status("Exiting due to idle");
                daemon.shutdown.cancel();
            }));
            // Secondary 1 Hz re-render keeps the exported string current
            let n = n_clients;
            idle.ticker = Some(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tick.tick().await;
                    sd_notify_status(&format!("clients={n}; idle"));
                }
            }));
        } else if !currently_idle {
            if let Some(t) = idle.exit_task.take() {
                t.abort();
            }
            if let Some(t) = idle.ticker.take() {
                t.abort();
            }
            let status = match &active {
                Some(txn) => format!("clients={n_clients}; txn={}", txn.title()),
                None => format!("clients={n_clients}; idle"),
            };
            sd_notify_status(&status);
        }
    }
}

/// The idle-exit delay: the configured timeout plus up to five seconds of
/// jitter.
fn idle_exit_delay(timeout_secs: u64) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..5u64);
    Duration::from_secs(timeout_secs + jitter)
}

fn sd_notify_ready() {
    use libsystemd::daemon::NotifyState;
    if !libsystemd::daemon::booted() {
        return;
    }
    if let Err(e) = libsystemd::daemon::notify(false, &[NotifyState::Ready]) {
        tracing::warn!("sd_notify: {e}");
    }
}

fn sd_notify_status(status: &str) {
    use libsystemd::daemon::NotifyState;
    if !libsystemd::daemon::booted() {
        return;
    }
    if let Err(e) =
        libsystemd::daemon::notify(false, &[NotifyState::Status(status.to_owned())])
    {
        tracing::warn!("sd_notify: {e}");
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::store::fixtures::*;
    use camino::Utf8Path;

    pub(crate) struct DaemonFixture {
        pub(crate) fx: SysrootFixture,
        pub(crate) daemon: Arc<Daemon>,
        pub(crate) opts: DaemonOpts,
        _scratch: tempfile::TempDir,
    }

    impl DaemonFixture {
        pub(crate) fn socket_path(&self) -> camino::Utf8PathBuf {
            self.opts.socket_path.clone()
        }
    }

    pub(crate) fn daemon_fixture(config_text: Option<&str>) -> DaemonFixture {
        let fx = sysroot_fixture();
        let scratch = tempfile::tempdir().unwrap();
        let scratch_path = Utf8Path::from_path(scratch.path()).unwrap();
        let config_path = scratch_path.join("rpm-ostreed.conf");
        if let Some(text) = config_text {
            std::fs::write(&config_path, text).unwrap();
        }
        let opts = DaemonOpts {
            sysroot: fx.sysroot().path().to_owned(),
            config_path,
            socket_path: scratch_path.join("daemon.sock"),
            run_dir: scratch_path.join("run"),
        };
        let daemon =
            Daemon::new_with_policy(opts.clone(), Arc::new(crate::auth::AllowAllPolicy)).unwrap();
        DaemonFixture {
            fx,
            daemon,
            opts,
            _scratch: scratch,
        }
    }
}

#[cfg(test)]
mod test {
    use super::testutil::*;
    use super::*;

    #[test]
    fn test_idle_exit_delay_range() {
        for _ in 0..64 {
            let d = idle_exit_delay(60);
            assert!(d >= Duration::from_secs(60));
            assert!(d < Duration::from_secs(65));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_exit_with_jitter() {
        let f = daemon_fixture(Some("[Daemon]\nIdleExitTimeout=1\n"));
        let started = tokio::time::Instant::now();
        let daemon = f.daemon.clone();
        let run = tokio::spawn(async move { daemon.run().await });
        run.await.unwrap().unwrap();
        let elapsed = started.elapsed();
        // No earlier than the timeout, no later than timeout + jitter bound
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(7), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_idle_exit_disabled_by_zero_timeout() {
        let f = daemon_fixture(Some("[Daemon]\nIdleExitTimeout=0\n"));
        f.daemon.update_status();
        assert!(f.daemon.idle.lock().unwrap().exit_task.is_none());
    }

    #[tokio::test]
    async fn test_reload_config_idempotent() {
        let f = daemon_fixture(None);
        assert_eq!(
            f.daemon.automatic_update_policy(),
            crate::config::UpdatePolicy::None
        );
        // First reload with a new file changes things, the second is a no-op
        std::fs::write(
            &f.daemon.opts.config_path,
            "[Daemon]\nAutomaticUpdatePolicy=stage\n",
        )
        .unwrap();
        assert!(f.daemon.reload_config().unwrap());
        assert_eq!(
            f.daemon.automatic_update_policy(),
            crate::config::UpdatePolicy::Stage
        );
        assert!(!f.daemon.reload_config().unwrap());
    }
}
