//! The daemon's live view of the sysroot.
//!
//! Reloads are change-driven: a filesystem notification only triggers a
//! re-read when the repository mtime or the deployment list document
//! actually advanced. A failed reload keeps the previous stat pin so the
//! next notification retries.

use anyhow::{Context, Result};
use fn_error_context::context;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::Mutex;
use tokio::sync::{broadcast, watch};

use crate::store::{LoadedState, StorePin, Sysroot};

/// Observable snapshot of the deployment fleet.
#[derive(Debug)]
pub struct SysrootView {
    sysroot: Sysroot,
    state: watch::Sender<LoadedState>,
    updated: broadcast::Sender<()>,
    pin: Mutex<Option<StorePin>>,
}

impl SysrootView {
    /// Open the sysroot and take the initial snapshot.
    #[context("Opening sysroot")]
    pub fn new(sysroot: Sysroot) -> Result<Self> {
        sysroot.ensure_valid()?;
        let pin = sysroot.pin()?;
        let state = sysroot.load()?;
        tracing::info!(
            "Loaded sysroot {} with {} deployments",
            sysroot.path(),
            state.deployments.len()
        );
        let (state, _) = watch::channel(state);
        let (updated, _) = broadcast::channel(16);
        Ok(Self {
            sysroot,
            state,
            updated,
            pin: Mutex::new(Some(pin)),
        })
    }

    /// The underlying store handle; handed to transactions that already
    /// hold the mutation lock.
    pub fn sysroot(&self) -> &Sysroot {
        &self.sysroot
    }

    /// Current snapshot of deployments and the booted id.
    pub fn state(&self) -> LoadedState {
        self.state.borrow().clone()
    }

    /// Watch the snapshot as a property.
    pub fn subscribe(&self) -> watch::Receiver<LoadedState> {
        self.state.subscribe()
    }

    /// Receive one message per observed on-disk change.
    pub fn subscribe_updated(&self) -> broadcast::Receiver<()> {
        self.updated.subscribe()
    }

    /// Re-read the deployment state if the store changed on disk; returns
    /// whether a reload happened. The exported state is updated before the
    /// `updated` notification goes out.
    #[context("Reloading sysroot")]
    pub fn reload_if_changed(&self) -> Result<bool> {
        let pin = self.sysroot.pin()?;
        if *self.pin.lock().unwrap() == Some(pin) {
            tracing::trace!("Store unchanged, suppressing reload");
            return Ok(false);
        }
        let state = self.sysroot.load()?;
        // Only pin after a successful load; a failure retries on the next
        // notification
        *self.pin.lock().unwrap() = Some(pin);
        tracing::debug!("Reloaded {} deployments", state.deployments.len());
        self.state.send_replace(state);
        let _ = self.updated.send(());
        Ok(true)
    }
}

/// Start watching the store directory; each relevant filesystem event sends
/// one unit message. The returned watcher must be kept alive.
pub(crate) fn spawn_store_monitor(
    sysroot: &Sysroot,
    tx: tokio::sync::mpsc::UnboundedSender<()>,
) -> Result<RecommendedWatcher> {
    let dir = sysroot.monitored_dir();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                use notify::EventKind;
                if matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) {
                    let _ = tx.send(());
                }
            }
            Err(e) => tracing::warn!("Store monitor error: {e}"),
        },
        notify::Config::default(),
    )
    .context("Creating store monitor")?;
    watcher
        .watch(dir.as_std_path(), RecursiveMode::Recursive)
        .with_context(|| format!("Watching {dir}"))?;
    tracing::debug!("Watching {dir} for changes");
    Ok(watcher)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::deployment::list_with_new_default;
    use crate::origin::Origin;
    use crate::store::fixtures::*;
    use crate::store::StoreBackend;

    #[test]
    fn test_initial_state() {
        let fx = sysroot_fixture();
        let view = SysrootView::new(fx.sysroot().clone()).unwrap();
        let state = view.state();
        assert_eq!(state.deployments.len(), 1);
        assert_eq!(state.deployments[0].checksum, BASE_CHECKSUM);
    }

    #[test]
    fn test_reload_suppressed_when_unchanged() {
        let fx = sysroot_fixture();
        let view = SysrootView::new(fx.sysroot().clone()).unwrap();
        assert!(!view.reload_if_changed().unwrap());
        assert!(!view.reload_if_changed().unwrap());
    }

    #[test]
    fn test_reload_after_write_updates_state_then_signals() {
        let fx = sysroot_fixture();
        let view = SysrootView::new(fx.sysroot().clone()).unwrap();
        let mut updated = view.subscribe_updated();

        let backend = fx.backend();
        let new = backend
            .stage(OSNAME, BASE_CHECKSUM, &Origin::new(BASE_REFSPEC))
            .unwrap();
        let current = view.state().deployments;
        backend
            .write_deployments(&list_with_new_default(&current, new, None, true))
            .unwrap();

        assert!(view.reload_if_changed().unwrap());
        // The property reflects the change before the signal is observable
        assert_eq!(view.state().deployments.len(), 2);
        updated.try_recv().unwrap();
        // Exactly one signal per change
        assert!(updated.try_recv().is_err());
        assert!(!view.reload_if_changed().unwrap());
    }

    #[tokio::test]
    async fn test_monitor_fires_on_write() {
        let fx = sysroot_fixture();
        let view = SysrootView::new(fx.sysroot().clone()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _watcher = spawn_store_monitor(view.sysroot(), tx).unwrap();

        let backend = fx.backend();
        let new = backend
            .stage(OSNAME, BASE_CHECKSUM, &Origin::new(BASE_REFSPEC))
            .unwrap();
        let current = view.state().deployments;
        backend
            .write_deployments(&list_with_new_default(&current, new, None, true))
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .expect("monitor notification")
            .expect("channel open");
    }
}
