//! The transaction entity.
//!
//! One transaction is one logical mutation of the store. It holds the
//! exclusive sysroot lock from construction until its body returns, streams
//! progress over a private endpoint socket, survives the disconnection of
//! its initiator, and lingers after execution so late joiners can still
//! retrieve the outcome.
//!
//! State machine:
//!
//! ```text
//! new --construct--> waiting-start --(caller vanishes)--> closed
//!                         |
//!                         +--Start--> running --body returns--> executed
//! executed --(force-close timer OR last observer leaves)--> closed
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::coordinator::TxnProps;
use crate::daemon::Event;
use crate::errors::DaemonError;
use crate::journal;
use crate::progress::{DownloadProgress, ProgressSink, TxnRequest, TxnSignal, REFRESH_HZ};
use crate::store::{StoreBackend, Sysroot, SysrootLock};
use crate::transactions::TxnKind;

/// Everything a transaction needs from its daemon.
pub(crate) struct TxnEnv {
    /// Store handle (the transaction holds the lock over it).
    pub(crate) sysroot: Sysroot,
    /// Lower-level machinery driven by the body.
    pub(crate) backend: Arc<dyn StoreBackend>,
    /// Directory for the private endpoint socket.
    pub(crate) run_dir: Utf8PathBuf,
    /// Shared transaction properties, cleared at the executed transition.
    pub(crate) props: Arc<TxnProps>,
    /// The daemon's event loop.
    pub(crate) events: mpsc::UnboundedSender<Event>,
}

struct Observer {
    id: u64,
    tx: mpsc::UnboundedSender<TxnSignal>,
    got_finished: bool,
}

pub(crate) struct TxnInner {
    kind: TxnKind,
    sender: String,
    address: Utf8PathBuf,
    sysroot: Sysroot,
    backend: Arc<dyn StoreBackend>,
    props: Arc<TxnProps>,
    events: mpsc::UnboundedSender<Event>,
    token: CancellationToken,
    lock: Mutex<Option<SysrootLock>>,
    started: AtomicBool,
    executed: AtomicBool,
    closed: AtomicBool,
    /// Cancelled by `Start`; stops the initiator-vanish watch.
    started_token: CancellationToken,
    /// Cancelled at close; stops the accept loop and observer tasks.
    shutdown: CancellationToken,
    finished: watch::Sender<Option<(bool, String)>>,
    observers: Mutex<Vec<Observer>>,
    next_observer: std::sync::atomic::AtomicU64,
    last_lossy_emit: Mutex<Option<Instant>>,
}

/// A uniquely addressable, cancellable unit of work holding the system-wide
/// mutation lock.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxnInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("method", &self.method())
            .field("address", &self.address())
            .field("executed", &self.executed())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Construct a transaction: acquire the sysroot lock, bind the private
    /// endpoint, and start watching the initiator for an early vanish.
    pub(crate) async fn new(
        env: TxnEnv,
        sender: &str,
        caller_vanished: CancellationToken,
        kind: TxnKind,
    ) -> Result<Transaction> {
        let lock = SysrootLock::acquire(&env.sysroot)?;
        std::fs::create_dir_all(&env.run_dir)
            .with_context(|| format!("Creating {}", env.run_dir))?;
        let address = env
            .run_dir
            .join(format!("txn-{}.sock", uuid::Uuid::new_v4().simple()));
        let listener = UnixListener::bind(address.as_std_path())
            .with_context(|| format!("Binding {address}"))?;

        let (finished, _) = watch::channel(None);
        let inner = Arc::new(TxnInner {
            kind,
            sender: sender.to_owned(),
            address,
            sysroot: env.sysroot,
            backend: env.backend,
            props: env.props,
            events: env.events,
            token: CancellationToken::new(),
            lock: Mutex::new(Some(lock)),
            started: AtomicBool::new(false),
            executed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            started_token: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            finished,
            observers: Mutex::new(Vec::new()),
            next_observer: std::sync::atomic::AtomicU64::new(0),
            last_lossy_emit: Mutex::new(None),
        });

        tokio::spawn(accept_loop(inner.clone(), listener));
        tokio::spawn(watch_initiator(inner.clone(), caller_vanished));

        Ok(Transaction { inner })
    }

    /// The private endpoint address callers connect to.
    pub fn address(&self) -> &Utf8Path {
        &self.inner.address
    }

    /// The method name that created this transaction.
    pub fn method(&self) -> &'static str {
        self.inner.kind.method()
    }

    /// The initiating caller's bus address.
    pub fn sender(&self) -> &str {
        &self.inner.sender
    }

    /// Human-readable description, used in `Busy` messages and status.
    pub fn title(&self) -> String {
        self.inner.kind.title()
    }

    /// Whether `kind` denotes the same operation with value-equal
    /// parameters.
    pub fn is_compatible(&self, kind: &TxnKind) -> bool {
        self.inner.kind.method() == kind.method() && self.inner.kind.params() == kind.params()
    }

    /// Whether the body has returned.
    pub fn executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    /// Signal cancellation; the body observes it at its next suspension
    /// point. Before `Start`, this closes the transaction without running
    /// the body at all.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Tear the transaction down regardless of connected observers.
    pub fn force_close(&self) {
        self.inner.close();
    }

    /// Wait for the terminal outcome.
    pub async fn finish(&self) -> (bool, String) {
        let mut rx = self.inner.finished.subscribe();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender kept alive by inner; unreachable in practice
                return (false, "Transaction torn down".into());
            }
        }
    }

}

impl TxnInner {
    fn cancel(&self) {
        self.token.cancel();
        if !self.started.load(Ordering::SeqCst) && !self.executed.load(Ordering::SeqCst) {
            tracing::info!("Transaction cancelled before Start");
            self.complete(Err(DaemonError::Cancelled.into()));
            self.close();
        }
    }

    /// Claim the right to dispatch the body; the returned flag is the
    /// `Start` reply. The caller queues its reply first and only then
    /// invokes [`TxnInner::spawn_body`], so no observer can see body output
    /// ahead of `Started`.
    fn claim_start(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.executed.load(Ordering::SeqCst) {
            return false;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        // The initiator did its job; stop watching its connection
        self.started_token.cancel();
        true
    }

    /// Run the body on a dedicated worker thread with its own event loop so
    /// blocking store callbacks never re-enter the daemon's loop.
    fn spawn_body(self: &Arc<Self>) {
        let inner = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("txn-{}", self.kind.method().to_lowercase()))
            .spawn(move || {
                let ctx = TxnContext {
                    sysroot: inner.sysroot.clone(),
                    backend: inner.backend.clone(),
                    sink: inner.clone(),
                    token: inner.token.clone(),
                    events: Some(inner.events.clone()),
                };
                let result = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => std::panic::catch_unwind(AssertUnwindSafe(|| {
                        rt.block_on(inner.kind.execute(&ctx))
                    }))
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("Transaction body panicked"))),
                    Err(e) => Err(anyhow::Error::from(e).context("Creating worker runtime")),
                };
                inner.complete(result);
            });
        if let Err(e) = spawned {
            self.complete(Err(anyhow::Error::from(e).context("Spawning worker thread")));
        }
    }

    /// The executed transition: release the lock, cache the outcome, flip
    /// the exported properties, then emit `Finished`.
    fn complete(&self, result: Result<()>) {
        if self.executed.swap(true, Ordering::SeqCst) {
            // First error wins; log whatever came later
            if let Err(e) = result {
                tracing::warn!("Dropping secondary transaction error: {e:#}");
            }
            return;
        }
        // The lock covers the mutation only; queries may proceed while the
        // transaction lingers for result replay
        drop(self.lock.lock().unwrap().take());

        let (success, message) = match result {
            Ok(()) => (true, String::new()),
            Err(e) => {
                let kind = DaemonError::from_chain(&e);
                tracing::warn!("Transaction {} failed: {e:#}", self.kind.method());
                (false, kind.to_string())
            }
        };
        journal::transaction_done(self.kind.method(), self.address.as_str(), success, &message);

        // Observers must never see Finished with stale properties
        self.props.clear_triple();
        self.emit_finished(success, &message);
        let _ = self.events.send(Event::TxnExecuted {
            address: self.address.clone(),
        });
    }

    fn emit_finished(&self, success: bool, message: &str) {
        let mut observers = self.observers.lock().unwrap();
        // Caching the params and notifying connected observers is one
        // logical step under the observers lock: anyone registering later
        // sees the cache and replays instead
        self.finished
            .send_replace(Some((success, message.to_owned())));
        for o in observers.iter_mut() {
            if !o.got_finished {
                let _ = o.tx.send(TxnSignal::Finished {
                    success,
                    message: message.to_owned(),
                });
                o.got_finished = true;
            }
        }
    }

    /// Send the cached `Finished` to one observer if it has not seen it.
    fn replay_finished_to(&self, observer_id: u64) {
        let cached = self.finished.borrow().clone();
        let Some((success, message)) = cached else {
            return;
        };
        let mut observers = self.observers.lock().unwrap();
        if let Some(o) = observers
            .iter_mut()
            .find(|o| o.id == observer_id && !o.got_finished)
        {
            let _ = o.tx.send(TxnSignal::Finished { success, message });
            o.got_finished = true;
        }
    }

    fn register_observer(&self, tx: mpsc::UnboundedSender<TxnSignal>) -> u64 {
        let id = self
            .next_observer
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.observers.lock().unwrap().push(Observer {
            id,
            tx,
            got_finished: false,
        });
        id
    }

    fn remove_observer(&self, observer_id: u64) {
        let empty = {
            let mut observers = self.observers.lock().unwrap();
            observers.retain(|o| o.id != observer_id);
            observers.is_empty()
        };
        // A lingering executed transaction ends when its audience leaves
        if empty && self.executed.load(Ordering::SeqCst) {
            self.close();
        }
    }

    fn broadcast(&self, signal: TxnSignal, lossy: bool) {
        if lossy {
            const MIN_INTERVAL_MS: u128 = 1000 / REFRESH_HZ as u128;
            let mut last = self.last_lossy_emit.lock().unwrap();
            let now = Instant::now();
            if let Some(prev) = *last {
                if now.duration_since(prev).as_millis() < MIN_INTERVAL_MS {
                    return;
                }
            }
            *last = Some(now);
        }
        let observers = self.observers.lock().unwrap();
        if observers.is_empty() {
            // Nobody connected: fall through to the daemon's default output
            crate::progress::forward_to(&crate::progress::LogSink, &signal);
            return;
        }
        for o in observers.iter() {
            let _ = o.tx.send(signal.clone());
        }
    }

    /// Stop the endpoint and drop all observer connections. Idempotent.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.observers.lock().unwrap().clear();
        // The lock is normally released at the executed transition; a
        // vanish before Start arrives here still holding it
        drop(self.lock.lock().unwrap().take());
        if let Err(e) = std::fs::remove_file(self.address.as_std_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Removing endpoint socket {}: {e}", self.address);
            }
        }
        tracing::debug!("Transaction {} closed", self.kind.method());
        let _ = self.events.send(Event::TxnClosed {
            address: self.address.clone(),
        });
    }
}

/// Close the transaction if the initiator's connection dies before `Start`.
async fn watch_initiator(inner: Arc<TxnInner>, caller_vanished: CancellationToken) {
    tokio::select! {
        _ = caller_vanished.cancelled() => {
            if !inner.started.load(Ordering::SeqCst) {
                tracing::info!(
                    "Initiator of {} vanished before Start; aborting",
                    inner.kind.method()
                );
                inner.cancel();
            }
        }
        _ = inner.started_token.cancelled() => {}
        _ = inner.shutdown.cancelled() => {}
    }
}

async fn accept_loop(inner: Arc<TxnInner>, listener: UnixListener) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_observer(inner.clone(), stream));
                }
                Err(e) => {
                    tracing::warn!("Endpoint accept failed: {e}");
                    break;
                }
            }
        }
    }
}

async fn serve_observer(inner: Arc<TxnInner>, stream: tokio::net::UnixStream) {
    let (read_half, write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<TxnSignal>();
    let direct = tx.clone();
    let observer_id = inner.register_observer(tx);
    // Late joiner: an observer connecting after execution still gets the
    // outcome, exactly once
    inner.replay_finished_to(observer_id);

    let writer = tokio::spawn(async move {
        let mut w = BufWriter::new(write_half);
        while let Some(signal) = rx.recv().await {
            let mut line = match serde_json::to_vec(&signal) {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!("Serializing signal: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            if w.write_all(&line).await.is_err() {
                break;
            }
            if w.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            l = lines.next_line() => l,
        };
        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) | Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: TxnRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Malformed endpoint request: {e}");
                continue;
            }
        };
        match request {
            TxnRequest::Start => {
                let started = inner.claim_start();
                let _ = direct.send(TxnSignal::Started { started });
                if started {
                    inner.spawn_body();
                } else {
                    // Replay the cached outcome to the invoking connection
                    inner.replay_finished_to(observer_id);
                }
            }
            TxnRequest::Cancel => {
                tracing::info!("Cancel requested for {}", inner.kind.method());
                inner.cancel();
            }
            TxnRequest::Finish => {
                let mut finished = inner.finished.subscribe();
                let outcome = loop {
                    if let Some(o) = finished.borrow().clone() {
                        break Some(o);
                    }
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break None,
                        changed = finished.changed() => {
                            if changed.is_err() {
                                break None;
                            }
                        }
                    }
                };
                if let Some((success, message)) = outcome {
                    let _ = direct.send(TxnSignal::FinishReply { success, message });
                }
            }
        }
    }

    inner.remove_observer(observer_id);
    writer.abort();
}

/// What a running body sees: the store, the cancellation token, and the
/// progress fan-out.
pub struct TxnContext {
    /// Store handle; the transaction holds the mutation lock.
    pub sysroot: Sysroot,
    /// Lower-level machinery.
    pub backend: Arc<dyn StoreBackend>,
    sink: Arc<dyn ProgressSink>,
    token: CancellationToken,
    events: Option<mpsc::UnboundedSender<Event>>,
}

impl std::fmt::Debug for TxnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnContext")
            .field("sysroot", &self.sysroot)
            .finish_non_exhaustive()
    }
}

impl TxnContext {
    /// Error out if cancellation was requested. Bodies call this at least
    /// at every loop boundary and before each I/O operation.
    pub fn check_cancelled(&self) -> Result<(), DaemonError> {
        if self.token.is_cancelled() {
            Err(DaemonError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The body's cancellation token, for suspending operations.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Ask the daemon to reboot once the transaction has finished.
    pub fn request_reboot(&self) {
        if let Some(events) = &self.events {
            let _ = events.send(Event::RebootRequested);
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        sysroot: Sysroot,
        backend: Arc<dyn StoreBackend>,
        sink: Arc<dyn ProgressSink>,
        token: CancellationToken,
    ) -> Self {
        Self {
            sysroot,
            backend,
            sink,
            token,
            events: None,
        }
    }
}

impl ProgressSink for TxnContext {
    fn message(&self, text: &str) {
        self.sink.message(text);
    }
    fn task_begin(&self, text: &str) {
        self.sink.task_begin(text);
    }
    fn task_end(&self, text: &str) {
        self.sink.task_end(text);
    }
    fn percent_progress(&self, text: &str, percentage: u32) {
        self.sink.percent_progress(text, percentage);
    }
    fn download_progress(&self, progress: DownloadProgress) {
        self.sink.download_progress(progress);
    }
    fn signature_progress(&self, result: bool, commit: &str) {
        self.sink.signature_progress(result, commit);
    }
}

impl ProgressSink for TxnInner {
    fn message(&self, text: &str) {
        self.broadcast(
            TxnSignal::Message {
                text: text.to_owned(),
            },
            false,
        );
    }
    fn task_begin(&self, text: &str) {
        self.broadcast(
            TxnSignal::TaskBegin {
                text: text.to_owned(),
            },
            false,
        );
    }
    fn task_end(&self, text: &str) {
        self.broadcast(
            TxnSignal::TaskEnd {
                text: text.to_owned(),
            },
            false,
        );
    }
    fn percent_progress(&self, text: &str, percentage: u32) {
        self.broadcast(
            TxnSignal::PercentProgress {
                text: text.to_owned(),
                percentage,
            },
            false,
        );
    }
    fn download_progress(&self, progress: DownloadProgress) {
        self.broadcast(TxnSignal::DownloadProgress(progress), true);
    }
    fn signature_progress(&self, result: bool, commit: &str) {
        self.broadcast(
            TxnSignal::SignatureProgress {
                result,
                commit: commit.to_owned(),
            },
            false,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coordinator::TransactionCoordinator;
    use crate::ipc::CleanupOptions;
    use crate::store::fixtures::*;
    use crate::store::LocalBackend;
    use std::time::Duration;
    use tokio::net::UnixStream;

    struct TxnHarness {
        fx: SysrootFixture,
        run_dir: tempfile::TempDir,
        coordinator: Arc<TransactionCoordinator>,
        events_tx: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
        caller: CancellationToken,
    }

    impl TxnHarness {
        fn new() -> Self {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Self {
                fx: sysroot_fixture(),
                run_dir: tempfile::tempdir().unwrap(),
                coordinator: Arc::new(TransactionCoordinator::default()),
                events_tx,
                events_rx,
                caller: CancellationToken::new(),
            }
        }

        fn env(&self) -> TxnEnv {
            TxnEnv {
                sysroot: self.fx.sysroot().clone(),
                backend: Arc::new(LocalBackend::new(self.fx.sysroot().clone())),
                run_dir: Utf8Path::from_path(self.run_dir.path()).unwrap().to_owned(),
                props: self.coordinator.props.clone(),
                events: self.events_tx.clone(),
            }
        }

        fn cleanup_kind() -> TxnKind {
            TxnKind::Cleanup {
                osname: OSNAME.into(),
                options: CleanupOptions {
                    repo: true,
                    ..Default::default()
                },
            }
        }

        async fn new_txn(&self) -> Transaction {
            let txn = Transaction::new(
                self.env(),
                ":1.1",
                self.caller.clone(),
                Self::cleanup_kind(),
            )
            .await
            .unwrap();
            self.coordinator.set(&txn);
            txn
        }

        /// Wait for the next lifecycle event.
        async fn next_event(&mut self) -> Event {
            tokio::time::timeout(Duration::from_secs(10), self.events_rx.recv())
                .await
                .expect("event timeout")
                .expect("events channel open")
        }
    }

    struct Peer {
        lines: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
        write: tokio::net::unix::OwnedWriteHalf,
    }

    impl Peer {
        async fn connect(address: &Utf8Path) -> Self {
            let stream = UnixStream::connect(address.as_std_path()).await.unwrap();
            let (r, w) = stream.into_split();
            Self {
                lines: BufReader::new(r).lines(),
                write: w,
            }
        }

        async fn send(&mut self, request: &TxnRequest) {
            let mut line = serde_json::to_vec(request).unwrap();
            line.push(b'\n');
            self.write.write_all(&line).await.unwrap();
            self.write.flush().await.unwrap();
        }

        /// Next signal; None on connection close.
        async fn recv(&mut self) -> Option<TxnSignal> {
            let line = tokio::time::timeout(Duration::from_secs(10), self.lines.next_line())
                .await
                .expect("signal timeout")
                .expect("read");
            line.map(|l| serde_json::from_str(&l).expect("signal json"))
        }

        /// Collect signals until (and including) `Finished`.
        async fn recv_until_finished(&mut self) -> Vec<TxnSignal> {
            let mut signals = Vec::new();
            loop {
                let s = self.recv().await.expect("connection closed early");
                let done = matches!(s, TxnSignal::Finished { .. });
                signals.push(s);
                if done {
                    return signals;
                }
            }
        }
    }

    fn finished_payload(signals: &[TxnSignal]) -> (bool, String) {
        match signals.last() {
            Some(TxnSignal::Finished { success, message }) => (*success, message.clone()),
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_finished_broadcast_identical() {
        let mut h = TxnHarness::new();
        let txn = h.new_txn().await;
        assert_eq!(h.coordinator.active_transaction()[0], "Cleanup");

        let mut a = Peer::connect(txn.address()).await;
        let mut b = Peer::connect(txn.address()).await;
        a.send(&TxnRequest::Start).await;
        assert_eq!(a.recv().await, Some(TxnSignal::Started { started: true }));

        let a_signals = a.recv_until_finished().await;
        let b_signals = b.recv_until_finished().await;
        assert_eq!(finished_payload(&a_signals), (true, String::new()));
        assert_eq!(finished_payload(&a_signals), finished_payload(&b_signals));
        // The body's progress reached the initiating observer
        assert!(a_signals
            .iter()
            .any(|s| matches!(s, TxnSignal::Message { text } if text.contains("Pruning"))));

        // Properties flipped before Finished was observable
        assert_eq!(h.coordinator.active_transaction(), crate::coordinator::empty_triple());
        assert!(txn.executed());
        match h.next_event().await {
            Event::TxnExecuted { address } => assert_eq!(address, txn.address()),
            other => panic!("unexpected {other:?}"),
        }

        // When the audience disconnects, the lingering transaction closes
        drop(a);
        drop(b);
        match h.next_event().await {
            Event::TxnClosed { address } => assert_eq!(address, txn.address()),
            other => panic!("unexpected {other:?}"),
        }
        h.coordinator.finish(txn.address());
        assert!(h.coordinator.active().is_none());
        assert_eq!(h.coordinator.active_transaction_path(), "");
    }

    #[tokio::test]
    async fn test_start_replays_once() {
        let mut h = TxnHarness::new();
        let txn = h.new_txn().await;
        let mut a = Peer::connect(txn.address()).await;
        a.send(&TxnRequest::Start).await;
        assert_eq!(a.recv().await, Some(TxnSignal::Started { started: true }));
        let _ = a.recv_until_finished().await;
        let _ = h.next_event().await; // executed

        // A second Start does not re-dispatch and does not re-deliver
        // Finished to an observer that already saw it
        a.send(&TxnRequest::Start).await;
        assert_eq!(a.recv().await, Some(TxnSignal::Started { started: false }));
        a.send(&TxnRequest::Finish).await;
        match a.recv().await {
            Some(TxnSignal::FinishReply { success, message }) => {
                assert!(success);
                assert_eq!(message, "");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_late_joiner_gets_cached_outcome() {
        let mut h = TxnHarness::new();
        let txn = h.new_txn().await;
        let mut a = Peer::connect(txn.address()).await;
        a.send(&TxnRequest::Start).await;
        let _ = a.recv().await;
        let _ = a.recv_until_finished().await;
        let _ = h.next_event().await; // executed

        let mut late = Peer::connect(txn.address()).await;
        let signals = late.recv_until_finished().await;
        assert_eq!(finished_payload(&signals), (true, String::new()));
        // Exactly once: asking again via Start replays nothing further
        late.send(&TxnRequest::Start).await;
        assert_eq!(late.recv().await, Some(TxnSignal::Started { started: false }));
        late.send(&TxnRequest::Finish).await;
        assert!(matches!(
            late.recv().await,
            Some(TxnSignal::FinishReply { success: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_body() {
        let mut h = TxnHarness::new();
        let txn = h.new_txn().await;
        let mut a = Peer::connect(txn.address()).await;
        a.send(&TxnRequest::Cancel).await;

        let signals = a.recv_until_finished().await;
        let (success, message) = finished_payload(&signals);
        assert!(!success);
        assert!(message.contains("cancelled"), "{message}");
        // The body never ran: no progress signals preceded Finished
        assert_eq!(signals.len(), 1);

        match h.next_event().await {
            Event::TxnExecuted { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        match h.next_event().await {
            Event::TxnClosed { address } => assert_eq!(address, txn.address()),
            other => panic!("unexpected {other:?}"),
        }
        // The endpoint is gone
        assert!(UnixStream::connect(txn.address().as_std_path()).await.is_err());
    }

    #[tokio::test]
    async fn test_initiator_vanish_before_start() {
        let mut h = TxnHarness::new();
        let txn = h.new_txn().await;
        h.caller.cancel();
        loop {
            match h.next_event().await {
                Event::TxnClosed { address } => {
                    assert_eq!(address, txn.address());
                    break;
                }
                Event::TxnExecuted { .. } => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(txn.executed());
        let (success, _) = txn.finish().await;
        assert!(!success);
    }

    #[tokio::test]
    async fn test_vanish_after_start_is_ignored() {
        let mut h = TxnHarness::new();
        let txn = h.new_txn().await;
        let mut a = Peer::connect(txn.address()).await;
        a.send(&TxnRequest::Start).await;
        let _ = a.recv().await;
        h.caller.cancel();
        let signals = a.recv_until_finished().await;
        assert_eq!(finished_payload(&signals).0, true);
        let _ = h.next_event().await;
    }

    #[tokio::test]
    async fn test_concurrent_transaction_is_busy() {
        let h = TxnHarness::new();
        let _txn = h.new_txn().await;
        let err = Transaction::new(
            h.env(),
            ":1.2",
            CancellationToken::new(),
            TxnHarness::cleanup_kind(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            DaemonError::from_chain(&err),
            DaemonError::Busy(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_close_timer() {
        let mut h = TxnHarness::new();
        let txn = h.new_txn().await;
        let mut a = Peer::connect(txn.address()).await;
        a.send(&TxnRequest::Start).await;

        // Read without timeouts: paused time makes timeout futures
        // unreliable around real I/O
        let mut saw_finished = false;
        while !saw_finished {
            let line = a.lines.next_line().await.expect("read").expect("open");
            let signal: TxnSignal = serde_json::from_str(&line).unwrap();
            saw_finished = matches!(signal, TxnSignal::Finished { .. });
        }
        match h.events_rx.recv().await.expect("events open") {
            Event::TxnExecuted { address } => {
                h.coordinator.arm_force_close(&address);
            }
            other => panic!("unexpected {other:?}"),
        }

        // The leaked connection is eventually closed by the timer
        let eof = a.lines.next_line().await.expect("read");
        assert!(eof.is_none());
        match h.events_rx.recv().await.expect("events open") {
            Event::TxnClosed { address } => {
                h.coordinator.finish(&address);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.coordinator.active().is_none());
    }

    #[tokio::test]
    async fn test_compatibility_merge_surface() {
        let h = TxnHarness::new();
        let txn = h.new_txn().await;
        // Same method, same params: joinable
        assert!(h
            .coordinator
            .prep_for_txn(false, &TxnHarness::cleanup_kind())
            .unwrap()
            .is_some());
        // Different params: busy
        let other = TxnKind::Cleanup {
            osname: OSNAME.into(),
            options: CleanupOptions {
                pending: true,
                ..Default::default()
            },
        };
        assert!(matches!(
            h.coordinator.prep_for_txn(false, &other),
            Err(DaemonError::Busy(_))
        ));
        // Reboot pending: always busy
        assert!(matches!(
            h.coordinator.prep_for_txn(true, &TxnHarness::cleanup_kind()),
            Err(DaemonError::Busy(_))
        ));
        txn.force_close();
    }
}
