//! The private transaction endpoint wire protocol.
//!
//! Signals stream from the transaction to every connected observer using the
//! json-lines format; see <https://jsonlines.org/>. Requests flow the other
//! way on the same connection.

use serde::{Deserialize, Serialize};

/// Maximum number of times per second a lossy signal is forwarded.
pub(crate) const REFRESH_HZ: u16 = 5;

/// A request from an observer to the transaction it is connected to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum TxnRequest {
    /// Dispatch the transaction body; replied to with [`TxnSignal::Started`].
    Start,
    /// Flag the cancellation token; observed at the body's next suspension
    /// point.
    Cancel,
    /// Block until the transaction is terminal; replied to with
    /// [`TxnSignal::FinishReply`].
    Finish,
}

/// Fetch counters mirrored from the underlying store machinery.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DownloadProgress {
    /// When the fetch began (unix seconds).
    pub start_time: u64,
    /// Seconds elapsed since `start_time`.
    pub elapsed_secs: u64,
    /// Outstanding object fetches.
    pub outstanding_fetches: u32,
    /// Outstanding object writes.
    pub outstanding_writes: u32,
    /// Metadata objects scanned so far.
    pub scanned_metadata: u32,
    /// Metadata objects fetched so far.
    pub metadata_fetched: u32,
    /// Content objects fetched so far.
    pub fetched: u32,
    /// Content objects requested in total.
    pub requested: u32,
    /// Bytes transferred so far.
    pub bytes_transferred: u64,
    /// Current transfer rate in bytes per second.
    pub bytes_sec: u64,
}

/// A signal emitted by a transaction to its observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum TxnSignal {
    /// Reply to [`TxnRequest::Start`]: whether this call dispatched the body.
    Started {
        /// False when the body was already dispatched (or already finished).
        started: bool,
    },
    /// Free-form progress text.
    Message {
        /// The message.
        text: String,
    },
    /// A discrete step began.
    TaskBegin {
        /// Step description.
        text: String,
    },
    /// The current discrete step ended.
    TaskEnd {
        /// Step completion text.
        text: String,
    },
    /// Percentage progress for a named task.
    PercentProgress {
        /// Task description.
        text: String,
        /// 0..=100.
        percentage: u32,
    },
    /// Incremental fetch counters; lossy, rate-limited.
    DownloadProgress(DownloadProgress),
    /// Signature verification progress.
    SignatureProgress {
        /// Whether the signature validated.
        result: bool,
        /// The commit the signature covers.
        commit: String,
    },
    /// Terminal outcome; emitted exactly once per observer.
    Finished {
        /// Whether the body returned successfully.
        success: bool,
        /// Error message when `success` is false, empty otherwise.
        message: String,
    },
    /// Reply to [`TxnRequest::Finish`]; carries the same payload as
    /// [`TxnSignal::Finished`] but does not count as the broadcast signal.
    FinishReply {
        /// Whether the body returned successfully.
        success: bool,
        /// Error message when `success` is false, empty otherwise.
        message: String,
    },
}

/// Where transaction bodies report progress.
///
/// Implemented by the live transaction context; the store backend only sees
/// this trait so it can be driven from tests with a recording sink.
pub trait ProgressSink: Send + Sync {
    /// Emit a free-form message.
    fn message(&self, text: &str);
    /// Begin a discrete step.
    fn task_begin(&self, text: &str);
    /// End the current discrete step.
    fn task_end(&self, text: &str);
    /// Report percentage progress for a named task.
    fn percent_progress(&self, text: &str, percentage: u32);
    /// Report fetch counters; implementations may drop these when they
    /// arrive faster than the refresh rate.
    fn download_progress(&self, progress: DownloadProgress);
    /// Report signature verification progress.
    fn signature_progress(&self, result: bool, commit: &str);
}

/// Route an already-built signal to a sink's matching method.
pub(crate) fn forward_to(sink: &dyn ProgressSink, signal: &TxnSignal) {
    match signal {
        TxnSignal::Message { text } => sink.message(text),
        TxnSignal::TaskBegin { text } => sink.task_begin(text),
        TxnSignal::TaskEnd { text } => sink.task_end(text),
        TxnSignal::PercentProgress { text, percentage } => {
            sink.percent_progress(text, *percentage)
        }
        TxnSignal::DownloadProgress(p) => sink.download_progress(p.clone()),
        TxnSignal::SignatureProgress { result, commit } => {
            sink.signature_progress(*result, commit)
        }
        TxnSignal::Started { .. } | TxnSignal::Finished { .. } | TxnSignal::FinishReply { .. } => {}
    }
}

/// A sink that forwards everything to the process log; used for
/// daemon-level output when no transaction observer is connected.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn message(&self, text: &str) {
        tracing::info!("{text}");
    }
    fn task_begin(&self, text: &str) {
        tracing::info!("{text}...");
    }
    fn task_end(&self, text: &str) {
        tracing::info!("{text}");
    }
    fn percent_progress(&self, text: &str, percentage: u32) {
        tracing::debug!("{text}: {percentage}%");
    }
    fn download_progress(&self, progress: DownloadProgress) {
        tracing::trace!(?progress, "download progress");
    }
    fn signature_progress(&self, result: bool, commit: &str) {
        tracing::debug!("signature for {commit}: {result}");
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_signal_roundtrip() {
        let signals = [
            TxnSignal::Started { started: true },
            TxnSignal::Message { text: "hi".into() },
            TxnSignal::Finished {
                success: false,
                message: "Transaction was cancelled".into(),
            },
        ];
        for s in &signals {
            let line = serde_json::to_string(s).unwrap();
            // One line per event, by construction
            assert!(!line.contains('\n'));
            let back: TxnSignal = serde_json::from_str(&line).unwrap();
            assert_eq!(&back, s);
        }
    }

    #[test]
    fn test_request_tagging() {
        let line = serde_json::to_string(&TxnRequest::Start).unwrap();
        assert_eq!(line, r#"{"request":"start"}"#);
    }
}
