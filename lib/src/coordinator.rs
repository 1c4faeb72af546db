//! The single-writer transaction gate.
//!
//! Holds zero or one transaction. Compatible callers are merged onto the
//! in-flight transaction; incompatible ones are refused. The exported
//! `active-transaction` properties are updated synchronously so no observer
//! can see a `Finished` signal before the property flip.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8Path;
use tokio::sync::watch;

use crate::errors::DaemonError;
use crate::transaction::Transaction;
use crate::transactions::TxnKind;

/// How long an executed transaction may linger for result replay.
pub(crate) const FORCE_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// The observable transaction properties, shared with the live transaction
/// so terminal transitions publish before signal emission.
#[derive(Debug)]
pub(crate) struct TxnProps {
    /// (method, sender, object path); empty strings when nothing is active.
    pub(crate) active_transaction: watch::Sender<[String; 3]>,
    /// Private endpoint address, or empty.
    pub(crate) active_transaction_path: watch::Sender<String>,
}

pub(crate) fn empty_triple() -> [String; 3] {
    std::array::from_fn(|_| String::new())
}

impl TxnProps {
    fn new() -> Self {
        let (active_transaction, _) = watch::channel(empty_triple());
        let (active_transaction_path, _) = watch::channel(String::new());
        Self {
            active_transaction,
            active_transaction_path,
        }
    }

    pub(crate) fn clear_triple(&self) {
        self.active_transaction.send_replace(empty_triple());
    }
}

/// Gate enforcing at most one transaction against the store.
#[derive(Debug)]
pub struct TransactionCoordinator {
    active: Mutex<Option<Transaction>>,
    pub(crate) props: Arc<TxnProps>,
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self {
            active: Mutex::new(None),
            props: Arc::new(TxnProps::new()),
        }
    }
}

impl TransactionCoordinator {
    /// The current transaction, in-flight or lingering.
    pub fn active(&self) -> Option<Transaction> {
        self.active.lock().unwrap().clone()
    }

    /// Decide how an incoming invocation relates to the in-flight
    /// transaction: `None` means the caller should construct a new one; a
    /// transaction means the caller joins it.
    pub fn prep_for_txn(
        &self,
        rebooting: bool,
        kind: &TxnKind,
    ) -> Result<Option<Transaction>, DaemonError> {
        if rebooting {
            return Err(DaemonError::Busy("Reboot initiated".into()));
        }
        match self.active() {
            None => Ok(None),
            Some(txn) if txn.is_compatible(kind) => {
                tracing::info!("Reusing compatible transaction: {}", txn.title());
                Ok(Some(txn))
            }
            Some(txn) => Err(DaemonError::Busy(format!(
                "Transaction in progress: {}",
                txn.title()
            ))),
        }
    }

    /// Install a freshly constructed transaction and publish its properties.
    pub fn set(&self, txn: &Transaction) {
        let mut guard = self.active.lock().unwrap();
        debug_assert!(guard.is_none(), "transaction slot already occupied");
        self.props.active_transaction.send_replace([
            txn.method().to_owned(),
            txn.sender().to_owned(),
            txn.address().to_string(),
        ]);
        self.props
            .active_transaction_path
            .send_replace(txn.address().to_string());
        *guard = Some(txn.clone());
    }

    /// Remove the transaction identified by its endpoint address, clearing
    /// the exported properties.
    pub fn finish(&self, address: &Utf8Path) {
        let mut guard = self.active.lock().unwrap();
        let matches = guard
            .as_ref()
            .map(|t| t.address() == address)
            .unwrap_or(false);
        if matches {
            *guard = None;
            self.props.clear_triple();
            self.props.active_transaction_path.send_replace(String::new());
        }
    }

    /// The exported triple property.
    pub fn active_transaction(&self) -> [String; 3] {
        self.props.active_transaction.borrow().clone()
    }

    /// The exported endpoint address property.
    pub fn active_transaction_path(&self) -> String {
        self.props.active_transaction_path.borrow().clone()
    }

    /// Arm the force-close timer for an executed transaction. If the
    /// transaction is still present when the timer fires it is torn down
    /// regardless of connected observers.
    pub fn arm_force_close(self: &Arc<Self>, address: &Utf8Path) {
        let coordinator = Arc::clone(self);
        let address = address.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(FORCE_CLOSE_TIMEOUT).await;
            let lingering = coordinator
                .active()
                .filter(|t| t.address() == address && t.executed());
            if let Some(txn) = lingering {
                tracing::info!("Force-closing lingering transaction {}", txn.title());
                txn.force_close();
            }
        });
    }
}
