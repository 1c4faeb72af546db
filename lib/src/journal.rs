//! Structured journal records for transaction lifecycle events.
//!
//! Everything here degrades to plain tracing output when the host is not
//! running under systemd (e.g. in a container or a test).

use std::sync::Once;

use libsystemd::logging::Priority;

/// Fixed message id attached to every transaction-start record, so fleet
/// tooling can query for them.
pub const MESSAGE_TRANSACTION_STARTED: &str = "d5bea37a8fc84ff59dbcfd79177b7df8";

static JOURNAL_ERROR: Once = Once::new();

fn send(priority: Priority, msg: &str, vars: &[(&str, String)]) {
    if !libsystemd::daemon::booted() {
        return;
    }
    let vars = vars.iter().map(|(k, v)| (*k, v.as_str()));
    if let Err(e) = libsystemd::logging::journal_send(priority, msg, vars) {
        // Complain once, keep serving
        JOURNAL_ERROR.call_once(|| tracing::warn!("Failed to write to journal: {e}"));
    }
}

/// Record the start of a transaction: who initiated what, and where its
/// endpoint lives.
pub(crate) fn transaction_started(
    method: &str,
    client_str: &str,
    address: &str,
    sender: &str,
    uid: Option<u32>,
) {
    let msg = format!("Initiated txn {method} for {client_str}: {address}");
    tracing::info!("{msg}");
    let mut vars = vec![
        ("MESSAGE_ID", MESSAGE_TRANSACTION_STARTED.to_owned()),
        ("BUS_ADDRESS", sender.to_owned()),
    ];
    if let Some(uid) = uid {
        vars.push(("CLIENT_UID", uid.to_string()));
    }
    send(Priority::Info, &msg, &vars);
}

/// Record the completion of a transaction.
pub(crate) fn transaction_done(method: &str, address: &str, success: bool, message: &str) {
    let outcome = if success { "success" } else { message };
    let msg = format!("Txn {method} on {address} {outcome}");
    tracing::info!("{msg}");
    send(Priority::Info, &msg, &[]);
}
