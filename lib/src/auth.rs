//! Method authorization.
//!
//! The real policy decisions live in an external engine (polkit in the
//! D-Bus incarnation); the daemon only knows the per-method action ids, the
//! direct uid-0 bypass, and the session-based self-authorization for client
//! (un)registration.

use crate::client::{pid_has_active_session, Client};
use crate::errors::DaemonError;

const ACTION_PREFIX: &str = "org.projectatomic.rpmostree1";

/// The external policy engine consulted for non-root callers.
pub trait PolicyEngine: Send + Sync + std::fmt::Debug {
    /// Whether `client` may perform `action`.
    fn check_authorization(&self, client: &Client, action: &str) -> anyhow::Result<bool>;
}

/// Default engine: nothing beyond the built-in bypasses is permitted.
#[derive(Debug, Default, Clone)]
pub struct DenyAllPolicy;

impl PolicyEngine for DenyAllPolicy {
    fn check_authorization(&self, _client: &Client, _action: &str) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Engine that approves everything; used by tests.
#[derive(Debug, Default, Clone)]
pub struct AllowAllPolicy;

impl PolicyEngine for AllowAllPolicy {
    fn check_authorization(&self, _client: &Client, _action: &str) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// The action id governing a method.
pub fn action_for_method(method: &str) -> String {
    let verb = match method {
        "GetStatus" | "GetCachedUpdate" => "repo-refresh",
        "RefreshMd" => "repo-refresh",
        "Upgrade" | "AutomaticUpdateTrigger" => "upgrade",
        "Rollback" => "rollback",
        "Rebase" => "rebase",
        "Deploy" | "UpdateDeployment" | "FinalizeDeployment" => "deploy",
        "SetInitramfsState" => "bootconfig",
        "KernelArgs" => "bootconfig",
        "PkgChange" => "install-uninstall-packages",
        "Cleanup" => "cleanup",
        "Reload" => "reload-daemon",
        "Reboot" => "bootconfig",
        _ => "client-management",
    };
    format!("{ACTION_PREFIX}.{verb}")
}

/// Authorize one method call.
///
/// uid 0 bypasses the engine entirely. `RegisterClient` and
/// `UnregisterClient` are additionally self-authorized for callers holding
/// an active login session.
pub fn authorize_method(
    policy: &dyn PolicyEngine,
    client: &Client,
    method: &str,
) -> Result<(), DaemonError> {
    if client.uid == Some(0) {
        return Ok(());
    }
    if matches!(method, "RegisterClient" | "UnregisterClient") {
        if let Some(pid) = client.pid {
            if pid_has_active_session(pid) {
                return Ok(());
            }
        }
    }
    let action = action_for_method(method);
    match policy.check_authorization(client, &action) {
        Ok(true) => Ok(()),
        Ok(false) => Err(DaemonError::NotAuthorized(format!(
            "{} not authorized for {action}",
            client.to_log_string()
        ))),
        Err(e) => Err(DaemonError::NotAuthorized(format!(
            "Policy check for {action} failed: {e:#}"
        ))),
    }
}
