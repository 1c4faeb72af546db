//! The daemon's wire-visible error kinds.
//!
//! Every error a caller can observe maps onto one of these variants; the
//! dotted names are stable API, matching what the D-Bus incarnation of the
//! daemon registered.

/// Errors surfaced to clients with a stable name and a single message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DaemonError {
    /// Unspecified internal failure.
    #[error("{0}")]
    Failed(String),
    /// The configured store path is not a valid image root.
    #[error("Invalid sysroot: {0}")]
    InvalidSysroot(String),
    /// The policy engine or direct check denied the method.
    #[error("Not authorized: {0}")]
    NotAuthorized(String),
    /// A transaction is already in progress, or a reboot has been initiated.
    #[error("{0}")]
    Busy(String),
    /// A refspec could not be parsed or resolved.
    #[error("Invalid refspec: {0}")]
    InvalidRefspec(String),
    /// The deployment origin carries no refspec to operate on.
    #[error("Missing refspec: {0}")]
    MissingRefspec(String),
    /// No matching deployment for the given osname.
    #[error("No deployments found for os {osname}")]
    MissingDeployment {
        /// The osname that was requested.
        osname: String,
    },
    /// Requested object (OS name, deployment id) unknown.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The transaction body observed a cancellation request.
    #[error("Transaction was cancelled")]
    Cancelled,
}

impl DaemonError {
    /// The stable dotted name for this error kind.
    pub fn name(&self) -> &'static str {
        match self {
            DaemonError::Failed(_) => "org.projectatomic.rpmostreed.Error.Failed",
            DaemonError::InvalidSysroot(_) => "org.projectatomic.rpmostreed.Error.InvalidSysroot",
            DaemonError::NotAuthorized(_) => "org.projectatomic.rpmostreed.Error.NotAuthorized",
            DaemonError::Busy(_) => "org.projectatomic.rpmostreed.Error.UpdateInProgress",
            DaemonError::InvalidRefspec(_) => "org.projectatomic.rpmostreed.Error.InvalidRefspec",
            DaemonError::MissingRefspec(_) => "org.projectatomic.rpmostreed.Error.MissingRefspec",
            DaemonError::MissingDeployment { .. } => {
                "org.projectatomic.rpmostreed.Error.MissingDeployment"
            }
            DaemonError::NotFound(_) => "org.projectatomic.rpmostreed.Error.NotFound",
            DaemonError::Cancelled => "org.projectatomic.rpmostreed.Error.Cancelled",
        }
    }

    /// Map an arbitrary error chain onto a wire error.
    ///
    /// If a `DaemonError` appears anywhere in the chain it wins; everything
    /// else degrades to `Failed` with the full chained message.
    pub fn from_chain(err: &anyhow::Error) -> DaemonError {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<DaemonError>() {
                return e.clone();
            }
        }
        DaemonError::Failed(format!("{err:#}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_names_stable() {
        assert_eq!(
            DaemonError::Cancelled.name(),
            "org.projectatomic.rpmostreed.Error.Cancelled"
        );
        assert_eq!(
            DaemonError::Busy("x".into()).name(),
            "org.projectatomic.rpmostreed.Error.UpdateInProgress"
        );
    }

    #[test]
    fn test_from_chain_finds_kind() {
        let e: anyhow::Error = anyhow::Error::from(DaemonError::Cancelled);
        let e = e.context("while pulling");
        assert_eq!(DaemonError::from_chain(&e), DaemonError::Cancelled);

        let plain = anyhow::anyhow!("boom").context("outer");
        match DaemonError::from_chain(&plain) {
            DaemonError::Failed(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
