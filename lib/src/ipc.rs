//! The daemon's client-facing wire protocol.
//!
//! One unix stream socket, json-lines framing in both directions; peer
//! identity comes from `SO_PEERCRED` at accept time. Mutating methods reply
//! with the private endpoint address of a transaction; everything else is
//! answered synchronously.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::deployment::Deployment;

/// Default location of the daemon socket.
pub const SOCKET_PATH: &str = "/run/rpm-ostree/daemon.sock";

/// Default directory for per-transaction endpoint sockets.
pub const RUN_DIR: &str = "/run/rpm-ostree";

/// Options attached to client registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClientOptions {
    /// Caller-provided identity label (e.g. "cli").
    pub id: Option<String>,
    /// Unrecognized options; accepted and ignored.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Options for `Upgrade`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct UpgradeOptions {
    /// Permit moving to an older commit.
    pub allow_downgrade: bool,
    /// Fetch content but do not deploy it.
    pub download_only: bool,
    /// Fetch only metadata (an update check).
    pub download_metadata_only: bool,
    /// Unrecognized options.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Options for `Deploy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeployOptions {
    /// Keep the previous pending deployment too.
    pub retain: bool,
    /// Permit moving to an older commit.
    pub allow_downgrade: bool,
    /// Unrecognized options.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Options for `Rebase`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct RebaseOptions {
    /// Keep the previous branch's deployments.
    pub skip_purge: bool,
    /// Unrecognized options.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Options for `Rollback`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct RollbackOptions {
    /// Reboot once the rollback is written.
    pub reboot: bool,
    /// Unrecognized options.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Options for `Cleanup`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct CleanupOptions {
    /// Remove the pending deployment.
    pub pending: bool,
    /// Remove the rollback deployment.
    pub rollback: bool,
    /// Prune unreferenced repository content.
    pub repo: bool,
    /// Unrecognized options.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Options for `PkgChange`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct PkgChangeOptions {
    /// Packages to add to the request set.
    pub packages_added: Vec<String>,
    /// Packages to remove from the request set.
    pub packages_removed: Vec<String>,
    /// Unrecognized options.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Modifiers for `UpdateDeployment`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct UpdateDeploymentModifiers {
    /// Switch to this refspec.
    pub set_refspec: Option<String>,
    /// Pin to this exact revision.
    pub set_revision: Option<String>,
    /// Unrecognized modifiers.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Options for `KernelArgs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct KernelArgsOptions {
    /// Arguments to append.
    pub append: Vec<String>,
    /// Arguments to delete.
    pub delete: Vec<String>,
    /// `key=value` replacements for existing keys.
    pub replace: Vec<String>,
    /// Unrecognized options.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Options for `FinalizeDeployment`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FinalizeOptions {
    /// The checksum the caller expects to finalize.
    pub checksum: Option<String>,
    /// Finalize whatever is pending, without a checksum check.
    pub allow_missing_checksum: bool,
    /// Unrecognized options.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// Options for `RefreshMd`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct RefreshMdOptions {
    /// Bypass freshness checks.
    pub force: bool,
    /// Unrecognized options.
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// A method call from a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method")]
pub enum Request {
    /// Associate the caller's address with an id.
    RegisterClient {
        /// Registration options.
        #[serde(default)]
        options: ClientOptions,
    },
    /// Remove the caller's registration.
    UnregisterClient,
    /// Snapshot of the deployment fleet and daemon properties.
    GetStatus,
    /// Cached update details for one OS, if any.
    GetCachedUpdate {
        /// Which OS to query.
        osname: String,
    },
    /// Re-read configuration and re-scan the sysroot.
    Reload,
    /// Reboot the system once the reply has been delivered.
    Reboot,
    /// Upgrade within the tracked branch.
    Upgrade {
        /// Which OS to operate on.
        osname: String,
        /// Options.
        #[serde(default)]
        options: UpgradeOptions,
    },
    /// Deploy a specific revision.
    Deploy {
        /// Which OS to operate on.
        osname: String,
        /// Commit checksum, or empty for the branch head.
        revision: String,
        /// Options.
        #[serde(default)]
        options: DeployOptions,
    },
    /// Switch to a different branch.
    Rebase {
        /// Which OS to operate on.
        osname: String,
        /// The (possibly partial) target refspec.
        refspec: String,
        /// Options.
        #[serde(default)]
        options: RebaseOptions,
    },
    /// Make the rollback deployment the default.
    Rollback {
        /// Which OS to operate on.
        osname: String,
        /// Options.
        #[serde(default)]
        options: RollbackOptions,
    },
    /// Remove superseded deployments and prune.
    Cleanup {
        /// Which OS to operate on.
        osname: String,
        /// Options.
        #[serde(default)]
        options: CleanupOptions,
    },
    /// Change the layered package request set.
    PkgChange {
        /// Which OS to operate on.
        osname: String,
        /// Options.
        #[serde(default)]
        options: PkgChangeOptions,
    },
    /// Apply origin modifiers and redeploy.
    UpdateDeployment {
        /// Which OS to operate on.
        osname: String,
        /// Modifiers.
        #[serde(default)]
        modifiers: UpdateDeploymentModifiers,
    },
    /// Record initramfs regeneration state and redeploy.
    SetInitramfsState {
        /// Which OS to operate on.
        osname: String,
        /// Whether to regenerate the initramfs locally.
        regenerate: bool,
        /// Arguments for the generator.
        #[serde(default)]
        args: Vec<String>,
    },
    /// Edit kernel arguments and redeploy.
    KernelArgs {
        /// Which OS to operate on.
        osname: String,
        /// Options.
        #[serde(default)]
        options: KernelArgsOptions,
    },
    /// Finalize a staged deployment for the next boot.
    FinalizeDeployment {
        /// Which OS to operate on.
        osname: String,
        /// Options.
        #[serde(default)]
        options: FinalizeOptions,
    },
    /// Refresh repository metadata.
    RefreshMd {
        /// Which OS to operate on.
        osname: String,
        /// Options.
        #[serde(default)]
        options: RefreshMdOptions,
    },
    /// Run the configured automatic update policy.
    AutomaticUpdateTrigger {
        /// Which OS to operate on.
        osname: String,
    },
}

/// Representation of a deployment suitable for serialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DeploymentStatus {
    /// Stable identifier.
    pub id: String,
    /// OS name.
    pub osname: String,
    /// Commit checksum.
    pub checksum: String,
    /// Deploy serial.
    pub serial: u32,
    /// Position in the boot order.
    pub index: usize,
    /// Tracked refspec, if the origin has one.
    pub refspec: Option<String>,
    /// Version from the commit metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Whether this is the running deployment.
    pub booted: bool,
    /// Layered package requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requested_packages: Vec<String>,
    /// Commit timestamp (unix seconds).
    pub timestamp: i64,
}

impl DeploymentStatus {
    /// Project a deployment snapshot for the wire.
    pub fn new(d: &Deployment, booted_id: Option<&str>) -> Self {
        let id = d.id();
        Self {
            booted: booted_id == Some(id.as_str()),
            id,
            osname: d.osname.clone(),
            checksum: d.checksum.clone(),
            serial: d.serial,
            index: d.index,
            refspec: d.origin.refspec(),
            version: d.version.clone(),
            requested_packages: d.origin.requested_packages(),
            timestamp: d.timestamp.timestamp(),
        }
    }
}

/// Details of an update that is already available in the repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct CachedUpdate {
    /// The refspec the update came from.
    pub origin: String,
    /// The new head commit.
    pub checksum: String,
    /// Version of the new commit, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Timestamp of the new commit (unix seconds), if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// The daemon's answer to a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum Reply {
    /// Success with nothing else to say.
    Ok,
    /// Answer to `GetStatus`.
    Status {
        /// Ordered deployment fleet.
        deployments: Vec<DeploymentStatus>,
        /// Id of the booted deployment, or empty.
        booted: String,
        /// (method, sender, path) of the active transaction, or empty strings.
        active_transaction: [String; 3],
        /// Private endpoint address of the active transaction, or empty.
        active_transaction_path: String,
        /// The configured automatic update policy.
        automatic_update_policy: String,
    },
    /// Answer to every transaction method: where to connect.
    TransactionAddress {
        /// Private endpoint socket path.
        address: String,
    },
    /// Answer to `GetCachedUpdate`.
    CachedUpdate {
        /// The available update, if any.
        update: Option<CachedUpdate>,
    },
    /// Answer to `AutomaticUpdateTrigger`.
    AutomaticUpdate {
        /// False when the policy is `none`.
        enabled: bool,
        /// Endpoint of the triggered transaction when enabled.
        address: Option<String>,
    },
    /// A structured error.
    Error {
        /// Stable dotted error name.
        name: String,
        /// Human-readable message.
        message: String,
    },
}

impl Reply {
    /// Build an error reply from an error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let kind = crate::errors::DaemonError::from_chain(err);
        Reply::Error {
            name: kind.name().to_owned(),
            message: kind.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_request_shape() {
        let r: Request = serde_json::from_str(
            r#"{"method":"Upgrade","osname":"fedora-coreos","options":{"allow-downgrade":true}}"#,
        )
        .unwrap();
        match r {
            Request::Upgrade { osname, options } => {
                assert_eq!(osname, "fedora-coreos");
                assert!(options.allow_downgrade);
                assert!(options.other.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_options_default_and_bucket() {
        let r: Request =
            serde_json::from_str(r#"{"method":"Upgrade","osname":"x"}"#).unwrap();
        let Request::Upgrade { options, .. } = r else {
            panic!()
        };
        assert_eq!(options, UpgradeOptions::default());

        let r: Request = serde_json::from_str(
            r#"{"method":"Upgrade","osname":"x","options":{"from-the-future":1}}"#,
        )
        .unwrap();
        let Request::Upgrade { options, .. } = r else {
            panic!()
        };
        assert_eq!(options.other["from-the-future"], serde_json::json!(1));
    }

    #[test]
    fn test_reply_error_shape() {
        let err = anyhow::Error::from(crate::errors::DaemonError::NotFound("os x".into()));
        let reply = Reply::from_error(&err);
        let line = serde_json::to_string(&reply).unwrap();
        assert!(line.contains("org.projectatomic.rpmostreed.Error.NotFound"));
    }
}
