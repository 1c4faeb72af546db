//! Client connection handling and method dispatch.
//!
//! One task per accepted connection; requests are answered in order. Errors
//! never tear the daemon down: anything a handler returns becomes a
//! structured error reply.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::auth::authorize_method;
use crate::client::PeerCredentials;
use crate::config::UpdatePolicy;
use crate::daemon::{Daemon, Event};
use crate::deployment::{booted_deployment, default_deployment_for};
use crate::errors::DaemonError;
use crate::ipc::{CachedUpdate, DeploymentStatus, Reply, Request, UpgradeOptions};
use crate::journal;
use crate::refspec::Refspec;
use crate::transaction::Transaction;
use crate::transactions::TxnKind;

/// The wire name of a request, used for authorization and journal records.
fn request_method(request: &Request) -> &'static str {
    match request {
        Request::RegisterClient { .. } => "RegisterClient",
        Request::UnregisterClient => "UnregisterClient",
        Request::GetStatus => "GetStatus",
        Request::GetCachedUpdate { .. } => "GetCachedUpdate",
        Request::Reload => "Reload",
        Request::Reboot => "Reboot",
        Request::Upgrade { .. } => "Upgrade",
        Request::Deploy { .. } => "Deploy",
        Request::Rebase { .. } => "Rebase",
        Request::Rollback { .. } => "Rollback",
        Request::Cleanup { .. } => "Cleanup",
        Request::PkgChange { .. } => "PkgChange",
        Request::UpdateDeployment { .. } => "UpdateDeployment",
        Request::SetInitramfsState { .. } => "SetInitramfsState",
        Request::KernelArgs { .. } => "KernelArgs",
        Request::FinalizeDeployment { .. } => "FinalizeDeployment",
        Request::RefreshMd { .. } => "RefreshMd",
        Request::AutomaticUpdateTrigger { .. } => "AutomaticUpdateTrigger",
    }
}

/// Serve one client connection until it disconnects.
pub(crate) async fn serve_connection(daemon: Arc<Daemon>, stream: UnixStream, address: String) {
    let creds = stream
        .peer_cred()
        .map(|c| PeerCredentials {
            uid: Some(c.uid()),
            pid: c.pid(),
        })
        .unwrap_or_default();
    tracing::debug!(
        "Connection {address} from uid={:?} pid={:?}",
        creds.uid,
        creds.pid
    );

    // The bus-name watch analog: transactions constructed by this caller
    // subscribe to this token to notice an early vanish
    let vanished = CancellationToken::new();
    let (read_half, write_half) = stream.into_split();
    let mut writer = BufWriter::new(write_half);
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) | Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let (reply, after) = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&daemon, &address, creds, &vanished, request).await,
            Err(e) => (
                Reply::Error {
                    name: DaemonError::Failed(String::new()).name().to_owned(),
                    message: format!("Malformed request: {e}"),
                },
                None,
            ),
        };
        let mut buf = match serde_json::to_vec(&reply) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Serializing reply: {e}");
                break;
            }
        };
        buf.push(b'\n');
        if writer.write_all(&buf).await.is_err() || writer.flush().await.is_err() {
            break;
        }
        // Deferred work (e.g. the reboot invocation) runs only after the
        // caller has its reply in hand
        if let Some(event) = after {
            let _ = daemon.events().send(event);
        }
    }

    vanished.cancel();
    daemon.clients.unregister(&address);
    let _ = daemon.events().send(Event::ClientsChanged);
    tracing::debug!("Connection {address} closed");
}

async fn dispatch(
    daemon: &Arc<Daemon>,
    address: &str,
    creds: PeerCredentials,
    vanished: &CancellationToken,
    request: Request,
) -> (Reply, Option<Event>) {
    let method = request_method(&request);
    let caller = daemon.clients.snapshot_or_synthesize(address, creds);
    if let Err(e) = authorize_method(daemon.policy_engine(), &caller, method) {
        tracing::warn!("{e}");
        return (Reply::from_error(&e.into()), None);
    }
    match handle_request(daemon, address, creds, vanished, request).await {
        Ok(ok) => ok,
        Err(e) => {
            tracing::warn!("{method} failed: {e:#}");
            (Reply::from_error(&e), None)
        }
    }
}

async fn handle_request(
    daemon: &Arc<Daemon>,
    address: &str,
    creds: PeerCredentials,
    vanished: &CancellationToken,
    request: Request,
) -> Result<(Reply, Option<Event>)> {
    let reply = match request {
        Request::RegisterClient { options } => {
            daemon.clients.register(address, options.id, creds);
            return Ok((Reply::Ok, Some(Event::ClientsChanged)));
        }
        Request::UnregisterClient => {
            daemon.clients.unregister(address);
            return Ok((Reply::Ok, Some(Event::ClientsChanged)));
        }
        Request::GetStatus => status_reply(daemon),
        Request::GetCachedUpdate { osname } => Reply::CachedUpdate {
            update: cached_update(daemon, &osname)?,
        },
        Request::Reload => {
            daemon.reload_config()?;
            Reply::Ok
        }
        Request::Reboot => {
            // Refuse new transactions from this moment on; the actual
            // invocation happens on the next loop iteration
            daemon.set_rebooting();
            return Ok((Reply::Ok, Some(Event::RebootRequested)));
        }
        Request::AutomaticUpdateTrigger { osname } => {
            // Only the booted OS gets auto-updates; its cache is per-OS
            let state = daemon.sysroot.state();
            let booted = booted_deployment(&state.deployments, state.booted.as_deref());
            if booted.map(|d| d.osname.as_str()) != Some(osname.as_str()) {
                anyhow::bail!("Cannot trigger auto-update for offline OS '{osname}'");
            }
            match daemon.automatic_update_policy() {
                UpdatePolicy::None => Reply::AutomaticUpdate {
                    enabled: false,
                    address: None,
                },
                policy => {
                    let options = UpgradeOptions {
                        download_metadata_only: policy == UpdatePolicy::Check,
                        ..Default::default()
                    };
                    let kind = TxnKind::Upgrade { osname, options };
                    let reply =
                        transaction_method(daemon, address, creds, vanished, kind).await?;
                    let Reply::TransactionAddress { address } = reply else {
                        unreachable!("transaction methods reply with an address")
                    };
                    Reply::AutomaticUpdate {
                        enabled: true,
                        address: Some(address),
                    }
                }
            }
        }
        Request::Upgrade { osname, options } => {
            let kind = TxnKind::Upgrade { osname, options };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::Deploy {
            osname,
            revision,
            options,
        } => {
            let kind = TxnKind::Deploy {
                osname,
                revision,
                options,
            };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::Rebase {
            osname,
            refspec,
            options,
        } => {
            let kind = TxnKind::Rebase {
                osname,
                refspec,
                options,
            };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::Rollback { osname, options } => {
            let kind = TxnKind::Rollback { osname, options };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::Cleanup { osname, options } => {
            let kind = TxnKind::Cleanup { osname, options };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::PkgChange { osname, options } => {
            let kind = TxnKind::PkgChange { osname, options };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::UpdateDeployment { osname, modifiers } => {
            let kind = TxnKind::UpdateDeployment { osname, modifiers };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::SetInitramfsState {
            osname,
            regenerate,
            args,
        } => {
            let kind = TxnKind::SetInitramfsState {
                osname,
                regenerate,
                args,
            };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::KernelArgs { osname, options } => {
            let kind = TxnKind::KernelArgs { osname, options };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::FinalizeDeployment { osname, options } => {
            let kind = TxnKind::FinalizeDeployment { osname, options };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
        Request::RefreshMd { osname, options } => {
            let kind = TxnKind::RefreshMd { osname, options };
            transaction_method(daemon, address, creds, vanished, kind).await?
        }
    };
    Ok((reply, None))
}

/// The shared path of every mutating method: merge onto a compatible
/// in-flight transaction or construct a new one, then hand back the private
/// endpoint address.
async fn transaction_method(
    daemon: &Arc<Daemon>,
    sender: &str,
    creds: PeerCredentials,
    vanished: &CancellationToken,
    kind: TxnKind,
) -> Result<Reply> {
    if let Some(existing) = daemon.coordinator.prep_for_txn(daemon.is_rebooting(), &kind)? {
        return Ok(Reply::TransactionAddress {
            address: existing.address().to_string(),
        });
    }

    let txn = Transaction::new(daemon.txn_env(), sender, vanished.child_token(), kind).await?;
    daemon.coordinator.set(&txn);
    // An unregistered initiator still gets a useful journal record; the
    // synthesized entry is not retained or watched
    let client = daemon.clients.snapshot_or_synthesize(sender, creds);
    journal::transaction_started(
        txn.method(),
        &client.to_log_string(),
        txn.address().as_str(),
        sender,
        client.uid,
    );
    daemon.update_status();
    Ok(Reply::TransactionAddress {
        address: txn.address().to_string(),
    })
}

fn status_reply(daemon: &Arc<Daemon>) -> Reply {
    let state = daemon.sysroot.state();
    let booted = state.booted.clone().unwrap_or_default();
    let deployments = state
        .deployments
        .iter()
        .map(|d| DeploymentStatus::new(d, state.booted.as_deref()))
        .collect();
    Reply::Status {
        deployments,
        booted,
        active_transaction: daemon.coordinator.active_transaction(),
        active_transaction_path: daemon.coordinator.active_transaction_path(),
        automatic_update_policy: daemon.automatic_update_policy().to_string(),
    }
}

/// An update is "cached" when the tracked branch's head differs from what
/// the default deployment carries.
fn cached_update(daemon: &Arc<Daemon>, osname: &str) -> Result<Option<CachedUpdate>> {
    let state = daemon.sysroot.state();
    let default = default_deployment_for(&state.deployments, osname).ok_or_else(|| {
        DaemonError::MissingDeployment {
            osname: osname.to_owned(),
        }
    })?;
    let Some(refspec_str) = default.origin.refspec() else {
        return Ok(None);
    };
    let refspec = Refspec::parse(&refspec_str)?;
    let head = match daemon.backend().resolve(&refspec) {
        Ok(head) => head,
        Err(e) => {
            tracing::debug!("No cached update for {osname}: {e:#}");
            return Ok(None);
        }
    };
    if head == default.checksum {
        return Ok(None);
    }
    let meta = daemon.backend().commit_meta(&head)?;
    Ok(Some(CachedUpdate {
        origin: refspec_str,
        checksum: head,
        version: meta.version,
        timestamp: meta.timestamp.map(|t| t.timestamp()),
    }))
}
