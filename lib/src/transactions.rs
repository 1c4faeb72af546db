//! The transaction kinds and their bodies.
//!
//! Each kind is one mutating method on the OS facade. Bodies run on the
//! transaction's worker thread, observe the cancellation token before every
//! store operation, and drive the backend for anything that actually touches
//! content.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::deployment::{
    booted_deployment, default_deployment_for, list_rotated_for_rollback, list_with_new_default,
    Deployment,
};
use crate::errors::DaemonError;
use crate::ipc::{
    CleanupOptions, DeployOptions, FinalizeOptions, KernelArgsOptions, PkgChangeOptions,
    RebaseOptions, RefreshMdOptions, RollbackOptions, UpdateDeploymentModifiers, UpgradeOptions,
};
use crate::progress::ProgressSink;
use crate::refspec::Refspec;
use crate::store::{LoadedState, PullDepth};
use crate::transaction::TxnContext;

/// One mutating operation, with its full parameter tuple.
///
/// Two invocations are compatible when the method and the value-rendered
/// parameters are equal; dictionary key order is not significant.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "method")]
pub enum TxnKind {
    /// Move to the newest commit on the tracked branch.
    Upgrade {
        /// Target OS.
        osname: String,
        /// Options.
        options: UpgradeOptions,
    },
    /// Deploy a specific revision.
    Deploy {
        /// Target OS.
        osname: String,
        /// Commit checksum, or empty for the branch head.
        revision: String,
        /// Options.
        options: DeployOptions,
    },
    /// Switch to a different branch.
    Rebase {
        /// Target OS.
        osname: String,
        /// Possibly partial refspec.
        refspec: String,
        /// Options.
        options: RebaseOptions,
    },
    /// Promote the rollback deployment to the default.
    Rollback {
        /// Target OS.
        osname: String,
        /// Options.
        options: RollbackOptions,
    },
    /// Remove superseded deployments and prune content.
    Cleanup {
        /// Target OS.
        osname: String,
        /// Options.
        options: CleanupOptions,
    },
    /// Change the layered package request set.
    PkgChange {
        /// Target OS.
        osname: String,
        /// Options.
        options: PkgChangeOptions,
    },
    /// Apply origin modifiers and redeploy.
    UpdateDeployment {
        /// Target OS.
        osname: String,
        /// Modifiers.
        modifiers: UpdateDeploymentModifiers,
    },
    /// Record initramfs regeneration state and redeploy.
    SetInitramfsState {
        /// Target OS.
        osname: String,
        /// Whether to regenerate locally.
        regenerate: bool,
        /// Generator arguments.
        args: Vec<String>,
    },
    /// Edit kernel arguments and redeploy.
    KernelArgs {
        /// Target OS.
        osname: String,
        /// Options.
        options: KernelArgsOptions,
    },
    /// Finalize a staged deployment for the next boot.
    FinalizeDeployment {
        /// Target OS.
        osname: String,
        /// Options.
        options: FinalizeOptions,
    },
    /// Refresh repository metadata.
    RefreshMd {
        /// Target OS.
        osname: String,
        /// Options.
        options: RefreshMdOptions,
    },
}

impl TxnKind {
    /// The method name, as it appears on the wire and in journal records.
    pub fn method(&self) -> &'static str {
        match self {
            TxnKind::Upgrade { .. } => "Upgrade",
            TxnKind::Deploy { .. } => "Deploy",
            TxnKind::Rebase { .. } => "Rebase",
            TxnKind::Rollback { .. } => "Rollback",
            TxnKind::Cleanup { .. } => "Cleanup",
            TxnKind::PkgChange { .. } => "PkgChange",
            TxnKind::UpdateDeployment { .. } => "UpdateDeployment",
            TxnKind::SetInitramfsState { .. } => "SetInitramfsState",
            TxnKind::KernelArgs { .. } => "KernelArgs",
            TxnKind::FinalizeDeployment { .. } => "FinalizeDeployment",
            TxnKind::RefreshMd { .. } => "RefreshMd",
        }
    }

    /// The full parameter tuple as a value; the compatibility comparison
    /// key.
    pub fn params(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Human-readable description for busy errors and status lines.
    pub fn title(&self) -> String {
        match self {
            TxnKind::Upgrade { osname, options } => {
                let mode = if options.download_metadata_only {
                    " (check)"
                } else if options.download_only {
                    " (download only)"
                } else {
                    ""
                };
                format!("upgrade{mode} ({osname})")
            }
            TxnKind::Deploy {
                osname, revision, ..
            } => {
                if revision.is_empty() {
                    format!("deploy ({osname})")
                } else {
                    format!("deploy {revision} ({osname})")
                }
            }
            TxnKind::Rebase {
                osname, refspec, ..
            } => format!("rebase to {refspec} ({osname})"),
            TxnKind::Rollback { osname, .. } => format!("rollback ({osname})"),
            TxnKind::Cleanup { osname, .. } => format!("cleanup ({osname})"),
            TxnKind::PkgChange { osname, options } => format!(
                "pkg change (+{} -{}) ({osname})",
                options.packages_added.len(),
                options.packages_removed.len()
            ),
            TxnKind::UpdateDeployment { osname, .. } => format!("update deployment ({osname})"),
            TxnKind::SetInitramfsState { osname, .. } => format!("initramfs state ({osname})"),
            TxnKind::KernelArgs { osname, .. } => format!("kernel arguments ({osname})"),
            TxnKind::FinalizeDeployment { osname, .. } => {
                format!("finalize deployment ({osname})")
            }
            TxnKind::RefreshMd { osname, .. } => format!("refresh metadata ({osname})"),
        }
    }

    /// Run the body. The first error wins and becomes the `Finished`
    /// message.
    pub(crate) async fn execute(&self, ctx: &TxnContext) -> Result<()> {
        ctx.check_cancelled()?;
        match self {
            TxnKind::Upgrade { osname, options } => upgrade(ctx, osname, options).await,
            TxnKind::Deploy {
                osname,
                revision,
                options,
            } => deploy(ctx, osname, revision, options).await,
            TxnKind::Rebase {
                osname,
                refspec,
                options,
            } => rebase(ctx, osname, refspec, options).await,
            TxnKind::Rollback { osname, options } => rollback(ctx, osname, options).await,
            TxnKind::Cleanup { osname, options } => cleanup(ctx, osname, options).await,
            TxnKind::PkgChange { osname, options } => pkg_change(ctx, osname, options).await,
            TxnKind::UpdateDeployment { osname, modifiers } => {
                update_deployment(ctx, osname, modifiers).await
            }
            TxnKind::SetInitramfsState {
                osname,
                regenerate,
                args,
            } => set_initramfs_state(ctx, osname, *regenerate, args).await,
            TxnKind::KernelArgs { osname, options } => kernel_args(ctx, osname, options).await,
            TxnKind::FinalizeDeployment { osname, options } => {
                finalize_deployment(ctx, osname, options).await
            }
            TxnKind::RefreshMd { osname, options } => refresh_md(ctx, osname, options).await,
        }
    }
}

/// The deployment new work is based on: the booted one when it belongs to
/// `osname`, else the current default for `osname`.
fn merge_deployment<'s>(state: &'s LoadedState, osname: &str) -> Result<&'s Deployment> {
    booted_deployment(&state.deployments, state.booted.as_deref())
        .filter(|d| d.osname == osname)
        .or_else(|| default_deployment_for(&state.deployments, osname))
        .ok_or_else(|| {
            DaemonError::MissingDeployment {
                osname: osname.to_owned(),
            }
            .into()
        })
}

async fn upgrade(ctx: &TxnContext, osname: &str, options: &UpgradeOptions) -> Result<()> {
    let state = ctx.sysroot.load()?;
    let merge = merge_deployment(&state, osname)?;
    let refspec = Refspec::parse(&merge.origin.require_refspec()?)?;

    let depth = if options.download_metadata_only {
        PullDepth::Metadata
    } else {
        PullDepth::Full
    };
    ctx.task_begin(&format!("Pulling {refspec}"));
    ctx.check_cancelled()?;
    ctx.backend.pull(&refspec, depth, ctx, ctx.token())?;
    ctx.task_end("Done");

    let new_checksum = ctx.backend.resolve(&refspec)?;
    if new_checksum == merge.checksum {
        ctx.message("No upgrade available.");
        return Ok(());
    }
    if !options.allow_downgrade {
        let new_meta = ctx.backend.commit_meta(&new_checksum)?;
        if let Some(ts) = new_meta.timestamp {
            if ts < merge.timestamp {
                anyhow::bail!("Upgrade would downgrade {refspec}; use allow-downgrade to override");
            }
        }
    }
    if options.download_metadata_only || options.download_only {
        ctx.message(&format!("Update available: {new_checksum}"));
        return Ok(());
    }

    ctx.check_cancelled()?;
    let merge_origin = merge.origin.clone();
    let booted = state.booted.clone();
    let new = ctx.backend.stage(osname, &new_checksum, &merge_origin)?;
    let list = list_with_new_default(&state.deployments, new, booted.as_deref(), false);
    ctx.check_cancelled()?;
    ctx.backend.write_deployments(&list)?;
    ctx.message(&format!("Upgraded {osname} to {new_checksum}"));
    Ok(())
}

async fn deploy(
    ctx: &TxnContext,
    osname: &str,
    revision: &str,
    options: &DeployOptions,
) -> Result<()> {
    let state = ctx.sysroot.load()?;
    let merge = merge_deployment(&state, osname)?;
    let refspec = Refspec::parse(&merge.origin.require_refspec()?)?;

    ctx.task_begin(&format!("Pulling {refspec}"));
    ctx.check_cancelled()?;
    ctx.backend.pull(&refspec, PullDepth::Full, ctx, ctx.token())?;
    ctx.task_end("Done");

    let head = ctx.backend.resolve(&refspec)?;
    let checksum = if revision.is_empty() {
        head
    } else {
        if revision.len() != 64 || !revision.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DaemonError::NotFound(format!("Invalid revision {revision}")).into());
        }
        revision.to_owned()
    };
    if !options.allow_downgrade {
        let new_meta = ctx.backend.commit_meta(&checksum)?;
        if let Some(ts) = new_meta.timestamp {
            if ts < merge.timestamp {
                anyhow::bail!(
                    "Deploying {checksum} would downgrade; use allow-downgrade to override"
                );
            }
        }
    }

    ctx.check_cancelled()?;
    let merge_origin = merge.origin.clone();
    let booted = state.booted.clone();
    let new = ctx.backend.stage(osname, &checksum, &merge_origin)?;
    let list = list_with_new_default(&state.deployments, new, booted.as_deref(), options.retain);
    ctx.backend.write_deployments(&list)?;
    ctx.message(&format!("Deployed {checksum} for {osname}"));
    Ok(())
}

async fn rebase(
    ctx: &TxnContext,
    osname: &str,
    refspec: &str,
    options: &RebaseOptions,
) -> Result<()> {
    let state = ctx.sysroot.load()?;
    let merge = merge_deployment(&state, osname)?;
    let base = merge.origin.refspec();
    let target = Refspec::parse_partial(refspec, base.as_deref())?;

    ctx.task_begin(&format!("Pulling {target}"));
    ctx.check_cancelled()?;
    ctx.backend.pull(&target, PullDepth::Full, ctx, ctx.token())?;
    ctx.task_end("Done");

    let checksum = ctx.backend.resolve(&target)?;
    let mut origin = merge.origin.clone();
    origin.set_refspec(&target.to_string());

    ctx.check_cancelled()?;
    let booted = state.booted.clone();
    let new = ctx.backend.stage(osname, &checksum, &origin)?;
    let list =
        list_with_new_default(&state.deployments, new, booted.as_deref(), options.skip_purge);
    ctx.backend.write_deployments(&list)?;
    ctx.message(&format!("Rebased {osname} to {target}"));
    Ok(())
}

async fn rollback(ctx: &TxnContext, osname: &str, options: &RollbackOptions) -> Result<()> {
    let state = ctx.sysroot.load()?;
    let list = list_rotated_for_rollback(&state.deployments, state.booted.as_deref(), osname)?;
    ctx.message(&format!(
        "Moving '{}' to be first deployment",
        list[0].id()
    ));
    ctx.check_cancelled()?;
    ctx.backend.write_deployments(&list)?;
    if options.reboot {
        ctx.message("Initiating reboot");
        ctx.request_reboot();
    }
    Ok(())
}

async fn cleanup(ctx: &TxnContext, osname: &str, options: &CleanupOptions) -> Result<()> {
    let state = ctx.sysroot.load()?;
    if options.pending || options.rollback {
        let booted_index = booted_deployment(&state.deployments, state.booted.as_deref())
            .filter(|d| d.osname == osname)
            .map(|d| d.index);
        // Without a booted deployment there is no pending/rollback
        // distinction to clean by
        if let Some(booted_index) = booted_index {
            let mut list: Vec<Deployment> = Vec::with_capacity(state.deployments.len());
            for d in &state.deployments {
                let same_os = d.osname == osname;
                let drop_pending = options.pending && same_os && d.index < booted_index;
                let drop_rollback = options.rollback && same_os && d.index > booted_index;
                if drop_pending || drop_rollback {
                    ctx.message(&format!("Deleting deployment {}", d.id()));
                } else {
                    list.push(d.clone());
                }
            }
            if list.len() != state.deployments.len() {
                for (i, d) in list.iter_mut().enumerate() {
                    d.index = i;
                }
                ctx.check_cancelled()?;
                ctx.backend.write_deployments(&list)?;
            }
        }
    }
    if options.repo {
        ctx.check_cancelled()?;
        ctx.backend.prune(ctx, ctx.token())?;
    }
    Ok(())
}

async fn pkg_change(ctx: &TxnContext, osname: &str, options: &PkgChangeOptions) -> Result<()> {
    let state = ctx.sysroot.load()?;
    let merge = merge_deployment(&state, osname)?;

    let mut packages = merge.origin.requested_packages();
    for p in &options.packages_removed {
        if !packages.iter().any(|x| x == p) {
            return Err(DaemonError::NotFound(format!("Package {p} is not requested")).into());
        }
        packages.retain(|x| x != p);
    }
    for p in &options.packages_added {
        if !packages.iter().any(|x| x == p) {
            packages.push(p.clone());
        }
    }

    let mut origin = merge.origin.clone();
    origin.set_requested_packages(&packages);
    let checksum = merge.checksum.clone();
    let booted = state.booted.clone();

    ctx.check_cancelled()?;
    let new = ctx.backend.stage(osname, &checksum, &origin)?;
    let list = list_with_new_default(&state.deployments, new, booted.as_deref(), false);
    ctx.backend.write_deployments(&list)?;
    ctx.message(&format!(
        "Requested packages now: {}",
        if packages.is_empty() {
            "(none)".to_owned()
        } else {
            packages.join(" ")
        }
    ));
    Ok(())
}

async fn update_deployment(
    ctx: &TxnContext,
    osname: &str,
    modifiers: &UpdateDeploymentModifiers,
) -> Result<()> {
    let state = ctx.sysroot.load()?;
    let merge = merge_deployment(&state, osname)?;
    let base = merge.origin.refspec();

    let mut origin = merge.origin.clone();
    let refspec = match &modifiers.set_refspec {
        Some(r) => {
            let parsed = Refspec::parse_partial(r, base.as_deref())?;
            origin.set_refspec(&parsed.to_string());
            parsed
        }
        None => Refspec::parse(&merge.origin.require_refspec()?)?,
    };

    ctx.task_begin(&format!("Pulling {refspec}"));
    ctx.check_cancelled()?;
    ctx.backend.pull(&refspec, PullDepth::Full, ctx, ctx.token())?;
    ctx.task_end("Done");

    let checksum = match &modifiers.set_revision {
        Some(rev) => rev.clone(),
        None => ctx.backend.resolve(&refspec)?,
    };

    ctx.check_cancelled()?;
    let booted = state.booted.clone();
    let new = ctx.backend.stage(osname, &checksum, &origin)?;
    let list = list_with_new_default(&state.deployments, new, booted.as_deref(), false);
    ctx.backend.write_deployments(&list)?;
    ctx.message(&format!("Updated {osname} to {refspec} at {checksum}"));
    Ok(())
}

async fn set_initramfs_state(
    ctx: &TxnContext,
    osname: &str,
    regenerate: bool,
    args: &[String],
) -> Result<()> {
    if !regenerate && !args.is_empty() {
        anyhow::bail!("May not specify initramfs arguments without regeneration");
    }
    let state = ctx.sysroot.load()?;
    let merge = merge_deployment(&state, osname)?;
    if merge.origin.regenerate_initramfs() == regenerate && merge.origin.initramfs_args() == args {
        anyhow::bail!("Initramfs regeneration state is already {regenerate}");
    }

    let mut origin = merge.origin.clone();
    origin.set_regenerate_initramfs(regenerate, args);
    let checksum = merge.checksum.clone();
    let booted = state.booted.clone();

    ctx.check_cancelled()?;
    let new = ctx.backend.stage(osname, &checksum, &origin)?;
    let list = list_with_new_default(&state.deployments, new, booted.as_deref(), false);
    ctx.backend.write_deployments(&list)?;
    ctx.message(&format!("Initramfs regeneration: {regenerate}"));
    Ok(())
}

async fn kernel_args(ctx: &TxnContext, osname: &str, options: &KernelArgsOptions) -> Result<()> {
    let state = ctx.sysroot.load()?;
    let merge = merge_deployment(&state, osname)?;

    let existing = merge.origin.kernel_args();
    let edited = edit_kernel_args(&existing, &options.append, &options.replace, &options.delete)?;
    let mut origin = merge.origin.clone();
    origin.set_kernel_args(&edited);
    let checksum = merge.checksum.clone();
    let booted = state.booted.clone();

    ctx.check_cancelled()?;
    let new = ctx.backend.stage(osname, &checksum, &origin)?;
    let list = list_with_new_default(&state.deployments, new, booted.as_deref(), false);
    ctx.backend.write_deployments(&list)?;
    ctx.message(&format!("Kernel arguments now: {}", edited.join(" ")));
    Ok(())
}

/// Apply delete/replace/append edits to a kernel argument list.
///
/// Deletions match a whole argument first, then a bare key if that is
/// unambiguous. Replacements require the key to exist.
fn edit_kernel_args(
    existing: &[String],
    append: &[String],
    replace: &[String],
    delete: &[String],
) -> Result<Vec<String>> {
    fn key_of(arg: &str) -> &str {
        arg.split_once('=').map(|(k, _)| k).unwrap_or(arg)
    }

    let mut args: Vec<String> = existing.to_vec();
    for del in delete {
        if let Some(pos) = args.iter().position(|a| a == del) {
            args.remove(pos);
            continue;
        }
        let matches: Vec<usize> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| key_of(a) == del.as_str())
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [] => {
                return Err(DaemonError::NotFound(format!("No kernel argument {del}")).into());
            }
            [single] => {
                args.remove(*single);
            }
            _ => anyhow::bail!("Multiple kernel arguments match key {del}; delete by full value"),
        }
    }
    for rep in replace {
        let key = key_of(rep);
        let pos = args
            .iter()
            .position(|a| key_of(a) == key)
            .ok_or_else(|| DaemonError::NotFound(format!("No kernel argument {key}")))?;
        args[pos] = rep.clone();
    }
    for app in append {
        args.push(app.clone());
    }
    Ok(args)
}

async fn finalize_deployment(
    ctx: &TxnContext,
    osname: &str,
    options: &FinalizeOptions,
) -> Result<()> {
    let state = ctx.sysroot.load()?;
    let default =
        default_deployment_for(&state.deployments, osname).ok_or(DaemonError::MissingDeployment {
            osname: osname.to_owned(),
        })?;
    if state.booted.as_deref() == Some(default.id().as_str()) {
        anyhow::bail!("No pending deployment to finalize");
    }
    match &options.checksum {
        Some(expected) if expected != &default.checksum => {
            anyhow::bail!(
                "Expected pending base checksum {expected}, but found {}",
                default.checksum
            );
        }
        None if !options.allow_missing_checksum => {
            anyhow::bail!("Missing expected checksum; one must be provided");
        }
        _ => {}
    }
    ctx.check_cancelled()?;
    let path = ctx.sysroot.finalize_request_path(osname);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, format!("{}\n", default.checksum))
        .with_context(|| format!("Writing {path}"))?;
    ctx.message(&format!(
        "Finalization of {} queued for next boot",
        default.checksum
    ));
    Ok(())
}

async fn refresh_md(ctx: &TxnContext, osname: &str, options: &RefreshMdOptions) -> Result<()> {
    let state = ctx.sysroot.load()?;
    // Validates the osname even though the refresh is repository-wide
    let _ = merge_deployment(&state, osname)?;
    if options.force {
        ctx.message("Forcing metadata refresh");
    }
    ctx.task_begin("Updating metadata");
    ctx.check_cancelled()?;
    ctx.backend.refresh_metadata(ctx, ctx.token())?;
    Ok(())
}
