//! Access to the on-disk image store.
//!
//! The commit/checkout machinery that writes this state is an external
//! collaborator; here we define the layout contract the daemon reads, the
//! advisory lock transactions hold while mutating it, and the small backend
//! interface transaction bodies drive.
//!
//! Layout under the sysroot path:
//!
//! ```text
//! ostree/repo/                      content repository; its mtime advances on commit
//! ostree/repo/refs/<remote>/<ref>   one file per branch, contents = commit checksum
//! ostree/repo/meta/<checksum>.json  optional commit metadata (version, timestamp)
//! ostree/deployments.json           the ordered deployment list
//! ostree/deploy/<os>/deploy/<checksum>.<serial>.origin
//! ostree/booted                     "<osname> <checksum> <serial>" of the running tree
//! ostree/lock                       the advisory exclusive lock
//! ```

use std::fs::File;
use std::io::Write as _;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use fn_error_context::context;
use fs2::FileExt;
use rustix::fs::MetadataExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::deployment::{deployment_id, Deployment};
use crate::errors::DaemonError;
use crate::origin::Origin;
use crate::progress::{DownloadProgress, ProgressSink};
use crate::refspec::Refspec;

/// A handle to the sysroot's on-disk layout.
#[derive(Debug, Clone)]
pub struct Sysroot {
    path: Utf8PathBuf,
}

/// Stat data used to suppress redundant reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePin {
    repo_mtime: i64,
    list_mtime: i64,
    list_ino: u64,
    list_len: u64,
}

/// One record in `deployments.json`; the origin lives in its own keyfile.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDeployment {
    osname: String,
    checksum: String,
    serial: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    signatures: Vec<String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredList {
    deployments: Vec<StoredDeployment>,
}

/// Optional per-commit metadata in `repo/meta/<checksum>.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CommitMeta {
    /// Human-readable version.
    #[serde(default)]
    pub version: Option<String>,
    /// Commit creation time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Signatures over the commit.
    #[serde(default)]
    pub signatures: Vec<String>,
}

/// A loaded snapshot of the deployment state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedState {
    /// Ordered deployments; index 0 is default-on-next-boot.
    pub deployments: Vec<Deployment>,
    /// Id of the deployment matching the running system, if any.
    pub booted: Option<String>,
}

impl Sysroot {
    /// Bind to a sysroot path; no I/O happens here.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The bound path.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn ostree_dir(&self) -> Utf8PathBuf {
        self.path.join("ostree")
    }

    /// The directory the change monitor watches.
    pub fn monitored_dir(&self) -> Utf8PathBuf {
        self.ostree_dir()
    }

    /// The content repository directory.
    pub fn repo_dir(&self) -> Utf8PathBuf {
        self.ostree_dir().join("repo")
    }

    fn list_path(&self) -> Utf8PathBuf {
        self.ostree_dir().join("deployments.json")
    }

    fn booted_path(&self) -> Utf8PathBuf {
        self.ostree_dir().join("booted")
    }

    fn lock_path(&self) -> Utf8PathBuf {
        self.ostree_dir().join("lock")
    }

    fn deploy_dir(&self, osname: &str) -> Utf8PathBuf {
        self.ostree_dir().join("deploy").join(osname).join("deploy")
    }

    fn origin_path(&self, osname: &str, checksum: &str, serial: u32) -> Utf8PathBuf {
        self.deploy_dir(osname)
            .join(format!("{checksum}.{serial}.origin"))
    }

    /// Marker consumed by the boot-time machinery when a deployment's
    /// finalization has been explicitly requested.
    pub(crate) fn finalize_request_path(&self, osname: &str) -> Utf8PathBuf {
        self.ostree_dir()
            .join("deploy")
            .join(osname)
            .join("finalize-request")
    }

    /// Verify the path looks like an image root.
    #[context("Validating sysroot")]
    pub fn ensure_valid(&self) -> Result<()> {
        if !self.repo_dir().try_exists()? {
            return Err(DaemonError::InvalidSysroot(format!(
                "{} has no ostree repository",
                self.path
            ))
            .into());
        }
        Ok(())
    }

    /// Current stat pin for change suppression.
    #[context("Reading store stat")]
    pub fn pin(&self) -> Result<StorePin> {
        let repo = std::fs::metadata(self.repo_dir().as_std_path())
            .with_context(|| format!("stat {}", self.repo_dir()))?;
        let (list_mtime, list_ino, list_len) = match std::fs::metadata(self.list_path()) {
            Ok(m) => (m.mtime(), m.ino(), m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, 0, 0),
            Err(e) => return Err(e).with_context(|| format!("stat {}", self.list_path())),
        };
        Ok(StorePin {
            repo_mtime: repo.mtime(),
            list_mtime,
            list_ino,
            list_len,
        })
    }

    /// Load the full deployment state from disk.
    #[context("Loading deployments")]
    pub fn load(&self) -> Result<LoadedState> {
        let stored: StoredList = match std::fs::read_to_string(self.list_path()) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("Parsing {}", self.list_path()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoredList::default(),
            Err(e) => return Err(e).with_context(|| format!("Reading {}", self.list_path())),
        };

        let mut deployments = Vec::with_capacity(stored.deployments.len());
        for (index, d) in stored.deployments.into_iter().enumerate() {
            let origin_path = self.origin_path(&d.osname, &d.checksum, d.serial);
            let origin = match std::fs::read_to_string(&origin_path) {
                Ok(text) => Origin::parse(&text)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("Deployment without origin: {origin_path}");
                    Origin::empty()
                }
                Err(e) => return Err(e).with_context(|| format!("Reading {origin_path}")),
            };
            deployments.push(Deployment {
                osname: d.osname,
                checksum: d.checksum,
                serial: d.serial,
                index,
                origin,
                version: d.version,
                signatures: d.signatures,
                timestamp: d.timestamp,
            });
        }

        let booted = self.read_booted()?;
        crate::deployment::validate_list(&deployments, booted.as_deref())?;
        Ok(LoadedState {
            deployments,
            booted,
        })
    }

    fn read_booted(&self) -> Result<Option<String>> {
        let text = match std::fs::read_to_string(self.booted_path()) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Reading {}", self.booted_path())),
        };
        let mut parts = text.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(osname), Some(checksum), Some(serial)) => {
                let serial: u32 = serial
                    .parse()
                    .with_context(|| format!("Parsing {}", self.booted_path()))?;
                Ok(Some(deployment_id(osname, checksum, serial)))
            }
            _ => {
                tracing::warn!("Malformed booted marker at {}", self.booted_path());
                Ok(None)
            }
        }
    }

    /// Atomically replace the deployment list document and write out each
    /// deployment's origin keyfile.
    #[context("Writing deployments")]
    pub fn write_deployments(&self, deployments: &[Deployment]) -> Result<()> {
        for d in deployments {
            let path = self.origin_path(&d.osname, &d.checksum, d.serial);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, d.origin.to_keyfile())
                .with_context(|| format!("Writing {path}"))?;
        }
        let stored = StoredList {
            deployments: deployments
                .iter()
                .map(|d| StoredDeployment {
                    osname: d.osname.clone(),
                    checksum: d.checksum.clone(),
                    serial: d.serial,
                    version: d.version.clone(),
                    signatures: d.signatures.clone(),
                    timestamp: d.timestamp,
                })
                .collect(),
        };
        // Replacement must be atomic: writers may race with property reads
        let tmp = tempfile::NamedTempFile::new_in(self.ostree_dir())?;
        serde_json::to_writer_pretty(tmp.as_file(), &stored)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.list_path())
            .map_err(|e| anyhow::anyhow!("Persisting deployment list: {e}"))?;
        Ok(())
    }

    /// Next unused serial for a given (osname, checksum).
    fn next_serial(&self, osname: &str, checksum: &str) -> Result<u32> {
        let dir = self.deploy_dir(osname);
        let mut max: Option<u32> = None;
        let entries = match std::fs::read_dir(dir.as_std_path()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("Reading {dir}")),
        };
        for entry in entries {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name
                .strip_prefix(checksum)
                .and_then(|r| r.strip_prefix('.'))
                .and_then(|r| r.strip_suffix(".origin"))
            else {
                continue;
            };
            if let Ok(serial) = rest.parse::<u32>() {
                max = Some(max.map_or(serial, |m| m.max(serial)));
            }
        }
        Ok(max.map_or(0, |m| m + 1))
    }
}

/// Exclusive advisory lock over the sysroot; held by the active transaction
/// for as long as its body runs.
#[derive(Debug)]
pub struct SysrootLock {
    file: File,
    path: Utf8PathBuf,
}

impl SysrootLock {
    /// Try to take the lock without blocking.
    pub fn acquire(sysroot: &Sysroot) -> Result<Self> {
        let path = sysroot.lock_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path.as_std_path()).with_context(|| format!("Opening {path}"))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("Acquired sysroot lock {path}");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(DaemonError::Busy(
                "Transaction in progress: sysroot is locked".into(),
            )
            .into()),
            Err(e) => Err(e).with_context(|| format!("Locking {path}")),
        }
    }
}

impl Drop for SysrootLock {
    fn drop(&mut self) {
        // Unlock failures only matter for diagnostics; the fd close releases
        // the lock regardless
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!("Failed to unlock {}: {e}", self.path);
        } else {
            tracing::debug!("Released sysroot lock {}", self.path);
        }
    }
}

/// How much of an update a pull should fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDepth {
    /// Only refs and commit metadata.
    Metadata,
    /// Everything.
    Full,
}

/// The lower-level machinery transactions orchestrate.
///
/// The daemon never fetches or unpacks content itself; bodies call these
/// operations and forward their progress.
pub trait StoreBackend: Send + Sync + std::fmt::Debug {
    /// Resolve a refspec to a commit checksum.
    fn resolve(&self, refspec: &Refspec) -> Result<String>;

    /// Fetch the branch content (or just its metadata).
    fn pull(
        &self,
        refspec: &Refspec,
        depth: PullDepth,
        progress: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> Result<()>;

    /// Commit metadata for a checksum, if the repository has any.
    fn commit_meta(&self, checksum: &str) -> Result<CommitMeta>;

    /// Materialize a new deployment of `checksum` with the given origin.
    fn stage(&self, osname: &str, checksum: &str, origin: &Origin) -> Result<Deployment>;

    /// Atomically publish a new deployment list.
    fn write_deployments(&self, deployments: &[Deployment]) -> Result<()>;

    /// Refresh cached repository metadata.
    fn refresh_metadata(&self, progress: &dyn ProgressSink, token: &CancellationToken)
        -> Result<()>;

    /// Prune unreferenced content from the repository.
    fn prune(&self, progress: &dyn ProgressSink, token: &CancellationToken) -> Result<()>;
}

/// Backend operating directly on the local layout; no network I/O.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    sysroot: Sysroot,
}

impl LocalBackend {
    /// Bind to the same sysroot the daemon serves.
    pub fn new(sysroot: Sysroot) -> Self {
        Self { sysroot }
    }

    fn ref_path(&self, refspec: &Refspec) -> Utf8PathBuf {
        let refs = self.sysroot.repo_dir().join("refs");
        match &refspec.remote {
            Some(remote) => refs.join(remote).join(&refspec.name),
            None => refs.join(&refspec.name),
        }
    }
}

impl StoreBackend for LocalBackend {
    #[context("Resolving refspec")]
    fn resolve(&self, refspec: &Refspec) -> Result<String> {
        let path = self.ref_path(refspec);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(
                    DaemonError::InvalidRefspec(format!("No such branch: {refspec}")).into(),
                );
            }
            Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
        };
        let checksum = text.trim();
        if checksum.is_empty() {
            return Err(DaemonError::InvalidRefspec(format!("Empty branch: {refspec}")).into());
        }
        Ok(checksum.to_owned())
    }

    fn pull(
        &self,
        refspec: &Refspec,
        depth: PullDepth,
        progress: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(DaemonError::Cancelled.into());
        }
        // A local repository has nothing to transfer; surface the same
        // progress shape remote pulls would.
        let checksum = self.resolve(refspec)?;
        progress.download_progress(DownloadProgress {
            requested: 1,
            fetched: 1,
            metadata_fetched: if depth == PullDepth::Metadata { 1 } else { 0 },
            ..Default::default()
        });
        let meta = self.commit_meta(&checksum)?;
        for sig in &meta.signatures {
            progress.signature_progress(true, &checksum);
            tracing::trace!("signature {sig} for {checksum}");
        }
        Ok(())
    }

    fn commit_meta(&self, checksum: &str) -> Result<CommitMeta> {
        let path = self.sysroot.repo_dir().join(format!("meta/{checksum}.json"));
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                serde_json::from_str(&text).with_context(|| format!("Parsing {path}"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CommitMeta::default()),
            Err(e) => Err(e).with_context(|| format!("Reading {path}")),
        }
    }

    #[context("Staging deployment")]
    fn stage(&self, osname: &str, checksum: &str, origin: &Origin) -> Result<Deployment> {
        let serial = self.sysroot.next_serial(osname, checksum)?;
        let meta = self.commit_meta(checksum)?;
        let origin_path = self.sysroot.origin_path(osname, checksum, serial);
        if let Some(parent) = origin_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&origin_path, origin.to_keyfile())
            .with_context(|| format!("Writing {origin_path}"))?;
        Ok(Deployment {
            osname: osname.to_owned(),
            checksum: checksum.to_owned(),
            serial,
            index: 0,
            origin: origin.clone(),
            version: meta.version,
            signatures: meta.signatures,
            timestamp: meta.timestamp.unwrap_or_else(Utc::now),
        })
    }

    fn write_deployments(&self, deployments: &[Deployment]) -> Result<()> {
        self.sysroot.write_deployments(deployments)?;
        // Writing the list is the moment "the repository changed" for any
        // watcher; bump the repo dir mtime like a real commit would.
        touch_dir(&self.sysroot.repo_dir())?;
        Ok(())
    }

    fn refresh_metadata(
        &self,
        progress: &dyn ProgressSink,
        token: &CancellationToken,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(DaemonError::Cancelled.into());
        }
        let stamp = self.sysroot.repo_dir().join("md-refreshed");
        let mut f = File::create(stamp.as_std_path())?;
        writeln!(f, "{}", Utc::now().to_rfc3339())?;
        progress.task_end("Metadata refreshed");
        Ok(())
    }

    fn prune(&self, progress: &dyn ProgressSink, token: &CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(DaemonError::Cancelled.into());
        }
        progress.message("Pruning repository");
        Ok(())
    }
}

fn touch_dir(path: &Utf8Path) -> Result<()> {
    let marker = path.join(".changed");
    std::fs::write(marker.as_std_path(), b"")?;
    std::fs::remove_file(marker.as_std_path())?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A scratch sysroot with a repo, one branch and one deployment.
    pub(crate) struct SysrootFixture {
        pub(crate) sysroot: Sysroot,
        _tempdir: tempfile::TempDir,
    }

    pub(crate) const OSNAME: &str = "fedora-coreos";
    pub(crate) const BASE_CHECKSUM: &str =
        "3a4f6a4ad6de1e4a8820136eae1c822cd21e40b45febf9e9a20fbb6a0c7b08e1";
    pub(crate) const BASE_REFSPEC: &str = "remote:stable";

    impl SysrootFixture {
        pub(crate) fn sysroot(&self) -> &Sysroot {
            &self.sysroot
        }

        pub(crate) fn backend(&self) -> LocalBackend {
            LocalBackend::new(self.sysroot.clone())
        }

        /// Point `refspec` at `checksum`, creating the commit metadata.
        pub(crate) fn set_ref(&self, refspec: &str, checksum: &str, version: &str) {
            let refspec = Refspec::parse(refspec).unwrap();
            let backend = self.backend();
            let path = backend.ref_path(&refspec);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, format!("{checksum}\n")).unwrap();
            let meta = self.sysroot.repo_dir().join("meta");
            std::fs::create_dir_all(&meta).unwrap();
            std::fs::write(
                meta.join(format!("{checksum}.json")),
                serde_json::to_string(&CommitMeta {
                    version: Some(version.to_owned()),
                    timestamp: Some(Utc::now()),
                    signatures: Vec::new(),
                })
                .unwrap(),
            )
            .unwrap();
        }

        pub(crate) fn mark_booted(&self, d: &Deployment) {
            std::fs::write(
                self.sysroot.booted_path(),
                format!("{} {} {}\n", d.osname, d.checksum, d.serial),
            )
            .unwrap();
        }
    }

    pub(crate) fn sysroot_fixture() -> SysrootFixture {
        let tempdir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tempdir.path()).unwrap().to_owned();
        let sysroot = Sysroot::new(path);
        std::fs::create_dir_all(sysroot.repo_dir()).unwrap();
        let fixture = SysrootFixture {
            sysroot,
            _tempdir: tempdir,
        };
        fixture.set_ref(BASE_REFSPEC, BASE_CHECKSUM, "41.1");
        let backend = fixture.backend();
        let deployment = backend
            .stage(OSNAME, BASE_CHECKSUM, &Origin::new(BASE_REFSPEC))
            .unwrap();
        backend.write_deployments(&[deployment]).unwrap();
        fixture
    }
}

#[cfg(test)]
mod test {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_load_roundtrip() {
        let fx = sysroot_fixture();
        let state = fx.sysroot().load().unwrap();
        assert_eq!(state.deployments.len(), 1);
        let d = &state.deployments[0];
        assert_eq!(d.osname, OSNAME);
        assert_eq!(d.checksum, BASE_CHECKSUM);
        assert_eq!(d.serial, 0);
        assert_eq!(d.index, 0);
        assert_eq!(d.version.as_deref(), Some("41.1"));
        assert_eq!(d.origin.refspec().as_deref(), Some(BASE_REFSPEC));
        assert!(state.booted.is_none());
    }

    #[test]
    fn test_booted_marker() {
        let fx = sysroot_fixture();
        let state = fx.sysroot().load().unwrap();
        fx.mark_booted(&state.deployments[0]);
        let state = fx.sysroot().load().unwrap();
        assert_eq!(state.booted.as_deref(), Some(state.deployments[0].id().as_str()));
    }

    #[test]
    fn test_serial_advances() {
        let fx = sysroot_fixture();
        let backend = fx.backend();
        let d = backend
            .stage(OSNAME, BASE_CHECKSUM, &Origin::new(BASE_REFSPEC))
            .unwrap();
        assert_eq!(d.serial, 1);
        let d2 = backend
            .stage(OSNAME, BASE_CHECKSUM, &Origin::new(BASE_REFSPEC))
            .unwrap();
        assert_eq!(d2.serial, 2);
    }

    #[test]
    fn test_pin_changes_on_write() {
        let fx = sysroot_fixture();
        let before = fx.sysroot().pin().unwrap();
        assert_eq!(before, fx.sysroot().pin().unwrap());
        let backend = fx.backend();
        let d = backend
            .stage(OSNAME, BASE_CHECKSUM, &Origin::new(BASE_REFSPEC))
            .unwrap();
        let state = fx.sysroot().load().unwrap();
        let list = crate::deployment::list_with_new_default(&state.deployments, d, None, false);
        backend.write_deployments(&list).unwrap();
        assert_ne!(before, fx.sysroot().pin().unwrap());
    }

    #[test]
    fn test_lock_exclusive() {
        let fx = sysroot_fixture();
        let lock = SysrootLock::acquire(fx.sysroot()).unwrap();
        let second = SysrootLock::acquire(fx.sysroot());
        let err = second.err().unwrap();
        assert_eq!(
            DaemonError::from_chain(&err).name(),
            "org.projectatomic.rpmostreed.Error.UpdateInProgress"
        );
        drop(lock);
        SysrootLock::acquire(fx.sysroot()).unwrap();
    }

    #[test]
    fn test_resolve_missing_branch() {
        let fx = sysroot_fixture();
        let backend = fx.backend();
        let missing = Refspec::parse("remote:nosuch").unwrap();
        let err = backend.resolve(&missing).unwrap_err();
        assert!(matches!(
            DaemonError::from_chain(&err),
            DaemonError::InvalidRefspec(_)
        ));
    }

    #[test]
    fn test_invalid_sysroot() {
        let td = tempfile::tempdir().unwrap();
        let sysroot = Sysroot::new(Utf8Path::from_path(td.path()).unwrap().to_owned());
        assert!(sysroot.ensure_valid().is_err());
    }
}
