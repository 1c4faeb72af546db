//! The deployment value model.
//!
//! A deployment is one bootable tree in the sysroot's ordered list. The
//! authoritative copy lives on disk; everything here is a snapshot plus the
//! pure selection and ordering logic shared by all transaction kinds.

use chrono::{DateTime, Utc};

use crate::errors::DaemonError;
use crate::origin::Origin;

/// One entry in the ordered deployment list.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    /// Operating system name this deployment belongs to.
    pub osname: String,
    /// Content checksum of the deployed tree.
    pub checksum: String,
    /// Distinguishes re-deployments of the same content.
    pub serial: u32,
    /// Position in the list; 0 is default-on-next-boot.
    pub index: usize,
    /// The origin document.
    pub origin: Origin,
    /// Version string from the commit metadata, if any.
    pub version: Option<String>,
    /// Signatures attached to the commit, if any.
    pub signatures: Vec<String>,
    /// When the deployed commit was created.
    pub timestamp: DateTime<Utc>,
}

impl Deployment {
    /// The stable external identifier, `"{osname}_{hash}"`.
    pub fn id(&self) -> String {
        deployment_id(&self.osname, &self.checksum, self.serial)
    }
}

// djb2, the classic keyfile/GLib string hash
fn str_hash(s: &str) -> u32 {
    s.bytes()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(b as u32))
}

/// Deterministic deployment identifier from the identity triple.
pub fn deployment_id(osname: &str, checksum: &str, serial: u32) -> String {
    let hash = str_hash(osname)
        .wrapping_add(str_hash(checksum))
        .wrapping_add(serial);
    format!("{osname}_{hash}")
}

/// The default (next-boot) deployment: list head.
pub fn default_deployment(deployments: &[Deployment]) -> Option<&Deployment> {
    deployments.first()
}

/// The default deployment for one osname.
pub fn default_deployment_for<'d>(
    deployments: &'d [Deployment],
    osname: &str,
) -> Option<&'d Deployment> {
    deployments.iter().find(|d| d.osname == osname)
}

/// The entry matching the currently running system, if any.
pub fn booted_deployment<'d>(
    deployments: &'d [Deployment],
    booted_id: Option<&str>,
) -> Option<&'d Deployment> {
    let booted_id = booted_id?;
    deployments.iter().find(|d| d.id() == booted_id)
}

/// The deployment a rollback would boot into: the first entry sharing the
/// booted deployment's osname that appears after it in the list.
pub fn rollback_deployment<'d>(
    deployments: &'d [Deployment],
    booted: &Deployment,
) -> Option<&'d Deployment> {
    deployments
        .iter()
        .filter(|d| d.index > booted.index)
        .find(|d| d.osname == booted.osname)
}

/// Sort a filtered list back into boot order.
pub fn sort_by_index(deployments: &mut [Deployment]) {
    deployments.sort_by_key(|d| d.index);
}

/// Check the structural invariants of a loaded list: unique identity
/// triples, contiguous indexes, at most one booted entry.
pub fn validate_list(deployments: &[Deployment], booted_id: Option<&str>) -> anyhow::Result<()> {
    let mut seen = std::collections::HashSet::new();
    let mut booted_count = 0usize;
    for (i, d) in deployments.iter().enumerate() {
        if d.index != i {
            anyhow::bail!(
                "Deployment {} has index {} at position {i}",
                d.id(),
                d.index
            );
        }
        if !seen.insert((d.osname.clone(), d.checksum.clone(), d.serial)) {
            anyhow::bail!("Duplicate deployment {}", d.id());
        }
        if booted_id == Some(d.id().as_str()) {
            booted_count += 1;
        }
    }
    if booted_count > 1 {
        anyhow::bail!("More than one booted deployment");
    }
    Ok(())
}

/// The list that results from making `new` the next-boot default.
///
/// The new deployment lands at index 0. The booted deployment is always
/// retained; other deployments of the same osname are dropped (they were
/// pending or rollback state now superseded) unless `retain` asks to keep
/// them. Deployments of unrelated osnames are untouched.
pub fn list_with_new_default(
    current: &[Deployment],
    new: Deployment,
    booted_id: Option<&str>,
    retain: bool,
) -> Vec<Deployment> {
    let mut out = Vec::with_capacity(current.len() + 1);
    out.push(new);
    for d in current {
        let is_booted = booted_id == Some(d.id().as_str());
        if is_booted || retain || d.osname != out[0].osname {
            out.push(d.clone());
        }
    }
    reindex(&mut out);
    out
}

/// The list that results from rolling back: the rollback target is promoted
/// to index 0, everything else keeps its relative order.
pub fn list_rotated_for_rollback(
    current: &[Deployment],
    booted_id: Option<&str>,
    osname: &str,
) -> Result<Vec<Deployment>, DaemonError> {
    // Roll back relative to the booted deployment when there is one for this
    // os; otherwise relative to the current default.
    let pivot = booted_deployment(current, booted_id)
        .filter(|d| d.osname == osname)
        .or_else(|| default_deployment_for(current, osname))
        .ok_or_else(|| DaemonError::MissingDeployment {
            osname: osname.to_owned(),
        })?;
    let target = rollback_deployment(current, pivot)
        .ok_or_else(|| DaemonError::NotFound(format!("No rollback deployment for os {osname}")))?;
    let target_id = target.id();

    let mut out = Vec::with_capacity(current.len());
    out.push(target.clone());
    for d in current {
        if d.id() != target_id {
            out.push(d.clone());
        }
    }
    reindex(&mut out);
    Ok(out)
}

fn reindex(deployments: &mut [Deployment]) {
    for (i, d) in deployments.iter_mut().enumerate() {
        d.index = i;
    }
}

#[cfg(test)]
pub(crate) fn mkdeployment(osname: &str, checksum: &str, serial: u32, index: usize) -> Deployment {
    Deployment {
        osname: osname.into(),
        checksum: checksum.into(),
        serial,
        index,
        origin: Origin::new("remote:stable"),
        version: None,
        signatures: Vec::new(),
        timestamp: DateTime::<Utc>::UNIX_EPOCH,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_id_deterministic() {
        let a = deployment_id("fedora", "abc123", 0);
        let b = deployment_id("fedora", "abc123", 0);
        assert_eq!(a, b);
        assert!(a.starts_with("fedora_"));
        // Any component changing changes the id
        assert_ne!(a, deployment_id("fedora", "abc123", 1));
        assert_ne!(a, deployment_id("fedora", "abc124", 0));
        assert_ne!(a, deployment_id("centos", "abc123", 0));
    }

    #[test]
    fn test_selection() {
        let list = vec![
            mkdeployment("fedora", "aaa", 0, 0),
            mkdeployment("fedora", "bbb", 0, 1),
            mkdeployment("fedora", "ccc", 0, 2),
        ];
        let booted_id = list[1].id();
        assert_eq!(default_deployment(&list).unwrap().checksum, "aaa");
        let booted = booted_deployment(&list, Some(&booted_id)).unwrap();
        assert_eq!(booted.checksum, "bbb");
        // Rollback is the next same-os entry after the booted one
        assert_eq!(rollback_deployment(&list, booted).unwrap().checksum, "ccc");
        // No rollback when booted is last
        let last = &list[2];
        assert!(rollback_deployment(&list, last).is_none());

        // A filtered list sorts back into boot order
        let mut shuffled = vec![list[2].clone(), list[0].clone()];
        sort_by_index(&mut shuffled);
        assert_eq!(shuffled[0].checksum, "aaa");
    }

    #[test]
    fn test_rollback_skips_other_os() {
        let list = vec![
            mkdeployment("fedora", "aaa", 0, 0),
            mkdeployment("centos", "xxx", 0, 1),
            mkdeployment("fedora", "bbb", 0, 2),
        ];
        let booted = &list[0];
        assert_eq!(rollback_deployment(&list, booted).unwrap().checksum, "bbb");
    }

    #[test]
    fn test_validate() {
        let list = vec![
            mkdeployment("fedora", "aaa", 0, 0),
            mkdeployment("fedora", "aaa", 1, 1),
        ];
        validate_list(&list, None).unwrap();

        let dup = vec![
            mkdeployment("fedora", "aaa", 0, 0),
            mkdeployment("fedora", "aaa", 0, 1),
        ];
        assert!(validate_list(&dup, None).is_err());

        let skewed = vec![mkdeployment("fedora", "aaa", 0, 3)];
        assert!(validate_list(&skewed, None).is_err());
    }

    #[test]
    fn test_new_default_drops_pending() {
        let list = vec![
            mkdeployment("fedora", "pending", 0, 0),
            mkdeployment("fedora", "booted", 0, 1),
        ];
        let booted_id = list[1].id();
        let new = mkdeployment("fedora", "newer", 0, 0);
        let out = list_with_new_default(&list, new, Some(&booted_id), false);
        let sums: Vec<_> = out.iter().map(|d| d.checksum.as_str()).collect();
        assert_eq!(sums, vec!["newer", "booted"]);
        assert_eq!(out.iter().map(|d| d.index).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_new_default_retain() {
        let list = vec![mkdeployment("fedora", "old", 0, 0)];
        let new = mkdeployment("fedora", "newer", 0, 0);
        let out = list_with_new_default(&list, new, None, true);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_new_default_keeps_other_os() {
        let list = vec![
            mkdeployment("centos", "xxx", 0, 0),
            mkdeployment("fedora", "old", 0, 1),
        ];
        let new = mkdeployment("fedora", "newer", 0, 0);
        let out = list_with_new_default(&list, new, None, false);
        let names: Vec<_> = out.iter().map(|d| d.checksum.as_str()).collect();
        assert_eq!(names, vec!["newer", "xxx"]);
    }

    #[test]
    fn test_rollback_rotation() {
        let list = vec![
            mkdeployment("fedora", "aaa", 0, 0),
            mkdeployment("fedora", "bbb", 0, 1),
        ];
        let booted_id = list[0].id();
        let out = list_rotated_for_rollback(&list, Some(&booted_id), "fedora").unwrap();
        let sums: Vec<_> = out.iter().map(|d| d.checksum.as_str()).collect();
        assert_eq!(sums, vec!["bbb", "aaa"]);
        validate_list(&out, Some(&booted_id)).unwrap();
    }

    #[test]
    fn test_rollback_without_booted_uses_default() {
        let list = vec![
            mkdeployment("fedora", "aaa", 0, 0),
            mkdeployment("fedora", "bbb", 0, 1),
        ];
        let out = list_rotated_for_rollback(&list, None, "fedora").unwrap();
        assert_eq!(out[0].checksum, "bbb");
    }

    #[test]
    fn test_rollback_missing_os() {
        let list = vec![mkdeployment("fedora", "aaa", 0, 0)];
        assert!(matches!(
            list_rotated_for_rollback(&list, None, "centos"),
            Err(DaemonError::MissingDeployment { .. })
        ));
        // Only one deployment: nothing to roll back to
        assert!(matches!(
            list_rotated_for_rollback(&list, None, "fedora"),
            Err(DaemonError::NotFound(_))
        ));
    }
}
