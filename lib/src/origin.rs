//! Per-deployment origin documents.
//!
//! An origin is a small keyfile attached to each deployment; its `refspec`
//! key names the branch the deployment came from. Groups and keys we do not
//! understand are preserved verbatim across edits.

use anyhow::Result;
use tini::Ini;

use crate::errors::DaemonError;

const ORIGIN_GROUP: &str = "origin";
const KEY_REFSPEC: &str = "refspec";

const PACKAGES_GROUP: &str = "packages";
const KEY_REQUESTED: &str = "requested";

const RPMOSTREE_GROUP: &str = "rpmostree";
const KEY_REGENERATE_INITRAMFS: &str = "regenerate-initramfs";
const KEY_INITRAMFS_ARGS: &str = "initramfs-args";
const KEY_KARGS: &str = "kargs";

/// The key/value document describing where a deployment came from.
pub struct Origin {
    ini: Ini,
}

impl Origin {
    /// A fresh origin tracking `refspec`.
    pub fn new(refspec: &str) -> Self {
        Self {
            ini: Ini::new().section(ORIGIN_GROUP).item(KEY_REFSPEC, refspec),
        }
    }

    /// An origin with no keys at all; operations requiring a refspec will
    /// fail with `MissingRefspec`.
    pub fn empty() -> Self {
        Self { ini: Ini::new() }
    }

    /// Parse an origin from keyfile text.
    pub fn parse(text: &str) -> Result<Self> {
        let ini = Ini::from_string(text).map_err(|e| anyhow::anyhow!("Parsing origin: {e}"))?;
        Ok(Self { ini })
    }

    /// Serialize back to keyfile text.
    pub fn to_keyfile(&self) -> String {
        self.ini.to_string()
    }

    /// The tracked refspec, if any.
    pub fn refspec(&self) -> Option<String> {
        self.ini.get::<String>(ORIGIN_GROUP, KEY_REFSPEC)
    }

    /// The tracked refspec, or a `MissingRefspec` error.
    pub fn require_refspec(&self) -> Result<String, DaemonError> {
        self.refspec()
            .ok_or_else(|| DaemonError::MissingRefspec("Origin has no refspec".into()))
    }

    /// Point the origin at a different branch.
    pub fn set_refspec(&mut self, refspec: &str) {
        self.edit(|ini| ini.section(ORIGIN_GROUP).item(KEY_REFSPEC, refspec));
    }

    /// Layered package requests.
    pub fn requested_packages(&self) -> Vec<String> {
        self.get_list(PACKAGES_GROUP, KEY_REQUESTED)
    }

    /// Replace the layered package request set.
    pub fn set_requested_packages(&mut self, packages: &[String]) {
        let joined = packages.join(", ");
        self.edit(|ini| ini.section(PACKAGES_GROUP).item(KEY_REQUESTED, joined));
    }

    /// Whether the client asked for a locally regenerated initramfs.
    pub fn regenerate_initramfs(&self) -> bool {
        self.ini
            .get::<bool>(RPMOSTREE_GROUP, KEY_REGENERATE_INITRAMFS)
            .unwrap_or(false)
    }

    /// Extra arguments handed to the initramfs generator.
    pub fn initramfs_args(&self) -> Vec<String> {
        self.get_list(RPMOSTREE_GROUP, KEY_INITRAMFS_ARGS)
    }

    /// Record the initramfs regeneration state.
    pub fn set_regenerate_initramfs(&mut self, enabled: bool, args: &[String]) {
        let joined = args.join(", ");
        self.edit(|ini| {
            ini.section(RPMOSTREE_GROUP)
                .item(KEY_REGENERATE_INITRAMFS, enabled)
                .item(KEY_INITRAMFS_ARGS, joined)
        });
    }

    /// Kernel arguments recorded for this deployment.
    pub fn kernel_args(&self) -> Vec<String> {
        self.get_list(RPMOSTREE_GROUP, KEY_KARGS)
    }

    /// Replace the recorded kernel arguments.
    pub fn set_kernel_args(&mut self, args: &[String]) {
        let joined = args.join(", ");
        self.edit(|ini| ini.section(RPMOSTREE_GROUP).item(KEY_KARGS, joined));
    }

    fn edit(&mut self, f: impl FnOnce(Ini) -> Ini) {
        let ini = std::mem::replace(&mut self.ini, Ini::new());
        self.ini = f(ini);
    }

    // An empty stored list reads back as one empty element; drop it
    fn get_list(&self, group: &str, key: &str) -> Vec<String> {
        self.ini
            .get_vec::<String>(group, key)
            .unwrap_or_default()
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl Clone for Origin {
    fn clone(&self) -> Self {
        // The backing keyfile round-trips losslessly through its own text
        Self {
            ini: Ini::from_string(&self.to_keyfile()).unwrap_or_else(|_| Ini::new()),
        }
    }
}

impl std::fmt::Debug for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Origin")
            .field("refspec", &self.refspec())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Origin {
    fn eq(&self, other: &Self) -> bool {
        self.to_keyfile() == other.to_keyfile()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;
    use similar_asserts::assert_eq;

    #[test]
    fn test_new_roundtrip() {
        let o = Origin::new("foo:bar");
        assert_eq!(o.refspec().as_deref(), Some("foo:bar"));
        let o2 = Origin::parse(&o.to_keyfile()).unwrap();
        assert_eq!(o, o2);
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let text = indoc! {"
            [origin]
            refspec = foo:bar
            unlocked = development

            [libostree]
            somefuture = 1
        "};
        let mut o = Origin::parse(text).unwrap();
        o.set_refspec("baz:bar");
        let out = o.to_keyfile();
        assert!(out.contains("unlocked"));
        assert!(out.contains("somefuture"));
        assert_eq!(o.refspec().as_deref(), Some("baz:bar"));
    }

    #[test]
    fn test_packages() {
        let mut o = Origin::new("foo:bar");
        assert!(o.requested_packages().is_empty());
        o.set_requested_packages(&["vim".into(), "tmux".into()]);
        let o = Origin::parse(&o.to_keyfile()).unwrap();
        assert_eq!(o.requested_packages(), vec!["vim", "tmux"]);
    }

    #[test]
    fn test_initramfs_state() {
        let mut o = Origin::new("foo:bar");
        assert!(!o.regenerate_initramfs());
        o.set_regenerate_initramfs(true, &["--add=iscsi".into()]);
        assert!(o.regenerate_initramfs());
        assert_eq!(o.initramfs_args(), vec!["--add=iscsi"]);
    }

    #[test]
    fn test_missing_refspec() {
        let o = Origin::empty();
        assert!(matches!(
            o.require_refspec(),
            Err(DaemonError::MissingRefspec(_))
        ));
    }
}
