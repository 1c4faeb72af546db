//! Parsing and completion of partial refspecs.
//!
//! Callers may hand us a bare remote (`"baz:"`), a local branch (`":baz"`),
//! or a full `remote:ref`; anything missing is filled in from the refspec the
//! deployment currently tracks.

use crate::errors::DaemonError;

/// A parsed `remote:ref` pair; a missing remote denotes a local branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refspec {
    /// The remote name, if any.
    pub remote: Option<String>,
    /// The branch name.
    pub name: String,
}

impl std::fmt::Display for Refspec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.remote {
            Some(remote) => write!(f, "{}:{}", remote, self.name),
            None => f.write_str(&self.name),
        }
    }
}

fn invalid(msg: impl Into<String>) -> DaemonError {
    DaemonError::InvalidRefspec(msg.into())
}

/// Split a complete refspec into its optional remote and ref parts.
fn split(refspec: &str) -> Result<(Option<&str>, &str), DaemonError> {
    match refspec.split_once(':') {
        Some((remote, name)) => {
            if remote.is_empty() || name.is_empty() || name.contains(':') {
                return Err(invalid(format!("Invalid refspec {refspec}")));
            }
            Ok((Some(remote), name))
        }
        None => {
            if refspec.is_empty() {
                return Err(invalid("Empty refspec"));
            }
            Ok((None, refspec))
        }
    }
}

impl Refspec {
    /// Parse a complete refspec string.
    pub fn parse(refspec: &str) -> Result<Self, DaemonError> {
        let (remote, name) = split(refspec)?;
        Ok(Self {
            remote: remote.map(ToOwned::to_owned),
            name: name.to_owned(),
        })
    }

    /// Take a possibly partial refspec and fill in any missing bits from
    /// `base`, the refspec the origin currently tracks.
    ///
    /// A trailing `:` switches remotes and inherits the ref; a leading `:`
    /// switches to a local branch and never inherits a remote. The result
    /// must differ from `base` in at least one field.
    pub fn parse_partial(new: &str, base: Option<&str>) -> Result<Self, DaemonError> {
        let mut remote: Option<String> = None;
        let mut name: Option<String> = None;
        // Allow just switching remotes, and switching to a local branch
        let mut infer_remote = true;

        if let Some(r) = new.strip_suffix(':') {
            if r.is_empty() || r.contains(':') {
                return Err(invalid(format!("Invalid refspec {new}")));
            }
            remote = Some(r.to_owned());
        } else if let Some(n) = new.strip_prefix(':') {
            if n.is_empty() || n.contains(':') {
                return Err(invalid(format!("Invalid refspec {new}")));
            }
            infer_remote = false;
            name = Some(n.to_owned());
        } else {
            let (r, n) = split(new)?;
            remote = r.map(ToOwned::to_owned);
            name = Some(n.to_owned());
        }

        let base = base.map(Refspec::parse).transpose()?;

        if name.is_none() {
            match base.as_ref().map(|b| b.name.clone()) {
                Some(n) => name = Some(n),
                None => return Err(invalid("Could not determine default ref to pull")),
            }
        } else if infer_remote && remote.is_none() {
            remote = base.as_ref().and_then(|b| b.remote.clone());
        }

        let parsed = Self {
            remote,
            // SAFETY: both branches above guarantee a ref by this point
            name: name.unwrap(),
        };
        if let Some(base) = base {
            if parsed == base {
                return Err(invalid("Old and new refs are equal"));
            }
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn partial(new: &str, base: &str) -> Result<String, DaemonError> {
        Refspec::parse_partial(new, Some(base)).map(|r| r.to_string())
    }

    #[test]
    fn test_bare_remote_inherits_ref() {
        assert_eq!(partial("baz:", "foo:bar").unwrap(), "baz:bar");
    }

    #[test]
    fn test_local_branch_drops_remote() {
        assert_eq!(partial(":baz", "foo:bar").unwrap(), "baz");
    }

    #[test]
    fn test_full_refspec_verbatim() {
        assert_eq!(partial("a:b", "foo:bar").unwrap(), "a:b");
    }

    #[test]
    fn test_bare_ref_inherits_remote() {
        assert_eq!(partial("baz", "foo:bar").unwrap(), "foo:baz");
        // No remote in the base either: stays local
        assert_eq!(partial("baz", "bar").unwrap(), "baz");
    }

    #[test]
    fn test_equality_rejected() {
        assert!(matches!(
            partial("foo:bar", "foo:bar"),
            Err(DaemonError::InvalidRefspec(_))
        ));
        // Also via inheritance paths
        assert!(partial("foo:", "foo:bar").is_err());
        assert!(partial("bar", "bar").is_err());
    }

    #[test]
    fn test_no_default_ref() {
        assert!(matches!(
            Refspec::parse_partial("baz:", None),
            Err(DaemonError::InvalidRefspec(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        for bad in ["", ":", "a:b:c", "a::b"] {
            assert!(Refspec::parse_partial(bad, Some("foo:bar")).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_idempotent() {
        // Re-parsing a successful render against the same base is stable
        for (new, base) in [("baz:", "foo:bar"), ("baz", "foo:bar"), ("a:b", "foo:bar")] {
            let first = partial(new, base).unwrap();
            assert_eq!(partial(&first, base).unwrap(), first);
        }
    }
}
