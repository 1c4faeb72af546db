//! Daemon configuration file handling.
//!
//! A single ini-style file, group `[Daemon]`. An absent file is not an
//! error; an unparseable value is logged and the default substituted, so a
//! bad edit never takes the daemon down.

use std::str::FromStr;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

/// Fixed location of the daemon configuration.
pub const CONFIG_PATH: &str = "/etc/rpm-ostreed.conf";

const DAEMON_GROUP: &str = "Daemon";
const DEFAULT_IDLE_EXIT_TIMEOUT: u64 = 60;

/// How far the automatic update trigger goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
    /// Automatic updates are disabled.
    #[default]
    None,
    /// Only download metadata to check for available updates.
    Check,
    /// Download and stage the update for the next boot.
    Stage,
}

impl FromStr for UpdatePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(UpdatePolicy::None),
            "check" => Ok(UpdatePolicy::Check),
            "stage" | "ex-stage" => Ok(UpdatePolicy::Stage),
            o => anyhow::bail!("Invalid automatic update policy: {o}"),
        }
    }
}

impl std::fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdatePolicy::None => "none",
            UpdatePolicy::Check => "check",
            UpdatePolicy::Stage => "stage",
        };
        f.write_str(s)
    }
}

/// Scalar settings read from the `[Daemon]` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Seconds of idleness before the process exits; 0 disables idle exit.
    pub idle_exit_timeout: u64,
    /// Policy applied by the automatic update trigger.
    pub automatic_update_policy: UpdatePolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            idle_exit_timeout: DEFAULT_IDLE_EXIT_TIMEOUT,
            automatic_update_policy: UpdatePolicy::default(),
        }
    }
}

impl DaemonConfig {
    /// Load the configuration from `path`, tolerating an absent file.
    #[context("Loading daemon config")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        if !path.try_exists()? {
            tracing::debug!("No config file at {path}, using defaults");
            return Ok(Self::default());
        }
        let ini = tini::Ini::from_file(&path.as_std_path())
            .map_err(|e| anyhow::anyhow!("Parsing {path}: {e}"))?;
        Ok(Self::from_ini(&ini))
    }

    fn from_ini(ini: &tini::Ini) -> Self {
        let mut config = Self::default();
        if let Some(v) = ini.get::<String>(DAEMON_GROUP, "IdleExitTimeout") {
            match v.parse::<u64>() {
                Ok(n) => config.idle_exit_timeout = n,
                Err(_) => {
                    tracing::warn!("Invalid IdleExitTimeout \"{v}\", using default");
                }
            }
        }
        if let Some(v) = ini.get::<String>(DAEMON_GROUP, "AutomaticUpdatePolicy") {
            match v.parse::<UpdatePolicy>() {
                Ok(p) => config.automatic_update_policy = p,
                Err(_) => {
                    tracing::warn!("Invalid AutomaticUpdatePolicy \"{v}\", using default");
                }
            }
        }
        config
    }
}
