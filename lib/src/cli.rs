//! # rpm-ostree daemon entrypoint
//!
//! Argument handling and startup for the privileged background service.

use std::ffi::OsString;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::daemon::{Daemon, DaemonOpts};

/// Options for the daemon process.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "rpm-ostreed", about = "Privileged update daemon for image-based hosts", version)]
pub struct Opts {
    /// The sysroot to operate on.
    #[clap(long, default_value = "/")]
    pub sysroot: Utf8PathBuf,

    /// Path to the daemon configuration file.
    #[clap(long, default_value = crate::config::CONFIG_PATH)]
    pub config: Utf8PathBuf,

    /// Where to listen for clients.
    #[clap(long, default_value = crate::ipc::SOCKET_PATH)]
    pub socket: Utf8PathBuf,

    /// Directory for per-transaction endpoint sockets.
    #[clap(long, default_value = crate::ipc::RUN_DIR)]
    pub run_dir: Utf8PathBuf,

    /// Print debug information during command processing.
    #[clap(long)]
    pub debug: bool,
}

/// Parse arguments and run the daemon to completion.
pub async fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let opts = Opts::parse_from(args);
    rpmostreed_utils::initialize_tracing(opts.debug);
    if !rustix::process::geteuid().is_root() {
        tracing::warn!("Running without root privileges; most operations will fail");
    }
    let daemon = Daemon::new(DaemonOpts {
        sysroot: opts.sysroot,
        config_path: opts.config,
        socket_path: opts.socket,
        run_dir: opts.run_dir,
    })?;
    daemon.run().await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let opts = Opts::parse_from(["rpm-ostreed"]);
        assert_eq!(opts.sysroot, Utf8PathBuf::from("/"));
        assert_eq!(opts.config.as_str(), crate::config::CONFIG_PATH);
        assert!(!opts.debug);
    }

    #[test]
    fn test_parse_overrides() {
        let opts = Opts::parse_from([
            "rpm-ostreed",
            "--sysroot=/sysroot",
            "--socket=/tmp/test.sock",
            "--debug",
        ]);
        assert_eq!(opts.sysroot, Utf8PathBuf::from("/sysroot"));
        assert_eq!(opts.socket, Utf8PathBuf::from("/tmp/test.sock"));
        assert!(opts.debug);
    }
}
