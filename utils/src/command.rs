//! Helpers for executing subprocesses.

use anyhow::{Context, Result};
use std::process::Command;

/// Extension trait for running a command and mapping a non-zero exit into
/// an error.
pub trait CommandRunExt {
    /// Execute the child process synchronously, erroring if it does not
    /// exit successfully.
    fn run(&mut self) -> Result<()>;
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        tracing::debug!("exec: {self:?}");
        let st = self
            .status()
            .with_context(|| format!("Spawning {:?}", self.get_program()))?;
        if !st.success() {
            anyhow::bail!("{:?} failed: {st:?}", self.get_program());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_run_success_and_failure() {
        Command::new("true").run().unwrap();
        assert!(Command::new("false").run().is_err());
        assert!(Command::new("/no/such/binary").run().is_err());
    }
}
