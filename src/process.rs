//! Small helpers for running subprocesses (almost always `git`) and turning
//! their exit status into a proper `anyhow::Result`, with context describing
//! what was actually run.

use std::ffi::OsStr;
use std::fmt::Write as _;
use std::process::{self, Command as SyncCommand};

use anyhow::{bail, Context};

fn describe(program: &OsStr, args: &[std::ffi::OsString]) -> String {
    let mut s = program.to_string_lossy().into_owned();
    for arg in args {
        let _ = write!(s, " {}", arg.to_string_lossy());
    }
    s
}

pub trait OutputExt {
    /// Turn a non-zero exit status into an error carrying stdout/stderr.
    fn ok(self) -> anyhow::Result<process::Output>;
    /// Like `status.code()`, but errors out (rather than returning `None`) if
    /// the process was killed by a signal - that's a distinct failure mode we
    /// never expect to have to handle specially.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl OutputExt for process::Output {
    fn ok(self) -> anyhow::Result<process::Output> {
        if self.status.success() {
            Ok(self)
        } else {
            bail!(
                "process failed with {}\nstdout:\n{}\nstderr:\n{}",
                self.status,
                String::from_utf8_lossy(&self.stdout),
                String::from_utf8_lossy(&self.stderr),
            )
        }
    }

    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .ok_or_else(|| anyhow::anyhow!("process was killed by a signal: {}", self.status))
    }
}

pub trait CommandExt {
    /// Run the command and return its output, converting a non-zero exit code
    /// into an error. Unlike `output()`, this also describes the command that
    /// was run in the error context.
    async fn execute(&mut self) -> anyhow::Result<process::Output>;
}

impl CommandExt for tokio::process::Command {
    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        let std_cmd = self.as_std();
        let desc = describe(
            std_cmd.get_program(),
            &std_cmd.get_args().map(|a| a.to_owned()).collect::<Vec<_>>(),
        );
        let output = self
            .output()
            .await
            .with_context(|| format!("spawning {desc:?}"))?;
        output.ok().with_context(|| format!("running {desc:?}"))
    }
}

pub trait SyncCommandExt {
    fn execute(&mut self) -> anyhow::Result<process::Output>;
}

impl SyncCommandExt for SyncCommand {
    fn execute(&mut self) -> anyhow::Result<process::Output> {
        let desc = describe(
            self.get_program(),
            &self.get_args().map(|a| a.to_owned()).collect::<Vec<_>>(),
        );
        let output = self.output().with_context(|| format!("spawning {desc:?}"))?;
        output.ok().with_context(|| format!("running {desc:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_succeeds_on_zero_exit() {
        let mut cmd = tokio::process::Command::new("true");
        assert!(cmd.execute().await.is_ok());
    }

    #[tokio::test]
    async fn execute_fails_on_nonzero_exit() {
        let mut cmd = tokio::process::Command::new("false");
        assert!(cmd.execute().await.is_err());
    }
}
