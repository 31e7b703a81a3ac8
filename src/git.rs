use core::fmt;
use core::fmt::{Debug, Display};
use std::ffi::OsStr;
use std::io;
use std::ops::Deref;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::process::{self, Command as SyncCommand};
use std::sync::LazyLock;

use anyhow::{bail, Context};
use colored::control::SHOULD_COLORIZE;
use futures::future::BoxFuture;
use futures::{future::Fuse, select, FutureExt};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::process::OutputExt;
use crate::process::{CommandExt, SyncCommandExt as _};

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Hash(String);

// My attempt at newtypery for Git IDs. Why is this so damned verbose?
// The answer is that Deref lets you do some stuff on the inner type via
// expressions of the outer type, but it doesn't actually make the outer type
// implement the traits of the inner type. So we have to manually forward all
// those traits.

// A Hash is an ID for referring to an object in a git repository, I think the
// proper name would be ObjectId but... whatever.
impl Hash {
    // Note that this is infallible. That's because having a Hash doesn't
    // guarantee you that the ID refers to an object in an actual repo. Even if
    // we checked that at construction time, it's not possible to enforce that
    // variant going forward. So, you'll just have to do error handling whenever
    // you are dealing with Git objects, like you would with any mutable
    // database.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn abbrev(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }

    /// First 7 hex characters, the width the naming convention embeds in
    /// branch names.
    pub fn short7(&self) -> &str {
        &self.0[..self.0.len().min(7)]
    }
}

impl AsRef<OsStr> for Hash {
    fn as_ref(&self) -> &OsStr {
        OsStr::from_bytes(self.0.as_bytes())
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CommitHash(Hash);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }
}

impl From<CommitHash> for Hash {
    fn from(h: CommitHash) -> Hash {
        h.0
    }
}

impl Deref for CommitHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        self.0.as_ref()
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct TreeHash(Hash);

impl TreeHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }
}

impl Deref for TreeHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl From<TreeHash> for Hash {
    fn from(h: TreeHash) -> Hash {
        h.0
    }
}

impl AsRef<OsStr> for TreeHash {
    fn as_ref(&self) -> &OsStr {
        self.0.as_ref()
    }
}

impl Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub hash: CommitHash,
    pub tree: TreeHash,
}

impl From<Commit> for CommitHash {
    fn from(val: Commit) -> Self {
        val.hash
    }
}

/// An author identity for a created commit.
#[derive(Debug, Clone)]
pub struct Author {
    pub name: String,
    pub email: String,
}

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

// Wrapper for a Command, that holds a semaphore for as long as the process
// exists. Just delegates enough methods to allow you to use it without
// letting you drop the semaphore until the process has terminated (which
// hopefully implies the stdio pipes have been closed...).
// This exists to try and avoid running into file descriptor exhaustion, without
// needing any retry logic that would risk creating livelocks.
#[derive(Debug)]
struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut GitCommand {
        self.command.arg(arg);
        self
    }

    fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut GitCommand {
        self.command.args(args);
        self
    }

    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        self.command.execute().await
    }

    pub async fn output(&mut self) -> io::Result<process::Output> {
        self.command.output().await
    }
}

// Trait's can't have private methods, this is one reason why my
// inheritance-brained idea to use this Worktree kinda like a superclass was not
// a very good one.  This trait is a workaround for that, to avoid linter
// warnings from having a public method return a private type.
trait WorktreePriv: Worktree {
    // Convenience function to create a git command with some pre-filled args.
    // Returns a BoxFuture as an utterly mysterious workaround for what I
    // believe is a compiler bug:
    // https://stackoverflow.com/questions/79350718/one-type-is-more-general-than-the-other-for-osstr-and-tokiospawn?noredirect=1#comment139931420_79350718
    fn git<'a, I, S>(&'a self, args: I) -> BoxFuture<'a, GitCommand>
    where
        I: IntoIterator<Item = S> + Send + 'a,
        S: AsRef<OsStr>,
    {
        (async {
            let mut cmd = Command::new(self.git_binary());
            cmd.current_dir(self.path());
            cmd.args([
                "-c",
                &format!("color.ui={}", SHOULD_COLORIZE.should_colorize()),
            ]);
            cmd.args(args);
            // Separate process group means the child doesn't get SIGINT if the user
            // Ctrl-C's the terminal. We are trusting that git won't get stuck and
            // prevent us from shutting down. The benefit is that we don't get
            // annoying confusing errors on shut down.
            cmd.process_group(0);
            GitCommand {
                _permit: COMMAND_SEM.acquire().await.unwrap(),
                command: cmd,
            }
        })
        .boxed()
    }
}

impl<W: Worktree + ?Sized> WorktreePriv for W {}

// This is a weird kinda inheritance type thing to enable different types of worktree (with
// different fields and drop behaviours) to share the functionality that users actually care about.
// Not really sure if this is the Rust Way or not.
pub trait Worktree: Debug + Sync {
    // Directory where git commands should be run.
    fn path(&self) -> &Path;
    // Path to Git binary.
    fn git_binary(&self) -> &Path;

    /// Checks out a fresh branch named `new_branch`, based on `base` (which
    /// must already exist locally, e.g. after a fetch).
    async fn checkout_new_branch(&self, new_branch: &str, base: &str) -> anyhow::Result<()> {
        self.git(["checkout", "-B", new_branch])
            .await
            .arg(base)
            .output()
            .await?
            .ok()
            .context(format!("checking out new branch {new_branch:?} from {base:?}"))
    }

    // None means we successfully looked it up but it didn't exist.
    async fn rev_parse<S>(&self, rev_spec: S) -> anyhow::Result<Option<Commit>>
    where
        S: AsRef<OsStr>,
    {
        // We don't use log_n1 here because we want to check the exit code,
        // that API is designed for users who assume the revision exists.
        let mut cmd = self.git(["log", "-n1", "--format=%H %T"]).await;
        let cmd = cmd.arg(rev_spec);
        let output = cmd.output().await.context("failed to run 'git log -n1'")?;
        // Hack: empirically, git returns 128 when the range is invalid, it's not documented
        // but hopefully this is stable behaviour that we're supposed to be able to rely on for
        // this...?
        let exit_code = output.code_not_killed()?;
        if exit_code == 128 {
            return Ok(None);
        }
        if exit_code != 0 {
            bail!("'git log -n1' failed with code {exit_code}");
        }
        let out_string =
            String::from_utf8(output.stdout).context("reading git rev-parse output")?;
        let parts: Vec<&str> = out_string.trim().splitn(2, " ").collect();
        if parts.len() != 2 {
            bail!(
                "Failed to parse result of {cmd:?} - {out_string:?}\nstderr: {:?}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(Some(Commit {
            hash: CommitHash::new(parts[0]),
            tree: TreeHash::new(parts[1]),
        }))
    }

    /// Writes `bytes` to `rel_path` within the worktree, creating any parent
    /// directories that don't already exist.
    async fn write_file(&self, rel_path: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let full_path = self.path().join(rel_path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating parent dirs for {full_path:?}"))?;
        }
        tokio::fs::write(&full_path, bytes)
            .await
            .with_context(|| format!("writing {full_path:?}"))
    }

    /// Removes `rel_path` within the worktree. A missing file is not an
    /// error: the executor only calls this for paths it has already decided
    /// need deleting.
    async fn delete_path(&self, rel_path: &str) -> anyhow::Result<()> {
        let full_path = self.path().join(rel_path);
        match tokio::fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {full_path:?}")),
        }
    }

    /// Stages every pending change and commits it with `message`, authored
    /// (and committed) as `author`. Returns `Ok(None)` if there was nothing
    /// to commit.
    async fn commit_all<S>(&self, message: S, author: &Author) -> anyhow::Result<Option<Commit>>
    where
        S: AsRef<OsStr>,
    {
        self.git(["add", "-A"])
            .await
            .output()
            .await?
            .ok()
            .context("staging changes")?;

        let status = self
            .git(["status", "--porcelain"])
            .await
            .execute()
            .await
            .context("checking worktree status")?;
        if status.stdout.is_empty() {
            return Ok(None);
        }

        let ident = format!("{} <{}>", author.name, author.email);
        self.git(["-c", &format!("user.name={}", author.name)])
            .await
            .args(["-c", &format!("user.email={}", author.email)])
            .args(["commit", "-m"])
            .arg(message)
            .output()
            .await?
            .ok()
            .context(format!("committing as {ident}"))?;

        Ok(Some(self.rev_parse("HEAD").await?.context("no HEAD after commit")?))
    }

    /// Pushes `branch` (the current `HEAD`) to `remote`, creating it if
    /// necessary, overwriting any stale branch of the same name left over
    /// from a previous run with the same name (which can only happen if a
    /// prior run crashed mid-push, since names embed a fresh timestamp).
    async fn push(&self, remote: &str, branch: &str, ct: &CancellationToken) -> anyhow::Result<()> {
        let mut cmd = self.git(["push", "--force", remote]).await;
        let cmd = cmd.arg(format!("HEAD:refs/heads/{branch}"));
        select! {
            _ = ct.cancelled().fuse() => bail!("canceled"),
            res = cmd.execute().fuse() => res.context(format!("pushing {branch:?} to {remote:?}"))?,
        };
        Ok(())
    }
}

// A worktree that is deleted when dropped. This is kind of a dumb API that just happens to fit this
// project's exact needs. Instead probably Repo::new and this method should return a common trait or
// something.
#[derive(Debug)]
pub struct TempWorktree {
    origin: PathBuf, // Path of repo this was created from.
    temp_dir: TempDir,
    cleaned_up: bool,
    git_binary: PathBuf,
}

impl TempWorktree {
    // Create a worktree based on the origin repo, directly in the temp dir (which should be empty)
    // You must call cleanup on the result, or drop will panic.
    // Cancelling this will ensure we clean up efficiently. If you drop the
    // future without doing that, it has the same consequences as failing to call cleanup.
    pub async fn new<W>(
        ct: &CancellationToken,
        origin: &W,
        temp_dir: TempDir,
    ) -> anyhow::Result<TempWorktree>
    where
        W: Worktree,
    {
        // We create the object now even though it is not actually valid yet.
        // This is a hack to let the drop behaviour kick in immediately even if
        // this constructor is cancelled.
        let zelf = Self {
            origin: origin.path().to_owned(),
            temp_dir,
            cleaned_up: false,
            git_binary: origin.git_binary().to_owned(),
        };
        // Dumb workaround for https://github.com/bjackman/limmat/issues/14
        let mut attempts = 1;
        loop {
            let mut cmd = origin.git(["worktree", "add"]).await;
            let cmd = cmd.arg(zelf.temp_dir.path()).arg("HEAD");
            select! {
                _ = ct.cancelled().fuse() => {
                    zelf.cleanup().await;
                    bail!("canceled")
                },
                res = cmd.execute().fuse() => {
                    match res {
                        Ok(_) => return Ok(zelf),
                        Err(e) => {
                            if attempts >= 5 {
                                bail!("git worktree add failed: {}", e);
                            }
                            attempts += 1;
                        },
                    }
                },
            }
        }
    }

    /// Clones `repo_url` fresh into `temp_dir`, rather than adding a worktree
    /// off an existing local checkout. Used by the Target Sync Executor,
    /// which has no pre-existing local checkout of each target repo.
    pub async fn clone_remote(
        ct: &CancellationToken,
        git_binary: &Path,
        repo_url: &str,
        branch: &str,
        temp_dir: TempDir,
    ) -> anyhow::Result<TempWorktree> {
        let zelf = Self {
            origin: PathBuf::from(repo_url),
            temp_dir,
            cleaned_up: false,
            git_binary: git_binary.to_owned(),
        };
        let mut cmd = Command::new(&zelf.git_binary);
        cmd.args(["clone", "--branch", branch, "--single-branch", "--depth", "1"]);
        cmd.arg(repo_url).arg(zelf.temp_dir.path());
        cmd.process_group(0);
        let permit = COMMAND_SEM.acquire().await.unwrap();
        let mut git_cmd = GitCommand {
            _permit: permit,
            command: cmd,
        };
        select! {
            _ = ct.cancelled().fuse() => {
                zelf.cleanup().await;
                bail!("canceled")
            },
            res = git_cmd.execute().fuse() => {
                res.context(format!("cloning {repo_url:?} at {branch:?}"))?;
            },
        }
        Ok(zelf)
    }

    fn cleanup_cmd(&self) -> Option<SyncCommand> {
        if !self.origin.exists() {
            debug!(
                "Not de-registering worktree at {:?} as origin repo ({:?}) is gone.",
                self.temp_dir.path(),
                self.origin
            );
            return None;
        }
        // We don't create a new process group here, that means if the user
        // Ctrl-C's us while this is going on the Git command will get
        // interrupted too and we'll shut down in a mess. I think that's
        // actually desirable, if it gets to that point the user probably
        // just want us to fuck off and give them their terminal back at
        // whatever cost.
        let mut cmd = SyncCommand::new(self.git_binary());
        // Double --force means remove it even if we were in the middle of
        // creating it.
        cmd.args(["worktree", "remove", "--force", "--force"])
            .arg(self.temp_dir.path())
            .current_dir(&self.origin);
        Some(cmd)
    }

    // Clean up asnchronously, if you don't do this it will be done
    // synchronously in drop (blocking the async runtime and with no opportunity
    // for parallelism) and you will feel like a dumb idiot and your friends
    // will laugh at you.
    pub async fn cleanup(mut self) {
        if let Some(cmd) = self.cleanup_cmd() {
            match Command::from(cmd).execute().await {
                Err(e) => {
                    // This is totally normal, because the constructor creates this
                    // object before being certain the worktree was even created.
                    debug!("Couldn't clean up worktree {:?}: {:?}", &self.temp_dir, e);
                }
                Ok(_) => debug!("Delorted worktree at {:?}", self.temp_dir.path()),
            }
        }

        self.cleaned_up = true;
    }
}

impl Worktree for TempWorktree {
    fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    fn git_binary(&self) -> &Path {
        &self.git_binary
    }
}

impl Drop for TempWorktree {
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }
        warn!(
            "TempWorktree was not cleaned up before drop. \
                This is functionally harmless but probably slows things down."
        );
        if let Some(mut cmd) = self.cleanup_cmd() {
            match cmd.execute() {
                Err(e) => {
                    // This is totally normal, because the constructor creates this
                    // object before being certain the worktree was even created.
                    debug!("Couldn't clean up worktree {:?}: {:?}", &self.temp_dir, e);
                }
                Ok(_) => debug!("Delorted worktree at {:?}", self.temp_dir.path()),
            }
        }
    }
}

#[cfg(test)]
pub mod test_utils {

    use super::*;

    #[derive(Debug)]
    pub struct TempRepo {
        temp_dir: TempDir,
        git_binary: PathBuf,
    }

    // Empty repository in a temporary directory, torn down on drop.
    impl TempRepo {
        pub async fn new() -> anyhow::Result<Self> {
            // https://www.youtube.com/watch?v=_MwboA5NIVA
            let zelf = Self {
                temp_dir: TempDir::with_prefix("fixture-").expect("couldn't make tempdir"),
                git_binary: PathBuf::from("/usr/bin/git"),
            };
            zelf.git(["init"]).await.execute().await?;
            Ok(zelf)
        }
    }

    impl Worktree for TempRepo {
        fn path(&self) -> &Path {
            self.temp_dir.path()
        }

        fn git_binary(&self) -> &Path {
            &self.git_binary
        }
    }
}
