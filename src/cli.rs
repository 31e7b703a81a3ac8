//! Command-line surface: flag parsing and subcommand dispatch shapes. Kept
//! separate from `main.rs` so the argument grammar can be unit tested
//! without touching the network or the filesystem beyond config loading.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "filesync", version, about = "Stateless file-sync orchestrator for forge-hosted repos")]
pub struct Cli {
    /// Path to the sync config file.
    #[arg(long, short = 'c', global = true, default_value = "filesync.yaml")]
    pub config: PathBuf,

    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sync: diff source against targets, open/update PRs.
    Sync {
        /// Compute and log what would change without pushing or opening PRs.
        #[arg(long)]
        dry_run: bool,

        /// Only run these groups (by id or name). May be repeated.
        #[arg(long = "groups", value_name = "GROUP")]
        groups: Vec<String>,

        /// Skip these groups (by id or name). May be repeated.
        #[arg(long = "skip-groups", value_name = "GROUP")]
        skip_groups: Vec<String>,

        /// Request automerge on every PR this run creates.
        #[arg(long)]
        automerge: bool,

        /// Restrict the run to these target repos. Empty means every target
        /// in every selected group.
        #[arg(value_name = "REPO")]
        repos: Vec<String>,
    },
    /// Print the current sync state of every group/target without changing anything.
    Status {
        #[arg(long = "groups", value_name = "GROUP")]
        groups: Vec<String>,
        #[arg(long = "skip-groups", value_name = "GROUP")]
        skip_groups: Vec<String>,
    },
    /// Validate the config file and exit without contacting any forge.
    Validate,
    /// Close any open sync PRs (and, unless told to keep them, delete the
    /// backing branches) for one or more groups.
    Cancel {
        #[arg(long = "groups", value_name = "GROUP")]
        groups: Vec<String>,
        #[arg(long = "skip-groups", value_name = "GROUP")]
        skip_groups: Vec<String>,

        /// Log what would be closed/deleted without touching the forge.
        #[arg(long)]
        dry_run: bool,

        /// Leave sync branches in place after closing their PRs.
        #[arg(long)]
        keep_branches: bool,

        /// Comment to leave on each closed PR.
        #[arg(long)]
        comment: Option<String>,

        /// Restrict cancellation to these target repos. Empty means every
        /// target in every selected group.
        #[arg(value_name = "REPO")]
        repos: Vec<String>,
    },
    /// Report on the forge client's reachability and auth for this config's
    /// repos, without running a sync.
    Diagnose,
}

/// Maps a finished run to a process exit code: 0 full success, 1 any target
/// failure, 2 a config or forge-auth problem that aborted the whole run.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_TARGET_FAILURE: i32 = 1;
pub const EXIT_CONFIG_ERROR: i32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sync_with_repeated_group_flags() {
        let cli = Cli::parse_from([
            "filesync",
            "--config",
            "foo.yaml",
            "sync",
            "--groups",
            "core",
            "--groups",
            "docs",
            "--dry-run",
        ]);
        assert_eq!(cli.config, PathBuf::from("foo.yaml"));
        match cli.command {
            Commands::Sync { dry_run, groups, .. } => {
                assert!(dry_run);
                assert_eq!(groups, vec!["core".to_string(), "docs".to_string()]);
            }
            other => panic!("expected Sync, got {other:?}"),
        }
    }

    #[test]
    fn parses_cancel_with_comment() {
        let cli = Cli::parse_from([
            "filesync",
            "cancel",
            "--comment",
            "superseded",
            "--keep-branches",
        ]);
        match cli.command {
            Commands::Cancel { comment, keep_branches, .. } => {
                assert_eq!(comment.as_deref(), Some("superseded"));
                assert!(keep_branches);
            }
            other => panic!("expected Cancel, got {other:?}"),
        }
    }

    #[test]
    fn verbose_counts_repeats() {
        let cli = Cli::parse_from(["filesync", "-vvv", "validate"]);
        assert_eq!(cli.verbose, 3);
    }
}
