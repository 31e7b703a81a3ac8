//! Live progress reporting for a sync run: adapts the graph-log live-repaint
//! idiom to per-group/per-target lines instead of per-commit/per-test lines.
//! No git graph is involved here - the "shape" of the display is just the
//! group scheduler's layer/target structure, known up front from the plan.

use std::collections::BTreeMap;
use std::io::Write;

use ansi_control_codes::control_sequences::{CPL, ED};
use colored::Colorize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetProgress {
    Pending,
    Running,
    UpToDate,
    NoChanges,
    Synced { pr_url: String },
    Failed { error: String },
}

impl TargetProgress {
    fn render(&self) -> String {
        match self {
            TargetProgress::Pending => "pending".dimmed().to_string(),
            TargetProgress::Running => "running".yellow().to_string(),
            TargetProgress::UpToDate => "up to date".green().to_string(),
            TargetProgress::NoChanges => "no changes".green().to_string(),
            TargetProgress::Synced { pr_url } => format!("{} {}", "synced".green(), pr_url),
            TargetProgress::Failed { error } => format!("{} {}", "failed".on_bright_red(), error),
        }
    }
}

struct GroupEntry {
    name: String,
    // Insertion order preserved; keyed by repo to allow update-by-repo.
    targets: Vec<(String, TargetProgress)>,
}

/// Tracks and repaints the live status of a sync run. Call [`Tracker::register_group`]
/// once per group before work starts, then [`Tracker::update`] as each target's
/// outcome becomes known, repainting after each change.
pub struct Tracker<O: Write> {
    groups: BTreeMap<String, GroupEntry>,
    group_order: Vec<String>,
    output: O,
    lines_painted: usize,
}

impl<O: Write> Tracker<O> {
    pub fn new(output: O) -> Self {
        Self {
            groups: BTreeMap::new(),
            group_order: Vec::new(),
            output,
            lines_painted: 0,
        }
    }

    pub fn register_group(&mut self, group_id: &str, group_name: &str, target_repos: &[String]) {
        self.group_order.push(group_id.to_string());
        self.groups.insert(
            group_id.to_string(),
            GroupEntry {
                name: group_name.to_string(),
                targets: target_repos
                    .iter()
                    .map(|r| (r.clone(), TargetProgress::Pending))
                    .collect(),
            },
        );
    }

    pub fn update(&mut self, group_id: &str, target_repo: &str, progress: TargetProgress) {
        if let Some(group) = self.groups.get_mut(group_id) {
            if let Some(entry) = group.targets.iter_mut().find(|(r, _)| r == target_repo) {
                entry.1 = progress;
            }
        }
    }

    /// Repaints the whole tracked tree in place, clearing whatever this
    /// Tracker last painted (if anything) first.
    pub fn repaint(&mut self) -> anyhow::Result<()> {
        if self.lines_painted != 0 {
            write!(&mut self.output, "{}{}", CPL(Some(self.lines_painted as u32)), ED(None))?;
        }
        let mut lines = 0;
        for group_id in &self.group_order {
            let group = &self.groups[group_id];
            writeln!(&mut self.output, "{} ({})", group.name.bold(), group_id)?;
            lines += 1;
            for (repo, progress) in &group.targets {
                writeln!(&mut self.output, "  {repo}: {}", progress.render())?;
                lines += 1;
            }
        }
        self.output.flush()?;
        self.lines_painted = lines;
        Ok(())
    }
}
