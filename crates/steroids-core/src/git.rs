//! Minimal git plumbing: commit, push, and read-only status queries.
//!
//! All commands run through argv (no shell), so commit messages with
//! embedded quotes need no escaping beyond what the OS argument vector
//! already guarantees.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};

/// A git working tree rooted at a project directory.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    root: PathBuf,
}

/// Snapshot of the repository state gathered before an orchestrator
/// invocation.
#[derive(Debug, Clone, Default)]
pub struct GitState {
    pub head_sha: Option<String>,
    pub recent_commits: Vec<String>,
    pub changed_files: Vec<String>,
    pub has_uncommitted_changes: bool,
    pub diff_summary: String,
    pub additions: u64,
    pub deletions: u64,
}

impl GitWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("failed to run git {}", args.join(" ")))
    }

    fn run_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Stage everything (`git add -A`).
    pub fn stage_all(&self) -> Result<()> {
        self.run_ok(&["add", "-A"]).map(|_| ())
    }

    /// Commit staged changes. Returns `false` when there is nothing to
    /// commit.
    pub fn commit(&self, message: &str) -> Result<bool> {
        let status = self.run_ok(&["status", "--porcelain"])?;
        if status.trim().is_empty() {
            return Ok(false);
        }
        self.run_ok(&["commit", "-m", message]).map(|_| true)
    }

    /// Push HEAD, optionally to an explicit branch on origin.
    pub fn push(&self, branch: Option<&str>) -> Result<()> {
        match branch {
            Some(branch) => {
                let refspec = format!("HEAD:{branch}");
                self.run_ok(&["push", "origin", &refspec]).map(|_| ())
            }
            None => self.run_ok(&["push"]).map(|_| ()),
        }
    }

    /// Current HEAD sha, or `None` in a repository without commits.
    pub fn head_sha(&self) -> Result<Option<String>> {
        let output = self.run(&["rev-parse", "HEAD"])?;
        if !output.status.success() {
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if sha.is_empty() { None } else { Some(sha) })
    }

    /// One-line subjects of the most recent commits.
    pub fn recent_commits(&self, count: usize) -> Result<Vec<String>> {
        let arg = format!("-{count}");
        let output = self.run(&["log", &arg, "--oneline"])?;
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    /// Paths with working-tree changes (`git status --porcelain`).
    pub fn changed_files(&self) -> Result<Vec<String>> {
        let output = self.run_ok(&["status", "--porcelain"])?;
        Ok(output
            .lines()
            .filter_map(|line| line.get(3..).map(str::to_string))
            .collect())
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(!self.run_ok(&["status", "--porcelain"])?.trim().is_empty())
    }

    /// `git diff --stat` of the working tree.
    pub fn diff_summary(&self) -> Result<String> {
        self.run_ok(&["diff", "--stat"]).map(|s| s.trim().to_string())
    }

    /// Total (additions, deletions) of the working-tree diff.
    pub fn diff_numstat(&self) -> Result<(u64, u64)> {
        let output = self.run_ok(&["diff", "--numstat"])?;
        let mut additions = 0u64;
        let mut deletions = 0u64;
        for line in output.lines() {
            let mut parts = line.split_whitespace();
            // Binary files report "-" for both columns; skip those.
            if let (Some(a), Some(d)) = (parts.next(), parts.next()) {
                additions += a.parse::<u64>().unwrap_or(0);
                deletions += d.parse::<u64>().unwrap_or(0);
            }
        }
        Ok((additions, deletions))
    }

    /// Gather the full [`GitState`] snapshot in one pass.
    pub fn snapshot(&self) -> GitState {
        let (additions, deletions) = self.diff_numstat().unwrap_or((0, 0));
        GitState {
            head_sha: self.head_sha().ok().flatten(),
            recent_commits: self.recent_commits(5).unwrap_or_default(),
            changed_files: self.changed_files().unwrap_or_default(),
            has_uncommitted_changes: self.has_uncommitted_changes().unwrap_or(false),
            diff_summary: self.diff_summary().unwrap_or_default(),
            additions,
            deletions,
        }
    }
}
