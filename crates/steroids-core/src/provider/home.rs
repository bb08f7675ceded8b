//! Per-invocation isolated home directory.
//!
//! Concurrent actor invocations must not bleed session state into each
//! other through `$HOME`. Each invocation gets a fresh temp directory
//! with a whitelisted subset of the real home symlinked in; the temp dir
//! is removed on drop, which covers every exit path including panics.

use std::path::Path;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::debug;

/// Home-relative entries shared with the isolated home by default.
///
/// Credentials and per-provider settings live here; everything else in
/// the real home stays invisible to the child.
pub const DEFAULT_WHITELIST: &[&str] = &[".claude", ".claude.json", ".config", ".gitconfig"];

/// A scoped isolated home directory.
pub struct IsolatedHome {
    dir: TempDir,
}

impl IsolatedHome {
    /// Prepare an isolated home, symlinking `whitelist` entries from
    /// `real_home` when they exist.
    pub fn prepare(real_home: &Path, whitelist: &[&str]) -> Result<Self> {
        let dir = TempDir::with_prefix("steroids-home-")
            .context("failed to create isolated home directory")?;

        for entry in whitelist {
            let source = real_home.join(entry);
            if !source.exists() {
                continue;
            }
            let target = dir.path().join(entry);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create {} in isolated home", parent.display())
                })?;
            }

            #[cfg(unix)]
            std::os::unix::fs::symlink(&source, &target).with_context(|| {
                format!("failed to link {} into isolated home", source.display())
            })?;

            #[cfg(not(unix))]
            {
                // Without symlinks, fall back to copying files only.
                if source.is_file() {
                    std::fs::copy(&source, &target).with_context(|| {
                        format!("failed to copy {} into isolated home", source.display())
                    })?;
                }
            }
        }

        debug!(home = %dir.path().display(), "prepared isolated home");
        Ok(Self { dir })
    }

    /// Prepare from the process's real home with the default whitelist.
    pub fn prepare_default() -> Result<Self> {
        let real_home = dirs::home_dir().context("could not determine home directory")?;
        Self::prepare(&real_home, DEFAULT_WHITELIST)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}
