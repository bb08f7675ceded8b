//! Configuration file management.
//!
//! A YAML config at `~/.steroids/config.yaml` with sections for actor
//! roles, runner behavior, health/recovery policy, and follow-up tasks.
//! Resolution chain: explicit path > `STEROIDS_CONFIG` env > default path;
//! a missing file yields defaults so a fresh install works out of the box.

use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use steroids_db::pool::global_state_dir;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

/// A (provider, model) pair for one actor role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTarget {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSection {
    pub orchestrator: RoleTarget,
    pub coder: RoleTarget,
    pub reviewer: RoleTarget,
    pub coordinator: Option<RoleTarget>,
    /// Multi-review mode: when non-empty this replaces `reviewer`.
    pub reviewers: Vec<RoleTarget>,
    /// In strict multi-review, any failed reviewer defers the decision.
    pub strict: bool,
}

impl Default for AiSection {
    fn default() -> Self {
        let claude = |model: &str| RoleTarget {
            provider: "claude".to_string(),
            model: model.to_string(),
        };
        Self {
            orchestrator: claude("claude-sonnet-4-5"),
            coder: claude("claude-sonnet-4-5"),
            reviewer: claude("claude-sonnet-4-5"),
            coordinator: None,
            reviewers: Vec::new(),
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnersSection {
    /// Branch pushed to after approvals and disputes. `None` pushes the
    /// current branch.
    pub push_branch: Option<String>,
    /// Rejection counts at which the coordinator is consulted.
    pub coordinator_thresholds: Vec<u32>,
    /// Seconds between runner heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Activity-reset timeout for actor invocations, in seconds.
    pub invocation_timeout_secs: u64,
}

impl Default for RunnersSection {
    fn default() -> Self {
        Self {
            push_branch: None,
            coordinator_thresholds: vec![2, 5, 9],
            heartbeat_interval_secs: 30,
            invocation_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub auto_recover: bool,
    pub max_recovery_attempts: i64,
    pub max_incidents_per_hour: i64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            auto_recover: true,
            max_recovery_attempts: 3,
            max_incidents_per_hour: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowUpSection {
    pub max_depth: i64,
    pub auto_implement_depth1: bool,
}

impl Default for FollowUpSection {
    fn default() -> Self {
        Self {
            max_depth: 2,
            auto_implement_depth1: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub ai: AiSection,
    pub runners: RunnersSection,
    pub health: HealthSection,
    pub follow_up_tasks: FollowUpSection,
}

// -----------------------------------------------------------------------
// Paths / load / save
// -----------------------------------------------------------------------

/// Path of the config file: `$STEROIDS_CONFIG` or `~/.steroids/config.yaml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("STEROIDS_CONFIG") {
        return PathBuf::from(path);
    }
    global_state_dir().join("config.yaml")
}

/// Load the config file; a missing file yields defaults.
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&config_path())
}

/// Load a config file from an explicit path.
pub fn load_config_from(path: &std::path::Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile =
        serde_yaml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = serde_yaml::to_string(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Modification time of the config file, used to detect a config change
/// while a runner is paused on credit exhaustion.
pub fn config_mtime() -> Option<SystemTime> {
    std::fs::metadata(config_path())
        .and_then(|m| m.modified())
        .ok()
}

// -----------------------------------------------------------------------
// PhaseConfig
// -----------------------------------------------------------------------

/// Immutable per-phase configuration snapshot.
///
/// Built once from the resolved [`ConfigFile`] and passed through the
/// phase driver; nothing re-reads the config mid-phase.
#[derive(Debug, Clone)]
pub struct PhaseConfig {
    pub coordinator_thresholds: Vec<u32>,
    pub push_branch: Option<String>,
    pub strict_multi_review: bool,
    pub follow_up_max_depth: i64,
    pub auto_implement_depth1: bool,
    pub max_recovery_attempts: i64,
    pub max_incidents_per_hour: i64,
    pub invocation_timeout_secs: u64,
}

impl PhaseConfig {
    pub fn from_config(config: &ConfigFile) -> Self {
        Self {
            coordinator_thresholds: config.runners.coordinator_thresholds.clone(),
            push_branch: config.runners.push_branch.clone(),
            strict_multi_review: config.ai.strict,
            follow_up_max_depth: config.follow_up_tasks.max_depth,
            auto_implement_depth1: config.follow_up_tasks.auto_implement_depth1,
            max_recovery_attempts: config.health.max_recovery_attempts,
            max_incidents_per_hour: config.health.max_incidents_per_hour,
            invocation_timeout_secs: config.runners.invocation_timeout_secs,
        }
    }
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self::from_config(&ConfigFile::default())
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = load_config_from(&tmp.path().join("nope.yaml")).unwrap();
        assert_eq!(config.runners.coordinator_thresholds, vec![2, 5, 9]);
        assert!(config.health.auto_recover);
        assert_eq!(config.health.max_recovery_attempts, 3);
        assert_eq!(config.follow_up_tasks.max_depth, 2);
        assert!(!config.follow_up_tasks.auto_implement_depth1);
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
ai:
  orchestrator: { provider: claude, model: claude-opus-4-1 }
  coder: { provider: claude, model: claude-sonnet-4-5 }
  reviewer: { provider: codex, model: gpt-5-codex }
  reviewers:
    - { provider: claude, model: claude-sonnet-4-5 }
    - { provider: codex, model: gpt-5-codex }
  strict: true
runners:
  push_branch: main
  coordinator_thresholds: [3, 6]
health:
  auto_recover: false
  max_recovery_attempts: 5
  max_incidents_per_hour: 10
follow_up_tasks:
  max_depth: 3
  auto_implement_depth1: true
"#;
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.ai.orchestrator.model, "claude-opus-4-1");
        assert_eq!(config.ai.reviewers.len(), 2);
        assert!(config.ai.strict);
        assert_eq!(config.runners.push_branch.as_deref(), Some("main"));
        assert_eq!(config.runners.coordinator_thresholds, vec![3, 6]);
        assert!(!config.health.auto_recover);
        assert_eq!(config.health.max_incidents_per_hour, 10);
        assert_eq!(config.follow_up_tasks.max_depth, 3);
        assert!(config.follow_up_tasks.auto_implement_depth1);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let yaml = "runners:\n  push_branch: develop\n";
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.runners.push_branch.as_deref(), Some("develop"));
        // Untouched sections keep defaults.
        assert_eq!(config.runners.coordinator_thresholds, vec![2, 5, 9]);
        assert_eq!(config.ai.coder.provider, "claude");
    }

    #[test]
    fn phase_config_snapshot() {
        let mut config = ConfigFile::default();
        config.runners.push_branch = Some("steroids".to_string());
        config.ai.strict = true;

        let phase = PhaseConfig::from_config(&config);
        assert_eq!(phase.push_branch.as_deref(), Some("steroids"));
        assert!(phase.strict_multi_review);
        assert_eq!(phase.coordinator_thresholds, vec![2, 5, 9]);
    }
}
