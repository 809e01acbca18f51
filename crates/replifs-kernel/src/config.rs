//! Mount configuration.
//!
//! Loaded from RON:
//!
//! ```ron
//! (
//!     branches: [
//!         (path: "/srv/replica/b0"),
//!         (path: "/srv/replica/b1", kind: local, flag_xattr: Some("trusted.replifs.flag")),
//!     ],
//!     no_abort: false,
//!     subject: SYNC_REPLICA,
//!     heal_mode: deferred,
//!     rules: [(pattern: "tmp*", raid: raid0)],
//!     default_raid: raid1,
//! )
//! ```
//!
//! Everything is validated before any branch is opened; a bad config
//! never yields a half-built replica.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::branch::{BRANCH_MAX, BranchKind, BranchSet};
use crate::dispatch::{DispatchPolicy, Subject};
use crate::error::{ReplicaError, ReplicaResult};
use crate::flag::RaidType;
use crate::replica::ReplicaOptions;
use crate::rule_tree::{Rule, RuleTree};

/// When suspect branches are healed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum HealMode {
    /// Right after the operation that found them, before it returns.
    #[default]
    Inline,
    /// Queued, drained by [`crate::ReplicaFs::run_pending_heals`] or the heal worker.
    Deferred,
    /// Only on explicit [`crate::ReplicaFs::heal`].
    Off,
}

impl HealMode {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }
}

/// One branch entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub kind: BranchKind,
    /// Overrides the kind's default flag xattr name.
    #[serde(default)]
    pub flag_xattr: Option<String>,
}

impl BranchConfig {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: BranchKind::Local,
            flag_xattr: None,
        }
    }

    pub fn memory(label: impl Into<PathBuf>) -> Self {
        Self {
            path: label.into(),
            kind: BranchKind::Memory,
            flag_xattr: None,
        }
    }
}

fn default_raid() -> RaidType {
    RaidType::Raid1
}

fn default_heal_interval_ms() -> u64 {
    1000
}

/// Mount-time configuration of one replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Branch 0 is the primary.
    pub branches: Vec<BranchConfig>,
    #[serde(default)]
    pub no_abort: bool,
    #[serde(default)]
    pub subject: Subject,
    /// 0 = warn, 1 = info, 2 = debug, 3+ = trace.
    #[serde(default)]
    pub debug_level: u8,
    #[serde(default)]
    pub heal_mode: HealMode,
    /// Deferred heal queue slots; 0 selects the queue default.
    #[serde(default)]
    pub heal_queue_size: usize,
    #[serde(default = "default_heal_interval_ms")]
    pub heal_interval_ms: u64,
    #[serde(default)]
    pub branch_timeout_ms: Option<u64>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default = "default_raid")]
    pub default_raid: RaidType,
}

impl MountConfig {
    /// Defaults around the given branches.
    pub fn new(branches: Vec<BranchConfig>) -> Self {
        Self {
            branches,
            no_abort: false,
            subject: Subject::default(),
            debug_level: 0,
            heal_mode: HealMode::default(),
            heal_queue_size: 0,
            heal_interval_ms: default_heal_interval_ms(),
            branch_timeout_ms: None,
            rules: Vec::new(),
            default_raid: default_raid(),
        }
    }

    /// Parse and validate RON text.
    pub fn from_ron(text: &str) -> ReplicaResult<Self> {
        let config: MountConfig = ron::from_str(text)
            .map_err(|e| ReplicaError::configuration(format!("RON syntax error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file.
    pub async fn load(path: &Path) -> ReplicaResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ReplicaError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_ron(&text)
    }

    pub fn validate(&self) -> ReplicaResult<()> {
        if self.branches.is_empty() {
            return Err(ReplicaError::configuration("at least one branch is required"));
        }
        if self.branches.len() > BRANCH_MAX {
            return Err(ReplicaError::configuration(format!(
                "{} branches exceed the maximum of {BRANCH_MAX}",
                self.branches.len()
            )));
        }

        let mut seen = HashSet::new();
        for branch in &self.branches {
            if branch.path.as_os_str().is_empty() {
                return Err(ReplicaError::configuration("branch path is empty"));
            }
            if !seen.insert(&branch.path) {
                return Err(ReplicaError::configuration(format!(
                    "duplicate branch path {}",
                    branch.path.display()
                )));
            }
            if branch.flag_xattr.as_deref().is_some_and(|n| !n.contains('.')) {
                return Err(ReplicaError::configuration(format!(
                    "flag xattr of {} needs a namespace prefix",
                    branch.path.display()
                )));
            }
        }

        if self.default_raid == RaidType::None {
            return Err(ReplicaError::configuration("default_raid cannot be none"));
        }
        if self.branch_timeout_ms == Some(0) {
            return Err(ReplicaError::configuration("branch_timeout_ms must be positive"));
        }
        if self.heal_interval_ms == 0 {
            return Err(ReplicaError::configuration("heal_interval_ms must be positive"));
        }
        if !self.rules.is_empty() {
            RuleTree::construct(&self.rules, self.default_raid)?;
        }
        Ok(())
    }

    pub fn policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            no_abort: self.no_abort,
            subject: self.subject,
            branch_timeout: self.branch_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn heal_interval(&self) -> Duration {
        Duration::from_millis(self.heal_interval_ms)
    }

    /// Open every branch.
    pub fn branch_set(&self) -> ReplicaResult<BranchSet> {
        let mut builder = BranchSet::builder();
        for branch in &self.branches {
            builder = builder.open(&branch.path, branch.kind);
            if let Some(name) = &branch.flag_xattr {
                builder = builder.flag_xattr(name.clone());
            }
        }
        builder.finalize()
    }

    /// The rule tree, or `None` when no rules are configured.
    pub fn rule_tree(&self) -> ReplicaResult<Option<RuleTree>> {
        if self.rules.is_empty() {
            return Ok(None);
        }
        RuleTree::construct(&self.rules, self.default_raid).map(Some)
    }

    /// Everything the replica needs besides its branches.
    pub fn options(&self) -> ReplicaResult<ReplicaOptions> {
        Ok(ReplicaOptions {
            policy: self.policy(),
            rules: self.rule_tree()?,
            default_raid: self.default_raid,
            heal_mode: self.heal_mode,
            heal_queue_size: self.heal_queue_size,
            heal_interval: self.heal_interval(),
        })
    }

    /// Default `tracing` filter directive for `debug_level`.
    pub fn log_filter(&self) -> &'static str {
        match self.debug_level {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = MountConfig::from_ron(
            r#"(
                branches: [
                    (path: "/b0"),
                    (path: "/b1", kind: memory, flag_xattr: Some("trusted.x.flag")),
                ],
                no_abort: true,
                subject: ASYNC_REPLICA,
                debug_level: 2,
                heal_mode: deferred,
                branch_timeout_ms: Some(250),
                rules: [(pattern: "tmp*", raid: raid0)],
                default_raid: raid1,
            )"#,
        )
        .unwrap();

        assert_eq!(config.branches.len(), 2);
        assert_eq!(config.branches[0].kind, BranchKind::Local);
        assert_eq!(config.branches[1].kind, BranchKind::Memory);
        assert_eq!(config.subject, Subject::AsyncReplica);
        assert_eq!(config.heal_mode, HealMode::Deferred);
        assert_eq!(config.log_filter(), "debug");
        assert_eq!(
            config.policy().branch_timeout,
            Some(Duration::from_millis(250))
        );
        let tree = config.rule_tree().unwrap().unwrap();
        assert_eq!(tree.search("tmpfile"), RaidType::Raid0);
    }

    #[test]
    fn test_defaults() {
        let config = MountConfig::from_ron(r#"(branches: [(path: "/b0")])"#).unwrap();
        assert!(!config.no_abort);
        assert_eq!(config.subject, Subject::SyncReplica);
        assert_eq!(config.heal_mode, HealMode::Inline);
        assert_eq!(config.default_raid, RaidType::Raid1);
        assert!(config.rule_tree().unwrap().is_none());
    }

    #[test]
    fn test_rejects_malformed() {
        let bad = [
            r#"(branches: [])"#,
            r#"(branches: [(path: "/a"), (path: "/a")])"#,
            r#"(branches: [(path: "/a")], default_raid: none)"#,
            r#"(branches: [(path: "/a")], rules: [(pattern: "a*b", raid: raid0)])"#,
            r#"(branches: [(path: "/a")], branch_timeout_ms: Some(0))"#,
            r#"(branches: [(path: "/a", flag_xattr: Some("flag"))])"#,
            r#"(branches: [(path: "/a")"#,
        ];
        for text in bad {
            assert!(
                matches!(MountConfig::from_ron(text), Err(ReplicaError::Configuration(_))),
                "accepted: {text}"
            );
        }
    }

    #[test]
    fn test_branch_set_from_memory_config() {
        let config = MountConfig::new(vec![
            BranchConfig::memory("mem0"),
            BranchConfig::memory("mem1"),
        ]);
        let set = config.branch_set().unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(1).unwrap().flag_xattr(), "trusted.replifs.flag");
    }

    #[test]
    fn test_heal_mode_parse() {
        assert_eq!(HealMode::from_str("DEFERRED"), Some(HealMode::Deferred));
        assert_eq!(HealMode::from_str("later"), None);
    }
}
