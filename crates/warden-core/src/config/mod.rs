//! User-declared configuration: repositories and backup plans.
//!
//! These types are read-only to the core. A transport layer parses and
//! persists user intent elsewhere and hands the core a validated [`Config`],
//! replaced atomically on reload.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::events::HookPhase;

/// Plan id recorded on repo-scoped operations (prune, stats, check) that
/// have no owning plan.
pub const SYSTEM_PLAN_ID: &str = "_system_";

/// A restic-compatible content-addressed store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    /// Repository URI as understood by the backup binary.
    pub uri: String,
    /// Environment passed to the subprocess (credentials and the like).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra flags appended to every invocation.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune: Option<PrunePolicy>,
}

/// User-declared backup intent for one set of paths into one repo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub repo_id: String,
    pub paths: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Cron expression; five-field expressions are accepted and implicitly
    /// anchored at second zero.
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

/// Which snapshots a forget run keeps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep the newest N snapshots.
    KeepLast(u32),
    /// Keep N snapshots per time bucket.
    TimeBucketed {
        #[serde(default)]
        hourly: u32,
        #[serde(default)]
        daily: u32,
        #[serde(default)]
        weekly: u32,
        #[serde(default)]
        monthly: u32,
        #[serde(default)]
        yearly: u32,
    },
}

/// When and how aggressively a repo is pruned.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrunePolicy {
    /// Skip the run if the last successful prune is newer than this.
    #[serde(default)]
    pub max_frequency_days: u32,
    /// Tolerated unused data before repacking, in percent.
    #[serde(default)]
    pub max_unused_percent: f64,
}

/// A user script fired by the external hook runner on matching phases.
/// The core only stores and republishes this; it never executes commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    pub phases: Vec<HookPhase>,
    pub command: String,
    #[serde(default)]
    pub on_failure: HookFailurePolicy,
}

/// What the hook runner should do when the script fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFailurePolicy {
    #[default]
    Ignore,
    /// Downgrade the operation to `Warning`.
    Warn,
    /// Cancel the operation.
    Cancel,
}

/// The full user-declared state the supervisor runs from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repos: Vec<Repo>,
    #[serde(default)]
    pub plans: Vec<Plan>,
}

impl Config {
    /// Look up a repo by id.
    pub fn repo(&self, id: &str) -> Option<&Repo> {
        self.repos.iter().find(|r| r.id == id)
    }

    /// Look up a plan by id.
    pub fn plan(&self, id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == id)
    }

    /// Plans targeting a given repo.
    pub fn plans_for_repo(&self, repo_id: &str) -> Vec<&Plan> {
        self.plans.iter().filter(|p| p.repo_id == repo_id).collect()
    }

    /// Validate internal consistency: unique ids, resolvable plan->repo
    /// references, parseable schedules, reserved ids.
    pub fn validate(&self) -> Result<()> {
        let mut repo_ids = HashSet::new();
        for repo in &self.repos {
            if repo.id.is_empty() {
                bail!("repo id must not be empty");
            }
            if !repo_ids.insert(&repo.id) {
                bail!("duplicate repo id {:?}", repo.id);
            }
        }

        let mut plan_ids = HashSet::new();
        for plan in &self.plans {
            if plan.id.is_empty() {
                bail!("plan id must not be empty");
            }
            if plan.id == SYSTEM_PLAN_ID {
                bail!("plan id {:?} is reserved", SYSTEM_PLAN_ID);
            }
            if !plan_ids.insert(&plan.id) {
                bail!("duplicate plan id {:?}", plan.id);
            }
            if !repo_ids.contains(&plan.repo_id) {
                bail!(
                    "plan {:?} references unknown repo {:?}",
                    plan.id,
                    plan.repo_id
                );
            }
            if plan.paths.is_empty() {
                bail!("plan {:?} declares no paths", plan.id);
            }
            parse_schedule(&plan.schedule)
                .map_err(|e| anyhow::anyhow!("plan {:?}: {e}", plan.id))?;
        }

        Ok(())
    }
}

/// Shared handle to the current config, replaced atomically on reload.
/// Readers clone the inner `Arc` and never observe a half-applied config.
#[derive(Debug, Clone)]
pub struct ConfigHandle(std::sync::Arc<std::sync::RwLock<std::sync::Arc<Config>>>);

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self(std::sync::Arc::new(std::sync::RwLock::new(
            std::sync::Arc::new(config),
        )))
    }

    /// The current config snapshot.
    pub fn current(&self) -> std::sync::Arc<Config> {
        std::sync::Arc::clone(&self.0.read().expect("config lock poisoned"))
    }

    /// Swap in a new config, returning the previous one.
    pub fn replace(&self, config: Config) -> std::sync::Arc<Config> {
        let mut guard = self.0.write().expect("config lock poisoned");
        std::mem::replace(&mut guard, std::sync::Arc::new(config))
    }
}

/// Parse a cron expression, accepting both the classic five-field form and
/// the seconds-bearing six/seven-field form. Five fields are anchored at
/// second zero so `*/5 * * * *` fires exactly on minute boundaries.
pub fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_owned()
    };

    cron::Schedule::from_str(&normalized)
        .map_err(|e| anyhow::anyhow!("invalid cron expression {expr:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_config() -> Config {
        Config {
            repos: vec![Repo {
                id: "r1".into(),
                uri: "/srv/backups/r1".into(),
                env: BTreeMap::new(),
                flags: vec![],
                prune: Some(PrunePolicy {
                    max_frequency_days: 7,
                    max_unused_percent: 10.0,
                }),
            }],
            plans: vec![Plan {
                id: "p1".into(),
                repo_id: "r1".into(),
                paths: vec!["/home".into()],
                excludes: vec![],
                schedule: "*/5 * * * *".into(),
                retention: Some(RetentionPolicy::KeepLast(3)),
                hooks: vec![],
            }],
        }
    }

    #[test]
    fn valid_config_passes() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn duplicate_plan_id_rejected() {
        let mut cfg = sample_config();
        cfg.plans.push(cfg.plans[0].clone());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_repo_rejected() {
        let mut cfg = sample_config();
        cfg.plans[0].repo_id = "nope".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reserved_plan_id_rejected() {
        let mut cfg = sample_config();
        cfg.plans[0].id = SYSTEM_PLAN_ID.into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_paths_rejected() {
        let mut cfg = sample_config();
        cfg.plans[0].paths.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_schedule_rejected() {
        let mut cfg = sample_config();
        cfg.plans[0].schedule = "every day at noon".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn five_field_cron_fires_on_minute_boundaries() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.after(&now).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn six_field_cron_accepted() {
        parse_schedule("30 */5 * * * *").unwrap();
    }

    #[test]
    fn config_deserializes_from_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [[repos]]
            id = "local"
            uri = "/srv/backups/local"

            [repos.env]
            RESTIC_PASSWORD = "hunter2"

            [[plans]]
            id = "home"
            repo_id = "local"
            paths = ["/home"]
            schedule = "0 2 * * *"

            [plans.retention]
            keep_last = 5

            [[plans.hooks]]
            phases = ["snapshot_error"]
            command = "notify-send 'backup failed'"
            on_failure = "warn"
            "#,
        )
        .unwrap();

        cfg.validate().unwrap();
        assert_eq!(cfg.plans[0].retention, Some(RetentionPolicy::KeepLast(5)));
        assert_eq!(
            cfg.repos[0].env.get("RESTIC_PASSWORD").map(String::as_str),
            Some("hunter2")
        );
        let hook = &cfg.plans[0].hooks[0];
        assert_eq!(hook.phases, vec![HookPhase::SnapshotError]);
        assert_eq!(hook.on_failure, HookFailurePolicy::Warn);
    }
}
