//! Runtime configuration: defaults, environment and TOML.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use turngen_kernel::{AliasOverrides, PluginRegistryBuilder};

use crate::error::RuntimeError;
use crate::reconcile::ReconcileConfig;

pub const ENV_SQLITE_DB: &str = "TURNGEN_SQLITE_DB";
pub const ENV_MAX_CONCURRENT_ATTEMPTS: &str = "TURNGEN_MAX_CONCURRENT_ATTEMPTS";
pub const ENV_RECONCILE_INTERVAL_SECS: &str = "TURNGEN_RECONCILE_INTERVAL_SECS";
pub const ENV_OVERDUE_GRACE_SECS: &str = "TURNGEN_OVERDUE_GRACE_SECS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// SQLite database path; in-memory storage when unset.
    pub sqlite_db: Option<String>,
    /// Upper bound on attempts running at once.
    pub max_concurrent_attempts: usize,
    /// Period of the reconciliation sweep; the sweep is off when unset.
    pub reconcile_interval_secs: Option<u64>,
    /// How late a recorded task may be before the sweep replaces it.
    pub overdue_grace_secs: u64,
    /// Alias overrides keyed by plugin name.
    pub overrides: HashMap<String, AliasOverrides>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            sqlite_db: None,
            max_concurrent_attempts: 4,
            reconcile_interval_secs: None,
            overdue_grace_secs: 60,
            overrides: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, RuntimeError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `TURNGEN_*` environment variables.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values found through `lookup` onto `self`.
    pub fn overlay(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RuntimeError> {
        if let Some(path) = lookup(ENV_SQLITE_DB).filter(|p| !p.trim().is_empty()) {
            self.sqlite_db = Some(path);
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENT_ATTEMPTS) {
            self.max_concurrent_attempts = parse_var(ENV_MAX_CONCURRENT_ATTEMPTS, &value)?;
        }
        if let Some(value) = lookup(ENV_RECONCILE_INTERVAL_SECS) {
            self.reconcile_interval_secs = Some(parse_var(ENV_RECONCILE_INTERVAL_SECS, &value)?);
        }
        if let Some(value) = lookup(ENV_OVERDUE_GRACE_SECS) {
            self.overdue_grace_secs = parse_var(ENV_OVERDUE_GRACE_SECS, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_concurrent_attempts == 0 {
            return Err(RuntimeError::Config(
                "max_concurrent_attempts must be at least 1".into(),
            ));
        }
        if self.reconcile_interval_secs == Some(0) {
            return Err(RuntimeError::Config(
                "reconcile_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Sweep settings, when the sweep is enabled.
    pub fn reconcile(&self) -> Option<ReconcileConfig> {
        self.reconcile_interval_secs.map(|secs| ReconcileConfig {
            interval: std::time::Duration::from_secs(secs),
            overdue_grace: chrono::Duration::seconds(self.overdue_grace_secs as i64),
        })
    }

    pub fn apply_overrides(&self, builder: PluginRegistryBuilder) -> PluginRegistryBuilder {
        builder.with_all_overrides(self.overrides.clone())
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T, RuntimeError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RuntimeError::Config(format!("{key}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_disable_sweep_and_sqlite() {
        let config = RuntimeConfig::default();
        assert_eq!(config.sqlite_db, None);
        assert_eq!(config.max_concurrent_attempts, 4);
        assert!(config.reconcile().is_none());
    }

    #[test]
    fn environment_overlays_defaults() {
        let config = RuntimeConfig::default()
            .overlay(lookup(&[
                (ENV_SQLITE_DB, "/tmp/turns.db"),
                (ENV_MAX_CONCURRENT_ATTEMPTS, "8"),
                (ENV_RECONCILE_INTERVAL_SECS, "30"),
                (ENV_OVERDUE_GRACE_SECS, " 120 "),
            ]))
            .unwrap();
        assert_eq!(config.sqlite_db.as_deref(), Some("/tmp/turns.db"));
        assert_eq!(config.max_concurrent_attempts, 8);
        let sweep = config.reconcile().unwrap();
        assert_eq!(sweep.interval, std::time::Duration::from_secs(30));
        assert_eq!(sweep.overdue_grace, chrono::Duration::seconds(120));
    }

    #[test]
    fn bad_environment_values_are_rejected() {
        let err = RuntimeConfig::default()
            .overlay(lookup(&[(ENV_MAX_CONCURRENT_ATTEMPTS, "many")]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Config(msg) if msg.contains(ENV_MAX_CONCURRENT_ATTEMPTS)));

        let err = RuntimeConfig::default()
            .overlay(lookup(&[(ENV_MAX_CONCURRENT_ATTEMPTS, "0")]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Config(_)));
    }

    #[test]
    fn toml_with_overrides() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            sqlite_db = "turns.db"
            reconcile_interval_secs = 15

            [overrides.sample_app.realm_types]
            testrealm = ""
            world = "sample_app.world"
            "#,
        )
        .unwrap();
        assert_eq!(config.sqlite_db.as_deref(), Some("turns.db"));
        assert_eq!(config.max_concurrent_attempts, 4);
        assert_eq!(config.reconcile_interval_secs, Some(15));
        let overrides = &config.overrides["sample_app"];
        assert_eq!(overrides.realm_types["testrealm"], "");
        assert_eq!(overrides.realm_types["world"], "sample_app.world");
        assert!(overrides.agent_types.is_empty());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(matches!(
            RuntimeConfig::from_toml_str("max_concurrent_attempts = \"x\""),
            Err(RuntimeError::ConfigFile(_))
        ));
    }
}
