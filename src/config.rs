use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "ScriptConfig::default_root")]
    pub root: PathBuf,
    #[serde(default = "ScriptConfig::default_extension")]
    pub extension: String,
    /// Rhai operation budget per call; `None` leaves scripts unbounded.
    #[serde(default)]
    pub max_operations: Option<u64>,
    /// Seed for the script `rand` function. Unseeded runs draw from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "LifecycleConfig::default_stats_interval_ticks")]
    pub stats_interval_ticks: u64,
    #[serde(default = "LifecycleConfig::default_instance_soft_limit")]
    pub instance_soft_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub scripts: ScriptConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default = "RuntimeConfig::default_log_filter")]
    pub log_filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfigOverrides {
    pub script_root: Option<PathBuf>,
    pub seed: Option<u64>,
    pub max_operations: Option<u64>,
    pub stats_interval_ticks: Option<u64>,
}

impl ScriptConfig {
    fn default_root() -> PathBuf {
        PathBuf::from("assets/behaviours")
    }

    fn default_extension() -> String {
        "rhai".to_string()
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self { root: Self::default_root(), extension: Self::default_extension(), max_operations: None, seed: None }
    }
}

impl LifecycleConfig {
    const fn default_stats_interval_ticks() -> u64 {
        300
    }

    const fn default_instance_soft_limit() -> usize {
        4_096
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stats_interval_ticks: Self::default_stats_interval_ticks(),
            instance_soft_limit: Self::default_instance_soft_limit(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scripts: ScriptConfig::default(),
            lifecycle: LifecycleConfig::default(),
            log_filter: Self::default_log_filter(),
        }
    }
}

impl RuntimeConfig {
    fn default_log_filter() -> String {
        "kestrel_behaviours=info".to_string()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(error = ?err, "config load failed; falling back to defaults");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &RuntimeConfigOverrides) {
        if let Some(root) = &overrides.script_root {
            self.scripts.root = root.clone();
        }
        if let Some(seed) = overrides.seed {
            self.scripts.seed = Some(seed);
        }
        if let Some(max_operations) = overrides.max_operations {
            self.scripts.max_operations = Some(max_operations);
        }
        if let Some(interval) = overrides.stats_interval_ticks {
            self.lifecycle.stats_interval_ticks = interval;
        }
    }
}

impl RuntimeConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.script_root.is_none()
            && self.seed.is_none()
            && self.max_operations.is_none()
            && self.stats_interval_ticks.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.script_root.is_some() {
            fields.push("script_root");
        }
        if self.seed.is_some() {
            fields.push("seed");
        }
        if self.max_operations.is_some() {
            fields.push("max_operations");
        }
        if self.stats_interval_ticks.is_some() {
            fields.push("stats_interval_ticks");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(cfg.scripts.root, PathBuf::from("assets/behaviours"));
        assert_eq!(cfg.scripts.extension, "rhai");
        assert_eq!(cfg.lifecycle.stats_interval_ticks, 300);
        assert_eq!(cfg.lifecycle.instance_soft_limit, 4_096);
        assert_eq!(cfg.log_filter, "kestrel_behaviours=info");
    }

    #[test]
    fn partial_sections_keep_field_defaults() {
        let cfg: RuntimeConfig =
            serde_json::from_str(r#"{ "scripts": { "max_operations": 5000 }, "lifecycle": { "stats_interval_ticks": 10 } }"#)
                .expect("parse");
        assert_eq!(cfg.scripts.max_operations, Some(5000));
        assert_eq!(cfg.scripts.extension, "rhai");
        assert_eq!(cfg.lifecycle.stats_interval_ticks, 10);
        assert_eq!(cfg.lifecycle.instance_soft_limit, 4_096);
    }

    #[test]
    fn overrides_replace_selected_fields() {
        let mut cfg = RuntimeConfig::default();
        let overrides = RuntimeConfigOverrides { seed: Some(7), stats_interval_ticks: Some(1), ..Default::default() };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.scripts.seed, Some(7));
        assert_eq!(cfg.lifecycle.stats_interval_ticks, 1);
        assert_eq!(overrides.applied_fields(), vec!["seed", "stats_interval_ticks"]);
        assert!(!overrides.is_empty());
    }
}
