//! Runtime configuration
//!
//! Configuration is read from TOML and may be overridden from the environment:
//! `GRAINHOST_<SECTION>__<KEY>` sets `<section>.<key>`, e.g.
//! `GRAINHOST_SESSIONS__IDLE_TIMEOUT_SECS=60`. Values are parsed as JSON when
//! possible and taken as strings otherwise.

use crate::errors::{GrainhostError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment prefix for overrides
pub const ENV_PREFIX: &str = "GRAINHOST_";

/// Common behaviour of configuration types
pub trait Config: Clone + Default + Send + Sync + 'static {
    /// Load configuration from a TOML file
    fn load_from_file(path: &Path) -> Result<Self>;

    /// Apply overrides from `GRAINHOST_*` environment variables
    fn merge_with_env(&mut self) -> Result<()>;

    /// Validate the configuration
    fn validate(&self) -> Result<()>;
}

/// Permission resolver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Optimistic verification attempts before settling for the last result
    pub max_verify_attempts: u32,
    /// Queries slower than this are logged
    pub slow_query_warning_ms: u64,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            max_verify_attempts: 3,
            slow_query_warning_ms: 200,
        }
    }
}

/// Grant minting settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MintingConfig {
    /// Maximum JSON size of an unauthenticated access descriptor
    pub unauthenticated_limit_bytes: usize,
}

impl Default for MintingConfig {
    fn default() -> Self {
        Self {
            unauthenticated_limit_bytes: 4096,
        }
    }
}

/// Session and proxy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Sessions without a keep-alive for this long are collected
    pub idle_timeout_secs: u64,
    /// POST/PUT bodies larger than this (or of unknown size) are streamed
    pub streaming_threshold_bytes: u64,
    /// Host label of the shared API host
    pub api_host_id: String,
    /// Name of the per-session host cookie
    pub session_cookie: String,
    /// Path that binds the session cookie
    pub init_path: String,
    /// Longest a keep-alive header may push back a webkey's self-destruct time
    pub webkey_keepalive_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 180,
            streaming_threshold_bytes: 1 << 20,
            api_host_id: "api".to_string(),
            session_cookie: "grainhost-sid".to_string(),
            init_path: "/_grain-init".to_string(),
            webkey_keepalive_secs: 3600,
        }
    }
}

impl SessionsConfig {
    /// Idle timeout as a [`Duration`]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Limits of one subscription plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Maximum grains; unlimited when absent
    #[serde(default)]
    pub grains: Option<u64>,
    /// Storage allowance in bytes
    pub storage_bytes: u64,
}

/// Quota enforcement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Quota is only enforced when enabled
    pub enabled: bool,
    /// Plans by name
    pub plans: BTreeMap<String, Plan>,
    /// Plan of accounts that do not name one
    pub default_plan: String,
    /// Grain count multiple at which startup is refused
    pub excess_grain_factor: u64,
    /// Storage multiple at which startup is refused
    pub excess_storage_factor: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let mut plans = BTreeMap::new();
        plans.insert(
            "free".to_string(),
            Plan {
                grains: None,
                storage_bytes: 1 << 30,
            },
        );
        Self {
            enabled: false,
            plans,
            default_plan: "free".to_string(),
            excess_grain_factor: 2,
            excess_storage_factor: 1.2,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GrainhostConfig {
    /// Resolver settings
    pub permissions: PermissionsConfig,
    /// Minting settings
    pub minting: MintingConfig,
    /// Session and proxy settings
    pub sessions: SessionsConfig,
    /// Quota settings
    pub quota: QuotaConfig,
}

impl GrainhostConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| GrainhostError::invalid(format!("Invalid TOML: {e}")))
    }

    /// Apply overrides from `(name, value)` pairs shaped like environment variables
    pub fn merge_with_vars<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut tree = serde_json::to_value(&*self)?;
        let mut touched = false;
        for (name, value) in vars {
            let Some(key) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path: Vec<String> = key.split("__").map(str::to_lowercase).collect();
            let parsed = serde_json::from_str(value.as_ref())
                .unwrap_or_else(|_| serde_json::Value::String(value.as_ref().to_string()));
            set_nested_value(&mut tree, &path, parsed)?;
            touched = true;
        }
        if touched {
            *self = serde_json::from_value(tree)?;
        }
        Ok(())
    }

    /// Look up a plan, falling back to the default plan
    pub fn plan(&self, name: Option<&str>) -> Option<&Plan> {
        let name = name.unwrap_or(&self.quota.default_plan);
        self.quota.plans.get(name)
    }
}

impl Config for GrainhostConfig {
    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GrainhostError::internal(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    fn merge_with_env(&mut self) -> Result<()> {
        self.merge_with_vars(std::env::vars())
    }

    fn validate(&self) -> Result<()> {
        if self.permissions.max_verify_attempts == 0 {
            return Err(GrainhostError::invalid(
                "permissions.max_verify_attempts must be at least 1",
            ));
        }
        if self.sessions.idle_timeout_secs == 0 {
            return Err(GrainhostError::invalid(
                "sessions.idle_timeout_secs must be positive",
            ));
        }
        if self.sessions.api_host_id.is_empty() {
            return Err(GrainhostError::invalid("sessions.api_host_id is empty"));
        }
        if !self.sessions.init_path.starts_with('/') {
            return Err(GrainhostError::invalid(
                "sessions.init_path must start with '/'",
            ));
        }
        if self.quota.enabled && !self.quota.plans.contains_key(&self.quota.default_plan) {
            return Err(GrainhostError::invalid(format!(
                "quota.default_plan {:?} is not a configured plan",
                self.quota.default_plan
            )));
        }
        if self.quota.excess_storage_factor < 1.0 || self.quota.excess_grain_factor == 0 {
            return Err(GrainhostError::invalid(
                "quota excess factors must not shrink the plan",
            ));
        }
        Ok(())
    }
}

fn set_nested_value(
    tree: &mut serde_json::Value,
    path: &[String],
    value: serde_json::Value,
) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        return Err(GrainhostError::invalid("Empty configuration key"));
    };

    let mut current = tree;
    for part in parents {
        current = current
            .as_object_mut()
            .ok_or_else(|| GrainhostError::invalid("Expected configuration table"))?
            .entry(part.clone())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    }

    current
        .as_object_mut()
        .ok_or_else(|| GrainhostError::invalid(format!("Cannot set {last} on a non-table")))?
        .insert(last.clone(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = GrainhostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.permissions.max_verify_attempts, 3);
        assert_eq!(config.sessions.streaming_threshold_bytes, 1024 * 1024);
        assert_eq!(config.plan(None).map(|p| p.storage_bytes), Some(1 << 30));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = GrainhostConfig::from_toml_str(
            r#"
            [sessions]
            idle_timeout_secs = 30

            [quota]
            enabled = true
            [quota.plans.free]
            grains = 5
            storage_bytes = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.sessions.idle_timeout_secs, 30);
        assert_eq!(config.sessions.api_host_id, "api");
        assert_eq!(config.plan(Some("free")).and_then(|p| p.grains), Some(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[minting]\nunauthenticated_limit_bytes = 16").unwrap();
        let config = GrainhostConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.minting.unauthenticated_limit_bytes, 16);
    }

    #[test]
    fn test_env_style_overrides() {
        let mut config = GrainhostConfig::default();
        config
            .merge_with_vars([
                ("GRAINHOST_SESSIONS__IDLE_TIMEOUT_SECS", "60"),
                ("GRAINHOST_SESSIONS__API_HOST_ID", "api-box"),
                ("UNRELATED", "1"),
            ])
            .unwrap();
        assert_eq!(config.sessions.idle_timeout_secs, 60);
        assert_eq!(config.sessions.api_host_id, "api-box");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = GrainhostConfig::default();
        config.permissions.max_verify_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = GrainhostConfig::default();
        assert!(config
            .merge_with_vars([("GRAINHOST_PERMISSIONS__MAX_VERIFY_ATTEMPTS", "many")])
            .is_err());
    }
}
