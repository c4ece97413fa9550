use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use loopgate_guardrail::GuardrailPolicy;
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Directory holding `loopgate.sqlite`
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Bind address for the HTTP service
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Inline guardrail limits; mirrors the JSON policy file with TOML-style keys.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PolicyTable {
    #[schemars(range(min = 0))]
    pub timebox_hours: f64,
    #[serde(default)]
    pub daily_delta_limit: Option<f64>,
    pub coverage_limit_pct: f64,
    pub concurrent_substeps_limit: u32,
    pub renewal_limit: u32,
    pub evaluation_required_after_renewals: u32,
}

impl From<&PolicyTable> for GuardrailPolicy {
    fn from(t: &PolicyTable) -> Self {
        GuardrailPolicy {
            timebox_hours: t.timebox_hours,
            daily_delta_limit: t.daily_delta_limit,
            coverage_limit_pct: t.coverage_limit_pct,
            concurrent_substeps_limit: t.concurrent_substeps_limit,
            renewal_limit: t.renewal_limit,
            evaluation_required_after_renewals: t.evaluation_required_after_renewals,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GuardrailConfig {
    /// Preset name: relaxed | standard | strict
    #[serde(default)]
    pub posture: Option<String>,
    /// Explicit limits; wins over `posture`.
    #[serde(default)]
    pub policy: Option<PolicyTable>,
}

fn default_lease_minutes() -> u32 {
    30
}

fn default_reconcile_grace_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ClaimsConfig {
    #[serde(default = "default_lease_minutes")]
    #[schemars(range(min = 1))]
    pub lease_minutes: u32,
    /// Background reconcile period; 0 disables the sweep.
    #[serde(default)]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_reconcile_grace_secs")]
    pub reconcile_grace_secs: u64,
}

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            lease_minutes: default_lease_minutes(),
            reconcile_interval_secs: 0,
            reconcile_grace_secs: default_reconcile_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RecipesConfig {
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub guardrail: GuardrailConfig,
    #[serde(default)]
    pub claims: ClaimsConfig,
    #[serde(default)]
    pub recipes: RecipesConfig,
}

static CONFIG_SCHEMA: Lazy<Option<Validator>> = Lazy::new(|| {
    let schema_value = config_schema_json();
    match validator_for(&schema_value) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::error!("config schema failed to compile: {e}");
            None
        }
    }
});

/// JSON schema describing the configuration file.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).unwrap_or(serde_json::Value::Null)
}

pub fn write_schema_file(path: &Path) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validator = CONFIG_SCHEMA
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("config schema unavailable"))?;
    let validation_errors: Vec<_> = validator
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_default_when_absent() {
        let cfg = parse_config("[runtime]\nport = 8095\n").expect("config");
        assert_eq!(cfg.runtime.port, Some(8095));
        assert_eq!(cfg.claims.lease_minutes, 30);
        assert_eq!(cfg.claims.reconcile_grace_secs, 120);
        assert_eq!(cfg.claims.reconcile_interval_secs, 0);
        assert!(cfg.guardrail.policy.is_none());
    }

    #[test]
    fn schema_rejects_wrong_types_and_unknown_keys() {
        assert!(parse_config("[runtime]\nport = \"eighty\"\n").is_err());
        assert!(parse_config("[claims]\nlease_minutes = 0\n").is_err());
        assert!(parse_config("[claims]\nleese_minutes = 10\n").is_err());
    }

    #[test]
    fn inline_policy_converts() {
        let cfg = parse_config(
            "[guardrail.policy]\ntimebox_hours = 12.0\ncoverage_limit_pct = 0.3\nconcurrent_substeps_limit = 2\nrenewal_limit = 1\nevaluation_required_after_renewals = 1\n",
        )
        .expect("config");
        let policy = GuardrailPolicy::from(cfg.guardrail.policy.as_ref().expect("policy"));
        assert_eq!(policy.timebox_hours, 12.0);
        assert_eq!(policy.daily_delta_limit, None);
    }

    #[test]
    fn shipped_default_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/default.toml");
        let cfg = load_config(&path).expect("default config");
        assert_eq!(cfg.guardrail.posture.as_deref(), Some("standard"));
    }
}
