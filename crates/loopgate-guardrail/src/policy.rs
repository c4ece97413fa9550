use anyhow::{Context, Result};
use loopgate_contracts::{require_non_negative, ContractError, Validate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Upper bound on `timeboxHours`: ten years.
pub const MAX_TIMEBOX_HOURS: f64 = 87_600.0;

/// Limits applied to state-changing actions on an existing task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailPolicy {
    pub timebox_hours: f64,
    #[serde(default)]
    pub daily_delta_limit: Option<f64>,
    pub coverage_limit_pct: f64,
    pub concurrent_substeps_limit: u32,
    pub renewal_limit: u32,
    pub evaluation_required_after_renewals: u32,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        posture_to_policy("standard")
    }
}

impl Validate for GuardrailPolicy {
    fn validate(&self) -> Result<(), ContractError> {
        require_non_negative("timeboxHours", self.timebox_hours)?;
        if self.timebox_hours == 0.0 {
            return Err(ContractError::OutOfRange {
                field: "timeboxHours",
                reason: "must be > 0",
            });
        }
        if self.timebox_hours > MAX_TIMEBOX_HOURS {
            return Err(ContractError::OutOfRange {
                field: "timeboxHours",
                reason: "must be <= 87600 (ten years)",
            });
        }
        if let Some(limit) = self.daily_delta_limit {
            require_non_negative("dailyDeltaLimit", limit)?;
        }
        require_non_negative("coverageLimitPct", self.coverage_limit_pct)?;
        Ok(())
    }
}

/// Load a policy from a JSON or TOML file (chosen by extension, JSON otherwise).
pub fn load_policy_file(path: &Path) -> Result<GuardrailPolicy> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read guardrail policy {}", path.display()))?;
    let policy: GuardrailPolicy = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&raw)
            .with_context(|| format!("invalid TOML policy {}", path.display()))?,
        _ => serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON policy {}", path.display()))?,
    };
    policy
        .validate()
        .with_context(|| format!("guardrail policy {} failed validation", path.display()))?;
    tracing::info!(path = %path.display(), "loaded guardrail policy file");
    Ok(policy)
}

/// Named presets; unknown names fall back to `standard`.
pub fn posture_to_policy(posture: &str) -> GuardrailPolicy {
    match posture.trim().to_ascii_lowercase().as_str() {
        "relaxed" => GuardrailPolicy {
            timebox_hours: 168.0,
            daily_delta_limit: None,
            coverage_limit_pct: 0.5,
            concurrent_substeps_limit: 5,
            renewal_limit: 4,
            evaluation_required_after_renewals: 3,
        },
        "strict" => GuardrailPolicy {
            timebox_hours: 24.0,
            daily_delta_limit: Some(0.01),
            coverage_limit_pct: 0.1,
            concurrent_substeps_limit: 1,
            renewal_limit: 1,
            evaluation_required_after_renewals: 1,
        },
        _ => GuardrailPolicy {
            timebox_hours: 72.0,
            daily_delta_limit: Some(0.02),
            coverage_limit_pct: 0.2,
            concurrent_substeps_limit: 3,
            renewal_limit: 2,
            evaluation_required_after_renewals: 2,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn presets_validate() {
        for posture in ["relaxed", "standard", "strict", "unknown"] {
            posture_to_policy(posture).validate().expect(posture);
        }
        assert_eq!(posture_to_policy("unknown"), posture_to_policy("standard"));
        assert_eq!(posture_to_policy(" Strict ").renewal_limit, 1);
    }

    #[test]
    fn zero_timebox_is_rejected() {
        let policy = GuardrailPolicy {
            timebox_hours: 0.0,
            ..GuardrailPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn loads_toml_and_json_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let toml_path = dir.path().join("policy.toml");
        let mut f = fs::File::create(&toml_path).expect("create toml");
        writeln!(
            f,
            "timeboxHours = 12.0\ncoverageLimitPct = 0.3\nconcurrentSubstepsLimit = 2\nrenewalLimit = 3\nevaluationRequiredAfterRenewals = 2"
        )
        .expect("write toml");
        let policy = load_policy_file(&toml_path).expect("toml policy");
        assert_eq!(policy.timebox_hours, 12.0);
        assert_eq!(policy.daily_delta_limit, None);

        let json_path = dir.path().join("policy.json");
        fs::write(
            &json_path,
            r#"{"timeboxHours":-1,"coverageLimitPct":0.3,"concurrentSubstepsLimit":2,"renewalLimit":3,"evaluationRequiredAfterRenewals":2}"#,
        )
        .expect("write json");
        let err = load_policy_file(&json_path).expect_err("negative timebox");
        assert!(format!("{err:#}").contains("timeboxHours"));
    }
}
