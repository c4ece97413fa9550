//! Guardrail enforcement for state-changing actions on existing tasks.
//!
//! Block rules are evaluated first; when any block rule fires the throttle
//! rules are skipped entirely. Throttle rules are independent of each other
//! and may fire together, each clamping its own field to the policy limit.

use chrono::{DateTime, Duration, Utc};
use loopgate_contracts::{require_non_empty, require_non_negative};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

mod format;
mod policy;

pub use format::{format_decision, Audience};
pub use loopgate_contracts::{ContractError, Validate};
pub use policy::{load_policy_file, posture_to_policy, GuardrailPolicy, MAX_TIMEBOX_HOURS};

/// Kind of change being attempted against a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Update,
    Renew,
    Close,
    #[serde(other)]
    Other,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Update => "update",
            ChangeKind::Renew => "renew",
            ChangeKind::Close => "close",
            ChangeKind::Other => "other",
        }
    }

    fn bypasses_timebox(self) -> bool {
        matches!(self, ChangeKind::Renew | ChangeKind::Close)
    }
}

/// Task facts the rules need. `created_at` is the timebox anchor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub renewals: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailContext {
    pub task: TaskSnapshot,
    pub change_kind: ChangeKind,
    #[serde(default)]
    pub delta_estimate: Option<f64>,
    #[serde(default)]
    pub coverage_estimate_pct: Option<f64>,
    #[serde(default)]
    pub substeps_requested: Option<u32>,
    pub now: DateTime<Utc>,
}

impl Validate for GuardrailContext {
    fn validate(&self) -> Result<(), ContractError> {
        require_non_empty("taskId", &self.task.id)?;
        if let Some(delta) = self.delta_estimate {
            require_non_negative("deltaEstimate", delta)?;
        }
        if let Some(cov) = self.coverage_estimate_pct {
            require_non_negative("coverageEstimatePct", cov)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailResult {
    Allow,
    Throttle,
    Block,
}

impl GuardrailResult {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardrailResult::Allow => "allow",
            GuardrailResult::Throttle => "throttle",
            GuardrailResult::Block => "block",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleId {
    TimeboxExpired,
    RenewalLimitExceeded,
    DailyDeltaLimit,
    CoverageLimit,
    ConcurrentSubstepsLimit,
}

impl RuleId {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleId::TimeboxExpired => "TIMEBOX_EXPIRED",
            RuleId::RenewalLimitExceeded => "RENEWAL_LIMIT_EXCEEDED",
            RuleId::DailyDeltaLimit => "DAILY_DELTA_LIMIT",
            RuleId::CoverageLimit => "COVERAGE_LIMIT",
            RuleId::ConcurrentSubstepsLimit => "CONCURRENT_SUBSTEPS_LIMIT",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the rule trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleFiring {
    pub rule: RuleId,
    pub effect: GuardrailResult,
    pub message: String,
}

/// Field overrides produced by throttle rules.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adjusted {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_estimate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_estimate_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substeps_requested: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailDecision {
    pub result: GuardrailResult,
    pub rules_fired: Vec<RuleFiring>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted: Option<Adjusted>,
    pub evaluation_ms: f64,
}

impl GuardrailDecision {
    /// Block is the only result that stops the caller.
    pub fn allowed(&self) -> bool {
        self.result != GuardrailResult::Block
    }

    pub fn fired(&self, rule: RuleId) -> bool {
        self.rules_fired.iter().any(|r| r.rule == rule)
    }
}

#[derive(Clone, Debug)]
pub struct GuardrailEngine {
    policy: GuardrailPolicy,
}

impl Default for GuardrailEngine {
    fn default() -> Self {
        Self {
            policy: GuardrailPolicy::default(),
        }
    }
}

impl GuardrailEngine {
    pub fn with_policy(policy: GuardrailPolicy) -> Result<Self, ContractError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &GuardrailPolicy {
        &self.policy
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(&self.policy).unwrap_or(serde_json::json!({}))
    }

    pub fn evaluate(&self, ctx: &GuardrailContext) -> Result<GuardrailDecision, ContractError> {
        ctx.validate()?;
        let started = Instant::now();

        let blocks = self.block_rules(ctx);
        let (result, rules_fired, adjusted) = if !blocks.is_empty() {
            (GuardrailResult::Block, blocks, None)
        } else {
            let (throttles, adjusted) = self.throttle_rules(ctx);
            if throttles.is_empty() {
                (GuardrailResult::Allow, throttles, None)
            } else {
                (GuardrailResult::Throttle, throttles, Some(adjusted))
            }
        };

        Ok(GuardrailDecision {
            result,
            rules_fired,
            adjusted,
            evaluation_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn block_rules(&self, ctx: &GuardrailContext) -> Vec<RuleFiring> {
        let p = &self.policy;
        let mut out = Vec::new();

        let expires_at = timebox_expiry(ctx.task.created_at, p.timebox_hours);
        if ctx.now > expires_at && !ctx.change_kind.bypasses_timebox() {
            out.push(RuleFiring {
                rule: RuleId::TimeboxExpired,
                effect: GuardrailResult::Block,
                message: format!(
                    "task {} exceeded its {}h timebox at {}",
                    ctx.task.id,
                    p.timebox_hours,
                    expires_at.to_rfc3339()
                ),
            });
        }

        if ctx.change_kind == ChangeKind::Renew && ctx.task.renewals >= p.renewal_limit {
            out.push(RuleFiring {
                rule: RuleId::RenewalLimitExceeded,
                effect: GuardrailResult::Block,
                message: format!(
                    "task {} already renewed {} times (limit {})",
                    ctx.task.id, ctx.task.renewals, p.renewal_limit
                ),
            });
        }

        out
    }

    fn throttle_rules(&self, ctx: &GuardrailContext) -> (Vec<RuleFiring>, Adjusted) {
        let p = &self.policy;
        let mut out = Vec::new();
        let mut adjusted = Adjusted::default();

        if let (Some(delta), Some(limit)) = (ctx.delta_estimate, p.daily_delta_limit) {
            if delta > limit {
                adjusted.delta_estimate = Some(limit);
                out.push(RuleFiring {
                    rule: RuleId::DailyDeltaLimit,
                    effect: GuardrailResult::Throttle,
                    message: format!("deltaEstimate {delta} exceeds daily limit {limit}; clamped"),
                });
            }
        }

        if let Some(cov) = ctx.coverage_estimate_pct {
            if cov > p.coverage_limit_pct {
                adjusted.coverage_estimate_pct = Some(p.coverage_limit_pct);
                out.push(RuleFiring {
                    rule: RuleId::CoverageLimit,
                    effect: GuardrailResult::Throttle,
                    message: format!(
                        "coverageEstimatePct {cov} exceeds limit {}; clamped",
                        p.coverage_limit_pct
                    ),
                });
            }
        }

        if let Some(steps) = ctx.substeps_requested {
            if steps > p.concurrent_substeps_limit {
                adjusted.substeps_requested = Some(p.concurrent_substeps_limit);
                out.push(RuleFiring {
                    rule: RuleId::ConcurrentSubstepsLimit,
                    effect: GuardrailResult::Throttle,
                    message: format!(
                        "substepsRequested {steps} exceeds concurrent limit {}; clamped",
                        p.concurrent_substeps_limit
                    ),
                });
            }
        }

        (out, adjusted)
    }
}

/// Instant at which a timebox anchored at `created_at` runs out.
///
/// Saturates at the representable range instead of overflowing.
pub fn timebox_expiry(created_at: DateTime<Utc>, timebox_hours: f64) -> DateTime<Utc> {
    let millis = (timebox_hours * 3_600_000.0).round() as i64;
    Duration::try_milliseconds(millis)
        .and_then(|d| created_at.checked_add_signed(d))
        .unwrap_or(if millis < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

/// Human-readable remaining time: `"Xd Yh"`, `"Xh Ym"`, `"Ym"` or `"EXPIRED"`.
pub fn timebox_status(created_at: DateTime<Utc>, timebox_hours: f64, now: DateTime<Utc>) -> String {
    let remaining = timebox_expiry(created_at, timebox_hours) - now;
    if remaining <= Duration::zero() {
        return "EXPIRED".to_string();
    }
    let minutes = remaining.num_minutes();
    let days = minutes / (24 * 60);
    let hours = (minutes % (24 * 60)) / 60;
    let mins = minutes % 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    }
}
