use anyhow::{anyhow, Result};
use clap::Args;
use loopgate_guardrail::{
    format_decision, load_policy_file, posture_to_policy, timebox_expiry, timebox_status,
    Audience, GuardrailContext, GuardrailEngine, GuardrailPolicy,
};
use serde_json::{json, Value};
use std::path::PathBuf;

use super::util::{parse_now, print_json, read_json};

#[derive(Args)]
pub struct GuardrailArgs {
    /// GuardrailContext JSON file (`-` for stdin)
    #[arg(long)]
    pub context: String,
    /// Policy file (JSON or TOML); wins over --posture
    #[arg(long)]
    pub policy: Option<PathBuf>,
    /// Preset: relaxed | standard | strict
    #[arg(long, default_value = "standard")]
    pub posture: String,
    /// Message register: end-user | technical
    #[arg(long, default_value = "end-user")]
    pub audience: String,
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

pub fn run(args: GuardrailArgs) -> Result<()> {
    let ctx: GuardrailContext = read_json(&args.context)?;
    let policy = match &args.policy {
        Some(path) => load_policy_file(path)?,
        None => posture_to_policy(&args.posture),
    };
    let out = evaluate(policy, &ctx, &args.audience)?;
    print_json(&out, args.pretty)
}

fn evaluate(policy: GuardrailPolicy, ctx: &GuardrailContext, audience: &str) -> Result<Value> {
    let audience = Audience::parse(audience)
        .ok_or_else(|| anyhow!("unknown audience {audience:?}; use end-user or technical"))?;
    let engine = GuardrailEngine::with_policy(policy)?;
    let decision = engine.evaluate(ctx)?;
    Ok(json!({
        "decision": decision,
        "allowed": decision.allowed(),
        "message": format_decision(&decision, audience),
    }))
}

#[derive(Args)]
pub struct TimeboxArgs {
    /// Timebox anchor (RFC3339): creation or last renewal
    #[arg(long)]
    pub created_at: String,
    /// Timebox length in hours
    #[arg(long)]
    pub hours: f64,
    /// Reference instant (RFC3339); defaults to now
    #[arg(long)]
    pub now: Option<String>,
}

pub fn timebox(args: TimeboxArgs) -> Result<()> {
    let out = timebox_report(&args.created_at, args.hours, args.now.as_deref())?;
    print_json(&out, false)
}

fn timebox_report(created_at: &str, hours: f64, now: Option<&str>) -> Result<Value> {
    if !(hours.is_finite() && hours > 0.0) {
        return Err(anyhow!("--hours must be a positive number"));
    }
    let anchor = parse_now(Some(created_at))?;
    let now = parse_now(now)?;
    Ok(json!({
        "expiresAt": timebox_expiry(anchor, hours),
        "status": timebox_status(anchor, hours, now),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use loopgate_guardrail::{ChangeKind, TaskSnapshot};

    fn ctx(change_kind: ChangeKind, renewals: u32) -> GuardrailContext {
        GuardrailContext {
            task: TaskSnapshot {
                id: "t-1".into(),
                created_at: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
                renewals,
            },
            change_kind,
            delta_estimate: None,
            coverage_estimate_pct: None,
            substeps_requested: None,
            now: Utc.with_ymd_and_hms(2026, 4, 2, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn strict_posture_blocks_second_renewal() {
        let out = evaluate(posture_to_policy("strict"), &ctx(ChangeKind::Renew, 1), "technical")
            .expect("evaluate");
        assert_eq!(out["allowed"], false);
        assert_eq!(out["decision"]["result"], "block");
        assert!(out["message"].as_str().expect("message").contains("RENEWAL_LIMIT_EXCEEDED"));
    }

    #[test]
    fn unknown_audience_is_rejected() {
        assert!(evaluate(GuardrailPolicy::default(), &ctx(ChangeKind::Update, 0), "pirate").is_err());
    }

    #[test]
    fn timebox_report_formats_remaining() {
        let out = timebox_report("2026-04-01T00:00:00Z", 72.0, Some("2026-04-02T00:00:00Z"))
            .expect("timebox");
        assert_eq!(out["status"], "2d 0h");
        let out = timebox_report("2026-04-01T00:00:00Z", 24.0, Some("2026-04-02T00:00:01Z"))
            .expect("timebox");
        assert_eq!(out["status"], "EXPIRED");
        assert!(timebox_report("2026-04-01T00:00:00Z", 0.0, None).is_err());
    }
}
