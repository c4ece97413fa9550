//! Activation decision engine.
//!
//! Classifies a loop's score vector into one of five response capacities.
//! Rules are evaluated in a fixed order and the first rule that fires wins;
//! the output (including the fingerprint) is a pure function of the input and
//! the evaluation instant.

use chrono::{DateTime, Utc};
use loopgate_contracts::{require_finite, require_non_empty, ContractError, Validate};
use serde::{Deserialize, Serialize};
use std::time::Instant;

mod fingerprint;
mod routes;

pub use fingerprint::{decision_id, fingerprint, week_bucket, BLOCKED_MARKER, WEEK_SECS};
pub use routes::{Capacity, ReasonCode, Route, TRIAGE_ROUTE};

pub const SEVERITY_BREACH: f64 = 1.0;
pub const SEVERITY_HIGH: f64 = 0.7;
pub const PERSISTENCE_SUSTAINED: f64 = 0.4;
pub const PERSISTENCE_STRUCTURAL: f64 = 0.6;
pub const HUB_LOAD_STRUCTURAL: f64 = 0.8;
pub const LEGITIMACY_DROP: f64 = -0.3;
pub const RECENT_ACTION_DAYS: u32 = 45;

const BLOCKED_CONFIDENCE: f64 = 0.9;
const DEFAULT_CONFIDENCE: f64 = 0.3;

fn default_window() -> String {
    "7d".to_string()
}

/// Data-readiness gate supplied by the monitoring collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Readiness {
    pub auto_ok: bool,
    #[serde(default)]
    pub block_reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreVector {
    pub severity: f64,
    pub persistence: f64,
    pub dispersion: f64,
    pub hub_load: f64,
    pub legitimacy_delta: f64,
    pub readiness: Readiness,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentAction {
    #[serde(default)]
    pub review_due: bool,
    #[serde(default)]
    pub within_days: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hints {
    #[serde(default)]
    pub fairness_risk: bool,
    #[serde(default)]
    pub recurrence_flag: bool,
    #[serde(default)]
    pub early_warning: bool,
    #[serde(default)]
    pub recent_action: Option<RecentAction>,
}

/// One activation attempt for a loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationInput {
    pub loop_id: String,
    #[serde(default = "default_window")]
    pub window: String,
    pub scores: ScoreVector,
    #[serde(default)]
    pub hints: Hints,
}

impl Validate for ScoreVector {
    fn validate(&self) -> Result<(), ContractError> {
        require_finite("severity", self.severity)?;
        require_finite("persistence", self.persistence)?;
        require_finite("dispersion", self.dispersion)?;
        require_finite("hubLoad", self.hub_load)?;
        require_finite("legitimacyDelta", self.legitimacy_delta)?;
        Ok(())
    }
}

impl Validate for ActivationInput {
    fn validate(&self) -> Result<(), ContractError> {
        require_non_empty("loopId", &self.loop_id)?;
        require_non_empty("window", &self.window)?;
        self.scores.validate()
    }
}

/// Immutable outcome of one activation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub decision_id: String,
    pub loop_id: String,
    pub capacity: Option<Capacity>,
    pub reason_codes: Vec<ReasonCode>,
    pub confidence: f64,
    pub open_route: String,
    pub preselect_template: String,
    pub blocked: bool,
    pub block_reasons: Vec<String>,
    pub fingerprint: String,
    pub window: String,
    pub decided_at: DateTime<Utc>,
}

/// A decision plus the time spent computing it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimedDecision {
    pub decision: Decision,
    pub evaluation_ms: f64,
}

struct Rule {
    capacity: Capacity,
    confidence: f64,
    fire: fn(&ScoreVector, &Hints) -> Vec<ReasonCode>,
}

// Order is significant: the first rule returning any reason wins.
const RULES: [Rule; 5] = [
    Rule {
        capacity: Capacity::Responsive,
        confidence: 0.9,
        fire: responsive_reasons,
    },
    Rule {
        capacity: Capacity::Deliberative,
        confidence: 0.8,
        fire: deliberative_reasons,
    },
    Rule {
        capacity: Capacity::Structural,
        confidence: 0.8,
        fire: structural_reasons,
    },
    Rule {
        capacity: Capacity::Anticipatory,
        confidence: 0.7,
        fire: anticipatory_reasons,
    },
    Rule {
        capacity: Capacity::Reflexive,
        confidence: 0.6,
        fire: reflexive_reasons,
    },
];

fn responsive_reasons(s: &ScoreVector, _: &Hints) -> Vec<ReasonCode> {
    let mut out = Vec::new();
    if s.severity >= SEVERITY_BREACH {
        out.push(ReasonCode::SeverityBreach);
    }
    if s.severity >= SEVERITY_HIGH && s.persistence >= PERSISTENCE_SUSTAINED {
        out.push(ReasonCode::SeveritySustained);
    }
    out
}

fn deliberative_reasons(s: &ScoreVector, h: &Hints) -> Vec<ReasonCode> {
    let mut out = Vec::new();
    if s.legitimacy_delta <= LEGITIMACY_DROP {
        out.push(ReasonCode::LegitimacyDrop);
    }
    if h.fairness_risk {
        out.push(ReasonCode::FairnessRisk);
    }
    out
}

fn structural_reasons(s: &ScoreVector, h: &Hints) -> Vec<ReasonCode> {
    let mut out = Vec::new();
    if s.persistence >= PERSISTENCE_STRUCTURAL {
        out.push(ReasonCode::Persistent);
    }
    if s.hub_load >= HUB_LOAD_STRUCTURAL {
        out.push(ReasonCode::HubOverload);
    }
    if h.recurrence_flag {
        out.push(ReasonCode::Recurrence);
    }
    out
}

fn anticipatory_reasons(s: &ScoreVector, h: &Hints) -> Vec<ReasonCode> {
    if h.early_warning && s.severity < SEVERITY_HIGH {
        vec![ReasonCode::EarlyWarning]
    } else {
        Vec::new()
    }
}

fn reflexive_reasons(_: &ScoreVector, h: &Hints) -> Vec<ReasonCode> {
    let mut out = Vec::new();
    if let Some(recent) = &h.recent_action {
        if recent.review_due {
            out.push(ReasonCode::ReviewDue);
        }
        if recent
            .within_days
            .is_some_and(|days| days <= RECENT_ACTION_DAYS)
        {
            out.push(ReasonCode::RecentAction);
        }
    }
    out
}

struct Classification {
    capacity: Option<Capacity>,
    reasons: Vec<ReasonCode>,
    confidence: f64,
}

fn classify(scores: &ScoreVector, hints: &Hints) -> Classification {
    if !scores.readiness.auto_ok {
        return Classification {
            capacity: None,
            reasons: vec![ReasonCode::DqBlock],
            confidence: BLOCKED_CONFIDENCE,
        };
    }
    for rule in &RULES {
        let reasons = (rule.fire)(scores, hints);
        if !reasons.is_empty() {
            return Classification {
                capacity: Some(rule.capacity),
                reasons,
                confidence: rule.confidence,
            };
        }
    }
    Classification {
        capacity: Some(Capacity::Reflexive),
        reasons: vec![ReasonCode::DefaultReflexive],
        confidence: DEFAULT_CONFIDENCE,
    }
}

/// Classify one activation attempt.
///
/// Validation runs first; a malformed input never reaches the rule table.
pub fn decide(input: &ActivationInput, now: DateTime<Utc>) -> Result<Decision, ContractError> {
    input.validate()?;

    let Classification {
        capacity,
        reasons,
        confidence,
    } = classify(&input.scores, &input.hints);
    let blocked = capacity.is_none();
    let route = capacity.map(Capacity::route).unwrap_or(TRIAGE_ROUTE);
    let block_reasons = if blocked {
        input.scores.readiness.block_reasons.clone()
    } else {
        Vec::new()
    };

    let fp = fingerprint(
        &input.loop_id,
        capacity,
        route.preselect_template,
        &reasons,
        &input.window,
        now,
    );
    Ok(Decision {
        decision_id: decision_id(&fp, now),
        loop_id: input.loop_id.clone(),
        capacity,
        reason_codes: reasons,
        confidence,
        open_route: route.open_route.to_string(),
        preselect_template: route.preselect_template.to_string(),
        blocked,
        block_reasons,
        fingerprint: fp,
        window: input.window.clone(),
        decided_at: now,
    })
}

/// [`decide`] plus wall-clock evaluation latency for observability.
pub fn decide_timed(
    input: &ActivationInput,
    now: DateTime<Utc>,
) -> Result<TimedDecision, ContractError> {
    let started = Instant::now();
    let decision = decide(input, now)?;
    Ok(TimedDecision {
        decision,
        evaluation_ms: started.elapsed().as_secs_f64() * 1000.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 12, 0, 0).unwrap()
    }

    fn scores(severity: f64, persistence: f64, hub_load: f64, legitimacy_delta: f64) -> ScoreVector {
        ScoreVector {
            severity,
            persistence,
            dispersion: 0.2,
            hub_load,
            legitimacy_delta,
            readiness: Readiness {
                auto_ok: true,
                block_reasons: vec![],
            },
        }
    }

    fn input(scores: ScoreVector, hints: Hints) -> ActivationInput {
        ActivationInput {
            loop_id: "loop-water-07".into(),
            window: "7d".into(),
            scores,
            hints,
        }
    }

    #[test]
    fn persistent_loop_is_structural() {
        let decision = decide(&input(scores(0.5, 0.65, 0.3, 0.0), Hints::default()), now())
            .expect("decision");
        assert_eq!(decision.capacity, Some(Capacity::Structural));
        assert!(decision.reason_codes.contains(&ReasonCode::Persistent));
        assert_eq!(decision.confidence, 0.8);
        assert_eq!(decision.open_route, "/structural/review");
        assert!(!decision.blocked);
    }

    #[test]
    fn readiness_block_wins_over_critical_severity() {
        let mut s = scores(1.0, 0.9, 0.9, -0.5);
        s.readiness = Readiness {
            auto_ok: false,
            block_reasons: vec!["sensor gap".into()],
        };
        let decision = decide(&input(s, Hints::default()), now()).expect("decision");
        assert!(decision.blocked);
        assert_eq!(decision.capacity, None);
        assert_eq!(decision.reason_codes, vec![ReasonCode::DqBlock]);
        assert_eq!(decision.confidence, 0.9);
        assert_eq!(decision.block_reasons, vec!["sensor gap".to_string()]);
        assert_eq!(decision.open_route, TRIAGE_ROUTE.open_route);
    }

    #[test]
    fn critical_severity_outranks_structural_signals() {
        let hints = Hints {
            recurrence_flag: true,
            ..Hints::default()
        };
        let decision = decide(&input(scores(1.0, 0.9, 0.95, 0.0), hints), now()).expect("decision");
        assert_eq!(decision.capacity, Some(Capacity::Responsive));
        assert_eq!(
            decision.reason_codes,
            vec![ReasonCode::SeverityBreach, ReasonCode::SeveritySustained]
        );
    }

    #[test]
    fn fairness_hint_routes_to_deliberation() {
        let hints = Hints {
            fairness_risk: true,
            ..Hints::default()
        };
        let decision = decide(&input(scores(0.2, 0.1, 0.1, 0.0), hints), now()).expect("decision");
        assert_eq!(decision.capacity, Some(Capacity::Deliberative));
        assert_eq!(decision.reason_codes, vec![ReasonCode::FairnessRisk]);
    }

    #[test]
    fn early_warning_requires_moderate_severity() {
        let hints = Hints {
            early_warning: true,
            ..Hints::default()
        };
        let low = decide(&input(scores(0.3, 0.1, 0.1, 0.0), hints.clone()), now()).expect("low");
        assert_eq!(low.capacity, Some(Capacity::Anticipatory));
        assert_eq!(low.confidence, 0.7);

        // severity 0.75 with low persistence fires nothing above, and the
        // early-warning rule is suppressed, so it falls through to the default.
        let high = decide(&input(scores(0.75, 0.1, 0.1, 0.0), hints), now()).expect("high");
        assert_eq!(high.capacity, Some(Capacity::Reflexive));
        assert_eq!(high.reason_codes, vec![ReasonCode::DefaultReflexive]);
        assert_eq!(high.confidence, 0.3);
    }

    #[test]
    fn recent_action_within_window_is_reflexive() {
        let hints = Hints {
            recent_action: Some(RecentAction {
                review_due: false,
                within_days: Some(45),
            }),
            ..Hints::default()
        };
        let decision = decide(&input(scores(0.1, 0.1, 0.1, 0.0), hints), now()).expect("decision");
        assert_eq!(decision.capacity, Some(Capacity::Reflexive));
        assert_eq!(decision.reason_codes, vec![ReasonCode::RecentAction]);
        assert_eq!(decision.confidence, 0.6);

        let stale = Hints {
            recent_action: Some(RecentAction {
                review_due: false,
                within_days: Some(46),
            }),
            ..Hints::default()
        };
        let decision = decide(&input(scores(0.1, 0.1, 0.1, 0.0), stale), now()).expect("decision");
        assert_eq!(decision.reason_codes, vec![ReasonCode::DefaultReflexive]);
    }

    #[test]
    fn malformed_scores_are_rejected_before_rules() {
        let err = decide(&input(scores(f64::NAN, 0.1, 0.1, 0.0), Hints::default()), now())
            .expect_err("nan severity");
        assert!(matches!(err, ContractError::NotFinite { field: "severity", .. }));

        let mut blank = input(scores(0.1, 0.1, 0.1, 0.0), Hints::default());
        blank.loop_id = " ".into();
        assert_eq!(
            decide(&blank, now()).unwrap_err(),
            ContractError::MissingField("loopId")
        );
    }

    #[test]
    fn wire_shape_uses_camel_case() {
        let raw = serde_json::json!({
            "loopId": "loop-1",
            "scores": {
                "severity": 0.5, "persistence": 0.65, "dispersion": 0.2,
                "hubLoad": 0.3, "legitimacyDelta": 0.0,
                "readiness": {"autoOk": true}
            }
        });
        let parsed: ActivationInput = serde_json::from_value(raw).expect("parse input");
        assert_eq!(parsed.window, "7d");
        let decision = decide(&parsed, now()).expect("decision");
        let json = serde_json::to_value(&decision).expect("decision json");
        assert_eq!(json["capacity"], "structural");
        assert_eq!(json["reasonCodes"][0], "PERSISTENT");
        assert_eq!(json["preselectTemplate"], "structural_reform");
    }

    #[test]
    fn timed_decision_matches_untimed() {
        let i = input(scores(0.5, 0.65, 0.3, 0.0), Hints::default());
        let timed = decide_timed(&i, now()).expect("timed");
        assert_eq!(timed.decision, decide(&i, now()).expect("plain"));
        assert!(timed.evaluation_ms >= 0.0);
    }

    proptest! {
        #[test]
        fn decisions_are_deterministic(
            severity in 0.0f64..1.5,
            persistence in 0.0f64..1.0,
            hub_load in 0.0f64..1.0,
            legitimacy in -1.0f64..1.0,
            early in any::<bool>(),
            auto_ok in any::<bool>(),
        ) {
            let mut s = scores(severity, persistence, hub_load, legitimacy);
            s.readiness.auto_ok = auto_ok;
            let hints = Hints { early_warning: early, ..Hints::default() };
            let i = input(s, hints);
            let a = decide(&i, now()).unwrap();
            let b = decide(&i, now()).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn critical_severity_is_always_responsive_when_ready(
            persistence in 0.0f64..1.0,
            hub_load in 0.0f64..1.0,
            legitimacy in -1.0f64..1.0,
            fairness in any::<bool>(),
        ) {
            let hints = Hints { fairness_risk: fairness, recurrence_flag: true, ..Hints::default() };
            let d = decide(&input(scores(1.0, persistence, hub_load, legitimacy), hints), now()).unwrap();
            prop_assert_eq!(d.capacity, Some(Capacity::Responsive));
            prop_assert_eq!(d.confidence, 0.9);
        }

        #[test]
        fn blocked_decisions_never_carry_a_capacity(severity in 0.0f64..2.0) {
            let mut s = scores(severity, 0.9, 0.9, -0.9);
            s.readiness.auto_ok = false;
            let d = decide(&input(s, Hints::default()), now()).unwrap();
            prop_assert!(d.blocked);
            prop_assert_eq!(d.capacity, None);
        }
    }
}
