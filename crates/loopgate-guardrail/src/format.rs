use crate::{GuardrailDecision, GuardrailResult, RuleId};

/// Who a rendered decision is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Audience {
    EndUser,
    Technical,
}

impl Audience {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "end_user" | "end-user" | "enduser" | "user" => Some(Audience::EndUser),
            "technical" | "tech" => Some(Audience::Technical),
            _ => None,
        }
    }
}

fn plain_reason(rule: RuleId) -> &'static str {
    match rule {
        RuleId::TimeboxExpired => "the time allotted for this task has run out",
        RuleId::RenewalLimitExceeded => "this task has been extended as many times as allowed",
        RuleId::DailyDeltaLimit => "the requested change is larger than the daily allowance",
        RuleId::CoverageLimit => "the change would reach more people than currently allowed",
        RuleId::ConcurrentSubstepsLimit => "too many steps were requested at once",
    }
}

/// Render a decision as text. End users get plain sentences; technical
/// readers get rule ids, messages and the adjusted fields.
pub fn format_decision(decision: &GuardrailDecision, audience: Audience) -> String {
    match audience {
        Audience::EndUser => {
            let head = match decision.result {
                GuardrailResult::Allow => return "Allowed.".to_string(),
                GuardrailResult::Throttle => "Allowed with reduced scope",
                GuardrailResult::Block => "Not allowed",
            };
            let reasons: Vec<&str> = decision
                .rules_fired
                .iter()
                .map(|f| plain_reason(f.rule))
                .collect();
            format!("{head}: {}.", reasons.join("; "))
        }
        Audience::Technical => {
            let mut lines = vec![format!(
                "result={} evaluation_ms={:.3}",
                decision.result.as_str(),
                decision.evaluation_ms
            )];
            for fired in &decision.rules_fired {
                lines.push(format!(
                    "  [{}] {}: {}",
                    fired.effect.as_str(),
                    fired.rule,
                    fired.message
                ));
            }
            if let Some(adj) = &decision.adjusted {
                if let Some(v) = adj.delta_estimate {
                    lines.push(format!("  adjusted.deltaEstimate={v}"));
                }
                if let Some(v) = adj.coverage_estimate_pct {
                    lines.push(format!("  adjusted.coverageEstimatePct={v}"));
                }
                if let Some(v) = adj.substeps_requested {
                    lines.push(format!("  adjusted.substepsRequested={v}"));
                }
            }
            lines.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Adjusted, RuleFiring};

    fn throttled() -> GuardrailDecision {
        GuardrailDecision {
            result: GuardrailResult::Throttle,
            rules_fired: vec![RuleFiring {
                rule: RuleId::CoverageLimit,
                effect: GuardrailResult::Throttle,
                message: "coverageEstimatePct 0.5 exceeds limit 0.2; clamped".into(),
            }],
            adjusted: Some(Adjusted {
                coverage_estimate_pct: Some(0.2),
                ..Adjusted::default()
            }),
            evaluation_ms: 0.01,
        }
    }

    #[test]
    fn end_user_text_hides_rule_ids() {
        let text = format_decision(&throttled(), Audience::EndUser);
        assert!(text.starts_with("Allowed with reduced scope"));
        assert!(!text.contains("COVERAGE_LIMIT"));
    }

    #[test]
    fn technical_text_lists_rules_and_adjustments() {
        let text = format_decision(&throttled(), Audience::Technical);
        assert!(text.contains("result=throttle"));
        assert!(text.contains("COVERAGE_LIMIT"));
        assert!(text.contains("adjusted.coverageEstimatePct=0.2"));
    }

    #[test]
    fn audience_parse() {
        assert_eq!(Audience::parse("Technical"), Some(Audience::Technical));
        assert_eq!(Audience::parse("end_user"), Some(Audience::EndUser));
        assert_eq!(Audience::parse("robot"), None);
    }
}
