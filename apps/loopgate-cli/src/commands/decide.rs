use anyhow::Result;
use clap::Args;
use loopgate_activation::{decide_timed, ActivationInput, TimedDecision};

use super::util::{parse_now, print_json, read_json};

#[derive(Args)]
pub struct DecideArgs {
    /// ActivationInput JSON file (`-` for stdin)
    #[arg(long)]
    pub input: String,
    /// Evaluation instant (RFC3339); defaults to now
    #[arg(long)]
    pub now: Option<String>,
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

pub fn run(args: DecideArgs) -> Result<()> {
    let input: ActivationInput = read_json(&args.input)?;
    let out = evaluate(&input, args.now.as_deref())?;
    print_json(&out, args.pretty)
}

fn evaluate(input: &ActivationInput, now: Option<&str>) -> Result<TimedDecision> {
    Ok(decide_timed(input, parse_now(now)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopgate_activation::{Capacity, Hints, Readiness, ScoreVector};

    fn input(auto_ok: bool) -> ActivationInput {
        ActivationInput {
            loop_id: "grid.load".into(),
            window: "7d".into(),
            scores: ScoreVector {
                severity: 1.2,
                persistence: 0.1,
                dispersion: 0.1,
                hub_load: 0.1,
                legitimacy_delta: 0.0,
                readiness: Readiness {
                    auto_ok,
                    block_reasons: vec![],
                },
            },
            hints: Hints::default(),
        }
    }

    #[test]
    fn offline_decide_is_deterministic_for_fixed_now() {
        let now = Some("2026-04-01T09:00:00Z");
        let a = evaluate(&input(true), now).expect("decide");
        let b = evaluate(&input(true), now).expect("decide");
        assert_eq!(a.decision, b.decision);
        assert_eq!(a.decision.capacity, Some(Capacity::Responsive));

        let blocked = evaluate(&input(false), now).expect("decide");
        assert!(blocked.decision.blocked);
        assert_eq!(blocked.decision.capacity, None);
    }

    #[test]
    fn bad_now_is_an_error() {
        assert!(evaluate(&input(true), Some("soon")).is_err());
    }
}
