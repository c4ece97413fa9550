use anyhow::{Context, Result};
use clap::Args;
use loopgate_activation::Decision;
use loopgate_recipes::{expand, no_base_tasks, Expansion, Recipe, Validate};
use std::path::Path;

use super::util::{parse_now, print_json, read_json};

#[derive(Args)]
pub struct ExpandArgs {
    /// Decision JSON file (`-` for stdin), as printed by `decide`
    #[arg(long)]
    pub decision: String,
    /// Recipe file (JSON or YAML)
    #[arg(long)]
    pub recipe: String,
    /// Expansion instant (RFC3339); defaults to now
    #[arg(long)]
    pub now: Option<String>,
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

pub fn run(args: ExpandArgs) -> Result<()> {
    let raw: serde_json::Value = read_json(&args.decision)?;
    // Accept both a bare Decision and the `decide` output wrapping one.
    let decision: Decision = match raw.get("decision") {
        Some(inner) => serde_json::from_value(inner.clone()),
        None => serde_json::from_value(raw),
    }
    .context("input is not a decision")?;
    let recipe = load_recipe(Path::new(&args.recipe))?;
    let out = expand_once(&decision, &recipe, args.now.as_deref())?;
    print_json(&out, args.pretty)
}

pub(crate) fn load_recipe(path: &Path) -> Result<Recipe> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let recipe: Recipe = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid recipe YAML {}", path.display()))?,
        _ => serde_json::from_str(&raw)
            .with_context(|| format!("invalid recipe JSON {}", path.display()))?,
    };
    recipe.validate()?;
    Ok(recipe)
}

fn expand_once(decision: &Decision, recipe: &Recipe, now: Option<&str>) -> Result<Expansion> {
    if !recipe.applies_to_loop(&decision.loop_id) {
        tracing::warn!(recipe = %recipe.id, loop_id = %decision.loop_id, "recipe does not target this loop");
    }
    Ok(expand(decision, recipe, &no_base_tasks, parse_now(now)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use loopgate_activation::{decide, ActivationInput, Hints, Readiness, ScoreVector};

    fn decision() -> Decision {
        let input = ActivationInput {
            loop_id: "water.pressure".into(),
            window: "7d".into(),
            scores: ScoreVector {
                severity: 0.1,
                persistence: 0.1,
                dispersion: 0.1,
                hub_load: 0.1,
                legitimacy_delta: 0.0,
                readiness: Readiness {
                    auto_ok: true,
                    block_reasons: vec![],
                },
            },
            hints: Hints::default(),
        };
        decide(&input, Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()).expect("decide")
    }

    #[test]
    fn yaml_recipe_expands() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("retune.yaml");
        std::fs::write(
            &path,
            "id: retune\nappliesTo: [\"water.*\"]\nactions:\n  - type: switch_family\n    family: PID\n  - type: set_param\n    param: Kd\n    value: 0.2\nevaluation:\n  method: its\n  reviewInDays: 14\n",
        )
        .expect("write");
        let recipe = load_recipe(&path).expect("recipe");
        let d = decision();
        let out = expand_once(&d, &recipe, Some("2026-04-01T09:00:00Z")).expect("expand");
        assert_eq!(out.tasks.len(), 2);
        let tuning = out.tuning.expect("tuning");
        assert_eq!(tuning.after.family, "PID");
        assert_eq!(tuning.after.params.get("Kd"), Some(&0.2));
        let eval = out.eval_plan.expect("eval");
        assert_eq!(eval.review_at, Utc.with_ymd_and_hms(2026, 4, 15, 9, 0, 0).unwrap());
    }

    #[test]
    fn invalid_recipe_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"id": ""}"#).expect("write");
        assert!(load_recipe(&path).is_err());
    }
}
