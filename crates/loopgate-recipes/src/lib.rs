//! Reflexive recipe expansion.
//!
//! A recipe is folded against a decision into tasks and artifacts. Every
//! output id is derived from `(decision_id, recipe_id)`, so expanding the same
//! pair twice yields the same ids and the same rationale text.

use chrono::{DateTime, Duration, Utc};
use loopgate_activation::Decision;
use loopgate_contracts::{require_finite, require_non_empty};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

mod book;
mod families;

pub use book::{glob_matches, RecipeBook};
pub use families::{base_gain, is_known_family, DEFAULT_FAMILY, DEFAULT_GAIN};
pub use loopgate_contracts::{ContractError, Validate};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecipeAction {
    SwitchFamily {
        #[serde(default)]
        family: Option<String>,
    },
    ScaleGain {
        param: String,
        factor: f64,
    },
    SetParam {
        param: String,
        value: f64,
    },
    ReweightTier {
        tier: String,
        weight: f64,
    },
    AdjustBand {
        band: String,
        delta: f64,
    },
}

impl RecipeAction {
    pub fn kind(&self) -> &'static str {
        match self {
            RecipeAction::SwitchFamily { .. } => "switch_family",
            RecipeAction::ScaleGain { .. } => "scale_gain",
            RecipeAction::SetParam { .. } => "set_param",
            RecipeAction::ReweightTier { .. } => "reweight_tier",
            RecipeAction::AdjustBand { .. } => "adjust_band",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            RecipeAction::SwitchFamily { family } => format!(
                "switch controller family to {}",
                family.as_deref().unwrap_or(DEFAULT_FAMILY)
            ),
            RecipeAction::ScaleGain { param, factor } => format!("scale {param} by {factor}"),
            RecipeAction::SetParam { param, value } => format!("set {param} to {value}"),
            RecipeAction::ReweightTier { tier, weight } => {
                format!("reweight tier {tier} to {weight}")
            }
            RecipeAction::AdjustBand { band, delta } => format!("adjust band {band} by {delta}"),
        }
    }
}

impl Validate for RecipeAction {
    fn validate(&self) -> Result<(), ContractError> {
        match self {
            RecipeAction::SwitchFamily { family } => {
                if let Some(f) = family {
                    require_non_empty("family", f)?;
                }
                Ok(())
            }
            RecipeAction::ScaleGain { param, factor } => {
                require_non_empty("param", param)?;
                require_finite("factor", *factor)
            }
            RecipeAction::SetParam { param, value } => {
                require_non_empty("param", param)?;
                require_finite("value", *value)
            }
            RecipeAction::ReweightTier { tier, weight } => {
                require_non_empty("tier", tier)?;
                require_finite("weight", *weight)
            }
            RecipeAction::AdjustBand { band, delta } => {
                require_non_empty("band", band)?;
                require_finite("delta", *delta)
            }
        }
    }
}

/// Longest review horizon an evaluation may schedule: ten years.
pub const MAX_REVIEW_IN_DAYS: u32 = 3650;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationSpec {
    pub method: String,
    pub review_in_days: u32,
    #[serde(default)]
    pub indicators: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,
    /// Loop-code patterns; `*` and `?` glob. Empty matches every loop.
    #[serde(default)]
    pub applies_to: Vec<String>,
    #[serde(default)]
    pub actions: Vec<RecipeAction>,
    #[serde(default)]
    pub evaluation: Option<EvaluationSpec>,
}

impl Recipe {
    pub fn applies_to_loop(&self, loop_code: &str) -> bool {
        self.applies_to.is_empty() || self.applies_to.iter().any(|p| glob_matches(p, loop_code))
    }
}

impl Validate for Recipe {
    fn validate(&self) -> Result<(), ContractError> {
        require_non_empty("recipe.id", &self.id)?;
        self.actions.validate()?;
        if let Some(eval) = &self.evaluation {
            require_non_empty("evaluation.method", &eval.method)?;
            if eval.review_in_days > MAX_REVIEW_IN_DAYS {
                return Err(ContractError::OutOfRange {
                    field: "evaluation.reviewInDays",
                    reason: "must be <= 3650",
                });
            }
        }
        Ok(())
    }
}

/// A unit of work emitted by expansion or by the base task composer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDraft {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSettings {
    pub family: String,
    pub params: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningChange {
    pub id: String,
    pub decision_id: String,
    pub loop_id: String,
    /// Family default and base gain of every key the recipe touched.
    pub before: ControllerSettings,
    pub after: ControllerSettings,
    pub rationale: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandTarget {
    Tier,
    Band,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandWeightChange {
    pub id: String,
    pub decision_id: String,
    pub loop_id: String,
    pub target: BandTarget,
    pub key: String,
    /// Always 0.0; baseline population is left to the caller.
    pub before: f64,
    pub after: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalDesign {
    pub id: String,
    pub decision_id: String,
    pub loop_id: String,
    pub method: String,
    pub indicators: Vec<String>,
    pub review_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expansion {
    pub tasks: Vec<TaskDraft>,
    pub tuning: Option<TuningChange>,
    pub bands: Vec<BandWeightChange>,
    pub eval_plan: Option<EvalDesign>,
}

/// Supplies the tasks an automation collaborator would create regardless of
/// the recipe.
pub trait BaseTaskComposer {
    fn compose(&self, decision: &Decision, recipe: &Recipe) -> Vec<TaskDraft>;
}

impl<F> BaseTaskComposer for F
where
    F: Fn(&Decision, &Recipe) -> Vec<TaskDraft>,
{
    fn compose(&self, decision: &Decision, recipe: &Recipe) -> Vec<TaskDraft> {
        self(decision, recipe)
    }
}

/// Composer that contributes nothing.
pub fn no_base_tasks(_: &Decision, _: &Recipe) -> Vec<TaskDraft> {
    Vec::new()
}

fn artifact_prefix(decision_id: &str, recipe_id: &str) -> String {
    format!("{decision_id}:RX:{recipe_id}")
}

pub fn synthetic_task_id(decision_id: &str, recipe_id: &str, index: usize) -> String {
    format!("{}:{index}", artifact_prefix(decision_id, recipe_id))
}

struct TuningFold {
    family: Option<String>,
    params: BTreeMap<String, f64>,
    before: BTreeMap<String, f64>,
    fragments: Vec<String>,
}

impl TuningFold {
    fn new() -> Self {
        Self {
            family: None,
            params: BTreeMap::new(),
            before: BTreeMap::new(),
            fragments: Vec::new(),
        }
    }

    fn family(&self) -> &str {
        self.family.as_deref().unwrap_or(DEFAULT_FAMILY)
    }

    /// Record the pre-recipe value of `param` (from the starting family) and
    /// return its current value under the active family.
    fn touch(&mut self, param: &str) -> f64 {
        self.before
            .entry(param.to_string())
            .or_insert_with(|| base_gain(DEFAULT_FAMILY, param));
        self.params
            .get(param)
            .copied()
            .unwrap_or_else(|| base_gain(self.family(), param))
    }

    fn apply(&mut self, action: &RecipeAction) {
        match action {
            RecipeAction::SwitchFamily { family } => {
                let target = family.clone().unwrap_or_else(|| DEFAULT_FAMILY.to_string());
                if !is_known_family(&target) {
                    tracing::debug!(family = %target, "switching to family without default table");
                }
                self.fragments.push(format!("family -> {target}"));
                self.family = Some(target);
            }
            RecipeAction::ScaleGain { param, factor } => {
                let current = self.touch(param);
                let next = current * factor;
                self.params.insert(param.clone(), next);
                self.fragments
                    .push(format!("{param} x{factor} ({current} -> {next})"));
            }
            RecipeAction::SetParam { param, value } => {
                self.touch(param);
                self.params.insert(param.clone(), *value);
                self.fragments.push(format!("{param} = {value}"));
            }
            RecipeAction::ReweightTier { .. } | RecipeAction::AdjustBand { .. } => {}
        }
    }

    fn finish(self, prefix: &str, decision: &Decision, recipe_id: &str) -> TuningChange {
        let family = self.family().to_string();
        TuningChange {
            id: format!("{prefix}:tuning"),
            decision_id: decision.decision_id.clone(),
            loop_id: decision.loop_id.clone(),
            before: ControllerSettings {
                family: DEFAULT_FAMILY.to_string(),
                params: self.before,
            },
            after: ControllerSettings {
                family,
                params: self.params,
            },
            rationale: format!(
                "{recipe_id} for {}: {}",
                decision.decision_id,
                self.fragments.join("; ")
            ),
        }
    }
}

/// Fold `recipe` against `decision`.
///
/// Tuning actions accumulate in recipe order into one [`TuningChange`];
/// band actions each yield their own [`BandWeightChange`]. Base tasks from
/// `composer` come first in the task list and win on id collisions.
pub fn expand(
    decision: &Decision,
    recipe: &Recipe,
    composer: &dyn BaseTaskComposer,
    now: DateTime<Utc>,
) -> Result<Expansion, ContractError> {
    require_non_empty("decisionId", &decision.decision_id)?;
    recipe.validate()?;

    let prefix = artifact_prefix(&decision.decision_id, &recipe.id);
    let mut fold = TuningFold::new();
    let mut touched_tuning = false;
    let mut bands = Vec::new();
    let mut synthetic = Vec::with_capacity(recipe.actions.len().max(1));

    for (index, action) in recipe.actions.iter().enumerate() {
        let band = match action {
            RecipeAction::ReweightTier { tier, weight } => Some((BandTarget::Tier, tier, *weight)),
            RecipeAction::AdjustBand { band, delta } => Some((BandTarget::Band, band, *delta)),
            _ => None,
        };
        if let Some((target, key, after)) = band {
            bands.push(BandWeightChange {
                id: format!("{prefix}:band:{index}"),
                decision_id: decision.decision_id.clone(),
                loop_id: decision.loop_id.clone(),
                target,
                key: key.clone(),
                before: 0.0,
                after,
            });
        } else {
            fold.apply(action);
            touched_tuning = true;
        }
        synthetic.push(TaskDraft {
            id: synthetic_task_id(&decision.decision_id, &recipe.id, index),
            title: action.describe(),
            action: Some(action.kind().to_string()),
        });
    }

    if recipe.actions.is_empty() {
        synthetic.push(TaskDraft {
            id: synthetic_task_id(&decision.decision_id, &recipe.id, 0),
            title: format!("review {} (no actions)", recipe.id),
            action: None,
        });
    }

    let tuning = touched_tuning.then(|| fold.finish(&prefix, decision, &recipe.id));

    let eval_plan = match &recipe.evaluation {
        Some(spec) => {
            let review_at = Duration::try_days(i64::from(spec.review_in_days))
                .and_then(|d| now.checked_add_signed(d))
                .ok_or(ContractError::OutOfRange {
                    field: "evaluation.reviewInDays",
                    reason: "review date is not representable",
                })?;
            Some(EvalDesign {
                id: format!("{prefix}:eval"),
                decision_id: decision.decision_id.clone(),
                loop_id: decision.loop_id.clone(),
                method: spec.method.clone(),
                indicators: spec.indicators.clone(),
                review_at,
            })
        }
        None => None,
    };

    let mut seen = HashSet::new();
    let tasks = composer
        .compose(decision, recipe)
        .into_iter()
        .chain(synthetic)
        .filter(|t| seen.insert(t.id.clone()))
        .collect();

    Ok(Expansion {
        tasks,
        tuning,
        bands,
        eval_plan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use loopgate_activation::{decide, ActivationInput, Hints, Readiness, ScoreVector};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn decision() -> Decision {
        let input = ActivationInput {
            loop_id: "water.pressure".into(),
            window: "7d".into(),
            scores: ScoreVector {
                severity: 0.2,
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
        decide(&input, now()).expect("decision")
    }

    fn recipe(actions: Vec<RecipeAction>) -> Recipe {
        Recipe {
            id: "rx-damp".into(),
            applies_to: vec!["water.*".into()],
            actions,
            evaluation: None,
        }
    }

    #[test]
    fn later_set_param_overrides_earlier_scaling() {
        let r = recipe(vec![
            RecipeAction::ScaleGain {
                param: "Kp".into(),
                factor: 0.8,
            },
            RecipeAction::SetParam {
                param: "Kd".into(),
                value: 0.0,
            },
            RecipeAction::ScaleGain {
                param: "Ki".into(),
                factor: 2.0,
            },
            RecipeAction::SetParam {
                param: "Ki".into(),
                value: 0.5,
            },
        ]);
        let out = expand(&decision(), &r, &no_base_tasks, now()).expect("expansion");
        let tuning = out.tuning.expect("tuning");
        assert_eq!(tuning.after.family, "PI");
        assert_eq!(tuning.after.params.get("Kp"), Some(&0.8));
        assert_eq!(tuning.after.params.get("Kd"), Some(&0.0));
        assert_eq!(tuning.after.params.get("Ki"), Some(&0.5));
        assert_eq!(tuning.before.params.get("Kp"), Some(&1.0));
        assert!(tuning.id.ends_with(":RX:rx-damp:tuning"));
    }

    #[test]
    fn fold_matches_documented_example() {
        let r = recipe(vec![
            RecipeAction::ScaleGain {
                param: "Kp".into(),
                factor: 0.8,
            },
            RecipeAction::SetParam {
                param: "Kd".into(),
                value: 0.0,
            },
        ]);
        let out = expand(&decision(), &r, &no_base_tasks, now()).expect("expansion");
        let params = out.tuning.expect("tuning").after.params;
        let expected: BTreeMap<String, f64> =
            [("Kd".to_string(), 0.0), ("Kp".to_string(), 0.8)].into_iter().collect();
        assert_eq!(params, expected);
    }

    #[test]
    fn expansion_is_idempotent() {
        let d = decision();
        let r = recipe(vec![
            RecipeAction::SwitchFamily {
                family: Some("PID".into()),
            },
            RecipeAction::ScaleGain {
                param: "Kd".into(),
                factor: 1.5,
            },
            RecipeAction::AdjustBand {
                band: "upper".into(),
                delta: -0.1,
            },
        ]);
        let a = expand(&d, &r, &no_base_tasks, now()).expect("first");
        let b = expand(&d, &r, &no_base_tasks, now()).expect("second");
        let ids = |e: &Expansion| e.tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
        assert_eq!(
            a.tuning.as_ref().map(|t| t.rationale.clone()),
            b.tuning.as_ref().map(|t| t.rationale.clone())
        );
        assert_eq!(a, b);
    }

    #[test]
    fn band_actions_are_not_folded() {
        let r = recipe(vec![
            RecipeAction::ReweightTier {
                tier: "t1".into(),
                weight: 0.4,
            },
            RecipeAction::AdjustBand {
                band: "lower".into(),
                delta: 0.05,
            },
            RecipeAction::AdjustBand {
                band: "lower".into(),
                delta: 0.05,
            },
        ]);
        let d = decision();
        let out = expand(&d, &r, &no_base_tasks, now()).expect("expansion");
        assert!(out.tuning.is_none());
        assert_eq!(out.bands.len(), 3);
        assert!(out.bands.iter().all(|b| b.before == 0.0));
        assert_eq!(out.bands[0].target, BandTarget::Tier);
        assert_eq!(out.bands[2].id, format!("{}:RX:rx-damp:band:2", d.decision_id));
    }

    #[test]
    fn empty_recipe_yields_single_noop_task() {
        let d = decision();
        let out = expand(&d, &recipe(vec![]), &no_base_tasks, now()).expect("expansion");
        assert_eq!(out.tasks.len(), 1);
        assert_eq!(out.tasks[0].id, format!("{}:RX:rx-damp:0", d.decision_id));
        assert!(out.tuning.is_none());
        assert!(out.bands.is_empty());
    }

    #[test]
    fn base_tasks_come_first_and_win_duplicates() {
        let d = decision();
        let clash = synthetic_task_id(&d.decision_id, "rx-damp", 0);
        let composer = move |_: &Decision, _: &Recipe| {
            vec![
                TaskDraft {
                    id: "notify-owner".into(),
                    title: "notify loop owner".into(),
                    action: None,
                },
                TaskDraft {
                    id: clash.clone(),
                    title: "base version".into(),
                    action: None,
                },
            ]
        };
        let r = recipe(vec![RecipeAction::SetParam {
            param: "Kp".into(),
            value: 0.9,
        }]);
        let out = expand(&d, &r, &composer, now()).expect("expansion");
        assert_eq!(out.tasks.len(), 2);
        assert_eq!(out.tasks[0].id, "notify-owner");
        assert_eq!(out.tasks[1].title, "base version");
    }

    #[test]
    fn evaluation_spec_schedules_review() {
        let mut r = recipe(vec![]);
        r.evaluation = Some(EvaluationSpec {
            method: "interrupted_time_series".into(),
            review_in_days: 14,
            indicators: vec!["pressure_var".into()],
        });
        let out = expand(&decision(), &r, &no_base_tasks, now()).expect("expansion");
        let eval = out.eval_plan.expect("eval plan");
        assert_eq!(eval.review_at, now() + Duration::days(14));
        assert!(eval.id.ends_with(":eval"));
    }

    #[test]
    fn oversized_review_horizon_is_rejected() {
        let raw = r#"{"id":"rx","evaluation":{"method":"its","reviewInDays":4000000000}}"#;
        let r: Recipe = serde_json::from_str(raw).expect("recipe");
        assert!(matches!(
            r.validate(),
            Err(ContractError::OutOfRange {
                field: "evaluation.reviewInDays",
                ..
            })
        ));
        assert!(expand(&decision(), &r, &no_base_tasks, now()).is_err());

        let mut edge = recipe(vec![]);
        edge.evaluation = Some(EvaluationSpec {
            method: "its".into(),
            review_in_days: MAX_REVIEW_IN_DAYS,
            indicators: vec![],
        });
        let out = expand(&decision(), &edge, &no_base_tasks, now()).expect("expansion");
        assert_eq!(
            out.eval_plan.expect("eval").review_at,
            now() + Duration::days(3650)
        );
        let late = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert!(expand(&decision(), &edge, &no_base_tasks, late).is_err());
    }

    #[test]
    fn before_settings_come_from_the_starting_family() {
        let r = recipe(vec![
            RecipeAction::SwitchFamily {
                family: Some("P".into()),
            },
            RecipeAction::ScaleGain {
                param: "Ki".into(),
                factor: 0.5,
            },
        ]);
        let tuning = expand(&decision(), &r, &no_base_tasks, now())
            .expect("expansion")
            .tuning
            .expect("tuning");
        assert_eq!(tuning.before.family, DEFAULT_FAMILY);
        assert_eq!(
            tuning.before.params.get("Ki"),
            Some(&base_gain(DEFAULT_FAMILY, "Ki"))
        );
        assert_eq!(tuning.after.family, "P");
        assert_eq!(tuning.after.params.get("Ki"), Some(&(base_gain("P", "Ki") * 0.5)));
    }

    #[test]
    fn non_finite_factors_are_rejected() {
        let r = recipe(vec![RecipeAction::ScaleGain {
            param: "Kp".into(),
            factor: f64::NAN,
        }]);
        assert!(expand(&decision(), &r, &no_base_tasks, now()).is_err());
    }

    #[test]
    fn actions_deserialize_from_tagged_json() {
        let raw = r#"{"id":"rx","actions":[{"type":"switch_family"},{"type":"scale_gain","param":"Kp","factor":0.5}]}"#;
        let r: Recipe = serde_json::from_str(raw).expect("recipe");
        assert_eq!(r.actions[0], RecipeAction::SwitchFamily { family: None });
        assert!(r.applies_to_loop("anything"));
    }
}
