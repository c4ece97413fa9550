use serde::{Deserialize, Serialize};

/// Response mode assigned to a monitored loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capacity {
    Responsive,
    Reflexive,
    Deliberative,
    Anticipatory,
    Structural,
}

impl Capacity {
    pub const ALL: [Capacity; 5] = [
        Capacity::Responsive,
        Capacity::Reflexive,
        Capacity::Deliberative,
        Capacity::Anticipatory,
        Capacity::Structural,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capacity::Responsive => "responsive",
            Capacity::Reflexive => "reflexive",
            Capacity::Deliberative => "deliberative",
            Capacity::Anticipatory => "anticipatory",
            Capacity::Structural => "structural",
        }
    }

    pub fn route(self) -> Route {
        match self {
            Capacity::Responsive => Route {
                open_route: "/respond/rapid",
                preselect_template: "rapid_response",
            },
            Capacity::Reflexive => Route {
                open_route: "/reflexive/tuning",
                preselect_template: "reflexive_tuning",
            },
            Capacity::Deliberative => Route {
                open_route: "/deliberate/forum",
                preselect_template: "deliberation_brief",
            },
            Capacity::Anticipatory => Route {
                open_route: "/anticipate/scenarios",
                preselect_template: "scenario_watch",
            },
            Capacity::Structural => Route {
                open_route: "/structural/review",
                preselect_template: "structural_reform",
            },
        }
    }
}

/// UI route and template a decision opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub open_route: &'static str,
    pub preselect_template: &'static str,
}

/// Route used for every blocked (data-quality) decision.
pub const TRIAGE_ROUTE: Route = Route {
    open_route: "/triage/data-quality",
    preselect_template: "dq_triage",
};

/// Why a rule fired. A single rule may contribute several codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    DqBlock,
    SeverityBreach,
    SeveritySustained,
    LegitimacyDrop,
    FairnessRisk,
    Persistent,
    HubOverload,
    Recurrence,
    EarlyWarning,
    ReviewDue,
    RecentAction,
    DefaultReflexive,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::DqBlock => "DQ_BLOCK",
            ReasonCode::SeverityBreach => "SEVERITY_BREACH",
            ReasonCode::SeveritySustained => "SEVERITY_SUSTAINED",
            ReasonCode::LegitimacyDrop => "LEGITIMACY_DROP",
            ReasonCode::FairnessRisk => "FAIRNESS_RISK",
            ReasonCode::Persistent => "PERSISTENT",
            ReasonCode::HubOverload => "HUB_OVERLOAD",
            ReasonCode::Recurrence => "RECURRENCE",
            ReasonCode::EarlyWarning => "EARLY_WARNING",
            ReasonCode::ReviewDue => "REVIEW_DUE",
            ReasonCode::RecentAction => "RECENT_ACTION",
            ReasonCode::DefaultReflexive => "DEFAULT_REFLEXIVE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_capacity_has_a_distinct_route() {
        let routes: HashSet<_> = Capacity::ALL
            .iter()
            .map(|c| c.route().open_route)
            .collect();
        assert_eq!(routes.len(), Capacity::ALL.len());
        assert!(!routes.contains(TRIAGE_ROUTE.open_route));
    }

    #[test]
    fn reason_code_strings_match_serde() {
        for code in [ReasonCode::DqBlock, ReasonCode::HubOverload, ReasonCode::DefaultReflexive] {
            let json = serde_json::to_value(code).expect("reason json");
            assert_eq!(json, serde_json::Value::String(code.as_str().into()));
        }
    }
}
