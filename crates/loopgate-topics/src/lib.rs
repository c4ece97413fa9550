//! Canonical event topic constants shared across services.
//!
//! Every event the server publishes on the bus (and journals to the kernel)
//! uses one of these names. Keep this list alphabetized within sections and
//! favor dot.case names.

// Activation
pub const TOPIC_ACTIVATION_BLOCKED: &str = "activation.blocked";
pub const TOPIC_ACTIVATION_DECIDED: &str = "activation.decided";
pub const TOPIC_ACTIVATION_EXPANDED: &str = "activation.expanded";

// Guardrails
pub const TOPIC_GUARDRAIL_EVALUATED: &str = "guardrail.evaluated";
pub const TOPIC_GUARDRAIL_RENEWED: &str = "guardrail.renewed";

// Tasks / claims
pub const TOPIC_TASKS_CLAIMED: &str = "tasks.claimed";
pub const TOPIC_TASKS_CLAIM_REJECTED: &str = "tasks.claim.rejected";
pub const TOPIC_TASKS_CREATED: &str = "tasks.created";
pub const TOPIC_TASKS_RECONCILED: &str = "tasks.reconciled";
pub const TOPIC_TASKS_RELEASED: &str = "tasks.released";

// Service lifecycle
pub const TOPIC_SERVICE_START: &str = "service.start";
pub const TOPIC_SERVICE_STOP: &str = "service.stop";

/// All topics, for `/about` and journal filters.
pub const ALL_TOPICS: &[&str] = &[
    TOPIC_ACTIVATION_BLOCKED,
    TOPIC_ACTIVATION_DECIDED,
    TOPIC_ACTIVATION_EXPANDED,
    TOPIC_GUARDRAIL_EVALUATED,
    TOPIC_GUARDRAIL_RENEWED,
    TOPIC_TASKS_CLAIMED,
    TOPIC_TASKS_CLAIM_REJECTED,
    TOPIC_TASKS_CREATED,
    TOPIC_TASKS_RECONCILED,
    TOPIC_TASKS_RELEASED,
    TOPIC_SERVICE_START,
    TOPIC_SERVICE_STOP,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn topics_are_unique_and_dot_case() {
        let mut seen = HashSet::new();
        for topic in ALL_TOPICS {
            assert!(seen.insert(*topic), "duplicate topic {topic}");
            assert!(topic
                .chars()
                .all(|c| c.is_ascii_lowercase() || c == '.' || c == '_'));
        }
    }
}
