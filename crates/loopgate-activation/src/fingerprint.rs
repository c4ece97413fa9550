use chrono::{DateTime, Utc};
use sha2::Digest as _;

use crate::{Capacity, ReasonCode};

pub const WEEK_SECS: i64 = 7 * 24 * 60 * 60;

/// Stands in for the capacity of a blocked decision.
pub const BLOCKED_MARKER: &str = "BLOCKED";

/// Seven-day bucket index of `now`. Identical conditions recurring in the same
/// bucket hash identically.
pub fn week_bucket(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(WEEK_SECS)
}

fn sha256_hex(material: &str) -> String {
    let mut h = sha2::Sha256::new();
    h.update(material.as_bytes());
    format!("{:x}", h.finalize())
}

/// Deterministic digest identifying a repeatable decision.
///
/// Reason codes are sorted before hashing, so their emission order does not
/// affect the result.
pub fn fingerprint(
    loop_id: &str,
    capacity: Option<Capacity>,
    template: &str,
    reasons: &[ReasonCode],
    window: &str,
    now: DateTime<Utc>,
) -> String {
    let mut codes: Vec<&str> = reasons.iter().map(|r| r.as_str()).collect();
    codes.sort_unstable();
    let material = format!(
        "{}|{}|{}|{}|{}|{}",
        loop_id,
        capacity.map(Capacity::as_str).unwrap_or(BLOCKED_MARKER),
        template,
        codes.join(","),
        window,
        week_bucket(now)
    );
    sha256_hex(&material)
}

/// Per-attempt id: stable for an identical (fingerprint, instant) pair.
pub fn decision_id(fingerprint: &str, now: DateTime<Utc>) -> String {
    let digest = sha256_hex(&format!("{}|{}", fingerprint, now.timestamp_millis()));
    format!("dec_{}", &digest[..24])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn bucket_start() -> DateTime<Utc> {
        // 2026-01-01 is exactly 2922 weeks after the epoch.
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn same_bucket_hashes_identically() {
        let start = bucket_start();
        let a = fingerprint(
            "loop-1",
            Some(Capacity::Structural),
            "structural_reform",
            &[ReasonCode::Persistent, ReasonCode::HubOverload],
            "7d",
            start,
        );
        let b = fingerprint(
            "loop-1",
            Some(Capacity::Structural),
            "structural_reform",
            &[ReasonCode::HubOverload, ReasonCode::Persistent],
            "7d",
            start + Duration::days(6),
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn next_bucket_changes_fingerprint() {
        let start = bucket_start();
        assert_eq!(week_bucket(start) + 1, week_bucket(start + Duration::days(7)));
        let a = fingerprint("loop-1", None, "dq_triage", &[ReasonCode::DqBlock], "7d", start);
        let b = fingerprint(
            "loop-1",
            None,
            "dq_triage",
            &[ReasonCode::DqBlock],
            "7d",
            start + Duration::days(7),
        );
        assert_ne!(a, b);
    }

    #[test]
    fn decision_ids_differ_per_instant() {
        let start = bucket_start();
        let fp = fingerprint("loop-1", None, "dq_triage", &[], "7d", start);
        assert_eq!(decision_id(&fp, start), decision_id(&fp, start));
        assert_ne!(
            decision_id(&fp, start),
            decision_id(&fp, start + Duration::milliseconds(1))
        );
        assert!(decision_id(&fp, start).starts_with("dec_"));
    }
}
