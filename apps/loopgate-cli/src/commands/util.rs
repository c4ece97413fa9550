use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Read as _;
use std::path::Path;

/// Read JSON from a file, or from stdin when `source` is `-`.
pub fn read_json<T: DeserializeOwned>(source: &str) -> Result<T> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read stdin")?;
        buf
    } else {
        std::fs::read_to_string(Path::new(source))
            .with_context(|| format!("failed to read {source}"))?
    };
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {source}"))
}

pub fn parse_now(raw: Option<&str>) -> Result<DateTime<Utc>> {
    match raw {
        Some(s) => Ok(DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("--now must be RFC3339, got {s:?}"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

pub fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{out}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_parses_offsets_to_utc() {
        let t = parse_now(Some("2026-04-01T11:00:00+02:00")).expect("now");
        assert_eq!(t.to_rfc3339(), "2026-04-01T09:00:00+00:00");
        assert!(parse_now(Some("yesterday")).is_err());
    }
}
