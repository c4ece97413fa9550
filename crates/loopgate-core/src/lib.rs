//! Configuration and runtime paths shared by the Loopgate binaries.

use anyhow::{Context, Result};
use loopgate_guardrail::{load_policy_file, posture_to_policy, GuardrailPolicy};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub mod config;
#[cfg(test)]
mod test_support;

pub use config::{config_schema_json, load_config, parse_config, write_schema_file, Config};

/// Resolve a config file path independent of the current working directory.
///
/// Search order (first existing wins):
/// - `LOOPGATE_CONFIG_DIR` joined with `rel`
/// - directory of the current executable, then its parent
/// - workspace root during development
/// - current working directory
///
/// An absolute `rel` is returned if it exists.
pub fn resolve_config_path(rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return rel_path.exists().then(|| rel_path.to_path_buf());
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(cfg_dir) = std::env::var("LOOPGATE_CONFIG_DIR") {
        if !cfg_dir.trim().is_empty() {
            candidates.push(PathBuf::from(cfg_dir));
        }
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.push(exe_dir.to_path_buf());
            if let Some(parent) = exe_dir.parent() {
                candidates.push(parent.to_path_buf());
            }
        }
    }
    candidates.push(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../"));
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd);
    }

    candidates
        .into_iter()
        .map(|base| base.join(rel))
        .find(|p| p.exists())
}

/// Load the config named by `LOOPGATE_CONFIG`, else `configs/default.toml`
/// if one can be found. A broken file is logged and ignored.
pub fn load_effective_config() -> (Option<Config>, Option<PathBuf>) {
    let path = match std::env::var("LOOPGATE_CONFIG") {
        Ok(p) if !p.trim().is_empty() => Some(PathBuf::from(p)),
        _ => resolve_config_path("configs/default.toml"),
    };
    let Some(path) = path else {
        return (None, None);
    };
    match load_config(&path) {
        Ok(cfg) => (Some(cfg), Some(path)),
        Err(e) => {
            tracing::error!("{e:#}");
            (None, Some(path))
        }
    }
}

fn default_state_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "loopgate", "loopgate")
        .map(|p| p.data_local_dir().to_path_buf())
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".loopgate")))
        .unwrap_or_else(|| PathBuf::from("./state"))
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Policy precedence: `LOOPGATE_GUARDRAIL_FILE`, `LOOPGATE_GUARDRAIL_POSTURE`,
/// the config's inline table, the config's posture, then `standard`.
pub fn effective_guardrail_policy(cfg: Option<&Config>) -> Result<GuardrailPolicy> {
    use loopgate_guardrail::Validate as _;

    if let Some(path) = env_nonempty("LOOPGATE_GUARDRAIL_FILE") {
        return load_policy_file(Path::new(&path));
    }
    if let Some(posture) = env_nonempty("LOOPGATE_GUARDRAIL_POSTURE") {
        return Ok(posture_to_policy(&posture));
    }
    let guardrail = cfg.map(|c| &c.guardrail);
    if let Some(table) = guardrail.and_then(|g| g.policy.as_ref()) {
        let policy = GuardrailPolicy::from(table);
        policy
            .validate()
            .context("inline [guardrail.policy] failed validation")?;
        return Ok(policy);
    }
    Ok(guardrail
        .and_then(|g| g.posture.as_deref())
        .map(posture_to_policy)
        .unwrap_or_default())
}

/// Fully resolved runtime settings: config file overlaid with environment.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub config_path: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub recipes_dir: PathBuf,
    pub bind: String,
    pub port: u16,
    pub lease_minutes: u32,
    pub reconcile_interval_secs: u64,
    pub reconcile_grace_secs: u64,
    pub guardrail: GuardrailPolicy,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let (cfg, config_path) = load_effective_config();
        Self::from_config(cfg.as_ref(), config_path)
    }

    pub fn from_config(cfg: Option<&Config>, config_path: Option<PathBuf>) -> Result<Self> {
        let state_dir = env_nonempty("LOOPGATE_STATE_DIR")
            .or_else(|| cfg.and_then(|c| c.runtime.state_dir.clone()))
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);
        let recipes_dir = env_nonempty("LOOPGATE_RECIPES_DIR")
            .or_else(|| cfg.and_then(|c| c.recipes.dir.clone()))
            .map(PathBuf::from)
            .map(|p| {
                if p.is_relative() {
                    resolve_config_path(&p.to_string_lossy()).unwrap_or(p)
                } else {
                    p
                }
            })
            .unwrap_or_else(|| state_dir.join("recipes"));
        let bind = env_nonempty("LOOPGATE_BIND")
            .or_else(|| cfg.and_then(|c| c.runtime.bind.clone()))
            .unwrap_or_else(|| "127.0.0.1".into());
        let port = match env_nonempty("LOOPGATE_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("LOOPGATE_PORT must be a port number, got {raw:?}"))?,
            None => cfg.and_then(|c| c.runtime.port).unwrap_or(8095),
        };
        let claims = cfg.map(|c| c.claims.clone()).unwrap_or_default();

        Ok(Self {
            config_path,
            state_dir,
            recipes_dir,
            bind,
            port,
            lease_minutes: claims.lease_minutes,
            reconcile_interval_secs: claims.reconcile_interval_secs,
            reconcile_grace_secs: claims.reconcile_grace_secs,
            guardrail: effective_guardrail_policy(cfg)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "LOOPGATE_STATE_DIR",
        "LOOPGATE_RECIPES_DIR",
        "LOOPGATE_BIND",
        "LOOPGATE_PORT",
        "LOOPGATE_GUARDRAIL_FILE",
        "LOOPGATE_GUARDRAIL_POSTURE",
    ];

    #[test]
    #[serial]
    fn env_overrides_config_values() {
        let mut guard = env::guard();
        guard.clear_keys(KEYS);
        let cfg = parse_config("[runtime]\nstate_dir = \"/srv/from-config\"\nport = 9000\n")
            .expect("config");

        let s = Settings::from_config(Some(&cfg), None).expect("settings");
        assert_eq!(s.state_dir, PathBuf::from("/srv/from-config"));
        assert_eq!(s.port, 9000);
        assert_eq!(s.recipes_dir, PathBuf::from("/srv/from-config/recipes"));

        guard.set("LOOPGATE_STATE_DIR", "/srv/from-env");
        guard.set("LOOPGATE_PORT", "9100");
        let s = Settings::from_config(Some(&cfg), None).expect("settings");
        assert_eq!(s.state_dir, PathBuf::from("/srv/from-env"));
        assert_eq!(s.port, 9100);

        guard.set("LOOPGATE_PORT", "not-a-port");
        assert!(Settings::from_config(Some(&cfg), None).is_err());
    }

    #[test]
    #[serial]
    fn guardrail_policy_precedence() {
        let mut guard = env::guard();
        guard.clear_keys(KEYS);
        let cfg = parse_config("[guardrail]\nposture = \"strict\"\n").expect("config");
        assert_eq!(
            effective_guardrail_policy(Some(&cfg)).expect("policy"),
            posture_to_policy("strict")
        );
        assert_eq!(
            effective_guardrail_policy(None).expect("policy"),
            posture_to_policy("standard")
        );

        guard.set("LOOPGATE_GUARDRAIL_POSTURE", "relaxed");
        assert_eq!(
            effective_guardrail_policy(Some(&cfg)).expect("policy"),
            posture_to_policy("relaxed")
        );

        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("policy.json");
        std::fs::write(
            &file,
            r#"{"timeboxHours":6,"coverageLimitPct":0.1,"concurrentSubstepsLimit":1,"renewalLimit":0,"evaluationRequiredAfterRenewals":0}"#,
        )
        .expect("write");
        guard.set("LOOPGATE_GUARDRAIL_FILE", &file.display().to_string());
        let policy = effective_guardrail_policy(Some(&cfg)).expect("policy");
        assert_eq!(policy.timebox_hours, 6.0);
    }

    #[test]
    #[serial]
    fn invalid_inline_policy_is_an_error() {
        let mut guard = env::guard();
        guard.clear_keys(KEYS);
        let cfg = parse_config(
            "[guardrail.policy]\ntimebox_hours = 0.0\ncoverage_limit_pct = 0.3\nconcurrent_substeps_limit = 2\nrenewal_limit = 1\nevaluation_required_after_renewals = 1\n",
        )
        .expect("schema accepts zero");
        assert!(effective_guardrail_policy(Some(&cfg)).is_err());
    }

    #[test]
    fn absolute_missing_path_resolves_to_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        assert!(resolve_config_path(&missing.to_string_lossy()).is_none());
        let present = dir.path().join("here.toml");
        std::fs::write(&present, "").expect("write");
        assert_eq!(
            resolve_config_path(&present.to_string_lossy()),
            Some(present.clone())
        );
    }
}
