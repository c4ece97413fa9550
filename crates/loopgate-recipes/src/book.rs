use anyhow::{Context, Result};
use loopgate_contracts::Validate;
use regex::Regex;
use std::fs;
use std::path::Path;

use crate::Recipe;

/// Match `subject` against a `*`/`?` glob. The whole string must match.
pub fn glob_matches(pattern: &str, subject: &str) -> bool {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map(|r| r.is_match(subject)).unwrap_or(false)
}

/// Recipes loaded from disk, kept in file-name order.
#[derive(Clone, Debug, Default)]
pub struct RecipeBook {
    recipes: Vec<Recipe>,
}

impl RecipeBook {
    pub fn new(recipes: Vec<Recipe>) -> Self {
        Self { recipes }
    }

    /// Read every `*.json`, `*.yaml` and `*.yml` file in `dir`.
    ///
    /// A missing directory yields an empty book. Any unreadable or invalid
    /// recipe fails the whole load.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "recipe dir missing; no recipes loaded");
            return Ok(Self::default());
        }
        let mut paths: Vec<_> = fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("json" | "yaml" | "yml")
                )
            })
            .collect();
        paths.sort();

        let mut recipes = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let recipe: Recipe = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => serde_json::from_str(&raw)
                    .with_context(|| format!("invalid recipe JSON {}", path.display()))?,
                _ => serde_yaml::from_str(&raw)
                    .with_context(|| format!("invalid recipe YAML {}", path.display()))?,
            };
            recipe
                .validate()
                .with_context(|| format!("recipe {} failed validation", path.display()))?;
            recipes.push(recipe);
        }
        tracing::info!(dir = %dir.display(), count = recipes.len(), "loaded recipes");
        Ok(Self { recipes })
    }

    pub fn recipes(&self) -> &[Recipe] {
        &self.recipes
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// First recipe whose patterns match `loop_id`.
    pub fn select(&self, loop_id: &str) -> Option<&Recipe> {
        self.recipes.iter().find(|r| r.applies_to_loop(loop_id))
    }

    pub fn get(&self, id: &str) -> Option<&Recipe> {
        self.recipes.iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecipeAction;

    #[test]
    fn glob_patterns() {
        assert!(glob_matches("water.*", "water.pressure"));
        assert!(glob_matches("loop-??", "loop-07"));
        assert!(!glob_matches("loop-??", "loop-007"));
        assert!(!glob_matches("water.*", "waterXpressure"));
        assert!(glob_matches("*", ""));
    }

    #[test]
    fn loads_json_and_yaml_in_name_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("b.yaml"),
            "id: rx-yaml\nappliesTo: [\"grid.*\"]\nactions:\n  - type: set_param\n    param: Kp\n    value: 0.7\n",
        )
        .expect("yaml");
        fs::write(
            dir.path().join("a.json"),
            r#"{"id":"rx-json","appliesTo":["water.*"],"actions":[{"type":"adjust_band","band":"upper","delta":0.1}]}"#,
        )
        .expect("json");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("txt");

        let book = RecipeBook::load_dir(dir.path()).expect("book");
        assert_eq!(book.len(), 2);
        assert_eq!(book.recipes()[0].id, "rx-json");
        assert_eq!(book.select("grid.north").map(|r| r.id.as_str()), Some("rx-yaml"));
        assert!(book.select("rail.east").is_none());
        assert_eq!(
            book.get("rx-yaml").map(|r| r.actions.clone()),
            Some(vec![RecipeAction::SetParam {
                param: "Kp".into(),
                value: 0.7
            }])
        );
    }

    #[test]
    fn invalid_recipe_fails_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("bad.json"), r#"{"id":"  "}"#).expect("json");
        assert!(RecipeBook::load_dir(dir.path()).is_err());
    }

    #[test]
    fn missing_dir_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let book = RecipeBook::load_dir(&dir.path().join("absent")).expect("book");
        assert!(book.is_empty());
    }
}
