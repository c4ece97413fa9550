use anyhow::Result;
use clap::{Args, Subcommand};
use loopgate_core::Settings;
use loopgate_recipes::{Recipe, RecipeBook};
use serde_json::json;
use std::path::PathBuf;

use super::util::print_json;

#[derive(Subcommand)]
pub enum RecipesCmd {
    /// List recipes in the recipes directory, in selection order
    List(RecipesListArgs),
    /// Validate a recipe file and show which loops it targets
    Inspect(RecipesInspectArgs),
}

#[derive(Args)]
pub struct RecipesListArgs {
    /// Output as JSON instead of a table
    #[arg(long)]
    pub json: bool,
    /// Override the recipes directory
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct RecipesInspectArgs {
    /// Recipe file (JSON or YAML)
    pub source: PathBuf,
    /// Loop id to test against `appliesTo`
    #[arg(long = "loop")]
    pub loop_id: Option<String>,
}

pub fn run(cmd: RecipesCmd) -> Result<()> {
    match cmd {
        RecipesCmd::List(args) => list(args),
        RecipesCmd::Inspect(args) => inspect(args),
    }
}

fn list(args: RecipesListArgs) -> Result<()> {
    let dir = match args.dir {
        Some(dir) => dir,
        None => Settings::load()?.recipes_dir,
    };
    let book = RecipeBook::load_dir(&dir)?;
    if args.json {
        return print_json(&book.recipes(), true);
    }
    if book.is_empty() {
        println!("(no recipes found in {})", dir.display());
        return Ok(());
    }
    for line in summary_lines(book.recipes()) {
        println!("{line}");
    }
    Ok(())
}

fn summary_lines(recipes: &[Recipe]) -> Vec<String> {
    let width = recipes.iter().map(|r| r.id.len()).max().unwrap_or(0).max(2);
    let mut lines = vec![format!("{:<width$}  ACTIONS  APPLIES TO", "ID")];
    for r in recipes {
        let targets = if r.applies_to.is_empty() {
            "*".to_string()
        } else {
            r.applies_to.join(",")
        };
        lines.push(format!("{:<width$}  {:>7}  {targets}", r.id, r.actions.len()));
    }
    lines
}

fn inspect(args: RecipesInspectArgs) -> Result<()> {
    let recipe = super::expand::load_recipe(&args.source)?;
    let applies = args.loop_id.as_deref().map(|l| recipe.applies_to_loop(l));
    let actions: Vec<String> = recipe.actions.iter().map(|a| a.describe()).collect();
    print_json(
        &json!({
            "recipe": recipe,
            "actions": actions,
            "appliesToLoop": applies,
        }),
        true,
    )
}
