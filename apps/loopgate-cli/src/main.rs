use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod commands;

use commands::{
    DecideArgs, ExpandArgs, GuardrailArgs, PathsArgs, RecipesCmd, ReconcileArgs, SchemaArgs,
    TaskCmd, TimeboxArgs,
};

#[derive(Parser)]
#[command(name = "loopgate-cli", version, about = "Loopgate CLI utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print effective settings (JSON)
    Paths(PathsArgs),
    /// Print or write the config file JSON schema
    ConfigSchema(SchemaArgs),
    /// Run the activation decision engine on one input
    Decide(DecideArgs),
    /// Evaluate a change against the guardrail policy
    Guardrail(GuardrailArgs),
    /// Report timebox remaining for a task anchor
    Timebox(TimeboxArgs),
    /// Expand a reflexive decision with a recipe
    Expand(ExpandArgs),
    /// Recipe helpers
    Recipes {
        #[command(subcommand)]
        cmd: RecipesCmd,
    },
    /// Repair lock/assignment/task drift in the local store
    Reconcile(ReconcileArgs),
    /// Inspect tasks and journaled events in the local store
    Task {
        #[command(subcommand)]
        cmd: TaskCmd,
    },
}

fn dispatch(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Paths(args) => commands::paths::run(args),
        Commands::ConfigSchema(args) => commands::paths::schema(args),
        Commands::Decide(args) => commands::decide::run(args),
        Commands::Guardrail(args) => commands::guardrail::run(args),
        Commands::Timebox(args) => commands::guardrail::timebox(args),
        Commands::Expand(args) => commands::expand::run(args),
        Commands::Recipes { cmd } => commands::recipes::run(cmd),
        Commands::Reconcile(args) => commands::store::reconcile(args),
        Commands::Task { cmd } => commands::store::task(cmd),
    }
}

fn main() {
    // Logs go to stderr so stdout stays machine-readable.
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli.command) {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::try_parse_from([
            "loopgate-cli",
            "recipes",
            "inspect",
            "r.yaml",
            "--loop",
            "boiler-1",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Commands::Recipes { .. }));

        let cli = Cli::try_parse_from(["loopgate-cli", "reconcile", "--grace-secs", "30"])
            .expect("parse");
        match cli.command {
            Commands::Reconcile(args) => assert_eq!(args.grace_secs, Some(30)),
            _ => panic!("expected reconcile"),
        }

        assert!(Cli::try_parse_from(["loopgate-cli", "task", "show"]).is_err());
    }
}
