use anyhow::Result;
use clap::Args;
use loopgate_core::Settings;
use std::path::PathBuf;

use super::util::print_json;

#[derive(Args)]
pub struct PathsArgs {
    /// Pretty-print JSON
    #[arg(long)]
    pub pretty: bool,
}

/// Print the effective settings: config file, state dir, recipes dir, policy.
pub fn run(args: PathsArgs) -> Result<()> {
    let settings = Settings::load()?;
    print_json(&settings, args.pretty)
}

#[derive(Args)]
pub struct SchemaArgs {
    /// Write the schema here instead of stdout
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Emit the JSON schema the config file is validated against.
pub fn schema(args: SchemaArgs) -> Result<()> {
    match args.out {
        Some(path) => {
            loopgate_core::write_schema_file(&path)?;
            eprintln!("wrote {}", path.display());
            Ok(())
        }
        None => print_json(&loopgate_core::config_schema_json(), true),
    }
}
