use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use clap::{Args, Subcommand};
use loopgate_core::Settings;
use loopgate_kernel::{Kernel, ReconcileReport};
use serde_json::json;
use std::path::PathBuf;

use super::util::print_json;

fn open_kernel(state_dir: Option<PathBuf>) -> Result<(Kernel, Settings)> {
    let settings = Settings::load()?;
    let dir = state_dir.unwrap_or_else(|| settings.state_dir.clone());
    Ok((Kernel::open(&dir)?, settings))
}

#[derive(Args)]
pub struct ReconcileArgs {
    /// Skip rows younger than this; defaults to `claims.reconcile_grace_secs`
    #[arg(long)]
    pub grace_secs: Option<u64>,
    /// Override the state directory
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

pub fn reconcile(args: ReconcileArgs) -> Result<()> {
    let (kernel, settings) = open_kernel(args.state_dir)?;
    let grace = args.grace_secs.unwrap_or(settings.reconcile_grace_secs);
    let report = reconcile_with(&kernel, grace)?;
    print_json(&report, false)
}

fn reconcile_with(kernel: &Kernel, grace_secs: u64) -> Result<ReconcileReport> {
    let grace = i64::try_from(grace_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| anyhow!("--grace-secs {grace_secs} is out of range"))?;
    kernel.reconcile(Utc::now(), grace)
}

#[derive(Subcommand)]
pub enum TaskCmd {
    /// Show a task with its lock, owners and event trail
    Show(TaskShowArgs),
    /// Print the most recent journaled bus events
    Events(EventsArgs),
}

#[derive(Args)]
pub struct TaskShowArgs {
    pub id: String,
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct EventsArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: i64,
    #[arg(long)]
    pub state_dir: Option<PathBuf>,
}

pub fn task(cmd: TaskCmd) -> Result<()> {
    match cmd {
        TaskCmd::Show(args) => {
            let (kernel, _) = open_kernel(args.state_dir)?;
            print_json(&show(&kernel, &args.id)?, true)
        }
        TaskCmd::Events(args) => {
            let (kernel, _) = open_kernel(args.state_dir)?;
            print_json(&kernel.recent_events(args.limit.max(1))?, true)
        }
    }
}

fn show(kernel: &Kernel, id: &str) -> Result<serde_json::Value> {
    let task = kernel
        .get_task(id)?
        .ok_or_else(|| anyhow!("task {id} not found"))?;
    Ok(json!({
        "task": task,
        "lock": kernel.task_lock(id)?,
        "assignments": kernel.assignments(id)?,
        "events": kernel.task_events(id)?,
    }))
}
