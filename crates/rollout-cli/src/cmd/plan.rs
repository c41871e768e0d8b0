use anyhow::Context;
use clap::Subcommand;
use rollout_core::{paths, plan::Plan};
use std::path::{Path, PathBuf};

use crate::output::{names, print_json, print_table};

#[derive(Subcommand)]
pub enum PlanSubcommand {
    /// Expand the plan and list its actions in run order
    Show {
        #[arg(long, env = "ROLLOUT_PLAN", default_value = paths::PLAN_FILE)]
        plan: PathBuf,
    },
}

pub fn run(root: &Path, subcmd: PlanSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        PlanSubcommand::Show { plan } => show(root, &plan, json),
    }
}

fn show(root: &Path, plan: &Path, json: bool) -> anyhow::Result<()> {
    let path = paths::resolve(root, plan);
    let plan =
        Plan::load(&path).with_context(|| format!("failed to load plan {}", path.display()))?;
    let actions = plan.describe().context("failed to expand plan")?;

    if json {
        return print_json(&serde_json::json!({
            "interval_seconds": plan.interval_seconds,
            "actions": actions,
        }));
    }

    println!(
        "{} action(s), every {}s",
        actions.len(),
        plan.interval_seconds
    );
    let rows: Vec<Vec<String>> = actions
        .iter()
        .map(|a| {
            vec![
                a.name.clone(),
                names(&a.pre_checks),
                a.command.clone(),
                names(&a.post_checks),
            ]
        })
        .collect();
    print_table(&["ACTION", "PRE-CHECKS", "COMMAND", "POST-CHECKS"], &rows);
    Ok(())
}
