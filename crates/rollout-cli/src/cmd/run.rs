use anyhow::Context;
use clap::Args;
use rollout_core::{
    confirm::{AutoConfirm, Confirm, TerminalConfirm},
    engine::ActionStatus,
    paths,
    plan::{Capabilities, Plan},
    reconcile::{CycleReport, CycleResult, Reconciler},
    store::KvStore,
    versions::VersionStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cmd::open_store;
use crate::output::{print_json, print_table};

#[derive(Args)]
pub struct RunArgs {
    /// Plan file, re-read every cycle
    #[arg(long, env = "ROLLOUT_PLAN", default_value = paths::PLAN_FILE)]
    pub plan: PathBuf,

    /// Run a single cycle and exit
    #[arg(long, conflicts_with = "cycles")]
    pub once: bool,

    /// Run this many cycles and exit (default: run until interrupted)
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Seconds between cycles (default: the plan's interval_seconds)
    #[arg(long)]
    pub interval: Option<u64>,

    /// Approve every confirmation prompt without asking
    #[arg(long, short = 'y')]
    pub yes: bool,
}

impl RunArgs {
    fn cycle_limit(&self) -> Option<u64> {
        if self.once {
            Some(1)
        } else {
            self.cycles
        }
    }
}

pub fn run(root: &Path, store: Option<&Path>, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let plan_path = paths::resolve(root, &args.plan);

    // Later cycles tolerate a broken plan; the first one must load.
    let initial = Plan::load(&plan_path)
        .with_context(|| format!("failed to load plan {}", plan_path.display()))?;
    let interval = args
        .interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| initial.interval());

    let kv: Arc<dyn KvStore> = Arc::new(open_store(root, store)?);
    let confirm: Arc<dyn Confirm> = if args.yes {
        Arc::new(AutoConfirm(true))
    } else {
        Arc::new(TerminalConfirm::new())
    };
    let caps = Capabilities {
        versions: VersionStore::new(kv),
        confirm,
    };

    let limit = args.cycle_limit();
    tracing::info!(
        plan = %plan_path.display(),
        interval_seconds = interval.as_secs(),
        cycles = ?limit,
        "starting reconciliation"
    );

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(async {
        let mut reconciler = Reconciler::new(interval, || {
            let built = Plan::load(&plan_path).and_then(|plan| plan.build(&caps));
            async move { built }
        });
        let report = |cycle: &CycleReport| {
            if let Err(e) = print_cycle(cycle, json) {
                tracing::warn!(error = %e, "failed to print cycle report");
            }
        };
        match limit {
            Some(n) => reconciler.run_cycles(n, report).await,
            None => {
                tokio::select! {
                    _ = reconciler.run_forever(report) => {}
                    _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
                }
            }
        }
    });
    // A pending stdin read lives on a blocking thread that cannot be
    // cancelled; do not wait for it on exit.
    rt.shutdown_background();
    Ok(())
}

fn print_cycle(cycle: &CycleReport, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(cycle);
    }
    println!(
        "cycle {} ({}) at {}",
        cycle.cycle,
        cycle.id,
        cycle.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    match &cycle.result {
        CycleResult::PlanFailed { reason } => println!("  plan failed: {reason}"),
        CycleResult::Ran { reports } if reports.is_empty() => println!("  no actions"),
        CycleResult::Ran { reports } => {
            let rows: Vec<Vec<String>> = reports
                .iter()
                .map(|r| {
                    let detail = match &r.status {
                        ActionStatus::Failed { reason } => reason.clone(),
                        _ => String::new(),
                    };
                    vec![r.action.clone(), r.status.label().to_string(), detail]
                })
                .collect();
            print_table(&["ACTION", "STATUS", "DETAIL"], &rows);
        }
    }
    println!();
    Ok(())
}
