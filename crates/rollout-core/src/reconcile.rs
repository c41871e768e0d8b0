//! Reconciliation driver.
//!
//! Each cycle builds a fresh action graph, runs it once through a
//! `Controller`, then sleeps a fixed interval. Nothing but external state
//! survives from one cycle to the next.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::engine::{Action, ActionReport, Controller};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CycleResult {
    Ran { reports: Vec<ActionReport> },
    /// The action graph could not be built; no action ran.
    PlanFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// 1-based.
    pub cycle: u64,
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(flatten)]
    pub result: CycleResult,
}

impl CycleReport {
    pub fn reports(&self) -> &[ActionReport] {
        match &self.result {
            CycleResult::Ran { reports } => reports,
            CycleResult::PlanFailed { .. } => &[],
        }
    }
}

pub struct Reconciler<B> {
    build: B,
    interval: Duration,
    cycle: u64,
}

impl<B, Fut> Reconciler<B>
where
    B: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<Action>>>,
{
    pub fn new(interval: Duration, build: B) -> Self {
        Self {
            build,
            interval,
            cycle: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Cycles completed so far.
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Build and run one pass. Never fails: a build error is logged and
    /// reported as `PlanFailed`.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = tracing::info_span!(
            "cycle",
            n = self.cycle,
            id = %id,
            started_at = %started_at
        );

        let result = async {
            tracing::info!("building action graph");
            match (self.build)().await {
                Ok(actions) => {
                    tracing::info!(actions = actions.len(), "running controller");
                    let reports = Controller::new(actions).run().await;
                    CycleResult::Ran { reports }
                }
                Err(e) => {
                    tracing::error!(error = %e, "could not build action graph");
                    CycleResult::PlanFailed {
                        reason: e.to_string(),
                    }
                }
            }
        }
        .instrument(span)
        .await;

        CycleReport {
            cycle: self.cycle,
            id,
            started_at,
            result,
        }
    }

    /// Run `n` cycles with the interval between them (not after the last).
    pub async fn run_cycles(&mut self, n: u64, mut on_cycle: impl FnMut(&CycleReport)) {
        for i in 0..n {
            let report = self.run_cycle().await;
            on_cycle(&report);
            if i + 1 < n {
                tokio::time::sleep(self.interval).await;
            }
        }
    }

    /// Run until the task is dropped or cancelled.
    pub async fn run_forever(&mut self, mut on_cycle: impl FnMut(&CycleReport)) {
        loop {
            let report = self.run_cycle().await;
            on_cycle(&report);
            tracing::debug!(seconds = self.interval.as_secs_f64(), "sleeping");
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ActionStatus, Check, Command};
    use crate::error::RolloutError;
    use crate::store::{KvStore, MemoryStore, StoreKey};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn flag() -> StoreKey {
        StoreKey::new(["flags", "ready"]).unwrap()
    }

    /// One action gated on a store flag; a second action sets the flag.
    fn graph(kv: Arc<MemoryStore>) -> Vec<Action> {
        let read = Arc::clone(&kv);
        let ready = Check::new("ready", move || {
            let v = read.get(&flag());
            async move { v.map(|v| v.is_some()) }
        });
        let gated = Action::builder("gated", Command::new("noop", || async { Ok(()) }))
            .pre_check(ready)
            .post_check(Check::constant("ok", true))
            .build();

        let write = Arc::clone(&kv);
        let set = Command::new("set flag", move || {
            let r = write.set(&flag(), "yes");
            async move { r }
        });
        let setter = Action::builder("setter", set)
            .pre_check(Check::constant("go", true))
            .post_check(Check::constant("ok", true))
            .build();
        vec![gated, setter]
    }

    #[tokio::test]
    async fn state_crosses_cycles_through_store() {
        let kv = Arc::new(MemoryStore::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let mut r = Reconciler::new(Duration::ZERO, || {
            builds.fetch_add(1, Ordering::SeqCst);
            let actions = graph(Arc::clone(&kv));
            async move { Ok(actions) }
        });

        let mut seen = Vec::new();
        r.run_cycles(2, |c| seen.push(c.clone())).await;

        assert_eq!(builds.load(Ordering::SeqCst), 2, "graph rebuilt every cycle");
        assert_eq!(seen[0].cycle, 1);
        assert_eq!(seen[0].reports()[0].status, ActionStatus::Blocked);
        assert_eq!(
            seen[1].reports()[0].status,
            ActionStatus::Completed {
                post_checks_ok: true
            }
        );
        assert_ne!(seen[0].id, seen[1].id);
    }

    #[tokio::test]
    async fn build_failure_does_not_stop_the_loop() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut r = Reconciler::new(Duration::ZERO, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RolloutError::Plan("broken".into()))
                } else {
                    Ok(Vec::new())
                }
            }
        });

        let first = r.run_cycle().await;
        assert!(matches!(
            first.result,
            CycleResult::PlanFailed { ref reason } if reason.contains("broken")
        ));
        assert!(first.reports().is_empty());

        let second = r.run_cycle().await;
        assert_eq!(second.result, CycleResult::Ran { reports: vec![] });
        assert_eq!(r.cycles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_cycles_only() {
        let mut r = Reconciler::new(Duration::from_secs(30), || async { Ok(Vec::new()) });
        let start = tokio::time::Instant::now();
        r.run_cycles(3, |_| {}).await;
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn report_serializes_flat() {
        let report = CycleReport {
            cycle: 1,
            id: Uuid::nil(),
            started_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            result: CycleResult::PlanFailed {
                reason: "no plan".into(),
            },
        };
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["result"], "plan_failed");
        assert_eq!(v["reason"], "no plan");
        assert_eq!(v["cycle"], 1);
    }
}
