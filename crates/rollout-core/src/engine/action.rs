//! Precondition-gated actions.
//!
//! An `Action` pairs one `Command` with the checks that must hold before it
//! runs and the checks that report on its effect afterwards:
//!
//! ```text
//! Idle → EvaluatingPreChecks → Blocked
//!                            → Executing → EvaluatingPostChecks → Completed
//! ```
//!
//! A blocked action is a normal outcome: the reconciliation loop rebuilds the
//! graph and tries again next cycle.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::error::{Result, RolloutError};

use super::step::{Check, Command};

// ---------------------------------------------------------------------------
// CheckEvaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub result: bool,
}

/// Outcome of evaluating an ordered list of checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckEvaluation {
    pub proceed: bool,
    /// One entry per check that was actually invoked, in declaration order.
    pub results: Vec<CheckResult>,
}

impl CheckEvaluation {
    pub fn names(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.name.as_str()).collect()
    }
}

impl fmt::Display for CheckEvaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .results
            .iter()
            .map(|r| format!("{}={}", r.name, r.result))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

/// Evaluate `checks` in order.
///
/// With `fail_fast`, evaluation stops at the first `false` and later checks
/// are never invoked. Otherwise every check runs and `proceed` is the AND of
/// all results. An empty list never proceeds.
///
/// A check that raises aborts evaluation; the fault is returned wrapped with
/// the check's name and is not counted as `false`.
pub async fn evaluate_checks(checks: &[Check], fail_fast: bool) -> Result<CheckEvaluation> {
    let mut results = Vec::with_capacity(checks.len());
    for check in checks {
        let result = check
            .invoke()
            .await
            .map_err(|e| RolloutError::CheckFault {
                check: check.name().to_string(),
                source: Box::new(e),
            })?;
        results.push(CheckResult {
            name: check.name().to_string(),
            result,
        });
        if !result && fail_fast {
            return Ok(CheckEvaluation {
                proceed: false,
                results,
            });
        }
    }
    if results.is_empty() {
        return Ok(CheckEvaluation {
            proceed: false,
            results,
        });
    }
    let proceed = results.iter().all(|r| r.result);
    Ok(CheckEvaluation { proceed, results })
}

// ---------------------------------------------------------------------------
// ActionState / ActionOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Idle,
    EvaluatingPreChecks,
    Blocked,
    Executing,
    EvaluatingPostChecks,
    Completed,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionState::Idle => "idle",
            ActionState::EvaluatingPreChecks => "prechecks",
            ActionState::Blocked => "blocked",
            ActionState::Executing => "command",
            ActionState::EvaluatingPostChecks => "postchecks",
            ActionState::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Terminal state of a single `Action::run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Prechecks did not pass; the command was not invoked.
    Blocked { pre_checks: CheckEvaluation },
    /// The command ran. `post_checks.proceed` reports whether it took effect.
    Completed {
        pre_checks: CheckEvaluation,
        post_checks: CheckEvaluation,
    },
}

impl ActionOutcome {
    pub fn state(&self) -> ActionState {
        match self {
            ActionOutcome::Blocked { .. } => ActionState::Blocked,
            ActionOutcome::Completed { .. } => ActionState::Completed,
        }
    }

    pub fn command_ran(&self) -> bool {
        matches!(self, ActionOutcome::Completed { .. })
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Action {
    name: String,
    pre_checks: Vec<Check>,
    command: Command,
    post_checks: Vec<Check>,
    fail_fast: bool,
}

impl Action {
    pub fn builder(name: impl Into<String>, command: Command) -> ActionBuilder {
        ActionBuilder {
            name: name.into(),
            pre_checks: Vec::new(),
            command,
            post_checks: Vec::new(),
            fail_fast: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn pre_checks(&self) -> &[Check] {
        &self.pre_checks
    }

    pub fn post_checks(&self) -> &[Check] {
        &self.post_checks
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Run the action once.
    ///
    /// The command is invoked only if the prechecks proceed, and then exactly
    /// once. Postchecks always run after a command that returned `Ok`; their
    /// result is reported, not raised. Faults from any check or from the
    /// command propagate.
    pub async fn run(&self) -> Result<ActionOutcome> {
        let span = tracing::info_span!("action", name = %self.name);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<ActionOutcome> {
        tracing::debug!(state = %ActionState::Idle, "starting");

        tracing::debug!(state = %ActionState::EvaluatingPreChecks, count = self.pre_checks.len());
        let pre = evaluate_checks(&self.pre_checks, self.fail_fast).await?;
        tracing::info!(
            state = %ActionState::EvaluatingPreChecks,
            proceed = pre.proceed,
            results = %pre,
            "prechecks"
        );
        if !pre.proceed {
            tracing::info!(state = %ActionState::Blocked, "skipping command");
            return Ok(ActionOutcome::Blocked { pre_checks: pre });
        }

        tracing::warn!(state = %ActionState::Executing, command = %self.command.name(), "running command");
        self.command
            .invoke()
            .await
            .map_err(|e| RolloutError::CommandFault {
                command: self.command.name().to_string(),
                source: Box::new(e),
            })?;

        let post = evaluate_checks(&self.post_checks, self.fail_fast).await?;
        tracing::info!(
            state = %ActionState::EvaluatingPostChecks,
            ok = post.proceed,
            results = %post,
            "postchecks"
        );

        // Gated on the precheck flag, which is always true here. A failing
        // postcheck is reported through the outcome instead.
        if !pre.proceed {
            return Err(RolloutError::ActionFailed(self.name.clone()));
        }

        tracing::debug!(state = %ActionState::Completed);
        Ok(ActionOutcome::Completed {
            pre_checks: pre,
            post_checks: post,
        })
    }
}

// ---------------------------------------------------------------------------
// ActionBuilder
// ---------------------------------------------------------------------------

/// Composes an `Action`. All checks are attached here; a built action is
/// immutable.
#[derive(Debug)]
pub struct ActionBuilder {
    name: String,
    pre_checks: Vec<Check>,
    command: Command,
    post_checks: Vec<Check>,
    fail_fast: bool,
}

impl ActionBuilder {
    pub fn pre_check(mut self, check: Check) -> Self {
        self.pre_checks.push(check);
        self
    }

    pub fn pre_checks(mut self, checks: impl IntoIterator<Item = Check>) -> Self {
        self.pre_checks.extend(checks);
        self
    }

    pub fn post_check(mut self, check: Check) -> Self {
        self.post_checks.push(check);
        self
    }

    pub fn post_checks(mut self, checks: impl IntoIterator<Item = Check>) -> Self {
        self.post_checks.extend(checks);
        self
    }

    /// Defaults to `true`.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn build(self) -> Action {
        Action {
            name: self.name,
            pre_checks: self.pre_checks,
            command: self.command,
            post_checks: self.post_checks,
            fail_fast: self.fail_fast,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted(name: &str, value: bool, calls: &Arc<AtomicUsize>) -> Check {
        let calls = Arc::clone(calls);
        Check::new(name, move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        })
    }

    fn counting_command(calls: &Arc<AtomicUsize>) -> Command {
        let calls = Arc::clone(calls);
        Command::new("increment", move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn checks(values: &[bool]) -> Vec<Check> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Check::constant(format!("check-{i}"), *v))
            .collect()
    }

    fn faulty(name: &str) -> Check {
        Check::new(name, || async { Err(RolloutError::operation("connection refused")) })
    }

    #[tokio::test]
    async fn fail_fast_stops_at_first_false() {
        let calls = Arc::new(AtomicUsize::new(0));
        let list = vec![
            counted("a", true, &calls),
            counted("b", true, &calls),
            counted("c", false, &calls),
            counted("d", true, &calls),
            counted("e", false, &calls),
        ];
        let eval = evaluate_checks(&list, true).await.unwrap();
        assert!(!eval.proceed);
        assert_eq!(eval.results.len(), 3);
        assert_eq!(eval.names(), vec!["a", "b", "c"]);
        assert!(!eval.results[2].result);
        assert_eq!(calls.load(Ordering::SeqCst), 3, "later checks must not run");
    }

    #[tokio::test]
    async fn fail_fast_first_check_false_records_one_result() {
        let eval = evaluate_checks(&checks(&[false, true]), true).await.unwrap();
        assert!(!eval.proceed);
        assert_eq!(eval.results.len(), 1);
    }

    #[tokio::test]
    async fn without_fail_fast_every_check_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let list = vec![
            counted("a", false, &calls),
            counted("b", true, &calls),
            counted("c", false, &calls),
        ];
        let eval = evaluate_checks(&list, false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!eval.proceed);
        assert_eq!(
            eval.results.iter().map(|r| r.result).collect::<Vec<_>>(),
            vec![false, true, false]
        );
    }

    #[tokio::test]
    async fn proceed_is_and_of_results() {
        for fail_fast in [true, false] {
            let eval = evaluate_checks(&checks(&[true, true, true]), fail_fast)
                .await
                .unwrap();
            assert!(eval.proceed);
            assert_eq!(eval.results.len(), 3);
        }
        let eval = evaluate_checks(&checks(&[true, true, false]), false)
            .await
            .unwrap();
        assert!(!eval.proceed);
    }

    #[tokio::test]
    async fn empty_check_list_never_proceeds() {
        for fail_fast in [true, false] {
            let eval = evaluate_checks(&[], fail_fast).await.unwrap();
            assert!(!eval.proceed);
            assert!(eval.results.is_empty());
        }
    }

    #[tokio::test]
    async fn check_fault_propagates_with_name() {
        let calls = Arc::new(AtomicUsize::new(0));
        let list = vec![faulty("rs status"), counted("after", true, &calls)];
        let err = evaluate_checks(&list, false).await.unwrap_err();
        match err {
            RolloutError::CheckFault { check, .. } => assert_eq!(check, "rs status"),
            other => panic!("expected CheckFault, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn blocked_action_never_invokes_command() {
        let calls = Arc::new(AtomicUsize::new(0));
        let action = Action::builder("upgrade", counting_command(&calls))
            .pre_checks(checks(&[true, false]))
            .post_checks(checks(&[true]))
            .build();
        let outcome = action.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.state(), ActionState::Blocked);
        assert!(!outcome.command_ran());
    }

    #[tokio::test]
    async fn proceeding_action_runs_command_once_then_postchecks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let post_calls = Arc::new(AtomicUsize::new(0));
        let action = Action::builder("upgrade", counting_command(&calls))
            .pre_check(Check::constant("online", true))
            .post_check(counted("healthy", false, &post_calls))
            .post_check(counted("version", true, &post_calls))
            .fail_fast(false)
            .build();

        let outcome = action.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(post_calls.load(Ordering::SeqCst), 2);
        match outcome {
            ActionOutcome::Completed { post_checks, .. } => {
                assert!(!post_checks.proceed, "failing postcheck is reported");
                assert_eq!(post_checks.results.len(), 2);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn action_without_postchecks_reports_failed_postchecks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let action = Action::builder("start", counting_command(&calls))
            .pre_check(Check::constant("offline", true))
            .build();
        let outcome = action.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match outcome {
            ActionOutcome::Completed { post_checks, .. } => {
                assert!(!post_checks.proceed);
                assert!(post_checks.results.is_empty());
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_fault_propagates() {
        let post_calls = Arc::new(AtomicUsize::new(0));
        let action = Action::builder(
            "restart",
            Command::new("mlaunch stop", || async {
                Err(RolloutError::operation("exit status 1"))
            }),
        )
        .pre_check(Check::constant("online", true))
        .post_check(counted("healthy", true, &post_calls))
        .build();

        let err = action.run().await.unwrap_err();
        assert!(matches!(err, RolloutError::CommandFault { ref command, .. } if command == "mlaunch stop"));
        assert_eq!(post_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn precheck_fault_propagates_out_of_action() {
        let calls = Arc::new(AtomicUsize::new(0));
        let action = Action::builder("upgrade", counting_command(&calls))
            .pre_check(faulty("role"))
            .build();
        assert!(matches!(
            action.run().await,
            Err(RolloutError::CheckFault { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scenario_all_prechecks_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let action = Action::builder("a", counting_command(&calls))
            .pre_checks(checks(&[true, true]))
            .post_checks(checks(&[true]))
            .build();
        let outcome = action.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(outcome.command_ran());
    }

    #[tokio::test]
    async fn scenario_fail_fast_middle_false() {
        let calls = Arc::new(AtomicUsize::new(0));
        let action = Action::builder("b", counting_command(&calls))
            .pre_checks(checks(&[true, false, true]))
            .build();
        let outcome = action.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let ActionOutcome::Blocked { pre_checks } = outcome else {
            panic!("expected Blocked")
        };
        assert_eq!(
            pre_checks.results,
            vec![
                CheckResult {
                    name: "check-0".into(),
                    result: true
                },
                CheckResult {
                    name: "check-1".into(),
                    result: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn scenario_no_prechecks_blocks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let action = Action::builder("c", counting_command(&calls)).build();
        let outcome = action.run().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.state(), ActionState::Blocked);
    }

    #[test]
    fn builder_defaults_to_fail_fast() {
        let action = Action::builder("x", Command::new("noop", || async { Ok(()) })).build();
        assert!(action.fail_fast());
        assert!(action.pre_checks().is_empty());
        assert!(action.post_checks().is_empty());
        assert_eq!(action.command().name(), "noop");
    }

    #[test]
    fn evaluation_display_lists_results_in_order() {
        let eval = CheckEvaluation {
            proceed: false,
            results: vec![
                CheckResult {
                    name: "online".into(),
                    result: true,
                },
                CheckResult {
                    name: "secondary".into(),
                    result: false,
                },
            ],
        };
        assert_eq!(eval.to_string(), "[online=true, secondary=false]");
    }
}
