//! Sequential, fault-isolating runner over an ordered list of actions.

use serde::{Deserialize, Serialize};

use super::action::{Action, ActionOutcome};

/// Per-action result of one controller pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionStatus {
    /// Prechecks did not pass; nothing was mutated.
    Blocked,
    /// The command ran. `post_checks_ok` is the postcheck verdict.
    Completed { post_checks_ok: bool },
    /// A check or the command raised.
    Failed { reason: String },
}

impl ActionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ActionStatus::Blocked => "blocked",
            ActionStatus::Completed { post_checks_ok: true } => "completed",
            ActionStatus::Completed {
                post_checks_ok: false,
            } => "unverified",
            ActionStatus::Failed { .. } => "failed",
        }
    }
}

impl From<&ActionOutcome> for ActionStatus {
    fn from(outcome: &ActionOutcome) -> Self {
        match outcome {
            ActionOutcome::Blocked { .. } => ActionStatus::Blocked,
            ActionOutcome::Completed { post_checks, .. } => ActionStatus::Completed {
                post_checks_ok: post_checks.proceed,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    pub action: String,
    #[serde(flatten)]
    pub status: ActionStatus,
}

/// Runs its actions strictly in order, one at a time.
#[derive(Debug)]
pub struct Controller {
    actions: Vec<Action>,
}

impl Controller {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Attempt every action once.
    ///
    /// A fault raised by one action is logged and recorded as `Failed`; the
    /// remaining actions still run. Never returns an error.
    pub async fn run(&self) -> Vec<ActionReport> {
        let mut reports = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            let status = match action.run().await {
                Ok(outcome) => ActionStatus::from(&outcome),
                Err(e) => {
                    tracing::error!(action = %action.name(), error = %e, "action failed");
                    ActionStatus::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            reports.push(ActionReport {
                action: action.name().to_string(),
                status,
            });
        }
        reports
    }
}
