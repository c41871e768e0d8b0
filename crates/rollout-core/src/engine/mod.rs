//! Check → command → check sequencing engine.
//!
//! Provides `Check`, `Command`, `Action`, and `Controller`. The engine holds
//! no domain state: checks and commands close over whatever handles they were
//! built with, and the whole graph is rebuilt for every reconciliation pass.

pub mod action;
pub mod controller;
pub mod step;

pub use action::{
    evaluate_checks, Action, ActionBuilder, ActionOutcome, ActionState, CheckEvaluation,
    CheckResult,
};
pub use controller::{ActionReport, ActionStatus, Controller};
pub use step::{Check, Command, Step};
