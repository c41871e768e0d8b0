pub mod confirm;
pub mod engine;
pub mod error;
pub mod factory;
pub mod io;
pub mod paths;
pub mod plan;
pub mod reconcile;
pub mod shell;
pub mod store;
pub mod versions;

pub use error::{Result, RolloutError};
