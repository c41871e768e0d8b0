//! Named asynchronous operations: the leaves of the action graph.
//!
//! `Check` and `Command` share one shape and differ only in what the caller
//! does with the result. A `Check` yields `true` when its condition holds and
//! must not mutate the target. A `Command` performs the mutating step.

use std::fmt;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt};

use crate::error::Result;

type Operation<T> = Box<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// A named operation producing `T`.
///
/// The operation is a closure so it can capture whatever target handles the
/// factory was given (a store, a member address, a confirmation gate). It may
/// be invoked more than once over its lifetime, once per evaluation.
pub struct Step<T> {
    name: String,
    operation: Operation<T>,
}

/// Read-only condition evaluator.
pub type Check = Step<bool>;

/// Mutating operation.
pub type Command = Step<()>;

impl<T: Send + 'static> Step<T> {
    pub fn new<F, Fut>(name: impl Into<String>, operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            operation: Box::new(move || operation().boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the operation once and await its result.
    pub async fn invoke(&self) -> Result<T> {
        (self.operation)().await
    }
}

impl Check {
    /// A check that always yields `value`. Useful for gating an action on a
    /// decision already made at plan-build time.
    pub fn constant(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, move || async move { Ok(value) })
    }

    /// Wrap this check so its result is inverted. Faults pass through.
    pub fn negate(self) -> Self {
        let Step { name, operation } = self;
        Self {
            name: format!("not {name}"),
            operation: Box::new(move || {
                let fut = operation();
                async move { fut.await.map(|v| !v) }.boxed()
            }),
        }
    }
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}
