//! Yes/no confirmation gate used by commands that want an operator's go-ahead
//! (failovers, feature-compatibility bumps).

use std::fmt;

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin};
use tokio::sync::Mutex;

use crate::error::Result;

pub trait Confirm: Send + Sync {
    fn confirm<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<bool>>;
}

/// Answers every prompt with a fixed value. Used for `--yes` and in tests.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<bool>> {
        let answer = self.0;
        async move {
            tracing::info!(prompt, answer, "auto-confirm");
            Ok(answer)
        }
        .boxed()
    }
}

/// Prompts on stderr and reads one line per prompt from a single buffered
/// input, so answers piped in ahead of time are consumed in order. Only
/// `y` / `yes` (case-insensitive) count as approval; EOF is a refusal.
pub struct TerminalConfirm<R = BufReader<Stdin>> {
    input: Mutex<R>,
}

impl TerminalConfirm {
    pub fn new() -> Self {
        Self::with_input(BufReader::new(tokio::io::stdin()))
    }
}

impl Default for TerminalConfirm {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> TerminalConfirm<R> {
    pub fn with_input(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }
}

impl<R> fmt::Debug for TerminalConfirm<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalConfirm").finish_non_exhaustive()
    }
}

impl<R> Confirm for TerminalConfirm<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    fn confirm<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<bool>> {
        ask(&self.input, prompt).boxed()
    }
}

async fn ask<R>(input: &Mutex<R>, prompt: &str) -> Result<bool>
where
    R: AsyncBufRead + Unpin + Send,
{
    // Held across the prompt so concurrent questions do not interleave.
    let mut input = input.lock().await;

    let mut stderr = tokio::io::stderr();
    stderr
        .write_all(format!("{prompt} [y/N] ").as_bytes())
        .await?;
    stderr.flush().await?;

    let mut line = String::new();
    input.read_line(&mut line).await?;
    Ok(is_yes(&line))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
