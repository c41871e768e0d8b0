//! Shell invocation for plan checks and commands.
//!
//! Every command line is run through `sh -c` so plans can use pipes and
//! redirects. Stdout and stderr are captured; the caller decides whether a
//! non-zero exit is a `false` check result or a command fault.

use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Result, RolloutError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub success: bool,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    /// Fail with `ShellFailed` unless the process exited zero.
    pub fn ok_or_fail(self, command: &str) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        let code = self
            .code
            .map(|c| format!("status {c}"))
            .unwrap_or_else(|| "signal".to_string());
        Err(RolloutError::ShellFailed {
            command: command.to_string(),
            code,
            stderr: self.stderr.trim().chars().take(500).collect(),
        })
    }
}

/// Run `command` with `env` added to the inherited environment.
pub async fn run_shell(command: &str, env: &BTreeMap<String, String>) -> Result<ShellOutput> {
    tracing::debug!(command, "sh -c");
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| RolloutError::Shell {
            command: command.to_string(),
            source,
        })?;

    Ok(ShellOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Normalize a version string printed by a client shell: surrounding
/// whitespace and JSON quotes are dropped.
pub fn clean_version(raw: &str) -> String {
    raw.trim().replace('"', "")
}
