//! Check and command factories.
//!
//! Each factory captures its inputs and returns a ready-to-run `Check` or
//! `Command`. The operation bodies are plain async fns taking owned or shared
//! data so the closures only clone handles.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::confirm::Confirm;
use crate::engine::{Check, Command};
use crate::error::{Result, RolloutError};
use crate::shell::{clean_version, run_shell};
use crate::versions::VersionStore;

/// Environment added to every shell invocation.
pub type Env = Arc<BTreeMap<String, String>>;

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Holds when `command` exits zero and, if `equals` is set, its trimmed
/// stdout equals it. A non-zero exit is `false`; failing to spawn is a fault.
pub fn shell_check(
    name: impl Into<String>,
    command: impl Into<String>,
    equals: Option<String>,
    env: Env,
) -> Check {
    let command = Arc::new(command.into());
    let equals = Arc::new(equals);
    Check::new(name, move || {
        shell_holds(Arc::clone(&command), Arc::clone(&equals), Arc::clone(&env))
    })
}

async fn shell_holds(command: Arc<String>, equals: Arc<Option<String>>, env: Env) -> Result<bool> {
    let out = run_shell(&command, &env).await?;
    if !out.success {
        return Ok(false);
    }
    Ok(match equals.as_deref() {
        Some(expected) => out.stdout.trim() == expected,
        None => true,
    })
}

/// Holds when the operator approves `prompt`.
pub fn confirm_check(
    name: impl Into<String>,
    prompt: impl Into<String>,
    confirm: Arc<dyn Confirm>,
) -> Check {
    let prompt = Arc::new(prompt.into());
    Check::new(name, move || {
        ask(Arc::clone(&confirm), Arc::clone(&prompt))
    })
}

async fn ask(confirm: Arc<dyn Confirm>, prompt: Arc<String>) -> Result<bool> {
    confirm.confirm(&prompt).await
}

/// Reads a member's version by running `command`, records it in the version
/// store, and holds when it equals `desired`.
pub fn version_check(
    name: impl Into<String>,
    target: VersionTarget,
    versions: VersionStore,
    env: Env,
) -> Check {
    let target = Arc::new(target);
    Check::new(name, move || {
        observe_version(Arc::clone(&target), versions.clone(), Arc::clone(&env))
    })
}

/// Which member a version check observes, and what it should be running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTarget {
    pub shard: String,
    pub member: String,
    pub command: String,
    pub desired: String,
}

async fn observe_version(target: Arc<VersionTarget>, versions: VersionStore, env: Env) -> Result<bool> {
    let out = run_shell(&target.command, &env)
        .await?
        .ok_or_fail(&target.command)?;
    let observed = clean_version(&out.stdout);
    let holds = observed == target.desired;
    off_runtime(move || versions.record(&target.shard, &target.member, &observed)).await?;
    Ok(holds)
}

/// Holds when every other recorded member of `shard` runs `desired` and
/// exactly `peers` of them are recorded.
pub fn peers_at_version_check(
    name: impl Into<String>,
    shard: impl Into<String>,
    member: impl Into<String>,
    desired: impl Into<String>,
    peers: usize,
    versions: VersionStore,
) -> Check {
    let shard = Arc::new(shard.into());
    let member = Arc::new(member.into());
    let desired = Arc::new(desired.into());
    Check::new(name, move || {
        let (versions, shard, member, desired) = (
            versions.clone(),
            Arc::clone(&shard),
            Arc::clone(&member),
            Arc::clone(&desired),
        );
        off_runtime(move || versions.peers_at_version(&shard, &member, &desired, peers))
    })
}

/// Store access is synchronous disk I/O; run it on the blocking pool.
async fn off_runtime<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RolloutError::Store(format!("store task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Runs `command`; a non-zero exit is a fault. Waits `settle` afterwards so
/// a restarted service can come up before postchecks look at it.
pub fn shell_command(
    name: impl Into<String>,
    command: impl Into<String>,
    env: Env,
    settle: Duration,
) -> Command {
    let command = Arc::new(command.into());
    Command::new(name, move || {
        run_and_settle(Arc::clone(&command), Arc::clone(&env), settle)
    })
}

async fn run_and_settle(command: Arc<String>, env: Env, settle: Duration) -> Result<()> {
    let out = run_shell(&command, &env).await?.ok_or_fail(&command)?;
    if !out.stdout.trim().is_empty() {
        tracing::debug!(command = %command, stdout = %out.stdout.trim(), "command output");
    }
    if !settle.is_zero() {
        tracing::debug!(seconds = settle.as_secs(), "settling");
        tokio::time::sleep(settle).await;
    }
    Ok(())
}

/// Runs `steps` in order, stopping at the first fault.
pub fn sequence_command(name: impl Into<String>, steps: Vec<Command>) -> Command {
    let steps = Arc::new(steps);
    Command::new(name, move || run_sequence(Arc::clone(&steps)))
}

async fn run_sequence(steps: Arc<Vec<Command>>) -> Result<()> {
    for step in steps.iter() {
        tracing::debug!(step = %step.name(), "sequence step");
        step.invoke().await?;
    }
    Ok(())
}

/// Asks `prompt` first and runs `inner` only on approval. A refusal is not a
/// fault: the command completes without doing anything.
pub fn confirmed_command(
    name: impl Into<String>,
    prompt: impl Into<String>,
    confirm: Arc<dyn Confirm>,
    inner: Command,
) -> Command {
    let prompt = Arc::new(prompt.into());
    let inner = Arc::new(inner);
    Command::new(name, move || {
        confirm_then(Arc::clone(&confirm), Arc::clone(&prompt), Arc::clone(&inner))
    })
}

async fn confirm_then(confirm: Arc<dyn Confirm>, prompt: Arc<String>, inner: Arc<Command>) -> Result<()> {
    if !confirm.confirm(&prompt).await? {
        tracing::warn!(prompt = %prompt, "refused, skipping");
        return Ok(());
    }
    inner.invoke().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::AutoConfirm;
    use crate::store::{KvStore, MemoryStore, StoreKey};
    use tempfile::TempDir;

    fn no_env() -> Env {
        Arc::new(BTreeMap::new())
    }

    fn versions() -> VersionStore {
        VersionStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn shell_check_maps_exit_status() {
        assert!(shell_check("t", "true", None, no_env()).invoke().await.unwrap());
        assert!(!shell_check("f", "false", None, no_env()).invoke().await.unwrap());
    }

    #[tokio::test]
    async fn shell_check_compares_stdout() {
        let check = shell_check("role", "echo SECONDARY", Some("SECONDARY".into()), no_env());
        assert!(check.invoke().await.unwrap());
        let check = shell_check("role", "echo PRIMARY", Some("SECONDARY".into()), no_env());
        assert!(!check.invoke().await.unwrap());
    }

    #[tokio::test]
    async fn version_check_records_observation() {
        let v = versions();
        let target = VersionTarget {
            shard: "rs0".into(),
            member: "mongod:27020".into(),
            command: "echo '\"4.2.25\"'".into(),
            desired: "4.4.29".into(),
        };
        let check = version_check("version", target, v.clone(), no_env());
        assert!(!check.invoke().await.unwrap());
        assert_eq!(
            v.get("rs0", "mongod:27020").unwrap().as_deref(),
            Some("4.2.25")
        );
    }

    #[tokio::test]
    async fn version_check_faults_when_command_fails() {
        let target = VersionTarget {
            shard: "rs0".into(),
            member: "m".into(),
            command: "exit 1".into(),
            desired: "4.4.29".into(),
        };
        let check = version_check("version", target, versions(), no_env());
        assert!(check.invoke().await.is_err());
    }

    #[tokio::test]
    async fn peers_check_reads_store() {
        let v = versions();
        v.record("rs0", "a", "4.4.29").unwrap();
        v.record("rs0", "b", "4.4.29").unwrap();
        let check = peers_at_version_check("last", "rs0", "c", "4.4.29", 2, v.clone());
        assert!(check.invoke().await.unwrap());
        v.record("rs0", "b", "4.2.25").unwrap();
        assert!(!check.invoke().await.unwrap(), "re-evaluated on every call");
    }

    struct BrokenStore;

    impl KvStore for BrokenStore {
        fn get(&self, _: &StoreKey) -> Result<Option<String>> {
            Err(RolloutError::Store("disk gone".into()))
        }

        fn set(&self, _: &StoreKey, _: &str) -> Result<()> {
            Err(RolloutError::Store("disk gone".into()))
        }

        fn list(&self, _: &StoreKey) -> Result<Vec<(StoreKey, String)>> {
            Err(RolloutError::Store("disk gone".into()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn store_failures_surface_from_blocking_pool() {
        let broken = VersionStore::new(Arc::new(BrokenStore));
        let target = VersionTarget {
            shard: "rs0".into(),
            member: "m".into(),
            command: "echo 4.4.29".into(),
            desired: "4.4.29".into(),
        };
        let err = version_check("version", target, broken.clone(), no_env())
            .invoke()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk gone"), "{err}");

        let err = peers_at_version_check("last", "rs0", "m", "4.4.29", 2, broken)
            .invoke()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk gone"), "{err}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn version_checks_run_on_multi_thread_runtime() {
        let v = versions();
        v.record("rs0", "a", "4.4.29").unwrap();
        v.record("rs0", "b", "4.4.29").unwrap();
        let target = VersionTarget {
            shard: "rs0".into(),
            member: "c".into(),
            command: "echo 4.2.25".into(),
            desired: "4.4.29".into(),
        };
        let observe = version_check("c version", target, v.clone(), no_env());
        let last = peers_at_version_check("last", "rs0", "c", "4.4.29", 2, v.clone());
        let (seen, last) = tokio::join!(observe.invoke(), last.invoke());
        assert!(!seen.unwrap());
        assert!(last.unwrap());
        assert_eq!(v.get("rs0", "c").unwrap().as_deref(), Some("4.2.25"));
    }

    #[tokio::test]
    async fn shell_command_faults_on_non_zero_exit() {
        let cmd = shell_command("stop", "exit 7", no_env(), Duration::ZERO);
        assert!(cmd.invoke().await.is_err());
    }

    #[tokio::test]
    async fn sequence_runs_in_order_and_stops_on_fault() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("log");
        let log = log.display();
        let steps = vec![
            shell_command("one", format!("echo one >> {log}"), no_env(), Duration::ZERO),
            shell_command("boom", "exit 1", no_env(), Duration::ZERO),
            shell_command("two", format!("echo two >> {log}"), no_env(), Duration::ZERO),
        ];
        let cmd = sequence_command("restart", steps);
        assert!(cmd.invoke().await.is_err());
        let written = std::fs::read_to_string(dir.path().join("log")).unwrap();
        assert_eq!(written, "one\n");
    }

    #[tokio::test]
    async fn refused_confirmation_skips_inner_command() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("stepped-down");
        let inner = shell_command(
            "step down",
            format!("touch {}", marker.display()),
            no_env(),
            Duration::ZERO,
        );
        let cmd = confirmed_command("failover", "May I failover?", Arc::new(AutoConfirm(false)), inner);
        cmd.invoke().await.unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn approved_confirmation_runs_inner_command() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("stepped-down");
        let inner = shell_command(
            "step down",
            format!("touch {}", marker.display()),
            no_env(),
            Duration::ZERO,
        );
        let cmd = confirmed_command("failover", "May I failover?", Arc::new(AutoConfirm(true)), inner);
        cmd.invoke().await.unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn confirm_check_uses_gate() {
        assert!(confirm_check("ok?", "ok?", Arc::new(AutoConfirm(true)))
            .invoke()
            .await
            .unwrap());
    }
}
