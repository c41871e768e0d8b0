//! Declarative action graph.
//!
//! A plan is a YAML file listing action templates. The reconciliation driver
//! re-reads it every cycle and turns it into a fresh `Vec<Action>`, so edits
//! take effect on the next pass.
//!
//! # Substitution
//!
//! Every string in an action template may reference `${name}`. Values come
//! from the template's `for_each` item first, then from the plan's global
//! `vars`. An unresolved reference is a plan error. Plain shell variables
//! (`$HOME`, without braces) are left alone.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::confirm::Confirm;
use crate::engine::{Action, Check, Command};
use crate::error::{Result, RolloutError};
use crate::factory::{self, Env, VersionTarget};
use crate::versions::VersionStore;

// ---------------------------------------------------------------------------
// Vars
// ---------------------------------------------------------------------------

/// String map whose YAML values may be any scalar (`port: 27020` is read as
/// `"27020"`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars(pub BTreeMap<String, String>);

impl<'de> Deserialize<'de> for Vars {
    fn deserialize<D>(d: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        scalar_map(d).map(Vars)
    }
}

fn scalar_map<'de, D>(d: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw: BTreeMap<String, serde_yaml::Value> = BTreeMap::deserialize(d)?;
    raw.into_iter()
        .map(|(k, v)| {
            let s = match v {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                other => {
                    return Err(D::Error::custom(format!(
                        "value of '{k}' must be a scalar, got {other:?}"
                    )))
                }
            };
            Ok((k, s))
        })
        .collect()
}

fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

/// Replace every `${name}` in `template`, looking in `scopes` in order.
pub fn substitute(template: &str, scopes: &[&BTreeMap<String, String>]) -> Result<String> {
    let mut missing = None;
    let out = var_pattern().replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match scopes.iter().find_map(|s| s.get(name)) {
            Some(v) => v.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(RolloutError::UnknownVariable {
            name,
            template: template.to_string(),
        }),
        None => Ok(out.into_owned()),
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum CheckKind {
    /// Exit status zero (and stdout equal to `equals`, if set).
    Shell {
        command: String,
        #[serde(default)]
        equals: Option<String>,
    },
    /// Operator approval.
    Confirm { prompt: String },
    /// Observe and record a member's version; holds when it is `version`.
    Version {
        shard: String,
        member: String,
        command: String,
        version: String,
    },
    /// All `peers` other recorded members of `shard` run `version`.
    PeersAtVersion {
        shard: String,
        member: String,
        version: String,
        peers: usize,
    },
}

/// Keys other than `name` and `negate` go to `kind`, which rejects unknown ones.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckDef {
    pub name: String,
    #[serde(default)]
    pub negate: bool,
    #[serde(flatten)]
    pub kind: CheckKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum CommandKind {
    Shell {
        command: String,
        #[serde(default)]
        env: Vars,
        #[serde(default)]
        settle_seconds: u64,
    },
    Sequence {
        steps: Vec<CommandDef>,
    },
    /// Ask first; a refusal completes without running `then`.
    Confirmed {
        prompt: String,
        then: Box<CommandDef>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionDef {
    pub name: String,
    /// One action per item. Empty means a single action with global vars only.
    #[serde(default)]
    pub for_each: Vec<Vars>,
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
    #[serde(default)]
    pub pre_checks: Vec<CheckDef>,
    pub command: CommandDef,
    #[serde(default)]
    pub post_checks: Vec<CheckDef>,
}

fn default_fail_fast() -> bool {
    true
}

fn default_interval() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub vars: Vars,
    /// Added to the environment of every shell check and command.
    #[serde(default)]
    pub env: Vars,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

/// What `build` needs besides the plan itself.
#[derive(Clone)]
pub struct Capabilities {
    pub versions: VersionStore,
    pub confirm: Arc<dyn Confirm>,
}

/// Flat view of one expanded action, for listing without executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionSummary {
    pub name: String,
    pub fail_fast: bool,
    pub pre_checks: Vec<String>,
    pub command: String,
    pub post_checks: Vec<String>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RolloutError::PlanNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let plan: Plan = serde_yaml::from_str(data)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_seconds == 0 {
            return Err(RolloutError::Plan("interval_seconds must be positive".into()));
        }
        for action in &self.actions {
            if action.name.trim().is_empty() {
                return Err(RolloutError::Plan("action with empty name".into()));
            }
            for check in action.pre_checks.iter().chain(&action.post_checks) {
                if let CheckKind::PeersAtVersion { peers: 0, .. } = check.kind {
                    return Err(RolloutError::Plan(format!(
                        "action '{}': check '{}' needs peers > 0",
                        action.name, check.name
                    )));
                }
            }
            validate_command(&action.name, &action.command)?;
        }
        Ok(())
    }

    /// Resolve the global environment against the global vars.
    fn resolved_env(&self) -> Result<BTreeMap<String, String>> {
        self.env
            .0
            .iter()
            .map(|(k, v)| Ok((k.clone(), substitute(v, &[&self.vars.0])?)))
            .collect()
    }

    /// Apply `for_each` and substitution, yielding one definition per action in
    /// declaration order.
    pub fn expand(&self) -> Result<Vec<ActionDef>> {
        let mut out = Vec::new();
        for template in &self.actions {
            if template.for_each.is_empty() {
                out.push(template.resolve(&[&self.vars.0])?);
            } else {
                for item in &template.for_each {
                    out.push(template.resolve(&[&item.0, &self.vars.0])?);
                }
            }
        }
        Ok(out)
    }

    pub fn describe(&self) -> Result<Vec<ActionSummary>> {
        Ok(self
            .expand()?
            .into_iter()
            .map(|a| ActionSummary {
                pre_checks: a.pre_checks.iter().map(CheckDef::label).collect(),
                post_checks: a.post_checks.iter().map(CheckDef::label).collect(),
                command: a.command.name,
                fail_fast: a.fail_fast,
                name: a.name,
            })
            .collect())
    }

    /// Build a fresh action graph.
    pub fn build(&self, caps: &Capabilities) -> Result<Vec<Action>> {
        let env: Env = Arc::new(self.resolved_env()?);
        self.expand()?
            .iter()
            .map(|def| def.build(caps, &env))
            .collect()
    }
}

fn validate_command(action: &str, command: &CommandDef) -> Result<()> {
    match &command.kind {
        CommandKind::Shell { .. } => Ok(()),
        CommandKind::Sequence { steps } => {
            if steps.is_empty() {
                return Err(RolloutError::Plan(format!(
                    "action '{action}': sequence '{}' has no steps",
                    command.name
                )));
            }
            steps.iter().try_for_each(|s| validate_command(action, s))
        }
        CommandKind::Confirmed { then, .. } => validate_command(action, then),
    }
}

// ---------------------------------------------------------------------------
// Resolution and building
// ---------------------------------------------------------------------------

type Scopes<'a> = [&'a BTreeMap<String, String>];

impl ActionDef {
    fn resolve(&self, scopes: &Scopes<'_>) -> Result<Self> {
        Ok(Self {
            name: substitute(&self.name, scopes)?,
            for_each: Vec::new(),
            fail_fast: self.fail_fast,
            pre_checks: resolve_checks(&self.pre_checks, scopes)?,
            command: self.command.resolve(scopes)?,
            post_checks: resolve_checks(&self.post_checks, scopes)?,
        })
    }

    fn build(&self, caps: &Capabilities, env: &Env) -> Result<Action> {
        let pre = self
            .pre_checks
            .iter()
            .map(|c| c.build(caps, env))
            .collect::<Vec<_>>();
        let post = self
            .post_checks
            .iter()
            .map(|c| c.build(caps, env))
            .collect::<Vec<_>>();
        Ok(Action::builder(&self.name, self.command.build(caps, env)?)
            .pre_checks(pre)
            .post_checks(post)
            .fail_fast(self.fail_fast)
            .build())
    }
}

fn resolve_checks(checks: &[CheckDef], scopes: &Scopes<'_>) -> Result<Vec<CheckDef>> {
    checks.iter().map(|c| c.resolve(scopes)).collect()
}

impl CheckDef {
    fn label(&self) -> String {
        if self.negate {
            format!("not {}", self.name)
        } else {
            self.name.clone()
        }
    }

    fn resolve(&self, scopes: &Scopes<'_>) -> Result<Self> {
        let sub = |s: &str| substitute(s, scopes);
        let kind = match &self.kind {
            CheckKind::Shell { command, equals } => CheckKind::Shell {
                command: sub(command)?,
                equals: equals.as_deref().map(sub).transpose()?,
            },
            CheckKind::Confirm { prompt } => CheckKind::Confirm {
                prompt: sub(prompt)?,
            },
            CheckKind::Version {
                shard,
                member,
                command,
                version,
            } => CheckKind::Version {
                shard: sub(shard)?,
                member: sub(member)?,
                command: sub(command)?,
                version: sub(version)?,
            },
            CheckKind::PeersAtVersion {
                shard,
                member,
                version,
                peers,
            } => CheckKind::PeersAtVersion {
                shard: sub(shard)?,
                member: sub(member)?,
                version: sub(version)?,
                peers: *peers,
            },
        };
        Ok(Self {
            name: sub(&self.name)?,
            negate: self.negate,
            kind,
        })
    }

    fn build(&self, caps: &Capabilities, env: &Env) -> Check {
        let check = match &self.kind {
            CheckKind::Shell { command, equals } => {
                factory::shell_check(&self.name, command, equals.clone(), Arc::clone(env))
            }
            CheckKind::Confirm { prompt } => {
                factory::confirm_check(&self.name, prompt, Arc::clone(&caps.confirm))
            }
            CheckKind::Version {
                shard,
                member,
                command,
                version,
            } => factory::version_check(
                &self.name,
                VersionTarget {
                    shard: shard.clone(),
                    member: member.clone(),
                    command: command.clone(),
                    desired: version.clone(),
                },
                caps.versions.clone(),
                Arc::clone(env),
            ),
            CheckKind::PeersAtVersion {
                shard,
                member,
                version,
                peers,
            } => factory::peers_at_version_check(
                &self.name,
                shard,
                member,
                version,
                *peers,
                caps.versions.clone(),
            ),
        };
        if self.negate {
            check.negate()
        } else {
            check
        }
    }
}

impl CommandDef {
    fn resolve(&self, scopes: &Scopes<'_>) -> Result<Self> {
        let sub = |s: &str| substitute(s, scopes);
        let kind = match &self.kind {
            CommandKind::Shell {
                command,
                env,
                settle_seconds,
            } => CommandKind::Shell {
                command: sub(command)?,
                env: Vars(
                    env.0
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), sub(v)?)))
                        .collect::<Result<_>>()?,
                ),
                settle_seconds: *settle_seconds,
            },
            CommandKind::Sequence { steps } => CommandKind::Sequence {
                steps: steps
                    .iter()
                    .map(|s| s.resolve(scopes))
                    .collect::<Result<_>>()?,
            },
            CommandKind::Confirmed { prompt, then } => CommandKind::Confirmed {
                prompt: sub(prompt)?,
                then: Box::new(then.resolve(scopes)?),
            },
        };
        Ok(Self {
            name: sub(&self.name)?,
            kind,
        })
    }

    fn build(&self, caps: &Capabilities, env: &Env) -> Result<Command> {
        let command = match &self.kind {
            CommandKind::Shell {
                command,
                env: extra,
                settle_seconds,
            } => {
                let env = if extra.0.is_empty() {
                    Arc::clone(env)
                } else {
                    let mut merged = (**env).clone();
                    merged.extend(extra.0.clone());
                    Arc::new(merged)
                };
                factory::shell_command(
                    &self.name,
                    command,
                    env,
                    Duration::from_secs(*settle_seconds),
                )
            }
            CommandKind::Sequence { steps } => factory::sequence_command(
                &self.name,
                steps
                    .iter()
                    .map(|s| s.build(caps, env))
                    .collect::<Result<_>>()?,
            ),
            CommandKind::Confirmed { prompt, then } => factory::confirmed_command(
                &self.name,
                prompt,
                Arc::clone(&caps.confirm),
                then.build(caps, env)?,
            ),
        };
        Ok(command)
    }
}

// ---------------------------------------------------------------------------
// Starter plan
// ---------------------------------------------------------------------------

/// Written by `rollout init`. A rolling upgrade of one three-member replica
/// set driven by an `mlaunch`-style launcher, finished by raising the
/// feature compatibility version once every member runs the new binary.
pub const STARTER_PLAN: &str = r#"# rollout plan: re-read every cycle.
interval_seconds: 10

vars:
  desired: "4.4.29"
  fcv: "4.4"
  shard: rs0
  replset: "mongodb://localhost:27020,localhost:27021,localhost:27022/?replicaSet=rs0"

env:
  MONGO_VERSION: "${desired}"

actions:
  - name: "[${member}] start"
    for_each:
      - { member: "mongod:27020", port: 27020 }
      - { member: "mongod:27021", port: 27021 }
      - { member: "mongod:27022", port: 27022 }
    pre_checks:
      - name: "[${member}] is offline"
        type: shell
        command: "nc -z localhost ${port}"
        negate: true
    command:
      name: start
      type: shell
      command: "./bin/mlaunch start mongod ${port}"
    post_checks:
      - name: "[${member}] is online"
        type: shell
        command: "nc -z localhost ${port}"

  - name: "[${member}] upgrade to ${desired}"
    for_each:
      - { member: "mongod:27020", port: 27020 }
      - { member: "mongod:27021", port: 27021 }
      - { member: "mongod:27022", port: 27022 }
    pre_checks:
      - name: "[${member}] is online"
        type: shell
        command: "nc -z localhost ${port}"
      - name: "[${member}] is secondary"
        type: shell
        command: "mongo --quiet --port ${port} --eval 'print(rs.isMaster().secondary)'"
        equals: "true"
      - name: "[${member}] at ${desired}"
        type: version
        shard: "${shard}"
        member: "${member}"
        command: "mongo --quiet --port ${port} --eval 'print(db.version())'"
        version: "${desired}"
        negate: true
      - name: "[${member}] in a healthy replica set"
        type: shell
        command: >-
          mongo --quiet --port ${port} --eval
          'var s = rs.status().members.map(function (m) { return m.stateStr; });
          print([1, 3, 5].indexOf(s.length) >= 0 && s.every(function (st) { return st == "PRIMARY" || st == "SECONDARY"; }))'
        equals: "true"
    command:
      name: change version
      type: sequence
      steps:
        - { name: stop, type: shell, command: "./bin/mlaunch stop mongod ${port}", settle_seconds: 2 }
        - { name: start, type: shell, command: "./bin/mlaunch start mongod ${port}", settle_seconds: 5 }
    post_checks:
      - name: "[${member}] in a healthy replica set"
        type: shell
        command: >-
          mongo --quiet --port ${port} --eval
          'var s = rs.status().members.map(function (m) { return m.stateStr; });
          print([1, 3, 5].indexOf(s.length) >= 0 && s.every(function (st) { return st == "PRIMARY" || st == "SECONDARY"; }))'
        equals: "true"
      - name: "[${member}] at ${desired}"
        type: version
        shard: "${shard}"
        member: "${member}"
        command: "mongo --quiet --port ${port} --eval 'print(db.version())'"
        version: "${desired}"

  - name: "[${member}] failover to upgrade"
    for_each:
      - { member: "mongod:27020", port: 27020 }
      - { member: "mongod:27021", port: 27021 }
      - { member: "mongod:27022", port: 27022 }
    pre_checks:
      - name: "[${member}] is primary"
        type: shell
        command: "mongo --quiet --port ${port} --eval 'print(rs.isMaster().ismaster)'"
        equals: "true"
      - name: "[${member}] at ${desired}"
        type: version
        shard: "${shard}"
        member: "${member}"
        command: "mongo --quiet --port ${port} --eval 'print(db.version())'"
        version: "${desired}"
        negate: true
      - name: "[${member}] last member to upgrade"
        type: peers_at_version
        shard: "${shard}"
        member: "${member}"
        version: "${desired}"
        peers: 2
    command:
      name: "failing over ${member}"
      type: confirmed
      prompt: "May I failover ${member}?"
      then:
        name: step down
        type: shell
        command: "mongo --quiet --port ${port} --eval 'rs.stepDown()' || true"
    post_checks:
      - name: "[${member}] is online"
        type: shell
        command: "nc -z localhost ${port}"

  - name: "[${shard}] feature compatibility version ${fcv}"
    pre_checks:
      - name: "[mongod:27020] at ${desired}"
        type: version
        shard: "${shard}"
        member: "mongod:27020"
        command: "mongo --quiet --port 27020 --eval 'print(db.version())'"
        version: "${desired}"
      - name: "[mongod:27021] at ${desired}"
        type: version
        shard: "${shard}"
        member: "mongod:27021"
        command: "mongo --quiet --port 27021 --eval 'print(db.version())'"
        version: "${desired}"
      - name: "[mongod:27022] at ${desired}"
        type: version
        shard: "${shard}"
        member: "mongod:27022"
        command: "mongo --quiet --port 27022 --eval 'print(db.version())'"
        version: "${desired}"
      - name: "[${shard}] fcv is ${fcv}"
        type: shell
        command: >-
          mongo --quiet "${replset}" --eval
          'print(db.adminCommand({getParameter: 1, featureCompatibilityVersion: 1}).featureCompatibilityVersion.version)'
        equals: "${fcv}"
        negate: true
    command:
      name: "setting fcv ${fcv}"
      type: confirmed
      prompt: "Set feature compatibility version of ${shard} to ${fcv}?"
      then:
        name: set fcv
        type: shell
        command: >-
          mongo --quiet "${replset}" --eval
          'db.adminCommand({setFeatureCompatibilityVersion: "${fcv}"})'
    post_checks:
      - name: "[${shard}] fcv is ${fcv}"
        type: shell
        command: >-
          mongo --quiet "${replset}" --eval
          'print(db.adminCommand({getParameter: 1, featureCompatibilityVersion: 1}).featureCompatibilityVersion.version)'
        equals: "${fcv}"
"#;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
