use anyhow::Context;
use clap::Subcommand;
use rollout_core::store::{KvStore, StoreKey};
use std::path::Path;

use crate::cmd::open_store;
use crate::output::{print_json, print_table};

#[derive(Subcommand)]
pub enum StoreSubcommand {
    /// Print the value stored at a key
    Get {
        /// Key segments, e.g. `shards rs0 mongod:27020 version`
        #[arg(required = true)]
        key: Vec<String>,
    },

    /// Store a value at a key
    Set {
        #[arg(required = true)]
        key: Vec<String>,
        #[arg(long)]
        value: String,
    },

    /// List entries under a key prefix (all entries when omitted)
    List { prefix: Vec<String> },
}

pub fn run(
    root: &Path,
    store: Option<&Path>,
    subcmd: StoreSubcommand,
    json: bool,
) -> anyhow::Result<()> {
    let kv = open_store(root, store)?;
    match subcmd {
        StoreSubcommand::Get { key } => get(&kv, key, json),
        StoreSubcommand::Set { key, value } => set(&kv, key, &value, json),
        StoreSubcommand::List { prefix } => list(&kv, prefix, json),
    }
}

fn get(kv: &dyn KvStore, key: Vec<String>, json: bool) -> anyhow::Result<()> {
    let key = StoreKey::new(key)?;
    let value = kv
        .get(&key)
        .with_context(|| format!("failed to read {key}"))?
        .with_context(|| format!("no value at {key}"))?;
    if json {
        print_json(&serde_json::json!({ "key": key, "value": value }))
    } else {
        println!("{value}");
        Ok(())
    }
}

fn set(kv: &dyn KvStore, key: Vec<String>, value: &str, json: bool) -> anyhow::Result<()> {
    let key = StoreKey::new(key)?;
    kv.set(&key, value)
        .with_context(|| format!("failed to write {key}"))?;
    if json {
        print_json(&serde_json::json!({ "key": key, "value": value }))
    } else {
        println!("{key} = {value}");
        Ok(())
    }
}

fn list(kv: &dyn KvStore, prefix: Vec<String>, json: bool) -> anyhow::Result<()> {
    let prefix = StoreKey::new(prefix)?;
    let entries = kv.list(&prefix)?;
    if json {
        let items: Vec<_> = entries
            .iter()
            .map(|(k, v)| serde_json::json!({ "key": k, "value": v }))
            .collect();
        return print_json(&items);
    }
    if entries.is_empty() {
        println!("No entries.");
        return Ok(());
    }
    let rows: Vec<Vec<String>> = entries
        .into_iter()
        .map(|(k, v)| vec![k.to_string(), v])
        .collect();
    print_table(&["KEY", "VALUE"], &rows);
    Ok(())
}
