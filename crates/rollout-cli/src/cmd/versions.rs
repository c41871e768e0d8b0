use clap::Subcommand;
use rollout_core::versions::VersionStore;
use std::path::Path;
use std::sync::Arc;

use crate::cmd::open_store;
use crate::output::{print_json, print_table};

#[derive(Subcommand)]
pub enum VersionsSubcommand {
    /// List the last observed version of each member
    List {
        /// Only members of this shard
        #[arg(long)]
        shard: Option<String>,
    },
}

pub fn run(
    root: &Path,
    store: Option<&Path>,
    subcmd: VersionsSubcommand,
    json: bool,
) -> anyhow::Result<()> {
    let versions = VersionStore::new(Arc::new(open_store(root, store)?));
    match subcmd {
        VersionsSubcommand::List { shard } => {
            let members = versions.list(shard.as_deref())?;
            if json {
                return print_json(&members);
            }
            if members.is_empty() {
                println!("No versions recorded.");
                return Ok(());
            }
            let rows: Vec<Vec<String>> = members
                .into_iter()
                .map(|m| vec![m.shard, m.member, m.version])
                .collect();
            print_table(&["SHARD", "MEMBER", "VERSION"], &rows);
            Ok(())
        }
    }
}
