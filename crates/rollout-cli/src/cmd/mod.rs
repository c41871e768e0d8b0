pub mod init;
pub mod plan;
pub mod run;
pub mod store;
pub mod versions;

use anyhow::Context;
use rollout_core::{paths, store::RedbStore};
use std::path::{Path, PathBuf};

/// Open the redb store at `explicit` (relative to `root`) or the default
/// location under `root`.
pub fn open_store(root: &Path, explicit: Option<&Path>) -> anyhow::Result<RedbStore> {
    let path = store_path(root, explicit);
    RedbStore::open(&path).with_context(|| format!("failed to open store {}", path.display()))
}

pub fn store_path(root: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(p) => paths::resolve(root, p),
        None => paths::store_path(root),
    }
}
