use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

pub const ROLLOUT_DIR: &str = ".rollout";
pub const STORE_FILE: &str = ".rollout/state.redb";
pub const PLAN_FILE: &str = "rollout.yaml";

/// Entry added to `.gitignore` by `rollout init`.
pub const GITIGNORE_ENTRY: &str = ".rollout/";

pub fn rollout_dir(root: &Path) -> PathBuf {
    root.join(ROLLOUT_DIR)
}

pub fn store_path(root: &Path) -> PathBuf {
    root.join(STORE_FILE)
}

pub fn plan_path(root: &Path) -> PathBuf {
    root.join(PLAN_FILE)
}

/// `path` as given when absolute, otherwise relative to `root`.
pub fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
