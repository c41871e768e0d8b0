use anyhow::Context;
use rollout_core::{io, paths, plan::STARTER_PLAN};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing rollout in: {}", root.display());

    let state_dir = paths::rollout_dir(root);
    io::ensure_dir(&state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;

    let plan = paths::plan_path(root);
    if io::write_if_missing(&plan, STARTER_PLAN.as_bytes())
        .with_context(|| format!("failed to write {}", plan.display()))?
    {
        println!("  created: {}", paths::PLAN_FILE);
    } else {
        println!("  exists:  {}", paths::PLAN_FILE);
    }

    if io::ensure_gitignore_entry(root, paths::GITIGNORE_ENTRY)
        .context("failed to update .gitignore")?
    {
        println!("  updated: .gitignore");
    }

    println!("\nNext: edit {} then `rollout plan show`", paths::PLAN_FILE);
    Ok(())
}
