//! Patch command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use ilpatch_core::{PatchSet, Patcher, PatcherConfig, builtin_patches, load_patch_set};

/// Built-in patches unless a patch set file is given.
pub fn load_set(path: Option<&Path>) -> Result<PatchSet> {
    match path {
        Some(path) => load_patch_set(path)
            .with_context(|| format!("Failed to load patch set {}", path.display())),
        None => Ok(builtin_patches()),
    }
}

pub fn run(config: PatcherConfig, patches: Option<&Path>) -> Result<()> {
    let set = load_set(patches)?;
    let module_path = config.module_path.clone();

    let report = Patcher::new(config)
        .run(&set)
        .with_context(|| format!("Failed to patch {}", module_path.display()))?;

    for outcome in &report.outcomes {
        println!(
            "  {} -> {}: +{} -{}",
            outcome.script, outcome.target, outcome.inserted, outcome.removed
        );
    }
    if let Some(backup) = &report.commit.backup {
        println!("Backup created at {}", backup.display());
    }
    println!(
        "{} patched successfully, and written to {}",
        module_path.display(),
        report.commit.destination.display()
    );
    Ok(())
}
