//! Patches command implementation.

use std::path::Path;

use anyhow::{Context, Result};
use ilpatch_core::{builtin_patches, save_patch_set};

/// Print the built-in patch set, or save it as a starting point for a custom one.
pub fn run(save: Option<&Path>) -> Result<()> {
    let set = builtin_patches();

    if let Some(path) = save {
        save_patch_set(path, &set)
            .with_context(|| format!("Failed to save patch set to {}", path.display()))?;
        println!("Patch set saved to: {}", path.display());
    } else {
        println!("{}", serde_json::to_string_pretty(&set)?);
    }
    Ok(())
}
