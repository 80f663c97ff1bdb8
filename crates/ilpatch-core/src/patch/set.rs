use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::PatchScript;
use crate::error::Result;

/// Scripts applied together in one run, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchSet {
    pub name: String,
    pub scripts: Vec<PatchScript>,
}

impl PatchSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Vec::new(),
        }
    }

    pub fn with_script(mut self, script: PatchScript) -> Self {
        self.scripts.push(script);
        self
    }

    pub fn script(&self, name: &str) -> Option<&PatchScript> {
        self.scripts
            .iter()
            .find(|script| script.name.eq_ignore_ascii_case(name))
    }
}

pub fn load_patch_set<P: AsRef<Path>>(path: P) -> Result<PatchSet> {
    let content = fs::read_to_string(&path)?;
    let set: PatchSet = serde_json::from_str(&content)?;
    debug!(
        "Loaded patch set {} ({} scripts) from {}",
        set.name,
        set.scripts.len(),
        path.as_ref().display()
    );
    Ok(set)
}

pub fn save_patch_set<P: AsRef<Path>>(path: P, set: &PatchSet) -> Result<()> {
    let content = serde_json::to_string_pretty(set)?;
    fs::write(path, content)?;
    Ok(())
}
