//! Load, patch and write in one pass.
//!
//! ## Example
//!
//! ```ignore
//! use ilpatch_core::patch::builtin_patches;
//! use ilpatch_core::pipeline::{Patcher, PatcherConfig};
//!
//! let config = PatcherConfig::builder()
//!     .module_path("/games/tModLoader/tModLoader.dll")
//!     .search_dir("/games/tModLoader/Libraries")
//!     .build();
//! let report = Patcher::new(config).run(&builtin_patches())?;
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::patch::{PatchOutcome, PatchSet, apply_script};
use crate::resolve::{LoadedModule, load_module};
use crate::stream::InstructionStream;
use crate::writer::{CommitReport, write_module};

/// Source of the install directory when none is given.
pub trait DefaultLocation {
    fn install_dir(&self) -> Result<PathBuf>;
}

/// Use `explicit` unless it is blank, otherwise ask `location`.
pub fn resolve_install_dir(
    explicit: Option<&Path>,
    location: &dyn DefaultLocation,
) -> Result<PathBuf> {
    match explicit.filter(|path| !path.as_os_str().is_empty()) {
        Some(path) => Ok(path.to_path_buf()),
        None => {
            let dir = location.install_dir()?;
            debug!("Using default install directory {}", dir.display());
            Ok(dir)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatcherConfig {
    /// Module to patch
    pub module_path: PathBuf,
    /// Where to write the result; the input is overwritten when unset
    pub output_path: Option<PathBuf>,
    /// Extra roots searched for dependency modules
    pub search_dirs: Vec<PathBuf>,
}

impl PatcherConfig {
    pub fn builder() -> PatcherConfigBuilder {
        PatcherConfigBuilder::default()
    }

    pub fn destination(&self) -> &Path {
        self.output_path.as_deref().unwrap_or(&self.module_path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatcherConfigBuilder {
    module_path: Option<PathBuf>,
    output_path: Option<PathBuf>,
    search_dirs: Vec<PathBuf>,
}

impl PatcherConfigBuilder {
    pub fn module_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.module_path = Some(path.into());
        self
    }

    /// Set the output path. A blank path keeps the in-place default.
    pub fn output_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        let path = path.into();
        self.output_path = (!path.as_os_str().is_empty()).then_some(path);
        self
    }

    pub fn search_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.search_dirs.push(dir.into());
        self
    }

    pub fn search_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_dirs.extend(dirs.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> PatcherConfig {
        let default = PatcherConfig::default();
        PatcherConfig {
            module_path: self.module_path.unwrap_or(default.module_path),
            output_path: self.output_path,
            search_dirs: self.search_dirs,
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct PatchReport {
    pub outcomes: Vec<PatchOutcome>,
    pub commit: CommitReport,
}

impl PatchReport {
    pub fn inserted(&self) -> usize {
        self.outcomes.iter().map(|o| o.inserted).sum()
    }

    pub fn removed(&self) -> usize {
        self.outcomes.iter().map(|o| o.removed).sum()
    }
}

pub struct Patcher {
    config: PatcherConfig,
}

impl Patcher {
    pub fn new(config: PatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    fn load(&self) -> Result<LoadedModule> {
        load_module(&self.config.module_path, &self.config.search_dirs)
    }

    /// Apply every script of `set`, then write the module once.
    ///
    /// Nothing is written unless every script succeeds.
    pub fn run(&self, set: &PatchSet) -> Result<PatchReport> {
        let LoadedModule {
            path,
            mut module,
            resolver,
        } = self.load()?;
        info!(
            "Applying {} ({} scripts) to {}",
            set.name,
            set.scripts.len(),
            path.display()
        );

        let mut outcomes = Vec::with_capacity(set.scripts.len());
        for script in &set.scripts {
            info!("Patching {}", script.target);
            let outcome =
                apply_script(&mut module, &resolver, script).map_err(|e| Error::PatchFailed {
                    script: script.name.clone(),
                    target: script.target.to_string(),
                    source: Box::new(e),
                })?;
            outcomes.push(outcome);
        }

        let commit = write_module(&module, &path, self.config.destination())?;
        info!(
            "{} patched successfully, and written to {}",
            path.display(),
            commit.destination.display()
        );
        Ok(PatchReport { outcomes, commit })
    }

    /// Disassembly of one method body.
    pub fn inspect(&self, type_name: &str, method: &str) -> Result<String> {
        let loaded = self.load()?;
        let method_def = loaded.module.find_type(type_name)?.find_method(method)?;
        let body = method_def.body.as_ref().ok_or_else(|| {
            Error::InvalidPatch(format!("{}::{} has no method body", type_name, method))
        })?;
        let stream = InstructionStream::from_body(body)?;
        Ok(stream.to_string())
    }
}
