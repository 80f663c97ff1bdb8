//! Committing a patched module to disk.
//!
//! The module is encoded in memory before anything on disk changes. The
//! commit then drops any old `.bak`, moves an in-place destination aside to
//! `.bak` and writes the new image.
//!
//! The rename and the write are not one atomic step: a crash between them
//! leaves only the `.bak` behind.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;
use crate::module::{Module, write_module_bytes};

/// What a successful commit changed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub destination: PathBuf,
    /// Set when the previous destination was moved aside.
    pub backup: Option<PathBuf>,
    pub bytes_written: usize,
}

/// `<destination>.bak`
pub fn backup_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

/// Encode `module` and commit it to `destination`.
///
/// `source` is the file the module was read from; the destination is only
/// moved to `.bak` when it is that same file.
pub fn write_module(module: &Module, source: &Path, destination: &Path) -> Result<CommitReport> {
    let buffer = write_module_bytes(module)?;
    commit(&buffer, source, destination)
}

/// Replace `destination` with `buffer`, keeping one backup generation.
pub fn commit(buffer: &[u8], source: &Path, destination: &Path) -> Result<CommitReport> {
    let bak = backup_path(destination);
    if bak.exists() {
        debug!("Removing old backup {}", bak.display());
        fs::remove_file(&bak)?;
    }

    let backup = if destination.exists() && same_file(source, destination) {
        fs::rename(destination, &bak)?;
        info!("Backup created at {}", bak.display());
        Some(bak)
    } else {
        None
    };

    fs::write(destination, buffer)?;
    info!(
        "Wrote {} ({} bytes)",
        destination.display(),
        buffer.len()
    );

    Ok(CommitReport {
        destination: destination.to_path_buf(),
        backup,
        bytes_written: buffer.len(),
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
