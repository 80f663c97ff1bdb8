//! Binary module image.
//!
//! Layout: 4-byte magic, little-endian `u16` format version, then the
//! postcard-encoded [`Module`].

use std::fs;
use std::path::Path;

use tracing::debug;

use super::Module;
use crate::error::{Error, Result};

pub const MAGIC: [u8; 4] = *b"ILMD";
pub const FORMAT_VERSION: u16 = 1;
/// File extension of module files found during dependency resolution.
pub const MODULE_EXTENSION: &str = "dll";

const HEADER_LEN: usize = MAGIC.len() + 2;

impl Module {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::InvalidFormat("missing module magic".to_string()));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported format version {} (expected {})",
                version, FORMAT_VERSION
            )));
        }

        let module: Module = postcard::from_bytes(&bytes[HEADER_LEN..])?;
        Ok(module)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        write_module_bytes(self)
    }
}

/// Serialize a module into an in-memory image.
pub fn write_module_bytes(module: &Module) -> Result<Vec<u8>> {
    let payload = postcard::to_allocvec(module)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

pub fn read_module<P: AsRef<Path>>(path: P) -> Result<Module> {
    let bytes = fs::read(&path)?;
    let module = Module::from_bytes(&bytes)?;
    debug!(
        "Read module {} ({} types, {} bytes) from {}",
        module.name,
        module.types.len(),
        bytes.len(),
        path.as_ref().display()
    );
    Ok(module)
}
