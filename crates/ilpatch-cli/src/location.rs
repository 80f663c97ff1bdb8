//! Default tModLoader install location per platform.

use std::io;
use std::path::{Path, PathBuf};

use ilpatch_core::{DefaultLocation, Error, Result};

const STEAM_APP_DIR: &str = "Steam/steamapps/common/tModLoader";

/// Steam library location of the current platform.
pub struct PlatformLocation;

impl DefaultLocation for PlatformLocation {
    fn install_dir(&self) -> Result<PathBuf> {
        if cfg!(target_os = "windows") {
            return Ok(PathBuf::from(
                r"C:\Program Files (x86)\Steam\steamapps\common\tModLoader",
            ));
        }

        let home = dirs::home_dir().ok_or_else(|| unsupported("home directory is unknown"))?;
        if cfg!(target_os = "macos") {
            Ok(home.join("Library/Application Support").join(STEAM_APP_DIR))
        } else if cfg!(target_os = "linux") {
            let xdg = std::env::var_os("XDG_DATA_HOME").map(PathBuf::from);
            Ok(linux_install_dir(xdg.as_deref(), &home))
        } else {
            Err(unsupported("unknown or unsupported platform"))
        }
    }
}

fn linux_install_dir(xdg_data_home: Option<&Path>, home: &Path) -> PathBuf {
    match xdg_data_home.filter(|dir| !dir.as_os_str().is_empty()) {
        Some(data) => data.join(STEAM_APP_DIR),
        None => home.join(".local").join("share").join(STEAM_APP_DIR),
    }
}

fn unsupported(reason: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("no default install directory: {}", reason),
    ))
}
