//! Startup verification.
//!
//! Everything here is fatal: the process refuses to serve until the
//! directories it will mount into and export from are usable.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::config::Config;
use crate::error::StartupError;
use crate::template::BootTemplate;

/// Load layered configuration, optionally topped by `explicit`.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, StartupError> {
    Ok(Config::load(explicit)?)
}

/// Check every configured directory, then load the boot template.
pub fn prepare(config: &Config) -> Result<BootTemplate, StartupError> {
    verify_directories(config)?;
    let template = BootTemplate::load(&config.pxe_template)?;
    Ok(template)
}

/// Base directories must exist; the ones written to must be writable.
pub fn verify_directories(config: &Config) -> Result<(), StartupError> {
    require_directory("root", &config.root_dir)?;
    require_directory("node", &config.node_dir)?;
    require_directory("overlay", &config.overlay_dir)?;

    require_read_write("node", &config.node_dir)?;
    require_read_write("overlay", &config.overlay_dir)?;

    info!(
        root_dir = %config.root_dir.display(),
        node_dir = %config.node_dir.display(),
        overlay_dir = %config.overlay_dir.display(),
        "Base directories verified"
    );
    Ok(())
}

fn require_directory(role: &'static str, path: &Path) -> Result<(), StartupError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(StartupError::NotADirectory {
            role,
            path: path.to_path_buf(),
        }),
        Err(_) => Err(StartupError::DirectoryMissing {
            role,
            path: path.to_path_buf(),
        }),
    }
}

fn require_read_write(role: &'static str, path: &Path) -> Result<(), StartupError> {
    if can_read_write(path) {
        Ok(())
    } else {
        Err(StartupError::DirectoryNotWritable {
            role,
            path: path.to_path_buf(),
        })
    }
}

/// access(2) with R_OK | W_OK, checked against the real uid.
#[cfg(unix)]
fn can_read_write(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn can_read_write(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| !meta.permissions().readonly())
        .unwrap_or(false)
}
