//! Image identity and the file layout derived from it.

use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::paths;

/// A versioned image: `<name>` at `<version>` on the remote repository.
///
/// Immutable once constructed; every path used during a run is derived
/// from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    name: String,
    version: String,
}

impl ImageDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Result<Self, SyncError> {
        let name = name.into();
        let version = version.into();
        validate_component("image name", &name)?;
        validate_component("image version", &version)?;
        Ok(Self { name, version })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// `<name>.vdi`
    pub fn system_disk_file(&self) -> String {
        format!("{}.vdi", self.name)
    }

    /// `<name>.cfg`
    pub fn config_file(&self) -> String {
        format!("{}.cfg", self.name)
    }

    /// `<base>/<name>/`
    pub fn target_dir(&self, base: &Path) -> PathBuf {
        base.join(&self.name)
    }

    pub fn system_disk_path(&self, base: &Path) -> PathBuf {
        self.target_dir(base).join(self.system_disk_file())
    }

    pub fn config_path(&self, base: &Path) -> PathBuf {
        self.target_dir(base).join(self.config_file())
    }

    /// Per-user hypervisor home for this image.
    pub fn hypervisor_home(&self) -> PathBuf {
        paths::hypervisor_home(&self.name)
    }
}

impl std::fmt::Display for ImageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// Names and versions end up as path components and remote URL segments.
fn validate_component(what: &str, value: &str) -> Result<(), SyncError> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' || c == '+');
    if !valid {
        return Err(SyncError::Validation {
            message: format!("{what} must match [a-zA-Z0-9._+-]+ (got '{value}')"),
        });
    }
    Ok(())
}
