//! Disk set: which disks a VM gets, where they live and how the
//! hypervisor should treat them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::Span;

use crate::error::SyncError;
use crate::hypervisor::runner::{Invocation, ToolRunner};
use crate::hypervisor::{ControllerPort, DiskPolicy, VBoxManage};
use crate::image::ImageDescriptor;
use crate::paths;

/// Default data disk size in megabytes.
pub const DEFAULT_DATA_DISK_MB: u64 = 32;

/// Below this size parted cannot reliably create FAT32.
const FAT32_MIN_MB: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiskRole {
    System,
    Data,
    Other,
}

impl DiskRole {
    pub fn policy(self) -> DiskPolicy {
        match self {
            DiskRole::System => DiskPolicy::Immutable,
            DiskRole::Data => DiskPolicy::Writethrough,
            DiskRole::Other => DiskPolicy::Normal,
        }
    }

    /// Controller port the role is attached to. Only system and data
    /// disks have one.
    pub fn port(self) -> Result<ControllerPort, SyncError> {
        match self {
            DiskRole::System => Ok(ControllerPort::PrimaryMaster),
            DiskRole::Data => Ok(ControllerPort::PrimarySlave),
            DiskRole::Other => Err(SyncError::UnsupportedConfiguration {
                message: format!("no controller port is defined for {self} disks"),
            }),
        }
    }
}

impl std::fmt::Display for DiskRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DiskRole::System => "system",
            DiskRole::Data => "data",
            DiskRole::Other => "other",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub role: DiskRole,
    pub path: PathBuf,
}

impl DiskEntry {
    pub fn new(role: DiskRole, path: impl Into<PathBuf>) -> Self {
        Self {
            role,
            path: path.into(),
        }
    }

    /// Fixed by role.
    pub fn policy(&self) -> DiskPolicy {
        self.role.policy()
    }
}

/// At most one disk per role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskSet {
    disks: BTreeMap<DiskRole, DiskEntry>,
}

impl DiskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`, replacing any disk with the same role.
    pub fn insert(&mut self, entry: DiskEntry) -> Option<DiskEntry> {
        self.disks.insert(entry.role, entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiskEntry> {
        self.disks.values()
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }
}

/// Filesystem put on a fresh data disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat16,
    Fat32,
}

impl FatType {
    pub fn for_size(size_mb: u64) -> Self {
        if size_mb >= FAT32_MIN_MB {
            FatType::Fat32
        } else {
            FatType::Fat16
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FatType::Fat16 => "fat16",
            FatType::Fat32 => "fat32",
        }
    }
}

/// Ensures the disks of one image exist on local storage.
pub struct DiskSetManager<'a, R> {
    vbox: &'a VBoxManage<R>,
    parted: String,
    span: Span,
}

impl<'a, R: ToolRunner> DiskSetManager<'a, R> {
    pub fn new(vbox: &'a VBoxManage<R>, parted: impl Into<String>) -> Self {
        Self {
            vbox,
            parted: parted.into(),
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The synced system disk under `target`. Its absence means the image
    /// was never synced.
    pub fn ensure_system_disk(
        &self,
        image: &ImageDescriptor,
        target: &Path,
    ) -> Result<DiskEntry, SyncError> {
        let path = image.system_disk_path(target);
        if !path.is_file() {
            return Err(SyncError::ImageNotFound {
                name: image.name().to_string(),
                version: image.version().to_string(),
                location: path.display().to_string(),
            });
        }
        tracing::debug!(parent: &self.span, path = %path.display(), "system disk present");
        Ok(DiskEntry::new(DiskRole::System, path))
    }

    /// Location of the image's data disk inside the hypervisor home.
    pub fn data_disk_path(&self, image: &ImageDescriptor) -> PathBuf {
        paths::data_disk_path(self.vbox.home(), image.name())
    }

    /// Create the data disk unless it already exists.
    ///
    /// Returns `None` when the disk is already there; an existing disk is
    /// never resized or recreated, whatever `size_mb` says.
    pub fn ensure_data_disk(
        &self,
        image: &ImageDescriptor,
        size_mb: u64,
    ) -> Result<Option<DiskEntry>, SyncError> {
        let _enter = self.span.enter();
        let target = self.data_disk_path(image);
        if target.exists() {
            tracing::debug!(path = %target.display(), "data disk already provisioned");
            return Ok(None);
        }

        tracing::info!(image = image.name(), size_mb, "creating data disk");
        if let Err(e) = self.provision(&target, size_mb) {
            // Existence of the target marks the disk as done, so a
            // half-converted file must not survive.
            if target.exists()
                && let Err(rm) = std::fs::remove_file(&target)
            {
                tracing::warn!(path = %target.display(), error = %rm, "could not remove partial data disk");
            }
            return Err(e);
        }

        Ok(Some(DiskEntry::new(DiskRole::Data, target)))
    }

    /// Zero-filled raw file → msdos label → one FAT partition → VDI.
    fn provision(&self, target: &Path, size_mb: u64) -> Result<(), SyncError> {
        let raw = tempfile::Builder::new()
            .prefix("vbox-sync-data-")
            .suffix(".img")
            .tempfile()
            .map_err(|e| step_error("allocate", e))?;
        let bytes = size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| SyncError::DiskProvisioning {
                step: "allocate".into(),
                message: format!("{size_mb} MB does not fit in a byte count"),
            })?;
        raw.as_file()
            .set_len(bytes)
            .map_err(|e| step_error("allocate", e))?;

        self.parted("mklabel", raw.path(), &["mklabel", "msdos"])?;

        let fat = FatType::for_size(size_mb);
        let end = size_mb.to_string();
        self.parted(
            "mkpartfs",
            raw.path(),
            &["mkpartfs", "primary", fat.as_str(), "1", &end],
        )?;

        self.vbox
            .convert_from_raw(raw.path(), target)
            .map_err(|e| SyncError::DiskProvisioning {
                step: "convertfromraw".into(),
                message: e.to_string(),
            })?;

        raw.close().map_err(|e| step_error("discard", e))?;
        tracing::info!(path = %target.display(), fs = fat.as_str(), "data disk created");
        Ok(())
    }

    fn parted(&self, step: &str, raw: &Path, args: &[&str]) -> Result<(), SyncError> {
        let invocation = Invocation::new(&self.parted)
            .arg("-s")
            .arg(raw)
            .args(args.iter().copied());
        let output = self
            .vbox
            .runner()
            .run(&invocation)
            .map_err(|e| step_error(step, e))?;
        if !output.is_success() {
            return Err(SyncError::DiskProvisioning {
                step: step.into(),
                message: format!(
                    "{}: {}",
                    invocation.command_line(),
                    output.failure_message()
                ),
            });
        }
        Ok(())
    }
}

fn step_error(step: &str, e: std::io::Error) -> SyncError {
    SyncError::DiskProvisioning {
        step: step.into(),
        message: e.to_string(),
    }
}
