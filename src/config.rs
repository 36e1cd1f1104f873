use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::SyncError;
use crate::paths;

#[derive(Debug, Clone, Facet)]
pub struct Config {
    pub sync: SyncConfig,
    pub images: ImagesConfig,
    #[facet(default)]
    pub tools: ToolsConfig,
    #[facet(default)]
    pub disk: DiskConfig,
}

#[derive(Debug, Clone, Facet)]
pub struct SyncConfig {
    /// Remote base URL, e.g. `rsync://images.example.org/vbox`.
    pub baseurl: String,
}

#[derive(Debug, Clone, Facet)]
pub struct ImagesConfig {
    /// Local directory receiving `<name>/<name>.vdi` and `<name>/<name>.cfg`.
    pub target: String,
}

impl Config {
    pub fn target_dir(&self) -> PathBuf {
        PathBuf::from(&self.images.target)
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ToolsConfig {
    #[facet(default = "VBoxManage")]
    pub vboxmanage: String,
    /// Explicit path since /sbin is often not in an unprivileged PATH.
    #[facet(default = "/sbin/parted")]
    pub parted: String,
    #[facet(default = "rsync")]
    pub rsync: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            vboxmanage: "VBoxManage".into(),
            parted: "/sbin/parted".into(),
            rsync: "rsync".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DiskConfig {
    #[facet(default = 32)]
    pub data_size_mb: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self { data_size_mb: 32 }
    }
}

// ── SystemConfig ──────────────────────────────────────────

/// Effective runtime config: the parsed TOML plus the file it came from.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub config_path: PathBuf,
    pub config: Config,
}

impl SystemConfig {
    /// Apply command-line overrides on top of the file values.
    pub fn apply_overrides(
        &mut self,
        baseurl: Option<String>,
        target: Option<PathBuf>,
    ) -> Result<(), SyncError> {
        if let Some(url) = baseurl {
            self.config.sync.baseurl = url;
        }
        if let Some(dir) = target {
            self.config.images.target = dir.display().to_string();
        }
        validate_config(&self.config)?;

        tracing::debug!(
            config = %self.config_path.display(),
            baseurl = %self.config.sync.baseurl,
            target = %self.config.images.target,
            "effective configuration"
        );
        Ok(())
    }
}

fn validate_config(config: &Config) -> Result<(), SyncError> {
    if config.sync.baseurl.trim().is_empty() {
        return Err(SyncError::Validation {
            message: "sync.baseurl must not be empty".into(),
        });
    }
    if config.images.target.trim().is_empty() {
        return Err(SyncError::Validation {
            message: "images.target must not be empty".into(),
        });
    }
    if config.disk.data_size_mb == 0 {
        return Err(SyncError::Validation {
            message: "disk.data_size_mb must be greater than zero".into(),
        });
    }
    for (key, value) in [
        ("tools.vboxmanage", &config.tools.vboxmanage),
        ("tools.parted", &config.tools.parted),
        ("tools.rsync", &config.tools.rsync),
    ] {
        if value.is_empty() {
            return Err(SyncError::Validation {
                message: format!("{key} must not be empty"),
            });
        }
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<SystemConfig, SyncError> {
    let contents = std::fs::read_to_string(path).map_err(|source| SyncError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config: Config = facet_toml::from_str(&contents).map_err(|e| SyncError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    validate_config(&config)?;

    Ok(SystemConfig {
        config_path: path.to_path_buf(),
        config,
    })
}

/// Load the explicit config file, or the first existing default candidate.
pub fn resolve_config(explicit: Option<&Path>) -> Result<SystemConfig, SyncError> {
    if let Some(path) = explicit {
        return load_config(path);
    }

    let candidates = paths::config_candidates();
    match candidates.iter().find(|p| p.exists()) {
        Some(path) => load_config(path),
        None => Err(SyncError::ConfigLoad {
            path: candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no config file found"),
        }),
    }
}
