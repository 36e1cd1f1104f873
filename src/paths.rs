use std::path::{Path, PathBuf};

/// Name of the media subdirectory inside a hypervisor home.
pub const MEDIA_DIR: &str = "VDI";

/// Per-image hypervisor home: `~/.VirtualBox-<name>/`
///
/// Each image gets its own registry so that VMs and media of different
/// images (and different users) never share state.
pub fn hypervisor_home(image_name: &str) -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(format!(".VirtualBox-{image_name}"))
}

/// The user's regular VirtualBox home: `~/.VirtualBox/`
pub fn default_hypervisor_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".VirtualBox")
}

/// Media directory holding the data disk: `<home>/VDI/`
pub fn media_dir(home: &Path) -> PathBuf {
    home.join(MEDIA_DIR)
}

/// Data disk of an image: `<home>/VDI/<name>-data.vdi`
pub fn data_disk_path(home: &Path, image_name: &str) -> PathBuf {
    media_dir(home).join(format!("{image_name}-data.vdi"))
}

/// Log directory: `~/.local/share/vbox-sync/logs/`
pub fn logs_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("vbox-sync")
        .join("logs")
}

/// Config files searched when no `--config` is given, in priority order.
pub fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("vbox-sync.toml"));
    }
    candidates.push(PathBuf::from("/etc/vbox-sync.toml"));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_dir_is_inside_home() {
        let home = hypervisor_home("demo");
        assert!(home.ends_with(".VirtualBox-demo"));
        assert_eq!(media_dir(&home), home.join("VDI"));
    }

    #[test]
    fn data_disk_uses_image_name() {
        assert_eq!(
            data_disk_path(Path::new("/home/u/.VirtualBox-demo"), "demo"),
            PathBuf::from("/home/u/.VirtualBox-demo/VDI/demo-data.vdi")
        );
    }

    #[test]
    fn system_config_is_last_candidate() {
        let candidates = config_candidates();
        assert_eq!(
            candidates.last().unwrap(),
            &PathBuf::from("/etc/vbox-sync.toml")
        );
    }
}
