//! Fetching images and their sidecar configs from the remote repository.

use std::path::Path;

use tracing::Span;

use crate::error::SyncError;
use crate::hypervisor::runner::{Invocation, ToolRunner};
use crate::image::ImageDescriptor;

/// rsync exit status for partial transfers, which includes "no such file".
const RSYNC_PARTIAL_TRANSFER: i32 = 23;

/// File transfer from the image repository.
pub trait Transfer {
    /// Whether `url` exists. Absence is `Ok(false)`; any other failure is
    /// [`SyncError::Transport`].
    fn exists(&self, url: &str) -> Result<bool, SyncError>;

    /// Copy `url` to `dest`, leaving it world-readable.
    fn fetch(&self, url: &str, dest: &Path) -> Result<(), SyncError>;
}

pub struct RsyncTransfer<R> {
    runner: R,
    program: String,
}

impl<R: ToolRunner> RsyncTransfer<R> {
    pub fn new(runner: R, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }
}

impl<R: ToolRunner> Transfer for RsyncTransfer<R> {
    fn exists(&self, url: &str) -> Result<bool, SyncError> {
        let invocation = Invocation::new(&self.program).args(["-q", url]);
        let output = self
            .runner
            .run(&invocation)
            .map_err(|e| SyncError::Transport {
                url: url.to_string(),
                message: format!("running {}: {e}", invocation.command_line()),
            })?;
        match output.status {
            Some(0) => Ok(true),
            Some(RSYNC_PARTIAL_TRANSFER) => Ok(false),
            _ => Err(SyncError::Transport {
                url: url.to_string(),
                message: output.failure_message(),
            }),
        }
    }

    fn fetch(&self, url: &str, dest: &Path) -> Result<(), SyncError> {
        let invocation = Invocation::new(&self.program)
            .args(["--progress", "--times", url])
            .arg(dest);
        let status = self
            .runner
            .run_attached(&invocation)
            .map_err(|e| SyncError::Transport {
                url: url.to_string(),
                message: format!("running {}: {e}", invocation.command_line()),
            })?;
        if status != Some(0) {
            return Err(SyncError::Transport {
                url: url.to_string(),
                message: match status {
                    Some(code) => format!("rsync exited with status {code}"),
                    None => "rsync was terminated by a signal".into(),
                },
            });
        }
        make_world_readable(dest)
    }
}

/// Don't inherit the remote (or local source) permissions.
fn make_world_readable(path: &Path) -> Result<(), SyncError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).map_err(|e| {
            SyncError::Io {
                context: format!("setting permissions on {}", path.display()),
                source: e,
            }
        })?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// `<baseurl>/<name>/<version>/<filename>`
///
/// Joined by hand: URL joining treats `rsync://` URLs as opaque.
pub fn remote_url(baseurl: &str, image: &ImageDescriptor, filename: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        baseurl.trim_end_matches('/'),
        image.name(),
        image.version(),
        filename
    )
}

/// Syncs one image (system disk and sidecar) into the local target directory.
pub struct ImageSync<'a, T> {
    transfer: &'a T,
    baseurl: String,
    target: &'a Path,
    span: Span,
}

impl<'a, T: Transfer> ImageSync<'a, T> {
    pub fn new(transfer: &'a T, baseurl: impl Into<String>, target: &'a Path) -> Self {
        Self {
            transfer,
            baseurl: baseurl.into(),
            target,
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn sync(&self, image: &ImageDescriptor) -> Result<(), SyncError> {
        let _enter = self.span.enter();
        let disk_url = remote_url(&self.baseurl, image, &image.system_disk_file());
        let config_url = remote_url(&self.baseurl, image, &image.config_file());

        for url in [&disk_url, &config_url] {
            if !self.transfer.exists(url)? {
                return Err(SyncError::ImageNotFound {
                    name: image.name().to_string(),
                    version: image.version().to_string(),
                    location: url.clone(),
                });
            }
        }
        tracing::debug!(image = %image, "image found on the server");

        ensure_target_dir(&image.target_dir(self.target))?;
        check_writable(&image.system_disk_path(self.target))?;

        tracing::info!(image = %image, "syncing image");
        self.transfer
            .fetch(&config_url, &image.config_path(self.target))?;
        self.transfer
            .fetch(&disk_url, &image.system_disk_path(self.target))?;
        tracing::info!(image = %image, "image synced");
        Ok(())
    }
}

fn ensure_target_dir(dir: &Path) -> Result<(), SyncError> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => SyncError::TargetNotWritable {
            path: dir.display().to_string(),
        },
        _ => SyncError::Io {
            context: format!("creating {}", dir.display()),
            source: e,
        },
    })
}

/// An existing system disk must be writable so rsync can update it.
fn check_writable(path: &Path) -> Result<(), SyncError> {
    if !path.exists() {
        return Ok(());
    }
    match std::fs::OpenOptions::new().write(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(SyncError::TargetNotWritable {
                path: path.display().to_string(),
            })
        }
        Err(e) => Err(SyncError::Io {
            context: format!("opening {}", path.display()),
            source: e,
        }),
    }
}
