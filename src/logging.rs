use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing_subscriber::fmt::MakeWriter;

use crate::paths;

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that initially discards writes, then logs to a file
/// once activated via `handle.set_file(path)`.
///
/// The subscriber is installed before the command line says which image
/// (and thus which log file) a run is about.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Handle returned by `DeferredFileWriter::new()`; call `set_file` to activate.
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

fn lock(inner: &Mutex<Option<File>>) -> MutexGuard<'_, Option<File>> {
    // A panic while writing a log line leaves the file usable.
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Activate the file writer by opening `path` in append mode.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *lock(&self.inner) = Some(file);
        Ok(())
    }
}

/// Writer returned by `MakeWriter::make_writer`: either writes to the
/// file or discards (when not yet activated).
pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = lock(&self.inner);
        if let Some(ref mut f) = *guard {
            f.write(buf)
        } else {
            Ok(buf.len()) // discard
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut guard = lock(&self.inner);
        if let Some(ref mut f) = *guard {
            f.flush()
        } else {
            Ok(())
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

/// Per-image log file: `<logs dir>/<name>.log`
pub fn image_log_path(image_name: &str) -> PathBuf {
    paths::logs_dir().join(format!("{image_name}.log"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn discards_until_activated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("demo.log");
        let (writer, handle) = DeferredFileWriter::new();

        writer.make_writer().write_all(b"dropped\n").unwrap();
        assert!(!path.exists());

        handle.set_file(&path).unwrap();
        writer.make_writer().write_all(b"kept\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "kept\n");
    }

    #[test]
    fn log_path_is_named_after_image() {
        assert!(image_log_path("demo").ends_with("vbox-sync/logs/demo.log"));
    }
}
