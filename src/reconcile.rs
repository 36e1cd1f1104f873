//! Registry reconciliation.
//!
//! Converges a per-image hypervisor home to the state an image needs:
//! home directories, disks, media registrations, the VM, its parameters
//! and finally the disk attachments. Steps run strictly in order; the
//! first failure aborts the run and is returned unchanged. Nothing is
//! rolled back: registrations and the VM persist and make the next run
//! cheaper.

use std::path::{Path, PathBuf};

use tracing::Span;

use crate::disk::{DiskEntry, DiskRole, DiskSet, DiskSetManager};
use crate::error::SyncError;
use crate::hypervisor::runner::ToolRunner;
use crate::hypervisor::{VBoxManage, VmId};
use crate::image::ImageDescriptor;
use crate::{paths, sidecar};

/// Where a reconciliation run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Init,
    HomeEnsured,
    SystemDiskChecked,
    DataDiskChecked,
    DisksRegistered,
    VmRegistered,
    ParametersApplied,
    /// Terminal: the VM is ready to launch.
    DisksAttached,
}

impl ReconcileState {
    /// States reached by a full run, in order.
    pub const STEPS: [ReconcileState; 7] = [
        ReconcileState::HomeEnsured,
        ReconcileState::SystemDiskChecked,
        ReconcileState::DataDiskChecked,
        ReconcileState::DisksRegistered,
        ReconcileState::VmRegistered,
        ReconcileState::ParametersApplied,
        ReconcileState::DisksAttached,
    ];

    pub fn next(self) -> Option<ReconcileState> {
        match self {
            ReconcileState::Init => Some(ReconcileState::HomeEnsured),
            ReconcileState::HomeEnsured => Some(ReconcileState::SystemDiskChecked),
            ReconcileState::SystemDiskChecked => Some(ReconcileState::DataDiskChecked),
            ReconcileState::DataDiskChecked => Some(ReconcileState::DisksRegistered),
            ReconcileState::DisksRegistered => Some(ReconcileState::VmRegistered),
            ReconcileState::VmRegistered => Some(ReconcileState::ParametersApplied),
            ReconcileState::ParametersApplied => Some(ReconcileState::DisksAttached),
            ReconcileState::DisksAttached => None,
        }
    }

    /// Human label for the work that leads into this state.
    pub fn label(self) -> &'static str {
        match self {
            ReconcileState::Init => "Starting",
            ReconcileState::HomeEnsured => "Preparing hypervisor home",
            ReconcileState::SystemDiskChecked => "Checking system disk",
            ReconcileState::DataDiskChecked => "Ensuring data disk",
            ReconcileState::DisksRegistered => "Registering disk media",
            ReconcileState::VmRegistered => "Registering VM",
            ReconcileState::ParametersApplied => "Applying VM parameters",
            ReconcileState::DisksAttached => "Attaching disks",
        }
    }
}

/// Receives step notifications while a run progresses.
pub trait ReconcileObserver {
    /// Work towards `state` is about to start.
    fn on_step_started(&mut self, state: ReconcileState);

    /// `state` was reached. `detail` summarises what was done.
    fn on_step_finished(&mut self, state: ReconcileState, detail: &str);

    /// Work towards `state` failed; the run is over.
    fn on_step_failed(&mut self, state: ReconcileState, error: &SyncError);
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl ReconcileObserver for NoopObserver {
    fn on_step_started(&mut self, _state: ReconcileState) {}
    fn on_step_finished(&mut self, _state: ReconcileState, _detail: &str) {}
    fn on_step_failed(&mut self, _state: ReconcileState, _error: &SyncError) {}
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub vm: VmId,
    pub disks: DiskSet,
}

/// Inputs of one run besides the image itself.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Base directory of synced images.
    pub target: PathBuf,
    pub data_disk_mb: u64,
    /// Path or name of the partitioning tool.
    pub parted: String,
}

pub struct Reconciler<'a, R> {
    vbox: &'a VBoxManage<R>,
    settings: ReconcileSettings,
    state: ReconcileState,
    span: Span,
}

impl<'a, R: ToolRunner> Reconciler<'a, R> {
    pub fn new(vbox: &'a VBoxManage<R>, settings: ReconcileSettings) -> Self {
        Self {
            vbox,
            settings,
            state: ReconcileState::Init,
            span: Span::none(),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    /// Drive all steps for `image`, reporting to `observer`.
    pub fn run(
        &mut self,
        image: &ImageDescriptor,
        observer: &mut dyn ReconcileObserver,
    ) -> Result<Reconciled, SyncError> {
        let span = self.span.clone();
        let _enter = span.enter();
        tracing::info!(image = %image, home = %self.vbox.home().display(), "reconciling");

        let vbox = self.vbox;
        let disks = DiskSetManager::new(vbox, self.settings.parted.clone())
            .with_span(self.span.clone());
        let mut disk_set = DiskSet::new();

        self.step(observer, |_| ensure_home(vbox.home()))?;

        let system = self.step(observer, |settings| {
            let entry = disks.ensure_system_disk(image, &settings.target)?;
            let detail = format!("system disk {}", entry.path.display());
            Ok((entry, detail))
        })?;
        disk_set.insert(system);

        // An existing data disk is not reported back by the disk manager,
        // but it still has to be registered and attached.
        let data = self.step(observer, |settings| {
            Ok(match disks.ensure_data_disk(image, settings.data_disk_mb)? {
                Some(entry) => {
                    let detail = format!("created {} MB data disk", settings.data_disk_mb);
                    (entry, detail)
                }
                None => (
                    DiskEntry::new(DiskRole::Data, disks.data_disk_path(image)),
                    "data disk already present".to_string(),
                ),
            })
        })?;
        disk_set.insert(data);

        self.step(observer, |_| {
            let mut added = 0;
            for entry in disk_set.iter() {
                if vbox.register_medium(&entry.path, entry.policy())? {
                    added += 1;
                }
            }
            Ok(((), format!("{added} of {} media newly registered", disk_set.len())))
        })?;

        let vm = self.step(observer, |_| {
            let vm = vbox.create_vm(image.name())?;
            let detail = format!("VM {} is {vm}", image.name());
            Ok((vm, detail))
        })?;

        self.step(observer, |settings| {
            let config = image.config_path(&settings.target);
            let parameters = sidecar::read_vm_parameters(&config)?;
            if parameters.is_empty() {
                return Ok(((), "no VM parameters to apply".to_string()));
            }
            vbox.modify_vm(&vm, &parameters)?;
            Ok(((), format!("{} VM parameters applied", parameters.len())))
        })?;

        self.step(observer, |_| {
            for entry in disk_set.iter() {
                let port = entry.role.port()?;
                vbox.attach_disk(&vm, port, Some(&entry.path))?;
            }
            Ok(((), format!("{} disks attached", disk_set.len())))
        })?;

        tracing::info!(image = %image, %vm, "reconciled");
        Ok(Reconciled { vm, disks: disk_set })
    }

    /// Run the work leading to the next state and advance on success.
    fn step<T>(
        &mut self,
        observer: &mut dyn ReconcileObserver,
        work: impl FnOnce(&ReconcileSettings) -> Result<(T, String), SyncError>,
    ) -> Result<T, SyncError> {
        let Some(next) = self.state.next() else {
            return Err(SyncError::Validation {
                message: "reconciliation already finished".into(),
            });
        };

        observer.on_step_started(next);
        match work(&self.settings) {
            Ok((value, detail)) => {
                tracing::debug!(state = ?next, detail = %detail, "step finished");
                self.state = next;
                observer.on_step_finished(next, &detail);
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(state = ?next, error = %e, "step failed");
                observer.on_step_failed(next, &e);
                Err(e)
            }
        }
    }
}

/// Create the hypervisor home and its media directory if absent.
fn ensure_home(home: &Path) -> Result<((), String), SyncError> {
    let media = paths::media_dir(home);
    if media.is_dir() {
        return Ok(((), format!("{} exists", home.display())));
    }

    if !home.exists() {
        create_private_dir(home)?;
        tracing::info!(home = %home.display(), "created hypervisor home");
    }
    std::fs::create_dir_all(&media).map_err(|e| SyncError::Io {
        context: format!("creating {}", media.display()),
        source: e,
    })?;
    Ok(((), format!("created {}", home.display())))
}

fn create_private_dir(path: &Path) -> Result<(), SyncError> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path).map_err(|e| SyncError::Io {
        context: format!("creating {}", path.display()),
        source: e,
    })
}
