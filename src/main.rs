use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vbox_sync::cli::{Cli, Command};
use vbox_sync::config::{self, SystemConfig, ToolsConfig};
use vbox_sync::error::SyncError;
use vbox_sync::hypervisor::VBoxManage;
use vbox_sync::hypervisor::runner::SystemRunner;
use vbox_sync::image::ImageDescriptor;
use vbox_sync::logging::{self, DeferredFileHandle};
use vbox_sync::progress::{OutputMode, StepProgress};
use vbox_sync::reconcile::{ReconcileSettings, ReconcileState, Reconciler};
use vbox_sync::sync::{ImageSync, RsyncTransfer};
use vbox_sync::{launch, paths};

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let mode = resolve_output_mode(cli.verbose);

    // Tracing output to stderr corrupts indicatif's line tracking, so the
    // terminal layer stays quiet while `invoke` draws its steps.
    let spinners = mode == OutputMode::Normal && matches!(cli.command, Command::Invoke { .. });
    let terminal_filter = if spinners {
        EnvFilter::new("off")
    } else if cli.verbose {
        EnvFilter::new("vbox_sync=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vbox_sync=info"))
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures vbox_sync=debug, discards until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("vbox_sync=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    match cli.command {
        Command::Sync { name, version } => {
            let image = ImageDescriptor::new(name, version)?;
            let sys_config = load_config(cli.config, cli.baseurl, cli.target)?;
            run_sync(&sys_config, &image)?;
        }
        Command::Invoke { name, version } => {
            let image = ImageDescriptor::new(name, version)?;
            let sys_config = load_config(cli.config, cli.baseurl, cli.target)?;
            activate_log_file(&file_handle, &image);
            run_invoke(&sys_config, &image, mode)?;
        }
        Command::Makecfg { vm, output, home } => {
            let tools = makecfg_tools(cli.config)?;
            run_makecfg(&tools, &vm, output, home)?;
        }
    }

    Ok(())
}

fn resolve_output_mode(verbose: bool) -> OutputMode {
    if !std::io::stderr().is_terminal() {
        OutputMode::Plain
    } else if verbose {
        OutputMode::Verbose
    } else {
        OutputMode::Normal
    }
}

fn load_config(
    explicit: Option<PathBuf>,
    baseurl: Option<String>,
    target: Option<PathBuf>,
) -> Result<SystemConfig, SyncError> {
    let mut sys_config = config::resolve_config(explicit.as_deref())?;
    sys_config.apply_overrides(baseurl, target)?;
    Ok(sys_config)
}

/// `makecfg` only needs tool paths, so a missing default config is fine.
fn makecfg_tools(explicit: Option<PathBuf>) -> Result<ToolsConfig, SyncError> {
    match config::resolve_config(explicit.as_deref()) {
        Ok(sys_config) => Ok(sys_config.config.tools),
        Err(SyncError::ConfigLoad { path, .. }) if explicit.is_none() => {
            tracing::debug!(candidates = %path, "no config file, using default tool paths");
            Ok(ToolsConfig::default())
        }
        Err(e) => Err(e),
    }
}

fn activate_log_file(handle: &DeferredFileHandle, image: &ImageDescriptor) {
    let path = logging::image_log_path(image.name());
    if let Err(e) = handle.set_file(&path) {
        tracing::warn!(path = %path.display(), error = %e, "cannot open log file");
    }
}

fn run_sync(sys_config: &SystemConfig, image: &ImageDescriptor) -> Result<(), SyncError> {
    let config = &sys_config.config;
    let rsync = RsyncTransfer::new(SystemRunner, config.tools.rsync.clone());
    let target = config.target_dir();
    ImageSync::new(&rsync, config.sync.baseurl.clone(), &target)
        .with_span(tracing::info_span!("sync", image = %image))
        .sync(image)
}

fn run_invoke(
    sys_config: &SystemConfig,
    image: &ImageDescriptor,
    mode: OutputMode,
) -> Result<(), SyncError> {
    let config = &sys_config.config;
    let vbox = VBoxManage::new(
        SystemRunner,
        config.tools.vboxmanage.clone(),
        image.hypervisor_home(),
    )
    .with_span(tracing::info_span!("vboxmanage", image = %image));

    let settings = ReconcileSettings {
        target: config.target_dir(),
        data_disk_mb: config.disk.data_size_mb,
        parted: config.tools.parted.clone(),
    };

    {
        let mut progress = StepProgress::new(ReconcileState::STEPS.len(), mode);
        let reconciled = Reconciler::new(&vbox, settings)
            .with_span(tracing::info_span!("reconcile", image = %image))
            .run(image, &mut progress)?;
        progress.println(&format!(
            "VM '{}' ready ({}), launching",
            image.name(),
            reconciled.vm
        ));
        // Progress bars must be finished before the process is replaced.
    }

    match launch::launch(&vbox, image)? {}
}

fn run_makecfg(
    tools: &ToolsConfig,
    vm: &str,
    output: Option<PathBuf>,
    home: Option<PathBuf>,
) -> Result<(), SyncError> {
    let home = home.unwrap_or_else(paths::default_hypervisor_home);
    let vbox = VBoxManage::new(SystemRunner, tools.vboxmanage.clone(), home);
    let section = vbox.dump_vm_config(vm)?;

    match output {
        Some(path) => {
            std::fs::write(&path, &section).map_err(|e| SyncError::Io {
                context: format!("writing {}", path.display()),
                source: e,
            })?;
            tracing::info!(vm, path = %path.display(), "wrote VM parameters");
        }
        None => print!("{section}"),
    }
    Ok(())
}
