//! Adapter over the `VBoxManage` command-line tool.
//!
//! The hypervisor exposes no structured API. Queries shell out and parse
//! line-oriented text (see [`parse`]); state changes are plain commands
//! whose failure is the only feedback. Registry state is never cached:
//! every decision re-queries the tool.

pub mod parse;
pub mod runner;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::Span;

use crate::error::SyncError;
use crate::sidecar::VmParameters;
use runner::{Invocation, ToolOutput, ToolRunner};

/// Environment variable selecting the hypervisor's registry directory.
pub const HOME_ENV: &str = "VBOX_USER_HOME";

/// Hypervisor-assigned VM identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(String);

impl VmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How writes to a medium interact with snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskPolicy {
    /// Shared read-only base; writes go to a differencing image.
    Immutable,
    /// Bypasses snapshot differencing.
    Writethrough,
    /// Default copy-on-write behaviour.
    Normal,
}

impl DiskPolicy {
    pub fn as_tag(self) -> &'static str {
        match self {
            DiskPolicy::Immutable => "immutable",
            DiskPolicy::Writethrough => "writethrough",
            DiskPolicy::Normal => "normal",
        }
    }
}

/// IDE controller slots the disks are attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerPort {
    PrimaryMaster,
    PrimarySlave,
}

impl ControllerPort {
    /// `modifyvm` flag addressing this port.
    pub fn flag(self) -> &'static str {
        match self {
            ControllerPort::PrimaryMaster => "-hda",
            ControllerPort::PrimarySlave => "-hdb",
        }
    }
}

/// `VBoxManage` bound to one hypervisor home.
pub struct VBoxManage<R> {
    runner: R,
    program: String,
    home: PathBuf,
    span: Span,
}

impl<R: ToolRunner> VBoxManage<R> {
    pub fn new(runner: R, program: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            program: program.into(),
            home: home.into(),
            span: Span::none(),
        }
    }

    /// Attach a logging span; every call made by this adapter runs inside it.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Build an invocation routed at this adapter's hypervisor home.
    pub fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        Invocation::new(&self.program)
            .arg("-nologo")
            .args(args)
            .env(HOME_ENV, &self.home)
    }

    fn call(&self, invocation: Invocation) -> Result<ToolOutput, SyncError> {
        let output = self
            .runner
            .run(&invocation)
            .map_err(|e| SyncError::ToolInvocation {
                command: invocation.command_line(),
                message: e.to_string(),
            })?;
        if !output.is_success() {
            return Err(SyncError::ToolInvocation {
                command: invocation.command_line(),
                message: output.failure_message(),
            });
        }
        Ok(output)
    }

    /// Registered VMs, `UUID -> name`.
    pub fn list_vms(&self) -> Result<BTreeMap<VmId, String>, SyncError> {
        let _enter = self.span.enter();
        let invocation = self.invocation(["list", "vms"]);
        let command = invocation.command_line();
        let output = self.call(invocation)?;
        parse::parse_vm_list(&output.stdout)
            .map_err(|message| SyncError::ToolInvocation { command, message })
    }

    /// Absolute locations of all registered hard disk media.
    pub fn list_registered_media(&self) -> Result<BTreeSet<PathBuf>, SyncError> {
        let _enter = self.span.enter();
        let output = self.call(self.invocation(["list", "hdds"]))?;
        Ok(parse::parse_media_locations(&output.stdout))
    }

    /// Return the UUID of VM `name`, creating and registering it if absent.
    pub fn create_vm(&self, name: &str) -> Result<VmId, SyncError> {
        if let Some((id, _)) = self.list_vms()?.into_iter().find(|(_, n)| n == name) {
            tracing::debug!(parent: &self.span, vm = name, %id, "VM already registered");
            return Ok(id);
        }

        let _enter = self.span.enter();
        let invocation = self.invocation(["createvm", "-name", name, "-register"]);
        let command = invocation.command_line();
        let output = self.call(invocation)?;
        let id = parse::parse_created_uuid(&output.stdout).ok_or_else(|| {
            SyncError::ToolInvocation {
                command,
                message: "VM was created but no UUID was reported".into(),
            }
        })?;
        tracing::info!(vm = name, %id, "created VM");
        Ok(id)
    }

    /// Register `path` as a hard disk with `policy`. Returns `true` if the
    /// registry changed, `false` if the medium was already known.
    pub fn register_medium(&self, path: &Path, policy: DiskPolicy) -> Result<bool, SyncError> {
        let absolute = std::path::absolute(path).map_err(|e| SyncError::Io {
            context: format!("resolving {}", path.display()),
            source: e,
        })?;
        if self.list_registered_media()?.contains(&absolute) {
            tracing::debug!(parent: &self.span, path = %absolute.display(), "medium already registered");
            return Ok(false);
        }

        let _enter = self.span.enter();
        self.call(
            self.invocation(["openmedium", "disk"])
                .arg(&absolute)
                .args(["-type", policy.as_tag()]),
        )?;
        tracing::info!(path = %absolute.display(), policy = policy.as_tag(), "registered medium");
        Ok(true)
    }

    /// Clear `port`, then attach `disk` to it.
    ///
    /// The tool refuses to overwrite an occupied port (for instance one
    /// still holding a differencing image from an earlier run), so the
    /// port is always set to `none` first. `None` only clears.
    pub fn attach_disk(
        &self,
        vm: &VmId,
        port: ControllerPort,
        disk: Option<&Path>,
    ) -> Result<(), SyncError> {
        let _enter = self.span.enter();
        self.call(self.invocation(["modifyvm", vm.as_str(), port.flag(), "none"]))?;
        if let Some(disk) = disk {
            self.call(
                self.invocation(["modifyvm", vm.as_str(), port.flag()])
                    .arg(disk),
            )?;
            tracing::info!(%vm, port = port.flag(), disk = %disk.display(), "attached disk");
        }
        Ok(())
    }

    /// Apply all parameters in a single `modifyvm` call.
    pub fn modify_vm(&self, vm: &VmId, parameters: &VmParameters) -> Result<(), SyncError> {
        let _enter = self.span.enter();
        self.call(
            self.invocation(["modifyvm", vm.as_str()])
                .args(parameters.to_flags()),
        )?;
        tracing::info!(%vm, count = parameters.len(), "applied VM parameters");
        Ok(())
    }

    /// Dump a VM's settings as a `[vmparameters]` sidecar section.
    pub fn dump_vm_config(&self, vm: &str) -> Result<String, SyncError> {
        let _enter = self.span.enter();
        let output = self.call(self.invocation(["showvminfo", vm, "-machinereadable"]))?;
        Ok(parse::vminfo_to_parameters(&output.stdout))
    }

    /// Convert a raw disk image into a VDI file at `target`.
    pub fn convert_from_raw(&self, raw: &Path, target: &Path) -> Result<(), SyncError> {
        let _enter = self.span.enter();
        self.call(
            self.invocation(["convertfromraw", "-format", "VDI"])
                .arg(raw)
                .arg(target),
        )?;
        Ok(())
    }

    /// Invocation that starts VM `name` in the foreground.
    pub fn start_vm_invocation(&self, name: &str) -> Invocation {
        self.invocation(["startvm", name])
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeVbox;
    use super::*;

    fn adapter(fake: FakeVbox) -> VBoxManage<FakeVbox> {
        VBoxManage::new(fake, "VBoxManage", "/home/u/.VirtualBox-demo")
    }

    #[test]
    fn every_call_carries_home_and_nologo() {
        let vbox = adapter(FakeVbox::new());
        vbox.list_vms().unwrap();
        let invocations = vbox.runner().invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].arg_strings()[0], "-nologo");
        assert_eq!(
            invocations[0].env_value(HOME_ENV),
            Some(&PathBuf::from("/home/u/.VirtualBox-demo"))
        );
    }

    #[test]
    fn create_vm_is_idempotent() {
        let vbox = adapter(FakeVbox::new());
        let first = vbox.create_vm("x").unwrap();
        let second = vbox.create_vm("x").unwrap();
        assert_eq!(first, second);

        let creates = vbox
            .runner()
            .commands()
            .into_iter()
            .filter(|c| c.contains("createvm"))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn create_vm_returns_existing_uuid() {
        let fake = FakeVbox::new().with_vm("U7", "demo");
        let vbox = adapter(fake);
        assert_eq!(vbox.create_vm("demo").unwrap(), VmId::new("U7"));
        assert_eq!(vbox.runner().commands(), ["VBoxManage -nologo list vms"]);
    }

    #[test]
    fn create_vm_without_uuid_in_output_is_error() {
        let vbox = adapter(FakeVbox::new().without_created_uuid());
        let err = vbox.create_vm("demo").unwrap_err();
        match err {
            SyncError::ToolInvocation { command, message } => {
                assert!(command.contains("createvm -name demo -register"));
                assert!(message.contains("no UUID"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn register_medium_returns_true_exactly_once() {
        let vbox = adapter(FakeVbox::new());
        let disk = Path::new("/srv/images/demo/demo.vdi");
        assert!(vbox.register_medium(disk, DiskPolicy::Immutable).unwrap());
        assert!(!vbox.register_medium(disk, DiskPolicy::Immutable).unwrap());
        assert!(!vbox.register_medium(disk, DiskPolicy::Immutable).unwrap());

        let opens: Vec<_> = vbox
            .runner()
            .commands()
            .into_iter()
            .filter(|c| c.contains("openmedium"))
            .collect();
        assert_eq!(
            opens,
            ["VBoxManage -nologo openmedium disk /srv/images/demo/demo.vdi -type immutable"]
        );
    }

    #[test]
    fn register_medium_resolves_relative_paths() {
        let vbox = adapter(FakeVbox::new());
        vbox.register_medium(Path::new("disk.vdi"), DiskPolicy::Normal)
            .unwrap();
        let expected = std::env::current_dir().unwrap().join("disk.vdi");
        assert!(vbox.runner().has_medium(&expected));
    }

    #[test]
    fn attach_clears_port_before_setting_it() {
        let vbox = adapter(FakeVbox::new().with_vm("U1", "demo"));
        let vm = VmId::new("U1");
        vbox.attach_disk(&vm, ControllerPort::PrimarySlave, Some(Path::new("/d.vdi")))
            .unwrap();
        assert_eq!(
            vbox.runner().commands(),
            [
                "VBoxManage -nologo modifyvm U1 -hdb none",
                "VBoxManage -nologo modifyvm U1 -hdb /d.vdi",
            ]
        );
    }

    #[test]
    fn attach_over_occupied_port_succeeds() {
        let fake = FakeVbox::new()
            .with_vm("U1", "demo")
            .with_attached("U1", "-hda", "/home/u/.VirtualBox-demo/Machines/demo/Snapshots/diff.vdi");
        let vbox = adapter(fake);
        vbox.attach_disk(
            &VmId::new("U1"),
            ControllerPort::PrimaryMaster,
            Some(Path::new("/srv/images/demo/demo.vdi")),
        )
        .unwrap();
        assert_eq!(
            vbox.runner().attached("U1", "-hda").as_deref(),
            Some("/srv/images/demo/demo.vdi")
        );
    }

    #[test]
    fn attach_failure_reports_command() {
        let fake = FakeVbox::new()
            .with_vm("U1", "demo")
            .fail_on("-hda /srv/images/demo/demo.vdi");
        let vbox = adapter(fake);
        let err = vbox
            .attach_disk(
                &VmId::new("U1"),
                ControllerPort::PrimaryMaster,
                Some(Path::new("/srv/images/demo/demo.vdi")),
            )
            .unwrap_err();
        assert!(err.to_string().contains("modifyvm U1 -hda /srv/images/demo/demo.vdi"));
    }

    #[test]
    fn attach_none_only_clears() {
        let vbox = adapter(FakeVbox::new().with_vm("U1", "demo"));
        vbox.attach_disk(&VmId::new("U1"), ControllerPort::PrimaryMaster, None)
            .unwrap();
        assert_eq!(
            vbox.runner().commands(),
            ["VBoxManage -nologo modifyvm U1 -hda none"]
        );
    }

    #[test]
    fn modify_vm_issues_one_call_with_flags() {
        let vbox = adapter(FakeVbox::new().with_vm("U1", "demo"));
        let params: VmParameters = [("memory", "512"), ("ostype", "Linux26")].into_iter().collect();
        vbox.modify_vm(&VmId::new("U1"), &params).unwrap();
        assert_eq!(
            vbox.runner().commands(),
            ["VBoxManage -nologo modifyvm U1 -memory 512 -ostype Linux26"]
        );
    }

    #[test]
    fn modify_vm_failure_is_tool_error() {
        let vbox = adapter(FakeVbox::new().fail_on("-memory"));
        let params: VmParameters = [("memory", "huge")].into_iter().collect();
        let err = vbox.modify_vm(&VmId::new("U1"), &params).unwrap_err();
        assert!(matches!(err, SyncError::ToolInvocation { .. }));
        assert_eq!(vbox.runner().commands().len(), 1);
    }

    #[test]
    fn unrunnable_tool_is_tool_error() {
        let vbox = VBoxManage::new(
            runner::SystemRunner,
            "definitely-not-vboxmanage",
            "/tmp/vbox-home",
        );
        let err = vbox.list_vms().unwrap_err();
        assert!(err.to_string().contains("definitely-not-vboxmanage -nologo list vms"));
    }

    #[test]
    fn dump_vm_config_renders_section() {
        let fake = FakeVbox::new()
            .with_vm("U1", "demo")
            .with_vminfo("name=\"demo\"\nmemory=512\nbootmenu=\"disabled\"\n");
        let vbox = adapter(fake);
        assert_eq!(
            vbox.dump_vm_config("demo").unwrap(),
            "[vmparameters]\nmemory=512\nbiosbootmenu=\"disabled\"\n"
        );
    }

    #[test]
    fn start_invocation_targets_vm_by_name() {
        let vbox = adapter(FakeVbox::new());
        let inv = vbox.start_vm_invocation("demo");
        assert_eq!(inv.command_line(), "VBoxManage -nologo startvm demo");
        assert!(inv.env_value(HOME_ENV).is_some());
    }
}
