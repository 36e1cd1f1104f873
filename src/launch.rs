//! Hand the terminal over to the hypervisor.

use std::convert::Infallible;

use crate::error::SyncError;
use crate::hypervisor::VBoxManage;
use crate::hypervisor::runner::{Invocation, ToolRunner};
use crate::image::ImageDescriptor;

/// Start the reconciled VM in place of the current process.
///
/// Does not return on success. Anything that needs cleaning up must be
/// finished before calling this.
pub fn launch<R: ToolRunner>(
    vbox: &VBoxManage<R>,
    image: &ImageDescriptor,
) -> Result<Infallible, SyncError> {
    let invocation = vbox.start_vm_invocation(image.name());
    tracing::info!(vm = image.name(), command = %invocation.command_line(), "launching VM");
    replace_process(&invocation)
}

#[cfg(unix)]
fn replace_process(invocation: &Invocation) -> Result<Infallible, SyncError> {
    use std::os::unix::process::CommandExt;

    // exec only returns on failure
    let e = invocation.to_command().exec();
    Err(SyncError::ToolInvocation {
        command: invocation.command_line(),
        message: e.to_string(),
    })
}

/// Without exec, wait for the child and exit with its status.
#[cfg(not(unix))]
fn replace_process(invocation: &Invocation) -> Result<Infallible, SyncError> {
    let status = invocation
        .to_command()
        .status()
        .map_err(|e| SyncError::ToolInvocation {
            command: invocation.command_line(),
            message: e.to_string(),
        })?;
    std::process::exit(status.code().unwrap_or(1))
}
