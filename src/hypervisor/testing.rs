//! Scripted stand-in for `VBoxManage` and the disk tools.
//!
//! Keeps a small model of the registry (VMs, media, port assignments) and
//! behaves like the real tool where it matters: registering a medium twice
//! fails, and setting an occupied port fails.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::runner::{Invocation, ToolOutput, ToolRunner};

#[derive(Default)]
struct State {
    vms: Vec<(String, String)>,
    media: Vec<PathBuf>,
    ports: BTreeMap<(String, String), String>,
    params: BTreeMap<String, Vec<(String, String)>>,
    invocations: Vec<Invocation>,
}

#[derive(Default)]
pub(crate) struct FakeVbox {
    state: RefCell<State>,
    fail_on: Option<String>,
    omit_created_uuid: bool,
    partial_convert: bool,
    vminfo: String,
}

impl FakeVbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vm(self, id: &str, name: &str) -> Self {
        self.state
            .borrow_mut()
            .vms
            .push((id.to_string(), name.to_string()));
        self
    }

    pub fn with_medium(self, path: impl Into<PathBuf>) -> Self {
        self.state.borrow_mut().media.push(path.into());
        self
    }

    pub fn with_attached(self, id: &str, flag: &str, disk: &str) -> Self {
        self.state
            .borrow_mut()
            .ports
            .insert((id.to_string(), flag.to_string()), disk.to_string());
        self
    }

    pub fn with_vminfo(mut self, text: &str) -> Self {
        self.vminfo = text.to_string();
        self
    }

    /// Fail every command whose command line contains `needle`.
    pub fn fail_on(mut self, needle: &str) -> Self {
        self.fail_on = Some(needle.to_string());
        self
    }

    pub fn without_created_uuid(mut self) -> Self {
        self.omit_created_uuid = true;
        self
    }

    /// Make `convertfromraw` leave a file behind before failing.
    pub fn with_partial_convert_failure(mut self) -> Self {
        self.partial_convert = true;
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.borrow().invocations.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state
            .borrow()
            .invocations
            .iter()
            .map(Invocation::command_line)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.borrow_mut().invocations.clear();
    }

    pub fn has_medium(&self, path: &Path) -> bool {
        self.state.borrow().media.iter().any(|m| m == path)
    }

    pub fn attached(&self, id: &str, flag: &str) -> Option<String> {
        self.state
            .borrow()
            .ports
            .get(&(id.to_string(), flag.to_string()))
            .cloned()
    }

    pub fn params(&self, id: &str) -> Vec<(String, String)> {
        self.state
            .borrow()
            .params
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    fn vboxmanage(&self, args: &[String]) -> ToolOutput {
        let args: Vec<&str> = args
            .iter()
            .map(String::as_str)
            .skip_while(|a| *a == "-nologo")
            .collect();
        let mut state = self.state.borrow_mut();

        match args.as_slice() {
            ["list", "vms"] => {
                let mut out = String::new();
                for (id, name) in &state.vms {
                    out.push_str(&format!("Name:            {name}\nUUID:            {id}\n\n"));
                }
                ToolOutput::success(out)
            }
            ["list", "hdds"] => {
                let mut out = String::new();
                for (i, path) in state.media.iter().enumerate() {
                    out.push_str(&format!(
                        "UUID:        m{i}\nLocation:    {}\n\n",
                        path.display()
                    ));
                }
                ToolOutput::success(out)
            }
            ["createvm", "-name", name, "-register"] => {
                let id = format!("U{}", state.vms.len() + 1);
                state.vms.push((id.clone(), name.to_string()));
                let mut out = format!("Virtual machine '{name}' is created and registered.\n");
                if !self.omit_created_uuid {
                    out.push_str(&format!("UUID: {id}\n"));
                }
                out.push_str(&format!("Settings file: '/fake/Machines/{name}/{name}.xml'\n"));
                ToolOutput::success(out)
            }
            ["openmedium", "disk", path, "-type", _] => {
                let path = PathBuf::from(path);
                if state.media.contains(&path) {
                    return ToolOutput::failure(1, "medium is already registered");
                }
                state.media.push(path);
                ToolOutput::success("")
            }
            ["modifyvm", id, rest @ ..] => {
                if !state.vms.iter().any(|(vm, name)| vm == id || name == id) {
                    return ToolOutput::failure(1, format!("could not find VM '{id}'"));
                }
                for pair in rest.chunks(2) {
                    let [flag, value] = pair else {
                        return ToolOutput::failure(1, "missing flag value");
                    };
                    if matches!(*flag, "-hda" | "-hdb" | "-hdc" | "-hdd") {
                        let key = (id.to_string(), flag.to_string());
                        if *value == "none" {
                            state.ports.remove(&key);
                        } else if state.ports.contains_key(&key) {
                            return ToolOutput::failure(1, "port is already occupied");
                        } else {
                            state.ports.insert(key, value.to_string());
                        }
                    } else {
                        state
                            .params
                            .entry(id.to_string())
                            .or_default()
                            .push((flag.to_string(), value.to_string()));
                    }
                }
                ToolOutput::success("")
            }
            ["showvminfo", _, "-machinereadable"] => ToolOutput::success(self.vminfo.clone()),
            ["convertfromraw", "-format", "VDI", raw, target] => {
                if !Path::new(raw).exists() {
                    return ToolOutput::failure(1, "raw image missing");
                }
                std::fs::write(target, b"<<< VDI image >>>").ok();
                ToolOutput::success("Converting from raw image file...\n")
            }
            ["startvm", _] => ToolOutput::success(""),
            _ => ToolOutput::failure(1, format!("unknown command: {}", args.join(" "))),
        }
    }
}

impl ToolRunner for FakeVbox {
    fn run(&self, invocation: &Invocation) -> std::io::Result<ToolOutput> {
        self.state.borrow_mut().invocations.push(invocation.clone());
        let command = invocation.command_line();
        let args = invocation.arg_strings();

        if let Some(needle) = &self.fail_on
            && command.contains(needle.as_str())
        {
            if self.partial_convert
                && let [.., "convertfromraw", _, _, _, target] =
                    args.iter().map(String::as_str).collect::<Vec<_>>().as_slice()
            {
                std::fs::write(target, b"partial").ok();
            }
            return Ok(ToolOutput::failure(1, "injected failure"));
        }

        if invocation.program() == "VBoxManage" {
            Ok(self.vboxmanage(&args))
        } else {
            Ok(ToolOutput::success(""))
        }
    }
}
