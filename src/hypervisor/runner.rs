//! External tool invocation.
//!
//! Every state change and query goes through a [`ToolRunner`], so the
//! adapter never touches `std::process` directly and tests can substitute
//! a scripted hypervisor.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// A fully described external command: program, arguments and the
/// per-command environment overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, PathBuf)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for this invocation only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<PathBuf>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn env_value(&self, key: &str) -> Option<&PathBuf> {
        self.envs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Space-joined command line for diagnostics.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Captured result of a finished invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// Short failure description: trimmed stderr, or the exit status.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.status {
            Some(code) => format!("exited with status {code}"),
            None => "terminated by signal".into(),
        }
    }
}

pub trait ToolRunner {
    /// Run to completion, capturing stdout and stderr.
    fn run(&self, invocation: &Invocation) -> std::io::Result<ToolOutput>;

    /// Run with stdout/stderr attached to the terminal (progress output).
    /// Returns the exit status.
    fn run_attached(&self, invocation: &Invocation) -> std::io::Result<Option<i32>> {
        self.run(invocation).map(|output| output.status)
    }
}

/// Runs invocations as real child processes, blocking until they exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> std::io::Result<ToolOutput> {
        tracing::debug!(command = %invocation.command_line(), "running");
        let output = invocation
            .to_command()
            .stdin(Stdio::null())
            .output()?;
        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_attached(&self, invocation: &Invocation) -> std::io::Result<Option<i32>> {
        tracing::debug!(command = %invocation.command_line(), "running attached");
        let status = invocation.to_command().stdin(Stdio::null()).status()?;
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_joins_program_and_args() {
        let inv = Invocation::new("VBoxManage")
            .args(["-nologo", "list", "vms"])
            .env("VBOX_USER_HOME", "/home/u/.VirtualBox-demo");
        assert_eq!(inv.command_line(), "VBoxManage -nologo list vms");
        assert_eq!(
            inv.env_value("VBOX_USER_HOME"),
            Some(&PathBuf::from("/home/u/.VirtualBox-demo"))
        );
    }

    #[test]
    fn failure_message_prefers_stderr() {
        assert_eq!(ToolOutput::failure(1, " boom \n").failure_message(), "boom");
        assert_eq!(
            ToolOutput::failure(2, "").failure_message(),
            "exited with status 2"
        );
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_passes_environment_per_command() {
        let inv = Invocation::new("sh")
            .args(["-c", "printf %s \"$VBOX_USER_HOME\""])
            .env("VBOX_USER_HOME", "/tmp/vbox-home");
        let output = SystemRunner.run(&inv).unwrap();
        assert!(output.is_success());
        assert_eq!(output.stdout, "/tmp/vbox-home");
        assert!(std::env::var_os("VBOX_USER_HOME").is_none_or(|v| v != "/tmp/vbox-home"));
    }

    #[test]
    fn system_runner_reports_missing_program() {
        let inv = Invocation::new("definitely-not-a-real-tool-vbox-sync");
        assert!(SystemRunner.run(&inv).is_err());
    }
}
