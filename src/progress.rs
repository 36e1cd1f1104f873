use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::error::SyncError;
use crate::reconcile::{ReconcileObserver, ReconcileState};

/// Controls how step output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners and checkmarks; tracing output is suppressed.
    Normal,
    /// Spinners plus the step detail under each completed step.
    Verbose,
    /// No ANSI, plain lines on stderr (for piped/non-TTY).
    Plain,
}

/// Numbered steps with spinners and checkmarks.
pub struct StepProgress {
    multi: MultiProgress,
    total_steps: usize,
    current_step: usize,
    mode: OutputMode,
    active: Option<ProgressBar>,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2713} {msg:.green}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2717} {msg:.red}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl StepProgress {
    pub fn new(total_steps: usize, mode: OutputMode) -> Self {
        let multi = if mode == OutputMode::Plain {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::stderr())
        };
        Self {
            multi,
            total_steps,
            current_step: 0,
            mode,
            active: None,
        }
    }

    fn prefix(&self) -> String {
        format!("{}/{}", self.current_step, self.total_steps)
    }

    /// Start the next numbered step and show a spinner for it.
    pub fn start(&mut self, label: &str) {
        self.current_step += 1;
        let prefix = self.prefix();

        if self.mode == OutputMode::Plain {
            eprintln!("[{prefix}] {label}");
            return;
        }

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(prefix);
        bar.set_message(label.to_string());
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        self.active = Some(bar);
    }

    /// Finish the current step with a checkmark.
    pub fn finish(&mut self, label: &str, detail: &str) {
        let prefix = self.prefix();
        if self.mode == OutputMode::Plain {
            eprintln!("[{prefix}] \u{2713} {label}");
            if !detail.is_empty() {
                eprintln!("      \u{2192} {detail}");
            }
            return;
        }

        if let Some(bar) = self.active.take() {
            bar.set_style(done_style());
            bar.finish_with_message(label.to_string());
        }
        if self.mode == OutputMode::Verbose && !detail.is_empty() {
            self.multi.println(format!("      \u{2192} {detail}")).ok();
        }
    }

    /// Mark the current step as failed.
    pub fn fail(&mut self, label: &str) {
        let prefix = self.prefix();
        if self.mode == OutputMode::Plain {
            eprintln!("[{prefix}] \u{2717} {label}");
            return;
        }
        if let Some(bar) = self.active.take() {
            bar.set_style(failed_style());
            bar.abandon_with_message(label.to_string());
        }
    }

    /// Print a plain line below the steps.
    pub fn println(&self, text: &str) {
        if self.mode == OutputMode::Plain {
            eprintln!("{text}");
        } else {
            self.multi.println(text).ok();
        }
    }
}

impl ReconcileObserver for StepProgress {
    fn on_step_started(&mut self, state: ReconcileState) {
        self.start(state.label());
    }

    fn on_step_finished(&mut self, state: ReconcileState, detail: &str) {
        self.finish(state.label(), detail);
    }

    fn on_step_failed(&mut self, state: ReconcileState, _error: &SyncError) {
        self.fail(state.label());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_numbered() {
        let mut progress = StepProgress::new(ReconcileState::STEPS.len(), OutputMode::Plain);
        progress.on_step_started(ReconcileState::HomeEnsured);
        assert_eq!(progress.prefix(), "1/7");
        progress.on_step_finished(ReconcileState::HomeEnsured, "created");
        progress.on_step_started(ReconcileState::SystemDiskChecked);
        assert_eq!(progress.prefix(), "2/7");
    }

    #[test]
    fn failed_step_releases_spinner() {
        let mut progress = StepProgress::new(7, OutputMode::Normal);
        progress.start("Checking system disk");
        assert!(progress.active.is_some());
        progress.fail("Checking system disk");
        assert!(progress.active.is_none());
    }
}
