//! Operator-facing progress output.
//!
//! The runner reports every phase transition and notable sub-event through a
//! [`ProgressSink`] as `(phase, message)` pairs. The CLI renders them on the
//! console; tests record them.

pub mod icons;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

use crate::errors::PhaseFailure;
use crate::phase::PipelinePhase;
use icons::{CHECK, CROSS, PAUSE, PHASE, REVIEW, SHIP, WARN};

/// Receives progress events from the pipeline.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, phase: PipelinePhase, message: &str);

    /// A non-fatal failure the run continues past.
    fn warn(&self, phase: PipelinePhase, message: &str) {
        self.emit(phase, &format!("warning: {}", message));
    }
}

/// Console renderer: one styled line per event plus a spinner showing the
/// latest message of the running phase.
pub struct ConsoleProgress {
    spinner: ProgressBar,
    verbose: bool,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        let progress = Self::plain(verbose);
        progress.spinner.enable_steady_tick(Duration::from_millis(120));
        progress
    }

    /// No background ticking, so terminal prompts are not redrawn over.
    pub fn plain(verbose: bool) -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        Self { spinner, verbose }
    }

    pub fn finish(&self) {
        self.spinner.finish_and_clear();
    }

    fn icon(phase: PipelinePhase) -> console::Emoji<'static, 'static> {
        match phase {
            PipelinePhase::Reviewing | PipelinePhase::SignOff => REVIEW,
            PipelinePhase::Deploying => SHIP,
            PipelinePhase::Complete => CHECK,
            _ => PHASE,
        }
    }

    /// Print a halt with its resume hint.
    pub fn print_halt(&self, failure: &PhaseFailure) {
        self.spinner.finish_and_clear();
        let location = match failure.epic {
            Some(epic) => format!("{} (epic {})", failure.phase, epic),
            None => failure.phase.to_string(),
        };
        eprintln!(
            "\n{}{} {}",
            CROSS,
            style(format!("Halted at {}:", location)).red().bold(),
            failure.message
        );
        eprintln!("{}{}", PAUSE, style(failure.resume_hint()).dim());
    }
}

impl ProgressSink for ConsoleProgress {
    fn emit(&self, phase: PipelinePhase, message: &str) {
        let tag = style(format!("[{}]", phase)).cyan().bold();
        self.spinner
            .println(format!("{}{} {}", Self::icon(phase), tag, message));
        if self.verbose {
            self.spinner.set_message(format!("{} {}", phase, message));
        } else {
            self.spinner.set_message(phase.to_string());
        }
    }

    fn warn(&self, phase: PipelinePhase, message: &str) {
        let tag = style(format!("[{}]", phase)).yellow().bold();
        self.spinner
            .println(format!("{}{} {}", WARN, tag, style(message).yellow()));
    }
}

impl Drop for ConsoleProgress {
    fn drop(&mut self) {
        self.spinner.finish_and_clear();
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn emit(&self, _phase: PipelinePhase, _message: &str) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<(PipelinePhase, String)>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(PipelinePhase, String)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Messages emitted for one phase, in order.
    pub fn messages_for(&self, phase: PipelinePhase) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|(p, _)| *p == phase)
            .map(|(_, m)| m)
            .collect()
    }
}

impl ProgressSink for RecordingProgress {
    fn emit(&self, phase: PipelinePhase, message: &str) {
        if let Ok(mut events) = self.events.lock() {
            events.push((phase, message.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_progress_keeps_order_and_prefixes_warnings() {
        let progress = RecordingProgress::new();
        progress.emit(PipelinePhase::Building, "story 1.1 passed");
        progress.warn(PipelinePhase::Scaffolding, "could not write README.md");
        progress.emit(PipelinePhase::Building, "all stories complete");

        assert_eq!(progress.events().len(), 3);
        assert_eq!(
            progress.messages_for(PipelinePhase::Building),
            vec!["story 1.1 passed", "all stories complete"]
        );
        assert_eq!(
            progress.messages_for(PipelinePhase::Scaffolding),
            vec!["warning: could not write README.md"]
        );
    }
}
