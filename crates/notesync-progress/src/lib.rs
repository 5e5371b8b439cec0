//! Progress reporting with TTY detection.
//!
//! This crate provides progress bar functionality for the CLI that
//! automatically detects whether stdout is a TTY and falls back to
//! non-interactive line-by-line output when not.

use std::time::Instant;

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Progress reporter for a run over a fixed number of steps (e.g. one step
/// per destination in a backup run, or per config in a scheduler tick).
/// Shows a progress bar in TTY mode and falls back to plain lines otherwise.
pub struct ProgressReporter {
    is_tty: bool,
    total_steps: usize,
    current_step: usize,
    current_label: String,
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
}

impl ProgressReporter {
    /// Creates a new progress reporter for `total_steps` units of work.
    pub fn new(total_steps: usize) -> Self {
        let is_tty = is_tty();
        let progress_bar = if is_tty {
            let pb = ProgressBar::new(total_steps as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            total_steps,
            current_step: 0,
            current_label: String::new(),
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// Creates a silent progress reporter that always uses non-TTY mode,
    /// regardless of the actual terminal.
    #[allow(dead_code)]
    pub fn silent(total_steps: usize) -> Self {
        Self {
            is_tty: false,
            total_steps,
            current_step: 0,
            current_label: String::new(),
            progress_bar: None,
            start_time: Instant::now(),
        }
    }

    /// Marks the start of step `index` (1-indexed) labeled `label` (e.g. a
    /// destination name or config id).
    pub fn set_step(&mut self, index: usize, label: &str) {
        self.current_step = index;
        self.current_label = label.to_string();

        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!(
                    "[{}/{}] {}... ({elapsed:?})",
                    self.current_step, self.total_steps, self.current_label
                );
                pb.set_message(msg);
                pb.set_position((self.current_step - 1) as u64);
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!(
                "[{}/{}] {}... ({elapsed:?})",
                self.current_step, self.total_steps, self.current_label
            );
        }
    }

    /// Marks the current step as completed.
    #[allow(clippy::collapsible_if)]
    #[allow(dead_code)]
    pub fn finish_step(&mut self) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                pb.inc(1);
            }
        }
    }

    /// Sets a status message (e.g. "waiting for destination...").
    #[allow(dead_code)]
    pub fn set_status(&self, status: &str) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let current = pb.position();
                let msg = format!("[{}/{}] {}", current + 1, self.total_steps, status);
                pb.set_message(msg);
            }
        } else {
            eprintln!("[status] {}", status);
        }
    }

    /// Finishes progress reporting, printing a summary line.
    pub fn finish(self) {
        if self.is_tty {
            if let Some(pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!("Completed {} steps in {:?}", self.total_steps, elapsed);
                pb.set_message(msg);
                pb.finish();
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!(
                "Completed {}/{} steps in {:?}",
                self.total_steps, self.total_steps, elapsed
            );
        }
    }
}
