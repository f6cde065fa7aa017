//! Progress reporting for bounded runs.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Receives progress events. Calls are serialized under the run's
/// instrumentation lock, so implementations need no locking of their own.
pub trait ProgressSink: Send {
    /// Called once before any item runs, with the source's size.
    fn begin(&mut self, total: usize);

    /// Called once per completed item.
    fn advance(&mut self, index: usize);

    /// Called once when the run ends, however it ends.
    fn end(&mut self);
}

/// A terminal progress bar on stderr.
#[derive(Debug)]
pub struct IndicatifProgress {
    bar: ProgressBar,
    message: Option<String>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            message: None,
        }
    }

    /// Text shown to the right of the bar.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Position of the bar; useful to check a run from tests.
    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for IndicatifProgress {
    fn begin(&mut self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_style(
            ProgressStyle::default_bar()
                .template("  [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▓▒░  "),
        );
        if let Some(message) = &self.message {
            self.bar.set_message(message.clone());
        }
        self.bar.set_draw_target(ProgressDrawTarget::stderr());
    }

    fn advance(&mut self, _index: usize) {
        self.bar.inc(1);
    }

    fn end(&mut self) {
        self.bar.finish_and_clear();
    }
}
