//! Per-collection progress display
//!
//! Draws an `indicatif` spinner on stderr while a collection streams. When
//! disabled the tracker only counts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

/// Progress tracker for one collection dump
pub struct ProgressTracker {
    documents: AtomicU64,
    start_time: Instant,
    bar: Option<ProgressBar>,
}

impl ProgressTracker {
    /// Create a tracker
    ///
    /// # Arguments
    /// * `label` - Namespace shown next to the spinner
    /// * `enable_bar` - Whether to draw the spinner
    pub fn new(label: &str, enable_bar: bool) -> Self {
        let bar = enable_bar.then(|| {
            let bar = ProgressBar::new_spinner();
            let style = ProgressStyle::with_template("{spinner:.green} {prefix} {pos} documents {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            bar.set_style(style);
            bar.set_prefix(label.to_string());
            bar
        });

        Self {
            documents: AtomicU64::new(0),
            start_time: Instant::now(),
            bar,
        }
    }

    /// A tracker that never draws.
    pub fn hidden() -> Self {
        Self::new("", false)
    }

    /// Record the running document count.
    pub fn update(&self, documents: u64) {
        self.documents.store(documents, Ordering::Relaxed);

        if let Some(ref bar) = self.bar {
            bar.set_position(documents);

            let elapsed = self.start_time.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                bar.set_message(format!("({:.0} docs/sec)", documents as f64 / elapsed));
            }
        }
    }

    pub fn documents(&self) -> u64 {
        self.documents.load(Ordering::Relaxed)
    }

    /// Clear the spinner.
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}
