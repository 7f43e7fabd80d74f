//! Shared progress context for one pull: terminal bars plus counters.
//!
//! Every worker reports through the same [`ProgressContext`]; the counters
//! sit behind one lock and are only read for the final summary.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use docker_pull_oci::digest::short_digest;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Counters accumulated over one pull or import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullStats {
    pub layers: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// Entries newly written to the cache.
    pub cache_stored: usize,
    /// Compressed bytes received from the network.
    pub bytes_downloaded: u64,
    /// Uncompressed bytes taken from the cache.
    pub bytes_from_cache: u64,
}

pub struct ProgressContext {
    multi: MultiProgress,
    style: ProgressStyle,
    stats: Mutex<PullStats>,
    started: Instant,
}

impl ProgressContext {
    /// `visible` draws bars on stderr; otherwise they are hidden and only
    /// the counters are kept.
    pub fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let style = ProgressStyle::with_template(
            "{prefix:.bold} {msg:<12} [{bar:30.cyan/blue}] {binary_bytes:>10}/{binary_total_bytes:<10} {binary_bytes_per_sec}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        Self {
            multi: MultiProgress::with_draw_target(target),
            style,
            stats: Mutex::new(PullStats::default()),
            started: Instant::now(),
        }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    /// A bar for one layer, labelled with its short digest.
    pub fn layer(&self, digest: &str, size: u64) -> LayerProgress {
        let bar = self
            .multi
            .add(ProgressBar::new(size).with_style(self.style.clone()));
        bar.set_prefix(short_digest(digest).to_string());
        bar.set_message("waiting");
        LayerProgress { bar }
    }

    /// Print a line above the bars without tearing them.
    pub fn println(&self, line: impl AsRef<str>) {
        if self.multi.is_hidden() {
            return;
        }
        let _ = self.multi.println(line);
    }

    pub fn record_layers(&self, count: usize) {
        self.lock().layers = count;
    }

    pub fn record_cache_hit(&self, bytes: u64) {
        let mut stats = self.lock();
        stats.cache_hits += 1;
        stats.bytes_from_cache += bytes;
    }

    pub fn record_cache_miss(&self) {
        self.lock().cache_misses += 1;
    }

    pub fn record_stored(&self) {
        self.lock().cache_stored += 1;
    }

    pub fn record_downloaded(&self, bytes: u64) {
        self.lock().bytes_downloaded += bytes;
    }

    pub fn stats(&self) -> PullStats {
        self.lock().clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn lock(&self) -> MutexGuard<'_, PullStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bar handle owned by one layer worker.
pub struct LayerProgress {
    bar: ProgressBar,
}

impl LayerProgress {
    pub fn set_stage(&self, stage: &'static str) {
        self.bar.set_message(stage);
    }

    /// Restart the bar for a download attempt of `total` bytes (0 if unknown).
    pub fn start_download(&self, total: u64) {
        if total > 0 {
            self.bar.set_length(total);
        }
        self.bar.set_position(0);
        self.bar.set_message("downloading");
    }

    pub fn inc(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    pub fn finish(&self, stage: &'static str) {
        self.bar.finish_with_message(stage);
    }

    pub fn abandon(&self, stage: &'static str) {
        self.bar.abandon_with_message(stage);
    }
}
