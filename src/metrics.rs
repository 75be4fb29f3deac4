use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by the pipeline threads. Each field is updated on its own;
/// a snapshot is a best-effort view with no cross-field consistency.
#[derive(Debug, Default)]
pub struct Metrics {
    pub run_number: AtomicU64,
    pub subrun: AtomicU64,
    pub running: AtomicBool,
    pub events: AtomicU64,
    pub files: AtomicU64,
    pub dma_loops: AtomicU64,
    pub bytes_received: AtomicU64,
    pub chunks_written: AtomicU64,
    pub chunk_words: AtomicU64,
    pub overflows: AtomicU64,
    pub start_markers: AtomicU64,
    pub end_markers: AtomicU64,
    pub truncated_events: AtomicU64,
    pub oversized_events: AtomicU64,
    pub pps_samples: AtomicU64,
    pub software_triggers: AtomicU64,
    pub error_bits: AtomicU32,
}

impl Metrics {
    pub fn new(run_number: u64) -> Self {
        let metrics = Self::default();
        metrics.run_number.store(run_number, Ordering::Relaxed);
        metrics
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn raise_error(&self, bit: u32) {
        self.error_bits.fetch_or(bit, Ordering::Relaxed);
    }

    pub fn event_count(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    /// Zero every counter and start the next run number. The subrun set at
    /// configure time is kept.
    pub fn reset(&self, run_number: u64) {
        for counter in [
            &self.events,
            &self.files,
            &self.dma_loops,
            &self.bytes_received,
            &self.chunks_written,
            &self.chunk_words,
            &self.overflows,
            &self.start_markers,
            &self.end_markers,
            &self.truncated_events,
            &self.oversized_events,
            &self.pps_samples,
            &self.software_triggers,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.error_bits.store(0, Ordering::Relaxed);
        self.running.store(false, Ordering::Relaxed);
        self.run_number.store(run_number, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let chunks = load(&self.chunks_written);
        let chunk_words = load(&self.chunk_words);
        MetricsSnapshot {
            run_number: load(&self.run_number),
            subrun: load(&self.subrun),
            running: self.running.load(Ordering::Relaxed),
            events: load(&self.events),
            files: load(&self.files),
            dma_loops: load(&self.dma_loops),
            bytes_received: load(&self.bytes_received),
            megabytes_received: load(&self.bytes_received) as f64 / (1024.0 * 1024.0),
            avg_chunk_words: if chunks == 0 {
                0.0
            } else {
                chunk_words as f64 / chunks as f64
            },
            overflows: load(&self.overflows),
            start_markers: load(&self.start_markers),
            end_markers: load(&self.end_markers),
            truncated_events: load(&self.truncated_events),
            oversized_events: load(&self.oversized_events),
            pps_samples: load(&self.pps_samples),
            software_triggers: load(&self.software_triggers),
            error_bits: self.error_bits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub run_number: u64,
    pub subrun: u64,
    pub running: bool,
    pub events: u64,
    pub files: u64,
    pub dma_loops: u64,
    pub bytes_received: u64,
    pub megabytes_received: f64,
    pub avg_chunk_words: f64,
    pub overflows: u64,
    pub start_markers: u64,
    pub end_markers: u64,
    pub truncated_events: u64,
    pub oversized_events: u64,
    pub pps_samples: u64,
    pub software_triggers: u64,
    pub error_bits: u32,
}

impl MetricsSnapshot {
    /// The named counters published to the status collaborator.
    pub fn named(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("run_number", self.run_number as f64),
            ("subrun", self.subrun as f64),
            ("num_events", self.events as f64),
            ("num_files", self.files as f64),
            ("num_dma_loops", self.dma_loops as f64),
            ("megabytes_received", self.megabytes_received),
            ("avg_chunk_words", self.avg_chunk_words),
            ("overflows", self.overflows as f64),
            ("event_start_markers", self.start_markers as f64),
            ("event_end_markers", self.end_markers as f64),
        ]
    }
}

/// Tracks throughput with both all-time totals and a sliding window rate.
#[derive(Debug)]
pub struct RateCounter {
    pub total_size: u64,
    pub t_begin: Instant,
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    bytes_in_window: u64,
    last_total: u64,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self {
            total_size: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            samples: VecDeque::new(),
            bytes_in_window: 0,
            last_total: 0,
        }
    }
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ..Default::default()
        }
    }

    /// Long-term average rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_size as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Sliding-window rate in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Feed the running byte total from a snapshot.
    pub fn update_total(&mut self, total: u64) {
        let delta = total.saturating_sub(self.last_total);
        self.last_total = total;
        self.increment_at(Instant::now(), delta);
    }

    fn increment_at(&mut self, now: Instant, size: u64) {
        self.total_size += size;
        self.samples.push_back((now, size));
        self.bytes_in_window += size;

        while let Some(&(ts, sz)) = self.samples.front() {
            if now.duration_since(ts) > self.window {
                self.samples.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_size = 0;
        self.t_begin = Instant::now();
        self.samples.clear();
        self.bytes_in_window = 0;
        self.last_total = 0;
    }
}
