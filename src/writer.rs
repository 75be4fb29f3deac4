use crate::{BlockReader, Conf, DaqError, ErrorBits, Metrics, Word};
use crossbeam_channel::{unbounded, Sender};
use log::{debug, error, info, warn};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A word matches when `word & mask == value & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerPattern {
    pub mask: Word,
    pub value: Word,
}

/// Every bit set.
pub const DEFAULT_START_MARKER: MarkerPattern = MarkerPattern::new(0xFFFF_FFFF, 0xFFFF_FFFF);
/// Top nibble `0xE`, event number in the low half.
pub const DEFAULT_END_MARKER: MarkerPattern = MarkerPattern::new(0xFFFF_0000, 0xE000_0000);

impl MarkerPattern {
    pub const fn new(mask: Word, value: Word) -> Self {
        Self { mask, value }
    }

    #[inline]
    pub fn matches(&self, word: Word) -> bool {
        word & self.mask == self.value & self.mask
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub start: MarkerPattern,
    pub end: MarkerPattern,
    pub event_buffer_words: usize,
    pub chunk_events: u64,
    pub events_per_file: u64,
    pub output_dir: PathBuf,
    pub prefix: String,
    pub run_number: u64,
}

impl WriterConfig {
    pub fn from_conf(conf: &Conf, run_number: u64) -> Self {
        let w = &conf.writer_settings;
        Self {
            start: w.start_marker(),
            end: w.end_marker(),
            event_buffer_words: w.event_buffer_words,
            chunk_events: w.chunk_events,
            events_per_file: w.events_per_file,
            output_dir: conf.output_dir(),
            prefix: conf.run_settings.file_prefix.clone(),
            run_number,
        }
    }

    pub fn file_path(&self, index: u64) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}_{}.dat", self.prefix, self.run_number, index))
    }
}

/// Final counts reported when the writer shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub events: u64,
    pub files: u64,
    pub chunks: u64,
    pub truncated_events: u64,
    pub oversized_events: u64,
}

/// Background thread that fsyncs and closes finished files so rotation does
/// not stall the framing loop.
struct FileCloser {
    tx: Option<Sender<(PathBuf, File)>>,
    handle: Option<JoinHandle<()>>,
}

impl FileCloser {
    fn spawn(metrics: Arc<Metrics>) -> Result<Self, DaqError> {
        let (tx, rx) = unbounded::<(PathBuf, File)>();
        let handle = thread::Builder::new()
            .name("file-closer".into())
            .spawn(move || {
                for (path, file) in rx {
                    if let Err(e) = file.sync_all() {
                        error!("fsync of {path:?} failed: {e}");
                        metrics.raise_error(ErrorBits::FILE_IO);
                    }
                    drop(file);
                    debug!("Closed {path:?}");
                }
            })
            .map_err(|source| DaqError::ThreadSpawn {
                name: "file-closer",
                source,
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn close(&self, path: PathBuf, file: File) {
        if let Some(tx) = &self.tx {
            // The receiver only goes away once the thread has exited; the file
            // is then dropped here, unsynced.
            if tx.send((path, file)).is_err() {
                warn!("File closer is gone, closing without fsync");
            }
        }
    }

    fn join(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("File closer thread panicked");
            }
        }
    }
}

impl Drop for FileCloser {
    fn drop(&mut self) {
        self.join();
    }
}

/// Reassembles marker-framed events from the block stream and writes them to
/// rotating `.dat` files in chunks of closed events.
pub struct EventWriter {
    cfg: WriterConfig,
    metrics: Arc<Metrics>,
    chunk: Vec<Word>,
    event_start: usize,
    in_progress: bool,
    resync: bool,
    chunk_events: u64,
    file_events: u64,
    file: Option<(PathBuf, File)>,
    next_index: u64,
    bytes: Vec<u8>,
    closer: FileCloser,
    report: WriterReport,
}

impl EventWriter {
    pub fn new(cfg: WriterConfig, metrics: Arc<Metrics>) -> Result<Self, DaqError> {
        std::fs::create_dir_all(&cfg.output_dir).map_err(DaqError::file_io(&cfg.output_dir))?;
        let closer = FileCloser::spawn(metrics.clone())?;
        Ok(Self {
            chunk: Vec::with_capacity(cfg.event_buffer_words),
            bytes: Vec::with_capacity(cfg.event_buffer_words * 4),
            cfg,
            metrics,
            event_start: 0,
            in_progress: false,
            resync: false,
            chunk_events: 0,
            file_events: 0,
            file: None,
            next_index: 0,
            closer,
            report: WriterReport::default(),
        })
    }

    pub fn report(&self) -> WriterReport {
        self.report
    }

    /// Feed one block worth of words through the framer.
    pub fn consume(&mut self, words: &[Word]) {
        for &word in words {
            self.push_word(word);
        }
    }

    fn push_word(&mut self, word: Word) {
        let is_start = self.cfg.start.matches(word);
        if is_start {
            self.resync = false;
            if self.in_progress {
                debug!("Start marker inside open event, dropping {} words", self.chunk.len() - self.event_start);
                self.chunk.truncate(self.event_start);
                self.report.truncated_events += 1;
                Metrics::incr(&self.metrics.truncated_events);
            }
            self.in_progress = true;
            self.event_start = self.chunk.len();
            Metrics::incr(&self.metrics.start_markers);
        } else if self.resync {
            return;
        }

        if self.chunk.len() >= self.cfg.event_buffer_words {
            self.make_room();
            if self.resync {
                return;
            }
        }
        self.chunk.push(word);

        if !is_start && self.in_progress && self.cfg.end.matches(word) {
            self.close_event();
        }
    }

    /// The accumulation buffer is full: write out what precedes the open
    /// event, and if the open event alone fills the buffer, drop it.
    fn make_room(&mut self) {
        let boundary = if self.in_progress {
            self.event_start
        } else {
            self.chunk.len()
        };
        if boundary > 0 {
            self.flush_words(boundary);
            return;
        }
        warn!(
            "Event exceeds {} word buffer, dropping it and resynchronizing",
            self.cfg.event_buffer_words
        );
        self.chunk.clear();
        self.event_start = 0;
        self.in_progress = false;
        self.resync = true;
        self.report.oversized_events += 1;
        Metrics::incr(&self.metrics.oversized_events);
        self.metrics.raise_error(ErrorBits::OVERSIZED_EVENT);
    }

    fn close_event(&mut self) {
        self.in_progress = false;
        self.chunk_events += 1;
        self.file_events += 1;
        self.report.events += 1;
        Metrics::incr(&self.metrics.end_markers);
        Metrics::incr(&self.metrics.events);

        if self.file_events >= self.cfg.events_per_file {
            self.flush_words(self.chunk.len());
            self.rotate();
        } else if self.chunk_events >= self.cfg.chunk_events {
            self.flush_words(self.chunk.len());
        }
    }

    /// Write the first `n` buffered words in a single call and shift the rest
    /// to the front.
    fn flush_words(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if self.file.is_none() {
            self.open_next_file();
        }

        self.bytes.clear();
        for word in &self.chunk[..n] {
            self.bytes.extend_from_slice(&word.to_le_bytes());
        }
        match self.file.as_mut() {
            Some((path, file)) => {
                if let Err(e) = file.write_all(&self.bytes) {
                    error!("Write of {n} words to {path:?} failed: {e}");
                    self.metrics.raise_error(ErrorBits::FILE_IO);
                }
            }
            None => warn!("No open file, {n} words lost"),
        }
        self.report.chunks += 1;
        Metrics::incr(&self.metrics.chunks_written);
        Metrics::add(&self.metrics.chunk_words, n as u64);

        self.chunk.drain(..n);
        self.event_start = self.event_start.saturating_sub(n);
        self.chunk_events = 0;
    }

    fn open_next_file(&mut self) {
        let path = self.cfg.file_path(self.next_index);
        match File::create(&path) {
            Ok(file) => {
                info!("Opened {path:?}");
                self.next_index += 1;
                self.report.files += 1;
                Metrics::incr(&self.metrics.files);
                self.file = Some((path, file));
            }
            Err(e) => {
                error!("Could not open {path:?}: {e}");
                self.metrics.raise_error(ErrorBits::FILE_IO);
            }
        }
    }

    fn rotate(&mut self) {
        if let Some((path, file)) = self.file.take() {
            info!("Rotating after {} events: {path:?}", self.file_events);
            self.closer.close(path, file);
        }
        self.file_events = 0;
    }

    /// Write whatever is buffered, including an unterminated event, then
    /// fsync and close the last file.
    pub fn finish(mut self) -> WriterReport {
        let pending = self.chunk.len();
        self.flush_words(pending);
        if let Some((path, file)) = self.file.take() {
            if let Err(e) = file.sync_all() {
                error!("fsync of {path:?} failed: {e}");
                self.metrics.raise_error(ErrorBits::FILE_IO);
            }
        }
        self.closer.join();
        let r = self.report;
        info!(
            "Writer done: {} events in {} files, {} chunks, {} truncated, {} oversized",
            r.events, r.files, r.chunks, r.truncated_events, r.oversized_events
        );
        r
    }
}

/// Consumer loop. Spins on the queue until `stop_write` is raised and the
/// queue has drained, then finishes the writer.
pub fn run_writer(
    mut writer: EventWriter,
    mut reader: BlockReader,
    stop_write: &AtomicBool,
) -> WriterReport {
    let mut block = reader.new_block();
    loop {
        if reader.try_read(&mut block) {
            writer.consume(block.as_words());
            continue;
        }
        if stop_write.load(Ordering::Acquire) && reader.is_empty() {
            break;
        }
        std::hint::spin_loop();
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_queue;
    use crate::sim::{EVENT_END, EVENT_START};

    fn cfg(dir: &std::path::Path, buffer: usize, chunk: u64, per_file: u64) -> WriterConfig {
        WriterConfig {
            start: MarkerPattern::new(0xFFFF_FFFF, EVENT_START),
            end: MarkerPattern::new(0xFFFF_0000, EVENT_END),
            event_buffer_words: buffer,
            chunk_events: chunk,
            events_per_file: per_file,
            output_dir: dir.to_path_buf(),
            prefix: "t".into(),
            run_number: 4,
        }
    }

    fn read_words(path: PathBuf) -> Vec<Word> {
        std::fs::read(path)
            .unwrap()
            .chunks_exact(4)
            .map(|b| Word::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    #[test]
    fn marker_uses_mask() {
        let end = MarkerPattern::new(0xFFFF_0000, 0xE000_0000);
        assert!(end.matches(0xE000_1234));
        assert!(!end.matches(0xE001_0000));
    }

    #[test]
    fn two_events_through_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new(4));
        let writer = EventWriter::new(cfg(dir.path(), 64, 10, 5000), metrics.clone()).unwrap();
        let (mut tx, rx) = block_queue(4, 8);
        let stream = [EVENT_START, 1, EVENT_END, EVENT_START, 2, 3, EVENT_END | 1];

        let mut block = crate::Block::with_capacity(8);
        block.fill_from(&stream);
        assert!(tx.try_write(&mut block));
        let stop = AtomicBool::new(true);
        let report = run_writer(writer, rx, &stop);

        assert_eq!(report.events, 2);
        assert_eq!(report.files, 1);
        let snap = metrics.snapshot();
        assert_eq!(snap.end_markers, 2);
        assert_eq!(snap.start_markers, 2);
        assert_eq!(read_words(dir.path().join("t_4_0.dat")), stream);
    }

    #[test]
    fn start_inside_open_event_drops_it() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new(4));
        let mut writer = EventWriter::new(cfg(dir.path(), 64, 10, 5000), metrics.clone()).unwrap();
        writer.consume(&[EVENT_START, 1, 2, EVENT_START, 3, EVENT_END, EVENT_START, 4, EVENT_END]);
        let report = writer.finish();

        assert_eq!(report.events, 2);
        assert_eq!(report.truncated_events, 1);
        assert_eq!(
            read_words(dir.path().join("t_4_0.dat")),
            [EVENT_START, 3, EVENT_END, EVENT_START, 4, EVENT_END]
        );
    }

    #[test]
    fn rotates_without_losing_words() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new(4));
        let mut writer = EventWriter::new(cfg(dir.path(), 64, 10, 2), metrics.clone()).unwrap();
        let event = |n: Word| [EVENT_START, n, EVENT_END | n];
        let stream: Vec<Word> = (0..5).flat_map(event).collect();
        // Split mid-event to cross block boundaries.
        writer.consume(&stream[..4]);
        writer.consume(&stream[4..]);
        let report = writer.finish();

        assert_eq!(report.events, 5);
        assert_eq!(report.files, 3);
        assert_eq!(metrics.snapshot().files, 3);
        let mut all = Vec::new();
        for i in 0..3 {
            all.extend(read_words(dir.path().join(format!("t_4_{i}.dat"))));
        }
        assert_eq!(read_words(dir.path().join("t_4_0.dat")).len(), 6);
        assert_eq!(all, stream);
        assert!(!dir.path().join("t_4_3.dat").exists());
    }

    #[test]
    fn chunks_flush_every_k_events() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new(4));
        let mut writer = EventWriter::new(cfg(dir.path(), 64, 2, 5000), metrics.clone()).unwrap();
        writer.consume(&[EVENT_START, 1, EVENT_END, EVENT_START, 2, EVENT_END, EVENT_START, 3]);
        assert_eq!(metrics.snapshot().avg_chunk_words, 6.0);
        let report = writer.finish();
        assert_eq!(report.chunks, 2);
    }

    #[test]
    fn oversized_event_is_dropped_and_framing_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new(4));
        let mut writer = EventWriter::new(cfg(dir.path(), 4, 10, 5000), metrics.clone()).unwrap();
        writer.consume(&[EVENT_START, 1, EVENT_END]);
        writer.consume(&[EVENT_START, 9, 9, 9, 9, 9, EVENT_END]);
        writer.consume(&[EVENT_START, 2, EVENT_END]);
        let report = writer.finish();

        assert_eq!(report.oversized_events, 1);
        assert_eq!(report.events, 2);
        assert_ne!(metrics.snapshot().error_bits & ErrorBits::OVERSIZED_EVENT, 0);
        assert_eq!(
            read_words(dir.path().join("t_4_0.dat")),
            [EVENT_START, 1, EVENT_END, EVENT_START, 2, EVENT_END]
        );
    }

    #[test]
    fn unopenable_file_flags_io_error_and_keeps_counting() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("t_4_0.dat");
        std::fs::create_dir(&blocker).unwrap();
        let metrics = Arc::new(Metrics::new(4));
        let mut writer = EventWriter::new(cfg(dir.path(), 64, 1, 5000), metrics.clone()).unwrap();

        writer.consume(&[EVENT_START, 1, EVENT_END, EVENT_START, 2, EVENT_END]);
        let snap = metrics.snapshot();
        assert_eq!(snap.events, 2);
        assert_eq!(snap.files, 0);
        assert_ne!(snap.error_bits & ErrorBits::FILE_IO, 0);

        // The same index is retried once the path is usable.
        std::fs::remove_dir(&blocker).unwrap();
        writer.consume(&[EVENT_START, 3, EVENT_END | 3]);
        let report = writer.finish();

        assert_eq!(report.events, 3);
        assert_eq!(report.files, 1);
        assert_eq!(read_words(blocker), [EVENT_START, 3, EVENT_END | 3]);
        assert!(!dir.path().join("t_4_1.dat").exists());
    }
}
