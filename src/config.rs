use crate::pcie::regs;
use crate::{DaqError, MarkerPattern, DEFAULT_END_MARKER, DEFAULT_START_MARKER};
use confique::Config;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Config, Serialize, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    #[config(nested)]
    pub trigger_settings: TriggerSettings,
    #[config(nested)]
    pub dma_settings: DmaSettings,
    #[config(nested)]
    pub writer_settings: WriterSettings,
    #[config(nested)]
    pub pps_settings: PpsSettings,
    #[config(nested)]
    pub thread_settings: ThreadSettings,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct RunSettings {
    #[config(default = 0)]
    pub run_number: u64,
    #[config(default = 0)]
    pub subrun: u64,
    pub num_events: u64,
    pub output_dir: String,
    #[config(default = "readout")]
    pub file_prefix: String,
    #[config(default = false)]
    pub persist_run_number: bool,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct TriggerSettings {
    #[config(default = "external")]
    pub source: TriggerSource,
    #[config(default = 10.0)]
    pub software_rate_hz: f64,
    #[config(default = false)]
    pub log_timestamps: bool,
    #[config(default = "trigger_timestamps.csv")]
    pub timestamp_file: String,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct DmaSettings {
    #[config(default = 100000)]
    pub buffer_bytes: usize,
    #[config(default = 400)]
    pub queue_capacity: usize,
    #[config(default = 1)]
    pub dma_loops: usize,
    #[config(default = 5000)]
    pub poll_timeout_ms: u64,
    #[config(default = 500)]
    pub settle_ms: u64,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct WriterSettings {
    #[config(default = 5000)]
    pub events_per_file: u64,
    #[config(default = 10)]
    pub chunk_events: u64,
    #[config(default = 1000000)]
    pub event_buffer_words: usize,
    /// Unset marker fields fall back to `DEFAULT_START_MARKER` and
    /// `DEFAULT_END_MARKER`. TOML accepts hex here, e.g. `0xE0000000`.
    pub start_marker_mask: Option<u32>,
    pub start_marker_value: Option<u32>,
    pub end_marker_mask: Option<u32>,
    pub end_marker_value: Option<u32>,
}

impl WriterSettings {
    pub fn start_marker(&self) -> MarkerPattern {
        MarkerPattern::new(
            self.start_marker_mask.unwrap_or(DEFAULT_START_MARKER.mask),
            self.start_marker_value.unwrap_or(DEFAULT_START_MARKER.value),
        )
    }

    pub fn end_marker(&self) -> MarkerPattern {
        MarkerPattern::new(
            self.end_marker_mask.unwrap_or(DEFAULT_END_MARKER.mask),
            self.end_marker_value.unwrap_or(DEFAULT_END_MARKER.value),
        )
    }
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct PpsSettings {
    #[config(default = true)]
    pub enabled: bool,
    #[config(default = 1000)]
    pub period_ms: u64,
    #[config(default = "pps_samples.csv")]
    pub log_file: String,
}

#[derive(Config, Serialize, Debug, Clone)]
pub struct ThreadSettings {
    pub reader_core: Option<usize>,
    pub writer_core: Option<usize>,
    #[config(default = true)]
    pub realtime: bool,
    #[config(default = 20)]
    pub rt_priority: i32,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    External,
    Software,
    Light,
}

impl Conf {
    pub fn from_file(path: &Path) -> Result<Self, confique::Error> {
        Conf::builder().env().file(path).load()
    }

    pub fn validate(&self) -> Result<(), DaqError> {
        let bad = |msg: &str| Err(DaqError::Configuration(msg.to_string()));

        if self.run_settings.num_events == 0 {
            return bad("run_settings.num_events must be non-zero");
        }
        if self.run_settings.output_dir.is_empty() {
            return bad("run_settings.output_dir must be set");
        }
        let dma = &self.dma_settings;
        if dma.buffer_bytes == 0 || dma.buffer_bytes % 4 != 0 {
            return bad("dma_settings.buffer_bytes must be a non-zero multiple of 4");
        }
        // The byte count shares the receiver control word with the command bits.
        if dma.buffer_bytes >= regs::CS_INIT as usize {
            return bad("dma_settings.buffer_bytes must be below 0x20000000");
        }
        if dma.queue_capacity == 0 {
            return bad("dma_settings.queue_capacity must be non-zero");
        }
        if dma.poll_timeout_ms == 0 {
            return bad("dma_settings.poll_timeout_ms must be non-zero");
        }
        let trig = &self.trigger_settings;
        if trig.source == TriggerSource::Software
            && !(trig.software_rate_hz.is_finite() && trig.software_rate_hz > 0.0)
        {
            return bad("trigger_settings.software_rate_hz must be positive for software triggers");
        }
        let w = &self.writer_settings;
        if w.events_per_file == 0 || w.chunk_events == 0 || w.event_buffer_words == 0 {
            return bad("writer_settings events_per_file, chunk_events and event_buffer_words must be non-zero");
        }
        let (start, end) = (w.start_marker(), w.end_marker());
        if start.mask == 0 || end.mask == 0 {
            return bad("writer_settings marker masks must be non-zero");
        }
        if start == end {
            return bad("writer_settings start and end markers must differ");
        }
        if self.pps_settings.enabled && self.pps_settings.period_ms == 0 {
            return bad("pps_settings.period_ms must be non-zero");
        }
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.run_settings.output_dir)
    }

    /// Record the effective configuration next to the data, as `run_<n>.toml`.
    pub fn save_snapshot(&self, run_number: u64) -> Result<PathBuf, DaqError> {
        let path = self.output_dir().join(format!("run_{run_number}.toml"));
        let text = toml::to_string_pretty(self).map_err(|e| {
            DaqError::file_io(&path)(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        std::fs::write(&path, text).map_err(DaqError::file_io(&path))?;
        Ok(path)
    }
}

/// Persistent run counter stored as plain text in the output directory.
pub struct RunNumberStore {
    path: PathBuf,
}

impl RunNumberStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("run_id.txt"),
        }
    }

    /// Read the previous run id, bump it and write it back.
    pub fn next(&self) -> Result<u64, DaqError> {
        let next = match std::fs::read_to_string(&self.path) {
            Ok(text) => match text.trim().parse::<u64>() {
                Ok(prev) => {
                    info!("Previous run id [{prev}]");
                    prev + 1
                }
                Err(_) => {
                    warn!("Unreadable run id in {:?}, starting at 0", self.path);
                    0
                }
            },
            Err(_) => 0,
        };
        std::fs::write(&self.path, format!("{next}\n")).map_err(DaqError::file_io(&self.path))?;
        info!("Current run id [{next}]");
        Ok(next)
    }
}

#[cfg(test)]
pub(crate) fn test_conf(output_dir: &Path) -> Conf {
    Conf {
        run_settings: RunSettings {
            run_number: 3,
            subrun: 0,
            num_events: 2,
            output_dir: output_dir.to_string_lossy().into_owned(),
            file_prefix: "test".to_string(),
            persist_run_number: false,
        },
        trigger_settings: TriggerSettings {
            source: TriggerSource::External,
            software_rate_hz: 100.0,
            log_timestamps: false,
            timestamp_file: "trigger_timestamps.csv".to_string(),
        },
        dma_settings: DmaSettings {
            buffer_bytes: 256,
            queue_capacity: 16,
            dma_loops: 1,
            poll_timeout_ms: 200,
            settle_ms: 0,
        },
        writer_settings: WriterSettings {
            events_per_file: 5000,
            chunk_events: 10,
            event_buffer_words: 4096,
            start_marker_mask: None,
            start_marker_value: None,
            end_marker_mask: Some(0xFFFF_0000),
            end_marker_value: Some(0xE000_0000),
        },
        pps_settings: PpsSettings {
            enabled: false,
            period_ms: 20,
            log_file: "pps_samples.csv".to_string(),
        },
        thread_settings: ThreadSettings {
            reader_core: None,
            writer_core: None,
            realtime: false,
            rt_priority: 20,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readout.toml");
        std::fs::write(
            &path,
            r#"
[run_settings]
num_events = 100
output_dir = "/data/readout"

[trigger_settings]
source = "software"
software_rate_hz = 5.0

[thread_settings]
reader_core = 2
"#,
        )
        .unwrap();

        let conf = Conf::from_file(&path).unwrap();
        assert_eq!(conf.run_settings.num_events, 100);
        assert_eq!(conf.trigger_settings.source, TriggerSource::Software);
        assert_eq!(conf.dma_settings.queue_capacity, 400);
        assert_eq!(conf.writer_settings.start_marker(), DEFAULT_START_MARKER);
        assert_eq!(
            conf.writer_settings.end_marker(),
            MarkerPattern::new(0xFFFF_0000, 0xE000_0000)
        );
        assert_eq!(conf.thread_settings.reader_core, Some(2));
        assert_eq!(conf.thread_settings.writer_core, None);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(dir.path());
        conf.dma_settings.buffer_bytes = 10;
        assert!(matches!(conf.validate(), Err(DaqError::Configuration(_))));

        let mut conf = test_conf(dir.path());
        conf.trigger_settings.source = TriggerSource::Software;
        conf.trigger_settings.software_rate_hz = 0.0;
        assert!(conf.validate().is_err());

        let mut conf = test_conf(dir.path());
        conf.writer_settings.end_marker_mask = Some(0xFFFF_FFFF);
        conf.writer_settings.end_marker_value = Some(0xFFFF_FFFF);
        assert!(conf.validate().is_err());

        let mut conf = test_conf(dir.path());
        conf.dma_settings.buffer_bytes = 0x2000_0000;
        assert!(conf.validate().is_err());
        conf.dma_settings.buffer_bytes = 0x1FFF_FFFC;
        assert!(conf.validate().is_ok());

        let mut conf = test_conf(dir.path());
        conf.run_settings.num_events = 0;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn marker_overrides_accept_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("readout.toml");
        std::fs::write(
            &path,
            r#"
[run_settings]
num_events = 1
output_dir = "/data/readout"

[writer_settings]
end_marker_mask = 0xF0000000
end_marker_value = 0xC0000000
"#,
        )
        .unwrap();

        let conf = Conf::from_file(&path).unwrap();
        let w = &conf.writer_settings;
        assert_eq!(w.start_marker(), DEFAULT_START_MARKER);
        assert_eq!(w.end_marker(), MarkerPattern::new(0xF000_0000, 0xC000_0000));
        assert_ne!(w.end_marker(), DEFAULT_END_MARKER);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn run_numbers_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunNumberStore::new(dir.path());
        assert_eq!(store.next().unwrap(), 0);
        assert_eq!(store.next().unwrap(), 1);
        std::fs::write(dir.path().join("run_id.txt"), "41\n").unwrap();
        assert_eq!(store.next().unwrap(), 42);
    }

    #[test]
    fn snapshot_written_as_toml() {
        let dir = tempfile::tempdir().unwrap();
        let conf = test_conf(dir.path());
        let path = conf.save_snapshot(9).unwrap();
        assert!(path.ends_with("run_9.toml"));
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("[writer_settings]"));
        assert!(text.contains("source = \"external\""));
    }
}
