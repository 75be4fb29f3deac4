use crate::PcieReturn;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Bits of the error word surfaced to the external monitor.
pub struct ErrorBits;

impl ErrorBits {
    pub const CONFIGURATION: u32 = 1 << 0;
    pub const HARDWARE_TIMEOUT: u32 = 1 << 1;
    pub const QUEUE_OVERFLOW: u32 = 1 << 2;
    pub const OVERSIZED_EVENT: u32 = 1 << 3;
    pub const FILE_IO: u32 = 1 << 4;
    pub const HARDWARE_ACCESS: u32 = 1 << 5;
    pub const THREAD: u32 = 1 << 6;
}

#[derive(Debug, Error)]
pub enum DaqError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("DMA transfer not complete after {timeout:?}, salvaged {salvaged_bytes} of {requested_bytes} bytes")]
    HardwareTimeout {
        timeout: Duration,
        requested_bytes: usize,
        salvaged_bytes: usize,
    },
    #[error("Hardware access failed during {op}: {status}")]
    HardwareAccess { op: &'static str, status: PcieReturn },
    #[error("Block queue full, block of {words} words dropped")]
    QueueOverflow { words: usize },
    #[error("Event exceeded the {capacity} word event buffer and was dropped")]
    OversizedEvent { capacity: usize },
    #[error("File I/O failed on {path:?}: {source}")]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Readout has not been configured")]
    NotConfigured,
    #[error("Readout is already running")]
    AlreadyRunning,
}

impl DaqError {
    pub fn hardware(op: &'static str) -> impl FnOnce(PcieReturn) -> DaqError {
        move |status| DaqError::HardwareAccess { op, status }
    }

    pub fn file_io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> DaqError {
        let path = path.into();
        move |source| DaqError::FileIo { path, source }
    }

    /// Only a DMA transfer that never completes ends the Run. Everything else
    /// is logged and the pipeline keeps going.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(self, DaqError::HardwareTimeout { .. })
    }

    pub fn error_bit(&self) -> u32 {
        match self {
            DaqError::Configuration(_) => ErrorBits::CONFIGURATION,
            DaqError::HardwareTimeout { .. } => ErrorBits::HARDWARE_TIMEOUT,
            DaqError::HardwareAccess { .. } => ErrorBits::HARDWARE_ACCESS,
            DaqError::QueueOverflow { .. } => ErrorBits::QUEUE_OVERFLOW,
            DaqError::OversizedEvent { .. } => ErrorBits::OVERSIZED_EVENT,
            DaqError::FileIo { .. } => ErrorBits::FILE_IO,
            DaqError::ThreadSpawn { .. } => ErrorBits::THREAD,
            DaqError::NotConfigured | DaqError::AlreadyRunning => ErrorBits::CONFIGURATION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_end_the_run() {
        let timeout = DaqError::HardwareTimeout {
            timeout: Duration::from_millis(10),
            requested_bytes: 400,
            salvaged_bytes: 40,
        };
        assert!(timeout.is_fatal_to_run());
        assert_eq!(timeout.error_bit(), ErrorBits::HARDWARE_TIMEOUT);

        let access = DaqError::hardware("write dma control")(PcieReturn::InvalidHandle);
        assert!(!access.is_fatal_to_run());
        assert_eq!(access.error_bit(), ErrorBits::HARDWARE_ACCESS);

        assert!(!DaqError::QueueOverflow { words: 10 }.is_fatal_to_run());
        assert!(!DaqError::OversizedEvent { capacity: 10 }.is_fatal_to_run());
        let io = DaqError::file_io("/nope")(std::io::Error::other("disk full"));
        assert!(!io.is_fatal_to_run());
        assert_eq!(io.error_bit(), ErrorBits::FILE_IO);
    }
}
