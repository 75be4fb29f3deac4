use crate::pcie::regs::{self, command_word};
use crate::{DaqError, Device, ErrorBits, Metrics, PcieDevice, PcieResult};
use crossbeam_channel::tick;
use log::{info, warn};
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsSample {
    pub epoch_seconds: i64,
    pub frame: u32,
    pub sample: u32,
    pub divisor: u32,
}

/// Read the frame/sample/divisor triple latched on the last PPS edge. A zero
/// frame means no edge has been latched yet.
pub fn read_pps(device: &dyn PcieDevice) -> PcieResult<Option<PpsSample>> {
    device.send_words(
        Device::Control,
        &[command_word(regs::TRIGGER_MODULE, 0, regs::MB_TRIG_READ_PPS, 0)],
    )?;
    let mut triple = [0u32; 3];
    let n = device.recv_words(Device::Control, &mut triple)?;
    let [frame, sample, divisor] = triple;
    if n < triple.len() || frame == 0 {
        return Ok(None);
    }
    Ok(Some(PpsSample {
        epoch_seconds: OffsetDateTime::now_utc().unix_timestamp(),
        frame,
        sample,
        divisor,
    }))
}

/// Spawn the PPS polling thread. It runs until `running` drops.
pub fn spawn_pps_sampler(
    device: Arc<dyn PcieDevice>,
    period: Duration,
    log_path: PathBuf,
    running: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
) -> Result<JoinHandle<()>, DaqError> {
    thread::Builder::new()
        .name("pps".into())
        .spawn(move || {
            let mut log = match File::create(&log_path) {
                Ok(file) => {
                    let mut w = csv::Writer::from_writer(file);
                    let _ = w.write_record(["epoch_seconds", "frame", "sample", "divisor"]);
                    Some(w)
                }
                Err(e) => {
                    warn!("Could not open PPS log {log_path:?}: {e}, reporting to console only");
                    None
                }
            };

            let ticker = tick(period);
            while running.load(Ordering::Acquire) {
                if ticker.recv().is_err() {
                    break;
                }
                if !running.load(Ordering::Acquire) {
                    break;
                }
                let sample = match read_pps(device.as_ref()) {
                    Ok(Some(sample)) => sample,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("PPS read failed: {e}");
                        metrics.raise_error(ErrorBits::HARDWARE_ACCESS);
                        continue;
                    }
                };
                Metrics::incr(&metrics.pps_samples);
                match log.as_mut() {
                    Some(w) => {
                        let row = [
                            sample.epoch_seconds.to_string(),
                            sample.frame.to_string(),
                            sample.sample.to_string(),
                            sample.divisor.to_string(),
                        ];
                        if let Err(e) = w
                            .write_record(&row)
                            .and_then(|_| w.flush().map_err(csv::Error::from))
                        {
                            warn!("PPS log write failed: {e}");
                        }
                    }
                    None => info!(
                        "PPS {} frame {} sample {} div {}",
                        sample.epoch_seconds, sample.frame, sample.sample, sample.divisor
                    ),
                }
            }
            info!("PPS sampler stopped");
        })
        .map_err(|source| DaqError::ThreadSpawn {
            name: "pps",
            source,
        })
}
