use crate::pcie::regs::{self, command_word};
use crate::{DaqError, Device, ErrorBits, Metrics, PcieDevice, PcieResult, TriggerSource};
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Issues run-enable and trigger commands to the controller and trigger
/// modules. Every command is a plain backplane write, so repeating one is harmless.
#[derive(Clone)]
pub struct TriggerDriver {
    device: Arc<dyn PcieDevice>,
    source: TriggerSource,
}

impl TriggerDriver {
    pub fn new(device: Arc<dyn PcieDevice>, source: TriggerSource) -> Self {
        Self { device, source }
    }

    pub fn source(&self) -> TriggerSource {
        self.source
    }

    fn send(&self, word: u32) -> PcieResult<()> {
        self.device.send_words(Device::Control, &[word])
    }

    /// Select which inputs the trigger module accepts.
    pub fn configure(&self) -> Result<(), DaqError> {
        let trig = |cmd, data| command_word(regs::TRIGGER_MODULE, 0, cmd, data);
        let words = match self.source {
            TriggerSource::External => vec![
                trig(regs::MB_TRIG_MASK8, 0x2),
                trig(regs::MB_TRIG_PRESCALE8, 0x0),
            ],
            TriggerSource::Light => vec![
                trig(regs::MB_TRIG_MASK1, 0x8),
                trig(regs::MB_TRIG_PRESCALE1, 0x0),
                trig(regs::MB_TRIG_MASK8, 0x0),
                trig(regs::MB_TRIG_PRESCALE8, 0x0),
            ],
            TriggerSource::Software => vec![
                trig(regs::MB_TRIG_MASK1, 0x0),
                trig(regs::MB_TRIG_MASK8, 0x0),
            ],
        };
        self.device
            .send_words(Device::Control, &words)
            .map_err(DaqError::hardware("configure trigger module"))?;
        info!("Trigger source set to {:?}", self.source);
        Ok(())
    }

    pub fn start(&self) -> PcieResult<()> {
        self.send(command_word(
            regs::CONTROLLER_MODULE,
            regs::CONTROLLER_CHIP,
            regs::MB_CNTRL_SET_RUN_ON,
            0,
        ))
    }

    pub fn stop(&self) -> PcieResult<()> {
        self.send(command_word(
            regs::CONTROLLER_MODULE,
            regs::CONTROLLER_CHIP,
            regs::MB_CNTRL_SET_RUN_OFF,
            0,
        ))
    }

    pub fn pulse(&self) -> PcieResult<()> {
        self.send(command_word(
            regs::CONTROLLER_MODULE,
            regs::CONTROLLER_CHIP,
            regs::MB_CNTRL_SET_TRIG1,
            0,
        ))
    }

    /// Frame, sample and fractional sample of the latest trigger, if the module answered.
    pub fn read_trigger_time(&self) -> PcieResult<Option<[u32; 3]>> {
        self.send(command_word(regs::TRIGGER_MODULE, 0, regs::MB_TRIG_READ_TIME, 0))?;
        let mut triple = [0u32; 3];
        let n = self.device.recv_words(Device::Control, &mut triple)?;
        Ok((n == triple.len()).then_some(triple))
    }
}

/// Periodic software trigger running on its own thread.
pub struct SoftwareTrigger {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SoftwareTrigger {
    pub fn spawn(
        driver: TriggerDriver,
        rate_hz: f64,
        running: Arc<AtomicBool>,
        metrics: Arc<Metrics>,
        timestamp_log: Option<PathBuf>,
    ) -> Result<Self, DaqError> {
        let period = Duration::from_secs_f64(1.0 / rate_hz);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("sw-trigger".into())
            .spawn(move || {
                let mut log = timestamp_log.and_then(|path| match csv::Writer::from_path(&path) {
                    Ok(mut w) => {
                        let _ = w.write_record(["counter", "frame", "sample", "fraction"]);
                        Some(w)
                    }
                    Err(e) => {
                        warn!("Could not open trigger timestamp log {path:?}: {e}, console only");
                        None
                    }
                });

                info!("Software trigger running every {period:?}");
                let ticker = tick(period);
                let mut counter: u64 = 0;
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {}
                    }
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = driver.pulse() {
                        warn!("Software trigger pulse failed: {e}");
                        metrics.raise_error(ErrorBits::HARDWARE_ACCESS);
                        continue;
                    }
                    counter += 1;
                    Metrics::incr(&metrics.software_triggers);

                    if let Some(writer) = log.as_mut() {
                        match driver.read_trigger_time() {
                            Ok(Some([frame, sample, fraction])) => {
                                let row = [
                                    counter.to_string(),
                                    frame.to_string(),
                                    sample.to_string(),
                                    fraction.to_string(),
                                ];
                                if let Err(e) = writer
                                    .write_record(&row)
                                    .and_then(|_| writer.flush().map_err(csv::Error::from))
                                {
                                    warn!("Trigger timestamp write failed: {e}");
                                }
                            }
                            Ok(None) => debug!("No trigger time for pulse {counter}"),
                            Err(e) => warn!("Trigger time read failed: {e}"),
                        }
                    }
                }
                info!("Software trigger stopped after {counter} pulses");
            })
            .map_err(|source| DaqError::ThreadSpawn {
                name: "sw-trigger",
                source,
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop pulsing and wait for the thread to exit.
    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Software trigger thread panicked");
            }
        }
    }
}

impl Drop for SoftwareTrigger {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimDevice;

    fn driver(source: TriggerSource) -> (Arc<SimDevice>, TriggerDriver) {
        let sim = Arc::new(SimDevice::new(0, 8));
        let driver = TriggerDriver::new(sim.clone(), source);
        (sim, driver)
    }

    #[test]
    fn start_and_stop_are_run_enable_writes() {
        let (sim, driver) = driver(TriggerSource::External);
        driver.start().unwrap();
        driver.start().unwrap();
        driver.stop().unwrap();
        let cmds = sim.commands();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0] & 0xff, regs::MB_CNTRL_SET_RUN_ON);
        assert_eq!(cmds[0], cmds[1]);
        assert_eq!(cmds[2] & 0xff, regs::MB_CNTRL_SET_RUN_OFF);
    }

    #[test]
    fn light_source_enables_mask1() {
        let (sim, driver) = driver(TriggerSource::Light);
        driver.configure().unwrap();
        let cmds = sim.commands();
        assert_eq!(cmds[0], command_word(regs::TRIGGER_MODULE, 0, regs::MB_TRIG_MASK1, 0x8));
    }

    #[test]
    fn software_trigger_pulses_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("trig.csv");
        let (sim, driver) = driver(TriggerSource::Software);
        let running = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(Metrics::new(0));

        let mut trigger = SoftwareTrigger::spawn(
            driver,
            200.0,
            running.clone(),
            metrics.clone(),
            Some(log_path.clone()),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        trigger.stop();

        let pulses = metrics.software_triggers.load(Ordering::Relaxed);
        assert!(pulses > 0);
        let pulse_cmds = sim
            .commands()
            .iter()
            .filter(|&&w| (w >> 11) & 0x1f == regs::CONTROLLER_MODULE && w & 0xff == regs::MB_CNTRL_SET_TRIG1)
            .count() as u64;
        assert_eq!(pulse_cmds, pulses);

        let text = std::fs::read_to_string(log_path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("counter,frame,sample,fraction"));
        assert_eq!(lines.next(), Some("1,1,3,5"));
    }

    #[test]
    fn software_trigger_exits_on_cancellation() {
        let (_sim, driver) = driver(TriggerSource::Software);
        let running = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(Metrics::new(0));
        let mut trigger =
            SoftwareTrigger::spawn(driver, 100.0, running.clone(), metrics, None).unwrap();
        running.store(false, Ordering::Release);
        thread::sleep(Duration::from_millis(60));
        assert!(trigger.handle.as_ref().is_some_and(|h| h.is_finished()));
        trigger.stop();
    }
}
