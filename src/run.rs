use crate::{
    block_queue, configure_current_thread, run_writer, spawn_pps_sampler, AcquisitionLoop,
    AcquisitionSettings, AcquisitionSummary, Conf, DaqError, ErrorBits, EventWriter, Metrics,
    MetricsSnapshot, PcieDevice, RunContext, RunNumberStore, TriggerDriver, WriterConfig,
    WriterReport,
};
use log::{error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How a Run ended. `None` means the thread panicked.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_number: u64,
    pub acquisition: Option<Result<AcquisitionSummary, DaqError>>,
    pub writer: Option<WriterReport>,
}

struct ActiveRun {
    ctx: RunContext,
    reader: JoinHandle<Result<AcquisitionSummary, DaqError>>,
    writer: JoinHandle<WriterReport>,
    pps: Option<JoinHandle<()>>,
}

/// Owns the device and the Run lifecycle: configure, start, stop, reset.
/// The metrics are the only state shared outward.
pub struct Readout {
    device: Arc<dyn PcieDevice>,
    metrics: Arc<Metrics>,
    conf: Option<Conf>,
    run_number: u64,
    active: Option<ActiveRun>,
}

impl Readout {
    pub fn new(device: Arc<dyn PcieDevice>) -> Self {
        Self {
            device,
            metrics: Arc::new(Metrics::default()),
            conf: None,
            run_number: 0,
            active: None,
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn run_number(&self) -> u64 {
        self.run_number
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// True once the reader and writer threads have both exited, or when no
    /// Run is active.
    pub fn is_finished(&self) -> bool {
        self.active
            .as_ref()
            .map_or(true, |run| run.reader.is_finished() && run.writer.is_finished())
    }

    pub fn configure(&mut self, mut conf: Conf) -> Result<(), DaqError> {
        if self.active.is_some() {
            return Err(DaqError::AlreadyRunning);
        }
        let result = self.apply_conf(&mut conf);
        match result {
            Ok(run_number) => {
                let subrun = conf.run_settings.subrun;
                self.run_number = run_number;
                self.metrics.subrun.store(subrun, Ordering::Relaxed);
                self.metrics.reset(run_number);
                // The trigger module is re-armed at start, so a failed setup
                // here is flagged and the Run may still go ahead.
                let trigger = TriggerDriver::new(self.device.clone(), conf.trigger_settings.source);
                if let Err(e) = trigger.configure() {
                    warn!("{e}");
                    self.metrics.raise_error(e.error_bit());
                }
                self.conf = Some(conf);
                info!("Configured run {run_number} subrun {subrun}");
                Ok(())
            }
            Err(e) => {
                error!("Configure failed: {e}");
                self.metrics.raise_error(e.error_bit());
                Err(e)
            }
        }
    }

    fn apply_conf(&self, conf: &mut Conf) -> Result<u64, DaqError> {
        conf.validate()?;
        let dir = conf.output_dir();
        std::fs::create_dir_all(&dir).map_err(DaqError::file_io(&dir))?;

        let run_number = if conf.run_settings.persist_run_number {
            RunNumberStore::new(&dir).next()?
        } else {
            conf.run_settings.run_number
        };
        conf.run_settings.run_number = run_number;

        match conf.save_snapshot(run_number) {
            Ok(path) => info!("Saved run configuration to {path:?}"),
            Err(e) => warn!("Could not save run configuration: {e}"),
        }
        Ok(run_number)
    }

    pub fn set_running(&mut self, on: bool) -> Result<Option<RunOutcome>, DaqError> {
        if on {
            self.start()?;
            Ok(None)
        } else {
            Ok(self.finish(true))
        }
    }

    /// Zero the counters and take a new run number. Stops a Run still in flight.
    pub fn reset(&mut self, run_number: u64) -> Option<RunOutcome> {
        let outcome = self.finish(true);
        self.run_number = run_number;
        if let Some(conf) = self.conf.as_mut() {
            conf.run_settings.run_number = run_number;
        }
        self.metrics.reset(run_number);
        info!("Reset to run {run_number}");
        outcome
    }

    /// Block until the Run ends by itself.
    pub fn wait(&mut self) -> Option<RunOutcome> {
        self.finish(false)
    }

    fn start(&mut self) -> Result<(), DaqError> {
        if self.active.is_some() {
            return Err(DaqError::AlreadyRunning);
        }
        let conf = self.conf.as_ref().ok_or(DaqError::NotConfigured)?;
        let run_number = self.run_number;
        let threads = &conf.thread_settings;
        let priority = threads.realtime.then_some(threads.rt_priority);

        let settings = AcquisitionSettings::from_conf(conf);
        let (queue_tx, queue_rx) =
            block_queue(conf.dma_settings.queue_capacity, settings.block_words());
        let writer = EventWriter::new(WriterConfig::from_conf(conf, run_number), self.metrics.clone())?;

        let ctx = RunContext::new(self.metrics.clone());
        ctx.running.store(true, Ordering::Release);
        self.metrics.running.store(true, Ordering::Relaxed);

        let writer_core = threads.writer_core;
        let stop_write = ctx.stop_write.clone();
        let writer = thread::Builder::new()
            .name("writer".into())
            .spawn(move || {
                configure_current_thread("writer", writer_core, priority);
                run_writer(writer, queue_rx, &stop_write)
            })
            .map_err(|source| self.spawn_failed(&ctx, "writer", source))?;

        let reader_core = threads.reader_core;
        let acquisition = AcquisitionLoop::new(
            self.device.clone(),
            TriggerDriver::new(self.device.clone(), conf.trigger_settings.source),
            queue_tx,
            settings,
            ctx.clone(),
        );
        let reader_ctx = ctx.clone();
        let reader = match thread::Builder::new().name("reader".into()).spawn(move || {
            configure_current_thread("reader", reader_core, priority);
            let result = acquisition.run();
            // The remaining loops follow the acquisition down.
            reader_ctx.running.store(false, Ordering::Release);
            reader_ctx.metrics.running.store(false, Ordering::Relaxed);
            result
        }) {
            Ok(handle) => handle,
            Err(source) => {
                let e = self.spawn_failed(&ctx, "reader", source);
                ctx.stop_write.store(true, Ordering::Release);
                let _ = writer.join();
                return Err(e);
            }
        };

        let pps_settings = &conf.pps_settings;
        let pps = if pps_settings.enabled {
            match spawn_pps_sampler(
                self.device.clone(),
                Duration::from_millis(pps_settings.period_ms),
                conf.output_dir().join(&pps_settings.log_file),
                ctx.running.clone(),
                self.metrics.clone(),
            ) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("Running without PPS sampling: {e}");
                    self.metrics.raise_error(ErrorBits::THREAD);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Run {run_number} subrun {} started, target {} events",
            conf.run_settings.subrun, conf.run_settings.num_events
        );
        self.active = Some(ActiveRun {
            ctx,
            reader,
            writer,
            pps,
        });
        Ok(())
    }

    fn spawn_failed(&self, ctx: &RunContext, name: &'static str, source: std::io::Error) -> DaqError {
        ctx.running.store(false, Ordering::Release);
        self.metrics.running.store(false, Ordering::Relaxed);
        self.metrics.raise_error(ErrorBits::THREAD);
        DaqError::ThreadSpawn { name, source }
    }

    /// Join the Run's threads. With `cancel` the running flag is dropped
    /// first, otherwise this waits for the acquisition to end on its own.
    fn finish(&mut self, cancel: bool) -> Option<RunOutcome> {
        let run = self.active.take()?;
        if cancel {
            info!("Stopping run {}", self.run_number);
            run.ctx.running.store(false, Ordering::Release);
        }

        let acquisition = run.reader.join().ok();
        if acquisition.is_none() {
            error!("Reader thread panicked");
            self.metrics.raise_error(ErrorBits::THREAD);
            // Nothing else will release the writer.
            run.ctx.stop_write.store(true, Ordering::Release);
            run.ctx.running.store(false, Ordering::Release);
        }
        let writer = run.writer.join().ok();
        if writer.is_none() {
            error!("Writer thread panicked");
            self.metrics.raise_error(ErrorBits::THREAD);
        }
        if let Some(pps) = run.pps {
            if pps.join().is_err() {
                error!("PPS thread panicked");
                self.metrics.raise_error(ErrorBits::THREAD);
            }
        }
        self.metrics.running.store(false, Ordering::Relaxed);

        let snap = self.metrics.snapshot();
        info!(
            "Run {} ended: {} events, {} files, {:.2} MB, {} overflows",
            self.run_number, snap.events, snap.files, snap.megabytes_received, snap.overflows
        );
        Some(RunOutcome {
            run_number: self.run_number,
            acquisition,
            writer,
        })
    }
}

impl Drop for Readout {
    fn drop(&mut self) {
        self.finish(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_conf;
    use crate::{SimDevice, SimFaults};

    fn readout() -> Readout {
        Readout::new(Arc::new(SimDevice::new(11, 8)))
    }

    #[test]
    fn full_run_writes_files_and_side_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(dir.path());
        conf.run_settings.num_events = 20;
        conf.pps_settings.enabled = true;
        conf.pps_settings.period_ms = 5;
        conf.writer_settings.events_per_file = 8;

        let mut readout = readout();
        readout.configure(conf).unwrap();
        readout.set_running(true).unwrap();
        assert!(readout.is_running());
        let outcome = readout.wait().unwrap();

        assert_eq!(outcome.run_number, 3);
        assert!(outcome.acquisition.unwrap().is_ok());
        let report = outcome.writer.unwrap();
        assert!(report.events >= 20);
        assert!(report.files >= 3);
        assert!(dir.path().join("test_3_0.dat").exists());
        assert!(dir.path().join("test_3_2.dat").exists());
        assert!(dir.path().join("run_3.toml").exists());
        assert!(dir.path().join("pps_samples.csv").exists());

        let snap = readout.snapshot();
        assert!(!snap.running);
        assert_eq!(snap.events, report.events);
        assert!(readout.is_finished());
        assert!(!readout.is_running());
    }

    #[test]
    fn stop_cancels_a_long_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(dir.path());
        conf.run_settings.num_events = u64::MAX;
        conf.pps_settings.enabled = true;

        let mut readout = readout();
        readout.configure(conf).unwrap();
        readout.set_running(true).unwrap();
        thread::sleep(Duration::from_millis(50));
        let outcome = readout.set_running(false).unwrap().unwrap();

        let summary = outcome.acquisition.unwrap().unwrap();
        assert!(summary.cancelled);
        assert!(summary.transfers > 0);
        assert!(outcome.writer.unwrap().events > 0);
        assert!(readout.set_running(false).unwrap().is_none());
    }

    #[test]
    fn start_requires_configure() {
        let mut readout = readout();
        assert!(matches!(readout.set_running(true), Err(DaqError::NotConfigured)));
    }

    #[test]
    fn bad_config_raises_the_error_bit() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(dir.path());
        conf.dma_settings.queue_capacity = 0;
        let mut readout = readout();
        assert!(matches!(readout.configure(conf), Err(DaqError::Configuration(_))));
        assert_ne!(readout.snapshot().error_bits & ErrorBits::CONFIGURATION, 0);
        assert!(matches!(readout.set_running(true), Err(DaqError::NotConfigured)));
    }

    #[test]
    fn persisted_run_numbers_advance() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(dir.path());
        conf.run_settings.persist_run_number = true;
        let mut readout = readout();
        readout.configure(conf.clone()).unwrap();
        assert_eq!(readout.run_number(), 0);
        readout.configure(conf).unwrap();
        assert_eq!(readout.run_number(), 1);
        assert_eq!(readout.snapshot().run_number, 1);
    }

    #[test]
    fn reset_clears_counters_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut readout = readout();
        readout.configure(test_conf(dir.path())).unwrap();
        readout.set_running(true).unwrap();
        readout.wait().unwrap();
        assert!(readout.snapshot().events >= 2);

        assert!(readout.reset(4).is_none());
        let snap = readout.snapshot();
        assert_eq!(snap.events, 0);
        assert_eq!(snap.run_number, 4);

        readout.set_running(true).unwrap();
        readout.wait().unwrap();
        assert!(dir.path().join("test_4_0.dat").exists());
    }

    #[test]
    fn subrun_is_published_and_survives_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(dir.path());
        conf.run_settings.subrun = 2;
        let mut readout = readout();
        readout.configure(conf).unwrap();
        let snap = readout.snapshot();
        assert_eq!((snap.run_number, snap.subrun), (3, 2));

        readout.reset(8);
        let snap = readout.snapshot();
        assert_eq!((snap.run_number, snap.subrun), (8, 2));
        assert!(snap.named().contains(&("subrun", 2.0)));
    }

    #[test]
    fn trigger_setup_failure_is_flagged_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let faults = SimFaults {
            fail_commands: true,
            ..SimFaults::default()
        };
        let mut readout = Readout::new(Arc::new(SimDevice::with_faults(11, 8, faults)));
        readout.configure(test_conf(dir.path())).unwrap();
        let bits = readout.snapshot().error_bits;
        assert_ne!(bits & ErrorBits::HARDWARE_ACCESS, 0);
    }

    #[test]
    fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut conf = test_conf(dir.path());
        conf.run_settings.num_events = u64::MAX;
        let mut readout = readout();
        readout.configure(conf.clone()).unwrap();
        readout.set_running(true).unwrap();
        assert!(matches!(readout.set_running(true), Err(DaqError::AlreadyRunning)));
        assert!(matches!(readout.configure(conf), Err(DaqError::AlreadyRunning)));
        readout.set_running(false).unwrap();
    }
}
