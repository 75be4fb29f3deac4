//! Producer side of the pipeline: arms the transceiver receivers, programs the
//! DMA engine for one buffer at a time, triggers, polls for completion and
//! pushes each finished block into the queue.

use crate::pcie::regs;
use crate::{
    Block, BlockWriter, Conf, DaqError, Device, DmaBuffers, DmaHandle, ErrorBits, Metrics,
    PcieDevice, PcieResult, SoftwareTrigger, TriggerDriver, TriggerSource, Word,
};
use log::{debug, error, info, warn};
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Status polls between checks of the running flag.
const CANCEL_CHECK_POLLS: u32 = 64;

/// Flags and counters shared by every thread of one Run.
#[derive(Clone, Default)]
pub struct RunContext {
    pub running: Arc<AtomicBool>,
    pub stop_write: Arc<AtomicBool>,
    pub metrics: Arc<Metrics>,
}

impl RunContext {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            stop_write: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    pub buffer_bytes: usize,
    pub dma_loops: usize,
    pub poll_timeout: Duration,
    pub settle: Duration,
    pub target_events: u64,
    pub software_rate_hz: f64,
    pub timestamp_log: Option<PathBuf>,
}

impl AcquisitionSettings {
    pub fn from_conf(conf: &Conf) -> Self {
        let dma = &conf.dma_settings;
        let trig = &conf.trigger_settings;
        Self {
            buffer_bytes: dma.buffer_bytes,
            dma_loops: dma.dma_loops,
            poll_timeout: Duration::from_millis(dma.poll_timeout_ms),
            settle: Duration::from_millis(dma.settle_ms),
            target_events: conf.run_settings.num_events,
            software_rate_hz: trig.software_rate_hz,
            timestamp_log: trig
                .log_timestamps
                .then(|| conf.output_dir().join(&trig.timestamp_file)),
        }
    }

    pub fn block_words(&self) -> usize {
        self.buffer_bytes / 4
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquisitionSummary {
    pub transfers: u64,
    pub bytes: u64,
    pub dropped_blocks: u64,
    /// Register and cache primitives that failed and were skipped.
    pub hardware_faults: u64,
    pub cancelled: bool,
}

enum Completion {
    Done,
    TimedOut,
    Cancelled,
}

/// Raises stop-write when dropped, so the writer drains and closes on every
/// exit path of the loop, including unwinding.
struct StopWriteGuard(Arc<AtomicBool>);

impl Drop for StopWriteGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct AcquisitionLoop {
    device: Arc<dyn PcieDevice>,
    trigger: TriggerDriver,
    queue: BlockWriter,
    settings: AcquisitionSettings,
    ctx: RunContext,
    block: Block,
    first_pass: bool,
    summary: AcquisitionSummary,
    hardware_faults: Cell<u64>,
}

impl AcquisitionLoop {
    pub fn new(
        device: Arc<dyn PcieDevice>,
        trigger: TriggerDriver,
        queue: BlockWriter,
        settings: AcquisitionSettings,
        ctx: RunContext,
    ) -> Self {
        let block = Block::with_capacity(queue.block_words());
        Self {
            device,
            trigger,
            queue,
            settings,
            ctx,
            block,
            first_pass: true,
            summary: AcquisitionSummary::default(),
            hardware_faults: Cell::new(0),
        }
    }

    /// Run until cancelled, the target event count is reached, or a DMA
    /// transfer times out. Stop-write is raised only after the last block is
    /// queued.
    pub fn run(mut self) -> Result<AcquisitionSummary, DaqError> {
        let stop_write = StopWriteGuard(self.ctx.stop_write.clone());
        let device = self.device.clone();
        let buffers = DmaBuffers::lock(device.as_ref(), self.settings.buffer_bytes)
            .map_err(DaqError::hardware("lock DMA buffers"))
            .inspect_err(|e| self.ctx.metrics.raise_error(e.error_bit()))?;
        info!(
            "Locked 2 DMA buffers of {} bytes, {} transfers per trigger",
            buffers.size_bytes(),
            self.settings.dma_loops + 1
        );

        self.prepare();
        let mut software = None;
        let result = self.software_trigger().and_then(|trigger| {
            software = trigger;
            self.acquire()
        });

        if let Some(mut trigger) = software.take() {
            trigger.stop();
        }
        self.checked("stop trigger", self.trigger.stop());
        drop(stop_write);
        drop(buffers);

        match &result {
            Ok(summary) => info!(
                "Acquisition finished: {} transfers, {} bytes, {} blocks dropped, {} hardware faults{}",
                summary.transfers,
                summary.bytes,
                summary.dropped_blocks,
                summary.hardware_faults,
                if summary.cancelled { " (cancelled)" } else { "" }
            ),
            Err(e) => {
                error!("Acquisition aborted: {e}");
                self.ctx.metrics.raise_error(e.error_bit());
            }
        }
        result
    }

    fn software_trigger(&self) -> Result<Option<SoftwareTrigger>, DaqError> {
        if self.trigger.source() != TriggerSource::Software {
            return Ok(None);
        }
        SoftwareTrigger::spawn(
            self.trigger.clone(),
            self.settings.software_rate_hz,
            self.ctx.running.clone(),
            self.ctx.metrics.clone(),
            self.settings.timestamp_log.clone(),
        )
        .map(Some)
    }

    /// A failed register or cache primitive is logged and flagged but does not
    /// stop the loop. A transfer that never completes is caught by the poll
    /// deadline instead.
    fn checked<T>(&self, op: &'static str, result: PcieResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(status) => {
                warn!("{}", DaqError::HardwareAccess { op, status });
                self.ctx.metrics.raise_error(ErrorBits::HARDWARE_ACCESS);
                self.hardware_faults.set(self.hardware_faults.get() + 1);
                None
            }
        }
    }

    fn write(&self, offset: u32, value: u32, op: &'static str) {
        self.checked(
            op,
            self.device.write_reg32(Device::Data, regs::CS_BAR, offset, value),
        );
    }

    /// Transmitter mode, clear any DMA left over from a previous run, and give
    /// the front end time to settle.
    fn prepare(&mut self) {
        self.write(regs::TX_MD_REG, regs::TX_MODE, "set transmitter mode");
        self.abort_dma();
        if !self.settings.settle.is_zero() {
            std::thread::sleep(self.settings.settle);
        }
    }

    fn abort_dma(&self) {
        self.write(regs::CS_DMA_MSI_ABORT, regs::DMA_ABORT, "abort DMA");
        self.write(regs::CS_DMA_MSI_ABORT, 0, "clear DMA abort");
    }

    fn acquire(&mut self) -> Result<AcquisitionSummary, DaqError> {
        while self.ctx.is_running()
            && self.ctx.metrics.event_count() < self.settings.target_events
        {
            for iteration in 0..=self.settings.dma_loops {
                if !self.transfer(iteration)? {
                    self.summary.cancelled = true;
                    return Ok(self.summary());
                }
            }
        }
        self.summary.cancelled = !self.ctx.is_running();
        Ok(self.summary())
    }

    fn summary(&self) -> AcquisitionSummary {
        AcquisitionSummary {
            hardware_faults: self.hardware_faults.get(),
            ..self.summary
        }
    }

    /// One DMA transfer into the buffer for `iteration`. Returns false if the
    /// run was cancelled while waiting for completion.
    fn transfer(&mut self, iteration: usize) -> Result<bool, DaqError> {
        let handle = DmaHandle::for_iteration(iteration);
        // Bounded below CS_INIT by config validation.
        let nbytes = self.settings.buffer_bytes as u32;

        self.checked("sync CPU cache", self.device.dma_sync_cpu(handle));

        for reg in regs::RECEIVER_REGS {
            if self.first_pass {
                self.write(reg, regs::CS_INIT, "init receiver");
            }
            self.write(reg, regs::CS_START + nbytes, "start receiver");
        }
        self.first_pass = false;

        let low = self
            .checked("buffer address", self.device.buffer_addr_lower(handle))
            .unwrap_or(0);
        let high = self
            .checked("buffer address", self.device.buffer_addr_upper(handle))
            .unwrap_or(0);
        self.write(regs::CS_DMA_ADD_LOW_REG, low, "DMA address");
        self.write(regs::CS_DMA_ADD_HIGH_REG, high, "DMA address");
        self.write(regs::CS_DMA_BY_CNT, nbytes, "DMA byte count");
        let record = if high == 0 {
            regs::DMA_3DW_REC
        } else {
            regs::DMA_4DW_REC
        };
        self.write(regs::CS_DMA_CNTRL, regs::DMA_TR12 + record, "start DMA");

        if iteration == 0 || self.trigger.source() == TriggerSource::Software {
            self.checked("start trigger", self.trigger.start());
        }

        match self.wait_for_completion() {
            Completion::Done => {
                self.checked("sync I/O cache", self.device.dma_sync_io(handle));
                self.push_from_buffer(handle, self.settings.block_words());
                Metrics::incr(&self.ctx.metrics.dma_loops);
                self.summary.transfers += 1;
                debug!("DMA {iteration} complete, {nbytes} bytes");
                Ok(true)
            }
            Completion::TimedOut => {
                warn!(
                    "DMA {iteration} not finished after {:?}, aborting",
                    self.settings.poll_timeout
                );
                let salvaged = self.salvage_and_abort(handle, nbytes as usize);
                self.ctx.metrics.raise_error(ErrorBits::HARDWARE_TIMEOUT);
                Err(DaqError::HardwareTimeout {
                    timeout: self.settings.poll_timeout,
                    requested_bytes: nbytes as usize,
                    salvaged_bytes: salvaged,
                })
            }
            Completion::Cancelled => {
                info!("Run cancelled during DMA {iteration}");
                self.salvage_and_abort(handle, nbytes as usize);
                Ok(false)
            }
        }
    }

    /// A status read that fails counts as still in progress, so only the
    /// deadline or cancellation ends the wait.
    fn wait_for_completion(&self) -> Completion {
        let deadline = Instant::now() + self.settings.poll_timeout;
        let mut polls: u32 = 0;
        let mut read_failed = false;
        loop {
            match self
                .device
                .read_reg32(Device::Data, regs::CS_BAR, regs::CS_DMA_CNTRL)
            {
                Ok(status) if status & regs::DMA_IN_PROGRESS == 0 => return Completion::Done,
                Ok(_) => {}
                Err(status) if !read_failed => {
                    read_failed = true;
                    self.checked::<()>("poll DMA status", Err(status));
                }
                Err(_) => {}
            }
            polls = polls.wrapping_add(1);
            if polls % CANCEL_CHECK_POLLS == 0 && !self.ctx.is_running() {
                return Completion::Cancelled;
            }
            if Instant::now() >= deadline {
                return Completion::TimedOut;
            }
            std::hint::spin_loop();
        }
    }

    /// Keep whatever landed before the transfer stalled, then abort the DMA.
    /// Returns the bytes the engine reported as transferred.
    fn salvage_and_abort(&mut self, handle: DmaHandle, requested: usize) -> usize {
        let salvaged = self.salvage(handle, requested);

        for (name, reg) in [("T1", regs::T1_CS_REG), ("T2", regs::T2_CS_REG)] {
            match self.device.read_reg32(Device::Data, regs::CS_BAR, reg) {
                Ok(status) => info!("{name} status 0x{status:08x}"),
                Err(e) => debug!("{name} status unreadable: {e}"),
            }
        }

        self.abort_dma();
        salvaged
    }

    fn salvage(&mut self, handle: DmaHandle, requested: usize) -> usize {
        let Some(byte_count) = self.checked(
            "read DMA byte count",
            self.device
                .read_reg64(Device::Data, regs::CS_BAR, regs::CS_DMA_BY_CNT),
        ) else {
            return 0;
        };
        let salvaged = partial_bytes(requested, byte_count);
        self.checked("sync I/O cache", self.device.dma_sync_io(handle));
        let words = salvaged / 4;
        info!("Received {salvaged} of {requested} bytes, keeping {words} words");
        if words > 0 {
            self.push_from_buffer(handle, words);
        }
        salvaged
    }

    fn push_from_buffer(&mut self, handle: DmaHandle, words: usize) {
        let words = words.min(self.block.capacity());
        let storage = &mut self.block.storage_mut()[..words];
        let read = self.device.read_dma_buffer(handle, storage);
        let Some(n) = self.checked("read DMA buffer", read) else {
            return;
        };
        self.block.set_len(n);
        let bytes = (n * std::mem::size_of::<Word>()) as u64;
        Metrics::add(&self.ctx.metrics.bytes_received, bytes);
        self.summary.bytes += bytes;

        if !self.queue.try_write(&mut self.block) {
            let metrics = &self.ctx.metrics;
            Metrics::incr(&metrics.overflows);
            metrics.raise_error(ErrorBits::QUEUE_OVERFLOW);
            self.summary.dropped_blocks += 1;
            if self.summary.dropped_blocks == 1 {
                warn!(
                    "Block queue full ({} blocks), dropping newest block",
                    self.queue.capacity()
                );
            } else {
                debug!("Dropped block of {n} words");
            }
        }
    }
}

/// Bytes that reached the buffer, from the byte count register after a
/// stall. The engine counts down the bytes still outstanding in the low 32
/// bits. The upper bits carry status and are ignored.
pub fn partial_bytes(requested: usize, byte_count: u64) -> usize {
    let remaining = byte_count & 0xFFFF_FFFF;
    (requested as u64).saturating_sub(remaining) as usize
}
