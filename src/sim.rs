//! In-memory stand-in for the readout crate: transceiver registers, two DMA
//! buffers, a marker-framed event generator and the backplane command channel.

use crate::pcie::regs;
use crate::{Device, DmaHandle, PcieDevice, PcieResult, PcieReturn, Word};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const EVENT_START: Word = 0xFFFF_FFFF;
pub const EVENT_END: Word = 0xE000_0000;

/// Produces a continuous stream of framed events: start marker, header words,
/// ADC words, end marker carrying the event number in its low half.
#[derive(Debug)]
pub struct EventGenerator {
    rng: StdRng,
    words_per_event: usize,
    event_number: u32,
    pending: VecDeque<Word>,
}

impl EventGenerator {
    pub fn new(seed: u64, words_per_event: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            words_per_event: words_per_event.max(3),
            event_number: 0,
            pending: VecDeque::new(),
        }
    }

    fn queue_event(&mut self) {
        self.pending.push_back(EVENT_START);
        self.pending.push_back(0x1000_0000 | (self.event_number & 0xffff));
        for _ in 0..self.words_per_event - 3 {
            let channel: u32 = self.rng.random_range(0..64);
            let adc: u32 = self.rng.random_range(0..0x1000);
            self.pending.push_back(0x4000_0000 | (channel << 16) | adc);
        }
        self.pending.push_back(EVENT_END | (self.event_number & 0xffff));
        self.event_number = self.event_number.wrapping_add(1);
    }

    pub fn fill(&mut self, dst: &mut [Word]) {
        for word in dst.iter_mut() {
            if self.pending.is_empty() {
                self.queue_event();
            }
            *word = self.pending.pop_front().unwrap_or(0);
        }
    }

    pub fn events_started(&self) -> u32 {
        self.event_number
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimFaults {
    /// Transfers that complete before the DMA engine stops finishing.
    pub stall_after_transfers: Option<u64>,
    /// Bytes that land in the buffer of the stalled transfer.
    pub stalled_partial_bytes: usize,
    /// Fail every write to this (bar, offset).
    pub fail_write: Option<(u32, u32)>,
    /// Status bits the engine leaves above the low word of the byte count
    /// register when a transfer stalls.
    pub byte_count_flags: u32,
    /// Reject every backplane command.
    pub fail_commands: bool,
    /// Refuse to lock this buffer.
    pub fail_lock: Option<DmaHandle>,
}

#[derive(Debug)]
struct SimState {
    regs: HashMap<(Device, u32, u32), u64>,
    buffers: [Option<Vec<Word>>; 2],
    generator: EventGenerator,
    faults: SimFaults,
    transfers: u64,
    aborts: u64,
    commands: Vec<Word>,
    response: VecDeque<Word>,
    pps_frame: u32,
    trigger_pulses: u32,
    write_log: Vec<(u32, u32)>,
}

#[derive(Debug)]
pub struct SimDevice {
    state: Mutex<SimState>,
}

const PHYS_BASE: [u64; 2] = [0x0000_0001_8000_0000, 0x0000_0000_9000_0000];

impl SimDevice {
    pub fn new(seed: u64, words_per_event: usize) -> Self {
        Self::with_faults(seed, words_per_event, SimFaults::default())
    }

    pub fn with_faults(seed: u64, words_per_event: usize, faults: SimFaults) -> Self {
        Self {
            state: Mutex::new(SimState {
                regs: HashMap::new(),
                buffers: [None, None],
                generator: EventGenerator::new(seed, words_per_event),
                faults,
                transfers: 0,
                aborts: 0,
                commands: Vec::new(),
                response: VecDeque::new(),
                pps_frame: 0,
                trigger_pulses: 0,
                write_log: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transfers(&self) -> u64 {
        self.lock().transfers
    }

    pub fn aborts(&self) -> u64 {
        self.lock().aborts
    }

    /// Every command word sent over the backplane, in order.
    pub fn commands(&self) -> Vec<Word> {
        self.lock().commands.clone()
    }

    /// Every (offset, value) written to the transceiver control BAR, in order.
    pub fn data_writes(&self) -> Vec<(u32, u32)> {
        self.lock().write_log.clone()
    }

    pub fn buffers_locked(&self) -> bool {
        self.lock().buffers.iter().any(Option::is_some)
    }

    fn start_transfer(state: &mut SimState) {
        let low = state.regs.get(&(Device::Data, regs::CS_BAR, regs::CS_DMA_ADD_LOW_REG));
        let high = state.regs.get(&(Device::Data, regs::CS_BAR, regs::CS_DMA_ADD_HIGH_REG));
        let addr = (high.copied().unwrap_or(0) << 32) | low.copied().unwrap_or(0);
        let Some(index) = PHYS_BASE.iter().position(|&base| base == addr) else {
            return;
        };
        let requested = *state
            .regs
            .get(&(Device::Data, regs::CS_BAR, regs::CS_DMA_BY_CNT))
            .unwrap_or(&0) as usize;

        let stalled = state
            .faults
            .stall_after_transfers
            .is_some_and(|n| state.transfers >= n);
        let landed = if stalled {
            state.faults.stalled_partial_bytes.min(requested)
        } else {
            requested
        };

        let SimState {
            buffers, generator, ..
        } = &mut *state;
        if let Some(buffer) = buffers[index].as_mut() {
            let words = (landed / 4).min(buffer.len());
            generator.fill(&mut buffer[..words]);
        }

        let control = state
            .regs
            .entry((Device::Data, regs::CS_BAR, regs::CS_DMA_CNTRL))
            .or_default();
        if stalled {
            *control |= regs::DMA_IN_PROGRESS as u64;
        } else {
            *control &= !(regs::DMA_IN_PROGRESS as u64);
            state.transfers += 1;
        }
        let flags = if stalled {
            (state.faults.byte_count_flags as u64) << 32
        } else {
            0
        };
        state.regs.insert(
            (Device::Data, regs::CS_BAR, regs::CS_DMA_BY_CNT),
            flags | (requested - landed) as u64,
        );
    }

    fn handle_command(state: &mut SimState, word: Word) {
        state.commands.push(word);
        let module = (word >> 11) & 0x1f;
        let command = word & 0xff;
        match (module, command) {
            (regs::CONTROLLER_MODULE, regs::MB_CNTRL_SET_TRIG1) => state.trigger_pulses += 1,
            (regs::TRIGGER_MODULE, regs::MB_TRIG_READ_PPS) => {
                state.pps_frame += 1;
                state.response.clear();
                state
                    .response
                    .extend([state.pps_frame, state.pps_frame * 7 % 4096, 8]);
            }
            (regs::TRIGGER_MODULE, regs::MB_TRIG_READ_TIME) => {
                state.response.clear();
                state
                    .response
                    .extend([state.trigger_pulses, state.trigger_pulses * 3 % 4096, 5]);
            }
            _ => {}
        }
    }
}

impl PcieDevice for SimDevice {
    fn read_reg32(&self, dev: Device, bar: u32, offset: u32) -> PcieResult<u32> {
        Ok(self.read_reg64(dev, bar, offset)? as u32)
    }

    fn read_reg64(&self, dev: Device, bar: u32, offset: u32) -> PcieResult<u64> {
        Ok(*self.lock().regs.get(&(dev, bar, offset)).unwrap_or(&0))
    }

    fn write_reg32(&self, dev: Device, bar: u32, offset: u32, value: u32) -> PcieResult<()> {
        self.write_reg64(dev, bar, offset, value as u64)
    }

    fn write_reg64(&self, dev: Device, bar: u32, offset: u32, value: u64) -> PcieResult<()> {
        let mut state = self.lock();
        if state.faults.fail_write == Some((bar, offset)) {
            return Err(PcieReturn::Comm);
        }
        if dev == Device::Data && bar == regs::CS_BAR {
            state.write_log.push((offset, value as u32));
        }
        match (dev, bar, offset) {
            (Device::Data, regs::CS_BAR, regs::CS_DMA_CNTRL) if value as u32 & regs::DMA_TR12 != 0 => {
                state.regs.insert((dev, bar, offset), value);
                Self::start_transfer(&mut state);
            }
            (Device::Data, regs::CS_BAR, regs::CS_DMA_MSI_ABORT) => {
                if value as u32 & regs::DMA_ABORT != 0 {
                    state.aborts += 1;
                    let control = state
                        .regs
                        .entry((dev, bar, regs::CS_DMA_CNTRL))
                        .or_default();
                    *control &= !(regs::DMA_IN_PROGRESS as u64);
                }
                state.regs.insert((dev, bar, offset), value);
            }
            _ => {
                state.regs.insert((dev, bar, offset), value);
            }
        }
        Ok(())
    }

    fn dma_buffer_lock(&self, handle: DmaHandle, size_bytes: usize) -> PcieResult<()> {
        if size_bytes == 0 {
            return Err(PcieReturn::InvalidParam);
        }
        if self.lock().faults.fail_lock == Some(handle) {
            return Err(PcieReturn::Comm);
        }
        self.lock().buffers[handle.index()] = Some(vec![0; size_bytes.div_ceil(4)]);
        Ok(())
    }

    fn dma_sync_cpu(&self, handle: DmaHandle) -> PcieResult<()> {
        match self.lock().buffers[handle.index()] {
            Some(_) => Ok(()),
            None => Err(PcieReturn::BufferNotLocked),
        }
    }

    fn dma_sync_io(&self, handle: DmaHandle) -> PcieResult<()> {
        self.dma_sync_cpu(handle)
    }

    fn buffer_addr_lower(&self, handle: DmaHandle) -> PcieResult<u32> {
        self.dma_sync_cpu(handle)?;
        Ok(PHYS_BASE[handle.index()] as u32)
    }

    fn buffer_addr_upper(&self, handle: DmaHandle) -> PcieResult<u32> {
        self.dma_sync_cpu(handle)?;
        Ok((PHYS_BASE[handle.index()] >> 32) as u32)
    }

    fn read_dma_buffer(&self, handle: DmaHandle, dst: &mut [u32]) -> PcieResult<usize> {
        let state = self.lock();
        let buffer = state.buffers[handle.index()]
            .as_ref()
            .ok_or(PcieReturn::BufferNotLocked)?;
        let n = dst.len().min(buffer.len());
        dst[..n].copy_from_slice(&buffer[..n]);
        Ok(n)
    }

    fn free_dma_buffers(&self) -> PcieResult<()> {
        self.lock().buffers = [None, None];
        Ok(())
    }

    fn send_words(&self, dev: Device, words: &[u32]) -> PcieResult<()> {
        if dev != Device::Control {
            return Err(PcieReturn::InvalidParam);
        }
        let mut state = self.lock();
        if state.faults.fail_commands {
            return Err(PcieReturn::Comm);
        }
        for &word in words {
            Self::handle_command(&mut state, word);
        }
        Ok(())
    }

    fn recv_words(&self, dev: Device, dst: &mut [u32]) -> PcieResult<usize> {
        if dev != Device::Control {
            return Err(PcieReturn::InvalidParam);
        }
        let mut state = self.lock();
        let mut n = 0;
        for slot in dst.iter_mut() {
            match state.response.pop_front() {
                Some(word) => {
                    *slot = word;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_frames_events() {
        let mut generator = EventGenerator::new(1, 6);
        let mut words = [0u32; 12];
        generator.fill(&mut words);
        assert_eq!(words[0], EVENT_START);
        assert_eq!(words[5] & 0xFFFF_0000, EVENT_END);
        assert_eq!(words[6], EVENT_START);
        assert_eq!(words[11], EVENT_END | 1);
        assert!(words[2..5].iter().all(|w| w >> 28 == 0x4));
    }

    #[test]
    fn events_have_the_requested_length() {
        let mut generator = EventGenerator::new(2, 64);
        let mut words = vec![0u32; 64 * 3];
        generator.fill(&mut words);
        for event in words.chunks(64) {
            assert_eq!(event[0], EVENT_START);
            assert_eq!(event[63] & 0xFFFF_0000, EVENT_END);
        }
        assert_eq!(generator.events_started(), 3);

        let mut tiny = EventGenerator::new(2, 1);
        let mut words = [0u32; 6];
        tiny.fill(&mut words);
        assert_eq!(words[3], EVENT_START);
    }

    #[test]
    fn transfer_fills_the_addressed_buffer() {
        let dev = SimDevice::new(3, 4);
        dev.dma_buffer_lock(DmaHandle::Second, 32).unwrap();
        let low = dev.buffer_addr_lower(DmaHandle::Second).unwrap();
        let high = dev.buffer_addr_upper(DmaHandle::Second).unwrap();
        dev.write_reg32(Device::Data, regs::CS_BAR, regs::CS_DMA_ADD_LOW_REG, low).unwrap();
        dev.write_reg32(Device::Data, regs::CS_BAR, regs::CS_DMA_ADD_HIGH_REG, high).unwrap();
        dev.write_reg32(Device::Data, regs::CS_BAR, regs::CS_DMA_BY_CNT, 32).unwrap();
        dev.write_reg32(Device::Data, regs::CS_BAR, regs::CS_DMA_CNTRL, regs::DMA_TR12).unwrap();

        let status = dev.read_reg32(Device::Data, regs::CS_BAR, regs::CS_DMA_CNTRL).unwrap();
        assert_eq!(status & regs::DMA_IN_PROGRESS, 0);
        let mut out = [0u32; 8];
        assert_eq!(dev.read_dma_buffer(DmaHandle::Second, &mut out).unwrap(), 8);
        assert_eq!(out[0], EVENT_START);
        assert_eq!(dev.transfers(), 1);
    }

    #[test]
    fn pps_command_returns_a_triple() {
        let dev = SimDevice::new(0, 4);
        let cmd = regs::command_word(regs::TRIGGER_MODULE, 0, regs::MB_TRIG_READ_PPS, 0);
        dev.send_words(Device::Control, &[cmd]).unwrap();
        let mut triple = [0u32; 3];
        assert_eq!(dev.recv_words(Device::Control, &mut triple).unwrap(), 3);
        assert_eq!(triple[0], 1);
    }
}
