use log::error;
use std::fmt;

/// Status codes returned by the PCIe driver binding.
#[repr(i32)]
#[derive(Clone, Copy, PartialEq, PartialOrd, Debug)]
pub enum PcieReturn {
    Success = 0,
    Generic = -1,
    InvalidParam = -2,
    DevNotFound = -3,
    DevNotOpen = -4,
    InvalidHandle = -5,
    BufferLock = -6,
    BufferNotLocked = -7,
    Timeout = -8,
    Comm = -9,
    Unknown = 1,
}

impl From<i32> for PcieReturn {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Success,
            -1 => Self::Generic,
            -2 => Self::InvalidParam,
            -3 => Self::DevNotFound,
            -4 => Self::DevNotOpen,
            -5 => Self::InvalidHandle,
            -6 => Self::BufferLock,
            -7 => Self::BufferNotLocked,
            -8 => Self::Timeout,
            -9 => Self::Comm,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for PcieReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

impl std::error::Error for PcieReturn {}

pub type PcieResult<T> = Result<T, PcieReturn>;

/// The two PCIe endpoints of the readout crate: the controller command channel
/// and the transceiver card that owns the DMA engine.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Device {
    Control = 1,
    Data = 2,
}

/// One of the two contiguous DMA receive buffers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DmaHandle {
    First = 1,
    Second = 2,
}

impl DmaHandle {
    pub fn for_iteration(iteration: usize) -> Self {
        if iteration % 2 == 0 {
            DmaHandle::First
        } else {
            DmaHandle::Second
        }
    }

    pub fn index(self) -> usize {
        self as usize - 1
    }
}

/// Synchronous access primitives of the PCIe driver. Every call can fail and
/// reports failure as a status code.
pub trait PcieDevice: Send + Sync {
    fn read_reg32(&self, dev: Device, bar: u32, offset: u32) -> PcieResult<u32>;
    fn read_reg64(&self, dev: Device, bar: u32, offset: u32) -> PcieResult<u64>;
    fn write_reg32(&self, dev: Device, bar: u32, offset: u32, value: u32) -> PcieResult<()>;
    fn write_reg64(&self, dev: Device, bar: u32, offset: u32, value: u64) -> PcieResult<()>;

    fn dma_buffer_lock(&self, handle: DmaHandle, size_bytes: usize) -> PcieResult<()>;
    fn dma_sync_cpu(&self, handle: DmaHandle) -> PcieResult<()>;
    fn dma_sync_io(&self, handle: DmaHandle) -> PcieResult<()>;
    fn buffer_addr_lower(&self, handle: DmaHandle) -> PcieResult<u32>;
    fn buffer_addr_upper(&self, handle: DmaHandle) -> PcieResult<u32>;
    /// Copy the first `dst.len()` words of a locked buffer into `dst`.
    fn read_dma_buffer(&self, handle: DmaHandle, dst: &mut [u32]) -> PcieResult<usize>;
    fn free_dma_buffers(&self) -> PcieResult<()>;

    /// Send command words to the crate backplane.
    fn send_words(&self, dev: Device, words: &[u32]) -> PcieResult<()>;
    /// Receive the response to the previous command.
    fn recv_words(&self, dev: Device, dst: &mut [u32]) -> PcieResult<usize>;
}

/// Register map of the transceiver card and backplane command codes.
pub mod regs {
    pub const CS_BAR: u32 = 2;

    pub const T1_CS_REG: u32 = 0x18;
    pub const R1_CS_REG: u32 = 0x1c;
    pub const T2_CS_REG: u32 = 0x20;
    pub const R2_CS_REG: u32 = 0x24;
    pub const TX_MD_REG: u32 = 0x28;
    pub const CS_DMA_ADD_LOW_REG: u32 = 0x0;
    pub const CS_DMA_ADD_HIGH_REG: u32 = 0x4;
    pub const CS_DMA_BY_CNT: u32 = 0x8;
    pub const CS_DMA_CNTRL: u32 = 0xc;
    pub const CS_DMA_MSI_ABORT: u32 = 0x10;

    pub const CS_INIT: u32 = 0x2000_0000;
    pub const CS_START: u32 = 0x4000_0000;
    pub const TX_MODE: u32 = 0x0000_2000;
    pub const DMA_TR12: u32 = 0x30_0000;
    pub const DMA_3DW_REC: u32 = 0x40;
    pub const DMA_4DW_REC: u32 = 0x60;
    pub const DMA_IN_PROGRESS: u32 = 0x8000_0000;
    pub const DMA_ABORT: u32 = 0x2;

    pub const RECEIVER_REGS: [u32; 2] = [R1_CS_REG, R2_CS_REG];

    pub const CONTROLLER_MODULE: u32 = 0;
    pub const CONTROLLER_CHIP: u32 = 1;
    pub const TRIGGER_MODULE: u32 = 11;

    pub const MB_CNTRL_SET_RUN_ON: u32 = 0x2;
    pub const MB_CNTRL_SET_RUN_OFF: u32 = 0x3;
    pub const MB_CNTRL_SET_TRIG1: u32 = 0x4;

    pub const MB_TRIG_MASK1: u32 = 0x3;
    pub const MB_TRIG_PRESCALE1: u32 = 0x4;
    pub const MB_TRIG_MASK8: u32 = 0xa;
    pub const MB_TRIG_PRESCALE8: u32 = 0xb;
    pub const MB_TRIG_READ_TIME: u32 = 0x14;
    pub const MB_TRIG_READ_PPS: u32 = 0x15;

    /// Backplane command word: module slot, chip, command code and a 16 bit payload.
    pub fn command_word(module: u32, chip: u32, command: u32, data: u32) -> u32 {
        (module << 11) | (chip << 8) | command | ((data & 0xffff) << 16)
    }
}

/// Both receive buffers, locked for the lifetime of the guard.
pub struct DmaBuffers<'a> {
    device: &'a dyn PcieDevice,
    size_bytes: usize,
}

impl<'a> DmaBuffers<'a> {
    pub fn lock(device: &'a dyn PcieDevice, size_bytes: usize) -> PcieResult<Self> {
        device.dma_buffer_lock(DmaHandle::First, size_bytes)?;
        if let Err(e) = device.dma_buffer_lock(DmaHandle::Second, size_bytes) {
            if let Err(free) = device.free_dma_buffers() {
                error!("Failed freeing DMA buffers after lock failure: {free}");
            }
            return Err(e);
        }
        Ok(Self { device, size_bytes })
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl Drop for DmaBuffers<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.device.free_dma_buffers() {
            error!("Failed freeing DMA buffers: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip_known_values() {
        assert_eq!(PcieReturn::from(0), PcieReturn::Success);
        assert_eq!(PcieReturn::from(-8), PcieReturn::Timeout);
        assert_eq!(PcieReturn::from(-42), PcieReturn::Unknown);
    }

    #[test]
    fn command_word_packs_fields() {
        let word = regs::command_word(11, 0, regs::MB_TRIG_MASK8, 0x2);
        assert_eq!(word >> 11 & 0x1f, 11);
        assert_eq!(word & 0xff, regs::MB_TRIG_MASK8);
        assert_eq!(word >> 16, 0x2);
    }

    #[test]
    fn failed_second_lock_releases_the_first() {
        let faults = crate::SimFaults {
            fail_lock: Some(DmaHandle::Second),
            ..Default::default()
        };
        let sim = crate::SimDevice::with_faults(0, 8, faults);
        assert!(matches!(DmaBuffers::lock(&sim, 64), Err(PcieReturn::Comm)));
        assert!(!sim.buffers_locked());

        let sim = crate::SimDevice::new(0, 8);
        let buffers = DmaBuffers::lock(&sim, 64).unwrap();
        assert!(sim.buffers_locked());
        drop(buffers);
        assert!(!sim.buffers_locked());
    }

    #[test]
    fn handles_alternate() {
        assert_eq!(DmaHandle::for_iteration(0), DmaHandle::First);
        assert_eq!(DmaHandle::for_iteration(1), DmaHandle::Second);
        assert_eq!(DmaHandle::for_iteration(2), DmaHandle::First);
        assert_eq!(DmaHandle::Second.index(), 1);
    }
}
