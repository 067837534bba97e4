//! The EXI bus contract the memory-card driver is written against.
//!
//! The driver never touches bus registers itself. Everything it needs from the
//! underlying bus (locking, chip select, immediate and DMA transfers, the card
//! interrupt hook and attachment state) goes through [`ExiBus`]. Real hardware
//! and [`crate::emu::EmulatedBus`] both sit behind this trait.

use exiprobe_hw::exi::{self, clock};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// EXI channel a memory card slot is wired to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Slot A
    Exi0,
    /// Slot B
    Exi1,
}

impl Channel {
    pub const ALL: [Channel; exi::MEMCARD_CHANNELS] = [Channel::Exi0, Channel::Exi1];

    pub fn index(self) -> usize {
        match self {
            Channel::Exi0 => 0,
            Channel::Exi1 => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EXICHANNEL[{}]", self.index())
    }
}

/// Chip-select line on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Dev0,
    Dev1,
    Dev2,
}

impl Device {
    /// Slot every memory card answers on
    pub const MEMCARD: Device = Device::Dev0;

    pub fn index(self) -> u8 {
        match self {
            Device::Dev0 => 0,
            Device::Dev1 => 1,
            Device::Dev2 => 2,
        }
    }
}

/// Transfer clock. Changes timing only, never the shape of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ClockSpeed {
    Mhz1 = clock::SPEED_1MHZ,
    Mhz2 = clock::SPEED_2MHZ,
    Mhz4 = clock::SPEED_4MHZ,
    Mhz8 = clock::SPEED_8MHZ,
    Mhz16 = clock::SPEED_16MHZ,
    Mhz32 = clock::SPEED_32MHZ,
}

impl ClockSpeed {
    pub const ALL: [ClockSpeed; 6] = [
        ClockSpeed::Mhz1,
        ClockSpeed::Mhz2,
        ClockSpeed::Mhz4,
        ClockSpeed::Mhz8,
        ClockSpeed::Mhz16,
        ClockSpeed::Mhz32,
    ];

    pub fn from_raw(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn frequency_hz(self) -> u32 {
        clock::FREQUENCY_HZ[self as usize]
    }
}

impl fmt::Display for ClockSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MHz", self.frequency_hz() / 1_000_000)
    }
}

/// Buffer handed to a DMA transfer. The direction is implied by the variant.
#[derive(Debug)]
pub enum DmaBuffer {
    /// Host to device. Shared so the owner keeps its copy for the next program.
    Write(Arc<[u8]>),
    /// Device to host. Ownership comes back through the completion callback.
    Read(Box<[u8]>),
}

impl DmaBuffer {
    pub fn len(&self) -> usize {
        match self {
            DmaBuffer::Write(data) => data.len(),
            DmaBuffer::Read(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_write(&self) -> bool {
        matches!(self, DmaBuffer::Write(_))
    }
}

/// Invoked once a DMA block has fully transferred.
///
/// Runs in an interrupt-like context. It must not block or start new
/// transfers; signalling completion, deselecting and unlocking is all it may do.
pub type DmaCallback = Box<dyn FnOnce(Channel, Device, DmaBuffer) + Send + 'static>;

/// Invoked when the card raises its out-of-band EXI interrupt
pub type ExiHandler = Arc<dyn Fn(Channel, Device) + Send + Sync + 'static>;

/// Failures reported by the bus layer. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("{0} has nothing attached")]
    NoDevice(Channel),

    #[error("{0} is not locked")]
    NotLocked(Channel),

    #[error("{0} already has a device selected")]
    AlreadySelected(Channel),

    #[error("{0} has no device selected")]
    NotSelected(Channel),

    #[error("{0} already has a DMA transfer in progress")]
    DmaBusy(Channel),

    #[error("card image: {0}")]
    Image(String),
}

/// Operations the driver needs from the EXI bus.
///
/// All methods take `&self`; implementations synchronise internally because
/// DMA callbacks call back into the bus from another thread.
pub trait ExiBus: Send + Sync + 'static {
    /// Attach the channel and report whether a device answered
    fn attach(&self, channel: Channel) -> Result<bool, BusError>;

    fn detach(&self, channel: Channel) -> Result<(), BusError>;

    fn is_attached(&self, channel: Channel) -> bool;

    /// Acquire exclusive use of the channel, blocking while another holder has it
    fn lock(&self, channel: Channel, device: Device) -> Result<(), BusError>;

    fn unlock(&self, channel: Channel) -> Result<(), BusError>;

    fn select(&self, channel: Channel, device: Device, speed: ClockSpeed) -> Result<(), BusError>;

    fn deselect(&self, channel: Channel) -> Result<(), BusError>;

    /// Immediate write; returns once the bus reports the transfer synced
    fn imm_write(&self, channel: Channel, data: &[u8]) -> Result<(), BusError>;

    /// Immediate read; returns once the bus reports the transfer synced
    fn imm_read(&self, channel: Channel, buf: &mut [u8]) -> Result<(), BusError>;

    /// Start a DMA block transfer and return immediately
    fn dma(
        &self,
        channel: Channel,
        buffer: DmaBuffer,
        on_complete: DmaCallback,
    ) -> Result<(), BusError>;

    /// Install (or with `None`, remove) the card interrupt handler
    fn register_exi_handler(
        &self,
        channel: Channel,
        handler: Option<ExiHandler>,
    ) -> Result<(), BusError>;
}

/// Holds a channel lock and releases it when dropped.
///
/// A transaction that ends in a DMA hands the lock to the completion callback
/// with [`ChannelLock::hand_off`]; every other exit path unlocks here.
pub struct ChannelLock<'a, B: ExiBus + ?Sized> {
    bus: &'a B,
    channel: Channel,
    held: bool,
}

impl<'a, B: ExiBus + ?Sized> ChannelLock<'a, B> {
    pub fn acquire(bus: &'a B, channel: Channel, device: Device) -> Result<Self, BusError> {
        bus.lock(channel, device)?;
        Ok(Self {
            bus,
            channel,
            held: true,
        })
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Give up responsibility for unlocking. Whoever receives the DMA
    /// completion must call [`ExiBus::unlock`].
    pub fn hand_off(mut self) {
        self.held = false;
    }
}

impl<B: ExiBus + ?Sized> Drop for ChannelLock<'_, B> {
    fn drop(&mut self) {
        if self.held
            && let Err(e) = self.bus.unlock(self.channel)
        {
            tracing::warn!("{} unlock failed: {}", self.channel, e);
        }
    }
}

/// Select a device for the lifetime of the guard; deselects on drop
pub struct Selection<'a, B: ExiBus + ?Sized> {
    bus: &'a B,
    channel: Channel,
    held: bool,
}

impl<'a, B: ExiBus + ?Sized> Selection<'a, B> {
    pub fn select(
        lock: &ChannelLock<'a, B>,
        device: Device,
        speed: ClockSpeed,
    ) -> Result<Self, BusError> {
        lock.bus.select(lock.channel, device, speed)?;
        Ok(Self {
            bus: lock.bus,
            channel: lock.channel,
            held: true,
        })
    }

    pub fn hand_off(mut self) {
        self.held = false;
    }
}

impl<B: ExiBus + ?Sized> Drop for Selection<'_, B> {
    fn drop(&mut self) {
        if self.held
            && let Err(e) = self.bus.deselect(self.channel)
        {
            tracing::warn!("{} deselect failed: {}", self.channel, e);
        }
    }
}
