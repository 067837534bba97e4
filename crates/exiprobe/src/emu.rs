//! Software EXI bus for running the probe without hardware.
//!
//! [`EmulatedBus`] implements [`ExiBus`] for the two memory card channels and
//! is strict about the contract: selecting or transferring without the channel
//! lock, double selects, transfers with nothing selected and overlapping DMA
//! are all reported as [`BusError`]s instead of being tolerated. Every
//! transaction is recorded as a [`BusEvent`] so a driver's wire behaviour can be
//! compared against a capture from real hardware.
//!
//! DMA completions and card interrupts run on their own threads, the closest
//! thing to an interrupt context a hosted process has. Tests that need a fixed
//! ordering can switch to [`DmaMode::Manual`] and fire completions explicitly.

use crate::bus::{
    BusError, Channel, ClockSpeed, Device, DmaBuffer, DmaCallback, ExiBus, ExiHandler,
};
use exiprobe_hw::exi;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, instrument, trace, warn};

pub mod memcard;

pub use memcard::EmulatedCard;

/// One transaction step as seen on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Lock(Device),
    Unlock,
    Select(Device, ClockSpeed),
    Deselect,
    ImmWrite(Vec<u8>),
    ImmRead(usize),
    DmaWrite(usize),
    DmaRead(usize),
    DmaComplete,
    Interrupt,
}

/// When DMA transfers are carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaMode {
    /// Each transfer runs on a spawned thread as soon as it is issued
    #[default]
    Threaded,
    /// Transfers wait until [`EmulatedBus::complete_dma`] is called
    Manual,
}

struct PendingDma {
    device: Device,
    buffer: DmaBuffer,
    on_complete: DmaCallback,
}

#[derive(Default)]
struct ChannelState {
    card: Option<EmulatedCard>,
    attached: bool,
    locked: Option<Device>,
    selected: Option<(Device, ClockSpeed)>,
    dma_busy: bool,
    pending_dma: Option<PendingDma>,
    handler: Option<ExiHandler>,
    events: Vec<BusEvent>,
}

impl ChannelState {
    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.attached {
            flags |= exi::state::ATTACH;
        }
        if self.locked.is_some() {
            flags |= exi::state::LOCKED;
        }
        if self.selected.is_some() {
            flags |= exi::state::SELECT;
        }
        if self.dma_busy {
            flags |= exi::state::DMA;
        }
        flags
    }
}

#[derive(Default)]
struct ChannelSlot {
    state: Mutex<ChannelState>,
    unlocked: Condvar,
}

impl ChannelSlot {
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        // A panic in a test thread must not wedge the other channel users.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct EmulatedBus {
    channels: [Arc<ChannelSlot>; exi::MEMCARD_CHANNELS],
    dma_mode: DmaMode,
}

impl Default for EmulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedBus {
    pub fn new() -> Self {
        Self {
            channels: Default::default(),
            dma_mode: DmaMode::default(),
        }
    }

    pub fn with_dma_mode(mut self, mode: DmaMode) -> Self {
        self.dma_mode = mode;
        self
    }

    /// Plug a card into a channel
    pub fn with_card(self, channel: Channel, card: EmulatedCard) -> Self {
        self.insert_card(channel, card);
        self
    }

    pub fn insert_card(&self, channel: Channel, card: EmulatedCard) {
        debug!("{} card inserted: id={:#06x}", channel, card.id());
        self.slot(channel).state().card = Some(card);
    }

    /// Pull the card out; the channel reports detached from then on
    pub fn remove_card(&self, channel: Channel) -> Option<EmulatedCard> {
        let mut state = self.slot(channel).state();
        state.attached = false;
        state.card.take()
    }

    /// Inspect or modify the card in a channel
    pub fn with_card_mut<R>(
        &self,
        channel: Channel,
        f: impl FnOnce(&mut EmulatedCard) -> R,
    ) -> Option<R> {
        self.slot(channel).state().card.as_mut().map(f)
    }

    /// Channel state flags, as in `exiprobe_hw::exi::state`
    pub fn state_flags(&self, channel: Channel) -> u32 {
        self.slot(channel).state().flags()
    }

    /// Drain the transaction log of a channel
    pub fn take_events(&self, channel: Channel) -> Vec<BusEvent> {
        std::mem::take(&mut self.slot(channel).state().events)
    }

    pub fn has_pending_dma(&self, channel: Channel) -> bool {
        self.slot(channel).state().pending_dma.is_some()
    }

    /// Carry out a DMA held back by [`DmaMode::Manual`] on the calling thread.
    /// Returns false if nothing was pending.
    pub fn complete_dma(&self, channel: Channel) -> bool {
        let pending = self.slot(channel).state().pending_dma.take();
        match pending {
            Some(dma) => {
                run_dma(&self.channels[channel.index()], channel, dma);
                true
            }
            None => false,
        }
    }

    fn slot(&self, channel: Channel) -> &ChannelSlot {
        &self.channels[channel.index()]
    }

    /// Lock state and check that the caller holds the channel with a device selected
    fn selected_state(&self, channel: Channel) -> Result<MutexGuard<'_, ChannelState>, BusError> {
        let state = self.slot(channel).state();
        if state.locked.is_none() {
            return Err(BusError::NotLocked(channel));
        }
        if state.selected.is_none() {
            return Err(BusError::NotSelected(channel));
        }
        Ok(state)
    }
}

/// Move a DMA block between buffer and card, then invoke its completion with
/// the channel state unlocked so the callback can deselect and unlock.
fn run_dma(slot: &ChannelSlot, channel: Channel, dma: PendingDma) {
    let PendingDma {
        device,
        mut buffer,
        on_complete,
    } = dma;
    {
        let mut state = slot.state();
        match state.card.as_mut() {
            Some(card) => match &mut buffer {
                DmaBuffer::Write(data) => card.write(data),
                DmaBuffer::Read(data) => card.read(data),
            },
            None => warn!("{} DMA with no card present", channel),
        }
        state.dma_busy = false;
        state.events.push(BusEvent::DmaComplete);
        trace!("{} DMA complete: {} bytes", channel, buffer.len());
    }
    on_complete(channel, device, buffer);
}

impl ExiBus for EmulatedBus {
    #[instrument(level = "trace", skip(self))]
    fn attach(&self, channel: Channel) -> Result<bool, BusError> {
        let mut state = self.slot(channel).state();
        state.attached = state.card.is_some();
        Ok(state.attached)
    }

    #[instrument(level = "trace", skip(self))]
    fn detach(&self, channel: Channel) -> Result<(), BusError> {
        let mut state = self.slot(channel).state();
        state.attached = false;
        state.handler = None;
        Ok(())
    }

    fn is_attached(&self, channel: Channel) -> bool {
        self.slot(channel).state().attached
    }

    #[instrument(level = "trace", skip(self))]
    fn lock(&self, channel: Channel, device: Device) -> Result<(), BusError> {
        let slot = self.slot(channel);
        let mut state = slot.state();
        while state.locked.is_some() {
            state = slot
                .unlocked
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.locked = Some(device);
        state.events.push(BusEvent::Lock(device));
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    fn unlock(&self, channel: Channel) -> Result<(), BusError> {
        let slot = self.slot(channel);
        let mut state = slot.state();
        if state.locked.take().is_none() {
            return Err(BusError::NotLocked(channel));
        }
        state.events.push(BusEvent::Unlock);
        drop(state);
        slot.unlocked.notify_one();
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    fn select(&self, channel: Channel, device: Device, speed: ClockSpeed) -> Result<(), BusError> {
        let mut state = self.slot(channel).state();
        if state.locked.is_none() {
            return Err(BusError::NotLocked(channel));
        }
        if state.selected.is_some() {
            return Err(BusError::AlreadySelected(channel));
        }
        if !state.attached {
            return Err(BusError::NoDevice(channel));
        }
        state.selected = Some((device, speed));
        state.events.push(BusEvent::Select(device, speed));
        if device == Device::MEMCARD
            && let Some(card) = state.card.as_mut()
        {
            card.select();
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    fn deselect(&self, channel: Channel) -> Result<(), BusError> {
        let mut state = self.slot(channel).state();
        let Some((device, _)) = state.selected.take() else {
            return Err(BusError::NotSelected(channel));
        };
        state.events.push(BusEvent::Deselect);

        let raised = device == Device::MEMCARD
            && state.card.as_mut().is_some_and(|card| card.deselect());
        if raised {
            state.events.push(BusEvent::Interrupt);
            if let Some(handler) = state.handler.clone() {
                debug!("{} dispatching card interrupt", channel);
                thread::spawn(move || handler(channel, device));
            }
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn imm_write(&self, channel: Channel, data: &[u8]) -> Result<(), BusError> {
        let mut state = self.selected_state(channel)?;
        state.events.push(BusEvent::ImmWrite(data.to_vec()));
        if let Some(card) = state.card.as_mut() {
            card.write(data);
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, buf), fields(len = buf.len()))]
    fn imm_read(&self, channel: Channel, buf: &mut [u8]) -> Result<(), BusError> {
        let mut state = self.selected_state(channel)?;
        state.events.push(BusEvent::ImmRead(buf.len()));
        match state.card.as_mut() {
            Some(card) => card.read(buf),
            None => buf.fill(0xFF),
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, buffer, on_complete), fields(len = buffer.len()))]
    fn dma(
        &self,
        channel: Channel,
        buffer: DmaBuffer,
        on_complete: DmaCallback,
    ) -> Result<(), BusError> {
        let mut state = self.selected_state(channel)?;
        if state.dma_busy {
            return Err(BusError::DmaBusy(channel));
        }
        let Some((device, _)) = state.selected else {
            return Err(BusError::NotSelected(channel));
        };
        state.dma_busy = true;
        state.events.push(if buffer.is_write() {
            BusEvent::DmaWrite(buffer.len())
        } else {
            BusEvent::DmaRead(buffer.len())
        });

        let dma = PendingDma {
            device,
            buffer,
            on_complete,
        };
        match self.dma_mode {
            DmaMode::Manual => state.pending_dma = Some(dma),
            DmaMode::Threaded => {
                drop(state);
                let slot = Arc::clone(&self.channels[channel.index()]);
                thread::spawn(move || run_dma(&slot, channel, dma));
            }
        }
        Ok(())
    }

    fn register_exi_handler(
        &self,
        channel: Channel,
        handler: Option<ExiHandler>,
    ) -> Result<(), BusError> {
        self.slot(channel).state().handler = handler;
        Ok(())
    }
}
