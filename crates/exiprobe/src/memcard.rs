//! Per-channel memory card session.
//!
//! A [`CardSession`] owns everything one card needs for a probe run: the write
//! ramp, the read buffer, the dummy latency bytes and the completion slots. The
//! read buffer moves into the read DMA and comes back through its completion, so
//! it cannot be looked at while the card is still writing into it.
//!
//! The `*_locked` helpers assume the caller already holds the channel lock;
//! the public operations take and release it themselves.

use crate::bus::{ChannelLock, Channel, ClockSpeed, Device, DmaBuffer, ExiBus, Selection};
use crate::command::{CardAddress, Command};
use crate::error::{Error, Result, TransferKind};
use crate::sync::TransferSynchronizer;
use exiprobe_hw::memcard::{MAX_LATENCY, PAGE_SIZE, READ_SIZE, status};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Snapshot of the card status register. Never cached; re-read on every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardStatus(pub u8);

impl CardStatus {
    pub fn is_ready(self) -> bool {
        self.0 & status::READY != 0
    }

    pub fn is_unlocked(self) -> bool {
        self.0 & status::UNLOCKED != 0
    }

    pub fn is_busy(self) -> bool {
        self.0 & status::BUSY != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for CardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// The deterministic page payload: byte `i` is `i mod 256`
pub fn ramp_pattern() -> [u8; PAGE_SIZE] {
    std::array::from_fn(|i| i as u8)
}

pub struct CardSession<B: ExiBus> {
    bus: Arc<B>,
    channel: Channel,
    write_buffer: Arc<[u8]>,
    read_buffer: Option<Box<[u8]>>,
    dummy: Box<[u8]>,
    sync: TransferSynchronizer,
    timeout: Option<Duration>,
}

impl<B: ExiBus> CardSession<B> {
    /// `timeout` bounds `wait_ready` and `join`; `None` waits indefinitely
    pub fn new(bus: Arc<B>, channel: Channel, timeout: Option<Duration>) -> Self {
        Self {
            bus,
            channel,
            write_buffer: Arc::from(ramp_pattern().as_slice()),
            read_buffer: Some(fresh_read_buffer()),
            dummy: vec![0u8; MAX_LATENCY].into_boxed_slice(),
            sync: TransferSynchronizer::new(channel, timeout),
            timeout,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn write_buffer(&self) -> &[u8] {
        &self.write_buffer
    }

    /// Contents of the last completed read, `None` while a read is in flight.
    ///
    /// A read the bus dropped is reported once as `TransferAbandoned`; the
    /// session then starts over with a blank buffer.
    pub fn read_buffer(&mut self) -> Result<Option<&[u8]>> {
        self.collect_read()?;
        Ok(self.read_buffer.as_deref())
    }

    fn collect_read(&mut self) -> Result<()> {
        match self.sync.read().take_done() {
            Ok(Some(buffer)) => {
                self.read_buffer = Some(buffer);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.read_buffer = Some(fresh_read_buffer());
                Err(e)
            }
        }
    }

    fn lock(&self) -> Result<ChannelLock<'_, B>> {
        lock_attached(&*self.bus, self.channel)
    }

    fn identify_locked(&self, lock: &ChannelLock<'_, B>, speed: ClockSpeed) -> Result<u16> {
        let _selection = Selection::select(lock, Device::MEMCARD, speed)?;
        self.bus.imm_write(self.channel, &Command::Identify.encode())?;
        let mut id = [0u8; 2];
        self.bus.imm_read(self.channel, &mut id)?;
        Ok(u16::from_be_bytes(id))
    }

    fn status_locked(&self, lock: &ChannelLock<'_, B>, speed: ClockSpeed) -> Result<CardStatus> {
        let _selection = Selection::select(lock, Device::MEMCARD, speed)?;
        self.bus.imm_write(self.channel, &Command::Status.encode())?;
        let mut status = [0u8; 1];
        self.bus.imm_read(self.channel, &mut status)?;
        Ok(CardStatus(status[0]))
    }

    /// Read the 16-bit identification word
    pub fn identify(&self, speed: ClockSpeed) -> Result<u16> {
        let lock = self.lock()?;
        self.identify_locked(&lock, speed)
    }

    pub fn status(&self, speed: ClockSpeed) -> Result<CardStatus> {
        let lock = self.lock()?;
        self.status_locked(&lock, speed)
    }

    pub fn clear_status(&self, speed: ClockSpeed) -> Result<()> {
        clear_status(&*self.bus, self.channel, speed)
    }

    pub fn enable_interrupt(&self, speed: ClockSpeed, enable: bool) -> Result<()> {
        let lock = self.lock()?;
        let _selection = Selection::select(&lock, Device::MEMCARD, speed)?;
        self.bus
            .imm_write(self.channel, &Command::EnableInterrupt(enable).encode())?;
        Ok(())
    }

    /// Register a card interrupt handler that acknowledges by clearing status.
    ///
    /// Best effort: the handler may run before or after any DMA completion and
    /// a failure inside it is only logged.
    pub fn install_interrupt_handler(&self) -> Result<()> {
        let bus = Arc::clone(&self.bus);
        self.bus.register_exi_handler(
            self.channel,
            Some(Arc::new(move |channel, _device| {
                debug!("{} card interrupt", channel);
                if let Err(e) = clear_status(&*bus, channel, ClockSpeed::Mhz16) {
                    warn!("{} interrupt acknowledge failed: {}", channel, e);
                }
            })),
        )?;
        Ok(())
    }

    /// Poll status until the card reports ready, one locked transaction per poll
    pub fn wait_ready(&self, speed: ClockSpeed) -> Result<CardStatus> {
        let started = Instant::now();
        loop {
            let status = self.status(speed)?;
            if status.is_ready() {
                return Ok(status);
            }
            self.check_deadline(started, status)?;
        }
    }

    fn check_deadline(&self, started: Instant, status: CardStatus) -> Result<()> {
        debug!(
            "{} waiting for ready status; memcardStatus:{}",
            self.channel, status
        );
        if let Some(timeout) = self.timeout
            && started.elapsed() >= timeout
        {
            return Err(Error::DeviceUnresponsive {
                channel: self.channel,
                waited: started.elapsed(),
            });
        }
        Ok(())
    }

    /// Program one page from the write buffer. Returns once the DMA is issued;
    /// the channel stays locked until the DMA completes.
    pub fn begin_program(&mut self, speed: ClockSpeed, address: CardAddress) -> Result<()> {
        info!("{} page program start;", self.channel);

        if !self.sync.program_done() {
            return Err(Error::TransferInFlight {
                channel: self.channel,
                kind: TransferKind::Program,
            });
        }
        let channel_bus = Arc::clone(&self.bus);
        let lock = lock_attached(&*channel_bus, self.channel)?;

        let started = Instant::now();
        let status = loop {
            let status = self.status_locked(&lock, speed)?;
            if status.is_ready() {
                break status;
            }
            self.check_deadline(started, status)?;
        };
        info!("{} card is ready; memcardStatus:{}", self.channel, status);

        let op = Command::PageProgram(address).encode();
        info!(
            "{} writing block start; size:{}",
            self.channel,
            self.write_buffer.len()
        );
        info!("{} op bytes; {}", self.channel, op);

        let selection = Selection::select(&lock, Device::MEMCARD, speed)?;
        self.bus.imm_write(self.channel, &op)?;

        let completer = self.sync.program().arm()?;
        let bus = Arc::clone(&self.bus);
        let issued = self.bus.dma(
            self.channel,
            DmaBuffer::Write(Arc::clone(&self.write_buffer)),
            Box::new(move |channel, _device, _buffer| {
                completer.complete(());
                release(&*bus, channel);
            }),
        );
        if let Err(e) = issued {
            self.sync.program().cancel();
            return Err(e.into());
        }
        selection.hand_off();
        lock.hand_off();

        info!("{} writing block end;", self.channel);
        info!("{} page program end;", self.channel);
        Ok(())
    }

    /// Read from `address` into the read buffer after `latency` dummy bytes.
    /// `latency` must come from the attached card's geometry.
    pub fn begin_read(
        &mut self,
        speed: ClockSpeed,
        latency: u32,
        address: CardAddress,
    ) -> Result<()> {
        info!("{} read page start;", self.channel);

        if latency as usize > self.dummy.len() {
            return Err(Error::LatencyOutOfRange {
                latency,
                max: self.dummy.len(),
            });
        }
        self.collect_read()?;
        let buffer = self.read_buffer.take().ok_or(Error::TransferInFlight {
            channel: self.channel,
            kind: TransferKind::Read,
        })?;

        let result = self.issue_read(speed, latency, address, buffer);
        if let Err((e, buffer)) = result {
            self.read_buffer = Some(buffer.unwrap_or_else(fresh_read_buffer));
            return Err(e);
        }

        info!("{} read page end;", self.channel);
        Ok(())
    }

    fn issue_read(
        &mut self,
        speed: ClockSpeed,
        latency: u32,
        address: CardAddress,
        buffer: Box<[u8]>,
    ) -> std::result::Result<(), (Error, Option<Box<[u8]>>)> {
        let channel_bus = Arc::clone(&self.bus);
        let lock = match lock_attached(&*channel_bus, self.channel) {
            Ok(lock) => lock,
            Err(e) => return Err((e, Some(buffer))),
        };

        let op = Command::PageRead(address).encode();
        info!("{} op bytes; {}", self.channel, op);

        let dummy_len = latency as usize;
        let selection = match Selection::select(&lock, Device::MEMCARD, speed)
            .and_then(|selection| {
                self.bus.imm_write(self.channel, &op)?;
                self.bus.imm_write(self.channel, &self.dummy[..dummy_len])?;
                Ok(selection)
            }) {
            Ok(selection) => selection,
            Err(e) => return Err((e.into(), Some(buffer))),
        };

        let completer = match self.sync.read().arm() {
            Ok(completer) => completer,
            Err(e) => return Err((e, Some(buffer))),
        };
        let bus = Arc::clone(&self.bus);
        let issued = self.bus.dma(
            self.channel,
            DmaBuffer::Read(buffer),
            Box::new(move |channel, _device, buffer| {
                if let DmaBuffer::Read(data) = buffer {
                    completer.complete(data);
                }
                release(&*bus, channel);
            }),
        );
        if let Err(e) = issued {
            // The bus consumed the buffer along with the callback.
            self.sync.read().cancel();
            return Err((e.into(), None));
        }
        selection.hand_off();
        lock.hand_off();
        Ok(())
    }

    /// Wait for any outstanding program and read to finish
    pub fn join(&mut self) -> Result<()> {
        let result = match self.sync.join() {
            Ok(Some(buffer)) => {
                self.read_buffer = Some(buffer);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if self.read_buffer.is_none() && self.sync.read_done() {
            // An abandoned read took the buffer with it.
            self.read_buffer = Some(fresh_read_buffer());
        }
        result
    }
}

fn fresh_read_buffer() -> Box<[u8]> {
    vec![0u8; READ_SIZE].into_boxed_slice()
}

fn lock_attached<B: ExiBus + ?Sized>(bus: &B, channel: Channel) -> Result<ChannelLock<'_, B>> {
    if !bus.is_attached(channel) {
        return Err(Error::NotAttached(channel));
    }
    Ok(ChannelLock::acquire(bus, channel, Device::MEMCARD)?)
}

fn clear_status<B: ExiBus + ?Sized>(bus: &B, channel: Channel, speed: ClockSpeed) -> Result<()> {
    let lock = ChannelLock::acquire(bus, channel, Device::MEMCARD)?;
    let _selection = Selection::select(&lock, Device::MEMCARD, speed)?;
    bus.imm_write(channel, &Command::ClearStatus.encode())?;
    Ok(())
}

/// Body of every DMA completion: end the transaction and give up the channel
fn release<B: ExiBus + ?Sized>(bus: &B, channel: Channel) {
    if let Err(e) = bus.deselect(channel) {
        warn!("{} deselect after DMA failed: {}", channel, e);
    }
    if let Err(e) = bus.unlock(channel) {
        warn!("{} unlock after DMA failed: {}", channel, e);
    }
}
