//! Emulated serial memory card.
//!
//! Decodes the command stream clocked in while the card is selected and answers
//! the way a first-party card does: identify, status, clear status, interrupt
//! enable, page program and page read. Page reads honour the card's latency
//! class: data only starts after that many bytes have been clocked following the
//! command, so a driver that sends the wrong number of dummy bytes reads garbage.

use crate::bus::BusError;
use crate::command::CardAddress;
use crate::geometry::TableIndex;
use exiprobe_hw::memcard::{LATENCY_TABLE, PAGE_SIZE, command_len, opcode, status};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, trace, warn};

/// Value seen on the data line when the card drives nothing
const FLOATING: u8 = 0xFF;

/// Contents of an erased flash cell
const ERASED: u8 = 0xFF;

#[derive(Debug)]
enum Phase {
    /// Collecting opcode and operands
    Command,
    /// Shifting out a fixed response (identify, status)
    Respond { bytes: [u8; 2], len: usize, pos: usize },
    /// Receiving page data
    Program { address: u32, written: usize },
    /// Clocking out data once the latency has elapsed
    Read { address: u32, clocks: usize },
    /// Command finished; further bytes are ignored until deselect
    Done,
}

#[derive(Debug)]
pub struct EmulatedCard {
    id: u16,
    status: u8,
    interrupt_enabled: bool,
    settle_polls: u32,
    busy_polls_remaining: u32,
    status_polls: u32,
    pages_programmed: u32,
    data: Vec<u8>,
    image: Option<File>,

    command: Vec<u8>,
    phase: Phase,
}

impl EmulatedCard {
    pub fn new(id: u16) -> Self {
        // Bits 2-7 of the id give the size in megabits
        let capacity = ((id & 0xFC) as usize) << 17;
        Self {
            id,
            status: status::READY | status::UNLOCKED,
            interrupt_enabled: false,
            settle_polls: 0,
            busy_polls_remaining: 0,
            status_polls: 0,
            pages_programmed: 0,
            data: vec![ERASED; capacity],
            image: None,
            command: Vec::with_capacity(command_len::MAX),
            phase: Phase::Done,
        }
    }

    /// Report busy for `polls` status reads after every page program
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Start without the unlocked bit set
    pub fn locked(mut self) -> Self {
        self.status &= !status::UNLOCKED;
        self
    }

    /// Back the card with a raw image file. Existing contents are loaded and
    /// every programmed page is written through.
    pub fn with_image(mut self, path: &Path) -> Result<Self, BusError> {
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| BusError::Image(format!("{}: {}", path.display(), e)))?;

        let mut existing = Vec::new();
        file.read_to_end(&mut existing)
            .map_err(|e| BusError::Image(format!("{}: {}", path.display(), e)))?;
        let len = existing.len().min(self.data.len());
        self.data[..len].copy_from_slice(&existing[..len]);
        debug!(
            "Opened card image {:?} ({} of {} bytes loaded)",
            path,
            len,
            self.data.len()
        );

        self.image = Some(file);
        Ok(self)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn interrupt_enabled(&self) -> bool {
        self.interrupt_enabled
    }

    /// Number of status commands answered so far
    pub fn status_polls(&self) -> u32 {
        self.status_polls
    }

    pub fn pages_programmed(&self) -> u32 {
        self.pages_programmed
    }

    fn latency(&self) -> usize {
        LATENCY_TABLE[TableIndex::latency(self.id).get() as usize] as usize
    }

    fn wrap(&self, offset: usize) -> Option<usize> {
        offset.checked_rem(self.data.len())
    }

    pub(crate) fn select(&mut self) {
        self.command.clear();
        self.phase = Phase::Command;
    }

    /// End the transaction. Returns true when the card raises its interrupt.
    pub(crate) fn deselect(&mut self) -> bool {
        let phase = std::mem::replace(&mut self.phase, Phase::Done);
        match phase {
            Phase::Program { address, written } if written > 0 => {
                self.finish_program(address);
                self.interrupt_enabled
            }
            _ => false,
        }
    }

    pub(crate) fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.clock_in(byte);
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) {
        for slot in buf.iter_mut() {
            *slot = self.clock_out();
        }
    }

    fn clock_in(&mut self, byte: u8) {
        match &mut self.phase {
            Phase::Command => {
                self.command.push(byte);
                if self.command.len() == expected_len(self.command[0]) {
                    self.execute();
                }
            }
            Phase::Program { address, written } => {
                // Page program wraps inside the 128-byte page
                let page = *address as usize & !(PAGE_SIZE - 1);
                let offset = page + ((*address as usize + *written) & (PAGE_SIZE - 1));
                *written += 1;
                if let Some(offset) = self.wrap(offset) {
                    self.data[offset] = byte;
                }
            }
            Phase::Read { clocks, .. } => *clocks += 1,
            Phase::Respond { .. } | Phase::Done => {
                trace!("card ignoring byte {:#04x}", byte);
            }
        }
    }

    fn clock_out(&mut self) -> u8 {
        let latency = self.latency();
        match &mut self.phase {
            Phase::Respond { bytes, len, pos } => {
                let value = if *pos < *len { bytes[*pos] } else { FLOATING };
                *pos += 1;
                value
            }
            Phase::Read { address, clocks } => {
                let clock = *clocks;
                let address = *address as usize;
                *clocks += 1;
                match clock.checked_sub(latency) {
                    Some(index) => self
                        .wrap(address + index)
                        .map_or(FLOATING, |offset| self.data[offset]),
                    None => FLOATING,
                }
            }
            _ => FLOATING,
        }
    }

    fn execute(&mut self) {
        let op = self.command[0];
        self.phase = match op {
            opcode::IDENTIFY => {
                debug!("card identify: {:#06x}", self.id);
                let [hi, lo] = self.id.to_be_bytes();
                Phase::Respond {
                    bytes: [hi, lo],
                    len: 2,
                    pos: 0,
                }
            }
            opcode::STATUS => {
                self.status_polls += 1;
                let status = if self.busy_polls_remaining > 0 {
                    self.busy_polls_remaining -= 1;
                    (self.status & !status::READY) | status::BUSY
                } else {
                    self.status
                };
                trace!("card status: {:#04x}", status);
                Phase::Respond {
                    bytes: [status, 0],
                    len: 1,
                    pos: 0,
                }
            }
            opcode::CLEAR_STATUS => {
                self.status &= !status::CLEARABLE;
                debug!("card status cleared: {:#04x}", self.status);
                Phase::Done
            }
            opcode::ENABLE_INTERRUPT => {
                self.interrupt_enabled = self.command[1] & 1 != 0;
                debug!("card interrupt enabled: {}", self.interrupt_enabled);
                Phase::Done
            }
            opcode::PAGE_PROGRAM => {
                let address = self.decode_address();
                debug!("card page program: address={:#X}", address);
                Phase::Program {
                    address,
                    written: 0,
                }
            }
            opcode::PAGE_READ => {
                let address = self.decode_address();
                debug!("card page read: address={:#X}", address);
                Phase::Read { address, clocks: 0 }
            }
            _ => {
                warn!("Unimplemented memory card command {:#04x}", op);
                Phase::Done
            }
        };
    }

    fn decode_address(&self) -> u32 {
        let mut field = [0u8; 4];
        field.copy_from_slice(&self.command[1..5]);
        CardAddress::decode(field).offset()
    }

    fn finish_program(&mut self, address: u32) {
        self.pages_programmed += 1;
        self.busy_polls_remaining = self.settle_polls;

        let page = address as usize & !(PAGE_SIZE - 1);
        let Some(start) = self.wrap(page) else {
            return;
        };
        let end = (start + PAGE_SIZE).min(self.data.len());

        if let Some(ref mut file) = self.image {
            if let Err(e) = file.seek(SeekFrom::Start(start as u64)) {
                warn!("Failed to seek card image to {:#X}: {}", start, e);
            } else if let Err(e) = file.write_all(&self.data[start..end]) {
                warn!("Failed to write card image page {:#X}: {}", start, e);
            } else if let Err(e) = file.flush() {
                warn!("Failed to flush card image page {:#X}: {}", start, e);
            } else {
                debug!("Wrote page {:#X} to card image", start);
            }
        }
    }
}

fn expected_len(op: u8) -> usize {
    match op {
        opcode::IDENTIFY => command_len::IDENTIFY,
        opcode::STATUS => command_len::STATUS,
        opcode::CLEAR_STATUS => command_len::CLEAR_STATUS,
        opcode::ENABLE_INTERRUPT => command_len::ENABLE_INTERRUPT,
        opcode::PAGE_PROGRAM => command_len::PAGE_PROGRAM,
        opcode::PAGE_READ => command_len::PAGE_READ,
        // Unknown opcodes are rejected on their first byte
        _ => 1,
    }
}
