//! Serial memory card command set, status bits and geometry tables.
//!
//! # References
//! - <https://www.gc-forever.com/yagcd/chap12.html#sec12>

/// Command opcodes (first byte of every command sequence)
pub mod opcode {
    /// Read the 16-bit card identification word
    pub const IDENTIFY: u8 = 0x85;

    /// Read the 8-bit status register
    pub const STATUS: u8 = 0x83;

    /// Clear error bits in the status register
    pub const CLEAR_STATUS: u8 = 0x89;

    /// Enable or disable the card's EXI interrupt line
    pub const ENABLE_INTERRUPT: u8 = 0x81;

    /// Program one 128-byte page
    pub const PAGE_PROGRAM: u8 = 0xF2;

    /// Read starting at an address
    pub const PAGE_READ: u8 = 0x52;
}

/// Command lengths in bytes, opcode included
pub mod command_len {
    pub const IDENTIFY: usize = 2;
    pub const STATUS: usize = 2;
    pub const CLEAR_STATUS: usize = 1;
    pub const ENABLE_INTERRUPT: usize = 2;
    pub const PAGE_PROGRAM: usize = 5;
    pub const PAGE_READ: usize = 5;

    /// Longest command sequence
    pub const MAX: usize = 5;
}

/// Status register bit flags
pub mod status {
    /// Card is ready to accept a command
    pub const READY: u8 = 0x01;
    /// Last program operation failed
    pub const PROGRAM_ERROR: u8 = 0x08;
    /// Last erase operation failed
    pub const ERASE_ERROR: u8 = 0x10;
    /// Card is in sleep mode
    pub const SLEEP: u8 = 0x20;
    /// Card has been unlocked
    pub const UNLOCKED: u8 = 0x40;
    /// Card is busy with an internal operation
    pub const BUSY: u8 = 0x80;

    /// Bits cleared by the clear-status command
    pub const CLEARABLE: u8 = PROGRAM_ERROR | ERASE_ERROR;
}

/// Number of dummy bytes clocked out before read data is valid, by latency class
pub const LATENCY_TABLE: [u32; 8] = [
    0x0000_0004,
    0x0000_0008,
    0x0000_0010,
    0x0000_0020,
    0x0000_0030,
    0x0000_0080,
    0x0000_0100,
    0x0000_0200,
];

/// Erase sector size in bytes, by sector size class.
///
/// Classes 6 and 7 are unassigned; a card reporting one of them has no
/// defined geometry.
pub const SECTOR_SIZE_TABLE: [u32; 8] = [
    0x0000_2000,
    0x0000_4000,
    0x0000_8000,
    0x0001_0000,
    0x0002_0000,
    0x0004_0000,
    0x0000_0000,
    0x0000_0000,
];

/// Largest dummy-byte run any latency class needs
pub const MAX_LATENCY: usize = 0x200;

/// Bytes written by one page-program DMA
pub const PAGE_SIZE: usize = 128;

/// Bytes fetched by one page-read DMA
pub const READ_SIZE: usize = 0x200;

/// Highest byte offset (exclusive) the 4-byte address field can express
pub const ADDRESS_LIMIT: u32 = 1 << 23;

/// Identification words of first-party cards
pub mod card_id {
    /// 59-block card (4 Mbit)
    pub const MEMCARD_59: u16 = 0x0004;
    /// 251-block card (16 Mbit)
    pub const MEMCARD_251: u16 = 0x0010;
    /// 1019-block card (64 Mbit)
    pub const MEMCARD_1019: u16 = 0x0040;
    /// 2043-block card (128 Mbit)
    pub const MEMCARD_2043: u16 = 0x0080;
}
