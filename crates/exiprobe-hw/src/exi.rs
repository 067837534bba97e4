//! # References
//! - <https://www.gc-forever.com/yagcd/chap5.html#sec5.9>
//! - <https://wiibrew.org/wiki/Hardware/External_Interface>

/// Number of EXI channels that can host a memory card (slot A and slot B)
pub const MEMCARD_CHANNELS: usize = 2;

/// Number of chip-select lines per channel
pub const DEVICES_PER_CHANNEL: usize = 3;

/// Chip-select slot that memory cards answer on
pub const MEMCARD_DEVICE: u8 = 0;

/// EXI clock selection, as written to the CLK field of the channel parameter register
pub mod clock {
    pub const SPEED_1MHZ: u8 = 0;
    pub const SPEED_2MHZ: u8 = 1;
    pub const SPEED_4MHZ: u8 = 2;
    pub const SPEED_8MHZ: u8 = 3;
    pub const SPEED_16MHZ: u8 = 4;
    pub const SPEED_32MHZ: u8 = 5;

    /// Bus frequency in Hz for each clock selection, indexed by the values above
    pub const FREQUENCY_HZ: [u32; 6] = [
        1_000_000, 2_000_000, 4_000_000, 8_000_000, 16_000_000, 32_000_000,
    ];
}

/// Channel state flags
pub mod state {
    /// A DMA transfer is in progress
    pub const DMA: u32 = 0x0001;
    /// An immediate transfer is in progress
    pub const IMM: u32 = 0x0002;
    /// A device is selected
    pub const SELECT: u32 = 0x0004;
    /// A device is attached to the channel
    pub const ATTACH: u32 = 0x0008;
    /// The channel is locked
    pub const LOCKED: u32 = 0x0010;
}
