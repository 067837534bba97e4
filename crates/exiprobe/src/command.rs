//! Memory card command encoding.
//!
//! Every command is an opcode followed by a fixed number of operand bytes. The
//! encoder is pure; it only produces the byte sequence the driver clocks out
//! with an immediate write.

use crate::error::{Error, Result};
use exiprobe_hw::memcard::{ADDRESS_LIMIT, command_len, opcode};

/// Byte offset on the card that fits the 4-byte address field.
///
/// The field packs bits 17-22, 9-16, 7-8 and 0-6 of the offset into four bytes
/// and drops everything above bit 22, so only offsets below
/// [`ADDRESS_LIMIT`] are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CardAddress(u32);

impl CardAddress {
    pub fn new(offset: u32) -> Result<Self> {
        if offset >= ADDRESS_LIMIT {
            return Err(Error::AddressOutOfRange(offset));
        }
        Ok(Self(offset))
    }

    /// Keep only the bits the field can carry
    pub const fn masked(offset: u32) -> Self {
        Self(offset & (ADDRESS_LIMIT - 1))
    }

    pub fn offset(self) -> u32 {
        self.0
    }

    pub fn encode(self) -> [u8; 4] {
        let o = self.0;
        [
            ((o >> 17) & 0x3F) as u8,
            ((o >> 9) & 0xFF) as u8,
            ((o >> 7) & 0x03) as u8,
            (o & 0x7F) as u8,
        ]
    }

    /// Inverse of [`CardAddress::encode`]; bits outside the field masks are ignored
    pub fn decode(field: [u8; 4]) -> Self {
        let offset = ((field[0] as u32 & 0x3F) << 17)
            | ((field[1] as u32) << 9)
            | ((field[2] as u32 & 0x03) << 7)
            | (field[3] as u32 & 0x7F);
        Self(offset)
    }
}

impl TryFrom<u32> for CardAddress {
    type Error = Error;

    fn try_from(offset: u32) -> Result<Self> {
        Self::new(offset)
    }
}

/// A card command and its operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Identify,
    Status,
    ClearStatus,
    EnableInterrupt(bool),
    PageProgram(CardAddress),
    PageRead(CardAddress),
}

impl Command {
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Identify => opcode::IDENTIFY,
            Command::Status => opcode::STATUS,
            Command::ClearStatus => opcode::CLEAR_STATUS,
            Command::EnableInterrupt(_) => opcode::ENABLE_INTERRUPT,
            Command::PageProgram(_) => opcode::PAGE_PROGRAM,
            Command::PageRead(_) => opcode::PAGE_READ,
        }
    }

    pub fn encode(&self) -> CommandBytes {
        let mut bytes = [0u8; command_len::MAX];
        bytes[0] = self.opcode();
        let len = match self {
            Command::Identify => command_len::IDENTIFY,
            Command::Status => command_len::STATUS,
            Command::ClearStatus => command_len::CLEAR_STATUS,
            Command::EnableInterrupt(enable) => {
                bytes[1] = *enable as u8;
                command_len::ENABLE_INTERRUPT
            }
            Command::PageProgram(addr) | Command::PageRead(addr) => {
                bytes[1..5].copy_from_slice(&addr.encode());
                command_len::PAGE_PROGRAM
            }
        };
        CommandBytes { bytes, len }
    }
}

/// Encoded command, at most [`command_len::MAX`] bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBytes {
    bytes: [u8; command_len::MAX],
    len: usize,
}

impl CommandBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl std::ops::Deref for CommandBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Display for CommandBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:#04x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(offset: u32) -> CardAddress {
        CardAddress::new(offset).unwrap()
    }

    #[test]
    fn fixed_commands() {
        assert_eq!(Command::Identify.encode().as_bytes(), &[0x85, 0x00]);
        assert_eq!(Command::Status.encode().as_bytes(), &[0x83, 0x00]);
        assert_eq!(Command::ClearStatus.encode().as_bytes(), &[0x89]);
        assert_eq!(Command::EnableInterrupt(true).encode().as_bytes(), &[0x81, 0x01]);
        assert_eq!(Command::EnableInterrupt(false).encode().as_bytes(), &[0x81, 0x00]);
    }

    #[test]
    fn program_and_read_at_probe_offset() {
        // 0xa000 = block 0x50 << 9
        assert_eq!(
            Command::PageProgram(addr(0xa000)).encode().as_bytes(),
            &[0xF2, 0x00, 0x50, 0x00, 0x00]
        );
        assert_eq!(
            Command::PageRead(addr(0xa000)).encode().as_bytes(),
            &[0x52, 0x00, 0x50, 0x00, 0x00]
        );
    }

    #[test]
    fn address_field_layout() {
        assert_eq!(addr(0x7F).encode(), [0x00, 0x00, 0x00, 0x7F]);
        assert_eq!(addr(0x180).encode(), [0x00, 0x00, 0x03, 0x00]);
        assert_eq!(addr(0x1_FE00).encode(), [0x00, 0xFF, 0x00, 0x00]);
        assert_eq!(addr(0x7E_0000).encode(), [0x3F, 0x00, 0x00, 0x00]);
        assert_eq!(addr(ADDRESS_LIMIT - 1).encode(), [0x3F, 0xFF, 0x03, 0x7F]);
    }

    #[test]
    fn rejects_offsets_past_field() {
        assert!(matches!(
            CardAddress::new(ADDRESS_LIMIT),
            Err(Error::AddressOutOfRange(0x80_0000))
        ));
        assert!(CardAddress::try_from(0xFF_FFFF).is_err());
    }

    #[test]
    fn masked_drops_high_bits() {
        assert_eq!(CardAddress::masked(0x80_a000).offset(), 0xa000);
    }

    #[test]
    fn decode_ignores_reserved_bits() {
        assert_eq!(CardAddress::decode([0xFF, 0x00, 0xFC, 0x80]).offset(), 0x7E_0000);
    }

    #[test]
    fn display_hex_bytes() {
        assert_eq!(Command::ClearStatus.encode().to_string(), "0x89");
        assert_eq!(Command::Status.encode().to_string(), "0x83 0x00");
    }
}
