//! Card geometry from the identification word.
//!
//! The id packs a size class in bits 2-7 and two 3-bit table indices that the
//! firmware extracts with a 32-bit rotate-and-mask rather than a plain shift.
//! Decoding keeps that arithmetic so values match what the hardware reports.

use crate::error::{Error, Result};
use exiprobe_hw::memcard::{LATENCY_TABLE, SECTOR_SIZE_TABLE};

/// Index into one of the 8-entry geometry tables. Only constructible through
/// the rotate-and-mask extraction, so it is always in `0..8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableIndex(u8);

impl TableIndex {
    fn extract(id: u16, rotate: u32) -> Self {
        let field = (id as u32).rotate_left(rotate) & 0x1C;
        Self((field >> 2) as u8)
    }

    pub fn latency(id: u16) -> Self {
        Self::extract(id, 26)
    }

    pub fn sector_size(id: u16) -> Self {
        Self::extract(id, 23)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    fn lookup(self, table: &[u32; 8]) -> u32 {
        table[self.0 as usize]
    }
}

/// Geometry decoded once per card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardGeometry {
    pub id: u16,
    pub size_mb: u32,
    /// Dummy bytes to clock out between a page-read command and its data
    pub latency: u32,
    pub sector_size: u32,
    pub block_count: u32,
}

impl CardGeometry {
    pub fn decode(id: u16) -> Result<Self> {
        let size_mb = ((id & 0xFC) >> 3) as u32;

        let latency_index = TableIndex::latency(id);
        let latency = latency_index.lookup(&LATENCY_TABLE);

        let sector_index = TableIndex::sector_size(id);
        let sector_size = sector_index.lookup(&SECTOR_SIZE_TABLE);
        if sector_size == 0 {
            return Err(Error::UndefinedGeometry {
                id,
                index: sector_index.get(),
            });
        }

        let block_count = ((size_mb << 20) >> 3) / sector_size;

        Ok(Self {
            id,
            size_mb,
            latency,
            sector_size,
            block_count,
        })
    }
}

impl std::fmt::Display for CardGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id:{:#06x}, latency:{:#010x}, cardSize:{}MB, sectorSize:{:#010x}, cardBlocks:{:#010x}",
            self.id, self.latency, self.size_mb, self.sector_size, self.block_count
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exiprobe_hw::memcard::card_id;

    #[test]
    fn index_fields_sit_at_bits_8_and_11() {
        assert_eq!(TableIndex::latency(0x0700).get(), 7);
        assert_eq!(TableIndex::latency(0x00FF).get(), 0);
        assert_eq!(TableIndex::sector_size(0x3800).get(), 7);
        assert_eq!(TableIndex::sector_size(0x0700).get(), 0);
    }

    #[test]
    fn smallest_card_has_zero_size() {
        let geometry = CardGeometry::decode(card_id::MEMCARD_59).unwrap();
        assert_eq!(geometry.size_mb, 0);
        assert_eq!(geometry.block_count, 0);
        assert_eq!(geometry.latency, 4);
        assert_eq!(geometry.sector_size, 0x2000);
    }

    #[test]
    fn largest_card() {
        let geometry = CardGeometry::decode(card_id::MEMCARD_2043).unwrap();
        assert_eq!(geometry.size_mb, 16);
        assert_eq!(geometry.sector_size, 0x2000);
        assert_eq!(geometry.block_count, 256);
    }

    #[test]
    fn latency_and_sector_classes() {
        // latency class 5, sector class 2
        let id = (5 << 8) | (2 << 11) | 0x80;
        let geometry = CardGeometry::decode(id).unwrap();
        assert_eq!(geometry.latency, 0x80);
        assert_eq!(geometry.sector_size, 0x8000);
        assert_eq!(geometry.block_count, (16 << 17) / 0x8000);
    }

    #[test]
    fn unassigned_sector_classes_are_undefined() {
        for class in [6u16, 7] {
            let id = (class << 11) | 0x80;
            match CardGeometry::decode(id) {
                Err(Error::UndefinedGeometry { id: got, index }) => {
                    assert_eq!(got, id);
                    assert_eq!(index as u16, class);
                }
                other => panic!("expected undefined geometry, got {:?}", other),
            }
        }
    }

    #[test]
    fn display_matches_probe_log() {
        let geometry = CardGeometry::decode(card_id::MEMCARD_2043).unwrap();
        assert_eq!(
            geometry.to_string(),
            "id:0x0080, latency:0x00000004, cardSize:16MB, sectorSize:0x00002000, cardBlocks:0x00000100"
        );
    }
}
