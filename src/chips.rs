//! Flash Chip Registry
//!
//! Maps the 32-bit manufacturer/device id reported by the kernel to the
//! chip's sector layout. The layout drives CRC verification after a bulk
//! read and gives user messages something better than a hex id.

use serde::{Deserialize, Serialize};

/// What a flash sector holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockType {
    Boot,
    Parameter,
    Calibration,
    OperatingSystem,
}

/// One contiguous region of the flash image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRange {
    pub address: u32,
    pub length: u32,
    pub block_type: BlockType,
}

const fn range(address: u32, length: u32, block_type: BlockType) -> MemoryRange {
    MemoryRange {
        address,
        length,
        block_type,
    }
}

/// Static description of a flash part. Serializable for host display;
/// the table itself is compiled in.
#[derive(Debug, Clone, Serialize)]
pub struct FlashChip {
    pub id: u32,
    pub name: &'static str,
    pub size: u32,
    pub ranges: &'static [MemoryRange],
}

const RANGES_512K: &[MemoryRange] = &[
    range(0x000000, 0x002000, BlockType::Boot),
    range(0x002000, 0x002000, BlockType::Parameter),
    range(0x004000, 0x004000, BlockType::Parameter),
    range(0x008000, 0x018000, BlockType::Calibration),
    range(0x020000, 0x060000, BlockType::OperatingSystem),
];

const RANGES_1M: &[MemoryRange] = &[
    range(0x000000, 0x004000, BlockType::Boot),
    range(0x004000, 0x004000, BlockType::Parameter),
    range(0x008000, 0x078000, BlockType::Calibration),
    range(0x080000, 0x080000, BlockType::OperatingSystem),
];

const CHIPS: &[FlashChip] = &[
    FlashChip {
        id: 0x0089_4471,
        name: "Intel 28F400B",
        size: 0x80000,
        ranges: RANGES_512K,
    },
    FlashChip {
        id: 0x0089_889D,
        name: "Intel 28F800B",
        size: 0x100000,
        ranges: RANGES_1M,
    },
    FlashChip {
        id: 0x0001_22AB,
        name: "AMD AM29F400BB",
        size: 0x80000,
        ranges: RANGES_512K,
    },
    FlashChip {
        id: 0x0001_2258,
        name: "AMD AM29F800BB",
        size: 0x100000,
        ranges: RANGES_1M,
    },
];

/// Looks a chip up by id. Unknown ids come back with an empty range list so
/// a read can still complete, just without CRC verification.
pub fn lookup(id: u32) -> FlashChip {
    for chip in CHIPS {
        if chip.id == id {
            return chip.clone();
        }
    }
    FlashChip {
        id,
        name: "Unknown flash chip",
        size: 0,
        ranges: &[],
    }
}
