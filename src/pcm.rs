//! PCM Variant Descriptions
//!
//! Static facts about each supported controller family: where the kernel
//! lives, whether a loader has to go in first, how big the flash image is,
//! and which kernel-side queries the family answers.

use serde::{Deserialize, Serialize};

/// Controller hardware families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardwareType {
    /// 512 KiB / 1 MiB V6 and V8 controllers, the most common targets.
    P01P59,
    P04,
    P08,
    P10,
    P12,
}

/// Static description of a PCM variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcmInfo {
    pub hardware_type: HardwareType,
    /// RAM address the kernel is linked for.
    pub kernel_base_address: u32,
    /// True when the family's receive buffer is too small for the kernel
    /// and a loader must be uploaded first.
    pub loader_required: bool,
    /// RAM address the loader is linked for.
    pub loader_base_address: u32,
    /// Flash image size in bytes.
    pub image_size: usize,
    /// Kernel answers the flash-chip-id query.
    pub flash_id_support: bool,
    /// Kernel answers CRC queries over memory ranges.
    pub flash_crc_support: bool,
    /// Largest block the kernel will return for one read request.
    pub kernel_max_block_size: usize,
    /// Kernel answers the version query.
    pub kernel_version_support: bool,
    /// Seed/key algorithm id this family uses.
    pub key_algorithm: u8,
}

impl PcmInfo {
    /// P01 (512 KiB) and P59 (1 MiB) share everything but image size.
    pub fn p01(image_size: usize) -> Self {
        Self {
            hardware_type: HardwareType::P01P59,
            kernel_base_address: 0xFF8000,
            loader_required: false,
            loader_base_address: 0,
            image_size,
            flash_id_support: true,
            flash_crc_support: true,
            kernel_max_block_size: 4096,
            kernel_version_support: true,
            key_algorithm: 40,
        }
    }

    pub fn p59() -> Self {
        Self::p01(0x100000)
    }

    pub fn p10() -> Self {
        Self {
            hardware_type: HardwareType::P10,
            kernel_base_address: 0xFFB800,
            loader_required: true,
            loader_base_address: 0xFFC000,
            image_size: 0x80000,
            flash_id_support: true,
            flash_crc_support: true,
            kernel_max_block_size: 2048,
            kernel_version_support: true,
            key_algorithm: 13,
        }
    }

    pub fn p12() -> Self {
        Self {
            hardware_type: HardwareType::P12,
            kernel_base_address: 0xFF2000,
            loader_required: true,
            loader_base_address: 0xFF9890,
            image_size: 0x100000,
            flash_id_support: true,
            flash_crc_support: false,
            kernel_max_block_size: 2048,
            kernel_version_support: true,
            key_algorithm: 45,
        }
    }
}
