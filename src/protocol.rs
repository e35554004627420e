//! VPW Protocol Message Handling
//!
//! Builders and parsers for the J1850 VPW request/response dialog. Everything
//! here is a pure function over frames: no I/O, no blocking, no retries. The
//! query engine decides what to do with a parse failure; this module only
//! classifies it.
//!
//! Frame format: PRI DST SRC MODE [SUBMODE] DATA... A response carries the
//! request mode OR-ed with 0x40 and the destination/source bytes swapped.
//! Block-priority frames append a 16-bit big-endian additive checksum.

use tracing::debug;

use crate::error::{ObdError, Result};
use crate::frame::{add_block_checksum, verify_block_checksum, VpwFrame};
use crate::pcm::HardwareType;

/// Frame priority bytes.
pub mod priority {
    /// Physical addressing, default priority.
    pub const PHYSICAL_0: u8 = 0x6C;
    /// Physical addressing, high priority. Seen from some modules on upload
    /// permission replies.
    pub const PHYSICAL_0_HIGH: u8 = 0x68;
    /// Block transfer priority. Carries the additive checksum.
    pub const BLOCK: u8 = 0x6D;
    /// Functional addressing, used by the legacy clear-DTC broadcast.
    pub const FUNCTIONAL: u8 = 0x68;
}

/// Module ids on the VPW bus.
pub mod module {
    pub const PCM: u8 = 0x10;
    pub const TOOL: u8 = 0xF0;
    pub const BROADCAST: u8 = 0xFE;
    /// Functional "legislated diagnostics" address used by the clear-DTC
    /// frame.
    pub const FUNCTIONAL_DIAG: u8 = 0x6A;
    /// Tool source id in functionally addressed frames.
    pub const FUNCTIONAL_TOOL: u8 = 0xF1;
}

/// Human-readable name for a module id, for log and status display.
pub fn module_name(id: u8) -> &'static str {
    match id {
        0x10 => "Powertrain Control Module",
        0x18 => "Transmission Control Module",
        0x28 => "Brake Control Module",
        0x40 => "Body Control Module",
        0x58 => "Inflatable Restraint Module",
        0x60 => "Instrument Panel Cluster",
        0x80 => "Radio",
        0x99 => "HVAC Control Module",
        0xA6 => "Theft Deterrent Module",
        0xF0 => "Scan Tool",
        0xFE => "Broadcast",
        _ => "Unknown Module",
    }
}

/// Service mode bytes.
pub mod mode {
    /// Legacy OBD clear diagnostic information.
    pub const CLEAR_DTCS: u8 = 0x04;
    /// Return the PCM from kernel execution to normal operation.
    pub const EXIT_KERNEL: u8 = 0x20;
    /// Security access (seed and key exchange).
    pub const SECURITY_ACCESS: u8 = 0x27;
    /// Silence normal traffic while the bus is needed for block transfers.
    pub const DISABLE_NORMAL_TX: u8 = 0x28;
    /// Request permission to upload to PCM RAM.
    pub const UPLOAD_REQUEST: u8 = 0x34;
    /// Read a memory block through the running kernel (24-bit address).
    pub const READ_MEMORY: u8 = 0x35;
    /// Transfer a payload chunk into PCM RAM. Also the mode of the kernel's
    /// memory-read replies (payload travels PCM-to-tool).
    pub const UPLOAD: u8 = 0x36;
    /// Read a memory block at a 32-bit address.
    pub const READ_MEMORY_32: u8 = 0x37;
    /// Write a settings block.
    pub const WRITE_BLOCK: u8 = 0x3B;
    /// Read a settings block (VIN, serial, ids).
    pub const READ_BLOCK: u8 = 0x3C;
    /// Kernel information queries (version, flash id, CRC, OS id).
    pub const KERNEL_INFO: u8 = 0x3D;
    /// Tool-present heartbeat.
    pub const TOOL_PRESENT: u8 = 0x3F;
    /// Negative response marker.
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
    /// Prepare for high-speed mode; every module votes.
    pub const HIGH_SPEED_PREPARE: u8 = 0xA0;
    /// Switch to high-speed mode now.
    pub const HIGH_SPEED: u8 = 0xA1;
    /// OR-ed into the request mode to form the response mode.
    pub const RESPONSE_FLAG: u8 = 0x40;
}

/// Settings block ids for `READ_BLOCK` / `WRITE_BLOCK`.
pub mod block_id {
    pub const VIN1: u8 = 0x01;
    pub const VIN2: u8 = 0x02;
    pub const VIN3: u8 = 0x03;
    pub const HARDWARE_ID: u8 = 0x04;
    pub const SERIAL1: u8 = 0x05;
    pub const SERIAL2: u8 = 0x06;
    pub const SERIAL3: u8 = 0x07;
    pub const CALIBRATION_ID: u8 = 0x08;
    pub const OPERATING_SYSTEM_ID: u8 = 0x0A;
    pub const BCC: u8 = 0x14;
    pub const MEC: u8 = 0xA0;
}

/// Kernel info query submodes.
pub mod kernel_info {
    pub const VERSION: u8 = 0x00;
    pub const FLASH_ID: u8 = 0x01;
    pub const CRC: u8 = 0x02;
    pub const OS_ID: u8 = 0x03;
}

/// Copy-type byte in upload chunks.
pub mod copy_type {
    /// Copy into RAM and wait for more.
    pub const COPY: u8 = 0x00;
    /// Copy into RAM, then jump to the load address.
    pub const EXECUTE: u8 = 0x80;
    /// Validate the chunk without storing it.
    pub const TEST_WRITE: u8 = 0x44;
}

/// Memory-read reply submodes.
pub mod read_submode {
    pub const NORMAL: u8 = 0x01;
    pub const RLE: u8 = 0x02;
}

/// Outcome of a security-access seed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedResponse {
    AlreadyUnlocked,
    Seed(u16),
}

/// Status byte of an unlock reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    Allowed,
    Denied,
    InvalidKey,
    TooManyAttempts,
    DelayRequired,
    Unknown(u8),
}

impl UnlockStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x34 => UnlockStatus::Allowed,
            0x33 => UnlockStatus::Denied,
            0x35 => UnlockStatus::InvalidKey,
            0x36 => UnlockStatus::TooManyAttempts,
            0x37 => UnlockStatus::DelayRequired,
            other => UnlockStatus::Unknown(other),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            UnlockStatus::Allowed => "Unlock succeeded",
            UnlockStatus::Denied => "Unlock denied",
            UnlockStatus::InvalidKey => "Invalid key",
            UnlockStatus::TooManyAttempts => "Too many failed attempts",
            UnlockStatus::DelayRequired => "Retry delay not yet expired",
            UnlockStatus::Unknown(_) => "Unrecognized unlock status",
        }
    }
}

/// One module's vote in the high-speed permission phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighSpeedVote {
    pub module: u8,
    pub granted: bool,
}

/// Vote byte meaning "switch granted".
pub const HIGH_SPEED_GRANTED: u8 = 0x01;

// ---------------------------------------------------------------------------
// Request builders
// ---------------------------------------------------------------------------

pub fn read_block_request(block: u8) -> VpwFrame {
    VpwFrame::new(vec![
        priority::PHYSICAL_0,
        module::PCM,
        module::TOOL,
        mode::READ_BLOCK,
        block,
    ])
}

pub fn seed_request() -> VpwFrame {
    VpwFrame::new(vec![
        priority::PHYSICAL_0,
        module::PCM,
        module::TOOL,
        mode::SECURITY_ACCESS,
        0x01,
    ])
}

pub fn unlock_request(key: u16) -> VpwFrame {
    VpwFrame::new(vec![
        priority::PHYSICAL_0,
        module::PCM,
        module::TOOL,
        mode::SECURITY_ACCESS,
        0x02,
        (key >> 8) as u8,
        (key & 0xFF) as u8,
    ])
}

/// Asks the PCM for permission to upload `size` bytes to `address`.
///
/// P10 and P12 hardware accepts only the short header form; everything else
/// wants the declared size and destination.
pub fn upload_request(hardware: HardwareType, size: u16, address: u32) -> VpwFrame {
    let mut bytes = vec![
        priority::PHYSICAL_0,
        module::PCM,
        module::TOOL,
        mode::UPLOAD_REQUEST,
    ];
    match hardware {
        HardwareType::P10 | HardwareType::P12 => {}
        _ => {
            bytes.push((size >> 8) as u8);
            bytes.push((size & 0xFF) as u8);
            bytes.push((address >> 16) as u8);
            bytes.push((address >> 8) as u8);
            bytes.push((address & 0xFF) as u8);
        }
    }
    VpwFrame::new(bytes)
}

/// Builds one upload chunk: block-priority header, payload, checksum.
pub fn upload_packet(copy: u8, address: u32, payload: &[u8]) -> VpwFrame {
    let mut bytes = Vec::with_capacity(payload.len() + 12);
    bytes.extend_from_slice(&[
        priority::BLOCK,
        module::PCM,
        module::TOOL,
        mode::UPLOAD,
        copy,
        (payload.len() >> 8) as u8,
        (payload.len() & 0xFF) as u8,
        (address >> 16) as u8,
        (address >> 8) as u8,
        (address & 0xFF) as u8,
    ]);
    bytes.extend_from_slice(payload);
    add_block_checksum(&mut bytes);
    VpwFrame::new(bytes)
}

/// Builds a kernel memory-read request. Addresses past 0xFFFFFF use the
/// 32-bit form.
pub fn read_memory_request(length: u16, address: u32) -> VpwFrame {
    let mut bytes = vec![priority::PHYSICAL_0, module::PCM, module::TOOL];
    if address <= 0xFF_FFFF {
        bytes.push(mode::READ_MEMORY);
        bytes.push(read_submode::NORMAL);
        bytes.push((length >> 8) as u8);
        bytes.push((length & 0xFF) as u8);
        bytes.push((address >> 16) as u8);
        bytes.push((address >> 8) as u8);
        bytes.push((address & 0xFF) as u8);
    } else {
        bytes.push(mode::READ_MEMORY_32);
        bytes.push(read_submode::NORMAL);
        bytes.push((length >> 8) as u8);
        bytes.push((length & 0xFF) as u8);
        bytes.push((address >> 24) as u8);
        bytes.push((address >> 16) as u8);
        bytes.push((address >> 8) as u8);
        bytes.push((address & 0xFF) as u8);
    }
    VpwFrame::new(bytes)
}

fn kernel_info_request(submode: u8) -> VpwFrame {
    VpwFrame::new(vec![
        priority::BLOCK,
        module::PCM,
        module::TOOL,
        mode::KERNEL_INFO,
        submode,
    ])
}

pub fn kernel_version_request() -> VpwFrame {
    kernel_info_request(kernel_info::VERSION)
}

pub fn flash_id_request() -> VpwFrame {
    kernel_info_request(kernel_info::FLASH_ID)
}

pub fn os_id_from_kernel_request() -> VpwFrame {
    kernel_info_request(kernel_info::OS_ID)
}

/// Asks the kernel for a CRC32 over `length` bytes at `address`.
pub fn kernel_crc_request(address: u32, length: u32) -> VpwFrame {
    VpwFrame::new(vec![
        priority::BLOCK,
        module::PCM,
        module::TOOL,
        mode::KERNEL_INFO,
        kernel_info::CRC,
        (length >> 16) as u8,
        (length >> 8) as u8,
        (length & 0xFF) as u8,
        (address >> 16) as u8,
        (address >> 8) as u8,
        (address & 0xFF) as u8,
    ])
}

pub fn tool_present() -> VpwFrame {
    VpwFrame::new(vec![
        priority::PHYSICAL_0,
        module::BROADCAST,
        module::TOOL,
        mode::TOOL_PRESENT,
    ])
}

pub fn exit_kernel() -> VpwFrame {
    VpwFrame::new(vec![
        priority::PHYSICAL_0,
        module::PCM,
        module::TOOL,
        mode::EXIT_KERNEL,
    ])
}

/// Legacy functionally-addressed clear, answered by every emissions module.
pub fn clear_dtcs_functional() -> VpwFrame {
    VpwFrame::new(vec![
        priority::FUNCTIONAL,
        module::FUNCTIONAL_DIAG,
        module::FUNCTIONAL_TOOL,
        mode::CLEAR_DTCS,
    ])
}

pub fn clear_dtcs_broadcast() -> VpwFrame {
    VpwFrame::new(vec![
        priority::PHYSICAL_0,
        module::BROADCAST,
        module::TOOL,
        mode::CLEAR_DTCS,
    ])
}

pub fn disable_normal_tx() -> VpwFrame {
    VpwFrame::new(vec![
        priority::PHYSICAL_0,
        module::BROADCAST,
        module::TOOL,
        mode::DISABLE_NORMAL_TX,
    ])
}

pub fn high_speed_permission_request() -> VpwFrame {
    VpwFrame::new(vec![
        priority::PHYSICAL_0,
        module::BROADCAST,
        module::TOOL,
        mode::HIGH_SPEED_PREPARE,
    ])
}

pub fn begin_high_speed() -> VpwFrame {
    VpwFrame::new(vec![
        priority::PHYSICAL_0,
        module::BROADCAST,
        module::TOOL,
        mode::HIGH_SPEED,
    ])
}

// ---------------------------------------------------------------------------
// Response parsers
// ---------------------------------------------------------------------------

/// Returns the refusal code if `frame` is a negative response to
/// `request_mode` addressed to the tool.
fn refusal_of(frame: &VpwFrame, request_mode: u8) -> Option<u8> {
    if frame.len() >= 5
        && frame.destination() == module::TOOL
        && frame.mode() == mode::NEGATIVE_RESPONSE
        && frame.submode() == request_mode
    {
        Some(frame.payload().first().copied().unwrap_or(0))
    } else {
        None
    }
}

/// Three-step prefix check shared by most parsers: match the expected
/// response header, classify a negative response as `Refused`, call
/// everything else `UnexpectedResponse`.
fn expect_response(frame: &VpwFrame, pri: u8, request_mode: u8) -> Result<()> {
    if frame.len() < 4 {
        return Err(ObdError::Truncated {
            needed: 4,
            got: frame.len(),
        });
    }
    if frame.priority() == pri
        && frame.destination() == module::TOOL
        && frame.source() == module::PCM
        && frame.mode() == request_mode | mode::RESPONSE_FLAG
    {
        return Ok(());
    }
    if let Some(code) = refusal_of(frame, request_mode) {
        return Err(ObdError::Refused {
            mode: request_mode,
            code,
        });
    }
    Err(ObdError::UnexpectedResponse)
}

fn need(frame: &VpwFrame, len: usize) -> Result<()> {
    if frame.len() < len {
        Err(ObdError::Truncated {
            needed: len,
            got: frame.len(),
        })
    } else {
        Ok(())
    }
}

/// Parses a settings-block read reply, returning the data bytes after the
/// echoed block id.
pub fn parse_block_response<'a>(frame: &'a VpwFrame, block: u8) -> Result<&'a [u8]> {
    expect_response(frame, priority::PHYSICAL_0, mode::READ_BLOCK)?;
    need(frame, 5)?;
    if frame.submode() != block {
        return Err(ObdError::UnexpectedResponse);
    }
    Ok(frame.payload())
}

/// Interprets a 4-byte big-endian block (hardware id, OS id, calibration id).
pub fn parse_block_u32(frame: &VpwFrame, block: u8) -> Result<u32> {
    let data = parse_block_response(frame, block)?;
    if data.len() < 4 {
        return Err(ObdError::Truncated {
            needed: 9,
            got: frame.len(),
        });
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

pub fn parse_seed(frame: &VpwFrame) -> Result<SeedResponse> {
    expect_response(frame, priority::PHYSICAL_0, mode::SECURITY_ACCESS)?;
    if frame.submode() != 0x01 {
        return Err(ObdError::UnexpectedResponse);
    }
    let payload = frame.payload();
    if payload.len() == 1 && payload[0] == 0x37 {
        return Ok(SeedResponse::AlreadyUnlocked);
    }
    if payload.len() < 2 {
        return Err(ObdError::Truncated {
            needed: 7,
            got: frame.len(),
        });
    }
    let seed = u16::from_be_bytes([payload[0], payload[1]]);
    if seed == 0 {
        Ok(SeedResponse::AlreadyUnlocked)
    } else {
        Ok(SeedResponse::Seed(seed))
    }
}

pub fn parse_unlock_response(frame: &VpwFrame) -> Result<UnlockStatus> {
    expect_response(frame, priority::PHYSICAL_0, mode::SECURITY_ACCESS)?;
    need(frame, 5)?;
    // The reply either echoes submode 0x02 and carries the status after it,
    // or carries the status directly in byte 4.
    let status = if frame.submode() == 0x02 {
        *frame.payload().first().ok_or(ObdError::Truncated {
            needed: 6,
            got: frame.len(),
        })?
    } else {
        frame.submode()
    };
    Ok(UnlockStatus::from_byte(status))
}

/// Parses the reply to an upload-permission request.
///
/// Most PCMs answer at the default physical priority; a few answer at the
/// high physical priority. Both are accepted, the unusual one is noted.
pub fn parse_upload_permission(frame: &VpwFrame) -> Result<()> {
    if frame.len() >= 4 && frame.priority() == priority::PHYSICAL_0_HIGH {
        debug!(
            "upload permission arrived at high priority: {:02X?}",
            frame.as_bytes()
        );
        let expect = mode::UPLOAD_REQUEST | mode::RESPONSE_FLAG;
        if frame.destination() == module::TOOL
            && frame.source() == module::PCM
            && frame.mode() == expect
        {
            return Ok(());
        }
    }
    expect_response(frame, priority::PHYSICAL_0, mode::UPLOAD_REQUEST)
}

/// Parses the acknowledgment of one upload chunk. Byte 4 must be zero;
/// either priority is accepted.
pub fn parse_upload_ack(frame: &VpwFrame) -> Result<()> {
    if frame.len() < 4 {
        return Err(ObdError::Truncated {
            needed: 4,
            got: frame.len(),
        });
    }
    let ok_priority =
        frame.priority() == priority::BLOCK || frame.priority() == priority::PHYSICAL_0;
    if ok_priority
        && frame.destination() == module::TOOL
        && frame.source() == module::PCM
        && frame.mode() == mode::UPLOAD | mode::RESPONSE_FLAG
    {
        if frame.submode() == 0x00 {
            return Ok(());
        }
        return Err(ObdError::Refused {
            mode: mode::UPLOAD,
            code: frame.submode(),
        });
    }
    if let Some(code) = refusal_of(frame, mode::UPLOAD) {
        return Err(ObdError::Refused {
            mode: mode::UPLOAD,
            code,
        });
    }
    Err(ObdError::UnexpectedResponse)
}

/// Parses a kernel memory-read reply and returns the payload bytes.
///
/// The reply is a block-priority upload frame from the PCM: submode selects
/// normal or RLE payload, the header echoes the length and address, and the
/// trailing two bytes checksum everything before them.
pub fn parse_payload_read(frame: &VpwFrame, expected_address: u32) -> Result<Vec<u8>> {
    need(frame, 10)?;
    let bytes = frame.as_bytes();
    let prefix_ok = (frame.priority() == priority::BLOCK
        || frame.priority() == priority::PHYSICAL_0)
        && frame.destination() == module::TOOL
        && frame.source() == module::PCM
        && frame.mode() == mode::UPLOAD;
    if !prefix_ok {
        if let Some(code) = refusal_of(frame, mode::READ_MEMORY) {
            return Err(ObdError::Refused {
                mode: mode::READ_MEMORY,
                code,
            });
        }
        if let Some(code) = refusal_of(frame, mode::READ_MEMORY_32) {
            return Err(ObdError::Refused {
                mode: mode::READ_MEMORY_32,
                code,
            });
        }
        return Err(ObdError::UnexpectedResponse);
    }

    let declared = u16::from_be_bytes([bytes[5], bytes[6]]) as usize;
    let address = u32::from_be_bytes([0, bytes[7], bytes[8], bytes[9]]);
    if address != expected_address {
        return Err(ObdError::UnexpectedResponse);
    }

    match frame.submode() {
        read_submode::NORMAL => {
            need(frame, declared + 12)?;
            let message = &bytes[..declared + 12];
            if !verify_block_checksum(message) {
                return Err(ObdError::protocol(format!(
                    "block checksum mismatch in read of {declared} bytes at 0x{address:06X}"
                )));
            }
            Ok(bytes[10..10 + declared].to_vec())
        }
        read_submode::RLE => Err(ObdError::protocol(
            "RLE-compressed read responses are not supported",
        )),
        other => Err(ObdError::protocol(format!(
            "unknown read submode 0x{other:02X}"
        ))),
    }
}

fn parse_kernel_info(frame: &VpwFrame, submode: u8) -> Result<u32> {
    expect_response(frame, priority::BLOCK, mode::KERNEL_INFO)?;
    if frame.submode() != submode {
        return Err(ObdError::UnexpectedResponse);
    }
    let payload = frame.payload();
    if payload.len() < 4 {
        return Err(ObdError::Truncated {
            needed: 9,
            got: frame.len(),
        });
    }
    Ok(u32::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

pub fn parse_kernel_version(frame: &VpwFrame) -> Result<u32> {
    parse_kernel_info(frame, kernel_info::VERSION)
}

pub fn parse_flash_id(frame: &VpwFrame) -> Result<u32> {
    parse_kernel_info(frame, kernel_info::FLASH_ID)
}

pub fn parse_os_id_from_kernel(frame: &VpwFrame) -> Result<u32> {
    parse_kernel_info(frame, kernel_info::OS_ID)
}

/// Parses a kernel CRC reply, checking the echoed range.
pub fn parse_kernel_crc(frame: &VpwFrame, address: u32, length: u32) -> Result<u32> {
    expect_response(frame, priority::BLOCK, mode::KERNEL_INFO)?;
    if frame.submode() != kernel_info::CRC {
        return Err(ObdError::UnexpectedResponse);
    }
    need(frame, 15)?;
    let bytes = frame.as_bytes();
    let echoed_len = u32::from_be_bytes([0, bytes[5], bytes[6], bytes[7]]);
    let echoed_addr = u32::from_be_bytes([0, bytes[8], bytes[9], bytes[10]]);
    if echoed_len != length || echoed_addr != address {
        return Err(ObdError::UnexpectedResponse);
    }
    Ok(u32::from_be_bytes([
        bytes[11], bytes[12], bytes[13], bytes[14],
    ]))
}

/// Parses one module's vote in the high-speed permission phase.
pub fn parse_high_speed_reply(frame: &VpwFrame) -> Result<HighSpeedVote> {
    if frame.len() < 4 {
        return Err(ObdError::Truncated {
            needed: 4,
            got: frame.len(),
        });
    }
    let expect = mode::HIGH_SPEED_PREPARE | mode::RESPONSE_FLAG;
    if frame.priority() == priority::PHYSICAL_0
        && frame.destination() == module::TOOL
        && frame.mode() == expect
    {
        return Ok(HighSpeedVote {
            module: frame.source(),
            granted: frame.submode() == HIGH_SPEED_GRANTED,
        });
    }
    if frame.mode() == mode::NEGATIVE_RESPONSE
        && frame.destination() == module::TOOL
        && frame.submode() == mode::HIGH_SPEED_PREPARE
    {
        return Ok(HighSpeedVote {
            module: frame.source(),
            granted: false,
        });
    }
    Err(ObdError::UnexpectedResponse)
}
