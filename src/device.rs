//! Device Port Abstraction
//!
//! The capability set every concrete VPW transport implements: pass-through
//! interfaces, ELM/STN-class scan tools, and the scripted mock used by the
//! test suite. The core talks to `dyn Device` and nothing else.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::frame::VpwFrame;

/// VPW signaling rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpwSpeed {
    /// 10.4 kbit/s.
    Standard,
    /// 41.6 kbit/s.
    FourX,
}

/// Named read-timeout situations. The core names the scenario; each device
/// maps it to milliseconds for its own hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutScenario {
    Minimum,
    ReadProperty,
    ReadMemoryBlock,
    SendKernel,
    ReadCrc,
    DataLogging,
    Maximum,
}

/// Static description of what a device can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Largest frame the device will transmit.
    pub max_send_size: usize,
    /// Largest frame the device will deliver.
    pub max_receive_size: usize,
    /// Largest frame usable for kernel upload chunks.
    pub max_kernel_send_size: usize,
    /// Largest frame usable for flash write chunks.
    pub max_flash_write_send_size: usize,
    pub supports_4x: bool,
    pub supports_single_dpid_logging: bool,
    pub supports_stream_logging: bool,
    /// User preference: actually use 4x for reads and writes when available.
    pub enable_4x_read_write: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            max_send_size: 4096 + 12,
            max_receive_size: 4096 + 12,
            max_kernel_send_size: 4096 + 12,
            max_flash_write_send_size: 1024 + 12,
            supports_4x: false,
            supports_single_dpid_logging: true,
            supports_stream_logging: false,
            enable_4x_read_write: false,
        }
    }
}

/// Abstract byte-transport to a VPW interface.
///
/// Devices are created at session start, initialized once, and dropped at
/// session end. The receive side is a bounded FIFO fed by the device's own
/// drain task; `receive_message` returning `None` means "nothing arrived
/// within the current timeout scenario", never an error.
#[async_trait]
pub trait Device: Send {
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Opens the transport, selects J1850 VPW at standard speed, installs
    /// the frame filter, and reads battery voltage as a connection check.
    async fn initialize(&mut self) -> Result<()>;

    /// Blocking send with the device's write timeout.
    async fn send_message(&mut self, frame: &VpwFrame) -> Result<()>;

    /// Takes one frame from the receive queue, waiting up to the current
    /// timeout scenario's duration.
    async fn receive_message(&mut self) -> Option<VpwFrame>;

    /// Selects a read-timeout scenario; returns the previous one.
    async fn set_timeout(&mut self, scenario: TimeoutScenario) -> Result<TimeoutScenario>;

    /// Reconfigures the transport's signaling rate.
    async fn set_vpw_speed(&mut self, speed: VpwSpeed) -> Result<()>;

    /// Discards everything in the receive queue.
    fn clear_message_queue(&mut self);

    /// Wipes the hardware receive and transmit buffers.
    async fn clear_message_buffer(&mut self) -> Result<()>;

    /// Battery voltage at the OBD port, for connection diagnostics.
    async fn read_voltage(&mut self) -> Result<f64>;

    /// Display name for logs and status lines.
    fn describe(&self) -> String;
}

/// Bounded FIFO between a device's drain task and the core.
///
/// Arrival order is preserved; when full, the newest frame is dropped so the
/// queue never reorders.
#[derive(Clone)]
pub struct FrameQueue {
    inner: Arc<Mutex<VecDeque<VpwFrame>>>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, frame: VpwFrame) {
        let mut queue = self.inner.lock().expect("frame queue poisoned");
        if queue.len() >= self.capacity {
            warn!("receive queue full, dropping frame {:02X?}", frame.as_bytes());
            return;
        }
        queue.push_back(frame);
    }

    pub fn pop(&self) -> Option<VpwFrame> {
        self.inner.lock().expect("frame queue poisoned").pop_front()
    }

    pub fn clear(&self) {
        self.inner.lock().expect("frame queue poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("frame queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
