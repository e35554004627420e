//! Scripted Mock Device
//!
//! The unit-test substrate for everything above the device port. Responses
//! can be pre-seeded into the queue, staged to appear after the next send,
//! or produced by a frame-handler closure that inspects each outgoing frame.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::device::{Device, DeviceCapabilities, FrameQueue, TimeoutScenario, VpwSpeed};
use crate::error::{ObdError, Result};
use crate::frame::VpwFrame;

/// Produces zero or more canned replies for an outgoing frame.
pub type MockFrameHandler = Box<dyn FnMut(&VpwFrame) -> Vec<VpwFrame> + Send>;

/// Shared view of a mock's traffic, usable after the device has been moved
/// into a `Vehicle`.
#[derive(Clone)]
pub struct MockLog {
    sent: Arc<Mutex<Vec<VpwFrame>>>,
    speed: Arc<Mutex<VpwSpeed>>,
}

impl MockLog {
    pub fn sent_frames(&self) -> Vec<VpwFrame> {
        self.sent.lock().expect("mock log poisoned").clone()
    }

    /// Count of sent frames carrying the given mode byte.
    pub fn sends_of_mode(&self, mode: u8) -> usize {
        self.sent_frames()
            .iter()
            .filter(|f| f.len() >= 4 && f.mode() == mode)
            .count()
    }

    pub fn current_speed(&self) -> VpwSpeed {
        *self.speed.lock().expect("mock log poisoned")
    }
}

pub struct MockDevice {
    capabilities: DeviceCapabilities,
    queue: FrameQueue,
    staged: VecDeque<Vec<VpwFrame>>,
    handler: Option<MockFrameHandler>,
    log: MockLog,
    scenario: TimeoutScenario,
    initialized: bool,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities {
                supports_4x: true,
                ..DeviceCapabilities::default()
            },
            queue: FrameQueue::new(512),
            staged: VecDeque::new(),
            handler: None,
            log: MockLog {
                sent: Arc::new(Mutex::new(Vec::new())),
                speed: Arc::new(Mutex::new(VpwSpeed::Standard)),
            },
            scenario: TimeoutScenario::Minimum,
            initialized: false,
        }
    }

    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Puts a frame straight into the receive queue.
    pub fn seed_frame(&mut self, frame: VpwFrame) {
        self.queue.push(frame);
    }

    /// Stages replies that enter the receive queue when the next unmatched
    /// send happens. Batches are consumed in order, one per send.
    pub fn stage_replies(&mut self, batch: Vec<VpwFrame>) {
        self.staged.push_back(batch);
    }

    pub fn stage_reply(&mut self, frame: VpwFrame) {
        self.stage_replies(vec![frame]);
    }

    /// Installs a closure consulted on every send. Handler output is queued
    /// after any staged batch for that send.
    pub fn set_frame_handler(&mut self, handler: MockFrameHandler) {
        self.handler = Some(handler);
    }

    /// Handle for inspecting traffic after the device is moved away.
    pub fn log(&self) -> MockLog {
        self.log.clone()
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for MockDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    async fn initialize(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    async fn send_message(&mut self, frame: &VpwFrame) -> Result<()> {
        if !self.initialized {
            return Err(ObdError::protocol("mock device not initialized"));
        }
        self.log
            .sent
            .lock()
            .expect("mock log poisoned")
            .push(frame.clone());
        if let Some(batch) = self.staged.pop_front() {
            for reply in batch {
                self.queue.push(reply);
            }
        }
        if let Some(handler) = self.handler.as_mut() {
            for reply in handler(frame) {
                self.queue.push(reply);
            }
        }
        Ok(())
    }

    async fn receive_message(&mut self) -> Option<VpwFrame> {
        self.queue.pop()
    }

    async fn set_timeout(&mut self, scenario: TimeoutScenario) -> Result<TimeoutScenario> {
        Ok(std::mem::replace(&mut self.scenario, scenario))
    }

    async fn set_vpw_speed(&mut self, speed: VpwSpeed) -> Result<()> {
        if speed == VpwSpeed::FourX && !self.capabilities.supports_4x {
            return Err(ObdError::protocol("mock device does not support 4x"));
        }
        *self.log.speed.lock().expect("mock log poisoned") = speed;
        Ok(())
    }

    fn clear_message_queue(&mut self) {
        self.queue.clear();
    }

    async fn clear_message_buffer(&mut self) -> Result<()> {
        self.queue.clear();
        Ok(())
    }

    async fn read_voltage(&mut self) -> Result<f64> {
        Ok(12.6)
    }

    fn describe(&self) -> String {
        "Mock device".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn staged_replies_arrive_after_send() {
        let mut mock = MockDevice::new();
        mock.initialize().await.unwrap();
        mock.stage_reply(VpwFrame::new(vec![0x6C, 0xF0, 0x10, 0x7C]));

        assert!(mock.receive_message().await.is_none());
        mock.send_message(&VpwFrame::new(vec![0x6C, 0x10, 0xF0, 0x3C]))
            .await
            .unwrap();
        assert!(mock.receive_message().await.is_some());
    }

    #[tokio::test]
    async fn handler_sees_every_send() {
        let mut mock = MockDevice::new();
        mock.initialize().await.unwrap();
        mock.set_frame_handler(Box::new(|frame| {
            if frame.mode() == 0x3C {
                vec![VpwFrame::new(vec![0x6C, 0xF0, 0x10, 0x7C, frame.submode()])]
            } else {
                Vec::new()
            }
        }));

        mock.send_message(&VpwFrame::new(vec![0x6C, 0x10, 0xF0, 0x3C, 0x05]))
            .await
            .unwrap();
        let reply = mock.receive_message().await.unwrap();
        assert_eq!(reply.submode(), 0x05);
    }

    #[tokio::test]
    async fn log_survives_moving_the_device() {
        let mut mock = MockDevice::new();
        let log = mock.log();
        mock.initialize().await.unwrap();
        mock.send_message(&VpwFrame::new(vec![0x6C, 0xFE, 0xF0, 0x3F]))
            .await
            .unwrap();
        drop(mock);
        assert_eq!(log.sends_of_mode(0x3F), 1);
    }
}
