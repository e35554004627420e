//! Vehicle Operations
//!
//! The high-level API: property reads, security unlock, speed negotiation,
//! and session cleanup. Everything here follows the same shape: pick a
//! timeout scenario, clear the queue, send requests through the query
//! engine, parse replies with the protocol module.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::{Device, TimeoutScenario, VpwSpeed};
use crate::error::{refusal_description, ObdError, Result};
use crate::frame::VpwFrame;
use crate::notifier::{Clock, SystemClock, ToolPresentNotifier};
use crate::protocol::{self, block_id, SeedResponse, UnlockStatus};
use crate::query::{CancelToken, Query};
use crate::status::{StatusObserver, TracingObserver};

/// Computes unlock keys from seeds. Key algorithms are proprietary per PCM
/// family, so the host injects the implementation; the core only knows the
/// algorithm id.
pub trait SeedKeyAlgorithm: Send + Sync {
    /// Returns the key for `seed`, or `None` when `algorithm_id` is unknown.
    fn compute_key(&self, algorithm_id: u8, seed: u16) -> Option<u16>;
}

impl<F> SeedKeyAlgorithm for F
where
    F: Fn(u8, u16) -> Option<u16> + Send + Sync,
{
    fn compute_key(&self, algorithm_id: u8, seed: u16) -> Option<u16> {
        self(algorithm_id, seed)
    }
}

/// Pause between the duplicated clear-DTC frames; other modules compete for
/// the bus right after a clear.
const CLEAR_DTC_SPACING: Duration = Duration::from_millis(250);

/// A session with one vehicle. Owns the device; dropping the vehicle drops
/// the device. Callers must not run two operations concurrently on the same
/// vehicle.
pub struct Vehicle {
    pub(crate) device: Box<dyn Device>,
    pub(crate) notifier: ToolPresentNotifier,
    pub(crate) key_algorithm: Box<dyn SeedKeyAlgorithm>,
    pub(crate) status: Arc<dyn StatusObserver>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Vehicle {
    pub fn new(device: Box<dyn Device>, key_algorithm: Box<dyn SeedKeyAlgorithm>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        Self {
            notifier: ToolPresentNotifier::new(clock.clone()),
            device,
            key_algorithm,
            status: Arc::new(TracingObserver),
            clock,
        }
    }

    pub fn with_status(mut self, status: Arc<dyn StatusObserver>) -> Self {
        self.status = status;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.notifier = ToolPresentNotifier::new(clock.clone());
        self.clock = clock;
        self
    }

    /// Opens the device and logs the battery voltage as a connection check.
    pub async fn init(&mut self) -> Result<()> {
        self.device.initialize().await?;
        let voltage = self.device.read_voltage().await?;
        info!("connected to {} ({voltage:.1} V)", self.device.describe());
        self.status
            .add_user_message(&format!("Battery voltage: {voltage:.1} V"));
        Ok(())
    }

    /// One settings-block read through the query engine.
    pub(crate) async fn read_block(&mut self, block: u8, cancel: &CancelToken) -> Result<Vec<u8>> {
        Query::new(
            self.device.as_mut(),
            move || protocol::read_block_request(block),
            move |frame: &VpwFrame| protocol::parse_block_response(frame, block).map(<[u8]>::to_vec),
            cancel,
        )
        .with_notifier(&mut self.notifier)
        .execute()
        .await
    }

    async fn read_block_u32(&mut self, block: u8) -> Result<u32> {
        self.device.set_timeout(TimeoutScenario::ReadProperty).await?;
        let cancel = CancelToken::new();
        Query::new(
            self.device.as_mut(),
            move || protocol::read_block_request(block),
            move |frame: &VpwFrame| protocol::parse_block_u32(frame, block),
            &cancel,
        )
        .with_notifier(&mut self.notifier)
        .execute()
        .await
    }

    /// Reads the 17-character VIN from its three settings blocks.
    ///
    /// Blocks are read one at a time so a failure names the block that
    /// caused it; concatenation happens only after all three succeed.
    pub async fn query_vin(&mut self) -> Result<String> {
        self.device.set_timeout(TimeoutScenario::ReadProperty).await?;
        let cancel = CancelToken::new();
        let part1 = self.read_block(block_id::VIN1, &cancel).await?;
        let part2 = self.read_block(block_id::VIN2, &cancel).await?;
        let part3 = self.read_block(block_id::VIN3, &cancel).await?;

        // The first byte of the first block is a status byte, not a VIN
        // character.
        if part1.len() < 6 || part2.len() < 6 || part3.len() < 6 {
            return Err(ObdError::protocol("VIN block shorter than expected"));
        }
        let mut vin = Vec::with_capacity(17);
        vin.extend_from_slice(&part1[1..6]);
        vin.extend_from_slice(&part2[..6]);
        vin.extend_from_slice(&part3[..6]);
        String::from_utf8(vin).map_err(|_| ObdError::protocol("VIN is not ASCII"))
    }

    /// Reads the 12-character serial number from its three settings blocks.
    pub async fn query_serial(&mut self) -> Result<String> {
        self.device.set_timeout(TimeoutScenario::ReadProperty).await?;
        let cancel = CancelToken::new();
        let mut serial = Vec::with_capacity(12);
        for block in [block_id::SERIAL1, block_id::SERIAL2, block_id::SERIAL3] {
            let part = self.read_block(block, &cancel).await?;
            if part.len() < 4 {
                return Err(ObdError::protocol("serial block shorter than expected"));
            }
            serial.extend_from_slice(&part[..4]);
        }
        String::from_utf8(serial).map_err(|_| ObdError::protocol("serial is not ASCII"))
    }

    /// Reads the broadcast code.
    pub async fn query_bcc(&mut self) -> Result<String> {
        self.device.set_timeout(TimeoutScenario::ReadProperty).await?;
        let cancel = CancelToken::new();
        let data = self.read_block(block_id::BCC, &cancel).await?;
        if data.len() < 4 {
            return Err(ObdError::protocol("BCC block shorter than expected"));
        }
        String::from_utf8(data[..4].to_vec()).map_err(|_| ObdError::protocol("BCC is not ASCII"))
    }

    /// Reads the manufacturer enable counter.
    pub async fn query_mec(&mut self) -> Result<u8> {
        self.device.set_timeout(TimeoutScenario::ReadProperty).await?;
        let cancel = CancelToken::new();
        let data = self.read_block(block_id::MEC, &cancel).await?;
        data.first()
            .copied()
            .ok_or_else(|| ObdError::protocol("MEC block is empty"))
    }

    pub async fn query_hardware_id(&mut self) -> Result<u32> {
        self.read_block_u32(block_id::HARDWARE_ID).await
    }

    pub async fn query_operating_system_id(&mut self) -> Result<u32> {
        self.read_block_u32(block_id::OPERATING_SYSTEM_ID).await
    }

    pub async fn query_calibration_id(&mut self) -> Result<u32> {
        self.read_block_u32(block_id::CALIBRATION_ID).await
    }

    /// Runs the seed/key handshake.
    ///
    /// Status codes become user-visible messages; the return value is simply
    /// whether the PCM ended up unlocked. An unknown algorithm id is a hard
    /// error so a misconfigured profile cannot fail silently.
    pub async fn unlock_ecu(&mut self, algorithm_id: u8) -> Result<bool> {
        self.device.set_timeout(TimeoutScenario::ReadProperty).await?;
        let cancel = CancelToken::new();

        let seed = Query::new(
            self.device.as_mut(),
            protocol::seed_request,
            protocol::parse_seed,
            &cancel,
        )
        .with_notifier(&mut self.notifier)
        .execute()
        .await?;

        let seed = match seed {
            SeedResponse::AlreadyUnlocked => {
                self.status.add_user_message("PCM is already unlocked");
                return Ok(true);
            }
            SeedResponse::Seed(seed) => seed,
        };
        debug!("seed received: 0x{seed:04X}");

        let key = match self.key_algorithm.compute_key(algorithm_id, seed) {
            Some(key) => key,
            None => {
                let message = format!("No key algorithm with id {algorithm_id} is available");
                self.status.add_user_message(&message);
                return Err(ObdError::Protocol(message));
            }
        };

        let status = Query::new(
            self.device.as_mut(),
            move || protocol::unlock_request(key),
            protocol::parse_unlock_response,
            &cancel,
        )
        .with_notifier(&mut self.notifier)
        .execute()
        .await?;

        self.status.add_user_message(status.description());
        Ok(status == UnlockStatus::Allowed)
    }

    /// Broadcasts the high-speed permission query and gathers votes until
    /// the bus goes quiet. `Some(modules)` when every responder granted,
    /// `None` when anyone refused.
    pub async fn request_high_speed_permission(&mut self) -> Result<Option<Vec<u8>>> {
        self.device.set_timeout(TimeoutScenario::ReadProperty).await?;
        self.device.clear_message_queue();
        self.device
            .send_message(&protocol::high_speed_permission_request())
            .await?;

        let mut granted = Vec::new();
        let mut refused = false;
        while let Some(frame) = self.device.receive_message().await {
            match protocol::parse_high_speed_reply(&frame) {
                Ok(vote) if vote.granted => {
                    debug!("{} grants high speed", protocol::module_name(vote.module));
                    granted.push(vote.module);
                }
                Ok(vote) => {
                    warn!("{} refuses high speed", protocol::module_name(vote.module));
                    self.status.add_user_message(&format!(
                        "{} refused the switch to 4x",
                        protocol::module_name(vote.module)
                    ));
                    refused = true;
                }
                Err(_) => debug!("ignoring unrelated frame: {:02X?}", frame.as_bytes()),
            }
        }

        if refused {
            Ok(None)
        } else {
            Ok(Some(granted))
        }
    }

    /// Negotiates the switch to 4x: permission phase, the begin broadcast,
    /// a short refusal window, then the transport reconfiguration.
    pub async fn set_vpw_4x(&mut self) -> Result<()> {
        if !self.device.capabilities().supports_4x {
            return Err(ObdError::protocol(format!(
                "{} cannot signal at 4x",
                self.device.describe()
            )));
        }

        let permission = self.request_high_speed_permission().await?;
        if permission.is_none() {
            return Err(ObdError::protocol("a module refused high-speed mode"));
        }

        self.device.send_message(&protocol::begin_high_speed()).await?;

        // Late objections arrive in the window before the bus actually
        // switches.
        tokio::time::sleep(Duration::from_millis(250)).await;
        while let Some(frame) = self.device.receive_message().await {
            if frame.len() >= 5
                && frame.mode() == protocol::mode::NEGATIVE_RESPONSE
                && frame.submode() == protocol::mode::HIGH_SPEED
            {
                let code = frame.payload().first().copied().unwrap_or(0);
                return Err(ObdError::protocol(format!(
                    "{} objected to high speed: {}",
                    protocol::module_name(frame.source()),
                    refusal_description(code)
                )));
            }
        }

        self.device.set_vpw_speed(VpwSpeed::FourX).await?;
        self.notifier.force_notify(self.device.as_mut()).await?;
        info!("bus switched to 4x");
        Ok(())
    }

    /// Sends a frame without expecting any reply.
    pub(crate) async fn send_fire_and_forget(&mut self, frame: VpwFrame) {
        if let Err(e) = self.device.send_message(&frame).await {
            warn!("fire-and-forget send failed: {e}");
        }
    }

    /// Ends a session: exit any running kernel (at both speeds when the
    /// device can do 4x), return to standard speed, clear DTCs. Failures
    /// are logged, never raised.
    pub async fn cleanup(&mut self) {
        debug!("cleaning up session");
        if self.device.capabilities().supports_4x {
            self.send_fire_and_forget(protocol::exit_kernel()).await;
            if let Err(e) = self.device.set_vpw_speed(VpwSpeed::Standard).await {
                warn!("could not return to standard speed: {e}");
            }
        }
        self.send_fire_and_forget(protocol::exit_kernel()).await;

        // Two copies of each clear frame; other modules compete for the bus
        // right after a clear.
        for _ in 0..2 {
            self.send_fire_and_forget(protocol::clear_dtcs_functional()).await;
            self.send_fire_and_forget(protocol::clear_dtcs_broadcast()).await;
            tokio::time::sleep(CLEAR_DTC_SPACING).await;
        }
        self.device.clear_message_queue();
    }
}
