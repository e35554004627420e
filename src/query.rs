//! Query Engine
//!
//! The single chokepoint for "this request should have received a response."
//! Send the request, filter incoming frames until one matches, retry within
//! bounds, give up with `Timeout`. Unrelated bus traffic is discarded, never
//! re-queued, so a stale frame can never satisfy a later request.

use tracing::debug;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::device::Device;
use crate::error::{ObdError, Result};
use crate::frame::VpwFrame;
use crate::notifier::ToolPresentNotifier;

/// Bool-like cancellation signal, settable by the host, checked by the core
/// before every round-trip and between retries.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ObdError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Send attempts before giving up.
const MAX_SEND_ATTEMPTS: usize = 2;
/// Receive iterations per send attempt.
const MAX_RECEIVE_ITERATIONS: usize = 50;
/// Empty receives tolerated before moving to the next send attempt.
const MAX_TIMEOUTS: usize = 5;

/// One request/response exchange. The response type is decided by the
/// filter function at `execute` time.
pub struct Query<'a, B, F> {
    device: &'a mut dyn Device,
    build_request: B,
    filter: F,
    cancel: &'a CancelToken,
    notifier: Option<&'a mut ToolPresentNotifier>,
}

impl<'a, B, F> Query<'a, B, F> {
    pub fn new(
        device: &'a mut dyn Device,
        build_request: B,
        filter: F,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            device,
            build_request,
            filter,
            cancel,
            notifier: None,
        }
    }

    /// Keeps the tool-present heartbeat alive between receive timeouts.
    pub fn with_notifier(mut self, notifier: &'a mut ToolPresentNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Runs the exchange.
    ///
    /// Filter outcomes steer the loop: `UnexpectedResponse` and `Truncated`
    /// are unrelated traffic and are discarded; `Refused` is remembered and
    /// skipped (negative responses are common background noise during block
    /// transfers); anything else is a hard failure and returns immediately.
    /// If the attempts run out, a remembered refusal beats a bare `Timeout`.
    pub async fn execute<T>(mut self) -> Result<T>
    where
        B: Fn() -> VpwFrame,
        F: Fn(&VpwFrame) -> Result<T>,
    {
        self.device.clear_message_queue();
        let mut last_refusal: Option<ObdError> = None;

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            self.cancel.check()?;
            let request = (self.build_request)();
            debug!("query TX (attempt {attempt}): {:02X?}", request.as_bytes());
            self.device.send_message(&request).await?;

            let mut timeouts = 0;
            for _ in 0..MAX_RECEIVE_ITERATIONS {
                self.cancel.check()?;
                match self.device.receive_message().await {
                    Some(frame) => match (self.filter)(&frame) {
                        Ok(value) => return Ok(value),
                        Err(ObdError::UnexpectedResponse) | Err(ObdError::Truncated { .. }) => {
                            debug!("query ignoring frame: {:02X?}", frame.as_bytes());
                        }
                        Err(refusal @ ObdError::Refused { .. }) => {
                            debug!("query noting refusal: {:02X?}", frame.as_bytes());
                            last_refusal = Some(refusal);
                        }
                        Err(other) => return Err(other),
                    },
                    None => {
                        timeouts += 1;
                        if timeouts >= MAX_TIMEOUTS {
                            break;
                        }
                        if let Some(notifier) = self.notifier.as_deref_mut() {
                            notifier.force_notify(&mut *self.device).await?;
                        }
                    }
                }
            }
        }

        Err(last_refusal.unwrap_or(ObdError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use crate::protocol::{self, block_id};

    fn vin1_reply() -> VpwFrame {
        VpwFrame::new(vec![0x6C, 0xF0, 0x10, 0x7C, 0x01, 0x06, 0x31, 0x47, 0x4E, 0x45, 0x4B])
    }

    #[tokio::test]
    async fn returns_matching_response() {
        let mut device = MockDevice::new();
        device.initialize().await.unwrap();
        device.stage_replies(vec![
            // Unrelated chatter from the cluster, then the answer.
            VpwFrame::new(vec![0x6C, 0xF0, 0x60, 0x7C, 0x01]),
            vin1_reply(),
        ]);

        let cancel = CancelToken::new();
        let data = Query::new(
            &mut device,
            || protocol::read_block_request(block_id::VIN1),
            |frame: &VpwFrame| protocol::parse_block_response(frame, block_id::VIN1).map(<[u8]>::to_vec),
            &cancel,
        )
        .execute()
        .await
        .unwrap();
        assert_eq!(data, vec![0x06, 0x31, 0x47, 0x4E, 0x45, 0x4B]);
    }

    #[tokio::test]
    async fn times_out_when_nothing_matches() {
        let mut device = MockDevice::new();
        device.initialize().await.unwrap();
        let log = device.log();

        let cancel = CancelToken::new();
        let result: Result<Vec<u8>> = Query::new(
            &mut device,
            || protocol::read_block_request(block_id::VIN1),
            |frame: &VpwFrame| protocol::parse_block_response(frame, block_id::VIN1).map(<[u8]>::to_vec),
            &cancel,
        )
        .execute()
        .await;

        assert!(matches!(result, Err(ObdError::Timeout)));
        assert_eq!(log.sends_of_mode(protocol::mode::READ_BLOCK), 2);
    }

    #[tokio::test]
    async fn refusal_survives_to_the_end() {
        let mut device = MockDevice::new();
        device.initialize().await.unwrap();
        device.stage_reply(VpwFrame::new(vec![0x6C, 0xF0, 0x10, 0x7F, 0x3C, 0x31]));

        let cancel = CancelToken::new();
        let result: Result<Vec<u8>> = Query::new(
            &mut device,
            || protocol::read_block_request(block_id::VIN1),
            |frame: &VpwFrame| protocol::parse_block_response(frame, block_id::VIN1).map(<[u8]>::to_vec),
            &cancel,
        )
        .execute()
        .await;

        assert!(matches!(result, Err(ObdError::Refused { code: 0x31, .. })));
    }

    #[tokio::test]
    async fn hard_parse_failures_return_immediately() {
        let mut device = MockDevice::new();
        device.initialize().await.unwrap();
        device.stage_reply(vin1_reply());

        let cancel = CancelToken::new();
        let result: Result<Vec<u8>> = Query::new(
            &mut device,
            || protocol::read_block_request(block_id::VIN1),
            |_: &VpwFrame| Err(ObdError::protocol("bad checksum")),
            &cancel,
        )
        .execute()
        .await;

        assert!(matches!(result, Err(ObdError::Protocol(_))));
    }

    #[tokio::test]
    async fn cancellation_wins_over_everything() {
        let mut device = MockDevice::new();
        device.initialize().await.unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<Vec<u8>> = Query::new(
            &mut device,
            || protocol::read_block_request(block_id::VIN1),
            |frame: &VpwFrame| protocol::parse_block_response(frame, block_id::VIN1).map(<[u8]>::to_vec),
            &cancel,
        )
        .execute()
        .await;

        assert!(matches!(result, Err(ObdError::Cancelled)));
    }
}
