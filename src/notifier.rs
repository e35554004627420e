//! Tool-Present Heartbeat
//!
//! Modules on a VPW bus arbitrate among themselves; a silent scan tool loses
//! its claim on the bus and long operations start failing with collisions.
//! The notifier keeps a tool-present frame going out at most once per gate
//! interval, with a forced variant for the moments where staleness is not
//! acceptable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::device::Device;
use crate::error::Result;
use crate::protocol;

/// Injectable monotonic time source. The notifier gate and the bulk-read
/// progress estimator both measure elapsed time through this.
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary epoch.
    fn now(&self) -> Duration;
}

/// Wall-clock backed by `Instant`.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Hand-cranked clock for tests.
#[derive(Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

/// Minimum quiet time between unforced notifications.
pub const NOTIFY_GATE: Duration = Duration::from_millis(800);

/// Time-gated emitter of tool-present frames.
pub struct ToolPresentNotifier {
    clock: Arc<dyn Clock>,
    last_notification: Option<Duration>,
}

impl ToolPresentNotifier {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            last_notification: None,
        }
    }

    /// Sends a tool-present frame if the gate interval has elapsed.
    pub async fn notify(&mut self, device: &mut dyn Device) -> Result<()> {
        let now = self.clock.now();
        let due = match self.last_notification {
            Some(last) => now.saturating_sub(last) >= NOTIFY_GATE,
            None => true,
        };
        if due {
            self.send(device, now).await?;
        }
        Ok(())
    }

    /// Sends a tool-present frame unconditionally.
    pub async fn force_notify(&mut self, device: &mut dyn Device) -> Result<()> {
        let now = self.clock.now();
        self.send(device, now).await
    }

    async fn send(&mut self, device: &mut dyn Device, now: Duration) -> Result<()> {
        debug!("sending tool-present notification");
        device.send_message(&protocol::tool_present()).await?;
        self.last_notification = Some(now);
        Ok(())
    }
}
