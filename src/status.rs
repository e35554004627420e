//! Status Observer
//!
//! Long operations narrate progress through this interface. Hosts plug in a
//! UI; the default routes everything to the log so headless use still leaves
//! a trace.

use tracing::{debug, info};

/// Consumer of progress and log lines from long-running operations.
///
/// Every method has a no-op default so observers implement only what they
/// display.
pub trait StatusObserver: Send + Sync {
    fn status_update_activity(&self, _activity: &str) {}
    fn status_update_percent_done(&self, _percent: &str) {}
    fn status_update_time_remaining(&self, _remaining: &str) {}
    fn status_update_kbps(&self, _kbps: &str) {}
    fn status_update_retry_count(&self, _retries: &str) {}
    fn status_update_progress_bar(&self, _fraction: f64, _indeterminate: bool) {}
    fn status_update_reset(&self) {}
    fn add_user_message(&self, _message: &str) {}
    fn add_debug_message(&self, _message: &str) {}
}

/// Default observer: user messages at info, the rest at debug.
pub struct TracingObserver;

impl StatusObserver for TracingObserver {
    fn status_update_activity(&self, activity: &str) {
        info!("{activity}");
    }

    fn status_update_percent_done(&self, percent: &str) {
        debug!("progress: {percent}");
    }

    fn status_update_time_remaining(&self, remaining: &str) {
        debug!("remaining: {remaining}");
    }

    fn status_update_kbps(&self, kbps: &str) {
        debug!("throughput: {kbps}");
    }

    fn status_update_retry_count(&self, retries: &str) {
        debug!("retries: {retries}");
    }

    fn add_user_message(&self, message: &str) {
        info!("{message}");
    }

    fn add_debug_message(&self, message: &str) {
        debug!("{message}");
    }
}
