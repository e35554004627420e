//! # pcmlink
//!
//! Reads, writes, and logs the flash memory and runtime parameters of GM
//! powertrain control modules over the SAE J1850 VPW bus, through
//! pass-through diagnostic interfaces and ELM/STN scan tools.
//!
//! The crate is the dialog core: byte-exact frame building and parsing, the
//! seed/key security handshake, RAM kernel upload and execution, bulk flash
//! reads with CRC verification, 1x/4x bus speed negotiation, and the
//! retry/timeout fabric that keeps all of it alive on a shared, noisy,
//! half-duplex bus. Hosts supply the UI, saved profiles, and any vendor
//! pass-through bindings as implementations of [`device::Device`].

pub mod chips;
pub mod device;
pub mod elm;
pub mod error;
pub mod eval;
pub mod frame;
pub mod kernel;
pub mod mock;
pub mod notifier;
pub mod pcm;
pub mod protocol;
pub mod query;
pub mod status;
pub mod vehicle;

pub use device::{Device, DeviceCapabilities, TimeoutScenario, VpwSpeed};
pub use error::{ObdError, Result};
pub use frame::VpwFrame;
pub use notifier::{Clock, ManualClock, SystemClock, ToolPresentNotifier};
pub use pcm::{HardwareType, PcmInfo};
pub use query::CancelToken;
pub use status::StatusObserver;
pub use vehicle::{SeedKeyAlgorithm, Vehicle};
