//! Host side of the TRK debug-agent protocol.
//!
//! [`trk`] holds the wire codec, message model and write queue,
//! [`device::TrkDevice`] drives one connection with a reader and a writer
//! thread, and [`starter::CommunicationStarter`] retries opening a device
//! (optionally behind an rfcomm listener) until it answers.

pub mod config;
pub mod device;
pub mod serial;
pub mod starter;
pub mod trk;

pub use config::TrkConfig;
pub use device::{DeviceOptions, TrkDevice, TrkListener};
pub use starter::{CommunicationStarter, StarterState};
pub use trk::{TrkMessage, TrkResult};
