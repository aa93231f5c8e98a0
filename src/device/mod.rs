pub mod manager;
pub mod worker;

pub use manager::{TransportOpener, TrkDevice, TrkListener};
pub use worker::{DeviceEvent, WorkerSignal};

use serde::{Deserialize, Serialize};

use crate::serial::interface::DEFAULT_BAUD_RATE;

/// Per-connection settings of a [`TrkDevice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    pub baud_rate: u32,
    /// Wrap frames in the `0x01 0x90 <len>` serial header.
    pub serial_frame: bool,
    /// 0 = quiet, 1 = message traces, 2 = raw byte traces.
    pub verbose: u8,
    /// Acknowledge device notifications (stopped, created, ...) as they arrive.
    pub auto_ack: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            serial_frame: false,
            verbose: 0,
            auto_ack: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not open")]
    NotOpen,

    #[error("Could not open {port}: {source}")]
    OpenFailed {
        port: String,
        #[source]
        source: crate::serial::SerialError,
    },

    #[error("Write failed: {0}")]
    WriteFailed(#[source] crate::serial::SerialError),

    #[error("Payload of {0} bytes exceeds the frame limit")]
    PayloadTooLarge(usize),

    #[error("Could not start worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("Worker thread {0} did not shut down cleanly")]
    ThreadJoin(&'static str),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
