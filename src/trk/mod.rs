//! TRK protocol core: wire codec, message model and write queue.

pub mod codec;
pub mod message;
pub mod queue;

pub use codec::{frame_message, try_extract_frame, DecodedFrame, Extraction, FrameBuffer, MAX_PAYLOAD_LEN};
pub use message::{opcode, Cookie, Endianness, TrkCallback, TrkMessage, TrkResult, TrkVersions};
pub use queue::{OutgoingFrame, PendingCallback, PendingMessage, WriteQueue};
