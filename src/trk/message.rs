use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TRK command and reply opcodes as they appear on the wire.
pub mod opcode {
    pub const PING: u8 = 0x00;
    pub const CONNECT: u8 = 0x01;
    pub const DISCONNECT: u8 = 0x02;
    pub const VERSIONS: u8 = 0x04;
    pub const SUPPORTED: u8 = 0x05;
    pub const CPU_TYPE: u8 = 0x06;
    pub const CONTINUE: u8 = 0x18;
    pub const CREATE_ITEM: u8 = 0x40;
    pub const DELETE_ITEM: u8 = 0x41;
    pub const WRITE_FILE: u8 = 0x48;
    pub const OPEN_FILE: u8 = 0x4A;
    pub const CLOSE_FILE: u8 = 0x4B;
    pub const INSTALL_FILE: u8 = 0x4D;
    pub const INSTALL_FILE2: u8 = 0x4E;

    /// Queue-internal no-op. Never transmitted; only used to get a callback
    /// once everything queued before it has been handled.
    pub const SYNC_BARRIER: u8 = 0x7F;

    pub const ACK: u8 = 0x80;
    pub const NOTIFY_STOPPED: u8 = 0x90;
    pub const NOTIFY_EXCEPTION: u8 = 0x91;
    pub const NOTIFY_INTERNAL_ERROR: u8 = 0x92;
    pub const NOTIFY_CREATED: u8 = 0xA0;
    pub const NOTIFY_DELETED: u8 = 0xA1;
    pub const NOTIFY_PROCESSOR_STARTED: u8 = 0xA2;
    pub const NOTIFY_PROCESSOR_STANDBY: u8 = 0xA6;
    pub const NOTIFY_PROCESSOR_RESET: u8 = 0xA7;
    pub const NAK: u8 = 0xFF;
}

/// Caller-defined context handed back to the callback with the result.
pub type Cookie = Option<Arc<dyn Any + Send + Sync>>;

/// Invoked once with the result answering a message.
pub type TrkCallback = Box<dyn FnOnce(&TrkResult) + Send + 'static>;

/// Outbound request waiting in (or taken from) the write queue.
pub struct TrkMessage {
    pub code: u8,
    pub token: u8,
    pub data: Vec<u8>,
    pub cookie: Cookie,
    pub callback: Option<TrkCallback>,
}

impl TrkMessage {
    pub fn new(code: u8, token: u8, data: Vec<u8>) -> Self {
        Self {
            code,
            token,
            data,
            cookie: None,
            callback: None,
        }
    }

    pub fn is_sync_barrier(&self) -> bool {
        self.code == opcode::SYNC_BARRIER
    }

    /// Hands the synthesized barrier result to the callback, if any.
    pub fn complete_sync_barrier(self) {
        let mut result = TrkResult::new(opcode::SYNC_BARRIER, self.token, Vec::new());
        result.cookie = self.cookie;
        if let Some(callback) = self.callback {
            callback(&result);
        }
    }
}

impl fmt::Debug for TrkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrkMessage")
            .field("code", &format_args!("{:#04x}", self.code))
            .field("token", &self.token)
            .field("data", &hex::encode(&self.data))
            .field("has_cookie", &self.cookie.is_some())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

/// Inbound frame or unsolicited debug output decoded from the device.
#[derive(Clone)]
pub struct TrkResult {
    pub code: u8,
    pub token: u8,
    pub data: Vec<u8>,
    pub cookie: Cookie,
    /// Text from the remote side that was not framed (e.g. process stdout).
    pub is_debug_output: bool,
    pub checksum_ok: bool,
    pub received_at: DateTime<Utc>,
}

impl TrkResult {
    pub fn new(code: u8, token: u8, data: Vec<u8>) -> Self {
        Self {
            code,
            token,
            data,
            cookie: None,
            is_debug_output: false,
            checksum_ok: true,
            received_at: Utc::now(),
        }
    }

    pub fn debug_output(data: Vec<u8>) -> Self {
        Self {
            is_debug_output: true,
            ..Self::new(0, 0, data)
        }
    }

    /// Nonzero when the result reports a failure. NAK is always an error;
    /// otherwise a single-byte payload carries the TRK error code.
    pub fn error_code(&self) -> u8 {
        let is_nak = self.code == opcode::NAK;
        if self.data.len() != 1 {
            return if is_nak { opcode::NAK } else { 0 };
        }
        match self.data[0] {
            0 if is_nak => opcode::NAK,
            code => code,
        }
    }

    pub fn error_string(&self) -> String {
        if self.code == opcode::NAK {
            return "NAK".to_string();
        }
        match self.data.first() {
            Some(&code) => error_message(code).to_string(),
            None => "Unknown error packet".to_string(),
        }
    }

    /// Notifications are sent unprompted by the device and expect an ack.
    pub fn is_notification(&self) -> bool {
        !self.is_debug_output && self.code >= opcode::NOTIFY_STOPPED && self.code != opcode::NAK
    }

    pub fn cookie_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.cookie.as_ref().and_then(|c| c.downcast_ref::<T>())
    }
}

impl fmt::Debug for TrkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrkResult")
            .field("code", &format_args!("{:#04x}", self.code))
            .field("token", &self.token)
            .field("data", &hex::encode(&self.data))
            .field("is_debug_output", &self.is_debug_output)
            .field("checksum_ok", &self.checksum_ok)
            .finish()
    }
}

impl fmt::Display for TrkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_debug_output {
            return write!(f, "debug output: {}", String::from_utf8_lossy(&self.data));
        }
        write!(f, "{:02x} [{}] {}", self.code, self.token, hex::encode(&self.data))
    }
}

/// Text for a TRK status byte.
pub fn error_message(code: u8) -> &'static str {
    match code {
        0x00 => "No error",
        0x01 => "Generic error in CWDS message",
        0x02 => "Unexpected packet size in send msg",
        0x03 => "Internal error occurred in CWDS",
        0x04 => "Escape followed by frame flag",
        0x05 => "Bad FCS in packet",
        0x06 => "Packet too long",
        0x07 => "Sequence ID not expected (gap in sequence)",
        0x10 => "Command not supported",
        0x11 => "Command parameter out of range",
        0x12 => "An option was not supported",
        0x13 => "Read/write to invalid memory",
        0x14 => "Read/write invalid registers",
        0x15 => "Exception occurred in CWDS",
        0x16 => "Targeted system or thread is running",
        0x17 => "Breakpoint resources exhausted",
        0x18 => "Requested breakpoint conflicts with existing one",
        0x20 => "General OS-related error",
        0x21 => "Request specified invalid process",
        0x22 => "Request specified invalid thread",
        _ => "Unknown error",
    }
}

/// Byte order of multi-byte payload fields. The agent defaults to big endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

pub fn append_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

pub fn append_u16(buf: &mut Vec<u8>, value: u16, endian: Endianness) {
    match endian {
        Endianness::Big => buf.extend_from_slice(&value.to_be_bytes()),
        Endianness::Little => buf.extend_from_slice(&value.to_le_bytes()),
    }
}

pub fn append_u32(buf: &mut Vec<u8>, value: u32, endian: Endianness) {
    match endian {
        Endianness::Big => buf.extend_from_slice(&value.to_be_bytes()),
        Endianness::Little => buf.extend_from_slice(&value.to_le_bytes()),
    }
}

/// Appends a 16-bit length followed by the string bytes, optionally
/// NUL-terminated (the terminator is counted in the length). Strings too
/// long for the length field are truncated so the two always agree.
pub fn append_string(buf: &mut Vec<u8>, value: &str, endian: Endianness, nul_terminated: bool) {
    let limit = u16::MAX as usize - usize::from(nul_terminated);
    let mut bytes = value.as_bytes();
    if bytes.len() > limit {
        log::warn!("Truncating {}-byte string to {} bytes", bytes.len(), limit);
        bytes = &bytes[..limit];
    }
    let len = bytes.len() + usize::from(nul_terminated);
    append_u16(buf, len as u16, endian);
    buf.extend_from_slice(bytes);
    if nul_terminated {
        buf.push(0);
    }
}

pub fn extract_u16(data: &[u8], endian: Endianness) -> Option<u16> {
    let bytes: [u8; 2] = data.get(..2)?.try_into().ok()?;
    Some(match endian {
        Endianness::Big => u16::from_be_bytes(bytes),
        Endianness::Little => u16::from_le_bytes(bytes),
    })
}

pub fn extract_u32(data: &[u8], endian: Endianness) -> Option<u32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(match endian {
        Endianness::Big => u32::from_be_bytes(bytes),
        Endianness::Little => u32::from_le_bytes(bytes),
    })
}

/// Agent and protocol versions reported in reply to `VERSIONS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrkVersions {
    pub trk_major: u8,
    pub trk_minor: u8,
    pub protocol_major: u8,
    pub protocol_minor: u8,
}

impl TrkVersions {
    /// Payload layout: status byte, then the four version bytes.
    pub fn parse(result: &TrkResult) -> Option<Self> {
        if result.error_code() != 0 || result.data.len() < 5 {
            return None;
        }
        Some(Self {
            trk_major: result.data[1],
            trk_minor: result.data[2],
            protocol_major: result.data[3],
            protocol_minor: result.data[4],
        })
    }
}

impl fmt::Display for TrkVersions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "App TRK version {}.{}, TRK protocol version {}.{}",
            self.trk_major, self.trk_minor, self.protocol_major, self.protocol_minor
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_with_zero_status_is_success() {
        let result = TrkResult::new(opcode::ACK, 1, vec![0]);
        assert_eq!(result.error_code(), 0);
        assert_eq!(result.error_string(), "No error");
    }

    #[test]
    fn test_nak_is_always_an_error() {
        let result = TrkResult::new(opcode::NAK, 3, vec![0]);
        assert_eq!(result.error_code(), opcode::NAK);
        assert_eq!(result.error_string(), "NAK");

        let result = TrkResult::new(opcode::NAK, 3, vec![]);
        assert_eq!(result.error_code(), opcode::NAK);
    }

    #[test]
    fn test_single_byte_status_is_error_code() {
        let result = TrkResult::new(opcode::ACK, 2, vec![0x10]);
        assert_eq!(result.error_code(), 0x10);
        assert_eq!(result.error_string(), "Command not supported");

        let empty = TrkResult::new(opcode::ACK, 2, vec![]);
        assert_eq!(empty.error_string(), "Unknown error packet");
    }

    #[test]
    fn test_payload_helpers() {
        let mut buf = Vec::new();
        append_u8(&mut buf, 7);
        append_u16(&mut buf, 0x1234, Endianness::Big);
        append_u32(&mut buf, 0xDEADBEEF, Endianness::Little);
        assert_eq!(buf, vec![7, 0x12, 0x34, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(extract_u16(&buf[1..], Endianness::Big), Some(0x1234));
        assert_eq!(extract_u32(&buf[3..], Endianness::Little), Some(0xDEADBEEF));
        assert_eq!(extract_u32(&buf[5..], Endianness::Big), None);
    }

    #[test]
    fn test_append_string_counts_terminator() {
        let mut buf = Vec::new();
        append_string(&mut buf, "C:\\a.sis", Endianness::Big, true);
        assert_eq!(&buf[..2], &[0, 9]);
        assert_eq!(buf.last(), Some(&0));
        assert_eq!(buf.len(), 2 + 9);
    }

    #[test]
    fn test_oversized_string_length_matches_body() {
        let long = "x".repeat(u16::MAX as usize + 10);
        let mut buf = Vec::new();
        append_string(&mut buf, &long, Endianness::Little, true);
        let declared = extract_u16(&buf, Endianness::Little).unwrap() as usize;
        assert_eq!(declared, u16::MAX as usize);
        assert_eq!(buf.len() - 2, declared);
        assert_eq!(buf.last(), Some(&0));
    }

    #[test]
    fn test_parse_versions() {
        let result = TrkResult::new(opcode::ACK, 4, vec![0, 3, 1, 1, 2]);
        let versions = TrkVersions::parse(&result).unwrap();
        assert_eq!(versions.trk_major, 3);
        assert_eq!(versions.protocol_minor, 2);
        assert!(TrkVersions::parse(&TrkResult::new(opcode::ACK, 4, vec![0])).is_none());
    }

    #[test]
    fn test_notification_detection() {
        assert!(TrkResult::new(opcode::NOTIFY_STOPPED, 5, vec![]).is_notification());
        assert!(!TrkResult::new(opcode::ACK, 5, vec![0]).is_notification());
        assert!(!TrkResult::new(opcode::NAK, 5, vec![]).is_notification());
        assert!(!TrkResult::debug_output(b"hello".to_vec()).is_notification());
    }

    #[test]
    fn test_cookie_downcast() {
        let mut result = TrkResult::new(opcode::ACK, 1, vec![0]);
        result.cookie = Some(Arc::new(42u32));
        assert_eq!(result.cookie_as::<u32>(), Some(&42));
        assert_eq!(result.cookie_as::<String>(), None);
    }
}
