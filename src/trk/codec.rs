//! TRK wire framing.
//!
//! ```text
//! [0x01 0x90 <u16 BE: escaped body length + 2>]   (serial frame mode only)
//! 0x7E <escaped: opcode token payload checksum> 0x7E
//! ```
//!
//! Anything not starting with the delimiter at the expected offset is
//! unsolicited debug output from the remote side.

use super::message::TrkResult;

pub const FRAME_DELIMITER: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;
pub const SERIAL_HEADER: [u8; 2] = [0x01, 0x90];
const SERIAL_HEADER_LEN: usize = 4;
/// Largest payload whose escaped frame always fits the 16-bit serial length,
/// even if every byte needs escaping.
pub const MAX_PAYLOAD_LEN: usize = (u16::MAX as usize - 2) / 2 - 3;

pub fn encode_escaped(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 2);
    for &byte in data {
        if byte == FRAME_DELIMITER || byte == ESCAPE {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out
}

/// A trailing lone escape byte is dropped.
pub fn decode_escaped(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            if let Some(&next) = bytes.next() {
                out.push(next ^ ESCAPE_XOR);
            }
        } else {
            out.push(byte);
        }
    }
    out
}

/// `255 - (sum mod 256)`, so that opcode + token + payload + checksum sums to 0xFF.
pub fn checksum(code: u8, token: u8, payload: &[u8]) -> u8 {
    let sum = payload
        .iter()
        .fold(code.wrapping_add(token), |acc, &b| acc.wrapping_add(b));
    0xFF - sum
}

pub fn frame_message(code: u8, token: u8, payload: &[u8], serial_frame: bool) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 3);
    body.push(code);
    body.push(token);
    body.extend_from_slice(payload);
    body.push(checksum(code, token, payload));
    let escaped = encode_escaped(&body);

    let mut out = Vec::with_capacity(escaped.len() + 2 + SERIAL_HEADER_LEN);
    if serial_frame {
        // Callers bound payloads by MAX_PAYLOAD_LEN; past it the header lies.
        let len = u16::try_from(escaped.len() + 2).unwrap_or_else(|_| {
            log::error!(
                "Frame {:#04x} [{}] too long for serial header ({} bytes)",
                code,
                token,
                escaped.len() + 2
            );
            u16::MAX
        });
        out.extend_from_slice(&SERIAL_HEADER);
        out.extend_from_slice(&len.to_be_bytes());
    }
    out.push(FRAME_DELIMITER);
    out.extend_from_slice(&escaped);
    out.push(FRAME_DELIMITER);
    out
}

/// Outcome of scanning the head of a receive buffer.
#[derive(Debug)]
pub enum Extraction {
    /// Not enough bytes yet; keep the buffer and wait for more data.
    Incomplete,
    /// Bytes that can never form a frame (bad header, empty frame).
    Discarded(usize),
    /// Unframed text, CRLF normalized to LF.
    DebugOutput { consumed: usize, result: TrkResult },
    /// A framed result. `raw` is the unescaped body including checksum.
    Frame {
        consumed: usize,
        result: TrkResult,
        raw: Vec<u8>,
    },
}

pub fn try_extract_frame(buffer: &[u8], serial_frame: bool) -> Extraction {
    if buffer.is_empty() {
        return Extraction::Incomplete;
    }
    if serial_frame {
        extract_serial(buffer)
    } else {
        extract_frameless(buffer)
    }
}

fn extract_frameless(buffer: &[u8]) -> Extraction {
    match buffer.iter().position(|&b| b == FRAME_DELIMITER) {
        Some(0) => match buffer[1..].iter().position(|&b| b == FRAME_DELIMITER) {
            Some(end) => {
                let consumed = end + 2;
                // A `~` in debug output opens a bogus frame. Give the closing
                // delimiter back so it can open the next real frame.
                match decode_frame(&buffer[1..consumed - 1], consumed) {
                    Extraction::Discarded(_) => Extraction::Discarded(1),
                    Extraction::Frame { result, raw, .. } if !result.checksum_ok => Extraction::Frame {
                        consumed: consumed - 1,
                        result,
                        raw,
                    },
                    other => other,
                }
            }
            None => Extraction::Incomplete,
        },
        Some(pos) => debug_output(&buffer[..pos], pos),
        // Hold back a trailing CR until we know whether LF follows.
        None => match buffer.last() {
            Some(b'\r') if buffer.len() == 1 => Extraction::Incomplete,
            Some(b'\r') => debug_output(&buffer[..buffer.len() - 1], buffer.len() - 1),
            _ => debug_output(buffer, buffer.len()),
        },
    }
}

fn extract_serial(buffer: &[u8]) -> Extraction {
    if buffer[0] != SERIAL_HEADER[0] || buffer.get(1).is_some_and(|&b| b != SERIAL_HEADER[1]) {
        return resync_serial(buffer);
    }
    if buffer.len() < SERIAL_HEADER_LEN {
        return Extraction::Incomplete;
    }
    let len = u16::from_be_bytes([buffer[2], buffer[3]]) as usize;
    let consumed = SERIAL_HEADER_LEN + len;
    if buffer.len() < consumed {
        return Extraction::Incomplete;
    }
    let span = &buffer[SERIAL_HEADER_LEN..consumed];
    match span.first() {
        None => Extraction::Discarded(consumed),
        Some(&FRAME_DELIMITER) if len >= 2 => decode_frame(&span[1..len - 1], consumed),
        Some(&FRAME_DELIMITER) => Extraction::Discarded(consumed),
        Some(_) => debug_output(span, consumed),
    }
}

/// Skips to the next plausible header start. Length-prefixed spans on any
/// other mux than `0x90` are dropped along with line noise: a stray `0x01`
/// would otherwise be read as a length and stall reassembly.
fn resync_serial(buffer: &[u8]) -> Extraction {
    let next = buffer
        .windows(2)
        .skip(1)
        .position(|w| w == SERIAL_HEADER)
        .map(|pos| pos + 1);
    let skip = match next {
        Some(pos) => pos,
        // Keep a trailing header start byte; it may be the first half of a header.
        None if buffer.last() == Some(&SERIAL_HEADER[0]) && buffer.len() > 1 => buffer.len() - 1,
        None => buffer.len(),
    };
    log::warn!("Discarding {} bytes preceding a serial frame header", skip);
    Extraction::Discarded(skip)
}

fn decode_frame(escaped: &[u8], consumed: usize) -> Extraction {
    let raw = decode_escaped(escaped);
    if raw.len() < 3 {
        log::warn!("Discarding truncated frame ({} bytes)", raw.len());
        return Extraction::Discarded(consumed);
    }
    let sum = raw.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    let checksum_ok = sum == 0xFF;
    if !checksum_ok {
        log::warn!("*** CHECKSUM ERROR: {:#04x} in frame {}", sum, hex::encode(&raw));
    }
    let mut result = TrkResult::new(raw[0], raw[1], raw[2..raw.len() - 1].to_vec());
    result.checksum_ok = checksum_ok;
    Extraction::Frame {
        consumed,
        result,
        raw,
    }
}

fn debug_output(span: &[u8], consumed: usize) -> Extraction {
    Extraction::DebugOutput {
        consumed,
        result: TrkResult::debug_output(normalize_line_endings(span)),
    }
}

fn normalize_line_endings(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' && data.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

/// Something pulled out of a [`FrameBuffer`].
#[derive(Debug)]
pub struct DecodedFrame {
    pub result: TrkResult,
    /// Unescaped frame body; empty for debug output.
    pub raw: Vec<u8>,
}

/// Streaming reassembly buffer: bytes go in as they arrive, complete frames
/// come out once their closing delimiter (or declared length) is present.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    serial_frame: bool,
}

impl FrameBuffer {
    pub fn new(serial_frame: bool) -> Self {
        Self {
            buffer: Vec::new(),
            serial_frame,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Option<DecodedFrame> {
        loop {
            match try_extract_frame(&self.buffer, self.serial_frame) {
                Extraction::Incomplete => return None,
                Extraction::Discarded(consumed) => {
                    self.buffer.drain(..consumed);
                }
                Extraction::DebugOutput { consumed, result } => {
                    self.buffer.drain(..consumed);
                    return Some(DecodedFrame {
                        result,
                        raw: Vec::new(),
                    });
                }
                Extraction::Frame {
                    consumed,
                    result,
                    raw,
                } => {
                    self.buffer.drain(..consumed);
                    return Some(DecodedFrame { result, raw });
                }
            }
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trk::message::opcode;

    fn expect_frame(extraction: Extraction) -> (usize, TrkResult) {
        match extraction {
            Extraction::Frame {
                consumed, result, ..
            } => (consumed, result),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_escape_special_bytes() {
        assert_eq!(encode_escaped(&[0x7E]), vec![0x7D, 0x5E]);
        assert_eq!(encode_escaped(&[0x7D]), vec![0x7D, 0x5D]);
        assert_eq!(encode_escaped(&[0x01, 0x02]), vec![0x01, 0x02]);
        assert_eq!(decode_escaped(&[0x7D, 0x5E, 0x33, 0x7D, 0x5D]), vec![0x7E, 0x33, 0x7D]);
    }

    #[test]
    fn test_escaping_is_reversible() {
        let all: Vec<u8> = (0..=255u8).chain([0x7E, 0x7D, 0x7E]).collect();
        assert_eq!(decode_escaped(&encode_escaped(&all)), all);
    }

    #[test]
    fn test_ping_frame_bytes() {
        // 0x00 + 0x01 = 0x01, checksum 0xFE
        assert_eq!(frame_message(opcode::PING, 1, &[], false), vec![0x7E, 0x00, 0x01, 0xFE, 0x7E]);
    }

    #[test]
    fn test_serial_header_length() {
        let framed = frame_message(opcode::PING, 1, &[], true);
        assert_eq!(&framed[..4], &[0x01, 0x90, 0x00, 0x05]);
        assert_eq!(framed.len(), 4 + 5);
    }

    #[test]
    fn test_checksum_sums_to_ff() {
        let payload = [0x10, 0x7E, 0xFF, 0x7D, 0x00];
        let sum = payload
            .iter()
            .fold(0x48u8.wrapping_add(0x21), |a, &b| a.wrapping_add(b))
            .wrapping_add(checksum(0x48, 0x21, &payload));
        assert_eq!(sum, 0xFF);
    }

    #[test]
    fn test_round_trip_both_modes() {
        let payload: Vec<u8> = vec![0x7E, 0x00, 0x7D, 0x41, 0xFF];
        for serial in [false, true] {
            let framed = frame_message(opcode::WRITE_FILE, 0x7E, &payload, serial);
            let (consumed, result) = expect_frame(try_extract_frame(&framed, serial));
            assert_eq!(consumed, framed.len());
            assert_eq!(result.code, opcode::WRITE_FILE);
            assert_eq!(result.token, 0x7E);
            assert_eq!(result.data, payload);
            assert!(result.checksum_ok);
        }
    }

    #[test]
    fn test_empty_and_partial_buffers() {
        assert!(matches!(try_extract_frame(&[], false), Extraction::Incomplete));
        assert!(matches!(try_extract_frame(&[0x7E, 0x80], false), Extraction::Incomplete));
        assert!(matches!(try_extract_frame(&[0x01, 0x90, 0x00], true), Extraction::Incomplete));
        let framed = frame_message(opcode::ACK, 2, &[0], true);
        assert!(matches!(
            try_extract_frame(&framed[..framed.len() - 1], true),
            Extraction::Incomplete
        ));
    }

    #[test]
    fn test_checksum_mismatch_still_delivered() {
        let mut framed = frame_message(opcode::ACK, 3, &[0], false);
        let checksum_pos = framed.len() - 2;
        framed[checksum_pos] = framed[checksum_pos].wrapping_add(1);
        let (_, result) = expect_frame(try_extract_frame(&framed, false));
        assert!(!result.checksum_ok);
        assert_eq!(result.code, opcode::ACK);
    }

    #[test]
    fn test_debug_output_before_frame() {
        let mut buffer = b"hello\r\nworld".to_vec();
        buffer.extend(frame_message(opcode::ACK, 1, &[0], false));
        match try_extract_frame(&buffer, false) {
            Extraction::DebugOutput { consumed, result } => {
                assert_eq!(consumed, 12);
                assert!(result.is_debug_output);
                assert_eq!(result.data, b"hello\nworld");
            }
            other => panic!("expected debug output, got {:?}", other),
        }
    }

    #[test]
    fn test_serial_debug_output() {
        let text = b"log\r\n";
        let mut buffer = vec![0x01, 0x90, 0x00, text.len() as u8];
        buffer.extend_from_slice(text);
        match try_extract_frame(&buffer, true) {
            Extraction::DebugOutput { consumed, result } => {
                assert_eq!(consumed, buffer.len());
                assert_eq!(result.data, b"log\n");
            }
            other => panic!("expected debug output, got {:?}", other),
        }
    }

    #[test]
    fn test_serial_resync_skips_garbage() {
        let mut buffer = vec![0x55, 0xAA];
        buffer.extend(frame_message(opcode::ACK, 3, &[0], true));
        let mut frames = FrameBuffer::new(true);
        frames.push(&buffer);
        let frame = frames.next_frame().expect("frame after garbage");
        assert_eq!(frame.result.token, 3);
        assert_eq!(frames.buffered_len(), 0);
    }

    #[test]
    fn test_byte_at_a_time_reassembly() {
        let framed = frame_message(opcode::ACK, 9, &[0x7E, 0x7D, 0x00], false);
        let mut frames = FrameBuffer::new(false);
        let mut decoded = Vec::new();
        for (i, byte) in framed.iter().enumerate() {
            frames.push(std::slice::from_ref(byte));
            while let Some(frame) = frames.next_frame() {
                assert_eq!(i, framed.len() - 1, "frame emitted before it was complete");
                decoded.push(frame);
            }
        }
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].result.data, vec![0x7E, 0x7D, 0x00]);
        assert_eq!(decoded[0].raw.len(), 2 + 3 + 1);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut frames = FrameBuffer::new(false);
        frames.push(&frame_message(opcode::ACK, 1, &[0], false));
        frames.push(&frame_message(opcode::NOTIFY_STOPPED, 2, &[1, 2, 3], false));
        assert_eq!(frames.next_frame().unwrap().result.token, 1);
        assert_eq!(frames.next_frame().unwrap().result.code, opcode::NOTIFY_STOPPED);
        assert!(frames.next_frame().is_none());
    }

    fn drain(frames: &mut FrameBuffer) -> Vec<TrkResult> {
        std::iter::from_fn(|| frames.next_frame()).map(|f| f.result).collect()
    }

    fn good_ack_tokens(results: &[TrkResult]) -> Vec<u8> {
        results
            .iter()
            .filter(|r| !r.is_debug_output && r.checksum_ok && r.code == opcode::ACK)
            .map(|r| r.token)
            .collect()
    }

    #[test]
    fn test_tilde_in_debug_output_keeps_frames_aligned() {
        let mut frames = FrameBuffer::new(false);
        frames.push(b"C:\\PROGRA~1\n");
        for token in 1..=4 {
            frames.push(&frame_message(opcode::ACK, token, &[0], false));
        }
        let results = drain(&mut frames);
        assert_eq!(good_ack_tokens(&results), vec![1, 2, 3, 4]);
        assert!(results[0].is_debug_output);
    }

    #[test]
    fn test_text_after_tilde_is_not_a_frame_boundary() {
        let mut frames = FrameBuffer::new(false);
        frames.push(b"x~abc\n");
        for token in 1..=3 {
            frames.push(&frame_message(opcode::ACK, token, &[0], false));
        }
        assert_eq!(good_ack_tokens(&drain(&mut frames)), vec![1, 2, 3]);
    }

    #[test]
    fn test_corrupt_frame_does_not_swallow_the_next() {
        let mut corrupt = frame_message(opcode::ACK, 5, &[0], false);
        let checksum_pos = corrupt.len() - 2;
        corrupt[checksum_pos] = corrupt[checksum_pos].wrapping_add(1);
        let mut frames = FrameBuffer::new(false);
        frames.push(&corrupt);
        frames.push(b"trace\n");
        frames.push(&frame_message(opcode::ACK, 4, &[0], false));
        let results = drain(&mut frames);
        assert!(!results[0].checksum_ok);
        assert_eq!(good_ack_tokens(&results), vec![4]);
    }

    #[test]
    fn test_crlf_split_across_reads() {
        let mut frames = FrameBuffer::new(false);
        let mut text = Vec::new();
        frames.push(b"line1\r");
        text.extend(drain(&mut frames).into_iter().flat_map(|r| r.data));
        assert_eq!(text, b"line1");
        frames.push(b"\nline2\r\n");
        text.extend(drain(&mut frames).into_iter().flat_map(|r| r.data));
        assert_eq!(text, b"line1\nline2\n");
        assert_eq!(frames.buffered_len(), 0);
    }

    #[test]
    fn test_lone_cr_waits_for_more_data() {
        let mut frames = FrameBuffer::new(false);
        frames.push(b"\r");
        assert!(frames.next_frame().is_none());
        assert_eq!(frames.buffered_len(), 1);
    }

    #[test]
    fn test_other_mux_span_is_skipped() {
        let mut buffer = vec![0x01, 0x91, 0x00, 0x03, b'a', b'b', b'c'];
        buffer.extend(frame_message(opcode::ACK, 6, &[0], true));
        let mut frames = FrameBuffer::new(true);
        frames.push(&buffer);
        let results = drain(&mut frames);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].token, 6);
    }

    #[test]
    fn test_max_payload_fits_serial_header() {
        let payload = vec![0x7E; MAX_PAYLOAD_LEN];
        let framed = frame_message(opcode::WRITE_FILE, 0x7D, &payload, true);
        let declared = u16::from_be_bytes([framed[2], framed[3]]) as usize;
        assert_eq!(declared, framed.len() - 4);
        let (_, result) = expect_frame(try_extract_frame(&framed, true));
        assert_eq!(result.data.len(), MAX_PAYLOAD_LEN);
    }
}
