//! In-memory device that answers frames the way a TRK agent would.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use trkcomm::device::{DeviceOptions, TransportOpener, TrkDevice, TrkListener};
use trkcomm::serial::{SerialError, Transport};
use trkcomm::trk::{frame_message, opcode, Extraction, TrkResult};

#[derive(Default)]
pub struct AgentState {
    pub inbound: VecDeque<u8>,
    /// Every buffer handed to `write_all`, in order.
    pub written: Vec<Vec<u8>>,
    /// Reply with an ACK to each framed request.
    pub auto_reply: bool,
    /// Fail this many upcoming writes.
    pub fail_writes: u32,
    pub serial_frame: bool,
    pub stop_requests: u32,
}

impl AgentState {
    pub fn inject(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }

    /// Decoded (code, token, payload) of every request written so far.
    pub fn requests(&self) -> Vec<(u8, u8, Vec<u8>)> {
        self.written
            .iter()
            .filter_map(|bytes| match trkcomm::trk::try_extract_frame(bytes, self.serial_frame) {
                Extraction::Frame { result, .. } => Some((result.code, result.token, result.data)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct FakeAgent {
    pub state: Arc<Mutex<AgentState>>,
}

impl FakeAgent {
    pub fn replying() -> Self {
        let agent = Self::default();
        agent.state.lock().unwrap().auto_reply = true;
        agent
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn inject(&self, bytes: &[u8]) {
        self.state.lock().unwrap().inject(bytes);
    }

    pub fn requests(&self) -> Vec<(u8, u8, Vec<u8>)> {
        self.state.lock().unwrap().requests()
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn opener(&self) -> TransportOpener {
        let state = self.state.clone();
        Box::new(move |port: &str, options: &DeviceOptions| -> trkcomm::serial::Result<Box<dyn Transport>> {
            state.lock().unwrap().serial_frame = options.serial_frame;
            Ok(Box::new(AgentTransport {
                name: port.to_string(),
                state: state.clone(),
            }))
        })
    }

    pub fn device(&self, options: DeviceOptions) -> TrkDevice {
        TrkDevice::with_opener(options, self.opener())
    }
}

struct AgentTransport {
    name: String,
    state: Arc<Mutex<AgentState>>,
}

impl Transport for AgentTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> trkcomm::serial::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let n = state.inbound.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> trkcomm::serial::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(SerialError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "link dropped",
            )));
        }
        state.written.push(data.to_vec());
        if state.auto_reply {
            if let Extraction::Frame { result, .. } = trkcomm::trk::try_extract_frame(data, state.serial_frame) {
                if result.code != opcode::ACK {
                    let payload = match result.code {
                        opcode::VERSIONS => vec![0, 3, 2, 1, 0],
                        _ => vec![0],
                    };
                    let reply = frame_message(opcode::ACK, result.token, &payload, state.serial_frame);
                    state.inject(&reply);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn request_stop(&mut self) {
        self.state.lock().unwrap().stop_requests += 1;
    }
}

/// Shared sink for results delivered to callbacks.
pub type Replies = Arc<Mutex<Vec<TrkResult>>>;

pub fn collect(replies: &Replies) -> trkcomm::trk::TrkCallback {
    let replies = replies.clone();
    Box::new(move |result: &TrkResult| replies.lock().unwrap().push(result.clone()))
}

/// Pumps the device until `done` holds or two seconds pass.
pub fn pump_until(device: &mut TrkDevice, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        device.process_events_timeout(Duration::from_millis(20));
    }
    done()
}

#[derive(Default, Clone)]
pub struct Recorder {
    pub messages: Arc<Mutex<Vec<TrkResult>>>,
    pub raw: Arc<Mutex<Vec<Vec<u8>>>>,
    pub errors: Arc<Mutex<Vec<String>>>,
}

impl TrkListener for Recorder {
    fn message_received(&mut self, result: &TrkResult) {
        self.messages.lock().unwrap().push(result.clone());
    }

    fn raw_data_received(&mut self, data: &[u8]) {
        self.raw.lock().unwrap().push(data.to_vec());
    }

    fn error(&mut self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}
