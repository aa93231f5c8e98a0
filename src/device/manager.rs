use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use crate::serial::{SerialTransport, Transport};
use crate::trk::{
    frame_message, opcode, Cookie, DecodedFrame, FrameBuffer, TrkCallback, TrkResult, MAX_PAYLOAD_LEN,
};

use super::worker::{DeviceContext, DeviceEvent, Workers};
use super::{DeviceError, DeviceOptions, Result};

/// Opens the OS device for a port name. Swappable so tests can run the
/// facade over an in-memory transport.
pub type TransportOpener =
    Box<dyn FnMut(&str, &DeviceOptions) -> crate::serial::Result<Box<dyn Transport>> + Send>;

/// Observer of everything the device receives. All methods run on the
/// thread that owns the [`TrkDevice`].
pub trait TrkListener: Send {
    fn message_received(&mut self, _result: &TrkResult) {}
    fn raw_data_received(&mut self, _data: &[u8]) {}
    fn error(&mut self, _message: &str) {}
    fn log_message(&mut self, _message: &str) {}
}

fn open_serial(port: &str, options: &DeviceOptions) -> crate::serial::Result<Box<dyn Transport>> {
    let transport = SerialTransport::open(port, options.baud_rate)?;
    Ok(Box::new(transport))
}

struct Session {
    context: Arc<DeviceContext>,
    workers: Workers,
    events: Receiver<DeviceEvent>,
}

/// One TRK connection: owns the worker threads, reassembles frames and
/// routes results to pending callbacks and listeners.
///
/// Callbacks and listeners only ever run inside [`TrkDevice::process_events`]
/// (or its timeout variant), i.e. on the owning thread.
pub struct TrkDevice {
    options: DeviceOptions,
    opener: TransportOpener,
    session: Option<Session>,
    frames: FrameBuffer,
    listeners: Vec<Box<dyn TrkListener>>,
    port: String,
    error_string: String,
}

impl TrkDevice {
    pub fn new(options: DeviceOptions) -> Self {
        Self::with_opener(options, Box::new(open_serial))
    }

    pub fn with_opener(options: DeviceOptions, opener: TransportOpener) -> Self {
        Self {
            frames: FrameBuffer::new(options.serial_frame),
            options,
            opener,
            session: None,
            listeners: Vec::new(),
            port: String::new(),
            error_string: String::new(),
        }
    }

    /// Closes any existing session, opens `port` and starts the workers.
    pub fn open(&mut self, port: &str) -> Result<()> {
        self.close()?;
        self.port = port.to_string();

        let transport = match (self.opener)(port, &self.options) {
            Ok(transport) => transport,
            Err(source) => {
                let error = DeviceError::OpenFailed {
                    port: port.to_string(),
                    source,
                };
                self.error_string = error.to_string();
                return Err(error);
            }
        };

        let context = Arc::new(DeviceContext::new(transport, self.options.serial_frame));
        let (events_tx, events_rx) = mpsc::channel();
        let workers = match Workers::spawn(context.clone(), events_tx) {
            Ok(workers) => workers,
            Err(e) => {
                self.error_string = e.to_string();
                return Err(e);
            }
        };

        self.frames = FrameBuffer::new(self.options.serial_frame);
        self.session = Some(Session {
            context,
            workers,
            events: events_rx,
        });
        self.error_string.clear();
        self.emit_log(&format!("Opened {}", port));
        Ok(())
    }

    /// Stops the workers and releases the device. No callbacks fire after
    /// this returns. A no-op when not open.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let outcome = session.workers.terminate();
        let dropped = session.context.queue().clear();
        if dropped > 0 {
            log::info!("Discarded {} pending messages on close", dropped);
        }
        self.frames.clear();
        self.emit_log(&format!("Closed {}", self.port));
        if let Err(e) = &outcome {
            self.error_string = e.to_string();
        }
        outcome
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn serial_frame(&self) -> bool {
        self.options.serial_frame
    }

    /// Takes effect on the next `open`.
    pub fn set_serial_frame(&mut self, serial_frame: bool) {
        self.options.serial_frame = serial_frame;
    }

    pub fn verbose(&self) -> u8 {
        self.options.verbose
    }

    pub fn set_verbose(&mut self, verbose: u8) {
        self.options.verbose = verbose;
    }

    pub fn add_listener(&mut self, listener: Box<dyn TrkListener>) {
        self.listeners.push(listener);
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(DeviceError::NotOpen)
    }

    /// Queues a message and wakes the writer. Returns the assigned token.
    pub fn send_message(
        &mut self,
        code: u8,
        data: Vec<u8>,
        callback: Option<TrkCallback>,
        cookie: Cookie,
    ) -> Result<u8> {
        if data.len() > MAX_PAYLOAD_LEN {
            return Err(DeviceError::PayloadTooLarge(data.len()));
        }
        let session = self.session()?;
        let token = session.context.queue().enqueue(code, data, callback, cookie);
        session.workers.wake_writer();
        if self.options.verbose > 0 {
            self.emit_log(&format!("Queued message {:#04x} [{}]", code, token));
        }
        Ok(token)
    }

    /// Runs `callback` on the owning thread once everything queued before
    /// it has been handled. Nothing is transmitted.
    pub fn send_sync_barrier(&mut self, callback: TrkCallback, cookie: Cookie) -> Result<()> {
        let session = self.session()?;
        session.context.queue().enqueue_sync_barrier(callback, cookie);
        session.workers.wake_writer();
        Ok(())
    }

    /// First message of a session; resets the token sequence.
    pub fn send_initial_ping(&mut self, callback: Option<TrkCallback>) -> Result<()> {
        let session = self.session()?;
        session.context.queue().enqueue_initial_ping(callback);
        session.workers.wake_writer();
        Ok(())
    }

    /// Writes an acknowledgement immediately, ahead of anything queued.
    pub fn send_ack_now(&mut self, token: u8) -> Result<()> {
        let session = self.session()?;
        let bytes = frame_message(opcode::ACK, token, &[0], session.context.serial_frame());
        if let Err(e) = session.context.write(&bytes) {
            let error = DeviceError::WriteFailed(e);
            self.error_string = error.to_string();
            return Err(error);
        }
        if self.options.verbose > 1 {
            self.emit_log(&format!("Sent ack [{}]", token));
        }
        Ok(())
    }

    pub fn pending_messages(&self) -> usize {
        self.session
            .as_ref()
            .map(|s| s.context.queue().len())
            .unwrap_or(0)
    }

    /// Handles everything the workers have posted so far without blocking.
    /// Returns the number of events handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let event = match self.session.as_ref().map(|s| s.events.try_recv()) {
                Some(Ok(event)) => event,
                Some(Err(TryRecvError::Empty)) | None => break,
                Some(Err(TryRecvError::Disconnected)) => {
                    self.report_error("Device workers stopped unexpectedly".to_string());
                    break;
                }
            };
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Waits up to `timeout` for the first event, then drains the rest.
    pub fn process_events_timeout(&mut self, timeout: Duration) -> usize {
        let first = match self.session.as_ref().map(|s| s.events.recv_timeout(timeout)) {
            Some(Ok(event)) => event,
            Some(Err(RecvTimeoutError::Timeout)) => return 0,
            Some(Err(RecvTimeoutError::Disconnected)) => {
                self.report_error("Device workers stopped unexpectedly".to_string());
                return 0;
            }
            None => {
                std::thread::sleep(timeout);
                return 0;
            }
        };
        self.handle_event(first);
        1 + self.process_events()
    }

    fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Data(data) => {
                if self.options.verbose > 1 {
                    self.emit_log(&format!("<- {}", hex::encode(&data)));
                }
                self.frames.push(&data);
                while let Some(frame) = self.frames.next_frame() {
                    self.dispatch(frame);
                }
            }
            DeviceEvent::SyncBarrier(message) => message.complete_sync_barrier(),
            DeviceEvent::Error(message) => self.report_error(message),
        }
    }

    fn dispatch(&mut self, frame: DecodedFrame) {
        let DecodedFrame { result, raw } = frame;
        if !result.is_debug_output {
            let handler = match &self.session {
                Some(session) => {
                    let handler = session.context.queue().take_result_handler(&result);
                    session.workers.wake_writer();
                    handler
                }
                None => None,
            };
            if let Some(handler) = handler {
                handler.invoke(&result);
            }
            if self.options.verbose > 0 {
                self.emit_log(&format!("Received {}", result));
            }
            if self.options.auto_ack && result.is_notification() {
                if let Err(e) = self.send_ack_now(result.token) {
                    self.report_error(e.to_string());
                }
            }
        }
        for listener in &mut self.listeners {
            listener.message_received(&result);
        }
        if !raw.is_empty() {
            for listener in &mut self.listeners {
                listener.raw_data_received(&raw);
            }
        }
    }

    fn report_error(&mut self, message: String) {
        for listener in &mut self.listeners {
            listener.error(&message);
        }
        self.error_string = message;
    }

    fn emit_log(&mut self, message: &str) {
        log::debug!("{}", message);
        for listener in &mut self.listeners {
            listener.log_message(message);
        }
    }
}

impl Drop for TrkDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Error closing {}: {}", self.port, e);
        }
    }
}
