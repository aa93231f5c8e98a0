//! Reader and writer threads bridging the blocking device to the owner.
//!
//! Neither worker runs user callbacks. Everything observable is posted to
//! the owning thread as a [`DeviceEvent`] and handled there.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::serial::Transport;
use crate::trk::{frame_message, PendingMessage, TrkMessage, WriteQueue};

use super::{DeviceError, Result};

/// Liveness net for the writer; enqueues wake it immediately.
pub const WRITER_POLL_INTERVAL: Duration = Duration::from_millis(100);
const READER_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(250);
const READ_BUFFER_SIZE: usize = 4096;

/// Posted from a worker to the owning thread.
#[derive(Debug)]
pub enum DeviceEvent {
    Data(Vec<u8>),
    SyncBarrier(TrkMessage),
    Error(String),
}

/// State shared by both workers and the owner for one open session.
pub struct DeviceContext {
    transport: Mutex<Box<dyn Transport>>,
    queue: Mutex<WriteQueue>,
    serial_frame: bool,
}

impl DeviceContext {
    pub fn new(transport: Box<dyn Transport>, serial_frame: bool) -> Self {
        Self {
            transport: Mutex::new(transport),
            queue: Mutex::new(WriteQueue::new()),
            serial_frame,
        }
    }

    pub fn queue(&self) -> MutexGuard<'_, WriteQueue> {
        lock(&self.queue)
    }

    pub fn serial_frame(&self) -> bool {
        self.serial_frame
    }

    /// Blocking write under the device lock.
    pub fn write(&self, data: &[u8]) -> crate::serial::Result<()> {
        lock(&self.transport).write_all(data)
    }

    fn request_stop(&self) {
        lock(&self.transport).request_stop();
    }

    fn read_available(&self, buf: &mut [u8]) -> crate::serial::Result<usize> {
        lock(&self.transport).read_available(buf)
    }

    pub fn port_name(&self) -> String {
        lock(&self.transport).name().to_string()
    }
}

/// A worker that survived a panic elsewhere keeps going with the inner data.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        log::warn!("Recovering poisoned device lock");
        poisoned.into_inner()
    })
}

#[derive(Default)]
struct SignalState {
    stop: bool,
    wake: bool,
}

/// Wake/stop flag a worker can block on.
#[derive(Default)]
pub struct WorkerSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl WorkerSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        lock(&self.state).wake = true;
        self.cond.notify_all();
    }

    pub fn request_stop(&self) {
        lock(&self.state).stop = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stop
    }

    /// Blocks until woken, stopped or timed out. Returns true once stop
    /// has been requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = lock(&self.state);
        if !state.stop && !state.wake {
            state = match self.cond.wait_timeout(state, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        state.wake = false;
        state.stop
    }
}

/// Running reader and writer threads of one session.
pub struct Workers {
    context: Arc<DeviceContext>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    reader_signal: Arc<WorkerSignal>,
    writer_signal: Arc<WorkerSignal>,
}

impl Workers {
    pub fn spawn(context: Arc<DeviceContext>, events: Sender<DeviceEvent>) -> Result<Self> {
        let reader_signal = Arc::new(WorkerSignal::new());
        let writer_signal = Arc::new(WorkerSignal::new());

        let reader = {
            let context = context.clone();
            let signal = reader_signal.clone();
            let events = events.clone();
            thread::Builder::new()
                .name("trk-reader".into())
                .spawn(move || run_reader(context, signal, events))?
        };

        let writer = {
            let context = context.clone();
            let signal = writer_signal.clone();
            thread::Builder::new()
                .name("trk-writer".into())
                .spawn(move || run_writer(context, signal, events))
        };
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                reader_signal.request_stop();
                let _ = reader.join();
                return Err(DeviceError::ThreadSpawn(e));
            }
        };

        Ok(Self {
            context,
            reader: Some(reader),
            writer: Some(writer),
            reader_signal,
            writer_signal,
        })
    }

    pub fn wake_writer(&self) {
        self.writer_signal.wake();
    }

    /// Stops both threads and waits for them to exit.
    pub fn terminate(&mut self) -> Result<()> {
        if self.reader.is_none() && self.writer.is_none() {
            return Ok(());
        }
        self.reader_signal.request_stop();
        self.writer_signal.request_stop();
        self.context.request_stop();
        let mut outcome = Ok(());
        for (name, handle) in [("trk-reader", self.reader.take()), ("trk-writer", self.writer.take())] {
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    log::error!("{} thread panicked", name);
                    outcome = Err(DeviceError::ThreadJoin(name));
                }
            }
        }
        outcome
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            log::error!("Failed to stop device workers: {}", e);
        }
    }
}

fn run_writer(context: Arc<DeviceContext>, signal: Arc<WorkerSignal>, events: Sender<DeviceEvent>) {
    log::debug!("Writer thread started");
    loop {
        loop {
            let pending = context.queue().take_next();
            match pending {
                PendingMessage::Empty => break,
                PendingMessage::SyncBarrier(message) => {
                    if events.send(DeviceEvent::SyncBarrier(message)).is_err() {
                        return;
                    }
                }
                PendingMessage::Ready(frame) => {
                    let bytes = frame_message(frame.code, frame.token, &frame.data, context.serial_frame());
                    log::trace!("-> {}", hex::encode(&bytes));
                    let outcome = context.write(&bytes);
                    context.queue().notify_write_outcome(outcome.is_ok());
                    if let Err(e) = outcome {
                        let message = format!(
                            "Cannot write message {:#04x} [{}]: {}",
                            frame.code, frame.token, e
                        );
                        log::error!("{}", message);
                        if events.send(DeviceEvent::Error(message)).is_err() {
                            return;
                        }
                    }
                }
            }
        }
        if signal.wait(WRITER_POLL_INTERVAL) {
            break;
        }
    }
    log::debug!("Writer thread stopped");
}

fn run_reader(context: Arc<DeviceContext>, signal: Arc<WorkerSignal>, events: Sender<DeviceEvent>) {
    log::debug!("Reader thread started");
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut failing = false;
    while !signal.is_stopped() {
        match context.read_available(&mut buf) {
            Ok(0) => {
                if signal.wait(READER_POLL_INTERVAL) {
                    break;
                }
            }
            Ok(n) => {
                failing = false;
                if events.send(DeviceEvent::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                // Report the first failure of a streak only.
                if !failing {
                    failing = true;
                    let message = format!("Error reading from {}: {}", context.port_name(), e);
                    log::error!("{}", message);
                    if events.send(DeviceEvent::Error(message)).is_err() {
                        break;
                    }
                }
                if signal.wait(READ_ERROR_BACKOFF) {
                    break;
                }
            }
        }
    }
    log::debug!("Reader thread stopped");
}
