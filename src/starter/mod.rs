//! Retry loop that keeps trying to open a device until it answers or the
//! attempt budget runs out.
//!
//! The starter runs entirely on the caller's thread. Either drive it from an
//! external loop via [`CommunicationStarter::next_tick_due`] and
//! [`CommunicationStarter::tick`], or block in
//! [`CommunicationStarter::wait_for_outcome`]. Dropping the starter cancels it.

pub mod bluetooth;

pub use bluetooth::{BluetoothListener, BluetoothStarter, ListenerMode};

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::device::worker::lock;
use crate::device::TrkDevice;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Anything the starter can repeatedly try to open.
pub trait Openable {
    fn open(&mut self, port: &str) -> crate::device::Result<()>;
}

impl Openable for TrkDevice {
    fn open(&mut self, port: &str) -> crate::device::Result<()> {
        TrkDevice::open(self, port)
    }
}

/// Provisions whatever must exist before retrying (e.g. an rfcomm listener).
pub trait ResourceHook {
    fn initialize(&mut self, port: &str) -> Result<()>;

    /// Output and state changes since the last call. Polled on every tick.
    fn poll(&mut self) -> Vec<ResourceEvent> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Message(String),
    /// The resource went away; no later `open` can succeed.
    Exited(String),
}

/// Hook for devices that need nothing beyond `open`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResources;

impl ResourceHook for NoResources {
    fn initialize(&mut self, _port: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StarterState {
    Idle,
    Running,
    Connected,
    TimedOut,
    /// The provisioned resource exited before the device opened.
    Failed,
}

/// Successful return of [`CommunicationStarter::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The device opened on the first try; no retry loop was armed.
    ImmediateSuccess,
    /// The retry loop is running.
    Started,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StarterEvent {
    Connected,
    TimedOut,
    Message(String),
    ResourceExited(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StarterError {
    #[error("Internal error, attempt to re-start a running connection starter")]
    AlreadyRunning,

    #[error("Bluetooth listener is still running")]
    ListenerRunning,

    #[error("Unable to run '{binary}': {source}")]
    ListenerFailed {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    TimedOut(String),

    #[error("{0}")]
    ResourceExited(String),
}

pub type Result<T> = std::result::Result<T, StarterError>;

type EventHandler = Box<dyn FnMut(&StarterEvent) + Send>;

pub struct CommunicationStarter<D: Openable, H: ResourceHook = NoResources> {
    device: Arc<Mutex<D>>,
    hook: H,
    port: String,
    interval: Duration,
    attempts: Option<u32>,
    attempt_count: u32,
    state: StarterState,
    error_string: String,
    next_tick: Option<Instant>,
    handlers: Vec<EventHandler>,
}

impl<D: Openable> CommunicationStarter<D, NoResources> {
    pub fn new(device: Arc<Mutex<D>>, port: impl Into<String>) -> Self {
        Self::with_hook(device, port, NoResources)
    }
}

impl<D: Openable, H: ResourceHook> CommunicationStarter<D, H> {
    pub fn with_hook(device: Arc<Mutex<D>>, port: impl Into<String>, hook: H) -> Self {
        Self {
            device,
            hook,
            port: port.into(),
            interval: DEFAULT_INTERVAL,
            attempts: None,
            attempt_count: 0,
            state: StarterState::Idle,
            error_string: String::new(),
            next_tick: None,
            handlers: Vec::new(),
        }
    }

    pub fn device(&self) -> &str {
        &self.port
    }

    pub fn set_device(&mut self, port: impl Into<String>) {
        self.port = port.into();
    }

    /// `None` retries forever.
    pub fn attempts(&self) -> Option<u32> {
        self.attempts
    }

    pub fn set_attempts(&mut self, attempts: Option<u32>) {
        self.attempts = attempts;
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval.as_millis() as u64
    }

    pub fn set_interval_ms(&mut self, interval_ms: u64) {
        self.interval = Duration::from_millis(interval_ms);
    }

    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    pub fn state(&self) -> StarterState {
        self.state
    }

    /// Timer ticks handled since `start`.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn hook(&self) -> &H {
        &self.hook
    }

    pub fn hook_mut(&mut self) -> &mut H {
        &mut self.hook
    }

    pub fn on_event(&mut self, handler: impl FnMut(&StarterEvent) + Send + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// When the next tick should run, if the retry timer is armed.
    pub fn next_tick_due(&self) -> Option<Instant> {
        self.next_tick
    }

    pub fn start(&mut self) -> Result<StartOutcome> {
        if self.state == StarterState::Running {
            let error = StarterError::AlreadyRunning;
            self.error_string = error.to_string();
            return Err(error);
        }
        // Succeeds right away if a listener is already watching the channel.
        if self.try_open() {
            self.state = StarterState::Connected;
            return Ok(StartOutcome::ImmediateSuccess);
        }
        self.attempt_count = 0;
        if let Err(e) = self.hook.initialize(&self.port) {
            self.error_string = e.to_string();
            return Err(e);
        }
        self.next_tick = Some(Instant::now() + self.interval);
        self.state = StarterState::Running;
        log::debug!(
            "{}: waiting for connection, interval {}ms, attempts {:?}",
            self.port,
            self.interval_ms(),
            self.attempts
        );
        Ok(StartOutcome::Started)
    }

    /// One retry-timer expiry. A no-op unless running.
    pub fn tick(&mut self) -> StarterState {
        if self.state != StarterState::Running {
            return self.state;
        }
        if self.poll_resources() != StarterState::Running {
            return self.state;
        }
        self.attempt_count += 1;
        if self.attempts.is_some_and(|max| self.attempt_count >= max) {
            self.next_tick = None;
            self.error_string = format!(
                "{}: timed out after {} attempts using an interval of {}ms.",
                self.port,
                self.attempt_count,
                self.interval_ms()
            );
            log::warn!("{}", self.error_string);
            self.state = StarterState::TimedOut;
            self.emit(StarterEvent::TimedOut);
        } else if self.try_open() {
            self.next_tick = None;
            self.state = StarterState::Connected;
            log::info!("{}: connected after {} attempts", self.port, self.attempt_count);
            self.emit(StarterEvent::Connected);
        } else {
            let message = format!(
                "{}: Connection attempt {} failed: {} (retrying)...",
                self.port, self.attempt_count, self.error_string
            );
            log::info!("{}", message);
            self.emit(StarterEvent::Message(message));
            self.next_tick = Some(Instant::now() + self.interval);
        }
        self.state
    }

    /// Forwards hook output as events. An exit while running ends the
    /// starter in `Failed`; after connecting it is only reported.
    pub fn poll_resources(&mut self) -> StarterState {
        for event in self.hook.poll() {
            match event {
                ResourceEvent::Message(message) => self.emit(StarterEvent::Message(message)),
                ResourceEvent::Exited(message) => {
                    if self.state == StarterState::Running {
                        self.next_tick = None;
                        self.error_string = message.clone();
                        self.state = StarterState::Failed;
                        log::warn!("{}", message);
                    }
                    self.emit(StarterEvent::ResourceExited(message));
                }
            }
        }
        self.state
    }

    /// Runs the retry timer on this thread until connected, timed out or failed.
    pub fn wait_for_outcome(&mut self) -> StarterState {
        while self.state == StarterState::Running {
            if let Some(due) = self.next_tick {
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
            }
            self.tick();
        }
        self.state
    }

    /// `start` followed by `wait_for_outcome`.
    pub fn connect(&mut self) -> Result<()> {
        if self.start()? == StartOutcome::ImmediateSuccess {
            return Ok(());
        }
        match self.wait_for_outcome() {
            StarterState::Connected => Ok(()),
            StarterState::Failed => Err(StarterError::ResourceExited(self.error_string.clone())),
            _ => Err(StarterError::TimedOut(self.error_string.clone())),
        }
    }

    fn try_open(&mut self) -> bool {
        let outcome = lock(&self.device).open(&self.port);
        match outcome {
            Ok(()) => true,
            Err(e) => {
                self.error_string = e.to_string();
                false
            }
        }
    }

    fn emit(&mut self, event: StarterEvent) {
        for handler in &mut self.handlers {
            handler(&event);
        }
    }
}
