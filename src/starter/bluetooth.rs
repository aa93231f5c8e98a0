//! rfcomm listener process that makes a Bluetooth serial channel appear
//! as a tty the starter can open.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use super::{CommunicationStarter, Openable, ResourceEvent, ResourceHook, Result, StarterError};

pub const DEFAULT_BINARY: &str = "rfcomm";
pub const DEFAULT_CHANNEL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// Accept one connection, then exit.
    #[default]
    Listen,
    /// Keep re-listening after each connection closes.
    Watch,
}

impl ListenerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerMode::Listen => "listen",
            ListenerMode::Watch => "watch",
        }
    }
}

/// Runs `rfcomm -r <mode> <device> <channel>` and forwards its output as
/// log messages.
pub struct BluetoothListener {
    binary: String,
    mode: ListenerMode,
    channel: u8,
    auto_close: bool,
    device: String,
    child: Option<Child>,
    forwarders: Vec<JoinHandle<()>>,
    last_exit: Option<String>,
    exit_pending: bool,
    messages_tx: Sender<String>,
    messages_rx: Receiver<String>,
}

impl Default for BluetoothListener {
    fn default() -> Self {
        Self::new(ListenerMode::Listen)
    }
}

impl BluetoothListener {
    pub fn new(mode: ListenerMode) -> Self {
        let (messages_tx, messages_rx) = mpsc::channel();
        Self {
            binary: DEFAULT_BINARY.to_string(),
            mode,
            channel: DEFAULT_CHANNEL,
            auto_close: true,
            device: String::new(),
            child: None,
            forwarders: Vec::new(),
            last_exit: None,
            exit_pending: false,
            messages_tx,
            messages_rx,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn mode(&self) -> ListenerMode {
        self.mode
    }

    /// Kill the process when the listener is dropped.
    pub fn set_auto_close(&mut self, auto_close: bool) {
        self.auto_close = auto_close;
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn start(&mut self, device: &str) -> Result<()> {
        if self.is_running() {
            return Err(StarterError::ListenerRunning);
        }
        self.device = device.to_string();
        self.last_exit = None;
        self.exit_pending = false;
        self.emit_message(format!("{}: Starting Bluetooth listener {}...", device, self.binary));

        let channel = self.channel.to_string();
        let mut child = Command::new(&self.binary)
            .args(["-r", self.mode.as_str(), device, channel.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| StarterError::ListenerFailed {
                binary: self.binary.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            self.forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.forward_output(stderr, "stderr");
        }
        self.emit_message(format!("{}: Bluetooth listener running ({}).", device, child.id()));
        self.child = Some(child);
        Ok(())
    }

    fn forward_output<R: Read + Send + 'static>(&mut self, stream: R, name: &'static str) {
        let device = self.device.clone();
        let tx = self.messages_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("rfcomm-{}", name))
            .spawn(move || {
                for line in BufReader::new(stream).lines() {
                    let Ok(line) = line else { break };
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    let message = format!("{}: {}", device, line);
                    log::info!("{}", message);
                    if tx.send(message).is_err() {
                        break;
                    }
                }
            });
        match spawned {
            Ok(handle) => self.forwarders.push(handle),
            Err(e) => log::warn!("Cannot forward listener {}: {}", name, e),
        }
    }

    /// Messages produced since the last call (own progress and process output).
    pub fn take_messages(&self) -> Vec<String> {
        self.messages_rx.try_iter().collect()
    }

    /// How the process ended, once it has been reaped.
    pub fn last_exit(&self) -> Option<&str> {
        self.last_exit.as_deref()
    }

    pub fn is_running(&mut self) -> bool {
        self.poll_exit().is_none() && self.child.is_some()
    }

    /// Reaps the process if it has exited, reporting how it ended.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.child = None;
                self.report_exit(status);
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("{}: cannot query listener state: {}", self.device, e);
                None
            }
        }
    }

    fn report_exit(&mut self, status: ExitStatus) {
        let message = match status.code() {
            Some(code) => format!("{}: Process {} finished with exit code {}.", self.device, self.binary, code),
            None => format!("{}: Process {} crashed.", self.device, self.binary),
        };
        log::info!("{}", message);
        self.last_exit = Some(message);
        self.exit_pending = true;
        self.join_forwarders();
    }

    /// Kills and reaps the process.
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                log::debug!("{}: kill failed: {}", self.device, e);
            }
            match child.wait() {
                Ok(status) => self.report_exit(status),
                Err(e) => log::warn!("{}: cannot reap listener: {}", self.device, e),
            }
        }
        self.join_forwarders();
    }

    fn join_forwarders(&mut self) {
        for handle in self.forwarders.drain(..) {
            let _ = handle.join();
        }
    }

    fn emit_message(&self, message: String) {
        log::info!("{}", message);
        let _ = self.messages_tx.send(message);
    }
}

impl ResourceHook for BluetoothListener {
    fn initialize(&mut self, port: &str) -> Result<()> {
        self.start(port)
    }

    fn poll(&mut self) -> Vec<ResourceEvent> {
        // Reaping joins the forwarders, so all output precedes the exit.
        self.poll_exit();
        let mut events: Vec<ResourceEvent> = self.take_messages().into_iter().map(ResourceEvent::Message).collect();
        if std::mem::take(&mut self.exit_pending) {
            if let Some(message) = &self.last_exit {
                events.push(ResourceEvent::Exited(message.clone()));
            }
        }
        events
    }
}

impl Drop for BluetoothListener {
    fn drop(&mut self) {
        if self.auto_close {
            self.stop();
        }
    }
}

/// Starter that brings up an rfcomm listener before polling `open`.
pub type BluetoothStarter<D> = CommunicationStarter<D, BluetoothListener>;

impl<D: Openable> CommunicationStarter<D, BluetoothListener> {
    pub fn bluetooth(
        device: std::sync::Arc<std::sync::Mutex<D>>,
        port: impl Into<String>,
        listener: BluetoothListener,
    ) -> Self {
        Self::with_hook(device, port, listener)
    }
}
