use std::io::{Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use super::{Result, SerialDeviceInfo, SerialError};

pub const DEFAULT_BAUD_RATE: u32 = 115200;
// Nokia USB serial (TRK over PC Suite cable)
pub const NOKIA_VID: u16 = 0x0421;

const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Byte-level access to an opened device, shared by the reader and writer
/// workers behind one mutex.
pub trait Transport: Send {
    /// Reads whatever is currently available. `Ok(0)` means nothing arrived.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Blocking write of the whole buffer, flushed.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    fn name(&self) -> &str;

    /// Called once when the session shuts down, before the workers are
    /// joined. Transports with a blocking read unblock it here.
    fn request_stop(&mut self) {}
}

/// Serial port (USB cable or rfcomm tty) running 8N1 without flow control.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    port_name: String,
}

impl SerialTransport {
    /// List serial ports, USB ones with their descriptors.
    pub fn discover_devices() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                _ => SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: None,
                    pid: None,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                },
            })
            .collect();
        Ok(devices)
    }

    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => SerialError::PortNotFound(port_name.to_string()),
                _ => SerialError::ConnectionFailed(format!("Could not open device '{}': {}", port_name, e)),
            })?;

        log::info!("Opened {} at {} baud", port_name, baud_rate);
        Ok(Self {
            port,
            port_name: port_name.to_string(),
        })
    }
}

impl Transport for SerialTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(0);
        }
        let len = available.min(buf.len());
        match self.port.read(&mut buf[..len]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(SerialError::IoError(e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.port_name
    }
}
