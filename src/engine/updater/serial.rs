//! Serial Channel
//!
//! The firmware's update listener only speaks 115200 8N1, so the rate is fixed
//! here rather than configurable.

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;

pub const BAUD_RATE: u32 = 115200;

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Configuration failed: {0}")]
    ConfigurationFailed(String),
}

/// Byte channel to the running firmware
pub trait SerialLink: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever arrives within `timeout`; `Ok(0)` or `TimedOut` when nothing did
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// Opens the serial channel for one handshake session
pub trait SerialConnector: Send + Sync {
    fn open(&self) -> Result<Box<dyn SerialLink>, SerialError>;
}

/// `serialport`-backed connector (8N1, no flow control).
/// POSIX ports are opened raw with echo disabled.
pub struct SerialPortConnector {
    port_name: String,
}

impl SerialPortConnector {
    pub fn new(port_name: String) -> Self {
        Self { port_name }
    }
}

impl SerialConnector for SerialPortConnector {
    fn open(&self) -> Result<Box<dyn SerialLink>, SerialError> {
        let port = serialport::new(&self.port_name, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", self.port_name, e)))?;

        // Drop anything the device printed before we arrived
        port.clear(serialport::ClearBuffer::All)
            .map_err(|e| SerialError::ConfigurationFailed(e.to_string()))?;

        tracing::info!(port = %self.port_name, baud = BAUD_RATE, "Serial channel open");
        Ok(Box::new(PortLink { port }))
    }
}

struct PortLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for PortLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port.set_timeout(timeout).map_err(io::Error::from)?;
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}
