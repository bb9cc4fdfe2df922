//! Port abstraction for serial communication with the module.
//!
//! The update engine never touches a serial device directly. It talks to a
//! [`Transport`](crate::transport::Transport), which in turn opens ports
//! through a [`PortOpener`] and drives them through the [`Port`] trait:
//!
//! ```text
//! +------------------+
//! |  Update Engine   |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+      +------------------+
//! | SerialTransport  +----->+   PortOpener     |
//! +--------+---------+      +--------+---------+
//!          |                         |
//!          v                         v
//! +--------+---------+      +--------+---------+
//! |   Port Trait     |<-----+  NativeOpener    |
//! +--------+---------+      +------------------+
//!          |
//!          v
//! +--------+---------+
//! | Native SerialPort|
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use uwflash::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> std::io::Result<()> {
//!     port.write_all(b"V")?;
//!
//!     let mut buf = [0u8; 32];
//!     let n = port.read(&mut buf)?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
///
/// Ports are always opened 8-N-1 with RTS/CTS flow control.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read timeout, bounding how long a receive poll blocks.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Create a configuration with the default 10 ms read timeout.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_millis(10),
        }
    }
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Discard anything buffered in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Start or stop transmitting a BREAK condition.
    fn set_break(&mut self, level: bool) -> Result<()>;

    /// Read CTS (Clear To Send) pin state.
    fn read_cts(&mut self) -> Result<bool>;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Opens ports by configuration.
///
/// The engine closes and reopens the port whenever the baud rate changes,
/// so it holds an opener rather than a single port.
pub trait PortOpener {
    /// Concrete port type produced.
    type Port: Port;

    /// Open a port with the given configuration.
    fn open(&mut self, config: &SerialConfig) -> Result<Self::Port>;
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;

    /// Find the port backed by the USB device with this serial number.
    fn find_by_serial(serial: &str) -> Result<Option<PortInfo>> {
        let ports = Self::list_ports()?;
        Ok(ports
            .into_iter()
            .find(|p| {
                p.serial_number
                    .as_deref()
                    .is_some_and(|s| s.starts_with(serial))
            }))
    }
}

#[cfg(feature = "native")]
pub use native::{NativeOpener, NativePort, NativePortEnumerator};
