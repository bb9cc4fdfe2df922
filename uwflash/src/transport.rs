//! Serial transport used by the update engine.
//!
//! A [`Transport`] is a byte pipe to the module that can be closed and
//! reopened at a different baud rate, polls CTS for readiness and drives the
//! DTR/BREAK lines used for out-of-band resets. Inbound bytes carry no
//! framing; the engine buffers and interprets them.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortOpener, SerialConfig},
    },
    log::{debug, trace, warn},
    std::io::{self, ErrorKind, Read},
};

/// Bytes read per receive call.
const RECEIVE_CHUNK: usize = 512;

/// Byte stream to the module.
pub trait Transport {
    /// Open the configured device at `baud_rate`, 8-N-1 with RTS/CTS.
    fn open(&mut self, baud_rate: u32) -> Result<()>;

    /// Close the device. Closing a closed transport is a no-op.
    fn close(&mut self);

    /// Whether the device is open.
    fn is_open(&self) -> bool;

    /// Device path currently targeted.
    fn port_name(&self) -> &str;

    /// Retarget the transport, e.g. after the OS renamed the device.
    fn set_port_name(&mut self, name: &str);

    /// Queue bytes for transmission.
    fn transmit(&mut self, data: &[u8]) -> Result<()>;

    /// Whether the module asserts clear-to-send.
    fn device_ready(&mut self) -> Result<bool>;

    /// Drive the DTR line.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Start or stop a BREAK condition.
    fn set_break(&mut self, level: bool) -> Result<()>;

    /// Append any bytes that arrived to `buf`, waiting at most the port's
    /// read timeout. Returns the number of bytes appended.
    fn receive(&mut self, buf: &mut Vec<u8>) -> Result<usize>;
}

/// [`Transport`] over a serial [`Port`].
///
/// A permission or missing-device failure while open is reported once as
/// [`Error::DeviceUnplugged`]; the port is closed and later calls see
/// [`Error::PortNotOpen`].
pub struct SerialTransport<O: PortOpener> {
    opener: O,
    port_name: String,
    port: Option<O::Port>,
    unplug_reported: bool,
}

impl<O: PortOpener> SerialTransport<O> {
    /// Create a closed transport for `port_name`.
    pub fn new(opener: O, port_name: impl Into<String>) -> Self {
        let port_name = port_name.into();
        Self {
            opener,
            port_name,
            port: None,
            unplug_reported: false,
        }
    }

    fn port_mut(&mut self) -> Result<&mut O::Port> {
        self.port
            .as_mut()
            .ok_or(Error::PortNotOpen)
    }

    /// Translate a port failure, reporting an unplug exactly once.
    fn fail(&mut self, err: Error) -> Error {
        if !is_unplug(&err) {
            return err;
        }
        self.close();
        if self.unplug_reported {
            Error::PortNotOpen
        } else {
            warn!("Serial device {} has been unplugged", self.port_name);
            self.unplug_reported = true;
            Error::DeviceUnplugged
        }
    }
}

impl<O: PortOpener> Transport for SerialTransport<O> {
    fn open(&mut self, baud_rate: u32) -> Result<()> {
        self.close();
        let config = SerialConfig::new(self.port_name.clone(), baud_rate);

        debug!("Opening {} at {baud_rate} baud", self.port_name);
        let port = self
            .opener
            .open(&config)
            .map_err(|e| Error::PortFailedToOpen {
                port: self
                    .port_name
                    .clone(),
                reason: e.to_string(),
            })?;
        self.port = Some(port);
        // Drop whatever the module sent at the previous rate.
        if let Err(e) = self.port_mut().and_then(Port::clear_buffers) {
            debug!("Could not clear {} buffers: {e}", self.port_name);
        }
        self.unplug_reported = false;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut port) = self
            .port
            .take()
        {
            debug!("Closing {}", self.port_name);
            if let Err(e) = port.close() {
                warn!("Error closing {}: {e}", self.port_name);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.port
            .is_some()
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn set_port_name(&mut self, name: &str) {
        self.port_name = name.to_string();
    }

    fn transmit(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {data:02x?}");
        let result = self
            .port_mut()
            .and_then(|p| p.write_all_bytes(data));
        result.map_err(|e| self.fail(e))
    }

    fn device_ready(&mut self) -> Result<bool> {
        let result = self
            .port_mut()
            .and_then(Port::read_cts);
        result.map_err(|e| self.fail(e))
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        let result = self
            .port_mut()
            .and_then(|p| p.set_dtr(level));
        result.map_err(|e| self.fail(e))
    }

    fn set_break(&mut self, level: bool) -> Result<()> {
        let result = self
            .port_mut()
            .and_then(|p| p.set_break(level));
        result.map_err(|e| self.fail(e))
    }

    fn receive(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        let mut chunk = [0u8; RECEIVE_CHUNK];
        let result = match self.port_mut() {
            Ok(port) => port
                .read(&mut chunk)
                .map_err(Error::Io),
            Err(e) => Err(e),
        };
        match result {
            Ok(n) => {
                if n > 0 {
                    trace!("RX {:02x?}", &chunk[..n]);
                    buf.extend_from_slice(&chunk[..n]);
                }
                Ok(n)
            },
            Err(Error::Io(e)) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Ok(0)
            },
            Err(e) => Err(self.fail(e)),
        }
    }
}

fn is_unplug_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::PermissionDenied
    )
}

/// Whether an error means the device went away (resource or permission loss).
fn is_unplug(err: &Error) -> bool {
    match err {
        Error::Io(e) => is_unplug_io(e),
        #[cfg(feature = "native")]
        Error::Serial(e) => match e.kind() {
            serialport::ErrorKind::NoDevice => true,
            serialport::ErrorKind::Io(kind) => is_unplug_kind(kind),
            _ => false,
        },
        _ => false,
    }
}

fn is_unplug_io(err: &io::Error) -> bool {
    is_unplug_kind(err.kind())
}
