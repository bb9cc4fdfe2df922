//! [`Port`] backed by the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Port, PortEnumerator, PortInfo, PortOpener, SerialConfig},
    },
    log::trace,
    serialport::ClearBuffer,
    std::io::{Read, Write},
};

/// An open OS serial device. `None` once closed.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
}

impl NativePort {
    /// Open `config.port_name` 8-N-1 at the configured rate.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        trace!("Opening {} at {} baud", config.port_name, config.baud_rate);
        let port = serialport::new(&config.port_name, config.baud_rate)
            .timeout(config.timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::Hardware)
            .open()?;

        Ok(Self {
            port: Some(port),
            name: config
                .port_name
                .clone(),
        })
    }

    fn port_io(&mut self) -> std::io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| {
                let message = format!("{} is closed", self.name);
                std::io::Error::new(std::io::ErrorKind::NotConnected, message)
            })
    }

    fn closed_error() -> Error {
        Error::Serial(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "Port is closed",
        ))
    }
}

impl Port for NativePort {
    fn clear_buffers(&mut self) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.clear(ClearBuffer::All)?;
            Ok(())
        } else {
            Err(Self::closed_error())
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        if let Some(ref mut p) = self.port {
            p.write_data_terminal_ready(level)?;
        }
        Ok(())
    }

    fn set_break(&mut self, level: bool) -> Result<()> {
        trace!("Setting BREAK to {level}");
        match self.port {
            Some(ref mut p) if level => p.set_break()?,
            Some(ref mut p) => p.clear_break()?,
            None => return Err(Self::closed_error()),
        }
        Ok(())
    }

    fn read_cts(&mut self) -> Result<bool> {
        if let Some(ref mut p) = self.port {
            p.read_clear_to_send()
                .map_err(Error::Serial)
        } else {
            Err(Self::closed_error())
        }
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the handle closes the device
        self.port
            .take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port_io()?
            .read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port_io()?
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port_io()?
            .flush()
    }
}

/// Opens [`NativePort`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOpener;

impl PortOpener for NativeOpener {
    type Port = NativePort;

    fn open(&mut self, config: &SerialConfig) -> Result<NativePort> {
        NativePort::open(config)
    }
}

/// Lists OS serial devices with their USB descriptors.
pub struct NativePortEnumerator;

impl PortEnumerator for NativePortEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product, serial_number) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer
                            .clone(),
                        info.product
                            .clone(),
                        info.serial_number
                            .clone(),
                    ),
                    _ => (None, None, None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                    serial_number,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // Enumeration must not fail just because nothing is attached.
        if let Ok(ports) = NativePortEnumerator::list_ports() {
            assert!(ports.iter().all(|p| !p.name.is_empty()));
        }
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::new("/dev/uwflash-does-not-exist", 115200);
        assert!(NativeOpener.open(&config).is_err());
    }
}
