//! FTDI bridge backend over libusb.
//!
//! Only the FT232R on the BL654 USB dongle and the Pinnacle 100 DVK is
//! supported. The bridge is selected by its USB serial number, which the
//! chip reports as at most eight characters.

use {
    super::{BitbangDevice, BridgeBackend, BridgeRequest, STEP_DELAY, run_sequence},
    crate::{
        device::{
            self, FTDI_FT232R_PID, FTDI_VID, bridge_serial_for_port, normalize_bridge_serial,
        },
        error::{Error, Result},
    },
    log::{debug, info, warn},
    rusb::{Context, Device, DeviceHandle, Direction, Recipient, RequestType, UsbContext},
    std::{thread, time::Duration},
};

/// FTDI vendor request: reset the SIO.
const SIO_RESET: u8 = 0x00;
/// FTDI vendor request: set baud rate divisor.
const SIO_SET_BAUDRATE: u8 = 0x03;
/// FTDI vendor request: set bit mode.
const SIO_SET_BITMODE: u8 = 0x0B;

/// Bit mode value that returns the bridge to UART operation.
const BITMODE_RESET: u16 = 0x00;
/// Asynchronous bit-bang bit mode.
const BITMODE_BITBANG: u16 = 0x01;

/// Bulk OUT endpoint of interface A.
const ENDPOINT_OUT: u8 = 0x02;
/// Interface A, as numbered by the FTDI vendor requests.
const FTDI_INDEX: u16 = 1;
/// USB interface number.
const INTERFACE: u8 = 0;
/// Divisor for 9600 baud, the bit-bang clock.
const BITBANG_BAUD_DIVISOR: u16 = 0x4138;

const USB_TIMEOUT: Duration = Duration::from_millis(1000);

/// Time for the OS to re-enumerate the serial device after the bridge is released.
const REATTACH_DELAY: Duration = Duration::from_millis(400);

/// Hardware entry through an FTDI bridge.
#[derive(Debug, Clone)]
pub struct FtdiBackend {
    step_delay: Duration,
}

impl Default for FtdiBackend {
    fn default() -> Self {
        Self {
            step_delay: STEP_DELAY,
        }
    }
}

impl FtdiBackend {
    /// Backend with a custom delay between pin states.
    pub fn with_step_delay(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl BridgeBackend for FtdiBackend {
    fn enter(&mut self, request: &BridgeRequest) -> Result<Option<String>> {
        let serial = match &request.serial_override {
            Some(serial) => normalize_bridge_serial(serial)?,
            None => {
                let serial = bridge_serial_for_port(&request.port_name).ok_or_else(|| {
                    Error::InvalidBridge(format!(
                        "{} is not backed by a USB device with a serial number",
                        request.port_name
                    ))
                })?;
                normalize_bridge_serial(&serial)?
            },
        };
        info!("Resetting {} module through FTDI bridge {serial}", request.board);

        let context = Context::new().map_err(|e| Error::UsbInitFailed(e.to_string()))?;
        let device = find_bridge(&context, &serial)?;
        let handle = device
            .open()
            .map_err(|e| Error::BridgeOpenFailed(e.to_string()))?;
        check_manufacturer(&device, &handle)?;

        let mut bridge = FtdiBridge::claim(handle)?;
        let result = bridge
            .prepare()
            .and_then(|()| run_sequence(&mut bridge, request.board, self.step_delay));
        if result.is_err() {
            // Leave the bridge usable as a UART even if the sequence failed
            if let Err(e) = bridge.set_bitbang(0, false) {
                warn!("Failed to reset bit-bang mode: {e}");
            }
        }
        let released = bridge.release();
        result?;
        released?;

        thread::sleep(REATTACH_DELAY);
        let renamed = device::find_port_by_serial(&serial)?.filter(|name| *name != request.port_name);
        if let Some(name) = &renamed {
            info!("Serial port renamed from {} to {name}", request.port_name);
        }
        Ok(renamed)
    }
}

fn find_bridge(context: &Context, serial: &str) -> Result<Device<Context>> {
    let devices = context
        .devices()
        .map_err(|e| Error::UsbInitFailed(e.to_string()))?;
    for device in devices.iter() {
        let descriptor = device
            .device_descriptor()
            .map_err(|e| Error::DescriptorFetchFailed(e.to_string()))?;
        if descriptor.vendor_id() != FTDI_VID || descriptor.product_id() != FTDI_FT232R_PID {
            continue;
        }
        let Ok(handle) = device.open() else {
            debug!(
                "Skipping FTDI device on bus {} address {}: cannot open",
                device.bus_number(),
                device.address()
            );
            continue;
        };
        let found = handle
            .read_serial_number_string_ascii(&descriptor)
            .map_err(|e| Error::StringDescriptorFailed(e.to_string()))?;
        if found.starts_with(serial) {
            return Ok(device);
        }
    }
    Err(Error::BridgeNotFound {
        serial: serial.to_string(),
    })
}

fn check_manufacturer(device: &Device<Context>, handle: &DeviceHandle<Context>) -> Result<()> {
    let descriptor = device
        .device_descriptor()
        .map_err(|e| Error::DescriptorFetchFailed(e.to_string()))?;
    let manufacturer = handle
        .read_manufacturer_string_ascii(&descriptor)
        .map_err(|e| Error::StringDescriptorFailed(e.to_string()))?;
    if manufacturer.contains("FTDI") {
        Ok(())
    } else {
        Err(Error::InvalidBridge(format!(
            "manufacturer is {manufacturer:?}, expected FTDI"
        )))
    }
}

/// Claimed FT232R interface.
struct FtdiBridge {
    handle: DeviceHandle<Context>,
    kernel_driver_detached: bool,
}

impl FtdiBridge {
    fn claim(mut handle: DeviceHandle<Context>) -> Result<Self> {
        let mut kernel_driver_detached = false;
        if cfg!(target_os = "linux")
            && handle
                .kernel_driver_active(INTERFACE)
                .unwrap_or(false)
        {
            handle
                .detach_kernel_driver(INTERFACE)
                .map_err(|e| Error::BridgeOpenFailed(format!("detach kernel driver: {e}")))?;
            kernel_driver_detached = true;
        }
        handle
            .claim_interface(INTERFACE)
            .map_err(|e| Error::BridgeOpenFailed(format!("claim interface: {e}")))?;
        Ok(Self {
            handle,
            kernel_driver_detached,
        })
    }

    fn control(&self, request: u8, value: u16) -> rusb::Result<usize> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle
            .write_control(request_type, request, value, FTDI_INDEX, &[], USB_TIMEOUT)
    }

    fn prepare(&mut self) -> Result<()> {
        self.control(SIO_RESET, 0)
            .map_err(|e| Error::BridgeOpenFailed(format!("reset: {e}")))?;
        self.control(SIO_SET_BAUDRATE, BITBANG_BAUD_DIVISOR)
            .map_err(|e| Error::BridgeOpenFailed(format!("set baud rate: {e}")))?;
        Ok(())
    }

    fn release(mut self) -> Result<()> {
        if cfg!(target_os = "linux") {
            self.handle
                .reset()
                .map_err(|e| Error::UsbResetFailed(e.to_string()))?;
        }
        self.handle
            .release_interface(INTERFACE)
            .map_err(|e| Error::BridgeCloseFailed(e.to_string()))?;
        if self.kernel_driver_detached {
            self.handle
                .attach_kernel_driver(INTERFACE)
                .map_err(|e| Error::BridgeCloseFailed(format!("reattach kernel driver: {e}")))?;
        }
        Ok(())
    }
}

impl BitbangDevice for FtdiBridge {
    fn set_bitbang(&mut self, mask: u8, enable: bool) -> Result<()> {
        let mode = if enable { BITMODE_BITBANG } else { BITMODE_RESET };
        self.control(SIO_SET_BITMODE, (mode << 8) | u16::from(mask))
            .map_err(|e| Error::BitbangModeFailed(e.to_string()))?;
        Ok(())
    }

    /// Each pin state already goes out as its own one-byte libusb bulk
    /// write, so a chunk size of 1 is native and needs no request.
    fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        check_chunk_size(size)
    }

    fn write_pins(&mut self, value: u8) -> Result<()> {
        let written = self
            .handle
            .write_bulk(ENDPOINT_OUT, &[value], USB_TIMEOUT)
            .map_err(|e| Error::BridgeWriteFailed(e.to_string()))?;
        if written == 1 {
            Ok(())
        } else {
            Err(Error::BridgeWriteFailed(format!("{written} bytes written")))
        }
    }
}

fn check_chunk_size(size: u32) -> Result<()> {
    if size == 1 {
        Ok(())
    } else {
        Err(Error::ChunkSizeFailed(format!("unsupported chunk size {size}")))
    }
}
