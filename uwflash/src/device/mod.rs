//! Serial device discovery and classification.
//!
//! Modules are usually attached through a USB-to-UART bridge. Knowing which
//! bridge backs a port matters for hardware bootloader entry, which drives
//! the bridge's GPIO lines and needs its serial number.

#[cfg(feature = "native")]
use {
    crate::port::{NativePortEnumerator, PortEnumerator},
    log::{debug, trace},
};
use crate::{
    error::{Error, Result},
    port::PortInfo,
};

/// FTDI USB vendor id.
pub const FTDI_VID: u16 = 0x0403;

/// FT232R product id used on the BL654 USB dongle and Pinnacle 100 DVK.
pub const FTDI_FT232R_PID: u16 = 0x6001;

/// Number of serial number characters the bridge reports over USB.
pub const BRIDGE_SERIAL_LEN: usize = 8;

/// Known USB bridge kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum DeviceKind {
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs for common USB-to-UART bridges.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        FTDI_VID,
        &[FTDI_FT232R_PID, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && pids.contains(&pid) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the kind was recognised.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// A serial port with its bridge classification.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified bridge kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

impl DetectedPort {
    /// Whether this port can be used for hardware bootloader entry.
    pub fn supports_bitbang_entry(&self) -> bool {
        self.vid == Some(FTDI_VID) && self.pid == Some(FTDI_FT232R_PID)
    }
}

/// Detect all serial ports with metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let detected = DetectedPort::from(info);
                trace!(
                    "Found port: {} ({:?}, serial {:?})",
                    detected.name, detected.device, detected.serial
                );
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Detect all serial ports (no native support compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Normalise a bridge serial number to what the bridge reports over USB.
///
/// Serial numbers longer than [`BRIDGE_SERIAL_LEN`] are cut down; only ASCII
/// letters, digits and `-` are accepted.
pub fn normalize_bridge_serial(serial: &str) -> Result<String> {
    let serial = serial.trim();
    if serial.is_empty()
        || !serial
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(Error::SerialNumberInvalid(serial.to_string()));
    }
    Ok(serial
        .chars()
        .take(BRIDGE_SERIAL_LEN)
        .collect())
}

/// Serial number of the bridge backing `port_name`, if the port is known.
#[cfg(feature = "native")]
pub fn bridge_serial_for_port(port_name: &str) -> Option<String> {
    detect_ports()
        .into_iter()
        .find(|p| p.name == port_name)
        .and_then(|p| p.serial)
}

/// Port currently backed by the bridge with this serial number.
#[cfg(feature = "native")]
pub fn find_port_by_serial(serial: &str) -> Result<Option<String>> {
    Ok(NativePortEnumerator::find_by_serial(serial)?.map(|p| p.name))
}

/// Format a list of detected ports for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let device_info = if port
                .device
                .is_known()
            {
                format!(" [{}]", port.device.name())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" [VID:{vid:04X} PID:{pid:04X}]")
            } else {
                String::new()
            };
            let serial_info = port
                .serial
                .as_ref()
                .map(|s| format!(" (serial {s})"))
                .unwrap_or_default();
            format!("{}{device_info}{serial_info}", port.name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ftdi_port() -> DetectedPort {
        DetectedPort::from(PortInfo {
            name: "/dev/ttyUSB0".to_string(),
            vid: Some(FTDI_VID),
            pid: Some(FTDI_FT232R_PID),
            manufacturer: Some("FTDI".to_string()),
            product: Some("FT232R USB UART".to_string()),
            serial_number: Some("A1B2C3D4".to_string()),
        })
    }

    #[test]
    fn test_device_kind_from_vid_pid() {
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_ftdi_port_supports_bitbang() {
        let port = ftdi_port();
        assert_eq!(port.device, DeviceKind::Ftdi);
        assert!(port.supports_bitbang_entry());

        let mut other = port;
        other.pid = Some(0x6015);
        assert!(!other.supports_bitbang_entry());
    }

    #[test]
    fn test_normalize_bridge_serial() {
        assert_eq!(normalize_bridge_serial("A1B2C3D4").unwrap(), "A1B2C3D4");
        assert_eq!(normalize_bridge_serial("DT04-ABCDEF12").unwrap(), "DT04-ABC");
        assert_eq!(normalize_bridge_serial(" AB12 ").unwrap(), "AB12");
        assert!(matches!(
            normalize_bridge_serial("AB 12"),
            Err(Error::SerialNumberInvalid(_))
        ));
        assert!(normalize_bridge_serial("").is_err());
        assert!(normalize_bridge_serial("ab_cd").is_err());
    }

    #[test]
    fn test_format_port_list() {
        let unknown = DetectedPort {
            name: "/dev/ttyS0".to_string(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        };
        let formatted = format_port_list(&[ftdi_port(), unknown]);
        assert_eq!(formatted[0], "/dev/ttyUSB0 [FTDI] (serial A1B2C3D4)");
        assert_eq!(formatted[1], "/dev/ttyS0");
    }
}
