//! Bootloader entry.
//!
//! A module can be put into its bootloader in three ways:
//!
//! - in software, by sending `AT+FUP` to the running application
//! - in hardware, by driving the reset and autorun lines through the GPIO
//!   pins of the FTDI bridge on the development board (bit-bang mode)
//! - both, for the BL654 USB dongle: a hardware reset with autorun blocked
//!   leaves the module in interactive mode, ready for `AT+FUP`
//!
//! Hardware entry is split in two: [`run_sequence`] drives any
//! [`BitbangDevice`] through the pin sequence for a board, and a
//! [`BridgeBackend`] finds and opens the bridge. The libusb backend lives in
//! [`ftdi`] behind the `ftdi` feature.

#[cfg(feature = "ftdi")]
pub mod ftdi;

use {
    crate::error::{Error, Result},
    log::debug,
    std::{fmt, str::FromStr, thread, time::Duration},
};

/// How the module is put into its bootloader before the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum EntryMethod {
    /// The module is already in its bootloader.
    None,
    /// Send `AT+FUP` to the application.
    #[default]
    AtFup,
    /// BL654 USB dongle: hardware reset into interactive mode, then `AT+FUP`.
    Bl654Usb,
    /// Pinnacle 100 DVK: hardware reset straight into the bootloader.
    Pinnacle100,
}

impl EntryMethod {
    /// Every method, in display order.
    pub const ALL: [Self; 4] = [Self::None, Self::AtFup, Self::Bl654Usb, Self::Pinnacle100];

    /// Name used in configuration files and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AtFup => "at-fup",
            Self::Bl654Usb => "bl654-usb",
            Self::Pinnacle100 => "pinnacle100",
        }
    }

    /// Whether the port is first opened at the application baud rate.
    pub fn uses_application_baud(self) -> bool {
        matches!(self, Self::AtFup | Self::Bl654Usb)
    }

    /// Whether `AT+FUP` is sent to the application.
    pub fn sends_at_fup(self) -> bool {
        matches!(self, Self::AtFup | Self::Bl654Usb)
    }

    /// Board whose bridge must be bit-banged, if any.
    pub fn bridge_board(self) -> Option<BridgeBoard> {
        match self {
            Self::Bl654Usb => Some(BridgeBoard::Bl654Usb),
            Self::Pinnacle100 => Some(BridgeBoard::Pinnacle100),
            Self::None | Self::AtFup => None,
        }
    }
}

impl fmt::Display for EntryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntryMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| Error::InvalidSetting(format!("unknown bootloader entry method '{s}'")))
    }
}

/// Bridge GPIO pin masks (FT232R bit-bang bit numbers).
pub mod pins {
    /// RXD.
    pub const RX: u8 = 0x01;
    /// RTS.
    pub const RTS: u8 = 0x04;
    /// BL654 USB: module supply enable.
    pub const BL654_VSP: u8 = 0x20;
    /// Module reset, active low.
    pub const NRESET: u8 = 0x40;
    /// BL654 USB: autorun, held low to stay out of the application.
    pub const BL654_AUTORUN: u8 = 0x80;
    /// Pinnacle 100: bootloader entry, held low to enter.
    pub const PINNACLE100_ENTER_BL: u8 = 0x80;
}

/// Delay between pin states.
pub const STEP_DELAY: Duration = Duration::from_millis(400);

/// Board with a bit-bang capable bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeBoard {
    /// BL654 USB dongle.
    Bl654Usb,
    /// Pinnacle 100 development kit.
    Pinnacle100,
}

impl BridgeBoard {
    /// Pins switched to outputs.
    pub fn output_mask(self) -> u8 {
        match self {
            Self::Bl654Usb => {
                pins::RX | pins::RTS | pins::BL654_VSP | pins::NRESET | pins::BL654_AUTORUN
            },
            Self::Pinnacle100 => pins::RX | pins::RTS | pins::PINNACLE100_ENTER_BL | pins::NRESET,
        }
    }

    /// Pin states written in order; the entry pin stays low throughout.
    ///
    /// Reset is released, asserted, then released again while the entry
    /// pin is held low.
    pub fn steps(self) -> [u8; 3] {
        let idle = match self {
            Self::Bl654Usb => pins::BL654_VSP | pins::RX | pins::RTS,
            Self::Pinnacle100 => pins::RX | pins::RTS,
        };
        [idle | pins::NRESET, idle, idle | pins::NRESET]
    }
}

impl fmt::Display for BridgeBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bl654Usb => f.write_str("BL654 USB"),
            Self::Pinnacle100 => f.write_str("Pinnacle 100"),
        }
    }
}

/// A bridge whose GPIO lines can be driven directly.
pub trait BitbangDevice {
    /// Enter asynchronous bit-bang mode with `mask` as outputs, or leave it.
    fn set_bitbang(&mut self, mask: u8, enable: bool) -> Result<()>;

    /// Set the write chunk size.
    fn set_chunk_size(&mut self, size: u32) -> Result<()>;

    /// Write one pin state.
    fn write_pins(&mut self, value: u8) -> Result<()>;
}

/// Drive `device` through the entry sequence for `board`.
///
/// The bridge is always returned to normal UART mode, also when a pin
/// write fails part way.
pub fn run_sequence<D: BitbangDevice>(
    device: &mut D,
    board: BridgeBoard,
    delay: Duration,
) -> Result<()> {
    let mask = board.output_mask();
    debug!("Entering bit-bang mode on {board} bridge, mask {mask:#04x}");
    device.set_bitbang(mask, true)?;

    let result = device
        .set_chunk_size(1)
        .and_then(|()| {
            for value in board.steps() {
                device.write_pins(value)?;
                thread::sleep(delay);
            }
            Ok(())
        });

    let exit = device.set_bitbang(mask, false);
    result?;
    exit
}

/// Parameters for a hardware entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeRequest {
    /// Serial port the module is attached to.
    pub port_name: String,
    /// Board to reset.
    pub board: BridgeBoard,
    /// Bridge serial number to use instead of the port's.
    pub serial_override: Option<String>,
}

/// Finds, opens and bit-bangs the bridge for a hardware entry.
pub trait BridgeBackend {
    /// Reset the module into its bootloader.
    ///
    /// Returns the new port name if the OS renamed the serial device while
    /// the bridge was detached.
    fn enter(&mut self, request: &BridgeRequest) -> Result<Option<String>>;
}

/// Backend for builds without USB support.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBridge;

impl BridgeBackend for UnsupportedBridge {
    fn enter(&mut self, request: &BridgeRequest) -> Result<Option<String>> {
        Err(Error::EntryNotSupported(format!(
            "{} entry needs a build with the `ftdi` feature",
            request.board
        )))
    }
}

/// Bridge backend for this build.
pub fn default_backend() -> Box<dyn BridgeBackend + Send> {
    #[cfg(feature = "ftdi")]
    {
        Box::new(ftdi::FtdiBackend::default())
    }
    #[cfg(not(feature = "ftdi"))]
    {
        Box::new(UnsupportedBridge)
    }
}

/// Confirms a hardware entry before any pin is driven.
///
/// Returning [`Error::EntryCancelled`] or [`Error::SetupRequired`] aborts the
/// session.
pub trait EntryConsent {
    /// Ask whether `method` may reset the module.
    fn confirm(&mut self, method: EntryMethod) -> Result<()>;
}

impl<F> EntryConsent for F
where
    F: FnMut(EntryMethod) -> Result<()>,
{
    fn confirm(&mut self, method: EntryMethod) -> Result<()> {
        self(method)
    }
}
