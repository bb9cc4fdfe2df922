//! Error types for uwflash.
//!
//! Every failure carries the [`Module`] it originated from so callers can
//! report the module/error pair the same way regardless of whether the
//! problem was in the upgrade file, the serial link, the bootloader or the
//! USB bridge used for hardware bootloader entry.

use {
    std::{fmt, io, path::PathBuf},
    thiserror::Error,
};

/// Result type for uwflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Component an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Module {
    /// Serial transport.
    Uart,
    /// Firmware update engine.
    Update,
    /// Upgrade file reader and validator.
    Uwf,
    /// Session settings.
    Settings,
    /// Bootloader entry (AT command or USB bridge bit-bang).
    BootloaderEntrance,
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uart => "uart",
            Self::Update => "update",
            Self::Uwf => "uwf",
            Self::Settings => "settings",
            Self::BootloaderEntrance => "bootloader-entrance",
        };
        f.write_str(name)
    }
}

/// Error type for uwflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Upgrade file does not exist.
    #[error("Specified Uwf/Ubu file was not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Upgrade file exists but could not be opened for reading.
    #[error("Specified Uwf/Ubu file could not be opened for read access: {}", .0.display())]
    OpenDenied(PathBuf),

    /// Upgrade file is smaller than one command header or above the size cap.
    #[error("Specified Uwf/Ubu file is too small or large ({size} bytes)")]
    FileInvalidSize {
        /// Size of the file in bytes.
        size: u64,
    },

    /// A command in the upgrade file has a payload length its id does not allow.
    #[error("Specified Uwf/Ubu file is not valid: {0}")]
    FileNotValid(String),

    /// The upgrade file contains a command id that is not understood.
    #[error("Specified Uwf/Ubu file has an invalid command: {0}")]
    FileCommandInvalid(String),

    /// A command payload length exceeds the file or per-command cap.
    #[error("Specified Uwf/Ubu file has a command with an invalid length ({length})")]
    FilePacketLengthInvalid {
        /// Declared payload length.
        length: u32,
    },

    /// Seeking relative to the end of the upgrade file was requested.
    #[error("Seeking relative to the end of an upgrade file is not supported")]
    SeekUnsupported,

    /// Unlock key is neither empty nor exactly the bootloader key size.
    #[error("Specified bootloader unlock key length is not valid ({len} bytes)")]
    UnlockKeyInvalidSize {
        /// Supplied key length.
        len: usize,
    },

    /// A session setting is out of range.
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// The serial port could not be opened.
    #[error("Serial port {port} failed to open: {reason}")]
    PortFailedToOpen {
        /// Port name/path.
        port: String,
        /// Underlying reason.
        reason: String,
    },

    /// The serial port could not be reopened at the bootloader baud rate.
    #[error("Serial port re-open failed: {0}")]
    PortReopenFailed(String),

    /// The serial port could not be reopened at the negotiated baud rate.
    #[error("Failed to open serial port at baud rate {baud}")]
    BaudRateChangeFailed {
        /// Requested baud rate.
        baud: u32,
    },

    /// I/O was attempted on a transport that is not open.
    #[error("Serial port is not open")]
    PortNotOpen,

    /// The serial device disappeared while a session was active.
    #[error("Serial device has been unplugged")]
    DeviceUnplugged,

    /// The module never asserted CTS.
    #[error("CTS timeout whilst attempting to communicate with module")]
    CtsTimeout,

    /// No response to a command within the command timeout.
    #[error("Command sent to module has timed out")]
    CommandTimeout,

    /// A command in the upgrade file could not be executed.
    #[error("Firmware upgrade failed: {0}")]
    ReturnCodeError(String),

    /// Legacy erase found no sector map entry for the erase address.
    #[error("A sector mapping was not found when attempting to erase sector data at {address:#010x}")]
    SectorMappingNotFound {
        /// Address that was being erased.
        address: u32,
    },

    /// The bootloader rejected a verify span.
    #[error("Data verification failed")]
    VerificationFailed,

    /// The requested exact baud rate is not offered by the bootloader.
    #[error("Exact baud-rate {baud} not supported by module or serial port")]
    ExactBaudNotFound {
        /// Requested baud rate.
        baud: u32,
    },

    /// Every offered baud rate is above the configured maximum.
    #[error("Failed to select a baudrate under the defined maximum of {max}")]
    MaxBaudUnsuitable {
        /// Configured maximum.
        max: u32,
    },

    /// The bootloader answered with an error response.
    #[error("Bootloader error: {0}")]
    Bootloader(BootloaderError),

    /// Bootloader entry failed.
    #[error("Bootloader entrance failed: {0}")]
    EntranceFailed(#[source] Box<Error>),

    /// The embedding application requested the session to stop.
    #[error("Operation interrupted")]
    Interrupted,

    /// A session is already active on this engine.
    #[error("An update session is already in progress")]
    SessionActive,

    /// The user declined the hardware bootloader entry prompt.
    #[error("Enter bootloader operation cancelled by user")]
    EntryCancelled,

    /// Hardware bootloader entry needs a one-time host setup acknowledgement.
    #[error("Further system setup required: {0}")]
    SetupRequired(String),

    /// The USB library could not be initialised.
    #[error("USB library initialisation failed: {0}")]
    UsbInitFailed(String),

    /// The USB bridge could not be opened.
    #[error("USB port open failed: {0}")]
    BridgeOpenFailed(String),

    /// The bridge refused the bit-bang mode change.
    #[error("FTDI bitbang mode set failed: {0}")]
    BitbangModeFailed(String),

    /// The bridge refused the chunk size change.
    #[error("USB chunk size set failed: {0}")]
    ChunkSizeFailed(String),

    /// Writing a pin state to the bridge failed.
    #[error("USB data write failed: {0}")]
    BridgeWriteFailed(String),

    /// Resetting the USB device failed.
    #[error("USB reset failed: {0}")]
    UsbResetFailed(String),

    /// Releasing the USB bridge failed.
    #[error("USB port close failed: {0}")]
    BridgeCloseFailed(String),

    /// Reading the USB device descriptor failed.
    #[error("USB device descriptor fetch failed: {0}")]
    DescriptorFetchFailed(String),

    /// Reading a USB string descriptor failed.
    #[error("USB get string descriptor failed: {0}")]
    StringDescriptorFailed(String),

    /// No bridge with the expected ids and serial number is attached.
    #[error("USB device was not found (serial {serial})")]
    BridgeNotFound {
        /// Serial number that was searched for.
        serial: String,
    },

    /// The USB device found is not an FTDI bridge.
    #[error("Invalid USB device specified: {0}")]
    InvalidBridge(String),

    /// The bridge serial number contains invalid characters.
    #[error("FTDI serial number is not valid: {0:?}")]
    SerialNumberInvalid(String),

    /// Hardware bootloader entry is not available in this build or platform.
    #[error("Hardware bootloader entry not supported: {0}")]
    EntryNotSupported(String),
}

impl Error {
    /// Component the error is attributed to.
    pub fn module(&self) -> Module {
        match self {
            Self::Io(_) => Module::Update,
            #[cfg(feature = "native")]
            Self::Serial(_) => Module::Uart,
            Self::FileNotFound(_)
            | Self::OpenDenied(_)
            | Self::FileInvalidSize { .. }
            | Self::FileNotValid(_)
            | Self::FileCommandInvalid(_)
            | Self::FilePacketLengthInvalid { .. }
            | Self::SeekUnsupported => Module::Uwf,
            Self::UnlockKeyInvalidSize { .. } | Self::InvalidSetting(_) => Module::Settings,
            Self::PortFailedToOpen { .. }
            | Self::PortReopenFailed(_)
            | Self::BaudRateChangeFailed { .. }
            | Self::PortNotOpen
            | Self::DeviceUnplugged => Module::Uart,
            Self::CtsTimeout
            | Self::CommandTimeout
            | Self::ReturnCodeError(_)
            | Self::SectorMappingNotFound { .. }
            | Self::VerificationFailed
            | Self::ExactBaudNotFound { .. }
            | Self::MaxBaudUnsuitable { .. }
            | Self::Bootloader(_)
            | Self::Interrupted
            | Self::SessionActive => Module::Update,
            Self::EntranceFailed(_)
            | Self::EntryCancelled
            | Self::SetupRequired(_)
            | Self::UsbInitFailed(_)
            | Self::BridgeOpenFailed(_)
            | Self::BitbangModeFailed(_)
            | Self::ChunkSizeFailed(_)
            | Self::BridgeWriteFailed(_)
            | Self::UsbResetFailed(_)
            | Self::BridgeCloseFailed(_)
            | Self::DescriptorFetchFailed(_)
            | Self::StringDescriptorFailed(_)
            | Self::BridgeNotFound { .. }
            | Self::InvalidBridge(_)
            | Self::SerialNumberInvalid(_)
            | Self::EntryNotSupported(_) => Module::BootloaderEntrance,
        }
    }

    /// Whether this error means the serial device went away.
    pub fn is_unplugged(&self) -> bool {
        matches!(self, Self::DeviceUnplugged)
    }
}

/// Error code reported by the bootloader in an `f` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderError {
    /// Write failed.
    Write,
    /// Read failed.
    Read,
    /// Erase failed.
    Erase,
    /// Unrecognised command.
    Unrecognised,
    /// Invalid platform.
    Platform,
    /// Bypass write.
    BypassWrite,
    /// Bypass not empty.
    BypassNotEmpty,
    /// Supplied address is not valid.
    InvalidAddress,
    /// Supplied key does not exist.
    InvalidKey,
    /// Supplied software id does not exist.
    InvalidSoftwareId,
    /// QSPI erase command failed.
    EraseQspiCmdFail,
    /// Flash erase failed.
    EraseFlashEraseFail,
    /// QSPI erase failed.
    EraseQspiEraseFail,
    /// Erase failed for an unknown reason.
    EraseUnknown,
    /// Timer creation failed.
    TimerFailed,
    /// Partition data is not loaded.
    PartitionNotLoaded,
    /// Invalid query id.
    InvalidQueryId,
    /// Invalid query sub id.
    InvalidQuerySubId,
    /// Partition id is invalid.
    InvalidPartition,
    /// No partition exists with the id.
    PartitionEmpty,
    /// Regression test failed.
    RegressionTestFail,
    /// Debug output too large.
    DebugOutputUartSize,
    /// Debug output failed.
    DebugOutputErr,
    /// Write-once value is not set (module is not locked).
    WormNotSet,
    /// Write-once value already set.
    WormSet,
    /// Write-once id not valid.
    WormInvalidId,
    /// Write-once value requires hex data.
    WormInvalidHex,
    /// Write-once value size not valid.
    WormInvalidDataSize,
    /// Write protection active.
    WriteProtected,
    /// Read access denied.
    ReadAccessDenied,
    /// Module has no valid license.
    NoLicense,
    /// Supplied value is incorrect.
    InvalidValue,
    /// Readback protection is active.
    ReadbackProtected,
    /// Read size too large.
    ReadSizeTooLarge,
    /// Write size too large.
    WriteSizeTooLarge,
    /// Erase confirmation code not valid.
    EraseConfirmNotValid,
    /// Supplied checksum is incorrect.
    Checksum,
    /// Bridge flow control value not valid.
    InvalidBridgeFlow,
    /// Bridge baud rate value not valid.
    InvalidBridgeBaud,
    /// Bridge failed.
    BridgeFailed,
    /// Value is read only.
    InputWriteNotAllowed,
    /// Flash is locked with a key.
    FlashLockedWithKey,
    /// Flash key is missing.
    FlashKeyMissing,
    /// Full erase is not allowed.
    FullEraseDisabled,
    /// Hardware error.
    HardwareError,
    /// Flash section is in use.
    FlashSectionInUse,
    /// Flash section reserved for the user application.
    FlashReservedForUser,
    /// Hardware is not initialised.
    HardwareNotInitialised,
    /// Too many attempts, access denied.
    TooManyAttemptsDenied,
    /// Verification area is too small.
    VerifyAreaTooSmall,
    /// Code not known to this host.
    Unknown(u8),
}

/// Codes in wire order, starting at 0x01.
const CODE_TABLE: &[BootloaderError] = &[
    BootloaderError::Write,
    BootloaderError::Read,
    BootloaderError::Erase,
    BootloaderError::Unrecognised,
    BootloaderError::Platform,
    BootloaderError::BypassWrite,
    BootloaderError::BypassNotEmpty,
    BootloaderError::InvalidAddress,
    BootloaderError::InvalidKey,
    BootloaderError::InvalidSoftwareId,
    BootloaderError::EraseQspiCmdFail,
    BootloaderError::EraseFlashEraseFail,
    BootloaderError::EraseQspiEraseFail,
    BootloaderError::EraseUnknown,
    BootloaderError::TimerFailed,
    BootloaderError::PartitionNotLoaded,
    BootloaderError::InvalidQueryId,
    BootloaderError::InvalidQuerySubId,
    BootloaderError::InvalidPartition,
    BootloaderError::PartitionEmpty,
    BootloaderError::RegressionTestFail,
    BootloaderError::DebugOutputUartSize,
    BootloaderError::DebugOutputErr,
    BootloaderError::WormNotSet,
    BootloaderError::WormSet,
    BootloaderError::WormInvalidId,
    BootloaderError::WormInvalidHex,
    BootloaderError::WormInvalidDataSize,
    BootloaderError::WriteProtected,
    BootloaderError::ReadAccessDenied,
    BootloaderError::NoLicense,
    BootloaderError::InvalidValue,
    BootloaderError::ReadbackProtected,
    BootloaderError::ReadSizeTooLarge,
    BootloaderError::WriteSizeTooLarge,
    BootloaderError::EraseConfirmNotValid,
    BootloaderError::Checksum,
    BootloaderError::InvalidBridgeFlow,
    BootloaderError::InvalidBridgeBaud,
    BootloaderError::BridgeFailed,
    BootloaderError::InputWriteNotAllowed,
    BootloaderError::FlashLockedWithKey,
    BootloaderError::FlashKeyMissing,
    BootloaderError::FullEraseDisabled,
    BootloaderError::HardwareError,
    BootloaderError::FlashSectionInUse,
    BootloaderError::FlashReservedForUser,
    BootloaderError::HardwareNotInitialised,
    BootloaderError::TooManyAttemptsDenied,
    BootloaderError::VerifyAreaTooSmall,
];

impl BootloaderError {
    /// Decode a wire error code.
    pub fn from_code(code: u8) -> Self {
        usize::from(code)
            .checked_sub(1)
            .and_then(|index| CODE_TABLE.get(index))
            .copied()
            .unwrap_or(Self::Unknown(code))
    }

    /// Wire error code.
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown(code) => code,
            known => CODE_TABLE
                .iter()
                .position(|entry| *entry == known)
                .map_or(0, |index| (index + 1) as u8),
        }
    }

    /// Human-readable description.
    pub fn message(self) -> &'static str {
        match self {
            Self::Write => "Write failed",
            Self::Read => "Read failed",
            Self::Erase => "Erase failed",
            Self::Unrecognised => "Unrecognised command",
            Self::Platform => "Invalid platform",
            Self::BypassWrite => "Bypass write",
            Self::BypassNotEmpty => "Bypass not empty",
            Self::InvalidAddress => "Supplied address is not valid",
            Self::InvalidKey => "Supplied key does not exist",
            Self::InvalidSoftwareId => "Supplied software ID does not exist",
            Self::EraseQspiCmdFail
            | Self::EraseFlashEraseFail
            | Self::EraseQspiEraseFail
            | Self::EraseUnknown => "Erase failed (hardware error)",
            Self::TimerFailed => "Timer creation failed",
            Self::PartitionNotLoaded => "Partition data is not loaded",
            Self::InvalidQueryId => "Invalid query ID",
            Self::InvalidQuerySubId => "Invalid query sub ID",
            Self::InvalidPartition => "Supplied partition ID is invalid",
            Self::PartitionEmpty => "No partition exists with supplied ID",
            Self::RegressionTestFail => "Regression test failed",
            Self::DebugOutputUartSize => "Trying to output too much data",
            Self::DebugOutputErr => "Error whilst outputting data",
            Self::WormNotSet => "WORM value not set",
            Self::WormSet => "WORM value already set",
            Self::WormInvalidId => "WORM ID not valid",
            Self::WormInvalidHex => "WORM value requires hex data",
            Self::WormInvalidDataSize => "WORM value size not valid",
            Self::WriteProtected => "Write protection active",
            Self::ReadAccessDenied => "Read access denied",
            Self::NoLicense => "Module does not have a valid license",
            Self::InvalidValue => "Supplied value is incorrect",
            Self::ReadbackProtected => "Readback protection is active",
            Self::ReadSizeTooLarge => "Specified read size is too large",
            Self::WriteSizeTooLarge => "Specified write size is too large",
            Self::EraseConfirmNotValid => "Erase confirmation code not valid",
            Self::Checksum => "Supplied checksum is incorrect",
            Self::InvalidBridgeFlow => "Bridge flow control value not valid",
            Self::InvalidBridgeBaud => "Bridge baud rate value not valid",
            Self::BridgeFailed => "Bridge failed",
            Self::InputWriteNotAllowed => "Read only value, write not allowed",
            Self::FlashLockedWithKey => "Flash is locked with a key",
            Self::FlashKeyMissing => "Flash key is missing",
            Self::FullEraseDisabled => "Full erase is not allowed",
            Self::HardwareError => "Hardware error",
            Self::FlashSectionInUse => "Flash section is in use",
            Self::FlashReservedForUser => "Flash section is reserved for user-application use",
            Self::HardwareNotInitialised => "Hardware is not initialised",
            Self::TooManyAttemptsDenied => "Invalid, access denied",
            Self::VerifyAreaTooSmall => "Verification area is too small",
            Self::Unknown(_) => "Unknown bootloader error",
        }
    }
}

impl fmt::Display for BootloaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message(), self.code())
    }
}
