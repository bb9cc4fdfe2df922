//! Update session settings.
//!
//! A session takes a snapshot of [`UpdateSettings`] when it starts; changes
//! made by the caller afterwards do not affect it.

use {
    crate::{
        entry::EntryMethod,
        error::{Error, Result},
        protocol::fup::UNLOCK_KEY_SIZE,
    },
    std::path::PathBuf,
};

/// Baud rate the application firmware listens on.
pub const DEFAULT_APPLICATION_BAUD: u32 = 115200;

/// Baud rate the bootloader starts at.
pub const DEFAULT_BOOTLOADER_BAUD: u32 = 115200;

/// Everything a session needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct UpdateSettings {
    /// Serial port of the module.
    pub port: String,
    /// Upgrade file.
    pub firmware: PathBuf,
    /// Baud rate of the application, used for `AT+FUP`.
    pub application_baud: u32,
    /// Baud rate of the bootloader before negotiation.
    pub bootloader_baud: u32,
    /// Highest baud rate to negotiate.
    pub max_baud: Option<u32>,
    /// Exact baud rate to negotiate; takes precedence over `max_baud`.
    pub exact_baud: Option<u32>,
    /// How the bootloader is entered.
    pub entry_method: EntryMethod,
    /// Treat every bootloader as a legacy one.
    pub disable_enhanced: bool,
    /// Pulse DTR/BREAK and wait for CTS before entering the bootloader.
    pub reboot_before: bool,
    /// DTR level held while rebooting before the update.
    pub reboot_dtr: bool,
    /// Reboot into the application when the update completes.
    pub reboot_after: bool,
    /// Ask the bootloader to verify written data.
    pub verify: bool,
    /// Validate the whole upgrade file before touching the module.
    pub validate: bool,
    /// Bootloader unlock key; empty or exactly 64 bytes.
    pub unlock_key: Vec<u8>,
    /// Bridge serial number to use for hardware entry.
    pub bridge_serial: Option<String>,
    /// Skip the confirmation before a hardware entry.
    pub skip_entry_confirmation: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            firmware: PathBuf::new(),
            application_baud: DEFAULT_APPLICATION_BAUD,
            bootloader_baud: DEFAULT_BOOTLOADER_BAUD,
            max_baud: None,
            exact_baud: None,
            entry_method: EntryMethod::default(),
            disable_enhanced: false,
            reboot_before: false,
            reboot_dtr: true,
            reboot_after: true,
            verify: true,
            validate: true,
            unlock_key: Vec::new(),
            bridge_serial: None,
            skip_entry_confirmation: false,
        }
    }
}

impl UpdateSettings {
    /// Settings for `firmware` on `port` with everything else defaulted.
    pub fn new(port: impl Into<String>, firmware: impl Into<PathBuf>) -> Self {
        Self {
            port: port.into(),
            firmware: firmware.into(),
            ..Self::default()
        }
    }

    /// Check values that do not need the module or the file.
    pub fn check(&self) -> Result<()> {
        if !self
            .unlock_key
            .is_empty()
            && self
                .unlock_key
                .len()
                != UNLOCK_KEY_SIZE
        {
            return Err(Error::UnlockKeyInvalidSize {
                len: self
                    .unlock_key
                    .len(),
            });
        }
        if self
            .port
            .is_empty()
        {
            return Err(Error::InvalidSetting("no serial port specified".to_string()));
        }
        for (name, baud) in [
            ("application", self.application_baud),
            ("bootloader", self.bootloader_baud),
        ] {
            if baud == 0 {
                return Err(Error::InvalidSetting(format!("{name} baud rate must not be 0")));
            }
        }
        Ok(())
    }

    /// Baud rate the port is first opened at.
    pub fn initial_baud(&self) -> u32 {
        if self
            .entry_method
            .uses_application_baud()
        {
            self.application_baud
        } else {
            self.bootloader_baud
        }
    }
}

/// Parse an unlock key given as 128 hex digits.
pub fn parse_unlock_key(hex: &str) -> Result<Vec<u8>> {
    let hex = hex.trim();
    if hex.len() % 2 != 0 {
        return Err(Error::UnlockKeyInvalidSize { len: hex.len() / 2 });
    }
    let key = (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::InvalidSetting(format!("unlock key is not hex at {i}")))
        })
        .collect::<Result<Vec<u8>>>()?;
    if key.len() != UNLOCK_KEY_SIZE {
        return Err(Error::UnlockKeyInvalidSize { len: key.len() });
    }
    Ok(key)
}
