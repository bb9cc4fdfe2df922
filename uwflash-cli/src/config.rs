//! Configuration file support for uwflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (UWFLASH_*)
//! 3. Local config file (./uwflash.toml or ./uwflash_ports.toml)
//! 4. Global config file (~/.config/uwflash/config.toml)

use {
    directories::ProjectDirs,
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
    },
    uwflash::DetectedPort,
};

/// Marker file recording that hardware bootloader entry was acknowledged.
const ENTRY_ACK_FILE: &str = "hardware-entry-acknowledged";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Update defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct UpdateConfig {
    /// Baud rate of the application firmware.
    pub application_baud: Option<u32>,
    /// Baud rate the bootloader starts at.
    pub bootloader_baud: Option<u32>,
    /// Highest baud rate to negotiate.
    pub max_baud: Option<u32>,
    /// Exact baud rate to negotiate.
    pub exact_baud: Option<u32>,
    /// Bootloader entry method ("none", "at-fup", "bl654-usb", "pinnacle100").
    pub entry: Option<String>,
    /// Serial number of the FTDI bridge.
    pub bridge_serial: Option<String>,
    /// Treat every bootloader as a legacy one.
    #[serde(default)]
    pub disable_enhanced: bool,
    /// Reboot with BREAK before entering the bootloader.
    #[serde(default)]
    pub reboot_before: bool,
    /// Leave the module in its bootloader after the update.
    #[serde(default)]
    pub skip_reboot: bool,
    /// Skip bootloader verification of written data.
    #[serde(default)]
    pub skip_verify: bool,
    /// Skip validating the upgrade file.
    #[serde(default)]
    pub skip_validate: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Update configuration.
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new("uwflash.toml")) {
            debug!("Loaded local config from uwflash.toml");
            config.merge(local_config);
        }

        // Load ports config
        if let Some(ports_config) = Self::load_ports_config() {
            config.port = ports_config;
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Load ports configuration from uwflash_ports.toml.
    fn load_ports_config() -> Option<PortConfig> {
        let local_path = Path::new("uwflash_ports.toml");
        if let Some(config) = Self::load_port_file(local_path) {
            return Some(config);
        }

        Self::global_config_dir().and_then(|dir| Self::load_port_file(&dir.join("ports.toml")))
    }

    fn load_port_file(path: &Path) -> Option<PortConfig> {
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => {
                debug!("Loaded ports config from {}", path.display());
                Some(config)
            },
            Err(e) => {
                warn!("Failed to parse ports file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "uwflash").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Port config
        if other
            .port
            .connection
            .serial
            .is_some()
        {
            self.port
                .connection
                .serial = other
                .port
                .connection
                .serial;
        }
        self.port
            .usb_device
            .extend(
                other
                    .port
                    .usb_device,
            );

        // Update config
        let update = other.update;
        let ours = &mut self.update;
        if update
            .application_baud
            .is_some()
        {
            ours.application_baud = update.application_baud;
        }
        if update
            .bootloader_baud
            .is_some()
        {
            ours.bootloader_baud = update.bootloader_baud;
        }
        if update
            .max_baud
            .is_some()
        {
            ours.max_baud = update.max_baud;
        }
        if update
            .exact_baud
            .is_some()
        {
            ours.exact_baud = update.exact_baud;
        }
        if update
            .entry
            .is_some()
        {
            ours.entry = update.entry;
        }
        if update
            .bridge_serial
            .is_some()
        {
            ours.bridge_serial = update.bridge_serial;
        }
        ours.disable_enhanced |= update.disable_enhanced;
        ours.reboot_before |= update.reboot_before;
        ours.skip_reboot |= update.skip_reboot;
        ours.skip_verify |= update.skip_verify;
        ours.skip_validate |= update.skip_validate;
    }

    /// Whether a port sits behind a built-in bridge or a remembered USB id.
    pub fn recognizes(&self, port: &DetectedPort) -> bool {
        port.device
            .is_known()
            || port
                .vid
                .zip(port.pid)
                .is_some_and(|(vid, pid)| {
                    self.port
                        .usb_device
                        .iter()
                        .any(|d| d.matches(vid, pid))
                })
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        // Don't add duplicates
        if self
            .port
            .usb_device
            .contains(&device)
        {
            return Ok(());
        }

        // Try to save to local file first, fall back to global
        let path = if Path::new("uwflash_ports.toml").exists() || Path::new("uwflash.toml").exists()
        {
            PathBuf::from("uwflash_ports.toml")
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from("uwflash_ports.toml")
        };

        self.port
            .usb_device
            .push(device);

        let content = toml::to_string_pretty(&self.port)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }

    /// Whether hardware bootloader entry was acknowledged before.
    pub fn entry_acknowledged() -> bool {
        Self::global_config_dir().is_some_and(|dir| {
            dir.join(ENTRY_ACK_FILE)
                .exists()
        })
    }

    /// Remember that hardware bootloader entry was acknowledged.
    pub fn acknowledge_entry() -> anyhow::Result<()> {
        let dir = Self::global_config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine configuration directory"))?;
        fs::create_dir_all(&dir)?;
        let path = dir.join(ENTRY_ACK_FILE);
        fs::write(&path, b"")?;
        debug!("Recorded hardware entry acknowledgement in {}", path.display());
        Ok(())
    }
}
