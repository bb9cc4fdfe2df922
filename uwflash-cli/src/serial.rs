//! Choosing the serial port the module is attached to.
//!
//! An explicit `--port` or the configured port wins without enumeration.
//! Otherwise ports behind a recognized USB bridge are offered; the rest only
//! show up when nothing recognized is attached or `--list-all-ports` is set.
//! A lone recognized port is taken without asking unless `--confirm-port`.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Select, theme::ColorfulTheme},
    log::{debug, info, warn},
    std::io::IsTerminal,
    uwflash::{DetectedPort, DeviceKind, detect_ports},
};

/// Port resolution policy for one invocation.
pub(crate) struct PortPicker<'a> {
    pub config: &'a Config,
    /// `--port`, taken as given.
    pub explicit: Option<&'a str>,
    pub non_interactive: bool,
    pub list_all: bool,
    pub always_confirm: bool,
}

/// Port the update will run on.
#[derive(Debug)]
pub(crate) struct Chosen {
    pub port: DetectedPort,
    /// Built-in bridge or a USB id remembered in the config.
    pub recognized: bool,
}

fn usage(message: impl Into<String>) -> anyhow::Error {
    CliError::Usage(message.into()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Unwrap a dialoguer answer; Esc and Ctrl-C both cancel.
fn answer<T>(result: dialoguer::Result<Option<T>>) -> Result<T> {
    match result {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(cancelled()),
        Err(dialoguer::Error::IO(e)) if e.kind() == std::io::ErrorKind::Interrupted => {
            Err(cancelled())
        },
        Err(dialoguer::Error::IO(e)) => Err(usage(format!("Cannot prompt for a port: {e}"))),
    }
}

impl PortPicker<'_> {
    /// Resolve a port name the user gave, enumerated or not.
    fn named(&self, name: &str) -> Chosen {
        let ports = detect_ports();
        let port = ports
            .iter()
            .find(|p| p.name == name)
            .or_else(|| {
                ports
                    .iter()
                    .find(|p| {
                        p.name
                            .eq_ignore_ascii_case(name)
                    })
            })
            .cloned()
            .unwrap_or_else(|| DetectedPort {
                name: name.to_string(),
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            });
        self.chosen(port)
    }

    fn chosen(&self, port: DetectedPort) -> Chosen {
        Chosen {
            recognized: self
                .config
                .recognizes(&port),
            port,
        }
    }

    /// Recognized ports first, then the rest when they are to be offered.
    fn candidates(&self, ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
        let (mut recognized, others): (Vec<_>, Vec<_>) = ports
            .into_iter()
            .partition(|p| {
                self.config
                    .recognizes(p)
            });
        if self.list_all || recognized.is_empty() {
            recognized.extend(others);
        }
        recognized
    }

    pub fn pick(&self) -> Result<Chosen> {
        if let Some(name) = self.explicit {
            return Ok(self.named(name));
        }
        if let Some(name) = &self
            .config
            .port
            .connection
            .serial
        {
            debug!("Using port from config: {name}");
            return Ok(self.named(name));
        }

        let mut candidates = self.candidates(detect_ports());
        if candidates.is_empty() {
            return Err(usage("No serial ports found; connect the module or pass --port"));
        }

        if candidates.len() == 1 {
            let only = self.chosen(candidates.remove(0));
            if self.non_interactive || (only.recognized && !self.always_confirm) {
                info!(
                    "Auto-selected port: {} [{}]",
                    only.port
                        .name,
                    only.port
                        .device
                        .name()
                );
                return Ok(only);
            }
            candidates.push(only.port);
        } else if self.non_interactive {
            return Err(usage(
                "Multiple serial ports found; use --port to choose one in non-interactive mode",
            ));
        }

        self.prompt(candidates)
    }

    fn prompt(&self, mut candidates: Vec<DetectedPort>) -> Result<Chosen> {
        if !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal()) {
            return Err(usage("Port selection needs an interactive terminal; use --port"));
        }

        eprintln!(
            "{} {} candidate serial port(s); recognized bridges are listed first",
            style("ℹ").blue(),
            candidates.len()
        );
        let width = usize::from(
            console::Term::stderr()
                .size()
                .1,
        )
        .saturating_sub(4);
        let labels: Vec<String> = candidates
            .iter()
            .map(|p| console::truncate_str(&port_label(p, self.config), width, "…").into_owned())
            .collect();

        let index = answer(
            Select::with_theme(&ColorfulTheme::default())
                .with_prompt("Serial port of the module")
                .items(&labels)
                .default(0)
                .interact_opt(),
        )?;
        if index >= candidates.len() {
            return Err(anyhow::anyhow!("Port index {index} out of range"));
        }
        Ok(self.chosen(candidates.swap_remove(index)))
    }
}

/// One line of the selection list: name, bridge type or USB id, the bridge
/// serial used for bit-bang entry, and the product string.
fn port_label(port: &DetectedPort, config: &Config) -> String {
    let mut label = if config.recognizes(port) {
        style(&port.name)
            .bold()
            .to_string()
    } else {
        port.name
            .clone()
    };

    if port
        .device
        .is_known()
    {
        label.push_str(&format!(
            " [{}]",
            style(
                port.device
                    .name()
            )
            .yellow()
        ));
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        label.push_str(&format!(" ({vid:04X}:{pid:04X})"));
    }
    if let Some(serial) = port
        .serial
        .as_deref()
        .filter(|_| port.supports_bitbang_entry())
    {
        label.push_str(&format!(" SN {serial}"));
    }
    if let Some(product) = &port.product {
        label.push_str(&format!(" - {}", style(product).dim()));
    }
    label
}

/// Offer to remember an unrecognized USB bridge so later runs auto-select it.
pub(crate) fn offer_to_remember(port: &DetectedPort, config: &mut Config) {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return;
    };
    if config.recognizes(port) {
        return;
    }

    let remember = answer(
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Remember USB device {vid:04X}:{pid:04X} for auto-detection?"))
            .default(false)
            .interact_opt(),
    )
    .unwrap_or(false);
    if remember {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            warn!("Failed to save port configuration: {e}");
        }
    }
}
