//! uwflash CLI - Command-line tool for updating module firmware.
//!
//! ## Features
//!
//! - Replay UWF/UBU upgrade files through the FUP bootloader
//! - Bootloader entry by `AT+FUP` or FTDI bridge reset
//! - Upgrade file validation and inspection
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Args, Parser, Subcommand, ValueEnum},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
    uwflash::{EntryMethod, Module},
};

mod commands;
mod config;
mod serial;

use {
    commands::{
        completions::{cmd_completions, cmd_completions_install},
        info::{cmd_info, cmd_list_ports, cmd_validate},
        update::cmd_update,
    },
    config::Config,
    serial::{PortPicker, offer_to_remember},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors with a stable exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing interactive terminal.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration.
    #[error("{0}")]
    Config(String),
    /// Cancelled by the user.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for an error returned by a command.
///
/// Library errors map by the component they came from: upgrade file 5,
/// serial port, bridge and bootloader 4.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    if let Some(lib_err) = err.downcast_ref::<uwflash::Error>() {
        return match lib_err {
            uwflash::Error::Interrupted | uwflash::Error::EntryCancelled => 130,
            uwflash::Error::SetupRequired(_) => 2,
            other => match other.module() {
                Module::Uwf => 5,
                Module::Settings => 2,
                Module::Uart | Module::Update | Module::BootloaderEntrance => 4,
            },
        };
    }
    1
}

/// uwflash - Update module firmware through the FUP bootloader.
///
/// Environment variables:
///   UWFLASH_PORT              - Default serial port
///   UWFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "uwflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "UWFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "UWFLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    pub(crate) confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    pub(crate) list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// How the module is put into its bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Entry {
    /// The module is already in its bootloader.
    None,
    /// Send AT+FUP to the application (default).
    AtFup,
    /// BL654 USB dongle, reset through its FTDI bridge.
    Bl654Usb,
    /// Pinnacle 100 DVK, reset through its FTDI bridge.
    Pinnacle100,
}

impl From<Entry> for EntryMethod {
    fn from(entry: Entry) -> Self {
        match entry {
            Entry::None => Self::None,
            Entry::AtFup => Self::AtFup,
            Entry::Bl654Usb => Self::Bl654Usb,
            Entry::Pinnacle100 => Self::Pinnacle100,
        }
    }
}

/// Options of the `update` command.
#[derive(Args, Debug, Default)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct UpdateArgs {
    /// Baud rate of the application firmware (default: 115200).
    #[arg(long, value_name = "BAUD")]
    pub(crate) app_baud: Option<u32>,

    /// Baud rate the bootloader starts at (default: 115200).
    #[arg(long, value_name = "BAUD")]
    pub(crate) bootloader_baud: Option<u32>,

    /// Highest baud rate to negotiate with an enhanced bootloader.
    #[arg(long, value_name = "BAUD")]
    pub(crate) max_baud: Option<u32>,

    /// Exact baud rate to negotiate with an enhanced bootloader.
    #[arg(long, value_name = "BAUD")]
    pub(crate) exact_baud: Option<u32>,

    /// Bootloader entry method.
    #[arg(long, value_enum)]
    pub(crate) entry: Option<Entry>,

    /// Treat the bootloader as a legacy one.
    #[arg(long)]
    pub(crate) no_enhanced: bool,

    /// Reboot the module with BREAK before entering the bootloader.
    #[arg(long)]
    pub(crate) reboot_before: bool,

    /// Hold DTR low instead of high during the pre-update reboot.
    #[arg(long, requires = "reboot_before")]
    pub(crate) dtr_low: bool,

    /// Leave the module in its bootloader after the update.
    #[arg(long)]
    pub(crate) no_reboot: bool,

    /// Do not ask the bootloader to verify written data.
    #[arg(long)]
    pub(crate) no_verify: bool,

    /// Skip validating the upgrade file before the update.
    #[arg(long)]
    pub(crate) no_validate: bool,

    /// Bootloader unlock key as 128 hex digits.
    #[arg(long, value_name = "HEX")]
    pub(crate) unlock_key: Option<String>,

    /// Serial number of the FTDI bridge to reset.
    #[arg(long, value_name = "SERIAL")]
    pub(crate) bridge_serial: Option<String>,

    /// Do not ask before resetting the module through its bridge.
    #[arg(short, long)]
    pub(crate) yes: bool,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Update the module firmware from an upgrade file.
    Update {
        /// Path to the UWF/UBU upgrade file.
        firmware: PathBuf,

        #[command(flatten)]
        args: UpdateArgs,
    },

    /// Check that an upgrade file is well formed.
    Validate {
        /// Path to the UWF/UBU upgrade file.
        firmware: PathBuf,
    },

    /// Show the commands of an upgrade file.
    Info {
        /// Path to the UWF/UBU upgrade file.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "uwflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    uwflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code(&err);
            if code == 130 {
                eprintln!("{} {err:#}", style("Cancelled:").yellow().bold());
            } else {
                eprintln!("{} {err:#}", style("Error:").red().bold());
            }
            ExitCode::from(code)
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Update { firmware, args } => cmd_update(cli, &mut config, firmware, args),
        Commands::Validate { firmware } => cmd_validate(cli, firmware),
        Commands::Info { firmware, json } => cmd_info(firmware, *json),
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: uwflash completions bash \
                         (or use --install to auto-detect)"
                            .to_string(),
                    )
                })?;
                cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let chosen = PortPicker {
        config,
        explicit: cli
            .port
            .as_deref(),
        non_interactive: cli.non_interactive,
        list_all: cli.list_all_ports,
        always_confirm: cli.confirm_port,
    }
    .pick()?;

    if !chosen.recognized && !cli.non_interactive {
        offer_to_remember(&chosen.port, config);
    }
    Ok(chosen
        .port
        .name)
}
