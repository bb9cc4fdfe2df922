//! Firmware update command implementation.

use {
    crate::{Cli, CliError, UpdateArgs, config::Config, get_port, use_fancy_output, was_interrupted},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    indicatif::{ProgressBar, ProgressStyle},
    log::{debug, warn},
    std::{io::IsTerminal, path::Path, str::FromStr},
    uwflash::{
        Engine, EntryConsent, EntryMethod, NativeOpener, SerialTransport, SessionEvent,
        UpdateSettings, entry::default_backend, parse_unlock_key,
    },
};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Settings from the command line over the configuration file over defaults.
///
/// The port is filled in later, once it has been selected.
fn build_settings(args: &UpdateArgs, config: &Config, firmware: &Path) -> Result<UpdateSettings> {
    let update = &config.update;
    let mut settings = UpdateSettings::new(String::new(), firmware);

    if let Some(baud) = args
        .app_baud
        .or(update.application_baud)
    {
        settings.application_baud = baud;
    }
    if let Some(baud) = args
        .bootloader_baud
        .or(update.bootloader_baud)
    {
        settings.bootloader_baud = baud;
    }
    settings.max_baud = args
        .max_baud
        .or(update.max_baud);
    settings.exact_baud = args
        .exact_baud
        .or(update.exact_baud);

    settings.entry_method = match (args.entry, &update.entry) {
        (Some(entry), _) => entry.into(),
        (None, Some(name)) => EntryMethod::from_str(name)
            .map_err(|e| CliError::Config(format!("Invalid [update] entry in config: {e}")))?,
        (None, None) => EntryMethod::default(),
    };

    settings.disable_enhanced = args.no_enhanced || update.disable_enhanced;
    settings.reboot_before = args.reboot_before || update.reboot_before;
    settings.reboot_dtr = !args.dtr_low;
    settings.reboot_after = !(args.no_reboot || update.skip_reboot);
    settings.verify = !(args.no_verify || update.skip_verify);
    settings.validate = !(args.no_validate || update.skip_validate);

    if let Some(hex) = &args.unlock_key {
        settings.unlock_key =
            parse_unlock_key(hex).map_err(|e| CliError::Usage(format!("--unlock-key: {e}")))?;
    }
    settings.bridge_serial = args
        .bridge_serial
        .clone()
        .or_else(|| {
            update
                .bridge_serial
                .clone()
        });
    settings.skip_entry_confirmation = args.yes;

    Ok(settings)
}

/// Asks once before the first hardware bootloader entry and remembers the answer.
struct PromptConsent {
    non_interactive: bool,
}

impl EntryConsent for PromptConsent {
    fn confirm(&mut self, method: EntryMethod) -> uwflash::Result<()> {
        if Config::entry_acknowledged() {
            return Ok(());
        }
        if self.non_interactive || !std::io::stdin().is_terminal() {
            return Err(uwflash::Error::SetupRequired(format!(
                "{method} entry resets the module through its USB bridge; \
                 confirm once interactively or pass --yes"
            )));
        }

        eprintln!(
            "{} {method} entry drives the bridge's GPIO lines to reset the module.",
            style("⚠").yellow()
        );
        eprintln!(
            "  {}",
            style("Only use it with the matching development board attached.").dim()
        );
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Continue with hardware bootloader entry?")
            .default(false)
            .interact_opt()
            .map_err(|err| match err {
                dialoguer::Error::IO(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    uwflash::Error::EntryCancelled
                },
                dialoguer::Error::IO(e) => uwflash::Error::Io(e),
            })?
            .unwrap_or(false);

        if !confirmed {
            return Err(uwflash::Error::EntryCancelled);
        }
        if let Err(e) = Config::acknowledge_entry() {
            warn!("Failed to remember hardware entry confirmation: {e}");
        }
        Ok(())
    }
}

fn progress_bar(cli: &Cli) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Update command implementation.
pub(crate) fn cmd_update(
    cli: &Cli,
    config: &mut Config,
    firmware: &Path,
    args: &UpdateArgs,
) -> Result<()> {
    ensure_not_interrupted()?;

    let mut settings = build_settings(args, config, firmware)?;
    settings.port = get_port(cli, config)?;
    settings
        .check()
        .map_err(|e| CliError::Usage(e.to_string()))?;

    if !cli.quiet {
        eprintln!(
            "{} Updating {} on {} ({} entry, {} baud)",
            style("📦").cyan(),
            firmware.display(),
            style(&settings.port).green(),
            settings.entry_method,
            settings.initial_baud()
        );
    }

    let transport = SerialTransport::new(NativeOpener, settings.port.clone());
    let mut engine = Engine::new(transport)
        .with_bridge(default_backend())
        .with_consent(PromptConsent {
            non_interactive: cli.non_interactive,
        });

    let pb = progress_bar(cli);
    let quiet = cli.quiet;
    let result = engine.run(settings, |event| match event {
        SessionEvent::Action(text) => {
            debug!("{text}");
            if !quiet {
                let line = format!("{} {text}", style("›").cyan());
                if pb.is_hidden() {
                    eprintln!("{line}");
                } else {
                    pb.println(line);
                }
            }
        },
        SessionEvent::Progress { task, overall } => {
            if let Some(overall) = overall {
                pb.set_position(u64::from(*overall));
            }
            if let Some(task) = task {
                pb.set_message(format!("block {task}%"));
            }
        },
        SessionEvent::Error { module, message } => debug!("{module} error: {message}"),
        SessionEvent::Active(active) => debug!("Session active: {active}"),
        SessionEvent::Finished {
            success,
            elapsed_ms,
        } => {
            debug!("Session finished (success: {success}, {elapsed_ms} ms)");
            pb.finish_and_clear();
        },
        SessionEvent::PortRenamed(name) => debug!("Port renamed to {name}"),
    });
    pb.finish_and_clear();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(uwflash::Error::Interrupted) if was_interrupted() => {
            return Err(CliError::Cancelled("Update interrupted".to_string()).into());
        },
        Err(e) => return Err(e.into()),
    };

    if !quiet {
        if let Some(version) = &outcome.bootloader_version {
            eprintln!("{} Bootloader version {version}", style("ℹ").blue());
        }
        if !outcome.rebooted {
            eprintln!(
                "{} Module left in bootloader mode on {} at {} baud",
                style("ℹ").blue(),
                outcome.port_name,
                outcome.baud_rate
            );
        }
        eprintln!(
            "\n{} Firmware updated in {:.1}s",
            style("🎉").green().bold(),
            outcome
                .elapsed
                .as_secs_f64()
        );
    }

    Ok(())
}
