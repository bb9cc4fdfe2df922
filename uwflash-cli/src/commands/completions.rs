//! Shell completion generation and installation.

use {
    crate::{Cli, CliError},
    anyhow::{Context, Result},
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    console::style,
    directories::BaseDirs,
    std::{
        env, fs,
        io::{self, Write as _},
        path::{Path, PathBuf},
    },
};

/// Line added to `.zshrc` so zsh finds the installed completion function.
const ZSH_FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd
        .get_name()
        .to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

/// Detect the user's current shell from environment.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

/// Map a shell binary path such as `/usr/bin/zsh` to its `Shell`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path)
        .file_stem()
        .and_then(|n| n.to_str())?;
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where the completion script for `shell` is installed.
fn completion_install_path(shell: Shell, dirs: &BaseDirs) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => dirs
            .data_dir()
            .join("bash-completion/completions/uwflash"),
        Shell::Zsh => dirs
            .home_dir()
            .join(".zfunc/_uwflash"),
        Shell::Fish => dirs
            .config_dir()
            .join("fish/completions/uwflash.fish"),
        Shell::Elvish => dirs
            .config_dir()
            .join("elvish/lib/uwflash.elv"),
        Shell::PowerShell => match env::var_os("PROFILE") {
            Some(profile) => PathBuf::from(profile)
                .parent()
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
                .join("uwflash.ps1"),
            None => dirs
                .config_dir()
                .join("powershell/completions/uwflash.ps1"),
        },
        _ => {
            return Err(CliError::Usage(format!(
                "Automatic installation is not supported for {shell}"
            ))
            .into());
        },
    };
    Ok(path)
}

/// Make sure `.zshrc` puts `~/.zfunc` on the function path.
fn ensure_zsh_fpath(dirs: &BaseDirs) -> Result<()> {
    let zshrc = dirs
        .home_dir()
        .join(".zshrc");
    let present = fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(ZSH_FPATH_LINE));
    if present {
        return Ok(());
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# uwflash completions")?;
    writeln!(file, "{ZSH_FPATH_LINE}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓").green().bold(),
        style(zshrc.display()).yellow()
    );
    Ok(())
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().ok_or_else(|| {
            CliError::Usage(
                "Could not detect your shell; specify it explicitly, e.g.: \
                 uwflash completions --install bash"
                    .to_string(),
            )
        })?,
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = completion_install_path(shell, &dirs)?;

    let mut buf = Vec::new();
    let mut cmd = Cli::command();
    let name = cmd
        .get_name()
        .to_string();
    generate(shell, &mut cmd, name, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(shell).cyan(),
        style(path.display()).yellow()
    );

    match shell {
        Shell::Bash => {
            eprintln!(
                "\nTo activate now: {}",
                style(format!("source {}", path.display())).cyan()
            );
        },
        Shell::Zsh => {
            ensure_zsh_fpath(&dirs)?;
            eprintln!("\nRestart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => {
            eprintln!("\nAdd this to your PowerShell profile to load on startup:");
            eprintln!(
                "  {}",
                style(format!("Import-Module {}", path.display())).cyan()
            );
        },
        _ => {
            eprintln!("\nCompletions will be loaded automatically in new sessions.");
        },
    }

    Ok(())
}
