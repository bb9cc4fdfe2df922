//! Upgrade file inspection and port listing command implementations.

use {
    crate::{Cli, use_fancy_output},
    anyhow::{Context, Result},
    console::style,
    std::path::Path,
    uwflash::{UwfReader, ValidationReport, detect_ports, validate},
};

/// Open and validate an upgrade file.
fn load_report(firmware: &Path) -> Result<ValidationReport> {
    let mut reader = UwfReader::open(firmware)
        .with_context(|| format!("Failed to open upgrade file {}", firmware.display()))?;
    let report = validate(&mut reader)
        .with_context(|| format!("Invalid upgrade file {}", firmware.display()))?;
    Ok(report)
}

/// Validate command implementation.
pub(crate) fn cmd_validate(cli: &Cli, firmware: &Path) -> Result<()> {
    let report = load_report(firmware)?;

    if !cli.quiet {
        let check = if use_fancy_output() { "✓" } else { "OK" };
        eprintln!(
            "{} {} is valid: {} commands, {} bytes to erase, {} bytes to write",
            style(check).green(),
            firmware.display(),
            report
                .commands
                .len(),
            report.erase_bytes,
            report.write_bytes
        );
    }
    Ok(())
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let report = load_report(firmware)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Upgrade File Information")
            .bold()
            .underlined()
    );
    eprintln!("  File: {}", firmware.display());
    eprintln!("  Size: {} bytes", report.file_size);
    match report.platform_id {
        Some(id) => eprintln!("  Target platform: 0x{id:08X}"),
        None => eprintln!("  Target platform: {}", style("not set").dim()),
    }
    eprintln!("  Devices registered: {}", report.devices_registered);
    eprintln!("  Bytes to erase: {}", report.erase_bytes);
    eprintln!("  Bytes to write: {}", report.write_bytes);

    eprintln!(
        "\n{}",
        style(format!("Commands ({})", report.commands.len()))
            .bold()
            .underlined()
    );
    for command in &report.commands {
        eprintln!(
            "  {} 0x{:08X}  {} {:<16} {} bytes",
            style("•").dim(),
            command.offset,
            style(char::from(command.id)).cyan().bold(),
            command.name,
            command.length
        );
    }

    Ok(())
}

/// JSON form of a validation report.
fn report_json(report: &ValidationReport) -> serde_json::Value {
    let commands: Vec<serde_json::Value> = report
        .commands
        .iter()
        .map(|c| {
            serde_json::json!({
                "offset": c.offset,
                "id": char::from(c.id).to_string(),
                "name": c.name,
                "length": c.length,
            })
        })
        .collect();

    serde_json::json!({
        "file_size": report.file_size,
        "platform_id": report.platform_id.map(|id| format!("0x{id:08X}")),
        "devices_registered": report.devices_registered,
        "erase_bytes": report.erase_bytes,
        "write_bytes": report.write_bytes,
        "commands": commands,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "bitbang_entry": p.supports_bitbang_entry(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available Serial Ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port
            .device
            .is_known()
        {
            format!(
                " [{}]",
                style(
                    port.device
                        .name()
                )
                .yellow()
            )
        } else {
            String::new()
        };

        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let serial = match (&port.serial, port.supports_bitbang_entry()) {
            (Some(serial), true) => format!(" SN {}", style(serial).magenta()),
            _ => String::new(),
        };

        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{device_type}{vid_pid}{serial}{product}",
            style("•").green(),
            style(&port.name).cyan(),
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, std::fs, tempfile::tempdir};

    fn command(id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![id, 0];
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn sample_file() -> Vec<u8> {
        let mut file = command(b'T', &0x0B65_4001u32.to_le_bytes());
        // handle 1 at 0, one bank of 256 KiB, bank selection 0
        let mut register = vec![1];
        register.extend_from_slice(&0u32.to_le_bytes());
        register.push(1);
        register.extend_from_slice(&0x0004_0000u32.to_le_bytes());
        register.push(0);
        file.extend(command(b'G', &register));
        file.extend(command(b'S', &[1, 0]));
        let mut erase = 0u32.to_le_bytes().to_vec();
        erase.extend_from_slice(&0x1000u32.to_le_bytes());
        file.extend(command(b'E', &erase));
        let mut write = vec![0; 8];
        write.extend_from_slice(&[0xAB; 16]);
        file.extend(command(b'W', &write));
        file
    }

    #[test]
    fn test_load_report_and_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fw.uwf");
        fs::write(&path, sample_file()).unwrap();

        let report = load_report(&path).unwrap();
        assert_eq!(report.commands.len(), 5);

        let json = report_json(&report);
        assert_eq!(json["platform_id"], "0x0B654001");
        assert_eq!(json["commands"][0]["id"], "T");
        assert_eq!(json["commands"][4]["name"], report.commands[4].name);
        assert_eq!(json["erase_bytes"], 0x1000);
        assert_eq!(json["write_bytes"], 16);
    }

    #[test]
    fn test_load_report_missing_file_is_library_error() {
        let dir = tempdir().unwrap();
        let err = load_report(&dir.path().join("missing.uwf")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<uwflash::Error>(),
            Some(uwflash::Error::FileNotFound(_))
        ));
    }

    #[test]
    fn test_load_report_rejects_bad_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.uwf");
        fs::write(&path, command(b'T', &[1, 2, 3])).unwrap();
        let err = load_report(&path).unwrap_err();
        assert_eq!(
            err.downcast_ref::<uwflash::Error>()
                .map(uwflash::Error::module),
            Some(uwflash::Module::Uwf)
        );
    }
}
