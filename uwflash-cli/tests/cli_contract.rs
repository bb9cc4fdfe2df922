//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("uwflash");
    cmd.env_remove("UWFLASH_PORT")
        .env_remove("UWFLASH_NON_INTERACTIVE")
        .env_remove("RUST_LOG");
    cmd
}

fn command(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![id, 0];
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Target platform, one registered device, an erase and a 32-byte write.
fn write_upgrade_file(path: &Path) {
    let mut file = command(b'T', &0x4C4C_4C4Cu32.to_le_bytes());
    let mut register = vec![0];
    register.extend_from_slice(&0x1000u32.to_le_bytes());
    register.push(1);
    register.extend_from_slice(&0x0004_0000u32.to_le_bytes());
    register.push(0);
    file.extend(command(b'G', &register));
    file.extend(command(b'S', &[0, 0]));
    let mut erase = 0u32.to_le_bytes().to_vec();
    erase.extend_from_slice(&0x1000u32.to_le_bytes());
    file.extend(command(b'E', &erase));
    let mut write = vec![0; 8];
    write.extend_from_slice(&[0x5A; 32]);
    file.extend(command(b'W', &write));
    fs::write(path, file).expect("write upgrade file");
}

// ============================================================================
// Help and version
// ============================================================================

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("uwflash"))
        .stdout(predicate::str::contains("Usage"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("uwflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn update_help_lists_options() {
    cli_cmd()
        .args(["update", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--entry"))
        .stdout(predicate::str::contains("--max-baud"))
        .stdout(predicate::str::contains("--unlock-key"));
}

#[test]
fn colors_disabled_when_not_tty() {
    let output = cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    assert!(!stdout.contains("\x1b["), "Colors should be disabled in non-TTY mode");
}

// ============================================================================
// Exit codes
// ============================================================================

#[test]
fn exit_code_two_on_usage_error() {
    cli_cmd()
        .arg("--no-such-flag")
        .assert()
        .code(2);
    cli_cmd()
        .assert()
        .code(2);
}

#[test]
fn exit_code_two_on_unknown_entry_method() {
    cli_cmd()
        .args(["update", "fw.uwf", "--entry", "jtag"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("jtag"));
}

#[test]
fn exit_code_two_on_bad_unlock_key() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = dir
        .path()
        .join("fw.uwf");
    write_upgrade_file(&firmware);

    cli_cmd()
        .current_dir(dir.path())
        .args(["--non-interactive", "--port", "/dev/uwflash-test-none", "update"])
        .arg(&firmware)
        .args(["--unlock-key", "0102"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unlock-key"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    cli_cmd()
        .arg("completions")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("shell"));
}

#[test]
fn exit_code_three_on_invalid_config_entry() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir
        .path()
        .join("config.toml");
    fs::write(&config, "[update]\nentry = \"jtag\"\n").expect("write config");

    cli_cmd()
        .current_dir(dir.path())
        .arg("--config")
        .arg(&config)
        .args(["--non-interactive", "update", "fw.uwf"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("entry"));
}

#[test]
fn missing_port_fails_with_device_error() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = dir
        .path()
        .join("fw.uwf");
    write_upgrade_file(&firmware);

    cli_cmd()
        .current_dir(dir.path())
        .args([
            "--non-interactive",
            "--port",
            "/dev/uwflash-test-none",
            "update",
            "--entry",
            "none",
        ])
        .arg(&firmware)
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn hardware_entry_needs_confirmation_in_non_interactive_mode() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = dir
        .path()
        .join("fw.uwf");
    write_upgrade_file(&firmware);

    // Point the config directory at an empty place so no earlier
    // acknowledgement is found.
    cli_cmd()
        .current_dir(dir.path())
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("config"))
        .args([
            "--non-interactive",
            "--port",
            "/dev/uwflash-test-none",
            "update",
            "--entry",
            "pinnacle100",
        ])
        .arg(&firmware)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--yes"));
}

// ============================================================================
// Upgrade file commands
// ============================================================================

#[test]
fn validate_accepts_well_formed_file() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = dir
        .path()
        .join("fw.uwf");
    write_upgrade_file(&firmware);

    cli_cmd()
        .arg("validate")
        .arg(&firmware)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("5 commands"));
}

#[test]
fn validate_rejects_bad_length_with_firmware_exit_code() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = dir
        .path()
        .join("bad.uwf");
    fs::write(&firmware, command(b'G', &[0; 4])).expect("write bad file");

    cli_cmd()
        .arg("validate")
        .arg(&firmware)
        .assert()
        .code(5)
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn validate_missing_file_exits_five() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd()
        .arg("validate")
        .arg(dir.path().join("not_exists.uwf"))
        .assert()
        .code(5);
}

#[test]
fn info_json_lists_commands() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = dir
        .path()
        .join("fw.uwf");
    write_upgrade_file(&firmware);

    let output = cli_cmd()
        .args(["info", "--json"])
        .arg(&firmware)
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(parsed["platform_id"], "0x4C4C4C4C");
    assert_eq!(parsed["devices_registered"], 1);
    assert_eq!(parsed["write_bytes"], 32);
    let ids: Vec<&str> = parsed["commands"]
        .as_array()
        .expect("commands array")
        .iter()
        .filter_map(|c| c["id"].as_str())
        .collect();
    assert_eq!(ids, ["T", "G", "S", "E", "W"]);
    assert!(output.stderr.is_empty());
}

#[test]
fn info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir
        .path()
        .join("not_exists.uwf");

    cli_cmd()
        .arg("info")
        .arg("--json")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

// ============================================================================
// Ports, completions and config
// ============================================================================

#[test]
fn list_ports_json_is_an_array_without_stderr() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .assert()
        .success()
        .get_output()
        .clone();

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf-8");
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert!(parsed.is_array(), "list-ports --json should return an array");
    assert!(stderr.is_empty(), "JSON output should not have stderr: got {stderr}");
}

#[test]
fn completions_bash_generates_script() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_uwflash()"));
}

#[test]
fn invalid_config_file_warns_but_continues() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir
        .path()
        .join("broken.toml");
    fs::write(&config, "[update\nmax_baud = ").expect("write config");

    cli_cmd()
        .arg("--config")
        .arg(&config)
        .arg("list-ports")
        .assert()
        .success()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn local_config_file_is_read() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path()
            .join("uwflash.toml"),
        "[update]\nentry = \"bogus\"\n",
    )
    .expect("write local config");

    cli_cmd()
        .current_dir(dir.path())
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join("config"))
        .args(["--non-interactive", "update", "fw.uwf"])
        .assert()
        .code(3);
}
