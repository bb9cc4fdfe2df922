//! Read-only validation pass over an upgrade file.
//!
//! Walks every command header, checks the declared payload length against
//! the command's shape and skips the payload. The first violation is
//! returned; nothing is sent to a module.

use {
    crate::{
        error::{Error, Result},
        image::uwf::{CommandId, EraseBlock, HEADER_LEN, MAX_PAYLOAD_LEN, UwfReader},
    },
    byteorder::{LittleEndian, ReadBytesExt},
    log::debug,
    std::io::{Read, Seek, SeekFrom},
};

/// One command as found in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CommandSummary {
    /// Offset of the header.
    pub offset: u64,
    /// Command id byte.
    pub id: u8,
    /// Command name.
    pub name: &'static str,
    /// Declared payload length.
    pub length: u32,
}

/// Outcome of a successful validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ValidationReport {
    /// File size in bytes.
    pub file_size: u64,
    /// Every command in order.
    pub commands: Vec<CommandSummary>,
    /// Platform id from the first `T` command.
    pub platform_id: Option<u32>,
    /// Number of `G` commands.
    pub devices_registered: usize,
    /// Sum of `E` sizes.
    pub erase_bytes: u64,
    /// Sum of `W` data sizes.
    pub write_bytes: u64,
}

/// Validate the command stream from the start of the file.
///
/// The reader is left at the end of the file on success; callers that go on
/// to replay the file must rewind it.
pub fn validate<R: Read + Seek>(reader: &mut UwfReader<R>) -> Result<ValidationReport> {
    reader.rewind()?;
    let mut report = ValidationReport {
        file_size: reader.size(),
        ..ValidationReport::default()
    };

    while !reader.at_end() {
        let offset = reader.position();
        let Some(header) = reader.read_header()? else {
            break;
        };

        if !header
            .id
            .is_validatable()
        {
            return Err(Error::FileCommandInvalid(format!(
                "unsupported command 0x{:02x} at offset {offset:#x}",
                header
                    .id
                    .as_byte()
            )));
        }
        if !header
            .id
            .accepts_length(header.length)
        {
            return Err(Error::FileNotValid(format!(
                "{} command at offset {offset:#x} has length {:#x}",
                header.id, header.length
            )));
        }
        let payload_end = offset + HEADER_LEN as u64 + u64::from(header.length);
        if header.length > MAX_PAYLOAD_LEN || payload_end > reader.size() {
            return Err(Error::FilePacketLengthInvalid {
                length: header.length,
            });
        }

        match header.id {
            CommandId::TargetPlatform if report.platform_id.is_none() => {
                let payload = reader.read(header.length as usize)?;
                report.platform_id = Some(
                    payload
                        .as_slice()
                        .read_u32::<LittleEndian>()?,
                );
            },
            CommandId::EraseBlock => {
                let payload = reader.read(header.length as usize)?;
                let erase = EraseBlock::parse(&payload)?;
                report.erase_bytes += u64::from(erase.size);
            },
            other => {
                if other == CommandId::RegisterDevice {
                    report.devices_registered += 1;
                }
                if other == CommandId::WriteBlock {
                    report.write_bytes += u64::from(header.length - 8);
                }
                reader.seek(SeekFrom::Current(i64::from(header.length)))?;
            },
        }

        report
            .commands
            .push(CommandSummary {
                offset,
                id: header
                    .id
                    .as_byte(),
                name: header
                    .id
                    .name(),
                length: header.length,
            });
    }

    debug!(
        "Upgrade file valid: {} commands, {} bytes to write",
        report
            .commands
            .len(),
        report.write_bytes
    );
    Ok(report)
}
