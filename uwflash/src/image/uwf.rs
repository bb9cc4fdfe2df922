//! UWF/UBU upgrade file format.
//!
//! An upgrade file is a flat stream of commands, each a 6-byte header
//! followed by a payload. All integers are little-endian.
//!
//! ```text
//! +----+----+-------------------+------------------------+
//! | id | rs |  length (u32 LE)  |  payload (length bytes) |
//! +----+----+-------------------+------------------------+
//!   1B   1B          4B
//! ```
//!
//! | id  | Command          | Payload                                              |
//! |-----|------------------|------------------------------------------------------|
//! | `T` | Target platform  | platform id (4)                                      |
//! | `G` | Register device  | handle (1), base (4), banks (1), bank size (4), sel (1) |
//! | `S` | Select device    | flash id (1), bank id (1)                            |
//! | `M` | Sector map       | { sector count (4), sector size (4) } × n            |
//! | `E` | Erase block      | offset (4), size (4)                                 |
//! | `W` | Write block      | offset (4), flags (4), data (length - 8)             |
//! | `Q` | Query            | ignored                                              |
//! | `U` | Unregister       | handle (1), ignored trailing bytes                   |

use {
    crate::error::{Error, Result},
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    log::debug,
    std::{
        fmt,
        fs::File,
        io::{BufReader, ErrorKind, Read, Seek, SeekFrom},
        path::Path,
    },
};

/// Command header length.
pub const HEADER_LEN: usize = 6;

/// Smallest acceptable upgrade file (one empty command).
pub const MIN_FILE_SIZE: u64 = HEADER_LEN as u64;

/// Largest acceptable upgrade file.
pub const MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Largest payload a single command may declare.
pub const MAX_PAYLOAD_LEN: u32 = 10 * 1024 * 1024;

/// Target platform payload length.
pub const TARGET_PLATFORM_LEN: u32 = 4;
/// Register device payload length.
pub const REGISTER_DEVICE_LEN: u32 = 11;
/// Select device payload length.
pub const SELECT_DEVICE_LEN: u32 = 2;
/// Length of one sector map group.
pub const SECTOR_MAP_ENTRY_LEN: u32 = 8;
/// Erase block payload length.
pub const ERASE_BLOCK_LEN: u32 = 8;
/// Write block header length (before the data).
pub const WRITE_BLOCK_HEADER_LEN: u32 = 8;
/// Minimum unregister payload length.
pub const UNREGISTER_LEN: u32 = 1;

/// Upgrade file command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandId {
    /// `T`: check the module platform.
    TargetPlatform,
    /// `G`: register a flash device.
    RegisterDevice,
    /// `S`: select the active flash device.
    SelectDevice,
    /// `M`: sector layout of the active device.
    SectorMap,
    /// `E`: erase a region.
    EraseBlock,
    /// `W`: write a region.
    WriteBlock,
    /// `Q`: query, not acted on.
    Query,
    /// `U`: unregister a flash device.
    Unregister,
    /// Anything else.
    Unknown(u8),
}

impl CommandId {
    /// Decode the header id byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'T' => Self::TargetPlatform,
            b'G' => Self::RegisterDevice,
            b'S' => Self::SelectDevice,
            b'M' => Self::SectorMap,
            b'E' => Self::EraseBlock,
            b'W' => Self::WriteBlock,
            b'Q' => Self::Query,
            b'U' => Self::Unregister,
            other => Self::Unknown(other),
        }
    }

    /// Header id byte.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::TargetPlatform => b'T',
            Self::RegisterDevice => b'G',
            Self::SelectDevice => b'S',
            Self::SectorMap => b'M',
            Self::EraseBlock => b'E',
            Self::WriteBlock => b'W',
            Self::Query => b'Q',
            Self::Unregister => b'U',
            Self::Unknown(byte) => byte,
        }
    }

    /// Human-readable command name.
    pub fn name(self) -> &'static str {
        match self {
            Self::TargetPlatform => "Target platform",
            Self::RegisterDevice => "Register device",
            Self::SelectDevice => "Select device",
            Self::SectorMap => "Sector map",
            Self::EraseBlock => "Erase",
            Self::WriteBlock => "Write",
            Self::Query => "Query",
            Self::Unregister => "Unregister",
            Self::Unknown(_) => "Unknown",
        }
    }

    /// Whether the id is one the format defines.
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    /// Whether a validation pass accepts the command.
    ///
    /// `Q` is tolerated at the start of a file and skipped during replay,
    /// but a file carrying one does not validate.
    pub fn is_validatable(self) -> bool {
        !matches!(self, Self::Query | Self::Unknown(_))
    }

    /// Whether `length` is an acceptable payload length for this command.
    ///
    /// Unknown commands accept any length; they are rejected separately.
    pub fn accepts_length(self, length: u32) -> bool {
        match self {
            Self::TargetPlatform => length == TARGET_PLATFORM_LEN,
            Self::RegisterDevice => length == REGISTER_DEVICE_LEN,
            Self::SelectDevice => length == SELECT_DEVICE_LEN,
            Self::SectorMap => {
                length >= SECTOR_MAP_ENTRY_LEN && length % SECTOR_MAP_ENTRY_LEN == 0
            },
            Self::EraseBlock => length == ERASE_BLOCK_LEN,
            Self::WriteBlock => length >= WRITE_BLOCK_HEADER_LEN,
            Self::Unregister => length >= UNREGISTER_LEN,
            Self::Query | Self::Unknown(_) => true,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let byte = self.as_byte();
        if byte.is_ascii_graphic() {
            write!(f, "{} ('{}')", self.name(), byte as char)
        } else {
            write!(f, "{} (0x{byte:02x})", self.name())
        }
    }
}

/// Six-byte command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Command id.
    pub id: CommandId,
    /// Reserved byte, carried through unchanged.
    pub reserved: u8,
    /// Payload length in bytes.
    pub length: u32,
}

impl CommandHeader {
    /// Decode a header.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        let mut rest = &bytes[2..];
        Self {
            id: CommandId::from_byte(bytes[0]),
            reserved: bytes[1],
            // Four bytes are always present
            length: rest
                .read_u32::<LittleEndian>()
                .unwrap_or_default(),
        }
    }

    /// Encode the header.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.push(
            self.id
                .as_byte(),
        );
        buf.push(self.reserved);
        buf.write_u32::<LittleEndian>(self.length)
            .unwrap();
        buf
    }
}

/// `G` payload: a flash device the following commands may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDevice {
    /// Handle used by `S` and `U`.
    pub handle: u8,
    /// Address added to every erase/write offset for this device.
    pub base_address: u32,
    /// Number of banks.
    pub bank_count: u8,
    /// Size of each bank.
    pub bank_size: u32,
    /// Bank selection byte.
    pub bank_selection: u8,
}

impl RegisterDevice {
    /// Decode an 11-byte payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut rdr = payload;
        Ok(Self {
            handle: rdr.read_u8()?,
            base_address: rdr.read_u32::<LittleEndian>()?,
            bank_count: rdr.read_u8()?,
            bank_size: rdr.read_u32::<LittleEndian>()?,
            bank_selection: rdr.read_u8()?,
        })
    }
}

/// `S` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectDevice {
    /// Handle of the device to make active.
    pub flash_id: u8,
    /// Bank within the device.
    pub bank_id: u8,
}

impl SelectDevice {
    /// Decode a 2-byte payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut rdr = payload;
        Ok(Self {
            flash_id: rdr.read_u8()?,
            bank_id: rdr.read_u8()?,
        })
    }
}

/// One `M` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorGroup {
    /// Number of sectors.
    pub sector_count: u32,
    /// Size of each sector.
    pub sector_size: u32,
}

impl SectorGroup {
    /// Decode every group of a sector map payload.
    pub fn parse_all(payload: &[u8]) -> Result<Vec<Self>> {
        payload
            .chunks_exact(SECTOR_MAP_ENTRY_LEN as usize)
            .map(|mut chunk| {
                Ok(Self {
                    sector_count: chunk.read_u32::<LittleEndian>()?,
                    sector_size: chunk.read_u32::<LittleEndian>()?,
                })
            })
            .collect()
    }
}

/// `E` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseBlock {
    /// Offset from the active device's base address.
    pub offset: u32,
    /// Bytes to erase.
    pub size: u32,
}

impl EraseBlock {
    /// Decode an 8-byte payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut rdr = payload;
        Ok(Self {
            offset: rdr.read_u32::<LittleEndian>()?,
            size: rdr.read_u32::<LittleEndian>()?,
        })
    }
}

/// Leading 8 bytes of a `W` payload; the data follows in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBlockHeader {
    /// Offset from the active device's base address.
    pub offset: u32,
    /// Flags, informational only.
    pub flags: u32,
}

impl WriteBlockHeader {
    /// Decode the write block header.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut rdr = payload;
        Ok(Self {
            offset: rdr.read_u32::<LittleEndian>()?,
            flags: rdr.read_u32::<LittleEndian>()?,
        })
    }
}

/// Sequential, seekable reader over an upgrade file.
pub struct UwfReader<R> {
    inner: R,
    size: u64,
    position: u64,
}

impl UwfReader<BufReader<File>> {
    /// Open an upgrade file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            _ => Error::OpenDenied(path.to_path_buf()),
        })?;
        debug!("Opened upgrade file {}", path.display());
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> UwfReader<R> {
    /// Wrap a seekable source positioned anywhere; the reader starts at 0.
    pub fn new(mut inner: R) -> Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            size,
            position: 0,
        })
    }

    /// Total size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current byte offset.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether every byte has been consumed.
    pub fn at_end(&self) -> bool {
        self.position >= self.size
    }

    /// Read up to `n` bytes; fewer are returned only at the end of the file.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let remaining = self
            .size
            .saturating_sub(self.position);
        let take = (n as u64).min(remaining) as usize;
        let mut buf = vec![0u8; take];
        self.inner
            .read_exact(&mut buf)?;
        self.position += take as u64;
        Ok(buf)
    }

    /// Read the next command header, or `None` at the end of the file.
    ///
    /// A header cut short by the end of the file is reported as invalid.
    pub fn read_header(&mut self) -> Result<Option<CommandHeader>> {
        if self.at_end() {
            return Ok(None);
        }
        let offset = self.position;
        let bytes = self.read(HEADER_LEN)?;
        let header: [u8; HEADER_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| {
                Error::FileNotValid(format!("truncated command header at offset {offset:#x}"))
            })?;
        Ok(Some(CommandHeader::parse(&header)))
    }

    /// Seek from the start or relative to the current position.
    ///
    /// Seeking from the end is not supported. Targets beyond the end of the
    /// file are clamped to the end.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => self
                .position
                .checked_add_signed(delta)
                .ok_or_else(|| {
                    Error::Io(std::io::Error::new(
                        ErrorKind::InvalidInput,
                        "seek before start of upgrade file",
                    ))
                })?,
            SeekFrom::End(_) => return Err(Error::SeekUnsupported),
        };
        let target = target.min(self.size);
        self.inner
            .seek(SeekFrom::Start(target))?;
        self.position = target;
        Ok(target)
    }

    /// Return to the first command.
    pub fn rewind(&mut self) -> Result<()> {
        self.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Check the first header without consuming it.
    ///
    /// The id must be one the format defines and the length must fit in both
    /// the file and the per-command cap.
    pub fn peek_first_command(&mut self) -> Result<CommandHeader> {
        self.rewind()?;
        let header = self
            .read_header()?
            .ok_or(Error::FileInvalidSize { size: self.size })?;
        self.rewind()?;

        if !header
            .id
            .is_known()
        {
            return Err(Error::FileCommandInvalid(format!(
                "first command {} is not recognised",
                header.id
            )));
        }
        let available = self
            .size
            .saturating_sub(MIN_FILE_SIZE);
        if u64::from(header.length) > available || header.length > MAX_PAYLOAD_LEN {
            return Err(Error::FilePacketLengthInvalid {
                length: header.length,
            });
        }
        Ok(header)
    }
}

/// Check the file size against the format bounds.
pub fn check_file_size(size: u64) -> Result<()> {
    if (MIN_FILE_SIZE..=MAX_FILE_SIZE).contains(&size) {
        Ok(())
    } else {
        Err(Error::FileInvalidSize { size })
    }
}
