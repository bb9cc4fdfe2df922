//! FUP bootloader protocol frames.
//!
//! Every host command is a single ASCII letter followed by a little-endian
//! binary payload. Responses are tagged by their first byte and have a fixed
//! length per tag; the stream carries no other framing.
//!
//! ## Host Commands
//!
//! ```text
//! +-----+-------------------------------------------+
//! | Cmd | Payload                                   |
//! +-----+-------------------------------------------+
//! |  V  | -                                         |
//! |  p  | platform id (4)                           |
//! |  ?  | -                                         |
//! |  o  | option id (2), index (1)                  |
//! |  s  | option id (2), value (1), zero (3)        |
//! |  u  | unlock key (64)                           |
//! |  e  | address (4) [, erase size index (1)]      |
//! |  w  | address (4), size (1/2/4)                 |
//! |  d  | data (size), checksum (1/2/4)             |
//! |  v  | address (4), size (4), checksum (1/2/4)   |
//! |  z  | -                                         |
//! +-----+-------------------------------------------+
//! ```
//!
//! ## Responses
//!
//! ```text
//! +-----+--------+----------------------------------+
//! | Tag | Length | Meaning                          |
//! +-----+--------+----------------------------------+
//! |  a  |   1    | acknowledge                      |
//! |  n  |   1-2  | not acknowledged (verify failed) |
//! |  f  |   2    | error, code in byte 1            |
//! |  V  |  >=6   | bootloader version text          |
//! |  o  |   9    | query: value u32 @4, more @8     |
//! |  s  |   4    | set response                     |
//! |  ?  |   9    | supported features bitmap        |
//! +-----+--------+----------------------------------+
//! ```

use byteorder::{LittleEndian, WriteBytesExt};

/// Software bootloader entry command sent to the application firmware.
pub const ENTER_BOOTLOADER: &[u8] = b"AT+FUP\r";

/// Size of the bootloader unlock key.
pub const UNLOCK_KEY_SIZE: usize = 64;

/// Largest span one verify command may cover.
pub const VERIFY_SPAN_MAX: u32 = 65535;

/// First version character of bootloaders that support negotiation.
pub const ENHANCED_VERSION_MARKER: u8 = b'6';

/// Host command letters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Bootloader version query.
    Version = b'V',
    /// Target platform check.
    TargetPlatform = b'p',
    /// Supported feature bitmap query.
    SupportedFeatures = b'?',
    /// Option query.
    Query = b'o',
    /// Option set.
    Set = b's',
    /// Unlock with key.
    Unlock = b'u',
    /// Erase a sector or sized region.
    Erase = b'e',
    /// Announce a write address and size.
    Write = b'w',
    /// Data for the announced write.
    Data = b'd',
    /// Verify a written span.
    Verify = b'v',
    /// Reboot into the application.
    Reboot = b'z',
}

/// Option ids understood by the `o` and `s` commands.
pub mod option {
    /// Active erase length field width (settable).
    pub const CURRENT_ERASE_LEN: u16 = 0x0000;
    /// Active write length field width (settable).
    pub const CURRENT_WRITE_LEN: u16 = 0x0002;
    /// Active checksum field width (settable).
    pub const CURRENT_CHECKSUM_LEN: u16 = 0x0003;
    /// Active verify checksum field width (settable).
    pub const CURRENT_VERIFY_CHECKSUM_LEN: u16 = 0x0004;
    /// Active baud rate, as a 1-based index into the supported list (settable).
    pub const CURRENT_BAUDRATE: u16 = 0x0005;
    /// Largest erase length field width.
    pub const MAX_ERASE_LEN: u16 = 0x0040;
    /// Largest write length field width.
    pub const MAX_WRITE_LEN: u16 = 0x0042;
    /// Largest checksum field width.
    pub const MAX_CHECKSUM_LEN: u16 = 0x0043;
    /// Largest verify checksum field width.
    pub const MAX_VERIFY_CHECKSUM_LEN: u16 = 0x0044;
    /// Highest baud rate.
    pub const MAX_BAUDRATE: u16 = 0x0045;
    /// Largest erase per command.
    pub const MAX_ERASE_SIZE_PER_CMD: u16 = 0x00A0;
    /// Largest write per command.
    pub const MAX_WRITE_SIZE_PER_CMD: u16 = 0x00A2;
    /// Largest checksummed span per command.
    pub const MAX_CHECKSUM_SIZE_PER_CMD: u16 = 0x00A3;
    /// Enumerated erase sizes (index 0 is the count).
    pub const ERASE_SIZES: u16 = 0x00B0;
    /// Enumerated baud rates (index 0 is the count).
    pub const SUPPORTED_BAUDRATES: u16 = 0x00B5;
}

/// Width of a negotiated length or checksum field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldWidth {
    /// 8-bit field.
    One,
    /// 16-bit field.
    Two,
    /// 32-bit field.
    Four,
}

impl FieldWidth {
    /// Widest field not exceeding what the bootloader reports it supports.
    pub fn widest_within(max_bytes: u32) -> Self {
        match max_bytes {
            4.. => Self::Four,
            2 | 3 => Self::Two,
            _ => Self::One,
        }
    }

    /// Field width in bytes.
    pub fn bytes(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }

    /// Truncate `value` to this width.
    pub fn truncate(self, value: u32) -> u32 {
        match self {
            Self::One => value & 0xFF,
            Self::Two => value & 0xFFFF,
            Self::Four => value,
        }
    }

    /// Append `value`, truncated to this width, little-endian.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write(self, buf: &mut Vec<u8>, value: u32) {
        match self {
            Self::One => buf.push(value as u8),
            Self::Two => buf
                .write_u16::<LittleEndian>(value as u16)
                .unwrap(),
            Self::Four => buf
                .write_u32::<LittleEndian>(value)
                .unwrap(),
        }
    }
}

/// Unsigned byte sum, wrapping at 32 bits.
///
/// Callers truncate the sum to the negotiated field width.
pub fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(u32::from(b)))
}

/// FUP command frame builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FupFrame {
    command: Command,
    data: Vec<u8>,
}

impl FupFrame {
    /// Create a frame with no payload.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            data: Vec::new(),
        }
    }

    /// `V`: ask for the bootloader version.
    pub fn version() -> Self {
        Self::new(Command::Version)
    }

    /// `p`: check the platform id, passed as the raw bytes from the file.
    pub fn target_platform(platform: [u8; 4]) -> Self {
        let mut frame = Self::new(Command::TargetPlatform);
        frame
            .data
            .extend_from_slice(&platform);
        frame
    }

    /// `?`: ask for the supported feature bitmap.
    pub fn supported_features() -> Self {
        Self::new(Command::SupportedFeatures)
    }

    /// `o`: query an option value.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn query(option: u16, index: u8) -> Self {
        let mut frame = Self::new(Command::Query);
        frame
            .data
            .write_u16::<LittleEndian>(option)
            .unwrap();
        frame
            .data
            .push(index);
        frame
    }

    /// `s`: set an option value.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn set(option: u16, value: u8) -> Self {
        let mut frame = Self::new(Command::Set);
        frame
            .data
            .write_u16::<LittleEndian>(option)
            .unwrap();
        frame
            .data
            .extend_from_slice(&[value, 0, 0, 0]);
        frame
    }

    /// `u`: unlock with a key.
    pub fn unlock(key: &[u8]) -> Self {
        let mut frame = Self::new(Command::Unlock);
        frame
            .data
            .extend_from_slice(key);
        frame
    }

    /// `e`: erase at `address`; enhanced bootloaders take an erase size index.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn erase(address: u32, size_index: Option<u8>) -> Self {
        let mut frame = Self::new(Command::Erase);
        frame
            .data
            .write_u32::<LittleEndian>(address)
            .unwrap();
        if let Some(index) = size_index {
            frame
                .data
                .push(index);
        }
        frame
    }

    /// `w`: announce a write of `size` bytes at `address`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write(address: u32, size: u32, width: FieldWidth) -> Self {
        let mut frame = Self::new(Command::Write);
        frame
            .data
            .write_u32::<LittleEndian>(address)
            .unwrap();
        width.write(&mut frame.data, size);
        frame
    }

    /// `d`: data chunk followed by its byte-sum checksum.
    pub fn data(chunk: &[u8], width: FieldWidth) -> Self {
        let mut frame = Self::new(Command::Data);
        frame
            .data
            .extend_from_slice(chunk);
        width.write(&mut frame.data, checksum(chunk));
        frame
    }

    /// `v`: ask the bootloader to check a written span.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn verify(address: u32, size: u32, checksum: u32, width: FieldWidth) -> Self {
        let mut frame = Self::new(Command::Verify);
        frame
            .data
            .write_u32::<LittleEndian>(address)
            .unwrap();
        frame
            .data
            .write_u32::<LittleEndian>(size)
            .unwrap();
        width.write(&mut frame.data, checksum);
        frame
    }

    /// `z`: reboot into the application.
    pub fn reboot() -> Self {
        Self::new(Command::Reboot)
    }

    /// Command letter.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Build the bytes to transmit.
    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.data.len());
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.data);
        buf
    }
}

/// Length of an acknowledge response.
pub const ACK_LEN: usize = 1;
/// Length of an error response.
pub const ERROR_LEN: usize = 2;
/// Minimum length of a version response.
pub const VERSION_LEN: usize = 6;
/// Length of a query response.
pub const QUERY_LEN: usize = 9;
/// Length of a set response.
pub const SET_LEN: usize = 4;
/// Length of a supported features response.
pub const FEATURES_LEN: usize = 9;

/// A complete bootloader response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `a`
    Ack,
    /// `n`
    Nak,
    /// `f` with the error code byte.
    Error(u8),
    /// `V` with the version text that follows the tag.
    Version(String),
    /// `o` with value and more-data flag.
    Query {
        /// Option value.
        value: u32,
        /// Whether more indexed entries follow.
        more: bool,
    },
    /// `s` with its three payload bytes.
    Set([u8; 3]),
    /// `?` with the feature bitmap.
    Features([u8; 8]),
}

/// Result of trying to decode the front of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A response and the number of bytes it occupies.
    Complete(Response, usize),
    /// The tag is known but more bytes are needed.
    Incomplete,
    /// The leading byte is not a response tag.
    Unrecognised(u8),
    /// The buffer is empty.
    Empty,
}

impl Response {
    /// Decode the response at the front of `buf`.
    ///
    /// Nothing is consumed; callers drain the reported length once they
    /// have acted on the response. A version response takes everything
    /// buffered as its text.
    pub fn parse(buf: &[u8]) -> Parsed {
        let Some(&tag) = buf.first() else {
            return Parsed::Empty;
        };
        let need = |len: usize| buf.len() >= len;
        match tag {
            b'a' => Parsed::Complete(Self::Ack, ACK_LEN),
            b'n' => Parsed::Complete(Self::Nak, buf.len().min(ERROR_LEN)),
            b'f' if need(ERROR_LEN) => Parsed::Complete(Self::Error(buf[1]), ERROR_LEN),
            b'V' if need(VERSION_LEN) => {
                let text = String::from_utf8_lossy(&buf[1..])
                    .trim_end_matches(['\r', '\n', '\0'])
                    .to_string();
                Parsed::Complete(Self::Version(text), buf.len())
            },
            b'o' if need(QUERY_LEN) => {
                let value = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
                Parsed::Complete(
                    Self::Query {
                        value,
                        more: buf[8] == 1,
                    },
                    QUERY_LEN,
                )
            },
            b's' if need(SET_LEN) => Parsed::Complete(Self::Set([buf[1], buf[2], buf[3]]), SET_LEN),
            b'?' if need(FEATURES_LEN) => {
                let mut bitmap = [0u8; 8];
                bitmap.copy_from_slice(&buf[1..FEATURES_LEN]);
                Parsed::Complete(Self::Features(bitmap), FEATURES_LEN)
            },
            b'f' | b'V' | b'o' | b's' | b'?' => Parsed::Incomplete,
            other => Parsed::Unrecognised(other),
        }
    }
}
