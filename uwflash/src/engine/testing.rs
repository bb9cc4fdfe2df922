//! Simulated bootloader for engine tests.

use {
    crate::{
        engine::Timing,
        error::{Error, Result},
        protocol::fup::{ENTER_BOOTLOADER, FieldWidth, checksum, option},
        transport::Transport,
    },
    std::{
        collections::{BTreeMap, VecDeque},
        io::Write,
        path::PathBuf,
        time::Duration,
    },
};

/// Short timer periods so sessions finish quickly.
pub(crate) fn fast_timing() -> Timing {
    Timing {
        command_timeout: Duration::from_millis(500),
        device_ready_interval: Duration::from_millis(2),
        device_ready_checks: 20,
        break_pulse: Duration::from_millis(2),
        baud_change_delay: Duration::from_millis(5),
        restart_delay: Duration::from_millis(5),
        spread_factor: 80,
    }
}

/// Write `contents` to a temporary upgrade file.
pub(crate) fn firmware_file(contents: &[u8]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir
        .path()
        .join("firmware.uwf");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents)
        .unwrap();
    (dir, path)
}

/// A module that answers FUP commands the way a bootloader does.
///
/// Every `transmit` call is taken as one complete frame.
#[derive(Debug)]
pub(crate) struct SimModule {
    pub port_name: String,
    pub baud: Option<u32>,
    pub opened_at: Vec<u32>,
    pub frames: Vec<Vec<u8>>,
    pub at_fup: usize,
    pub breaks: Vec<bool>,
    pub dtr: Vec<bool>,
    pub ready_polls: usize,

    pub version: String,
    pub enhanced: bool,
    pub max_erase_len: u32,
    pub max_write_len: u32,
    pub max_checksum_len: u32,
    pub max_verify_checksum_len: u32,
    pub max_write_size: u32,
    pub erase_sizes: Vec<u32>,
    pub baud_rates: Vec<u32>,

    pub ignore_versions: usize,
    pub platform_error: Option<u8>,
    pub unlock_error: Option<u8>,
    pub nak_verify: bool,
    pub reject_reboot: bool,
    pub not_ready_polls: usize,
    pub never_ready: bool,
    pub unplug_on: Option<u8>,
    pub fail_open_at: Option<u32>,

    pub platform: Option<[u8; 4]>,
    pub unlock_key: Option<Vec<u8>>,
    pub settings: BTreeMap<u16, u8>,
    pub erased: Vec<(u32, Option<u8>)>,
    pub memory: BTreeMap<u32, u8>,
    pub verifies: Vec<(u32, u32)>,
    pub reboots: usize,

    write_width: FieldWidth,
    checksum_width: FieldWidth,
    verify_width: FieldWidth,
    pending_write: Option<(u32, u32)>,
    unplugged: bool,
    rx: VecDeque<u8>,
}

impl SimModule {
    /// Bootloader that only knows the basic command set.
    pub fn legacy() -> Self {
        Self {
            port_name: "/dev/ttyUSB0".to_string(),
            baud: None,
            opened_at: Vec::new(),
            frames: Vec::new(),
            at_fup: 0,
            breaks: Vec::new(),
            dtr: Vec::new(),
            ready_polls: 0,
            version: "3.1.0".to_string(),
            enhanced: false,
            max_erase_len: 0,
            max_write_len: 0,
            max_checksum_len: 0,
            max_verify_checksum_len: 0,
            max_write_size: 0,
            erase_sizes: Vec::new(),
            baud_rates: Vec::new(),
            ignore_versions: 0,
            platform_error: None,
            unlock_error: None,
            nak_verify: false,
            reject_reboot: false,
            not_ready_polls: 0,
            never_ready: false,
            unplug_on: None,
            fail_open_at: None,
            platform: None,
            unlock_key: None,
            settings: BTreeMap::new(),
            erased: Vec::new(),
            memory: BTreeMap::new(),
            verifies: Vec::new(),
            reboots: 0,
            write_width: FieldWidth::One,
            checksum_width: FieldWidth::One,
            verify_width: FieldWidth::Four,
            pending_write: None,
            unplugged: false,
            rx: VecDeque::new(),
        }
    }

    /// Bootloader with capability queries, sized erase and baud switching.
    pub fn enhanced() -> Self {
        Self {
            version: "6.2.0".to_string(),
            enhanced: true,
            max_erase_len: 1,
            max_write_len: 2,
            max_checksum_len: 4,
            max_verify_checksum_len: 4,
            max_write_size: 1024,
            erase_sizes: vec![0x1000, 0x10000],
            baud_rates: vec![115200, 460800, 921600],
            ..Self::legacy()
        }
    }

    /// Transmitted frames starting with `command`.
    pub fn sent(&self, command: u8) -> Vec<&[u8]> {
        self.frames
            .iter()
            .filter(|f| f.first() == Some(&command))
            .map(Vec::as_slice)
            .collect()
    }

    /// Bytes written at `address`.
    pub fn read_memory(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| {
                self.memory
                    .get(&(address + i))
                    .copied()
                    .unwrap_or(0xFF)
            })
            .collect()
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.rx
            .extend(bytes);
    }

    fn ack(&mut self) {
        self.reply(b"a");
    }

    fn error(&mut self, code: u8) {
        self.reply(&[b'f', code]);
    }

    fn read_u32(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
    }

    fn read_width(data: &[u8], at: usize, width: FieldWidth) -> u32 {
        data[at..at + width.bytes() as usize]
            .iter()
            .rev()
            .fold(0, |acc, &b| (acc << 8) | u32::from(b))
    }

    fn query_value(&self, option: u16, index: u8) -> (u32, bool) {
        let list = |items: &[u32]| match index {
            0 => (items.len() as u32, !items.is_empty()),
            i => {
                let i = usize::from(i) - 1;
                (
                    items
                        .get(i)
                        .copied()
                        .unwrap_or(0),
                    i + 1 < items.len(),
                )
            },
        };
        match option {
            option::MAX_ERASE_LEN => (self.max_erase_len, false),
            option::MAX_WRITE_LEN => (self.max_write_len, false),
            option::MAX_CHECKSUM_LEN => (self.max_checksum_len, false),
            option::MAX_VERIFY_CHECKSUM_LEN => (self.max_verify_checksum_len, false),
            option::MAX_BAUDRATE => (
                self.baud_rates
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(0),
                false,
            ),
            option::MAX_ERASE_SIZE_PER_CMD => (
                self.erase_sizes
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(0),
                false,
            ),
            option::MAX_WRITE_SIZE_PER_CMD => (self.max_write_size, false),
            option::MAX_CHECKSUM_SIZE_PER_CMD => (0x10000, false),
            option::ERASE_SIZES => list(&self.erase_sizes),
            option::SUPPORTED_BAUDRATES => list(&self.baud_rates),
            _ => (0, false),
        }
    }

    fn width_for(value: u8) -> FieldWidth {
        match value {
            4 => FieldWidth::Four,
            2 => FieldWidth::Two,
            _ => FieldWidth::One,
        }
    }

    fn respond(&mut self, data: &[u8]) {
        if data == ENTER_BOOTLOADER {
            self.at_fup += 1;
            return;
        }
        let Some(&command) = data.first() else {
            return;
        };
        match command {
            b'V' => {
                if self.ignore_versions > 0 {
                    self.ignore_versions -= 1;
                    return;
                }
                let reply = format!("V{}\r", self.version);
                self.reply(reply.as_bytes());
            },
            b'p' => {
                self.platform = Some([data[1], data[2], data[3], data[4]]);
                match self.platform_error {
                    Some(code) => self.error(code),
                    None => self.ack(),
                }
            },
            b'?' | b'o' | b's' if !self.enhanced => self.error(4),
            b'?' => self.reply(&[b'?', 0xFF, 0x03, 0, 0, 0, 0, 0, 0]),
            b'o' => {
                let option = u16::from_le_bytes([data[1], data[2]]);
                let (value, more) = self.query_value(option, data[3]);
                let mut reply = vec![b'o', data[1], data[2], data[3]];
                reply.extend_from_slice(&value.to_le_bytes());
                reply.push(u8::from(more));
                self.reply(&reply);
            },
            b's' => {
                let option = u16::from_le_bytes([data[1], data[2]]);
                let value = data[3];
                self.settings
                    .insert(option, value);
                match option {
                    option::CURRENT_WRITE_LEN => self.write_width = Self::width_for(value),
                    option::CURRENT_CHECKSUM_LEN => self.checksum_width = Self::width_for(value),
                    option::CURRENT_VERIFY_CHECKSUM_LEN => {
                        self.verify_width = Self::width_for(value);
                    },
                    _ => {},
                }
                self.reply(&[b's', data[1], data[2], value]);
            },
            b'u' => {
                self.unlock_key = Some(data[1..].to_vec());
                match self.unlock_error {
                    Some(code) => self.error(code),
                    None => self.ack(),
                }
            },
            b'e' => {
                let address = Self::read_u32(data, 1);
                let index = data
                    .get(5)
                    .copied();
                self.erased
                    .push((address, index));
                self.ack();
            },
            b'w' => {
                let address = Self::read_u32(data, 1);
                let size = Self::read_width(data, 5, self.write_width);
                self.pending_write = Some((address, size));
                self.ack();
            },
            b'd' => {
                let Some((address, size)) = self
                    .pending_write
                    .take()
                else {
                    self.error(1);
                    return;
                };
                let width = self.checksum_width;
                let end = data.len() - width.bytes() as usize;
                let chunk = &data[1..end];
                let sum = Self::read_width(data, end, width);
                if chunk.len() != size as usize || sum != width.truncate(checksum(chunk)) {
                    self.error(37);
                    return;
                }
                for (i, &b) in chunk
                    .iter()
                    .enumerate()
                {
                    self.memory
                        .insert(address + i as u32, b);
                }
                self.ack();
            },
            b'v' => {
                let address = Self::read_u32(data, 1);
                let size = Self::read_u32(data, 5);
                let sum = Self::read_width(data, 9, self.verify_width);
                self.verifies
                    .push((address, size));
                let stored = self.read_memory(address, size as usize);
                if self.nak_verify || sum != self.verify_width.truncate(checksum(&stored)) {
                    self.reply(b"n");
                } else {
                    self.ack();
                }
            },
            b'z' => {
                self.reboots += 1;
                if self.reject_reboot {
                    self.error(4);
                }
            },
            _ => self.error(4),
        }
    }
}

impl Transport for SimModule {
    fn open(&mut self, baud_rate: u32) -> Result<()> {
        if self.fail_open_at == Some(baud_rate) {
            return Err(Error::PortFailedToOpen {
                port: self
                    .port_name
                    .clone(),
                reason: "simulated failure".to_string(),
            });
        }
        self.baud = Some(baud_rate);
        self.opened_at
            .push(baud_rate);
        Ok(())
    }

    fn close(&mut self) {
        self.baud = None;
    }

    fn is_open(&self) -> bool {
        self.baud
            .is_some()
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn set_port_name(&mut self, name: &str) {
        self.port_name = name.to_string();
    }

    fn transmit(&mut self, data: &[u8]) -> Result<()> {
        if self
            .baud
            .is_none()
        {
            return Err(Error::PortNotOpen);
        }
        self.frames
            .push(data.to_vec());
        if data.first() == self
            .unplug_on
            .as_ref()
        {
            self.unplugged = true;
            return Ok(());
        }
        self.respond(data);
        Ok(())
    }

    fn device_ready(&mut self) -> Result<bool> {
        self.ready_polls += 1;
        Ok(!self.never_ready && self.ready_polls > self.not_ready_polls)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.dtr
            .push(level);
        Ok(())
    }

    fn set_break(&mut self, level: bool) -> Result<()> {
        self.breaks
            .push(level);
        Ok(())
    }

    fn receive(&mut self, buf: &mut Vec<u8>) -> Result<usize> {
        if self.unplugged {
            self.unplugged = false;
            self.baud = None;
            return Err(Error::DeviceUnplugged);
        }
        let n = self
            .rx
            .len();
        buf.extend(
            self.rx
                .drain(..),
        );
        Ok(n)
    }
}
