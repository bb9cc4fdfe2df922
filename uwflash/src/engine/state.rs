//! Session states and timers.

use {
    crate::{
        engine::{
            capabilities::Capabilities,
            operation::{EraseOperation, WriteOperation},
        },
        protocol::fup::{FupFrame, option},
    },
    std::time::{Duration, Instant},
};

/// Where the session is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum State {
    /// No command outstanding.
    #[default]
    Idle,
    /// BREAK asserted for the pre-update reboot.
    RebootPulse,
    /// Waiting for CTS after the pre-update reboot.
    RebootWait,
    /// Waiting for CTS after bootloader entry; inbound bytes are discarded.
    EnterBootloader,
    /// `V` sent.
    BootloaderVersion,
    /// `p` sent.
    PlatformCommand,
    /// `?` sent.
    SupportedFunctions,
    /// `o` sent.
    Query(QueryStep),
    /// `s` sent.
    Set(SetStep),
    /// Baud rate set sent; waiting before reopening the port.
    BaudChange,
    /// `u` sent.
    Unlock,
    /// `e` sent.
    Erase(EraseOperation),
    /// `w`, `d` or `v` sent.
    Write(WriteOperation),
    /// Reboot requested; waiting for the restart delay.
    Reset {
        /// BREAK is held and must be released.
        via_break: bool,
    },
}

impl State {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RebootPulse => "reboot pulse",
            Self::RebootWait => "reboot wait",
            Self::EnterBootloader => "enter bootloader",
            Self::BootloaderVersion => "bootloader version",
            Self::PlatformCommand => "platform command",
            Self::SupportedFunctions => "supported functions",
            Self::Query(_) => "query",
            Self::Set(_) => "set",
            Self::BaudChange => "baud change",
            Self::Unlock => "unlock",
            Self::Erase(_) => "erase",
            Self::Write(_) => "write",
            Self::Reset { .. } => "reset",
        }
    }
}

/// Capability query chain, in the order options are asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryStep {
    MaxEraseLen,
    MaxWriteLen,
    MaxChecksumLen,
    MaxVerifyChecksumLen,
    MaxBaud,
    MaxEraseSize,
    MaxWriteSize,
    MaxChecksumSize,
    EraseSizeCount,
    BaudRateCount,
    EraseSize(u8),
    BaudRate(u8),
}

impl QueryStep {
    /// Query frame for this step.
    pub(crate) fn frame(self) -> FupFrame {
        match self {
            Self::MaxEraseLen => FupFrame::query(option::MAX_ERASE_LEN, 0),
            Self::MaxWriteLen => FupFrame::query(option::MAX_WRITE_LEN, 0),
            Self::MaxChecksumLen => FupFrame::query(option::MAX_CHECKSUM_LEN, 0),
            Self::MaxVerifyChecksumLen => FupFrame::query(option::MAX_VERIFY_CHECKSUM_LEN, 0),
            Self::MaxBaud => FupFrame::query(option::MAX_BAUDRATE, 0),
            Self::MaxEraseSize => FupFrame::query(option::MAX_ERASE_SIZE_PER_CMD, 0),
            Self::MaxWriteSize => FupFrame::query(option::MAX_WRITE_SIZE_PER_CMD, 0),
            Self::MaxChecksumSize => FupFrame::query(option::MAX_CHECKSUM_SIZE_PER_CMD, 0),
            Self::EraseSizeCount => FupFrame::query(option::ERASE_SIZES, 0),
            Self::BaudRateCount => FupFrame::query(option::SUPPORTED_BAUDRATES, 0),
            Self::EraseSize(index) => FupFrame::query(option::ERASE_SIZES, index),
            Self::BaudRate(index) => FupFrame::query(option::SUPPORTED_BAUDRATES, index),
        }
    }

    /// Record `value` and pick the next query, `None` when the chain is done.
    ///
    /// Index 0 of the erase size and baud rate lists holds the entry count.
    /// Entries start at index 1 and follow while the bootloader reports more.
    pub(crate) fn record(self, value: u32, more: bool, caps: &mut Capabilities) -> Option<Self> {
        match self {
            Self::MaxEraseLen => {
                caps.max_erase_len = value;
                Some(Self::MaxWriteLen)
            },
            Self::MaxWriteLen => {
                caps.max_write_len = value;
                Some(Self::MaxChecksumLen)
            },
            Self::MaxChecksumLen => {
                caps.max_checksum_len = value;
                Some(Self::MaxVerifyChecksumLen)
            },
            Self::MaxVerifyChecksumLen => {
                caps.max_verify_checksum_len = value;
                Some(Self::MaxBaud)
            },
            Self::MaxBaud => {
                caps.max_baud = value;
                Some(Self::MaxEraseSize)
            },
            Self::MaxEraseSize => {
                caps.max_erase_size = value;
                Some(Self::MaxWriteSize)
            },
            Self::MaxWriteSize => {
                caps.max_write_size = value;
                if value > 0 {
                    caps.write_size = value;
                }
                Some(Self::MaxChecksumSize)
            },
            Self::MaxChecksumSize => {
                caps.max_checksum_size = value;
                Some(Self::EraseSizeCount)
            },
            Self::EraseSizeCount => {
                caps.erase_size_count = value;
                caps.erase_sizes
                    .clear();
                Some(Self::BaudRateCount)
            },
            Self::BaudRateCount => {
                caps.baud_rate_count = value;
                caps.baud_rates
                    .clear();
                Some(Self::EraseSize(1))
            },
            Self::EraseSize(index) => {
                caps.erase_sizes
                    .push(value);
                Some(if more {
                    Self::EraseSize(index.saturating_add(1))
                } else {
                    Self::BaudRate(1)
                })
            },
            Self::BaudRate(index) => {
                caps.baud_rates
                    .push(value);
                more.then_some(Self::BaudRate(index.saturating_add(1)))
            },
        }
    }
}

/// Option set chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetStep {
    EraseLen,
    WriteLen,
    ChecksumLen,
    VerifyChecksumLen,
    BaudRate,
}

impl SetStep {
    /// Set frame for this step; `baud_index` is only used by the last step.
    pub(crate) fn frame(self, caps: &Capabilities, baud_index: u8) -> FupFrame {
        match self {
            Self::EraseLen => FupFrame::set(option::CURRENT_ERASE_LEN, caps.erase_len_setting()),
            Self::WriteLen => FupFrame::set(
                option::CURRENT_WRITE_LEN,
                caps.preferred_write_width()
                    .bytes(),
            ),
            Self::ChecksumLen => FupFrame::set(
                option::CURRENT_CHECKSUM_LEN,
                caps.preferred_checksum_width()
                    .bytes(),
            ),
            Self::VerifyChecksumLen => FupFrame::set(
                option::CURRENT_VERIFY_CHECKSUM_LEN,
                caps.preferred_verify_checksum_width()
                    .bytes(),
            ),
            Self::BaudRate => FupFrame::set(option::CURRENT_BAUDRATE, baud_index),
        }
    }

    /// Apply the acknowledged setting and pick the next step.
    pub(crate) fn apply(self, caps: &mut Capabilities) -> Option<Self> {
        match self {
            Self::EraseLen => {
                caps.erase_size_index = caps.erase_len_setting() == 1;
                Some(Self::WriteLen)
            },
            Self::WriteLen => {
                caps.write_width = caps.preferred_write_width();
                caps.write_size = caps
                    .write_size
                    .min(
                        caps.write_width
                            .truncate(u32::MAX),
                    );
                Some(Self::ChecksumLen)
            },
            Self::ChecksumLen => {
                caps.checksum_width = caps.preferred_checksum_width();
                Some(Self::VerifyChecksumLen)
            },
            Self::VerifyChecksumLen => {
                caps.verify_checksum_width = caps.preferred_verify_checksum_width();
                Some(Self::BaudRate)
            },
            Self::BaudRate => None,
        }
    }
}

/// Session timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// No response to a command.
    Command,
    /// CTS poll.
    DeviceReady,
    /// End of the pre-update BREAK pulse.
    BreakPulse,
    /// Reopen the port after a baud rate change.
    BaudChange,
    /// Complete the session after the reboot request.
    Restart,
}

impl TimerKind {
    const ALL: [Self; 5] = [
        Self::Command,
        Self::DeviceReady,
        Self::BreakPulse,
        Self::BaudChange,
        Self::Restart,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// One-shot deadlines, one per timer kind.
#[derive(Debug, Clone, Default)]
pub(crate) struct Timers {
    deadlines: [Option<Instant>; 5],
}

impl Timers {
    pub(crate) fn start(&mut self, kind: TimerKind, after: Duration) {
        self.deadlines[kind.slot()] = Some(Instant::now() + after);
    }

    pub(crate) fn stop(&mut self, kind: TimerKind) {
        self.deadlines[kind.slot()] = None;
    }

    pub(crate) fn is_running(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.slot()].is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.deadlines = [None; 5];
    }

    /// Earliest running timer.
    pub(crate) fn next(&self) -> Option<(TimerKind, Instant)> {
        TimerKind::ALL
            .into_iter()
            .filter_map(|kind| self.deadlines[kind.slot()].map(|at| (kind, at)))
            .min_by_key(|&(_, at)| at)
    }

    /// Stop and return the earliest timer due at `now`.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Option<TimerKind> {
        let (kind, at) = self.next()?;
        if at <= now {
            self.stop(kind);
            Some(kind)
        } else {
            None
        }
    }
}
