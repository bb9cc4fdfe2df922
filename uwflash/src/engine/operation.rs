//! Erase and write block progress.
//!
//! Each operation turns one upgrade file block into a series of bootloader
//! commands, one per acknowledgement.

use crate::{
    engine::{capabilities::Capabilities, registry::DeviceRegistry},
    error::{Error, Result},
    protocol::fup::{FupFrame, VERIFY_SPAN_MAX, checksum},
};

fn percent_done(remaining: u32, total: u32) -> u8 {
    if total == 0 {
        return 100;
    }
    (100 - u64::from(remaining) * 100 / u64::from(total)) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EraseMode {
    /// Enhanced bootloader: each command names one of the offered sizes.
    Sized,
    /// Legacy bootloader: each command erases one sector of the sector map.
    Sector { sector_size: u32, sectors_left: u32 },
}

/// An erase block in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseOperation {
    cursor: u32,
    remaining: u32,
    total: u32,
    mode: EraseMode,
    first: bool,
}

/// One erase command and the span it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseStep {
    /// Frame to send.
    pub frame: FupFrame,
    /// First address erased.
    pub start: u32,
    /// Bytes erased.
    pub len: u32,
}

impl EraseOperation {
    /// Erase `size` bytes from `address`.
    pub fn new(address: u32, size: u32, caps: &Capabilities) -> Self {
        let mode = if caps.erase_size_index
            && !caps
                .erase_sizes
                .is_empty()
        {
            EraseMode::Sized
        } else {
            EraseMode::Sector {
                sector_size: 0,
                sectors_left: 0,
            }
        };
        Self {
            cursor: address,
            remaining: size,
            total: size,
            mode,
            first: true,
        }
    }

    /// Whether the whole block has been requested.
    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }

    /// Percentage of the block requested so far.
    pub fn progress(&self) -> u8 {
        percent_done(self.remaining, self.total)
    }

    /// Build the next erase command and advance past it.
    pub fn next_step(&mut self, caps: &Capabilities, registry: &DeviceRegistry) -> Result<EraseStep> {
        let start = self.cursor;
        let (frame, len) = match &mut self.mode {
            EraseMode::Sized => {
                let index = erase_size_index(&caps.erase_sizes, self.remaining, self.first);
                let len = caps.erase_sizes[index];
                (FupFrame::erase(start, Some(index as u8)), len)
            },
            EraseMode::Sector {
                sector_size,
                sectors_left,
            } => {
                if *sectors_left == 0 {
                    let entry = registry
                        .sector_at(start)
                        .ok_or(Error::SectorMappingNotFound { address: start })?;
                    *sector_size = entry.sector_size;
                    *sectors_left =
                        entry.sector_count - (start - entry.offset) / entry.sector_size.max(1);
                }
                *sectors_left -= 1;
                (FupFrame::erase(start, None), *sector_size)
            },
        };

        self.first = false;
        self.cursor = self
            .cursor
            .wrapping_add(len);
        self.remaining = self
            .remaining
            .saturating_sub(len);
        Ok(EraseStep { frame, start, len })
    }
}

/// Index of the erase size for the next command.
///
/// The first command uses the smallest size covering the whole block, or
/// the largest size. Later commands use the largest size that does not
/// exceed what is left, falling back to the smallest.
fn erase_size_index(sizes: &[u32], remaining: u32, first: bool) -> usize {
    let last = sizes.len() - 1;
    if first {
        sizes
            .iter()
            .position(|&s| s >= remaining)
            .unwrap_or(last)
    } else {
        sizes
            .iter()
            .position(|&s| s > remaining)
            .map_or(last, |i| i.saturating_sub(1))
    }
}

/// What the next acknowledgement of a write block triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStep {
    /// Address acknowledged: send the data chunk.
    WriteData,
    /// Data acknowledged and a verify span is due.
    VerifyData,
    /// Data or verify acknowledged: announce the next chunk.
    WriteAddress,
    /// The closing verify was acknowledged.
    Finished,
}

/// Checksum accumulated since the last verify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct VerifySpan {
    address: u32,
    size: u32,
    sum: u32,
}

/// A write block in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOperation {
    cursor: u32,
    remaining: u32,
    total: u32,
    chunk: u32,
    step: WriteStep,
    verify: Option<VerifySpan>,
}

impl WriteOperation {
    /// Write `size` bytes to `address`, verifying as it goes if `verify`.
    pub fn new(address: u32, size: u32, verify: bool) -> Self {
        Self {
            cursor: address,
            remaining: size,
            total: size,
            chunk: 0,
            step: WriteStep::WriteAddress,
            verify: verify.then_some(VerifySpan {
                address,
                ..VerifySpan::default()
            }),
        }
    }

    /// Action the next acknowledgement triggers.
    pub fn step(&self) -> WriteStep {
        self.step
    }

    /// Percentage of the block sent so far.
    pub fn progress(&self) -> u8 {
        percent_done(self.remaining, self.total)
    }

    /// Size of the next data chunk; valid after [`Self::address`].
    pub fn chunk_len(&self) -> usize {
        self.chunk as usize
    }

    /// Announce the next chunk, flush the last verify span, or report the
    /// block complete with `None`.
    pub fn address(&mut self, caps: &Capabilities) -> Option<FupFrame> {
        if self.remaining > 0 {
            self.chunk = caps
                .write_size
                .min(self.remaining);
            self.step = WriteStep::WriteData;
            return Some(FupFrame::write(self.cursor, self.chunk, caps.write_width));
        }
        match self.take_verify(caps) {
            Some(frame) => {
                self.step = WriteStep::Finished;
                Some(frame)
            },
            None => {
                self.step = WriteStep::Finished;
                None
            },
        }
    }

    /// Send `data`, the chunk announced by the last address.
    pub fn data(&mut self, data: &[u8], caps: &Capabilities) -> FupFrame {
        let len = data.len() as u32;
        self.cursor = self
            .cursor
            .wrapping_add(len);
        self.remaining = self
            .remaining
            .saturating_sub(len);

        self.step = WriteStep::WriteAddress;
        if let Some(span) = &mut self.verify {
            span.size += len;
            span.sum = span
                .sum
                .wrapping_add(checksum(data));
            if span.size + caps.write_size > VERIFY_SPAN_MAX {
                self.step = WriteStep::VerifyData;
            }
        }
        FupFrame::data(data, caps.checksum_width)
    }

    /// Verify the span accumulated so far.
    pub fn verify(&mut self, caps: &Capabilities) -> Option<FupFrame> {
        self.step = WriteStep::WriteAddress;
        self.take_verify(caps)
    }

    fn take_verify(&mut self, caps: &Capabilities) -> Option<FupFrame> {
        let span = self
            .verify
            .as_mut()
            .filter(|s| s.size > 0)?;
        let frame = FupFrame::verify(
            span.address,
            span.size,
            caps.verify_checksum_width
                .truncate(span.sum),
            caps.verify_checksum_width,
        );
        *span = VerifySpan {
            address: span
                .address
                .wrapping_add(span.size),
            ..VerifySpan::default()
        };
        Some(frame)
    }
}
