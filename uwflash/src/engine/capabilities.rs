//! Bootloader capabilities and the values negotiated from them.

use crate::{
    error::{Error, Result},
    protocol::fup::FieldWidth,
};

/// Write chunk size used by legacy bootloaders.
pub const LEGACY_WRITE_SIZE: u32 = 252;

/// What the bootloader reported and what the session uses.
///
/// Defaults are the fixed values of legacy bootloaders, which take no
/// erase size index, one-byte write lengths and checksums, and four-byte
/// verify checksums.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Maximum erase length field (0x40).
    pub max_erase_len: u32,
    /// Maximum write length field (0x42).
    pub max_write_len: u32,
    /// Maximum checksum field (0x43).
    pub max_checksum_len: u32,
    /// Maximum verify checksum field (0x44).
    pub max_verify_checksum_len: u32,
    /// Maximum baud rate (0x45).
    pub max_baud: u32,
    /// Maximum erase size per command (0xA0).
    pub max_erase_size: u32,
    /// Maximum write size per command (0xA2).
    pub max_write_size: u32,
    /// Maximum checksum span per command (0xA3).
    pub max_checksum_size: u32,
    /// Number of erase sizes reported at index 0 of 0xB0.
    pub erase_size_count: u32,
    /// Number of baud rates reported at index 0 of 0xB5.
    pub baud_rate_count: u32,
    /// Erase sizes selectable by index (0xB0).
    pub erase_sizes: Vec<u32>,
    /// Baud rates selectable by 1-based index (0xB5).
    pub baud_rates: Vec<u32>,

    /// Whether erase commands carry an erase size index.
    pub erase_size_index: bool,
    /// Width of the length field of `w`.
    pub write_width: FieldWidth,
    /// Width of the checksum of `d`.
    pub checksum_width: FieldWidth,
    /// Width of the checksum of `v`.
    pub verify_checksum_width: FieldWidth,
    /// Bytes per write chunk.
    pub write_size: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_erase_len: 0,
            max_write_len: 0,
            max_checksum_len: 0,
            max_verify_checksum_len: 0,
            max_baud: 0,
            max_erase_size: 0,
            max_write_size: 0,
            max_checksum_size: 0,
            erase_size_count: 0,
            baud_rate_count: 0,
            erase_sizes: Vec::new(),
            baud_rates: Vec::new(),
            erase_size_index: false,
            write_width: FieldWidth::One,
            checksum_width: FieldWidth::One,
            verify_checksum_width: FieldWidth::Four,
            write_size: LEGACY_WRITE_SIZE,
        }
    }
}

impl Capabilities {
    /// Value sent for option 0x0000; also decides whether erase carries an index.
    pub fn erase_len_setting(&self) -> u8 {
        u8::from(self.max_erase_len == 1)
    }

    /// Width requested for the `w` length field.
    pub fn preferred_write_width(&self) -> FieldWidth {
        if self.max_write_len >= 2 {
            FieldWidth::Two
        } else {
            FieldWidth::One
        }
    }

    /// Width requested for the `d` checksum.
    pub fn preferred_checksum_width(&self) -> FieldWidth {
        FieldWidth::widest_within(self.max_checksum_len)
    }

    /// Width requested for the `v` checksum.
    pub fn preferred_verify_checksum_width(&self) -> FieldWidth {
        FieldWidth::widest_within(self.max_verify_checksum_len)
    }

    /// Baud rate for a 1-based index.
    pub fn baud_at(&self, index: u8) -> Option<u32> {
        usize::from(index)
            .checked_sub(1)
            .and_then(|i| {
                self.baud_rates
                    .get(i)
                    .copied()
            })
    }
}

/// Pick the 1-based index of the baud rate to switch to.
///
/// An exact rate must be offered; otherwise the fastest rate not above
/// `max` is used, or the fastest overall. `None` when nothing is offered
/// and no constraint was given.
pub fn select_baud(rates: &[u32], exact: Option<u32>, max: Option<u32>) -> Result<Option<u8>> {
    let to_index = |i: usize| Some((i + 1) as u8);

    if let Some(baud) = exact {
        return rates
            .iter()
            .position(|&r| r == baud)
            .map(to_index)
            .ok_or(Error::ExactBaudNotFound { baud });
    }

    if let Some(max) = max {
        return rates
            .iter()
            .enumerate()
            .filter(|&(_, &r)| r <= max)
            .max_by_key(|&(_, &r)| r)
            .map(|(i, _)| to_index(i))
            .ok_or(Error::MaxBaudUnsuitable { max });
    }

    Ok(rates
        .iter()
        .enumerate()
        .max_by_key(|&(_, &r)| r)
        .and_then(|(i, _)| to_index(i)))
}
