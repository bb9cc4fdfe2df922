//! Upgrade file (UWF/UBU) support.
//!
//! An upgrade file is a flat sequence of commands, each a six-byte header
//! (id, reserved byte, little-endian payload length) followed by its payload:
//!
//! ```text
//! +----+----------+------------+-----------------+
//! | id | reserved | length u32 | payload[length] |
//! +----+----------+------------+-----------------+
//! ```

pub mod uwf;
pub mod validate;

pub use {
    uwf::{CommandHeader, CommandId, UwfReader},
    validate::{CommandSummary, ValidationReport, validate},
};
