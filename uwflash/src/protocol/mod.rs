//! Bootloader wire protocols.
//!
//! - [`fup`]: FUP command frames and response parsing

pub mod fup;
