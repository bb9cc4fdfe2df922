//! # uwflash
//!
//! A library for updating module firmware through the FUP bootloader.
//!
//! This crate provides the core functionality for replaying upgrade files
//! against a module over its serial port, including:
//!
//! - UWF/UBU upgrade file reading and validation
//! - FUP bootloader command framing and response decoding
//! - The update session state machine with enhanced capability negotiation
//! - Bootloader entry by `AT+FUP` or by bit-banging an FTDI bridge
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `ftdi`: Hardware bootloader entry through FTDI bridges (needs libusb)
//! - `serde`: Serialization support for reports and events
//!
//! ## Example
//!
//! ```rust,no_run
//! use uwflash::{Engine, SessionEvent, UpdateSettings};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let transport = uwflash::SerialTransport::new(uwflash::NativeOpener, "/dev/ttyUSB0");
//!         let mut engine = Engine::new(transport);
//!
//!         let settings = UpdateSettings::new("/dev/ttyUSB0", "firmware.uwf");
//!         let outcome = engine.run(settings, |event| {
//!             if let SessionEvent::Action(text) = event {
//!                 println!("{text}");
//!             }
//!         })?;
//!         println!("Done in {:?}", outcome.elapsed);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod config;
pub mod device;
pub mod engine;
pub mod entry;
pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker polled by running update sessions.
///
/// The checker should return `true` when the current session should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(feature = "native")]
pub use port::{NativeOpener, NativePort, NativePortEnumerator};
pub use {
    config::{UpdateSettings, parse_unlock_key},
    device::{DetectedPort, DeviceKind, detect_ports},
    engine::{Capabilities, Engine, SessionEvent, Timing, UpdateOutcome},
    entry::{BridgeBackend, BridgeBoard, EntryConsent, EntryMethod},
    error::{BootloaderError, Error, Module, Result},
    image::{UwfReader, ValidationReport, validate},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    transport::{SerialTransport, Transport},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }
}
