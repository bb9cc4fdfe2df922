//! Notifications produced by a session.

use {
    crate::error::Module,
    std::time::Duration,
};

/// Something the caller may want to show or act on.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SessionEvent {
    /// Human-readable description of the current step.
    Action(String),
    /// Progress of the current erase/write (`task`) and through the file
    /// (`overall`), in percent.
    Progress {
        /// Current erase or write block.
        task: Option<u8>,
        /// Position in the upgrade file.
        overall: Option<u8>,
    },
    /// A failure, reported once before [`SessionEvent::Finished`].
    Error {
        /// Component the failure came from.
        module: Module,
        /// Description of the failure.
        message: String,
    },
    /// The session became active or inactive.
    Active(bool),
    /// The session ended.
    Finished {
        /// Whether the update completed.
        success: bool,
        /// Time from the first bootloader command to the end.
        elapsed_ms: u64,
    },
    /// The serial device was renamed by the OS during bootloader entry.
    PortRenamed(String),
}

/// Timer periods and limits of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Time allowed for a response to a command.
    pub command_timeout: Duration,
    /// Interval between CTS checks.
    pub device_ready_interval: Duration,
    /// CTS checks before giving up.
    pub device_ready_checks: u32,
    /// BREAK pulse length for the pre-update reboot.
    pub break_pulse: Duration,
    /// Wait after a baud rate change before reopening the port.
    pub baud_change_delay: Duration,
    /// Wait after the reboot request before the session completes.
    pub restart_delay: Duration,
    /// Line speed share assumed when scaling the data timeout, in percent.
    pub spread_factor: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_millis(2000),
            device_ready_interval: Duration::from_millis(250),
            device_ready_checks: 20,
            break_pulse: Duration::from_millis(80),
            baud_change_delay: Duration::from_millis(300),
            restart_delay: Duration::from_millis(250),
            spread_factor: 80,
        }
    }
}

impl Timing {
    /// Timeout for the acknowledgement of a data chunk of `len` bytes.
    ///
    /// Grows with the transfer time of the chunk at `baud`, counted in
    /// whole seconds.
    pub fn data_timeout(&self, len: usize, baud: u32) -> Duration {
        let bytes_per_second = (u64::from(baud) / 10).max(1);
        let seconds = (len as u64 / bytes_per_second) * 100 / self.spread_factor.max(1);
        self.command_timeout + Duration::from_secs(seconds)
    }
}

/// Summary of a completed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Time from the first bootloader command to completion.
    pub elapsed: Duration,
    /// Bootloader version text.
    pub bootloader_version: Option<String>,
    /// Baud rate at the end of the session.
    pub baud_rate: u32,
    /// Port name at the end of the session.
    pub port_name: String,
    /// Whether the module was told to reboot into the application.
    pub rebooted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_timeout_small_chunk() {
        let timing = Timing::default();
        assert_eq!(timing.data_timeout(252, 115200), Duration::from_millis(2000));
    }

    #[test]
    fn test_data_timeout_scales_with_slow_link() {
        let timing = Timing::default();
        // 4800 bytes at 960 bytes/s: 5 s on the wire, 6 s with spread
        assert_eq!(timing.data_timeout(4800, 9600), Duration::from_millis(8000));
    }
}
