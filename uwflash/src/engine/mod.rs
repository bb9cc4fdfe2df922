//! Firmware update engine.
//!
//! [`Engine`] replays an upgrade file against a module's bootloader. It is
//! an explicit state machine driven by three inputs: bytes received from
//! the [`Transport`], timer expiries, and the caller starting or ending a
//! session. Everything the caller may want to show is queued as a
//! [`SessionEvent`].
//!
//! ## Session flow
//!
//! ```text
//! [reboot pulse] -> bootloader entry -> CTS poll -> V
//!     -> replay: T (p) [-> ? -> o... -> s... -> baud change -> [u]]
//!                G / S / M / U     in memory
//!                E                 e, e, ...
//!                W                 w, d, [v,] w, d, ... [v]
//!     -> end of file: z (enhanced) or BREAK (legacy) -> restart delay
//! ```
//!
//! The engine is single-threaded. [`Engine::run_to_completion`] drives it
//! from the transport; embedders with their own event loop feed
//! [`Engine::handle_data`] and [`Engine::poll_timers`] instead.

mod capabilities;
mod events;
mod operation;
mod registry;
mod state;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use {
    capabilities::{Capabilities, LEGACY_WRITE_SIZE, select_baud},
    events::{SessionEvent, Timing, UpdateOutcome},
    operation::{EraseOperation, EraseStep, WriteOperation, WriteStep},
    registry::{DeviceRegistry, SectorMapEntry},
    state::TimerKind,
};
use {
    crate::{
        config::UpdateSettings,
        entry::{BridgeBackend, BridgeRequest, EntryConsent, default_backend},
        error::{BootloaderError, Error, Result},
        image::{
            uwf::{
                CommandId, EraseBlock, RegisterDevice, SectorGroup, SelectDevice,
                WRITE_BLOCK_HEADER_LEN, WriteBlockHeader, check_file_size,
            },
            validate::validate,
            UwfReader,
        },
        protocol::fup::{ENHANCED_VERSION_MARKER, ENTER_BOOTLOADER, FupFrame, Parsed, Response},
        transport::Transport,
    },
    log::{debug, trace},
    state::{QueryStep, SetStep, State, Timers},
    std::{
        collections::VecDeque,
        fs::File,
        io::{BufReader, SeekFrom},
        thread,
        time::{Duration, Instant},
    },
};

/// Longest sleep of [`Engine::run_to_completion`] when nothing arrived.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Replays upgrade files against a bootloader over a [`Transport`].
pub struct Engine<T: Transport> {
    transport: T,
    bridge: Box<dyn BridgeBackend + Send>,
    consent: Option<Box<dyn EntryConsent + Send>>,
    timing: Timing,

    settings: UpdateSettings,
    reader: Option<UwfReader<BufReader<File>>>,
    state: State,
    caps: Capabilities,
    registry: DeviceRegistry,
    enhanced: bool,
    active_baud: u32,
    baud_index: Option<u8>,
    bootloader_version: Option<String>,
    rx: Vec<u8>,
    timers: Timers,
    started: Option<Instant>,
    ready_checks: u32,
    version_resent: bool,

    active: bool,
    events: VecDeque<SessionEvent>,
    outcome: Option<Result<UpdateOutcome>>,
}

impl<T: Transport> Engine<T> {
    /// Create an idle engine over `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            bridge: default_backend(),
            consent: None,
            timing: Timing::default(),
            settings: UpdateSettings::default(),
            reader: None,
            state: State::Idle,
            caps: Capabilities::default(),
            registry: DeviceRegistry::default(),
            enhanced: false,
            active_baud: 0,
            baud_index: None,
            bootloader_version: None,
            rx: Vec::new(),
            timers: Timers::default(),
            started: None,
            ready_checks: 0,
            version_resent: false,
            active: false,
            events: VecDeque::new(),
            outcome: None,
        }
    }

    /// Use `bridge` for hardware bootloader entry.
    #[must_use]
    pub fn with_bridge(mut self, bridge: Box<dyn BridgeBackend + Send>) -> Self {
        self.bridge = bridge;
        self
    }

    /// Ask `consent` before any hardware bootloader entry.
    #[must_use]
    pub fn with_consent(mut self, consent: impl EntryConsent + Send + 'static) -> Self {
        self.consent = Some(Box::new(consent));
        self
    }

    /// Override timer periods.
    #[must_use]
    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Whether a session is running.
    pub fn is_update_in_progress(&self) -> bool {
        self.active
    }

    /// Capabilities in use by the current or last session.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<(TimerKind, Instant)> {
        self.timers
            .next()
    }

    /// Take the oldest queued event.
    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.events
            .pop_front()
    }

    /// Start a session.
    ///
    /// Only a session already running is reported here. Every other failure,
    /// including invalid settings or an unreadable upgrade file, ends the
    /// new session through the usual [`SessionEvent::Error`] and
    /// [`SessionEvent::Finished`] events.
    pub fn start(&mut self, settings: UpdateSettings) -> Result<()> {
        if self.active {
            return Err(Error::SessionActive);
        }
        self.reset_session();
        self.settings = settings;
        self.active = true;
        self.push(SessionEvent::Active(true));

        if let Err(e) = self.startup() {
            self.fail(e);
        }
        Ok(())
    }

    /// Start a session and drive it to its end.
    pub fn run<F: FnMut(&SessionEvent)>(
        &mut self,
        settings: UpdateSettings,
        on_event: F,
    ) -> Result<UpdateOutcome> {
        self.start(settings)?;
        self.run_to_completion(on_event)
    }

    /// Drive the running session from the transport until it ends.
    ///
    /// Events are handed to `on_event` as they are produced. The embedder's
    /// interrupt checker ends the session with [`Error::Interrupted`].
    pub fn run_to_completion<F: FnMut(&SessionEvent)>(
        &mut self,
        mut on_event: F,
    ) -> Result<UpdateOutcome> {
        let mut buf = Vec::new();
        loop {
            while let Some(event) = self.next_event() {
                on_event(&event);
            }
            if !self.active {
                break;
            }
            if crate::is_interrupted_requested() {
                self.fail(Error::Interrupted);
                continue;
            }

            buf.clear();
            let received = if self
                .transport
                .is_open()
            {
                self.transport
                    .receive(&mut buf)
            } else {
                Ok(0)
            };
            let idle = matches!(received, Ok(0));
            match received {
                Ok(0) => {},
                Ok(_) => self.handle_data(&buf),
                Err(e) => {
                    self.fail(e);
                    continue;
                },
            }

            self.poll_timers(Instant::now());
            if idle && self.active {
                let wait = self
                    .next_deadline()
                    .map_or(IDLE_WAIT, |(_, at)| {
                        at.saturating_duration_since(Instant::now())
                            .min(IDLE_WAIT)
                    });
                thread::sleep(wait);
            }
        }
        self.outcome
            .take()
            .unwrap_or(Err(Error::Interrupted))
    }

    /// Feed bytes received from the module.
    pub fn handle_data(&mut self, data: &[u8]) {
        if !self.active {
            return;
        }
        self.rx
            .extend_from_slice(data);
        if let Err(e) = self.process_rx() {
            self.fail(e);
        }
    }

    /// Fire every timer due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        while self.active {
            let Some(kind) = self
                .timers
                .take_expired(now)
            else {
                break;
            };
            self.handle_timer(kind);
        }
    }

    /// Handle the expiry of `kind`.
    pub fn handle_timer(&mut self, kind: TimerKind) {
        if !self.active {
            return;
        }
        self.timers
            .stop(kind);
        let state = std::mem::take(&mut self.state);
        match self.on_timer(state, kind) {
            Ok(next) if self.active => self.state = next,
            Ok(_) => {},
            Err(e) => self.fail(e),
        }
    }

    /// Tear the session down without reporting an outcome.
    ///
    /// Closes the port and the upgrade file and forgets every registered
    /// device. Calling it on an idle engine does nothing.
    pub fn end_session(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.timers
            .clear();
        self.transport
            .close();
        self.reader = None;
        self.registry = DeviceRegistry::default();
        self.rx
            .clear();
        self.state = State::Idle;
        debug!("Update session ended");
        self.push(SessionEvent::Active(false));
    }

    fn reset_session(&mut self) {
        self.reader = None;
        self.state = State::Idle;
        self.caps = Capabilities::default();
        self.registry = DeviceRegistry::default();
        self.enhanced = false;
        self.active_baud = 0;
        self.baud_index = None;
        self.bootloader_version = None;
        self.rx
            .clear();
        self.timers
            .clear();
        self.started = None;
        self.ready_checks = 0;
        self.version_resent = false;
        self.outcome = None;
    }

    // ---- notifications ----

    fn push(&mut self, event: SessionEvent) {
        self.events
            .push_back(event);
    }

    fn action(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("{message}");
        self.push(SessionEvent::Action(message));
    }

    fn overall(&self) -> Option<u8> {
        self.reader
            .as_ref()
            .map(|r| match r.size() {
                0 => 100,
                size => (r.position() * 100 / size) as u8,
            })
    }

    fn report_overall(&mut self) {
        let overall = self.overall();
        self.push(SessionEvent::Progress {
            task: None,
            overall,
        });
    }

    fn report_task(&mut self, task: u8, with_overall: bool) {
        let overall = if with_overall { self.overall() } else { None };
        self.push(SessionEvent::Progress {
            task: Some(task),
            overall,
        });
    }

    fn elapsed(&self) -> Duration {
        self.started
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    fn succeed(&mut self, rebooted: bool) {
        let elapsed = self.elapsed();
        if rebooted {
            self.action(format!(
                "Firmware upgrade completed in {}ms",
                elapsed.as_millis()
            ));
        } else {
            self.action(format!(
                "Firmware upgrade completed in {}ms (module left in bootloader mode at {} baud)",
                elapsed.as_millis(),
                self.active_baud
            ));
        }
        let outcome = UpdateOutcome {
            elapsed,
            bootloader_version: self
                .bootloader_version
                .clone(),
            baud_rate: self.active_baud,
            port_name: self
                .transport
                .port_name()
                .to_string(),
            rebooted,
        };
        self.end_session();
        self.push(SessionEvent::Finished {
            success: true,
            elapsed_ms: elapsed.as_millis() as u64,
        });
        self.outcome = Some(Ok(outcome));
    }

    /// Report `err` and end the session; later failures are dropped.
    fn fail(&mut self, err: Error) {
        if !self.active {
            debug!("Dropping failure after session end: {err}");
            return;
        }
        let elapsed = self.elapsed();
        if self
            .started
            .is_some()
        {
            self.action(format!(
                "Firmware upgrade failed, total time: {}ms",
                elapsed.as_millis()
            ));
        } else {
            self.action("Firmware upgrade failed.");
        }
        self.push(SessionEvent::Error {
            module: err.module(),
            message: err.to_string(),
        });
        self.end_session();
        self.push(SessionEvent::Finished {
            success: false,
            elapsed_ms: elapsed.as_millis() as u64,
        });
        self.outcome = Some(Err(err));
    }

    // ---- startup ----

    fn startup(&mut self) -> Result<()> {
        self.settings
            .check()?;

        let mut reader = UwfReader::open(&self.settings.firmware)?;
        check_file_size(reader.size())?;
        if self
            .settings
            .validate
        {
            let report = validate(&mut reader)?;
            self.action(format!(
                "Upgrade file validated: {} commands, {} bytes of data",
                report
                    .commands
                    .len(),
                report.write_bytes
            ));
        }
        let first = reader.peek_first_command()?;
        trace!("First command: {} ({} bytes)", first.id, first.length);
        self.reader = Some(reader);

        let port = self
            .settings
            .port
            .clone();
        self.transport
            .set_port_name(&port);

        if self
            .settings
            .reboot_before
        {
            self.action("Rebooting module");
            self.transport
                .open(self.settings.bootloader_baud)?;
            self.transport
                .set_dtr(
                    self.settings
                        .reboot_dtr,
                )?;
            self.transport
                .set_break(true)?;
            self.state = State::RebootPulse;
            self.timers
                .start(TimerKind::BreakPulse, self.timing.break_pulse);
            return Ok(());
        }
        self.enter_bootloader()
    }

    fn enter_bootloader(&mut self) -> Result<()> {
        let method = self
            .settings
            .entry_method;
        self.active_baud = self
            .settings
            .initial_baud();

        if let Some(board) = method.bridge_board() {
            if !self
                .settings
                .skip_entry_confirmation
            {
                if let Some(consent) = &mut self.consent {
                    consent.confirm(method)?;
                }
            }
            self.transport
                .close();
            self.action(format!(
                "Resetting module into bootloader through {board} bridge"
            ));
            let request = BridgeRequest {
                port_name: self
                    .transport
                    .port_name()
                    .to_string(),
                board,
                serial_override: self
                    .settings
                    .bridge_serial
                    .clone(),
            };
            let renamed = self
                .bridge
                .enter(&request)
                .map_err(|e| Error::EntranceFailed(Box::new(e)))?;
            if let Some(name) = renamed {
                self.action(format!("Serial port renamed to {name}"));
                self.transport
                    .set_port_name(&name);
                self.push(SessionEvent::PortRenamed(name));
            }
        }

        self.transport
            .open(self.active_baud)?;
        if method.sends_at_fup() {
            self.action("Entering bootloader");
            self.transport
                .transmit(ENTER_BOOTLOADER)?;
        }
        self.state = State::EnterBootloader;
        self.ready_checks = 0;
        self.timers
            .start(TimerKind::DeviceReady, self.timing.device_ready_interval);
        Ok(())
    }

    /// Count a failed CTS check.
    fn not_ready(&mut self) -> Result<()> {
        self.ready_checks += 1;
        if self.ready_checks > self.timing.device_ready_checks {
            return Err(Error::CtsTimeout);
        }
        self.timers
            .start(TimerKind::DeviceReady, self.timing.device_ready_interval);
        Ok(())
    }

    fn poll_reboot_ready(&mut self) -> Result<State> {
        if !self
            .transport
            .device_ready()?
        {
            self.not_ready()?;
            return Ok(State::RebootWait);
        }
        self.transport
            .close();
        self.enter_bootloader()?;
        Ok(State::EnterBootloader)
    }

    fn poll_bootloader_ready(&mut self) -> Result<State> {
        if !self
            .transport
            .device_ready()?
        {
            self.not_ready()?;
            return Ok(State::EnterBootloader);
        }

        let bootloader_baud = self
            .settings
            .bootloader_baud;
        if self
            .settings
            .entry_method
            .uses_application_baud()
            && bootloader_baud != self.active_baud
        {
            self.transport
                .close();
            self.active_baud = bootloader_baud;
            self.transport
                .open(bootloader_baud)
                .map_err(|e| Error::PortReopenFailed(e.to_string()))?;
        }

        self.version_resent = false;
        self.started = Some(Instant::now());
        self.send(&FupFrame::version())?;
        Ok(State::BootloaderVersion)
    }

    // ---- wire ----

    fn send(&mut self, frame: &FupFrame) -> Result<()> {
        self.send_with_timeout(frame, self.timing.command_timeout)
    }

    fn send_with_timeout(&mut self, frame: &FupFrame, timeout: Duration) -> Result<()> {
        trace!("Sending {:?}", frame.command());
        self.transport
            .transmit(&frame.build())?;
        self.timers
            .start(TimerKind::Command, timeout);
        Ok(())
    }

    fn process_rx(&mut self) -> Result<()> {
        while self.active {
            match self.state {
                State::Idle | State::RebootPulse | State::RebootWait | State::EnterBootloader => {
                    self.rx
                        .clear();
                    return Ok(());
                },
                State::BootloaderVersion => {
                    match self
                        .rx
                        .iter()
                        .position(|&b| b == b'V')
                    {
                        Some(start) => {
                            self.rx
                                .drain(..start);
                        },
                        None => {
                            self.rx
                                .clear();
                            return Ok(());
                        },
                    }
                },
                _ => {},
            }

            let (response, used) = match Response::parse(&self.rx) {
                Parsed::Complete(response, used) => (response, used),
                Parsed::Unrecognised(byte) => {
                    trace!("Unrecognised response byte {byte:#04x}, waiting for more data");
                    return Ok(());
                },
                Parsed::Incomplete | Parsed::Empty => return Ok(()),
            };
            self.rx
                .drain(..used);
            trace!("Received {response:?} in {} state", self.state.name());

            let state = std::mem::take(&mut self.state);
            let next = self.on_response(state, response)?;
            if self.active {
                self.state = next;
            }
        }
        Ok(())
    }

    fn on_response(&mut self, state: State, response: Response) -> Result<State> {
        match (state, response) {
            (State::BootloaderVersion, Response::Version(version)) => self.on_version(version),
            (State::PlatformCommand, Response::Ack) => {
                if self.enhanced {
                    self.send(&FupFrame::supported_features())?;
                    Ok(State::SupportedFunctions)
                } else {
                    self.next_packet()
                }
            },
            (State::SupportedFunctions, Response::Features(bitmap)) => {
                self.action(format!("Supported functions: {bitmap:02x?}"));
                let step = QueryStep::MaxEraseLen;
                self.send(&step.frame())?;
                Ok(State::Query(step))
            },
            (State::Query(step), Response::Query { value, more }) => {
                self.on_query(step, value, more)
            },
            (State::Set(step), Response::Ack | Response::Set(_)) => self.on_set(step),
            (State::BaudChange, response) => {
                trace!("Ignoring {response:?} during baud rate change");
                Ok(State::BaudChange)
            },
            (State::Unlock, Response::Ack) => {
                self.action("Module unlocked");
                self.next_packet()
            },
            (State::Unlock, Response::Error(code))
                if BootloaderError::from_code(code) == BootloaderError::WormNotSet =>
            {
                self.action("Module has no unlock key set, continuing");
                self.next_packet()
            },
            (State::Erase(op), Response::Ack) => self.on_erase_ack(op),
            (State::Write(op), Response::Ack) => self.on_write_ack(op),
            (State::Write(_), Response::Nak) => Err(Error::VerificationFailed),
            (State::Reset { .. }, Response::Error(code)) => {
                debug!("Reboot command rejected (code {code}), rebooting with BREAK");
                self.transport
                    .set_break(true)?;
                self.timers
                    .start(TimerKind::Restart, self.timing.restart_delay);
                Ok(State::Reset { via_break: true })
            },
            (State::Reset { via_break }, response) => {
                trace!("Ignoring {response:?} during reboot");
                Ok(State::Reset { via_break })
            },
            (_, Response::Error(code)) => Err(Error::Bootloader(BootloaderError::from_code(code))),
            (state, response) => Err(Error::ReturnCodeError(format!(
                "unexpected {response:?} response in {} state",
                state.name()
            ))),
        }
    }

    fn on_timer(&mut self, state: State, kind: TimerKind) -> Result<State> {
        match (kind, state) {
            (TimerKind::Command, State::BootloaderVersion) if !self.version_resent => {
                self.version_resent = true;
                self.action("No response to version request, retrying");
                self.send(&FupFrame::version())?;
                Ok(State::BootloaderVersion)
            },
            (TimerKind::Command, state) => {
                self.action(format!(
                    "Failed to get a response to a command in {} state",
                    state.name()
                ));
                Err(Error::CommandTimeout)
            },
            (TimerKind::BreakPulse, State::RebootPulse) => {
                self.transport
                    .set_break(false)?;
                self.ready_checks = 0;
                self.timers
                    .start(TimerKind::DeviceReady, self.timing.device_ready_interval);
                Ok(State::RebootWait)
            },
            (TimerKind::DeviceReady, State::RebootWait) => self.poll_reboot_ready(),
            (TimerKind::DeviceReady, State::EnterBootloader) => self.poll_bootloader_ready(),
            (TimerKind::BaudChange, State::BaudChange) => self.change_baud(),
            (TimerKind::Restart, State::Reset { via_break }) => {
                if via_break {
                    self.transport
                        .set_break(false)?;
                }
                self.succeed(true);
                Ok(State::Idle)
            },
            (kind, state) => {
                debug!("Ignoring {kind:?} timer in {} state", state.name());
                Ok(state)
            },
        }
    }

    // ---- negotiation ----

    fn on_version(&mut self, version: String) -> Result<State> {
        self.timers
            .stop(TimerKind::Command);
        self.enhanced = !self
            .settings
            .disable_enhanced
            && version
                .as_bytes()
                .first()
                .is_some_and(|&b| b >= ENHANCED_VERSION_MARKER);
        self.action(format!(
            "Bootloader version: {version} ({})",
            if self.enhanced { "enhanced" } else { "legacy" }
        ));
        self.bootloader_version = Some(version);
        self.next_packet()
    }

    fn on_query(&mut self, step: QueryStep, value: u32, more: bool) -> Result<State> {
        debug!("Query {step:?}: {value} (more: {more})");
        match step {
            QueryStep::MaxBaud => self.action(format!("Maximum baud rate: {value}")),
            QueryStep::MaxEraseSize => self.action(format!("Maximum erase size: {value:#x}")),
            QueryStep::MaxChecksumSize => {
                self.action(format!("Maximum checksum size: {value:#x}"));
            },
            QueryStep::EraseSizeCount => {
                self.action(format!("Number of supported erase sizes: {value}"));
            },
            QueryStep::BaudRateCount => {
                self.action(format!("Number of supported baud rates: {value}"));
            },
            _ => {},
        }

        if let Some(next) = step.record(value, more, &mut self.caps) {
            self.send(&next.frame())?;
            return Ok(State::Query(next));
        }

        self.action(format!(
            "Supported erase sizes: {:#x?}, baud rates: {:?}",
            self.caps
                .erase_sizes,
            self.caps
                .baud_rates
        ));
        self.baud_index = select_baud(
            &self
                .caps
                .baud_rates,
            self.settings
                .exact_baud,
            self.settings
                .max_baud,
        )?;
        let step = SetStep::EraseLen;
        self.send(&step.frame(&self.caps, 0))?;
        Ok(State::Set(step))
    }

    fn on_set(&mut self, step: SetStep) -> Result<State> {
        match step.apply(&mut self.caps) {
            Some(SetStep::BaudRate) => {
                let Some(index) = self.baud_index else {
                    debug!("No baud rates offered, keeping {} baud", self.active_baud);
                    return self.after_negotiation();
                };
                self.send(&SetStep::BaudRate.frame(&self.caps, index))?;
                self.timers
                    .stop(TimerKind::Command);
                self.timers
                    .start(TimerKind::BaudChange, self.timing.baud_change_delay);
                Ok(State::BaudChange)
            },
            Some(next) => {
                self.send(&next.frame(&self.caps, 0))?;
                Ok(State::Set(next))
            },
            None => self.after_negotiation(),
        }
    }

    fn change_baud(&mut self) -> Result<State> {
        let index = self
            .baud_index
            .unwrap_or_default();
        let baud = self
            .caps
            .baud_at(index)
            .ok_or_else(|| Error::ReturnCodeError(format!("no baud rate at index {index}")))?;

        self.transport
            .close();
        self.transport
            .open(baud)
            .map_err(|e| {
                debug!("Reopen at {baud} failed: {e}");
                Error::BaudRateChangeFailed { baud }
            })?;
        self.active_baud = baud;
        self.action(format!("Baud rate changed to {baud}"));
        self.after_negotiation()
    }

    fn after_negotiation(&mut self) -> Result<State> {
        if self
            .settings
            .unlock_key
            .is_empty()
        {
            return self.next_packet();
        }
        let frame = FupFrame::unlock(&self.settings.unlock_key);
        self.send(&frame)?;
        Ok(State::Unlock)
    }

    // ---- replay ----

    fn reader(&mut self) -> Result<&mut UwfReader<BufReader<File>>> {
        self.reader
            .as_mut()
            .ok_or_else(|| Error::ReturnCodeError("upgrade file is not open".to_string()))
    }

    fn read_payload(&mut self, length: u32) -> Result<Vec<u8>> {
        let payload = self
            .reader()?
            .read(length as usize)?;
        if payload.len() != length as usize {
            return Err(Error::FilePacketLengthInvalid { length });
        }
        self.report_overall();
        Ok(payload)
    }

    /// Replay commands until one needs a response from the module.
    fn next_packet(&mut self) -> Result<State> {
        loop {
            let offset = self
                .reader()?
                .position();
            let Some(header) = self
                .reader()?
                .read_header()?
            else {
                return self.finish_replay();
            };
            if !header
                .id
                .accepts_length(header.length)
            {
                return Err(Error::ReturnCodeError(format!(
                    "{} command at offset {offset:#x} has invalid length {}",
                    header.id, header.length
                )));
            }

            match header.id {
                CommandId::TargetPlatform => {
                    let payload = self.read_payload(header.length)?;
                    let platform: [u8; 4] = payload
                        .as_slice()
                        .try_into()
                        .map_err(|_| Error::FilePacketLengthInvalid {
                            length: header.length,
                        })?;
                    self.action(format!(
                        "Target platform: {:#010x}",
                        u32::from_le_bytes(platform)
                    ));
                    self.send(&FupFrame::target_platform(platform))?;
                    return Ok(State::PlatformCommand);
                },
                CommandId::RegisterDevice => {
                    let device = RegisterDevice::parse(&self.read_payload(header.length)?)?;
                    self.action(format!(
                        "Register - Handle: {}, Base address: {:#x}, Banks: {}, Selection: {}",
                        device.handle,
                        device.base_address,
                        device.bank_count,
                        device.bank_selection
                    ));
                    self.registry
                        .register(device);
                },
                CommandId::SelectDevice => {
                    let select = SelectDevice::parse(&self.read_payload(header.length)?)?;
                    self.action(format!(
                        "Select - Flash: {}, Bank: {}",
                        select.flash_id, select.bank_id
                    ));
                    self.registry
                        .select(select)?;
                },
                CommandId::SectorMap => {
                    let groups = SectorGroup::parse_all(&self.read_payload(header.length)?)?;
                    for group in &groups {
                        self.action(format!(
                            "Sector map - Sectors: {}, Sector size: {:#x}",
                            group.sector_count, group.sector_size
                        ));
                    }
                    self.registry
                        .add_sector_map(&groups)?;
                },
                CommandId::EraseBlock => {
                    let erase = EraseBlock::parse(&self.read_payload(header.length)?)?;
                    let address = self
                        .registry
                        .base_address()?
                        .wrapping_add(erase.offset);
                    self.action(format!(
                        "Erase - Offset: {:#x}, Address: {address:#x}, Size: {:#x}",
                        erase.offset, erase.size
                    ));
                    if erase.size == 0 {
                        continue;
                    }
                    let mut op = EraseOperation::new(address, erase.size, &self.caps);
                    self.send_erase(&mut op)?;
                    return Ok(State::Erase(op));
                },
                CommandId::WriteBlock => {
                    let block =
                        WriteBlockHeader::parse(&self.read_payload(WRITE_BLOCK_HEADER_LEN)?)?;
                    let size = header.length - WRITE_BLOCK_HEADER_LEN;
                    let address = self
                        .registry
                        .base_address()?
                        .wrapping_add(block.offset);
                    self.action(format!(
                        "Write - Offset: {:#x}, Address: {address:#x}, Size: {size:#x}",
                        block.offset
                    ));
                    if size == 0 {
                        continue;
                    }
                    let op = WriteOperation::new(
                        address,
                        size,
                        self.settings
                            .verify,
                    );
                    return self.write_next_address(op);
                },
                CommandId::Unregister => {
                    let payload = self.read_payload(header.length)?;
                    let handle = payload
                        .first()
                        .copied()
                        .unwrap_or_default();
                    self.action(format!("Unregister - Handle: {handle}"));
                    self.registry
                        .unregister(handle);
                },
                CommandId::Query | CommandId::Unknown(_) => {
                    debug!("Skipping {} command at offset {offset:#x}", header.id);
                    self.reader()?
                        .seek(SeekFrom::Current(i64::from(header.length)))?;
                    self.report_overall();
                },
            }
        }
    }

    fn finish_replay(&mut self) -> Result<State> {
        self.timers
            .stop(TimerKind::Command);
        if !self
            .settings
            .reboot_after
        {
            self.succeed(false);
            return Ok(State::Idle);
        }

        self.action("Rebooting module");
        let via_break = if self.enhanced {
            self.transport
                .transmit(&FupFrame::reboot().build())?;
            false
        } else {
            self.transport
                .set_break(true)?;
            true
        };
        self.timers
            .start(TimerKind::Restart, self.timing.restart_delay);
        Ok(State::Reset { via_break })
    }

    fn send_erase(&mut self, op: &mut EraseOperation) -> Result<()> {
        let step = op.next_step(&self.caps, &self.registry)?;
        self.action(format!(
            "Erasing {:#x} - {:#x}",
            step.start,
            step.start
                .wrapping_add(step.len)
        ));
        self.send(&step.frame)?;
        self.report_task(op.progress(), false);
        Ok(())
    }

    fn on_erase_ack(&mut self, mut op: EraseOperation) -> Result<State> {
        if op.is_done() {
            return self.next_packet();
        }
        self.send_erase(&mut op)?;
        Ok(State::Erase(op))
    }

    fn write_next_address(&mut self, mut op: WriteOperation) -> Result<State> {
        match op.address(&self.caps) {
            Some(frame) => {
                self.send(&frame)?;
                Ok(State::Write(op))
            },
            None => self.next_packet(),
        }
    }

    fn on_write_ack(&mut self, mut op: WriteOperation) -> Result<State> {
        match op.step() {
            WriteStep::WriteData => {
                let len = op.chunk_len();
                let data = self
                    .reader()?
                    .read(len)?;
                if data.len() != len {
                    return Err(Error::FilePacketLengthInvalid { length: len as u32 });
                }
                let frame = op.data(&data, &self.caps);
                let timeout = self
                    .timing
                    .data_timeout(len, self.active_baud);
                self.send_with_timeout(&frame, timeout)?;
                self.report_task(op.progress(), true);
                Ok(State::Write(op))
            },
            WriteStep::VerifyData => match op.verify(&self.caps) {
                Some(frame) => {
                    self.send(&frame)?;
                    Ok(State::Write(op))
                },
                None => self.write_next_address(op),
            },
            WriteStep::WriteAddress => self.write_next_address(op),
            WriteStep::Finished => self.next_packet(),
        }
    }
}
