use {
    super::{
        testing::{SimModule, fast_timing, firmware_file},
        *,
    },
    crate::{
        config::UpdateSettings,
        entry::{BridgeBoard, EntryMethod, testing::ScriptedBridge},
        error::{BootloaderError, Error},
        image::uwf::testing::UwfBuilder,
    },
    std::{
        path::Path,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    },
};

const BASE: u32 = 0x0001_0000;

fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i * 7 + 3) as u8)
        .collect()
}

fn legacy_image(data: &[u8]) -> Vec<u8> {
    UwfBuilder::new()
        .target_platform(0x1234_5678)
        .register(0, BASE, 1, 0x40000)
        .select(0, 0)
        .sector_map(&[(4, 0x1000), (2, 0x10000)])
        .erase(0, 0x3500)
        .write(0, data)
        .unregister(0)
        .build()
}

fn enhanced_image(data: &[u8]) -> Vec<u8> {
    UwfBuilder::new()
        .target_platform(0x1234_5678)
        .register(0, 0, 1, 0x100000)
        .select(0, 0)
        .erase(0, 0x10500)
        .write(0x100, data)
        .build()
}

fn settings(path: &Path) -> UpdateSettings {
    UpdateSettings::new("/dev/ttyUSB0", path)
}

fn run_session(
    sim: SimModule,
    settings: UpdateSettings,
) -> (Engine<SimModule>, Vec<SessionEvent>, Result<UpdateOutcome>) {
    run_engine(
        Engine::new(sim).with_timing(fast_timing()),
        settings,
    )
}

fn run_engine(
    mut engine: Engine<SimModule>,
    settings: UpdateSettings,
) -> (Engine<SimModule>, Vec<SessionEvent>, Result<UpdateOutcome>) {
    // RUST_LOG=trace shows the frames of a failing session
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
    let mut events = Vec::new();
    let result = engine.run(settings, |e| events.push(e.clone()));
    (engine, events, result)
}

fn overall_values(events: &[SessionEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress {
                overall: Some(o), ..
            } => Some(*o),
            _ => None,
        })
        .collect()
}

fn finished(events: &[SessionEvent]) -> Option<bool> {
    events
        .iter()
        .find_map(|e| match e {
            SessionEvent::Finished { success, .. } => Some(*success),
            _ => None,
        })
}

#[test]
fn test_legacy_update() {
    let data = pattern(600);
    let (_dir, path) = firmware_file(&legacy_image(&data));

    let (engine, events, result) = run_session(SimModule::legacy(), settings(&path));
    let outcome = result.unwrap();
    let sim = engine.transport();

    assert!(outcome.rebooted);
    assert_eq!(outcome.bootloader_version.as_deref(), Some("3.1.0"));
    assert_eq!(outcome.baud_rate, 115200);
    assert!(!engine.is_update_in_progress());

    assert_eq!(sim.at_fup, 1);
    assert_eq!(sim.sent(b'V').len(), 1);
    assert_eq!(sim.platform, Some([0x78, 0x56, 0x34, 0x12]));
    assert!(sim.sent(b'o').is_empty());
    assert!(sim.sent(b's').is_empty());

    assert_eq!(
        sim.erased,
        vec![
            (BASE, None),
            (BASE + 0x1000, None),
            (BASE + 0x2000, None),
            (BASE + 0x3000, None),
        ]
    );
    assert_eq!(sim.sent(b'w').len(), 3);
    assert_eq!(sim.sent(b'd').len(), 3);
    assert_eq!(sim.verifies, vec![(BASE, 600)]);
    assert_eq!(sim.read_memory(BASE, 600), data);

    assert_eq!(sim.breaks, vec![true, false]);
    assert_eq!(sim.reboots, 0);

    assert_eq!(events.first(), Some(&SessionEvent::Active(true)));
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Finished { success: true, .. })
    ));
    let overall = overall_values(&events);
    assert_eq!(
        overall
            .iter()
            .filter(|&&o| o == 100)
            .count(),
        1
    );
    assert!(
        overall
            .windows(2)
            .all(|w| w[0] <= w[1])
    );
}

#[test]
fn test_enhanced_update() {
    let data = pattern(3000);
    let (_dir, path) = firmware_file(&enhanced_image(&data));

    let (engine, events, result) = run_session(SimModule::enhanced(), settings(&path));
    let outcome = result.unwrap();
    let sim = engine.transport();

    assert_eq!(outcome.baud_rate, 921600);
    assert_eq!(sim.opened_at, vec![115200, 921600]);
    assert_eq!(sim.sent(b'?').len(), 1);
    assert_eq!(sim.sent(b'o').len(), 15);
    assert_eq!(
        sim.settings
            .iter()
            .map(|(&k, &v)| (k, v))
            .collect::<Vec<_>>(),
        vec![(0x0000, 1), (0x0002, 2), (0x0003, 4), (0x0004, 4), (0x0005, 3)]
    );
    let set_options: Vec<u8> = sim
        .sent(b's')
        .iter()
        .map(|f| f[1])
        .collect();
    assert_eq!(set_options, vec![0, 2, 3, 4, 5]);

    let caps = engine.capabilities();
    assert_eq!(caps.erase_sizes, vec![0x1000, 0x10000]);
    assert_eq!(caps.baud_rates, vec![115200, 460800, 921600]);
    assert_eq!(caps.write_size, 1024);

    assert_eq!(sim.erased, vec![(0, Some(1)), (0x10000, Some(0))]);
    let writes = sim.sent(b'w');
    assert_eq!(writes.len(), 3);
    assert!(
        writes
            .iter()
            .all(|f| f.len() == 7)
    );
    assert_eq!(sim.verifies, vec![(0x100, 3000)]);
    assert_eq!(sim.read_memory(0x100, 3000), data);

    assert_eq!(sim.reboots, 1);
    assert!(sim.breaks.is_empty());
    assert!(
        events
            .iter()
            .any(|e| *e == SessionEvent::Action("Baud rate changed to 921600".to_string()))
    );
}

#[test]
fn test_max_baud_picks_fastest_below_limit() {
    let (_dir, path) = firmware_file(&enhanced_image(&pattern(64)));
    let mut settings = settings(&path);
    settings.max_baud = Some(500000);

    let (engine, _, result) = run_session(SimModule::enhanced(), settings);
    assert_eq!(result.unwrap().baud_rate, 460800);
    assert_eq!(engine.transport().settings.get(&0x0005), Some(&2));
}

#[test]
fn test_max_baud_below_every_rate_fails() {
    let (_dir, path) = firmware_file(&enhanced_image(&pattern(64)));
    let mut settings = settings(&path);
    settings.max_baud = Some(5000);

    let (engine, events, result) = run_session(SimModule::enhanced(), settings);
    assert!(matches!(result, Err(Error::MaxBaudUnsuitable { max: 5000 })));
    assert_eq!(finished(&events), Some(false));
    assert!(
        engine
            .transport()
            .sent(b's')
            .is_empty()
    );
}

#[test]
fn test_exact_baud() {
    let (_dir, path) = firmware_file(&enhanced_image(&pattern(64)));
    let mut exact = settings(&path);
    exact.exact_baud = Some(115200);
    exact.max_baud = Some(9600);
    let (_, _, result) = run_session(SimModule::enhanced(), exact);
    assert_eq!(result.unwrap().baud_rate, 115200);

    let mut missing = settings(&path);
    missing.exact_baud = Some(57600);
    let (_, _, result) = run_session(SimModule::enhanced(), missing);
    assert!(matches!(result, Err(Error::ExactBaudNotFound { baud: 57600 })));
}

#[test]
fn test_version_request_retried_once() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut timing = fast_timing();
    timing.command_timeout = Duration::from_millis(30);

    let mut sim = SimModule::legacy();
    sim.ignore_versions = 1;
    let engine = Engine::new(sim).with_timing(timing);
    let (engine, _, result) = run_engine(engine, settings(&path));
    assert!(result.is_ok());
    assert_eq!(engine.transport().sent(b'V').len(), 2);

    let mut sim = SimModule::legacy();
    sim.ignore_versions = 2;
    let engine = Engine::new(sim).with_timing(timing);
    let (engine, events, result) = run_engine(engine, settings(&path));
    assert!(matches!(result, Err(Error::CommandTimeout)));
    assert_eq!(engine.transport().sent(b'V').len(), 2);
    assert_eq!(finished(&events), Some(false));
}

#[test]
fn test_unlock_without_key_on_module_continues() {
    let (_dir, path) = firmware_file(&enhanced_image(&pattern(64)));
    let mut settings = settings(&path);
    settings.unlock_key = vec![0xA5; 64];

    let mut sim = SimModule::enhanced();
    sim.unlock_error = Some(BootloaderError::WormNotSet.code());
    let (engine, _, result) = run_session(sim, settings);
    assert!(result.is_ok());
    assert_eq!(engine.transport().unlock_key, Some(vec![0xA5; 64]));
}

#[test]
fn test_unlock_rejected_fails() {
    let (_dir, path) = firmware_file(&enhanced_image(&pattern(64)));
    let mut settings = settings(&path);
    settings.unlock_key = vec![0xA5; 64];

    let mut sim = SimModule::enhanced();
    sim.unlock_error = Some(BootloaderError::InvalidKey.code());
    let (engine, _, result) = run_session(sim, settings);
    assert!(matches!(
        result,
        Err(Error::Bootloader(BootloaderError::InvalidKey))
    ));
    assert!(
        engine
            .transport()
            .erased
            .is_empty()
    );
}

#[test]
fn test_verify_nak_fails() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(64)));
    let mut sim = SimModule::legacy();
    sim.nak_verify = true;

    let (_, events, result) = run_session(sim, settings(&path));
    assert!(matches!(result, Err(Error::VerificationFailed)));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Error {
            module: crate::error::Module::Update,
            ..
        }
    )));
}

#[test]
fn test_verify_disabled_sends_no_verify() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(300)));
    let mut settings = settings(&path);
    settings.verify = false;
    let mut sim = SimModule::legacy();
    sim.nak_verify = true;

    let (engine, _, result) = run_session(sim, settings);
    assert!(result.is_ok());
    assert!(
        engine
            .transport()
            .verifies
            .is_empty()
    );
}

#[test]
fn test_platform_rejected() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut sim = SimModule::legacy();
    sim.platform_error = Some(BootloaderError::Platform.code());

    let (engine, _, result) = run_session(sim, settings(&path));
    assert!(matches!(
        result,
        Err(Error::Bootloader(BootloaderError::Platform))
    ));
    assert!(
        engine
            .transport()
            .erased
            .is_empty()
    );
}

#[test]
fn test_unplug_during_write() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut sim = SimModule::legacy();
    sim.unplug_on = Some(b'w');

    let (engine, events, result) = run_session(sim, settings(&path));
    assert!(matches!(result, Err(Error::DeviceUnplugged)));
    assert!(!engine.is_update_in_progress());
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Finished { .. }))
            .count(),
        1
    );
}

#[test]
fn test_cts_never_asserted() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut sim = SimModule::legacy();
    sim.never_ready = true;

    let (engine, _, result) = run_session(sim, settings(&path));
    assert!(matches!(result, Err(Error::CtsTimeout)));
    assert_eq!(engine.transport().ready_polls, 21);
    assert!(
        engine
            .transport()
            .sent(b'V')
            .is_empty()
    );
}

#[test]
fn test_late_cts_is_waited_for() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut sim = SimModule::legacy();
    sim.not_ready_polls = 5;

    let (engine, _, result) = run_session(sim, settings(&path));
    assert!(result.is_ok());
    assert_eq!(engine.transport().ready_polls, 6);
}

#[test]
fn test_leave_in_bootloader() {
    let (_dir, path) = firmware_file(&enhanced_image(&pattern(64)));
    let mut settings = settings(&path);
    settings.reboot_after = false;

    let (engine, events, result) = run_session(SimModule::enhanced(), settings);
    let outcome = result.unwrap();
    assert!(!outcome.rebooted);
    assert_eq!(engine.transport().reboots, 0);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Action(text) if text.ends_with("(module left in bootloader mode at 921600 baud)")
    )));
}

#[test]
fn test_reboot_before_update() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut settings = settings(&path);
    settings.reboot_before = true;
    settings.bootloader_baud = 9600;

    let (engine, _, result) = run_session(SimModule::legacy(), settings);
    assert!(result.is_ok());
    let sim = engine.transport();
    assert_eq!(sim.dtr, vec![true]);
    assert_eq!(sim.breaks, vec![true, false, true, false]);
    assert_eq!(sim.opened_at[0], 9600);
    assert_eq!(sim.opened_at[1], 115200);
}

#[test]
fn test_application_baud_switches_to_bootloader_baud() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut settings = settings(&path);
    settings.application_baud = 9600;

    let (engine, _, result) = run_session(SimModule::legacy(), settings);
    assert_eq!(result.unwrap().baud_rate, 115200);
    assert_eq!(engine.transport().opened_at, vec![9600, 115200]);
}

#[test]
fn test_invalid_unlock_key_fails_before_port_open() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut settings = settings(&path);
    settings.unlock_key = vec![1; 10];

    let (engine, events, result) = run_session(SimModule::legacy(), settings);
    assert!(matches!(result, Err(Error::UnlockKeyInvalidSize { len: 10 })));
    assert!(
        engine
            .transport()
            .opened_at
            .is_empty()
    );
    assert!(events.contains(&SessionEvent::Action("Firmware upgrade failed.".to_string())));
    assert_eq!(events.last(), Some(&SessionEvent::Finished {
        success: false,
        elapsed_ms: 0
    }));
}

#[test]
fn test_missing_firmware_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir
        .path()
        .join("missing.uwf");

    let (_, _, result) = run_session(SimModule::legacy(), settings(&path));
    assert!(matches!(result, Err(Error::FileNotFound(p)) if p == path));
}

#[test]
fn test_sector_map_required_for_legacy_erase() {
    let image = UwfBuilder::new()
        .target_platform(1)
        .register(0, BASE, 1, 0x40000)
        .erase(0, 0x1000)
        .build();
    let (_dir, path) = firmware_file(&image);

    let (engine, _, result) = run_session(SimModule::legacy(), settings(&path));
    assert!(matches!(
        result,
        Err(Error::SectorMappingNotFound { address: BASE })
    ));
    assert!(
        engine
            .transport()
            .erased
            .is_empty()
    );
}

#[test]
fn test_query_command_is_skipped() {
    let image = UwfBuilder::new()
        .target_platform(1)
        .raw(b'Q', &[1, 2, 3])
        .register(0, 0, 1, 0x40000)
        .write(0, &[1, 2, 3, 4])
        .build();
    let (_dir, path) = firmware_file(&image);
    // Validation rejects `Q`; replay alone seeks over it.
    let mut settings = settings(&path);
    settings.validate = false;

    let (engine, _, result) = run_session(SimModule::legacy(), settings);
    assert!(result.is_ok());
    assert_eq!(engine.transport().read_memory(0, 4), vec![1, 2, 3, 4]);
}

fn assert_untouched(sim: &SimModule) {
    assert!(sim.opened_at.is_empty());
    assert!(sim.frames.is_empty());
    assert_eq!(sim.at_fup, 0);
    assert!(sim.breaks.is_empty());
    assert!(sim.dtr.is_empty());
}

#[test]
fn test_invalid_file_fails_before_opening_port() {
    let image = UwfBuilder::new()
        .target_platform(1)
        .register(0, 0, 1, 0x40000)
        .raw(b'E', &[0; 4])
        .build();
    let (_dir, path) = firmware_file(&image);

    let (engine, events, result) = run_session(SimModule::legacy(), settings(&path));
    assert!(matches!(result, Err(Error::FileNotValid(_))));
    assert_eq!(finished(&events), Some(false));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Error {
            module: crate::error::Module::Uwf,
            ..
        }
    )));
    assert_untouched(engine.transport());
}

#[test]
fn test_unsupported_command_fails_before_opening_port() {
    let image = UwfBuilder::new()
        .target_platform(1)
        .raw(b'Q', &[1, 2, 3])
        .write(0, &[1, 2, 3, 4])
        .build();
    let (_dir, path) = firmware_file(&image);

    let (engine, _, result) = run_session(SimModule::legacy(), settings(&path));
    assert!(matches!(result, Err(Error::FileCommandInvalid(_))));
    assert_untouched(engine.transport());
}

#[test]
fn test_bridge_entry_renames_port() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut settings = settings(&path);
    settings.entry_method = EntryMethod::Bl654Usb;

    let requests = Arc::new(Mutex::new(Vec::new()));
    let asked = Arc::new(AtomicUsize::new(0));
    let asked_in = Arc::clone(&asked);
    let engine = Engine::new(SimModule::legacy())
        .with_timing(fast_timing())
        .with_bridge(Box::new(ScriptedBridge {
            requests: Arc::clone(&requests),
            rename_to: Some("/dev/ttyUSB3".to_string()),
            fail: false,
        }))
        .with_consent(move |_method: EntryMethod| -> crate::error::Result<()> {
            asked_in.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    let (engine, events, result) = run_engine(engine, settings);
    let outcome = result.unwrap();
    assert_eq!(outcome.port_name, "/dev/ttyUSB3");
    assert_eq!(asked.load(Ordering::SeqCst), 1);
    assert!(events.contains(&SessionEvent::PortRenamed("/dev/ttyUSB3".to_string())));
    assert_eq!(engine.transport().at_fup, 1);

    let requests = requests
        .lock()
        .unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].board, BridgeBoard::Bl654Usb);
    assert_eq!(requests[0].port_name, "/dev/ttyUSB0");
}

#[test]
fn test_bridge_entry_declined() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut settings = settings(&path);
    settings.entry_method = EntryMethod::Pinnacle100;

    let requests = Arc::new(Mutex::new(Vec::new()));
    let engine = Engine::new(SimModule::legacy())
        .with_timing(fast_timing())
        .with_bridge(Box::new(ScriptedBridge {
            requests: Arc::clone(&requests),
            rename_to: None,
            fail: false,
        }))
        .with_consent(|_method: EntryMethod| -> crate::error::Result<()> {
            Err(Error::EntryCancelled)
        });

    let (_, _, result) = run_engine(engine, settings);
    assert!(matches!(result, Err(Error::EntryCancelled)));
    assert!(
        requests
            .lock()
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_bridge_entry_failure() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut settings = settings(&path);
    settings.entry_method = EntryMethod::Pinnacle100;
    settings.skip_entry_confirmation = true;

    let engine = Engine::new(SimModule::legacy())
        .with_timing(fast_timing())
        .with_bridge(Box::new(ScriptedBridge {
            requests: Arc::new(Mutex::new(Vec::new())),
            rename_to: None,
            fail: true,
        }));

    let (engine, events, result) = run_engine(engine, settings);
    match result {
        Err(Error::EntranceFailed(inner)) => {
            assert!(matches!(*inner, Error::BridgeNotFound { .. }));
        },
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Error {
            module: crate::error::Module::BootloaderEntrance,
            ..
        }
    )));
    assert!(
        engine
            .transport()
            .opened_at
            .is_empty()
    );
}

#[test]
fn test_end_session_is_idempotent() {
    let (_dir, path) = firmware_file(&legacy_image(&pattern(16)));
    let mut sim = SimModule::legacy();
    sim.never_ready = true;
    let mut engine = Engine::new(sim).with_timing(fast_timing());

    engine
        .start(settings(&path))
        .unwrap();
    assert!(engine.is_update_in_progress());
    assert!(matches!(
        engine.start(settings(&path)),
        Err(Error::SessionActive)
    ));

    engine.end_session();
    engine.end_session();
    assert!(!engine.is_update_in_progress());
    assert!(!engine.transport().is_open());
    assert!(engine.next_deadline().is_none());

    let events: Vec<_> = std::iter::from_fn(|| engine.next_event()).collect();
    assert_eq!(events.first(), Some(&SessionEvent::Active(true)));
    assert_eq!(events.last(), Some(&SessionEvent::Active(false)));
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == SessionEvent::Active(false))
            .count(),
        1
    );
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, SessionEvent::Finished { .. }))
    );
    assert!(
        engine
            .start(settings(&path))
            .is_ok()
    );
}
