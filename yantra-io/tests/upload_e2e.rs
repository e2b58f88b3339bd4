//! Full firmware upload against a live bridge: telemetry is streaming,
//! the upload quiesces the link, resets the target over DTR, programs
//! every page with INSYNC/OK handshakes, and the bridge comes back with
//! the new firmware version visible shortly after completion.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use yantra_io::firmware::{self, UploadEvent, UploadPhase};
use yantra_io::link::{LinkConfig, SerialLink};
use yantra_io::mcu::McuBridge;
use yantra_io::transport::{MockTransport, Transport};

const INSYNC: u8 = 0x14;
const OK: u8 = 0x10;
const SIGNATURE: [u8; 3] = [0x1E, 0x95, 0x0F];

fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Scripted bootloader: once the DTR reset pulse has been seen, answer
/// every STK500 request written to the transport. Requests have fixed
/// lengths keyed by their first byte.
fn run_bootloader(transport: MockTransport, stop: Arc<std::sync::atomic::AtomicBool>) {
    use std::sync::atomic::Ordering;

    // Ignore the JSON traffic before the reset pulse; '0' bytes inside
    // JSON lines would otherwise look like GET_SYNC.
    let mut cursor = None;
    let mut pending: Vec<u8> = Vec::new();

    while !stop.load(Ordering::Acquire) {
        {
            let shared = transport.state();
            let state = shared.lock();
            if cursor.is_none() && state.dtr_levels.len() >= 4 {
                cursor = Some(state.written.len());
            }
            if let Some(ref mut pos) = cursor {
                if state.written.len() > *pos {
                    pending.extend_from_slice(&state.written[*pos..]);
                    *pos = state.written.len();
                }
            }
        }

        loop {
            let Some(&first) = pending.first() else { break };
            let needed = match first {
                0x30 | 0x50 | 0x51 | 0x75 => 2,            // sync / mode / sign
                0x55 => 4,                                  // load address
                0x64 => 4 + 128 + 1,                        // prog page
                _ => {
                    pending.remove(0); // stray byte, resync
                    continue;
                }
            };
            if pending.len() < needed {
                break;
            }
            let request: Vec<u8> = pending.drain(..needed).collect();
            match request[0] {
                0x75 => {
                    transport.feed(&[INSYNC, SIGNATURE[0], SIGNATURE[1], SIGNATURE[2], OK]);
                }
                // Leaving programming mode reboots into the application;
                // stop answering so the resumed JSON traffic is untouched.
                0x51 => {
                    transport.feed(&[INSYNC, OK]);
                    return;
                }
                _ => transport.feed(&[INSYNC, OK]),
            }
        }

        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn upload_while_streaming_then_resume() {
    let mock = MockTransport::new();
    let factory_mock = mock.clone();
    let link = SerialLink::start(
        Box::new(move || Ok(Box::new(factory_mock.clone()) as Box<dyn Transport>)),
        LinkConfig {
            reconnect_delay: Duration::from_millis(10),
            retry_interval: Duration::from_millis(10),
            max_retries: 3,
            quiescence: Duration::from_millis(10),
        },
    );
    let bridge = McuBridge::new(link);
    assert!(wait_until(2000, || bridge.is_connected()));

    // Telemetry is streaming when the upload starts.
    mock.feed(b"{\"t\":1,\"d\":42,\"fv\":\"1.0\"}\n");
    assert!(wait_until(2000, || bridge.last_distance_cm() == 42));
    assert_eq!(bridge.firmware_version().as_deref(), Some("1.0"));

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let bootloader_mock = mock.clone();
    let bootloader_stop = Arc::clone(&stop);
    let bootloader = thread::spawn(move || run_bootloader(bootloader_mock, bootloader_stop));

    // Two pages of data.
    let hex = concat!(
        ":0400000001020304F2\n",
        ":01010000AA54\n",
        ":00000001FF\n",
    );
    let (event_tx, event_rx) = unbounded::<UploadEvent>();
    firmware::upload(&bridge, hex, &event_tx).expect("upload should succeed");

    // Stream and watchdog were disabled before the reset pulse.
    let written = String::from_utf8_lossy(&mock.written()).into_owned();
    let quiesce_at = written.find(r#"{"D1":0,"N":103}"#).expect("stream off sent");
    assert!(written.contains(r#"{"D1":0,"N":102}"#));
    let dtr_count = mock.state().lock().dtr_levels.len();
    assert_eq!(dtr_count, 4);
    // The boot-time stream enable precedes the quiesce; the re-enable
    // from resume comes after it.
    let resume_at = written.rfind(r#"{"D1":200,"N":103}"#).expect("stream re-enabled");
    assert!(resume_at > quiesce_at);

    // Events ended with success and programming hit 100%.
    let events: Vec<UploadEvent> = event_rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(
        e,
        UploadEvent::Progress { phase: UploadPhase::Program, percent: 100 }
    )));
    match events.last().unwrap() {
        UploadEvent::Done { success, .. } => assert!(success),
        other => panic!("expected Done, got {:?}", other),
    }

    // The rebooted firmware answers the resume-time version query.
    mock.feed(b"{\"fv\":\"2.0\"}\n");
    assert!(wait_until(2000, || {
        bridge.firmware_version().as_deref() == Some("2.0")
    }));

    stop.store(true, std::sync::atomic::Ordering::Release);
    let _ = bootloader.join();
}
