//! STK500v1 page programming over a raw transport.
//!
//! The target bootloader speaks a tiny request/response protocol: every
//! request ends with `CRC_EOP` and every successful response is
//! `INSYNC OK` (with payload bytes between the two for reads). The
//! caller owns transport exclusivity; the serial link must be paused
//! before programming starts.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::transport::Transport;

use super::hex::{FirmwareImage, PAGE_SIZE};
use super::UploadPhase;

// Protocol bytes.
pub const GET_SYNC: u8 = 0x30;
pub const CRC_EOP: u8 = 0x20;
pub const INSYNC: u8 = 0x14;
pub const OK: u8 = 0x10;
pub const ENTER_PROGMODE: u8 = 0x50;
pub const LEAVE_PROGMODE: u8 = 0x51;
pub const LOAD_ADDRESS: u8 = 0x55;
pub const PROG_PAGE: u8 = 0x64;
pub const READ_SIGN: u8 = 0x75;

/// ATmega328P device signature.
pub const TARGET_SIGNATURE: [u8; 3] = [0x1E, 0x95, 0x0F];
/// Flash capacity implied by [`TARGET_SIGNATURE`].
pub const TARGET_FLASH_BYTES: usize = 32 * 1024;

/// Sync attempts before giving up on the bootloader.
pub const SYNC_ATTEMPTS: u32 = 10;
/// Per-byte read timeout.
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Shorter per-byte timeout during sync, keeping the whole sync phase
/// around 1.5s worst case.
const SYNC_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Pause between page programs.
const INTER_PAGE_DELAY: Duration = Duration::from_millis(5);
/// Bootloader settle time after the DTR reset pulse.
const RESET_SETTLE: Duration = Duration::from_millis(200);

/// Progress callback: `(phase, percent)`.
pub type ProgressFn<'a> = dyn FnMut(UploadPhase, u8) + 'a;

/// Pulse DTR to reset the target into its bootloader, then wait for it.
pub fn reset_target(transport: &mut dyn Transport) -> Result<()> {
    for (level, hold) in [(true, 50u64), (false, 50), (true, 50), (false, 0)] {
        transport.set_dtr(level)?;
        if hold > 0 {
            std::thread::sleep(Duration::from_millis(hold));
        }
    }
    std::thread::sleep(RESET_SETTLE);
    transport.clear_input()?;
    Ok(())
}

/// Establish protocol sync, draining garbage between attempts.
pub fn sync(transport: &mut dyn Transport) -> Result<()> {
    for attempt in 1..=SYNC_ATTEMPTS {
        transport.write(&[GET_SYNC, CRC_EOP])?;
        transport.flush()?;
        match expect_sync_ok_within(transport, &mut [], SYNC_READ_TIMEOUT) {
            Ok(()) => {
                log::debug!("bootloader in sync after {} attempt(s)", attempt);
                return Ok(());
            }
            Err(_) if attempt < SYNC_ATTEMPTS => {
                transport.clear_input()?;
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Protocol("bootloader never synced".into()))
}

/// Program every page of `image`, reporting progress through `progress`.
/// Percent steps below 2 are not re-reported.
pub fn program(
    transport: &mut dyn Transport,
    image: &FirmwareImage,
    progress: &mut ProgressFn<'_>,
) -> Result<()> {
    command(transport, &[ENTER_PROGMODE, CRC_EOP], 0)?;

    let signature = command(transport, &[READ_SIGN, CRC_EOP], 3)?;
    if signature != TARGET_SIGNATURE {
        return Err(Error::Protocol(format!(
            "unexpected device signature {:02X?} (wanted {:02X?})",
            signature, TARGET_SIGNATURE
        )));
    }

    let total = image.page_count().max(1);
    let mut last_percent = 0u8;
    progress(UploadPhase::Program, 0);

    for (index, page) in image.pages().iter().enumerate() {
        // Word address, little-endian.
        let word_address = (page.address / 2) as u16;
        let [addr_lo, addr_hi] = word_address.to_le_bytes();
        command(transport, &[LOAD_ADDRESS, addr_lo, addr_hi, CRC_EOP], 0)?;

        let mut request = Vec::with_capacity(PAGE_SIZE + 5);
        request.extend_from_slice(&[
            PROG_PAGE,
            (PAGE_SIZE >> 8) as u8,
            (PAGE_SIZE & 0xFF) as u8,
            b'F',
        ]);
        request.extend_from_slice(&page.data);
        request.push(CRC_EOP);
        command(transport, &request, 0)?;

        let percent = ((index + 1) * 100 / total) as u8;
        if percent >= last_percent + 2 || percent == 100 {
            last_percent = percent;
            progress(UploadPhase::Program, percent);
        }
        std::thread::sleep(INTER_PAGE_DELAY);
    }

    command(transport, &[LEAVE_PROGMODE, CRC_EOP], 0)?;
    Ok(())
}

/// Send a request and consume the INSYNC/payload/OK response.
fn command(transport: &mut dyn Transport, request: &[u8], payload_len: usize) -> Result<Vec<u8>> {
    transport.write(request)?;
    transport.flush()?;
    let mut payload = vec![0u8; payload_len];
    expect_sync_ok(transport, &mut payload)?;
    Ok(payload)
}

fn expect_sync_ok(transport: &mut dyn Transport, payload: &mut [u8]) -> Result<()> {
    expect_sync_ok_within(transport, payload, READ_TIMEOUT)
}

fn expect_sync_ok_within(
    transport: &mut dyn Transport,
    payload: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    let first = read_byte(transport, timeout)?;
    if first != INSYNC {
        return Err(Error::Protocol(format!(
            "expected INSYNC (0x{:02X}), got 0x{:02X}",
            INSYNC, first
        )));
    }
    for slot in payload.iter_mut() {
        *slot = read_byte(transport, timeout)?;
    }
    let last = read_byte(transport, timeout)?;
    if last != OK {
        return Err(Error::Protocol(format!(
            "expected OK (0x{:02X}), got 0x{:02X}",
            OK, last
        )));
    }
    Ok(())
}

fn read_byte(transport: &mut dyn Transport, timeout: Duration) -> Result<u8> {
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 1];
    loop {
        match transport.read(&mut buf)? {
            0 => {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout("bootloader response".into()));
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            _ => return Ok(buf[0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::hex::parse_hex;
    use crate::transport::MockTransport;

    fn ok_response() -> [u8; 2] {
        [INSYNC, OK]
    }

    #[test]
    fn test_reset_pulses_dtr() {
        let mock = MockTransport::new();
        let mut t = mock.clone();
        reset_target(&mut t).unwrap();
        assert_eq!(mock.state().lock().dtr_levels, vec![true, false, true, false]);
    }

    #[test]
    fn test_sync_first_try() {
        let mock = MockTransport::new();
        mock.feed(&ok_response());
        let mut t = mock.clone();
        sync(&mut t).unwrap();
        assert_eq!(mock.written(), vec![GET_SYNC, CRC_EOP]);
    }

    #[test]
    fn test_sync_retries_through_garbage() {
        let mock = MockTransport::new();
        // First attempt sees garbage and clears the queue; feed the good
        // response during the inter-attempt backoff.
        mock.feed(&[0x42, 0x42]);
        let feeder = mock.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            feeder.feed(&[INSYNC, OK]);
        });
        let mut t = mock.clone();
        sync(&mut t).unwrap();
        handle.join().unwrap();
        // At least two GET_SYNC requests went out.
        assert!(mock.written().len() >= 4);
    }

    #[test]
    fn test_program_single_page() {
        let image = parse_hex(":0400000001020304F2\n:00000001FF\n", TARGET_FLASH_BYTES).unwrap();

        let mock = MockTransport::new();
        // enter progmode, signature, load address, prog page, leave.
        mock.feed(&ok_response());
        mock.feed(&[INSYNC, TARGET_SIGNATURE[0], TARGET_SIGNATURE[1], TARGET_SIGNATURE[2], OK]);
        mock.feed(&ok_response());
        mock.feed(&ok_response());
        mock.feed(&ok_response());

        let mut percents = Vec::new();
        let mut t = mock.clone();
        program(&mut t, &image, &mut |phase, percent| {
            assert_eq!(phase, UploadPhase::Program);
            percents.push(percent);
        })
        .unwrap();

        assert_eq!(*percents.last().unwrap(), 100);

        let written = mock.written();
        // Request stream: [0x50 0x20] [0x75 0x20] [0x55 00 00 0x20]
        // [0x64 0x00 0x80 'F' <128 bytes> 0x20] [0x51 0x20]
        assert_eq!(&written[0..2], &[ENTER_PROGMODE, CRC_EOP]);
        assert_eq!(&written[2..4], &[READ_SIGN, CRC_EOP]);
        assert_eq!(&written[4..8], &[LOAD_ADDRESS, 0x00, 0x00, CRC_EOP]);
        assert_eq!(&written[8..12], &[PROG_PAGE, 0x00, 0x80, b'F']);
        assert_eq!(&written[12..16], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(written[12 + PAGE_SIZE], CRC_EOP);
        assert_eq!(
            &written[13 + PAGE_SIZE..15 + PAGE_SIZE],
            &[LEAVE_PROGMODE, CRC_EOP]
        );
    }

    #[test]
    fn test_wrong_signature_aborts() {
        let image = parse_hex(":0400000001020304F2\n:00000001FF\n", TARGET_FLASH_BYTES).unwrap();

        let mock = MockTransport::new();
        mock.feed(&ok_response());
        mock.feed(&[INSYNC, 0x1E, 0x95, 0x16, OK]); // ATmega328PB, not P
        let mut t = mock.clone();
        let err = program(&mut t, &image, &mut |_, _| {}).unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn test_insync_mismatch_aborts() {
        let image = parse_hex(":0400000001020304F2\n:00000001FF\n", TARGET_FLASH_BYTES).unwrap();
        let mock = MockTransport::new();
        mock.feed(&[0x00, OK]);
        let mut t = mock.clone();
        let err = program(&mut t, &image, &mut |_, _| {}).unwrap_err();
        assert!(err.to_string().contains("INSYNC"));
    }

    #[test]
    fn test_word_address_encoding() {
        // Page at byte address 256 → word address 128 → lo=0x80 hi=0x00.
        let mut text = String::from(":01010000AA54\n:00000001FF\n");
        text.push('\n');
        let image = parse_hex(&text, TARGET_FLASH_BYTES).unwrap();
        assert_eq!(image.pages()[0].address, 256);

        let mock = MockTransport::new();
        mock.feed(&ok_response());
        mock.feed(&[INSYNC, TARGET_SIGNATURE[0], TARGET_SIGNATURE[1], TARGET_SIGNATURE[2], OK]);
        mock.feed(&ok_response());
        mock.feed(&ok_response());
        mock.feed(&ok_response());

        let mut t = mock.clone();
        program(&mut t, &image, &mut |_, _| {}).unwrap();

        let written = mock.written();
        assert_eq!(&written[4..8], &[LOAD_ADDRESS, 0x80, 0x00, CRC_EOP]);
    }
}
