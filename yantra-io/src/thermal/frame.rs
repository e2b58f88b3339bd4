//! Frame extraction from the imager's raw bulk stream.
//!
//! Wire layout per frame, all little-endian:
//!
//! ```text
//! magic EF BE 00 00
//! header (24 bytes): u32 frame_size | u32 thermal_size | u32 jpeg_size
//!                    | u32 status_size | 8 reserved bytes
//! payload (frame_size bytes): thermal section | visual JPEG | status JSON
//! ```
//!
//! The thermal section starts 4 bytes into its region; pixel rows are
//! strided: 40 pixels, a 4-byte gap, then 40 more pixels. The status JSON
//! carries the flat-field-correction state; the frame right after an FFC
//! completes is discarded (the sensor re-normalises mid-stream and that
//! frame is garbage).

use serde_json::Value;

/// Pixel dimensions of the supported sensor.
pub const FRAME_WIDTH: usize = 80;
pub const FRAME_HEIGHT: usize = 60;

const MAGIC: [u8; 4] = [0xEF, 0xBE, 0x00, 0x00];
const HEADER_LEN: usize = 24;
/// Bytes per pixel row: 40 pixels, the 4-byte mid-row gap, 40 pixels.
const ROW_BYTES: usize = FRAME_WIDTH * 2 + 4;
/// Thermal section: 4 lead-in bytes plus the strided pixel block.
const THERMAL_SECTION_LEN: usize = 4 + FRAME_HEIGHT * ROW_BYTES;

/// Accumulation buffer bound.
const BUFFER_CAPACITY: usize = 1024 * 1024;

/// One parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalFrame {
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<u16>,
    pub min: u32,
    pub max: u32,
    pub jpeg: Option<Vec<u8>>,
    pub status: Option<Value>,
}

impl ThermalFrame {
    /// Encode for the wire hub's binary endpoint:
    /// `u16 w | u16 h | u32 min | u32 max | u16[] pixels`, little-endian.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.pixels.len() * 2);
        out.extend_from_slice(&self.width.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.min.to_le_bytes());
        out.extend_from_slice(&self.max.to_le_bytes());
        for px in &self.pixels {
            out.extend_from_slice(&px.to_le_bytes());
        }
        out
    }
}

/// Incremental parser over the raw byte stream.
#[derive(Default)]
pub struct FrameParser {
    buf: Vec<u8>,
    ffc_in_progress: bool,
    suppress_next: bool,
    skipped_frames: u64,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    /// Feed raw bytes, returning every complete frame they finish.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ThermalFrame> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > BUFFER_CAPACITY {
            let excess = self.buf.len() - BUFFER_CAPACITY;
            self.buf.drain(..excess);
        }

        let mut frames = Vec::new();
        loop {
            let Some(pos) = find_magic(&self.buf) else {
                // No frame boundary anywhere in the buffer.
                self.buf.clear();
                break;
            };
            if pos > 0 {
                self.buf.drain(..pos);
            }

            if self.buf.len() < MAGIC.len() + HEADER_LEN {
                break; // header not complete yet
            }

            let frame_size = read_u32(&self.buf, 4) as usize;
            let total = MAGIC.len() + HEADER_LEN + frame_size;
            if total > BUFFER_CAPACITY {
                // Nonsense size; step past this magic and resync.
                log::warn!("thermal frame declares {} bytes, resyncing", frame_size);
                self.buf.drain(..MAGIC.len());
                continue;
            }
            if self.buf.len() < total {
                break; // frame not complete yet
            }

            if let Some(frame) = self.decode_frame(total) {
                frames.push(frame);
            }
            self.buf.drain(..total);
        }
        frames
    }

    fn decode_frame(&mut self, total: usize) -> Option<ThermalFrame> {
        let data = &self.buf[..total];
        let thermal_size = read_u32(data, 8) as usize;
        let jpeg_size = read_u32(data, 12) as usize;
        let status_size = read_u32(data, 16) as usize;
        let payload = &data[MAGIC.len() + HEADER_LEN..];

        if thermal_size + jpeg_size + status_size > payload.len() {
            log::warn!("thermal frame sections exceed payload, skipping");
            self.skipped_frames += 1;
            return None;
        }

        // Single supported sensor layout; anything else would decode into
        // garbage pixels.
        if thermal_size != THERMAL_SECTION_LEN {
            log::warn!(
                "unsupported thermal section size {} (expected {}), skipping",
                thermal_size,
                THERMAL_SECTION_LEN
            );
            self.skipped_frames += 1;
            return None;
        }

        let thermal = &payload[..thermal_size];
        let jpeg = if jpeg_size > 0 {
            Some(payload[thermal_size..thermal_size + jpeg_size].to_vec())
        } else {
            None
        };
        let status = if status_size > 0 {
            let raw = &payload[thermal_size + jpeg_size..thermal_size + jpeg_size + status_size];
            serde_json::from_slice::<Value>(raw).ok()
        } else {
            None
        };

        // FFC tracking: the frame on which correction finishes is bad.
        if let Some(ffc) = status
            .as_ref()
            .and_then(|s| s.get("ffc_in_progress"))
            .and_then(Value::as_bool)
        {
            if self.ffc_in_progress && !ffc {
                self.suppress_next = true;
            }
            self.ffc_in_progress = ffc;
        }
        if self.suppress_next {
            self.suppress_next = false;
            self.skipped_frames += 1;
            log::debug!("frame after FFC suppressed");
            return None;
        }

        // Pixels: 16-bit LE, rows of 40 px | 4-byte gap | 40 px, starting
        // 4 bytes into the section.
        let mut pixels = Vec::with_capacity(FRAME_WIDTH * FRAME_HEIGHT);
        let mut min = u32::MAX;
        let mut max = 0u32;
        for row in 0..FRAME_HEIGHT {
            let row_start = 4 + row * ROW_BYTES;
            for half in 0..2 {
                // The second half sits past 40 pixels and the 4-byte gap.
                let start = row_start + half * (FRAME_WIDTH + 4);
                for i in 0..FRAME_WIDTH / 2 {
                    let offset = start + i * 2;
                    let px = u16::from_le_bytes([thermal[offset], thermal[offset + 1]]);
                    min = min.min(px as u32);
                    max = max.max(px as u32);
                    pixels.push(px);
                }
            }
        }

        Some(ThermalFrame {
            width: FRAME_WIDTH as u16,
            height: FRAME_HEIGHT as u16,
            pixels,
            min,
            max,
            jpeg,
            status,
        })
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|w| w == MAGIC)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a frame whose pixel at (row, col) is `row * 100 + col`.
    fn build_frame(jpeg: &[u8], status: Option<&str>) -> Vec<u8> {
        let mut thermal = vec![0u8; THERMAL_SECTION_LEN];
        for row in 0..FRAME_HEIGHT {
            let row_start = 4 + row * ROW_BYTES;
            for half in 0..2 {
                let start = row_start + half * (FRAME_WIDTH + 4);
                for i in 0..FRAME_WIDTH / 2 {
                    let col = half * FRAME_WIDTH / 2 + i;
                    let px = (row * 100 + col) as u16;
                    thermal[start + i * 2..start + i * 2 + 2].copy_from_slice(&px.to_le_bytes());
                }
            }
        }

        let status_bytes = status.map(str::as_bytes).unwrap_or(&[]);
        let frame_size = thermal.len() + jpeg.len() + status_bytes.len();

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&(frame_size as u32).to_le_bytes());
        out.extend_from_slice(&(thermal.len() as u32).to_le_bytes());
        out.extend_from_slice(&(jpeg.len() as u32).to_le_bytes());
        out.extend_from_slice(&(status_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&thermal);
        out.extend_from_slice(jpeg);
        out.extend_from_slice(status_bytes);
        out
    }

    #[test]
    fn test_single_frame_parses() {
        let mut parser = FrameParser::new();
        let frames = parser.push(&build_frame(&[], None));
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.width, 80);
        assert_eq!(frame.height, 60);
        assert_eq!(frame.pixels.len(), 4800);
        // Strided halves land in row-major order.
        assert_eq!(frame.pixels[0], 0);
        assert_eq!(frame.pixels[79], 79);
        assert_eq!(frame.pixels[80], 100);
        assert_eq!(frame.min, 0);
        assert_eq!(frame.max, (59 * 100 + 79) as u32);
    }

    #[test]
    fn test_frame_split_across_pushes() {
        let mut parser = FrameParser::new();
        let bytes = build_frame(&[1, 2, 3], None);
        let (a, b) = bytes.split_at(1000);
        assert!(parser.push(a).is_empty());
        let frames = parser.push(b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].jpeg.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_garbage_before_magic_skipped() {
        let mut parser = FrameParser::new();
        let mut bytes = vec![0xAAu8; 500];
        bytes.extend_from_slice(&build_frame(&[], None));
        assert_eq!(parser.push(&bytes).len(), 1);
    }

    #[test]
    fn test_pure_garbage_drops_buffer() {
        let mut parser = FrameParser::new();
        assert!(parser.push(&[0x11u8; 4096]).is_empty());
        // Buffer was dropped, so a clean frame right after still parses.
        assert_eq!(parser.push(&build_frame(&[], None)).len(), 1);
    }

    #[test]
    fn test_two_frames_in_one_push() {
        let mut parser = FrameParser::new();
        let mut bytes = build_frame(&[], None);
        bytes.extend_from_slice(&build_frame(&[], None));
        assert_eq!(parser.push(&bytes).len(), 2);
    }

    #[test]
    fn test_oversize_declared_frame_resyncs() {
        let mut parser = FrameParser::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&(u32::MAX).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 20]);
        bytes.extend_from_slice(&build_frame(&[], None));
        let frames = parser.push(&bytes);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_wrong_thermal_size_skipped() {
        let mut parser = FrameParser::new();
        // Hand-build a frame with a truncated thermal section.
        let thermal = vec![0u8; 100];
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&(thermal.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(thermal.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&thermal);

        assert!(parser.push(&bytes).is_empty());
        assert_eq!(parser.skipped_frames(), 1);
    }

    #[test]
    fn test_ffc_completion_suppresses_one_frame() {
        let mut parser = FrameParser::new();

        let during = build_frame(&[], Some(r#"{"ffc_in_progress":true}"#));
        let after = build_frame(&[], Some(r#"{"ffc_in_progress":false}"#));

        // Correction running: frames still usable.
        assert_eq!(parser.push(&during).len(), 1);
        // First frame after completion is discarded.
        assert!(parser.push(&after).is_empty());
        // The next one flows again.
        assert_eq!(parser.push(&after).len(), 1);
    }

    #[test]
    fn test_wire_encoding() {
        let mut parser = FrameParser::new();
        let frame = parser.push(&build_frame(&[], None)).remove(0);
        let wire = frame.to_wire_bytes();
        assert_eq!(wire.len(), 12 + 4800 * 2);
        assert_eq!(u16::from_le_bytes([wire[0], wire[1]]), 80);
        assert_eq!(u16::from_le_bytes([wire[2], wire[3]]), 60);
        assert_eq!(
            u32::from_le_bytes([wire[4], wire[5], wire[6], wire[7]]),
            frame.min
        );
        assert_eq!(
            u32::from_le_bytes([wire[8], wire[9], wire[10], wire[11]]),
            frame.max
        );
        assert_eq!(u16::from_le_bytes([wire[12], wire[13]]), frame.pixels[0]);
    }

    #[test]
    fn test_status_json_exposed() {
        let mut parser = FrameParser::new();
        let frames = parser.push(&build_frame(&[], Some(r#"{"battery":88}"#)));
        assert_eq!(frames[0].status.as_ref().unwrap()["battery"], 88);
    }
}
