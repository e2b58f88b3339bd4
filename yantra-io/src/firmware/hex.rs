//! Intel-HEX parsing into a page-aligned flash image.
//!
//! Record format: `:llaaaatt<data>cc` where `ll` is the data length,
//! `aaaa` the 16-bit address, `tt` the record type and `cc` a checksum
//! chosen so the low byte of the sum of every record byte (checksum
//! included) is zero.
//!
//! Handled types: 00 data, 01 EOF, 02 extended segment address
//! (base = value << 4), 04 extended linear address (base = value << 16).
//! Types 03 and 05 carry start addresses irrelevant to flashing and are
//! ignored.

use crate::error::{Error, Result};

/// Flash page size of the target AVR family.
pub const PAGE_SIZE: usize = 128;

/// One non-empty flash page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePage {
    /// Byte address of the page start in flash.
    pub address: u32,
    pub data: [u8; PAGE_SIZE],
}

/// A parsed firmware payload, padded to page boundaries with pages whose
/// bytes are all 0xFF omitted (erased flash already reads 0xFF).
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pages: Vec<FirmwarePage>,
    /// Bytes covered by records (before padding).
    pub data_len: usize,
}

impl FirmwareImage {
    pub fn pages(&self) -> &[FirmwarePage] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Parse an Intel-HEX payload into a flash image.
///
/// `flash_capacity` bounds the address space; a record past it is an
/// error rather than a silent truncation.
pub fn parse_hex(text: &str, flash_capacity: usize) -> Result<FirmwareImage> {
    let mut flash = vec![0xFFu8; flash_capacity];
    let mut max_address = 0usize;
    let mut base: u32 = 0;
    let mut saw_any_data = false;

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let record = parse_record(line, line_no + 1)?;

        match record.record_type {
            0x00 => {
                let start = base + record.address as u32;
                let end = start as usize + record.data.len();
                if end > flash_capacity {
                    return Err(Error::HexParse(format!(
                        "line {}: record at 0x{:05X} exceeds {} byte flash",
                        line_no + 1,
                        start,
                        flash_capacity
                    )));
                }
                flash[start as usize..end].copy_from_slice(&record.data);
                max_address = max_address.max(end);
                saw_any_data = true;
            }
            0x01 => break,
            0x02 => base = segment_base(&record, line_no + 1)? << 4,
            0x04 => base = segment_base(&record, line_no + 1)? << 16,
            0x03 | 0x05 => {}
            other => {
                return Err(Error::HexParse(format!(
                    "line {}: unsupported record type 0x{:02X}",
                    line_no + 1,
                    other
                )));
            }
        }
    }

    if !saw_any_data {
        return Err(Error::HexParse("no data records".into()));
    }

    // Page-align the used span and drop pages that are entirely 0xFF.
    let padded_len = max_address.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    let mut pages = Vec::new();
    for page_start in (0..padded_len).step_by(PAGE_SIZE) {
        let chunk = &flash[page_start..page_start + PAGE_SIZE];
        if chunk.iter().all(|&b| b == 0xFF) {
            continue;
        }
        let mut data = [0xFFu8; PAGE_SIZE];
        data.copy_from_slice(chunk);
        pages.push(FirmwarePage {
            address: page_start as u32,
            data,
        });
    }

    Ok(FirmwareImage {
        pages,
        data_len: max_address,
    })
}

struct HexRecord {
    address: u16,
    record_type: u8,
    data: Vec<u8>,
}

fn parse_record(line: &str, line_no: usize) -> Result<HexRecord> {
    let body = line.strip_prefix(':').ok_or_else(|| {
        Error::HexParse(format!("line {}: record must start with ':'", line_no))
    })?;

    if body.len() < 10 || body.len() % 2 != 0 {
        return Err(Error::HexParse(format!(
            "line {}: malformed record length",
            line_no
        )));
    }

    let bytes: Vec<u8> = (0..body.len() / 2)
        .map(|i| u8::from_str_radix(&body[i * 2..i * 2 + 2], 16))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| Error::HexParse(format!("line {}: non-hex characters", line_no)))?;

    let data_len = bytes[0] as usize;
    if bytes.len() != data_len + 5 {
        return Err(Error::HexParse(format!(
            "line {}: length field says {} data bytes, record has {}",
            line_no,
            data_len,
            bytes.len().saturating_sub(5)
        )));
    }

    // Low byte of the sum of every record byte, checksum included, must
    // be zero.
    let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        return Err(Error::HexParse(format!(
            "line {}: checksum mismatch",
            line_no
        )));
    }

    Ok(HexRecord {
        address: u16::from_be_bytes([bytes[1], bytes[2]]),
        record_type: bytes[3],
        data: bytes[4..4 + data_len].to_vec(),
    })
}

fn segment_base(record: &HexRecord, line_no: usize) -> Result<u32> {
    if record.data.len() != 2 {
        return Err(Error::HexParse(format!(
            "line {}: extended address record needs 2 data bytes",
            line_no
        )));
    }
    Ok(u16::from_be_bytes([record.data[0], record.data[1]]) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLASH_32K: usize = 32 * 1024;

    #[test]
    fn test_minimal_image() {
        let image = parse_hex(":0400000001020304F2\n:00000001FF\n", FLASH_32K).unwrap();
        assert_eq!(image.page_count(), 1);
        let page = &image.pages()[0];
        assert_eq!(page.address, 0);
        assert_eq!(&page.data[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert!(page.data[4..].iter().all(|&b| b == 0xFF));
        assert_eq!(image.data_len, 4);
    }

    #[test]
    fn test_corrupt_checksum_rejected() {
        let err = parse_hex(":0400000001020304F0\n:00000001FF\n", FLASH_32K).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_all_ff_pages_omitted() {
        // Data at page 0 and page 2; page 1 untouched (all 0xFF).
        let mut text = String::from(":0400000001020304F2\n");
        // One byte at address 0x100 (page 2): ll=01 aaaa=0100 tt=00 dd=AA
        // checksum = -(01+01+00+00+AA) = 0x54
        text.push_str(":01010000AA54\n:00000001FF\n");
        let image = parse_hex(&text, FLASH_32K).unwrap();
        assert_eq!(image.page_count(), 2);
        assert_eq!(image.pages()[0].address, 0);
        assert_eq!(image.pages()[1].address, 256);
    }

    #[test]
    fn test_extended_linear_address() {
        // Base 0x10000 would exceed a 32K part.
        let text = ":020000040001F9\n:0400000001020304F2\n:00000001FF\n";
        let err = parse_hex(text, FLASH_32K).unwrap_err();
        assert!(err.to_string().contains("exceeds"));

        // Same records fit a larger capacity and land at the offset base.
        let image = parse_hex(text, 128 * 1024).unwrap();
        assert_eq!(image.pages()[0].address, 0x10000);
    }

    #[test]
    fn test_extended_segment_address() {
        // Segment 0x1000 << 4 = 0x10000.
        let text = ":020000021000EC\n:0400000001020304F2\n:00000001FF\n";
        let image = parse_hex(text, 128 * 1024).unwrap();
        assert_eq!(image.pages()[0].address, 0x10000);
    }

    #[test]
    fn test_start_address_records_ignored() {
        // Type 05 (start linear address) between data records.
        let text = ":04000005000000C037\n:0400000001020304F2\n:00000001FF\n";
        let image = parse_hex(text, FLASH_32K).unwrap();
        assert_eq!(image.page_count(), 1);
    }

    #[test]
    fn test_missing_colon_rejected() {
        let err = parse_hex("0400000001020304F2\n", FLASH_32K).unwrap_err();
        assert!(err.to_string().contains("':'"));
    }

    #[test]
    fn test_truncated_record_rejected() {
        assert!(parse_hex(":04\n", FLASH_32K).is_err());
    }

    #[test]
    fn test_empty_input_rejected() {
        assert!(parse_hex("", FLASH_32K).is_err());
        assert!(parse_hex(":00000001FF\n", FLASH_32K).is_err());
    }

    #[test]
    fn test_multi_page_image() {
        // 256 bytes of 0x42 starting at 0, written as 16-byte records.
        let mut text = String::new();
        for i in 0..16u32 {
            let addr = i * 16;
            let mut record = vec![0x10u8, (addr >> 8) as u8, (addr & 0xFF) as u8, 0x00];
            record.extend(std::iter::repeat(0x42).take(16));
            let sum: u8 = record.iter().fold(0u8, |a, &b| a.wrapping_add(b));
            let checksum = (!sum).wrapping_add(1);
            text.push(':');
            for b in &record {
                text.push_str(&format!("{:02X}", b));
            }
            text.push_str(&format!("{:02X}\n", checksum));
        }
        text.push_str(":00000001FF\n");

        let image = parse_hex(&text, FLASH_32K).unwrap();
        assert_eq!(image.page_count(), 2);
        assert_eq!(image.data_len, 256);
        assert!(image.pages().iter().all(|p| p.data.iter().all(|&b| b == 0x42)));
    }
}
