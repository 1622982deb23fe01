//! Firmware images in the keyboard's hex text format.
//!
//! An image is the ordered list of records read from a hex file. Records are
//! kept in file order; extended segment records shift the addresses of the
//! data records that follow them, and the end-of-file record stops parsing.
//!
//! ```text
//! :LLAAAATTDD...DDCC
//!  |  |   | |      +- check byte, two's complement of the sum of all other bytes
//!  |  |   | +-------- payload, LL bytes
//!  |  |   +---------- record type (00 data, 01 end of file, 04 segment)
//!  |  +-------------- 16-bit address, big-endian
//!  +----------------- payload length
//! ```

use std::fmt;
use std::str::FromStr;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::checksum::{check_byte, hex_text_sum, text_sum, TEXT_CHECKSUM_MASK};
use crate::error::{KbdbootError, Result};

/// Type field of a hex record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Payload bytes to be placed at the record address.
    Data = 0x00,
    /// Last record of the file.
    EndOfFile = 0x01,
    /// Two-byte segment value, shifted left by 8, added to later addresses.
    ExtendedSegmentAddress = 0x04,
}
impl TryFrom<u8> for RecordType {
    type Error = ();

    fn try_from(x: u8) -> std::result::Result<Self, Self::Error> {
        match x {
            x if x == Self::Data as u8 => Ok(Self::Data),
            x if x == Self::EndOfFile as u8 => Ok(Self::EndOfFile),
            x if x == Self::ExtendedSegmentAddress as u8 => Ok(Self::ExtendedSegmentAddress),
            _ => Err(()),
        }
    }
}

/// One line of a hex image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    kind: RecordType,
    address: u16,
    data: Vec<u8>,
    /// Absolute address of `data[0]`, with the active segment applied.
    base: u32,
}

impl Record {
    /// Creates a record outside of any segment.
    ///
    /// # Panics
    ///
    /// If `data` is longer than 255 bytes.
    pub fn new(kind: RecordType, address: u16, data: Vec<u8>) -> Self {
        assert!(data.len() <= 0xFF, "record payload too long: {}", data.len());
        Record {
            kind,
            address,
            data,
            base: address.into(),
        }
    }

    /// Record type from the type field.
    pub fn kind(&self) -> RecordType {
        self.kind
    }

    /// Address field as stored on the line.
    pub fn address(&self) -> u16 {
        self.address
    }

    /// Absolute address of the first payload byte.
    pub fn absolute_address(&self) -> u32 {
        self.base
    }

    /// Declared payload length.
    pub fn len(&self) -> u8 {
        // bounded by the constructor and by parsing
        self.data.len() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload bytes, for in-place edits. The check byte follows the payload
    /// automatically.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whether the absolute address falls in this record's payload.
    pub fn contains(&self, address: u32) -> bool {
        self.kind == RecordType::Data
            && address >= self.base
            && address - self.base < self.data.len() as u32
    }

    /// Segment offset introduced by an extended segment address record.
    pub fn segment_offset(&self) -> Option<u32> {
        match (self.kind, self.data.as_slice()) {
            (RecordType::ExtendedSegmentAddress, &[hi, lo]) => {
                Some(u32::from(u16::from_be_bytes([hi, lo])) << 8)
            }
            _ => None,
        }
    }

    fn header(&self) -> [u8; 4] {
        let [hi, lo] = self.address.to_be_bytes();
        [self.len(), hi, lo, self.kind as u8]
    }

    /// The check byte for the record's current contents.
    pub fn checksum(&self) -> u8 {
        check_byte(&self.header())
            .wrapping_sub(self.data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)))
    }

    /// Sum of the characters of the record's text line, without the line
    /// terminator.
    pub fn text_sum(&self) -> u32 {
        u32::from(b':')
            + self.header().iter().map(|&b| hex_text_sum(b)).sum::<u32>()
            + self.data.iter().map(|&b| hex_text_sum(b)).sum::<u32>()
            + hex_text_sum(self.checksum())
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":")?;
        for b in self.header().iter().chain(&self.data) {
            write!(f, "{b:02X}")?;
        }
        write!(f, "{:02X}", self.checksum())
    }
}

/// Address range covered by the low sum and where the sum is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LowSumLayout {
    /// First summed address.
    pub begin: u32,
    /// One past the last summed address.
    pub end: u32,
    /// Address of the stored sum, two bytes little-endian.
    pub stored_at: u32,
}

impl Default for LowSumLayout {
    fn default() -> Self {
        LowSumLayout {
            begin: 0x0080,
            end: 0x1300,
            stored_at: 0x1300,
        }
    }
}

impl LowSumLayout {
    /// Checks that the summed range is non-empty and that the stored sum lies
    /// outside it.
    pub fn validate(&self) -> Result<()> {
        if self.begin >= self.end {
            return Err(KbdbootError::Config(format!(
                "low sum range {:#06x}..{:#06x} is empty",
                self.begin, self.end
            )));
        }
        let Some(stored_end) = self.stored_at.checked_add(2) else {
            return Err(KbdbootError::Config(format!(
                "low sum stored at {:#06x} runs past the address space",
                self.stored_at
            )));
        };
        let stored = self.stored_at..stored_end;
        if stored.start < self.end && self.begin < stored.end {
            return Err(KbdbootError::Config(format!(
                "low sum stored at {:#06x} lies inside the summed range",
                self.stored_at
            )));
        }
        Ok(())
    }
}

/// A parsed firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexImage {
    records: Vec<Record>,
    layout: LowSumLayout,
    crlf: bool,
}

fn parse_error(line: usize, message: impl Into<String>) -> KbdbootError {
    KbdbootError::Parse {
        line,
        message: message.into(),
    }
}

fn decode_hex(line: usize, digits: &str) -> Result<Vec<u8>> {
    if digits.len() % 2 != 0 {
        return Err(parse_error(line, "odd number of hex digits"));
    }
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    parse_error(
                        line,
                        format!("expected hex digit, got {:?}", String::from_utf8_lossy(pair)),
                    )
                })
        })
        .collect()
}

impl HexImage {
    /// Parses hex text. Any malformed line or check byte mismatch fails the
    /// whole parse.
    pub fn parse(text: &str) -> Result<Self> {
        let mut records = Vec::new();
        let mut segment = 0u32;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }

            let digits = raw
                .strip_prefix(':')
                .ok_or_else(|| parse_error(line, format!("expected ':', got {raw:?}")))?;
            let bytes = decode_hex(line, digits)?;
            if bytes.len() < 5 {
                return Err(parse_error(line, "record too short"));
            }

            let len = usize::from(bytes[0]);
            if bytes.len() != len + 5 {
                return Err(parse_error(
                    line,
                    format!("record length {len} does not match {} payload bytes", bytes.len() - 5),
                ));
            }

            let (body, check) = bytes.split_at(bytes.len() - 1);
            let expected = check_byte(body);
            if check[0] != expected {
                return Err(KbdbootError::RecordChecksum {
                    line,
                    expected,
                    actual: check[0],
                });
            }

            let kind = RecordType::try_from(bytes[3])
                .map_err(|_| parse_error(line, format!("unknown record type {:#04x}", bytes[3])))?;
            let address = u16::from_be_bytes([bytes[1], bytes[2]]);
            let mut record = Record::new(kind, address, body[4..].to_vec());

            match kind {
                RecordType::Data => {
                    record.base = segment + u32::from(address);
                    records.push(record);
                }
                RecordType::ExtendedSegmentAddress => {
                    segment = record
                        .segment_offset()
                        .ok_or_else(|| parse_error(line, "segment record must carry two bytes"))?;
                    trace!("new segment starting at {segment:#06x}");
                    records.push(record);
                }
                RecordType::EndOfFile => {
                    records.push(record);
                    break;
                }
            }
        }

        Ok(HexImage {
            records,
            layout: LowSumLayout::default(),
            crlf: text.contains("\r\n"),
        })
    }

    /// Builds an image from records, resolving segment addresses.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut segment = 0u32;
        let records = records
            .into_iter()
            .map(|mut record| {
                if let Some(offset) = record.segment_offset() {
                    segment = offset;
                } else if record.kind == RecordType::Data {
                    record.base = segment + u32::from(record.address);
                }
                record
            })
            .collect();

        HexImage {
            records,
            layout: LowSumLayout::default(),
            crlf: false,
        }
    }

    /// Replaces the low sum layout the image is checked against.
    pub fn with_layout(mut self, layout: LowSumLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn layout(&self) -> LowSumLayout {
        self.layout
    }

    pub fn begin_summed(&self) -> u32 {
        self.layout.begin
    }

    pub fn end_summed(&self) -> u32 {
        self.layout.end
    }

    /// All records in file order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    /// Mutable record by index. The check byte follows any payload edit.
    pub fn record_mut(&mut self, index: usize) -> Option<&mut Record> {
        self.records.get_mut(index)
    }

    /// Index of the data record whose payload starts exactly at `address`.
    pub fn record_at(&self, address: u32) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.kind == RecordType::Data && r.base == address)
    }

    /// Resolves an absolute address to `(record index, payload offset)`.
    pub fn locate(&self, address: u32) -> Option<(usize, usize)> {
        self.records
            .iter()
            .position(|r| r.contains(address))
            .map(|index| (index, (address - self.records[index].base) as usize))
    }

    /// Byte at an absolute address, from the record that holds it.
    pub fn get(&self, address: u32) -> Result<u8> {
        let (index, offset) = self
            .locate(address)
            .ok_or(KbdbootError::AddressNotMapped(address))?;
        Ok(self.records[index].data[offset])
    }

    /// Overwrites the byte at an absolute address.
    pub fn set(&mut self, address: u32, value: u8) -> Result<()> {
        let (index, offset) = self
            .locate(address)
            .ok_or(KbdbootError::AddressNotMapped(address))?;
        self.records[index].data[offset] = value;
        Ok(())
    }

    /// Sum of all data bytes in the low sum range, modulo 65536.
    pub fn sum_low_blocks(&self) -> u16 {
        let LowSumLayout { begin, end, .. } = self.layout;
        self.records
            .iter()
            .filter(|r| r.kind == RecordType::Data)
            .flat_map(|r| (r.base..).zip(&r.data))
            .filter(|(address, _)| (begin..end).contains(address))
            .fold(0u16, |acc, (_, &b)| acc.wrapping_add(b.into()))
    }

    /// The low sum as stored in the image.
    pub fn stored_low_sum(&self) -> Result<u16> {
        let at = self.layout.stored_at;
        let next = at.checked_add(1).ok_or(KbdbootError::AddressNotMapped(at))?;
        Ok(u16::from_le_bytes([self.get(at)?, self.get(next)?]))
    }

    /// Recomputes the low sum and stores it, returning the new value.
    pub fn update_low_sum(&mut self) -> Result<u16> {
        let sum = self.sum_low_blocks();
        let [lo, hi] = sum.to_le_bytes();
        let at = self.layout.stored_at;
        let next = at.checked_add(1).ok_or(KbdbootError::AddressNotMapped(at))?;
        self.set(at, lo)?;
        self.set(next, hi)?;
        Ok(sum)
    }

    /// Line terminator used for serialization, taken from the parsed text.
    pub fn line_ending(&self) -> &'static str {
        if self.crlf {
            "\r\n"
        } else {
            "\n"
        }
    }

    /// Sum of every character of the serialized image, low 24 bits.
    pub fn text_checksum(&self) -> u32 {
        let terminator = text_sum(self.line_ending().as_bytes());
        self.records
            .iter()
            .fold(0u32, |acc, r| acc.wrapping_add(r.text_sum()).wrapping_add(terminator))
            & TEXT_CHECKSUM_MASK
    }
}

impl FromStr for HexImage {
    type Err = KbdbootError;

    fn from_str(s: &str) -> Result<Self> {
        HexImage::parse(s)
    }
}

impl fmt::Display for HexImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terminator = self.line_ending();
        for record in &self.records {
            write!(f, "{record}{terminator}")?;
        }
        Ok(())
    }
}
