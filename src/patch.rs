//! Line-oriented firmware patches.
//!
//! A patch script has one directive per line, `;` starting a comment:
//!
//! ```text
//! 0a3c: keys leftctrl a b 29   ; key names, or raw scan codes in hex
//! 0b00: db 12 34 ff            ; raw bytes in hex
//! 1fc0: checksum               ; restore the file checksum using this record
//! ```
//!
//! Every line is applied independently. A failing line is reported with its
//! position and the remaining lines are still tried, but a script with any
//! failure must not produce output.

use std::fmt;

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::checksum::{hex_text_sum, HEX_TEXT_SUM_MAX, HEX_TEXT_SUM_MIN};
use crate::error::{KbdbootError, Result};
use crate::image::HexImage;
use crate::keys::KeyTable;
use crate::profile::DeviceProfile;
use crate::MAX_COMPENSATION_BYTES;

/// What went wrong on a patch line.
#[derive(Error, Debug)]
pub enum DirectiveErrorKind {
    #[error("expected address:")]
    ExpectedAddress,
    #[error("expected directive")]
    ExpectedDirective,
    #[error("unrecognized directive {0}")]
    UnknownDirective(String),
    #[error("unknown key code {0}")]
    UnknownKey(String),
    #[error("expected hex byte, got {0}")]
    BadByte(String),
    #[error(transparent)]
    Image(#[from] KbdbootError),
}

/// A failed patch line.
#[derive(Error, Debug)]
pub struct DirectiveError {
    /// 1-based line number.
    pub line: usize,
    /// 1-based column of the offending token.
    pub column: usize,
    pub kind: DirectiveErrorKind,
}
impl fmt::Display for DirectiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: error: {}", self.line, self.column, self.kind)
    }
}

/// What a [`Patcher`] accepts and which checksums it keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOptions {
    /// Accept the `checksum` directive.
    pub checksum_directive: bool,
    /// Recompute the stored low sum once every line has been applied.
    pub update_low_sum: bool,
    /// Text checksum the patched file must have.
    pub image_checksum: u32,
    /// Trailing bytes of the checksum record the search may change.
    pub compensation_bytes: usize,
}
impl PatchOptions {
    /// Options for `profile`, with the `checksum` directive enabled and the
    /// low sum left alone.
    pub fn from_profile(profile: &DeviceProfile) -> Self {
        PatchOptions {
            checksum_directive: true,
            update_low_sum: false,
            image_checksum: profile.image_checksum,
            compensation_bytes: profile.compensation_bytes,
        }
    }
}
impl Default for PatchOptions {
    fn default() -> Self {
        Self::from_profile(&DeviceProfile::default())
    }
}

/// Outcome of applying a script.
#[derive(Debug, Default)]
pub struct PatchReport {
    pub errors: Vec<DirectiveError>,
    /// Lines that carried a directive and applied cleanly.
    pub applied: usize,
    /// Address of the last `checksum` directive that ran.
    pub checksum_address: Option<u32>,
}
impl PatchReport {
    /// Whether every line applied.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Splits text into whitespace separated tokens with their 1-based columns.
fn tokens(text: &str, column_offset: usize) -> impl Iterator<Item = (usize, &str)> {
    let mut rest = text;
    let mut consumed = 0;
    std::iter::from_fn(move || {
        let start = rest.find(|c: char| !c.is_whitespace())?;
        let len = rest[start..]
            .find(char::is_whitespace)
            .unwrap_or(rest.len() - start);
        let token = &rest[start..start + len];
        let column = column_offset + consumed + start + 1;
        consumed += start + len;
        rest = &rest[start + len..];
        Some((column, token))
    })
}

fn parse_address(text: &str) -> Option<u32> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// Applies patch scripts to images.
#[derive(Debug, Clone)]
pub struct Patcher {
    keys: &'static KeyTable,
    options: PatchOptions,
}
impl Patcher {
    pub fn new(options: PatchOptions) -> Self {
        Patcher {
            keys: KeyTable::standard(),
            options,
        }
    }

    pub fn options(&self) -> &PatchOptions {
        &self.options
    }

    /// Applies every line of `script`, collecting the failures.
    pub fn apply(&self, image: &mut HexImage, script: &str) -> PatchReport {
        let mut report = PatchReport::default();

        for (index, line) in script.lines().enumerate() {
            match self.apply_line(image, index + 1, line) {
                Ok(None) => {}
                Ok(Some(directive)) => {
                    report.applied += 1;
                    if let Directive::Checksum(address) = directive {
                        report.checksum_address = Some(address);
                    }
                }
                Err(e) => report.errors.push(e),
            }
        }

        report
    }

    /// Final touches after a clean run: refresh the low sum if asked to,
    /// then restore the file checksum again if the script restored it.
    pub fn finish(&self, image: &mut HexImage, report: &PatchReport) -> Result<()> {
        if !report.is_ok() {
            return Err(KbdbootError::PatchFailed(report.errors.len()));
        }

        if self.options.update_low_sum {
            let sum = image.update_low_sum()?;
            info!("Updated low sum to {sum:#06x}");

            if let Some(address) = report.checksum_address {
                self.restore_checksum(image, address)?;
            }
        }
        Ok(())
    }

    fn restore_checksum(&self, image: &mut HexImage, address: u32) -> Result<bool> {
        restore_checksum(
            image,
            address,
            self.options.image_checksum,
            self.options.compensation_bytes,
        )
    }

    /// Applies line number `line` of a script. Returns the directive that
    /// ran, or `None` for blank and comment lines.
    pub fn apply_line(
        &self,
        image: &mut HexImage,
        line: usize,
        text: &str,
    ) -> std::result::Result<Option<Directive>, DirectiveError> {
        self.run_line(image, text)
            .map_err(|(column, kind)| DirectiveError { line, column, kind })
    }

    fn run_line(
        &self,
        image: &mut HexImage,
        line: &str,
    ) -> std::result::Result<Option<Directive>, (usize, DirectiveErrorKind)> {
        let content = match line.find(';') {
            Some(comment) => &line[..comment],
            None => line,
        };
        if content.trim().is_empty() {
            return Ok(None);
        }

        let first_column = content.len() - content.trim_start().len() + 1;
        let (address_text, rest) = content
            .split_once(':')
            .ok_or((first_column, DirectiveErrorKind::ExpectedAddress))?;
        let mut address = parse_address(address_text)
            .ok_or((first_column, DirectiveErrorKind::ExpectedAddress))?;

        let mut args = tokens(rest, address_text.len() + 1);
        let (column, directive) = args
            .next()
            .ok_or((content.len() + 1, DirectiveErrorKind::ExpectedDirective))?;

        match directive {
            "keys" => {
                for (column, token) in args {
                    let code = self
                        .keys
                        .resolve_token(token)
                        .ok_or_else(|| (column, DirectiveErrorKind::UnknownKey(token.to_owned())))?;
                    trace!("{address:04x}: {token} = {code:#04x}");
                    image.set(address, code).map_err(|e| (column, DirectiveErrorKind::Image(e)))?;
                    address += 1;
                }
                Ok(Some(Directive::Keys))
            }
            "db" => {
                for (column, token) in args {
                    let value = u32::from_str_radix(token, 16)
                        .ok()
                        .filter(|_| !token.starts_with('+'))
                        .ok_or_else(|| (column, DirectiveErrorKind::BadByte(token.to_owned())))?;
                    if value > 0xFF {
                        warn!("Byte literal {token} too large");
                    }
                    image
                        .set(address, value as u8)
                        .map_err(|e| (column, DirectiveErrorKind::Image(e)))?;
                    address += 1;
                }
                Ok(Some(Directive::Bytes))
            }
            "checksum" if self.options.checksum_directive => {
                if let Some((_, extra)) = args.next() {
                    warn!("Ignoring arguments after checksum directive: {extra}");
                }
                self.restore_checksum(image, address)
                    .map_err(|e| (column, DirectiveErrorKind::Image(e)))?;
                Ok(Some(Directive::Checksum(address)))
            }
            other => Err((column, DirectiveErrorKind::UnknownDirective(other.to_owned()))),
        }
    }
}

/// A directive that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Keys,
    Bytes,
    /// Checksum restored using the record at this address.
    Checksum(u32),
}

/// Restores the whole-file text checksum to `target` by rewriting the data
/// record at `address`.
///
/// The record is zeroed and its last `compensation` bytes are chosen so the
/// record's own text sum makes up the difference. Of all the byte values that
/// work, the lowest (compared left to right) is used. Returns `false` when
/// the checksum was already right, and fails without searching when no value
/// of those bytes can reach the target.
pub fn restore_checksum(
    image: &mut HexImage,
    address: u32,
    target: u32,
    compensation: usize,
) -> Result<bool> {
    let diff = i64::from(image.text_checksum()) - i64::from(target);
    if diff == 0 {
        return Ok(false);
    }
    info!("Fixing checksum (difference {diff})");

    if !(1..=MAX_COMPENSATION_BYTES).contains(&compensation) {
        return Err(KbdbootError::Config(format!(
            "compensation bytes must be between 1 and {MAX_COMPENSATION_BYTES}"
        )));
    }

    let record = image
        .record_at(address)
        .and_then(|index| image.record_mut(index))
        .ok_or(KbdbootError::MissingChecksumRecord(address))?;
    if record.is_empty() {
        return Err(KbdbootError::ChecksumRestoration(address));
    }

    let record_target = i64::from(record.text_sum()) - diff;

    record.data_mut().fill(0);
    let start = record.data().len().saturating_sub(compensation);
    let window = record.data().len() - start;

    // text sum of everything but the window and the check byte, each of
    // which adds at least HEX_TEXT_SUM_MIN
    let fixed = record.text_sum()
        - hex_text_sum(record.checksum())
        - window as u32 * HEX_TEXT_SUM_MIN;
    let floor = i64::from(fixed) + (window as i64 + 1) * i64::from(HEX_TEXT_SUM_MIN);
    let excess = usize::try_from(record_target - floor)
        .map_err(|_| KbdbootError::ChecksumRestoration(address))?;

    // with the window zeroed, the byte sum of the rest is minus the check byte
    let byte_sum = record.checksum().wrapping_neg();
    let bytes = WindowSums::new(window)
        .solve(byte_sum, excess)
        .ok_or(KbdbootError::ChecksumRestoration(address))?;
    record.data_mut()[start..].copy_from_slice(&bytes);

    debug!("Checksum record now {record} (compensation bytes {bytes:02x?})");
    Ok(true)
}

/// Spread of [`hex_text_sum`] over all byte values.
const HEX_TEXT_SPAN: usize = (HEX_TEXT_SUM_MAX - HEX_TEXT_SUM_MIN) as usize;
const SUM_SET_WORDS: usize = (MAX_COMPENSATION_BYTES + 1) * HEX_TEXT_SPAN / 64 + 1;

/// How far a byte's hex text sum lies above [`HEX_TEXT_SUM_MIN`].
fn excess_of(byte: u8) -> usize {
    (hex_text_sum(byte) - HEX_TEXT_SUM_MIN) as usize
}

/// Bit set of text sum excesses.
#[derive(Clone, Copy, Default)]
struct SumSet([u64; SUM_SET_WORDS]);

impl SumSet {
    fn single(excess: usize) -> Self {
        let mut set = SumSet::default();
        set.0[excess / 64] |= 1 << (excess % 64);
        set
    }

    fn contains(&self, excess: usize) -> bool {
        excess < SUM_SET_WORDS * 64 && (self.0[excess / 64] >> (excess % 64)) & 1 == 1
    }

    /// Adds every member of `other` raised by `shift` (below 64).
    fn add_shifted(&mut self, other: &SumSet, shift: usize) {
        for i in (0..SUM_SET_WORDS).rev() {
            let mut word = other.0[i] << shift;
            if shift > 0 && i > 0 {
                word |= other.0[i - 1] >> (64 - shift);
            }
            self.0[i] |= word;
        }
    }
}

/// The exact text sums a window of payload bytes and the check byte after it
/// can produce.
///
/// `reach[i][s]` holds the excesses the bytes from `i` onwards and the check
/// byte can add when the byte sum of the rest of the record is `s`.
struct WindowSums {
    reach: Vec<[SumSet; 256]>,
}

impl WindowSums {
    fn new(window: usize) -> Self {
        let mut last = [SumSet::default(); 256];
        for (sum, set) in (0..=u8::MAX).zip(last.iter_mut()) {
            *set = SumSet::single(excess_of(sum.wrapping_neg()));
        }

        let mut reach = vec![last];
        for _ in 0..window {
            let next = &reach[reach.len() - 1];
            let mut row = [SumSet::default(); 256];
            for (sum, set) in (0..=u8::MAX).zip(row.iter_mut()) {
                for value in 0..=u8::MAX {
                    set.add_shifted(&next[usize::from(sum.wrapping_add(value))], excess_of(value));
                }
            }
            reach.push(row);
        }
        reach.reverse();
        WindowSums { reach }
    }

    /// The lowest window bytes giving a total excess of `excess`, starting
    /// from byte sum `sum`.
    fn solve(&self, mut sum: u8, mut excess: usize) -> Option<Vec<u8>> {
        if !self.reach[0][usize::from(sum)].contains(excess) {
            return None;
        }

        let mut bytes = Vec::with_capacity(self.reach.len() - 1);
        for next in &self.reach[1..] {
            let value = (0..=u8::MAX).find(|&value| {
                excess_of(value) <= excess
                    && next[usize::from(sum.wrapping_add(value))]
                        .contains(excess - excess_of(value))
            })?;
            trace!("Compensation byte {value:02x}");
            bytes.push(value);
            sum = sum.wrapping_add(value);
            excess -= excess_of(value);
        }
        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::{Duration, Instant};

    use crate::image::{Record, RecordType};

    const PAD: u32 = 0x1FC0;

    /// Data records up to 0x1FC0, then an all-zero checksum record.
    fn padded_image() -> HexImage {
        let mut records = (0..PAD)
            .step_by(64)
            .map(|addr| {
                let data = (addr..addr + 64).map(|a| a as u8).collect();
                Record::new(RecordType::Data, addr as u16, data)
            })
            .collect::<Vec<_>>();
        records.push(Record::new(RecordType::Data, PAD as u16, vec![0; 64]));
        records.push(Record::new(RecordType::EndOfFile, 0, vec![]));
        HexImage::from_records(records)
    }

    fn patcher_for(image: &HexImage, delta: i64) -> Patcher {
        let target = (i64::from(image.text_checksum()) + delta) as u32;
        Patcher::new(PatchOptions {
            image_checksum: target,
            ..PatchOptions::default()
        })
    }

    #[test]
    fn test_tokens_have_columns() {
        let found = tokens("  keys a\tbb  c", 5).collect::<Vec<_>>();
        assert_eq!(found, vec![(8, "keys"), (13, "a"), (15, "bb"), (19, "c")]);
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address(" 1fc0 "), Some(0x1FC0));
        assert_eq!(parse_address("0x10"), Some(0x10));
        assert_eq!(parse_address(""), None);
        assert_eq!(parse_address("+10"), None);
        assert_eq!(parse_address("zz"), None);
    }

    #[test]
    fn test_later_line_wins() {
        let mut image = padded_image();
        let patcher = Patcher::new(PatchOptions::default());
        let report = patcher.apply(&mut image, "1000: db AA BB\n1000: keys A\n");
        assert!(report.is_ok());
        assert_eq!(report.applied, 2);
        assert_eq!(image.get(0x1000).unwrap(), 0x04);
        assert_eq!(image.get(0x1001).unwrap(), 0xBB);
    }

    #[test]
    fn test_apply_line() {
        let mut image = padded_image();
        let patcher = Patcher::new(PatchOptions::default());
        assert_eq!(patcher.apply_line(&mut image, 1, "; nothing").unwrap(), None);
        assert_eq!(
            patcher.apply_line(&mut image, 2, "0010: db 1").unwrap(),
            Some(Directive::Bytes)
        );
        let err = patcher.apply_line(&mut image, 3, "0010 db 1").unwrap_err();
        assert_eq!(err.to_string(), "3:1: error: expected address:");
    }

    #[test]
    fn test_keys_directive() {
        let mut image = padded_image();
        let patcher = Patcher::new(PatchOptions::default());
        let report = patcher.apply(&mut image, "0200: keys leftctrl Z e0 ; remap\n");
        assert!(report.is_ok());
        assert_eq!(image.get(0x0200).unwrap(), 0xF0);
        assert_eq!(image.get(0x0201).unwrap(), 0x1D);
        assert_eq!(image.get(0x0202).unwrap(), 0xE0);
    }

    #[test]
    fn test_signed_hex_is_rejected() {
        let mut image = padded_image();
        let patcher = Patcher::new(PatchOptions::default());
        let report = patcher.apply(&mut image, "0200: keys +1f\n0201: db +1f\n");
        assert!(matches!(&report.errors[0].kind, DirectiveErrorKind::UnknownKey(k) if k == "+1f"));
        assert!(matches!(&report.errors[1].kind, DirectiveErrorKind::BadByte(b) if b == "+1f"));
        assert_eq!(image.get(0x0200).unwrap(), 0x00);
    }

    #[test]
    fn test_db_truncates_large_literals() {
        let mut image = padded_image();
        let patcher = Patcher::new(PatchOptions::default());
        let report = patcher.apply(&mut image, "0300: db 1ff 7\n");
        assert!(report.is_ok());
        assert_eq!(image.get(0x0300).unwrap(), 0xFF);
        assert_eq!(image.get(0x0301).unwrap(), 0x07);
    }

    #[test]
    fn test_blank_and_comment_lines() {
        let mut image = padded_image();
        let before = image.clone();
        let patcher = Patcher::new(PatchOptions::default());
        let report = patcher.apply(&mut image, "\n   \n; just a comment\n\t; indented\n");
        assert!(report.is_ok());
        assert_eq!(report.applied, 0);
        assert_eq!(image, before);
    }

    #[test]
    fn test_errors_are_collected() {
        let mut image = padded_image();
        let patcher = Patcher::new(PatchOptions::default());
        let script = "0100: db 01\n\
                      0100: frob 1\n\
                      0101: keys a nosuchkey b\n\
                      0102: db 12 zz\n\
                      9000: db 00\n\
                      no address here\n\
                      0104:\n\
                      0105: db 05\n";
        let report = patcher.apply(&mut image, script);

        let found = report
            .errors
            .iter()
            .map(|e| (e.line, e.column))
            .collect::<Vec<_>>();
        assert_eq!(found, vec![(2, 7), (3, 14), (4, 13), (5, 10), (6, 1), (7, 6)]);

        assert!(matches!(&report.errors[0].kind, DirectiveErrorKind::UnknownDirective(d) if d == "frob"));
        assert!(matches!(&report.errors[1].kind, DirectiveErrorKind::UnknownKey(k) if k == "nosuchkey"));
        assert!(matches!(&report.errors[2].kind, DirectiveErrorKind::BadByte(b) if b == "zz"));
        assert!(matches!(
            &report.errors[3].kind,
            DirectiveErrorKind::Image(KbdbootError::AddressNotMapped(0x9000))
        ));
        assert!(matches!(report.errors[4].kind, DirectiveErrorKind::ExpectedAddress));
        assert!(matches!(report.errors[5].kind, DirectiveErrorKind::ExpectedDirective));
        assert_eq!(report.errors[0].to_string(), "2:7: error: unrecognized directive frob");

        // lines around the failures still ran, as did tokens before them
        assert_eq!(report.applied, 2);
        assert_eq!(image.get(0x0100).unwrap(), 0x01);
        assert_eq!(image.get(0x0101).unwrap(), 0x04);
        assert_eq!(image.get(0x0102).unwrap(), 0x12);
        assert_eq!(image.get(0x0105).unwrap(), 0x05);

        assert!(matches!(
            patcher.finish(&mut image, &report),
            Err(KbdbootError::PatchFailed(6))
        ));
    }

    #[test]
    fn test_restore_checksum() {
        let mut image = padded_image();
        let target = image.text_checksum() + 37;

        assert!(restore_checksum(&mut image, PAD, target, 5).unwrap());
        assert_eq!(image.text_checksum(), target);

        let record = image.record(image.record_at(PAD).unwrap()).unwrap();
        assert!(record.data()[..59].iter().all(|&b| b == 0));

        // already right: nothing to do
        let fixed = image.clone();
        assert!(!restore_checksum(&mut image, PAD, target, 5).unwrap());
        assert_eq!(image, fixed);
    }

    #[test]
    fn test_restore_checksum_overwrites_old_padding() {
        let mut image = padded_image();
        image.set(PAD + 63, 0x5A).unwrap();
        let target = padded_image().text_checksum() + 100;

        assert!(restore_checksum(&mut image, PAD, target, 5).unwrap());
        assert_eq!(image.text_checksum(), target);
    }

    #[test]
    fn test_restore_checksum_unreachable() {
        let mut image = padded_image();
        let target = image.text_checksum() - 5000;
        assert!(matches!(
            restore_checksum(&mut image, PAD, target, 5),
            Err(KbdbootError::ChecksumRestoration(PAD))
        ));
    }

    #[test]
    fn test_restore_checksum_gaps_fail_fast() {
        // inside the range the window could span, but no byte values hit them
        for delta in [1, -1, -8, 50, 200] {
            let mut image = padded_image();
            let before = image.text_checksum();
            let target = (i64::from(before) + delta) as u32;

            let started = Instant::now();
            assert!(
                matches!(
                    restore_checksum(&mut image, PAD, target, 5),
                    Err(KbdbootError::ChecksumRestoration(PAD))
                ),
                "delta {delta}"
            );
            assert!(started.elapsed() < Duration::from_secs(5), "delta {delta}");
        }
    }

    #[test]
    fn test_restore_checksum_reachable_edges() {
        for delta in [-7, 8, 232] {
            let mut image = padded_image();
            let target = (i64::from(image.text_checksum()) + delta) as u32;
            assert!(restore_checksum(&mut image, PAD, target, 5).unwrap());
            assert_eq!(image.text_checksum(), target);

            let fixed = image.clone();
            assert!(!restore_checksum(&mut image, PAD, target, 5).unwrap());
            assert_eq!(image, fixed);
        }
    }

    #[test]
    fn test_window_sums_match_exhaustive_search() {
        let mut record = Record::new(RecordType::Data, 0x0010, vec![0; 3]);
        let byte_sum = record.checksum().wrapping_neg();
        let floor = record.text_sum() - hex_text_sum(record.checksum()) + HEX_TEXT_SUM_MIN;

        let mut every = BTreeSet::new();
        for a in 0..=u8::MAX {
            for b in 0..=u8::MAX {
                record.data_mut()[1..].copy_from_slice(&[a, b]);
                every.insert((record.text_sum() - floor) as usize);
            }
        }

        let sums = WindowSums::new(2);
        for excess in 0..=3 * HEX_TEXT_SPAN + 8 {
            let found = sums.solve(byte_sum, excess);
            assert_eq!(found.is_some(), every.contains(&excess), "excess {excess}");
            if let Some(bytes) = found {
                record.data_mut()[1..].copy_from_slice(&bytes);
                assert_eq!((record.text_sum() - floor) as usize, excess);
            }
        }
    }

    #[test]
    fn test_restore_checksum_missing_record() {
        let mut image = padded_image();
        let target = image.text_checksum() + 1;
        assert!(matches!(
            restore_checksum(&mut image, PAD + 1, target, 5),
            Err(KbdbootError::MissingChecksumRecord(0x1FC1))
        ));
    }

    #[test]
    fn test_checksum_directive() {
        let mut image = padded_image();
        let patcher = patcher_for(&image, 120);
        let target = patcher.options().image_checksum;

        let report = patcher.apply(&mut image, "0400: keys f1 f2\n1fc0: checksum\n");
        assert!(report.is_ok());
        assert_eq!(report.checksum_address, Some(PAD));
        assert_eq!(image.text_checksum(), target);
        assert_eq!(image.get(0x0400).unwrap(), 0x3A);
    }

    #[test]
    fn test_checksum_directive_can_be_disabled() {
        let mut image = padded_image();
        let patcher = Patcher::new(PatchOptions {
            checksum_directive: false,
            ..PatchOptions::default()
        });
        let report = patcher.apply(&mut image, "1fc0: checksum\n");
        assert!(matches!(
            &report.errors[0].kind,
            DirectiveErrorKind::UnknownDirective(d) if d == "checksum"
        ));
    }

    #[test]
    fn test_finish_updates_low_sum_and_keeps_checksum() {
        let script = "0100: db ff ff ff\n1fc0: checksum\n";

        let mut expected = padded_image();
        expected.set(0x100, 0xFF).unwrap();
        expected.set(0x101, 0xFF).unwrap();
        expected.set(0x102, 0xFF).unwrap();
        expected.update_low_sum().unwrap();
        let target = expected.text_checksum() + 37;

        let mut image = padded_image();
        let patcher = Patcher::new(PatchOptions {
            update_low_sum: true,
            image_checksum: target,
            ..PatchOptions::default()
        });

        let report = patcher.apply(&mut image, script);
        assert!(report.is_ok());
        assert_ne!(image.stored_low_sum().unwrap(), image.sum_low_blocks());

        patcher.finish(&mut image, &report).unwrap();
        assert_eq!(image.stored_low_sum().unwrap(), image.sum_low_blocks());
        assert_eq!(image.stored_low_sum().unwrap(), 0x59BA);
        assert_eq!(image.text_checksum(), target);
    }

    #[test]
    fn test_finish_without_low_sum_is_a_no_op() {
        let mut image = padded_image();
        let patcher = Patcher::new(PatchOptions::default());
        let report = patcher.apply(&mut image, "0100: db 00\n");
        let before = image.clone();
        patcher.finish(&mut image, &report).unwrap();
        assert_eq!(image, before);
    }
}
