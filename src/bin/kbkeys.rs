//! kbkeys - list the bytes of a firmware image as key names.

mod common;

use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use kbdboot::{HexImage, KeyTable, RecordType};
use log::{debug, error, info};

/// Record offset of the first byte of a listing line.
const LINE_START: usize = 4;
const BYTES_PER_LINE: usize = 8;

/// Print every data byte of a firmware image read from stdin as the key it
/// would map to.
#[derive(Parser)]
#[command(
    name = "kbkeys",
    version,
    about,
    long_about = None,
    after_help = common::EXIT_STATUS_HELP
)]
struct Cli {
    /// Increase verbosity level (-v, -vv).
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Device profile to use instead of the built-in one (TOML).
    #[arg(long, value_name = "FILE")]
    profile: Option<PathBuf>,
}

fn main() {
    let cli: Cli = common::parse_args();
    common::init_logging(cli.verbose);

    if let Err(e) = run(&cli) {
        error!("Fatal error: {e:#}");
        process::exit(1);
    }
}

/// `(NAME)xx`, or `<NAME>xx` for codes on the shifted modifier page.
fn key_label(keys: &KeyTable, byte: u8) -> String {
    let (open, close) = if KeyTable::is_extended(byte) {
        ('<', '>')
    } else {
        ('(', ')')
    };
    let name = keys.name_for(byte).unwrap_or("???");
    format!(
        "{open}{name:>width$}{close}{byte:02x}",
        width = keys.max_name_len()
    )
}

fn key_listing(image: &HexImage, keys: &KeyTable) -> String {
    let mut out = String::new();
    let mut line_open = false;

    for record in image.records() {
        debug!(
            "Record type {:?} at {:#06x}, length {}",
            record.kind(),
            record.absolute_address(),
            record.len()
        );
        if record.kind() != RecordType::Data {
            continue;
        }

        for (i, (address, &byte)) in (record.absolute_address()..)
            .zip(record.data())
            .enumerate()
        {
            let line_start = i >= LINE_START && (i - LINE_START) % BYTES_PER_LINE == 0;
            if line_start || !line_open {
                if line_open {
                    out.push('\n');
                }
                out.push_str(&format!("{address:04x}:"));
                line_open = true;
            }
            out.push(' ');
            out.push_str(&key_label(keys, byte));
        }
    }
    if line_open {
        out.push('\n');
    }
    out
}

fn run(cli: &Cli) -> Result<()> {
    let profile = common::load_profile(cli.profile.as_deref())?;

    let input = io::read_to_string(io::stdin()).context("Could not read image from stdin")?;
    let image = HexImage::parse(&input).context("Could not load image from input")?;

    let mut stdout = io::stdout().lock();
    write!(stdout, "{}", key_listing(&image, KeyTable::standard()))?;
    stdout.flush()?;

    let checksum = image.text_checksum();
    info!(
        "Text checksum {checksum:#08x}, expected {:#08x} (difference {})",
        profile.image_checksum,
        i64::from(checksum) - i64::from(profile.image_checksum)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_label() {
        let keys = KeyTable::standard();
        assert_eq!(key_label(keys, 0x04), "(          A)04");
        assert_eq!(key_label(keys, 0xF0), "<   LEFTCTRL>f0");
        assert_eq!(key_label(keys, 0xFF), "<        ???>ff");
    }

    #[test]
    fn test_listing_lines_start_at_offset_four() {
        let image: HexImage = ":10010000000102030405060708090A0B0C0D0E0F77\n:00000001FF\n"
            .parse()
            .unwrap();
        let listing = key_listing(&image, KeyTable::standard());
        let lines = listing.lines().collect::<Vec<_>>();

        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("0100: (       NONE)00 (        ???)01"));
        assert!(lines[1].starts_with("0104: (          A)04 (          B)05"));
        assert!(lines[2].starts_with("010c:"));
        assert_eq!(lines[1].matches(')').count(), BYTES_PER_LINE);
    }
}
