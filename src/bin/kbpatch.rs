//! kbpatch - apply a patch script to a firmware image.
//!
//! Reads the image on stdin and writes the patched image to stdout. Nothing
//! is written if any line of the script fails.

mod common;

use std::fs;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use kbdboot::{HexImage, PatchOptions, Patcher};
use log::{debug, error};

/// Apply a patch script to a firmware image read from stdin.
#[derive(Parser)]
#[command(
    name = "kbpatch",
    version,
    about,
    long_about = None,
    after_help = common::EXIT_STATUS_HELP
)]
struct Cli {
    /// Patch script to apply.
    #[arg(value_name = "FILE.PATCH")]
    patch: PathBuf,

    /// Increase verbosity level (-v, -vv).
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Device profile to use instead of the built-in one (TOML).
    #[arg(long, value_name = "FILE")]
    profile: Option<PathBuf>,

    /// Reject the `checksum` directive.
    #[arg(long)]
    no_checksum_directive: bool,

    /// Recompute the stored low sum after patching.
    #[arg(long)]
    update_low_sum: bool,
}

fn main() {
    let cli: Cli = common::parse_args();
    common::init_logging(cli.verbose);
    debug!(
        "kbpatch v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = run(&cli) {
        error!("Fatal error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let profile = common::load_profile(cli.profile.as_deref())?;

    let input = io::read_to_string(io::stdin()).context("Could not read image from stdin")?;
    let mut image = HexImage::parse(&input)
        .context("Could not load image from input")?
        .with_layout(profile.low_sum);

    let script = fs::read_to_string(&cli.patch)
        .with_context(|| format!("Could not open {}", cli.patch.display()))?;

    let patcher = Patcher::new(PatchOptions {
        checksum_directive: !cli.no_checksum_directive,
        update_low_sum: cli.update_low_sum,
        ..PatchOptions::from_profile(&profile)
    });

    let report = patcher.apply(&mut image, &script);
    for e in &report.errors {
        eprintln!("{}:{e}", cli.patch.display());
    }
    patcher.finish(&mut image, &report)?;
    debug!("Applied {} patch lines", report.applied);

    let mut stdout = io::stdout().lock();
    write!(stdout, "{image}")?;
    stdout.flush()?;
    Ok(())
}
