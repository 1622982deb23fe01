//! kbdboot - upload firmware to the keyboard through its bootloader.

mod common;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use kbdboot::discover;
use kbdboot::session::{self, UploadOptions};
use kbdboot::Pass;
use log::{debug, error, warn};
use rusb::UsbContext;

/// Upload a firmware image to the keyboard.
///
/// The keyboard is switched into bootloader mode, the image is sent block by
/// block, and the bootloader verifies the result before leaving.
#[derive(Parser)]
#[command(
    name = "kbdboot",
    version,
    about,
    long_about = None,
    after_help = common::EXIT_STATUS_HELP
)]
struct Cli {
    /// Firmware image to use.
    #[arg(value_name = "FILE.HEX", required_unless_present = "list")]
    firmware: Option<PathBuf>,

    /// Device address on the bus.
    #[arg(short = 'a', value_name = "DEV-ADDR", requires = "bus")]
    address: Option<u8>,

    /// Bus number the device is attached to.
    #[arg(short = 'b', value_name = "BUS-NUM", requires = "address")]
    bus: Option<u8>,

    /// Ignore checksum errors in the firmware image file.
    #[arg(short = 'c')]
    ignore_checksum: bool,

    /// List devices and then exit.
    #[arg(short = 'l')]
    list: bool,

    /// Increase verbosity level (-v, -vv).
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Assume the device is already in bootloader mode.
    #[arg(short = 'L')]
    assume_loader: bool,

    /// Compare the image against flash instead of writing it.
    #[arg(long)]
    verify_only: bool,

    /// Device profile to use instead of the built-in one (TOML).
    #[arg(long, value_name = "FILE")]
    profile: Option<PathBuf>,
}

fn main() {
    let cli: Cli = common::parse_args();
    common::init_logging(cli.verbose);
    debug!(
        "kbdboot v{} (verbose level: {})",
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

    let mut ctx = rusb::Context::new().context("Could not initialize USB context")?;
    ctx.set_log_level(if cli.verbose > 1 {
        rusb::LogLevel::Debug
    } else {
        rusb::LogLevel::Warning
    });

    if cli.list {
        return list_devices(&ctx, cli.verbose > 0);
    }

    let firmware = cli
        .firmware
        .as_deref()
        .context("No firmware image given")?;
    let image = session::load_firmware(firmware, &profile, cli.ignore_checksum)
        .with_context(|| format!("Could not load {}", firmware.display()))?;

    let options = UploadOptions {
        location: cli.bus.zip(cli.address),
        assume_loader: cli.assume_loader,
        pass: if cli.verify_only {
            Pass::Verify
        } else {
            Pass::Write
        },
    };

    let pb = progress_bar(cli.verbose)?;
    let result = session::upload(&ctx, &image, &profile, &options, &mut |done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    });

    match result {
        Ok(()) => {
            pb.finish_with_message("done");
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            Err(e.into())
        }
    }
}

/// Block progress on stderr, hidden when logging per block or not on a
/// terminal.
fn progress_bar(verbose: u8) -> Result<ProgressBar> {
    if verbose > 0 || !std::io::stderr().is_terminal() {
        return Ok(ProgressBar::hidden());
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} blocks {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    Ok(pb)
}

fn list_devices(ctx: &rusb::Context, describe: bool) -> Result<()> {
    for (device, summary) in discover::list_devices(ctx)? {
        println!("{summary}");
        if describe {
            match discover::describe_device(&device) {
                Ok(text) => print!("{text}"),
                Err(e) => warn!("  {e}"),
            }
        }
    }
    Ok(())
}
