//! Pieces shared by the command-line tools.

use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use kbdboot::DeviceProfile;

/// Exit status for command line usage errors (sysexits `EX_USAGE`).
pub const EX_USAGE: i32 = 64;

/// Exit statuses, shown after the help text of every tool.
pub const EXIT_STATUS_HELP: &str =
    "Exit status: 0 on success and for -h/--help or -V/--version, 64 on usage errors, 1 on any other error.";

/// Parses the command line, exiting with [`EX_USAGE`] on bad usage. Help and
/// version requests exit normally.
pub fn parse_args<C: Parser>() -> C {
    match C::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            process::exit(EX_USAGE);
        }
        Err(e) => e.exit(),
    }
}

/// Sets up logging to stderr from the `-v` count.
pub fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(verbose >= 2)
        .format_timestamp(if verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

pub fn load_profile(path: Option<&Path>) -> Result<DeviceProfile> {
    DeviceProfile::load_or_default(path).with_context(|| match path {
        Some(path) => format!("Failed to load device profile {}", path.display()),
        None => "Invalid built-in device profile".to_string(),
    })
}
