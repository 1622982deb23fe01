//! Patching and uploading firmware for a USB keyboard through its vendor
//! bootloader.
//!
//! <br>
//!
//! The keyboard's firmware is distributed as a hex text image. This crate
//! parses such images, applies small textual patches to them (remapping keys,
//! poking bytes, and restoring the checksums the bootloader and the vendor
//! updater insist on), and streams the result to the keyboard over USB in
//! 64-byte command frames.
//!
//! # Example
//!
//! Remap caps lock to left control and flash the result.
//!
//! ```rust,no_run
//! use kbdboot::{
//!     session::{self, UploadOptions},
//!     DeviceProfile, HexImage, Patcher, PatchOptions,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let profile = DeviceProfile::default();
//!     let mut image = HexImage::parse(&std::fs::read_to_string("firmware.hex")?)?
//!         .with_layout(profile.low_sum);
//!
//!     let patcher = Patcher::new(PatchOptions::from_profile(&profile));
//!     let report = patcher.apply(&mut image, "0a3c: keys leftctrl\n1fc0: checksum\n");
//!     for error in &report.errors {
//!         eprintln!("firmware.patch:{error}");
//!     }
//!     patcher.finish(&mut image, &report)?;
//!
//!     let ctx = rusb::Context::new()?;
//!     session::upload(&ctx, &image, &profile, &UploadOptions::default(), &mut |_, _| {})?;
//!     Ok(())
//! }
//! ```

/// Flash programming granularity of the bootloader
pub const BLOCK_SIZE: usize = 64;
/// Payload carried by one loader message, half a block
pub const HALF_BLOCK_SIZE: usize = 32;
/// Size of every loader message and response
pub const LOADER_FRAME_SIZE: usize = 64;
/// First byte of every loader message
pub const LOADER_MAGIC: u8 = 0xFF;
/// Highest flash block number
pub const MAX_BLOCK_NUM: u8 = 0xFF;

/// Keyboard USB Vendor ID
pub const KBD_VID: u16 = 0x05AC;
/// Keyboard USB Product IDs in normal mode
pub const KBD_PIDS: [u16; 2] = [0x0220, 0x024F];
/// Keyboard USB Product ID in bootloader mode
pub const KBD_LOADER_PID: u16 = 0x0228;

/// `wValue` high byte of the boot mode request
pub const BOOT_MODE_REPORT: u16 = 0x0300;
/// Boot mode request argument to enter the bootloader
pub const MODE_ENTER_LOADER: u8 = 0x0A;
/// Boot mode request argument to return to keyboard mode
pub const MODE_EXIT_LOADER: u8 = 0x0B;

/// Text checksum of an unmodified firmware file for the supported keyboard
pub const IMAGE_TEXT_CHECKSUM: u32 = 0x1057F8;
/// Trailing bytes of the checksum record used to restore the text checksum
pub const CHECKSUM_COMPENSATION_BYTES: usize = 5;
/// Upper bound on compensation bytes, keeping the search depth bounded
pub const MAX_COMPENSATION_BYTES: usize = 8;

pub mod checksum;

/// Loader Message Module
pub mod cmd;
pub use cmd::{LoaderCommand, LoaderMessage, Status, StatusError};

pub mod discover;
pub use discover::{DeviceSelector, DeviceSummary};

pub mod error;
pub use error::{KbdbootError, Result};

/// Hex Image Module
pub mod image;
pub use image::{HexImage, LowSumLayout, Record, RecordType};

pub mod keys;
pub use keys::KeyTable;

pub mod loader;
pub use loader::{FlashBlock, FrameTransport, Loader, LoaderState, Pass};

pub mod patch;
pub use patch::{Directive, DirectiveError, PatchOptions, PatchReport, Patcher};

pub mod profile;
pub use profile::DeviceProfile;

pub mod session;

/// USB Connection Module
pub mod usb;
pub use usb::{KeyboardConnection, LoaderConnection};
