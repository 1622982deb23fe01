//! Upload sessions: firmware loading, the switch into bootloader mode, and
//! the block transfer itself.

use std::fs;
use std::path::Path;
use std::thread;

use log::{info, warn};
use rusb::UsbContext;

use crate::discover::{select_device, DeviceSelector};
use crate::error::{KbdbootError, Result};
use crate::image::HexImage;
use crate::loader::{plan_blocks, FrameTransport, Loader, Pass};
use crate::profile::DeviceProfile;
use crate::usb::{KeyboardConnection, LoaderConnection};

/// How [`upload`] finds the device and what it sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Bus number and device address of the keyboard.
    pub location: Option<(u8, u8)>,
    /// The keyboard is already in bootloader mode.
    pub assume_loader: bool,
    pub pass: Pass,
}

/// Parses a firmware image and checks its stored low sum.
///
/// A mismatch is an error unless `ignore_low_sum` is set.
pub fn parse_firmware(
    text: &str,
    profile: &DeviceProfile,
    ignore_low_sum: bool,
) -> Result<HexImage> {
    let image = HexImage::parse(text)?.with_layout(profile.low_sum);

    let computed = image.sum_low_blocks();
    let stored = image.stored_low_sum()?;
    info!(
        "Low sum over {:#06x}..{:#06x}: computed {computed:#06x}, stored {stored:#06x}",
        image.begin_summed(),
        image.end_summed()
    );

    if computed != stored {
        if !ignore_low_sum {
            return Err(KbdbootError::LowSumMismatch { stored, computed });
        }
        warn!("Ignoring low sum mismatch");
    }
    Ok(image)
}

/// Reads a firmware file and checks it like [`parse_firmware`].
pub fn load_firmware(
    path: &Path,
    profile: &DeviceProfile,
    ignore_low_sum: bool,
) -> Result<HexImage> {
    info!("Reading {}", path.display());
    let text = fs::read_to_string(path)?;
    parse_firmware(&text, profile, ignore_low_sum)
}

/// Sends the image's blocks through an open bootloader transport. Returns
/// the number of blocks sent.
pub fn flash<P: FrameTransport>(
    port: P,
    image: &HexImage,
    profile: &DeviceProfile,
    pass: Pass,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<usize> {
    let blocks = plan_blocks(image, &profile.reserved_blocks)?;
    info!("{} {} blocks", pass.verb(), blocks.len());

    let mut loader = Loader::new(port);
    loader.run(&blocks, pass, progress)?;
    Ok(blocks.len())
}

/// Finds the keyboard, switches it into bootloader mode and waits for it to
/// come back.
fn switch_to_loader<T: UsbContext>(
    ctx: &T,
    profile: &DeviceProfile,
    location: Option<(u8, u8)>,
) -> Result<()> {
    let selector =
        DeviceSelector::by_identity(profile.vendor_id, &profile.keyboard_product_ids).at(location);
    let (device, summary) = select_device(ctx, &selector)?;
    info!("Opening {summary}");

    if let Ok(desc) = device.device_descriptor() {
        let version = desc.device_version();
        info!(
            "  Device (firmware version): {}.{}.{}",
            version.major(),
            version.minor(),
            version.sub_minor()
        );
    }

    KeyboardConnection::open(&device, profile)?.enter_bootloader()?;

    info!("Waiting for device to restart...");
    thread::sleep(profile.settle_time());
    Ok(())
}

/// Where to look for the bootloader after trying to switch the keyboard at
/// `pinned` into it.
///
/// After a switch the device re-enumerates at a new address, so any location
/// is dropped. A keyboard that was not found is only tolerated when no
/// location was given; the first device in bootloader mode is used then.
fn loader_location(
    pinned: Option<(u8, u8)>,
    switched: Result<()>,
) -> Result<Option<(u8, u8)>> {
    match switched {
        Ok(()) => Ok(None),
        Err(e) if e.is_device_not_found() && pinned.is_none() => {
            info!("{e}");
            info!("Looking for device already in bootloader mode...");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Uploads `image` to the keyboard.
///
/// Unless the keyboard is assumed to be in bootloader mode already, it is
/// first switched over. When no keyboard is found by identity, a device
/// already in bootloader mode is looked for instead; a keyboard pinned by
/// location must be present.
pub fn upload<T: UsbContext>(
    ctx: &T,
    image: &HexImage,
    profile: &DeviceProfile,
    options: &UploadOptions,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    // reject unsendable images before touching the device
    plan_blocks(image, &profile.reserved_blocks)?;

    let location = if options.assume_loader {
        options.location
    } else {
        let switched = switch_to_loader(ctx, profile, options.location);
        loader_location(options.location, switched)?
    };

    let selector =
        DeviceSelector::by_identity(profile.vendor_id, &profile.loader_product_ids).at(location);
    let (device, summary) = select_device(ctx, &selector)?;
    info!("Opening {summary}");

    let connection = LoaderConnection::open(&device, profile)?;
    let sent = flash(connection, image, profile, options.pass, progress)?;
    info!("Update complete, {sent} blocks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{LoaderCommand, LoaderMessage, Status};
    use crate::image::tests::sample_image;
    use crate::LOADER_FRAME_SIZE;

    /// Accepts everything and counts the commands it saw.
    #[derive(Default)]
    struct Agreeable {
        commands: Vec<LoaderCommand>,
    }
    impl FrameTransport for Agreeable {
        fn send_frame(&mut self, frame: &[u8; LOADER_FRAME_SIZE]) -> Result<()> {
            let msg = LoaderMessage::from_bytes(frame)?;
            self.commands.extend(msg.command());
            Ok(())
        }

        fn recv_frame(&mut self) -> Result<[u8; LOADER_FRAME_SIZE]> {
            let mut frame = [0u8; LOADER_FRAME_SIZE];
            frame[0] = Status::READY_TO_WRITE | Status::SUCCESS;
            Ok(frame)
        }
    }

    fn good_image() -> HexImage {
        let mut image = sample_image();
        image.update_low_sum().unwrap();
        image
    }

    #[test]
    fn test_loader_location_after_switch() {
        assert_eq!(loader_location(None, Ok(())).unwrap(), None);
        assert_eq!(loader_location(Some((1, 7)), Ok(())).unwrap(), None);
    }

    #[test]
    fn test_missing_keyboard_falls_back_to_any_loader() {
        let missing = Err(KbdbootError::DeviceNotFound("no keyboard".into()));
        assert_eq!(loader_location(None, missing).unwrap(), None);
    }

    #[test]
    fn test_missing_pinned_keyboard_is_fatal() {
        let missing = Err(KbdbootError::DeviceNotFound("no keyboard".into()));
        assert!(matches!(
            loader_location(Some((1, 7)), missing),
            Err(KbdbootError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_switch_failure_is_fatal() {
        let failed = Err(KbdbootError::UsbModeSwitchFailure(rusb::Error::Pipe));
        assert!(matches!(
            loader_location(None, failed),
            Err(KbdbootError::UsbModeSwitchFailure(rusb::Error::Pipe))
        ));
    }

    #[test]
    fn test_parse_firmware() {
        let profile = DeviceProfile::default();
        let image = parse_firmware(&good_image().to_string(), &profile, false).unwrap();
        assert_eq!(image, good_image());
    }

    #[test]
    fn test_parse_firmware_low_sum_mismatch() {
        let profile = DeviceProfile::default();
        let text = sample_image().to_string();

        assert!(matches!(
            parse_firmware(&text, &profile, false),
            Err(KbdbootError::LowSumMismatch {
                stored: 0x0100,
                computed: 0x56C0
            })
        ));
        assert!(parse_firmware(&text, &profile, true).is_ok());
    }

    #[test]
    fn test_parse_firmware_rejects_bad_text() {
        let profile = DeviceProfile::default();
        assert!(matches!(
            parse_firmware(":0000000001\n", &profile, true),
            Err(KbdbootError::RecordChecksum { line: 1, .. })
        ));
    }

    #[test]
    fn test_load_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firmware.hex");
        fs::write(&path, good_image().to_string()).unwrap();

        let profile = DeviceProfile::default();
        assert_eq!(load_firmware(&path, &profile, false).unwrap(), good_image());
        assert!(matches!(
            load_firmware(&dir.path().join("missing.hex"), &profile, false),
            Err(KbdbootError::Io(_))
        ));
    }

    #[test]
    fn test_flash() {
        let profile = DeviceProfile::default();
        let mut port = Agreeable::default();
        let mut last = (0, 0);

        let sent = flash(&mut port, &good_image(), &profile, Pass::Verify, &mut |n, total| {
            last = (n, total)
        })
        .unwrap();

        assert_eq!(sent, 125);
        assert_eq!(last, (125, 125));
        assert_eq!(port.commands.len(), 2 + 2 * 125);
        assert_eq!(port.commands.first(), Some(&LoaderCommand::Enter));
        assert_eq!(port.commands.last(), Some(&LoaderCommand::Exit));
        assert!(port.commands[1..251]
            .iter()
            .all(|&c| c == LoaderCommand::Verify));
    }
}
