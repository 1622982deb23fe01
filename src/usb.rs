use std::time::Duration;

use log::{debug, info, warn};
use rusb::{Device, DeviceHandle, Direction, Recipient, RequestType, UsbContext};

use crate::error::{KbdbootError, Result};
use crate::loader::FrameTransport;
use crate::profile::DeviceProfile;
use crate::{BOOT_MODE_REPORT, LOADER_FRAME_SIZE, MODE_ENTER_LOADER};

/// bRequest of the boot mode request (HID SET_REPORT)
const SET_REPORT: u8 = 0x09;

fn claim_interface<T: UsbContext>(handle: &mut DeviceHandle<T>, iface: u8) -> Result<()> {
    // not every platform can detach kernel drivers
    if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
        debug!("kernel driver auto-detach unavailable: {e}");
    }
    handle
        .claim_interface(iface)
        .map_err(|source| KbdbootError::UsbClaimInterfaceFailure { iface, source })
}

fn check_transfer(actual: usize, mismatch: fn(usize, usize) -> KbdbootError) -> Result<()> {
    if actual != LOADER_FRAME_SIZE {
        return Err(mismatch(LOADER_FRAME_SIZE, actual));
    }
    Ok(())
}

fn write_mismatch(expected: usize, actual: usize) -> KbdbootError {
    KbdbootError::UsbWriteBulkMismatch { expected, actual }
}

fn read_mismatch(expected: usize, actual: usize) -> KbdbootError {
    KbdbootError::UsbReadBulkMismatch { expected, actual }
}

/// `wValue` of the boot mode request.
fn boot_mode_value(mode: u8) -> u16 {
    BOOT_MODE_REPORT | u16::from(mode)
}

/// A keyboard in bootloader mode with its interface claimed.
///
/// The interface is released when the connection is dropped.
#[derive(Debug)]
pub struct LoaderConnection<T: UsbContext> {
    handle: DeviceHandle<T>,
    iface: u8,
    out_addr: u8,
    in_addr: u8,
    timeout: Duration,
}

impl<T: UsbContext> Drop for LoaderConnection<T> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.iface) {
            warn!("could not release interface {}: {e}", self.iface);
        }
    }
}

impl<T: UsbContext> LoaderConnection<T> {
    /// Opens the bootloader and claims its interface until the connection is
    /// dropped.
    pub fn open(device: &Device<T>, profile: &DeviceProfile) -> Result<Self> {
        let mut handle = device.open().map_err(KbdbootError::UsbOpenFailure)?;
        claim_interface(&mut handle, profile.interface)?;

        Ok(LoaderConnection {
            handle,
            iface: profile.interface,
            out_addr: profile.command_endpoint,
            in_addr: profile.status_endpoint,
            timeout: profile.transfer_timeout(),
        })
    }
}

impl<T: UsbContext> FrameTransport for LoaderConnection<T> {
    fn send_frame(&mut self, frame: &[u8; LOADER_FRAME_SIZE]) -> Result<()> {
        let len = self
            .handle
            .write_bulk(self.out_addr, frame, self.timeout)
            .map_err(KbdbootError::UsbWriteBulkFailure)?;
        check_transfer(len, write_mismatch)
    }

    fn recv_frame(&mut self) -> Result<[u8; LOADER_FRAME_SIZE]> {
        let mut buf = [0u8; LOADER_FRAME_SIZE];
        let len = self
            .handle
            .read_bulk(self.in_addr, &mut buf, self.timeout)
            .map_err(KbdbootError::UsbReadBulkFailure)?;
        check_transfer(len, read_mismatch)?;
        Ok(buf)
    }
}

/// A keyboard in normal mode, used to switch it into its bootloader.
#[derive(Debug)]
pub struct KeyboardConnection<T: UsbContext> {
    handle: DeviceHandle<T>,
    iface: u8,
    timeout: Duration,
}

impl<T: UsbContext> KeyboardConnection<T> {
    /// Opens the keyboard without claiming its interface yet.
    pub fn open(device: &Device<T>, profile: &DeviceProfile) -> Result<Self> {
        let handle = device.open().map_err(KbdbootError::UsbOpenFailure)?;
        Ok(KeyboardConnection {
            handle,
            iface: profile.interface,
            timeout: profile.control_timeout(),
        })
    }

    /// Asks the keyboard to restart into its bootloader.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        info!("Putting device into bootloader mode...");
        self.set_boot_mode(MODE_ENTER_LOADER)
    }

    /// Sends the boot mode request with the interface claimed, then
    /// releases it. The device re-enumerates afterwards.
    fn set_boot_mode(&mut self, mode: u8) -> Result<()> {
        claim_interface(&mut self.handle, self.iface)?;
        let sent = self
            .handle
            .write_control(
                rusb::request_type(Direction::Out, RequestType::Class, Recipient::Interface),
                SET_REPORT,
                boot_mode_value(mode),
                0,
                &[mode],
                self.timeout,
            )
            .map_err(KbdbootError::UsbModeSwitchFailure);
        let released = self
            .handle
            .release_interface(self.iface)
            .map_err(|source| KbdbootError::UsbReleaseInterfaceFailure {
                iface: self.iface,
                source,
            });

        match sent {
            Ok(_) => released,
            Err(e) => {
                if let Err(release) = released {
                    warn!("{release}");
                }
                Err(e)
            }
        }
    }
}
