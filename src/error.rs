//! Error types for kbdboot.

use std::io;
use thiserror::Error;

use crate::cmd::StatusError;

/// Result type for kbdboot operations.
pub type Result<T> = std::result::Result<T, KbdbootError>;

/// Error type for this crate.
#[derive(Error, Debug)]
pub enum KbdbootError {
    /// I/O error while reading firmware, scripts or profiles.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed hex line.
    #[error("line {line}: {message}")]
    Parse {
        /// 1-based line number in the hex text.
        line: usize,
        /// What was wrong with it.
        message: String,
    },
    /// Record check byte does not match its contents.
    #[error("line {line}: invalid check byte {actual:#04x}, should be {expected:#04x}")]
    RecordChecksum {
        /// 1-based line number in the hex text.
        line: usize,
        /// Check byte computed from the record fields.
        expected: u8,
        /// Check byte stored on the line.
        actual: u8,
    },
    /// No data record covers the address.
    #[error("address {0:#06x} is not covered by any data record")]
    AddressNotMapped(u32),
    /// The record used for checksum compensation does not exist.
    #[error("missing checksum record at address {0:#06x}")]
    MissingChecksumRecord(u32),
    /// Checksum compensation search exhausted every combination.
    #[error("could not restore checksum using record at {0:#06x}")]
    ChecksumRestoration(u32),
    /// Stored low sum differs from the computed one.
    #[error("stored low sum {stored:#06x} does not match computed sum {computed:#06x}")]
    LowSumMismatch {
        /// Value read from the image.
        stored: u16,
        /// Value computed over the summed range.
        computed: u16,
    },
    /// One or more patch lines failed.
    #[error("{0} patch line(s) failed")]
    PatchFailed(usize),

    /// USB device not found.
    #[error("{0}")]
    DeviceNotFound(String),
    /// Failed to list USB devices.
    #[error("failed to list usb devices: {0}")]
    UsbListFailure(rusb::Error),
    /// Failed to read a USB descriptor.
    #[error("failed to get usb descriptor: {0}")]
    UsbDescriptorFailure(rusb::Error),
    /// Failed to open USB device.
    #[error("failed to open usb device: {0}")]
    UsbOpenFailure(rusb::Error),
    /// Failed to claim USB interface.
    #[error("failed to claim usb interface {iface}: {source}")]
    UsbClaimInterfaceFailure {
        /// Interface number.
        iface: u8,
        /// Underlying libusb error.
        source: rusb::Error,
    },
    /// Failed to release USB interface.
    #[error("failed to release usb interface {iface}: {source}")]
    UsbReleaseInterfaceFailure {
        /// Interface number.
        iface: u8,
        /// Underlying libusb error.
        source: rusb::Error,
    },
    /// Failed to send the boot mode request.
    #[error("failed to send boot mode request: {0}")]
    UsbModeSwitchFailure(rusb::Error),
    /// Failed to read from USB bulk endpoint.
    #[error("failed to read bulk: {0}")]
    UsbReadBulkFailure(rusb::Error),
    /// Read data from USB does not match expected size.
    #[error("only received {actual} of {expected} bytes from device")]
    UsbReadBulkMismatch {
        /// Bytes the frame requires.
        expected: usize,
        /// Bytes actually received.
        actual: usize,
    },
    /// Failed to write to USB bulk endpoint.
    #[error("failed to write bulk: {0}")]
    UsbWriteBulkFailure(rusb::Error),
    /// Written data to USB does not match expected size.
    #[error("only sent {actual} of {expected} bytes to device")]
    UsbWriteBulkMismatch {
        /// Bytes the frame requires.
        expected: usize,
        /// Bytes actually sent.
        actual: usize,
    },

    /// Failed to serialize a loader message.
    #[error("message failed to binary serialize: {0}")]
    CmdSerializeFailure(bincode::Error),
    /// A loader message did not serialize to exactly one frame.
    #[error("message serialized to {0} bytes instead of a 64-byte frame")]
    CmdFrameSizeMismatch(usize),
    /// Failed to deserialize a loader message.
    #[error("message failed to binary deserialize: {0}")]
    CmdDeserializeFailure(bincode::Error),
    /// Device reported a failure status.
    #[error(transparent)]
    Status(#[from] StatusError),

    /// Loader operation issued in the wrong session state.
    #[error("cannot {operation} while loader is {state}")]
    InvalidLoaderState {
        /// What was attempted.
        operation: &'static str,
        /// State the session was in.
        state: String,
    },

    /// Data record lies beyond the last flash block.
    #[error("record address {0:#06x} too high")]
    BlockAddressTooHigh(u32),
    /// Data record does not start on a block boundary.
    #[error("record address {0:#06x} not 64-byte aligned")]
    BlockMisaligned(u32),

    /// Invalid device profile.
    #[error("configuration error: {0}")]
    Config(String),
}

impl KbdbootError {
    /// Whether this is a "device not found" condition, which callers may
    /// answer by looking for the device in another mode.
    pub fn is_device_not_found(&self) -> bool {
        matches!(self, Self::DeviceNotFound(_))
    }
}
