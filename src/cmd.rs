use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::byte_sum;
use crate::error::{KbdbootError, Result};
use crate::{HALF_BLOCK_SIZE, LOADER_FRAME_SIZE, LOADER_MAGIC};

/// Status errors reported by the bootloader, in reporting priority order.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusError {
    /// Sum over the low ROM range does not match the stored sum.
    #[error("invalid checksum for the low ROM range")]
    BadLowSum,
    /// Flash contents differ from the frame payload.
    #[error("block verification failed for block {0}")]
    VerifyFailed(u8),
    /// The block is write protected.
    #[error("protected flash block error")]
    Protected,
    /// Frame check byte is wrong.
    #[error("invalid block checksum")]
    BadCheckSum,
    /// Magic number or ordinal fingerprint is wrong.
    #[error("invalid command header")]
    BadHeader,
    /// Command byte not recognized.
    #[error("invalid command")]
    BadCommand,
    /// No failure bit set, but the device is not ready for the next frame.
    #[error("device not in ready state")]
    NotReady,
    /// The exit command did not report success.
    #[error("final verification failed")]
    FinalVerifyFailed,
}

// see the bootloader's status byte: every response starts with a bit mask of
// these flags

/// Status flags in the first byte of a bootloader response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(u8);
impl Status {
    pub const SUCCESS: u8 = 0x01;
    /// Low ROM range checksum invalid
    pub const BAD_LOW_SUM: u8 = 0x02;
    pub const VERIFY_FAILED: u8 = 0x04;
    pub const PROTECTED: u8 = 0x08;
    pub const BAD_CHECKSUM: u8 = 0x10;
    pub const READY_TO_WRITE: u8 = 0x20;
    /// Bad magic number 0xff or ordinal numbers
    pub const BAD_HEADER: u8 = 0x40;
    pub const BAD_COMMAND: u8 = 0x80;

    /// Status from the raw first byte of a response.
    pub fn new(bits: u8) -> Self {
        Status(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Whether every bit of `flag` is set.
    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag == flag
    }

    /// Decodes the status for a frame addressed to `block_num`. Failure bits
    /// are checked before readiness.
    pub fn check(self, block_num: u8) -> std::result::Result<Self, StatusError> {
        let failures = [
            (Self::BAD_LOW_SUM, StatusError::BadLowSum),
            (Self::VERIFY_FAILED, StatusError::VerifyFailed(block_num)),
            (Self::PROTECTED, StatusError::Protected),
            (Self::BAD_CHECKSUM, StatusError::BadCheckSum),
            (Self::BAD_HEADER, StatusError::BadHeader),
            (Self::BAD_COMMAND, StatusError::BadCommand),
        ];
        if let Some((_, error)) = failures.into_iter().find(|&(flag, _)| self.contains(flag)) {
            return Err(error);
        }

        if !self.contains(Self::READY_TO_WRITE) {
            return Err(StatusError::NotReady);
        }

        Ok(self)
    }
}

/// Command byte of a loader message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoaderCommand {
    Enter = 0x38,
    Write = 0x39,
    Verify = 0x3A,
    Exit = 0x3B,
}
impl TryFrom<u8> for LoaderCommand {
    type Error = ();

    fn try_from(x: u8) -> std::result::Result<Self, Self::Error> {
        match x {
            x if x == Self::Enter as u8 => Ok(Self::Enter),
            x if x == Self::Write as u8 => Ok(Self::Write),
            x if x == Self::Verify as u8 => Ok(Self::Verify),
            x if x == Self::Exit as u8 => Ok(Self::Exit),
            _ => Err(()),
        }
    }
}

/// Byte offsets of the loader message fields on the wire.
pub mod offset {
    pub const MAGIC: usize = 0;
    pub const COMMAND: usize = 1;
    pub const ORDINAL: usize = 2;
    pub const BLOCK_NUM: usize = 11;
    pub const SECOND_HALF: usize = 12;
    pub const PAYLOAD: usize = 13;
    pub const CHECKSUM: usize = 45;
}

const ORDINAL: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Command frame for the keyboard bootloader.
///
/// Serializes field by field to exactly [`LOADER_FRAME_SIZE`] bytes. Every
/// setter recomputes the check byte, so a message is always consistent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoaderMessage {
    /// Magic number ([`LOADER_MAGIC`]).
    magic: u8,
    /// Command ID ([`LoaderCommand`]).
    command: u8,
    /// Fixed fingerprint, always 0 through 7.
    ordinal: [u8; 8],
    /// Reserved space
    _pad1: u8,
    /// Flash block the payload belongs to.
    block_num: u8,
    /// 0 or 1 for the first or second 32 bytes of the block.
    second_half: u8,
    payload: [u8; HALF_BLOCK_SIZE],
    /// Low byte of the sum of every byte before it.
    checksum: u8,
    /// Reserved space
    _pad2: [u8; 18],
}
impl LoaderMessage {
    /// Creates a message with a zero payload.
    pub fn new(command: LoaderCommand, block_num: u8, second_half: bool) -> Self {
        let mut msg = LoaderMessage {
            magic: LOADER_MAGIC,
            command: command as u8,
            ordinal: ORDINAL,
            _pad1: 0,
            block_num,
            second_half: second_half.into(),
            payload: [0; HALF_BLOCK_SIZE],
            checksum: 0,
            _pad2: [0; 18],
        };
        msg.update_checksum();
        msg
    }

    /// Creates a control frame (enter or exit).
    pub fn control(command: LoaderCommand) -> Self {
        Self::new(command, 0, false)
    }

    /// Creates a write or verify frame carrying half of a block.
    pub fn data(command: LoaderCommand, block_num: u8, second_half: bool, payload: &[u8]) -> Self {
        let mut msg = Self::new(command, block_num, second_half);
        msg.set_payload(payload);
        msg
    }

    /// The command byte, if it names a known command.
    pub fn command(&self) -> Option<LoaderCommand> {
        self.command.try_into().ok()
    }

    pub fn block_num(&self) -> u8 {
        self.block_num
    }

    pub fn second_half(&self) -> bool {
        self.second_half != 0
    }

    pub fn payload(&self) -> &[u8; HALF_BLOCK_SIZE] {
        &self.payload
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Sets the command byte. Like every setter, this keeps the check byte current.
    pub fn set_command(&mut self, command: LoaderCommand) {
        self.command = command as u8;
        self.update_checksum();
    }

    pub fn set_block_num(&mut self, block_num: u8) {
        self.block_num = block_num;
        self.update_checksum();
    }

    pub fn set_second_half(&mut self, second_half: bool) {
        self.second_half = second_half.into();
        self.update_checksum();
    }

    /// Copies up to 32 bytes into the payload; the rest stays as it was.
    pub fn set_payload(&mut self, payload: &[u8]) {
        let len = payload.len().min(HALF_BLOCK_SIZE);
        self.payload[..len].copy_from_slice(&payload[..len]);
        self.update_checksum();
    }

    fn expected_checksum(&self) -> u8 {
        let header = [
            self.magic,
            self.command,
            byte_sum(&self.ordinal),
            self._pad1,
            self.block_num,
            self.second_half,
            byte_sum(&self.payload),
        ];
        byte_sum(&header)
    }

    fn update_checksum(&mut self) {
        self.checksum = self.expected_checksum();
    }

    /// Whether the header fingerprint and check byte are intact.
    pub fn is_well_formed(&self) -> bool {
        self.magic == LOADER_MAGIC
            && self.ordinal == ORDINAL
            && self.checksum == self.expected_checksum()
    }

    /// Serializes the message into one wire frame.
    pub fn to_bytes(&self) -> Result<[u8; LOADER_FRAME_SIZE]> {
        let bytes = bincode::serialize(self).map_err(KbdbootError::CmdSerializeFailure)?;
        into_frame(bytes)
    }

    /// Decodes a wire frame without checking magic or check byte; see `is_well_formed`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(KbdbootError::CmdDeserializeFailure)
    }
}

fn into_frame(bytes: Vec<u8>) -> Result<[u8; LOADER_FRAME_SIZE]> {
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| KbdbootError::CmdFrameSizeMismatch(v.len()))
}
