//! Bootloader session state machine.
//!
//! A session enters the bootloader, sends every eligible block of the image
//! as two half-block frames, and exits. Each frame is answered by a status
//! frame whose first byte is a [`Status`] mask; any failure ends the session.
//!
//! ```text
//! Idle -> Entering -> Active -> Exiting -> Done
//!    \________\__________\_________\_____> Failed
//! ```

use std::fmt;

use log::{debug, info};

use crate::cmd::{LoaderCommand, LoaderMessage, Status, StatusError};
use crate::error::{KbdbootError, Result};
use crate::image::{HexImage, RecordType};
use crate::{BLOCK_SIZE, HALF_BLOCK_SIZE, LOADER_FRAME_SIZE, MAX_BLOCK_NUM};

/// Moves fixed-size frames to and from a bootloader.
pub trait FrameTransport {
    /// Sends one frame; fewer bytes accepted than the frame size is an error.
    fn send_frame(&mut self, frame: &[u8; LOADER_FRAME_SIZE]) -> Result<()>;
    /// Receives one full frame.
    fn recv_frame(&mut self) -> Result<[u8; LOADER_FRAME_SIZE]>;
}

impl<P: FrameTransport + ?Sized> FrameTransport for &mut P {
    fn send_frame(&mut self, frame: &[u8; LOADER_FRAME_SIZE]) -> Result<()> {
        (**self).send_frame(frame)
    }

    fn recv_frame(&mut self) -> Result<[u8; LOADER_FRAME_SIZE]> {
        (**self).recv_frame()
    }
}

/// Whether blocks are programmed or only compared against flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pass {
    #[default]
    Write,
    Verify,
}
impl Pass {
    /// Command each half block is sent with.
    pub fn command(self) -> LoaderCommand {
        match self {
            Pass::Write => LoaderCommand::Write,
            Pass::Verify => LoaderCommand::Verify,
        }
    }

    /// Word for log messages.
    pub fn verb(self) -> &'static str {
        match self {
            Pass::Write => "Writing",
            Pass::Verify => "Verifying",
        }
    }
}

/// Where a loader session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Idle,
    Entering,
    /// Inside the bootloader; `block` is the last block sent, if any.
    Active {
        block: Option<u8>,
    },
    Exiting,
    Done,
    Failed,
}
impl fmt::Display for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderState::Idle => write!(f, "idle"),
            LoaderState::Entering => write!(f, "entering"),
            LoaderState::Active { block: None } => write!(f, "active"),
            LoaderState::Active { block: Some(n) } => write!(f, "active (block {n})"),
            LoaderState::Exiting => write!(f, "exiting"),
            LoaderState::Done => write!(f, "done"),
            LoaderState::Failed => write!(f, "failed"),
        }
    }
}

/// One 64-byte flash block taken from the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashBlock {
    pub block_num: u8,
    pub address: u32,
    pub data: [u8; BLOCK_SIZE],
}
impl FlashBlock {
    /// The two halves, in the order they are sent.
    pub fn halves(&self) -> impl Iterator<Item = (bool, &[u8])> {
        self.data
            .chunks(HALF_BLOCK_SIZE)
            .enumerate()
            .map(|(i, half)| (i == 1, half))
    }
}

/// Selects the blocks of `image` to send to the bootloader.
///
/// Only full 64-byte data records outside any segment are uploaded; records
/// of another length are skipped, and blocks listed in `reserved` are never
/// sent.
pub fn plan_blocks(image: &HexImage, reserved: &[u8]) -> Result<Vec<FlashBlock>> {
    let mut blocks = Vec::new();
    let mut segment = 0u32;

    for record in image.records() {
        match record.kind() {
            RecordType::ExtendedSegmentAddress => {
                segment = record.segment_offset().unwrap_or(segment);
                debug!("New segment starting at {segment:#06x}");
            }
            RecordType::EndOfFile => break,
            RecordType::Data => {
                if segment > 0 {
                    continue;
                }

                let address = record.absolute_address();
                let Ok(data) = <[u8; BLOCK_SIZE]>::try_from(record.data()) else {
                    info!(
                        "Skipping record at {address:#06x} with invalid length {}",
                        record.len()
                    );
                    continue;
                };

                if address > (BLOCK_SIZE as u32) * u32::from(MAX_BLOCK_NUM) {
                    return Err(KbdbootError::BlockAddressTooHigh(address));
                }
                if address % BLOCK_SIZE as u32 != 0 {
                    return Err(KbdbootError::BlockMisaligned(address));
                }

                // bounded by the address check above
                let block_num = (address / BLOCK_SIZE as u32) as u8;
                if reserved.contains(&block_num) {
                    debug!("Skipping reserved block #{block_num}");
                    continue;
                }

                blocks.push(FlashBlock {
                    block_num,
                    address,
                    data,
                });
            }
        }
    }

    Ok(blocks)
}

/// A bootloader session over some frame transport.
#[derive(Debug)]
pub struct Loader<P: FrameTransport> {
    port: P,
    state: LoaderState,
}
impl<P: FrameTransport> Loader<P> {
    /// Starts an idle session on `port`.
    pub fn new(port: P) -> Self {
        Loader {
            port,
            state: LoaderState::Idle,
        }
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// Gives the transport back.
    pub fn into_inner(self) -> P {
        self.port
    }

    fn expect_state(&self, operation: &'static str, ok: bool) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(KbdbootError::InvalidLoaderState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    fn tracked<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let res = f(self);
        if res.is_err() {
            self.state = LoaderState::Failed;
        }
        res
    }

    /// Sends one message and decodes the device's answer.
    fn transact(&mut self, msg: &LoaderMessage) -> Result<Status> {
        let bytes = msg.to_bytes()?;
        debug!("Sending loader message to device: {bytes:02x?}");
        self.port.send_frame(&bytes)?;

        let response = self.port.recv_frame()?;
        debug!("Received loader response from device: {response:02x?}");

        let status = Status::new(response[0]);
        debug!("Response status {:#04x}/{:08b}", status.bits(), status.bits());

        Ok(status.check(msg.block_num())?)
    }

    /// Sends `Enter` and waits for the bootloader to be ready to write.
    pub fn enter(&mut self) -> Result<()> {
        self.expect_state("enter", self.state == LoaderState::Idle)?;
        self.tracked(|this| {
            this.state = LoaderState::Entering;
            this.transact(&LoaderMessage::control(LoaderCommand::Enter))?;
            this.state = LoaderState::Active { block: None };
            Ok(())
        })
    }

    /// Sends both halves of a block with the pass's command.
    pub fn send_block(&mut self, block: &FlashBlock, pass: Pass) -> Result<()> {
        self.expect_state("send blocks", matches!(self.state, LoaderState::Active { .. }))?;
        self.tracked(|this| {
            debug!("{} block #{} at {:#06x}", pass.verb(), block.block_num, block.address);
            for (second_half, half) in block.halves() {
                let msg = LoaderMessage::data(pass.command(), block.block_num, second_half, half);
                this.transact(&msg)?;
            }
            this.state = LoaderState::Active {
                block: Some(block.block_num),
            };
            Ok(())
        })
    }

    /// Leaves the bootloader. The device must report success, which means
    /// its final verification of the whole flash passed.
    pub fn exit(&mut self) -> Result<()> {
        self.expect_state("exit", matches!(self.state, LoaderState::Active { .. }))?;
        self.tracked(|this| {
            this.state = LoaderState::Exiting;
            let status = this.transact(&LoaderMessage::control(LoaderCommand::Exit))?;
            if !status.contains(Status::SUCCESS) {
                return Err(StatusError::FinalVerifyFailed.into());
            }
            this.state = LoaderState::Done;
            Ok(())
        })
    }

    /// Runs a whole session: enter, every block, exit. `progress` is called
    /// with (blocks done, blocks total) after each block.
    pub fn run(
        &mut self,
        blocks: &[FlashBlock],
        pass: Pass,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        self.enter()?;
        for (i, block) in blocks.iter().enumerate() {
            self.send_block(block, pass)?;
            progress(i + 1, blocks.len());
        }
        self.exit()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::image::tests::sample_image;
    use crate::image::Record;

    const READY: u8 = Status::READY_TO_WRITE;
    const DONE: u8 = Status::READY_TO_WRITE | Status::SUCCESS;

    /// Bootloader stand-in: records every frame and answers from a script,
    /// falling back to ready (and success on exit).
    #[derive(Default)]
    struct MockLoader {
        sent: Vec<LoaderMessage>,
        script: VecDeque<u8>,
    }
    impl FrameTransport for MockLoader {
        fn send_frame(&mut self, frame: &[u8; LOADER_FRAME_SIZE]) -> Result<()> {
            let msg = LoaderMessage::from_bytes(frame)?;
            assert!(msg.is_well_formed());
            self.sent.push(msg);
            Ok(())
        }

        fn recv_frame(&mut self) -> Result<[u8; LOADER_FRAME_SIZE]> {
            let last = self.sent.last().and_then(LoaderMessage::command);
            let status = self.script.pop_front().unwrap_or(match last {
                Some(LoaderCommand::Exit) => DONE,
                _ => READY,
            });
            let mut frame = [0; LOADER_FRAME_SIZE];
            frame[0] = status;
            Ok(frame)
        }
    }

    fn commands(mock: &MockLoader) -> Vec<LoaderCommand> {
        mock.sent.iter().filter_map(LoaderMessage::command).collect()
    }

    #[test]
    fn test_plan_blocks() {
        let image = sample_image();
        let blocks = plan_blocks(&image, &[76, 78, 127]).unwrap();

        // 0x2000 / 64 blocks in segment 0, minus the reserved ones
        assert_eq!(blocks.len(), 128 - 3);
        assert_eq!(blocks[0].block_num, 0);
        assert_eq!(blocks[0].data[5], 5);
        assert!(blocks.iter().all(|b| u32::from(b.block_num) * 64 == b.address));
    }

    #[test]
    fn test_plan_blocks_skips_short_records() {
        let image = HexImage::from_records([
            Record::new(RecordType::Data, 0x0000, vec![1; 64]),
            Record::new(RecordType::Data, 0x0040, vec![2; 16]),
            Record::new(RecordType::Data, 0x0080, vec![3; 64]),
            Record::new(RecordType::EndOfFile, 0, vec![]),
            Record::new(RecordType::Data, 0x00C0, vec![4; 64]),
        ]);
        let blocks = plan_blocks(&image, &[]).unwrap();
        assert_eq!(blocks.iter().map(|b| b.block_num).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_plan_blocks_rejects_bad_addresses() {
        let misaligned = HexImage::from_records([Record::new(RecordType::Data, 0x0010, vec![0; 64])]);
        assert!(matches!(
            plan_blocks(&misaligned, &[]),
            Err(KbdbootError::BlockMisaligned(0x0010))
        ));

        let high = HexImage::from_records([Record::new(RecordType::Data, 0x4000, vec![0; 64])]);
        assert!(matches!(
            plan_blocks(&high, &[]),
            Err(KbdbootError::BlockAddressTooHigh(0x4000))
        ));

        let last = HexImage::from_records([Record::new(RecordType::Data, 0x3FC0, vec![0; 64])]);
        assert_eq!(plan_blocks(&last, &[]).unwrap()[0].block_num, 255);
    }

    #[test]
    fn test_reserved_blocks_never_sent() {
        let reserved = [0, 1, 76, 78, 127];
        let image = sample_image();
        let blocks = plan_blocks(&image, &reserved).unwrap();

        let mut loader = Loader::new(MockLoader::default());
        loader.run(&blocks, Pass::Write, &mut |_, _| {}).unwrap();
        assert_eq!(loader.state(), LoaderState::Done);

        let mock = loader.into_inner();
        let data = mock
            .sent
            .iter()
            .filter(|m| m.command() == Some(LoaderCommand::Write))
            .collect::<Vec<_>>();
        assert_eq!(data.len(), 2 * (128 - reserved.len()));
        assert!(data.iter().all(|m| !reserved.contains(&m.block_num())));
    }

    #[test]
    fn test_session_frame_sequence() {
        let image = sample_image();
        let blocks = plan_blocks(&image, &[]).unwrap();
        let mut done = Vec::new();

        let mut mock = MockLoader::default();
        let mut loader = Loader::new(&mut mock);
        loader
            .run(&blocks[..2], Pass::Verify, &mut |n, total| done.push((n, total)))
            .unwrap();
        assert_eq!(done, vec![(1, 2), (2, 2)]);

        assert_eq!(
            commands(&mock),
            vec![
                LoaderCommand::Enter,
                LoaderCommand::Verify,
                LoaderCommand::Verify,
                LoaderCommand::Verify,
                LoaderCommand::Verify,
                LoaderCommand::Exit,
            ]
        );

        let first = &mock.sent[1];
        let second = &mock.sent[2];
        assert_eq!(first.block_num(), 0);
        assert!(!first.second_half());
        assert!(second.second_half());
        assert_eq!(first.payload()[..], blocks[0].data[..32]);
        assert_eq!(second.payload()[..], blocks[0].data[32..]);
        assert_eq!(mock.sent[3].block_num(), 1);
    }

    #[test]
    fn test_status_error_aborts() {
        let image = sample_image();
        let blocks = plan_blocks(&image, &[]).unwrap();

        let mut mock = MockLoader::default();
        mock.script = [READY, READY, READY, Status::VERIFY_FAILED | READY].into();
        let mut loader = Loader::new(&mut mock);

        let err = loader.run(&blocks, Pass::Verify, &mut |_, _| {}).unwrap_err();
        assert!(matches!(err, KbdbootError::Status(StatusError::VerifyFailed(1))));
        assert_eq!(loader.state(), LoaderState::Failed);

        // no retry and nothing after the failing frame
        assert_eq!(mock.sent.len(), 4);
    }

    #[test]
    fn test_not_ready_aborts() {
        let mut mock = MockLoader::default();
        mock.script = [0].into();
        let mut loader = Loader::new(&mut mock);
        assert!(matches!(
            loader.enter(),
            Err(KbdbootError::Status(StatusError::NotReady))
        ));
        assert_eq!(loader.state(), LoaderState::Failed);
    }

    #[test]
    fn test_exit_requires_success() {
        let mut mock = MockLoader::default();
        mock.script = [READY, READY].into();
        let mut loader = Loader::new(&mut mock);
        loader.enter().unwrap();
        assert!(matches!(
            loader.exit(),
            Err(KbdbootError::Status(StatusError::FinalVerifyFailed))
        ));
        assert_eq!(loader.state(), LoaderState::Failed);
    }

    #[test]
    fn test_state_is_enforced() {
        let mut loader = Loader::new(MockLoader::default());
        let block = FlashBlock {
            block_num: 3,
            address: 0xC0,
            data: [0; 64],
        };
        assert!(matches!(
            loader.send_block(&block, Pass::Write),
            Err(KbdbootError::InvalidLoaderState { .. })
        ));
        assert!(matches!(loader.exit(), Err(KbdbootError::InvalidLoaderState { .. })));
        assert_eq!(loader.state(), LoaderState::Idle);

        loader.enter().unwrap();
        loader.send_block(&block, Pass::Write).unwrap();
        assert_eq!(loader.state(), LoaderState::Active { block: Some(3) });
        assert!(matches!(loader.enter(), Err(KbdbootError::InvalidLoaderState { .. })));
    }
}
