//! Device profiles.
//!
//! A profile collects everything that is specific to one keyboard model: USB
//! identities, endpoints, protected flash blocks and the checksums its
//! bootloader expects. The built-in default describes the supported
//! keyboard; other models can be described in a TOML file:
//!
//! ```toml
//! vendor-id = 0x05ac
//! keyboard-product-ids = [0x0220, 0x024f]
//! loader-product-ids = [0x0228]
//! reserved-blocks = [76, 78, 127]
//! image-checksum = 0x1057f8
//!
//! [low-sum]
//! begin = 0x0080
//! end = 0x1300
//! stored-at = 0x1300
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{KbdbootError, Result};
use crate::image::LowSumLayout;
use crate::{
    CHECKSUM_COMPENSATION_BYTES, IMAGE_TEXT_CHECKSUM, KBD_LOADER_PID, KBD_PIDS, KBD_VID,
    MAX_COMPENSATION_BYTES,
};

/// Everything that varies between keyboard models: USB identities,
/// endpoints, timing, the reserved blocks and the checksum constants.
///
/// Loaded from TOML with kebab-case keys; missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceProfile {
    /// USB vendor ID in both modes.
    pub vendor_id: u16,
    /// Product IDs of the keyboard in normal mode.
    pub keyboard_product_ids: Vec<u16>,
    /// Product IDs of the keyboard in bootloader mode.
    pub loader_product_ids: Vec<u16>,
    /// Interface claimed for the mode switch and the loader endpoints.
    pub interface: u8,
    /// Bulk OUT endpoint for commands.
    pub command_endpoint: u8,
    /// Bulk IN endpoint for status.
    pub status_endpoint: u8,
    /// Flash blocks that are never written or verified.
    pub reserved_blocks: Vec<u8>,
    pub low_sum: LowSumLayout,
    /// Sum of every character of a good firmware file (low 24 bits).
    pub image_checksum: u32,
    /// Trailing bytes of the checksum record available for compensation.
    pub compensation_bytes: usize,
    pub transfer_timeout_ms: u64,
    pub control_timeout_ms: u64,
    /// Wait for the keyboard to re-enumerate after a mode switch.
    pub settle_ms: u64,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        DeviceProfile {
            vendor_id: KBD_VID,
            keyboard_product_ids: KBD_PIDS.to_vec(),
            loader_product_ids: vec![KBD_LOADER_PID],
            interface: 0,
            command_endpoint: 0x02,
            status_endpoint: 0x81,
            reserved_blocks: vec![76, 78, 127],
            low_sum: LowSumLayout::default(),
            image_checksum: IMAGE_TEXT_CHECKSUM,
            compensation_bytes: CHECKSUM_COMPENSATION_BYTES,
            transfer_timeout_ms: 8000,
            control_timeout_ms: 5000,
            settle_ms: 2000,
        }
    }
}

impl DeviceProfile {
    /// Parses and validates a profile.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let profile: DeviceProfile =
            toml::from_str(text).map_err(|e| KbdbootError::Config(e.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    /// Reads a profile file. See [`DeviceProfile::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self> {
        debug!("loading device profile from {}", path.display());
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Loads `path` when given, otherwise returns the built-in profile.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Rejects values the tools cannot work with.
    pub fn validate(&self) -> Result<()> {
        self.low_sum.validate()?;

        if !(1..=MAX_COMPENSATION_BYTES).contains(&self.compensation_bytes) {
            return Err(KbdbootError::Config(format!(
                "compensation-bytes must be between 1 and {MAX_COMPENSATION_BYTES}"
            )));
        }
        if self.loader_product_ids.is_empty() {
            return Err(KbdbootError::Config("loader-product-ids is empty".into()));
        }
        if self.command_endpoint & 0x80 != 0 || self.status_endpoint & 0x80 == 0 {
            return Err(KbdbootError::Config(
                "command-endpoint must be OUT and status-endpoint must be IN".into(),
            ));
        }
        Ok(())
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}
