use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-block metadata sizes the layer can emulate.
pub const SUPPORTED_MD_SIZES: [u32; 6] = [0, 8, 16, 32, 64, 128];

/// How the reserved metadata prefix is brought up at attach.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataInit {
    /// Hydrate the in-memory shadow from the on-disk prefix.
    #[default]
    Restore,
    /// Zero the on-disk prefix; the shadow starts empty.
    Zero,
}

/// Creation parameters for one virtual device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PassthruConfig {
    pub base_bdev_name: String,
    pub name: String,
    /// Explicit UUID; derived from the base device's UUID when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    /// Logical block size exposed upward. 0 inherits the base block size;
    /// otherwise it must be a multiple of it.
    #[serde(default)]
    pub block_size: u32,
    /// Emulated per-block metadata bytes. 0 inherits the base's native
    /// metadata size.
    #[serde(default)]
    pub md_size: u32,
    #[serde(default)]
    pub mode: MetadataInit,
}

impl PassthruConfig {
    pub fn new(base_bdev_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            base_bdev_name: base_bdev_name.into(),
            name: name.into(),
            uuid: None,
            block_size: 0,
            md_size: 0,
            mode: MetadataInit::default(),
        }
    }
}
