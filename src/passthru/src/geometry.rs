use thiserror::Error;

use crate::config::SUPPORTED_MD_SIZES;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("block size {requested} is smaller than the base block size {base}")]
    BlockSizeTooSmall { requested: u32, base: u32 },
    #[error("block size {requested} is not a multiple of the base block size {base}")]
    BlockSizeNotMultiple { requested: u32, base: u32 },
    #[error("metadata size {0} is not supported")]
    UnsupportedMdSize(u32),
}

/// A run of whole guest blocks inside the metadata region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockWindow {
    pub start_lba: u64,
    pub lba_count: u64,
}

impl BlockWindow {
    pub fn end(&self) -> u64 {
        self.start_lba + self.lba_count
    }
}

/// Fixed address arithmetic for one virtual device: guest addresses shift
/// past the reserved metadata prefix and scale by the block-size
/// multiplier; metadata lives at byte `g * md_len` for guest block `g`.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    /// Guest-visible block size in bytes.
    pub block_len: u32,
    /// Guest-visible block count, after the prefix reservation.
    pub block_count: u64,
    /// Guest blocks per base block span: `block_len / base_block_len`.
    pub multiplier: u64,
    /// Emulated metadata bytes per guest block.
    pub md_len: u32,
    /// Guest blocks reserved at the front of the base device.
    pub offset_start: u64,
}

impl Geometry {
    pub fn derive(
        base_block_len: u32,
        base_block_count: u64,
        base_md_len: u32,
        block_size: u32,
        md_size: u32,
    ) -> Result<Self, GeometryError> {
        let (multiplier, block_len, raw_count) = if block_size != 0 {
            if block_size < base_block_len {
                return Err(GeometryError::BlockSizeTooSmall {
                    requested: block_size,
                    base: base_block_len,
                });
            }
            if block_size % base_block_len != 0 {
                return Err(GeometryError::BlockSizeNotMultiple {
                    requested: block_size,
                    base: base_block_len,
                });
            }
            let multiplier = u64::from(block_size / base_block_len);
            (multiplier, block_size, base_block_count / multiplier)
        } else {
            (1, base_block_len, base_block_count)
        };

        if !SUPPORTED_MD_SIZES.contains(&md_size) {
            return Err(GeometryError::UnsupportedMdSize(md_size));
        }
        let md_len = if md_size != 0 { md_size } else { base_md_len };

        let md_bytes = raw_count * u64::from(md_len);
        let offset_start =
            md_bytes / u64::from(block_len) + u64::from(md_bytes % u64::from(block_len) != 0);

        Ok(Self {
            block_len,
            block_count: raw_count - offset_start,
            multiplier,
            md_len,
            offset_start,
        })
    }

    /// Base LBA backing guest LBA `lba`.
    pub fn base_lba(&self, lba: u64) -> u64 {
        (lba + self.offset_start) * self.multiplier
    }

    /// Base block count backing `num` guest blocks.
    pub fn base_count(&self, num: u64) -> u64 {
        num * self.multiplier
    }

    /// First metadata byte for guest LBA `lba`.
    pub fn md_byte_offset(&self, lba: u64) -> u64 {
        lba * u64::from(self.md_len)
    }

    /// Metadata bytes spanned by `num` guest blocks.
    pub fn md_byte_count(&self, num: u64) -> u64 {
        num * u64::from(self.md_len)
    }

    /// Whole guest blocks of the metadata region that must be written back
    /// for a dirty byte range. Over-covers on either misaligned edge, and
    /// never collapses to zero while metadata is configured.
    pub fn writeback_window(&self, byte_off: u64, byte_len: u64) -> BlockWindow {
        let bl = u64::from(self.block_len);
        let start_lba = byte_off / bl;
        let mut lba_count =
            byte_len / bl + u64::from(byte_len % bl != 0) + u64::from(byte_off % bl != 0);
        if lba_count == 0 && self.md_len != 0 {
            lba_count = 1;
        }
        BlockWindow { start_lba, lba_count }
    }

    /// Byte size of the in-memory shadow: the reserved prefix plus one
    /// block of slack for the window over-cover.
    pub fn shadow_len(&self) -> usize {
        ((self.offset_start + 1) * u64::from(self.block_len)) as usize
    }
}
