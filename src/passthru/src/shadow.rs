use bdev::{DmaBuf, DmaError, HUGEPAGE_ALIGN};
use parking_lot::Mutex;

/// In-memory mirror of the on-disk metadata prefix. One writer mutates a
/// given byte range at a time (the dispatcher serialises overlapping
/// writes), so the lock is only ever briefly contended; it is never held
/// across a base-device submission.
pub struct MetadataShadow {
    buf: Mutex<DmaBuf>,
}

impl MetadataShadow {
    /// Allocates a zeroed shadow of `len` bytes, hugepage aligned.
    pub fn new(len: usize) -> Result<Self, DmaError> {
        Ok(Self {
            buf: Mutex::new(DmaBuf::zeroed(len, HUGEPAGE_ALIGN)?),
        })
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `src` into the shadow at `byte_off`.
    pub fn splice_in(&self, byte_off: u64, src: &[u8]) {
        let mut buf = self.buf.lock();
        let off = byte_off as usize;
        buf[off..off + src.len()].copy_from_slice(src);
    }

    /// Copies shadow bytes at `byte_off` out into `dst`.
    pub fn read_out(&self, byte_off: u64, dst: &mut [u8]) {
        let buf = self.buf.lock();
        let off = byte_off as usize;
        dst.copy_from_slice(&buf[off..off + dst.len()]);
    }

    /// Under a single lock hold: splices `src` in at `byte_off`, then
    /// snapshots the write-back window starting at `window_byte_off` into
    /// `bounce`. The caller issues the write-back from the snapshot, so
    /// the shadow may mutate freely once this returns.
    pub fn splice_and_snapshot(
        &self,
        byte_off: u64,
        src: &[u8],
        window_byte_off: u64,
        bounce: &mut DmaBuf,
    ) {
        let mut buf = self.buf.lock();
        let off = byte_off as usize;
        buf[off..off + src.len()].copy_from_slice(src);
        let win = window_byte_off as usize;
        let bounce_len = bounce.len();
        bounce.copy_from_slice(&buf[win..win + bounce_len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_then_read_roundtrip() {
        let shadow = MetadataShadow::new(4096).unwrap();
        shadow.splice_in(80, &[0x11, 0x22, 0x33, 0x44]);
        let mut out = [0u8; 4];
        shadow.read_out(80, &mut out);
        assert_eq!(out, [0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn snapshot_sees_the_spliced_bytes() {
        let shadow = MetadataShadow::new(8192).unwrap();
        shadow.splice_in(0, &[0xee; 16]);
        let mut bounce = DmaBuf::zeroed(4096, 64).unwrap();
        shadow.splice_and_snapshot(4096 + 8, &[1, 2, 3, 4, 5, 6, 7, 8], 4096, &mut bounce);
        assert_eq!(&bounce[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(bounce[..8].iter().all(|b| *b == 0));
    }

    #[test]
    fn later_splices_do_not_touch_earlier_snapshots() {
        let shadow = MetadataShadow::new(4096).unwrap();
        let mut bounce = DmaBuf::zeroed(64, 64).unwrap();
        shadow.splice_and_snapshot(0, &[9; 8], 0, &mut bounce);
        shadow.splice_in(0, &[1; 8]);
        assert_eq!(&bounce[..8], &[9; 8]);
    }
}
