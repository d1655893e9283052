use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

/// Alignment used for buffers that must be backed by hugepages.
pub const HUGEPAGE_ALIGN: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("allocation of {size} bytes (align {align}) failed")]
    NoMemory { size: usize, align: usize },
    #[error("invalid allocation layout: {size} bytes, align {align}")]
    BadLayout { size: usize, align: usize },
}

/// Zero-filled byte buffer with an explicit alignment, standing in for a
/// DMA-capable allocation. Allocation is fallible; callers treat failure
/// as a transient out-of-memory condition.
pub struct DmaBuf {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// The buffer is uniquely owned plain memory.
unsafe impl Send for DmaBuf {}
unsafe impl Sync for DmaBuf {}

impl DmaBuf {
    pub fn zeroed(size: usize, align: usize) -> Result<Self, DmaError> {
        let layout =
            Layout::from_size_align(size.max(1), align).map_err(|_| DmaError::BadLayout {
                size,
                align,
            })?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(DmaError::NoMemory { size, align })?;
        Ok(Self { ptr, size, layout })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Deref for DmaBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }
}

impl DerefMut for DmaBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf")
            .field("size", &self.size)
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Clonable handle to a buffer travelling with an I/O. Clones share the
/// underlying storage; rebinding an iovec to a device-owned buffer is a
/// clone of this handle.
#[derive(Clone, Debug)]
pub struct SharedBuf(Arc<Mutex<DmaBuf>>);

impl SharedBuf {
    pub fn zeroed(size: usize, align: usize) -> Result<Self, DmaError> {
        Ok(Self(Arc::new(Mutex::new(DmaBuf::zeroed(size, align)?))))
    }

    /// Buffer initialised with a copy of `bytes`, at the default alignment.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DmaError> {
        let buf = Self::zeroed(bytes.len(), 64)?;
        buf.lock()[..bytes.len()].copy_from_slice(bytes);
        Ok(buf)
    }

    pub fn from_dma(buf: DmaBuf) -> Self {
        Self(Arc::new(Mutex::new(buf)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lock(&self) -> MutexGuard<'_, DmaBuf> {
        self.0.lock()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().to_vec()
    }
}
