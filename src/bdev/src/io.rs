use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::buf::{DmaError, SharedBuf};

/// Block I/O operation kinds a device can be asked to perform.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IoType {
    Read,
    Write,
    WriteZeroes,
    Unmap,
    Flush,
    Reset,
    Abort,
    Zcopy,
    Copy,
}

/// Final status of a completed I/O.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IoStatus {
    Success,
    Failed,
}

impl IoStatus {
    pub fn is_success(self) -> bool {
        matches!(self, IoStatus::Success)
    }
}

/// Synchronous submission failures. `NoMemory` is transient: the caller may
/// park a wait entry on the channel and retry once capacity is signalled.
/// Everything else is terminal.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("out of I/O memory")]
    NoMemory,
    #[error("I/O type {0:?} not supported by device")]
    Unsupported(IoType),
    #[error("device has been removed")]
    Removed,
    #[error("I/O range out of bounds")]
    OutOfRange,
}

/// Opaque handle to a memory domain the data buffers live in. Carried
/// through unchanged by layered devices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoryDomain(pub u32);

/// Extended per-I/O options.
#[derive(Clone, Debug, Default)]
pub struct ExtIoOpts {
    pub memory_domain: Option<MemoryDomain>,
    /// Out-of-band metadata buffer accompanying the data, or `None`.
    pub metadata: Option<SharedBuf>,
}

/// Completion callback; receives the completed I/O so chained layers can
/// inspect device-bound buffers (zero-copy start rebinds through this).
pub type CompletionCb = Box<dyn FnOnce(&BlockIo, IoStatus) + Send>;

const STATUS_PENDING: u8 = 0;
const STATUS_SUCCESS: u8 = 1;
const STATUS_FAILED: u8 = 2;

struct IoInner {
    io_type: IoType,
    offset_blocks: u64,
    num_blocks: u64,
    copy_src_offset_blocks: u64,
    zcopy_populate: bool,
    iovs: Mutex<Vec<SharedBuf>>,
    opts: ExtIoOpts,
    abort_target: Option<BlockIo>,
    status: AtomicU8,
    completion: Mutex<Option<CompletionCb>>,
}

/// A single in-flight block I/O. Cheap to clone; completion fires at most
/// once no matter how many clones observe it.
#[derive(Clone)]
pub struct BlockIo {
    inner: Arc<IoInner>,
}

pub(crate) struct IoParams {
    pub io_type: IoType,
    pub offset_blocks: u64,
    pub num_blocks: u64,
    pub copy_src_offset_blocks: u64,
    pub zcopy_populate: bool,
    pub iovs: Vec<SharedBuf>,
    pub opts: ExtIoOpts,
    pub abort_target: Option<BlockIo>,
}

impl Default for IoParams {
    fn default() -> Self {
        Self {
            io_type: IoType::Read,
            offset_blocks: 0,
            num_blocks: 0,
            copy_src_offset_blocks: 0,
            zcopy_populate: false,
            iovs: Vec::new(),
            opts: ExtIoOpts::default(),
            abort_target: None,
        }
    }
}

impl BlockIo {
    pub(crate) fn new(params: IoParams, completion: CompletionCb) -> Self {
        Self {
            inner: Arc::new(IoInner {
                io_type: params.io_type,
                offset_blocks: params.offset_blocks,
                num_blocks: params.num_blocks,
                copy_src_offset_blocks: params.copy_src_offset_blocks,
                zcopy_populate: params.zcopy_populate,
                iovs: Mutex::new(params.iovs),
                opts: params.opts,
                abort_target: params.abort_target,
                status: AtomicU8::new(STATUS_PENDING),
                completion: Mutex::new(Some(completion)),
            }),
        }
    }

    pub fn io_type(&self) -> IoType {
        self.inner.io_type
    }

    pub fn offset_blocks(&self) -> u64 {
        self.inner.offset_blocks
    }

    pub fn num_blocks(&self) -> u64 {
        self.inner.num_blocks
    }

    pub fn copy_src_offset_blocks(&self) -> u64 {
        self.inner.copy_src_offset_blocks
    }

    pub fn zcopy_populate(&self) -> bool {
        self.inner.zcopy_populate
    }

    pub fn iovs(&self) -> Vec<SharedBuf> {
        self.inner.iovs.lock().clone()
    }

    /// Rebinds the first iovec to a device-owned buffer.
    pub fn set_iov0(&self, buf: SharedBuf) {
        let mut iovs = self.inner.iovs.lock();
        if iovs.is_empty() {
            iovs.push(buf);
        } else {
            iovs[0] = buf;
        }
    }

    pub fn opts(&self) -> &ExtIoOpts {
        &self.inner.opts
    }

    pub fn md_buf(&self) -> Option<&SharedBuf> {
        self.inner.opts.metadata.as_ref()
    }

    pub fn abort_target(&self) -> Option<&BlockIo> {
        self.inner.abort_target.as_ref()
    }

    /// Allocates a data buffer if the submitter did not provide one.
    pub fn ensure_data(&self, len: usize, align: usize) -> Result<(), DmaError> {
        let mut iovs = self.inner.iovs.lock();
        if iovs.is_empty() && len > 0 {
            iovs.push(SharedBuf::zeroed(len, align)?);
        }
        Ok(())
    }

    pub fn status(&self) -> Option<IoStatus> {
        match self.inner.status.load(Ordering::Acquire) {
            STATUS_SUCCESS => Some(IoStatus::Success),
            STATUS_FAILED => Some(IoStatus::Failed),
            _ => None,
        }
    }

    /// Completes the I/O. The first call wins; later calls are ignored.
    pub fn complete(&self, status: IoStatus) {
        let raw = match status {
            IoStatus::Success => STATUS_SUCCESS,
            IoStatus::Failed => STATUS_FAILED,
        };
        if self
            .inner
            .status
            .compare_exchange(STATUS_PENDING, raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("ignoring duplicate completion for {:?} I/O", self.io_type());
            return;
        }
        let cb = self.inner.completion.lock().take();
        if let Some(cb) = cb {
            cb(self, status);
        }
    }
}

impl std::fmt::Debug for BlockIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIo")
            .field("io_type", &self.inner.io_type)
            .field("offset_blocks", &self.inner.offset_blocks)
            .field("num_blocks", &self.inner.num_blocks)
            .field("status", &self.status())
            .finish()
    }
}
