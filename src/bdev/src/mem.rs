//! RAM-backed block device. Serves as the base device under layered
//! modules in tests: completes inline on the submitting thread, keeps a
//! sparse backing store so huge geometries stay cheap, and can inject
//! out-of-memory and failure conditions on demand.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::buf::SharedBuf;
use crate::device::{Bdev, BdevOps, BdevProps, IoChannel};
use crate::io::{BlockIo, IoStatus, IoType, SubmitError};
use crate::registry::{self, RegisterError};

pub const MEM_MODULE_NAME: &str = "mem";

/// One observed submission attempt, including attempts rejected with
/// `NoMemory`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubmitRecord {
    pub io_type: IoType,
    pub offset_blocks: u64,
    pub num_blocks: u64,
}

#[derive(Default)]
struct Inject {
    nomem_remaining: u32,
    fail_skip: u32,
    fail_remaining: u32,
}

struct MemInner {
    block_len: u32,
    block_count: u64,
    store: Mutex<HashMap<u64, Box<[u8]>>>,
    inject: Mutex<Inject>,
    submissions: Mutex<Vec<SubmitRecord>>,
    channels: Mutex<Vec<IoChannel>>,
}

impl MemInner {
    fn read_region(&self, offset: u64, num: u64) -> Vec<u8> {
        let bl = self.block_len as usize;
        let mut out = vec![0u8; num as usize * bl];
        let store = self.store.lock();
        for i in 0..num {
            if let Some(block) = store.get(&(offset + i)) {
                out[i as usize * bl..][..bl].copy_from_slice(block);
            }
        }
        out
    }

    fn write_region(&self, offset: u64, data: &[u8]) {
        let bl = self.block_len as usize;
        let mut store = self.store.lock();
        for (i, chunk) in data.chunks(bl).enumerate() {
            let mut block = vec![0u8; bl];
            block[..chunk.len()].copy_from_slice(chunk);
            store.insert(offset + i as u64, block.into_boxed_slice());
        }
    }

    fn clear_region(&self, offset: u64, num: u64) {
        let mut store = self.store.lock();
        for i in 0..num {
            store.remove(&(offset + i));
        }
    }
}

fn gather(iovs: &[SharedBuf], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for iov in iovs {
        if out.len() >= len {
            break;
        }
        let guard = iov.lock();
        let take = guard.len().min(len - out.len());
        out.extend_from_slice(&guard[..take]);
    }
    if out.len() < len {
        warn!("short data buffer: have {}, need {}", out.len(), len);
        out.resize(len, 0);
    }
    out
}

fn scatter(iovs: &[SharedBuf], data: &[u8]) {
    let mut off = 0;
    for iov in iovs {
        if off >= data.len() {
            break;
        }
        let mut guard = iov.lock();
        let take = guard.len().min(data.len() - off);
        guard[..take].copy_from_slice(&data[off..off + take]);
        off += take;
    }
}

struct MemOps(Arc<MemInner>);

impl BdevOps for MemOps {
    fn submit_request(&self, _channel: &IoChannel, io: BlockIo) -> Result<(), SubmitError> {
        let inner = &self.0;
        inner.submissions.lock().push(SubmitRecord {
            io_type: io.io_type(),
            offset_blocks: io.offset_blocks(),
            num_blocks: io.num_blocks(),
        });

        {
            let mut inject = inner.inject.lock();
            if inject.nomem_remaining > 0 {
                inject.nomem_remaining -= 1;
                return Err(SubmitError::NoMemory);
            }
            if inject.fail_skip > 0 {
                inject.fail_skip -= 1;
            } else if inject.fail_remaining > 0 {
                inject.fail_remaining -= 1;
                drop(inject);
                io.complete(IoStatus::Failed);
                return Ok(());
            }
        }

        let offset = io.offset_blocks();
        let num = io.num_blocks();
        let needs_range = !matches!(io.io_type(), IoType::Reset | IoType::Abort);
        if needs_range && offset.checked_add(num).map_or(true, |end| end > inner.block_count) {
            return Err(SubmitError::OutOfRange);
        }

        let bl = inner.block_len as usize;
        match io.io_type() {
            IoType::Read => {
                let data = inner.read_region(offset, num);
                scatter(&io.iovs(), &data);
            }
            IoType::Write => {
                let data = gather(&io.iovs(), num as usize * bl);
                inner.write_region(offset, &data);
            }
            IoType::WriteZeroes | IoType::Unmap => {
                inner.clear_region(offset, num);
            }
            IoType::Flush | IoType::Reset | IoType::Abort => {}
            IoType::Copy => {
                let src = io.copy_src_offset_blocks();
                if src.checked_add(num).map_or(true, |end| end > inner.block_count) {
                    return Err(SubmitError::OutOfRange);
                }
                let data = inner.read_region(src, num);
                inner.write_region(offset, &data);
            }
            IoType::Zcopy => {
                let buf = match SharedBuf::zeroed(num as usize * bl, 64) {
                    Ok(buf) => buf,
                    Err(_) => {
                        io.complete(IoStatus::Failed);
                        return Ok(());
                    }
                };
                if io.zcopy_populate() {
                    let data = inner.read_region(offset, num);
                    buf.lock().copy_from_slice(&data);
                }
                io.set_iov0(buf);
            }
        }

        io.complete(IoStatus::Success);
        Ok(())
    }

    fn io_type_supported(&self, _io_type: IoType) -> bool {
        true
    }

    fn create_channel(&self) -> IoChannel {
        let channel = IoChannel::new(());
        self.0.channels.lock().push(channel.clone());
        channel
    }

    fn destruct(&self) {
        for channel in self.0.channels.lock().drain(..) {
            channel.close();
        }
        self.0.store.lock().clear();
    }

    fn dump_info(&self) -> serde_json::Value {
        serde_json::json!({
            "mem": {
                "num_blocks": self.0.block_count,
                "block_size": self.0.block_len,
            }
        })
    }
}

/// Handle onto a registered RAM device; keeps working after hot-remove
/// for post-mortem inspection of the backing store.
#[derive(Clone)]
pub struct MemBdev {
    inner: Arc<MemInner>,
    bdev: Bdev,
}

impl MemBdev {
    pub fn create(name: &str, block_len: u32, block_count: u64) -> Result<Self, RegisterError> {
        Self::create_with_md(name, block_len, block_count, 0)
    }

    /// Variant advertising native per-block metadata of `md_len` bytes.
    pub fn create_with_md(
        name: &str,
        block_len: u32,
        block_count: u64,
        md_len: u32,
    ) -> Result<Self, RegisterError> {
        let inner = Arc::new(MemInner {
            block_len,
            block_count,
            store: Mutex::new(HashMap::new()),
            inject: Mutex::new(Inject::default()),
            submissions: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
        });
        let mut props = BdevProps::new(name, "Memory disk");
        props.block_len = block_len;
        props.block_count = block_count;
        props.md_len = md_len;
        let bdev = Bdev::new(props, MEM_MODULE_NAME, Box::new(MemOps(inner.clone())));
        registry::register(bdev.clone())?;
        Ok(Self { inner, bdev })
    }

    pub fn bdev(&self) -> &Bdev {
        &self.bdev
    }

    pub fn destroy(&self) {
        let _ = registry::unregister(self.bdev.name());
    }

    /// Fills `count` blocks starting at `offset` with `byte`.
    pub fn fill_blocks(&self, offset: u64, count: u64, byte: u8) {
        let bl = self.inner.block_len as usize;
        let mut store = self.inner.store.lock();
        for i in 0..count {
            store.insert(offset + i, vec![byte; bl].into_boxed_slice());
        }
    }

    /// Raw backing-store bytes for `count` blocks at `offset`; unwritten
    /// blocks read as zeros.
    pub fn read_raw(&self, offset: u64, count: u64) -> Vec<u8> {
        self.inner.read_region(offset, count)
    }

    /// Rejects the next `count` submissions with `NoMemory`.
    pub fn inject_nomem(&self, count: u32) {
        self.inner.inject.lock().nomem_remaining = count;
    }

    /// Completes `count` submissions with `Failed` after letting `skip`
    /// submissions through.
    pub fn fail_after(&self, skip: u32, count: u32) {
        let mut inject = self.inner.inject.lock();
        inject.fail_skip = skip;
        inject.fail_remaining = count;
    }

    /// Wakes every waiter parked on this device's channels, in FIFO order
    /// per channel.
    pub fn signal_memory_available(&self) {
        let channels: Vec<IoChannel> = self.inner.channels.lock().clone();
        for channel in channels {
            channel.drain_waiters();
        }
    }

    /// Stops the device's channels from accepting wait entries.
    pub fn close_channels(&self) {
        for channel in self.inner.channels.lock().iter() {
            channel.close();
        }
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.inner.submissions.lock().clone()
    }

    pub fn submission_count(&self, io_type: IoType) -> usize {
        self.inner
            .submissions
            .lock()
            .iter()
            .filter(|r| r.io_type == io_type)
            .count()
    }
}
