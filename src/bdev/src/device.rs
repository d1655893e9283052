use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::buf::SharedBuf;
use crate::io::{
    BlockIo, CompletionCb, ExtIoOpts, IoParams, IoType, MemoryDomain, SubmitError,
};
use crate::registry;

bitflags! {
    /// End-to-end data-protection checks a device advertises. Layered
    /// devices pass these through untouched.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct DifCheckFlags: u32 {
        const REFTAG = 1 << 0;
        const APPTAG = 1 << 1;
        const GUARD = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DifType {
    #[default]
    None,
    Type1,
    Type2,
    Type3,
}

/// Static properties of a registered block device.
#[derive(Clone, Debug)]
pub struct BdevProps {
    pub name: String,
    pub product_name: &'static str,
    pub uuid: Uuid,
    pub block_len: u32,
    pub block_count: u64,
    pub md_len: u32,
    pub md_interleave: bool,
    pub write_cache: bool,
    pub required_alignment: u32,
    pub optimal_io_boundary: u32,
    pub dif_type: DifType,
    pub dif_is_head_of_md: bool,
    pub dif_check_flags: DifCheckFlags,
}

impl BdevProps {
    pub fn new(name: impl Into<String>, product_name: &'static str) -> Self {
        let name = name.into();
        Self {
            uuid: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
            name,
            product_name,
            block_len: 512,
            block_count: 0,
            md_len: 0,
            md_interleave: false,
            write_cache: false,
            required_alignment: 0,
            optimal_io_boundary: 0,
            dif_type: DifType::None,
            dif_is_head_of_md: false,
            dif_check_flags: DifCheckFlags::empty(),
        }
    }
}

/// Behaviour a device module supplies for each device it registers.
pub trait BdevOps: Send + Sync {
    /// Routes one guest I/O. A synchronous `Err` means the I/O was never
    /// accepted; the submitter keeps ownership and may retry.
    fn submit_request(&self, channel: &IoChannel, io: BlockIo) -> Result<(), SubmitError>;

    fn io_type_supported(&self, io_type: IoType) -> bool;

    /// Creates a per-consumer channel carrying device-private context.
    fn create_channel(&self) -> IoChannel;

    /// Called by the registry once the device is unregistered and all
    /// open descriptors have seen the remove event.
    fn destruct(&self) {}

    fn dump_info(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Extra per-device configuration records, if the module has any.
    fn write_config_json(&self) -> Option<serde_json::Value> {
        None
    }

    fn memory_domains(&self) -> Vec<MemoryDomain> {
        Vec::new()
    }
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("bdev {bdev} already claimed by module {module}")]
    Claimed { bdev: String, module: &'static str },
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("no bdev named {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("channel no longer accepts wait entries")]
    ChannelClosed,
}

/// Asynchronous events delivered to open descriptors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BdevEvent {
    Remove,
}

pub type EventCb = Box<dyn Fn(BdevEvent, &Bdev) + Send + Sync>;

pub(crate) struct BdevInner {
    props: BdevProps,
    module: &'static str,
    ops: Box<dyn BdevOps>,
    claimed_by: Mutex<Option<&'static str>>,
    descs: Mutex<Vec<Weak<DescInner>>>,
    removed: AtomicBool,
}

/// A registered block device.
#[derive(Clone)]
pub struct Bdev {
    pub(crate) inner: Arc<BdevInner>,
}

impl Bdev {
    pub fn new(props: BdevProps, module: &'static str, ops: Box<dyn BdevOps>) -> Self {
        Self {
            inner: Arc::new(BdevInner {
                props,
                module,
                ops,
                claimed_by: Mutex::new(None),
                descs: Mutex::new(Vec::new()),
                removed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.props.name
    }

    pub fn product_name(&self) -> &'static str {
        self.inner.props.product_name
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.props.uuid
    }

    pub fn block_len(&self) -> u32 {
        self.inner.props.block_len
    }

    pub fn block_count(&self) -> u64 {
        self.inner.props.block_count
    }

    pub fn md_len(&self) -> u32 {
        self.inner.props.md_len
    }

    pub fn props(&self) -> &BdevProps {
        &self.inner.props
    }

    pub fn module(&self) -> &'static str {
        self.inner.module
    }

    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        self.inner.ops.io_type_supported(io_type)
    }

    pub fn memory_domains(&self) -> Vec<MemoryDomain> {
        self.inner.ops.memory_domains()
    }

    pub fn dump_info(&self) -> serde_json::Value {
        self.inner.ops.dump_info()
    }

    pub fn write_config_json(&self) -> Option<serde_json::Value> {
        self.inner.ops.write_config_json()
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::Acquire)
    }

    /// Takes the exclusive module claim on this device.
    pub fn claim(&self, module: &'static str) -> Result<(), ClaimError> {
        let mut claimed = self.inner.claimed_by.lock();
        if let Some(owner) = *claimed {
            return Err(ClaimError::Claimed {
                bdev: self.name().to_string(),
                module: owner,
            });
        }
        *claimed = Some(module);
        Ok(())
    }

    pub fn release_claim(&self) {
        *self.inner.claimed_by.lock() = None;
    }

    pub fn claimed_by(&self) -> Option<&'static str> {
        *self.inner.claimed_by.lock()
    }

    pub(crate) fn mark_removed(&self) {
        self.inner.removed.store(true, Ordering::Release);
    }

    /// Delivers an event to every open descriptor.
    pub(crate) fn deliver_event(&self, event: BdevEvent) {
        let descs: Vec<Arc<DescInner>> = self
            .inner
            .descs
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for desc in descs {
            if !desc.closed.load(Ordering::Acquire) {
                (desc.event_cb)(event, self);
            }
        }
    }

    pub(crate) fn destruct(&self) {
        self.inner.ops.destruct();
    }
}

impl std::fmt::Debug for Bdev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bdev")
            .field("name", &self.name())
            .field("product", &self.product_name())
            .finish()
    }
}

pub(crate) struct DescInner {
    bdev: Bdev,
    #[allow(dead_code)]
    write: bool,
    event_cb: EventCb,
    closed: AtomicBool,
}

/// An open handle on a registered device. Dropping does not close; call
/// [`BdevDesc::close`] on the thread that opened it.
#[derive(Clone)]
pub struct BdevDesc {
    inner: Arc<DescInner>,
}

impl BdevDesc {
    /// Opens a device by name, subscribing to its asynchronous events.
    pub fn open(name: &str, write: bool, event_cb: EventCb) -> Result<Self, OpenError> {
        let bdev = registry::get(name).ok_or_else(|| OpenError::NotFound(name.to_string()))?;
        let inner = Arc::new(DescInner {
            bdev: bdev.clone(),
            write,
            event_cb,
            closed: AtomicBool::new(false),
        });
        bdev.inner.descs.lock().push(Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    pub fn bdev(&self) -> &Bdev {
        &self.inner.bdev
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut descs = self.inner.bdev.inner.descs.lock();
        descs.retain(|w| w.upgrade().map_or(false, |d| !Arc::ptr_eq(&d, &self.inner)));
    }

    /// Creates an I/O channel for submissions through this descriptor.
    pub fn io_channel(&self) -> IoChannel {
        self.inner.bdev.inner.ops.create_channel()
    }

    fn submit(
        &self,
        channel: &IoChannel,
        params: IoParams,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        let bdev = &self.inner.bdev;
        if bdev.is_removed() {
            return Err(SubmitError::Removed);
        }
        if !bdev.io_type_supported(params.io_type) {
            return Err(SubmitError::Unsupported(params.io_type));
        }
        let io = BlockIo::new(params, cb);
        bdev.inner.ops.submit_request(channel, io)
    }

    pub fn readv_blocks_ext(
        &self,
        channel: &IoChannel,
        iovs: Vec<SharedBuf>,
        offset_blocks: u64,
        num_blocks: u64,
        opts: ExtIoOpts,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.submit(
            channel,
            IoParams {
                io_type: IoType::Read,
                offset_blocks,
                num_blocks,
                iovs,
                opts,
                ..IoParams::default()
            },
            cb,
        )
    }

    pub fn writev_blocks_ext(
        &self,
        channel: &IoChannel,
        iovs: Vec<SharedBuf>,
        offset_blocks: u64,
        num_blocks: u64,
        opts: ExtIoOpts,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.submit(
            channel,
            IoParams {
                io_type: IoType::Write,
                offset_blocks,
                num_blocks,
                iovs,
                opts,
                ..IoParams::default()
            },
            cb,
        )
    }

    pub fn read_blocks(
        &self,
        channel: &IoChannel,
        buf: SharedBuf,
        offset_blocks: u64,
        num_blocks: u64,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.readv_blocks_ext(
            channel,
            vec![buf],
            offset_blocks,
            num_blocks,
            ExtIoOpts::default(),
            cb,
        )
    }

    pub fn write_blocks(
        &self,
        channel: &IoChannel,
        buf: SharedBuf,
        offset_blocks: u64,
        num_blocks: u64,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.writev_blocks_ext(
            channel,
            vec![buf],
            offset_blocks,
            num_blocks,
            ExtIoOpts::default(),
            cb,
        )
    }

    pub fn write_zeroes_blocks(
        &self,
        channel: &IoChannel,
        offset_blocks: u64,
        num_blocks: u64,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.submit(
            channel,
            IoParams {
                io_type: IoType::WriteZeroes,
                offset_blocks,
                num_blocks,
                ..IoParams::default()
            },
            cb,
        )
    }

    pub fn unmap_blocks(
        &self,
        channel: &IoChannel,
        offset_blocks: u64,
        num_blocks: u64,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.submit(
            channel,
            IoParams {
                io_type: IoType::Unmap,
                offset_blocks,
                num_blocks,
                ..IoParams::default()
            },
            cb,
        )
    }

    pub fn flush_blocks(
        &self,
        channel: &IoChannel,
        offset_blocks: u64,
        num_blocks: u64,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.submit(
            channel,
            IoParams {
                io_type: IoType::Flush,
                offset_blocks,
                num_blocks,
                ..IoParams::default()
            },
            cb,
        )
    }

    pub fn reset(&self, channel: &IoChannel, cb: CompletionCb) -> Result<(), SubmitError> {
        self.submit(
            channel,
            IoParams {
                io_type: IoType::Reset,
                ..IoParams::default()
            },
            cb,
        )
    }

    pub fn abort(
        &self,
        channel: &IoChannel,
        target: BlockIo,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.submit(
            channel,
            IoParams {
                io_type: IoType::Abort,
                abort_target: Some(target),
                ..IoParams::default()
            },
            cb,
        )
    }

    pub fn copy_blocks(
        &self,
        channel: &IoChannel,
        dst_offset_blocks: u64,
        src_offset_blocks: u64,
        num_blocks: u64,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.submit(
            channel,
            IoParams {
                io_type: IoType::Copy,
                offset_blocks: dst_offset_blocks,
                copy_src_offset_blocks: src_offset_blocks,
                num_blocks,
                ..IoParams::default()
            },
            cb,
        )
    }

    /// Starts a zero-copy region on the device. On success the completed
    /// I/O's first iovec is bound to a device-owned buffer.
    pub fn zcopy_start(
        &self,
        channel: &IoChannel,
        offset_blocks: u64,
        num_blocks: u64,
        populate: bool,
        cb: CompletionCb,
    ) -> Result<(), SubmitError> {
        self.submit(
            channel,
            IoParams {
                io_type: IoType::Zcopy,
                offset_blocks,
                num_blocks,
                zcopy_populate: populate,
                ..IoParams::default()
            },
            cb,
        )
    }
}

/// A retry parked on a channel until the device signals spare capacity.
pub struct IoWaitEntry {
    retry: Box<dyn FnOnce() + Send>,
}

impl IoWaitEntry {
    pub fn new(retry: impl FnOnce() + Send + 'static) -> Self {
        Self {
            retry: Box::new(retry),
        }
    }

    pub(crate) fn fire(self) {
        (self.retry)()
    }
}

pub(crate) struct ChannelInner {
    ctx: Box<dyn Any + Send + Sync>,
    waiters: Mutex<VecDeque<IoWaitEntry>>,
    open: AtomicBool,
}

/// Per-consumer I/O channel. Carries device-private context plus the
/// wait queue used for out-of-memory backpressure.
#[derive(Clone)]
pub struct IoChannel {
    inner: Arc<ChannelInner>,
}

impl IoChannel {
    pub fn new(ctx: impl Any + Send + Sync) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                ctx: Box::new(ctx),
                waiters: Mutex::new(VecDeque::new()),
                open: AtomicBool::new(true),
            }),
        }
    }

    pub fn ctx<T: 'static>(&self) -> Option<&T> {
        self.inner.ctx.downcast_ref::<T>()
    }

    /// Parks a retry to run once the device frees capacity. Fails if the
    /// channel stopped accepting waiters (device torn down).
    pub fn queue_io_wait(&self, entry: IoWaitEntry) -> Result<(), QueueError> {
        if !self.inner.open.load(Ordering::Acquire) {
            return Err(QueueError::ChannelClosed);
        }
        self.inner.waiters.lock().push_back(entry);
        Ok(())
    }

    /// Runs every parked waiter in FIFO order. Retries that park again go
    /// to the back of a fresh queue rather than spinning here.
    pub fn drain_waiters(&self) {
        let drained: Vec<IoWaitEntry> = self.inner.waiters.lock().drain(..).collect();
        for entry in drained {
            entry.fire();
        }
    }

    pub fn close(&self) {
        self.inner.open.store(false, Ordering::Release);
        self.inner.waiters.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoStatus;

    #[test]
    fn claim_is_exclusive() {
        let props = BdevProps::new("claim-test", "test");
        let bdev = Bdev::new(props, "test", Box::new(NopOps));
        bdev.claim("first").unwrap();
        assert!(matches!(
            bdev.claim("second"),
            Err(ClaimError::Claimed { module: "first", .. })
        ));
        bdev.release_claim();
        bdev.claim("second").unwrap();
    }

    #[test]
    fn closed_channel_refuses_waiters() {
        let ch = IoChannel::new(());
        ch.queue_io_wait(IoWaitEntry::new(|| {})).unwrap();
        ch.close();
        assert!(matches!(
            ch.queue_io_wait(IoWaitEntry::new(|| {})),
            Err(QueueError::ChannelClosed)
        ));
    }

    #[test]
    fn waiters_drain_fifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let ch = IoChannel::new(());
        for i in 0..3 {
            let order = order.clone();
            ch.queue_io_wait(IoWaitEntry::new(move || order.lock().push(i)))
                .unwrap();
        }
        ch.drain_waiters();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    struct NopOps;

    impl BdevOps for NopOps {
        fn submit_request(&self, _channel: &IoChannel, io: BlockIo) -> Result<(), SubmitError> {
            io.complete(IoStatus::Success);
            Ok(())
        }

        fn io_type_supported(&self, _io_type: IoType) -> bool {
            true
        }

        fn create_channel(&self) -> IoChannel {
            IoChannel::new(())
        }
    }
}
