//! Per-I/O translation and completion chaining. Every guest I/O becomes
//! one base-device operation at the shifted address; writes that carry
//! metadata chain a second base write that persists the touched window of
//! the shadow.

use std::sync::Arc;

use bdev::{
    BlockIo, CompletionCb, DmaBuf, ExtIoOpts, IoChannel, IoStatus, IoWaitEntry, SharedBuf,
    SubmitError, HUGEPAGE_ALIGN,
};
use tracing::{error, warn};

use crate::device::{PassthruDevice, PtChannel};

/// Stamped into every I/O context at submission and checked at each
/// chained callback to catch context mixups.
const IO_CTX_CANARY: u8 = 0x5a;

/// State threaded through an I/O's completion chain: the guest I/O and
/// the channel it arrived on, so a backpressure retry re-enters
/// submission exactly as the original did.
pub(crate) struct IoCtx {
    io: BlockIo,
    channel: IoChannel,
    canary: u8,
}

impl IoCtx {
    fn check_canary(&self) {
        if self.canary != IO_CTX_CANARY {
            error!(canary = self.canary, "I/O context canary mismatch");
        }
    }
}

pub(crate) fn submit(device: Arc<PassthruDevice>, channel: &IoChannel, io: BlockIo) {
    let ctx = Arc::new(IoCtx {
        io,
        channel: channel.clone(),
        canary: IO_CTX_CANARY,
    });
    submit_ctx(device, ctx);
}

/// Single entry point for first submission and every retry.
fn submit_ctx(device: Arc<PassthruDevice>, ctx: Arc<IoCtx>) {
    let Some(pt_ch) = ctx.channel.ctx::<PtChannel>() else {
        error!("I/O submitted on a channel of another device");
        ctx.io.complete(IoStatus::Failed);
        return;
    };
    let g = *device.geometry();
    let io = ctx.io.clone();
    let offset = g.base_lba(io.offset_blocks());
    let count = g.base_count(io.num_blocks());

    let result = match io.io_type() {
        bdev::IoType::Read => submit_read(&device, &ctx, pt_ch),
        bdev::IoType::Write => submit_write(&device, &ctx, pt_ch),
        bdev::IoType::WriteZeroes => device.base_desc().write_zeroes_blocks(
            &pt_ch.base_ch,
            offset,
            count,
            plain_cb(&ctx),
        ),
        bdev::IoType::Unmap => {
            device
                .base_desc()
                .unmap_blocks(&pt_ch.base_ch, offset, count, plain_cb(&ctx))
        }
        bdev::IoType::Flush => {
            device
                .base_desc()
                .flush_blocks(&pt_ch.base_ch, offset, count, plain_cb(&ctx))
        }
        bdev::IoType::Reset => device.base_desc().reset(&pt_ch.base_ch, plain_cb(&ctx)),
        bdev::IoType::Abort => {
            let Some(target) = io.abort_target().cloned() else {
                error!("abort without a target I/O");
                ctx.io.complete(IoStatus::Failed);
                return;
            };
            device
                .base_desc()
                .abort(&pt_ch.base_ch, target, plain_cb(&ctx))
        }
        bdev::IoType::Zcopy => submit_zcopy(&device, &ctx, pt_ch),
        bdev::IoType::Copy => device.base_desc().copy_blocks(
            &pt_ch.base_ch,
            offset,
            g.base_lba(io.copy_src_offset_blocks()),
            count,
            plain_cb(&ctx),
        ),
    };

    if let Err(err) = result {
        handle_submit_error(device, ctx, err);
    }
}

fn forwarded_opts(io: &BlockIo) -> ExtIoOpts {
    ExtIoOpts {
        memory_domain: io.opts().memory_domain,
        metadata: None,
    }
}

/// Completion that just forwards the base status to the guest.
fn plain_cb(ctx: &Arc<IoCtx>) -> CompletionCb {
    let ctx = ctx.clone();
    Box::new(move |_base_io, status| {
        ctx.check_canary();
        if !status.is_success() {
            error!("error status on passthru bdev");
        }
        ctx.io.complete(status);
    })
}

fn submit_read(
    device: &Arc<PassthruDevice>,
    ctx: &Arc<IoCtx>,
    pt_ch: &PtChannel,
) -> Result<(), SubmitError> {
    let g = *device.geometry();
    let io = &ctx.io;
    let data_len = (io.num_blocks() * u64::from(g.block_len)) as usize;
    if let Err(err) = io.ensure_data(data_len, 64) {
        error!(%err, "could not acquire a read buffer");
        io.complete(IoStatus::Failed);
        return Ok(());
    }
    let base = device.base_desc().clone();
    let device = device.clone();
    let chained = ctx.clone();
    base.readv_blocks_ext(
        &pt_ch.base_ch,
        io.iovs(),
        g.base_lba(io.offset_blocks()),
        g.base_count(io.num_blocks()),
        forwarded_opts(io),
        Box::new(move |_base_io, status| complete_read(device, chained, status)),
    )
}

/// Read completion: surface shadow metadata to the guest, then finish.
fn complete_read(device: Arc<PassthruDevice>, ctx: Arc<IoCtx>, status: IoStatus) {
    ctx.check_canary();
    if status.is_success() {
        if let Some(md) = ctx.io.md_buf() {
            let g = device.geometry();
            let byte_off = g.md_byte_offset(ctx.io.offset_blocks());
            let byte_len = g.md_byte_count(ctx.io.num_blocks()) as usize;
            let mut guard = md.lock();
            let len = byte_len.min(guard.len());
            device.shadow().read_out(byte_off, &mut guard[..len]);
        }
    } else {
        error!("error status on passthru bdev");
    }
    ctx.io.complete(status);
}

fn submit_write(
    device: &Arc<PassthruDevice>,
    ctx: &Arc<IoCtx>,
    pt_ch: &PtChannel,
) -> Result<(), SubmitError> {
    let g = *device.geometry();
    let io = &ctx.io;
    let data_len = (io.num_blocks() * u64::from(g.block_len)) as usize;
    if let Err(err) = io.ensure_data(data_len, 64) {
        error!(%err, "could not acquire a write buffer");
        io.complete(IoStatus::Failed);
        return Ok(());
    }
    let base = device.base_desc().clone();
    let device = device.clone();
    let chained = ctx.clone();
    base.writev_blocks_ext(
        &pt_ch.base_ch,
        io.iovs(),
        g.base_lba(io.offset_blocks()),
        g.base_count(io.num_blocks()),
        forwarded_opts(io),
        Box::new(move |_base_io, status| complete_write(device, chained, status)),
    )
}

/// Data-write completion: clean writes finish here; writes carrying
/// metadata continue into the write-through protocol.
fn complete_write(device: Arc<PassthruDevice>, ctx: Arc<IoCtx>, status: IoStatus) {
    ctx.check_canary();
    if !status.is_success() {
        error!("error status on passthru bdev");
        ctx.io.complete(IoStatus::Failed);
        return;
    }
    let Some(md) = ctx.io.md_buf().cloned() else {
        ctx.io.complete(IoStatus::Success);
        return;
    };
    if device.geometry().md_len == 0 {
        ctx.io.complete(IoStatus::Success);
        return;
    }
    write_through(device, ctx, md);
}

/// Persists a write's metadata: splice into the shadow, snapshot the
/// covering window into a private bounce buffer, write the window back to
/// the reserved prefix, and complete the guest I/O with the final status.
fn write_through(device: Arc<PassthruDevice>, ctx: Arc<IoCtx>, md: SharedBuf) {
    let g = *device.geometry();
    let io = &ctx.io;
    let block_len = u64::from(g.block_len);
    let byte_off = g.md_byte_offset(io.offset_blocks());
    let byte_len = g.md_byte_count(io.num_blocks());
    let window = g.writeback_window(byte_off, byte_len);

    // Checked before any splice so a rejected write leaves the shadow
    // untouched.
    if window.end() >= g.offset_start {
        warn!(
            start = window.start_lba,
            span = window.lba_count,
            reserved = g.offset_start,
            "metadata write-back past the reserved region"
        );
        io.complete(IoStatus::Failed);
        return;
    }

    let mut bounce = match DmaBuf::zeroed((window.lba_count * block_len) as usize, HUGEPAGE_ALIGN)
    {
        Ok(bounce) => bounce,
        Err(err) => {
            error!(%err, "metadata bounce buffer allocation failed");
            io.complete(IoStatus::Failed);
            return;
        }
    };

    {
        let md_guard = md.lock();
        let len = (byte_len as usize).min(md_guard.len());
        device.shadow().splice_and_snapshot(
            byte_off,
            &md_guard[..len],
            window.start_lba * block_len,
            &mut bounce,
        );
    }

    // The snapshot owns its bytes now; the lock is already released and
    // stays out of the submission below.
    let bounce = SharedBuf::from_dma(bounce);
    let chained = ctx.clone();
    let rc = device.base_desc().write_blocks(
        device.md_channel(),
        bounce,
        window.start_lba * g.multiplier,
        g.base_count(window.lba_count),
        Box::new(move |_base_io, status| {
            chained.check_canary();
            if !status.is_success() {
                error!("error status on passthru bdev");
            }
            chained.io.complete(status);
        }),
    );
    if let Err(err) = rc {
        error!(%err, "metadata write-back submission failed");
        io.complete(IoStatus::Failed);
    }
}

fn submit_zcopy(
    device: &Arc<PassthruDevice>,
    ctx: &Arc<IoCtx>,
    pt_ch: &PtChannel,
) -> Result<(), SubmitError> {
    let g = *device.geometry();
    let io = &ctx.io;
    let chained = ctx.clone();
    device.base_desc().zcopy_start(
        &pt_ch.base_ch,
        g.base_lba(io.offset_blocks()),
        g.base_count(io.num_blocks()),
        io.zcopy_populate(),
        Box::new(move |base_io, status| {
            chained.check_canary();
            if !status.is_success() {
                error!("error status on passthru bdev");
            }
            if let Some(buf) = base_io.iovs().into_iter().next() {
                chained.io.set_iov0(buf);
            }
            chained.io.complete(status);
        }),
    )
}

/// Out-of-memory parks the I/O on the base channel for a retry; anything
/// else fails the guest I/O now.
fn handle_submit_error(device: Arc<PassthruDevice>, ctx: Arc<IoCtx>, err: SubmitError) {
    match err {
        SubmitError::NoMemory => {
            warn!("no memory, queueing I/O for retry");
            queue_io_wait(device, ctx);
        }
        err => {
            error!(%err, "error on I/O submission");
            ctx.io.complete(IoStatus::Failed);
        }
    }
}

fn queue_io_wait(device: Arc<PassthruDevice>, ctx: Arc<IoCtx>) {
    let Some(pt_ch) = ctx.channel.ctx::<PtChannel>() else {
        ctx.io.complete(IoStatus::Failed);
        return;
    };
    let base_ch = pt_ch.base_ch.clone();
    let retry_device = device.clone();
    let retry_ctx = ctx.clone();
    let entry = IoWaitEntry::new(move || submit_ctx(retry_device, retry_ctx));
    if let Err(err) = base_ch.queue_io_wait(entry) {
        error!(%err, "queueing I/O for retry failed");
        ctx.io.complete(IoStatus::Failed);
    }
}
