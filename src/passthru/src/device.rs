use std::sync::Arc;

use bdev::thread::{self, ThreadHandle};
use bdev::{
    Bdev, BdevDesc, BdevEvent, BdevOps, BdevProps, BlockIo, ClaimError, DmaError, IoChannel,
    IoStatus, IoType, MemoryDomain, OpenError, RegisterError, SharedBuf, SubmitError,
    HUGEPAGE_ALIGN,
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{MetadataInit, PassthruConfig};
use crate::dispatch;
use crate::geometry::{Geometry, GeometryError};
use crate::registry;
use crate::shadow::MetadataShadow;

pub(crate) const MODULE_NAME: &str = "passthru";
pub(crate) const PRODUCT_NAME: &str = "passthru";

/// Namespace for deriving a virtual device's UUID from its base's.
const NAMESPACE_UUID: Uuid = Uuid::from_u128(0x7e25812e_c8c0_4d3f_8599_16d790555b85);

/// Largest hydration read issued in one submission, in guest blocks.
const HYDRATION_CHUNK_BLOCKS: u64 = 4096;

#[derive(Debug, Error)]
pub enum CreateError {
    #[error("passthru bdev {0} already exists")]
    AlreadyExists(String),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    NoMemory(#[from] DmaError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error("metadata hydration failed")]
    HydrationFailed,
}

/// One live virtual device. Owns the base descriptor, the metadata
/// shadow, and the internal base channel used for metadata write-back
/// and hydration.
pub(crate) struct PassthruDevice {
    name: String,
    base_name: String,
    uuid: Uuid,
    base_desc: BdevDesc,
    geometry: Geometry,
    shadow: MetadataShadow,
    mode: MetadataInit,
    md_channel: IoChannel,
    thread: ThreadHandle,
}

impl PassthruDevice {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn base_name(&self) -> &str {
        &self.base_name
    }

    pub(crate) fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub(crate) fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub(crate) fn shadow(&self) -> &MetadataShadow {
        &self.shadow
    }

    pub(crate) fn base_desc(&self) -> &BdevDesc {
        &self.base_desc
    }

    pub(crate) fn md_channel(&self) -> &IoChannel {
        &self.md_channel
    }
}

/// Per-consumer channel context: the base-device channel submissions are
/// forwarded on.
pub(crate) struct PtChannel {
    pub(crate) base_ch: IoChannel,
}

pub(crate) struct PassthruOps(pub(crate) Arc<PassthruDevice>);

impl BdevOps for PassthruOps {
    fn submit_request(&self, channel: &IoChannel, io: BlockIo) -> Result<(), SubmitError> {
        dispatch::submit(self.0.clone(), channel, io);
        Ok(())
    }

    fn io_type_supported(&self, io_type: IoType) -> bool {
        self.0.base_desc.bdev().io_type_supported(io_type)
    }

    fn create_channel(&self) -> IoChannel {
        IoChannel::new(PtChannel {
            base_ch: self.0.base_desc.io_channel(),
        })
    }

    fn destruct(&self) {
        let dev = &self.0;
        registry::remove_node(&dev.name);
        dev.base_desc.bdev().release_claim();
        if dev.thread.is_current() {
            dev.base_desc.close();
        } else {
            let desc = dev.base_desc.clone();
            if let Err(err) = dev.thread.send(move || desc.close()) {
                warn!(%err, "owning thread unreachable, closing base descriptor here");
                dev.base_desc.close();
            }
        }
    }

    fn dump_info(&self) -> serde_json::Value {
        serde_json::json!({
            "passthru": {
                "name": self.0.name,
                "base_bdev_name": self.0.base_name,
            }
        })
    }

    fn write_config_json(&self) -> Option<serde_json::Value> {
        // No per-device records beyond the module-level create calls.
        None
    }

    fn memory_domains(&self) -> Vec<MemoryDomain> {
        // Data buffers are forwarded untouched, so any domain the base
        // handles works here too.
        self.0.base_desc.bdev().memory_domains()
    }
}

/// Creates and registers the virtual device over an already-present base.
/// Failures roll back everything acquired so far, newest first.
pub(crate) fn register(config: &PassthruConfig) -> Result<(), CreateError> {
    if bdev::registry::get(&config.name).is_some() {
        return Err(CreateError::AlreadyExists(config.name.clone()));
    }

    let base_desc = BdevDesc::open(
        &config.base_bdev_name,
        true,
        Box::new(|event, bdev| {
            if event == BdevEvent::Remove {
                registry::handle_base_remove(bdev.name());
            }
        }),
    )?;
    let base = base_desc.bdev().clone();
    info!(base = %base.name(), "base bdev opened");

    let geometry = match Geometry::derive(
        base.block_len(),
        base.block_count(),
        base.md_len(),
        config.block_size,
        config.md_size,
    ) {
        Ok(geometry) => geometry,
        Err(err) => {
            base_desc.close();
            return Err(err.into());
        }
    };

    let shadow = match MetadataShadow::new(geometry.shadow_len()) {
        Ok(shadow) => shadow,
        Err(err) => {
            error!(%err, "shadow allocation failed");
            base_desc.close();
            return Err(err.into());
        }
    };

    let uuid = config
        .uuid
        .unwrap_or_else(|| Uuid::new_v5(&NAMESPACE_UUID, base.uuid().as_bytes()));

    let device = Arc::new(PassthruDevice {
        name: config.name.clone(),
        base_name: config.base_bdev_name.clone(),
        uuid,
        md_channel: base_desc.io_channel(),
        base_desc,
        geometry,
        shadow,
        mode: config.mode,
        thread: thread::current(),
    });

    if let Err(err) = hydrate(&device) {
        device.base_desc.close();
        return Err(err);
    }

    if let Err(err) = base.claim(MODULE_NAME) {
        device.base_desc.close();
        return Err(err.into());
    }
    info!(base = %base.name(), "base bdev claimed");

    let base_props = base.props();
    let props = BdevProps {
        name: config.name.clone(),
        product_name: PRODUCT_NAME,
        uuid,
        block_len: geometry.block_len,
        block_count: geometry.block_count,
        md_len: geometry.md_len,
        md_interleave: base_props.md_interleave,
        write_cache: base_props.write_cache,
        required_alignment: base_props.required_alignment,
        optimal_io_boundary: base_props.optimal_io_boundary,
        dif_type: base_props.dif_type,
        dif_is_head_of_md: base_props.dif_is_head_of_md,
        dif_check_flags: base_props.dif_check_flags,
    };
    let vbdev = Bdev::new(props, MODULE_NAME, Box::new(PassthruOps(device.clone())));
    registry::insert_node(device.clone());
    if let Err(err) = bdev::registry::register(vbdev) {
        registry::remove_node(&device.name);
        base.release_claim();
        device.base_desc.close();
        return Err(err.into());
    }
    info!(name = %config.name, "passthru bdev registered");
    Ok(())
}

/// Brings up the metadata prefix before the device is exposed: either
/// zeroes it on disk or reads it into the shadow, in bounded chunks.
/// Returns once every chunk has completed.
fn hydrate(device: &Arc<PassthruDevice>) -> Result<(), CreateError> {
    let g = *device.geometry();
    if g.offset_start == 0 {
        return Ok(());
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut outstanding = 0usize;

    match device.mode {
        MetadataInit::Zero => {
            let tx = tx.clone();
            device
                .base_desc
                .write_zeroes_blocks(
                    &device.md_channel,
                    0,
                    g.base_count(g.offset_start),
                    Box::new(move |_io, status| {
                        let _ = tx.send(status);
                    }),
                )
                .map_err(|err| {
                    error!(%err, "zeroing the metadata region failed");
                    CreateError::HydrationFailed
                })?;
            outstanding += 1;
        }
        MetadataInit::Restore => {
            let block_len = u64::from(g.block_len);
            let mut offset = 0u64;
            while offset < g.offset_start {
                let chunk = (g.offset_start - offset).min(HYDRATION_CHUNK_BLOCKS);
                let buf = SharedBuf::zeroed((chunk * block_len) as usize, HUGEPAGE_ALIGN)?;
                let dev = device.clone();
                let data = buf.clone();
                let tx = tx.clone();
                let byte_off = offset * block_len;
                device
                    .base_desc
                    .read_blocks(
                        &device.md_channel,
                        buf,
                        offset * g.multiplier,
                        g.base_count(chunk),
                        Box::new(move |_io, status| {
                            if status.is_success() {
                                dev.shadow.splice_in(byte_off, &data.lock());
                            }
                            let _ = tx.send(status);
                        }),
                    )
                    .map_err(|err| {
                        error!(%err, offset, "metadata hydration read failed");
                        CreateError::HydrationFailed
                    })?;
                outstanding += 1;
                offset += chunk;
            }
        }
    }

    drop(tx);
    for _ in 0..outstanding {
        match rx.recv() {
            Ok(IoStatus::Success) => {}
            Ok(IoStatus::Failed) | Err(_) => return Err(CreateError::HydrationFailed),
        }
    }
    Ok(())
}
