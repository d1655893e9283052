//! Virtual block-device passthrough layer. Exposes a device whose block
//! size is an integer multiple of its base device's, emulates per-block
//! out-of-band metadata backed by a reserved prefix of the base, and
//! shifts all guest I/O past that prefix. Guest writes carrying metadata
//! persist it with a chained write-back before completing.

mod config;
mod device;
mod dispatch;
mod geometry;
mod registry;
mod shadow;

pub use config::{MetadataInit, PassthruConfig, SUPPORTED_MD_SIZES};
pub use device::CreateError;
pub use geometry::{BlockWindow, Geometry, GeometryError};
pub use registry::{config_json, create_disk, delete_disk, finish, DeleteError};
