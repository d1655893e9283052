//! Block-device framework surface: registered devices, open descriptors,
//! per-consumer I/O channels, callback-completed block I/O, DMA-style
//! buffers, and a RAM-backed device for driving layered modules in tests.

pub mod buf;
pub mod device;
pub mod io;
pub mod mem;
pub mod priority;
pub mod registry;
pub mod thread;

pub use buf::{DmaBuf, DmaError, SharedBuf, HUGEPAGE_ALIGN};
pub use device::{
    Bdev, BdevDesc, BdevEvent, BdevOps, BdevProps, ClaimError, DifCheckFlags, DifType, EventCb,
    IoChannel, IoWaitEntry, OpenError, QueueError,
};
pub use io::{BlockIo, CompletionCb, ExtIoOpts, IoStatus, IoType, MemoryDomain, SubmitError};
pub use mem::MemBdev;
pub use registry::{BdevModule, RegisterError, UnregisterError};
