//! GPU device layer for gpucheck
//!
//! The allocator and capture engine are written against the traits in
//! [`device`]; this crate also carries the command list model, blocking
//! submission, scoped state transitions and two devices:
//!
//! - [`SoftwareDevice`]: deterministic host-memory device used by the tests
//! - `WgpuDevice` (feature `wgpu`): the same contracts over `wgpu`

pub mod backend;
pub mod command;
pub mod device;
pub mod layout;
pub mod sync;
pub mod transition;
pub mod types;
pub mod upload;

pub use backend::SoftwareDevice;
#[cfg(feature = "wgpu")]
pub use backend::WgpuDevice;
pub use command::{ClosedCommandList, Command, CommandList};
pub use device::{CommandQueue, GpuDevice, MemoryProvider, SurfaceIntrospection};
pub use sync::{submit_and_wait, timeout_from_millis, timeout_millis, OwnedRegion, OwnedResource};
pub use transition::TemporaryTransition;
pub use types::*;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        command::CommandList,
        device::GpuDevice,
        sync::submit_and_wait,
        transition::TemporaryTransition,
        types::{
            CreationMethod, HeapKind, PixelFormat, ResourceDesc, ResourceFlags, ResourceId,
            ResourceState,
        },
        SoftwareDevice,
    };
}
