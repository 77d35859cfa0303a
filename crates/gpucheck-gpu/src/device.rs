//! Device contracts
//!
//! The allocator and the capture engine only talk to the GPU through these
//! three traits. Every method takes `&self`; implementations keep their
//! tables behind interior mutability so a device can sit in an `Arc`.

use crate::command::ClosedCommandList;
use crate::types::{
    AllocationInfo, DeviceCapabilities, FenceId, Footprint, HeapKind, RegionDesc, RegionId,
    ResourceDesc, ResourceId, ResourceState, Shareable, SharedHandle,
};
use gpucheck_core::Result;
use std::ops::Range;
use std::time::Duration;

/// Creates memory regions and the resources that live in them
pub trait MemoryProvider {
    fn create_memory_region(&self, desc: &RegionDesc) -> Result<RegionId>;

    /// Create a resource aliasing `region` at `offset`
    fn create_placed_resource(
        &self,
        region: RegionId,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<ResourceId>;

    /// Create a resource with its own dedicated memory
    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        heap_kind: HeapKind,
        shared: bool,
        initial_state: ResourceState,
    ) -> Result<ResourceId>;

    /// Create a resource with no memory bound; tiles are mapped separately
    fn create_reserved_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<ResourceId>;

    /// Number of tiles a reserved resource spans
    fn resource_tiling(&self, resource: ResourceId) -> Result<u32>;

    /// Map `tile_count` tiles of a reserved resource onto `region`, starting at region tile `first_tile`
    fn update_tile_mappings(
        &self,
        resource: ResourceId,
        region: RegionId,
        first_tile: u32,
        tile_count: u32,
    ) -> Result<()>;

    fn create_shared_handle(&self, object: Shareable) -> Result<SharedHandle>;
    fn open_shared_resource(&self, handle: SharedHandle) -> Result<ResourceId>;
    fn open_shared_region(&self, handle: SharedHandle) -> Result<RegionId>;
    fn close_shared_handle(&self, handle: SharedHandle) -> Result<()>;

    /// Copy `data` into a host-visible buffer at `offset`
    fn write_mapped(&self, resource: ResourceId, offset: u64, data: &[u8]) -> Result<()>;

    /// Read a byte range of a host-visible buffer
    fn read_mapped(&self, resource: ResourceId, range: Range<u64>) -> Result<Vec<u8>>;

    fn release_resource(&self, resource: ResourceId) -> Result<()>;
    fn release_region(&self, region: RegionId) -> Result<()>;
}

/// Executes closed command lists and exposes fences
pub trait CommandQueue {
    fn execute(&self, list: &ClosedCommandList) -> Result<()>;

    fn create_fence(&self, initial_value: u64) -> Result<FenceId>;

    /// Queue a signal of `value` after all previously executed work
    fn signal(&self, fence: FenceId, value: u64) -> Result<()>;

    fn completed_value(&self, fence: FenceId) -> Result<u64>;

    /// Block until `fence` reaches `value`. `None` waits forever.
    fn wait(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> Result<()>;

    fn release_fence(&self, fence: FenceId) -> Result<()>;
}

/// Answers layout questions about resources
pub trait SurfaceIntrospection {
    fn resource_desc(&self, resource: ResourceId) -> Result<ResourceDesc>;

    fn copyable_footprint(
        &self,
        desc: &ResourceDesc,
        subresource: u32,
        base_offset: u64,
    ) -> Result<Footprint>;

    fn resource_allocation_info(&self, desc: &ResourceDesc) -> Result<AllocationInfo>;

    /// Size of the upload buffer needed to fill the given subresources
    fn required_intermediate_size(
        &self,
        resource: ResourceId,
        first_subresource: u32,
        count: u32,
    ) -> Result<u64>;

    fn capabilities(&self) -> DeviceCapabilities;
}

/// Everything the allocator and capture engine need from a device
pub trait GpuDevice: MemoryProvider + CommandQueue + SurfaceIntrospection {}

impl<T> GpuDevice for T where T: MemoryProvider + CommandQueue + SurfaceIntrospection + ?Sized {}
