//! Sub-allocating buffer creator
//!
//! [`BufferAllocator`] creates buffers with one of three creation methods:
//!
//! - **Committed**: a dedicated allocation from the device, optionally
//!   exported through a shared handle and reopened
//! - **Placed**: a 64 KiB aligned slice of a bump-allocated arena
//! - **Reserved**: a reserved resource whose tiles are mapped onto an arena
//!   slice
//!
//! Every buffer is recorded so `copy_to_resource` knows whether to stage the
//! data through an upload buffer or write it through a host mapping.

use crate::heap::{Arena, ArenaPool, HeapKindTable, Placement};
use gpucheck_core::{
    gpucheck_debug, gpucheck_info, gpucheck_warn, ErrorContext, GpuCheckError, LogCategory,
    MemoryConfig, Result,
};
use gpucheck_gpu::upload::record_staged_copy;
use gpucheck_gpu::{
    submit_and_wait, timeout_from_millis, CommandList, CreationMethod, GpuDevice, HeapKind,
    OwnedResource, RegionDesc, RegionId, ResourceDesc, ResourceFlags, ResourceId, ResourceState,
    Shareable, SharedHandle, TemporaryTransition, TILE_SIZE_IN_BYTES,
};
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const COMPONENT: &str = "buffer-allocator";

/// Parameters of one `create_buffer` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRequest {
    pub heap_kind: HeapKind,
    pub creation_method: CreationMethod,
    pub size: u64,
    pub flags: ResourceFlags,
    pub shared: bool,
    pub initial_state: ResourceState,
}

impl BufferRequest {
    /// A request in the state the heap kind requires at creation
    pub fn new(heap_kind: HeapKind, creation_method: CreationMethod, size: u64) -> Self {
        let initial_state = match heap_kind {
            HeapKind::GpuLocal => ResourceState::COMMON,
            HeapKind::Upload => ResourceState::GENERIC_READ,
            HeapKind::Readback => ResourceState::COPY_DEST,
        };

        Self {
            heap_kind,
            creation_method,
            size,
            flags: ResourceFlags::NONE,
            shared: false,
            initial_state,
        }
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }
}

/// What the allocator remembers about a buffer it created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub heap_kind: HeapKind,
    pub creation_method: CreationMethod,
    pub size: u64,
    pub shared: bool,
    /// Arena slice for placed and reserved buffers
    pub placement: Option<Placement>,
}

/// Allocator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationStats {
    pub arenas_created: u64,
    pub arena_bytes: u64,
    pub placed_bytes: u64,
    pub committed_buffers: u64,
    pub placed_buffers: u64,
    pub reserved_buffers: u64,
    pub staged_uploads: u64,
    pub mapped_uploads: u64,
    pub failed_allocations: u64,
    pub released_buffers: u64,
}

/// Per-heap-kind bump sub-allocator
pub struct BufferAllocator<D: GpuDevice + ?Sized> {
    device: Arc<D>,
    heap_kinds: HeapKindTable,
    placement_alignment: u64,
    wait_timeout: Option<Duration>,
    pools: HashMap<(HeapKind, bool), ArenaPool>,
    records: SecondaryMap<ResourceId, AllocationRecord>,
    creation_order: Vec<ResourceId>,
    shared_handles: Vec<SharedHandle>,
    stats: AllocationStats,
}

impl<D: GpuDevice + ?Sized> BufferAllocator<D> {
    pub fn new(device: Arc<D>, config: &MemoryConfig) -> Result<Self> {
        if config.placement_alignment == 0 || !config.placement_alignment.is_power_of_two() {
            return Err(GpuCheckError::invalid_configuration(format!(
                "placement alignment must be a power of two, got {}",
                config.placement_alignment
            )));
        }
        if config.default_arena_size == 0 {
            return Err(GpuCheckError::invalid_configuration(
                "default arena size must be non-zero",
            ));
        }

        Ok(Self {
            device,
            heap_kinds: HeapKindTable::new(config.default_arena_size),
            placement_alignment: config.placement_alignment,
            wait_timeout: timeout_from_millis(config.wait_timeout_ms),
            pools: HashMap::new(),
            records: SecondaryMap::new(),
            creation_order: Vec::new(),
            shared_handles: Vec::new(),
            stats: AllocationStats::default(),
        })
    }

    /// Allocator with the default arena size and placement alignment
    pub fn with_defaults(device: Arc<D>) -> Result<Self> {
        Self::new(device, &MemoryConfig::default())
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn heap_kinds(&self) -> &HeapKindTable {
        &self.heap_kinds
    }

    pub fn heap_kinds_mut(&mut self) -> &mut HeapKindTable {
        &mut self.heap_kinds
    }

    /// Create a buffer and record how it was made
    #[instrument(skip(self), fields(kind = %request.heap_kind, method = ?request.creation_method, size = request.size))]
    pub fn create_buffer(&mut self, request: &BufferRequest) -> Result<ResourceId> {
        self.validate(request)?;

        let desc = ResourceDesc::buffer(request.size, request.flags);
        let created = match request.creation_method {
            CreationMethod::Committed => self.create_committed(request, &desc),
            CreationMethod::Placed => self.create_placed(request, &desc),
            CreationMethod::Reserved => self.create_reserved(request, &desc),
        };

        let (resource, placement) = match created {
            Ok(created) => created,
            Err(e) => {
                self.stats.failed_allocations += 1;
                gpucheck_warn!(
                    LogCategory::Memory,
                    "buffer creation failed: {}",
                    e.format_for_log()
                );
                return Err(e);
            }
        };

        match request.creation_method {
            CreationMethod::Committed => self.stats.committed_buffers += 1,
            CreationMethod::Placed => self.stats.placed_buffers += 1,
            CreationMethod::Reserved => self.stats.reserved_buffers += 1,
        }

        self.records.insert(
            resource,
            AllocationRecord {
                heap_kind: request.heap_kind,
                creation_method: request.creation_method,
                size: request.size,
                shared: request.shared,
                placement,
            },
        );
        self.creation_order.push(resource);
        gpucheck_debug!(
            LogCategory::Memory,
            "created {:?} ({:?}, {}) at {:?}",
            resource,
            request.creation_method,
            request.heap_kind,
            placement.map(|p| p.offset)
        );
        Ok(resource)
    }

    fn validate(&self, request: &BufferRequest) -> Result<()> {
        let context = || {
            ErrorContext::new("create_buffer", COMPONENT)
                .with_metadata("kind", request.heap_kind)
                .with_metadata("method", format!("{:?}", request.creation_method))
                .with_metadata("size", request.size)
        };

        if request.size == 0 {
            return Err(GpuCheckError::invalid_configuration_with_context(
                "buffer size must be non-zero",
                context(),
            ));
        }
        if request.shared && !self.heap_kinds[request.heap_kind].shareable {
            return Err(GpuCheckError::invalid_configuration_with_context(
                format!("{} memory is host visible and cannot be shared", request.heap_kind),
                context(),
            ));
        }

        let capabilities = self.device.capabilities();
        if request.shared && !capabilities.shared_handles {
            return Err(GpuCheckError::invalid_configuration_with_context(
                "device does not support shared handles",
                context(),
            ));
        }
        if request.creation_method == CreationMethod::Reserved && !capabilities.reserved_resources {
            return Err(GpuCheckError::invalid_configuration_with_context(
                "device does not support reserved resources",
                context(),
            ));
        }
        Ok(())
    }

    fn create_committed(
        &mut self,
        request: &BufferRequest,
        desc: &ResourceDesc,
    ) -> Result<(ResourceId, Option<Placement>)> {
        let resource = self
            .device
            .create_committed_resource(desc, request.heap_kind, request.shared, request.initial_state)
            .map_err(as_allocation_failure)?;
        if !request.shared {
            return Ok((resource, None));
        }

        // Hand out the reopened resource; the original goes away with its guard
        let original = OwnedResource::new(&*self.device, resource);
        let handle = self
            .device
            .create_shared_handle(Shareable::Resource(original.id()))
            .map_err(as_allocation_failure)?;
        self.shared_handles.push(handle);
        let reopened = self
            .device
            .open_shared_resource(handle)
            .map_err(as_allocation_failure)?;
        Ok((reopened, None))
    }

    fn create_placed(
        &mut self,
        request: &BufferRequest,
        desc: &ResourceDesc,
    ) -> Result<(ResourceId, Option<Placement>)> {
        let placement = self.suballocate(request, desc)?;
        let resource = self
            .device
            .create_placed_resource(placement.region, placement.offset, desc, request.initial_state)
            .map_err(as_allocation_failure)?;
        Ok((resource, Some(placement)))
    }

    fn create_reserved(
        &mut self,
        request: &BufferRequest,
        desc: &ResourceDesc,
    ) -> Result<(ResourceId, Option<Placement>)> {
        let placement = self.suballocate(request, desc)?;
        let resource = self
            .device
            .create_reserved_resource(desc, request.initial_state)
            .map_err(as_allocation_failure)?;
        let resource = OwnedResource::new(&*self.device, resource);

        let tiles = self.device.resource_tiling(resource.id())?;
        let first_tile = u32::try_from(placement.offset / TILE_SIZE_IN_BYTES).map_err(|_| {
            GpuCheckError::invalid_configuration("arena offset exceeds the tile index range")
        })?;
        self.device
            .update_tile_mappings(resource.id(), placement.region, first_tile, tiles)?;

        Ok((resource.into_id(), Some(placement)))
    }

    /// Carve an aligned slice out of the `(kind, shared)` arena pool
    fn suballocate(&mut self, request: &BufferRequest, desc: &ResourceDesc) -> Result<Placement> {
        // Size the slice by what the device will actually occupy, so tile mappings fit
        let size = self
            .device
            .resource_allocation_info(desc)?
            .size
            .max(request.size);
        let kind = request.heap_kind;
        let shared = request.shared;
        let alignment = self.placement_alignment;
        let arena_size = self.heap_kinds[kind].default_arena_size;

        let device = &self.device;
        let shared_handles = &mut self.shared_handles;
        let pool = self
            .pools
            .entry((kind, shared))
            .or_insert_with(|| ArenaPool::new(kind, shared));

        let (placement, created) = pool.place(size, alignment, arena_size, |capacity| {
            create_arena_region(&**device, kind, shared, capacity, alignment, shared_handles)
        })?;

        if created {
            self.stats.arenas_created += 1;
            self.stats.arena_bytes += size.max(arena_size);
            gpucheck_info!(
                LogCategory::Memory,
                "new {} arena{} of {} bytes",
                kind,
                if shared { " (shared)" } else { "" },
                size.max(arena_size)
            );
        }
        self.stats.placed_bytes += size;
        Ok(placement)
    }

    /// Fill a recorded buffer with `data`.
    ///
    /// GPU-local and reserved buffers are staged through a temporary upload
    /// buffer and a blocking submission; upload and readback buffers are
    /// written through a host mapping. `current_state` is the state the
    /// buffer is in now and is restored afterwards.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub fn copy_to_resource(
        &mut self,
        resource: ResourceId,
        data: &[u8],
        current_state: ResourceState,
    ) -> Result<()> {
        let record = *self
            .records
            .get(resource)
            .ok_or_else(|| GpuCheckError::unknown_resource(resource))?;

        let required = self.device.required_intermediate_size(resource, 0, 1)?;
        if data.len() as u64 != required {
            return Err(GpuCheckError::SizeMismatch {
                expected: required,
                actual: data.len() as u64,
            });
        }

        let staged = record.heap_kind == HeapKind::GpuLocal
            || record.creation_method == CreationMethod::Reserved;
        if !staged {
            self.device.write_mapped(resource, 0, data)?;
            self.stats.mapped_uploads += 1;
            return Ok(());
        }

        let device = &*self.device;
        let staging = device
            .create_committed_resource(
                &ResourceDesc::buffer(required, ResourceFlags::NONE),
                HeapKind::Upload,
                false,
                ResourceState::GENERIC_READ,
            )
            .map_err(as_allocation_failure)?;
        let staging = OwnedResource::new(device, staging);
        device.write_mapped(staging.id(), 0, data)?;

        let desc = device.resource_desc(resource)?;
        let footprints = vec![device.copyable_footprint(&desc, 0, 0)?];

        let mut list = CommandList::new("copy_to_resource");
        if current_state.contains(ResourceState::COPY_DEST) {
            record_staged_copy(&mut list, resource, &desc, staging.id(), 0, &footprints);
        } else {
            let mut scoped = TemporaryTransition::new(
                &mut list,
                resource,
                current_state,
                ResourceState::COPY_DEST,
            );
            record_staged_copy(&mut scoped, resource, &desc, staging.id(), 0, &footprints);
        }

        submit_and_wait(device, &list.close(), self.wait_timeout)?;
        self.stats.staged_uploads += 1;
        Ok(())
    }

    /// Release one buffer. Its arena space is not reclaimed.
    pub fn release(&mut self, resource: ResourceId) -> Result<()> {
        if self.records.remove(resource).is_none() {
            return Err(GpuCheckError::unknown_resource(resource));
        }
        self.creation_order.retain(|id| *id != resource);
        self.stats.released_buffers += 1;
        self.device.release_resource(resource)
    }

    pub fn record(&self, resource: ResourceId) -> Option<&AllocationRecord> {
        self.records.get(resource)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn arena_count(&self, kind: HeapKind, shared: bool) -> usize {
        self.pools
            .get(&(kind, shared))
            .map(|pool| pool.arenas().len())
            .unwrap_or(0)
    }

    pub fn arenas(&self, kind: HeapKind, shared: bool) -> &[Arena] {
        self.pools
            .get(&(kind, shared))
            .map(|pool| pool.arenas())
            .unwrap_or(&[])
    }

    pub fn stats(&self) -> AllocationStats {
        self.stats.clone()
    }
}

/// Create one arena region; shared arenas are exported and reopened like shared committed buffers
fn create_arena_region<D: GpuDevice + ?Sized>(
    device: &D,
    kind: HeapKind,
    shared: bool,
    capacity: u64,
    alignment: u64,
    shared_handles: &mut Vec<SharedHandle>,
) -> Result<RegionId> {
    let region = device
        .create_memory_region(&RegionDesc {
            size: capacity,
            kind,
            alignment,
            buffers_only: true,
            shared,
        })
        .map_err(as_allocation_failure)?;
    if !shared {
        return Ok(region);
    }

    let handle = device.create_shared_handle(Shareable::Region(region));
    let reopened = handle.and_then(|handle| {
        shared_handles.push(handle);
        device.open_shared_region(handle)
    });
    if let Err(e) = device.release_region(region) {
        debug!("release of exported region {:?} failed: {}", region, e);
    }
    reopened.map_err(as_allocation_failure)
}

fn as_allocation_failure(e: GpuCheckError) -> GpuCheckError {
    match e {
        GpuCheckError::AllocationFailure { .. } | GpuCheckError::InvalidConfiguration { .. } => e,
        other => GpuCheckError::allocation_failure(other.to_string()),
    }
}

impl<D: GpuDevice + ?Sized> Drop for BufferAllocator<D> {
    fn drop(&mut self) {
        // Buffers first, newest first, so no arena outlives what is placed in it
        for resource in self.creation_order.drain(..).rev() {
            if let Err(e) = self.device.release_resource(resource) {
                debug!("teardown: release of {:?} failed: {}", resource, e);
            }
        }
        self.records.clear();

        for handle in self.shared_handles.drain(..).rev() {
            if let Err(e) = self.device.close_shared_handle(handle) {
                debug!("teardown: close of {:?} failed: {}", handle, e);
            }
        }

        for pool in self.pools.values_mut() {
            for arena in pool.drain_newest_first() {
                if let Err(e) = self.device.release_region(arena.region) {
                    debug!("teardown: release of {:?} failed: {}", arena.region, e);
                }
            }
        }
    }
}
