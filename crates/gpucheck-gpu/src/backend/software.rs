//! Deterministic in-memory device
//!
//! Backs every device contract with host memory. Textures are stored
//! pitch-linear using the same layout as their copyable footprints, so row
//! padding is observable and texture bytes do not depend on where the texture
//! is placed. Placed resources alias the bytes of their region.
//!
//! Submissions execute synchronously inside `execute` and either apply in
//! full or leave no trace. Fault injection hooks
//! let tests drive the allocation, submission, aliasing and timeout failure
//! paths without a GPU.

use crate::command::{ClosedCommandList, Command};
use crate::device::{CommandQueue, MemoryProvider, SurfaceIntrospection};
use crate::layout;
use crate::sync::timeout_millis;
use crate::types::{
    AllocationInfo, DeviceCapabilities, FenceId, Footprint, HeapKind, RegionDesc, RegionId,
    ResourceDesc, ResourceId, ResourceState, Shareable, SharedHandle,
    DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT, TILE_SIZE_IN_BYTES,
};
use gpucheck_core::{gpucheck_debug, ErrorContext, GpuCheckError, LogCategory, Result};
use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;
use tracing::{debug, trace};

const COMPONENT: &str = "software-device";

new_key_type! {
    struct MemoryKey;
}

#[derive(Debug)]
struct Memory {
    bytes: Vec<u8>,
    kind: HeapKind,
    refs: u32,
}

#[derive(Debug, Clone, Copy)]
enum Backing {
    Committed { memory: MemoryKey },
    Placed { memory: MemoryKey, offset: u64 },
    Reserved { binding: Option<(MemoryKey, u64)>, tiles: u32 },
}

impl Backing {
    fn memory(&self) -> Option<MemoryKey> {
        match *self {
            Backing::Committed { memory } | Backing::Placed { memory, .. } => Some(memory),
            Backing::Reserved { binding, .. } => binding.map(|(memory, _)| memory),
        }
    }
}

#[derive(Debug, Clone)]
struct ResourceEntry {
    desc: ResourceDesc,
    backing: Backing,
    state: ResourceState,
    shared: bool,
}

#[derive(Debug, Clone)]
struct RegionEntry {
    memory: MemoryKey,
    desc: RegionDesc,
}

#[derive(Debug)]
enum SharedObject {
    Resource(ResourceEntry),
    Region(RegionEntry),
}

/// Undo records of one submission
#[derive(Debug, Default)]
struct Journal {
    states: Vec<(ResourceId, ResourceState)>,
    writes: Vec<(MemoryKey, u64, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct Faults {
    failed_submissions: u32,
    corrupt_aliased_copies: bool,
    stalled_fences: bool,
}

#[derive(Debug, Default)]
struct SoftwareState {
    memories: SlotMap<MemoryKey, Memory>,
    regions: SlotMap<RegionId, RegionEntry>,
    resources: SlotMap<ResourceId, ResourceEntry>,
    fences: SlotMap<FenceId, u64>,
    shared: HashMap<u64, SharedObject>,
    next_shared_handle: u64,
    bytes_in_use: u64,
    submissions: u64,
    faults: Faults,
}

/// Host-memory implementation of [`GpuDevice`](crate::GpuDevice)
#[derive(Debug)]
pub struct SoftwareDevice {
    capabilities: DeviceCapabilities,
    memory_budget: Option<u64>,
    state: Mutex<SoftwareState>,
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareDevice {
    /// A device reporting resource heap tier 2 and heap serialization tier 10
    pub fn new() -> Self {
        Self::with_capabilities(DeviceCapabilities {
            resource_heap_tier: 2,
            heap_serialization_tier: 10,
            shared_handles: true,
            reserved_resources: true,
        })
    }

    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            memory_budget: None,
            state: Mutex::new(SoftwareState {
                next_shared_handle: 1,
                ..Default::default()
            }),
        }
    }

    /// Refuse memory creation once `bytes` are in use
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Make the next `count` calls to `execute` fail
    pub fn fail_next_submissions(&self, count: u32) {
        self.state.lock().faults.failed_submissions = count;
    }

    /// Flip every byte of buffer copies whose source and destination share memory
    pub fn set_alias_corruption(&self, enabled: bool) {
        self.state.lock().faults.corrupt_aliased_copies = enabled;
    }

    /// Stop fences from advancing
    pub fn set_fences_stalled(&self, stalled: bool) {
        self.state.lock().faults.stalled_fences = stalled;
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.state.lock().bytes_in_use
    }

    pub fn live_resources(&self) -> usize {
        self.state.lock().resources.len()
    }

    pub fn live_regions(&self) -> usize {
        self.state.lock().regions.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_shared_handles(&self) -> usize {
        self.state.lock().shared.len()
    }

    /// Number of command lists executed so far
    pub fn submissions(&self) -> u64 {
        self.state.lock().submissions
    }

    /// Current tracked state of a resource
    pub fn resource_state(&self, resource: ResourceId) -> Result<ResourceState> {
        Ok(self.state.lock().resource(resource)?.state)
    }

    /// Write tightly packed rows into a texture subresource, bypassing the queue.
    ///
    /// Stands in for draw calls when a test needs known surface contents.
    pub fn write_texture(&self, resource: ResourceId, subresource: u32, packed: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.resource(resource)?.clone();
        let storage = state.storage_footprint(&entry.desc, subresource)?;
        let pitched = crate::upload::pitch_rows(&storage, packed)?;
        let (memory, base) = state.location(&entry)?;

        let row = storage.row_size_bytes as usize;
        for r in 0..storage.num_rows as usize {
            let at = r * storage.row_pitch as usize;
            state.write(memory, base + storage.offset + at as u64, &pitched[at..at + row])?;
        }
        Ok(())
    }

    /// Read a texture subresource back as tightly packed rows
    pub fn read_texture(&self, resource: ResourceId, subresource: u32) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let entry = state.resource(resource)?.clone();
        let storage = state.storage_footprint(&entry.desc, subresource)?;
        let (memory, base) = state.location(&entry)?;

        let mut out = Vec::with_capacity((storage.row_size_bytes * u64::from(storage.num_rows)) as usize);
        for r in 0..u64::from(storage.num_rows) {
            out.extend(state.read(
                memory,
                base + storage.offset + r * storage.row_pitch,
                storage.row_size_bytes,
            )?);
        }
        Ok(out)
    }
}

impl SoftwareState {
    fn resource(&self, id: ResourceId) -> Result<&ResourceEntry> {
        self.resources
            .get(id)
            .ok_or_else(|| GpuCheckError::unknown_resource(id))
    }

    fn region(&self, id: RegionId) -> Result<&RegionEntry> {
        self.regions
            .get(id)
            .ok_or_else(|| GpuCheckError::unknown_resource(id))
    }

    fn alloc_memory(&mut self, size: u64, kind: HeapKind, budget: Option<u64>) -> Result<MemoryKey> {
        if let Some(budget) = budget {
            if self.bytes_in_use + size > budget {
                return Err(GpuCheckError::allocation_failure_with_context(
                    "out of device memory",
                    ErrorContext::new("allocate_memory", COMPONENT)
                        .with_metadata("requested", size)
                        .with_metadata("in_use", self.bytes_in_use)
                        .with_metadata("budget", budget)
                        .with_metadata("kind", kind),
                ));
            }
        }

        self.bytes_in_use += size;
        Ok(self.memories.insert(Memory {
            bytes: vec![0; size as usize],
            kind,
            refs: 1,
        }))
    }

    fn retain(&mut self, key: MemoryKey) {
        if let Some(memory) = self.memories.get_mut(key) {
            memory.refs += 1;
        }
    }

    fn release_memory(&mut self, key: MemoryKey) {
        let drop_it = match self.memories.get_mut(key) {
            Some(memory) => {
                memory.refs -= 1;
                memory.refs == 0
            }
            None => false,
        };
        if drop_it {
            if let Some(memory) = self.memories.remove(key) {
                self.bytes_in_use -= memory.bytes.len() as u64;
            }
        }
    }

    fn memory_kind(&self, key: MemoryKey) -> Option<HeapKind> {
        self.memories.get(key).map(|m| m.kind)
    }

    /// Where the resource's bytes start
    fn location(&self, entry: &ResourceEntry) -> Result<(MemoryKey, u64)> {
        match entry.backing {
            Backing::Committed { memory } => Ok((memory, 0)),
            Backing::Placed { memory, offset } => Ok((memory, offset)),
            Backing::Reserved { binding: Some(binding), .. } => Ok(binding),
            Backing::Reserved { binding: None, .. } => Err(GpuCheckError::device_lost(
                "access to a reserved resource with no tiles mapped",
            )),
        }
    }

    /// Layout of a texture subresource inside the texture's own storage
    fn storage_footprint(&self, desc: &ResourceDesc, subresource: u32) -> Result<Footprint> {
        if desc.is_buffer() {
            return Err(GpuCheckError::invalid_configuration(
                "texture access on a buffer resource",
            ));
        }
        let all = layout::footprints(desc, 0, desc.subresource_count(), 0)?;
        all.get(subresource as usize).copied().ok_or_else(|| {
            GpuCheckError::invalid_configuration(format!("subresource {} out of range", subresource))
        })
    }

    /// Bytes a resource spans in its backing memory
    fn storage_size(desc: &ResourceDesc) -> Result<u64> {
        if desc.is_buffer() {
            Ok(desc.width)
        } else {
            layout::intermediate_size(desc, 0, desc.subresource_count())
        }
    }

    fn read(&self, key: MemoryKey, offset: u64, len: u64) -> Result<Vec<u8>> {
        let memory = self
            .memories
            .get(key)
            .ok_or_else(|| GpuCheckError::device_lost("read from released memory"))?;
        let end = offset + len;
        if end > memory.bytes.len() as u64 {
            return Err(GpuCheckError::device_lost(format!(
                "read of {}..{} past the end of a {} byte allocation",
                offset,
                end,
                memory.bytes.len()
            )));
        }
        Ok(memory.bytes[offset as usize..end as usize].to_vec())
    }

    fn write(&mut self, key: MemoryKey, offset: u64, data: &[u8]) -> Result<()> {
        let memory = self
            .memories
            .get_mut(key)
            .ok_or_else(|| GpuCheckError::device_lost("write to released memory"))?;
        let end = offset + data.len() as u64;
        if end > memory.bytes.len() as u64 {
            return Err(GpuCheckError::device_lost(format!(
                "write of {}..{} past the end of a {} byte allocation",
                offset,
                end,
                memory.bytes.len()
            )));
        }
        memory.bytes[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn write_journaled(
        &mut self,
        journal: &mut Journal,
        key: MemoryKey,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let previous = self.read(key, offset, data.len() as u64)?;
        self.write(key, offset, data)?;
        journal.writes.push((key, offset, previous));
        Ok(())
    }

    /// Undo everything a failed submission applied, newest first
    fn roll_back(&mut self, journal: Journal) {
        for (key, offset, bytes) in journal.writes.into_iter().rev() {
            if let Some(memory) = self.memories.get_mut(key) {
                let start = offset as usize;
                memory.bytes[start..start + bytes.len()].copy_from_slice(&bytes);
            }
        }
        for (resource, state) in journal.states.into_iter().rev() {
            if let Some(entry) = self.resources.get_mut(resource) {
                entry.state = state;
            }
        }
    }

    fn insert_resource(&mut self, entry: ResourceEntry) -> ResourceId {
        if let Some(memory) = entry.backing.memory() {
            self.retain(memory);
        }
        self.resources.insert(entry)
    }

    fn mapped_buffer(&self, resource: ResourceId) -> Result<(MemoryKey, u64, u64)> {
        let entry = self.resource(resource)?;
        if !entry.desc.is_buffer() {
            return Err(GpuCheckError::invalid_configuration(
                "only buffers can be mapped",
            ));
        }
        let (memory, base) = self.location(entry)?;
        let host_visible = self
            .memory_kind(memory)
            .map(HeapKind::is_host_visible)
            .unwrap_or(false);
        if !host_visible || matches!(entry.backing, Backing::Reserved { .. }) {
            return Err(GpuCheckError::invalid_configuration(format!(
                "{:?} is not host visible",
                resource
            )));
        }
        Ok((memory, base, entry.desc.width))
    }

    fn check_state(&self, resource: ResourceId, required: ResourceState, role: &str) -> Result<()> {
        let entry = self.resource(resource)?;
        // Buffers are promoted implicitly
        if entry.desc.is_buffer() || entry.state.contains(required) {
            return Ok(());
        }
        Err(GpuCheckError::device_lost(format!(
            "copy {} {:?} is in {:?}, needs {:?}",
            role, resource, entry.state, required
        )))
    }

    fn apply(&mut self, command: &Command, journal: &mut Journal) -> Result<()> {
        match *command {
            Command::Transition {
                resource,
                before,
                after,
                ..
            } => {
                let entry = self
                    .resources
                    .get_mut(resource)
                    .ok_or_else(|| GpuCheckError::unknown_resource(resource))?;
                if before == after {
                    return Err(GpuCheckError::device_lost(format!(
                        "transition of {:?} from {:?} to itself",
                        resource, before
                    )));
                }
                if entry.state != before {
                    return Err(GpuCheckError::device_lost(format!(
                        "transition of {:?} expected {:?} but resource is in {:?}",
                        resource, before, entry.state
                    )));
                }
                journal.states.push((resource, entry.state));
                entry.state = after;
            }
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                num_bytes,
            } => {
                let src_entry = self.resource(src)?.clone();
                let dst_entry = self.resource(dst)?.clone();
                if src_offset + num_bytes > src_entry.desc.width
                    || dst_offset + num_bytes > dst_entry.desc.width
                {
                    return Err(GpuCheckError::device_lost(format!(
                        "buffer copy of {} bytes exceeds source ({}) or destination ({})",
                        num_bytes, src_entry.desc.width, dst_entry.desc.width
                    )));
                }
                let (src_mem, src_base) = self.location(&src_entry)?;
                let (dst_mem, dst_base) = self.location(&dst_entry)?;
                let mut bytes = self.read(src_mem, src_base + src_offset, num_bytes)?;
                if self.faults.corrupt_aliased_copies && src_mem == dst_mem {
                    bytes.iter_mut().for_each(|b| *b ^= 0xFF);
                }
                self.write_journaled(journal, dst_mem, dst_base + dst_offset, &bytes)?;
            }
            Command::CopyResource { dst, src } => {
                self.check_state(src, ResourceState::COPY_SOURCE, "source")?;
                self.check_state(dst, ResourceState::COPY_DEST, "destination")?;
                let src_entry = self.resource(src)?.clone();
                let dst_entry = self.resource(dst)?.clone();
                let same_shape = src_entry.desc.dimension == dst_entry.desc.dimension
                    && src_entry.desc.width == dst_entry.desc.width
                    && src_entry.desc.height == dst_entry.desc.height
                    && src_entry.desc.format == dst_entry.desc.format
                    && src_entry.desc.mip_levels == dst_entry.desc.mip_levels
                    && src_entry.desc.array_size == dst_entry.desc.array_size;
                if !same_shape {
                    return Err(GpuCheckError::device_lost(format!(
                        "CopyResource between mismatched descriptions {:?} and {:?}",
                        src_entry.desc, dst_entry.desc
                    )));
                }
                let size = Self::storage_size(&src_entry.desc)?;
                let (src_mem, src_base) = self.location(&src_entry)?;
                let (dst_mem, dst_base) = self.location(&dst_entry)?;
                let bytes = self.read(src_mem, src_base, size)?;
                self.write_journaled(journal, dst_mem, dst_base, &bytes)?;
            }
            Command::CopyTextureToBuffer {
                dst,
                footprint,
                src,
                subresource,
            } => {
                self.check_state(src, ResourceState::COPY_SOURCE, "source")?;
                let src_entry = self.resource(src)?.clone();
                let dst_entry = self.resource(dst)?.clone();
                let storage = self.storage_footprint(&src_entry.desc, subresource)?;
                check_footprint(&storage, &footprint, dst_entry.desc.width)?;
                let (src_mem, src_base) = self.location(&src_entry)?;
                let (dst_mem, dst_base) = self.location(&dst_entry)?;
                for r in 0..u64::from(storage.num_rows) {
                    let row = self.read(
                        src_mem,
                        src_base + storage.offset + r * storage.row_pitch,
                        storage.row_size_bytes,
                    )?;
                    self.write_journaled(
                        journal,
                        dst_mem,
                        dst_base + footprint.offset + r * footprint.row_pitch,
                        &row,
                    )?;
                }
            }
            Command::CopyBufferToTexture {
                dst,
                subresource,
                src,
                footprint,
            } => {
                self.check_state(dst, ResourceState::COPY_DEST, "destination")?;
                let src_entry = self.resource(src)?.clone();
                let dst_entry = self.resource(dst)?.clone();
                let storage = self.storage_footprint(&dst_entry.desc, subresource)?;
                check_footprint(&storage, &footprint, src_entry.desc.width)?;
                let (src_mem, src_base) = self.location(&src_entry)?;
                let (dst_mem, dst_base) = self.location(&dst_entry)?;
                for r in 0..u64::from(storage.num_rows) {
                    let row = self.read(
                        src_mem,
                        src_base + footprint.offset + r * footprint.row_pitch,
                        storage.row_size_bytes,
                    )?;
                    self.write_journaled(
                        journal,
                        dst_mem,
                        dst_base + storage.offset + r * storage.row_pitch,
                        &row,
                    )?;
                }
            }
        }
        Ok(())
    }
}

fn check_footprint(storage: &Footprint, footprint: &Footprint, buffer_size: u64) -> Result<()> {
    if storage.row_size_bytes != footprint.row_size_bytes
        || storage.num_rows != footprint.num_rows
        || footprint.row_pitch < footprint.row_size_bytes
    {
        return Err(GpuCheckError::device_lost(format!(
            "footprint {:?} does not describe subresource {:?}",
            footprint, storage
        )));
    }
    if footprint.offset + footprint.total_bytes > buffer_size {
        return Err(GpuCheckError::device_lost(format!(
            "footprint ends at {} but the buffer holds {} bytes",
            footprint.offset + footprint.total_bytes,
            buffer_size
        )));
    }
    Ok(())
}

fn check_initial_state(kind: HeapKind, state: ResourceState) -> Result<()> {
    let required = match kind {
        HeapKind::GpuLocal => return Ok(()),
        HeapKind::Upload => ResourceState::GENERIC_READ,
        HeapKind::Readback => ResourceState::COPY_DEST,
    };
    if state == required {
        Ok(())
    } else {
        Err(GpuCheckError::invalid_configuration(format!(
            "{} resources must start in {:?}, got {:?}",
            kind, required, state
        )))
    }
}

impl MemoryProvider for SoftwareDevice {
    fn create_memory_region(&self, desc: &RegionDesc) -> Result<RegionId> {
        if desc.size == 0 {
            return Err(GpuCheckError::invalid_configuration("memory region of zero bytes"));
        }
        if desc.shared && (desc.kind.is_host_visible() || !self.capabilities.shared_handles) {
            return Err(GpuCheckError::invalid_configuration(format!(
                "{} memory cannot be shared on this device",
                desc.kind
            )));
        }

        let mut state = self.state.lock();
        let memory = state.alloc_memory(desc.size, desc.kind, self.memory_budget)?;
        let id = state.regions.insert(RegionEntry { memory, desc: *desc });
        trace!("created {} region {:?} of {} bytes", desc.kind, id, desc.size);
        Ok(id)
    }

    fn create_placed_resource(
        &self,
        region: RegionId,
        offset: u64,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<ResourceId> {
        let info = layout::allocation_info(desc)?;
        let mut state = self.state.lock();
        let region_entry = state.region(region)?.clone();

        if offset % DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT != 0 {
            return Err(GpuCheckError::invalid_configuration(format!(
                "placement offset {} is not {}-aligned",
                offset, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT
            )));
        }
        if region_entry.desc.buffers_only && !desc.is_buffer() {
            return Err(GpuCheckError::invalid_configuration(
                "textures cannot be placed in a buffers-only region",
            ));
        }
        if offset + SoftwareState::storage_size(desc)? > region_entry.desc.size {
            return Err(GpuCheckError::invalid_configuration_with_context(
                "placed resource does not fit its region",
                ErrorContext::new("create_placed_resource", COMPONENT)
                    .with_metadata("offset", offset)
                    .with_metadata("size", info.size)
                    .with_metadata("region_size", region_entry.desc.size),
            ));
        }
        if desc.is_buffer() {
            check_initial_state(region_entry.desc.kind, initial_state)?;
        }

        let id = state.insert_resource(ResourceEntry {
            desc: *desc,
            backing: Backing::Placed {
                memory: region_entry.memory,
                offset,
            },
            state: initial_state,
            shared: false,
        });
        trace!("placed {:?} at {} in {:?}", id, offset, region);
        Ok(id)
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        heap_kind: HeapKind,
        shared: bool,
        initial_state: ResourceState,
    ) -> Result<ResourceId> {
        if shared && (heap_kind.is_host_visible() || !self.capabilities.shared_handles) {
            return Err(GpuCheckError::invalid_configuration(format!(
                "{} resources cannot be shared on this device",
                heap_kind
            )));
        }
        check_initial_state(heap_kind, initial_state)?;
        let info = layout::allocation_info(desc)?;

        let mut state = self.state.lock();
        let memory = state.alloc_memory(info.size, heap_kind, self.memory_budget)?;
        let id = state.resources.insert(ResourceEntry {
            desc: *desc,
            backing: Backing::Committed { memory },
            state: initial_state,
            shared,
        });
        trace!("committed {} {:?} of {} bytes", heap_kind, id, info.size);
        Ok(id)
    }

    fn create_reserved_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<ResourceId> {
        if !self.capabilities.reserved_resources {
            return Err(GpuCheckError::invalid_configuration(
                "reserved resources are not supported on this device",
            ));
        }
        let info = layout::allocation_info(desc)?;
        let tiles = (info.size / TILE_SIZE_IN_BYTES) as u32;

        let mut state = self.state.lock();
        Ok(state.resources.insert(ResourceEntry {
            desc: *desc,
            backing: Backing::Reserved {
                binding: None,
                tiles,
            },
            state: initial_state,
            shared: false,
        }))
    }

    fn resource_tiling(&self, resource: ResourceId) -> Result<u32> {
        match self.state.lock().resource(resource)?.backing {
            Backing::Reserved { tiles, .. } => Ok(tiles),
            _ => Err(GpuCheckError::invalid_configuration(format!(
                "{:?} is not a reserved resource",
                resource
            ))),
        }
    }

    fn update_tile_mappings(
        &self,
        resource: ResourceId,
        region: RegionId,
        first_tile: u32,
        tile_count: u32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let region_entry = state.region(region)?.clone();
        let entry = state
            .resources
            .get(resource)
            .ok_or_else(|| GpuCheckError::unknown_resource(resource))?;

        let (previous, tiles) = match entry.backing {
            Backing::Reserved { binding, tiles } => (binding, tiles),
            _ => {
                return Err(GpuCheckError::invalid_configuration(format!(
                    "{:?} is not a reserved resource",
                    resource
                )))
            }
        };
        if tile_count != tiles {
            return Err(GpuCheckError::invalid_configuration(format!(
                "partial tile mapping ({} of {} tiles) is not supported",
                tile_count, tiles
            )));
        }
        let offset = u64::from(first_tile) * TILE_SIZE_IN_BYTES;
        if offset + u64::from(tile_count) * TILE_SIZE_IN_BYTES > region_entry.desc.size {
            return Err(GpuCheckError::invalid_configuration(format!(
                "tiles {}..{} exceed region of {} bytes",
                first_tile,
                first_tile + tile_count,
                region_entry.desc.size
            )));
        }

        state.retain(region_entry.memory);
        if let Some((old, _)) = previous {
            state.release_memory(old);
        }
        if let Some(entry) = state.resources.get_mut(resource) {
            entry.backing = Backing::Reserved {
                binding: Some((region_entry.memory, offset)),
                tiles,
            };
        }
        Ok(())
    }

    fn create_shared_handle(&self, object: Shareable) -> Result<SharedHandle> {
        if !self.capabilities.shared_handles {
            return Err(GpuCheckError::invalid_configuration(
                "shared handles are not supported on this device",
            ));
        }

        let mut state = self.state.lock();
        let (shared, memory) = match object {
            Shareable::Resource(id) => {
                let entry = state.resource(id)?.clone();
                if !entry.shared {
                    return Err(GpuCheckError::invalid_configuration(format!(
                        "{:?} was not created shareable",
                        id
                    )));
                }
                let memory = entry.backing.memory();
                (SharedObject::Resource(entry), memory)
            }
            Shareable::Region(id) => {
                let entry = state.region(id)?.clone();
                if !entry.desc.shared {
                    return Err(GpuCheckError::invalid_configuration(format!(
                        "{:?} was not created shareable",
                        id
                    )));
                }
                let memory = Some(entry.memory);
                (SharedObject::Region(entry), memory)
            }
        };

        if let Some(memory) = memory {
            state.retain(memory);
        }
        let handle = state.next_shared_handle;
        state.next_shared_handle += 1;
        state.shared.insert(handle, shared);
        Ok(SharedHandle(handle))
    }

    fn open_shared_resource(&self, handle: SharedHandle) -> Result<ResourceId> {
        let mut state = self.state.lock();
        let entry = match state.shared.get(&handle.0) {
            Some(SharedObject::Resource(entry)) => entry.clone(),
            _ => return Err(GpuCheckError::unknown_resource(handle)),
        };
        Ok(state.insert_resource(entry))
    }

    fn open_shared_region(&self, handle: SharedHandle) -> Result<RegionId> {
        let mut state = self.state.lock();
        let entry = match state.shared.get(&handle.0) {
            Some(SharedObject::Region(entry)) => entry.clone(),
            _ => return Err(GpuCheckError::unknown_resource(handle)),
        };
        state.retain(entry.memory);
        Ok(state.regions.insert(entry))
    }

    fn close_shared_handle(&self, handle: SharedHandle) -> Result<()> {
        let mut state = self.state.lock();
        let memory = match state.shared.remove(&handle.0) {
            Some(SharedObject::Resource(entry)) => entry.backing.memory(),
            Some(SharedObject::Region(entry)) => Some(entry.memory),
            None => return Err(GpuCheckError::unknown_resource(handle)),
        };
        if let Some(memory) = memory {
            state.release_memory(memory);
        }
        Ok(())
    }

    fn write_mapped(&self, resource: ResourceId, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let (memory, base, size) = state.mapped_buffer(resource)?;
        if offset + data.len() as u64 > size {
            return Err(GpuCheckError::SizeMismatch {
                expected: size - offset.min(size),
                actual: data.len() as u64,
            });
        }
        state.write(memory, base + offset, data)
    }

    fn read_mapped(&self, resource: ResourceId, range: Range<u64>) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let (memory, base, size) = state.mapped_buffer(resource)?;
        if range.start > range.end || range.end > size {
            return Err(GpuCheckError::invalid_configuration(format!(
                "mapped range {:?} outside a {} byte buffer",
                range, size
            )));
        }
        state.read(memory, base + range.start, range.end - range.start)
    }

    fn release_resource(&self, resource: ResourceId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .resources
            .remove(resource)
            .ok_or_else(|| GpuCheckError::unknown_resource(resource))?;
        if let Some(memory) = entry.backing.memory() {
            state.release_memory(memory);
        }
        Ok(())
    }

    fn release_region(&self, region: RegionId) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .regions
            .remove(region)
            .ok_or_else(|| GpuCheckError::unknown_resource(region))?;
        state.release_memory(entry.memory);
        Ok(())
    }
}

impl CommandQueue for SoftwareDevice {
    fn execute(&self, list: &ClosedCommandList) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.failed_submissions > 0 {
            state.faults.failed_submissions -= 1;
            return Err(GpuCheckError::device_lost(format!(
                "injected failure executing '{}'",
                list.label()
            )));
        }

        let mut journal = Journal::default();
        for command in list.commands() {
            if let Err(err) = state.apply(command, &mut journal) {
                gpucheck_debug!(
                    LogCategory::Device,
                    "rolling back '{}' ({} writes, {} transitions)",
                    list.label(),
                    journal.writes.len(),
                    journal.states.len()
                );
                state.roll_back(journal);
                return Err(err);
            }
        }
        state.submissions += 1;
        debug!("executed '{}' ({} commands)", list.label(), list.len());
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<FenceId> {
        Ok(self.state.lock().fences.insert(initial_value))
    }

    fn signal(&self, fence: FenceId, value: u64) -> Result<()> {
        let mut state = self.state.lock();
        let stalled = state.faults.stalled_fences;
        let completed = state
            .fences
            .get_mut(fence)
            .ok_or_else(|| GpuCheckError::unknown_resource(fence))?;
        if !stalled {
            *completed = (*completed).max(value);
        }
        Ok(())
    }

    fn completed_value(&self, fence: FenceId) -> Result<u64> {
        self.state
            .lock()
            .fences
            .get(fence)
            .copied()
            .ok_or_else(|| GpuCheckError::unknown_resource(fence))
    }

    fn wait(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> Result<()> {
        if self.completed_value(fence)? >= value {
            return Ok(());
        }

        // Submissions complete inside `execute`, so nothing can advance the fence from here
        match timeout {
            Some(timeout) => {
                std::thread::sleep(timeout);
                if self.completed_value(fence)? >= value {
                    return Ok(());
                }
                Err(GpuCheckError::Timeout {
                    waited_ms: timeout_millis(timeout),
                })
            }
            None => Err(GpuCheckError::device_lost(format!(
                "fence {:?} can never reach {}: no signal is pending",
                fence, value
            ))),
        }
    }

    fn release_fence(&self, fence: FenceId) -> Result<()> {
        self.state
            .lock()
            .fences
            .remove(fence)
            .map(|_| ())
            .ok_or_else(|| GpuCheckError::unknown_resource(fence))
    }
}

impl SurfaceIntrospection for SoftwareDevice {
    fn resource_desc(&self, resource: ResourceId) -> Result<ResourceDesc> {
        Ok(self.state.lock().resource(resource)?.desc)
    }

    fn copyable_footprint(
        &self,
        desc: &ResourceDesc,
        subresource: u32,
        base_offset: u64,
    ) -> Result<Footprint> {
        layout::footprint(desc, subresource, base_offset)
    }

    fn resource_allocation_info(&self, desc: &ResourceDesc) -> Result<AllocationInfo> {
        layout::allocation_info(desc)
    }

    fn required_intermediate_size(
        &self,
        resource: ResourceId,
        first_subresource: u32,
        count: u32,
    ) -> Result<u64> {
        let desc = self.resource_desc(resource)?;
        layout::intermediate_size(&desc, first_subresource, count)
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.capabilities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandList;
    use crate::sync::submit_and_wait;
    use crate::types::{PixelFormat, ResourceFlags};
    use pretty_assertions::assert_eq;

    fn upload_buffer(device: &SoftwareDevice, size: u64) -> ResourceId {
        device
            .create_committed_resource(
                &ResourceDesc::buffer(size, ResourceFlags::NONE),
                HeapKind::Upload,
                false,
                ResourceState::GENERIC_READ,
            )
            .unwrap()
    }

    #[test]
    fn test_placed_resources_alias_region_bytes() {
        let device = SoftwareDevice::new();
        let region = device
            .create_memory_region(&RegionDesc {
                size: 128 * 1024,
                kind: HeapKind::Upload,
                alignment: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
                buffers_only: true,
                shared: false,
            })
            .unwrap();
        let desc = ResourceDesc::buffer(64 * 1024, ResourceFlags::NONE);
        let a = device
            .create_placed_resource(region, 0, &desc, ResourceState::GENERIC_READ)
            .unwrap();
        let b = device
            .create_placed_resource(region, 0, &desc, ResourceState::GENERIC_READ)
            .unwrap();

        device.write_mapped(a, 10, &[1, 2, 3]).unwrap();
        assert_eq!(device.read_mapped(b, 10..13).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_memory_budget_refuses_allocation() {
        let device = SoftwareDevice::new().with_memory_budget(64 * 1024);
        upload_buffer(&device, 16);

        let err = device
            .create_committed_resource(
                &ResourceDesc::buffer(16, ResourceFlags::NONE),
                HeapKind::Upload,
                false,
                ResourceState::GENERIC_READ,
            )
            .unwrap_err();
        assert!(matches!(err, GpuCheckError::AllocationFailure { .. }));
    }

    #[test]
    fn test_release_returns_memory() {
        let device = SoftwareDevice::new();
        let buffer = upload_buffer(&device, 16);
        assert_eq!(device.bytes_in_use(), 64 * 1024);

        device.release_resource(buffer).unwrap();
        assert_eq!(device.bytes_in_use(), 0);
        // Generation check rejects the stale key
        assert!(matches!(
            device.release_resource(buffer),
            Err(GpuCheckError::UnknownResource { .. })
        ));
    }

    #[test]
    fn test_texture_round_trip_through_readback() {
        let device = SoftwareDevice::new();
        let desc = ResourceDesc::texture_2d(PixelFormat::Bgra8Unorm, 2, 2, 1, 1, ResourceFlags::NONE);
        let texture = device
            .create_committed_resource(&desc, HeapKind::GpuLocal, false, ResourceState::COPY_SOURCE)
            .unwrap();
        let pixels: Vec<u8> = (1u8..=16).collect();
        device.write_texture(texture, 0, &pixels).unwrap();

        let footprint = device.copyable_footprint(&desc, 0, 0).unwrap();
        let readback = device
            .create_committed_resource(
                &ResourceDesc::buffer(footprint.total_bytes, ResourceFlags::NONE),
                HeapKind::Readback,
                false,
                ResourceState::COPY_DEST,
            )
            .unwrap();

        let mut list = CommandList::new("readback");
        list.copy_texture_to_buffer(readback, footprint, texture, 0);
        submit_and_wait(&device, &list.close(), None).unwrap();

        let bytes = device.read_mapped(readback, 0..footprint.total_bytes).unwrap();
        assert_eq!(&bytes[..8], &pixels[..8]);
        assert_eq!(&bytes[256..264], &pixels[8..]);
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn test_transition_validation() {
        let device = SoftwareDevice::new();
        let desc = ResourceDesc::texture_2d(PixelFormat::Bgra8Unorm, 1, 1, 1, 1, ResourceFlags::NONE);
        let texture = device
            .create_committed_resource(&desc, HeapKind::GpuLocal, false, ResourceState::RENDER_TARGET)
            .unwrap();

        let mut list = CommandList::new("bad");
        list.resource_barrier(
            texture,
            crate::types::ALL_SUBRESOURCES,
            ResourceState::COMMON,
            ResourceState::COPY_SOURCE,
        );
        assert!(matches!(
            device.execute(&list.close()),
            Err(GpuCheckError::DeviceLost { .. })
        ));
        assert_eq!(device.resource_state(texture).unwrap(), ResourceState::RENDER_TARGET);
    }

    #[test]
    fn test_failed_submission_leaves_no_partial_effects() {
        let device = SoftwareDevice::new();
        let source = upload_buffer(&device, 16);
        device.write_mapped(source, 0, &[7; 16]).unwrap();
        let desc = ResourceDesc::texture_2d(PixelFormat::Bgra8Unorm, 1, 1, 1, 1, ResourceFlags::NONE);
        let texture = device
            .create_committed_resource(&desc, HeapKind::GpuLocal, false, ResourceState::RENDER_TARGET)
            .unwrap();
        let target = device
            .create_committed_resource(
                &ResourceDesc::buffer(16, ResourceFlags::NONE),
                HeapKind::Readback,
                false,
                ResourceState::COPY_DEST,
            )
            .unwrap();

        let mut list = CommandList::new("half-valid");
        list.resource_barrier(
            texture,
            crate::types::ALL_SUBRESOURCES,
            ResourceState::RENDER_TARGET,
            ResourceState::COPY_SOURCE,
        );
        list.copy_buffer_region(target, 0, source, 0, 16);
        // Out of range, fails after the two commands above applied
        list.copy_buffer_region(target, 8, source, 0, 16);

        assert!(matches!(
            device.execute(&list.close()),
            Err(GpuCheckError::DeviceLost { .. })
        ));
        assert_eq!(device.resource_state(texture).unwrap(), ResourceState::RENDER_TARGET);
        assert_eq!(device.read_mapped(target, 0..16).unwrap(), vec![0; 16]);
        assert_eq!(device.submissions(), 0);
    }

    #[test]
    fn test_same_state_barrier_rejected() {
        let device = SoftwareDevice::new();
        let desc = ResourceDesc::texture_2d(PixelFormat::Bgra8Unorm, 1, 1, 1, 1, ResourceFlags::NONE);
        let texture = device
            .create_committed_resource(&desc, HeapKind::GpuLocal, false, ResourceState::COPY_SOURCE)
            .unwrap();

        let mut list = CommandList::new("noop");
        list.resource_barrier(
            texture,
            crate::types::ALL_SUBRESOURCES,
            ResourceState::COPY_SOURCE,
            ResourceState::COPY_SOURCE,
        );
        assert!(device.execute(&list.close()).is_err());
    }

    #[test]
    fn test_stalled_fence_times_out() {
        let device = SoftwareDevice::new();
        device.set_fences_stalled(true);
        let list = CommandList::new("empty").close();

        let err = submit_and_wait(&device, &list, Some(Duration::from_millis(5))).unwrap_err();
        assert!(matches!(err, GpuCheckError::Timeout { waited_ms: 5 }));
    }

    #[test]
    fn test_injected_submission_failure() {
        let device = SoftwareDevice::new();
        device.fail_next_submissions(1);
        let list = CommandList::new("doomed").close();

        assert!(device.execute(&list).is_err());
        assert!(device.execute(&list).is_ok());
        assert_eq!(device.submissions(), 1);
    }

    #[test]
    fn test_shared_committed_resource_reopens() {
        let device = SoftwareDevice::new();
        let desc = ResourceDesc::buffer(256, ResourceFlags::NONE);
        let original = device
            .create_committed_resource(&desc, HeapKind::GpuLocal, true, ResourceState::COMMON)
            .unwrap();
        let handle = device.create_shared_handle(Shareable::Resource(original)).unwrap();
        let reopened = device.open_shared_resource(handle).unwrap();

        assert_ne!(original, reopened);
        device.release_resource(original).unwrap();
        device.close_shared_handle(handle).unwrap();
        // The reopened resource keeps the memory alive
        assert_eq!(device.bytes_in_use(), 64 * 1024);
        device.release_resource(reopened).unwrap();
        assert_eq!(device.bytes_in_use(), 0);
    }

    #[test]
    fn test_shared_upload_rejected() {
        let device = SoftwareDevice::new();
        let err = device
            .create_committed_resource(
                &ResourceDesc::buffer(16, ResourceFlags::NONE),
                HeapKind::Upload,
                true,
                ResourceState::GENERIC_READ,
            )
            .unwrap_err();
        assert!(matches!(err, GpuCheckError::InvalidConfiguration { .. }));
    }
}
