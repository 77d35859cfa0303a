//! Copying GPU surfaces into host snapshots
//!
//! The direct path copies one subresource into a committed readback buffer
//! and repacks its pitched rows. The heap serialization path additionally
//! routes a texture through aliased placements in one readback heap and
//! checks that the bytes survive the trip.

use crate::bitmap::Bitmap;
use gpucheck_core::{ErrorContext, GpuCheckError, LogCategory, Result};
use gpucheck_gpu::{
    align_up, submit_and_wait, AllocationInfo, CommandList, Footprint, GpuDevice, HeapKind,
    MemoryProvider, OwnedRegion, OwnedResource, RegionDesc, ResourceDesc, ResourceFlags,
    ResourceId, ResourceState, SurfaceIntrospection, TemporaryTransition,
    DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
};
use std::time::Duration;
use tracing::{debug, instrument};

const COMPONENT: &str = "capture";

/// What to capture and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub surface: ResourceId,
    /// State the surface is in now; it is restored after the copy
    pub state: ResourceState,
    pub subresource: u32,
    /// Overrides the engine default when set
    pub validate_heap_serialization: Option<bool>,
}

impl CaptureRequest {
    pub fn new(surface: ResourceId, state: ResourceState) -> Self {
        Self {
            surface,
            state,
            subresource: 0,
            validate_heap_serialization: None,
        }
    }

    pub fn subresource(mut self, subresource: u32) -> Self {
        self.subresource = subresource;
        self
    }

    pub fn validate_heap_serialization(mut self, enabled: bool) -> Self {
        self.validate_heap_serialization = Some(enabled);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    pub validate_heap_serialization: bool,
    pub timeout: Option<Duration>,
}

/// Where the subresource lands in the staging buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadbackPlan {
    footprint: Footprint,
    /// Row size rounded up to whole 32-bit pixels
    row_size: u64,
    /// Footprint size rounded up to the placement alignment
    staging_size: u64,
}

impl ReadbackPlan {
    fn new<D: GpuDevice + ?Sized>(device: &D, desc: &ResourceDesc, subresource: u32) -> Result<Self> {
        let footprint = device.copyable_footprint(desc, subresource, 0)?;
        let row_size = align_up(footprint.row_size_bytes, 4);
        if !desc.is_buffer() && row_size > footprint.row_pitch {
            return Err(GpuCheckError::capture_failure_with_context(
                "aligned row size exceeds the row pitch",
                ErrorContext::new("plan_readback", COMPONENT)
                    .with_metadata("row_size", row_size)
                    .with_metadata("row_pitch", footprint.row_pitch),
            ));
        }

        Ok(Self {
            footprint,
            row_size,
            staging_size: align_up(
                footprint.offset + footprint.total_bytes,
                DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
            ),
        })
    }

    /// Repack pitched rows from the mapped staging bytes
    fn repack(&self, mapped: &[u8]) -> Result<Bitmap> {
        let width = u32::try_from(self.row_size / 4)
            .map_err(|_| GpuCheckError::capture_failure("surface row too wide for a snapshot"))?;
        let height = self.footprint.num_rows;
        let row = self.row_size as usize;

        let mut packed = Vec::with_capacity(row * height as usize);
        for y in 0..u64::from(height) {
            let start = (self.footprint.offset + y * self.footprint.row_pitch) as usize;
            let bytes = mapped.get(start..start + row).ok_or_else(|| {
                GpuCheckError::capture_failure(format!(
                    "row {} at {} runs past the {} byte staging buffer",
                    y,
                    start,
                    mapped.len()
                ))
            })?;
            packed.extend_from_slice(bytes);
        }
        Bitmap::from_le_bytes(width, height, &packed)
    }
}

/// Heap shared by the staging buffer and the texture aliases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasLayout {
    pub heap_size: u64,
    pub heap_alignment: u64,
    /// Offset of the second texture alias and of the buffer alias over it
    pub second_offset: u64,
    /// Bytes the staging buffer at offset 0 spans
    pub staging_size: u64,
    pub texture_size: u64,
}

impl AliasLayout {
    /// Size a heap for two texture copies plus a row-major footprint of
    /// `row_major_size` bytes in front of the second copy.
    pub fn new(texture: AllocationInfo, row_major_size: u64) -> Self {
        let footprint = align_up(row_major_size, texture.alignment.max(1));
        let heap_size = (2 * texture.size).max(texture.size + footprint);
        Self {
            heap_size,
            heap_alignment: texture.alignment.max(DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT),
            second_offset: heap_size - texture.size,
            staging_size: heap_size - texture.size,
            texture_size: texture.size,
        }
    }
}

/// Capture one subresource of `request.surface` into a bitmap
#[instrument(skip(device), fields(surface = ?request.surface, subresource = request.subresource))]
pub fn capture_surface<D: GpuDevice + ?Sized>(
    device: &D,
    request: &CaptureRequest,
    options: &CaptureOptions,
) -> Result<Bitmap> {
    let desc = device.resource_desc(request.surface)?;
    let validate = request
        .validate_heap_serialization
        .unwrap_or(options.validate_heap_serialization);

    let direct = capture_direct(device, &desc, request, options.timeout)?;
    if !validate {
        return Ok(direct);
    }

    let caps = device.capabilities();
    if desc.is_buffer() || !caps.supports_heap_serialization() {
        gpucheck_core::gpucheck_debug!(
            LogCategory::Capture,
            "heap serialization validation skipped for {:?} (buffer: {}, heap tier {}, serialization tier {})",
            request.surface,
            desc.is_buffer(),
            caps.resource_heap_tier,
            caps.heap_serialization_tier
        );
        return Ok(direct);
    }

    let aliased = capture_through_aliases(device, &desc, request, options.timeout)?;
    if aliased != direct {
        let differing = aliased
            .pixels()
            .iter()
            .zip(direct.pixels())
            .filter(|(a, b)| a != b)
            .count();
        return Err(GpuCheckError::DriverAliasingFault {
            message: format!(
                "{} of {} pixels of {:?} changed when copied through aliased placements",
                differing,
                direct.pixels().len(),
                request.surface
            ),
        });
    }

    debug!("heap serialization round trip of {:?} matched", request.surface);
    Ok(direct)
}

fn capture_direct<D: GpuDevice + ?Sized>(
    device: &D,
    desc: &ResourceDesc,
    request: &CaptureRequest,
    timeout: Option<Duration>,
) -> Result<Bitmap> {
    let plan = ReadbackPlan::new(device, desc, request.subresource)?;
    let staging = OwnedResource::new(
        device,
        device.create_committed_resource(
            &ResourceDesc::buffer(plan.staging_size, ResourceFlags::NONE),
            HeapKind::Readback,
            false,
            ResourceState::COPY_DEST,
        )?,
    );

    let mut list = CommandList::new("capture");
    record_readback(
        &mut list,
        desc,
        request.surface,
        request.state,
        request.subresource,
        staging.id(),
        &plan,
    );
    submit(device, list, timeout)?;

    let mapped = device.read_mapped(staging.id(), 0..plan.staging_size)?;
    plan.repack(&mapped)
}

fn capture_through_aliases<D: GpuDevice + ?Sized>(
    device: &D,
    desc: &ResourceDesc,
    request: &CaptureRequest,
    timeout: Option<Duration>,
) -> Result<Bitmap> {
    let plan = ReadbackPlan::new(device, desc, request.subresource)?;
    let layout = AliasLayout::new(device.resource_allocation_info(desc)?, plan.staging_size);
    debug!(?layout, "validating heap serialization");

    let region = OwnedRegion::new(
        device,
        device.create_memory_region(&RegionDesc {
            size: layout.heap_size,
            kind: HeapKind::Readback,
            alignment: layout.heap_alignment,
            buffers_only: false,
            shared: false,
        })?,
    );
    let place = |offset: u64, desc: &ResourceDesc| {
        device
            .create_placed_resource(region.id(), offset, desc, ResourceState::COPY_DEST)
            .map(|id| OwnedResource::new(device, id))
    };

    let staging = place(0, &ResourceDesc::buffer(layout.staging_size, ResourceFlags::NONE))?;
    let first = place(0, desc)?;
    let second = place(layout.second_offset, desc)?;
    let second_as_buffer = place(
        layout.second_offset,
        &ResourceDesc::buffer(layout.texture_size, ResourceFlags::NONE),
    )?;

    let mut list = CommandList::new("capture through aliases");
    {
        let mut source = TemporaryTransition::new(
            &mut list,
            request.surface,
            request.state,
            ResourceState::COPY_SOURCE,
        );
        source.copy_resource(first.id(), request.surface);

        // The staging buffer inherits the first copy's bytes; the buffer
        // alias hands them to the second copy.
        let mut staged = TemporaryTransition::new(
            &mut source,
            staging.id(),
            ResourceState::COPY_DEST,
            ResourceState::COPY_SOURCE,
        );
        staged.copy_buffer_region(second_as_buffer.id(), 0, staging.id(), 0, layout.texture_size);
    }
    record_readback(
        &mut list,
        desc,
        second.id(),
        ResourceState::COPY_DEST,
        request.subresource,
        staging.id(),
        &plan,
    );
    submit(device, list, timeout)?;

    let mapped = device.read_mapped(staging.id(), 0..plan.staging_size)?;
    plan.repack(&mapped)
}

fn record_readback(
    list: &mut CommandList,
    desc: &ResourceDesc,
    surface: ResourceId,
    state: ResourceState,
    subresource: u32,
    staging: ResourceId,
    plan: &ReadbackPlan,
) {
    let mut scoped = TemporaryTransition::for_subresource(
        list,
        surface,
        subresource,
        state,
        ResourceState::COPY_SOURCE,
    );
    if desc.is_buffer() {
        scoped.copy_buffer_region(staging, 0, surface, 0, desc.width);
    } else {
        scoped.copy_texture_to_buffer(staging, plan.footprint, surface, subresource);
    }
}

fn submit<D: GpuDevice + ?Sized>(device: &D, list: CommandList, timeout: Option<Duration>) -> Result<()> {
    let list = list.close();
    submit_and_wait(device, &list, timeout).map_err(|e| match e {
        GpuCheckError::Timeout { .. } => e,
        other => GpuCheckError::capture_failure_with_context(
            other.to_string(),
            ErrorContext::new("submit", COMPONENT)
                .with_metadata("list", list.label())
                .with_metadata("commands", list.len()),
        ),
    })
}
