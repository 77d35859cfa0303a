//! Device contracts over `wgpu`
//!
//! wgpu has no explicit heaps, so a memory region is one large buffer and
//! placed or reserved buffers are windows into it. Textures can only be
//! committed. State transitions are tracked by wgpu itself and are ignored
//! here. Fences complete through `Queue::on_submitted_work_done`.

use crate::command::{ClosedCommandList, Command};
use crate::device::{CommandQueue, MemoryProvider, SurfaceIntrospection};
use crate::layout;
use crate::sync::timeout_millis;
use crate::types::{
    align_up, AllocationInfo, DeviceCapabilities, FenceId, Footprint, HeapKind, PixelFormat,
    RegionDesc, RegionId, ResourceDesc, ResourceId, ResourceState, Shareable, SharedHandle,
    TILE_SIZE_IN_BYTES,
};
use gpucheck_core::{gpucheck_info, gpucheck_warn, ErrorContext, GpuCheckError, LogCategory, Result};
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::debug;
use wgpu::{
    BufferDescriptor, BufferUsages, CommandEncoderDescriptor, DeviceDescriptor, Extent3d,
    Features, ImageCopyBuffer, ImageCopyTexture, ImageDataLayout, Limits, Maintain, MapMode,
    Origin3d, PowerPreference, RequestAdapterOptions, TextureAspect, TextureDescriptor,
    TextureDimension, TextureFormat, TextureUsages,
};

const COMPONENT: &str = "wgpu-device";

struct Region {
    buffer: Arc<wgpu::Buffer>,
    desc: RegionDesc,
}

enum Storage {
    Buffer {
        buffer: Arc<wgpu::Buffer>,
        offset: u64,
        kind: HeapKind,
    },
    Texture(Arc<wgpu::Texture>),
    Unbound {
        tiles: u32,
    },
}

struct Resource {
    desc: ResourceDesc,
    storage: Storage,
}

#[derive(Default)]
struct Tables {
    regions: SlotMap<RegionId, Region>,
    resources: SlotMap<ResourceId, Resource>,
    fences: SlotMap<FenceId, Arc<AtomicU64>>,
}

/// [`GpuDevice`](crate::GpuDevice) backed by a `wgpu` device and queue
pub struct WgpuDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    tables: Mutex<Tables>,
}

impl WgpuDevice {
    /// Wrap an existing device and queue
    pub fn from_parts(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Create a device on the default adapter without a surface
    pub fn headless() -> Result<Self> {
        pollster::block_on(Self::request())
    }

    async fn request() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| GpuCheckError::device_lost("no suitable GPU adapter"))?;

        let adapter_info = adapter.get_info();
        gpucheck_info!(
            LogCategory::Device,
            "wgpu adapter: {} ({:?}, {:?})",
            adapter_info.name, adapter_info.device_type, adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &DeviceDescriptor {
                    label: Some("gpucheck device"),
                    required_features: Features::empty(),
                    required_limits: Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| GpuCheckError::device_lost(format!("failed to create device: {}", e)))?;

        Ok(Self::from_parts(Arc::new(device), Arc::new(queue)))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn buffer_usages(kind: HeapKind) -> BufferUsages {
        match kind {
            HeapKind::GpuLocal => {
                BufferUsages::COPY_SRC
                    | BufferUsages::COPY_DST
                    | BufferUsages::STORAGE
                    | BufferUsages::VERTEX
                    | BufferUsages::INDEX
                    | BufferUsages::UNIFORM
            }
            // MAP_WRITE cannot be combined with COPY_DST, so uploads go through `write_buffer`
            HeapKind::Upload => BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            HeapKind::Readback => BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        }
    }

    fn texture_format(format: PixelFormat) -> Result<TextureFormat> {
        match format {
            PixelFormat::Bgra8Unorm => Ok(TextureFormat::Bgra8Unorm),
            PixelFormat::Rgba8Unorm => Ok(TextureFormat::Rgba8Unorm),
            PixelFormat::R32Uint => Ok(TextureFormat::R32Uint),
            PixelFormat::R16Float => Ok(TextureFormat::R16Float),
            PixelFormat::R8Unorm => Ok(TextureFormat::R8Unorm),
            PixelFormat::Unknown => Err(GpuCheckError::invalid_configuration(
                "textures need a pixel format",
            )),
        }
    }

    fn create_buffer(&self, size: u64, kind: HeapKind, label: &str) -> Arc<wgpu::Buffer> {
        Arc::new(self.device.create_buffer(&BufferDescriptor {
            label: Some(label),
            size: align_up(size, wgpu::COPY_BUFFER_ALIGNMENT),
            usage: Self::buffer_usages(kind),
            mapped_at_creation: false,
        }))
    }

    /// Drive callbacks; true once no submission is left in flight
    fn drive(&self, maintain: Maintain) -> bool {
        self.device.poll(maintain).is_queue_empty()
    }

    /// Map a readback buffer and copy `range` out of it
    fn map_read(&self, buffer: &wgpu::Buffer, range: Range<u64>) -> Result<Vec<u8>> {
        let slice = buffer.slice(range.clone());
        let (sender, receiver) = mpsc::channel();
        slice.map_async(MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        if !self.drive(Maintain::Wait) {
            gpucheck_warn!(
                LogCategory::Device,
                "queue still busy after a blocking poll for a {} byte map",
                range.end - range.start
            );
        }

        receiver
            .recv()
            .map_err(|e| GpuCheckError::device_lost(format!("map callback dropped: {}", e)))?
            .map_err(|e| GpuCheckError::device_lost(format!("buffer map failed: {}", e)))?;

        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(bytes)
    }

    fn texture_copy(texture: &wgpu::Texture, desc: &ResourceDesc, subresource: u32) -> ImageCopyTexture<'_> {
        let mip_levels = u32::from(desc.mip_levels);
        ImageCopyTexture {
            texture,
            mip_level: subresource % mip_levels,
            origin: Origin3d {
                x: 0,
                y: 0,
                z: subresource / mip_levels,
            },
            aspect: TextureAspect::All,
        }
    }

    fn buffer_layout(footprint: &Footprint, base: u64) -> Result<ImageDataLayout> {
        let bytes_per_row = u32::try_from(footprint.row_pitch).map_err(|_| {
            GpuCheckError::invalid_configuration("row pitch does not fit in 32 bits")
        })?;
        Ok(ImageDataLayout {
            offset: base + footprint.offset,
            bytes_per_row: Some(bytes_per_row),
            rows_per_image: Some(footprint.num_rows),
        })
    }

    fn extent(footprint: &Footprint) -> Extent3d {
        Extent3d {
            width: footprint.width,
            height: footprint.height,
            depth_or_array_layers: 1,
        }
    }
}

fn buffer_view(resource: &Resource) -> Result<(Arc<wgpu::Buffer>, u64, HeapKind)> {
    match &resource.storage {
        Storage::Buffer {
            buffer,
            offset,
            kind,
        } => Ok((buffer.clone(), *offset, *kind)),
        Storage::Texture(_) => Err(GpuCheckError::invalid_configuration(
            "expected a buffer, found a texture",
        )),
        Storage::Unbound { .. } => Err(GpuCheckError::device_lost(
            "access to a reserved resource with no tiles mapped",
        )),
    }
}

fn texture_of(resource: &Resource) -> Result<Arc<wgpu::Texture>> {
    match &resource.storage {
        Storage::Texture(texture) => Ok(texture.clone()),
        _ => Err(GpuCheckError::invalid_configuration(
            "expected a texture, found a buffer",
        )),
    }
}

fn unsupported(what: &str) -> GpuCheckError {
    GpuCheckError::invalid_configuration_with_context(
        format!("{} is not supported by the wgpu backend", what),
        ErrorContext::new(what, COMPONENT),
    )
}

impl MemoryProvider for WgpuDevice {
    fn create_memory_region(&self, desc: &RegionDesc) -> Result<RegionId> {
        if desc.shared {
            return Err(unsupported("shared memory"));
        }
        let buffer = self.create_buffer(desc.size, desc.kind, "gpucheck region");
        Ok(self.tables.lock().regions.insert(Region { buffer, desc: *desc }))
    }

    fn create_placed_resource(
        &self,
        region: RegionId,
        offset: u64,
        desc: &ResourceDesc,
        _initial_state: ResourceState,
    ) -> Result<ResourceId> {
        if !desc.is_buffer() {
            return Err(unsupported("placed textures"));
        }

        let mut tables = self.tables.lock();
        let region = tables
            .regions
            .get(region)
            .ok_or_else(|| GpuCheckError::unknown_resource(region))?;
        if offset + desc.width > region.desc.size {
            return Err(GpuCheckError::invalid_configuration(format!(
                "placed buffer {}..{} exceeds region of {} bytes",
                offset,
                offset + desc.width,
                region.desc.size
            )));
        }

        let storage = Storage::Buffer {
            buffer: region.buffer.clone(),
            offset,
            kind: region.desc.kind,
        };
        Ok(tables.resources.insert(Resource {
            desc: *desc,
            storage,
        }))
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        heap_kind: HeapKind,
        shared: bool,
        _initial_state: ResourceState,
    ) -> Result<ResourceId> {
        if shared {
            return Err(unsupported("shared resources"));
        }

        let storage = if desc.is_buffer() {
            Storage::Buffer {
                buffer: self.create_buffer(desc.width, heap_kind, "gpucheck buffer"),
                offset: 0,
                kind: heap_kind,
            }
        } else {
            if heap_kind != HeapKind::GpuLocal {
                return Err(unsupported("host-visible textures"));
            }
            let texture = self.device.create_texture(&TextureDescriptor {
                label: Some("gpucheck texture"),
                size: Extent3d {
                    width: u32::try_from(desc.width).map_err(|_| {
                        GpuCheckError::invalid_configuration("texture width does not fit in 32 bits")
                    })?,
                    height: desc.height,
                    depth_or_array_layers: u32::from(desc.array_size),
                },
                mip_level_count: u32::from(desc.mip_levels),
                sample_count: 1,
                dimension: TextureDimension::D2,
                format: Self::texture_format(desc.format)?,
                usage: TextureUsages::COPY_SRC
                    | TextureUsages::COPY_DST
                    | TextureUsages::TEXTURE_BINDING
                    | TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            });
            Storage::Texture(Arc::new(texture))
        };

        Ok(self.tables.lock().resources.insert(Resource {
            desc: *desc,
            storage,
        }))
    }

    fn create_reserved_resource(
        &self,
        desc: &ResourceDesc,
        _initial_state: ResourceState,
    ) -> Result<ResourceId> {
        if !desc.is_buffer() {
            return Err(unsupported("reserved textures"));
        }
        let tiles = (align_up(desc.width, TILE_SIZE_IN_BYTES) / TILE_SIZE_IN_BYTES) as u32;
        Ok(self.tables.lock().resources.insert(Resource {
            desc: *desc,
            storage: Storage::Unbound { tiles },
        }))
    }

    fn resource_tiling(&self, resource: ResourceId) -> Result<u32> {
        let tables = self.tables.lock();
        let entry = tables
            .resources
            .get(resource)
            .ok_or_else(|| GpuCheckError::unknown_resource(resource))?;
        match entry.storage {
            Storage::Unbound { tiles } => Ok(tiles),
            _ => Ok((align_up(entry.desc.width, TILE_SIZE_IN_BYTES) / TILE_SIZE_IN_BYTES) as u32),
        }
    }

    fn update_tile_mappings(
        &self,
        resource: ResourceId,
        region: RegionId,
        first_tile: u32,
        tile_count: u32,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let (buffer, kind, size) = {
            let region = tables
                .regions
                .get(region)
                .ok_or_else(|| GpuCheckError::unknown_resource(region))?;
            (region.buffer.clone(), region.desc.kind, region.desc.size)
        };
        let offset = u64::from(first_tile) * TILE_SIZE_IN_BYTES;
        if offset + u64::from(tile_count) * TILE_SIZE_IN_BYTES > size {
            return Err(GpuCheckError::invalid_configuration(format!(
                "tiles {}..{} exceed region of {} bytes",
                first_tile,
                first_tile + tile_count,
                size
            )));
        }

        let entry = tables
            .resources
            .get_mut(resource)
            .ok_or_else(|| GpuCheckError::unknown_resource(resource))?;
        entry.storage = Storage::Buffer {
            buffer,
            offset,
            kind,
        };
        Ok(())
    }

    fn create_shared_handle(&self, _object: Shareable) -> Result<SharedHandle> {
        Err(unsupported("shared handles"))
    }

    fn open_shared_resource(&self, _handle: SharedHandle) -> Result<ResourceId> {
        Err(unsupported("shared handles"))
    }

    fn open_shared_region(&self, _handle: SharedHandle) -> Result<RegionId> {
        Err(unsupported("shared handles"))
    }

    fn close_shared_handle(&self, _handle: SharedHandle) -> Result<()> {
        Err(unsupported("shared handles"))
    }

    fn write_mapped(&self, resource: ResourceId, offset: u64, data: &[u8]) -> Result<()> {
        let (buffer, base, kind) = {
            let tables = self.tables.lock();
            let entry = tables
                .resources
                .get(resource)
                .ok_or_else(|| GpuCheckError::unknown_resource(resource))?;
            buffer_view(entry)?
        };
        if !kind.is_host_visible() {
            return Err(GpuCheckError::invalid_configuration(format!(
                "{:?} is not host visible",
                resource
            )));
        }
        self.queue.write_buffer(&buffer, base + offset, data);
        self.queue.submit(None);
        Ok(())
    }

    fn read_mapped(&self, resource: ResourceId, range: Range<u64>) -> Result<Vec<u8>> {
        let (buffer, base, kind) = {
            let tables = self.tables.lock();
            let entry = tables
                .resources
                .get(resource)
                .ok_or_else(|| GpuCheckError::unknown_resource(resource))?;
            buffer_view(entry)?
        };

        match kind {
            HeapKind::Readback => self.map_read(&buffer, base + range.start..base + range.end),
            HeapKind::Upload => {
                // Upload memory is write-only in wgpu; bounce through a readback buffer
                let len = range.end - range.start;
                let bounce = self.create_buffer(len, HeapKind::Readback, "gpucheck bounce");
                let mut encoder = self
                    .device
                    .create_command_encoder(&CommandEncoderDescriptor { label: Some("bounce") });
                encoder.copy_buffer_to_buffer(&buffer, base + range.start, &bounce, 0, len);
                self.queue.submit(Some(encoder.finish()));
                self.map_read(&bounce, 0..len)
            }
            HeapKind::GpuLocal => Err(GpuCheckError::invalid_configuration(format!(
                "{:?} is not host visible",
                resource
            ))),
        }
    }

    fn release_resource(&self, resource: ResourceId) -> Result<()> {
        let entry = self
            .tables
            .lock()
            .resources
            .remove(resource)
            .ok_or_else(|| GpuCheckError::unknown_resource(resource))?;
        if let Storage::Texture(texture) = entry.storage {
            if let Ok(texture) = Arc::try_unwrap(texture) {
                texture.destroy();
            }
        }
        Ok(())
    }

    fn release_region(&self, region: RegionId) -> Result<()> {
        self.tables
            .lock()
            .regions
            .remove(region)
            .map(|_| ())
            .ok_or_else(|| GpuCheckError::unknown_resource(region))
    }
}

impl CommandQueue for WgpuDevice {
    fn execute(&self, list: &ClosedCommandList) -> Result<()> {
        let tables = self.tables.lock();
        let lookup = |id: ResourceId| {
            tables
                .resources
                .get(id)
                .ok_or_else(|| GpuCheckError::unknown_resource(id))
        };

        let mut encoder = self.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some(list.label()),
        });

        for command in list.commands() {
            match *command {
                Command::Transition { .. } => {}
                Command::CopyBufferRegion {
                    dst,
                    dst_offset,
                    src,
                    src_offset,
                    num_bytes,
                } => {
                    let (src_buffer, src_base, _) = buffer_view(lookup(src)?)?;
                    let (dst_buffer, dst_base, _) = buffer_view(lookup(dst)?)?;
                    encoder.copy_buffer_to_buffer(
                        &src_buffer,
                        src_base + src_offset,
                        &dst_buffer,
                        dst_base + dst_offset,
                        num_bytes,
                    );
                }
                Command::CopyResource { dst, src } => {
                    let src_entry = lookup(src)?;
                    let dst_entry = lookup(dst)?;
                    if src_entry.desc.is_buffer() {
                        let (src_buffer, src_base, _) = buffer_view(src_entry)?;
                        let (dst_buffer, dst_base, _) = buffer_view(dst_entry)?;
                        encoder.copy_buffer_to_buffer(
                            &src_buffer,
                            src_base,
                            &dst_buffer,
                            dst_base,
                            src_entry.desc.width,
                        );
                    } else {
                        let src_texture = texture_of(src_entry)?;
                        let dst_texture = texture_of(dst_entry)?;
                        for subresource in 0..src_entry.desc.subresource_count() {
                            let fp = layout::footprint(&src_entry.desc, subresource, 0)?;
                            encoder.copy_texture_to_texture(
                                Self::texture_copy(&src_texture, &src_entry.desc, subresource),
                                Self::texture_copy(&dst_texture, &dst_entry.desc, subresource),
                                Self::extent(&fp),
                            );
                        }
                    }
                }
                Command::CopyTextureToBuffer {
                    dst,
                    footprint,
                    src,
                    subresource,
                } => {
                    let src_entry = lookup(src)?;
                    let texture = texture_of(src_entry)?;
                    let (buffer, base, _) = buffer_view(lookup(dst)?)?;
                    encoder.copy_texture_to_buffer(
                        Self::texture_copy(&texture, &src_entry.desc, subresource),
                        ImageCopyBuffer {
                            buffer: &buffer,
                            layout: Self::buffer_layout(&footprint, base)?,
                        },
                        Self::extent(&footprint),
                    );
                }
                Command::CopyBufferToTexture {
                    dst,
                    subresource,
                    src,
                    footprint,
                } => {
                    let dst_entry = lookup(dst)?;
                    let texture = texture_of(dst_entry)?;
                    let (buffer, base, _) = buffer_view(lookup(src)?)?;
                    encoder.copy_buffer_to_texture(
                        ImageCopyBuffer {
                            buffer: &buffer,
                            layout: Self::buffer_layout(&footprint, base)?,
                        },
                        Self::texture_copy(&texture, &dst_entry.desc, subresource),
                        Self::extent(&footprint),
                    );
                }
            }
        }

        let index = self.queue.submit(Some(encoder.finish()));
        debug!("submitted '{}' as {:?}", list.label(), index);
        Ok(())
    }

    fn create_fence(&self, initial_value: u64) -> Result<FenceId> {
        Ok(self
            .tables
            .lock()
            .fences
            .insert(Arc::new(AtomicU64::new(initial_value))))
    }

    fn signal(&self, fence: FenceId, value: u64) -> Result<()> {
        let completed = self
            .tables
            .lock()
            .fences
            .get(fence)
            .cloned()
            .ok_or_else(|| GpuCheckError::unknown_resource(fence))?;
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(value, Ordering::AcqRel);
        });
        Ok(())
    }

    fn completed_value(&self, fence: FenceId) -> Result<u64> {
        self.tables
            .lock()
            .fences
            .get(fence)
            .map(|value| value.load(Ordering::Acquire))
            .ok_or_else(|| GpuCheckError::unknown_resource(fence))
    }

    fn wait(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> Result<()> {
        let Some(timeout) = timeout else {
            let drained = self.drive(Maintain::Wait);
            if self.completed_value(fence)? >= value {
                return Ok(());
            }
            return Err(GpuCheckError::device_lost(format!(
                "fence {:?} did not reach {} after a blocking poll (queue {})",
                fence,
                value,
                if drained { "drained" } else { "still busy" }
            )));
        };

        let deadline = Instant::now() + timeout;
        loop {
            let drained = self.drive(Maintain::Poll);
            if self.completed_value(fence)? >= value {
                return Ok(());
            }
            // Work-done callbacks have all run once the queue is empty
            if drained && self.completed_value(fence)? < value {
                return Err(GpuCheckError::device_lost(format!(
                    "queue drained but fence {:?} never reached {}",
                    fence, value
                )));
            }
            if Instant::now() >= deadline {
                return Err(GpuCheckError::Timeout {
                    waited_ms: timeout_millis(timeout),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn release_fence(&self, fence: FenceId) -> Result<()> {
        self.tables
            .lock()
            .fences
            .remove(fence)
            .map(|_| ())
            .ok_or_else(|| GpuCheckError::unknown_resource(fence))
    }
}

impl SurfaceIntrospection for WgpuDevice {
    fn resource_desc(&self, resource: ResourceId) -> Result<ResourceDesc> {
        self.tables
            .lock()
            .resources
            .get(resource)
            .map(|entry| entry.desc)
            .ok_or_else(|| GpuCheckError::unknown_resource(resource))
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
        DeviceCapabilities {
            resource_heap_tier: 1,
            heap_serialization_tier: 0,
            shared_handles: false,
            reserved_resources: true,
        }
    }
}
