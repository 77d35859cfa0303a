use gpucheck_core::GpuCheckError;
use gpucheck_gpu::upload::{pitch_rows, record_staged_copy};
use gpucheck_gpu::{
    submit_and_wait, CommandList, CommandQueue, HeapKind, MemoryProvider, PixelFormat, RegionDesc,
    ResourceDesc, ResourceFlags, ResourceState, SoftwareDevice, SurfaceIntrospection,
    TemporaryTransition, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
};
use pretty_assertions::assert_eq;

#[test]
fn reserved_buffer_sees_bytes_of_mapped_tiles() {
    let device = SoftwareDevice::new();
    let region = device
        .create_memory_region(&RegionDesc {
            size: 4 * 64 * 1024,
            kind: HeapKind::Upload,
            alignment: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
            buffers_only: true,
            shared: false,
        })
        .unwrap();
    let desc = ResourceDesc::buffer(1000, ResourceFlags::NONE);
    let reserved = device
        .create_reserved_resource(&desc, ResourceState::GENERIC_READ)
        .unwrap();
    let alias = device
        .create_placed_resource(region, 2 * 64 * 1024, &desc, ResourceState::GENERIC_READ)
        .unwrap();

    device.write_mapped(alias, 0, &[7; 4]).unwrap();
    // Unmapped tiles cannot be touched
    assert!(device.read_mapped(reserved, 0..4).is_err());

    assert_eq!(device.resource_tiling(reserved).unwrap(), 1);
    device.update_tile_mappings(reserved, region, 2, 1).unwrap();

    // Reserved resources are never host-mappable, even over upload memory
    let err = device.read_mapped(reserved, 0..4).unwrap_err();
    assert!(matches!(err, GpuCheckError::InvalidConfiguration { .. }));

    let readback = device
        .create_committed_resource(&desc, HeapKind::Readback, false, ResourceState::COPY_DEST)
        .unwrap();
    let mut list = CommandList::new("read reserved");
    list.copy_buffer_region(readback, 0, reserved, 0, 4);
    submit_and_wait(&device, &list.close(), None).unwrap();

    assert_eq!(device.read_mapped(readback, 0..4).unwrap(), vec![7; 4]);
}

#[test]
fn staged_texture_upload_preserves_pixels() {
    let device = SoftwareDevice::new();
    let desc = ResourceDesc::texture_2d(PixelFormat::Bgra8Unorm, 4, 3, 1, 1, ResourceFlags::ALLOW_RENDER_TARGET);
    let texture = device
        .create_committed_resource(&desc, HeapKind::GpuLocal, false, ResourceState::RENDER_TARGET)
        .unwrap();

    let size = device.required_intermediate_size(texture, 0, 1).unwrap();
    let footprint = device.copyable_footprint(&desc, 0, 0).unwrap();
    assert_eq!(size, footprint.total_bytes);

    let staging = device
        .create_committed_resource(
            &ResourceDesc::buffer(size, ResourceFlags::NONE),
            HeapKind::Upload,
            false,
            ResourceState::GENERIC_READ,
        )
        .unwrap();
    let packed: Vec<u8> = (0..48).collect();
    device
        .write_mapped(staging, 0, &pitch_rows(&footprint, &packed).unwrap())
        .unwrap();

    let mut list = CommandList::new("upload");
    {
        let mut scoped = TemporaryTransition::new(
            &mut list,
            texture,
            ResourceState::RENDER_TARGET,
            ResourceState::COPY_DEST,
        );
        record_staged_copy(&mut scoped, texture, &desc, staging, 0, &[footprint]);
    }
    submit_and_wait(&device, &list.close(), None).unwrap();

    assert_eq!(device.read_texture(texture, 0).unwrap(), packed);
    assert_eq!(device.resource_state(texture).unwrap(), ResourceState::RENDER_TARGET);
    assert_eq!(device.submissions(), 1);
}

#[test]
fn fences_are_monotonic() {
    let device = SoftwareDevice::new();
    let fence = device.create_fence(0).unwrap();
    device.signal(fence, 3).unwrap();
    device.signal(fence, 2).unwrap();

    assert_eq!(device.completed_value(fence).unwrap(), 3);
    assert!(device.wait(fence, 3, None).is_ok());
    device.release_fence(fence).unwrap();
    assert!(device.completed_value(fence).is_err());
}
