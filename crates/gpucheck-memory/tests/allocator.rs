use gpucheck_core::{GpuCheckError, MemoryConfig};
use gpucheck_gpu::{
    CreationMethod, HeapKind, MemoryProvider, ResourceState, SoftwareDevice,
};
use gpucheck_memory::{BufferAllocator, BufferRequest};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const KIB64: u64 = 64 * 1024;

fn allocator() -> (Arc<SoftwareDevice>, BufferAllocator<SoftwareDevice>) {
    let device = Arc::new(SoftwareDevice::new());
    let allocator = BufferAllocator::with_defaults(device.clone()).unwrap();
    (device, allocator)
}

/// Read a GPU-local buffer back through a readback copy
fn read_back(device: &SoftwareDevice, resource: gpucheck_gpu::ResourceId, len: u64) -> Vec<u8> {
    use gpucheck_gpu::{submit_and_wait, CommandList, ResourceDesc, ResourceFlags};

    let readback = device
        .create_committed_resource(
            &ResourceDesc::buffer(len, ResourceFlags::NONE),
            HeapKind::Readback,
            false,
            ResourceState::COPY_DEST,
        )
        .unwrap();
    let mut list = CommandList::new("read back");
    list.copy_buffer_region(readback, 0, resource, 0, len);
    submit_and_wait(device, &list.close(), None).unwrap();
    let bytes = device.read_mapped(readback, 0..len).unwrap();
    device.release_resource(readback).unwrap();
    bytes
}

#[test]
fn placed_requests_share_an_arena_until_full() {
    let (_device, mut allocator) = allocator();
    let request = BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Placed, KIB64);

    let offsets: Vec<u64> = (0..5)
        .map(|_| {
            let id = allocator.create_buffer(&request).unwrap();
            allocator.record(id).unwrap().placement.unwrap().offset
        })
        .collect();

    // Default arena holds four 64 KiB placements
    assert_eq!(offsets, vec![0, KIB64, 2 * KIB64, 3 * KIB64, 0]);
    assert_eq!(allocator.arena_count(HeapKind::GpuLocal, false), 2);
    assert_eq!(allocator.arena_count(HeapKind::Upload, false), 0);
}

#[test]
fn small_placements_are_still_64k_aligned() {
    let (_device, mut allocator) = allocator();

    for size in [1u64, 100, 4096] {
        let id = allocator
            .create_buffer(&BufferRequest::new(HeapKind::Upload, CreationMethod::Placed, size))
            .unwrap();
        let placement = allocator.record(id).unwrap().placement.unwrap();
        assert_eq!(placement.offset % KIB64, 0);
    }
    assert_eq!(allocator.arena_count(HeapKind::Upload, false), 1);
}

#[test]
fn shared_and_unshared_pools_are_independent() {
    let (_device, mut allocator) = allocator();
    let plain = BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Placed, KIB64);

    allocator.create_buffer(&plain).unwrap();
    let shared = allocator.create_buffer(&plain.shared()).unwrap();

    assert_eq!(allocator.record(shared).unwrap().placement.unwrap().offset, 0);
    assert_eq!(allocator.arena_count(HeapKind::GpuLocal, false), 1);
    assert_eq!(allocator.arena_count(HeapKind::GpuLocal, true), 1);
}

#[test]
fn shared_host_visible_requests_are_rejected() {
    let (_device, mut allocator) = allocator();

    for kind in [HeapKind::Upload, HeapKind::Readback] {
        for method in [CreationMethod::Committed, CreationMethod::Placed, CreationMethod::Reserved] {
            let err = allocator
                .create_buffer(&BufferRequest::new(kind, method, 256).shared())
                .unwrap_err();
            assert!(
                matches!(err, GpuCheckError::InvalidConfiguration { .. }),
                "{:?}/{:?}: {}",
                kind,
                method,
                err
            );
        }
    }
    assert!(allocator.is_empty());
}

#[test]
fn zero_sized_request_is_rejected() {
    let (_device, mut allocator) = allocator();
    let err = allocator
        .create_buffer(&BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Committed, 0))
        .unwrap_err();
    assert!(matches!(err, GpuCheckError::InvalidConfiguration { .. }));
}

#[test]
fn shared_committed_buffer_is_the_reopened_handle() {
    let (device, mut allocator) = allocator();
    let id = allocator
        .create_buffer(&BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Committed, 512).shared())
        .unwrap();

    // The original resource was released; only the reopened one is live
    assert_eq!(device.live_resources(), 1);
    assert_eq!(device.live_shared_handles(), 1);
    assert!(allocator.record(id).unwrap().shared);

    drop(allocator);
    assert_eq!(device.live_resources(), 0);
    assert_eq!(device.live_shared_handles(), 0);
    assert_eq!(device.bytes_in_use(), 0);
}

#[test]
fn gpu_local_upload_is_staged_and_restores_state() {
    let (device, mut allocator) = allocator();
    let id = allocator
        .create_buffer(
            &BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Placed, 64)
                .initial_state(ResourceState::VERTEX_AND_CONSTANT_BUFFER),
        )
        .unwrap();
    let data: Vec<u8> = (0..64).collect();

    allocator
        .copy_to_resource(id, &data, ResourceState::VERTEX_AND_CONSTANT_BUFFER)
        .unwrap();

    assert_eq!(device.submissions(), 1);
    assert_eq!(
        device.resource_state(id).unwrap(),
        ResourceState::VERTEX_AND_CONSTANT_BUFFER
    );
    assert_eq!(read_back(&device, id, 64), data);
    assert_eq!(allocator.stats().staged_uploads, 1);
}

#[test]
fn reserved_upload_buffer_is_staged() {
    let (device, mut allocator) = allocator();
    let id = allocator
        .create_buffer(&BufferRequest::new(HeapKind::Upload, CreationMethod::Reserved, 128))
        .unwrap();
    let data = vec![0xAB; 128];

    allocator
        .copy_to_resource(id, &data, ResourceState::GENERIC_READ)
        .unwrap();

    assert_eq!(device.submissions(), 1);
    assert_eq!(read_back(&device, id, 128), data);
}

#[test]
fn upload_heap_copy_is_host_mapped() {
    let (device, mut allocator) = allocator();
    let id = allocator
        .create_buffer(&BufferRequest::new(HeapKind::Upload, CreationMethod::Committed, 16))
        .unwrap();

    allocator
        .copy_to_resource(id, &[9; 16], ResourceState::GENERIC_READ)
        .unwrap();

    assert_eq!(device.submissions(), 0);
    assert_eq!(device.read_mapped(id, 0..16).unwrap(), vec![9; 16]);
    assert_eq!(allocator.stats().mapped_uploads, 1);
}

#[test]
fn copy_size_must_match_intermediate_size() {
    let (_device, mut allocator) = allocator();
    let id = allocator
        .create_buffer(&BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Committed, 32))
        .unwrap();

    let err = allocator
        .copy_to_resource(id, &[0; 16], ResourceState::COMMON)
        .unwrap_err();
    assert!(matches!(
        err,
        GpuCheckError::SizeMismatch {
            expected: 32,
            actual: 16
        }
    ));
}

#[test]
fn copy_to_unrecorded_resource_fails() {
    let (device, mut allocator) = allocator();
    let foreign = device
        .create_committed_resource(
            &gpucheck_gpu::ResourceDesc::buffer(16, gpucheck_gpu::ResourceFlags::NONE),
            HeapKind::Upload,
            false,
            ResourceState::GENERIC_READ,
        )
        .unwrap();

    let err = allocator
        .copy_to_resource(foreign, &[0; 16], ResourceState::GENERIC_READ)
        .unwrap_err();
    assert!(matches!(err, GpuCheckError::UnknownResource { .. }));
}

#[test]
fn device_refusal_is_an_allocation_failure() {
    let device = Arc::new(SoftwareDevice::new().with_memory_budget(KIB64));
    let mut allocator = BufferAllocator::new(
        device.clone(),
        &MemoryConfig {
            default_arena_size: 2 * KIB64,
            ..Default::default()
        },
    )
    .unwrap();

    let err = allocator
        .create_buffer(&BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Placed, 16))
        .unwrap_err();
    assert!(matches!(err, GpuCheckError::AllocationFailure { .. }));
    assert_eq!(allocator.stats().failed_allocations, 1);
    assert_eq!(allocator.arena_count(HeapKind::GpuLocal, false), 0);
}

#[test]
fn release_and_teardown_free_everything() {
    let (device, mut allocator) = allocator();
    let a = allocator
        .create_buffer(&BufferRequest::new(HeapKind::Readback, CreationMethod::Placed, 16))
        .unwrap();
    allocator
        .create_buffer(&BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Reserved, 16))
        .unwrap();
    allocator
        .create_buffer(&BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Committed, 16))
        .unwrap();

    allocator.release(a).unwrap();
    assert!(allocator.record(a).is_none());
    assert!(matches!(
        allocator.release(a),
        Err(GpuCheckError::UnknownResource { .. })
    ));
    assert_eq!(allocator.len(), 2);

    let stats = allocator.stats();
    assert_eq!(stats.arenas_created, 2);
    assert_eq!(stats.released_buffers, 1);

    drop(allocator);
    assert_eq!(device.live_resources(), 0);
    assert_eq!(device.live_regions(), 0);
    assert_eq!(device.bytes_in_use(), 0);
}

#[test]
fn wait_timeout_surfaces_as_timeout() {
    let device = Arc::new(SoftwareDevice::new());
    let mut allocator = BufferAllocator::new(
        device.clone(),
        &MemoryConfig {
            wait_timeout_ms: Some(5),
            ..Default::default()
        },
    )
    .unwrap();
    let id = allocator
        .create_buffer(&BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Committed, 16))
        .unwrap();

    device.set_fences_stalled(true);
    let err = allocator
        .copy_to_resource(id, &[1; 16], ResourceState::COMMON)
        .unwrap_err();
    assert!(matches!(err, GpuCheckError::Timeout { waited_ms: 5 }));
}
