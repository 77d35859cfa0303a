use gpucheck::prelude::*;
use gpucheck::{init_from_file, ConfigManager};
use gpucheck_core::GpuCheckError;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn scratch_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("gpucheck-e2e-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn uploaded_buffer_reads_back_through_the_capture_engine() {
    let device = Arc::new(SoftwareDevice::new());
    let mut allocator = BufferAllocator::with_defaults(device.clone()).unwrap();
    let buffer = allocator
        .create_buffer(&BufferRequest::new(HeapKind::GpuLocal, CreationMethod::Placed, 64))
        .unwrap();

    let words: Vec<u32> = (0..16).map(|i| 0xC0DE_0000 | i).collect();
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    allocator
        .copy_to_resource(buffer, &bytes, ResourceState::COMMON)
        .unwrap();

    let mut images = ImageManager::default();
    let index = images
        .add_image(&*device, buffer, ResourceState::COMMON, 0)
        .unwrap();

    let snapshot = images.image(index).unwrap();
    assert_eq!(snapshot.dimensions(), (16, 1));
    assert_eq!(snapshot.pixels(), words.as_slice());

    drop(allocator);
    assert_eq!(device.live_resources(), 0);
    assert_eq!(device.live_regions(), 0);
}

#[test]
fn reserved_and_committed_buffers_compare_equal_after_identical_uploads() {
    let device = Arc::new(SoftwareDevice::new());
    let mut allocator = BufferAllocator::with_defaults(device.clone()).unwrap();
    let data = vec![0x5A; 256];

    let mut images = ImageManager::default();
    for method in [CreationMethod::Reserved, CreationMethod::Committed] {
        let buffer = allocator
            .create_buffer(&BufferRequest::new(HeapKind::GpuLocal, method, 256))
            .unwrap();
        allocator
            .copy_to_resource(buffer, &data, ResourceState::COMMON)
            .unwrap();
        images
            .add_image(&*device, buffer, ResourceState::COMMON, 0)
            .unwrap();
    }

    assert!(images.verify_image(None, false).unwrap().is_match());
}

#[test]
fn configuration_file_drives_initialization() {
    let dir = scratch_dir("config");
    let path = dir.join("gpucheck.json");
    let mut config = GpuCheckConfig::default();
    config.capture.failure_artifact_path = dir.join("Failed.bmp");
    config.memory.wait_timeout_ms = Some(1_000);
    std::fs::write(&path, config.to_json_string().unwrap()).unwrap();

    init_from_file(&path).unwrap();
    assert!(ConfigManager::instance().is_some());

    std::fs::write(dir.join("broken.json"), "{ \"memory\": { \"placement_alignment\": 3 } }").unwrap();
    assert!(matches!(
        init_from_file(dir.join("broken.json")),
        Err(GpuCheckError::Config { .. })
    ));
}
