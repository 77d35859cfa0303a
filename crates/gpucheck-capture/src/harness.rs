//! Render-twice-and-compare test harness
//!
//! A [`RenderTargetScenario`] renders the same content into two freshly
//! cleared render targets; [`RenderTargetComparison`] captures both and
//! verifies the second against the first.

use crate::compare::Verification;
use crate::manager::ImageManager;
use anyhow::Context;
use gpucheck_core::CaptureConfig;
use gpucheck_gpu::upload::{pitch_rows, record_staged_copy};
use gpucheck_gpu::{
    submit_and_wait, timeout_from_millis, CommandList, GpuDevice, HeapKind, MemoryProvider,
    OwnedResource, PixelFormat, ResourceDesc, ResourceFlags, ResourceId, ResourceState,
    SurfaceIntrospection, TemporaryTransition,
};
use tracing::info;

/// A cleared render target handed to a scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub resource: ResourceId,
    pub desc: ResourceDesc,
    /// State the target is in, and must be left in
    pub state: ResourceState,
}

impl RenderTarget {
    /// Full-surface viewport as `(width, height)`
    pub fn viewport(&self) -> (u32, u32) {
        (self.desc.width as u32, self.desc.height)
    }
}

/// Content rendered identically into every target
pub trait RenderTargetScenario<D: GpuDevice + ?Sized> {
    /// Shared setup, run once before any target is rendered
    fn initialize(&mut self, _device: &D) -> anyhow::Result<()> {
        Ok(())
    }

    fn render(&mut self, device: &D, index: usize, target: &RenderTarget) -> anyhow::Result<()>;
}

pub struct RenderTargetComparison<'d, D: GpuDevice + ?Sized> {
    device: &'d D,
    width: u32,
    height: u32,
    format: PixelFormat,
    state: ResourceState,
    config: CaptureConfig,
}

impl<'d, D: GpuDevice + ?Sized> RenderTargetComparison<'d, D> {
    pub const TARGET_COUNT: usize = 2;

    /// Two 512×512 BGRA8 targets kept in `RENDER_TARGET`
    pub fn new(device: &'d D) -> Self {
        Self {
            device,
            width: 512,
            height: 512,
            format: PixelFormat::Bgra8Unorm,
            state: ResourceState::RENDER_TARGET,
            config: CaptureConfig::default(),
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_config(mut self, config: CaptureConfig) -> Self {
        self.config = config;
        self
    }

    /// Render the scenario into each target, capture both and compare
    pub fn run<S>(&self, scenario: &mut S) -> anyhow::Result<Verification>
    where
        S: RenderTargetScenario<D>,
    {
        scenario
            .initialize(self.device)
            .context("scenario initialization failed")?;

        let desc = ResourceDesc::texture_2d(
            self.format,
            u64::from(self.width),
            self.height,
            1,
            1,
            ResourceFlags::ALLOW_RENDER_TARGET,
        );
        let mut targets = Vec::with_capacity(Self::TARGET_COUNT);
        for index in 0..Self::TARGET_COUNT {
            let resource = self
                .device
                .create_committed_resource(&desc, HeapKind::GpuLocal, false, self.state)
                .with_context(|| format!("failed to create render target {}", index))?;
            let target = OwnedResource::new(self.device, resource);
            self.clear(resource, &desc)
                .with_context(|| format!("failed to clear render target {}", index))?;
            targets.push(target);
        }

        let mut images = ImageManager::new(self.config.clone());
        for (index, target) in targets.iter().enumerate() {
            let target = RenderTarget {
                resource: target.id(),
                desc,
                state: self.state,
            };
            scenario
                .render(self.device, index, &target)
                .with_context(|| format!("scenario failed on render target {}", index))?;
            images
                .add_image(self.device, target.resource, self.state, 0)
                .with_context(|| format!("failed to capture render target {}", index))?;
        }

        let verification = images.verify_image(None, true)?;
        info!(
            "render target comparison {}x{}: {}",
            self.width,
            self.height,
            if verification.is_match() { "match" } else { "mismatch" }
        );
        Ok(verification)
    }

    /// Fill every texel with zero through a staged upload
    fn clear(&self, resource: ResourceId, desc: &ResourceDesc) -> gpucheck_core::Result<()> {
        let device = self.device;
        let footprint = device.copyable_footprint(desc, 0, 0)?;
        let size = device.required_intermediate_size(resource, 0, 1)?;
        let staging = OwnedResource::new(
            device,
            device.create_committed_resource(
                &ResourceDesc::buffer(size, ResourceFlags::NONE),
                HeapKind::Upload,
                false,
                ResourceState::GENERIC_READ,
            )?,
        );

        let zeros = vec![0u8; (footprint.row_size_bytes * u64::from(footprint.num_rows)) as usize];
        device.write_mapped(staging.id(), 0, &pitch_rows(&footprint, &zeros)?)?;

        let mut list = CommandList::new("clear render target");
        {
            let mut scoped =
                TemporaryTransition::new(&mut list, resource, self.state, ResourceState::COPY_DEST);
            record_staged_copy(&mut scoped, resource, desc, staging.id(), 0, &[footprint]);
        }
        submit_and_wait(device, &list.close(), timeout_from_millis(self.config.wait_timeout_ms))
    }
}
