//! Ordered snapshot set with a reference slot

use crate::bitmap::Bitmap;
use crate::bmp;
use crate::capture::{capture_surface, CaptureOptions, CaptureRequest};
use crate::compare::{
    find_differences, triptych, BmpFileReporter, ExactComparator, MismatchReporter,
    MismatchSummary, PixelComparator, Verification,
};
use gpucheck_core::{gpucheck_info, gpucheck_warn, CaptureConfig, GpuCheckError, LogCategory, Result};
use gpucheck_gpu::{timeout_from_millis, GpuDevice, ResourceId, ResourceState};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Captures GPU surfaces into numbered slots and compares them against a
/// reference slot.
///
/// Slot indices passed as `None` mean "the last slot".
#[derive(Debug)]
pub struct ImageManager {
    images: Vec<Bitmap>,
    reference_index: usize,
    config: CaptureConfig,
    comparator: Box<dyn PixelComparator>,
    reporter: Box<dyn MismatchReporter>,
}

impl Default for ImageManager {
    fn default() -> Self {
        Self::new(CaptureConfig::default())
    }
}

impl ImageManager {
    /// Exact comparison, triptych written to `config.failure_artifact_path`
    pub fn new(config: CaptureConfig) -> Self {
        let reporter = BmpFileReporter::new(config.failure_artifact_path.clone());
        Self {
            images: Vec::new(),
            reference_index: 0,
            config,
            comparator: Box::new(ExactComparator),
            reporter: Box::new(reporter),
        }
    }

    pub fn with_comparator(mut self, comparator: impl PixelComparator + 'static) -> Self {
        self.comparator = Box::new(comparator);
        self
    }

    pub fn with_reporter(mut self, reporter: impl MismatchReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn reference_index(&self) -> usize {
        self.reference_index
    }

    pub fn image(&self, index: usize) -> Option<&Bitmap> {
        self.images.get(index)
    }

    pub fn images(&self) -> &[Bitmap] {
        &self.images
    }

    /// Grow or shrink to `len` slots; new slots are empty
    pub fn resize(&mut self, len: usize) {
        self.images.resize_with(len, Bitmap::default);
        if self.reference_index >= len {
            self.reference_index = 0;
        }
    }

    /// Drop every snapshot and point the reference back at slot 0
    pub fn purge_all_images(&mut self) {
        self.images.clear();
        self.reference_index = 0;
    }

    pub fn set_bitmap(&mut self, index: usize, bitmap: Bitmap) -> Result<()> {
        let slot = self.slot(Some(index))?;
        self.images[slot] = bitmap;
        Ok(())
    }

    pub fn add_bitmap(&mut self, bitmap: Bitmap) -> usize {
        self.images.push(bitmap);
        self.images.len() - 1
    }

    /// Capture `subresource` of `surface` into slot `index`
    pub fn set_image<D: GpuDevice + ?Sized>(
        &mut self,
        index: usize,
        device: &D,
        surface: ResourceId,
        state: ResourceState,
        subresource: u32,
    ) -> Result<()> {
        self.set_image_with(
            index,
            device,
            &CaptureRequest::new(surface, state).subresource(subresource),
        )
    }

    #[instrument(skip(self, device), fields(slots = self.images.len()))]
    pub fn set_image_with<D: GpuDevice + ?Sized>(
        &mut self,
        index: usize,
        device: &D,
        request: &CaptureRequest,
    ) -> Result<()> {
        let slot = self.slot(Some(index))?;
        let options = CaptureOptions {
            validate_heap_serialization: self.config.validate_heap_serialization,
            timeout: timeout_from_millis(self.config.wait_timeout_ms),
        };

        let bitmap = capture_surface(device, request, &options)?;
        debug!(
            "captured {}x{} snapshot into slot {}",
            bitmap.width(),
            bitmap.height(),
            slot
        );
        self.images[slot] = bitmap;

        if self.config.write_images_on_add {
            let path = self.config.output_path.clone();
            self.export_image(&path, Some(slot))?;
        }
        Ok(())
    }

    /// Append a slot and capture into it
    pub fn add_image<D: GpuDevice + ?Sized>(
        &mut self,
        device: &D,
        surface: ResourceId,
        state: ResourceState,
        subresource: u32,
    ) -> Result<usize> {
        self.add_image_with(
            device,
            &CaptureRequest::new(surface, state).subresource(subresource),
        )
    }

    pub fn add_image_with<D: GpuDevice + ?Sized>(
        &mut self,
        device: &D,
        request: &CaptureRequest,
    ) -> Result<usize> {
        let index = self.add_bitmap(Bitmap::default());
        if let Err(e) = self.set_image_with(index, device, request) {
            self.images.pop();
            return Err(e);
        }
        Ok(index)
    }

    /// Load a snapshot from disk.
    ///
    /// 32-bit BMPs are read bit-exactly; anything else goes through the
    /// `image` crate and is converted from RGBA.
    pub fn add_image_from_file(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;

        let bitmap = match bmp::decode(&bytes) {
            Ok(bitmap) => bitmap,
            Err(e) => {
                if bmp::is_bmp(&bytes) {
                    debug!("{} is not a 32-bit BMP ({}), decoding generically", path.display(), e);
                }
                let image = image::load_from_memory(&bytes).map_err(|e| {
                    GpuCheckError::codec(format!("failed to decode {}: {}", path.display(), e))
                })?;
                Bitmap::from_rgba8(&image.to_rgba8())
            }
        };

        Ok(self.add_bitmap(bitmap))
    }

    pub fn set_reference_image(&mut self, index: Option<usize>) -> Result<()> {
        self.reference_index = self.slot(index)?;
        Ok(())
    }

    /// Compare slot `index` against the reference slot.
    ///
    /// With `log_on_mismatch`, a differing pair is logged and its triptych is
    /// handed to the mismatch reporter.
    pub fn verify_image(&self, index: Option<usize>, log_on_mismatch: bool) -> Result<Verification> {
        let candidate_index = self.slot(index)?;
        let reference_index = self.slot(Some(self.reference_index))?;
        let reference = &self.images[reference_index];
        let candidate = &self.images[candidate_index];

        let Some((differing_pixels, first_difference)) =
            find_differences(reference, candidate, self.comparator.as_ref())?
        else {
            return Ok(Verification::Match);
        };

        let mut summary = MismatchSummary {
            reference_index,
            candidate_index,
            width: reference.width(),
            height: reference.height(),
            differing_pixels,
            first_difference,
            artifact: None,
        };

        if log_on_mismatch {
            gpucheck_warn!(
                LogCategory::Compare,
                "Images mismatch: slot {} differs from reference slot {} in {} of {} pixels, first at {:?}",
                candidate_index,
                reference_index,
                differing_pixels,
                reference.pixels().len(),
                first_difference
            );

            let diff = triptych(reference, candidate, self.comparator.as_ref())?;
            match self.reporter.report(&summary, &diff) {
                Ok(artifact) => summary.artifact = artifact,
                Err(e) => {
                    gpucheck_warn!(
                        LogCategory::Export,
                        "failed to report mismatch: {}",
                        e.format_for_log()
                    );
                }
            }
        }

        Ok(Verification::Mismatch(summary))
    }

    pub fn export_image(&self, path: impl AsRef<Path>, index: Option<usize>) -> Result<()> {
        let slot = self.slot(index)?;
        bmp::write_bmp(path.as_ref(), &self.images[slot])?;
        gpucheck_info!(
            LogCategory::Export,
            "exported slot {} to {}",
            slot,
            path.as_ref().display()
        );
        Ok(())
    }

    /// Write `<dir>/<prefix><index>.bmp` for every slot.
    ///
    /// `prefix` defaults to the configured export prefix.
    pub fn export_all_images(&self, dir: impl AsRef<Path>, prefix: Option<&str>) -> Result<Vec<PathBuf>> {
        let prefix = prefix.unwrap_or(&self.config.export_prefix);
        let mut written = Vec::with_capacity(self.images.len());
        for (index, image) in self.images.iter().enumerate() {
            let path = dir.as_ref().join(format!("{}{}.bmp", prefix, index));
            bmp::write_bmp(&path, image)?;
            written.push(path);
        }
        gpucheck_info!(
            LogCategory::Export,
            "exported {} snapshots to {}",
            written.len(),
            dir.as_ref().display()
        );
        Ok(written)
    }

    /// Write slot `index` as an RGBA PNG
    pub fn export_png(&self, path: impl AsRef<Path>, index: Option<usize>) -> Result<()> {
        let slot = self.slot(index)?;
        self.images[slot]
            .to_rgba8()?
            .save_with_format(path.as_ref(), image::ImageFormat::Png)
            .map_err(|e| {
                GpuCheckError::codec(format!("failed to write {}: {}", path.as_ref().display(), e))
            })
    }

    /// Resolve an optional slot index, `None` meaning the last slot
    fn slot(&self, index: Option<usize>) -> Result<usize> {
        let len = self.images.len();
        let index = match index {
            Some(index) => index,
            None if len > 0 => len - 1,
            None => return Err(GpuCheckError::InvalidIndex { index: 0, len }),
        };
        if index >= len {
            return Err(GpuCheckError::InvalidIndex { index, len });
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager() -> ImageManager {
        ImageManager::default().with_reporter(NoReport)
    }

    #[derive(Debug)]
    struct NoReport;

    impl MismatchReporter for NoReport {
        fn report(&self, _: &MismatchSummary, _: &Bitmap) -> Result<Option<PathBuf>> {
            Ok(None)
        }
    }

    #[test]
    fn test_resize_resets_out_of_range_reference() {
        let mut images = manager();
        images.resize(4);
        images.set_reference_image(Some(3)).unwrap();

        images.resize(2);
        assert_eq!(images.len(), 2);
        assert_eq!(images.reference_index(), 0);
        assert!(images.image(1).unwrap().is_empty());
    }

    #[test]
    fn test_last_slot_resolution() {
        let mut images = manager();
        assert!(matches!(
            images.set_reference_image(None),
            Err(GpuCheckError::InvalidIndex { index: 0, len: 0 })
        ));

        images.add_bitmap(Bitmap::new(1, 1));
        images.add_bitmap(Bitmap::new(1, 1));
        images.set_reference_image(None).unwrap();
        assert_eq!(images.reference_index(), 1);

        assert!(matches!(
            images.set_bitmap(5, Bitmap::new(1, 1)),
            Err(GpuCheckError::InvalidIndex { index: 5, len: 2 })
        ));
    }

    #[test]
    fn test_verification_is_idempotent() {
        let mut images = manager();
        images.add_bitmap(Bitmap::filled(3, 3, 0x00AB_CDEF));
        images.add_bitmap(Bitmap::filled(3, 3, 0x00AB_CDEE));

        let first = images.verify_image(None, false).unwrap();
        let second = images.verify_image(None, false).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_match());
    }

    #[test]
    fn test_tolerance_comparator_accepts_small_drift() {
        let mut images = manager().with_comparator(crate::compare::ToleranceComparator::new(1));
        images.add_bitmap(Bitmap::filled(2, 2, 0x0010_1010));
        images.add_bitmap(Bitmap::filled(2, 2, 0x0011_0F10));

        assert_eq!(images.verify_image(Some(1), true).unwrap(), Verification::Match);
    }

    #[test]
    fn test_purge_resets_reference() {
        let mut images = manager();
        images.add_bitmap(Bitmap::new(1, 1));
        images.add_bitmap(Bitmap::new(1, 1));
        images.set_reference_image(Some(1)).unwrap();

        images.purge_all_images();
        assert!(images.is_empty());
        assert_eq!(images.reference_index(), 0);
    }
}
