//! Pixel comparison strategies and mismatch reporting

use crate::bitmap::Bitmap;
use crate::bmp;
use gpucheck_core::{GpuCheckError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;

/// Pixel written into a difference image where the inputs disagree
pub const DIFF_PIXEL: u32 = 0xFFFF_FFFF;

/// Decides whether two pixels count as equal
pub trait PixelComparator: Debug + Send + Sync {
    fn pixels_equal(&self, reference: u32, candidate: u32) -> bool;
}

/// Bitwise equality
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExactComparator;

impl PixelComparator for ExactComparator {
    fn pixels_equal(&self, reference: u32, candidate: u32) -> bool {
        reference == candidate
    }
}

/// Equal when every 8-bit channel differs by at most `tolerance`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToleranceComparator {
    pub tolerance: u8,
}

impl ToleranceComparator {
    pub fn new(tolerance: u8) -> Self {
        Self { tolerance }
    }
}

impl PixelComparator for ToleranceComparator {
    fn pixels_equal(&self, reference: u32, candidate: u32) -> bool {
        reference
            .to_le_bytes()
            .iter()
            .zip(candidate.to_le_bytes())
            .all(|(a, b)| a.abs_diff(b) <= self.tolerance)
    }
}

/// Outcome of comparing a candidate snapshot against the reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch(MismatchSummary),
}

impl Verification {
    pub fn is_match(&self) -> bool {
        matches!(self, Verification::Match)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchSummary {
    pub reference_index: usize,
    pub candidate_index: usize,
    pub width: u32,
    pub height: u32,
    pub differing_pixels: usize,
    /// Column and row of the first differing pixel in scan order
    pub first_difference: (u32, u32),
    /// Where the reporter stored the diff image, if anywhere
    pub artifact: Option<PathBuf>,
}

fn check_dimensions(reference: &Bitmap, candidate: &Bitmap) -> Result<()> {
    if reference.dimensions() != candidate.dimensions()
        || reference.pixels().len() != candidate.pixels().len()
    {
        return Err(GpuCheckError::DimensionMismatch {
            reference: reference.dimensions(),
            candidate: candidate.dimensions(),
        });
    }
    Ok(())
}

/// Count differing pixels and locate the first one.
///
/// Returns `None` when every pixel compares equal.
pub fn find_differences(
    reference: &Bitmap,
    candidate: &Bitmap,
    comparator: &dyn PixelComparator,
) -> Result<Option<(usize, (u32, u32))>> {
    check_dimensions(reference, candidate)?;

    let mut first = None;
    let mut count = 0;
    for (i, (a, b)) in reference.pixels().iter().zip(candidate.pixels()).enumerate() {
        if !comparator.pixels_equal(*a, *b) {
            count += 1;
            first.get_or_insert(i);
        }
    }

    let width = reference.width().max(1) as usize;
    Ok(first.map(|i| (count, ((i % width) as u32, (i / width) as u32))))
}

/// White where the inputs differ, black elsewhere
pub fn difference_bitmap(
    reference: &Bitmap,
    candidate: &Bitmap,
    comparator: &dyn PixelComparator,
) -> Result<Bitmap> {
    check_dimensions(reference, candidate)?;

    let pixels = reference
        .pixels()
        .iter()
        .zip(candidate.pixels())
        .map(|(a, b)| if comparator.pixels_equal(*a, *b) { 0 } else { DIFF_PIXEL })
        .collect();
    Bitmap::from_pixels(reference.width(), reference.height(), pixels)
}

/// Reference, candidate and difference side by side with one black column
/// between each, `3 * width + 2` wide.
pub fn triptych(
    reference: &Bitmap,
    candidate: &Bitmap,
    comparator: &dyn PixelComparator,
) -> Result<Bitmap> {
    let diff = difference_bitmap(reference, candidate, comparator)?;
    let width = reference.width();

    let mut out = Bitmap::new(width * 3 + 2, reference.height());
    out.blit(reference, 0)?;
    out.blit(candidate, width + 1)?;
    out.blit(&diff, width * 2 + 2)?;
    Ok(out)
}

/// Receives the triptych of a failed verification
pub trait MismatchReporter: Debug + Send + Sync {
    /// Store or forward the diff image; returns where it went, if anywhere
    fn report(&self, summary: &MismatchSummary, triptych: &Bitmap) -> Result<Option<PathBuf>>;
}

/// Writes the triptych as a BMP file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmpFileReporter {
    path: PathBuf,
}

impl BmpFileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl MismatchReporter for BmpFileReporter {
    fn report(&self, _summary: &MismatchSummary, triptych: &Bitmap) -> Result<Option<PathBuf>> {
        bmp::write_bmp(&self.path, triptych)?;
        Ok(Some(self.path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identical_bitmaps_have_no_differences() {
        let a = Bitmap::filled(4, 4, 0xFFFF_FFFF);
        assert_eq!(find_differences(&a, &a.clone(), &ExactComparator).unwrap(), None);
    }

    #[test]
    fn test_triptych_layout() {
        let reference = Bitmap::new(2, 2);
        let candidate = Bitmap::from_pixels(2, 2, vec![0, 0, 0, DIFF_PIXEL]).unwrap();

        let out = triptych(&reference, &candidate, &ExactComparator).unwrap();

        assert_eq!(out.dimensions(), (8, 2));
        // reference | gutter | candidate | gutter | diff
        assert_eq!(out.row(0).unwrap(), &[0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(out.row(1).unwrap(), &[0, 0, 0, 0, DIFF_PIXEL, 0, 0, DIFF_PIXEL]);
    }

    #[test]
    fn test_first_difference_is_in_scan_order() {
        let reference = Bitmap::new(3, 3);
        let mut candidate = reference.clone();
        candidate.set_pixel(2, 1, 5).unwrap();
        candidate.set_pixel(0, 2, 5).unwrap();

        let (count, first) = find_differences(&reference, &candidate, &ExactComparator)
            .unwrap()
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(first, (2, 1));
    }

    #[test]
    fn test_tolerance_is_per_channel() {
        let cmp = ToleranceComparator::new(2);
        assert!(cmp.pixels_equal(0x1010_1010, 0x1212_0E11));
        assert!(!cmp.pixels_equal(0x1010_1010, 0x1010_1013));
        // A large difference in one channel is not averaged away
        assert!(!cmp.pixels_equal(0x0000_0000, 0x0000_FF00));
    }

    #[test]
    fn test_dimension_mismatch() {
        let err = difference_bitmap(&Bitmap::new(4, 4), &Bitmap::new(8, 8), &ExactComparator)
            .unwrap_err();
        assert!(matches!(
            err,
            GpuCheckError::DimensionMismatch {
                reference: (4, 4),
                candidate: (8, 8)
            }
        ));
    }
}
