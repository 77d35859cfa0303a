//! Host-side snapshots of 32-bit surfaces

use gpucheck_core::{GpuCheckError, Result};
use image::RgbaImage;

/// Width × height 32-bit pixels, row-major, top row first.
///
/// Pixels are stored as little-endian words read straight from the surface,
/// so a BGRA8 texel `[b, g, r, a]` becomes `0xAARRGGBB`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

impl Bitmap {
    /// A black bitmap
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, 0)
    }

    pub fn filled(width: u32, height: u32, value: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![value; width as usize * height as usize],
        }
    }

    /// Wrap `pixels`, which must hold exactly `width * height` entries
    pub fn from_pixels(width: u32, height: u32, pixels: Vec<u32>) -> Result<Self> {
        let expected = width as u64 * height as u64;
        if pixels.len() as u64 != expected {
            return Err(GpuCheckError::SizeMismatch {
                expected,
                actual: pixels.len() as u64,
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Build from tightly packed little-endian 32-bit pixels
    pub fn from_le_bytes(width: u32, height: u32, bytes: &[u8]) -> Result<Self> {
        let expected = width as u64 * height as u64 * 4;
        if bytes.len() as u64 != expected {
            return Err(GpuCheckError::SizeMismatch {
                expected,
                actual: bytes.len() as u64,
            });
        }
        let pixels = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// True for a slot that was never populated
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u32] {
        &mut self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get(self.index(x, y)).copied()
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, value: u32) -> Result<()> {
        if x >= self.width || y >= self.height {
            return Err(GpuCheckError::InvalidIndex {
                index: self.index(x, y),
                len: self.pixels.len(),
            });
        }
        let index = self.index(x, y);
        self.pixels[index] = value;
        Ok(())
    }

    pub fn row(&self, y: u32) -> Option<&[u32]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.width as usize;
        self.pixels.get(start..start + self.width as usize)
    }

    /// Copy every row of `source` into `self`, starting at column `x_offset`
    pub fn blit(&mut self, source: &Bitmap, x_offset: u32) -> Result<()> {
        if source.height > self.height || x_offset as u64 + source.width as u64 > self.width as u64 {
            return Err(GpuCheckError::DimensionMismatch {
                reference: self.dimensions(),
                candidate: source.dimensions(),
            });
        }

        let width = source.width as usize;
        for y in 0..source.height {
            let dst = self.index(x_offset, y);
            let src = y as usize * width;
            self.pixels[dst..dst + width].copy_from_slice(&source.pixels[src..src + width]);
        }
        Ok(())
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
    }

    /// Convert to an RGBA image, treating each pixel as `0xAARRGGBB`
    pub fn to_rgba8(&self) -> Result<RgbaImage> {
        let rgba = self
            .pixels
            .iter()
            .flat_map(|p| {
                let [b, g, r, a] = p.to_le_bytes();
                [r, g, b, a]
            })
            .collect();
        RgbaImage::from_raw(self.width, self.height, rgba)
            .ok_or_else(|| GpuCheckError::codec("pixel buffer does not match bitmap dimensions"))
    }

    pub fn from_rgba8(image: &RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        let pixels = image
            .pixels()
            .map(|p| {
                let [r, g, b, a] = p.0;
                u32::from_le_bytes([b, g, r, a])
            })
            .collect();
        Self {
            width,
            height,
            pixels,
        }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_from_le_bytes_reads_bgra_words() {
        let bitmap = Bitmap::from_le_bytes(1, 1, &[0x11, 0x22, 0x33, 0x44]).unwrap();
        assert_eq!(bitmap.pixels(), &[0x4433_2211]);
        assert_eq!(bitmap.to_le_bytes(), vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_from_pixels_checks_length() {
        assert!(matches!(
            Bitmap::from_pixels(2, 2, vec![0; 3]),
            Err(GpuCheckError::SizeMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_blit_places_rows_at_offset() {
        let mut canvas = Bitmap::new(5, 2);
        let source = Bitmap::from_pixels(2, 2, vec![1, 2, 3, 4]).unwrap();

        canvas.blit(&source, 3).unwrap();

        assert_eq!(canvas.row(0).unwrap(), &[0, 0, 0, 1, 2]);
        assert_eq!(canvas.row(1).unwrap(), &[0, 0, 0, 3, 4]);
        assert!(canvas.blit(&source, 4).is_err());
    }

    #[test]
    fn test_rgba_conversion_swaps_red_and_blue() {
        let bitmap = Bitmap::from_pixels(2, 1, vec![0xFF00_00FF, 0x8012_3456]).unwrap();
        let rgba = bitmap.to_rgba8().unwrap();

        assert_eq!(rgba.get_pixel(0, 0).0, [0x00, 0x00, 0xFF, 0xFF]);
        assert_eq!(rgba.get_pixel(1, 0).0, [0x12, 0x34, 0x56, 0x80]);
        assert_eq!(Bitmap::from_rgba8(&rgba), bitmap);
    }

    #[test]
    fn test_pixel_access_bounds() {
        let mut bitmap = Bitmap::new(2, 2);
        bitmap.set_pixel(1, 1, 7).unwrap();
        assert_eq!(bitmap.pixel(1, 1), Some(7));
        assert_eq!(bitmap.pixel(2, 0), None);
        assert!(bitmap.set_pixel(0, 2, 1).is_err());
    }
}
