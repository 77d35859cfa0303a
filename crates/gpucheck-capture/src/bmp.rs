//! 32-bit uncompressed BMP encoding
//!
//! Files are written the way Windows tools expect a raw surface dump:
//! `BITMAPFILEHEADER` + `BITMAPINFOHEADER`, `BI_RGB`, 32 bits per pixel,
//! bottom-up rows. The decoder accepts what the encoder writes plus
//! top-down files (negative height).

use crate::bitmap::Bitmap;
use bytemuck::{Pod, Zeroable};
use gpucheck_core::{GpuCheckError, Result};
use std::fs;
use std::mem::size_of;
use std::path::Path;

const BMP_MAGIC: u16 = 0x4D42; // "BM"
const BI_RGB: u32 = 0;

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FileHeader {
    kind: u16,
    size: u32,
    reserved1: u16,
    reserved2: u16,
    pixel_offset: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct InfoHeader {
    size: u32,
    width: i32,
    height: i32,
    planes: u16,
    bit_count: u16,
    compression: u32,
    size_image: u32,
    x_pels_per_meter: i32,
    y_pels_per_meter: i32,
    colors_used: u32,
    colors_important: u32,
}

const FILE_HEADER_SIZE: usize = size_of::<FileHeader>();
const INFO_HEADER_SIZE: usize = size_of::<InfoHeader>();
const HEADERS_SIZE: usize = FILE_HEADER_SIZE + INFO_HEADER_SIZE;

/// Encode `bitmap` as a 32-bit bottom-up BMP
pub fn encode(bitmap: &Bitmap) -> Result<Vec<u8>> {
    let (width, height) = bitmap.dimensions();
    let pixel_bytes = bitmap.pixels().len() * 4;
    let file_size = u32::try_from(HEADERS_SIZE + pixel_bytes)
        .map_err(|_| GpuCheckError::codec("bitmap too large for a BMP file"))?;
    let signed = |v: u32| {
        i32::try_from(v).map_err(|_| GpuCheckError::codec("bitmap dimension exceeds i32"))
    };

    let file_header = FileHeader {
        kind: BMP_MAGIC.to_le(),
        size: file_size.to_le(),
        reserved1: 0,
        reserved2: 0,
        pixel_offset: (HEADERS_SIZE as u32).to_le(),
    };
    let info_header = InfoHeader {
        size: (INFO_HEADER_SIZE as u32).to_le(),
        width: signed(width)?.to_le(),
        height: signed(height)?.to_le(),
        planes: 1u16.to_le(),
        bit_count: 32u16.to_le(),
        compression: BI_RGB.to_le(),
        ..Zeroable::zeroed()
    };

    let mut out = Vec::with_capacity(HEADERS_SIZE + pixel_bytes);
    out.extend_from_slice(bytemuck::bytes_of(&file_header));
    out.extend_from_slice(bytemuck::bytes_of(&info_header));
    for y in (0..height).rev() {
        if let Some(row) = bitmap.row(y) {
            out.extend(row.iter().flat_map(|p| p.to_le_bytes()));
        }
    }
    Ok(out)
}

/// Decode a 32-bit `BI_RGB` BMP
pub fn decode(bytes: &[u8]) -> Result<Bitmap> {
    if bytes.len() < HEADERS_SIZE {
        return Err(GpuCheckError::codec(format!(
            "BMP of {} bytes is shorter than its headers",
            bytes.len()
        )));
    }

    let file_header: FileHeader = bytemuck::pod_read_unaligned(&bytes[..FILE_HEADER_SIZE]);
    let info_header: InfoHeader = bytemuck::pod_read_unaligned(&bytes[FILE_HEADER_SIZE..HEADERS_SIZE]);

    let kind = u16::from_le(file_header.kind);
    let pixel_offset = u32::from_le(file_header.pixel_offset) as usize;
    let bit_count = u16::from_le(info_header.bit_count);
    let compression = u32::from_le(info_header.compression);
    let raw_width = i32::from_le(info_header.width);
    let raw_height = i32::from_le(info_header.height);

    if kind != BMP_MAGIC {
        return Err(GpuCheckError::codec(format!("not a BMP file (magic {:#06x})", kind)));
    }
    if bit_count != 32 || compression != BI_RGB {
        return Err(GpuCheckError::codec(format!(
            "unsupported BMP encoding: {} bpp, compression {}",
            bit_count, compression
        )));
    }
    if raw_width < 0 {
        return Err(GpuCheckError::codec("negative BMP width"));
    }

    let width = raw_width as u32;
    let height = raw_height.unsigned_abs();
    let bottom_up = raw_height > 0;
    let row_bytes = width as usize * 4;
    let pixel_bytes = row_bytes * height as usize;
    let data = bytes
        .get(pixel_offset..pixel_offset + pixel_bytes)
        .ok_or_else(|| {
            GpuCheckError::codec(format!(
                "BMP pixel data truncated: need {} bytes at offset {}, file has {}",
                pixel_bytes,
                pixel_offset,
                bytes.len()
            ))
        })?;

    let mut packed = Vec::with_capacity(pixel_bytes);
    for y in 0..height as usize {
        let stored = if bottom_up { height as usize - 1 - y } else { y };
        packed.extend_from_slice(&data[stored * row_bytes..(stored + 1) * row_bytes]);
    }
    Bitmap::from_le_bytes(width, height, &packed)
}

pub fn write_bmp(path: impl AsRef<Path>, bitmap: &Bitmap) -> Result<()> {
    fs::write(path, encode(bitmap)?)?;
    Ok(())
}

pub fn read_bmp(path: impl AsRef<Path>) -> Result<Bitmap> {
    decode(&fs::read(path)?)
}

/// Whether `bytes` start with the BMP magic
pub fn is_bmp(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && u16::from_le_bytes([bytes[0], bytes[1]]) == BMP_MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_header_layout() {
        assert_eq!(FILE_HEADER_SIZE, 14);
        assert_eq!(INFO_HEADER_SIZE, 40);
    }

    #[test]
    fn test_rows_are_stored_bottom_up() {
        let bitmap = Bitmap::from_pixels(1, 2, vec![0x0000_0001, 0x0000_0002]).unwrap();
        let bytes = encode(&bitmap).unwrap();

        assert_eq!(&bytes[..2], b"BM");
        assert_eq!(bytes.len(), 54 + 8);
        assert_eq!(u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]), 62);
        // Bottom row first
        assert_eq!(&bytes[54..58], &[2, 0, 0, 0]);
        assert_eq!(&bytes[58..62], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_decode_restores_top_down_order() {
        let pixels: Vec<u32> = (0..12).map(|i| 0xFF00_0000 | i).collect();
        let bitmap = Bitmap::from_pixels(4, 3, pixels).unwrap();

        let decoded = decode(&encode(&bitmap).unwrap()).unwrap();
        assert_eq!(decoded, bitmap);
    }

    #[test]
    fn test_decode_accepts_top_down_files() {
        let bitmap = Bitmap::from_pixels(1, 2, vec![10, 20]).unwrap();
        let mut bytes = encode(&bitmap).unwrap();
        // Flip to a top-down file: negate the height and reverse the rows
        bytes[22..26].copy_from_slice(&(-2i32).to_le_bytes());
        let (top, bottom) = (bytes[54..58].to_vec(), bytes[58..62].to_vec());
        bytes[54..58].copy_from_slice(&bottom);
        bytes[58..62].copy_from_slice(&top);

        assert_eq!(decode(&bytes).unwrap(), bitmap);
    }

    #[test]
    fn test_decode_rejects_other_encodings() {
        let mut bytes = encode(&Bitmap::new(1, 1)).unwrap();
        bytes[28] = 24;
        assert!(matches!(decode(&bytes), Err(GpuCheckError::Codec { .. })));
        assert!(matches!(decode(b"PNG"), Err(GpuCheckError::Codec { .. })));

        let mut truncated = encode(&Bitmap::new(2, 2)).unwrap();
        truncated.truncate(60);
        assert!(matches!(decode(&truncated), Err(GpuCheckError::Codec { .. })));
    }
}
