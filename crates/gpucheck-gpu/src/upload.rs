//! Staged uploads into GPU-local resources

use crate::command::CommandList;
use crate::types::{Footprint, ResourceDesc, ResourceId};
use gpucheck_core::{GpuCheckError, Result};

/// Record the copies that move a filled staging buffer into `dst`.
///
/// `footprints` describe where each subresource sits in the staging buffer;
/// buffers take a single byte-range copy.
pub fn record_staged_copy(
    list: &mut CommandList,
    dst: ResourceId,
    dst_desc: &ResourceDesc,
    staging: ResourceId,
    first_subresource: u32,
    footprints: &[Footprint],
) {
    if dst_desc.is_buffer() {
        list.copy_buffer_region(dst, 0, staging, 0, dst_desc.width);
        return;
    }

    for (i, footprint) in footprints.iter().enumerate() {
        list.copy_buffer_to_texture(dst, first_subresource + i as u32, staging, *footprint);
    }
}

/// Spread tightly packed rows out to the row pitch of `footprint`.
///
/// The result starts at the footprint's first row, so it is exactly
/// `total_bytes` long.
pub fn pitch_rows(footprint: &Footprint, packed: &[u8]) -> Result<Vec<u8>> {
    let row = footprint.row_size_bytes as usize;
    let rows = footprint.num_rows as usize;
    if packed.len() != row * rows {
        return Err(GpuCheckError::SizeMismatch {
            expected: (row * rows) as u64,
            actual: packed.len() as u64,
        });
    }

    let mut out = vec![0u8; footprint.total_bytes as usize];
    for (r, src) in packed.chunks_exact(row.max(1)).enumerate().take(rows) {
        let start = r * footprint.row_pitch as usize;
        out[start..start + row].copy_from_slice(src);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout;
    use crate::types::{PixelFormat, ResourceFlags};

    #[test]
    fn test_pitch_rows_pads_each_row() {
        let desc = ResourceDesc::texture_2d(PixelFormat::Bgra8Unorm, 2, 2, 1, 1, ResourceFlags::NONE);
        let fp = layout::footprint(&desc, 0, 0).unwrap();
        let packed: Vec<u8> = (0u8..16).collect();

        let pitched = pitch_rows(&fp, &packed).unwrap();
        assert_eq!(pitched.len(), 256 + 8);
        assert_eq!(&pitched[..8], &packed[..8]);
        assert!(pitched[8..256].iter().all(|b| *b == 0));
        assert_eq!(&pitched[256..], &packed[8..]);
    }

    #[test]
    fn test_pitch_rows_rejects_short_input() {
        let desc = ResourceDesc::texture_2d(PixelFormat::Bgra8Unorm, 2, 2, 1, 1, ResourceFlags::NONE);
        let fp = layout::footprint(&desc, 0, 0).unwrap();
        assert!(matches!(
            pitch_rows(&fp, &[0u8; 15]),
            Err(GpuCheckError::SizeMismatch { expected: 16, actual: 15 })
        ));
    }
}
