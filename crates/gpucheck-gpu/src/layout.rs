//! Pitch-linear subresource layout
//!
//! Copyable footprints, allocation sizes and intermediate sizes for the
//! reference devices. Rows are padded to `TEXTURE_DATA_PITCH_ALIGNMENT` and
//! subresources start on `TEXTURE_DATA_PLACEMENT_ALIGNMENT` boundaries, the
//! way a D3D12-class driver lays out copy footprints.

use crate::types::{
    align_up, AllocationInfo, Footprint, ResourceDesc, DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
    TEXTURE_DATA_PITCH_ALIGNMENT, TEXTURE_DATA_PLACEMENT_ALIGNMENT,
};
use gpucheck_core::{GpuCheckError, Result};

/// Subresource index for a mip level of an array slice
pub fn subresource_index(mip_level: u32, array_slice: u32, mip_levels: u32) -> u32 {
    mip_level + array_slice * mip_levels
}

/// Footprint of one subresource, starting at `base_offset`
pub fn footprint(desc: &ResourceDesc, subresource: u32, base_offset: u64) -> Result<Footprint> {
    if subresource >= desc.subresource_count() {
        return Err(GpuCheckError::invalid_configuration(format!(
            "subresource {} out of range ({} subresources)",
            subresource,
            desc.subresource_count()
        )));
    }

    if desc.is_buffer() {
        return Ok(Footprint {
            offset: base_offset,
            format: desc.format,
            width: u32::try_from(desc.width).unwrap_or(u32::MAX),
            height: 1,
            row_pitch: align_up(desc.width, TEXTURE_DATA_PITCH_ALIGNMENT),
            num_rows: 1,
            row_size_bytes: desc.width,
            total_bytes: desc.width,
        });
    }

    let mip = subresource % u32::from(desc.mip_levels);
    let width = (desc.width >> mip).max(1);
    let height = (desc.height >> mip).max(1);
    let row_size_bytes = width * desc.format.bytes_per_pixel();
    let row_pitch = align_up(row_size_bytes, TEXTURE_DATA_PITCH_ALIGNMENT);

    Ok(Footprint {
        offset: base_offset,
        format: desc.format,
        width: u32::try_from(width).unwrap_or(u32::MAX),
        height,
        row_pitch,
        num_rows: height,
        row_size_bytes,
        total_bytes: row_pitch * u64::from(height - 1) + row_size_bytes,
    })
}

/// Footprints of `count` consecutive subresources packed into one linear buffer
pub fn footprints(
    desc: &ResourceDesc,
    first_subresource: u32,
    count: u32,
    base_offset: u64,
) -> Result<Vec<Footprint>> {
    let mut offset = base_offset;
    let mut result = Vec::with_capacity(count as usize);
    for subresource in first_subresource..first_subresource.saturating_add(count) {
        let fp = footprint(desc, subresource, offset)?;
        offset = align_up(fp.offset + fp.total_bytes, TEXTURE_DATA_PLACEMENT_ALIGNMENT);
        result.push(fp);
    }
    Ok(result)
}

/// Bytes a linear staging buffer needs to carry the given subresources
pub fn intermediate_size(desc: &ResourceDesc, first_subresource: u32, count: u32) -> Result<u64> {
    Ok(footprints(desc, first_subresource, count, 0)?
        .last()
        .map(|fp| fp.offset + fp.total_bytes)
        .unwrap_or(0))
}

/// Size and alignment of the backing memory a resource occupies
pub fn allocation_info(desc: &ResourceDesc) -> Result<AllocationInfo> {
    let bytes = if desc.is_buffer() {
        desc.width
    } else {
        intermediate_size(desc, 0, desc.subresource_count())?
    };

    Ok(AllocationInfo {
        size: align_up(bytes.max(1), DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT),
        alignment: DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT,
    })
}
