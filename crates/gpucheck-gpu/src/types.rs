//! Plain data types shared by every device implementation

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// A resource (buffer or texture) owned by a device's resource table
    pub struct ResourceId;
    /// A memory region ("heap") owned by a device's region table
    pub struct RegionId;
    /// A monotonically increasing completion counter
    pub struct FenceId;
}

/// Default alignment of resources placed in a memory region (64 KiB)
pub const DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

/// Size of one tile mapped onto a reserved resource
pub const TILE_SIZE_IN_BYTES: u64 = 64 * 1024;

/// Row pitch alignment for texture copy footprints
pub const TEXTURE_DATA_PITCH_ALIGNMENT: u64 = 256;

/// Offset alignment for texture copy footprints
pub const TEXTURE_DATA_PLACEMENT_ALIGNMENT: u64 = 512;

/// Transition every subresource at once
pub const ALL_SUBRESOURCES: u32 = u32::MAX;

/// Round `value` up to a multiple of `alignment`. An alignment of zero leaves the value as is.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    match value % alignment {
        0 => value,
        r => value + (alignment - r),
    }
}

/// Category of memory visibility and locality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HeapKind {
    /// Device-local memory, not host visible
    GpuLocal,
    /// Host-visible write-combined memory for uploads
    Upload,
    /// Host-visible cached memory for readback, created through custom heap properties
    Readback,
}

impl HeapKind {
    pub const ALL: [HeapKind; 3] = [HeapKind::GpuLocal, HeapKind::Upload, HeapKind::Readback];

    /// Dense index for table lookups
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_host_visible(self) -> bool {
        !matches!(self, HeapKind::GpuLocal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HeapKind::GpuLocal => "gpu-local",
            HeapKind::Upload => "upload",
            HeapKind::Readback => "readback",
        }
    }
}

impl std::fmt::Display for HeapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a resource gets its memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CreationMethod {
    /// A dedicated allocation made by the device
    Committed,
    /// A sub-range of an existing memory region
    Placed,
    /// A virtually addressed resource whose tiles are mapped separately
    Reserved,
}

bitflags! {
    /// Usage state of a resource as seen by the GPU
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ResourceState: u32 {
        const COMMON = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        /// Required initial state of upload-heap resources
        const GENERIC_READ = Self::VERTEX_AND_CONSTANT_BUFFER.bits()
            | Self::INDEX_BUFFER.bits()
            | Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits()
            | Self::INDIRECT_ARGUMENT.bits()
            | Self::COPY_SOURCE.bits();
    }
}

bitflags! {
    /// Resource creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ResourceFlags: u32 {
        const NONE = 0;
        const ALLOW_RENDER_TARGET = 0x1;
        const ALLOW_DEPTH_STENCIL = 0x2;
        const ALLOW_UNORDERED_ACCESS = 0x4;
        const DENY_SHADER_RESOURCE = 0x8;
    }
}

/// Texel formats the reference devices understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Buffers carry no format
    Unknown,
    Bgra8Unorm,
    Rgba8Unorm,
    R32Uint,
    R16Float,
    R8Unorm,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            PixelFormat::Unknown | PixelFormat::R8Unorm => 1,
            PixelFormat::R16Float => 2,
            PixelFormat::Bgra8Unorm | PixelFormat::Rgba8Unorm | PixelFormat::R32Uint => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceDimension {
    Buffer,
    Texture2D,
}

/// Description of a buffer or texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    /// Byte size for buffers, texel width for textures
    pub width: u64,
    pub height: u32,
    pub array_size: u16,
    pub mip_levels: u16,
    pub format: PixelFormat,
    pub flags: ResourceFlags,
}

impl ResourceDesc {
    pub fn buffer(size: u64, flags: ResourceFlags) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            array_size: 1,
            mip_levels: 1,
            format: PixelFormat::Unknown,
            flags,
        }
    }

    pub fn texture_2d(
        format: PixelFormat,
        width: u64,
        height: u32,
        array_size: u16,
        mip_levels: u16,
        flags: ResourceFlags,
    ) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            width,
            height,
            array_size: array_size.max(1),
            mip_levels: mip_levels.max(1),
            format,
            flags,
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.dimension == ResourceDimension::Buffer
    }

    pub fn subresource_count(&self) -> u32 {
        u32::from(self.mip_levels) * u32::from(self.array_size)
    }
}

/// Description of a memory region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDesc {
    pub size: u64,
    pub kind: HeapKind,
    pub alignment: u64,
    /// Only buffers may be placed (resource heap tier 1 attribution)
    pub buffers_only: bool,
    /// The region may be exported through a shared handle
    pub shared: bool,
}

/// Layout of one subresource copied into a linear buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footprint {
    /// Byte offset of the first row in the linear buffer
    pub offset: u64,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Byte stride between rows, possibly larger than `row_size_bytes`
    pub row_pitch: u64,
    pub num_rows: u32,
    /// Tightly packed bytes per row
    pub row_size_bytes: u64,
    /// Bytes spanned from the first row to the end of the last one
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationInfo {
    pub size: u64,
    pub alignment: u64,
}

/// Feature tiers a device reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// 1: regions hold a single resource category; 2: buffers and textures mix
    pub resource_heap_tier: u8,
    /// 10 or higher: texture bytes are independent of their physical address
    pub heap_serialization_tier: u8,
    pub shared_handles: bool,
    pub reserved_resources: bool,
}

impl DeviceCapabilities {
    /// Whether texture data can be carried between aliased placements
    pub fn supports_heap_serialization(&self) -> bool {
        self.heap_serialization_tier >= 10 && self.resource_heap_tier >= 2
    }
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            resource_heap_tier: 1,
            heap_serialization_tier: 0,
            shared_handles: true,
            reserved_resources: true,
        }
    }
}

/// Cross-process handle to a shared resource or region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SharedHandle(pub u64);

/// Objects that can be exported through a shared handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shareable {
    Resource(ResourceId),
    Region(RegionId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        // Non power-of-two alignments round the same way
        assert_eq!(align_up(13, 4), 16);
        assert_eq!(align_up(10, 0), 10);
    }

    #[test]
    fn test_resource_state_flags() {
        let state = ResourceState::GENERIC_READ;
        assert!(state.contains(ResourceState::COPY_SOURCE));
        assert!(!state.intersects(ResourceState::COPY_DEST));
        assert!(ResourceState::COMMON.contains(ResourceState::COMMON));

        let combined = ResourceState::COPY_DEST | ResourceState::PIXEL_SHADER_RESOURCE;
        assert_eq!(combined.bits(), 0x480);
        assert!(combined.contains(ResourceState::COPY_DEST));
        assert!(!combined.contains(ResourceState::COPY_SOURCE));
        assert_eq!(ResourceState::GENERIC_READ.bits(), 0xAC3);

        let flags = ResourceFlags::ALLOW_RENDER_TARGET | ResourceFlags::DENY_SHADER_RESOURCE;
        assert_eq!(ResourceFlags::from_bits(0x9), Some(flags));
        assert_eq!(ResourceFlags::from_bits(0x100), None);
    }

    #[test]
    fn test_heap_kind_visibility() {
        assert!(!HeapKind::GpuLocal.is_host_visible());
        assert!(HeapKind::Upload.is_host_visible());
        assert!(HeapKind::Readback.is_host_visible());
        assert_eq!(HeapKind::Readback.index(), 2);
    }

    #[test]
    fn test_capabilities_gate() {
        let mut caps = DeviceCapabilities::default();
        assert!(!caps.supports_heap_serialization());
        caps.resource_heap_tier = 2;
        caps.heap_serialization_tier = 10;
        assert!(caps.supports_heap_serialization());
    }
}
