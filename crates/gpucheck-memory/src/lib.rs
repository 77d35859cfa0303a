//! GPU buffer sub-allocation for gpucheck
//!
//! A monotonic bump allocator over per-heap-kind arenas. Buffers are placed,
//! reserved or committed on a [`GpuDevice`](gpucheck_gpu::GpuDevice) and
//! recorded so later uploads pick the right path.

pub mod heap;
pub mod suballocator;

pub use heap::{Arena, ArenaPool, HeapKindDescriptor, HeapKindTable, Placement};
pub use suballocator::{AllocationRecord, AllocationStats, BufferAllocator, BufferRequest};
