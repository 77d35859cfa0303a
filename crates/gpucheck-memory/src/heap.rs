//! Heap kinds and arena pools
//!
//! Each `(heap kind, shared)` pair owns an independent list of arenas and a
//! bump cursor over the newest one. Placements are never reused and arenas
//! are never compacted.

use gpucheck_core::{GpuCheckError, Result};
use gpucheck_gpu::{align_up, HeapKind, RegionId};
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// Properties of one heap kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapKindDescriptor {
    pub host_visible: bool,
    pub host_coherent: bool,
    /// Size of arenas created for this kind, unless a request is larger
    pub default_arena_size: u64,
    /// Whether resources of this kind may be exported through shared handles
    pub shareable: bool,
}

/// Heap kind properties indexed by [`HeapKind`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapKindTable {
    entries: [HeapKindDescriptor; 3],
}

impl HeapKindTable {
    pub fn new(default_arena_size: u64) -> Self {
        let entry = |kind: HeapKind| HeapKindDescriptor {
            host_visible: kind.is_host_visible(),
            // Upload memory is write-combined; readback memory is cached and coherent
            host_coherent: kind == HeapKind::Readback,
            default_arena_size,
            shareable: !kind.is_host_visible(),
        };

        Self {
            entries: HeapKind::ALL.map(entry),
        }
    }

    pub fn get(&self, kind: HeapKind) -> &HeapKindDescriptor {
        &self.entries[kind.index()]
    }

    pub fn set_default_arena_size(&mut self, kind: HeapKind, size: u64) {
        self.entries[kind.index()].default_arena_size = size;
    }
}

impl Index<HeapKind> for HeapKindTable {
    type Output = HeapKindDescriptor;

    fn index(&self, kind: HeapKind) -> &HeapKindDescriptor {
        self.get(kind)
    }
}

/// A memory region carved into placements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arena {
    pub region: RegionId,
    pub capacity: u64,
    /// Bytes handed out so far, including alignment padding
    pub used: u64,
    pub kind: HeapKind,
    pub shared: bool,
}

/// Where a placement landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub region: RegionId,
    pub arena_index: usize,
    pub offset: u64,
}

/// Bump window over the newest arena
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ArenaCursor {
    begin: u64,
    current: u64,
    end: u64,
}

/// Arenas of one `(kind, shared)` pair
#[derive(Debug)]
pub struct ArenaPool {
    kind: HeapKind,
    shared: bool,
    arenas: Vec<Arena>,
    cursor: ArenaCursor,
}

impl ArenaPool {
    pub fn new(kind: HeapKind, shared: bool) -> Self {
        Self {
            kind,
            shared,
            arenas: Vec::new(),
            cursor: ArenaCursor::default(),
        }
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    /// Hand out `size` bytes at `alignment`.
    ///
    /// When the request does not fit the newest arena, `create_region` is
    /// asked for a region of `max(size, arena_size)` bytes and the cursor
    /// restarts at its beginning. Returns the placement and whether a new
    /// arena was created.
    pub fn place<F>(
        &mut self,
        size: u64,
        alignment: u64,
        arena_size: u64,
        create_region: F,
    ) -> Result<(Placement, bool)>
    where
        F: FnOnce(u64) -> Result<RegionId>,
    {
        if size == 0 {
            return Err(GpuCheckError::invalid_configuration(
                "cannot place a zero-byte resource",
            ));
        }

        let mut created = false;
        let mut current = self.cursor.begin + align_up(self.cursor.current - self.cursor.begin, alignment);
        if self.arenas.is_empty() || current + size > self.cursor.end {
            let capacity = size.max(arena_size);
            let region = create_region(capacity)?;
            self.arenas.push(Arena {
                region,
                capacity,
                used: 0,
                kind: self.kind,
                shared: self.shared,
            });
            self.cursor = ArenaCursor {
                begin: 0,
                current: 0,
                end: capacity,
            };
            current = 0;
            created = true;
        }

        let arena_index = self.arenas.len() - 1;
        let offset = current - self.cursor.begin;
        self.cursor.current = current + size;

        let arena = &mut self.arenas[arena_index];
        arena.used = self.cursor.current - self.cursor.begin;

        Ok((
            Placement {
                region: arena.region,
                arena_index,
                offset,
            },
            created,
        ))
    }

    /// Remove every arena, newest first
    pub fn drain_newest_first(&mut self) -> Vec<Arena> {
        self.cursor = ArenaCursor::default();
        let mut arenas: Vec<Arena> = self.arenas.drain(..).collect();
        arenas.reverse();
        arenas
    }
}
