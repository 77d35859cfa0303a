//! Command list recording
//!
//! A [`CommandList`] records copies and state transitions; `close` turns it
//! into a [`ClosedCommandList`], the only thing a queue will execute.

use crate::types::{Footprint, ResourceId, ResourceState};
use smallvec::SmallVec;

/// One recorded GPU command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Transition {
        resource: ResourceId,
        subresource: u32,
        before: ResourceState,
        after: ResourceState,
    },
    CopyBufferRegion {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        num_bytes: u64,
    },
    /// Whole-resource copy between two resources with identical descriptions
    CopyResource { dst: ResourceId, src: ResourceId },
    /// Texture subresource into a linear buffer laid out by `footprint`
    CopyTextureToBuffer {
        dst: ResourceId,
        footprint: Footprint,
        src: ResourceId,
        subresource: u32,
    },
    /// Linear buffer laid out by `footprint` into a texture subresource
    CopyBufferToTexture {
        dst: ResourceId,
        subresource: u32,
        src: ResourceId,
        footprint: Footprint,
    },
}

/// A command list open for recording
#[derive(Debug, Default)]
pub struct CommandList {
    label: String,
    commands: SmallVec<[Command; 8]>,
}

impl CommandList {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: SmallVec::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn resource_barrier(
        &mut self,
        resource: ResourceId,
        subresource: u32,
        before: ResourceState,
        after: ResourceState,
    ) {
        self.commands.push(Command::Transition {
            resource,
            subresource,
            before,
            after,
        });
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        num_bytes: u64,
    ) {
        self.commands.push(Command::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            num_bytes,
        });
    }

    pub fn copy_resource(&mut self, dst: ResourceId, src: ResourceId) {
        self.commands.push(Command::CopyResource { dst, src });
    }

    pub fn copy_texture_to_buffer(
        &mut self,
        dst: ResourceId,
        footprint: Footprint,
        src: ResourceId,
        subresource: u32,
    ) {
        self.commands.push(Command::CopyTextureToBuffer {
            dst,
            footprint,
            src,
            subresource,
        });
    }

    pub fn copy_buffer_to_texture(
        &mut self,
        dst: ResourceId,
        subresource: u32,
        src: ResourceId,
        footprint: Footprint,
    ) {
        self.commands.push(Command::CopyBufferToTexture {
            dst,
            subresource,
            src,
            footprint,
        });
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Finish recording
    pub fn close(self) -> ClosedCommandList {
        ClosedCommandList {
            label: self.label,
            commands: self.commands.into_vec(),
        }
    }
}

/// A finished command list, ready for submission
#[derive(Debug, Clone)]
pub struct ClosedCommandList {
    label: String,
    commands: Vec<Command>,
}

impl ClosedCommandList {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn test_recording_order_is_preserved() {
        let mut ids: SlotMap<ResourceId, ()> = SlotMap::with_key();
        let a = ids.insert(());
        let b = ids.insert(());

        let mut list = CommandList::new("copy");
        list.resource_barrier(a, 0, ResourceState::COMMON, ResourceState::COPY_SOURCE);
        list.copy_resource(b, a);
        assert_eq!(list.len(), 2);

        let closed = list.close();
        assert_eq!(closed.label(), "copy");
        assert!(matches!(closed.commands()[0], Command::Transition { .. }));
        assert_eq!(closed.commands()[1], Command::CopyResource { dst: b, src: a });
    }
}
