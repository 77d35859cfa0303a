//! Scoped resource state transitions

use crate::command::CommandList;
use crate::types::{ResourceId, ResourceState};
use std::ops::{Deref, DerefMut};

/// Records a transition on creation and the reverse transition on drop.
/// Nothing is recorded when both states are equal.
///
/// The guard dereferences to the command list, so copies recorded through it
/// land between the two barriers:
///
/// ```
/// # use gpucheck_gpu::{CommandList, ResourceState, TemporaryTransition, ResourceId, Command};
/// # let resource = ResourceId::default();
/// let mut list = CommandList::new("readback");
/// {
///     let mut scoped = TemporaryTransition::new(
///         &mut list,
///         resource,
///         ResourceState::RENDER_TARGET,
///         ResourceState::COPY_SOURCE,
///     );
///     scoped.copy_resource(resource, resource);
/// }
/// assert_eq!(list.len(), 3);
/// assert!(matches!(
///     list.commands()[2],
///     Command::Transition { after: ResourceState::RENDER_TARGET, .. }
/// ));
/// ```
pub struct TemporaryTransition<'a> {
    list: &'a mut CommandList,
    resource: ResourceId,
    subresource: u32,
    before: ResourceState,
    after: ResourceState,
}

impl<'a> TemporaryTransition<'a> {
    /// Transition every subresource from `before` to `after`
    pub fn new(
        list: &'a mut CommandList,
        resource: ResourceId,
        before: ResourceState,
        after: ResourceState,
    ) -> Self {
        Self::for_subresource(list, resource, crate::types::ALL_SUBRESOURCES, before, after)
    }

    pub fn for_subresource(
        list: &'a mut CommandList,
        resource: ResourceId,
        subresource: u32,
        before: ResourceState,
        after: ResourceState,
    ) -> Self {
        if before != after {
            list.resource_barrier(resource, subresource, before, after);
        }
        Self {
            list,
            resource,
            subresource,
            before,
            after,
        }
    }
}

impl Deref for TemporaryTransition<'_> {
    type Target = CommandList;

    fn deref(&self) -> &CommandList {
        self.list
    }
}

impl DerefMut for TemporaryTransition<'_> {
    fn deref_mut(&mut self) -> &mut CommandList {
        self.list
    }
}

impl Drop for TemporaryTransition<'_> {
    fn drop(&mut self) {
        if self.before != self.after {
            self.list
                .resource_barrier(self.resource, self.subresource, self.after, self.before);
        }
    }
}
