//! Descriptor binding table.
//!
//! Command lists do not talk to the backend when a resource is bound. They
//! record it in a [`BindingTable`], a fixed `[set][binding]` grid with a
//! dirty bit per set, and resolve the dirty sets right before the next draw.
//! Resolution only keeps the bindings the bound pipeline layout declares, so
//! bindings left over from a previous layout never reach the backend.

use crate::handle::{BufferHandle, SamplerHandle, TextureViewHandle};
use crate::types::{DescriptorKind, PipelineLayoutInfo};

/// Number of descriptor sets a command list tracks.
pub const MAX_DESCRIPTOR_SETS: usize = 4;

/// Number of bindings tracked per descriptor set.
pub const MAX_BINDINGS_PER_SET: usize = 16;

/// A resource bound at one `[set][binding]` slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BoundResource {
    UniformBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: BufferHandle,
        offset: u64,
        range: u64,
    },
    Sampler(SamplerHandle),
    Texture(TextureViewHandle),
}

impl BoundResource {
    /// The descriptor kind this resource satisfies.
    pub fn kind(&self) -> DescriptorKind {
        match self {
            BoundResource::UniformBuffer { .. } => DescriptorKind::UniformBuffer,
            BoundResource::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
            BoundResource::Sampler(_) => DescriptorKind::Sampler,
            BoundResource::Texture(_) => DescriptorKind::SampledTexture,
        }
    }
}

/// `[set][binding]` grid of bound resources with per-set dirty tracking.
#[derive(Clone, Debug, Default)]
pub struct BindingTable {
    slots: [[Option<BoundResource>; MAX_BINDINGS_PER_SET]; MAX_DESCRIPTOR_SETS],
    dirty: u8,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `resource` at `(set, binding)` and marks the set dirty.
    /// Last write wins.
    ///
    /// # Panics
    ///
    /// Panics if `set` or `binding` is outside the table.
    #[track_caller]
    pub fn bind(&mut self, set: u32, binding: u32, resource: BoundResource) {
        let (set, binding) = (set as usize, binding as usize);
        assert!(
            set < MAX_DESCRIPTOR_SETS && binding < MAX_BINDINGS_PER_SET,
            "descriptor slot ({set}, {binding}) outside the {MAX_DESCRIPTOR_SETS}x{MAX_BINDINGS_PER_SET} table"
        );
        self.slots[set][binding] = Some(resource);
        self.dirty |= 1 << set;
    }

    #[inline]
    pub fn get(&self, set: u32, binding: u32) -> Option<BoundResource> {
        self.slots
            .get(set as usize)
            .and_then(|s| s.get(binding as usize))
            .copied()
            .flatten()
    }

    #[inline]
    pub fn is_dirty(&self, set: u32) -> bool {
        (set as usize) < MAX_DESCRIPTOR_SETS && self.dirty & (1 << set) != 0
    }

    #[inline]
    pub fn has_dirty_sets(&self) -> bool {
        self.dirty != 0
    }

    /// Marks every set dirty, e.g. after the pipeline layout changed.
    pub fn mark_all_dirty(&mut self) {
        self.dirty = (1 << MAX_DESCRIPTOR_SETS) - 1;
    }

    /// Clears the dirty bit of `set`.
    pub fn clean(&mut self, set: u32) {
        self.dirty &= !(1 << set);
    }

    /// Indices of the dirty sets, ascending.
    pub fn dirty_sets(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_DESCRIPTOR_SETS as u32).filter(|&set| self.is_dirty(set))
    }

    /// Bindings of `set` that `layout` declares with a matching kind, in
    /// binding order.
    pub fn resolve_set(&self, set: u32, layout: &PipelineLayoutInfo) -> Vec<(u32, BoundResource)> {
        let Some(bindings) = self.slots.get(set as usize) else {
            return Vec::new();
        };
        bindings
            .iter()
            .enumerate()
            .filter_map(|(binding, slot)| {
                let resource = (*slot)?;
                let declared = layout.declared(set, binding as u32)?;
                (declared.kind == resource.kind()).then_some((binding as u32, resource))
            })
            .collect()
    }

    /// Forgets every binding.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
