//! Arena entries and the generic resource arena.
//!
//! Every live GPU object of a [`Device`](crate::device::Device) is an entry
//! in a [`ResourceArena`]: its create info next to exactly one native object.
//! The [`Resource`] trait ties an entry type to its handle type and to the
//! routine that releases the native object, so the device's accessors and
//! deferred destruction are written once for all seven kinds.

use std::fmt;

use crate::arena::StableIndexArena;
use crate::backend::{
    Backend, NativeBuffer, NativePipelineLayout, NativeSampler, NativeShader, NativeSwapchain,
    NativeTexture, NativeTextureView,
};
use crate::handle::{
    BufferHandle, PipelineLayoutHandle, ResourceType, SamplerHandle, ShaderHandle,
    SwapchainHandle, TextureHandle, TextureViewHandle, TypedHandle,
};
use crate::types::{
    BufferInfo, PipelineLayoutInfo, SamplerInfo, ShaderStage, SwapchainInfo, TextureInfo,
    TextureViewInfo,
};

/// An arena entry.
pub trait Resource: Send + Sync + Sized + 'static {
    type Handle: TypedHandle;

    /// Releases the native object. Called exactly once, when the entry leaves
    /// its arena.
    fn release(self, backend: &dyn Backend);
}

/// A GPU buffer.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) info: BufferInfo,
    pub(crate) native: NativeBuffer,
}

impl Buffer {
    #[inline]
    pub fn info(&self) -> &BufferInfo {
        &self.info
    }

    #[inline]
    pub fn native(&self) -> NativeBuffer {
        self.native
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.info.size
    }
}

impl Resource for Buffer {
    type Handle = BufferHandle;

    fn release(self, backend: &dyn Backend) {
        backend.buffer_destroy(self.native);
    }
}

/// A texture. Swapchain backbuffers are textures owned by their swapchain.
#[derive(Debug)]
pub struct Texture {
    pub(crate) info: TextureInfo,
    pub(crate) native: NativeTexture,
    pub(crate) swapchain: Option<SwapchainHandle>,
}

impl Texture {
    #[inline]
    pub fn info(&self) -> &TextureInfo {
        &self.info
    }

    #[inline]
    pub fn native(&self) -> NativeTexture {
        self.native
    }

    /// The swapchain this texture is a backbuffer of.
    #[inline]
    pub fn swapchain(&self) -> Option<SwapchainHandle> {
        self.swapchain
    }
}

impl Resource for Texture {
    type Handle = TextureHandle;

    fn release(self, backend: &dyn Backend) {
        // Backbuffers go away with their swapchain.
        if self.swapchain.is_none() {
            backend.texture_destroy(self.native);
        }
    }
}

/// A view of a texture.
#[derive(Debug)]
pub struct TextureView {
    pub(crate) info: TextureViewInfo,
    pub(crate) native: NativeTextureView,
    pub(crate) swapchain: Option<SwapchainHandle>,
}

impl TextureView {
    #[inline]
    pub fn info(&self) -> &TextureViewInfo {
        &self.info
    }

    #[inline]
    pub fn native(&self) -> NativeTextureView {
        self.native
    }

    /// The viewed texture.
    #[inline]
    pub fn texture(&self) -> TextureHandle {
        self.info.texture
    }

    #[inline]
    pub fn swapchain(&self) -> Option<SwapchainHandle> {
        self.swapchain
    }
}

impl Resource for TextureView {
    type Handle = TextureViewHandle;

    fn release(self, backend: &dyn Backend) {
        if self.swapchain.is_none() {
            backend.texture_view_destroy(self.native);
        }
    }
}

/// A sampler.
#[derive(Debug)]
pub struct Sampler {
    pub(crate) info: SamplerInfo,
    pub(crate) native: NativeSampler,
}

impl Sampler {
    #[inline]
    pub fn info(&self) -> &SamplerInfo {
        &self.info
    }

    #[inline]
    pub fn native(&self) -> NativeSampler {
        self.native
    }
}

impl Resource for Sampler {
    type Handle = SamplerHandle;

    fn release(self, backend: &dyn Backend) {
        backend.sampler_destroy(self.native);
    }
}

/// A shader module. The bytecode is not kept once the module exists.
#[derive(Debug)]
pub struct Shader {
    pub(crate) stage: ShaderStage,
    pub(crate) entry_point: String,
    pub(crate) native: NativeShader,
}

impl Shader {
    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    #[inline]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    #[inline]
    pub fn native(&self) -> NativeShader {
        self.native
    }
}

impl Resource for Shader {
    type Handle = ShaderHandle;

    fn release(self, backend: &dyn Backend) {
        backend.shader_destroy(self.native);
    }
}

/// A pipeline layout.
#[derive(Debug)]
pub struct PipelineLayout {
    pub(crate) info: PipelineLayoutInfo,
    pub(crate) native: NativePipelineLayout,
}

impl PipelineLayout {
    #[inline]
    pub fn info(&self) -> &PipelineLayoutInfo {
        &self.info
    }

    #[inline]
    pub fn native(&self) -> NativePipelineLayout {
        self.native
    }
}

impl Resource for PipelineLayout {
    type Handle = PipelineLayoutHandle;

    fn release(self, backend: &dyn Backend) {
        backend.pipeline_layout_destroy(self.native);
    }
}

/// A swapchain and the arena entries of its backbuffers.
#[derive(Debug)]
pub struct Swapchain {
    /// Actual backbuffer description, as reported by the backend.
    pub(crate) info: SwapchainInfo,
    pub(crate) native: NativeSwapchain,
    pub(crate) textures: Vec<TextureHandle>,
    pub(crate) views: Vec<TextureViewHandle>,
    /// Index of the last acquired backbuffer.
    pub(crate) current: u32,
}

impl Swapchain {
    #[inline]
    pub fn info(&self) -> &SwapchainInfo {
        &self.info
    }

    #[inline]
    pub fn native(&self) -> NativeSwapchain {
        self.native
    }

    #[inline]
    pub fn backbuffer_index(&self) -> u32 {
        self.current
    }

    pub fn backbuffer_textures(&self) -> &[TextureHandle] {
        &self.textures
    }

    pub fn backbuffer_views(&self) -> &[TextureViewHandle] {
        &self.views
    }
}

impl Resource for Swapchain {
    type Handle = SwapchainHandle;

    fn release(self, backend: &dyn Backend) {
        backend.swapchain_destroy(self.native);
    }
}

/// A [`StableIndexArena`] of one resource kind, addressed by typed handles.
pub struct ResourceArena<R> {
    entries: StableIndexArena<R>,
}

impl<R> Default for ResourceArena<R> {
    fn default() -> Self {
        Self {
            entries: StableIndexArena::new(),
        }
    }
}

impl<R: Resource> ResourceArena<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `entry` and returns its handle.
    pub fn insert(&mut self, entry: R) -> R::Handle {
        R::Handle::from_index(self.entries.emplace(entry))
    }

    /// Resolves `handle`.
    ///
    /// # Panics
    ///
    /// Panics if `handle` is null, carries another type tag, or names a slot
    /// that is not allocated.
    #[track_caller]
    pub fn get(&self, handle: R::Handle) -> &R {
        Self::check(handle);
        self.entries.at(handle.index())
    }

    #[track_caller]
    pub fn get_mut(&mut self, handle: R::Handle) -> &mut R {
        Self::check(handle);
        self.entries.at_mut(handle.index())
    }

    /// Resolves `handle` if it names a live entry of this arena.
    pub fn try_get(&self, handle: R::Handle) -> Option<&R> {
        if handle.raw().resource_type() != Some(R::Handle::TYPE) {
            return None;
        }
        self.entries.get(handle.index())
    }

    pub fn is_valid(&self, handle: R::Handle) -> bool {
        self.try_get(handle).is_some()
    }

    /// Takes the entry out of the arena; the caller releases it.
    #[track_caller]
    pub fn remove(&mut self, handle: R::Handle) -> R {
        Self::check(handle);
        self.entries.remove(handle.index())
    }

    /// Handles of every live entry, in index order.
    pub fn handles(&self) -> Vec<R::Handle> {
        self.entries
            .indices()
            .into_iter()
            .map(R::Handle::from_index)
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[track_caller]
    fn check(handle: R::Handle) {
        let raw = handle.raw();
        assert!(!raw.is_null(), "null {} handle", R::Handle::TYPE);
        assert_eq!(
            raw.resource_type(),
            Some(R::Handle::TYPE),
            "{raw:?} used with the {} arena",
            R::Handle::TYPE
        );
    }
}

impl<R> fmt::Debug for ResourceArena<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceArena")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// Maps an entry type to its arena inside [`Resources`].
pub(crate) trait ArenaOf<R: Resource> {
    fn arena(&self) -> &ResourceArena<R>;
    fn arena_mut(&mut self) -> &mut ResourceArena<R>;
}

/// The seven arenas of a device.
#[derive(Debug, Default)]
pub(crate) struct Resources {
    pub buffers: ResourceArena<Buffer>,
    pub textures: ResourceArena<Texture>,
    pub texture_views: ResourceArena<TextureView>,
    pub samplers: ResourceArena<Sampler>,
    pub shaders: ResourceArena<Shader>,
    pub pipeline_layouts: ResourceArena<PipelineLayout>,
    pub swapchains: ResourceArena<Swapchain>,
}

macro_rules! arena_of {
    ($($entry:ty => $field:ident),* $(,)?) => {
        $(
            impl ArenaOf<$entry> for Resources {
                #[inline]
                fn arena(&self) -> &ResourceArena<$entry> {
                    &self.$field
                }

                #[inline]
                fn arena_mut(&mut self) -> &mut ResourceArena<$entry> {
                    &mut self.$field
                }
            }
        )*
    };
}

arena_of! {
    Buffer => buffers,
    Texture => textures,
    TextureView => texture_views,
    Sampler => samplers,
    Shader => shaders,
    PipelineLayout => pipeline_layouts,
    Swapchain => swapchains,
}

impl Resources {
    /// Live entries of one kind.
    pub fn live_count(&self, ty: ResourceType) -> usize {
        match ty {
            ResourceType::Buffer => self.buffers.len(),
            ResourceType::Texture => self.textures.len(),
            ResourceType::TextureView => self.texture_views.len(),
            ResourceType::Swapchain => self.swapchains.len(),
            ResourceType::Sampler => self.samplers.len(),
            ResourceType::Shader => self.shaders.len(),
            ResourceType::PipelineLayout => self.pipeline_layouts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::handle::DeviceResourceHandle;
    use crate::types::{BufferUsage, MemoryUsage};

    fn sampler(native: u64) -> Sampler {
        Sampler {
            info: SamplerInfo::default(),
            native: NativeSampler(native),
        }
    }

    #[test]
    fn test_insert_returns_typed_handles() {
        let mut arena = ResourceArena::new();
        let a = arena.insert(sampler(1));
        let b = arena.insert(sampler(2));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena.get(b).native(), NativeSampler(2));
        assert_eq!(arena.handles(), vec![a, b]);
    }

    #[test]
    fn test_removed_handle_is_invalid() {
        let mut arena = ResourceArena::new();
        let handle = arena.insert(sampler(1));
        arena.remove(handle);
        assert!(!arena.is_valid(handle));
        assert!(arena.try_get(handle).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    #[should_panic(expected = "null")]
    fn test_null_handle_panics() {
        let arena: ResourceArena<Sampler> = ResourceArena::new();
        arena.get(SamplerHandle::NULL);
    }

    #[test]
    #[should_panic(expected = "used with the sampler arena")]
    fn test_mistagged_handle_panics() {
        let mut arena = ResourceArena::new();
        arena.insert(sampler(1));
        let forged = SamplerHandle::from_raw_unchecked(DeviceResourceHandle::make(
            0,
            ResourceType::Buffer,
        ));
        arena.get(forged);
    }

    #[test]
    fn test_backbuffer_release_leaves_native_alone() {
        let backend = HeadlessBackend::new();
        let info = TextureInfo::new_2d(
            crate::types::Format::Rgba8Unorm,
            1,
            1,
            crate::types::TextureUsage::SAMPLED,
        );
        let native = backend.texture_create(&info).unwrap();
        Texture {
            info: info.clone(),
            native,
            swapchain: Some(SwapchainHandle::from_index(0)),
        }
        .release(&backend);
        assert!(backend.texture_layout(native).is_some());

        Texture {
            info,
            native,
            swapchain: None,
        }
        .release(&backend);
        assert!(backend.texture_layout(native).is_none());
    }

    #[test]
    fn test_live_count_per_type() {
        let backend = HeadlessBackend::new();
        let info = BufferInfo::new(4, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu);
        let native = backend.buffer_create(&info).unwrap();
        let mut resources = Resources::default();
        let handle = resources.buffers.insert(Buffer { info, native });
        assert_eq!(resources.live_count(ResourceType::Buffer), 1);
        assert_eq!(resources.live_count(ResourceType::Texture), 0);
        resources.buffers.remove(handle).release(&backend);
        assert_eq!(backend.live_objects(), 0);
    }
}
