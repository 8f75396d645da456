//! The native graphics backend contract.
//!
//! # Overview
//!
//! [`Backend`] is the only seam between the core and a native graphics API.
//! A [`Device`](crate::device::Device) holds one as `Arc<dyn Backend>`, so a
//! Vulkan backend and the CPU [`HeadlessBackend`] are interchangeable without
//! recompiling the core.
//!
//! Native objects cross the seam as opaque `Copy` ids ([`NativeBuffer`],
//! [`NativeTexture`], ...). What the id means is up to the backend; the core
//! only stores, compares and passes them back.
//!
//! Every `*_create` returns `RhiResult`; the core logs failures and hands them
//! to its caller unchanged, without retrying. Destroy calls cannot fail.
//!
//! # Thread Safety
//!
//! Backends are `Send + Sync`. Recording calls on *distinct* command lists
//! may arrive concurrently from different threads; a single command list or
//! command pool is never used from two threads at once.

mod headless;

use std::fmt;
use std::ptr::NonNull;

use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::RhiResult;
use crate::pipeline::{PipelineInstanceState, PipelineRenderPassState};
use crate::render_pass::{ClearValue, RenderPassInfo};
use crate::types::{
    BufferCopy, BufferInfo, BufferTextureCopy, IndexType, PipelineLayoutInfo, QueueType, Rect2D,
    SamplerInfo, ShaderInfo, SwapchainInfo, TextureInfo, TextureLayout, TextureViewInfo, Viewport,
};

pub use headless::{HeadlessBackend, HeadlessStats};

macro_rules! native_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);

            impl $name {
                pub const NULL: Self = Self(0);

                #[inline]
                pub fn is_null(self) -> bool {
                    self.0 == 0
                }
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!(stringify!($name), "({:#x})"), self.0)
                }
            }
        )*
    };
}

native_handle! {
    /// Backend buffer object.
    NativeBuffer;
    /// Backend texture (image) object.
    NativeTexture;
    /// Backend texture view object.
    NativeTextureView;
    /// Backend sampler object.
    NativeSampler;
    /// Backend shader module.
    NativeShader;
    /// Backend pipeline layout, including its descriptor set layouts.
    NativePipelineLayout;
    /// Backend descriptor set.
    NativeDescriptorSet;
    /// Backend render pass.
    NativeRenderPass;
    /// Backend graphics pipeline.
    NativePipeline;
    /// Backend swapchain.
    NativeSwapchain;
    /// Backend command pool.
    NativeCommandPool;
    /// Backend command list (command buffer).
    NativeCommandList;
    /// Backend fence (GPU to CPU signal).
    NativeFence;
    /// Backend semaphore (GPU to GPU signal).
    NativeSemaphore;
}

/// Optional backend capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendFeature {
    /// Command pools can return reserved memory to the system.
    CommandPoolTrim,
}

/// Native window a swapchain presents to.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceTarget {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// A resource written into a descriptor set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    UniformBuffer {
        buffer: NativeBuffer,
        offset: u64,
        range: u64,
    },
    StorageBuffer {
        buffer: NativeBuffer,
        offset: u64,
        range: u64,
    },
    Sampler(NativeSampler),
    SampledTexture(NativeTextureView),
}

/// One binding of a descriptor set being allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resource: DescriptorResource,
}

/// Everything a backend needs to build a graphics pipeline, with handles
/// already resolved to native objects.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineCreate<'a> {
    pub render_pass: NativeRenderPass,
    pub render_pass_info: &'a RenderPassInfo,
    pub layout: NativePipelineLayout,
    pub vertex_shader: NativeShader,
    pub fragment_shader: Option<NativeShader>,
    pub render_pass_state: &'a PipelineRenderPassState,
    pub instance_state: &'a PipelineInstanceState,
}

/// Arguments of `cmd_begin_render_pass`.
#[derive(Clone, Copy, Debug)]
pub struct RenderPassBegin<'a> {
    pub render_pass: NativeRenderPass,
    pub color_views: &'a [NativeTextureView],
    pub depth_view: Option<NativeTextureView>,
    pub clear_values: &'a [ClearValue],
    pub render_area: Rect2D,
}

/// A layout transition of a whole texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureBarrier {
    pub texture: NativeTexture,
    pub old_layout: TextureLayout,
    pub new_layout: TextureLayout,
}

/// An image acquired from a swapchain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// Signaled once the image may be rendered to; graphics work touching
    /// the image must wait on it.
    pub ready: NativeSemaphore,
}

/// A batch of command lists for [`Backend::queue_execute`].
#[derive(Clone, Copy, Debug, Default)]
pub struct QueueSubmit<'a> {
    pub lists: &'a [NativeCommandList],
    pub wait_semaphores: &'a [NativeSemaphore],
    pub signal_semaphores: &'a [NativeSemaphore],
    pub fence: Option<NativeFence>,
}

/// Primitive operations a native graphics API exposes to the core.
pub trait Backend: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    fn support_feature(&self, feature: BackendFeature) -> bool;

    // ========================================================================
    // Resources
    // ========================================================================

    fn buffer_create(&self, info: &BufferInfo) -> RhiResult<NativeBuffer>;
    fn buffer_destroy(&self, buffer: NativeBuffer);

    /// Maps a CPU-visible buffer. The pointer covers the whole buffer and
    /// stays valid until `buffer_unmap`.
    fn buffer_map(&self, buffer: NativeBuffer) -> RhiResult<NonNull<u8>>;
    fn buffer_unmap(&self, buffer: NativeBuffer);

    /// Creates a texture in the undefined layout.
    fn texture_create(&self, info: &TextureInfo) -> RhiResult<NativeTexture>;
    fn texture_destroy(&self, texture: NativeTexture);

    fn texture_view_create(
        &self,
        texture: NativeTexture,
        info: &TextureViewInfo,
    ) -> RhiResult<NativeTextureView>;
    fn texture_view_destroy(&self, view: NativeTextureView);

    fn sampler_create(&self, info: &SamplerInfo) -> RhiResult<NativeSampler>;
    fn sampler_destroy(&self, sampler: NativeSampler);

    fn shader_create(&self, info: &ShaderInfo) -> RhiResult<NativeShader>;
    fn shader_destroy(&self, shader: NativeShader);

    fn pipeline_layout_create(&self, info: &PipelineLayoutInfo) -> RhiResult<NativePipelineLayout>;
    fn pipeline_layout_destroy(&self, layout: NativePipelineLayout);

    /// Allocates and writes a descriptor set for set index `set` of `layout`.
    fn descriptor_set_allocate(
        &self,
        layout: NativePipelineLayout,
        set: u32,
        writes: &[DescriptorWrite],
    ) -> RhiResult<NativeDescriptorSet>;
    fn descriptor_set_free(&self, set: NativeDescriptorSet);

    fn render_pass_create(&self, info: &RenderPassInfo) -> RhiResult<NativeRenderPass>;
    fn render_pass_destroy(&self, render_pass: NativeRenderPass);

    fn gfx_pipeline_create(&self, desc: &GraphicsPipelineCreate<'_>) -> RhiResult<NativePipeline>;
    fn gfx_pipeline_destroy(&self, pipeline: NativePipeline);

    // ========================================================================
    // Swapchain
    // ========================================================================

    fn swapchain_create(
        &self,
        info: &SwapchainInfo,
        target: &SurfaceTarget,
    ) -> RhiResult<NativeSwapchain>;
    fn swapchain_destroy(&self, swapchain: NativeSwapchain);

    /// Recreates the backbuffers at a new size. Previously returned
    /// backbuffer textures and views become invalid.
    fn swapchain_resize(&self, swapchain: NativeSwapchain, width: u32, height: u32)
    -> RhiResult<()>;

    fn swapchain_acquire_image(&self, swapchain: NativeSwapchain) -> RhiResult<AcquiredImage>;

    /// Presents the last acquired image once `wait_semaphores` are signaled.
    fn swapchain_present(
        &self,
        swapchain: NativeSwapchain,
        wait_semaphores: &[NativeSemaphore],
    ) -> RhiResult<()>;

    fn swapchain_backbuffer_textures(&self, swapchain: NativeSwapchain) -> Vec<NativeTexture>;
    fn swapchain_backbuffer_texture_views(&self, swapchain: NativeSwapchain)
    -> Vec<NativeTextureView>;
    fn swapchain_backbuffer_index(&self, swapchain: NativeSwapchain) -> u32;

    /// Actual backbuffer description (size and format may differ from the
    /// requested ones).
    fn swapchain_info(&self, swapchain: NativeSwapchain) -> SwapchainInfo;

    // ========================================================================
    // Command pools and lists
    // ========================================================================

    fn command_pool_create(&self, queue: QueueType) -> RhiResult<NativeCommandPool>;
    fn command_pool_destroy(&self, pool: NativeCommandPool);

    /// Resets every list allocated from `pool` to the initial state.
    fn command_pool_reset(&self, pool: NativeCommandPool) -> RhiResult<()>;

    /// Returns unused pool memory to the system. Only called when
    /// [`BackendFeature::CommandPoolTrim`] is supported.
    fn command_pool_trim(&self, pool: NativeCommandPool);

    fn command_list_allocate(&self, pool: NativeCommandPool) -> RhiResult<NativeCommandList>;
    fn command_list_free(&self, pool: NativeCommandPool, list: NativeCommandList);

    fn command_list_begin(&self, list: NativeCommandList) -> RhiResult<()>;
    fn command_list_end(&self, list: NativeCommandList) -> RhiResult<()>;

    // ========================================================================
    // Recording
    // ========================================================================

    fn cmd_begin_render_pass(&self, list: NativeCommandList, begin: &RenderPassBegin<'_>);
    fn cmd_end_render_pass(&self, list: NativeCommandList);

    fn cmd_bind_pipeline(&self, list: NativeCommandList, pipeline: NativePipeline);
    fn cmd_bind_descriptor_sets(
        &self,
        list: NativeCommandList,
        layout: NativePipelineLayout,
        first_set: u32,
        sets: &[NativeDescriptorSet],
    );
    fn cmd_bind_vertex_buffers(
        &self,
        list: NativeCommandList,
        first_binding: u32,
        buffers: &[NativeBuffer],
        offsets: &[u64],
    );
    fn cmd_bind_index_buffer(
        &self,
        list: NativeCommandList,
        buffer: NativeBuffer,
        offset: u64,
        index_type: IndexType,
    );

    fn cmd_set_viewport(&self, list: NativeCommandList, viewport: &Viewport);
    fn cmd_set_scissor(&self, list: NativeCommandList, scissor: &Rect2D);

    fn cmd_draw(
        &self,
        list: NativeCommandList,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        list: NativeCommandList,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn cmd_copy_buffer(
        &self,
        list: NativeCommandList,
        src: NativeBuffer,
        dst: NativeBuffer,
        regions: &[BufferCopy],
    );
    fn cmd_copy_buffer_to_texture(
        &self,
        list: NativeCommandList,
        src: NativeBuffer,
        dst: NativeTexture,
        dst_layout: TextureLayout,
        regions: &[BufferTextureCopy],
    );
    fn cmd_pipeline_barrier(&self, list: NativeCommandList, barriers: &[TextureBarrier]);

    // ========================================================================
    // Queues and synchronization
    // ========================================================================

    fn queue_execute(&self, queue: QueueType, submit: &QueueSubmit<'_>) -> RhiResult<()>;

    /// Blocks until every queue is idle.
    fn device_wait_idle(&self) -> RhiResult<()>;

    fn fence_create(&self, signaled: bool) -> RhiResult<NativeFence>;
    fn fence_destroy(&self, fence: NativeFence);

    /// Blocks until every fence in `fences` is signaled. Waits forever.
    fn fence_wait_for(&self, fences: &[NativeFence]) -> RhiResult<()>;
    fn fence_reset(&self, fences: &[NativeFence]) -> RhiResult<()>;

    fn semaphore_create(&self) -> RhiResult<NativeSemaphore>;
    fn semaphore_destroy(&self, semaphore: NativeSemaphore);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_handle_null() {
        assert!(NativeBuffer::NULL.is_null());
        assert!(!NativeBuffer(3).is_null());
        assert_eq!(format!("{:?}", NativeFence(255)), "NativeFence(0xff)");
    }

    #[test]
    fn test_backend_is_object_safe() {
        fn takes_dyn(_: Option<&dyn Backend>) {}
        takes_dyn(None);
    }
}
