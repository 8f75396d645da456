//! Command list recording.
//!
//! # Overview
//!
//! A [`CommandList`] records one unit of GPU work. State-setting calls
//! (pipeline state, descriptor bindings) only update what the list caches;
//! nothing reaches the backend until the next draw, which then:
//!
//! 1. looks up the graphics pipeline for the current render pass and pipeline
//!    state through the device cache, binding it only if it differs from the
//!    pipeline already bound;
//! 2. resolves every dirty descriptor set against the bound pipeline layout,
//!    allocates it and binds it;
//! 3. issues the draw.
//!
//! Lists are obtained from [`Device::allocate_cmd_list`] already recording,
//! handed back with [`Device::submit`], and reset by the device once the GPU
//! has finished with them.
//!
//! # Example
//!
//! ```no_run
//! # use forge_rhi::command_list::CommandList;
//! # use forge_rhi::device::Device;
//! # use forge_rhi::handle::*;
//! # use forge_rhi::pipeline::PipelineInstanceState;
//! # use forge_rhi::render_pass::{ColorAttachment, RenderPassBeginInfo};
//! # fn record(device: &Device, list: &mut CommandList, target: TextureViewHandle,
//! #           layout: PipelineLayoutHandle, vs: ShaderHandle, fs: ShaderHandle,
//! #           ubo: BufferHandle) -> forge_rhi::RhiResult<()> {
//! list.begin_render_pass(
//!     device,
//!     &RenderPassBeginInfo::new(640, 480).with_color_attachment(ColorAttachment::new(target)),
//! )?;
//! list.set_pipeline_instance_state(PipelineInstanceState::new(layout, vs).with_fragment_shader(fs));
//! list.bind_ubo(0, 0, ubo, 0, 64);
//! list.draw(device, 3, 1, 0, 0)?;
//! list.end_render_pass(device);
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! A list is recorded by one thread at a time. Distinct lists can be recorded
//! concurrently; every recording method takes `&Device`.

use std::thread::ThreadId;

use tracing::warn;

use crate::backend::{
    Backend, DescriptorResource, DescriptorWrite, NativeCommandList, NativeCommandPool,
    NativeDescriptorSet, NativePipeline, NativeRenderPass, RenderPassBegin, TextureBarrier,
};
use crate::descriptor::{BindingTable, BoundResource};
use crate::device::Device;
use crate::error::RhiResult;
use crate::handle::{BufferHandle, SamplerHandle, TextureHandle, TextureViewHandle};
use crate::pipeline::{GraphicsPipelineKey, PipelineInstanceState, PipelineRenderPassState};
use crate::render_pass::{AttachmentDesc, RenderPassBeginInfo, RenderPassInfo};
use crate::types::{
    BufferCopy, BufferTextureCopy, IndexType, QueueType, Rect2D, TextureLayout, Viewport,
};

/// The render pass a list is currently inside.
#[derive(Debug)]
struct ActiveRenderPass {
    info: RenderPassInfo,
    native: NativeRenderPass,
}

/// Records GPU work for one queue.
#[derive(Debug)]
pub struct CommandList {
    native: NativeCommandList,
    pool: NativeCommandPool,
    queue: QueueType,
    thread: ThreadId,
    recording: bool,

    render_pass_state: PipelineRenderPassState,
    instance_state: Option<PipelineInstanceState>,
    pipeline_dirty: bool,
    bound_pipeline: Option<NativePipeline>,
    render_pass: Option<ActiveRenderPass>,

    bindings: BindingTable,
    /// Sets allocated while recording, freed on reset.
    descriptor_sets: Vec<NativeDescriptorSet>,
}

impl CommandList {
    pub(crate) fn new(
        native: NativeCommandList,
        pool: NativeCommandPool,
        queue: QueueType,
        thread: ThreadId,
    ) -> Self {
        Self {
            native,
            pool,
            queue,
            thread,
            recording: false,
            render_pass_state: PipelineRenderPassState::default(),
            instance_state: None,
            pipeline_dirty: true,
            bound_pipeline: None,
            render_pass: None,
            bindings: BindingTable::new(),
            descriptor_sets: Vec::new(),
        }
    }

    #[inline]
    pub fn native(&self) -> NativeCommandList {
        self.native
    }

    /// Native pool the list was allocated from.
    #[inline]
    pub fn pool(&self) -> NativeCommandPool {
        self.pool
    }

    #[inline]
    pub fn queue_type(&self) -> QueueType {
        self.queue
    }

    /// Thread whose pool owns the list.
    #[inline]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Pipeline currently bound on the backend list.
    #[inline]
    pub fn bound_pipeline(&self) -> Option<NativePipeline> {
        self.bound_pipeline
    }

    pub(crate) fn begin(&mut self, backend: &dyn Backend) -> RhiResult<()> {
        backend.command_list_begin(self.native)?;
        self.recording = true;
        Ok(())
    }

    pub(crate) fn end(&mut self, backend: &dyn Backend) -> RhiResult<()> {
        assert!(
            self.render_pass.is_none(),
            "command list submitted inside a render pass"
        );
        self.recording = false;
        backend.command_list_end(self.native)
    }

    /// Forgets every cached binding and frees the descriptor sets allocated
    /// while recording. The native list itself is reset with its pool.
    pub(crate) fn reset(&mut self, backend: &dyn Backend) {
        for set in self.descriptor_sets.drain(..) {
            backend.descriptor_set_free(set);
        }
        self.recording = false;
        self.render_pass_state = PipelineRenderPassState::default();
        self.instance_state = None;
        self.pipeline_dirty = true;
        self.bound_pipeline = None;
        self.render_pass = None;
        self.bindings.reset();
    }

    // ========================================================================
    // Cached state
    // ========================================================================

    /// Sets the pass-level pipeline state used by the following draws.
    pub fn set_pipeline_render_pass_state(&mut self, state: PipelineRenderPassState) {
        if self.render_pass_state != state {
            self.render_pass_state = state;
            self.pipeline_dirty = true;
        }
    }

    /// Sets the draw-level pipeline state used by the following draws.
    ///
    /// Switching to another pipeline layout marks every descriptor set dirty.
    pub fn set_pipeline_instance_state(&mut self, state: PipelineInstanceState) {
        if self.instance_state.as_ref() == Some(&state) {
            return;
        }
        if self.instance_state.as_ref().map(|s| s.layout) != Some(state.layout) {
            self.bindings.mark_all_dirty();
        }
        self.instance_state = Some(state);
        self.pipeline_dirty = true;
    }

    /// Binds `range` bytes of `buffer` starting at `offset` as the uniform
    /// buffer at `set`/`binding`.
    ///
    /// Nothing is recorded yet: the set is marked dirty and a descriptor set
    /// is written and bound by the next draw or dispatch.
    pub fn bind_ubo(&mut self, set: u32, binding: u32, buffer: BufferHandle, offset: u64, range: u64) {
        self.bindings.bind(
            set,
            binding,
            BoundResource::UniformBuffer {
                buffer,
                offset,
                range,
            },
        );
    }

    /// Binds a storage buffer range. Resolved lazily, like
    /// [`bind_ubo`](Self::bind_ubo).
    pub fn bind_ssbo(&mut self, set: u32, binding: u32, buffer: BufferHandle, offset: u64, range: u64) {
        self.bindings.bind(
            set,
            binding,
            BoundResource::StorageBuffer {
                buffer,
                offset,
                range,
            },
        );
    }

    /// Binds a sampler at `set`/`binding`.
    pub fn bind_sampler(&mut self, set: u32, binding: u32, sampler: SamplerHandle) {
        self.bindings.bind(set, binding, BoundResource::Sampler(sampler));
    }

    /// Binds a texture view for sampling at `set`/`binding`. The texture is
    /// expected to be in `ShaderReadOnly` layout when the draw executes.
    pub fn bind_texture(&mut self, set: u32, binding: u32, view: TextureViewHandle) {
        self.bindings.bind(set, binding, BoundResource::Texture(view));
    }

    // ========================================================================
    // Render passes
    // ========================================================================

    /// Begins a render pass over the given attachments.
    ///
    /// Attachment formats and sample counts come from the views' textures;
    /// the native render pass is shared with every other pass of the same
    /// shape.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the render pass could not be created.
    ///
    /// # Panics
    ///
    /// Panics if a render pass is already begun or an attachment handle is
    /// stale.
    pub fn begin_render_pass(&mut self, device: &Device, begin: &RenderPassBeginInfo) -> RhiResult<()> {
        self.assert_recording();
        assert!(self.render_pass.is_none(), "render pass already begun");

        let mut info = RenderPassInfo::default();
        let mut color_views = Vec::with_capacity(begin.color_attachments.len());
        for attachment in &begin.color_attachments {
            let view = device.texture_view(attachment.view);
            let texture = device.texture(view.texture());
            color_views.push(view.native());
            info.color_attachments.push(AttachmentDesc {
                format: view.info().format,
                samples: texture.info().samples,
                load_op: attachment.load_op,
                store_op: attachment.store_op,
                layout: attachment.layout,
            });
        }
        let mut depth_view = None;
        if let Some(attachment) = &begin.depth_attachment {
            let view = device.texture_view(attachment.view);
            let texture = device.texture(view.texture());
            depth_view = Some(view.native());
            info.depth_attachment = Some(AttachmentDesc {
                format: view.info().format,
                samples: texture.info().samples,
                load_op: attachment.load_op,
                store_op: attachment.store_op,
                layout: attachment.layout,
            });
        }

        let native = device.create_or_find_render_pass(&info)?;
        let clear_values = begin.clear_values();
        device.backend().cmd_begin_render_pass(
            self.native,
            &RenderPassBegin {
                render_pass: native,
                color_views: &color_views,
                depth_view,
                clear_values: &clear_values,
                render_area: begin.render_area,
            },
        );
        self.render_pass = Some(ActiveRenderPass { info, native });
        self.pipeline_dirty = true;
        Ok(())
    }

    /// Ends the current render pass.
    ///
    /// # Panics
    ///
    /// Panics if no render pass is begun.
    pub fn end_render_pass(&mut self, device: &Device) {
        self.assert_recording();
        assert!(self.render_pass.take().is_some(), "no render pass to end");
        device.backend().cmd_end_render_pass(self.native);
    }

    // ========================================================================
    // Draws
    // ========================================================================

    /// Records a non-indexed draw after resolving pipeline and descriptors.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the pipeline or a descriptor set could
    /// not be created.
    ///
    /// # Panics
    ///
    /// Panics outside a render pass or without a pipeline instance state.
    pub fn draw(
        &mut self,
        device: &Device,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.resolve_state(device)?;
        device.backend().cmd_draw(
            self.native,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
        Ok(())
    }

    /// Records an indexed draw after resolving pipeline and descriptors.
    ///
    /// # Errors
    ///
    /// See [`draw`](Self::draw).
    pub fn draw_indexed(
        &mut self,
        device: &Device,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> RhiResult<()> {
        self.resolve_state(device)?;
        device.backend().cmd_draw_indexed(
            self.native,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        Ok(())
    }

    fn resolve_state(&mut self, device: &Device) -> RhiResult<()> {
        self.assert_recording();
        let Some(render_pass) = &self.render_pass else {
            panic!("draw recorded outside a render pass");
        };
        let Some(instance_state) = &self.instance_state else {
            panic!("draw recorded without a pipeline instance state");
        };
        let layout = device.pipeline_layout(instance_state.layout);
        let backend = device.backend();

        if self.pipeline_dirty {
            let key = GraphicsPipelineKey {
                render_pass: render_pass.info.clone(),
                render_pass_state: self.render_pass_state.clone(),
                instance_state: instance_state.clone(),
            };
            let pipeline = device.create_or_find_gfx_pipeline(&key)?;
            if self.bound_pipeline != Some(pipeline) {
                backend.cmd_bind_pipeline(self.native, pipeline);
                self.bound_pipeline = Some(pipeline);
            }
            self.pipeline_dirty = false;
        }

        let dirty: Vec<u32> = self.bindings.dirty_sets().collect();
        for set in dirty {
            let resolved = self.bindings.resolve_set(set, layout.info());
            if !resolved.is_empty() {
                let writes: Vec<DescriptorWrite> = resolved
                    .into_iter()
                    .map(|(binding, resource)| DescriptorWrite {
                        binding,
                        resource: native_resource(device, resource),
                    })
                    .collect();
                let descriptor_set = backend.descriptor_set_allocate(layout.native(), set, &writes)?;
                self.descriptor_sets.push(descriptor_set);
                backend.cmd_bind_descriptor_sets(self.native, layout.native(), set, &[descriptor_set]);
            }
            self.bindings.clean(set);
        }
        Ok(())
    }

    // ========================================================================
    // Fixed-function state
    // ========================================================================

    /// Binds vertex buffers to consecutive bindings starting at
    /// `first_binding`.
    ///
    /// # Panics
    ///
    /// Panics if the list is not recording, or if `buffers` and `offsets`
    /// differ in length.
    pub fn bind_vertex_buffers(
        &mut self,
        device: &Device,
        first_binding: u32,
        buffers: &[BufferHandle],
        offsets: &[u64],
    ) {
        self.assert_recording();
        assert_eq!(buffers.len(), offsets.len(), "one offset per vertex buffer");
        let natives: Vec<_> = buffers.iter().map(|&b| device.buffer(b).native()).collect();
        device
            .backend()
            .cmd_bind_vertex_buffers(self.native, first_binding, &natives, offsets);
    }

    /// Binds the index buffer used by [`draw_indexed`](Self::draw_indexed).
    pub fn bind_index_buffer(&mut self, device: &Device, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        self.assert_recording();
        let native = device.buffer(buffer).native();
        device
            .backend()
            .cmd_bind_index_buffer(self.native, native, offset, index_type);
    }

    /// Overrides the dynamic viewport. Beginning a render pass already sets
    /// viewport and scissor to the full render area.
    pub fn set_viewport(&mut self, device: &Device, viewport: &Viewport) {
        self.assert_recording();
        device.backend().cmd_set_viewport(self.native, viewport);
    }

    /// Sets the dynamic scissor rectangle.
    pub fn set_scissor(&mut self, device: &Device, scissor: &Rect2D) {
        self.assert_recording();
        device.backend().cmd_set_scissor(self.native, scissor);
    }

    // ========================================================================
    // Transfers and barriers
    // ========================================================================

    /// Copies byte ranges between two buffers.
    ///
    /// `src` needs `TRANSFER_SRC` usage and `dst` needs `TRANSFER_DST`.
    /// Synchronization with earlier or later access is up to the caller.
    pub fn copy_buffer(&mut self, device: &Device, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopy]) {
        self.assert_recording();
        let (src, dst) = (device.buffer(src).native(), device.buffer(dst).native());
        device.backend().cmd_copy_buffer(self.native, src, dst, regions);
    }

    /// Copies tightly packed texel data from a buffer into a texture that is
    /// in `dst_layout` (transfer destination or general).
    pub fn copy_buffer_to_texture(
        &mut self,
        device: &Device,
        src: BufferHandle,
        dst: TextureHandle,
        dst_layout: TextureLayout,
        regions: &[BufferTextureCopy],
    ) {
        self.assert_recording();
        let (src, dst) = (device.buffer(src).native(), device.texture(dst).native());
        device
            .backend()
            .cmd_copy_buffer_to_texture(self.native, src, dst, dst_layout, regions);
    }

    /// Transitions every mip and layer of `texture` from `old_layout` to
    /// `new_layout`. `Undefined` as the old layout discards the contents.
    pub fn texture_barrier(
        &mut self,
        device: &Device,
        texture: TextureHandle,
        old_layout: TextureLayout,
        new_layout: TextureLayout,
    ) {
        self.assert_recording();
        let native = device.texture(texture).native();
        device.backend().cmd_pipeline_barrier(
            self.native,
            &[TextureBarrier {
                texture: native,
                old_layout,
                new_layout,
            }],
        );
    }

    #[inline]
    #[track_caller]
    fn assert_recording(&self) {
        assert!(self.recording, "command list {:?} is not recording", self.native);
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        if !self.descriptor_sets.is_empty() {
            warn!(
                "Command list {:?} dropped with {} descriptor sets still allocated",
                self.native,
                self.descriptor_sets.len()
            );
        }
    }
}

fn native_resource(device: &Device, resource: BoundResource) -> DescriptorResource {
    match resource {
        BoundResource::UniformBuffer {
            buffer,
            offset,
            range,
        } => DescriptorResource::UniformBuffer {
            buffer: device.buffer(buffer).native(),
            offset,
            range,
        },
        BoundResource::StorageBuffer {
            buffer,
            offset,
            range,
        } => DescriptorResource::StorageBuffer {
            buffer: device.buffer(buffer).native(),
            offset,
            range,
        },
        BoundResource::Sampler(sampler) => DescriptorResource::Sampler(device.sampler(sampler).native()),
        BoundResource::Texture(view) => {
            DescriptorResource::SampledTexture(device.texture_view(view).native())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_list_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CommandList>();
    }

    #[test]
    fn test_new_list_starts_idle() {
        let list = CommandList::new(
            NativeCommandList(1),
            NativeCommandPool(2),
            QueueType::Transfer,
            std::thread::current().id(),
        );
        assert!(!list.is_recording());
        assert_eq!(list.queue_type(), QueueType::Transfer);
        assert_eq!(list.bound_pipeline(), None);
    }

    #[test]
    fn test_layout_change_dirties_bindings() {
        use crate::handle::{PipelineLayoutHandle, ShaderHandle, TypedHandle};

        let mut list = CommandList::new(
            NativeCommandList(1),
            NativeCommandPool(2),
            QueueType::Graphics,
            std::thread::current().id(),
        );
        let vs = ShaderHandle::from_index(0);
        list.set_pipeline_instance_state(PipelineInstanceState::new(PipelineLayoutHandle::from_index(0), vs));
        list.bindings.clean(0);
        list.bindings.clean(1);
        list.bindings.clean(2);
        list.bindings.clean(3);
        assert!(!list.bindings.has_dirty_sets());

        list.set_pipeline_instance_state(PipelineInstanceState::new(PipelineLayoutHandle::from_index(1), vs));
        assert!(list.bindings.has_dirty_sets());
        assert!(list.pipeline_dirty);
    }
}
