//! The device: owner of every GPU resource, the frame ring and the caches.
//!
//! # Overview
//!
//! [`Device`] is the single entry point engine code uses to create, use and
//! destroy GPU objects. It is an explicit context object holding an
//! `Arc<dyn Backend>`; there is no global instance.
//!
//! - Resources live in seven typed arenas and are named by handles.
//! - `destroy_*` never releases immediately: the handle is queued on the
//!   current frame and released when the ring comes back to that frame and
//!   its fences have been observed, so work recorded in the frame of the
//!   destroy call may still use the resource.
//! - Render passes and graphics pipelines are deduplicated by structural
//!   description and evicted after a number of idle frames.
//! - Command lists come from a per-thread pool of the current frame.
//!
//! # Frame Lifecycle
//!
//! ```text
//! new_frame ─▶ record / submit ─▶ end_frame ─▶ (present) ─▶ new_frame ...
//! ```
//!
//! The first [`new_frame`](Device::new_frame) only marks the device warm.
//! Every later call moves to the next ring slot, waits for its fences,
//! releases the handles it expired, recycles its command lists and ticks the
//! caches. [`wait_gpu_idle`](Device::wait_gpu_idle) flushes mid-cycle.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use forge_rhi::backend::HeadlessBackend;
//! use forge_rhi::types::{BufferInfo, BufferUsage, MemoryUsage};
//! use forge_rhi::{Device, DeviceConfig};
//!
//! let backend = Arc::new(HeadlessBackend::new());
//! let mut device = Device::new(backend, DeviceConfig::default())?;
//! device.new_frame()?;
//!
//! let info = BufferInfo::new(256, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu);
//! let buffer = device.create_buffer(&info, Some(&[0xAB; 256]))?;
//! device.destroy_buffer(buffer);
//!
//! device.end_frame()?;
//! device.destroy();
//! # Ok::<(), forge_rhi::RhiError>(())
//! ```
//!
//! # Thread Safety
//!
//! Operations that mutate the device take `&mut self` and belong to the
//! render thread. Command list allocation, recording and cache lookups take
//! `&self`, so worker threads can record concurrently while the render
//! thread waits for them.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::{
    Backend, GraphicsPipelineCreate, NativeBuffer, NativePipeline, NativeRenderPass,
    SurfaceTarget,
};
use crate::cache::ObjectCache;
use crate::command_list::CommandList;
use crate::config::DeviceConfig;
use crate::error::{RhiError, RhiResult};
use crate::frame::{Frame, RELEASE_ORDER};
use crate::handle::{
    BufferHandle, DeviceResourceHandle, PipelineLayoutHandle, ResourceHandle, ResourceType,
    SamplerHandle, ShaderHandle, SwapchainHandle, TextureHandle, TextureViewHandle, TypedHandle,
};
use crate::pipeline::GraphicsPipelineKey;
use crate::render_pass::RenderPassInfo;
use crate::resource::{
    ArenaOf, Buffer, PipelineLayout, Resource, Resources, Sampler, Shader, Swapchain, Texture,
    TextureView,
};
use crate::types::{
    BufferCopy, BufferInfo, BufferTextureCopy, Format, PipelineLayoutInfo, QueueType, SamplerInfo,
    ShaderInfo, SwapchainInfo, TextureInfo, TextureLayout, TextureUsage, TextureViewInfo,
};

/// Queue submission order at the end of a frame. Uploads recorded on the
/// transfer queue reach the GPU before the draws that read them.
const SUBMIT_ORDER: [QueueType; QueueType::COUNT] =
    [QueueType::Transfer, QueueType::Compute, QueueType::Graphics];

/// Owner of GPU resources, frames in flight and object caches.
pub struct Device {
    backend: Arc<dyn Backend>,
    config: DeviceConfig,
    resources: Resources,
    frames: Vec<Frame>,
    frame_index: usize,
    warm: bool,
    render_passes: Mutex<ObjectCache<RenderPassInfo, NativeRenderPass>>,
    pipelines: Mutex<ObjectCache<GraphicsPipelineKey, NativePipeline>>,
    destroyed: bool,
}

impl Device {
    /// Creates a device over `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Config`] if `config` is invalid, or the backend
    /// error if a frame's synchronization primitives could not be created.
    pub fn new(backend: Arc<dyn Backend>, config: DeviceConfig) -> RhiResult<Self> {
        config.validate()?;

        let mut frames = Vec::with_capacity(config.frames_in_flight as usize);
        for _ in 0..config.frames_in_flight {
            match Frame::new(&*backend) {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    error!("Failed to create frame resources: {}", err);
                    for mut frame in frames {
                        frame.destroy(&*backend);
                    }
                    return Err(err);
                }
            }
        }

        let render_pass_backend = backend.clone();
        let render_passes = ObjectCache::new(config.cache_max_idle_frames, move |render_pass| {
            debug!("Evicting render pass {:?}", render_pass);
            render_pass_backend.render_pass_destroy(render_pass);
        });
        let pipeline_backend = backend.clone();
        let pipelines = ObjectCache::new(config.cache_max_idle_frames, move |pipeline| {
            debug!("Evicting graphics pipeline {:?}", pipeline);
            pipeline_backend.gfx_pipeline_destroy(pipeline);
        });

        info!(
            "Device created on the {} backend ({} frames in flight)",
            backend.name(),
            config.frames_in_flight
        );

        Ok(Self {
            backend,
            config,
            resources: Resources::default(),
            frames,
            frame_index: 0,
            warm: false,
            render_passes: Mutex::new(render_passes),
            pipelines: Mutex::new(pipelines),
            destroyed: false,
        })
    }

    // ========================================================================
    // Resource creation
    // ========================================================================

    /// Creates a buffer, optionally filled with `initial_data`.
    ///
    /// CPU-visible buffers are written directly through a mapping; other
    /// buffers are filled by a staging copy recorded on the transfer queue of
    /// the current frame.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] if `initial_data` is larger than
    /// the buffer, or the backend error if creation or the upload failed.
    pub fn create_buffer(&mut self, info: &BufferInfo, initial_data: Option<&[u8]>) -> RhiResult<BufferHandle> {
        let data = initial_data.filter(|data| !data.is_empty());
        if let Some(data) = data
            && data.len() as u64 > info.size
        {
            return Err(RhiError::InvalidArgument(format!(
                "{} bytes of initial data for a buffer of {} bytes",
                data.len(),
                info.size
            )));
        }

        let native = self
            .backend
            .buffer_create(info)
            .inspect_err(|err| error!("Failed to create buffer of {} bytes: {}", info.size, err))?;
        let handle = self.resources.buffers.insert(Buffer {
            info: info.clone(),
            native,
        });
        debug!("Buffer {:?} created ({} bytes, {:?})", handle, info.size, info.memory);

        if let Some(data) = data
            && let Err(err) = self.upload_buffer(handle, data)
        {
            error!("Failed to upload initial data of {:?}: {}", handle, err);
            self.destroy_buffer(handle);
            return Err(err);
        }
        Ok(handle)
    }

    fn upload_buffer(&mut self, handle: BufferHandle, data: &[u8]) -> RhiResult<()> {
        if self.buffer(handle).info().memory.is_cpu_visible() {
            return self.write_buffer(handle, 0, data);
        }

        let staging = self.create_staging(data)?;
        let result = match self.allocate_cmd_list(QueueType::Transfer) {
            Ok(mut list) => {
                list.copy_buffer(
                    self,
                    staging,
                    handle,
                    &[BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: data.len() as u64,
                    }],
                );
                self.submit(list)
            }
            Err(err) => Err(err),
        };
        self.destroy_buffer(staging);
        result
    }

    fn create_staging(&mut self, data: &[u8]) -> RhiResult<BufferHandle> {
        let staging = self.create_buffer(&BufferInfo::staging(data.len() as u64), None)?;
        if let Err(err) = self.write_buffer(staging, 0, data) {
            self.destroy_buffer(staging);
            return Err(err);
        }
        Ok(staging)
    }

    /// Creates a texture, optionally filled with `initial_data` (tightly
    /// packed mip 0 of every layer).
    ///
    /// Initial data always goes through a staging buffer: the texture is
    /// moved to the transfer destination layout, copied into, then moved to
    /// `info.layout`. Without data, a non-`Undefined` `info.layout` is
    /// reached with a single barrier.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] if the data size does not match
    /// [`TextureInfo::base_level_size`], or the backend error if creation or
    /// the upload failed.
    pub fn create_texture(&mut self, info: &TextureInfo, initial_data: Option<&[u8]>) -> RhiResult<TextureHandle> {
        let data = initial_data.filter(|data| !data.is_empty());
        if let Some(data) = data
            && data.len() as u64 != info.base_level_size()
        {
            return Err(RhiError::InvalidArgument(format!(
                "{} bytes of initial data for a {}x{} {:?} texture ({} expected)",
                data.len(),
                info.width,
                info.height,
                info.format,
                info.base_level_size()
            )));
        }

        let native = self.backend.texture_create(info).inspect_err(|err| {
            error!("Failed to create {}x{} {:?} texture: {}", info.width, info.height, info.format, err)
        })?;
        let handle = self.resources.textures.insert(Texture {
            info: info.clone(),
            native,
            swapchain: None,
        });
        debug!(
            "Texture {:?} created ({}x{} {:?})",
            handle, info.width, info.height, info.format
        );

        if let Err(err) = self.initialize_texture(handle, data) {
            error!("Failed to initialize {:?}: {}", handle, err);
            self.destroy_texture(handle);
            return Err(err);
        }
        Ok(handle)
    }

    fn initialize_texture(&mut self, handle: TextureHandle, data: Option<&[u8]>) -> RhiResult<()> {
        let info = self.texture(handle).info().clone();
        match data {
            Some(data) => {
                let staging = self.create_staging(data)?;
                let result = match self.allocate_cmd_list(QueueType::Transfer) {
                    Ok(mut list) => {
                        list.texture_barrier(self, handle, TextureLayout::Undefined, TextureLayout::TransferDst);
                        list.copy_buffer_to_texture(
                            self,
                            staging,
                            handle,
                            TextureLayout::TransferDst,
                            &[BufferTextureCopy::whole(&info)],
                        );
                        if !matches!(info.layout, TextureLayout::Undefined | TextureLayout::TransferDst) {
                            list.texture_barrier(self, handle, TextureLayout::TransferDst, info.layout);
                        }
                        self.submit(list)
                    }
                    Err(err) => Err(err),
                };
                self.destroy_buffer(staging);
                result
            }
            None if info.layout != TextureLayout::Undefined => {
                let mut list = self.allocate_cmd_list(QueueType::Transfer)?;
                list.texture_barrier(self, handle, TextureLayout::Undefined, info.layout);
                self.submit(list)
            }
            None => Ok(()),
        }
    }

    /// Creates a view of a texture. An `Undefined` format in `info` means the
    /// texture's own format.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the view could not be created.
    ///
    /// # Panics
    ///
    /// Panics if `info.texture` is not a live texture.
    pub fn create_texture_view(&mut self, info: &TextureViewInfo) -> RhiResult<TextureViewHandle> {
        let texture = self.texture(info.texture);
        let mut info = info.clone();
        if info.format == Format::Undefined {
            info.format = texture.info().format;
        }
        let native = self
            .backend
            .texture_view_create(texture.native(), &info)
            .inspect_err(|err| error!("Failed to create view of {:?}: {}", info.texture, err))?;
        let handle = self.resources.texture_views.insert(TextureView {
            info,
            native,
            swapchain: None,
        });
        debug!("Texture view {:?} created", handle);
        Ok(handle)
    }

    /// # Errors
    ///
    /// Returns the backend error if the sampler could not be created.
    pub fn create_sampler(&mut self, info: &SamplerInfo) -> RhiResult<SamplerHandle> {
        let native = self
            .backend
            .sampler_create(info)
            .inspect_err(|err| error!("Failed to create sampler: {}", err))?;
        let handle = self.resources.samplers.insert(Sampler {
            info: info.clone(),
            native,
        });
        debug!("Sampler {:?} created", handle);
        Ok(handle)
    }

    /// # Errors
    ///
    /// Returns the backend error (usually [`RhiError::ShaderError`]) if the
    /// bytecode was rejected.
    pub fn create_shader(&mut self, info: &ShaderInfo) -> RhiResult<ShaderHandle> {
        let native = self
            .backend
            .shader_create(info)
            .inspect_err(|err| error!("Failed to create {:?} shader: {}", info.stage, err))?;
        let handle = self.resources.shaders.insert(Shader {
            stage: info.stage,
            entry_point: info.entry_point.clone(),
            native,
        });
        debug!("{:?} shader {:?} created ({} bytes)", info.stage, handle, info.code.len());
        Ok(handle)
    }

    /// # Errors
    ///
    /// Returns the backend error if the layout could not be created.
    pub fn create_pipeline_layout(&mut self, info: &PipelineLayoutInfo) -> RhiResult<PipelineLayoutHandle> {
        let native = self
            .backend
            .pipeline_layout_create(info)
            .inspect_err(|err| error!("Failed to create pipeline layout: {}", err))?;
        let handle = self.resources.pipeline_layouts.insert(PipelineLayout {
            info: info.clone(),
            native,
        });
        debug!("Pipeline layout {:?} created ({} sets)", handle, info.sets.len());
        Ok(handle)
    }

    /// Creates a swapchain presenting to `target` and registers its
    /// backbuffers as texture and texture view entries.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the swapchain could not be created.
    pub fn create_swapchain(&mut self, info: &SwapchainInfo, target: &SurfaceTarget) -> RhiResult<SwapchainHandle> {
        let native = self
            .backend
            .swapchain_create(info, target)
            .inspect_err(|err| error!("Failed to create swapchain: {}", err))?;
        let actual = self.backend.swapchain_info(native);
        let handle = self.resources.swapchains.insert(Swapchain {
            info: actual.clone(),
            native,
            textures: Vec::new(),
            views: Vec::new(),
            current: 0,
        });
        self.register_backbuffers(handle);
        info!(
            "Swapchain {:?} created ({}x{}, {:?}, {} images)",
            handle, actual.width, actual.height, actual.format, actual.image_count
        );
        Ok(handle)
    }

    fn register_backbuffers(&mut self, handle: SwapchainHandle) {
        let native = self.swapchain(handle).native();
        let info = self.backend.swapchain_info(native);
        let texture_info = TextureInfo::new_2d(
            info.format,
            info.width,
            info.height,
            TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_DST,
        );

        let natives = self
            .backend
            .swapchain_backbuffer_textures(native)
            .into_iter()
            .zip(self.backend.swapchain_backbuffer_texture_views(native));
        let mut textures = Vec::new();
        let mut views = Vec::new();
        for (texture, view) in natives {
            let texture_handle = self.resources.textures.insert(Texture {
                info: texture_info.clone(),
                native: texture,
                swapchain: Some(handle),
            });
            views.push(self.resources.texture_views.insert(TextureView {
                info: TextureViewInfo::new(texture_handle, info.format),
                native: view,
                swapchain: Some(handle),
            }));
            textures.push(texture_handle);
        }

        let swapchain = self.resources.swapchains.get_mut(handle);
        swapchain.info = info;
        swapchain.textures = textures;
        swapchain.views = views;
        swapchain.current = 0;
    }

    fn unregister_backbuffers(&mut self, textures: Vec<TextureHandle>, views: Vec<TextureViewHandle>) {
        for view in views {
            self.resources.texture_views.remove(view).release(&*self.backend);
        }
        for texture in textures {
            self.resources.textures.remove(texture).release(&*self.backend);
        }
    }

    // ========================================================================
    // Deferred destruction
    // ========================================================================

    /// Queues `handle` for release once the GPU is done with this frame.
    pub fn destroy_buffer(&mut self, handle: BufferHandle) {
        self.expire::<Buffer>(handle);
    }

    /// # Panics
    ///
    /// Panics if `handle` is a swapchain backbuffer.
    pub fn destroy_texture(&mut self, handle: TextureHandle) {
        assert!(
            self.texture(handle).swapchain().is_none(),
            "{handle:?} is a backbuffer owned by its swapchain"
        );
        self.expire::<Texture>(handle);
    }

    /// # Panics
    ///
    /// Panics if `handle` is a swapchain backbuffer view.
    pub fn destroy_texture_view(&mut self, handle: TextureViewHandle) {
        assert!(
            self.texture_view(handle).swapchain().is_none(),
            "{handle:?} is a backbuffer view owned by its swapchain"
        );
        self.expire::<TextureView>(handle);
    }

    pub fn destroy_sampler(&mut self, handle: SamplerHandle) {
        self.expire::<Sampler>(handle);
    }

    pub fn destroy_shader(&mut self, handle: ShaderHandle) {
        self.expire::<Shader>(handle);
    }

    pub fn destroy_pipeline_layout(&mut self, handle: PipelineLayoutHandle) {
        self.expire::<PipelineLayout>(handle);
    }

    /// Queues the swapchain and its backbuffers for release.
    pub fn destroy_swapchain(&mut self, handle: SwapchainHandle) {
        self.expire::<Swapchain>(handle);
    }

    #[track_caller]
    fn expire<R: Resource>(&mut self, handle: R::Handle)
    where
        Resources: ArenaOf<R>,
    {
        // Resolving asserts the handle is live.
        self.entry::<R>(handle);
        self.frames[self.frame_index].expire(handle.raw());
    }

    /// Removes an entry from its arena and releases its native object.
    fn release(&mut self, raw: DeviceResourceHandle) {
        let backend = self.backend.clone();
        match ResourceHandle::classify(raw) {
            Some(ResourceHandle::Buffer(h)) => self.resources.buffers.remove(h).release(&*backend),
            Some(ResourceHandle::Texture(h)) => self.resources.textures.remove(h).release(&*backend),
            Some(ResourceHandle::TextureView(h)) => {
                self.resources.texture_views.remove(h).release(&*backend)
            }
            Some(ResourceHandle::Sampler(h)) => self.resources.samplers.remove(h).release(&*backend),
            Some(ResourceHandle::Shader(h)) => {
                let shader = self.resources.shaders.remove(h);
                // A later shader may reuse the handle.
                let evicted = self.pipelines.lock().evict_where(|key| {
                    key.instance_state.vertex_shader == h || key.instance_state.fragment_shader == Some(h)
                });
                if evicted > 0 {
                    debug!("Evicted {} pipelines using {:?}", evicted, h);
                }
                shader.release(&*backend);
            }
            Some(ResourceHandle::PipelineLayout(h)) => {
                let layout = self.resources.pipeline_layouts.remove(h);
                let evicted = self.pipelines.lock().evict_where(|key| key.instance_state.layout == h);
                if evicted > 0 {
                    debug!("Evicted {} pipelines using {:?}", evicted, h);
                }
                layout.release(&*backend);
            }
            Some(ResourceHandle::Swapchain(h)) => {
                let mut swapchain = self.resources.swapchains.remove(h);
                let textures = std::mem::take(&mut swapchain.textures);
                let views = std::mem::take(&mut swapchain.views);
                self.unregister_backbuffers(textures, views);
                swapchain.release(&*backend);
                info!("Swapchain {:?} destroyed", h);
                return;
            }
            None => panic!("release of null handle {raw:?}"),
        }
        debug!("Released {:?}", raw);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[track_caller]
    fn entry<R: Resource>(&self, handle: R::Handle) -> &R
    where
        Resources: ArenaOf<R>,
    {
        ArenaOf::<R>::arena(&self.resources).get(handle)
    }

    /// Resolves a buffer handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle is null, stale, or names another resource type.
    /// The same holds for every accessor below.
    #[track_caller]
    pub fn buffer(&self, handle: BufferHandle) -> &Buffer {
        self.entry::<Buffer>(handle)
    }

    #[track_caller]
    pub fn texture(&self, handle: TextureHandle) -> &Texture {
        self.entry::<Texture>(handle)
    }

    #[track_caller]
    pub fn texture_view(&self, handle: TextureViewHandle) -> &TextureView {
        self.entry::<TextureView>(handle)
    }

    #[track_caller]
    pub fn sampler(&self, handle: SamplerHandle) -> &Sampler {
        self.entry::<Sampler>(handle)
    }

    #[track_caller]
    pub fn shader(&self, handle: ShaderHandle) -> &Shader {
        self.entry::<Shader>(handle)
    }

    #[track_caller]
    pub fn pipeline_layout(&self, handle: PipelineLayoutHandle) -> &PipelineLayout {
        self.entry::<PipelineLayout>(handle)
    }

    #[track_caller]
    pub fn swapchain(&self, handle: SwapchainHandle) -> &Swapchain {
        self.entry::<Swapchain>(handle)
    }

    /// Whether `handle` names a live entry. Never panics.
    pub fn is_valid(&self, handle: impl Into<DeviceResourceHandle>) -> bool {
        match ResourceHandle::classify(handle.into()) {
            Some(ResourceHandle::Buffer(h)) => self.resources.buffers.is_valid(h),
            Some(ResourceHandle::Texture(h)) => self.resources.textures.is_valid(h),
            Some(ResourceHandle::TextureView(h)) => self.resources.texture_views.is_valid(h),
            Some(ResourceHandle::Swapchain(h)) => self.resources.swapchains.is_valid(h),
            Some(ResourceHandle::Sampler(h)) => self.resources.samplers.is_valid(h),
            Some(ResourceHandle::Shader(h)) => self.resources.shaders.is_valid(h),
            Some(ResourceHandle::PipelineLayout(h)) => self.resources.pipeline_layouts.is_valid(h),
            None => false,
        }
    }

    // ========================================================================
    // Buffer mapping
    // ========================================================================

    /// Maps a CPU-visible buffer for the lifetime of the returned guard.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] if the buffer is not CPU
    /// visible, or the backend error if mapping failed.
    pub fn map_buffer(&mut self, handle: BufferHandle) -> RhiResult<BufferMapping<'_>> {
        let buffer = self.buffer(handle);
        if !buffer.info().memory.is_cpu_visible() {
            return Err(RhiError::InvalidArgument(format!(
                "{handle:?} lives in {:?} memory and cannot be mapped",
                buffer.info().memory
            )));
        }
        let native = buffer.native();
        let len = buffer.size() as usize;
        let ptr = self.backend.buffer_map(native)?;
        Ok(BufferMapping {
            backend: &*self.backend,
            native,
            ptr,
            len,
        })
    }

    /// Copies `data` into a CPU-visible buffer at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::InvalidArgument`] if the buffer is not CPU visible
    /// or the write runs past its end, or the backend error if mapping
    /// failed.
    pub fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> RhiResult<()> {
        let buffer = self.buffer(handle);
        if !buffer.info().memory.is_cpu_visible() {
            return Err(RhiError::InvalidArgument(format!(
                "{handle:?} lives in {:?} memory and cannot be written directly",
                buffer.info().memory
            )));
        }
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > buffer.size()) {
            return Err(RhiError::InvalidArgument(format!(
                "write of {} bytes at offset {} overflows {:?} ({} bytes)",
                data.len(),
                offset,
                handle,
                buffer.size()
            )));
        }

        let native = buffer.native();
        let ptr = self.backend.buffer_map(native)?;
        // SAFETY: the mapping covers the whole buffer and the range was
        // checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset as usize), data.len());
        }
        self.backend.buffer_unmap(native);
        Ok(())
    }

    // ========================================================================
    // Frames and submission
    // ========================================================================

    /// Moves to the next frame of the ring.
    ///
    /// Waits for the fences of the slot being reused, releases everything it
    /// expired, recycles its command lists and ticks the object caches. The
    /// first call only marks the device warm.
    ///
    /// # Errors
    ///
    /// Returns the backend error if waiting on fences or resetting pools
    /// failed.
    pub fn new_frame(&mut self) -> RhiResult<()> {
        if self.frames[self.frame_index].has_pending() {
            warn!("new_frame with unsubmitted command lists; ending the frame first");
            self.end_frame()?;
        }
        if !self.warm {
            self.warm = true;
            debug!("Device warm");
            return Ok(());
        }

        self.frame_index = (self.frame_index + 1) % self.frames.len();
        let backend = self.backend.clone();
        let frame = &mut self.frames[self.frame_index];

        frame.wait_fences(&*backend)?;
        let reclaimed = frame.reclaim();
        if frame.submitted_work || reclaimed > 0 {
            frame.pool.new_frame(&*backend)?;
        }
        let expired = frame.take_expired();
        frame.reset_flags();

        if !expired.is_empty() {
            debug!("Releasing {} expired resources of frame {}", expired.len(), self.frame_index);
        }
        for handle in expired {
            self.release(handle);
        }

        let evicted = self.render_passes.lock().new_frame() + self.pipelines.lock().new_frame();
        if evicted > 0 {
            debug!("Evicted {} idle cached objects", evicted);
        }
        Ok(())
    }

    /// Submits every pending list of the current frame, one fenced batch per
    /// queue. The graphics batch waits on acquired swapchain images and
    /// signals the semaphore [`present`](Self::present) waits on.
    ///
    /// # Errors
    ///
    /// Returns the backend error of the first failed submission.
    pub fn end_frame(&mut self) -> RhiResult<()> {
        let frame = &mut self.frames[self.frame_index];
        for queue in SUBMIT_ORDER {
            frame
                .submit_queue(&*self.backend, queue, true)
                .inspect_err(|err| error!("Failed to submit {:?} work: {}", queue, err))?;
        }
        Ok(())
    }

    /// Ends recording of `list` and queues it for submission with the
    /// current frame.
    ///
    /// # Errors
    ///
    /// Returns the backend error if the list could not be ended; the list is
    /// then recycled without being submitted.
    pub fn submit(&mut self, mut list: CommandList) -> RhiResult<()> {
        let frame = &mut self.frames[self.frame_index];
        match list.end(&*self.backend) {
            Ok(()) => {
                frame.push_pending(list);
                Ok(())
            }
            Err(err) => {
                error!("Failed to end command list {:?}: {}", list.native(), err);
                frame.retire(list);
                Err(err)
            }
        }
    }

    /// Submits the pending lists of one queue now, without a fence. The
    /// frame's fence still covers them at [`end_frame`](Self::end_frame).
    ///
    /// # Errors
    ///
    /// Returns the backend error if the submission failed.
    pub fn submit_queue(&mut self, queue: QueueType) -> RhiResult<()> {
        self.frames[self.frame_index].submit_queue(&*self.backend, queue, false)
    }

    /// Ends the frame, blocks until the GPU is idle, frees every command list
    /// and starts a new frame.
    ///
    /// # Errors
    ///
    /// Returns the backend error of the submission, the wait or the new
    /// frame.
    pub fn wait_gpu_idle(&mut self) -> RhiResult<()> {
        self.end_frame()?;
        self.backend.device_wait_idle()?;
        let backend = self.backend.clone();
        for frame in &mut self.frames {
            frame.forget_fences(&*backend)?;
            frame.reclaim();
            frame.pool.trim(&*backend);
        }
        debug!("GPU idle; command pools trimmed");
        self.new_frame()
    }

    /// Returns a recording command list for `queue` from the calling
    /// thread's pool of the current frame.
    ///
    /// # Errors
    ///
    /// Returns the backend error if a pool or list could not be created.
    pub fn allocate_cmd_list(&self, queue: QueueType) -> RhiResult<CommandList> {
        self.frames[self.frame_index]
            .pool
            .allocate_cmd_list(&*self.backend, queue)
    }

    // ========================================================================
    // Object caches
    // ========================================================================

    /// Returns the cached render pass for `info`, creating it on a miss.
    ///
    /// # Errors
    ///
    /// Returns the backend error if creation failed; nothing is cached then.
    pub fn create_or_find_render_pass(&self, info: &RenderPassInfo) -> RhiResult<NativeRenderPass> {
        self.render_passes.lock().find_or_insert_with(info, || {
            let render_pass = self
                .backend
                .render_pass_create(info)
                .inspect_err(|err| error!("Failed to create render pass: {}", err))?;
            debug!(
                "Render pass {:?} cached ({} color attachments, depth: {})",
                render_pass,
                info.color_attachments.len(),
                info.depth_attachment.is_some()
            );
            Ok(render_pass)
        })
    }

    /// Returns the cached graphics pipeline for `key`, creating it (and its
    /// render pass) on a miss.
    ///
    /// # Errors
    ///
    /// Returns the backend error if creation failed; nothing is cached then.
    ///
    /// # Panics
    ///
    /// Panics if the key names a stale pipeline layout or shader.
    pub fn create_or_find_gfx_pipeline(&self, key: &GraphicsPipelineKey) -> RhiResult<NativePipeline> {
        self.pipelines.lock().find_or_insert_with(key, || {
            let render_pass = self.create_or_find_render_pass(&key.render_pass)?;
            let state = &key.instance_state;
            let pipeline = self
                .backend
                .gfx_pipeline_create(&GraphicsPipelineCreate {
                    render_pass,
                    render_pass_info: &key.render_pass,
                    layout: self.pipeline_layout(state.layout).native(),
                    vertex_shader: self.shader(state.vertex_shader).native(),
                    fragment_shader: state.fragment_shader.map(|fs| self.shader(fs).native()),
                    render_pass_state: &key.render_pass_state,
                    instance_state: state,
                })
                .inspect_err(|err| error!("Failed to create graphics pipeline: {}", err))?;
            debug!("Graphics pipeline {:?} cached", pipeline);
            Ok(pipeline)
        })
    }

    pub fn cached_render_passes(&self) -> usize {
        self.render_passes.lock().len()
    }

    pub fn cached_pipelines(&self) -> usize {
        self.pipelines.lock().len()
    }

    // ========================================================================
    // Swapchain flow
    // ========================================================================

    /// Acquires the next backbuffer. The current frame's graphics submission
    /// waits for it to become available.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SwapchainOutOfDate`] when the swapchain must be
    /// resized first, or another backend error.
    pub fn acquire_next_image(&mut self, handle: SwapchainHandle) -> RhiResult<u32> {
        let native = self.swapchain(handle).native();
        let acquired = self.backend.swapchain_acquire_image(native)?;
        self.frames[self.frame_index].push_acquire(acquired.ready);
        self.resources.swapchains.get_mut(handle).current = acquired.index;
        Ok(acquired.index)
    }

    /// Presents the acquired backbuffer. Call after
    /// [`end_frame`](Self::end_frame) so the present waits on the frame's
    /// rendering.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::SwapchainOutOfDate`] when the swapchain must be
    /// resized, or another backend error.
    pub fn present(&mut self, handle: SwapchainHandle) -> RhiResult<()> {
        let native = self.swapchain(handle).native();
        let frame = &self.frames[self.frame_index];
        if frame.has_pending() {
            warn!("present of {:?} before end_frame; pending work is not waited on", handle);
        }
        let waits: Vec<_> = frame.render_finished().into_iter().collect();
        self.backend.swapchain_present(native, &waits)
    }

    /// Waits for the GPU, then recreates the backbuffers at the new size.
    /// Previous backbuffer handles become invalid.
    ///
    /// # Errors
    ///
    /// Returns the backend error of the idle wait or the resize.
    pub fn resize_swapchain(&mut self, handle: SwapchainHandle, width: u32, height: u32) -> RhiResult<()> {
        self.wait_gpu_idle()?;

        let swapchain = self.resources.swapchains.get_mut(handle);
        let native = swapchain.native;
        let textures = std::mem::take(&mut swapchain.textures);
        let views = std::mem::take(&mut swapchain.views);
        self.unregister_backbuffers(textures, views);

        let resized = self.backend.swapchain_resize(native, width, height);
        // Whatever backbuffers exist now are registered, even on failure.
        self.register_backbuffers(handle);
        resized.inspect_err(|err| error!("Failed to resize {:?}: {}", handle, err))?;

        let info = self.swapchain(handle).info();
        info!("Swapchain {:?} resized to {}x{}", handle, info.width, info.height);
        Ok(())
    }

    /// View of the last acquired backbuffer.
    ///
    /// # Panics
    ///
    /// Panics if the swapchain has no backbuffers, which is the case after a
    /// resize to a zero extent until the next successful resize.
    pub fn backbuffer_view(&self, handle: SwapchainHandle) -> TextureViewHandle {
        let swapchain = self.swapchain(handle);
        match swapchain.views.get(swapchain.current as usize) {
            Some(view) => *view,
            None => panic!("{handle:?} has no backbuffers; swapchain out of date"),
        }
    }

    /// The last acquired backbuffer.
    ///
    /// # Panics
    ///
    /// Same as [`backbuffer_view`](Self::backbuffer_view).
    pub fn backbuffer_texture(&self, handle: SwapchainHandle) -> TextureHandle {
        let swapchain = self.swapchain(handle);
        match swapchain.textures.get(swapchain.current as usize) {
            Some(texture) => *texture,
            None => panic!("{handle:?} has no backbuffers; swapchain out of date"),
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Current slot of the frame ring.
    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn is_warm(&self) -> bool {
        self.warm
    }

    #[inline]
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    #[inline]
    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    /// Live entries of one resource type, backbuffers included.
    pub fn live_count(&self, ty: ResourceType) -> usize {
        self.resources.live_count(ty)
    }

    /// Handles queued for release across every frame.
    pub fn pending_releases(&self) -> usize {
        self.frames.iter().map(Frame::expired_count).sum()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Waits for the GPU and releases everything the device owns.
    ///
    /// # Panics
    ///
    /// Panics if resources other than swapchains are still alive afterwards,
    /// meaning they were never destroyed.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        let backend = self.backend.clone();
        if let Err(err) = self.end_frame() {
            error!("Failed to submit the last frame: {}", err);
        }
        if let Err(err) = backend.device_wait_idle() {
            error!("Failed to wait for device idle during shutdown: {}", err);
        }
        for frame in &mut self.frames {
            if let Err(err) = frame.forget_fences(&*backend) {
                error!("Failed to reset frame fences: {}", err);
            }
            frame.reclaim();
            frame.pool.trim(&*backend);
        }

        let mut expired: Vec<DeviceResourceHandle> =
            self.frames.iter_mut().flat_map(Frame::take_expired).collect();
        expired.sort_by_key(|handle| {
            RELEASE_ORDER
                .iter()
                .position(|ty| handle.resource_type() == Some(*ty))
        });
        for handle in expired {
            self.release(handle);
        }
        for swapchain in self.resources.swapchains.handles() {
            self.release(swapchain.raw());
        }

        self.pipelines.lock().clear();
        self.render_passes.lock().clear();
        for frame in &mut self.frames {
            frame.destroy(&*backend);
        }

        let leaks: Vec<String> = ResourceType::ALL
            .iter()
            .filter_map(|ty| {
                let count = self.resources.live_count(*ty);
                (count > 0).then(|| format!("{count} {ty}"))
            })
            .collect();
        if !leaks.is_empty() {
            let message = format!("device destroyed with live resources: {}", leaks.join(", "));
            if std::thread::panicking() {
                error!("{}", message);
            } else {
                panic!("{message}");
            }
        }
        info!("Device destroyed");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.backend.name())
            .field("frame_index", &self.frame_index)
            .field("warm", &self.warm)
            .field("resources", &self.resources)
            .finish()
    }
}

/// A mapped CPU-visible buffer. Unmapped on drop.
pub struct BufferMapping<'a> {
    backend: &'a dyn Backend,
    native: NativeBuffer,
    ptr: NonNull<u8>,
    len: usize,
}

impl BufferMapping<'_> {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the backend maps the whole buffer and the device is
        // mutably borrowed for the guard's lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`, and `&mut self` makes the slice unique.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copies `data` into the mapping at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the write runs past the end of the buffer.
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        self.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for BufferMapping<'_> {
    fn drop(&mut self) {
        self.backend.buffer_unmap(self.native);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::types::{BufferUsage, MemoryUsage};

    fn device() -> (Arc<HeadlessBackend>, Device) {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), DeviceConfig::default()).unwrap();
        (backend, device)
    }

    #[test]
    fn test_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Device>();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let backend = Arc::new(HeadlessBackend::new());
        let config = DeviceConfig {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(Device::new(backend.clone(), config), Err(RhiError::Config(_))));
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_first_new_frame_only_warms() {
        let (_backend, mut device) = device();
        assert!(!device.is_warm());
        device.new_frame().unwrap();
        assert!(device.is_warm());
        assert_eq!(device.frame_index(), 0);
        device.new_frame().unwrap();
        assert_eq!(device.frame_index(), 1);
        device.new_frame().unwrap();
        assert_eq!(device.frame_index(), 0);
        device.destroy();
    }

    #[test]
    fn test_write_and_map_buffer() {
        let (_backend, mut device) = device();
        let info = BufferInfo::new(16, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu);
        let buffer = device.create_buffer(&info, None).unwrap();

        device.write_buffer(buffer, 4, &[1, 2, 3, 4]).unwrap();
        {
            let mut mapping = device.map_buffer(buffer).unwrap();
            assert_eq!(&mapping.as_slice()[4..8], &[1, 2, 3, 4]);
            mapping.write(0, &[9]);
        }
        assert_eq!(device.map_buffer(buffer).unwrap().as_slice()[0], 9);

        assert!(matches!(
            device.write_buffer(buffer, 12, &[0; 8]),
            Err(RhiError::InvalidArgument(_))
        ));
        device.destroy_buffer(buffer);
        device.destroy();
    }

    #[test]
    fn test_gpu_only_buffer_cannot_be_mapped() {
        let (_backend, mut device) = device();
        let info = BufferInfo::new(16, BufferUsage::VERTEX, MemoryUsage::GpuOnly);
        let buffer = device.create_buffer(&info, None).unwrap();
        assert!(device.map_buffer(buffer).is_err());
        device.destroy_buffer(buffer);
        device.destroy();
    }

    #[test]
    fn test_is_valid_never_panics() {
        let (_backend, mut device) = device();
        assert!(!device.is_valid(BufferHandle::NULL));
        assert!(!device.is_valid(TextureHandle::from_index(3)));
        let sampler = device.create_sampler(&SamplerInfo::default()).unwrap();
        assert!(device.is_valid(sampler));
        device.destroy_sampler(sampler);
        device.destroy();
    }

    #[test]
    #[should_panic(expected = "live resources")]
    fn test_leak_panics_on_destroy() {
        let (_backend, mut device) = device();
        device.create_sampler(&SamplerInfo::default()).unwrap();
        device.destroy();
    }

    #[test]
    #[should_panic(expected = "used with the buffer arena")]
    fn test_wrong_typed_raw_handle_panics() {
        let (_backend, device) = device();
        let texture = TextureHandle::from_index(0).raw();
        device.buffer(BufferHandle::from_raw_unchecked(texture));
    }
}
