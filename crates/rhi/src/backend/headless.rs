//! CPU implementation of the backend contract.
//!
//! # Overview
//!
//! [`HeadlessBackend`] runs the core without a GPU. Buffers and textures are
//! byte arrays, command lists store the commands that have a visible effect
//! (copies, barriers, render pass clears) and replay them when submitted, and
//! fences are signaled as soon as the submission has executed. Swapchains own
//! CPU backbuffers and rotate through them on acquire.
//!
//! Misuse that a native driver would report through its validation layer
//! (recording into a list that is not recording, a barrier whose old layout
//! does not match, a draw outside a render pass, an out of bounds copy) is
//! logged at `warn!` and counted in [`HeadlessStats::validation_errors`], so
//! tests can assert a run was clean.
//!
//! # Example
//!
//! ```
//! use forge_rhi::backend::{Backend, HeadlessBackend};
//! use forge_rhi::types::{BufferInfo, BufferUsage, MemoryUsage};
//!
//! let backend = HeadlessBackend::new();
//! let buffer = backend
//!     .buffer_create(&BufferInfo::new(16, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu))
//!     .unwrap();
//! assert_eq!(backend.buffer_contents(buffer), Some(vec![0; 16]));
//! backend.buffer_destroy(buffer);
//! assert_eq!(backend.live_objects(), 0);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle, WebDisplayHandle, WebWindowHandle};
use tracing::{debug, warn};

use super::{
    AcquiredImage, Backend, BackendFeature, DescriptorResource, DescriptorWrite,
    GraphicsPipelineCreate, NativeBuffer, NativeCommandList, NativeCommandPool,
    NativeDescriptorSet, NativeFence, NativePipeline, NativePipelineLayout, NativeRenderPass,
    NativeSampler, NativeSemaphore, NativeShader, NativeSwapchain, NativeTexture,
    NativeTextureView, QueueSubmit, RenderPassBegin, SurfaceTarget, TextureBarrier,
};
use crate::error::{RhiError, RhiResult};
use crate::render_pass::{ClearValue, LoadOp, RenderPassInfo};
use crate::types::{
    BufferCopy, BufferInfo, BufferTextureCopy, DescriptorKind, Format, IndexType,
    PipelineLayoutInfo, QueueType, Rect2D, SamplerInfo, ShaderInfo, ShaderStage, SwapchainInfo,
    TextureInfo, TextureLayout, TextureUsage, TextureViewInfo, Viewport,
};

/// Counters of everything the headless backend was asked to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub textures_created: u64,
    pub textures_destroyed: u64,
    pub texture_views_created: u64,
    pub texture_views_destroyed: u64,
    pub samplers_created: u64,
    pub samplers_destroyed: u64,
    pub shaders_created: u64,
    pub shaders_destroyed: u64,
    pub pipeline_layouts_created: u64,
    pub pipeline_layouts_destroyed: u64,
    pub render_passes_created: u64,
    pub render_passes_destroyed: u64,
    pub pipelines_created: u64,
    pub pipelines_destroyed: u64,
    pub descriptor_sets_allocated: u64,
    pub descriptor_sets_freed: u64,
    pub swapchains_created: u64,
    pub swapchains_destroyed: u64,
    pub command_lists_allocated: u64,
    pub command_lists_freed: u64,
    pub pool_resets: u64,
    pub pool_trims: u64,
    pub bind_pipeline_calls: u64,
    pub bind_descriptor_set_calls: u64,
    pub draw_calls: u64,
    pub submissions: u64,
    pub acquires: u64,
    pub presents: u64,
    pub validation_errors: u64,
}

/// Heap block with a stable address, standing in for mapped device memory.
struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: HostMemory exclusively owns its allocation.
unsafe impl Send for HostMemory {}

impl HostMemory {
    fn zeroed(len: usize) -> Self {
        let block: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        Self {
            ptr: NonNull::from(block).cast::<u8>(),
            len,
        }
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr/len describe the live allocation made in `zeroed`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` excludes other safe borrows.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        let block = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: the block was leaked from a Box<[u8]> of exactly this length.
        drop(unsafe { Box::from_raw(block) });
    }
}

struct BufferObject {
    info: BufferInfo,
    memory: HostMemory,
}

struct TextureObject {
    info: TextureInfo,
    data: Vec<u8>,
    layout: TextureLayout,
    /// Backbuffers belong to their swapchain.
    swapchain: Option<u64>,
}

struct SwapchainObject {
    info: SwapchainInfo,
    textures: Vec<u64>,
    views: Vec<u64>,
    semaphores: Vec<u64>,
    next_image: u32,
    current: u32,
    acquired: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListState {
    Initial,
    Recording,
    Executable,
}

struct ListObject {
    pool: u64,
    state: ListState,
    in_render_pass: bool,
    commands: Vec<Command>,
}

/// Recorded commands with an effect on resource contents or layouts.
enum Command {
    BeginRenderPass {
        render_pass: u64,
        color_views: Vec<u64>,
        clear_values: Vec<ClearValue>,
    },
    CopyBuffer {
        src: u64,
        dst: u64,
        regions: Vec<BufferCopy>,
    },
    CopyBufferToTexture {
        src: u64,
        dst: u64,
        regions: Vec<BufferTextureCopy>,
    },
    Barrier(Vec<TextureBarrier>),
}

#[derive(Default)]
struct State {
    next_id: u64,
    buffers: HashMap<u64, BufferObject>,
    textures: HashMap<u64, TextureObject>,
    views: HashMap<u64, u64>,
    samplers: HashMap<u64, SamplerInfo>,
    shaders: HashMap<u64, ShaderStage>,
    layouts: HashMap<u64, PipelineLayoutInfo>,
    descriptor_sets: HashMap<u64, u64>,
    render_passes: HashMap<u64, RenderPassInfo>,
    pipelines: HashMap<u64, u64>,
    swapchains: HashMap<u64, SwapchainObject>,
    pools: HashMap<u64, QueueType>,
    lists: HashMap<u64, ListObject>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, ()>,
    stats: HeadlessStats,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn invalid(&mut self, message: impl fmt::Display) {
        self.stats.validation_errors += 1;
        warn!("headless validation: {}", message);
    }

    fn create_texture(&mut self, info: &TextureInfo, swapchain: Option<u64>) -> u64 {
        let id = self.next_id();
        let data = vec![0u8; info.base_level_size() as usize];
        self.textures.insert(
            id,
            TextureObject {
                info: info.clone(),
                data,
                layout: TextureLayout::Undefined,
                swapchain,
            },
        );
        id
    }

    fn create_view(&mut self, texture: u64) -> u64 {
        let id = self.next_id();
        self.views.insert(id, texture);
        id
    }

    fn create_backbuffers(&mut self, swapchain: u64, info: &SwapchainInfo) -> (Vec<u64>, Vec<u64>) {
        let texture_info = TextureInfo::new_2d(
            info.format,
            info.width,
            info.height,
            TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_DST,
        );
        (0..info.image_count)
            .map(|_| {
                let texture = self.create_texture(&texture_info, Some(swapchain));
                (texture, self.create_view(texture))
            })
            .unzip()
    }

    fn release_backbuffers(&mut self, swapchain: &SwapchainObject) {
        for view in &swapchain.views {
            self.views.remove(view);
        }
        for texture in &swapchain.textures {
            self.textures.remove(texture);
        }
    }

    fn execute(&mut self, command: &Command) {
        match command {
            Command::BeginRenderPass {
                render_pass,
                color_views,
                clear_values,
            } => self.begin_render_pass(*render_pass, color_views, clear_values),
            Command::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    if let Err(e) = self.copy_buffer(*src, *dst, region) {
                        self.invalid(e);
                    }
                }
            }
            Command::CopyBufferToTexture { src, dst, regions } => {
                for region in regions {
                    if let Err(e) = self.copy_buffer_to_texture(*src, *dst, region) {
                        self.invalid(e);
                    }
                }
            }
            Command::Barrier(barriers) => {
                for barrier in barriers {
                    let mismatch = match self.textures.get_mut(&barrier.texture.0) {
                        Some(texture) => {
                            let previous = texture.layout;
                            texture.layout = barrier.new_layout;
                            (barrier.old_layout != TextureLayout::Undefined
                                && barrier.old_layout != previous)
                                .then(|| {
                                    format!(
                                        "barrier on {:?} expects {:?}, texture is in {:?}",
                                        barrier.texture, barrier.old_layout, previous
                                    )
                                })
                        }
                        None => Some(format!("barrier on unknown {:?}", barrier.texture)),
                    };
                    if let Some(message) = mismatch {
                        self.invalid(message);
                    }
                }
            }
        }
    }

    fn begin_render_pass(&mut self, render_pass: u64, color_views: &[u64], clear_values: &[ClearValue]) {
        let Some(info) = self.render_passes.get(&render_pass).cloned() else {
            self.invalid(format!("begin of unknown render pass {render_pass:#x}"));
            return;
        };
        for (i, desc) in info.color_attachments.iter().enumerate() {
            let texture = color_views.get(i).and_then(|view| self.views.get(view)).copied();
            let Some(texture) = texture.and_then(|id| self.textures.get_mut(&id)) else {
                self.invalid(format!("color attachment {i} has no live texture"));
                continue;
            };
            if texture.layout != desc.layout {
                let message = format!(
                    "color attachment {i} is in {:?}, pass expects {:?}",
                    texture.layout, desc.layout
                );
                self.invalid(message);
                continue;
            }
            if desc.load_op == LoadOp::Clear
                && let Some(ClearValue::Color(color)) = clear_values.get(i)
                && let Some(texel) = encode_color(texture.info.format, *color)
            {
                for chunk in texture.data.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&texel);
                }
            }
        }
    }

    fn copy_buffer(&mut self, src: u64, dst: u64, region: &BufferCopy) -> Result<(), String> {
        let size = region.size as usize;
        let src_start = region.src_offset as usize;
        let dst_start = region.dst_offset as usize;
        let bytes = self
            .buffers
            .get(&src)
            .ok_or_else(|| format!("copy from unknown buffer {src:#x}"))?
            .memory
            .as_slice()
            .get(src_start..src_start + size)
            .ok_or_else(|| format!("copy reads past the end of buffer {src:#x}"))?
            .to_vec();
        self.buffers
            .get_mut(&dst)
            .ok_or_else(|| format!("copy into unknown buffer {dst:#x}"))?
            .memory
            .as_mut_slice()
            .get_mut(dst_start..dst_start + size)
            .ok_or_else(|| format!("copy writes past the end of buffer {dst:#x}"))?
            .copy_from_slice(&bytes);
        Ok(())
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: u64,
        dst: u64,
        region: &BufferTextureCopy,
    ) -> Result<(), String> {
        let source = self
            .buffers
            .get(&src)
            .ok_or_else(|| format!("copy from unknown buffer {src:#x}"))?
            .memory
            .as_slice()
            .to_vec();
        let texture = self
            .textures
            .get_mut(&dst)
            .ok_or_else(|| format!("copy into unknown texture {dst:#x}"))?;
        if texture.layout != TextureLayout::TransferDst && texture.layout != TextureLayout::General {
            return Err(format!(
                "copy into texture {dst:#x} in {:?}",
                texture.layout
            ));
        }
        if region.mip_level != 0 {
            return Err("only mip level 0 is stored".to_string());
        }

        let info = &texture.info;
        if region.x + region.width > info.width
            || region.y + region.height > info.height
            || region.z + region.depth > info.depth
            || region.base_array_layer + region.array_layer_count > info.array_layers
        {
            return Err(format!("copy region exceeds texture {dst:#x}"));
        }

        let texel = info.format.texel_size() as usize;
        let (width, height, depth) = (info.width as usize, info.height as usize, info.depth as usize);
        let row = region.width as usize * texel;
        let mut offset = region.buffer_offset as usize;
        for layer in 0..region.array_layer_count as usize {
            for z in 0..region.depth as usize {
                for y in 0..region.height as usize {
                    let slice = (region.base_array_layer as usize + layer) * depth + region.z as usize + z;
                    let first = (slice * height + region.y as usize + y) * width + region.x as usize;
                    let bytes = source
                        .get(offset..offset + row)
                        .ok_or_else(|| format!("copy reads past the end of buffer {src:#x}"))?;
                    texture.data[first * texel..first * texel + row].copy_from_slice(bytes);
                    offset += row;
                }
            }
        }
        Ok(())
    }
}

/// Packs a clear color into one texel of an 8-bit four-channel format.
fn encode_color(format: Format, color: [f32; 4]) -> Option<[u8; 4]> {
    let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    let [r, g, b, a] = color.map(unorm);
    match format {
        Format::Rgba8Unorm | Format::Rgba8Srgb => Some([r, g, b, a]),
        Format::Bgra8Unorm | Format::Bgra8Srgb => Some([b, g, r, a]),
        _ => None,
    }
}

/// Backend that executes everything on the CPU.
pub struct HeadlessBackend {
    state: Mutex<State>,
    fail_next_create: AtomicBool,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            fail_next_create: AtomicBool::new(false),
        }
    }

    /// A placeholder window for `swapchain_create`; the headless backend
    /// never looks at it.
    pub fn surface_target() -> SurfaceTarget {
        SurfaceTarget {
            display: RawDisplayHandle::Web(WebDisplayHandle::new()),
            window: RawWindowHandle::Web(WebWindowHandle::new(1)),
        }
    }

    /// Makes the next resource `*_create` call fail with
    /// [`RhiError::OutOfMemory`].
    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> HeadlessStats {
        self.state.lock().stats
    }

    /// Number of native objects currently alive, of every kind.
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.buffers.len()
            + state.textures.len()
            + state.views.len()
            + state.samplers.len()
            + state.shaders.len()
            + state.layouts.len()
            + state.descriptor_sets.len()
            + state.render_passes.len()
            + state.pipelines.len()
            + state.swapchains.len()
            + state.pools.len()
            + state.lists.len()
            + state.fences.len()
            + state.semaphores.len()
    }

    pub fn buffer_contents(&self, buffer: NativeBuffer) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state.buffers.get(&buffer.0).map(|b| b.memory.as_slice().to_vec())
    }

    /// Mip 0 of every layer, tightly packed.
    pub fn texture_contents(&self, texture: NativeTexture) -> Option<Vec<u8>> {
        self.state.lock().textures.get(&texture.0).map(|t| t.data.clone())
    }

    /// Layout the texture is in after every executed submission.
    pub fn texture_layout(&self, texture: NativeTexture) -> Option<TextureLayout> {
        self.state.lock().textures.get(&texture.0).map(|t| t.layout)
    }

    fn take_injected_failure(&self, what: &str) -> RhiResult<()> {
        if self.fail_next_create.swap(false, Ordering::AcqRel) {
            return Err(RhiError::OutOfMemory(format!("injected failure creating {what}")));
        }
        Ok(())
    }

    /// Runs `f` on `list` if it is recording, flags the call otherwise.
    fn record(&self, list: NativeCommandList, what: &str, f: impl FnOnce(&mut ListObject, &mut HeadlessStats)) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.lists.get_mut(&list.0) {
            Some(object) if object.state == ListState::Recording => f(object, &mut state.stats),
            _ => state.invalid(format!("{what} on {list:?}, which is not recording")),
        }
    }

    fn record_in_pass(&self, list: NativeCommandList, what: &str, f: impl FnOnce(&mut HeadlessStats)) {
        let mut outside = false;
        self.record(list, what, |object, stats| {
            if object.in_render_pass {
                f(stats);
            } else {
                outside = true;
            }
        });
        if outside {
            self.state
                .lock()
                .invalid(format!("{what} on {list:?} outside a render pass"));
        }
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HeadlessBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeadlessBackend")
            .field("live_objects", &self.live_objects())
            .finish()
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn support_feature(&self, feature: BackendFeature) -> bool {
        match feature {
            BackendFeature::CommandPoolTrim => true,
        }
    }

    fn buffer_create(&self, info: &BufferInfo) -> RhiResult<NativeBuffer> {
        self.take_injected_failure("buffer")?;
        if info.size == 0 {
            return Err(RhiError::InvalidArgument("buffer size must be non-zero".to_string()));
        }
        let mut state = self.state.lock();
        let id = state.next_id();
        state.buffers.insert(
            id,
            BufferObject {
                info: info.clone(),
                memory: HostMemory::zeroed(info.size as usize),
            },
        );
        state.stats.buffers_created += 1;
        debug!("Headless buffer {:#x} created ({} bytes)", id, info.size);
        Ok(NativeBuffer(id))
    }

    fn buffer_destroy(&self, buffer: NativeBuffer) {
        let mut state = self.state.lock();
        if state.buffers.remove(&buffer.0).is_some() {
            state.stats.buffers_destroyed += 1;
        } else {
            state.invalid(format!("destroy of unknown {buffer:?}"));
        }
    }

    fn buffer_map(&self, buffer: NativeBuffer) -> RhiResult<NonNull<u8>> {
        let state = self.state.lock();
        let object = state
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("map of unknown {buffer:?}")))?;
        if !object.info.memory.is_cpu_visible() {
            return Err(RhiError::InvalidArgument(format!(
                "{buffer:?} is not CPU visible ({:?})",
                object.info.memory
            )));
        }
        Ok(object.memory.ptr)
    }

    fn buffer_unmap(&self, buffer: NativeBuffer) {
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&buffer.0) {
            state.invalid(format!("unmap of unknown {buffer:?}"));
        }
    }

    fn texture_create(&self, info: &TextureInfo) -> RhiResult<NativeTexture> {
        self.take_injected_failure("texture")?;
        if info.width == 0 || info.height == 0 || info.depth == 0 {
            return Err(RhiError::InvalidArgument("texture extent must be non-zero".to_string()));
        }
        let mut state = self.state.lock();
        let id = state.create_texture(info, None);
        state.stats.textures_created += 1;
        debug!(
            "Headless texture {:#x} created ({}x{} {:?})",
            id, info.width, info.height, info.format
        );
        Ok(NativeTexture(id))
    }

    fn texture_destroy(&self, texture: NativeTexture) {
        let mut state = self.state.lock();
        match state.textures.get(&texture.0).map(|t| t.swapchain) {
            Some(None) => {
                state.textures.remove(&texture.0);
                state.stats.textures_destroyed += 1;
            }
            Some(Some(_)) => state.invalid(format!("destroy of swapchain-owned {texture:?}")),
            None => state.invalid(format!("destroy of unknown {texture:?}")),
        }
    }

    fn texture_view_create(
        &self,
        texture: NativeTexture,
        info: &TextureViewInfo,
    ) -> RhiResult<NativeTextureView> {
        self.take_injected_failure("texture view")?;
        let mut state = self.state.lock();
        let Some(object) = state.textures.get(&texture.0) else {
            return Err(RhiError::InvalidHandle(format!("view of unknown {texture:?}")));
        };
        if info.base_mip_level + info.mip_level_count > object.info.mip_levels
            || info.base_array_layer + info.array_layer_count > object.info.array_layers
        {
            return Err(RhiError::InvalidArgument(format!(
                "view range exceeds {texture:?}"
            )));
        }
        let id = state.create_view(texture.0);
        state.stats.texture_views_created += 1;
        Ok(NativeTextureView(id))
    }

    fn texture_view_destroy(&self, view: NativeTextureView) {
        let mut state = self.state.lock();
        let owned = state
            .views
            .get(&view.0)
            .map(|texture| state.textures.get(texture).and_then(|t| t.swapchain).is_some());
        match owned {
            Some(false) => {
                state.views.remove(&view.0);
                state.stats.texture_views_destroyed += 1;
            }
            Some(true) => state.invalid(format!("destroy of swapchain-owned {view:?}")),
            None => state.invalid(format!("destroy of unknown {view:?}")),
        }
    }

    fn sampler_create(&self, info: &SamplerInfo) -> RhiResult<NativeSampler> {
        self.take_injected_failure("sampler")?;
        let mut state = self.state.lock();
        let id = state.next_id();
        state.samplers.insert(id, info.clone());
        state.stats.samplers_created += 1;
        Ok(NativeSampler(id))
    }

    fn sampler_destroy(&self, sampler: NativeSampler) {
        let mut state = self.state.lock();
        if state.samplers.remove(&sampler.0).is_some() {
            state.stats.samplers_destroyed += 1;
        } else {
            state.invalid(format!("destroy of unknown {sampler:?}"));
        }
    }

    fn shader_create(&self, info: &ShaderInfo) -> RhiResult<NativeShader> {
        self.take_injected_failure("shader")?;
        if info.code.is_empty() || info.code.len() % 4 != 0 {
            return Err(RhiError::ShaderError(format!(
                "{} shader code must be a non-empty multiple of 4 bytes, got {}",
                info.stage,
                info.code.len()
            )));
        }
        let mut state = self.state.lock();
        let id = state.next_id();
        state.shaders.insert(id, info.stage);
        state.stats.shaders_created += 1;
        Ok(NativeShader(id))
    }

    fn shader_destroy(&self, shader: NativeShader) {
        let mut state = self.state.lock();
        if state.shaders.remove(&shader.0).is_some() {
            state.stats.shaders_destroyed += 1;
        } else {
            state.invalid(format!("destroy of unknown {shader:?}"));
        }
    }

    fn pipeline_layout_create(&self, info: &PipelineLayoutInfo) -> RhiResult<NativePipelineLayout> {
        self.take_injected_failure("pipeline layout")?;
        let mut state = self.state.lock();
        let id = state.next_id();
        state.layouts.insert(id, info.clone());
        state.stats.pipeline_layouts_created += 1;
        Ok(NativePipelineLayout(id))
    }

    fn pipeline_layout_destroy(&self, layout: NativePipelineLayout) {
        let mut state = self.state.lock();
        if state.layouts.remove(&layout.0).is_some() {
            state.stats.pipeline_layouts_destroyed += 1;
        } else {
            state.invalid(format!("destroy of unknown {layout:?}"));
        }
    }

    fn descriptor_set_allocate(
        &self,
        layout: NativePipelineLayout,
        set: u32,
        writes: &[DescriptorWrite],
    ) -> RhiResult<NativeDescriptorSet> {
        let mut state = self.state.lock();
        let info = state
            .layouts
            .get(&layout.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("descriptor set of unknown {layout:?}")))?;
        if !info.declares_set(set) {
            return Err(RhiError::InvalidArgument(format!(
                "{layout:?} declares no set {set}"
            )));
        }
        for write in writes {
            let kind = match write.resource {
                DescriptorResource::UniformBuffer { .. } => DescriptorKind::UniformBuffer,
                DescriptorResource::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
                DescriptorResource::Sampler(_) => DescriptorKind::Sampler,
                DescriptorResource::SampledTexture(_) => DescriptorKind::SampledTexture,
            };
            if info.declared(set, write.binding).map(|b| b.kind) != Some(kind) {
                return Err(RhiError::InvalidArgument(format!(
                    "set {set} binding {} does not declare {kind:?}",
                    write.binding
                )));
            }
        }
        let id = state.next_id();
        state.descriptor_sets.insert(id, layout.0);
        state.stats.descriptor_sets_allocated += 1;
        Ok(NativeDescriptorSet(id))
    }

    fn descriptor_set_free(&self, set: NativeDescriptorSet) {
        let mut state = self.state.lock();
        if state.descriptor_sets.remove(&set.0).is_some() {
            state.stats.descriptor_sets_freed += 1;
        } else {
            state.invalid(format!("free of unknown {set:?}"));
        }
    }

    fn render_pass_create(&self, info: &RenderPassInfo) -> RhiResult<NativeRenderPass> {
        self.take_injected_failure("render pass")?;
        let mut state = self.state.lock();
        let id = state.next_id();
        state.render_passes.insert(id, info.clone());
        state.stats.render_passes_created += 1;
        debug!(
            "Headless render pass {:#x} created ({} color attachments)",
            id,
            info.color_attachments.len()
        );
        Ok(NativeRenderPass(id))
    }

    fn render_pass_destroy(&self, render_pass: NativeRenderPass) {
        let mut state = self.state.lock();
        if state.render_passes.remove(&render_pass.0).is_some() {
            state.stats.render_passes_destroyed += 1;
        } else {
            state.invalid(format!("destroy of unknown {render_pass:?}"));
        }
    }

    fn gfx_pipeline_create(&self, desc: &GraphicsPipelineCreate<'_>) -> RhiResult<NativePipeline> {
        self.take_injected_failure("graphics pipeline")?;
        let mut state = self.state.lock();
        if !state.layouts.contains_key(&desc.layout.0) {
            return Err(RhiError::PipelineError(format!("unknown {:?}", desc.layout)));
        }
        if !state.render_passes.contains_key(&desc.render_pass.0) {
            return Err(RhiError::PipelineError(format!("unknown {:?}", desc.render_pass)));
        }
        if state.shaders.get(&desc.vertex_shader.0) != Some(&ShaderStage::Vertex) {
            return Err(RhiError::PipelineError(format!(
                "{:?} is not a live vertex shader",
                desc.vertex_shader
            )));
        }
        if let Some(fragment) = desc.fragment_shader
            && state.shaders.get(&fragment.0) != Some(&ShaderStage::Fragment)
        {
            return Err(RhiError::PipelineError(format!(
                "{fragment:?} is not a live fragment shader"
            )));
        }
        if desc.render_pass_state.blend_attachments.len() != desc.render_pass_info.color_attachments.len() {
            return Err(RhiError::PipelineError(format!(
                "{} blend attachments for {} color attachments",
                desc.render_pass_state.blend_attachments.len(),
                desc.render_pass_info.color_attachments.len()
            )));
        }
        let id = state.next_id();
        state.pipelines.insert(id, desc.layout.0);
        state.stats.pipelines_created += 1;
        debug!("Headless graphics pipeline {:#x} created", id);
        Ok(NativePipeline(id))
    }

    fn gfx_pipeline_destroy(&self, pipeline: NativePipeline) {
        let mut state = self.state.lock();
        if state.pipelines.remove(&pipeline.0).is_some() {
            state.stats.pipelines_destroyed += 1;
        } else {
            state.invalid(format!("destroy of unknown {pipeline:?}"));
        }
    }

    fn swapchain_create(
        &self,
        info: &SwapchainInfo,
        _target: &SurfaceTarget,
    ) -> RhiResult<NativeSwapchain> {
        self.take_injected_failure("swapchain")?;
        let mut info = info.clone();
        if info.format == Format::Undefined {
            info.format = Format::Bgra8Srgb;
        }
        info.image_count = info.image_count.max(1);

        let mut state = self.state.lock();
        let id = state.next_id();
        let (textures, views) = state.create_backbuffers(id, &info);
        let semaphores = (0..info.image_count)
            .map(|_| {
                let semaphore = state.next_id();
                state.semaphores.insert(semaphore, ());
                semaphore
            })
            .collect();
        state.swapchains.insert(
            id,
            SwapchainObject {
                info,
                textures,
                views,
                semaphores,
                next_image: 0,
                current: 0,
                acquired: false,
            },
        );
        state.stats.swapchains_created += 1;
        Ok(NativeSwapchain(id))
    }

    fn swapchain_destroy(&self, swapchain: NativeSwapchain) {
        let mut state = self.state.lock();
        let Some(object) = state.swapchains.remove(&swapchain.0) else {
            state.invalid(format!("destroy of unknown {swapchain:?}"));
            return;
        };
        state.release_backbuffers(&object);
        for semaphore in &object.semaphores {
            state.semaphores.remove(semaphore);
        }
        state.stats.swapchains_destroyed += 1;
    }

    fn swapchain_resize(&self, swapchain: NativeSwapchain, width: u32, height: u32) -> RhiResult<()> {
        let mut state = self.state.lock();
        let mut object = state
            .swapchains
            .remove(&swapchain.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("resize of unknown {swapchain:?}")))?;
        state.release_backbuffers(&object);
        object.info.width = width;
        object.info.height = height;
        let (textures, views) = state.create_backbuffers(swapchain.0, &object.info);
        object.textures = textures;
        object.views = views;
        object.next_image = 0;
        object.current = 0;
        object.acquired = false;
        state.swapchains.insert(swapchain.0, object);
        Ok(())
    }

    fn swapchain_acquire_image(&self, swapchain: NativeSwapchain) -> RhiResult<AcquiredImage> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let object = state
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("acquire on unknown {swapchain:?}")))?;
        if object.info.width == 0 || object.info.height == 0 {
            return Err(RhiError::SwapchainOutOfDate);
        }
        let index = object.next_image;
        object.next_image = (index + 1) % object.info.image_count;
        object.current = index;
        object.acquired = true;
        let ready = object.semaphores[index as usize];
        state.stats.acquires += 1;
        Ok(AcquiredImage {
            index,
            ready: NativeSemaphore(ready),
        })
    }

    fn swapchain_present(
        &self,
        swapchain: NativeSwapchain,
        _wait_semaphores: &[NativeSemaphore],
    ) -> RhiResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let object = state
            .swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("present on unknown {swapchain:?}")))?;
        if !object.acquired {
            return Err(RhiError::SwapchainError("present without an acquired image".to_string()));
        }
        object.acquired = false;
        let texture = object.textures[object.current as usize];
        state.stats.presents += 1;
        let layout = state.textures.get(&texture).map(|t| t.layout);
        if layout != Some(TextureLayout::PresentSrc) {
            state.invalid(format!("presented backbuffer is in {layout:?}"));
        }
        Ok(())
    }

    fn swapchain_backbuffer_textures(&self, swapchain: NativeSwapchain) -> Vec<NativeTexture> {
        let state = self.state.lock();
        state
            .swapchains
            .get(&swapchain.0)
            .map(|s| s.textures.iter().copied().map(NativeTexture).collect())
            .unwrap_or_default()
    }

    fn swapchain_backbuffer_texture_views(&self, swapchain: NativeSwapchain) -> Vec<NativeTextureView> {
        let state = self.state.lock();
        state
            .swapchains
            .get(&swapchain.0)
            .map(|s| s.views.iter().copied().map(NativeTextureView).collect())
            .unwrap_or_default()
    }

    fn swapchain_backbuffer_index(&self, swapchain: NativeSwapchain) -> u32 {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map_or(0, |s| s.current)
    }

    fn swapchain_info(&self, swapchain: NativeSwapchain) -> SwapchainInfo {
        self.state
            .lock()
            .swapchains
            .get(&swapchain.0)
            .map(|s| s.info.clone())
            .unwrap_or_default()
    }

    fn command_pool_create(&self, queue: QueueType) -> RhiResult<NativeCommandPool> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.pools.insert(id, queue);
        Ok(NativeCommandPool(id))
    }

    fn command_pool_destroy(&self, pool: NativeCommandPool) {
        let mut state = self.state.lock();
        if state.pools.remove(&pool.0).is_none() {
            state.invalid(format!("destroy of unknown {pool:?}"));
            return;
        }
        let before = state.lists.len();
        state.lists.retain(|_, list| list.pool != pool.0);
        state.stats.command_lists_freed += (before - state.lists.len()) as u64;
    }

    fn command_pool_reset(&self, pool: NativeCommandPool) -> RhiResult<()> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool.0) {
            return Err(RhiError::InvalidHandle(format!("reset of unknown {pool:?}")));
        }
        for list in state.lists.values_mut().filter(|list| list.pool == pool.0) {
            list.state = ListState::Initial;
            list.in_render_pass = false;
            list.commands.clear();
        }
        state.stats.pool_resets += 1;
        Ok(())
    }

    fn command_pool_trim(&self, pool: NativeCommandPool) {
        let mut state = self.state.lock();
        if state.pools.contains_key(&pool.0) {
            state.stats.pool_trims += 1;
        } else {
            state.invalid(format!("trim of unknown {pool:?}"));
        }
    }

    fn command_list_allocate(&self, pool: NativeCommandPool) -> RhiResult<NativeCommandList> {
        let mut state = self.state.lock();
        if !state.pools.contains_key(&pool.0) {
            return Err(RhiError::InvalidHandle(format!("allocate from unknown {pool:?}")));
        }
        let id = state.next_id();
        state.lists.insert(
            id,
            ListObject {
                pool: pool.0,
                state: ListState::Initial,
                in_render_pass: false,
                commands: Vec::new(),
            },
        );
        state.stats.command_lists_allocated += 1;
        Ok(NativeCommandList(id))
    }

    fn command_list_free(&self, pool: NativeCommandPool, list: NativeCommandList) {
        let mut state = self.state.lock();
        match state.lists.get(&list.0).map(|l| l.pool) {
            Some(owner) if owner == pool.0 => {
                state.lists.remove(&list.0);
                state.stats.command_lists_freed += 1;
            }
            Some(_) => state.invalid(format!("{list:?} freed to a pool it was not allocated from")),
            None => state.invalid(format!("free of unknown {list:?}")),
        }
    }

    fn command_list_begin(&self, list: NativeCommandList) -> RhiResult<()> {
        let mut state = self.state.lock();
        let object = state
            .lists
            .get_mut(&list.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("begin of unknown {list:?}")))?;
        if object.state == ListState::Recording {
            return Err(RhiError::InvalidArgument(format!("{list:?} is already recording")));
        }
        object.state = ListState::Recording;
        object.in_render_pass = false;
        object.commands.clear();
        Ok(())
    }

    fn command_list_end(&self, list: NativeCommandList) -> RhiResult<()> {
        let mut state = self.state.lock();
        let object = state
            .lists
            .get_mut(&list.0)
            .ok_or_else(|| RhiError::InvalidHandle(format!("end of unknown {list:?}")))?;
        if object.state != ListState::Recording {
            return Err(RhiError::InvalidArgument(format!("{list:?} is not recording")));
        }
        if object.in_render_pass {
            return Err(RhiError::InvalidArgument(format!(
                "{list:?} ended inside a render pass"
            )));
        }
        object.state = ListState::Executable;
        Ok(())
    }

    fn cmd_begin_render_pass(&self, list: NativeCommandList, begin: &RenderPassBegin<'_>) {
        let mut nested = false;
        self.record(list, "begin_render_pass", |object, _| {
            if object.in_render_pass {
                nested = true;
                return;
            }
            object.in_render_pass = true;
            object.commands.push(Command::BeginRenderPass {
                render_pass: begin.render_pass.0,
                color_views: begin.color_views.iter().map(|v| v.0).collect(),
                clear_values: begin.clear_values.to_vec(),
            });
        });
        if nested {
            self.state.lock().invalid(format!("nested render pass on {list:?}"));
        }
    }

    fn cmd_end_render_pass(&self, list: NativeCommandList) {
        let mut outside = false;
        self.record(list, "end_render_pass", |object, _| {
            outside = !object.in_render_pass;
            object.in_render_pass = false;
        });
        if outside {
            self.state
                .lock()
                .invalid(format!("end_render_pass on {list:?} without a begun pass"));
        }
    }

    fn cmd_bind_pipeline(&self, list: NativeCommandList, _pipeline: NativePipeline) {
        self.record(list, "bind_pipeline", |_, stats| stats.bind_pipeline_calls += 1);
    }

    fn cmd_bind_descriptor_sets(
        &self,
        list: NativeCommandList,
        _layout: NativePipelineLayout,
        _first_set: u32,
        sets: &[NativeDescriptorSet],
    ) {
        self.record(list, "bind_descriptor_sets", |_, stats| {
            stats.bind_descriptor_set_calls += sets.len() as u64;
        });
    }

    fn cmd_bind_vertex_buffers(
        &self,
        list: NativeCommandList,
        _first_binding: u32,
        buffers: &[NativeBuffer],
        offsets: &[u64],
    ) {
        let mismatched = buffers.len() != offsets.len();
        self.record(list, "bind_vertex_buffers", |_, _| {});
        if mismatched {
            self.state
                .lock()
                .invalid("bind_vertex_buffers with mismatched buffer and offset counts");
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        list: NativeCommandList,
        _buffer: NativeBuffer,
        _offset: u64,
        _index_type: IndexType,
    ) {
        self.record(list, "bind_index_buffer", |_, _| {});
    }

    fn cmd_set_viewport(&self, list: NativeCommandList, _viewport: &Viewport) {
        self.record(list, "set_viewport", |_, _| {});
    }

    fn cmd_set_scissor(&self, list: NativeCommandList, _scissor: &Rect2D) {
        self.record(list, "set_scissor", |_, _| {});
    }

    fn cmd_draw(
        &self,
        list: NativeCommandList,
        _vertex_count: u32,
        _instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record_in_pass(list, "draw", |stats| stats.draw_calls += 1);
    }

    fn cmd_draw_indexed(
        &self,
        list: NativeCommandList,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record_in_pass(list, "draw_indexed", |stats| stats.draw_calls += 1);
    }

    fn cmd_copy_buffer(
        &self,
        list: NativeCommandList,
        src: NativeBuffer,
        dst: NativeBuffer,
        regions: &[BufferCopy],
    ) {
        self.record(list, "copy_buffer", |object, _| {
            object.commands.push(Command::CopyBuffer {
                src: src.0,
                dst: dst.0,
                regions: regions.to_vec(),
            });
        });
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        list: NativeCommandList,
        src: NativeBuffer,
        dst: NativeTexture,
        _dst_layout: TextureLayout,
        regions: &[BufferTextureCopy],
    ) {
        self.record(list, "copy_buffer_to_texture", |object, _| {
            object.commands.push(Command::CopyBufferToTexture {
                src: src.0,
                dst: dst.0,
                regions: regions.to_vec(),
            });
        });
    }

    fn cmd_pipeline_barrier(&self, list: NativeCommandList, barriers: &[TextureBarrier]) {
        self.record(list, "pipeline_barrier", |object, _| {
            object.commands.push(Command::Barrier(barriers.to_vec()));
        });
    }

    fn queue_execute(&self, _queue: QueueType, submit: &QueueSubmit<'_>) -> RhiResult<()> {
        let mut state = self.state.lock();
        for list in submit.lists {
            match state.lists.get(&list.0).map(|l| l.state) {
                Some(ListState::Executable) => {}
                Some(other) => {
                    return Err(RhiError::InvalidArgument(format!(
                        "{list:?} submitted in the {other:?} state"
                    )));
                }
                None => return Err(RhiError::InvalidHandle(format!("submit of unknown {list:?}"))),
            }
        }
        if let Some(fence) = submit.fence {
            match state.fences.get(&fence.0).copied() {
                Some(false) => {}
                Some(true) => state.invalid(format!("{fence:?} submitted while signaled")),
                None => return Err(RhiError::InvalidHandle(format!("submit with unknown {fence:?}"))),
            }
        }

        for list in submit.lists {
            let commands = state
                .lists
                .get_mut(&list.0)
                .map(|l| std::mem::take(&mut l.commands))
                .unwrap_or_default();
            for command in &commands {
                state.execute(command);
            }
            if let Some(object) = state.lists.get_mut(&list.0) {
                object.commands = commands;
            }
        }

        if let Some(fence) = submit.fence {
            state.fences.insert(fence.0, true);
        }
        state.stats.submissions += 1;
        Ok(())
    }

    fn device_wait_idle(&self) -> RhiResult<()> {
        Ok(())
    }

    fn fence_create(&self, signaled: bool) -> RhiResult<NativeFence> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.fences.insert(id, signaled);
        Ok(NativeFence(id))
    }

    fn fence_destroy(&self, fence: NativeFence) {
        let mut state = self.state.lock();
        if state.fences.remove(&fence.0).is_none() {
            state.invalid(format!("destroy of unknown {fence:?}"));
        }
    }

    fn fence_wait_for(&self, fences: &[NativeFence]) -> RhiResult<()> {
        let state = self.state.lock();
        for fence in fences {
            match state.fences.get(&fence.0) {
                Some(true) => {}
                // Work executes at submission, so an unsignaled fence would
                // block forever.
                Some(false) => {
                    return Err(RhiError::Backend(format!("wait on {fence:?}, which was never submitted")));
                }
                None => return Err(RhiError::InvalidHandle(format!("wait on unknown {fence:?}"))),
            }
        }
        Ok(())
    }

    fn fence_reset(&self, fences: &[NativeFence]) -> RhiResult<()> {
        let mut state = self.state.lock();
        for fence in fences {
            let signaled = state
                .fences
                .get_mut(&fence.0)
                .ok_or_else(|| RhiError::InvalidHandle(format!("reset of unknown {fence:?}")))?;
            *signaled = false;
        }
        Ok(())
    }

    fn semaphore_create(&self) -> RhiResult<NativeSemaphore> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.semaphores.insert(id, ());
        Ok(NativeSemaphore(id))
    }

    fn semaphore_destroy(&self, semaphore: NativeSemaphore) {
        let mut state = self.state.lock();
        if state.semaphores.remove(&semaphore.0).is_none() {
            state.invalid(format!("destroy of unknown {semaphore:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BufferUsage, MemoryUsage};

    fn recording_list(backend: &HeadlessBackend) -> (NativeCommandPool, NativeCommandList) {
        let pool = backend.command_pool_create(QueueType::Graphics).unwrap();
        let list = backend.command_list_allocate(pool).unwrap();
        backend.command_list_begin(list).unwrap();
        (pool, list)
    }

    fn submit(backend: &HeadlessBackend, list: NativeCommandList, fence: Option<NativeFence>) {
        backend.command_list_end(list).unwrap();
        backend
            .queue_execute(
                QueueType::Graphics,
                &QueueSubmit {
                    lists: &[list],
                    fence,
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn test_map_writes_are_visible() {
        let backend = HeadlessBackend::new();
        let buffer = backend
            .buffer_create(&BufferInfo::new(8, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu))
            .unwrap();
        let ptr = backend.buffer_map(buffer).unwrap();
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 8) };
        backend.buffer_unmap(buffer);
        assert_eq!(backend.buffer_contents(buffer), Some(vec![0x5A; 8]));
        backend.buffer_destroy(buffer);
    }

    #[test]
    fn test_gpu_only_buffer_cannot_be_mapped() {
        let backend = HeadlessBackend::new();
        let buffer = backend
            .buffer_create(&BufferInfo::new(8, BufferUsage::VERTEX, MemoryUsage::GpuOnly))
            .unwrap();
        assert!(matches!(backend.buffer_map(buffer), Err(RhiError::InvalidArgument(_))));
        backend.buffer_destroy(buffer);
    }

    #[test]
    fn test_copy_executes_on_submit_and_signals_fence() {
        let backend = HeadlessBackend::new();
        let src = backend.buffer_create(&BufferInfo::staging(4)).unwrap();
        let dst = backend
            .buffer_create(&BufferInfo::new(4, BufferUsage::TRANSFER_DST, MemoryUsage::GpuToCpu))
            .unwrap();
        let ptr = backend.buffer_map(src).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr.as_ptr(), 4) };
        let fence = backend.fence_create(false).unwrap();

        let (_, list) = recording_list(&backend);
        backend.cmd_copy_buffer(
            list,
            src,
            dst,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 4,
            }],
        );
        assert_eq!(backend.buffer_contents(dst), Some(vec![0; 4]));

        submit(&backend, list, Some(fence));
        assert_eq!(backend.buffer_contents(dst), Some(vec![1, 2, 3, 4]));
        backend.fence_wait_for(&[fence]).unwrap();
        assert_eq!(backend.stats().validation_errors, 0);
    }

    #[test]
    fn test_barriers_track_layout() {
        let backend = HeadlessBackend::new();
        let info = TextureInfo::new_2d(Format::Rgba8Unorm, 2, 2, TextureUsage::SAMPLED);
        let texture = backend.texture_create(&info).unwrap();
        let (_, list) = recording_list(&backend);
        backend.cmd_pipeline_barrier(
            list,
            &[TextureBarrier {
                texture,
                old_layout: TextureLayout::Undefined,
                new_layout: TextureLayout::ShaderReadOnly,
            }],
        );
        submit(&backend, list, None);
        assert_eq!(backend.texture_layout(texture), Some(TextureLayout::ShaderReadOnly));
    }

    #[test]
    fn test_layout_mismatch_is_flagged() {
        let backend = HeadlessBackend::new();
        let info = TextureInfo::new_2d(Format::Rgba8Unorm, 2, 2, TextureUsage::SAMPLED);
        let texture = backend.texture_create(&info).unwrap();
        let (_, list) = recording_list(&backend);
        backend.cmd_pipeline_barrier(
            list,
            &[TextureBarrier {
                texture,
                old_layout: TextureLayout::TransferDst,
                new_layout: TextureLayout::ShaderReadOnly,
            }],
        );
        submit(&backend, list, None);
        assert_eq!(backend.stats().validation_errors, 1);
    }

    #[test]
    fn test_draw_outside_render_pass_is_flagged() {
        let backend = HeadlessBackend::new();
        let (_, list) = recording_list(&backend);
        backend.cmd_draw(list, 3, 1, 0, 0);
        let stats = backend.stats();
        assert_eq!(stats.draw_calls, 0);
        assert_eq!(stats.validation_errors, 1);
    }

    #[test]
    fn test_injected_failure_hits_once() {
        let backend = HeadlessBackend::new();
        backend.fail_next_create();
        let info = BufferInfo::staging(4);
        assert!(matches!(backend.buffer_create(&info), Err(RhiError::OutOfMemory(_))));
        let buffer = backend.buffer_create(&info).unwrap();
        backend.buffer_destroy(buffer);
    }

    #[test]
    fn test_swapchain_rotates_and_owns_backbuffers() {
        let backend = HeadlessBackend::new();
        let info = SwapchainInfo {
            width: 4,
            height: 4,
            image_count: 2,
            ..Default::default()
        };
        let swapchain = backend
            .swapchain_create(&info, &HeadlessBackend::surface_target())
            .unwrap();
        assert_eq!(backend.swapchain_backbuffer_textures(swapchain).len(), 2);

        let first = backend.swapchain_acquire_image(swapchain).unwrap();
        let second = backend.swapchain_acquire_image(swapchain).unwrap();
        let third = backend.swapchain_acquire_image(swapchain).unwrap();
        assert_eq!((first.index, second.index, third.index), (0, 1, 0));
        assert_eq!(backend.swapchain_backbuffer_index(swapchain), 0);

        let texture = backend.swapchain_backbuffer_textures(swapchain)[0];
        backend.texture_destroy(texture);
        assert_eq!(backend.stats().validation_errors, 1);

        backend.swapchain_destroy(swapchain);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_pool_destroy_releases_lists() {
        let backend = HeadlessBackend::new();
        let (pool, _) = recording_list(&backend);
        backend.command_pool_destroy(pool);
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn test_encode_color_swizzles_bgra() {
        assert_eq!(encode_color(Format::Rgba8Unorm, [1.0, 0.0, 0.0, 1.0]), Some([255, 0, 0, 255]));
        assert_eq!(encode_color(Format::Bgra8Srgb, [1.0, 0.0, 0.0, 1.0]), Some([0, 0, 255, 255]));
        assert_eq!(encode_color(Format::R32Float, [1.0; 4]), None);
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HeadlessBackend>();
    }
}
