//! [`Backend`] implementation over Vulkan 1.3.
//!
//! # Overview
//!
//! Native ids are the raw Vulkan handles, except render passes and
//! swapchains which use a counter. Render passes exist only as descriptions:
//! rendering uses `VK_KHR_dynamic_rendering`, so `cmd_begin_render_pass`
//! builds the attachment list from the stored [`RenderPassInfo`] and the
//! views it is given.
//!
//! Objects needing bookkeeping (allocations, descriptor pools, shader entry
//! points, image aspects) live in tables behind one `RwLock`. Recording only
//! takes the read side, so lists on different threads record concurrently.
//!
//! Every queue type is served by the single graphics queue; submissions
//! and presents lock it.

use std::collections::HashMap;
use std::ffi::CString;
use std::io::Cursor;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk::{self, Handle};
use forge_rhi::{RhiError, RhiResult};
use forge_rhi::backend::{
    AcquiredImage, Backend, BackendFeature, DescriptorResource, DescriptorWrite, GraphicsPipelineCreate,
    NativeBuffer, NativeCommandList, NativeCommandPool, NativeDescriptorSet, NativeFence, NativePipeline,
    NativePipelineLayout, NativeRenderPass, NativeSampler, NativeSemaphore, NativeShader, NativeSwapchain,
    NativeTexture, NativeTextureView, QueueSubmit, RenderPassBegin, SurfaceTarget, TextureBarrier,
};
use forge_rhi::pipeline::ColorBlendAttachment;
use forge_rhi::render_pass::RenderPassInfo;
use forge_rhi::types::{
    BufferCopy, BufferInfo, BufferTextureCopy, DescriptorKind, Format, IndexType, PipelineLayoutInfo, QueueType,
    Rect2D, SamplerInfo, ShaderInfo, SwapchainInfo, TextureDimension, TextureInfo, TextureLayout, TextureViewInfo,
    Viewport,
};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use parking_lot::{Mutex, RwLock};
use raw_window_handle::RawDisplayHandle;
use tracing::{debug, error, info, warn};

use crate::config::VulkanConfig;
use crate::context::Context;
use crate::conversions;
use crate::error::{VulkanError, VulkanResult};
use crate::swapchain::Swapchain;

/// Descriptor sets each pool of a layout holds before another is created.
const SETS_PER_POOL: u32 = 64;

struct BufferObject {
    buffer: vk::Buffer,
    allocation: Allocation,
}

struct TextureObject {
    image: vk::Image,
    /// `None` for swapchain images.
    allocation: Option<Allocation>,
    format: Format,
    dimension: TextureDimension,
}

struct ShaderObject {
    module: vk::ShaderModule,
    stage: vk::ShaderStageFlags,
    entry_point: CString,
}

/// A pipeline layout with one growable list of descriptor pools per set.
struct LayoutObject {
    layout: vk::PipelineLayout,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    pool_sizes: Vec<Vec<vk::DescriptorPoolSize>>,
    pools: Vec<Vec<vk::DescriptorPool>>,
}

#[derive(Default)]
struct Objects {
    buffers: HashMap<u64, BufferObject>,
    textures: HashMap<u64, TextureObject>,
    shaders: HashMap<u64, ShaderObject>,
    layouts: HashMap<u64, LayoutObject>,
    /// Set to the layout and pool it came from.
    descriptor_sets: HashMap<u64, (u64, vk::DescriptorPool)>,
    render_passes: HashMap<u64, RenderPassInfo>,
}

/// The Vulkan implementation of [`Backend`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use forge_rhi::{Device, DeviceConfig};
/// use forge_vulkan::{VulkanBackend, VulkanConfig};
///
/// let backend = VulkanBackend::new(&VulkanConfig::default(), None)?;
/// let device = Device::new(Arc::new(backend), DeviceConfig::default())?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct VulkanBackend {
    objects: RwLock<Objects>,
    swapchains: Mutex<HashMap<u64, Swapchain>>,
    next_id: AtomicU64,
    context: Context,
}

impl VulkanBackend {
    /// Creates the instance, device and allocator.
    ///
    /// Without a `display` the backend renders offscreen only and
    /// `swapchain_create` reports `Unsupported`.
    ///
    /// # Errors
    ///
    /// Returns an error if Vulkan cannot be loaded or no GPU qualifies.
    pub fn new(config: &VulkanConfig, display: Option<RawDisplayHandle>) -> VulkanResult<Self> {
        let context = Context::new(config, display)?;
        info!("Vulkan backend ready on '{}'", context.physical().device_name());
        Ok(Self {
            objects: RwLock::new(Objects::default()),
            swapchains: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            context,
        })
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    #[inline]
    fn device(&self) -> &ash::Device {
        self.context.device()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    // Resources
    // ========================================================================

    fn create_buffer(&self, info: &BufferInfo) -> VulkanResult<NativeBuffer> {
        if info.size == 0 {
            return Err(VulkanError::InvalidArgument("buffer size must be non-zero".to_string()));
        }
        let device = self.device();
        let create_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(conversions::buffer_usage(info.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&create_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = self.context.allocator().lock().allocate(&AllocationCreateDesc {
            name: "buffer",
            requirements,
            location: conversions::memory_location(info.memory),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };
        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
            self.free_allocation(allocation);
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e.into());
        }

        debug!("Created buffer {:?} ({} bytes, {:?})", buffer, info.size, info.memory);
        self.objects
            .write()
            .buffers
            .insert(buffer.as_raw(), BufferObject { buffer, allocation });
        Ok(NativeBuffer(buffer.as_raw()))
    }

    fn create_texture(&self, info: &TextureInfo) -> VulkanResult<NativeTexture> {
        let device = self.device();
        let create_info = vk::ImageCreateInfo::default()
            .image_type(conversions::image_type(info.dimension))
            .format(conversions::format(info.format))
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: info.depth,
            })
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(conversions::sample_count(info.samples))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(conversions::texture_usage(info.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { device.create_image(&create_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = self.context.allocator().lock().allocate(&AllocationCreateDesc {
            name: "texture",
            requirements,
            location: conversions::memory_location(info.memory),
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e.into());
            }
        };
        if let Err(e) = unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
            self.free_allocation(allocation);
            unsafe { device.destroy_image(image, None) };
            return Err(e.into());
        }

        debug!(
            "Created texture {:?} ({}x{}x{}, {:?})",
            image, info.width, info.height, info.depth, info.format
        );
        self.objects.write().textures.insert(
            image.as_raw(),
            TextureObject {
                image,
                allocation: Some(allocation),
                format: info.format,
                dimension: info.dimension,
            },
        );
        Ok(NativeTexture(image.as_raw()))
    }

    fn create_texture_view(&self, texture: NativeTexture, info: &TextureViewInfo) -> VulkanResult<NativeTextureView> {
        let (image, format, dimension) = {
            let objects = self.objects.read();
            let object = objects
                .textures
                .get(&texture.0)
                .ok_or_else(|| VulkanError::InvalidArgument(format!("view of unknown {texture:?}")))?;
            let format = if info.format == Format::Undefined {
                object.format
            } else {
                info.format
            };
            (object.image, format, object.dimension)
        };

        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(conversions::view_type(dimension, info.array_layer_count))
            .format(conversions::format(format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(conversions::aspect(format))
                    .base_mip_level(info.base_mip_level)
                    .level_count(info.mip_level_count)
                    .base_array_layer(info.base_array_layer)
                    .layer_count(info.array_layer_count),
            );
        let view = unsafe { self.device().create_image_view(&create_info, None)? };
        Ok(NativeTextureView(view.as_raw()))
    }

    fn create_sampler(&self, info: &SamplerInfo) -> VulkanResult<NativeSampler> {
        let physical = self.context.physical();
        let anisotropy = info.max_anisotropy > 1 && physical.features.sampler_anisotropy == vk::TRUE;
        let max_anisotropy = f32::from(info.max_anisotropy).min(physical.properties.limits.max_sampler_anisotropy);

        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(conversions::filter(info.mag_filter))
            .min_filter(conversions::filter(info.min_filter))
            .mipmap_mode(conversions::mipmap_mode(info.mipmap_filter))
            .address_mode_u(conversions::address_mode(info.address_u))
            .address_mode_v(conversions::address_mode(info.address_v))
            .address_mode_w(conversions::address_mode(info.address_w))
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { max_anisotropy } else { 1.0 })
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.device().create_sampler(&create_info, None)? };
        Ok(NativeSampler(sampler.as_raw()))
    }

    fn create_shader(&self, info: &ShaderInfo) -> VulkanResult<NativeShader> {
        let code = ash::util::read_spv(&mut Cursor::new(&info.code))
            .map_err(|e| VulkanError::Shader(format!("invalid SPIR-V: {e}")))?;
        let entry_point = CString::new(info.entry_point.as_str())
            .map_err(|_| VulkanError::Shader(format!("entry point {:?} contains a NUL byte", info.entry_point)))?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { self.device().create_shader_module(&create_info, None)? };
        debug!("Created {:?} shader module ({} words)", info.stage, code.len());

        self.objects.write().shaders.insert(
            module.as_raw(),
            ShaderObject {
                module,
                stage: conversions::shader_stage(info.stage),
                entry_point,
            },
        );
        Ok(NativeShader(module.as_raw()))
    }

    fn create_pipeline_layout(&self, info: &PipelineLayoutInfo) -> VulkanResult<NativePipelineLayout> {
        let device = self.device();
        let mut set_layouts = Vec::with_capacity(info.sets.len());
        let mut pool_sizes = Vec::with_capacity(info.sets.len());

        for set in &info.sets {
            let bindings: Vec<_> = set
                .bindings
                .iter()
                .map(|binding| {
                    vk::DescriptorSetLayoutBinding::default()
                        .binding(binding.binding)
                        .descriptor_type(conversions::descriptor_type(binding.kind))
                        .descriptor_count(1)
                        .stage_flags(conversions::shader_stages(binding.stages))
                })
                .collect();
            let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            match unsafe { device.create_descriptor_set_layout(&create_info, None) } {
                Ok(set_layout) => set_layouts.push(set_layout),
                Err(e) => {
                    destroy_set_layouts(device, &set_layouts);
                    return Err(e.into());
                }
            }

            let kinds = [
                DescriptorKind::UniformBuffer,
                DescriptorKind::StorageBuffer,
                DescriptorKind::Sampler,
                DescriptorKind::SampledTexture,
            ];
            pool_sizes.push(
                kinds
                    .into_iter()
                    .filter_map(|kind| {
                        let count = set.bindings.iter().filter(|b| b.kind == kind).count() as u32;
                        (count > 0).then(|| {
                            vk::DescriptorPoolSize::default()
                                .ty(conversions::descriptor_type(kind))
                                .descriptor_count(count * SETS_PER_POOL)
                        })
                    })
                    .collect(),
            );
        }

        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = match unsafe { device.create_pipeline_layout(&create_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                destroy_set_layouts(device, &set_layouts);
                return Err(e.into());
            }
        };

        let pools = vec![Vec::new(); set_layouts.len()];
        self.objects.write().layouts.insert(
            layout.as_raw(),
            LayoutObject {
                layout,
                set_layouts,
                pool_sizes,
                pools,
            },
        );
        Ok(NativePipelineLayout(layout.as_raw()))
    }

    fn allocate_descriptor_set(
        &self,
        layout: NativePipelineLayout,
        set: u32,
        writes: &[DescriptorWrite],
    ) -> VulkanResult<NativeDescriptorSet> {
        let device = self.device();
        let mut objects = self.objects.write();
        let object = objects
            .layouts
            .get_mut(&layout.0)
            .ok_or_else(|| VulkanError::InvalidArgument(format!("set allocation from unknown {layout:?}")))?;
        let index = set as usize;
        let Some(&set_layout) = object.set_layouts.get(index) else {
            return Err(VulkanError::InvalidArgument(format!("{layout:?} declares no set {set}")));
        };
        if object.pool_sizes[index].is_empty() {
            return Err(VulkanError::InvalidArgument(format!("set {set} of {layout:?} has no bindings")));
        }

        let set_layouts = [set_layout];
        let allocate_from = |pool: vk::DescriptorPool| {
            let allocate_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&set_layouts);
            unsafe { device.allocate_descriptor_sets(&allocate_info) }
        };

        let pools = &mut object.pools[index];
        let existing = pools.last().map(|&pool| (pool, allocate_from(pool)));
        let (pool, descriptor_set) = match existing {
            Some((pool, Ok(sets))) => (pool, sets[0]),
            Some((_, Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL))) | None => {
                let create_info = vk::DescriptorPoolCreateInfo::default()
                    .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                    .max_sets(SETS_PER_POOL)
                    .pool_sizes(&object.pool_sizes[index]);
                let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };
                pools.push(pool);
                debug!("Descriptor pool {} created for set {} of {:?}", pools.len(), set, layout);
                (pool, allocate_from(pool)?[0])
            }
            Some((_, Err(e))) => return Err(e.into()),
        };

        write_descriptor_set(device, &objects, descriptor_set, writes);
        objects
            .descriptor_sets
            .insert(descriptor_set.as_raw(), (layout.0, pool));
        Ok(NativeDescriptorSet(descriptor_set.as_raw()))
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineCreate<'_>) -> VulkanResult<NativePipeline> {
        let objects = self.objects.read();
        let layout = objects
            .layouts
            .get(&desc.layout.0)
            .ok_or_else(|| VulkanError::Pipeline(format!("unknown {:?}", desc.layout)))?;

        let mut stages = Vec::with_capacity(2);
        for shader in std::iter::once(desc.vertex_shader).chain(desc.fragment_shader) {
            let object = objects
                .shaders
                .get(&shader.0)
                .ok_or_else(|| VulkanError::Pipeline(format!("unknown {shader:?}")))?;
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(object.stage)
                    .module(object.module)
                    .name(&object.entry_point),
            );
        }

        let instance = desc.instance_state;
        let vertex_bindings: Vec<_> = instance
            .vertex_layout
            .bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: conversions::input_rate(b.input_rate),
            })
            .collect();
        let vertex_attributes: Vec<_> = instance
            .vertex_layout
            .attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: conversions::format(a.format),
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(conversions::topology(instance.topology));
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(conversions::polygon_mode(instance.polygon_mode))
            .cull_mode(conversions::cull_mode(instance.cull_mode))
            .front_face(conversions::front_face(instance.front_face))
            .line_width(1.0);

        let state = desc.render_pass_state;
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(conversions::sample_count(state.samples));
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth_test_enable)
            .depth_write_enable(state.depth_write_enable)
            .depth_compare_op(conversions::compare_op(state.depth_compare_op));

        let default_blend = ColorBlendAttachment::default();
        let color_formats: Vec<_> = desc
            .render_pass_info
            .color_formats()
            .into_iter()
            .map(conversions::format)
            .collect();
        let blend_attachments: Vec<_> = (0..color_formats.len())
            .map(|i| conversions::blend_attachment(state.blend_attachments.get(i).unwrap_or(&default_blend)))
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let depth_format = desc.render_pass_info.depth_format();
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format.map_or(vk::Format::UNDEFINED, conversions::format))
            .stencil_attachment_format(
                depth_format
                    .filter(|f| f.has_stencil())
                    .map_or(vk::Format::UNDEFINED, conversions::format),
            );

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout.layout)
            .push_next(&mut rendering);

        let pipelines = unsafe {
            self.device()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, e)| match e {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => VulkanError::Vulkan(e),
            other => VulkanError::Pipeline(other.to_string()),
        })?;
        debug!("Created graphics pipeline {:?}", pipelines[0]);
        Ok(NativePipeline(pipelines[0].as_raw()))
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.context.allocator().lock().free(allocation) {
            error!("Failed to free GPU allocation: {}", e);
        }
    }

    // ========================================================================
    // Swapchain
    // ========================================================================

    fn register_backbuffers(&self, swapchain: &Swapchain) {
        let format = conversions::format_from_vk(swapchain.format());
        let mut objects = self.objects.write();
        for &image in swapchain.images() {
            objects.textures.insert(
                image.as_raw(),
                TextureObject {
                    image,
                    allocation: None,
                    format,
                    dimension: TextureDimension::D2,
                },
            );
        }
    }

    fn unregister_backbuffers(&self, swapchain: &Swapchain) {
        let mut objects = self.objects.write();
        for image in swapchain.images() {
            objects.textures.remove(&image.as_raw());
        }
    }

    fn with_swapchain<T>(
        &self,
        swapchain: NativeSwapchain,
        f: impl FnOnce(&mut Swapchain) -> VulkanResult<T>,
    ) -> VulkanResult<T> {
        let mut swapchains = self.swapchains.lock();
        let object = swapchains
            .get_mut(&swapchain.0)
            .ok_or_else(|| VulkanError::InvalidArgument(format!("unknown {swapchain:?}")))?;
        f(object)
    }

    // ========================================================================
    // Recording
    // ========================================================================

    fn image_aspect(&self, texture: NativeTexture) -> vk::ImageAspectFlags {
        match self.objects.read().textures.get(&texture.0) {
            Some(object) => conversions::aspect(object.format),
            None => {
                warn!("Barrier or copy on untracked {:?}; assuming a color image", texture);
                vk::ImageAspectFlags::COLOR
            }
        }
    }

    fn submit(&self, submit: &QueueSubmit<'_>) -> VulkanResult<()> {
        let lists: Vec<_> = submit
            .lists
            .iter()
            .map(|list| vk::CommandBufferSubmitInfo::default().command_buffer(command_buffer(*list)))
            .collect();
        let semaphore_info = |semaphore: &NativeSemaphore| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(vk::Semaphore::from_raw(semaphore.0))
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        };
        let waits: Vec<_> = submit.wait_semaphores.iter().map(semaphore_info).collect();
        let signals: Vec<_> = submit.signal_semaphores.iter().map(semaphore_info).collect();
        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&lists)
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals);
        let fence = submit
            .fence
            .map_or(vk::Fence::null(), |fence| vk::Fence::from_raw(fence.0));

        let queue = self.context.queue().lock();
        unsafe { self.device().queue_submit2(*queue, &[submit_info], fence)? };
        Ok(())
    }
}

/// Logs a backend failure and converts it for the core. An out-of-date
/// swapchain is an expected condition and is not logged.
fn failed(what: &str, err: VulkanError) -> RhiError {
    if !matches!(err, VulkanError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR)) {
        error!("Vulkan {} failed: {}", what, err);
    }
    err.into()
}

#[inline]
fn command_buffer(list: NativeCommandList) -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(list.0)
}

fn fences(fences: &[NativeFence]) -> Vec<vk::Fence> {
    fences.iter().map(|fence| vk::Fence::from_raw(fence.0)).collect()
}

fn rect(rect: &Rect2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: rect.x, y: rect.y },
        extent: vk::Extent2D {
            width: rect.width,
            height: rect.height,
        },
    }
}

fn destroy_set_layouts(device: &ash::Device, set_layouts: &[vk::DescriptorSetLayout]) {
    for &set_layout in set_layouts {
        unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
    }
}

enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

fn write_descriptor_set(
    device: &ash::Device,
    objects: &Objects,
    set: vk::DescriptorSet,
    writes: &[DescriptorWrite],
) {
    let buffer_info = |buffer: NativeBuffer, offset: u64, range: u64| {
        if !objects.buffers.contains_key(&buffer.0) {
            warn!("Descriptor write references untracked {:?}", buffer);
        }
        DescriptorInfo::Buffer(vk::DescriptorBufferInfo {
            buffer: vk::Buffer::from_raw(buffer.0),
            offset,
            range: if range == 0 { vk::WHOLE_SIZE } else { range },
        })
    };
    let infos: Vec<_> = writes
        .iter()
        .map(|write| match write.resource {
            DescriptorResource::UniformBuffer { buffer, offset, range }
            | DescriptorResource::StorageBuffer { buffer, offset, range } => buffer_info(buffer, offset, range),
            DescriptorResource::Sampler(sampler) => DescriptorInfo::Image(vk::DescriptorImageInfo {
                sampler: vk::Sampler::from_raw(sampler.0),
                ..Default::default()
            }),
            DescriptorResource::SampledTexture(view) => DescriptorInfo::Image(vk::DescriptorImageInfo {
                image_view: vk::ImageView::from_raw(view.0),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ..Default::default()
            }),
        })
        .collect();

    let vk_writes: Vec<_> = writes
        .iter()
        .zip(&infos)
        .map(|(write, info)| {
            let kind = match write.resource {
                DescriptorResource::UniformBuffer { .. } => DescriptorKind::UniformBuffer,
                DescriptorResource::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
                DescriptorResource::Sampler(_) => DescriptorKind::Sampler,
                DescriptorResource::SampledTexture(_) => DescriptorKind::SampledTexture,
            };
            let vk_write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(write.binding)
                .descriptor_type(conversions::descriptor_type(kind));
            match info {
                DescriptorInfo::Buffer(buffer) => vk_write.buffer_info(std::slice::from_ref(buffer)),
                DescriptorInfo::Image(image) => vk_write.image_info(std::slice::from_ref(image)),
            }
        })
        .collect();
    unsafe { device.update_descriptor_sets(&vk_writes, &[]) };
}

impl Backend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn support_feature(&self, feature: BackendFeature) -> bool {
        match feature {
            BackendFeature::CommandPoolTrim => true,
        }
    }

    // ========================================================================
    // Resources
    // ========================================================================

    fn buffer_create(&self, info: &BufferInfo) -> RhiResult<NativeBuffer> {
        self.create_buffer(info).map_err(|e| failed("buffer creation", e))
    }

    fn buffer_destroy(&self, buffer: NativeBuffer) {
        let Some(object) = self.objects.write().buffers.remove(&buffer.0) else {
            warn!("Destroy of untracked {:?}", buffer);
            return;
        };
        unsafe { self.device().destroy_buffer(object.buffer, None) };
        self.free_allocation(object.allocation);
    }

    fn buffer_map(&self, buffer: NativeBuffer) -> RhiResult<NonNull<u8>> {
        let objects = self.objects.read();
        let object = objects
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| VulkanError::InvalidArgument(format!("map of unknown {buffer:?}")))?;
        let ptr = object
            .allocation
            .mapped_ptr()
            .ok_or_else(|| VulkanError::InvalidArgument(format!("{buffer:?} is not CPU visible")))?;
        Ok(ptr.cast())
    }

    fn buffer_unmap(&self, _buffer: NativeBuffer) {
        // CPU-visible allocations stay persistently mapped.
    }

    fn texture_create(&self, info: &TextureInfo) -> RhiResult<NativeTexture> {
        self.create_texture(info).map_err(|e| failed("texture creation", e))
    }

    fn texture_destroy(&self, texture: NativeTexture) {
        let Some(object) = self.objects.write().textures.remove(&texture.0) else {
            warn!("Destroy of untracked {:?}", texture);
            return;
        };
        let Some(allocation) = object.allocation else {
            return;
        };
        unsafe { self.device().destroy_image(object.image, None) };
        self.free_allocation(allocation);
    }

    fn texture_view_create(&self, texture: NativeTexture, info: &TextureViewInfo) -> RhiResult<NativeTextureView> {
        self.create_texture_view(texture, info)
            .map_err(|e| failed("texture view creation", e))
    }

    fn texture_view_destroy(&self, view: NativeTextureView) {
        unsafe { self.device().destroy_image_view(vk::ImageView::from_raw(view.0), None) };
    }

    fn sampler_create(&self, info: &SamplerInfo) -> RhiResult<NativeSampler> {
        self.create_sampler(info).map_err(|e| failed("sampler creation", e))
    }

    fn sampler_destroy(&self, sampler: NativeSampler) {
        unsafe { self.device().destroy_sampler(vk::Sampler::from_raw(sampler.0), None) };
    }

    fn shader_create(&self, info: &ShaderInfo) -> RhiResult<NativeShader> {
        self.create_shader(info).map_err(|e| failed("shader creation", e))
    }

    fn shader_destroy(&self, shader: NativeShader) {
        if let Some(object) = self.objects.write().shaders.remove(&shader.0) {
            unsafe { self.device().destroy_shader_module(object.module, None) };
        }
    }

    fn pipeline_layout_create(&self, info: &PipelineLayoutInfo) -> RhiResult<NativePipelineLayout> {
        self.create_pipeline_layout(info)
            .map_err(|e| failed("pipeline layout creation", e))
    }

    fn pipeline_layout_destroy(&self, layout: NativePipelineLayout) {
        let mut objects = self.objects.write();
        let Some(object) = objects.layouts.remove(&layout.0) else {
            warn!("Destroy of untracked {:?}", layout);
            return;
        };
        // Destroying the pools frees every set allocated from them.
        objects.descriptor_sets.retain(|_, (owner, _)| *owner != layout.0);
        let device = self.device();
        unsafe {
            for pool in object.pools.into_iter().flatten() {
                device.destroy_descriptor_pool(pool, None);
            }
            device.destroy_pipeline_layout(object.layout, None);
        }
        destroy_set_layouts(device, &object.set_layouts);
    }

    fn descriptor_set_allocate(
        &self,
        layout: NativePipelineLayout,
        set: u32,
        writes: &[DescriptorWrite],
    ) -> RhiResult<NativeDescriptorSet> {
        self.allocate_descriptor_set(layout, set, writes)
            .map_err(|e| failed("descriptor set allocation", e))
    }

    fn descriptor_set_free(&self, set: NativeDescriptorSet) {
        let Some((_, pool)) = self.objects.write().descriptor_sets.remove(&set.0) else {
            return;
        };
        let sets = [vk::DescriptorSet::from_raw(set.0)];
        if let Err(e) = unsafe { self.device().free_descriptor_sets(pool, &sets) } {
            error!("Failed to free {:?}: {}", set, e);
        }
    }

    fn render_pass_create(&self, info: &RenderPassInfo) -> RhiResult<NativeRenderPass> {
        let id = self.next_id();
        self.objects.write().render_passes.insert(id, info.clone());
        Ok(NativeRenderPass(id))
    }

    fn render_pass_destroy(&self, render_pass: NativeRenderPass) {
        self.objects.write().render_passes.remove(&render_pass.0);
    }

    fn gfx_pipeline_create(&self, desc: &GraphicsPipelineCreate<'_>) -> RhiResult<NativePipeline> {
        self.create_graphics_pipeline(desc)
            .map_err(|e| failed("graphics pipeline creation", e))
    }

    fn gfx_pipeline_destroy(&self, pipeline: NativePipeline) {
        unsafe { self.device().destroy_pipeline(vk::Pipeline::from_raw(pipeline.0), None) };
    }

    // ========================================================================
    // Swapchain
    // ========================================================================

    fn swapchain_create(&self, info: &SwapchainInfo, target: &SurfaceTarget) -> RhiResult<NativeSwapchain> {
        let swapchain = Swapchain::new(&self.context, info, target).map_err(|e| failed("swapchain creation", e))?;
        self.register_backbuffers(&swapchain);
        let id = self.next_id();
        self.swapchains.lock().insert(id, swapchain);
        Ok(NativeSwapchain(id))
    }

    fn swapchain_destroy(&self, swapchain: NativeSwapchain) {
        let Some(mut object) = self.swapchains.lock().remove(&swapchain.0) else {
            warn!("Destroy of untracked {:?}", swapchain);
            return;
        };
        self.unregister_backbuffers(&object);
        object.destroy(&self.context);
    }

    fn swapchain_resize(&self, swapchain: NativeSwapchain, width: u32, height: u32) -> RhiResult<()> {
        self.with_swapchain(swapchain, |object| {
            self.unregister_backbuffers(object);
            {
                let _queue = self.context.queue().lock();
                self.context.wait_idle()?;
            }
            let resized = object.resize(&self.context, width, height);
            self.register_backbuffers(object);
            resized
        })
        .map_err(|e| failed("swapchain resize", e))
    }

    fn swapchain_acquire_image(&self, swapchain: NativeSwapchain) -> RhiResult<AcquiredImage> {
        let (index, ready) = self
            .with_swapchain(swapchain, |object| object.acquire(&self.context))
            .map_err(|e| failed("swapchain acquire", e))?;
        Ok(AcquiredImage {
            index,
            ready: NativeSemaphore(ready.as_raw()),
        })
    }

    fn swapchain_present(&self, swapchain: NativeSwapchain, wait_semaphores: &[NativeSemaphore]) -> RhiResult<()> {
        let waits: Vec<_> = wait_semaphores
            .iter()
            .map(|semaphore| vk::Semaphore::from_raw(semaphore.0))
            .collect();
        self.with_swapchain(swapchain, |object| object.present(&self.context, &waits))
            .map_err(|e| failed("swapchain present", e))
    }

    fn swapchain_backbuffer_textures(&self, swapchain: NativeSwapchain) -> Vec<NativeTexture> {
        self.swapchains
            .lock()
            .get(&swapchain.0)
            .map(|object| object.images().iter().map(|i| NativeTexture(i.as_raw())).collect())
            .unwrap_or_default()
    }

    fn swapchain_backbuffer_texture_views(&self, swapchain: NativeSwapchain) -> Vec<NativeTextureView> {
        self.swapchains
            .lock()
            .get(&swapchain.0)
            .map(|object| object.views().iter().map(|v| NativeTextureView(v.as_raw())).collect())
            .unwrap_or_default()
    }

    fn swapchain_backbuffer_index(&self, swapchain: NativeSwapchain) -> u32 {
        self.swapchains
            .lock()
            .get(&swapchain.0)
            .map_or(0, Swapchain::current_index)
    }

    fn swapchain_info(&self, swapchain: NativeSwapchain) -> SwapchainInfo {
        self.swapchains
            .lock()
            .get(&swapchain.0)
            .map(Swapchain::info)
            .unwrap_or_default()
    }

    // ========================================================================
    // Command pools and lists
    // ========================================================================

    fn command_pool_create(&self, queue: QueueType) -> RhiResult<NativeCommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default().queue_family_index(self.context.queue_family());
        let pool = unsafe { self.device().create_command_pool(&create_info, None) }
            .map_err(|e| failed("command pool creation", e.into()))?;
        debug!("Created command pool {:?} for {:?}", pool, queue);
        Ok(NativeCommandPool(pool.as_raw()))
    }

    fn command_pool_destroy(&self, pool: NativeCommandPool) {
        unsafe { self.device().destroy_command_pool(vk::CommandPool::from_raw(pool.0), None) };
    }

    fn command_pool_reset(&self, pool: NativeCommandPool) -> RhiResult<()> {
        unsafe {
            self.device()
                .reset_command_pool(vk::CommandPool::from_raw(pool.0), vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| failed("command pool reset", e.into()))?;
        Ok(())
    }

    fn command_pool_trim(&self, pool: NativeCommandPool) {
        unsafe {
            self.device()
                .trim_command_pool(vk::CommandPool::from_raw(pool.0), vk::CommandPoolTrimFlags::empty())
        };
    }

    fn command_list_allocate(&self, pool: NativeCommandPool) -> RhiResult<NativeCommandList> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk::CommandPool::from_raw(pool.0))
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device().allocate_command_buffers(&allocate_info) }
            .map_err(|e| failed("command list allocation", e.into()))?;
        Ok(NativeCommandList(buffers[0].as_raw()))
    }

    fn command_list_free(&self, pool: NativeCommandPool, list: NativeCommandList) {
        unsafe {
            self.device()
                .free_command_buffers(vk::CommandPool::from_raw(pool.0), &[command_buffer(list)])
        };
    }

    fn command_list_begin(&self, list: NativeCommandList) -> RhiResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device().begin_command_buffer(command_buffer(list), &begin_info) }
            .map_err(|e| failed("command list begin", e.into()))?;
        Ok(())
    }

    fn command_list_end(&self, list: NativeCommandList) -> RhiResult<()> {
        unsafe { self.device().end_command_buffer(command_buffer(list)) }
            .map_err(|e| failed("command list end", e.into()))?;
        Ok(())
    }

    // ========================================================================
    // Recording
    // ========================================================================

    fn cmd_begin_render_pass(&self, list: NativeCommandList, begin: &RenderPassBegin<'_>) {
        let objects = self.objects.read();
        let Some(info) = objects.render_passes.get(&begin.render_pass.0) else {
            error!("Begin of unknown {:?}; render pass skipped", begin.render_pass);
            return;
        };

        let clear_value = |index: usize| {
            begin
                .clear_values
                .get(index)
                .copied()
                .map(conversions::clear_value)
                .unwrap_or_default()
        };
        let colors: Vec<_> = info
            .color_attachments
            .iter()
            .zip(begin.color_views)
            .enumerate()
            .map(|(i, (attachment, view))| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(vk::ImageView::from_raw(view.0))
                    .image_layout(conversions::image_layout(attachment.layout))
                    .load_op(conversions::load_op(attachment.load_op))
                    .store_op(conversions::store_op(attachment.store_op))
                    .clear_value(clear_value(i))
            })
            .collect();
        let depth = info
            .depth_attachment
            .as_ref()
            .zip(begin.depth_view)
            .map(|(attachment, view)| {
                let attachment_info = vk::RenderingAttachmentInfo::default()
                    .image_view(vk::ImageView::from_raw(view.0))
                    .image_layout(conversions::image_layout(attachment.layout))
                    .load_op(conversions::load_op(attachment.load_op))
                    .store_op(conversions::store_op(attachment.store_op))
                    .clear_value(clear_value(colors.len()));
                (attachment_info, attachment.format.has_stencil())
            });

        let render_area = rect(&begin.render_area);
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&colors);
        if let Some((depth_info, stencil)) = &depth {
            rendering_info = rendering_info.depth_attachment(depth_info);
            if *stencil {
                rendering_info = rendering_info.stencil_attachment(depth_info);
            }
        }

        let device = self.device();
        let cmd = command_buffer(list);
        let viewport = vk::Viewport {
            x: render_area.offset.x as f32,
            y: render_area.offset.y as f32,
            width: render_area.extent.width as f32,
            height: render_area.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);
        }
    }

    fn cmd_end_render_pass(&self, list: NativeCommandList) {
        unsafe { self.device().cmd_end_rendering(command_buffer(list)) };
    }

    fn cmd_bind_pipeline(&self, list: NativeCommandList, pipeline: NativePipeline) {
        unsafe {
            self.device().cmd_bind_pipeline(
                command_buffer(list),
                vk::PipelineBindPoint::GRAPHICS,
                vk::Pipeline::from_raw(pipeline.0),
            )
        };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        list: NativeCommandList,
        layout: NativePipelineLayout,
        first_set: u32,
        sets: &[NativeDescriptorSet],
    ) {
        let sets: Vec<_> = sets.iter().map(|set| vk::DescriptorSet::from_raw(set.0)).collect();
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                command_buffer(list),
                vk::PipelineBindPoint::GRAPHICS,
                vk::PipelineLayout::from_raw(layout.0),
                first_set,
                &sets,
                &[],
            )
        };
    }

    fn cmd_bind_vertex_buffers(
        &self,
        list: NativeCommandList,
        first_binding: u32,
        buffers: &[NativeBuffer],
        offsets: &[u64],
    ) {
        let buffers: Vec<_> = buffers.iter().map(|buffer| vk::Buffer::from_raw(buffer.0)).collect();
        unsafe {
            self.device()
                .cmd_bind_vertex_buffers(command_buffer(list), first_binding, &buffers, offsets)
        };
    }

    fn cmd_bind_index_buffer(&self, list: NativeCommandList, buffer: NativeBuffer, offset: u64, index_type: IndexType) {
        unsafe {
            self.device().cmd_bind_index_buffer(
                command_buffer(list),
                vk::Buffer::from_raw(buffer.0),
                offset,
                conversions::index_type(index_type),
            )
        };
    }

    fn cmd_set_viewport(&self, list: NativeCommandList, viewport: &Viewport) {
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device().cmd_set_viewport(command_buffer(list), 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, list: NativeCommandList, scissor: &Rect2D) {
        unsafe { self.device().cmd_set_scissor(command_buffer(list), 0, &[rect(scissor)]) };
    }

    fn cmd_draw(
        &self,
        list: NativeCommandList,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device()
                .cmd_draw(command_buffer(list), vertex_count, instance_count, first_vertex, first_instance)
        };
    }

    fn cmd_draw_indexed(
        &self,
        list: NativeCommandList,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device().cmd_draw_indexed(
                command_buffer(list),
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_copy_buffer(&self, list: NativeCommandList, src: NativeBuffer, dst: NativeBuffer, regions: &[BufferCopy]) {
        let regions: Vec<_> = regions
            .iter()
            .map(|r| vk::BufferCopy {
                src_offset: r.src_offset,
                dst_offset: r.dst_offset,
                size: r.size,
            })
            .collect();
        // Later commands in any stage see the copied data.
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE);
        let dependency = vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
        let device = self.device();
        let cmd = command_buffer(list);
        unsafe {
            device.cmd_copy_buffer(cmd, vk::Buffer::from_raw(src.0), vk::Buffer::from_raw(dst.0), &regions);
            device.cmd_pipeline_barrier2(cmd, &dependency);
        }
    }

    fn cmd_copy_buffer_to_texture(
        &self,
        list: NativeCommandList,
        src: NativeBuffer,
        dst: NativeTexture,
        dst_layout: TextureLayout,
        regions: &[BufferTextureCopy],
    ) {
        let mut aspect = self.image_aspect(dst);
        // Copies address one aspect at a time.
        if aspect.contains(vk::ImageAspectFlags::DEPTH) {
            aspect = vk::ImageAspectFlags::DEPTH;
        }
        let regions: Vec<_> = regions
            .iter()
            .map(|r| vk::BufferImageCopy {
                buffer_offset: r.buffer_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: r.mip_level,
                    base_array_layer: r.base_array_layer,
                    layer_count: r.array_layer_count,
                },
                image_offset: vk::Offset3D {
                    x: r.x as i32,
                    y: r.y as i32,
                    z: r.z as i32,
                },
                image_extent: vk::Extent3D {
                    width: r.width,
                    height: r.height,
                    depth: r.depth,
                },
            })
            .collect();
        unsafe {
            self.device().cmd_copy_buffer_to_image(
                command_buffer(list),
                vk::Buffer::from_raw(src.0),
                vk::Image::from_raw(dst.0),
                conversions::image_layout(dst_layout),
                &regions,
            )
        };
    }

    fn cmd_pipeline_barrier(&self, list: NativeCommandList, barriers: &[TextureBarrier]) {
        let image_barriers: Vec<_> = barriers
            .iter()
            .map(|barrier| {
                let (src_stage, src_access) = conversions::layout_scope(barrier.old_layout);
                let (dst_stage, dst_access) = conversions::layout_scope(barrier.new_layout);
                vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(src_stage)
                    .src_access_mask(src_access)
                    .dst_stage_mask(dst_stage)
                    .dst_access_mask(dst_access)
                    .old_layout(conversions::image_layout(barrier.old_layout))
                    .new_layout(conversions::image_layout(barrier.new_layout))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(vk::Image::from_raw(barrier.texture.0))
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(self.image_aspect(barrier.texture))
                            .level_count(vk::REMAINING_MIP_LEVELS)
                            .layer_count(vk::REMAINING_ARRAY_LAYERS),
                    )
            })
            .collect();
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&image_barriers);
        unsafe { self.device().cmd_pipeline_barrier2(command_buffer(list), &dependency) };
    }

    // ========================================================================
    // Queues and synchronization
    // ========================================================================

    fn queue_execute(&self, _queue: QueueType, submit: &QueueSubmit<'_>) -> RhiResult<()> {
        self.submit(submit).map_err(|e| failed("queue submission", e))
    }

    fn device_wait_idle(&self) -> RhiResult<()> {
        let _queue = self.context.queue().lock();
        self.context.wait_idle().map_err(|e| failed("device idle wait", e))
    }

    fn fence_create(&self, signaled: bool) -> RhiResult<NativeFence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe { self.device().create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .map_err(|e| failed("fence creation", e.into()))?;
        Ok(NativeFence(fence.as_raw()))
    }

    fn fence_destroy(&self, fence: NativeFence) {
        unsafe { self.device().destroy_fence(vk::Fence::from_raw(fence.0), None) };
    }

    fn fence_wait_for(&self, fences_to_wait: &[NativeFence]) -> RhiResult<()> {
        if fences_to_wait.is_empty() {
            return Ok(());
        }
        unsafe { self.device().wait_for_fences(&fences(fences_to_wait), true, u64::MAX) }
            .map_err(|e| failed("fence wait", e.into()))?;
        Ok(())
    }

    fn fence_reset(&self, fences_to_reset: &[NativeFence]) -> RhiResult<()> {
        if fences_to_reset.is_empty() {
            return Ok(());
        }
        unsafe { self.device().reset_fences(&fences(fences_to_reset)) }
            .map_err(|e| failed("fence reset", e.into()))?;
        Ok(())
    }

    fn semaphore_create(&self) -> RhiResult<NativeSemaphore> {
        let semaphore = unsafe { self.device().create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .map_err(|e| failed("semaphore creation", e.into()))?;
        Ok(NativeSemaphore(semaphore.as_raw()))
    }

    fn semaphore_destroy(&self, semaphore: NativeSemaphore) {
        unsafe { self.device().destroy_semaphore(vk::Semaphore::from_raw(semaphore.0), None) };
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            error!("Failed to wait for device idle during drop: {:?}", e);
        }

        for (_, mut swapchain) in self.swapchains.get_mut().drain() {
            swapchain.destroy(&self.context);
        }

        let objects = std::mem::take(self.objects.get_mut());
        let device = self.context.device();
        let leaked = objects.buffers.len()
            + objects.textures.values().filter(|t| t.allocation.is_some()).count()
            + objects.shaders.len()
            + objects.layouts.len();
        if leaked > 0 {
            warn!("{} Vulkan object(s) still alive at shutdown; destroying them", leaked);
        }
        let mut allocator = self.context.allocator().lock();
        unsafe {
            for object in objects.buffers.into_values() {
                device.destroy_buffer(object.buffer, None);
                if let Err(e) = allocator.free(object.allocation) {
                    error!("Failed to free GPU allocation: {}", e);
                }
            }
            for object in objects.textures.into_values() {
                if let Some(allocation) = object.allocation {
                    device.destroy_image(object.image, None);
                    if let Err(e) = allocator.free(allocation) {
                        error!("Failed to free GPU allocation: {}", e);
                    }
                }
            }
            for object in objects.shaders.into_values() {
                device.destroy_shader_module(object.module, None);
            }
            for object in objects.layouts.into_values() {
                for pool in object.pools.into_iter().flatten() {
                    device.destroy_descriptor_pool(pool, None);
                }
                device.destroy_pipeline_layout(object.layout, None);
                destroy_set_layouts(device, &object.set_layouts);
            }
        }
        info!("Vulkan backend destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_rhi::types::{BufferUsage, MemoryUsage};

    fn backend() -> Option<VulkanBackend> {
        let config = VulkanConfig {
            enable_validation: false,
            ..Default::default()
        };
        match VulkanBackend::new(&config, None) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("Skipping test: Vulkan not available ({e})");
                None
            }
        }
    }

    #[test]
    fn test_backend_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VulkanBackend>();
    }

    #[test]
    fn test_mapped_buffer_round_trip() {
        let Some(backend) = backend() else { return };
        let buffer = backend
            .buffer_create(&BufferInfo {
                size: 256,
                usage: BufferUsage::UNIFORM,
                memory: MemoryUsage::CpuToGpu,
            })
            .unwrap();
        let ptr = backend.buffer_map(buffer).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0xAB, 256) };
        backend.buffer_unmap(buffer);
        backend.buffer_destroy(buffer);
    }

    #[test]
    fn test_gpu_only_buffer_cannot_be_mapped() {
        let Some(backend) = backend() else { return };
        let buffer = backend
            .buffer_create(&BufferInfo {
                size: 64,
                usage: BufferUsage::VERTEX,
                memory: MemoryUsage::GpuOnly,
            })
            .unwrap();
        assert!(matches!(backend.buffer_map(buffer), Err(forge_rhi::RhiError::InvalidArgument(_))));
        backend.buffer_destroy(buffer);
    }

    #[test]
    fn test_invalid_spirv_is_a_shader_error() {
        let Some(backend) = backend() else { return };
        let info = ShaderInfo {
            stage: forge_rhi::types::ShaderStage::Vertex,
            code: vec![1, 2, 3],
            entry_point: "main".to_string(),
        };
        assert!(matches!(backend.shader_create(&info), Err(forge_rhi::RhiError::ShaderError(_))));
    }

    #[test]
    fn test_swapchain_needs_a_display() {
        let Some(backend) = backend() else { return };
        assert!(!backend.context().instance().supports_surfaces());
    }

    #[test]
    fn test_fence_signaled_on_creation() {
        let Some(backend) = backend() else { return };
        let fence = backend.fence_create(true).unwrap();
        backend.fence_wait_for(&[fence]).unwrap();
        backend.fence_reset(&[fence]).unwrap();
        backend.fence_destroy(fence);
    }
}
