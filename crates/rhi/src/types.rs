//! Backend-agnostic resource descriptions.
//!
//! The create infos here are what the device stores next to each native
//! object, and what backends translate into native create calls.

use bitflags::bitflags;

use crate::handle::TextureHandle;

/// Texel and vertex attribute formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Format {
    #[default]
    Undefined,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    R16Float,
    Rgba16Float,
    R32Uint,
    R32Float,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    D32Float,
    D24UnormS8Uint,
    D32FloatS8Uint,
}

impl Format {
    /// Size in bytes of one texel (or one vertex attribute).
    pub fn texel_size(self) -> u32 {
        match self {
            Format::Undefined => 0,
            Format::R8Unorm => 1,
            Format::Rg8Unorm | Format::R16Float => 2,
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::R32Uint
            | Format::R32Float
            | Format::D32Float
            | Format::D24UnormS8Uint => 4,
            Format::Rgba16Float | Format::Rg32Float | Format::D32FloatS8Uint => 8,
            Format::Rgb32Float => 12,
            Format::Rgba32Float => 16,
        }
    }

    #[inline]
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Format::D32Float | Format::D24UnormS8Uint | Format::D32FloatS8Uint
        )
    }

    #[inline]
    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32FloatS8Uint)
    }
}

bitflags! {
    /// How a buffer will be used.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
    }
}

bitflags! {
    /// How a texture will be used.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

bitflags! {
    /// Shader stages that can see a binding.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const ALL_GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

/// A single shader stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn flags(self) -> ShaderStages {
        match self {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
            ShaderStage::Compute => ShaderStages::COMPUTE,
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::Compute => "compute",
        };
        f.write_str(name)
    }
}

/// Where a resource's memory lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Device-local, not mappable. Initial data goes through a staging copy.
    #[default]
    GpuOnly,
    /// Host-visible memory the CPU writes and the GPU reads.
    CpuToGpu,
    /// Host-visible memory the GPU writes and the CPU reads back.
    GpuToCpu,
}

impl MemoryUsage {
    /// Whether the memory can be mapped.
    #[inline]
    pub fn is_cpu_visible(self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }
}

/// Layout a texture is in for a given kind of access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureLayout {
    #[default]
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

/// Kind of queue a command list is submitted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}

impl QueueType {
    pub const COUNT: usize = 3;
    pub const ALL: [QueueType; Self::COUNT] =
        [QueueType::Graphics, QueueType::Compute, QueueType::Transfer];

    /// Position of this queue in per-queue tables.
    #[inline]
    pub const fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    #[default]
    D2,
    D3,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    #[default]
    U32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

/// Create info for a buffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferInfo {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryUsage,
}

impl BufferInfo {
    pub fn new(size: u64, usage: BufferUsage, memory: MemoryUsage) -> Self {
        Self {
            size,
            usage,
            memory,
        }
    }

    /// A CPU-visible transfer source.
    pub fn staging(size: u64) -> Self {
        Self::new(size, BufferUsage::TRANSFER_SRC, MemoryUsage::CpuToGpu)
    }
}

/// Create info for a texture.
///
/// `layout` is the layout the texture is left in once creation (and any
/// initial upload) has been recorded. `Undefined` leaves it untouched.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureInfo {
    pub dimension: TextureDimension,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u8,
    pub usage: TextureUsage,
    pub memory: MemoryUsage,
    pub layout: TextureLayout,
}

impl TextureInfo {
    /// A single-mip, single-layer 2D texture in device memory.
    pub fn new_2d(format: Format, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            dimension: TextureDimension::D2,
            format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            usage,
            memory: MemoryUsage::GpuOnly,
            layout: TextureLayout::Undefined,
        }
    }

    #[inline]
    pub fn with_layout(mut self, layout: TextureLayout) -> Self {
        self.layout = layout;
        self
    }

    #[inline]
    pub fn with_memory(mut self, memory: MemoryUsage) -> Self {
        self.memory = memory;
        self
    }

    /// Bytes of tightly packed texel data for mip 0 of every layer.
    pub fn base_level_size(&self) -> u64 {
        u64::from(self.width)
            * u64::from(self.height)
            * u64::from(self.depth)
            * u64::from(self.array_layers)
            * u64::from(self.format.texel_size())
    }
}

/// Create info for a texture view.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureViewInfo {
    pub texture: TextureHandle,
    pub format: Format,
    pub base_mip_level: u32,
    pub mip_level_count: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
}

impl TextureViewInfo {
    /// A view of mip 0, layer 0 of `texture`.
    pub fn new(texture: TextureHandle, format: Format) -> Self {
        Self {
            texture,
            format,
            base_mip_level: 0,
            mip_level_count: 1,
            base_array_layer: 0,
            array_layer_count: 1,
        }
    }
}

/// Create info for a sampler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerInfo {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    /// Maximum anisotropy, 0 disables anisotropic filtering.
    pub max_anisotropy: u8,
}

/// Create info for a shader module.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderInfo {
    pub stage: ShaderStage,
    /// SPIR-V bytecode, little endian.
    pub code: Vec<u8>,
    pub entry_point: String,
}

impl ShaderInfo {
    pub fn new(stage: ShaderStage, code: Vec<u8>) -> Self {
        Self {
            stage,
            code,
            entry_point: "main".to_string(),
        }
    }
}

/// Kind of resource a descriptor binding holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    Sampler,
    SampledTexture,
}

/// One binding in a descriptor set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorBindingInfo {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub stages: ShaderStages,
}

impl DescriptorBindingInfo {
    pub fn new(binding: u32, kind: DescriptorKind, stages: ShaderStages) -> Self {
        Self {
            binding,
            kind,
            stages,
        }
    }
}

/// Bindings of one descriptor set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutInfo {
    pub bindings: Vec<DescriptorBindingInfo>,
}

/// Create info for a pipeline layout: the descriptor sets a pipeline expects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PipelineLayoutInfo {
    pub sets: Vec<DescriptorSetLayoutInfo>,
}

impl PipelineLayoutInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a set with the given bindings.
    pub fn with_set(mut self, bindings: Vec<DescriptorBindingInfo>) -> Self {
        self.sets.push(DescriptorSetLayoutInfo { bindings });
        self
    }

    /// The binding declared at `(set, binding)`, if any.
    pub fn declared(&self, set: u32, binding: u32) -> Option<&DescriptorBindingInfo> {
        self.sets
            .get(set as usize)?
            .bindings
            .iter()
            .find(|b| b.binding == binding)
    }

    /// Whether set `set` declares any binding.
    pub fn declares_set(&self, set: u32) -> bool {
        self.sets
            .get(set as usize)
            .is_some_and(|s| !s.bindings.is_empty())
    }
}

/// Create info for a swapchain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SwapchainInfo {
    pub width: u32,
    pub height: u32,
    /// Preferred backbuffer format; backends fall back when unsupported.
    pub format: Format,
    /// Preferred backbuffer count.
    pub image_count: u32,
    pub vsync: bool,
}

impl Default for SwapchainInfo {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            format: Format::Bgra8Srgb,
            image_count: 3,
            vsync: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-target viewport with depth range 0..1.
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Region of a buffer-to-buffer copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Region of a buffer-to-texture copy. Buffer data is tightly packed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferTextureCopy {
    pub buffer_offset: u64,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub array_layer_count: u32,
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl BufferTextureCopy {
    /// Copies the whole of mip 0, every layer, from offset 0.
    pub fn whole(info: &TextureInfo) -> Self {
        Self {
            buffer_offset: 0,
            mip_level: 0,
            base_array_layer: 0,
            array_layer_count: info.array_layers,
            x: 0,
            y: 0,
            z: 0,
            width: info.width,
            height: info.height,
            depth: info.depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sizes() {
        assert_eq!(Format::Rgba8Unorm.texel_size(), 4);
        assert_eq!(Format::Rgb32Float.texel_size(), 12);
        assert_eq!(Format::Rgba32Float.texel_size(), 16);
        assert!(Format::D32Float.is_depth());
        assert!(!Format::D32Float.has_stencil());
        assert!(Format::D24UnormS8Uint.has_stencil());
        assert!(!Format::Bgra8Srgb.is_depth());
    }

    #[test]
    fn test_memory_usage_visibility() {
        assert!(!MemoryUsage::GpuOnly.is_cpu_visible());
        assert!(MemoryUsage::CpuToGpu.is_cpu_visible());
        assert!(MemoryUsage::GpuToCpu.is_cpu_visible());
    }

    #[test]
    fn test_texture_base_level_size() {
        let info = TextureInfo::new_2d(Format::Rgba8Unorm, 4, 4, TextureUsage::SAMPLED);
        assert_eq!(info.base_level_size(), 64);
        assert_eq!(BufferTextureCopy::whole(&info).width, 4);
    }

    #[test]
    fn test_pipeline_layout_declarations() {
        let layout = PipelineLayoutInfo::new()
            .with_set(vec![DescriptorBindingInfo::new(
                0,
                DescriptorKind::UniformBuffer,
                ShaderStages::VERTEX,
            )])
            .with_set(Vec::new())
            .with_set(vec![DescriptorBindingInfo::new(
                3,
                DescriptorKind::SampledTexture,
                ShaderStages::FRAGMENT,
            )]);

        assert!(layout.declared(0, 0).is_some());
        assert!(layout.declared(0, 1).is_none());
        assert!(!layout.declares_set(1));
        assert_eq!(
            layout.declared(2, 3).map(|b| b.kind),
            Some(DescriptorKind::SampledTexture)
        );
        assert!(layout.declared(5, 0).is_none());
    }

    #[test]
    fn test_queue_slots_are_dense() {
        for (i, queue) in QueueType::ALL.iter().enumerate() {
            assert_eq!(queue.slot(), i);
        }
    }

    #[test]
    fn test_shader_stage_flags() {
        assert_eq!(ShaderStage::Vertex.flags(), ShaderStages::VERTEX);
        assert!(ShaderStages::ALL_GRAPHICS.contains(ShaderStage::Fragment.flags()));
    }
}
