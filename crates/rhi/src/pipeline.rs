//! Graphics pipeline state.
//!
//! A graphics pipeline is split in two halves that command lists cache
//! independently:
//!
//! - [`PipelineRenderPassState`] describes what the pass expects of every
//!   draw: blending per color attachment, depth testing, sample count.
//! - [`PipelineInstanceState`] describes the draw itself: pipeline layout,
//!   shaders, vertex layout, and rasterization.
//!
//! Together with the current [`RenderPassInfo`] they form the
//! [`GraphicsPipelineKey`] the device caches native pipelines under. None of
//! these types carry floating point values, so structural equality is exact
//! and hashing is stable.
//!
//! # Example
//!
//! ```
//! use forge_rhi::handle::{PipelineLayoutHandle, ShaderHandle, TypedHandle};
//! use forge_rhi::pipeline::{CullMode, PipelineInstanceState, PrimitiveTopology};
//!
//! let layout = PipelineLayoutHandle::from_index(0);
//! let vs = ShaderHandle::from_index(0);
//! let fs = ShaderHandle::from_index(1);
//!
//! let state = PipelineInstanceState::new(layout, vs)
//!     .with_fragment_shader(fs)
//!     .with_topology(PrimitiveTopology::TriangleStrip)
//!     .with_cull_mode(CullMode::None);
//! assert_eq!(state, state.clone());
//! ```

use bitflags::bitflags;

use crate::handle::{PipelineLayoutHandle, ShaderHandle};
use crate::render_pass::RenderPassInfo;
use crate::types::Format;

/// Primitive topology for input assembly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    /// Points
    PointList,
    /// Lines (pairs of vertices)
    LineList,
    /// Connected line strip
    LineStrip,
    /// Triangles (triplets of vertices)
    #[default]
    TriangleList,
    /// Connected triangle strip
    TriangleStrip,
    /// Triangle fan
    TriangleFan,
}

/// Polygon rasterization mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    /// Filled polygons
    #[default]
    Fill,
    /// Wireframe
    Line,
    /// Points at vertices
    Point,
}

/// Face culling mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    /// No culling
    None,
    /// Cull front faces
    Front,
    /// Cull back faces
    #[default]
    Back,
    /// Cull both
    FrontAndBack,
}

/// Winding order of front faces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    /// Counter-clockwise is front
    #[default]
    CounterClockwise,
    /// Clockwise is front
    Clockwise,
}

/// Comparison operator for depth testing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

/// Blend factor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
}

/// Blend operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

bitflags! {
    /// Color channels written by an attachment.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ColorWriteMask: u8 {
        const R = 1 << 0;
        const G = 1 << 1;
        const B = 1 << 2;
        const A = 1 << 3;
        const RGBA = Self::R.bits() | Self::G.bits() | Self::B.bits() | Self::A.bits();
    }
}

/// Color blend configuration of one attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: BlendFactor,
    pub dst_color_blend_factor: BlendFactor,
    pub color_blend_op: BlendOp,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
    pub color_write_mask: ColorWriteMask,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::Zero,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
            alpha_blend_op: BlendOp::Add,
            color_write_mask: ColorWriteMask::RGBA,
        }
    }
}

impl ColorBlendAttachment {
    /// Standard alpha blending: `src * src_alpha + dst * (1 - src_alpha)`.
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: BlendFactor::SrcAlpha,
            dst_color_blend_factor: BlendFactor::OneMinusSrcAlpha,
            ..Self::default()
        }
    }
}

/// Whether a vertex binding advances per vertex or per instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VertexInputRate {
    #[default]
    Vertex,
    Instance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: Format,
    pub offset: u32,
}

/// Vertex input description.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binding(mut self, binding: u32, stride: u32, input_rate: VertexInputRate) -> Self {
        self.bindings.push(VertexBinding {
            binding,
            stride,
            input_rate,
        });
        self
    }

    pub fn with_attribute(mut self, location: u32, binding: u32, format: Format, offset: u32) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            binding,
            format,
            offset,
        });
        self
    }
}

/// Pass-level half of a graphics pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineRenderPassState {
    /// One entry per color attachment of the pass.
    pub blend_attachments: Vec<ColorBlendAttachment>,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,
    pub samples: u8,
}

impl Default for PipelineRenderPassState {
    fn default() -> Self {
        Self {
            blend_attachments: vec![ColorBlendAttachment::default()],
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare_op: CompareOp::Less,
            samples: 1,
        }
    }
}

impl PipelineRenderPassState {
    /// Depth test and write with the given compare op.
    pub fn with_depth(mut self, compare_op: CompareOp) -> Self {
        self.depth_test_enable = true;
        self.depth_write_enable = true;
        self.depth_compare_op = compare_op;
        self
    }

    pub fn with_blend_attachments(mut self, attachments: Vec<ColorBlendAttachment>) -> Self {
        self.blend_attachments = attachments;
        self
    }
}

/// Draw-level half of a graphics pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineInstanceState {
    pub layout: PipelineLayoutHandle,
    pub vertex_shader: ShaderHandle,
    pub fragment_shader: Option<ShaderHandle>,
    pub vertex_layout: VertexLayout,
    pub topology: PrimitiveTopology,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
}

impl PipelineInstanceState {
    pub fn new(layout: PipelineLayoutHandle, vertex_shader: ShaderHandle) -> Self {
        Self {
            layout,
            vertex_shader,
            fragment_shader: None,
            vertex_layout: VertexLayout::default(),
            topology: PrimitiveTopology::default(),
            polygon_mode: PolygonMode::default(),
            cull_mode: CullMode::default(),
            front_face: FrontFace::default(),
        }
    }

    #[inline]
    pub fn with_fragment_shader(mut self, shader: ShaderHandle) -> Self {
        self.fragment_shader = Some(shader);
        self
    }

    #[inline]
    pub fn with_vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    #[inline]
    pub fn with_topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    #[inline]
    pub fn with_polygon_mode(mut self, mode: PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    #[inline]
    pub fn with_cull_mode(mut self, mode: CullMode) -> Self {
        self.cull_mode = mode;
        self
    }

    #[inline]
    pub fn with_front_face(mut self, face: FrontFace) -> Self {
        self.front_face = face;
        self
    }
}

/// Everything that identifies a native graphics pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineKey {
    pub render_pass: RenderPassInfo,
    pub render_pass_state: PipelineRenderPassState,
    pub instance_state: PipelineInstanceState,
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use super::*;
    use crate::handle::TypedHandle;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn instance() -> PipelineInstanceState {
        PipelineInstanceState::new(PipelineLayoutHandle::from_index(0), ShaderHandle::from_index(0))
            .with_fragment_shader(ShaderHandle::from_index(1))
            .with_vertex_layout(
                VertexLayout::new()
                    .with_binding(0, 20, VertexInputRate::Vertex)
                    .with_attribute(0, 0, Format::Rg32Float, 0)
                    .with_attribute(1, 0, Format::Rgb32Float, 8),
            )
    }

    #[test]
    fn test_defaults() {
        assert_eq!(PrimitiveTopology::default(), PrimitiveTopology::TriangleList);
        assert_eq!(PolygonMode::default(), PolygonMode::Fill);
        assert_eq!(CullMode::default(), CullMode::Back);
        assert_eq!(FrontFace::default(), FrontFace::CounterClockwise);
        assert_eq!(CompareOp::default(), CompareOp::Less);
        assert_eq!(BlendOp::default(), BlendOp::Add);
    }

    #[test]
    fn test_alpha_blend_attachment() {
        let blend = ColorBlendAttachment::alpha_blend();
        assert!(blend.blend_enable);
        assert_eq!(blend.src_color_blend_factor, BlendFactor::SrcAlpha);
        assert_eq!(blend.dst_color_blend_factor, BlendFactor::OneMinusSrcAlpha);
        assert_eq!(blend.color_write_mask, ColorWriteMask::RGBA);
        assert!(!ColorBlendAttachment::default().blend_enable);
    }

    #[test]
    fn test_equal_states_hash_equal() {
        let a = instance();
        let b = instance();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));

        let c = instance().with_cull_mode(CullMode::None);
        assert_ne!(a, c);
    }

    #[test]
    fn test_render_pass_state_with_depth() {
        let state = PipelineRenderPassState::default().with_depth(CompareOp::LessOrEqual);
        assert!(state.depth_test_enable);
        assert!(state.depth_write_enable);
        assert_eq!(state.depth_compare_op, CompareOp::LessOrEqual);
        assert_eq!(state.blend_attachments.len(), 1);
    }
}
