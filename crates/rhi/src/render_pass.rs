//! Render pass descriptions.
//!
//! # Overview
//!
//! - [`RenderPassInfo`] is the structural description of a pass (attachment
//!   formats, load/store behavior, layouts). It is what the device caches
//!   native render passes under, so two passes with the same attachments
//!   share one native object.
//! - [`RenderPassBeginInfo`] is what a command list is handed to start a
//!   pass: concrete texture views, clear values and the render area. The
//!   command list derives the [`RenderPassInfo`] from it.
//!
//! # Example
//!
//! ```
//! use forge_rhi::handle::{TextureViewHandle, TypedHandle};
//! use forge_rhi::render_pass::{ColorAttachment, DepthAttachment, RenderPassBeginInfo};
//!
//! # let color_view = TextureViewHandle::from_index(0);
//! # let depth_view = TextureViewHandle::from_index(1);
//! let begin = RenderPassBeginInfo::new(800, 600)
//!     .with_color_attachment(ColorAttachment::new(color_view).with_clear_color([0.1, 0.1, 0.1, 1.0]))
//!     .with_depth_attachment(DepthAttachment::new(depth_view).with_clear_depth(1.0));
//! assert_eq!(begin.color_attachments.len(), 1);
//! ```

use crate::handle::TextureViewHandle;
use crate::types::{Format, Rect2D, TextureLayout};

/// What happens to an attachment's contents when the pass begins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    #[default]
    Clear,
    DontCare,
}

/// What happens to an attachment's contents when the pass ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

/// Clear value of one attachment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// Structural description of one attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    pub format: Format,
    pub samples: u8,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    /// Layout the attachment is in for the duration of the pass.
    pub layout: TextureLayout,
}

/// Structural description of a render pass; the render pass cache key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct RenderPassInfo {
    pub color_attachments: Vec<AttachmentDesc>,
    pub depth_attachment: Option<AttachmentDesc>,
}

impl RenderPassInfo {
    /// Color formats in attachment order.
    pub fn color_formats(&self) -> Vec<Format> {
        self.color_attachments.iter().map(|a| a.format).collect()
    }

    pub fn depth_format(&self) -> Option<Format> {
        self.depth_attachment.map(|a| a.format)
    }

    /// Sample count shared by the attachments (1 for an empty pass).
    pub fn samples(&self) -> u8 {
        self.color_attachments
            .first()
            .or(self.depth_attachment.as_ref())
            .map_or(1, |a| a.samples)
    }
}

/// A color attachment of a pass being begun.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorAttachment {
    pub view: TextureViewHandle,
    pub layout: TextureLayout,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_color: [f32; 4],
}

impl ColorAttachment {
    /// Cleared to opaque black and stored, in the color attachment layout.
    #[inline]
    pub fn new(view: TextureViewHandle) -> Self {
        Self {
            view,
            layout: TextureLayout::ColorAttachment,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }

    #[inline]
    pub fn with_layout(mut self, layout: TextureLayout) -> Self {
        self.layout = layout;
        self
    }

    #[inline]
    pub fn with_load_op(mut self, load_op: LoadOp) -> Self {
        self.load_op = load_op;
        self
    }

    #[inline]
    pub fn with_store_op(mut self, store_op: StoreOp) -> Self {
        self.store_op = store_op;
        self
    }

    #[inline]
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Keeps the previous contents instead of clearing.
    #[inline]
    pub fn load(mut self) -> Self {
        self.load_op = LoadOp::Load;
        self
    }

    #[inline]
    pub fn dont_store(mut self) -> Self {
        self.store_op = StoreOp::DontCare;
        self
    }
}

/// The depth attachment of a pass being begun.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthAttachment {
    pub view: TextureViewHandle,
    pub layout: TextureLayout,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl DepthAttachment {
    /// Cleared to 1.0 and discarded after the pass.
    #[inline]
    pub fn new(view: TextureViewHandle) -> Self {
        Self {
            view,
            layout: TextureLayout::DepthStencilAttachment,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }

    #[inline]
    pub fn with_layout(mut self, layout: TextureLayout) -> Self {
        self.layout = layout;
        self
    }

    #[inline]
    pub fn with_clear_depth(mut self, depth: f32) -> Self {
        self.clear_depth = depth;
        self
    }

    #[inline]
    pub fn with_clear_stencil(mut self, stencil: u32) -> Self {
        self.clear_stencil = stencil;
        self
    }

    #[inline]
    pub fn load(mut self) -> Self {
        self.load_op = LoadOp::Load;
        self
    }

    #[inline]
    pub fn store(mut self) -> Self {
        self.store_op = StoreOp::Store;
        self
    }
}

/// Attachments and area of a render pass about to begin.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderPassBeginInfo {
    pub render_area: Rect2D,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_attachment: Option<DepthAttachment>,
}

impl RenderPassBeginInfo {
    /// A pass covering `width` x `height` with no attachments yet.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            render_area: Rect2D::new(width, height),
            color_attachments: Vec::new(),
            depth_attachment: None,
        }
    }

    pub fn with_color_attachment(mut self, attachment: ColorAttachment) -> Self {
        self.color_attachments.push(attachment);
        self
    }

    pub fn with_depth_attachment(mut self, attachment: DepthAttachment) -> Self {
        self.depth_attachment = Some(attachment);
        self
    }

    pub fn with_render_area(mut self, area: Rect2D) -> Self {
        self.render_area = area;
        self
    }

    /// Clear values in attachment order, depth last.
    pub fn clear_values(&self) -> Vec<ClearValue> {
        let mut values: Vec<ClearValue> = self
            .color_attachments
            .iter()
            .map(|a| ClearValue::Color(a.clear_color))
            .collect();
        if let Some(depth) = &self.depth_attachment {
            values.push(ClearValue::DepthStencil {
                depth: depth.clear_depth,
                stencil: depth.clear_stencil,
            });
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::TypedHandle;

    #[test]
    fn test_color_attachment_defaults() {
        let attachment = ColorAttachment::new(TextureViewHandle::from_index(0));
        assert_eq!(attachment.layout, TextureLayout::ColorAttachment);
        assert_eq!(attachment.load_op, LoadOp::Clear);
        assert_eq!(attachment.store_op, StoreOp::Store);

        let loaded = attachment.load().dont_store();
        assert_eq!(loaded.load_op, LoadOp::Load);
        assert_eq!(loaded.store_op, StoreOp::DontCare);
    }

    #[test]
    fn test_depth_attachment_defaults() {
        let attachment = DepthAttachment::new(TextureViewHandle::from_index(0));
        assert_eq!(attachment.layout, TextureLayout::DepthStencilAttachment);
        assert_eq!(attachment.store_op, StoreOp::DontCare);
        assert_eq!(attachment.clear_depth, 1.0);
        assert_eq!(attachment.store().store_op, StoreOp::Store);
    }

    #[test]
    fn test_clear_values_order() {
        let begin = RenderPassBeginInfo::new(4, 4)
            .with_color_attachment(
                ColorAttachment::new(TextureViewHandle::from_index(0)).with_clear_color([1.0; 4]),
            )
            .with_depth_attachment(
                DepthAttachment::new(TextureViewHandle::from_index(1)).with_clear_stencil(7),
            );
        let values = begin.clear_values();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], ClearValue::Color([1.0; 4]));
        assert_eq!(
            values[1],
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 7
            }
        );
    }

    #[test]
    fn test_render_pass_info_queries() {
        let desc = AttachmentDesc {
            format: Format::Rgba8Unorm,
            samples: 4,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            layout: TextureLayout::ColorAttachment,
        };
        let info = RenderPassInfo {
            color_attachments: vec![desc],
            depth_attachment: None,
        };
        assert_eq!(info.color_formats(), vec![Format::Rgba8Unorm]);
        assert_eq!(info.depth_format(), None);
        assert_eq!(info.samples(), 4);
        assert_eq!(RenderPassInfo::default().samples(), 1);
    }
}
