//! Geometry, texels and transforms the demo uploads.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};

/// Vertex layout shared with `triangle.vert`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub color: Vec3,
    pub uv: Vec2,
}

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;
    pub const COLOR_OFFSET: u32 = std::mem::offset_of!(Vertex, color) as u32;
    pub const UV_OFFSET: u32 = std::mem::offset_of!(Vertex, uv) as u32;
}

/// Uniform block of `triangle.vert`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Transform {
    pub model_view_projection: Mat4,
}

/// Bytes between two transforms in the uniform buffer; the largest
/// `minUniformBufferOffsetAlignment` drivers report.
pub const TRANSFORM_STRIDE: u64 = 256;

pub fn triangle() -> [Vertex; 3] {
    [
        Vertex {
            position: Vec3::new(0.0, -0.5, 0.0),
            color: Vec3::new(1.0, 0.0, 0.0),
            uv: Vec2::new(0.5, 0.0),
        },
        Vertex {
            position: Vec3::new(0.5, 0.5, 0.0),
            color: Vec3::new(0.0, 1.0, 0.0),
            uv: Vec2::new(1.0, 1.0),
        },
        Vertex {
            position: Vec3::new(-0.5, 0.5, 0.0),
            color: Vec3::new(0.0, 0.0, 1.0),
            uv: Vec2::new(0.0, 1.0),
        },
    ]
}

/// RGBA8 checkerboard of `size`x`size` texels with `cell`-texel squares.
pub fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    let cell = cell.max(1);
    let mut texels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            let value = if light { 230 } else { 40 };
            texels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    texels
}

/// Transform of one worker's triangles in `frame`: the workers are spread
/// around a circle that turns a little every frame.
pub fn worker_transform(worker: usize, workers: usize, frame: u32, aspect: f32) -> Transform {
    let spread = std::f32::consts::TAU * worker as f32 / workers.max(1) as f32;
    let angle = spread + frame as f32 * 0.1;
    let projection = Mat4::orthographic_rh(-aspect, aspect, -1.0, 1.0, -1.0, 1.0);
    let model = Mat4::from_rotation_z(angle)
        * Mat4::from_translation(Vec3::new(0.45, 0.0, 0.0))
        * Mat4::from_scale(Vec3::splat(0.4));
    Transform {
        model_view_projection: projection * model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(Vertex::STRIDE, 32);
        assert_eq!(Vertex::COLOR_OFFSET, 12);
        assert_eq!(Vertex::UV_OFFSET, 24);
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&triangle()).len(), 96);
    }

    #[test]
    fn test_checkerboard_alternates() {
        let texels = checkerboard(4, 2);
        assert_eq!(texels.len(), 64);
        // (0, 0) light, (2, 0) dark, (2, 2) light
        assert_eq!(texels[0], 230);
        assert_eq!(texels[2 * 4], 40);
        assert_eq!(texels[(2 * 4 + 2) * 4], 230);
        assert!(texels.chunks(4).all(|t| t[3] == 255));
    }

    #[test]
    fn test_transform_fits_uniform_stride() {
        assert!(std::mem::size_of::<Transform>() as u64 <= TRANSFORM_STRIDE);
        let a = worker_transform(0, 4, 0, 1.0);
        let b = worker_transform(1, 4, 0, 1.0);
        assert_ne!(a, b);
    }
}
