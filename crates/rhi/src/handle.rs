//! Opaque, type-tagged resource handles.
//!
//! # Overview
//!
//! Every GPU object owned by a [`Device`](crate::device::Device) is named by a
//! [`DeviceResourceHandle`]: a 64-bit value packing the arena index in the
//! high 56 bits and a [`ResourceType`] tag in the low 8 bits. The packed form
//! is what frame bookkeeping stores; engine code uses the typed wrappers
//! ([`BufferHandle`], [`TextureHandle`], ...) so a texture handle can never
//! be passed where a buffer is expected.
//!
//! # Example
//!
//! ```
//! use forge_rhi::handle::{BufferHandle, DeviceResourceHandle, ResourceType, TypedHandle};
//!
//! let raw = DeviceResourceHandle::make(42, ResourceType::Buffer);
//! assert_eq!(raw.index(), 42);
//! assert_eq!(raw.resource_type(), Some(ResourceType::Buffer));
//!
//! let buffer = BufferHandle::try_from(raw).unwrap();
//! assert_eq!(buffer.raw(), raw);
//! ```

use std::fmt;

/// Kind of resource a handle refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResourceType {
    Buffer = 0,
    Texture = 1,
    TextureView = 2,
    Swapchain = 3,
    Sampler = 4,
    Shader = 5,
    PipelineLayout = 6,
}

impl ResourceType {
    /// Number of resource types.
    pub const COUNT: usize = 7;

    /// All resource types, in tag order.
    pub const ALL: [ResourceType; Self::COUNT] = [
        ResourceType::Buffer,
        ResourceType::Texture,
        ResourceType::TextureView,
        ResourceType::Swapchain,
        ResourceType::Sampler,
        ResourceType::Shader,
        ResourceType::PipelineLayout,
    ];

    /// Decodes a tag byte.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ResourceType::Buffer),
            1 => Some(ResourceType::Texture),
            2 => Some(ResourceType::TextureView),
            3 => Some(ResourceType::Swapchain),
            4 => Some(ResourceType::Sampler),
            5 => Some(ResourceType::Shader),
            6 => Some(ResourceType::PipelineLayout),
            _ => None,
        }
    }

    /// Position of this type in per-type tables.
    #[inline]
    pub const fn slot(self) -> usize {
        self as usize
    }

    /// Human-readable name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            ResourceType::Buffer => "buffer",
            ResourceType::Texture => "texture",
            ResourceType::TextureView => "texture view",
            ResourceType::Swapchain => "swapchain",
            ResourceType::Sampler => "sampler",
            ResourceType::Shader => "shader",
            ResourceType::PipelineLayout => "pipeline layout",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const TYPE_BITS: u32 = 8;
const TYPE_MASK: u64 = (1 << TYPE_BITS) - 1;

/// Packed `(index, type)` handle. Equality is bitwise.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceResourceHandle(u64);

impl DeviceResourceHandle {
    /// The null handle. Its tag byte (0xFF) never names a resource type.
    pub const NULL: Self = Self(u64::MAX);

    /// Largest index a handle can carry.
    pub const MAX_INDEX: usize = ((1u64 << (64 - TYPE_BITS)) - 1) as usize;

    /// Packs an arena index and a resource type.
    ///
    /// # Panics
    ///
    /// Panics if `index` exceeds [`Self::MAX_INDEX`].
    #[inline]
    pub fn make(index: usize, ty: ResourceType) -> Self {
        assert!(
            index <= Self::MAX_INDEX,
            "resource index {index} does not fit in a handle"
        );
        Self(((index as u64) << TYPE_BITS) | ty as u64)
    }

    /// Arena index encoded in the handle.
    #[inline]
    pub fn index(self) -> usize {
        (self.0 >> TYPE_BITS) as usize
    }

    /// Resource type encoded in the handle, `None` for null.
    #[inline]
    pub fn resource_type(self) -> Option<ResourceType> {
        ResourceType::from_tag((self.0 & TYPE_MASK) as u8)
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// The packed 64-bit value.
    #[inline]
    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// Rebuilds a handle from its packed value.
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }
}

impl Default for DeviceResourceHandle {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for DeviceResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource_type() {
            Some(ty) => write!(f, "{}#{}", ty.name(), self.index()),
            None => f.write_str("null"),
        }
    }
}

/// Error returned when converting a [`DeviceResourceHandle`] to the wrong
/// typed handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("expected a {expected} handle, got {found:?}")]
pub struct HandleTypeMismatch {
    pub expected: ResourceType,
    pub found: DeviceResourceHandle,
}

/// A handle statically bound to one resource type.
pub trait TypedHandle: Copy + Eq + std::hash::Hash + fmt::Debug + Send + Sync + 'static {
    /// The resource type every value of this handle carries.
    const TYPE: ResourceType;

    /// The packed handle.
    fn raw(self) -> DeviceResourceHandle;

    /// Wraps a packed handle whose tag is known to be [`Self::TYPE`].
    fn from_raw_unchecked(raw: DeviceResourceHandle) -> Self;

    /// Builds a handle for `index`.
    #[inline]
    fn from_index(index: usize) -> Self {
        Self::from_raw_unchecked(DeviceResourceHandle::make(index, Self::TYPE))
    }

    #[inline]
    fn index(self) -> usize {
        self.raw().index()
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident => $ty:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(DeviceResourceHandle);

        impl $name {
            /// The null handle of this type.
            pub const NULL: Self = Self(DeviceResourceHandle::NULL);

            #[inline]
            pub fn is_null(self) -> bool {
                self.0.is_null()
            }
        }

        impl TypedHandle for $name {
            const TYPE: ResourceType = ResourceType::$ty;

            #[inline]
            fn raw(self) -> DeviceResourceHandle {
                self.0
            }

            #[inline]
            fn from_raw_unchecked(raw: DeviceResourceHandle) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for DeviceResourceHandle {
            #[inline]
            fn from(handle: $name) -> Self {
                handle.0
            }
        }

        impl TryFrom<DeviceResourceHandle> for $name {
            type Error = HandleTypeMismatch;

            fn try_from(raw: DeviceResourceHandle) -> Result<Self, Self::Error> {
                if raw.resource_type() == Some(ResourceType::$ty) {
                    Ok(Self(raw))
                } else {
                    Err(HandleTypeMismatch {
                        expected: ResourceType::$ty,
                        found: raw,
                    })
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::NULL
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.0, f)
            }
        }
    };
}

typed_handle!(
    /// Handle to a GPU buffer.
    BufferHandle => Buffer
);
typed_handle!(
    /// Handle to a texture (image).
    TextureHandle => Texture
);
typed_handle!(
    /// Handle to a view of a texture.
    TextureViewHandle => TextureView
);
typed_handle!(
    /// Handle to a presentation swapchain.
    SwapchainHandle => Swapchain
);
typed_handle!(
    /// Handle to a sampler.
    SamplerHandle => Sampler
);
typed_handle!(
    /// Handle to a shader module.
    ShaderHandle => Shader
);
typed_handle!(
    /// Handle to a pipeline layout.
    PipelineLayoutHandle => PipelineLayout
);

/// An untyped handle classified by its tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    TextureView(TextureViewHandle),
    Swapchain(SwapchainHandle),
    Sampler(SamplerHandle),
    Shader(ShaderHandle),
    PipelineLayout(PipelineLayoutHandle),
}

impl ResourceHandle {
    /// Classifies a packed handle. Returns `None` for null.
    pub fn classify(raw: DeviceResourceHandle) -> Option<Self> {
        let ty = raw.resource_type()?;
        Some(match ty {
            ResourceType::Buffer => Self::Buffer(BufferHandle::from_raw_unchecked(raw)),
            ResourceType::Texture => Self::Texture(TextureHandle::from_raw_unchecked(raw)),
            ResourceType::TextureView => {
                Self::TextureView(TextureViewHandle::from_raw_unchecked(raw))
            }
            ResourceType::Swapchain => Self::Swapchain(SwapchainHandle::from_raw_unchecked(raw)),
            ResourceType::Sampler => Self::Sampler(SamplerHandle::from_raw_unchecked(raw)),
            ResourceType::Shader => Self::Shader(ShaderHandle::from_raw_unchecked(raw)),
            ResourceType::PipelineLayout => {
                Self::PipelineLayout(PipelineLayoutHandle::from_raw_unchecked(raw))
            }
        })
    }

    /// The packed handle.
    pub fn raw(self) -> DeviceResourceHandle {
        match self {
            Self::Buffer(h) => h.raw(),
            Self::Texture(h) => h.raw(),
            Self::TextureView(h) => h.raw(),
            Self::Swapchain(h) => h.raw(),
            Self::Sampler(h) => h.raw(),
            Self::Shader(h) => h.raw(),
            Self::PipelineLayout(h) => h.raw(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_type() {
        let indices = [
            0usize,
            1,
            255,
            256,
            65_535,
            1 << 32,
            DeviceResourceHandle::MAX_INDEX - 1,
            DeviceResourceHandle::MAX_INDEX,
        ];
        for ty in ResourceType::ALL {
            for &index in &indices {
                let handle = DeviceResourceHandle::make(index, ty);
                assert_eq!(handle.index(), index);
                assert_eq!(handle.resource_type(), Some(ty));
                assert!(!handle.is_null());
            }
        }
    }

    #[test]
    fn test_null_has_no_type() {
        assert!(DeviceResourceHandle::NULL.is_null());
        assert_eq!(DeviceResourceHandle::NULL.resource_type(), None);
        assert_eq!(DeviceResourceHandle::default(), DeviceResourceHandle::NULL);
        assert!(BufferHandle::NULL.is_null());
        assert!(ResourceHandle::classify(DeviceResourceHandle::NULL).is_none());
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_make_rejects_oversized_index() {
        let _ = DeviceResourceHandle::make(DeviceResourceHandle::MAX_INDEX + 1, ResourceType::Buffer);
    }

    #[test]
    fn test_typed_conversion_checks_tag() {
        let raw = DeviceResourceHandle::make(7, ResourceType::Texture);
        assert!(TextureHandle::try_from(raw).is_ok());

        let err = BufferHandle::try_from(raw).unwrap_err();
        assert_eq!(err.expected, ResourceType::Buffer);
        assert_eq!(err.found, raw);
    }

    #[test]
    fn test_classify_matches_tag() {
        let raw = DeviceResourceHandle::make(3, ResourceType::PipelineLayout);
        match ResourceHandle::classify(raw) {
            Some(ResourceHandle::PipelineLayout(h)) => assert_eq!(h.index(), 3),
            other => panic!("unexpected classification: {other:?}"),
        }
        assert_eq!(ResourceHandle::classify(raw).map(ResourceHandle::raw), Some(raw));
    }

    #[test]
    fn test_equality_is_bitwise() {
        let a = DeviceResourceHandle::make(5, ResourceType::Shader);
        let b = DeviceResourceHandle::from_bits(a.to_bits());
        assert_eq!(a, b);
        assert_ne!(a, DeviceResourceHandle::make(5, ResourceType::Sampler));
    }

    #[test]
    fn test_debug_format() {
        let handle = SamplerHandle::from_index(9);
        assert_eq!(format!("{handle:?}"), "sampler#9");
        assert_eq!(format!("{:?}", DeviceResourceHandle::NULL), "null");
    }
}
