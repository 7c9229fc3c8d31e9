//! Vertex element formats and the small amount of metadata the rest of the
//! workspace needs to reason about them.

use serde::{Deserialize, Serialize};

/// The component encoding of a vertex element format, with the channel
/// count stripped off.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ComponentType {
    Float32,
    Float16,
    Unorm8,
    Unorm16,
    Snorm8,
    Snorm16,
    /// Raw unsigned integer bytes. Not convertible to float; copied verbatim.
    Uint8,
}

/// Format of a single vertex element.
///
/// This is the closed set of formats the geometry pipeline can produce or
/// consume: 32-bit float, 16-bit float, and 8/16-bit signed/unsigned
/// normalized, each with 1 to 4 components, plus 8-bit unsigned integers
/// for joint indices.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    R32Float,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    R16Unorm,
    Rg16Unorm,
    Rgba16Unorm,
    R8Snorm,
    Rg8Snorm,
    Rgba8Snorm,
    R16Snorm,
    Rg16Snorm,
    Rgba16Snorm,
    R8Uint,
    Rg8Uint,
    Rgba8Uint,
}

impl Format {
    pub const fn component_type(self) -> ComponentType {
        use Format::*;
        match self {
            R32Float | Rg32Float | Rgb32Float | Rgba32Float => ComponentType::Float32,
            R16Float | Rg16Float | Rgba16Float => ComponentType::Float16,
            R8Unorm | Rg8Unorm | Rgba8Unorm => ComponentType::Unorm8,
            R16Unorm | Rg16Unorm | Rgba16Unorm => ComponentType::Unorm16,
            R8Snorm | Rg8Snorm | Rgba8Snorm => ComponentType::Snorm8,
            R16Snorm | Rg16Snorm | Rgba16Snorm => ComponentType::Snorm16,
            R8Uint | Rg8Uint | Rgba8Uint => ComponentType::Uint8,
        }
    }

    pub const fn component_count(self) -> u32 {
        use Format::*;
        match self {
            R32Float | R16Float | R8Unorm | R16Unorm | R8Snorm | R16Snorm | R8Uint => 1,
            Rg32Float | Rg16Float | Rg8Unorm | Rg16Unorm | Rg8Snorm | Rg16Snorm | Rg8Uint => 2,
            Rgb32Float => 3,
            Rgba32Float | Rgba16Float | Rgba8Unorm | Rgba16Unorm | Rgba8Snorm | Rgba16Snorm
            | Rgba8Uint => 4,
        }
    }

    pub const fn component_bytes(self) -> u32 {
        match self.component_type() {
            ComponentType::Float32 => 4,
            ComponentType::Float16 | ComponentType::Unorm16 | ComponentType::Snorm16 => 2,
            ComponentType::Unorm8 | ComponentType::Snorm8 | ComponentType::Uint8 => 1,
        }
    }

    /// Size in bytes of one element of this format.
    pub const fn bytes(self) -> u32 {
        self.component_count() * self.component_bytes()
    }

    /// Select the format with the given component encoding and count.
    ///
    /// There is no 3-component variant for the 8/16-bit encodings; those
    /// widen to 4 components, matching how vertex buffers lay them out.
    pub fn from_parts(ty: ComponentType, count: u32) -> Format {
        use Format::*;
        match (ty, count) {
            (ComponentType::Float32, 1) => R32Float,
            (ComponentType::Float32, 2) => Rg32Float,
            (ComponentType::Float32, 3) => Rgb32Float,
            (ComponentType::Float32, _) => Rgba32Float,
            (ComponentType::Float16, 1) => R16Float,
            (ComponentType::Float16, 2) => Rg16Float,
            (ComponentType::Float16, _) => Rgba16Float,
            (ComponentType::Unorm8, 1) => R8Unorm,
            (ComponentType::Unorm8, 2) => Rg8Unorm,
            (ComponentType::Unorm8, _) => Rgba8Unorm,
            (ComponentType::Unorm16, 1) => R16Unorm,
            (ComponentType::Unorm16, 2) => Rg16Unorm,
            (ComponentType::Unorm16, _) => Rgba16Unorm,
            (ComponentType::Snorm8, 1) => R8Snorm,
            (ComponentType::Snorm8, 2) => Rg8Snorm,
            (ComponentType::Snorm8, _) => Rgba8Snorm,
            (ComponentType::Snorm16, 1) => R16Snorm,
            (ComponentType::Snorm16, 2) => Rg16Snorm,
            (ComponentType::Snorm16, _) => Rgba16Snorm,
            (ComponentType::Uint8, 1) => R8Uint,
            (ComponentType::Uint8, 2) => Rg8Uint,
            (ComponentType::Uint8, _) => Rgba8Uint,
        }
    }
}

/// Width of the values in an index buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub const fn bytes(self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Primitive topology of a draw call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topology {
    TriangleList,
    /// Used by preskinning draw calls, which address vertex ranges rather
    /// than assembled primitives.
    PointList,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_sizes() {
        assert_eq!(Format::Rgb32Float.bytes(), 12);
        assert_eq!(Format::Rgba8Unorm.bytes(), 4);
        assert_eq!(Format::Rg16Float.bytes(), 4);
        assert_eq!(Format::R8Uint.bytes(), 1);
        assert_eq!(Format::Rgba16Snorm.bytes(), 8);
    }

    #[test]
    fn from_parts_widens_small_formats() {
        assert_eq!(
            Format::from_parts(ComponentType::Unorm8, 3),
            Format::Rgba8Unorm
        );
        assert_eq!(
            Format::from_parts(ComponentType::Float32, 3),
            Format::Rgb32Float
        );
    }
}
