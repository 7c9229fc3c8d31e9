//! Type declarations for the marrow geometry-processing and skinned-model
//! rendering core.
//!
//! This crate holds the vocabulary shared between the offline geometry
//! pipeline (`marrow-geoproc`), the animation sampler (`marrow-anim`) and
//! the runtime renderer (`marrow`): element formats, vertex semantics,
//! input-assembly descriptors, draw calls, and the POD records stored in a
//! scaffold file.

use std::hash::Hasher;

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

mod chunk;
mod convert;
mod format;

pub use chunk::*;
pub use convert::*;
pub use format::*;

/// Hash map designed for small keys.
pub type FastHashMap<K, V> = rustc_hash::FxHashMap<K, V>;
/// Hash set designed for small keys.
pub type FastHashSet<K> = rustc_hash::FxHashSet<K>;
/// Build hasher designed for small keys.
pub type FastBuildHasher = std::hash::BuildHasherDefault<rustc_hash::FxHasher>;

pub mod semantics {
    //! The semantic names the pipeline attaches meaning to. Source meshes
    //! may carry any name; these are the ones the core itself looks up.
    pub const POSITION: &str = "POSITION";
    pub const NORMAL: &str = "NORMAL";
    pub const TEXCOORD: &str = "TEXCOORD";
    pub const TEXTANGENT: &str = "TEXTANGENT";
    pub const TEXBITANGENT: &str = "TEXBITANGENT";
    pub const COLOR: &str = "COLOR";
    pub const WEIGHTS: &str = "WEIGHTS";
    pub const JOINT_INDICES: &str = "JOINTINDICES";
}

/// 64-bit hash of an arbitrary string, used for interface names, material
/// guids and animation names.
pub fn hash_str(name: &str) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// Hash identifying a `(semantic_name, semantic_index)` pair.
///
/// The index is folded in by addition so that `TEXCOORD:1` hashes one above
/// `TEXCOORD:0`, which keeps related semantics adjacent in sorted lists.
pub fn semantic_hash(name: &str, index: u32) -> u64 {
    hash_str(name).wrapping_add(index as u64)
}

/// Combine an index-like value into a running 64-bit hash. Used by the
/// geometry unifier to hash attribute-index tuples in element order.
pub fn hash_combine(value: u64, seed: u64) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write_u64(seed);
    hasher.write_u64(value);
    hasher.finish()
}

bitflags::bitflags! {
    /// Fix-ups applied when reading values out of a vertex source.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ProcessingFlags: u32 {
        /// `v = 1 - v` on the second component. Texture coordinates from
        /// DCC tools use the opposite vertical convention.
        const FLIP_V = 1 << 0;
        /// Negate the first three components.
        const FLIP_BITANGENT = 1 << 1;
        /// Negate the fourth component (tangent handedness).
        const FLIP_TANGENT_HANDEDNESS = 1 << 2;
        /// Renormalize the first three components to unit length.
        const RENORMALIZE = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Hints about the meaning of a vertex source, used when choosing the
    /// packed vertex-buffer format.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct FormatHint: u32 {
        const IS_COLOR = 1 << 0;
    }
}

/// One attribute of a vertex layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexElement {
    pub semantic_name: String,
    pub semantic_index: u32,
    pub format: Format,
    pub aligned_byte_offset: u32,
}

impl VertexElement {
    pub fn new(semantic_name: &str, semantic_index: u32, format: Format, offset: u32) -> Self {
        Self {
            semantic_name: semantic_name.to_string(),
            semantic_index,
            format,
            aligned_byte_offset: offset,
        }
    }

    pub fn semantic_hash(&self) -> u64 {
        semantic_hash(&self.semantic_name, self.semantic_index)
    }
}

/// Vertex layout plus the stride between consecutive vertices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputAssembly {
    pub elements: Vec<VertexElement>,
    pub vertex_stride: u32,
}

impl InputAssembly {
    pub fn find_element(&self, semantic_name: &str, semantic_index: u32) -> Option<&VertexElement> {
        self.elements
            .iter()
            .find(|e| e.semantic_name == semantic_name && e.semantic_index == semantic_index)
    }

    pub fn find_element_by_hash(&self, hash: u64) -> Option<&VertexElement> {
        self.elements.iter().find(|e| e.semantic_hash() == hash)
    }
}

/// Compute the packed size of a vertex made of the given elements.
pub fn calculate_vertex_stride(elements: &[VertexElement]) -> u32 {
    elements.iter().map(|e| e.format.bytes()).sum()
}

/// A single draw call within a geo.
///
/// For preskinning draw calls the topology is [`Topology::PointList`],
/// `sub_material_index` encodes the influence count (0, 1, 2 or 4) and
/// `first_vertex .. first_vertex + index_count` names a contiguous unified
/// vertex range rather than an index-buffer range.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawCall {
    pub first_index: u32,
    pub index_count: u32,
    pub first_vertex: u32,
    pub sub_material_index: u32,
    pub topology: Topology,
}

////////////////////////////////////////////////////////////////////////////////
// Scaffold records. These are the POD structures stored inside the "Model"
// chunk of a scaffold file; offsets are relative to the large-blocks region.

/// A vertex buffer inside the scaffold's large-blocks region.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VertexData {
    pub ia: InputAssembly,
    pub offset: u64,
    pub size: u64,
}

impl VertexData {
    pub fn vertex_count(&self) -> u32 {
        if self.ia.vertex_stride == 0 {
            0
        } else {
            (self.size / self.ia.vertex_stride as u64) as u32
        }
    }
}

/// An index buffer inside the scaffold's large-blocks region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexData {
    pub format: IndexFormat,
    pub offset: u64,
    pub size: u64,
}

/// A static geo entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawGeometryRecord {
    pub vb: VertexData,
    pub ib: IndexData,
    pub draw_calls: Vec<DrawCall>,
    pub geo_space_to_node_space: Mat4,
}

/// One preskinning section of a skinned geo: the joints it references and
/// the point-list draw calls that skin its vertex ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreskinningSection {
    /// `bind_shape_matrix * inverse_bind[j]`, premultiplied offline,
    /// ordered by remapped joint index.
    pub bind_shape_by_inverse_bind: Vec<Mat4>,
    /// Remapped joint index -> slot on the model command stream's joint
    /// input interface.
    pub joint_matrices: Vec<u16>,
    pub preskinning_draw_calls: Vec<DrawCall>,
}

/// A skinned geo entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkinnedGeometryRecord {
    /// Unanimated vertex elements (texcoords, colors, ...).
    pub vb: VertexData,
    /// Animated vertex elements (position and anything else skinned).
    pub animated_vertex_elements: VertexData,
    /// Per-vertex weights and joint indices.
    pub skeleton_binding: VertexData,
    pub ib: IndexData,
    pub draw_calls: Vec<DrawCall>,
    pub preskinning_sections: Vec<PreskinningSection>,
    pub geo_space_to_node_space: Mat4,
    pub local_bounding_box: (Vec3, Vec3),
}

/// A geo-call on the model command stream: one instance of a geo with its
/// material bindings and the joint its transform is attached to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoCallRecord {
    pub geo_id: u32,
    pub material_guids: Vec<u64>,
    /// Index into the command stream's joint input interface.
    pub transform_marker: u32,
}

/// The command stream of a model: the geo instances to draw and the joint
/// name interface that skeletons bind against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCommandStream {
    pub geo_calls: Vec<GeoCallRecord>,
    pub skin_calls: Vec<GeoCallRecord>,
    /// Hashed joint names, indexed by `transform_marker` and by the
    /// `joint_matrices` values of preskinning sections.
    pub joint_input_interface: Vec<u64>,
}

/// The immutable data block of a model scaffold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelImmutableRecord {
    pub geos: Vec<RawGeometryRecord>,
    pub skinned_geos: Vec<SkinnedGeometryRecord>,
    pub command_stream: ModelCommandStream,
    /// The embedded skeleton's default output, evaluated offline.
    pub default_transforms: Vec<Mat4>,
    pub bounding_box: (Vec3, Vec3),
    pub max_lod: u32,
}

////////////////////////////////////////////////////////////////////////////////
// Material records, stored inside the "ResMat" chunk.

/// Render state affecting pipeline construction. Opaque to the core; hashed
/// into the pipeline-accelerator key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderStateSet {
    pub double_sided: bool,
    pub blend_mode: u8,
    pub depth_write: bool,
}

/// A material entry: the shader patch collection it selects, its constant
/// values, texture bindings and selector parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterialRecord {
    pub patch_collection: u64,
    pub constants: Vec<(String, [f32; 4])>,
    /// Texture bindings: descriptor-set resource name -> texture name.
    pub bindings: Vec<(String, String)>,
    /// Material selector parameters. Ordered map so selector sets hash
    /// deterministically.
    pub selectors: std::collections::BTreeMap<String, i32>,
    pub state_set: RenderStateSet,
}

impl MaterialRecord {
    pub fn has_binding(&self, resource_name: &str) -> bool {
        self.bindings.iter().any(|(name, _)| name == resource_name)
    }
}

/// The descriptor-set layout a patch collection declares, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptorSetLayoutRecord {
    /// Names of texture resources in slot order.
    pub resources: Vec<String>,
}

/// A bundle of shader source fragments, identified by hash. The core never
/// looks inside; it only forwards the hash and layout to the host GPU layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchCollectionRecord {
    pub hash: u64,
    pub descriptor_set_layout: Option<DescriptorSetLayoutRecord>,
}

/// The immutable data block of a material scaffold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterialImmutableRecord {
    pub materials: Vec<(u64, MaterialRecord)>,
    pub patch_collections: Vec<(u64, PatchCollectionRecord)>,
}

impl MaterialImmutableRecord {
    pub fn material(&self, guid: u64) -> Option<&MaterialRecord> {
        self.materials
            .iter()
            .find_map(|(g, m)| (*g == guid).then_some(m))
    }

    pub fn patch_collection(&self, hash: u64) -> Option<&PatchCollectionRecord> {
        self.patch_collections
            .iter()
            .find_map(|(h, p)| (*h == hash).then_some(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semantic_hash_folds_index_by_addition() {
        let base = semantic_hash(semantics::TEXCOORD, 0);
        assert_eq!(semantic_hash(semantics::TEXCOORD, 1), base + 1);
        assert_ne!(base, semantic_hash(semantics::POSITION, 0));
    }

    #[test]
    fn input_assembly_lookup() {
        let ia = InputAssembly {
            elements: vec![
                VertexElement::new(semantics::POSITION, 0, Format::Rgb32Float, 0),
                VertexElement::new(semantics::TEXCOORD, 1, Format::Rg32Float, 12),
            ],
            vertex_stride: 20,
        };
        assert!(ia.find_element(semantics::POSITION, 0).is_some());
        assert!(ia.find_element(semantics::TEXCOORD, 0).is_none());
        let hash = semantic_hash(semantics::TEXCOORD, 1);
        assert_eq!(
            ia.find_element_by_hash(hash).unwrap().aligned_byte_offset,
            12
        );
    }

    #[test]
    fn vertex_stride_sums_element_sizes() {
        let elements = [
            VertexElement::new(semantics::POSITION, 0, Format::Rgb32Float, 0),
            VertexElement::new(semantics::NORMAL, 0, Format::Rgb32Float, 12),
            VertexElement::new(semantics::TEXCOORD, 0, Format::Rg32Float, 24),
        ];
        assert_eq!(calculate_vertex_stride(&elements), 32);
    }
}
