//! Nascent geometry: unified meshes packed for serialisation, and the
//! scaffold chunk writer.

use std::io::Write;

use glam::Mat4;
use marrow_types::{
    ChunkFileWriter, DrawCall, GeoCallRecord, IndexData, IndexFormat, InputAssembly,
    MaterialImmutableRecord, ModelCommandStream, ModelImmutableRecord, PreskinningSection,
    RawGeometryRecord, SkinnedGeometryRecord, Topology, VertexData, CHUNK_TYPE_LARGE_BLOCKS,
    CHUNK_TYPE_MATERIAL, CHUNK_TYPE_MODEL, CHUNK_TYPE_SKELETON, LARGE_BLOCKS_CHUNK_VERSION,
    MATERIAL_CHUNK_VERSION, MODEL_CHUNK_VERSION, SKELETON_CHUNK_VERSION,
};

use crate::algorithm::{accumulate_bounding_box, invalid_bounding_box};
use crate::mesh::NativeVbSettings;
use crate::skin::NascentBoundSkinnedGeometry;
use crate::unify::UnifiedMesh;
use crate::GeoProcError;

/// A static mesh ready for serialisation: packed vertex and index bytes,
/// layout, draw calls and the map back to source position indices.
pub struct NascentRawGeometry {
    pub vertices: Vec<u8>,
    pub indices: Vec<u8>,
    pub input_assembly: InputAssembly,
    pub index_format: IndexFormat,
    pub draw_calls: Vec<DrawCall>,
    /// Hashed material binding symbol per draw call.
    pub material_bindings: Vec<u64>,
    pub geo_space_to_node_space: Mat4,
    pub unified_vertex_index_to_position_index: Vec<u32>,
    pub unified_vertex_count: usize,
}

impl NascentRawGeometry {
    /// Pack a unified mesh into its native vertex buffer and a single
    /// concatenated index buffer. The index format narrows to 16 bits when
    /// the unified vertex count allows it.
    pub fn from_unified(
        unified: &UnifiedMesh,
        layout: InputAssembly,
    ) -> Result<Self, GeoProcError> {
        let vertices = unified.database.build_native_vertex_buffer(&layout)?;
        let unified_vertex_count = unified.database.unified_vertex_count();

        let total_index_count: usize = unified
            .draw_operations
            .iter()
            .map(|op| op.index_buffer.len())
            .sum();

        let mut draw_calls = Vec::with_capacity(unified.draw_operations.len());
        let mut material_bindings = Vec::with_capacity(unified.draw_operations.len());
        let mut first_index = 0u32;
        for (sub_material_index, op) in unified.draw_operations.iter().enumerate() {
            debug_assert_eq!(op.topology, Topology::TriangleList);
            draw_calls.push(DrawCall {
                first_index,
                index_count: op.index_buffer.len() as u32,
                first_vertex: 0,
                sub_material_index: sub_material_index as u32,
                topology: op.topology,
            });
            material_bindings.push(op.material_binding);
            first_index += op.index_buffer.len() as u32;
        }

        let (index_format, indices) = if unified_vertex_count < 0xffff {
            let mut buffer = Vec::with_capacity(total_index_count * 2);
            for op in &unified.draw_operations {
                for &index in &op.index_buffer {
                    buffer.extend_from_slice(&(index as u16).to_le_bytes());
                }
            }
            (IndexFormat::Uint16, buffer)
        } else {
            let mut buffer = Vec::with_capacity(total_index_count * 4);
            for op in &unified.draw_operations {
                for &index in &op.index_buffer {
                    buffer.extend_from_slice(&index.to_le_bytes());
                }
            }
            (IndexFormat::Uint32, buffer)
        };

        for call in &draw_calls {
            debug_assert!(
                (call.first_index + call.index_count) as usize
                    <= indices.len() / index_format.bytes() as usize
            );
        }

        Ok(Self {
            vertices,
            indices,
            input_assembly: layout,
            index_format,
            draw_calls,
            material_bindings,
            geo_space_to_node_space: Mat4::IDENTITY,
            unified_vertex_index_to_position_index: unified
                .database
                .build_unified_index_to_position_index(),
            unified_vertex_count,
        })
    }

    /// Convenience over [`from_unified`](Self::from_unified) with the
    /// default interleaved layout.
    pub fn from_unified_default_layout(
        unified: &UnifiedMesh,
        settings: &NativeVbSettings,
    ) -> Result<Self, GeoProcError> {
        let layout = crate::mesh::build_default_layout(&unified.database, settings);
        Self::from_unified(unified, layout)
    }

    pub fn local_bounding_box(&self) -> (glam::Vec3, glam::Vec3) {
        let mut bounding_box = invalid_bounding_box();
        if let Some(position) = self
            .input_assembly
            .find_element(marrow_types::semantics::POSITION, 0)
        {
            accumulate_bounding_box(
                &mut bounding_box,
                &self.vertices,
                self.input_assembly.vertex_stride as usize,
                self.unified_vertex_count,
                position,
                self.geo_space_to_node_space,
            );
        }
        bounding_box
    }
}

/// Accumulates geos and command-stream entries, then serialises the
/// chunked scaffold file.
#[derive(Default)]
pub struct ModelScaffoldBuilder {
    geos: Vec<NascentRawGeometry>,
    skinned_geos: Vec<NascentBoundSkinnedGeometry>,
    geo_calls: Vec<GeoCallRecord>,
    skin_calls: Vec<GeoCallRecord>,
    joint_input_interface: Vec<u64>,
    /// Pre-encoded skeleton machine chunk payload. The skeleton is
    /// serialised by its own crate and carried through unchanged.
    skeleton_payload: Option<Vec<u8>>,
    default_transforms: Vec<Mat4>,
    max_lod: u32,
}

impl ModelScaffoldBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_geo(&mut self, geo: NascentRawGeometry) -> u32 {
        self.geos.push(geo);
        self.geos.len() as u32 - 1
    }

    pub fn add_skinned_geo(&mut self, geo: NascentBoundSkinnedGeometry) -> u32 {
        self.skinned_geos.push(geo);
        self.skinned_geos.len() as u32 - 1
    }

    /// Register a joint name on the command stream's input interface and
    /// return its slot.
    pub fn add_input_joint(&mut self, name_hash: u64) -> u32 {
        if let Some(slot) = self
            .joint_input_interface
            .iter()
            .position(|&n| n == name_hash)
        {
            return slot as u32;
        }
        self.joint_input_interface.push(name_hash);
        self.joint_input_interface.len() as u32 - 1
    }

    pub fn add_geo_call(&mut self, geo_id: u32, material_guids: Vec<u64>, transform_marker: u32) {
        self.geo_calls.push(GeoCallRecord {
            geo_id,
            material_guids,
            transform_marker,
        });
    }

    pub fn add_skin_call(&mut self, geo_id: u32, material_guids: Vec<u64>, transform_marker: u32) {
        self.skin_calls.push(GeoCallRecord {
            geo_id,
            material_guids,
            transform_marker,
        });
    }

    pub fn set_skeleton_payload(&mut self, payload: Vec<u8>) {
        self.skeleton_payload = Some(payload);
    }

    pub fn set_default_transforms(&mut self, transforms: Vec<Mat4>) {
        self.default_transforms = transforms;
    }

    pub fn serialize(&self, out: &mut impl Write) -> Result<(), GeoProcError> {
        let mut large_blocks = Vec::new();
        let mut append = |bytes: &[u8]| -> (u64, u64) {
            let offset = large_blocks.len() as u64;
            large_blocks.extend_from_slice(bytes);
            (offset, bytes.len() as u64)
        };

        let mut bounding_box = invalid_bounding_box();

        let mut geo_records = Vec::with_capacity(self.geos.len());
        for geo in &self.geos {
            let (vb_offset, vb_size) = append(&geo.vertices);
            let (ib_offset, ib_size) = append(&geo.indices);
            geo_records.push(RawGeometryRecord {
                vb: VertexData {
                    ia: geo.input_assembly.clone(),
                    offset: vb_offset,
                    size: vb_size,
                },
                ib: IndexData {
                    format: geo.index_format,
                    offset: ib_offset,
                    size: ib_size,
                },
                draw_calls: geo.draw_calls.clone(),
                geo_space_to_node_space: geo.geo_space_to_node_space,
            });

            let local = geo.local_bounding_box();
            bounding_box.0 = bounding_box.0.min(local.0);
            bounding_box.1 = bounding_box.1.max(local.1);
        }

        let mut skinned_records = Vec::with_capacity(self.skinned_geos.len());
        for geo in &self.skinned_geos {
            let (vb_offset, vb_size) = append(&geo.unanimated_vertex_elements);
            let (anim_offset, anim_size) = append(&geo.animated_vertex_elements);
            let (skel_offset, skel_size) = append(&geo.skeleton_binding_vertices);
            let (ib_offset, ib_size) = append(&geo.indices);
            skinned_records.push(SkinnedGeometryRecord {
                vb: VertexData {
                    ia: geo.unanimated_ia.clone(),
                    offset: vb_offset,
                    size: vb_size,
                },
                animated_vertex_elements: VertexData {
                    ia: geo.animated_ia.clone(),
                    offset: anim_offset,
                    size: anim_size,
                },
                skeleton_binding: VertexData {
                    ia: geo.preskinning_ia.clone(),
                    offset: skel_offset,
                    size: skel_size,
                },
                ib: IndexData {
                    format: geo.index_format,
                    offset: ib_offset,
                    size: ib_size,
                },
                draw_calls: geo.main_draw_calls.clone(),
                preskinning_sections: vec![PreskinningSection {
                    bind_shape_by_inverse_bind: geo.bind_shape_by_inverse_bind.clone(),
                    joint_matrices: geo.joint_matrices.clone(),
                    preskinning_draw_calls: geo.preskinning_draw_calls.clone(),
                }],
                geo_space_to_node_space: geo.geo_space_to_node_space,
                local_bounding_box: geo.local_bounding_box,
            });

            bounding_box.0 = bounding_box.0.min(geo.local_bounding_box.0);
            bounding_box.1 = bounding_box.1.max(geo.local_bounding_box.1);
        }

        let record = ModelImmutableRecord {
            geos: geo_records,
            skinned_geos: skinned_records,
            command_stream: ModelCommandStream {
                geo_calls: self.geo_calls.clone(),
                skin_calls: self.skin_calls.clone(),
                joint_input_interface: self.joint_input_interface.clone(),
            },
            default_transforms: self.default_transforms.clone(),
            bounding_box,
            max_lod: self.max_lod,
        };

        let payload = bincode::serialize(&record).map_err(|source| GeoProcError::Serialize {
            source,
        })?;

        let mut writer = ChunkFileWriter::new();
        writer.add_chunk(CHUNK_TYPE_MODEL, MODEL_CHUNK_VERSION, payload);
        if let Some(skeleton) = &self.skeleton_payload {
            writer.add_chunk(CHUNK_TYPE_SKELETON, SKELETON_CHUNK_VERSION, skeleton.clone());
        }
        writer.add_chunk(CHUNK_TYPE_LARGE_BLOCKS, LARGE_BLOCKS_CHUNK_VERSION, large_blocks);
        writer.write_to(out).map_err(GeoProcError::Io)
    }
}

/// Serialise a material scaffold file.
pub fn write_material_scaffold(
    record: &MaterialImmutableRecord,
    out: &mut impl Write,
) -> Result<(), GeoProcError> {
    let payload =
        bincode::serialize(record).map_err(|source| GeoProcError::Serialize { source })?;
    let mut writer = ChunkFileWriter::new();
    writer.add_chunk(CHUNK_TYPE_MATERIAL, MATERIAL_CHUNK_VERSION, payload);
    writer.write_to(out).map_err(GeoProcError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::RawVertexSource;
    use crate::unify::{
        unify_mesh, AttributeInput, PrimitiveData, SemanticRemapConfig, SourceMesh,
        SourcePrimitive,
    };
    use glam::Vec3;
    use marrow_types::semantics;

    fn triangle_unified() -> UnifiedMesh {
        let positions = RawVertexSource::from_vec3s(&[Vec3::ZERO, Vec3::X, Vec3::Y]);
        let mesh = SourceMesh {
            name: "tri".to_string(),
            primitives: vec![SourcePrimitive {
                inputs: vec![AttributeInput {
                    source_id: 1,
                    semantic_name: semantics::POSITION.to_string(),
                    semantic_index: 0,
                    source: positions,
                    index_in_primitive: 0,
                }],
                data: PrimitiveData::Triangles {
                    primitive_count: 1,
                    indices: vec![0, 1, 2],
                },
                material_binding: "mat".to_string(),
                location: "tri:0".to_string(),
            }],
        };
        unify_mesh(&mesh, &SemanticRemapConfig::default())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn small_meshes_use_16_bit_indices() {
        let geo = NascentRawGeometry::from_unified_default_layout(
            &triangle_unified(),
            &NativeVbSettings::default(),
        )
        .unwrap();
        assert_eq!(geo.index_format, IndexFormat::Uint16);
        assert_eq!(geo.indices.len(), 6);
        assert_eq!(geo.draw_calls.len(), 1);
        assert_eq!(geo.draw_calls[0].index_count, 3);
        assert_eq!(geo.unified_vertex_index_to_position_index, vec![0, 1, 2]);
    }

    #[test]
    fn bounding_box_covers_all_positions() {
        let geo = NascentRawGeometry::from_unified_default_layout(
            &triangle_unified(),
            &NativeVbSettings::default(),
        )
        .unwrap();
        let bbox = geo.local_bounding_box();
        assert_eq!(bbox.0, Vec3::ZERO);
        assert_eq!(bbox.1, Vec3::new(1.0, 1.0, 0.0));
    }
}
