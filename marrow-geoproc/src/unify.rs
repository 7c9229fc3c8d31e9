//! Geometry unification: turn per-corner, per-attribute index tuples into a
//! dense unified vertex list and a single index buffer.

use std::sync::Arc;

use marrow_types::{hash_combine, FastHashMap, FastHashSet, FormatHint, ProcessingFlags, Topology};

use crate::mesh::{MeshDatabase, VertexSource};
use crate::GeoProcError;

/// One attribute input of a source primitive: which data source it reads
/// and which slot of the per-corner index tuple addresses it.
#[derive(Clone)]
pub struct AttributeInput {
    /// Identity of the backing source array, used to share elements between
    /// primitives referencing the same data.
    pub source_id: u64,
    pub semantic_name: String,
    pub semantic_index: u32,
    pub source: Arc<dyn VertexSource>,
    pub index_in_primitive: u32,
}

/// Index data of a source primitive, by topology.
pub enum PrimitiveData {
    /// `primitive_count` triangles; the flat index list holds
    /// `3 * primitive_count * stride` values.
    Triangles { primitive_count: usize, indices: Vec<u32> },
    /// One polygon per `vcount` entry, all indices in one flat list.
    PolyList { vcounts: Vec<u32>, indices: Vec<u32> },
    /// One index list per polygon. Hole loops are not represented; they are
    /// dropped before this point.
    Polygons { polygons: Vec<Vec<u32>> },
}

pub struct SourcePrimitive {
    pub inputs: Vec<AttributeInput>,
    pub data: PrimitiveData,
    /// Symbolic material binding, hashed into the draw operation.
    pub material_binding: String,
    /// Source location, carried into errors and warnings.
    pub location: String,
}

pub struct SourceMesh {
    pub name: String,
    pub primitives: Vec<SourcePrimitive>,
}

/// Optional renaming/suppression of source semantics.
#[derive(Default)]
pub struct SemanticRemapConfig {
    pub renames: FastHashMap<String, String>,
    pub suppressed: FastHashSet<String>,
}

impl SemanticRemapConfig {
    fn resolve(&self, semantic: &str) -> Option<String> {
        if self.suppressed.contains(semantic) {
            return None;
        }
        Some(
            self.renames
                .get(semantic)
                .cloned()
                .unwrap_or_else(|| semantic.to_string()),
        )
    }
}

/// A triangulated draw operation in unified-index space.
#[derive(Debug)]
pub struct DrawOperation {
    pub index_buffer: Vec<u32>,
    pub topology: Topology,
    pub material_binding: u64,
}

/// The result of unification: the mesh database plus one draw operation per
/// source primitive.
#[derive(Debug)]
pub struct UnifiedMesh {
    pub database: MeshDatabase,
    pub draw_operations: Vec<DrawOperation>,
}

/// Fix-ups applied to source values based on the semantic they carry.
///
/// Texture coordinates get the vertical flip. Normals and tangents are
/// deliberately not renormalized here; the flag exists for sources that
/// request it explicitly.
pub fn processing_flags_for_semantic(semantic: &str) -> ProcessingFlags {
    if semantic.to_ascii_uppercase().contains("TEXCOORD") {
        ProcessingFlags::FLIP_V
    } else {
        ProcessingFlags::empty()
    }
}

/// Wraps a source with additional semantic-derived processing flags.
struct FlaggedSource {
    inner: Arc<dyn VertexSource>,
    flags: ProcessingFlags,
}

impl VertexSource for FlaggedSource {
    fn data(&self) -> &[u8] {
        self.inner.data()
    }
    fn stride(&self) -> usize {
        self.inner.stride()
    }
    fn count(&self) -> usize {
        self.inner.count()
    }
    fn format(&self) -> marrow_types::Format {
        self.inner.format()
    }
    fn processing_flags(&self) -> ProcessingFlags {
        self.inner.processing_flags() | self.flags
    }
    fn format_hint(&self) -> FormatHint {
        self.inner.format_hint()
    }
}

/// An element of the composed vertex: one `(source, semantic)` pairing
/// shared by every primitive that references it.
struct ComposedElement {
    source_id: u64,
    semantic_name: String,
    semantic_index: u32,
    source: Arc<dyn VertexSource>,
}

#[derive(Default)]
struct ComposingVertex {
    elements: Vec<ComposedElement>,
}

impl ComposingVertex {
    /// Returns the element index, or `None` when the semantic is
    /// suppressed by configuration.
    fn find_or_create_element(
        &mut self,
        input: &AttributeInput,
        cfg: &SemanticRemapConfig,
        location: &str,
    ) -> Result<Option<usize>, GeoProcError> {
        let semantic = match cfg.resolve(&input.semantic_name) {
            Some(semantic) => semantic,
            None => return Ok(None),
        };

        let existing = self.elements.iter().position(|e| {
            e.source_id == input.source_id
                && e.semantic_name == semantic
                && e.semantic_index == input.semantic_index
        });
        if let Some(index) = existing {
            return Ok(Some(index));
        }

        let source = input.source.clone();
        if source.stride() * source.count() > source.data().len() {
            return Err(GeoProcError::Format {
                message: format!(
                    "vertex source for {} is shorter than its stride and count imply",
                    semantic
                ),
                location: location.to_string(),
            });
        }

        self.elements.push(ComposedElement {
            source_id: input.source_id,
            semantic_name: semantic.clone(),
            semantic_index: input.semantic_index,
            source: Arc::new(FlaggedSource {
                inner: source,
                flags: processing_flags_for_semantic(&semantic),
            }),
        });
        Ok(Some(self.elements.len() - 1))
    }

    /// Some exporters start semantic indices at 1 rather than 0. Shift each
    /// semantic name's indices down so the minimum observed index is 0.
    fn fix_bad_semantic_indices(&mut self) {
        let names: FastHashSet<String> =
            self.elements.iter().map(|e| e.semantic_name.clone()).collect();
        for name in names {
            let min_index = self
                .elements
                .iter()
                .filter(|e| e.semantic_name == name)
                .map(|e| e.semantic_index)
                .min()
                .unwrap_or(0);
            if min_index != 0 {
                for element in &mut self.elements {
                    if element.semantic_name == name {
                        element.semantic_index -= min_index;
                    }
                }
            }
        }
    }
}

/// Deduplicating store of unified vertices, keyed by the hash of their
/// attribute-index tuple.
struct ComposingUnifiedVertices {
    attributes_per_vertex: usize,
    unified_to_attribute_index: Vec<u32>,
    hash_to_unified: FastHashMap<u64, u32>,
}

impl ComposingUnifiedVertices {
    fn new(attributes_per_vertex: usize) -> Self {
        Self {
            attributes_per_vertex,
            unified_to_attribute_index: Vec::new(),
            hash_to_unified: FastHashMap::default(),
        }
    }

    fn unified_count(&self) -> usize {
        self.unified_to_attribute_index.len() / self.attributes_per_vertex
    }

    fn build_unified_vertex(&mut self, attribute_indices: &[u32]) -> u32 {
        debug_assert_eq!(attribute_indices.len(), self.attributes_per_vertex);
        let mut hash = 0u64;
        for &index in attribute_indices {
            hash = hash_combine(index as u64, hash);
        }

        if let Some(&existing) = self.hash_to_unified.get(&hash) {
            #[cfg(debug_assertions)]
            {
                let start = existing as usize * self.attributes_per_vertex;
                let stored = &self.unified_to_attribute_index[start..start + self.attributes_per_vertex];
                debug_assert_eq!(stored, attribute_indices);
            }
            return existing;
        }

        let new_index = self.unified_count() as u32;
        self.unified_to_attribute_index.extend_from_slice(attribute_indices);
        self.hash_to_unified.insert(hash, new_index);
        new_index
    }
}

/// Triangulate a convex polygon into a fan. Writes corner indices (in
/// 0..polygon_vertex_count) into `buffer`, three per triangle, and returns
/// the triangle count.
pub fn create_triangle_winding_from_polygon(
    buffer: &mut [u32],
    polygon_vertex_count: usize,
) -> usize {
    let mut out = 0;
    for triangle in 0..polygon_vertex_count.saturating_sub(2) {
        let v0 = (triangle + 1) / 2;
        let v1 = if triangle & 1 != 0 {
            polygon_vertex_count - 2 - triangle / 2
        } else {
            v0 + 1
        };
        let v2 = polygon_vertex_count - 1 - triangle / 2;
        assert!(out + 3 <= buffer.len());
        buffer[out] = v0 as u32;
        buffer[out + 1] = v1 as u32;
        buffer[out + 2] = v2 as u32;
        out += 3;
    }
    out / 3
}

struct BoundInput {
    element: usize,
    index_in_primitive: u32,
}

struct WorkingPrimitive {
    inputs: Vec<BoundInput>,
    stride: u32,
}

fn bind_primitive(
    composing: &mut ComposingVertex,
    primitive: &SourcePrimitive,
    cfg: &SemanticRemapConfig,
    mesh_name: &str,
) -> Result<WorkingPrimitive, GeoProcError> {
    let mut working = WorkingPrimitive {
        inputs: Vec::with_capacity(primitive.inputs.len()),
        stride: 0,
    };
    for input in &primitive.inputs {
        if let Some(element) =
            composing.find_or_create_element(input, cfg, &primitive.location)?
        {
            working.inputs.push(BoundInput {
                element,
                index_in_primitive: input.index_in_primitive,
            });
        } else {
            log::warn!(
                "suppressed or unresolvable input {} in geometry {}",
                input.semantic_name,
                mesh_name
            );
        }
        // the stride counts every input slot, even unresolved ones
        working.stride = working.stride.max(input.index_in_primitive + 1);
    }
    Ok(working)
}

/// Gather the attribute tuple for one corner and map it to a unified index.
fn unify_corner(
    raw_corner: &[u32],
    working: &WorkingPrimitive,
    vertex_temp: &mut [u32],
    unified: &mut ComposingUnifiedVertices,
) -> u32 {
    for input in &working.inputs {
        vertex_temp[input.element] = raw_corner[input.index_in_primitive as usize];
    }
    unified.build_unified_vertex(vertex_temp)
}

fn load_triangles(
    primitive: &SourcePrimitive,
    working: &WorkingPrimitive,
    primitive_count: usize,
    indices: &[u32],
    vertex_temp: &mut [u32],
    unified: &mut ComposingUnifiedVertices,
) -> Result<DrawOperation, GeoProcError> {
    let corner_count = primitive_count * 3;
    let stride = working.stride as usize;
    if indices.len() != corner_count * stride {
        return Err(GeoProcError::Format {
            message: format!(
                "triangle index list holds {} values, expected {}",
                indices.len(),
                corner_count * stride
            ),
            location: primitive.location.clone(),
        });
    }

    let mut final_indices = Vec::with_capacity(corner_count);
    for corner in 0..corner_count {
        let raw = &indices[corner * stride..(corner + 1) * stride];
        final_indices.push(unify_corner(raw, working, vertex_temp, unified));
    }

    Ok(DrawOperation {
        index_buffer: final_indices,
        topology: Topology::TriangleList,
        material_binding: marrow_types::hash_str(&primitive.material_binding),
    })
}

fn load_polygon_fan(
    corner_indices: &[u32],
    polygon_vertex_count: usize,
    working: &WorkingPrimitive,
    vertex_temp: &mut [u32],
    unified: &mut ComposingUnifiedVertices,
    final_indices: &mut Vec<u32>,
) {
    let stride = working.stride as usize;
    let mut unified_corners = vec![0u32; polygon_vertex_count];
    for (q, slot) in unified_corners.iter_mut().enumerate() {
        let raw = &corner_indices[q * stride..(q + 1) * stride];
        *slot = unify_corner(raw, working, vertex_temp, unified);
    }

    let mut winding = vec![0u32; polygon_vertex_count.saturating_sub(2) * 3];
    let triangle_count = create_triangle_winding_from_polygon(&mut winding, polygon_vertex_count);
    for &corner in &winding[..triangle_count * 3] {
        debug_assert!((corner as usize) < polygon_vertex_count);
        final_indices.push(unified_corners[corner as usize]);
    }
}

fn load_poly_list(
    primitive: &SourcePrimitive,
    working: &WorkingPrimitive,
    vcounts: &[u32],
    indices: &[u32],
    vertex_temp: &mut [u32],
    unified: &mut ComposingUnifiedVertices,
) -> Result<DrawOperation, GeoProcError> {
    let stride = working.stride as usize;
    let expected: usize = vcounts.iter().map(|&v| v as usize * stride).sum();
    if indices.len() != expected {
        return Err(GeoProcError::Format {
            message: format!(
                "poly-list index list holds {} values, expected {}",
                indices.len(),
                expected
            ),
            location: primitive.location.clone(),
        });
    }

    let mut final_indices = Vec::with_capacity(vcounts.len() * 6);
    let mut cursor = 0;
    for &vcount in vcounts {
        let polygon_vertex_count = vcount as usize;
        let corner_indices = &indices[cursor..cursor + polygon_vertex_count * stride];
        cursor += polygon_vertex_count * stride;
        load_polygon_fan(
            corner_indices,
            polygon_vertex_count,
            working,
            vertex_temp,
            unified,
            &mut final_indices,
        );
    }

    Ok(DrawOperation {
        index_buffer: final_indices,
        topology: Topology::TriangleList,
        material_binding: marrow_types::hash_str(&primitive.material_binding),
    })
}

fn load_polygons(
    primitive: &SourcePrimitive,
    working: &WorkingPrimitive,
    polygons: &[Vec<u32>],
    vertex_temp: &mut [u32],
    unified: &mut ComposingUnifiedVertices,
) -> Result<DrawOperation, GeoProcError> {
    let stride = working.stride as usize;
    let mut final_indices = Vec::new();
    for polygon in polygons {
        if polygon.len() % stride != 0 {
            return Err(GeoProcError::Format {
                message: format!(
                    "polygon index list holds {} values, not a multiple of stride {}",
                    polygon.len(),
                    stride
                ),
                location: primitive.location.clone(),
            });
        }
        let polygon_vertex_count = polygon.len() / stride;
        load_polygon_fan(
            polygon,
            polygon_vertex_count,
            working,
            vertex_temp,
            unified,
            &mut final_indices,
        );
    }

    Ok(DrawOperation {
        index_buffer: final_indices,
        topology: Topology::TriangleList,
        material_binding: marrow_types::hash_str(&primitive.material_binding),
    })
}

/// Unify a source mesh.
///
/// Returns `Ok(None)` (after a warning) when a primitive binds no inputs at
/// all, dropping the whole geo. Format mismatches are hard errors carrying
/// the primitive's source location.
pub fn unify_mesh(
    mesh: &SourceMesh,
    cfg: &SemanticRemapConfig,
) -> Result<Option<UnifiedMesh>, GeoProcError> {
    if mesh.primitives.is_empty() {
        log::warn!("geometry object with no primitives: {}", mesh.name);
        return Ok(None);
    }

    // First pass: decide the global element layout shared by all primitives.
    let mut composing = ComposingVertex::default();
    let mut working_primitives = Vec::with_capacity(mesh.primitives.len());
    for primitive in &mesh.primitives {
        working_primitives.push(bind_primitive(&mut composing, primitive, cfg, &mesh.name)?);
    }

    if working_primitives.iter().any(|w| w.inputs.is_empty()) {
        log::warn!("geometry object with no valid vertex inputs: {}", mesh.name);
        return Ok(None);
    }

    composing.fix_bad_semantic_indices();

    // Second pass: triangulate and build unified vertices.
    let mut vertex_temp = vec![0u32; composing.elements.len()];
    let mut unified = ComposingUnifiedVertices::new(composing.elements.len());
    let mut draw_operations = Vec::with_capacity(mesh.primitives.len());

    for (primitive, working) in mesh.primitives.iter().zip(&working_primitives) {
        let op = match &primitive.data {
            PrimitiveData::Triangles {
                primitive_count,
                indices,
            } => load_triangles(
                primitive,
                working,
                *primitive_count,
                indices,
                &mut vertex_temp,
                &mut unified,
            )?,
            PrimitiveData::PolyList { vcounts, indices } => load_poly_list(
                primitive,
                working,
                vcounts,
                indices,
                &mut vertex_temp,
                &mut unified,
            )?,
            PrimitiveData::Polygons { polygons } => {
                load_polygons(primitive, working, polygons, &mut vertex_temp, &mut unified)?
            }
        };
        draw_operations.push(op);
    }

    // Pull the unified vertices together into per-element streams.
    let unified_count = unified.unified_count();
    let mut database = MeshDatabase::new();
    for (index, element) in composing.elements.iter().enumerate() {
        let mut vertex_map = Vec::with_capacity(unified_count);
        for v in 0..unified_count {
            vertex_map
                .push(unified.unified_to_attribute_index[v * composing.elements.len() + index]);
        }
        database.add_stream(
            element.source.clone(),
            vertex_map,
            &element.semantic_name,
            element.semantic_index,
        );
    }

    Ok(Some(UnifiedMesh {
        database,
        draw_operations,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::RawVertexSource;
    use glam::{Vec2, Vec3};
    use marrow_types::semantics;

    fn attribute(
        source_id: u64,
        semantic: &str,
        source: Arc<dyn VertexSource>,
        index_in_primitive: u32,
    ) -> AttributeInput {
        AttributeInput {
            source_id,
            semantic_name: semantic.to_string(),
            semantic_index: 0,
            source,
            index_in_primitive,
        }
    }

    #[test]
    fn unify_single_triangle() {
        let positions = RawVertexSource::from_vec3s(&[Vec3::X, Vec3::Y, Vec3::Z]);
        let normals = RawVertexSource::from_vec3s(&[Vec3::Z, Vec3::Z, Vec3::Z]);
        let texcoords =
            RawVertexSource::from_vec2s(&[Vec2::ZERO, Vec2::X, Vec2::Y]);

        let mesh = SourceMesh {
            name: "tri".to_string(),
            primitives: vec![SourcePrimitive {
                inputs: vec![
                    attribute(1, semantics::POSITION, positions, 0),
                    attribute(2, semantics::NORMAL, normals, 1),
                    attribute(3, semantics::TEXCOORD, texcoords, 2),
                ],
                data: PrimitiveData::Triangles {
                    primitive_count: 1,
                    indices: vec![0, 0, 0, 1, 1, 1, 2, 2, 2],
                },
                material_binding: "mat".to_string(),
                location: "tri:0".to_string(),
            }],
        };

        let unified = unify_mesh(&mesh, &SemanticRemapConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(unified.database.unified_vertex_count(), 3);
        assert_eq!(unified.draw_operations.len(), 1);
        assert_eq!(unified.draw_operations[0].index_buffer, vec![0, 1, 2]);
        for stream in unified.database.streams() {
            assert_eq!(stream.vertex_map(), &[0, 1, 2]);
        }
    }

    #[test]
    fn unify_quad_as_poly_list() {
        let positions = RawVertexSource::from_vec3s(&[
            Vec3::ZERO,
            Vec3::X,
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::Y,
        ]);

        let mesh = SourceMesh {
            name: "quad".to_string(),
            primitives: vec![SourcePrimitive {
                inputs: vec![attribute(1, semantics::POSITION, positions, 0)],
                data: PrimitiveData::PolyList {
                    vcounts: vec![4],
                    indices: vec![0, 1, 2, 3],
                },
                material_binding: String::new(),
                location: "quad:0".to_string(),
            }],
        };

        let unified = unify_mesh(&mesh, &SemanticRemapConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(unified.database.unified_vertex_count(), 4);
        // fan pattern: (0,1,3) then (1,2,3)
        assert_eq!(
            unified.draw_operations[0].index_buffer,
            vec![0, 1, 3, 1, 2, 3]
        );
    }

    #[test]
    fn shared_corners_are_deduplicated() {
        let positions = RawVertexSource::from_vec3s(&[Vec3::ZERO, Vec3::X, Vec3::Y, Vec3::Z]);

        // two triangles sharing an edge: corner tuples repeat for 1 and 2
        let mesh = SourceMesh {
            name: "pair".to_string(),
            primitives: vec![SourcePrimitive {
                inputs: vec![attribute(1, semantics::POSITION, positions, 0)],
                data: PrimitiveData::Triangles {
                    primitive_count: 2,
                    indices: vec![0, 1, 2, 2, 1, 3],
                },
                material_binding: String::new(),
                location: "pair:0".to_string(),
            }],
        };

        let unified = unify_mesh(&mesh, &SemanticRemapConfig::default())
            .unwrap()
            .unwrap();
        assert_eq!(unified.database.unified_vertex_count(), 4);
        assert_eq!(
            unified.draw_operations[0].index_buffer,
            vec![0, 1, 2, 2, 1, 3]
        );
    }

    #[test]
    fn semantic_indices_shift_down_to_zero() {
        let positions = RawVertexSource::from_vec3s(&[Vec3::ZERO, Vec3::X, Vec3::Y]);
        let texcoords = RawVertexSource::from_vec2s(&[Vec2::ZERO, Vec2::X, Vec2::Y]);

        let mut input = attribute(2, semantics::TEXCOORD, texcoords, 1);
        input.semantic_index = 1; // exporter started at 1

        let mesh = SourceMesh {
            name: "shift".to_string(),
            primitives: vec![SourcePrimitive {
                inputs: vec![attribute(1, semantics::POSITION, positions, 0), input],
                data: PrimitiveData::Triangles {
                    primitive_count: 1,
                    indices: vec![0, 0, 1, 1, 2, 2],
                },
                material_binding: String::new(),
                location: "shift:0".to_string(),
            }],
        };

        let unified = unify_mesh(&mesh, &SemanticRemapConfig::default())
            .unwrap()
            .unwrap();
        let texcoord_stream = unified
            .database
            .find_element(semantics::TEXCOORD, 0)
            .expect("semantic index should have shifted down");
        assert_eq!(
            unified.database.streams()[texcoord_stream].semantic_index(),
            0
        );
    }

    #[test]
    fn mismatched_index_count_is_a_format_error() {
        let positions = RawVertexSource::from_vec3s(&[Vec3::ZERO, Vec3::X, Vec3::Y]);
        let mesh = SourceMesh {
            name: "bad".to_string(),
            primitives: vec![SourcePrimitive {
                inputs: vec![attribute(1, semantics::POSITION, positions, 0)],
                data: PrimitiveData::Triangles {
                    primitive_count: 1,
                    indices: vec![0, 1],
                },
                material_binding: String::new(),
                location: "bad:7".to_string(),
            }],
        };

        let err = unify_mesh(&mesh, &SemanticRemapConfig::default()).unwrap_err();
        assert!(err.to_string().contains("bad:7"));
    }

    #[test]
    fn a_three_vertex_polygon_is_a_single_triangle() {
        let mut buffer = [0u32; 3];
        assert_eq!(create_triangle_winding_from_polygon(&mut buffer, 3), 1);
        assert_eq!(buffer, [0, 1, 2]);
    }

    #[test]
    fn fan_triangulation_of_a_pentagon_covers_all_corners() {
        let mut buffer = [0u32; 9];
        let triangles = create_triangle_winding_from_polygon(&mut buffer, 5);
        assert_eq!(triangles, 3);
        let mut seen: Vec<u32> = buffer.to_vec();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}
