//! Skin binding: bucket per-vertex influences by count, then rebuild a
//! unified geometry into the GPU layout the preskinning pass consumes.

use glam::Mat4;
use marrow_types::{
    calculate_vertex_stride, semantics, DrawCall, Format, IndexFormat, InputAssembly, Topology,
    VertexElement,
};
use smallvec::SmallVec;

use crate::algorithm::{accumulate_bounding_box, invalid_bounding_box};
use crate::nascent::NascentRawGeometry;
use crate::GeoProcError;

/// Hard cap on raw influences per vertex; anything above this is malformed
/// source data.
pub const ABSOLUTE_MAX_JOINT_INFLUENCE_COUNT: usize = 256;

/// Influences with a normalized weight below this are culled before
/// bucketing.
pub const MIN_WEIGHT_THRESHOLD: f32 = 8.0 / 255.0;

const BUCKET_WEIGHT_COUNTS: [u32; 4] = [4, 2, 1, 0];

/// Skinning source data as produced by a DCC exporter, indexed by source
/// position.
pub struct RawSkinController {
    pub bind_shape_matrix: Mat4,
    pub inverse_bind_matrices: Vec<Mat4>,
    pub joint_names: Vec<String>,
    /// Per position: `(joint_index, weight)` pairs.
    pub influences: Vec<Vec<(u32, f32)>>,
    pub location: String,
}

/// One influence-count bucket of an [`UnboundSkinController`].
#[derive(Default)]
pub struct Bucket {
    pub weight_count: u32,
    /// Position index of each record, in record order.
    pub vertex_bindings: Vec<u16>,
    /// Packed records: `weight_count` weight bytes then `weight_count`
    /// joint-index bytes per vertex.
    pub records: Vec<u8>,
    pub input_layout: Vec<VertexElement>,
}

impl Bucket {
    fn new(weight_count: u32) -> Self {
        let input_layout = if weight_count == 0 {
            Vec::new()
        } else {
            let weight_format = match weight_count {
                1 => Format::R8Unorm,
                2 => Format::Rg8Unorm,
                _ => Format::Rgba8Unorm,
            };
            let joint_format = match weight_count {
                1 => Format::R8Uint,
                2 => Format::Rg8Uint,
                _ => Format::Rgba8Uint,
            };
            vec![
                VertexElement::new(semantics::WEIGHTS, 0, weight_format, 0),
                VertexElement::new(semantics::JOINT_INDICES, 0, joint_format, weight_count),
            ]
        };
        Self {
            weight_count,
            vertex_bindings: Vec::new(),
            records: Vec::new(),
            input_layout,
        }
    }

    pub fn record_stride(&self) -> usize {
        calculate_vertex_stride(&self.input_layout) as usize
    }

    fn push_record(&mut self, position: u16, weights: &[u8], joints: &[u32]) {
        self.vertex_bindings.push(position);
        let n = self.weight_count as usize;
        for c in 0..n {
            self.records.push(weights.get(c).copied().unwrap_or(0));
        }
        for c in 0..n {
            self.records.push(joints.get(c).map_or(0, |&j| j as u8));
        }
    }
}

/// Per-position influence data bucketed by count, before binding to a
/// unified geometry.
pub struct UnboundSkinController {
    /// Buckets in order: 4, 2, 1, 0 influences.
    pub buckets: [Bucket; 4],
    pub inverse_bind_matrices: Vec<Mat4>,
    pub bind_shape_matrix: Mat4,
    pub joint_names: Vec<String>,
    /// position index -> `(bucket_id << 16) | index_in_bucket`.
    pub position_index_to_bucket_index: Vec<u32>,
}

/// Preprocess raw influences into buckets.
///
/// Weights below [`MIN_WEIGHT_THRESHOLD`] are culled, the remainder is
/// renormalized and quantised to 8-bit unorm, and more than four surviving
/// influences keep the first four with a warning.
pub fn build_unbound_controller(
    raw: &RawSkinController,
) -> Result<UnboundSkinController, GeoProcError> {
    let vertex_count = raw.influences.len();
    if vertex_count >= u16::MAX as usize {
        return Err(GeoProcError::Format {
            message: format!(
                "skinning controller has {} vertices, exceeding the 16-bit limit",
                vertex_count
            ),
            location: raw.location.clone(),
        });
    }

    let mut buckets = [
        Bucket::new(4),
        Bucket::new(2),
        Bucket::new(1),
        Bucket::new(0),
    ];
    let mut position_index_to_bucket_index = Vec::with_capacity(vertex_count);

    for (position, raw_influences) in raw.influences.iter().enumerate() {
        if raw_influences.len() > ABSOLUTE_MAX_JOINT_INFLUENCE_COUNT {
            return Err(GeoProcError::Format {
                message: format!(
                    "vertex {} has {} influences, exceeding the absolute cap of {}",
                    position,
                    raw_influences.len(),
                    ABSOLUTE_MAX_JOINT_INFLUENCE_COUNT
                ),
                location: raw.location.clone(),
            });
        }

        // cull weak influences, then renormalize what survives
        let mut influences: SmallVec<[(u32, f32); 8]> = raw_influences
            .iter()
            .copied()
            .filter(|&(_, w)| w >= MIN_WEIGHT_THRESHOLD)
            .collect();
        let total_weight: f32 = influences.iter().map(|&(_, w)| w).sum();

        #[cfg(debug_assertions)]
        for c in 1..influences.len() {
            debug_assert!(
                !influences[..c].iter().any(|&(j, _)| j == influences[c].0),
                "joint referenced twice on vertex {}",
                position
            );
        }

        let mut weights: SmallVec<[u8; 8]> = SmallVec::new();
        let mut joints: SmallVec<[u32; 8]> = SmallVec::new();
        for &(joint, weight) in &influences {
            if joint as usize >= raw.joint_names.len() || joint >= 256 {
                return Err(GeoProcError::Format {
                    message: format!(
                        "vertex {} references joint {} outside the controller's {} joints",
                        position,
                        joint,
                        raw.joint_names.len()
                    ),
                    location: raw.location.clone(),
                });
            }
            weights.push(((weight / total_weight).clamp(0.0, 1.0) * 255.0 + 0.5) as u8);
            joints.push(joint);
        }

        let bucket_id = match influences.len() {
            n if n >= 3 => {
                if n > 4 {
                    log::warn!(
                        "vertex {} has {} influences; keeping the first 4, discarding joints {:?} ({})",
                        position,
                        n,
                        joints[4..].to_vec(),
                        raw.location
                    );
                    influences.truncate(4);
                    weights.truncate(4);
                    joints.truncate(4);
                }
                0
            }
            2 => 1,
            1 => 2,
            _ => 3,
        };

        let bucket = &mut buckets[bucket_id];
        position_index_to_bucket_index
            .push(((bucket_id as u32) << 16) | (bucket.vertex_bindings.len() as u32 & 0xffff));
        bucket.push_record(position as u16, &weights, &joints);
    }

    Ok(UnboundSkinController {
        buckets,
        inverse_bind_matrices: raw.inverse_bind_matrices.clone(),
        bind_shape_matrix: raw.bind_shape_matrix,
        joint_names: raw.joint_names.clone(),
        position_index_to_bucket_index,
    })
}

impl UnboundSkinController {
    /// Remove joints with no bucket references and renumber the rest
    /// contiguously. Records, inverse-bind matrices and joint names are
    /// rewritten in place. Returns the old -> new mapping with `u32::MAX`
    /// for removed joints.
    pub fn remap_unused_joints(&mut self) -> Vec<u32> {
        let mut usage = vec![0u32; self.joint_names.len().max(1)];
        for bucket in &self.buckets {
            let n = bucket.weight_count as usize;
            if n == 0 {
                continue;
            }
            let stride = bucket.record_stride();
            for record in bucket.records.chunks_exact(stride) {
                for &joint in &record[n..2 * n] {
                    usage[joint as usize] += 1;
                }
            }
        }

        let mut remap = vec![u32::MAX; self.joint_names.len()];
        let mut next = 0u32;
        for (old, &count) in usage.iter().enumerate().take(self.joint_names.len()) {
            if count != 0 {
                remap[old] = next;
                next += 1;
            }
        }

        for bucket in &mut self.buckets {
            let n = bucket.weight_count as usize;
            if n == 0 {
                continue;
            }
            let stride = bucket.record_stride();
            for record in bucket.records.chunks_exact_mut(stride) {
                for joint in &mut record[n..2 * n] {
                    *joint = remap[*joint as usize] as u8;
                }
            }
        }

        let final_count = next as usize;
        let mut new_names = vec![String::new(); final_count];
        let mut new_inverse_binds = vec![Mat4::IDENTITY; final_count];
        for (old, &new) in remap.iter().enumerate() {
            if new != u32::MAX {
                new_names[new as usize] = self.joint_names[old].clone();
                if let Some(&ibm) = self.inverse_bind_matrices.get(old) {
                    new_inverse_binds[new as usize] = ibm;
                }
            }
        }
        self.joint_names = new_names;
        self.inverse_bind_matrices = new_inverse_binds;

        remap
    }
}

/// The result of binding a controller to a unified geometry.
pub struct NascentBoundSkinnedGeometry {
    pub unanimated_vertex_elements: Vec<u8>,
    pub animated_vertex_elements: Vec<u8>,
    pub skeleton_binding_vertices: Vec<u8>,
    pub indices: Vec<u8>,
    pub index_format: IndexFormat,
    pub main_draw_calls: Vec<DrawCall>,
    pub material_bindings: Vec<u64>,
    pub unanimated_ia: InputAssembly,
    pub animated_ia: InputAssembly,
    pub preskinning_ia: InputAssembly,
    pub preskinning_draw_calls: Vec<DrawCall>,
    /// `bind_shape * inverse_bind`, premultiplied, by remapped joint index.
    pub bind_shape_by_inverse_bind: Vec<Mat4>,
    /// Remapped joint index -> command-stream joint slot.
    pub joint_matrices: Vec<u16>,
    pub geo_space_to_node_space: Mat4,
    pub local_bounding_box: (glam::Vec3, glam::Vec3),
    pub unified_vertex_count: usize,
}

/// Whether normals move to the animated vertex buffer alongside positions.
const SKIN_NORMALS: bool = true;

fn is_animated_semantic(name: &str) -> bool {
    name.eq_ignore_ascii_case(semantics::POSITION)
        || (SKIN_NORMALS && name.eq_ignore_ascii_case(semantics::NORMAL))
}

/// Copy elements between two interleaved vertex buffers, routing vertex `v`
/// of the source to `reordering[v]` in the destination. Elements are
/// matched by semantic; formats are unchanged.
fn copy_vertex_elements(
    dst: &mut [u8],
    dst_stride: usize,
    dst_layout: &[VertexElement],
    src: &[u8],
    src_stride: usize,
    src_layout: &[VertexElement],
    reordering: &[u32],
) {
    for dst_element in dst_layout {
        let src_element = src_layout
            .iter()
            .find(|e| {
                e.semantic_name == dst_element.semantic_name
                    && e.semantic_index == dst_element.semantic_index
            })
            .expect("destination layouts are built from the source layout");
        let size = dst_element.format.bytes() as usize;
        for (old, &new) in reordering.iter().enumerate() {
            let src_start = old * src_stride + src_element.aligned_byte_offset as usize;
            let dst_start = new as usize * dst_stride + dst_element.aligned_byte_offset as usize;
            dst[dst_start..dst_start + size].copy_from_slice(&src[src_start..src_start + size]);
        }
    }
}

fn packed_layout(mut elements: Vec<VertexElement>) -> InputAssembly {
    let mut offset = 0;
    for element in &mut elements {
        element.aligned_byte_offset = offset;
        offset += element.format.bytes();
    }
    InputAssembly {
        vertex_stride: offset,
        elements,
    }
}

/// Bind an unbound controller to a unified geometry.
pub fn bind_controller(
    source_geo: &NascentRawGeometry,
    mut controller: UnboundSkinController,
    joint_matrices: &[u16],
    node_name: &str,
) -> Result<NascentBoundSkinnedGeometry, GeoProcError> {
    let unified_vertex_count = source_geo.unified_vertex_count;
    let position_map = &source_geo.unified_vertex_index_to_position_index;

    // Pair each unified vertex with its bucket, then order by bucket id.
    // The sort is stable so relative order within a bucket is preserved.
    let mut unified_to_bucket: Vec<(u32, u32)> = (0..unified_vertex_count as u32)
        .map(|c| {
            let position = position_map.get(c as usize).copied().unwrap_or(c);
            (c, controller.position_index_to_bucket_index[position as usize])
        })
        .collect();
    unified_to_bucket.sort_by_key(|&(_, bucket)| bucket >> 16);

    let mut unified_vertex_reordering = vec![u32::MAX; unified_vertex_count];
    let mut new_unified_to_position = vec![u32::MAX; unified_vertex_count];
    let mut bucket_start = [0u32; 4];
    let mut bucket_end = [0u32; 4];

    let mut current_bucket = 0;
    let mut accumulator = 0u32;
    for &(old_index, bucket) in &unified_to_bucket {
        let bucket_id = (bucket >> 16) as usize;
        while current_bucket < bucket_id {
            bucket_end[current_bucket] = accumulator;
            current_bucket += 1;
            bucket_start[current_bucket] = accumulator;
        }
        let new_index = accumulator;
        accumulator += 1;
        unified_vertex_reordering[old_index as usize] = new_index;
        new_unified_to_position[new_index as usize] = position_map
            .get(old_index as usize)
            .copied()
            .unwrap_or(old_index);
    }
    bucket_end[current_bucket] = accumulator;
    for b in current_bucket + 1..4 {
        bucket_start[b] = accumulator;
        bucket_end[b] = accumulator;
    }
    if accumulator as usize != unified_vertex_count {
        return Err(GeoProcError::Format {
            message: "vertex count mismatch while reordering by bucket".to_string(),
            location: node_name.to_string(),
        });
    }

    // Split the source layout into animated and unanimated parts, and
    // repack both to offset zero.
    let mut unanimated_elements = Vec::new();
    let mut animated_elements = Vec::new();
    for element in &source_geo.input_assembly.elements {
        if is_animated_semantic(&element.semantic_name) {
            animated_elements.push(element.clone());
        } else {
            unanimated_elements.push(element.clone());
        }
    }
    let unanimated_ia = packed_layout(unanimated_elements);
    let animated_ia = packed_layout(animated_elements);

    if animated_ia.vertex_stride == 0 {
        return Err(GeoProcError::Format {
            message: "no animated vertex elements in skinning controller".to_string(),
            location: node_name.to_string(),
        });
    }

    let mut unanimated_vb =
        vec![0u8; unanimated_ia.vertex_stride as usize * unified_vertex_count];
    let mut animated_vb = vec![0u8; animated_ia.vertex_stride as usize * unified_vertex_count];
    copy_vertex_elements(
        &mut unanimated_vb,
        unanimated_ia.vertex_stride as usize,
        &unanimated_ia.elements,
        &source_geo.vertices,
        source_geo.input_assembly.vertex_stride as usize,
        &source_geo.input_assembly.elements,
        &unified_vertex_reordering,
    );
    copy_vertex_elements(
        &mut animated_vb,
        animated_ia.vertex_stride as usize,
        &animated_ia.elements,
        &source_geo.vertices,
        source_geo.input_assembly.vertex_stride as usize,
        &source_geo.input_assembly.elements,
        &unified_vertex_reordering,
    );

    // The index buffer refers to the old ordering; rewrite it.
    let mut indices = vec![0u8; source_geo.indices.len()];
    match source_geo.index_format {
        IndexFormat::Uint32 => {
            for (dst, src) in indices
                .chunks_exact_mut(4)
                .zip(source_geo.indices.chunks_exact(4))
            {
                let value = u32::from_le_bytes(src.try_into().unwrap());
                let remapped = unified_vertex_reordering[value as usize];
                dst.copy_from_slice(&remapped.to_le_bytes());
            }
        }
        IndexFormat::Uint16 => {
            for (dst, src) in indices
                .chunks_exact_mut(2)
                .zip(source_geo.indices.chunks_exact(2))
            {
                let value = u16::from_le_bytes(src.try_into().unwrap());
                let remapped = unified_vertex_reordering[value as usize];
                debug_assert!(remapped <= 0xffff);
                dst.copy_from_slice(&(remapped as u16).to_le_bytes());
            }
        }
    }

    // Drop unreferenced joints before the records are expanded out.
    let joint_remap = controller.remap_unused_joints();
    let final_joint_count = controller.joint_names.len();
    let mut remapped_joint_matrices = vec![0u16; final_joint_count];
    for (old, &new) in joint_remap.iter().enumerate() {
        if new != u32::MAX {
            remapped_joint_matrices[new as usize] = joint_matrices.get(old).copied().unwrap_or(0);
        }
    }

    // The skeleton-binding buffer holds one record per unified vertex at
    // the largest bucket's stride; smaller records are zero-padded.
    let mut binding_stride = 0usize;
    let mut final_weight_layout: Option<&Bucket> = None;
    for bucket in &controller.buckets {
        if !bucket.records.is_empty() && bucket.record_stride() > binding_stride {
            binding_stride = bucket.record_stride();
            final_weight_layout = Some(bucket);
        }
    }
    if binding_stride != 0 && binding_stride < 4 {
        log::warn!(
            "skeleton binding stride expanded from {} to 4 for vertex alignment in node {}",
            binding_stride,
            node_name
        );
        binding_stride = 4;
    }

    let mut skeleton_binding_vertices = Vec::new();
    let mut preskinning_ia = InputAssembly::default();
    if let Some(final_bucket) = final_weight_layout {
        skeleton_binding_vertices = vec![0u8; binding_stride * unified_vertex_count];
        let final_layout = &final_bucket.input_layout;

        for (new_index, &position) in new_unified_to_position.iter().enumerate() {
            let encoded = controller.position_index_to_bucket_index[position as usize];
            let bucket = &controller.buckets[(encoded >> 16) as usize];
            let index_in_bucket = (encoded & 0xffff) as usize;
            let src_stride = bucket.record_stride();
            if src_stride == 0 {
                continue;
            }
            debug_assert_eq!(bucket.vertex_bindings[index_in_bucket], position as u16);

            let src = &bucket.records[index_in_bucket * src_stride..(index_in_bucket + 1) * src_stride];
            let dst = &mut skeleton_binding_vertices
                [new_index * binding_stride..new_index * binding_stride + binding_stride];
            if src_stride == binding_stride {
                dst[..src_stride].copy_from_slice(src);
            } else {
                // expand the smaller record format into the wider layout
                for (src_element, dst_element) in
                    bucket.input_layout.iter().zip(final_layout.iter())
                {
                    let size = (src_element.format.bytes() as usize)
                        .min(dst_element.format.bytes() as usize);
                    let s = src_element.aligned_byte_offset as usize;
                    let d = dst_element.aligned_byte_offset as usize;
                    dst[d..d + size].copy_from_slice(&src[s..s + size]);
                }
            }
        }

        preskinning_ia = InputAssembly {
            elements: final_layout.clone(),
            vertex_stride: binding_stride as u32,
        };
    }

    // Preskinning draw calls, one per non-empty bucket.
    let mut preskinning_draw_calls = Vec::new();
    for (bucket_id, &weight_count) in BUCKET_WEIGHT_COUNTS.iter().enumerate() {
        if bucket_end[bucket_id] > bucket_start[bucket_id] {
            preskinning_draw_calls.push(DrawCall {
                first_index: 0,
                index_count: bucket_end[bucket_id] - bucket_start[bucket_id],
                first_vertex: bucket_start[bucket_id],
                sub_material_index: weight_count,
                topology: Topology::PointList,
            });
        }
    }

    let bind_shape_by_inverse_bind: Vec<Mat4> = controller
        .inverse_bind_matrices
        .iter()
        .map(|&ibm| controller.bind_shape_matrix * ibm)
        .collect();

    // Bounding box over the animated buffer, where positions now live.
    let mut bounding_box = invalid_bounding_box();
    if let Some(position) = animated_ia.find_element(semantics::POSITION, 0) {
        accumulate_bounding_box(
            &mut bounding_box,
            &animated_vb,
            animated_ia.vertex_stride as usize,
            unified_vertex_count,
            position,
            Mat4::IDENTITY,
        );
    }

    Ok(NascentBoundSkinnedGeometry {
        unanimated_vertex_elements: unanimated_vb,
        animated_vertex_elements: animated_vb,
        skeleton_binding_vertices,
        indices,
        index_format: source_geo.index_format,
        main_draw_calls: source_geo.draw_calls.clone(),
        material_bindings: source_geo.material_bindings.clone(),
        unanimated_ia,
        animated_ia,
        preskinning_ia,
        preskinning_draw_calls,
        bind_shape_by_inverse_bind,
        joint_matrices: remapped_joint_matrices,
        geo_space_to_node_space: source_geo.geo_space_to_node_space,
        local_bounding_box: bounding_box,
        unified_vertex_count,
    })
}
