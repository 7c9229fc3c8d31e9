//! Derived-attribute generation and geometry clean-up passes.

use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};
use marrow_types::{semantics, IndexFormat, ProcessingFlags, VertexElement};

use crate::mesh::{
    read_element, read_element_raw, MeshDatabase, RawVertexSource, VertexSource,
};

/// The empty bounding box: min at +inf, max at -inf.
pub fn invalid_bounding_box() -> (Vec3, Vec3) {
    (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY))
}

/// Accumulate the positions of an interleaved vertex buffer into a bounding
/// box, transforming each point first.
pub fn accumulate_bounding_box(
    bounding_box: &mut (Vec3, Vec3),
    vertex_data: &[u8],
    vertex_stride: usize,
    vertex_count: usize,
    position_element: &VertexElement,
    transform: Mat4,
) {
    for v in 0..vertex_count {
        let start = v * vertex_stride + position_element.aligned_byte_offset as usize;
        let value = read_element_raw(
            &vertex_data[start..],
            position_element.format,
            ProcessingFlags::empty(),
        );
        let point = transform.transform_point3(Vec3::new(value[0], value[1], value[2]));
        bounding_box.0 = bounding_box.0.min(point);
        bounding_box.1 = bounding_box.1.max(point);
    }
}

/// Pick the direction for a derived tangent-space axis by voting against
/// the raw UV deltas, weighting each edge by its signed area contribution.
fn correct_axis_direction(
    input: Vec3,
    p0: Vec3,
    p1: Vec3,
    p2: Vec3,
    t0: f32,
    t1: f32,
    t2: f32,
) -> Vec3 {
    let a0 = (p0 - p1).dot(input);
    let a1 = (p1 - p2).dot(input);
    let a2 = (p2 - p0).dot(input);
    let d0 = t0 - t1;
    let d1 = t1 - t2;
    let d2 = t2 - t0;

    let w0 = (a0 * d0).abs();
    let w1 = (a1 * d1).abs();
    let w2 = (a2 * d2).abs();
    let (winner_a, winner_d) = if w0 > w1 {
        if w0 > w2 { (a0, d0) } else { (a2, d2) }
    } else if w1 > w2 {
        (a1, d1)
    } else {
        (a2, d2)
    };
    if (winner_a > 0.0) == (winner_d > 0.0) {
        input
    } else {
        -input
    }
}

/// Fit a plane to three points; `None` when they are (near-)collinear.
fn plane_fit(p0: Vec3, p1: Vec3, p2: Vec3) -> Option<Vec4> {
    let normal = (p1 - p0).cross(p2 - p0);
    let len_sq = normal.length_squared();
    if len_sq < 1e-20 {
        return None;
    }
    let n = normal / len_sq.sqrt();
    Some(Vec4::new(n.x, n.y, n.z, -n.dot(p0)))
}

fn read_indices(raw_ib: &[u8], format: IndexFormat) -> Vec<u32> {
    match format {
        IndexFormat::Uint16 => raw_ib
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes(b.try_into().unwrap()) as u32)
            .collect(),
        IndexFormat::Uint32 => raw_ib
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .collect(),
    }
}

/// Generate NORMAL and TEXTANGENT streams for a mesh database from its
/// index buffer (or sequential triples when `index_data` is `None`).
///
/// Semantics already present are kept. The generated tangent is
/// orthogonalised against the normal and carries handedness in w. A
/// non-zero `equivalence_threshold` merges near-identical generated values
/// through [`remove_duplicates_stream`].
pub fn generate_normals_and_tangents(
    mesh: &mut MeshDatabase,
    normal_map_texcoord_semantic_index: u32,
    equivalence_threshold: f32,
    index_data: Option<(&[u8], IndexFormat)>,
) {
    let tc_element = mesh.find_element(semantics::TEXCOORD, normal_map_texcoord_semantic_index);

    let has_normals = mesh.has_element(semantics::NORMAL) & 1 != 0;
    let has_tangents = mesh.has_element(semantics::TEXTANGENT) & 1 != 0;
    let has_bitangents = mesh.has_element(semantics::TEXBITANGENT) & 1 != 0;
    if (has_normals && has_tangents) || (has_tangents && has_bitangents) {
        return;
    }

    let pos_element = match mesh.find_element(semantics::POSITION, 0) {
        Some(e) => e,
        None => return,
    };

    let unified_count = mesh.unified_vertex_count();
    let mut normals = vec![Vec3::ZERO; unified_count];
    let mut tangents = vec![Vec4::ZERO; unified_count];
    let mut bitangents = vec![Vec3::ZERO; unified_count];

    let indices = match index_data {
        Some((raw, format)) => read_indices(raw, format),
        None => (0..unified_count as u32).collect(),
    };

    for triangle in indices.chunks_exact(3) {
        let (v0, v1, v2) = (triangle[0], triangle[1], triangle[2]);
        if v0 == v1 || v1 == v2 || v0 == v2 {
            log::warn!(
                "degenerate triangle on vertices ({}, {}, {})",
                v0,
                v1,
                v2
            );
            continue;
        }

        let p0 = mesh.unified_element_vec3(v0 as usize, pos_element);
        let p1 = mesh.unified_element_vec3(v1 as usize, pos_element);
        let p2 = mesh.unified_element_vec3(v2 as usize, pos_element);

        let plane = match plane_fit(p0, p1, p2) {
            Some(plane) => plane,
            None => {
                log::warn!(
                    "near-degenerate triangle on vertices ({}, {}, {})",
                    v0,
                    v1,
                    v2
                );
                continue;
            }
        };
        let face_normal = -plane.xyz();

        let (mut face_tangent, mut face_bitangent) = (Vec3::ZERO, Vec3::ZERO);
        if let Some(tc) = tc_element {
            let uv0 = mesh.unified_element_vec2(v0 as usize, tc);
            let uv1 = mesh.unified_element_vec2(v1 as usize, tc);
            let uv2 = mesh.unified_element_vec2(v2 as usize, tc);
            let q1 = p1 - p0;
            let q2 = p2 - p0;
            let st1 = uv1 - uv0;
            let st2 = uv2 - uv0;

            // solve the 2x2 Jacobian for the natural s/t axes
            let rr = st1.x * st2.y + st2.x * st1.y;
            if rr.abs() > 1e-10 {
                let r = 1.0 / rr;
                let s_axis = (q1 * st2.y - q2 * st1.y) * r;
                let t_axis = (q2 * st1.x - q1 * st2.x) * r;

                face_tangent =
                    correct_axis_direction(s_axis, p0, p1, p2, uv0.x, uv1.x, uv2.x);
                face_bitangent =
                    correct_axis_direction(t_axis, p0, p1, p2, uv0.y, uv1.y, uv2.y);
            }
        }

        for &v in &[v0, v1, v2] {
            normals[v as usize] += face_normal;
            tangents[v as usize] += Vec4::new(face_tangent.x, face_tangent.y, face_tangent.z, 0.0);
            bitangents[v as usize] += face_bitangent;
        }
    }

    if !has_normals {
        let normalized: Vec<Vec3> = normals.iter().map(|n| n.normalize_or_zero()).collect();
        let source = RawVertexSource::from_vec3s(&normalized);
        if equivalence_threshold != 0.0 {
            let (merged, mapping) = remove_duplicates_stream(source.as_ref(), &[], equivalence_threshold);
            mesh.add_stream(merged, mapping, semantics::NORMAL, 0);
        } else {
            mesh.add_stream(source, Vec::new(), semantics::NORMAL, 0);
        }
    }

    if tc_element.is_some() && !has_tangents {
        let normals_element = mesh.find_element(semantics::NORMAL, 0);

        // Gram-Schmidt against the final normal; the bitangent is only used
        // to derive the handedness stored in w.
        for (c, tangent) in tangents.iter_mut().enumerate() {
            let t3 = tangent.xyz();
            let n = match normals_element {
                Some(ne) if has_normals => mesh.unified_element_vec3(c, ne),
                _ => normals[c].normalize_or_zero(),
            };

            let ortho = t3 - n * n.dot(t3);
            let mut handedness = 0.0;
            let t3 = if ortho.length_squared() > f32::EPSILON {
                let t = ortho.normalize();
                handedness = if t.cross(n).dot(bitangents[c]) < 0.0 {
                    -1.0
                } else {
                    1.0
                };
                t
            } else {
                Vec3::ZERO
            };
            *tangent = Vec4::new(t3.x, t3.y, t3.z, handedness);
        }

        let source = RawVertexSource::from_vec4s(&tangents);
        if equivalence_threshold != 0.0 {
            let (merged, mapping) = remove_duplicates_stream(source.as_ref(), &[], equivalence_threshold);
            mesh.add_stream(merged, mapping, semantics::TEXTANGENT, 0);
        } else {
            mesh.add_stream(source, Vec::new(), semantics::TEXTANGENT, 0);
        }
    }
}

fn quantized_coords(
    source: &dyn VertexSource,
    quantization: f32,
    offset: f32,
) -> Vec<([i32; 4], u32)> {
    let mut result = Vec::with_capacity(source.count());
    for c in 0..source.count() {
        let v = read_element(source, c);
        result.push((
            [
                ((v[0] + offset) / quantization) as i32,
                ((v[1] + offset) / quantization) as i32,
                ((v[2] + offset) / quantization) as i32,
                ((v[3] + offset) / quantization) as i32,
            ],
            c as u32,
        ));
    }
    result
}

fn find_vertex_pairs(
    close_vertices: &mut Vec<(u32, u32)>,
    quantized: &mut [([i32; 4], u32)],
    source: &dyn VertexSource,
    threshold: f32,
) {
    quantized.sort_unstable();

    let threshold_sq = threshold * threshold;
    let mut run_start = 0;
    while run_start < quantized.len() {
        let mut run_end = run_start + 1;
        while run_end < quantized.len() && quantized[run_end].0 == quantized[run_start].0 {
            run_end += 1;
        }

        // all vertices in this run share quantised coordinates; brute-force
        // the true distances
        let run = &quantized[run_start..run_end];
        let mut processed_identical = vec![false; run.len()];
        for i in 0..run.len() {
            if processed_identical[i] {
                continue;
            }
            let a = read_element(source, run[i].1 as usize);
            for j in i + 1..run.len() {
                let b = read_element(source, run[j].1 as usize);
                let dist_sq = (0..4).map(|c| (b[c] - a[c]) * (b[c] - a[c])).sum::<f32>();
                if dist_sq < threshold_sq {
                    let pair = (run[i].1.min(run[j].1), run[i].1.max(run[j].1));
                    if let Err(slot) = close_vertices.binary_search(&pair) {
                        close_vertices.insert(slot, pair);
                    }
                    if dist_sq == 0.0 {
                        processed_identical[j] = true;
                    }
                }
            }
        }

        run_start = run_end;
    }
}

fn closest_to_average(source: &dyn VertexSource, chain: &[u32]) -> u32 {
    let mut average = [0.0f32; 4];
    for &c in chain {
        let v = read_element(source, c as usize);
        for q in 0..4 {
            average[q] += v[q];
        }
    }
    for q in average.iter_mut() {
        *q /= chain.len() as f32;
    }

    let mut best = (f32::MAX, chain[0]);
    for &c in chain {
        let v = read_element(source, c as usize);
        let dist_sq = (0..4).map(|q| (v[q] - average[q]) * (v[q] - average[q])).sum::<f32>();
        if dist_sq < best.0 {
            best = (dist_sq, c);
        }
    }
    best.1
}

/// Merge near-identical values of a vertex source.
///
/// Space is quantised into grids of `2 * threshold` at two offsets (zero
/// and half a cell) to find candidate pairs, candidates are confirmed with
/// an exact distance test, pairs are chained breadth-first, and each chain
/// collapses to its medoid. Returns the compacted source plus the updated
/// unified-index mapping (`original_mapping` composed with the collapse,
/// or the raw collapse when it is empty).
pub fn remove_duplicates_stream(
    source: &dyn VertexSource,
    original_mapping: &[u32],
    threshold: f32,
) -> (Arc<dyn VertexSource>, Vec<u32>) {
    let cell = 2.0 * threshold;
    let mut quantized0 = quantized_coords(source, cell, 0.0);
    let mut quantized1 = quantized_coords(source, cell, threshold);

    let mut close_vertices = Vec::new();
    find_vertex_pairs(&mut close_vertices, &mut quantized0, source, threshold);
    find_vertex_pairs(&mut close_vertices, &mut quantized1, source, threshold);

    let vertex_size = source.format().bytes() as usize;
    let mut final_data = Vec::with_capacity(vertex_size * source.count());
    let mut final_count = 0u32;
    let mut old_to_new = vec![u32::MAX; source.count()];

    let mut chain = Vec::with_capacity(32);
    let mut pending = std::collections::VecDeque::new();
    for c in 0..source.count() as u32 {
        if old_to_new[c as usize] != u32::MAX {
            continue;
        }

        chain.clear();
        pending.push_back(c);
        while let Some(link) = pending.pop_front() {
            if chain.contains(&link) {
                continue;
            }
            chain.push(link);

            let run_start = close_vertices.partition_point(|&(a, _)| a < link);
            for &(a, b) in &close_vertices[run_start..] {
                if a != link {
                    break;
                }
                pending.push_back(b);
            }
        }

        let representative = if chain.len() > 1 {
            closest_to_average(source, &chain)
        } else {
            c
        };
        let start = representative as usize * source.stride();
        final_data.extend_from_slice(&source.data()[start..start + vertex_size]);
        for &link in &chain {
            old_to_new[link as usize] = final_count;
        }
        final_count += 1;
    }

    let mapping = if original_mapping.is_empty() {
        old_to_new
    } else {
        original_mapping
            .iter()
            .map(|&i| old_to_new[i as usize])
            .collect()
    };

    (
        RawVertexSource::new(final_data, final_count as usize, vertex_size, source.format()),
        mapping,
    )
}

/// Collapse unified vertices whose per-stream source indices all match.
///
/// Assumes stream values have already been deduplicated, so identical
/// vertex-map entries mean identical values. Returns the compacted database
/// and the old unified index -> new unified index mapping.
pub fn remove_duplicates_mesh(input: &MeshDatabase) -> (MeshDatabase, Vec<u32>) {
    let stream_count = input.streams().len();
    let mut output_mapping = Vec::with_capacity(input.unified_vertex_count());
    let mut new_stream_maps: Vec<Vec<u32>> = vec![Vec::new(); stream_count];
    let mut seen: marrow_types::FastHashMap<Vec<u32>, u32> = marrow_types::FastHashMap::default();

    for v in 0..input.unified_vertex_count() {
        let key: Vec<u32> = input
            .streams()
            .iter()
            .map(|s| s.resolve(v) as u32)
            .collect();
        if let Some(&existing) = seen.get(&key) {
            output_mapping.push(existing);
        } else {
            let new_index = seen.len() as u32;
            for (s, &mapped) in new_stream_maps.iter_mut().zip(&key) {
                s.push(mapped);
            }
            seen.insert(key, new_index);
            output_mapping.push(new_index);
        }
    }

    let mut result = MeshDatabase::new();
    for (stream, map) in input.streams().iter().zip(new_stream_maps) {
        result.add_stream(
            stream.source().clone(),
            map,
            stream.semantic_name(),
            stream.semantic_index(),
        );
    }

    (result, output_mapping)
}

/// Transform POSITION streams as points and the normal/tangent family as
/// unit vectors. Texture coordinates and other streams are untouched.
pub fn transform_mesh(mesh: &mut MeshDatabase, transform: Mat4) {
    #[derive(PartialEq)]
    enum Kind {
        Point,
        UnitVector,
    }

    let rotation = Mat4::from_quat(
        glam::Quat::from_mat4(&transform).normalize(),
    );

    let stream_info: Vec<Option<Kind>> = mesh
        .streams()
        .iter()
        .map(|s| match s.semantic_name().to_ascii_uppercase().as_str() {
            "POSITION" => Some(Kind::Point),
            "NORMAL" | "TEXTANGENT" | "TEXBITANGENT" | "TANGENT" | "BITANGENT" | "BINORMAL" => {
                Some(Kind::UnitVector)
            }
            _ => None,
        })
        .collect();

    for (index, kind) in stream_info.into_iter().enumerate() {
        let kind = match kind {
            Some(kind) => kind,
            None => continue,
        };

        let stream = &mesh.streams()[index];
        let source = stream.source().clone();
        let format = source.format();
        let semantic_name = stream.semantic_name().to_string();
        let semantic_index = stream.semantic_index();
        let vertex_map = stream.vertex_map().to_vec();

        let mut values: Vec<Vec4> = (0..source.count())
            .map(|c| Vec4::from_array(read_element(source.as_ref(), c)))
            .collect();
        for value in &mut values {
            match kind {
                Kind::Point => {
                    let p = transform.transform_point3(value.xyz());
                    *value = Vec4::new(p.x, p.y, p.z, value.w);
                }
                Kind::UnitVector => {
                    let v = rotation.transform_vector3(value.xyz());
                    *value = Vec4::new(v.x, v.y, v.z, value.w);
                }
            }
        }

        // keep the stream in its original format
        let stride = format.bytes() as usize;
        let mut data = vec![0u8; stride * values.len()];
        for (c, value) in values.iter().enumerate() {
            crate::mesh::write_element_raw(&mut data[c * stride..], format, value.to_array());
        }

        mesh.remove_stream(index);
        mesh.insert_stream(
            index,
            RawVertexSource::new(data, values.len(), stride, format),
            vertex_map,
            &semantic_name,
            semantic_index,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_types::Format;

    #[test]
    fn bounding_box_accumulates_min_max() {
        let positions = [Vec3::new(-1.0, 2.0, 0.5), Vec3::new(3.0, -4.0, 0.0)];
        let element = VertexElement::new(semantics::POSITION, 0, Format::Rgb32Float, 0);
        let mut bbox = invalid_bounding_box();
        accumulate_bounding_box(
            &mut bbox,
            bytemuck::cast_slice(&positions),
            12,
            2,
            &element,
            Mat4::IDENTITY,
        );
        assert_eq!(bbox.0, Vec3::new(-1.0, -4.0, 0.0));
        assert_eq!(bbox.1, Vec3::new(3.0, 2.0, 0.5));
    }

    fn flat_quad_mesh() -> (MeshDatabase, Vec<u8>) {
        let positions = [
            Vec3::ZERO,
            Vec3::X,
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::Y,
        ];
        let texcoords = [
            Vec2::ZERO,
            Vec2::X,
            Vec2::new(1.0, 1.0),
            Vec2::Y,
        ];
        let mut mesh = MeshDatabase::new();
        mesh.add_stream(
            RawVertexSource::from_vec3s(&positions),
            Vec::new(),
            semantics::POSITION,
            0,
        );
        mesh.add_stream(
            RawVertexSource::from_vec2s(&texcoords),
            Vec::new(),
            semantics::TEXCOORD,
            0,
        );
        let indices: Vec<u16> = vec![0, 1, 2, 0, 2, 3];
        (mesh, bytemuck::cast_slice(&indices).to_vec())
    }

    #[test]
    fn generated_normals_are_unit_and_planar() {
        let (mut mesh, ib) = flat_quad_mesh();
        generate_normals_and_tangents(&mut mesh, 0, 0.0, Some((&ib, IndexFormat::Uint16)));

        let normal_element = mesh.find_element(semantics::NORMAL, 0).unwrap();
        for v in 0..mesh.unified_vertex_count() {
            let n = mesh.unified_element_vec3(v, normal_element);
            assert!((n.length() - 1.0).abs() < 1e-5);
            assert!((n.x.abs(), n.y.abs()) == (0.0, 0.0));
        }
    }

    #[test]
    fn generated_tangents_are_orthogonal_with_handedness() {
        let (mut mesh, ib) = flat_quad_mesh();
        generate_normals_and_tangents(&mut mesh, 0, 0.0, Some((&ib, IndexFormat::Uint16)));

        let tangent_element = mesh.find_element(semantics::TEXTANGENT, 0).unwrap();
        let normal_element = mesh.find_element(semantics::NORMAL, 0).unwrap();
        for v in 0..mesh.unified_vertex_count() {
            let t = mesh.unified_element(v, tangent_element);
            let n = mesh.unified_element_vec3(v, normal_element);
            let t3 = Vec3::new(t[0], t[1], t[2]);
            assert!((t3.length() - 1.0).abs() < 1e-5);
            assert!(t3.dot(n).abs() < 1e-5);
            assert!(t[3] == 1.0 || t[3] == -1.0);
        }
    }

    #[test]
    fn degenerate_triangles_contribute_nothing() {
        let (mut mesh, _) = flat_quad_mesh();
        let indices: Vec<u16> = vec![0, 0, 1, 0, 1, 2];
        let ib: Vec<u8> = bytemuck::cast_slice(&indices).to_vec();
        generate_normals_and_tangents(&mut mesh, 0, 0.0, Some((&ib, IndexFormat::Uint16)));

        let normal_element = mesh.find_element(semantics::NORMAL, 0).unwrap();
        // vertex 3 is not referenced by any valid triangle
        assert_eq!(mesh.unified_element_vec3(3, normal_element), Vec3::ZERO);
    }

    #[test]
    fn duplicate_removal_merges_close_vertices() {
        let values = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.0005, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
        ];
        let source = RawVertexSource::from_vec3s(&values);
        let (merged, mapping) = remove_duplicates_stream(source.as_ref(), &[], 0.001);

        assert_eq!(merged.count(), 2);
        assert_eq!(mapping[0], mapping[1]);
        assert_ne!(mapping[0], mapping[2]);
    }

    #[test]
    fn duplicate_removal_keeps_distant_vertices() {
        let values = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let source = RawVertexSource::from_vec3s(&values);
        let (merged, mapping) = remove_duplicates_stream(source.as_ref(), &[], 0.001);
        assert_eq!(merged.count(), 3);
        assert_eq!(mapping, vec![0, 1, 2]);
    }

    #[test]
    fn mesh_level_dedup_collapses_identical_tuples() {
        let mut mesh = MeshDatabase::new();
        mesh.add_stream(
            RawVertexSource::from_vec3s(&[Vec3::ZERO, Vec3::X]),
            vec![0, 1, 0],
            semantics::POSITION,
            0,
        );
        mesh.add_stream(
            RawVertexSource::from_vec2s(&[Vec2::ZERO, Vec2::X]),
            vec![0, 1, 0],
            semantics::TEXCOORD,
            0,
        );

        let (result, mapping) = remove_duplicates_mesh(&mesh);
        assert_eq!(result.unified_vertex_count(), 2);
        assert_eq!(mapping, vec![0, 1, 0]);
    }

    #[test]
    fn transform_moves_points_but_only_rotates_normals() {
        let mut mesh = MeshDatabase::new();
        mesh.add_stream(
            RawVertexSource::from_vec3s(&[Vec3::X]),
            Vec::new(),
            semantics::POSITION,
            0,
        );
        mesh.add_stream(
            RawVertexSource::from_vec3s(&[Vec3::X]),
            Vec::new(),
            semantics::NORMAL,
            0,
        );

        transform_mesh(&mut mesh, Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0)));

        let position = mesh.unified_element_vec3(0, 0);
        let normal = mesh.unified_element_vec3(0, 1);
        assert_eq!(position, Vec3::new(1.0, 0.0, 5.0));
        assert_eq!(normal, Vec3::X);
    }
}
