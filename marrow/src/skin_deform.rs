//! The built-in `"skin"` deform operation: host-side linear-blend skinning
//! of positions, driven by the latest skeleton machine output.

use std::any::Any;
use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use marrow_anim::{OutputInterface, SkeletonBinding};
use marrow_types::{semantic_hash, semantics, DrawCall, Format};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::deform::{DeformOperation, DeformOperationInstantiation, NameAndFormat};
use crate::renderer::RendererError;
use crate::scaffold::ModelScaffold;
use crate::vertex_util::{VertexElementRange, VertexElementRangeMut};

struct SkinSection {
    bind_shape_by_inverse_bind: Vec<Mat4>,
    /// Remapped joint index -> command-stream joint slot.
    joint_matrices: Vec<u16>,
    preskinning_draw_calls: Vec<DrawCall>,
}

/// The per-frame skeleton state, swapped in by
/// [`SkinDeformer::feed_in_skeleton_machine_results`].
#[derive(Default)]
struct Pose {
    skeleton_machine_output: Vec<Mat4>,
    binding: SkeletonBinding,
}

/// Skins one skinned geo of a model scaffold.
///
/// Weights and joint indices are pulled out of the scaffold's
/// skeleton-binding vertex buffer once at construction; per frame only the
/// joint matrices change.
pub struct SkinDeformer {
    joint_weights: Vec<Vec4>,
    joint_indices: Vec<[u32; 4]>,
    sections: Vec<SkinSection>,
    joint_input_interface: Vec<u64>,
    pose: Mutex<Pose>,
}

impl SkinDeformer {
    pub fn new(scaffold: &ModelScaffold, skinned_geo_index: u32) -> Result<Self, RendererError> {
        let immutable = scaffold.immutable_data();
        let skinned = immutable
            .skinned_geos
            .get(skinned_geo_index as usize)
            .ok_or_else(|| RendererError::MissingSourceAttribute {
                semantic: "skinned geo".to_string(),
                geo_id: skinned_geo_index,
            })?;

        let skeleton_vb = &skinned.skeleton_binding;
        let weights_element = skeleton_vb
            .ia
            .find_element(semantics::WEIGHTS, 0)
            .ok_or_else(|| RendererError::MissingSourceAttribute {
                semantic: semantics::WEIGHTS.to_string(),
                geo_id: skinned_geo_index,
            })?
            .clone();
        let joints_element = skeleton_vb
            .ia
            .find_element(semantics::JOINT_INDICES, 0)
            .ok_or_else(|| RendererError::MissingSourceAttribute {
                semantic: semantics::JOINT_INDICES.to_string(),
                geo_id: skinned_geo_index,
            })?
            .clone();

        let mut large_blocks = scaffold.open_large_blocks()?;
        let data = large_blocks
            .read(skeleton_vb.offset, skeleton_vb.size)
            .map_err(|source| RendererError::LargeBlockRead { source })?;

        let stride = skeleton_vb.ia.vertex_stride as usize;
        let joint_weights = VertexElementRange::new(
            &data[weights_element.aligned_byte_offset as usize..],
            stride,
            weights_element.format,
        )
        .to_vec4s();
        let joint_indices = VertexElementRange::new(
            &data[joints_element.aligned_byte_offset as usize..],
            stride,
            joints_element.format,
        )
        .to_uvec4s();

        let sections = skinned
            .preskinning_sections
            .iter()
            .map(|section| SkinSection {
                bind_shape_by_inverse_bind: section.bind_shape_by_inverse_bind.clone(),
                joint_matrices: section.joint_matrices.clone(),
                preskinning_draw_calls: section.preskinning_draw_calls.clone(),
            })
            .collect();

        Ok(Self {
            joint_weights,
            joint_indices,
            sections,
            joint_input_interface: scaffold.command_stream().joint_input_interface.clone(),
            pose: Mutex::new(Pose::default()),
        })
    }

    /// Install the latest skeleton machine output. Called on the game
    /// thread between animation sampling and `generate_deform_buffer`.
    pub fn feed_in_skeleton_machine_results(
        &self,
        skeleton_machine_output: &[Mat4],
        output_interface: &OutputInterface,
    ) {
        let mut pose = self.pose.lock();
        pose.skeleton_machine_output.clear();
        pose.skeleton_machine_output
            .extend_from_slice(skeleton_machine_output);
        pose.binding = SkeletonBinding::new(output_interface, &self.joint_input_interface);
    }

    /// `bind_shape_by_inverse_bind[j] * machine_output[..]` per joint,
    /// identity for joints with no machine binding.
    fn write_joint_transforms(&self, section: &SkinSection, pose: &Pose, destination: &mut [Mat4]) {
        for (j, slot) in destination
            .iter_mut()
            .enumerate()
            .take(section.joint_matrices.len())
        {
            let machine_output = pose
                .binding
                .model_joint_to_machine_output(section.joint_matrices[j] as u32);
            *slot = match pose
                .skeleton_machine_output
                .get(machine_output as usize)
            {
                Some(&matrix) => section.bind_shape_by_inverse_bind[j] * matrix,
                None => Mat4::IDENTITY,
            };
        }
    }

    /// Build the instantiation list for the `"skin"` factory entry: one
    /// operation per skinned geo, producing `POSITION` and suppressing the
    /// source position/weights/joint-indices bindings.
    pub fn instantiate(
        _initializer: &str,
        scaffold: &Arc<ModelScaffold>,
    ) -> Result<Vec<DeformOperationInstantiation>, RendererError> {
        let immutable = scaffold.immutable_data();
        let geo_count = immutable.geos.len() as u32;
        let mut result = Vec::with_capacity(immutable.skinned_geos.len());
        for c in 0..immutable.skinned_geos.len() as u32 {
            result.push(DeformOperationInstantiation {
                operation: Arc::new(SkinDeformer::new(scaffold, c)?),
                geo_id: geo_count + c,
                upstream_source_elements: vec![NameAndFormat::new(
                    semantics::POSITION,
                    0,
                    Format::Rgb32Float,
                )],
                generated_elements: vec![NameAndFormat::new(
                    semantics::POSITION,
                    0,
                    Format::Rgb32Float,
                )],
                suppress_elements: vec![
                    semantic_hash(semantics::POSITION, 0),
                    semantic_hash(semantics::WEIGHTS, 0),
                    semantic_hash(semantics::JOINT_INDICES, 0),
                ],
            });
        }
        Ok(result)
    }
}

impl DeformOperation for SkinDeformer {
    fn execute(
        &self,
        inputs: &[VertexElementRange<'_>],
        outputs: &mut [VertexElementRangeMut<'_>],
    ) {
        debug_assert_eq!(inputs.len(), 1);
        debug_assert_eq!(outputs.len(), 1);
        let input_positions = &inputs[0];
        let output_positions = &mut outputs[0];
        debug_assert_eq!(input_positions.format(), Format::Rgb32Float);
        debug_assert_eq!(output_positions.format(), Format::Rgb32Float);

        let pose = self.pose.lock();

        for section in &self.sections {
            let mut joint_transforms: SmallVec<[Mat4; 32]> =
                smallvec::smallvec![Mat4::IDENTITY; section.joint_matrices.len()];
            self.write_joint_transforms(section, &pose, &mut joint_transforms);

            for draw_call in &section.preskinning_draw_calls {
                let first = draw_call.first_vertex as usize;
                let count = draw_call.index_count as usize;
                debug_assert!(first + count <= output_positions.len());

                let influence_count = draw_call.sub_material_index as usize;
                if influence_count == 0 {
                    // no joints attached; the position passes through
                    for v in first..first + count {
                        output_positions.set(v, input_positions.get(v));
                    }
                    continue;
                }

                for v in first..first + count {
                    let position = input_positions.get_vec4(v).truncate();
                    let weights = self.joint_weights[v];
                    let joints = self.joint_indices[v];

                    let mut deformed = Vec3::ZERO;
                    for b in 0..influence_count {
                        debug_assert!((joints[b] as usize) < joint_transforms.len());
                        deformed += weights[b]
                            * joint_transforms[joints[b] as usize].transform_point3(position);
                    }
                    output_positions.set_vec4(v, Vec4::new(deformed.x, deformed.y, deformed.z, 1.0));
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
