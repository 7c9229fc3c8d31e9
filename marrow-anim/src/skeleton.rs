//! The skeleton machine: a flattened command stream evaluating an
//! exporter's node hierarchy into output matrices.
//!
//! In the editing tool a skeleton is a hierarchy of nodes; at runtime that
//! hierarchy has been linearised into push/pop instructions with parameter
//! slots where animation can write. Executing the stream against any valid
//! parameter set yields exactly `output_matrix_count` matrices.

use glam::{Mat4, Quat, Vec3, Vec4};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::curve::SamplerType;

#[derive(Debug, Error)]
pub enum SkeletonError {
    #[error("output buffer of {provided} matrices is too small; machine produces {required}")]
    OutputBufferTooSmall { provided: usize, required: usize },
    #[error("malformed skeleton command stream")]
    MalformedCommandStream,
}

/// The typed parameter banks a skeleton machine executes against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub float1: Vec<f32>,
    pub float3: Vec<Vec3>,
    pub float4: Vec<Vec4>,
    pub float4x4: Vec<Mat4>,
}

impl ParameterSet {
    pub fn set_float1(&mut self, index: u32, value: f32) {
        if self.float1.len() <= index as usize {
            self.float1.resize(index as usize + 1, 0.0);
        }
        self.float1[index as usize] = value;
    }

    pub fn set_float3(&mut self, index: u32, value: Vec3) {
        if self.float3.len() <= index as usize {
            self.float3.resize(index as usize + 1, Vec3::ZERO);
        }
        self.float3[index as usize] = value;
    }

    pub fn set_float4(&mut self, index: u32, value: Vec4) {
        if self.float4.len() <= index as usize {
            self.float4.resize(index as usize + 1, Vec4::ZERO);
        }
        self.float4[index as usize] = value;
    }

    /// Quaternions live in the float4 bank as `(x, y, z, w)`.
    pub fn set_quaternion(&mut self, index: u32, value: Quat) {
        self.set_float4(index, Vec4::new(value.x, value.y, value.z, value.w));
    }

    pub fn set_float4x4(&mut self, index: u32, value: Mat4) {
        if self.float4x4.len() <= index as usize {
            self.float4x4.resize(index as usize + 1, Mat4::IDENTITY);
        }
        self.float4x4[index as usize] = value;
    }
}

/// One named, typed parameter on a machine's input interface.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    pub name: u64,
    pub sampler_type: SamplerType,
    /// Index into the parameter bank selected by `sampler_type`.
    pub index: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputInterface {
    pub parameters: Vec<InputParameter>,
}

impl InputInterface {
    pub fn find_parameter(&self, name: u64) -> Option<&InputParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// The named output matrices a machine produces, with optional inverse-bind
/// matrices recorded at export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputInterface {
    pub output_matrix_names: Vec<u64>,
    pub skeleton_inverse_bind: Vec<Mat4>,
}

// Command stream opcodes. Each command is an opcode word followed by one
// argument word (unused for push).
const CMD_PUSH: u32 = 0;
const CMD_POP: u32 = 1;
const CMD_TRANSFORM_STATIC: u32 = 2;
const CMD_TRANSLATE_PARAMETER: u32 = 3;
const CMD_ROTATE_PARAMETER: u32 = 4;
const CMD_SCALE_PARAMETER: u32 = 5;
const CMD_TRANSFORM_PARAMETER: u32 = 6;
const CMD_WRITE_OUTPUT: u32 = 7;

/// An opaque command stream of 32-bit instructions producing output
/// matrices from a [`ParameterSet`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkeletonMachine {
    commands: Vec<u32>,
    static_transforms: Vec<Mat4>,
    output_matrix_count: u32,
    default_parameters: ParameterSet,
    input_interface: InputInterface,
    output_interface: OutputInterface,
}

impl SkeletonMachine {
    pub fn output_matrix_count(&self) -> u32 {
        self.output_matrix_count
    }

    pub fn default_parameters(&self) -> &ParameterSet {
        &self.default_parameters
    }

    pub fn input_interface(&self) -> &InputInterface {
        &self.input_interface
    }

    pub fn output_interface(&self) -> &OutputInterface {
        &self.output_interface
    }

    /// Execute the command stream.
    pub fn generate_output_transforms(
        &self,
        parameters: &ParameterSet,
        output: &mut [Mat4],
    ) -> Result<(), SkeletonError> {
        self.generate_output_transforms_with_debug(parameters, output, |_, _| {})
    }

    /// Execute the command stream, invoking `debug_iterator` with
    /// `(parent_matrix, child_matrix)` for every output written.
    pub fn generate_output_transforms_with_debug(
        &self,
        parameters: &ParameterSet,
        output: &mut [Mat4],
        mut debug_iterator: impl FnMut(&Mat4, &Mat4),
    ) -> Result<(), SkeletonError> {
        if output.len() < self.output_matrix_count as usize {
            return Err(SkeletonError::OutputBufferTooSmall {
                provided: output.len(),
                required: self.output_matrix_count as usize,
            });
        }

        let mut stack: Vec<Mat4> = Vec::with_capacity(16);
        let mut current = Mat4::IDENTITY;

        let mut cursor = 0;
        while cursor < self.commands.len() {
            let opcode = self.commands[cursor];
            let arg = self
                .commands
                .get(cursor + 1)
                .copied()
                .ok_or(SkeletonError::MalformedCommandStream);
            match opcode {
                CMD_PUSH => {
                    stack.push(current);
                    cursor += 1;
                }
                CMD_POP => {
                    let count = arg? as usize;
                    if count == 0 || count > stack.len() {
                        return Err(SkeletonError::MalformedCommandStream);
                    }
                    for _ in 0..count - 1 {
                        stack.pop();
                    }
                    current = stack.pop().unwrap();
                    cursor += 2;
                }
                CMD_TRANSFORM_STATIC => {
                    let transform = self
                        .static_transforms
                        .get(arg? as usize)
                        .ok_or(SkeletonError::MalformedCommandStream)?;
                    current *= *transform;
                    cursor += 2;
                }
                CMD_TRANSLATE_PARAMETER => {
                    let value = parameters
                        .float3
                        .get(arg? as usize)
                        .copied()
                        .unwrap_or(Vec3::ZERO);
                    current *= Mat4::from_translation(value);
                    cursor += 2;
                }
                CMD_ROTATE_PARAMETER => {
                    let value = parameters
                        .float4
                        .get(arg? as usize)
                        .copied()
                        .unwrap_or(Vec4::new(0.0, 0.0, 0.0, 1.0));
                    let rotation =
                        Quat::from_xyzw(value.x, value.y, value.z, value.w).normalize();
                    current *= Mat4::from_quat(rotation);
                    cursor += 2;
                }
                CMD_SCALE_PARAMETER => {
                    let value = parameters
                        .float1
                        .get(arg? as usize)
                        .copied()
                        .unwrap_or(1.0);
                    current *= Mat4::from_scale(Vec3::splat(value));
                    cursor += 2;
                }
                CMD_TRANSFORM_PARAMETER => {
                    let value = parameters
                        .float4x4
                        .get(arg? as usize)
                        .copied()
                        .unwrap_or(Mat4::IDENTITY);
                    current *= value;
                    cursor += 2;
                }
                CMD_WRITE_OUTPUT => {
                    let slot = arg? as usize;
                    if slot >= self.output_matrix_count as usize {
                        return Err(SkeletonError::MalformedCommandStream);
                    }
                    let parent = stack.last().copied().unwrap_or(Mat4::IDENTITY);
                    debug_iterator(&parent, &current);
                    output[slot] = current;
                    cursor += 2;
                }
                _ => return Err(SkeletonError::MalformedCommandStream),
            }
        }

        Ok(())
    }

    /// Derive, for each output matrix, the output written by its enclosing
    /// hierarchy level; `u32::MAX` for roots.
    pub fn calculate_parent_pointers(&self, output: &mut [u32]) {
        for slot in output.iter_mut() {
            *slot = u32::MAX;
        }

        // one marker per stack level: the output most recently written there
        let mut markers: Vec<u32> = vec![u32::MAX];
        let mut cursor = 0;
        while cursor < self.commands.len() {
            match self.commands[cursor] {
                CMD_PUSH => {
                    let inherited = *markers.last().unwrap();
                    markers.push(inherited);
                    cursor += 1;
                }
                CMD_POP => {
                    let count = self.commands[cursor + 1] as usize;
                    for _ in 0..count {
                        markers.pop();
                    }
                    if markers.is_empty() {
                        markers.push(u32::MAX);
                    }
                    cursor += 2;
                }
                CMD_WRITE_OUTPUT => {
                    let slot = self.commands[cursor + 1] as usize;
                    if slot < output.len() {
                        output[slot] = *markers.last().unwrap();
                    }
                    *markers.last_mut().unwrap() = slot as u32;
                    cursor += 2;
                }
                _ => cursor += 2,
            }
        }
    }
}

/// Builds a [`SkeletonMachine`] from hierarchy traversal calls. Used by
/// exporters and tests; the runtime only ever executes finished machines.
#[derive(Default)]
pub struct SkeletonMachineBuilder {
    commands: Vec<u32>,
    static_transforms: Vec<Mat4>,
    default_parameters: ParameterSet,
    input_parameters: Vec<InputParameter>,
    output_matrix_names: Vec<u64>,
    output_inverse_bind: Vec<Mat4>,
}

impl SkeletonMachineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self) -> &mut Self {
        self.commands.push(CMD_PUSH);
        self
    }

    pub fn pop(&mut self, count: u32) -> &mut Self {
        self.commands.extend_from_slice(&[CMD_POP, count]);
        self
    }

    pub fn transform_static(&mut self, transform: Mat4) -> &mut Self {
        let index = self.static_transforms.len() as u32;
        self.static_transforms.push(transform);
        self.commands.extend_from_slice(&[CMD_TRANSFORM_STATIC, index]);
        self
    }

    fn register_parameter(&mut self, name: u64, sampler_type: SamplerType, bank_len: u32) -> u32 {
        if let Some(existing) = self
            .input_parameters
            .iter()
            .find(|p| p.name == name && p.sampler_type == sampler_type)
        {
            return existing.index;
        }
        self.input_parameters.push(InputParameter {
            name,
            sampler_type,
            index: bank_len,
        });
        bank_len
    }

    pub fn transform_translation_parameter(&mut self, name: u64, default: Vec3) -> &mut Self {
        let index = self.register_parameter(
            name,
            SamplerType::Float3,
            self.default_parameters.float3.len() as u32,
        );
        if index as usize == self.default_parameters.float3.len() {
            self.default_parameters.float3.push(default);
        }
        self.commands.extend_from_slice(&[CMD_TRANSLATE_PARAMETER, index]);
        self
    }

    pub fn transform_rotation_parameter(&mut self, name: u64, default: Quat) -> &mut Self {
        let index = self.register_parameter(
            name,
            SamplerType::Quaternion,
            self.default_parameters.float4.len() as u32,
        );
        if index as usize == self.default_parameters.float4.len() {
            self.default_parameters
                .float4
                .push(Vec4::new(default.x, default.y, default.z, default.w));
        }
        self.commands.extend_from_slice(&[CMD_ROTATE_PARAMETER, index]);
        self
    }

    pub fn transform_scale_parameter(&mut self, name: u64, default: f32) -> &mut Self {
        let index = self.register_parameter(
            name,
            SamplerType::Float1,
            self.default_parameters.float1.len() as u32,
        );
        if index as usize == self.default_parameters.float1.len() {
            self.default_parameters.float1.push(default);
        }
        self.commands.extend_from_slice(&[CMD_SCALE_PARAMETER, index]);
        self
    }

    pub fn transform_matrix_parameter(&mut self, name: u64, default: Mat4) -> &mut Self {
        let index = self.register_parameter(
            name,
            SamplerType::Float4x4,
            self.default_parameters.float4x4.len() as u32,
        );
        if index as usize == self.default_parameters.float4x4.len() {
            self.default_parameters.float4x4.push(default);
        }
        self.commands.extend_from_slice(&[CMD_TRANSFORM_PARAMETER, index]);
        self
    }

    pub fn write_output(&mut self, name: u64) -> u32 {
        self.write_output_with_inverse_bind(name, Mat4::IDENTITY)
    }

    pub fn write_output_with_inverse_bind(&mut self, name: u64, inverse_bind: Mat4) -> u32 {
        let slot = self.output_matrix_names.len() as u32;
        self.output_matrix_names.push(name);
        self.output_inverse_bind.push(inverse_bind);
        self.commands.extend_from_slice(&[CMD_WRITE_OUTPUT, slot]);
        slot
    }

    pub fn build(self) -> SkeletonMachine {
        SkeletonMachine {
            commands: self.commands,
            static_transforms: self.static_transforms,
            output_matrix_count: self.output_matrix_names.len() as u32,
            default_parameters: self.default_parameters,
            input_interface: InputInterface {
                parameters: self.input_parameters,
            },
            output_interface: OutputInterface {
                output_matrix_names: self.output_matrix_names,
                skeleton_inverse_bind: self.output_inverse_bind,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_types::hash_str;

    fn two_bone_chain() -> SkeletonMachine {
        let mut builder = SkeletonMachineBuilder::new();
        builder.push();
        builder.transform_translation_parameter(hash_str("root/translation"), Vec3::ZERO);
        builder.write_output(hash_str("root"));
        builder.push();
        builder.transform_static(Mat4::from_translation(Vec3::X));
        builder.write_output(hash_str("tip"));
        builder.pop(1);
        builder.pop(1);
        builder.build()
    }

    #[test]
    fn defaults_produce_expected_matrix_count() {
        let machine = two_bone_chain();
        assert_eq!(machine.output_matrix_count(), 2);

        let mut output = vec![Mat4::ZERO; 2];
        machine
            .generate_output_transforms(machine.default_parameters(), &mut output)
            .unwrap();
        assert_eq!(output[0], Mat4::IDENTITY);
        assert_eq!(output[1], Mat4::from_translation(Vec3::X));
    }

    #[test]
    fn parameter_overrides_flow_through_children() {
        let machine = two_bone_chain();
        let mut parameters = machine.default_parameters().clone();
        let slot = machine
            .input_interface()
            .find_parameter(hash_str("root/translation"))
            .unwrap()
            .index;
        parameters.set_float3(slot, Vec3::new(0.0, 5.0, 0.0));

        let mut output = vec![Mat4::ZERO; 2];
        machine
            .generate_output_transforms(&parameters, &mut output)
            .unwrap();
        assert_eq!(
            output[1].transform_point3(Vec3::ZERO),
            Vec3::new(1.0, 5.0, 0.0)
        );
    }

    #[test]
    fn too_small_output_buffer_is_rejected() {
        let machine = two_bone_chain();
        let mut output = vec![Mat4::ZERO; 1];
        assert!(matches!(
            machine.generate_output_transforms(machine.default_parameters(), &mut output),
            Err(SkeletonError::OutputBufferTooSmall { .. })
        ));
    }

    #[test]
    fn debug_iterator_sees_parent_child_edges() {
        let machine = two_bone_chain();
        let mut edges = Vec::new();
        let mut output = vec![Mat4::ZERO; 2];
        machine
            .generate_output_transforms_with_debug(
                machine.default_parameters(),
                &mut output,
                |parent, child| edges.push((*parent, *child)),
            )
            .unwrap();
        assert_eq!(edges.len(), 2);
        // the tip's parent matrix is the root's world transform
        assert_eq!(edges[1].0, output[0]);
    }

    #[test]
    fn parent_pointers_follow_the_hierarchy() {
        let machine = two_bone_chain();
        let mut parents = vec![0u32; 2];
        machine.calculate_parent_pointers(&mut parents);
        assert_eq!(parents, vec![u32::MAX, 0]);
    }
}
