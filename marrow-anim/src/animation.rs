//! Animation sets: curve and constant drivers bound by name onto a
//! skeleton machine's parameter interface, sampled per frame.

use glam::{Mat4, Quat, Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::curve::{RawAnimationCurve, SamplerType};
use crate::skeleton::{InputInterface, OutputInterface, ParameterSet, SkeletonMachine};

/// What the caller wants sampled: a time within the animation identified by
/// the hash of its name.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct AnimationState {
    pub time: f32,
    pub animation_hash: u64,
}

/// Binds an animation curve to a parameter on the animation set's output
/// interface.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct AnimationDriver {
    /// Index into the animation set's output interface.
    pub parameter_index: u32,
    pub sampler_type: SamplerType,
    /// Component selector for scalar-into-vector writes.
    pub sampler_offset: u32,
    pub curve_index: u32,
}

/// Storage format of a constant driver's value inside the constant blob.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstantFormat {
    Float1,
    Float3,
    Float4,
    /// A quaternion packed as four signed-normalized 10-bit components.
    PackedQuaternion,
    Float4x4,
}

/// Binds a constant value (stored in the animation set's data blob) to a
/// parameter on the output interface.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct ConstantDriver {
    pub parameter_index: u32,
    pub sampler_type: SamplerType,
    pub sampler_offset: u32,
    pub format: ConstantFormat,
    pub data_offset: u32,
}

/// Driver and time ranges of one named animation.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct Animation {
    pub begin_driver: u32,
    pub end_driver: u32,
    pub begin_constant_driver: u32,
    pub end_constant_driver: u32,
    pub begin_time: f32,
    pub end_time: f32,
}

/// A set of animations over a shared pool of drivers and curves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnimationSet {
    pub drivers: Vec<AnimationDriver>,
    pub constant_drivers: Vec<ConstantDriver>,
    pub constant_data: Vec<u8>,
    /// `(animation name hash, animation)`, sorted by hash for binary
    /// search.
    pub animations: Vec<(u64, Animation)>,
    /// Parameter names addressed by driver `parameter_index` values.
    pub output_interface: Vec<u64>,
    pub curves: Vec<RawAnimationCurve>,
}

impl AnimationSet {
    pub fn find_animation(&self, animation_hash: u64) -> Option<Animation> {
        self.animations
            .binary_search_by_key(&animation_hash, |&(hash, _)| hash)
            .ok()
            .map(|index| self.animations[index].1)
    }

    pub fn find_parameter(&self, parameter_name: u64) -> Option<u32> {
        self.output_interface
            .iter()
            .position(|&name| name == parameter_name)
            .map(|index| index as u32)
    }

    /// Sample the set at `state`, producing a parameter set seeded from the
    /// machine's defaults.
    ///
    /// The animation's `begin_time` is added to the state's time; no
    /// clamping or wrapping is applied here, that is the caller's business.
    /// Drivers bound to no machine parameter are skipped.
    pub fn build_parameter_set(
        &self,
        state: &AnimationState,
        machine: &SkeletonMachine,
        binding: &AnimationSetBinding,
    ) -> ParameterSet {
        let mut result = machine.default_parameters().clone();

        let mut driver_range = 0..0;
        let mut constant_range = 0..0;
        let mut time = state.time;
        if let Some(animation) = self.find_animation(state.animation_hash) {
            driver_range = animation.begin_driver as usize..animation.end_driver as usize;
            constant_range =
                animation.begin_constant_driver as usize..animation.end_constant_driver as usize;
            time += animation.begin_time;
        }

        let input_interface = machine.input_interface();
        for driver in &self.drivers[driver_range] {
            let machine_parameter =
                binding.anim_driver_to_machine_parameter(driver.parameter_index);
            if machine_parameter == u32::MAX {
                continue;
            }
            let parameter = &input_interface.parameters[machine_parameter as usize];
            let curve = match self.curves.get(driver.curve_index as usize) {
                Some(curve) => curve,
                None => continue,
            };

            match driver.sampler_type {
                SamplerType::Float4x4 => {
                    if parameter.sampler_type == SamplerType::Float4x4 {
                        result.set_float4x4(parameter.index, curve.evaluate_float4x4(time));
                    }
                }
                SamplerType::Float4 => match parameter.sampler_type {
                    SamplerType::Float4 | SamplerType::Quaternion => {
                        result.set_float4(parameter.index, curve.evaluate_float4(time));
                    }
                    SamplerType::Float3 => {
                        result
                            .set_float3(parameter.index, curve.evaluate_float4(time).truncate());
                    }
                    _ => {
                        result.set_float1(parameter.index, curve.evaluate_float4(time).x);
                    }
                },
                SamplerType::Quaternion => {
                    if matches!(
                        parameter.sampler_type,
                        SamplerType::Float4 | SamplerType::Quaternion
                    ) {
                        let q = curve.evaluate_quaternion(time);
                        result.set_quaternion(parameter.index, q);
                    }
                }
                SamplerType::Float3 => match parameter.sampler_type {
                    SamplerType::Float3 => {
                        result.set_float3(parameter.index, curve.evaluate_float3(time));
                    }
                    _ => {
                        result.set_float1(parameter.index, curve.evaluate_float3(time).x);
                    }
                },
                SamplerType::Float1 => {
                    let value = curve.evaluate_float1(time);
                    write_scalar(&mut result, parameter, driver.sampler_offset, value);
                }
            }
        }

        for driver in &self.constant_drivers[constant_range] {
            let machine_parameter =
                binding.anim_driver_to_machine_parameter(driver.parameter_index);
            if machine_parameter == u32::MAX {
                continue;
            }
            let parameter = &input_interface.parameters[machine_parameter as usize];
            let data = &self.constant_data[driver.data_offset as usize..];

            match driver.sampler_type {
                SamplerType::Float4x4 => {
                    if parameter.sampler_type == SamplerType::Float4x4 {
                        result.set_float4x4(parameter.index, read_mat4(data));
                    }
                }
                SamplerType::Float4 => match parameter.sampler_type {
                    SamplerType::Float4 | SamplerType::Quaternion => {
                        result.set_float4(parameter.index, read_vec4(data));
                    }
                    SamplerType::Float3 => {
                        result.set_float3(parameter.index, read_vec4(data).truncate());
                    }
                    _ => {}
                },
                SamplerType::Quaternion => {
                    if matches!(
                        parameter.sampler_type,
                        SamplerType::Float4 | SamplerType::Quaternion
                    ) {
                        let q = match driver.format {
                            ConstantFormat::PackedQuaternion => {
                                let packed =
                                    u64::from_le_bytes(data[..8].try_into().unwrap());
                                unpack_quaternion_10_10_10_10(packed)
                            }
                            _ => {
                                let v = read_vec4(data);
                                Quat::from_xyzw(v.x, v.y, v.z, v.w)
                            }
                        };
                        result.set_quaternion(parameter.index, q);
                    }
                }
                SamplerType::Float3 => {
                    if parameter.sampler_type == SamplerType::Float3 {
                        result.set_float3(parameter.index, read_vec3(data));
                    }
                }
                SamplerType::Float1 => {
                    let value = f32::from_le_bytes(data[..4].try_into().unwrap());
                    write_scalar(&mut result, parameter, driver.sampler_offset, value);
                }
            }
        }

        result
    }
}

/// Scalar-into-vector write, selecting the destination component with the
/// driver's sampler offset (bounds checked against the destination arity).
fn write_scalar(
    result: &mut ParameterSet,
    parameter: &crate::skeleton::InputParameter,
    sampler_offset: u32,
    value: f32,
) {
    match parameter.sampler_type {
        SamplerType::Float1 => result.set_float1(parameter.index, value),
        SamplerType::Float3 => {
            assert!(sampler_offset < 3);
            let mut v = result
                .float3
                .get(parameter.index as usize)
                .copied()
                .unwrap_or(Vec3::ZERO);
            v[sampler_offset as usize] = value;
            result.set_float3(parameter.index, v);
        }
        SamplerType::Float4 | SamplerType::Quaternion => {
            assert!(sampler_offset < 4);
            let mut v = result
                .float4
                .get(parameter.index as usize)
                .copied()
                .unwrap_or(Vec4::ZERO);
            v[sampler_offset as usize] = value;
            result.set_float4(parameter.index, v);
        }
        SamplerType::Float4x4 => {}
    }
}

fn read_vec3(data: &[u8]) -> Vec3 {
    Vec3::new(
        f32::from_le_bytes(data[0..4].try_into().unwrap()),
        f32::from_le_bytes(data[4..8].try_into().unwrap()),
        f32::from_le_bytes(data[8..12].try_into().unwrap()),
    )
}

fn read_vec4(data: &[u8]) -> Vec4 {
    Vec4::new(
        f32::from_le_bytes(data[0..4].try_into().unwrap()),
        f32::from_le_bytes(data[4..8].try_into().unwrap()),
        f32::from_le_bytes(data[8..12].try_into().unwrap()),
        f32::from_le_bytes(data[12..16].try_into().unwrap()),
    )
}

fn read_mat4(data: &[u8]) -> Mat4 {
    let mut cols = [Vec4::ZERO; 4];
    for (c, col) in cols.iter_mut().enumerate() {
        *col = read_vec4(&data[c * 16..]);
    }
    Mat4::from_cols(cols[0], cols[1], cols[2], cols[3])
}

/// Pack a unit quaternion into four signed-normalized 10-bit components in
/// the low 40 bits of a u64.
pub fn pack_quaternion_10_10_10_10(q: Quat) -> u64 {
    fn pack_component(value: f32) -> u64 {
        let quantized = (value.clamp(-1.0, 1.0) * 511.0).round() as i32;
        (quantized & 0x3ff) as u64
    }
    pack_component(q.x)
        | (pack_component(q.y) << 10)
        | (pack_component(q.z) << 20)
        | (pack_component(q.w) << 30)
}

/// Decompress a 10-10-10-10 packed quaternion, renormalizing to unit
/// length.
pub fn unpack_quaternion_10_10_10_10(packed: u64) -> Quat {
    fn unpack_component(packed: u64, shift: u32) -> f32 {
        let bits = ((packed >> shift) & 0x3ff) as u32;
        // sign-extend the 10-bit field
        let signed = ((bits << 22) as i32) >> 22;
        signed as f32 / 511.0
    }
    Quat::from_xyzw(
        unpack_component(packed, 0),
        unpack_component(packed, 10),
        unpack_component(packed, 20),
        unpack_component(packed, 30),
    )
    .normalize()
}

/// Matches each animation-set output parameter to a machine input
/// parameter by name. The interfaces are unsorted and small, so the match
/// is brute force. Unmatched entries become `u32::MAX` and warn once here
/// rather than at every sample.
#[derive(Debug, Clone, Default)]
pub struct AnimationSetBinding {
    anim_driver_to_machine_parameter: Vec<u32>,
}

impl AnimationSetBinding {
    pub fn new(output_interface: &[u64], input: &InputInterface) -> Self {
        let mut result = vec![u32::MAX; output_interface.len()];
        for (c, &parameter_name) in output_interface.iter().enumerate() {
            for (c2, parameter) in input.parameters.iter().enumerate() {
                if parameter.name == parameter_name {
                    result[c] = c2 as u32;
                    break;
                }
            }
            if result[c] == u32::MAX {
                log::debug!(
                    "animation driver output {:#x} cannot be bound to a skeleton machine input",
                    parameter_name
                );
            }
        }
        Self {
            anim_driver_to_machine_parameter: result,
        }
    }

    pub fn anim_driver_to_machine_parameter(&self, parameter_index: u32) -> u32 {
        self.anim_driver_to_machine_parameter
            .get(parameter_index as usize)
            .copied()
            .unwrap_or(u32::MAX)
    }
}

/// Matches a model's joint names to machine output matrix slots. Unmatched
/// joints become `u32::MAX`.
#[derive(Debug, Clone, Default)]
pub struct SkeletonBinding {
    model_joint_to_machine_output: Vec<u32>,
}

impl SkeletonBinding {
    pub fn new(output: &OutputInterface, joint_names: &[u64]) -> Self {
        let mut result = vec![u32::MAX; joint_names.len()];
        for (c, &name) in joint_names.iter().enumerate() {
            for (c2, &output_name) in output.output_matrix_names.iter().enumerate() {
                if output_name == name {
                    result[c] = c2 as u32;
                    break;
                }
            }
            if result[c] == u32::MAX {
                log::debug!(
                    "couldn't bind joint {:#x} to a skeleton machine output",
                    name
                );
            }
        }
        Self {
            model_joint_to_machine_output: result,
        }
    }

    pub fn model_joint_to_machine_output(&self, joint: u32) -> u32 {
        self.model_joint_to_machine_output
            .get(joint as usize)
            .copied()
            .unwrap_or(u32::MAX)
    }

    pub fn joint_count(&self) -> usize {
        self.model_joint_to_machine_output.len()
    }
}
