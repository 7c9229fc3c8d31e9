//! Keyframed animation curves with typed evaluation.

use glam::{Mat4, Quat, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// The value type a curve (or driver) samples.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerType {
    Float1,
    Float3,
    Float4,
    Quaternion,
    Float4x4,
}

/// Keyframe payload of a [`RawAnimationCurve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CurveKeyframes {
    Float1(Vec<f32>),
    Float3(Vec<Vec3>),
    Float4(Vec<Vec4>),
    Quaternion(Vec<Quat>),
    Float4x4(Vec<Mat4>),
}

impl CurveKeyframes {
    fn len(&self) -> usize {
        match self {
            CurveKeyframes::Float1(v) => v.len(),
            CurveKeyframes::Float3(v) => v.len(),
            CurveKeyframes::Float4(v) => v.len(),
            CurveKeyframes::Quaternion(v) => v.len(),
            CurveKeyframes::Float4x4(v) => v.len(),
        }
    }
}

/// Key/value pairs with a type discriminator. Evaluation interpolates
/// between the two keys bracketing the query time, clamped to the curve's
/// time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAnimationCurve {
    pub times: Vec<f32>,
    pub keyframes: CurveKeyframes,
}

impl RawAnimationCurve {
    pub fn new(times: Vec<f32>, keyframes: CurveKeyframes) -> Self {
        debug_assert_eq!(times.len(), keyframes.len());
        debug_assert!(!times.is_empty());
        Self { times, keyframes }
    }

    pub fn sampler_type(&self) -> SamplerType {
        match self.keyframes {
            CurveKeyframes::Float1(_) => SamplerType::Float1,
            CurveKeyframes::Float3(_) => SamplerType::Float3,
            CurveKeyframes::Float4(_) => SamplerType::Float4,
            CurveKeyframes::Quaternion(_) => SamplerType::Quaternion,
            CurveKeyframes::Float4x4(_) => SamplerType::Float4x4,
        }
    }

    /// Bracketing key indices and the interpolation factor for `time`.
    fn segment(&self, time: f32) -> (usize, usize, f32) {
        let next = self
            .times
            .iter()
            .position(|&t| t > time)
            .unwrap_or(self.times.len() - 1);
        let prev = next.saturating_sub(1);
        let span = self.times[next] - self.times[prev];
        let factor = if span > 0.0 {
            ((time - self.times[prev]) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        (prev, next, factor)
    }

    pub fn evaluate_float1(&self, time: f32) -> f32 {
        let (prev, next, t) = self.segment(time);
        match &self.keyframes {
            CurveKeyframes::Float1(values) => values[prev] + (values[next] - values[prev]) * t,
            CurveKeyframes::Float3(values) => values[prev].lerp(values[next], t).x,
            CurveKeyframes::Float4(values) => values[prev].lerp(values[next], t).x,
            _ => 0.0,
        }
    }

    pub fn evaluate_float3(&self, time: f32) -> Vec3 {
        let (prev, next, t) = self.segment(time);
        match &self.keyframes {
            CurveKeyframes::Float3(values) => values[prev].lerp(values[next], t),
            CurveKeyframes::Float4(values) => values[prev].lerp(values[next], t).truncate(),
            CurveKeyframes::Float1(values) => {
                Vec3::splat(values[prev] + (values[next] - values[prev]) * t)
            }
            _ => Vec3::ZERO,
        }
    }

    pub fn evaluate_float4(&self, time: f32) -> Vec4 {
        let (prev, next, t) = self.segment(time);
        match &self.keyframes {
            CurveKeyframes::Float4(values) => values[prev].lerp(values[next], t),
            CurveKeyframes::Float3(values) => values[prev].lerp(values[next], t).extend(1.0),
            _ => Vec4::ZERO,
        }
    }

    /// Quaternion curves interpolate as unit quaternions (normalized lerp).
    pub fn evaluate_quaternion(&self, time: f32) -> Quat {
        let (prev, next, t) = self.segment(time);
        match &self.keyframes {
            CurveKeyframes::Quaternion(values) => values[prev].lerp(values[next], t).normalize(),
            _ => Quat::IDENTITY,
        }
    }

    pub fn evaluate_float4x4(&self, time: f32) -> Mat4 {
        let (prev, next, t) = self.segment(time);
        match &self.keyframes {
            CurveKeyframes::Float4x4(values) => {
                // per-component blend, matching how exporters bake these
                Mat4::from_cols(
                    values[prev].col(0).lerp(values[next].col(0), t),
                    values[prev].col(1).lerp(values[next].col(1), t),
                    values[prev].col(2).lerp(values[next].col(2), t),
                    values[prev].col(3).lerp(values[next].col(3), t),
                )
            }
            _ => Mat4::IDENTITY,
        }
    }

    pub fn begin_time(&self) -> f32 {
        self.times.first().copied().unwrap_or(0.0)
    }

    pub fn end_time(&self) -> f32 {
        self.times.last().copied().unwrap_or(0.0)
    }
}
