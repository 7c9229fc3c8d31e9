//! Raw element reads and writes with on-the-fly format conversion.
//!
//! Every format converts through `[f32; 4]`: reads default missing
//! components to 0 (1 for w) and apply processing fix-ups; writes clamp and
//! quantise into the destination encoding. [`ComponentType::Uint8`] data is
//! integer-valued and only round-trips through the same format.

use half::f16;

use crate::{ComponentType, Format, ProcessingFlags};

/// Read one element as four floats, applying `flags`.
pub fn read_element_raw(bytes: &[u8], format: Format, flags: ProcessingFlags) -> [f32; 4] {
    let count = format.component_count() as usize;
    let mut out = [0.0f32, 0.0, 0.0, 1.0];
    for (c, slot) in out.iter_mut().enumerate().take(count) {
        *slot = read_component(bytes, format.component_type(), c);
    }

    if flags.contains(ProcessingFlags::RENORMALIZE) {
        let len_sq = out[0] * out[0] + out[1] * out[1] + out[2] * out[2];
        if len_sq > f32::EPSILON {
            let scale = len_sq.sqrt().recip();
            out[0] *= scale;
            out[1] *= scale;
            out[2] *= scale;
        }
    }

    if flags.contains(ProcessingFlags::FLIP_V) {
        out[1] = 1.0 - out[1];
    } else if flags.contains(ProcessingFlags::FLIP_BITANGENT) {
        out[0] = -out[0];
        out[1] = -out[1];
        out[2] = -out[2];
    } else if flags.contains(ProcessingFlags::FLIP_TANGENT_HANDEDNESS) {
        out[3] = -out[3];
    }

    out
}

fn read_component(bytes: &[u8], ty: ComponentType, component: usize) -> f32 {
    match ty {
        ComponentType::Float32 => {
            let o = component * 4;
            f32::from_le_bytes(bytes[o..o + 4].try_into().unwrap())
        }
        ComponentType::Float16 => {
            let o = component * 2;
            f16::from_le_bytes(bytes[o..o + 2].try_into().unwrap()).to_f32()
        }
        ComponentType::Unorm8 => bytes[component] as f32 / 255.0,
        ComponentType::Unorm16 => {
            let o = component * 2;
            u16::from_le_bytes(bytes[o..o + 2].try_into().unwrap()) as f32 / 65535.0
        }
        ComponentType::Snorm8 => (bytes[component] as i8 as f32 / 127.0).max(-1.0),
        ComponentType::Snorm16 => {
            let o = component * 2;
            (i16::from_le_bytes(bytes[o..o + 2].try_into().unwrap()) as f32 / 32767.0).max(-1.0)
        }
        ComponentType::Uint8 => bytes[component] as f32,
    }
}

/// Write `value` into `bytes` in the given format.
pub fn write_element_raw(bytes: &mut [u8], format: Format, value: [f32; 4]) {
    let count = format.component_count() as usize;
    for c in 0..count {
        match format.component_type() {
            ComponentType::Float32 => {
                bytes[c * 4..c * 4 + 4].copy_from_slice(&value[c].to_le_bytes())
            }
            ComponentType::Float16 => {
                bytes[c * 2..c * 2 + 2].copy_from_slice(&f16::from_f32(value[c]).to_le_bytes())
            }
            ComponentType::Unorm8 => {
                bytes[c] = (value[c] * 255.0).clamp(0.0, 255.0).round() as u8;
            }
            ComponentType::Unorm16 => {
                let v = (value[c] * 65535.0).clamp(0.0, 65535.0).round() as u16;
                bytes[c * 2..c * 2 + 2].copy_from_slice(&v.to_le_bytes());
            }
            ComponentType::Snorm8 => {
                bytes[c] = ((value[c] * 127.0).clamp(-127.0, 127.0).round() as i8) as u8;
            }
            ComponentType::Snorm16 => {
                let v = (value[c] * 32767.0).clamp(-32767.0, 32767.0).round() as i16;
                bytes[c * 2..c * 2 + 2].copy_from_slice(&v.to_le_bytes());
            }
            ComponentType::Uint8 => {
                bytes[c] = value[c].clamp(0.0, 255.0) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snorm16_round_trip() {
        let mut bytes = [0u8; 8];
        write_element_raw(&mut bytes, Format::Rgba16Snorm, [-1.0, 0.5, 0.0, 1.0]);
        let back = read_element_raw(&bytes, Format::Rgba16Snorm, ProcessingFlags::empty());
        assert!((back[0] + 1.0).abs() < 1e-4);
        assert!((back[1] - 0.5).abs() < 1e-4);
        assert_eq!(back[3], 1.0);
    }

    #[test]
    fn uint8_reads_raw_values() {
        let bytes = [3u8, 200, 0, 0];
        let v = read_element_raw(&bytes, Format::Rgba8Uint, ProcessingFlags::empty());
        assert_eq!(v[0], 3.0);
        assert_eq!(v[1], 200.0);
    }
}
