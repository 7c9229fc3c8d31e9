//! Typed, strided views over vertex-buffer bytes with on-the-fly format
//! conversion. These are what deform operations receive as inputs and
//! outputs.

use std::marker::PhantomData;

use glam::Vec4;
use marrow_types::{read_element_raw, write_element_raw, Format, ProcessingFlags};

/// Read-only view of one element lane in an interleaved vertex buffer.
///
/// Held as a raw pointer so lanes of a buffer that other views are writing
/// (through disjoint lanes) can be read without materialising a reference
/// over the mutated bytes.
#[derive(Copy, Clone)]
pub struct VertexElementRange<'a> {
    ptr: *const u8,
    available: usize,
    stride: usize,
    format: Format,
    count: usize,
    _marker: PhantomData<&'a [u8]>,
}

fn element_count(available: usize, stride: usize, element_size: usize) -> usize {
    if available < element_size || stride == 0 {
        0
    } else {
        (available - element_size) / stride + 1
    }
}

impl<'a> VertexElementRange<'a> {
    /// View over `data`, whose first element starts at byte 0 and whose
    /// successors follow at `stride` intervals.
    pub fn new(data: &'a [u8], stride: usize, format: Format) -> Self {
        // SAFETY: the slice is borrowed for 'a and nothing writes it
        unsafe { Self::from_raw_parts(data.as_ptr(), data.len(), stride, format) }
    }

    /// # Safety
    ///
    /// `ptr..ptr+available` must be readable for `'a`, and no reference may
    /// alias the bytes this lane reads while the view is live.
    pub unsafe fn from_raw_parts(
        ptr: *const u8,
        available: usize,
        stride: usize,
        format: Format,
    ) -> Self {
        Self {
            ptr,
            available,
            stride,
            format,
            count: element_count(available, stride, format.bytes() as usize),
            _marker: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn get(&self, index: usize) -> [f32; 4] {
        debug_assert!(index < self.count);
        let element_size = self.format.bytes() as usize;
        // SAFETY: index bound checked against count, derived from the
        // available byte range.
        let bytes =
            unsafe { std::slice::from_raw_parts(self.ptr.add(index * self.stride), element_size) };
        read_element_raw(bytes, self.format, ProcessingFlags::empty())
    }

    pub fn get_vec4(&self, index: usize) -> Vec4 {
        Vec4::from_array(self.get(index))
    }

    /// Read the whole lane as `Vec4`s.
    pub fn to_vec4s(&self) -> Vec<Vec4> {
        (0..self.count).map(|i| self.get_vec4(i)).collect()
    }

    /// Read the whole lane as integer quadruples. Only meaningful for
    /// integer-valued formats (joint indices).
    pub fn to_uvec4s(&self) -> Vec<[u32; 4]> {
        (0..self.count)
            .map(|i| {
                let v = self.get(i);
                [v[0] as u32, v[1] as u32, v[2] as u32, v[3] as u32]
            })
            .collect()
    }
}

/// Writeable view of one element lane in an interleaved vertex buffer.
///
/// Several of these may interleave within the same underlying buffer (one
/// per output element of a deform operation), so the view is built over a
/// raw pointer; construction is unsafe and carries the disjointness
/// obligation.
pub struct VertexElementRangeMut<'a> {
    ptr: *mut u8,
    available: usize,
    stride: usize,
    format: Format,
    count: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> VertexElementRangeMut<'a> {
    /// # Safety
    ///
    /// `ptr..ptr+available` must be writeable for `'a`, and the element
    /// lane described by `(stride, format)` must not overlap the lane of
    /// any other live view into the same buffer.
    pub unsafe fn from_raw_parts(
        ptr: *mut u8,
        available: usize,
        stride: usize,
        format: Format,
    ) -> Self {
        Self {
            ptr,
            available,
            stride,
            format,
            count: element_count(available, stride, format.bytes() as usize),
            _marker: PhantomData,
        }
    }

    /// View over an exclusively borrowed slice.
    pub fn from_slice(data: &'a mut [u8], stride: usize, format: Format) -> Self {
        // SAFETY: the slice is exclusively borrowed for 'a, so no other
        // view can overlap it.
        unsafe { Self::from_raw_parts(data.as_mut_ptr(), data.len(), stride, format) }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn get(&self, index: usize) -> [f32; 4] {
        debug_assert!(index < self.count);
        let element_size = self.format.bytes() as usize;
        // SAFETY: index bound checked against count, which was derived from
        // the available byte range.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.ptr.add(index * self.stride), element_size)
        };
        read_element_raw(bytes, self.format, ProcessingFlags::empty())
    }

    pub fn set(&mut self, index: usize, value: [f32; 4]) {
        debug_assert!(index < self.count);
        let element_size = self.format.bytes() as usize;
        // SAFETY: as in `get`; exclusive access to this lane is the
        // constructor's obligation.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.ptr.add(index * self.stride), element_size)
        };
        write_element_raw(bytes, self.format, value);
    }

    pub fn set_vec4(&mut self, index: usize, value: Vec4) {
        self.set(index, value.to_array());
    }
}

/// Copy `count` elements from one lane into another, converting formats.
pub fn copy_elements(dst: &mut VertexElementRangeMut<'_>, src: &VertexElementRange<'_>, count: usize) {
    debug_assert!(count <= src.len());
    debug_assert!(count <= dst.len());
    for i in 0..count {
        let value = src.get(i);
        dst.set(i, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_reads_skip_other_lanes() {
        // two vertices of [position f32x3, pad f32]
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, 99.0, 4.0, 5.0, 6.0, 99.0];
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        let range = VertexElementRange::new(bytes, 16, Format::Rgb32Float);
        assert_eq!(range.len(), 2);
        assert_eq!(range.get_vec4(1), Vec4::new(4.0, 5.0, 6.0, 1.0));
    }

    #[test]
    fn interleaved_mutable_lanes_do_not_clobber_each_other() {
        // one buffer holding two f32 lanes at offsets 0 and 4, stride 8
        let mut buffer = vec![0u8; 32];
        let base = buffer.as_mut_ptr();
        // SAFETY: the two lanes are disjoint byte ranges of the live buffer
        let mut lane0 =
            unsafe { VertexElementRangeMut::from_raw_parts(base, 32, 8, Format::R32Float) };
        let mut lane1 =
            unsafe { VertexElementRangeMut::from_raw_parts(base.add(4), 28, 8, Format::R32Float) };

        for i in 0..4 {
            lane0.set(i, [i as f32, 0.0, 0.0, 0.0]);
            lane1.set(i, [10.0 + i as f32, 0.0, 0.0, 0.0]);
        }

        let floats: Vec<f32> = buffer
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect();
        assert_eq!(floats, vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0, 3.0, 13.0]);
    }

    #[test]
    fn copy_converts_between_formats() {
        let src_data: Vec<f32> = vec![0.0, 0.5, 1.0, 0.25];
        let src = VertexElementRange::new(
            bytemuck::cast_slice(&src_data),
            16,
            Format::Rgba32Float,
        );
        let mut dst_data = vec![0u8; 4];
        let mut dst = VertexElementRangeMut::from_slice(&mut dst_data, 4, Format::Rgba8Unorm);
        copy_elements(&mut dst, &src, 1);
        assert_eq!(dst_data, vec![0, 128, 255, 64]);
    }
}
