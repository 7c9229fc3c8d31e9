//! The mesh database: named attribute streams addressed through per-stream
//! vertex maps, with format conversion on read and on vertex-buffer build.

use std::sync::Arc;

use glam::{Vec2, Vec3, Vec4};
use marrow_types::{
    calculate_vertex_stride, ComponentType, Format, FormatHint, InputAssembly, ProcessingFlags,
    VertexElement,
};
pub use marrow_types::{read_element_raw, write_element_raw};

use crate::GeoProcError;

/// A logical attribute stream: raw bytes plus the format, stride and
/// processing fix-ups needed to read values out of it.
pub trait VertexSource: Send + Sync {
    fn data(&self) -> &[u8];
    fn stride(&self) -> usize;
    fn count(&self) -> usize;
    fn format(&self) -> Format;
    fn processing_flags(&self) -> ProcessingFlags {
        ProcessingFlags::empty()
    }
    fn format_hint(&self) -> FormatHint {
        FormatHint::empty()
    }
}

/// Plain byte-buffer implementation of [`VertexSource`].
pub struct RawVertexSource {
    data: Vec<u8>,
    count: usize,
    stride: usize,
    format: Format,
    processing_flags: ProcessingFlags,
    format_hint: FormatHint,
}

impl RawVertexSource {
    pub fn new(data: Vec<u8>, count: usize, stride: usize, format: Format) -> Arc<Self> {
        debug_assert!(stride * count <= data.len());
        Arc::new(Self {
            data,
            count,
            stride,
            format,
            processing_flags: ProcessingFlags::empty(),
            format_hint: FormatHint::empty(),
        })
    }

    /// Tightly packed data in the given format.
    pub fn from_packed(data: Vec<u8>, format: Format) -> Arc<Self> {
        let stride = format.bytes() as usize;
        let count = data.len() / stride;
        Self::new(data, count, stride, format)
    }

    pub fn from_vec3s(values: &[Vec3]) -> Arc<Self> {
        Self::from_packed(bytemuck::cast_slice(values).to_vec(), Format::Rgb32Float)
    }

    pub fn from_vec4s(values: &[Vec4]) -> Arc<Self> {
        Self::from_packed(bytemuck::cast_slice(values).to_vec(), Format::Rgba32Float)
    }

    pub fn from_vec2s(values: &[Vec2]) -> Arc<Self> {
        Self::from_packed(bytemuck::cast_slice(values).to_vec(), Format::Rg32Float)
    }

    pub fn with_processing_flags(mut self: Arc<Self>, flags: ProcessingFlags) -> Arc<Self> {
        Arc::get_mut(&mut self).unwrap().processing_flags = flags;
        self
    }

    pub fn with_format_hint(mut self: Arc<Self>, hint: FormatHint) -> Arc<Self> {
        Arc::get_mut(&mut self).unwrap().format_hint = hint;
        self
    }
}

impl VertexSource for RawVertexSource {
    fn data(&self) -> &[u8] {
        &self.data
    }
    fn stride(&self) -> usize {
        self.stride
    }
    fn count(&self) -> usize {
        self.count
    }
    fn format(&self) -> Format {
        self.format
    }
    fn processing_flags(&self) -> ProcessingFlags {
        self.processing_flags
    }
    fn format_hint(&self) -> FormatHint {
        self.format_hint
    }
}

/// Read element `index` of a source as four floats, applying the source's
/// processing flags. Missing components default to 0 (or 1 for w).
pub fn read_element(source: &dyn VertexSource, index: usize) -> [f32; 4] {
    let start = index * source.stride();
    read_element_raw(
        &source.data()[start..],
        source.format(),
        source.processing_flags(),
    )
}

/// Copy vertex values from a source into a strided destination, applying the
/// optional index mapping and converting formats. A direct byte copy is used
/// when source and destination formats are identical and no processing
/// flags are set; [`ComponentType::Uint8`] data is only ever byte-copied.
#[allow(clippy::too_many_arguments)]
pub fn copy_vertex_data(
    dst: &mut [u8],
    dst_format: Format,
    dst_stride: usize,
    src: &[u8],
    src_format: Format,
    src_stride: usize,
    count: usize,
    mapping: &[u32],
    flags: ProcessingFlags,
) -> Result<(), GeoProcError> {
    let identical = dst_format == src_format && flags.is_empty();
    let int_copy = matches!(src_format.component_type(), ComponentType::Uint8)
        || matches!(dst_format.component_type(), ComponentType::Uint8);
    if int_copy && !(dst_format == src_format) {
        return Err(GeoProcError::UnsupportedConversion {
            from: src_format,
            to: dst_format,
        });
    }

    for v in 0..count {
        let src_index = mapping.get(v).map_or(v, |&m| m as usize);
        let src_start = src_index * src_stride;
        let dst_start = v * dst_stride;
        if identical {
            let size = src_format.bytes() as usize;
            dst[dst_start..dst_start + size].copy_from_slice(&src[src_start..src_start + size]);
        } else {
            let value = read_element_raw(&src[src_start..], src_format, flags);
            write_element_raw(&mut dst[dst_start..], dst_format, value);
        }
    }
    Ok(())
}

/// Settings affecting the packed vertex-buffer layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeVbSettings {
    /// Pack float streams as 16-bit floats instead of 32-bit.
    pub use_16_bit_floats: bool,
}

/// One stream of a [`MeshDatabase`].
pub struct Stream {
    source: Arc<dyn VertexSource>,
    /// unified index -> index into the source. Empty means identity.
    vertex_map: Vec<u32>,
    semantic_name: String,
    semantic_index: u32,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("vertex_map", &self.vertex_map)
            .field("semantic_name", &self.semantic_name)
            .field("semantic_index", &self.semantic_index)
            .finish()
    }
}

impl Stream {
    pub fn source(&self) -> &Arc<dyn VertexSource> {
        &self.source
    }
    pub fn vertex_map(&self) -> &[u32] {
        &self.vertex_map
    }
    pub fn semantic_name(&self) -> &str {
        &self.semantic_name
    }
    pub fn semantic_index(&self) -> u32 {
        self.semantic_index
    }

    /// Resolve a unified vertex index to an index into the source data.
    pub fn resolve(&self, unified_index: usize) -> usize {
        if self.vertex_map.is_empty() {
            unified_index
        } else {
            self.vertex_map[unified_index] as usize
        }
    }
}

/// Collection of named attribute streams with a unified vertex count.
///
/// Built incrementally by the geometry unifier and the derived-attribute
/// generators; immutable once the nascent geometry is assembled.
#[derive(Default, Debug)]
pub struct MeshDatabase {
    streams: Vec<Stream>,
    unified_vertex_count: usize,
}

impl MeshDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn unified_vertex_count(&self) -> usize {
        self.unified_vertex_count
    }

    /// Bitfield of semantic indices present for the given semantic name.
    pub fn has_element(&self, name: &str) -> u32 {
        let mut result = 0;
        for stream in &self.streams {
            if stream.semantic_name.eq_ignore_ascii_case(name) {
                debug_assert_eq!(result & (1 << stream.semantic_index), 0);
                result |= 1 << stream.semantic_index;
            }
        }
        result
    }

    pub fn find_element(&self, name: &str, semantic_index: u32) -> Option<usize> {
        self.streams.iter().position(|s| {
            s.semantic_index == semantic_index && s.semantic_name.eq_ignore_ascii_case(name)
        })
    }

    pub fn add_stream(
        &mut self,
        source: Arc<dyn VertexSource>,
        vertex_map: Vec<u32>,
        semantic_name: &str,
        semantic_index: u32,
    ) -> usize {
        self.insert_stream(self.streams.len(), source, vertex_map, semantic_name, semantic_index)
    }

    pub fn insert_stream(
        &mut self,
        position: usize,
        source: Arc<dyn VertexSource>,
        vertex_map: Vec<u32>,
        semantic_name: &str,
        semantic_index: u32,
    ) -> usize {
        let count = if vertex_map.is_empty() {
            source.count()
        } else {
            vertex_map.len()
        };
        assert!(count > 0);
        if self.unified_vertex_count == 0 {
            self.unified_vertex_count = count;
        } else {
            self.unified_vertex_count = self.unified_vertex_count.min(count);
        }

        self.streams.insert(
            position,
            Stream {
                source,
                vertex_map,
                semantic_name: semantic_name.to_string(),
                semantic_index,
            },
        );
        position
    }

    pub fn remove_stream(&mut self, element_index: usize) {
        if element_index < self.streams.len() {
            self.streams.remove(element_index);
        }
    }

    /// Read a unified vertex's value from one stream as four floats.
    pub fn unified_element(&self, vertex_index: usize, element_index: usize) -> [f32; 4] {
        let stream = &self.streams[element_index];
        read_element(stream.source.as_ref(), stream.resolve(vertex_index))
    }

    pub fn unified_element_vec3(&self, vertex_index: usize, element_index: usize) -> Vec3 {
        let v = self.unified_element(vertex_index, element_index);
        Vec3::new(v[0], v[1], v[2])
    }

    pub fn unified_element_vec2(&self, vertex_index: usize, element_index: usize) -> Vec2 {
        let v = self.unified_element(vertex_index, element_index);
        Vec2::new(v[0], v[1])
    }

    /// Map each unified vertex back to its originating position index.
    ///
    /// The position stream is assumed to be stream 0; with an identity
    /// vertex map the unified index is its own position index.
    pub fn build_unified_index_to_position_index(&self) -> Vec<u32> {
        if self
            .streams
            .first()
            .map_or(true, |s| s.vertex_map.is_empty())
        {
            (0..self.unified_vertex_count as u32).collect()
        } else {
            self.streams[0].vertex_map[..self.unified_vertex_count].to_vec()
        }
    }

    /// Interleave every stream into a single packed vertex buffer with the
    /// given layout.
    pub fn build_native_vertex_buffer(
        &self,
        layout: &InputAssembly,
    ) -> Result<Vec<u8>, GeoProcError> {
        let size = layout.vertex_stride as usize * self.unified_vertex_count;
        let mut buffer = vec![0u8; size];

        for (element, stream) in layout.elements.iter().zip(&self.streams) {
            let source = stream.source.as_ref();
            copy_vertex_data(
                &mut buffer[element.aligned_byte_offset as usize..],
                element.format,
                layout.vertex_stride as usize,
                source.data(),
                source.format(),
                source.stride(),
                self.unified_vertex_count,
                &stream.vertex_map,
                source.processing_flags(),
            )?;
        }

        Ok(buffer)
    }
}

/// Choose the packed vertex-buffer format for a source stream.
fn final_vb_format(source: &dyn VertexSource, settings: &NativeVbSettings) -> Format {
    let ty = source.format().component_type();
    let count = source.format().component_count();

    if source.format_hint().contains(FormatHint::IS_COLOR) {
        return Format::from_parts(ComponentType::Unorm8, count);
    }

    match ty {
        ComponentType::Unorm8
        | ComponentType::Unorm16
        | ComponentType::Snorm8
        | ComponentType::Snorm16
        | ComponentType::Uint8 => Format::from_parts(ty, count),
        ComponentType::Float32 | ComponentType::Float16 => {
            if settings.use_16_bit_floats {
                Format::from_parts(ComponentType::Float16, count)
            } else {
                Format::from_parts(ComponentType::Float32, count)
            }
        }
    }
}

/// Lay the database's streams out sequentially into one interleaved vertex
/// buffer. The stride is rounded up to a multiple of 4.
pub fn build_default_layout(mesh: &MeshDatabase, settings: &NativeVbSettings) -> InputAssembly {
    let mut elements = Vec::with_capacity(mesh.streams().len());
    let mut offset = 0u32;
    for stream in mesh.streams() {
        let format = final_vb_format(stream.source().as_ref(), settings);
        elements.push(VertexElement::new(
            stream.semantic_name(),
            stream.semantic_index(),
            format,
            offset,
        ));
        offset += format.bytes();
    }

    // very small strides trip up graphics APIs; round up to a multiple of 4
    let vertex_stride = (calculate_vertex_stride(&elements) + 3) & !3;
    InputAssembly {
        elements,
        vertex_stride,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marrow_types::semantics;

    #[test]
    fn read_element_defaults_and_flip_v() {
        let source = RawVertexSource::from_vec2s(&[Vec2::new(0.25, 0.25)])
            .with_processing_flags(ProcessingFlags::FLIP_V);
        let v = read_element(source.as_ref(), 0);
        assert_eq!(v, [0.25, 0.75, 0.0, 1.0]);
    }

    #[test]
    fn unorm8_round_trip() {
        let mut bytes = [0u8; 4];
        write_element_raw(&mut bytes, Format::Rgba8Unorm, [0.0, 0.5, 1.0, 0.25]);
        let back = read_element_raw(&bytes, Format::Rgba8Unorm, ProcessingFlags::empty());
        assert!((back[1] - 0.5).abs() < 1.0 / 255.0);
        assert_eq!(back[2], 1.0);
    }

    #[test]
    fn f16_round_trip() {
        let mut bytes = [0u8; 8];
        write_element_raw(&mut bytes, Format::Rgba16Float, [1.5, -2.0, 0.125, 1.0]);
        let back = read_element_raw(&bytes, Format::Rgba16Float, ProcessingFlags::empty());
        assert_eq!(&back[..3], &[1.5, -2.0, 0.125]);
    }

    #[test]
    fn default_layout_narrows_colors_and_pads_stride() {
        let mut mesh = MeshDatabase::new();
        mesh.add_stream(
            RawVertexSource::from_vec3s(&[Vec3::ZERO, Vec3::ONE]),
            Vec::new(),
            semantics::POSITION,
            0,
        );
        mesh.add_stream(
            RawVertexSource::from_vec4s(&[Vec4::ONE, Vec4::ZERO])
                .with_format_hint(FormatHint::IS_COLOR),
            Vec::new(),
            semantics::COLOR,
            0,
        );

        let layout = build_default_layout(&mesh, &NativeVbSettings::default());
        assert_eq!(layout.elements[0].format, Format::Rgb32Float);
        assert_eq!(layout.elements[1].format, Format::Rgba8Unorm);
        assert_eq!(layout.elements[1].aligned_byte_offset, 12);
        assert_eq!(layout.vertex_stride, 16);
    }

    #[test]
    fn native_vertex_buffer_applies_vertex_map() {
        let mut mesh = MeshDatabase::new();
        let positions = [Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 2.0, 0.0)];
        // two unified vertices both pointing at source element 1
        mesh.add_stream(
            RawVertexSource::from_vec3s(&positions),
            vec![1, 1],
            semantics::POSITION,
            0,
        );

        let layout = build_default_layout(&mesh, &NativeVbSettings::default());
        let vb = mesh.build_native_vertex_buffer(&layout).unwrap();
        let values: Vec<f32> = vb
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect();
        assert_eq!(&values[0..3], &[0.0, 2.0, 0.0]);
        assert_eq!(&values[3..6], &[0.0, 2.0, 0.0]);
    }
}
