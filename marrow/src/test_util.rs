//! Shared fixtures for the crate's tests: an in-memory GPU device and
//! scaffold files written to the temp directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use glam::Vec3;
use marrow_anim::SkeletonMachine;
use marrow_types::{
    ChunkFileWriter, ModelImmutableRecord, CHUNK_TYPE_LARGE_BLOCKS, CHUNK_TYPE_MODEL,
    CHUNK_TYPE_SKELETON,
};
use parking_lot::Mutex;

use crate::gpu::{
    DescriptorSetDesc, DescriptorSetHandle, DynamicGpuBuffer, GpuBuffer, GpuDevice,
    PipelineAcceleratorDesc, PipelineAcceleratorHandle,
};
use crate::scaffold::ModelScaffold;

pub struct MockBuffer {
    pub data: Vec<u8>,
}

impl GpuBuffer for MockBuffer {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Dynamic buffer that remembers what the last map wrote, so tests can
/// inspect deform output.
pub struct MockDynamicBuffer {
    pub contents: Mutex<Vec<u8>>,
}

impl GpuBuffer for MockDynamicBuffer {
    fn size(&self) -> u64 {
        self.contents.lock().len() as u64
    }
}

impl DynamicGpuBuffer for MockDynamicBuffer {
    fn map_discard(&self, fill: &mut dyn FnMut(&mut [u8])) {
        let mut contents = self.contents.lock();
        // discard semantics: the caller sees a fresh region each map
        contents.iter_mut().for_each(|byte| *byte = 0);
        fill(&mut contents);
    }
}

#[derive(Default)]
pub struct MockDeviceCounters {
    pub static_vertex_buffers: u64,
    pub static_index_buffers: u64,
    pub dynamic_vertex_buffers: u64,
    pub pipeline_accelerators: u64,
    pub descriptor_sets: u64,
}

pub struct MockDevice {
    pub counters: Mutex<MockDeviceCounters>,
    pub dynamic_buffers: Mutex<Vec<Arc<MockDynamicBuffer>>>,
    pub pipeline_descs: Mutex<Vec<PipelineAcceleratorDesc>>,
    next_handle: AtomicU64,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counters: Mutex::new(MockDeviceCounters::default()),
            dynamic_buffers: Mutex::new(Vec::new()),
            pipeline_descs: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        })
    }
}

impl GpuDevice for MockDevice {
    fn create_static_vertex_buffer(&self, data: &[u8]) -> Arc<dyn GpuBuffer> {
        self.counters.lock().static_vertex_buffers += 1;
        Arc::new(MockBuffer {
            data: data.to_vec(),
        })
    }

    fn create_static_index_buffer(&self, data: &[u8]) -> Arc<dyn GpuBuffer> {
        self.counters.lock().static_index_buffers += 1;
        Arc::new(MockBuffer {
            data: data.to_vec(),
        })
    }

    fn create_dynamic_vertex_buffer(&self, size: u64) -> Arc<dyn DynamicGpuBuffer> {
        self.counters.lock().dynamic_vertex_buffers += 1;
        let buffer = Arc::new(MockDynamicBuffer {
            contents: Mutex::new(vec![0u8; size as usize]),
        });
        self.dynamic_buffers.lock().push(buffer.clone());
        buffer
    }

    fn create_pipeline_accelerator(
        &self,
        desc: &PipelineAcceleratorDesc,
    ) -> PipelineAcceleratorHandle {
        self.counters.lock().pipeline_accelerators += 1;
        self.pipeline_descs.lock().push(desc.clone());
        PipelineAcceleratorHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn create_descriptor_set_accelerator(&self, _desc: &DescriptorSetDesc) -> DescriptorSetHandle {
        self.counters.lock().descriptor_sets += 1;
        DescriptorSetHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
}

static FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn temp_scaffold_path(tag: &str) -> PathBuf {
    let unique = FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "marrow-test-{}-{}-{}.scaffold",
        std::process::id(),
        tag,
        unique
    ))
}

/// Write a model scaffold file and return its path.
pub fn write_model_scaffold_file(
    tag: &str,
    record: &ModelImmutableRecord,
    skeleton: Option<&SkeletonMachine>,
    large_blocks: Vec<u8>,
) -> PathBuf {
    let mut writer = ChunkFileWriter::new();
    writer.add_chunk(
        CHUNK_TYPE_MODEL,
        marrow_types::MODEL_CHUNK_VERSION,
        bincode::serialize(record).unwrap(),
    );
    if let Some(skeleton) = skeleton {
        writer.add_chunk(
            CHUNK_TYPE_SKELETON,
            marrow_types::SKELETON_CHUNK_VERSION,
            bincode::serialize(skeleton).unwrap(),
        );
    }
    writer.add_chunk(
        CHUNK_TYPE_LARGE_BLOCKS,
        marrow_types::LARGE_BLOCKS_CHUNK_VERSION,
        large_blocks,
    );

    let path = temp_scaffold_path(tag);
    let mut file = std::fs::File::create(&path).unwrap();
    writer.write_to(&mut file).unwrap();
    path
}

/// Write a material scaffold file and return its path.
pub fn write_material_scaffold_file(
    tag: &str,
    record: &marrow_types::MaterialImmutableRecord,
) -> PathBuf {
    let mut writer = ChunkFileWriter::new();
    writer.add_chunk(
        marrow_types::CHUNK_TYPE_MATERIAL,
        marrow_types::MATERIAL_CHUNK_VERSION,
        bincode::serialize(record).unwrap(),
    );
    let path = temp_scaffold_path(tag);
    let mut file = std::fs::File::create(&path).unwrap();
    writer.write_to(&mut file).unwrap();
    path
}

pub fn empty_model_record() -> ModelImmutableRecord {
    ModelImmutableRecord {
        geos: Vec::new(),
        skinned_geos: Vec::new(),
        command_stream: Default::default(),
        default_transforms: Vec::new(),
        bounding_box: (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)),
        max_lod: 0,
    }
}

pub fn empty_model_scaffold() -> Arc<ModelScaffold> {
    let path = write_model_scaffold_file("empty", &empty_model_record(), None, Vec::new());
    Arc::new(ModelScaffold::load(path).unwrap())
}
