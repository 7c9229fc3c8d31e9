//! The GPU boundary: everything the runtime needs from the host graphics
//! layer.
//!
//! The core never touches shader bytecode, command buffers or device
//! objects; it hands byte buffers and pipeline descriptions across this
//! boundary and gets opaque handles back.

use std::sync::Arc;

use marrow_types::{
    FastHashMap, RenderStateSet, Topology, VertexElement,
};
use parking_lot::Mutex;

/// An immutable GPU buffer resource.
pub trait GpuBuffer: Send + Sync {
    fn size(&self) -> u64;
}

/// A GPU buffer with map-with-discard semantics: each map yields a fresh
/// writeable region (from the caller's perspective), so a frame's writes
/// never overlap the previous frame's reads.
pub trait DynamicGpuBuffer: GpuBuffer {
    /// Map the whole buffer, discarding previous contents, and pass the
    /// writeable range to `fill`.
    fn map_discard(&self, fill: &mut dyn FnMut(&mut [u8]));
}

/// Opaque handle to a compiled pipeline state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PipelineAcceleratorHandle(pub u64);

/// Opaque handle to a descriptor-set binding object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(pub u64);

/// One vertex-buffer stream of a pipeline's input layout.
#[derive(Debug, Clone, PartialEq)]
pub struct InputLayoutStream {
    pub elements: Vec<VertexElement>,
    pub stream_index: u32,
}

/// Everything needed to build a pipeline state object.
#[derive(Debug, Clone)]
pub struct PipelineAcceleratorDesc {
    /// Hash of the shader patch collection driving shader selection.
    pub patch_collection: u64,
    /// Material selectors, sorted for deterministic hashing.
    pub selectors: Vec<(String, i32)>,
    pub input_layout: Vec<InputLayoutStream>,
    pub topology: Topology,
    pub state_set: RenderStateSet,
}

/// Everything needed to build a descriptor-set binding object.
#[derive(Debug, Clone)]
pub struct DescriptorSetDesc {
    /// Resource names of the layout, in slot order.
    pub layout_resources: Vec<String>,
    pub constants: Vec<(String, [f32; 4])>,
    /// `(resource name, texture name)` bindings the material supplies.
    pub texture_bindings: Vec<(String, String)>,
}

/// The operations the host application must provide.
pub trait GpuDevice: Send + Sync {
    fn create_static_vertex_buffer(&self, data: &[u8]) -> Arc<dyn GpuBuffer>;
    fn create_static_index_buffer(&self, data: &[u8]) -> Arc<dyn GpuBuffer>;
    fn create_dynamic_vertex_buffer(&self, size: u64) -> Arc<dyn DynamicGpuBuffer>;
    fn create_pipeline_accelerator(&self, desc: &PipelineAcceleratorDesc)
        -> PipelineAcceleratorHandle;
    fn create_descriptor_set_accelerator(&self, desc: &DescriptorSetDesc) -> DescriptorSetHandle;
}

fn hash_pipeline_desc(desc: &PipelineAcceleratorDesc) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    desc.patch_collection.hash(&mut hasher);
    for (name, value) in &desc.selectors {
        name.hash(&mut hasher);
        value.hash(&mut hasher);
    }
    for stream in &desc.input_layout {
        stream.stream_index.hash(&mut hasher);
        for element in &stream.elements {
            element.semantic_name.hash(&mut hasher);
            element.semantic_index.hash(&mut hasher);
            element.aligned_byte_offset.hash(&mut hasher);
            element.format.hash(&mut hasher);
        }
    }
    desc.topology.hash(&mut hasher);
    desc.state_set.hash(&mut hasher);
    hasher.finish()
}

/// Deduplicating pool over [`GpuDevice::create_pipeline_accelerator`].
///
/// Renderers sharing the pool get the same handle back for identical
/// pipeline descriptions, so pipeline construction cost is paid once.
pub struct PipelineAcceleratorPool {
    device: Arc<dyn GpuDevice>,
    cache: Mutex<FastHashMap<u64, PipelineAcceleratorHandle>>,
}

impl PipelineAcceleratorPool {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            cache: Mutex::new(FastHashMap::default()),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn create_pipeline_accelerator(
        &self,
        desc: &PipelineAcceleratorDesc,
    ) -> PipelineAcceleratorHandle {
        let key = hash_pipeline_desc(desc);
        if let Some(&handle) = self.cache.lock().get(&key) {
            return handle;
        }
        // construct outside the lock; a racing duplicate is harmless
        let handle = self.device.create_pipeline_accelerator(desc);
        self.cache.lock().insert(key, handle);
        handle
    }

    pub fn cached_pipeline_count(&self) -> usize {
        self.cache.lock().len()
    }
}
