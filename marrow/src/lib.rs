//! Runtime core for skinned-model rendering.
//!
//! `marrow` loads chunked scaffold files produced by `marrow-geoproc`,
//! builds renderers over a host-provided GPU abstraction, executes deform
//! chains (host-side skinning included) each frame, emits draw packets, and
//! caches it all behind asset futures.
//!
//! The per-frame contract on the game thread is strict per renderer:
//! feed in skeleton matrices, generate the deform buffer, then build
//! drawables. Asset retrieval is asynchronous; everything else is
//! synchronous and CPU-bound.

pub mod cache;
pub mod deform;
pub mod gpu;
pub mod renderer;
pub mod scaffold;
pub mod skin_deform;
pub mod vertex_util;

#[cfg(test)]
pub(crate) mod test_util;

use std::sync::Arc;

use once_cell::sync::OnceCell;


static GLOBAL_PIPELINE_ACCELERATOR_POOL: OnceCell<Arc<PipelineAcceleratorPool>> = OnceCell::new();

/// Install the process-wide pipeline-accelerator pool. Call once at program
/// start, before any renderer construction; later calls return the pool
/// installed first.
pub fn init_pipeline_accelerator_pool(device: Arc<dyn GpuDevice>) -> Arc<PipelineAcceleratorPool> {
    GLOBAL_PIPELINE_ACCELERATOR_POOL
        .get_or_init(|| Arc::new(PipelineAcceleratorPool::new(device)))
        .clone()
}

/// The pool installed by [`init_pipeline_accelerator_pool`], if any.
pub fn global_pipeline_accelerator_pool() -> Option<Arc<PipelineAcceleratorPool>> {
    GLOBAL_PIPELINE_ACCELERATOR_POOL.get().cloned()
}

pub use cache::{AssetFuture, AssetLruHeap, AssetState, ModelCache, ModelCacheConfig};
pub use deform::{DeformOperation, DeformOperationFactory, DeformOperationInstantiation, NameAndFormat};
pub use gpu::{
    DescriptorSetDesc, DescriptorSetHandle, DynamicGpuBuffer, GpuBuffer, GpuDevice,
    InputLayoutStream, PipelineAcceleratorDesc, PipelineAcceleratorHandle, PipelineAcceleratorPool,
};
pub use renderer::{
    Drawable, DrawablesPacket, PreDrawDelegate, RendererError, SimpleModelRenderer,
    UniformBufferBinding, UniformBufferDelegate,
};
pub use scaffold::{
    AnimationSetScaffold, LargeBlocks, MaterialScaffold, ModelScaffold, ScaffoldLoadError,
    SkeletonScaffold,
};
pub use skin_deform::SkinDeformer;
