//! Runtime renderer build-up and per-frame execution.
//!
//! [`SimpleModelRenderer::new`] turns a loaded model scaffold (plus
//! materials and a deform chain) into GPU buffers, pipeline accelerators
//! and a deform plan. Per frame, the game thread runs
//! `feed_in_skeleton_machine_results` -> `generate_deform_buffer` ->
//! `build_drawables`, in that order.

use std::io;
use std::sync::Arc;

use arrayvec::ArrayVec;
use glam::Mat4;
use marrow_anim::SkeletonBinding;
use marrow_types::{
    DrawCall, Format, GeoCallRecord, IndexFormat, MaterialRecord, RawGeometryRecord,
    SkinnedGeometryRecord, Topology, VertexData, VertexElement,
};
use thiserror::Error;

use crate::deform::{DeformOperation, DeformOperationInstantiation, NameAndFormat};
use crate::gpu::{
    DescriptorSetDesc, DescriptorSetHandle, DynamicGpuBuffer, GpuBuffer, InputLayoutStream,
    PipelineAcceleratorDesc, PipelineAcceleratorHandle, PipelineAcceleratorPool,
};
use crate::scaffold::{MaterialScaffold, ModelScaffold, ScaffoldLoadError};
use crate::skin_deform::SkinDeformer;
use crate::vertex_util::{copy_elements, VertexElementRange, VertexElementRangeMut};

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("deform operation {name:?} is not registered")]
    UnknownDeformOperation { name: String },
    #[error("required element {semantic} not found for geo {geo_id}")]
    MissingSourceAttribute { semantic: String, geo_id: u32 },
    #[error("scaffold error during renderer construction")]
    Scaffold(#[from] ScaffoldLoadError),
    #[error("failed to read scaffold large blocks")]
    LargeBlockRead {
        #[source]
        source: io::Error,
    },
}

/// Provides extra per-draw uniform data. The core only forwards the bytes.
pub trait UniformBufferDelegate: Send + Sync {
    fn write_buffer(&self) -> Vec<u8>;
}

/// A named delegate slot bound onto every drawable this renderer emits.
#[derive(Clone)]
pub struct UniformBufferBinding {
    pub name: u64,
    pub delegate: Arc<dyn UniformBufferDelegate>,
}

/// Which of the three deform byte regions an element lives in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeformBufferId {
    /// Values copied/converted out of the scaffold at construction.
    StaticData,
    /// CPU-side scratch written and consumed within the chain.
    Temporary,
    /// The dynamic vertex buffer region fed to the GPU.
    PostDeform,
}

/// One element lane of a deform operation's input or output.
#[derive(Debug, Copy, Clone)]
pub struct PlannedElement {
    pub format: Format,
    /// Absolute byte offset within the element's buffer.
    pub offset: u32,
    pub stride: u32,
    pub buffer: DeformBufferId,
}

/// A deform operation with its planned input and output lanes.
pub struct DeformOpPlan {
    pub operation: Arc<dyn DeformOperation>,
    pub input_elements: Vec<PlannedElement>,
    pub output_elements: Vec<PlannedElement>,
}

/// One vertex-buffer stream of a drawable geo. A `None` resource marks a
/// slot for the renderer's dynamic deform buffer, assigned after planning.
pub struct VertexStream {
    pub resource: Option<Arc<dyn GpuBuffer>>,
    pub offset: u64,
}

/// The GPU-side buffers of one geo.
pub struct DrawableGeo {
    pub vertex_streams: ArrayVec<VertexStream, 3>,
    pub index_buffer: Arc<dyn GpuBuffer>,
    pub index_format: IndexFormat,
}

/// A draw call paired with its pipeline and descriptor-set handles.
#[derive(Debug, Copy, Clone)]
pub struct GeoCall {
    pub pipeline_accelerator: PipelineAcceleratorHandle,
    pub descriptor_set: DescriptorSetHandle,
}

struct GeoCallGroup {
    geo_id: u32,
    transform_marker: u32,
    material_guids: Vec<u64>,
    calls: Vec<GeoCall>,
}

/// One emitted draw.
pub struct Drawable {
    pub geo: Arc<DrawableGeo>,
    pub pipeline_accelerator: PipelineAcceleratorHandle,
    pub descriptor_set: DescriptorSetHandle,
    pub draw_call: DrawCall,
    pub object_to_world: Mat4,
    pub material_guid: u64,
    pub draw_call_index: u32,
    pub uniform_buffer_bindings: Vec<UniformBufferBinding>,
}

/// The batch packet drawables are emitted into.
#[derive(Default)]
pub struct DrawablesPacket {
    pub drawables: Vec<Drawable>,
}

/// Given first refusal on every drawable; returning false suppresses it.
pub trait PreDrawDelegate {
    fn on_draw(&self, drawable: &Drawable) -> bool;
}

////////////////////////////////////////////////////////////////////////////////
// Deform planning

/// A request to copy one source element out of the scaffold into the
/// static-data buffer, converting format on the way.
#[derive(Debug, Clone)]
struct SourceDataTransform {
    geo_id: u32,
    source_element_hash: u64,
    target_format: Format,
    target_offset: u32,
    target_stride: u32,
    vertex_count: u32,
}

#[derive(Default)]
struct NascentDeformStream {
    deform_ops: Vec<DeformOpPlan>,
    /// Sorted, deduplicated semantic hashes that must not be bound from
    /// the static vertex streams.
    suppressed_elements: Vec<u64>,
    /// Elements produced by the chain, laid out in the post-deform region.
    generated_elements: Vec<VertexElement>,
    static_data_load_requests: Vec<SourceDataTransform>,
    post_deform_offset: u32,
    post_deform_size: u32,
}

/// Resolve the data-flow of all deform operations attached to one geo and
/// assign byte regions in the three deform buffers.
fn build_nascent_deform_stream(
    attachments: &[DeformOperationInstantiation],
    geo_id: u32,
    vertex_count: u32,
    static_cursor: &mut u32,
    temporary_cursor: &mut u32,
    post_deform_cursor: &mut u32,
) -> NascentDeformStream {
    let attached: Vec<&DeformOperationInstantiation> =
        attachments.iter().filter(|a| a.geo_id == geo_id).collect();
    if attached.is_empty() {
        return NascentDeformStream::default();
    }

    struct WorkingOp {
        operation: Arc<dyn DeformOperation>,
        input_stream_ids: Vec<u32>,
        output_stream_ids: Vec<u32>,
    }

    let mut suppressed: Vec<u64> = Vec::new();
    let mut generated: Vec<(NameAndFormat, u32)> = Vec::new();
    let mut temporary: Vec<(NameAndFormat, u32)> = Vec::new();
    let mut source_data: Vec<(NameAndFormat, u32)> = Vec::new();
    let mut working_ops: Vec<WorkingOp> = Vec::new();
    let mut next_stream_id = 0u32;

    for attachment in &attached {
        let mut working = WorkingOp {
            operation: attachment.operation.clone(),
            input_stream_ids: Vec::new(),
            output_stream_ids: Vec::new(),
        };

        for element in &attachment.upstream_source_elements {
            // an upstream element published by an earlier op is demoted to
            // the temporary buffer; otherwise it is a static-data load
            let published = generated.iter().position(|(name, _)| {
                name.semantic_name == element.semantic_name
                    && name.semantic_index == element.semantic_index
            });
            if let Some(index) = published {
                let entry = generated.remove(index);
                debug_assert_eq!(entry.0.format, element.format);
                working.input_stream_ids.push(entry.1);
                temporary.push(entry);
            } else {
                let stream_id = next_stream_id;
                next_stream_id += 1;
                working.input_stream_ids.push(stream_id);
                source_data.push((element.clone(), stream_id));
            }
        }

        // anything this op suppresses or re-generates drops out of the
        // published set without landing anywhere
        generated.retain(|(name, _)| {
            !attachment.suppress_elements.contains(&name.semantic_hash())
                && !attachment.generated_elements.contains(name)
        });

        for element in &attachment.generated_elements {
            let stream_id = next_stream_id;
            next_stream_id += 1;
            generated.push((element.clone(), stream_id));
            working.output_stream_ids.push(stream_id);
        }

        suppressed.extend_from_slice(&attachment.suppress_elements);
        working_ops.push(working);
    }

    // elements still published at the end of the chain override their
    // source values, so their static bindings are suppressed too
    for (name, _) in &generated {
        suppressed.push(name.semantic_hash());
    }
    suppressed.sort_unstable();
    suppressed.dedup();

    let mut result = NascentDeformStream {
        suppressed_elements: suppressed,
        ..NascentDeformStream::default()
    };

    // lay each group out interleaved within its region
    let lay_out = |elements: &[(NameAndFormat, u32)],
                   cursor: &mut u32,
                   buffer: DeformBufferId|
     -> Vec<PlannedElement> {
        let stride: u32 = elements.iter().map(|(name, _)| name.format.bytes()).sum();
        let mut offset = 0;
        let lanes: Vec<PlannedElement> = elements
            .iter()
            .map(|(name, _)| {
                let lane = PlannedElement {
                    format: name.format,
                    offset: *cursor + offset,
                    stride,
                    buffer,
                };
                offset += name.format.bytes();
                lane
            })
            .collect();
        *cursor += stride * vertex_count;
        lanes
    };

    let source_lanes = lay_out(&source_data, static_cursor, DeformBufferId::StaticData);
    for ((name, _), lane) in source_data.iter().zip(&source_lanes) {
        result.static_data_load_requests.push(SourceDataTransform {
            geo_id,
            source_element_hash: name.semantic_hash(),
            target_format: name.format,
            target_offset: lane.offset,
            target_stride: lane.stride,
            vertex_count,
        });
    }
    let temporary_lanes = lay_out(&temporary, temporary_cursor, DeformBufferId::Temporary);

    result.post_deform_offset = *post_deform_cursor;
    let generated_lanes = lay_out(&generated, post_deform_cursor, DeformBufferId::PostDeform);
    result.post_deform_size = *post_deform_cursor - result.post_deform_offset;

    // record the generated elements with their within-vertex offsets, for
    // the pipeline input layout
    let mut within_vertex = 0;
    for (name, _) in &generated {
        result.generated_elements.push(VertexElement::new(
            &name.semantic_name,
            name.semantic_index,
            name.format,
            within_vertex,
        ));
        within_vertex += name.format.bytes();
    }

    let find_lane = |stream_id: u32| -> Option<PlannedElement> {
        if let Some(index) = generated.iter().position(|&(_, id)| id == stream_id) {
            return Some(generated_lanes[index]);
        }
        if let Some(index) = temporary.iter().position(|&(_, id)| id == stream_id) {
            return Some(temporary_lanes[index]);
        }
        source_data
            .iter()
            .position(|&(_, id)| id == stream_id)
            .map(|index| source_lanes[index])
    };

    for working in working_ops {
        let input_elements = working
            .input_stream_ids
            .iter()
            .filter_map(|&id| find_lane(id))
            .collect();
        let output_elements = working
            .output_stream_ids
            .iter()
            .filter_map(|&id| find_lane(id))
            .collect();
        result.deform_ops.push(DeformOpPlan {
            operation: working.operation,
            input_elements,
            output_elements,
        });
    }

    result
}

/// Materialise every requested `(geo, semantic)` into the static-data
/// buffer, seeking into the scaffold's large-blocks region and converting
/// formats through the element iterators.
fn generate_deform_static_input(
    scaffold: &ModelScaffold,
    requests: &[SourceDataTransform],
    buffer_size: u32,
) -> Result<Vec<u8>, RendererError> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    let mut result = vec![0u8; buffer_size as usize];
    let mut large_blocks = scaffold.open_large_blocks()?;
    let immutable = scaffold.immutable_data();
    let geo_count = immutable.geos.len() as u32;

    for request in requests {
        let candidates: ArrayVec<&VertexData, 3> = if request.geo_id < geo_count {
            let geo = &immutable.geos[request.geo_id as usize];
            ArrayVec::from_iter([&geo.vb])
        } else {
            let geo = &immutable.skinned_geos[(request.geo_id - geo_count) as usize];
            ArrayVec::from_iter([&geo.vb, &geo.animated_vertex_elements, &geo.skeleton_binding])
        };

        let mut initialized = false;
        for vb in candidates {
            let element = match vb.ia.find_element_by_hash(request.source_element_hash) {
                Some(element) => element,
                None => continue,
            };
            let data = large_blocks
                .read(vb.offset, vb.size)
                .map_err(|source| RendererError::LargeBlockRead { source })?;
            let source = VertexElementRange::new(
                &data[element.aligned_byte_offset as usize..],
                vb.ia.vertex_stride as usize,
                element.format,
            );
            let mut destination = VertexElementRangeMut::from_slice(
                &mut result[request.target_offset as usize..],
                request.target_stride as usize,
                request.target_format,
            );
            let count = (request.vertex_count as usize)
                .min(source.len())
                .min(destination.len());
            copy_elements(&mut destination, &source, count);
            initialized = true;
            break;
        }

        if !initialized {
            return Err(RendererError::MissingSourceAttribute {
                semantic: format!("{:#x}", request.source_element_hash),
                geo_id: request.geo_id,
            });
        }
    }

    Ok(result)
}

////////////////////////////////////////////////////////////////////////////////
// Geo-call construction

/// Built-in descriptor-set layout used when a patch collection declares
/// none of its own.
const FALLBACK_DESCRIPTOR_SET_RESOURCES: &[&str] = &[
    "DiffuseTexture",
    "NormalsTexture",
    "ParametersTexture",
];

struct GeoCallBuilder<'a> {
    pool: &'a PipelineAcceleratorPool,
    material_scaffold: &'a MaterialScaffold,
    /// material guid -> (descriptor set, layout resource names)
    built_materials: Vec<(u64, (DescriptorSetHandle, Vec<String>))>,
}

impl<'a> GeoCallBuilder<'a> {
    fn material(&self, guid: u64) -> MaterialRecord {
        self.material_scaffold
            .immutable_data()
            .material(guid)
            .cloned()
            .unwrap_or_default()
    }

    fn descriptor_set_for(&mut self, guid: u64, material: &MaterialRecord) -> (DescriptorSetHandle, Vec<String>) {
        if let Some((_, cached)) = self.built_materials.iter().find(|(g, _)| *g == guid) {
            return cached.clone();
        }

        let layout_resources: Vec<String> = self
            .material_scaffold
            .immutable_data()
            .patch_collection(material.patch_collection)
            .and_then(|patches| patches.descriptor_set_layout.as_ref())
            .map(|layout| layout.resources.clone())
            .unwrap_or_else(|| {
                FALLBACK_DESCRIPTOR_SET_RESOURCES
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        let descriptor_set = self
            .pool
            .device()
            .create_descriptor_set_accelerator(&DescriptorSetDesc {
                layout_resources: layout_resources.clone(),
                constants: material.constants.clone(),
                texture_bindings: material.bindings.clone(),
            });

        let entry = (descriptor_set, layout_resources);
        self.built_materials.push((guid, entry.clone()));
        entry
    }

    fn make_geo_call(
        &mut self,
        material_guid: u64,
        draw_calls: &[DrawCall],
        input_layout: Vec<InputLayoutStream>,
    ) -> GeoCall {
        let material = self.material(material_guid);
        let (descriptor_set, layout_resources) = self.descriptor_set_for(material_guid, &material);

        // material selectors plus RES_HAS_ for each layout resource the
        // material actually binds
        let mut selectors: Vec<(String, i32)> = material
            .selectors
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        for resource in &layout_resources {
            if material.has_binding(resource) {
                selectors.push((format!("RES_HAS_{}", resource), 1));
            }
        }
        selectors.sort();

        // all draw calls of one geo share a topology
        debug_assert!(!draw_calls.is_empty());
        let topology = draw_calls.first().map_or(Topology::TriangleList, |c| c.topology);
        #[cfg(debug_assertions)]
        for call in draw_calls {
            debug_assert_eq!(call.topology, topology);
        }

        let pipeline_accelerator = self.pool.create_pipeline_accelerator(&PipelineAcceleratorDesc {
            patch_collection: material.patch_collection,
            selectors,
            input_layout,
            topology,
            state_set: material.state_set,
        });

        GeoCall {
            pipeline_accelerator,
            descriptor_set,
        }
    }
}

fn filtered_stream(
    elements: &[VertexElement],
    suppressed: &[u64],
    stream_index: u32,
) -> InputLayoutStream {
    InputLayoutStream {
        elements: elements
            .iter()
            .filter(|e| suppressed.binary_search(&e.semantic_hash()).is_err())
            .cloned()
            .collect(),
        stream_index,
    }
}

fn final_input_layout_static(
    geo: &RawGeometryRecord,
    deform: &NascentDeformStream,
) -> Vec<InputLayoutStream> {
    let mut result = vec![filtered_stream(
        &geo.vb.ia.elements,
        &deform.suppressed_elements,
        0,
    )];
    if !deform.generated_elements.is_empty() {
        result.push(InputLayoutStream {
            elements: deform.generated_elements.clone(),
            stream_index: 1,
        });
    }
    result
}

fn final_input_layout_skinned(
    geo: &SkinnedGeometryRecord,
    deform: &NascentDeformStream,
) -> Vec<InputLayoutStream> {
    let mut result = vec![
        filtered_stream(&geo.vb.ia.elements, &deform.suppressed_elements, 0),
        filtered_stream(
            &geo.animated_vertex_elements.ia.elements,
            &deform.suppressed_elements,
            1,
        ),
    ];
    if !deform.generated_elements.is_empty() {
        result.push(InputLayoutStream {
            elements: deform.generated_elements.clone(),
            stream_index: 2,
        });
    }
    result
}

////////////////////////////////////////////////////////////////////////////////

/// Runtime object built from a model scaffold and a material scaffold:
/// loaded GPU buffers, precomputed geo-calls, and the deform plan.
pub struct SimpleModelRenderer {
    model_scaffold: Arc<ModelScaffold>,
    #[allow(dead_code)]
    material_scaffold: Arc<MaterialScaffold>,

    skeleton_binding: SkeletonBinding,
    base_transforms: Vec<Mat4>,

    geos: Vec<Arc<DrawableGeo>>,
    skinned_geos: Vec<Arc<DrawableGeo>>,
    geo_call_groups: Vec<GeoCallGroup>,
    skin_call_groups: Vec<GeoCallGroup>,

    deform_ops: Vec<DeformOpPlan>,
    deform_static_data: Vec<u8>,
    deform_temporary: Vec<u8>,
    dynamic_vertex_buffer: Option<Arc<dyn DynamicGpuBuffer>>,

    uniform_buffer_bindings: Vec<UniformBufferBinding>,
}

impl SimpleModelRenderer {
    pub fn new(
        pool: &PipelineAcceleratorPool,
        model_scaffold: Arc<ModelScaffold>,
        material_scaffold: Arc<MaterialScaffold>,
        deform_attachments: Vec<DeformOperationInstantiation>,
        uniform_buffer_bindings: Vec<UniformBufferBinding>,
    ) -> Result<Self, RendererError> {
        profiling::scope!("SimpleModelRenderer::new");

        let immutable = model_scaffold.immutable_data();
        let device = pool.device().clone();

        // skeleton defaults: evaluate the embedded machine, or fall back to
        // the transforms stored in the scaffold
        let skeleton = model_scaffold.embedded_skeleton();
        let skeleton_binding = SkeletonBinding::new(
            skeleton.output_interface(),
            &model_scaffold.command_stream().joint_input_interface,
        );
        let base_transforms = if skeleton.output_matrix_count() > 0 {
            let mut transforms = vec![Mat4::IDENTITY; skeleton.output_matrix_count() as usize];
            skeleton
                .generate_output_transforms(skeleton.default_parameters(), &mut transforms)
                .expect("buffer sized from the machine's own output count");
            transforms
        } else {
            immutable.default_transforms.clone()
        };

        let mut static_cursor = 0u32;
        let mut temporary_cursor = 0u32;
        let mut post_deform_cursor = 0u32;
        let mut static_load_requests = Vec::new();
        let mut deform_ops = Vec::new();

        let mut large_blocks = model_scaffold.open_large_blocks()?;
        let mut load_buffer = |vb_offset: u64, vb_size: u64| -> Result<Vec<u8>, RendererError> {
            large_blocks
                .read(vb_offset, vb_size)
                .map_err(|source| RendererError::LargeBlockRead { source })
        };

        let mut geos = Vec::with_capacity(immutable.geos.len());
        let mut geo_deform_streams = Vec::with_capacity(immutable.geos.len());
        for (geo_id, geo) in immutable.geos.iter().enumerate() {
            let deform = build_nascent_deform_stream(
                &deform_attachments,
                geo_id as u32,
                geo.vb.vertex_count(),
                &mut static_cursor,
                &mut temporary_cursor,
                &mut post_deform_cursor,
            );

            let mut vertex_streams = ArrayVec::new();
            vertex_streams.push(VertexStream {
                resource: Some(device.create_static_vertex_buffer(&load_buffer(
                    geo.vb.offset,
                    geo.vb.size,
                )?)),
                offset: 0,
            });
            if deform.post_deform_size != 0 {
                vertex_streams.push(VertexStream {
                    resource: None,
                    offset: deform.post_deform_offset as u64,
                });
            }

            let index_buffer =
                device.create_static_index_buffer(&load_buffer(geo.ib.offset, geo.ib.size)?);

            deform_ops.extend(deform.deform_ops.iter().map(|op| DeformOpPlan {
                operation: op.operation.clone(),
                input_elements: op.input_elements.clone(),
                output_elements: op.output_elements.clone(),
            }));
            static_load_requests.extend(deform.static_data_load_requests.iter().cloned());

            geos.push(Arc::new(DrawableGeo {
                vertex_streams,
                index_buffer,
                index_format: geo.ib.format,
            }));
            geo_deform_streams.push(deform);
        }

        let geo_count = immutable.geos.len() as u32;
        let mut skinned_geos = Vec::with_capacity(immutable.skinned_geos.len());
        let mut skin_deform_streams = Vec::with_capacity(immutable.skinned_geos.len());
        for (index, geo) in immutable.skinned_geos.iter().enumerate() {
            let deform = build_nascent_deform_stream(
                &deform_attachments,
                geo_count + index as u32,
                geo.animated_vertex_elements.vertex_count(),
                &mut static_cursor,
                &mut temporary_cursor,
                &mut post_deform_cursor,
            );

            let mut vertex_streams = ArrayVec::new();
            vertex_streams.push(VertexStream {
                resource: Some(device.create_static_vertex_buffer(&load_buffer(
                    geo.vb.offset,
                    geo.vb.size,
                )?)),
                offset: 0,
            });
            vertex_streams.push(VertexStream {
                resource: Some(device.create_static_vertex_buffer(&load_buffer(
                    geo.animated_vertex_elements.offset,
                    geo.animated_vertex_elements.size,
                )?)),
                offset: 0,
            });
            if deform.post_deform_size != 0 {
                vertex_streams.push(VertexStream {
                    resource: None,
                    offset: deform.post_deform_offset as u64,
                });
            }

            let index_buffer =
                device.create_static_index_buffer(&load_buffer(geo.ib.offset, geo.ib.size)?);

            deform_ops.extend(deform.deform_ops.iter().map(|op| DeformOpPlan {
                operation: op.operation.clone(),
                input_elements: op.input_elements.clone(),
                output_elements: op.output_elements.clone(),
            }));
            static_load_requests.extend(deform.static_data_load_requests.iter().cloned());

            skinned_geos.push(Arc::new(DrawableGeo {
                vertex_streams,
                index_buffer,
                index_format: geo.ib.format,
            }));
            skin_deform_streams.push(deform);
        }
        drop(load_buffer);

        // materials and pipeline accelerators, one geo-call per
        // (command-stream call, material) pair
        let mut builder = GeoCallBuilder {
            pool,
            material_scaffold: &material_scaffold,
            built_materials: Vec::new(),
        };

        let command_stream = model_scaffold.command_stream();
        let make_groups = |builder: &mut GeoCallBuilder<'_>,
                           records: &[GeoCallRecord],
                           layouts: &dyn Fn(u32) -> Vec<InputLayoutStream>,
                           draw_calls: &dyn Fn(u32) -> Vec<DrawCall>|
         -> Vec<GeoCallGroup> {
            records
                .iter()
                .map(|record| {
                    let layout = layouts(record.geo_id);
                    let calls = record
                        .material_guids
                        .iter()
                        .map(|&guid| {
                            builder.make_geo_call(guid, &draw_calls(record.geo_id), layout.clone())
                        })
                        .collect();
                    GeoCallGroup {
                        geo_id: record.geo_id,
                        transform_marker: record.transform_marker,
                        material_guids: record.material_guids.clone(),
                        calls,
                    }
                })
                .collect()
        };

        let geo_call_groups = make_groups(
            &mut builder,
            &command_stream.geo_calls,
            &|geo_id| {
                final_input_layout_static(
                    &immutable.geos[geo_id as usize],
                    &geo_deform_streams[geo_id as usize],
                )
            },
            &|geo_id| immutable.geos[geo_id as usize].draw_calls.clone(),
        );
        let skin_call_groups = make_groups(
            &mut builder,
            &command_stream.skin_calls,
            &|geo_id| {
                final_input_layout_skinned(
                    &immutable.skinned_geos[geo_id as usize],
                    &skin_deform_streams[geo_id as usize],
                )
            },
            &|geo_id| immutable.skinned_geos[geo_id as usize].draw_calls.clone(),
        );

        // one dynamic VB covers every geo's post-deform region; it is not
        // created at all when the chain produces no outputs
        let dynamic_vertex_buffer = if post_deform_cursor != 0 {
            let buffer = device.create_dynamic_vertex_buffer(post_deform_cursor as u64);
            for geo in geos.iter_mut().chain(skinned_geos.iter_mut()) {
                let geo = Arc::get_mut(geo).expect("no other references during construction");
                for stream in &mut geo.vertex_streams {
                    if stream.resource.is_none() {
                        stream.resource = Some(buffer.clone() as Arc<dyn GpuBuffer>);
                    }
                }
            }
            Some(buffer)
        } else {
            None
        };

        let deform_static_data =
            generate_deform_static_input(&model_scaffold, &static_load_requests, static_cursor)?;
        let deform_temporary = vec![0u8; temporary_cursor as usize];

        Ok(Self {
            model_scaffold,
            material_scaffold,
            skeleton_binding,
            base_transforms,
            geos,
            skinned_geos,
            geo_call_groups,
            skin_call_groups,
            deform_ops,
            deform_static_data,
            deform_temporary,
            dynamic_vertex_buffer,
            uniform_buffer_bindings,
        })
    }

    pub fn model_scaffold(&self) -> &Arc<ModelScaffold> {
        &self.model_scaffold
    }

    pub fn deform_operation_count(&self) -> usize {
        self.deform_ops.len()
    }

    pub fn deform_operation(&self, index: usize) -> &dyn DeformOperation {
        self.deform_ops[index].operation.as_ref()
    }

    pub fn dynamic_vertex_buffer(&self) -> Option<&Arc<dyn DynamicGpuBuffer>> {
        self.dynamic_vertex_buffer.as_ref()
    }

    /// Forward the latest skeleton machine output to every skin deformer in
    /// the chain.
    pub fn feed_in_skeleton_machine_results(
        &self,
        skeleton_machine_output: &[Mat4],
        output_interface: &marrow_anim::OutputInterface,
    ) {
        for op in &self.deform_ops {
            if let Some(skin) = op.operation.as_any().downcast_ref::<SkinDeformer>() {
                skin.feed_in_skeleton_machine_results(skeleton_machine_output, output_interface);
            }
        }
    }

    /// Run the deform chain into the dynamic vertex buffer.
    ///
    /// Maps with discard semantics; only the regions the plan assigned are
    /// written, and the GPU only reads those regions.
    pub fn generate_deform_buffer(&mut self) {
        profiling::scope!("SimpleModelRenderer::generate_deform_buffer");

        let dynamic_vb = match &self.dynamic_vertex_buffer {
            Some(buffer) => buffer.clone(),
            None => return,
        };

        let static_data = &self.deform_static_data;
        let temporary = &mut self.deform_temporary;
        let deform_ops = &self.deform_ops;

        dynamic_vb.map_discard(&mut |destination: &mut [u8]| {
            let static_ptr = static_data.as_ptr();
            let static_len = static_data.len();
            let temporary_ptr = temporary.as_mut_ptr();
            let temporary_len = temporary.len();
            let destination_ptr = destination.as_mut_ptr();
            let destination_len = destination.len();

            // Lanes are resolved through raw pointers: input and output
            // lanes may interleave within the same buffer, but the planner
            // assigns every lane a distinct byte track, so reads and writes
            // never touch the same bytes within one execute.
            let resolve_input = |element: &PlannedElement| {
                let (base, len) = match element.buffer {
                    DeformBufferId::StaticData => (static_ptr, static_len),
                    DeformBufferId::Temporary => (temporary_ptr as *const u8, temporary_len),
                    DeformBufferId::PostDeform => (destination_ptr as *const u8, destination_len),
                };
                debug_assert!((element.offset as usize) <= len);
                // SAFETY: offset bound checked; the lane is disjoint from
                // every output lane by plan construction.
                unsafe {
                    VertexElementRange::from_raw_parts(
                        base.add(element.offset as usize),
                        len - element.offset as usize,
                        element.stride as usize,
                        element.format,
                    )
                }
            };
            let resolve_output = |element: &PlannedElement| {
                let (base, len) = match element.buffer {
                    DeformBufferId::Temporary => (temporary_ptr, temporary_len),
                    DeformBufferId::PostDeform => (destination_ptr, destination_len),
                    DeformBufferId::StaticData => unreachable!("static data is never written"),
                };
                debug_assert!((element.offset as usize) <= len);
                // SAFETY: as above; output lanes are mutually disjoint.
                unsafe {
                    VertexElementRangeMut::from_raw_parts(
                        base.add(element.offset as usize),
                        len - element.offset as usize,
                        element.stride as usize,
                        element.format,
                    )
                }
            };

            for op in deform_ops {
                let inputs: Vec<VertexElementRange<'_>> =
                    op.input_elements.iter().map(&resolve_input).collect();
                let mut outputs: Vec<VertexElementRangeMut<'_>> =
                    op.output_elements.iter().map(&resolve_output).collect();
                op.operation.execute(&inputs, &mut outputs);
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_group(
        &self,
        packet: &mut DrawablesPacket,
        group: &GeoCallGroup,
        geo: &Arc<DrawableGeo>,
        draw_calls: &[DrawCall],
        geo_space_to_node_space: Mat4,
        local_to_world: Mat4,
        draw_call_counter: &mut u32,
        delegate: Option<&dyn PreDrawDelegate>,
    ) {
        let machine_output = self
            .skeleton_binding
            .model_joint_to_machine_output(group.transform_marker);
        let base_transform = self
            .base_transforms
            .get(machine_output as usize)
            .copied()
            .unwrap_or(Mat4::IDENTITY);
        let object_to_world = local_to_world * base_transform * geo_space_to_node_space;

        for draw_call in draw_calls {
            let material_slot = draw_call.sub_material_index as usize;
            let geo_call = match group.calls.get(material_slot) {
                Some(call) => call,
                None => continue,
            };

            let drawable = Drawable {
                geo: geo.clone(),
                pipeline_accelerator: geo_call.pipeline_accelerator,
                descriptor_set: geo_call.descriptor_set,
                draw_call: *draw_call,
                object_to_world,
                material_guid: group
                    .material_guids
                    .get(material_slot)
                    .copied()
                    .unwrap_or(0),
                draw_call_index: *draw_call_counter,
                uniform_buffer_bindings: self.uniform_buffer_bindings.clone(),
            };
            *draw_call_counter += 1;

            if let Some(delegate) = delegate {
                if !delegate.on_draw(&drawable) {
                    continue;
                }
            }
            packet.drawables.push(drawable);
        }
    }

    /// Emit one drawable per draw call into the general batch packet.
    pub fn build_drawables(
        &self,
        packet: &mut DrawablesPacket,
        local_to_world: Mat4,
        delegate: Option<&dyn PreDrawDelegate>,
    ) {
        profiling::scope!("SimpleModelRenderer::build_drawables");

        let immutable = self.model_scaffold.immutable_data();
        let mut draw_call_counter = 0u32;

        for group in &self.geo_call_groups {
            let record = &immutable.geos[group.geo_id as usize];
            self.emit_group(
                packet,
                group,
                &self.geos[group.geo_id as usize],
                &record.draw_calls,
                record.geo_space_to_node_space,
                local_to_world,
                &mut draw_call_counter,
                delegate,
            );
        }

        for group in &self.skin_call_groups {
            let record = &immutable.skinned_geos[group.geo_id as usize];
            self.emit_group(
                packet,
                group,
                &self.skinned_geos[group.geo_id as usize],
                &record.draw_calls,
                record.geo_space_to_node_space,
                local_to_world,
                &mut draw_call_counter,
                delegate,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deform::DeformOperationFactory;
    use crate::test_util::{temp_scaffold_path, MockDevice};
    use glam::Vec3;
    use marrow_anim::{SkeletonMachine, SkeletonMachineBuilder};
    use marrow_geoproc::mesh::{NativeVbSettings, RawVertexSource};
    use marrow_geoproc::nascent::{ModelScaffoldBuilder, NascentRawGeometry};
    use marrow_geoproc::skin::{bind_controller, build_unbound_controller, RawSkinController};
    use marrow_geoproc::unify::{
        unify_mesh, AttributeInput, PrimitiveData, SemanticRemapConfig, SourceMesh,
        SourcePrimitive,
    };
    use marrow_types::{hash_str, semantics};

    fn triangle_geo(positions: &[Vec3]) -> NascentRawGeometry {
        let source = RawVertexSource::from_vec3s(positions);
        let mesh = SourceMesh {
            name: "fixture".to_string(),
            primitives: vec![SourcePrimitive {
                inputs: vec![AttributeInput {
                    source_id: 1,
                    semantic_name: semantics::POSITION.to_string(),
                    semantic_index: 0,
                    source,
                    index_in_primitive: 0,
                }],
                data: PrimitiveData::Triangles {
                    primitive_count: 1,
                    indices: vec![0, 1, 2],
                },
                material_binding: "mat".to_string(),
                location: "fixture:0".to_string(),
            }],
        };
        let unified = unify_mesh(&mesh, &SemanticRemapConfig::default())
            .unwrap()
            .unwrap();
        NascentRawGeometry::from_unified_default_layout(&unified, &NativeVbSettings::default())
            .unwrap()
    }

    fn two_joint_machine() -> SkeletonMachine {
        let mut builder = SkeletonMachineBuilder::new();
        builder.push();
        builder.write_output(hash_str("a"));
        builder.push();
        builder.write_output(hash_str("b"));
        builder.pop(1);
        builder.pop(1);
        builder.build()
    }

    /// One skinned triangle: every vertex bound to one joint at full
    /// weight, joints "a" and "b" both evaluating to identity.
    fn skinned_scaffold() -> Arc<ModelScaffold> {
        let geo = triangle_geo(&[
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(0.0, 0.0, 3.0),
        ]);
        let controller = RawSkinController {
            bind_shape_matrix: glam::Mat4::IDENTITY,
            inverse_bind_matrices: vec![glam::Mat4::IDENTITY; 2],
            joint_names: vec!["a".to_string(), "b".to_string()],
            influences: vec![vec![(0, 1.0)], vec![(0, 1.0)], vec![(1, 1.0)]],
            location: "fixture-controller".to_string(),
        };
        let unbound = build_unbound_controller(&controller).unwrap();
        let bound = bind_controller(&geo, unbound, &[0, 1], "fixture-node").unwrap();

        let mut builder = ModelScaffoldBuilder::new();
        let joint_a = builder.add_input_joint(hash_str("a"));
        builder.add_input_joint(hash_str("b"));
        let geo_id = builder.add_skinned_geo(bound);
        builder.add_skin_call(geo_id, vec![77], joint_a);
        builder.set_skeleton_payload(bincode::serialize(&two_joint_machine()).unwrap());

        let path = temp_scaffold_path("skinned");
        let mut file = std::fs::File::create(&path).unwrap();
        builder.serialize(&mut file).unwrap();
        drop(file);

        Arc::new(ModelScaffold::load(path).unwrap())
    }

    fn renderer_with_skin(
        device: &Arc<MockDevice>,
        scaffold: &Arc<ModelScaffold>,
    ) -> SimpleModelRenderer {
        let pool = PipelineAcceleratorPool::new(device.clone());
        let deform_ops = DeformOperationFactory::global()
            .create_deform_operations("skin", scaffold)
            .unwrap();
        SimpleModelRenderer::new(
            &pool,
            scaffold.clone(),
            Arc::new(MaterialScaffold::empty()),
            deform_ops,
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn skin_deform_identity_frame_reproduces_input_positions() {
        let device = MockDevice::new();
        let scaffold = skinned_scaffold();
        let mut renderer = renderer_with_skin(&device, &scaffold);

        let machine = scaffold.embedded_skeleton();
        let mut machine_output = vec![glam::Mat4::IDENTITY; 2];
        machine
            .generate_output_transforms(machine.default_parameters(), &mut machine_output)
            .unwrap();
        renderer.feed_in_skeleton_machine_results(&machine_output, machine.output_interface());
        renderer.generate_deform_buffer();

        // expected positions: the animated VB after bucket reordering
        let skinned = &scaffold.immutable_data().skinned_geos[0];
        let mut large_blocks = scaffold.open_large_blocks().unwrap();
        let animated = large_blocks
            .read(
                skinned.animated_vertex_elements.offset,
                skinned.animated_vertex_elements.size,
            )
            .unwrap();

        let dynamic_buffers = device.dynamic_buffers.lock();
        let contents = dynamic_buffers[0].contents.lock();
        assert_eq!(*contents, animated);
    }

    #[test]
    fn zero_influence_vertices_pass_through_unchanged() {
        // v0 and v1 skinned to joint "a"; v2 carries no influences at all
        let geo = triangle_geo(&[
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 2.0, 0.0),
            Vec3::new(0.0, 0.0, 3.0),
        ]);
        let controller = RawSkinController {
            bind_shape_matrix: glam::Mat4::IDENTITY,
            inverse_bind_matrices: vec![glam::Mat4::IDENTITY; 2],
            joint_names: vec!["a".to_string(), "b".to_string()],
            influences: vec![vec![(0, 1.0)], vec![(0, 1.0)], Vec::new()],
            location: "zero-influence".to_string(),
        };
        let unbound = build_unbound_controller(&controller).unwrap();
        let bound = bind_controller(&geo, unbound, &[0, 1], "zero-influence-node").unwrap();

        let mut builder = ModelScaffoldBuilder::new();
        let joint_a = builder.add_input_joint(hash_str("a"));
        let geo_id = builder.add_skinned_geo(bound);
        builder.add_skin_call(geo_id, vec![1], joint_a);
        builder.set_skeleton_payload(bincode::serialize(&two_joint_machine()).unwrap());
        let path = temp_scaffold_path("zero-influence");
        let mut file = std::fs::File::create(&path).unwrap();
        builder.serialize(&mut file).unwrap();
        drop(file);
        let scaffold = Arc::new(ModelScaffold::load(path).unwrap());

        let device = MockDevice::new();
        let mut renderer = renderer_with_skin(&device, &scaffold);
        let machine = scaffold.embedded_skeleton();
        let mut machine_output = vec![glam::Mat4::IDENTITY; 2];
        machine
            .generate_output_transforms(machine.default_parameters(), &mut machine_output)
            .unwrap();
        renderer.feed_in_skeleton_machine_results(&machine_output, machine.output_interface());
        renderer.generate_deform_buffer();

        let skinned = &scaffold.immutable_data().skinned_geos[0];
        // the zero-influence bucket's draw call is last and copies through
        let copy_call = skinned.preskinning_sections[0]
            .preskinning_draw_calls
            .last()
            .unwrap();
        assert_eq!(copy_call.sub_material_index, 0);
        assert_eq!(copy_call.index_count, 1);

        let mut large_blocks = scaffold.open_large_blocks().unwrap();
        let animated = large_blocks
            .read(
                skinned.animated_vertex_elements.offset,
                skinned.animated_vertex_elements.size,
            )
            .unwrap();
        let dynamic_buffers = device.dynamic_buffers.lock();
        let contents = dynamic_buffers[0].contents.lock();
        // all vertices reproduced, including the copied-through one
        assert_eq!(*contents, animated);
    }

    #[test]
    fn deform_buffer_is_skipped_without_outputs() {
        let device = MockDevice::new();
        let scaffold = skinned_scaffold();
        let pool = PipelineAcceleratorPool::new(device.clone());
        let mut renderer = SimpleModelRenderer::new(
            &pool,
            scaffold.clone(),
            Arc::new(MaterialScaffold::empty()),
            Vec::new(),
            Vec::new(),
        )
        .unwrap();

        assert!(renderer.dynamic_vertex_buffer().is_none());
        renderer.generate_deform_buffer();
        assert_eq!(device.counters.lock().dynamic_vertex_buffers, 0);
    }

    #[test]
    fn suppressed_elements_drop_out_of_the_input_layout() {
        let device = MockDevice::new();
        let scaffold = skinned_scaffold();
        let _renderer = renderer_with_skin(&device, &scaffold);

        let descs = device.pipeline_descs.lock();
        assert_eq!(descs.len(), 1);
        let layout = &descs[0].input_layout;

        // the source POSITION / WEIGHTS / JOINTINDICES bindings are
        // suppressed; the deform stream re-introduces POSITION
        for stream in &layout[..layout.len() - 1] {
            for element in &stream.elements {
                assert_ne!(element.semantic_name, semantics::POSITION);
                assert_ne!(element.semantic_name, semantics::WEIGHTS);
                assert_ne!(element.semantic_name, semantics::JOINT_INDICES);
            }
        }
        let deform_stream = layout.last().unwrap();
        assert_eq!(deform_stream.elements.len(), 1);
        assert_eq!(deform_stream.elements[0].semantic_name, semantics::POSITION);
    }

    #[test]
    fn build_drawables_emits_one_drawable_per_draw_call() {
        let device = MockDevice::new();
        let scaffold = skinned_scaffold();
        let renderer = renderer_with_skin(&device, &scaffold);

        let mut packet = DrawablesPacket::default();
        renderer.build_drawables(&mut packet, Mat4::IDENTITY, None);

        assert_eq!(packet.drawables.len(), 1);
        let drawable = &packet.drawables[0];
        assert_eq!(drawable.material_guid, 77);
        assert_eq!(drawable.draw_call_index, 0);
        assert_eq!(drawable.draw_call.index_count, 3);
    }

    #[test]
    fn pre_draw_delegate_can_suppress_draws() {
        struct RejectAll;
        impl PreDrawDelegate for RejectAll {
            fn on_draw(&self, _drawable: &Drawable) -> bool {
                false
            }
        }

        let device = MockDevice::new();
        let scaffold = skinned_scaffold();
        let renderer = renderer_with_skin(&device, &scaffold);

        let mut packet = DrawablesPacket::default();
        renderer.build_drawables(&mut packet, Mat4::IDENTITY, Some(&RejectAll));
        assert!(packet.drawables.is_empty());
    }

    #[test]
    fn local_to_world_flows_into_object_to_world() {
        let device = MockDevice::new();
        let scaffold = skinned_scaffold();
        let renderer = renderer_with_skin(&device, &scaffold);

        let local_to_world = Mat4::from_translation(Vec3::new(0.0, 0.0, 4.0));
        let mut packet = DrawablesPacket::default();
        renderer.build_drawables(&mut packet, local_to_world, None);

        let origin = packet.drawables[0]
            .object_to_world
            .transform_point3(Vec3::ZERO);
        assert_eq!(origin, Vec3::new(0.0, 0.0, 4.0));
    }
}
