//! Runtime scaffold loading.
//!
//! A scaffold is the compiled, ready-to-load representation of a model,
//! material, skeleton or animation set. It is a lightweight object: the
//! structured chunks are deserialised fully at load, while bulk vertex and
//! index data stays on disk in the large-blocks region and is re-read
//! through a fresh handle per request.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use glam::Vec3;
use marrow_anim::{AnimationSet, SkeletonMachine};
use marrow_types::{
    ChunkError, ChunkFileReader, MaterialImmutableRecord, ModelCommandStream,
    ModelImmutableRecord, ANIMATION_SET_CHUNK_VERSION, CHUNK_TYPE_ANIMATION_SET,
    CHUNK_TYPE_LARGE_BLOCKS, CHUNK_TYPE_MATERIAL, CHUNK_TYPE_MODEL, CHUNK_TYPE_SKELETON,
    LARGE_BLOCKS_CHUNK_VERSION, MATERIAL_CHUNK_VERSION, MODEL_CHUNK_VERSION,
    SKELETON_CHUNK_VERSION,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScaffoldLoadError {
    #[error("io error loading scaffold {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed scaffold {path:?}")]
    Chunk {
        path: PathBuf,
        #[source]
        source: ChunkError,
    },
    #[error("failed to decode scaffold payload in {path:?}")]
    Decode {
        path: PathBuf,
        source: bincode::Error,
    },
}

fn open_reader(path: &Path) -> Result<ChunkFileReader<BufReader<File>>, ScaffoldLoadError> {
    let file = File::open(path).map_err(|source| ScaffoldLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ChunkFileReader::new(BufReader::new(file)).map_err(|source| ScaffoldLoadError::Chunk {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_chunk<T: serde::de::DeserializeOwned>(
    reader: &mut ChunkFileReader<BufReader<File>>,
    path: &Path,
    type_code: u64,
    version: u32,
) -> Result<T, ScaffoldLoadError> {
    let payload =
        reader
            .chunk_payload(type_code, version)
            .map_err(|source| ScaffoldLoadError::Chunk {
                path: path.to_path_buf(),
                source,
            })?;
    bincode::deserialize(&payload).map_err(|source| ScaffoldLoadError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// A fresh seekable handle onto a scaffold's large-blocks region. Offsets
/// are relative to the region's start.
pub struct LargeBlocks {
    file: BufReader<File>,
    base: u64,
    size: u64,
}

impl LargeBlocks {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read(&mut self, offset: u64, size: u64) -> io::Result<Vec<u8>> {
        debug_assert!(offset + size <= self.size);
        self.file.seek(SeekFrom::Start(self.base + offset))?;
        let mut buffer = vec![0u8; size as usize];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

/// Structural data describing a model, without the bulk buffers and without
/// any GPU resources. Immutable after load; any number of renderers may
/// share one scaffold.
pub struct ModelScaffold {
    path: PathBuf,
    immutable: ModelImmutableRecord,
    embedded_skeleton: SkeletonMachine,
    large_blocks_offset: u64,
    large_blocks_size: u64,
}

impl ModelScaffold {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScaffoldLoadError> {
        let path = path.as_ref();
        let mut reader = open_reader(path)?;

        let immutable: ModelImmutableRecord =
            decode_chunk(&mut reader, path, CHUNK_TYPE_MODEL, MODEL_CHUNK_VERSION)?;

        // the skeleton chunk is optional; a model without one evaluates to
        // its stored default transforms
        let embedded_skeleton = match reader.find_chunk(CHUNK_TYPE_SKELETON, SKELETON_CHUNK_VERSION)
        {
            Ok(_) => decode_chunk(&mut reader, path, CHUNK_TYPE_SKELETON, SKELETON_CHUNK_VERSION)?,
            Err(ChunkError::MissingChunk(_)) => SkeletonMachine::default(),
            Err(source) => {
                return Err(ScaffoldLoadError::Chunk {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let large_blocks = reader
            .find_chunk(CHUNK_TYPE_LARGE_BLOCKS, LARGE_BLOCKS_CHUNK_VERSION)
            .map_err(|source| ScaffoldLoadError::Chunk {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            immutable,
            embedded_skeleton,
            large_blocks_offset: large_blocks.offset,
            large_blocks_size: large_blocks.size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn immutable_data(&self) -> &ModelImmutableRecord {
        &self.immutable
    }

    pub fn command_stream(&self) -> &ModelCommandStream {
        &self.immutable.command_stream
    }

    pub fn embedded_skeleton(&self) -> &SkeletonMachine {
        &self.embedded_skeleton
    }

    pub fn static_bounding_box(&self) -> (Vec3, Vec3) {
        self.immutable.bounding_box
    }

    pub fn max_lod(&self) -> u32 {
        self.immutable.max_lod
    }

    /// Open a fresh handle onto the large-blocks region. Each call opens
    /// its own file descriptor; handles share no mutable state.
    pub fn open_large_blocks(&self) -> Result<LargeBlocks, ScaffoldLoadError> {
        let file = File::open(&self.path).map_err(|source| ScaffoldLoadError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(LargeBlocks {
            file: BufReader::new(file),
            base: self.large_blocks_offset,
            size: self.large_blocks_size,
        })
    }
}

/// Material definitions for a model, keyed by material guid.
pub struct MaterialScaffold {
    immutable: MaterialImmutableRecord,
}

impl MaterialScaffold {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScaffoldLoadError> {
        let path = path.as_ref();
        let mut reader = open_reader(path)?;
        let immutable =
            decode_chunk(&mut reader, path, CHUNK_TYPE_MATERIAL, MATERIAL_CHUNK_VERSION)?;
        Ok(Self { immutable })
    }

    /// An empty material set; every lookup falls back to defaults.
    pub fn empty() -> Self {
        Self {
            immutable: MaterialImmutableRecord::default(),
        }
    }

    pub fn immutable_data(&self) -> &MaterialImmutableRecord {
        &self.immutable
    }
}

/// A stand-alone skeleton, loaded separately from any model.
pub struct SkeletonScaffold {
    machine: SkeletonMachine,
}

impl SkeletonScaffold {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScaffoldLoadError> {
        let path = path.as_ref();
        let mut reader = open_reader(path)?;
        let machine =
            decode_chunk(&mut reader, path, CHUNK_TYPE_SKELETON, SKELETON_CHUNK_VERSION)?;
        Ok(Self { machine })
    }

    pub fn machine(&self) -> &SkeletonMachine {
        &self.machine
    }
}

/// A set of animations applicable to skeletons via name binding.
pub struct AnimationSetScaffold {
    set: AnimationSet,
}

impl AnimationSetScaffold {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScaffoldLoadError> {
        let path = path.as_ref();
        let mut reader = open_reader(path)?;
        let set = decode_chunk(
            &mut reader,
            path,
            CHUNK_TYPE_ANIMATION_SET,
            ANIMATION_SET_CHUNK_VERSION,
        )?;
        Ok(Self { set })
    }

    pub fn animation_set(&self) -> &AnimationSet {
        &self.set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::temp_scaffold_path;
    use glam::Mat4;
    use marrow_geoproc::mesh::{NativeVbSettings, RawVertexSource};
    use marrow_geoproc::nascent::{ModelScaffoldBuilder, NascentRawGeometry};
    use marrow_geoproc::unify::{
        unify_mesh, AttributeInput, PrimitiveData, SemanticRemapConfig, SourceMesh,
        SourcePrimitive,
    };
    use marrow_types::semantics;

    fn triangle_nascent() -> NascentRawGeometry {
        let positions = RawVertexSource::from_vec3s(&[Vec3::ZERO, Vec3::X, Vec3::Y]);
        let mesh = SourceMesh {
            name: "tri".to_string(),
            primitives: vec![SourcePrimitive {
                inputs: vec![AttributeInput {
                    source_id: 1,
                    semantic_name: semantics::POSITION.to_string(),
                    semantic_index: 0,
                    source: positions,
                    index_in_primitive: 0,
                }],
                data: PrimitiveData::Triangles {
                    primitive_count: 1,
                    indices: vec![0, 1, 2],
                },
                material_binding: "mat".to_string(),
                location: "tri:0".to_string(),
            }],
        };
        let unified = unify_mesh(&mesh, &SemanticRemapConfig::default())
            .unwrap()
            .unwrap();
        let mut geo =
            NascentRawGeometry::from_unified_default_layout(&unified, &NativeVbSettings::default())
                .unwrap();
        geo.geo_space_to_node_space = Mat4::from_translation(Vec3::new(0.0, 7.0, 0.0));
        geo
    }

    #[test]
    fn raw_geometry_survives_the_scaffold_round_trip() {
        let nascent = triangle_nascent();

        let mut builder = ModelScaffoldBuilder::new();
        let geo_id = builder.add_geo(triangle_nascent());
        builder.add_geo_call(geo_id, vec![42], 0);

        let path = temp_scaffold_path("round-trip");
        let mut file = std::fs::File::create(&path).unwrap();
        builder.serialize(&mut file).unwrap();
        drop(file);

        let scaffold = ModelScaffold::load(&path).unwrap();
        let loaded = &scaffold.immutable_data().geos[0];

        assert_eq!(loaded.vb.ia, nascent.input_assembly);
        assert_eq!(loaded.ib.format, nascent.index_format);
        assert_eq!(loaded.draw_calls, nascent.draw_calls);
        assert_eq!(loaded.geo_space_to_node_space, nascent.geo_space_to_node_space);

        let mut large_blocks = scaffold.open_large_blocks().unwrap();
        let vb = large_blocks.read(loaded.vb.offset, loaded.vb.size).unwrap();
        let ib = large_blocks.read(loaded.ib.offset, loaded.ib.size).unwrap();
        assert_eq!(vb, nascent.vertices);
        assert_eq!(ib, nascent.indices);

        assert_eq!(scaffold.command_stream().geo_calls.len(), 1);
        assert_eq!(scaffold.command_stream().geo_calls[0].material_guids, vec![42]);
    }

    #[test]
    fn each_large_block_handle_is_independent() {
        let mut builder = ModelScaffoldBuilder::new();
        builder.add_geo(triangle_nascent());
        let path = temp_scaffold_path("handles");
        let mut file = std::fs::File::create(&path).unwrap();
        builder.serialize(&mut file).unwrap();
        drop(file);

        let scaffold = ModelScaffold::load(&path).unwrap();
        let geo = &scaffold.immutable_data().geos[0];
        let mut first = scaffold.open_large_blocks().unwrap();
        let mut second = scaffold.open_large_blocks().unwrap();
        // interleaved reads through separate handles see the same bytes
        let a = first.read(geo.vb.offset, geo.vb.size).unwrap();
        let b = second.read(geo.vb.offset, geo.vb.size).unwrap();
        let c = first.read(geo.ib.offset, geo.ib.size).unwrap();
        assert_eq!(a, b);
        assert_eq!(c.len() as u64, geo.ib.size);
    }

    #[test]
    fn missing_file_reports_io_error() {
        let result = ModelScaffold::load("/nonexistent/marrow-test.scaffold");
        assert!(matches!(result, Err(ScaffoldLoadError::Io { .. })));
    }

    #[test]
    fn animation_set_scaffold_round_trips() {
        use marrow_anim::{Animation, AnimationSet};
        use marrow_types::{hash_str, ChunkFileWriter};

        let set = AnimationSet {
            animations: vec![(
                hash_str("walk"),
                Animation {
                    begin_time: 0.5,
                    end_time: 2.0,
                    ..Animation::default()
                },
            )],
            ..AnimationSet::default()
        };

        let mut writer = ChunkFileWriter::new();
        writer.add_chunk(
            CHUNK_TYPE_ANIMATION_SET,
            ANIMATION_SET_CHUNK_VERSION,
            bincode::serialize(&set).unwrap(),
        );
        let path = temp_scaffold_path("animset");
        let mut file = std::fs::File::create(&path).unwrap();
        writer.write_to(&mut file).unwrap();
        drop(file);

        let scaffold = AnimationSetScaffold::load(&path).unwrap();
        let animation = scaffold
            .animation_set()
            .find_animation(hash_str("walk"))
            .unwrap();
        assert_eq!(animation.begin_time, 0.5);
        assert_eq!(animation.end_time, 2.0);
    }

    #[test]
    fn builder_bounding_box_reaches_the_scaffold() {
        let mut builder = ModelScaffoldBuilder::new();
        builder.add_geo(triangle_nascent());
        let path = temp_scaffold_path("bbox");
        let mut file = std::fs::File::create(&path).unwrap();
        builder.serialize(&mut file).unwrap();
        drop(file);

        let scaffold = ModelScaffold::load(&path).unwrap();
        let (min, max) = scaffold.static_bounding_box();
        // positions translated by the geo-space transform (+7 in y)
        assert_eq!(min, Vec3::new(0.0, 7.0, 0.0));
        assert_eq!(max, Vec3::new(1.0, 8.0, 0.0));
    }
}
