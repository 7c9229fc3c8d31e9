//! Chunked binary container used by scaffold files.
//!
//! A scaffold file is a flat directory of chunks, each identified by a pair
//! of FourCC tags and a version number. Structured chunks hold a serialised
//! record that is fully deserialised at load; the large-blocks chunk holds
//! raw vertex/index bytes and is re-read on demand through a seekable
//! handle.

use std::io::{self, Read, Seek, SeekFrom, Write};

use thiserror::Error;

/// Combine a pair of FourCC tags into a chunk type id.
pub const fn chunk_type(a: &[u8; 4], b: &[u8; 4]) -> u64 {
    (u32::from_le_bytes(*a) as u64) | ((u32::from_le_bytes(*b) as u64) << 32)
}

pub const CHUNK_TYPE_MODEL: u64 = chunk_type(b"Mode", b"l\0\0\0");
pub const CHUNK_TYPE_SKELETON: u64 = chunk_type(b"Skel", b"eton");
pub const CHUNK_TYPE_ANIMATION_SET: u64 = chunk_type(b"Anim", b"Set\0");
pub const CHUNK_TYPE_MATERIAL: u64 = chunk_type(b"ResM", b"at\0\0");
pub const CHUNK_TYPE_LARGE_BLOCKS: u64 = chunk_type(b"Larg", b"Blks");

// Current payload versions. Readers reject anything else.
pub const MODEL_CHUNK_VERSION: u32 = 1;
pub const SKELETON_CHUNK_VERSION: u32 = 1;
pub const ANIMATION_SET_CHUNK_VERSION: u32 = 1;
pub const MATERIAL_CHUNK_VERSION: u32 = 1;
pub const LARGE_BLOCKS_CHUNK_VERSION: u32 = 0;

const FILE_MAGIC: u64 = chunk_type(b"Marw", b"Scfd");

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("io error reading chunk file")]
    Io(#[from] io::Error),
    #[error("not a scaffold chunk file (bad magic {0:#x})")]
    BadMagic(u64),
    #[error("chunk {0:#x} not present in file")]
    MissingChunk(u64),
    #[error("chunk {chunk:#x} has version {found}, expected {expected}")]
    VersionMismatch { chunk: u64, found: u32, expected: u32 },
    #[error("chunk {0:#x} payload is malformed")]
    Malformed(u64),
}

#[derive(Debug, Copy, Clone)]
pub struct ChunkDirectoryEntry {
    pub type_code: u64,
    pub version: u32,
    pub offset: u64,
    pub size: u64,
}

/// Accumulates chunks and writes the container in one pass.
#[derive(Default)]
pub struct ChunkFileWriter {
    chunks: Vec<(u64, u32, Vec<u8>)>,
}

impl ChunkFileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&mut self, type_code: u64, version: u32, payload: Vec<u8>) {
        self.chunks.push((type_code, version, payload));
    }

    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&FILE_MAGIC.to_le_bytes())?;
        out.write_all(&(self.chunks.len() as u32).to_le_bytes())?;

        // directory entry: type (8) + version (4) + offset (8) + size (8)
        let directory_size = 12 + self.chunks.len() as u64 * 28;
        let mut offset = directory_size;
        for (type_code, version, payload) in &self.chunks {
            out.write_all(&type_code.to_le_bytes())?;
            out.write_all(&version.to_le_bytes())?;
            out.write_all(&offset.to_le_bytes())?;
            out.write_all(&(payload.len() as u64).to_le_bytes())?;
            offset += payload.len() as u64;
        }
        for (_, _, payload) in &self.chunks {
            out.write_all(payload)?;
        }
        Ok(())
    }
}

/// Parses the directory of a chunk container and serves chunk payloads.
pub struct ChunkFileReader<S> {
    stream: S,
    directory: Vec<ChunkDirectoryEntry>,
}

impl<S: Read + Seek> ChunkFileReader<S> {
    pub fn new(mut stream: S) -> Result<Self, ChunkError> {
        stream.seek(SeekFrom::Start(0))?;
        let magic = read_u64(&mut stream)?;
        if magic != FILE_MAGIC {
            return Err(ChunkError::BadMagic(magic));
        }
        let count = read_u32(&mut stream)?;
        let mut directory = Vec::with_capacity(count as usize);
        for _ in 0..count {
            directory.push(ChunkDirectoryEntry {
                type_code: read_u64(&mut stream)?,
                version: read_u32(&mut stream)?,
                offset: read_u64(&mut stream)?,
                size: read_u64(&mut stream)?,
            });
        }
        Ok(Self { stream, directory })
    }

    pub fn directory(&self) -> &[ChunkDirectoryEntry] {
        &self.directory
    }

    pub fn find_chunk(
        &self,
        type_code: u64,
        expected_version: u32,
    ) -> Result<ChunkDirectoryEntry, ChunkError> {
        let entry = self
            .directory
            .iter()
            .find(|e| e.type_code == type_code)
            .copied()
            .ok_or(ChunkError::MissingChunk(type_code))?;
        if entry.version != expected_version {
            return Err(ChunkError::VersionMismatch {
                chunk: type_code,
                found: entry.version,
                expected: expected_version,
            });
        }
        Ok(entry)
    }

    /// Read a structured chunk fully into memory.
    pub fn chunk_payload(
        &mut self,
        type_code: u64,
        expected_version: u32,
    ) -> Result<Vec<u8>, ChunkError> {
        let entry = self.find_chunk(type_code, expected_version)?;
        let mut payload = vec![0u8; entry.size as usize];
        self.stream.seek(SeekFrom::Start(entry.offset))?;
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }
}

fn read_u32(stream: &mut impl Read) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    stream.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(stream: &mut impl Read) -> io::Result<u64> {
    let mut bytes = [0u8; 8];
    stream.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_two_chunks() {
        let mut writer = ChunkFileWriter::new();
        writer.add_chunk(CHUNK_TYPE_MODEL, 3, vec![1, 2, 3, 4]);
        writer.add_chunk(CHUNK_TYPE_LARGE_BLOCKS, 0, vec![9; 16]);

        let mut bytes = Vec::new();
        writer.write_to(&mut bytes).unwrap();

        let mut reader = ChunkFileReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.chunk_payload(CHUNK_TYPE_MODEL, 3).unwrap(), vec![1, 2, 3, 4]);
        let blocks = reader.find_chunk(CHUNK_TYPE_LARGE_BLOCKS, 0).unwrap();
        assert_eq!(blocks.size, 16);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut writer = ChunkFileWriter::new();
        writer.add_chunk(CHUNK_TYPE_SKELETON, 1, vec![0]);
        let mut bytes = Vec::new();
        writer.write_to(&mut bytes).unwrap();

        let mut reader = ChunkFileReader::new(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.chunk_payload(CHUNK_TYPE_SKELETON, 2),
            Err(ChunkError::VersionMismatch { found: 1, expected: 2, .. })
        ));
        assert!(matches!(
            reader.chunk_payload(CHUNK_TYPE_MODEL, 0),
            Err(ChunkError::MissingChunk(_))
        ));
    }
}
