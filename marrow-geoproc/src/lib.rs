//! Offline geometry processing for the marrow rendering core.
//!
//! Takes tokenised source meshes (attribute streams plus per-corner index
//! tuples) through unification, derived-attribute generation and skin
//! binding, and serialises the result as a chunked scaffold file for the
//! runtime in the `marrow` crate.
//!
//! The pipeline, leaves first:
//!
//! - [`mesh`]: attribute streams, vertex maps, format conversion
//! - [`unify`]: per-attribute indices -> unified vertices + index buffer
//! - [`algorithm`]: bounding boxes, normals/tangents, duplicate removal
//! - [`skin`]: influence bucketing and controller binding
//! - [`nascent`]: packed geometry and scaffold serialisation

pub mod algorithm;
pub mod mesh;
pub mod nascent;
pub mod skin;
pub mod unify;

use marrow_types::Format;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeoProcError {
    /// Malformed source data. Fatal for the owning mesh.
    #[error("{message} (at {location})")]
    Format { message: String, location: String },
    #[error("unsupported vertex data conversion {from:?} -> {to:?}")]
    UnsupportedConversion { from: Format, to: Format },
    #[error("failed to encode scaffold payload")]
    Serialize { source: bincode::Error },
    #[error("io error writing scaffold")]
    Io(#[from] std::io::Error),
}
