//! Skeleton evaluation and animation sampling for the marrow rendering
//! core.
//!
//! A model's pose flows through three stages: an [`AnimationSet`] samples
//! curves and constants into a [`ParameterSet`], a [`SkeletonMachine`]
//! executes its command stream against those parameters to produce
//! world-space joint matrices, and the runtime's skin deformer consumes the
//! matrices through a [`SkeletonBinding`]. The stages are connected purely
//! by hashed-name interfaces, so animation sets, skeletons and skins can be
//! authored and loaded independently.

mod animation;
mod curve;
mod skeleton;

pub use animation::*;
pub use curve::*;
pub use skeleton::*;
