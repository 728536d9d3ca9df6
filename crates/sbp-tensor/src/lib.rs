//! `sbp-tensor` - Tensor descriptor model for SBP placement inference.
//!
//! This crate provides:
//! - `ParallelGroup`, the ordered set of devices a tensor is distributed over
//! - `Distribute`, the Split / Broadcast / PartialSum policy of a tensor
//! - Logical descriptors and their per-device physical shards, owned by a
//!   `TensorArena`
//! - Shape, dtype and balanced-split utilities

pub mod descriptor;
pub mod distribute;
pub mod dtype;
pub mod error;
pub mod parallel;
pub mod shape;
pub mod split;

// Re-export primary types at the crate root for convenience.
pub use descriptor::{
    EvalMode, GroupId, LogicalId, LogicalTensorDesc, PhysicalTensorDesc, PlacementKind,
    TensorArena, TensorMeta,
};
pub use distribute::Distribute;
pub use dtype::DType;
pub use error::{Result, TensorError};
pub use parallel::{DeviceId, DeviceKind, ParallelConf, ParallelGroup};
pub use shape::Shape;
pub use split::BalancedSplitter;
