//! `sbp-graph` - Op registry, shape inference and SBP placement for logical
//! graphs.
//!
//! This crate provides:
//! - `OpRegistry`, op registrations with shape, SBP and gradient callbacks
//! - `Graph`, which infers, places and commits each op as it is added
//! - SBP signature candidates, feasibility, verification and selection
//! - On-demand gradient synthesis through `BackwardContext`
//! - Built-in ops: reflection padding, relu, matmul and reductions

pub mod attr;
pub mod config;
pub mod error;
pub mod grad;
pub mod graph;
pub mod infer;
pub mod ops;
pub mod registry;
pub mod sbp;

pub use attr::{AttrKind, AttrMap, AttrValue};
pub use config::JobConfig;
pub use error::{GraphError, Result};
pub use grad::BackwardContext;
pub use graph::{Graph, InputSpec, Job, OpConf, OpConfBuilder, OpId, OpNode};
pub use infer::{infer_op, InferContext};
pub use registry::{
    ArgDef, ArgRef, AxisFilter, GradFn, InferFn, OpRegistration, OpRegistrationBuilder,
    OpRegistry, SbpFn, SbpRule,
};
pub use sbp::{
    candidate_signatures, check_feasible, select_signature, verify_recombination, SbpContext,
    SbpSignature, SignatureBuilder, SignatureRequest,
};
