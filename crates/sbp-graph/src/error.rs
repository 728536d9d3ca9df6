use sbp_tensor::LogicalId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("shape mismatch in op '{op}': {detail}")]
    ShapeMismatch { op: String, detail: String },
    #[error("no feasible SBP signature for op '{op}' over {parallel_num} devices: {reason}")]
    SignatureInfeasible {
        op: String,
        parallel_num: usize,
        reason: String,
    },
    #[error("invalid SBP signature for op '{op}': {reason}")]
    InvalidSignature { op: String, reason: String },
    #[error("unknown op type: {0}")]
    UnknownOpType(String),
    #[error("op type '{0}' is already registered")]
    DuplicateOpType(String),
    #[error("invalid registration for op type '{op_type}': {reason}")]
    InvalidRegistration { op_type: String, reason: String },
    #[error("op name '{0}' already exists in the graph")]
    DuplicateOpName(String),
    #[error("unknown op id {0}")]
    UnknownOp(usize),
    #[error("op '{op}' has no argument '{arg}'")]
    UnknownArg { op: String, arg: String },
    #[error("invalid input '{arg}' of op '{op}': {reason}")]
    InvalidInput {
        op: String,
        arg: String,
        reason: String,
    },
    #[error("attribute '{attr}' of op '{op}': {reason}")]
    InvalidAttr {
        op: String,
        attr: String,
        reason: String,
    },
    #[error("op '{op}' has no placement: it has no inputs and none was given")]
    MissingPlacement { op: String },
    #[error("output '{arg}' of op '{op}' has no gradient bound")]
    MissingOutputGrad { op: String, arg: String },
    #[error("gradient function of op '{op}' did not bind a gradient for input '{arg}'")]
    GradientNotBound { op: String, arg: String },
    #[error("gradient {grad} does not match '{arg}' of op '{op}': {detail}")]
    GradientMismatch {
        op: String,
        arg: String,
        grad: LogicalId,
        detail: String,
    },
    #[error("tensor error: {0}")]
    Tensor(#[from] sbp_tensor::TensorError),
}

pub type Result<T> = std::result::Result<T, GraphError>;
