use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("invalid axis {axis} for tensor with {ndim} dimensions")]
    InvalidAxis { axis: usize, ndim: usize },
    #[error("cannot split axis {axis} of extent {extent} across {parts} devices")]
    SplitTooSmall {
        axis: usize,
        extent: usize,
        parts: usize,
    },
    #[error("invalid parallel group: {0}")]
    InvalidParallelGroup(String),
    #[error("invalid parallel conf: {0}")]
    InvalidParallelConf(String),
    #[error("unknown dtype: {0}")]
    UnknownDType(String),
    #[error("tensor '{0}' has no resolved distribute policy")]
    Unresolved(String),
    #[error("unknown tensor id {0}")]
    UnknownTensor(usize),
}

pub type Result<T> = std::result::Result<T, TensorError>;
