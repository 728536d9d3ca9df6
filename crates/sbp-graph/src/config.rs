use sbp_tensor::{DType, EvalMode};

/// Settings shared by every graph-construction step of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    /// Name of the job the graph belongs to.
    pub job_name: String,
    /// Element type of graph inputs that do not declare one.
    pub default_dtype: DType,
    /// Evaluation mode recorded on every descriptor.
    pub eval_mode: EvalMode,
    /// Suffix appended to a forward op's name to name its gradient ops.
    pub grad_op_suffix: String,
    /// Check every feasible candidate signature by re-combining per-device
    /// shape inference before selecting one.
    pub verify_signatures: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: "default_job".to_string(),
            default_dtype: DType::Float32,
            eval_mode: EvalMode::Lazy,
            grad_op_suffix: "_grad".to_string(),
            verify_signatures: true,
        }
    }
}

impl JobConfig {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Self::default()
        }
    }

    pub fn with_default_dtype(mut self, dtype: DType) -> Self {
        self.default_dtype = dtype;
        self
    }

    pub fn with_eval_mode(mut self, mode: EvalMode) -> Self {
        self.eval_mode = mode;
        self
    }

    pub fn with_grad_op_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.grad_op_suffix = suffix.into();
        self
    }

    pub fn with_verify_signatures(mut self, verify: bool) -> Self {
        self.verify_signatures = verify;
        self
    }
}
