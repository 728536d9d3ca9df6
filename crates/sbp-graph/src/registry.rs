//! Operator registrations: declared arguments and attributes plus the shape
//! inference, SBP and gradient callbacks the graph drives.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use crate::attr::AttrKind;
use crate::error::{GraphError, Result};
use crate::grad::BackwardContext;
use crate::infer::InferContext;
use crate::sbp::SbpContext;

/// One tensor slot of an op: argument name plus position within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgRef {
    pub name: String,
    pub index: usize,
}

impl ArgRef {
    pub fn new(name: impl Into<String>, index: usize) -> Self {
        ArgRef {
            name: name.into(),
            index,
        }
    }
}

impl fmt::Display for ArgRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.index)
    }
}

/// A declared input or output argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDef {
    pub name: String,
    /// Number of tensors bound to the argument.
    pub arity: usize,
    /// Only meaningful for inputs.
    pub requires_grad: bool,
}

/// Shape/dtype inference callback.
pub type InferFn = fn(&mut InferContext<'_>) -> Result<()>;
/// Custom SBP candidate builder.
pub type SbpFn = fn(&mut SbpContext<'_>) -> Result<()>;
/// Per-axis eligibility for the default axis scan.
pub type AxisFilter = fn(&SbpContext<'_>, usize) -> Result<bool>;
/// Gradient synthesis callback.
pub type GradFn = fn(&mut BackwardContext<'_, '_>) -> Result<()>;

/// How an op's SBP candidates are produced.
#[derive(Clone)]
pub enum SbpRule {
    /// Split every input and output on each axis of `reference` that the
    /// filter accepts (all axes without a filter).
    AxisScan {
        reference: String,
        filter: Option<AxisFilter>,
    },
    /// The op builds its own candidates.
    Custom(SbpFn),
}

impl fmt::Debug for SbpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbpRule::AxisScan { reference, filter } => f
                .debug_struct("AxisScan")
                .field("reference", reference)
                .field("filtered", &filter.is_some())
                .finish(),
            SbpRule::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Everything the graph needs to know about an op type.
#[derive(Clone)]
pub struct OpRegistration {
    name: String,
    inputs: Vec<ArgDef>,
    outputs: Vec<ArgDef>,
    attrs: Vec<(String, AttrKind)>,
    infer: InferFn,
    sbp: SbpRule,
    grad: Option<GradFn>,
}

impl fmt::Debug for OpRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistration")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("attrs", &self.attrs)
            .field("sbp", &self.sbp)
            .field("has_grad", &self.grad.is_some())
            .finish()
    }
}

impl OpRegistration {
    pub fn builder(name: impl Into<String>) -> OpRegistrationBuilder {
        OpRegistrationBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[ArgDef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ArgDef] {
        &self.outputs
    }

    pub fn attrs(&self) -> &[(String, AttrKind)] {
        &self.attrs
    }

    pub fn input_def(&self, name: &str) -> Option<&ArgDef> {
        self.inputs.iter().find(|a| a.name == name)
    }

    pub fn output_def(&self, name: &str) -> Option<&ArgDef> {
        self.outputs.iter().find(|a| a.name == name)
    }

    pub fn attr_kind(&self, name: &str) -> Option<AttrKind> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, k)| *k)
    }

    pub fn infer_fn(&self) -> InferFn {
        self.infer
    }

    pub fn sbp_rule(&self) -> &SbpRule {
        &self.sbp
    }

    pub fn grad_fn(&self) -> Option<GradFn> {
        self.grad
    }

    /// Every input slot, in declaration order.
    pub fn input_args(&self) -> Vec<ArgRef> {
        expand_args(&self.inputs)
    }

    /// Every output slot, in declaration order.
    pub fn output_args(&self) -> Vec<ArgRef> {
        expand_args(&self.outputs)
    }
}

fn expand_args(defs: &[ArgDef]) -> Vec<ArgRef> {
    defs.iter()
        .flat_map(|d| (0..d.arity).map(move |i| ArgRef::new(d.name.clone(), i)))
        .collect()
}

/// Builder for [`OpRegistration`], validated by [`finish`](Self::finish).
pub struct OpRegistrationBuilder {
    name: String,
    inputs: Vec<ArgDef>,
    outputs: Vec<ArgDef>,
    attrs: Vec<(String, AttrKind)>,
    requires_grad: Vec<String>,
    infer: Option<InferFn>,
    sbp: Option<SbpRule>,
    grad: Option<GradFn>,
}

impl OpRegistrationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attrs: Vec::new(),
            requires_grad: Vec::new(),
            infer: None,
            sbp: None,
            grad: None,
        }
    }

    pub fn input(self, name: &str) -> Self {
        self.input_n(name, 1)
    }

    pub fn input_n(mut self, name: &str, arity: usize) -> Self {
        self.inputs.push(ArgDef {
            name: name.to_string(),
            arity,
            requires_grad: false,
        });
        self
    }

    pub fn output(self, name: &str) -> Self {
        self.output_n(name, 1)
    }

    pub fn output_n(mut self, name: &str, arity: usize) -> Self {
        self.outputs.push(ArgDef {
            name: name.to_string(),
            arity,
            requires_grad: false,
        });
        self
    }

    pub fn attr(mut self, name: &str, kind: AttrKind) -> Self {
        self.attrs.push((name.to_string(), kind));
        self
    }

    /// Mark an input as needing a gradient when backpropagation is requested.
    pub fn requires_grad(mut self, input: &str) -> Self {
        self.requires_grad.push(input.to_string());
        self
    }

    pub fn infer(mut self, f: InferFn) -> Self {
        self.infer = Some(f);
        self
    }

    /// Use the default axis scan over `reference`'s axes.
    pub fn axis_scan(mut self, reference: &str, filter: Option<AxisFilter>) -> Self {
        self.sbp = Some(SbpRule::AxisScan {
            reference: reference.to_string(),
            filter,
        });
        self
    }

    pub fn sbp(mut self, f: SbpFn) -> Self {
        self.sbp = Some(SbpRule::Custom(f));
        self
    }

    pub fn grad(mut self, f: GradFn) -> Self {
        self.grad = Some(f);
        self
    }

    pub fn finish(mut self) -> Result<OpRegistration> {
        let invalid = |reason: String| GraphError::InvalidRegistration {
            op_type: self.name.clone(),
            reason,
        };

        let infer = self
            .infer
            .ok_or_else(|| invalid("missing shape inference function".to_string()))?;

        let mut seen = HashSet::new();
        for def in self.inputs.iter().chain(self.outputs.iter()) {
            if !seen.insert(def.name.as_str()) {
                return Err(invalid(format!("argument '{}' declared twice", def.name)));
            }
            if def.arity == 0 {
                return Err(invalid(format!("argument '{}' has arity 0", def.name)));
            }
        }
        if self.outputs.is_empty() {
            return Err(invalid("op declares no outputs".to_string()));
        }

        let mut attr_names = HashSet::new();
        for (name, _) in &self.attrs {
            if !attr_names.insert(name.as_str()) {
                return Err(invalid(format!("attribute '{}' declared twice", name)));
            }
        }

        for name in &self.requires_grad {
            match self.inputs.iter_mut().find(|d| &d.name == name) {
                Some(def) => def.requires_grad = true,
                None => {
                    return Err(invalid(format!(
                        "requires_grad names unknown input '{}'",
                        name
                    )))
                }
            }
        }
        if !self.requires_grad.is_empty() && self.grad.is_none() {
            return Err(invalid(
                "inputs require gradients but no gradient function is set".to_string(),
            ));
        }

        let sbp = match self.sbp.take() {
            Some(rule) => rule,
            None => match self.inputs.first() {
                Some(first) => SbpRule::AxisScan {
                    reference: first.name.clone(),
                    filter: None,
                },
                None => {
                    return Err(invalid(
                        "op without inputs needs a custom SBP function".to_string(),
                    ))
                }
            },
        };
        if let SbpRule::AxisScan { reference, .. } = &sbp {
            if !self.inputs.iter().any(|d| &d.name == reference) {
                return Err(invalid(format!(
                    "axis scan reference '{}' is not an input",
                    reference
                )));
            }
        }

        Ok(OpRegistration {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            attrs: self.attrs,
            infer,
            sbp,
            grad: self.grad,
        })
    }
}

/// Op registrations keyed by op type name.
#[derive(Debug, Default, Clone)]
pub struct OpRegistry {
    ops: HashMap<String, OpRegistration>,
}

static GLOBAL: OnceLock<OpRegistry> = OnceLock::new();

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in op.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        crate::ops::register_builtin(&mut registry)?;
        Ok(registry)
    }

    /// Process-wide registry of the built-in ops, built on first use and
    /// read-only afterwards.
    pub fn global() -> &'static OpRegistry {
        GLOBAL.get_or_init(|| {
            OpRegistry::with_builtin().expect("built-in op registrations are valid")
        })
    }

    pub fn register(&mut self, registration: OpRegistration) -> Result<()> {
        if self.ops.contains_key(registration.name()) {
            return Err(GraphError::DuplicateOpType(registration.name().to_string()));
        }
        self.ops
            .insert(registration.name().to_string(), registration);
        Ok(())
    }

    pub fn get(&self, op_type: &str) -> Result<&OpRegistration> {
        self.ops
            .get(op_type)
            .ok_or_else(|| GraphError::UnknownOpType(op_type.to_string()))
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.ops.contains_key(op_type)
    }

    /// Registered op type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ops.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
