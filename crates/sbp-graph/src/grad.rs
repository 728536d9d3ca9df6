//! On-demand gradient synthesis.
//!
//! Each forward input slot is either unrequested or bound to a gradient
//! tensor. Requesting an unbound slot runs the op's gradient function, which
//! adds ordinary ops to the graph through [`BackwardContext`] and binds the
//! result. Later requests return the bound tensor without running anything.

use sbp_tensor::LogicalId;
use tracing::debug;

use crate::attr::{AttrKind, AttrMap, AttrValue};
use crate::error::{GraphError, Result};
use crate::graph::{Graph, OpConf, OpId};
use crate::infer::{lookup_attr, wrong_kind};
use crate::registry::ArgRef;

/// View of one forward op handed to its gradient function.
pub struct BackwardContext<'a, 'r> {
    graph: &'a mut Graph<'r>,
    op: OpId,
    requested: ArgRef,
}

impl<'a, 'r> BackwardContext<'a, 'r> {
    fn node_name(&self) -> &str {
        self.graph.ops[self.op.0].name()
    }

    pub fn op_name(&self) -> &str {
        self.node_name()
    }

    pub fn attrs(&self) -> &AttrMap {
        self.graph.ops[self.op.0].attrs()
    }

    pub fn attr(&self, name: &str) -> Result<&AttrValue> {
        lookup_attr(self.node_name(), self.attrs(), name)
    }

    pub fn attr_bool(&self, name: &str) -> Result<bool> {
        let v = self.attr(name)?;
        v.as_bool()
            .ok_or_else(|| wrong_kind(self.node_name(), name, AttrKind::Bool, v))
    }

    /// Forward input bound to slot `name_index`.
    pub fn input(&self, name: &str, index: usize) -> Result<LogicalId> {
        self.graph.ops[self.op.0].input(name, index)
    }

    /// Forward output bound to slot `name_index`.
    pub fn output(&self, name: &str, index: usize) -> Result<LogicalId> {
        self.graph.ops[self.op.0].output(name, index)
    }

    /// Whether the gradient of input `name_index` should be produced now.
    pub fn needs_grad(&self, name: &str, index: usize) -> bool {
        let arg = ArgRef::new(name, index);
        arg == self.requested && !self.graph.input_grads.contains_key(&(self.op, arg))
    }

    /// Gradient flowing into output `name_index`.
    pub fn output_grad(&self, name: &str, index: usize) -> Result<LogicalId> {
        let arg = ArgRef::new(name, index);
        self.output(name, index)?;
        self.graph
            .output_grads
            .get(&(self.op, arg.clone()))
            .copied()
            .ok_or_else(|| GraphError::MissingOutputGrad {
                op: self.node_name().to_string(),
                arg: arg.to_string(),
            })
    }

    /// A free op name derived from the forward op's name, e.g. `pad0_grad`
    /// or `mm0_grad_a` for `tag = "_a"`.
    pub fn grad_op_name(&self, tag: &str) -> String {
        let prefix = format!(
            "{}{}{}",
            self.node_name(),
            self.graph.config.grad_op_suffix,
            tag
        );
        self.graph.unique_op_name(&prefix)
    }

    /// Add a gradient op. Unless `conf` says otherwise, selection favours
    /// outputs laid out as the gradient dual of the requested input's forward
    /// policy: split stays split on the same axis, broadcast becomes partial
    /// sum.
    pub fn add_op(&mut self, mut conf: OpConf) -> Result<OpId> {
        if conf.preferred_output.is_none() {
            conf.preferred_output = self.graph.ops[self.op.0]
                .signature()
                .input(&self.requested)
                .map(|policy| policy.gradient_dual());
        }
        self.graph.add_op(conf)
    }

    pub fn op_output(&self, op: OpId, name: &str, index: usize) -> Result<LogicalId> {
        self.graph.op_output(op, name, index)
    }

    /// Bind `grad` as the gradient of forward input `name_index`.
    pub fn bind_input_grad(&mut self, name: &str, index: usize, grad: LogicalId) -> Result<()> {
        let input = self.input(name, index)?;
        let arg = ArgRef::new(name, index);
        let op_name = self.node_name().to_string();
        let key = (self.op, arg.clone());
        if self.graph.input_grads.contains_key(&key) {
            return Err(GraphError::GradientMismatch {
                op: op_name,
                arg: arg.to_string(),
                grad,
                detail: "a gradient is already bound".to_string(),
            });
        }
        check_grad_matches(self.graph, &op_name, &arg, input, grad)?;
        debug!(op = %op_name, arg = %arg, grad = %grad, "bound input gradient");
        self.graph.input_grads.insert(key, grad);
        Ok(())
    }
}

/// Gradient tensors must have the logical shape and dtype of the tensor they
/// differentiate.
fn check_grad_matches(
    graph: &Graph<'_>,
    op: &str,
    arg: &ArgRef,
    forward: LogicalId,
    grad: LogicalId,
) -> Result<()> {
    let expected = graph.tensor(forward)?.meta();
    let actual = graph.tensor(grad)?.meta();
    let mismatch = |detail: String| GraphError::GradientMismatch {
        op: op.to_string(),
        arg: arg.to_string(),
        grad,
        detail,
    };
    if actual.shape != expected.shape {
        return Err(mismatch(format!(
            "shape {} differs from {}",
            actual.shape, expected.shape
        )));
    }
    if actual.dtype != expected.dtype {
        return Err(mismatch(format!(
            "dtype {} differs from {}",
            actual.dtype, expected.dtype
        )));
    }
    Ok(())
}

impl<'r> Graph<'r> {
    /// Seed the gradient of output `name_index` of `op`.
    pub fn set_output_grad(
        &mut self,
        op: OpId,
        name: &str,
        index: usize,
        grad: LogicalId,
    ) -> Result<()> {
        let node = self.op(op)?;
        let output = node.output(name, index)?;
        let arg = ArgRef::new(name, index);
        check_grad_matches(self, node.name(), &arg, output, grad)?;
        self.output_grads.insert((op, arg), grad);
        Ok(())
    }

    /// Gradient of forward input `name_index` of `op`, synthesizing it on
    /// first request. `None` when the input does not require a gradient.
    pub fn request_grad(
        &mut self,
        op: OpId,
        name: &str,
        index: usize,
    ) -> Result<Option<LogicalId>> {
        let registry = self.registry;
        let node = self.op(op)?;
        node.input(name, index)?;
        let op_name = node.name().to_string();
        let registration = registry.get(node.op_type())?;

        let requires_grad = registration
            .input_def(name)
            .map(|d| d.requires_grad)
            .unwrap_or(false);
        if !requires_grad {
            return Ok(None);
        }

        let arg = ArgRef::new(name, index);
        if let Some(grad) = self.input_grads.get(&(op, arg.clone())) {
            return Ok(Some(*grad));
        }

        let grad_fn = registration
            .grad_fn()
            .ok_or_else(|| GraphError::GradientNotBound {
                op: op_name.clone(),
                arg: arg.to_string(),
            })?;
        debug!(op = %op_name, arg = %arg, "synthesizing gradient");
        let mut ctx = BackwardContext {
            graph: self,
            op,
            requested: arg.clone(),
        };
        grad_fn(&mut ctx)?;

        self.input_grads
            .get(&(op, arg.clone()))
            .copied()
            .map(Some)
            .ok_or_else(|| GraphError::GradientNotBound {
                op: op_name,
                arg: arg.to_string(),
            })
    }

    /// Request the gradient of every input slot of `op` that requires one.
    pub fn request_all_grads(&mut self, op: OpId) -> Result<Vec<(ArgRef, LogicalId)>> {
        let args: Vec<ArgRef> = self.op(op)?.inputs().iter().map(|(a, _)| a.clone()).collect();
        let mut grads = Vec::new();
        for arg in args {
            if let Some(grad) = self.request_grad(op, &arg.name, arg.index)? {
                grads.push((arg, grad));
            }
        }
        Ok(grads)
    }

    /// Gradient already bound to forward input `name_index` of `op`.
    pub fn input_grad(&self, op: OpId, name: &str, index: usize) -> Option<LogicalId> {
        self.input_grads
            .get(&(op, ArgRef::new(name, index)))
            .copied()
    }
}
