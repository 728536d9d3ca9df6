//! Element-wise ReLU. Every axis may be split, and the gradient masks `dy`
//! with the forward output.

use crate::error::Result;
use crate::graph::OpConf;
use crate::grad::BackwardContext;
use crate::infer::InferContext;
use crate::registry::{OpRegistration, OpRegistry};

pub(crate) fn register(registry: &mut OpRegistry) -> Result<()> {
    registry.register(
        OpRegistration::builder("relu")
            .input("x")
            .output("y")
            .requires_grad("x")
            .infer(infer_relu)
            .grad(relu_grad)
            .finish()?,
    )?;
    registry.register(
        OpRegistration::builder("relu_grad")
            .input("y")
            .input("dy")
            .output("dx")
            .infer(infer_relu_grad)
            .axis_scan("y", None)
            .finish()?,
    )
}

fn infer_relu(ctx: &mut InferContext<'_>) -> Result<()> {
    let shape = ctx.input_shape("x", 0)?.clone();
    let dtype = ctx.input_dtype("x", 0)?;
    ctx.set_output_shape("y", 0, shape)?;
    ctx.set_output_dtype("y", 0, dtype)
}

fn infer_relu_grad(ctx: &mut InferContext<'_>) -> Result<()> {
    let y = ctx.input_meta("y", 0)?.clone();
    let dy = ctx.input_meta("dy", 0)?;
    if y.shape != dy.shape {
        return Err(ctx.shape_mismatch(format!(
            "dy {} does not match y {}",
            dy.shape, y.shape
        )));
    }
    if y.dtype != dy.dtype {
        return Err(ctx.shape_mismatch(format!(
            "dy dtype {} does not match y dtype {}",
            dy.dtype, y.dtype
        )));
    }
    ctx.set_output_shape("dx", 0, y.shape)?;
    ctx.set_output_dtype("dx", 0, y.dtype)
}

fn relu_grad(ctx: &mut BackwardContext<'_, '_>) -> Result<()> {
    if !ctx.needs_grad("x", 0) {
        return Ok(());
    }
    let dy = ctx.output_grad("y", 0)?;
    let y = ctx.output("y", 0)?;
    let name = ctx.grad_op_name("");
    let op = ctx.add_op(
        OpConf::builder(name, "relu_grad")
            .input("y", y)
            .input("dy", dy)
            .build(),
    )?;
    let dx = ctx.op_output(op, "dx", 0)?;
    ctx.bind_input_grad("x", 0, dx)
}
