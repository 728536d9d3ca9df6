//! Axis reductions. `axis` lists the reduced axes; negative entries count
//! from the end and an empty list reduces every axis.

use sbp_tensor::Shape;

use crate::attr::AttrKind;
use crate::error::{GraphError, Result};
use crate::infer::InferContext;
use crate::registry::{OpRegistration, OpRegistry, SbpFn};
use crate::sbp::SbpContext;

pub(crate) fn register(registry: &mut OpRegistry) -> Result<()> {
    let ops: [(&str, SbpFn); 2] = [("reduce_max", reduce_max_sbp), ("reduce_sum", reduce_sum_sbp)];
    for (name, sbp) in ops {
        registry.register(
            OpRegistration::builder(name)
                .input("input")
                .output("output")
                .attr("axis", AttrKind::Ints)
                .attr("keep_dims", AttrKind::Bool)
                .infer(infer_reduce)
                .sbp(sbp)
                .finish()?,
        )?;
    }
    Ok(())
}

/// Sorted, deduplicated reduced axes of a rank `ndim` tensor.
fn reduced_axes(op: &str, axis: &[i64], ndim: usize) -> Result<Vec<usize>> {
    if axis.is_empty() {
        return Ok((0..ndim).collect());
    }
    let rank = ndim as i64;
    let mut axes = axis
        .iter()
        .map(|&a| {
            let wrapped = if a < 0 { a + rank } else { a };
            if (0..rank).contains(&wrapped) {
                Ok(wrapped as usize)
            } else {
                Err(GraphError::InvalidAttr {
                    op: op.to_string(),
                    attr: "axis".to_string(),
                    reason: format!("axis {} is out of range for rank {}", a, ndim),
                })
            }
        })
        .collect::<Result<Vec<_>>>()?;
    axes.sort_unstable();
    axes.dedup();
    Ok(axes)
}

/// Output axis holding input axis `axis`, which must not be reduced.
fn kept_position(axis: usize, reduced: &[usize], keep_dims: bool) -> usize {
    if keep_dims {
        axis
    } else {
        axis - reduced.iter().filter(|&&r| r < axis).count()
    }
}

fn infer_reduce(ctx: &mut InferContext<'_>) -> Result<()> {
    let input = ctx.input_meta("input", 0)?.clone();
    let keep_dims = ctx.attr_bool("keep_dims")?;
    let reduced = reduced_axes(ctx.op_name(), ctx.attr_ints("axis")?, input.shape.ndim())?;

    let dims: Vec<usize> = input
        .shape
        .dims()
        .iter()
        .enumerate()
        .filter_map(|(axis, &extent)| match (reduced.contains(&axis), keep_dims) {
            (false, _) => Some(extent),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect();
    // reducing everything without keep_dims leaves a single element
    let shape = if dims.is_empty() {
        Shape::from([1])
    } else {
        Shape::new(dims)
    };

    let batch_axis = input
        .batch_axis
        .filter(|axis| !reduced.contains(axis))
        .map(|axis| kept_position(axis, &reduced, keep_dims));
    ctx.set_output_shape("output", 0, shape)?;
    ctx.set_output_dtype("output", 0, input.dtype)?;
    ctx.set_output_batch_axis("output", 0, batch_axis)
}

/// Split on every kept axis. Returns the reduced axes.
fn split_kept_axes(ctx: &mut SbpContext<'_>) -> Result<Vec<usize>> {
    let ndim = ctx.logical_input("input", 0)?.shape.ndim();
    let keep_dims = ctx.attr_bool("keep_dims")?;
    let reduced = reduced_axes(ctx.op_name(), ctx.attr_ints("axis")?, ndim)?;
    for axis in (0..ndim).filter(|a| !reduced.contains(a)) {
        ctx.new_builder()
            .split("input", axis)
            .split("output", kept_position(axis, &reduced, keep_dims))
            .build();
    }
    Ok(reduced)
}

fn reduce_max_sbp(ctx: &mut SbpContext<'_>) -> Result<()> {
    split_kept_axes(ctx).map(|_| ())
}

fn reduce_sum_sbp(ctx: &mut SbpContext<'_>) -> Result<()> {
    let reduced = split_kept_axes(ctx)?;
    for axis in reduced {
        ctx.new_builder()
            .split("input", axis)
            .partial_sum("output")
            .build();
    }
    ctx.new_builder().partial_sum_inputs().partial_sum_outputs().build();
    Ok(())
}
