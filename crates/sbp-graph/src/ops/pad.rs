//! 2-D reflection padding over NCHW tensors and its gradient.

use sbp_tensor::Shape;

use crate::attr::AttrKind;
use crate::error::Result;
use crate::graph::OpConf;
use crate::grad::BackwardContext;
use crate::infer::InferContext;
use crate::registry::{OpRegistration, OpRegistry};
use crate::sbp::SbpContext;

const H_AXIS: usize = 2;
const W_AXIS: usize = 3;

pub(crate) fn register(registry: &mut OpRegistry) -> Result<()> {
    registry.register(
        OpRegistration::builder("reflection_pad2d")
            .input("x")
            .output("y")
            .attr("padding", AttrKind::Ints)
            .requires_grad("x")
            .infer(infer_pad)
            .axis_scan("x", Some(unpadded_axis))
            .grad(pad_grad)
            .finish()?,
    )?;
    registry.register(
        OpRegistration::builder("reflection_pad2d_grad")
            .input("dy")
            .output("dx")
            .attr("padding", AttrKind::Ints)
            .infer(infer_pad_grad)
            .axis_scan("dy", Some(unpadded_axis))
            .finish()?,
    )
}

/// Per-axis padding, validated against a rank-4 shape. Entries for the
/// batch and channel axes are accepted but leave the shape unchanged; they
/// only keep those axes from being split.
fn padding(ctx: &InferContext<'_>, shape: &Shape) -> Result<Vec<usize>> {
    let padding = ctx.attr_ints("padding")?;
    if shape.ndim() != 4 {
        return Err(ctx.shape_mismatch(format!("expected a 4-D NCHW tensor, got {}", shape)));
    }
    if padding.len() != shape.ndim() {
        return Err(ctx.shape_mismatch(format!(
            "padding has {} entries for a rank {} tensor",
            padding.len(),
            shape.ndim()
        )));
    }
    padding
        .iter()
        .map(|&p| {
            usize::try_from(p).map_err(|_| ctx.shape_mismatch(format!("negative padding {}", p)))
        })
        .collect()
}

fn infer_pad(ctx: &mut InferContext<'_>) -> Result<()> {
    let x = ctx.input_shape("x", 0)?.clone();
    let dtype = ctx.input_dtype("x", 0)?;
    let padding = padding(ctx, &x)?;

    let mut y = x.clone();
    for axis in [H_AXIS, W_AXIS] {
        let extent = x.dim(axis);
        if padding[axis] >= extent {
            return Err(ctx.shape_mismatch(format!(
                "padding {} on axis {} must be smaller than its extent {}",
                padding[axis], axis, extent
            )));
        }
        y = y.with_dim(axis, extent + 2 * padding[axis])?;
    }

    ctx.set_output_shape("y", 0, y)?;
    ctx.set_output_dtype("y", 0, dtype)
}

fn infer_pad_grad(ctx: &mut InferContext<'_>) -> Result<()> {
    let dy = ctx.input_shape("dy", 0)?.clone();
    let dtype = ctx.input_dtype("dy", 0)?;
    let padding = padding(ctx, &dy)?;

    let mut dx = dy.clone();
    for axis in [H_AXIS, W_AXIS] {
        let extent = dy
            .dim(axis)
            .checked_sub(2 * padding[axis])
            .filter(|&e| e > 0)
            .ok_or_else(|| {
                ctx.shape_mismatch(format!(
                    "extent {} on axis {} is too small to remove padding {}",
                    dy.dim(axis),
                    axis,
                    padding[axis]
                ))
            })?;
        dx = dx.with_dim(axis, extent)?;
    }

    ctx.set_output_shape("dx", 0, dx)?;
    ctx.set_output_dtype("dx", 0, dtype)
}

/// Padded axes need neighbouring rows, so only unpadded axes may be split.
fn unpadded_axis(ctx: &SbpContext<'_>, axis: usize) -> Result<bool> {
    let padding = ctx.attr_ints("padding")?;
    Ok(padding.get(axis).copied() == Some(0))
}

fn pad_grad(ctx: &mut BackwardContext<'_, '_>) -> Result<()> {
    if !ctx.needs_grad("x", 0) {
        return Ok(());
    }
    let dy = ctx.output_grad("y", 0)?;
    let padding = ctx.attr("padding")?.clone();
    let name = ctx.grad_op_name("");
    let op = ctx.add_op(
        OpConf::builder(name, "reflection_pad2d_grad")
            .input("dy", dy)
            .attr("padding", padding)
            .build(),
    )?;
    let dx = ctx.op_output(op, "dx", 0)?;
    ctx.bind_input_grad("x", 0, dx)
}

#[cfg(test)]
mod tests {
    use crate::attr::AttrMap;
    use crate::error::GraphError;
    use crate::infer::infer_op;
    use crate::registry::{ArgRef, OpRegistry};
    use sbp_tensor::{DType, Shape, TensorMeta};

    fn run(op_type: &str, arg: &str, dims: &[usize], padding: Vec<i64>) -> Result<Shape, GraphError> {
        let registry = OpRegistry::with_builtin().unwrap();
        let mut attrs = AttrMap::new();
        attrs.insert("padding", padding);
        let inputs = [(
            ArgRef::new(arg, 0),
            TensorMeta::new(Shape::from(dims), DType::Float32),
        )];
        infer_op(registry.get(op_type).unwrap(), "pad", &attrs, &inputs)
            .map(|mut out| out.remove(0).1.shape)
    }

    #[test]
    fn test_pad_shape() {
        let y = run("reflection_pad2d", "x", &[2, 3, 8, 8], vec![0, 0, 2, 3]).unwrap();
        assert_eq!(y.dims(), &[2, 3, 12, 14]);
        let dx = run("reflection_pad2d_grad", "dy", &[2, 3, 12, 14], vec![0, 0, 2, 3]).unwrap();
        assert_eq!(dx.dims(), &[2, 3, 8, 8]);
    }

    #[test]
    fn test_padding_must_be_smaller_than_extent() {
        let err = run("reflection_pad2d", "x", &[1, 1, 3, 8], vec![0, 0, 3, 0]).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
        assert!(run("reflection_pad2d", "x", &[1, 1, 3, 8], vec![0, 0, 2, 0]).is_ok());
    }

    #[test]
    fn test_batch_and_channel_padding_ignored_in_shape() {
        let y = run("reflection_pad2d", "x", &[2, 3, 8, 8], vec![1, 4, 2, 3]).unwrap();
        assert_eq!(y.dims(), &[2, 3, 12, 14]);
        let dx = run("reflection_pad2d_grad", "dy", &[2, 3, 12, 14], vec![1, 4, 2, 3]).unwrap();
        assert_eq!(dx.dims(), &[2, 3, 8, 8]);
    }

    #[test]
    fn test_bad_padding_rejected() {
        for padding in [vec![0, 0, 1], vec![0, 0, -1, 1]] {
            let err = run("reflection_pad2d", "x", &[1, 1, 4, 4], padding).unwrap_err();
            assert!(matches!(err, GraphError::ShapeMismatch { .. }));
        }
        let err = run("reflection_pad2d", "x", &[4, 4], vec![0, 0]).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_grad_extent_must_exceed_both_pads() {
        let dx = run("reflection_pad2d_grad", "dy", &[1, 1, 5, 5], vec![0, 0, 2, 2]).unwrap();
        assert_eq!(dx.dims(), &[1, 1, 1, 1]);
        let err = run("reflection_pad2d_grad", "dy", &[1, 1, 4, 9], vec![0, 0, 2, 1]).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
        let err = run("reflection_pad2d_grad", "dy", &[1, 1, 3, 9], vec![0, 0, 2, 1]).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }
}
