//! Rank-2 matrix multiply with optional transposes.
//!
//! `out = op(a) x op(b)` where `op` transposes when the matching flag is set.
//! Besides splitting rows of `a` or columns of `b`, splitting the shared `k`
//! axis of both operands yields per-device partial products whose sum is the
//! logical result.

use sbp_tensor::{LogicalId, Shape};

use crate::attr::AttrKind;
use crate::error::Result;
use crate::graph::OpConf;
use crate::grad::BackwardContext;
use crate::infer::InferContext;
use crate::registry::{OpRegistration, OpRegistry};
use crate::sbp::SbpContext;

pub(crate) fn register(registry: &mut OpRegistry) -> Result<()> {
    registry.register(
        OpRegistration::builder("matmul")
            .input("a")
            .input("b")
            .output("out")
            .attr("transpose_a", AttrKind::Bool)
            .attr("transpose_b", AttrKind::Bool)
            .requires_grad("a")
            .requires_grad("b")
            .infer(infer_matmul)
            .sbp(matmul_sbp)
            .grad(matmul_grad)
            .finish()?,
    )
}

/// `(m, k)` axes of `a` and `(k, n)` axes of `b`.
fn axes(transpose_a: bool, transpose_b: bool) -> ((usize, usize), (usize, usize)) {
    let a = if transpose_a { (1, 0) } else { (0, 1) };
    let b = if transpose_b { (1, 0) } else { (0, 1) };
    (a, b)
}

fn infer_matmul(ctx: &mut InferContext<'_>) -> Result<()> {
    let a = ctx.input_meta("a", 0)?.clone();
    let b = ctx.input_meta("b", 0)?.clone();
    if a.shape.ndim() != 2 || b.shape.ndim() != 2 {
        return Err(ctx.shape_mismatch(format!(
            "operands must be matrices, got {} and {}",
            a.shape, b.shape
        )));
    }
    if a.dtype != b.dtype {
        return Err(ctx.shape_mismatch(format!(
            "operand dtypes differ: {} and {}",
            a.dtype, b.dtype
        )));
    }

    let transpose_a = ctx.attr_bool("transpose_a")?;
    let transpose_b = ctx.attr_bool("transpose_b")?;
    let ((m_axis, k_axis_a), (k_axis_b, n_axis)) = axes(transpose_a, transpose_b);
    let (k_a, k_b) = (a.shape.dim(k_axis_a), b.shape.dim(k_axis_b));
    if k_a != k_b {
        return Err(ctx.shape_mismatch(format!(
            "inner dimensions differ: {} (a {}) vs {} (b {})",
            k_a, a.shape, k_b, b.shape
        )));
    }

    let out = Shape::from([a.shape.dim(m_axis), b.shape.dim(n_axis)]);
    ctx.set_output_shape("out", 0, out)?;
    ctx.set_output_dtype("out", 0, a.dtype)?;
    ctx.set_output_batch_axis("out", 0, (a.batch_axis == Some(m_axis)).then_some(0))
}

fn matmul_sbp(ctx: &mut SbpContext<'_>) -> Result<()> {
    let ((m_axis, k_axis_a), (k_axis_b, n_axis)) =
        axes(ctx.attr_bool("transpose_a")?, ctx.attr_bool("transpose_b")?);

    ctx.new_builder()
        .split("a", m_axis)
        .broadcast("b")
        .split("out", 0)
        .build();
    ctx.new_builder()
        .broadcast("a")
        .split("b", n_axis)
        .split("out", 1)
        .build();
    ctx.new_builder()
        .split("a", k_axis_a)
        .split("b", k_axis_b)
        .partial_sum_outputs()
        .build();
    ctx.new_builder()
        .partial_sum("a")
        .broadcast("b")
        .partial_sum_outputs()
        .build();
    ctx.new_builder()
        .broadcast("a")
        .partial_sum("b")
        .partial_sum_outputs()
        .build();
    Ok(())
}

/// Operands and transposes of the matmul computing one input's gradient.
struct GradTerm {
    lhs: &'static str,
    rhs: &'static str,
    transpose_lhs: bool,
    transpose_rhs: bool,
}

/// `dy` stands for the output gradient.
fn grad_terms(transpose_a: bool, transpose_b: bool) -> (GradTerm, GradTerm) {
    let term = |lhs, rhs, transpose_lhs, transpose_rhs| GradTerm {
        lhs,
        rhs,
        transpose_lhs,
        transpose_rhs,
    };
    match (transpose_a, transpose_b) {
        (false, false) => (term("dy", "b", false, true), term("a", "dy", true, false)),
        (false, true) => (term("dy", "b", false, false), term("dy", "a", true, false)),
        (true, false) => (term("b", "dy", false, true), term("a", "dy", false, false)),
        (true, true) => (term("b", "dy", true, true), term("dy", "a", true, true)),
    }
}

fn operand(ctx: &BackwardContext<'_, '_>, name: &str, dy: LogicalId) -> Result<LogicalId> {
    match name {
        "dy" => Ok(dy),
        input => ctx.input(input, 0),
    }
}

fn matmul_grad(ctx: &mut BackwardContext<'_, '_>) -> Result<()> {
    let (da, db) = grad_terms(ctx.attr_bool("transpose_a")?, ctx.attr_bool("transpose_b")?);
    for (input, tag, term) in [("a", "_a", da), ("b", "_b", db)] {
        if !ctx.needs_grad(input, 0) {
            continue;
        }
        let dy = ctx.output_grad("out", 0)?;
        let lhs = operand(ctx, term.lhs, dy)?;
        let rhs = operand(ctx, term.rhs, dy)?;
        let name = ctx.grad_op_name(tag);
        let op = ctx.add_op(
            OpConf::builder(name, "matmul")
                .input("a", lhs)
                .input("b", rhs)
                .attr("transpose_a", term.transpose_lhs)
                .attr("transpose_b", term.transpose_rhs)
                .build(),
        )?;
        let grad = ctx.op_output(op, "out", 0)?;
        ctx.bind_input_grad(input, 0, grad)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::AttrMap;
    use crate::error::GraphError;
    use crate::infer::infer_op;
    use crate::registry::ArgRef;
    use sbp_tensor::{DType, TensorMeta};

    fn infer(a: [usize; 2], b: [usize; 2], ta: bool, tb: bool) -> Result<TensorMeta> {
        let registry = OpRegistry::with_builtin()?;
        let mut attrs = AttrMap::new();
        attrs.insert("transpose_a", ta);
        attrs.insert("transpose_b", tb);
        let inputs = [
            (
                ArgRef::new("a", 0),
                TensorMeta::new(Shape::from(a), DType::Float32).with_batch_axis(Some(0)),
            ),
            (ArgRef::new("b", 0), TensorMeta::new(Shape::from(b), DType::Float32)),
        ];
        let mut out = infer_op(registry.get("matmul")?, "mm", &attrs, &inputs)?;
        Ok(out.remove(0).1)
    }

    #[test]
    fn test_shapes_with_transposes() {
        assert_eq!(infer([4, 3], [3, 5], false, false).unwrap().shape.dims(), &[4, 5]);
        assert_eq!(infer([3, 4], [3, 5], true, false).unwrap().shape.dims(), &[4, 5]);
        assert_eq!(infer([4, 3], [5, 3], false, true).unwrap().shape.dims(), &[4, 5]);
        assert_eq!(infer([3, 4], [5, 3], true, true).unwrap().shape.dims(), &[4, 5]);
    }

    #[test]
    fn test_batch_axis_follows_rows_of_a() {
        assert_eq!(infer([4, 3], [3, 5], false, false).unwrap().batch_axis, Some(0));
        // a's axis 0 is its k axis once transposed
        assert_eq!(infer([3, 4], [3, 5], true, false).unwrap().batch_axis, None);
    }

    #[test]
    fn test_inner_dim_mismatch() {
        let err = infer([4, 3], [4, 5], false, false).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_grad_terms_shapes() {
        // every gradient term must reproduce the shape of its operand
        for (ta, tb) in [(false, false), (false, true), (true, false), (true, true)] {
            let a = if ta { [3, 4] } else { [4, 3] };
            let b = if tb { [5, 3] } else { [3, 5] };
            let dy = [4, 5];
            let (da, db) = grad_terms(ta, tb);
            for (term, expected) in [(da, a), (db, b)] {
                let pick = |name: &str| match name {
                    "a" => a,
                    "b" => b,
                    _ => dy,
                };
                let got = infer(pick(term.lhs), pick(term.rhs), term.transpose_lhs, term.transpose_rhs)
                    .unwrap();
                assert_eq!(got.shape.dims(), &expected, "ta={} tb={}", ta, tb);
            }
        }
    }
}
