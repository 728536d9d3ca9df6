//! The shape inference contract: a pure function from input logical metas and
//! attributes to output logical metas.

use sbp_tensor::{DType, Shape, TensorMeta};

use crate::attr::{AttrKind, AttrMap, AttrValue};
use crate::error::{GraphError, Result};
use crate::registry::{ArgRef, OpRegistration};

#[derive(Debug, Default, Clone)]
struct OutputSlot {
    shape: Option<Shape>,
    dtype: Option<DType>,
    is_dynamic: Option<bool>,
    is_tensor_list: Option<bool>,
    batch_axis: Option<Option<usize>>,
}

/// View handed to an op's [`InferFn`](crate::registry::InferFn).
pub struct InferContext<'a> {
    op_name: &'a str,
    attrs: &'a AttrMap,
    inputs: &'a [(ArgRef, TensorMeta)],
    outputs: Vec<(ArgRef, OutputSlot)>,
}

impl<'a> InferContext<'a> {
    fn new(
        op_name: &'a str,
        attrs: &'a AttrMap,
        inputs: &'a [(ArgRef, TensorMeta)],
        output_args: Vec<ArgRef>,
    ) -> Self {
        let outputs = output_args
            .into_iter()
            .map(|arg| (arg, OutputSlot::default()))
            .collect();
        InferContext {
            op_name,
            attrs,
            inputs,
            outputs,
        }
    }

    pub fn op_name(&self) -> &str {
        self.op_name
    }

    pub fn input_meta(&self, name: &str, index: usize) -> Result<&TensorMeta> {
        self.inputs
            .iter()
            .find(|(arg, _)| arg.name == name && arg.index == index)
            .map(|(_, meta)| meta)
            .ok_or_else(|| GraphError::UnknownArg {
                op: self.op_name.to_string(),
                arg: ArgRef::new(name, index).to_string(),
            })
    }

    pub fn input_shape(&self, name: &str, index: usize) -> Result<&Shape> {
        Ok(&self.input_meta(name, index)?.shape)
    }

    pub fn input_dtype(&self, name: &str, index: usize) -> Result<DType> {
        Ok(self.input_meta(name, index)?.dtype)
    }

    pub fn attr(&self, name: &str) -> Result<&AttrValue> {
        lookup_attr(self.op_name, self.attrs, name)
    }

    pub fn attr_int(&self, name: &str) -> Result<i64> {
        let v = self.attr(name)?;
        v.as_int()
            .ok_or_else(|| wrong_kind(self.op_name, name, AttrKind::Int, v))
    }

    pub fn attr_ints(&self, name: &str) -> Result<&[i64]> {
        let v = self.attr(name)?;
        v.as_ints()
            .ok_or_else(|| wrong_kind(self.op_name, name, AttrKind::Ints, v))
    }

    pub fn attr_bool(&self, name: &str) -> Result<bool> {
        let v = self.attr(name)?;
        v.as_bool()
            .ok_or_else(|| wrong_kind(self.op_name, name, AttrKind::Bool, v))
    }

    fn slot(&mut self, name: &str, index: usize) -> Result<&mut OutputSlot> {
        let op = self.op_name;
        self.outputs
            .iter_mut()
            .find(|(arg, _)| arg.name == name && arg.index == index)
            .map(|(_, slot)| slot)
            .ok_or_else(|| GraphError::UnknownArg {
                op: op.to_string(),
                arg: ArgRef::new(name, index).to_string(),
            })
    }

    pub fn set_output_shape(&mut self, name: &str, index: usize, shape: Shape) -> Result<()> {
        self.slot(name, index)?.shape = Some(shape);
        Ok(())
    }

    pub fn set_output_dtype(&mut self, name: &str, index: usize, dtype: DType) -> Result<()> {
        self.slot(name, index)?.dtype = Some(dtype);
        Ok(())
    }

    pub fn set_output_dynamic(&mut self, name: &str, index: usize, dynamic: bool) -> Result<()> {
        self.slot(name, index)?.is_dynamic = Some(dynamic);
        Ok(())
    }

    pub fn set_output_tensor_list(
        &mut self,
        name: &str,
        index: usize,
        tensor_list: bool,
    ) -> Result<()> {
        self.slot(name, index)?.is_tensor_list = Some(tensor_list);
        Ok(())
    }

    pub fn set_output_batch_axis(
        &mut self,
        name: &str,
        index: usize,
        axis: Option<usize>,
    ) -> Result<()> {
        self.slot(name, index)?.batch_axis = Some(axis);
        Ok(())
    }

    /// A `ShapeMismatch` error for this op.
    pub fn shape_mismatch(&self, detail: impl Into<String>) -> GraphError {
        GraphError::ShapeMismatch {
            op: self.op_name.to_string(),
            detail: detail.into(),
        }
    }

    fn finish(self) -> Result<Vec<(ArgRef, TensorMeta)>> {
        let any_dynamic = self.inputs.iter().any(|(_, m)| m.is_dynamic);
        let first = self.inputs.first().map(|(_, m)| m);
        let op_name = self.op_name;

        self.outputs
            .into_iter()
            .map(|(arg, slot)| -> Result<(ArgRef, TensorMeta)> {
                let shape = slot.shape.ok_or_else(|| GraphError::ShapeMismatch {
                    op: op_name.to_string(),
                    detail: format!("shape of output '{}' was not inferred", arg),
                })?;
                let dtype = slot.dtype.ok_or_else(|| GraphError::ShapeMismatch {
                    op: op_name.to_string(),
                    detail: format!("dtype of output '{}' was not inferred", arg),
                })?;
                let batch_axis = match slot.batch_axis {
                    Some(axis) => axis,
                    None => first
                        .and_then(|m| m.batch_axis)
                        .filter(|axis| *axis < shape.ndim()),
                };
                if let Some(axis) = batch_axis {
                    if axis >= shape.ndim() {
                        return Err(GraphError::ShapeMismatch {
                            op: op_name.to_string(),
                            detail: format!(
                                "batch axis {} of output '{}' is out of range for {}",
                                axis, arg, shape
                            ),
                        });
                    }
                }
                let meta = TensorMeta {
                    is_dynamic: slot.is_dynamic.unwrap_or(any_dynamic),
                    is_tensor_list: slot
                        .is_tensor_list
                        .unwrap_or_else(|| first.map(|m| m.is_tensor_list).unwrap_or(false)),
                    batch_axis,
                    shape,
                    dtype,
                };
                Ok((arg, meta))
            })
            .collect()
    }
}

pub(crate) fn lookup_attr<'m>(op: &str, attrs: &'m AttrMap, name: &str) -> Result<&'m AttrValue> {
    attrs.get(name).ok_or_else(|| GraphError::InvalidAttr {
        op: op.to_string(),
        attr: name.to_string(),
        reason: "attribute is not set".to_string(),
    })
}

pub(crate) fn wrong_kind(op: &str, name: &str, expected: AttrKind, got: &AttrValue) -> GraphError {
    GraphError::InvalidAttr {
        op: op.to_string(),
        attr: name.to_string(),
        reason: format!("expected {}, got {}", expected, got.kind()),
    }
}

/// Run `registration`'s inference function for one op instance.
///
/// `inputs` must list every input slot of the registration. The result lists
/// every output slot in declaration order.
pub fn infer_op(
    registration: &OpRegistration,
    op_name: &str,
    attrs: &AttrMap,
    inputs: &[(ArgRef, TensorMeta)],
) -> Result<Vec<(ArgRef, TensorMeta)>> {
    let mut ctx = InferContext::new(op_name, attrs, inputs, registration.output_args());
    (registration.infer_fn())(&mut ctx)?;
    ctx.finish()
}
