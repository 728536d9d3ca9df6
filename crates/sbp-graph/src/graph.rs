//! The logical graph: graph inputs, op instances and the descriptors they
//! produce.
//!
//! [`Graph::add_op`] runs the whole pipeline for one op: argument and
//! attribute validation, shape inference, SBP candidate generation and
//! selection, and finally creation of the output descriptors with their
//! physical shards. Nothing is committed unless every step succeeds.

use std::collections::HashMap;

use sbp_tensor::{
    DType, Distribute, GroupId, LogicalId, LogicalTensorDesc, ParallelConf, ParallelGroup,
    PlacementKind, Shape, TensorArena, TensorMeta,
};
use tracing::debug;

use crate::attr::{AttrMap, AttrValue};
use crate::config::JobConfig;
use crate::error::{GraphError, Result};
use crate::infer::infer_op;
use crate::registry::{ArgRef, OpRegistration, OpRegistry};
use crate::sbp::{
    candidate_signatures, check_feasible, select_signature, verify_recombination, SbpSignature,
    SignatureRequest,
};

/// Graph-scoped id of an op instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub usize);

/// One op instance after it has been added to the graph.
#[derive(Debug, Clone)]
pub struct OpNode {
    id: OpId,
    name: String,
    op_type: String,
    inputs: Vec<(ArgRef, LogicalId)>,
    outputs: Vec<(ArgRef, LogicalId)>,
    attrs: AttrMap,
    group: GroupId,
    signature: SbpSignature,
}

impl OpNode {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn inputs(&self) -> &[(ArgRef, LogicalId)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(ArgRef, LogicalId)] {
        &self.outputs
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn signature(&self) -> &SbpSignature {
        &self.signature
    }

    pub fn input(&self, name: &str, index: usize) -> Result<LogicalId> {
        find_slot(&self.name, &self.inputs, name, index)
    }

    pub fn output(&self, name: &str, index: usize) -> Result<LogicalId> {
        find_slot(&self.name, &self.outputs, name, index)
    }
}

fn find_slot(op: &str, slots: &[(ArgRef, LogicalId)], name: &str, index: usize) -> Result<LogicalId> {
    slots
        .iter()
        .find(|(a, _)| a.name == name && a.index == index)
        .map(|(_, id)| *id)
        .ok_or_else(|| GraphError::UnknownArg {
            op: op.to_string(),
            arg: ArgRef::new(name, index).to_string(),
        })
}

/// Request to add one op instance.
#[derive(Debug, Clone)]
pub struct OpConf {
    pub name: String,
    pub op_type: String,
    /// Tensors bound to each input argument, in slot order.
    pub inputs: Vec<(String, Vec<LogicalId>)>,
    pub attrs: AttrMap,
    /// Group to run on. Defaults to the first input's group.
    pub placement: Option<ParallelGroup>,
    /// Signature to run under instead of automatic selection.
    pub sbp: Option<SbpSignature>,
    /// Output policy automatic selection favours over the producer layout.
    pub preferred_output: Option<Distribute>,
}

impl OpConf {
    pub fn builder(name: impl Into<String>, op_type: impl Into<String>) -> OpConfBuilder {
        OpConfBuilder {
            conf: OpConf {
                name: name.into(),
                op_type: op_type.into(),
                inputs: Vec::new(),
                attrs: AttrMap::new(),
                placement: None,
                sbp: None,
                preferred_output: None,
            },
        }
    }
}

pub struct OpConfBuilder {
    conf: OpConf,
}

impl OpConfBuilder {
    /// Bind `tensor` to the next slot of argument `name`.
    pub fn input(mut self, name: &str, tensor: LogicalId) -> Self {
        match self.conf.inputs.iter_mut().find(|(n, _)| n == name) {
            Some((_, ids)) => ids.push(tensor),
            None => self.conf.inputs.push((name.to_string(), vec![tensor])),
        }
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.conf.attrs.insert(name, value);
        self
    }

    pub fn attrs(mut self, attrs: AttrMap) -> Self {
        self.conf.attrs = attrs;
        self
    }

    pub fn placement(mut self, group: ParallelGroup) -> Self {
        self.conf.placement = Some(group);
        self
    }

    pub fn sbp(mut self, signature: SbpSignature) -> Self {
        self.conf.sbp = Some(signature);
        self
    }

    pub fn prefer_output(mut self, policy: Distribute) -> Self {
        self.conf.preferred_output = Some(policy);
        self
    }

    pub fn build(self) -> OpConf {
        self.conf
    }
}

/// A tensor fed into the graph from outside.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub name: String,
    pub shape: Shape,
    /// Defaults to the job's default dtype.
    pub dtype: Option<DType>,
    pub group: ParallelGroup,
    /// Defaults to broadcast for consistent inputs and split on axis 0 for
    /// mirrored ones.
    pub distribute: Option<Distribute>,
    pub placement: PlacementKind,
    pub is_dynamic: bool,
    pub is_tensor_list: bool,
    pub batch_axis: Option<usize>,
}

impl InputSpec {
    pub fn new(name: impl Into<String>, shape: impl Into<Shape>, group: ParallelGroup) -> Self {
        InputSpec {
            name: name.into(),
            shape: shape.into(),
            dtype: None,
            group,
            distribute: None,
            placement: PlacementKind::Consistent,
            is_dynamic: false,
            is_tensor_list: false,
            batch_axis: None,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn with_distribute(mut self, distribute: Distribute) -> Self {
        self.distribute = Some(distribute);
        self
    }

    pub fn mirrored(mut self) -> Self {
        self.placement = PlacementKind::Mirrored;
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.is_dynamic = true;
        self
    }

    pub fn tensor_list(mut self) -> Self {
        self.is_tensor_list = true;
        self
    }

    pub fn with_batch_axis(mut self, axis: usize) -> Self {
        self.batch_axis = Some(axis);
        self
    }
}

/// A logical graph under construction.
pub struct Graph<'r> {
    pub(crate) config: JobConfig,
    pub(crate) registry: &'r OpRegistry,
    pub(crate) arena: TensorArena,
    pub(crate) ops: Vec<OpNode>,
    op_names: HashMap<String, OpId>,
    input_names: HashMap<String, LogicalId>,
    pub(crate) output_grads: HashMap<(OpId, ArgRef), LogicalId>,
    pub(crate) input_grads: HashMap<(OpId, ArgRef), LogicalId>,
}

impl Graph<'static> {
    /// A graph over the process-wide built-in registry.
    pub fn new(config: JobConfig) -> Self {
        Graph::with_registry(config, OpRegistry::global())
    }
}

impl<'r> Graph<'r> {
    pub fn with_registry(config: JobConfig, registry: &'r OpRegistry) -> Self {
        Graph {
            config,
            registry,
            arena: TensorArena::new(),
            ops: Vec::new(),
            op_names: HashMap::new(),
            input_names: HashMap::new(),
            output_grads: HashMap::new(),
            input_grads: HashMap::new(),
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn registry(&self) -> &'r OpRegistry {
        self.registry
    }

    fn name_taken(&self, name: &str) -> bool {
        self.op_names.contains_key(name) || self.input_names.contains_key(name)
    }

    /// `prefix` if no op or input uses it yet, else the first free
    /// `prefix_N`.
    pub fn unique_op_name(&self, prefix: &str) -> String {
        if !self.name_taken(prefix) {
            return prefix.to_string();
        }
        (1..)
            .map(|n| format!("{}_{}", prefix, n))
            .find(|candidate| !self.name_taken(candidate))
            .unwrap_or_else(|| prefix.to_string())
    }

    /// Add a graph input with a resolved policy.
    pub fn add_input(&mut self, spec: InputSpec) -> Result<LogicalId> {
        if self.name_taken(&spec.name) {
            return Err(GraphError::DuplicateOpName(spec.name));
        }
        let invalid = |reason: String| GraphError::InvalidInput {
            op: spec.name.clone(),
            arg: "out_0".to_string(),
            reason,
        };
        if let Some(axis) = spec.batch_axis {
            if axis >= spec.shape.ndim() {
                return Err(invalid(format!(
                    "batch axis {} is out of range for {}",
                    axis, spec.shape
                )));
            }
        }

        let distribute = spec.distribute.unwrap_or(match spec.placement {
            PlacementKind::Consistent => Distribute::Broadcast,
            PlacementKind::Mirrored => Distribute::Split(0),
        });
        let n = spec.group.parallel_num();
        distribute
            .ensure_splittable(&spec.shape, n)
            .map_err(|e| invalid(e.to_string()))?;

        let meta = TensorMeta {
            shape: spec.shape,
            dtype: spec.dtype.unwrap_or(self.config.default_dtype),
            is_dynamic: spec.is_dynamic,
            is_tensor_list: spec.is_tensor_list,
            batch_axis: spec.batch_axis,
        };
        let group = self.arena.intern_group(&spec.group);
        let id = self
            .arena
            .push(spec.name.clone(), meta, group, spec.placement, self.config.eval_mode);
        self.arena.resolve(id, distribute)?;
        debug!(input = %spec.name, tensor = %id, policy = %distribute, "added graph input");
        self.input_names.insert(spec.name, id);
        Ok(id)
    }

    /// Validate, infer and place one op, then commit its outputs.
    pub fn add_op(&mut self, conf: OpConf) -> Result<OpId> {
        let registry = self.registry;
        let registration = registry.get(&conf.op_type)?;
        if self.name_taken(&conf.name) {
            return Err(GraphError::DuplicateOpName(conf.name));
        }

        let input_ids = self.bind_inputs(registration, &conf)?;
        validate_attrs(registration, &conf)?;

        let mut inputs = Vec::with_capacity(input_ids.len());
        let mut producer_policies = Vec::with_capacity(input_ids.len());
        for (arg, id) in &input_ids {
            let desc = self.arena.get(*id)?;
            inputs.push((arg.clone(), desc.meta().clone()));
            if let Some(policy) = desc.distribute() {
                producer_policies.push((arg.clone(), policy));
            }
        }

        let first_input = match input_ids.first() {
            Some((_, id)) => Some(self.arena.get(*id)?),
            None => None,
        };
        let group = match (&conf.placement, first_input) {
            (Some(group), _) => group.clone(),
            (None, Some(desc)) => self.arena.group(desc.group()).clone(),
            (None, None) => return Err(GraphError::MissingPlacement { op: conf.name }),
        };
        let placement = first_input
            .map(LogicalTensorDesc::placement)
            .unwrap_or_default();
        let parallel_num = group.parallel_num();

        let outputs = infer_op(registration, &conf.name, &conf.attrs, &inputs)?;
        let candidates = candidate_signatures(
            registration,
            &conf.name,
            &conf.attrs,
            &inputs,
            &outputs,
            parallel_num,
        )?;

        if self.config.verify_signatures && parallel_num > 1 {
            for c in candidates
                .iter()
                .filter(|c| check_feasible(c, &inputs, &outputs, parallel_num).is_ok())
            {
                verify_recombination(
                    registration,
                    &conf.name,
                    &conf.attrs,
                    &inputs,
                    &outputs,
                    c,
                    parallel_num,
                )?;
            }
        }

        let request = match (&conf.sbp, conf.preferred_output) {
            (Some(sig), _) => SignatureRequest::Explicit(sig),
            (None, Some(policy)) => SignatureRequest::PreferOutputs(policy),
            (None, None) => SignatureRequest::Auto,
        };
        let signature = select_signature(
            &conf.name,
            &candidates,
            &inputs,
            &outputs,
            &producer_policies,
            parallel_num,
            request,
        )?;

        let mut output_policies = Vec::with_capacity(outputs.len());
        for (arg, meta) in &outputs {
            let policy = signature.output(arg).ok_or_else(|| GraphError::InvalidSignature {
                op: conf.name.clone(),
                reason: format!("{} has no policy for '{}'", signature, arg),
            })?;
            for device in 0..parallel_num {
                policy.physical_shape(&meta.shape, parallel_num, device)?;
            }
            output_policies.push(policy);
        }

        // Commit.
        let group_id = self.arena.intern_group(&group);
        let op_id = OpId(self.ops.len());
        let mut output_ids = Vec::with_capacity(outputs.len());
        for ((arg, meta), policy) in outputs.into_iter().zip(output_policies) {
            let id = self.arena.push(
                format!("{}/{}", conf.name, arg),
                meta,
                group_id,
                placement,
                self.config.eval_mode,
            );
            self.arena.resolve(id, policy)?;
            output_ids.push((arg, id));
        }

        debug!(
            op = %conf.name,
            op_type = %conf.op_type,
            devices = parallel_num,
            signature = %signature,
            "added op"
        );
        self.op_names.insert(conf.name.clone(), op_id);
        self.ops.push(OpNode {
            id: op_id,
            name: conf.name,
            op_type: conf.op_type,
            inputs: input_ids,
            outputs: output_ids,
            attrs: conf.attrs,
            group: group_id,
            signature,
        });
        Ok(op_id)
    }

    fn bind_inputs(
        &self,
        registration: &OpRegistration,
        conf: &OpConf,
    ) -> Result<Vec<(ArgRef, LogicalId)>> {
        let invalid = |arg: &str, reason: String| GraphError::InvalidInput {
            op: conf.name.clone(),
            arg: arg.to_string(),
            reason,
        };

        for (name, _) in &conf.inputs {
            if registration.input_def(name).is_none() {
                return Err(GraphError::UnknownArg {
                    op: conf.name.clone(),
                    arg: name.clone(),
                });
            }
        }

        let mut bound = Vec::new();
        for def in registration.inputs() {
            let ids = conf
                .inputs
                .iter()
                .find(|(n, _)| n == &def.name)
                .map(|(_, ids)| ids.as_slice())
                .unwrap_or(&[]);
            if ids.len() != def.arity {
                return Err(invalid(
                    &def.name,
                    format!("expects {} tensor(s), got {}", def.arity, ids.len()),
                ));
            }
            for (index, id) in ids.iter().enumerate() {
                self.arena
                    .get(*id)
                    .map_err(|e| invalid(&def.name, e.to_string()))?;
                bound.push((ArgRef::new(def.name.clone(), index), *id));
            }
        }
        Ok(bound)
    }

    pub fn tensor(&self, id: LogicalId) -> Result<&LogicalTensorDesc> {
        Ok(self.arena.get(id)?)
    }

    pub fn op(&self, id: OpId) -> Result<&OpNode> {
        self.ops.get(id.0).ok_or(GraphError::UnknownOp(id.0))
    }

    pub fn op_by_name(&self, name: &str) -> Option<&OpNode> {
        self.op_names.get(name).and_then(|id| self.ops.get(id.0))
    }

    pub fn input_by_name(&self, name: &str) -> Option<LogicalId> {
        self.input_names.get(name).copied()
    }

    /// The tensor produced by output slot `name_index` of `op`.
    pub fn op_output(&self, op: OpId, name: &str, index: usize) -> Result<LogicalId> {
        self.op(op)?.output(name, index)
    }

    pub fn parallel_group(&self, id: LogicalId) -> Result<&ParallelGroup> {
        let desc = self.arena.get(id)?;
        Ok(self.arena.group(desc.group()))
    }

    pub fn parallel_conf(&self, id: LogicalId) -> Result<ParallelConf> {
        Ok(self.arena.parallel_conf(id)?)
    }

    pub fn ops(&self) -> &[OpNode] {
        &self.ops
    }

    pub fn arena(&self) -> &TensorArena {
        &self.arena
    }

    /// Freeze the graph.
    pub fn finalize(self) -> Job {
        debug!(
            job = %self.config.job_name,
            ops = self.ops.len(),
            tensors = self.arena.len(),
            "finalized job"
        );
        Job {
            config: self.config,
            arena: self.arena,
            ops: self.ops,
            op_names: self.op_names,
            input_names: self.input_names,
            input_grads: self.input_grads,
        }
    }
}

fn validate_attrs(registration: &OpRegistration, conf: &OpConf) -> Result<()> {
    let invalid = |attr: &str, reason: String| GraphError::InvalidAttr {
        op: conf.name.clone(),
        attr: attr.to_string(),
        reason,
    };
    for (name, kind) in registration.attrs() {
        match conf.attrs.get(name) {
            None => return Err(invalid(name, "attribute is not set".to_string())),
            Some(v) if v.kind() != *kind => {
                return Err(invalid(name, format!("expected {}, got {}", kind, v.kind())))
            }
            Some(_) => {}
        }
    }
    for (name, _) in conf.attrs.iter() {
        if registration.attr_kind(name).is_none() {
            return Err(invalid(
                name,
                format!("not declared by op type '{}'", registration.name()),
            ));
        }
    }
    Ok(())
}

/// A finalized, read-only graph.
#[derive(Debug, Clone)]
pub struct Job {
    config: JobConfig,
    arena: TensorArena,
    ops: Vec<OpNode>,
    op_names: HashMap<String, OpId>,
    input_names: HashMap<String, LogicalId>,
    input_grads: HashMap<(OpId, ArgRef), LogicalId>,
}

impl Job {
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn tensor(&self, id: LogicalId) -> Result<&LogicalTensorDesc> {
        Ok(self.arena.get(id)?)
    }

    pub fn tensors(&self) -> impl Iterator<Item = &LogicalTensorDesc> {
        self.arena.iter()
    }

    pub fn op(&self, id: OpId) -> Result<&OpNode> {
        self.ops.get(id.0).ok_or(GraphError::UnknownOp(id.0))
    }

    pub fn op_by_name(&self, name: &str) -> Option<&OpNode> {
        self.op_names.get(name).and_then(|id| self.ops.get(id.0))
    }

    pub fn input_by_name(&self, name: &str) -> Option<LogicalId> {
        self.input_names.get(name).copied()
    }

    pub fn ops(&self) -> &[OpNode] {
        &self.ops
    }

    pub fn parallel_group(&self, id: LogicalId) -> Result<&ParallelGroup> {
        let desc = self.arena.get(id)?;
        Ok(self.arena.group(desc.group()))
    }

    pub fn parallel_conf(&self, id: LogicalId) -> Result<ParallelConf> {
        Ok(self.arena.parallel_conf(id)?)
    }

    /// Gradient bound to input slot `name_index` of `op`, if one was
    /// synthesized.
    pub fn input_grad(&self, op: OpId, name: &str, index: usize) -> Option<LogicalId> {
        self.input_grads
            .get(&(op, ArgRef::new(name, index)))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbp_tensor::DeviceKind;

    fn gpus(n: u32) -> ParallelGroup {
        ParallelGroup::local(DeviceKind::Gpu, n).unwrap()
    }

    #[test]
    fn test_add_input_defaults() {
        let mut g = Graph::new(JobConfig::default());
        let x = g.add_input(InputSpec::new("x", [4, 6], gpus(2))).unwrap();
        let desc = g.tensor(x).unwrap();
        assert_eq!(desc.dtype(), DType::Float32);
        assert_eq!(desc.distribute(), Some(Distribute::Broadcast));
        assert_eq!(desc.physical_descs().unwrap().len(), 2);

        let m = g
            .add_input(InputSpec::new("m", [5, 6], gpus(2)).mirrored())
            .unwrap();
        let desc = g.tensor(m).unwrap();
        assert_eq!(desc.distribute(), Some(Distribute::Split(0)));
        assert_eq!(desc.shape().dims(), &[3, 6]);
    }

    #[test]
    fn test_add_input_rejects_duplicates_and_small_split() {
        let mut g = Graph::new(JobConfig::default());
        g.add_input(InputSpec::new("x", [4], gpus(2))).unwrap();
        assert!(matches!(
            g.add_input(InputSpec::new("x", [4], gpus(2))),
            Err(GraphError::DuplicateOpName(_))
        ));
        let err = g
            .add_input(InputSpec::new("y", [2], gpus(4)).with_distribute(Distribute::Split(0)))
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidInput { .. }));
    }

    #[test]
    fn test_output_naming_and_lookup() {
        let mut g = Graph::new(JobConfig::default());
        let x = g.add_input(InputSpec::new("x", [8, 3], gpus(2))).unwrap();
        let op = g
            .add_op(OpConf::builder("relu0", "relu").input("x", x).build())
            .unwrap();
        let y = g.op_output(op, "y", 0).unwrap();
        assert_eq!(g.tensor(y).unwrap().name(), "relu0/y_0");
        assert_eq!(g.op_by_name("relu0").unwrap().id(), op);
        assert!(matches!(
            g.op_output(op, "z", 0),
            Err(GraphError::UnknownArg { .. })
        ));
    }

    #[test]
    fn test_failed_add_op_commits_nothing() {
        let mut g = Graph::new(JobConfig::default());
        let x = g.add_input(InputSpec::new("x", [2, 3, 4, 4], gpus(2))).unwrap();
        let before = g.arena().len();
        let err = g
            .add_op(
                OpConf::builder("pad", "reflection_pad2d")
                    .input("x", x)
                    .attr("padding", vec![0i64, 0, 4, 1])
                    .build(),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
        assert_eq!(g.arena().len(), before);
        assert!(g.op_by_name("pad").is_none());
        assert!(g.ops().is_empty());
    }

    #[test]
    fn test_input_and_attr_validation() {
        let mut g = Graph::new(JobConfig::default());
        let x = g.add_input(InputSpec::new("x", [4, 4], gpus(1))).unwrap();

        let err = g
            .add_op(OpConf::builder("mm", "matmul").input("a", x).build())
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidInput { .. }));

        let err = g
            .add_op(OpConf::builder("r", "relu").input("q", x).build())
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownArg { .. }));

        let err = g
            .add_op(
                OpConf::builder("r", "relu")
                    .input("x", x)
                    .attr("alpha", 0.1)
                    .build(),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidAttr { .. }));

        let err = g
            .add_op(
                OpConf::builder("mm", "matmul")
                    .input("a", x)
                    .input("b", x)
                    .attr("transpose_a", 1i64)
                    .attr("transpose_b", false)
                    .build(),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidAttr { .. }));

        assert!(matches!(
            g.add_op(OpConf::builder("q", "no_such_op").build()),
            Err(GraphError::UnknownOpType(_))
        ));
    }

    #[test]
    fn test_unique_op_name() {
        let mut g = Graph::new(JobConfig::default());
        let x = g.add_input(InputSpec::new("x", [4], gpus(1))).unwrap();
        assert_eq!(g.unique_op_name("relu"), "relu");
        g.add_op(OpConf::builder("relu", "relu").input("x", x).build())
            .unwrap();
        assert_eq!(g.unique_op_name("relu"), "relu_1");
        g.add_op(OpConf::builder("relu_1", "relu").input("x", x).build())
            .unwrap();
        assert_eq!(g.unique_op_name("relu"), "relu_2");
        assert_eq!(g.unique_op_name("x"), "x_1");
    }

    #[test]
    fn test_placement_override_and_missing() {
        let mut g = Graph::new(JobConfig::default());
        let x = g.add_input(InputSpec::new("x", [8, 8], gpus(1))).unwrap();
        let op = g
            .add_op(
                OpConf::builder("r", "relu")
                    .input("x", x)
                    .placement(gpus(4))
                    .build(),
            )
            .unwrap();
        let y = g.op_output(op, "y", 0).unwrap();
        assert_eq!(g.parallel_group(y).unwrap().parallel_num(), 4);
        assert_eq!(g.parallel_conf(y).unwrap().device_names, vec!["0:0-3"]);

        // arity is checked before placement
        let err = g
            .add_op(OpConf::builder("r2", "relu").build())
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidInput { .. }));
    }

    #[test]
    fn test_finalize_snapshot() {
        let mut g = Graph::new(JobConfig::new("snap"));
        let x = g.add_input(InputSpec::new("x", [6, 2], gpus(3))).unwrap();
        let op = g
            .add_op(OpConf::builder("r", "relu").input("x", x).build())
            .unwrap();
        let job = g.finalize();
        assert_eq!(job.config().job_name, "snap");
        assert_eq!(job.ops().len(), 1);
        assert_eq!(job.tensors().count(), 2);
        assert_eq!(job.input_by_name("x"), Some(x));
        let y = job.op(op).unwrap().output("y", 0).unwrap();
        assert_eq!(job.tensor(y).unwrap().physical_descs().unwrap().len(), 3);
        assert!(job.input_grad(op, "x", 0).is_none());
    }
}
