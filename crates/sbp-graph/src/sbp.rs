//! SBP signature inference.
//!
//! An op's SBP callback records candidate signatures through
//! [`SbpContext::new_builder`]. Every candidate must be correct: running the op
//! independently on each device's shards reproduces the logical result once
//! the outputs are combined according to their policies. Which candidate runs
//! is decided afterwards by [`select_signature`].

use std::fmt;

use sbp_tensor::{Distribute, TensorMeta};
use tracing::{debug, trace};

use crate::attr::{AttrKind, AttrMap, AttrValue};
use crate::error::{GraphError, Result};
use crate::infer::{infer_op, lookup_attr, wrong_kind};
use crate::registry::{ArgRef, AxisFilter, OpRegistration, SbpRule};

/// A policy for every input and output slot of one op invocation.
#[derive(Debug, Clone, Eq)]
pub struct SbpSignature {
    inputs: Vec<(ArgRef, Distribute)>,
    outputs: Vec<(ArgRef, Distribute)>,
}

impl SbpSignature {
    pub fn new(inputs: Vec<(ArgRef, Distribute)>, outputs: Vec<(ArgRef, Distribute)>) -> Self {
        SbpSignature { inputs, outputs }
    }

    /// Every slot broadcast: the signature of an op on a single device.
    pub fn broadcast_all(input_args: &[ArgRef], output_args: &[ArgRef]) -> Self {
        let all = |args: &[ArgRef]| {
            args.iter()
                .map(|a| (a.clone(), Distribute::Broadcast))
                .collect()
        };
        SbpSignature {
            inputs: all(input_args),
            outputs: all(output_args),
        }
    }

    pub fn inputs(&self) -> &[(ArgRef, Distribute)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(ArgRef, Distribute)] {
        &self.outputs
    }

    pub fn input(&self, arg: &ArgRef) -> Option<Distribute> {
        lookup(&self.inputs, arg)
    }

    pub fn output(&self, arg: &ArgRef) -> Option<Distribute> {
        lookup(&self.outputs, arg)
    }
}

fn lookup(slots: &[(ArgRef, Distribute)], arg: &ArgRef) -> Option<Distribute> {
    slots.iter().find(|(a, _)| a == arg).map(|(_, d)| *d)
}

fn same_slots(a: &[(ArgRef, Distribute)], b: &[(ArgRef, Distribute)]) -> bool {
    a.len() == b.len() && a.iter().all(|(arg, d)| lookup(b, arg) == Some(*d))
}

/// Equal when every slot has the same policy, regardless of listing order.
impl PartialEq for SbpSignature {
    fn eq(&self, other: &Self) -> bool {
        same_slots(&self.inputs, &other.inputs) && same_slots(&self.outputs, &other.outputs)
    }
}

impl fmt::Display for SbpSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |slots: &[(ArgRef, Distribute)]| {
            slots
                .iter()
                .map(|(a, d)| format!("{}: {}", a, d))
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "({}) -> ({})", join(&self.inputs), join(&self.outputs))
    }
}

#[derive(Debug, Clone)]
struct PendingSignature {
    inputs: Vec<Option<Distribute>>,
    outputs: Vec<Option<Distribute>>,
    unknown: Vec<String>,
}

/// View handed to an op's SBP callback.
pub struct SbpContext<'a> {
    op_name: &'a str,
    attrs: &'a AttrMap,
    inputs: &'a [(ArgRef, TensorMeta)],
    outputs: &'a [(ArgRef, TensorMeta)],
    parallel_num: usize,
    pending: Vec<PendingSignature>,
}

impl<'a> SbpContext<'a> {
    pub fn new(
        op_name: &'a str,
        attrs: &'a AttrMap,
        inputs: &'a [(ArgRef, TensorMeta)],
        outputs: &'a [(ArgRef, TensorMeta)],
        parallel_num: usize,
    ) -> Self {
        SbpContext {
            op_name,
            attrs,
            inputs,
            outputs,
            parallel_num,
            pending: Vec::new(),
        }
    }

    pub fn op_name(&self) -> &str {
        self.op_name
    }

    pub fn parallel_num(&self) -> usize {
        self.parallel_num
    }

    pub fn logical_input(&self, name: &str, index: usize) -> Result<&'a TensorMeta> {
        find_meta(self.op_name, self.inputs, name, index)
    }

    pub fn logical_output(&self, name: &str, index: usize) -> Result<&'a TensorMeta> {
        find_meta(self.op_name, self.outputs, name, index)
    }

    pub fn attr(&self, name: &str) -> Result<&'a AttrValue> {
        lookup_attr(self.op_name, self.attrs, name)
    }

    pub fn attr_ints(&self, name: &str) -> Result<&'a [i64]> {
        let v = self.attr(name)?;
        v.as_ints()
            .ok_or_else(|| wrong_kind(self.op_name, name, AttrKind::Ints, v))
    }

    pub fn attr_bool(&self, name: &str) -> Result<bool> {
        let v = self.attr(name)?;
        v.as_bool()
            .ok_or_else(|| wrong_kind(self.op_name, name, AttrKind::Bool, v))
    }

    /// Start a candidate. Nothing is recorded until [`SignatureBuilder::build`].
    pub fn new_builder(&mut self) -> SignatureBuilder<'_> {
        SignatureBuilder {
            inputs: self.inputs,
            outputs: self.outputs,
            candidate: PendingSignature {
                inputs: vec![None; self.inputs.len()],
                outputs: vec![None; self.outputs.len()],
                unknown: Vec::new(),
            },
            sink: &mut self.pending,
        }
    }

    fn finish(self) -> Result<Vec<SbpSignature>> {
        let mut signatures: Vec<SbpSignature> = Vec::with_capacity(self.pending.len());
        for (n, pending) in self.pending.into_iter().enumerate() {
            if let Some(name) = pending.unknown.first() {
                return Err(GraphError::InvalidSignature {
                    op: self.op_name.to_string(),
                    reason: format!("candidate {} names unknown argument '{}'", n, name),
                });
            }
            let resolve = |slots: &[(ArgRef, TensorMeta)], policies: Vec<Option<Distribute>>| {
                slots
                    .iter()
                    .zip(policies)
                    .map(|((arg, _), policy)| {
                        policy
                            .map(|p| (arg.clone(), p))
                            .ok_or_else(|| GraphError::InvalidSignature {
                                op: self.op_name.to_string(),
                                reason: format!("candidate {} leaves '{}' without a policy", n, arg),
                            })
                    })
                    .collect::<Result<Vec<_>>>()
            };
            let signature = SbpSignature {
                inputs: resolve(self.inputs, pending.inputs)?,
                outputs: resolve(self.outputs, pending.outputs)?,
            };
            if !signatures.contains(&signature) {
                signatures.push(signature);
            }
        }
        Ok(signatures)
    }
}

fn find_meta<'m>(
    op: &str,
    slots: &'m [(ArgRef, TensorMeta)],
    name: &str,
    index: usize,
) -> Result<&'m TensorMeta> {
    slots
        .iter()
        .find(|(a, _)| a.name == name && a.index == index)
        .map(|(_, m)| m)
        .ok_or_else(|| GraphError::UnknownArg {
            op: op.to_string(),
            arg: ArgRef::new(name, index).to_string(),
        })
}

/// Assigns a policy to each slot of one candidate signature.
pub struct SignatureBuilder<'c> {
    inputs: &'c [(ArgRef, TensorMeta)],
    outputs: &'c [(ArgRef, TensorMeta)],
    candidate: PendingSignature,
    sink: &'c mut Vec<PendingSignature>,
}

impl SignatureBuilder<'_> {
    pub fn split_inputs(self, axis: usize) -> Self {
        self.all_inputs(Distribute::Split(axis))
    }

    pub fn split_outputs(self, axis: usize) -> Self {
        self.all_outputs(Distribute::Split(axis))
    }

    pub fn broadcast_inputs(self) -> Self {
        self.all_inputs(Distribute::Broadcast)
    }

    pub fn broadcast_outputs(self) -> Self {
        self.all_outputs(Distribute::Broadcast)
    }

    pub fn partial_sum_inputs(self) -> Self {
        self.all_inputs(Distribute::PartialSum)
    }

    pub fn partial_sum_outputs(self) -> Self {
        self.all_outputs(Distribute::PartialSum)
    }

    /// Split every slot of argument `name` along `axis`.
    pub fn split(self, name: &str, axis: usize) -> Self {
        self.named(name, Distribute::Split(axis))
    }

    pub fn broadcast(self, name: &str) -> Self {
        self.named(name, Distribute::Broadcast)
    }

    pub fn partial_sum(self, name: &str) -> Self {
        self.named(name, Distribute::PartialSum)
    }

    /// Record the candidate.
    pub fn build(self) {
        self.sink.push(self.candidate);
    }

    fn all_inputs(mut self, policy: Distribute) -> Self {
        self.candidate.inputs.fill(Some(policy));
        self
    }

    fn all_outputs(mut self, policy: Distribute) -> Self {
        self.candidate.outputs.fill(Some(policy));
        self
    }

    fn named(mut self, name: &str, policy: Distribute) -> Self {
        let mut found = false;
        for (slot, (arg, _)) in self.candidate.inputs.iter_mut().zip(self.inputs) {
            if arg.name == name {
                *slot = Some(policy);
                found = true;
            }
        }
        for (slot, (arg, _)) in self.candidate.outputs.iter_mut().zip(self.outputs) {
            if arg.name == name {
                *slot = Some(policy);
                found = true;
            }
        }
        if !found {
            self.candidate.unknown.push(name.to_string());
        }
        self
    }
}

/// Split inputs and outputs together on every axis of `reference` accepted by
/// `filter`, in ascending axis order.
pub fn axis_scan(
    ctx: &mut SbpContext<'_>,
    reference: &str,
    filter: Option<AxisFilter>,
) -> Result<()> {
    let rank = ctx.logical_input(reference, 0)?.shape.ndim();
    for axis in 0..rank {
        let eligible = match filter {
            Some(f) => f(&*ctx, axis)?,
            None => true,
        };
        if eligible {
            ctx.new_builder().split_inputs(axis).split_outputs(axis).build();
        }
    }
    Ok(())
}

/// Every candidate signature `registration` offers for these logical metas,
/// in emission order with duplicates removed.
pub fn candidate_signatures(
    registration: &OpRegistration,
    op_name: &str,
    attrs: &AttrMap,
    inputs: &[(ArgRef, TensorMeta)],
    outputs: &[(ArgRef, TensorMeta)],
    parallel_num: usize,
) -> Result<Vec<SbpSignature>> {
    let mut ctx = SbpContext::new(op_name, attrs, inputs, outputs, parallel_num);
    match registration.sbp_rule() {
        SbpRule::AxisScan { reference, filter } => axis_scan(&mut ctx, reference, *filter)?,
        SbpRule::Custom(f) => f(&mut ctx)?,
    }
    let candidates = ctx.finish()?;
    for c in &candidates {
        trace!(op = op_name, candidate = %c, "sbp candidate");
    }
    Ok(candidates)
}

/// Checks that every split slot can give each device at least one element.
pub fn check_feasible(
    signature: &SbpSignature,
    inputs: &[(ArgRef, TensorMeta)],
    outputs: &[(ArgRef, TensorMeta)],
    parallel_num: usize,
) -> std::result::Result<(), String> {
    let slots = inputs
        .iter()
        .map(|(arg, meta)| (arg, meta, signature.input(arg)))
        .chain(
            outputs
                .iter()
                .map(|(arg, meta)| (arg, meta, signature.output(arg))),
        );
    for (arg, meta, policy) in slots {
        let policy = policy.ok_or_else(|| format!("{}: no policy", arg))?;
        policy
            .ensure_splittable(&meta.shape, parallel_num)
            .map_err(|e| format!("{}: {}", arg, e))?;
    }
    Ok(())
}

/// Re-run shape inference on every device's physical input shards and check
/// that each output shard is exactly what `signature` derives from the
/// logical output.
pub fn verify_recombination(
    registration: &OpRegistration,
    op_name: &str,
    attrs: &AttrMap,
    inputs: &[(ArgRef, TensorMeta)],
    outputs: &[(ArgRef, TensorMeta)],
    signature: &SbpSignature,
    parallel_num: usize,
) -> Result<()> {
    let invalid = |reason: String| GraphError::InvalidSignature {
        op: op_name.to_string(),
        reason: format!("{} does not recombine: {}", signature, reason),
    };

    for device in 0..parallel_num {
        let mut shard_inputs = Vec::with_capacity(inputs.len());
        for (arg, meta) in inputs {
            let policy = signature
                .input(arg)
                .ok_or_else(|| invalid(format!("no policy for '{}'", arg)))?;
            let mut shard = meta.clone();
            shard.shape = policy.physical_shape(&meta.shape, parallel_num, device)?;
            shard_inputs.push((arg.clone(), shard));
        }

        let shard_outputs = infer_op(registration, op_name, attrs, &shard_inputs)
            .map_err(|e| invalid(format!("device {} inference failed: {}", device, e)))?;

        for ((arg, logical), (_, shard)) in outputs.iter().zip(&shard_outputs) {
            let policy = signature
                .output(arg)
                .ok_or_else(|| invalid(format!("no policy for '{}'", arg)))?;
            let expected = policy.physical_shape(&logical.shape, parallel_num, device)?;
            if shard.shape != expected {
                return Err(invalid(format!(
                    "device {} computes {} for '{}' but {} of {} is {}",
                    device, shard.shape, arg, policy, logical.shape, expected
                )));
            }
            if shard.dtype != logical.dtype {
                return Err(invalid(format!(
                    "device {} computes dtype {} for '{}', logical dtype is {}",
                    device, shard.dtype, arg, logical.dtype
                )));
            }
        }
    }
    Ok(())
}

/// How the caller wants the signature chosen.
#[derive(Debug, Clone, Copy)]
pub enum SignatureRequest<'s> {
    /// First feasible candidate, preferring one that consumes the inputs in
    /// the layout their producers already have.
    Auto,
    /// Like `Auto`, but a candidate whose outputs all carry this policy is
    /// ranked ahead of the producer match.
    PreferOutputs(Distribute),
    /// This exact signature, which must be a feasible candidate.
    Explicit(&'s SbpSignature),
}

/// Pick the signature an op runs under.
///
/// A single-device group always runs fully broadcast. On more devices nothing
/// is downgraded: when no candidate is feasible the op cannot be placed.
///
/// Automatic selection ranks feasible candidates in this order: preferred
/// outputs together with the producer layout, preferred outputs alone, the
/// producer layout alone, and finally the first feasible candidate.
pub fn select_signature(
    op_name: &str,
    candidates: &[SbpSignature],
    inputs: &[(ArgRef, TensorMeta)],
    outputs: &[(ArgRef, TensorMeta)],
    producer_policies: &[(ArgRef, Distribute)],
    parallel_num: usize,
    request: SignatureRequest<'_>,
) -> Result<SbpSignature> {
    let input_args: Vec<ArgRef> = inputs.iter().map(|(a, _)| a.clone()).collect();
    let output_args: Vec<ArgRef> = outputs.iter().map(|(a, _)| a.clone()).collect();

    if parallel_num == 1 {
        let trivial = SbpSignature::broadcast_all(&input_args, &output_args);
        return match request {
            SignatureRequest::Auto | SignatureRequest::PreferOutputs(_) => Ok(trivial),
            SignatureRequest::Explicit(sig) if *sig == trivial || candidates.contains(sig) => {
                Ok(sig.clone())
            }
            SignatureRequest::Explicit(sig) => Err(GraphError::InvalidSignature {
                op: op_name.to_string(),
                reason: format!("{} is not a legal candidate", sig),
            }),
        };
    }

    let mut feasible = Vec::new();
    let mut rejected = Vec::new();
    for c in candidates {
        match check_feasible(c, inputs, outputs, parallel_num) {
            Ok(()) => feasible.push(c),
            Err(reason) => rejected.push(format!("{} rejected ({})", c, reason)),
        }
    }

    let infeasible = |reason: String| GraphError::SignatureInfeasible {
        op: op_name.to_string(),
        parallel_num,
        reason,
    };

    match request {
        SignatureRequest::Explicit(sig) => {
            if !candidates.contains(sig) {
                return Err(GraphError::InvalidSignature {
                    op: op_name.to_string(),
                    reason: format!("{} is not a legal candidate", sig),
                });
            }
            if !feasible.contains(&sig) {
                let reason = check_feasible(sig, inputs, outputs, parallel_num)
                    .err()
                    .unwrap_or_default();
                return Err(infeasible(format!("requested {}: {}", sig, reason)));
            }
            Ok(sig.clone())
        }
        SignatureRequest::Auto | SignatureRequest::PreferOutputs(_) => {
            if candidates.is_empty() {
                return Err(infeasible("op offers no candidate signatures".to_string()));
            }
            if feasible.is_empty() {
                return Err(infeasible(rejected.join("; ")));
            }
            let matches_producers = |sig: &SbpSignature| {
                producer_policies
                    .iter()
                    .all(|(arg, policy)| sig.input(arg) == Some(*policy))
            };
            let matches_outputs = |sig: &SbpSignature| match request {
                SignatureRequest::PreferOutputs(policy) => {
                    output_args.iter().all(|arg| sig.output(arg) == Some(policy))
                }
                _ => false,
            };
            let chosen = feasible
                .iter()
                .copied()
                .find(|&s| matches_outputs(s) && matches_producers(s))
                .or_else(|| feasible.iter().copied().find(|&s| matches_outputs(s)))
                .or_else(|| feasible.iter().copied().find(|&s| matches_producers(s)))
                .or_else(|| feasible.first().copied())
                .cloned()
                .ok_or_else(|| infeasible("no feasible candidate".to_string()))?;
            debug!(
                op = op_name,
                signature = %chosen,
                feasible = feasible.len(),
                rejected = rejected.len(),
                "selected sbp signature"
            );
            Ok(chosen)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OpRegistry;
    use sbp_tensor::{DType, Shape};

    fn slot(name: &str, dims: &[usize]) -> (ArgRef, TensorMeta) {
        (
            ArgRef::new(name, 0),
            TensorMeta::new(Shape::from(dims), DType::Float32),
        )
    }

    fn pad_attrs(padding: Vec<i64>) -> AttrMap {
        let mut attrs = AttrMap::new();
        attrs.insert("padding", padding);
        attrs
    }

    fn pad_candidates(x: &[usize], padding: Vec<i64>) -> Vec<SbpSignature> {
        let registry = OpRegistry::with_builtin().unwrap();
        let reg = registry.get("reflection_pad2d").unwrap();
        let attrs = pad_attrs(padding);
        let inputs = vec![slot("x", x)];
        let outputs = infer_op(reg, "pad", &attrs, &inputs).unwrap();
        candidate_signatures(reg, "pad", &attrs, &inputs, &outputs, 2).unwrap()
    }

    #[test]
    fn test_axis_scan_skips_padded_axes() {
        let candidates = pad_candidates(&[2, 3, 8, 8], vec![0, 0, 2, 3]);
        let axes: Vec<Option<usize>> = candidates
            .iter()
            .map(|c| c.input(&ArgRef::new("x", 0)).and_then(|d| d.split_axis()))
            .collect();
        assert_eq!(axes, vec![Some(0), Some(1)]);
        for c in &candidates {
            assert_eq!(c.input(&ArgRef::new("x", 0)), c.output(&ArgRef::new("y", 0)));
        }
    }

    #[test]
    fn test_axis_scan_includes_unpadded_spatial_axis() {
        let candidates = pad_candidates(&[2, 3, 8, 8], vec![0, 0, 0, 3]);
        let axes: Vec<usize> = candidates
            .iter()
            .filter_map(|c| c.output(&ArgRef::new("y", 0)).and_then(|d| d.split_axis()))
            .collect();
        assert_eq!(axes, vec![0, 1, 2]);
    }

    #[test]
    fn test_axis_scan_skips_padded_batch_axis() {
        let candidates = pad_candidates(&[4, 4, 8, 8], vec![1, 0, 0, 3]);
        let axes: Vec<usize> = candidates
            .iter()
            .filter_map(|c| c.input(&ArgRef::new("x", 0)).and_then(|d| d.split_axis()))
            .collect();
        assert_eq!(axes, vec![1, 2]);
    }

    #[test]
    fn test_candidate_order_is_deterministic() {
        let a = pad_candidates(&[4, 4, 6, 6], vec![0, 0, 1, 1]);
        let b = pad_candidates(&[4, 4, 6, 6], vec![0, 0, 1, 1]);
        let a: Vec<String> = a.iter().map(|s| s.to_string()).collect();
        let b: Vec<String> = b.iter().map(|s| s.to_string()).collect();
        assert_eq!(a, b);
        assert_eq!(a[0], "(x_0: S(0)) -> (y_0: S(0))");
    }

    fn incomplete_sbp(ctx: &mut SbpContext<'_>) -> Result<()> {
        ctx.new_builder().split_inputs(0).build();
        Ok(())
    }

    fn unknown_arg_sbp(ctx: &mut SbpContext<'_>) -> Result<()> {
        ctx.new_builder().split("z", 0).split_inputs(0).split_outputs(0).build();
        Ok(())
    }

    fn identity_infer(ctx: &mut crate::infer::InferContext<'_>) -> Result<()> {
        let shape = ctx.input_shape("x", 0)?.clone();
        let dtype = ctx.input_dtype("x", 0)?;
        ctx.set_output_shape("y", 0, shape)?;
        ctx.set_output_dtype("y", 0, dtype)
    }

    #[test]
    fn test_incomplete_candidate_rejected() {
        for f in [incomplete_sbp as crate::registry::SbpFn, unknown_arg_sbp] {
            let reg = OpRegistration::builder("identity")
                .input("x")
                .output("y")
                .infer(identity_infer)
                .sbp(f)
                .finish()
                .unwrap();
            let inputs = vec![slot("x", &[4])];
            let outputs = vec![slot("y", &[4])];
            let err =
                candidate_signatures(&reg, "id", &AttrMap::new(), &inputs, &outputs, 2).unwrap_err();
            assert!(matches!(err, GraphError::InvalidSignature { .. }));
        }
    }

    #[test]
    fn test_signature_equality_ignores_order() {
        let a = SbpSignature::new(
            vec![
                (ArgRef::new("a", 0), Distribute::Split(0)),
                (ArgRef::new("b", 0), Distribute::Broadcast),
            ],
            vec![(ArgRef::new("out", 0), Distribute::Split(0))],
        );
        let b = SbpSignature::new(
            vec![
                (ArgRef::new("b", 0), Distribute::Broadcast),
                (ArgRef::new("a", 0), Distribute::Split(0)),
            ],
            vec![(ArgRef::new("out", 0), Distribute::Split(0))],
        );
        let c = SbpSignature::new(
            vec![(ArgRef::new("a", 0), Distribute::Split(0))],
            vec![(ArgRef::new("out", 0), Distribute::Split(0))],
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_select_rejects_too_small_split() {
        let inputs = vec![slot("x", &[3, 8])];
        let outputs = vec![slot("y", &[3, 8])];
        let split0 = SbpSignature::new(
            vec![(ArgRef::new("x", 0), Distribute::Split(0))],
            vec![(ArgRef::new("y", 0), Distribute::Split(0))],
        );
        let err = select_signature(
            "op",
            &[split0.clone()],
            &inputs,
            &outputs,
            &[],
            4,
            SignatureRequest::Auto,
        )
        .unwrap_err();
        match err {
            GraphError::SignatureInfeasible {
                parallel_num,
                reason,
                ..
            } => {
                assert_eq!(parallel_num, 4);
                assert!(reason.contains("cannot split axis 0 of extent 3 across 4 devices"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let split1 = SbpSignature::new(
            vec![(ArgRef::new("x", 0), Distribute::Split(1))],
            vec![(ArgRef::new("y", 0), Distribute::Split(1))],
        );
        let chosen = select_signature(
            "op",
            &[split0, split1.clone()],
            &inputs,
            &outputs,
            &[],
            4,
            SignatureRequest::Auto,
        )
        .unwrap();
        assert_eq!(chosen, split1);
    }

    #[test]
    fn test_select_prefers_producer_layout() {
        let inputs = vec![slot("x", &[8, 8])];
        let outputs = vec![slot("y", &[8, 8])];
        let sig = |axis| {
            SbpSignature::new(
                vec![(ArgRef::new("x", 0), Distribute::Split(axis))],
                vec![(ArgRef::new("y", 0), Distribute::Split(axis))],
            )
        };
        let candidates = [sig(0), sig(1)];
        let chosen = select_signature(
            "op",
            &candidates,
            &inputs,
            &outputs,
            &[(ArgRef::new("x", 0), Distribute::Split(1))],
            2,
            SignatureRequest::Auto,
        )
        .unwrap();
        assert_eq!(chosen, sig(1));

        // no candidate matches a broadcast producer: first feasible wins
        let chosen = select_signature(
            "op",
            &candidates,
            &inputs,
            &outputs,
            &[(ArgRef::new("x", 0), Distribute::Broadcast)],
            2,
            SignatureRequest::Auto,
        )
        .unwrap();
        assert_eq!(chosen, sig(0));
    }

    #[test]
    fn test_select_preferred_output_outranks_producer() {
        let inputs = vec![slot("a", &[8, 4]), slot("b", &[8, 6])];
        let outputs = vec![slot("out", &[4, 6])];
        let sig = |a, b, out| {
            SbpSignature::new(
                vec![(ArgRef::new("a", 0), a), (ArgRef::new("b", 0), b)],
                vec![(ArgRef::new("out", 0), out)],
            )
        };
        let split_rows = sig(Distribute::Split(1), Distribute::Broadcast, Distribute::Split(0));
        let partial = sig(Distribute::Split(0), Distribute::Split(0), Distribute::PartialSum);
        let candidates = [split_rows.clone(), partial.clone()];
        let producers = [
            (ArgRef::new("a", 0), Distribute::Split(1)),
            (ArgRef::new("b", 0), Distribute::Broadcast),
        ];

        let chosen = select_signature(
            "op",
            &candidates,
            &inputs,
            &outputs,
            &producers,
            2,
            SignatureRequest::Auto,
        )
        .unwrap();
        assert_eq!(chosen, split_rows);

        let chosen = select_signature(
            "op",
            &candidates,
            &inputs,
            &outputs,
            &producers,
            2,
            SignatureRequest::PreferOutputs(Distribute::PartialSum),
        )
        .unwrap();
        assert_eq!(chosen, partial);

        // an unattainable preference falls back to the producer match
        let chosen = select_signature(
            "op",
            &candidates,
            &inputs,
            &outputs,
            &producers,
            2,
            SignatureRequest::PreferOutputs(Distribute::Split(1)),
        )
        .unwrap();
        assert_eq!(chosen, split_rows);
    }

    #[test]
    fn test_select_explicit() {
        let inputs = vec![slot("x", &[8, 8])];
        let outputs = vec![slot("y", &[8, 8])];
        let legal = SbpSignature::new(
            vec![(ArgRef::new("x", 0), Distribute::Split(1))],
            vec![(ArgRef::new("y", 0), Distribute::Split(1))],
        );
        let illegal = SbpSignature::new(
            vec![(ArgRef::new("x", 0), Distribute::Split(0))],
            vec![(ArgRef::new("y", 0), Distribute::Broadcast)],
        );
        let candidates = [legal.clone()];
        let chosen = select_signature(
            "op",
            &candidates,
            &inputs,
            &outputs,
            &[],
            2,
            SignatureRequest::Explicit(&legal),
        )
        .unwrap();
        assert_eq!(chosen, legal);

        let err = select_signature(
            "op",
            &candidates,
            &inputs,
            &outputs,
            &[],
            2,
            SignatureRequest::Explicit(&illegal),
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidSignature { .. }));
    }

    #[test]
    fn test_single_device_is_broadcast() {
        let inputs = vec![slot("x", &[8])];
        let outputs = vec![slot("y", &[8])];
        let chosen =
            select_signature("op", &[], &inputs, &outputs, &[], 1, SignatureRequest::Auto).unwrap();
        assert_eq!(chosen.input(&ArgRef::new("x", 0)), Some(Distribute::Broadcast));
        assert_eq!(chosen.output(&ArgRef::new("y", 0)), Some(Distribute::Broadcast));
    }

    #[test]
    fn test_no_candidates_on_many_devices() {
        let inputs = vec![slot("x", &[8])];
        let outputs = vec![slot("y", &[8])];
        let err = select_signature("op", &[], &inputs, &outputs, &[], 2, SignatureRequest::Auto)
            .unwrap_err();
        assert!(matches!(err, GraphError::SignatureInfeasible { .. }));
    }

    #[test]
    fn test_verify_recombination_catches_padded_split() {
        let registry = OpRegistry::with_builtin().unwrap();
        let reg = registry.get("reflection_pad2d").unwrap();
        let attrs = pad_attrs(vec![0, 0, 2, 2]);
        let inputs = vec![slot("x", &[2, 3, 8, 8])];
        let outputs = infer_op(reg, "pad", &attrs, &inputs).unwrap();

        for c in candidate_signatures(reg, "pad", &attrs, &inputs, &outputs, 2).unwrap() {
            verify_recombination(reg, "pad", &attrs, &inputs, &outputs, &c, 2).unwrap();
        }

        // splitting a padded axis would need halo exchange
        let bad = SbpSignature::new(
            vec![(ArgRef::new("x", 0), Distribute::Split(2))],
            vec![(ArgRef::new("y", 0), Distribute::Split(2))],
        );
        let err = verify_recombination(reg, "pad", &attrs, &inputs, &outputs, &bad, 2).unwrap_err();
        assert!(matches!(err, GraphError::InvalidSignature { .. }));
    }
}
