//! Logical ("consistent") tensor descriptors, their per-device physical
//! shards, and the arena that owns both.
//!
//! A [`LogicalTensorDesc`] is the placement-independent view of a tensor. Once
//! its [`Distribute`] policy is resolved it owns one [`PhysicalTensorDesc`] per
//! device of its parallel group. Descriptors refer to their group and to each
//! other through arena ids, never through shared handles.

use std::fmt;

use tracing::warn;

use crate::distribute::Distribute;
use crate::dtype::DType;
use crate::error::{Result, TensorError};
use crate::parallel::{DeviceId, ParallelConf, ParallelGroup};
use crate::shape::Shape;

/// Graph-scoped id of a logical tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogicalId(pub usize);

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Graph-scoped id of an interned parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub usize);

/// Whether a tensor is one logical tensor spread over the group, or an
/// independent tensor per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlacementKind {
    #[default]
    Consistent,
    Mirrored,
}

/// Whether descriptors describe a graph being compiled or values computed
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EvalMode {
    #[default]
    Lazy,
    Eager,
}

/// Everything shape inference knows about a logical tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    pub shape: Shape,
    pub dtype: DType,
    /// The shape is an upper bound resolved per run.
    pub is_dynamic: bool,
    /// The tensor is a ragged collection of independently shaped elements.
    pub is_tensor_list: bool,
    /// Axis treated as the batch dimension, if any.
    pub batch_axis: Option<usize>,
}

impl TensorMeta {
    pub fn new(shape: Shape, dtype: DType) -> Self {
        TensorMeta {
            shape,
            dtype,
            is_dynamic: false,
            is_tensor_list: false,
            batch_axis: None,
        }
    }

    pub fn with_batch_axis(mut self, axis: Option<usize>) -> Self {
        self.batch_axis = axis;
        self
    }
}

/// One device's shard of a logical tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalTensorDesc {
    pub logical: LogicalId,
    pub device_index: usize,
    pub device: DeviceId,
    pub shape: Shape,
}

/// The single, placement-independent view of a tensor.
#[derive(Debug, Clone)]
pub struct LogicalTensorDesc {
    id: LogicalId,
    name: String,
    meta: TensorMeta,
    group: GroupId,
    placement: PlacementKind,
    mode: EvalMode,
    distribute: Option<Distribute>,
    physical: Vec<PhysicalTensorDesc>,
}

impl LogicalTensorDesc {
    pub fn id(&self) -> LogicalId {
        self.id
    }

    /// Unique name, `"op_name/arg_index"` for operator outputs.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    /// The logical shape. Available before placement is resolved.
    pub fn logical_shape(&self) -> &Shape {
        &self.meta.shape
    }

    /// The shape a caller of this tensor sees: the logical shape for
    /// consistent tensors, device 0's shard for mirrored ones.
    ///
    /// # Panics
    /// Panics if the distribute policy has not been resolved yet.
    pub fn shape(&self) -> &Shape {
        match self.try_shape() {
            Ok(shape) => {
                if let Some(msg) = self.shape_warning() {
                    warn!(tensor = %self.name, "{}", msg);
                }
                shape
            }
            Err(e) => panic!("{}", e),
        }
    }

    /// Like [`shape`](Self::shape) but returns `Unresolved` instead of
    /// panicking.
    pub fn try_shape(&self) -> Result<&Shape> {
        if self.distribute.is_none() {
            return Err(TensorError::Unresolved(self.name.clone()));
        }
        match self.placement {
            PlacementKind::Consistent => Ok(&self.meta.shape),
            PlacementKind::Mirrored => self
                .physical
                .first()
                .map(|p| &p.shape)
                .ok_or_else(|| TensorError::Unresolved(self.name.clone())),
        }
    }

    /// Warning attached to `shape()` for this placement/mode combination.
    pub fn shape_warning(&self) -> Option<String> {
        match (self.mode, self.placement) {
            (EvalMode::Eager, _) => None,
            (EvalMode::Lazy, PlacementKind::Mirrored) => Some(format!(
                "mirrored tensor shape is the shard on device 0 of {}",
                self.physical.len()
            )),
            (EvalMode::Lazy, PlacementKind::Consistent) if self.meta.is_dynamic => {
                Some("dynamic tensor shape is a static upper bound".to_string())
            }
            (EvalMode::Lazy, PlacementKind::Consistent) => None,
        }
    }

    /// Element type, shared by every shard.
    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    pub fn is_dynamic(&self) -> bool {
        self.meta.is_dynamic
    }

    pub fn is_tensor_list(&self) -> bool {
        self.meta.is_tensor_list
    }

    pub fn batch_axis(&self) -> Option<usize> {
        self.meta.batch_axis
    }

    /// Split axis of the resolved policy. `None` while unresolved or when not
    /// split.
    pub fn split_axis(&self) -> Option<usize> {
        self.distribute.and_then(|d| d.split_axis())
    }

    /// Resolved policy, `None` until the producing op has been placed.
    pub fn distribute(&self) -> Option<Distribute> {
        self.distribute
    }

    /// Group the tensor lives on. Look it up with [`TensorArena::group`].
    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn placement(&self) -> PlacementKind {
        self.placement
    }

    pub fn mode(&self) -> EvalMode {
        self.mode
    }

    /// Per-device shards in group order.
    pub fn physical_descs(&self) -> Result<&[PhysicalTensorDesc]> {
        if self.distribute.is_none() {
            return Err(TensorError::Unresolved(self.name.clone()));
        }
        Ok(&self.physical)
    }

    /// Same layout on the same devices: meta, group, placement and policy
    /// all equal. Ids and names are ignored.
    pub fn identical_to(&self, other: &LogicalTensorDesc) -> bool {
        self.meta == other.meta
            && self.group == other.group
            && self.placement == other.placement
            && self.distribute == other.distribute
    }
}

/// Owner of every logical descriptor and parallel group of one graph.
#[derive(Debug, Default, Clone)]
pub struct TensorArena {
    groups: Vec<ParallelGroup>,
    tensors: Vec<LogicalTensorDesc>,
}

impl TensorArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id of an equal group, adding it if not seen before.
    pub fn intern_group(&mut self, group: &ParallelGroup) -> GroupId {
        if let Some(i) = self.groups.iter().position(|g| g == group) {
            return GroupId(i);
        }
        self.groups.push(group.clone());
        GroupId(self.groups.len() - 1)
    }

    /// The group behind `id`.
    ///
    /// # Panics
    /// Panics if `id` was not issued by this arena.
    pub fn group(&self, id: GroupId) -> &ParallelGroup {
        &self.groups[id.0]
    }

    /// Add an unresolved logical descriptor.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        meta: TensorMeta,
        group: GroupId,
        placement: PlacementKind,
        mode: EvalMode,
    ) -> LogicalId {
        let id = LogicalId(self.tensors.len());
        self.tensors.push(LogicalTensorDesc {
            id,
            name: name.into(),
            meta,
            group,
            placement,
            mode,
            distribute: None,
            physical: Vec::new(),
        });
        id
    }

    /// Descriptor of `id`, or `UnknownTensor` for a foreign id.
    pub fn get(&self, id: LogicalId) -> Result<&LogicalTensorDesc> {
        self.tensors.get(id.0).ok_or(TensorError::UnknownTensor(id.0))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalTensorDesc> {
        self.tensors.iter()
    }

    /// Set the policy of `id` and rebuild its physical shards from scratch.
    pub fn resolve(&mut self, id: LogicalId, policy: Distribute) -> Result<()> {
        let desc = self
            .tensors
            .get(id.0)
            .ok_or(TensorError::UnknownTensor(id.0))?;
        let group = &self.groups[desc.group.0];
        let n = group.parallel_num();
        let physical = group
            .devices()
            .iter()
            .enumerate()
            .map(|(index, device)| -> Result<PhysicalTensorDesc> {
                Ok(PhysicalTensorDesc {
                    logical: id,
                    device_index: index,
                    device: *device,
                    shape: policy.physical_shape(&desc.meta.shape, n, index)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let desc = &mut self.tensors[id.0];
        desc.distribute = Some(policy);
        desc.physical = physical;
        Ok(())
    }

    /// Serialized parallel group of tensor `id`.
    pub fn parallel_conf(&self, id: LogicalId) -> Result<ParallelConf> {
        let desc = self.get(id)?;
        Ok(self.group(desc.group).to_conf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::DeviceKind;

    fn arena_with(
        shape: [usize; 2],
        n: u32,
        placement: PlacementKind,
        mode: EvalMode,
    ) -> (TensorArena, LogicalId) {
        let mut arena = TensorArena::new();
        let g = arena.intern_group(&ParallelGroup::local(DeviceKind::Gpu, n).unwrap());
        let id = arena.push(
            "x",
            TensorMeta::new(Shape::from(shape), DType::Float32),
            g,
            placement,
            mode,
        );
        (arena, id)
    }

    #[test]
    fn test_split_sub_descriptors() {
        let (mut arena, id) =
            arena_with([10, 4], 4, PlacementKind::Consistent, EvalMode::Lazy);
        arena.resolve(id, Distribute::Split(0)).unwrap();
        let desc = arena.get(id).unwrap();
        let shapes: Vec<Vec<usize>> = desc
            .physical_descs()
            .unwrap()
            .iter()
            .map(|p| p.shape.dims().to_vec())
            .collect();
        assert_eq!(shapes, vec![vec![3, 4], vec![3, 4], vec![2, 4], vec![2, 4]]);
        assert_eq!(desc.shape().dims(), &[10, 4]);
        assert_eq!(desc.split_axis(), Some(0));
        let devices: Vec<usize> = desc
            .physical_descs()
            .unwrap()
            .iter()
            .map(|p| p.device_index)
            .collect();
        assert_eq!(devices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_resolve_replaces_physical() {
        let (mut arena, id) =
            arena_with([6, 2], 3, PlacementKind::Consistent, EvalMode::Lazy);
        arena.resolve(id, Distribute::Split(0)).unwrap();
        arena.resolve(id, Distribute::Broadcast).unwrap();
        let desc = arena.get(id).unwrap();
        assert_eq!(desc.physical_descs().unwrap().len(), 3);
        assert!(desc
            .physical_descs()
            .unwrap()
            .iter()
            .all(|p| p.shape.dims() == [6, 2]));
        assert_eq!(desc.split_axis(), None);
    }

    #[test]
    fn test_mirrored_shape_is_first_shard() {
        let (mut arena, id) =
            arena_with([7, 3], 2, PlacementKind::Mirrored, EvalMode::Lazy);
        arena.resolve(id, Distribute::Split(0)).unwrap();
        let desc = arena.get(id).unwrap();
        assert_eq!(desc.shape().dims(), &[4, 3]);
        assert_eq!(desc.logical_shape().dims(), &[7, 3]);
        assert!(desc.shape_warning().is_some());
    }

    #[test]
    fn test_eager_has_no_shape_warning() {
        let (mut arena, id) =
            arena_with([7, 3], 2, PlacementKind::Mirrored, EvalMode::Eager);
        arena.resolve(id, Distribute::Split(0)).unwrap();
        assert!(arena.get(id).unwrap().shape_warning().is_none());
    }

    #[test]
    fn test_unresolved_try_shape() {
        let (arena, id) = arena_with([2, 2], 1, PlacementKind::Consistent, EvalMode::Lazy);
        let desc = arena.get(id).unwrap();
        assert_eq!(
            desc.try_shape().unwrap_err(),
            TensorError::Unresolved("x".to_string())
        );
        assert!(desc.physical_descs().is_err());
    }

    #[test]
    #[should_panic(expected = "has no resolved distribute policy")]
    fn test_unresolved_shape_panics() {
        let (arena, id) = arena_with([2, 2], 1, PlacementKind::Consistent, EvalMode::Lazy);
        let _ = arena.get(id).unwrap().shape();
    }

    #[test]
    fn test_intern_group_dedupes() {
        let mut arena = TensorArena::new();
        let a = arena.intern_group(&ParallelGroup::local(DeviceKind::Gpu, 2).unwrap());
        let b = arena.intern_group(&ParallelGroup::parse("gpu", &["0:0-1"]).unwrap());
        let c = arena.intern_group(&ParallelGroup::single(DeviceKind::Cpu));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_identical_to_and_parallel_conf() {
        let (mut arena, x) = arena_with([4, 4], 2, PlacementKind::Consistent, EvalMode::Lazy);
        let g = arena.get(x).unwrap().group();
        let y = arena.push(
            "y",
            TensorMeta::new(Shape::from([4, 4]), DType::Float32),
            g,
            PlacementKind::Consistent,
            EvalMode::Lazy,
        );
        arena.resolve(x, Distribute::Split(1)).unwrap();
        arena.resolve(y, Distribute::Split(1)).unwrap();
        assert!(arena.get(x).unwrap().identical_to(arena.get(y).unwrap()));
        arena.resolve(y, Distribute::Broadcast).unwrap();
        assert!(!arena.get(x).unwrap().identical_to(arena.get(y).unwrap()));

        let conf = arena.parallel_conf(x).unwrap();
        assert_eq!(conf.device_tag, "gpu");
        assert_eq!(conf.device_names, vec!["0:0-1"]);
    }

    #[test]
    fn test_unknown_tensor() {
        let arena = TensorArena::new();
        assert_eq!(
            arena.get(LogicalId(3)).unwrap_err(),
            TensorError::UnknownTensor(3)
        );
    }
}
