use std::fmt;

use crate::error::{Result, TensorError};
use crate::shape::Shape;
use crate::split::BalancedSplitter;

/// How a logical tensor is laid out across the devices of its parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distribute {
    /// Each device holds a contiguous slice along the given axis.
    Split(usize),
    /// Each device holds a full copy.
    Broadcast,
    /// Each device holds a full-shaped partial value; the logical tensor is
    /// the element-wise sum over devices.
    PartialSum,
}

impl Distribute {
    /// The split axis, or `None` for broadcast and partial sum.
    pub fn split_axis(&self) -> Option<usize> {
        match self {
            Distribute::Split(axis) => Some(*axis),
            _ => None,
        }
    }

    /// Whether each device holds a slice along some axis.
    pub fn is_split(&self) -> bool {
        matches!(self, Distribute::Split(_))
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Distribute::Broadcast)
    }

    pub fn is_partial_sum(&self) -> bool {
        matches!(self, Distribute::PartialSum)
    }

    /// Policy of the gradient flowing back into a tensor laid out as `self`.
    ///
    /// A split input receives a gradient split the same way. A broadcast input
    /// contributes to every device's result, so its gradient is a partial sum,
    /// and a partial-sum input's gradient is broadcast.
    pub fn gradient_dual(&self) -> Distribute {
        match self {
            Distribute::Split(axis) => Distribute::Split(*axis),
            Distribute::Broadcast => Distribute::PartialSum,
            Distribute::PartialSum => Distribute::Broadcast,
        }
    }

    /// Shape seen by device `index` of `parallel_num` devices.
    pub fn physical_shape(
        &self,
        logical: &Shape,
        parallel_num: usize,
        index: usize,
    ) -> Result<Shape> {
        match self {
            Distribute::Split(axis) => {
                let extent = logical.at(*axis)?;
                let range = BalancedSplitter::new(extent, parallel_num).at(index);
                logical.with_dim(*axis, range.len())
            }
            Distribute::Broadcast | Distribute::PartialSum => Ok(logical.clone()),
        }
    }

    /// Checks that every device gets a non-empty slice.
    pub fn ensure_splittable(&self, logical: &Shape, parallel_num: usize) -> Result<()> {
        if let Distribute::Split(axis) = self {
            let extent = logical.at(*axis)?;
            if extent < parallel_num {
                return Err(TensorError::SplitTooSmall {
                    axis: *axis,
                    extent,
                    parts: parallel_num,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Distribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribute::Split(axis) => write!(f, "S({})", axis),
            Distribute::Broadcast => write!(f, "B"),
            Distribute::PartialSum => write!(f, "P"),
        }
    }
}
