//! Axis specifications shared by all normalisation layers.
//!
//! Axes name the feature dimensions: statistics are reduced over every other
//! dimension and parameters take the sizes of the listed ones. Specifications
//! may use negative indices and are only resolved once the input rank is known.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{NormError, Result};

/// A single axis or an ordered list of axes, possibly negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisSpec {
    Single(isize),
    Multiple(Vec<isize>),
}

impl Default for AxisSpec {
    fn default() -> Self {
        AxisSpec::Single(-1)
    }
}

impl From<isize> for AxisSpec {
    fn from(axis: isize) -> Self {
        AxisSpec::Single(axis)
    }
}

impl From<Vec<isize>> for AxisSpec {
    fn from(axes: Vec<isize>) -> Self {
        AxisSpec::Multiple(axes)
    }
}

// Plain integer literals default to `i32`.
impl From<i32> for AxisSpec {
    fn from(axis: i32) -> Self {
        AxisSpec::Single(axis as isize)
    }
}

impl From<Vec<i32>> for AxisSpec {
    fn from(axes: Vec<i32>) -> Self {
        AxisSpec::Multiple(axes.into_iter().map(|axis| axis as isize).collect())
    }
}

impl fmt::Display for AxisSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisSpec::Single(axis) => write!(f, "{axis}"),
            AxisSpec::Multiple(axes) => write!(f, "{axes:?}"),
        }
    }
}

impl AxisSpec {
    /// Axes as written by the caller.
    pub fn to_vec(&self) -> Vec<isize> {
        match self {
            AxisSpec::Single(axis) => vec![*axis],
            AxisSpec::Multiple(axes) => axes.clone(),
        }
    }

    /// Number of listed axes.
    pub fn len(&self) -> usize {
        match self {
            AxisSpec::Single(_) => 1,
            AxisSpec::Multiple(axes) => axes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the literal axis 0 (the batch dimension) is listed.
    pub fn names_batch_axis(&self) -> bool {
        self.to_vec().contains(&0)
    }

    /// Normalises negative indices against `rank` and validates the result.
    ///
    /// The caller's order is preserved.
    pub fn resolve(&self, rank: usize) -> Result<ResolvedAxes> {
        let raw = self.to_vec();
        if raw.is_empty() {
            return Err(NormError::config("axis list must not be empty"));
        }
        let signed_rank = rank as isize;
        let mut resolved = Vec::with_capacity(raw.len());
        for &axis in &raw {
            let normalised = if axis < 0 { axis + signed_rank } else { axis };
            if normalised < 0 || normalised >= signed_rank {
                return Err(NormError::config(format!(
                    "Invalid axis: {self} for input of rank {rank}"
                )));
            }
            resolved.push(normalised as usize);
        }
        let mut unique = resolved.clone();
        unique.sort_unstable();
        unique.dedup();
        if unique.len() != resolved.len() {
            return Err(NormError::config(format!("Duplicate axis: {resolved:?}")));
        }
        Ok(ResolvedAxes(resolved))
    }
}

/// Validated, non-negative axes for a concrete input rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAxes(Vec<usize>);

impl ResolvedAxes {
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, axis: usize) -> bool {
        self.0.contains(&axis)
    }

    /// First listed axis.
    pub fn first(&self) -> Option<usize> {
        self.0.first().copied()
    }

    /// Axes in ascending order.
    pub fn sorted(&self) -> ResolvedAxes {
        let mut axes = self.0.clone();
        axes.sort_unstable();
        ResolvedAxes(axes)
    }

    /// Shifts every axis by `offset`, used when a dimension is inserted in front.
    pub fn shifted(&self, offset: usize) -> ResolvedAxes {
        ResolvedAxes(self.0.iter().map(|axis| axis + offset).collect())
    }

    /// Whether the axes form a contiguous run ending at the last dimension.
    pub fn is_trailing_block(&self, rank: usize) -> bool {
        let sorted = self.sorted();
        match (sorted.0.first(), sorted.0.last()) {
            (Some(&lo), Some(&hi)) => hi + 1 == rank && hi - lo + 1 == sorted.len(),
            _ => false,
        }
    }

    /// Every axis of `rank` that is not a feature axis.
    pub fn reduction_axes(&self, rank: usize) -> Vec<usize> {
        (0..rank).filter(|axis| !self.contains(*axis)).collect()
    }

    /// Shape of per-feature parameters: `[dims[axis]]` for a single axis,
    /// otherwise the broadcast shape.
    pub fn param_shape(&self, dims: &[usize]) -> Vec<usize> {
        match self.0.as_slice() {
            [axis] => vec![dims[*axis]],
            _ => self.broadcast_shape(dims),
        }
    }

    /// Shape with 1 everywhere except the feature axes.
    pub fn broadcast_shape(&self, dims: &[usize]) -> Vec<usize> {
        dims.iter()
            .enumerate()
            .map(|(axis, &size)| if self.contains(axis) { size } else { 1 })
            .collect()
    }
}
