// src/core/indexing/mdbox/grid_box.rs

//! Internal node state: the child array and routing of coordinates to children.

use super::extents::Extents;
use super::node::Aggregates;
use crate::core::common::{MdBoxError, NodeId};

/// State of a grid box.
///
/// `children` is a flattened N-dimensional array with dimension 0 varying
/// fastest: `index = i0 + s0 * (i1 + s1 * (i2 + ...))`.
#[derive(Debug, Clone)]
pub struct GridData<const ND: usize> {
    children: Vec<NodeId>,
    split_into: [usize; ND],
    cache: Aggregates<ND>,
    stale: bool,
}

impl<const ND: usize> GridData<ND> {
    pub fn new(split_into: [usize; ND], children: Vec<NodeId>, cache: Aggregates<ND>) -> Self {
        Self { children, split_into, cache, stale: false }
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub const fn split_into(&self) -> &[usize; ND] {
        &self.split_into
    }

    pub fn child(&self, index: usize) -> Option<NodeId> {
        self.children.get(index).copied()
    }

    /// Replaces the child array with `ids[start..end]`.
    ///
    /// # Errors
    /// `InvalidInput` if the range is out of bounds or does not hold exactly one
    /// id per grid cell.
    pub fn set_children(&mut self, ids: &[NodeId], start: usize, end: usize) -> Result<(), MdBoxError> {
        let expected: usize = self.split_into.iter().product();
        let range = ids.get(start..end).ok_or_else(|| {
            MdBoxError::invalid_input(format!(
                "Child range {}..{} out of bounds for {} ids",
                start,
                end,
                ids.len()
            ))
        })?;
        if range.len() != expected {
            return Err(MdBoxError::invalid_input(format!(
                "A grid split {:?} needs {} children, got {}",
                self.split_into,
                expected,
                range.len()
            )));
        }
        self.children = range.to_vec();
        self.stale = true;
        Ok(())
    }

    pub const fn aggregates(&self) -> &Aggregates<ND> {
        &self.cache
    }

    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn set_aggregates(&mut self, cache: Aggregates<ND>) {
        self.cache = cache;
        self.stale = false;
    }

    pub fn unravel(&self, index: usize) -> [usize; ND] {
        unravel(index, &self.split_into)
    }

    /// Flat index of the child of a grid spanning `extents` that owns `coords`.
    pub fn child_index_for(&self, extents: &Extents<ND>, coords: &[f32; ND]) -> usize {
        child_index_for(extents, &self.split_into, coords)
    }

    /// Id of the child that owns `coords`.
    ///
    /// # Errors
    /// `Internal` if the child array does not match the split (a corrupt grid).
    pub fn route(&self, extents: &Extents<ND>, coords: &[f32; ND]) -> Result<NodeId, MdBoxError> {
        let index = self.child_index_for(extents, coords);
        self.child(index).ok_or_else(|| {
            MdBoxError::Internal(format!(
                "Grid has {} children but routed to index {}",
                self.children.len(),
                index
            ))
        })
    }
}

pub fn linear_index<const ND: usize>(idx: &[usize; ND], split_into: &[usize; ND]) -> usize {
    let mut index = 0;
    for d in (0..ND).rev() {
        index = index * split_into[d] + idx[d];
    }
    index
}

pub fn unravel<const ND: usize>(mut index: usize, split_into: &[usize; ND]) -> [usize; ND] {
    let mut idx = [0usize; ND];
    for d in 0..ND {
        idx[d] = index % split_into[d];
        index /= split_into[d];
    }
    idx
}

/// Sub-interval of each dimension that holds `coords`, using direct division.
///
/// The estimate is corrected against [`Extents::boundary`], the same values the
/// child extents are built from, so routing never disagrees with a child's
/// `[min, max)` by a rounding error. Coordinates beyond the extents are clamped
/// into the first or last interval.
pub fn child_index_for<const ND: usize>(
    extents: &Extents<ND>,
    split_into: &[usize; ND],
    coords: &[f32; ND],
) -> usize {
    let mut idx = [0usize; ND];
    for d in 0..ND {
        let split = split_into[d];
        let x = f64::from(coords[d]);
        let dim = extents.dim(d);
        let width = dim.width() / split as f64;
        let estimate = ((x - dim.min) / width).floor();
        let mut i = if estimate.is_nan() || estimate < 0.0 {
            0
        } else {
            (estimate as usize).min(split - 1)
        };
        while i > 0 && x < extents.boundary(d, i, split) {
            i -= 1;
        }
        while i + 1 < split && x >= extents.boundary(d, i + 1, split) {
            i += 1;
        }
        idx[d] = i;
    }
    linear_index(&idx, split_into)
}
