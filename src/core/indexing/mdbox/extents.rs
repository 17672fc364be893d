// src/core/indexing/mdbox/extents.rs

//! Axis-aligned N-dimensional bounding boxes.

use crate::core::common::MdBoxError;
use serde::{Deserialize, Serialize};

/// The `[min, max]` range of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionExtent {
    pub min: f64,
    pub max: f64,
}

impl DimensionExtent {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn center(&self) -> f64 {
        (self.min + self.max) / 2.0
    }
}

/// Per-dimension bounds of a node or of a query region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extents<const ND: usize> {
    dims: [DimensionExtent; ND],
}

impl<const ND: usize> Extents<ND> {
    /// Builds extents from `(min, max)` pairs.
    ///
    /// # Errors
    /// Returns `MdBoxError::InvalidInput` if a bound is not finite or `min >= max`.
    pub fn new(bounds: [(f64, f64); ND]) -> Result<Self, MdBoxError> {
        let mut dims = [DimensionExtent::new(0.0, 0.0); ND];
        for (d, (min, max)) in bounds.into_iter().enumerate() {
            if !min.is_finite() || !max.is_finite() || min >= max {
                return Err(MdBoxError::invalid_input(format!(
                    "Dimension {} has invalid extents [{}, {}]",
                    d, min, max
                )));
            }
            dims[d] = DimensionExtent::new(min, max);
        }
        Ok(Self { dims })
    }

    /// Builds extents from a slice, checking its length against `ND`.
    ///
    /// # Errors
    /// `DimensionMismatch` for a wrong number of entries, otherwise as [`Extents::new`].
    pub fn from_slice(bounds: &[(f64, f64)]) -> Result<Self, MdBoxError> {
        let bounds: [(f64, f64); ND] = bounds.try_into().map_err(|_| {
            MdBoxError::DimensionMismatch { expected: ND, actual: bounds.len() }
        })?;
        Self::new(bounds)
    }

    /// The same `[min, max]` on every dimension.
    ///
    /// # Errors
    /// As [`Extents::new`].
    pub fn cube(min: f64, max: f64) -> Result<Self, MdBoxError> {
        Self::new([(min, max); ND])
    }

    pub const fn dim(&self, d: usize) -> &DimensionExtent {
        &self.dims[d]
    }

    pub const fn dims(&self) -> &[DimensionExtent; ND] {
        &self.dims
    }

    pub fn min(&self, d: usize) -> f64 {
        self.dims[d].min
    }

    pub fn max(&self, d: usize) -> f64 {
        self.dims[d].max
    }

    pub fn center(&self) -> [f64; ND] {
        let mut c = [0.0; ND];
        for (out, dim) in c.iter_mut().zip(self.dims.iter()) {
            *out = dim.center();
        }
        c
    }

    pub fn volume(&self) -> f64 {
        self.dims.iter().map(DimensionExtent::width).product()
    }

    /// Closed containment test `[min, max]` on every dimension. NaN coordinates are never contained.
    pub fn contains_point(&self, coords: &[f32; ND]) -> bool {
        self.dims.iter().zip(coords.iter()).all(|(dim, &c)| {
            let c = f64::from(c);
            c >= dim.min && c <= dim.max
        })
    }

    /// Containment with the binning convention: `[min, max)` on each dimension,
    /// except that dimensions flagged in `closed_upper` include their max.
    pub fn owns_point(&self, coords: &[f32; ND], closed_upper: &[bool; ND]) -> bool {
        self.dims
            .iter()
            .zip(coords.iter())
            .zip(closed_upper.iter())
            .all(|((dim, &c), &closed)| {
                let c = f64::from(c);
                c >= dim.min && (c < dim.max || (closed && c <= dim.max))
            })
    }

    /// Half-open containment `[min, max)` on every dimension.
    pub fn contains_point_half_open(&self, coords: &[f32; ND]) -> bool {
        self.owns_point(coords, &[false; ND])
    }

    /// Conservative overlap test; touching faces count as intersecting.
    pub fn intersects(&self, other: &Self) -> bool {
        self.dims
            .iter()
            .zip(other.dims.iter())
            .all(|(a, b)| a.min <= b.max && b.min <= a.max)
    }

    /// True if `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Self) -> bool {
        self.dims
            .iter()
            .zip(other.dims.iter())
            .all(|(a, b)| a.min <= b.min && b.max <= a.max)
    }

    /// Squared distance from `point` to the nearest point of the box (0 inside).
    pub fn min_distance_squared(&self, point: &[f64; ND]) -> f64 {
        self.dims
            .iter()
            .zip(point.iter())
            .map(|(dim, &p)| {
                let d = if p < dim.min {
                    dim.min - p
                } else if p > dim.max {
                    p - dim.max
                } else {
                    0.0
                };
                d * d
            })
            .sum()
    }

    /// Squared distance from `point` to the farthest corner of the box.
    pub fn max_distance_squared(&self, point: &[f64; ND]) -> f64 {
        self.dims
            .iter()
            .zip(point.iter())
            .map(|(dim, &p)| {
                let d = (p - dim.min).abs().max((dim.max - p).abs());
                d * d
            })
            .sum()
    }

    /// Lower edge of sub-interval `i` when dimension `d` is cut into `split` equal parts.
    /// `i == split` yields the max itself, so neighbouring children share exact boundaries.
    pub fn boundary(&self, d: usize, i: usize, split: usize) -> f64 {
        let dim = &self.dims[d];
        if i >= split {
            return dim.max;
        }
        dim.min + (i as f64) * (dim.width() / split as f64)
    }

    /// Extents of the child with per-dimension sub-interval indices `idx`.
    pub fn child(&self, idx: &[usize; ND], split_into: &[usize; ND]) -> Self {
        let mut dims = self.dims;
        for d in 0..ND {
            dims[d] = DimensionExtent::new(
                self.boundary(d, idx[d], split_into[d]),
                self.boundary(d, idx[d] + 1, split_into[d]),
            );
        }
        Self { dims }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_new_rejects_inverted_and_nan_bounds() {
        assert!(Extents::<2>::new([(0.0, 1.0), (1.0, 1.0)]).is_err());
        assert!(Extents::<1>::new([(f64::NAN, 1.0)]).is_err());
        assert!(Extents::<1>::new([(0.0, f64::INFINITY)]).is_err());
        assert!(Extents::<2>::new([(-1.0, 1.0), (0.0, 5.0)]).is_ok());
    }

    #[test]
    fn test_from_slice_checks_dimension_count() {
        let err = Extents::<3>::from_slice(&[(0.0, 1.0), (0.0, 1.0)]).unwrap_err();
        assert!(matches!(err, MdBoxError::DimensionMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn test_point_containment_rules() {
        let e = Extents::<1>::new([(0.0, 10.0)]).unwrap();
        assert!(e.contains_point(&[10.0]));
        assert!(!e.contains_point_half_open(&[10.0]));
        assert!(e.owns_point(&[10.0], &[true]));
        assert!(e.owns_point(&[0.0], &[false]));
        assert!(!e.contains_point(&[f32::NAN]));
        assert!(!e.contains_point(&[-0.001]));
    }

    #[test]
    fn test_children_tile_parent() {
        let e = Extents::<2>::new([(0.0, 1.0), (-3.0, 3.0)]).unwrap();
        let split = [10, 3];
        let mut total = 0.0;
        for i in 0..10 {
            for j in 0..3 {
                let c = e.child(&[i, j], &split);
                assert!(e.contains(&c));
                total += c.volume();
                if i + 1 < 10 {
                    let right = e.child(&[i + 1, j], &split);
                    assert_eq!(c.max(0), right.min(0));
                }
            }
        }
        assert_relative_eq!(total, e.volume(), epsilon = 1e-12);
        assert_eq!(e.child(&[9, 2], &split).max(0), 1.0);
    }

    #[test]
    fn test_distance_bounds() {
        let e = Extents::<2>::cube(0.0, 2.0).unwrap();
        assert_eq!(e.min_distance_squared(&[1.0, 1.0]), 0.0);
        assert_eq!(e.min_distance_squared(&[4.0, 1.0]), 4.0);
        assert_eq!(e.max_distance_squared(&[1.0, 1.0]), 2.0);
        assert_eq!(e.max_distance_squared(&[0.0, 0.0]), 8.0);
    }

    #[test]
    fn test_intersects_and_contains() {
        let a = Extents::<2>::cube(0.0, 2.0).unwrap();
        let b = Extents::<2>::cube(2.0, 3.0).unwrap();
        let c = Extents::<2>::cube(2.5, 3.0).unwrap();
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(b.contains(&c));
        assert!(!c.contains(&b));
    }
}
