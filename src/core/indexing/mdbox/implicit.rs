// src/core/indexing/mdbox/implicit.rs

//! Geometric predicates used to restrict queries to a region.

use super::extents::Extents;

/// How much of a node's extents an implicit function covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    /// The node cannot contain any event inside the function.
    Outside,
    /// Some events may be inside, some outside: test each event.
    Partial,
    /// Every event of the node is inside.
    Contained,
}

/// A region in event space.
#[derive(Debug, Clone, PartialEq)]
pub enum ImplicitFunction<const ND: usize> {
    /// Axis-aligned box; events are tested half-open `[min, max)`.
    Box(Extents<ND>),
    /// Sphere given by its center and squared radius; events on the surface are inside.
    Sphere { center: [f64; ND], radius_squared: f64 },
}

impl<const ND: usize> ImplicitFunction<ND> {
    pub const fn sphere(center: [f64; ND], radius_squared: f64) -> Self {
        Self::Sphere { center, radius_squared }
    }

    pub const fn region(extents: Extents<ND>) -> Self {
        Self::Box(extents)
    }

    /// Exact per-event test.
    pub fn contains_point(&self, coords: &[f32; ND]) -> bool {
        match self {
            Self::Box(region) => region.contains_point_half_open(coords),
            Self::Sphere { center, radius_squared } => {
                let dist_sq: f64 = coords
                    .iter()
                    .zip(center.iter())
                    .map(|(&c, &p)| {
                        let d = f64::from(c) - p;
                        d * d
                    })
                    .sum();
                dist_sq <= *radius_squared
            }
        }
    }

    /// Conservative classification of a node's extents.
    ///
    /// `Outside` is only returned when no point of the extents can be inside,
    /// so a node that might intersect is always visited.
    pub fn coverage(&self, extents: &Extents<ND>) -> Coverage {
        match self {
            Self::Box(region) => {
                if !region.intersects(extents) {
                    Coverage::Outside
                } else if Self::box_covers(region, extents) {
                    Coverage::Contained
                } else {
                    Coverage::Partial
                }
            }
            Self::Sphere { center, radius_squared } => {
                if extents.min_distance_squared(center) > *radius_squared {
                    Coverage::Outside
                } else if extents.max_distance_squared(center) <= *radius_squared {
                    Coverage::Contained
                } else {
                    Coverage::Partial
                }
            }
        }
    }

    pub fn might_intersect(&self, extents: &Extents<ND>) -> bool {
        self.coverage(extents) != Coverage::Outside
    }

    // Half-open regions only fully cover a node that stays strictly below each region max.
    fn box_covers(region: &Extents<ND>, extents: &Extents<ND>) -> bool {
        region
            .dims()
            .iter()
            .zip(extents.dims().iter())
            .all(|(r, e)| r.min <= e.min && e.max < r.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sphere_coverage() {
        let f = ImplicitFunction::<2>::sphere([0.0, 0.0], 4.0);
        let inside = Extents::<2>::cube(-1.0, 1.0).unwrap();
        let straddling = Extents::<2>::cube(1.0, 3.0).unwrap();
        let far = Extents::<2>::cube(5.0, 6.0).unwrap();
        assert_eq!(f.coverage(&inside), Coverage::Contained);
        assert_eq!(f.coverage(&straddling), Coverage::Partial);
        assert_eq!(f.coverage(&far), Coverage::Outside);
    }

    #[test]
    fn test_sphere_surface_is_inside() {
        let f = ImplicitFunction::<2>::sphere([0.0, 0.0], 1.0);
        assert!(f.contains_point(&[1.0, 0.0]));
        assert!(!f.contains_point(&[1.0, 0.1]));
    }

    #[test]
    fn test_box_is_half_open_for_events() {
        let f = ImplicitFunction::region(Extents::<1>::new([(0.0, 5.0)]).unwrap());
        assert!(f.contains_point(&[0.0]));
        assert!(f.contains_point(&[4.999]));
        assert!(!f.contains_point(&[5.0]));
    }

    #[test]
    fn test_box_coverage_is_conservative() {
        let f = ImplicitFunction::region(Extents::<2>::cube(0.0, 10.0).unwrap());
        // Touching the region max: events at x == 10 are excluded, so only partial.
        let touching = Extents::<2>::cube(5.0, 10.0).unwrap();
        assert_eq!(f.coverage(&touching), Coverage::Partial);
        let inner = Extents::<2>::cube(1.0, 2.0).unwrap();
        assert_eq!(f.coverage(&inner), Coverage::Contained);
        let outer = Extents::<2>::cube(11.0, 12.0).unwrap();
        assert!(!f.might_intersect(&outer));
    }
}
