// src/core/indexing/mdbox/controller.rs

//! `BoxController`: the split policy and box bookkeeping shared by every node of one tree.

use crate::core::common::MdBoxError;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Deepest recursion a tree may be configured for.
pub const MAX_DEPTH: usize = 32;
/// Upper bound on `split_into` products, i.e. on the children of one grid box.
pub const MAX_CHILDREN_PER_GRID: usize = 1 << 20;

const DEFAULT_SPLIT_INTO: usize = 5;
const DEFAULT_SPLIT_THRESHOLD: usize = 1000;
const DEFAULT_MAX_DEPTH: usize = 5;
const DEFAULT_EVENTS_PER_TASK: usize = 1000;
const DEFAULT_TASKS_PER_CORE: usize = 5;

/// Sizing of parallel insertion batches. Pure tuning; never affects results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddingEventsParameters {
    pub events_per_task: usize,
    pub tasks_per_block: usize,
}

impl Default for AddingEventsParameters {
    fn default() -> Self {
        Self {
            events_per_task: DEFAULT_EVENTS_PER_TASK,
            tasks_per_block: num_cpus::get_physical().max(1) * DEFAULT_TASKS_PER_CORE,
        }
    }
}

/// Live box counts, indexed by depth.
#[derive(Debug, Clone, Default)]
struct BoxCounters {
    leaf_boxes: Vec<usize>,
    grid_boxes: Vec<usize>,
}

impl BoxCounters {
    fn for_depth(max_depth: usize) -> Self {
        let mut leaf_boxes = vec![0; max_depth + 1];
        leaf_boxes[0] = 1;
        Self { leaf_boxes, grid_boxes: vec![0; max_depth + 1] }
    }
}

/// Policy object governing when and how boxes split.
///
/// The thresholds are plain fields, readable from any thread without locking.
/// They are changed through `&mut self`, so once the controller is shared behind
/// an `Arc` with a live tree it can no longer be reconfigured. Only the box
/// counters are mutated concurrently; they sit behind their own mutex.
#[derive(Debug)]
pub struct BoxController {
    n_dims: usize,
    split_threshold: usize,
    max_depth: usize,
    split_into: Vec<usize>,
    num_split: usize,
    adding_events: AddingEventsParameters,
    counters: Mutex<BoxCounters>,
}

impl BoxController {
    /// Creates a controller with default policy for `n_dims` dimensions.
    ///
    /// # Errors
    /// `Configuration` if `n_dims` is 0 or the default split would overflow.
    pub fn new(n_dims: usize) -> Result<Self, MdBoxError> {
        if n_dims == 0 {
            return Err(MdBoxError::Configuration(
                "A box controller needs at least one dimension".to_string(),
            ));
        }
        let split_into = vec![DEFAULT_SPLIT_INTO; n_dims];
        let num_split = Self::checked_num_split(&split_into)?;
        Ok(Self {
            n_dims,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
            split_into,
            num_split,
            adding_events: AddingEventsParameters::default(),
            counters: Mutex::new(BoxCounters::for_depth(DEFAULT_MAX_DEPTH)),
        })
    }

    fn checked_num_split(split_into: &[usize]) -> Result<usize, MdBoxError> {
        let mut product: usize = 1;
        for (d, &n) in split_into.iter().enumerate() {
            if n == 0 {
                return Err(MdBoxError::Configuration(format!(
                    "split_into for dimension {} must be at least 1",
                    d
                )));
            }
            product = product
                .checked_mul(n)
                .filter(|&p| p <= MAX_CHILDREN_PER_GRID)
                .ok_or_else(|| {
                    MdBoxError::Configuration(format!(
                        "split_into {:?} exceeds {} children per grid box",
                        split_into, MAX_CHILDREN_PER_GRID
                    ))
                })?;
        }
        if product < 2 {
            return Err(MdBoxError::Configuration(
                "split_into must divide at least one dimension".to_string(),
            ));
        }
        Ok(product)
    }

    fn counters(&self) -> MutexGuard<'_, BoxCounters> {
        // Plain counters stay meaningful even if a holder panicked.
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- configuration ---

    /// # Errors
    /// `Configuration` if `threshold` is 0.
    pub fn set_split_threshold(&mut self, threshold: usize) -> Result<(), MdBoxError> {
        if threshold == 0 {
            return Err(MdBoxError::Configuration(
                "split_threshold must be greater than 0".to_string(),
            ));
        }
        self.split_threshold = threshold;
        Ok(())
    }

    /// Sets the maximum recursion depth and resets the box counters.
    ///
    /// # Errors
    /// `Configuration` if `depth` is outside `1..=MAX_DEPTH`.
    pub fn set_max_depth(&mut self, depth: usize) -> Result<(), MdBoxError> {
        if depth == 0 || depth > MAX_DEPTH {
            return Err(MdBoxError::Configuration(format!(
                "max_depth must be between 1 and {}, got {}",
                MAX_DEPTH, depth
            )));
        }
        self.max_depth = depth;
        self.reset_num_boxes();
        Ok(())
    }

    /// # Errors
    /// `Configuration` if `dim` is out of range or the new product is invalid.
    pub fn set_split_into(&mut self, dim: usize, n: usize) -> Result<(), MdBoxError> {
        if dim >= self.n_dims {
            return Err(MdBoxError::Configuration(format!(
                "Dimension {} out of range for a {}-dimensional controller",
                dim, self.n_dims
            )));
        }
        let mut split_into = self.split_into.clone();
        split_into[dim] = n;
        self.num_split = Self::checked_num_split(&split_into)?;
        self.split_into = split_into;
        Ok(())
    }

    /// # Errors
    /// `Configuration` if the resulting product is invalid.
    pub fn set_split_into_all(&mut self, n: usize) -> Result<(), MdBoxError> {
        let split_into = vec![n; self.n_dims];
        self.num_split = Self::checked_num_split(&split_into)?;
        self.split_into = split_into;
        Ok(())
    }

    /// # Errors
    /// `Configuration` if either value is 0.
    pub fn set_adding_events_parameters(
        &mut self,
        events_per_task: usize,
        tasks_per_block: usize,
    ) -> Result<(), MdBoxError> {
        if events_per_task == 0 || tasks_per_block == 0 {
            return Err(MdBoxError::Configuration(
                "events_per_task and tasks_per_block must be greater than 0".to_string(),
            ));
        }
        self.adding_events = AddingEventsParameters { events_per_task, tasks_per_block };
        Ok(())
    }

    // --- policy ---

    pub const fn n_dims(&self) -> usize {
        self.n_dims
    }

    pub const fn split_threshold(&self) -> usize {
        self.split_threshold
    }

    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn split_into(&self) -> &[usize] {
        &self.split_into
    }

    /// Number of children a grid box gets: the product of `split_into`.
    pub const fn num_split(&self) -> usize {
        self.num_split
    }

    pub const fn max_children(&self) -> usize {
        MAX_CHILDREN_PER_GRID
    }

    /// `split_into` as a fixed array for an `ND`-dimensional tree.
    ///
    /// # Errors
    /// `DimensionMismatch` if the controller was built for another dimensionality.
    pub fn split_into_array<const ND: usize>(&self) -> Result<[usize; ND], MdBoxError> {
        self.split_into
            .as_slice()
            .try_into()
            .map_err(|_| MdBoxError::DimensionMismatch { expected: ND, actual: self.n_dims })
    }

    /// Whether a box holding `n_events` at `depth` must become a grid box.
    pub const fn will_split(&self, n_events: usize, depth: usize) -> bool {
        n_events > self.split_threshold && depth < self.max_depth
    }

    pub const fn adding_events_parameters(&self) -> AddingEventsParameters {
        self.adding_events
    }

    /// True once a whole block of insertion tasks worth of events has been added
    /// since the last split pass.
    pub const fn should_split_boxes(&self, events_added: usize) -> bool {
        events_added >= self.adding_events.events_per_task.saturating_mul(self.adding_events.tasks_per_block)
    }

    // --- bookkeeping ---

    /// Records that the box at `depth` became a grid box with `num_split` children.
    pub fn track_num_boxes(&self, depth: usize) {
        let num_split = self.num_split;
        let mut counters = self.counters();
        let needed = depth + 2;
        if counters.leaf_boxes.len() < needed {
            counters.leaf_boxes.resize(needed, 0);
            counters.grid_boxes.resize(needed, 0);
        }
        counters.leaf_boxes[depth] = counters.leaf_boxes[depth].saturating_sub(1);
        counters.grid_boxes[depth] += 1;
        counters.leaf_boxes[depth + 1] += num_split;
    }

    /// Back to a single root leaf.
    pub fn reset_num_boxes(&self) {
        *self.counters() = BoxCounters::for_depth(self.max_depth);
    }

    /// Leaf boxes per depth.
    pub fn num_md_boxes(&self) -> Vec<usize> {
        self.counters().leaf_boxes.clone()
    }

    /// Grid boxes per depth.
    pub fn num_md_grid_boxes(&self) -> Vec<usize> {
        self.counters().grid_boxes.clone()
    }

    pub fn total_num_md_boxes(&self) -> usize {
        let counters = self.counters();
        counters.leaf_boxes.iter().sum::<usize>() + counters.grid_boxes.iter().sum::<usize>()
    }

    /// Mean depth of the leaf boxes.
    pub fn average_depth(&self) -> f64 {
        let counters = self.counters();
        let (weighted, total) = counters
            .leaf_boxes
            .iter()
            .enumerate()
            .fold((0usize, 0usize), |(w, t), (depth, &n)| (w + depth * n, t + n));
        if total == 0 {
            0.0
        } else {
            weighted as f64 / total as f64
        }
    }
}
