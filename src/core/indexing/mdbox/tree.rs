// src/core/indexing/mdbox/tree.rs

//! `BoxTree`: the node arena, event insertion, and queries.
//!
//! Nodes live in one arena and refer to each other by [`NodeId`]. Locking rules:
//! a node's slot lock is never held while waiting for the arena lock, except by
//! a split, which takes the splitting box's slot and then the arena. Routing
//! reads a grid's slot, copies the child id, and releases the slot before
//! looking the child up. Evicting a leaf only ever uses `try_write`.

use super::controller::BoxController;
use super::event::MdEvent;
use super::extents::Extents;
use super::file_backing::{FileBackend, Victims};
use super::implicit::{Coverage, ImplicitFunction};
use super::node::{Aggregates, MdNode, NodeSlot, NodeSummary};
use crate::core::common::lock_utils::{read_lock_poisoned, write_lock_poisoned_with_context};
use crate::core::common::{MdBoxError, NodeId};
use log::{debug, info};
use std::sync::{Arc, RwLock};

/// Signal, squared error and event count summed over a region.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IntegrationResult {
    pub signal: f64,
    pub error_squared: f64,
    pub n_events: u64,
}

impl<const ND: usize> From<Aggregates<ND>> for IntegrationResult {
    fn from(agg: Aggregates<ND>) -> Self {
        Self { signal: agg.signal, error_squared: agg.error_squared, n_events: agg.n_points }
    }
}

#[derive(Debug)]
pub struct BoxTree<const ND: usize> {
    pub(super) controller: Arc<BoxController>,
    pub(super) nodes: RwLock<Vec<Arc<MdNode<ND>>>>,
    pub(super) backing: Option<FileBackend>,
}

impl<const ND: usize> BoxTree<ND> {
    /// Creates a tree whose root is an empty leaf covering `extents`.
    ///
    /// # Errors
    /// `DimensionMismatch` if the controller was configured for another dimensionality.
    pub fn new(extents: Extents<ND>, controller: Arc<BoxController>) -> Result<Self, MdBoxError> {
        if controller.n_dims() != ND {
            return Err(MdBoxError::DimensionMismatch { expected: ND, actual: controller.n_dims() });
        }
        controller.reset_num_boxes();
        Ok(Self {
            controller,
            nodes: RwLock::new(vec![Arc::new(MdNode::root(extents))]),
            backing: None,
        })
    }

    /// Like [`BoxTree::new`], with leaves spilling to `backend`'s event file.
    ///
    /// # Errors
    /// `DimensionMismatch` if the controller or the event file disagree with `ND`.
    pub fn with_file_backing(
        extents: Extents<ND>,
        controller: Arc<BoxController>,
        backend: FileBackend,
    ) -> Result<Self, MdBoxError> {
        if backend.file().n_dims() != ND {
            return Err(MdBoxError::DimensionMismatch { expected: ND, actual: backend.file().n_dims() });
        }
        let mut tree = Self::new(extents, controller)?;
        tree.backing = Some(backend);
        Ok(tree)
    }

    pub fn controller(&self) -> &Arc<BoxController> {
        &self.controller
    }

    /// Mutable access to the split policy, only while the tree is still an empty root
    /// and no one else holds the controller.
    ///
    /// # Errors
    /// `Configuration` once insertion has begun or the controller is shared.
    pub fn controller_mut(&mut self) -> Result<&mut BoxController, MdBoxError> {
        let untouched = {
            let nodes = self.nodes.get_mut().map_err(|_| MdBoxError::Lock("Node arena poisoned".to_string()))?;
            nodes.len() == 1 && nodes[0].n_points()? == 0
        };
        if !untouched {
            return Err(MdBoxError::Configuration(
                "The box controller cannot be reconfigured after insertion has begun".to_string(),
            ));
        }
        Arc::get_mut(&mut self.controller).ok_or_else(|| {
            MdBoxError::Configuration("The box controller is shared and cannot be reconfigured".to_string())
        })
    }

    pub fn file_backend(&self) -> Option<&FileBackend> {
        self.backing.as_ref()
    }

    pub fn is_file_backed(&self) -> bool {
        self.backing.is_some()
    }

    /// # Errors
    /// `NodeNotFound` for an id outside the arena.
    pub fn node(&self, id: NodeId) -> Result<Arc<MdNode<ND>>, MdBoxError> {
        let nodes = self.nodes.read().map_err(read_lock_poisoned)?;
        nodes.get(id.index()).cloned().ok_or(MdBoxError::NodeNotFound(id))
    }

    pub fn root(&self) -> Result<Arc<MdNode<ND>>, MdBoxError> {
        self.node(NodeId::ROOT)
    }

    pub fn extents(&self) -> Result<Extents<ND>, MdBoxError> {
        Ok(*self.root()?.extents())
    }

    pub fn num_nodes(&self) -> Result<usize, MdBoxError> {
        Ok(self.nodes.read().map_err(read_lock_poisoned)?.len())
    }

    pub(super) fn snapshot(&self) -> Result<Vec<Arc<MdNode<ND>>>, MdBoxError> {
        Ok(self.nodes.read().map_err(read_lock_poisoned)?.clone())
    }

    /// Every current leaf. Nodes are never removed from the arena, so every
    /// node still holding a box is a live leaf.
    pub fn leaves(&self) -> Result<Vec<Arc<MdNode<ND>>>, MdBoxError> {
        let mut leaves = Vec::new();
        for node in self.snapshot()? {
            if node.is_leaf()? {
                leaves.push(node);
            }
        }
        Ok(leaves)
    }

    // --- insertion ---

    /// Descends from `start` to the leaf currently owning `coords`.
    fn route_from(&self, start: Arc<MdNode<ND>>, coords: &[f32; ND]) -> Result<Arc<MdNode<ND>>, MdBoxError> {
        let mut node = start;
        loop {
            let next = match &*node.read()? {
                NodeSlot::Box(_) => None,
                NodeSlot::Grid(grid) => Some(grid.route(node.extents(), coords)?),
            };
            match next {
                Some(child) => node = self.node(child)?,
                None => return Ok(node),
            }
        }
    }

    /// The leaf that owns `coords`, or `None` if they fall outside the tree.
    pub fn find_leaf(&self, coords: &[f32; ND]) -> Result<Option<Arc<MdNode<ND>>>, MdBoxError> {
        let root = self.root()?;
        if !root.owns_point(coords) {
            return Ok(None);
        }
        Ok(Some(self.route_from(root, coords)?))
    }

    /// Appends one event to the leaf owning it. Returns `false` if it lies outside
    /// the tree and was dropped.
    ///
    /// Safe for concurrent callers; callers hitting the same leaf are serialized
    /// on its lock. If the leaf is split between routing and locking, the event is
    /// routed again from that node. On a file-backed tree the leaf's new size is
    /// reported to the leaf cache, which may evict least recently used leaves.
    /// Events added to a leaf that is currently evicted stay pending in memory
    /// until the leaf is next loaded.
    pub fn add_event(&self, event: MdEvent<ND>) -> Result<bool, MdBoxError> {
        let Some(mut leaf) = self.find_leaf(event.center())? else {
            return Ok(false);
        };
        loop {
            let next = match &mut *leaf.write()? {
                NodeSlot::Box(data) => {
                    data.push(event);
                    leaf.invalidate_ancestors();
                    None
                }
                NodeSlot::Grid(grid) => Some(grid.route(leaf.extents(), event.center())?),
            };
            match next {
                Some(child) => leaf = self.route_from(self.node(child)?, event.center())?,
                None => break,
            }
        }
        self.track_resident(&leaf)?;
        Ok(true)
    }

    /// Reports `leaf`'s buffer size to the leaf cache and evicts whatever that
    /// pushes over capacity.
    fn track_resident(&self, leaf: &MdNode<ND>) -> Result<(), MdBoxError> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let victims = match &*leaf.read()? {
            NodeSlot::Box(data) if data.is_resident() && !data.events().is_empty() => {
                backing.resize(leaf.id(), data.events().len())?
            }
            _ => return Ok(()),
        };
        self.evict_victims(victims)
    }

    /// Appends a batch; returns how many events were dropped as out of extents.
    pub fn add_events(&self, events: &[MdEvent<ND>]) -> Result<usize, MdBoxError> {
        let mut dropped = 0;
        for event in events {
            if !self.add_event(*event)? {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("Dropped {} of {} events outside the tree extents", dropped, events.len());
        }
        Ok(dropped)
    }

    // --- aggregates ---

    /// Recomputes cached aggregates bottom-up over the whole tree.
    pub fn refresh_cache(&self) -> Result<(), MdBoxError> {
        self.refresh_node(&*self.root()?)?;
        Ok(())
    }

    fn refresh_node(&self, node: &MdNode<ND>) -> Result<Aggregates<ND>, MdBoxError> {
        let children = match &mut *node.write()? {
            NodeSlot::Box(data) => return Ok(*data.refresh()),
            NodeSlot::Grid(grid) => grid.children().to_vec(),
        };
        node.clear_stale();
        let mut total = Aggregates::empty();
        for child in children {
            total.merge(&self.refresh_node(&*self.node(child)?)?);
        }
        if let NodeSlot::Grid(grid) = &mut *node.write()? {
            grid.set_aggregates(total);
        }
        Ok(total)
    }

    /// Events under the root; a grid root reports the count from the last refresh.
    pub fn n_points(&self) -> Result<u64, MdBoxError> {
        self.root()?.n_points()
    }

    /// Live count of every stored event, in memory or on disk.
    pub fn total_data_size(&self) -> Result<u64, MdBoxError> {
        let mut total = 0;
        for node in self.snapshot()? {
            if let NodeSlot::Box(data) = &*node.read()? {
                total += data.n_points();
            }
        }
        Ok(total)
    }

    // --- masking ---

    pub fn mask(&self, id: NodeId) -> Result<(), MdBoxError> {
        self.node(id)?.mask();
        Ok(())
    }

    pub fn unmask(&self, id: NodeId) -> Result<(), MdBoxError> {
        self.node(id)?.unmask();
        Ok(())
    }

    /// Whether `id` or any of its ancestors is masked.
    pub fn is_masked(&self, id: NodeId) -> Result<bool, MdBoxError> {
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.node(id)?;
            if node.is_masked() {
                return Ok(true);
            }
            current = node.parent();
        }
        Ok(false)
    }

    // --- queries ---

    /// Copies out the events of leaf `id`, loading them from disk if needed.
    ///
    /// # Errors
    /// `UnexpectedNodeType` for a grid, `Io` if a load fails.
    pub fn events(&self, id: NodeId) -> Result<Vec<MdEvent<ND>>, MdBoxError> {
        let node = self.node(id)?;
        self.leaf_events(&node)
    }

    fn leaf_events(&self, node: &MdNode<ND>) -> Result<Vec<MdEvent<ND>>, MdBoxError> {
        let (events, victims) = {
            let mut slot = node.write()?;
            let NodeSlot::Box(data) = &mut *slot else {
                return Err(MdBoxError::UnexpectedNodeType { id: node.id(), expected: "box" });
            };
            let victims = match &self.backing {
                Some(backing) => backing.load(node.id(), data)?,
                None => Vec::new(),
            };
            (data.events().to_vec(), victims)
        };
        self.evict_victims(victims)?;
        Ok(events)
    }

    /// Sums every unmasked event inside `function`.
    pub fn integrate(&self, function: &ImplicitFunction<ND>) -> Result<IntegrationResult, MdBoxError> {
        Ok(self.accumulate(function)?.into())
    }

    /// Signal and squared error of the events within `radius_squared` of `center`.
    pub fn integrate_sphere(&self, center: [f64; ND], radius_squared: f64) -> Result<(f64, f64), MdBoxError> {
        let result = self.integrate(&ImplicitFunction::sphere(center, radius_squared))?;
        Ok((result.signal, result.error_squared))
    }

    /// Integrates the events in `region`, half-open on every face.
    pub fn bin_region(&self, region: &Extents<ND>) -> Result<IntegrationResult, MdBoxError> {
        self.integrate(&ImplicitFunction::region(*region))
    }

    /// Signal-weighted centroid of the events in a sphere; `None` if their signal sums to zero.
    pub fn centroid_sphere(&self, center: [f64; ND], radius_squared: f64) -> Result<Option<[f64; ND]>, MdBoxError> {
        Ok(self.accumulate(&ImplicitFunction::sphere(center, radius_squared))?.centroid())
    }

    fn accumulate(&self, function: &ImplicitFunction<ND>) -> Result<Aggregates<ND>, MdBoxError> {
        let mut acc = Aggregates::empty();
        self.accumulate_node(&*self.root()?, function, &mut acc)?;
        Ok(acc)
    }

    fn accumulate_node(
        &self,
        node: &MdNode<ND>,
        function: &ImplicitFunction<ND>,
        acc: &mut Aggregates<ND>,
    ) -> Result<(), MdBoxError> {
        if node.is_masked() {
            return Ok(());
        }
        let coverage = function.coverage(node.extents());
        if coverage == Coverage::Outside {
            return Ok(());
        }
        let add = |acc: &mut Aggregates<ND>, event: &MdEvent<ND>| {
            if coverage == Coverage::Contained || function.contains_point(event.center()) {
                acc.add_event(event);
            }
        };

        let children = match &*node.read()? {
            NodeSlot::Grid(grid) => Some(grid.children().to_vec()),
            NodeSlot::Box(data) if coverage == Coverage::Contained && !data.is_stale() => {
                acc.merge(data.aggregates());
                return Ok(());
            }
            NodeSlot::Box(data) if data.is_resident() => {
                data.events().iter().for_each(|e| add(acc, e));
                return Ok(());
            }
            NodeSlot::Box(_) => None,
        };
        match children {
            Some(children) => {
                for child in children {
                    self.accumulate_node(&*self.node(child)?, function, acc)?;
                }
            }
            // Evicted leaf: read through.
            None => self.leaf_events(node)?.iter().for_each(|e| add(acc, e)),
        }
        Ok(())
    }

    /// Nodes down to `max_depth` in depth-first order.
    ///
    /// With `leaf_only`, only leaves and the grids cut off at `max_depth` are listed.
    /// With a `function`, subtrees whose extents cannot intersect it are skipped;
    /// the test is conservative. Masking does not filter; see [`NodeSummary::masked`].
    pub fn get_boxes(
        &self,
        max_depth: usize,
        leaf_only: bool,
        function: Option<&ImplicitFunction<ND>>,
    ) -> Result<Vec<NodeSummary<ND>>, MdBoxError> {
        let mut out = Vec::new();
        self.collect_boxes(&*self.root()?, false, max_depth, leaf_only, function, &mut out)?;
        Ok(out)
    }

    fn collect_boxes(
        &self,
        node: &MdNode<ND>,
        ancestor_masked: bool,
        max_depth: usize,
        leaf_only: bool,
        function: Option<&ImplicitFunction<ND>>,
        out: &mut Vec<NodeSummary<ND>>,
    ) -> Result<(), MdBoxError> {
        if node.depth() > max_depth {
            return Ok(());
        }
        if let Some(f) = function {
            if !f.might_intersect(node.extents()) {
                return Ok(());
            }
        }
        let mut summary = node.summary()?;
        summary.masked |= ancestor_masked;
        let masked = summary.masked;
        let is_leaf = summary.is_leaf;
        if !leaf_only || is_leaf || node.depth() == max_depth {
            out.push(summary);
        }
        if is_leaf || node.depth() == max_depth {
            return Ok(());
        }
        let children = match &*node.read()? {
            NodeSlot::Grid(grid) => grid.children().to_vec(),
            NodeSlot::Box(_) => Vec::new(),
        };
        for child in children {
            self.collect_boxes(&*self.node(child)?, masked, max_depth, leaf_only, function, out)?;
        }
        Ok(())
    }

    // --- file backing ---

    fn require_backing(&self) -> Result<&FileBackend, MdBoxError> {
        self.backing
            .as_ref()
            .ok_or_else(|| MdBoxError::Configuration("The tree has no file backing".to_string()))
    }

    /// Evicts what it can of `victims`; busy leaves are handed back to the cache.
    pub(super) fn evict_victims(&self, victims: Victims) -> Result<(), MdBoxError> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        for (id, n) in victims {
            let node = self.node(id)?;
            let Some(mut slot) = node.try_write() else {
                backing.restore(id, n)?;
                continue;
            };
            if let NodeSlot::Box(data) = &mut *slot {
                backing.evict(id, data)?;
            }
        }
        Ok(())
    }

    /// Brings the cache's view of resident leaf sizes up to date and evicts
    /// least recently used leaves while over capacity.
    pub fn rebalance_cache(&self) -> Result<(), MdBoxError> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let mut victims = Vec::new();
        for node in self.snapshot()? {
            if let NodeSlot::Box(data) = &*node.read()? {
                if data.is_resident() && !data.events().is_empty() {
                    victims.extend(backing.resize(node.id(), data.events().len())?);
                }
            }
        }
        self.evict_victims(victims)
    }

    /// Writes every leaf with unsaved events to the event file; buffers stay as they are.
    /// Returns the number of leaves written.
    ///
    /// # Errors
    /// `Configuration` without file backing, `Io` on write failure.
    pub fn save_all(&self) -> Result<usize, MdBoxError> {
        let backing = self.require_backing()?;
        let mut written = 0;
        for node in self.leaves_by_file_position()? {
            if let NodeSlot::Box(data) = &mut *node.write()? {
                if data.is_resident() {
                    if backing.write_back(data)? {
                        written += 1;
                    }
                } else if !data.pending().is_empty() {
                    backing.evict(node.id(), data)?;
                    written += 1;
                }
            }
        }
        backing.flush()?;
        debug!("Saved {} leaves to {}", written, backing.file().path().display());
        Ok(written)
    }

    /// Moves every leaf buffer to disk. Returns the number of leaves evicted.
    ///
    /// # Errors
    /// `Configuration` without file backing, `Io` on write failure.
    pub fn evict_all(&self) -> Result<usize, MdBoxError> {
        let backing = self.require_backing()?;
        let mut evicted = 0;
        for node in self.leaves_by_file_position()? {
            if let NodeSlot::Box(data) = &mut *node.write()? {
                if data.is_resident() && data.events().is_empty() && !data.is_file_backed() {
                    continue;
                }
                if data.is_resident() || !data.pending().is_empty() {
                    backing.evict(node.id(), data)?;
                    evicted += 1;
                }
            }
        }
        backing.flush()?;
        info!("Evicted {} leaves to {}", evicted, backing.file().path().display());
        Ok(evicted)
    }

    /// Leaves ordered by their position in the event file, for sequential scans.
    /// Leaves never written follow, by id.
    pub fn leaves_by_file_position(&self) -> Result<Vec<Arc<MdNode<ND>>>, MdBoxError> {
        let mut keyed = Vec::new();
        for node in self.leaves()? {
            let offset = match &*node.read()? {
                NodeSlot::Box(data) => data.file_extent().map(|e| e.offset),
                NodeSlot::Grid(_) => continue,
            };
            keyed.push((offset.unwrap_or(u64::MAX), node.id(), node));
        }
        keyed.sort_by_key(|(offset, id, _)| (*offset, *id));
        Ok(keyed.into_iter().map(|(_, _, node)| node).collect())
    }

    /// Drops every node and event, leaving a single empty root leaf.
    pub fn clear(&mut self) -> Result<(), MdBoxError> {
        let extents = self.extents()?;
        if let Some(backing) = &self.backing {
            for node in self.leaves()? {
                if let NodeSlot::Box(data) = &*node.read()? {
                    if let Some(extent) = data.file_extent() {
                        backing.release(extent)?;
                    }
                }
            }
            backing.clear_cache()?;
        }
        let nodes = self.nodes.get_mut().map_err(|_| MdBoxError::Lock("Node arena poisoned".to_string()))?;
        *nodes = vec![Arc::new(MdNode::root(extents))];
        self.controller.reset_num_boxes();
        Ok(())
    }

    /// Appends `nodes` to the arena; their ids must continue the arena's numbering.
    pub(super) fn push_nodes(&self, build: impl FnOnce(usize) -> Vec<MdNode<ND>>) -> Result<Vec<NodeId>, MdBoxError> {
        let mut nodes = self.nodes.write().map_err(write_lock_poisoned_with_context("node arena"))?;
        let first = nodes.len();
        let built = build(first);
        let mut ids = Vec::with_capacity(built.len());
        for (offset, node) in built.into_iter().enumerate() {
            if node.id().index() != first + offset {
                return Err(MdBoxError::Internal(format!(
                    "Node {} allocated at arena slot {}",
                    node.id(),
                    first + offset
                )));
            }
            ids.push(node.id());
            nodes.push(Arc::new(node));
        }
        Ok(ids)
    }
}
