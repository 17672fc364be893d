// src/core/indexing/mdbox/node.rs

//! Tree nodes: a fixed identity (id, depth, parent, extents) around a slot that
//! holds either a leaf box or a grid box.
//!
//! Converting a box into a grid replaces the slot's variant under its write
//! lock; the node itself, and every `NodeId` that refers to it, stays valid.

use super::event::MdEvent;
use super::extents::Extents;
use super::grid_box::GridData;
use super::md_box::BoxData;
use crate::core::common::lock_utils::{read_lock_poisoned, write_lock_poisoned};
use crate::core::common::{MdBoxError, NodeId};
use crate::core::storage::engine::FileExtent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Signal, squared error, count and signal-weighted coordinate sums of a set of events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregates<const ND: usize> {
    pub n_points: u64,
    pub signal: f64,
    pub error_squared: f64,
    pub weighted_center: [f64; ND],
}

impl<const ND: usize> Default for Aggregates<ND> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const ND: usize> Aggregates<ND> {
    pub const fn empty() -> Self {
        Self { n_points: 0, signal: 0.0, error_squared: 0.0, weighted_center: [0.0; ND] }
    }

    pub fn from_events(events: &[MdEvent<ND>]) -> Self {
        let mut agg = Self::empty();
        for event in events {
            agg.add_event(event);
        }
        agg
    }

    pub fn add_event(&mut self, event: &MdEvent<ND>) {
        self.n_points += 1;
        self.signal += event.signal();
        self.error_squared += event.error_squared();
        for (acc, &c) in self.weighted_center.iter_mut().zip(event.center().iter()) {
            *acc += event.signal() * f64::from(c);
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.n_points += other.n_points;
        self.signal += other.signal;
        self.error_squared += other.error_squared;
        for (acc, &c) in self.weighted_center.iter_mut().zip(other.weighted_center.iter()) {
            *acc += c;
        }
    }

    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        self.merge(other);
        self
    }

    /// Signal-weighted mean position; `None` when the signal sums to zero.
    pub fn centroid(&self) -> Option<[f64; ND]> {
        if self.signal == 0.0 {
            return None;
        }
        let mut c = self.weighted_center;
        for v in &mut c {
            *v /= self.signal;
        }
        Some(c)
    }
}

/// The two node variants.
#[derive(Debug, Clone)]
pub enum NodeSlot<const ND: usize> {
    Box(BoxData<ND>),
    Grid(GridData<ND>),
}

impl<const ND: usize> NodeSlot<ND> {
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Box(_))
    }

    pub fn n_points(&self) -> u64 {
        match self {
            Self::Box(data) => data.n_points(),
            Self::Grid(grid) => grid.aggregates().n_points,
        }
    }

    pub const fn aggregates(&self) -> &Aggregates<ND> {
        match self {
            Self::Box(data) => data.aggregates(),
            Self::Grid(grid) => grid.aggregates(),
        }
    }

    pub const fn is_stale(&self) -> bool {
        match self {
            Self::Box(data) => data.is_stale(),
            Self::Grid(grid) => grid.is_stale(),
        }
    }
}

/// Point-in-time copy of a node's metadata and cached aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary<const ND: usize> {
    pub id: NodeId,
    pub depth: usize,
    pub parent: Option<NodeId>,
    pub extents: Extents<ND>,
    pub is_leaf: bool,
    pub n_points: u64,
    pub signal: f64,
    pub error_squared: f64,
    /// Set on this node or inherited from a masked ancestor.
    pub masked: bool,
    /// The cached aggregates predate an insertion somewhere under this node.
    pub stale: bool,
    pub file_extent: Option<FileExtent>,
    pub resident: bool,
}

#[derive(Debug)]
pub struct MdNode<const ND: usize> {
    id: NodeId,
    depth: usize,
    parent: Option<NodeId>,
    extents: Extents<ND>,
    closed_upper: [bool; ND],
    masked: AtomicBool,
    /// Raised when an event lands anywhere below this grid; cleared by a refresh.
    stale: Arc<AtomicBool>,
    /// The `stale` flags of every ancestor, root first.
    ancestor_flags: Vec<Arc<AtomicBool>>,
    slot: RwLock<NodeSlot<ND>>,
}

impl<const ND: usize> MdNode<ND> {
    pub(crate) fn new(
        id: NodeId,
        depth: usize,
        parent: Option<NodeId>,
        extents: Extents<ND>,
        closed_upper: [bool; ND],
        ancestor_flags: Vec<Arc<AtomicBool>>,
        slot: NodeSlot<ND>,
    ) -> Self {
        Self {
            id,
            depth,
            parent,
            extents,
            closed_upper,
            masked: AtomicBool::new(false),
            stale: Arc::new(AtomicBool::new(false)),
            ancestor_flags,
            slot: RwLock::new(slot),
        }
    }

    /// An empty root leaf covering `extents`, closed on every upper face.
    pub(crate) fn root(extents: Extents<ND>) -> Self {
        Self::new(NodeId::ROOT, 0, None, extents, [true; ND], Vec::new(), NodeSlot::Box(BoxData::new()))
    }

    pub const fn id(&self) -> NodeId {
        self.id
    }

    pub const fn depth(&self) -> usize {
        self.depth
    }

    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub const fn extents(&self) -> &Extents<ND> {
        &self.extents
    }

    /// Dimensions on which this node is the last bin and so includes its max.
    pub const fn closed_upper(&self) -> &[bool; ND] {
        &self.closed_upper
    }

    pub fn volume(&self) -> f64 {
        self.extents.volume()
    }

    /// Whether this node's bin owns `coords` under the half-open convention.
    pub fn owns_point(&self, coords: &[f32; ND]) -> bool {
        self.extents.owns_point(coords, &self.closed_upper)
    }

    pub fn is_masked(&self) -> bool {
        self.masked.load(Ordering::Acquire)
    }

    pub fn mask(&self) {
        self.masked.store(true, Ordering::Release);
    }

    pub fn unmask(&self) {
        self.masked.store(false, Ordering::Release);
    }

    /// Whether the cached aggregates are out of date: the leaf has unrefreshed
    /// events, or an event reached some leaf under this grid since its last refresh.
    pub fn is_stale(&self) -> Result<bool, MdBoxError> {
        let own = self.stale.load(Ordering::Acquire);
        Ok(own || self.read()?.is_stale())
    }

    /// Ancestor flags for a child of this node.
    pub(crate) fn lineage_flags(&self) -> Vec<Arc<AtomicBool>> {
        let mut flags = self.ancestor_flags.clone();
        flags.push(Arc::clone(&self.stale));
        flags
    }

    /// Marks every ancestor grid stale after an append to this leaf.
    pub(crate) fn invalidate_ancestors(&self) {
        for flag in &self.ancestor_flags {
            flag.store(true, Ordering::Release);
        }
    }

    /// Called by a refresh before it revisits the children, so that an append
    /// racing with the refresh leaves the flag raised.
    pub(crate) fn clear_stale(&self) {
        self.stale.store(false, Ordering::Release);
    }

    /// # Errors
    /// `Lock` if the slot is poisoned.
    pub fn read(&self) -> Result<RwLockReadGuard<'_, NodeSlot<ND>>, MdBoxError> {
        self.slot.read().map_err(read_lock_poisoned)
    }

    /// # Errors
    /// `Lock` if the slot is poisoned.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, NodeSlot<ND>>, MdBoxError> {
        self.slot.write().map_err(write_lock_poisoned)
    }

    /// Non-blocking write lock; `None` if the slot is busy or poisoned.
    pub(crate) fn try_write(&self) -> Option<RwLockWriteGuard<'_, NodeSlot<ND>>> {
        self.slot.try_write().ok()
    }

    pub fn is_leaf(&self) -> Result<bool, MdBoxError> {
        Ok(self.read()?.is_leaf())
    }

    /// Events under this node: live for a leaf, as of the last refresh for a grid.
    pub fn n_points(&self) -> Result<u64, MdBoxError> {
        Ok(self.read()?.n_points())
    }

    pub fn aggregates(&self) -> Result<Aggregates<ND>, MdBoxError> {
        Ok(*self.read()?.aggregates())
    }

    pub fn signal(&self) -> Result<f64, MdBoxError> {
        Ok(self.read()?.aggregates().signal)
    }

    pub fn error_squared(&self) -> Result<f64, MdBoxError> {
        Ok(self.read()?.aggregates().error_squared)
    }

    pub fn error(&self) -> Result<f64, MdBoxError> {
        Ok(self.error_squared()?.sqrt())
    }

    /// Signal per unit volume, NaN for a masked node.
    pub fn signal_normalized(&self) -> Result<f64, MdBoxError> {
        if self.is_masked() {
            return Ok(f64::NAN);
        }
        Ok(self.signal()? / self.volume())
    }

    pub fn centroid(&self) -> Result<Option<[f64; ND]>, MdBoxError> {
        Ok(self.read()?.aggregates().centroid())
    }

    pub fn is_resident(&self) -> Result<bool, MdBoxError> {
        Ok(match &*self.read()? {
            NodeSlot::Box(data) => data.is_resident(),
            NodeSlot::Grid(_) => true,
        })
    }

    pub fn is_file_backed(&self) -> Result<bool, MdBoxError> {
        Ok(match &*self.read()? {
            NodeSlot::Box(data) => data.is_file_backed(),
            NodeSlot::Grid(_) => false,
        })
    }

    pub fn summary(&self) -> Result<NodeSummary<ND>, MdBoxError> {
        let slot = self.read()?;
        let (file_extent, resident) = match &*slot {
            NodeSlot::Box(data) => (data.file_extent(), data.is_resident()),
            NodeSlot::Grid(_) => (None, true),
        };
        let agg = slot.aggregates();
        Ok(NodeSummary {
            id: self.id,
            depth: self.depth,
            parent: self.parent,
            extents: self.extents,
            is_leaf: slot.is_leaf(),
            n_points: slot.n_points(),
            signal: agg.signal,
            error_squared: agg.error_squared,
            masked: self.is_masked(),
            stale: self.stale.load(Ordering::Acquire) || slot.is_stale(),
            file_extent,
            resident,
        })
    }

    /// Takes this leaf's insertion lock for a run of unlocked appends.
    ///
    /// # Errors
    /// `UnexpectedNodeType` if the node has been split into a grid, `Lock` on poisoning.
    pub fn lock_box(&self) -> Result<BoxWriter<'_, ND>, MdBoxError> {
        let guard = self.write()?;
        if !guard.is_leaf() {
            return Err(MdBoxError::UnexpectedNodeType { id: self.id, expected: "box" });
        }
        Ok(BoxWriter { node: self, guard })
    }
}

/// Exclusive append access to one leaf.
///
/// Holding the writer is the caller's proof of exclusion, so the
/// `*_unsafe` methods append without any further locking.
#[derive(Debug)]
pub struct BoxWriter<'a, const ND: usize> {
    node: &'a MdNode<ND>,
    guard: RwLockWriteGuard<'a, NodeSlot<ND>>,
}

impl<'a, const ND: usize> BoxWriter<'a, ND> {
    pub const fn node(&self) -> &MdNode<ND> {
        self.node
    }

    fn data(&mut self) -> Option<&mut BoxData<ND>> {
        match &mut *self.guard {
            NodeSlot::Box(data) => Some(data),
            NodeSlot::Grid(_) => None,
        }
    }

    /// Appends `event` if this leaf owns its coordinates; returns whether it was kept.
    pub fn add_event_unsafe(&mut self, event: MdEvent<ND>) -> bool {
        if !self.node.owns_point(event.center()) {
            return false;
        }
        match self.data() {
            Some(data) => {
                data.push(event);
                self.node.invalidate_ancestors();
                true
            }
            None => false,
        }
    }

    /// Appends every owned event in order; returns how many were dropped as out of extents.
    pub fn add_events_unsafe(&mut self, events: &[MdEvent<ND>]) -> usize {
        let node = self.node;
        let before = events.len();
        let kept: Vec<MdEvent<ND>> =
            events.iter().filter(|e| node.owns_point(e.center())).copied().collect();
        let dropped = before - kept.len();
        match self.data() {
            Some(data) => {
                let appended = !kept.is_empty();
                data.extend(kept);
                if appended {
                    self.node.invalidate_ancestors();
                }
                dropped
            }
            None => before,
        }
    }

    pub fn n_points(&self) -> u64 {
        self.guard.n_points()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn leaf() -> MdNode<2> {
        MdNode::root(Extents::cube(0.0, 10.0).unwrap())
    }

    #[test]
    fn test_aggregates_merge_and_centroid() {
        let a = Aggregates::from_events(&[MdEvent::<2>::at([1.0, 2.0], 1.0, 0.5)]);
        let b = Aggregates::from_events(&[MdEvent::<2>::at([3.0, 4.0], 3.0, 1.5)]);
        let m = a.merged(&b);
        assert_eq!(m.n_points, 2);
        assert_relative_eq!(m.signal, 4.0);
        assert_relative_eq!(m.error_squared, 2.0);
        let c = m.centroid().unwrap();
        assert_relative_eq!(c[0], 2.5);
        assert_relative_eq!(c[1], 3.5);
        assert_eq!(Aggregates::<2>::empty().centroid(), None);
    }

    #[test]
    fn test_box_writer_filters_by_extents() {
        let node = leaf();
        {
            let mut writer = node.lock_box().unwrap();
            assert!(writer.add_event_unsafe(MdEvent::at([10.0, 10.0], 1.0, 1.0)));
            assert!(!writer.add_event_unsafe(MdEvent::at([10.5, 1.0], 1.0, 1.0)));
            let dropped = writer.add_events_unsafe(&[
                MdEvent::at([1.0, 1.0], 1.0, 1.0),
                MdEvent::at([-1.0, 1.0], 1.0, 1.0),
                MdEvent::at([f32::NAN, 1.0], 1.0, 1.0),
            ]);
            assert_eq!(dropped, 2);
            assert_eq!(writer.n_points(), 2);
        }
        assert_eq!(node.n_points().unwrap(), 2);
    }

    #[test]
    fn test_masking_and_normalized_signal() {
        let node = leaf();
        {
            let mut writer = node.lock_box().unwrap();
            writer.add_event_unsafe(MdEvent::at([1.0, 1.0], 50.0, 1.0));
        }
        if let NodeSlot::Box(data) = &mut *node.write().unwrap() {
            data.refresh();
        }
        assert_relative_eq!(node.signal_normalized().unwrap(), 0.5);
        node.mask();
        assert!(node.signal_normalized().unwrap().is_nan());
        node.unmask();
        assert!(!node.is_masked());
    }

    #[test]
    fn test_lock_box_rejects_grid() {
        let node = leaf();
        *node.write().unwrap() = NodeSlot::Grid(GridData::new([2, 2], Vec::new(), Aggregates::empty()));
        let err = node.lock_box().unwrap_err();
        assert!(matches!(err, MdBoxError::UnexpectedNodeType { expected: "box", .. }));
    }

    #[test]
    fn test_summary_reports_leaf_state() {
        let node = leaf();
        let summary = node.summary().unwrap();
        assert_eq!(summary.id, NodeId::ROOT);
        assert_eq!(summary.depth, 0);
        assert!(summary.is_leaf);
        assert!(summary.resident);
        assert_eq!(summary.file_extent, None);
        assert_relative_eq!(node.volume(), 100.0);
    }
}
