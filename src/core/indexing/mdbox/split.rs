// src/core/indexing/mdbox/split.rs

//! Converting overfull leaf boxes into grid boxes.

use super::event::MdEvent;
use super::grid_box::{child_index_for, unravel, GridData};
use super::md_box::BoxData;
use super::node::{Aggregates, MdNode, NodeSlot};
use super::tree::BoxTree;
use crate::core::common::{MdBoxError, NodeId};
use crate::core::scheduler::{Spawner, ThreadScheduler};
use log::debug;
use std::sync::Arc;

impl<const ND: usize> BoxTree<ND> {
    /// Turns leaf `id` into a grid box, redistributing its events into fresh child
    /// leaves. A file-backed leaf is loaded first.
    ///
    /// Runs under the leaf's insertion lock, so it happens after every append that
    /// already holds the lock and before any append routed to the new grid.
    /// Returns `false` if the node is already a grid or sits at the maximum depth.
    ///
    /// # Errors
    /// `Io` if the leaf's events cannot be loaded; the leaf is then left as it was.
    pub fn split_box(&self, id: NodeId) -> Result<bool, MdBoxError> {
        let node = self.node(id)?;
        let depth = node.depth();
        if depth >= self.controller.max_depth() {
            return Ok(false);
        }
        let split_into = self.controller.split_into_array::<ND>()?;
        let num_split = self.controller.num_split();

        let (children, sizes, old_extent) = {
            let mut slot = node.write()?;
            let NodeSlot::Box(data) = &mut *slot else {
                return Ok(false);
            };
            if let Some(backing) = &self.backing {
                backing.load_for_split(data)?;
            }

            let mut buckets: Vec<Vec<MdEvent<ND>>> = vec![Vec::new(); num_split];
            for event in data.events() {
                buckets[child_index_for(node.extents(), &split_into, event.center())].push(*event);
            }
            let total = Aggregates::from_events(data.events());
            let sizes: Vec<usize> = buckets.iter().map(Vec::len).collect();

            let parent: &MdNode<ND> = &node;
            let children = self.push_nodes(|first| {
                buckets
                    .into_iter()
                    .enumerate()
                    .map(|(i, events)| {
                        let idx = unravel(i, &split_into);
                        let mut closed_upper = *parent.closed_upper();
                        for d in 0..ND {
                            closed_upper[d] &= idx[d] + 1 == split_into[d];
                        }
                        MdNode::new(
                            NodeId(first + i),
                            depth + 1,
                            Some(id),
                            parent.extents().child(&idx, &split_into),
                            closed_upper,
                            parent.lineage_flags(),
                            NodeSlot::Box(BoxData::with_events(events)),
                        )
                    })
                    .collect()
            })?;

            let (events, old_extent) = data.take_events();
            *slot = NodeSlot::Grid(GridData::new(split_into, children.clone(), total));
            debug!(
                "Split {} at depth {} into {} children ({} events)",
                id,
                depth,
                num_split,
                events.len()
            );
            (children, sizes, old_extent)
        };
        self.controller.track_num_boxes(depth);

        if let Some(backing) = &self.backing {
            if let Some(extent) = old_extent {
                backing.release(extent)?;
            }
            backing.forget(id)?;
            let mut victims = Vec::new();
            for (child, n) in children.into_iter().zip(sizes) {
                if n > 0 {
                    victims.extend(backing.resize(child, n)?);
                }
            }
            self.evict_victims(victims)?;
        }
        Ok(true)
    }

    /// Splits every leaf over the split threshold, recursively, then rebalances the
    /// leaf cache. With a scheduler, each subtree needing work becomes its own task.
    ///
    /// # Errors
    /// The first error raised by any split.
    pub fn split_all_if_needed(self: &Arc<Self>, scheduler: Option<&ThreadScheduler>) -> Result<(), MdBoxError> {
        match scheduler {
            Some(scheduler) => {
                let tree = Arc::clone(self);
                scheduler.submit(move |spawner| tree.split_subtree(NodeId::ROOT, Some(spawner)));
                scheduler.join_all()?;
            }
            None => self.split_subtree(NodeId::ROOT, None)?,
        }
        self.rebalance_cache()
    }

    fn needs_split_pass(&self, id: NodeId) -> Result<bool, MdBoxError> {
        let node = self.node(id)?;
        let slot = node.read()?;
        Ok(match &*slot {
            NodeSlot::Grid(_) => true,
            NodeSlot::Box(data) => self.controller.will_split(data.n_points() as usize, node.depth()),
        })
    }

    fn split_subtree(self: &Arc<Self>, id: NodeId, spawner: Option<&Spawner>) -> Result<(), MdBoxError> {
        let node = self.node(id)?;
        let leaf_points = match &*node.read()? {
            NodeSlot::Box(data) => Some(data.n_points()),
            NodeSlot::Grid(_) => None,
        };
        if let Some(n) = leaf_points {
            if !self.controller.will_split(n as usize, node.depth()) || !self.split_box(id)? {
                return Ok(());
            }
        }

        let children = match &*node.read()? {
            NodeSlot::Grid(grid) => grid.children().to_vec(),
            NodeSlot::Box(_) => return Ok(()),
        };
        for child in children {
            if !self.needs_split_pass(child)? {
                continue;
            }
            match spawner {
                Some(spawner) => {
                    let tree = Arc::clone(self);
                    spawner.submit(move |spawner| tree.split_subtree(child, Some(spawner)));
                }
                None => self.split_subtree(child, None)?,
            }
        }
        Ok(())
    }
}
