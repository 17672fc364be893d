// src/core/indexing/mdbox/ingest.rs

//! Bulk insertion spread over the worker pool.

use super::event::MdEvent;
use super::tree::BoxTree;
use crate::core::common::MdBoxError;
use crate::core::scheduler::ThreadScheduler;
use log::{debug, trace};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

impl<const ND: usize> BoxTree<ND> {
    /// Inserts `events` in parallel: `events_per_task` events per task, and a join
    /// after every block of `tasks_per_block` tasks. Between blocks, overfull
    /// leaves are split once the controller says enough events have arrived.
    ///
    /// Within one task, events reach their leaf in submission order. Returns how
    /// many events were dropped as out of extents.
    ///
    /// # Errors
    /// The first error raised by any insertion or split task.
    pub fn add_events_parallel(
        self: &Arc<Self>,
        events: &[MdEvent<ND>],
        scheduler: &ThreadScheduler,
    ) -> Result<usize, MdBoxError> {
        let params = self.controller.adding_events_parameters();
        let per_task = params.events_per_task.max(1);
        let per_block = per_task.saturating_mul(params.tasks_per_block.max(1));
        let dropped = Arc::new(AtomicUsize::new(0));
        let mut since_split = 0usize;

        for (block_index, block) in events.chunks(per_block).enumerate() {
            for chunk in block.chunks(per_task) {
                let tree = Arc::clone(self);
                let chunk = chunk.to_vec();
                let dropped = Arc::clone(&dropped);
                scheduler.submit(move |_| {
                    let n = tree.add_events(&chunk)?;
                    dropped.fetch_add(n, Ordering::Relaxed);
                    Ok(())
                });
            }
            scheduler.join_all()?;
            trace!("Inserted block {} ({} events)", block_index, block.len());

            since_split += block.len();
            if self.controller.should_split_boxes(since_split) {
                debug!("Splitting after {} added events", since_split);
                self.split_all_if_needed(Some(scheduler))?;
                since_split = 0;
            }
        }
        self.rebalance_cache()?;
        Ok(dropped.load(Ordering::Relaxed))
    }
}
