// src/api/workspace.rs

use crate::api::types::{EventBatch, IngestReport, WorkspaceStats};
use crate::core::common::{MdBoxError, NodeId};
use crate::core::config::WorkspaceConfig;
use crate::core::indexing::mdbox::{
    BoxController, BoxTree, Extents, FileBackend, ImplicitFunction, IntegrationResult, MdEvent, NodeSummary,
};
use crate::core::scheduler::ThreadScheduler;
use crate::core::storage::engine::EventFile;
use log::info;
use std::fs;
use std::sync::Arc;

/// An `ND`-dimensional event workspace: configuration, box tree and worker pool.
///
/// This is the entry point for callers that ingest event batches and query the
/// resulting tree. Lower-level control is available through [`MdEventWorkspace::tree`].
#[derive(Debug)]
pub struct MdEventWorkspace<const ND: usize> {
    config: WorkspaceConfig,
    tree: Arc<BoxTree<ND>>,
    scheduler: ThreadScheduler,
}

impl<const ND: usize> MdEventWorkspace<ND> {
    /// Builds the workspace described by `config`. With file backing, the event
    /// file is created (or truncated) and its directory created if needed.
    ///
    /// # Errors
    /// Returns `MdBoxError` if:
    /// - The configuration is invalid or has other than `ND` dimensions
    /// - The event file cannot be created
    /// - The worker threads cannot be spawned
    pub fn new(config: WorkspaceConfig) -> Result<Self, MdBoxError> {
        config.validate()?;
        let extents = config.extents::<ND>()?;
        let controller = Arc::new(config.to_box_controller()?);
        let tree = match &config.file_backing {
            Some(backing) => {
                if let Some(dir) = backing.path.parent() {
                    if !dir.as_os_str().is_empty() {
                        fs::create_dir_all(dir)?;
                    }
                }
                let file = EventFile::create(&backing.path, ND)?;
                BoxTree::with_file_backing(
                    extents,
                    controller,
                    FileBackend::new(file, backing.cache_capacity_events),
                )?
            }
            None => BoxTree::new(extents, controller)?,
        };
        let scheduler = ThreadScheduler::new(config.num_threads)?;
        info!(
            "Created {}-dimensional workspace with {} workers{}",
            ND,
            scheduler.num_threads(),
            if tree.is_file_backed() { ", file backed" } else { "" }
        );
        Ok(Self { config, tree: Arc::new(tree), scheduler })
    }

    pub const fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub const fn tree(&self) -> &Arc<BoxTree<ND>> {
        &self.tree
    }

    pub fn controller(&self) -> &Arc<BoxController> {
        self.tree.controller()
    }

    pub const fn scheduler(&self) -> &ThreadScheduler {
        &self.scheduler
    }

    pub fn extents(&self) -> Result<Extents<ND>, MdBoxError> {
        self.tree.extents()
    }

    /// Ingests a batch in parallel, splits overfull leaves and refreshes the
    /// cached aggregates. Rows with the wrong number of coordinates and events
    /// outside the extents are counted and skipped; the rest of the batch goes in.
    ///
    /// # Errors
    /// `InvalidInput` if the batch columns differ in length (nothing is ingested),
    /// otherwise the first error raised while inserting or splitting.
    pub fn add_events(&self, batch: &EventBatch) -> Result<IngestReport, MdBoxError> {
        let (events, malformed) = batch.to_events::<ND>()?;
        let out_of_bounds = self.tree.add_events_parallel(&events, &self.scheduler)?;
        self.tree.split_all_if_needed(Some(&self.scheduler))?;
        self.tree.refresh_cache()?;

        let report = IngestReport { accepted: events.len() - out_of_bounds, out_of_bounds, malformed };
        if report.dropped() > 0 {
            info!(
                "Dropped {} of {} events ({} out of bounds, {} malformed)",
                report.dropped(),
                batch.len(),
                out_of_bounds,
                malformed
            );
        }
        Ok(report)
    }

    /// Inserts one event without splitting; call [`MdEventWorkspace::split_all`] afterwards.
    /// A file-backed workspace keeps its leaf cache within capacity as events arrive.
    pub fn add_event(&self, event: MdEvent<ND>) -> Result<bool, MdBoxError> {
        self.tree.add_event(event)
    }

    /// Splits every overfull leaf on the worker pool, then refreshes the aggregates.
    pub fn split_all(&self) -> Result<(), MdBoxError> {
        self.tree.split_all_if_needed(Some(&self.scheduler))?;
        self.tree.refresh_cache()
    }

    pub fn refresh_cache(&self) -> Result<(), MdBoxError> {
        self.tree.refresh_cache()
    }

    pub fn n_points(&self) -> Result<u64, MdBoxError> {
        self.tree.n_points()
    }

    pub fn total_data_size(&self) -> Result<u64, MdBoxError> {
        self.tree.total_data_size()
    }

    pub fn integrate(&self, function: &ImplicitFunction<ND>) -> Result<IntegrationResult, MdBoxError> {
        self.tree.integrate(function)
    }

    pub fn integrate_sphere(&self, center: [f64; ND], radius_squared: f64) -> Result<(f64, f64), MdBoxError> {
        self.tree.integrate_sphere(center, radius_squared)
    }

    pub fn bin_region(&self, region: &Extents<ND>) -> Result<IntegrationResult, MdBoxError> {
        self.tree.bin_region(region)
    }

    pub fn centroid_sphere(&self, center: [f64; ND], radius_squared: f64) -> Result<Option<[f64; ND]>, MdBoxError> {
        self.tree.centroid_sphere(center, radius_squared)
    }

    pub fn get_boxes(
        &self,
        max_depth: usize,
        leaf_only: bool,
        function: Option<&ImplicitFunction<ND>>,
    ) -> Result<Vec<NodeSummary<ND>>, MdBoxError> {
        self.tree.get_boxes(max_depth, leaf_only, function)
    }

    pub fn mask(&self, id: NodeId) -> Result<(), MdBoxError> {
        self.tree.mask(id)
    }

    pub fn unmask(&self, id: NodeId) -> Result<(), MdBoxError> {
        self.tree.unmask(id)
    }

    /// Writes every unsaved leaf to the event file. Returns the number of leaves written.
    ///
    /// # Errors
    /// `Configuration` if the workspace is not file backed.
    pub fn save(&self) -> Result<usize, MdBoxError> {
        self.tree.save_all()
    }

    /// # Errors
    /// `Configuration` if the workspace is not file backed.
    pub fn evict_all(&self) -> Result<usize, MdBoxError> {
        self.tree.evict_all()
    }

    /// Drops every event and node, keeping the configuration.
    ///
    /// # Errors
    /// `Internal` if the tree is still shared with another owner.
    pub fn clear(&mut self) -> Result<(), MdBoxError> {
        let tree = Arc::get_mut(&mut self.tree).ok_or_else(|| {
            MdBoxError::Internal("The box tree is shared and cannot be cleared".to_string())
        })?;
        tree.clear()?;
        info!("Cleared {}-dimensional workspace", ND);
        Ok(())
    }

    pub fn stats(&self) -> Result<WorkspaceStats, MdBoxError> {
        let controller = self.tree.controller();
        let resident_events = match self.tree.file_backend() {
            Some(backing) => Some(backing.resident_events()?),
            None => None,
        };
        Ok(WorkspaceStats {
            n_dims: ND,
            n_points: self.tree.n_points()?,
            total_data_size: self.tree.total_data_size()?,
            num_nodes: self.tree.num_nodes()?,
            num_leaves: self.tree.leaves()?.len(),
            leaf_boxes_per_depth: controller.num_md_boxes(),
            grid_boxes_per_depth: controller.num_md_grid_boxes(),
            average_depth: controller.average_depth(),
            file_backed: self.tree.is_file_backed(),
            resident_events,
        })
    }
}
