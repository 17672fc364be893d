// src/api/types.rs
//! Data structures passed across the workspace API.

use crate::core::common::MdBoxError;
use crate::core::indexing::mdbox::MdEvent;
use serde::{Deserialize, Serialize};

/// Events as parallel columns, one entry per event in every column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub signal: Vec<f64>,
    pub error_squared: Vec<f64>,
    pub coordinates: Vec<Vec<f32>>,
    pub run_index: Vec<u16>,
    pub detector_id: Vec<u32>,
}

impl EventBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self {
            signal: Vec::with_capacity(n),
            error_squared: Vec::with_capacity(n),
            coordinates: Vec::with_capacity(n),
            run_index: Vec::with_capacity(n),
            detector_id: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, signal: f64, error_squared: f64, coordinates: &[f32], run_index: u16, detector_id: u32) {
        self.signal.push(signal);
        self.error_squared.push(error_squared);
        self.coordinates.push(coordinates.to_vec());
        self.run_index.push(run_index);
        self.detector_id.push(detector_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.signal.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signal.is_empty()
    }

    /// Checks that every column has the same length and returns it.
    ///
    /// # Errors
    /// `InvalidInput` naming the first column whose length differs from `signal`.
    pub fn validate(&self) -> Result<usize, MdBoxError> {
        let n = self.signal.len();
        let columns = [
            ("error_squared", self.error_squared.len()),
            ("coordinates", self.coordinates.len()),
            ("run_index", self.run_index.len()),
            ("detector_id", self.detector_id.len()),
        ];
        for (name, len) in columns {
            if len != n {
                return Err(MdBoxError::invalid_input(format!(
                    "Column '{}' has {} entries but 'signal' has {}",
                    name, len, n
                )));
            }
        }
        Ok(n)
    }

    /// Converts the rows with exactly `ND` coordinates into events.
    /// Returns them with the number of rows skipped for a wrong coordinate count.
    ///
    /// # Errors
    /// As [`EventBatch::validate`].
    pub fn to_events<const ND: usize>(&self) -> Result<(Vec<MdEvent<ND>>, usize), MdBoxError> {
        let n = self.validate()?;
        let mut events = Vec::with_capacity(n);
        let mut malformed = 0;
        for i in 0..n {
            let Ok(center) = <[f32; ND]>::try_from(self.coordinates[i].as_slice()) else {
                malformed += 1;
                continue;
            };
            events.push(MdEvent::new(
                self.signal[i],
                self.error_squared[i],
                center,
                self.run_index[i],
                self.detector_id[i],
            ));
        }
        Ok((events, malformed))
    }
}

/// Outcome of one ingestion call. Dropped events are counted, never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub out_of_bounds: usize,
    pub malformed: usize,
}

impl IngestReport {
    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.out_of_bounds + self.malformed
    }
}

/// Whole-workspace figures for progress reporting and memory budgeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceStats {
    pub n_dims: usize,
    /// Events under the root as of the last refresh.
    pub n_points: u64,
    /// Live count of stored events, in memory or on disk.
    pub total_data_size: u64,
    pub num_nodes: usize,
    pub num_leaves: usize,
    pub leaf_boxes_per_depth: Vec<usize>,
    pub grid_boxes_per_depth: Vec<usize>,
    pub average_depth: f64,
    pub file_backed: bool,
    pub resident_events: Option<usize>,
}

impl WorkspaceStats {
    /// # Errors
    /// `Json` if serialization fails.
    pub fn to_json(&self) -> Result<String, MdBoxError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
