// src/core/config.rs

//! Workspace configuration: dimensions, split policy, threading and file backing.
//!
//! Stored as TOML. Every field has a default, so a file only needs the
//! values it changes.

use crate::core::common::MdBoxError;
use crate::core::indexing::mdbox::controller::{BoxController, MAX_CHILDREN_PER_GRID, MAX_DEPTH};
use crate::core::indexing::mdbox::extents::Extents;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name, units and range of one workspace dimension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimensionConfig {
    pub name: String,
    #[serde(default)]
    pub units: String,
    pub min: f64,
    pub max: f64,
}

impl DimensionConfig {
    pub fn new(name: impl Into<String>, units: impl Into<String>, min: f64, max: f64) -> Self {
        Self { name: name.into(), units: units.into(), min, max }
    }
}

/// Where evicted leaf buffers go and how many events may stay in memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileBackingConfig {
    pub path: PathBuf,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity_events: usize,
}

const fn default_cache_capacity() -> usize {
    10_000_000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub dimensions: Vec<DimensionConfig>,
    /// One entry per dimension, or a single entry applied to all of them.
    pub split_into: Vec<usize>,
    pub split_threshold: usize,
    pub max_depth: usize,
    pub events_per_task: usize,
    /// 0 derives the block size from the number of physical cores.
    pub tasks_per_block: usize,
    /// 0 uses one worker per physical core.
    pub num_threads: usize,
    pub file_backing: Option<FileBackingConfig>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dimensions: ["Q_lab_x", "Q_lab_y", "Q_lab_z"]
                .iter()
                .map(|name| DimensionConfig::new(*name, "Angstrom^-1", -10.0, 10.0))
                .collect(),
            split_into: vec![5],
            split_threshold: 1000,
            max_depth: 5,
            events_per_task: 1000,
            tasks_per_block: 0,
            num_threads: 0,
            file_backing: None,
        }
    }
}

/// Builder for [`WorkspaceConfig`]; unset fields keep their defaults.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceConfigBuilder {
    dimensions: Option<Vec<DimensionConfig>>,
    split_into: Option<Vec<usize>>,
    split_threshold: Option<usize>,
    max_depth: Option<usize>,
    events_per_task: Option<usize>,
    tasks_per_block: Option<usize>,
    num_threads: Option<usize>,
    file_backing: Option<FileBackingConfig>,
}

impl WorkspaceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a dimension. The first call replaces the default dimensions.
    pub fn dimension(mut self, name: impl Into<String>, units: impl Into<String>, min: f64, max: f64) -> Self {
        self.dimensions.get_or_insert_with(Vec::new).push(DimensionConfig::new(name, units, min, max));
        self
    }

    pub fn dimensions(mut self, dimensions: Vec<DimensionConfig>) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn split_into(mut self, split_into: Vec<usize>) -> Self {
        self.split_into = Some(split_into);
        self
    }

    pub fn split_into_all(mut self, n: usize) -> Self {
        self.split_into = Some(vec![n]);
        self
    }

    pub fn split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = Some(threshold);
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    pub fn events_per_task(mut self, n: usize) -> Self {
        self.events_per_task = Some(n);
        self
    }

    pub fn tasks_per_block(mut self, n: usize) -> Self {
        self.tasks_per_block = Some(n);
        self
    }

    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    pub fn file_backing(mut self, path: impl Into<PathBuf>, cache_capacity_events: usize) -> Self {
        self.file_backing = Some(FileBackingConfig { path: path.into(), cache_capacity_events });
        self
    }

    /// # Errors
    /// `Configuration` if the result does not pass [`WorkspaceConfig::validate`].
    pub fn build(self) -> Result<WorkspaceConfig, MdBoxError> {
        let defaults = WorkspaceConfig::default();
        let config = WorkspaceConfig {
            dimensions: self.dimensions.unwrap_or(defaults.dimensions),
            split_into: self.split_into.unwrap_or(defaults.split_into),
            split_threshold: self.split_threshold.unwrap_or(defaults.split_threshold),
            max_depth: self.max_depth.unwrap_or(defaults.max_depth),
            events_per_task: self.events_per_task.unwrap_or(defaults.events_per_task),
            tasks_per_block: self.tasks_per_block.unwrap_or(defaults.tasks_per_block),
            num_threads: self.num_threads.unwrap_or(defaults.num_threads),
            file_backing: self.file_backing.or(defaults.file_backing),
        };
        config.validate()?;
        Ok(config)
    }
}

impl WorkspaceConfig {
    pub fn builder() -> WorkspaceConfigBuilder {
        WorkspaceConfigBuilder::new()
    }

    pub fn n_dims(&self) -> usize {
        self.dimensions.len()
    }

    /// # Errors
    /// `Configuration` naming the first offending field.
    pub fn validate(&self) -> Result<(), MdBoxError> {
        if self.dimensions.is_empty() {
            return Err(MdBoxError::Configuration("At least one dimension is required".to_string()));
        }
        for dim in &self.dimensions {
            if !dim.min.is_finite() || !dim.max.is_finite() || dim.min >= dim.max {
                return Err(MdBoxError::Configuration(format!(
                    "Dimension '{}' has invalid range [{}, {}]",
                    dim.name, dim.min, dim.max
                )));
            }
        }

        let per_dim = self.split_into_per_dimension()?;
        let mut product: usize = 1;
        for &n in &per_dim {
            if n == 0 {
                return Err(MdBoxError::Configuration("split_into entries must be at least 1".to_string()));
            }
            product = product.checked_mul(n).filter(|&p| p <= MAX_CHILDREN_PER_GRID).ok_or_else(|| {
                MdBoxError::Configuration(format!(
                    "split_into {:?} exceeds {} children per grid box",
                    per_dim, MAX_CHILDREN_PER_GRID
                ))
            })?;
        }
        if product < 2 {
            return Err(MdBoxError::Configuration("split_into must divide at least one dimension".to_string()));
        }

        if self.split_threshold == 0 {
            return Err(MdBoxError::Configuration("split_threshold must be greater than 0".to_string()));
        }
        if self.max_depth == 0 || self.max_depth > MAX_DEPTH {
            return Err(MdBoxError::Configuration(format!(
                "max_depth must be between 1 and {}, got {}",
                MAX_DEPTH, self.max_depth
            )));
        }
        if self.events_per_task == 0 {
            return Err(MdBoxError::Configuration("events_per_task must be greater than 0".to_string()));
        }
        if let Some(backing) = &self.file_backing {
            if backing.cache_capacity_events == 0 {
                return Err(MdBoxError::Configuration(
                    "file_backing.cache_capacity_events must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// `split_into` expanded to one entry per dimension.
    ///
    /// # Errors
    /// `Configuration` if its length is neither 1 nor the number of dimensions.
    pub fn split_into_per_dimension(&self) -> Result<Vec<usize>, MdBoxError> {
        match self.split_into.len() {
            1 => Ok(vec![self.split_into[0]; self.n_dims()]),
            n if n == self.n_dims() => Ok(self.split_into.clone()),
            n => Err(MdBoxError::Configuration(format!(
                "split_into has {} entries for {} dimensions",
                n,
                self.n_dims()
            ))),
        }
    }

    /// A controller carrying this configuration's split policy.
    ///
    /// # Errors
    /// `Configuration` if any policy value is rejected by the controller.
    pub fn to_box_controller(&self) -> Result<BoxController, MdBoxError> {
        let mut bc = BoxController::new(self.n_dims())?;
        bc.set_split_threshold(self.split_threshold)?;
        bc.set_max_depth(self.max_depth)?;
        for (dim, n) in self.split_into_per_dimension()?.into_iter().enumerate() {
            bc.set_split_into(dim, n)?;
        }
        let tasks_per_block = match self.tasks_per_block {
            0 => bc.adding_events_parameters().tasks_per_block,
            n => n,
        };
        bc.set_adding_events_parameters(self.events_per_task, tasks_per_block)?;
        Ok(bc)
    }

    /// The workspace extents for an `ND`-dimensional tree.
    ///
    /// # Errors
    /// `DimensionMismatch` if the configuration has another number of dimensions.
    pub fn extents<const ND: usize>(&self) -> Result<Extents<ND>, MdBoxError> {
        let bounds: Vec<(f64, f64)> = self.dimensions.iter().map(|d| (d.min, d.max)).collect();
        Extents::from_slice(&bounds)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `MdBoxError::Configuration` if parsing or validation fails, and
    /// `MdBoxError::Io` if the file exists but cannot be read. A missing file
    /// yields the default configuration.
    pub fn load_from_file(path: &Path) -> Result<Self, MdBoxError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Self = toml::from_str(&contents).map_err(|e| {
                    MdBoxError::Configuration(format!(
                        "Failed to parse config file '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                config.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(MdBoxError::Io(e)),
        }
    }

    /// # Errors
    /// As [`WorkspaceConfig::load_from_file`] when a path is given.
    pub fn load_or_default(optional_path: Option<&Path>) -> Result<Self, MdBoxError> {
        match optional_path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// # Errors
    /// `Configuration` if serialization fails, `Io` if the file cannot be written.
    pub fn save_to_file(&self, path: &Path) -> Result<(), MdBoxError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| MdBoxError::Configuration(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Two small dimensions, low thresholds and two workers.
    ///
    /// # Errors
    /// Never in practice; the values are valid.
    pub fn for_testing() -> Result<Self, MdBoxError> {
        Self::builder()
            .dimension("x", "m", 0.0, 10.0)
            .dimension("y", "m", 0.0, 10.0)
            .split_into_all(2)
            .split_threshold(16)
            .max_depth(6)
            .events_per_task(64)
            .tasks_per_block(4)
            .num_threads(2)
            .build()
    }
}
