// src/core/indexing/mdbox/file_backing.rs

//! Read-through and eviction of leaf buffers against one event file.

use super::md_box::BoxData;
use crate::core::common::lock_utils::lock_poisoned;
use crate::core::common::{MdBoxError, NodeId};
use crate::core::storage::engine::{EventFile, FileExtent, LeafCache};
use log::debug;
use std::sync::Mutex;

/// Leaves chosen for eviction, with the event count they were tracked at.
pub type Victims = Vec<(NodeId, usize)>;

/// The event file shared by every file-backed leaf of one tree, plus the MRU
/// record of which leaves are resident.
///
/// Every method that touches a leaf takes its `BoxData` by `&mut`, so the
/// caller must hold that leaf's write lock; the backend never locks nodes.
#[derive(Debug)]
pub struct FileBackend {
    file: EventFile,
    cache: Mutex<LeafCache>,
}

impl FileBackend {
    pub fn new(file: EventFile, cache_capacity_events: usize) -> Self {
        Self { file, cache: Mutex::new(LeafCache::new(cache_capacity_events)) }
    }

    pub const fn file(&self) -> &EventFile {
        &self.file
    }

    pub fn is_resident<const ND: usize>(&self, data: &BoxData<ND>) -> bool {
        data.is_resident()
    }

    /// Events held in memory by tracked leaves.
    ///
    /// # Errors
    /// `Lock` if the cache is poisoned.
    pub fn resident_events(&self) -> Result<usize, MdBoxError> {
        Ok(self.cache.lock().map_err(lock_poisoned)?.resident_events())
    }

    pub fn capacity_events(&self) -> Result<usize, MdBoxError> {
        Ok(self.cache.lock().map_err(lock_poisoned)?.capacity_events())
    }

    // All-or-nothing: the leaf is only changed once every row has been read.
    fn read_back<const ND: usize>(&self, data: &mut BoxData<ND>) -> Result<(), MdBoxError> {
        if data.is_resident() {
            return Ok(());
        }
        let rows = match data.file_extent() {
            Some(extent) => self.file.read_events::<ND>(extent)?,
            None => Vec::new(),
        };
        debug!("Loaded {} events from the event file", rows.len());
        data.attach_loaded(rows);
        Ok(())
    }

    /// Makes the leaf's buffer resident and marks it most recently used.
    ///
    /// Returns leaves that should now be evicted to stay within capacity;
    /// evict them after releasing this leaf's lock.
    ///
    /// # Errors
    /// `Io` if the rows cannot be read; the leaf is then left untouched.
    pub fn load<const ND: usize>(&self, id: NodeId, data: &mut BoxData<ND>) -> Result<Victims, MdBoxError> {
        self.read_back(data)?;
        self.track(id, data.events().len())
    }

    /// Loads the buffer without recording it as used, for a leaf about to be split.
    pub(crate) fn load_for_split<const ND: usize>(&self, data: &mut BoxData<ND>) -> Result<(), MdBoxError> {
        self.read_back(data)
    }

    /// Records the resident size of `id`; returns eviction victims.
    ///
    /// # Errors
    /// `Lock` if the cache is poisoned.
    pub fn track(&self, id: NodeId, n_events: usize) -> Result<Victims, MdBoxError> {
        Ok(self.cache.lock().map_err(lock_poisoned)?.touch(id, n_events))
    }

    /// Records a new resident size for `id` without marking it as used.
    ///
    /// # Errors
    /// `Lock` if the cache is poisoned.
    pub fn resize(&self, id: NodeId, n_events: usize) -> Result<Victims, MdBoxError> {
        Ok(self.cache.lock().map_err(lock_poisoned)?.resize(id, n_events))
    }

    /// Hands back a victim that could not be evicted.
    pub fn restore(&self, id: NodeId, n_events: usize) -> Result<(), MdBoxError> {
        self.cache.lock().map_err(lock_poisoned)?.restore(id, n_events);
        Ok(())
    }

    pub fn forget(&self, id: NodeId) -> Result<(), MdBoxError> {
        self.cache.lock().map_err(lock_poisoned)?.remove(id);
        Ok(())
    }

    /// Writes a dirty resident buffer to a fresh extent and frees the old one.
    ///
    /// # Errors
    /// `Io` if writing fails; the leaf keeps its previous disk record.
    pub fn write_back<const ND: usize>(&self, data: &mut BoxData<ND>) -> Result<bool, MdBoxError> {
        if !data.is_resident() {
            return Err(MdBoxError::Storage(
                "Cannot write back a leaf whose buffer is not resident".to_string(),
            ));
        }
        if !data.is_dirty() && (data.is_file_backed() || data.events().is_empty()) {
            return Ok(false);
        }
        let extent = self.file.allocate(data.events().len() as u64)?;
        if let Err(e) = self.file.write_events(extent, data.events()) {
            self.file.release(extent)?;
            return Err(e);
        }
        if let Some(old) = data.mark_written(extent) {
            self.file.release(old)?;
        }
        Ok(true)
    }

    /// Guarantees the leaf's events are on disk with valid cached aggregates,
    /// then drops its buffer.
    ///
    /// # Errors
    /// `Io` on read or write failure.
    pub fn evict<const ND: usize>(&self, id: NodeId, data: &mut BoxData<ND>) -> Result<(), MdBoxError> {
        if !data.is_resident() && data.pending().is_empty() {
            return Ok(());
        }
        self.read_back(data)?;
        self.write_back(data)?;
        let n = data.events().len();
        data.drop_buffer();
        self.forget(id)?;
        debug!("Evicted {} ({} events) to the event file", id, n);
        Ok(())
    }

    pub fn release(&self, extent: FileExtent) -> Result<(), MdBoxError> {
        self.file.release(extent)
    }

    pub fn flush(&self) -> Result<(), MdBoxError> {
        self.file.flush()
    }

    pub fn clear_cache(&self) -> Result<(), MdBoxError> {
        self.cache.lock().map_err(lock_poisoned)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::indexing::mdbox::event::MdEvent;
    use tempfile::NamedTempFile;

    fn backend(capacity: usize) -> (FileBackend, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let file = EventFile::create(tmp.path(), 1).unwrap();
        (FileBackend::new(file, capacity), tmp)
    }

    fn events(n: usize) -> Vec<MdEvent<1>> {
        (0..n).map(|i| MdEvent::at([i as f32], 1.0 + i as f64, 0.25)).collect()
    }

    #[test]
    fn test_evict_then_load_round_trip() {
        let (backend, _tmp) = backend(100);
        let mut data = BoxData::with_events(events(4));
        let before = *data.refresh();

        backend.evict(NodeId(3), &mut data).unwrap();
        assert!(!backend.is_resident(&data));
        assert_eq!(*data.aggregates(), before);
        assert_eq!(data.n_points(), 4);

        let victims = backend.load(NodeId(3), &mut data).unwrap();
        assert!(victims.is_empty());
        assert!(data.is_resident());
        let xs: Vec<f32> = data.events().iter().map(|e| e.coord(0)).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(*data.refresh(), before);
        assert_eq!(backend.resident_events().unwrap(), 4);
    }

    #[test]
    fn test_rewrite_releases_previous_extent() {
        let (backend, _tmp) = backend(100);
        let mut data = BoxData::with_events(events(3));
        assert!(backend.write_back(&mut data).unwrap());
        assert!(!backend.write_back(&mut data).unwrap());
        data.push(MdEvent::at([9.0], 1.0, 1.0));
        assert!(backend.write_back(&mut data).unwrap());
        assert_eq!(data.file_extent(), Some(FileExtent::new(3, 4)));
        assert_eq!(backend.file().free_rows().unwrap(), 3);
    }

    #[test]
    fn test_pending_events_survive_eviction_cycle() {
        let (backend, _tmp) = backend(100);
        let mut data = BoxData::with_events(events(2));
        backend.evict(NodeId(1), &mut data).unwrap();
        data.push(MdEvent::at([7.0], 5.0, 1.0));
        backend.evict(NodeId(1), &mut data).unwrap();
        assert_eq!(data.n_points(), 3);
        backend.load(NodeId(1), &mut data).unwrap();
        assert_eq!(data.events().len(), 3);
        assert_eq!(data.events()[2].coord(0), 7.0);
    }

    #[test]
    fn test_load_reports_victims_over_capacity() {
        let (backend, _tmp) = backend(5);
        let mut a = BoxData::with_events(events(4));
        let mut b = BoxData::with_events(events(4));
        backend.evict(NodeId(1), &mut a).unwrap();
        backend.evict(NodeId(2), &mut b).unwrap();
        assert!(backend.load(NodeId(1), &mut a).unwrap().is_empty());
        let victims = backend.load(NodeId(2), &mut b).unwrap();
        assert_eq!(victims, vec![(NodeId(1), 4)]);
    }
}
