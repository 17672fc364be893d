// src/core/indexing/mdbox/md_box.rs

//! Leaf state: the event buffer, its on-disk copy, and cached aggregates.

use super::event::MdEvent;
use super::node::Aggregates;
use crate::core::storage::engine::FileExtent;

/// Where a leaf's events live on disk, and what they summed to when written.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskRecord<const ND: usize> {
    pub extent: FileExtent,
    pub saved: Aggregates<ND>,
}

/// State of a leaf box.
///
/// While `resident`, `events` is the complete buffer. Once the buffer has been
/// dropped after a write-back, `events` only holds events appended since; the
/// rest are in `disk`. `dirty` means memory holds events the disk copy lacks.
#[derive(Debug, Clone)]
pub struct BoxData<const ND: usize> {
    events: Vec<MdEvent<ND>>,
    disk: Option<DiskRecord<ND>>,
    resident: bool,
    dirty: bool,
    cache: Aggregates<ND>,
    stale: bool,
}

impl<const ND: usize> Default for BoxData<ND> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const ND: usize> BoxData<ND> {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            disk: None,
            resident: true,
            dirty: false,
            cache: Aggregates::empty(),
            stale: false,
        }
    }

    pub fn with_events(events: Vec<MdEvent<ND>>) -> Self {
        let dirty = !events.is_empty();
        Self { events, disk: None, resident: true, dirty, cache: Aggregates::empty(), stale: dirty }
    }

    /// Live event count: buffered plus on disk.
    pub fn n_points(&self) -> u64 {
        let pending = self.events.len() as u64;
        match (&self.disk, self.resident) {
            (Some(record), false) => record.saved.n_points + pending,
            _ => pending,
        }
    }

    pub fn push(&mut self, event: MdEvent<ND>) {
        self.events.push(event);
        self.dirty = true;
        self.stale = true;
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = MdEvent<ND>>) {
        let before = self.events.len();
        self.events.extend(events);
        if self.events.len() != before {
            self.dirty = true;
            self.stale = true;
        }
    }

    /// The in-memory events. Complete only while [`BoxData::is_resident`].
    pub fn events(&self) -> &[MdEvent<ND>] {
        &self.events
    }

    /// Events appended while the buffer was not resident.
    pub fn pending(&self) -> &[MdEvent<ND>] {
        if self.resident {
            &[]
        } else {
            &self.events
        }
    }

    pub const fn is_resident(&self) -> bool {
        self.resident
    }

    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub const fn is_stale(&self) -> bool {
        self.stale
    }

    pub const fn is_file_backed(&self) -> bool {
        self.disk.is_some()
    }

    pub fn file_extent(&self) -> Option<FileExtent> {
        self.disk.map(|record| record.extent)
    }

    pub const fn aggregates(&self) -> &Aggregates<ND> {
        &self.cache
    }

    /// Recomputes the cached aggregates without loading anything from disk.
    pub fn refresh(&mut self) -> &Aggregates<ND> {
        let buffered = Aggregates::from_events(&self.events);
        self.cache = match (&self.disk, self.resident) {
            (Some(record), false) => record.saved.merged(&buffered),
            _ => buffered,
        };
        self.stale = false;
        &self.cache
    }

    /// Installs rows read back from disk in front of any pending events.
    /// Does nothing if the buffer is already resident.
    pub fn attach_loaded(&mut self, mut rows: Vec<MdEvent<ND>>) {
        if self.resident {
            return;
        }
        rows.append(&mut self.events);
        self.events = rows;
        self.resident = true;
    }

    /// Records that the whole resident buffer now sits at `extent`.
    /// Returns the previous extent, which the caller must release.
    pub fn mark_written(&mut self, extent: FileExtent) -> Option<FileExtent> {
        let saved = Aggregates::from_events(&self.events);
        let old = self.disk.replace(DiskRecord { extent, saved });
        self.dirty = false;
        old.map(|record| record.extent)
    }

    /// Frees the in-memory buffer. Only a clean, resident, file-backed buffer can go;
    /// returns whether it was dropped.
    pub fn drop_buffer(&mut self) -> bool {
        let Some(record) = self.disk else {
            return false;
        };
        if !self.resident || self.dirty {
            return false;
        }
        self.events = Vec::new();
        self.resident = false;
        self.cache = record.saved;
        self.stale = false;
        true
    }

    /// Empties the leaf for a split. The buffer must be resident.
    /// Returns the events and the disk extent that no longer belongs to anyone.
    pub fn take_events(&mut self) -> (Vec<MdEvent<ND>>, Option<FileExtent>) {
        let events = std::mem::take(&mut self.events);
        let old = self.disk.take().map(|record| record.extent);
        self.dirty = false;
        self.stale = false;
        self.cache = Aggregates::empty();
        (events, old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(x: f32, signal: f64) -> MdEvent<1> {
        MdEvent::at([x], signal, signal * 2.0)
    }

    #[test]
    fn test_push_marks_dirty_and_stale() {
        let mut data = BoxData::<1>::new();
        assert!(!data.is_dirty());
        data.push(ev(1.0, 2.0));
        assert!(data.is_dirty());
        assert!(data.is_stale());
        assert_eq!(data.n_points(), 1);
        assert_eq!(data.aggregates().signal, 0.0);
        data.refresh();
        assert!(!data.is_stale());
        assert_eq!(data.aggregates().signal, 2.0);
        assert_eq!(data.aggregates().error_squared, 4.0);
    }

    #[test]
    fn test_buffer_only_dropped_when_clean_and_written() {
        let mut data = BoxData::with_events(vec![ev(1.0, 1.0), ev(2.0, 3.0)]);
        assert!(!data.drop_buffer());
        assert_eq!(data.mark_written(FileExtent::new(0, 2)), None);
        assert!(data.drop_buffer());
        assert!(!data.is_resident());
        assert!(data.events().is_empty());
        assert_eq!(data.n_points(), 2);
        // Aggregates survive the eviction.
        assert_eq!(data.aggregates().signal, 4.0);
        assert!(!data.is_stale());
    }

    #[test]
    fn test_appends_while_evicted_are_kept_pending() {
        let mut data = BoxData::with_events(vec![ev(1.0, 1.0)]);
        data.mark_written(FileExtent::new(5, 1));
        data.drop_buffer();
        data.push(ev(3.0, 10.0));
        assert_eq!(data.pending().len(), 1);
        assert_eq!(data.n_points(), 2);
        assert_eq!(data.refresh().signal, 11.0);

        data.attach_loaded(vec![ev(1.0, 1.0)]);
        assert!(data.is_resident());
        assert!(data.is_dirty());
        let xs: Vec<f32> = data.events().iter().map(|e| e.coord(0)).collect();
        assert_eq!(xs, vec![1.0, 3.0]);
        assert_eq!(data.mark_written(FileExtent::new(9, 2)), Some(FileExtent::new(5, 1)));
    }

    #[test]
    fn test_take_events_returns_old_extent() {
        let mut data = BoxData::with_events(vec![ev(0.5, 1.0)]);
        data.mark_written(FileExtent::new(3, 1));
        let (events, old) = data.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(old, Some(FileExtent::new(3, 1)));
        assert_eq!(data.n_points(), 0);
        assert!(!data.is_file_backed());
    }
}
