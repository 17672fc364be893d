// src/core/storage/engine/event_file.rs

//! Flat binary event file backing evicted leaf boxes.
//!
//! The file is a table of fixed-width rows, one per event (see
//! [`MdEvent::ROW_SIZE`]). Each leaf owns one contiguous extent of rows,
//! recorded in the leaf itself as `(offset, count)`.

use crate::core::common::lock_utils::lock_poisoned;
use crate::core::common::MdBoxError;
use crate::core::indexing::mdbox::event::{decode_rows, encode_rows, MdEvent};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A contiguous run of rows in an event file, exclusive to one leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileExtent {
    /// Index of the first row.
    pub offset: u64,
    /// Number of rows.
    pub count: u64,
}

impl FileExtent {
    pub const fn new(offset: u64, count: u64) -> Self {
        Self { offset, count }
    }

    pub const fn end(&self) -> u64 {
        self.offset + self.count
    }
}

#[derive(Debug, Default)]
struct Allocation {
    next_row: u64,
    free: Vec<FileExtent>,
}

#[derive(Debug)]
pub struct EventFile {
    file: Mutex<File>,
    path: PathBuf,
    n_dims: usize,
    row_size: usize,
    allocation: Mutex<Allocation>,
}

impl EventFile {
    const fn row_size_for(n_dims: usize) -> usize {
        n_dims * 4 + 8 + 8 + 2 + 4
    }

    /// Creates (or truncates) an event file for `n_dims`-dimensional events.
    ///
    /// # Errors
    /// `Io` if the file cannot be created.
    pub fn create(path: impl Into<PathBuf>, n_dims: usize) -> Result<Self, MdBoxError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                MdBoxError::Io(IoError::new(
                    e.kind(),
                    format!("Failed to create event file '{}': {}", path.display(), e),
                ))
            })?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            n_dims,
            row_size: Self::row_size_for(n_dims),
            allocation: Mutex::new(Allocation::default()),
        })
    }

    /// Opens an existing event file; every row already in it counts as allocated.
    ///
    /// # Errors
    /// `Io` if the file cannot be opened, `Storage` if its length is not a whole number of rows.
    pub fn open(path: impl Into<PathBuf>, n_dims: usize) -> Result<Self, MdBoxError> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path).map_err(|e| {
            MdBoxError::Io(IoError::new(
                e.kind(),
                format!("Failed to open event file '{}': {}", path.display(), e),
            ))
        })?;
        let row_size = Self::row_size_for(n_dims);
        let len = file.metadata()?.len();
        if len % row_size as u64 != 0 {
            return Err(MdBoxError::Storage(format!(
                "Event file '{}' has {} bytes, not a multiple of the {} byte row size",
                path.display(),
                len,
                row_size
            )));
        }
        Ok(Self {
            file: Mutex::new(file),
            path,
            n_dims,
            row_size,
            allocation: Mutex::new(Allocation { next_row: len / row_size as u64, free: Vec::new() }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn n_dims(&self) -> usize {
        self.n_dims
    }

    pub const fn row_size(&self) -> usize {
        self.row_size
    }

    /// Rows handed out so far (the logical file length).
    ///
    /// # Errors
    /// `Lock` if the allocation table is poisoned.
    pub fn len_rows(&self) -> Result<u64, MdBoxError> {
        Ok(self.allocation.lock().map_err(lock_poisoned)?.next_row)
    }

    /// Rows released by leaves and available for reuse.
    ///
    /// # Errors
    /// `Lock` if the allocation table is poisoned.
    pub fn free_rows(&self) -> Result<u64, MdBoxError> {
        let alloc = self.allocation.lock().map_err(lock_poisoned)?;
        Ok(alloc.free.iter().map(|e| e.count).sum())
    }

    /// Reserves `count` rows, reusing the first released extent that fits.
    ///
    /// # Errors
    /// `Lock` if the allocation table is poisoned.
    pub fn allocate(&self, count: u64) -> Result<FileExtent, MdBoxError> {
        let mut alloc = self.allocation.lock().map_err(lock_poisoned)?;
        if count > 0 {
            if let Some(pos) = alloc.free.iter().position(|e| e.count >= count) {
                let hole = alloc.free[pos];
                if hole.count == count {
                    alloc.free.remove(pos);
                } else {
                    alloc.free[pos] = FileExtent::new(hole.offset + count, hole.count - count);
                }
                return Ok(FileExtent::new(hole.offset, count));
            }
        }
        let extent = FileExtent::new(alloc.next_row, count);
        alloc.next_row += count;
        Ok(extent)
    }

    /// Returns an extent to the free list, merging it with adjacent holes.
    ///
    /// # Errors
    /// `Lock` if the allocation table is poisoned.
    pub fn release(&self, extent: FileExtent) -> Result<(), MdBoxError> {
        if extent.count == 0 {
            return Ok(());
        }
        let mut alloc = self.allocation.lock().map_err(lock_poisoned)?;
        alloc.free.push(extent);
        alloc.free.sort_unstable();
        let mut merged: Vec<FileExtent> = Vec::with_capacity(alloc.free.len());
        for e in alloc.free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end() == e.offset => last.count += e.count,
                _ => merged.push(e),
            }
        }
        alloc.free = merged;
        Ok(())
    }

    fn check_dims<const ND: usize>(&self) -> Result<(), MdBoxError> {
        if ND == self.n_dims {
            Ok(())
        } else {
            Err(MdBoxError::DimensionMismatch { expected: self.n_dims, actual: ND })
        }
    }

    /// Writes `events` into `extent`. The extent must have exactly `events.len()` rows.
    ///
    /// # Errors
    /// `DimensionMismatch`, `InvalidInput` on a size mismatch, `Io` on write failure.
    pub fn write_events<const ND: usize>(
        &self,
        extent: FileExtent,
        events: &[MdEvent<ND>],
    ) -> Result<(), MdBoxError> {
        self.check_dims::<ND>()?;
        if extent.count != events.len() as u64 {
            return Err(MdBoxError::invalid_input(format!(
                "Extent holds {} rows but {} events were given",
                extent.count,
                events.len()
            )));
        }
        if events.is_empty() {
            return Ok(());
        }
        let buf = encode_rows(events);
        let offset = extent.offset * self.row_size as u64;

        let mut file = self.file.lock().map_err(lock_poisoned)?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| {
            MdBoxError::Io(IoError::new(
                e.kind(),
                format!("Failed to seek to row {} (byte {}): {}", extent.offset, offset, e),
            ))
        })?;
        file.write_all(&buf).map_err(|e| {
            MdBoxError::Io(IoError::new(
                e.kind(),
                format!("Failed to write {} rows at row {}: {}", extent.count, extent.offset, e),
            ))
        })?;
        Ok(())
    }

    /// Reads the rows of `extent`, in the order they were written.
    ///
    /// # Errors
    /// `DimensionMismatch`, `Io` with `NotFound` for an unallocated extent,
    /// `UnexpectedEof` if the file is shorter than the extent.
    pub fn read_events<const ND: usize>(
        &self,
        extent: FileExtent,
    ) -> Result<Vec<MdEvent<ND>>, MdBoxError> {
        self.check_dims::<ND>()?;
        let next_row = self.len_rows()?;
        if extent.end() > next_row {
            return Err(MdBoxError::Io(IoError::new(
                ErrorKind::NotFound,
                format!(
                    "Rows {}..{} out of bounds (file has {} rows)",
                    extent.offset,
                    extent.end(),
                    next_row
                ),
            )));
        }
        if extent.count == 0 {
            return Ok(Vec::new());
        }
        let offset = extent.offset * self.row_size as u64;
        let mut buf = vec![0u8; extent.count as usize * self.row_size];
        {
            let mut file = self.file.lock().map_err(lock_poisoned)?;
            file.seek(SeekFrom::Start(offset)).map_err(|e| {
                MdBoxError::Io(IoError::new(
                    e.kind(),
                    format!("Failed to seek to row {} (byte {}): {}", extent.offset, offset, e),
                ))
            })?;
            match file.read_exact(&mut buf) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(MdBoxError::Io(IoError::new(
                        ErrorKind::UnexpectedEof,
                        format!(
                            "Unexpected EOF when reading rows {}..{}",
                            extent.offset,
                            extent.end()
                        ),
                    )));
                }
                Err(e) => return Err(MdBoxError::Io(e)),
            }
        }
        Ok(decode_rows(&buf)?)
    }

    /// Flushes written rows to stable storage.
    ///
    /// # Errors
    /// `Io` if syncing fails.
    pub fn flush(&self) -> Result<(), MdBoxError> {
        let mut file = self.file.lock().map_err(lock_poisoned)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}
