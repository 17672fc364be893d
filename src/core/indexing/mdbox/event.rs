// src/core/indexing/mdbox/event.rs

//! The event record stored in leaf boxes, and its fixed-width on-disk row.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// One recorded data point: `ND` coordinates plus signal, squared error and provenance.
///
/// Events are immutable once created. They are appended to a leaf's buffer and
/// never mutated in place; aggregates are recomputed instead. No equality or
/// ordering is defined on events.
#[derive(Debug, Clone, Copy)]
pub struct MdEvent<const ND: usize> {
    signal: f64,
    error_squared: f64,
    center: [f32; ND],
    run_index: u16,
    detector_id: u32,
}

impl<const ND: usize> MdEvent<ND> {
    /// Size in bytes of one row in an event file:
    /// `[ND x f32 coordinates][f64 signal][f64 error²][u16 run index][u32 detector id]`.
    pub const ROW_SIZE: usize = ND * 4 + 8 + 8 + 2 + 4;

    pub const fn new(
        signal: f64,
        error_squared: f64,
        center: [f32; ND],
        run_index: u16,
        detector_id: u32,
    ) -> Self {
        Self { signal, error_squared, center, run_index, detector_id }
    }

    /// An event with unit-free provenance (run 0, detector 0).
    pub const fn at(center: [f32; ND], signal: f64, error_squared: f64) -> Self {
        Self::new(signal, error_squared, center, 0, 0)
    }

    pub const fn signal(&self) -> f64 {
        self.signal
    }

    pub const fn error_squared(&self) -> f64 {
        self.error_squared
    }

    pub fn error(&self) -> f64 {
        self.error_squared.sqrt()
    }

    pub const fn center(&self) -> &[f32; ND] {
        &self.center
    }

    pub const fn coord(&self, dim: usize) -> f32 {
        self.center[dim]
    }

    pub const fn run_index(&self) -> u16 {
        self.run_index
    }

    pub const fn detector_id(&self) -> u32 {
        self.detector_id
    }

    /// Squared euclidean distance from the event to `point`.
    pub fn distance_squared_to(&self, point: &[f64; ND]) -> f64 {
        self.center
            .iter()
            .zip(point.iter())
            .map(|(&c, &p)| {
                let d = f64::from(c) - p;
                d * d
            })
            .sum()
    }

    /// Appends this event as one little-endian row.
    pub fn write_row<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        for &c in &self.center {
            writer.write_f32::<LittleEndian>(c)?;
        }
        writer.write_f64::<LittleEndian>(self.signal)?;
        writer.write_f64::<LittleEndian>(self.error_squared)?;
        writer.write_u16::<LittleEndian>(self.run_index)?;
        writer.write_u32::<LittleEndian>(self.detector_id)
    }

    /// Reads one row written by [`MdEvent::write_row`].
    pub fn read_row<R: Read + ?Sized>(reader: &mut R) -> io::Result<Self> {
        let mut center = [0.0f32; ND];
        for c in &mut center {
            *c = reader.read_f32::<LittleEndian>()?;
        }
        let signal = reader.read_f64::<LittleEndian>()?;
        let error_squared = reader.read_f64::<LittleEndian>()?;
        let run_index = reader.read_u16::<LittleEndian>()?;
        let detector_id = reader.read_u32::<LittleEndian>()?;
        Ok(Self { signal, error_squared, center, run_index, detector_id })
    }
}

/// Encodes a slice of events into a contiguous row buffer.
pub fn encode_rows<const ND: usize>(events: &[MdEvent<ND>]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(events.len() * MdEvent::<ND>::ROW_SIZE);
    for event in events {
        // Writing into a Vec cannot fail.
        let _ = event.write_row(&mut buf);
    }
    buf
}

/// Decodes a buffer produced by [`encode_rows`].
pub fn decode_rows<const ND: usize>(buf: &[u8]) -> io::Result<Vec<MdEvent<ND>>> {
    let row = MdEvent::<ND>::ROW_SIZE;
    if buf.len() % row != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Row buffer of {} bytes is not a multiple of the {} byte row size", buf.len(), row),
        ));
    }
    let mut reader = buf;
    let mut events = Vec::with_capacity(buf.len() / row);
    while !reader.is_empty() {
        events.push(MdEvent::read_row(&mut reader)?);
    }
    Ok(events)
}
