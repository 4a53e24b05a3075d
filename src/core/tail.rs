//! Purpose: Packed (term id, term offset) tail counter driving space reservation.
//! Exports: `TailCounter`, `pack`, `term_id`, `term_offset`, `clamped_term_offset`.
//! Role: Sole coordination point between producers appending to one term.
//! Invariants: High 32 bits hold the term id, low 32 bits the next unreserved offset.
//! Invariants: Producers only advance the offset via fetch-add; `reset` belongs to rotation.
use crate::core::buffer::AtomicBuffer;
use crate::core::error::{Error, ErrorKind};

pub const TAIL_COUNTER_LENGTH: usize = 8;

pub fn pack(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

pub fn term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Low word as a signed value so the -1/-2 result sentinels survive.
pub fn term_offset(raw_tail: i64) -> i32 {
    raw_tail as i32
}

/// Low word as an unsigned offset, capped at the term length.
pub fn clamped_term_offset(raw_tail: i64, term_length: usize) -> usize {
    let offset = (raw_tail & 0xFFFF_FFFF) as u64;
    offset.min(term_length as u64) as usize
}

#[derive(Clone, Copy, Debug)]
pub struct TailCounter<'a> {
    metadata: AtomicBuffer<'a>,
    index: usize,
}

impl<'a> TailCounter<'a> {
    pub fn new(metadata: AtomicBuffer<'a>, index: usize) -> Result<Self, Error> {
        metadata.bounds_check(index, TAIL_COUNTER_LENGTH)?;
        if index % TAIL_COUNTER_LENGTH != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("tail counter must be 8-byte aligned")
                .with_offset(index as u64));
        }
        Ok(Self { metadata, index })
    }

    /// Adds `delta` to the offset word and returns the raw tail before the add.
    pub fn fetch_and_add(&self, delta: i64) -> Result<i64, Error> {
        self.metadata.get_and_add_i64(self.index, delta)
    }

    pub fn raw_tail_volatile(&self) -> Result<i64, Error> {
        self.metadata.get_i64_volatile(self.index)
    }

    /// Starts a new rotation at offset zero; only the rotation coordinator calls this.
    pub fn reset(&self, term_id: i32) -> Result<(), Error> {
        self.metadata.put_i64_ordered(self.index, pack(term_id, 0))
    }
}
