//! Purpose: Lock-free multi-producer appends of framed messages into one term buffer.
//! Exports: `TermAppender`, `AppendOutcome`, `ReservedValueSupplier`, `TRIPPED`, `FAILED`.
//! Role: Protocol core; reserves space via the tail counter, writes frames, handles term end.
//! Invariants: Ranges granted by the tail counter fetch-add never overlap.
//! Invariants: The frame length word is the last write of every frame and is a release store.
//! Invariants: At most one padding frame per term, written by the producer whose reservation
//! started below capacity and crossed it.
//! Notes: Results are packed `(term_id, offset)`; the offset is -1 (tripped) or -2 (failed)
//! when the term is exhausted. Those are outcomes, not errors; `Err` means nothing was written.
use crate::core::buffer::AtomicBuffer;
use crate::core::claim::BufferClaim;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{
    self, BEGIN_FRAG_FLAG, END_FRAG_FLAG, FLAGS_OFFSET, HDR_TYPE_PAD, HEADER_LENGTH,
    RESERVED_VALUE_OFFSET, TYPE_OFFSET,
};
use crate::core::header::HeaderWriter;
use crate::core::tail::{self, TailCounter};

/// Term exhausted by this call; rotate before retrying.
pub const TRIPPED: i32 = -1;
/// Term already exhausted by another producer; nothing was written.
pub const FAILED: i32 = -2;

/// Computes the reserved value of a frame once its payload is in place.
pub trait ReservedValueSupplier {
    fn supply(&self, term: &AtomicBuffer<'_>, frame_offset: usize, frame_length: usize) -> i64;
}

impl<F> ReservedValueSupplier for F
where
    F: Fn(&AtomicBuffer<'_>, usize, usize) -> i64,
{
    fn supply(&self, term: &AtomicBuffer<'_>, frame_offset: usize, frame_length: usize) -> i64 {
        self(term, frame_offset, frame_length)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    Appended { term_id: i32, term_offset: i32 },
    Tripped { term_id: i32 },
    Failed { term_id: i32 },
}

impl AppendOutcome {
    pub fn from_result(result: i64) -> Self {
        let term_id = tail::term_id(result);
        match tail::term_offset(result) {
            TRIPPED => AppendOutcome::Tripped { term_id },
            FAILED => AppendOutcome::Failed { term_id },
            term_offset => AppendOutcome::Appended {
                term_id,
                term_offset,
            },
        }
    }

    pub fn term_id(self) -> i32 {
        match self {
            AppendOutcome::Appended { term_id, .. }
            | AppendOutcome::Tripped { term_id }
            | AppendOutcome::Failed { term_id } => term_id,
        }
    }

    pub fn is_appended(self) -> bool {
        matches!(self, AppendOutcome::Appended { .. })
    }
}

/// Appender over one term buffer and its tail counter. `Copy`, so each
/// producer thread can hold its own.
#[derive(Clone, Copy, Debug)]
pub struct TermAppender<'a> {
    term: AtomicBuffer<'a>,
    tail: TailCounter<'a>,
    capacity: i64,
}

impl<'a> TermAppender<'a> {
    pub fn new(term: AtomicBuffer<'a>, tail: TailCounter<'a>) -> Result<Self, Error> {
        let capacity = term.capacity();
        if capacity < HEADER_LENGTH || capacity > i32::MAX as usize {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("term capacity {capacity} out of range")));
        }
        if capacity % 4 != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("term capacity must be a multiple of 4"));
        }
        Ok(Self {
            term,
            tail,
            capacity: capacity as i64,
        })
    }

    pub fn term_buffer(&self) -> AtomicBuffer<'a> {
        self.term
    }

    pub fn tail_counter(&self) -> TailCounter<'a> {
        self.tail
    }

    pub fn term_capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn raw_tail_volatile(&self) -> Result<i64, Error> {
        self.tail.raw_tail_volatile()
    }

    /// Rotation hook: next reservations start at offset zero of `term_id`.
    pub fn reset_tail(&self, term_id: i32) -> Result<(), Error> {
        self.tail.reset(term_id)
    }

    /// Appends `payload` as a single frame.
    pub fn append_unfragmented(
        &self,
        header: &HeaderWriter,
        payload: &[u8],
        reserved_value: Option<&dyn ReservedValueSupplier>,
    ) -> Result<i64, Error> {
        self.append_unfragmented_vectored(header, &[payload], reserved_value)
    }

    /// Appends the concatenation of `parts` as a single frame.
    pub fn append_unfragmented_vectored(
        &self,
        header: &HeaderWriter,
        parts: &[&[u8]],
        reserved_value: Option<&dyn ReservedValueSupplier>,
    ) -> Result<i64, Error> {
        let payload_length = parts.iter().map(|part| part.len()).sum::<usize>();
        let (frame_length, aligned_length) = self.single_frame_lengths(payload_length)?;

        let (term_id, term_offset) = self.reserve(aligned_length)?;
        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.capacity {
            return self.handle_end_of_log(header, term_id, term_offset);
        }

        let frame_offset = term_offset as usize;
        header.write(&self.term, frame_offset, frame_length, term_id)?;
        let mut cursor = frame_offset + HEADER_LENGTH;
        for part in parts {
            self.term.put_bytes(cursor, part)?;
            cursor += part.len();
        }
        self.finish_frame(frame_offset, frame_length, reserved_value)?;

        Ok(tail::pack(term_id, resulting_offset as i32))
    }

    /// Appends `payload` split into frames of at most `max_payload_length`
    /// bytes, all inside one reservation.
    pub fn append_fragmented(
        &self,
        header: &HeaderWriter,
        payload: &[u8],
        max_payload_length: usize,
        reserved_value: Option<&dyn ReservedValueSupplier>,
    ) -> Result<i64, Error> {
        if max_payload_length == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("max payload length is zero"));
        }
        if payload.len() <= max_payload_length {
            return self.append_unfragmented(header, payload, reserved_value);
        }

        let required_length = frame::compute_fragmented_frame_length(payload.len(), max_payload_length);
        self.check_fits(required_length)?;

        let (term_id, term_offset) = self.reserve(required_length)?;
        let resulting_offset = term_offset + required_length as i64;
        if resulting_offset > self.capacity {
            return self.handle_end_of_log(header, term_id, term_offset);
        }

        let last_chunk = payload.len().div_ceil(max_payload_length) - 1;
        let mut frame_offset = term_offset as usize;
        for (index, chunk) in payload.chunks(max_payload_length).enumerate() {
            let frame_length = HEADER_LENGTH + chunk.len();
            let mut flags = 0;
            if index == 0 {
                flags |= BEGIN_FRAG_FLAG;
            }
            if index == last_chunk {
                flags |= END_FRAG_FLAG;
            }

            header.write(&self.term, frame_offset, frame_length, term_id)?;
            self.term.put_u8(frame_offset + FLAGS_OFFSET, flags)?;
            self.term.put_bytes(frame_offset + HEADER_LENGTH, chunk)?;
            self.finish_frame(frame_offset, frame_length, reserved_value)?;

            frame_offset += frame::align(frame_length, frame::FRAME_ALIGNMENT);
        }

        Ok(tail::pack(term_id, resulting_offset as i32))
    }

    /// Reserves a frame for `length` payload bytes and hands it to the caller
    /// unpublished. The claim is `None` when the term is exhausted.
    pub fn claim(
        &self,
        header: &HeaderWriter,
        length: usize,
    ) -> Result<(i64, Option<BufferClaim<'a>>), Error> {
        let (frame_length, aligned_length) = self.single_frame_lengths(length)?;

        let (term_id, term_offset) = self.reserve(aligned_length)?;
        let resulting_offset = term_offset + aligned_length as i64;
        if resulting_offset > self.capacity {
            let result = self.handle_end_of_log(header, term_id, term_offset)?;
            return Ok((result, None));
        }

        let frame_offset = term_offset as usize;
        header.write(&self.term, frame_offset, frame_length, term_id)?;
        let claim = BufferClaim::new(self.term, frame_offset, frame_length);

        Ok((tail::pack(term_id, resulting_offset as i32), Some(claim)))
    }

    /// Frame length and aligned length of one frame carrying `payload_length` bytes.
    fn single_frame_lengths(&self, payload_length: usize) -> Result<(usize, usize), Error> {
        let frame_length = HEADER_LENGTH.checked_add(payload_length).ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("payload of {payload_length} bytes cannot be framed"))
        })?;
        self.check_fits(frame_length)?;
        let aligned_length = frame::align(frame_length, frame::FRAME_ALIGNMENT);
        self.check_fits(aligned_length)?;
        Ok((frame_length, aligned_length))
    }

    fn check_fits(&self, required_length: usize) -> Result<(), Error> {
        if required_length > self.term_capacity() {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "message needs {required_length} bytes, term capacity is {}",
                self.capacity
            )));
        }
        Ok(())
    }

    fn reserve(&self, aligned_length: usize) -> Result<(i32, i64), Error> {
        let raw_tail = self.tail.fetch_and_add(aligned_length as i64)?;
        Ok((tail::term_id(raw_tail), raw_tail & 0xFFFF_FFFF))
    }

    fn finish_frame(
        &self,
        frame_offset: usize,
        frame_length: usize,
        reserved_value: Option<&dyn ReservedValueSupplier>,
    ) -> Result<(), Error> {
        if let Some(supplier) = reserved_value {
            let value = supplier.supply(&self.term, frame_offset, frame_length);
            self.term.put_i64(frame_offset + RESERVED_VALUE_OFFSET, value)?;
        }
        self.term.put_i32_ordered(frame_offset, frame_length as i32)
    }

    fn handle_end_of_log(
        &self,
        header: &HeaderWriter,
        term_id: i32,
        term_offset: i64,
    ) -> Result<i64, Error> {
        if term_offset > self.capacity {
            return Ok(tail::pack(term_id, FAILED));
        }
        if term_offset < self.capacity {
            let frame_offset = term_offset as usize;
            let padding_length = (self.capacity - term_offset) as usize;
            if padding_length >= HEADER_LENGTH {
                header.write(&self.term, frame_offset, padding_length, term_id)?;
                self.term.put_u16(frame_offset + TYPE_OFFSET, HDR_TYPE_PAD)?;
            }
            self.term.put_i32_ordered(frame_offset, padding_length as i32)?;
            tracing::debug!(term_id, term_offset, padding_length, "term tripped");
        }
        Ok(tail::pack(term_id, TRIPPED))
    }
}
