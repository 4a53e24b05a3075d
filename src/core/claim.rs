// Two-phase zero-copy write handle over a reserved, header-stamped frame.
use crate::core::buffer::AtomicBuffer;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{
    FLAGS_OFFSET, HDR_TYPE_PAD, HEADER_LENGTH, RESERVED_VALUE_OFFSET, TYPE_OFFSET,
};

/// A reserved frame whose length has not been published yet.
///
/// The holder must call [`BufferClaim::commit`] or [`BufferClaim::abort`].
/// Dropping a claim without either leaves the frame unpublished forever and
/// stalls every reader at this offset; nothing here detects that.
#[must_use = "a claim must be committed or aborted"]
#[derive(Debug)]
pub struct BufferClaim<'a> {
    term: AtomicBuffer<'a>,
    frame_offset: usize,
    frame_length: usize,
}

impl<'a> BufferClaim<'a> {
    pub(crate) fn new(term: AtomicBuffer<'a>, frame_offset: usize, frame_length: usize) -> Self {
        Self {
            term,
            frame_offset,
            frame_length,
        }
    }

    pub fn buffer(&self) -> AtomicBuffer<'a> {
        self.term
    }

    /// Term offset of the first payload byte.
    pub fn offset(&self) -> usize {
        self.frame_offset + HEADER_LENGTH
    }

    /// Payload length in bytes.
    pub fn length(&self) -> usize {
        self.frame_length - HEADER_LENGTH
    }

    pub fn frame_offset(&self) -> usize {
        self.frame_offset
    }

    pub fn put_bytes(&mut self, index: usize, src: &[u8]) -> Result<(), Error> {
        if index.checked_add(src.len()).is_none_or(|end| end > self.length()) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("write exceeds claimed payload")
                .with_offset(index as u64));
        }
        self.term.put_bytes(self.offset() + index, src)
    }

    /// Mutable view of the claimed payload.
    pub fn payload_mut(&mut self) -> Result<&mut [u8], Error> {
        // The tail counter handed this range to us alone and readers stop at
        // its still-zero length word.
        unsafe { self.term.bytes_mut(self.offset(), self.length()) }
    }

    pub fn flags(&mut self, flags: u8) -> Result<(), Error> {
        self.term.put_u8(self.frame_offset + FLAGS_OFFSET, flags)
    }

    pub fn header_type(&mut self, header_type: u16) -> Result<(), Error> {
        self.term.put_u16(self.frame_offset + TYPE_OFFSET, header_type)
    }

    pub fn reserved_value(&mut self, value: i64) -> Result<(), Error> {
        self.term.put_i64(self.frame_offset + RESERVED_VALUE_OFFSET, value)
    }

    pub fn get_reserved_value(&self) -> Result<i64, Error> {
        self.term.get_i64(self.frame_offset + RESERVED_VALUE_OFFSET)
    }

    /// Publishes the frame to readers.
    pub fn commit(self) -> Result<(), Error> {
        self.term
            .put_i32_ordered(self.frame_offset, self.frame_length as i32)
    }

    /// Turns the frame into padding so readers skip it.
    pub fn abort(self) -> Result<(), Error> {
        self.term
            .put_u16(self.frame_offset + TYPE_OFFSET, HDR_TYPE_PAD)?;
        self.term
            .put_i32_ordered(self.frame_offset, self.frame_length as i32)
    }
}
