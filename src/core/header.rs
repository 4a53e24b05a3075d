// Default data header stamping for frames about to be written into a term.
use crate::core::buffer::AtomicBuffer;
use crate::core::error::Error;
use crate::core::frame::{
    CURRENT_VERSION, FLAGS_OFFSET, FrameHeader, HDR_TYPE_DATA, HEADER_LENGTH, SESSION_ID_OFFSET,
    STREAM_ID_OFFSET, TERM_ID_OFFSET, TERM_OFFSET_OFFSET, TYPE_OFFSET, UNFRAGMENTED,
    VERSION_OFFSET,
};

/// Header template for one publication (session + stream).
///
/// Stamps every default field except the frame length word, which stays
/// unpublished until the appender (or a claim) stores it with release
/// ordering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeaderWriter {
    session_id: i32,
    stream_id: i32,
}

impl HeaderWriter {
    pub fn new(session_id: i32, stream_id: i32) -> Self {
        Self {
            session_id,
            stream_id,
        }
    }

    pub fn from_template(template: &FrameHeader) -> Self {
        Self::new(template.session_id, template.stream_id)
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Stamps the default header for a frame of `frame_length` at `offset`.
    pub fn write(
        &self,
        term: &AtomicBuffer<'_>,
        offset: usize,
        frame_length: usize,
        term_id: i32,
    ) -> Result<(), Error> {
        term.bounds_check(offset, frame_length.max(HEADER_LENGTH))?;
        term.put_u8(offset + VERSION_OFFSET, CURRENT_VERSION)?;
        term.put_u8(offset + FLAGS_OFFSET, UNFRAGMENTED)?;
        term.put_u16(offset + TYPE_OFFSET, HDR_TYPE_DATA)?;
        term.put_i32(offset + TERM_OFFSET_OFFSET, offset as i32)?;
        term.put_i32(offset + SESSION_ID_OFFSET, self.session_id)?;
        term.put_i32(offset + STREAM_ID_OFFSET, self.stream_id)?;
        term.put_i32(offset + TERM_ID_OFFSET, term_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::HeaderWriter;
    use crate::core::buffer::AtomicBuffer;
    use crate::core::frame::{FrameHeader, FrameType, HEADER_LENGTH, UNFRAGMENTED};
    use memmap2::MmapMut;

    #[test]
    fn stamps_defaults_without_publishing_length() {
        let mut mmap = MmapMut::map_anon(256).expect("map");
        let term = AtomicBuffer::new(&mut mmap[..]).expect("wrap");
        let writer = HeaderWriter::new(0x1234, -9);
        writer.write(&term, 64, 70, 42).expect("write");

        assert_eq!(term.get_i32_volatile(64).expect("length"), 0);
        let mut raw = [0u8; HEADER_LENGTH];
        term.get_bytes(64, &mut raw).expect("read");
        let header = FrameHeader::decode(&raw).expect("decode");
        assert_eq!(header.frame_type, FrameType::Data);
        assert_eq!(header.flags, UNFRAGMENTED);
        assert_eq!(header.term_offset, 64);
        assert_eq!(header.session_id, 0x1234);
        assert_eq!(header.stream_id, -9);
        assert_eq!(header.term_id, 42);
    }

    #[test]
    fn refuses_frame_past_capacity() {
        let mut mmap = MmapMut::map_anon(128).expect("map");
        let term = AtomicBuffer::new(&mut mmap[..]).expect("wrap");
        let writer = HeaderWriter::new(1, 2);
        assert!(writer.write(&term, 96, 64, 0).is_err());
        assert!(writer.write(&term, 112, 8, 0).is_err());
    }

    #[test]
    fn template_carries_ids() {
        let template = FrameHeader::data(0, 0, 77, 88, 0);
        let writer = HeaderWriter::from_template(&template);
        assert_eq!((writer.session_id(), writer.stream_id()), (77, 88));
    }
}
