// Term scanning and structural validation plus debug-only assertions.
// Scans only follow published (acquire-read, non-zero) lengths, so they are safe against live writers.
// Full validation assumes producers are quiescent.
use serde::Serialize;

use crate::core::buffer::AtomicBuffer;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{
    self, CURRENT_VERSION, FRAME_ALIGNMENT, FrameHeader, FrameType, HEADER_LENGTH,
};
use crate::core::tail;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameSummary {
    pub offset: usize,
    pub header: FrameHeader,
    /// Padding too short to hold a header; only the length word is real.
    pub truncated: bool,
}

impl FrameSummary {
    pub fn aligned_length(&self) -> usize {
        frame::align(self.header.frame_length as usize, FRAME_ALIGNMENT)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TermReport {
    pub term_id: i32,
    pub tail_offset: u64,
    pub published_length: usize,
    pub data_frames: usize,
    pub padding_frames: usize,
    pub tripped: bool,
}

/// Walks published frames from offset zero up to `limit`, stopping at the
/// first frame whose length is still zero.
pub fn scan_term(term: &AtomicBuffer<'_>, limit: usize) -> Result<Vec<FrameSummary>, Error> {
    let limit = limit.min(term.capacity());
    let mut frames = Vec::new();
    let mut offset = 0usize;
    while offset < limit {
        let frame_length = term.get_i32_volatile(offset)?;
        if frame_length == 0 {
            break;
        }
        if frame_length < 0 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("negative frame length")
                .with_offset(offset as u64));
        }
        if offset + frame_length as usize > term.capacity() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("frame exceeds term")
                .with_offset(offset as u64));
        }
        let summary = read_frame(term, offset, frame_length)?;
        offset += summary.aligned_length();
        frames.push(summary);
    }
    Ok(frames)
}

fn read_frame(term: &AtomicBuffer<'_>, offset: usize, frame_length: i32) -> Result<FrameSummary, Error> {
    if frame::is_padding_length(frame_length) {
        let header = FrameHeader {
            frame_length,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: FrameType::Padding,
            term_offset: offset as i32,
            session_id: 0,
            stream_id: 0,
            term_id: 0,
            reserved_value: 0,
        };
        return Ok(FrameSummary {
            offset,
            header,
            truncated: true,
        });
    }
    let mut raw = [0u8; HEADER_LENGTH];
    term.get_bytes(offset, &mut raw)?;
    let header = FrameHeader::decode(&raw).map_err(|err| err.with_offset(offset as u64))?;
    Ok(FrameSummary {
        offset,
        header,
        truncated: false,
    })
}

/// Checks a quiescent term against its raw tail.
pub fn validate_term(term: &AtomicBuffer<'_>, raw_tail: i64) -> Result<TermReport, Error> {
    let capacity = term.capacity();
    let term_id = tail::term_id(raw_tail);
    let limit = tail::clamped_term_offset(raw_tail, capacity);
    let frames = scan_term(term, limit)?;

    let mut report = TermReport {
        term_id,
        tail_offset: (raw_tail & 0xFFFF_FFFF) as u64,
        ..TermReport::default()
    };
    let mut expected_offset = 0usize;
    for summary in &frames {
        let corrupt = |message: &str| {
            Error::new(ErrorKind::Corrupt)
                .with_message(message.to_string())
                .with_term_id(term_id)
                .with_offset(summary.offset as u64)
        };
        if summary.offset != expected_offset || summary.offset % FRAME_ALIGNMENT != 0 {
            return Err(corrupt("frame not contiguous"));
        }
        if report.tripped {
            return Err(corrupt("frame after end-of-term padding"));
        }
        let header = summary.header;
        if !summary.truncated {
            header.validate(capacity).map_err(|err| err.with_offset(summary.offset as u64))?;
            if header.term_offset as usize != summary.offset {
                return Err(corrupt("header term offset mismatch"));
            }
            if header.term_id != term_id {
                return Err(corrupt("header term id mismatch"));
            }
        }
        let frame_end = summary.offset + header.frame_length as usize;
        if header.is_padding() {
            report.padding_frames += 1;
            if frame_end == capacity {
                report.tripped = true;
            } else if summary.truncated {
                return Err(corrupt("short padding before end of term"));
            }
        } else {
            report.data_frames += 1;
        }
        expected_offset = (summary.offset + summary.aligned_length()).min(capacity);
    }

    if expected_offset != limit {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("unpublished frame below tail")
            .with_term_id(term_id)
            .with_offset(expected_offset as u64));
    }
    if report.tail_offset >= capacity as u64 && expected_offset == capacity {
        report.tripped = true;
    }
    report.published_length = expected_offset;
    Ok(report)
}

pub fn debug_assert_term_state(term: &AtomicBuffer<'_>, raw_tail: i64) {
    if !cfg!(debug_assertions) {
        return;
    }
    if let Err(err) = validate_term(term, raw_tail) {
        panic!("term state invariant failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::{debug_assert_term_state, scan_term, validate_term};
    use crate::core::buffer::AtomicBuffer;
    use crate::core::error::ErrorKind;
    use crate::core::frame::{FrameHeader, FrameType, HEADER_LENGTH};
    use crate::core::tail::pack;
    use memmap2::MmapMut;

    fn put_frame(term: &AtomicBuffer<'_>, header: FrameHeader) {
        let offset = header.term_offset as usize;
        let mut encoded = header.encode();
        encoded[..4].fill(0);
        term.put_bytes(offset, &encoded).expect("header");
        term.put_i32_ordered(offset, header.frame_length).expect("publish");
    }

    #[test]
    fn scan_stops_at_unpublished_frame() {
        let mut mmap = MmapMut::map_anon(256).expect("map");
        let term = AtomicBuffer::new(&mut mmap[..]).expect("wrap");
        put_frame(&term, FrameHeader::data(40, 0, 1, 2, 3));
        put_frame(&term, FrameHeader::data(64, 128, 1, 2, 3));
        let frames = scan_term(&term, 256).expect("scan");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].aligned_length(), 64);
    }

    #[test]
    fn valid_term_reports_counts() {
        let mut mmap = MmapMut::map_anon(256).expect("map");
        let term = AtomicBuffer::new(&mut mmap[..]).expect("wrap");
        put_frame(&term, FrameHeader::data(40, 0, 1, 2, 3));
        put_frame(&term, FrameHeader::data(96, 64, 1, 2, 3));
        let mut padding = FrameHeader::data(96, 160, 1, 2, 3);
        padding.frame_type = FrameType::Padding;
        put_frame(&term, padding);

        let report = validate_term(&term, pack(3, 320)).expect("valid");
        assert_eq!(report.data_frames, 2);
        assert_eq!(report.padding_frames, 1);
        assert!(report.tripped);
        assert_eq!(report.published_length, 256);
        debug_assert_term_state(&term, pack(3, 320));
    }

    #[test]
    fn aborted_claim_padding_is_allowed_mid_term() {
        let mut mmap = MmapMut::map_anon(256).expect("map");
        let term = AtomicBuffer::new(&mut mmap[..]).expect("wrap");
        let mut aborted = FrameHeader::data(42, 0, 1, 2, 3);
        aborted.frame_type = FrameType::Padding;
        put_frame(&term, aborted);
        put_frame(&term, FrameHeader::data(40, 64, 1, 2, 3));
        let mut end = FrameHeader::data(128, 128, 1, 2, 3);
        end.frame_type = FrameType::Padding;
        put_frame(&term, end);

        let report = validate_term(&term, pack(3, 320)).expect("valid");
        assert_eq!(report.padding_frames, 2);
        assert_eq!(report.data_frames, 1);
        assert!(report.tripped);
    }

    #[test]
    fn short_padding_before_end_is_corrupt() {
        let mut mmap = MmapMut::map_anon(256).expect("map");
        let term = AtomicBuffer::new(&mut mmap[..]).expect("wrap");
        term.put_i32_ordered(0, 8).expect("publish");
        let err = validate_term(&term, pack(3, 32)).expect_err("short padding");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.offset(), Some(0));
    }

    #[test]
    fn gap_below_tail_is_corrupt() {
        let mut mmap = MmapMut::map_anon(256).expect("map");
        let term = AtomicBuffer::new(&mut mmap[..]).expect("wrap");
        put_frame(&term, FrameHeader::data(40, 0, 1, 2, 3));
        let err = validate_term(&term, pack(3, 128)).expect_err("gap");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.offset(), Some(64));
    }

    #[test]
    fn wrong_term_id_is_corrupt() {
        let mut mmap = MmapMut::map_anon(256).expect("map");
        let term = AtomicBuffer::new(&mut mmap[..]).expect("wrap");
        put_frame(&term, FrameHeader::data(HEADER_LENGTH as i32, 0, 1, 2, 3));
        let err = validate_term(&term, pack(4, 32)).expect_err("term id");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn frame_past_capacity_is_corrupt() {
        let mut mmap = MmapMut::map_anon(128).expect("map");
        let term = AtomicBuffer::new(&mut mmap[..]).expect("wrap");
        term.put_i32_ordered(64, 96).expect("publish");
        term.put_i32_ordered(0, 64).expect("publish");
        let err = scan_term(&term, 128).expect_err("overflow");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
