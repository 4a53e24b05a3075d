// Frame header layout, alignment helpers, and header decode/validation utilities.
use crate::core::error::{Error, ErrorKind};

pub const HEADER_LENGTH: usize = 32;
pub const FRAME_ALIGNMENT: usize = 32;

pub const FRAME_LENGTH_OFFSET: usize = 0;
pub const VERSION_OFFSET: usize = 4;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;
pub const RESERVED_VALUE_OFFSET: usize = 24;

pub const CURRENT_VERSION: u8 = 0;

pub const BEGIN_FRAG_FLAG: u8 = 0x80;
pub const END_FRAG_FLAG: u8 = 0x40;
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

pub const HDR_TYPE_PAD: u16 = 0x00;
pub const HDR_TYPE_DATA: u16 = 0x01;

pub const MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameType {
    Padding,
    Data,
}

impl FrameType {
    pub fn from_u16(value: u16) -> Result<Self, Error> {
        match value {
            HDR_TYPE_PAD => Ok(FrameType::Padding),
            HDR_TYPE_DATA => Ok(FrameType::Data),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid frame type")),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            FrameType::Padding => HDR_TYPE_PAD,
            FrameType::Data => HDR_TYPE_DATA,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: FrameType,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}

impl FrameHeader {
    pub fn data(
        frame_length: i32,
        term_offset: i32,
        session_id: i32,
        stream_id: i32,
        term_id: i32,
    ) -> Self {
        Self {
            frame_length,
            version: CURRENT_VERSION,
            flags: UNFRAGMENTED,
            frame_type: FrameType::Data,
            term_offset,
            session_id,
            stream_id,
            term_id,
            reserved_value: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        write_i32(&mut buf, FRAME_LENGTH_OFFSET, self.frame_length);
        buf[VERSION_OFFSET] = self.version;
        buf[FLAGS_OFFSET] = self.flags;
        buf[TYPE_OFFSET..TYPE_OFFSET + 2].copy_from_slice(&self.frame_type.as_u16().to_le_bytes());
        write_i32(&mut buf, TERM_OFFSET_OFFSET, self.term_offset);
        write_i32(&mut buf, SESSION_ID_OFFSET, self.session_id);
        write_i32(&mut buf, STREAM_ID_OFFSET, self.stream_id);
        write_i32(&mut buf, TERM_ID_OFFSET, self.term_id);
        buf[RESERVED_VALUE_OFFSET..RESERVED_VALUE_OFFSET + 8]
            .copy_from_slice(&self.reserved_value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::new(ErrorKind::Corrupt).with_message("frame header too small"));
        }
        let frame_type = FrameType::from_u16(u16::from_le_bytes([
            buf[TYPE_OFFSET],
            buf[TYPE_OFFSET + 1],
        ]))?;
        Ok(Self {
            frame_length: read_i32(buf, FRAME_LENGTH_OFFSET),
            version: buf[VERSION_OFFSET],
            flags: buf[FLAGS_OFFSET],
            frame_type,
            term_offset: read_i32(buf, TERM_OFFSET_OFFSET),
            session_id: read_i32(buf, SESSION_ID_OFFSET),
            stream_id: read_i32(buf, STREAM_ID_OFFSET),
            term_id: read_i32(buf, TERM_ID_OFFSET),
            reserved_value: i64::from_le_bytes(read_8(buf, RESERVED_VALUE_OFFSET)),
        })
    }

    pub fn validate(&self, term_length: usize) -> Result<(), Error> {
        if self.version != CURRENT_VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported frame version"));
        }
        if self.frame_length < 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("negative frame length"));
        }
        if self.frame_type == FrameType::Data && (self.frame_length as usize) < HEADER_LENGTH {
            return Err(Error::new(ErrorKind::Corrupt).with_message("data frame shorter than header"));
        }
        if self.term_offset < 0
            || self.term_offset as usize + self.frame_length as usize > term_length
        {
            return Err(Error::new(ErrorKind::Corrupt).with_message("frame exceeds term"));
        }
        Ok(())
    }

    pub fn payload_length(&self) -> usize {
        (self.frame_length.max(0) as usize).saturating_sub(HEADER_LENGTH)
    }

    pub fn is_padding(&self) -> bool {
        self.frame_type == FrameType::Padding
    }
}

pub fn align(value: usize, alignment: usize) -> usize {
    (value + (alignment - 1)) & !(alignment - 1)
}

pub fn aligned_frame_length(payload_length: usize) -> usize {
    align(HEADER_LENGTH + payload_length, FRAME_ALIGNMENT)
}

/// Space a message of `length` bytes occupies once split into frames that
/// carry at most `max_payload_length` bytes each.
pub fn compute_fragmented_frame_length(length: usize, max_payload_length: usize) -> usize {
    let num_max_payloads = length / max_payload_length;
    let remaining_payload = length % max_payload_length;
    let last_frame_length = if remaining_payload > 0 {
        aligned_frame_length(remaining_payload)
    } else {
        0
    };
    num_max_payloads * aligned_frame_length(max_payload_length) + last_frame_length
}

pub fn max_message_length(term_length: usize) -> usize {
    (term_length / 8).min(MAX_MESSAGE_LENGTH)
}

/// Frames shorter than a header can only be end-of-term padding.
pub fn is_padding_length(frame_length: i32) -> bool {
    frame_length > 0 && (frame_length as usize) < HEADER_LENGTH
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(read_4(buf, offset))
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{
        align, aligned_frame_length, compute_fragmented_frame_length, is_padding_length,
        max_message_length, FrameHeader, FrameType, FRAME_ALIGNMENT, HEADER_LENGTH,
        TYPE_OFFSET,
    };
    use crate::core::error::ErrorKind;

    #[test]
    fn alignment_is_32_bytes() {
        assert_eq!(align(0, FRAME_ALIGNMENT), 0);
        assert_eq!(align(1, FRAME_ALIGNMENT), 32);
        assert_eq!(align(32, FRAME_ALIGNMENT), 32);
        assert_eq!(align(33, FRAME_ALIGNMENT), 64);
    }

    #[test]
    fn aligned_frame_length_includes_header() {
        assert_eq!(aligned_frame_length(0), 32);
        assert_eq!(aligned_frame_length(1), 64);
        assert_eq!(aligned_frame_length(32), 64);
    }

    #[test]
    fn fragmented_length_counts_every_header() {
        // 3 full chunks of 96 (frame 128 each) plus a 10 byte tail (frame 64).
        assert_eq!(compute_fragmented_frame_length(298, 96), 3 * 128 + 64);
        assert_eq!(compute_fragmented_frame_length(288, 96), 3 * 128);
        // Chunk sizes that do not align still leave every frame aligned.
        assert_eq!(compute_fragmented_frame_length(100, 50), 2 * 96);
    }

    #[test]
    fn header_round_trip() {
        let mut header = FrameHeader::data(72, 4096, 11, 22, -5);
        header.reserved_value = i64::MIN + 3;
        let decoded = FrameHeader::decode(&header.encode()).expect("decode");
        assert_eq!(header, decoded);
        assert_eq!(decoded.payload_length(), 40);
    }

    #[test]
    fn header_rejects_unknown_type() {
        let mut buf = FrameHeader::data(64, 0, 1, 2, 3).encode();
        buf[TYPE_OFFSET] = 0x7F;
        let err = FrameHeader::decode(&buf).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn header_rejects_frame_past_term_end() {
        let header = FrameHeader::data(64, 1024 - 32, 1, 2, 3);
        let err = header.validate(1024).expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        header.validate(2048).expect("fits");
    }

    #[test]
    fn short_data_frame_is_corrupt() {
        let header = FrameHeader::data((HEADER_LENGTH - 1) as i32, 0, 1, 2, 3);
        assert!(header.validate(1024).is_err());
        let mut padding = header;
        padding.frame_type = FrameType::Padding;
        padding.validate(1024).expect("short padding is allowed");
        assert!(is_padding_length(4));
        assert!(!is_padding_length(0));
        assert!(!is_padding_length(HEADER_LENGTH as i32));
    }

    #[test]
    fn max_message_length_is_term_limited() {
        assert_eq!(max_message_length(64 * 1024), 8 * 1024);
        assert_eq!(max_message_length(1024 * 1024 * 1024), 16 * 1024 * 1024);
    }
}
