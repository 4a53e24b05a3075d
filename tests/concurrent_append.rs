// Multi-threaded append races: disjoint reservations, single padding, no torn reads.
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use memmap2::MmapMut;

use termlog::core::appender::{AppendOutcome, TermAppender};
use termlog::core::buffer::AtomicBuffer;
use termlog::core::frame::{BEGIN_FRAG_FLAG, END_FRAG_FLAG, HEADER_LENGTH, UNFRAGMENTED};
use termlog::core::header::HeaderWriter;
use termlog::core::tail::TailCounter;
use termlog::core::validate::{self, FrameSummary};

const TERM_ID: i32 = 3;

struct Memory {
    term: MmapMut,
    metadata: MmapMut,
}

impl Memory {
    fn new(capacity: usize) -> Self {
        Self {
            term: MmapMut::map_anon(capacity).expect("term"),
            metadata: MmapMut::map_anon(64).expect("metadata"),
        }
    }

    fn appender(&mut self) -> TermAppender<'_> {
        let term = AtomicBuffer::new(&mut self.term[..]).expect("term");
        let metadata = AtomicBuffer::new(&mut self.metadata[..]).expect("metadata");
        let tail = TailCounter::new(metadata, 0).expect("tail");
        tail.reset(TERM_ID).expect("reset");
        TermAppender::new(term, tail).expect("appender")
    }
}

fn message(producer: u8, seq: u32) -> Vec<u8> {
    let length = 5 + (seq as usize * 37 + producer as usize * 11) % 200;
    let mut payload = vec![producer ^ (seq as u8); length];
    payload[0] = producer;
    payload[1..5].copy_from_slice(&seq.to_le_bytes());
    payload
}

fn checksum(bytes: &[u8]) -> i64 {
    bytes
        .iter()
        .fold(17i64, |acc, byte| acc.wrapping_mul(31).wrapping_add(*byte as i64))
}

fn payload_of(term: &AtomicBuffer<'_>, frame: &FrameSummary) -> Vec<u8> {
    let mut payload = vec![0u8; frame.header.payload_length()];
    term.get_bytes(frame.offset + HEADER_LENGTH, &mut payload)
        .expect("payload");
    payload
}

fn payload_checksum(term: &AtomicBuffer<'_>, offset: usize, length: usize) -> i64 {
    let mut payload = vec![0u8; length - HEADER_LENGTH];
    term.get_bytes(offset + HEADER_LENGTH, &mut payload)
        .expect("payload");
    checksum(&payload)
}

#[test]
fn concurrent_reservations_are_disjoint_and_gapless() {
    let producers = 8u8;
    let per_producer = 500u32;
    let mut memory = Memory::new(4 * 1024 * 1024);
    let appender = memory.appender();
    let header = HeaderWriter::new(1, 2);

    std::thread::scope(|scope| {
        for producer in 0..producers {
            let header = &header;
            scope.spawn(move || {
                for seq in 0..per_producer {
                    let result = appender
                        .append_unfragmented(header, &message(producer, seq), None)
                        .expect("append");
                    assert!(AppendOutcome::from_result(result).is_appended());
                }
            });
        }
    });

    let term = appender.term_buffer();
    let raw_tail = appender.raw_tail_volatile().expect("tail");
    let report = validate::validate_term(&term, raw_tail).expect("valid");
    assert_eq!(report.data_frames, producers as usize * per_producer as usize);
    assert_eq!(report.padding_frames, 0);

    let mut seen = HashSet::new();
    for frame in validate::scan_term(&term, term.capacity()).expect("scan") {
        assert_eq!(frame.header.flags, UNFRAGMENTED);
        let payload = payload_of(&term, &frame);
        let producer = payload[0];
        let seq = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
        assert_eq!(payload, message(producer, seq));
        assert!(seen.insert((producer, seq)), "duplicate message");
    }
    assert_eq!(seen.len(), producers as usize * per_producer as usize);
}

#[test]
fn racing_producers_write_exactly_one_padding_frame() {
    // Capacities leave a different gap at the boundary on every round.
    for round in 0..16usize {
        let capacity = 64 * 1024 + round * 32;
        let mut memory = Memory::new(capacity);
        let appender = memory.appender();
        let header = HeaderWriter::new(1, 2);
        let tripped = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for producer in 0..8u8 {
                let (header, tripped, failed) = (&header, &tripped, &failed);
                scope.spawn(move || {
                    let mut seq = 0u32;
                    loop {
                        let result = appender
                            .append_unfragmented(header, &message(producer, seq), None)
                            .expect("append");
                        match AppendOutcome::from_result(result) {
                            AppendOutcome::Appended { term_id, .. } => {
                                assert_eq!(term_id, TERM_ID);
                                seq += 1;
                            }
                            AppendOutcome::Tripped { term_id } => {
                                assert_eq!(term_id, TERM_ID);
                                tripped.fetch_add(1, Ordering::SeqCst);
                                return;
                            }
                            AppendOutcome::Failed { term_id } => {
                                assert_eq!(term_id, TERM_ID);
                                failed.fetch_add(1, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                });
            }
        });

        assert_eq!(tripped.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 7);

        let term = appender.term_buffer();
        let report = validate::validate_term(&term, appender.raw_tail_volatile().expect("tail"))
            .expect("valid");
        assert!(report.tripped);
        assert!(report.padding_frames <= 1);
        assert_eq!(report.published_length, capacity);
    }
}

#[test]
fn readers_never_observe_torn_frames() {
    let mut memory = Memory::new(1024 * 1024);
    let appender = memory.appender();
    let term = appender.term_buffer();
    let header = HeaderWriter::new(1, 2);
    let done = AtomicBool::new(false);
    let writers_left = AtomicUsize::new(4);

    std::thread::scope(|scope| {
        for producer in 0..4u8 {
            let (header, done, writers_left) = (&header, &done, &writers_left);
            scope.spawn(move || {
                let supplier =
                    |term: &AtomicBuffer<'_>, offset: usize, length: usize| -> i64 {
                        payload_checksum(term, offset, length)
                    };
                let mut seq = 0u32;
                loop {
                    let payload = message(producer, seq);
                    let result = if seq % 2 == 0 {
                        appender
                            .append_unfragmented(header, &payload, Some(&supplier))
                            .expect("append")
                    } else {
                        let (result, claim) = appender.claim(header, payload.len()).expect("claim");
                        if let Some(mut claim) = claim {
                            claim.put_bytes(0, &payload).expect("put");
                            claim.reserved_value(checksum(&payload)).expect("reserved");
                            claim.commit().expect("commit");
                        }
                        result
                    };
                    if !AppendOutcome::from_result(result).is_appended() {
                        break;
                    }
                    seq += 1;
                }
                if writers_left.fetch_sub(1, Ordering::SeqCst) == 1 {
                    done.store(true, Ordering::SeqCst);
                }
            });
        }

        for _ in 0..2 {
            let done = &done;
            scope.spawn(move || {
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let frames = validate::scan_term(&term, term.capacity()).expect("scan");
                    for frame in &frames {
                        if frame.header.is_padding() {
                            continue;
                        }
                        assert_eq!(frame.header.term_offset as usize, frame.offset);
                        assert_eq!(frame.header.term_id, TERM_ID);
                        let payload = payload_of(&term, frame);
                        assert_eq!(frame.header.reserved_value, checksum(&payload));
                        let seq = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                        assert_eq!(payload, message(payload[0], seq));
                    }
                    if finished {
                        break;
                    }
                }
            });
        }
    });

    let report = validate::validate_term(&term, appender.raw_tail_volatile().expect("tail"))
        .expect("valid");
    assert!(report.tripped);
}

#[test]
fn fragmented_appends_race_without_interleaving() {
    let mut memory = Memory::new(2 * 1024 * 1024);
    let appender = memory.appender();
    let header = HeaderWriter::new(1, 2);

    std::thread::scope(|scope| {
        for producer in 0..4u8 {
            let header = &header;
            scope.spawn(move || {
                for seq in 0..200u32 {
                    let mut payload = message(producer, seq);
                    payload.extend(std::iter::repeat_n(producer, 300));
                    let result = appender
                        .append_fragmented(header, &payload, 96, None)
                        .expect("append");
                    assert!(AppendOutcome::from_result(result).is_appended());
                }
            });
        }
    });

    let term = appender.term_buffer();
    let frames = validate::scan_term(&term, term.capacity()).expect("scan");
    let mut messages = 0;
    let mut assembling: Option<Vec<u8>> = None;
    for frame in &frames {
        let flags = frame.header.flags;
        let chunk = payload_of(&term, frame);
        if flags & BEGIN_FRAG_FLAG != 0 {
            assert!(assembling.is_none(), "fragments interleaved");
            assembling = Some(Vec::new());
        }
        let buffer = assembling.as_mut().expect("begin fragment first");
        buffer.extend_from_slice(&chunk);
        if flags & END_FRAG_FLAG != 0 {
            let payload = assembling.take().expect("message");
            let producer = payload[0];
            let seq = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
            let mut expected = message(producer, seq);
            expected.extend(std::iter::repeat_n(producer, 300));
            assert_eq!(payload, expected);
            messages += 1;
        }
    }
    assert!(assembling.is_none());
    assert_eq!(messages, 4 * 200);
}
