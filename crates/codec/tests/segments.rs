use bytes::BytesMut;
use ltp_server_codec::{
    Error, SessionId,
    parser::{Parser, SegmentSink},
    segment::*,
};

#[derive(Default)]
struct Sink {
    segments: Vec<Segment>,
    originators: Vec<u64>,
}

impl SegmentSink for Sink {
    fn segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    fn session_originator_engine_id_decoded(&mut self, session_originator_engine_id: u64) {
        self.originators.push(session_originator_engine_id);
    }
}

fn parse_bulk(bytes: &[u8]) -> Result<Vec<Segment>, Error> {
    let mut parser = Parser::default();
    let mut sink = Sink::default();
    parser.parse(bytes, &mut sink)?;

    assert!(parser.is_idle());
    Ok(sink.segments)
}

fn parse_byte_at_a_time(bytes: &[u8]) -> Result<Vec<Segment>, Error> {
    let mut parser = Parser::default();
    let mut sink = Sink::default();
    for byte in bytes {
        parser.parse(std::slice::from_ref(byte), &mut sink)?;
    }

    assert!(parser.is_idle());
    Ok(sink.segments)
}

fn assert_round_trip(segment: Segment) {
    let mut bytes = BytesMut::new();
    segment.encode(&mut bytes);

    assert_eq!(parse_bulk(&bytes).unwrap(), vec![segment.clone()]);
    assert_eq!(parse_byte_at_a_time(&bytes).unwrap(), vec![segment]);
}

fn extensions() -> Extensions {
    Extensions {
        header: vec![
            Extension {
                tag: 0x20,
                value: vec![1, 2, 3],
            },
            Extension {
                tag: 0x21,
                value: Vec::new(),
            },
        ],
        trailer: vec![Extension {
            tag: 0x30,
            value: vec![0xAA; 300],
        }],
    }
}

#[test]
fn round_trip_data_segments() {
    for segment_type in [
        SegmentType::RedData,
        SegmentType::GreenData,
        SegmentType::GreenDataEndOfBlock,
    ] {
        assert_round_trip(Segment {
            session_id: SessionId::new(961, 16 << 56 | 12345),
            extensions: Extensions::default(),
            body: SegmentBody::Data(DataSegment {
                segment_type,
                metadata: DataSegmentMetadata {
                    client_service_id: 300,
                    offset: 70000,
                    length: 5,
                    checkpoint_serial_number: None,
                    report_serial_number: None,
                },
                payload: b"hello".to_vec(),
            }),
        });
    }
}

#[test]
fn round_trip_checkpoint_segments() {
    for segment_type in [
        SegmentType::RedDataCheckpoint,
        SegmentType::RedDataCheckpointEndOfRedPart,
        SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock,
    ] {
        assert_round_trip(Segment {
            session_id: SessionId::new(1, 2),
            extensions: extensions(),
            body: SegmentBody::Data(DataSegment {
                segment_type,
                metadata: DataSegmentMetadata {
                    client_service_id: 2,
                    offset: 0,
                    length: 44,
                    checkpoint_serial_number: Some(0x7FFF_FFFF_FFFF_0001),
                    report_serial_number: Some(0),
                },
                payload: vec![0x55; 44],
            }),
        });
    }
}

#[test]
fn round_trip_report_segment() {
    assert_round_trip(Segment {
        session_id: SessionId::new(u64::MAX, u64::MAX),
        extensions: extensions(),
        body: SegmentBody::Report(ReportSegment {
            report_serial_number: 123456789,
            checkpoint_serial_number: 987654321,
            upper_bound: 1_000_000,
            lower_bound: 300_000,
            claims: vec![
                ReceptionClaim {
                    offset: 0,
                    length: 10_000,
                },
                ReceptionClaim {
                    offset: 20_000,
                    length: 1,
                },
                ReceptionClaim {
                    offset: 650_000,
                    length: 50_000,
                },
            ],
        }),
    });
}

#[test]
fn round_trip_control_segments() {
    assert_round_trip(Segment {
        session_id: SessionId::new(7, 8),
        extensions: Extensions::default(),
        body: SegmentBody::ReportAck {
            report_serial_number: u64::MAX >> 1,
        },
    });

    for (from_sender, reason) in [
        (true, CancelReason::UserCancelled),
        (true, CancelReason::RetransmitLimitExceeded),
        (false, CancelReason::Miscolored),
        (false, CancelReason::SystemCancelled),
        (false, CancelReason::Unreachable),
        (true, CancelReason::RetransmitCycleLimitExceeded),
    ] {
        assert_round_trip(Segment {
            session_id: SessionId::new(7, 8),
            extensions: extensions(),
            body: SegmentBody::Cancel {
                from_sender,
                reason,
            },
        });
    }

    for to_sender in [true, false] {
        assert_round_trip(Segment {
            session_id: SessionId::new(7, 8),
            extensions: extensions(),
            body: SegmentBody::CancelAck { to_sender },
        });
    }
}

#[test]
fn several_segments_in_one_feed() {
    let first = Segment {
        session_id: SessionId::new(1, 2),
        extensions: Extensions::default(),
        body: SegmentBody::ReportAck {
            report_serial_number: 9,
        },
    };
    let second = Segment {
        session_id: SessionId::new(3, 4),
        extensions: Extensions::default(),
        body: SegmentBody::Data(DataSegment {
            segment_type: SegmentType::RedData,
            metadata: DataSegmentMetadata {
                client_service_id: 1,
                offset: 5,
                length: 2,
                checkpoint_serial_number: None,
                report_serial_number: None,
            },
            payload: vec![0xDE, 0xAD],
        }),
    };

    let mut bytes = BytesMut::new();
    first.encode(&mut bytes);
    let mut tail = BytesMut::new();
    second.encode(&mut tail);
    bytes.extend_from_slice(&tail);

    assert_eq!(parse_bulk(&bytes).unwrap(), vec![first.clone(), second.clone()]);
    assert_eq!(parse_byte_at_a_time(&bytes).unwrap(), vec![first, second]);
}

#[test]
fn segment_split_across_feeds_resumes() {
    let segment = Segment {
        session_id: SessionId::new(100, 200),
        extensions: extensions(),
        body: SegmentBody::Data(DataSegment {
            segment_type: SegmentType::RedDataCheckpoint,
            metadata: DataSegmentMetadata {
                client_service_id: 300,
                offset: 10,
                length: 8,
                checkpoint_serial_number: Some(17),
                report_serial_number: Some(3),
            },
            payload: vec![1, 2, 3, 4, 5, 6, 7, 8],
        }),
    };

    let mut bytes = BytesMut::new();
    segment.encode(&mut bytes);

    for cut in 1..bytes.len() {
        let mut parser = Parser::default();
        let mut sink = Sink::default();
        parser.parse(&bytes[..cut], &mut sink).unwrap();

        assert!(sink.segments.is_empty());
        assert!(!parser.is_idle());

        parser.parse(&bytes[cut..], &mut sink).unwrap();

        assert!(parser.is_idle());
        assert_eq!(sink.segments, vec![segment.clone()]);
    }
}

#[test]
fn originator_is_surfaced_before_the_segment_completes() {
    let segment = Segment {
        session_id: SessionId::new(42, 1),
        extensions: Extensions::default(),
        body: SegmentBody::Data(DataSegment {
            segment_type: SegmentType::GreenData,
            metadata: DataSegmentMetadata {
                client_service_id: 1,
                offset: 0,
                length: 1,
                checkpoint_serial_number: None,
                report_serial_number: None,
            },
            payload: vec![0],
        }),
    };

    let mut bytes = BytesMut::new();
    segment.encode(&mut bytes);

    let mut parser = Parser::default();
    let mut sink = Sink::default();

    // feed only up to the header: control byte + one-byte originator SDNV
    parser.parse(&bytes[..2], &mut sink).unwrap();

    assert_eq!(sink.originators, vec![42]);
    assert!(sink.segments.is_empty());
}

#[test]
fn rejects_bad_version_and_undefined_types() {
    let mut parser = Parser::default();
    let mut sink = Sink::default();

    assert_eq!(
        parser.parse(&[0x10], &mut sink),
        Err(Error::UnsupportedVersion(1))
    );

    for undefined in [5u8, 6, 10, 11] {
        assert_eq!(
            parser.parse(&[undefined], &mut sink),
            Err(Error::UndefinedSegmentType(undefined))
        );
        assert!(parser.is_idle());
    }
}

#[test]
fn rejects_zero_lengths_and_counts() {
    // red data, session 1.1, no extensions, service id 1, offset 0, length 0
    let mut parser = Parser::default();
    let mut sink = Sink::default();
    assert_eq!(
        parser.parse(&[0x00, 0x01, 0x01, 0x00, 0x01, 0x00, 0x00], &mut sink),
        Err(Error::ZeroDataLength)
    );
    assert!(parser.is_idle());

    // report segment with zero reception claims
    assert_eq!(
        parser.parse(
            &[0x08, 0x01, 0x01, 0x00, 0x01, 0x00, 0x05, 0x00, 0x00],
            &mut sink
        ),
        Err(Error::ZeroClaimCount)
    );
    assert!(parser.is_idle());

    // report segment whose single claim has zero length
    assert_eq!(
        parser.parse(
            &[0x08, 0x01, 0x01, 0x00, 0x01, 0x00, 0x05, 0x00, 0x01, 0x00, 0x00],
            &mut sink
        ),
        Err(Error::ZeroClaimLength)
    );
    assert!(parser.is_idle());
}

#[test]
fn rejects_overlong_sdnv_and_recovers() {
    let mut parser = Parser::default();
    let mut sink = Sink::default();

    let mut bytes = vec![0x00];
    bytes.extend_from_slice(&[0x80; 11]); // originator SDNV never terminates

    assert_eq!(parser.parse(&bytes, &mut sink), Err(Error::SdnvTooLong));
    assert!(parser.is_idle());

    // the parser must accept a well-formed segment immediately afterwards
    let segment = Segment {
        session_id: SessionId::new(1, 2),
        extensions: Extensions::default(),
        body: SegmentBody::ReportAck {
            report_serial_number: 3,
        },
    };

    let mut good = BytesMut::new();
    segment.encode(&mut good);
    parser.parse(&good, &mut sink).unwrap();

    assert_eq!(sink.segments, vec![segment]);
}

#[test]
fn rejects_unknown_cancel_reason() {
    let mut parser = Parser::default();
    let mut sink = Sink::default();

    assert_eq!(
        parser.parse(&[0x0C, 0x01, 0x01, 0x00, 0x06], &mut sink),
        Err(Error::UnknownCancelReason(6))
    );
    assert!(parser.is_idle());
}
