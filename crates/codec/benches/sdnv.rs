use bytes::BytesMut;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use ltp_server_codec::{
    SessionId,
    parser::{Parser, SegmentSink},
    sdnv,
    segment::*,
};

struct Discard;

impl SegmentSink for Discard {
    fn segment(&mut self, _: Segment) {}
}

fn criterion_benchmark(c: &mut Criterion) {
    let values = [
        0u64,
        97,
        300,
        70000,
        0x0123_4567,
        0x0123_4567_89AB_CDEF,
        u64::MAX,
    ];

    let mut encoded = BytesMut::new();
    for value in values {
        sdnv::encode_u64(value, &mut encoded);
    }

    let mut sdnv_criterion = c.benchmark_group("sdnv");
    sdnv_criterion.throughput(Throughput::Elements(values.len() as u64));

    sdnv_criterion.bench_function("encode", |bencher| {
        let mut bytes = BytesMut::with_capacity(128);
        bencher.iter(|| {
            bytes.clear();
            for value in values {
                sdnv::encode_u64(value, &mut bytes);
            }
        })
    });

    sdnv_criterion.bench_function("decode_many", |bencher| {
        let mut decoded = [0u64; 7];
        bencher.iter(|| sdnv::decode_many_u64(&encoded, &mut decoded).unwrap())
    });

    sdnv_criterion.finish();

    let segment = Segment {
        session_id: SessionId::new(100, 0x0100_0000_0000_0001),
        extensions: Extensions::default(),
        body: SegmentBody::Data(DataSegment {
            segment_type: SegmentType::RedDataCheckpointEndOfRedPartEndOfBlock,
            metadata: DataSegmentMetadata {
                client_service_id: 300,
                offset: 0,
                length: 1400,
                checkpoint_serial_number: Some(0x7FFF_0001),
                report_serial_number: Some(0),
            },
            payload: vec![0x55; 1400],
        }),
    };

    let mut packet = BytesMut::new();
    segment.encode(&mut packet);

    let mut segment_criterion = c.benchmark_group("segment");
    segment_criterion.throughput(Throughput::Bytes(packet.len() as u64));

    segment_criterion.bench_function("parse_data_segment", |bencher| {
        let mut parser = Parser::default();
        let mut sink = Discard;
        bencher.iter(|| parser.parse(&packet, &mut sink).unwrap())
    });

    segment_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
