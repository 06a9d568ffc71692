use bson::doc;
use bytes::Bytes;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use oxidereplay::filter::{self, FilterPredicate};
use oxidereplay::protocol::encode_op_msg;
use oxidereplay::recording::{Packet, PacketReader, write_packet};

fn build_recording(packets: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    for i in 0..packets {
        // alternate user inserts, oplog tailing, and discovery chatter
        let doc = match i % 3 {
            0 => doc! {"insert": "users", "$db": "app", "documents": [{"_id": i as i64}]},
            1 => doc! {"getMore": 42i64, "collection": "oplog.rs", "$db": "local"},
            _ => doc! {"hello": 1i32, "$db": "admin"},
        };
        let message = encode_op_msg(&doc, 0, i as i32).unwrap();
        let packet = Packet {
            session_id: i % 8,
            session_metadata: Bytes::from_static(b"127.0.0.1:50000 -> 127.0.0.1:27017"),
            offset_us: i * 100,
            order: i + 1,
            message: Bytes::from(message),
        };
        write_packet(&mut buf, &packet).unwrap();
    }
    buf
}

fn bench_filter(c: &mut Criterion) {
    let buf = build_recording(1_000);

    c.bench_function("smart_predicate_1k_packets", |b| {
        let predicate = FilterPredicate {
            user_ops_smart: true,
            ..Default::default()
        };
        let packets: Vec<Packet> = PacketReader::new(&buf[..]).map(|r| r.unwrap()).collect();
        b.iter(|| {
            packets
                .iter()
                .filter(|p| predicate.evaluate(black_box(p)).is_none())
                .count()
        })
    });

    c.bench_function("filter_rewrite_1k_packets", |b| {
        let predicate = FilterPredicate {
            requests_only: true,
            user_ops_smart: true,
            ..Default::default()
        };
        b.iter(|| {
            let mut out = Vec::with_capacity(buf.len());
            let stats = filter::run(
                PacketReader::new(black_box(&buf[..])),
                &mut out,
                &predicate,
            )
            .unwrap();
            assert!(stats.kept > 0);
            out
        })
    });
}

criterion_group!(benches, bench_filter);
criterion_main!(benches);
