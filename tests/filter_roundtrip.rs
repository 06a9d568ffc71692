use bson::doc;
use oxidereplay::filter::{self, FilterPredicate};
use oxidereplay::recording::{PacketReader, RecordingSet};

#[path = "common/mod.rs"]
mod common;
use common::{TempRecordingDir, packet, request, response};

fn sample_packets() -> Vec<oxidereplay::recording::Packet> {
    vec![
        packet(1, 0, 1, Vec::new()),
        packet(1, 100, 2, request(doc! {"hello": 1i32, "$db": "admin"})),
        packet(1, 150, 3, response(doc! {"isWritablePrimary": true, "ok": 1.0}, 1)),
        packet(1, 500, 4, request(doc! {"insert": "users", "$db": "app", "documents": [{"x": 1i32}]})),
        packet(1, 650, 5, response(doc! {"n": 1i32, "ok": 1.0}, 1)),
        packet(
            2,
            700,
            6,
            request(doc! {"getMore": 42i64, "collection": "oplog.rs", "$db": "local"}),
        ),
        packet(2, 900, 7, request(doc! {"find": "orders", "$db": "shop", "filter": {}})),
        packet(2, 1200, 8, Vec::new()),
    ]
}

#[test]
fn accept_all_filter_is_byte_identical() {
    let dir = TempRecordingDir::new("roundtrip");
    let packets = sample_packets();
    let (a, b) = packets.split_at(4);
    dir.write_file("000001.bin", a);
    dir.write_file("000002.bin", b);

    let mut input = Vec::new();
    for name in ["000001.bin", "000002.bin"] {
        input.extend_from_slice(&std::fs::read(dir.path.join(name)).unwrap());
    }

    let mut output = Vec::new();
    let stats = filter::run(
        RecordingSet::open(&dir.path).unwrap(),
        &mut output,
        &FilterPredicate::default(),
    )
    .unwrap();

    assert_eq!(stats.read, 8);
    assert_eq!(stats.kept, 8);
    assert_eq!(output, input);
}

#[test]
fn predicate_output_is_a_satisfying_subsequence() {
    let dir = TempRecordingDir::new("subset");
    dir.write_file("000001.bin", &sample_packets());

    let predicate = FilterPredicate {
        requests_only: true,
        user_ops_smart: true,
        ..Default::default()
    };
    let mut output = Vec::new();
    let stats = filter::run(
        RecordingSet::open(&dir.path).unwrap(),
        &mut output,
        &predicate,
    )
    .unwrap();

    assert!(stats.kept <= stats.read);
    // survivors: the insert and the user-cursor find
    let survivors: Vec<_> = PacketReader::new(&output[..])
        .collect::<oxidereplay::error::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(survivors.len(), 2);
    let orders: Vec<u64> = survivors.iter().map(|p| p.order).collect();
    assert_eq!(orders, vec![4, 7]);
    for p in &survivors {
        assert_eq!(predicate.evaluate(p), None);
    }
    // oplog tailing was dropped by the smart path
    assert!(stats.dropped_internal >= 1);
}

#[test]
fn filtered_output_is_valid_replay_input() {
    // filter output must decode again with identical fields
    let dir = TempRecordingDir::new("refilter");
    dir.write_file("000001.bin", &sample_packets());

    let predicate = FilterPredicate {
        requests_only: true,
        ..Default::default()
    };
    let mut output = Vec::new();
    filter::run(
        RecordingSet::open(&dir.path).unwrap(),
        &mut output,
        &predicate,
    )
    .unwrap();

    let survivors: Vec<_> = PacketReader::new(&output[..])
        .collect::<oxidereplay::error::Result<Vec<_>>>()
        .unwrap();
    // session markers survive a plain requests-only pass
    assert!(survivors.iter().any(|p| p.is_session_marker()));
    for p in &survivors {
        assert_eq!(p.frame_size() as usize, {
            4 + 8 + p.session_metadata.len() + 1 + 8 + 8 + p.message.len()
        });
        if !p.message.is_empty() {
            // wire self-length invariant
            let declared = u32::from_le_bytes(p.message[0..4].try_into().unwrap());
            assert_eq!(declared as usize, p.message.len());
        }
    }
}
