use bson::doc;
use oxidereplay::error::Error;
use oxidereplay::recording::{RecordingSet, write_packet};

#[path = "common/mod.rs"]
mod common;
use common::{TempRecordingDir, packet, request};

#[test]
fn files_concatenate_in_lexicographic_order() {
    let dir = TempRecordingDir::new("lexi");
    // written out of order on purpose
    dir.write_file(
        "1700000002000.bin",
        &[packet(1, 2000, 3, request(doc! {"ping": 1i32, "$db": "admin"}))],
    );
    dir.write_file(
        "1700000001000.bin",
        &[
            packet(1, 0, 1, request(doc! {"ping": 1i32, "$db": "admin"})),
            packet(1, 1000, 2, request(doc! {"ping": 1i32, "$db": "admin"})),
        ],
    );

    let orders: Vec<u64> = RecordingSet::open(&dir.path)
        .unwrap()
        .map(|r| r.unwrap().order)
        .collect();
    assert_eq!(orders, vec![1, 2, 3]);
}

#[test]
fn non_bin_files_are_ignored() {
    let dir = TempRecordingDir::new("ignore");
    dir.write_file(
        "000001.bin",
        &[packet(1, 0, 1, request(doc! {"ping": 1i32, "$db": "admin"}))],
    );
    dir.write_raw("checksum.txt", b"deadbeef\n");

    let count = RecordingSet::open(&dir.path).unwrap().count();
    assert_eq!(count, 1);
}

#[test]
fn empty_directory_is_an_error() {
    let dir = TempRecordingDir::new("empty");
    assert!(RecordingSet::open(&dir.path).is_err());
}

#[test]
fn truncated_tail_advances_to_next_file() {
    let dir = TempRecordingDir::new("trunc");

    let mut first = Vec::new();
    write_packet(
        &mut first,
        &packet(1, 0, 1, request(doc! {"ping": 1i32, "$db": "admin"})),
    )
    .unwrap();
    let mut tail = Vec::new();
    write_packet(
        &mut tail,
        &packet(1, 100, 2, request(doc! {"ping": 1i32, "$db": "admin"})),
    )
    .unwrap();
    tail.truncate(tail.len() - 5);
    first.extend_from_slice(&tail);
    dir.write_raw("000001.bin", &first);

    dir.write_file(
        "000002.bin",
        &[packet(2, 200, 3, request(doc! {"ping": 1i32, "$db": "admin"}))],
    );

    let mut set = RecordingSet::open(&dir.path).unwrap();
    assert_eq!(set.next().unwrap().unwrap().order, 1);
    assert!(matches!(set.next().unwrap(), Err(Error::Truncated)));
    assert_eq!(set.next().unwrap().unwrap().order, 3);
    assert!(set.next().is_none());
}

#[test]
fn bad_frame_aborts_the_stream() {
    let dir = TempRecordingDir::new("badframe");

    let mut bytes = Vec::new();
    write_packet(
        &mut bytes,
        &packet(1, 0, 1, request(doc! {"ping": 1i32, "$db": "admin"})),
    )
    .unwrap();
    bytes.extend_from_slice(&3u32.to_le_bytes()); // size below minimum
    bytes.extend_from_slice(&[0u8; 40]);
    dir.write_raw("000001.bin", &bytes);
    dir.write_file(
        "000002.bin",
        &[packet(2, 200, 3, request(doc! {"ping": 1i32, "$db": "admin"}))],
    );

    let mut set = RecordingSet::open(&dir.path).unwrap();
    assert_eq!(set.next().unwrap().unwrap().order, 1);
    assert!(matches!(set.next().unwrap(), Err(Error::BadFrame(_))));
    // unlike a truncated tail, a bad frame does not advance to the next file
    assert!(set.next().is_none());
}

#[test]
fn offsets_and_orders_are_monotone_in_generated_recordings() {
    let dir = TempRecordingDir::new("monotone");
    let packets: Vec<_> = (0..50)
        .map(|i| {
            packet(
                i % 3,
                i * 250,
                i + 1,
                request(doc! {"find": "users", "$db": "app"}),
            )
        })
        .collect();
    dir.write_file("000001.bin", &packets);

    let decoded: Vec<_> = RecordingSet::open(&dir.path)
        .unwrap()
        .collect::<oxidereplay::error::Result<Vec<_>>>()
        .unwrap();
    for pair in decoded.windows(2) {
        assert!(pair[0].offset_us <= pair[1].offset_us);
        assert!(pair[0].order < pair[1].order);
    }
}
