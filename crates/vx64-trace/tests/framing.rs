use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor};

use proptest::prelude::*;
use vx64_cpu_core::{CpuSnapshot, CpuState};
use vx64_trace::{
    Location, MemoryEvent, Record, RecordKind, Step, SystemLog, TraceError, TraceReader,
    TraceWriter, WriteLeExt,
};

fn snapshot() -> CpuSnapshot {
    let mut state = CpuState::new();
    state.set_rip(0x40_1000);
    state.vec_mut(3).set_f64(1.25);
    state.snapshot()
}

fn sample_records() -> Vec<Record> {
    vec![
        Record::CpuState(snapshot()),
        Record::Location(Location {
            filename: Some("hello".into()),
            symbol: None,
            offset: 0x1000,
            pc: 0x40_1000,
        }),
        Record::Step(Step {
            index: 7,
            pc: 0x40_1000,
            machine_code: vec![0x48, 0x01, 0xd8],
            disassembly: Some("add rax, rbx".into()),
            state: snapshot(),
        }),
        Record::MemoryEvent(MemoryEvent {
            address: 0x7fff_fff0,
            size: 8,
            write: true,
            value: 0xdead_beef,
        }),
        Record::SystemLog(SystemLog {
            pc: 0x40_1003,
            tid: 1,
            message: "exit(0)".into(),
        }),
    ]
}

fn read_all(bytes: Vec<u8>) -> Result<Vec<Record>, TraceError> {
    TraceReader::new(Cursor::new(bytes)).collect()
}

#[test]
fn file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.trc");

    let mut w = TraceWriter::new(BufWriter::new(File::create(&path).unwrap()));
    for r in sample_records() {
        w.write(&r).unwrap();
    }
    assert_eq!(w.records(), 5);
    w.finish().unwrap();

    let reader = TraceReader::new(BufReader::new(File::open(&path).unwrap()));
    let got: Vec<Record> = reader.collect::<Result<_, _>>().unwrap();
    let mut want = sample_records();
    want.push(Record::Eof);
    assert_eq!(got, want);
}

#[test]
fn empty_stream_has_no_records() {
    let mut r = TraceReader::new(Cursor::new(Vec::new()));
    assert!(r.next_record().unwrap().is_none());
}

#[test]
fn truncated_header_is_an_error() {
    let err = read_all(vec![b'E', b'O']).unwrap_err();
    assert!(matches!(err, TraceError::Io(_)));
}

#[test]
fn declared_size_larger_than_payload_fails() {
    let mut bytes = Vec::new();
    bytes.write_u32_le(RecordKind::EOF.0).unwrap();
    bytes.write_u32_le(4).unwrap();
    bytes.extend_from_slice(&[0; 4]);
    let err = read_all(bytes).unwrap_err();
    assert!(matches!(
        err,
        TraceError::SizeMismatch {
            declared: 4,
            actual: 0,
            ..
        }
    ));
}

#[test]
fn declared_size_smaller_than_payload_fails() {
    let rec = Record::SystemLog(SystemLog {
        pc: 1,
        tid: 2,
        message: "hi".into(),
    });
    let mut bytes = Vec::new();
    bytes.write_u32_le(rec.kind().0).unwrap();
    bytes.write_u32_le(rec.payload_size() as u32 - 1).unwrap();
    rec.write_payload(&mut bytes).unwrap();

    let err = read_all(bytes).unwrap_err();
    let TraceError::SizeMismatch {
        kind,
        declared,
        actual,
    } = err
    else {
        panic!("unexpected {err:?}");
    };
    assert_eq!(kind, RecordKind::SYSTEM_LOG.0);
    assert_eq!(u64::from(declared) + 1, actual);
}

#[test]
fn unknown_records_are_skipped() {
    let mut bytes = Vec::new();
    bytes.write_u32_le(0x1234_5678).unwrap();
    bytes.write_u32_le(3).unwrap();
    bytes.extend_from_slice(&[1, 2, 3]);
    let mut w = TraceWriter::new(&mut bytes);
    w.write(&Record::Eof).unwrap();

    assert_eq!(read_all(bytes).unwrap(), vec![Record::Eof]);
}

#[test]
fn truncated_unknown_record_is_an_error() {
    let mut bytes = Vec::new();
    bytes.write_u32_le(0x1234_5678).unwrap();
    bytes.write_u32_le(100).unwrap();
    bytes.extend_from_slice(&[0; 10]);
    assert!(matches!(read_all(bytes), Err(TraceError::Io(_))));
}

#[test]
fn inner_length_beyond_declared_size_is_a_size_mismatch() {
    // A 24-byte step whose machine code claims 256 MiB.
    let mut bytes = Vec::new();
    bytes.write_u32_le(RecordKind::STEP.0).unwrap();
    bytes.write_u32_le(24).unwrap();
    bytes.write_u64_le(0).unwrap();
    bytes.write_u64_le(0x40_1000).unwrap();
    bytes.write_u32_le(256 << 20).unwrap();

    let err = read_all(bytes).unwrap_err();
    let TraceError::SizeMismatch {
        kind,
        declared,
        actual,
    } = err
    else {
        panic!("unexpected {err:?}");
    };
    assert_eq!(kind, RecordKind::STEP.0);
    assert_eq!(declared, 24);
    assert_eq!(actual, 20 + (256 << 20));
}

#[test]
fn string_longer_than_record_is_a_size_mismatch() {
    let mut bytes = Vec::new();
    bytes.write_u32_le(RecordKind::LOCATION.0).unwrap();
    bytes.write_u32_le(30).unwrap();
    bytes.write_u16_le(1000).unwrap();
    bytes.extend_from_slice(&[b'a'; 28]);

    assert!(matches!(
        read_all(bytes),
        Err(TraceError::SizeMismatch {
            declared: 30,
            actual: 1002,
            ..
        })
    ));
}

#[test]
fn bad_memory_event_size_is_corrupt() {
    let rec = Record::MemoryEvent(MemoryEvent {
        address: 0,
        size: 3,
        write: false,
        value: 0,
    });
    let mut bytes = Vec::new();
    TraceWriter::new(&mut bytes).write(&rec).unwrap();
    assert!(matches!(read_all(bytes), Err(TraceError::Corrupt(_))));
}

#[test]
fn oversized_string_is_rejected_by_writer() {
    let rec = Record::SystemLog(SystemLog {
        pc: 0,
        tid: 0,
        message: "x".repeat(usize::from(u16::MAX) + 1),
    });
    let mut w = TraceWriter::new(Vec::new());
    assert!(matches!(w.write(&rec), Err(TraceError::Corrupt(_))));
    assert_eq!(w.records(), 0);
    // Only the end marker's header made it out.
    assert_eq!(w.finish().unwrap().len(), 8);
}

proptest! {
    #[test]
    fn declared_size_always_matches_payload(
        filename in proptest::option::of("[a-z./]{1,40}"),
        symbol in proptest::option::of("[a-zA-Z_]{1,40}"),
        code in proptest::collection::vec(any::<u8>(), 1..16),
        offset in any::<u64>(),
    ) {
        let records = vec![
            Record::Location(Location { filename, symbol, offset, pc: offset ^ 1 }),
            Record::Step(Step {
                index: offset,
                pc: offset,
                machine_code: code,
                disassembly: None,
                state: snapshot(),
            }),
        ];
        let mut bytes = Vec::new();
        let mut w = TraceWriter::new(&mut bytes);
        for r in &records {
            w.write(r).unwrap();
        }
        prop_assert_eq!(read_all(bytes).unwrap(), records);
    }
}
