// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios: records staged by the runtime (or framed by hand
//! through the encoder) come back out of the decoder with the right
//! content, producer labels, and ordering.

use libdd_binlog::encoder::Encoder;
use libdd_binlog::{AlignedBuf, ArgSlot, Config, LogArg, LogLevel, Runtime, StaticLogInfo};
use libdd_binlog_decoder::{Aggregation, Decoder, LogMessage};
use libdd_binlog_wire::{RecordHeader, RECORD_HEADER_SIZE};
use std::path::{Path, PathBuf};

fn site(format: &str, slots: Vec<ArgSlot>) -> StaticLogInfo {
    StaticLogInfo::new(LogLevel::Notice, "e2e.rs", 42, format, slots)
}

fn stage_record(fmt_id: u32, timestamp: u64, args: &[LogArg<'_>]) -> Vec<u8> {
    let payload: usize = args.iter().map(LogArg::staged_size).sum();
    let mut out = vec![0u8; RECORD_HEADER_SIZE + payload];
    let mut pos = 0;
    RecordHeader {
        fmt_id,
        entry_size: out.len() as u32,
        timestamp,
    }
    .write(&mut out, &mut pos)
    .unwrap();
    for arg in args {
        arg.write(&mut out, &mut pos);
    }
    out
}

/// Builds a complete log file: checkpoint, one dictionary fragment for
/// all sites, then one extent per `(producer, records)` batch.
fn build_file(
    path: &Path,
    sites: &[StaticLogInfo],
    batches: &[(u32, Vec<Vec<u8>>)],
) -> anyhow::Result<()> {
    let mut encoder = Encoder::new(AlignedBuf::zeroed(1 << 20).unwrap(), 1 << 20, false, None)?;
    let mut cursor = 0;
    encoder.encode_new_dictionary_entries(&mut cursor, sites);
    assert_eq!(sites.len(), cursor);

    for (producer, records) in batches {
        let staged: Vec<u8> = records.iter().flatten().copied().collect();
        let mut events = 0;
        let consumed = encoder.encode_log_msgs(&staged, *producer, false, sites, &mut events);
        assert_eq!(staged.len(), consumed);
    }
    let (buffer, len) = encoder.swap_buffer(AlignedBuf::zeroed(1 << 20).unwrap());
    std::fs::write(path, &buffer.as_slice()[..len])?;
    Ok(())
}

fn decode_unordered(path: &Path) -> (u64, String) {
    let mut decoder = Decoder::new();
    decoder.open(path).unwrap();
    let mut out = Vec::new();
    let count = decoder.decompress_unordered(&mut out).unwrap();
    (count, String::from_utf8(out).unwrap())
}

fn decode_ordered(path: &Path) -> (u64, String) {
    let mut decoder = Decoder::new();
    decoder.open(path).unwrap();
    let mut out = Vec::new();
    let count = decoder.decompress_ordered(&mut out).unwrap();
    (count, String::from_utf8(out).unwrap())
}

/// Pulls the `ts %d` payload values out of decoded lines, in output
/// order.
fn scrape_values(output: &str, marker: &str) -> Vec<i64> {
    output
        .lines()
        .filter_map(|line| {
            let at = line.find(marker)?;
            line[at + marker.len()..].trim().parse().ok()
        })
        .collect()
}

fn temp_log(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[test]
fn sanity_write_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_log(&dir, "sanity.clog");
    let sites = vec![
        site("backup started", vec![]),
        site("backing up %s", vec![ArgSlot::Str]),
    ];
    build_file(
        &path,
        &sites,
        &[(
            5,
            vec![
                stage_record(0, 100, &[]),
                stage_record(1, 105, &[LogArg::Str("/etc/passwd")]),
            ],
        )],
    )
    .unwrap();

    let (count, output) = decode_unordered(&path);
    assert_eq!(2, count);
    let first = output.find("backup started").unwrap();
    let second = output.find("backing up /etc/passwd").unwrap();
    assert!(first < second);
    assert_eq!(2, output.matches("NOTICE[5]").count());
    assert!(output.contains("e2e.rs:42"));
}

#[test]
fn bounded_reordering_replays_chronologically() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_log(&dir, "reorder.clog");
    let sites = vec![site("ts %d", vec![ArgSlot::I64])];

    // Producer 5's records land first; producer 10's stragglers carry
    // earlier timestamps and only show up in the next extent.
    let first_batch = [90i64, 93, 96, 100, 105, 111, 118, 126, 135, 145, 156];
    let second_batch = [91i64, 111];
    let batches = vec![
        (
            5,
            first_batch
                .iter()
                .map(|&t| stage_record(0, t as u64, &[LogArg::I64(t)]))
                .collect(),
        ),
        (
            10,
            second_batch
                .iter()
                .map(|&t| stage_record(0, t as u64, &[LogArg::I64(t)]))
                .collect(),
        ),
    ];
    build_file(&path, &sites, &batches).unwrap();

    // Arrival order: exactly the encode order, with producer labels.
    let (count, output) = decode_unordered(&path);
    assert_eq!(13, count);
    let mut expected: Vec<i64> = first_batch.to_vec();
    expected.extend_from_slice(&second_batch);
    assert_eq!(expected, scrape_values(&output, "]: ts "));
    assert_eq!(11, output.matches("NOTICE[5]").count());
    assert_eq!(2, output.matches("NOTICE[10]").count());

    // Chronological order: the stragglers slot back in.
    let (count, output) = decode_ordered(&path);
    assert_eq!(13, count);
    let values = scrape_values(&output, "]: ts ");
    let mut sorted = expected.clone();
    sorted.sort();
    assert_eq!(sorted, values);

    // Per-producer order survives the merge.
    let producer5: Vec<i64> = output
        .lines()
        .filter(|l| l.contains("NOTICE[5]"))
        .filter_map(|l| scrape_values(l, "]: ts ").first().copied())
        .collect();
    assert_eq!(first_batch.to_vec(), producer5);
}

#[test]
fn runtime_roundtrip_with_wrapping_ring() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        staging_buffer_size: 4096,
        output_buffer_size: 8192,
        release_threshold: 2048,
        log_file: temp_log(&dir, "wrap.clog"),
        extra_file_flags: 0,
        ..Config::default()
    };
    let path = config.log_file.clone();
    let runtime = Runtime::new(config).unwrap();
    let id = runtime.register_site(
        LogLevel::Notice,
        "wrap.rs",
        7,
        "ts %d",
        vec![ArgSlot::I64],
    );

    // Far more data than the ring holds, so the producer wraps many
    // times while the compressor drains it.
    let mut producer = runtime.producer();
    for i in 0..500i64 {
        producer.log(id, &[LogArg::I64(i)]);
    }
    runtime.sync();
    drop(producer);
    drop(runtime);

    let mut decoder = Decoder::with_max_staging_buffer_size(4096);
    decoder.open(&path).unwrap();
    let mut out = Vec::new();
    let count = decoder.decompress_unordered(&mut out).unwrap();
    assert_eq!(500, count);
    let output = String::from_utf8(out).unwrap();
    let values = scrape_values(&output, "]: ts ");
    assert_eq!((0..500).collect::<Vec<i64>>(), values);
}

#[test]
fn file_rotation_yields_two_decodable_logs() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        staging_buffer_size: 4096,
        output_buffer_size: 8192,
        release_threshold: 2048,
        log_file: temp_log(&dir, "first.clog"),
        extra_file_flags: 0,
        ..Config::default()
    };
    let first = config.log_file.clone();
    let second = temp_log(&dir, "second.clog");

    let runtime = Runtime::new(config).unwrap();
    let id = runtime.register_site(LogLevel::Notice, "rot.rs", 9, "ts %d", vec![ArgSlot::I64]);
    let mut producer = runtime.producer();
    for i in 0..5i64 {
        producer.log(id, &[LogArg::I64(i)]);
    }
    runtime.sync();
    runtime.set_log_file(&second).unwrap();
    for i in 5..10i64 {
        producer.log(id, &[LogArg::I64(i)]);
    }
    runtime.sync();
    drop(producer);
    drop(runtime);

    let (count, output) = decode_unordered(&first);
    assert_eq!(5, count);
    assert_eq!(vec![0, 1, 2, 3, 4], scrape_values(&output, "]: ts "));
    // One execution only: the opening checkpoint never prints a break.
    assert!(!output.contains("# New execution started"));

    // The rotated file carries a fresh checkpoint and dictionary.
    let (count, output) = decode_unordered(&second);
    assert_eq!(5, count);
    assert_eq!(vec![5, 6, 7, 8, 9], scrape_values(&output, "]: ts "));
}

#[test]
fn dictionary_fragment_admits_ids_from_that_point_on() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        staging_buffer_size: 4096,
        output_buffer_size: 8192,
        release_threshold: 2048,
        log_file: temp_log(&dir, "frag.clog"),
        extra_file_flags: 0,
        ..Config::default()
    };
    let path = config.log_file.clone();
    let runtime = Runtime::new(config).unwrap();

    // A site registered and flushed, then a second one only after the
    // first sync: its metadata arrives as a mid-file fragment.
    let early = runtime.register_site(LogLevel::Notice, "frag.rs", 1, "early %d", vec![ArgSlot::I32]);
    let mut producer = runtime.producer();
    producer.log(early, &[LogArg::I32(1)]);
    runtime.sync();

    let late = runtime.register_site(LogLevel::Notice, "frag.rs", 2, "late %d", vec![ArgSlot::I32]);
    producer.log(early, &[LogArg::I32(2)]);
    producer.log(late, &[LogArg::I32(3)]);
    runtime.sync();
    drop(producer);
    drop(runtime);

    let (count, output) = decode_unordered(&path);
    assert_eq!(3, count);
    assert!(output.contains("early 1"));
    assert!(output.contains("early 2"));
    assert!(output.contains("late 3"));
}

#[test]
fn record_with_unknown_id_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_log(&dir, "bad.clog");
    // The file's dictionary knows one site, but an extent record claims
    // id 7 (framed against a larger table, as a corrupted or mismatched
    // file would).
    let sites = vec![site("known", vec![])];
    let bad_sites = vec![site("known", vec![]); 8];
    let mut encoder =
        Encoder::new(AlignedBuf::zeroed(1 << 16).unwrap(), 1 << 20, false, None).unwrap();
    let mut cursor = 0;
    encoder.encode_new_dictionary_entries(&mut cursor, &sites);
    let staged = stage_record(7, 10, &[]);
    let mut events = 0;
    encoder.encode_log_msgs(&staged, 0, false, &bad_sites, &mut events);
    let (buffer, len) = encoder.swap_buffer(AlignedBuf::zeroed(1 << 16).unwrap());
    std::fs::write(&path, &buffer.as_slice()[..len]).unwrap();

    let mut decoder = Decoder::new();
    decoder.open(&path).unwrap();
    let mut out = Vec::new();
    assert!(decoder.decompress_unordered(&mut out).is_err());
}

#[test]
fn empty_and_checkpoint_only_files() {
    let dir = tempfile::tempdir().unwrap();

    // Empty file: open must fail.
    let empty = temp_log(&dir, "empty.clog");
    std::fs::write(&empty, b"").unwrap();
    let mut decoder = Decoder::new();
    assert!(decoder.open(&empty).is_err());

    // Checkpoint with no entries after it: opens, decodes zero records.
    let lonely = temp_log(&dir, "lonely.clog");
    let mut encoder = Encoder::new(AlignedBuf::zeroed(4096).unwrap(), 1 << 20, false, None).unwrap();
    let (buffer, len) = encoder.swap_buffer(AlignedBuf::zeroed(4096).unwrap());
    std::fs::write(&lonely, &buffer.as_slice()[..len]).unwrap();

    let mut decoder = Decoder::new();
    decoder.open(&lonely).unwrap();
    let mut msg = LogMessage::new();
    assert!(!decoder.next_log_statement(&mut msg, None).unwrap());
    assert!(!msg.valid());
}

#[test]
fn appended_execution_prints_a_break() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_log(&dir, "appended.clog");
    let sites = vec![site("ts %d", vec![ArgSlot::I64])];

    // Two executions back to back in one file.
    build_file(&path, &sites, &[(0, vec![stage_record(0, 10, &[LogArg::I64(10)])])]).unwrap();
    let mut second = Vec::new();
    {
        let mut encoder =
            Encoder::new(AlignedBuf::zeroed(1 << 16).unwrap(), 1 << 20, false, None).unwrap();
        let mut cursor = 0;
        encoder.encode_new_dictionary_entries(&mut cursor, &sites);
        let staged = stage_record(0, 20, &[LogArg::I64(20)]);
        let mut events = 0;
        encoder.encode_log_msgs(&staged, 0, false, &sites, &mut events);
        let (buffer, len) = encoder.swap_buffer(AlignedBuf::zeroed(1 << 16).unwrap());
        second.extend_from_slice(&buffer.as_slice()[..len]);
    }
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend_from_slice(&second);
    std::fs::write(&path, &bytes).unwrap();

    let (count, output) = decode_unordered(&path);
    assert_eq!(2, count);
    assert_eq!(1, output.matches("# New execution started").count());

    let (count, output) = decode_ordered(&path);
    assert_eq!(2, count);
    assert_eq!(1, output.matches("# New execution started").count());
}

#[test]
fn embedded_dictionary_mode_needs_no_fragments() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        staging_buffer_size: 4096,
        output_buffer_size: 8192,
        release_threshold: 2048,
        log_file: temp_log(&dir, "embed-first.clog"),
        extra_file_flags: 0,
        full_dictionary_in_checkpoint: true,
        ..Config::default()
    };
    let runtime = Runtime::new(config).unwrap();
    let id = runtime.register_site(LogLevel::Notice, "emb.rs", 4, "ts %d", vec![ArgSlot::I64]);

    // Rotate after registration: the new file's checkpoint embeds the
    // whole table up front.
    let second = temp_log(&dir, "embed-second.clog");
    runtime.set_log_file(&second).unwrap();
    let mut producer = runtime.producer();
    producer.log(id, &[LogArg::I64(11)]);
    runtime.sync();
    drop(producer);
    drop(runtime);

    let bytes = std::fs::read(&second).unwrap();
    let checkpoint = libdd_binlog_wire::Checkpoint::read(&bytes).unwrap();
    assert_eq!(1, checkpoint.total_metadata_entries);
    assert!(checkpoint.new_metadata_bytes > 0);

    let (count, output) = decode_unordered(&second);
    assert_eq!(1, count);
    assert!(output.contains("ts 11"));
}

#[test]
fn zero_padding_between_entries_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_log(&dir, "padded.clog");
    let sites = vec![site("ts %d", vec![ArgSlot::I64])];
    build_file(&path, &sites, &[(2, vec![stage_record(0, 30, &[LogArg::I64(30)])])]).unwrap();

    // Direct-I/O style sector padding: NUL bytes decode as invalid
    // entries and are consumed byte by byte.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend_from_slice(&[0u8; 300]);
    std::fs::write(&path, &bytes).unwrap();

    let (count, output) = decode_unordered(&path);
    assert_eq!(1, count);
    assert!(output.contains("ts 30"));
    let (count, _) = decode_ordered(&path);
    assert_eq!(1, count);
}

#[test]
fn iterative_interface_exposes_decoded_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_log(&dir, "iter.clog");
    let sites = vec![site("%s took %d ms (q=%f)", vec![
        ArgSlot::Str,
        ArgSlot::I64,
        ArgSlot::F64,
    ])];
    build_file(
        &path,
        &sites,
        &[(
            3,
            vec![
                stage_record(0, 50, &[LogArg::Str("scan"), LogArg::I64(-12), LogArg::F64(0.5)]),
                stage_record(0, 60, &[LogArg::Str("merge"), LogArg::I64(7), LogArg::F64(1.25)]),
            ],
        )],
    )
    .unwrap();

    let mut decoder = Decoder::new();
    decoder.open(&path).unwrap();
    let mut msg = LogMessage::new();

    assert!(decoder.next_log_statement(&mut msg, None).unwrap());
    assert!(msg.valid());
    assert_eq!(0, msg.log_id());
    assert_eq!(50, msg.timestamp());
    assert_eq!(3, msg.num_args());
    assert_eq!(Some("scan"), msg.get_str(0));
    assert_eq!(Some(-12i64), msg.get(1));
    assert_eq!(Some(0.5f64), msg.get(2));

    assert!(decoder.next_log_statement(&mut msg, None).unwrap());
    assert_eq!(Some("merge"), msg.get_str(0));
    assert_eq!(60, msg.timestamp());

    assert!(!decoder.next_log_statement(&mut msg, None).unwrap());
    assert!(!msg.valid());
}

#[test]
fn aggregation_hook_sees_matching_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_log(&dir, "agg.clog");
    let sites = vec![
        site("latency %d", vec![ArgSlot::I64]),
        site("unrelated", vec![]),
    ];
    build_file(
        &path,
        &sites,
        &[(
            0,
            vec![
                stage_record(0, 10, &[LogArg::I64(4)]),
                stage_record(1, 11, &[]),
                stage_record(0, 12, &[LogArg::I64(6)]),
            ],
        )],
    )
    .unwrap();

    let mut decoder = Decoder::new();
    decoder.open(&path).unwrap();
    let mut total = 0i64;
    let mut seen_format = String::new();
    let mut callback = |format: &str, msg: &LogMessage| {
        seen_format = format.to_owned();
        total += msg.get::<i64>(0).unwrap_or(0);
    };
    let mut out = Vec::new();
    let count = decoder
        .decompress_unordered_filtered(
            &mut out,
            Some(Aggregation {
                target_id: 0,
                callback: &mut callback,
            }),
        )
        .unwrap();
    assert_eq!(3, count);
    assert_eq!(10, total);
    assert_eq!("latency %d", seen_format);
}

#[test]
fn rendered_output_matches_printf_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_log(&dir, "render.clog");
    let sites = vec![
        site("pad=%05d hex=%#x str=%.3s", vec![ArgSlot::I32, ArgSlot::U32, ArgSlot::Str]),
        site("dyn=%*d f=%.2f", vec![ArgSlot::DynamicWidth, ArgSlot::I32, ArgSlot::F64]),
    ];
    build_file(
        &path,
        &sites,
        &[(
            1,
            vec![
                stage_record(
                    0,
                    5,
                    &[LogArg::I32(42), LogArg::U32(255), LogArg::Str("hello")],
                ),
                stage_record(
                    1,
                    6,
                    &[LogArg::Width(6), LogArg::I32(-3), LogArg::F64(2.5)],
                ),
            ],
        )],
    )
    .unwrap();

    let (_, output) = decode_unordered(&path);
    assert!(output.contains("pad=00042 hex=0xff str=hel"), "{output}");
    assert!(output.contains("dyn=    -3 f=2.50"), "{output}");
}
