//! End-to-end properties: lossless roundtrip across modes, determinism,
//! degradation paths, and container persistence.

use proptest::prelude::*;
use usc::{
    canonicalize, decode_container, encode_lines, join_lines, split_lines, uncanonicalize,
    CodecConfig, Mode,
};

fn lines_of(text: &str) -> Vec<Vec<u8>> {
    split_lines(text.as_bytes())
}

fn roundtrip(cfg: &CodecConfig, lines: &[Vec<u8>]) -> usc::Encoded {
    let encoded = encode_lines(lines, cfg).expect("encode");
    let decoded = decode_container(&encoded.container).expect("decode");
    assert_eq!(decoded.lines, lines);
    encoded
}

#[test]
fn repetitive_template_collapses() {
    let line = "081109 203518 148 INFO dfs.DataNode: Receiving block blk_-1608999687919862906\n";
    let lines: Vec<Vec<u8>> = (0..100).map(|_| line.as_bytes().to_vec()).collect();
    let mut cfg = CodecConfig::default();
    cfg.window_size = 100;

    let encoded = roundtrip(&cfg, &lines);
    assert_eq!(encoded.stats.templates, 1);
    assert_eq!(encoded.stats.raw_rows, 0);
    // One template, one window: everything after the first row is zero
    // deltas and repeated MTF position 0.
    let input_bytes = 100 * line.len();
    assert!(encoded.stats.container_bytes * 5 < input_bytes);
}

#[test]
fn two_interleaved_templates() {
    let lines = lines_of("A 1\nB 2\nA 3\nB 4\n");
    let encoded = roundtrip(&CodecConfig::default(), &lines);
    assert_eq!(encoded.stats.templates, 2);
    assert_eq!(encoded.stats.templated_rows, 4);
}

#[test]
fn raw_rows_interleave_exactly() {
    let lines = lines_of("A 1\nxxx garbage xxx\nA 2\n");
    let encoded = roundtrip(&CodecConfig::default(), &lines);
    assert_eq!(encoded.stats.templated_rows, 2);
    assert_eq!(encoded.stats.raw_rows, 1);
}

#[test]
fn canonicalized_volatiles_restore_exactly() {
    let lines = lines_of(
        "2024-01-01 00:00:00 uid=550e8400-e29b-41d4-a716-446655440000 v=1234567\n\
         2024-01-01 00:00:01 uid=550e8400-e29b-41d4-a716-446655440001 v=1234568\n",
    );
    roundtrip(&CodecConfig::default(), &lines);
}

#[test]
fn overflow_keeps_roundtrip() {
    let mut cfg = CodecConfig::default();
    cfg.max_templates = 1024;
    let lines: Vec<Vec<u8>> = (0..5000)
        .map(|i| format!("unit{i} sent {i}\n").into_bytes())
        .collect();
    let encoded = roundtrip(&cfg, &lines);
    assert_eq!(encoded.stats.templates, 1024);
    assert_eq!(encoded.stats.templated_rows, 1024);
    assert_eq!(encoded.stats.raw_rows, 5000 - 1024);
}

#[test]
fn cold_mode_beats_stream_on_repetitive_input() {
    let mut text = String::new();
    for i in 0..2000 {
        text.push_str(&format!(
            "1700{:06} INFO node-{} served {} bytes to 10.2.{}.{}\n",
            i % 1_000_000,
            i % 8,
            1000 + i,
            i % 120,
            (i * 3) % 251
        ));
    }
    let lines = lines_of(&text);
    let stream = roundtrip(&CodecConfig::for_mode(Mode::Stream), &lines);
    let cold = roundtrip(&CodecConfig::for_mode(Mode::Cold), &lines);
    assert!(cold.stats.container_bytes < stream.stats.container_bytes);
    assert!(cold.stats.container_bytes < text.len());
}

#[test]
fn mode_tags_on_the_wire() {
    let lines = lines_of("m 1\nm 2\n");
    for (mode, tag) in [
        (Mode::Stream, 1u8),
        (Mode::HotLiteFull, 2),
        (Mode::Cold, 3),
    ] {
        let encoded = encode_lines(&lines, &CodecConfig::for_mode(mode)).unwrap();
        assert_eq!(&encoded.container[..4], b"USC\0");
        assert_eq!(encoded.container[4], 1);
        assert_eq!(encoded.container[5], tag);
    }
}

#[test]
fn container_survives_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.usc");
    let lines = lines_of("job 1 ok\njob 2 ok\nodd one out\njob 3 ok\n");
    let encoded = encode_lines(&lines, &CodecConfig::for_mode(Mode::Cold)).unwrap();
    std::fs::write(&path, &encoded.container).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let decoded = decode_container(&bytes).unwrap();
    assert_eq!(join_lines(&decoded.lines), join_lines(&lines));
}

#[test]
fn window_env_override_changes_packetization() {
    // Env-dependent test kept hermetic: apply_env reads the variable once.
    std::env::set_var("USC_WINDOW", "5");
    let cfg = CodecConfig::default().apply_env();
    std::env::remove_var("USC_WINDOW");
    assert_eq!(cfg.window_size, 5);

    let lines: Vec<Vec<u8>> = (0..20).map(|i| format!("w {i}\n").into_bytes()).collect();
    let encoded = roundtrip(&cfg, &lines);
    assert_eq!(encoded.stats.data_bytes.len(), 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn canonicalizer_inverts_on_arbitrary_bytes(line in proptest::collection::vec(any::<u8>(), 0..200)) {
        let (canonical, side) = canonicalize(&line);
        prop_assert_eq!(uncanonicalize(&canonical, &side).unwrap(), line);
    }

    #[test]
    fn codec_roundtrips_arbitrary_lines(
        lines in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..60), 0..40)
    ) {
        let encoded = encode_lines(&lines, &CodecConfig::default()).unwrap();
        let decoded = decode_container(&encoded.container).unwrap();
        prop_assert_eq!(decoded.lines, lines);
    }

    #[test]
    fn codec_roundtrips_log_shaped_lines(
        rows in proptest::collection::vec((0u8..4, 0u64..10_000, 0u8..50), 1..120),
        window in 1u32..40
    ) {
        let lines: Vec<Vec<u8>> = rows
            .iter()
            .map(|(shape, n, small)| {
                match shape {
                    0 => format!("get /api/v2/items id {n}\n"),
                    1 => format!("worker {small} finished batch {n}\n"),
                    2 => format!("1700{n:06} gc pause {small} ms\n"),
                    _ => "plain heartbeat line\n".to_string(),
                }
                .into_bytes()
            })
            .collect();
        let mut cfg = CodecConfig::for_mode(Mode::Cold);
        cfg.window_size = window;
        let encoded = encode_lines(&lines, &cfg).unwrap();
        let decoded = decode_container(&encoded.container).unwrap();
        prop_assert_eq!(decoded.lines, lines);
    }

    #[test]
    fn split_then_join_is_identity(bytes in proptest::collection::vec(any::<u8>(), 0..400)) {
        let lines = split_lines(&bytes);
        prop_assert_eq!(join_lines(&lines), bytes);
    }
}
