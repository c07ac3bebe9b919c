//! Tests for the bounded head/tail output buffer.

use termbridge::buffer::OutputBuffer;

#[test]
fn test_small_output_retained_whole() {
    let mut buf = OutputBuffer::new(1024);
    buf.append(b"hello ");
    buf.append(b"world");
    assert!(!buf.truncated());
    assert_eq!(buf.to_bytes(), b"hello world");
    assert_eq!(buf.total_bytes(), 11);
    assert_eq!(buf.retained_bytes(), 11);
}

#[test]
fn test_overflow_keeps_head_and_tail() {
    // 100-byte cap: 50 head, 50 tail.
    let mut buf = OutputBuffer::new(100);
    let payload: Vec<u8> = (0..300u16).map(|i| (i % 256) as u8).collect();
    buf.append(&payload);

    assert!(buf.truncated());
    assert_eq!(buf.gap_bytes(), 200);
    assert_eq!(buf.total_bytes(), 300);
    assert_eq!(buf.retained_bytes(), 100);

    let out = buf.to_bytes();
    assert!(out.starts_with(&payload[..50]), "head intact");
    assert!(out.ends_with(&payload[250..]), "tail intact");
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("[200 bytes elided]"));
}

#[test]
fn test_gap_grows_across_appends() {
    let mut buf = OutputBuffer::new(100);
    for _ in 0..10 {
        buf.append(&[b'x'; 40]);
    }
    assert_eq!(buf.total_bytes(), 400);
    assert_eq!(buf.gap_bytes(), 300);
    assert_eq!(buf.retained_bytes(), 100);
}

#[test]
fn test_line_hint_counts_newlines() {
    let mut buf = OutputBuffer::new(1024);
    buf.append(b"a\nb\nc\n");
    assert_eq!(buf.line_hint(), 3);
}

#[test]
fn test_empty_buffer() {
    let buf = OutputBuffer::new(1024);
    assert!(buf.is_empty());
    assert!(!buf.truncated());
    assert!(buf.to_bytes().is_empty());
    assert_eq!(buf.line_hint(), 0);
}

#[test]
fn test_appends_are_monotonic() {
    let mut buf = OutputBuffer::new(64);
    let mut last_total = 0;
    for i in 0..50 {
        buf.append(format!("chunk {i}\n").as_bytes());
        assert!(buf.total_bytes() > last_total);
        last_total = buf.total_bytes();
        assert!(buf.retained_bytes() <= 64);
    }
}
