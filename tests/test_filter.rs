//! Tests for the output filter: modes, command classes, thresholds, and
//! the error-preservation override.

use std::time::Duration;
use termbridge::config::{Thresholds, Truncation};
use termbridge::filter::{
    self, CommandClass, FilterInput, OutputMode, classify, find_error_line, normalize, strip_ansi,
};

fn input<'a>(command: &'a str, raw: &'a [u8]) -> FilterInput<'a> {
    FilterInput {
        command_id: "cmd-1",
        command,
        raw,
        exit_code: Some(0),
        duration: Some(Duration::from_millis(1500)),
        buffer_truncated: false,
    }
}

fn render(
    inp: &FilterInput<'_>,
    mode: OutputMode,
) -> termbridge::filter::FilteredOutput {
    filter::render(inp, mode, &Thresholds::default(), &Truncation::default())
}

fn lines(n: usize) -> Vec<u8> {
    (0..n)
        .map(|i| format!("line {i}\n"))
        .collect::<String>()
        .into_bytes()
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[test]
fn test_classify_install_commands() {
    assert_eq!(classify("apt-get install -y nginx"), CommandClass::Install);
    assert_eq!(classify("sudo apt install curl"), CommandClass::Install);
    assert_eq!(classify("pip install requests"), CommandClass::Install);
    assert_eq!(classify("cargo install ripgrep"), CommandClass::Install);
    assert_eq!(classify("npm ci"), CommandClass::Install);
    assert_eq!(classify("make -j8"), CommandClass::Install);
}

#[test]
fn test_classify_file_listing_commands() {
    assert_eq!(classify("ls -la /var"), CommandClass::FileListing);
    assert_eq!(classify("find / -name '*.log'"), CommandClass::FileListing);
    assert_eq!(classify("tree src"), CommandClass::FileListing);
}

#[test]
fn test_classify_log_search_commands() {
    assert_eq!(classify("grep -r ERROR /var/log"), CommandClass::LogSearch);
    assert_eq!(classify("journalctl -u nginx"), CommandClass::LogSearch);
    assert_eq!(classify("tail -f /var/log/syslog"), CommandClass::LogSearch);
}

#[test]
fn test_classify_generic_fallback() {
    assert_eq!(classify("whoami"), CommandClass::Generic);
    assert_eq!(classify("echo install"), CommandClass::Generic);
    // First match wins: a grep of an install log is still log search.
    assert_eq!(classify("grep install /var/log/dpkg.log"), CommandClass::LogSearch);
}

// ---------------------------------------------------------------------------
// Normalisation
// ---------------------------------------------------------------------------

#[test]
fn test_strip_ansi_removes_color_codes() {
    assert_eq!(strip_ansi("\x1b[32mgreen\x1b[0m plain"), "green plain");
}

#[test]
fn test_normalize_newlines() {
    let out = normalize(b"one\r\ntwo\rthree\n");
    assert_eq!(out, "one\ntwo\nthree\n");
}

#[test]
fn test_full_mode_is_idempotent() {
    let raw = b"\x1b[1mbold\x1b[0m\r\nplain\r\n".to_vec();
    let inp = input("echo x", &raw);
    let once = render(&inp, OutputMode::Full);

    let again_raw = once.text.clone().into_bytes();
    let inp2 = input("echo x", &again_raw);
    let twice = render(&inp2, OutputMode::Full);

    assert_eq!(once.text, twice.text);
}

#[test]
fn test_marker_lines_stripped_from_full() {
    let raw = b"real output\r\n__TERMBRIDGE_abc_STATUS_0__\r\n".to_vec();
    let inp = input("echo hi", &raw);
    let out = render(&inp, OutputMode::Full);
    assert_eq!(out.text, "real output");
}

#[test]
fn test_raw_mode_is_verbatim() {
    let raw = b"\x1b[32mcolored\x1b[0m\r\n__TERMBRIDGE_abc_STATUS_0__\r\n".to_vec();
    let inp = input("echo hi", &raw);
    let out = render(&inp, OutputMode::Raw);
    assert_eq!(out.text.as_bytes(), raw.as_slice());
}

// ---------------------------------------------------------------------------
// Error detection
// ---------------------------------------------------------------------------

#[test]
fn test_find_error_line_tokens() {
    let text = ["fine", "also fine", "cat: /nope: No such file or directory"];
    assert_eq!(find_error_line(&text), Some(2));

    let clean = ["all", "good"];
    assert_eq!(find_error_line(&clean), None);

    let upper = ["SEGMENTATION FAULT (core dumped)"];
    assert_eq!(find_error_line(&upper), Some(0));
}

#[test]
fn test_error_preservation_single_line_failure() {
    // The classic: `cat /nope` with one line of stderr and exit 1 comes
    // back whole in auto mode.
    let raw = b"cat: /nope: No such file or directory\n".to_vec();
    let mut inp = input("cat /nope", &raw);
    inp.exit_code = Some(1);
    let out = render(&inp, OutputMode::Auto);
    assert!(out.has_errors);
    assert_eq!(out.text, "cat: /nope: No such file or directory");
}

#[test]
fn test_error_context_preserved_in_large_output() {
    // Error token at line 200 of 400: auto keeps at least lines 180..400.
    let mut body = String::new();
    for i in 0..400 {
        if i == 200 {
            body.push_str("make: *** [all] Error 2\n");
        } else {
            body.push_str(&format!("line {i}\n"));
        }
    }
    let raw = body.into_bytes();
    let inp = input("make -j8", &raw);
    let out = render(&inp, OutputMode::Auto);
    assert!(out.has_errors);
    assert!(out.text.contains("line 180"), "context before the error is kept");
    assert!(out.text.contains("Error 2"));
    assert!(out.text.contains("line 399"), "tail after the error is kept");
    assert!(!out.text.contains("line 100\n"), "distant head is dropped");
}

#[test]
fn test_nonzero_exit_triggers_override_without_tokens() {
    let raw = lines(10);
    let mut inp = input("whoami", &raw);
    inp.exit_code = Some(3);
    let out = render(&inp, OutputMode::Auto);
    assert!(out.has_errors);
    // Small output: returned whole.
    assert!(out.text.contains("line 0") && out.text.contains("line 9"));
}

#[test]
fn test_minimal_upgraded_to_summary_on_error() {
    let raw = b"panic: index out of range\n".to_vec();
    let mut inp = input("./job", &raw);
    inp.exit_code = Some(2);
    let out = render(&inp, OutputMode::Minimal);
    assert!(out.has_errors);
    assert!(
        out.text.contains("errors detected"),
        "minimal must upgrade to a summary when failing, got: {}",
        out.text
    );
}

#[test]
fn test_minimal_mode_points_at_retrieval() {
    let raw = lines(5);
    let inp = input("whoami", &raw);
    let out = render(&inp, OutputMode::Minimal);
    assert!(out.text.contains("get_command_output"));
    assert!(out.text.contains("cmd-1"));
}

// ---------------------------------------------------------------------------
// Auto-mode thresholds
// ---------------------------------------------------------------------------

#[test]
fn test_auto_exactly_at_threshold_returns_full() {
    // Generic threshold is 50: exactly 50 lines come back whole.
    let raw = lines(50);
    let inp = input("./generate", &raw);
    let out = render(&inp, OutputMode::Auto);
    assert_eq!(out.omitted_lines, 0);
    assert!(out.text.contains("line 0"));
    assert!(out.text.contains("line 49"));
}

#[test]
fn test_auto_above_threshold_previews_generic() {
    let raw = lines(200);
    let inp = input("./generate", &raw);
    let out = render(&inp, OutputMode::Auto);
    assert!(out.omitted_lines > 0);
    assert!(out.text.contains("line 0"), "head is kept");
    assert!(out.text.contains("line 199"), "tail is kept");
    assert!(out.text.contains("lines omitted"));
}

#[test]
fn test_auto_large_install_summarises() {
    let mut body = String::new();
    for i in 0..500 {
        body.push_str(&format!("Get:{i} http://archive something\n"));
    }
    body.push_str("Setting up nginx-core (1.24.0-2) ...\n");
    body.push_str("Setting up nginx (1.24.0-2) ...\n");
    let raw = body.into_bytes();
    let inp = input("apt-get install -y nginx", &raw);
    let out = render(&inp, OutputMode::Auto);
    assert_eq!(out.class, CommandClass::Install);
    assert!(out.text.lines().count() <= 40, "summary stays small");
    assert_eq!(out.hint.as_deref(), Some("2 packages set up"));
    assert!(!out.has_errors);
}

#[test]
fn test_install_threshold_is_looser() {
    // 80 lines of install output is under the install threshold (100) and
    // comes back whole, where generic would have truncated.
    let raw = lines(80);
    let inp = input("apt-get install -y curl", &raw);
    let out = render(&inp, OutputMode::Auto);
    assert_eq!(out.omitted_lines, 0);
}

// ---------------------------------------------------------------------------
// Preview and summary
// ---------------------------------------------------------------------------

#[test]
fn test_preview_head_tail_counts() {
    let raw = lines(100);
    let inp = input("seq 1 100", &raw);
    let out = render(&inp, OutputMode::Preview);
    assert_eq!(out.omitted_lines, 50);
    let rendered: Vec<&str> = out.text.lines().collect();
    assert_eq!(rendered.len(), 51); // 30 head + marker + 20 tail
    assert_eq!(rendered[0], "line 0");
    assert_eq!(rendered[29], "line 29");
    assert!(rendered[30].contains("50 lines omitted"));
    assert_eq!(rendered[50], "line 99");
}

#[test]
fn test_preview_small_output_untouched() {
    let raw = lines(10);
    let inp = input("seq 1 10", &raw);
    let out = render(&inp, OutputMode::Preview);
    assert_eq!(out.omitted_lines, 0);
    assert_eq!(out.text.lines().count(), 10);
}

#[test]
fn test_summary_mode_metadata() {
    let raw = lines(1000);
    let inp = input("seq 1 1000", &raw);
    let out = render(&inp, OutputMode::Summary);
    assert_eq!(out.total_lines, 1000);
    assert_eq!(out.omitted_lines, 1000);
    assert!(out.text.contains("1000 lines"));
    assert!(out.text.contains("exit 0"));
    assert!(out.text.contains("1.5s"));
    // First line is the exit-status hint.
    assert!(out.text.contains("line 0"));
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

#[test]
fn test_filter_is_deterministic() {
    let raw = lines(321);
    let inp = input("./thing", &raw);
    for mode in [
        OutputMode::Auto,
        OutputMode::Raw,
        OutputMode::Full,
        OutputMode::Preview,
        OutputMode::Summary,
        OutputMode::Minimal,
    ] {
        let a = render(&inp, mode);
        let b = render(&inp, mode);
        assert_eq!(a.text, b.text, "mode {mode:?} must be deterministic");
        assert_eq!(a.omitted_lines, b.omitted_lines);
    }
}

#[test]
fn test_empty_buffer() {
    let raw: Vec<u8> = Vec::new();
    let inp = input("true", &raw);
    let out = render(&inp, OutputMode::Auto);
    assert_eq!(out.total_lines, 0);
    assert_eq!(out.text, "");
    assert!(!out.has_errors);
}
