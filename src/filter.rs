//! Output filtering: raw terminal bytes in, agent-facing payloads out.
//!
//! This is the half of the dual stream the agent sees. Viewers get the byte
//! stream verbatim; the agent gets a payload shaped by an output mode and a
//! classification of the command, so 15,000 lines of `apt-get` collapse to
//! a short summary while a one-line failure comes back in full. All policies
//! are deterministic given the inputs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;

use crate::config::{Thresholds, Truncation};
use crate::session::MARKER_PREFIX;

/// Error tokens scanned for, case-insensitively, when classifying a buffer
/// as failing. Order is irrelevant; the first matching *line* wins.
const ERROR_TOKENS: &[&str] = &[
    "error",
    "fatal",
    "critical",
    "permission denied",
    "no such file",
    "command not found",
    "segmentation fault",
    "traceback",
    "panic:",
];

/// Lines of context preserved before the first error token.
const ERROR_CONTEXT_LINES: usize = 20;

/// Regex matching terminal control sequences (CSI, OSC, simple escapes) and
/// backspace overstrike pairs.
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-9;?<=>!]*[a-zA-Z~]|\x1b\][^\x07]*\x07|\x1b[()][0-9A-B]|\x1b[a-zA-Z]|.\x08",
    )
    .expect("invalid ANSI regex")
});

static INSTALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^\s*(?:sudo\s+)?
          (?: (?:apt|apt-get|aptitude|yum|dnf|zypper|apk|pacman|brew|pip3?|pipx|npm|pnpm|yarn|cargo|gem|go)\s+
              (?:-\S+\s+)*
              (?:install|add|upgrade|update|ci|get)\b
            | make\b
            | mvn\b
            | gradle\b
          )",
    )
    .expect("invalid install regex")
});

static FILE_LISTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:sudo\s+)?(?:ls|ll|la|dir|tree|find|fd|du|df)\b").expect("invalid listing regex")
});

static LOG_SEARCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:sudo\s+)?(?:grep|egrep|fgrep|zgrep|rg|ag|ack|journalctl|dmesg|tail|zcat)\b")
        .expect("invalid log search regex")
});

/// How the agent asked for a command's output to be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Policy-driven default: full for small or failing output, class
    /// summary or preview otherwise.
    #[default]
    Auto,
    /// Buffer verbatim, control sequences and all.
    Raw,
    /// Buffer with control sequences stripped and newlines normalised.
    Full,
    /// Head and tail lines joined by an omitted-line marker.
    Preview,
    /// Metadata only.
    Summary,
    /// Status plus a pointer for later retrieval.
    Minimal,
}

/// Coarse classification of the command text; drives auto-mode thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandClass {
    Install,
    FileListing,
    LogSearch,
    Generic,
}

impl CommandClass {
    fn threshold(self, t: &Thresholds) -> usize {
        match self {
            Self::Install => t.install,
            Self::FileListing => t.file_listing,
            Self::LogSearch => t.log_search,
            Self::Generic => t.generic,
        }
    }
}

/// Classify a command string. First match wins; everything else is generic.
#[must_use]
pub fn classify(command: &str) -> CommandClass {
    if INSTALL_RE.is_match(command) {
        CommandClass::Install
    } else if FILE_LISTING_RE.is_match(command) {
        CommandClass::FileListing
    } else if LOG_SEARCH_RE.is_match(command) {
        CommandClass::LogSearch
    } else {
        CommandClass::Generic
    }
}

/// Strip terminal control sequences from a string.
#[must_use]
pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").to_string()
}

/// Decode raw terminal bytes into clean text: lossy UTF-8, control
/// sequences stripped, `\r\n` and stray `\r` normalised to `\n`.
#[must_use]
pub fn normalize(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let stripped = strip_ansi(&text);
    stripped.replace("\r\n", "\n").replace('\r', "\n")
}

/// Drop lines carrying the broker's internal markers (probe echoes, exit
/// status captures) and shell-prompt artifacts. Agent payloads never show
/// either.
#[must_use]
pub fn strip_marker_lines(text: &str) -> String {
    let mut out: Vec<&str> = text
        .lines()
        .filter(|line| !line.contains(MARKER_PREFIX) && !is_prompt_artifact(line))
        .collect();
    while out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }
    out.join("\n")
}

/// Common prompt shapes: a bare terminator, or a line ending in
/// "terminator + space" the way interactive prompts sit at the stream tail.
fn is_prompt_artifact(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed == "$"
        || trimmed == "#"
        || trimmed == ">"
        || line.ends_with("$ ")
        || line.ends_with("# ")
        || line.ends_with("> ")
        || (trimmed.starts_with('[') && trimmed.ends_with("]$"))
}

/// Index of the first line containing an error token, if any.
#[must_use]
pub fn find_error_line(lines: &[&str]) -> Option<usize> {
    lines.iter().position(|line| {
        let lower = line.to_lowercase();
        ERROR_TOKENS.iter().any(|tok| lower.contains(tok))
    })
}

/// Everything the filter needs to know about one command's output.
#[derive(Debug, Clone)]
pub struct FilterInput<'a> {
    pub command_id: &'a str,
    pub command: &'a str,
    /// Buffer as retained (may have an elided middle).
    pub raw: &'a [u8],
    pub exit_code: Option<i32>,
    pub duration: Option<Duration>,
    /// The retained buffer dropped bytes from its middle.
    pub buffer_truncated: bool,
}

/// Agent-facing rendering of a command's output.
#[derive(Debug, Clone, Serialize)]
pub struct FilteredOutput {
    /// Mode actually applied (auto resolves to a concrete behaviour but is
    /// reported as requested).
    pub mode: OutputMode,
    pub class: CommandClass,
    pub text: String,
    pub total_lines: usize,
    pub total_bytes: usize,
    /// Lines not present in `text` (truncation by the filter, not the
    /// buffer).
    pub omitted_lines: usize,
    pub has_errors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Advisory: the retained buffer itself lost its middle.
    pub truncated_buffer: bool,
    /// Derived one-liner for summary-style renderings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Render a command's output under the given mode. Deterministic: the same
/// inputs always produce the same payload.
#[must_use]
pub fn render(
    input: &FilterInput<'_>,
    mode: OutputMode,
    thresholds: &Thresholds,
    truncation: &Truncation,
) -> FilteredOutput {
    let class = classify(input.command);

    // Raw is the escape hatch: the buffer exactly as retained, markers,
    // control sequences and all. It round-trips with fetch_raw.
    if mode == OutputMode::Raw {
        let text = String::from_utf8_lossy(input.raw).into_owned();
        let total_lines = count_lines(&text);
        return FilteredOutput {
            mode,
            class,
            total_lines,
            total_bytes: input.raw.len(),
            omitted_lines: 0,
            has_errors: false,
            exit_code: input.exit_code,
            duration_seconds: input.duration.map(|d| d.as_secs_f64()),
            truncated_buffer: input.buffer_truncated,
            hint: None,
            text,
        };
    }

    let clean = strip_marker_lines(&normalize(input.raw));
    let lines: Vec<&str> = if clean.is_empty() {
        Vec::new()
    } else {
        clean.lines().collect()
    };
    let total_lines = lines.len();
    let total_bytes = input.raw.len();

    let error_line = find_error_line(&lines);
    let nonzero_exit = input.exit_code.is_some_and(|c| c != 0);
    let has_errors = error_line.is_some() || nonzero_exit;

    // Minimal is upgraded to summary when the output is failing so the
    // agent never has to round-trip to learn why something broke.
    let mode_applied = match mode {
        OutputMode::Minimal if has_errors => OutputMode::Summary,
        other => other,
    };

    let base = FilteredOutput {
        mode,
        class,
        text: String::new(),
        total_lines,
        total_bytes,
        omitted_lines: 0,
        has_errors,
        exit_code: input.exit_code,
        duration_seconds: input.duration.map(|d| d.as_secs_f64()),
        truncated_buffer: input.buffer_truncated,
        hint: None,
    };

    match mode_applied {
        OutputMode::Raw => unreachable!("handled above"),
        OutputMode::Full => FilteredOutput {
            text: clean,
            ..base
        },
        OutputMode::Preview => {
            let (text, omitted) =
                preview(&lines, truncation.head_lines, truncation.tail_lines);
            FilteredOutput {
                text,
                omitted_lines: omitted,
                ..base
            }
        }
        OutputMode::Summary => FilteredOutput {
            hint: install_hint(class, &lines),
            text: summary_text(input, &lines, has_errors),
            omitted_lines: total_lines,
            ..base
        },
        OutputMode::Minimal => FilteredOutput {
            text: format!(
                "status only; retrieve output with get_command_output id={}",
                input.command_id
            ),
            omitted_lines: total_lines,
            ..base
        },
        OutputMode::Auto => {
            let threshold = class.threshold(thresholds);
            if has_errors {
                if total_lines <= threshold {
                    // Small failing output goes back whole.
                    FilteredOutput {
                        text: clean,
                        ..base
                    }
                } else {
                    let start = error_line
                        .map(|n| n.saturating_sub(ERROR_CONTEXT_LINES))
                        .unwrap_or_else(|| total_lines.saturating_sub(ERROR_CONTEXT_LINES));
                    let excerpt = lines[start..].join("\n");
                    let summary = summary_text(input, &lines, has_errors);
                    FilteredOutput {
                        text: format!("{summary}\n--- output from line {} ---\n{excerpt}", start + 1),
                        omitted_lines: start,
                        ..base
                    }
                }
            } else if total_lines <= threshold {
                FilteredOutput {
                    text: clean,
                    ..base
                }
            } else if class == CommandClass::Install {
                let hint = install_hint(class, &lines);
                let excerpt = install_excerpt(&lines);
                let summary = summary_text(input, &lines, has_errors);
                let omitted = total_lines.saturating_sub(count_lines(&excerpt));
                FilteredOutput {
                    text: format!("{summary}\n{excerpt}"),
                    omitted_lines: omitted,
                    hint,
                    ..base
                }
            } else {
                let (text, omitted) =
                    preview(&lines, truncation.head_lines, truncation.tail_lines);
                FilteredOutput {
                    text,
                    omitted_lines: omitted,
                    ..base
                }
            }
        }
    }
}

fn count_lines(text: &str) -> usize {
    if text.is_empty() { 0 } else { text.lines().count() }
}

/// Head + tail join with an omitted-line marker. Returns the joined text
/// and how many lines the marker stands for.
fn preview(lines: &[&str], head: usize, tail: usize) -> (String, usize) {
    if lines.len() <= head + tail {
        return (lines.join("\n"), 0);
    }
    let omitted = lines.len() - head - tail;
    let marker = format!("... [{omitted} lines omitted] ...");
    let mut parts: Vec<&str> = Vec::with_capacity(head + tail + 1);
    parts.extend_from_slice(&lines[..head]);
    parts.push(&marker);
    parts.extend_from_slice(&lines[lines.len() - tail..]);
    (parts.join("\n"), omitted)
}

/// Compact metadata block for summary-style renderings.
fn summary_text(input: &FilterInput<'_>, lines: &[&str], has_errors: bool) -> String {
    let mut parts = vec![format!(
        "{} lines, {} bytes",
        lines.len(),
        input.raw.len()
    )];
    if let Some(code) = input.exit_code {
        parts.push(format!("exit {code}"));
    }
    if let Some(d) = input.duration {
        parts.push(format!("{:.1}s", d.as_secs_f64()));
    }
    if has_errors {
        parts.push("errors detected".to_string());
    }
    if input.buffer_truncated {
        parts.push("buffer truncated".to_string());
    }
    let mut text = format!("[{}]", parts.join(", "));
    if let Some(first) = lines.iter().find(|l| !l.trim().is_empty()) {
        text.push('\n');
        text.push_str(first);
    }
    text
}

/// Derived hint for install-class output ("12 packages set up" style).
fn install_hint(class: CommandClass, lines: &[&str]) -> Option<String> {
    if class != CommandClass::Install {
        return None;
    }
    let set_up = lines
        .iter()
        .filter(|l| l.trim_start().starts_with("Setting up "))
        .count();
    if set_up > 0 {
        return Some(format!("{set_up} packages set up"));
    }
    if lines
        .iter()
        .any(|l| l.to_lowercase().contains("installed"))
    {
        return Some("installed".to_string());
    }
    None
}

/// Short excerpt for install output: the progress lines an operator would
/// scan for, capped small.
fn install_excerpt(lines: &[&str]) -> String {
    const MAX_EXCERPT: usize = 20;
    let interesting: Vec<&str> = lines
        .iter()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with("Setting up ")
                || t.starts_with("Unpacking ")
                || t.to_lowercase().contains("installed")
        })
        .copied()
        .collect();
    let picked: Vec<&str> = if interesting.is_empty() {
        let start = lines.len().saturating_sub(MAX_EXCERPT);
        lines[start..].to_vec()
    } else if interesting.len() > MAX_EXCERPT {
        let mut v: Vec<&str> = interesting[..MAX_EXCERPT / 2].to_vec();
        v.push("...");
        v.extend_from_slice(&interesting[interesting.len() - MAX_EXCERPT / 2..]);
        v
    } else {
        interesting
    };
    picked.join("\n")
}
