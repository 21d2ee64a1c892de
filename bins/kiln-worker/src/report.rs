/// Test Report Parser - Console Transcript to Structured Outcomes
///
/// **Core Responsibility:**
/// Turn the test runner's human-readable tree report into an ordered list of
/// `TestOutcome`s, attaching the verbatim failure block to each failed test.
///
/// **Report Shape (JUnit Platform console, `--details=tree`):**
/// ```text
/// ├─ JUnit Jupiter ✔                      <- begin marker
/// │  ├─ PersonTest ✔                      <- class header
/// │  │  └─ testToString() ✘ expected: ..  <- test line (has "()")
/// ├─ JUnit Vintage ✔                      <- end marker
///
/// Failures (1):                           <- failures marker
///   JUnit Jupiter:PersonTest:testToString()   <- failure boundary
///     => org.opentest4j.AssertionFailedError ...
///
/// Test run finished after 75 ms           <- final boundary
/// ```
///
/// **Scan Rules:**
/// - Markers are matched on the ANSI-stripped line
/// - Window lines without a tree-branch glyph are continuations and ignored
/// - Failed tests take failure spans in report order; a failed test with no
///   span left keeps `detail = None`
/// - Missing begin or end marker is a malformed report, never a partial result
///
/// Pure function over lines: knows nothing about processes or queues.

use kiln_common::types::TestOutcome;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("malformed test report: begin marker `{0}` not found")]
    MissingBeginMarker(String),

    #[error("malformed test report: end marker `{0}` not found")]
    MissingEndMarker(String),
}

/// Fixed strings that locate sections and outcomes in a transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportLayout {
    pub begin_marker: String,
    pub end_marker: String,
    pub failures_marker: String,
    pub failure_entry_marker: String,
    pub summary_marker: String,
    pub call_signature: String,
    pub branch_glyph: String,
    pub success_glyph: String,
    pub failure_glyph: String,
}

impl Default for ReportLayout {
    fn default() -> Self {
        Self {
            begin_marker: "JUnit Jupiter".to_string(),
            end_marker: "JUnit Vintage".to_string(),
            failures_marker: "Failures (".to_string(),
            failure_entry_marker: "JUnit Jupiter:".to_string(),
            summary_marker: "Test run finished".to_string(),
            call_signature: "()".to_string(),
            branch_glyph: "─".to_string(),
            success_glyph: "✔".to_string(),
            failure_glyph: "✘".to_string(),
        }
    }
}

/// Remove ANSI SGR/CSI escape sequences
pub fn strip_ansi(line: &str) -> Cow<'_, str> {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]").expect("ANSI regex must compile"))
        .replace_all(line, "")
}

enum ScanState {
    /// Before the begin marker
    Seeking,
    /// Inside the tree window; tracks the most recent class header
    InClassSection { class_name: String },
    /// Tree closed, looking for the failures section
    SeekingFailures,
    /// Collecting failure boundaries until the summary line
    InFailureBlock,
    Finished,
}

enum LineKind {
    Test { method: String, failed: bool },
    ClassHeader(String),
    Ignored,
}

struct ReportedTest {
    name: String,
    failed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TestReportParser {
    layout: ReportLayout,
}

impl TestReportParser {
    pub fn new(layout: ReportLayout) -> Self {
        Self { layout }
    }

    pub fn parse<S: AsRef<str>>(&self, transcript: &[S]) -> Result<Vec<TestOutcome>, ReportError> {
        let layout = &self.layout;
        let mut state = ScanState::Seeking;
        let mut reported: Vec<ReportedTest> = Vec::new();
        let mut boundaries: Vec<usize> = Vec::new();

        for (index, raw) in transcript.iter().enumerate() {
            let line = strip_ansi(raw.as_ref());

            state = match state {
                ScanState::Seeking if line.contains(&layout.begin_marker) => {
                    ScanState::InClassSection {
                        class_name: String::new(),
                    }
                }
                ScanState::Seeking => ScanState::Seeking,

                ScanState::InClassSection { .. } if line.contains(&layout.end_marker) => {
                    ScanState::SeekingFailures
                }
                ScanState::InClassSection { class_name } => match self.classify(&line) {
                    LineKind::ClassHeader(name) => ScanState::InClassSection { class_name: name },
                    LineKind::Test { method, failed } => {
                        reported.push(ReportedTest {
                            name: render_name(&class_name, &method),
                            failed,
                        });
                        ScanState::InClassSection { class_name }
                    }
                    LineKind::Ignored => ScanState::InClassSection { class_name },
                },

                ScanState::SeekingFailures if line.contains(&layout.failures_marker) => {
                    ScanState::InFailureBlock
                }
                ScanState::SeekingFailures if line.contains(&layout.summary_marker) => {
                    ScanState::Finished
                }
                ScanState::SeekingFailures => ScanState::SeekingFailures,

                ScanState::InFailureBlock if line.contains(&layout.summary_marker) => {
                    boundaries.push(index);
                    ScanState::Finished
                }
                ScanState::InFailureBlock => {
                    if line.contains(&layout.failure_entry_marker) {
                        boundaries.push(index);
                    }
                    ScanState::InFailureBlock
                }

                ScanState::Finished => ScanState::Finished,
            };
        }

        match state {
            ScanState::Seeking => {
                return Err(ReportError::MissingBeginMarker(layout.begin_marker.clone()))
            }
            ScanState::InClassSection { .. } => {
                return Err(ReportError::MissingEndMarker(layout.end_marker.clone()))
            }
            // No summary line: the transcript end closes the last span
            ScanState::InFailureBlock => boundaries.push(transcript.len()),
            ScanState::SeekingFailures | ScanState::Finished => {}
        }

        // Each failed test consumes the next span between two boundaries.
        // The iterator stops at the last boundary, so a surplus of failed
        // tests leaves them without detail instead of indexing past the end.
        let mut spans = boundaries.windows(2);
        let outcomes = reported
            .into_iter()
            .map(|test| {
                if !test.failed {
                    return TestOutcome::success(test.name);
                }
                let detail = spans.next().map(|span| failure_block(&transcript[span[0]..span[1]]));
                if detail.is_none() {
                    warn!(test = %test.name, "Failed test has no matching failure block");
                }
                TestOutcome::failed(test.name, detail)
            })
            .collect();

        Ok(outcomes)
    }

    fn classify(&self, line: &str) -> LineKind {
        let layout = &self.layout;
        let Some(branch) = line.rfind(layout.branch_glyph.as_str()) else {
            return LineKind::Ignored;
        };
        let rest = &line[branch + layout.branch_glyph.len()..];

        if line.contains(&layout.call_signature) {
            let method = rest.split('(').next().unwrap_or("").trim();
            if method.is_empty() {
                return LineKind::Ignored;
            }
            return LineKind::Test {
                method: method.to_string(),
                failed: line.contains(&layout.failure_glyph),
            };
        }

        let end = [&layout.failure_glyph, &layout.success_glyph]
            .iter()
            .filter_map(|glyph| rest.find(glyph.as_str()))
            .min()
            .unwrap_or(rest.len());
        match rest[..end].trim() {
            "" => LineKind::Ignored,
            name => LineKind::ClassHeader(name.to_string()),
        }
    }
}

fn render_name(class_name: &str, method: &str) -> String {
    if class_name.is_empty() {
        format!("{}()", method)
    } else {
        format!("{}.{}()", class_name, method)
    }
}

fn failure_block<S: AsRef<str>>(lines: &[S]) -> String {
    lines
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}
