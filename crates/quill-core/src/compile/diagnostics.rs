//! Compiler diagnostics: parsing rustc's JSON output and mapping spans
//! back to the user's original source lines.

use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

/// A compiler diagnostic, located in the user's own source.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Diagnostic message.
    pub message: String,

    /// Code (e.g., "E0308") or lint name (e.g., "unused_variables").
    pub code: Option<String>,

    /// Severity.
    pub severity: Severity,

    /// Primary source location, mapped to the original source.
    pub location: Option<SourceLocation>,

    /// All spans, mapped to the original source.
    pub spans: Vec<DiagnosticSpan>,

    /// Rendered text as produced by rustc.
    pub rendered: Option<String>,
}

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
    Help,
}

impl Severity {
    fn from_level(level: &str) -> Option<Self> {
        match level {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "note" => Some(Self::Note),
            "help" => Some(Self::Help),
            _ => None,
        }
    }

    fn colored_label(self) -> &'static str {
        match self {
            Self::Error => "\x1b[1;31merror\x1b[0m",
            Self::Warning => "\x1b[1;33mwarning\x1b[0m",
            Self::Note => "\x1b[1;36mnote\x1b[0m",
            Self::Help => "\x1b[1;32mhelp\x1b[0m",
        }
    }
}

/// A location in source code (1-indexed).
#[derive(Debug, Clone)]
pub struct SourceLocation {
    /// Source file path.
    pub file: PathBuf,

    /// Line number.
    pub line: usize,

    /// Column number.
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// A diagnostic span with label.
#[derive(Debug, Clone)]
pub struct DiagnosticSpan {
    /// Start of this span.
    pub location: SourceLocation,

    /// End location (for multi-line spans).
    pub end_location: Option<SourceLocation>,

    /// Label attached to this span.
    pub label: Option<String>,

    /// Whether this is the primary span.
    pub is_primary: bool,
}

/// The subset of rustc's `--error-format=json` records the engine reads.
/// Unknown fields (byte offsets, suggestions, children) are skipped.
#[derive(Debug, Deserialize)]
struct RustcDiagnostic {
    message: String,
    code: Option<RustcCode>,
    level: String,
    spans: Vec<RustcSpan>,
    rendered: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RustcCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct RustcSpan {
    line_start: usize,
    line_end: usize,
    column_start: usize,
    column_end: usize,
    is_primary: bool,
    label: Option<String>,
}

/// Maps rustc spans in the assembled wrapper back to original lines.
///
/// The wrapper embeds the user source as one contiguous region, so a
/// handful of anchor mappings per region is enough; lines between
/// anchors are resolved by offset from the nearest anchor at or before
/// them.
pub struct LineMapper {
    /// `(generated, original)` anchor pairs, ascending by generated line.
    mappings: Vec<(usize, usize)>,

    /// Path reported in mapped locations.
    script_file: PathBuf,
}

impl LineMapper {
    pub fn new(script_file: PathBuf) -> Self {
        Self {
            mappings: Vec::new(),
            script_file,
        }
    }

    /// Record that `generated_line` of the wrapper holds `original_line`
    /// of the script. Anchors must be added in ascending generated order.
    pub fn add_mapping(&mut self, generated_line: usize, original_line: usize) {
        debug_assert!(
            self.mappings.last().is_none_or(|&(g, _)| g <= generated_line),
            "anchors must be added in ascending generated-line order"
        );
        self.mappings.push((generated_line, original_line));
    }

    /// Parse rustc JSON output into mapped diagnostics.
    ///
    /// Lines that are not diagnostic records (artifact notifications,
    /// stray stderr text) are skipped.
    pub fn parse_rustc_output(&self, raw: &str) -> Vec<Diagnostic> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<RustcDiagnostic>(line) {
                Ok(record) => self.map_diagnostic(&record),
                Err(e) => {
                    let preview: String = line.chars().take(100).collect();
                    tracing::debug!("Skipping non-diagnostic rustc line ({e}): {preview}");
                    None
                }
            })
            .collect()
    }

    /// Translate one rustc record, dropping levels the engine does not
    /// surface ("failure-note" and friends).
    fn map_diagnostic(&self, record: &RustcDiagnostic) -> Option<Diagnostic> {
        let severity = Severity::from_level(&record.level)?;

        let spans: Vec<DiagnosticSpan> = record.spans.iter().map(|s| self.convert_span(s)).collect();
        let location = spans
            .iter()
            .find(|span| span.is_primary)
            .map(|span| span.location.clone());

        Some(Diagnostic {
            message: record.message.clone(),
            code: record.code.as_ref().map(|c| c.code.clone()),
            severity,
            location,
            spans,
            rendered: record.rendered.clone(),
        })
    }

    fn convert_span(&self, span: &RustcSpan) -> DiagnosticSpan {
        let end_location = (span.line_end != span.line_start)
            .then(|| self.location_at(span.line_end, span.column_end));
        DiagnosticSpan {
            location: self.location_at(span.line_start, span.column_start),
            end_location,
            label: span.label.clone(),
            is_primary: span.is_primary,
        }
    }

    fn location_at(&self, generated_line: usize, column: usize) -> SourceLocation {
        SourceLocation {
            file: self.script_file.clone(),
            line: self.map_line(generated_line),
            column,
        }
    }

    /// Map a generated line number to an original line number.
    fn map_line(&self, generated_line: usize) -> usize {
        if self.mappings.is_empty() {
            return generated_line;
        }
        let at_or_before = self
            .mappings
            .partition_point(|&(generated, _)| generated <= generated_line);
        let (anchor_generated, anchor_original) = self.mappings[at_or_before.saturating_sub(1)];
        let offset = generated_line as isize - anchor_generated as isize;
        (anchor_original as isize + offset).max(1) as usize
    }
}

impl Diagnostic {
    /// An error diagnostic carrying only a message, for engine-side
    /// failures that never reached rustc.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            severity: Severity::Error,
            location: None,
            spans: Vec::new(),
            rendered: None,
        }
    }

    /// An error diagnostic whose message doubles as its rendered text,
    /// for raw rustc output that could not be parsed as JSON.
    pub fn from_rendered(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            rendered: Some(text.clone()),
            ..Self::error(text)
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Whether this diagnostic's code or lint name is in the suppression
    /// set.
    pub fn is_suppressed(&self, suppressions: &[String]) -> bool {
        match &self.code {
            Some(code) => suppressions.iter().any(|s| s == code),
            None => false,
        }
    }

    /// Format the diagnostic for terminal display.
    pub fn format_terminal(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let label = self.severity.colored_label();
        let _ = match &self.code {
            Some(code) => writeln!(out, "{label}[{code}]: {}", self.message),
            None => writeln!(out, "{label}: {}", self.message),
        };
        if let Some(location) = &self.location {
            let _ = writeln!(out, "  \x1b[1;34m-->\x1b[0m {location}");
        }
        out
    }
}
