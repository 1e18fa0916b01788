//! Reference scanning and substitution over free text.
//!
//! Two syntaxes are recognized: `{{name}}` / `{{table.column}}` against the
//! variable store, and `@nickname` against the attached-source catalog.
//! Scanning is pure over the pair (text, store snapshot): it never mutates
//! anything and never fails. An unknown name is a displayable "unresolved"
//! reference, not an error, so editors can decorate it and execution can
//! substitute it as empty text.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use conveyor_types::{Row, Variable, VariableValue};

use crate::sources::SourceCatalog;
use crate::vars::VariableReader;

// Compiled once; iteration advances statefully through the haystack so
// repeated occurrences each report their own offsets.
static CURLY_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*))?\s*\}\}")
        .expect("curly reference pattern compiles")
});

static SOURCE_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z_]+)(?:\.([A-Za-z0-9_]+))?").expect("source reference pattern compiles"));

/// What a scanned reference points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `{{name}}`, a whole variable.
    Variable,
    /// `{{table.column}}`, one declared column of a table variable.
    TableColumn,
    /// `@nickname`, an attached source.
    Source,
}

/// One located template reference within a scanned string.
///
/// Spans are zero-based character offsets into the input, end exclusive, so
/// they line up with what an editor cursor counts rather than with bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub span_start: usize,
    pub span_end: usize,
    /// The matched text verbatim, braces and all.
    pub raw_text: String,
    pub kind: ReferenceKind,
    /// Display value when the reference resolves; `None` marks unresolved.
    pub resolved_value: Option<String>,
}

impl Reference {
    pub fn is_resolved(&self) -> bool {
        self.resolved_value.is_some()
    }
}

struct RawMatch {
    byte_start: usize,
    byte_end: usize,
    kind: ReferenceKind,
    resolved_value: Option<String>,
}

/// Scan `text` for every reference, in order of appearance.
///
/// Unresolved references are returned alongside resolved ones; callers that
/// only care about hits filter on [`Reference::is_resolved`].
pub fn scan_references(
    text: &str,
    variables: &dyn VariableReader,
    sources: &dyn SourceCatalog,
) -> Vec<Reference> {
    let mut raw: Vec<RawMatch> = Vec::new();

    for captures in CURLY_REFERENCE.captures_iter(text) {
        let Some(whole) = captures.get(0) else { continue };
        let column = captures.get(2);
        let kind = if column.is_some() {
            ReferenceKind::TableColumn
        } else {
            ReferenceKind::Variable
        };
        raw.push(RawMatch {
            byte_start: whole.start(),
            byte_end: whole.end(),
            kind,
            resolved_value: resolve_curly(variables, &captures[1], column.map(|m| m.as_str())),
        });
    }

    for captures in SOURCE_REFERENCE.captures_iter(text) {
        let Some(whole) = captures.get(0) else { continue };
        // `@report.page` resolves by its base nickname; the segment is an
        // addressing hint for whoever consumes the source.
        let resolved = sources.contains(&captures[1]).then(|| captures[1].to_string());
        raw.push(RawMatch {
            byte_start: whole.start(),
            byte_end: whole.end(),
            kind: ReferenceKind::Source,
            resolved_value: resolved,
        });
    }

    raw.sort_by_key(|m| m.byte_start);

    // Convert byte offsets to character offsets in one forward pass.
    let mut references = Vec::with_capacity(raw.len());
    let mut chars_before = 0usize;
    let mut last_byte = 0usize;
    for m in raw {
        chars_before += text[last_byte..m.byte_start].chars().count();
        let span_len = text[m.byte_start..m.byte_end].chars().count();
        references.push(Reference {
            span_start: chars_before,
            span_end: chars_before + span_len,
            raw_text: text[m.byte_start..m.byte_end].to_string(),
            kind: m.kind,
            resolved_value: m.resolved_value,
        });
        chars_before += span_len;
        last_byte = m.byte_end;
    }
    references
}

/// Replace every `{{...}}` reference in `text` with its resolved display
/// value. Unresolved references substitute as empty text; `@nickname`
/// mentions are left literal for the action layer to interpret.
pub fn substitute(text: &str, variables: &dyn VariableReader) -> String {
    CURLY_REFERENCE
        .replace_all(text, |captures: &Captures<'_>| {
            resolve_curly(variables, &captures[1], captures.get(2).map(|m| m.as_str())).unwrap_or_default()
        })
        .into_owned()
}

/// Resolution for the curly syntaxes.
///
/// A plain name resolves when the variable exists, whatever its kind. A
/// dotted name resolves only when the base is a table whose declared columns
/// contain the segment; declared-but-empty still resolves (to empty text).
fn resolve_curly(variables: &dyn VariableReader, name: &str, column: Option<&str>) -> Option<String> {
    let variable = variables.variable(name)?;
    match column {
        None => Some(variable_display(variable)),
        Some(column) => {
            if !variable.table_has_column(column) {
                return None;
            }
            variable.rows().map(|rows| column_display(rows, column))
        }
    }
}

fn variable_display(variable: &Variable) -> String {
    match &variable.value {
        VariableValue::Scalar { value } => display_value(value),
        VariableValue::Table { rows, .. } => serde_json::to_string(rows).unwrap_or_default(),
    }
}

/// Non-null cells of one column, joined for display.
fn column_display(rows: &[Row], column: &str) -> String {
    let cells: Vec<String> = rows
        .iter()
        .filter_map(|row| row.get(column))
        .filter(|cell| !cell.is_null())
        .map(display_value)
        .collect();
    cells.join(", ")
}

/// How a single JSON value reads when flattened into text.
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
