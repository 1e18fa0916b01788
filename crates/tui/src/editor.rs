//! Prompt editor state with live reference annotations.
//!
//! The editor wraps a UTF-8 safe text buffer with cursor management and a
//! decoration list derived from scanning the buffer for references. The
//! decoration set is recomputed wholesale after every edit; there is no
//! incremental patching to drift out of sync with the text.

use conveyor_engine::resolve::scan_references;
use conveyor_engine::sources::SourceCatalog;
use conveyor_engine::vars::VariableReader;

/// A styled region of the prompt, derived from one scanned reference.
///
/// Offsets are character positions into the buffer, end exclusive. A
/// decoration carries exactly one bit of presentation state: the reference
/// either resolves against the current stores or it does not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decoration {
    pub start_char: usize,
    pub end_char: usize,
    pub resolved: bool,
}

/// Editable prompt buffer with cursor management.
///
/// The cursor is a byte index into `text`, always on a UTF-8 boundary.
#[derive(Clone, Debug, Default)]
pub struct PromptEditorState {
    text: String,
    cursor: usize,
    decorations: Vec<Decoration>,
}

impl PromptEditorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing prompt text with the cursor at the end.
    pub fn with_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let cursor = text.len();
        Self {
            text,
            cursor,
            decorations: Vec::new(),
        }
    }

    // ----- Getters -----
    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn cursor(&self) -> usize {
        self.cursor
    }
    pub fn decorations(&self) -> &[Decoration] {
        &self.decorations
    }
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    pub fn resolved_count(&self) -> usize {
        self.decorations.iter().filter(|decoration| decoration.resolved).count()
    }

    pub fn unresolved_count(&self) -> usize {
        self.decorations.len() - self.resolved_count()
    }

    /// Cursor location as `(row, column)` where the column counts characters
    /// from the start of the cursor's line.
    pub fn cursor_row_col(&self) -> (usize, usize) {
        let before = &self.text[..self.cursor];
        let row = before.matches('\n').count();
        let line_start = before.rfind('\n').map(|index| index + 1).unwrap_or(0);
        let column = before[line_start..].chars().count();
        (row, column)
    }

    // ----- Editing primitives (UTF-8 safe) -----

    /// Move cursor one Unicode scalar to the left.
    pub fn move_left(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let prev_len = self.text[..self.cursor].chars().last().map(|c| c.len_utf8()).unwrap_or(1);
        self.cursor = self.cursor.saturating_sub(prev_len);
    }

    /// Move cursor one Unicode scalar to the right.
    pub fn move_right(&mut self) {
        if self.cursor >= self.text.len() {
            return;
        }
        if let Some(next) = self.text[self.cursor..].chars().next() {
            self.cursor = self.cursor.saturating_add(next.len_utf8());
        }
    }

    /// Move to the same column on the previous line, clamped to its length.
    pub fn move_up(&mut self) {
        let (line_start, _) = self.line_bounds();
        if line_start == 0 {
            self.cursor = 0;
            return;
        }
        let column = self.text[line_start..self.cursor].chars().count();
        let prev_start = self.text[..line_start - 1].rfind('\n').map(|index| index + 1).unwrap_or(0);
        let prev_line = &self.text[prev_start..line_start - 1];
        self.cursor = prev_start + byte_offset_for_column(prev_line, column);
    }

    /// Move to the same column on the next line, clamped to its length.
    pub fn move_down(&mut self) {
        let (line_start, line_end) = self.line_bounds();
        if line_end >= self.text.len() {
            self.cursor = self.text.len();
            return;
        }
        let column = self.text[line_start..self.cursor].chars().count();
        let next_start = line_end + 1;
        let next_end = self.text[next_start..]
            .find('\n')
            .map(|offset| next_start + offset)
            .unwrap_or(self.text.len());
        let next_line = &self.text[next_start..next_end];
        self.cursor = next_start + byte_offset_for_column(next_line, column);
    }

    pub fn move_line_start(&mut self) {
        self.cursor = self.line_bounds().0;
    }

    pub fn move_line_end(&mut self) {
        self.cursor = self.line_bounds().1;
    }

    /// Insert a char at the cursor.
    pub fn insert_char(&mut self, c: char) {
        self.text.insert(self.cursor, c);
        self.cursor += c.len_utf8();
    }

    pub fn insert_newline(&mut self) {
        self.insert_char('\n');
    }

    /// Backspace the char immediately before the cursor.
    pub fn backspace(&mut self) {
        if self.cursor == 0 {
            return;
        }
        let prev = self.text[..self.cursor].chars().last().map(|c| c.len_utf8()).unwrap_or(1);
        let start = self.cursor - prev;
        self.text.drain(start..self.cursor);
        self.cursor = start;
    }

    /// Delete the char at the cursor without moving it.
    pub fn delete_forward(&mut self) {
        if self.cursor >= self.text.len() {
            return;
        }
        if let Some(next) = self.text[self.cursor..].chars().next() {
            self.text.drain(self.cursor..self.cursor + next.len_utf8());
        }
    }

    /// Replace the whole buffer, moving the cursor to the end.
    pub fn set_text<S: Into<String>>(&mut self, text: S) {
        self.text = text.into();
        self.cursor = self.text.len();
    }

    // ----- Annotations -----

    /// Recompute the decoration set from the current text.
    ///
    /// Called after every edit. The previous set is discarded entirely, so a
    /// reference whose variable appeared since the last pass flips to
    /// resolved without any bookkeeping.
    pub fn refresh_annotations(&mut self, variables: &dyn VariableReader, sources: &dyn SourceCatalog) {
        self.decorations = scan_references(&self.text, variables, sources)
            .into_iter()
            .map(|reference| Decoration {
                start_char: reference.span_start,
                end_char: reference.span_end,
                resolved: reference.is_resolved(),
            })
            .collect();
    }

    /// Byte bounds of the line the cursor sits on, excluding its newline.
    fn line_bounds(&self) -> (usize, usize) {
        let start = self.text[..self.cursor].rfind('\n').map(|index| index + 1).unwrap_or(0);
        let end = self.text[self.cursor..]
            .find('\n')
            .map(|offset| self.cursor + offset)
            .unwrap_or(self.text.len());
        (start, end)
    }
}

fn byte_offset_for_column(line: &str, column: usize) -> usize {
    line.char_indices().nth(column).map(|(index, _)| index).unwrap_or(line.len())
}
