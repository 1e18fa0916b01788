//! Styled-line construction for the prompt composer.

use ratatui::text::{Line, Span};

use crate::editor::Decoration;
use crate::theme;

/// Builds styled lines from prompt text and its decoration set.
///
/// Decorations are assumed sorted by start and non-overlapping, which the
/// reference scanner guarantees. A decoration may cross a line break (the
/// reference syntax tolerates interior whitespace), in which case each line
/// styles only its own overlap.
pub fn highlight_prompt_lines<'text>(text: &'text str, decorations: &[Decoration]) -> Vec<Line<'text>> {
    let mut lines = Vec::new();
    let mut char_cursor = 0usize;
    for raw_line in text.split('\n') {
        let line_start = char_cursor;
        let line_end = line_start + raw_line.chars().count();
        lines.push(Line::from(line_spans(raw_line, line_start, line_end, decorations)));
        char_cursor = line_end + 1; // the newline itself
    }
    lines
}

fn line_spans<'line>(line: &'line str, line_start: usize, line_end: usize, decorations: &[Decoration]) -> Vec<Span<'line>> {
    let mut spans = Vec::new();
    let mut segment_start = line_start;
    for decoration in decorations {
        if decoration.end_char <= line_start || decoration.start_char >= line_end {
            continue;
        }
        let overlap_start = decoration.start_char.max(line_start);
        let overlap_end = decoration.end_char.min(line_end);
        if overlap_start > segment_start {
            spans.push(Span::styled(
                slice_chars(line, segment_start - line_start, overlap_start - line_start),
                theme::text_style(),
            ));
        }
        spans.push(Span::styled(
            slice_chars(line, overlap_start - line_start, overlap_end - line_start),
            theme::reference_style(decoration.resolved),
        ));
        segment_start = overlap_end;
    }
    if segment_start < line_end {
        spans.push(Span::styled(
            slice_chars(line, segment_start - line_start, line_end - line_start),
            theme::text_style(),
        ));
    }
    spans
}

fn slice_chars(line: &str, start_char: usize, end_char: usize) -> &str {
    &line[byte_at_char(line, start_char)..byte_at_char(line, end_char)]
}

fn byte_at_char(line: &str, char_offset: usize) -> usize {
    line.char_indices().nth(char_offset).map(|(index, _)| index).unwrap_or(line.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoration(start_char: usize, end_char: usize, resolved: bool) -> Decoration {
        Decoration {
            start_char,
            end_char,
            resolved,
        }
    }

    #[test]
    fn splits_a_line_around_decorations() {
        let text = "see {{analysis}} now";
        let lines = highlight_prompt_lines(text, &[decoration(4, 16, true)]);
        assert_eq!(lines.len(), 1);

        let spans = &lines[0].spans;
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].content, "see ");
        assert_eq!(spans[1].content, "{{analysis}}");
        assert_eq!(spans[1].style, theme::reference_style(true));
        assert_eq!(spans[2].content, " now");
    }

    #[test]
    fn resolved_and_unresolved_get_distinct_styles() {
        let text = "{{a}} {{b}}";
        let lines = highlight_prompt_lines(text, &[decoration(0, 5, true), decoration(6, 11, false)]);
        let spans = &lines[0].spans;
        assert_eq!(spans[0].style, theme::reference_style(true));
        assert_eq!(spans[2].style, theme::reference_style(false));
        assert_ne!(spans[0].style, spans[2].style);
    }

    #[test]
    fn multibyte_text_slices_on_char_offsets() {
        let text = "héllo {{x}}";
        let lines = highlight_prompt_lines(text, &[decoration(6, 11, false)]);
        let spans = &lines[0].spans;
        assert_eq!(spans[0].content, "héllo ");
        assert_eq!(spans[1].content, "{{x}}");
    }

    #[test]
    fn decorations_crossing_a_line_break_style_each_side() {
        let text = "{{ \nx }} done";
        // One reference spanning chars 0..8 across the break at char 3.
        let lines = highlight_prompt_lines(text, &[decoration(0, 8, false)]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].spans[0].content, "{{ ");
        assert_eq!(lines[0].spans[0].style, theme::reference_style(false));
        assert_eq!(lines[1].spans[0].content, "x }}");
        assert_eq!(lines[1].spans[1].content, " done");
    }

    #[test]
    fn empty_text_yields_a_single_empty_line() {
        let lines = highlight_prompt_lines("", &[]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].spans.is_empty());
    }
}
