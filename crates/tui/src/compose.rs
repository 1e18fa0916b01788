//! Interactive prompt composer.
//!
//! Responsibilities
//! - Own the terminal lifecycle (enter/leave alternate screen, raw mode).
//! - Drive a blocking poll loop that routes keys to the editor state.
//! - Recompute annotations after every edit and render the decorated text.
//!
//! The composer edits a single prompt and returns it; persistence and block
//! wiring stay with the caller.

use std::io::Stdout;
use std::time::Duration;

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, prelude::*, widgets::{Block, Borders, Paragraph}};
use unicode_width::UnicodeWidthStr;

use conveyor_engine::sources::SourceCatalog;
use conveyor_engine::vars::VariableReader;

use crate::editor::PromptEditorState;
use crate::highlight::highlight_prompt_lines;
use crate::theme;

/// What a key press did to the compose session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditorAction {
    /// The editor consumed the key (or ignored it); keep going.
    Continue,
    /// The text changed; annotations need a recompute.
    Edited,
    /// Accept the current text and leave.
    Save,
    /// Discard the edit and leave.
    Cancel,
}

/// Edit `initial` in a full-screen composer.
///
/// Returns `Some(text)` on save and `None` on cancel. Annotations are
/// recomputed against `variables` and `sources` after every edit.
pub fn compose_prompt(
    initial: &str,
    variables: &dyn VariableReader,
    sources: &dyn SourceCatalog,
    title: &str,
) -> Result<Option<String>> {
    let mut terminal = setup_terminal()?;
    let outcome = run_compose_loop(&mut terminal, initial, variables, sources, title);
    // A restore failure must not discard a composed prompt.
    if let Err(error) = cleanup_terminal(&mut terminal) {
        tracing::warn!("Failed to restore terminal: {}", error);
    }
    outcome
}

/// Put the terminal into raw mode and enter the alternate screen.
fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

/// Restore terminal settings and leave the alternate screen.
fn cleanup_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn run_compose_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    initial: &str,
    variables: &dyn VariableReader,
    sources: &dyn SourceCatalog,
    title: &str,
) -> Result<Option<String>> {
    let mut editor = PromptEditorState::with_text(initial);
    editor.refresh_annotations(variables, sources);

    let mut dirty = true;
    loop {
        if dirty {
            render(terminal, &editor, title)?;
            dirty = false;
        }
        if !event::poll(Duration::from_millis(125))? {
            continue;
        }
        let Event::Key(key_event) = event::read()? else {
            dirty = true;
            continue;
        };
        match apply_key(&mut editor, key_event) {
            EditorAction::Continue => dirty = true,
            EditorAction::Edited => {
                editor.refresh_annotations(variables, sources);
                dirty = true;
            }
            EditorAction::Save => return Ok(Some(editor.text().to_string())),
            EditorAction::Cancel => return Ok(None),
        }
    }
}

/// Route one key press to the editor.
pub fn apply_key(editor: &mut PromptEditorState, key_event: KeyEvent) -> EditorAction {
    if key_event.kind != KeyEventKind::Press {
        return EditorAction::Continue;
    }
    let control = key_event.modifiers.contains(KeyModifiers::CONTROL);
    match key_event.code {
        KeyCode::Char('c') if control => EditorAction::Cancel,
        KeyCode::Char('s') if control => EditorAction::Save,
        KeyCode::Esc => EditorAction::Cancel,
        KeyCode::Char(c) if !control => {
            editor.insert_char(c);
            EditorAction::Edited
        }
        KeyCode::Enter => {
            editor.insert_newline();
            EditorAction::Edited
        }
        KeyCode::Backspace => {
            editor.backspace();
            EditorAction::Edited
        }
        KeyCode::Delete => {
            editor.delete_forward();
            EditorAction::Edited
        }
        KeyCode::Left => {
            editor.move_left();
            EditorAction::Continue
        }
        KeyCode::Right => {
            editor.move_right();
            EditorAction::Continue
        }
        KeyCode::Up => {
            editor.move_up();
            EditorAction::Continue
        }
        KeyCode::Down => {
            editor.move_down();
            EditorAction::Continue
        }
        KeyCode::Home => {
            editor.move_line_start();
            EditorAction::Continue
        }
        KeyCode::End => {
            editor.move_line_end();
            EditorAction::Continue
        }
        _ => EditorAction::Continue,
    }
}

fn render(terminal: &mut Terminal<CrosstermBackend<Stdout>>, editor: &PromptEditorState, title: &str) -> Result<()> {
    terminal.draw(|frame| {
        let [editor_area, status_area] =
            Layout::vertical([Constraint::Min(1), Constraint::Length(1)]).areas(frame.area());

        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(theme::border_style(true))
            .title(Span::styled(format!(" {title} "), theme::title_style()));
        let inner = block.inner(editor_area);

        let lines = highlight_prompt_lines(editor.text(), editor.decorations());
        frame.render_widget(Paragraph::new(lines).block(block).style(theme::text_style()), editor_area);
        frame.render_widget(Paragraph::new(status_line(editor)), status_area);

        let (row, _) = editor.cursor_row_col();
        let column_width = cursor_column_width(editor);
        let x = inner.x.saturating_add(column_width as u16).min(inner.right().saturating_sub(1));
        let y = inner.y.saturating_add(row as u16).min(inner.bottom().saturating_sub(1));
        frame.set_cursor_position((x, y));
    })?;
    Ok(())
}

/// Display width of the cursor's line up to the cursor.
fn cursor_column_width(editor: &PromptEditorState) -> usize {
    let (row, column) = editor.cursor_row_col();
    let Some(line) = editor.text().split('\n').nth(row) else {
        return 0;
    };
    let prefix_end = line
        .char_indices()
        .nth(column)
        .map(|(index, _)| index)
        .unwrap_or(line.len());
    line[..prefix_end].width()
}

fn status_line(editor: &PromptEditorState) -> Line<'static> {
    let resolved = editor.resolved_count();
    let unresolved = editor.unresolved_count();
    let unresolved_style = if unresolved == 0 {
        theme::text_muted()
    } else {
        Style::default().fg(theme::REFERENCE_MISSING)
    };
    Line::from(vec![
        Span::styled(format!(" {resolved} resolved"), Style::default().fg(theme::REFERENCE_OK)),
        Span::styled(format!("  {unresolved} unresolved"), unresolved_style),
        Span::styled("  Ctrl+S save  Esc cancel", theme::text_muted()),
    ])
}
