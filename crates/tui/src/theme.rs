//! Theme and styling for the Conveyor composer.
//!
//! This module defines the color scheme and styling functions used by the
//! prompt composer. The palette is a dark theme with a teal accent; reference
//! decorations use exactly two states, resolved and unresolved.

use ratatui::style::{Color, Modifier, Style};

/// Teal accent color for highlights and focus indicators.
pub const ACCENT: Color = Color::Rgb(64, 196, 180);

/// Primary foreground color for normal text.
pub const FG: Color = Color::Rgb(224, 224, 230);

/// Muted foreground color for hints, labels, and secondary information.
pub const FG_MUTED: Color = Color::Rgb(168, 168, 175);

/// Default border color for unfocused UI elements.
pub const BORDER: Color = Color::Rgb(72, 72, 80);

/// Background color for panels and containers.
pub const BG_PANEL: Color = Color::Rgb(18, 18, 24);

/// Color for references that resolve against the current stores.
///
/// A green tint so a prompt full of live references reads as healthy at a
/// glance.
pub const REFERENCE_OK: Color = Color::Rgb(120, 200, 120);

/// Color for references that do not resolve.
///
/// A red-orange shared with error states; an unresolved reference is the
/// most common authoring mistake the composer exists to surface.
pub const REFERENCE_MISSING: Color = Color::Rgb(220, 96, 110);

/// Creates a border style based on focus state.
///
/// # Arguments
///
/// * `focused` - Whether the element should appear focused
///
/// # Returns
///
/// A Style with the accent color when focused, the default border color
/// otherwise.
pub fn border_style(focused: bool) -> Style {
    if focused {
        Style::default().fg(ACCENT)
    } else {
        Style::default().fg(BORDER)
    }
}

/// Creates a style for titles and headers.
pub fn title_style() -> Style {
    Style::default().fg(FG_MUTED).add_modifier(Modifier::BOLD)
}

/// Creates a style for normal text content.
pub fn text_style() -> Style {
    Style::default().fg(FG)
}

/// Creates a style for muted or secondary text.
pub fn text_muted() -> Style {
    Style::default().fg(FG_MUTED)
}

/// Creates the style for a reference decoration.
///
/// Decorations have exactly two visual states. Resolved references render
/// in green; unresolved ones render in the warning color with an underline
/// so they stay visible on terminals with approximate color support.
///
/// # Arguments
///
/// * `resolved` - Whether the reference resolves against the current stores
pub fn reference_style(resolved: bool) -> Style {
    if resolved {
        Style::default().fg(REFERENCE_OK)
    } else {
        Style::default().fg(REFERENCE_MISSING).add_modifier(Modifier::UNDERLINED)
    }
}
