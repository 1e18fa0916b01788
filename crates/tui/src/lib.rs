//! # Conveyor Composer
//!
//! Terminal interface for authoring block prompts. The composer renders a
//! prompt with its references decorated in place: green for references that
//! resolve against the current variable and source stores, red for ones that
//! do not. Decorations are recomputed from scratch after every edit.
//!
//! ## Architecture
//!
//! - **`editor`**: UTF-8 safe buffer, cursor management, and annotation state
//! - **`highlight`**: turns text plus decorations into styled lines
//! - **`compose`**: terminal lifecycle and the blocking input loop
//! - **`theme`**: palette and the two reference decoration styles

pub mod compose;
pub mod editor;
pub mod highlight;
pub mod theme;

pub use compose::{EditorAction, apply_key, compose_prompt};
pub use editor::{Decoration, PromptEditorState};
pub use highlight::highlight_prompt_lines;
