//! # Conveyor Engine
//!
//! The Conveyor Engine loads, validates, and executes agent pipelines: ordered
//! sequences of typed blocks wired together through named variables. It owns
//! the variable store, template resolution, and the run lifecycle; rendering
//! and transport live in the neighboring crates.
//!
//! ## Key Features
//!
//! - **Agent Loading**: Parses agent pipeline files (YAML or JSON) and
//!   persists agents through the document store
//! - **Variable Store**: Scalar and table variables with synchronous reads
//!   and write-behind persistence
//! - **Template Resolution**: `{{variable}}` / `{{table.column}}` references
//!   and `@nickname` source mentions, scanned with character-accurate spans
//! - **Run Driving**: Sequential block execution with pause-on-check-in,
//!   per-row batch execution, and committed outputs between blocks
//!
//! ## Usage
//!
//! ```rust
//! use conveyor_engine::parse_agent_file;
//!
//! // Create a temporary pipeline file for testing
//! let temp_dir = tempfile::tempdir()?;
//! let pipeline_path = temp_dir.path().join("pipeline.yaml");
//! std::fs::write(&pipeline_path, r#"
//! name: "daily-brief"
//! blocks: []
//! "#)?;
//!
//! let agent = parse_agent_file(&pipeline_path)?;
//! assert_eq!(agent.name, "daily-brief");
//! assert!(agent.blocks.is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! The engine is organized into several key modules:
//!
//! - **`vars`**: Variable store with explode-on-comma column updates
//! - **`resolve`**: Reference scanning and template substitution
//! - **`sources`**: Registry of attached pages and files for `@` mentions
//! - **`executor`**: Block preparation, action dispatch, and batch runs
//! - **`run`**: Run state machine and the async run driver
//! - **`agents`**: Pipeline file parsing and agent persistence

pub mod agents;
pub mod executor;
pub mod resolve;
pub mod run;
pub mod sources;
pub mod vars;

// Re-export commonly used types for convenience
pub use agents::{AgentStoreError, delete_agent, load_agent, parse_agent_file, rename_agent, save_agent};
pub use executor::{
    ActionRunner, BatchError, BatchOutcome, HttpActionRunner, NoopActionRunner, PreparedBlock, execute_prepared,
    prepare_block, run_block_over_rows,
};
pub use resolve::{Reference, ReferenceKind, scan_references, substitute};
pub use run::{RunState, RunSummary, drive_run};
pub use sources::{SourceCatalog, SourceEntry, SourceError, SourceLocation, SourceRegistry};
pub use vars::{NoVariables, PersistenceHook, VarStoreError, VariableReader, VariableStore};
