//! Block execution: prepares a block's configuration against the variable
//! store, invokes its external action, and routes the result back into
//! variables.
//!
//! - `prepare` substitutes template references into the type-specific fields
//! - `runner::ActionRunner` abstracts how an action is invoked
//! - `runner::HttpActionRunner` POSTs to the actions service
//! - `batch` applies a single block once per row of a driving table
//!
//! Sequencing across blocks lives in [`crate::run`]; this module only knows
//! how to execute one unit of work.

pub mod batch;
pub mod prepare;
pub mod runner;

pub use batch::{BatchError, BatchOutcome, run_block_over_rows};
pub use prepare::{PreparedBlock, prepare_block};
pub use runner::{ActionRunner, HttpActionRunner, NoopActionRunner, execute_prepared};
