//! Shared data model for the conveyor pipeline engine.
//!
//! Pure data: agents, their typed blocks, the variables blocks read and
//! write, and the run lifecycle vocabulary. No I/O lives here; stores,
//! resolvers, and drivers build on these types from the engine crate.

pub mod agent;
pub mod block;
pub mod run;
pub mod variable;

pub use agent::Agent;
pub use block::{Block, BlockKind, BlockSequenceError, validate_block_sequence};
pub use run::{BlockStatus, RunControl, RunEvent, RunOutcome, RunPhase};
pub use variable::{Row, Variable, VariableKind, VariableValue};
