//! Scalar-mode run orchestration: the lifecycle state machine and the async
//! driver that walks a pipeline through it.

pub mod driver;
pub mod state;

pub use driver::{RunSummary, drive_run};
pub use state::RunState;
