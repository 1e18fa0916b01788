//! Run lifecycle types shared between the engine driver and its consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle of a run.
///
/// `Paused` is entered only through a check-in block and left only by an
/// explicit resume; there is no cancelled phase. Closing a run forces
/// `Completed` immediately regardless of progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    NotStarted,
    Running,
    Paused,
    Completed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed)
    }

    pub fn label(self) -> &'static str {
        match self {
            RunPhase::NotStarted => "not started",
            RunPhase::Running => "running",
            RunPhase::Paused => "paused",
            RunPhase::Completed => "completed",
        }
    }
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every block completed.
    Succeeded,
    /// A block failed and the run stopped there.
    Failed,
    /// The run was closed before finishing; progress is whatever committed.
    Closed,
}

/// Result of one block's execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Succeeded,
    Failed,
}

/// Commands a consumer can send into a live run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunControl {
    /// Continue past a check-in pause, re-entering the same block index.
    Resume,
    /// Force the run to complete immediately. Results from actions still in
    /// flight are discarded.
    Close,
}

/// Progress notifications emitted by the run driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        at: DateTime<Utc>,
        total_blocks: usize,
    },
    PhaseChanged {
        phase: RunPhase,
    },
    BlockStarted {
        index: usize,
        block_id: String,
        label: String,
        at: DateTime<Utc>,
    },
    BlockFinished {
        index: usize,
        block_id: String,
        status: BlockStatus,
        /// Display string written to the output variable, or the error text
        /// for failed blocks.
        output: Option<String>,
        duration_ms: u64,
    },
    CheckInReached {
        index: usize,
        note: Option<String>,
    },
    RunCompleted {
        outcome: RunOutcome,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    },
}
