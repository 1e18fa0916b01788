//! Run lifecycle bookkeeping.

use std::collections::BTreeSet;

use conveyor_types::RunPhase;

/// Tracks one run's position through its pipeline.
///
/// Phases move `NotStarted -> Running -> Completed`. `Paused` sits orthogonal
/// to that track: it is entered only at a check-in and left only by an
/// explicit resume, which re-enters `Running` at the same block index.
/// Closing forces `Completed` immediately whatever the progress.
#[derive(Clone, Debug)]
pub struct RunState {
    phase: RunPhase,
    total_blocks: usize,
    current_block: usize,
    completed: BTreeSet<usize>,
    paused_at: Option<usize>,
}

impl RunState {
    pub fn new(total_blocks: usize) -> Self {
        Self {
            phase: RunPhase::NotStarted,
            total_blocks,
            current_block: 0,
            completed: BTreeSet::new(),
            paused_at: None,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn current_block(&self) -> usize {
        self.current_block
    }

    /// Indices of blocks that have completed, ascending.
    pub fn completed(&self) -> &BTreeSet<usize> {
        &self.completed
    }

    pub fn paused_at(&self) -> Option<usize> {
        self.paused_at
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Begin (or re-begin) the run, always from a clean slate.
    ///
    /// A run restarts from `NotStarted` or `Completed`; starting one that is
    /// already in flight is refused.
    pub fn start(&mut self) -> bool {
        if matches!(self.phase, RunPhase::Running | RunPhase::Paused) {
            return false;
        }
        self.completed.clear();
        self.current_block = 0;
        self.paused_at = None;
        self.phase = RunPhase::Running;
        true
    }

    pub fn begin_block(&mut self, index: usize) {
        self.current_block = index;
    }

    /// Record a block's completion. Returns true exactly once, on the call
    /// that records the final block and turns the phase `Completed`.
    pub fn complete_block(&mut self, index: usize) -> bool {
        self.completed.insert(index);
        if self.phase == RunPhase::Completed {
            return false;
        }
        if self.completed.len() == self.total_blocks {
            self.phase = RunPhase::Completed;
            return true;
        }
        false
    }

    /// Enter the paused sub-state at the current block.
    pub fn pause(&mut self) {
        if self.phase == RunPhase::Running {
            self.paused_at = Some(self.current_block);
            self.phase = RunPhase::Paused;
        }
    }

    /// Leave `Paused`, re-entering `Running` at the same index.
    pub fn resume(&mut self) {
        if self.phase == RunPhase::Paused {
            self.paused_at = None;
            self.phase = RunPhase::Running;
        }
    }

    /// Close semantics: force the terminal phase regardless of progress.
    /// Returns true when this call performed the transition.
    pub fn force_complete(&mut self) -> bool {
        if self.phase == RunPhase::Completed {
            return false;
        }
        self.phase = RunPhase::Completed;
        self.paused_at = None;
        true
    }
}
