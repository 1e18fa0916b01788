//! Drives one scalar-mode run block by block.
//!
//! Blocks execute strictly sequentially: block n+1 never starts before block
//! n's output write has committed, because n+1's templates may reference it.
//! The driver suspends only at the external action boundary, applies control
//! messages between units of work, and reports progress over an event
//! channel. A close received while an action is in flight wins: the eventual
//! result is discarded, never written.

use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use conveyor_types::{
    Agent, Block, BlockKind, BlockSequenceError, BlockStatus, RunControl, RunEvent, RunOutcome,
    RunPhase, validate_block_sequence,
};

use crate::executor::{ActionRunner, execute_prepared, prepare_block};
use crate::resolve::substitute;
use crate::run::state::RunState;
use crate::vars::VariableStore;

/// Marker prefix written into a failed block's output variable.
const BLOCK_ERROR_PREFIX: &str = "Error";

/// Final report returned by [`drive_run`].
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub completed_blocks: usize,
    pub error: Option<String>,
}

/// Walk `agent`'s pipeline to completion, pause, failure, or close.
///
/// Control messages are applied between blocks and after each action
/// returns; events mirror every state change. The only error returned is a
/// malformed block sequence, which is a configuration fault checked before
/// anything runs.
pub async fn drive_run(
    agent: &Agent,
    store: &mut VariableStore,
    runner: &dyn ActionRunner,
    control_rx: &mut UnboundedReceiver<RunControl>,
    event_tx: &UnboundedSender<RunEvent>,
) -> Result<RunSummary, BlockSequenceError> {
    validate_block_sequence(&agent.blocks)?;

    let mut state = RunState::new(agent.blocks.len());
    state.start();
    let _ = event_tx.send(RunEvent::RunStarted {
        at: Utc::now(),
        total_blocks: agent.blocks.len(),
    });
    let _ = event_tx.send(RunEvent::PhaseChanged {
        phase: RunPhase::Running,
    });
    debug!(agent_id = %agent.id, blocks = agent.blocks.len(), "run started");

    for (index, block) in agent.blocks.iter().enumerate() {
        if drain_control(control_rx) {
            return Ok(close_run(&mut state, event_tx));
        }
        state.begin_block(index);

        if let BlockKind::CheckIn { note } = &block.kind {
            let note = note.as_deref().map(|text| substitute(text, store));
            let _ = event_tx.send(RunEvent::CheckInReached { index, note });
            state.pause();
            let _ = event_tx.send(RunEvent::PhaseChanged {
                phase: RunPhase::Paused,
            });
            debug!(index, "run paused at check-in");

            let waited = Instant::now();
            if !wait_for_resume(control_rx).await {
                return Ok(close_run(&mut state, event_tx));
            }
            state.resume();
            let _ = event_tx.send(RunEvent::PhaseChanged {
                phase: RunPhase::Running,
            });
            state.complete_block(index);
            let _ = event_tx.send(RunEvent::BlockFinished {
                index,
                block_id: block.id.clone(),
                status: BlockStatus::Succeeded,
                output: None,
                duration_ms: waited.elapsed().as_millis() as u64,
            });
            continue;
        }

        let _ = event_tx.send(RunEvent::BlockStarted {
            index,
            block_id: block.id.clone(),
            label: block.kind.label().to_string(),
            at: Utc::now(),
        });
        let started = Instant::now();
        let prepared = prepare_block(block, store);
        let action_result = execute_prepared(&prepared, runner).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // A close issued while the action was outstanding discards the
        // result; nothing of it reaches the store.
        if drain_control(control_rx) {
            debug!(index, "close received mid-block, discarding result");
            return Ok(close_run(&mut state, event_tx));
        }

        let routed = match action_result {
            Ok(display) => route_output(store, block, display),
            Err(error) => Err(error.to_string()),
        };

        match routed {
            Ok(display) => {
                state.complete_block(index);
                let _ = event_tx.send(RunEvent::BlockFinished {
                    index,
                    block_id: block.id.clone(),
                    status: BlockStatus::Succeeded,
                    output: Some(display),
                    duration_ms,
                });
            }
            Err(message) => {
                warn!(index, error = %message, "block failed, stopping run");
                let marker = format!("{BLOCK_ERROR_PREFIX}: {message}");
                if let Some(name) = &block.output_variable
                    && let Err(store_error) = store.set_scalar(name, Value::String(marker.clone()))
                {
                    warn!(%store_error, "could not record the block's error marker");
                }
                let _ = event_tx.send(RunEvent::BlockFinished {
                    index,
                    block_id: block.id.clone(),
                    status: BlockStatus::Failed,
                    output: Some(marker),
                    duration_ms,
                });
                state.force_complete();
                let _ = event_tx.send(RunEvent::RunCompleted {
                    outcome: RunOutcome::Failed,
                    finished_at: Utc::now(),
                    error: Some(message.clone()),
                });
                return Ok(RunSummary {
                    outcome: RunOutcome::Failed,
                    completed_blocks: state.completed().len(),
                    error: Some(message),
                });
            }
        }
    }

    // An empty pipeline never records a block, so flip the phase here.
    if !state.is_terminal() {
        state.force_complete();
    }
    let _ = event_tx.send(RunEvent::RunCompleted {
        outcome: RunOutcome::Succeeded,
        finished_at: Utc::now(),
        error: None,
    });
    debug!(agent_id = %agent.id, completed = state.completed().len(), "run completed");
    Ok(RunSummary {
        outcome: RunOutcome::Succeeded,
        completed_blocks: state.completed().len(),
        error: None,
    })
}

/// Commit a block's display result into its output variable, if wired.
fn route_output(store: &mut VariableStore, block: &Block, display: String) -> Result<String, String> {
    if let Some(name) = &block.output_variable {
        store
            .set_scalar(name, Value::String(display.clone()))
            .map_err(|error| error.to_string())?;
    }
    Ok(display)
}

/// Apply queued control messages; returns true when a close arrived.
/// Resumes with nothing paused are dropped.
fn drain_control(control_rx: &mut UnboundedReceiver<RunControl>) -> bool {
    let mut closed = false;
    while let Ok(control) = control_rx.try_recv() {
        if matches!(control, RunControl::Close) {
            closed = true;
        }
    }
    closed
}

/// Wait for the explicit signal leaving a check-in pause. Returns false when
/// the run should close instead, including when every control sender is gone.
async fn wait_for_resume(control_rx: &mut UnboundedReceiver<RunControl>) -> bool {
    match control_rx.recv().await {
        Some(RunControl::Resume) => true,
        Some(RunControl::Close) | None => false,
    }
}

fn close_run(state: &mut RunState, event_tx: &UnboundedSender<RunEvent>) -> RunSummary {
    state.force_complete();
    let _ = event_tx.send(RunEvent::RunCompleted {
        outcome: RunOutcome::Closed,
        finished_at: Utc::now(),
        error: None,
    });
    debug!(completed = state.completed().len(), "run closed");
    RunSummary {
        outcome: RunOutcome::Closed,
        completed_blocks: state.completed().len(),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_api::{ActionEndpoint, ActionError};
    use serde_json::{Map, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::sync::mpsc;

    struct EchoRunner;

    #[async_trait]
    impl ActionRunner for EchoRunner {
        async fn invoke(
            &self,
            _endpoint: ActionEndpoint,
            fields: Map<String, Value>,
            _wait: Option<Duration>,
        ) -> Result<Value, ActionError> {
            let prompt = fields.get("prompt").and_then(Value::as_str).unwrap_or_default();
            Ok(json!({ "text": format!("echo:{prompt}") }))
        }
    }

    struct FailRunner;

    #[async_trait]
    impl ActionRunner for FailRunner {
        async fn invoke(
            &self,
            endpoint: ActionEndpoint,
            _fields: Map<String, Value>,
            _wait: Option<Duration>,
        ) -> Result<Value, ActionError> {
            Err(ActionError::Status {
                endpoint,
                status: 500,
                detail: "boom".into(),
            })
        }
    }

    /// Holds every invocation until released, so tests can interleave
    /// control messages with an in-flight action.
    struct GatedRunner {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ActionRunner for GatedRunner {
        async fn invoke(
            &self,
            _endpoint: ActionEndpoint,
            _fields: Map<String, Value>,
            _wait: Option<Duration>,
        ) -> Result<Value, ActionError> {
            self.release.notified().await;
            Ok(json!({ "text": "late result" }))
        }
    }

    fn model_block(number: u32, prompt: &str, output: Option<&str>) -> Block {
        Block {
            id: format!("blk-{number}"),
            block_number: number,
            output_variable: output.map(str::to_string),
            kind: BlockKind::Model {
                prompt: prompt.into(),
                system_prompt: None,
            },
        }
    }

    fn check_in_block(number: u32, note: Option<&str>) -> Block {
        Block {
            id: format!("blk-{number}"),
            block_number: number,
            output_variable: None,
            kind: BlockKind::CheckIn {
                note: note.map(str::to_string),
            },
        }
    }

    fn agent_with(blocks: Vec<Block>) -> Agent {
        let mut agent = Agent::new("agent-1", "pipeline");
        agent.blocks = blocks;
        agent
    }

    async fn drive_to_end(
        agent: Agent,
        runner: impl ActionRunner + 'static,
    ) -> (RunSummary, VariableStore, Vec<RunEvent>) {
        let (_control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut store = VariableStore::new(agent.id.clone());
        let summary = drive_run(&agent, &mut store, &runner, &mut control_rx, &event_tx)
            .await
            .expect("drive");
        drop(event_tx);
        let mut events = Vec::new();
        while let Some(event) = event_rx.recv().await {
            events.push(event);
        }
        (summary, store, events)
    }

    fn started_indices(events: &[RunEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|event| match event {
                RunEvent::BlockStarted { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn blocks_execute_in_ascending_order_and_complete_once() {
        let agent = agent_with(vec![
            model_block(1, "first", Some("a")),
            model_block(2, "second", Some("b")),
            model_block(3, "third", Some("c")),
        ]);
        let (summary, store, events) = drive_to_end(agent, EchoRunner).await;

        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert_eq!(summary.completed_blocks, 3);
        assert_eq!(started_indices(&events), vec![0, 1, 2]);
        let completions = events
            .iter()
            .filter(|event| matches!(event, RunEvent::RunCompleted { .. }))
            .count();
        assert_eq!(completions, 1, "terminal event fires exactly once");
        assert_eq!(store.get("c").unwrap().scalar_value(), Some(&json!("echo:third")));
    }

    #[tokio::test]
    async fn later_blocks_see_earlier_outputs() {
        let agent = agent_with(vec![
            model_block(1, "draft the headline", Some("headline")),
            model_block(2, "expand on {{headline}}", Some("article")),
        ]);
        let (summary, store, _) = drive_to_end(agent, EchoRunner).await;

        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert_eq!(
            store.get("article").unwrap().scalar_value(),
            Some(&json!("echo:expand on echo:draft the headline")),
            "block 2's template resolved against block 1's committed output"
        );
    }

    #[tokio::test]
    async fn forward_references_substitute_as_empty() {
        let agent = agent_with(vec![
            model_block(1, "using {{later}}", Some("early")),
            model_block(2, "done", Some("later")),
        ]);
        let (_, store, _) = drive_to_end(agent, EchoRunner).await;
        assert_eq!(
            store.get("early").unwrap().scalar_value(),
            Some(&json!("echo:using ")),
            "a variable from a later block does not exist yet"
        );
    }

    #[tokio::test]
    async fn check_in_pauses_until_explicit_resume() {
        let agent = agent_with(vec![
            model_block(1, "before", Some("a")),
            check_in_block(2, Some("confirm {{a}}")),
            model_block(3, "after", Some("b")),
        ]);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut store = VariableStore::new("agent-1");
            let summary = drive_run(&agent, &mut store, &EchoRunner, &mut control_rx, &event_tx)
                .await
                .expect("drive");
            (summary, store)
        });

        let mut note_seen = None;
        while let Some(event) = event_rx.recv().await {
            if let RunEvent::CheckInReached { note, .. } = event {
                note_seen = note;
                break;
            }
        }
        assert_eq!(note_seen.as_deref(), Some("confirm echo:before"));
        let paused = event_rx.recv().await.expect("phase event");
        assert_eq!(
            paused,
            RunEvent::PhaseChanged {
                phase: RunPhase::Paused
            }
        );

        let quiet = tokio::time::timeout(Duration::from_millis(200), event_rx.recv()).await;
        assert!(quiet.is_err(), "nothing advances until an explicit resume");

        control_tx.send(RunControl::Resume).expect("send resume");
        let (summary, store) = handle.await.expect("driver task");
        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert_eq!(summary.completed_blocks, 3);
        assert_eq!(store.get("b").unwrap().scalar_value(), Some(&json!("echo:after")));
    }

    #[tokio::test]
    async fn close_while_paused_forces_completion() {
        let agent = agent_with(vec![check_in_block(1, None), model_block(2, "never", Some("x"))]);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut store = VariableStore::new("agent-1");
            let summary = drive_run(&agent, &mut store, &EchoRunner, &mut control_rx, &event_tx)
                .await
                .expect("drive");
            (summary, store)
        });

        while let Some(event) = event_rx.recv().await {
            if matches!(
                event,
                RunEvent::PhaseChanged {
                    phase: RunPhase::Paused
                }
            ) {
                break;
            }
        }
        control_tx.send(RunControl::Close).expect("send close");

        let (summary, store) = handle.await.expect("driver task");
        assert_eq!(summary.outcome, RunOutcome::Closed);
        assert!(store.get("x").is_none(), "the block after the pause never ran");
    }

    #[tokio::test]
    async fn close_discards_an_in_flight_result() {
        let agent = agent_with(vec![model_block(1, "slow", Some("out"))]);
        let release = Arc::new(Notify::new());
        let runner = GatedRunner {
            release: release.clone(),
        };
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut store = VariableStore::new("agent-1");
            let summary = drive_run(&agent, &mut store, &runner, &mut control_rx, &event_tx)
                .await
                .expect("drive");
            (summary, store)
        });

        while let Some(event) = event_rx.recv().await {
            if matches!(event, RunEvent::BlockStarted { .. }) {
                break;
            }
        }
        control_tx.send(RunControl::Close).expect("send close");
        release.notify_one();

        let (summary, store) = handle.await.expect("driver task");
        assert_eq!(summary.outcome, RunOutcome::Closed);
        assert!(
            store.get("out").is_none(),
            "the late result was discarded, not written"
        );
    }

    #[tokio::test]
    async fn block_failure_stops_the_run_and_records_a_marker() {
        let agent = agent_with(vec![
            model_block(1, "will fail", Some("verdict")),
            model_block(2, "never runs", Some("after")),
        ]);
        let (summary, store, events) = drive_to_end(agent, FailRunner).await;

        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert_eq!(summary.completed_blocks, 0);
        assert!(summary.error.is_some());
        assert_eq!(started_indices(&events), vec![0], "the second block never started");
        let verdict = store.get("verdict").unwrap().scalar_value().unwrap().clone();
        assert!(
            verdict.as_str().unwrap().starts_with("Error: "),
            "failed block leaves a visible marker: {verdict:?}"
        );
    }

    #[tokio::test]
    async fn empty_pipeline_completes_immediately() {
        let agent = agent_with(Vec::new());
        let (summary, _, events) = drive_to_end(agent, EchoRunner).await;
        assert_eq!(summary.outcome, RunOutcome::Succeeded);
        assert_eq!(summary.completed_blocks, 0);
        assert!(
            events
                .iter()
                .any(|event| matches!(event, RunEvent::RunCompleted { .. }))
        );
    }

    #[tokio::test]
    async fn malformed_sequences_never_start() {
        let agent = agent_with(vec![model_block(2, "x", None)]);
        let (_control_tx, mut control_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut store = VariableStore::new("agent-1");

        let result = drive_run(&agent, &mut store, &EchoRunner, &mut control_rx, &event_tx).await;
        assert_eq!(result, Err(BlockSequenceError::WrongStart { first: 2 }));
        drop(event_tx);
        assert!(event_rx.recv().await.is_none(), "no events before validation passes");
    }
}
