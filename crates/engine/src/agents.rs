//! Agent loading and persistence.
//!
//! Agents arrive from two places: authored pipeline files (YAML, with JSON
//! accepted since YAML is a superset) and the document store. Deleting an
//! agent cascades to the variables it owns; nothing else references them.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use conveyor_types::{Agent, Block, BlockSequenceError};
use conveyor_util::{Collection, DocumentStore, DocumentStoreError, Session, fresh_id};

/// Errors from agent persistence operations.
#[derive(Debug, Error)]
pub enum AgentStoreError {
    #[error("no agent with id '{0}'")]
    Missing(String),
    #[error(transparent)]
    Sequence(#[from] BlockSequenceError),
    #[error(transparent)]
    Documents(#[from] DocumentStoreError),
    #[error("agent document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Parse an agent pipeline file.
///
/// Accepts a full agent document or the authored shorthand of a `name` plus
/// a `blocks` list, in which case an id is generated. The block sequence is
/// validated at load, never lazily at run time.
pub fn parse_agent_file(file_path: impl AsRef<Path>) -> Result<Agent> {
    let file_path = file_path.as_ref();
    let file_content =
        fs::read(file_path).with_context(|| format!("failed to read agent file: {}", file_path.display()))?;
    let content_string = String::from_utf8_lossy(&file_content);

    // Try the full document first so a stored agent round-trips unchanged.
    if let Ok(agent) = serde_yaml::from_str::<Agent>(&content_string) {
        agent
            .validate()
            .with_context(|| format!("invalid block sequence in {}", file_path.display()))?;
        return Ok(agent);
    }

    #[derive(Deserialize)]
    struct AgentDocument {
        name: String,
        #[serde(default)]
        blocks: Vec<Block>,
    }

    if let Ok(document) = serde_yaml::from_str::<AgentDocument>(&content_string) {
        let mut agent = Agent::new(fresh_id("agent"), document.name);
        agent.blocks = document.blocks;
        agent
            .validate()
            .with_context(|| format!("invalid block sequence in {}", file_path.display()))?;
        return Ok(agent);
    }

    bail!(
        "unsupported agent document format in {}; expected a 'name' plus a 'blocks' list (YAML or JSON)",
        file_path.display()
    )
}

/// Write `agent` to the document store, replacing any prior version.
pub async fn save_agent(session: &Session, docs: &dyn DocumentStore, agent: &Agent) -> Result<(), AgentStoreError> {
    agent.validate()?;
    let document = serde_json::to_value(agent)?;
    docs.set(&session.agent_key(&agent.id), document).await?;
    debug!(agent_id = %agent.id, blocks = agent.blocks.len(), "agent saved");
    Ok(())
}

/// Fetch an agent by id. A missing agent is a precondition failure, not an
/// empty result; callers that can proceed without one use the store directly.
pub async fn load_agent(session: &Session, docs: &dyn DocumentStore, agent_id: &str) -> Result<Agent, AgentStoreError> {
    let stored = docs
        .get(&session.agent_key(agent_id))
        .await?
        .ok_or_else(|| AgentStoreError::Missing(agent_id.to_string()))?;
    Ok(serde_json::from_value(stored.value)?)
}

/// Rename an agent in place via a partial merge, leaving its blocks alone.
pub async fn rename_agent(
    session: &Session,
    docs: &dyn DocumentStore,
    agent_id: &str,
    new_name: &str,
) -> Result<(), AgentStoreError> {
    let mut patch = Map::new();
    patch.insert("name".into(), Value::String(new_name.to_string()));
    match docs.update(&session.agent_key(agent_id), patch).await {
        Ok(()) => Ok(()),
        Err(DocumentStoreError::Missing(_)) => Err(AgentStoreError::Missing(agent_id.to_string())),
        Err(error) => Err(error.into()),
    }
}

/// Delete an agent and every variable it owns. Returns how many variable
/// documents went with it.
pub async fn delete_agent(session: &Session, docs: &dyn DocumentStore, agent_id: &str) -> Result<usize, AgentStoreError> {
    docs.delete(&session.agent_key(agent_id)).await?;

    let owned = docs
        .query_by_owner(session.user_id(), Collection::Variables, agent_id)
        .await?;
    let mut removed = 0usize;
    for document in owned {
        if let Some(variable_id) = document.value.get("id").and_then(Value::as_str) {
            docs.delete(&session.variable_key(variable_id)).await?;
            removed += 1;
        }
    }
    debug!(agent_id, variables_removed = removed, "agent deleted");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_types::{BlockKind, VariableKind};
    use conveyor_util::MemoryDocumentStore;
    use serde_json::json;

    fn sample_agent() -> Agent {
        let mut agent = Agent::new("agent-1", "research pipeline");
        agent.blocks = vec![Block {
            id: "blk-1".into(),
            block_number: 1,
            output_variable: Some("summary".into()),
            kind: BlockKind::Model {
                prompt: "summarize {{notes}}".into(),
                system_prompt: None,
            },
        }];
        agent
    }

    #[test]
    fn parse_accepts_authored_shorthand() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipeline.yaml");
        fs::write(
            &path,
            r#"
name: research pipeline
blocks:
  - id: blk-1
    block_number: 1
    type: model
    prompt: "summarize {{notes}}"
  - id: blk-2
    block_number: 2
    type: check_in
"#,
        )
        .expect("write file");

        let agent = parse_agent_file(&path).expect("parse");
        assert_eq!(agent.name, "research pipeline");
        assert_eq!(agent.blocks.len(), 2);
        assert!(agent.id.starts_with("agent-"), "shorthand files get generated ids");
    }

    #[test]
    fn parse_round_trips_full_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agent.yaml");
        let agent = sample_agent();
        fs::write(&path, serde_yaml::to_string(&agent).expect("serialize")).expect("write file");

        let loaded = parse_agent_file(&path).expect("parse");
        assert_eq!(loaded.id, "agent-1");
        assert_eq!(loaded.blocks, agent.blocks);
    }

    #[test]
    fn parse_rejects_broken_sequences() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.yaml");
        fs::write(
            &path,
            r#"
name: bad
blocks:
  - id: blk-1
    block_number: 2
    type: check_in
"#,
        )
        .expect("write file");

        let error = parse_agent_file(&path).expect_err("should fail");
        assert!(
            error.to_string().contains("invalid block sequence"),
            "unexpected error: {error:#}"
        );
    }

    #[test]
    fn parse_rejects_unrecognized_shapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("noise.yaml");
        fs::write(&path, "just: [a, list]").expect("write file");

        let error = parse_agent_file(&path).expect_err("should fail");
        assert!(error.to_string().contains("unsupported agent document format"));
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let docs = MemoryDocumentStore::new();
        let session = Session::new("user-1").expect("session");
        let agent = sample_agent();

        save_agent(&session, &docs, &agent).await.expect("save");
        let loaded = load_agent(&session, &docs, "agent-1").await.expect("load");
        assert_eq!(loaded.name, "research pipeline");
        assert_eq!(loaded.blocks, agent.blocks);
    }

    #[tokio::test]
    async fn save_refuses_invalid_sequences() {
        let docs = MemoryDocumentStore::new();
        let session = Session::new("user-1").expect("session");
        let mut agent = sample_agent();
        agent.blocks[0].block_number = 3;

        let result = save_agent(&session, &docs, &agent).await;
        assert!(matches!(result, Err(AgentStoreError::Sequence(_))));
    }

    #[tokio::test]
    async fn loading_a_missing_agent_is_a_hard_failure() {
        let docs = MemoryDocumentStore::new();
        let session = Session::new("user-1").expect("session");
        let result = load_agent(&session, &docs, "ghost").await;
        assert!(matches!(result, Err(AgentStoreError::Missing(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn rename_merges_without_touching_blocks() {
        let docs = MemoryDocumentStore::new();
        let session = Session::new("user-1").expect("session");
        save_agent(&session, &docs, &sample_agent()).await.expect("save");

        rename_agent(&session, &docs, "agent-1", "renamed").await.expect("rename");
        let loaded = load_agent(&session, &docs, "agent-1").await.expect("load");
        assert_eq!(loaded.name, "renamed");
        assert_eq!(loaded.blocks.len(), 1, "blocks survive the merge");

        let missing = rename_agent(&session, &docs, "ghost", "x").await;
        assert!(matches!(missing, Err(AgentStoreError::Missing(_))));
    }

    #[tokio::test]
    async fn delete_cascades_to_owned_variables() {
        let docs = MemoryDocumentStore::new();
        let session = Session::new("user-1").expect("session");
        save_agent(&session, &docs, &sample_agent()).await.expect("save");

        // Two variables owned by agent-1, one by someone else.
        let mut store = crate::vars::VariableStore::new("agent-1");
        store.create("notes", VariableKind::Scalar, None).expect("create");
        store.create("summary", VariableKind::Scalar, None).expect("create");
        for variable in store.iter() {
            docs.set(
                &session.variable_key(&variable.id),
                serde_json::to_value(variable).expect("serialize"),
            )
            .await
            .expect("seed");
        }
        docs.set(
            &session.variable_key("var-other"),
            json!({"id": "var-other", "name": "keep", "owner_agent_id": "agent-2", "kind": "scalar", "value": null}),
        )
        .await
        .expect("seed other");

        let removed = delete_agent(&session, &docs, "agent-1").await.expect("delete");
        assert_eq!(removed, 2);
        assert!(load_agent(&session, &docs, "agent-1").await.is_err());
        let kept = docs.get(&session.variable_key("var-other")).await.expect("get");
        assert!(kept.is_some(), "other agents' variables are untouched");
    }
}
