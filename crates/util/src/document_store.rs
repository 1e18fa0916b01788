//! Document persistence for agents and their variables.
//!
//! The engine treats persistence as an external collaborator: documents are
//! addressed by `(user id, collection, document id)` and the store only has
//! to support get, full overwrite, partial merge, delete, and a
//! query-by-owner scan. Two backends are provided: a JSON file store
//! mirroring the config-file ergonomics used elsewhere (tilde expansion,
//! env override, config directory fallback) and an in-memory store for
//! tests.

use chrono::serde::ts_seconds;
use chrono::{DateTime, Utc};
use dirs_next::{config_dir, home_dir};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// Environment variable controlling the document file location.
pub const DATA_PATH_ENV: &str = "CONVEYOR_DATA_PATH";

/// Default filename for the persisted document store.
pub const DATA_FILE_NAME: &str = "documents.json";

/// Document field naming the agent that owns a variable document.
pub const OWNER_FIELD: &str = "owner_agent_id";

/// Errors surfaced by document store operations.
#[derive(Debug, Error)]
pub enum DocumentStoreError {
    /// I/O failure while reading or writing the backing file.
    #[error("document I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure.
    #[error("document serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Partial update addressed a document that does not exist.
    #[error("no document at {0}")]
    Missing(String),
    /// Persistence was attempted without an authenticated user id.
    #[error("persistence requires an authenticated user id")]
    MissingUser,
}

/// Top-level document groupings.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Agents,
    Variables,
}

/// Uniquely identifies a stored document.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DocKey {
    /// Namespacing user id; must never be blank.
    pub user_id: String,
    /// Which collection the document lives in.
    pub collection: Collection,
    /// Document id inside the collection (agent id or variable id).
    pub doc_id: String,
}

impl DocKey {
    /// Build a key addressing an agent document.
    pub fn agent(user_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            collection: Collection::Agents,
            doc_id: agent_id.into(),
        }
    }

    /// Build a key addressing a variable document.
    pub fn variable(user_id: impl Into<String>, variable_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            collection: Collection::Variables,
            doc_id: variable_id.into(),
        }
    }

    fn display(&self) -> String {
        let collection = match self.collection {
            Collection::Agents => "agents",
            Collection::Variables => "variables",
        };
        format!("{}/{}/{}", self.user_id, collection, self.doc_id)
    }
}

/// A stored document with its last write time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoredDocument {
    /// Persisted JSON value.
    pub value: Value,
    /// Last time the document was written.
    #[serde(with = "ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Default, Serialize, Deserialize)]
struct DocumentFile {
    entries: Vec<DocumentEntry>,
}

#[derive(Serialize, Deserialize)]
struct DocumentEntry {
    key: DocKey,
    #[serde(flatten)]
    data: StoredDocument,
}

impl DocumentFile {
    fn get(&self, key: &DocKey) -> Option<StoredDocument> {
        self.entries
            .iter()
            .find(|entry| entry.key == *key)
            .map(|entry| entry.data.clone())
    }

    fn upsert(&mut self, key: DocKey, value: Value) {
        let data = StoredDocument {
            value,
            updated_at: Utc::now(),
        };
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.key == key) {
            entry.data = data;
        } else {
            self.entries.push(DocumentEntry { key, data });
        }
    }

    fn merge(&mut self, key: &DocKey, patch: Map<String, Value>) -> Result<(), DocumentStoreError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.key == *key)
            .ok_or_else(|| DocumentStoreError::Missing(key.display()))?;

        if !entry.data.value.is_object() {
            entry.data.value = Value::Object(Map::new());
        }
        if let Value::Object(existing) = &mut entry.data.value {
            for (field, value) in patch {
                existing.insert(field, value);
            }
        }
        entry.data.updated_at = Utc::now();
        Ok(())
    }

    fn remove(&mut self, key: &DocKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.key != *key);
        self.entries.len() != before
    }

    fn for_owner(&self, user_id: &str, collection: Collection, owner_id: &str) -> Vec<StoredDocument> {
        self.entries
            .iter()
            .filter(|entry| entry.key.user_id == user_id && entry.key.collection == collection)
            .filter(|entry| {
                entry
                    .data
                    .value
                    .get(OWNER_FIELD)
                    .and_then(Value::as_str)
                    .is_some_and(|owner| owner == owner_id)
            })
            .map(|entry| entry.data.clone())
            .collect()
    }
}

/// Shared trait implemented by document persistence backends.
///
/// No transactional guarantees across documents; each call is independent
/// and last-write-wins.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Retrieve the document at `key`, if present.
    async fn get(&self, key: &DocKey) -> Result<Option<StoredDocument>, DocumentStoreError>;

    /// Write the document at `key`, replacing any prior value wholesale.
    async fn set(&self, key: &DocKey, value: Value) -> Result<(), DocumentStoreError>;

    /// Merge `patch` into the top level of the existing document at `key`.
    async fn update(&self, key: &DocKey, patch: Map<String, Value>) -> Result<(), DocumentStoreError>;

    /// Remove the document at `key`. Removing an absent document is a no-op.
    async fn delete(&self, key: &DocKey) -> Result<(), DocumentStoreError>;

    /// List documents in `collection` whose owner field names `owner_id`,
    /// restricted to the given user's namespace.
    async fn query_by_owner(
        &self,
        user_id: &str,
        collection: Collection,
        owner_id: &str,
    ) -> Result<Vec<StoredDocument>, DocumentStoreError>;
}

fn require_user(user_id: &str) -> Result<(), DocumentStoreError> {
    if user_id.trim().is_empty() {
        return Err(DocumentStoreError::MissingUser);
    }
    Ok(())
}

/// JSON-backed document store persisted on disk.
pub struct JsonDocumentStore {
    path: PathBuf,
    entries: Mutex<DocumentFile>,
}

impl JsonDocumentStore {
    /// Create a store at the provided path (or the default path when omitted).
    pub fn new<P: Into<Option<PathBuf>>>(path: P) -> Result<Self, DocumentStoreError> {
        let resolved_path = match path.into() {
            Some(path) => expand_tilde_path(path),
            None => default_data_path(),
        };

        let file = load_document_file(&resolved_path)?;
        Ok(Self {
            path: resolved_path,
            entries: Mutex::new(file),
        })
    }

    /// Initialize a store using the default location rules.
    pub fn with_defaults() -> Result<Self, DocumentStoreError> {
        Self::new(None::<PathBuf>)
    }

    /// Access the underlying file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_locked(&self, file: &DocumentFile) -> Result<(), DocumentStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(file)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentStore for JsonDocumentStore {
    async fn get(&self, key: &DocKey) -> Result<Option<StoredDocument>, DocumentStoreError> {
        require_user(&key.user_id)?;
        let entries = self.entries.lock().expect("document lock poisoned");
        Ok(entries.get(key))
    }

    async fn set(&self, key: &DocKey, value: Value) -> Result<(), DocumentStoreError> {
        require_user(&key.user_id)?;
        let mut entries = self.entries.lock().expect("document lock poisoned");
        entries.upsert(key.clone(), value);
        self.save_locked(&entries)
    }

    async fn update(&self, key: &DocKey, patch: Map<String, Value>) -> Result<(), DocumentStoreError> {
        require_user(&key.user_id)?;
        let mut entries = self.entries.lock().expect("document lock poisoned");
        entries.merge(key, patch)?;
        self.save_locked(&entries)
    }

    async fn delete(&self, key: &DocKey) -> Result<(), DocumentStoreError> {
        require_user(&key.user_id)?;
        let mut entries = self.entries.lock().expect("document lock poisoned");
        if entries.remove(key) {
            self.save_locked(&entries)?;
        }
        Ok(())
    }

    async fn query_by_owner(
        &self,
        user_id: &str,
        collection: Collection,
        owner_id: &str,
    ) -> Result<Vec<StoredDocument>, DocumentStoreError> {
        require_user(user_id)?;
        let entries = self.entries.lock().expect("document lock poisoned");
        Ok(entries.for_owner(user_id, collection, owner_id))
    }
}

/// In-memory document store primarily used for unit testing.
#[derive(Default)]
pub struct MemoryDocumentStore {
    entries: Mutex<DocumentFile>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, key: &DocKey) -> Result<Option<StoredDocument>, DocumentStoreError> {
        require_user(&key.user_id)?;
        let entries = self.entries.lock().expect("document lock poisoned");
        Ok(entries.get(key))
    }

    async fn set(&self, key: &DocKey, value: Value) -> Result<(), DocumentStoreError> {
        require_user(&key.user_id)?;
        let mut entries = self.entries.lock().expect("document lock poisoned");
        entries.upsert(key.clone(), value);
        Ok(())
    }

    async fn update(&self, key: &DocKey, patch: Map<String, Value>) -> Result<(), DocumentStoreError> {
        require_user(&key.user_id)?;
        let mut entries = self.entries.lock().expect("document lock poisoned");
        entries.merge(key, patch)
    }

    async fn delete(&self, key: &DocKey) -> Result<(), DocumentStoreError> {
        require_user(&key.user_id)?;
        let mut entries = self.entries.lock().expect("document lock poisoned");
        entries.remove(key);
        Ok(())
    }

    async fn query_by_owner(
        &self,
        user_id: &str,
        collection: Collection,
        owner_id: &str,
    ) -> Result<Vec<StoredDocument>, DocumentStoreError> {
        require_user(user_id)?;
        let entries = self.entries.lock().expect("document lock poisoned");
        Ok(entries.for_owner(user_id, collection, owner_id))
    }
}

fn expand_tilde_path(path: PathBuf) -> PathBuf {
    if let Some(first) = path.components().next()
        && first.as_os_str() != "~"
    {
        return path;
    }

    let input = path.to_string_lossy();
    let trimmed = input.trim();

    if trimmed == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }

    if let Some(rest) = trimmed.strip_prefix("~/").or_else(|| trimmed.strip_prefix("~\\")) {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }

    PathBuf::from(trimmed)
}

fn default_data_path() -> PathBuf {
    if let Ok(path) = env::var(DATA_PATH_ENV)
        && !path.trim().is_empty()
    {
        return expand_tilde_path(PathBuf::from(path));
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("conveyor")
        .join(DATA_FILE_NAME)
}

fn load_document_file(path: &Path) -> Result<DocumentFile, DocumentStoreError> {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<DocumentFile>(&content) {
            Ok(file) => Ok(file),
            Err(error) => {
                warn!("Failed to parse document file at {}: {}", path.display(), error);
                Ok(DocumentFile::default())
            }
        },
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(DocumentFile::default()),
        Err(error) => Err(DocumentStoreError::Io(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn variable_doc(id: &str, owner: &str) -> Value {
        json!({
            "id": id,
            "name": format!("var_{id}"),
            OWNER_FIELD: owner,
            "kind": "scalar",
            "value": "x",
        })
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryDocumentStore::new();
        let key = DocKey::variable("user-1", "var-1");
        assert!(store.get(&key).await.unwrap().is_none());

        store.set(&key, variable_doc("var-1", "agent-1")).await.unwrap();
        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.value["id"], "var-1");
    }

    #[tokio::test]
    async fn json_store_persists_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("documents.json");
        let store = JsonDocumentStore::new(Some(path.clone())).unwrap();

        let key = DocKey::agent("user-1", "agent-1");
        store.set(&key, json!({"id": "agent-1", "name": "Demo"})).await.unwrap();

        drop(store);
        let reloaded = JsonDocumentStore::new(Some(path)).unwrap();
        let stored = reloaded.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.value["name"], "Demo");
    }

    #[tokio::test]
    async fn update_merges_into_existing_document() {
        let store = MemoryDocumentStore::new();
        let key = DocKey::agent("user-1", "agent-1");
        store
            .set(&key, json!({"id": "agent-1", "name": "Demo", "blocks": []}))
            .await
            .unwrap();

        let mut patch = Map::new();
        patch.insert("name".into(), json!("Renamed"));
        store.update(&key, patch).await.unwrap();

        let stored = store.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.value["name"], "Renamed");
        assert_eq!(stored.value["id"], "agent-1", "unpatched fields survive");
    }

    #[tokio::test]
    async fn update_missing_document_errors() {
        let store = MemoryDocumentStore::new();
        let key = DocKey::agent("user-1", "ghost");
        let result = store.update(&key, Map::new()).await;
        assert!(matches!(result, Err(DocumentStoreError::Missing(_))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("documents.json");
        let store = JsonDocumentStore::new(Some(path)).unwrap();

        let key = DocKey::variable("user-1", "var-1");
        store.set(&key, variable_doc("var-1", "agent-1")).await.unwrap();
        store.delete(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        store.delete(&key).await.unwrap();
    }

    #[tokio::test]
    async fn query_by_owner_filters_collection_and_user() {
        let store = MemoryDocumentStore::new();
        store
            .set(&DocKey::variable("user-1", "var-1"), variable_doc("var-1", "agent-1"))
            .await
            .unwrap();
        store
            .set(&DocKey::variable("user-1", "var-2"), variable_doc("var-2", "agent-2"))
            .await
            .unwrap();
        store
            .set(&DocKey::variable("user-2", "var-3"), variable_doc("var-3", "agent-1"))
            .await
            .unwrap();

        let owned = store
            .query_by_owner("user-1", Collection::Variables, "agent-1")
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].value["id"], "var-1");
    }

    #[tokio::test]
    async fn blank_user_id_is_a_precondition_failure() {
        let store = MemoryDocumentStore::new();
        let key = DocKey::variable("  ", "var-1");
        let result = store.set(&key, variable_doc("var-1", "agent-1")).await;
        assert!(matches!(result, Err(DocumentStoreError::MissingUser)));

        let result = store.query_by_owner("", Collection::Variables, "agent-1").await;
        assert!(matches!(result, Err(DocumentStoreError::MissingUser)));
    }

    #[test]
    fn default_path_honors_env_override() {
        let override_path = "~/custom/documents.json";
        temp_env::with_var(DATA_PATH_ENV, Some(override_path), || {
            let path = default_data_path();
            let expected = expand_tilde_path(PathBuf::from(override_path));
            assert_eq!(path, expected);
        });
    }

    #[test]
    fn invalid_json_yields_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("documents.json");
        fs::write(&path, "not json").unwrap();

        let store = JsonDocumentStore::new(Some(path)).unwrap();
        let entries = store.entries.lock().unwrap();
        assert!(entries.entries.is_empty());
    }
}
