//! The variable store: single source of truth for pipeline values.
//!
//! Holds the live in-memory projection of one agent's variables. Every
//! mutation applies synchronously here; persistence to the document store is
//! queued and drained by a background task, so callers must never assume a
//! write has reached disk when a mutation returns. Reads for template
//! resolution go through the narrow [`VariableReader`] view so resolvers and
//! editors can be tested against fakes.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use conveyor_types::{Row, Variable, VariableKind, VariableValue};
use conveyor_util::{Collection, DocumentStore, Session, fresh_id};

/// Errors surfaced by variable store operations.
///
/// These are precondition failures in the caller's hands; resolution misses
/// never surface here (an unknown name in a template is a display state, not
/// an error).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VarStoreError {
    #[error("a variable named '{0}' already exists in this scope")]
    DuplicateName(String),
    #[error("'{0}' is not a valid variable name")]
    InvalidName(String),
    #[error("no variable with id '{0}'")]
    UnknownId(String),
    #[error("variable '{0}' is not a table")]
    NotATable(String),
    #[error("variable '{0}' already holds a {1} value")]
    KindMismatch(String, &'static str),
    #[error("row {index} is out of bounds for table '{name}'")]
    RowOutOfBounds { name: String, index: usize },
}

/// Narrow read view consumed by template resolution and editors.
pub trait VariableReader {
    /// Look a variable up by resolution name.
    fn variable(&self, name: &str) -> Option<&Variable>;
}

/// A reader over no variables at all; every lookup misses.
pub struct NoVariables;

impl VariableReader for NoVariables {
    fn variable(&self, _name: &str) -> Option<&Variable> {
        None
    }
}

enum PersistOp {
    Put(Variable),
    Delete { variable_id: String },
}

/// Best-effort write-behind persistence for variable mutations.
///
/// Operations are queued in mutation order and applied by a spawned task.
/// Failures are logged and never propagate back into the store.
pub struct PersistenceHook {
    queue: UnboundedSender<PersistOp>,
}

impl PersistenceHook {
    /// Spawn the drain task writing to `docs` under `session`'s namespace.
    ///
    /// The returned join handle finishes once the owning store is dropped and
    /// the queue has been drained; tests await it to observe the final state.
    pub fn spawn(session: Session, docs: Arc<dyn DocumentStore>) -> (Self, JoinHandle<()>) {
        let (queue, mut receiver) = mpsc::unbounded_channel::<PersistOp>();
        let handle = tokio::spawn(async move {
            while let Some(op) = receiver.recv().await {
                let result = match &op {
                    PersistOp::Put(variable) => match serde_json::to_value(variable) {
                        Ok(document) => docs.set(&session.variable_key(&variable.id), document).await,
                        Err(error) => {
                            warn!(variable_id = %variable.id, %error, "could not serialize variable for persistence");
                            continue;
                        }
                    },
                    PersistOp::Delete { variable_id } => docs.delete(&session.variable_key(variable_id)).await,
                };
                if let Err(error) = result {
                    warn!(%error, "variable persistence failed");
                }
            }
        });
        (Self { queue }, handle)
    }

    fn enqueue(&self, op: PersistOp) {
        // A closed queue means the process is shutting down; the projection
        // stays authoritative either way.
        let _ = self.queue.send(op);
    }
}

/// Live variable projection for one agent scope.
pub struct VariableStore {
    owner_agent_id: String,
    variables: IndexMap<String, Variable>,
    persistence: Option<PersistenceHook>,
}

impl VariableStore {
    pub fn new(owner_agent_id: impl Into<String>) -> Self {
        Self {
            owner_agent_id: owner_agent_id.into(),
            variables: IndexMap::new(),
            persistence: None,
        }
    }

    /// Attach a write-behind persistence hook; subsequent mutations enqueue.
    pub fn attach_persistence(&mut self, hook: PersistenceHook) {
        self.persistence = Some(hook);
    }

    /// Hydrate a scope from the document store via the owner index.
    ///
    /// Documents that fail to deserialize are skipped with a warning rather
    /// than failing the whole load.
    pub async fn load_for_agent(
        session: &Session,
        docs: &dyn DocumentStore,
        agent_id: &str,
    ) -> Result<Self, conveyor_util::DocumentStoreError> {
        let documents = docs
            .query_by_owner(session.user_id(), Collection::Variables, agent_id)
            .await?;
        let mut store = Self::new(agent_id);
        for document in documents {
            match serde_json::from_value::<Variable>(document.value) {
                Ok(variable) => {
                    store.variables.insert(variable.name.clone(), variable);
                }
                Err(error) => warn!(%error, "skipping malformed variable document"),
            }
        }
        debug!(agent_id, count = store.variables.len(), "hydrated variable scope");
        Ok(store)
    }

    pub fn owner_agent_id(&self) -> &str {
        &self.owner_agent_id
    }

    /// Variables in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Create a variable in this scope. Names are unique per scope and must
    /// be identifiers (letters, digits, underscores, not starting with a
    /// digit) so they stay addressable from templates.
    pub fn create(
        &mut self,
        name: &str,
        kind: VariableKind,
        initial: Option<VariableValue>,
    ) -> Result<&Variable, VarStoreError> {
        if !is_valid_name(name) {
            return Err(VarStoreError::InvalidName(name.to_string()));
        }
        if self.variables.contains_key(name) {
            return Err(VarStoreError::DuplicateName(name.to_string()));
        }
        let value = match initial {
            Some(value) if value.kind() != kind => {
                return Err(VarStoreError::KindMismatch(name.to_string(), kind.label()));
            }
            Some(value) => value,
            None => VariableValue::empty(kind),
        };
        let variable = Variable {
            id: fresh_id("var"),
            name: name.to_string(),
            owner_agent_id: self.owner_agent_id.clone(),
            value,
        };
        self.persist_put(&variable);
        let entry = self.variables.entry(variable.name.clone()).or_insert(variable);
        Ok(entry)
    }

    /// Look a variable up by resolution name.
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Variable> {
        self.variables.values().find(|variable| variable.id == id)
    }

    /// Replace a variable's payload wholesale. The kind is fixed at creation;
    /// writing a table payload into a scalar variable is a precondition error.
    pub fn update(&mut self, id: &str, value: VariableValue) -> Result<(), VarStoreError> {
        let variable = self.by_id_mut(id)?;
        if variable.value.kind() != value.kind() {
            return Err(VarStoreError::KindMismatch(
                variable.name.clone(),
                variable.value.kind().label(),
            ));
        }
        variable.value = value;
        let snapshot = variable.clone();
        self.persist_put(&snapshot);
        Ok(())
    }

    /// Create-or-replace a scalar by name. This is the write path block
    /// execution uses for output variables: last write wins, and a missing
    /// variable materializes the moment its block commits.
    pub fn set_scalar(&mut self, name: &str, value: Value) -> Result<&Variable, VarStoreError> {
        if let Some(variable) = self.variables.get_mut(name) {
            match &mut variable.value {
                VariableValue::Scalar { value: slot } => {
                    *slot = value;
                    let snapshot = variable.clone();
                    self.persist_put(&snapshot);
                    return Ok(&self.variables[name]);
                }
                VariableValue::Table { .. } => {
                    return Err(VarStoreError::KindMismatch(name.to_string(), "table"));
                }
            }
        }
        self.create(name, VariableKind::Scalar, Some(VariableValue::Scalar { value }))
    }

    /// Delete a variable by id.
    pub fn delete(&mut self, id: &str) -> Result<Variable, VarStoreError> {
        let name = self.by_id(id)?.name.clone();
        let removed = self
            .variables
            .shift_remove(&name)
            .ok_or_else(|| VarStoreError::UnknownId(id.to_string()))?;
        self.persist_delete(&removed.id);
        Ok(removed)
    }

    /// Remove every variable in the scope, used when the owning agent is
    /// deleted (cascading).
    pub fn clear_owned(&mut self) {
        let ids: Vec<String> = self.variables.values().map(|variable| variable.id.clone()).collect();
        for id in &ids {
            self.persist_delete(id);
        }
        self.variables.clear();
    }

    /// Cells of `column` in row order, `Null` where a sparse row lacks it.
    pub fn get_column(&self, table_id: &str, column: &str) -> Result<Vec<Value>, VarStoreError> {
        let variable = self.by_id(table_id)?;
        let rows = variable
            .rows()
            .ok_or_else(|| VarStoreError::NotATable(variable.name.clone()))?;
        Ok(rows
            .iter()
            .map(|row| row.get(column).cloned().unwrap_or(Value::Null))
            .collect())
    }

    /// Append rows to `column` from one line of raw input.
    ///
    /// When the input contains a comma it is exploded: split on commas only,
    /// tokens trimmed, empties dropped, duplicates removed preserving first
    /// occurrence, and one fresh row appended per surviving token with only
    /// that column populated. Otherwise the raw input becomes a single new
    /// row. Returns the number of rows appended.
    pub fn update_column(&mut self, table_id: &str, column: &str, raw_input: &str) -> Result<usize, VarStoreError> {
        let name = self.by_id(table_id)?.name.clone();
        let variable = self.by_id_mut(table_id)?;
        let VariableValue::Table { columns, rows } = &mut variable.value else {
            return Err(VarStoreError::NotATable(name));
        };
        ensure_column(columns, column);

        let tokens = explode_tokens(raw_input);
        let appended = tokens.len();
        for token in tokens {
            let mut row = Row::new();
            row.insert(column.to_string(), Value::String(token));
            rows.push(row);
        }
        let snapshot = variable.clone();
        self.persist_put(&snapshot);
        Ok(appended)
    }

    /// Append a full row, declaring any columns it introduces.
    pub fn add_row(&mut self, table_id: &str, row: Row) -> Result<usize, VarStoreError> {
        let name = self.by_id(table_id)?.name.clone();
        let variable = self.by_id_mut(table_id)?;
        let VariableValue::Table { columns, rows } = &mut variable.value else {
            return Err(VarStoreError::NotATable(name));
        };
        for key in row.keys() {
            ensure_column(columns, key);
        }
        rows.push(row);
        let index = rows.len() - 1;
        let snapshot = variable.clone();
        self.persist_put(&snapshot);
        Ok(index)
    }

    /// Merge `cells` into the row at `index`, read-modify-write over the full
    /// row list.
    pub fn update_row(&mut self, table_id: &str, index: usize, cells: Row) -> Result<(), VarStoreError> {
        let name = self.by_id(table_id)?.name.clone();
        let variable = self.by_id_mut(table_id)?;
        let VariableValue::Table { columns, rows } = &mut variable.value else {
            return Err(VarStoreError::NotATable(name));
        };
        let Some(row) = rows.get_mut(index) else {
            return Err(VarStoreError::RowOutOfBounds { name, index });
        };
        for (key, value) in cells {
            ensure_column(columns, &key);
            row.insert(key, value);
        }
        let snapshot = variable.clone();
        self.persist_put(&snapshot);
        Ok(())
    }

    /// Write one cell, declaring the column when new.
    pub fn set_cell(&mut self, table_id: &str, index: usize, column: &str, value: Value) -> Result<(), VarStoreError> {
        let mut cells = Row::new();
        cells.insert(column.to_string(), value);
        self.update_row(table_id, index, cells)
    }

    pub fn delete_row(&mut self, table_id: &str, index: usize) -> Result<(), VarStoreError> {
        let name = self.by_id(table_id)?.name.clone();
        let variable = self.by_id_mut(table_id)?;
        let VariableValue::Table { rows, .. } = &mut variable.value else {
            return Err(VarStoreError::NotATable(name));
        };
        if index >= rows.len() {
            return Err(VarStoreError::RowOutOfBounds { name, index });
        }
        rows.remove(index);
        let snapshot = variable.clone();
        self.persist_put(&snapshot);
        Ok(())
    }

    /// Declare a column. Adding an existing column is a no-op, not an error.
    pub fn add_column(&mut self, table_id: &str, column: &str) -> Result<(), VarStoreError> {
        let name = self.by_id(table_id)?.name.clone();
        let variable = self.by_id_mut(table_id)?;
        let VariableValue::Table { columns, .. } = &mut variable.value else {
            return Err(VarStoreError::NotATable(name));
        };
        let added = ensure_column(columns, column);
        if added {
            let snapshot = variable.clone();
            self.persist_put(&snapshot);
        }
        Ok(())
    }

    fn by_id(&self, id: &str) -> Result<&Variable, VarStoreError> {
        self.get_by_id(id).ok_or_else(|| VarStoreError::UnknownId(id.to_string()))
    }

    fn by_id_mut(&mut self, id: &str) -> Result<&mut Variable, VarStoreError> {
        self.variables
            .values_mut()
            .find(|variable| variable.id == id)
            .ok_or_else(|| VarStoreError::UnknownId(id.to_string()))
    }

    fn persist_put(&self, variable: &Variable) {
        if let Some(hook) = &self.persistence {
            hook.enqueue(PersistOp::Put(variable.clone()));
        }
    }

    fn persist_delete(&self, variable_id: &str) {
        if let Some(hook) = &self.persistence {
            hook.enqueue(PersistOp::Delete {
                variable_id: variable_id.to_string(),
            });
        }
    }
}

impl VariableReader for VariableStore {
    fn variable(&self, name: &str) -> Option<&Variable> {
        self.get(name)
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Inserts `column` if absent; returns whether it was added.
fn ensure_column(columns: &mut Vec<String>, column: &str) -> bool {
    if columns.iter().any(|existing| existing == column) {
        return false;
    }
    columns.push(column.to_string());
    true
}

/// Comma explosion for bulk column input.
///
/// Comma is the only delimiter; input without one is appended verbatim as a
/// single row, even when it holds semicolons or other separators.
fn explode_tokens(raw_input: &str) -> Vec<String> {
    if !raw_input.contains(',') {
        return vec![raw_input.to_string()];
    }
    let mut seen: IndexSet<String> = IndexSet::new();
    for token in raw_input.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        seen.insert(token.to_string());
    }
    seen.into_iter().collect()
}
