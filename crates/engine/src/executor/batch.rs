//! Batch mode: apply one block once per row of a driving table.
//!
//! Rows execute strictly in order with no inter-row concurrency. A failing
//! row gets a textual error marker in its output cell and the pass continues;
//! only store-level precondition failures abort the whole batch.

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use conveyor_types::{Block, BlockKind, Row};

use super::prepare::{PreparedBlock, batch_input_field, prepare_block};
use super::runner::{ActionRunner, execute_prepared};
use crate::resolve::display_value;
use crate::vars::{VarStoreError, VariableStore};

/// Column results land in when the block names no output variable.
const DEFAULT_OUTPUT_COLUMN: &str = "output";
/// Marker prefix written into a row's output cell when its action fails.
const ROW_ERROR_PREFIX: &str = "Error";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("{0} blocks cannot run over table rows")]
    UnsupportedBlock(&'static str),
    #[error(transparent)]
    Store(#[from] VarStoreError),
}

/// What a batch pass did.
#[derive(Debug, PartialEq, Eq)]
pub struct BatchOutcome {
    pub rows_processed: usize,
    pub failures: usize,
    pub output_column: String,
}

/// Run `block` once per row of the table identified by `table_id`.
///
/// Each row's input comes from `input_column` when given, otherwise from a
/// type-specific heuristic over that row's cells. The result (or error
/// marker) is written into the block's output column before the next row
/// starts.
pub async fn run_block_over_rows(
    store: &mut VariableStore,
    table_id: &str,
    block: &Block,
    input_column: Option<&str>,
    runner: &dyn ActionRunner,
) -> Result<BatchOutcome, BatchError> {
    if block.kind.pauses_run() {
        return Err(BatchError::UnsupportedBlock(block.kind.label()));
    }
    let output_column = block
        .output_variable
        .clone()
        .unwrap_or_else(|| DEFAULT_OUTPUT_COLUMN.to_string());
    store.add_column(table_id, &output_column)?;
    let row_count = store.get_column(table_id, &output_column)?.len();
    debug!(table_id, rows = row_count, output_column, "batch pass started");

    let mut failures = 0usize;
    for index in 0..row_count {
        let input = row_input(store, table_id, index, input_column, &block.kind, &output_column)?;
        let mut prepared = prepare_block(block, store);
        inject_input(&mut prepared, &block.kind, &input);

        match execute_prepared(&prepared, runner).await {
            Ok(display) => {
                store.set_cell(table_id, index, &output_column, Value::String(display))?;
            }
            Err(error) => {
                warn!(row = index, %error, "batch row failed, continuing");
                failures += 1;
                let marker = format!("{ROW_ERROR_PREFIX}: {error}");
                store.set_cell(table_id, index, &output_column, Value::String(marker))?;
            }
        }
    }

    debug!(table_id, rows = row_count, failures, "batch pass finished");
    Ok(BatchOutcome {
        rows_processed: row_count,
        failures,
        output_column,
    })
}

/// The value driving one row, rendered as text for field injection.
fn row_input(
    store: &VariableStore,
    table_id: &str,
    index: usize,
    input_column: Option<&str>,
    kind: &BlockKind,
    output_column: &str,
) -> Result<String, BatchError> {
    let variable = store
        .get_by_id(table_id)
        .ok_or_else(|| VarStoreError::UnknownId(table_id.to_string()))?;
    let rows = variable
        .rows()
        .ok_or_else(|| VarStoreError::NotATable(variable.name.clone()))?;
    let Some(row) = rows.get(index) else {
        return Err(VarStoreError::RowOutOfBounds {
            name: variable.name.clone(),
            index,
        }
        .into());
    };

    if let Some(column) = input_column {
        return Ok(row.get(column).map(display_value).unwrap_or_default());
    }
    Ok(heuristic_input(row, kind, output_column))
}

/// Without an explicit selection, fetch blocks take the first cell that
/// parses as an absolute url; every other type takes the first non-empty
/// cell. The output column never feeds back in.
fn heuristic_input(row: &Row, kind: &BlockKind, output_column: &str) -> String {
    if matches!(kind, BlockKind::WebFetch { .. }) {
        for (name, cell) in row {
            if name == output_column {
                continue;
            }
            if let Value::String(text) = cell
                && Url::parse(text).is_ok()
            {
                return text.clone();
            }
        }
    }
    for (name, cell) in row {
        if name == output_column {
            continue;
        }
        let text = display_value(cell);
        if !text.trim().is_empty() {
            return text;
        }
    }
    String::new()
}

fn inject_input(prepared: &mut PreparedBlock, kind: &BlockKind, input: &str) {
    if let Some(field) = batch_input_field(kind) {
        prepared.fields.insert(field.to_string(), Value::String(input.to_string()));
    }
}
