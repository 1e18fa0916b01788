//! Block preparation: template substitution and action payload assembly.
//!
//! Preparation happens as late as possible, immediately before a block is
//! invoked, so references to variables written by earlier blocks in the same
//! run resolve against their committed values.

use std::time::Duration;

use serde_json::{Map, Value};

use conveyor_api::ActionEndpoint;
use conveyor_types::{Block, BlockKind};

use crate::resolve::substitute;
use crate::vars::VariableReader;

/// Wait allowance granted per page when a fetch block does not supply one.
const FETCH_SECS_PER_PAGE: u64 = 30;

/// A block with every template reference substituted, ready to invoke.
#[derive(Clone, Debug)]
pub struct PreparedBlock {
    pub block_id: String,
    pub block_number: u32,
    /// Short lowercase type label, for logs and events.
    pub label: &'static str,
    /// Variable the result is written into, when the block is wired.
    pub output_variable: Option<String>,
    /// `None` for check-in blocks, which never invoke an action.
    pub endpoint: Option<ActionEndpoint>,
    /// Type-specific payload fields, substituted.
    pub fields: Map<String, Value>,
    /// Wait allowance passed through to the action call.
    pub wait: Option<Duration>,
}

/// Substitute `block`'s configuration against the current variable snapshot
/// and assemble its action payload.
pub fn prepare_block(block: &Block, variables: &dyn VariableReader) -> PreparedBlock {
    let mut fields = Map::new();
    let mut endpoint = None;
    let mut wait = None;

    match &block.kind {
        BlockKind::Model { prompt, system_prompt } => {
            endpoint = Some(ActionEndpoint::Model);
            fields.insert("prompt".into(), substituted(prompt, variables));
            if let Some(text) = system_prompt {
                fields.insert("system_prompt".into(), substituted(text, variables));
            }
        }
        BlockKind::WebFetch {
            url,
            prompt,
            page_limit,
            wait_secs,
        } => {
            endpoint = Some(ActionEndpoint::WebFetch);
            fields.insert("url".into(), substituted(url, variables));
            if let Some(text) = prompt {
                fields.insert("prompt".into(), substituted(text, variables));
            }
            if let Some(limit) = page_limit {
                fields.insert("page_limit".into(), Value::from(*limit));
            }
            wait = fetch_wait(*page_limit, *wait_secs);
        }
        BlockKind::Code { language, source, input } => {
            endpoint = Some(ActionEndpoint::Code);
            if let Some(language) = language {
                fields.insert("language".into(), Value::String(language.clone()));
            }
            fields.insert("source".into(), substituted(source, variables));
            if let Some(text) = input {
                fields.insert("input".into(), substituted(text, variables));
            }
        }
        BlockKind::Message { to, subject, body } => {
            endpoint = Some(ActionEndpoint::Message);
            fields.insert("to".into(), substituted(to, variables));
            if let Some(text) = subject {
                fields.insert("subject".into(), substituted(text, variables));
            }
            fields.insert("body".into(), substituted(body, variables));
        }
        BlockKind::CheckIn { .. } => {}
        BlockKind::Search { query, engine } => {
            endpoint = Some(ActionEndpoint::Search);
            fields.insert("query".into(), substituted(query, variables));
            if let Some(engine) = engine {
                fields.insert("engine".into(), Value::String(engine.clone()));
            }
        }
        BlockKind::DocDiff { original, revised } => {
            endpoint = Some(ActionEndpoint::DocDiff);
            fields.insert("original".into(), substituted(original, variables));
            fields.insert("revised".into(), substituted(revised, variables));
        }
        BlockKind::Chart {
            instructions,
            chart_kind,
        } => {
            endpoint = Some(ActionEndpoint::Chart);
            fields.insert("instructions".into(), substituted(instructions, variables));
            if let Some(kind) = chart_kind {
                fields.insert("chart_kind".into(), Value::String(kind.clone()));
            }
        }
        BlockKind::Webhook { url, payload } => {
            endpoint = Some(ActionEndpoint::Webhook);
            fields.insert("url".into(), substituted(url, variables));
            if let Some(payload) = payload {
                fields.insert("payload".into(), substitute_value(payload, variables));
            }
        }
    }

    PreparedBlock {
        block_id: block.id.clone(),
        block_number: block.block_number,
        label: block.kind.label(),
        output_variable: block.output_variable.clone(),
        endpoint,
        fields,
        wait,
    }
}

/// Field a batch pass injects each row's input into.
pub fn batch_input_field(kind: &BlockKind) -> Option<&'static str> {
    match kind {
        BlockKind::Model { .. } => Some("prompt"),
        BlockKind::WebFetch { .. } => Some("url"),
        BlockKind::Code { .. } => Some("input"),
        BlockKind::Message { .. } => Some("to"),
        BlockKind::Search { .. } => Some("query"),
        BlockKind::DocDiff { .. } => Some("original"),
        BlockKind::Chart { .. } => Some("instructions"),
        BlockKind::Webhook { .. } => Some("payload"),
        BlockKind::CheckIn { .. } => None,
    }
}

fn substituted(text: &str, variables: &dyn VariableReader) -> Value {
    Value::String(substitute(text, variables))
}

/// Walk an arbitrary JSON payload, substituting references in string leaves.
fn substitute_value(value: &Value, variables: &dyn VariableReader) -> Value {
    match value {
        Value::String(text) => Value::String(substitute(text, variables)),
        Value::Array(items) => Value::Array(items.iter().map(|item| substitute_value(item, variables)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(name, item)| (name.clone(), substitute_value(item, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Caller-supplied wait wins; otherwise scale with the page limit.
fn fetch_wait(page_limit: Option<u32>, wait_secs: Option<u64>) -> Option<Duration> {
    if let Some(secs) = wait_secs {
        return Some(Duration::from_secs(secs));
    }
    page_limit.map(|pages| Duration::from_secs(u64::from(pages.max(1)) * FETCH_SECS_PER_PAGE))
}
