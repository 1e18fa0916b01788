//! Typed pipeline steps and their ordering rules.
//!
//! A block is one unit of work in an agent's pipeline. The `type` tag on the
//! serialized form selects the variant; every string configuration field may
//! contain `{{variable}}` or `@source` template references that are
//! substituted just before the block's action is invoked.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Type-specific configuration for a block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    /// A language-model call: prompt in, generated text out.
    Model {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
    },
    /// Fetch a page (or short crawl) and summarize it: url in, summary out.
    WebFetch {
        url: String,
        /// Optional instruction applied to the fetched content.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        /// Upper bound on pages followed from the starting url.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_limit: Option<u32>,
        /// Caller-supplied wait allowance for slow fetch sequences, in
        /// seconds. When absent the allowance is scaled from `page_limit`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_secs: Option<u64>,
    },
    /// Run a snippet of code: source plus optional input in, result out.
    Code {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<String>,
    },
    /// Send a message to a person: recipient and body in, receipt out.
    Message {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        body: String,
    },
    /// Pause the run until a human explicitly resumes it. No external action.
    CheckIn {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Web search: query in, result digest out.
    Search {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engine: Option<String>,
    },
    /// Compare two documents: both texts in, diff summary out.
    DocDiff { original: String, revised: String },
    /// Render a chart from instructions or data: chart reference out.
    Chart {
        instructions: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chart_kind: Option<String>,
    },
    /// Deliver a payload to an arbitrary endpoint: response body out.
    Webhook {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

impl BlockKind {
    /// Short lowercase label used in logs and event streams.
    pub fn label(&self) -> &'static str {
        match self {
            BlockKind::Model { .. } => "model",
            BlockKind::WebFetch { .. } => "web_fetch",
            BlockKind::Code { .. } => "code",
            BlockKind::Message { .. } => "message",
            BlockKind::CheckIn { .. } => "check_in",
            BlockKind::Search { .. } => "search",
            BlockKind::DocDiff { .. } => "doc_diff",
            BlockKind::Chart { .. } => "chart",
            BlockKind::Webhook { .. } => "webhook",
        }
    }

    /// True for the block type that pauses the run instead of acting.
    pub fn pauses_run(&self) -> bool {
        matches!(self, BlockKind::CheckIn { .. })
    }

    /// Every string field that may carry template references, in field order.
    ///
    /// A webhook payload contributes one `payload` entry per string leaf,
    /// depth-first, the same leaves substitution rewrites before delivery.
    pub fn template_fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields: Vec<(&'static str, &str)> = Vec::new();
        match self {
            BlockKind::Model {
                prompt,
                system_prompt,
            } => {
                fields.push(("prompt", prompt));
                if let Some(text) = system_prompt {
                    fields.push(("system_prompt", text));
                }
            }
            BlockKind::WebFetch { url, prompt, .. } => {
                fields.push(("url", url));
                if let Some(text) = prompt {
                    fields.push(("prompt", text));
                }
            }
            BlockKind::Code { source, input, .. } => {
                fields.push(("source", source));
                if let Some(text) = input {
                    fields.push(("input", text));
                }
            }
            BlockKind::Message { to, subject, body } => {
                fields.push(("to", to));
                if let Some(text) = subject {
                    fields.push(("subject", text));
                }
                fields.push(("body", body));
            }
            BlockKind::CheckIn { note } => {
                if let Some(text) = note {
                    fields.push(("note", text));
                }
            }
            BlockKind::Search { query, .. } => {
                fields.push(("query", query));
            }
            BlockKind::DocDiff { original, revised } => {
                fields.push(("original", original));
                fields.push(("revised", revised));
            }
            BlockKind::Chart { instructions, .. } => {
                fields.push(("instructions", instructions));
            }
            BlockKind::Webhook { url, payload } => {
                fields.push(("url", url));
                if let Some(payload) = payload {
                    collect_payload_strings(payload, &mut fields);
                }
            }
        }
        fields
    }

    /// The field an editor should open on, with its current text.
    pub fn primary_template_field(&self) -> Option<(&'static str, &str)> {
        self.template_fields().into_iter().next()
    }
}

/// Depth-first walk over a payload's string leaves.
fn collect_payload_strings<'a>(value: &'a Value, fields: &mut Vec<(&'static str, &'a str)>) {
    match value {
        Value::String(text) => fields.push(("payload", text)),
        Value::Array(items) => {
            for item in items {
                collect_payload_strings(item, fields);
            }
        }
        Value::Object(entries) => {
            for entry in entries.values() {
                collect_payload_strings(entry, fields);
            }
        }
        _ => {}
    }
}

/// One positioned step of an agent's pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Stable identity within the owning agent.
    pub id: String,
    /// One-based position in the pipeline. The whole sequence must stay
    /// contiguous and strictly ascending; gaps or duplicates are rejected.
    pub block_number: u32,
    /// Name of the variable the block writes its result into. Optional for
    /// blocks whose result is not wired anywhere (and for check-ins).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
    /// Type tag plus type-specific configuration.
    #[serde(flatten)]
    pub kind: BlockKind,
}

/// Why a block sequence is not a valid pipeline ordering.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockSequenceError {
    #[error("block numbers must start at 1, found {first}")]
    WrongStart { first: u32 },
    #[error("duplicate block number {number}")]
    Duplicate { number: u32 },
    #[error("block numbers must be contiguous and ascending, found {found} after {previous}")]
    OutOfOrder { previous: u32, found: u32 },
}

/// Checks that `blocks` is numbered 1..=n in list order.
///
/// Run at mutation time and on file load, never lazily during execution.
/// An empty sequence is valid; a run over it completes immediately.
pub fn validate_block_sequence(blocks: &[Block]) -> Result<(), BlockSequenceError> {
    let mut previous: Option<u32> = None;
    for block in blocks {
        let number = block.block_number;
        match previous {
            None if number != 1 => return Err(BlockSequenceError::WrongStart { first: number }),
            Some(prev) if number == prev => {
                return Err(BlockSequenceError::Duplicate { number });
            }
            Some(prev) if number != prev + 1 => {
                return Err(BlockSequenceError::OutOfOrder {
                    previous: prev,
                    found: number,
                });
            }
            _ => {}
        }
        previous = Some(number);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u32, kind: BlockKind) -> Block {
        Block {
            id: format!("blk-{number}"),
            block_number: number,
            output_variable: None,
            kind,
        }
    }

    #[test]
    fn block_deserializes_from_yaml_with_type_tag() {
        let yaml = r#"
id: blk-1
block_number: 1
output_variable: summary
type: web_fetch
url: "https://example.com/report"
page_limit: 3
"#;
        let block: Block = serde_yaml::from_str(yaml).expect("deserialize Block");
        assert_eq!(block.block_number, 1);
        assert_eq!(block.output_variable.as_deref(), Some("summary"));
        match &block.kind {
            BlockKind::WebFetch {
                url,
                page_limit,
                wait_secs,
                ..
            } => {
                assert_eq!(url, "https://example.com/report");
                assert_eq!(*page_limit, Some(3));
                assert!(wait_secs.is_none());
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn template_fields_cover_optional_text() {
        let kind = BlockKind::Message {
            to: "{{lead.email}}".into(),
            subject: Some("about {{topic}}".into()),
            body: "see {{analysis}}".into(),
        };
        let fields = kind.template_fields();
        let names: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["to", "subject", "body"]);
    }

    #[test]
    fn webhook_template_fields_include_payload_strings() {
        let kind = BlockKind::Webhook {
            url: "https://hooks.example.com/{{channel}}".into(),
            payload: Some(serde_json::json!({
                "title": "about {{topic}}",
                "tags": ["{{region}}", 7],
                "nested": {"note": "{{typo}}"},
            })),
        };
        assert_eq!(kind.primary_template_field().map(|(name, _)| name), Some("url"));

        let payload_texts: Vec<&str> = kind
            .template_fields()
            .into_iter()
            .filter(|(name, _)| *name == "payload")
            .map(|(_, text)| text)
            .collect();
        assert_eq!(payload_texts.len(), 3);
        for leaf in ["about {{topic}}", "{{region}}", "{{typo}}"] {
            assert!(payload_texts.contains(&leaf), "missing payload leaf {leaf:?}");
        }
    }

    #[test]
    fn webhook_without_payload_exposes_only_url() {
        let kind = BlockKind::Webhook {
            url: "https://hooks.example.com/x".into(),
            payload: None,
        };
        let names: Vec<&str> = kind.template_fields().iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["url"]);
    }

    #[test]
    fn check_in_pauses_and_has_no_required_fields() {
        let kind = BlockKind::CheckIn { note: None };
        assert!(kind.pauses_run());
        assert!(kind.template_fields().is_empty());
        assert!(kind.primary_template_field().is_none());
    }

    #[test]
    fn valid_sequence_passes() {
        let blocks = vec![
            block(1, BlockKind::CheckIn { note: None }),
            block(2, BlockKind::CheckIn { note: None }),
            block(3, BlockKind::CheckIn { note: None }),
        ];
        assert_eq!(validate_block_sequence(&blocks), Ok(()));
        assert_eq!(validate_block_sequence(&[]), Ok(()));
    }

    #[test]
    fn sequence_must_start_at_one() {
        let blocks = vec![block(2, BlockKind::CheckIn { note: None })];
        assert_eq!(
            validate_block_sequence(&blocks),
            Err(BlockSequenceError::WrongStart { first: 2 })
        );
    }

    #[test]
    fn gaps_and_duplicates_are_rejected() {
        let gapped = vec![
            block(1, BlockKind::CheckIn { note: None }),
            block(3, BlockKind::CheckIn { note: None }),
        ];
        assert_eq!(
            validate_block_sequence(&gapped),
            Err(BlockSequenceError::OutOfOrder {
                previous: 1,
                found: 3
            })
        );

        let duplicated = vec![
            block(1, BlockKind::CheckIn { note: None }),
            block(1, BlockKind::CheckIn { note: None }),
        ];
        assert_eq!(
            validate_block_sequence(&duplicated),
            Err(BlockSequenceError::Duplicate { number: 1 })
        );
    }
}
