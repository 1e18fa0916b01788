//! Attached sources: pages and files registered under short nicknames.
//!
//! Reference scanning only needs the name-to-existence lookup, so that is all
//! [`SourceCatalog`] exposes. The registry itself remembers where each source
//! points so other surfaces can list and detach them.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("'{0}' is not a valid source nickname (letters and underscores only)")]
    InvalidNickname(String),
    #[error("invalid source url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Where an attached source lives.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "location", rename_all = "snake_case")]
pub enum SourceLocation {
    Page { url: String },
    File { path: String },
}

/// One attachment under its nickname.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceEntry {
    pub nickname: String,
    #[serde(flatten)]
    pub location: SourceLocation,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub attached_at: DateTime<Utc>,
}

/// Nickname existence lookup consumed by the `@name` branch of reference
/// scanning. Scanning never needs the location, only whether the name is
/// taken.
pub trait SourceCatalog {
    fn contains(&self, nickname: &str) -> bool;
}

/// A catalog with nothing attached.
pub struct NoSources;

impl SourceCatalog for NoSources {
    fn contains(&self, _nickname: &str) -> bool {
        false
    }
}

/// In-memory source registry, insertion ordered.
#[derive(Default)]
pub struct SourceRegistry {
    entries: IndexMap<String, SourceEntry>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a web page under `nickname`. Re-attaching an existing nickname
    /// replaces the previous entry.
    pub fn attach_page(&mut self, nickname: &str, url: &str) -> Result<&SourceEntry, SourceError> {
        validate_nickname(nickname)?;
        let parsed = Url::parse(url).map_err(|error| SourceError::InvalidUrl {
            url: url.to_string(),
            reason: error.to_string(),
        })?;
        Ok(self.insert(nickname, SourceLocation::Page { url: parsed.into() }))
    }

    /// Attach a local file under `nickname`.
    pub fn attach_file(&mut self, nickname: &str, path: &str) -> Result<&SourceEntry, SourceError> {
        validate_nickname(nickname)?;
        Ok(self.insert(nickname, SourceLocation::File { path: path.to_string() }))
    }

    pub fn remove(&mut self, nickname: &str) -> Option<SourceEntry> {
        self.entries.shift_remove(nickname)
    }

    pub fn get(&self, nickname: &str) -> Option<&SourceEntry> {
        self.entries.get(nickname)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, nickname: &str, location: SourceLocation) -> &SourceEntry {
        let entry = SourceEntry {
            nickname: nickname.to_string(),
            location,
            attached_at: Utc::now(),
        };
        self.entries.insert(nickname.to_string(), entry);
        &self.entries[nickname]
    }
}

impl SourceCatalog for SourceRegistry {
    fn contains(&self, nickname: &str) -> bool {
        self.entries.contains_key(nickname)
    }
}

/// Nicknames mirror the `@name` syntax: letters and underscores only.
fn validate_nickname(nickname: &str) -> Result<(), SourceError> {
    if nickname.is_empty() || !nickname.chars().all(|c| c.is_ascii_alphabetic() || c == '_') {
        return Err(SourceError::InvalidNickname(nickname.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_look_up() {
        let mut registry = SourceRegistry::new();
        registry
            .attach_page("report", "https://example.com/q3")
            .expect("attach page");
        registry.attach_file("notes", "/tmp/notes.md").expect("attach file");

        assert!(registry.contains("report"));
        assert!(registry.contains("notes"));
        assert!(!registry.contains("minutes"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn reattach_replaces() {
        let mut registry = SourceRegistry::new();
        registry
            .attach_page("report", "https://example.com/v1")
            .expect("attach");
        registry
            .attach_page("report", "https://example.com/v2")
            .expect("reattach");

        assert_eq!(registry.len(), 1);
        match &registry.get("report").unwrap().location {
            SourceLocation::Page { url } => assert_eq!(url, "https://example.com/v2"),
            other => panic!("unexpected location {other:?}"),
        }
    }

    #[test]
    fn nickname_rules() {
        let mut registry = SourceRegistry::new();
        assert!(matches!(
            registry.attach_file("q3 report", "/tmp/x"),
            Err(SourceError::InvalidNickname(_))
        ));
        assert!(registry.attach_file("", "/tmp/x").is_err());
        assert!(registry.attach_file("q3", "/tmp/x").is_err(), "digits are not allowed");
        assert!(registry.attach_file("q_three", "/tmp/x").is_ok());
    }

    #[test]
    fn rejects_unparseable_urls() {
        let mut registry = SourceRegistry::new();
        let result = registry.attach_page("report", "not a url");
        assert!(matches!(result, Err(SourceError::InvalidUrl { .. })));
        assert!(!registry.contains("report"));
    }

    #[test]
    fn remove_detaches() {
        let mut registry = SourceRegistry::new();
        registry.attach_file("notes", "/tmp/notes.md").expect("attach");
        let removed = registry.remove("notes").expect("removed entry");
        assert_eq!(removed.nickname, "notes");
        assert!(!registry.contains("notes"));
        assert!(registry.remove("notes").is_none());
    }
}
