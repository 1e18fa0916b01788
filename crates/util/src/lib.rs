//! Persistence and session plumbing shared by the conveyor crates.

pub mod document_store;
pub mod ids;
pub mod session;

pub use document_store::{
    Collection, DATA_FILE_NAME, DATA_PATH_ENV, DocKey, DocumentStore, DocumentStoreError,
    JsonDocumentStore, MemoryDocumentStore, OWNER_FIELD, StoredDocument,
};
pub use ids::{fresh_id, next_request_id};
pub use session::{DEFAULT_PROFILE, Session, SessionError, USER_ENV};
