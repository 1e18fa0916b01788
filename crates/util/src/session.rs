//! Authenticated session context for persistence calls.

use thiserror::Error;

use crate::document_store::DocKey;

/// Environment variable supplying the user id when none is passed explicitly.
pub const USER_ENV: &str = "CONVEYOR_USER";

/// Fallback profile used by local, single-user setups.
pub const DEFAULT_PROFILE: &str = "default_profile";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Construction was attempted with a blank user id.
    #[error("a session requires a non-empty user id")]
    MissingUser,
}

/// The current user's identity, required to namespace every persistence call.
///
/// Constructing a `Session` is the single place the "no user id" precondition
/// is enforced; once one exists, the keys it builds are well-formed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    user_id: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Result<Self, SessionError> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(SessionError::MissingUser);
        }
        Ok(Self { user_id })
    }

    /// Build a session from `CONVEYOR_USER`, falling back to the local
    /// single-user profile.
    pub fn from_env() -> Self {
        let user_id = std::env::var(USER_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        Self { user_id }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn agent_key(&self, agent_id: impl Into<String>) -> DocKey {
        DocKey::agent(self.user_id.clone(), agent_id)
    }

    pub fn variable_key(&self, variable_id: impl Into<String>) -> DocKey {
        DocKey::variable(self.user_id.clone(), variable_id)
    }
}
