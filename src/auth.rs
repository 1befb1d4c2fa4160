//! Authenticator boundary and a static credential table
use super::error::WorkflowError;
use super::types::{Actor, Role};
use super::utils::content_hash;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<Actor, WorkflowError>;
}

struct Account {
    password_digest: String,
    role: Role,
}

/// In-memory accounts. Passwords are only kept as sha256 digests.
#[derive(Default)]
pub struct StaticAuthenticator {
    accounts: HashMap<String, Account>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: &str, password: &str, role: Role) -> Self {
        self.accounts.insert(
            username.to_string(),
            Account {
                password_digest: content_hash(password.as_bytes()),
                role,
            },
        );
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, credentials: &Credentials) -> Result<Actor, WorkflowError> {
        let digest = content_hash(credentials.password.as_bytes());
        match self.accounts.get(&credentials.username) {
            Some(account) if account.password_digest == digest => {
                tracing::debug!(user = %credentials.username, role = %account.role, "authenticated");
                Ok(Actor::new(credentials.username.clone(), account.role))
            }
            _ => {
                tracing::warn!(user = %credentials.username, "rejected credentials");
                Err(WorkflowError::unauthorized(None, "invalid credentials"))
            }
        }
    }
}
