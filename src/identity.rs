//! Identity provider: bearer credential → user id, then profile → role.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::limits::*;
use crate::model::*;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify a bearer credential and return the stable user id it belongs to.
    async fn authenticate(&self, credential: &str) -> Result<UserId, IdentityError>;

    /// Profile lookup for an authenticated user.
    async fn profile(&self, user_id: &UserId) -> Result<Actor, IdentityError>;

    /// The credential a login name must present. Used by transports that
    /// verify the secret themselves (pgwire cleartext auth).
    async fn credential_for(&self, user_id: &UserId) -> Option<String>;

    async fn resolve(&self, credential: &str) -> Result<Actor, IdentityError> {
        let user_id = self.authenticate(credential).await?;
        self.profile(&user_id).await
    }
}

#[derive(Debug)]
pub enum IdentityError {
    Unauthenticated,
    UnknownUser(UserId),
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Unauthenticated => write!(f, "invalid or expired credential"),
            IdentityError::UnknownUser(id) => write!(f, "no profile for user {id}"),
            IdentityError::Io(e) => write!(f, "identity directory io error: {e}"),
            IdentityError::Parse(e) => write!(f, "identity directory parse error: {e}"),
            IdentityError::Invalid(e) => write!(f, "invalid user record: {e}"),
        }
    }
}

impl std::error::Error for IdentityError {}

impl From<std::io::Error> for IdentityError {
    fn from(e: std::io::Error) -> Self {
        IdentityError::Io(e)
    }
}

/// One line of the user directory file.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub role: Role,
    pub token: String,
}

/// Fixed user directory: tokens and profiles loaded once at start-up.
pub struct StaticDirectory {
    profiles: DashMap<UserId, UserRecord>,
    tokens: DashMap<String, UserId>,
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, IdentityError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, IdentityError> {
        let users: Vec<UserRecord> =
            serde_json::from_str(raw).map_err(|e| IdentityError::Parse(e.to_string()))?;
        let dir = Self::new();
        for user in users {
            dir.add(user)?;
        }
        Ok(dir)
    }

    pub fn add(&self, user: UserRecord) -> Result<(), IdentityError> {
        if user.id.is_empty() || user.id.len() > MAX_ID_LEN {
            return Err(IdentityError::Invalid(format!("bad id length: {:?}", user.id)));
        }
        if user.token.is_empty() {
            return Err(IdentityError::Invalid(format!("{}: empty token", user.id)));
        }
        if self.profiles.len() >= MAX_USERS {
            return Err(IdentityError::Invalid("too many users".into()));
        }
        let id = UserId::new(user.id.clone());
        if let Some((_, previous)) = self.profiles.remove(&id) {
            self.tokens.remove(&previous.token);
        }
        self.tokens.insert(user.token.clone(), id.clone());
        self.profiles.insert(id, user);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticDirectory {
    async fn authenticate(&self, credential: &str) -> Result<UserId, IdentityError> {
        self.tokens
            .get(credential)
            .map(|e| e.value().clone())
            .ok_or(IdentityError::Unauthenticated)
    }

    async fn profile(&self, user_id: &UserId) -> Result<Actor, IdentityError> {
        let record = self
            .profiles
            .get(user_id)
            .ok_or_else(|| IdentityError::UnknownUser(user_id.clone()))?;
        Ok(Actor {
            user_id: user_id.clone(),
            name: record.name.clone(),
            role: record.role,
        })
    }

    async fn credential_for(&self, user_id: &UserId) -> Option<String> {
        self.profiles.get(user_id).map(|r| r.token.clone())
    }
}
