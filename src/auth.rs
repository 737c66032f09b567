use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::identity::IdentityProvider;
use crate::model::UserId;
use crate::observability;

/// Login user is the member id; the password is their bearer token.
pub struct DirectoryAuthSource {
    identity: Arc<dyn IdentityProvider>,
}

impl DirectoryAuthSource {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }
}

impl std::fmt::Debug for DirectoryAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryAuthSource").finish_non_exhaustive()
    }
}

fn rejected(message: String) -> PgWireError {
    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "FATAL".into(),
        "28P01".into(),
        message,
    )))
}

#[async_trait]
impl AuthSource for DirectoryAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login
            .user()
            .ok_or_else(|| rejected("no user name in startup message".into()))?;
        match self.identity.credential_for(&UserId::new(user)).await {
            Some(token) => Ok(Password::new(None, token.into_bytes())),
            None => {
                tracing::debug!("login refused for unknown user {user}");
                Err(rejected(format!("password authentication failed for user \"{user}\"")))
            }
        }
    }
}
