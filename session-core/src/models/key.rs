use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SessionError};

/// Identifies one user inside one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserKey {
    pub app_name: String,
    pub user_id: String,
}

/// Identifies one session: (app, user, session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    #[serde(default)]
    pub session_id: String,
}

impl UserKey {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
        }
    }

    pub fn check(&self) -> Result<()> {
        check_user_key(&self.app_name, &self.user_id)
    }
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Requires app, user and session id.
    pub fn check_session_key(&self) -> Result<()> {
        check_user_key(&self.app_name, &self.user_id)?;
        if self.session_id.is_empty() {
            return Err(SessionError::SessionIdRequired);
        }
        Ok(())
    }

    /// Requires app and user only; the session id may still be generated.
    pub fn check_user_key(&self) -> Result<()> {
        check_user_key(&self.app_name, &self.user_id)
    }

    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.app_name.clone(), self.user_id.clone())
    }

    /// `app:user:session`, the string the routing hash is computed over.
    pub fn joined(&self) -> String {
        format!("{}:{}:{}", self.app_name, self.user_id, self.session_id)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "app={}, user={}, session={}",
            self.app_name, self.user_id, self.session_id
        )
    }
}

fn check_user_key(app_name: &str, user_id: &str) -> Result<()> {
    if app_name.is_empty() {
        return Err(SessionError::AppNameRequired);
    }
    if user_id.is_empty() {
        return Err(SessionError::UserIdRequired);
    }
    Ok(())
}
