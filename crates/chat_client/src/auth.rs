use std::sync::RwLock;

use shared::domain::UserId;

/// Credentials of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub token: String,
    pub user_id: UserId,
    pub username: String,
}

impl AuthSession {
    pub fn new(token: impl Into<String>, user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id,
            username: username.into(),
        }
    }
}

pub trait AuthProvider: Send + Sync {
    /// The current session, or `None` when signed out.
    fn session(&self) -> Option<AuthSession>;
}

pub struct SignedOut;

impl AuthProvider for SignedOut {
    fn session(&self) -> Option<AuthSession> {
        None
    }
}

/// Session holder the embedding application updates on sign-in and
/// sign-out.
#[derive(Default)]
pub struct SessionStore {
    current: RwLock<Option<AuthSession>>,
}

impl SessionStore {
    pub fn signed_in(session: AuthSession) -> Self {
        Self {
            current: RwLock::new(Some(session)),
        }
    }

    pub fn sign_in(&self, session: AuthSession) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(session);
    }

    pub fn sign_out(&self) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

impl AuthProvider for SessionStore {
    fn session(&self) -> Option<AuthSession> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
