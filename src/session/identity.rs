//! Identity records consumed by the session core.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

pub const ROLE_STUDENT: &str = "student";
pub const ROLE_TEACHER: &str = "teacher";
pub const ROLE_ADMIN: &str = "admin";
pub const DEFAULT_ROLE: &str = ROLE_STUDENT;
pub const KNOWN_ROLES: [&str; 3] = [ROLE_STUDENT, ROLE_TEACHER, ROLE_ADMIN];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub phone: Option<String>,
    pub password_hash: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Public view of an identity as returned to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub role: String,
}

impl UserProfile {
    #[must_use]
    pub fn from_identity(identity: &Identity, role: &str) -> Self {
        Self {
            id: identity.id,
            username: identity.username.clone(),
            email: identity.email.clone(),
            phone: identity.phone.clone(),
            role: role.to_string(),
        }
    }
}

#[must_use]
pub fn is_known_role(role: &str) -> bool {
    KNOWN_ROLES.contains(&role)
}

/// Storage seam for identities and their roles.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>>;

    /// Lookup by normalized (trimmed, lowercase) email.
    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>>;

    async fn role_of(&self, id: Uuid) -> Result<Option<String>>;

    /// Insert a new identity. Returns `false` if the email is already taken.
    async fn insert(&self, identity: &Identity) -> Result<bool>;

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn set_role(&self, id: Uuid, role: &str) -> Result<bool>;

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: Mutex<HashMap<Uuid, Identity>>,
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Identity>> {
        Ok(self.identities.lock().await.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Identity>> {
        let identities = self.identities.lock().await;
        Ok(identities
            .values()
            .find(|identity| identity.email == email)
            .cloned())
    }

    async fn role_of(&self, id: Uuid) -> Result<Option<String>> {
        Ok(self
            .identities
            .lock()
            .await
            .get(&id)
            .map(|identity| identity.role.clone()))
    }

    async fn insert(&self, identity: &Identity) -> Result<bool> {
        let mut identities = self.identities.lock().await;
        if identities
            .values()
            .any(|existing| existing.email == identity.email)
        {
            return Ok(false);
        }
        identities.insert(identity.id, identity.clone());
        Ok(true)
    }

    async fn touch_last_login(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(identity) = self.identities.lock().await.get_mut(&id) {
            identity.last_login_at = Some(at);
        }
        Ok(())
    }

    async fn set_role(&self, id: Uuid, role: &str) -> Result<bool> {
        Ok(match self.identities.lock().await.get_mut(&id) {
            Some(identity) => {
                identity.role = role.to_string();
                true
            }
            None => false,
        })
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<bool> {
        Ok(match self.identities.lock().await.get_mut(&id) {
            Some(identity) => {
                identity.password_hash = password_hash.to_string();
                true
            }
            None => false,
        })
    }
}
