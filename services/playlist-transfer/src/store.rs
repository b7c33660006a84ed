//!
//! src/store.rs  Andrew Belles  Oct 7th, 2025
//!
//! In-memory store of the Spotify credentials users hand over on login.
//! Lost on restart.
//!

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotifyUser {
    pub user_id: UserId,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub updated_at: DateTime<Utc>
}

impl SpotifyUser {
    pub fn new(user_id: UserId, refresh_token: String, access_token: Option<String>) -> Self {
        Self { user_id, refresh_token, access_token, updated_at: Utc::now() }
    }
}

#[derive(Debug, Default)]
pub struct CredentialStore {
    users: RwLock<HashMap<UserId, SpotifyUser>>
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites, returns true if the user was new
    pub fn upsert_user(&self, user: SpotifyUser) -> bool {
        let id = user.user_id.clone();
        let inserted = self.users.write().insert(id.clone(), user).is_none();
        debug!(user = %id, inserted, "store.upsert");
        inserted
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.users.read().contains_key(user)
    }

    /// Refresh token for the user, if one was ever stored
    pub fn fetch_stored_credential(&self, user: &UserId) -> Option<String> {
        self.users.read()
            .get(user)
            .map(|u| u.refresh_token.clone())
            .filter(|t| !t.is_empty())
    }
}
