//! [`UserIdentity`] and the signature-keyed, write-through [`IdentityCache`] (§3, §4.1).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// A resolved user identity, derived either from a validated token or from a deterministic
/// hash of an anonymous session identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub active: bool,
    pub anonymous: bool,
}

impl UserIdentity {
    /// Builds the deterministic synthetic identity used for unauthenticated sessions
    /// (§4.1: `{id = hash(session_user), email = "anonymous.<id>@<domain>", anonymous = true}`).
    pub fn anonymous(session_user: &str, domain: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(session_user.as_bytes());
        let id = format!("{:x}", hasher.finalize());
        let id = id[..16].to_string();
        UserIdentity {
            email: format!("anonymous.{id}@{domain}"),
            id,
            username: session_user.to_string(),
            first_name: String::new(),
            last_name: String::new(),
            active: true,
            anonymous: true,
        }
    }

    /// Display name: `"Anonymous User"` for anonymous identities, otherwise the
    /// concatenated first/last name (falling back to the username when both are empty).
    pub fn full_name(&self) -> String {
        if self.anonymous {
            return "Anonymous User".to_string();
        }
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.username.clone()
        } else {
            name.to_string()
        }
    }
}

/// Error surfaced when the backing user store cannot be reached or queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for StoreError {}

/// Backing user store, queried by email on an identity cache miss (§4.1).
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserIdentity>, StoreError>;
}

/// An in-memory user store, useful for tests and for small deployments that don't need a
/// full DB-pool-backed implementation.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: Mutex<HashMap<String, UserIdentity>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: UserIdentity) {
        self.users.lock().unwrap().insert(user.email.clone(), user);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserIdentity>, StoreError> {
        Ok(self.users.lock().unwrap().get(email).cloned())
    }
}

const IDENTITY_CACHE_TTL: Duration = Duration::from_secs(3600);

struct CacheEntry {
    identity: UserIdentity,
    cached_at: Instant,
}

/// Maps a JWT signature segment to a [`UserIdentity`] with a one-hour TTL, write-through
/// to the backing [`UserStore`] on miss (§3, §6: `signature:<jwt-signature-segment>`).
///
/// Concurrent writers for the same key overwrite each other (last-writer-wins), matching
/// the concurrency policy in §5.
pub struct IdentityCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached identity for `signature` if present and not expired.
    pub fn get(&self, signature: &str) -> Option<UserIdentity> {
        let entries = self.entries.lock().unwrap();
        entries.get(signature).and_then(|entry| {
            if entry.cached_at.elapsed() < IDENTITY_CACHE_TTL {
                Some(entry.identity.clone())
            } else {
                None
            }
        })
    }

    /// Write-through insert; last writer for a given signature wins.
    pub fn put(&self, signature: &str, identity: UserIdentity) {
        self.entries.lock().unwrap().insert(
            signature.to_string(),
            CacheEntry {
                identity,
                cached_at: Instant::now(),
            },
        );
    }

    /// Looks up `signature` in the cache, falling back to `store.find_by_email` on miss and
    /// caching the result before returning it.
    pub async fn get_or_load(
        &self,
        signature: &str,
        email: &str,
        store: &dyn UserStore,
    ) -> Result<Option<UserIdentity>, StoreError> {
        if let Some(identity) = self.get(signature) {
            return Ok(Some(identity));
        }
        let found = store.find_by_email(email).await?;
        if let Some(identity) = &found {
            self.put(signature, identity.clone());
        }
        Ok(found)
    }
}
