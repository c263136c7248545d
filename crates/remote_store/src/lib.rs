//! Adapters for the hosted auth service and hierarchical key-value store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use shared::{
    domain::{Node, StorePath, UserId},
    error::{AuthError, StoreError},
};

mod http;
mod memory;

pub use http::{HttpBackend, HttpBackendConfig, DEFAULT_AUTH_URL};
pub use memory::InMemoryBackend;

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, email: &str, password: &str) -> Result<UserId, AuthError>;
    async fn create_account(&self, email: &str, password: &str) -> Result<UserId, AuthError>;
    /// Best-effort; callers are expected to ignore failures.
    async fn invalidate_session(&self) -> Result<(), AuthError>;
    async fn current_user(&self) -> Option<UserId>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Replaces whatever is stored at `path` with `fields`. No merge.
    async fn write_record(
        &self,
        path: &StorePath,
        fields: BTreeMap<String, String>,
    ) -> Result<(), StoreError>;
    /// `Ok(None)` when nothing is stored at `path`.
    async fn read_subtree(&self, path: &StorePath) -> Result<Option<Node>, StoreError>;
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod memory_tests;

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod http_tests;
