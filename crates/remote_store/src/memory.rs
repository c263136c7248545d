use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use shared::{
    domain::{Node, StorePath, UserId, USERS_NODE},
    error::{AuthError, StoreError},
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{AuthProvider, RecordStore};

const MIN_PASSWORD_LEN: usize = 6;

struct Account {
    password: String,
    user_id: UserId,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<String, Account>,
    root: BTreeMap<String, Node>,
    current_user: Option<UserId>,
    offline: bool,
    fail_next_write: Option<StoreError>,
    fail_next_read: Option<StoreError>,
    fail_next_sign_out: Option<AuthError>,
}

/// Process-local stand-in for the hosted service.
///
/// Paths under `Users/{uid}` are only readable and writable while `uid` is
/// the current user, matching the owner-only rules the hosted database is
/// deployed with. `without_owner_rules` turns that check off.
pub struct InMemoryBackend {
    inner: Mutex<MemoryState>,
    owner_rules: bool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryState::default()),
            owner_rules: true,
        }
    }

    pub fn without_owner_rules() -> Self {
        Self {
            owner_rules: false,
            ..Self::new()
        }
    }

    /// Registers an account without signing it in.
    pub async fn register(&self, email: &str, password: &str) -> UserId {
        let mut guard = self.inner.lock().await;
        insert_account(&mut guard, email, password).user_id.clone()
    }

    pub async fn set_offline(&self, offline: bool) {
        self.inner.lock().await.offline = offline;
    }

    pub async fn fail_next_write(&self, error: StoreError) {
        self.inner.lock().await.fail_next_write = Some(error);
    }

    pub async fn fail_next_read(&self, error: StoreError) {
        self.inner.lock().await.fail_next_read = Some(error);
    }

    pub async fn fail_next_sign_out(&self, error: AuthError) {
        self.inner.lock().await.fail_next_sign_out = Some(error);
    }

    /// Reads `path` ignoring owner rules and fault injection.
    pub async fn snapshot(&self, path: &StorePath) -> Option<Node> {
        let guard = self.inner.lock().await;
        lookup(&guard.root, path).cloned()
    }

    fn check_owner(&self, state: &MemoryState, path: &StorePath) -> Result<(), StoreError> {
        if !self.owner_rules {
            return Ok(());
        }
        match path.segments() {
            [users, owner, ..] if users == USERS_NODE => match &state.current_user {
                Some(current) if current.as_str() == owner => Ok(()),
                _ => Err(StoreError::PermissionDenied),
            },
            _ => Err(StoreError::PermissionDenied),
        }
    }
}

fn insert_account<'a>(state: &'a mut MemoryState, email: &str, password: &str) -> &'a Account {
    let user_id = UserId::new(uuid::Uuid::new_v4().simple().to_string());
    state.accounts.entry(email.to_string()).or_insert(Account {
        password: password.to_string(),
        user_id,
    })
}

fn lookup<'a>(root: &'a BTreeMap<String, Node>, path: &StorePath) -> Option<&'a Node> {
    let (first, rest) = path.segments().split_first()?;
    let mut current = root.get(first)?;
    for segment in rest {
        current = current.children()?.get(segment)?;
    }
    Some(current)
}

fn set_node(children: &mut BTreeMap<String, Node>, segments: &[String], value: Option<Node>) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        match value {
            Some(node) => {
                children.insert(head.clone(), node);
            }
            None => {
                children.remove(head);
            }
        }
        return;
    }

    let entry = children
        .entry(head.clone())
        .or_insert_with(|| Node::Branch(BTreeMap::new()));
    if entry.as_value().is_some() {
        *entry = Node::Branch(BTreeMap::new());
    }
    let now_empty = match entry {
        Node::Branch(grandchildren) => {
            set_node(grandchildren, rest, value);
            grandchildren.is_empty()
        }
        Node::Value(_) => false,
    };
    if now_empty {
        children.remove(head);
    }
}

#[async_trait]
impl AuthProvider for InMemoryBackend {
    async fn authenticate(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        let mut guard = self.inner.lock().await;
        if guard.offline {
            return Err(AuthError::Network("backend offline".into()));
        }
        let user_id = match guard.accounts.get(email) {
            Some(account) if account.password == password => account.user_id.clone(),
            _ => return Err(AuthError::InvalidCredentials),
        };
        guard.current_user = Some(user_id.clone());
        debug!(user_id = %user_id, "memory backend: signed in");
        Ok(user_id)
    }

    async fn create_account(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        let mut guard = self.inner.lock().await;
        if guard.offline {
            return Err(AuthError::Network("backend offline".into()));
        }
        if guard.accounts.contains_key(email) {
            return Err(AuthError::AccountExists);
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword(format!(
                "Password should be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        let user_id = insert_account(&mut guard, email, password).user_id.clone();
        guard.current_user = Some(user_id.clone());
        debug!(user_id = %user_id, "memory backend: account created");
        Ok(user_id)
    }

    async fn invalidate_session(&self) -> Result<(), AuthError> {
        let mut guard = self.inner.lock().await;
        if let Some(error) = guard.fail_next_sign_out.take() {
            return Err(error);
        }
        if guard.offline {
            return Err(AuthError::Network("backend offline".into()));
        }
        guard.current_user = None;
        Ok(())
    }

    async fn current_user(&self) -> Option<UserId> {
        self.inner.lock().await.current_user.clone()
    }
}

#[async_trait]
impl RecordStore for InMemoryBackend {
    async fn write_record(
        &self,
        path: &StorePath,
        fields: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        if let Some(error) = guard.fail_next_write.take() {
            return Err(error);
        }
        if guard.offline {
            return Err(StoreError::Network("backend offline".into()));
        }
        if path.is_root() {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        self.check_owner(&guard, path)?;

        let value = (!fields.is_empty()).then(|| Node::from_fields(fields));
        set_node(&mut guard.root, path.segments(), value);
        Ok(())
    }

    async fn read_subtree(&self, path: &StorePath) -> Result<Option<Node>, StoreError> {
        let mut guard = self.inner.lock().await;
        if let Some(error) = guard.fail_next_read.take() {
            return Err(error);
        }
        if guard.offline {
            return Err(StoreError::Network("backend offline".into()));
        }
        if path.is_root() {
            if self.owner_rules {
                return Err(StoreError::PermissionDenied);
            }
            return Ok((!guard.root.is_empty()).then(|| Node::Branch(guard.root.clone())));
        }
        self.check_owner(&guard, path)?;
        Ok(lookup(&guard.root, path).cloned())
    }
}
