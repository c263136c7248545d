use std::sync::Arc;

use futures::Stream;
use remote_store::{AuthProvider, RecordStore};
use shared::domain::{Event, Node, StorePath, UserId};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

pub mod error;
mod retry;
mod settings;
mod state;

pub use error::ControllerError;
pub use retry::RetryPolicy;
pub use settings::{ControllerSettings, SignUpRoute};
pub use state::{ControllerEvent, Operation, OperationError, SessionPhase, SessionState};

use retry::with_retry;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Flattens a `Users/{uid}/Events` snapshot into distinct field values.
///
/// Events and their fields are visited in enumeration order and a value is
/// appended only if an identical string is not already present, whichever
/// event or field it came from.
pub fn flatten_posts(events: Option<&Node>) -> Vec<String> {
    let mut posts: Vec<String> = Vec::new();
    let Some(events) = events.and_then(Node::children) else {
        return posts;
    };
    for event in events.values() {
        let Some(fields) = event.children() else {
            continue;
        };
        for value in fields.values().filter_map(Node::as_value) {
            if !posts.iter().any(|post| post == value) {
                posts.push(value.to_string());
            }
        }
    }
    posts
}

/// Mediates every interaction between a UI and the hosted backend and owns
/// the published [`SessionState`].
///
/// State changes only after the awaited remote call returns, and every change
/// goes through a single `watch::Sender`, so completions landing concurrently
/// are applied one at a time. Sign-in, sign-up and sign-out advance a session
/// epoch; completions started under an older epoch are dropped. Calls into the
/// auth provider that switch its session run one at a time.
pub struct SessionController {
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn RecordStore>,
    auth_lock: Mutex<()>,
    settings: ControllerSettings,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<ControllerEvent>,
}

impl SessionController {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn RecordStore>,
        settings: ControllerSettings,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            auth,
            store,
            auth_lock: Mutex::new(()),
            settings,
            state,
            events,
        })
    }

    /// Uses one backend for both auth and records, as the hosted service does.
    pub fn with_backend<B>(backend: Arc<B>, settings: ControllerSettings) -> Arc<Self>
    where
        B: AuthProvider + RecordStore + 'static,
    {
        let auth: Arc<dyn AuthProvider> = backend.clone();
        let store: Arc<dyn RecordStore> = backend;
        Self::new(auth, store, settings)
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn signed_in(&self) -> bool {
        self.state.borrow().signed_in()
    }

    pub fn posts(&self) -> Vec<String> {
        self.state.borrow().posts.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Current state followed by every later change.
    pub fn state_stream(&self) -> impl Stream<Item = SessionState> {
        WatchStream::new(self.state.subscribe())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserId, ControllerError> {
        self.authenticate_with(Operation::SignIn, email, password)
            .await
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<UserId, ControllerError> {
        self.authenticate_with(Operation::SignUp, email, password)
            .await
    }

    /// The "Create Account" confirmation action, routed per
    /// [`ControllerSettings::sign_up_route`].
    pub async fn submit_sign_up_form(
        &self,
        email: &str,
        password: &str,
    ) -> Result<UserId, ControllerError> {
        match self.settings.sign_up_route {
            SignUpRoute::SignIn => {
                warn!("sign-up form routed to sign-in; no account will be created");
                self.sign_in(email, password).await
            }
            SignUpRoute::CreateAccount => self.sign_up(email, password).await,
        }
    }

    /// Clears local state immediately, then invalidates the remote session on
    /// a best-effort basis.
    pub async fn sign_out(&self) {
        let mut previous_user = None;
        self.state.send_modify(|state| {
            state.epoch += 1;
            previous_user = state.user_id.take();
            state.phase = SessionPhase::SignedOut;
            state.posts.clear();
            state.last_error = None;
        });
        info!(
            user_id = previous_user.as_ref().map(UserId::as_str),
            "signed out locally"
        );
        self.publish(ControllerEvent::SessionChanged {
            phase: SessionPhase::SignedOut,
            user_id: None,
        });

        if let Err(error) = self.auth.invalidate_session().await {
            warn!(%error, "remote sign-out failed; ignoring");
        }
    }

    /// Writes `Users/{uid}/Events/{event_name}`, replacing any event with the
    /// same name. The name is used as given, including when blank.
    pub async fn create_event(
        &self,
        event_name: &str,
        description: &str,
        start_time: &str,
        end_time: &str,
    ) -> Result<(), ControllerError> {
        let operation = Operation::CreateEvent;
        let (user_id, _) = self.require_user(operation)?;
        let event = Event::new(event_name, description, start_time, end_time);
        let path = StorePath::user_event(&user_id, &event.name);
        let fields = event.fields();

        let store = &self.store;
        let path_ref = &path;
        let fields_ref = &fields;
        let result = with_retry(&self.settings.retry, operation, || async move {
            store
                .write_record(path_ref, fields_ref.clone())
                .await
                .map_err(ControllerError::from)
        })
        .await;

        match result {
            Ok(()) => {
                info!(user_id = %user_id, event = %event.name, "event written");
                self.clear_error();
                self.publish(ControllerEvent::EventWritten { name: event.name });
                Ok(())
            }
            Err(error) => Err(self.record_failure(operation, None, error)),
        }
    }

    /// Reads the user's events once, rebuilds the post list from scratch and
    /// publishes it.
    pub async fn display_posts(&self) -> Result<Vec<String>, ControllerError> {
        let operation = Operation::DisplayPosts;
        let (user_id, epoch) = self.require_user(operation)?;
        let snapshot = match self.read_events(operation, &user_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => return Err(self.record_failure(operation, Some(epoch), error)),
        };

        let posts = flatten_posts(snapshot.as_ref());
        let applied = self.state.send_if_modified(|state| {
            if state.epoch != epoch {
                return false;
            }
            state.posts = posts.clone();
            state.last_error = None;
            true
        });
        if !applied {
            debug!(user_id = %user_id, "dropping posts read from a previous session");
            return Err(ControllerError::SessionChanged);
        }

        debug!(user_id = %user_id, count = posts.len(), "posts refreshed");
        self.publish(ControllerEvent::PostsUpdated(posts.clone()));
        Ok(posts)
    }

    /// Reads the user's events as structured values without touching the
    /// published post list.
    pub async fn list_events(&self) -> Result<Vec<Event>, ControllerError> {
        let operation = Operation::ListEvents;
        let (user_id, _) = self.require_user(operation)?;
        let snapshot = self
            .read_events(operation, &user_id)
            .await
            .map_err(|error| self.record_failure(operation, None, error))?;

        let events: Vec<Event> = snapshot
            .as_ref()
            .and_then(Node::children)
            .map(|children| {
                children
                    .iter()
                    .filter_map(|(name, node)| Event::from_node(name.clone(), node))
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }

    /// Adopts a session the auth provider already holds, e.g. one restored
    /// at startup.
    pub async fn resume(&self) -> SessionPhase {
        let epoch = self.state.borrow().epoch;
        let Some(user_id) = self.auth.current_user().await else {
            return self.state.borrow().phase;
        };

        let applied = self.state.send_if_modified(|state| {
            if state.epoch != epoch || state.user_id.as_ref() == Some(&user_id) {
                return false;
            }
            state.phase = SessionPhase::SignedIn;
            state.user_id = Some(user_id.clone());
            state.posts.clear();
            state.last_error = None;
            true
        });
        if applied {
            info!(user_id = %user_id, "resumed existing session");
            self.publish(ControllerEvent::SessionChanged {
                phase: SessionPhase::SignedIn,
                user_id: Some(user_id),
            });
        }
        self.state.borrow().phase
    }

    async fn authenticate_with(
        &self,
        operation: Operation,
        email: &str,
        password: &str,
    ) -> Result<UserId, ControllerError> {
        let mut epoch = 0;
        self.state.send_modify(|state| {
            state.epoch += 1;
            epoch = state.epoch;
            state.phase = SessionPhase::Pending;
        });
        debug!(operation = operation.as_str(), "authentication started");

        // Held until the outcome is applied or discarded.
        let _auth_guard = self.auth_lock.lock().await;
        if self.state.borrow().epoch != epoch {
            debug!(
                operation = operation.as_str(),
                "authentication superseded before it started"
            );
            return Err(ControllerError::SessionChanged);
        }

        let auth = &self.auth;
        let result = with_retry(&self.settings.retry, operation, || async move {
            let outcome = match operation {
                Operation::SignUp => auth.create_account(email, password).await,
                _ => auth.authenticate(email, password).await,
            };
            outcome.map_err(ControllerError::from)
        })
        .await;

        let user_id = match result {
            Ok(user_id) => user_id,
            Err(error) => return Err(self.record_failure(operation, Some(epoch), error)),
        };

        let mut applied = false;
        self.state.send_if_modified(|state| {
            if state.epoch != epoch {
                // The provider no longer holds the previous user's session.
                if state.phase == SessionPhase::Pending && state.user_id.is_some() {
                    state.user_id = None;
                    state.posts.clear();
                    return true;
                }
                return false;
            }
            if state.user_id.as_ref() != Some(&user_id) {
                state.posts.clear();
            }
            state.phase = SessionPhase::SignedIn;
            state.user_id = Some(user_id.clone());
            state.last_error = None;
            applied = true;
            true
        });

        if !applied {
            debug!(
                operation = operation.as_str(),
                user_id = %user_id,
                "authentication completed after the session changed; discarding"
            );
            // Either signed out meanwhile or a newer attempt is waiting on
            // `auth_lock` and will establish its own session.
            if let Err(error) = self.auth.invalidate_session().await {
                warn!(%error, "failed to drop late remote session");
            }
            return Err(ControllerError::SessionChanged);
        }

        info!(operation = operation.as_str(), user_id = %user_id, "signed in");
        self.publish(ControllerEvent::SessionChanged {
            phase: SessionPhase::SignedIn,
            user_id: Some(user_id.clone()),
        });
        Ok(user_id)
    }

    async fn read_events(
        &self,
        operation: Operation,
        user_id: &UserId,
    ) -> Result<Option<Node>, ControllerError> {
        let path = StorePath::user_events(user_id);
        let store = &self.store;
        let path_ref = &path;
        with_retry(&self.settings.retry, operation, || async move {
            store
                .read_subtree(path_ref)
                .await
                .map_err(ControllerError::from)
        })
        .await
    }

    fn require_user(&self, operation: Operation) -> Result<(UserId, u64), ControllerError> {
        let current = {
            let state = self.state.borrow();
            match (&state.phase, &state.user_id) {
                (SessionPhase::SignedIn, Some(user_id)) => Some((user_id.clone(), state.epoch)),
                _ => None,
            }
        };
        current.ok_or_else(|| self.record_failure(operation, None, ControllerError::NotSignedIn))
    }

    /// Logs and publishes a failure. `epoch` is set for operations tied to a
    /// session; their failures are not recorded once the session moved on.
    fn record_failure(
        &self,
        operation: Operation,
        epoch: Option<u64>,
        error: ControllerError,
    ) -> ControllerError {
        warn!(operation = operation.as_str(), %error, "operation failed");
        let failure = OperationError {
            operation,
            error: error.clone(),
        };

        let mut settled = None;
        self.state.send_if_modified(|state| {
            if let Some(epoch) = epoch {
                if state.epoch != epoch {
                    return false;
                }
                if state.phase == SessionPhase::Pending {
                    state.phase = state.settled_phase();
                    settled = Some((state.phase, state.user_id.clone()));
                }
            }
            state.last_error = Some(failure.clone());
            true
        });

        if let Some((phase, user_id)) = settled {
            self.publish(ControllerEvent::SessionChanged { phase, user_id });
        }
        self.publish(ControllerEvent::Error(failure));
        error
    }

    fn clear_error(&self) {
        self.state.send_if_modified(|state| state.last_error.take().is_some());
    }

    fn publish(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
