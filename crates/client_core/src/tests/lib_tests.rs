use super::*;
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use remote_store::InMemoryBackend;
use shared::error::{AuthError, StoreError};
use tokio::sync::Notify;

const EMAIL: &str = "tyler@example.com";
const PASSWORD: &str = "hunter22";

async fn registered_backend() -> Arc<InMemoryBackend> {
    let backend = Arc::new(InMemoryBackend::new());
    backend.register(EMAIL, PASSWORD).await;
    backend
}

fn controller_for(backend: &Arc<InMemoryBackend>) -> Arc<SessionController> {
    SessionController::with_backend(backend.clone(), ControllerSettings::default())
}

/// Holds each call until the test releases it.
struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Notify::new(),
        })
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

struct GatedBackend {
    inner: Arc<InMemoryBackend>,
    auth_gate: Option<Arc<Gate>>,
    read_gate: Option<Arc<Gate>>,
}

#[async_trait]
impl AuthProvider for GatedBackend {
    async fn authenticate(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        if let Some(gate) = &self.auth_gate {
            gate.pass().await;
        }
        self.inner.authenticate(email, password).await
    }

    async fn create_account(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        self.inner.create_account(email, password).await
    }

    async fn invalidate_session(&self) -> Result<(), AuthError> {
        self.inner.invalidate_session().await
    }

    async fn current_user(&self) -> Option<UserId> {
        self.inner.current_user().await
    }
}

#[async_trait]
impl RecordStore for GatedBackend {
    async fn write_record(
        &self,
        path: &StorePath,
        fields: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.inner.write_record(path, fields).await
    }

    async fn read_subtree(&self, path: &StorePath) -> Result<Option<Node>, StoreError> {
        if let Some(gate) = &self.read_gate {
            gate.pass().await;
        }
        self.inner.read_subtree(path).await
    }
}

/// Fails the first `failures` authentications with `error`.
struct FlakyAuth {
    inner: Arc<InMemoryBackend>,
    failures: u32,
    error: AuthError,
    calls: AtomicU32,
}

#[async_trait]
impl AuthProvider for FlakyAuth {
    async fn authenticate(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(self.error.clone());
        }
        self.inner.authenticate(email, password).await
    }

    async fn create_account(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        self.inner.create_account(email, password).await
    }

    async fn invalidate_session(&self) -> Result<(), AuthError> {
        self.inner.invalidate_session().await
    }

    async fn current_user(&self) -> Option<UserId> {
        self.inner.current_user().await
    }
}

fn flaky(inner: &Arc<InMemoryBackend>, failures: u32, error: AuthError) -> Arc<FlakyAuth> {
    Arc::new(FlakyAuth {
        inner: inner.clone(),
        failures,
        error,
        calls: AtomicU32::new(0),
    })
}

#[tokio::test]
async fn starts_signed_out() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    let state = controller.state();
    assert_eq!(state.phase, SessionPhase::SignedOut);
    assert!(state.user_id.is_none());
    assert!(state.posts.is_empty());
    assert!(!controller.signed_in());
}

#[tokio::test]
async fn sign_in_records_user_and_publishes_session_change() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    let mut events = controller.subscribe_events();

    let user_id = controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");

    assert!(controller.signed_in());
    assert_eq!(controller.state().user_id, Some(user_id.clone()));
    match events.recv().await.expect("event") {
        ControllerEvent::SessionChanged { phase, user_id: published } => {
            assert_eq!(phase, SessionPhase::SignedIn);
            assert_eq!(published, Some(user_id));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn failed_sign_in_restores_phase_and_exposes_error() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    let mut events = controller.subscribe_events();

    let err = controller
        .sign_in(EMAIL, "wrong-password")
        .await
        .expect_err("bad password");
    assert_eq!(err, ControllerError::Auth(AuthError::InvalidCredentials));

    let state = controller.state();
    assert_eq!(state.phase, SessionPhase::SignedOut);
    assert!(state.user_id.is_none());
    assert_eq!(
        state.last_error,
        Some(OperationError {
            operation: Operation::SignIn,
            error: ControllerError::Auth(AuthError::InvalidCredentials),
        })
    );

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let ControllerEvent::Error(failure) = event {
            assert_eq!(failure.operation, Operation::SignIn);
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn failed_sign_in_while_signed_in_keeps_current_user() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    let user_id = controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");

    controller
        .sign_in("nobody@example.com", "whatever")
        .await
        .expect_err("unknown account");

    let state = controller.state();
    assert_eq!(state.phase, SessionPhase::SignedIn);
    assert_eq!(state.user_id, Some(user_id));
}

#[tokio::test]
async fn sign_up_creates_account_and_signs_in() {
    let backend = Arc::new(InMemoryBackend::new());
    let controller = controller_for(&backend);

    let user_id = controller
        .sign_up("new@example.com", "longenough")
        .await
        .expect("sign up");

    assert!(controller.signed_in());
    assert!(!user_id.as_str().is_empty());
    assert_eq!(
        controller.sign_up("new@example.com", "longenough").await,
        Err(ControllerError::Auth(AuthError::AccountExists))
    );
}

#[tokio::test]
async fn sign_up_form_defaults_to_sign_in_route() {
    let backend = Arc::new(InMemoryBackend::new());
    let controller = controller_for(&backend);

    let err = controller
        .submit_sign_up_form("new@example.com", "longenough")
        .await
        .expect_err("legacy route only signs in");
    assert_eq!(err, ControllerError::Auth(AuthError::InvalidCredentials));
    assert_eq!(
        controller.state().last_error.map(|failure| failure.operation),
        Some(Operation::SignIn)
    );
}

#[tokio::test]
async fn sign_up_form_can_create_accounts() {
    let backend = Arc::new(InMemoryBackend::new());
    let controller = SessionController::with_backend(
        backend.clone(),
        ControllerSettings {
            sign_up_route: SignUpRoute::CreateAccount,
            ..ControllerSettings::default()
        },
    );

    controller
        .submit_sign_up_form("new@example.com", "longenough")
        .await
        .expect("account created");
    assert!(controller.signed_in());
}

#[tokio::test]
async fn sign_out_clears_posts_and_user() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");
    controller
        .create_event("Gym", "Leg day", "09:00", "10:00")
        .await
        .expect("create");
    controller.display_posts().await.expect("posts");
    assert!(!controller.posts().is_empty());

    controller.sign_out().await;

    let state = controller.state();
    assert_eq!(state.phase, SessionPhase::SignedOut);
    assert!(state.user_id.is_none());
    assert!(state.posts.is_empty());
    assert_eq!(backend.current_user().await, None);
}

#[tokio::test]
async fn remote_sign_out_failure_is_ignored() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");
    backend
        .fail_next_sign_out(AuthError::Network("down".into()))
        .await;

    controller.sign_out().await;

    let state = controller.state();
    assert_eq!(state.phase, SessionPhase::SignedOut);
    assert!(state.last_error.is_none());
}

#[tokio::test]
async fn sign_out_wins_over_pending_sign_in() {
    let inner = registered_backend().await;
    let gate = Gate::new();
    let backend = Arc::new(GatedBackend {
        inner: inner.clone(),
        auth_gate: Some(gate.clone()),
        read_gate: None,
    });
    let controller = SessionController::with_backend(backend, ControllerSettings::default());

    let pending = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.sign_in(EMAIL, PASSWORD).await })
    };
    gate.entered.notified().await;
    assert_eq!(controller.state().phase, SessionPhase::Pending);

    controller.sign_out().await;
    gate.release.notify_one();

    let result = pending.await.expect("join");
    assert_eq!(result, Err(ControllerError::SessionChanged));
    let state = controller.state();
    assert_eq!(state.phase, SessionPhase::SignedOut);
    assert!(state.user_id.is_none());
    assert_eq!(inner.current_user().await, None);
}

#[tokio::test]
async fn newer_sign_in_owns_provider_session_when_older_lands_late() {
    let inner = registered_backend().await;
    inner.register("casey@example.com", "swordfish").await;
    let gate = Gate::new();
    let backend = Arc::new(GatedBackend {
        inner: inner.clone(),
        auth_gate: Some(gate.clone()),
        read_gate: None,
    });
    let controller = SessionController::with_backend(backend, ControllerSettings::default());
    let mut states = controller.subscribe_state();

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.sign_in(EMAIL, PASSWORD).await })
    };
    gate.entered.notified().await;
    let second = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.sign_in("casey@example.com", "swordfish").await })
    };
    states
        .wait_for(|state| state.epoch == 2)
        .await
        .expect("second sign-in started");

    gate.release.notify_one();
    assert_eq!(
        first.await.expect("join"),
        Err(ControllerError::SessionChanged)
    );
    gate.entered.notified().await;
    gate.release.notify_one();
    let casey = second.await.expect("join").expect("second sign in");

    assert_eq!(controller.state().user_id, Some(casey.clone()));
    assert_eq!(inner.current_user().await, Some(casey));
    controller
        .create_event("Swim", "Laps", "06:00", "07:00")
        .await
        .expect("write as the newer user");
    assert_eq!(
        controller.display_posts().await.expect("posts"),
        vec!["Laps".to_string(), "07:00".to_string(), "06:00".to_string()]
    );
}

#[tokio::test]
async fn sign_out_discards_posts_read_in_flight() {
    let inner = registered_backend().await;
    let gate = Gate::new();
    let backend = Arc::new(GatedBackend {
        inner: inner.clone(),
        auth_gate: None,
        read_gate: Some(gate.clone()),
    });
    let controller = SessionController::with_backend(backend, ControllerSettings::default());
    controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");
    controller
        .create_event("Gym", "Leg day", "09:00", "10:00")
        .await
        .expect("create");

    let pending = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.display_posts().await })
    };
    gate.entered.notified().await;
    controller.sign_out().await;
    gate.release.notify_one();

    // The gated read runs after sign-out, so it may also be denied remotely.
    assert!(pending.await.expect("join").is_err());
    assert!(controller.posts().is_empty());
    assert_eq!(controller.state().phase, SessionPhase::SignedOut);
}

#[tokio::test]
async fn operations_require_sign_in() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);

    assert_eq!(
        controller.create_event("Gym", "d", "s", "e").await,
        Err(ControllerError::NotSignedIn)
    );
    assert_eq!(
        controller.display_posts().await,
        Err(ControllerError::NotSignedIn)
    );
    assert_eq!(
        controller.list_events().await,
        Err(ControllerError::NotSignedIn)
    );
    assert_eq!(
        controller.state().last_error.map(|failure| failure.operation),
        Some(Operation::ListEvents)
    );
}

#[tokio::test]
async fn write_failure_is_surfaced_and_cleared_by_next_success() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");
    backend
        .fail_next_write(StoreError::WriteFailed("quota".into()))
        .await;

    let err = controller
        .create_event("Gym", "Leg day", "09:00", "10:00")
        .await
        .expect_err("write fails");
    assert_eq!(
        err,
        ControllerError::Store(StoreError::WriteFailed("quota".into()))
    );
    assert_eq!(
        controller.state().last_error.map(|failure| failure.operation),
        Some(Operation::CreateEvent)
    );

    controller
        .create_event("Gym", "Leg day", "09:00", "10:00")
        .await
        .expect("second write");
    assert!(controller.state().last_error.is_none());
}

#[tokio::test]
async fn read_failure_keeps_previous_posts() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");
    controller
        .create_event("Gym", "Leg day", "09:00", "10:00")
        .await
        .expect("create");
    let before = controller.display_posts().await.expect("posts");

    backend
        .fail_next_read(StoreError::ReadFailed("timeout".into()))
        .await;
    controller.display_posts().await.expect_err("read fails");

    assert_eq!(controller.posts(), before);
    assert!(controller.state().last_error.is_some());
}

#[tokio::test]
async fn display_posts_rebuilds_after_new_events() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");
    controller
        .create_event("Gym", "Leg day", "09:00", "10:00")
        .await
        .expect("gym");
    controller.display_posts().await.expect("first");

    controller
        .create_event("Gym", "Arms", "18:00", "19:00")
        .await
        .expect("overwrite");
    let posts = controller.display_posts().await.expect("second");

    assert_eq!(posts, vec!["Arms", "19:00", "18:00"]);
}

#[tokio::test]
async fn list_events_returns_structured_records() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");
    controller
        .create_event("Run", "5k", "07:00", "07:30")
        .await
        .expect("run");
    controller
        .create_event("Gym", "Leg day", "09:00", "10:00")
        .await
        .expect("gym");

    let events = controller.list_events().await.expect("events");
    assert_eq!(
        events,
        vec![
            Event::new("Gym", "Leg day", "09:00", "10:00"),
            Event::new("Run", "5k", "07:00", "07:30"),
        ]
    );
    assert!(controller.posts().is_empty());
}

#[tokio::test]
async fn resume_adopts_provider_session() {
    let backend = registered_backend().await;
    let user_id = backend.authenticate(EMAIL, PASSWORD).await.expect("remote sign in");
    let controller = controller_for(&backend);

    assert_eq!(controller.resume().await, SessionPhase::SignedIn);
    assert_eq!(controller.state().user_id, Some(user_id));
}

#[tokio::test]
async fn resume_clears_previous_failure() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    assert!(controller.sign_in(EMAIL, "wrong-password").await.is_err());
    assert!(controller.state().last_error.is_some());

    backend.authenticate(EMAIL, PASSWORD).await.expect("remote sign in");
    assert_eq!(controller.resume().await, SessionPhase::SignedIn);
    assert!(controller.state().last_error.is_none());
}

#[tokio::test]
async fn resume_without_provider_session_stays_signed_out() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    assert_eq!(controller.resume().await, SessionPhase::SignedOut);
}

#[tokio::test]
async fn transient_failures_are_not_retried_by_default() {
    let inner = registered_backend().await;
    let auth = flaky(&inner, 1, AuthError::Network("reset".into()));
    let controller =
        SessionController::new(auth.clone(), inner.clone(), ControllerSettings::default());

    let err = controller.sign_in(EMAIL, PASSWORD).await.expect_err("one attempt");
    assert!(err.is_transient());
    assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_policy_retries_transient_failures() {
    let inner = registered_backend().await;
    let auth = flaky(&inner, 2, AuthError::Network("reset".into()));
    let controller = SessionController::new(
        auth.clone(),
        inner.clone(),
        ControllerSettings {
            retry: RetryPolicy::attempts(3, Duration::from_millis(1)),
            ..ControllerSettings::default()
        },
    );

    controller.sign_in(EMAIL, PASSWORD).await.expect("third attempt");
    assert_eq!(auth.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_policy_skips_permanent_failures() {
    let inner = registered_backend().await;
    let auth = flaky(&inner, 1, AuthError::InvalidCredentials);
    let controller = SessionController::new(
        auth.clone(),
        inner.clone(),
        ControllerSettings {
            retry: RetryPolicy::attempts(5, Duration::ZERO),
            ..ControllerSettings::default()
        },
    );

    controller.sign_in(EMAIL, PASSWORD).await.expect_err("not retried");
    assert_eq!(auth.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn state_stream_yields_current_then_changes() {
    let backend = registered_backend().await;
    let controller = controller_for(&backend);
    let mut stream = Box::pin(controller.state_stream());

    let first = stream.next().await.expect("initial");
    assert_eq!(first.phase, SessionPhase::SignedOut);

    controller.sign_in(EMAIL, PASSWORD).await.expect("sign in");
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("change published")
        .expect("state");
    assert_eq!(next.phase, SessionPhase::SignedIn);
}

#[test]
fn flatten_posts_dedups_across_events_and_fields() {
    let snapshot = Node::Branch(BTreeMap::from([
        (
            "A".to_string(),
            Node::from_fields(Event::new("A", "same", "09:00", "10:00").fields()),
        ),
        (
            "B".to_string(),
            Node::from_fields(Event::new("B", "09:00", "same", "11:00").fields()),
        ),
        ("loose".to_string(), Node::Value("ignored".into())),
    ]));

    assert_eq!(
        flatten_posts(Some(&snapshot)),
        vec!["same", "10:00", "09:00", "11:00"]
    );
    assert!(flatten_posts(None).is_empty());
}

#[test]
fn sign_up_route_parses_config_values() {
    assert_eq!("create_account".parse(), Ok(SignUpRoute::CreateAccount));
    assert_eq!("Sign-In".parse(), Ok(SignUpRoute::SignIn));
    assert!("maybe".parse::<SignUpRoute>().is_err());
}
