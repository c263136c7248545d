//! Observable session state published by [`crate::SessionController`].

use std::fmt;

use shared::domain::UserId;

use crate::error::ControllerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    SignedOut,
    /// A sign-in or sign-up request is in flight.
    Pending,
    SignedIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    SignIn,
    SignUp,
    CreateEvent,
    DisplayPosts,
    ListEvents,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::SignIn => "sign_in",
            Operation::SignUp => "sign_up",
            Operation::CreateEvent => "create_event",
            Operation::DisplayPosts => "display_posts",
            Operation::ListEvents => "list_events",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub operation: Operation,
    pub error: ControllerError,
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub user_id: Option<UserId>,
    /// Distinct field values from the user's events, in enumeration order.
    pub posts: Vec<String>,
    pub last_error: Option<OperationError>,
    pub(crate) epoch: u64,
}

impl SessionState {
    pub fn signed_in(&self) -> bool {
        self.phase == SessionPhase::SignedIn
    }

    pub(crate) fn settled_phase(&self) -> SessionPhase {
        if self.user_id.is_some() {
            SessionPhase::SignedIn
        } else {
            SessionPhase::SignedOut
        }
    }
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    SessionChanged {
        phase: SessionPhase,
        user_id: Option<UserId>,
    },
    PostsUpdated(Vec<String>),
    EventWritten {
        name: String,
    },
    Error(OperationError),
}
