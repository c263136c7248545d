use shared::error::{AuthError, StoreError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no user is signed in")]
    NotSignedIn,
    #[error("session changed before the operation completed")]
    SessionChanged,
}

impl ControllerError {
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Auth(error) => error.is_transient(),
            ControllerError::Store(error) => error.is_transient(),
            ControllerError::NotSignedIn | ControllerError::SessionChanged => false,
        }
    }
}
