use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("an account already exists for this email")]
    AccountExists,
    #[error("password rejected: {0}")]
    WeakPassword(String),
    #[error("too many attempts; try again later")]
    RateLimited,
    #[error("auth service unreachable: {0}")]
    Network(String),
    #[error("auth request rejected: {0}")]
    Rejected(String),
}

impl AuthError {
    /// Failures worth another attempt under a retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::Network(_) | AuthError::RateLimited)
    }

    /// Maps an identity-toolkit error message such as `EMAIL_EXISTS` or
    /// `WEAK_PASSWORD : Password should be at least 6 characters`.
    pub fn from_service_message(message: &str) -> Self {
        let (code, detail) = match message.split_once(':') {
            Some((code, detail)) => (code.trim(), detail.trim()),
            None => (message.trim(), ""),
        };
        match code {
            "EMAIL_NOT_FOUND" | "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS"
            | "INVALID_EMAIL" | "USER_DISABLED" => AuthError::InvalidCredentials,
            "EMAIL_EXISTS" => AuthError::AccountExists,
            "WEAK_PASSWORD" => AuthError::WeakPassword(detail.to_string()),
            "TOO_MANY_ATTEMPTS_TRY_LATER" => AuthError::RateLimited,
            _ => AuthError::Rejected(message.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    #[error("database unreachable: {0}")]
    Network(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Network(_))
    }
}
