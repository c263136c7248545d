//! Wire types for the hosted identity-toolkit REST surface.

use serde::{Deserialize, Serialize};

pub const SIGN_IN_ACTION: &str = "accounts:signInWithPassword";
pub const SIGN_UP_ACTION: &str = "accounts:signUp";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordAuthRequest {
    pub email: String,
    pub password: String,
    pub return_secure_token: bool,
}

impl PasswordAuthRequest {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            return_secure_token: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordAuthResponse {
    pub local_id: String,
    pub id_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub expires_in: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceErrorEnvelope {
    pub error: ServiceErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceErrorBody {
    #[serde(default)]
    pub code: Option<u16>,
    pub message: String,
}

impl ServiceErrorEnvelope {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            error: ServiceErrorBody {
                code: Some(code),
                message: message.into(),
            },
        }
    }
}
