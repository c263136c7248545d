use std::str::FromStr;

use crate::retry::RetryPolicy;

/// What the "Create Account" confirmation does.
///
/// `SignIn` keeps the long-standing behaviour where the form signs in with
/// the entered credentials instead of creating an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignUpRoute {
    #[default]
    SignIn,
    CreateAccount,
}

impl FromStr for SignUpRoute {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sign_in" | "signin" => Ok(SignUpRoute::SignIn),
            "create_account" | "sign_up" | "signup" => Ok(SignUpRoute::CreateAccount),
            other => Err(format!("unknown sign-up route '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    pub retry: RetryPolicy,
    pub sign_up_route: SignUpRoute,
}
