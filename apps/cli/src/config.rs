use std::{collections::HashMap, fs, path::Path, time::Duration};

use client_core::{ControllerSettings, RetryPolicy, SignUpRoute};
use remote_store::{HttpBackendConfig, DEFAULT_AUTH_URL};
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "motivity.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub auth_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub sign_up_route: SignUpRoute,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "http://127.0.0.1:9000".into(),
            auth_url: DEFAULT_AUTH_URL.into(),
            api_key: String::new(),
            request_timeout_secs: 30,
            retry_max_attempts: 1,
            retry_backoff_ms: 500,
            sign_up_route: SignUpRoute::default(),
        }
    }
}

impl Settings {
    pub fn backend_config(&self) -> HttpBackendConfig {
        HttpBackendConfig {
            database_url: self.database_url.clone(),
            auth_url: self.auth_url.clone(),
            api_key: self.api_key.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            retry: RetryPolicy::attempts(
                self.retry_max_attempts,
                Duration::from_millis(self.retry_backoff_ms),
            ),
            sign_up_route: self.sign_up_route,
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "database_url" => self.database_url = value.to_string(),
            "auth_url" => self.auth_url = value.to_string(),
            "api_key" => self.api_key = value.to_string(),
            "request_timeout_secs" => {
                if let Ok(parsed) = value.parse() {
                    self.request_timeout_secs = parsed;
                }
            }
            "retry_max_attempts" => {
                if let Ok(parsed) = value.parse() {
                    self.retry_max_attempts = parsed;
                }
            }
            "retry_backoff_ms" => {
                if let Ok(parsed) = value.parse() {
                    self.retry_backoff_ms = parsed;
                }
            }
            "sign_up_route" => match value.parse() {
                Ok(route) => self.sign_up_route = route,
                Err(error) => warn!(%error, "ignoring sign_up_route setting"),
            },
            _ => {}
        }
    }
}

const KEYS: &[&str] = &[
    "database_url",
    "auth_url",
    "api_key",
    "request_timeout_secs",
    "retry_max_attempts",
    "retry_backoff_ms",
    "sign_up_route",
];

pub fn load_settings(path: &Path) -> Settings {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Defaults, then `path` if it parses as a flat TOML table, then
/// `MOTIVITY_<KEY>` and finally `APP__<KEY>` variables.
pub fn load_settings_with(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for key in KEYS {
                    match file_cfg.get(*key) {
                        Some(toml::Value::String(v)) => settings.apply(key, v),
                        Some(toml::Value::Integer(v)) => settings.apply(key, &v.to_string()),
                        _ => {}
                    }
                }
            }
            Err(error) => warn!(path = %path.display(), %error, "ignoring unreadable settings file"),
        }
    }

    for key in KEYS {
        let upper = key.to_ascii_uppercase();
        if let Some(v) = env(&format!("MOTIVITY_{upper}")) {
            settings.apply(key, &v);
        }
        if let Some(v) = env(&format!("APP__{upper}")) {
            settings.apply(key, &v);
        }
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
