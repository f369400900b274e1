use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::models::generate_id;

#[derive(Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct ProxyConfig {
    pub id: String,
    pub scheme: String,
    pub host: String,
    pub port: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub enabled: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub failure_count: i64,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl ProxyConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            id: generate_id(),
            scheme: "http".to_string(),
            host: host.to_string(),
            port: port as i64,
            username: None,
            password: None,
            enabled: true,
            last_used: None,
            last_success: None,
            failure_count: 0,
            disabled_at: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Proxy URL including credentials, suitable for `reqwest::Proxy::all`.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{}://{}:{}@{}:{}", self.scheme, user, pass, self.host, self.port)
            }
            (Some(user), None) => format!("{}://{}@{}:{}", self.scheme, user, self.host, self.port),
            _ => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

// Never print credentials into logs.
impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("id", &self.id)
            .field("endpoint", &self.to_string())
            .field("enabled", &self.enabled)
            .field("failure_count", &self.failure_count)
            .finish()
    }
}
