use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod category;
pub mod product;
pub mod proxy;
pub mod scan_job;

pub use category::*;
pub use product::*;
pub use proxy::*;
pub use scan_job::*;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT")]
pub enum ScanJobStatus {
    #[sqlx(rename = "pending")]
    Pending,
    #[sqlx(rename = "running")]
    Running,
    #[sqlx(rename = "completed")]
    Completed,
    #[sqlx(rename = "failed")]
    Failed,
}

impl ScanJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanJobStatus::Completed | ScanJobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT")]
pub enum ScanTrigger {
    #[sqlx(rename = "scheduled")]
    Scheduled,
    #[sqlx(rename = "manual")]
    Manual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMethod {
    Strikethrough,
    Msrp,
    Combined,
}

/// Failure taxonomy shared by the fetch layer, category cooldowns and
/// structural-failure tracking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Forbidden,
    RateLimited,
    Timeout,
    Connect,
    NotFound,
    Blocked,
    ServerError,
    Other,
}

impl ErrorClass {
    pub const ALL: [ErrorClass; 8] = [
        ErrorClass::Forbidden,
        ErrorClass::RateLimited,
        ErrorClass::Timeout,
        ErrorClass::Connect,
        ErrorClass::NotFound,
        ErrorClass::Blocked,
        ErrorClass::ServerError,
        ErrorClass::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Forbidden => "forbidden",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Connect => "connect",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Blocked => "blocked",
            ErrorClass::ServerError => "server_error",
            ErrorClass::Other => "other",
        }
    }

    /// Stale configuration rather than transient blocking.
    pub fn is_structural(self) -> bool {
        matches!(self, ErrorClass::NotFound)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}
