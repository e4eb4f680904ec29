//! Orchestrator error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Orchestrator error that can be serialized for the API layer.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown variant or malformed request
    InvalidArgument,
    /// Port pool is full
    ResourceExhausted,
    /// Unknown instance id
    NotFound,
    /// Operation not allowed in the current lifecycle state
    InvalidState,
    /// Child process failed its liveness check
    SpawnFailure,
    /// Handshake exhausted every attempt (advisory only)
    ConfigurationDegraded,
    /// Deadline expired or a concurrent stop interrupted the operation
    Cancelled,
    /// External process exceeded its timeout
    Timeout,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Process control error
    Process,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidArgument => 1001,
            Self::ResourceExhausted => 1002,
            Self::NotFound => 1003,
            Self::InvalidState => 1004,
            Self::SpawnFailure => 3001,
            Self::ConfigurationDegraded => 3002,
            Self::Cancelled => 3003,
            Self::Timeout => 3004,
            Self::Process => 3005,
            Self::Config => 2001,
            Self::Io => 2002,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn invalid_variant(variant: &str) -> Self {
        Self::new(
            ErrorKind::InvalidArgument,
            HashMap::from([("variant".to_string(), variant.to_string())]),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::InvalidArgument, message)
    }

    pub fn resource_exhausted(max_instances: usize) -> Self {
        Self::new(
            ErrorKind::ResourceExhausted,
            HashMap::from([("max_instances".to_string(), max_instances.to_string())]),
        )
    }

    pub fn instance_not_found(id: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::NotFound,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn invalid_state(id: impl fmt::Display, state: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::InvalidState,
            HashMap::from([
                ("id".to_string(), id.to_string()),
                ("state".to_string(), state.to_string()),
            ]),
        )
    }

    pub fn spawn_failure(label: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::SpawnFailure,
            HashMap::from([
                ("process".to_string(), label.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn configuration_degraded(attempts: u32) -> Self {
        Self::new(
            ErrorKind::ConfigurationDegraded,
            HashMap::from([("attempts".to_string(), attempts.to_string())]),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, HashMap::new())
    }

    pub fn timeout(what: &str, secs: f64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            HashMap::from([
                ("operation".to_string(), what.to_string()),
                ("seconds".to_string(), format!("{secs:.1}")),
            ]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self) -> &HashMap<String, String> {
        &self.payload
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 3)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_sorts_payload_keys() {
        let err = AppError::invalid_state("instance_1", "running");
        assert_eq!(
            err.to_string(),
            "InvalidState: id=instance_1, state=running"
        );
    }

    #[test]
    fn serializes_code_and_payload() {
        let err = AppError::resource_exhausted(10);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], 1002);
        assert_eq!(value["kind"], "resource_exhausted");
        assert_eq!(value["payload"]["max_instances"], "10");
    }

    #[test]
    fn empty_detail_leaves_payload_empty() {
        let err = AppError::process("");
        assert!(err.payload().is_empty());
        assert_eq!(err.to_string(), "Process");
    }
}
