use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::render::RequestStatus;

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("only one destination can be attached to a request at a time")]
    AlreadyFlowing,

    #[error("request has already terminated with status {0}")]
    AlreadyTerminated(RequestStatus),

    #[error("request still has {0} pending tasks; abort it or wait for completion first")]
    WorkOutstanding(usize),

    #[error("request output has already been closed")]
    Closed,

    #[error("the render driver has shut down")]
    DriverGone,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorMetadata {
    pub code: String,
    pub details: Option<FxHashMap<String, String>>,
    pub source: Option<String>,
    #[serde(skip)]
    pub error_source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Clone for ErrorMetadata {
    fn clone(&self) -> Self {
        Self {
            code: self.code.clone(),
            details: self.details.clone(),
            source: self.source.clone(),
            error_source: None,
        }
    }
}

impl PartialEq for ErrorMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.details == other.details && self.source == other.source
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RillError {
    Render(String, Option<ErrorMetadata>),
    Aborted(String, Option<ErrorMetadata>),
    Destination(String, Option<ErrorMetadata>),
    Usage(String, Option<ErrorMetadata>),
    Postponed(String, Option<ErrorMetadata>),
    Configuration(String, Option<ErrorMetadata>),
    Serialization(String, Option<ErrorMetadata>),
    Deserialization(String, Option<ErrorMetadata>),
    IoError(String, Option<ErrorMetadata>),
    Internal(String, Option<ErrorMetadata>),
}

impl std::fmt::Display for RillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Render(msg, _) => write!(f, "{msg}"),
            Self::Aborted(msg, _) => write!(f, "Aborted: {msg}"),
            Self::Destination(msg, _) => write!(f, "Destination error: {msg}"),
            Self::Usage(msg, _) => write!(f, "Usage error: {msg}"),
            Self::Postponed(msg, _) => write!(f, "Postponed: {msg}"),
            Self::Configuration(msg, _) => write!(f, "Configuration error: {msg}"),
            Self::Serialization(msg, _) => write!(f, "Serialization error: {msg}"),
            Self::Deserialization(msg, _) => write!(f, "Deserialization error: {msg}"),
            Self::IoError(msg, _) => write!(f, "I/O error: {msg}"),
            Self::Internal(msg, _) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.metadata()
            .and_then(|meta| meta.error_source.as_ref())
            .map(|source| source.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl RillError {
    pub fn message(&self) -> String {
        match self {
            Self::Render(msg, _)
            | Self::Aborted(msg, _)
            | Self::Destination(msg, _)
            | Self::Usage(msg, _)
            | Self::Postponed(msg, _)
            | Self::Configuration(msg, _)
            | Self::Serialization(msg, _)
            | Self::Deserialization(msg, _)
            | Self::IoError(msg, _)
            | Self::Internal(msg, _) => msg.clone(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Render(_, _) => "RENDER_ERROR",
            Self::Aborted(_, _) => "ABORTED",
            Self::Destination(_, _) => "DESTINATION_ERROR",
            Self::Usage(_, _) => "USAGE_ERROR",
            Self::Postponed(_, _) => "POSTPONED",
            Self::Configuration(_, _) => "CONFIGURATION_ERROR",
            Self::Serialization(_, _) => "SERIALIZATION_ERROR",
            Self::Deserialization(_, _) => "DESERIALIZATION_ERROR",
            Self::IoError(_, _) => "IO_ERROR",
            Self::Internal(_, _) => "INTERNAL",
        }
    }

    fn metadata(&self) -> Option<&ErrorMetadata> {
        match self {
            Self::Render(_, meta)
            | Self::Aborted(_, meta)
            | Self::Destination(_, meta)
            | Self::Usage(_, meta)
            | Self::Postponed(_, meta)
            | Self::Configuration(_, meta)
            | Self::Serialization(_, meta)
            | Self::Deserialization(_, meta)
            | Self::IoError(_, meta)
            | Self::Internal(_, meta) => meta.as_ref(),
        }
    }

    fn metadata_mut(&mut self) -> &mut Option<ErrorMetadata> {
        match self {
            Self::Render(_, meta)
            | Self::Aborted(_, meta)
            | Self::Destination(_, meta)
            | Self::Usage(_, meta)
            | Self::Postponed(_, meta)
            | Self::Configuration(_, meta)
            | Self::Serialization(_, meta)
            | Self::Deserialization(_, meta)
            | Self::IoError(_, meta)
            | Self::Internal(_, meta) => meta,
        }
    }

    pub fn render(message: impl Into<String>) -> Self {
        Self::Render(message.into(), None)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted(message.into(), None)
    }

    pub fn destination(message: impl Into<String>) -> Self {
        Self::Destination(message.into(), None)
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into(), None)
    }

    pub fn postponed(message: impl Into<String>) -> Self {
        Self::Postponed(message.into(), None)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into(), None)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into(), None)
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into(), None)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::IoError(message.into(), None)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into(), None)
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_, _))
    }

    pub fn with_source(mut self, source: Box<dyn std::error::Error + Send + Sync>) -> Self {
        let code = self.code().to_string();
        let metadata = self.metadata_mut();
        let mut new_meta = metadata.clone().unwrap_or_else(|| ErrorMetadata {
            code,
            details: Some(FxHashMap::default()),
            source: None,
            error_source: None,
        });
        new_meta.source = Some(source.to_string());
        new_meta.error_source = Some(source);
        *metadata = Some(new_meta);
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.set_property(key, value);
        self
    }

    pub fn set_property(&mut self, key: &str, value: &str) {
        let code = self.code().to_string();
        let metadata = self.metadata_mut();
        if metadata.is_none() {
            *metadata = Some(ErrorMetadata {
                code,
                details: Some(FxHashMap::default()),
                source: None,
                error_source: None,
            });
        }

        if let Some(meta) = metadata {
            if meta.details.is_none() {
                meta.details = Some(FxHashMap::default());
            }
            if let Some(details) = &mut meta.details {
                details.insert(key.to_string(), value.to_string());
            }
        }
    }

    pub fn get_property(&self, key: &str) -> Option<&str> {
        self.metadata()
            .and_then(|meta| meta.details.as_ref())
            .and_then(|details| details.get(key))
            .map(String::as_str)
    }
}

impl From<UsageError> for RillError {
    fn from(error: UsageError) -> Self {
        Self::Usage(
            error.to_string(),
            Some(ErrorMetadata {
                code: "USAGE_ERROR".to_string(),
                details: None,
                source: Some("rill::UsageError".to_string()),
                error_source: Some(Box::new(error)),
            }),
        )
    }
}

impl From<std::io::Error> for RillError {
    fn from(error: std::io::Error) -> Self {
        Self::IoError(
            error.to_string(),
            Some(ErrorMetadata {
                code: "IO_ERROR".to_string(),
                details: None,
                source: Some("std::io::Error".to_string()),
                error_source: None,
            }),
        )
    }
}

impl From<serde_json::Error> for RillError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(
            error.to_string(),
            Some(ErrorMetadata {
                code: "JSON_ERROR".to_string(),
                details: None,
                source: Some("serde_json".to_string()),
                error_source: None,
            }),
        )
    }
}

impl From<crate::config::ConfigError> for RillError {
    fn from(error: crate::config::ConfigError) -> Self {
        Self::Configuration(error.to_string(), None)
    }
}

impl From<String> for RillError {
    fn from(error: String) -> Self {
        Self::Render(error, None)
    }
}

impl From<&str> for RillError {
    fn from(error: &str) -> Self {
        Self::Render(error.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_error_conversion() {
        let error: RillError = UsageError::AlreadyFlowing.into();

        assert!(error.is_usage());
        assert_eq!(error.code(), "USAGE_ERROR");
        assert!(error.message().contains("only one destination"));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_clone_drops_boxed_source() {
        let error = RillError::render("boom")
            .with_source(Box::new(std::io::Error::other("disk gone")));
        assert!(std::error::Error::source(&error).is_some());

        let cloned = error.clone();
        assert!(std::error::Error::source(&cloned).is_none());
        assert_eq!(cloned, error);
    }

    #[test]
    fn test_properties_round_trip() {
        let mut error = RillError::aborted("timeout").with_property("boundary", "3");
        error.set_property("reason", "deadline");

        assert_eq!(error.get_property("boundary"), Some("3"));
        assert_eq!(error.get_property("reason"), Some("deadline"));
        assert_eq!(error.get_property("missing"), None);
    }

    #[test]
    fn test_display_prefixes() {
        assert_eq!(RillError::render("bad").to_string(), "bad");
        assert_eq!(RillError::aborted("timeout").to_string(), "Aborted: timeout");
        assert_eq!(
            RillError::destination("closed early").to_string(),
            "Destination error: closed early"
        );
    }

    #[test]
    fn test_serde_skips_boxed_source() {
        let error = RillError::render("boom")
            .with_source(Box::new(std::io::Error::other("inner")))
            .with_property("digest", "abc");

        let json = serde_json::to_string(&error).expect("serialize");
        let decoded: RillError = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(decoded.message(), "boom");
        assert_eq!(decoded.get_property("digest"), Some("abc"));
        assert!(std::error::Error::source(&decoded).is_none());
    }
}
