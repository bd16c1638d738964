use std::{fmt, io, sync::mpsc::SendError};

use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;

#[cfg(feature = "service")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};

/// Operational failures of the compiler and its services.
///
/// Problems found in user documents are never reported through this type; they are
/// collected as [`crate::codec::Diagnostic`]s instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum WeaveError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Service error: {0}")]
    Service(String),
    #[error("Watcher error: {0}")]
    Watch(String),
}

impl From<toml::de::Error> for WeaveError {
    fn from(src: toml::de::Error) -> WeaveError {
        WeaveError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<JsonError> for WeaveError {
    fn from(src: JsonError) -> WeaveError {
        WeaveError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<serde_yaml::Error> for WeaveError {
    fn from(src: serde_yaml::Error) -> WeaveError {
        WeaveError::Serialization(format!("YAML deserialization error: {src}"))
    }
}

impl From<io::Error> for WeaveError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => WeaveError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => WeaveError::PermissionDenied(format!("{x}")),
            _ => WeaveError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl<T: fmt::Debug> From<SendError<T>> for WeaveError {
    fn from(x: SendError<T>) -> Self {
        WeaveError::Service(format!(
            "Channel send error, receiver dropped before message {:?}",
            x.0
        ))
    }
}

#[cfg(feature = "service")]
impl From<NotifyError> for WeaveError {
    fn from(notify_error: NotifyError) -> Self {
        match notify_error.kind {
            NotifyErrorKind::Generic(msg) => WeaveError::Watch(format!(
                "notify-debouncer: {}, paths: {:?}",
                msg, notify_error.paths
            )),
            NotifyErrorKind::Io(io_error) => WeaveError::Io(format!(
                "notify-debouncer: io error {}, paths: {:?}",
                io_error.kind(),
                notify_error.paths
            )),
            NotifyErrorKind::PathNotFound => WeaveError::NotFound(format!(
                "notify-debouncer: path(s) not found: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::WatchNotFound => WeaveError::NotFound(format!(
                "notify-debouncer: watch not found, paths: {:?}",
                notify_error.paths
            )),
            NotifyErrorKind::InvalidConfig(_) => {
                WeaveError::Config("notify-debouncer invalid config".to_string())
            }
            NotifyErrorKind::MaxFilesWatch => {
                WeaveError::Watch("notify-debouncer max file watch limit reached".to_string())
            }
        }
    }
}
