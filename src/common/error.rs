//! Error types for the harness
//!
//! Every failure a test can observe is a variant of [`Error`]. Driver and
//! server implementations translate their transport-specific failures into
//! these variants so sessions and the waiter never see foreign error types.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // === Registry Errors ===
    #[error("Invalid registration: {0}")]
    Configuration(String),

    #[error("{0}")]
    Argument(String),

    #[error(
        "No driver called '{name}' was found. Register it with Registry::register_driver first"
    )]
    DriverNotFound { name: String },

    #[error(
        "No server called '{name}' was found. Register it with Registry::register_server first"
    )]
    ServerNotFound { name: String },

    // === Driver Errors ===
    #[error("Driver '{driver}' failed to {operation}: {message}")]
    DriverOperation {
        driver: String,
        operation: &'static str,
        message: String,
    },

    #[error("Driver '{driver}' does not support {operation}")]
    NotSupported {
        driver: String,
        operation: &'static str,
    },

    // === Server Errors ===
    #[error("Server '{name}' failed to start on {address}: {reason}")]
    ServerStartup {
        name: String,
        address: String,
        reason: String,
    },

    // === Wait Errors ===
    #[error("Timed out after {waited:?} ({attempts} attempts): {last}")]
    WaitTimeout {
        waited: Duration,
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    #[error("Wait cancelled after {waited:?}")]
    WaitCancelled { waited: Duration },

    #[error("{0}")]
    ExpectationNotMet(String),

    // === Configuration File Errors ===
    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an argument error
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(message.into())
    }

    /// Create an argument error for a setting that expects a url
    pub fn invalid_url(setting: &str) -> Self {
        Self::argument(format!(
            "{} should be set to a url (http://www.example.com)",
            setting
        ))
    }

    /// Wrap a transport failure raised by a driver
    pub fn driver_operation(driver: &str, operation: &'static str, message: impl ToString) -> Self {
        Self::DriverOperation {
            driver: driver.to_string(),
            operation,
            message: message.to_string(),
        }
    }

    /// Create a not supported error
    pub fn not_supported(driver: &str, operation: &'static str) -> Self {
        Self::NotSupported {
            driver: driver.to_string(),
            operation,
        }
    }

    /// Create a server startup error
    pub fn server_startup(name: &str, address: &str, reason: impl ToString) -> Self {
        Self::ServerStartup {
            name: name.to_string(),
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this is a wait deadline expiry
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout { .. })
    }

    /// The last not-yet reason carried by a wait timeout
    pub fn last_reason(&self) -> Option<&Error> {
        match self {
            Self::WaitTimeout { last, .. } => Some(last),
            _ => None,
        }
    }
}
