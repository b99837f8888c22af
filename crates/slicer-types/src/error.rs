use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::{borrow::Cow, error::Error as StdError};

/// Information reported to the health/termination channel on error.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub message: String,
    /// Error code is a string that specifies this error type.
    pub error_code: Cow<'static, str>,
    /// Detailed error metadata.
    /// The contents of this field is determined by `error_code`.
    pub details: JsonValue,
}

/// Error trait which engine errors must implement such that they can be
/// transformed into a complete JSON error report.
pub trait DetailedError: StdError + Serialize {
    /// Identifying name of the error.
    fn error_code(&self) -> Cow<'static, str>;

    /// Whether the error only affects a single window.  Such errors are
    /// reported but do not stop the pipeline.
    fn is_window_local(&self) -> bool {
        false
    }
}

impl<E> From<&E> for ErrorResponse
where
    E: DetailedError,
{
    /// Transform the detailed error into a complete JSON error report.
    /// - The message is retrieved using `to_string()`.
    /// - The details are retrieved by serializing to JSON.
    fn from(error: &E) -> ErrorResponse {
        Self::from_error(error)
    }
}

impl ErrorResponse {
    pub fn from_error<E>(error: &E) -> Self
    where
        E: DetailedError,
    {
        let response = Self::from_error_nolog(error);

        // Window-local errors are expected under backpressure or stalled
        // origins; anything else is a defect in the surrounding pipeline.
        if error.is_window_local() {
            info!(
                "[window error] {}: {}",
                response.error_code, response.message
            );
        } else {
            error!(
                "[pipeline error] {}: {}",
                response.error_code, response.message
            );
        }

        response
    }

    pub fn from_error_nolog<E>(error: &E) -> Self
    where
        E: DetailedError,
    {
        let message = error.to_string();
        let error_code = error.error_code();
        let details = serde_json::to_value(error).unwrap_or_else(|e| {
            JsonValue::String(format!("Failed to serialize error. Details: '{e}'"))
        });

        Self {
            message,
            error_code,
            details,
        }
    }
}
