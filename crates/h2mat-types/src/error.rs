use serde::Serialize;
use serde_json::Value as JsonValue;
use std::{borrow::Cow, error::Error as StdError};

/// Error trait which engine errors implement so that they can be rendered
/// into a uniform report: a stable machine-readable code, a human-readable
/// message, and serialized details.
pub trait DetailedError: StdError + Serialize {
    /// Identifying name of the error.
    fn error_code(&self) -> Cow<'static, str>;
}

/// Uniform error report assembled from any [`DetailedError`].
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ErrorDetail {
    /// Human-readable error message.
    pub message: String,
    /// Error code is a string that specifies this error type.
    pub error_code: Cow<'static, str>,
    /// Detailed error metadata, determined by `error_code`.
    pub details: JsonValue,
}

impl<E> From<&E> for ErrorDetail
where
    E: DetailedError,
{
    fn from(error: &E) -> ErrorDetail {
        let details = serde_json::to_value(error).unwrap_or_else(|e| {
            JsonValue::String(format!("Failed to serialize error. Details: '{e}'"))
        });
        Self {
            message: error.to_string(),
            error_code: error.error_code(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error as ThisError;

    #[derive(Debug, Serialize, ThisError)]
    enum TestError {
        #[error("widget {index} is missing")]
        MissingWidget { index: usize },
    }

    impl DetailedError for TestError {
        fn error_code(&self) -> Cow<'static, str> {
            match self {
                Self::MissingWidget { .. } => Cow::from("MissingWidget"),
            }
        }
    }

    #[test]
    fn report_carries_code_and_message() {
        let report = ErrorDetail::from(&TestError::MissingWidget { index: 7 });
        assert_eq!(report.error_code, "MissingWidget");
        assert_eq!(report.message, "widget 7 is missing");
        assert_eq!(report.details["MissingWidget"]["index"], 7);
    }
}
