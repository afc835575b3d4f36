//! Error taxonomy for index automation.
//!
//! Every failure that crosses a component boundary is an [`IndexError`].
//! Variants that originate from a remote call carry an `operation` label
//! (verb plus resource id) so a terminal failure is actionable on its own.
//!
//! | Variant | Retried by | Surfaced as |
//! |---------|-----------|-------------|
//! | [`Transient`](IndexError::Transient) | transport, pipeline | after retries are exhausted |
//! | [`Permanent`](IndexError::Permanent) | nobody | immediately, with remote payload |
//! | [`NotFound`](IndexError::NotFound) | nobody | immediately; callers often treat it as state |
//! | [`SchemaIncompatible`](IndexError::SchemaIncompatible) | nobody | to the reindex decision step |
//! | [`PartialBatch`](IndexError::PartialBatch) | nobody | aggregated into a `BatchResult` |
//! | [`ProviderUnavailable`](IndexError::ProviderUnavailable) | provider retry | per item, or whole batch when all items missed |

use thiserror::Error;

/// Convenience alias used across the library.
pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    /// Network failure, timeout, 429 or 5xx. Safe to retry.
    #[error("{operation}: transient failure{}: {message}", status_suffix(.status))]
    Transient {
        operation: String,
        status: Option<u16>,
        message: String,
    },

    /// The service rejected the request (4xx other than 404 and 429).
    #[error("{operation}: request rejected ({status}): {message}")]
    Permanent {
        operation: String,
        status: u16,
        message: String,
    },

    /// The addressed resource does not exist.
    #[error("{operation}: not found: {message}")]
    NotFound { operation: String, message: String },

    /// The desired schema cannot be applied in place.
    #[error("schema for index '{index}' requires a rebuild: {summary}")]
    SchemaIncompatible { index: String, summary: String },

    /// Some documents in an otherwise successful call failed.
    #[error("{operation}: {failed} of {total} documents failed")]
    PartialBatch {
        operation: String,
        failed: usize,
        total: usize,
    },

    /// The embedding provider failed for a whole batch of cache misses.
    #[error("embedding provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// The service answered with something we could not decode.
    #[error("{operation}: invalid response: {message}")]
    Decode { operation: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" ({})", s),
        None => String::new(),
    }
}

impl IndexError {
    /// Whether a retrying layer may try the same call again.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, IndexError::NotFound { .. })
    }

    /// Classify an HTTP status and response body into an error.
    ///
    /// 429 and 5xx are transient; 404 is [`NotFound`](IndexError::NotFound);
    /// every other status is permanent.
    pub fn from_status(operation: impl Into<String>, status: u16, body: String) -> Self {
        let operation = operation.into();
        let message = remote_message(&body);
        match status {
            429 | 500..=599 => IndexError::Transient {
                operation,
                status: Some(status),
                message,
            },
            404 => IndexError::NotFound { operation, message },
            _ => IndexError::Permanent {
                operation,
                status,
                message,
            },
        }
    }

    /// Replace the operation label with a more specific one.
    ///
    /// Index operations call this so errors name the verb and resource
    /// rather than the raw HTTP method and path.
    pub fn annotate(self, label: impl Into<String>) -> Self {
        let label = label.into();
        match self {
            IndexError::Transient {
                status, message, ..
            } => IndexError::Transient {
                operation: label,
                status,
                message,
            },
            IndexError::Permanent {
                status, message, ..
            } => IndexError::Permanent {
                operation: label,
                status,
                message,
            },
            IndexError::NotFound { message, .. } => IndexError::NotFound {
                operation: label,
                message,
            },
            IndexError::PartialBatch { failed, total, .. } => IndexError::PartialBatch {
                operation: label,
                failed,
                total,
            },
            IndexError::Decode { message, .. } => IndexError::Decode {
                operation: label,
                message,
            },
            other => other,
        }
    }
}

/// Pull the human-readable message out of a remote error payload.
///
/// Search services wrap errors as `{"error":{"code":..,"message":..}}`;
/// anything else is returned verbatim (truncated).
fn remote_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = json
            .pointer("/error/message")
            .and_then(|m| m.as_str())
        {
            let code = json.pointer("/error/code").and_then(|c| c.as_str());
            return match code {
                Some(code) if !code.is_empty() => format!("{}: {}", code, msg),
                _ => msg.to_string(),
            };
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    trimmed.chars().take(512).collect()
}

impl From<reqwest::Error> for IndexError {
    fn from(e: reqwest::Error) -> Self {
        let operation = e
            .url()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "request".to_string());
        if e.is_decode() {
            return IndexError::Decode {
                operation,
                message: e.to_string(),
            };
        }
        IndexError::Transient {
            operation,
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(IndexError::from_status("op", 429, String::new()).is_transient());
        assert!(IndexError::from_status("op", 503, String::new()).is_transient());
        assert!(IndexError::from_status("op", 404, String::new()).is_not_found());
        let err = IndexError::from_status("op", 400, String::new());
        assert!(matches!(err, IndexError::Permanent { status: 400, .. }));
    }

    #[test]
    fn remote_payload_is_attached() {
        let body = r#"{"error":{"code":"InvalidRequestParameter","message":"field 'x' unknown"}}"#;
        let err = IndexError::from_status("create_index(code)", 400, body.to_string());
        assert_eq!(
            err.to_string(),
            "create_index(code): request rejected (400): InvalidRequestParameter: field 'x' unknown"
        );
    }

    #[test]
    fn annotate_keeps_kind() {
        let err = IndexError::from_status("PUT /indexes/a", 503, "busy".into())
            .annotate("create_index(a)");
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("create_index(a): transient failure (503)"));
    }
}
