use std::fmt;

/// Errors surfaced by the LM backend client.
///
/// `ContextLengthExceeded` is split out from the general `BadRequest` variant
/// (rather than left for callers to string-sniff the provider's error body)
/// so the research orchestrator can branch on it directly, per the
/// exception-free control-flow design note.
#[derive(Debug)]
pub enum LLMError {
    /// Connection refused, timed out, or the backend returned 5xx.
    Unavailable(String),
    /// Backend returned 4xx for a reason other than context length.
    BadRequest(String),
    /// Backend rejected the request because the prompt exceeded its context window.
    ContextLengthExceeded(String),
    /// Malformed or unparseable response body.
    ResponseFormat { message: String, raw: String },
    InvalidRequest(String),
    NotImplemented(String),
}

impl fmt::Display for LLMError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LLMError::Unavailable(e) => write!(f, "backend unavailable: {e}"),
            LLMError::BadRequest(e) => write!(f, "backend bad request: {e}"),
            LLMError::ContextLengthExceeded(e) => write!(f, "context length exceeded: {e}"),
            LLMError::ResponseFormat { message, raw } => {
                write!(f, "response format error: {message}. raw: {raw}")
            }
            LLMError::InvalidRequest(e) => write!(f, "invalid request: {e}"),
            LLMError::NotImplemented(e) => write!(f, "not implemented: {e}"),
        }
    }
}

impl std::error::Error for LLMError {}

impl From<reqwest::Error> for LLMError {
    fn from(err: reqwest::Error) -> Self {
        LLMError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for LLMError {
    fn from(err: serde_json::Error) -> Self {
        LLMError::ResponseFormat {
            message: err.to_string(),
            raw: String::new(),
        }
    }
}
