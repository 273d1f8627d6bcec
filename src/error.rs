// Error taxonomy for the whole client. Everything that can go wrong between
// the user typing a command and rendered output maps onto one of these
// variants, and a one-shot invocation turns each variant into a distinct
// process exit code so scripts can tell validation failures from API-layer
// failures.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unknown command `{0}` (try `help`)")]
    UnknownCommand(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    // Credential rejected by the remote API.
    #[error("authorization rejected; check DISCOGS_TOKEN")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limit exceeded{}", retry_hint(.retry_after))]
    RateLimitExceeded { retry_after: Option<Duration> },

    // Network-level or 5xx failure after retries were exhausted.
    #[error("request failed after {attempts} attempts: {reason}")]
    Transient { attempts: u32, reason: String },

    // Response did not match the expected shape. Not retryable: a
    // structurally bad response is unlikely to change on retry.
    #[error("malformed response: {0}")]
    Malformed(String),

    // The user interrupted an in-flight call. The session swallows this and
    // re-prompts; it never reaches one-shot output on its own.
    #[error("interrupted")]
    Interrupted,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!("; retry in {}s", d.as_secs().max(1)),
        None => String::new(),
    }
}

impl CatalogError {
    /// Process exit code for one-shot invocations. Zero is reserved for
    /// success; dispatch-level failures sort before API-layer ones.
    pub fn exit_code(&self) -> u8 {
        match self {
            CatalogError::UnknownCommand(_) => 2,
            CatalogError::InvalidArgs(_) => 3,
            CatalogError::Unauthorized => 4,
            CatalogError::NotFound(_) => 5,
            CatalogError::RateLimitExceeded { .. } => 6,
            CatalogError::Transient { .. } => 7,
            CatalogError::Malformed(_) => 8,
            // Conventional code for a SIGINT-terminated command.
            CatalogError::Interrupted => 130,
        }
    }
}
