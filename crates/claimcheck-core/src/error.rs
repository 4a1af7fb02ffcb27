//! Error types for the claimcheck core library.
//!
//! Each boundary has its own error enum to keep failure surfaces clear.
//! The library uses `thiserror` for structured, typed errors. The analysis
//! pipeline itself never fails on malformed line items: every item receives
//! a final status, so `analyze()` does not return a `Result`.

/// Errors related to configuration loading, parsing, and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file does not exist at the specified path.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The path that was searched.
        path: String,
    },

    /// YAML deserialization failed.
    #[error("failed to parse config file: {source}")]
    ParseError {
        /// The underlying YAML parse error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A configuration field has an unacceptable value.
    #[error("invalid value for config field '{field}': {message}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// A description of why the value is invalid.
        message: String,
    },

    /// Reading a configuration file from disk failed.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// The path being read.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from interacting with the LLM endpoint.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP request to the LLM endpoint failed.
    #[error("LLM HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// LLM API returned an error response.
    #[error("LLM API error (status {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the API.
        message: String,
    },

    /// LLM provider rate limit hit.
    #[error("LLM rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// LLM response could not be parsed.
    #[error("failed to parse LLM response: {0}")]
    Parse(String),

    /// No LLM client configured.
    #[error("no LLM client configured")]
    NotConfigured,
}
