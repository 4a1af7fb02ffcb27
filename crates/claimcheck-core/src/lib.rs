/// Core library for the Claimcheck warranty coverage analyzer.
///
/// This crate contains the full coverage-analysis pipeline: deterministic
/// rule matching, part-number catalog lookup, keyword matching with
/// policy-list verification, a bounded parallel LLM fallback, cross-item
/// reconciliation passes, primary-repair determination, and payout summary.
pub mod analyzer;
pub mod config;
pub mod error;
pub mod keywords;
pub mod llm;
pub mod normalize;
pub mod parts;
pub mod rules;
pub mod trace;
pub mod types;

pub use error::*;

/// Returns the version of the claimcheck-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
