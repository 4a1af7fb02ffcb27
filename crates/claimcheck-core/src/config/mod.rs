//! Configuration management for the coverage analyzer.
//!
//! A customer's coverage configuration lives in one main YAML file with
//! `analyzer`, `rules`, `keywords`, and `llm` sections, plus two optional
//! sibling files discovered by glob pattern:
//!
//! - `*_keyword_mappings.yaml` -- keyword taxonomy, used when the main
//!   file's `keywords` section carries no mappings
//! - `*_component_config.yaml` -- customer component vocabulary
//!
//! A missing main file is not fatal: the analyzer proceeds with defaults
//! and logs a warning. A present-but-unparseable file is a hard error.

mod component;

pub use component::{ComponentConfig, RepairKeyword};

use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::keywords::KeywordConfig;
use crate::llm::matcher::LlmMatcherConfig;
use crate::rules::RuleConfig;

fn default_keyword_min_confidence() -> f64 {
    0.80
}

fn default_use_llm_fallback() -> bool {
    true
}

fn default_llm_max_items() -> usize {
    35
}

fn default_llm_max_concurrent() -> usize {
    3
}

fn default_config_version() -> String {
    "1.0".to_string()
}

fn default_nominal_price_threshold() -> Decimal {
    Decimal::new(2, 0)
}

/// Top-level tuning for the coverage analyzer pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Minimum confidence for a keyword match to be accepted.
    #[serde(default = "default_keyword_min_confidence")]
    pub keyword_min_confidence: f64,

    /// Whether unmatched items fall through to the LLM.
    #[serde(default = "default_use_llm_fallback")]
    pub use_llm_fallback: bool,

    /// Maximum items sent to the LLM per claim (cost control).
    #[serde(default = "default_llm_max_items")]
    pub llm_max_items: usize,

    /// Maximum concurrent LLM calls (1 = sequential).
    #[serde(default = "default_llm_max_concurrent")]
    pub llm_max_concurrent: usize,

    /// Configuration version recorded in result metadata.
    #[serde(default = "default_config_version")]
    pub config_version: String,

    /// Coverage percentage applied when the policy has no mileage scale
    /// (e.g. full-coverage products without tiering).
    #[serde(default)]
    pub default_coverage_percent: Option<Decimal>,

    /// Use an LLM call to pick the primary repair (tier 0) before the
    /// value-based heuristics.
    #[serde(default)]
    pub use_llm_primary_repair: bool,

    /// Labor items at or below this price that carry an item code are
    /// flagged for review: suspected operation codes where the real cost
    /// is hours x rate.
    #[serde(default = "default_nominal_price_threshold")]
    pub nominal_price_threshold: Decimal,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            keyword_min_confidence: default_keyword_min_confidence(),
            use_llm_fallback: default_use_llm_fallback(),
            llm_max_items: default_llm_max_items(),
            llm_max_concurrent: default_llm_max_concurrent(),
            config_version: default_config_version(),
            default_coverage_percent: None,
            use_llm_primary_repair: false,
            nominal_price_threshold: default_nominal_price_threshold(),
        }
    }
}

/// Raw shape of the main coverage YAML file.
#[derive(Debug, Default, Deserialize)]
struct MainConfigFile {
    #[serde(default)]
    analyzer: AnalyzerConfig,
    #[serde(default)]
    rules: RuleConfig,
    #[serde(default)]
    keywords: KeywordConfig,
    #[serde(default)]
    llm: LlmMatcherConfig,
}

/// Everything loaded from the main config file and its siblings.
#[derive(Debug, Default)]
pub struct LoadedCoverageConfig {
    /// Pipeline tuning.
    pub analyzer: AnalyzerConfig,
    /// Rule engine patterns.
    pub rules: RuleConfig,
    /// Keyword taxonomy.
    pub keywords: KeywordConfig,
    /// LLM matcher tuning.
    pub llm: LlmMatcherConfig,
    /// Customer component vocabulary.
    pub component: ComponentConfig,
}

/// Find a sibling of `config_path` matching a glob pattern.
fn find_sibling(config_path: &Path, pattern: &str) -> Option<PathBuf> {
    let parent = config_path.parent()?;
    let full_pattern = parent.join(pattern);
    let mut matches: Vec<PathBuf> = glob::glob(full_pattern.to_str()?)
        .ok()?
        .filter_map(Result::ok)
        .collect();
    matches.sort();
    matches.into_iter().next()
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::ParseError { source })
}

/// Load the full coverage configuration from a main YAML file plus its
/// sibling keyword-mappings and component-config files.
pub fn load_coverage_config(config_path: &Path) -> Result<LoadedCoverageConfig, ConfigError> {
    if !config_path.exists() {
        tracing::warn!(
            path = %config_path.display(),
            "Coverage config file not found, using defaults",
        );
        return Ok(LoadedCoverageConfig::default());
    }

    let main: MainConfigFile = read_yaml(config_path)?;

    // Keyword mappings: main YAML wins; otherwise look for a sibling file.
    let mut keywords = main.keywords;
    if keywords.mappings.is_empty() {
        if let Some(keyword_file) = find_sibling(config_path, "*_keyword_mappings.yaml") {
            keywords = read_yaml(&keyword_file)?;
            tracing::info!(
                file = %keyword_file.display(),
                mappings = keywords.mappings.len(),
                "Loaded keyword mappings from sibling file",
            );
        }
    }

    let mut component = ComponentConfig::default();
    if let Some(comp_file) = find_sibling(config_path, "*_component_config.yaml") {
        component = read_yaml::<ComponentConfig>(&comp_file)?.normalized();
        tracing::info!(
            file = %comp_file.display(),
            "Loaded component config from sibling file",
        );
    }

    Ok(LoadedCoverageConfig {
        analyzer: main.analyzer,
        rules: main.rules,
        keywords,
        llm: main.llm,
        component,
    })
}
