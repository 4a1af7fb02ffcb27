//! Part-number catalog port (pipeline stage 2).
//!
//! The catalog itself is an external collaborator injected at analyzer
//! construction. Lookup is exact-match on `item_code`; the catalog may
//! internally fall back to keyword identification, which it signals
//! through `lookup_source` -- the analyzer treats such results with less
//! trust (gasket/seal deferral, policy-list verification).

use serde::{Deserialize, Serialize};

use crate::types::Trilean;

/// Result of a catalog lookup for one part number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartLookupResult {
    /// The part number that matched.
    pub part_number: String,
    /// Vehicle system / policy category (e.g. "engine").
    pub system: Option<String>,
    /// Canonical component name (e.g. "oil_cooler").
    pub component: Option<String>,
    /// Human-readable component description from the catalog.
    pub component_description: Option<String>,
    /// Whether the catalog itself knows the part to be covered or excluded.
    #[serde(default)]
    pub covered: Trilean,
    /// How the catalog found the part: "exact", "exact_normalized",
    /// "keyword_description", ... Sources containing "keyword" are treated
    /// as lower-trust matches.
    pub lookup_source: String,
    /// Catalog note, e.g. why a part is excluded.
    #[serde(default)]
    pub note: Option<String>,
}

impl PartLookupResult {
    /// Whether this result came from keyword identification rather than an
    /// exact part-number hit.
    pub fn is_keyword_sourced(&self) -> bool {
        self.lookup_source.contains("keyword")
    }

    /// Best available display name for the component.
    pub fn display_component(&self) -> Option<&str> {
        self.component_description
            .as_deref()
            .or(self.component.as_deref())
    }
}

/// Injected part-number catalog.
pub trait PartCatalog: Send + Sync {
    /// Look up a part by its exact item code. `None` on a catalog miss.
    fn lookup(&self, item_code: &str) -> Option<PartLookupResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_sourced_detection() {
        let exact = PartLookupResult {
            part_number: "A123".into(),
            system: Some("engine".into()),
            component: Some("turbocharger".into()),
            component_description: None,
            covered: Trilean::Unknown,
            lookup_source: "exact".into(),
            note: None,
        };
        assert!(!exact.is_keyword_sourced());

        let keyword = PartLookupResult {
            lookup_source: "keyword_description".into(),
            ..exact
        };
        assert!(keyword.is_keyword_sourced());
    }

    #[test]
    fn display_component_prefers_description() {
        let result = PartLookupResult {
            part_number: "A123".into(),
            system: Some("engine".into()),
            component: Some("oil_cooler".into()),
            component_description: Some("Ölkühler".into()),
            covered: Trilean::Yes,
            lookup_source: "exact".into(),
            note: None,
        };
        assert_eq!(result.display_component(), Some("Ölkühler"));
    }
}
