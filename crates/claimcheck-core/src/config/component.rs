//! Customer-specific component vocabulary.
//!
//! Loaded once per analyzer from a sibling `*_component_config.yaml` and
//! never mutated afterwards. Synonyms and keywords are stored lower-cased;
//! all comparisons against policy lists go through the umlaut fold in
//! [`crate::normalize`].
//!
//! Maps use `BTreeMap`/`BTreeSet` so that iteration order -- and therefore
//! the whole deterministic pipeline -- is stable across runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

/// A repair keyword's target: the component it names and that component's
/// policy category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairKeyword {
    /// Canonical component name (e.g. "oil_cooler").
    pub component: String,
    /// Policy category (e.g. "engine").
    pub category: String,
}

impl<'de> Deserialize<'de> for RepairKeyword {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Map { component: String, category: String },
            Pair(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Map {
                component,
                category,
            } => Ok(RepairKeyword {
                component,
                category,
            }),
            Raw::Pair(pair) if pair.len() == 2 => Ok(RepairKeyword {
                component: pair[0].clone(),
                category: pair[1].clone(),
            }),
            Raw::Pair(pair) => Err(serde::de::Error::custom(format!(
                "repair keyword pair must have exactly 2 entries, got {}",
                pair.len()
            ))),
        }
    }
}

/// Customer vocabulary for coverage matching.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComponentConfig {
    /// Canonical component name -> language-specific synonyms.
    #[serde(default)]
    pub component_synonyms: BTreeMap<String, Vec<String>>,

    /// Category name -> equivalent category names (e.g. axle_drive <-> four_wd).
    #[serde(default)]
    pub category_aliases: BTreeMap<String, Vec<String>>,

    /// Repair keyword found in labor descriptions -> (component, category).
    #[serde(default)]
    pub repair_context_keywords: BTreeMap<String, RepairKeyword>,

    /// Components implicitly covered when the policy lists a timing /
    /// distribution assembly catch-all.
    #[serde(default)]
    pub distribution_catch_all_components: BTreeSet<String>,

    /// Policy-part substrings that identify the distribution catch-all.
    #[serde(default)]
    pub distribution_catch_all_keywords: Vec<String>,

    /// Tokens marking an item as a sealing part (JOINT, DICHTUNG, ...).
    #[serde(default)]
    pub gasket_seal_indicators: BTreeSet<String>,

    /// Tokens marking an item as ancillary to a repair (screws, plugs, ...).
    #[serde(default)]
    pub ancillary_keywords: BTreeSet<String>,

    /// Category -> parts that extend the policy's extracted list with modern
    /// components older policy documents do not enumerate.
    #[serde(default)]
    pub additional_policy_parts: BTreeMap<String, Vec<String>>,
}

impl ComponentConfig {
    /// Enforce the lower-case storage invariant on keys, synonyms, and
    /// keywords. Gasket/seal indicators keep their case; comparisons against
    /// them are case-folded at the call site.
    pub fn normalized(mut self) -> Self {
        self.component_synonyms = self
            .component_synonyms
            .into_iter()
            .map(|(k, v)| {
                (
                    k.to_lowercase(),
                    v.into_iter().map(|s| s.to_lowercase()).collect(),
                )
            })
            .collect();
        self.category_aliases = self
            .category_aliases
            .into_iter()
            .map(|(k, v)| {
                (
                    k.to_lowercase(),
                    v.into_iter().map(|s| s.to_lowercase()).collect(),
                )
            })
            .collect();
        self.repair_context_keywords = self
            .repair_context_keywords
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        self.distribution_catch_all_components = self
            .distribution_catch_all_components
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        self.distribution_catch_all_keywords = self
            .distribution_catch_all_keywords
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        self.ancillary_keywords = self
            .ancillary_keywords
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        self.additional_policy_parts = self
            .additional_policy_parts
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        self
    }

    /// Look up synonyms for a component, trying the lower, underscore, and
    /// space key variants.
    pub fn synonyms_for(&self, component: &str) -> Option<&Vec<String>> {
        let lower = component.to_lowercase();
        let underscore = lower.replace(' ', "_");
        let space = lower.replace('_', " ");
        self.component_synonyms
            .get(&lower)
            .or_else(|| self.component_synonyms.get(&underscore))
            .or_else(|| self.component_synonyms.get(&space))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repair_keywords_in_both_shapes() {
        let yaml = r#"
repair_context_keywords:
  "ölkühler":
    component: oil_cooler
    category: engine
  "culasse": [cylinder_head, engine]
"#;
        let cfg: ComponentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            cfg.repair_context_keywords["ölkühler"],
            RepairKeyword {
                component: "oil_cooler".into(),
                category: "engine".into()
            }
        );
        assert_eq!(
            cfg.repair_context_keywords["culasse"].component,
            "cylinder_head"
        );
    }

    #[test]
    fn normalized_lowercases_vocabulary() {
        let yaml = r#"
component_synonyms:
  Oil_Cooler: ["Ölkühler", "OELKUEHLER"]
category_aliases:
  Axle_Drive: ["Four_WD"]
ancillary_keywords: ["Schraube", "JOINT"]
"#;
        let cfg: ComponentConfig = serde_yaml::from_str::<ComponentConfig>(yaml)
            .unwrap()
            .normalized();
        assert_eq!(
            cfg.component_synonyms["oil_cooler"],
            vec!["ölkühler".to_string(), "oelkuehler".to_string()]
        );
        assert_eq!(cfg.category_aliases["axle_drive"], vec!["four_wd"]);
        assert!(cfg.ancillary_keywords.contains("schraube"));
    }

    #[test]
    fn synonyms_for_tries_key_variants() {
        let yaml = r#"
component_synonyms:
  egr_valve: ["agr-ventil", "abgasrueckfuehrung"]
"#;
        let cfg: ComponentConfig = serde_yaml::from_str::<ComponentConfig>(yaml)
            .unwrap()
            .normalized();
        assert!(cfg.synonyms_for("egr valve").is_some());
        assert!(cfg.synonyms_for("EGR_VALVE").is_some());
        assert!(cfg.synonyms_for("turbocharger").is_none());
    }
}
