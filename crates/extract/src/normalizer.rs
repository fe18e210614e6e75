use regex::Regex;
use std::sync::LazyLock;

use crate::schema::EntityType;

/// Domain abbreviations shared by query normalization and entity canonicalization.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("pm", "preventive maintenance"),
    ("cm", "corrective maintenance"),
    ("rca", "root cause analysis"),
    ("mtbf", "mean time between failures"),
    ("mttr", "mean time to repair"),
    ("sop", "standard operating procedure"),
    ("ppe", "personal protective equipment"),
    ("loto", "lockout tagout"),
    ("p&id", "piping and instrumentation diagram"),
    ("api", "american petroleum institute"),
    ("asme", "american society of mechanical engineers"),
];

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s\-]").expect("valid punctuation regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static ASSET_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z]+)\s*[-_]?\s*(\d+)(?:\s*([a-z])\b)?").expect("valid asset tag regex")
});

#[derive(Debug, Clone, Default)]
pub struct EntityNormalizer;

impl EntityNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn expand_abbreviation(word: &str) -> &str {
        ABBREVIATIONS
            .iter()
            .find(|(short, _)| *short == word)
            .map(|(_, long)| *long)
            .unwrap_or(word)
    }

    /// Lowercase and expand abbreviations word by word. Unknown words pass through.
    pub fn normalize_query(&self, text: &str) -> String {
        text.to_lowercase()
            .split_whitespace()
            .map(Self::expand_abbreviation)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Canonical name used to match mentions of the same entity across documents.
    pub fn canonical_name(&self, name: &str, entity_type: EntityType) -> String {
        let expanded = self.normalize_query(name.trim());
        let stripped = PUNCTUATION.replace_all(&expanded, "");
        let canonical = WHITESPACE.replace_all(&stripped, " ").trim().to_string();

        if entity_type == EntityType::Asset {
            if let Some(caps) = ASSET_TAG.captures(&canonical) {
                return format!(
                    "{}-{}{}",
                    caps[1].to_uppercase(),
                    &caps[2],
                    caps.get(3).map_or(String::new(), |suffix| suffix.as_str().to_uppercase())
                );
            }
        }

        canonical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_normalization_expands_abbreviations() {
        let normalizer = EntityNormalizer::new();

        assert_eq!(
            normalizer.normalize_query("What PPE is needed for PM?"),
            "what personal protective equipment is needed for pm?"
        );
        assert_eq!(
            normalizer.normalize_query("Required  PPE for LOTO"),
            "required personal protective equipment for lockout tagout"
        );
    }

    #[test]
    fn test_canonical_name_strips_punctuation() {
        let normalizer = EntityNormalizer::new();

        assert_eq!(
            normalizer.canonical_name("  Mechanical   Seal! ", EntityType::Component),
            "mechanical seal"
        );
        assert_eq!(
            normalizer.canonical_name("RCA", EntityType::Procedure),
            "root cause analysis"
        );
        assert_eq!(
            normalizer.canonical_name("P&ID", EntityType::Term),
            "piping and instrumentation diagram"
        );
    }

    #[test]
    fn test_asset_tags_are_coerced() {
        let normalizer = EntityNormalizer::new();

        assert_eq!(normalizer.canonical_name("p 101 a", EntityType::Asset), "P-101A");
        assert_eq!(normalizer.canonical_name("V_201", EntityType::Asset), "V-201");
        assert_eq!(normalizer.canonical_name("V-201", EntityType::Asset), "V-201");
        assert_eq!(normalizer.canonical_name("p101b", EntityType::Asset), "P-101B");
        // A following word is not a suffix letter
        assert_eq!(normalizer.canonical_name("V-201 valve", EntityType::Asset), "V-201");
        assert_eq!(normalizer.canonical_name("P-101 assembly", EntityType::Asset), "P-101");
        // Only assets get tag formatting
        assert_eq!(normalizer.canonical_name("V-201", EntityType::Component), "v-201");
    }
}
