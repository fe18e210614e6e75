use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Asset,
    Component,
    FailureMode,
    Symptom,
    Procedure,
    Tool,
    Material,
    SafetyRule,
    Term,
    Standard,
    Location,
    Manufacturer,
}

impl EntityType {
    pub const ALL: [EntityType; 12] = [
        EntityType::Asset,
        EntityType::Component,
        EntityType::FailureMode,
        EntityType::Symptom,
        EntityType::Procedure,
        EntityType::Tool,
        EntityType::Material,
        EntityType::SafetyRule,
        EntityType::Term,
        EntityType::Standard,
        EntityType::Location,
        EntityType::Manufacturer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Asset => "ASSET",
            EntityType::Component => "COMPONENT",
            EntityType::FailureMode => "FAILURE_MODE",
            EntityType::Symptom => "SYMPTOM",
            EntityType::Procedure => "PROCEDURE",
            EntityType::Tool => "TOOL",
            EntityType::Material => "MATERIAL",
            EntityType::SafetyRule => "SAFETY_RULE",
            EntityType::Term => "TERM",
            EntityType::Standard => "STANDARD",
            EntityType::Location => "LOCATION",
            EntityType::Manufacturer => "MANUFACTURER",
        }
    }

    /// Node label used in the graph store.
    pub fn label(&self) -> &'static str {
        match self {
            EntityType::Asset => "Asset",
            EntityType::Component => "Component",
            EntityType::FailureMode => "FailureMode",
            EntityType::Symptom => "Symptom",
            EntityType::Procedure => "Procedure",
            EntityType::Tool => "Tool",
            EntityType::Material => "Material",
            EntityType::SafetyRule => "SafetyRule",
            EntityType::Term => "Term",
            EntityType::Standard => "Standard",
            EntityType::Location => "Location",
            EntityType::Manufacturer => "Manufacturer",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.label() == label)
    }

    pub fn labels() -> Vec<&'static str> {
        Self::ALL.iter().map(|t| t.label()).collect()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == upper || t.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown entity type: {}", s))
    }
}

/// Edge types of the maintenance knowledge graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationType {
    AppliesTo,
    Requires,
    RequiresTool,
    Indicates,
    CausedBy,
    Affects,
    Mitigates,
    PartOf,
    LocatedAt,
    InstalledAt,
    MadeBy,
    HasProcedure,
    HasStep,
    HasSubsystem,
    HasComponent,
    HasSafetyRule,
    DefinedAs,
    SynonymOf,
    IsA,
    References,
    RelatedTo,
    #[serde(other)]
    Unknown,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::AppliesTo => "APPLIES_TO",
            RelationType::Requires => "REQUIRES",
            RelationType::RequiresTool => "REQUIRES_TOOL",
            RelationType::Indicates => "INDICATES",
            RelationType::CausedBy => "CAUSED_BY",
            RelationType::Affects => "AFFECTS",
            RelationType::Mitigates => "MITIGATES",
            RelationType::PartOf => "PART_OF",
            RelationType::LocatedAt => "LOCATED_AT",
            RelationType::InstalledAt => "INSTALLED_AT",
            RelationType::MadeBy => "MADE_BY",
            RelationType::HasProcedure => "HAS_PROCEDURE",
            RelationType::HasStep => "HAS_STEP",
            RelationType::HasSubsystem => "HAS_SUBSYSTEM",
            RelationType::HasComponent => "HAS_COMPONENT",
            RelationType::HasSafetyRule => "HAS_SAFETY_RULE",
            RelationType::DefinedAs => "DEFINED_AS",
            RelationType::SynonymOf => "SYNONYM_OF",
            RelationType::IsA => "IS_A",
            RelationType::References => "REFERENCES",
            RelationType::RelatedTo => "RELATED_TO",
            RelationType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub source_chunk_id: Option<String>,
}

fn default_confidence() -> f32 {
    0.5
}

impl ExtractedEntity {
    pub fn new(name: impl Into<String>, entity_type: EntityType, confidence: f32) -> Self {
        Self {
            name: name.into(),
            entity_type,
            confidence: confidence.clamp(0.0, 1.0),
            context: String::new(),
            source_chunk_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub subject: String,
    pub predicate: RelationType,
    pub object: String,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub extraction: ExtractionOutput,
}
