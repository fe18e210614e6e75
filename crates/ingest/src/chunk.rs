use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Document classes the corpus is made of. Drives recall filters and authority scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentType {
    OemManual,
    Sop,
    Checklist,
    Rca,
    Bulletin,
    Standard,
    InspectionLog,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::OemManual => "OEM_MANUAL",
            DocumentType::Sop => "SOP",
            DocumentType::Checklist => "CHECKLIST",
            DocumentType::Rca => "RCA",
            DocumentType::Bulletin => "BULLETIN",
            DocumentType::Standard => "STANDARD",
            DocumentType::InspectionLog => "INSPECTION_LOG",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OEM_MANUAL" => Ok(DocumentType::OemManual),
            "SOP" => Ok(DocumentType::Sop),
            "CHECKLIST" => Ok(DocumentType::Checklist),
            "RCA" => Ok(DocumentType::Rca),
            "BULLETIN" => Ok(DocumentType::Bulletin),
            "STANDARD" => Ok(DocumentType::Standard),
            "INSPECTION_LOG" => Ok(DocumentType::InspectionLog),
            other => Err(format!("unknown document type: {}", other)),
        }
    }
}

/// Data classification, ordered from least to most restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationLevel {
    Public,
    #[default]
    Internal,
    Confidential,
    Restricted,
}

impl ClassificationLevel {
    pub const ALL: [ClassificationLevel; 4] = [
        ClassificationLevel::Public,
        ClassificationLevel::Internal,
        ClassificationLevel::Confidential,
        ClassificationLevel::Restricted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationLevel::Public => "public",
            ClassificationLevel::Internal => "internal",
            ClassificationLevel::Confidential => "confidential",
            ClassificationLevel::Restricted => "restricted",
        }
    }

    /// Every level a caller cleared for `self` may read, lowest first.
    pub fn readable(&self) -> Vec<ClassificationLevel> {
        Self::ALL.iter().copied().filter(|level| level <= self).collect()
    }
}

/// Metadata carried by every chunk of a document, stored as vector payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Stable id declared by the author. Defaults to a hash of the source path.
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(default)]
    pub doc_type: Option<DocumentType>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub classification: ClassificationLevel,
    /// RFC 3339 timestamp or plain `YYYY-MM-DD`.
    #[serde(default)]
    pub effective_date: Option<String>,
    /// Id, title or source path of the document this one replaces.
    #[serde(default)]
    pub supersedes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub doc_id: String,
    pub chunk_id: String,
    pub text: String,
    pub source: String,
    pub offset: (usize, usize), // [start, end) byte positions in the source text
    pub metadata: DocumentMetadata,
}

impl Chunk {
    pub fn new(
        doc_id: String,
        text: String,
        source: String,
        offset: (usize, usize),
        metadata: DocumentMetadata,
    ) -> Self {
        let chunk_id = Self::generate_chunk_id(&doc_id, &text, offset);

        Self {
            doc_id,
            chunk_id,
            text,
            source,
            offset,
            metadata,
        }
    }

    fn generate_chunk_id(doc_id: &str, text: &str, offset: (usize, usize)) -> String {
        let mut hasher = Sha256::new();
        hasher.update(doc_id.as_bytes());
        hasher.update(text.as_bytes());
        hasher.update(offset.0.to_string().as_bytes());
        hasher.update(offset.1.to_string().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16])
    }

    /// Estimate token count (rough: 1.3 tokens per word)
    pub fn estimated_tokens(&self) -> usize {
        let word_count = self.text.split_whitespace().count();
        (word_count as f64 * 1.3) as usize
    }

    /// Flat payload stored next to the chunk vector. Absent fields are omitted so
    /// membership filters never match on nulls.
    pub fn payload(&self) -> HashMap<String, serde_json::Value> {
        let mut payload = HashMap::new();
        payload.insert("chunk_id".to_string(), serde_json::json!(self.chunk_id));
        payload.insert("doc_id".to_string(), serde_json::json!(self.doc_id));
        payload.insert("content".to_string(), serde_json::json!(self.text));
        payload.insert("source".to_string(), serde_json::json!(self.source));
        payload.insert(
            "classification".to_string(),
            serde_json::json!(self.metadata.classification.as_str()),
        );

        let meta = &self.metadata;
        if let Some(doc_type) = meta.doc_type {
            payload.insert("doc_type".to_string(), serde_json::json!(doc_type.as_str()));
        }
        if let Some(title) = &meta.title {
            payload.insert("title".to_string(), serde_json::json!(title));
        }
        if let Some(section) = &meta.section {
            payload.insert("section".to_string(), serde_json::json!(section));
        }
        if let Some(page) = meta.page {
            payload.insert("page".to_string(), serde_json::json!(page));
        }
        if let Some(date) = &meta.effective_date {
            payload.insert("effective_date".to_string(), serde_json::json!(date));
        }
        if let Some(supersedes) = &meta.supersedes {
            payload.insert("supersedes".to_string(), serde_json::json!(supersedes));
        }

        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_readable_levels() {
        assert_eq!(
            ClassificationLevel::Internal.readable(),
            vec![ClassificationLevel::Public, ClassificationLevel::Internal]
        );
        assert_eq!(ClassificationLevel::Public.readable().len(), 1);
        assert_eq!(ClassificationLevel::Restricted.readable().len(), 4);
    }

    #[test]
    fn test_document_type_parsing() {
        assert_eq!("oem_manual".parse::<DocumentType>(), Ok(DocumentType::OemManual));
        assert_eq!(" SOP ".parse::<DocumentType>(), Ok(DocumentType::Sop));
        assert!("memo".parse::<DocumentType>().is_err());
    }

    #[test]
    fn test_payload_omits_missing_fields() {
        let metadata = DocumentMetadata {
            doc_type: Some(DocumentType::Sop),
            title: Some("Valve Isolation".to_string()),
            ..Default::default()
        };
        let chunk = Chunk::new(
            "doc-1".to_string(),
            "Close V-201 before work.".to_string(),
            "sop.md".to_string(),
            (0, 24),
            metadata,
        );

        let payload = chunk.payload();
        assert_eq!(payload["doc_type"], "SOP");
        assert_eq!(payload["classification"], "internal");
        assert!(!payload.contains_key("section"));
        assert_eq!(chunk.chunk_id.len(), 32);
    }
}
