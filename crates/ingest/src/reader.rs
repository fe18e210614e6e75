use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use walkdir::WalkDir;

use crate::chunk::DocumentMetadata;

/// A document read from disk: body text plus the metadata declared in its front matter.
#[derive(Debug, Clone)]
pub struct Document {
    pub source: String,
    pub text: String,
    pub metadata: DocumentMetadata,
}

pub struct FileReader;

impl FileReader {
    pub async fn read_file(path: &Path) -> Result<Document> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match extension {
            "txt" | "md" => {
                let content = fs::read_to_string(path)
                    .await
                    .context(format!("Failed to read file: {:?}", path))?;
                let (mut metadata, body) = split_front_matter(&content)
                    .context(format!("Invalid front matter in {:?}", path))?;

                if metadata.title.is_none() {
                    metadata.title = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .map(title_from_stem);
                }

                Ok(Document {
                    source: path.to_string_lossy().to_string(),
                    text: body.to_string(),
                    metadata,
                })
            }
            _ => anyhow::bail!("Unsupported file format: {}", extension),
        }
    }

    /// Read every supported file below `dir`, recursively, in path order.
    pub async fn read_directory(dir: &Path) -> Result<Vec<Document>> {
        let mut paths: Vec<_> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("txt") | Some("md")
                )
            })
            .collect();
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            documents.push(Self::read_file(&path).await?);
        }

        Ok(documents)
    }
}

/// Split a `+++`-delimited TOML header from the body. Files without one get default metadata.
fn split_front_matter(content: &str) -> Result<(DocumentMetadata, &str)> {
    let Some(rest) = content.strip_prefix("+++") else {
        return Ok((DocumentMetadata::default(), content));
    };

    let Some(end) = rest.find("\n+++") else {
        return Ok((DocumentMetadata::default(), content));
    };

    let header = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\r', '\n']);
    let metadata: DocumentMetadata = toml::from_str(header)?;

    Ok((metadata, body))
}

fn title_from_stem(stem: &str) -> String {
    stem.split(['_', '-'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
