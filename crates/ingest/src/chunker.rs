use crate::chunk::{Chunk, DocumentMetadata};

pub struct ChunkerConfig {
    pub target_tokens_max: usize,
    pub overlap_tokens: usize,
    /// Paragraphs shorter than this (in characters) are folded into their neighbours.
    pub min_paragraph_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens_max: 400,
            overlap_tokens: 50,
            min_paragraph_chars: 50,
        }
    }
}

pub struct Chunker {
    config: ChunkerConfig,
}

/// A heading-delimited slice of a document.
struct Section<'a> {
    heading: Option<String>,
    start: usize,
    text: &'a str,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Split a document into chunks that never cross a heading. Each chunk inherits the
    /// document metadata with `section` set to the heading it sits under.
    pub fn chunk_text(
        &self,
        doc_id: &str,
        text: &str,
        source: &str,
        metadata: &DocumentMetadata,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        for section in self.split_by_headings(text) {
            let mut section_meta = metadata.clone();
            if section.heading.is_some() {
                section_meta.section = section.heading.clone();
            }

            let mut buffer = String::new();
            let mut buffer_start = section.start;
            let mut cursor = section.start;

            for (para_offset, para) in self.split_by_paragraphs(section.text) {
                let para_start = section.start + para_offset;
                let over_budget = estimate_tokens(&buffer) + estimate_tokens(para)
                    > self.config.target_tokens_max;

                if over_budget && buffer.trim().len() >= self.config.min_paragraph_chars {
                    chunks.push(Chunk::new(
                        doc_id.to_string(),
                        buffer.trim().to_string(),
                        source.to_string(),
                        (buffer_start, cursor),
                        section_meta.clone(),
                    ));

                    buffer = overlap_tail(&buffer, self.config.overlap_tokens);
                    buffer_start = cursor.saturating_sub(buffer.len());
                }

                if buffer.is_empty() {
                    buffer_start = para_start;
                } else {
                    buffer.push_str("\n\n");
                }
                buffer.push_str(para);
                cursor = para_start + para.len();
            }

            if !buffer.trim().is_empty() {
                chunks.push(Chunk::new(
                    doc_id.to_string(),
                    buffer.trim().to_string(),
                    source.to_string(),
                    (buffer_start, cursor),
                    section_meta,
                ));
            }
        }

        chunks
    }

    fn split_by_headings<'a>(&self, text: &'a str) -> Vec<Section<'a>> {
        let mut sections = Vec::new();
        let mut current = Section { heading: None, start: 0, text: "" };
        let mut offset = 0;

        for line in text.split_inclusive('\n') {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') && offset > current.start {
                current.text = &text[current.start..offset];
                sections.push(current);
                current = Section { heading: None, start: offset, text: "" };
            }
            if trimmed.starts_with('#') {
                let heading = trimmed.trim_start_matches('#').trim();
                if !heading.is_empty() {
                    current.heading = Some(heading.to_string());
                }
            }
            offset += line.len();
        }

        current.text = &text[current.start..];
        sections.push(current);
        sections
    }

    /// Paragraphs with their byte offset inside `text`; heading lines are dropped.
    fn split_by_paragraphs<'a>(&self, text: &'a str) -> Vec<(usize, &'a str)> {
        let mut paragraphs = Vec::new();
        let mut offset = 0;

        for block in text.split("\n\n") {
            let body_start = block
                .split_inclusive('\n')
                .take_while(|line| line.trim_start().starts_with('#'))
                .map(str::len)
                .sum::<usize>();
            let body = &block[body_start..];
            let trimmed = body.trim();

            if !trimmed.is_empty() {
                let lead = body.len() - body.trim_start().len();
                paragraphs.push((offset + body_start + lead, trimmed));
            }
            offset += block.len() + 2;
        }

        paragraphs
    }
}

fn estimate_tokens(text: &str) -> usize {
    let word_count = text.split_whitespace().count();
    (word_count as f64 * 1.3) as usize
}

fn overlap_tail(text: &str, target_tokens: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let target_words = (target_tokens as f64 / 1.3) as usize;

    if words.len() <= target_words {
        return text.to_string();
    }

    words[words.len() - target_words..].join(" ")
}
