//! Fixed-window text chunking for plain-text ingestion.

use serde_json::Value;

use super::store::{DocumentRecord, Metadata};
use crate::core::config::ChunkingConfig;

/// Split `text` into overlapping character windows.
///
/// Whitespace runs collapse to a single space first. Text that fits in one
/// window is returned whole; otherwise windows start every
/// `chunk_size - chunk_overlap` characters until the text is covered.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = normalized.chars().collect();
    let chunk_size = config.chunk_size.max(1);
    if chars.len() <= chunk_size {
        return vec![normalized];
    }

    let step = chunk_size.saturating_sub(config.chunk_overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        start += step;
    }
    chunks
}

/// Chunk one uploaded text into records attributed to `filename`.
pub fn documents_from_text(
    filename: &str,
    file_type: Option<&str>,
    text: &str,
    config: &ChunkingConfig,
) -> Vec<DocumentRecord> {
    chunk_text(text, config)
        .into_iter()
        .enumerate()
        .map(|(chunk_id, content)| {
            let mut metadata = Metadata::new();
            metadata.insert("filename".to_string(), Value::from(filename));
            if let Some(file_type) = file_type {
                metadata.insert("file_type".to_string(), Value::from(file_type));
            }
            metadata.insert("chunk_id".to_string(), Value::from(chunk_id));
            metadata.insert("source".to_string(), Value::from("upload"));
            DocumentRecord { content, metadata }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, chunk_overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            chunk_overlap,
        }
    }

    #[test]
    fn short_text_is_one_normalized_chunk() {
        let chunks = chunk_text("  hello \n\n  world\t!  ", &config(512, 50));
        assert_eq!(chunks, vec!["hello world !"]);
    }

    #[test]
    fn blank_text_yields_nothing() {
        assert!(chunk_text(" \n\t ", &config(512, 50)).is_empty());
    }

    #[test]
    fn windows_overlap_by_configured_amount() {
        let text: String = ('a'..='z').cycle().take(25).collect();
        let chunks = chunk_text(&text, &config(10, 3));

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], &text[0..10]);
        assert_eq!(chunks[1], &text[7..17]);
        assert_eq!(chunks[3], &text[21..25]);
        assert_eq!(&chunks[0][7..], &chunks[1][..3]);
    }

    #[test]
    fn records_carry_upload_attribution() {
        let records = documents_from_text("notes.txt", Some("text/plain"), "one two", &config(512, 50));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata["filename"], "notes.txt");
        assert_eq!(records[0].metadata["file_type"], "text/plain");
        assert_eq!(records[0].metadata["chunk_id"], 0);
        assert_eq!(records[0].metadata["source"], "upload");
    }
}
