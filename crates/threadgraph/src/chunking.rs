//! Source document chunking
//!
//! Long source texts are split into overlapping windows that prefer paragraph,
//! then sentence, then word boundaries. Splitting is deterministic, so a
//! re-run over the same text yields the same chunk ids.

use crate::error::{MemoryError, MemoryResult};
use text_splitter::{Characters, ChunkConfig, TextSplitter as CharacterSplitter};

/// Splits text into ordered slices
pub trait TextSplitter: Send + Sync {
    /// Ordered, deterministic slices of `text`
    fn split(&self, text: &str) -> Vec<String>;
}

/// Character-window splitter with overlap, backed by `text-splitter`
pub struct RecursiveTextSplitter {
    inner: CharacterSplitter<Characters>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveTextSplitter {
    /// Create a splitter with a window of `chunk_size` characters
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> MemoryResult<Self> {
        let config = ChunkConfig::new(chunk_size)
            .with_overlap(chunk_overlap)
            .map_err(|e| MemoryError::configuration(e.to_string()))?;

        Ok(Self {
            inner: CharacterSplitter::new(config),
            chunk_size,
            chunk_overlap,
        })
    }

    /// Window size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Overlap between consecutive windows
    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }
}

impl TextSplitter for RecursiveTextSplitter {
    fn split(&self, text: &str) -> Vec<String> {
        self.inner
            .chunks(text)
            .filter(|chunk| !chunk.trim().is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// One slice of a source, positioned in its chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSlice {
    /// Position in the chain, from 0
    pub index: usize,
    /// Slice text
    pub text: String,
}

/// Key of the `index`-th chunk of a source
pub fn chunk_id(source_url: &str, index: usize) -> String {
    format!("{}_{}", source_url, index)
}

/// Split a source text into indexed slices
pub fn chunk_source(splitter: &dyn TextSplitter, text: &str) -> Vec<ChunkSlice> {
    splitter
        .split(text)
        .into_iter()
        .enumerate()
        .map(|(index, text)| ChunkSlice { index, text })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(word: &str, sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("The {} sentence number {} talks about graphs.", word, i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_window() {
        assert!(RecursiveTextSplitter::new(100, 100).is_err());
        assert!(RecursiveTextSplitter::new(1000, 200).is_ok());
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let splitter = RecursiveTextSplitter::new(1000, 200).unwrap();
        let slices = chunk_source(&splitter, "APOC is a library of procedures.");
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].index, 0);
        assert_eq!(slices[0].text, "APOC is a library of procedures.");

        assert!(chunk_source(&splitter, "  \n\n ").is_empty());
    }

    #[test]
    fn test_long_text_respects_window_and_is_deterministic() {
        let splitter = RecursiveTextSplitter::new(1000, 200).unwrap();
        let text = (0..6)
            .map(|i| paragraph(&format!("p{}", i), 12))
            .collect::<Vec<_>>()
            .join("\n\n");

        let first = chunk_source(&splitter, &text);
        let second = chunk_source(&splitter, &text);

        assert!(first.len() > 1);
        assert_eq!(first, second);
        for (i, slice) in first.iter().enumerate() {
            assert_eq!(slice.index, i);
            assert!(slice.text.chars().count() <= 1000);
        }
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let splitter = RecursiveTextSplitter::new(1000, 200).unwrap();
        let first = paragraph("alpha", 12);
        let second = paragraph("beta", 12);
        assert!(first.len() < 1000 && first.len() + second.len() > 1000);

        let slices = splitter.split(&format!("{}\n\n{}", first, second));
        assert_eq!(slices[0], first);
        assert!(slices.last().unwrap().ends_with("graphs."));
    }

    #[test]
    fn test_chunk_id_format() {
        assert_eq!(chunk_id("https://neo4j.com/docs/apoc", 3), "https://neo4j.com/docs/apoc_3");
    }
}
