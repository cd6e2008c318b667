//! Sliding-window text chunking.
//!
//! Windows are measured in characters, never split a UTF-8 sequence, and
//! report byte offsets into the source text.

use docket_core::{defaults, TextChunk};

/// Configuration for the sliding-window chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Maximum size of a chunk in characters.
    pub chunk_size: usize,
    /// Number of characters shared by adjacent chunks.
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::CHUNK_SIZE,
            overlap: defaults::CHUNK_OVERLAP,
        }
    }
}

impl ChunkerConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap,
        }
    }

    /// Characters the window advances per chunk.
    fn step(&self) -> usize {
        self.chunk_size.saturating_sub(self.overlap).max(1)
    }
}

/// Splits text into overlapping fixed-size windows.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindowChunker {
    config: ChunkerConfig,
}

impl SlidingWindowChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk `text`. Empty or whitespace-only input yields no chunks.
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return vec![];
        }

        // Byte offset of every char start, plus the end of the text.
        let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bounds.push(text.len());
        let char_count = bounds.len() - 1;

        let size = self.config.chunk_size.max(1);
        let step = self.config.step();

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < char_count {
            let end = (start + size).min(char_count);
            let (start_offset, end_offset) = (bounds[start], bounds[end]);

            chunks.push(TextChunk {
                chunk_id: chunks.len(),
                text: text[start_offset..end_offset].to_string(),
                start_offset,
                end_offset,
            });

            if end >= char_count {
                break;
            }
            start += step;
        }

        chunks
    }
}
