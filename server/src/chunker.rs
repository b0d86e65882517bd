use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::loader::TextSegment;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub start: usize,
    pub end: usize,
}

/// A bounded slice of a loaded document, positions counted in chars.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub source: PathBuf,
    pub text: String,
    pub position: Position,
}

#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(size: usize, overlap: usize) -> anyhow::Result<Self> {
        if size == 0 {
            anyhow::bail!("chunk size must be positive");
        }
        if overlap >= size {
            anyhow::bail!("chunk overlap {} must be smaller than chunk size {}", overlap, size);
        }
        Ok(Self { size, overlap })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Sliding window of `size` chars advancing by `size - overlap`.
    pub fn split_text(&self, text: &str) -> Vec<(Position, String)> {
        let chars: Vec<char> = text.chars().collect();
        let step = self.size - self.overlap;
        let mut out = Vec::new();
        let mut start = 0usize;
        while start < chars.len() {
            let end = (start + self.size).min(chars.len());
            let piece: String = chars[start..end].iter().collect();
            if !piece.trim().is_empty() {
                out.push((Position { start, end }, piece));
            }
            if end == chars.len() {
                break;
            }
            start += step;
        }
        out
    }

    pub fn chunk_segments(&self, segments: &[TextSegment]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for (seg_idx, seg) in segments.iter().enumerate() {
            for (position, text) in self.split_text(&seg.text) {
                let id = chunk_id(&seg.source, seg_idx, position);
                chunks.push(Chunk { id, source: seg.source.clone(), text, position });
            }
        }
        chunks
    }
}

fn chunk_id(source: &std::path::Path, segment: usize, pos: Position) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.to_string_lossy().as_bytes());
    hasher.update(segment.to_le_bytes());
    hasher.update(pos.start.to_le_bytes());
    hasher.update(pos.end.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}
