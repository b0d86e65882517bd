use std::cmp::Ordering;
use std::path::PathBuf;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::Chunk;
use crate::error::AppError;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for i in 0..a.len().min(b.len()) {
        let x = a[i];
        let y = b[i];
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub id: String,
    pub source: PathBuf,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: IndexedChunk,
    pub score: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct IndexMeta {
    fingerprint: String,
    #[serde(default)]
    embedder: String,
    dim: usize,
    count: usize,
}

/// Flat cosine index over one agent's chunks.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dim: usize,
    chunks: Vec<IndexedChunk>,
    vectors: Vec<Vec<f32>>,
}

fn tree_name(agent_id: &str) -> String {
    format!("agent_index::{}", agent_id)
}

fn existing_tree(db: &sled::Db, agent_id: &str) -> Result<Option<sled::Tree>, AppError> {
    let name = tree_name(agent_id);
    if !db.tree_names().iter().any(|n| &**n == name.as_bytes()) {
        return Ok(None);
    }
    Ok(Some(db.open_tree(name)?))
}

fn slot_key(prefix: &str, i: usize) -> String {
    format!("{}:{:08}", prefix, i)
}

impl VectorIndex {
    pub fn build(dim: usize, chunks: &[Chunk], vectors: Vec<Vec<f32>>) -> Result<Self, AppError> {
        if chunks.len() != vectors.len() {
            return Err(AppError::Internal(format!("{} chunks but {} vectors", chunks.len(), vectors.len())));
        }
        if let Some(v) = vectors.iter().find(|v| v.len() != dim) {
            return Err(AppError::Internal(format!("vector of dimension {} in index of dimension {}", v.len(), dim)));
        }
        let chunks = chunks
            .iter()
            .map(|c| IndexedChunk { id: c.id.clone(), source: c.source.clone(), text: c.text.clone() })
            .collect();
        Ok(Self { dim, chunks, vectors })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Top-k by cosine similarity; equal scores keep insertion order.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<SearchHit> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .par_iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        scored.truncate(top_k);
        scored
            .into_iter()
            .map(|(i, score)| SearchHit { chunk: self.chunks[i].clone(), score })
            .collect()
    }

    /// Replaces whatever was persisted for the agent with this index in one atomic batch.
    /// `embedder` names the model the vectors came from.
    pub fn persist(&self, db: &sled::Db, agent_id: &str, fingerprint: &str, embedder: &str) -> Result<(), AppError> {
        let tree = db.open_tree(tree_name(agent_id))?;
        let mut batch = sled::Batch::default();
        for key in tree.iter().keys() {
            batch.remove(key?);
        }
        for (i, (chunk, vector)) in self.chunks.iter().zip(&self.vectors).enumerate() {
            batch.insert(slot_key("chunk", i).as_bytes(), serde_json::to_vec(chunk)?);
            batch.insert(slot_key("vec", i).as_bytes(), bytemuck::cast_slice::<f32, u8>(vector));
        }
        let meta = IndexMeta {
            fingerprint: fingerprint.to_string(),
            embedder: embedder.to_string(),
            dim: self.dim,
            count: self.chunks.len(),
        };
        batch.insert(b"meta".as_slice(), serde_json::to_vec(&meta)?);
        tree.apply_batch(batch)?;
        tree.flush()?;
        Ok(())
    }

    /// Loads the persisted index when it was built for `fingerprint` by the same
    /// embedding model and dimension; `None` when absent, stale, or incomplete.
    /// Never creates the agent's tree.
    pub fn load(db: &sled::Db, agent_id: &str, fingerprint: &str, embedder: &str, dim: usize) -> Result<Option<Self>, AppError> {
        let Some(tree) = existing_tree(db, agent_id)? else {
            return Ok(None);
        };
        let meta: IndexMeta = match tree.get(b"meta")? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => return Ok(None),
        };
        if meta.fingerprint != fingerprint {
            return Ok(None);
        }
        if meta.embedder != embedder || meta.dim != dim {
            debug!(agent_id, stored = %meta.embedder, stored_dim = meta.dim, embedder, dim, "persisted index built by another embedder");
            return Ok(None);
        }
        let mut chunks = Vec::with_capacity(meta.count);
        let mut vectors = Vec::with_capacity(meta.count);
        for i in 0..meta.count {
            let (Some(c), Some(v)) = (tree.get(slot_key("chunk", i))?, tree.get(slot_key("vec", i))?) else {
                return Ok(None);
            };
            if v.len() != meta.dim * 4 {
                return Ok(None);
            }
            chunks.push(serde_json::from_slice::<IndexedChunk>(&c)?);
            vectors.push(bytemuck::pod_collect_to_vec::<u8, f32>(&v));
        }
        Ok(Some(Self { dim: meta.dim, chunks, vectors }))
    }

    pub fn drop_persisted(db: &sled::Db, agent_id: &str) -> Result<bool, AppError> {
        Ok(db.drop_tree(tree_name(agent_id))?)
    }
}
