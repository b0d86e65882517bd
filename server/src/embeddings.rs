use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::AppError;
use crate::retry::{ProviderError, RetryPolicy};

pub const EMBED_DIM: usize = 384;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_id(&self) -> &str;
    fn dimension(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Local bag-of-words embedder: each lowercase alphanumeric token is hashed into a
/// signed bucket, then the vector is L2-normalised. Needs no network or model files.
pub struct HashingEmbedder {
    model_id: String,
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { model_id: format!("hashing-bow-{}", dim), dim }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let h = u64::from_le_bytes(head);
            let bucket = (h % self.dim as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBED_DIM)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// OpenAI-compatible `/embeddings` endpoint (TEI, vLLM, OpenAI, ...).
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dim: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, dim: usize, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            dim,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);
        let mut req = self.client.post(&url).json(&EmbeddingRequest { model: &self.model, input: texts });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Status { status: status.as_u16(), body });
        }
        let mut parsed: EmbeddingResponse = resp.json().await?;
        parsed.data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Provider wrapper that memoises document embeddings in sled, one tree per model.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    tree: sled::Tree,
    retry: RetryPolicy,
}

impl CachedEmbedder {
    pub fn new(db: &sled::Db, inner: Arc<dyn EmbeddingProvider>, retry: RetryPolicy) -> Result<Self, AppError> {
        let tree = db.open_tree(format!("emb_cache::{}", inner.model_id()))?;
        Ok(Self { inner, tree, retry })
    }

    pub fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    pub fn cached_items(&self) -> usize {
        self.tree.len()
    }

    pub fn cache_key(model: &str, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Embeds chunk texts, sending only cache misses to the provider in one batch.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let dim = self.dimension();
        let keys: Vec<String> = texts.iter().map(|t| Self::cache_key(self.model_id(), t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut missing: Vec<usize> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            match self.tree.get(key.as_bytes())? {
                Some(v) if v.len() == dim * 4 => out.push(Some(bytemuck::pod_collect_to_vec::<u8, f32>(&v))),
                _ => {
                    out.push(None);
                    missing.push(i);
                }
            }
        }
        debug!(model = self.model_id(), total = texts.len(), misses = missing.len(), "embedding cache lookup");
        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.call_provider(&batch).await?;
            let mut writes = sled::Batch::default();
            for (&i, vector) in missing.iter().zip(vectors) {
                writes.insert(keys[i].as_bytes(), bytemuck::cast_slice::<f32, u8>(&vector));
                out[i] = Some(vector);
            }
            self.tree.apply_batch(writes)?;
        }
        out.into_iter()
            .map(|v| v.ok_or_else(|| AppError::Internal("embedding slot left empty".into())))
            .collect()
    }

    /// Query embeddings bypass the cache.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.call_provider(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| AppError::Internal("provider returned no query vector".into()))
    }

    async fn call_provider(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let vectors = self
            .retry
            .run("embed", || self.inner.embed(texts))
            .await
            .map_err(AppError::EmbeddingFailure)?;
        if vectors.len() != texts.len() {
            return Err(AppError::EmbeddingFailure(ProviderError::Malformed(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            ))));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimension()) {
            return Err(AppError::EmbeddingFailure(ProviderError::Malformed(format!(
                "expected dimension {}, got {}",
                self.dimension(),
                bad.len()
            ))));
        }
        Ok(vectors)
    }
}
