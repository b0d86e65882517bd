//! Instrumented providers shared by unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::chain::{ChainSettings, PipelineContext};
use crate::chunker::Chunker;
use crate::embeddings::{CachedEmbedder, EmbeddingProvider, HashingEmbedder, EMBED_DIM};
use crate::llm::{GenerationRequest, LanguageModel, Role};
use crate::loader::LoaderOptions;
use crate::retry::{ProviderError, RetryPolicy};

/// Hashing embedder that counts calls and, with a delay, records how many
/// calls overlapped.
pub struct CountingEmbedder {
    inner: HashingEmbedder,
    delay: Option<Duration>,
    calls: AtomicUsize,
    texts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new() -> Self {
        Self {
            inner: HashingEmbedder::new(EMBED_DIM),
            delay: None,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_dim(dim: usize) -> Self {
        Self { inner: HashingEmbedder::new(dim), ..Self::new() }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::new() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts_embedded(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let out = texts.iter().map(|t| self.inner.embed_one(t)).collect();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(out)
    }
}

/// Replies with the system message (instructions plus retrieved context), or
/// with the last message when there is none.
#[derive(Default)]
pub struct EchoModel {
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl EchoModel {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<GenerationRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LanguageModel for EchoModel {
    fn model_id(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let reply = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .or_else(|| request.messages.last())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(reply)
    }
}

#[derive(Default)]
pub struct FailingModel {
    calls: AtomicUsize,
}

impl FailingModel {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for FailingModel {
    fn model_id(&self) -> &str {
        "failing"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::Status { status: 503, body: "model overloaded".into() })
    }
}

pub fn pipeline_with(root: &Path, embedder: Arc<CountingEmbedder>, model: Arc<dyn LanguageModel>) -> PipelineContext {
    let db = sled::open(root.join("kv")).unwrap();
    let cached = CachedEmbedder::new(&db, embedder, RetryPolicy::default()).unwrap();
    PipelineContext {
        db,
        embedder: Arc::new(cached),
        model,
        retry: RetryPolicy::default(),
        chunker: Chunker::new(1000, 10).unwrap(),
        loader: LoaderOptions::default(),
        settings: ChainSettings::default(),
    }
}

pub fn pipeline(root: &Path, model: Arc<dyn LanguageModel>) -> (PipelineContext, Arc<CountingEmbedder>) {
    let embedder = Arc::new(CountingEmbedder::new());
    (pipeline_with(root, embedder.clone(), model), embedder)
}
