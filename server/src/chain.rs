use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::chunker::Chunker;
use crate::embeddings::CachedEmbedder;
use crate::error::AppError;
use crate::llm::{ChatMessage, GenerationRequest, LanguageModel};
use crate::loader::{load_documents, LoaderOptions};
use crate::memory::{ConversationMemory, Turn};
use crate::retry::RetryPolicy;
use crate::vector_index::{SearchHit, VectorIndex};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

const CONTEXT_PREAMBLE: &str = "Use the following pieces of context to answer the user's question. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.";

const CONDENSE_TEMPLATE: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language.";

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub temperature: f32,
    pub condense_question: bool,
    pub memory_window: usize,
    pub top_k: usize,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self { temperature: 0.4, condense_question: true, memory_window: 0, top_k: 4 }
    }
}

/// SHA-256 over the instructions and the ordered document paths. A chain is
/// only valid for the agent record that hashes to the same value.
pub fn fingerprint(instructions: &str, document_paths: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((instructions.len() as u64).to_le_bytes());
    hasher.update(instructions.as_bytes());
    for p in document_paths {
        hasher.update((p.len() as u64).to_le_bytes());
        hasher.update(p.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

pub struct Retriever {
    index: VectorIndex,
    embedder: Arc<CachedEmbedder>,
    top_k: usize,
}

impl Retriever {
    pub fn new(index: VectorIndex, embedder: Arc<CachedEmbedder>, top_k: usize) -> Self {
        Self { index, embedder, top_k }
    }

    pub async fn retrieve(&self, question: &str) -> Result<Vec<SearchHit>, AppError> {
        let query = self.embedder.embed_query(question).await?;
        Ok(self.index.search(&query, self.top_k))
    }

    pub fn indexed_chunks(&self) -> usize {
        self.index.len()
    }
}

/// One agent's conversational pipeline: optional retriever, memory and model.
pub struct Chain {
    agent_id: String,
    instructions: String,
    fingerprint: String,
    retriever: Option<Retriever>,
    memory: AsyncMutex<ConversationMemory>,
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    settings: ChainSettings,
}

impl Chain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: &str,
        instructions: &str,
        fingerprint: String,
        retriever: Option<Retriever>,
        memory: ConversationMemory,
        model: Arc<dyn LanguageModel>,
        retry: RetryPolicy,
        settings: ChainSettings,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            instructions: instructions.to_string(),
            fingerprint,
            retriever,
            memory: AsyncMutex::new(memory),
            model,
            retry,
            settings,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn has_retriever(&self) -> bool {
        self.retriever.is_some()
    }

    pub fn retriever(&self) -> Option<&Retriever> {
        self.retriever.as_ref()
    }

    pub async fn memory_len(&self) -> usize {
        self.memory.lock().await.len()
    }

    /// Answers `query` against the agent's documents and conversation so far.
    /// Calls on the same chain are serialised by the memory lock; a failed
    /// generation leaves the memory untouched.
    pub async fn invoke(&self, query: &str) -> Result<String, AppError> {
        let mut memory = self.memory.lock().await;

        let hits = match &self.retriever {
            Some(retriever) => {
                let question = if self.settings.condense_question && !memory.is_empty() {
                    self.condense(&memory, query).await?
                } else {
                    query.to_string()
                };
                retriever.retrieve(&question).await?
            }
            None => Vec::new(),
        };
        debug!(agent_id = %self.agent_id, hits = hits.len(), history = memory.len(), "chain invoke");

        let request = GenerationRequest {
            messages: compose_prompt(&self.instructions, &hits, &memory, query),
            temperature: self.settings.temperature,
        };
        let answer = self.generate(&request).await?;
        memory.push(Turn { user: query.to_string(), assistant: answer.clone() });
        Ok(answer)
    }

    async fn condense(&self, memory: &ConversationMemory, query: &str) -> Result<String, AppError> {
        let prompt = format!(
            "{}\n\nChat History:\n{}\nFollow Up Input: {}\nStandalone question:",
            CONDENSE_TEMPLATE,
            memory.transcript(),
            query
        );
        let request = GenerationRequest { messages: vec![ChatMessage::user(prompt)], temperature: self.settings.temperature };
        let standalone = self.generate(&request).await?;
        let standalone = standalone.trim();
        Ok(if standalone.is_empty() { query.to_string() } else { standalone.to_string() })
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, AppError> {
        self.retry
            .run("generate", || self.model.generate(request))
            .await
            .map_err(AppError::GenerationFailure)
    }
}

/// System message (instructions plus retrieved context), then the remembered
/// turns, then the user's query.
pub fn compose_prompt(instructions: &str, hits: &[SearchHit], memory: &ConversationMemory, query: &str) -> Vec<ChatMessage> {
    let mut system = if instructions.trim().is_empty() { DEFAULT_SYSTEM_PROMPT.to_string() } else { instructions.trim().to_string() };
    if !hits.is_empty() {
        system.push_str("\n\n");
        system.push_str(CONTEXT_PREAMBLE);
        system.push_str("\n----------------\n");
        let context: Vec<&str> = hits.iter().map(|h| h.chunk.text.as_str()).collect();
        system.push_str(&context.join("\n\n"));
    }
    let mut messages = Vec::with_capacity(2 + memory.len() * 2);
    messages.push(ChatMessage::system(system));
    for turn in memory.turns() {
        messages.push(ChatMessage::user(turn.user.clone()));
        messages.push(ChatMessage::assistant(turn.assistant.clone()));
    }
    messages.push(ChatMessage::user(query));
    messages
}

/// Where the index of a built chain came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrigin {
    NoDocuments,
    Persisted,
    Built,
}

/// A document as recorded on the agent and the file its text is read from.
/// The two differ while a preparation reads uploads that are still staged.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSource {
    pub recorded: String,
    pub read_from: PathBuf,
}

impl DocumentSource {
    pub fn at(path: &str) -> Self {
        Self { recorded: path.to_string(), read_from: PathBuf::from(path) }
    }
}

/// Rewrites staged file paths in a load error to the paths the agent records.
fn recorded_error(err: AppError, recorded: &HashMap<String, String>) -> AppError {
    let rename = |p: String| recorded.get(&p).cloned().unwrap_or(p);
    match err {
        AppError::PreparationAborted { loaded, source } => AppError::PreparationAborted {
            loaded: loaded.into_iter().map(rename).collect(),
            source: Box::new(recorded_error(*source, recorded)),
        },
        AppError::DocumentLoad { path, reason } => AppError::DocumentLoad { path: rename(path), reason },
        AppError::UnsupportedFormat { path } => AppError::UnsupportedFormat { path: rename(path) },
        other => other,
    }
}

/// Shared dependencies of every pipeline build.
#[derive(Clone)]
pub struct PipelineContext {
    pub db: sled::Db,
    pub embedder: Arc<CachedEmbedder>,
    pub model: Arc<dyn LanguageModel>,
    pub retry: RetryPolicy,
    pub chunker: Chunker,
    pub loader: LoaderOptions,
    pub settings: ChainSettings,
}

impl PipelineContext {
    /// Runs load, chunk, embed and index for `document_paths` and assembles the chain.
    /// With `reuse_index` a persisted index carrying the same fingerprint and built
    /// by the current embedder is used instead of re-embedding. A freshly built
    /// index replaces the persisted one.
    pub async fn build_chain(
        &self,
        agent_id: &str,
        instructions: &str,
        document_paths: &[String],
        reuse_index: bool,
        history: Vec<Turn>,
    ) -> Result<(Chain, IndexOrigin), AppError> {
        let documents: Vec<DocumentSource> = document_paths.iter().map(|p| DocumentSource::at(p)).collect();
        self.build_chain_from(agent_id, instructions, &documents, reuse_index, history).await
    }

    /// Like [`build_chain`](Self::build_chain), but reads each document from
    /// `read_from` while fingerprinting and indexing it under `recorded`.
    pub async fn build_chain_from(
        &self,
        agent_id: &str,
        instructions: &str,
        documents: &[DocumentSource],
        reuse_index: bool,
        history: Vec<Turn>,
    ) -> Result<(Chain, IndexOrigin), AppError> {
        let recorded: Vec<String> = documents.iter().map(|d| d.recorded.clone()).collect();
        let fp = fingerprint(instructions, &recorded);
        let embedder_id = self.embedder.model_id();
        let (index, origin) = if documents.is_empty() {
            VectorIndex::drop_persisted(&self.db, agent_id)?;
            (None, IndexOrigin::NoDocuments)
        } else {
            let persisted = if reuse_index {
                VectorIndex::load(&self.db, agent_id, &fp, embedder_id, self.embedder.dimension())?
            } else {
                None
            };
            match persisted {
                Some(index) => (Some(index), IndexOrigin::Persisted),
                None => {
                    let index = self.index_documents(documents).await?;
                    index.persist(&self.db, agent_id, &fp, embedder_id)?;
                    (Some(index), IndexOrigin::Built)
                }
            }
        };
        let retriever = index.map(|i| Retriever::new(i, self.embedder.clone(), self.settings.top_k));
        let memory = ConversationMemory::seeded(self.settings.memory_window, history);
        let chain = Chain::new(
            agent_id,
            instructions,
            fp,
            retriever,
            memory,
            self.model.clone(),
            self.retry.clone(),
            self.settings.clone(),
        );
        info!(
            agent_id,
            ?origin,
            retrieval = chain.has_retriever(),
            chunks = chain.retriever().map(Retriever::indexed_chunks).unwrap_or(0),
            "chain assembled"
        );
        Ok((chain, origin))
    }

    async fn index_documents(&self, documents: &[DocumentSource]) -> Result<VectorIndex, AppError> {
        let paths: Vec<PathBuf> = documents.iter().map(|d| d.read_from.clone()).collect();
        let recorded: HashMap<String, String> = documents
            .iter()
            .filter(|d| d.read_from != PathBuf::from(&d.recorded))
            .map(|d| (d.read_from.display().to_string(), d.recorded.clone()))
            .collect();
        let opts = self.loader.clone();
        let chunker = self.chunker;
        let chunks = tokio::task::spawn_blocking(move || {
            let mut segments = load_documents(&paths, &opts).map_err(|e| recorded_error(e, &recorded))?;
            for seg in &mut segments {
                if let Some(r) = recorded.get(&seg.source.display().to_string()) {
                    seg.source = PathBuf::from(r);
                }
            }
            Ok::<_, AppError>(chunker.chunk_segments(&segments))
        })
        .await
        .map_err(|e| AppError::Internal(format!("document loading task failed: {}", e)))??;

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_documents(&texts).await?;
        VectorIndex::build(self.embedder.dimension(), &chunks, vectors)
    }
}
