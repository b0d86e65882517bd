use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chain::{fingerprint, Chain, DocumentSource, PipelineContext};
use crate::chain_cache::ChainCache;
use crate::error::AppError;
use crate::loader::DocumentKind;
use crate::memory::Turn;
use crate::store::{Agent, ChatTurn, Session, Store};
use crate::vector_index::VectorIndex;

#[derive(Deserialize, Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub content_base64: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PrepareRequest {
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub document_paths: Vec<String>,
    #[serde(default)]
    pub uploads: Vec<Upload>,
}

/// Uploads are written here first, one directory per preparation, and only
/// moved under the agent's directory once the chain built from them succeeds.
pub const STAGING_DIR: &str = ".staging";

struct DecodedUpload {
    name: String,
    bytes: Vec<u8>,
    target: PathBuf,
}

struct StagedFile {
    staged: PathBuf,
    target: PathBuf,
}

struct StagedUploads {
    dir: PathBuf,
    files: Vec<StagedFile>,
}

impl StagedUploads {
    /// Moves every staged file over its target, replacing earlier uploads of the same name.
    async fn commit(self, agent_dir: &Path) -> Result<(), AppError> {
        if self.files.is_empty() {
            return Ok(());
        }
        if let Err(e) = tokio::fs::create_dir_all(agent_dir).await {
            self.discard().await;
            return Err(AppError::Storage(e.to_string()));
        }
        for file in &self.files {
            if let Err(e) = tokio::fs::rename(&file.staged, &file.target).await {
                self.discard().await;
                return Err(AppError::Storage(format!("failed to move upload into place: {}", e)));
            }
        }
        self.discard().await;
        Ok(())
    }

    async fn discard(&self) {
        if !self.dir.exists() {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove staged uploads");
        }
    }
}

/// Checks names, extensions and encodings of every upload before anything touches the disk.
fn decode_uploads(agent_dir: &Path, uploads: &[Upload]) -> Result<Vec<DecodedUpload>, AppError> {
    let mut decoded: Vec<DecodedUpload> = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let name = Path::new(&upload.filename)
            .file_name()
            .filter(|n| n.to_string_lossy() == upload.filename)
            .ok_or_else(|| AppError::InvalidInput(format!("invalid upload filename: {}", upload.filename)))?;
        DocumentKind::from_path(Path::new(name))?;
        if decoded.iter().any(|d| d.name == upload.filename) {
            return Err(AppError::InvalidInput(format!("duplicate upload filename: {}", upload.filename)));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(upload.content_base64.trim())
            .map_err(|e| AppError::InvalidInput(format!("upload {} is not valid base64: {}", upload.filename, e)))?;
        decoded.push(DecodedUpload { name: upload.filename.clone(), bytes, target: agent_dir.join(name) });
    }
    Ok(decoded)
}

/// Relative client paths name files in the agent's upload directory.
fn resolve_client_path(agent_dir: &Path, raw: &str) -> Result<PathBuf, AppError> {
    DocumentKind::from_path(Path::new(raw))?;
    let path = Path::new(raw);
    Ok(if path.is_absolute() { path.to_path_buf() } else { agent_dir.join(path) })
}

/// Accepts `path` only if it resolves, symlinks included, to an existing file
/// inside the agent's upload directory.
async fn confine(agent_dir: &Path, path: PathBuf, raw: &str) -> Result<PathBuf, AppError> {
    let outside = || AppError::forbidden(format!("document {} is not one of this agent's uploads", raw));
    let root = tokio::fs::canonicalize(agent_dir).await.map_err(|_| outside())?;
    let resolved = tokio::fs::canonicalize(&path).await.map_err(|_| outside())?;
    let is_file = tokio::fs::metadata(&resolved).await.map(|m| m.is_file()).unwrap_or(false);
    if !resolved.starts_with(&root) || !is_file {
        return Err(outside());
    }
    Ok(path)
}

/// Agent lifecycle on top of the store, the pipeline builder and the chain cache.
pub struct AgentService {
    store: Store,
    cache: Arc<ChainCache>,
    pipeline: PipelineContext,
    documents_dir: PathBuf,
    prepare_sema: Semaphore,
}

impl AgentService {
    pub fn new(store: Store, cache: Arc<ChainCache>, pipeline: PipelineContext, documents_dir: PathBuf, max_concurrent_prepare: usize) -> Self {
        Self { store, cache, pipeline, documents_dir, prepare_sema: Semaphore::new(max_concurrent_prepare.max(1)) }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn cache(&self) -> &ChainCache {
        &self.cache
    }

    fn owned_session(&self, user_id: i64, session_id: &str) -> Result<Session, AppError> {
        let session = self.store.get_session(session_id)?.ok_or_else(|| AppError::not_found("session", session_id))?;
        if session.user_id != user_id {
            return Err(AppError::forbidden("session belongs to another user"));
        }
        Ok(session)
    }

    /// The agent must live in `session_id` and belong to `user_id`.
    pub fn owned_agent(&self, user_id: i64, session_id: &str, agent_id: &str) -> Result<Agent, AppError> {
        let agent = self
            .store
            .get_agent(agent_id)?
            .filter(|a| a.session_id == session_id)
            .ok_or_else(|| AppError::not_found("agent", agent_id))?;
        if agent.user_id != user_id {
            return Err(AppError::forbidden("you do not have permission to use this agent"));
        }
        Ok(agent)
    }

    pub fn create_session(&self, user_id: i64, name: &str) -> Result<Session, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("session name must not be empty".into()));
        }
        self.store.create_session(user_id, name)
    }

    pub fn create_agent(&self, user_id: i64, session_id: &str, name: &str, claimed_user: Option<i64>) -> Result<Agent, AppError> {
        if claimed_user.is_some_and(|u| u != user_id) {
            return Err(AppError::forbidden("cannot create an agent for another user"));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("agent name must not be empty".into()));
        }
        self.owned_session(user_id, session_id)?;
        let agent = self.store.create_agent(session_id, user_id, name)?;
        info!(agent_id = %agent.id, session_id, "agent created");
        Ok(agent)
    }

    pub fn list_agents(&self, user_id: i64, session_id: &str) -> Result<Vec<Agent>, AppError> {
        self.owned_session(user_id, session_id)?;
        self.store.agents_in_session(session_id)
    }

    pub fn rename_agent(&self, user_id: i64, session_id: &str, agent_id: &str, name: &str) -> Result<Agent, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidInput("agent name must not be empty".into()));
        }
        let mut agent = self.owned_agent(user_id, session_id, agent_id)?;
        agent.name = name.to_string();
        agent.updated_at = Utc::now();
        self.store.put_agent(&agent)?;
        Ok(agent)
    }

    /// Deletes the record, its chat history, its cached chain, its persisted
    /// index and its uploaded documents.
    pub async fn delete_agent(&self, user_id: i64, session_id: &str, agent_id: &str) -> Result<(), AppError> {
        self.owned_agent(user_id, session_id, agent_id)?;
        let _guard = self.cache.lock_agent(agent_id).await;
        self.cache.remove(agent_id).await;
        VectorIndex::drop_persisted(&self.pipeline.db, agent_id)?;
        if !self.store.delete_agent(agent_id)? {
            return Err(AppError::not_found("agent", agent_id));
        }
        let uploads = self.documents_dir.join(agent_id);
        if uploads.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&uploads).await {
                warn!(agent_id, error = %e, "failed to remove uploaded documents");
            }
        }
        info!(agent_id, "agent deleted");
        Ok(())
    }

    /// Builds a fresh chain from `req`, persists the new instructions and
    /// document list on the agent and caches the chain. Nothing is recorded,
    /// and no uploaded file lands under the agent's directory, unless every
    /// document loads and embeds.
    pub async fn prepare(&self, user_id: i64, session_id: &str, agent_id: &str, req: PrepareRequest) -> Result<Agent, AppError> {
        self.owned_agent(user_id, session_id, agent_id)?;
        let _permit = self
            .prepare_sema
            .acquire()
            .await
            .map_err(|e| AppError::Internal(format!("prepare semaphore closed: {}", e)))?;
        let _guard = self.cache.lock_agent(agent_id).await;

        let agent_dir = self.documents_dir.join(agent_id);
        let uploads = decode_uploads(&agent_dir, &req.uploads)?;
        let mut recorded: Vec<String> = Vec::with_capacity(req.document_paths.len() + uploads.len());
        for p in &req.document_paths {
            let path = resolve_client_path(&agent_dir, p)?;
            let pending = uploads.iter().any(|u| u.target == path);
            let path = if pending { path } else { confine(&agent_dir, path, p).await? };
            recorded.push(path.display().to_string());
        }
        for u in &uploads {
            let target = u.target.display().to_string();
            if !recorded.contains(&target) {
                recorded.push(target);
            }
        }

        let staged = self.stage_uploads(uploads).await?;
        let documents: Vec<DocumentSource> = recorded
            .iter()
            .map(|r| match staged.files.iter().find(|f| f.target.display().to_string() == *r) {
                Some(f) => DocumentSource { recorded: r.clone(), read_from: f.staged.clone() },
                None => DocumentSource::at(r),
            })
            .collect();
        info!(agent_id, documents = documents.len(), staged = staged.files.len(), "preparing agent");

        let built = self.pipeline.build_chain_from(agent_id, &req.instructions, &documents, false, Vec::new()).await;
        let (chain, origin) = match built {
            Ok(built) => built,
            Err(e) => {
                staged.discard().await;
                return Err(e);
            }
        };
        staged.commit(&agent_dir).await?;

        let mut agent = self.store.get_agent(agent_id)?.ok_or_else(|| AppError::not_found("agent", agent_id))?;
        agent.prompt_template = Some(req.instructions.clone());
        agent.set_document_paths(&recorded)?;
        agent.updated_at = Utc::now();
        self.store.put_agent(&agent)?;

        self.cache.put(agent_id, Arc::new(chain)).await;
        info!(agent_id, ?origin, "agent prepared");
        Ok(agent)
    }

    async fn stage_uploads(&self, uploads: Vec<DecodedUpload>) -> Result<StagedUploads, AppError> {
        let dir = self.documents_dir.join(STAGING_DIR).join(Uuid::new_v4().to_string());
        let mut staged = StagedUploads { dir, files: Vec::with_capacity(uploads.len()) };
        if uploads.is_empty() {
            return Ok(staged);
        }
        if let Err(e) = tokio::fs::create_dir_all(&staged.dir).await {
            return Err(AppError::Storage(e.to_string()));
        }
        for (i, upload) in uploads.into_iter().enumerate() {
            let path = staged.dir.join(format!("{:04}-{}", i, upload.name));
            if let Err(e) = tokio::fs::write(&path, &upload.bytes).await {
                staged.discard().await;
                return Err(AppError::Storage(e.to_string()));
            }
            staged.files.push(StagedFile { staged: path, target: upload.target });
        }
        Ok(staged)
    }

    /// Cached chain if it was built from the agent's current record, otherwise
    /// a rebuild under the agent lock.
    pub async fn chain_for_agent(&self, agent: &Agent) -> Result<Arc<Chain>, AppError> {
        let expected = fingerprint(agent.instructions(), &agent.document_paths()?);
        if let Some(chain) = self.cache.get(&agent.id).await {
            if chain.fingerprint() == expected {
                return Ok(chain);
            }
        }

        let _guard = self.cache.lock_agent(&agent.id).await;
        // A preparation may have finished while we waited for the lock.
        let agent = self.store.get_agent(&agent.id)?.ok_or_else(|| AppError::not_found("agent", &agent.id))?;
        let paths = agent.document_paths()?;
        let expected = fingerprint(agent.instructions(), &paths);
        if let Some(chain) = self.cache.get(&agent.id).await {
            if chain.fingerprint() == expected {
                return Ok(chain);
            }
        }

        warn!(agent_id = %agent.id, "chain missing or stale, rebuilding");
        let history = self
            .store
            .chats_for_agent(&agent.id, self.pipeline.settings.memory_window)?
            .into_iter()
            .map(|t| Turn { user: t.message, assistant: t.response });
        let (chain, origin) = self
            .pipeline
            .build_chain(&agent.id, agent.instructions(), &paths, true, history.collect())
            .await
            .map_err(|e| AppError::RebuildFailure { agent_id: agent.id.clone(), source: Box::new(e) })?;
        let chain = Arc::new(chain);
        self.cache.record_rebuild();
        self.cache.put(&agent.id, chain.clone()).await;
        let remembered = chain.memory_len().await;
        info!(agent_id = %agent.id, ?origin, remembered, "chain rebuilt and cached");
        Ok(chain)
    }

    /// Ownership is verified before any provider is called; the turn is only
    /// recorded when generation succeeds.
    pub async fn chat(&self, user_id: i64, session_id: &str, agent_id: &str, message: &str) -> Result<ChatTurn, AppError> {
        if message.trim().is_empty() {
            return Err(AppError::InvalidInput("message must not be empty".into()));
        }
        let agent = self.owned_agent(user_id, session_id, agent_id)?;
        let chain = self.chain_for_agent(&agent).await?;
        let response = chain.invoke(message).await?;
        let turn = ChatTurn {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            user_id,
            message: message.to_string(),
            response,
            created_at: Utc::now(),
        };
        self.store.append_chat(&turn)?;
        Ok(turn)
    }
}
