use std::{
    num::NonZeroUsize,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

use anyhow::Result;
use axum::{
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::{signal, task, time::sleep};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod agent_service;
mod chain;
mod chain_cache;
mod chunker;
mod config;
mod embeddings;
mod error;
mod llm;
mod loader;
mod memory;
mod retry;
mod store;
mod vector_index;

#[cfg(test)]
mod test_support;

use agent_service::{AgentService, PrepareRequest, STAGING_DIR};
use chain::{ChainSettings, PipelineContext};
use chain_cache::{CacheMetrics, ChainCache};
use chunker::Chunker;
use config::{Config, EmbeddingBackend};
use embeddings::{CachedEmbedder, EmbeddingProvider, HashingEmbedder, HttpEmbedder};
use error::AppError;
use llm::{ChatCompletionsModel, LanguageModel};
use loader::LoaderOptions;
use retry::RetryPolicy;
use store::{Agent, ChatTurn, Session};

#[derive(Parser, Debug)]
#[command(name = "agent-chain-server", version, about = "Multi-tenant agent preparation and retrieval-chain service")]
struct Cli {
	/// Bind address for the HTTP server
	#[arg(long, env = "HTTP_BIND")]
	bind: Option<String>,

	/// Data directory root
	#[arg(long, env = "DATA_DIR")]
	data_dir: Option<String>,
}

struct AppState {
	start_time: Instant,
	config: Config,
	service: AgentService,
	embedder: Arc<CachedEmbedder>,
	model: Arc<dyn LanguageModel>,
}

#[derive(Serialize)]
struct Health { status: &'static str }

#[derive(Serialize)]
struct MessageResponse { message: &'static str }

#[derive(Deserialize)]
struct SessionCreate { name: String }

#[derive(Deserialize)]
struct AgentCreate { name: String, #[serde(default)] user_id: Option<i64> }

#[derive(Deserialize)]
struct AgentUpdate { name: String }

#[derive(Deserialize)]
struct ChatCreate { message: String }

#[derive(Serialize)]
struct RecordCounts { sessions: usize, agents: usize, chats: usize }

#[derive(Serialize)]
struct ProviderStatus { embedding_model: String, embedding_dim: usize, cached_embeddings: usize, language_model: String }

#[derive(Serialize)]
struct StatusResponse {
	uptime_ms: u128,
	chain_cache: CacheMetrics,
	records: RecordCounts,
	providers: ProviderStatus,
}

/// Authenticated user id, forwarded by the gateway in `X-User-Id`.
struct CurrentUser(i64);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
	type Rejection = AppError;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		parts
			.headers
			.get("x-user-id")
			.and_then(|v| v.to_str().ok())
			.and_then(|v| v.trim().parse::<i64>().ok())
			.map(CurrentUser)
			.ok_or(AppError::Unauthorized)
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	init_tracing();
	let cli = Cli::parse();
	let mut cfg = Config::load()?;
	if let Some(bind) = cli.bind.as_deref() { cfg.bind = bind.parse()?; }
	if let Some(dir) = cli.data_dir { cfg.data_dir = dir; }

	let dirs = ensure_data_dirs(&cfg.data_dir)?;
	let db = sled::open(dirs.warm.join("kv"))?;
	let (embedder, model) = providers_from_config(&cfg)?;
	let state = build_state(cfg, db, &dirs, embedder, model)?;

	let maint_state = state.clone();
	let maint_task = task::spawn(async move { maintenance_loop(maint_state).await; });

	let bind_addr = state.config.bind;
	info!(%bind_addr, data_dir = %state.config.data_dir, "Starting HTTP server");
	let app = build_router(state);
	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

	info!("Shutdown signal received");
	maint_task.abort();
	Ok(())
}

fn init_tracing() {
	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
	tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

struct DataDirs { warm: PathBuf, documents: PathBuf }

fn ensure_data_dirs(root: &str) -> Result<DataDirs> {
	let root = PathBuf::from(root);
	let warm = root.join("warm");
	let documents = root.join("documents");
	std::fs::create_dir_all(&warm)?;
	std::fs::create_dir_all(&documents)?;
	// uploads staged by a preparation that never finished
	let staging = documents.join(STAGING_DIR);
	if staging.exists() {
		std::fs::remove_dir_all(&staging)?;
	}
	Ok(DataDirs { warm, documents })
}

fn providers_from_config(cfg: &Config) -> Result<(Arc<dyn EmbeddingProvider>, Arc<dyn LanguageModel>)> {
	let embedder: Arc<dyn EmbeddingProvider> = match cfg.embedding_backend {
		EmbeddingBackend::Hashing => Arc::new(HashingEmbedder::new(cfg.embedding_dim)),
		EmbeddingBackend::Http => Arc::new(HttpEmbedder::new(
			&cfg.embedding_base_url,
			&cfg.embedding_model,
			cfg.embedding_api_key.clone(),
			cfg.embedding_dim,
			cfg.provider_timeout,
		)?),
	};
	let model: Arc<dyn LanguageModel> = Arc::new(ChatCompletionsModel::new(&cfg.llm_base_url, &cfg.model_name, cfg.llm_api_key.clone(), cfg.provider_timeout)?);
	Ok((embedder, model))
}

fn build_state(
	cfg: Config,
	db: sled::Db,
	dirs: &DataDirs,
	embedding_provider: Arc<dyn EmbeddingProvider>,
	model: Arc<dyn LanguageModel>,
) -> Result<Arc<AppState>> {
	let retry = RetryPolicy::new(cfg.provider_max_retries, cfg.provider_timeout);
	let embedder = Arc::new(CachedEmbedder::new(&db, embedding_provider, retry.clone())?);
	let store = store::Store::open(&db)?;
	let capacity = NonZeroUsize::new(cfg.cache_capacity).ok_or_else(|| anyhow::anyhow!("CHAIN_CACHE_CAPACITY must be positive"))?;
	let cache = Arc::new(ChainCache::new(capacity, cfg.cache_ttl));
	let pipeline = PipelineContext {
		db,
		embedder: embedder.clone(),
		model: model.clone(),
		retry,
		chunker: Chunker::new(cfg.chunk_size, cfg.chunk_overlap)?,
		loader: LoaderOptions { pdf_max_pages: cfg.pdf_max_pages },
		settings: ChainSettings {
			temperature: cfg.temperature,
			condense_question: cfg.condense_question,
			memory_window: cfg.memory_window,
			top_k: cfg.top_k,
		},
	};
	let service = AgentService::new(store, cache, pipeline, dirs.documents.clone(), cfg.max_concurrent_prepare);
	info!(
		embedding_model = embedder.model_id(),
		language_model = model.model_id(),
		cache_capacity = cfg.cache_capacity,
		"state initialised"
	);
	Ok(Arc::new(AppState { start_time: Instant::now(), config: cfg, service, embedder, model }))
}

fn build_router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/status", get(status))
		.route("/sessions", post(create_session).get(list_sessions))
		.route("/sessions/:sid/agents", post(create_agent).get(list_agents))
		.route("/sessions/:sid/agents/:aid", get(get_agent).put(update_agent).delete(delete_agent))
		.route("/sessions/:sid/agents/:aid/prepare", post(prepare_agent))
		.route("/sessions/:sid/agents/:aid/chat", post(chat_with_agent))
		.layer(TraceLayer::new_for_http())
		.with_state(state)
}

async fn health() -> Json<Health> { Json(Health { status: "ok" }) }

async fn status(State(state): State<Arc<AppState>>, CurrentUser(_): CurrentUser) -> Json<StatusResponse> {
	let (sessions, agents, chats) = state.service.store().counts();
	Json(StatusResponse {
		uptime_ms: state.start_time.elapsed().as_millis(),
		chain_cache: state.service.cache().metrics().await,
		records: RecordCounts { sessions, agents, chats },
		providers: ProviderStatus {
			embedding_model: state.embedder.model_id().to_string(),
			embedding_dim: state.embedder.dimension(),
			cached_embeddings: state.embedder.cached_items(),
			language_model: state.model.model_id().to_string(),
		},
	})
}

async fn create_session(State(state): State<Arc<AppState>>, CurrentUser(user): CurrentUser, Json(req): Json<SessionCreate>) -> Result<Json<Session>, AppError> {
	Ok(Json(state.service.create_session(user, &req.name)?))
}

async fn list_sessions(State(state): State<Arc<AppState>>, CurrentUser(user): CurrentUser) -> Result<Json<Vec<Session>>, AppError> {
	Ok(Json(state.service.store().sessions_for_user(user)?))
}

async fn create_agent(
	State(state): State<Arc<AppState>>,
	CurrentUser(user): CurrentUser,
	Path(sid): Path<String>,
	Json(req): Json<AgentCreate>,
) -> Result<Json<Agent>, AppError> {
	Ok(Json(state.service.create_agent(user, &sid, &req.name, req.user_id)?))
}

async fn list_agents(State(state): State<Arc<AppState>>, CurrentUser(user): CurrentUser, Path(sid): Path<String>) -> Result<Json<Vec<Agent>>, AppError> {
	Ok(Json(state.service.list_agents(user, &sid)?))
}

async fn get_agent(State(state): State<Arc<AppState>>, CurrentUser(user): CurrentUser, Path((sid, aid)): Path<(String, String)>) -> Result<Json<Agent>, AppError> {
	Ok(Json(state.service.owned_agent(user, &sid, &aid)?))
}

async fn update_agent(
	State(state): State<Arc<AppState>>,
	CurrentUser(user): CurrentUser,
	Path((sid, aid)): Path<(String, String)>,
	Json(req): Json<AgentUpdate>,
) -> Result<Json<Agent>, AppError> {
	Ok(Json(state.service.rename_agent(user, &sid, &aid, &req.name)?))
}

async fn delete_agent(State(state): State<Arc<AppState>>, CurrentUser(user): CurrentUser, Path((sid, aid)): Path<(String, String)>) -> Result<Json<MessageResponse>, AppError> {
	state.service.delete_agent(user, &sid, &aid).await?;
	Ok(Json(MessageResponse { message: "Agent deleted successfully" }))
}

async fn prepare_agent(
	State(state): State<Arc<AppState>>,
	CurrentUser(user): CurrentUser,
	Path((sid, aid)): Path<(String, String)>,
	Json(req): Json<PrepareRequest>,
) -> Result<Json<MessageResponse>, AppError> {
	state.service.prepare(user, &sid, &aid, req).await?;
	Ok(Json(MessageResponse { message: "Agent prepared successfully" }))
}

async fn chat_with_agent(
	State(state): State<Arc<AppState>>,
	CurrentUser(user): CurrentUser,
	Path((sid, aid)): Path<(String, String)>,
	Json(req): Json<ChatCreate>,
) -> Result<Json<ChatTurn>, AppError> {
	Ok(Json(state.service.chat(user, &sid, &aid, &req.message).await?))
}

async fn maintenance_loop(state: Arc<AppState>) {
	loop {
		sleep(state.config.maintenance_interval).await;
		let pruned = state.service.cache().prune().await;
		debug!(pruned, locks = state.service.cache().lock_count(), "chain cache maintenance");
	}
}

async fn shutdown_signal() {
	let _ = signal::ctrl_c().await;
}
