use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum EmbeddingBackend {
	Hashing,
	Http,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub bind: SocketAddr,
	pub data_dir: String,
	pub chunk_size: usize,
	pub chunk_overlap: usize,
	pub top_k: usize,
	pub memory_window: usize,
	pub condense_question: bool,
	pub embedding_backend: EmbeddingBackend,
	pub embedding_model: String,
	pub embedding_base_url: String,
	pub embedding_api_key: Option<String>,
	pub embedding_dim: usize,
	pub model_name: String,
	pub llm_base_url: String,
	pub llm_api_key: Option<String>,
	pub temperature: f32,
	pub provider_timeout: Duration,
	pub provider_max_retries: usize,
	pub cache_capacity: usize,
	pub cache_ttl: Option<Duration>,
	pub max_concurrent_prepare: usize,
	pub pdf_max_pages: usize,
	pub maintenance_interval: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
			data_dir: "./data".to_string(),
			chunk_size: 1000,
			chunk_overlap: 10,
			top_k: 4,
			memory_window: 0,
			condense_question: true,
			embedding_backend: EmbeddingBackend::Hashing,
			embedding_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
			embedding_base_url: "http://127.0.0.1:8081/v1".to_string(),
			embedding_api_key: None,
			embedding_dim: 384,
			model_name: "llama-3.1-8b-instant".to_string(),
			llm_base_url: "https://api.groq.com/openai/v1".to_string(),
			llm_api_key: None,
			temperature: 0.4,
			provider_timeout: Duration::from_millis(60_000),
			provider_max_retries: 0,
			cache_capacity: 256,
			cache_ttl: None,
			max_concurrent_prepare: 4,
			pdf_max_pages: 0,
			maintenance_interval: Duration::from_millis(60_000),
		}
	}
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
	std::env::var(key).ok().and_then(|v| parse_setting(key, &v))
}

/// A set but malformed value falls back to the default, loudly.
fn parse_setting<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
	match raw.trim().parse::<T>() {
		Ok(v) => Some(v),
		Err(_) => {
			tracing::warn!(key, value = raw, "ignoring unparsable setting, using default");
			None
		}
	}
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
	pub fn load() -> anyhow::Result<Self> {
		let _ = dotenvy::dotenv();
		let defaults = Self::default();
		let port = env_parse::<u16>("PORT");
		let bind = if let Some(p) = port { format!("127.0.0.1:{}", p) } else { std::env::var("HTTP_BIND").unwrap_or_else(|_| defaults.bind.to_string()) };
		let bind: SocketAddr = bind.parse()?;
		let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| defaults.data_dir.clone());

		let embedding_backend = match env_string("EMBEDDING_PROVIDER").as_deref().map(str::to_ascii_lowercase).as_deref() {
			None | Some("hashing") => EmbeddingBackend::Hashing,
			Some("http") => EmbeddingBackend::Http,
			Some(other) => anyhow::bail!("unknown EMBEDDING_PROVIDER: {}", other),
		};

		let cfg = Self {
			bind,
			data_dir,
			chunk_size: env_parse("CHUNK_SIZE").unwrap_or(defaults.chunk_size),
			chunk_overlap: env_parse("CHUNK_OVERLAP").unwrap_or(defaults.chunk_overlap),
			top_k: env_parse("RETRIEVAL_TOP_K").unwrap_or(defaults.top_k),
			memory_window: env_parse("MEMORY_WINDOW").unwrap_or(defaults.memory_window),
			condense_question: env_parse("CONDENSE_QUESTION").unwrap_or(defaults.condense_question),
			embedding_backend,
			embedding_model: env_string("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
			embedding_base_url: env_string("EMBEDDING_BASE_URL").unwrap_or(defaults.embedding_base_url),
			embedding_api_key: env_string("EMBEDDING_API_KEY"),
			embedding_dim: env_parse("EMBEDDING_DIM").unwrap_or(defaults.embedding_dim),
			model_name: env_string("MODEL_NAME").unwrap_or(defaults.model_name),
			llm_base_url: env_string("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
			llm_api_key: env_string("GROQ_API_KEY").or_else(|| env_string("LLM_API_KEY")),
			temperature: env_parse("LLM_TEMPERATURE").unwrap_or(defaults.temperature),
			provider_timeout: env_parse("PROVIDER_TIMEOUT_MS").map(Duration::from_millis).unwrap_or(defaults.provider_timeout),
			provider_max_retries: env_parse("PROVIDER_MAX_RETRIES").unwrap_or(defaults.provider_max_retries),
			cache_capacity: env_parse("CHAIN_CACHE_CAPACITY").unwrap_or(defaults.cache_capacity),
			cache_ttl: env_parse::<u64>("CHAIN_CACHE_TTL_SECS").filter(|s| *s > 0).map(Duration::from_secs),
			max_concurrent_prepare: env_parse("MAX_CONCURRENT_PREPARE").unwrap_or(defaults.max_concurrent_prepare),
			pdf_max_pages: env_parse("PDF_MAX_PAGES").unwrap_or(defaults.pdf_max_pages),
			maintenance_interval: env_parse("MAINTENANCE_INTERVAL_MS").map(Duration::from_millis).unwrap_or(defaults.maintenance_interval),
		};
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		if self.chunk_size == 0 || self.chunk_overlap >= self.chunk_size {
			anyhow::bail!("CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})", self.chunk_overlap, self.chunk_size);
		}
		if self.embedding_dim == 0 {
			anyhow::bail!("EMBEDDING_DIM must be positive");
		}
		if self.top_k == 0 {
			anyhow::bail!("RETRIEVAL_TOP_K must be positive");
		}
		if self.cache_capacity == 0 {
			anyhow::bail!("CHAIN_CACHE_CAPACITY must be positive");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_pipeline_constants() {
		let cfg = Config::default();
		assert_eq!(cfg.chunk_size, 1000);
		assert_eq!(cfg.chunk_overlap, 10);
		assert_eq!(cfg.top_k, 4);
		assert_eq!(cfg.embedding_dim, 384);
		assert!((cfg.temperature - 0.4).abs() < f32::EPSILON);
		assert_eq!(cfg.provider_max_retries, 0);
		assert!(cfg.validate().is_ok());
	}

	#[test]
	fn overlap_not_smaller_than_size_is_rejected() {
		let cfg = Config { chunk_size: 10, chunk_overlap: 10, ..Config::default() };
		assert!(cfg.validate().is_err());
		let cfg = Config { chunk_size: 0, chunk_overlap: 0, ..Config::default() };
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn malformed_settings_fall_back() {
		assert_eq!(parse_setting::<usize>("CHUNK_SIZE", " 512 "), Some(512));
		assert_eq!(parse_setting::<usize>("CHUNK_SIZE", "abc"), None);
		assert_eq!(parse_setting::<bool>("CONDENSE_QUESTION", "false"), Some(false));
		assert_eq!(parse_setting::<f32>("TEMPERATURE", "warm"), None);
	}
}
