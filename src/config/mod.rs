use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::AppError;

/// Application configuration loaded once at startup and passed explicitly
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub retrieval: RetrievalConfig,
    pub server: ServerConfig,
    pub clarify: ClarifyConfig,
}

/// Chat-completion provider kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    /// Hosted OpenAI-compatible API; requires an API key.
    OpenAi,
    /// Self-hosted OpenAI-compatible server (Ollama, llama.cpp, vLLM).
    Local,
}

/// Chat model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// Embedding provider configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

/// Reranker configuration; reranking is skipped when no URL is set
#[derive(Debug, Clone, Default)]
pub struct RerankConfig {
    pub base_url: Option<String>,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request and retry configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Per-HTTP-call timeout.
    pub timeout_ms: u64,
    /// Operation-level deadline for an LLM-backed step.
    pub llm_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Retrieval tuning knobs
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub rerank_top_k: usize,
    pub expand_per_node: usize,
    pub expansion_discount: f32,
    pub rewrite_queries: bool,
    /// Tighter candidate count used when grounding plan generation.
    pub plan_top_k: usize,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    pub cors_origins: Vec<String>,
}

/// Clarification defaults
#[derive(Debug, Clone)]
pub struct ClarifyConfig {
    pub max_rounds: u32,
}

impl Config {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let provider = match env::var("TASKWING_LLM_PROVIDER")
            .unwrap_or_else(|_| "openai".to_string())
            .to_lowercase()
            .as_str()
        {
            "openai" => LlmProvider::OpenAi,
            "local" | "ollama" => LlmProvider::Local,
            other => {
                return Err(AppError::Config {
                    message: format!("Unknown TASKWING_LLM_PROVIDER: {}", other),
                })
            }
        };

        let default_llm_url = match provider {
            LlmProvider::OpenAi => "https://api.openai.com/v1",
            LlmProvider::Local => "http://localhost:11434/v1",
        };

        let llm = LlmConfig {
            provider,
            base_url: env::var("TASKWING_LLM_BASE_URL")
                .unwrap_or_else(|_| default_llm_url.to_string()),
            model: env::var("TASKWING_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key: non_empty_var("TASKWING_LLM_API_KEY").or_else(|| non_empty_var("OPENAI_API_KEY")),
        };

        if !llm.base_url.starts_with("http://") && !llm.base_url.starts_with("https://") {
            return Err(AppError::Config {
                message: format!(
                    "TASKWING_LLM_BASE_URL must be an http(s) URL, got '{}'",
                    llm.base_url
                ),
            });
        }

        let embedding = EmbeddingConfig {
            base_url: env::var("TASKWING_EMBED_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com".to_string()),
            model: non_empty_var("TASKWING_EMBED_MODEL")
                .or_else(|| Some("text-embedding-3-small".to_string())),
            api_key: non_empty_var("TASKWING_EMBED_API_KEY").or_else(|| llm.api_key.clone()),
        };

        let rerank = RerankConfig {
            base_url: non_empty_var("TASKWING_RERANK_BASE_URL"),
        };

        let memory_dir = env::var("TASKWING_MEMORY_DIR").unwrap_or_else(|_| "./.taskwing".to_string());
        let database = DatabaseConfig {
            path: PathBuf::from(memory_dir).join("memory.db"),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parse_var("REQUEST_TIMEOUT_MS", 30000),
            llm_timeout_ms: parse_var("LLM_TIMEOUT_MS", 60000),
            max_retries: parse_var("MAX_RETRIES", 2),
            retry_delay_ms: parse_var("RETRY_DELAY_MS", 500),
        };

        let retrieval = RetrievalConfig {
            top_k: parse_var("RETRIEVAL_TOP_K", 20),
            rerank_top_k: parse_var("RETRIEVAL_RERANK_TOP_K", 5),
            expand_per_node: parse_var("RETRIEVAL_EXPAND_PER_NODE", 2),
            expansion_discount: parse_var("RETRIEVAL_EXPANSION_DISCOUNT", 0.6),
            rewrite_queries: parse_var("RETRIEVAL_REWRITE_QUERIES", true),
            plan_top_k: parse_var("PLAN_TOP_K", 10),
        };

        let server = ServerConfig {
            addr: env::var("TASKWING_HTTP_ADDR").unwrap_or_else(|_| "127.0.0.1:5001".to_string()),
            cors_origins: env::var("TASKWING_CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:5173".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        let clarify = ClarifyConfig {
            max_rounds: parse_var("CLARIFY_MAX_ROUNDS", 5),
        };

        Ok(Config {
            llm,
            embedding,
            rerank,
            database,
            logging,
            request,
            retrieval,
            server,
            clarify,
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            llm_timeout_ms: 60000,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 20,
            rerank_top_k: 5,
            expand_per_node: 2,
            expansion_discount: 0.6,
            rewrite_queries: true,
            plan_top_k: 10,
        }
    }
}

impl Default for ClarifyConfig {
    fn default() -> Self {
        Self { max_rounds: 5 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5001".to_string(),
            cors_origins: vec!["http://localhost:5173".to_string()],
        }
    }
}

impl Default for Config {
    /// Built-in defaults with no environment applied.
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                provider: LlmProvider::OpenAi,
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
                api_key: None,
            },
            embedding: EmbeddingConfig {
                base_url: "https://api.openai.com".to_string(),
                model: Some("text-embedding-3-small".to_string()),
                api_key: None,
            },
            rerank: RerankConfig::default(),
            database: DatabaseConfig {
                path: PathBuf::from("./.taskwing/memory.db"),
                max_connections: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
            },
            request: RequestConfig::default(),
            retrieval: RetrievalConfig::default(),
            server: ServerConfig::default(),
            clarify: ClarifyConfig::default(),
        }
    }
}
