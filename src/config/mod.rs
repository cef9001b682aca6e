// src/config/mod.rs
// Central configuration for the ChatDF backend

pub mod helpers;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use helpers::{env_bool, env_or, env_parsed_or};

lazy_static! {
    pub static ref CONFIG: ChatDfConfig = ChatDfConfig::from_env();
}

/// Main configuration structure - composes all domain configs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDfConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gemini: GeminiConfig,
    pub limits: LimitsConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
    pub uploads: UploadConfig,
    pub session: SessionConfig,
}

impl ChatDfConfig {
    pub fn from_env() -> Self {
        // Don't panic if .env doesn't exist (for production)
        dotenv::dotenv().ok();

        Self {
            server: ServerConfig::from_env(),
            database: DatabaseConfig::from_env(),
            gemini: GeminiConfig::from_env(),
            limits: LimitsConfig::from_env(),
            worker: WorkerConfig::from_env(),
            cache: CacheConfig::from_env(),
            uploads: UploadConfig::from_env(),
            session: SessionConfig::from_env(),
        }
    }

    /// Validate config on startup
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.gemini.api_key.is_empty() {
            tracing::warn!("GEMINI_API_KEY is empty - LLM calls will fail");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("CHATDF_HOST", "127.0.0.1"),
            port: env_parsed_or("CHATDF_PORT", 8000),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_or("DATABASE_URL", "sqlite://data/chatdf.db?mode=rwc"),
            max_connections: env_parsed_or("SQLITE_MAX_CONNECTIONS", 5),
        }
    }
}

/// Gemini API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env_or("GEMINI_API_KEY", ""),
            model: env_or("GEMINI_MODEL", "gemini-2.5-flash"),
            max_retries: env_parsed_or("MAX_GEMINI_RETRIES", 3),
            retry_base_delay_secs: env_parsed_or("GEMINI_RETRY_BASE_DELAY", 2),
        }
    }
}

/// Rate limiting and per-turn budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub token_limit: i64,
    pub rate_limit_cache_ttl_secs: u64,
    pub max_datasets_per_conversation: i64,
    pub max_result_rows: usize,
    pub max_query_rows: usize,
    pub max_tool_calls_per_turn: u32,
    pub max_sql_retries: u32,
    pub max_context_messages: usize,
    pub max_context_tokens: usize,
}

impl LimitsConfig {
    pub fn from_env() -> Self {
        Self {
            token_limit: env_parsed_or("TOKEN_LIMIT", 5_000_000),
            rate_limit_cache_ttl_secs: env_parsed_or("RATE_LIMIT_CACHE_TTL", 60),
            max_datasets_per_conversation: env_parsed_or("MAX_DATASETS_PER_CONVERSATION", 50),
            max_result_rows: env_parsed_or("MAX_RESULT_ROWS", 1000),
            max_query_rows: env_parsed_or("MAX_QUERY_ROWS", 10_000),
            max_tool_calls_per_turn: env_parsed_or("MAX_TOOL_CALLS_PER_TURN", 5),
            max_sql_retries: env_parsed_or("MAX_SQL_RETRIES", 3),
            max_context_messages: env_parsed_or("MAX_CONTEXT_MESSAGES", 50),
            max_context_tokens: env_parsed_or("MAX_CONTEXT_TOKENS", 200_000),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub validate_timeout_secs: u64,
    pub schema_timeout_secs: u64,
    pub query_timeout_secs: u64,
    /// Test switch: skip the private/loopback IP guard on URL validation.
    pub allow_private_urls: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            pool_size: env_parsed_or("DEFAULT_POOL_SIZE", 4),
            validate_timeout_secs: env_parsed_or("VALIDATE_TIMEOUT", 30),
            schema_timeout_secs: env_parsed_or("SCHEMA_TIMEOUT", 60),
            query_timeout_secs: env_parsed_or("QUERY_TIMEOUT", 300),
            allow_private_urls: env_bool("CHATDF_ALLOW_PRIVATE_URLS"),
        }
    }
}

/// File cache and query result cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_dir: String,
    pub max_cache_bytes: u64,
    pub max_file_bytes: u64,
    pub stale_temp_max_age_secs: u64,
    pub persistent_ttl_secs: i64,
    pub max_persistent_cache_size: i64,
    pub memory_cache_size: usize,
    pub memory_cache_ttl_secs: u64,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            cache_dir: env_or("CACHE_DIR", "data/file_cache"),
            max_cache_bytes: env_parsed_or("MAX_CACHE_BYTES", 10 * 1024 * 1024 * 1024),
            max_file_bytes: env_parsed_or("MAX_FILE_BYTES", 500 * 1024 * 1024),
            stale_temp_max_age_secs: env_parsed_or("STALE_TEMP_MAX_AGE_SECONDS", 3600),
            persistent_ttl_secs: env_parsed_or("PERSISTENT_TTL_SECONDS", 3600),
            max_persistent_cache_size: env_parsed_or("MAX_PERSISTENT_CACHE_SIZE", 1000),
            memory_cache_size: env_parsed_or("MEMORY_CACHE_SIZE", 100),
            memory_cache_ttl_secs: env_parsed_or("MEMORY_CACHE_TTL", 3600),
        }
    }
}

/// Upload directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub upload_dir: String,
    pub max_upload_size_mb: u64,
}

impl UploadConfig {
    pub fn from_env() -> Self {
        Self {
            upload_dir: env_or("UPLOAD_DIR", "data/uploads"),
            max_upload_size_mb: env_parsed_or("MAX_UPLOAD_SIZE_MB", 100),
        }
    }
}

/// Session lifetime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub duration_days: i64,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self {
            duration_days: env_parsed_or("SESSION_DURATION_DAYS", 7),
        }
    }
}
