//! Process-wide [`Settings`], assembled from environment variables.
//!
//! Mirrors the teacher crate's minimal `CloudLLMConfig`: a plain struct with typed accessors
//! and defaults, constructed once at process start and injected into the components that
//! need it. No file-format parsing dependency is introduced; every field maps to one of the
//! environment variables named in spec §6.
//!
//! # Example
//!
//! ```rust
//! use unpod::Settings;
//!
//! std::env::set_var("ENV", "qa");
//! std::env::set_var("REDIS_URL", "redis://localhost:6379");
//! let settings = Settings::from_env();
//! assert_eq!(settings.env, "qa");
//! ```

use std::env;

/// Typed view over the process environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `ENV` — `qa` or `prod`.
    pub env: String,
    pub redis_url: String,
    pub mongo_dsn: String,
    pub mongo_db: String,
    pub postgres_config: PostgresConfig,
    pub kafka_broker: String,
    /// `DJANGO_SECRET_KEY` — the JWT signing secret.
    pub jwt_signing_secret: String,
    pub agent_outbound_max_workers: usize,
    pub vector_backend: VectorBackend,
    pub embedding_backend: EmbeddingBackend,
    pub filter_threshold: f64,
    pub search_service_url: String,
    pub kb_min_remote_score: f64,
    pub kb_min_score: f64,
    pub agent_infra_mode: AgentInfraMode,
    pub livekit_inference_api_key: Option<String>,
    pub livekit_inference_api_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    Faiss,
    Chroma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    SentenceTransformers,
    Openvino,
    Onnx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentInfraMode {
    /// `livekit-inference` passthrough is gated on this mode (§6).
    Inference,
    Standard,
}

impl Settings {
    /// Builds a [`Settings`] from the current process environment, falling back to the
    /// same defaults the original deployment ships with for local/dev use.
    pub fn from_env() -> Self {
        Settings {
            env: env::var("ENV").unwrap_or_else(|_| "qa".to_string()),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            mongo_dsn: env::var("MONGO_DSN").unwrap_or_default(),
            mongo_db: env::var("MONGO_DB").unwrap_or_default(),
            postgres_config: PostgresConfig {
                host: env::var("POSTGRES_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
                port: env::var("POSTGRES_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5432),
                user: env::var("POSTGRES_USER").unwrap_or_default(),
                password: env::var("POSTGRES_PASSWORD").unwrap_or_default(),
                database: env::var("POSTGRES_DATABASE").unwrap_or_default(),
            },
            kafka_broker: env::var("KAFKA_BROKER").unwrap_or_default(),
            jwt_signing_secret: env::var("DJANGO_SECRET_KEY").unwrap_or_default(),
            agent_outbound_max_workers: env::var("AGENT_OUTBOUND_MAX_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            vector_backend: match env::var("VECTOR_BACKEND").as_deref() {
                Ok("chroma") => VectorBackend::Chroma,
                _ => VectorBackend::Faiss,
            },
            embedding_backend: match env::var("EMBEDDING_BACKEND").as_deref() {
                Ok("openvino") => EmbeddingBackend::Openvino,
                Ok("onnx") => EmbeddingBackend::Onnx,
                _ => EmbeddingBackend::SentenceTransformers,
            },
            filter_threshold: env::var("FILTER_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.5),
            search_service_url: env::var("SEARCH_SERVICE_URL").unwrap_or_default(),
            kb_min_remote_score: env::var("KB_MIN_REMOTE_SCORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.3),
            kb_min_score: env::var("KB_MIN_SCORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.2),
            agent_infra_mode: match env::var("AGENT_INFRA_MODE").as_deref() {
                Ok("inference") => AgentInfraMode::Inference,
                _ => AgentInfraMode::Standard,
            },
            livekit_inference_api_key: env::var("LIVEKIT_INFERENCE_API_KEY").ok(),
            livekit_inference_api_secret: env::var("LIVEKIT_INFERENCE_API_SECRET").ok(),
        }
    }

    /// `true` when `livekit-inference` may be selected as an LLM provider identifier (§6).
    pub fn livekit_inference_enabled(&self) -> bool {
        self.agent_infra_mode == AgentInfraMode::Inference
            && self.livekit_inference_api_key.is_some()
            && self.livekit_inference_api_secret.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable mutation races across tests in the same binary; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_are_applied_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("AGENT_INFRA_MODE");
        env::remove_var("VECTOR_BACKEND");
        let settings = Settings::from_env();
        assert_eq!(settings.agent_infra_mode, AgentInfraMode::Standard);
        assert_eq!(settings.vector_backend, VectorBackend::Faiss);
        assert!(!settings.livekit_inference_enabled());
    }

    #[test]
    fn livekit_inference_requires_mode_and_both_credentials() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("AGENT_INFRA_MODE", "inference");
        env::set_var("LIVEKIT_INFERENCE_API_KEY", "key");
        env::remove_var("LIVEKIT_INFERENCE_API_SECRET");
        let settings = Settings::from_env();
        assert!(!settings.livekit_inference_enabled());

        env::set_var("LIVEKIT_INFERENCE_API_SECRET", "secret");
        let settings = Settings::from_env();
        assert!(settings.livekit_inference_enabled());

        env::remove_var("AGENT_INFRA_MODE");
        env::remove_var("LIVEKIT_INFERENCE_API_KEY");
        env::remove_var("LIVEKIT_INFERENCE_API_SECRET");
    }
}
