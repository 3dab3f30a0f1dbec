use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the library surfaces to its callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid construction parameters. Never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown loader `{0}` (expected redis_http, redis_stats or nothing)")]
    UnknownLoader(String),

    /// A malformed digest or aggregate payload.
    #[error("cannot decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// `run` was called on an orchestrator that was already killed.
    #[error("orchestrator was killed and cannot be restarted")]
    Killed,

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

impl Error {
    pub(crate) fn decode(what: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { what, source }
    }
}
