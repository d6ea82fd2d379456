use std::time::Duration;

use thiserror::Error;

/// Errors raised by the supervisor, health checker and lock manager.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown check method: {0} (expected pid, port, api or full)")]
    InvalidMethod(String),

    #[error("wallet-rpc for node {node} failed to start: {stderr}")]
    StartFailure { node: String, stderr: String },

    #[error("could not acquire lock {name} within {waited:?}")]
    LockTimeout { name: String, waited: Duration },

    #[error("process command line introspection is not available on this host")]
    IntrospectionUnavailable,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("node registry error: {0}")]
    Registry(String),

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
