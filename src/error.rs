use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("not the cluster leader; refusing connection from {0}")]
    NotLeader(SocketAddr),

    #[error("i/o failure on connection {connection_id}: {source}")]
    ConnectionIo {
        connection_id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("bind to {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start the framer thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("engine has been closed")]
    EngineClosed,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Sink for hard failures that cannot be signalled to a library.
///
/// Soft failures (back-pressure, partial writes) are retried internally and
/// never reach this handler; protocol errors go to the publication bus as
/// `GatewayError` records instead.
pub trait ErrorHandler: Send {
    fn on_error(&mut self, error: EngineError);
}

/// Default handler: records the failure on the error log stream.
#[derive(Debug, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_error(&mut self, error: EngineError) {
        tracing::error!(%error, "engine error");
    }
}
