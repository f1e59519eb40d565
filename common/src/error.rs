use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by an event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("backend error: {0}")]
    Backend(String),

    /// Every attempt hit lock contention and the store is configured to fail loudly.
    #[error("{operation} gave up after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },
}

/// Problems reading target input.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("failed to read list file {path}: {source}")]
    ListFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid proxy url: {0}")]
    InvalidUrl(String),

    #[error("unsupported proxy scheme '{0}', expected socks5 or socks5h")]
    UnsupportedScheme(String),
}

/// Errors that abort a scan before or during dispatch.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no targets left after normalization")]
    NoTargets,

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error(transparent)]
    Targets(#[from] TargetError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
