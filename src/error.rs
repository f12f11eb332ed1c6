//! Error types for the supervisor.

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Supervisor error type covering all failure modes.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sniff: {0}")]
    Sniff(String),

    #[error("probe: {0}")]
    Probe(String),

    #[error("store: {0}")]
    Store(String),

    #[error("payload: {0}")]
    Payload(String),
}
