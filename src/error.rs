//! Error types for the xbeed daemon

use thiserror::Error;

pub type Result<T> = std::result::Result<T, XbeedError>;

#[derive(Error, Debug)]
pub enum XbeedError {
    #[error("Link error: {0}")]
    Link(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wire protocol error: {0}")]
    Protocol(String),

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Client protocol error: {0}")]
    Client(String),

    #[error("Tokio task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
