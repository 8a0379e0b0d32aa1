use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{program} failed: {message}")]
    Command { program: String, message: String },

    #[error("peer {id} not found")]
    PeerNotFound { id: String },

    #[error("port forwarding is disabled")]
    Disabled,
}

pub type Result<T> = std::result::Result<T, Error>;
