use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout error")]
    Timeout,

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<tokio::time::error::Elapsed> for NetworkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetworkError::Timeout
    }
}
