use thiserror::Error;

use crate::config::ConfigError;
use crate::network::NetworkError;

#[derive(Error, Debug)]
pub enum ElectionError {
    #[error("Failed to open peer listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Election manager already started")]
    AlreadyStarted,

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ElectionError {
    pub(crate) fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        ElectionError::Bind {
            addr: addr.into(),
            source,
        }
    }
}
