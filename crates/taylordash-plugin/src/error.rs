//! Plugin event distribution error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("event router stopped")]
    RouterStopped,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
