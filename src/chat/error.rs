use thiserror::Error;

/// Failures surfaced by the chat client.
///
/// `Auth`, `Network`, `Send` and `Stream` carry the upstream message verbatim
/// so the host can show it as-is.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Network(String),
    #[error("{0}")]
    Send(String),
    #[error("{0}")]
    Stream(String),
    #[error("timed out waiting for {0}")]
    ConnectTimeout(&'static str),
    #[error("connection attempt abandoned")]
    Abandoned,
    #[error("render target unavailable after {0} attempts")]
    RenderTargetUnavailable(u32),
}

impl ChatError {
    /// Whether the host may recover by calling `retry()`.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ChatError::Configuration(_))
    }
}
