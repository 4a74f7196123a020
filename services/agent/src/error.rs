use outpost_mux::MuxError;
use outpost_wire::WireError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot reach server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The server refused the registration. Retrying will not help.
    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("session lost: {0}")]
    SessionLost(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Mux(#[from] MuxError),
}

impl AgentError {
    /// Whether reconnecting could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AgentError::Config(_) | AgentError::Rejected(_))
    }
}
