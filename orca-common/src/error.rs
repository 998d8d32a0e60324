use std::error::Error;

#[derive(thiserror::Error, Debug)]
pub enum OrcaError {
    #[error("not found")]
    NotFound,
    #[error("denied by policy: {0}")]
    PolicyDenied(String),
    #[error("authentication required: {0}")]
    AuthRequired(String),
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("no managers registered in configuration")]
    NoManagersRegistered,
    #[error("manager returned HTTP {status}: {body}")]
    ManagerRejected { status: u16, body: String },
    #[error("session end")]
    SessionEnd,
    #[error("failed to parse URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("deserialization failed: {0}")]
    DeserializeJson(#[from] serde_json::Error),
    #[error(transparent)]
    SshKeys(#[from] russh::keys::Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl OrcaError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
