use std::error::Error;

#[derive(thiserror::Error, Debug)]
pub enum FishlerError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("mutually exclusive authentication options set: {0} and {1}")]
    ConflictingAuthOptions(&'static str, &'static str),
    #[error("no authentication option set")]
    NoAuthOption,
    #[error("overlay for {0} is not mounted")]
    OverlayNotMounted(String),
    #[error("overlay for {0} is being torn down")]
    OverlayUnmounting(String),
    #[error("session already exited")]
    AlreadyExited,
    #[error("inconsistent session state")]
    InconsistentState,
    #[error("unparseable address: {0}")]
    BadAddress(String),
    #[error("deserialization failed: {0}")]
    DeserializeJson(#[from] serde_json::Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl FishlerError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}
