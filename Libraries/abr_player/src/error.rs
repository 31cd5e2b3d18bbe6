use thiserror::Error;

/// Errors that end a streaming session.
///
/// Stalls, predicted stalls and timer misuse are not errors: they are
/// recorded on the segment log and the session keeps going.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("manifest error: {0}")]
    Manifest(String),
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PlayerError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn manifest<S: Into<String>>(msg: S) -> Self {
        Self::Manifest(msg.into())
    }
}

/// Failure reported by a segment fetcher. Cancellation is not a failure.
#[derive(Debug, Error, Clone)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status} for URL: {url}")]
    Status { status: u16, url: String },
    #[error("body read failed: {0}")]
    Body(String),
}

impl FetchError {
    pub fn into_player_error(self, url: &str) -> PlayerError {
        PlayerError::Fetch {
            url: url.to_string(),
            reason: self.to_string(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::Status {
                status: status.as_u16(),
                url: error.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => Self::Network(error.to_string()),
        }
    }
}

pub type PlayerResult<T> = Result<T, PlayerError>;
