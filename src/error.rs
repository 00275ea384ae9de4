use thiserror::Error;

pub type PeerResult<T> = Result<T, PeerError>;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("User already exists with this username or college ID")]
    DuplicateIdentity,
    #[error("Message content is empty")]
    EmptyContent,
    #[error("{0}")]
    Validation(&'static str),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Not logged in")]
    Unauthenticated,
    /// Only ever logged; readers fall back to a default value.
    #[error("stored {key} is malformed: {source}")]
    StoreCorrupt {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Session(#[from] tower_sessions::session::Error),
}

impl PeerError {
    /// Short heading for the notification shown to the user.
    pub fn title(&self) -> &'static str {
        use PeerError::*;
        match self {
            DuplicateIdentity | EmptyContent | Validation(_) => "Error",
            Forbidden(_) => "Not allowed",
            NotFound(_) => "Not found",
            Unauthenticated => "Login required",
            StoreCorrupt { .. } | Database(_) | Json(_) | Session(_) => "Something went wrong",
        }
    }
}
