use std::path::PathBuf;

/// Core error type.
///
/// Adapter crates map their library errors into this type so crawl and
/// monitor loops can decide what is contained (per channel / per event) and
/// what ends the run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous handle @{handle}: {candidates} distinct identities match")]
    Ambiguous { handle: String, candidates: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("access token rejected for peer {0}")]
    TokenRejected(i64),

    #[error("unsupported by backend: {0}")]
    Unsupported(String),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("session not authorized: {0}")]
    Auth(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("external error: {0}")]
    External(String),

    #[error("interrupted")]
    Interrupted,
}

/// Coarse buckets used when deciding how far a failure propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Resolution,
    Transport,
    Rule,
    Persistence,
    Auth,
    Other,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NotFound(_) | Error::Ambiguous { .. } => ErrorClass::Resolution,
            Error::Transport(_) | Error::TokenRejected(_) | Error::Unsupported(_) => {
                ErrorClass::Transport
            }
            Error::InvalidRule(_) => ErrorClass::Rule,
            Error::Persistence(_) => ErrorClass::Persistence,
            Error::Auth(_) => ErrorClass::Auth,
            _ => ErrorClass::Other,
        }
    }

    /// Failures that end a crawl or monitor run instead of being contained.
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_taxonomy() {
        assert_eq!(
            Error::Ambiguous {
                handle: "x".to_string(),
                candidates: 2
            }
            .class(),
            ErrorClass::Resolution
        );
        assert_eq!(Error::TokenRejected(7).class(), ErrorClass::Transport);
        assert_eq!(
            Error::InvalidRule("bad".to_string()).class(),
            ErrorClass::Rule
        );
        assert!(Error::Auth("no".to_string()).is_run_fatal());
        assert!(!Error::Transport("flaky".to_string()).is_run_fatal());
    }
}
