use std::fmt;

#[derive(Debug)]
pub enum SmrError {
    Config(String),
    Io(std::io::Error),
    Json(serde_json::Error),
    Input(String),
    Queue(String),
    Protocol(String),
    Transport(String),
    Bootstrap(String),
    Session(String),
    Reducer(String),
    Aborted(String),
    Other(String),
}

impl fmt::Display for SmrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmrError::Config(e) => write!(f, "Config error: {}", e),
            SmrError::Io(e) => write!(f, "IO error: {}", e),
            SmrError::Json(e) => write!(f, "JSON error: {}", e),
            SmrError::Input(e) => write!(f, "Input error: {}", e),
            SmrError::Queue(e) => write!(f, "Queue error: {}", e),
            SmrError::Protocol(e) => write!(f, "Protocol error: {}", e),
            SmrError::Transport(e) => write!(f, "Transport error: {}", e),
            SmrError::Bootstrap(e) => write!(f, "Bootstrap error: {}", e),
            SmrError::Session(e) => write!(f, "Session error: {}", e),
            SmrError::Reducer(e) => write!(f, "Reducer error: {}", e),
            SmrError::Aborted(e) => write!(f, "Aborted: {}", e),
            SmrError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SmrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SmrError::Io(e) => Some(e),
            SmrError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SmrError {
    fn from(err: std::io::Error) -> Self {
        SmrError::Io(err)
    }
}

impl From<serde_json::Error> for SmrError {
    fn from(err: serde_json::Error) -> Self {
        SmrError::Json(err)
    }
}

impl From<String> for SmrError {
    fn from(err: String) -> Self {
        SmrError::Other(err)
    }
}

impl From<&str> for SmrError {
    fn from(err: &str) -> Self {
        SmrError::Other(err.to_string())
    }
}
