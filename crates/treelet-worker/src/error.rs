use thiserror::Error;
use treelet::RemoteFailure;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to parse {path}: {message}")]
    Parse {
        path: String,
        message: String,
        line: usize,
        column: usize,
    },

    #[error("no recipe named '{0}'")]
    UnknownRecipe(String),

    #[error("invalid options for {recipe}: {reason}")]
    InvalidOptions { recipe: String, reason: String },

    #[error("no loaded recipe with id {0}")]
    UnknownRecipeId(u32),

    #[error("recipe package {0} not found")]
    PackageNotFound(String),

    #[error("recipe package {package} is {available}, not {requested}")]
    VersionMismatch {
        package: String,
        requested: String,
        available: String,
    },

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("bad {command} payload: {source}")]
    Payload {
        command: String,
        source: serde_json::Error,
    },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error(transparent)]
    Tree(#[from] treelet::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<WorkerError> for RemoteFailure {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Parse { line, column, .. } => {
                let trace = format!("at line {line}, column {column}");
                RemoteFailure::new(e.to_string()).with_trace(trace)
            }
            other => RemoteFailure::new(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
