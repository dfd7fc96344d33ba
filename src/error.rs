use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExiferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Failed to launch worker '{executable}': {source}")]
    Startup {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker '{executable}' exceeded its deadline and was killed")]
    Timeout { executable: String },

    #[error("Worker '{executable}' terminated before completing the request. stderr={stderr}")]
    ProcessTerminated { executable: String, stderr: String },

    #[error("Worker reported an error: {message}. command={command}")]
    Worker { message: String, command: String },

    #[error("Expected a different response shape. file={file}, args={args}")]
    UnexpectedFormat { file: String, args: String },

    #[error("Deserialization error at path '{path}': {source}")]
    Deserialization {
        path: String,
        source: serde_json::Error,
    },

    #[error("{0}")]
    BatchMisuse(String),

    #[error("stderr channel for worker disconnected")]
    StderrDisconnected,
}

impl From<serde_path_to_error::Error<serde_json::Error>> for ExiferError {
    fn from(err: serde_path_to_error::Error<serde_json::Error>) -> Self {
        ExiferError::Deserialization {
            path: err.path().to_string(),
            source: err.into_inner(),
        }
    }
}
