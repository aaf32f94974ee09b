use registry_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("registry client has no live connection")]
    NoConnection,

    #[error("failed to connect to {endpoints:?}: {source}")]
    Connect {
        endpoints: Vec<String>,
        #[source]
        source: StoreError,
    },

    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("path does not exist: {path}")]
    NoSuchPath { path: String },

    #[error("path has no children: {path}")]
    NoChildren { path: String },

    #[error("failed to create {segment} while creating {path}: {source}")]
    CreatePath {
        segment: String,
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("{op}({path}) failed: {source}")]
    Store {
        op: &'static str,
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("Invalid client configuration: {0}")]
    Config(String),

    #[error("Configuration file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl ClientError {
    pub(crate) fn store(op: &'static str, path: &str, source: StoreError) -> Self {
        ClientError::Store {
            op,
            path: path.to_string(),
            source,
        }
    }

    /// True for both "path does not exist" and "path has no children"
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            ClientError::NoSuchPath { .. } | ClientError::NoChildren { .. }
        )
    }

    /// The underlying store failure, if any
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            ClientError::Connect { source, .. }
            | ClientError::CreatePath { source, .. }
            | ClientError::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}
