use registry_client::ClientError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid service name: {0}")]
    InvalidServiceName(String),

    #[error("Registry client error: {0}")]
    Client(#[from] ClientError),
}
