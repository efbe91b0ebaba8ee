pub mod handle;
pub mod memory;
pub mod s3;

pub use handle::{Backend, StoreHandle};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store bucket does not exist. {0}")]
    BucketDoesNotExist(String),
    #[error("Object does not exist. {0}")]
    DoesNotExist(String),
    #[error("Not authorized to access store. {0}")]
    NotAuthorized(String),
    #[error("Error connecting to store. {0}")]
    ConnectionError(String),
    #[error("Invalid store configuration. {0}")]
    InvalidConfig(String),
    #[error("Refusing to store invalid value. {0}")]
    InvalidValue(String),
    #[error("Store I/O error. {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize value. {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Both stores failed. Remote: {remote}; local: {local}")]
    Unavailable {
        remote: Box<StoreError>,
        local: Box<StoreError>,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Checks that the backend is reachable. Called once when the store handle is selected.
    async fn init(&self) -> Result<()> {
        Ok(())
    }
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
}
