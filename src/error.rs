use thiserror::Error;

use crate::store::StoreError;
use crate::worker::executor::ScrapeError;

#[derive(Error, Debug)]
pub enum CommanderError {
    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Scrape failed: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommanderError {
    /// True when the underlying cause is the coordination store being unreachable.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, CommanderError::Store(StoreError::Unavailable(_)))
    }
}

pub type Result<T> = std::result::Result<T, CommanderError>;
