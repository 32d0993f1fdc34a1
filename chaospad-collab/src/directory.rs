//! Document existence oracle.
//!
//! Document records are owned by the surrounding application (creation,
//! renaming and ownership live there). The relay and the snapshot service
//! only ever ask whether an id exists.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DocumentDirectory: Send + Sync {
    async fn exists(&self, document_id: &str) -> Result<bool, DirectoryError>;
}

/// In-memory set of known document ids.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    documents: RwLock<HashSet<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            documents: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    /// Returns true if the id was newly inserted.
    pub fn insert(&self, document_id: impl Into<String>) -> bool {
        match self.documents.write() {
            Ok(mut docs) => docs.insert(document_id.into()),
            Err(poisoned) => poisoned.into_inner().insert(document_id.into()),
        }
    }

    pub fn remove(&self, document_id: &str) -> bool {
        match self.documents.write() {
            Ok(mut docs) => docs.remove(document_id),
            Err(poisoned) => poisoned.into_inner().remove(document_id),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentDirectory for MemoryDirectory {
    async fn exists(&self, document_id: &str) -> Result<bool, DirectoryError> {
        self.documents
            .read()
            .map(|docs| docs.contains(document_id))
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))
    }
}
