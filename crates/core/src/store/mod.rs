//! Storage seam for requests, their status history, and approval decisions.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::approval::ApprovalDecision;
use crate::domain::history::StatusHistoryEntry;
use crate::domain::request::{Request, RequestFilter, RequestId};

pub mod memory;

pub use memory::InMemoryRequestStorage;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("request {request_id} was not found")]
    NotFound { request_id: RequestId },
    #[error("request {request_id} already exists")]
    AlreadyExists { request_id: RequestId },
    #[error("request {request_id} was modified concurrently (expected version {expected_version})")]
    VersionConflict { request_id: RequestId, expected_version: u64 },
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Everything a transition writes. Backends persist all of it or none of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionCommit {
    pub request: Request,
    pub expected_version: u64,
    pub entry: StatusHistoryEntry,
    pub decision: Option<ApprovalDecision>,
}

#[async_trait]
pub trait RequestStorage: Send + Sync {
    /// Inserts when `expected_version` is `None`, otherwise replaces the stored
    /// request only if its version still matches.
    async fn save(&self, request: Request, expected_version: Option<u64>)
        -> Result<(), StorageError>;

    async fn load(&self, id: &RequestId) -> Result<Option<Request>, StorageError>;

    /// Ordered by `created_at`, then id.
    async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, StorageError>;

    /// Writes the request, its next history entry, and an optional decision as
    /// one unit. A stale version or an already used sequence number is a
    /// `VersionConflict`.
    async fn append_atomic(&self, commit: TransitionCommit) -> Result<(), StorageError>;

    /// Ascending `sequence_number`.
    async fn history(&self, id: &RequestId) -> Result<Vec<StatusHistoryEntry>, StorageError>;

    /// In the order they were recorded.
    async fn decisions(&self, id: &RequestId) -> Result<Vec<ApprovalDecision>, StorageError>;
}

#[async_trait]
impl<T> RequestStorage for Arc<T>
where
    T: RequestStorage + ?Sized,
{
    async fn save(
        &self,
        request: Request,
        expected_version: Option<u64>,
    ) -> Result<(), StorageError> {
        (**self).save(request, expected_version).await
    }

    async fn load(&self, id: &RequestId) -> Result<Option<Request>, StorageError> {
        (**self).load(id).await
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, StorageError> {
        (**self).list(filter).await
    }

    async fn append_atomic(&self, commit: TransitionCommit) -> Result<(), StorageError> {
        (**self).append_atomic(commit).await
    }

    async fn history(&self, id: &RequestId) -> Result<Vec<StatusHistoryEntry>, StorageError> {
        (**self).history(id).await
    }

    async fn decisions(&self, id: &RequestId) -> Result<Vec<ApprovalDecision>, StorageError> {
        (**self).decisions(id).await
    }
}
