use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::domain::approval::ApprovalDecision;
use crate::domain::history::StatusHistoryEntry;
use crate::domain::request::{Request, RequestFilter, RequestId};

use super::{RequestStorage, StorageError, TransitionCommit};

#[derive(Default)]
struct Tables {
    requests: HashMap<RequestId, Request>,
    history: HashMap<RequestId, Vec<StatusHistoryEntry>>,
    decisions: HashMap<RequestId, Vec<ApprovalDecision>>,
}

/// Process-local storage. One lock covers all tables so a commit is atomic.
#[derive(Default)]
pub struct InMemoryRequestStorage {
    tables: RwLock<Tables>,
}

#[async_trait::async_trait]
impl RequestStorage for InMemoryRequestStorage {
    async fn save(
        &self,
        request: Request,
        expected_version: Option<u64>,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;
        match (tables.requests.get(&request.id), expected_version) {
            (Some(_), None) => {
                return Err(StorageError::AlreadyExists { request_id: request.id.clone() });
            }
            (None, Some(_)) => {
                return Err(StorageError::NotFound { request_id: request.id.clone() });
            }
            (Some(stored), Some(expected)) if stored.version != expected => {
                return Err(StorageError::VersionConflict {
                    request_id: request.id.clone(),
                    expected_version: expected,
                });
            }
            _ => {}
        }
        tables.requests.insert(request.id.clone(), request);
        Ok(())
    }

    async fn load(&self, id: &RequestId) -> Result<Option<Request>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables.requests.get(id).cloned())
    }

    async fn list(&self, filter: &RequestFilter) -> Result<Vec<Request>, StorageError> {
        let tables = self.tables.read().await;
        let mut matching: Vec<Request> =
            tables.requests.values().filter(|request| filter.matches(request)).cloned().collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |limit| limit as usize);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn append_atomic(&self, commit: TransitionCommit) -> Result<(), StorageError> {
        let TransitionCommit { request, expected_version, entry, decision } = commit;
        let mut tables = self.tables.write().await;
        let conflict = || StorageError::VersionConflict {
            request_id: request.id.clone(),
            expected_version,
        };

        match tables.requests.get(&request.id) {
            None => return Err(StorageError::NotFound { request_id: request.id.clone() }),
            Some(stored) if stored.version != expected_version => return Err(conflict()),
            Some(_) => {}
        }

        let last_sequence = tables
            .history
            .get(&request.id)
            .and_then(|entries| entries.last())
            .map_or(0, |entry| entry.sequence_number);
        if entry.sequence_number != last_sequence + 1 {
            return Err(conflict());
        }

        if let Some(decision) = &decision {
            let duplicate = tables.decisions.get(&request.id).is_some_and(|existing| {
                existing.iter().any(|recorded| {
                    recorded.actor_role == decision.actor_role && recorded.cycle == decision.cycle
                })
            });
            if duplicate {
                return Err(conflict());
            }
        }

        tables.history.entry(request.id.clone()).or_default().push(entry);
        if let Some(decision) = decision {
            tables.decisions.entry(request.id.clone()).or_default().push(decision);
        }
        tables.requests.insert(request.id.clone(), request);
        Ok(())
    }

    async fn history(&self, id: &RequestId) -> Result<Vec<StatusHistoryEntry>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables.history.get(id).cloned().unwrap_or_default())
    }

    async fn decisions(&self, id: &RequestId) -> Result<Vec<ApprovalDecision>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables.decisions.get(id).cloned().unwrap_or_default())
    }
}
