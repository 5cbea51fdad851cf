use crate::types::{EntityId, IndexId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    /// Illegal call sequence against an index proxy. Always a caller bug.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Concurrent {operation} while {in_flight} calls in flight")]
    ConcurrentOperation { operation: String, in_flight: u64 },

    #[error("Index proxy is closed: {0}")]
    ProxyClosed(String),

    #[error("Index proxy {0} was already closed before it could be flipped")]
    ProxyAlreadyClosed(IndexId),

    #[error("Index {index}: entry conflict, values {values} already indexed for entity {existing}, attempted for entity {added}")]
    EntryConflict {
        index: IndexId,
        values: String,
        existing: EntityId,
        added: EntityId,
    },

    #[error("Population of index {index} failed: {cause}")]
    PopulationFailed { index: IndexId, cause: Box<IndexError> },

    #[error("Populator error: {0}")]
    Populator(String),

    #[error("Accessor error: {0}")]
    Accessor(String),

    #[error("Store scan error: {0}")]
    Scan(String),

    #[error("Timed out after {waited_ms} ms waiting for index population work: {diagnostics}")]
    FlushTimeout { waited_ms: u64, diagnostics: String },

    #[error("{} population job(s) did not stop cleanly: {}", failures.len(), failures.join("; "))]
    JobsNotStopped { failures: Vec<String> },

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("Entity already exists: {0}")]
    EntityExists(EntityId),

    #[error("Index not found: {0}")]
    IndexNotFound(IndexId),

    #[error("Index {0} is not online")]
    IndexNotOnline(IndexId),

    #[error("Index {index} is in failed state: {cause}")]
    IndexFailed { index: IndexId, cause: String },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    /// Entry conflicts keep their identity through the population wrappers so
    /// constraint callers can report the offending values.
    pub fn root_conflict(&self) -> Option<&IndexError> {
        match self {
            IndexError::EntryConflict { .. } => Some(self),
            IndexError::PopulationFailed { cause, .. } => cause.root_conflict(),
            _ => None,
        }
    }

    pub fn is_entry_conflict(&self) -> bool {
        self.root_conflict().is_some()
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            IndexError::IllegalState(_)
                | IndexError::ConcurrentOperation { .. }
                | IndexError::ProxyClosed(_)
        )
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Config(e.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for IndexError {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        IndexError::Scheduler(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_conflict_unwraps_population_failure() {
        let conflict = IndexError::EntryConflict {
            index: 3,
            values: "[\"a\"]".to_string(),
            existing: 1,
            added: 2,
        };
        let wrapped = IndexError::PopulationFailed {
            index: 3,
            cause: Box::new(conflict.clone()),
        };
        assert_eq!(wrapped.root_conflict(), Some(&conflict));
        assert!(wrapped.is_entry_conflict());
        assert!(!IndexError::Populator("boom".into()).is_entry_conflict());
    }

    #[test]
    fn test_jobs_not_stopped_message() {
        let err = IndexError::JobsNotStopped {
            failures: vec!["job 1 timed out".into(), "job 2 timed out".into()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 population job(s)"));
        assert!(msg.contains("job 1 timed out; job 2 timed out"));
    }
}
