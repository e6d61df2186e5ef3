//! Error taxonomy for the forwarding pipeline.

use std::time::Duration;

use crate::platform::ChatId;

/// Failure while reading from a source chat.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Network trouble, rate limiting, timeouts. Retried with backoff.
    #[error("transient failure on source {chat_id}: {reason}")]
    Transient { chat_id: ChatId, reason: String },

    /// The chat is gone for good (removed, bot kicked, banned).
    #[error("source {chat_id} is no longer accessible: {reason}")]
    Permanent { chat_id: ChatId, reason: String },
}

impl SourceError {
    pub fn timed_out(chat_id: ChatId, after: Duration) -> Self {
        SourceError::Transient {
            chat_id,
            reason: format!("timed out after {:?}", after),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, SourceError::Permanent { .. })
    }

    /// Short label used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Transient { .. } => "transient",
            SourceError::Permanent { .. } => "permanent",
        }
    }
}

/// Failure of the relevance classifier.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("classifier request failed: {0}")]
    Request(String),

    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not read a verdict from classifier response: {0:?}")]
    Unparseable(String),
}

/// Failure while forwarding a batch to the target.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("forward failed: {reason}")]
    Transient { reason: String },

    #[error("forward rejected by target: {reason}")]
    Permanent { reason: String },
}

/// Failure of the durable state store.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("state database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("state file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt state entry: {0}")]
    Corrupt(String),

    /// Sustained flush failure; the process must stop.
    #[error("state flush failed {failures} times in a row, last error: {last}")]
    Exhausted { failures: u32, last: String },
}

impl StateStoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StateStoreError::Exhausted { .. })
    }
}

/// Errors that the retry helper knows how to classify.
pub trait Retryable: std::fmt::Display {
    /// Whether another attempt may succeed
    fn is_transient(&self) -> bool;

    /// The error to report when a call exceeds its deadline
    fn timed_out(after: Duration) -> Self;
}

impl Retryable for FilterError {
    fn is_transient(&self) -> bool {
        true
    }

    fn timed_out(after: Duration) -> Self {
        FilterError::Timeout(after)
    }
}

impl Retryable for ForwardError {
    fn is_transient(&self) -> bool {
        matches!(self, ForwardError::Transient { .. })
    }

    fn timed_out(after: Duration) -> Self {
        ForwardError::Transient {
            reason: format!("timed out after {:?}", after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_kinds() {
        let t = SourceError::timed_out(5, Duration::from_secs(1));
        assert_eq!(t.kind(), "transient");
        assert!(!t.is_permanent());
        assert!(t.to_string().contains("source 5"));

        let p = SourceError::Permanent {
            chat_id: 5,
            reason: "kicked".into(),
        };
        assert!(p.is_permanent());
    }

    #[test]
    fn test_forward_timeout_is_transient() {
        let e = ForwardError::timed_out(Duration::from_secs(3));
        assert!(e.is_transient());
        assert!(!ForwardError::Permanent {
            reason: "chat not found".into()
        }
        .is_transient());
    }

    #[test]
    fn test_only_exhausted_is_fatal() {
        assert!(StateStoreError::Exhausted {
            failures: 5,
            last: "disk full".into()
        }
        .is_fatal());
        assert!(!StateStoreError::Corrupt("x".into()).is_fatal());
    }
}
