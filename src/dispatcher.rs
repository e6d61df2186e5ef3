use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::StateStoreError;
use crate::filter::{RelevanceFilter, Verdict};
use crate::platform::{Batch, ChatClient, ChatId, Cursor, Source};
use crate::retry::RetryPolicy;
use crate::state::{Fingerprint, StateStore};

/// What happened to a submitted batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Forwarded,
    Rejected,
    /// Already handled earlier
    Skipped,
    /// Not recorded; the batch will come back on a later poll
    Failed,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Forwarded => write!(f, "forwarded"),
            Outcome::Rejected => write!(f, "rejected"),
            Outcome::Skipped => write!(f, "skipped"),
            Outcome::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchPolicy {
    pub target: ChatId,
    pub retry: RetryPolicy,
    /// Poll cycles a batch may fail classification before `fail_open` decides
    pub max_batch_failures: u32,
    pub fail_open: bool,
}

impl DispatchPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target: config.telegram.target_chat_id,
            retry: config.retry.policy(),
            max_batch_failures: config.retry.max_batch_failures,
            fail_open: config.filter.fail_open,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FailureCount {
    filter: u32,
    forward: u32,
}

enum Request {
    Submit {
        batch: Batch,
        reply: oneshot::Sender<Outcome>,
    },
    CommitCursor {
        source: Source,
        cursor: Cursor,
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable sender side used by the pollers
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<Request>,
}

impl DispatchHandle {
    /// Hand a batch over and wait for its outcome. `None` means the
    /// dispatcher has stopped.
    pub async fn submit(&self, batch: Batch) -> Option<Outcome> {
        let (reply, outcome) = oneshot::channel();
        self.tx.send(Request::Submit { batch, reply }).await.ok()?;
        outcome.await.ok()
    }

    /// Persist a source cursor after a fully handed-off poll cycle
    pub async fn commit_cursor(&self, source: Source, cursor: Cursor) -> bool {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(Request::CommitCursor {
                source,
                cursor,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        done.await.is_ok()
    }
}

/// Single writer of the state store: filter, forward, then record.
pub struct Dispatcher {
    client: Arc<dyn ChatClient>,
    filter: Arc<dyn RelevanceFilter>,
    store: StateStore,
    policy: DispatchPolicy,
    failures: HashMap<Fingerprint, FailureCount>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn ChatClient>,
        filter: Arc<dyn RelevanceFilter>,
        store: StateStore,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            client,
            filter,
            store,
            policy,
            failures: HashMap::new(),
        }
    }

    /// Run on a background task. The task ends once every handle is
    /// dropped and the queue is drained, or on a fatal store error.
    pub fn spawn(
        self,
        capacity: usize,
    ) -> (DispatchHandle, JoinHandle<Result<(), StateStoreError>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(self.run(rx));
        (DispatchHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Request>) -> Result<(), StateStoreError> {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Submit { batch, reply } => {
                    let outcome = self.submit(&batch).await?;
                    let _ = reply.send(outcome);
                }
                Request::CommitCursor {
                    source,
                    cursor,
                    reply,
                } => {
                    self.commit_cursor(&source, cursor).await?;
                    let _ = reply.send(());
                }
            }
        }
        debug!("Dispatcher queue drained");
        Ok(())
    }

    /// Process one batch. Only a fatal store failure is returned as an error.
    pub async fn submit(&mut self, batch: &Batch) -> Result<Outcome, StateStoreError> {
        let fingerprint = batch.fingerprint();
        let source = batch.source;

        if self.store.has_seen(&fingerprint).await {
            debug!(
                source = source.id,
                fingerprint = %fingerprint,
                "Batch already handled, skipping"
            );
            self.store.set_cursor(source.id, batch.cursor()).await;
            self.commit().await?;
            return Ok(Outcome::Skipped);
        }

        let text = batch.combined_text();
        let classified = self
            .policy
            .retry
            .run("classification", || self.filter.classify(&text))
            .await;

        let verdict = match classified {
            Ok(verdict) => verdict,
            Err(e) => {
                let count = self.failures.entry(fingerprint.clone()).or_default();
                count.filter += 1;
                let attempts = count.filter;
                if attempts < self.policy.max_batch_failures {
                    warn!(
                        source = source.id,
                        fingerprint = %fingerprint,
                        attempts,
                        error_kind = "filter",
                        "Classification failed, batch requeued: {}",
                        e
                    );
                    return Ok(Outcome::Failed);
                }
                let fallback = if self.policy.fail_open {
                    Verdict::Accept
                } else {
                    Verdict::Reject
                };
                warn!(
                    source = source.id,
                    fingerprint = %fingerprint,
                    attempts,
                    error_kind = "filter",
                    "Classification failed for the last time, treating as {:?}: {}",
                    fallback,
                    e
                );
                fallback
            }
        };

        if verdict == Verdict::Reject {
            self.record(&fingerprint, batch).await?;
            info!(
                source = source.id,
                messages = ?batch.message_ids(),
                "Batch filtered out as not interesting"
            );
            return Ok(Outcome::Rejected);
        }

        let target = self.policy.target;
        let sent = self
            .policy
            .retry
            .run("forward", || self.client.send(target, batch))
            .await;

        match sent {
            Ok(()) => {
                self.record(&fingerprint, batch).await?;
                info!(
                    source = source.id,
                    target,
                    messages = ?batch.message_ids(),
                    "Forwarded batch"
                );
                Ok(Outcome::Forwarded)
            }
            Err(e) => {
                let count = self.failures.entry(fingerprint.clone()).or_default();
                count.forward += 1;
                error!(
                    source = source.id,
                    fingerprint = %fingerprint,
                    attempts = count.forward,
                    error_kind = "forward",
                    "Forward failed, batch will be retried: {}",
                    e
                );
                Ok(Outcome::Failed)
            }
        }
    }

    /// Fingerprint first, then cursor, then persist.
    async fn record(&mut self, fingerprint: &Fingerprint, batch: &Batch) -> Result<(), StateStoreError> {
        self.store.mark_seen(fingerprint.clone()).await;
        self.store.set_cursor(batch.source.id, batch.cursor()).await;
        self.failures.remove(fingerprint);
        self.commit().await
    }

    async fn commit_cursor(&mut self, source: &Source, cursor: Cursor) -> Result<(), StateStoreError> {
        if self.store.set_cursor(source.id, cursor).await {
            debug!(source = source.id, %cursor, "Cursor advanced");
        }
        self.commit().await
    }

    /// Non-fatal flush errors leave the changes pending for the next commit
    async fn commit(&self) -> Result<(), StateStoreError> {
        match self.store.flush().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(_) => Ok(()),
        }
    }
}
