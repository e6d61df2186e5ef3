use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatcher::{DispatchPolicy, Dispatcher};
use crate::error::SourceError;
use crate::filter::RelevanceFilter;
use crate::platform::{ChatClient, Cursor, Source};
use crate::poller::{PollerExit, PollerSettings, SourcePoller};
use crate::state::StateStore;

/// Queue slots per source between the pollers and the dispatcher
const QUEUE_PER_SOURCE: usize = 4;

/// Runs one poller per source against a shared dispatcher and store.
pub struct Orchestrator {
    client: Arc<dyn ChatClient>,
    filter: Arc<dyn RelevanceFilter>,
    store: StateStore,
    sources: Vec<Source>,
    dispatch: DispatchPolicy,
    polling: PollerSettings,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ChatClient>,
        filter: Arc<dyn RelevanceFilter>,
        store: StateStore,
        sources: Vec<Source>,
        dispatch: DispatchPolicy,
        polling: PollerSettings,
    ) -> Self {
        Self {
            client,
            filter,
            store,
            sources,
            dispatch,
            polling,
        }
    }

    pub fn from_config(
        config: &Config,
        client: Arc<dyn ChatClient>,
        filter: Arc<dyn RelevanceFilter>,
        store: StateStore,
    ) -> Self {
        Self::new(
            client,
            filter,
            store,
            config.sources(),
            DispatchPolicy::from_config(config),
            PollerSettings::from_config(config),
        )
    }

    /// Poll until `shutdown` fires or every source is gone, then drain and
    /// save state. Returns an error on startup failure or when the state
    /// store can no longer persist.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let sources = self.prepare().await?;
        let token = shutdown.child_token();

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.client),
            Arc::clone(&self.filter),
            self.store.clone(),
            self.dispatch,
        );
        let (handle, mut dispatcher_task) = dispatcher.spawn(sources.len() * QUEUE_PER_SOURCE);

        let mut pollers = JoinSet::new();
        for source in &sources {
            let poller = SourcePoller::new(
                *source,
                Arc::clone(&self.client),
                handle.clone(),
                self.store.clone(),
                self.polling,
            );
            let token = token.clone();
            pollers.spawn(async move {
                let source = poller.source();
                (source, poller.run(token).await)
            });
        }
        // Pollers hold the only remaining handles; the dispatcher drains
        // and stops once they are all gone.
        drop(handle);

        info!("Polling {} source(s)", sources.len());
        let mut active = sources.len();

        let early_exit = loop {
            tokio::select! {
                joined = pollers.join_next() => match joined {
                    None => break None,
                    Some(Ok((source, exit))) => {
                        active -= 1;
                        match exit {
                            PollerExit::SourceRemoved => warn!(
                                source = source.id,
                                remaining = active,
                                "Source removed from the active set"
                            ),
                            PollerExit::Shutdown | PollerExit::DispatcherClosed => {
                                debug!(source = source.id, ?exit, "Poller finished")
                            }
                        }
                    }
                    Some(Err(e)) => {
                        active -= 1;
                        error!(remaining = active, "Poller task failed: {}", e);
                    }
                },
                result = &mut dispatcher_task => break Some(result),
            }
        };

        let dispatcher_result = match early_exit {
            Some(result) => {
                token.cancel();
                while pollers.join_next().await.is_some() {}
                result
            }
            None => dispatcher_task.await,
        };

        match dispatcher_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("State store failure, shutting down: {}", e);
                return Err(e).context("State store can no longer persist");
            }
            Err(e) => anyhow::bail!("Dispatcher task failed: {}", e),
        }

        self.store
            .flush()
            .await
            .context("Final state flush failed")?;
        info!("State saved");

        if !shutdown.is_cancelled() {
            warn!("Every source was removed, nothing left to poll");
        }
        Ok(())
    }

    /// Resolve the target, drop unreachable sources, and seed cursors for
    /// sources seen for the first time at their current position.
    async fn prepare(&self) -> Result<Vec<Source>> {
        let target = self
            .client
            .describe_chat(self.dispatch.target)
            .await
            .with_context(|| format!("Target chat {} is not reachable", self.dispatch.target))?;
        info!("Forwarding to {} ({})", target.display_name, target.id);

        // Must precede the first fetch or cursor lookup
        self.client.watch(&self.sources).await;

        let mut active = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match self.client.describe_chat(source.id).await {
                Ok(chat) => {
                    if chat.kind.source_kind() != Some(source.kind) {
                        warn!(
                            source = source.id,
                            "Configured as {} but the chat is a {:?}",
                            source.kind,
                            chat.kind
                        );
                    }
                    info!(source = source.id, kind = %source.kind, "Watching {}", chat.display_name);
                }
                Err(e) if e.is_permanent() => {
                    error!(
                        source = source.id,
                        error_kind = e.kind(),
                        "Skipping source: {}",
                        e
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        source = source.id,
                        error_kind = e.kind(),
                        "Could not resolve source, polling anyway: {}",
                        e
                    );
                }
            }

            let stored = self
                .store
                .stored_cursor(source.id)
                .await
                .filter(|c| c.kind() == source.kind);
            if stored.is_none() {
                match self.seed_cursor(source).await {
                    Ok(cursor) => {
                        self.store.set_cursor(source.id, cursor).await;
                        info!(source = source.id, %cursor, "First run for source, starting from its current position");
                    }
                    Err(e) if e.is_permanent() => {
                        error!(
                            source = source.id,
                            error_kind = e.kind(),
                            "Skipping source: {}",
                            e
                        );
                        continue;
                    }
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("Could not read the current position of source {}", source.id)
                        });
                    }
                }
            }
            active.push(*source);
        }

        if active.is_empty() {
            anyhow::bail!("None of the configured sources is accessible");
        }

        self.store
            .flush()
            .await
            .context("Failed to save initial cursors")?;
        Ok(active)
    }

    async fn seed_cursor(&self, source: &Source) -> Result<Cursor, SourceError> {
        let policy = self.dispatch.retry;
        let mut backoff = policy.backoff();
        let mut attempt = 1;
        loop {
            let result =
                match tokio::time::timeout(policy.call_timeout, self.client.current_cursor(source))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::timed_out(source.id, policy.call_timeout)),
                };

            match result {
                Err(e) if !e.is_permanent() && attempt < policy.max_attempts => {
                    let delay = backoff.next_delay();
                    warn!(
                        source = source.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Reading current position failed: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
