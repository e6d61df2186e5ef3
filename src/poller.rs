use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::dispatcher::{DispatchHandle, Outcome};
use crate::error::SourceError;
use crate::platform::{Batch, ChatClient, Cursor, Message, Source};
use crate::retry::RetryPolicy;
use crate::state::StateStore;

/// Where a poller currently is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Fetching,
    Backoff,
    Assembling,
    Ready,
}

/// Why a poller stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    Shutdown,
    /// The source failed permanently and is skipped for the rest of the run
    SourceRemoved,
    DispatcherClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub interval: Duration,
    pub assembly_window: Duration,
    /// Fetch backoff bounds and per-call timeout
    pub retry: RetryPolicy,
}

impl PollerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.polling.interval(),
            assembly_window: config.polling.assembly_window(),
            retry: config.retry.policy(),
        }
    }
}

struct OpenGroup {
    key: String,
    messages: Vec<Message>,
    deadline: Instant,
}

/// Collects media-group parts into batches.
///
/// A group closes when its window elapses or when a message that does not
/// belong to it shows up, whichever happens first. Messages must be fed in
/// position order.
pub struct GroupAssembler {
    source: Source,
    window: Duration,
    open: Option<OpenGroup>,
}

impl GroupAssembler {
    pub fn new(source: Source, window: Duration) -> Self {
        Self {
            source,
            window,
            open: None,
        }
    }

    /// Feed messages; returns the batches they completed, in order.
    pub fn accept(&mut self, messages: Vec<Message>) -> Vec<Batch> {
        let mut ready = Vec::new();
        for message in messages {
            let Some(key) = message.group_key.clone() else {
                ready.extend(self.close());
                ready.push(Batch::single(self.source, message));
                continue;
            };

            match &mut self.open {
                Some(open) if open.key == key => {
                    if !open.messages.iter().any(|m| m.id == message.id) {
                        open.messages.push(message);
                    }
                }
                _ => {
                    ready.extend(self.close());
                    self.open = Some(OpenGroup {
                        key,
                        messages: vec![message],
                        deadline: Instant::now() + self.window,
                    });
                }
            }
        }
        ready
    }

    /// When the open group's window ends, if a group is open
    pub fn deadline(&self) -> Option<Instant> {
        self.open.as_ref().map(|g| g.deadline)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| now >= d)
    }

    /// Emit the open group, if any
    pub fn close(&mut self) -> Option<Batch> {
        self.open
            .take()
            .map(|g| Batch::group(self.source, g.messages))
    }
}

/// Polls one source and hands its batches to the dispatcher.
pub struct SourcePoller {
    source: Source,
    client: Arc<dyn ChatClient>,
    dispatcher: DispatchHandle,
    store: StateStore,
    settings: PollerSettings,
    state: PollerState,
}

impl SourcePoller {
    pub fn new(
        source: Source,
        client: Arc<dyn ChatClient>,
        dispatcher: DispatchHandle,
        store: StateStore,
        settings: PollerSettings,
    ) -> Self {
        Self {
            source,
            client,
            dispatcher,
            store,
            settings,
            state: PollerState::Idle,
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Poll on every tick until shut down or the source goes away.
    /// A cycle already in progress is finished before shutdown is honored.
    pub async fn run(mut self, shutdown: CancellationToken) -> PollerExit {
        info!(
            source = self.source.id,
            kind = %self.source.kind,
            "Poller started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.enter(PollerState::Idle);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(source = self.source.id, "Poller stopped");
                    return PollerExit::Shutdown;
                }
                _ = ticker.tick() => {}
            }

            if let Err(exit) = self.poll_once(&shutdown).await {
                if exit == PollerExit::Shutdown {
                    info!(source = self.source.id, "Poller stopped during backoff");
                }
                return exit;
            }
        }
    }

    /// One full cycle: fetch, assemble, hand off, commit the cursor.
    pub async fn poll_once(&mut self, shutdown: &CancellationToken) -> Result<(), PollerExit> {
        let committed = self.store.get_cursor(&self.source).await;
        let messages = self.fetch_with_backoff(committed, shutdown).await?;
        if messages.is_empty() {
            return Ok(());
        }

        let mut staged = committed;
        let messages = self.order(messages, &mut staged);
        debug!(
            source = self.source.id,
            fetched = messages.len(),
            %staged,
            "Fetched new messages"
        );

        self.enter(PollerState::Assembling);
        let mut assembler = GroupAssembler::new(self.source, self.settings.assembly_window);
        let ready = assembler.accept(messages);
        if !self.hand_off(ready).await? {
            return Ok(());
        }

        while let Some(deadline) = assembler.deadline() {
            self.enter(PollerState::Assembling);
            tokio::time::sleep_until(deadline).await;

            // Always fetch from the committed cursor; the client may discard
            // whatever a fetch cursor covers.
            let stragglers = match self.fetch(committed).await {
                Ok(mut messages) => {
                    messages.retain(|m| !staged.covers(m));
                    self.order(messages, &mut staged)
                }
                Err(e) => {
                    warn!(
                        source = self.source.id,
                        error_kind = e.kind(),
                        "Straggler fetch failed, closing group as is: {}",
                        e
                    );
                    Vec::new()
                }
            };

            let mut ready = assembler.accept(stragglers);
            if assembler.is_expired(Instant::now()) {
                ready.extend(assembler.close());
            }
            if !self.hand_off(ready).await? {
                return Ok(());
            }
        }

        if staged != committed && !self.dispatcher.commit_cursor(self.source, staged).await {
            return Err(PollerExit::DispatcherClosed);
        }
        Ok(())
    }

    fn enter(&mut self, state: PollerState) {
        if self.state != state {
            trace!(source = self.source.id, from = ?self.state, to = ?state, "Poller state");
            self.state = state;
        }
    }

    /// Sort by position and fold the positions into `staged`
    fn order(&self, mut messages: Vec<Message>, staged: &mut Cursor) -> Vec<Message> {
        let kind = self.source.kind;
        messages.sort_by_key(|m| m.position(kind));
        for message in &messages {
            *staged = staged.max(Cursor::at(kind, message));
        }
        messages
    }

    /// Returns false when a batch failed; the rest of the cycle is dropped
    /// and the cursor stays where it is, so the next poll fetches it again.
    async fn hand_off(&mut self, batches: Vec<Batch>) -> Result<bool, PollerExit> {
        for batch in batches {
            self.enter(PollerState::Ready);
            let ids = batch.message_ids();
            match self.dispatcher.submit(batch).await {
                None => return Err(PollerExit::DispatcherClosed),
                Some(Outcome::Failed) => {
                    warn!(
                        source = self.source.id,
                        messages = ?ids,
                        "Batch not handled, will retry on next poll"
                    );
                    return Ok(false);
                }
                Some(outcome) => {
                    debug!(source = self.source.id, messages = ?ids, %outcome, "Batch handed off");
                }
            }
        }
        Ok(true)
    }

    async fn fetch_with_backoff(
        &mut self,
        cursor: Cursor,
        shutdown: &CancellationToken,
    ) -> Result<Vec<Message>, PollerExit> {
        let mut backoff = self.settings.retry.backoff();
        loop {
            self.enter(PollerState::Fetching);
            let err = match self.fetch(cursor).await {
                Ok(messages) => return Ok(messages),
                Err(e) => e,
            };

            if err.is_permanent() {
                error!(
                    source = self.source.id,
                    error_kind = err.kind(),
                    "Source dropped for the rest of the run: {}",
                    err
                );
                return Err(PollerExit::SourceRemoved);
            }

            self.enter(PollerState::Backoff);
            let delay = backoff.next_delay();
            warn!(
                source = self.source.id,
                error_kind = err.kind(),
                delay_ms = delay.as_millis() as u64,
                "Fetch failed, backing off: {}",
                err
            );
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(PollerExit::Shutdown),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn fetch(&self, cursor: Cursor) -> Result<Vec<Message>, SourceError> {
        let timeout = self.settings.retry.call_timeout;
        match tokio::time::timeout(timeout, self.client.fetch_since(&self.source, cursor)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::timed_out(self.source.id, timeout)),
        }
    }
}
