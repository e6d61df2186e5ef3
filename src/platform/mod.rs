pub mod telegram;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ForwardError, SourceError};
use crate::state::Fingerprint;

/// Platform-specific chat identifier
pub type ChatId = i64;

/// How a source tracks what is new
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// One-way channel, tracked by sequence number
    Broadcast,
    /// Multi-member chat, tracked by last-seen message id
    Group,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Broadcast => write!(f, "broadcast"),
            SourceKind::Group => write!(f, "group"),
        }
    }
}

/// Per-source progress marker.
///
/// Both variants are plain integers; the tag decides which field of a
/// [`Message`] is compared against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Cursor {
    Broadcast(i64),
    Group(i64),
}

impl Cursor {
    /// Initial cursor for a source that has never been polled
    pub fn start(kind: SourceKind) -> Self {
        Self::new(kind, 0)
    }

    pub fn new(kind: SourceKind, value: i64) -> Self {
        match kind {
            SourceKind::Broadcast => Cursor::Broadcast(value),
            SourceKind::Group => Cursor::Group(value),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Cursor::Broadcast(_) => SourceKind::Broadcast,
            Cursor::Group(_) => SourceKind::Group,
        }
    }

    pub fn value(&self) -> i64 {
        match self {
            Cursor::Broadcast(v) | Cursor::Group(v) => *v,
        }
    }

    /// Cursor positioned exactly at `message`
    pub fn at(kind: SourceKind, message: &Message) -> Self {
        Self::new(kind, message.position(kind))
    }

    /// True if `message` is at or before this cursor
    pub fn covers(&self, message: &Message) -> bool {
        message.position(self.kind()) <= self.value()
    }

    /// The later of two cursors. A cursor of a different kind replaces this
    /// one outright, since the values are not comparable.
    pub fn max(self, other: Cursor) -> Cursor {
        if self.kind() != other.kind() || other.value() > self.value() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::Broadcast(v) => write!(f, "seq {}", v),
            Cursor::Group(v) => write!(f, "id {}", v),
        }
    }
}

/// A configured origin chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub id: ChatId,
    pub kind: SourceKind,
}

/// A single item fetched from a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source_id: ChatId,
    /// Monotonic within the source
    pub id: i64,
    /// Present iff the message belongs to a media group
    pub group_key: Option<String>,
    pub text: String,
    /// Opaque media handles, in display order
    pub media_refs: Vec<String>,
    /// Only set for broadcast sources
    pub sequence_number: Option<i64>,
}

impl Message {
    /// The value a cursor of `kind` is compared against
    pub fn position(&self, kind: SourceKind) -> i64 {
        match kind {
            SourceKind::Broadcast => self.sequence_number.unwrap_or(self.id),
            SourceKind::Group => self.id,
        }
    }
}

/// The atomic forward unit: one message or one media group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub source: Source,
    messages: Vec<Message>,
}

impl Batch {
    pub fn single(source: Source, message: Message) -> Self {
        Self {
            source,
            messages: vec![message],
        }
    }

    /// Build a media-group batch; parts are ordered by id ascending.
    pub fn group(source: Source, mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|m| m.id);
        Self { source, messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn group_key(&self) -> Option<&str> {
        self.messages.first().and_then(|m| m.group_key.as_deref())
    }

    pub fn message_ids(&self) -> Vec<i64> {
        self.messages.iter().map(|m| m.id).collect()
    }

    /// Dedup key: the group key when present, otherwise the first message id
    pub fn fingerprint(&self) -> Fingerprint {
        match self.group_key() {
            Some(key) => Fingerprint::for_group(self.source.id, key),
            None => {
                let id = self.messages.first().map(|m| m.id).unwrap_or_default();
                Fingerprint::for_message(self.source.id, id)
            }
        }
    }

    /// Text of every part, joined with newlines; empty parts are skipped
    pub fn combined_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn media_refs(&self) -> Vec<&str> {
        self.messages
            .iter()
            .flat_map(|m| m.media_refs.iter().map(String::as_str))
            .collect()
    }

    /// Cursor just past this batch
    pub fn cursor(&self) -> Cursor {
        let kind = self.source.kind;
        let top = self
            .messages
            .iter()
            .map(|m| m.position(kind))
            .max()
            .unwrap_or_default();
        Cursor::new(kind, top)
    }
}

/// Kind of chat as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Channel,
    Group,
    Private,
}

impl ChatKind {
    /// How the chat would be tracked as a source, if it can be one
    pub fn source_kind(&self) -> Option<SourceKind> {
        match self {
            ChatKind::Channel => Some(SourceKind::Broadcast),
            ChatKind::Group => Some(SourceKind::Group),
            ChatKind::Private => None,
        }
    }
}

/// A chat the client can see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: ChatId,
    pub kind: ChatKind,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Chat protocol primitives consumed by the forwarding pipeline
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Establish and verify the session
    async fn connect(&self) -> anyhow::Result<()>;

    /// Register the sources whose messages must be kept. Called once at
    /// startup, before any fetch or cursor lookup.
    async fn watch(&self, _sources: &[Source]) {}

    /// Messages newer than `cursor`, ordered by position. May include items
    /// already handed out earlier; the dispatcher deduplicates. `cursor` is
    /// always the last committed one, so anything it covers can be dropped.
    async fn fetch_since(&self, source: &Source, cursor: Cursor)
        -> Result<Vec<Message>, SourceError>;

    /// Forward a batch to `target` as one logical unit
    async fn send(&self, target: ChatId, batch: &Batch) -> Result<(), ForwardError>;

    /// Where the source is right now; used to seed a source on first run
    async fn current_cursor(&self, source: &Source) -> Result<Cursor, SourceError>;

    /// Resolve a chat id
    async fn describe_chat(&self, chat_id: ChatId) -> Result<ChatSummary, SourceError>;

    /// Inventory of reachable chats
    async fn list_accessible_chats(&self) -> anyhow::Result<Vec<ChatSummary>>;
}
