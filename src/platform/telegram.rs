use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, MessageId, UpdateKind};
use teloxide::{ApiError, RequestError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ForwardError, SourceError};
use crate::platform::{self, Batch, ChatClient, ChatKind, ChatSummary, Cursor, Source, SourceKind};

/// Updates not yet handed out, keyed by chat
#[derive(Default)]
struct Inbox {
    next_offset: i32,
    /// Highest update id seen so far
    last_update: i64,
    chats: HashMap<platform::ChatId, Vec<platform::Message>>,
    /// Chats whose updates are kept; everything else is dropped
    watched: HashSet<platform::ChatId>,
}

/// ChatClient over the Telegram Bot API.
///
/// Updates arrive through `getUpdates` for every chat at once, so they are
/// buffered per chat and handed out to whichever source asks. Broadcast
/// sources are ordered by update id, group sources by message id.
pub struct TelegramClient {
    bot: Bot,
    poll_timeout: u32,
    inbox: Mutex<Inbox>,
}

impl TelegramClient {
    pub fn new(token: &str, poll_timeout: u32) -> Self {
        Self::with_bot(Bot::new(token), poll_timeout)
    }

    /// Use a preconfigured bot, e.g. one pointed at another API server
    pub fn with_bot(bot: Bot, poll_timeout: u32) -> Self {
        Self {
            bot,
            poll_timeout,
            inbox: Mutex::new(Inbox::default()),
        }
    }

    /// Pull pending updates into the inbox and acknowledge them
    async fn pump(&self, inbox: &mut Inbox) -> Result<(), RequestError> {
        let updates = self
            .bot
            .get_updates()
            .offset(inbox.next_offset)
            .timeout(self.poll_timeout)
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::ChannelPost])
            .await?;

        for update in updates {
            inbox.next_offset = update.id.as_offset();
            let sequence = i64::from(update.id.0);
            inbox.last_update = inbox.last_update.max(sequence);

            let msg = match update.kind {
                UpdateKind::Message(msg) | UpdateKind::ChannelPost(msg) => msg,
                _ => continue,
            };
            let message = convert_message(&msg, sequence);
            if !inbox.watched.contains(&message.source_id) {
                debug!(chat_id = message.source_id, "Ignoring update from unwatched chat");
                continue;
            }
            inbox.chats.entry(message.source_id).or_default().push(message);
        }
        Ok(())
    }
}

/// Convert a Bot API message; `sequence` is the id of the carrying update
fn convert_message(msg: &Message, sequence: i64) -> platform::Message {
    let mut media_refs = Vec::new();
    if let Some(sizes) = msg.photo() {
        // Largest size comes last
        if let Some(photo) = sizes.last() {
            media_refs.push(photo.file.id.to_string());
        }
    }
    if let Some(video) = msg.video() {
        media_refs.push(video.file.id.to_string());
    }
    if let Some(document) = msg.document() {
        media_refs.push(document.file.id.to_string());
    }
    if let Some(audio) = msg.audio() {
        media_refs.push(audio.file.id.to_string());
    }

    platform::Message {
        source_id: msg.chat.id.0,
        id: i64::from(msg.id.0),
        group_key: msg.media_group_id().map(|g| g.to_string()),
        text: msg.text().or(msg.caption()).unwrap_or_default().to_string(),
        media_refs,
        sequence_number: Some(sequence),
    }
}

/// Chat is gone or the bot was thrown out; retrying will not help
fn is_permanent(error: &RequestError) -> bool {
    matches!(
        error,
        RequestError::Api(
            ApiError::ChatNotFound
                | ApiError::BotBlocked
                | ApiError::BotKicked
                | ApiError::BotKickedFromSupergroup
        ) | RequestError::MigrateToChatId(_)
    )
}

fn source_error(chat_id: platform::ChatId, error: &RequestError) -> SourceError {
    let reason = error.to_string();
    if is_permanent(error) {
        SourceError::Permanent { chat_id, reason }
    } else {
        SourceError::Transient { chat_id, reason }
    }
}

fn forward_error(error: &RequestError) -> ForwardError {
    let reason = error.to_string();
    if is_permanent(error) {
        ForwardError::Permanent { reason }
    } else {
        ForwardError::Transient { reason }
    }
}

#[async_trait]
impl ChatClient for TelegramClient {
    async fn connect(&self) -> Result<()> {
        let me = self
            .bot
            .get_me()
            .await
            .context("Failed to reach the Telegram Bot API")?;
        info!("Connected to Telegram as @{}", me.username());
        Ok(())
    }

    /// Updates for every chat share one offset, so all sources must be
    /// known before the first pump acknowledges anything.
    async fn watch(&self, sources: &[Source]) {
        let mut inbox = self.inbox.lock().await;
        inbox.watched.extend(sources.iter().map(|s| s.id));
        debug!(chats = inbox.watched.len(), "Watching source chats");
    }

    async fn fetch_since(
        &self,
        source: &Source,
        cursor: Cursor,
    ) -> Result<Vec<platform::Message>, SourceError> {
        let mut inbox = self.inbox.lock().await;
        inbox.watched.insert(source.id);
        self.pump(&mut inbox)
            .await
            .map_err(|e| source_error(source.id, &e))?;

        let Some(buffered) = inbox.chats.get_mut(&source.id) else {
            return Ok(Vec::new());
        };
        // Everything up to the committed cursor has been handled
        buffered.retain(|m| !cursor.covers(m));
        let mut messages = buffered.clone();
        messages.sort_by_key(|m| m.position(source.kind));
        Ok(messages)
    }

    async fn send(&self, target: platform::ChatId, batch: &Batch) -> Result<(), ForwardError> {
        let ids: Vec<MessageId> = batch
            .messages()
            .iter()
            .filter_map(|m| i32::try_from(m.id).ok().map(MessageId))
            .collect();
        if ids.is_empty() {
            return Err(ForwardError::Permanent {
                reason: format!("batch {:?} has no forwardable ids", batch.message_ids()),
            });
        }

        self.bot
            .forward_messages(ChatId(target), ChatId(batch.source.id), ids)
            .await
            .map_err(|e| forward_error(&e))?;
        Ok(())
    }

    async fn current_cursor(&self, source: &Source) -> Result<Cursor, SourceError> {
        let mut inbox = self.inbox.lock().await;
        inbox.watched.insert(source.id);
        self.pump(&mut inbox)
            .await
            .map_err(|e| source_error(source.id, &e))?;

        let cursor = match source.kind {
            SourceKind::Broadcast => Cursor::Broadcast(inbox.last_update),
            SourceKind::Group => {
                let top = inbox
                    .chats
                    .get(&source.id)
                    .and_then(|msgs| msgs.iter().map(|m| m.id).max())
                    .unwrap_or_default();
                Cursor::Group(top)
            }
        };
        Ok(cursor)
    }

    async fn describe_chat(&self, chat_id: platform::ChatId) -> Result<ChatSummary, SourceError> {
        let chat = self
            .bot
            .get_chat(ChatId(chat_id))
            .await
            .map_err(|e| source_error(chat_id, &e))?;

        let kind = if chat.is_channel() {
            ChatKind::Channel
        } else if chat.is_private() {
            ChatKind::Private
        } else {
            ChatKind::Group
        };
        let display_name = chat
            .title()
            .or(chat.first_name())
            .map(str::to_string)
            .unwrap_or_else(|| chat_id.to_string());

        Ok(ChatSummary {
            id: chat_id,
            kind,
            display_name,
            username: chat.username().map(str::to_string),
        })
    }

    /// The Bot API has no chat listing, so this reports every chat that
    /// shows up in pending updates. Pending updates are only peeked at,
    /// not acknowledged.
    async fn list_accessible_chats(&self) -> Result<Vec<ChatSummary>> {
        let updates = self
            .bot
            .get_updates()
            .await
            .context("Failed to read pending updates")?;

        let mut ids: HashSet<platform::ChatId> = updates
            .iter()
            .filter_map(|update| match &update.kind {
                UpdateKind::Message(msg) | UpdateKind::ChannelPost(msg) => Some(msg.chat.id.0),
                UpdateKind::MyChatMember(member) => Some(member.chat.id.0),
                _ => None,
            })
            .collect();
        ids.extend(self.inbox.lock().await.watched.iter().copied());

        let mut chats = BTreeMap::new();
        for id in ids {
            match self.describe_chat(id).await {
                Ok(chat) => {
                    chats.insert((chat.display_name.to_lowercase(), id), chat);
                }
                Err(e) => warn!(chat_id = id, "Skipping chat: {}", e),
            }
        }
        Ok(chats.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    use axum::{Json, Router, body::Bytes, extract::State, http::Uri, routing::post};
    use serde_json::{Value, json};
    use teloxide::types::Seconds;

    const CHAT_A: platform::ChatId = -1001;
    const CHAT_B: platform::ChatId = -1002;
    const CHANNEL: platform::ChatId = -1003;

    /// Bot API double: `getUpdates` serves pending updates and forgets
    /// everything below the requested offset, like the real server.
    #[derive(Clone, Default)]
    struct MockBotApi {
        pending: Arc<StdMutex<Vec<Value>>>,
        offsets: Arc<StdMutex<Vec<Option<i64>>>>,
    }

    impl MockBotApi {
        fn push(&self, update: Value) {
            self.pending.lock().unwrap().push(update);
        }

        fn offsets(&self) -> Vec<Option<i64>> {
            self.offsets.lock().unwrap().clone()
        }
    }

    async fn bot_api_handler(
        State(api): State<MockBotApi>,
        uri: Uri,
        body: Bytes,
    ) -> Json<Value> {
        let method = uri.path().rsplit('/').next().unwrap_or_default().to_lowercase();
        if method != "getupdates" {
            return Json(json!({ "ok": true, "result": true }));
        }

        let request: Value = serde_json::from_slice(&body).unwrap_or_default();
        let offset = request["offset"].as_i64();
        api.offsets.lock().unwrap().push(offset);

        let mut pending = api.pending.lock().unwrap();
        if let Some(offset) = offset {
            pending.retain(|u| u["update_id"].as_i64().unwrap_or_default() >= offset);
        }
        Json(json!({ "ok": true, "result": pending.clone() }))
    }

    async fn client_with_mock_api(updates: Vec<Value>) -> (TelegramClient, MockBotApi) {
        let api = MockBotApi::default();
        for update in updates {
            api.push(update);
        }

        let app = Router::new()
            .route("/{*path}", post(bot_api_handler))
            .with_state(api.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock bot api");
        });

        let api_url = reqwest::Url::parse(&format!("http://{addr}/")).expect("parse api url");
        let bot = Bot::new("test-token").set_api_url(api_url);
        (TelegramClient::with_bot(bot, 0), api)
    }

    fn group_update(update_id: i64, chat_id: platform::ChatId, message_id: i64) -> Value {
        json!({
            "update_id": update_id,
            "message": {
                "message_id": message_id,
                "date": 1_700_000_000,
                "chat": { "id": chat_id, "type": "supergroup", "title": "Group" },
                "from": { "id": 7, "is_bot": false, "first_name": "Ann" },
                "text": format!("message {}", message_id),
            }
        })
    }

    fn channel_update(update_id: i64, message_id: i64) -> Value {
        json!({
            "update_id": update_id,
            "channel_post": {
                "message_id": message_id,
                "date": 1_700_000_000,
                "chat": { "id": CHANNEL, "type": "channel", "title": "News" },
                "text": format!("post {}", message_id),
            }
        })
    }

    fn group(id: platform::ChatId) -> Source {
        Source {
            id,
            kind: SourceKind::Group,
        }
    }

    fn ids(messages: &[platform::Message]) -> Vec<i64> {
        messages.iter().map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn test_first_fetch_keeps_updates_for_other_watched_sources() {
        let (client, api) =
            client_with_mock_api(vec![group_update(1, CHAT_A, 10), group_update(2, CHAT_B, 20)])
                .await;
        client.watch(&[group(CHAT_A), group(CHAT_B)]).await;

        let a = client.fetch_since(&group(CHAT_A), Cursor::Group(0)).await.unwrap();
        assert_eq!(ids(&a), vec![10]);

        // Both updates were acknowledged by the first fetch
        let b = client.fetch_since(&group(CHAT_B), Cursor::Group(0)).await.unwrap();
        assert_eq!(ids(&b), vec![20]);
        assert_eq!(api.offsets(), vec![Some(0), Some(3)]);
    }

    #[tokio::test]
    async fn test_unwatched_chats_are_dropped() {
        let (client, _api) =
            client_with_mock_api(vec![group_update(1, CHAT_A, 10), group_update(2, CHAT_B, 20)])
                .await;
        client.watch(&[group(CHAT_A)]).await;

        let a = client.fetch_since(&group(CHAT_A), Cursor::Group(0)).await.unwrap();
        assert_eq!(ids(&a), vec![10]);
        let inbox = client.inbox.lock().await;
        assert!(!inbox.chats.contains_key(&CHAT_B));
    }

    #[tokio::test]
    async fn test_fetch_prunes_buffer_up_to_cursor() {
        let (client, api) = client_with_mock_api(vec![
            group_update(1, CHAT_A, 10),
            group_update(2, CHAT_A, 11),
        ])
        .await;
        client.watch(&[group(CHAT_A)]).await;

        let first = client.fetch_since(&group(CHAT_A), Cursor::Group(0)).await.unwrap();
        assert_eq!(ids(&first), vec![10, 11]);

        // Not yet committed past 11, so it is handed out again
        let second = client.fetch_since(&group(CHAT_A), Cursor::Group(10)).await.unwrap();
        assert_eq!(ids(&second), vec![11]);

        // 10 is gone for good once a cursor covered it
        let third = client.fetch_since(&group(CHAT_A), Cursor::Group(0)).await.unwrap();
        assert_eq!(ids(&third), vec![11]);

        api.push(group_update(3, CHAT_A, 12));
        let fourth = client.fetch_since(&group(CHAT_A), Cursor::Group(11)).await.unwrap();
        assert_eq!(ids(&fourth), vec![12]);
    }

    #[tokio::test]
    async fn test_broadcast_positions_come_from_update_ids() {
        let (client, _api) =
            client_with_mock_api(vec![channel_update(7, 500), channel_update(8, 501)]).await;
        let channel = Source {
            id: CHANNEL,
            kind: SourceKind::Broadcast,
        };
        client.watch(&[channel]).await;

        let posts = client.fetch_since(&channel, Cursor::Broadcast(0)).await.unwrap();
        assert_eq!(ids(&posts), vec![500, 501]);
        let sequences: Vec<_> = posts.iter().map(|m| m.sequence_number).collect();
        assert_eq!(sequences, vec![Some(7), Some(8)]);

        let rest = client.fetch_since(&channel, Cursor::Broadcast(7)).await.unwrap();
        assert_eq!(ids(&rest), vec![501]);
    }

    #[tokio::test]
    async fn test_current_cursor_seeds_from_pending_updates() {
        let (client, _api) = client_with_mock_api(vec![
            group_update(4, CHAT_A, 30),
            group_update(5, CHAT_A, 31),
            channel_update(6, 900),
        ])
        .await;
        let channel = Source {
            id: CHANNEL,
            kind: SourceKind::Broadcast,
        };
        client.watch(&[group(CHAT_A), group(CHAT_B), channel]).await;

        assert_eq!(
            client.current_cursor(&group(CHAT_A)).await.unwrap(),
            Cursor::Group(31)
        );
        assert_eq!(
            client.current_cursor(&group(CHAT_B)).await.unwrap(),
            Cursor::Group(0)
        );
        assert_eq!(
            client.current_cursor(&channel).await.unwrap(),
            Cursor::Broadcast(6)
        );

        // Seeding skips the backlog
        let backlog = client.fetch_since(&group(CHAT_A), Cursor::Group(31)).await.unwrap();
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_lost_chats_are_permanent() {
        let err = RequestError::Api(ApiError::ChatNotFound);
        assert!(source_error(-100, &err).is_permanent());
        assert!(matches!(
            forward_error(&RequestError::Api(ApiError::BotKicked)),
            ForwardError::Permanent { .. }
        ));
    }

    #[test]
    fn test_rate_limit_is_transient() {
        let err = RequestError::RetryAfter(Seconds::from_seconds(5));
        let mapped = source_error(-100, &err);
        assert!(!mapped.is_permanent());
        assert_eq!(mapped.kind(), "transient");
        assert!(matches!(forward_error(&err), ForwardError::Transient { .. }));
    }

    fn channel_post(body: serde_json::Value) -> Message {
        let mut json = serde_json::json!({
            "message_id": 42,
            "date": 1_700_000_000,
            "chat": { "id": -1001234, "type": "channel", "title": "News" },
        });
        if let (Some(base), Some(extra)) = (json.as_object_mut(), body.as_object()) {
            base.extend(extra.clone());
        }
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_convert_text_post() {
        let msg = channel_post(serde_json::json!({ "text": "release day" }));
        let converted = convert_message(&msg, 900);
        assert_eq!(converted.source_id, -1001234);
        assert_eq!(converted.id, 42);
        assert_eq!(converted.text, "release day");
        assert_eq!(converted.sequence_number, Some(900));
        assert!(converted.group_key.is_none());
        assert!(converted.media_refs.is_empty());
    }

    #[test]
    fn test_convert_album_photo_keeps_largest_size() {
        let msg = channel_post(serde_json::json!({
            "caption": "album",
            "media_group_id": "g1",
            "photo": [
                { "file_id": "small", "file_unique_id": "u1", "width": 90, "height": 90 },
                { "file_id": "large", "file_unique_id": "u2", "width": 1280, "height": 1280 }
            ]
        }));
        let converted = convert_message(&msg, 901);
        assert_eq!(converted.text, "album");
        assert_eq!(converted.group_key.as_deref(), Some("g1"));
        assert_eq!(converted.media_refs, vec!["large".to_string()]);
    }
}
