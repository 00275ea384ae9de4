//! Two-party message threads and the simulated peer that answers them.

use std::{collections::HashMap, sync::{Arc, Mutex, PoisonError}, time::Duration};

use axum::{
    debug_handler,
    extract::{ws::{Message as WsMessage, WebSocketUpgrade}, Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::{sync::broadcast, task::JoinHandle};
use tower_sessions::Session;
use uuid::Uuid;

use crate::{directory::{Directory, User}, notice::Notice, session::SessionManager, store::{Key, Store}, AppResult, AppState, PeerError, PeerResult};

pub const OPENING_REPLY: &str = "Hey! Thanks for your message. I'm interested in collaborating on a project. What do you think?";
pub const FOLLOW_UP_REPLY: &str = "That sounds great! Let's discuss more details.";

const PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participants: [String; 2],
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    fn new(a: &str, b: &str) -> Conversation {
        Conversation {
            id: "conv".to_owned() + &Uuid::now_v7().simple().to_string(),
            participants: [a.to_owned(), b.to_owned()],
            messages: Vec::new(),
        }
    }

    pub fn involves(&self, user: &str) -> bool {
        self.participants.iter().any(|p| p == user)
    }

    pub fn is_between(&self, a: &str, b: &str) -> bool {
        let [x, y] = &self.participants;
        (x == a && y == b) || (x == b && y == a)
    }

    pub fn other(&self, user: &str) -> Option<&str> {
        match &self.participants {
            [x, y] if x == user => Some(y.as_str()),
            [x, y] if y == user => Some(x.as_str()),
            _ => None,
        }
    }

    /// The last message, cut to 50 characters.
    pub fn preview(&self) -> Option<String> {
        let last = self.messages.last()?;
        if last.content.chars().count() > PREVIEW_CHARS {
            Some(last.content.chars().take(PREVIEW_CHARS).collect::<String>() + "...")
        } else {
            Some(last.content.clone())
        }
    }

    // timestamps never run backwards within a thread
    fn push(&mut self, sender: &str, content: &str) -> Message {
        let now = OffsetDateTime::now_utc();
        let timestamp = match self.messages.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let message = Message {
            sender: sender.to_owned(),
            content: content.to_owned(),
            timestamp,
        };
        self.messages.push(message.clone());
        message
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub conversation_id: String,
    pub participants: [String; 2],
    pub message: Message,
}

impl ChatEvent {
    pub fn involves(&self, user: &str) -> bool {
        self.participants.iter().any(|p| p == user)
    }
}

/// Pending auto-reply tasks, keyed by conversation id.
#[derive(Clone, Default)]
struct AutoReplies {
    pending: Arc<Mutex<HashMap<String, Vec<JoinHandle<()>>>>>,
}

impl AutoReplies {
    fn track(&self, conversation_id: &str, handle: JoinHandle<()>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let handles = pending.entry(conversation_id.to_owned()).or_default();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn count(&self, conversation_id: &str) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handles) = pending.get_mut(conversation_id) else {
            return 0;
        };
        handles.retain(|h| !h.is_finished());
        let count = handles.len();
        if count == 0 {
            pending.remove(conversation_id);
        }
        count
    }

    fn cancel(&self, conversation_id: &str) -> usize {
        let handles = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(conversation_id)
            .unwrap_or_default();
        abort_all(handles)
    }

    fn cancel_all(&self) -> usize {
        let drained: Vec<JoinHandle<()>> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .flat_map(|(_, handles)| handles)
            .collect();
        abort_all(drained)
    }
}

fn abort_all(handles: Vec<JoinHandle<()>>) -> usize {
    handles
        .into_iter()
        .filter(|h| !h.is_finished())
        .map(|h| h.abort())
        .count()
}

#[derive(Clone)]
pub struct ConversationStore {
    store: Store,
    events: broadcast::Sender<ChatEvent>,
    replies: AutoReplies,
    reply_delay: Duration,
    seed_demo: bool,
}

impl ConversationStore {
    pub fn new(store: Store, events: broadcast::Sender<ChatEvent>, reply_delay: Duration) -> ConversationStore {
        ConversationStore {
            store,
            events,
            replies: AutoReplies::default(),
            reply_delay,
            seed_demo: false,
        }
    }

    /// Give new users the two sample threads when nothing has been written yet.
    pub fn with_demo_seed(mut self, seed_demo: bool) -> ConversationStore {
        self.seed_demo = seed_demo;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Looks the pair up in either order and creates the thread on a miss.
    pub async fn find_or_create(&self, a: &str, b: &str) -> PeerResult<Conversation> {
        if a == b {
            return Err(PeerError::Validation("You cannot message yourself"));
        }

        self.store
            .update(Key::Conversations, |conversations: &mut Vec<Conversation>| {
                if let Some(existing) = conversations.iter().find(|c| c.is_between(a, b)) {
                    return Ok(existing.clone());
                }
                let conversation = Conversation::new(a, b);
                tracing::debug!("opened {} between {a} and {b}", conversation.id);
                conversations.push(conversation.clone());
                Ok(conversation)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> PeerResult<Conversation> {
        let conversations: Vec<Conversation> = self.store.load(Key::Conversations).await?;
        conversations
            .into_iter()
            .find(|c| c.id == id)
            .ok_or(PeerError::NotFound("conversation"))
    }

    /// In stored order, not by recency.
    pub async fn list_for_user(&self, user: &str) -> PeerResult<Vec<Conversation>> {
        let conversations: Vec<Conversation> = self.store.load(Key::Conversations).await?;
        Ok(conversations.into_iter().filter(|c| c.involves(user)).collect())
    }

    pub async fn append_message(&self, conversation_id: &str, sender: &str, content: &str) -> PeerResult<Message> {
        let (_, message) = self.append(conversation_id, sender, content).await?;
        Ok(message)
    }

    /// Appends, publishes, and schedules the other participant's auto-reply.
    pub async fn send(&self, conversation_id: &str, sender: &str, content: &str) -> PeerResult<Message> {
        let (participants, message) = self.append(conversation_id, sender, content).await?;
        self.publish(conversation_id, &participants, message.clone());
        self.schedule_reply(conversation_id, sender);
        Ok(message)
    }

    // participants come out of the same locked write as the message
    async fn append(&self, conversation_id: &str, sender: &str, content: &str) -> PeerResult<([String; 2], Message)> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PeerError::EmptyContent);
        }

        self.store
            .update(Key::Conversations, |conversations: &mut Vec<Conversation>| {
                let conversation = conversations
                    .iter_mut()
                    .find(|c| c.id == conversation_id)
                    .ok_or(PeerError::NotFound("conversation"))?;
                if !conversation.involves(sender) {
                    return Err(PeerError::Forbidden("Only participants can write to this conversation"));
                }
                let message = conversation.push(sender, content);
                Ok((conversation.participants.clone(), message))
            })
            .await
    }

    /// A first message to `recipient`, reusing an existing thread with them.
    pub async fn start(&self, sender: &str, recipient: &str, content: &str) -> PeerResult<(Conversation, Message)> {
        if content.trim().is_empty() {
            return Err(PeerError::EmptyContent);
        }
        let conversation = self.find_or_create(sender, recipient).await?;
        let message = self.send(&conversation.id, sender, content).await?;
        Ok((self.get(&conversation.id).await?, message))
    }

    pub async fn delete(&self, conversation_id: &str, requester: &str) -> PeerResult<()> {
        self.store
            .update(Key::Conversations, |conversations: &mut Vec<Conversation>| {
                let pos = conversations
                    .iter()
                    .position(|c| c.id == conversation_id)
                    .ok_or(PeerError::NotFound("conversation"))?;
                if !conversations[pos].involves(requester) {
                    return Err(PeerError::Forbidden("Only participants can delete this conversation"));
                }
                conversations.remove(pos);
                Ok(())
            })
            .await?;

        let cancelled = self.replies.cancel(conversation_id);
        tracing::debug!("deleted {conversation_id}, cancelled {cancelled} pending replies");
        Ok(())
    }

    pub fn pending_replies(&self, conversation_id: &str) -> usize {
        self.replies.count(conversation_id)
    }

    pub fn cancel_replies(&self, conversation_id: &str) -> usize {
        self.replies.cancel(conversation_id)
    }

    /// Aborts every pending auto-reply.
    pub fn shutdown(&self) {
        let cancelled = self.replies.cancel_all();
        if cancelled > 0 {
            tracing::info!("dropped {cancelled} pending auto-replies");
        }
    }

    pub fn seeds_demo(&self) -> bool {
        self.seed_demo
    }

    /// Installs sample threads with `mock1` and `mock2`, only into an empty collection.
    pub async fn seed_demo(&self, user: &str) -> PeerResult<bool> {
        self.store
            .update(Key::Conversations, |conversations: &mut Vec<Conversation>| {
                if !conversations.is_empty() {
                    return Ok(false);
                }

                let now = OffsetDateTime::now_utc();
                let message = |sender: &str, content: &str, ago: time::Duration| Message {
                    sender: sender.to_owned(),
                    content: content.to_owned(),
                    timestamp: now - ago,
                };

                // a seed user never gets a thread with themselves
                if user != "mock1" {
                    let mut alex = Conversation::new(user, "mock1");
                    alex.messages = vec![
                        message("mock1", "Hey there! I saw your project on PeerConnect and wanted to connect.", time::Duration::hours(1)),
                        message(user, "Hi Alex! Thanks for reaching out. What specifically interested you?", time::Duration::minutes(30)),
                    ];
                    conversations.push(alex);
                }
                if user != "mock2" {
                    let mut sarah = Conversation::new(user, "mock2");
                    sarah.messages = vec![
                        message("mock2", "Are you still working on the design project?", time::Duration::days(1)),
                    ];
                    conversations.push(sarah);
                }
                Ok(!conversations.is_empty())
            })
            .await
    }

    fn publish(&self, conversation_id: &str, participants: &[String; 2], message: Message) {
        // nobody listening is fine
        let _ = self.events.send(ChatEvent {
            conversation_id: conversation_id.to_owned(),
            participants: participants.clone(),
            message,
        });
    }

    fn schedule_reply(&self, conversation_id: &str, sender: &str) {
        let this = self.clone();
        let id = conversation_id.to_owned();
        let sender = sender.to_owned();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.reply_delay).await;
            match this.deliver_reply(&id, &sender).await {
                Ok(true) => tracing::debug!("auto-replied in {id}"),
                Ok(false) => tracing::debug!("{id} is gone, skipping auto-reply"),
                Err(err) => tracing::error!("auto-reply in {id} failed: {err}"),
            }
        });
        self.replies.track(conversation_id, handle);
    }

    // re-reads the store: the thread may have changed or vanished during the delay
    async fn deliver_reply(&self, conversation_id: &str, sender: &str) -> PeerResult<bool> {
        let delivered = self
            .store
            .update(Key::Conversations, |conversations: &mut Vec<Conversation>| {
                let Some(conversation) = conversations.iter_mut().find(|c| c.id == conversation_id) else {
                    return Ok(None);
                };
                let Some(peer) = conversation.other(sender).map(str::to_owned) else {
                    return Ok(None);
                };

                let text = if conversation.messages.iter().any(|m| m.sender == peer) {
                    FOLLOW_UP_REPLY
                } else {
                    OPENING_REPLY
                };
                let message = conversation.push(&peer, text);
                Ok(Some((conversation.participants.clone(), message)))
            })
            .await?;

        let Some((participants, message)) = delivered else {
            return Ok(false);
        };
        self.publish(conversation_id, &participants, message);
        Ok(true)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub peer: Option<User>,
    pub preview: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewMessage {
    recipient_id: String,
    content: String,
}

#[derive(Deserialize)]
struct Reply {
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendFrame {
    conversation_id: String,
    content: String,
}

#[derive(Serialize)]
struct Started {
    conversation: Conversation,
    message: Message,
    notice: Notice,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(start))
        .route("/ws", get(conversations_ws))
        .route("/{id}", get(conversation).delete(remove))
        .route("/{id}/messages", post(reply))
}

#[debug_handler(state = AppState)]
async fn list(
    State(sessions): State<SessionManager>,
    State(directory): State<Directory>,
    State(conversations): State<ConversationStore>,
    session: Session,
) -> AppResult<Json<Vec<ConversationSummary>>> {
    let user = sessions.require_user(&session).await?;
    if conversations.seeds_demo() {
        conversations.seed_demo(&user.id).await?;
    }

    let all = directory.list_all().await?;
    let summaries = conversations
        .list_for_user(&user.id)
        .await?
        .into_iter()
        .map(|c| ConversationSummary {
            peer: c.other(&user.id).and_then(|id| all.iter().find(|u| u.id == id)).cloned(),
            preview: c.preview(),
            last_message_at: c.messages.last().map(|m| m.timestamp),
            id: c.id,
        })
        .collect();
    Ok(Json(summaries))
}

#[debug_handler(state = AppState)]
async fn start(
    State(sessions): State<SessionManager>,
    State(directory): State<Directory>,
    State(conversations): State<ConversationStore>,
    session: Session,
    Json(NewMessage { recipient_id, content }): Json<NewMessage>,
) -> AppResult<Json<Started>> {
    let user = sessions.require_user(&session).await?;
    if recipient_id.trim().is_empty() || content.trim().is_empty() {
        return Err(PeerError::Validation("Please select a recipient and enter a message").into());
    }
    directory.get(&recipient_id).await?;

    let (conversation, message) = conversations.start(&user.id, &recipient_id, &content).await?;
    Ok(Json(Started {
        conversation,
        message,
        notice: Notice::success("Message Sent", "Your message has been sent successfully"),
    }))
}

#[debug_handler(state = AppState)]
async fn conversation(
    State(sessions): State<SessionManager>,
    State(conversations): State<ConversationStore>,
    Path(id): Path<String>,
    session: Session,
) -> AppResult<Json<Conversation>> {
    let user = sessions.require_user(&session).await?;
    let conversation = conversations.get(&id).await?;
    if !conversation.involves(&user.id) {
        return Err(PeerError::Forbidden("This conversation belongs to someone else").into());
    }
    Ok(Json(conversation))
}

#[debug_handler(state = AppState)]
async fn reply(
    State(sessions): State<SessionManager>,
    State(conversations): State<ConversationStore>,
    Path(id): Path<String>,
    session: Session,
    Json(Reply { content }): Json<Reply>,
) -> AppResult<Json<Message>> {
    let user = sessions.require_user(&session).await?;
    Ok(Json(conversations.send(&id, &user.id, &content).await?))
}

#[debug_handler(state = AppState)]
async fn remove(
    State(sessions): State<SessionManager>,
    State(conversations): State<ConversationStore>,
    Path(id): Path<String>,
    session: Session,
) -> AppResult<()> {
    let user = sessions.require_user(&session).await?;
    conversations.delete(&id, &user.id).await?;
    Ok(())
}

#[debug_handler(state = AppState)]
async fn conversations_ws(
    State(sessions): State<SessionManager>,
    State(conversations): State<ConversationStore>,
    session: Session,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user = sessions.require_user(&session).await?;

    Ok(ws.on_upgrade(async move |stream| {
        let mut rx = conversations.subscribe();
        let (mut sender, mut receiver) = stream.split();
        let user_id = user.id.clone();

        let mut forward_task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("{user_id} missed {missed} chat events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !event.involves(&user_id) {
                    continue;
                }
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if sender.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
            }
        });

        let mut receive_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = receiver.next().await {
                let WsMessage::Text(text) = msg else {
                    continue;
                };
                let Ok(frame) = serde_json::from_str::<SendFrame>(text.as_str()) else {
                    continue;
                };
                if let Err(err) = conversations.send(&frame.conversation_id, &user.id, &frame.content).await {
                    tracing::warn!("ws send from {} rejected: {err}", user.id);
                }
            }
        });

        tokio::select! {
            _ = &mut forward_task => receive_task.abort(),
            _ = &mut receive_task => forward_task.abort(),
        };
    })
    .into_response())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::time::timeout;

    use super::*;
    use crate::store::test_store;

    const WAIT: Duration = Duration::from_secs(5);

    async fn conversations(reply_delay: Duration) -> ConversationStore {
        ConversationStore::new(test_store().await, broadcast::channel(64).0, reply_delay)
    }

    async fn next_event(rx: &mut broadcast::Receiver<ChatEvent>) -> ChatEvent {
        timeout(WAIT, rx.recv()).await.expect("event in time").expect("open channel")
    }

    #[tokio::test]
    async fn find_or_create_is_order_independent() {
        let store = conversations(Duration::from_secs(60)).await;
        let first = store.find_or_create("u1", "u2").await.unwrap();
        let second = store.find_or_create("u2", "u1").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first.id.starts_with("conv"));
        assert_eq!(store.list_for_user("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conversation_with_self_is_rejected() {
        let store = conversations(Duration::from_secs(60)).await;
        assert!(matches!(store.find_or_create("u1", "u1").await, Err(PeerError::Validation(_))));
    }

    #[tokio::test]
    async fn appended_messages_keep_order() {
        let store = conversations(Duration::from_secs(60)).await;
        let conversation = store.find_or_create("u1", "u2").await.unwrap();
        for text in ["one", "two", "three"] {
            store.append_message(&conversation.id, "u1", text).await.unwrap();
        }

        let messages = store.get(&conversation.id).await.unwrap().messages;
        let texts: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("\n\t")]
    #[tokio::test]
    async fn blank_message_is_rejected_and_thread_unchanged(#[case] blank: &str) {
        let store = conversations(Duration::from_secs(60)).await;
        let conversation = store.find_or_create("u1", "u2").await.unwrap();
        store.append_message(&conversation.id, "u1", "hello").await.unwrap();

        let err = store.append_message(&conversation.id, "u1", blank).await.unwrap_err();
        assert!(matches!(err, PeerError::EmptyContent));
        assert_eq!(store.get(&conversation.id).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn outsiders_cannot_append() {
        let store = conversations(Duration::from_secs(60)).await;
        let conversation = store.find_or_create("u1", "u2").await.unwrap();
        let err = store.append_message(&conversation.id, "u3", "hi").await.unwrap_err();
        assert!(matches!(err, PeerError::Forbidden(_)));
        let err = store.append_message("conv-missing", "u1", "hi").await.unwrap_err();
        assert!(matches!(err, PeerError::NotFound("conversation")));
    }

    #[tokio::test]
    async fn sent_message_gets_one_auto_reply_from_peer() {
        let store = conversations(Duration::from_millis(20)).await;
        let mut rx = store.subscribe();
        let conversation = store.find_or_create("u1", "u2").await.unwrap();

        store.send(&conversation.id, "u1", "hello").await.unwrap();
        let sent = next_event(&mut rx).await;
        assert_eq!(sent.message.sender, "u1");
        assert_eq!(sent.message.content, "hello");

        let reply = next_event(&mut rx).await;
        assert_eq!(reply.conversation_id, conversation.id);
        assert_eq!(reply.message.sender, "u2");
        assert_eq!(reply.message.content, OPENING_REPLY);

        let messages = store.get(&conversation.id).await.unwrap().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].sender, "u2");
    }

    #[tokio::test]
    async fn later_replies_use_follow_up_text() {
        let store = conversations(Duration::from_millis(10)).await;
        let mut rx = store.subscribe();
        let conversation = store.find_or_create("u1", "u2").await.unwrap();

        store.send(&conversation.id, "u1", "hello").await.unwrap();
        next_event(&mut rx).await;
        next_event(&mut rx).await;
        store.send(&conversation.id, "u1", "want to build something?").await.unwrap();
        next_event(&mut rx).await;

        let reply = next_event(&mut rx).await;
        assert_eq!(reply.message.content, FOLLOW_UP_REPLY);
        assert_eq!(store.get(&conversation.id).await.unwrap().messages.len(), 4);
    }

    #[tokio::test]
    async fn cancelled_reply_never_lands() {
        let store = conversations(Duration::from_millis(100)).await;
        let conversation = store.find_or_create("u1", "u2").await.unwrap();

        store.send(&conversation.id, "u1", "hello").await.unwrap();
        assert_eq!(store.pending_replies(&conversation.id), 1);
        assert_eq!(store.cancel_replies(&conversation.id), 1);
        assert_eq!(store.pending_replies(&conversation.id), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get(&conversation.id).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_aborts_every_pending_reply() {
        let store = conversations(Duration::from_millis(100)).await;
        let a = store.find_or_create("u1", "u2").await.unwrap();
        let b = store.find_or_create("u1", "u3").await.unwrap();
        store.send(&a.id, "u1", "hi").await.unwrap();
        store.send(&b.id, "u1", "hi").await.unwrap();

        store.shutdown();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.get(&a.id).await.unwrap().messages.len(), 1);
        assert_eq!(store.get(&b.id).await.unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn deleting_conversation_cancels_its_replies() {
        let store = conversations(Duration::from_millis(50)).await;
        let conversation = store.find_or_create("u1", "u2").await.unwrap();
        store.send(&conversation.id, "u1", "hello").await.unwrap();

        let err = store.delete(&conversation.id, "u3").await.unwrap_err();
        assert!(matches!(err, PeerError::Forbidden(_)));

        store.delete(&conversation.id, "u2").await.unwrap();
        assert_eq!(store.pending_replies(&conversation.id), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(store.get(&conversation.id).await, Err(PeerError::NotFound(_))));
        assert!(store.list_for_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_reuses_thread_and_rejects_blank_content() {
        let store = conversations(Duration::from_secs(60)).await;
        let (first, _) = store.start("u1", "u2", "hello").await.unwrap();
        let (second, message) = store.start("u2", "u1", " hi back ").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(message.content, "hi back");
        assert_eq!(second.messages.len(), 2);

        assert!(matches!(store.start("u1", "u3", "  ").await, Err(PeerError::EmptyContent)));
        assert_eq!(store.list_for_user("u1").await.unwrap().len(), 1);
        store.shutdown();
    }

    #[tokio::test]
    async fn list_keeps_stored_order() {
        let store = conversations(Duration::from_secs(60)).await;
        let a = store.find_or_create("u1", "u2").await.unwrap();
        let b = store.find_or_create("u3", "u1").await.unwrap();
        store.find_or_create("u2", "u3").await.unwrap();
        store.append_message(&a.id, "u1", "latest activity").await.unwrap();

        let ids: Vec<String> = store.list_for_user("u1").await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn demo_threads_only_seed_an_empty_store() {
        let store = conversations(Duration::from_secs(60)).await;
        assert!(store.seed_demo("u1").await.unwrap());
        assert!(!store.seed_demo("u9").await.unwrap());

        let threads = store.list_for_user("u1").await.unwrap();
        assert_eq!(threads.len(), 2);
        assert!(threads[0].is_between("mock1", "u1"));
        assert_eq!(threads[0].messages.len(), 2);
        assert!(threads[1].is_between("u1", "mock2"));
        assert!(store.list_for_user("u9").await.unwrap().is_empty());
    }

    #[rstest]
    #[case("mock1", "mock2")]
    #[case("mock2", "mock1")]
    #[tokio::test]
    async fn seed_user_gets_no_thread_with_themselves(#[case] user: &str, #[case] peer: &str) {
        let store = conversations(Duration::from_millis(10)).await;
        assert!(store.seed_demo(user).await.unwrap());

        let threads = store.list_for_user(user).await.unwrap();
        assert_eq!(threads.len(), 1);
        assert!(threads.iter().all(|c| c.participants[0] != c.participants[1]));
        assert!(threads[0].is_between(user, peer));

        let mut rx = store.subscribe();
        store.send(&threads[0].id, user, "hi").await.unwrap();
        next_event(&mut rx).await;
        let reply = next_event(&mut rx).await;
        assert_eq!(reply.message.sender, peer);
    }

    #[tokio::test]
    async fn every_accepted_send_is_published_despite_concurrent_delete() {
        let store = conversations(Duration::from_secs(60)).await;
        let mut rx = store.subscribe();
        let conversation = store.find_or_create("u1", "u2").await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            let id = conversation.id.clone();
            tasks.push(tokio::spawn(async move { store.send(&id, "u1", &format!("m{i}")).await }));
        }
        store.delete(&conversation.id, "u1").await.unwrap();

        let mut accepted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(err) => assert!(matches!(err, PeerError::NotFound("conversation"))),
            }
        }
        for _ in 0..accepted {
            let event = next_event(&mut rx).await;
            assert_eq!(event.participants, ["u1".to_owned(), "u2".to_owned()]);
        }
        assert!(rx.try_recv().is_err());
        store.shutdown();
    }

    #[test]
    fn preview_truncates_long_messages() {
        let mut conversation = Conversation::new("u1", "u2");
        assert_eq!(conversation.preview(), None);
        conversation.push("u1", "short");
        assert_eq!(conversation.preview().as_deref(), Some("short"));
        conversation.push("u2", &"x".repeat(60));
        assert_eq!(conversation.preview(), Some("x".repeat(50) + "..."));
    }

    #[test]
    fn other_participant_is_resolved_from_either_side() {
        let conversation = Conversation::new("u1", "u2");
        assert_eq!(conversation.other("u1"), Some("u2"));
        assert_eq!(conversation.other("u2"), Some("u1"));
        assert_eq!(conversation.other("u3"), None);
    }

    #[test]
    fn timestamps_serialize_as_rfc3339() {
        let mut conversation = Conversation::new("u1", "u2");
        conversation.push("u1", "hi");
        let json = serde_json::to_value(&conversation).unwrap();
        let stamp = json["messages"][0]["timestamp"].as_str().unwrap();
        assert!(OffsetDateTime::parse(stamp, &time::format_description::well_known::Rfc3339).is_ok());
    }
}
