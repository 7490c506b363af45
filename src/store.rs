use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use log::{debug, info};
use tokio::sync::Mutex;

use crate::delivery::DeliveryChannel;
use crate::directory::{IdentityDirectory, SqliteDirectory};
use crate::error::{MessagingError, MessagingResult};
use crate::index::ConversationIndex;
use crate::models::{ActorRef, Attachment, Conversation, ConversationKey, Message, MessageId, Profile};
use crate::storage::{NewMessage, Storage};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Exclusive cursor: only messages strictly older than this one.
    pub before: Option<MessageId>,
    pub limit: usize,
}

impl HistoryQuery {
    pub fn latest(limit: usize) -> Self {
        HistoryQuery { before: None, limit }
    }
}

struct StoreInner {
    storage: Arc<Mutex<Storage>>,
    directory: Arc<dyn IdentityDirectory>,
    index: ConversationIndex,
    delivery: DeliveryChannel,
    clock: Arc<dyn Clock>,
    // One writer per conversation at a time.
    gates: StdMutex<HashMap<ConversationKey, Arc<Mutex<()>>>>,
}

/// Append-only message log shared by every connection.
#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

impl MessageStore {
    /// Opens the store over `storage`, with identities resolved from the same
    /// database, and rebuilds the conversation index from the log.
    pub async fn open(storage: Storage, delivery: DeliveryChannel) -> MessagingResult<Self> {
        let storage = Arc::new(Mutex::new(storage));
        let directory = Arc::new(SqliteDirectory::new(Arc::clone(&storage)));
        Self::with_parts(storage, directory, delivery, Arc::new(SystemClock)).await
    }

    pub async fn with_parts(
        storage: Arc<Mutex<Storage>>,
        directory: Arc<dyn IdentityDirectory>,
        delivery: DeliveryChannel,
        clock: Arc<dyn Clock>,
    ) -> MessagingResult<Self> {
        let headers = storage.lock().await.message_headers()?;
        info!("rebuilding conversation index from {} messages", headers.len());
        let index = ConversationIndex::rebuild(&headers);
        Ok(MessageStore {
            inner: Arc::new(StoreInner {
                storage,
                directory,
                index,
                delivery,
                clock,
                gates: StdMutex::new(HashMap::new()),
            }),
        })
    }

    pub fn delivery(&self) -> &DeliveryChannel {
        &self.inner.delivery
    }

    pub async fn register_actor(&self, profile: &Profile) -> MessagingResult<()> {
        self.inner.directory.register(profile).await?;
        info!("registered {} as '{}'", profile.actor, profile.display_name);
        Ok(())
    }

    pub async fn profile(&self, actor: &ActorRef) -> MessagingResult<Profile> {
        self.inner
            .directory
            .resolve(actor)
            .await?
            .ok_or_else(|| MessagingError::NotFound(format!("unknown actor {actor}")))
    }

    /// Checks that both ends exist and are distinct, returning their key.
    pub async fn route(&self, sender: &ActorRef, receiver: &ActorRef) -> MessagingResult<ConversationKey> {
        let key = ConversationKey::new(*sender, *receiver)?;
        self.profile(sender).await?;
        self.profile(receiver).await?;
        Ok(key)
    }

    pub async fn append(
        &self,
        sender: ActorRef,
        receiver: ActorRef,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> MessagingResult<Message> {
        if content.is_empty() && attachments.is_empty() {
            return Err(MessagingError::Validation(
                "a message needs text or at least one attachment".into(),
            ));
        }
        let key = self.route(&sender, &receiver).await?;

        let lease = self.gate(key);
        let _writer = lease.gate.lock().await;
        let message = {
            let mut storage = self.inner.storage.lock().await;
            storage.insert_message(
                NewMessage {
                    sender,
                    receiver,
                    content,
                    attachments: &attachments,
                },
                self.inner.clock.now(),
            )?
        };
        // Index and push happen under the gate so both follow log order.
        self.inner.index.record(&message).await;
        let pushed = self.inner.delivery.publish(&message);
        info!(
            "appended message {} to {} ({} attachments, pushed to {} sessions)",
            message.id,
            key,
            message.attachments.len(),
            pushed
        );
        Ok(message)
    }

    /// A page of `key`'s history, oldest first.
    pub async fn history(&self, key: &ConversationKey, query: HistoryQuery) -> MessagingResult<Vec<Message>> {
        if query.limit == 0 {
            return Err(MessagingError::Validation("history limit must be positive".into()));
        }
        let storage = self.inner.storage.lock().await;
        storage.history_page(key, query.before, query.limit)
    }

    /// Walks the whole history backwards, newest page first, ending after the
    /// first empty page. Each call starts again from the newest message.
    pub fn history_pages(
        &self,
        key: ConversationKey,
        limit: usize,
    ) -> impl Stream<Item = MessagingResult<Vec<Message>>> + Send + 'static {
        let store = self.clone();
        stream::try_unfold(None::<MessageId>, move |before| {
            let store = store.clone();
            async move {
                let page = store.history(&key, HistoryQuery { before, limit }).await?;
                let oldest = page.first().map(|m| m.id);
                Ok::<_, MessagingError>(oldest.map(|id| (page, Some(id))))
            }
        })
    }

    /// Newest message per counterpart of `actor`, most recent conversation first.
    pub async fn list_conversations_for(&self, actor: &ActorRef) -> MessagingResult<Vec<Conversation>> {
        let latest = self.inner.index.latest_for(actor).await;
        if latest.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<MessageId> = latest.iter().map(|(_, id)| *id).collect();
        let messages = self.inner.storage.lock().await.messages_by_ids(&ids)?;

        let mut conversations: Vec<Conversation> = messages
            .into_iter()
            .filter_map(|message| {
                let other = message.counterpart_of(actor)?;
                Some(Conversation {
                    key: message.conversation_key,
                    other_participant: other,
                    last_message: message,
                })
            })
            .collect();
        conversations.sort_by(|a, b| b.last_message.order_key().cmp(&a.last_message.order_key()));
        debug!("{actor} has {} conversations", conversations.len());
        Ok(conversations)
    }

    pub async fn message_count(&self) -> MessagingResult<u64> {
        self.inner.storage.lock().await.message_count()
    }

    fn gate(&self, key: ConversationKey) -> GateLease<'_> {
        let mut gates = self.inner.gates();
        GateLease {
            gates: &self.inner.gates,
            key,
            gate: Arc::clone(gates.entry(key).or_default()),
        }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.inner.gates().len()
    }
}

impl StoreInner {
    fn gates(&self) -> MutexGuard<'_, HashMap<ConversationKey, Arc<Mutex<()>>>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A conversation's append gate, removed from the map by the last holder.
struct GateLease<'a> {
    gates: &'a StdMutex<HashMap<ConversationKey, Arc<Mutex<()>>>>,
    key: ConversationKey,
    gate: Arc<Mutex<()>>,
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this lease hold it, so no one else is waiting.
        if Arc::strong_count(&self.gate) == 2 {
            gates.remove(&self.key);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::AttachmentKind;
    use futures_util::TryStreamExt;
    use std::collections::HashSet;
    use uuid::Uuid;

    pub(crate) async fn setup_store() -> MessageStore {
        MessageStore::open(Storage::new(":memory:").unwrap(), DeliveryChannel::new(16))
            .await
            .unwrap()
    }

    pub(crate) async fn registered(store: &MessageStore, actor: ActorRef, name: &str) -> ActorRef {
        store
            .register_actor(&Profile {
                actor,
                display_name: name.to_string(),
                avatar_url: None,
            })
            .await
            .unwrap();
        actor
    }

    struct FrozenClock(DateTime<Utc>);

    impl Clock for FrozenClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn image() -> Attachment {
        Attachment {
            kind: AttachmentKind::Image,
            url: "memory://cat.png".into(),
            original_name: "cat.png".into(),
        }
    }

    #[tokio::test]
    async fn test_hello_then_image_only_message() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let b = registered(&store, ActorRef::user(Uuid::new_v4()), "bob").await;
        let key = ConversationKey::new(a, b).unwrap();

        store.append(a, b, "hello", vec![]).await.unwrap();
        let page = store.history(&key, HistoryQuery::latest(10)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].content, "hello");

        store.append(a, b, "", vec![image()]).await.unwrap();
        let page = store.history(&key, HistoryQuery::latest(10)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "hello");
        assert_eq!(page[1].attachments, vec![image()]);
    }

    #[tokio::test]
    async fn test_empty_message_rejected_and_not_stored() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let b = registered(&store, ActorRef::company(Uuid::new_v4()), "acme").await;
        let before = store.message_count().await.unwrap();
        assert!(matches!(
            store.append(a, b, "", vec![]).await,
            Err(MessagingError::Validation(_))
        ));
        assert_eq!(store.message_count().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_self_addressed_and_unknown_receiver() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        assert!(matches!(
            store.append(a, a, "me", vec![]).await,
            Err(MessagingError::Validation(_))
        ));
        assert!(matches!(
            store.append(a, ActorRef::user(Uuid::new_v4()), "hi", vec![]).await,
            Err(MessagingError::NotFound(_))
        ));
        assert_eq!(store.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_limit_rejected() {
        let store = setup_store().await;
        let key = ConversationKey::new(ActorRef::user(Uuid::new_v4()), ActorRef::user(Uuid::new_v4())).unwrap();
        assert!(matches!(
            store.history(&key, HistoryQuery::latest(0)).await,
            Err(MessagingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_pages_reconstruct_full_log_once() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let b = registered(&store, ActorRef::company(Uuid::new_v4()), "acme").await;
        let mut sent = Vec::new();
        for i in 0..23 {
            let (from, to) = if i % 3 == 0 { (b, a) } else { (a, b) };
            sent.push(store.append(from, to, &format!("m{i}"), vec![]).await.unwrap());
        }
        let key = ConversationKey::new(b, a).unwrap();

        let pages: Vec<Vec<Message>> = store.history_pages(key, 5).try_collect().await.unwrap();
        assert_eq!(pages.len(), 5);
        for page in &pages {
            assert!(page.windows(2).all(|w| w[0].order_key() < w[1].order_key()));
        }
        let rebuilt: Vec<Message> = pages.into_iter().rev().flatten().collect();
        assert_eq!(rebuilt, sent);

        // restartable
        let again: Vec<Vec<Message>> = store.history_pages(key, 50).try_collect().await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].len(), 23);
    }

    #[tokio::test]
    async fn test_frozen_clock_orders_by_insertion() {
        let storage = Arc::new(Mutex::new(Storage::new(":memory:").unwrap()));
        let directory = Arc::new(SqliteDirectory::new(Arc::clone(&storage)));
        let store = MessageStore::with_parts(
            storage,
            directory,
            DeliveryChannel::new(4),
            Arc::new(FrozenClock(Utc::now())),
        )
        .await
        .unwrap();
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let b = registered(&store, ActorRef::user(Uuid::new_v4()), "bob").await;
        let first = store.append(a, b, "1", vec![]).await.unwrap();
        let second = store.append(b, a, "2", vec![]).await.unwrap();
        assert!(first.order_key() < second.order_key());
        assert!(first.created_at < second.created_at);
    }

    #[tokio::test]
    async fn test_conversation_list_one_entry_per_counterpart() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let b = registered(&store, ActorRef::user(Uuid::new_v4()), "bob").await;
        let c = registered(&store, ActorRef::company(Uuid::new_v4()), "acme").await;

        store.append(a, b, "to b", vec![]).await.unwrap();
        store.append(c, a, "from c", vec![]).await.unwrap();
        let last_b = store.append(b, a, "b replies", vec![]).await.unwrap();
        let last_c = store.append(a, c, "", vec![image()]).await.unwrap();

        let list = store.list_conversations_for(&a).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].other_participant, c);
        assert_eq!(list[0].last_message, last_c);
        assert_eq!(list[1].other_participant, b);
        assert_eq!(list[1].last_message, last_b);

        let for_b = store.list_conversations_for(&b).await.unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].last_message, last_b);

        let counterparts: HashSet<ActorRef> = list.iter().map(|c| c.other_participant).collect();
        assert_eq!(counterparts.len(), list.len());
    }

    #[tokio::test]
    async fn test_actor_without_messages_has_empty_list() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        assert!(store.list_conversations_for(&a).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let path = std::env::temp_dir().join(format!("dm-store-{}.db", Uuid::new_v4()));
        let path_str = path.to_str().unwrap().to_string();
        let (a, b, last) = {
            let store = MessageStore::open(Storage::new(&path_str).unwrap(), DeliveryChannel::new(4))
                .await
                .unwrap();
            let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
            let b = registered(&store, ActorRef::user(Uuid::new_v4()), "bob").await;
            store.append(a, b, "first", vec![]).await.unwrap();
            let last = store.append(b, a, "second", vec![]).await.unwrap();
            (a, b, last)
        };
        let reopened = MessageStore::open(Storage::new(&path_str).unwrap(), DeliveryChannel::new(4))
            .await
            .unwrap();
        let list = reopened.list_conversations_for(&a).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].other_participant, b);
        assert_eq!(list[0].last_message, last);
        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_append_pushes_to_receiver() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let b = registered(&store, ActorRef::user(Uuid::new_v4()), "bob").await;
        let mut inbox = store.delivery().subscribe(b);
        let sent = store.append(a, b, "ping", vec![]).await.unwrap();
        assert_eq!(inbox.recv().await, Some(sent));
    }

    #[tokio::test]
    async fn test_concurrent_senders_share_one_order() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let b = registered(&store, ActorRef::company(Uuid::new_v4()), "acme").await;

        let mut tasks = Vec::new();
        for (from, to) in [(a, b), (b, a)] {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..20 {
                    store.append(from, to, &format!("{from}-{i}"), vec![]).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let key = ConversationKey::new(a, b).unwrap();
        let full = store.history(&key, HistoryQuery::latest(100)).await.unwrap();
        assert_eq!(full.len(), 40);
        assert!(full.windows(2).all(|w| w[0].order_key() < w[1].order_key()));
        let again = store.history(&key, HistoryQuery::latest(100)).await.unwrap();
        assert_eq!(full, again);
        assert_eq!(store.gate_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_conversations_hold_no_gate() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        for i in 0..200 {
            let other = registered(&store, ActorRef::user(Uuid::new_v4()), &format!("user {i}")).await;
            store.append(a, other, "hello", vec![]).await.unwrap();
        }
        assert_eq!(store.gate_count(), 0);

        // a lease dropped without writing removes its entry as well
        let key = ConversationKey::new(a, ActorRef::user(Uuid::new_v4())).unwrap();
        drop(store.gate(key));
        assert_eq!(store.gate_count(), 0);
    }
}
