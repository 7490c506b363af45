use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

use crate::models::{ActorRef, Message};

type Subscribers = HashMap<ActorRef, Vec<(u64, mpsc::Sender<Message>)>>;

struct Inner {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    capacity: usize,
    events: broadcast::Sender<Message>,
}

impl Inner {
    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, actor: &ActorRef, id: u64) {
        let mut subscribers = self.subscribers();
        if let Some(sessions) = subscribers.get_mut(actor) {
            sessions.retain(|(sid, _)| *sid != id);
            if sessions.is_empty() {
                subscribers.remove(actor);
            }
        }
    }
}

/// Best-effort push of new messages to connected sessions.
///
/// A missed push loses nothing: the message is already in the store and shows
/// up on the recipient's next history or conversation-list fetch.
#[derive(Clone)]
pub struct DeliveryChannel {
    inner: Arc<Inner>,
}

impl DeliveryChannel {
    /// `capacity` bounds each session's queue of undelivered pushes.
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        DeliveryChannel {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                events,
            }),
        }
    }

    pub fn subscribe(&self, actor: ActorRef) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.subscribers().entry(actor).or_default().push((id, tx));
        debug!("{actor} subscribed (session {id})");
        Subscription {
            actor,
            id,
            receiver: rx,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Pushes `message` to every live session of its receiver and to the
    /// "message created" firehose. Returns how many sessions got it.
    pub fn publish(&self, message: &Message) -> usize {
        let _ = self.inner.events.send(message.clone());

        let mut subscribers = self.inner.subscribers();
        let Some(sessions) = subscribers.get_mut(&message.receiver) else {
            debug!("{} is offline, message {} left for pull", message.receiver, message.id);
            return 0;
        };

        let mut delivered = 0;
        sessions.retain(|(sid, tx)| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    "push queue full for {} (session {sid}), dropping push of message {}",
                    message.receiver, message.id
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if sessions.is_empty() {
            subscribers.remove(&message.receiver);
        }
        delivered
    }

    /// Every created message, for the notification collaborator.
    pub fn events(&self) -> broadcast::Receiver<Message> {
        self.inner.events.subscribe()
    }

    pub fn session_count(&self, actor: &ActorRef) -> usize {
        self.inner.subscribers().get(actor).map_or(0, Vec::len)
    }
}

/// A registered session. Dropping it unregisters the session.
pub struct Subscription {
    actor: ActorRef,
    id: u64,
    receiver: mpsc::Receiver<Message>,
    channel: Weak<Inner>,
}

impl Subscription {
    pub fn actor(&self) -> ActorRef {
        self.actor
    }

    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.remove(&self.actor, self.id);
            debug!("{} unsubscribed (session {})", self.actor, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationKey, MessageId};
    use chrono::Utc;
    use uuid::Uuid;

    fn message(id: i64, sender: ActorRef, receiver: ActorRef) -> Message {
        Message {
            id: MessageId(id),
            conversation_key: ConversationKey::new(sender, receiver).unwrap(),
            sender,
            receiver,
            content: "hi".into(),
            attachments: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_session_of_receiver() {
        let channel = DeliveryChannel::new(8);
        let a = ActorRef::user(Uuid::new_v4());
        let b = ActorRef::user(Uuid::new_v4());
        let mut phone = channel.subscribe(b);
        let mut laptop = channel.subscribe(b);
        let mut sender_session = channel.subscribe(a);

        assert_eq!(channel.publish(&message(1, a, b)), 2);
        assert_eq!(phone.recv().await.unwrap().id, MessageId(1));
        assert_eq!(laptop.recv().await.unwrap().id, MessageId(1));
        assert!(sender_session.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_receiver_is_not_an_error() {
        let channel = DeliveryChannel::new(8);
        let a = ActorRef::user(Uuid::new_v4());
        let b = ActorRef::company(Uuid::new_v4());
        assert_eq!(channel.publish(&message(1, a, b)), 0);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unregisters() {
        let channel = DeliveryChannel::new(8);
        let b = ActorRef::user(Uuid::new_v4());
        let sub = channel.subscribe(b);
        assert_eq!(channel.session_count(&b), 1);
        drop(sub);
        assert_eq!(channel.session_count(&b), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_push_but_keeps_session() {
        let channel = DeliveryChannel::new(1);
        let a = ActorRef::user(Uuid::new_v4());
        let b = ActorRef::user(Uuid::new_v4());
        let mut sub = channel.subscribe(b);
        assert_eq!(channel.publish(&message(1, a, b)), 1);
        assert_eq!(channel.publish(&message(2, a, b)), 0);
        assert_eq!(channel.session_count(&b), 1);
        assert_eq!(sub.recv().await.unwrap().id, MessageId(1));
    }

    #[tokio::test]
    async fn test_events_see_every_message() {
        let channel = DeliveryChannel::new(8);
        let mut events = channel.events();
        let a = ActorRef::user(Uuid::new_v4());
        let b = ActorRef::user(Uuid::new_v4());
        channel.publish(&message(7, a, b));
        assert_eq!(events.recv().await.unwrap().id, MessageId(7));
    }
}
