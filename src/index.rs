use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::models::{ActorRef, Message, MessageId};
use crate::storage::MessageHeader;

/// Latest message id per `(actor, counterpart)`.
///
/// Nothing here is persisted: the index is rebuilt from the message log on
/// start-up and kept current by `record` on every append.
#[derive(Default)]
pub struct ConversationIndex {
    latest: RwLock<HashMap<ActorRef, HashMap<ActorRef, MessageId>>>,
}

impl ConversationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays headers in id order.
    pub fn rebuild(headers: &[MessageHeader]) -> Self {
        let mut latest: HashMap<ActorRef, HashMap<ActorRef, MessageId>> = HashMap::new();
        for header in headers {
            upsert(&mut latest, header.sender, header.receiver, header.id);
        }
        ConversationIndex {
            latest: RwLock::new(latest),
        }
    }

    /// Must be called in append order for a given conversation.
    pub async fn record(&self, message: &Message) {
        let mut latest = self.latest.write().await;
        upsert(&mut latest, message.sender, message.receiver, message.id);
    }

    pub async fn latest_for(&self, actor: &ActorRef) -> Vec<(ActorRef, MessageId)> {
        let latest = self.latest.read().await;
        latest
            .get(actor)
            .map(|by_counterpart| by_counterpart.iter().map(|(c, id)| (*c, *id)).collect())
            .unwrap_or_default()
    }
}

fn upsert(
    latest: &mut HashMap<ActorRef, HashMap<ActorRef, MessageId>>,
    sender: ActorRef,
    receiver: ActorRef,
    id: MessageId,
) {
    latest.entry(sender).or_default().insert(receiver, id);
    latest.entry(receiver).or_default().insert(sender, id);
}
