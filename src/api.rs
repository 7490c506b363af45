use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{MessagingError, MessagingResult};
use crate::models::{ActorRef, Attachment, Conversation, ConversationKey, Message, Profile};
use crate::protocol::{HistoryRequest, SendRequest};
use crate::store::{HistoryQuery, MessageStore};
use crate::uploads::ObjectStore;

/// What a signed-in actor can ask of the messaging core, whether in-process
/// or across the wire.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    fn actor(&self) -> ActorRef;

    async fn send(&self, request: SendRequest) -> MessagingResult<Message>;

    async fn history(&self, request: HistoryRequest) -> MessagingResult<Vec<Message>>;

    async fn conversations(&self) -> MessagingResult<Vec<Conversation>>;

    async fn profile(&self, actor: ActorRef) -> MessagingResult<Profile>;
}

/// Acts for one actor directly against the store.
#[derive(Clone)]
pub struct LocalClient {
    actor: ActorRef,
    store: MessageStore,
    uploads: Arc<dyn ObjectStore>,
}

impl LocalClient {
    pub fn new(actor: ActorRef, store: MessageStore, uploads: Arc<dyn ObjectStore>) -> Self {
        LocalClient { actor, store, uploads }
    }
}

#[async_trait]
impl MessagingApi for LocalClient {
    fn actor(&self) -> ActorRef {
        self.actor
    }

    async fn send(&self, request: SendRequest) -> MessagingResult<Message> {
        if request.content.is_empty() && request.files.is_empty() {
            return Err(MessagingError::Validation(
                "a message needs text or at least one attachment".into(),
            ));
        }
        // Reject bad routes before anything reaches object storage.
        self.store.route(&self.actor, &request.receiver).await?;

        let mut attachments = Vec::with_capacity(request.files.len());
        for file in &request.files {
            let url = self.uploads.put(&file.original_name, &file.data).await?;
            attachments.push(Attachment {
                kind: file.kind,
                url,
                original_name: file.original_name.clone(),
            });
        }
        self.store
            .append(self.actor, request.receiver, &request.content, attachments)
            .await
    }

    async fn history(&self, request: HistoryRequest) -> MessagingResult<Vec<Message>> {
        let key: ConversationKey = self.store.route(&self.actor, &request.counterpart).await?;
        self.store
            .history(
                &key,
                HistoryQuery {
                    before: request.before,
                    limit: request.limit,
                },
            )
            .await
    }

    async fn conversations(&self) -> MessagingResult<Vec<Conversation>> {
        self.store.list_conversations_for(&self.actor).await
    }

    async fn profile(&self, actor: ActorRef) -> MessagingResult<Profile> {
        self.store.profile(&actor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttachmentKind;
    use crate::protocol::OutgoingFile;
    use crate::store::tests::{registered, setup_store};
    use crate::uploads::MemoryObjectStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_send_uploads_files_then_appends() {
        let store = setup_store().await;
        let uploads = Arc::new(MemoryObjectStore::new());
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let b = registered(&store, ActorRef::company(Uuid::new_v4()), "acme").await;
        let client = LocalClient::new(a, store.clone(), uploads.clone());

        let message = client
            .send(SendRequest {
                receiver: b,
                content: String::new(),
                files: vec![OutgoingFile {
                    kind: AttachmentKind::Video,
                    original_name: "pitch.mp4".into(),
                    data: b"frames".to_vec(),
                }],
            })
            .await
            .unwrap();

        assert_eq!(message.attachments.len(), 1);
        assert_eq!(message.attachments[0].original_name, "pitch.mp4");
        assert_eq!(uploads.get(&message.attachments[0].url).await, Some(b"frames".to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_receiver_uploads_nothing() {
        let store = setup_store().await;
        let uploads = Arc::new(MemoryObjectStore::new());
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let client = LocalClient::new(a, store, uploads.clone());

        let result = client
            .send(SendRequest {
                receiver: ActorRef::user(Uuid::new_v4()),
                content: "hi".into(),
                files: vec![OutgoingFile {
                    kind: AttachmentKind::File,
                    original_name: "notes.txt".into(),
                    data: b"x".to_vec(),
                }],
            })
            .await;
        assert!(matches!(result, Err(MessagingError::NotFound(_))));
        assert_eq!(uploads.len().await, 0);
    }

    #[tokio::test]
    async fn test_history_with_unknown_counterpart_is_not_found() {
        let store = setup_store().await;
        let a = registered(&store, ActorRef::user(Uuid::new_v4()), "alice").await;
        let client = LocalClient::new(a, store, Arc::new(MemoryObjectStore::new()));
        let result = client
            .history(HistoryRequest {
                counterpart: ActorRef::company(Uuid::new_v4()),
                before: None,
                limit: 10,
            })
            .await;
        assert!(matches!(result, Err(MessagingError::NotFound(_))));
    }
}
