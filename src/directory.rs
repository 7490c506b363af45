use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::MessagingResult;
use crate::models::{ActorRef, Profile};
use crate::storage::Storage;

/// Resolves actor references to profiles on behalf of the identity service.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn resolve(&self, actor: &ActorRef) -> MessagingResult<Option<Profile>>;

    async fn register(&self, profile: &Profile) -> MessagingResult<()>;
}

/// Directory backed by the `actors` table of the message database.
pub struct SqliteDirectory {
    storage: Arc<Mutex<Storage>>,
}

impl SqliteDirectory {
    pub fn new(storage: Arc<Mutex<Storage>>) -> Self {
        SqliteDirectory { storage }
    }
}

#[async_trait]
impl IdentityDirectory for SqliteDirectory {
    async fn resolve(&self, actor: &ActorRef) -> MessagingResult<Option<Profile>> {
        self.storage.lock().await.get_actor(actor)
    }

    async fn register(&self, profile: &Profile) -> MessagingResult<()> {
        self.storage.lock().await.save_actor(profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_register_then_resolve() {
        let storage = Arc::new(Mutex::new(Storage::new(":memory:").unwrap()));
        let directory = SqliteDirectory::new(storage);
        let profile = Profile {
            actor: ActorRef::user(Uuid::new_v4()),
            display_name: "alice".into(),
            avatar_url: Some("https://cdn.example/alice.png".into()),
        };
        assert_eq!(directory.resolve(&profile.actor).await.unwrap(), None);
        directory.register(&profile).await.unwrap();
        assert_eq!(directory.resolve(&profile.actor).await.unwrap(), Some(profile));
    }
}
