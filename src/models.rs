use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MessagingError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    User,
    Company,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::User => "user",
            ActorKind::Company => "company",
        }
    }
}

impl FromStr for ActorKind {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ActorKind::User),
            "company" => Ok(ActorKind::Company),
            other => Err(MessagingError::Validation(format!("unknown actor kind '{other}'"))),
        }
    }
}

/// A participant reference. The messaging core never owns actors, it only
/// stores `(id, kind)` pairs resolved by the identity directory.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorRef {
    pub id: Uuid,
    pub kind: ActorKind,
}

impl ActorRef {
    pub fn new(id: Uuid, kind: ActorKind) -> Self {
        ActorRef { id, kind }
    }

    pub fn user(id: Uuid) -> Self {
        ActorRef::new(id, ActorKind::User)
    }

    pub fn company(id: Uuid) -> Self {
        ActorRef::new(id, ActorKind::Company)
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

impl FromStr for ActorRef {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| MessagingError::Validation(format!("malformed actor reference '{s}'")))?;
        let id = Uuid::parse_str(id)
            .map_err(|e| MessagingError::Validation(format!("malformed actor id '{id}': {e}")))?;
        Ok(ActorRef::new(id, kind.parse()?))
    }
}

/// Canonical identifier for the conversation between two actors.
///
/// The pair is stored sorted, so both participants always derive the same key
/// and share a single history.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey {
    low: ActorRef,
    high: ActorRef,
}

impl ConversationKey {
    pub fn new(a: ActorRef, b: ActorRef) -> Result<Self, MessagingError> {
        if a == b {
            return Err(MessagingError::Validation(format!(
                "{a} cannot hold a conversation with itself"
            )));
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(ConversationKey { low, high })
    }

    pub fn participants(&self) -> (ActorRef, ActorRef) {
        (self.low, self.high)
    }

    pub fn contains(&self, actor: &ActorRef) -> bool {
        self.low == *actor || self.high == *actor
    }

    /// The participant that is not `actor`, if `actor` takes part at all.
    pub fn other(&self, actor: &ActorRef) -> Option<ActorRef> {
        if self.low == *actor {
            Some(self.high)
        } else if self.high == *actor {
            Some(self.low)
        } else {
            None
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.low, self.high)
    }
}

impl FromStr for ConversationKey {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once('|')
            .ok_or_else(|| MessagingError::Validation(format!("malformed conversation key '{s}'")))?;
        ConversationKey::new(a.parse()?, b.parse()?)
    }
}

/// Store-assigned message id, strictly increasing in insertion order.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::File => "file",
        }
    }

    /// Best guess from a file name's extension; anything unknown is a plain file.
    pub fn from_file_name(name: &str) -> Self {
        let ext = std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "svg" => AttachmentKind::Image,
            "mp4" | "mov" | "webm" | "mkv" | "avi" => AttachmentKind::Video,
            _ => AttachmentKind::File,
        }
    }
}

impl FromStr for AttachmentKind {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(AttachmentKind::Image),
            "video" => Ok(AttachmentKind::Video),
            "file" => Ok(AttachmentKind::File),
            other => Err(MessagingError::Validation(format!("unknown attachment kind '{other}'"))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub url: String,
    pub original_name: String,
}

/// An immutable, stored message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub sender: ActorRef,
    pub receiver: ActorRef,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Total order within a conversation.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }

    pub fn counterpart_of(&self, actor: &ActorRef) -> Option<ActorRef> {
        self.conversation_key.other(actor)
    }
}

/// Derived view: the newest message between an actor and one counterpart.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Conversation {
    pub key: ConversationKey,
    pub other_participant: ActorRef,
    pub last_message: Message,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub actor: ActorRef,
    pub display_name: String,
    pub avatar_url: Option<String>,
}
