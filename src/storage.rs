use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{MessagingError, MessagingResult};
use crate::models::{ActorRef, Attachment, ConversationKey, Message, MessageId, Profile};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS actors (
        id TEXT NOT NULL,
        kind TEXT NOT NULL,
        display_name TEXT NOT NULL,
        avatar_url TEXT,
        PRIMARY KEY (id, kind)
    );
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_key TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        sender_kind TEXT NOT NULL,
        receiver_id TEXT NOT NULL,
        receiver_kind TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at_us INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS messages_by_conversation
        ON messages (conversation_key, created_at_us, id);
    CREATE TABLE IF NOT EXISTS attachments (
        message_id INTEGER NOT NULL REFERENCES messages (id),
        position INTEGER NOT NULL,
        kind TEXT NOT NULL,
        url TEXT NOT NULL,
        original_name TEXT NOT NULL,
        PRIMARY KEY (message_id, position)
    );
";

const MESSAGE_COLUMNS: &str =
    "id, sender_id, sender_kind, receiver_id, receiver_kind, content, created_at_us";

/// A message that has passed validation but has no id or timestamp yet.
pub struct NewMessage<'a> {
    pub sender: ActorRef,
    pub receiver: ActorRef,
    pub content: &'a str,
    pub attachments: &'a [Attachment],
}

/// Sender/receiver of a stored message, enough to rebuild the conversation index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: MessageId,
    pub sender: ActorRef,
    pub receiver: ActorRef,
}

pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn new(db_path: &str) -> MessagingResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Storage { conn })
    }

    pub fn save_actor(&self, profile: &Profile) -> MessagingResult<()> {
        self.conn.execute(
            "INSERT INTO actors (id, kind, display_name, avatar_url) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id, kind) DO UPDATE SET
                display_name = excluded.display_name,
                avatar_url = excluded.avatar_url",
            params![
                profile.actor.id.to_string(),
                profile.actor.kind.as_str(),
                profile.display_name,
                profile.avatar_url
            ],
        )?;
        Ok(())
    }

    pub fn get_actor(&self, actor: &ActorRef) -> MessagingResult<Option<Profile>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT display_name, avatar_url FROM actors WHERE id = ?1 AND kind = ?2")?;
        let profile = stmt
            .query_row(params![actor.id.to_string(), actor.kind.as_str()], |row| {
                Ok(Profile {
                    actor: *actor,
                    display_name: row.get(0)?,
                    avatar_url: row.get(1)?,
                })
            })
            .optional()?;
        Ok(profile)
    }

    /// Persists a message and its attachments in one transaction.
    ///
    /// `created_at` is `now`, pushed forward to one microsecond past the
    /// conversation's newest message when the clock has not moved on.
    pub fn insert_message(&mut self, new: NewMessage<'_>, now: DateTime<Utc>) -> MessagingResult<Message> {
        let key = ConversationKey::new(new.sender, new.receiver)?;
        let key_text = key.to_string();
        let tx = self.conn.transaction()?;

        let last_us: Option<i64> = tx.query_row(
            "SELECT MAX(created_at_us) FROM messages WHERE conversation_key = ?1",
            [&key_text],
            |row| row.get(0),
        )?;
        let now_us = now.timestamp_micros();
        let created_at_us = match last_us {
            Some(last) if last >= now_us => last + 1,
            _ => now_us,
        };

        tx.execute(
            "INSERT INTO messages (conversation_key, sender_id, sender_kind, receiver_id, receiver_kind, content, created_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key_text,
                new.sender.id.to_string(),
                new.sender.kind.as_str(),
                new.receiver.id.to_string(),
                new.receiver.kind.as_str(),
                new.content,
                created_at_us
            ],
        )?;
        let id = tx.last_insert_rowid();

        for (position, attachment) in new.attachments.iter().enumerate() {
            tx.execute(
                "INSERT INTO attachments (message_id, position, kind, url, original_name)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    position as i64,
                    attachment.kind.as_str(),
                    attachment.url,
                    attachment.original_name
                ],
            )?;
        }
        tx.commit()?;

        Ok(Message {
            id: MessageId(id),
            conversation_key: key,
            sender: new.sender,
            receiver: new.receiver,
            content: new.content.to_string(),
            attachments: new.attachments.to_vec(),
            created_at: micros_to_datetime(created_at_us)?,
        })
    }

    /// One page of a conversation, oldest to newest, strictly older than `before`.
    pub fn history_page(
        &self,
        key: &ConversationKey,
        before: Option<MessageId>,
        limit: usize,
    ) -> MessagingResult<Vec<Message>> {
        let key_text = key.to_string();
        let cursor_us: Option<i64> = match before {
            Some(cursor) => {
                let found = self
                    .conn
                    .query_row(
                        "SELECT created_at_us FROM messages WHERE id = ?1 AND conversation_key = ?2",
                        params![cursor.0, key_text],
                        |row| row.get(0),
                    )
                    .optional()?;
                match found {
                    Some(us) => Some(us),
                    None => {
                        return Err(MessagingError::NotFound(format!(
                            "message {cursor} is not part of conversation {key}"
                        )))
                    }
                }
            }
            None => None,
        };

        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_key = ?1
               AND (?2 IS NULL OR created_at_us < ?2 OR (created_at_us = ?2 AND id < ?3))
             ORDER BY created_at_us DESC, id DESC
             LIMIT ?4"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![key_text, cursor_us, before.map(|b| b.0), limit as i64],
            message_from_row,
        )?;
        let mut page = rows.collect::<Result<Vec<_>, _>>()?;
        page.reverse();
        for message in page.iter_mut() {
            message.attachments = self.load_attachments(message.id)?;
        }
        Ok(page)
    }

    pub fn messages_by_ids(&self, ids: &[MessageId]) -> MessagingResult<Vec<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut message) = stmt.query_row([id.0], message_from_row).optional()? {
                message.attachments = self.load_attachments(message.id)?;
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Every message's participants in id order.
    pub fn message_headers(&self) -> MessagingResult<Vec<MessageHeader>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sender_id, sender_kind, receiver_id, receiver_kind FROM messages ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MessageHeader {
                id: MessageId(row.get(0)?),
                sender: actor_from_row(row, 1, 2)?,
                receiver: actor_from_row(row, 3, 4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn message_count(&self) -> MessagingResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn load_attachments(&self, message_id: MessageId) -> MessagingResult<Vec<Attachment>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT kind, url, original_name FROM attachments WHERE message_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([message_id.0], |row| {
            let kind: String = row.get(0)?;
            Ok(Attachment {
                kind: kind.parse().map_err(|e| conversion_error(0, e))?,
                url: row.get(1)?,
                original_name: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn conversion_error(idx: usize, e: MessagingError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn actor_from_row(row: &Row<'_>, id_idx: usize, kind_idx: usize) -> rusqlite::Result<ActorRef> {
    let id: String = row.get(id_idx)?;
    let kind: String = row.get(kind_idx)?;
    format!("{kind}:{id}")
        .parse()
        .map_err(|e| conversion_error(id_idx, e))
}

fn micros_to_datetime(us: i64) -> MessagingResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(us)
        .ok_or_else(|| MessagingError::TransientIo(format!("stored timestamp {us} out of range")))
}

/// Attachments are left empty and filled in by the caller.
fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let sender = actor_from_row(row, 1, 2)?;
    let receiver = actor_from_row(row, 3, 4)?;
    let created_at_us: i64 = row.get(6)?;
    Ok(Message {
        id: MessageId(row.get(0)?),
        conversation_key: ConversationKey::new(sender, receiver).map_err(|e| conversion_error(1, e))?,
        sender,
        receiver,
        content: row.get(5)?,
        attachments: Vec::new(),
        created_at: micros_to_datetime(created_at_us).map_err(|e| conversion_error(6, e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttachmentKind;
    use chrono::Duration;
    use uuid::Uuid;

    fn setup_in_memory_db() -> Storage {
        Storage::new(":memory:").unwrap()
    }

    fn text<'a>(sender: ActorRef, receiver: ActorRef, content: &'a str) -> NewMessage<'a> {
        NewMessage {
            sender,
            receiver,
            content,
            attachments: &[],
        }
    }

    #[test]
    fn test_save_and_get_actor() {
        let storage = setup_in_memory_db();
        let profile = Profile {
            actor: ActorRef::company(Uuid::new_v4()),
            display_name: "Acme".to_string(),
            avatar_url: None,
        };
        storage.save_actor(&profile).unwrap();
        assert_eq!(storage.get_actor(&profile.actor).unwrap(), Some(profile.clone()));

        let renamed = Profile {
            display_name: "Acme Corp".to_string(),
            ..profile
        };
        storage.save_actor(&renamed).unwrap();
        assert_eq!(storage.get_actor(&renamed.actor).unwrap().unwrap().display_name, "Acme Corp");
    }

    #[test]
    fn test_get_nonexistent_actor() {
        let storage = setup_in_memory_db();
        let id = Uuid::new_v4();
        storage
            .save_actor(&Profile {
                actor: ActorRef::user(id),
                display_name: "bob".to_string(),
                avatar_url: None,
            })
            .unwrap();
        assert_eq!(storage.get_actor(&ActorRef::company(id)).unwrap(), None);
    }

    #[test]
    fn test_insert_keeps_attachment_order() {
        let mut storage = setup_in_memory_db();
        let a = ActorRef::user(Uuid::new_v4());
        let b = ActorRef::user(Uuid::new_v4());
        let attachments = vec![
            Attachment {
                kind: AttachmentKind::Image,
                url: "file:///u/1.png".into(),
                original_name: "1.png".into(),
            },
            Attachment {
                kind: AttachmentKind::File,
                url: "file:///u/cv.pdf".into(),
                original_name: "cv.pdf".into(),
            },
        ];
        let stored = storage
            .insert_message(
                NewMessage {
                    sender: a,
                    receiver: b,
                    content: "",
                    attachments: &attachments,
                },
                Utc::now(),
            )
            .unwrap();
        let key = ConversationKey::new(a, b).unwrap();
        let page = storage.history_page(&key, None, 10).unwrap();
        assert_eq!(page, vec![stored]);
        assert_eq!(page[0].attachments, attachments);
    }

    #[test]
    fn test_colliding_clock_still_strictly_increases() {
        let mut storage = setup_in_memory_db();
        let a = ActorRef::user(Uuid::new_v4());
        let b = ActorRef::company(Uuid::new_v4());
        let now = Utc::now();
        let first = storage.insert_message(text(a, b, "one"), now).unwrap();
        let second = storage.insert_message(text(b, a, "two"), now).unwrap();
        let third = storage.insert_message(text(a, b, "three"), now - Duration::seconds(5)).unwrap();
        assert!(first.created_at < second.created_at);
        assert!(second.created_at < third.created_at);
        assert_eq!(second.created_at - first.created_at, Duration::microseconds(1));
        assert!(first.id < second.id && second.id < third.id);
    }

    #[test]
    fn test_history_page_respects_cursor() {
        let mut storage = setup_in_memory_db();
        let a = ActorRef::user(Uuid::new_v4());
        let b = ActorRef::user(Uuid::new_v4());
        let ids: Vec<MessageId> = (0..5)
            .map(|i| storage.insert_message(text(a, b, &i.to_string()), Utc::now()).unwrap().id)
            .collect();
        let key = ConversationKey::new(a, b).unwrap();

        let newest = storage.history_page(&key, None, 2).unwrap();
        assert_eq!(newest.iter().map(|m| m.id).collect::<Vec<_>>(), ids[3..].to_vec());

        let older = storage.history_page(&key, Some(ids[3]), 2).unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[1..3].to_vec());

        assert!(storage.history_page(&key, Some(ids[0]), 2).unwrap().is_empty());
    }

    #[test]
    fn test_cursor_from_other_conversation_is_not_found() {
        let mut storage = setup_in_memory_db();
        let a = ActorRef::user(Uuid::new_v4());
        let b = ActorRef::user(Uuid::new_v4());
        let c = ActorRef::user(Uuid::new_v4());
        let elsewhere = storage.insert_message(text(a, c, "hi c"), Utc::now()).unwrap();
        let key = ConversationKey::new(a, b).unwrap();
        assert!(matches!(
            storage.history_page(&key, Some(elsewhere.id), 10),
            Err(MessagingError::NotFound(_))
        ));
    }

    #[test]
    fn test_headers_and_count() {
        let mut storage = setup_in_memory_db();
        let a = ActorRef::user(Uuid::new_v4());
        let b = ActorRef::company(Uuid::new_v4());
        storage.insert_message(text(a, b, "x"), Utc::now()).unwrap();
        storage.insert_message(text(b, a, "y"), Utc::now()).unwrap();
        let headers = storage.message_headers().unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].sender, b);
        assert_eq!(headers[1].receiver, a);
        assert_eq!(storage.message_count().unwrap(), 2);
    }
}
