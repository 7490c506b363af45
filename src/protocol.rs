//! Newline-delimited JSON frames exchanged between client and server.
//!
//! Every line is one [`Envelope`]. Replies echo the request's `request_id`;
//! unsolicited frames (`Prompt`, `Pushed`) carry none.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::ErrorBody;
use crate::models::{ActorRef, AttachmentKind, Conversation, Message, MessageId, Profile};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Envelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn reply(request_id: Option<u64>, body: T) -> Self {
        Envelope { request_id, body }
    }

    pub fn unsolicited(body: T) -> Self {
        Envelope { request_id: None, body }
    }
}

/// A file picked for upload, bytes travel base64-encoded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OutgoingFile {
    pub kind: AttachmentKind,
    pub original_name: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub receiver: ActorRef,
    pub content: String,
    #[serde(default)]
    pub files: Vec<OutgoingFile>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryRequest {
    pub counterpart: ActorRef,
    #[serde(default)]
    pub before: Option<MessageId>,
    pub limit: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ClientRequest {
    Register { profile: Profile },
    Hello { actor: ActorRef },
    Send(SendRequest),
    History(HistoryRequest),
    Conversations,
    Profile { actor: ActorRef },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ServerResponse {
    Prompt(String),
    Welcome { actor: ActorRef },
    Registered { actor: ActorRef },
    Sent(Message),
    History(Vec<Message>),
    Conversations(Vec<Conversation>),
    Profile(Profile),
    Pushed(Message),
    Error(ErrorBody),
}

/// Longest line either side accepts, newline excluded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// The line outgrew the limit; the rest of it is still unread.
    TooLong,
    Eof,
}

/// Reads one line, buffering at most `max` bytes of it.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader).take(max as u64 + 1).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > max {
        return Ok(Frame::TooLong);
    }
    Ok(Frame::Line(String::from_utf8_lossy(&buf).into_owned()))
}

/// Discards input up to and including the next newline.
pub async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|b| *b == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
