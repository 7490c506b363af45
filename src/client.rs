use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::api::MessagingApi;
use crate::error::{MessagingError, MessagingResult};
use crate::models::{ActorRef, Conversation, Message, Profile};
use crate::protocol::{
    read_frame, ClientRequest, Envelope, Frame, HistoryRequest, SendRequest, ServerResponse, MAX_FRAME_BYTES,
};

/// Pushes buffered for the caller before new ones are dropped.
pub const PUSH_QUEUE: usize = 100;

type Waiters = HashMap<u64, oneshot::Sender<ServerResponse>>;
/// `None` once the connection is gone.
type Pending = Arc<StdMutex<Option<Waiters>>>;

/// Messaging over a server connection.
///
/// Replies are matched to callers by request id, so several calls may be in
/// flight at once. Pushed messages arrive on the receiver returned by
/// [`RemoteClient::connect`].
pub struct RemoteClient {
    actor: ActorRef,
    writer: Mutex<WriteHalf<TcpStream>>,
    pending: Pending,
    next_request: AtomicU64,
    reader: JoinHandle<()>,
}

impl RemoteClient {
    /// Connects and signs in as an already registered actor.
    pub async fn connect(addr: &str, actor: ActorRef) -> MessagingResult<(Self, mpsc::Receiver<Message>)> {
        let (client, pushes) = Self::open(addr, actor).await?;
        match client.call(ClientRequest::Hello { actor }).await? {
            ServerResponse::Welcome { .. } => Ok((client, pushes)),
            other => Err(unexpected("Hello", &other)),
        }
    }

    /// Connects, registers `profile` and signs in as it.
    pub async fn register(addr: &str, profile: Profile) -> MessagingResult<(Self, mpsc::Receiver<Message>)> {
        let (client, pushes) = Self::open(addr, profile.actor).await?;
        match client.call(ClientRequest::Register { profile }).await? {
            ServerResponse::Registered { .. } => Ok((client, pushes)),
            other => Err(unexpected("Register", &other)),
        }
    }

    async fn open(addr: &str, actor: ActorRef) -> MessagingResult<(Self, mpsc::Receiver<Message>)> {
        let stream = TcpStream::connect(addr).await?;
        info!("Connected to {}", addr);
        let (reader, writer) = tokio::io::split(stream);
        let pending: Pending = Arc::new(StdMutex::new(Some(HashMap::new())));
        let (push_tx, push_rx) = mpsc::channel(PUSH_QUEUE);
        let reader = tokio::spawn(read_responses(reader, Arc::clone(&pending), push_tx));
        Ok((
            RemoteClient {
                actor,
                writer: Mutex::new(writer),
                pending,
                next_request: AtomicU64::new(1),
                reader,
            },
            push_rx,
        ))
    }

    async fn call(&self, body: ClientRequest) -> MessagingResult<ServerResponse> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Envelope::reply(Some(request_id), body))
            .map_err(|e| MessagingError::Validation(format!("unencodable request: {e}")))?;
        if line.len() > MAX_FRAME_BYTES {
            return Err(MessagingError::Validation(format!(
                "request of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit",
                line.len()
            )));
        }

        let (tx, rx) = oneshot::channel();
        match lock(&self.pending).as_mut() {
            Some(waiters) => waiters.insert(request_id, tx),
            None => return Err(connection_closed()),
        };
        let written = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            if let Some(waiters) = lock(&self.pending).as_mut() {
                waiters.remove(&request_id);
            }
            return Err(e.into());
        }

        match rx.await {
            Ok(ServerResponse::Error(body)) => Err(body.into()),
            Ok(response) => Ok(response),
            Err(_) => Err(connection_closed()),
        }
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl MessagingApi for RemoteClient {
    fn actor(&self) -> ActorRef {
        self.actor
    }

    async fn send(&self, request: SendRequest) -> MessagingResult<Message> {
        match self.call(ClientRequest::Send(request)).await? {
            ServerResponse::Sent(message) => Ok(message),
            other => Err(unexpected("Send", &other)),
        }
    }

    async fn history(&self, request: HistoryRequest) -> MessagingResult<Vec<Message>> {
        match self.call(ClientRequest::History(request)).await? {
            ServerResponse::History(messages) => Ok(messages),
            other => Err(unexpected("History", &other)),
        }
    }

    async fn conversations(&self) -> MessagingResult<Vec<Conversation>> {
        match self.call(ClientRequest::Conversations).await? {
            ServerResponse::Conversations(list) => Ok(list),
            other => Err(unexpected("Conversations", &other)),
        }
    }

    async fn profile(&self, actor: ActorRef) -> MessagingResult<Profile> {
        match self.call(ClientRequest::Profile { actor }).await? {
            ServerResponse::Profile(profile) => Ok(profile),
            other => Err(unexpected("Profile", &other)),
        }
    }
}

async fn read_responses(reader: ReadHalf<TcpStream>, pending: Pending, pushes: mpsc::Sender<Message>) {
    let mut reader = BufReader::new(reader);
    loop {
        let line = match read_frame(&mut reader, MAX_FRAME_BYTES).await {
            Ok(Frame::Line(line)) => line,
            Ok(Frame::Eof) => {
                info!("Server disconnected");
                break;
            }
            Ok(Frame::TooLong) => {
                warn!("reply over {} bytes, dropping connection", MAX_FRAME_BYTES);
                break;
            }
            Err(e) => {
                warn!("Error reading: {}", e);
                break;
            }
        };
        let envelope = match serde_json::from_str::<Envelope<ServerResponse>>(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Invalid response {}: {}", line, e);
                continue;
            }
        };
        match (envelope.request_id, envelope.body) {
            (Some(id), body) => {
                let waiter = lock(&pending).as_mut().and_then(|w| w.remove(&id));
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(body);
                    }
                    None => debug!("reply to unknown request {}", id),
                }
            }
            // Replies share this task, so a slow push reader must never stall it.
            // Dropped pushes are recovered through history.
            (None, ServerResponse::Pushed(message)) => match pushes.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    warn!("push queue full, dropping push of message {}", message.id)
                }
                Err(TrySendError::Closed(_)) => debug!("push receiver dropped"),
            },
            (None, ServerResponse::Prompt(text)) => debug!("server: {}", text),
            (None, ServerResponse::Error(body)) => warn!("server error: {} {}", body.code, body.message),
            (None, other) => debug!("ignoring unsolicited {:?}", other),
        }
    }
    // Wake every caller still waiting; they see a closed connection.
    lock(&pending).take();
}

fn lock(pending: &Pending) -> MutexGuard<'_, Option<Waiters>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn connection_closed() -> MessagingError {
    MessagingError::TransientIo("connection closed before reply".into())
}

fn unexpected(request: &str, response: &ServerResponse) -> MessagingError {
    MessagingError::Validation(format!("unexpected reply to {request}: {response:?}"))
}
