use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{LocalClient, MessagingApi};
use crate::error::{ErrorBody, MessagingError, MessagingResult};
use crate::models::ActorRef;
use crate::protocol::{read_frame, skip_line, ClientRequest, Envelope, Frame, ServerResponse, MAX_FRAME_BYTES};
use crate::store::MessageStore;
use crate::uploads::ObjectStore;

const GREETING: &str = "Send Register { profile } or Hello { actor } to start";

pub struct Server {
    store: MessageStore,
    uploads: Arc<dyn ObjectStore>,
    max_frame: usize,
}

impl Server {
    pub fn new(store: MessageStore, uploads: Arc<dyn ObjectStore>) -> Self {
        Server {
            store,
            uploads,
            max_frame: MAX_FRAME_BYTES,
        }
    }

    /// Caps the length of a request line; longer requests end the connection.
    pub fn with_max_frame(mut self, bytes: usize) -> Self {
        self.max_frame = bytes;
        self
    }

    pub async fn run(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server running on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, addr) = listener.accept().await?;
            info!("New connection: {}", addr);

            let store = self.store.clone();
            let uploads = Arc::clone(&self.uploads);
            let max_frame = self.max_frame;

            tokio::spawn(async move {
                if let Err(e) = handle_client(socket, store, uploads, max_frame).await {
                    warn!("Error handling client {}: {}", addr, e);
                }
            });
        }
    }
}

/// The actor a connection speaks for, plus the task forwarding its pushes.
struct SignedIn {
    client: LocalClient,
    forwarder: JoinHandle<()>,
}

impl Drop for SignedIn {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

struct Connection {
    store: MessageStore,
    uploads: Arc<dyn ObjectStore>,
    outbound: mpsc::Sender<Envelope<ServerResponse>>,
    signed_in: Option<SignedIn>,
}

impl Connection {
    async fn sign_in(&mut self, actor: ActorRef) -> MessagingResult<()> {
        self.store.profile(&actor).await?;

        let mut subscription = self.store.delivery().subscribe(actor);
        let outbound = self.outbound.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let frame = Envelope::unsolicited(ServerResponse::Pushed(message));
                if outbound.send(frame).await.is_err() {
                    break;
                }
            }
        });
        // Replacing an earlier sign-in drops its forwarder and subscription.
        self.signed_in = Some(SignedIn {
            client: LocalClient::new(actor, self.store.clone(), Arc::clone(&self.uploads)),
            forwarder,
        });
        info!("{actor} signed in");
        Ok(())
    }

    fn client(&self) -> MessagingResult<&LocalClient> {
        self.signed_in
            .as_ref()
            .map(|s| &s.client)
            .ok_or_else(|| MessagingError::Validation("not signed in: send Hello first".into()))
    }

    async fn handle(&mut self, request: ClientRequest) -> MessagingResult<ServerResponse> {
        match request {
            ClientRequest::Register { profile } => {
                self.store.register_actor(&profile).await?;
                self.sign_in(profile.actor).await?;
                Ok(ServerResponse::Registered { actor: profile.actor })
            }
            ClientRequest::Hello { actor } => {
                self.sign_in(actor).await?;
                Ok(ServerResponse::Welcome { actor })
            }
            ClientRequest::Send(send) => Ok(ServerResponse::Sent(self.client()?.send(send).await?)),
            ClientRequest::History(query) => Ok(ServerResponse::History(self.client()?.history(query).await?)),
            ClientRequest::Conversations => Ok(ServerResponse::Conversations(self.client()?.conversations().await?)),
            ClientRequest::Profile { actor } => Ok(ServerResponse::Profile(self.client()?.profile(actor).await?)),
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    store: MessageStore,
    uploads: Arc<dyn ObjectStore>,
    max_frame: usize,
) -> Result<()> {
    let (reader, mut socket_write) = tokio::io::split(socket);
    let mut reader = BufReader::new(reader);
    let (tx, mut rx) = mpsc::channel::<Envelope<ServerResponse>>(100);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let response_json = serde_json::to_string(&response)?;
            debug!("Sending to client: {}", response_json);
            socket_write.write_all(response_json.as_bytes()).await?;
            socket_write.write_all(b"\n").await?;
            socket_write.flush().await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    tx.send(Envelope::unsolicited(ServerResponse::Prompt(GREETING.to_string())))
        .await?;

    let mut connection = Connection {
        store,
        uploads,
        outbound: tx.clone(),
        signed_in: None,
    };

    loop {
        let line = match read_frame(&mut reader, max_frame).await {
            Ok(Frame::Line(line)) => line,
            Ok(Frame::Eof) => break,
            Ok(Frame::TooLong) => {
                // The reply cannot name a request id it never read.
                warn!("request over {} bytes, closing connection", max_frame);
                let e = MessagingError::Validation(format!("request exceeds {max_frame} bytes"));
                let _ = tx
                    .send(Envelope::unsolicited(ServerResponse::Error(ErrorBody::from(&e))))
                    .await;
                // Unread input would turn the close into a reset and lose the error.
                if let Err(e) = skip_line(&mut reader).await {
                    debug!("Error draining oversized request: {}", e);
                }
                break;
            }
            Err(e) => {
                error!("Error reading from socket: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Envelope<ClientRequest>>(&line) {
            Ok(Envelope { request_id, body }) => {
                let response = connection.handle(body).await.unwrap_or_else(|e| {
                    debug!("Request {:?} failed: {}", request_id, e);
                    ServerResponse::Error(ErrorBody::from(&e))
                });
                Envelope::reply(request_id, response)
            }
            Err(e) => {
                let e = MessagingError::from(e);
                Envelope::unsolicited(ServerResponse::Error(ErrorBody::from(&e)))
            }
        };
        if tx.send(reply).await.is_err() {
            break;
        }
    }

    let actor = connection.signed_in.as_ref().map(|s| s.client.actor());
    info!("Connection closed for {:?}", actor.map(|a| a.to_string()));
    drop(connection);
    drop(tx);
    writer.await??;
    Ok(())
}
