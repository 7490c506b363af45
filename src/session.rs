//! Client-side state for the one conversation a user has open.
//!
//! The session never performs I/O. Operations that need the server hand back
//! a pending request tagged with the session epoch; the caller runs it however
//! it likes and feeds the outcome back in. Outcomes whose epoch no longer
//! matches are discarded, which is how a late history response for a
//! conversation the user already left is kept out of the current one.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use thiserror::Error;

use crate::error::{MessagingError, MessagingResult};
use crate::models::{ActorRef, AttachmentKind, Message, MessageId};
use crate::protocol::{HistoryRequest, OutgoingFile, SendRequest};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no conversation is open")]
    NotOpen,
    #[error("a send is already in flight")]
    SendInFlight,
    #[error("nothing to send")]
    EmptyMessage,
    #[error("cannot open a conversation with yourself")]
    SelfConversation,
    #[error("no staged attachment {0}")]
    UnknownAttachment(StagedId),
    #[error("the last send failed: resend or discard the draft first")]
    UnsentDraft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    Opening,
    Open,
    Sending,
}

/// A file the user picked, not yet uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    pub kind: AttachmentKind,
    pub bytes: Vec<u8>,
}

impl LocalFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        LocalFile {
            kind: AttachmentKind::from_file_name(&name),
            name,
            bytes,
        }
    }

    pub async fn read(path: impl AsRef<Path>) -> MessagingResult<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MessagingError::Validation(format!("invalid file path '{}'", path.display())))?;
        Ok(LocalFile::new(name, bytes))
    }
}

pub type PreviewId = u64;

/// Source of local previews (thumbnails, object URLs) for staged files.
pub trait PreviewRegistry: Send + Sync {
    fn acquire(&self, file: &LocalFile) -> PreviewId;
    fn revoke(&self, id: PreviewId);
}

/// Tracks which previews are alive.
#[derive(Default)]
pub struct PreviewTracker {
    next: AtomicU64,
    live: Mutex<HashSet<PreviewId>>,
}

impl PreviewTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl PreviewRegistry for PreviewTracker {
    fn acquire(&self, _file: &LocalFile) -> PreviewId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.live.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
        id
    }

    fn revoke(&self, id: PreviewId) {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }
}

/// Owns a preview for as long as its attachment stays staged.
pub struct PreviewHandle {
    id: PreviewId,
    registry: Arc<dyn PreviewRegistry>,
}

impl PreviewHandle {
    fn acquire(registry: &Arc<dyn PreviewRegistry>, file: &LocalFile) -> Self {
        PreviewHandle {
            id: registry.acquire(file),
            registry: Arc::clone(registry),
        }
    }

    pub fn id(&self) -> PreviewId {
        self.id
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.registry.revoke(self.id);
    }
}

pub type StagedId = u64;

pub struct StagedAttachment {
    pub id: StagedId,
    pub file: LocalFile,
    pub preview: PreviewHandle,
}

#[derive(Default)]
struct ComposeBuffer {
    text: String,
    attachments: Vec<StagedAttachment>,
    next_id: StagedId,
}

impl ComposeBuffer {
    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.attachments.is_empty()
    }

    fn clear(&mut self) {
        self.text.clear();
        self.attachments.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHistory {
    pub epoch: u64,
    pub request: HistoryRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub epoch: u64,
    pub request: SendRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    Stale,
    Failed(MessagingError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered(Message),
    Stale,
    /// Text and attachments are back in the compose buffer.
    Failed(MessagingError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    Unread(ActorRef),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    /// Closes once the in-flight send settles successfully.
    Deferred,
    /// Nothing closed: a failed draft is still waiting for a resend or discard.
    DraftPending,
}

pub struct ConversationSession {
    me: ActorRef,
    page_size: usize,
    previews: Arc<dyn PreviewRegistry>,
    epoch: u64,
    phase: Phase,
    counterpart: Option<ActorRef>,
    window: Vec<Message>,
    has_more: bool,
    older_in_flight: bool,
    scroll_to: Option<MessageId>,
    close_requested: bool,
    compose: ComposeBuffer,
    // Set when a send fails, cleared by a successful resend or discard().
    unsent: bool,
    unread: BTreeSet<ActorRef>,
    last_error: Option<MessagingError>,
}

impl ConversationSession {
    pub fn new(me: ActorRef, page_size: usize, previews: Arc<dyn PreviewRegistry>) -> Self {
        ConversationSession {
            me,
            page_size: page_size.max(1),
            previews,
            epoch: 0,
            phase: Phase::Closed,
            counterpart: None,
            window: Vec::new(),
            has_more: false,
            older_in_flight: false,
            scroll_to: None,
            close_requested: false,
            compose: ComposeBuffer::default(),
            unsent: false,
            unread: BTreeSet::new(),
            last_error: None,
        }
    }

    pub fn me(&self) -> ActorRef {
        self.me
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn counterpart(&self) -> Option<ActorRef> {
        self.counterpart
    }

    /// Loaded messages, oldest first.
    pub fn window(&self) -> &[Message] {
        &self.window
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Message the view should scroll to after the window was (re)loaded.
    pub fn scroll_to(&self) -> Option<MessageId> {
        self.scroll_to
    }

    pub fn text(&self) -> &str {
        &self.compose.text
    }

    pub fn staged(&self) -> &[StagedAttachment] {
        &self.compose.attachments
    }

    pub fn unread(&self) -> impl Iterator<Item = &ActorRef> {
        self.unread.iter()
    }

    pub fn last_error(&self) -> Option<&MessagingError> {
        self.last_error.as_ref()
    }

    pub fn open(&mut self, counterpart: ActorRef) -> Result<PendingHistory, SessionError> {
        if self.phase == Phase::Sending {
            return Err(SessionError::SendInFlight);
        }
        if counterpart == self.me {
            return Err(SessionError::SelfConversation);
        }
        if self.unsent {
            return Err(SessionError::UnsentDraft);
        }
        self.reset();
        self.epoch += 1;
        self.phase = Phase::Opening;
        self.counterpart = Some(counterpart);
        self.unread.remove(&counterpart);
        debug!("opening conversation with {counterpart} (epoch {})", self.epoch);
        Ok(self.latest_page_request(counterpart))
    }

    /// Re-issues the initial history fetch after a failure.
    pub fn retry_open(&mut self) -> Option<PendingHistory> {
        match (self.phase, self.counterpart) {
            (Phase::Opening, Some(counterpart)) => {
                self.epoch += 1;
                self.last_error = None;
                Some(self.latest_page_request(counterpart))
            }
            _ => None,
        }
    }

    pub fn history_loaded(&mut self, epoch: u64, result: MessagingResult<Vec<Message>>) -> LoadOutcome {
        if epoch != self.epoch || self.phase != Phase::Opening {
            debug!("discarding stale history (epoch {epoch}, current {})", self.epoch);
            return LoadOutcome::Stale;
        }
        match result {
            Ok(page) => {
                self.has_more = !page.is_empty();
                self.merge(page);
                self.phase = Phase::Open;
                self.scroll_to = self.window.last().map(|m| m.id);
                self.last_error = None;
                LoadOutcome::Applied
            }
            Err(e) => {
                self.last_error = Some(e.clone());
                LoadOutcome::Failed(e)
            }
        }
    }

    /// Next older page for the open window, if there may be one.
    pub fn load_older(&mut self) -> Option<PendingHistory> {
        if !matches!(self.phase, Phase::Open | Phase::Sending) || !self.has_more || self.older_in_flight {
            return None;
        }
        let oldest = self.window.first()?.id;
        let counterpart = self.counterpart?;
        self.older_in_flight = true;
        Some(PendingHistory {
            epoch: self.epoch,
            request: HistoryRequest {
                counterpart,
                before: Some(oldest),
                limit: self.page_size,
            },
        })
    }

    pub fn older_loaded(&mut self, epoch: u64, result: MessagingResult<Vec<Message>>) -> LoadOutcome {
        if epoch != self.epoch || !self.older_in_flight {
            return LoadOutcome::Stale;
        }
        self.older_in_flight = false;
        match result {
            Ok(page) => {
                if page.is_empty() {
                    self.has_more = false;
                }
                self.merge(page);
                LoadOutcome::Applied
            }
            Err(e) => {
                self.last_error = Some(e.clone());
                LoadOutcome::Failed(e)
            }
        }
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> Result<(), SessionError> {
        self.ensure_not_sending()?;
        self.compose.text = text.into();
        Ok(())
    }

    pub fn stage_attachment(&mut self, file: LocalFile) -> Result<StagedId, SessionError> {
        self.ensure_not_sending()?;
        let id = self.compose.next_id;
        self.compose.next_id += 1;
        let preview = PreviewHandle::acquire(&self.previews, &file);
        self.compose.attachments.push(StagedAttachment { id, file, preview });
        Ok(id)
    }

    pub fn replace_attachment(&mut self, id: StagedId, file: LocalFile) -> Result<(), SessionError> {
        self.ensure_not_sending()?;
        let previews = Arc::clone(&self.previews);
        let staged = self
            .compose
            .attachments
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(SessionError::UnknownAttachment(id))?;
        staged.preview = PreviewHandle::acquire(&previews, &file);
        staged.file = file;
        Ok(())
    }

    pub fn remove_attachment(&mut self, id: StagedId) -> Result<(), SessionError> {
        self.ensure_not_sending()?;
        let before = self.compose.attachments.len();
        self.compose.attachments.retain(|a| a.id != id);
        if self.compose.attachments.len() == before {
            return Err(SessionError::UnknownAttachment(id));
        }
        Ok(())
    }

    /// Drops the draft text and every staged attachment.
    pub fn discard(&mut self) -> Result<(), SessionError> {
        self.ensure_not_sending()?;
        self.compose.clear();
        self.unsent = false;
        Ok(())
    }

    pub fn begin_send(&mut self) -> Result<PendingSend, SessionError> {
        match self.phase {
            Phase::Sending => return Err(SessionError::SendInFlight),
            Phase::Closed | Phase::Opening => return Err(SessionError::NotOpen),
            Phase::Open => {}
        }
        if self.compose.is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let receiver = self.counterpart.ok_or(SessionError::NotOpen)?;
        let request = SendRequest {
            receiver,
            content: self.compose.text.clone(),
            files: self
                .compose
                .attachments
                .iter()
                .map(|a| OutgoingFile {
                    kind: a.file.kind,
                    original_name: a.file.name.clone(),
                    data: a.file.bytes.clone(),
                })
                .collect(),
        };
        self.phase = Phase::Sending;
        self.last_error = None;
        Ok(PendingSend {
            epoch: self.epoch,
            request,
        })
    }

    pub fn send_finished(&mut self, epoch: u64, result: MessagingResult<Message>) -> SendOutcome {
        if epoch != self.epoch || self.phase != Phase::Sending {
            return SendOutcome::Stale;
        }
        self.phase = Phase::Open;
        match result {
            Ok(message) => {
                self.compose.clear();
                self.unsent = false;
                self.merge(vec![message.clone()]);
                self.scroll_to = Some(message.id);
                if self.close_requested {
                    self.close();
                }
                SendOutcome::Delivered(message)
            }
            Err(e) => {
                // The user has to see this failure, so a pending close is dropped.
                self.close_requested = false;
                self.unsent = true;
                self.last_error = Some(e.clone());
                SendOutcome::Failed(e)
            }
        }
    }

    pub fn receive_push(&mut self, message: Message) -> PushOutcome {
        let Some(counterpart) = message.counterpart_of(&self.me) else {
            return PushOutcome::Ignored;
        };
        let showing = self.counterpart == Some(counterpart)
            && matches!(self.phase, Phase::Opening | Phase::Open | Phase::Sending);
        if showing {
            self.merge(vec![message]);
            PushOutcome::Appended
        } else {
            self.unread.insert(counterpart);
            PushOutcome::Unread(counterpart)
        }
    }

    pub fn close(&mut self) -> CloseOutcome {
        if self.phase == Phase::Sending {
            self.close_requested = true;
            return CloseOutcome::Deferred;
        }
        if self.unsent {
            return CloseOutcome::DraftPending;
        }
        if self.phase != Phase::Closed {
            debug!("closing conversation (epoch {})", self.epoch);
            self.epoch += 1;
        }
        self.reset();
        CloseOutcome::Closed
    }

    fn reset(&mut self) {
        self.phase = Phase::Closed;
        self.counterpart = None;
        self.window.clear();
        self.has_more = false;
        self.older_in_flight = false;
        self.scroll_to = None;
        self.close_requested = false;
        self.compose.clear();
        self.last_error = None;
    }

    fn latest_page_request(&self, counterpart: ActorRef) -> PendingHistory {
        PendingHistory {
            epoch: self.epoch,
            request: HistoryRequest {
                counterpart,
                before: None,
                limit: self.page_size,
            },
        }
    }

    fn merge(&mut self, messages: Vec<Message>) {
        self.window.extend(messages);
        self.window.sort_by_key(Message::order_key);
        self.window.dedup_by_key(|m| m.id);
    }

    fn ensure_not_sending(&self) -> Result<(), SessionError> {
        if self.phase == Phase::Sending {
            Err(SessionError::SendInFlight)
        } else {
            Ok(())
        }
    }
}
