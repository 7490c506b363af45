use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, Utc};
use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use direct_messaging::api::MessagingApi;
use direct_messaging::client::RemoteClient;
use direct_messaging::config::Config;
use direct_messaging::error::MessagingResult;
use direct_messaging::models::{ActorRef, Conversation, Message, Profile};
use direct_messaging::retry::{with_backoff, RetryPolicy};
use direct_messaging::session::{
    CloseOutcome, ConversationSession, LoadOutcome, LocalFile, PendingHistory, PendingSend, PreviewTracker, PushOutcome,
    SendOutcome,
};

const HELP: &str = "\
/open <kind:uuid>   open a conversation
/close              close it
/older              load older messages
/attach <path>      stage a file
/unattach <id>      drop a staged file
/discard            clear the draft
/list               list conversations
/retry              retry loading a conversation
/quit               exit
anything else is sent to the open conversation";

enum AppEvent {
    Input(String),
    HistoryLoaded { epoch: u64, older: bool, result: MessagingResult<Vec<Message>> },
    SendFinished { epoch: u64, result: MessagingResult<Message> },
    Conversations(MessagingResult<Vec<Conversation>>),
    Pushed(Message),
    InputClosed,
}

struct ChatApp {
    api: Arc<RemoteClient>,
    retry: RetryPolicy,
    session: ConversationSession,
    events: mpsc::Sender<AppEvent>,
}

impl ChatApp {
    /// Handles one event; returns false when the app should exit.
    async fn update(&mut self, event: AppEvent) -> bool {
        match event {
            AppEvent::Input(line) => return self.command(line.trim()).await,
            AppEvent::InputClosed => return false,
            AppEvent::HistoryLoaded { epoch, older, result } => {
                let outcome = if older {
                    self.session.older_loaded(epoch, result)
                } else {
                    self.session.history_loaded(epoch, result)
                };
                match outcome {
                    LoadOutcome::Applied => self.render_window(),
                    LoadOutcome::Stale => debug!("dropped stale history for epoch {epoch}"),
                    LoadOutcome::Failed(e) => println!("Could not load history: {e} (type /retry)"),
                }
            }
            AppEvent::SendFinished { epoch, result } => match self.session.send_finished(epoch, result) {
                SendOutcome::Delivered(message) => print_message(&self.session.me(), &message),
                SendOutcome::Stale => {}
                SendOutcome::Failed(e) => println!("Send failed: {e}. Your draft is kept; press enter on an empty line to resend."),
            },
            AppEvent::Conversations(result) => match result {
                Ok(list) if list.is_empty() => println!("No conversations yet"),
                Ok(list) => {
                    for conversation in list {
                        println!(
                            "{}  {}  {}",
                            conversation.other_participant,
                            format_timestamp(conversation.last_message.created_at),
                            preview(&conversation.last_message)
                        );
                    }
                }
                Err(e) => println!("Could not list conversations: {e}"),
            },
            AppEvent::Pushed(message) => match self.session.receive_push(message.clone()) {
                PushOutcome::Appended => print_message(&self.session.me(), &message),
                PushOutcome::Unread(from) => println!("* new message from {from}"),
                PushOutcome::Ignored => {}
            },
        }
        true
    }

    async fn command(&mut self, input: &str) -> bool {
        let (cmd, arg) = input.split_once(' ').map_or((input, ""), |(c, a)| (c, a.trim()));
        match cmd {
            "/quit" | "exit" => return false,
            "/help" => println!("{HELP}"),
            "/open" => match arg.parse::<ActorRef>() {
                Ok(counterpart) => match self.session.open(counterpart) {
                    Ok(pending) => self.fetch(pending, false),
                    Err(e) => println!("{e}"),
                },
                Err(e) => println!("{e}"),
            },
            "/close" => match self.session.close() {
                CloseOutcome::Closed => {}
                CloseOutcome::Deferred => println!("Closing once the current send goes through"),
                CloseOutcome::DraftPending => println!("The last send failed: resend it or /discard first"),
            },
            "/older" => match self.session.load_older() {
                Some(pending) => self.fetch(pending, true),
                None => println!("Nothing older to load"),
            },
            "/retry" => match self.session.retry_open() {
                Some(pending) => self.fetch(pending, false),
                None => println!("Nothing to retry"),
            },
            "/attach" => match LocalFile::read(arg).await {
                Ok(file) => match self.session.stage_attachment(file) {
                    Ok(id) => println!("staged #{id}: {arg}"),
                    Err(e) => println!("{e}"),
                },
                Err(e) => println!("Failed to read file: {e}"),
            },
            "/unattach" => match arg.parse() {
                Ok(id) => {
                    if let Err(e) = self.session.remove_attachment(id) {
                        println!("{e}");
                    }
                }
                Err(_) => println!("usage: /unattach <id>"),
            },
            "/discard" => {
                if let Err(e) = self.session.discard() {
                    println!("{e}");
                }
            }
            "/list" => self.list(),
            _ => {
                // An empty line resends whatever is still staged.
                if !input.is_empty() {
                    if let Err(e) = self.session.set_text(input) {
                        println!("{e}");
                        return true;
                    }
                }
                match self.session.begin_send() {
                    Ok(pending) => self.send(pending),
                    Err(e) => println!("{e}"),
                }
            }
        }
        true
    }

    fn fetch(&self, pending: PendingHistory, older: bool) {
        let api = Arc::clone(&self.api);
        let retry = self.retry.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = with_backoff(&retry, || api.history(pending.request)).await;
            let _ = events
                .send(AppEvent::HistoryLoaded {
                    epoch: pending.epoch,
                    older,
                    result,
                })
                .await;
        });
    }

    fn send(&self, pending: PendingSend) {
        let api = Arc::clone(&self.api);
        let retry = self.retry.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = with_backoff(&retry, || api.send(pending.request.clone())).await;
            let _ = events
                .send(AppEvent::SendFinished {
                    epoch: pending.epoch,
                    result,
                })
                .await;
        });
    }

    fn list(&self) {
        let api = Arc::clone(&self.api);
        let retry = self.retry.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = with_backoff(&retry, || api.conversations()).await;
            let _ = events.send(AppEvent::Conversations(result)).await;
        });
    }

    fn render_window(&self) {
        if let Some(counterpart) = self.session.counterpart() {
            println!("--- {counterpart} ---");
        }
        for message in self.session.window() {
            print_message(&self.session.me(), message);
        }
    }
}

fn print_message(me: &ActorRef, message: &Message) {
    let who = if message.sender == *me {
        "you".to_string()
    } else {
        message.sender.to_string()
    };
    println!("[{}] {}: {}", format_timestamp(message.created_at), who, preview(message));
}

fn preview(message: &Message) -> String {
    let mut text = message.content.clone();
    for attachment in &message.attachments {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(&format!("[{} {}]", attachment.kind.as_str(), attachment.original_name));
    }
    text
}

fn format_timestamp(datetime: DateTime<Utc>) -> String {
    let local_datetime: DateTime<Local> = datetime.with_timezone(&Local);
    let today = Local::now().date_naive();
    let message_date = local_datetime.date_naive();

    if message_date == today {
        local_datetime.format("%I:%M %p").to_string()
    } else if (today - message_date).num_days() == 1 {
        format!("Yesterday, {}", local_datetime.format("%I:%M %p"))
    } else {
        local_datetime.format("%b %d, %I:%M %p").to_string()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let actor: ActorRef = args
        .next()
        .ok_or_else(|| anyhow!("usage: client <user|company>:<uuid> [display name to register]"))?
        .parse()?;
    let display_name: Vec<String> = args.collect();

    let (api, mut pushes) = if display_name.is_empty() {
        RemoteClient::connect(&config.server_addr, actor).await?
    } else {
        let profile = Profile {
            actor,
            display_name: display_name.join(" "),
            avatar_url: None,
        };
        RemoteClient::register(&config.server_addr, profile).await?
    };
    let me = api.profile(actor).await?;
    println!("Signed in as {} ({}). /help for commands.", me.display_name, actor);

    let (events, mut inbox) = mpsc::channel::<AppEvent>(100);

    let stdin_events = events.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stdin_events.send(AppEvent::Input(line)).await.is_err() {
                return;
            }
        }
        let _ = stdin_events.send(AppEvent::InputClosed).await;
    });

    let push_events = events.clone();
    tokio::spawn(async move {
        while let Some(message) = pushes.recv().await {
            if push_events.send(AppEvent::Pushed(message)).await.is_err() {
                return;
            }
        }
    });

    let mut app = ChatApp {
        api: Arc::new(api),
        retry: config.retry.clone(),
        session: ConversationSession::new(actor, config.history_page_size, Arc::new(PreviewTracker::new())),
        events,
    };

    while let Some(event) = inbox.recv().await {
        if !app.update(event).await {
            break;
        }
    }
    println!("Exiting client...");
    Ok(())
}
