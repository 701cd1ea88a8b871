//! `threadsync`: headless conversation sync client.
//!
//! Reads commands from stdin and prints the timeline and connection state
//! to stdout. Configuration via CLI flags, environment variables, or config
//! file (`~/.config/threadsync/config.toml`).
//!
//! ```bash
//! # In-process demo server
//! cargo run --bin threadsync -- --demo
//!
//! # Real backend
//! cargo run --bin threadsync -- --api-url https://api.example.com/v1 \
//!     --channel-url wss://push.example.com/ws --token ... --user-id 7 --conversation 42
//! ```
//!
//! Input lines are sent as messages, except for `/open <id>`, `/close`,
//! `/read`, `/retry`, `/discard`, `/refresh` and `/quit`.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use threadsync::api::http::HttpChatApi;
use threadsync::api::memory::InMemoryChatApi;
use threadsync::channel::loopback::LoopbackHub;
use threadsync::channel::ws::WsChannelTransport;
use threadsync::config::{CliArgs, ClientConfig};
use threadsync::coordinator::{SyncCoordinator, SyncHandle, SyncStatus};
use threadsync_proto::api::WireMessage;
use threadsync_proto::conversation::{Conversation, ConversationId, ListingId, UserId};
use threadsync_proto::message::{DeliveryState, Message, MessageId, Timestamp};

/// Conversation the demo opens when none is given.
const DEMO_CONVERSATION: ConversationId = ConversationId::new(42);

/// The other participant in demo mode.
const DEMO_PEER: UserId = UserId::new(2);

/// Listing the demo conversation is about.
const DEMO_LISTING: ListingId = ListingId::new(7);

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(demo = cli.demo, "threadsync starting");

    let result = if cli.demo {
        run_demo(&config).await
    } else {
        run_remote(&config).await
    };

    tracing::info!("threadsync exiting");
    result
}

/// Initialize file-based logging.
///
/// Stdout carries the timeline, so logs go to a file. The returned
/// [`WorkerGuard`] must be held until shutdown to flush buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("threadsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Connects to a real backend.
async fn run_remote(config: &ClientConfig) -> io::Result<()> {
    let (api_url, channel_url) = config
        .endpoints()
        .map_err(|e| io::Error::other(format!("{e} (use --demo to run without a backend)")))?;

    let api = HttpChatApi::new(api_url, config.token.clone()).map_err(io::Error::other)?;
    let transport = WsChannelTransport::new(channel_url, config.token.clone())
        .with_timeouts(config.connect_timeout, config.subscribe_timeout);

    let handle = SyncCoordinator::spawn(Arc::new(api), Arc::new(transport), config.sync_config());
    run_session(&handle, config.conversation).await
}

/// Runs against the in-process fake server with a scripted peer.
async fn run_demo(config: &ClientConfig) -> io::Result<()> {
    let conversation = config.conversation.unwrap_or(DEMO_CONVERSATION);
    let me = config.user_id;
    let hub = LoopbackHub::new();
    let api = Arc::new(InMemoryChatApi::new(hub.clone(), me));
    api.seed(
        conversation,
        [("hi", 0u64), ("is this still available?", 1)]
            .into_iter()
            .map(|(content, offset)| WireMessage {
                id: MessageId::new(0),
                conversation_id: conversation,
                sender_id: DEMO_PEER,
                content: content.to_string(),
                created_at: Timestamp::now().saturating_sub_millis(60_000 - offset * 5_000),
                read: false,
                client_ref: None,
            }),
    );

    let thread = Conversation {
        id: conversation,
        participants: vec![DEMO_PEER, me],
        listing_id: DEMO_LISTING,
        last_activity: Timestamp::now(),
    };

    let handle = SyncCoordinator::spawn(Arc::clone(&api), Arc::new(hub), config.sync_config());
    tokio::spawn(demo_peer(handle.clone(), Arc::clone(&api), conversation, me));
    if let Some(peer) = thread.counterpart(me) {
        println!(
            "demo mode: you are user {me}, chatting with user {peer} about listing {}",
            thread.listing_id
        );
    }
    if let Err(e) = handle.open(&thread).await {
        println!("could not open conversation {conversation}: {e}");
    }
    run_session(&handle, None).await
}

/// Answers every confirmed message from `me` and reads it.
async fn demo_peer(
    handle: SyncHandle,
    api: Arc<InMemoryChatApi>,
    conversation: ConversationId,
    me: UserId,
) {
    let mut messages = handle.messages();
    let mut answered = std::collections::HashSet::new();
    while messages.changed().await.is_ok() {
        let fresh: Vec<(MessageId, String)> = messages
            .borrow_and_update()
            .iter()
            .filter_map(|m| match m {
                Message::Confirmed(c) if c.body.sender_id == me && !answered.contains(&c.id) => {
                    Some((c.id, c.body.content.clone()))
                }
                _ => None,
            })
            .collect();
        for (id, content) in fresh {
            answered.insert(id);
            tokio::time::sleep(Duration::from_millis(800)).await;
            api.publish_read(conversation, DEMO_PEER, id);
            api.post(
                conversation,
                DEMO_PEER,
                &format!("you said: {content}"),
                Timestamp::now(),
            );
        }
    }
}

/// Drives the coordinator from stdin until `/quit` or EOF.
async fn run_session(handle: &SyncHandle, conversation: Option<ConversationId>) -> io::Result<()> {
    let printer = tokio::spawn(print_updates(handle.clone()));
    if let Some(conversation) = conversation {
        open(handle, conversation).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        let result = match command {
            "/quit" => break,
            "/open" => match arg.trim().parse::<u64>() {
                Ok(id) => {
                    open(handle, ConversationId::new(id)).await;
                    Ok(())
                }
                Err(_) => {
                    println!("usage: /open <conversation id>");
                    Ok(())
                }
            },
            "/close" => handle.close_conversation().await,
            "/refresh" => handle.refresh().await,
            "/read" => {
                let ids: Vec<MessageId> = handle
                    .snapshot()
                    .iter()
                    .filter_map(Message::confirmed_id)
                    .collect();
                handle.mark_read(ids).await
            }
            "/retry" | "/discard" => {
                let failed: Vec<_> = handle
                    .snapshot()
                    .iter()
                    .filter_map(|m| match m {
                        Message::Pending(p) if p.failure.is_some() => Some(p.provisional_id),
                        _ => None,
                    })
                    .collect();
                for provisional_id in failed {
                    if command == "/retry" {
                        match handle.retry(provisional_id).await {
                            Ok(ticket) => watch_ticket(ticket),
                            Err(e) => println!("retry failed: {e}"),
                        }
                    } else if let Err(e) = handle.discard(provisional_id).await {
                        println!("discard failed: {e}");
                    }
                }
                Ok(())
            }
            _ => match handle.send(line).await {
                Ok(ticket) => {
                    watch_ticket(ticket);
                    Ok(())
                }
                Err(e) => {
                    println!("not sent: {e}");
                    Ok(())
                }
            },
        };
        if let Err(e) = result {
            println!("error: {e}");
            break;
        }
    }

    handle.shutdown().await;
    printer.abort();
    Ok(())
}

async fn open(handle: &SyncHandle, conversation: ConversationId) {
    if let Err(e) = handle.open_conversation(conversation).await {
        println!("could not open conversation {conversation}: {e}");
    }
}

fn watch_ticket(ticket: threadsync::send::SendTicket) {
    tokio::spawn(async move {
        let provisional_id = ticket.provisional_id();
        if let Err(e) = ticket.outcome().await {
            println!("message {provisional_id} failed: {e} (/retry or /discard)");
        }
    });
}

/// Prints the timeline, connection state and status whenever they change.
async fn print_updates(handle: SyncHandle) {
    let mut messages = handle.messages();
    let mut connection = handle.connection_state();
    let mut status = handle.status();
    loop {
        tokio::select! {
            changed = messages.changed() => {
                if changed.is_err() {
                    return;
                }
                let snapshot = Arc::clone(&messages.borrow_and_update());
                println!("--- timeline ({} messages)", snapshot.len());
                for message in snapshot.iter() {
                    println!("{}", render(message));
                }
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = *connection.borrow_and_update();
                println!("*** connection: {state}");
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = status.borrow_and_update().clone();
                println!("*** {}", render_status(&current));
            }
        }
    }
}

fn render(message: &Message) -> String {
    let marker = match message.delivery_state() {
        DeliveryState::Pending => "..",
        DeliveryState::Failed => "!!",
        DeliveryState::Sent if message.is_read() => "vv",
        DeliveryState::Sent => " v",
    };
    let id = message
        .confirmed_id()
        .map_or_else(|| "-".to_string(), |id| id.to_string());
    let body = message.body();
    format!("{marker} #{id:<6} user {}: {}", body.sender_id, body.content)
}

fn render_status(status: &SyncStatus) -> String {
    let conversation = status
        .conversation
        .map_or_else(|| "none".to_string(), |c| c.to_string());
    match &status.fetch_error {
        Some(e) => format!("conversation {conversation}: {} ({e}, /refresh to retry)", status.phase),
        None => format!("conversation {conversation}: {}", status.phase),
    }
}
