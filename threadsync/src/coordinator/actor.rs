//! The coordinator actor and per-conversation session state.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use threadsync_proto::api::{HistoryPage, HistoryQuery};
use threadsync_proto::channel::ChannelEvent;
use threadsync_proto::conversation::ConversationId;
use threadsync_proto::message::{Message, MessageId};

use super::{Command, FetchError, SyncConfig, SyncError, SyncPhase, SyncStatus};
use crate::api::ChatApi;
use crate::channel::{ChannelConnection, ChannelSignal, ChannelTransport, ConnectionState};
use crate::receipts::{ReadBoundary, ReadReceiptTracker};
use crate::reconcile::{MergeReport, ReconciliationEngine, Source};
use crate::send::{OptimisticSender, SendCompletion, SendFuture, SendTicket};
use crate::store::MessageStore;

/// Buffer for results reported by spawned I/O tasks.
const INTERNAL_BUFFER: usize = 256;

/// Watch senders the actor publishes to.
pub(super) struct Outputs {
    pub(super) messages: watch::Sender<Arc<[Message]>>,
    pub(super) connection: watch::Sender<ConnectionState>,
    pub(super) status: watch::Sender<SyncStatus>,
}

/// Why a history fetch runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchKind {
    /// Full history on open.
    Initial,
    /// Messages posted between the initial fetch and the first connect.
    CatchUp,
    /// Messages missed while the channel was down.
    GapFill { after: Option<MessageId> },
    /// User-requested re-fetch.
    Refresh,
}

impl std::fmt::Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::CatchUp => write!(f, "catch-up"),
            Self::GapFill { .. } => write!(f, "gap-fill"),
            Self::Refresh => write!(f, "refresh"),
        }
    }
}

/// Results reported back by spawned tasks. Each carries the generation of
/// the session that started it; results from older sessions are dropped.
enum Internal {
    HistoryPage {
        generation: u64,
        page: HistoryPage,
    },
    HistoryDone {
        generation: u64,
        kind: FetchKind,
        after: Option<MessageId>,
        result: Result<(), String>,
    },
    SendDone {
        generation: u64,
        completion: SendCompletion,
    },
    ReceiptDone {
        generation: u64,
        conversation: ConversationId,
        boundary: ReadBoundary,
        result: Result<(), String>,
    },
}

/// Everything that exists only while one conversation is open.
struct Session<A> {
    conversation: ConversationId,
    generation: u64,
    store: MessageStore,
    engine: ReconciliationEngine,
    sender: OptimisticSender<A>,
    channel: Option<ChannelConnection>,
    signals: Option<mpsc::Receiver<ChannelSignal>>,
    tasks: JoinSet<()>,
    phase: SyncPhase,
    connection: ConnectionState,
    connected_once: bool,
    history_resolved: bool,
    history_loaded: bool,
    /// Highest id merged from history pages.
    history_high_water: Option<MessageId>,
    /// Highest id merged from history pages or the channel. Send responses
    /// are excluded: they can be ahead of messages still in flight.
    stream_high_water: Option<MessageId>,
    /// Anchor of a gap that still needs fetching, if any.
    gap: Option<Option<MessageId>>,
    fetch_in_flight: bool,
    queued_fetches: VecDeque<FetchKind>,
    fetch_error: Option<FetchError>,
}

impl<A> Session<A> {
    fn note_merged(&mut self, source: Source, report_ids: impl Iterator<Item = MessageId>) {
        for id in report_ids {
            if source == Source::History {
                self.history_high_water = self.history_high_water.max(Some(id));
            }
            self.stream_high_water = self.stream_high_water.max(Some(id));
        }
    }

    /// Records the lowest pending gap anchor.
    fn remember_gap(&mut self, after: Option<MessageId>) {
        self.gap = Some(match self.gap {
            Some(existing) => existing.min(after),
            None => after,
        });
    }

    fn status(&self) -> SyncStatus {
        SyncStatus {
            conversation: Some(self.conversation),
            phase: self.phase,
            fetch_error: self.fetch_error.clone(),
        }
    }
}

enum Step {
    Command(Option<Command>),
    Internal(Internal),
    Signal(Option<ChannelSignal>),
    FlushReceipts,
}

pub(super) struct Actor<A, T> {
    api: Arc<A>,
    transport: Arc<T>,
    config: SyncConfig,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    outputs: Outputs,
    session: Option<Session<A>>,
    trackers: HashMap<ConversationId, ReadReceiptTracker>,
    generation: u64,
    published: Option<(u64, u64)>,
}

impl<A: ChatApi, T: ChannelTransport> Actor<A, T> {
    pub(super) fn new(
        api: Arc<A>,
        transport: Arc<T>,
        config: SyncConfig,
        commands: mpsc::Receiver<Command>,
        outputs: Outputs,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_BUFFER);
        Self {
            api,
            transport,
            config,
            commands,
            internal_tx,
            internal_rx,
            outputs,
            session: None,
            trackers: HashMap::new(),
            generation: 0,
            published: None,
        }
    }

    pub(super) async fn run(mut self) {
        tracing::debug!(user = %self.config.local_user, "sync coordinator started");
        loop {
            let deadline = self.receipt_deadline();
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                Some(internal) = self.internal_rx.recv() => Step::Internal(internal),
                signal = next_signal(&mut self.session) => Step::Signal(signal),
                () = sleep_until(deadline) => Step::FlushReceipts,
            };

            match step {
                Step::Command(None | Some(Command::Shutdown)) => break,
                Step::Command(Some(command)) => self.handle_command(command),
                Step::Internal(internal) => self.handle_internal(internal),
                Step::Signal(Some(signal)) => self.handle_signal(signal),
                Step::Signal(None) => {
                    if let Some(session) = self.session.as_mut() {
                        tracing::debug!(
                            conversation = %session.conversation,
                            "channel connection stopped"
                        );
                        session.signals = None;
                    }
                }
                Step::FlushReceipts => self.flush_receipts(),
            }

            if let Some(session) = self.session.as_mut() {
                while session.tasks.try_join_next().is_some() {}
            }
            self.publish();
        }

        self.close_session();
        self.publish();
        tracing::debug!("sync coordinator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                conversation,
                reply,
            } => {
                self.open_session(conversation);
                let _ = reply.send(Ok(()));
            }
            Command::Close { reply } => {
                self.close_session();
                let _ = reply.send(Ok(()));
            }
            Command::Send { content, reply } => {
                let _ = reply.send(self.start_send(&content));
            }
            Command::Retry {
                provisional_id,
                reply,
            } => {
                let result = match self.session.as_mut() {
                    None => Err(SyncError::NotOpen),
                    Some(session) => session
                        .sender
                        .retry(&mut session.store, provisional_id)
                        .ok_or(SyncError::UnknownMessage(provisional_id)),
                };
                let _ = reply.send(result.map(|(ticket, future)| self.spawn_send(ticket, future)));
            }
            Command::Discard {
                provisional_id,
                reply,
            } => {
                let result = match self.session.as_mut() {
                    None => Err(SyncError::NotOpen),
                    Some(session) => {
                        if session.sender.discard(&mut session.store, provisional_id) {
                            Ok(())
                        } else {
                            Err(SyncError::UnknownMessage(provisional_id))
                        }
                    }
                };
                let _ = reply.send(result);
            }
            Command::MarkRead { ids } => self.mark_read(&ids),
            Command::Refresh => {
                if self.session.is_some() {
                    self.request_fetch(FetchKind::Refresh);
                }
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    fn open_session(&mut self, conversation: ConversationId) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.conversation == conversation)
        {
            tracing::debug!(conversation = %conversation, "conversation already open");
            return;
        }
        self.close_session();

        self.generation += 1;
        let generation = self.generation;
        let local_user = self.config.local_user;
        let echo_window_ms = u64::try_from(self.config.echo_window.as_millis()).unwrap_or(u64::MAX);
        let (channel, signals) = ChannelConnection::subscribe(
            conversation,
            Arc::clone(&self.transport),
            self.config.backoff,
            self.config.channel_capacity,
        );

        self.session = Some(Session {
            conversation,
            generation,
            store: MessageStore::new(conversation).with_echo_window(echo_window_ms),
            engine: ReconciliationEngine::new(conversation, local_user),
            sender: OptimisticSender::new(
                Arc::clone(&self.api),
                conversation,
                local_user,
                self.config.send_timeout,
            ),
            channel: Some(channel),
            signals: Some(signals),
            tasks: JoinSet::new(),
            phase: SyncPhase::Loading,
            connection: ConnectionState::Idle,
            connected_once: false,
            history_resolved: false,
            history_loaded: false,
            history_high_water: None,
            stream_high_water: None,
            gap: None,
            fetch_in_flight: false,
            queued_fetches: VecDeque::new(),
            fetch_error: None,
        });
        tracing::info!(conversation = %conversation, generation, "conversation opened");

        self.request_fetch(FetchKind::Initial);

        let debounce = self.config.receipt_debounce;
        let tracker = self
            .trackers
            .entry(conversation)
            .or_insert_with(|| ReadReceiptTracker::new(conversation, debounce));
        if tracker.has_unflushed() {
            tracing::debug!(conversation = %conversation, "retrying unflushed read boundary");
            tracker.schedule_flush();
        }
    }

    fn close_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.tasks.abort_all();
        session.sender.cancel_all();
        if let Some(channel) = session.channel.take() {
            channel.unsubscribe();
        }
        if let Some(tracker) = self.trackers.get_mut(&session.conversation) {
            tracker.cancel_in_flight();
        }
        tracing::info!(
            conversation = %session.conversation,
            generation = session.generation,
            "conversation closed"
        );
    }

    fn start_send(&mut self, content: &str) -> Result<SendTicket, SyncError> {
        let session = self.session.as_mut().ok_or(SyncError::NotOpen)?;
        let (ticket, future) = session.sender.begin(&mut session.store, content)?;
        Ok(self.spawn_send(ticket, future))
    }

    fn spawn_send(&mut self, ticket: SendTicket, future: SendFuture) -> SendTicket {
        if let Some(session) = self.session.as_mut() {
            let tx = self.internal_tx.clone();
            let generation = session.generation;
            session.tasks.spawn(async move {
                let completion = future.await;
                let _ = tx.send(Internal::SendDone {
                    generation,
                    completion,
                })
                .await;
            });
        }
        ticket
    }

    fn mark_read(&mut self, ids: &[MessageId]) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(tracker) = self.trackers.get_mut(&session.conversation) else {
            return;
        };
        let visible: Vec<_> = ids.iter().filter_map(|id| session.store.get(*id)).collect();
        if !tracker.mark_visible(visible) {
            return;
        }
        if let Some(boundary) = tracker.boundary() {
            let me = self.config.local_user;
            session
                .store
                .mark_read_through(boundary.position(), |body| body.sender_id != me);
        }
    }

    fn receipt_deadline(&self) -> Option<Instant> {
        let session = self.session.as_ref()?;
        self.trackers.get(&session.conversation)?.flush_deadline()
    }

    fn flush_receipts(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let conversation = session.conversation;
        let Some(boundary) = self
            .trackers
            .get_mut(&conversation)
            .and_then(ReadReceiptTracker::take_flush)
        else {
            return;
        };

        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        let generation = session.generation;
        session.tasks.spawn(async move {
            let result = api
                .put_read_boundary(conversation, boundary.message_id)
                .await
                .map_err(|e| e.to_string());
            let _ = tx
                .send(Internal::ReceiptDone {
                    generation,
                    conversation,
                    boundary,
                    result,
                })
                .await;
        });
    }

    fn request_fetch(&mut self, kind: FetchKind) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.fetch_in_flight {
            if !session.queued_fetches.contains(&kind) {
                tracing::debug!(conversation = %session.conversation, %kind, "fetch queued");
                session.queued_fetches.push_back(kind);
            }
            return;
        }
        self.start_fetch(kind);
    }

    fn start_fetch(&mut self, kind: FetchKind) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let after = if session.history_loaded {
            match kind {
                FetchKind::Initial => None,
                FetchKind::CatchUp => session.history_high_water,
                FetchKind::GapFill { after } => after,
                FetchKind::Refresh => session.gap.unwrap_or(session.stream_high_water),
            }
        } else {
            None
        };
        let max_pages = if after.is_some() {
            self.config.gap_fill_max_pages
        } else {
            self.config.history_max_pages
        };

        session.fetch_in_flight = true;
        tracing::debug!(
            conversation = %session.conversation,
            %kind,
            after = ?after,
            "history fetch started"
        );
        session.tasks.spawn(run_fetch(
            Arc::clone(&self.api),
            session.conversation,
            session.generation,
            kind,
            after,
            max_pages.max(1),
            self.internal_tx.clone(),
        ));
    }

    fn handle_internal(&mut self, internal: Internal) {
        let current = self.session.as_ref().map(|s| s.generation);
        let generation = match &internal {
            Internal::HistoryPage { generation, .. }
            | Internal::HistoryDone { generation, .. }
            | Internal::SendDone { generation, .. }
            | Internal::ReceiptDone { generation, .. } => *generation,
        };
        if current != Some(generation) {
            tracing::trace!(generation, "dropping result from closed conversation");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match internal {
            Internal::HistoryPage { page, .. } => {
                let ids: Vec<_> = page.items.iter().map(|m| m.id).collect();
                let report = session
                    .engine
                    .merge(&mut session.store, Source::History, page.items);
                session.note_merged(Source::History, ids.into_iter());
                session.sender.reconciled(&report.reconciled);
            }
            Internal::HistoryDone {
                kind,
                after,
                result,
                ..
            } => {
                session.fetch_in_flight = false;
                if kind == FetchKind::Initial {
                    session.history_resolved = true;
                }
                match result {
                    Ok(()) => {
                        if after.is_none() {
                            session.history_loaded = true;
                        }
                        if session.connection == ConnectionState::Connected
                            && session.gap.is_some_and(|gap| gap >= after)
                        {
                            session.gap = None;
                        }
                        session.fetch_error = None;
                        tracing::debug!(
                            conversation = %session.conversation,
                            %kind,
                            "history fetch finished"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            conversation = %session.conversation,
                            %kind,
                            error = %e,
                            "history fetch failed"
                        );
                        if kind != FetchKind::Initial {
                            session.remember_gap(after);
                        }
                        session.fetch_error = Some(FetchError(e));
                    }
                }
                self.update_phase();
                if let Some(next) = self
                    .session
                    .as_mut()
                    .and_then(|s| s.queued_fetches.pop_front())
                {
                    self.start_fetch(next);
                }
            }
            Internal::SendDone { completion, .. } => {
                session.sender.complete(&mut session.store, completion);
            }
            Internal::ReceiptDone {
                conversation,
                boundary,
                result,
                ..
            } => {
                if let Some(tracker) = self.trackers.get_mut(&conversation) {
                    match result {
                        Ok(()) => tracker.flush_succeeded(boundary),
                        Err(e) => tracker.flush_failed(boundary, &e),
                    }
                }
            }
        }
    }

    fn handle_signal(&mut self, signal: ChannelSignal) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match signal {
            ChannelSignal::Event(event) => {
                let created = match &event {
                    ChannelEvent::MessageCreated { message } => Some(message.id),
                    _ => None,
                };
                let report: MergeReport = session.engine.apply_event(&mut session.store, event);
                if report.foreign == 0 {
                    session.note_merged(Source::Channel, created.into_iter());
                }
                session.sender.reconciled(&report.reconciled);
            }
            ChannelSignal::State(state) => {
                let previous = session.connection;
                session.connection = state;
                tracing::debug!(
                    conversation = %session.conversation,
                    from = %previous,
                    to = %state,
                    "connection state"
                );
                match state {
                    ConnectionState::Connected if session.connected_once => {
                        let after = session.gap.take().unwrap_or(session.stream_high_water);
                        tracing::info!(
                            conversation = %session.conversation,
                            after = ?after,
                            "channel reconnected, filling gap"
                        );
                        self.request_fetch(FetchKind::GapFill { after });
                    }
                    ConnectionState::Connected => {
                        session.connected_once = true;
                        self.request_fetch(FetchKind::CatchUp);
                    }
                    ConnectionState::Disconnected | ConnectionState::Errored
                        if session.connected_once && session.gap.is_none() =>
                    {
                        session.gap = Some(session.stream_high_water);
                    }
                    _ => {}
                }
                self.update_phase();
            }
        }
    }

    fn update_phase(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.phase == SyncPhase::Loading && session.history_resolved && session.connected_once
        {
            session.phase = SyncPhase::Live;
            tracing::info!(conversation = %session.conversation, "conversation live");
        }
    }

    fn publish(&mut self) {
        let Some(session) = self.session.as_ref() else {
            if self.published.take().is_some() {
                self.outputs.messages.send_replace(Arc::from(Vec::new()));
            }
            self.outputs
                .connection
                .send_if_modified(|s| replace_if_changed(s, ConnectionState::Idle));
            self.outputs
                .status
                .send_if_modified(|s| replace_if_changed(s, SyncStatus::default()));
            return;
        };

        let version = (session.generation, session.store.revision());
        if self.published != Some(version) {
            self.published = Some(version);
            self.outputs
                .messages
                .send_replace(Arc::from(session.store.list()));
        }
        let connection = session.connection;
        self.outputs
            .connection
            .send_if_modified(|s| replace_if_changed(s, connection));
        let status = session.status();
        self.outputs
            .status
            .send_if_modified(|s| replace_if_changed(s, status));
    }
}

fn replace_if_changed<V: PartialEq>(slot: &mut V, value: V) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Next signal of the open session's channel; pends forever without one.
async fn next_signal<A>(session: &mut Option<Session<A>>) -> Option<ChannelSignal> {
    match session.as_mut().and_then(|s| s.signals.as_mut()) {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Fetches history pages and reports each one as it arrives.
async fn run_fetch<A: ChatApi>(
    api: Arc<A>,
    conversation: ConversationId,
    generation: u64,
    kind: FetchKind,
    after: Option<MessageId>,
    max_pages: u32,
    tx: mpsc::Sender<Internal>,
) {
    let mut query = after.map_or_else(HistoryQuery::first, HistoryQuery::newer_than);
    let mut pages = 0u32;
    let result = loop {
        match api.fetch_history(conversation, query).await {
            Ok(page) => {
                pages += 1;
                let has_more = page.has_more;
                if tx
                    .send(Internal::HistoryPage { generation, page })
                    .await
                    .is_err()
                {
                    return;
                }
                if !has_more {
                    break Ok(());
                }
                if pages >= max_pages {
                    tracing::warn!(
                        conversation = %conversation,
                        %kind,
                        pages,
                        "history page limit reached, older gaps may remain"
                    );
                    break Ok(());
                }
                query = query.next_page();
            }
            Err(e) => break Err(e.to_string()),
        }
    };
    let _ = tx
        .send(Internal::HistoryDone {
            generation,
            kind,
            after,
            result,
        })
        .await;
}
