/// PanelCore: single-owner event loop for all mutable panel state.
///
/// Every input arrives as a `PanelEvent` on one mpsc channel: client
/// commands, display signals, feed updates, and the completions of network
/// calls the core spawned.  PanelCore owns the session, catalog, queue,
/// stage and feed handle exclusively; nothing else touches them.
///
/// After each event the full snapshot is written to the `StateManager` and
/// a `BroadcastMessage::StateUpdated` goes out to socket clients.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use avatar_proto::config::Config;
use avatar_proto::protocol::{
    Command, FeedEvent, FeedStatus, LoggedEvent, MotionClip, MotionTag, PanelState, Persona,
    RoomStatus,
};
use avatar_proto::room::RoomId;
use avatar_proto::state::StateManager;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, LiveStatus};
use crate::catalog::{self, CatalogError, LoadTicket, MotionCatalog};
use crate::display::{Display, DisplaySignal, Stage};
use crate::feed::{self, FeedHandle, FeedSignal, FeedUpdate};
use crate::queue::{Enqueued, Next, ReactionQueue};
use crate::session::{GateError, Session, StartRequest};
use crate::BroadcastMessage;

/// Error handed back to whoever sent a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PanelError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    /// The broadcast service failed or refused.
    #[error("{0}")]
    Service(String),
}

pub type Reply = Option<oneshot::Sender<Result<(), PanelError>>>;

// ── PanelEvent ────────────────────────────────────────────────────────────────

/// All inputs into the PanelCore loop.
#[derive(Debug)]
pub enum PanelEvent {
    /// A command from a socket client or the HTTP API.  Commands that wait
    /// on the broadcast service answer once the call completes.
    Command { cmd: Command, reply: Reply },
    Display(DisplaySignal),
    Feed(FeedUpdate),
    CatalogLoaded {
        ticket: LoadTicket,
        clips: Vec<MotionClip>,
    },
    PersonasLoaded(Result<Vec<Persona>, String>),
    RoomChecked {
        room: RoomId,
        result: Result<LiveStatus, String>,
        reply: Reply,
    },
    StartFinished {
        result: Result<String, String>,
        reply: Reply,
    },
    Shutdown,
}

impl From<FeedUpdate> for PanelEvent {
    fn from(update: FeedUpdate) -> Self {
        PanelEvent::Feed(update)
    }
}

impl From<DisplaySignal> for PanelEvent {
    fn from(signal: DisplaySignal) -> Self {
        PanelEvent::Display(signal)
    }
}

// ── PanelCore ─────────────────────────────────────────────────────────────────

pub struct PanelCore {
    config: Config,
    state_manager: Arc<StateManager>,
    backend: Arc<dyn Backend>,
    display: Box<dyn Display>,
    /// Our own inbox; spawned tasks post their completions here.
    event_tx: mpsc::Sender<PanelEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    session: Session,
    catalog: MotionCatalog,
    queue: ReactionQueue,
    stage: Stage,
    personas: Vec<Persona>,
    feed: Option<FeedHandle>,
    feed_status: FeedStatus,
    next_connection: u64,
    event_log: VecDeque<LoggedEvent>,
    last_error: Option<String>,
}

impl PanelCore {
    pub fn new(
        config: Config,
        state_manager: Arc<StateManager>,
        backend: Arc<dyn Backend>,
        display: Box<dyn Display>,
        event_tx: mpsc::Sender<PanelEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> anyhow::Result<Self> {
        let media_base = Url::parse(&config.backend.base_url)
            .with_context(|| format!("Invalid backend base URL {:?}", config.backend.base_url))?;
        let stage = Stage::new(config.display.fallback_image.clone());
        Ok(Self {
            config,
            state_manager,
            backend,
            display,
            event_tx,
            broadcast_tx,
            session: Session::new(),
            catalog: MotionCatalog::new(media_base),
            queue: ReactionQueue::new(),
            stage,
            personas: Vec::new(),
            feed: None,
            feed_status: FeedStatus::Disconnected,
            next_connection: 0,
            event_log: VecDeque::new(),
            last_error: None,
        })
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<PanelEvent>) -> anyhow::Result<()> {
        info!("PanelCore: starting event loop");
        self.restore().await;
        self.publish().await;

        loop {
            match event_rx.recv().await {
                None => {
                    info!("PanelCore: event channel closed, shutting down");
                    break;
                }
                Some(PanelEvent::Shutdown) => {
                    info!("PanelCore: shutdown requested");
                    break;
                }
                Some(evt) => {
                    self.handle_event(evt).await;
                    self.publish().await;
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Re-apply the selection remembered from the last run and fetch the
    /// persona list.
    async fn restore(&mut self) {
        let remembered = self.state_manager.persistent().await;
        if let Some(room) = remembered.last_room_id.as_deref() {
            match RoomId::parse(room) {
                Ok(room) => self.session.restore_room(room),
                Err(e) => warn!("PanelCore: ignoring remembered room {:?}: {}", room, e),
            }
        }
        if let Some(persona_id) = remembered.last_persona_id {
            if let Err(e) = self.select_persona(Some(persona_id)).await {
                warn!("PanelCore: could not restore persona: {}", e);
            }
        }
        self.load_personas();
    }

    pub(crate) async fn handle_event(&mut self, evt: PanelEvent) {
        match evt {
            PanelEvent::Command { cmd, reply } => self.handle_command(cmd, reply).await,
            PanelEvent::Display(signal) => self.handle_display(signal).await,
            PanelEvent::Feed(update) => self.handle_feed(update).await,
            PanelEvent::CatalogLoaded { ticket, clips } => {
                if self.catalog.finish_load(&ticket, clips) && !self.queue.is_playing() {
                    self.play_resting().await;
                }
            }
            PanelEvent::PersonasLoaded(Ok(personas)) => {
                info!("PanelCore: {} personas available", personas.len());
                if let Some(fresh) = self
                    .session
                    .persona()
                    .and_then(|current| personas.iter().find(|p| p.id == current.id))
                    .cloned()
                {
                    self.session.refresh_persona(&fresh);
                }
                self.personas = personas;
            }
            PanelEvent::PersonasLoaded(Err(e)) => {
                warn!("PanelCore: failed to load personas: {}", e);
            }
            PanelEvent::RoomChecked {
                room,
                result,
                reply,
            } => {
                let outcome = self.finish_room_check(room, result).await;
                self.respond(reply, outcome);
            }
            PanelEvent::StartFinished { result, reply } => {
                let outcome = self.finish_start(result).await;
                self.respond(reply, outcome);
            }
            PanelEvent::Shutdown => {}
        }
    }

    // ── command handlers ──────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command, reply: Reply) {
        debug!("PanelCore: command {:?}", cmd);
        let result = match cmd {
            Command::SelectPersona { persona_id } => self.select_persona(persona_id).await,
            // These two answer once the broadcast service has
            Command::ConfirmRoom { room_id } => match self.session.begin_room_check(&room_id) {
                Ok(room) => return self.check_room(room, reply),
                Err(e) => Err(e.into()),
            },
            Command::Start => match self.session.begin_start() {
                Ok(request) => return self.start(request, reply),
                Err(e) => Err(e.into()),
            },
            Command::Stop => {
                self.stop().await;
                Ok(())
            }
            Command::PlayTag { tag } => self.play_tag(MotionTag::from(tag)).await,
            Command::PlayClip { name } => self.play_clip(&name).await,
            Command::ClipEnded { url } => {
                self.handle_display(DisplaySignal::Ended(url)).await;
                Ok(())
            }
            Command::ClipReady { url } => {
                self.handle_display(DisplaySignal::Ready(url)).await;
                Ok(())
            }
            Command::ReloadCatalog => {
                self.load_catalog();
                Ok(())
            }
            Command::ReloadPersonas => {
                self.load_personas();
                Ok(())
            }
            Command::GetState => Ok(()),
        };
        self.respond(reply, result);
    }

    fn respond(&mut self, reply: Reply, result: Result<(), PanelError>) {
        if let Err(e) = &result {
            warn!("PanelCore: {}", e);
            self.last_error = Some(e.to_string());
            let _ = self.broadcast_tx.send(BroadcastMessage::Error(e.to_string()));
        }
        if let Some(tx) = reply {
            let _ = tx.send(result);
        }
    }

    async fn select_persona(&mut self, persona_id: Option<String>) -> Result<(), PanelError> {
        let persona = persona_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                self.personas
                    .iter()
                    .find(|p| p.id == id)
                    .cloned()
                    .unwrap_or_else(|| {
                        warn!("PanelCore: persona {} not in the persona list", id);
                        Persona {
                            id: id.to_string(),
                            name: id.to_string(),
                            ..Persona::default()
                        }
                    })
            });

        let changed = self.session.persona().map(|p| &p.id) != persona.as_ref().map(|p| &p.id);
        self.session.select_persona(persona)?;
        if changed {
            self.load_catalog();
            self.remember().await;
        }
        Ok(())
    }

    fn check_room(&self, room: RoomId, reply: Reply) {
        let backend = Arc::clone(&self.backend);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = backend.room_status(&room).await.map_err(|e| format!("{:#}", e));
            let _ = tx
                .send(PanelEvent::RoomChecked {
                    room,
                    result,
                    reply,
                })
                .await;
        });
    }

    async fn finish_room_check(
        &mut self,
        room: RoomId,
        result: Result<LiveStatus, String>,
    ) -> Result<(), PanelError> {
        let status = match result {
            Ok(LiveStatus { is_live: true, .. }) => RoomStatus::Live,
            Ok(LiveStatus { detail, .. }) => RoomStatus::NotLive { detail },
            Err(e) => RoomStatus::NotLive { detail: Some(e) },
        };
        if !self.session.finish_room_check(&room, status.clone()) {
            return Err(PanelError::Service(format!(
                "Room changed before the check for {} finished",
                room
            )));
        }
        self.remember().await;

        match status {
            RoomStatus::NotLive { detail } => Err(GateError::RoomNotLive(detail).into()),
            _ => {
                if self.session.is_live() && self.feed.is_none() {
                    info!("PanelCore: reconnecting feed for {}", room);
                    self.connect_feed();
                }
                Ok(())
            }
        }
    }

    fn start(&self, request: StartRequest, reply: Reply) {
        let backend = Arc::clone(&self.backend);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = backend
                .start_session(&request.room, &request.persona_id)
                .await
                .map_err(|e| format!("{:#}", e));
            let _ = tx.send(PanelEvent::StartFinished { result, reply }).await;
        });
    }

    async fn finish_start(&mut self, result: Result<String, String>) -> Result<(), PanelError> {
        let (token, failure) = match result {
            Ok(token) => (Some(token), None),
            Err(e) => (None, Some(e)),
        };
        match self.session.finish_start(token) {
            Some(session) => {
                info!("PanelCore: broadcast live {:?}", session);
                self.last_error = None;
                self.connect_feed();
                Ok(())
            }
            None => Err(PanelError::Service(
                failure.unwrap_or_else(|| "Broadcast start was not pending".to_string()),
            )),
        }
    }

    /// Best-effort teardown.  Each step runs even when an earlier one failed;
    /// without an active session this does nothing.
    async fn stop(&mut self) {
        let Some(session) = self.session.begin_stop() else {
            debug!("PanelCore: stop with no active session");
            return;
        };

        let backend = Arc::clone(&self.backend);
        let ended = session.clone();
        tokio::spawn(async move {
            match backend.stop_session(&ended).await {
                Ok(()) => info!("PanelCore: session {} ended at service", ended.session_id),
                Err(e) => error!("PanelCore: failed to end session {}: {:#}", ended.session_id, e),
            }
        });

        self.close_feed();
        self.queue.reset();

        // Back to neutral before the persona's catalog goes away
        match self.catalog.resting() {
            Ok(clip) => self.stage.swap_to(self.display.as_mut(), clip, true).await,
            Err(e) => {
                debug!("PanelCore: {} while stopping", e);
                self.stage.ensure_source(self.display.as_mut()).await;
            }
        }
        self.catalog.begin_load(None);
        self.remember().await;
        info!("PanelCore: broadcast stopped ({})", session.session_id);
    }

    async fn play_tag(&mut self, tag: MotionTag) -> Result<(), PanelError> {
        if self.queue.is_playing() {
            return Err(GateError::ReactionPlaying.into());
        }
        let clip = self.catalog.resolve(&tag)?;
        let looped = self.loops(&clip, false);
        self.stage.swap_to(self.display.as_mut(), clip, looped).await;
        Ok(())
    }

    async fn play_clip(&mut self, name: &str) -> Result<(), PanelError> {
        if self.queue.is_playing() {
            return Err(GateError::ReactionPlaying.into());
        }
        let clip = self.catalog.by_name(name)?;
        let looped = self.loops(&clip, false);
        self.stage.swap_to(self.display.as_mut(), clip, looped).await;
        Ok(())
    }

    // ── playback ──────────────────────────────────────────────────────────────

    /// Resting clips loop when there is no other neutral clip to rotate to.
    fn loops(&self, clip: &MotionClip, resting: bool) -> bool {
        let neutral = clip.tag.as_ref().is_some_and(MotionTag::is_neutral);
        (resting || neutral) && self.catalog.count(&MotionTag::Neutral) <= 1
    }

    async fn play_resting(&mut self) {
        match self.catalog.resting() {
            Ok(clip) => {
                let looped = self.loops(&clip, true);
                self.stage.swap_to(self.display.as_mut(), clip, looped).await;
            }
            Err(e) => {
                debug!("PanelCore: {}; keeping current source", e);
                self.stage.ensure_source(self.display.as_mut()).await;
            }
        }
    }

    /// Play the next queued reaction, or go back to resting.  Reactions the
    /// catalog cannot play are skipped so the queue never stalls.
    async fn advance(&mut self) {
        loop {
            match self.queue.advance() {
                Next::Reaction(event) => match self.catalog.resolve(&event.tag) {
                    Ok(clip) => {
                        info!(
                            "PanelCore: reaction {} x{} -> {}",
                            event.tag, event.repeat_count, clip.name
                        );
                        self.stage.swap_to(self.display.as_mut(), clip, false).await;
                        return;
                    }
                    Err(e) => warn!("PanelCore: skipping reaction: {}", e),
                },
                Next::Rest => {
                    self.play_resting().await;
                    return;
                }
            }
        }
    }

    async fn handle_display(&mut self, signal: DisplaySignal) {
        match signal {
            DisplaySignal::Ended(source) => {
                if !self.stage.owns_end(source.as_deref()) {
                    debug!("PanelCore: ignoring stale end ({:?})", source);
                    return;
                }
                if self.stage.is_looped() {
                    debug!("PanelCore: ignoring end of looping clip");
                    return;
                }
                self.advance().await;
            }
            DisplaySignal::Ready(source) => {
                if !self.stage.owns_ready(source.as_deref()) {
                    debug!("PanelCore: ignoring stale ready ({:?})", source);
                    return;
                }
                self.stage.on_ready(self.display.as_mut()).await;
            }
            DisplaySignal::Failed(reason) => {
                warn!("PanelCore: display failed: {}", reason);
                self.last_error = Some(format!("Playback failed: {}", reason));
                if self.queue.is_playing() {
                    self.advance().await;
                } else {
                    self.stage.ensure_source(self.display.as_mut()).await;
                }
            }
        }
    }

    // ── feed ──────────────────────────────────────────────────────────────────

    fn connect_feed(&mut self) {
        self.close_feed();
        let Some(room) = self.session.room() else {
            return;
        };
        match feed::feed_url(&self.config.backend.ws_url, room) {
            Ok(url) => {
                self.next_connection += 1;
                self.feed = Some(feed::spawn(url, self.next_connection, self.event_tx.clone()));
                self.feed_status = FeedStatus::Connecting;
            }
            Err(e) => {
                error!("PanelCore: cannot open feed: {:#}", e);
                self.last_error = Some(format!("{:#}", e));
            }
        }
    }

    fn close_feed(&mut self) {
        if let Some(handle) = self.feed.take() {
            handle.close();
        }
        self.feed_status = FeedStatus::Disconnected;
    }

    async fn handle_feed(&mut self, update: FeedUpdate) {
        if self.feed.as_ref().map(FeedHandle::connection) != Some(update.connection) {
            debug!("PanelCore: dropping update from closed feed {}", update.connection);
            return;
        }
        match update.signal {
            FeedSignal::Status(status) => {
                info!("PanelCore: feed {:?} -> {:?}", self.feed_status, status);
                self.feed_status = status;
                if status == FeedStatus::Disconnected {
                    self.feed = None;
                    if self.session.is_live() {
                        warn!("PanelCore: feed lost while live; re-confirm the room to reconnect");
                    }
                }
            }
            FeedSignal::Event(event) => self.handle_feed_event(event).await,
        }
    }

    async fn handle_feed_event(&mut self, event: FeedEvent) {
        let reaction = event.reaction();
        if reaction.is_none() && matches!(event, FeedEvent::Gift { .. }) {
            debug!("PanelCore: gift without motion tag, log only");
        }

        debug!("PanelCore: {} event from feed", event.kind());
        let logged = LoggedEvent {
            received_at: chrono::Local::now(),
            event,
        };
        self.event_log.push_back(logged.clone());
        while self.event_log.len() > self.config.daemon.event_log_capacity {
            self.event_log.pop_front();
        }
        let _ = self.broadcast_tx.send(BroadcastMessage::Feed(logged));

        let Some(reaction) = reaction else {
            return;
        };
        match self.queue.enqueue(reaction.clone()) {
            Enqueued::Duplicate => debug!("PanelCore: duplicate reaction {:?} dropped", reaction),
            Enqueued::Queued { position } => {
                debug!("PanelCore: reaction {} queued at {}", reaction.tag, position);
                if !self.queue.is_playing() {
                    self.advance().await;
                }
            }
        }
    }

    // ── background loads ──────────────────────────────────────────────────────

    fn load_catalog(&mut self) {
        let persona_id = self.session.persona().map(|p| p.id.as_str());
        let Some(ticket) = self.catalog.begin_load(persona_id) else {
            return;
        };
        let backend = Arc::clone(&self.backend);
        let media_base = self.catalog.media_base().clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let clips = catalog::fetch_clips(backend.as_ref(), &media_base, &ticket).await;
            let _ = tx.send(PanelEvent::CatalogLoaded { ticket, clips }).await;
        });
    }

    fn load_personas(&self) {
        let backend = Arc::clone(&self.backend);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = backend.list_personas().await.map_err(|e| format!("{:#}", e));
            let _ = tx.send(PanelEvent::PersonasLoaded(result)).await;
        });
    }

    // ── state ─────────────────────────────────────────────────────────────────

    async fn remember(&self) {
        let persona_id = self.session.persona().map(|p| p.id.clone());
        let room_id = self.session.room().map(|r| r.to_string());
        if let Err(e) = self.state_manager.remember(persona_id, room_id).await {
            warn!("PanelCore: failed to save state: {:#}", e);
        }
    }

    pub(crate) fn snapshot(&self) -> PanelState {
        PanelState {
            rev: 0,
            lifecycle: self.session.lifecycle(),
            persona: self.session.persona().cloned(),
            personas: self.personas.clone(),
            room_id: self.session.room().map(|r| r.to_string()),
            room_status: self.session.room_status().clone(),
            session_token: self.session.token().map(str::to_string),
            last_session: self.session.last_session().cloned(),
            feed_status: self.feed_status,
            queue: self.queue.pending().cloned().collect(),
            playing_reaction: self.queue.playing().cloned(),
            current_clip: self.stage.current().cloned(),
            loop_current: self.stage.is_looped(),
            overlay_visible: self.stage.overlay_visible(),
            showing_fallback: self.stage.showing_fallback(),
            clips: self.catalog.clips().to_vec(),
            catalog_loading: self.catalog.is_loading(),
            event_log: self.event_log.iter().cloned().collect(),
            last_error: self.last_error.clone(),
        }
    }

    async fn publish(&self) {
        self.state_manager.publish(self.snapshot()).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    async fn cleanup(&mut self) {
        self.close_feed();
        if let Some(session) = self.session.begin_stop() {
            info!("PanelCore: ending live session before exit");
            match tokio::time::timeout(Duration::from_secs(5), self.backend.stop_session(&session))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("PanelCore: failed to end session: {:#}", e),
                Err(_) => error!("PanelCore: timed out ending session"),
            }
        }
        self.display.shutdown().await;
    }
}
