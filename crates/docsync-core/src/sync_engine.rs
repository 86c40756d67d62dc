//! SyncEngine: wires one open document to its channel and editor.
//!
//! The flow for a single document view:
//!
//! 1. `start()` disables the editor, shows the loading placeholder and
//!    subscribes to channel notices and editor changes.
//! 2. On every new connection (`Connected { epoch }`), the engine emits
//!    `join-document` and `get-document` once for that epoch.
//! 3. The first `load-document` of the round replaces the editor content,
//!    replays any `receive-changes` buffered meanwhile, and enables editing.
//! 4. While ready, user edits go out as `send-changes` and remote deltas are
//!    applied silently. Silent changes are never sent back.
//! 5. Dropping or closing the returned `SyncSession` emits `leave-document`,
//!    detaches every listener and disconnects the channel, exactly once.
//!
//! All state decisions happen under one mutex. Side effects (editor calls,
//! channel emits, published events) run after it is released, so an editor
//! callback re-entering the engine cannot deadlock.

use crate::channel::{Channel, ChannelError, ChannelNotice, DisconnectReason};
use crate::delta::Delta;
use crate::document::{DocumentSync, LoadOutcome, RemoteOutcome, SyncState};
use crate::editor::{ChangeSource, Editor, EditorError, PLACEHOLDER};
use crate::events::{EngineEvent, EventBus, NoticeLevel, Subscription};
use crate::ids::{DocId, UserName};
use crate::presence::PresenceList;
use crate::protocol::{ClientEvent, Membership, ServerEvent, TitleUpdate};
use crate::share::{Clipboard, DocumentRoute, ShareError};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Document is still loading")]
    NotReady,

    #[error("Sync session is closed")]
    Closed,

    #[error("Sync engine already started")]
    AlreadyStarted,

    #[error("No document route to share")]
    NoRoute,

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Editor error: {0}")]
    Editor(#[from] EditorError),

    #[error("Share error: {0}")]
    Share(#[from] ShareError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Who is opening which document. Passed in explicitly; the engine never
/// looks identity up on its own.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub doc_id: DocId,
    pub user_name: UserName,
    /// Address of the view, used for share links.
    pub route: Option<DocumentRoute>,
}

impl EngineConfig {
    pub fn new(doc_id: DocId, user_name: UserName) -> Self {
        Self {
            doc_id,
            user_name,
            route: None,
        }
    }

    pub fn with_route(mut self, route: DocumentRoute) -> Self {
        self.route = Some(route);
        self
    }

    fn membership(&self) -> Membership {
        Membership {
            user_name: self.user_name.clone(),
            doc_id: self.doc_id.clone(),
        }
    }
}

enum Effect {
    Emit(ClientEvent),
    Publish(EngineEvent),
    Disable,
    Enable,
    /// Replace the editor content with a loaded document.
    Load(Delta),
    /// Apply a remote delta.
    Apply(Delta),
    /// Announce the loaded length.
    Loaded,
}

struct EngineState {
    doc: DocumentSync,
    presence: PresenceList,
    joined_epoch: Option<u64>,
    started: bool,
    closed: bool,
}

struct Inner<C, E> {
    config: EngineConfig,
    channel: Arc<C>,
    editor: Arc<E>,
    state: Mutex<EngineState>,
    events: Arc<EventBus<EngineEvent>>,
}

/// Sync engine for one open document.
///
/// Cheap to clone; clones share the same state.
pub struct SyncEngine<C: Channel + 'static, E: Editor + 'static> {
    inner: Arc<Inner<C, E>>,
}

impl<C: Channel + 'static, E: Editor + 'static> Clone for SyncEngine<C, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Channel + 'static, E: Editor + 'static> SyncEngine<C, E> {
    pub fn new(config: EngineConfig, channel: Arc<C>, editor: Arc<E>) -> Self {
        let doc = DocumentSync::new(config.doc_id.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                channel,
                editor,
                state: Mutex::new(EngineState {
                    doc,
                    presence: PresenceList::new(),
                    joined_epoch: None,
                    started: false,
                    closed: false,
                }),
                events: Arc::new(EventBus::new()),
            }),
        }
    }

    /// Mount the document view. The returned session is the only handle
    /// needed for teardown.
    pub fn start(&self) -> Result<SyncSession<C, E>> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(SyncError::Closed);
            }
            if state.started {
                return Err(SyncError::AlreadyStarted);
            }
            state.started = true;
        }

        self.inner.editor.disable();
        self.inner.editor.set_text(PLACEHOLDER, ChangeSource::Silent)?;

        let weak = Arc::downgrade(&self.inner);
        let notices = self.inner.channel.notices().subscribe(move |notice| {
            if let Some(inner) = weak.upgrade() {
                SyncEngine { inner }.handle_notice(notice);
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let changes = self.inner.editor.changes().subscribe(move |change| {
            if change.source != ChangeSource::User {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = (SyncEngine { inner }).on_local_change(change.delta, change.source) {
                    debug!("Local change not sent: {}", e);
                }
            }
        });

        info!(
            doc = %self.inner.config.doc_id,
            user = %self.inner.config.user_name,
            "Sync session started"
        );

        if let Some(epoch) = self.inner.channel.connection_epoch() {
            self.on_connected(epoch);
        }

        Ok(SyncSession {
            engine: self.clone(),
            subscriptions: vec![notices, changes],
        })
    }

    /// A content mutation from the editor. Only user edits are forwarded,
    /// and only once the document is ready.
    pub fn on_local_change(&self, delta: Delta, source: ChangeSource) -> Result<()> {
        if source != ChangeSource::User {
            return Ok(());
        }
        {
            let state = self.lock();
            if state.closed {
                return Err(SyncError::Closed);
            }
            if !state.doc.is_ready() {
                return Err(SyncError::NotReady);
            }
        }
        self.run(vec![Effect::Emit(ClientEvent::SendChanges(delta))])
    }

    /// A `receive-changes` from the server.
    pub fn on_remote_change(&self, delta: Delta) {
        let effects = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            match state.doc.on_remote_change(delta) {
                RemoteOutcome::Apply(delta) => vec![Effect::Apply(delta)],
                RemoteOutcome::Buffered => {
                    debug!(buffered = state.doc.buffered_len(), "Buffered remote change while loading");
                    vec![]
                }
                RemoteOutcome::Ignored => {
                    debug!("Ignoring remote change, no load in progress");
                    vec![]
                }
            }
        };
        let _ = self.run(effects);
    }

    /// Local title edit: shown immediately, then sent as `update-title`.
    pub fn on_title_edit(&self, title: impl Into<String>) -> Result<()> {
        let title = title.into();
        let effects = {
            let mut state = self.lock();
            if state.closed {
                return Err(SyncError::Closed);
            }
            if !state.doc.edit_title(title.clone()) {
                return Err(SyncError::NotReady);
            }
            vec![
                Effect::Publish(EngineEvent::TitleChanged {
                    title: title.clone(),
                }),
                Effect::Emit(ClientEvent::UpdateTitle(TitleUpdate {
                    doc_id: self.inner.config.doc_id.clone(),
                    title,
                })),
            ]
        };
        self.run(effects)
    }

    /// A `title-updated` from the server. Overwrites the local title.
    pub fn on_remote_title_update(&self, title: String) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.doc.set_remote_title(title.clone());
        }
        self.inner.events.emit(EngineEvent::TitleChanged { title });
    }

    /// A `load-document` from the server.
    pub fn on_load(&self, content: Delta) {
        if !content.is_document() {
            warn!("Ignoring load-document whose content is not a document");
            return;
        }
        let effects = {
            let mut state = self.lock();
            if state.closed {
                debug!("Ignoring load-document after teardown");
                return;
            }
            let round = state.doc.round();
            match state.doc.on_load(content) {
                LoadOutcome::Apply { content, replay } => {
                    info!(
                        doc = %self.inner.config.doc_id,
                        round,
                        replayed = replay.len(),
                        "Document loaded"
                    );
                    let mut effects = vec![Effect::Load(content)];
                    effects.extend(replay.into_iter().map(Effect::Apply));
                    effects.push(Effect::Enable);
                    effects.push(Effect::Publish(EngineEvent::StateChanged {
                        state: SyncState::Ready,
                    }));
                    effects.push(Effect::Loaded);
                    effects
                }
                LoadOutcome::Duplicate => {
                    debug!(round, "Ignoring duplicate load-document");
                    vec![]
                }
                LoadOutcome::Unrequested => {
                    debug!("Ignoring unrequested load-document");
                    vec![]
                }
            }
        };
        let _ = self.run(effects);
    }

    /// A new connection is live: join and load again, once per epoch.
    pub fn on_connected(&self, epoch: u64) {
        let effects = {
            let mut state = self.lock();
            if state.closed || state.joined_epoch == Some(epoch) {
                return;
            }
            state.joined_epoch = Some(epoch);
            let previous = state.doc.state();
            let round = state.doc.begin_load();
            debug!(epoch, round, "Connected, joining and loading");

            let mut effects = Vec::new();
            if previous == SyncState::Ready {
                effects.push(Effect::Disable);
                effects.push(Effect::Publish(EngineEvent::StateChanged {
                    state: SyncState::Loading,
                }));
            }
            if !state.presence.is_empty() {
                state.presence.clear();
                effects.push(Effect::Publish(EngineEvent::PresenceChanged { users: vec![] }));
            }
            effects.push(Effect::Emit(ClientEvent::JoinDocument(
                self.inner.config.membership(),
            )));
            effects.push(Effect::Emit(ClientEvent::GetDocument(
                self.inner.config.doc_id.clone(),
            )));
            effects
        };
        let _ = self.run(effects);
    }

    /// The connection dropped. Editing stops until the next load.
    pub fn on_disconnected(&self, epoch: u64, reason: DisconnectReason) {
        let effects = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            warn!(epoch, ?reason, "Connection lost, reloading on reconnect");
            let previous = state.doc.reset();

            let mut effects = vec![Effect::Disable];
            if previous == SyncState::Ready {
                effects.push(Effect::Publish(EngineEvent::StateChanged {
                    state: SyncState::Loading,
                }));
            }
            if !state.presence.is_empty() {
                state.presence.clear();
                effects.push(Effect::Publish(EngineEvent::PresenceChanged { users: vec![] }));
            }
            effects.push(Effect::Publish(EngineEvent::ConnectionLost));
            effects
        };
        let _ = self.run(effects);
    }

    pub fn on_user_connected(&self, name: UserName) {
        let users = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.presence.user_connected(name);
            names(&state.presence)
        };
        self.inner.events.emit(EngineEvent::PresenceChanged { users });
    }

    pub fn on_user_disconnected(&self, name: UserName) {
        let users = {
            let mut state = self.lock();
            if state.closed || !state.presence.user_disconnected(&name) {
                return;
            }
            names(&state.presence)
        };
        self.inner.events.emit(EngineEvent::PresenceChanged { users });
    }

    /// Copy the share link for this document to `clipboard`.
    ///
    /// The outcome is also published as a notification. Sync state is never
    /// touched.
    pub async fn share_link(&self, clipboard: &dyn Clipboard) -> Result<Url> {
        let route = self.inner.config.route.as_ref().ok_or(SyncError::NoRoute)?;
        let url = route.share_url();

        match clipboard.write_text(url.as_str()).await {
            Ok(()) => {
                self.inner.events.emit(EngineEvent::Notification {
                    level: NoticeLevel::Info,
                    message: "Link copied to clipboard!".to_string(),
                });
                Ok(url)
            }
            Err(e) => {
                warn!("Failed to copy link: {}", e);
                self.inner.events.emit(EngineEvent::Notification {
                    level: NoticeLevel::Warning,
                    message: format!("Failed to copy link: {}", e),
                });
                Err(e.into())
            }
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SyncState {
        self.lock().doc.state()
    }

    pub fn title(&self) -> String {
        self.lock().doc.title().to_string()
    }

    /// Other participants, in the order they were announced.
    pub fn presence(&self) -> Vec<UserName> {
        self.lock().presence.users().to_vec()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn events(&self) -> &Arc<EventBus<EngineEvent>> {
        &self.inner.events
    }

    pub fn editor(&self) -> &Arc<E> {
        &self.inner.editor
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.inner.channel
    }

    fn handle_notice(&self, notice: ChannelNotice) {
        match notice {
            ChannelNotice::Connected { epoch } => self.on_connected(epoch),
            ChannelNotice::Disconnected { epoch, reason } => self.on_disconnected(epoch, reason),
            ChannelNotice::Event(event) => self.handle_event(event),
        }
    }

    fn handle_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::LoadDocument(content) => self.on_load(content),
            ServerEvent::ReceiveChanges(delta) => self.on_remote_change(delta),
            ServerEvent::TitleUpdated(title) => self.on_remote_title_update(title),
            ServerEvent::UserConnected(name) => self.on_user_connected(name),
            ServerEvent::UserDisconnected(name) => self.on_user_disconnected(name),
            ServerEvent::SaveChanges => {
                if !self.is_closed() {
                    self.inner.events.emit(EngineEvent::Saved);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Carry out effects in order. Every effect runs; the first failed emit
    /// is returned.
    fn run(&self, effects: Vec<Effect>) -> Result<()> {
        let editor = &self.inner.editor;
        let mut result = Ok(());

        for effect in effects {
            match effect {
                Effect::Emit(event) => {
                    let name = event.name();
                    if let Err(e) = self.inner.channel.emit(event) {
                        warn!(event = name, "Failed to emit: {}", e);
                        if result.is_ok() {
                            result = Err(e.into());
                        }
                    }
                }
                Effect::Publish(event) => self.inner.events.emit(event),
                Effect::Disable => editor.disable(),
                Effect::Enable => editor.enable(),
                Effect::Load(content) => {
                    if let Err(e) = editor.set_contents(content, ChangeSource::Silent) {
                        warn!("Failed to show loaded content: {}", e);
                    }
                }
                Effect::Apply(delta) => {
                    if let Err(e) = editor.update_contents(&delta, ChangeSource::Silent) {
                        warn!("Skipping remote change: {}", e);
                    }
                }
                Effect::Loaded => {
                    let length = editor.contents().length();
                    self.inner.events.emit(EngineEvent::ContentLoaded { length });
                }
            }
        }

        result
    }
}

fn names(presence: &PresenceList) -> Vec<String> {
    presence.users().iter().map(|u| u.to_string()).collect()
}

/// Disposer for a started engine.
///
/// Teardown emits `leave-document`, detaches every listener, then
/// disconnects the channel. It runs once, on `close()` or on drop.
pub struct SyncSession<C: Channel + 'static, E: Editor + 'static> {
    engine: SyncEngine<C, E>,
    subscriptions: Vec<Subscription>,
}

impl<C: Channel + 'static, E: Editor + 'static> SyncSession<C, E> {
    pub fn engine(&self) -> &SyncEngine<C, E> {
        &self.engine
    }

    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        {
            let mut state = self.engine.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }

        let inner = &self.engine.inner;
        let leave = ClientEvent::LeaveDocument(inner.config.membership());
        if let Err(e) = inner.channel.emit(leave) {
            debug!("leave-document not sent: {}", e);
        }
        self.subscriptions.clear();
        inner.channel.disconnect();
        info!(doc = %inner.config.doc_id, "Sync session closed");
    }
}

impl<C: Channel + 'static, E: Editor + 'static> Drop for SyncSession<C, E> {
    fn drop(&mut self) {
        self.teardown();
    }
}
