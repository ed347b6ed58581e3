//! Async host for the revision engine.
//!
//! ```text
//!  host ──EngineEvent──► [events] ─┐
//!  server ──frames──► RuntimeHandle ┤
//!                                   ▼
//!                 ┌─────────── select! loop ───────────┐
//!                 │ RevisionEngine::handle → Effects   │◄── autosave interval
//!                 └──┬──────────┬───────────┬──────────┘
//!           Transport│    DiffWorker    HostEffect channel
//!                    ▼          │ (responses loop back in)
//!                 server        ▼
//! ```
//!
//! All engine state is owned by one task; the diff worker, debounce timers
//! and the host only talk to it through channels.

use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::{DocumentSurface, Effect, EngineEvent, Notice, RevisionEngine};
use crate::protocol::{Frame, ProtocolError, ServerMessage, TransportCommand};
use crate::revision::DocPath;
use crate::worker::{DiffBackend, DiffResponse, DiffWorker};

/// Outgoing side of the server connection.
pub trait Transport: Send + 'static {
    /// Hand a command to the connection. An error means the connection is
    /// gone; the engine switches to offline mode.
    fn send(&mut self, command: TransportCommand) -> Result<(), ProtocolError>;
}

/// Transport that frames commands with bincode onto a byte channel, for a
/// connection task to write out.
pub struct ChannelTransport {
    session: Uuid,
    seq: u64,
    outgoing: mpsc::Sender<Vec<u8>>,
}

impl ChannelTransport {
    pub fn new(session: Uuid, outgoing: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            session,
            seq: 0,
            outgoing,
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, command: TransportCommand) -> Result<(), ProtocolError> {
        self.seq += 1;
        let bytes = Frame::new(self.session, self.seq, command).encode()?;
        self.outgoing
            .try_send(bytes)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

/// What the host has to apply to its documents and UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEffect {
    ReplaceContent { path: DocPath, content: String },
    Notice(Notice),
}

/// Handle to a running engine.
pub struct RuntimeHandle {
    session: Uuid,
    events: mpsc::Sender<EngineEvent>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<RevisionEngine>,
}

impl RuntimeHandle {
    pub fn session(&self) -> Uuid {
        self.session
    }

    pub async fn send(&self, event: EngineEvent) -> Result<(), ProtocolError> {
        self.events
            .send(event)
            .await
            .map_err(|_| ProtocolError::EngineStopped)
    }

    /// Decode a frame received from the server and feed it to the engine.
    pub async fn deliver_server_frame(&self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let frame = Frame::<ServerMessage>::decode(bytes)?;
        if frame.session != self.session && !frame.session.is_nil() {
            log::debug!("Ignoring frame {} addressed to session {}", frame.seq, frame.session);
            return Ok(());
        }
        self.send(EngineEvent::Server(frame.body)).await
    }

    /// Stop the loop, persist the offline queue and return the engine.
    pub async fn shutdown(mut self) -> Option<RevisionEngine> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(engine) => Some(engine),
            Err(e) => {
                log::error!("Revision runtime ended abnormally: {e}");
                None
            }
        }
    }
}

/// Spawn the engine loop on the current tokio runtime.
pub fn spawn<B, T, S>(
    config: &EngineConfig,
    engine: RevisionEngine,
    backend: B,
    transport: T,
    surface: S,
) -> (RuntimeHandle, mpsc::Receiver<HostEffect>)
where
    B: DiffBackend,
    T: Transport,
    S: DocumentSurface + Send + 'static,
{
    spawn_with_session(config, Uuid::new_v4(), engine, backend, transport, surface)
}

/// Like [`spawn`], with a caller-chosen session id (shared with the
/// transport's frames).
pub fn spawn_with_session<B, T, S>(
    config: &EngineConfig,
    session: Uuid,
    engine: RevisionEngine,
    backend: B,
    transport: T,
    surface: S,
) -> (RuntimeHandle, mpsc::Receiver<HostEffect>)
where
    B: DiffBackend,
    T: Transport,
    S: DocumentSurface + Send + 'static,
{
    let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
    let (host_tx, host_rx) = mpsc::channel(config.notice_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (worker, responses) = DiffWorker::spawn(backend, config.diff_mailbox_capacity);

    let event_loop = EventLoop {
        engine,
        worker,
        transport,
        surface,
        timers: events_tx.clone(),
        host: host_tx,
    };
    let interval = config.autosave_interval;
    let task = tokio::spawn(event_loop.run(events_rx, responses, shutdown_rx, interval));

    log::info!("Revision runtime started (session {session})");
    (
        RuntimeHandle {
            session,
            events: events_tx,
            shutdown_tx: Some(shutdown_tx),
            task,
        },
        host_rx,
    )
}

struct EventLoop<T, S> {
    engine: RevisionEngine,
    worker: DiffWorker,
    transport: T,
    surface: S,
    /// Debounce timers post back through this sender.
    timers: mpsc::Sender<EngineEvent>,
    host: mpsc::Sender<HostEffect>,
}

impl<T: Transport, S: DocumentSurface + Send + 'static> EventLoop<T, S> {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<EngineEvent>,
        mut responses: mpsc::Receiver<DiffResponse>,
        mut shutdown: oneshot::Receiver<()>,
        autosave_interval: std::time::Duration,
    ) -> RevisionEngine {
        let mut ticker = tokio::time::interval(autosave_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let mut backlog = VecDeque::new();
        let startup = self.engine.startup();
        self.apply(startup, &mut backlog).await;
        while let Some(event) = backlog.pop_front() {
            self.dispatch(event).await;
        }

        loop {
            let event = tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = events.recv() => event,
                Some(response) = responses.recv() => EngineEvent::Diff(response),
                _ = ticker.tick() => EngineEvent::AutosaveTick,
                else => break,
            };
            self.dispatch(event).await;
        }

        log::info!("Revision runtime stopping");
        self.engine.shutdown();
        drop(responses);
        self.worker.shutdown().await;
        self.engine
    }

    /// Handle one event and everything it feeds back synchronously.
    async fn dispatch(&mut self, event: EngineEvent) {
        let mut backlog = VecDeque::from([event]);
        while let Some(event) = backlog.pop_front() {
            let effects = self.engine.handle(event, &self.surface);
            self.apply(effects, &mut backlog).await;
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>, backlog: &mut VecDeque<EngineEvent>) {
        for effect in effects {
            match effect {
                Effect::Transport(command) => {
                    let method = command.method();
                    if let Err(e) = self.transport.send(command) {
                        log::warn!("Transport failed on {method}: {e}");
                        if self.engine.is_online() {
                            backlog.push_back(EngineEvent::ConnectivityChanged { online: false });
                        }
                    }
                }
                Effect::Diff(request) => {
                    let correlation = request.request().map(|id| (id, request.path().clone()));
                    if let Err(e) = self.worker.submit(request) {
                        log::warn!("Diff worker rejected request: {e}");
                        if let Some((request, path)) = correlation {
                            backlog.push_back(EngineEvent::Diff(DiffResponse::Failed {
                                request,
                                path,
                                message: e.to_string(),
                            }));
                        }
                    }
                }
                Effect::ReplaceContent { path, content } => {
                    if self
                        .host
                        .send(HostEffect::ReplaceContent { path, content })
                        .await
                        .is_err()
                    {
                        log::debug!("Host receiver dropped, discarding content replacement");
                    }
                }
                Effect::ScheduleDebounce {
                    path,
                    generation,
                    delay,
                } => {
                    let timers = self.timers.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = timers
                            .send(EngineEvent::DebounceElapsed { path, generation })
                            .await;
                    });
                }
                Effect::Notify(notice) => {
                    if self.host.send(HostEffect::Notice(notice)).await.is_err() {
                        log::debug!("Host receiver dropped, discarding notice");
                    }
                }
            }
        }
    }
}
