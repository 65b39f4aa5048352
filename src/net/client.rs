//! Per-connection client actor (spec §6): reads newline-delimited
//! [`ClientMessage`]s, drives the [`SessionHub`], and writes back
//! [`ServerEvent`]s — both replies to requests and async pushes (status
//! updates a session broadcasts while this client is subscribed).
//!
//! Outbound events go through a small drop-oldest bounded queue rather than
//! a plain `tokio::sync::mpsc`: a slow client should lose stale status
//! snapshots, never back-pressure the session that's serving it.

use crate::controllers::PortInfo;
use crate::error::CoreError;
use crate::hub::{ClientId, SessionHandle, SessionHub};
use crate::net::protocol::{ClientMessage, ServerEvent};
use crate::session::dispatcher::Verb;
use crate::session::jog::JogSample;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, warn};

const OUTBOUND_QUEUE_CAPACITY: usize = 64;

struct OutboundQueue {
    queue: Mutex<VecDeque<ServerEvent>>,
    capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    fn new(capacity: usize) -> Self {
        OutboundQueue {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    async fn push(&self, event: ServerEvent) {
        let mut q = self.queue.lock().await;
        if q.len() >= self.capacity {
            q.pop_front();
        }
        q.push_back(event);
        drop(q);
        self.notify.notify_one();
    }

    async fn pop(&self) -> ServerEvent {
        loop {
            {
                let mut q = self.queue.lock().await;
                if let Some(event) = q.pop_front() {
                    return event;
                }
            }
            self.notify.notified().await;
        }
    }
}

pub struct ClientActor {
    id: ClientId,
    hub: Arc<SessionHub>,
}

impl ClientActor {
    pub fn new(id: ClientId, hub: Arc<SessionHub>) -> Self {
        ClientActor { id, hub }
    }

    pub async fn run(self, socket: TcpStream) -> std::io::Result<()> {
        let (read_half, mut write_half) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let outbound = Arc::new(OutboundQueue::new(OUTBOUND_QUEUE_CAPACITY));

        // Async pushes (session state changes while this client is
        // subscribed) land on this channel from `SessionHub`'s broadcaster;
        // forward them into the same outbound queue the synchronous
        // request/reply path writes to, so both share one drop-oldest queue
        // and one writer task.
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<ServerEvent>();
        self.hub.broadcaster().register_client(self.id, push_tx).await;
        let push_outbound = Arc::clone(&outbound);
        let push_task = tokio::spawn(async move {
            while let Some(event) = push_rx.recv().await {
                push_outbound.push(event).await;
            }
        });

        let writer_outbound = Arc::clone(&outbound);
        let writer_task = tokio::spawn(async move {
            loop {
                let event = writer_outbound.pop().await;
                let mut line = match serde_json::to_string(&event) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize server event");
                        continue;
                    }
                };
                line.push('\n');
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let event = match serde_json::from_str::<ClientMessage>(&line) {
                Ok(msg) => self.handle(msg).await,
                Err(e) => ServerEvent::Error((&CoreError::Io { detail: e.to_string() }).into()),
            };
            outbound.push(event).await;
        }

        self.hub.drop_client(self.id).await;
        writer_task.abort();
        push_task.abort();
        debug!(client_id = self.id, "client disconnected");
        Ok(())
    }

    async fn handle(&self, message: ClientMessage) -> ServerEvent {
        match self.dispatch(message).await {
            Ok(event) => event,
            Err(e) => ServerEvent::Error((&e).into()),
        }
    }

    async fn session(&self, handle: SessionHandle) -> Result<Arc<crate::session::ControllerSession>, CoreError> {
        self.hub.session(handle).await.ok_or(CoreError::NotOpen)
    }

    async fn dispatch(&self, message: ClientMessage) -> Result<ServerEvent, CoreError> {
        use ClientMessage::*;
        match message {
            ListPorts => {
                let ports: Vec<PortInfo> = self.hub.list_ports();
                Ok(ServerEvent::Ports { ports })
            }
            OpenSession { port, controller_type, baud_rate } => {
                let handle = self.hub.open_session(&port, controller_type, baud_rate).await?;
                Ok(ServerEvent::SessionOpened { handle })
            }
            CloseSession { handle } => {
                self.hub.close_session(handle).await?;
                Ok(ServerEvent::SessionClosed { handle })
            }
            Subscribe { handle } => {
                self.hub.bind_client(handle, self.id).await;
                Ok(ServerEvent::Ack)
            }
            Unsubscribe { handle } => {
                self.hub.unbind_client(handle, self.id).await;
                Ok(ServerEvent::Ack)
            }
            GetStatus { handle } => {
                let session = self.session(handle).await?;
                match self.hub.get_status(&session.port).await {
                    Some(snapshot) => Ok(ServerEvent::Status(snapshot)),
                    None => Err(CoreError::NotOpen),
                }
            }
            GetAllStatuses => Ok(ServerEvent::AllStatuses { statuses: self.hub.get_all_statuses().await }),
            LoadJob { handle, name, gcode } => {
                self.session(handle).await?.load_job(name, &gcode).await?;
                Ok(ServerEvent::Ack)
            }
            StartJob { handle } => {
                self.session(handle).await?.start_job().await;
                Ok(ServerEvent::Ack)
            }
            FeedMdi { handle, line } => {
                self.session(handle).await?.feed_mdi(line).await?;
                Ok(ServerEvent::Ack)
            }
            Jog { handle, x, y, z } => {
                self.session(handle).await?.jog_input(JogSample { x, y, z }).await;
                Ok(ServerEvent::Ack)
            }
            Homing { handle } => self.run_verb(handle, Verb::Homing).await,
            Unlock { handle } => self.run_verb(handle, Verb::Unlock).await,
            Reset { handle } => self.run_verb(handle, Verb::Reset).await,
            FeedHold { handle } => self.run_verb(handle, Verb::FeedHold).await,
            CycleStart { handle } => self.run_verb(handle, Verb::CycleStart).await,
            JogCancel { handle } => self.run_verb(handle, Verb::JogCancel).await,
            FeedOverride { handle, step } => self.run_verb(handle, Verb::FeedOverride(step)).await,
            RapidOverride { handle, step } => self.run_verb(handle, Verb::RapidOverride(step)).await,
            SpindleOverride { handle, step } => self.run_verb(handle, Verb::SpindleOverride(step)).await,
            SpindleOn { handle, rpm } => self.run_verb(handle, Verb::SpindleOn { rpm }).await,
            SpindleOff { handle } => self.run_verb(handle, Verb::SpindleOff).await,
            ZeroAxes { handle, axes } => self.run_verb(handle, Verb::ZeroAxes(axes)).await,
            EmergencyStop { handle } => self.run_verb(handle, Verb::EmergencyStop).await,
        }
    }

    async fn run_verb(&self, handle: SessionHandle, verb: Verb) -> Result<ServerEvent, CoreError> {
        self.session(handle).await?.dispatch(verb).await?;
        Ok(ServerEvent::Ack)
    }
}
