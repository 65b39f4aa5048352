//! Fan-out from session state changes to subscribed clients (spec §4.8
//! "Emits `machine:status` broadcast on any field change", §4.9's push
//! list). A `Broadcaster` is a cheap `Clone` handle shared by the
//! `SessionHub` (which registers/binds clients) and every
//! `ControllerSession` (which pushes events); neither owns the other, so
//! cloning this handle around avoids the `Hub <-> ControllerSession` `Arc`
//! reference cycle a direct back-pointer would create.

use crate::hub::{ClientId, SessionHandle};
use crate::net::protocol::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub type ClientSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Default)]
struct BroadcasterState {
    senders: HashMap<ClientId, ClientSender>,
    bound: HashMap<SessionHandle, HashSet<ClientId>>,
}

/// Cloneable handle onto the process-wide client push registry.
#[derive(Clone, Default)]
pub struct Broadcaster {
    inner: Arc<Mutex<BroadcasterState>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client's outbound channel. Called once per connection, not
    /// per `Subscribe` — a client can push-subscribe to a session handle
    /// before or after this, `bind`/`unbind` is the thing that controls
    /// whether pushes actually reach it.
    pub async fn register_client(&self, id: ClientId, tx: ClientSender) {
        self.inner.lock().await.senders.insert(id, tx);
    }

    pub async fn bind(&self, handle: SessionHandle, client: ClientId) {
        self.inner.lock().await.bound.entry(handle).or_default().insert(client);
    }

    pub async fn unbind(&self, handle: SessionHandle, client: ClientId) {
        if let Some(set) = self.inner.lock().await.bound.get_mut(&handle) {
            set.remove(&client);
        }
    }

    /// Remove a client entirely (on disconnect), from every handle it was
    /// bound to.
    pub async fn drop_client(&self, client: ClientId) {
        let mut state = self.inner.lock().await;
        state.senders.remove(&client);
        for set in state.bound.values_mut() {
            set.remove(&client);
        }
    }

    /// Push `event` to every client currently bound to `handle`. A client
    /// whose channel is closed (disconnected, not yet reaped by
    /// `drop_client`) is silently skipped.
    pub async fn push(&self, handle: SessionHandle, event: ServerEvent) {
        let state = self.inner.lock().await;
        let Some(ids) = state.bound.get(&handle) else { return };
        for id in ids {
            if let Some(tx) = state.senders.get(id) {
                let _ = tx.send(event.clone());
            }
        }
    }
}
