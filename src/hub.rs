//! `SessionHub` (spec §4.9): the arena+handle registry of every open
//! `ControllerSession`, plus which net clients are currently bound to each
//! one.
//!
//! Design Notes §9 calls for an arena+handle pattern rather than clients
//! holding direct references: a port's `SessionHandle` is stable across a
//! session's entire lifetime (including client disconnect/reconnect, spec
//! scenario S6), even though the underlying `ControllerSession` and its
//! serial link may be torn down and reopened.

use crate::config::Config;
use crate::controllers::{ControllerKind, PortInfo};
use crate::error::CoreError;
use crate::net::Broadcaster;
use crate::session::event_trigger::EventTrigger;
use crate::session::jog::JogLoopConfig;
use crate::session::status::{StatusAggregator, StatusSnapshot};
use crate::session::ControllerSession;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub type SessionHandle = u64;
pub type ClientId = u64;

struct Registry {
    by_handle: HashMap<SessionHandle, Arc<ControllerSession>>,
    by_port: HashMap<String, SessionHandle>,
    bound_clients: HashMap<SessionHandle, HashSet<ClientId>>,
}

/// The process-wide registry of sessions. One instance, shared by the net
/// layer and any CLI-driven startup triggers.
pub struct SessionHub {
    registry: Mutex<Registry>,
    next_handle: AtomicU64,
    status: Arc<Mutex<StatusAggregator>>,
    event_trigger: Arc<EventTrigger>,
    continue_on_error: bool,
    jog_config: JogLoopConfig,
    broadcaster: Broadcaster,
}

impl SessionHub {
    pub fn new(config: &Config) -> Self {
        SessionHub {
            registry: Mutex::new(Registry {
                by_handle: HashMap::new(),
                by_port: HashMap::new(),
                bound_clients: HashMap::new(),
            }),
            status: Arc::new(Mutex::new(StatusAggregator::new())),
            event_trigger: Arc::new(EventTrigger::new(config.trigger_rules.clone())),
            continue_on_error: config.continue_on_error,
            jog_config: config.jog.clone().into(),
            next_handle: AtomicU64::new(1),
            broadcaster: Broadcaster::new(),
        }
    }

    pub fn status_aggregator(&self) -> Arc<Mutex<StatusAggregator>> {
        Arc::clone(&self.status)
    }

    /// The process-wide client push registry (spec §4.8/§4.9): net/client.rs
    /// registers each connection's outbound channel here, and every
    /// `ControllerSession` pushes through the clone handed to it at open.
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    pub fn event_trigger(&self) -> &EventTrigger {
        &self.event_trigger
    }

    pub fn list_ports(&self) -> Vec<PortInfo> {
        crate::controllers::list_ports()
    }

    /// Open (or re-open) the session for `port`. The handle for a given
    /// port is stable: a previously-closed session's handle is reused
    /// rather than minted fresh, so bound clients never need to re-resolve
    /// it after a reconnect.
    pub async fn open_session(
        &self,
        port: &str,
        kind: ControllerKind,
        baud_rate: u32,
    ) -> Result<SessionHandle, CoreError> {
        let handle = {
            let mut reg = self.registry.lock().await;
            if let Some(&handle) = reg.by_port.get(port) {
                handle
            } else {
                let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
                let session = Arc::new(ControllerSession::new(
                    port,
                    kind,
                    handle,
                    Arc::clone(&self.status),
                    Arc::clone(&self.event_trigger),
                    self.continue_on_error,
                    self.jog_config.clone(),
                    self.broadcaster.clone(),
                ));
                reg.by_handle.insert(handle, session);
                reg.by_port.insert(port.to_string(), handle);
                reg.bound_clients.insert(handle, HashSet::new());
                handle
            }
        };

        let session = self.session(handle).await.expect("just inserted");
        session.open(baud_rate).await?;
        info!(port, handle, "session opened");
        Ok(handle)
    }

    pub async fn close_session(&self, handle: SessionHandle) -> Result<(), CoreError> {
        let session = self.session(handle).await.ok_or(CoreError::NotOpen)?;
        session.close().await
    }

    pub async fn session(&self, handle: SessionHandle) -> Option<Arc<ControllerSession>> {
        self.registry.lock().await.by_handle.get(&handle).cloned()
    }

    pub async fn handle_for_port(&self, port: &str) -> Option<SessionHandle> {
        self.registry.lock().await.by_port.get(port).copied()
    }

    pub async fn bind_client(&self, handle: SessionHandle, client: ClientId) {
        let mut reg = self.registry.lock().await;
        reg.bound_clients.entry(handle).or_default().insert(client);
        drop(reg);
        self.broadcaster.bind(handle, client).await;
    }

    pub async fn unbind_client(&self, handle: SessionHandle, client: ClientId) {
        let mut reg = self.registry.lock().await;
        if let Some(set) = reg.bound_clients.get_mut(&handle) {
            set.remove(&client);
        }
        drop(reg);
        self.broadcaster.unbind(handle, client).await;
    }

    /// Remove a client from every session it was bound to (on disconnect).
    pub async fn drop_client(&self, client: ClientId) {
        let mut reg = self.registry.lock().await;
        for set in reg.bound_clients.values_mut() {
            set.remove(&client);
        }
        drop(reg);
        self.broadcaster.drop_client(client).await;
    }

    pub async fn bound_clients(&self, handle: SessionHandle) -> Vec<ClientId> {
        self.registry
            .lock()
            .await
            .bound_clients
            .get(&handle)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn get_status(&self, port: &str) -> Option<StatusSnapshot> {
        self.status.lock().await.get_status(port)
    }

    pub async fn get_all_statuses(&self) -> Vec<StatusSnapshot> {
        self.status.lock().await.get_all_statuses()
    }
}

// These exercise the handle-arena and client-binding logic against the
// in-memory stub transport (`serial` feature off); with real hardware
// backing `SerialLink::open`, the port paths below wouldn't resolve.
#[cfg(all(test, not(feature = "serial")))]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::default()
    }

    #[tokio::test]
    async fn opening_the_same_port_twice_reuses_the_handle() {
        let hub = SessionHub::new(&test_config());
        let h1 = hub.open_session("/dev/ttyUSB0", ControllerKind::Grbl, 115_200).await.unwrap();
        let h2 = hub.open_session("/dev/ttyUSB0", ControllerKind::Grbl, 115_200).await.unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn different_ports_get_different_handles() {
        let hub = SessionHub::new(&test_config());
        let h1 = hub.open_session("/dev/ttyUSB0", ControllerKind::Grbl, 115_200).await.unwrap();
        let h2 = hub.open_session("/dev/ttyUSB1", ControllerKind::Grbl, 115_200).await.unwrap();
        assert_ne!(h1, h2);
    }

    #[tokio::test]
    async fn client_binding_and_drop() {
        let hub = SessionHub::new(&test_config());
        let h = hub.open_session("/dev/ttyUSB0", ControllerKind::Grbl, 115_200).await.unwrap();
        hub.bind_client(h, 42).await;
        assert_eq!(hub.bound_clients(h).await, vec![42]);
        hub.drop_client(42).await;
        assert!(hub.bound_clients(h).await.is_empty());
    }
}
