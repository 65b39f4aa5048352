//! TCP accept loop (spec §6): one task per connection, each driving a
//! [`super::client::ClientActor`].

use crate::hub::SessionHub;
use crate::net::client::ClientActor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

pub async fn serve(hub: Arc<SessionHub>, host: &str, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    serve_on(hub, listener).await
}

/// Drive the accept loop on an already-bound listener, so callers that need
/// to distinguish a bind failure (spec §6 exit code 2) from an in-flight
/// accept-loop error can bind separately and call this directly.
pub async fn serve_on(hub: Arc<SessionHub>, listener: TcpListener) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "listening");

    loop {
        let (socket, addr) = listener.accept().await?;
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
        let hub = Arc::clone(&hub);
        info!(client_id, %addr, "client connected");
        tokio::spawn(async move {
            let actor = ClientActor::new(client_id, hub);
            if let Err(e) = actor.run(socket).await {
                error!(client_id, error = %e, "client session ended with error");
            }
        });
    }
}
