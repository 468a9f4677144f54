// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use msd_proto::SocketLocation;
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::{StreamExt, wrappers::UnixListenerStream};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::auth::PeerCredentials;
use crate::session::{DaemonContext, handle_client};

pub struct DaemonServer {
    location: SocketLocation,
    listener: Option<UnixListener>,
    context: Arc<DaemonContext>,
}

impl DaemonServer {
    /// Bind the listening socket. Must be called from within a tokio runtime.
    pub fn new(location: SocketLocation, context: Arc<DaemonContext>) -> Result<Self> {
        debug!(operation = "server_bind_socket", socket = %location, "Binding Unix socket listener");
        let listener = location
            .bind()
            .with_context(|| format!("Failed to bind socket: {location}"))?;
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;

        info!(operation = "start_server", socket = %location, "Daemon listening on socket");
        Ok(Self {
            location,
            listener: Some(listener),
            context,
        })
    }

    pub fn location(&self) -> &SocketLocation {
        &self.location
    }

    pub async fn run(&mut self) -> Result<()> {
        let listener = self.listener.take().ok_or_else(|| anyhow!("Server not initialized"))?;
        let mut stream = UnixListenerStream::new(listener);

        info!(operation = "server_running", "Mass storage daemon started");

        let mut connection_count = 0u64;
        while let Some(stream) = stream.next().await {
            connection_count += 1;
            match stream {
                Ok(socket) => {
                    debug!(operation = "server_accept_connection", connection_count, "Accepted new client connection");
                    let context = self.context.clone();
                    tokio::spawn(
                        async move {
                            if let Err(e) = serve_connection(context, socket).await {
                                error!(operation = "handle_client", error = %format!("{e:#}"), "Error handling client");
                            } else {
                                debug!(operation = "handle_client", "Client connection closed");
                            }
                        }
                        .instrument(info_span!("connection", connection_count)),
                    );
                }
                Err(e) => {
                    warn!(operation = "accept_connection", error = %e, connection_count, "Error accepting connection");
                }
            }
        }

        debug!(operation = "server_run_loop_exit", total_connections = connection_count, "Server run loop exited");
        Ok(())
    }

    pub async fn shutdown(self) -> Result<()> {
        info!(operation = "shutdown", "Shutting down daemon");
        if let SocketLocation::Path(path) = &self.location {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(operation = "shutdown_remove_socket", socket = %path.display(), "Socket file removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to remove socket: {}", path.display())),
            }
        }
        Ok(())
    }
}

/// Sessions use blocking I/O for descriptor passing, so each one gets a
/// blocking thread of its own.
async fn serve_connection(context: Arc<DaemonContext>, socket: UnixStream) -> Result<()> {
    let cred = socket.peer_cred().context("Failed to read peer credentials")?;
    let peer = PeerCredentials {
        pid: cred.pid(),
        uid: cred.uid(),
        gid: cred.gid(),
    };
    let span = info_span!("peer", pid = ?peer.pid, uid = peer.uid, gid = peer.gid);
    debug!(parent: &span, operation = "serve_connection", "Peer connected");

    let mut stream = socket.into_std()?;
    stream.set_nonblocking(false)?;

    tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        handle_client(&context, &mut stream, &peer)
    })
    .await
    .context("Session task panicked")?
}
