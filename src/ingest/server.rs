//! TCP front end: one task and one [`Session`] per agent connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::session::{IngestError, Session, SessionStatus};
use crate::aggregation::registry::WindowRegistry;
use crate::error::FailureKind;
use crate::export::health::HealthMetrics;

/// Settings shared by every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_message_size: usize,
    pub read_buffer_size: usize,
}

/// Accepts agent connections and feeds their bytes into sessions.
pub struct IngestServer {
    listener: TcpListener,
    registry: Arc<WindowRegistry>,
    health: Arc<HealthMetrics>,
    limits: ConnectionLimits,
}

impl IngestServer {
    /// Bind the listener. Use port 0 to pick a free port.
    pub async fn bind(
        addr: &str,
        registry: Arc<WindowRegistry>,
        health: Arc<HealthMetrics>,
        limits: ConnectionLimits,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("listening on {addr}"))?;
        Ok(Self {
            listener,
            registry,
            health,
            limits,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("getting local address")
    }

    /// Accept connections until `ctx` is cancelled. Open connections are
    /// cancelled with it and have settled their contributors by the time
    /// this returns.
    pub async fn run(self, ctx: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "ingest server started");
        }
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    let open = connections.len();
                    while connections.join_next().await.is_some() {}
                    info!(closed = open, "ingest server stopped");
                    return;
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accepting connection failed");
                            continue;
                        }
                    };
                    self.health.connections_total.inc();
                    self.health.connections_active.inc();

                    let session = Session::new(
                        Arc::clone(&self.registry),
                        self.limits.max_message_size,
                    )
                    .with_metrics(Arc::clone(&self.health));
                    let health = Arc::clone(&self.health);
                    let read_buffer_size = self.limits.read_buffer_size;
                    let conn_ctx = ctx.child_token();

                    connections.spawn(async move {
                        debug!(peer = %peer, "connection opened");
                        match serve_connection(stream, session, &health, read_buffer_size, conn_ctx)
                            .await
                        {
                            Ok(()) => debug!(peer = %peer, "connection closed"),
                            Err(e) => match e.failure_kind() {
                                FailureKind::Client => {
                                    warn!(peer = %peer, error = %e, "rejected recording stream");
                                }
                                FailureKind::Server => {
                                    error!(peer = %peer, error = %e, "connection failed");
                                }
                            },
                        }
                        health.connections_active.dec();
                    });
                }
            }
        }
    }
}

/// Pump one connection into `session` until the stream ends or fails.
pub async fn serve_connection(
    mut stream: TcpStream,
    mut session: Session,
    health: &HealthMetrics,
    read_buffer_size: usize,
    ctx: CancellationToken,
) -> Result<(), IngestError> {
    let mut buf = vec![0u8; read_buffer_size.max(1)];

    loop {
        let read = tokio::select! {
            _ = ctx.cancelled() => {
                return session.close();
            }
            read = stream.read(&mut buf) => read,
        };

        let n = match read {
            Ok(n) => n,
            Err(e) => {
                let err = IngestError::Io(e);
                session.abort(&err);
                return Err(err);
            }
        };
        if n == 0 {
            return session.close();
        }
        health.bytes_received.inc_by(n as f64);

        let data = buf.get(..n).unwrap_or_default();
        if session.feed(data)? == SessionStatus::Finished {
            debug!(chunks = session.chunks(), "end of stream, awaiting close");
        }
    }
}
