//! Worker side of the bridge.
//!
//! The host side (spawning, readiness, sessions) lives in supervisor.rs and
//! bridge/session.rs. This module is what a worker binary runs: a TCP accept
//! loop that greets every connection, then serves requests one at a time
//! through a [`WorkerHandler`].
//!
//! Each connection gets its own handler state (`Connection`), which is
//! dropped when the host disconnects. A `shutdown` request on any connection
//! is acknowledged and then stops the whole worker.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{Command, RequestFrame, ResponseFrame, Shutdown, WorkerInfo};
use crate::error::RemoteFailure;
use crate::version::PROTOCOL_VERSION;

/// Command handler for a worker process.
#[async_trait::async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    /// Per-connection state, e.g. that connection's identity caches.
    type Connection: Send;

    fn open(&self) -> Self::Connection;

    /// Handle one command. `shutdown` never reaches the handler.
    async fn handle(
        &self,
        connection: &mut Self::Connection,
        command: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, RemoteFailure>;
}

/// Bind the loopback port the host told us to use and serve until shutdown.
pub async fn run_worker<H: WorkerHandler>(
    handler: Arc<H>,
    port: u16,
    info: WorkerInfo,
) -> io::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await?;
    serve(listener, handler, info).await
}

/// Accept connections on `listener` until a `shutdown` request arrives.
pub async fn serve<H: WorkerHandler>(
    listener: TcpListener,
    handler: Arc<H>,
    info: WorkerInfo,
) -> io::Result<()> {
    let shutdown = CancellationToken::new();
    tracing::info!(
        addr = %listener.local_addr()?,
        worker = %info.name,
        instance = %info.instance,
        "Worker listening"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer, "Host connected");
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&handler),
                    info.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }

    tracing::info!("Worker exiting");
    Ok(())
}

async fn serve_connection<H: WorkerHandler>(
    stream: TcpStream,
    handler: Arc<H>,
    info: WorkerInfo,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec::<RequestFrame>::new());
    let mut writer = FramedWrite::new(write_half, FrameCodec::<ResponseFrame>::new());

    let greeting = ResponseFrame::Ready {
        protocol_version: PROTOCOL_VERSION,
        worker: info,
    };
    if let Err(e) = writer.send(greeting).await {
        tracing::warn!(error = %e, "Failed to send greeting");
        return;
    }

    let mut connection = handler.open();

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };

        let RequestFrame { command, payload } = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Bad request frame, dropping connection");
                break;
            }
            None => {
                tracing::debug!("Host closed connection");
                break;
            }
        };

        if command == Shutdown::NAME {
            tracing::info!("Shutdown requested");
            let _ = writer
                .send(ResponseFrame::Ok {
                    result: serde_json::Value::Null,
                })
                .await;
            shutdown.cancel();
            break;
        }

        let started = Instant::now();
        // The host never pipelines, so anything readable while a command
        // runs means it went away (or misbehaved). Either way the work is
        // abandoned.
        let outcome = tokio::select! {
            outcome = handler.handle(&mut connection, &command, payload) => outcome,
            early = reader.next() => {
                match early {
                    Some(Ok(frame)) => tracing::warn!(
                        command = %frame.command,
                        "Request arrived before previous response, dropping connection"
                    ),
                    _ => tracing::debug!(%command, "Host disconnected mid-request, abandoning"),
                }
                break;
            }
        };

        let response = match outcome {
            Ok(result) => ResponseFrame::Ok { result },
            Err(failure) => {
                tracing::debug!(%command, error = %failure.message, "Command failed");
                ResponseFrame::Error(failure)
            }
        };
        tracing::debug!(
            %command,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Handled request"
        );

        if let Err(e) = writer.send(response).await {
            tracing::warn!(error = %e, "Failed to send response");
            break;
        }
    }
}
