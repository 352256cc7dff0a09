//! One request/response connection to the worker.
//!
//! A [`Session`] owns a TCP connection and the identity caches for everything
//! decoded over it. Requests are strictly sequential: `send` takes `&mut self`,
//! so a second request cannot be issued before the first one's response has
//! been read.
//!
//! Any transport or framing failure breaks the session, and so does dropping a
//! `send` future before its response was read. Later sends fail fast with
//! [`Error::Protocol`] and the caller is expected to open a new session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{Command, RequestFrame, ResponseFrame, WorkerInfo};
use crate::error::{Error, Result};
use crate::identity::SessionCache;
use crate::supervisor::StateCell;
use crate::tree::Tree;
use crate::tree::wire::{self, WireTree};
use crate::version::PROTOCOL_VERSION;

pub struct Session {
    reader: FramedRead<OwnedReadHalf, FrameCodec<ResponseFrame>>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec<RequestFrame>>,
    worker: WorkerInfo,
    peer: SocketAddr,
    cache: Arc<SessionCache>,
    request_timeout: Duration,
    broken: Option<String>,
    state: Option<Arc<StateCell>>,
}

impl Session {
    /// Connect to a worker listening on `addr` and wait for its greeting.
    pub async fn connect(addr: SocketAddr, request_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::handshake(stream, request_timeout).await
    }

    /// Read the `ready` greeting on an already connected stream.
    pub async fn handshake(stream: TcpStream, request_timeout: Duration) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::<ResponseFrame>::new());
        let writer = FramedWrite::new(write_half, FrameCodec::<RequestFrame>::new());

        let greeting = tokio::time::timeout(request_timeout, reader.next())
            .await
            .map_err(|_| {
                Error::protocol(format!("no greeting from {peer} within {request_timeout:?}"))
            })?;

        let worker = match greeting {
            Some(Ok(ResponseFrame::Ready {
                protocol_version,
                worker,
            })) => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(Error::protocol(format!(
                        "worker speaks protocol {protocol_version}, expected {PROTOCOL_VERSION}"
                    )));
                }
                worker
            }
            Some(Ok(other)) => {
                return Err(Error::protocol(format!(
                    "expected ready greeting, got {other:?}"
                )));
            }
            Some(Err(e)) => return Err(Error::protocol(format!("bad greeting frame: {e}"))),
            None => return Err(Error::protocol("worker closed the connection before greeting")),
        };

        tracing::debug!(
            %peer,
            worker = %worker.name,
            worker_version = %worker.version,
            instance = %worker.instance,
            "Session established"
        );

        Ok(Self {
            reader,
            writer,
            worker,
            peer,
            cache: Arc::new(SessionCache::new()),
            request_timeout,
            broken: None,
            state: None,
        })
    }

    /// Report transport loss to the supervisor that owns the worker.
    pub(crate) fn attach(mut self, state: Arc<StateCell>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn worker(&self) -> &WorkerInfo {
        &self.worker
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    /// Send one command and wait for its response.
    ///
    /// A worker-side failure comes back as [`Error::RemoteExecution`] and
    /// leaves the session usable. Everything else breaks it.
    pub async fn send<C: Command>(&mut self, command: &C) -> Result<C::Output> {
        if let Some(ref reason) = self.broken {
            return Err(Error::protocol(format!(
                "session is unusable after an earlier failure: {reason}"
            )));
        }

        let payload = serde_json::to_value(command)
            .map_err(|e| Error::protocol(format!("failed to encode {} payload: {e}", C::NAME)))?;

        let started = Instant::now();
        let result = self.exchange(C::NAME, payload).await?;
        tracing::debug!(
            command = C::NAME,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Command completed"
        );

        serde_json::from_value(result)
            .map_err(|e| self.fail(format!("malformed {} result: {e}", C::NAME)))
    }

    async fn exchange(
        &mut self,
        command: &'static str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let frame = RequestFrame {
            command: command.to_string(),
            payload,
        };
        // Stays set if this future is dropped before the response arrives;
        // that response would otherwise be read as the answer to the next request.
        self.broken = Some(format!("{command} request was abandoned mid-flight"));
        if let Err(e) = self.writer.send(frame).await {
            return Err(self.lose_transport(format!("failed to send {command}: {e}")));
        }

        let response = match tokio::time::timeout(self.request_timeout, self.reader.next()).await {
            Err(_) => {
                return Err(self.fail(format!(
                    "no response to {command} within {:?}",
                    self.request_timeout
                )));
            }
            Ok(None) => {
                return Err(self.lose_transport(format!(
                    "worker closed the connection during {command}"
                )));
            }
            Ok(Some(Err(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(self.fail(format!("malformed response to {command}: {e}")));
            }
            Ok(Some(Err(e))) => {
                return Err(self.lose_transport(format!("connection error during {command}: {e}")));
            }
            Ok(Some(Ok(frame))) => frame,
        };
        self.broken = None;

        match response {
            ResponseFrame::Ok { result } => Ok(result),
            ResponseFrame::Error(failure) => {
                tracing::debug!(command, error = %failure.message, "Worker reported failure");
                Err(Error::RemoteExecution(failure))
            }
            ResponseFrame::Ready { .. } => {
                Err(self.fail(format!("unexpected ready frame in response to {command}")))
            }
        }
    }

    /// Decode a tree the worker sent, through this session's caches.
    pub fn decode_tree(&mut self, tree: &WireTree) -> Result<Tree> {
        match wire::decode(tree, &self.cache) {
            Err(Error::Protocol(reason)) => Err(self.fail(reason)),
            other => other,
        }
    }

    fn fail(&mut self, reason: String) -> Error {
        tracing::warn!(peer = %self.peer, %reason, "Session broken");
        self.broken = Some(reason.clone());
        Error::Protocol(reason)
    }

    /// The connection itself is gone; the worker may be too.
    fn lose_transport(&mut self, reason: String) -> Error {
        if let Some(ref state) = self.state {
            state.fail_if_ready();
        }
        self.fail(reason)
    }

    /// Close the connection. The worker drops its per-session state.
    pub async fn close(mut self) -> Result<()> {
        if self.broken.is_none() {
            self.writer.close().await?;
        }
        tracing::debug!(peer = %self.peer, "Session closed");
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("worker", &self.worker)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
