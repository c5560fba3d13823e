//! Replication listener
//!
//! Accepts peer connections on a tokio listener. Each connection gets its
//! own blocking worker that reads the startup packet and runs one session
//! to completion. Ctrl-C asks every session to drain, and sessions still
//! running after the drain period are stopped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::errors::{ReplicationError, ReplicationResult};
use super::protocol::{error_response, StartupPacket};
use super::session::{ReplicationSession, SenderContext};
use super::transport::TcpTransport;
use crate::observability::{log_event_with_fields, Event};

/// How often slot positions are made durable.
const SLOT_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for sessions to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long sessions get to stop once the drain period is over.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Startup read bound when the sender timeout is disabled.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct ReplicationServer {
    ctx: SenderContext,
    bind_addr: String,
}

impl ReplicationServer {
    pub fn new(ctx: SenderContext, bind_addr: impl Into<String>) -> Self {
        Self {
            ctx,
            bind_addr: bind_addr.into(),
        }
    }

    pub fn context(&self) -> &SenderContext {
        &self.ctx
    }

    pub async fn bind(&self) -> ReplicationResult<TcpListener> {
        let addr: SocketAddr = self.bind_addr.parse().map_err(|_| {
            ReplicationError::configuration_error(format!(
                "invalid listen address \"{}\"",
                self.bind_addr
            ))
        })?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| ReplicationError::io("could not bind replication listener", &e))
    }

    /// Serve until Ctrl-C.
    pub async fn run(&self) -> ReplicationResult<()> {
        let listener = self.bind().await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = stop_tx.send(true);
            }
        });
        self.serve(listener, stop_rx).await
    }

    /// Serve on `listener` until `stop` turns true.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut stop: watch::Receiver<bool>,
    ) -> ReplicationResult<()> {
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.bind_addr.clone());
        let max = self.ctx.registry.max_senders().to_string();
        log_event_with_fields(
            Event::ServerListening,
            &[("addr", &local), ("max_senders", &max)],
        );

        let mut checkpoint = tokio::time::interval(SLOT_CHECKPOINT_INTERVAL);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(stream, peer),
                    Err(e) => {
                        let error = e.to_string();
                        log_event_with_fields(Event::SenderRejected, &[("error", &error)]);
                    }
                },
                _ = checkpoint.tick() => {
                    if let Err(e) = self.ctx.slots.checkpoint() {
                        log_event_with_fields(Event::SenderExit, &[("slot_checkpoint", &e.message)]);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Let sessions send what is flushed, then force the stragglers out.
    async fn shutdown(&self) {
        self.ctx.registry.request_last_cycle();
        if !self.wait_for_sessions(DRAIN_TIMEOUT).await {
            self.ctx.registry.request_shutdown();
            self.wait_for_sessions(STOP_TIMEOUT).await;
        }
        let _ = self.ctx.slots.checkpoint();
        let remaining = self.ctx.registry.active_count().to_string();
        log_event_with_fields(Event::ServerShutdown, &[("remaining_sessions", &remaining)]);
    }

    async fn wait_for_sessions(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.ctx.registry.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        let ctx = self.ctx.clone();
        tokio::task::spawn_blocking(move || {
            let peer = peer.to_string();
            if let Err(e) = serve_connection(ctx, stream) {
                log_event_with_fields(
                    Event::SenderExit,
                    &[("peer", &peer), ("error", &e.message)],
                );
            }
        });
    }
}

/// Bound on the wait for a startup packet.
fn startup_timeout(ctx: &SenderContext) -> Duration {
    if ctx.config.timeout_enabled() {
        ctx.config.sender_timeout
    } else {
        STARTUP_TIMEOUT
    }
}

/// Blocking half of a connection: startup packet, then the session.
fn serve_connection(ctx: SenderContext, stream: TcpStream) -> ReplicationResult<()> {
    let mut stream = stream
        .into_std()
        .map_err(|e| ReplicationError::io("could not detach socket", &e))?;
    stream
        .set_nonblocking(false)
        .map_err(|e| ReplicationError::io("could not configure socket", &e))?;

    // a silent peer must not hold the worker
    stream
        .set_read_timeout(Some(startup_timeout(&ctx)))
        .map_err(|e| ReplicationError::io("could not configure socket", &e))?;
    let startup = StartupPacket::read(&mut stream)?;
    stream
        .set_read_timeout(None)
        .map_err(|e| ReplicationError::io("could not configure socket", &e))?;
    let socket = stream
        .try_clone()
        .map_err(|e| ReplicationError::io("could not clone socket", &e))?;
    let mut session = match ReplicationSession::start_with(ctx, &startup, move |latch| {
        TcpTransport::new(socket, latch)
    }) {
        Ok(session) => session,
        Err(e) => {
            use std::io::Write;
            let _ = stream.write_all(&error_response(e.sqlstate(), &e.message).encode());
            return Err(e);
        }
    };
    session.run().map(|_| ())
}
