//! Session transports
//!
//! A session only ever polls its transport. Reads never block, writes are
//! queued and pushed out by [`Transport::flush`]. The session decides when
//! to sleep, on its own latch, which the transport sets when input arrives.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::clock::Latch;
use super::errors::{ReplicationError, ReplicationResult};
use super::protocol::{read_frame, Frame};

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    /// Nothing available right now.
    Empty,
    /// Peer closed the connection.
    Eof,
}

/// Connection to one peer.
pub trait Transport: Send {
    fn try_recv(&mut self) -> ReplicationResult<Inbound>;

    /// Queue a frame for sending.
    fn send(&mut self, frame: Frame) -> ReplicationResult<()>;

    /// Push queued output. Leaves the remainder queued if the peer is slow.
    fn flush(&mut self) -> ReplicationResult<()>;

    /// Whether queued output remains after the last flush.
    fn has_pending(&self) -> bool;
}

/// One step of a scripted peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Frame(Frame),
    /// Report [`Inbound::Empty`] this many times.
    Idle(u32),
    Eof,
}

#[derive(Debug, Default)]
struct PeerState {
    script: VecDeque<ScriptStep>,
    delivered: Vec<Frame>,
    broken: bool,
    flushes: usize,
}

/// Handle a test keeps to feed and inspect a [`MemoryTransport`].
#[derive(Debug, Clone, Default)]
pub struct PeerHandle {
    state: Arc<Mutex<PeerState>>,
}

impl PeerHandle {
    pub fn push(&self, step: ScriptStep) {
        self.lock().script.push_back(step);
    }

    pub fn push_frame(&self, frame: Frame) {
        self.push(ScriptStep::Frame(frame));
    }

    /// Frames the session has flushed so far.
    pub fn delivered(&self) -> Vec<Frame> {
        self.lock().delivered.clone()
    }

    /// Drain and return delivered frames.
    pub fn take_delivered(&self) -> Vec<Frame> {
        std::mem::take(&mut self.lock().delivered)
    }

    /// Make every following flush fail.
    pub fn break_pipe(&self) {
        self.lock().broken = true;
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// In-process transport driven by a script. An exhausted script reads as
/// [`Inbound::Empty`] forever.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    peer: PeerHandle,
    pending: Vec<Frame>,
}

impl MemoryTransport {
    pub fn new() -> (Self, PeerHandle) {
        let peer = PeerHandle::default();
        (
            Self {
                peer: peer.clone(),
                pending: Vec::new(),
            },
            peer,
        )
    }

    pub fn with_script(steps: impl IntoIterator<Item = ScriptStep>) -> (Self, PeerHandle) {
        let (transport, peer) = Self::new();
        for step in steps {
            peer.push(step);
        }
        (transport, peer)
    }
}

impl Transport for MemoryTransport {
    fn try_recv(&mut self) -> ReplicationResult<Inbound> {
        let mut state = self.peer.lock();
        if let Some(ScriptStep::Idle(n)) = state.script.front_mut() {
            if *n > 1 {
                *n -= 1;
                return Ok(Inbound::Empty);
            }
        }
        Ok(match state.script.pop_front() {
            Some(ScriptStep::Frame(frame)) => Inbound::Frame(frame),
            Some(ScriptStep::Eof) => {
                // stay closed
                state.script.push_front(ScriptStep::Eof);
                Inbound::Eof
            }
            Some(ScriptStep::Idle(_)) | None => Inbound::Empty,
        })
    }

    fn send(&mut self, frame: Frame) -> ReplicationResult<()> {
        self.pending.push(frame);
        Ok(())
    }

    fn flush(&mut self) -> ReplicationResult<()> {
        let mut state = self.peer.lock();
        state.flushes += 1;
        if state.broken {
            return Err(ReplicationError::io(
                "could not send data to client",
                &io::Error::from(io::ErrorKind::BrokenPipe),
            ));
        }
        state.delivered.append(&mut self.pending);
        Ok(())
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

enum ReaderEvent {
    Frame(Frame),
    Eof,
    Failed(io::Error),
}

/// Socket transport. A reader thread decodes frames into a channel and
/// sets the session latch on each one.
pub struct TcpTransport {
    stream: TcpStream,
    inbound: Receiver<ReaderEvent>,
    outbound: Vec<u8>,
}

impl TcpTransport {
    /// Write timeout bounding one flush attempt.
    const WRITE_SLICE: Duration = Duration::from_millis(10);

    pub fn new(stream: TcpStream, latch: Arc<Latch>) -> ReplicationResult<Self> {
        let mut reader = stream
            .try_clone()
            .map_err(|e| ReplicationError::io("could not clone socket", &e))?;
        stream
            .set_write_timeout(Some(Self::WRITE_SLICE))
            .map_err(|e| ReplicationError::io("could not configure socket", &e))?;
        let _ = stream.set_nodelay(true);

        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("aerorepl-reader".to_string())
            .spawn(move || loop {
                let event = match read_frame(&mut reader) {
                    Ok(Some(frame)) => ReaderEvent::Frame(frame),
                    Ok(None) => ReaderEvent::Eof,
                    Err(e) => ReaderEvent::Failed(e),
                };
                let last = !matches!(event, ReaderEvent::Frame(_));
                if tx.send(event).is_err() {
                    return;
                }
                latch.set();
                if last {
                    return;
                }
            })
            .map_err(|e| ReplicationError::io("could not start socket reader", &e))?;

        Ok(Self {
            stream,
            inbound: rx,
            outbound: Vec::new(),
        })
    }
}

impl Transport for TcpTransport {
    fn try_recv(&mut self) -> ReplicationResult<Inbound> {
        match self.inbound.try_recv() {
            Ok(ReaderEvent::Frame(frame)) => Ok(Inbound::Frame(frame)),
            Ok(ReaderEvent::Eof) | Err(TryRecvError::Disconnected) => Ok(Inbound::Eof),
            Ok(ReaderEvent::Failed(e)) => Err(ReplicationError::io(
                "could not receive data from client",
                &e,
            )),
            Err(TryRecvError::Empty) => Ok(Inbound::Empty),
        }
    }

    fn send(&mut self, frame: Frame) -> ReplicationResult<()> {
        self.outbound.extend_from_slice(&frame.encode());
        Ok(())
    }

    fn flush(&mut self) -> ReplicationResult<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(ReplicationError::io(
                        "could not send data to client",
                        &io::Error::from(io::ErrorKind::WriteZero),
                    ))
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ReplicationError::io("could not send data to client", &e)),
            }
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        !self.outbound.is_empty()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::protocol::{command_complete, query};

    #[test]
    fn test_script_idle_then_frame_then_eof() {
        let (mut t, _peer) = MemoryTransport::with_script([
            ScriptStep::Idle(2),
            ScriptStep::Frame(query("IDENTIFY_SYSTEM")),
            ScriptStep::Eof,
        ]);
        assert_eq!(t.try_recv().unwrap(), Inbound::Empty);
        assert_eq!(t.try_recv().unwrap(), Inbound::Empty);
        assert!(matches!(t.try_recv().unwrap(), Inbound::Frame(_)));
        assert_eq!(t.try_recv().unwrap(), Inbound::Eof);
        assert_eq!(t.try_recv().unwrap(), Inbound::Eof);
    }

    #[test]
    fn test_exhausted_script_reads_empty() {
        let (mut t, _peer) = MemoryTransport::new();
        assert_eq!(t.try_recv().unwrap(), Inbound::Empty);
    }

    #[test]
    fn test_frames_delivered_on_flush_only() {
        let (mut t, peer) = MemoryTransport::new();
        t.send(command_complete("SELECT")).unwrap();
        assert!(t.has_pending());
        assert!(peer.delivered().is_empty());
        t.flush().unwrap();
        assert!(!t.has_pending());
        assert_eq!(peer.delivered().len(), 1);
    }

    #[test]
    fn test_broken_pipe_fails_flush() {
        let (mut t, peer) = MemoryTransport::new();
        peer.break_pipe();
        t.send(command_complete("SELECT")).unwrap();
        assert!(t.flush().is_err());
    }

    #[test]
    fn test_tcp_transport_reads_and_writes_frames() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let latch = Arc::new(Latch::new());
        let mut t = TcpTransport::new(server, latch.clone()).unwrap();

        client.write_all(&query("IDENTIFY_MODE").encode()).unwrap();
        assert!(latch.wait_timeout(Duration::from_secs(5)));
        match t.try_recv().unwrap() {
            Inbound::Frame(f) => assert_eq!(f.query_text().unwrap(), "IDENTIFY_MODE"),
            other => panic!("unexpected {:?}", other),
        }

        t.send(command_complete("SELECT")).unwrap();
        t.flush().unwrap();
        let frame = read_frame(&mut client).unwrap().unwrap();
        assert_eq!(frame.tag, b'C');

        drop(client);
        latch.wait_timeout(Duration::from_secs(5));
        assert_eq!(t.try_recv().unwrap(), Inbound::Eof);
    }
}
