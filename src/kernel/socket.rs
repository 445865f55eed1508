//! Socket connection manager
//!
//! Sockets give unrelated processes a bidirectional byte stream through a
//! port-based rendezvous. A socket starts unbound and makes exactly one
//! irreversible move:
//!
//! ```text
//!   Unbound ──┬──> Listener   (listen: published in the port map)
//!             └──> Peer       (paired by an accept/connect rendezvous)
//! ```
//!
//! A listener owns a FIFO queue of pending connection requests. Accept
//! blocks while the queue is empty; connect appends a request, wakes the
//! listener, and blocks (with a timeout) until the request is admitted.
//! On admission, accept builds two one-way pipe channels and wires them
//! crosswise between the connector's socket and a freshly allocated
//! endpoint, turning both into peers.
//!
//! Control blocks are reference counted: accept pins the listener across
//! its wait and handoff, and a queued request pins the requesting socket,
//! so a concurrent close can unpublish a port or shut down pipes but
//! never frees a block somebody still references.

use super::object::KernelObject;
use super::pipe::{PipeChannel, PipeError};
use super::process::{Fd, Handle, Pid};
use super::sync::{Condv, SchedClass};
use super::{KernelState, Sys};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Socket identifier (internal to the kernel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub usize);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock:{}", self.0)
    }
}

/// A port number. `Port::NONE` is the reserved "no port" sentinel: a
/// socket may carry it, but it can never be listened on or connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port(pub u16);

impl Port {
    pub const NONE: Port = Port(0);
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port:{}", self.0)
    }
}

/// Which half of a peer connection to shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Read,
    Write,
    Both,
}

/// Error types for socket operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Port outside the valid range, or the no-port sentinel
    BadPort,
    /// Fd does not resolve to a socket
    BadHandle,
    /// Listen on a socket carrying the no-port sentinel
    NoPort,
    /// Socket already made its one-way transition
    AlreadyBound,
    /// Another listener occupies the port
    PortBusy,
    /// Accept on something that is not a live listener
    NotListener,
    /// No listener published at the target port
    ConnectionRefused,
    /// Connect was not admitted in time
    TimedOut,
    /// Operation needs a connected peer (or an open half of one)
    NotConnected,
    /// Write with no reader left on the far side
    BrokenPipe,
    /// File or object table exhausted
    TableFull,
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketError::BadPort => write!(f, "invalid port"),
            SocketError::BadHandle => write!(f, "not a socket"),
            SocketError::NoPort => write!(f, "socket has no port"),
            SocketError::AlreadyBound => write!(f, "socket already bound"),
            SocketError::PortBusy => write!(f, "port already has a listener"),
            SocketError::NotListener => write!(f, "not a listening socket"),
            SocketError::ConnectionRefused => write!(f, "connection refused"),
            SocketError::TimedOut => write!(f, "connection timed out"),
            SocketError::NotConnected => write!(f, "socket not connected"),
            SocketError::BrokenPipe => write!(f, "broken pipe"),
            SocketError::TableFull => write!(f, "file table full"),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<PipeError> for SocketError {
    fn from(err: PipeError) -> Self {
        match err {
            PipeError::BrokenPipe => SocketError::BrokenPipe,
            PipeError::Closed => SocketError::NotConnected,
        }
    }
}

/// Result type for socket operations
pub type SocketResult<T> = Result<T, SocketError>;

/// Identifier of a queued connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub usize);

/// A pending connection request, queued on a listener until an accept
/// admits it or the connector abandons it.
pub struct ConnRequest {
    /// The requesting socket (pinned by this request)
    pub peer: SocketId,
    /// Set by accept under the kernel lock
    pub admitted: bool,
    /// Broadcast once admitted
    pub connected_cv: Condv,
}

/// The three shapes a socket can take.
pub enum SocketKind {
    /// Fresh socket; no irreversible transition yet
    Unbound,
    /// Published in the port map, queueing connection requests
    Listener {
        queue: VecDeque<RequestId>,
        req_available: Condv,
    },
    /// One endpoint of an established connection. Each half can be shut
    /// down independently.
    Peer {
        read_pipe: Option<Arc<PipeChannel>>,
        write_pipe: Option<Arc<PipeChannel>>,
    },
}

/// Socket control block.
pub struct SocketCb {
    /// Port recorded at creation; reset to the sentinel on listener close
    pub port: Port,
    /// Outstanding rendezvous references (accept pin, queued requests)
    pub refcount: u32,
    /// Back-reference to the object table entry
    pub handle: Handle,
    /// Storage release deferred until the refcount drains
    pub closing: bool,
    /// Current shape
    pub kind: SocketKind,
}

impl SocketCb {
    fn new(port: Port) -> Self {
        Self {
            port,
            refcount: 0,
            handle: Handle(0),
            closing: false,
            kind: SocketKind::Unbound,
        }
    }
}

/// The port map: at most one listener per port, for the kernel's
/// lifetime. Built at boot, cleared at shutdown.
pub struct PortMap {
    entries: Vec<Option<SocketId>>,
}

impl PortMap {
    pub fn new(max_port: u16) -> Self {
        Self {
            entries: vec![None; max_port as usize + 1],
        }
    }

    pub fn get(&self, port: Port) -> Option<SocketId> {
        self.entries.get(port.0 as usize).copied().flatten()
    }

    pub fn publish(&mut self, port: Port, sid: SocketId) {
        let slot = &mut self.entries[port.0 as usize];
        assert!(slot.is_none(), "port already has a listener");
        *slot = Some(sid);
    }

    pub fn unpublish(&mut self, port: Port) -> Option<SocketId> {
        self.entries[port.0 as usize].take()
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|slot| *slot = None);
    }
}

impl Sys {
    /// Allocate a new socket with `port` recorded (not yet bound).
    pub fn socket(&self, port: Port) -> SocketResult<Fd> {
        let mut st = self.kernel.lock();
        if port.0 > st.config.max_port {
            return Err(SocketError::BadPort);
        }
        alloc_socket(&mut st, self.pid, port).map(|(fd, _)| fd)
    }

    /// Turn an unbound socket into the listener for its port.
    pub fn listen(&self, fd: Fd) -> SocketResult<()> {
        let mut st = self.kernel.lock();
        let sid = resolve(&st, self.pid, fd)?;
        let scb = st.sockets.get(sid.0).ok_or(SocketError::BadHandle)?;
        if scb.port == Port::NONE {
            return Err(SocketError::NoPort);
        }
        if !matches!(scb.kind, SocketKind::Unbound) {
            return Err(SocketError::AlreadyBound);
        }
        let port = scb.port;
        if st.port_map.get(port).is_some() {
            return Err(SocketError::PortBusy);
        }

        let scb = st.sockets.get_mut(sid.0).expect("checked above");
        scb.kind = SocketKind::Listener {
            queue: VecDeque::new(),
            req_available: Condv::new(),
        };
        st.port_map.publish(port, sid);
        log::debug!("{sid} listening on {port}");
        Ok(())
    }

    /// Wait for a connection request and establish the connection.
    ///
    /// Returns the fd of a brand-new peer socket wired to the oldest
    /// pending connector (strict FIFO). Fails rather than spinning when a
    /// concurrent close unpublishes the port mid-wait.
    pub fn accept(&self, fd: Fd) -> SocketResult<Fd> {
        let mut st = self.kernel.lock();
        let lsid = resolve(&st, self.pid, fd)?;
        {
            let scb = st.sockets.get(lsid.0).ok_or(SocketError::BadHandle)?;
            if scb.port == Port::NONE || !matches!(scb.kind, SocketKind::Listener { .. }) {
                return Err(SocketError::NotListener);
            }
        }

        // Pin the listener across the wait and the handoff: close may
        // unpublish the port underneath us, but the block stays put
        // until this reference is dropped.
        st.sockets.get_mut(lsid.0).expect("checked above").refcount += 1;

        let (mut st, result) = accept_pinned(st, self.pid, lsid);

        let scb = st.sockets.get_mut(lsid.0).expect("listener pinned");
        assert!(scb.refcount > 0, "listener refcount underflow");
        scb.refcount -= 1;
        if scb.closing && scb.refcount == 0 {
            st.sockets.remove(lsid.0);
        }
        result
    }

    /// Request a connection to the listener at `port` and wait (bounded
    /// by `timeout`) to be admitted.
    ///
    /// On timeout the request is unlinked from the listener's queue under
    /// the kernel lock, so a failed connect can never be admitted later -
    /// the caller's socket stays unbound.
    pub fn connect(&self, fd: Fd, port: Port, timeout: Duration) -> SocketResult<()> {
        let mut st = self.kernel.lock();
        let sid = resolve(&st, self.pid, fd)?;
        {
            let scb = st.sockets.get(sid.0).ok_or(SocketError::BadHandle)?;
            if !matches!(scb.kind, SocketKind::Unbound) {
                return Err(SocketError::AlreadyBound);
            }
        }
        if port == Port::NONE || port.0 > st.config.max_port {
            return Err(SocketError::BadPort);
        }
        let Some(lsid) = st.port_map.get(port) else {
            return Err(SocketError::ConnectionRefused);
        };
        let queue_cv = {
            let listener = st
                .sockets
                .get(lsid.0)
                .expect("port map points at a dead socket");
            match &listener.kind {
                SocketKind::Listener { req_available, .. } => req_available.clone(),
                _ => unreachable!("port map entry is not a listener"),
            }
        };

        // Queue the request. It holds a counted reference on the
        // requesting socket for as long as it exists.
        st.sockets.get_mut(sid.0).expect("checked above").refcount += 1;
        let cv = Condv::new();
        let rid = RequestId(st.requests.insert(ConnRequest {
            peer: sid,
            admitted: false,
            connected_cv: cv.clone(),
        }));
        match &mut st.sockets.get_mut(lsid.0).expect("listener present").kind {
            SocketKind::Listener { queue, .. } => queue.push_back(rid),
            _ => unreachable!("listener changed kind under the kernel lock"),
        }
        queue_cv.broadcast();
        log::trace!("{sid} requesting connection on {port}");

        let deadline = Instant::now() + timeout;
        let abandoned = loop {
            if st.requests.get(rid.0).expect("request removed while owned").admitted {
                break false;
            }
            let now = Instant::now();
            if now >= deadline {
                break true;
            }
            let (guard, _timed_out) = cv.wait_timeout(st, SchedClass::Pipe, deadline - now);
            st = guard;
        };

        // The request is ours to discard, admitted or abandoned.
        if abandoned {
            if let Some(listener) = st.sockets.get_mut(lsid.0) {
                if let SocketKind::Listener { queue, .. } = &mut listener.kind {
                    queue.retain(|&queued| queued != rid);
                }
            }
        }
        st.requests.remove(rid.0);

        // Drop the counted reference the request held on our socket.
        let scb = st.sockets.get_mut(sid.0).expect("socket pinned by request");
        assert!(scb.refcount > 0, "socket refcount underflow");
        scb.refcount -= 1;
        if scb.closing && scb.refcount == 0 {
            st.sockets.remove(sid.0);
        }

        if abandoned {
            log::trace!("{sid}: connection on {port} timed out");
            Err(SocketError::TimedOut)
        } else {
            log::debug!("{sid} connected on {port}");
            Ok(())
        }
    }

    /// Shut down one or both halves of a peer connection.
    pub fn shutdown(&self, fd: Fd, how: ShutdownMode) -> SocketResult<()> {
        let mut st = self.kernel.lock();
        let sid = resolve(&st, self.pid, fd)?;
        let scb = st.sockets.get_mut(sid.0).ok_or(SocketError::BadHandle)?;
        let SocketKind::Peer {
            read_pipe,
            write_pipe,
        } = &mut scb.kind
        else {
            return Err(SocketError::NotConnected);
        };
        match how {
            ShutdownMode::Read => {
                if let Some(pipe) = read_pipe.take() {
                    pipe.close_reader();
                }
            }
            ShutdownMode::Write => {
                if let Some(pipe) = write_pipe.take() {
                    pipe.close_writer();
                }
            }
            ShutdownMode::Both => {
                if let Some(pipe) = write_pipe.take() {
                    pipe.close_writer();
                }
                if let Some(pipe) = read_pipe.take() {
                    pipe.close_reader();
                }
            }
        }
        log::trace!("{sid} shut down ({how:?})");
        Ok(())
    }

    /// Read from a peer socket. Blocks outside the kernel lock; returns 0
    /// at EOF once the far writer is gone.
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> SocketResult<usize> {
        let pipe = {
            let st = self.kernel.lock();
            let sid = resolve(&st, self.pid, fd)?;
            let scb = st.sockets.get(sid.0).ok_or(SocketError::BadHandle)?;
            match &scb.kind {
                SocketKind::Peer {
                    read_pipe: Some(pipe),
                    ..
                } => Arc::clone(pipe),
                _ => return Err(SocketError::NotConnected),
            }
        };
        Ok(pipe.read(buf)?)
    }

    /// Write to a peer socket. Blocks outside the kernel lock while the
    /// channel is full.
    pub fn write(&self, fd: Fd, buf: &[u8]) -> SocketResult<usize> {
        let pipe = {
            let st = self.kernel.lock();
            let sid = resolve(&st, self.pid, fd)?;
            let scb = st.sockets.get(sid.0).ok_or(SocketError::BadHandle)?;
            match &scb.kind {
                SocketKind::Peer {
                    write_pipe: Some(pipe),
                    ..
                } => Arc::clone(pipe),
                _ => return Err(SocketError::NotConnected),
            }
        };
        Ok(pipe.write(buf)?)
    }

    /// Close a file descriptor: drop its table entry and its object
    /// reference. The object is torn down when the last reference goes.
    pub fn close(&self, fd: Fd) -> SocketResult<()> {
        let mut st = self.kernel.lock();
        let proc = st
            .processes
            .get_mut(&self.pid)
            .ok_or(SocketError::BadHandle)?;
        let handle = proc.files.remove(fd).ok_or(SocketError::BadHandle)?;
        release_handle(&mut st, handle);
        Ok(())
    }
}

/// Allocate an unbound socket: control block, object entry, fd. Rolls
/// everything back when the file table is full.
pub(crate) fn alloc_socket(
    st: &mut KernelState,
    pid: Pid,
    port: Port,
) -> SocketResult<(Fd, SocketId)> {
    let sid = SocketId(st.sockets.insert(SocketCb::new(port)));
    let handle = st.objects.reserve(KernelObject::Socket(sid));
    st.sockets.get_mut(sid.0).expect("just inserted").handle = handle;

    let proc = st.processes.get_mut(&pid).expect("calling process vanished");
    match proc.files.alloc(handle) {
        Some(fd) => {
            log::trace!("{pid}: {sid} on {port} as {fd}");
            Ok((fd, sid))
        }
        None => {
            st.objects.discard(handle);
            st.sockets.remove(sid.0);
            Err(SocketError::TableFull)
        }
    }
}

/// Map an fd of `pid` to the socket behind it.
fn resolve(st: &KernelState, pid: Pid, fd: Fd) -> SocketResult<SocketId> {
    let proc = st.processes.get(&pid).ok_or(SocketError::BadHandle)?;
    let handle = proc.files.get(fd).ok_or(SocketError::BadHandle)?;
    let entry = st.objects.get(handle).ok_or(SocketError::BadHandle)?;
    let KernelObject::Socket(sid) = entry.object;
    Ok(sid)
}

/// The blocking body of accept, with the listener already pinned. The
/// guard travels through each wait and comes back to the caller.
fn accept_pinned(
    mut st: std::sync::MutexGuard<'_, KernelState>,
    pid: Pid,
    lsid: SocketId,
) -> (
    std::sync::MutexGuard<'_, KernelState>,
    SocketResult<Fd>,
) {
    loop {
        // Revalidate after every wake: a concurrent close unpublishes the
        // port, and waiting on a dead listener would spin forever.
        let (queue_empty, queue_cv, port) = {
            let scb = st.sockets.get(lsid.0).expect("listener pinned");
            if scb.closing || scb.port == Port::NONE {
                return (st, Err(SocketError::NotListener));
            }
            match &scb.kind {
                SocketKind::Listener {
                    queue,
                    req_available,
                } => (queue.is_empty(), req_available.clone(), scb.port),
                _ => unreachable!("pinned listener changed kind"),
            }
        };
        if queue_empty {
            st = queue_cv.wait(st, SchedClass::Pipe);
            continue;
        }

        // Oldest request first. A request whose socket died while queued
        // is dropped and the wait resumes.
        let rid = front_pending(&st, lsid);
        let peer2_sid = st
            .requests
            .get(rid.0)
            .expect("queued request vanished")
            .peer;
        let peer2_live = st
            .sockets
            .get(peer2_sid.0)
            .map(|scb| !scb.closing && matches!(scb.kind, SocketKind::Unbound))
            .unwrap_or(false);
        if !peer2_live {
            let dropped = pop_pending(&mut st, lsid);
            debug_assert_eq!(dropped, rid);
            log::debug!("{lsid}: dropping request from dead {peer2_sid}");
            continue;
        }

        // The new endpoint reuses the listener's port. Failure here
        // leaves the queue untouched.
        let (peer1_fd, peer1_sid) = match alloc_socket(&mut st, pid, port) {
            Ok(pair) => pair,
            Err(err) => return (st, Err(err)),
        };

        let popped = pop_pending(&mut st, lsid);
        debug_assert_eq!(popped, rid);
        let connected_cv = {
            let req = st.requests.get_mut(rid.0).expect("popped request vanished");
            req.admitted = true;
            req.connected_cv.clone()
        };

        // Two one-way channels, wired crosswise: each side's writes feed
        // the other side's reads.
        let capacity = st.config.pipe_capacity;
        let forward = Arc::new(PipeChannel::new(capacity));
        let backward = Arc::new(PipeChannel::new(capacity));
        st.sockets.get_mut(peer1_sid.0).expect("just allocated").kind = SocketKind::Peer {
            read_pipe: Some(Arc::clone(&backward)),
            write_pipe: Some(Arc::clone(&forward)),
        };
        st.sockets.get_mut(peer2_sid.0).expect("validated above").kind = SocketKind::Peer {
            read_pipe: Some(forward),
            write_pipe: Some(backward),
        };

        log::debug!("{lsid} on {port}: paired {peer1_sid} with {peer2_sid}");
        connected_cv.broadcast();
        return (st, Ok(peer1_fd));
    }
}

fn front_pending(st: &KernelState, lsid: SocketId) -> RequestId {
    match &st.sockets.get(lsid.0).expect("listener pinned").kind {
        SocketKind::Listener { queue, .. } => *queue.front().expect("queue checked nonempty"),
        _ => unreachable!("pinned listener changed kind"),
    }
}

fn pop_pending(st: &mut KernelState, lsid: SocketId) -> RequestId {
    match &mut st.sockets.get_mut(lsid.0).expect("listener pinned").kind {
        SocketKind::Listener { queue, .. } => queue.pop_front().expect("pop from empty queue"),
        _ => unreachable!("pinned listener changed kind"),
    }
}

/// Drop one reference on an object-table entry and tear the object down
/// if that was the last one.
pub(crate) fn release_handle(st: &mut KernelState, handle: Handle) {
    if let Some(object) = st.objects.decref(handle) {
        match object {
            KernelObject::Socket(sid) => teardown_socket(st, sid),
        }
    }
}

/// Destructor for a socket control block, reachable from every variant.
///
/// A listener is unpublished and its waiters woken; a peer closes both
/// pipe halves. Storage release is deferred while rendezvous references
/// are outstanding.
fn teardown_socket(st: &mut KernelState, sid: SocketId) {
    let scb = st.sockets.get_mut(sid.0).expect("teardown of unknown socket");
    let port = scb.port;
    scb.port = Port::NONE;
    let kind = std::mem::replace(&mut scb.kind, SocketKind::Unbound);
    let deferred = scb.refcount > 0;
    if deferred {
        scb.closing = true;
    }

    match kind {
        SocketKind::Listener { req_available, .. } => {
            // Unpublish first, then wake every blocked accept so it can
            // observe the port gone. Queued requests stay behind; their
            // connectors run into the timeout.
            if port != Port::NONE {
                let unpublished = st.port_map.unpublish(port);
                debug_assert_eq!(unpublished, Some(sid));
            }
            req_available.broadcast();
            log::debug!("{sid}: listener on {port} closed");
        }
        SocketKind::Peer {
            read_pipe,
            write_pipe,
        } => {
            if let Some(pipe) = read_pipe {
                pipe.close_reader();
            }
            if let Some(pipe) = write_pipe {
                pipe.close_writer();
            }
            log::trace!("{sid}: peer closed");
        }
        SocketKind::Unbound => {}
    }

    if !deferred {
        st.sockets.remove(sid.0);
    }
}
