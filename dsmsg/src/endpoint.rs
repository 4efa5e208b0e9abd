//! The endpoint state machine: a non-blocking message connection.
//!
//! An `Endpoint` is a cheaply-cloned handle (`Rc<RefCell<Inner>>`) so it can
//! be held by the caller and, at the same time, referenced by at most one
//! `PollGroup`. The group side of that relationship holds only a `Weak`
//! back-reference (see `crate::group`), the direct translation of "the
//! aggregator holds non-owning references to endpoints; endpoints hold a
//! weak back-reference to their aggregator" into safe Rust — there are no
//! raw pointers to borrow here.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::error::{is_transient, Errno, FlushOutcome};
use crate::frame::HDR_SIZE;
use crate::group::GroupInner;
use crate::message::{Message, RecvPhase};

/// Stable identity of an endpoint, assigned once at construction. Used both
/// as the aggregator's membership key and, cast to a `mio::Token`, as the
/// registration token within a `PollGroup`'s shared `mio::Poll`.
pub(crate) type EndpointId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn alloc_id() -> EndpointId {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of an endpoint. See the module-level state transition
/// table this mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Listening,
    Connecting,
    Ready,
    Errored,
}

/// Poll events an endpoint currently wants, derived purely from its state —
/// computing this never touches the socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    pub(crate) fn to_mio(self) -> Option<mio::Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Poll events actually reported for one registration.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Revents {
    pub readable: bool,
    pub writable: bool,
}

enum Socket {
    Listener(mio::net::TcpListener),
    Stream(mio::net::TcpStream),
}

impl Socket {
    fn as_source_mut(&mut self) -> &mut dyn mio::event::Source {
        match self {
            Socket::Listener(l) => l,
            Socket::Stream(s) => s,
        }
    }

    fn stream_mut(&mut self) -> Option<&mut mio::net::TcpStream> {
        match self {
            Socket::Stream(s) => Some(s),
            Socket::Listener(_) => None,
        }
    }

    fn listener_mut(&mut self) -> Option<&mut mio::net::TcpListener> {
        match self {
            Socket::Listener(l) => Some(l),
            Socket::Stream(_) => None,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) id: EndpointId,
    socket: Socket,
    pub(crate) state: EndpointState,
    err: Option<Errno>,
    pub(crate) send_queue: VecDeque<Message>,
    pub(crate) send_inflight: Option<Message>,
    pub(crate) recv_inflight: Option<Message>,
    pub(crate) recv_ready: Option<Message>,
    pub(crate) accept_slot: Option<Endpoint>,
    pub(crate) group: Option<Weak<RefCell<GroupInner>>>,
    poll: mio::Poll,
    registered: bool,
}

impl Inner {
    pub(crate) fn socket_source_mut(&mut self) -> &mut dyn mio::event::Source {
        self.socket.as_source_mut()
    }
}

/// A non-blocking message connection. Cloning an `Endpoint` clones the
/// handle, not the connection — all clones refer to the same underlying
/// socket and queues.
#[derive(Clone)]
pub struct Endpoint(Rc<RefCell<Inner>>);

fn resolve(addr: &str, port: u16) -> io::Result<SocketAddr> {
    (addr, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address did not resolve"))
}

impl Endpoint {
    fn from_inner(inner: Inner) -> Endpoint {
        Endpoint(Rc::new(RefCell::new(inner)))
    }

    fn new_listening(listener: mio::net::TcpListener) -> io::Result<Endpoint> {
        Ok(Endpoint::from_inner(Inner {
            id: alloc_id(),
            socket: Socket::Listener(listener),
            state: EndpointState::Listening,
            err: None,
            send_queue: VecDeque::new(),
            send_inflight: None,
            recv_inflight: None,
            recv_ready: None,
            accept_slot: None,
            group: None,
            poll: mio::Poll::new()?,
            registered: false,
        }))
    }

    fn new_connecting(stream: mio::net::TcpStream) -> io::Result<Endpoint> {
        Ok(Endpoint::from_inner(Inner {
            id: alloc_id(),
            socket: Socket::Stream(stream),
            state: EndpointState::Connecting,
            err: None,
            send_queue: VecDeque::new(),
            send_inflight: None,
            recv_inflight: None,
            recv_ready: None,
            accept_slot: None,
            group: None,
            poll: mio::Poll::new()?,
            registered: false,
        }))
    }

    pub(crate) fn new_ready(stream: mio::net::TcpStream) -> io::Result<Endpoint> {
        Ok(Endpoint::from_inner(Inner {
            id: alloc_id(),
            socket: Socket::Stream(stream),
            state: EndpointState::Ready,
            err: None,
            send_queue: VecDeque::new(),
            send_inflight: None,
            recv_inflight: None,
            recv_ready: None,
            accept_slot: None,
            group: None,
            poll: mio::Poll::new()?,
            registered: false,
        }))
    }

    /// Binds and listens on `addr:port`. The new endpoint starts LISTENING.
    pub fn serve(addr: &str, port: u16) -> io::Result<Endpoint> {
        let resolved = resolve(addr, port)?;
        let listener = mio::net::TcpListener::bind(resolved)?;
        debug!("endpoint listening on {}", resolved);
        Endpoint::new_listening(listener)
    }

    /// Starts a non-blocking connect to `addr:port`. The new endpoint starts
    /// CONNECTING; completion (success or failure) is observed through
    /// `wait`/`PollGroup::wait`.
    pub fn connect(addr: &str, port: u16) -> io::Result<Endpoint> {
        let resolved = resolve(addr, port)?;
        let stream = mio::net::TcpStream::connect(resolved)?;
        debug!("endpoint connecting to {}", resolved);
        Endpoint::new_connecting(stream)
    }

    pub(crate) fn id(&self) -> EndpointId {
        self.0.borrow().id
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<Inner>> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn rc(&self) -> Rc<RefCell<Inner>> {
        self.0.clone()
    }

    /// True iff this endpoint still belongs to a *live* aggregator. A
    /// `group` field pointing at an aggregator that has already been
    /// dropped is treated as unset (and cleared on the spot) rather than
    /// permanently pinning the endpoint to a dead `Weak`.
    pub(crate) fn group_is_set(&self) -> bool {
        let alive = self
            .0
            .borrow()
            .group
            .as_ref()
            .map_or(false, |g| g.strong_count() > 0);
        if !alive {
            self.0.borrow_mut().group = None;
        }
        alive
    }

    pub(crate) fn set_group(&self, group: Weak<RefCell<GroupInner>>) {
        self.0.borrow_mut().group = Some(group);
    }

    pub(crate) fn clear_group(&self) {
        self.0.borrow_mut().group = None;
    }

    pub fn state(&self) -> EndpointState {
        self.0.borrow().state
    }

    /// The locally bound or peer-facing address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.0.borrow().socket {
            Socket::Listener(l) => l.local_addr(),
            Socket::Stream(s) => s.local_addr(),
        }
    }

    /// Zero (`None`) unless the endpoint is ERRORED, in which case the
    /// captured code from the transition that killed it.
    pub fn last_error(&self) -> Option<Errno> {
        let inner = self.0.borrow();
        if inner.state == EndpointState::Errored {
            inner.err
        } else {
            None
        }
    }

    /// Appends `msg` to the send queue. Non-blocking: no I/O happens here.
    /// Ownership of `msg` transfers to the endpoint.
    pub fn send(&self, msg: Message) {
        self.0.borrow_mut().send_queue.push_back(msg);
    }

    /// Returns and clears the completed receive slot, removing the endpoint
    /// from its group's `readable` set if it was there.
    pub fn recv(&self) -> Option<Message> {
        let msg = self.0.borrow_mut().recv_ready.take();
        if msg.is_some() {
            self.untrack(|g, id| {
                g.readable.remove(&id);
            });
        }
        msg
    }

    /// Returns and clears the accepted-child slot, removing the endpoint
    /// from its group's `acceptable` set if it was there. LISTENING only in
    /// practice; a non-LISTENING endpoint's slot is always empty.
    pub fn accept(&self) -> Option<Endpoint> {
        let child = self.0.borrow_mut().accept_slot.take();
        if child.is_some() {
            self.untrack(|g, id| {
                g.acceptable.remove(&id);
            });
        }
        child
    }

    fn untrack(&self, f: impl FnOnce(&mut GroupInner, EndpointId)) {
        let group = {
            let inner = self.0.borrow();
            inner.group.as_ref().and_then(Weak::upgrade)
        };
        if let Some(group) = group {
            f(&mut group.borrow_mut(), self.id());
        }
    }

    /// Marks ERRORED, releases every socket-owned resource, and removes the
    /// endpoint from its group entirely (not just the readiness sets). Safe
    /// and idempotent to call more than once, including on an endpoint that
    /// was never added to a group.
    pub fn close(&self) {
        die(&self.0, None);
        let group = self.0.borrow_mut().group.take().and_then(|g| g.upgrade());
        if let Some(group) = group {
            group.borrow_mut().forget(self.id());
        }
    }

    /// Drives this endpoint alone until it makes observable progress, times
    /// out, or errors. Returns 1 (ready), 0 (timeout/interrupted), or -1
    /// (error), per §5.
    pub fn wait(&self, deadline: Instant) -> i32 {
        let mut prev = Revents::default();
        loop {
            handle_revents(&self.0, prev);

            {
                let inner = self.0.borrow();
                if inner.recv_ready.is_some() || inner.accept_slot.is_some() {
                    return 1;
                }
            }

            let interest = desired_interest(&self.0.borrow());

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return 0;
            }

            if interest.is_empty() {
                return 0;
            }

            match self.poll_once(interest, remaining) {
                Ok(Some(revents)) => prev = revents,
                Ok(None) => return 0,
                Err(_) => return -1,
            }
        }
    }

    fn poll_once(&self, interest: Interest, timeout: Duration) -> io::Result<Option<Revents>> {
        let mut inner = self.0.borrow_mut();
        let token = mio::Token(0);
        let mio_interest = interest
            .to_mio()
            .expect("caller checked interest is non-empty");

        let registered = inner.registered;
        {
            let registry = inner.poll.registry();
            let source = inner.socket.as_source_mut();
            if registered {
                registry.reregister(source, token, mio_interest)?;
            } else {
                registry.register(source, token, mio_interest)?;
            }
        }
        inner.registered = true;

        let mut events = mio::Events::with_capacity(1);
        match inner.poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }

        Ok(events.iter().next().map(|ev| Revents {
            readable: ev.is_readable(),
            writable: ev.is_writable(),
        }))
    }
}

/// Desired poll events for an endpoint, computed purely from its state —
/// no I/O, idempotent.
pub(crate) fn desired_interest(inner: &Inner) -> Interest {
    match inner.state {
        EndpointState::Listening => Interest {
            readable: inner.accept_slot.is_none(),
            writable: false,
        },
        EndpointState::Connecting => Interest {
            readable: false,
            writable: true,
        },
        EndpointState::Ready => Interest {
            writable: inner.send_inflight.is_some() || !inner.send_queue.is_empty(),
            readable: inner.recv_ready.is_none(),
        },
        EndpointState::Errored => Interest::default(),
    }
}

fn flush_send(inner: &mut Inner) -> FlushOutcome {
    loop {
        if inner.send_inflight.is_none() {
            match inner.send_queue.pop_front() {
                Some(mut msg) => {
                    msg.materialize_header();
                    inner.send_inflight = Some(msg);
                }
                None => return FlushOutcome::Done,
            }
        }

        let stream = match inner.socket.stream_mut() {
            Some(s) => s,
            None => return FlushOutcome::Done,
        };
        let msg = inner.send_inflight.as_mut().unwrap();

        let result = if msg.hdr_pos < HDR_SIZE {
            stream.write(&msg.hdr[msg.hdr_pos..])
        } else if (msg.buf_pos as u64) < msg.len {
            let end = msg.len as usize;
            stream.write(&msg.buf[msg.buf_pos..end])
        } else {
            trace!("endpoint {} finished sending one message", inner.id);
            inner.send_inflight = None;
            continue;
        };

        match result {
            Ok(0) => return FlushOutcome::Fatal(Errno::PeerClosed),
            Ok(n) => {
                let msg = inner.send_inflight.as_mut().unwrap();
                if msg.hdr_pos < HDR_SIZE {
                    msg.hdr_pos += n;
                } else {
                    msg.buf_pos += n;
                }
            }
            Err(e) if is_transient(&e) => return FlushOutcome::Blocked,
            Err(e) => return FlushOutcome::Fatal(Errno::Transport(e.kind())),
        }
    }
}

fn flush_recv(inner: &mut Inner) -> FlushOutcome {
    while inner.recv_ready.is_none() {
        if inner.recv_inflight.is_none() {
            inner.recv_inflight = Some(Message::for_recv());
        }

        let stream = match inner.socket.stream_mut() {
            Some(s) => s,
            None => return FlushOutcome::Done,
        };
        let msg = inner.recv_inflight.as_mut().unwrap();

        match msg.recv_phase() {
            RecvPhase::HeaderIncomplete => {
                let pos = msg.hdr_pos;
                match stream.read(&mut msg.hdr[pos..]) {
                    Ok(0) => return FlushOutcome::Fatal(Errno::PeerClosed),
                    Ok(n) => msg.hdr_pos += n,
                    Err(e) if is_transient(&e) => return FlushOutcome::Blocked,
                    Err(e) => return FlushOutcome::Fatal(Errno::Transport(e.kind())),
                }
            }
            RecvPhase::HeaderCompleteUnparsed => {
                if let Err(e) = msg.parse_header() {
                    return FlushOutcome::Fatal(e.into());
                }
            }
            RecvPhase::PayloadIncomplete => {
                let pos = msg.buf_pos;
                let end = msg.len as usize;
                match stream.read(&mut msg.buf[pos..end]) {
                    Ok(0) => return FlushOutcome::Fatal(Errno::PeerClosed),
                    Ok(n) => msg.buf_pos += n,
                    Err(e) if is_transient(&e) => return FlushOutcome::Blocked,
                    Err(e) => return FlushOutcome::Fatal(Errno::Transport(e.kind())),
                }
            }
            RecvPhase::Complete => {
                trace!("endpoint {} finished receiving one message", inner.id);
                inner.recv_ready = inner.recv_inflight.take();
            }
        }
    }
    FlushOutcome::Done
}

fn try_accept(inner: &mut Inner) -> Result<Option<mio::net::TcpStream>, Errno> {
    let listener = inner
        .socket
        .listener_mut()
        .expect("listening endpoint must hold a listener");
    match listener.accept() {
        Ok((stream, _addr)) => Ok(Some(stream)),
        Err(e) if is_transient(&e) => Ok(None),
        Err(e) => Err(Errno::Transport(e.kind())),
    }
}

/// Applies one set of reported poll events to an endpoint per its current
/// state, then refreshes its group's readiness sets.
pub(crate) fn handle_revents(inner_rc: &Rc<RefCell<Inner>>, revents: Revents) {
    let state = inner_rc.borrow().state;

    match state {
        EndpointState::Errored => {}

        EndpointState::Connecting => {
            if revents.writable {
                let pending = {
                    let mut inner = inner_rc.borrow_mut();
                    let stream = inner
                        .socket
                        .stream_mut()
                        .expect("connecting endpoint holds a stream");
                    stream.take_error()
                };
                match pending {
                    Ok(None) => {
                        inner_rc.borrow_mut().state = EndpointState::Ready;
                        debug!("endpoint {} finished connecting", inner_rc.borrow().id);
                    }
                    Ok(Some(e)) => die(inner_rc, Some(Errno::Connect(e.kind()))),
                    Err(e) => die(inner_rc, Some(Errno::Connect(e.kind()))),
                }
            }
        }

        EndpointState::Ready => {
            if revents.writable {
                let outcome = flush_send(&mut inner_rc.borrow_mut());
                if let FlushOutcome::Fatal(err) = outcome {
                    error!("endpoint {} send failed: {}", inner_rc.borrow().id, err);
                    die(inner_rc, Some(err));
                    refresh_group_membership(inner_rc);
                    return;
                }
            }
            if revents.readable {
                let outcome = flush_recv(&mut inner_rc.borrow_mut());
                if let FlushOutcome::Fatal(err) = outcome {
                    error!("endpoint {} receive failed: {}", inner_rc.borrow().id, err);
                    die(inner_rc, Some(err));
                    refresh_group_membership(inner_rc);
                    return;
                }
            }
        }

        EndpointState::Listening => {
            if revents.readable {
                let result = try_accept(&mut inner_rc.borrow_mut());
                match result {
                    Ok(Some(stream)) => match Endpoint::new_ready(stream) {
                        Ok(child) => {
                            debug!("endpoint {} accepted a connection", inner_rc.borrow().id);
                            inner_rc.borrow_mut().accept_slot = Some(child);
                        }
                        Err(e) => error!("failed to wrap accepted connection: {}", e),
                    },
                    Ok(None) => {}
                    Err(err) => {
                        die(inner_rc, Some(err));
                        refresh_group_membership(inner_rc);
                        return;
                    }
                }
            }
        }
    }

    refresh_group_membership(inner_rc);
}

/// Marks ERRORED, records the error code, and drops every queued or
/// in-flight message. `err = None` represents a zero code (clean close):
/// it removes the endpoint from its group's `errored` set rather than
/// inserting it.
pub(crate) fn die(inner_rc: &Rc<RefCell<Inner>>, err: Option<Errno>) {
    let (group, id) = {
        let mut inner = inner_rc.borrow_mut();
        inner.state = EndpointState::Errored;
        inner.err = err;
        inner.accept_slot = None;
        inner.send_queue.clear();
        inner.send_inflight = None;
        inner.recv_inflight = None;
        inner.recv_ready = None;
        (
            inner.group.as_ref().and_then(Weak::upgrade),
            inner.id,
        )
    };

    if let Some(group) = group {
        let mut g = group.borrow_mut();
        g.acceptable.remove(&id);
        g.readable.remove(&id);
        if err.is_some() {
            g.errored.insert(id);
        } else {
            g.errored.remove(&id);
        }
    }
}

fn refresh_group_membership(inner_rc: &Rc<RefCell<Inner>>) {
    let (group, id, readable, acceptable) = {
        let inner = inner_rc.borrow();
        (
            inner.group.as_ref().and_then(Weak::upgrade),
            inner.id,
            inner.recv_ready.is_some(),
            inner.accept_slot.is_some(),
        )
    };
    if let Some(group) = group {
        let mut g = group.borrow_mut();
        if readable {
            g.readable.insert(id);
        }
        if acceptable {
            g.acceptable.insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::wrap_buffer;
    use std::net::TcpStream as StdTcpStream;
    use std::time::Instant;

    fn deadline_in(d: Duration) -> Instant {
        Instant::now() + d
    }

    #[test]
    fn echo_one_message_round_trips() {
        let server = Endpoint::serve("127.0.0.1", 0).unwrap();
        let port = server.local_addr().unwrap().port();

        let client = Endpoint::connect("127.0.0.1", port).unwrap();

        assert_eq!(client.wait(deadline_in(Duration::from_secs(2))), 1);
        assert_eq!(client.state(), EndpointState::Ready);

        assert_eq!(server.wait(deadline_in(Duration::from_secs(2))), 1);
        let accepted = server.accept().expect("listener should have accepted");

        client.send(wrap_buffer(b"hello"));
        // Drive the client until the send lands; a send-only wait may time
        // out with 0 once the write completes without anything readable.
        for _ in 0..5 {
            client.wait(deadline_in(Duration::from_millis(200)));
        }

        assert_eq!(accepted.wait(deadline_in(Duration::from_secs(2))), 1);
        let msg = accepted.recv().expect("message should have arrived");
        assert_eq!(msg.payload(), b"hello");
    }

    #[test]
    fn wait_times_out_with_no_pending_data() {
        let server = Endpoint::serve("127.0.0.1", 0).unwrap();
        let now = Instant::now();
        assert_eq!(server.wait(now), 0);
    }

    #[test]
    fn bad_magic_kills_the_receiver() {
        let server = Endpoint::serve("127.0.0.1", 0).unwrap();
        let port = server.local_addr().unwrap().port();

        let mut raw = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
        assert_eq!(server.wait(deadline_in(Duration::from_secs(2))), 1);
        let accepted = server.accept().unwrap();

        let mut bad_header = [0u8; HDR_SIZE];
        bad_header[0] = b'X';
        bad_header[1..5].copy_from_slice(b"Smsg");
        raw.write_all(&bad_header).unwrap();

        // A single `wait` call both drains the buffered bad header and
        // notices the resulting death; it does not promise a particular
        // return code for the death itself (only `recv_ready`/`accept_slot`
        // do), so only the state transition is asserted here.
        accepted.wait(deadline_in(Duration::from_secs(2)));
        assert_eq!(accepted.state(), EndpointState::Errored);
        assert!(accepted.last_error().is_some());
    }

    #[test]
    fn die_clears_send_queue_and_all_slots() {
        let ep = Endpoint::serve("127.0.0.1", 0).unwrap();
        let child = Endpoint::serve("127.0.0.1", 0).unwrap();

        {
            let mut inner = ep.0.borrow_mut();
            inner.send_queue.push_back(Message::for_send(b"queued"));
            inner.send_inflight = Some(Message::for_send(b"inflight"));
            inner.recv_inflight = Some(Message::for_recv());
            inner.recv_ready = Some(Message::for_send(b"ready"));
            inner.accept_slot = Some(child);
        }

        die(&ep.rc(), Some(Errno::PeerClosed));

        let inner = ep.0.borrow();
        assert!(inner.send_queue.is_empty());
        assert!(inner.send_inflight.is_none());
        assert!(inner.recv_inflight.is_none());
        assert!(inner.recv_ready.is_none());
        assert!(inner.accept_slot.is_none());
        assert_eq!(inner.state, EndpointState::Errored);
        assert_eq!(inner.err, Some(Errno::PeerClosed));
    }

    #[test]
    fn close_is_idempotent_and_stops_io() {
        let server = Endpoint::serve("127.0.0.1", 0).unwrap();
        server.close();
        server.close();
        assert_eq!(server.state(), EndpointState::Errored);
        assert_eq!(server.wait(Instant::now()), 0);
    }
}
