//! The poll aggregator: drives many endpoints with one system-level
//! multiplex call per `wait`.
//!
//! Grounded on `neutronium::net::endpoint::Endpoint`'s trio of private
//! `mio::Poll` instances (one per connection phase) and its
//! `live: IndexSet<ChannelId>` readiness set, collapsed here into a single
//! `mio::Poll` plus three `IndexSet`s, since this crate's endpoints have no
//! separate handshake phase to poll independently.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};

use crate::endpoint::{self, Endpoint, EndpointId, Inner, Revents};
use crate::error::PollError;

/// Default capacity of the `mio::Events` buffer used by `wait`, matching
/// `neutronium::net::endpoint::Endpoint::new`'s hard-coded `8192`.
pub const DEFAULT_EVENTS_CAPACITY: usize = 8192;

/// An opaque caller-supplied tag returned by `acceptable`/`readable`/
/// `errored`. Defaults to the endpoint's own identity if the caller does
/// not supply one via `add_with_tag`.
pub type Tag = u64;

struct Member {
    endpoint: Weak<RefCell<Inner>>,
    tag: Tag,
}

pub(crate) struct GroupInner {
    poll: mio::Poll,
    events_capacity: usize,
    members: IndexMap<EndpointId, Member>,
    registered: IndexSet<EndpointId>,
    pub(crate) acceptable: IndexSet<EndpointId>,
    pub(crate) readable: IndexSet<EndpointId>,
    pub(crate) errored: IndexSet<EndpointId>,
}

impl GroupInner {
    pub(crate) fn forget(&mut self, id: EndpointId) {
        self.members.remove(&id);
        self.registered.remove(&id);
        self.acceptable.remove(&id);
        self.readable.remove(&id);
        self.errored.remove(&id);
    }
}

impl Drop for GroupInner {
    /// Clears every still-live member's back-reference before the
    /// aggregator itself goes away. Without this, a member's `Inner::group`
    /// would keep pointing at a `Weak` whose referent is gone, permanently
    /// blocking it from ever joining another `PollGroup` (see
    /// `Endpoint::group_is_set`, which treats a dead weak as unset but has
    /// no opportunity to run unless something touches that endpoint again).
    fn drop(&mut self) {
        for member in self.members.values() {
            if let Some(inner) = member.endpoint.upgrade() {
                inner.borrow_mut().group = None;
            }
        }
    }
}

/// Owns a set of endpoints and three derived readiness sets (acceptable,
/// readable, errored). Cloning a `PollGroup` clones the handle; all clones
/// share the same membership and poll state.
#[derive(Clone)]
pub struct PollGroup(Rc<RefCell<GroupInner>>);

impl PollGroup {
    pub fn create() -> io::Result<PollGroup> {
        PollGroup::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }

    pub fn with_capacity(events_capacity: usize) -> io::Result<PollGroup> {
        Ok(PollGroup(Rc::new(RefCell::new(GroupInner {
            poll: mio::Poll::new()?,
            events_capacity,
            members: IndexMap::new(),
            registered: IndexSet::new(),
            acceptable: IndexSet::new(),
            readable: IndexSet::new(),
            errored: IndexSet::new(),
        }))))
    }

    /// For each remaining member, clears its back-reference to this
    /// aggregator without closing it. `GroupInner`'s `Drop` impl does the
    /// actual clearing (it walks `members` and resets each live endpoint's
    /// `group` field) once the last strong `Rc<GroupInner>` (this handle and
    /// any clones) goes away; this method exists for parity with the public
    /// operation surface and to drop eagerly rather than waiting on the
    /// last clone.
    pub fn delete(self) {
        drop(self);
    }

    /// Adds `endpoint` with its own identity as the tag.
    pub fn add(&self, endpoint: &Endpoint) -> Result<(), PollError> {
        self.add_with_tag(endpoint, endpoint.id())
    }

    /// Adds `endpoint` under an aggregator-supplied `tag`. Fails with
    /// `AlreadyMember` if `endpoint` is already in this aggregator, or
    /// `AlreadyInAnotherGroup` if it belongs to a different one.
    pub fn add_with_tag(&self, endpoint: &Endpoint, tag: Tag) -> Result<(), PollError> {
        let id = endpoint.id();

        if self.0.borrow().members.contains_key(&id) {
            return Err(PollError::AlreadyMember);
        }
        if endpoint.group_is_set() {
            return Err(PollError::AlreadyInAnotherGroup);
        }

        self.0.borrow_mut().members.insert(
            id,
            Member {
                endpoint: endpoint.downgrade(),
                tag,
            },
        );
        endpoint.set_group(Rc::downgrade(&self.0));
        Ok(())
    }

    /// Removes `endpoint` from this aggregator. Fails with `NotMember` if
    /// it was never added (or was already removed).
    pub fn remove(&self, endpoint: &Endpoint) -> Result<(), PollError> {
        let id = endpoint.id();
        let removed = {
            let mut g = self.0.borrow_mut();
            if g.members.shift_remove(&id).is_none() {
                return Err(PollError::NotMember);
            }
            g.registered.shift_remove(&id);
            g.acceptable.shift_remove(&id);
            g.readable.shift_remove(&id);
            g.errored.shift_remove(&id);
            true
        };
        if removed {
            endpoint.clear_group();
        }
        Ok(())
    }

    pub fn acceptable(&self) -> Option<Tag> {
        self.pick_from(|g| &g.acceptable)
    }

    pub fn readable(&self) -> Option<Tag> {
        self.pick_from(|g| &g.readable)
    }

    pub fn errored(&self) -> Option<Tag> {
        self.pick_from(|g| &g.errored)
    }

    fn pick_from(&self, select: impl Fn(&GroupInner) -> &IndexSet<EndpointId>) -> Option<Tag> {
        let g = self.0.borrow();
        let id = *select(&g).iter().next()?;
        g.members.get(&id).map(|m| m.tag)
    }

    /// Drives every member until at least one readiness set is non-empty,
    /// the deadline passes, or an error occurs. Returns the total size of
    /// `acceptable ∪ readable ∪ errored` (≥1), 0 (timeout/interrupted), or
    /// -1 (error), per §5.
    pub fn wait(&self, deadline: Instant) -> i32 {
        let mut prev: HashMap<EndpointId, Revents> = HashMap::new();

        loop {
            let ids: Vec<EndpointId> = self.0.borrow().members.keys().copied().collect();

            for id in &ids {
                let rc = {
                    let g = self.0.borrow();
                    g.members.get(id).and_then(|m| m.endpoint.upgrade())
                };
                let Some(rc) = rc else {
                    self.0.borrow_mut().forget(*id);
                    continue;
                };
                let revents = prev.get(id).copied().unwrap_or_default();
                endpoint::handle_revents(&rc, revents);
            }

            let ready = {
                let g = self.0.borrow();
                g.acceptable.len() + g.readable.len() + g.errored.len()
            };
            if ready > 0 {
                return ready as i32;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return 0;
            }

            match self.poll_once(&ids, remaining) {
                Ok(Some(new_prev)) => prev = new_prev,
                Ok(None) => return 0,
                Err(_) => return -1,
            }
        }
    }

    fn poll_once(
        &self,
        ids: &[EndpointId],
        timeout: Duration,
    ) -> io::Result<Option<HashMap<EndpointId, Revents>>> {
        let mut g = self.0.borrow_mut();

        for &id in ids {
            let rc = match g.members.get(&id).and_then(|m| m.endpoint.upgrade()) {
                Some(rc) => rc,
                None => continue,
            };
            let interest = endpoint::desired_interest(&rc.borrow());
            let token = mio::Token(id as usize);
            let was_registered = g.registered.contains(&id);

            let mut inner = rc.borrow_mut();
            let source = inner.socket_source_mut();
            match (interest.to_mio(), was_registered) {
                (Some(mio_interest), true) => {
                    let _ = g.poll.registry().reregister(source, token, mio_interest);
                }
                (Some(mio_interest), false) => {
                    if g.poll.registry().register(source, token, mio_interest).is_ok() {
                        g.registered.insert(id);
                    }
                }
                (None, true) => {
                    let _ = g.poll.registry().deregister(source);
                    g.registered.shift_remove(&id);
                }
                (None, false) => {}
            }
        }

        let mut events = mio::Events::with_capacity(g.events_capacity);
        match g.poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }

        if events.is_empty() {
            return Ok(None);
        }

        let mut out = HashMap::new();
        for ev in events.iter() {
            out.insert(
                ev.token().0 as EndpointId,
                Revents {
                    readable: ev.is_readable(),
                    writable: ev.is_writable(),
                },
            );
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::wrap_buffer;
    use std::time::Duration;

    fn deadline_in(d: Duration) -> Instant {
        Instant::now() + d
    }

    #[test]
    fn add_rejects_duplicate_and_cross_group_membership() {
        let group_a = PollGroup::create().unwrap();
        let group_b = PollGroup::create().unwrap();
        let ep = Endpoint::serve("127.0.0.1", 0).unwrap();

        group_a.add(&ep).unwrap();
        assert_eq!(group_a.add(&ep), Err(PollError::AlreadyMember));
        assert_eq!(group_b.add(&ep), Err(PollError::AlreadyInAnotherGroup));
    }

    #[test]
    fn dropping_an_aggregator_frees_its_members_to_join_another() {
        let ep = Endpoint::serve("127.0.0.1", 0).unwrap();

        let group_a = PollGroup::create().unwrap();
        group_a.add(&ep).unwrap();
        drop(group_a);

        let group_b = PollGroup::create().unwrap();
        assert!(group_b.add(&ep).is_ok());
    }

    #[test]
    fn remove_of_non_member_fails() {
        let group = PollGroup::create().unwrap();
        let ep = Endpoint::serve("127.0.0.1", 0).unwrap();
        assert_eq!(group.remove(&ep), Err(PollError::NotMember));
    }

    #[test]
    fn poll_fanout_recovers_every_client_message() {
        const N: usize = 8;

        let server = Endpoint::serve("127.0.0.1", 0).unwrap();
        let port = server.local_addr().unwrap().port();

        let group = PollGroup::create().unwrap();
        group.add(&server).unwrap();

        let mut clients = Vec::new();
        for _ in 0..N {
            let client = Endpoint::connect("127.0.0.1", port).unwrap();
            group.add(&client).unwrap();
            clients.push(client);
        }

        let mut accepted = Vec::new();
        let deadline = deadline_in(Duration::from_secs(5));
        while accepted.len() < N {
            assert!(group.wait(deadline) >= 0);
            while let Some(_tag) = group.acceptable() {
                if let Some(child) = server.accept() {
                    group.add(&child).unwrap();
                    accepted.push(child);
                }
            }
        }

        for client in &clients {
            client.send(wrap_buffer(b"ping"));
        }

        let mut received = 0usize;
        let deadline = deadline_in(Duration::from_secs(5));
        while received < N {
            assert!(group.wait(deadline) >= 0);
            while let Some(tag) = group.readable() {
                let ep = accepted
                    .iter()
                    .find(|e| e.id() == tag)
                    .expect("tag must map to an accepted endpoint");
                if let Some(msg) = ep.recv() {
                    assert_eq!(msg.payload(), b"ping");
                    received += 1;
                }
            }
        }
        assert_eq!(received, N);

        assert!(group.acceptable().is_none());
        assert!(group.readable().is_none());
        assert!(group.errored().is_none());
    }
}
