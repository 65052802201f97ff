use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// Compact per-user identifier used on the wire. Zero means "no user".
pub type WireId = u32;

pub const NO_WIRE_ID: WireId = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub wire_id: WireId,
    pub session_id: String,
}

impl User {
    pub fn new(wire_id: WireId, session_id: impl Into<String>) -> Self {
        Self {
            wire_id,
            session_id: session_id.into(),
        }
    }
}

/// Users attached to one simulation host. On clients the local user is the
/// only entry that matters; servers track every connected user.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: Vec<User>,
    local_wire_id: WireId,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, user: User) {
        debug_assert!(self.by_wire_id(user.wire_id).is_none());
        self.users.push(user);
    }

    pub fn remove(&mut self, wire_id: WireId) -> Option<User> {
        let index = self.users.iter().position(|u| u.wire_id == wire_id)?;
        Some(self.users.remove(index))
    }

    pub fn by_wire_id(&self, wire_id: WireId) -> Option<&User> {
        self.users.iter().find(|u| u.wire_id == wire_id)
    }

    pub fn by_session_id(&self, session_id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.session_id == session_id)
    }

    pub fn set_local(&mut self, wire_id: WireId) {
        self.local_wire_id = wire_id;
    }

    pub fn local(&self) -> Option<&User> {
        self.by_wire_id(self.local_wire_id)
    }

    pub fn local_wire_id(&self) -> WireId {
        self.local_wire_id
    }

    pub fn iter(&self) -> impl Iterator<Item = &User> {
        self.users.iter()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Packet hand-off seam. Completions are queued and drained inside the
/// simulator's update, never delivered mid-tick; hosts that run sockets on
/// other threads pump into an implementation of this.
pub trait Transport {
    /// Queues a payload for `to`. Clients pass `NO_WIRE_ID` (the server).
    fn send(&mut self, to: WireId, payload: Vec<u8>);

    /// Next received payload and the wire id it came from, if any.
    fn recv(&mut self) -> Option<(WireId, Vec<u8>)>;
}

#[derive(Default)]
struct HubQueues {
    to_server: VecDeque<(WireId, Vec<u8>)>,
    to_clients: HashMap<WireId, VecDeque<(WireId, Vec<u8>)>>,
}

/// In-process transport connecting one server end to any number of client
/// ends. Used by the demo and the end-to-end tests.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    queues: Rc<RefCell<HubQueues>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_end(&self) -> LoopbackTransport {
        LoopbackTransport {
            queues: self.queues.clone(),
            client_wire_id: None,
        }
    }

    pub fn client_end(&self, wire_id: WireId) -> LoopbackTransport {
        self.queues
            .borrow_mut()
            .to_clients
            .entry(wire_id)
            .or_default();
        LoopbackTransport {
            queues: self.queues.clone(),
            client_wire_id: Some(wire_id),
        }
    }
}

pub struct LoopbackTransport {
    queues: Rc<RefCell<HubQueues>>,
    client_wire_id: Option<WireId>,
}

impl Transport for LoopbackTransport {
    fn send(&mut self, to: WireId, payload: Vec<u8>) {
        let mut queues = self.queues.borrow_mut();
        match self.client_wire_id {
            Some(from) => queues.to_server.push_back((from, payload)),
            None => {
                if let Some(queue) = queues.to_clients.get_mut(&to) {
                    queue.push_back((NO_WIRE_ID, payload));
                } else {
                    log::debug!("dropping packet for detached wire id {to}");
                }
            }
        }
    }

    fn recv(&mut self) -> Option<(WireId, Vec<u8>)> {
        let mut queues = self.queues.borrow_mut();
        match self.client_wire_id {
            Some(wire_id) => queues.to_clients.get_mut(&wire_id)?.pop_front(),
            None => queues.to_server.pop_front(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_routes_both_directions() {
        let hub = LoopbackHub::new();
        let mut server = hub.server_end();
        let mut client = hub.client_end(1);

        client.send(NO_WIRE_ID, vec![1, 2, 3]);
        assert_eq!(server.recv(), Some((1, vec![1, 2, 3])));
        assert_eq!(server.recv(), None);

        server.send(1, vec![4]);
        assert_eq!(client.recv(), Some((NO_WIRE_ID, vec![4])));
    }

    #[test]
    fn clients_have_separate_queues() {
        let hub = LoopbackHub::new();
        let mut server = hub.server_end();
        let mut first = hub.client_end(1);
        let mut second = hub.client_end(2);

        server.send(1, vec![1]);
        server.send(2, vec![2]);
        assert_eq!(first.recv(), Some((NO_WIRE_ID, vec![1])));
        assert_eq!(second.recv(), Some((NO_WIRE_ID, vec![2])));
    }

    #[test]
    fn registry_lookups() {
        let mut registry = UserRegistry::new();
        registry.add(User::new(1, "alpha"));
        registry.add(User::new(2, "beta"));
        registry.set_local(2);

        assert_eq!(registry.by_wire_id(1).unwrap().session_id, "alpha");
        assert_eq!(registry.by_session_id("beta").unwrap().wire_id, 2);
        assert_eq!(registry.local().unwrap().wire_id, 2);
        assert!(registry.by_wire_id(9).is_none());
    }
}
