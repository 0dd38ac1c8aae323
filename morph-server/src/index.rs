/// Dual session index: `clientID -> session` is the source of truth, and
/// `(address, headerID) -> clientID` routes data packets without a scan.
///
/// Every route entry references a live session. Address changes insert the
/// new route before removing the old one.
use morph_proto::{ClientId, HeaderId};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Composite routing key for the address-side index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub addr: SocketAddr,
    pub header_id: HeaderId,
}

/// What the index needs to know about a stored session.
pub trait Routable {
    fn addr(&self) -> SocketAddr;
    fn set_addr(&mut self, addr: SocketAddr);
    fn header_id(&self) -> HeaderId;

    fn route_key(&self) -> RouteKey {
        RouteKey {
            addr: self.addr(),
            header_id: self.header_id(),
        }
    }
}

#[derive(Debug)]
pub struct DualIndex<S> {
    sessions: HashMap<ClientId, S>,
    routes: HashMap<RouteKey, ClientId>,
}

impl<S> Default for DualIndex<S> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            routes: HashMap::new(),
        }
    }
}

impl<S: Routable> DualIndex<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn get(&self, client_id: &ClientId) -> Option<&S> {
        self.sessions.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &ClientId) -> Option<&mut S> {
        self.sessions.get_mut(client_id)
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ClientId, &mut S)> {
        self.sessions.iter_mut()
    }

    /// Store a session and its route. An existing session under the same
    /// client ID is replaced and returned.
    pub fn insert(&mut self, client_id: ClientId, session: S) -> Option<S> {
        let key = session.route_key();
        let previous = self.remove(&client_id);
        self.sessions.insert(client_id, session);
        self.routes.insert(key, client_id);
        previous
    }

    /// O(1) route lookup.
    pub fn lookup(&self, key: &RouteKey) -> Option<ClientId> {
        self.routes
            .get(key)
            .copied()
            .filter(|id| self.sessions.contains_key(id))
    }

    /// Linear scan by header ID, for packets whose source address is not
    /// (yet) indexed.
    pub fn find_by_header_id(&self, header_id: &HeaderId) -> Option<ClientId> {
        self.sessions
            .iter()
            .find(|(_, s)| s.header_id() == *header_id)
            .map(|(id, _)| *id)
    }

    /// Linear scan by current client address.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<ClientId> {
        self.sessions
            .iter()
            .find(|(_, s)| s.addr() == addr)
            .map(|(id, _)| *id)
    }

    /// Move a session to a new client address. Returns the previous address
    /// when it changed.
    pub fn rebind(&mut self, client_id: &ClientId, addr: SocketAddr) -> Option<SocketAddr> {
        let session = self.sessions.get_mut(client_id)?;
        let old_key = session.route_key();
        if old_key.addr == addr {
            return None;
        }
        session.set_addr(addr);
        let new_key = session.route_key();

        self.routes.insert(new_key, *client_id);
        if self.routes.get(&old_key) == Some(client_id) {
            self.routes.remove(&old_key);
        }
        Some(old_key.addr)
    }

    /// Drop a session and its route. Removing an unknown client ID is a
    /// no-op, so teardown paths may race safely.
    pub fn remove(&mut self, client_id: &ClientId) -> Option<S> {
        let session = self.sessions.remove(client_id)?;
        let key = session.route_key();
        if self.routes.get(&key) == Some(client_id) {
            self.routes.remove(&key);
        }
        Some(session)
    }

    #[cfg(test)]
    fn route_count(&self) -> usize {
        self.routes.len()
    }
}
