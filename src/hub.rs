//! Shared connection state.
//!
//! The nickname registry and the table of live connections sit behind a single lock so a chat can
//! resolve a name, find the live connection behind it and mark both sides as engaged without
//! another task changing the picture in between. No method does network I/O while holding the
//! lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError, Sender, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use crate::error::{Error, Result};

/// Lines queued for a connection's writer task.
pub type Outbound = Sender<String>;

/// How many lines may wait for a slow reader before new ones are dropped.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Identifies one chat so late cleanup can't touch a newer one.
pub type ChatId = u64;

/// Cloneable way to reach a live connection. The socket itself stays with the task that accepted
/// it; everyone else writes through here.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    addr: SocketAddr,
    outbound: Outbound,
}

impl ConnectionHandle {
    pub fn new(addr: SocketAddr, outbound: Outbound) -> ConnectionHandle {
        ConnectionHandle { addr, outbound }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a line for the connection. Returns false once the connection is gone.
    ///
    /// A connection whose reader has fallen `OUTBOUND_CAPACITY` lines behind loses the line.
    pub fn send<S: Into<String>>(&self, line: S) -> bool {
        match self.outbound.try_send(line.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(addr = %self.addr, "outbound queue full, dropping line");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug)]
enum Engagement {
    Idle,
    /// Started a chat; its own reader is lent to the relay.
    Initiator(ChatId),
    /// Was called into a chat; its dispatcher feeds lines through this route.
    Target(ChatId, UnboundedSender<String>),
}

#[derive(Debug)]
struct Connection {
    handle: ConnectionHandle,
    engagement: Engagement,
}

#[derive(Debug, Default)]
struct Tables {
    names: HashMap<String, SocketAddr>,
    addrs: HashMap<SocketAddr, String>,
    active: HashMap<SocketAddr, Connection>,
    next_chat: ChatId,
}

/// Both ends of a freshly engaged chat.
#[derive(Debug)]
pub struct Engaged {
    pub chat: ChatId,
    pub you: ConnectionHandle,
    pub peer: ConnectionHandle,
    /// Lines the peer's dispatcher routes to the relay.
    pub peer_lines: UnboundedReceiver<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Hub {
    inner: Arc<Mutex<Tables>>,
}

impl Hub {
    pub fn new() -> Hub {
        Hub::default()
    }

    // A panic elsewhere never leaves the maps half updated, so a poisoned lock is still usable.
    fn tables(&self) -> MutexGuard<Tables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `name` to `addr`, replacing whatever either side was bound to before.
    pub fn register(&self, name: &str, addr: SocketAddr) {
        let mut tables = self.tables();
        let Tables { names, addrs, .. } = &mut *tables;
        if let Some(old_addr) = names.insert(name.to_string(), addr) {
            if old_addr != addr {
                addrs.remove(&old_addr);
            }
        }
        if let Some(old_name) = addrs.insert(addr, name.to_string()) {
            if old_name != name {
                names.remove(&old_name);
            }
        }
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<SocketAddr> {
        self.tables().names.get(name).cloned()
    }

    pub fn lookup_by_address(&self, addr: SocketAddr) -> Option<String> {
        self.tables().addrs.get(&addr).cloned()
    }

    pub fn insert(&self, handle: ConnectionHandle) {
        let addr = handle.addr();
        self.tables().active.insert(
            addr,
            Connection {
                handle,
                engagement: Engagement::Idle,
            },
        );
    }

    pub fn remove(&self, addr: SocketAddr) -> Option<ConnectionHandle> {
        self.tables().active.remove(&addr).map(|conn| conn.handle)
    }

    pub fn lookup(&self, addr: SocketAddr) -> Option<ConnectionHandle> {
        self.tables()
            .active
            .get(&addr)
            .map(|conn| conn.handle.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.tables().active.len()
    }

    /// Atomically mark `you` as starting a chat with `peer`.
    pub fn engage(&self, you: SocketAddr, peer: SocketAddr) -> Result<Engaged> {
        if you == peer {
            return Err(Error::Busy);
        }
        let mut tables = self.tables();
        let (you_handle, peer_handle) = match (tables.active.get(&you), tables.active.get(&peer)) {
            (Some(y), Some(p)) => {
                let idle = |conn: &Connection| matches!(conn.engagement, Engagement::Idle);
                if !idle(y) || !idle(p) {
                    return Err(Error::Busy);
                }
                (y.handle.clone(), p.handle.clone())
            }
            _ => return Err(Error::NotConnected),
        };

        let chat = tables.next_chat;
        tables.next_chat += 1;
        let (route, peer_lines) = mpsc::unbounded_channel();
        if let Some(conn) = tables.active.get_mut(&you) {
            conn.engagement = Engagement::Initiator(chat);
        }
        if let Some(conn) = tables.active.get_mut(&peer) {
            conn.engagement = Engagement::Target(chat, route);
        }
        Ok(Engaged {
            chat,
            you: you_handle,
            peer: peer_handle,
            peer_lines,
        })
    }

    /// Return both sides of a finished chat to command handling.
    ///
    /// Returns false if `peer` had already left `chat` on its own.
    pub fn release(&self, chat: ChatId, you: SocketAddr, peer: SocketAddr) -> bool {
        let mut tables = self.tables();
        if let Some(conn) = tables.active.get_mut(&you) {
            if matches!(conn.engagement, Engagement::Initiator(id) if id == chat) {
                conn.engagement = Engagement::Idle;
            }
        }
        match tables.active.get_mut(&peer) {
            Some(conn) if matches!(conn.engagement, Engagement::Target(id, _) if id == chat) => {
                conn.engagement = Engagement::Idle;
                true
            }
            _ => false,
        }
    }

    /// The target of a chat walks out. Hands back the route so the relay can be told.
    pub fn leave(&self, addr: SocketAddr) -> Option<UnboundedSender<String>> {
        let mut tables = self.tables();
        let conn = tables.active.get_mut(&addr)?;
        match std::mem::replace(&mut conn.engagement, Engagement::Idle) {
            Engagement::Target(_, route) => Some(route),
            other => {
                conn.engagement = other;
                None
            }
        }
    }

    /// Where lines read from `addr` go while it is the target of a chat.
    pub fn route(&self, addr: SocketAddr) -> Option<UnboundedSender<String>> {
        match self.tables().active.get(&addr) {
            Some(Connection {
                engagement: Engagement::Target(_, route),
                ..
            }) => Some(route.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn handle(port: u16) -> (ConnectionHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (ConnectionHandle::new(addr(port), tx), rx)
    }

    #[test]
    fn register_resolves_both_ways() {
        let hub = Hub::new();
        hub.register("alice", addr(1000));
        assert_eq!(hub.lookup_by_name("alice"), Some(addr(1000)));
        assert_eq!(hub.lookup_by_address(addr(1000)), Some("alice".to_string()));
        assert_eq!(hub.lookup_by_name("bob"), None);
    }

    #[test]
    fn reregistering_a_name_moves_it() {
        let hub = Hub::new();
        hub.register("alice", addr(1000));
        hub.register("alice", addr(2000));

        assert_eq!(hub.lookup_by_name("alice"), Some(addr(2000)));
        assert_eq!(hub.lookup_by_address(addr(2000)), Some("alice".to_string()));
        assert_eq!(hub.lookup_by_address(addr(1000)), None);
    }

    #[test]
    fn renaming_an_address_drops_the_old_name() {
        let hub = Hub::new();
        hub.register("alice", addr(1000));
        hub.register("alicia", addr(1000));

        assert_eq!(hub.lookup_by_name("alice"), None);
        assert_eq!(hub.lookup_by_name("alicia"), Some(addr(1000)));
        assert_eq!(hub.lookup_by_address(addr(1000)), Some("alicia".to_string()));
    }

    #[test]
    fn removing_a_connection_keeps_the_name() {
        let hub = Hub::new();
        let (alice, _rx) = handle(1000);
        hub.insert(alice);
        hub.register("alice", addr(1000));
        assert_eq!(hub.lookup(addr(1000)).map(|h| h.addr()), Some(addr(1000)));

        assert!(hub.remove(addr(1000)).is_some());
        assert!(hub.lookup(addr(1000)).is_none());
        assert_eq!(hub.lookup_by_name("alice"), Some(addr(1000)));
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn handle_send_reaches_writer() {
        let (alice, mut rx) = handle(1000);
        assert!(alice.send("hi"));
        assert_eq!(rx.try_recv().unwrap(), "hi");
        drop(rx);
        assert!(!alice.send("gone"));
    }

    #[test]
    fn engage_routes_peer_lines_until_release() {
        let hub = Hub::new();
        let (alice, _a) = handle(1000);
        let (bob, _b) = handle(2000);
        hub.insert(alice);
        hub.insert(bob);

        let mut engaged = hub.engage(addr(1000), addr(2000)).unwrap();
        assert_eq!(engaged.peer.addr(), addr(2000));
        assert!(hub.route(addr(1000)).is_none());

        let route = hub.route(addr(2000)).unwrap();
        route.send("hello".to_string()).unwrap();
        assert_eq!(engaged.peer_lines.try_recv().unwrap(), "hello");

        assert!(hub.release(engaged.chat, addr(1000), addr(2000)));
        drop(route);
        assert!(hub.route(addr(2000)).is_none());
        assert!(engaged.peer_lines.try_recv().is_err());
    }

    #[test]
    fn engage_rejects_busy_self_and_offline() {
        let hub = Hub::new();
        let (alice, _a) = handle(1000);
        let (bob, _b) = handle(2000);
        let (carol, _c) = handle(3000);
        hub.insert(alice);
        hub.insert(bob);
        hub.insert(carol);

        match hub.engage(addr(1000), addr(1000)) {
            Err(Error::Busy) => {}
            other => panic!("unexpected {:?}", other),
        }
        match hub.engage(addr(1000), addr(4000)) {
            Err(Error::NotConnected) => {}
            other => panic!("unexpected {:?}", other),
        }

        let engaged = hub.engage(addr(1000), addr(2000)).unwrap();
        match hub.engage(addr(3000), addr(2000)) {
            Err(Error::Busy) => {}
            other => panic!("unexpected {:?}", other),
        }
        match hub.engage(addr(3000), addr(1000)) {
            Err(Error::Busy) => {}
            other => panic!("unexpected {:?}", other),
        }

        assert!(hub.release(engaged.chat, addr(1000), addr(2000)));
        assert!(hub.engage(addr(3000), addr(2000)).is_ok());
    }

    #[test]
    fn full_queue_drops_lines_but_stays_connected() {
        let (tx, mut rx) = mpsc::channel(1);
        let alice = ConnectionHandle::new(addr(1000), tx);
        assert!(alice.send("first"));
        assert!(alice.send("dropped"));
        assert_eq!(rx.try_recv().unwrap(), "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn target_leaving_stops_routing_at_once() {
        let hub = Hub::new();
        let (alice, _a) = handle(1000);
        let (bob, _b) = handle(2000);
        hub.insert(alice);
        hub.insert(bob);
        let mut engaged = hub.engage(addr(1000), addr(2000)).unwrap();

        assert!(hub.leave(addr(1000)).is_none());
        let route = hub.leave(addr(2000)).unwrap();
        route.send("\\q".to_string()).unwrap();
        assert_eq!(engaged.peer_lines.try_recv().unwrap(), "\\q");
        assert!(hub.route(addr(2000)).is_none());
        assert!(hub.leave(addr(2000)).is_none());

        // The initiator's cleanup must not report or touch a chat bob already left.
        assert!(!hub.release(engaged.chat, addr(1000), addr(2000)));
        assert!(hub.engage(addr(1000), addr(2000)).is_ok());
    }

    #[test]
    fn stale_release_leaves_newer_chat_alone() {
        let hub = Hub::new();
        let (alice, _a) = handle(1000);
        let (bob, _b) = handle(2000);
        let (carol, _c) = handle(3000);
        hub.insert(alice);
        hub.insert(bob);
        hub.insert(carol);

        let first = hub.engage(addr(1000), addr(2000)).unwrap();
        hub.leave(addr(2000));
        let second = hub.engage(addr(2000), addr(3000)).unwrap();

        assert!(!hub.release(first.chat, addr(1000), addr(2000)));
        // bob is still the initiator of the second chat.
        match hub.engage(addr(1000), addr(2000)) {
            Err(Error::Busy) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(hub.release(second.chat, addr(2000), addr(3000)));
    }
}
