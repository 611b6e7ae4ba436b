/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Peer tracking and the quorum / discovery policy.
//!
//! The [`PeerBook`] partitions known peers into `discovered`, `connected` and `banned`.
//! All mutation happens on the protocol thread, which also iterates the book, so mutation
//! and iteration are serialized by ownership.
//!
//! The [`PeerManager`] turns connection lifecycle notices into [`PeerAction`]s for the
//! protocol engine to carry out. Keeping the policy free of I/O makes it testable in
//! isolation.

use indexmap::IndexMap;

use crate::types::data_types::{BlockHeight, ConnectionId, PeerId, Timestamp};

/// A peer disconnects after this many undecodable messages.
pub const BAN_AFTER_CODEC_ERRORS: u32 = 3;

/// A peer pushes its tip to a newly connected peer when it is at least this many blocks
/// ahead.
pub const TIP_PUSH_LEAD: u64 = 3;

/// One peer known to the node.
#[derive(Clone)]
pub struct Peer {
    pub id: PeerId,
    pub multiaddr: String,
    pub connected_at: Timestamp,
    pub meta: PeerMeta,
}

/// Mutable bookkeeping attached to a peer.
#[derive(Clone, Default)]
pub struct PeerMeta {
    /// The height of the peer's tip, as last advertised.
    pub head_height: Option<BlockHeight>,
    /// Undecodable messages received from this peer so far.
    pub codec_errors: u32,
}

/// Known peers, partitioned by standing.
#[derive(Default)]
pub struct PeerBook {
    discovered: IndexMap<PeerId, Peer>,
    connected: IndexMap<PeerId, Peer>,
    banned: IndexMap<PeerId, Peer>,
}

impl PeerBook {
    pub fn new() -> PeerBook {
        PeerBook::default()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn discovered_count(&self) -> usize {
        self.discovered.len()
    }

    pub fn is_banned(&self, id: &PeerId) -> bool {
        self.banned.contains_key(id)
    }

    pub fn get_connected(&self, id: &PeerId) -> Option<&Peer> {
        self.connected.get(id)
    }

    /// Record a discovered peer. A peer already connected or banned is left where it is.
    pub fn add_discovered(&mut self, peer: Peer) {
        if self.connected.contains_key(&peer.id) || self.banned.contains_key(&peer.id) {
            return;
        }
        self.discovered.insert(peer.id.clone(), peer);
    }

    /// Move a peer into the connected partition.
    pub fn mark_connected(&mut self, mut peer: Peer) {
        self.discovered.shift_remove(&peer.id);
        peer.connected_at = Timestamp::now();
        self.connected.insert(peer.id.clone(), peer);
    }

    /// Drop a peer from the connected partition, back into discovered.
    pub fn mark_disconnected(&mut self, id: &PeerId) {
        if let Some(peer) = self.connected.shift_remove(id) {
            self.discovered.insert(id.clone(), peer);
        }
    }

    /// Move a peer into the banned partition.
    pub fn ban(&mut self, id: &PeerId) {
        if let Some(peer) = self
            .connected
            .shift_remove(id)
            .or_else(|| self.discovered.shift_remove(id))
        {
            self.banned.insert(id.clone(), peer);
        }
    }

    /// Record an undecodable message from a connected peer; returns the new tally.
    pub fn note_codec_error(&mut self, id: &PeerId) -> u32 {
        match self.connected.get_mut(id) {
            Some(peer) => {
                peer.meta.codec_errors += 1;
                peer.meta.codec_errors
            }
            None => 0,
        }
    }

    /// Record the advertised tip height of a connected peer.
    pub fn note_head_height(&mut self, id: &PeerId, height: BlockHeight) {
        if let Some(peer) = self.connected.get_mut(id) {
            peer.meta.head_height = Some(height);
        }
    }
}

/// What the protocol engine should do in response to a peer lifecycle notice.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerAction {
    /// Persist `bc.dht.quorum` with this value.
    PersistQuorum(u64),
    /// Ask the peer on this connection for its highest block.
    RequestTip(ConnectionId),
    /// Push the local tip to the peer on this connection.
    PushTip(ConnectionId),
    /// Resume overlay discovery; the quorum was lost.
    RestartDiscovery,
    /// Pause overlay discovery; the quorum is met.
    StopDiscovery,
    /// Tear down this connection and ban the peer behind it.
    Disconnect(ConnectionId),
}

/// Dial and quorum policy over the peer book.
pub struct PeerManager {
    book: PeerBook,
    conns: IndexMap<ConnectionId, PeerId>,
    /// Minimum connected peer count above which discovery is paused.
    quorum_size: u64,
    /// Forces the persisted quorum to the configured size on every connect, for nets too
    /// small to bootstrap organically.
    low_health_net: bool,
}

impl PeerManager {
    pub fn new(quorum_size: u64, low_health_net: bool) -> PeerManager {
        PeerManager {
            book: PeerBook::new(),
            conns: IndexMap::new(),
            quorum_size,
            low_health_net,
        }
    }

    pub fn book(&self) -> &PeerBook {
        &self.book
    }

    /// The peer behind a live connection, if known.
    pub fn peer_of(&self, conn: ConnectionId) -> Option<&Peer> {
        self.conns.get(&conn).and_then(|id| self.book.get_connected(id))
    }

    /// A peer connected. The first connection seeds the persisted quorum; every new peer is
    /// asked for its tip.
    pub fn on_connect(&mut self, conn: ConnectionId, peer: Peer) -> Vec<PeerAction> {
        if self.book.is_banned(&peer.id) {
            return vec![PeerAction::Disconnect(conn)];
        }
        let first_peer = self.book.connected_count() == 0;
        self.conns.insert(conn, peer.id.clone());
        self.book.mark_connected(peer);

        let mut actions = Vec::new();
        if self.low_health_net {
            actions.push(PeerAction::PersistQuorum(self.quorum_size));
        } else if first_peer {
            actions.push(PeerAction::PersistQuorum(1));
        }
        actions.push(PeerAction::RequestTip(conn));
        if self.book.connected_count() as u64 >= self.quorum_size {
            actions.push(PeerAction::StopDiscovery);
        }
        actions
    }

    /// A connection went away. Losing the quorum restarts discovery.
    pub fn on_disconnect(&mut self, conn: ConnectionId) -> Vec<PeerAction> {
        if let Some(id) = self.conns.shift_remove(&conn) {
            self.book.mark_disconnected(&id);
        }
        if (self.book.connected_count() as u64) < self.quorum_size {
            vec![PeerAction::RestartDiscovery]
        } else {
            Vec::new()
        }
    }

    /// Discovery surfaced a peer. Discovery is stopped once the quorum is met.
    pub fn on_discovered(&mut self, peer: Peer) -> Vec<PeerAction> {
        self.book.add_discovered(peer);
        if self.book.connected_count() as u64 >= self.quorum_size {
            vec![PeerAction::StopDiscovery]
        } else {
            Vec::new()
        }
    }

    /// A peer introduced itself over an established connection.
    pub fn on_intro(&mut self, conn: ConnectionId, id: PeerId, multiaddr: String) {
        if self.book.get_connected(&id).is_none() && !self.book.is_banned(&id) {
            let peer = Peer {
                id: id.clone(),
                multiaddr,
                connected_at: Timestamp::now(),
                meta: PeerMeta::default(),
            };
            self.book.mark_connected(peer);
        }
        self.conns.insert(conn, id);
    }

    /// A peer advertised its tip. If the local tip leads by at least [`TIP_PUSH_LEAD`],
    /// push it back.
    pub fn on_peer_tip(
        &mut self,
        conn: ConnectionId,
        height: BlockHeight,
        local_height: Option<BlockHeight>,
    ) -> Vec<PeerAction> {
        if let Some(id) = self.conns.get(&conn).cloned() {
            self.book.note_head_height(&id, height);
        }
        match local_height {
            Some(local) if local.int() >= height.int() + TIP_PUSH_LEAD => {
                vec![PeerAction::PushTip(conn)]
            }
            _ => Vec::new(),
        }
    }

    /// A message from this connection failed to decode. Repeated offenders are banned and
    /// disconnected.
    pub fn on_codec_error(&mut self, conn: ConnectionId) -> Vec<PeerAction> {
        let id = match self.conns.get(&conn).cloned() {
            Some(id) => id,
            None => return Vec::new(),
        };
        if self.book.note_codec_error(&id) >= BAN_AFTER_CODEC_ERRORS {
            log::warn!("banning peer {} after repeated undecodable messages", id);
            self.book.ban(&id);
            vec![PeerAction::Disconnect(conn)]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> Peer {
        Peer {
            id: PeerId::parse(bs58::encode(vec![n; 8]).into_string()).unwrap(),
            multiaddr: format!("/ip4/10.0.0.{}/tcp/16061", n),
            connected_at: Timestamp::new(0),
            meta: PeerMeta::default(),
        }
    }

    #[test]
    fn first_peer_seeds_quorum() {
        let mut manager = PeerManager::new(3, false);
        let actions = manager.on_connect(ConnectionId::new(1), peer(1));
        assert!(actions.contains(&PeerAction::PersistQuorum(1)));
        assert!(actions.contains(&PeerAction::RequestTip(ConnectionId::new(1))));

        let actions = manager.on_connect(ConnectionId::new(2), peer(2));
        assert!(!actions.iter().any(|a| matches!(a, PeerAction::PersistQuorum(_))));
    }

    #[test]
    fn low_health_net_persists_quorum_unconditionally() {
        let mut manager = PeerManager::new(1, true);
        let actions = manager.on_connect(ConnectionId::new(1), peer(1));
        assert!(actions.contains(&PeerAction::PersistQuorum(1)));
        // Quorum of 1 is met; discovery stops.
        assert!(actions.contains(&PeerAction::StopDiscovery));
    }

    #[test]
    fn losing_quorum_restarts_discovery() {
        let mut manager = PeerManager::new(2, false);
        manager.on_connect(ConnectionId::new(1), peer(1));
        manager.on_connect(ConnectionId::new(2), peer(2));
        assert!(manager.on_disconnect(ConnectionId::new(2)).contains(&PeerAction::RestartDiscovery));
    }

    #[test]
    fn repeated_codec_errors_ban_the_peer() {
        let mut manager = PeerManager::new(3, false);
        let conn = ConnectionId::new(1);
        manager.on_connect(conn, peer(1));
        assert!(manager.on_codec_error(conn).is_empty());
        assert!(manager.on_codec_error(conn).is_empty());
        assert_eq!(manager.on_codec_error(conn), vec![PeerAction::Disconnect(conn)]);
        // A banned peer reconnecting is turned away.
        assert_eq!(
            manager.on_connect(conn, peer(1)),
            vec![PeerAction::Disconnect(conn)]
        );
    }

    #[test]
    fn far_ahead_tip_is_pushed() {
        let mut manager = PeerManager::new(3, false);
        let conn = ConnectionId::new(1);
        manager.on_connect(conn, peer(1));
        let actions = manager.on_peer_tip(conn, BlockHeight::new(10), Some(BlockHeight::new(13)));
        assert_eq!(actions, vec![PeerAction::PushTip(conn)]);
        let actions = manager.on_peer_tip(conn, BlockHeight::new(12), Some(BlockHeight::new(13)));
        assert!(actions.is_empty());
    }
}
