//! Peer registry: live peers in connection order with a round-robin cursor.
//!
//! Ordering is an intrusive doubly-linked list threaded through a lookup table keyed by
//! [`PeerId`], so add, remove and next are all O(1) and removal never disturbs the relative
//! order of the survivors.

use std::collections::HashMap;

use crate::identity::PeerId;

#[derive(Debug, Clone, Copy)]
struct Links {
    prev: Option<PeerId>,
    next: Option<PeerId>,
}

/// Round-robin ring of connected peers.
///
/// Invariant: `cursor` is `Some` (and names a live peer) iff the ring is non-empty.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    links: HashMap<PeerId, Links>,
    head: Option<PeerId>,
    tail: Option<PeerId>,
    /// Peer that the next call to [`PeerRegistry::next`] returns.
    cursor: Option<PeerId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    /// Append at the end of connection order. Returns false if the peer was already present.
    pub fn add(&mut self, peer: PeerId) -> bool {
        if self.links.contains_key(&peer) {
            return false;
        }
        self.links.insert(
            peer,
            Links {
                prev: self.tail,
                next: None,
            },
        );
        match self.tail {
            Some(t) => {
                if let Some(l) = self.links.get_mut(&t) {
                    l.next = Some(peer);
                }
            }
            None => self.head = Some(peer),
        }
        self.tail = Some(peer);
        if self.cursor.is_none() {
            self.cursor = Some(peer);
        }
        true
    }

    /// Unlink a peer. If it was under the cursor, the cursor moves to the next live peer
    /// (wrapping), or resets when the ring becomes empty. Returns false if unknown.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let Some(Links { prev, next }) = self.links.remove(peer) else {
            return false;
        };
        match prev {
            Some(p) => {
                if let Some(l) = self.links.get_mut(&p) {
                    l.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(l) = self.links.get_mut(&n) {
                    l.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if self.cursor == Some(*peer) {
            self.cursor = next.or(self.head);
        }
        true
    }

    /// Return the peer under the cursor and advance past it, wrapping after the last.
    /// `None` if the ring is empty.
    pub fn next(&mut self) -> Option<PeerId> {
        let current = self.cursor?;
        let after = self.links.get(&current).and_then(|l| l.next);
        self.cursor = after.or(self.head);
        Some(current)
    }

    /// Peers in connection order, starting from the oldest.
    pub fn iter(&self) -> impl Iterator<Item = PeerId> + '_ {
        std::iter::successors(self.head, move |p| self.links.get(p).and_then(|l| l.next))
    }
}
