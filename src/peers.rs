//! Peer gossip table: which other portals this one knows about.
//!
//! Leases move monotonically upward only — a stale gossip packet racing
//! in behind a fresher one can never shorten a peer's lease. Static
//! peers (from the config file) are permanent and are never downgraded
//! by a live gossip entry for the same host.

use codec::PeerEntry;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

use crate::redirect::LEASE_SECONDS;

const CAPACITY: usize = 128;

#[derive(Debug, Clone, Serialize)]
pub struct Peer {
    pub host: String,
    /// 0 = static/permanent, 1 = tombstoned (expired, pending reap), else
    /// absolute unix expiry.
    pub expiration: i64,
}

#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<String, Peer>>,
    own_host: Mutex<Option<String>>,
}

impl PeerTable {
    pub fn set_own_host(&self, host: String) {
        *self.own_host.lock() = Some(host);
    }

    fn is_own(&self, host: &str) -> bool {
        self.own_host.lock().as_deref() == Some(host)
    }

    /// Adds a permanent peer from the static config file. Silently
    /// ignored for the portal's own advertised host, since gossiping to
    /// yourself is a no-op that would otherwise just occupy a table slot.
    pub fn add_static(&self, host: String) {
        if self.is_own(&host) {
            return;
        }

        let mut map = self.peers.lock();
        if !map.contains_key(&host) && map.len() >= CAPACITY {
            log::warn!("peer table full ({CAPACITY}), dropping static peer {host}");
            return;
        }
        map.insert(host.clone(), Peer { host, expiration: 0 });
    }

    /// Learns one peer entry from an inbound `PEER` gossip datagram.
    /// Returns `true` if this host had expired and is now recovering
    /// (for `PEER/RECOVER` logging at the call site).
    pub fn learn(&self, entry: PeerEntry, now: i64) -> bool {
        if self.is_own(&entry.host) {
            return false;
        }

        let lease = match entry.expiration {
            Some(exp) if exp > now => exp,
            _ => now + LEASE_SECONDS,
        };

        let mut map = self.peers.lock();
        match map.get_mut(&entry.host) {
            Some(p) if p.expiration == 0 => false,
            Some(p) => {
                if lease <= p.expiration {
                    return false;
                }
                let recovering = p.expiration != 0 && p.expiration <= now;
                p.expiration = lease;
                recovering
            }
            None => {
                if map.len() >= CAPACITY {
                    log::warn!("peer table full ({CAPACITY}), dropping {}", entry.host);
                    return false;
                }
                map.insert(entry.host.clone(), Peer { host: entry.host, expiration: lease });
                false
            }
        }
    }

    /// Tombstones every dynamic peer whose lease has passed. Returns the
    /// hosts that just transitioned, so the caller logs `PEER/EXPIRE`
    /// exactly once per transition rather than once per sweep.
    pub fn expire(&self, now: i64) -> Vec<String> {
        let mut map = self.peers.lock();
        let mut expired = Vec::new();

        for p in map.values_mut() {
            if p.expiration > 1 && p.expiration <= now {
                p.expiration = 1;
                expired.push(p.host.clone());
            }
        }
        expired
    }

    /// Drops tombstoned peers entirely so the table doesn't accumulate
    /// dead entries forever.
    pub fn reap(&self, now: i64) {
        self.peers.lock().retain(|_, p| !(p.expiration == 1 && p.expiration <= now));
    }

    pub fn list(&self) -> Vec<Peer> {
        self.peers.lock().values().cloned().collect()
    }

    /// Hosts eligible for the 30s gossip fan-out: anything not
    /// tombstoned, excluding ourselves.
    pub fn live_hosts(&self) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.expiration != 1)
            .map(|p| p.host.clone())
            .collect()
    }

    /// Statically-configured peers (permanent, `expiration == 0`), the
    /// set the gossip heartbeat unicasts to directly so off-subnet
    /// peers that broadcast can't reach still hear from us.
    pub fn static_hosts(&self) -> Vec<String> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.expiration == 0)
            .map(|p| p.host.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(host: &str, exp: Option<i64>) -> PeerEntry {
        PeerEntry { host: host.to_string(), expiration: exp }
    }

    #[test]
    fn static_peer_is_never_downgraded() {
        let t = PeerTable::default();
        t.add_static("host-a".into());
        t.learn(entry("host-a", Some(100)), 0);
        assert_eq!(t.list()[0].expiration, 0);
    }

    #[test]
    fn lease_only_moves_forward() {
        let t = PeerTable::default();
        t.learn(entry("host-b", Some(200)), 0);
        t.learn(entry("host-b", Some(100)), 0);
        assert_eq!(t.list().iter().find(|p| p.host == "host-b").unwrap().expiration, 200);
    }

    #[test]
    fn expire_then_recover_reports_transition_once() {
        let t = PeerTable::default();
        t.learn(entry("host-c", Some(10)), 0);
        let expired = t.expire(20);
        assert_eq!(expired, vec!["host-c".to_string()]);
        assert_eq!(t.expire(21), Vec::<String>::new());

        let recovered = t.learn(entry("host-c", Some(100)), 20);
        assert!(recovered);
    }

    #[test]
    fn own_host_is_never_learned() {
        let t = PeerTable::default();
        t.set_own_host("me:70".into());
        t.learn(entry("me:70", Some(1000)), 0);
        assert!(t.list().is_empty());
    }

    #[test]
    fn reap_drops_tombstoned_peers() {
        let t = PeerTable::default();
        t.learn(entry("host-d", Some(10)), 0);
        t.expire(20);
        t.reap(20);
        assert!(t.list().is_empty());
    }
}
