//! Per-circuit state tables.
//!
//! Every table maps a [`CircuitId`] to one value and records when the entry
//! was last touched. All operations take the table lock for their whole
//! duration and never await, so each one is atomic with respect to the
//! others and no lock is ever held across a suspension point.
//!
//! A relay keeps three tables ([`NodeTables`]); a client keeps its circuit
//! table and the [`SenderKeyLedger`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use quinn::Connection;
use veil_types::{CircuitId, NodeRegistration};

use crate::handshake::HopSecret;

struct Entry<V> {
    value: V,
    last_used: Instant,
}

impl<V> Entry<V> {
    fn new(value: V) -> Self {
        Self {
            value,
            last_used: Instant::now(),
        }
    }
}

/// Thread-safe map from circuit id to `V`.
pub struct CircuitTable<V> {
    entries: Mutex<HashMap<CircuitId, Entry<V>>>,
}

impl<V> CircuitTable<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    // A panic while holding the lock cannot leave a half-written entry, so a
    // poisoned table is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<CircuitId, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace. Returns the previous value.
    pub fn put(&self, id: CircuitId, value: V) -> Option<V> {
        self.lock().insert(id, Entry::new(value)).map(|e| e.value)
    }

    /// Insert only if `id` is vacant. Returns whether the value was inserted.
    pub fn insert_if_absent(&self, id: CircuitId, value: V) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(id, Entry::new(value));
        true
    }

    /// Apply `f` to the entry in place. Returns whether the entry existed.
    pub fn update(&self, id: CircuitId, f: impl FnOnce(&mut V)) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                f(&mut entry.value);
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove and return the entry. Removing a missing id is a no-op.
    pub fn remove(&self, id: CircuitId) -> Option<V> {
        self.lock().remove(&id).map(|e| e.value)
    }

    pub fn contains(&self, id: CircuitId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the ids currently present.
    pub fn ids(&self) -> Vec<CircuitId> {
        self.lock().keys().copied().collect()
    }

    /// Ids whose value satisfies `pred`. Does not count as a use.
    pub fn ids_where(&self, pred: impl Fn(&V) -> bool) -> Vec<CircuitId> {
        self.lock()
            .iter()
            .filter(|(_, entry)| pred(&entry.value))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove every entry untouched for at least `max_idle`.
    pub fn expire_idle(&self, max_idle: Duration) -> Vec<CircuitId> {
        let mut expired = Vec::new();
        self.lock().retain(|id, entry| {
            let keep = entry.last_used.elapsed() < max_idle;
            if !keep {
                expired.push(*id);
            }
            keep
        });
        expired
    }
}

impl<V: Clone> CircuitTable<V> {
    /// Clone of the value for `id`. Counts as a use of the entry.
    pub fn get(&self, id: CircuitId) -> Option<V> {
        self.lock().get_mut(&id).map(|entry| {
            entry.last_used = Instant::now();
            entry.value.clone()
        })
    }
}

impl<V> Default for CircuitTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// A relay's view of where a circuit comes from and goes to.
///
/// `previous_hop` is `None` only at the entry (the client is not recorded),
/// `next_hop` is `None` only at the current last hop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HopLinkage {
    pub previous_hop: Option<SocketAddr>,
    pub next_hop: Option<SocketAddr>,
}

/// Live connections a relay forwards a circuit's cells over.
#[derive(Clone, Debug, Default)]
pub struct RelayLinks {
    /// Connection the `create` arrived on. At the entry this is the
    /// client's connection; it is never used to push cells there.
    pub toward_client: Option<Connection>,
    /// Connection to the next hop, once the circuit has been extended.
    pub toward_exit: Option<Connection>,
}

impl RelayLinks {
    /// Whether either link is the connection with `stable_id`.
    pub fn uses(&self, stable_id: usize) -> bool {
        [&self.toward_client, &self.toward_exit]
            .into_iter()
            .flatten()
            .any(|conn| conn.stable_id() == stable_id)
    }
}

/// Close code for a link whose last circuit has been forgotten.
pub const TEARDOWN_CODE: u32 = 3;

/// The three tables a relay node keeps.
#[derive(Default)]
pub struct NodeTables {
    pub circuits: CircuitTable<HopLinkage>,
    pub keys: CircuitTable<HopSecret>,
    pub relays: CircuitTable<RelayLinks>,
}

impl NodeTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every trace of `id` and close the circuit's links, unless
    /// another circuit still runs over them. Closing a link makes the relay
    /// on its far side forget its half of the circuit in turn.
    pub fn forget(&self, id: CircuitId) {
        self.circuits.remove(id);
        self.keys.remove(id);
        if let Some(links) = self.relays.remove(id) {
            self.release(links);
        }
    }

    /// Forget every circuit running over the connection `stable_id`, once
    /// that connection is gone. Returns the forgotten ids.
    pub fn forget_connection(&self, stable_id: usize) -> Vec<CircuitId> {
        let ids = self.relays.ids_where(|links| links.uses(stable_id));
        for id in &ids {
            self.forget(*id);
        }
        ids
    }

    /// Close each of `links` that no circuit in the table runs over.
    pub fn release(&self, links: RelayLinks) {
        for conn in [links.toward_client, links.toward_exit].into_iter().flatten() {
            let stable_id = conn.stable_id();
            if self.relays.ids_where(|other| other.uses(stable_id)).is_empty() {
                conn.close(TEARDOWN_CODE.into(), b"circuit forgotten");
            }
        }
    }

    /// Forget circuits whose linkage has been idle for `max_idle`.
    ///
    /// Every cell handled for a circuit touches its linkage entry, so the
    /// linkage table decides. Key and connection entries left without a
    /// linkage are dropped too.
    pub fn sweep(&self, max_idle: Duration) -> Vec<CircuitId> {
        let mut expired = self.circuits.expire_idle(max_idle);
        let orphans = self
            .keys
            .ids()
            .into_iter()
            .chain(self.relays.ids())
            .filter(|id| !self.circuits.contains(*id));
        expired.extend(orphans);
        expired.sort_unstable();
        expired.dedup();
        for id in &expired {
            self.forget(*id);
        }
        expired
    }
}

/// A circuit as seen by the client that built it.
#[derive(Clone, Debug)]
pub struct ClientCircuit {
    /// Relays in hop order (entry first).
    pub path: Vec<NodeRegistration>,
    /// Connection to the entry relay, once it is established.
    pub entry: Option<Connection>,
}

/// Client-side record of hop secrets per circuit, entry first.
#[derive(Default)]
pub struct SenderKeyLedger {
    hops: CircuitTable<Vec<HopSecret>>,
}

impl SenderKeyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty ledger entry. Returns `false` if one already exists.
    pub fn open(&self, id: CircuitId) -> bool {
        self.hops.insert_if_absent(id, Vec::new())
    }

    /// Record the secret of the next hop. Returns whether the entry existed.
    pub fn append(&self, id: CircuitId, secret: HopSecret) -> bool {
        self.hops.update(id, move |hops| hops.push(secret))
    }

    /// Secrets in hop order.
    pub fn hops(&self, id: CircuitId) -> Option<Vec<HopSecret>> {
        self.hops.get(id)
    }

    /// Number of hops recorded for `id`, if the entry exists.
    pub fn hop_count(&self, id: CircuitId) -> Option<usize> {
        self.hops.get(id).map(|hops| hops.len())
    }

    pub fn contains(&self, id: CircuitId) -> bool {
        self.hops.contains(id)
    }

    pub fn remove(&self, id: CircuitId) -> Option<Vec<HopSecret>> {
        self.hops.remove(id)
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use veil_transport::quic::QuicConfig;
    use veil_transport::QuicNode;

    /// Both ends of one loopback connection, with the endpoints kept alive.
    async fn connection_pair() -> (QuicNode, QuicNode, Connection, Connection) {
        let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
        let server = QuicNode::new(QuicConfig::bind(loopback)).expect("server endpoint");
        let client = QuicNode::client(loopback).expect("client endpoint");
        let (outgoing, incoming) = tokio::join!(client.connect(server.local_addr()), async {
            server.accept().await.expect("incoming").await
        });
        let outgoing = outgoing.expect("connect");
        let incoming = incoming.expect("accept");
        (server, client, outgoing, incoming)
    }

    #[test]
    fn test_put_is_last_writer_wins() {
        let table = CircuitTable::new();
        assert_eq!(table.put(CircuitId(1), "a"), None);
        assert_eq!(table.put(CircuitId(1), "b"), Some("a"));
        assert_eq!(table.get(CircuitId(1)), Some("b"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_if_absent() {
        let table = CircuitTable::new();
        assert!(table.insert_if_absent(CircuitId(1), 1));
        assert!(!table.insert_if_absent(CircuitId(1), 2));
        assert_eq!(table.get(CircuitId(1)), Some(1));
    }

    #[test]
    fn test_update_and_remove() {
        let table = CircuitTable::new();
        assert!(!table.update(CircuitId(9), |v: &mut u32| *v += 1));
        table.put(CircuitId(9), 1u32);
        assert!(table.update(CircuitId(9), |v| *v += 1));
        assert_eq!(table.remove(CircuitId(9)), Some(2));
        assert_eq!(table.remove(CircuitId(9)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_concurrent_puts_are_all_visible() {
        let table = Arc::new(CircuitTable::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..250u64 {
                        let id = CircuitId(t * 1000 + i);
                        table.put(id, id.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }
        assert_eq!(table.len(), 2000);
        for t in 0..8u64 {
            for i in 0..250u64 {
                let id = CircuitId(t * 1000 + i);
                assert_eq!(table.get(id), Some(id.0));
            }
        }
    }

    #[test]
    fn test_concurrent_insert_if_absent_has_one_winner() {
        let table = Arc::new(CircuitTable::new());
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || table.insert_if_absent(CircuitId(7), t))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .filter(|inserted| *inserted)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_expire_idle() {
        let table = CircuitTable::new();
        table.put(CircuitId(1), ());
        table.put(CircuitId(2), ());
        std::thread::sleep(Duration::from_millis(30));
        table.get(CircuitId(2));
        let expired = table.expire_idle(Duration::from_millis(20));
        assert_eq!(expired, vec![CircuitId(1)]);
        assert!(table.contains(CircuitId(2)));
    }

    #[test]
    fn test_node_sweep_clears_all_tables() {
        let tables = NodeTables::new();
        let id = CircuitId(5);
        tables.circuits.put(id, HopLinkage::default());
        tables.keys.put(id, HopSecret::from_seed([1u8; 32]));
        tables.relays.put(id, RelayLinks::default());
        // A key without linkage is an orphan.
        tables.keys.put(CircuitId(6), HopSecret::from_seed([2u8; 32]));

        std::thread::sleep(Duration::from_millis(30));
        let mut expired = tables.sweep(Duration::from_millis(20));
        expired.sort_unstable();
        assert_eq!(expired, vec![CircuitId(5), CircuitId(6)]);
        assert!(tables.circuits.is_empty());
        assert!(tables.keys.is_empty());
        assert!(tables.relays.is_empty());
    }

    #[test]
    fn test_sweep_keeps_recent_circuits() {
        let tables = NodeTables::new();
        tables.circuits.put(CircuitId(1), HopLinkage::default());
        tables.keys.put(CircuitId(1), HopSecret::from_seed([1u8; 32]));
        assert!(tables.sweep(Duration::from_secs(60)).is_empty());
        assert_eq!(tables.keys.len(), 1);
    }

    #[test]
    fn test_ids_where_filters_without_touching() {
        let table = CircuitTable::new();
        for i in 1..=4u64 {
            table.put(CircuitId(i), i);
        }
        std::thread::sleep(Duration::from_millis(30));
        let mut even = table.ids_where(|v| v % 2 == 0);
        even.sort_unstable();
        assert_eq!(even, vec![CircuitId(2), CircuitId(4)]);
        assert_eq!(table.expire_idle(Duration::from_millis(20)).len(), 4);
    }

    #[test]
    fn test_unlinked_circuit_uses_no_connection() {
        let links = RelayLinks::default();
        assert!(!links.uses(0));
        let tables = NodeTables::new();
        tables.relays.put(CircuitId(1), links);
        assert!(tables.forget_connection(0).is_empty());
        assert_eq!(tables.relays.len(), 1);
    }

    #[tokio::test]
    async fn test_forget_closes_links_no_circuit_uses() {
        let (_server, _client, outgoing, incoming) = connection_pair().await;
        let tables = NodeTables::new();
        for id in [CircuitId(1), CircuitId(2)] {
            tables.circuits.put(id, HopLinkage::default());
            tables.relays.put(
                id,
                RelayLinks {
                    toward_client: None,
                    toward_exit: Some(outgoing.clone()),
                },
            );
        }

        tables.forget(CircuitId(1));
        assert!(outgoing.close_reason().is_none(), "circuit 2 still runs over it");
        tables.forget(CircuitId(2));
        assert!(outgoing.close_reason().is_some());

        let seen = tokio::time::timeout(Duration::from_secs(2), incoming.closed())
            .await
            .expect("far side notices the close");
        assert!(matches!(seen, quinn::ConnectionError::ApplicationClosed(_)));
    }

    #[tokio::test]
    async fn test_lost_connection_forgets_its_circuits() {
        let (_a, _b, _from_previous, toward_client) = connection_pair().await;
        let (_c, _d, toward_exit, _at_next) = connection_pair().await;
        let tables = NodeTables::new();
        let id = CircuitId(3);
        tables.circuits.put(id, HopLinkage::default());
        tables.keys.put(id, HopSecret::from_seed([3u8; 32]));
        tables.relays.put(
            id,
            RelayLinks {
                toward_client: Some(toward_client.clone()),
                toward_exit: Some(toward_exit.clone()),
            },
        );
        tables.circuits.put(CircuitId(4), HopLinkage::default());

        assert_eq!(tables.forget_connection(toward_client.stable_id()), vec![id]);
        assert!(!tables.circuits.contains(id));
        assert!(tables.keys.is_empty());
        assert!(tables.relays.is_empty());
        assert!(toward_exit.close_reason().is_some(), "teardown continues downstream");
        assert!(tables.circuits.contains(CircuitId(4)));
    }

    #[test]
    fn test_ledger_keeps_hop_order() {
        let ledger = SenderKeyLedger::new();
        let id = CircuitId(3);
        assert!(!ledger.append(id, HopSecret::from_seed([0u8; 32])));
        assert!(ledger.open(id));
        assert!(!ledger.open(id));
        for seed in 1..=3u8 {
            assert!(ledger.append(id, HopSecret::from_seed([seed; 32])));
        }
        let hops = ledger.hops(id).expect("ledger entry");
        assert_eq!(hops.len(), 3);
        for (i, hop) in hops.iter().enumerate() {
            assert_eq!(hop.forward_key(), HopSecret::from_seed([i as u8 + 1; 32]).forward_key());
        }
        assert_eq!(ledger.hop_count(id), Some(3));
        assert!(ledger.remove(id).is_some());
        assert!(!ledger.contains(id));
    }
}
