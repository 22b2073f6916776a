//! UTXO reservation ledger
//!
//! A reservation is a purely local, in-memory claim on an outpoint that keeps
//! concurrent orders from spending the same inputs. Nothing here touches the
//! chain; the driver re-validates maker inputs separately.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::order::OrderId;

/// A wallet outpoint offered as swap collateral.
///
/// Identity is `(txid, vout)` only; the remaining fields are carried along for
/// validation and display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub txid: String,
    pub vout: u32,
    pub amount: f64,
    pub address: String,
    pub script_pub_key: String,
    pub confirmations: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_address: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signature: Vec<u8>,
}

impl PartialEq for UtxoEntry {
    fn eq(&self, other: &Self) -> bool {
        self.txid == other.txid && self.vout == other.vout
    }
}

impl Eq for UtxoEntry {}

impl PartialOrd for UtxoEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UtxoEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.txid, self.vout).cmp(&(&other.txid, other.vout))
    }
}

impl Hash for UtxoEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.txid.hash(state);
        self.vout.hash(state);
    }
}

impl fmt::Display for UtxoEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} {} {}", self.txid, self.vout, self.amount, self.address)
    }
}

/// Process-wide set of reserved outpoints with a per-order index.
///
/// Invariants: `by_order[x] ⊆ reserved` and reservations of distinct orders
/// are disjoint.
#[derive(Debug, Default)]
pub struct UtxoLedger {
    reserved: HashSet<UtxoEntry>,
    by_order: HashMap<OrderId, Vec<UtxoEntry>>,
    bad_funds: HashSet<String>,
    last_check: HashMap<OrderId, DateTime<Utc>>,
}

impl UtxoLedger {
    pub fn new() -> UtxoLedger {
        UtxoLedger::default()
    }

    /// Mark a funding txid as bad funds; outpoints of that txid are refused.
    pub fn blocklist(&mut self, txid: impl Into<String>) {
        self.bad_funds.insert(txid.into());
    }

    /// Check whether a reservation would be accepted.
    ///
    /// An order that already holds reservations passes unconditionally; the
    /// second leg of a join re-submits the same entries.
    pub fn check(&self, order_id: &OrderId, items: &[UtxoEntry]) -> bool {
        if self.by_order.contains_key(order_id) {
            return true;
        }
        items
            .iter()
            .all(|item| !self.reserved.contains(item) && !self.bad_funds.contains(&item.txid))
    }

    /// Reserve outpoints for an order, all or nothing.
    ///
    /// Entries already held by the same order are kept idempotently; a
    /// conflict with another order reserves nothing.
    pub fn reserve(&mut self, order_id: &OrderId, items: &[UtxoEntry]) -> bool {
        if items.is_empty() {
            return false;
        }

        let own: HashSet<&UtxoEntry> =
            self.by_order.get(order_id).map(|v| v.iter().collect()).unwrap_or_default();
        for item in items {
            if self.bad_funds.contains(&item.txid) {
                return false;
            }
            if self.reserved.contains(item) && !own.contains(item) {
                return false;
            }
        }

        let held = self.by_order.entry(order_id.clone()).or_default();
        let mut seen: HashSet<UtxoEntry> = held.iter().cloned().collect();
        for item in items {
            self.reserved.insert(item.clone());
            if seen.insert(item.clone()) {
                held.push(item.clone());
            }
        }
        true
    }

    /// Release every reservation held by an order.
    pub fn release(&mut self, order_id: &OrderId) -> bool {
        let Some(items) = self.by_order.remove(order_id) else {
            return false;
        };
        for item in &items {
            self.reserved.remove(item);
        }
        self.last_check.remove(order_id);
        true
    }

    /// Reserved outpoints of one order, or `None` for an unknown order.
    pub fn reserved_for(&self, order_id: &OrderId) -> Option<Vec<UtxoEntry>> {
        self.by_order.get(order_id).cloned()
    }

    /// Every reserved outpoint across all orders.
    pub fn all_reserved(&self) -> Vec<UtxoEntry> {
        self.reserved.iter().cloned().collect()
    }

    /// Record a maker-input recheck; returns false if the previous check is
    /// younger than `interval_secs` and the caller should skip this round.
    pub fn mark_checked(&mut self, order_id: &OrderId, interval_secs: i64) -> bool {
        let now = Utc::now();
        if let Some(prev) = self.last_check.get(order_id) {
            if (now - *prev).num_seconds() < interval_secs {
                return false;
            }
        }
        self.last_check.insert(order_id.clone(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(txid: &str, vout: u32) -> UtxoEntry {
        UtxoEntry {
            txid: txid.to_string(),
            vout,
            amount: 1.0,
            address: "addr".to_string(),
            script_pub_key: String::new(),
            confirmations: 10,
            raw_address: Vec::new(),
            signature: Vec::new(),
        }
    }

    fn oid(b: u8) -> OrderId {
        OrderId::from_bytes([b; 32])
    }

    #[test]
    fn identity_by_outpoint_only() {
        let mut a = utxo("aa", 0);
        let mut b = utxo("aa", 0);
        a.amount = 1.0;
        b.amount = 99.0;
        assert_eq!(a, b);
        assert!(utxo("aa", 0) < utxo("aa", 1));
        assert!(utxo("aa", 1) < utxo("ab", 0));
    }

    #[test]
    fn reservations_are_disjoint() {
        let mut ledger = UtxoLedger::new();
        assert!(ledger.reserve(&oid(1), &[utxo("aa", 0), utxo("aa", 1)]));
        assert!(!ledger.reserve(&oid(2), &[utxo("aa", 1), utxo("bb", 0)]));
        // conflict reserved nothing for order 2
        assert!(ledger.reserved_for(&oid(2)).is_none());
        assert!(!ledger.all_reserved().contains(&utxo("bb", 0)));
    }

    #[test]
    fn reserve_is_idempotent_per_order() {
        let mut ledger = UtxoLedger::new();
        assert!(ledger.reserve(&oid(1), &[utxo("aa", 0)]));
        assert!(ledger.reserve(&oid(1), &[utxo("aa", 0), utxo("cc", 3)]));
        assert_eq!(ledger.reserved_for(&oid(1)).unwrap().len(), 2);
    }

    #[test]
    fn release_clears_everything() {
        let mut ledger = UtxoLedger::new();
        ledger.reserve(&oid(1), &[utxo("aa", 0)]);
        assert!(ledger.release(&oid(1)));
        assert!(!ledger.release(&oid(1)));
        assert!(ledger.all_reserved().is_empty());
        // the outpoint is free again
        assert!(ledger.reserve(&oid(2), &[utxo("aa", 0)]));
    }

    #[test]
    fn bad_funds_refused() {
        let mut ledger = UtxoLedger::new();
        ledger.blocklist("evil");
        assert!(!ledger.check(&oid(1), &[utxo("evil", 0)]));
        assert!(!ledger.reserve(&oid(1), &[utxo("evil", 0)]));
    }

    #[test]
    fn empty_reservation_rejected() {
        let mut ledger = UtxoLedger::new();
        assert!(!ledger.reserve(&oid(1), &[]));
    }

    #[test]
    fn recheck_interval_gate() {
        let mut ledger = UtxoLedger::new();
        assert!(ledger.mark_checked(&oid(1), 900));
        assert!(!ledger.mark_checked(&oid(1), 900));
        assert!(ledger.mark_checked(&oid(1), 0));
    }
}
