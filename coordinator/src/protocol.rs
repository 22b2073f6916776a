//! Swap protocol messages and per-order session tracking
//!
//! Messages travel over the service-node network as best-effort authenticated
//! broadcast/unicast. The coordinator advances a swap only when both
//! participants have acknowledged the current phase; acks are keyed by
//! `(order, sender, phase)` and duplicates are idempotent.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::amount::Amount;
use crate::order::OrderId;
use crate::utxo::UtxoEntry;

/// Order fields broadcast with a `Pending` announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOrder {
    pub id: OrderId,
    pub from_currency: String,
    pub from_amount: Amount,
    pub from_address: String,
    pub to_currency: String,
    pub to_amount: Amount,
    pub to_address: String,
    pub created: DateTime<Utc>,
    pub created_block_height: u64,
    pub block_hash: String,
    pub maker_pubkey: Vec<u8>,
    pub utxos: Vec<UtxoEntry>,
}

/// Protocol messages exchanged between maker (M), taker (T) and the
/// coordinator (C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SwapMessage {
    /// M broadcasts a new order to the network.
    Pending { order: WireOrder },
    /// T asks C to pair it with a pending order.
    Accepting {
        id: OrderId,
        from_address: String,
        to_address: String,
        pubkey: Vec<u8>,
        utxos: Vec<UtxoEntry>,
    },
    /// C assigned the pair; parties must acknowledge.
    Hold { id: OrderId },
    HoldApply { id: OrderId, from: Vec<u8> },
    /// C requests HTLC key material.
    Init { id: OrderId },
    /// Party publishes its HTLC pubkey; the maker also commits the secret
    /// hash here, before any funds are locked.
    Initialized {
        id: OrderId,
        from: Vec<u8>,
        pubkey: Vec<u8>,
        secret_hash: Option<[u8; 32]>,
    },
    /// C instructs both parties to build their pay-ins with the agreed hash.
    Create {
        id: OrderId,
        secret_hash: [u8; 32],
        maker_pubkey: Vec<u8>,
        taker_pubkey: Vec<u8>,
    },
    /// Party broadcast its HTLC pay-in.
    Created { id: OrderId, from: Vec<u8>, pay_in_txid: String },
    /// C relays both pay-ins for cross-validation and confirmation watch.
    Commit {
        id: OrderId,
        maker_pay_in: String,
        taker_pay_in: String,
    },
    /// Party saw the counterparty pay-in reach the required depth.
    Confirmed { id: OrderId, from: Vec<u8> },
    /// C declares the swap settled; the maker may reveal the secret.
    Finished { id: OrderId },
    Cancel { id: OrderId, reason: String },
}

impl SwapMessage {
    pub fn order_id(&self) -> &OrderId {
        match self {
            SwapMessage::Pending { order } => &order.id,
            SwapMessage::Accepting { id, .. }
            | SwapMessage::Hold { id }
            | SwapMessage::HoldApply { id, .. }
            | SwapMessage::Init { id }
            | SwapMessage::Initialized { id, .. }
            | SwapMessage::Create { id, .. }
            | SwapMessage::Created { id, .. }
            | SwapMessage::Commit { id, .. }
            | SwapMessage::Confirmed { id, .. }
            | SwapMessage::Finished { id }
            | SwapMessage::Cancel { id, .. } => id,
        }
    }

    /// Message name for metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            SwapMessage::Pending { .. } => "pending",
            SwapMessage::Accepting { .. } => "accepting",
            SwapMessage::Hold { .. } => "hold",
            SwapMessage::HoldApply { .. } => "hold_apply",
            SwapMessage::Init { .. } => "init",
            SwapMessage::Initialized { .. } => "initialized",
            SwapMessage::Create { .. } => "create",
            SwapMessage::Created { .. } => "created",
            SwapMessage::Commit { .. } => "commit",
            SwapMessage::Confirmed { .. } => "confirmed",
            SwapMessage::Finished { .. } => "finished",
            SwapMessage::Cancel { .. } => "cancel",
        }
    }
}

/// Coordinator-side protocol phases for a joined order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Joined,
    Hold,
    Initialized,
    Created,
    Finished,
}

impl Phase {
    fn next(self) -> Option<Phase> {
        match self {
            Phase::Joined => Some(Phase::Hold),
            Phase::Hold => Some(Phase::Initialized),
            Phase::Initialized => Some(Phase::Created),
            Phase::Created => Some(Phase::Finished),
            Phase::Finished => None,
        }
    }
}

/// Outcome of feeding one ack into a [`SwapSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// First ack of the phase recorded; waiting for the counterparty.
    Recorded,
    /// Both parties acknowledged; the session advanced to the new phase.
    Advanced(Phase),
    /// Duplicate, unknown sender, or stale phase; nothing changed.
    Ignored,
    /// Ack for a phase the session has not reached yet.
    Premature,
}

/// The coordinator's record of one paired swap: ack counters, key material,
/// pay-in txids and confirmation watermarks.
#[derive(Debug, Clone)]
pub struct SwapSession {
    pub order_id: OrderId,
    pub phase: Phase,
    pub maker_address: Vec<u8>,
    pub taker_address: Vec<u8>,
    pub maker_pubkey: Vec<u8>,
    pub taker_pubkey: Vec<u8>,
    pub secret_hash: Option<[u8; 32]>,
    pub maker_pay_in: Option<String>,
    pub taker_pay_in: Option<String>,
    pub maker_confirmations: u32,
    pub taker_confirmations: u32,
    acks: HashMap<Phase, HashSet<Vec<u8>>>,
}

impl SwapSession {
    pub fn new(order_id: OrderId, maker_address: Vec<u8>, taker_address: Vec<u8>) -> SwapSession {
        SwapSession {
            order_id,
            phase: Phase::Joined,
            maker_address,
            taker_address,
            maker_pubkey: Vec::new(),
            taker_pubkey: Vec::new(),
            secret_hash: None,
            maker_pay_in: None,
            taker_pay_in: None,
            maker_confirmations: 0,
            taker_confirmations: 0,
            acks: HashMap::new(),
        }
    }

    pub fn is_participant(&self, from: &[u8]) -> bool {
        from == self.maker_address || from == self.taker_address
    }

    pub fn is_maker(&self, from: &[u8]) -> bool {
        from == self.maker_address
    }

    /// Count an ack for `phase` from `from`.
    ///
    /// Advances only when both distinct participants acknowledged the
    /// session's current phase.
    pub fn increase_state_counter(&mut self, phase: Phase, from: &[u8]) -> AckOutcome {
        if !self.is_participant(from) {
            return AckOutcome::Ignored;
        }
        if phase < self.phase {
            return AckOutcome::Ignored;
        }
        if phase > self.phase {
            return AckOutcome::Premature;
        }

        let entry = self.acks.entry(phase).or_default();
        if !entry.insert(from.to_vec()) {
            return AckOutcome::Ignored;
        }
        if entry.len() == 2 {
            match self.phase.next() {
                Some(next) => {
                    self.phase = next;
                    AckOutcome::Advanced(next)
                }
                None => AckOutcome::Ignored,
            }
        } else {
            AckOutcome::Recorded
        }
    }

    /// Record a party's HTLC pubkey; the maker side also fixes the secret
    /// hash the whole swap is bound to.
    pub fn set_keys(&mut self, from: &[u8], pubkey: Vec<u8>, secret_hash: Option<[u8; 32]>) -> bool {
        if from == self.maker_address {
            self.maker_pubkey = pubkey;
            if let Some(h) = secret_hash {
                self.secret_hash = Some(h);
            }
            true
        } else if from == self.taker_address {
            self.taker_pubkey = pubkey;
            true
        } else {
            false
        }
    }

    pub fn set_pay_in(&mut self, from: &[u8], txid: String) -> bool {
        if from == self.maker_address {
            self.maker_pay_in = Some(txid);
            true
        } else if from == self.taker_address {
            self.taker_pay_in = Some(txid);
            true
        } else {
            false
        }
    }
}
