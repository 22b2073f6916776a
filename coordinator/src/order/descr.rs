//! Order descriptor and its state machine

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::amount::Amount;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::utxo::UtxoEntry;

/// Orders older than this many blocks on the maker chain are dropped
/// unconditionally.
pub const ORDER_EXPIRY_BLOCKS: u64 = 120;

/// Minimum spacing between TTL refreshes of a pending order. Rejecting
/// faster updates prevents TTL extension flooding from re-broadcast storms.
pub const PENDING_UPDATE_MIN_SPACING_SECS: i64 = 60;

/// 256-bit order identifier, displayed as hex.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(#[serde(with = "hex::serde")] [u8; 32]);

impl OrderId {
    pub const ZERO: OrderId = OrderId([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> OrderId {
        OrderId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderId({})", self)
    }
}

impl FromStr for OrderId {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|_| CoordinatorError::InvalidParameters(format!("bad order id: {}", s)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoordinatorError::InvalidParameters(format!("bad order id: {}", s)))?;
        Ok(OrderId(bytes))
    }
}

/// Side of the trade relative to the order's originator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Maker,
    Taker,
}

/// HTLC lifecycle states, in protocol order. The three sinks come last so
/// that ordered comparisons such as `state >= Created` also exclude settled
/// orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderState {
    New,
    PendingBroadcast,
    Pending,
    Accepting,
    Hold,
    Initialized,
    Created,
    Signed,
    Committed,
    Finished,
    RolledBack,
    Cancelled,
    Expired,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Finished
                | OrderState::RolledBack
                | OrderState::Cancelled
                | OrderState::Expired
        )
    }

    /// Wire status string.
    pub fn as_str(self) -> &'static str {
        match self {
            OrderState::New | OrderState::PendingBroadcast => "new",
            OrderState::Pending => "pending",
            OrderState::Accepting => "accepting",
            OrderState::Hold => "hold",
            OrderState::Initialized => "initialized",
            OrderState::Created => "created",
            OrderState::Signed => "signed",
            OrderState::Committed => "committed",
            OrderState::Finished => "finished",
            OrderState::RolledBack => "rolled_back",
            OrderState::Cancelled => "cancelled",
            OrderState::Expired => "expired",
        }
    }

    /// Time-to-live of a non-terminal state. `None` means the state is not
    /// subject to TTL expiry (committed swaps are governed by the refund
    /// deadlines instead).
    fn ttl(self) -> Option<Duration> {
        match self {
            OrderState::New | OrderState::PendingBroadcast => Some(Duration::seconds(60)),
            OrderState::Pending => Some(Duration::seconds(3600)),
            OrderState::Accepting | OrderState::Hold => Some(Duration::seconds(120)),
            OrderState::Initialized => Some(Duration::seconds(300)),
            OrderState::Created | OrderState::Signed => Some(Duration::seconds(3600)),
            _ => None,
        }
    }
}

/// Per-order record of parties, amounts, keys and protocol progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDescr {
    pub id: OrderId,
    pub from_currency: String,
    pub from_amount: Amount,
    pub from_address: String,
    pub to_currency: String,
    pub to_amount: Amount,
    pub to_address: String,
    pub state: OrderState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub role: Role,
    /// Whether this node is a party to the order (maker or taker side).
    pub local: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maker_pubkey: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taker_pubkey: Vec<u8>,
    pub secret_hash: Option<[u8; 32]>,
    #[serde(skip)]
    pub preimage: Option<[u8; 32]>,
    pub refund_tx: Option<String>,
    #[serde(default)]
    pub reserved_utxos: Vec<UtxoEntry>,
    /// Maker-chain block height at creation; block expiry is measured from it.
    pub created_block_height: u64,
    /// Maker-chain block hash at creation.
    pub block_hash: String,
    /// Set while a progression (broadcast, confirmation wait) is on the wire;
    /// suppresses TTL expiry but not block expiry.
    #[serde(skip)]
    pub in_flight: bool,
}

impl OrderDescr {
    /// Build a fresh maker-side order in state `New`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_maker(
        from_currency: &str,
        from_amount: Amount,
        from_address: &str,
        to_currency: &str,
        to_amount: Amount,
        to_address: &str,
        created_block_height: u64,
        block_hash: &str,
    ) -> OrderDescr {
        let created = Utc::now();
        let id = derive_order_id(
            from_address,
            from_currency,
            from_amount,
            to_address,
            to_currency,
            to_amount,
            created,
        );
        OrderDescr {
            id,
            from_currency: from_currency.to_string(),
            from_amount,
            from_address: from_address.to_string(),
            to_currency: to_currency.to_string(),
            to_amount,
            to_address: to_address.to_string(),
            state: OrderState::New,
            created,
            updated: created,
            role: Role::Maker,
            local: true,
            maker_pubkey: Vec::new(),
            taker_pubkey: Vec::new(),
            secret_hash: None,
            preimage: None,
            refund_tx: None,
            reserved_utxos: Vec::new(),
            created_block_height,
            block_hash: block_hash.to_string(),
            in_flight: false,
        }
    }

    /// Advance the state machine.
    ///
    /// Terminal states are monotone sinks; within the progression only
    /// forward moves are accepted.
    pub fn advance(&mut self, next: OrderState) -> CoordinatorResult<()> {
        if self.state.is_terminal() {
            return Err(CoordinatorError::InvalidState(format!(
                "order is already {}",
                self.state.as_str()
            )));
        }
        if !next.is_terminal() && next <= self.state {
            return Err(CoordinatorError::InvalidState(format!(
                "cannot move {} order to {}",
                self.state.as_str(),
                next.as_str()
            )));
        }
        self.state = next;
        self.touch();
        Ok(())
    }

    /// Whether an RPC cancel is still allowed.
    pub fn can_cancel(&self) -> bool {
        self.state < OrderState::Created
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }

    /// TTL expiry. Suppressed while a proven progression is in flight.
    pub fn expired(&self) -> bool {
        if self.in_flight {
            return false;
        }
        match self.state.ttl() {
            Some(ttl) => Utc::now() - self.updated > ttl,
            None => false,
        }
    }

    /// Block-height expiry on the maker chain. Unconditional and fatal.
    pub fn expired_by_block(&self, current_height: u64) -> bool {
        current_height > self.created_block_height + ORDER_EXPIRY_BLOCKS
    }

    /// Reject TTL refreshes arriving faster than the minimum spacing.
    pub fn update_too_soon(&self) -> bool {
        Utc::now() - self.updated < Duration::seconds(PENDING_UPDATE_MIN_SPACING_SECS)
    }

    pub fn is_valid(&self) -> bool {
        !self.from_amount.is_zero()
            && !self.to_amount.is_zero()
            && self.from_currency != self.to_currency
            && self.from_address != self.to_address
    }

    /// The taker's reading of this order: currencies and amounts swapped.
    ///
    /// The stored descriptor keeps maker orientation; accepting never mutates
    /// it, so a failed accept needs no restore.
    pub fn taker_view(&self) -> TakerView {
        TakerView {
            id: self.id.clone(),
            from_currency: self.to_currency.clone(),
            from_amount: self.to_amount,
            to_currency: self.from_currency.clone(),
            to_amount: self.from_amount,
            created: self.created,
        }
    }
}

/// Non-destructive accepted view of an order, oriented for the taker.
#[derive(Debug, Clone)]
pub struct TakerView {
    pub id: OrderId,
    pub from_currency: String,
    pub from_amount: Amount,
    pub to_currency: String,
    pub to_amount: Amount,
    pub created: DateTime<Utc>,
}

fn derive_order_id(
    from_address: &str,
    from_currency: &str,
    from_amount: Amount,
    to_address: &str,
    to_currency: &str,
    to_amount: Amount,
    created: DateTime<Utc>,
) -> OrderId {
    let mut hasher = Sha256::new();
    hasher.update(from_address.as_bytes());
    hasher.update(from_currency.as_bytes());
    hasher.update(from_amount.as_units().to_le_bytes());
    hasher.update(to_address.as_bytes());
    hasher.update(to_currency.as_bytes());
    hasher.update(to_amount.as_units().to_le_bytes());
    hasher.update(created.timestamp_millis().to_le_bytes());
    OrderId(hasher.finalize().into())
}
