//! Coordinator exchange state
//!
//! Holds the pending (unpaired) and accepted (paired) order maps, the UTXO
//! reservation ledger and the service-node keypair. All chain I/O happens in
//! the driver on snapshots; methods here only touch memory.
//!
//! Lock order is strictly map -> ledger. Per-order mutation goes through the
//! order's own mutex after the map lock is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::amount::Amount;
use crate::config::Settings;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::descr::{OrderId, ORDER_EXPIRY_BLOCKS, PENDING_UPDATE_MIN_SPACING_SECS};
use crate::protocol::{AckOutcome, Phase, SwapSession};
use crate::utxo::{UtxoEntry, UtxoLedger};
use crate::wallet::WalletParam;

/// Pending orders live this long without a TTL refresh.
const PENDING_TTL_SECS: i64 = 3600;

/// One side of an exchange-tracked order.
#[derive(Debug, Clone)]
pub struct PartySide {
    pub source_address: String,
    pub dest_address: String,
    pub pubkey: Vec<u8>,
}

/// An order as tracked by the coordinator, possibly joined with a taker.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub id: OrderId,
    /// Maker orientation: the maker sends `from` and receives `to`.
    pub from_currency: String,
    pub from_amount: Amount,
    pub to_currency: String,
    pub to_amount: Amount,
    pub maker: PartySide,
    pub taker: Option<PartySide>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub created_block_height: u64,
    pub block_hash: String,
    /// Maker inputs, re-validated periodically against the chain.
    pub maker_utxos: Vec<UtxoEntry>,
    pub session: Option<SwapSession>,
}

impl ExchangeOrder {
    pub fn is_valid(&self) -> bool {
        !self.from_amount.is_zero()
            && !self.to_amount.is_zero()
            && self.from_currency != self.to_currency
    }

    pub fn expired(&self) -> bool {
        Utc::now() - self.updated > Duration::seconds(PENDING_TTL_SECS)
    }

    pub fn expired_by_block(&self, current_height: u64) -> bool {
        current_height > self.created_block_height + ORDER_EXPIRY_BLOCKS
    }

    pub fn update_too_soon(&self) -> bool {
        Utc::now() - self.updated < Duration::seconds(PENDING_UPDATE_MIN_SPACING_SECS)
    }

    pub fn touch(&mut self) {
        self.updated = Utc::now();
    }

    /// Cross-match of a taker descriptor against this pending order.
    fn matches_taker(
        &self,
        source_currency: &str,
        source_amount: Amount,
        dest_currency: &str,
        dest_amount: Amount,
    ) -> bool {
        source_currency == self.to_currency
            && source_amount == self.to_amount
            && dest_currency == self.from_currency
            && dest_amount == self.from_amount
    }
}

pub type ExchangeOrderHandle = Arc<Mutex<ExchangeOrder>>;

/// Parameters of a maker `createTransaction`.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub id: OrderId,
    pub source_address: String,
    pub source_currency: String,
    pub source_amount: Amount,
    pub dest_address: String,
    pub dest_currency: String,
    pub dest_amount: Amount,
    pub maker_pubkey: Vec<u8>,
    pub items: Vec<UtxoEntry>,
    pub block_height: u64,
    pub block_hash: String,
}

/// Parameters of a taker `acceptTransaction`.
#[derive(Debug, Clone)]
pub struct AcceptRequest {
    pub id: OrderId,
    pub source_address: String,
    pub source_currency: String,
    pub source_amount: Amount,
    pub dest_address: String,
    pub dest_currency: String,
    pub dest_amount: Amount,
    pub taker_pubkey: Vec<u8>,
    pub items: Vec<UtxoEntry>,
}

/// Process-wide coordinator state with explicit init/shutdown.
pub struct Exchange {
    enable_exchange: bool,
    wallets: RwLock<HashMap<String, WalletParam>>,
    pending: RwLock<HashMap<OrderId, ExchangeOrderHandle>>,
    accepted: RwLock<HashMap<OrderId, ExchangeOrderHandle>>,
    ledger: Mutex<UtxoLedger>,
    /// Secret hashes of every swap seen; a repeat is a replay.
    seen_hashes: Mutex<HashSet<[u8; 32]>>,
    keypair: Mutex<Option<(SecretKey, PublicKey)>>,
}

impl Exchange {
    pub fn new(settings: &Settings) -> Exchange {
        let mut wallets = HashMap::new();
        for (currency, section) in settings.enabled_wallets() {
            wallets.insert(currency.clone(), WalletParam::from_section(currency, section));
        }
        info!("exchange loaded {} wallet sections", wallets.len());

        let exchange = Exchange {
            enable_exchange: settings.coordinator.enable_exchange,
            wallets: RwLock::new(wallets),
            pending: RwLock::new(HashMap::new()),
            accepted: RwLock::new(HashMap::new()),
            ledger: Mutex::new(UtxoLedger::new()),
            seen_hashes: Mutex::new(HashSet::new()),
            keypair: Mutex::new(None),
        };
        if exchange.enable_exchange && !exchange.init_key_pair() {
            error!("bad service node key pair");
        }
        exchange
    }

    /// Exchange role configured and wallets loaded.
    pub async fn is_enabled(&self) -> bool {
        self.enable_exchange && !self.wallets.read().await.is_empty()
    }

    /// Enabled and holding a usable service-node key.
    pub async fn is_started(&self) -> bool {
        self.is_enabled().await && self.keypair.lock().expect("keypair mutex poisoned").is_some()
    }

    fn init_key_pair(&self) -> bool {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        *self.keypair.lock().expect("keypair mutex poisoned") = Some((sk, pk));
        true
    }

    /// Compressed service-node pubkey, lazily re-initialized if missing.
    pub fn pub_key(&self) -> Option<PublicKey> {
        {
            let guard = self.keypair.lock().expect("keypair mutex poisoned");
            if let Some((_, pk)) = guard.as_ref() {
                return Some(*pk);
            }
        }
        if !self.init_key_pair() {
            error!("bad service node key pair");
            return None;
        }
        self.keypair.lock().expect("keypair mutex poisoned").as_ref().map(|(_, pk)| *pk)
    }

    pub async fn have_connected_wallet(&self, currency: &str) -> bool {
        self.wallets.read().await.contains_key(currency)
    }

    pub async fn connected_wallets(&self) -> Vec<String> {
        let mut list: Vec<String> = self.wallets.read().await.keys().cloned().collect();
        list.sort();
        list
    }

    pub async fn wallet_param(&self, currency: &str) -> Option<WalletParam> {
        self.wallets.read().await.get(currency).cloned()
    }

    /// Replace the wallet registry from a freshly reloaded config.
    pub async fn reload_wallets(&self, settings: &Settings) {
        let mut wallets = HashMap::new();
        for (currency, section) in settings.enabled_wallets() {
            wallets.insert(currency.clone(), WalletParam::from_section(currency, section));
        }
        *self.wallets.write().await = wallets;
    }

    /// Reject an outpoint set that collides with other orders' reservations.
    pub fn check_utxo_items(&self, id: &OrderId, items: &[UtxoEntry]) -> bool {
        self.ledger.lock().expect("ledger mutex poisoned").check(id, items)
    }

    pub fn lock_utxos(&self, id: &OrderId, items: &[UtxoEntry]) -> bool {
        self.ledger.lock().expect("ledger mutex poisoned").reserve(id, items)
    }

    pub fn unlock_utxos(&self, id: &OrderId) -> bool {
        self.ledger.lock().expect("ledger mutex poisoned").release(id)
    }

    /// Reserved outpoints of one order, or every reservation for a zero id.
    pub fn utxo_items(&self, id: &OrderId) -> Option<Vec<UtxoEntry>> {
        let ledger = self.ledger.lock().expect("ledger mutex poisoned");
        if id.is_zero() {
            return Some(ledger.all_reserved());
        }
        ledger.reserved_for(id)
    }

    pub fn all_locked_utxos(&self) -> Vec<UtxoEntry> {
        self.ledger.lock().expect("ledger mutex poisoned").all_reserved()
    }

    pub fn blocklist_funds(&self, txid: &str) {
        self.ledger.lock().expect("ledger mutex poisoned").blocklist(txid);
    }

    /// Gate for the periodic maker-input recheck; true when due.
    pub fn utxo_recheck_due(&self, id: &OrderId, interval_secs: i64) -> bool {
        self.ledger.lock().expect("ledger mutex poisoned").mark_checked(id, interval_secs)
    }

    async fn dust_check(&self, currency: &str, amount: Amount) -> CoordinatorResult<()> {
        let wallets = self.wallets.read().await;
        let param = wallets
            .get(currency)
            .ok_or_else(|| CoordinatorError::NoSession(currency.to_string()))?;
        if param.dust_amount != 0 && param.dust_amount > amount.as_units() {
            return Err(CoordinatorError::InvalidAmount(format!(
                "{} amount is less than the chain minimum payment",
                currency
            )));
        }
        Ok(())
    }

    /// Register a maker order, or refresh the TTL of a known one.
    ///
    /// Returns true when a new entry was created.
    pub async fn create_transaction(&self, req: CreateRequest) -> CoordinatorResult<bool> {
        if !self.have_connected_wallet(&req.source_currency).await {
            return Err(CoordinatorError::NoSession(req.source_currency));
        }
        if !self.have_connected_wallet(&req.dest_currency).await {
            return Err(CoordinatorError::NoSession(req.dest_currency));
        }
        if !self.check_utxo_items(&req.id, &req.items) {
            debug!(order = %req.id, "utxo check failed");
            return Err(CoordinatorError::InvalidParameters(
                "utxos are reserved by another order".to_string(),
            ));
        }
        self.dust_check(&req.source_currency, req.source_amount).await?;
        self.dust_check(&req.dest_currency, req.dest_amount).await?;

        let order = ExchangeOrder {
            id: req.id.clone(),
            from_currency: req.source_currency,
            from_amount: req.source_amount,
            to_currency: req.dest_currency,
            to_amount: req.dest_amount,
            maker: PartySide {
                source_address: req.source_address,
                dest_address: req.dest_address,
                pubkey: req.maker_pubkey,
            },
            taker: None,
            created: Utc::now(),
            updated: Utc::now(),
            created_block_height: req.block_height,
            block_hash: req.block_hash,
            maker_utxos: req.items.clone(),
            session: None,
        };
        if !order.is_valid() {
            return Err(CoordinatorError::InvalidParameters("order is not valid".to_string()));
        }

        let mut is_created = false;
        {
            let mut pending = self.pending.write().await;
            let existing = pending.get(&req.id).cloned();
            match existing {
                None => {
                    pending.insert(req.id.clone(), Arc::new(Mutex::new(order)));
                    is_created = true;
                }
                Some(handle) => {
                    let expired = {
                        let mut existing = handle.lock().expect("order mutex poisoned");
                        if existing.expired() {
                            true
                        } else {
                            existing.touch();
                            false
                        }
                    };
                    if expired {
                        pending.insert(req.id.clone(), Arc::new(Mutex::new(order)));
                    }
                }
            }
        }

        self.lock_utxos(&req.id, &req.items);
        if is_created {
            crate::metrics::record_order_created();
        }
        Ok(is_created)
    }

    /// Pair a taker with a pending order and move it to the accepted map.
    pub async fn accept_transaction(&self, req: AcceptRequest) -> CoordinatorResult<()> {
        if !self.have_connected_wallet(&req.source_currency).await {
            return Err(CoordinatorError::NoSession(req.source_currency));
        }
        if !self.have_connected_wallet(&req.dest_currency).await {
            return Err(CoordinatorError::NoSession(req.dest_currency));
        }
        if !self.check_utxo_items(&req.id, &req.items) {
            return Err(CoordinatorError::InvalidParameters(
                "utxos are reserved by another order".to_string(),
            ));
        }
        self.dust_check(&req.source_currency, req.source_amount).await?;

        let handle = {
            let pending = self.pending.read().await;
            pending
                .get(&req.id)
                .cloned()
                .ok_or_else(|| CoordinatorError::TransactionNotFound(req.id.to_string()))?
        };

        let expired = {
            let order = handle.lock().expect("order mutex poisoned");
            order.expired()
        };
        if expired {
            self.delete_pending_transaction(&req.id).await;
            return Err(CoordinatorError::InvalidState(
                "order has expired".to_string(),
            ));
        }

        {
            let mut order = handle.lock().expect("order mutex poisoned");
            if order.taker.is_some() {
                return Err(CoordinatorError::InvalidState(
                    "order is already being accepted".to_string(),
                ));
            }
            if !order.matches_taker(
                &req.source_currency,
                req.source_amount,
                &req.dest_currency,
                req.dest_amount,
            ) {
                return Err(CoordinatorError::InvalidParameters(
                    "taker legs do not match the order".to_string(),
                ));
            }

            let session = SwapSession::new(
                req.id.clone(),
                order.maker.source_address.as_bytes().to_vec(),
                req.source_address.as_bytes().to_vec(),
            );
            order.taker = Some(PartySide {
                source_address: req.source_address,
                dest_address: req.dest_address,
                pubkey: req.taker_pubkey,
            });
            order.session = Some(session);
            order.touch();
        }

        // move pending -> accepted
        {
            let mut accepted = self.accepted.write().await;
            accepted.insert(req.id.clone(), handle.clone());
        }
        {
            let mut pending = self.pending.write().await;
            pending.remove(&req.id);
        }

        // reservations are additive, never overwritten
        self.lock_utxos(&req.id, &req.items);
        crate::metrics::record_order_accepted();
        info!(order = %req.id, "orders joined");
        Ok(())
    }

    pub async fn delete_pending_transaction(&self, id: &OrderId) -> bool {
        debug!(order = %id, "delete pending transaction");
        let removed = self.pending.write().await.remove(id).is_some();
        self.unlock_utxos(id);
        removed
    }

    pub async fn delete_transaction(&self, id: &OrderId) -> bool {
        debug!(order = %id, "delete transaction");
        let removed = self.accepted.write().await.remove(id).is_some();
        self.unlock_utxos(id);
        removed
    }

    pub async fn pending_transaction(&self, id: &OrderId) -> Option<ExchangeOrderHandle> {
        self.pending.read().await.get(id).cloned()
    }

    pub async fn transaction(&self, id: &OrderId) -> Option<ExchangeOrderHandle> {
        self.accepted.read().await.get(id).cloned()
    }

    pub async fn pending_transactions(&self) -> Vec<ExchangeOrderHandle> {
        self.pending.read().await.values().cloned().collect()
    }

    pub async fn transactions(&self) -> Vec<ExchangeOrderHandle> {
        self.accepted.read().await.values().cloned().collect()
    }

    fn with_session<R>(
        handle: &ExchangeOrderHandle,
        f: impl FnOnce(&mut SwapSession) -> R,
    ) -> CoordinatorResult<R> {
        let mut order = handle.lock().expect("order mutex poisoned");
        let id = order.id.to_string();
        match order.session.as_mut() {
            Some(session) => Ok(f(session)),
            None => Err(CoordinatorError::InvalidState(format!(
                "order {} has no active session",
                id
            ))),
        }
    }

    /// HoldApply ack; advances to the hold phase once both parties applied.
    pub async fn update_when_hold_applied(
        &self,
        handle: &ExchangeOrderHandle,
        from: &[u8],
    ) -> CoordinatorResult<AckOutcome> {
        Self::with_session(handle, |s| s.increase_state_counter(Phase::Joined, from))
    }

    /// Initialized ack carrying key material. The maker's committed secret
    /// hash is checked against replays across all swaps.
    pub async fn update_when_initialized(
        &self,
        handle: &ExchangeOrderHandle,
        from: &[u8],
        pubkey: Vec<u8>,
        secret_hash: Option<[u8; 32]>,
    ) -> CoordinatorResult<AckOutcome> {
        // settle the phase question first so a premature ack never registers
        // its hash
        let current = Self::with_session(handle, |s| s.phase)?;
        if current < Phase::Hold {
            return Ok(AckOutcome::Premature);
        }
        if current > Phase::Hold {
            return Ok(AckOutcome::Ignored);
        }

        if let Some(h) = secret_hash {
            let (is_maker, already_committed) =
                Self::with_session(handle, |s| (s.is_maker(from), s.secret_hash == Some(h)))?;
            if is_maker && !already_committed {
                let mut seen = self.seen_hashes.lock().expect("hash set mutex poisoned");
                if !seen.insert(h) {
                    warn!("duplicate swap secret hash rejected");
                    return Err(CoordinatorError::InvalidParameters(
                        "duplicate secret hash".to_string(),
                    ));
                }
            }
        }
        Self::with_session(handle, |s| {
            if !s.set_keys(from, pubkey, secret_hash) {
                warn!(order = %s.order_id, "unknown sender address for transaction");
                return AckOutcome::Ignored;
            }
            s.increase_state_counter(Phase::Hold, from)
        })
    }

    /// Created ack carrying a pay-in txid.
    pub async fn update_when_created(
        &self,
        handle: &ExchangeOrderHandle,
        from: &[u8],
        pay_in_txid: String,
    ) -> CoordinatorResult<AckOutcome> {
        Self::with_session(handle, |s| {
            if !s.set_pay_in(from, pay_in_txid) {
                warn!(order = %s.order_id, "unknown sender address for transaction");
                return AckOutcome::Ignored;
            }
            s.increase_state_counter(Phase::Initialized, from)
        })
    }

    /// Confirmed ack; the swap is settled once both sides confirmed.
    pub async fn update_when_confirmed(
        &self,
        handle: &ExchangeOrderHandle,
        from: &[u8],
    ) -> CoordinatorResult<AckOutcome> {
        Self::with_session(handle, |s| s.increase_state_counter(Phase::Created, from))
    }

    /// Refresh the TTL of a re-broadcast pending order, dropping it when
    /// expired and refusing refreshes that arrive too fast.
    pub async fn update_timestamp_or_remove_expired(&self, id: &OrderId) -> bool {
        let Some(handle) = self.pending_transaction(id).await else {
            return false;
        };
        let expired = {
            let mut order = handle.lock().expect("order mutex poisoned");
            if order.expired() {
                true
            } else {
                if order.update_too_soon() {
                    return false;
                }
                order.touch();
                return true;
            }
        };
        if expired {
            self.delete_pending_transaction(id).await;
        }
        false
    }

    /// Sweep pending orders expired by block height or TTL, releasing their
    /// reservations. Returns the number erased.
    pub async fn erase_expired_transactions(
        &self,
        current_heights: &HashMap<String, u64>,
    ) -> usize {
        if !self.is_started().await {
            return 0;
        }

        let snapshot: Vec<(OrderId, ExchangeOrderHandle)> = self
            .pending
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();

        let mut erased = 0;
        for (id, handle) in snapshot {
            let (by_block, by_ttl) = {
                let order = handle.lock().expect("order mutex poisoned");
                let height = current_heights.get(&order.from_currency).copied();
                let by_block = height.map(|h| order.expired_by_block(h)).unwrap_or(false);
                (by_block, order.expired())
            };
            if by_block || by_ttl {
                if by_block {
                    info!(order = %id, "order block expired");
                } else {
                    info!(order = %id, "order expired by ttl");
                }
                self.delete_pending_transaction(&id).await;
                crate::metrics::record_order_expired();
                erased += 1;
            }
        }
        if erased > 0 {
            info!("deleted {} expired transactions", erased);
        }
        erased
    }
}
