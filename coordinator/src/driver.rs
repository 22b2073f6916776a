//! Swap driver: the cross-chain HTLC protocol engine
//!
//! Progression is advanced by three inputs: inbound protocol messages,
//! chain-confirmation polling, and wall-clock timers. The driver plays two
//! roles over the same message stream: the coordinator role (when the
//! exchange is started) sequences joined swaps, and the party role executes
//! this node's own maker/taker legs.
//!
//! All chain I/O runs on snapshots; no lock is held across an await of a
//! connector call.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bitcoin::secp256k1::Secp256k1;
use chrono::{Duration as TimeDelta, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::amount::Amount;
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::exchange::{AcceptRequest, CreateRequest, Exchange};
use crate::metrics;
use crate::order::{OrderBook, OrderDescr, OrderId, OrderState, Role};
use crate::protocol::{AckOutcome, SwapMessage, WireOrder};
use crate::utxo::UtxoEntry;
use crate::wallet::{ConnectorRegistry, HtlcLeg, HtlcSpec};

/// Maker leg refund deadline, seconds after pay-in construction.
const MAKER_REFUND_AFTER_SECS: i64 = 7200;

/// Taker leg refund deadline. Strictly before the maker's so the maker can
/// always refund once the taker leg expires unrevealed.
const TAKER_REFUND_AFTER_SECS: i64 = 3600;

/// Future-phase acks are parked at most this long.
const PARKED_TTL_SECS: u64 = 30;

/// Bound on the parked-message queue.
const PARKED_CAP: usize = 64;

/// This node's side of one swap in progress.
#[derive(Debug, Clone)]
pub struct LocalSwap {
    pub role: Role,
    /// Address the pay-in is funded from; identifies us in protocol acks.
    pub own_address: String,
    /// Address the redeemed counterparty funds land on.
    pub own_dest_address: String,
    pub own_pubkey: Vec<u8>,
    pub counterparty_pubkey: Vec<u8>,
    pub secret: Option<[u8; 32]>,
    pub secret_hash: Option<[u8; 32]>,
    pub own_leg: Option<HtlcLeg>,
    pub counterparty_pay_in: Option<String>,
    /// Counterparty leg as read off chain, present only after it passed
    /// validation against the agreed hash and amount.
    pub counterparty_leg: Option<HtlcLeg>,
    pub redeem_tx: Option<String>,
}

/// Cross-chain swap driver
pub struct SwapDriver {
    exchange: Arc<Exchange>,
    registry: Arc<ConnectorRegistry>,
    book: Arc<OrderBook>,
    net: broadcast::Sender<SwapMessage>,
    config: CoordinatorConfig,
    local_swaps: Mutex<HashMap<OrderId, LocalSwap>>,
    parked: Mutex<VecDeque<(Instant, SwapMessage)>>,
    shutdown: Arc<RwLock<bool>>,
}

impl SwapDriver {
    pub fn new(
        exchange: Arc<Exchange>,
        registry: Arc<ConnectorRegistry>,
        book: Arc<OrderBook>,
        net: broadcast::Sender<SwapMessage>,
        config: CoordinatorConfig,
    ) -> SwapDriver {
        SwapDriver {
            exchange,
            registry,
            book,
            net,
            config,
            local_swaps: Mutex::new(HashMap::new()),
            parked: Mutex::new(VecDeque::new()),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main driver loop
    pub async fn run(&self) -> CoordinatorResult<()> {
        let mut rx = self.net.subscribe();
        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut sweep = interval(Duration::from_secs(self.config.sweep_interval_secs));

        info!("swap driver started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                res = rx.recv() => match res {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg).await {
                            if e.is_retryable() {
                                warn!("transient error handling message: {}", e);
                            } else {
                                error!("error handling message: {}", e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("driver lagged, {} messages dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                _ = poll.tick() => {
                    self.poll_swaps().await;
                }

                _ = sweep.tick() => {
                    self.sweep().await;
                }
            }
        }

        info!("swap driver stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("swap driver shutdown initiated");
    }

    fn send(&self, msg: SwapMessage) {
        // no receivers is not an error; the network layer re-subscribes
        let _ = self.net.send(msg);
    }

    fn fresh_pubkey() -> Vec<u8> {
        let secp = Secp256k1::new();
        let (_, pk) = secp.generate_keypair(&mut rand::thread_rng());
        pk.serialize().to_vec()
    }

    // ------------------------------------------------------------------
    // local actions, called by the RPC surface

    /// Create a local maker order, reserve its inputs and broadcast it.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_order(
        &self,
        from_currency: &str,
        from_amount: Amount,
        from_address: &str,
        to_currency: &str,
        to_amount: Amount,
        to_address: &str,
    ) -> CoordinatorResult<OrderDescr> {
        let conn_from = self
            .registry
            .connector_by_currency(from_currency)
            .ok_or_else(|| CoordinatorError::NoSession(from_currency.to_string()))?;
        self.registry
            .connector_by_currency(to_currency)
            .ok_or_else(|| CoordinatorError::NoSession(to_currency.to_string()))?;

        let excluded = self.exchange.all_locked_utxos();
        let unspent = conn_from.unspent(&excluded).await?;
        let inputs = select_inputs(&unspent, from_amount)
            .ok_or_else(|| CoordinatorError::InsufficientFunds(from_address.to_string()))?;

        let height = conn_from.block_count().await?;
        let block_hash = conn_from.tip_hash().await?;

        let mut descr = OrderDescr::new_maker(
            from_currency,
            from_amount,
            from_address,
            to_currency,
            to_amount,
            to_address,
            height,
            &block_hash,
        );
        descr.reserved_utxos = inputs.clone();

        if !self.exchange.lock_utxos(&descr.id, &inputs) {
            return Err(CoordinatorError::InvalidParameters(
                "selected utxos are reserved by another order".to_string(),
            ));
        }

        descr.advance(OrderState::PendingBroadcast)?;
        descr.advance(OrderState::Pending)?;

        let own_pubkey = Self::fresh_pubkey();
        self.local_swaps.lock().expect("swaps mutex poisoned").insert(
            descr.id.clone(),
            LocalSwap {
                role: Role::Maker,
                own_address: from_address.to_string(),
                own_dest_address: to_address.to_string(),
                own_pubkey: own_pubkey.clone(),
                counterparty_pubkey: Vec::new(),
                secret: None,
                secret_hash: None,
                own_leg: None,
                counterparty_pay_in: None,
                counterparty_leg: None,
                redeem_tx: None,
            },
        );

        let wire = WireOrder {
            id: descr.id.clone(),
            from_currency: descr.from_currency.clone(),
            from_amount: descr.from_amount,
            from_address: descr.from_address.clone(),
            to_currency: descr.to_currency.clone(),
            to_amount: descr.to_amount,
            to_address: descr.to_address.clone(),
            created: descr.created,
            created_block_height: descr.created_block_height,
            block_hash: descr.block_hash.clone(),
            maker_pubkey: own_pubkey,
            utxos: inputs,
        };

        let out = descr.clone();
        self.book.insert(descr).await;
        self.send(SwapMessage::Pending { order: wire });
        info!(order = %out.id, "maker order broadcast");
        Ok(out)
    }

    /// Accept a pending order as taker.
    pub async fn accept_order(
        &self,
        id: &OrderId,
        from_address: &str,
        to_address: &str,
    ) -> CoordinatorResult<OrderDescr> {
        let handle = self
            .book
            .get(id)
            .await
            .ok_or_else(|| CoordinatorError::TransactionNotFound(id.to_string()))?;

        let view = {
            let descr = handle.lock().expect("order mutex poisoned");
            if descr.state != OrderState::Pending {
                return Err(CoordinatorError::InvalidState(format!(
                    "order is already {}",
                    descr.state.as_str()
                )));
            }
            descr.taker_view()
        };

        // the taker funds the order's `to` leg
        let conn_from = self
            .registry
            .connector_by_currency(&view.from_currency)
            .ok_or_else(|| CoordinatorError::NoSession(view.from_currency.clone()))?;

        let excluded = self.exchange.all_locked_utxos();
        let unspent = conn_from.unspent(&excluded).await?;
        let inputs = select_inputs(&unspent, view.from_amount)
            .ok_or_else(|| CoordinatorError::InsufficientFunds(from_address.to_string()))?;

        if !self.exchange.lock_utxos(id, &inputs) {
            return Err(CoordinatorError::InvalidParameters(
                "selected utxos are reserved by another order".to_string(),
            ));
        }

        let own_pubkey = Self::fresh_pubkey();

        let out = {
            let mut descr = handle.lock().expect("order mutex poisoned");
            descr.local = true;
            descr.role = Role::Taker;
            descr.taker_pubkey = own_pubkey.clone();
            descr.reserved_utxos = inputs.clone();
            descr.advance(OrderState::Accepting)?;
            descr.clone()
        };

        self.local_swaps.lock().expect("swaps mutex poisoned").insert(
            id.clone(),
            LocalSwap {
                role: Role::Taker,
                own_address: from_address.to_string(),
                own_dest_address: to_address.to_string(),
                own_pubkey: own_pubkey.clone(),
                counterparty_pubkey: Vec::new(),
                secret: None,
                secret_hash: None,
                own_leg: None,
                counterparty_pay_in: None,
                counterparty_leg: None,
                redeem_tx: None,
            },
        );

        self.send(SwapMessage::Accepting {
            id: id.clone(),
            from_address: from_address.to_string(),
            to_address: to_address.to_string(),
            pubkey: own_pubkey,
            utxos: inputs,
        });
        info!(order = %id, "order accepted, waiting for hold");
        Ok(out)
    }

    /// Cancel a local order still inside its cancel window.
    pub async fn cancel_order(&self, id: &OrderId) -> CoordinatorResult<OrderDescr> {
        let handle = self
            .book
            .get(id)
            .await
            .ok_or_else(|| CoordinatorError::TransactionNotFound(id.to_string()))?;

        {
            let mut descr = handle.lock().expect("order mutex poisoned");
            if !descr.can_cancel() {
                return Err(CoordinatorError::InvalidState(format!(
                    "order is already {}",
                    descr.state.as_str()
                )));
            }
            descr.advance(OrderState::Cancelled)?;
        }

        self.exchange.delete_pending_transaction(id).await;
        self.exchange.delete_transaction(id).await;
        self.book.move_to_history(id).await;
        self.local_swaps.lock().expect("swaps mutex poisoned").remove(id);
        self.send(SwapMessage::Cancel { id: id.clone(), reason: "cancelled".to_string() });
        metrics::record_order_cancelled();

        let descr = handle.lock().expect("order mutex poisoned").clone();
        Ok(descr)
    }

    // ------------------------------------------------------------------
    // inbound protocol messages

    /// Handle one inbound message, then re-check parked future-phase acks
    /// after every progression.
    pub async fn handle_message(&self, msg: SwapMessage) -> CoordinatorResult<()> {
        metrics::record_protocol_message(msg.name());
        debug!(order = %msg.order_id(), message = msg.name(), "handling protocol message");
        let mut queue: VecDeque<(Option<Instant>, SwapMessage)> = VecDeque::new();
        queue.push_back((None, msg));

        while let Some((parked_at, msg)) = queue.pop_front() {
            match self.dispatch(msg.clone()).await {
                Ok(Dispatch::Advanced) => {
                    let mut parked = self.parked.lock().expect("parked mutex poisoned");
                    queue.extend(parked.drain(..).map(|(at, m)| (Some(at), m)));
                }
                Ok(Dispatch::Premature) => {
                    let mut parked = self.parked.lock().expect("parked mutex poisoned");
                    if parked.len() < PARKED_CAP {
                        parked.push_back((parked_at.unwrap_or_else(Instant::now), msg));
                    } else {
                        warn!("parked queue full, dropping future-phase message");
                    }
                }
                Ok(Dispatch::Done) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn dispatch(&self, msg: SwapMessage) -> CoordinatorResult<Dispatch> {
        match msg {
            SwapMessage::Pending { order } => self.on_pending(order).await,
            SwapMessage::Accepting { id, from_address, to_address, pubkey, utxos } => {
                self.on_accepting(id, from_address, to_address, pubkey, utxos).await
            }
            SwapMessage::Hold { id } => self.on_hold(&id).await,
            SwapMessage::HoldApply { id, from } => self.on_hold_apply(&id, &from).await,
            SwapMessage::Init { id } => self.on_init(&id).await,
            SwapMessage::Initialized { id, from, pubkey, secret_hash } => {
                self.on_initialized(&id, &from, pubkey, secret_hash).await
            }
            SwapMessage::Create { id, secret_hash, maker_pubkey, taker_pubkey } => {
                self.on_create(&id, secret_hash, maker_pubkey, taker_pubkey).await
            }
            SwapMessage::Created { id, from, pay_in_txid } => {
                self.on_created(&id, &from, pay_in_txid).await
            }
            SwapMessage::Commit { id, maker_pay_in, taker_pay_in } => {
                self.on_commit(&id, maker_pay_in, taker_pay_in).await
            }
            SwapMessage::Confirmed { id, from } => self.on_confirmed(&id, &from).await,
            SwapMessage::Finished { id } => self.on_finished(&id).await,
            SwapMessage::Cancel { id, reason } => self.on_cancel(&id, &reason).await,
        }
    }

    async fn on_pending(&self, order: WireOrder) -> CoordinatorResult<Dispatch> {
        // coordinator: register or refresh the pending entry
        if self.exchange.is_started().await {
            if self.exchange.pending_transaction(&order.id).await.is_some() {
                self.exchange.update_timestamp_or_remove_expired(&order.id).await;
            } else {
                let req = CreateRequest {
                    id: order.id.clone(),
                    source_address: order.from_address.clone(),
                    source_currency: order.from_currency.clone(),
                    source_amount: order.from_amount,
                    dest_address: order.to_address.clone(),
                    dest_currency: order.to_currency.clone(),
                    dest_amount: order.to_amount,
                    maker_pubkey: order.maker_pubkey.clone(),
                    items: order.utxos.clone(),
                    block_height: order.created_block_height,
                    block_hash: order.block_hash.clone(),
                };
                if let Err(e) = self.exchange.create_transaction(req).await {
                    debug!(order = %order.id, "pending order rejected: {}", e);
                    return Ok(Dispatch::Done);
                }
            }
        }

        // observer: mirror foreign orders into the book
        if self.book.get(&order.id).await.is_none() {
            let descr = descr_from_wire(&order);
            self.book.insert(descr).await;
        } else if let Some(handle) = self.book.get(&order.id).await {
            let mut descr = handle.lock().expect("order mutex poisoned");
            if !descr.local && !descr.state.is_terminal() && !descr.update_too_soon() {
                descr.touch();
            }
        }
        Ok(Dispatch::Done)
    }

    async fn on_accepting(
        &self,
        id: OrderId,
        from_address: String,
        to_address: String,
        pubkey: Vec<u8>,
        utxos: Vec<UtxoEntry>,
    ) -> CoordinatorResult<Dispatch> {
        if !self.exchange.is_started().await {
            return Ok(Dispatch::Done);
        }
        let (source_currency, source_amount, dest_currency, dest_amount) = {
            let Some(handle) = self.exchange.pending_transaction(&id).await else {
                debug!(order = %id, "accept for unknown pending order");
                return Ok(Dispatch::Done);
            };
            let order = handle.lock().expect("order mutex poisoned");
            (
                order.to_currency.clone(),
                order.to_amount,
                order.from_currency.clone(),
                order.from_amount,
            )
        };
        let req = AcceptRequest {
            id: id.clone(),
            source_address: from_address,
            source_currency,
            source_amount,
            dest_address: to_address,
            dest_currency,
            dest_amount,
            taker_pubkey: pubkey,
            items: utxos,
        };
        match self.exchange.accept_transaction(req).await {
            Ok(()) => {
                self.send(SwapMessage::Hold { id });
                Ok(Dispatch::Advanced)
            }
            Err(e) => {
                debug!(order = %id, "accept rejected: {}", e);
                Ok(Dispatch::Done)
            }
        }
    }

    async fn on_hold(&self, id: &OrderId) -> CoordinatorResult<Dispatch> {
        // observers drop the order out of the visible book as well
        if let Some(handle) = self.book.get(id).await {
            let mut descr = handle.lock().expect("order mutex poisoned");
            if descr.state < OrderState::Hold {
                descr.advance(OrderState::Hold)?;
            }
        }
        let Some(swap) = self.local_swap(id) else { return Ok(Dispatch::Done) };
        self.send(SwapMessage::HoldApply {
            id: id.clone(),
            from: swap.own_address.into_bytes(),
        });
        Ok(Dispatch::Done)
    }

    async fn on_hold_apply(&self, id: &OrderId, from: &[u8]) -> CoordinatorResult<Dispatch> {
        if !self.exchange.is_started().await {
            return Ok(Dispatch::Done);
        }
        let Some(handle) = self.exchange.transaction(id).await else {
            return Ok(Dispatch::Done);
        };
        match self.exchange.update_when_hold_applied(&handle, from).await? {
            AckOutcome::Advanced(_) => {
                self.send(SwapMessage::Init { id: id.clone() });
                Ok(Dispatch::Advanced)
            }
            AckOutcome::Premature => Ok(Dispatch::Premature),
            _ => Ok(Dispatch::Done),
        }
    }

    async fn on_init(&self, id: &OrderId) -> CoordinatorResult<Dispatch> {
        let Some(mut swap) = self.local_swap(id) else { return Ok(Dispatch::Done) };

        let secret_hash = if swap.role == Role::Maker {
            // the maker commits to the hash before any funds are locked
            let mut secret = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut secret);
            let hash: [u8; 32] = Sha256::digest(secret).into();
            swap.secret = Some(secret);
            swap.secret_hash = Some(hash);
            Some(hash)
        } else {
            None
        };
        self.store_local_swap(id, swap.clone());

        if let Some(handle) = self.book.get(id).await {
            let mut descr = handle.lock().expect("order mutex poisoned");
            if descr.state < OrderState::Initialized {
                descr.advance(OrderState::Initialized)?;
            }
            descr.secret_hash = secret_hash.or(descr.secret_hash);
        }

        self.send(SwapMessage::Initialized {
            id: id.clone(),
            from: swap.own_address.into_bytes(),
            pubkey: swap.own_pubkey,
            secret_hash,
        });
        Ok(Dispatch::Done)
    }

    async fn on_initialized(
        &self,
        id: &OrderId,
        from: &[u8],
        pubkey: Vec<u8>,
        secret_hash: Option<[u8; 32]>,
    ) -> CoordinatorResult<Dispatch> {
        if !self.exchange.is_started().await {
            return Ok(Dispatch::Done);
        }
        let Some(handle) = self.exchange.transaction(id).await else {
            return Ok(Dispatch::Done);
        };
        let outcome = match self
            .exchange
            .update_when_initialized(&handle, from, pubkey, secret_hash)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) if !e.is_retryable() => {
                // structural defect such as a replayed secret hash
                warn!(order = %id, "initialization rejected: {}", e);
                self.exchange.delete_transaction(id).await;
                self.send(SwapMessage::Cancel { id: id.clone(), reason: e.to_string() });
                return Ok(Dispatch::Done);
            }
            Err(e) => return Err(e),
        };
        match outcome {
            AckOutcome::Advanced(_) => {
                let (secret_hash, maker_pubkey, taker_pubkey) = {
                    let order = handle.lock().expect("order mutex poisoned");
                    let session = order.session.as_ref().ok_or_else(|| {
                        CoordinatorError::InvalidState("session missing".to_string())
                    })?;
                    (
                        session.secret_hash,
                        session.maker_pubkey.clone(),
                        session.taker_pubkey.clone(),
                    )
                };
                let Some(secret_hash) = secret_hash else {
                    warn!(order = %id, "initialized without a committed secret hash");
                    self.exchange.delete_transaction(id).await;
                    self.send(SwapMessage::Cancel {
                        id: id.clone(),
                        reason: "missing secret hash".to_string(),
                    });
                    return Ok(Dispatch::Done);
                };
                self.send(SwapMessage::Create {
                    id: id.clone(),
                    secret_hash,
                    maker_pubkey,
                    taker_pubkey,
                });
                Ok(Dispatch::Advanced)
            }
            AckOutcome::Premature => Ok(Dispatch::Premature),
            _ => Ok(Dispatch::Done),
        }
    }

    async fn on_create(
        &self,
        id: &OrderId,
        secret_hash: [u8; 32],
        maker_pubkey: Vec<u8>,
        taker_pubkey: Vec<u8>,
    ) -> CoordinatorResult<Dispatch> {
        let Some(mut swap) = self.local_swap(id) else { return Ok(Dispatch::Done) };
        let Some(handle) = self.book.get(id).await else { return Ok(Dispatch::Done) };
        let descr = handle.lock().expect("order mutex poisoned").clone();

        // the committed hash must match what the maker generated
        if swap.role == Role::Maker && swap.secret_hash != Some(secret_hash) {
            warn!(order = %id, "create carries a foreign secret hash, ignoring");
            return Ok(Dispatch::Done);
        }
        swap.secret_hash = Some(secret_hash);

        let (currency, amount, deadline_secs, redeemer) = match swap.role {
            Role::Maker => (
                descr.from_currency.clone(),
                descr.from_amount,
                MAKER_REFUND_AFTER_SECS,
                taker_pubkey.clone(),
            ),
            Role::Taker => (
                descr.to_currency.clone(),
                descr.to_amount,
                TAKER_REFUND_AFTER_SECS,
                maker_pubkey.clone(),
            ),
        };
        swap.counterparty_pubkey = redeemer.clone();

        let conn = self
            .registry
            .connector_by_currency(&currency)
            .ok_or_else(|| CoordinatorError::NoSession(currency.clone()))?;

        let spec = HtlcSpec {
            secret_hash,
            redeemer_pubkey: redeemer,
            refund_pubkey: swap.own_pubkey.clone(),
            amount,
            refund_deadline: Utc::now() + TimeDelta::seconds(deadline_secs),
        };

        {
            let mut d = handle.lock().expect("order mutex poisoned");
            d.in_flight = true;
        }
        let leg = self
            .with_retry("create htlc pay-in", || {
                conn.create_htlc_payin(&spec, &descr.reserved_utxos)
            })
            .await?;

        let pay_in_txid = leg.pay_in_txid.clone();
        swap.own_leg = Some(leg);
        self.store_local_swap(id, swap.clone());

        {
            let mut d = handle.lock().expect("order mutex poisoned");
            if d.state < OrderState::Created {
                d.advance(OrderState::Created)?;
            }
            d.secret_hash = Some(secret_hash);
        }

        info!(order = %id, txid = %pay_in_txid, "htlc pay-in broadcast");
        self.send(SwapMessage::Created {
            id: id.clone(),
            from: swap.own_address.into_bytes(),
            pay_in_txid,
        });
        Ok(Dispatch::Done)
    }

    async fn on_created(
        &self,
        id: &OrderId,
        from: &[u8],
        pay_in_txid: String,
    ) -> CoordinatorResult<Dispatch> {
        if !self.exchange.is_started().await {
            return Ok(Dispatch::Done);
        }
        let Some(handle) = self.exchange.transaction(id).await else {
            return Ok(Dispatch::Done);
        };
        match self.exchange.update_when_created(&handle, from, pay_in_txid).await? {
            AckOutcome::Advanced(_) => {
                let (maker_pay_in, taker_pay_in) = {
                    let order = handle.lock().expect("order mutex poisoned");
                    let session = order.session.as_ref().ok_or_else(|| {
                        CoordinatorError::InvalidState("session missing".to_string())
                    })?;
                    (session.maker_pay_in.clone(), session.taker_pay_in.clone())
                };
                if let (Some(maker_pay_in), Some(taker_pay_in)) = (maker_pay_in, taker_pay_in) {
                    self.send(SwapMessage::Commit {
                        id: id.clone(),
                        maker_pay_in,
                        taker_pay_in,
                    });
                }
                Ok(Dispatch::Advanced)
            }
            AckOutcome::Premature => Ok(Dispatch::Premature),
            _ => Ok(Dispatch::Done),
        }
    }

    async fn on_commit(
        &self,
        id: &OrderId,
        maker_pay_in: String,
        taker_pay_in: String,
    ) -> CoordinatorResult<Dispatch> {
        let Some(mut swap) = self.local_swap(id) else { return Ok(Dispatch::Done) };

        let (own, counterparty) = match swap.role {
            Role::Maker => (&maker_pay_in, taker_pay_in.clone()),
            Role::Taker => (&taker_pay_in, maker_pay_in.clone()),
        };
        if let Some(leg) = &swap.own_leg {
            if &leg.pay_in_txid != own {
                warn!(order = %id, "commit relays an unexpected own pay-in, ignoring");
                return Ok(Dispatch::Done);
            }
        }
        swap.counterparty_pay_in = Some(counterparty);
        self.store_local_swap(id, swap);

        if let Some(handle) = self.book.get(id).await {
            let mut descr = handle.lock().expect("order mutex poisoned");
            if descr.state < OrderState::Signed {
                descr.advance(OrderState::Signed)?;
            }
        }
        Ok(Dispatch::Done)
    }

    async fn on_confirmed(&self, id: &OrderId, from: &[u8]) -> CoordinatorResult<Dispatch> {
        if !self.exchange.is_started().await {
            return Ok(Dispatch::Done);
        }
        let Some(handle) = self.exchange.transaction(id).await else {
            return Ok(Dispatch::Done);
        };
        match self.exchange.update_when_confirmed(&handle, from).await? {
            AckOutcome::Advanced(_) => {
                info!(order = %id, "swap settled on both chains");
                self.exchange.delete_transaction(id).await;
                self.send(SwapMessage::Finished { id: id.clone() });
                metrics::record_swap_finished();
                Ok(Dispatch::Advanced)
            }
            AckOutcome::Premature => Ok(Dispatch::Premature),
            _ => Ok(Dispatch::Done),
        }
    }

    async fn on_finished(&self, id: &OrderId) -> CoordinatorResult<Dispatch> {
        match self.local_swap(id) {
            Some(swap) if swap.role == Role::Maker => {
                // reveal the secret by redeeming the taker leg
                self.redeem_counterparty(id).await?;
            }
            // the taker settles from its own leg's spend during polling
            Some(_) => {}
            None => {
                // observer: retire the mirrored entry
                if let Some(handle) = self.book.get(id).await {
                    let local = handle.lock().expect("order mutex poisoned").local;
                    if !local {
                        self.finalize(id, OrderState::Finished, None, None).await?;
                    }
                }
            }
        }
        Ok(Dispatch::Done)
    }

    async fn on_cancel(&self, id: &OrderId, reason: &str) -> CoordinatorResult<Dispatch> {
        debug!(order = %id, "cancel received: {}", reason);
        if self.exchange.is_started().await {
            self.exchange.delete_pending_transaction(id).await;
            self.exchange.delete_transaction(id).await;
        }
        if let Some(handle) = self.book.get(id).await {
            let cancelled = {
                let mut descr = handle.lock().expect("order mutex poisoned");
                if !descr.state.is_terminal() && descr.state < OrderState::Created {
                    descr.advance(OrderState::Cancelled)?;
                    true
                } else {
                    false
                }
            };
            if cancelled {
                self.exchange.unlock_utxos(id);
                self.book.move_to_history(id).await;
                self.local_swaps.lock().expect("swaps mutex poisoned").remove(id);
                metrics::record_order_cancelled();
            }
        }
        Ok(Dispatch::Done)
    }

    // ------------------------------------------------------------------
    // polling and timers

    /// One polling pass over every local swap.
    pub async fn poll_swaps(&self) {
        let ids: Vec<OrderId> = {
            let swaps = self.local_swaps.lock().expect("swaps mutex poisoned");
            swaps.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.poll_one(&id).await {
                if e.is_retryable() {
                    warn!(order = %id, "transient poll error: {}", e);
                } else {
                    error!(order = %id, "poll error: {}", e);
                }
            }
        }
        self.drop_stale_parked();
    }

    async fn poll_one(&self, id: &OrderId) -> CoordinatorResult<()> {
        let Some(swap) = self.local_swap(id) else { return Ok(()) };
        let Some(handle) = self.book.get(id).await else { return Ok(()) };
        let descr = handle.lock().expect("order mutex poisoned").clone();

        match descr.state {
            OrderState::Signed => self.watch_counterparty_confirmations(id, &swap, &descr).await?,
            OrderState::Committed => {
                if swap.role == Role::Taker && swap.redeem_tx.is_none() {
                    self.try_taker_redeem(id, &swap).await?;
                }
            }
            _ => {}
        }

        // refund path: own leg expired without settlement
        if let Some(own_leg) = &swap.own_leg {
            let refundable = matches!(
                descr.state,
                OrderState::Created | OrderState::Signed | OrderState::Committed
            );
            if refundable && Utc::now() > own_leg.refund_deadline {
                self.refund_own_leg(id, &swap, &descr, own_leg.clone()).await?;
            }
        }
        Ok(())
    }

    async fn watch_counterparty_confirmations(
        &self,
        id: &OrderId,
        swap: &LocalSwap,
        descr: &OrderDescr,
    ) -> CoordinatorResult<()> {
        let Some(cp_txid) = swap.counterparty_pay_in.clone() else { return Ok(()) };
        let cp_currency = match swap.role {
            Role::Maker => descr.to_currency.clone(),
            Role::Taker => descr.from_currency.clone(),
        };
        let conn = self
            .registry
            .connector_by_currency(&cp_currency)
            .ok_or_else(|| CoordinatorError::NoSession(cp_currency))?;

        let confs = conn.tx_confirmations(&cp_txid).await?;
        if confs < conn.param().required_confirmations {
            return Ok(());
        }

        // the counterparty self-reported this txid; read it off chain and
        // check it really locks the agreed amount to the agreed hash
        let Some(secret_hash) = swap.secret_hash else { return Ok(()) };
        let expected_amount = match swap.role {
            Role::Maker => descr.to_amount,
            Role::Taker => descr.from_amount,
        };
        let Some(cp_leg) = conn
            .inspect_htlc_payin(&cp_txid, &secret_hash, expected_amount)
            .await?
        else {
            error!(
                order = %id,
                txid = %cp_txid,
                "counterparty pay-in does not commit the agreed hash and amount"
            );
            // stop watching the bogus txid; the own-leg refund deadline
            // resolves the swap
            let mut updated = swap.clone();
            updated.counterparty_pay_in = None;
            self.store_local_swap(id, updated);
            return Ok(());
        };

        {
            let Some(handle) = self.book.get(id).await else { return Ok(()) };
            let mut d = handle.lock().expect("order mutex poisoned");
            if d.state == OrderState::Signed {
                d.advance(OrderState::Committed)?;
                d.in_flight = false;
            }
        }
        let mut updated = swap.clone();
        updated.counterparty_leg = Some(cp_leg);
        self.store_local_swap(id, updated);

        info!(order = %id, confirmations = confs, "counterparty pay-in validated and confirmed");
        self.send(SwapMessage::Confirmed {
            id: id.clone(),
            from: swap.own_address.clone().into_bytes(),
        });
        Ok(())
    }

    /// Taker: extract the revealed secret from our own leg's spend and use it
    /// to redeem the maker leg.
    async fn try_taker_redeem(&self, id: &OrderId, swap: &LocalSwap) -> CoordinatorResult<()> {
        let Some(own_leg) = &swap.own_leg else { return Ok(()) };
        let own_conn = self
            .registry
            .connector_by_currency(&own_leg.currency)
            .ok_or_else(|| CoordinatorError::NoSession(own_leg.currency.clone()))?;
        let Some(secret) = own_conn.watch_secret(own_leg).await? else {
            return Ok(());
        };
        if <[u8; 32]>::from(Sha256::digest(secret)) != own_leg.secret_hash {
            warn!(order = %id, "revealed secret does not match the committed hash");
            return Ok(());
        }

        // only the leg that passed on-chain validation is redeemable
        let Some(cp_leg) = swap.counterparty_leg.clone() else { return Ok(()) };
        let conn = self
            .registry
            .connector_by_currency(&cp_leg.currency)
            .ok_or_else(|| CoordinatorError::NoSession(cp_leg.currency.clone()))?;
        let redeem_tx = self
            .with_retry("redeem maker leg", || {
                conn.redeem_htlc(&cp_leg, &secret, &swap.own_dest_address)
            })
            .await?;

        let mut updated = swap.clone();
        updated.secret = Some(secret);
        updated.redeem_tx = Some(redeem_tx.clone());
        self.store_local_swap(id, updated);
        self.finalize(id, OrderState::Finished, Some(secret), None).await?;
        info!(order = %id, txid = %redeem_tx, "taker redeemed the maker leg");
        Ok(())
    }

    /// Maker: spend the taker leg, revealing the secret on chain.
    async fn redeem_counterparty(&self, id: &OrderId) -> CoordinatorResult<()> {
        let Some(swap) = self.local_swap(id) else { return Ok(()) };
        if swap.redeem_tx.is_some() {
            return Ok(());
        }
        let Some(secret) = swap.secret else {
            return Err(CoordinatorError::InvalidState("maker secret missing".to_string()));
        };
        // only the leg that passed on-chain validation is redeemable
        let Some(cp_leg) = swap.counterparty_leg.clone() else { return Ok(()) };
        let conn = self
            .registry
            .connector_by_currency(&cp_leg.currency)
            .ok_or_else(|| CoordinatorError::NoSession(cp_leg.currency.clone()))?;

        let redeem_tx = self
            .with_retry("redeem taker leg", || {
                conn.redeem_htlc(&cp_leg, &secret, &swap.own_dest_address)
            })
            .await?;

        let mut updated = swap.clone();
        updated.redeem_tx = Some(redeem_tx.clone());
        self.store_local_swap(id, updated);
        self.finalize(id, OrderState::Finished, Some(secret), None).await?;
        info!(order = %id, txid = %redeem_tx, "maker redeemed the taker leg");
        Ok(())
    }

    async fn refund_own_leg(
        &self,
        id: &OrderId,
        swap: &LocalSwap,
        descr: &OrderDescr,
        own_leg: HtlcLeg,
    ) -> CoordinatorResult<()> {
        let conn = self
            .registry
            .connector_by_currency(&own_leg.currency)
            .ok_or_else(|| CoordinatorError::NoSession(own_leg.currency.clone()))?;
        let refund_address = match swap.role {
            Role::Maker => descr.from_address.clone(),
            Role::Taker => swap.own_address.clone(),
        };
        let refund_tx = self
            .with_retry("refund own leg", || conn.refund_htlc(&own_leg, &refund_address))
            .await?;

        warn!(order = %id, txid = %refund_tx, "swap rolled back, own leg refunded");
        self.finalize(id, OrderState::RolledBack, None, Some(refund_tx)).await?;
        metrics::record_swap_rolled_back();
        Ok(())
    }

    /// Expiry sweep and maker-input re-validation.
    pub async fn sweep(&self) {
        // current heights per currency, for block expiry
        let mut heights = HashMap::new();
        for conn in self.registry.all() {
            match conn.block_count().await {
                Ok(h) => {
                    heights.insert(conn.currency().to_string(), h);
                }
                Err(e) => warn!("block count failed for {}: {}", conn.currency(), e),
            }
        }

        self.exchange.erase_expired_transactions(&heights).await;

        // local TTL / block expiry of book orders still waiting
        for descr in self.book.list_orders().await {
            if descr.state.is_terminal() || descr.state >= OrderState::Created {
                continue;
            }
            let by_block = heights
                .get(&descr.from_currency)
                .map(|h| descr.expired_by_block(*h))
                .unwrap_or(false);
            if by_block || descr.expired() {
                if let Err(e) = self.finalize(&descr.id, OrderState::Expired, None, None).await {
                    error!(order = %descr.id, "expiry failed: {}", e);
                } else {
                    metrics::record_order_expired();
                }
            }
        }

        self.revalidate_maker_inputs().await;
        self.drop_stale_parked();
    }

    /// Re-confirm that maker inputs of accepted swaps are still unspent.
    /// A spent input is a fatal defect that cancels the order.
    async fn revalidate_maker_inputs(&self) {
        if !self.exchange.is_started().await {
            return;
        }
        let interval_secs = self.config.order_inputs_check_interval_secs;
        for handle in self.exchange.transactions().await {
            let (id, currency, utxos) = {
                let order = handle.lock().expect("order mutex poisoned");
                (order.id.clone(), order.from_currency.clone(), order.maker_utxos.clone())
            };
            if !self.exchange.utxo_recheck_due(&id, interval_secs) {
                continue;
            }
            debug!(order = %id, "running automated maker utxo check");
            let Some(conn) = self.registry.connector_by_currency(&currency) else {
                continue;
            };
            for entry in &utxos {
                match conn.get_tx_out(entry).await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            order = %id,
                            utxo = %entry,
                            "bad maker utxo in order, cancelling"
                        );
                        self.exchange.delete_transaction(&id).await;
                        self.send(SwapMessage::Cancel {
                            id: id.clone(),
                            reason: "maker utxo spent".to_string(),
                        });
                        break;
                    }
                    // non-fatal, skip this round
                    Err(e) => {
                        warn!(order = %id, "utxo recheck failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // helpers

    fn local_swap(&self, id: &OrderId) -> Option<LocalSwap> {
        self.local_swaps.lock().expect("swaps mutex poisoned").get(id).cloned()
    }

    fn store_local_swap(&self, id: &OrderId, swap: LocalSwap) {
        self.local_swaps.lock().expect("swaps mutex poisoned").insert(id.clone(), swap);
    }

    /// Move a local order to a terminal state, release reservations and
    /// retire it to history.
    async fn finalize(
        &self,
        id: &OrderId,
        state: OrderState,
        preimage: Option<[u8; 32]>,
        refund_tx: Option<String>,
    ) -> CoordinatorResult<()> {
        let Some(handle) = self.book.get(id).await else { return Ok(()) };
        {
            let mut descr = handle.lock().expect("order mutex poisoned");
            if descr.state.is_terminal() {
                return Ok(());
            }
            descr.advance(state)?;
            descr.in_flight = false;
            if preimage.is_some() {
                descr.preimage = preimage;
            }
            if refund_tx.is_some() {
                descr.refund_tx = refund_tx;
            }
        }
        self.exchange.unlock_utxos(id);
        self.book.move_to_history(id).await;
        Ok(())
    }

    fn drop_stale_parked(&self) {
        let mut parked = self.parked.lock().expect("parked mutex poisoned");
        parked.retain(|(at, _)| at.elapsed().as_secs() < PARKED_TTL_SECS);
    }

    /// Bounded retry for transient connector failures.
    async fn with_retry<T, Fut>(
        &self,
        operation: &str,
        mut f: impl FnMut() -> Fut,
    ) -> CoordinatorResult<T>
    where
        Fut: std::future::Future<Output = CoordinatorResult<T>>,
    {
        let mut last = None;
        for attempt in 1..=self.config.max_retries.max(1) {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    warn!("{} failed (attempt {}): {}", operation, attempt, e);
                    last = Some(e);
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(CoordinatorError::Timeout { operation: operation.to_string() }))
    }
}

enum Dispatch {
    /// A phase advanced; parked acks should be rechecked.
    Advanced,
    /// Ack for a future phase; hold it briefly.
    Premature,
    Done,
}

/// Greedy input selection over confirmed outputs.
fn select_inputs(unspent: &[UtxoEntry], target: Amount) -> Option<Vec<UtxoEntry>> {
    let mut picked = Vec::new();
    let mut total = 0.0f64;
    for entry in unspent {
        picked.push(entry.clone());
        total += entry.amount;
        if total >= target.as_f64() {
            return Some(picked);
        }
    }
    None
}

fn descr_from_wire(order: &WireOrder) -> OrderDescr {
    OrderDescr {
        id: order.id.clone(),
        from_currency: order.from_currency.clone(),
        from_amount: order.from_amount,
        from_address: order.from_address.clone(),
        to_currency: order.to_currency.clone(),
        to_amount: order.to_amount,
        to_address: order.to_address.clone(),
        state: OrderState::Pending,
        created: order.created,
        updated: Utc::now(),
        role: Role::Maker,
        local: false,
        maker_pubkey: order.maker_pubkey.clone(),
        taker_pubkey: Vec::new(),
        secret_hash: None,
        preimage: None,
        refund_tx: None,
        reserved_utxos: Vec::new(),
        created_block_height: order.created_block_height,
        block_hash: order.block_hash.clone(),
        in_flight: false,
    }
}
