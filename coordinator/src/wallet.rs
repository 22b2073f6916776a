//! Wallet connector layer
//!
//! Chain adapters are opaque: the coordinator only consumes the
//! [`WalletConnector`] interface for UTXO enumeration, address validation,
//! HTLC construction and confirmation polling. The registry keeps one
//! connector per currency with health monitoring.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::amount::Amount;
use crate::config::WalletSection;
use crate::error::CoordinatorResult;
use crate::utxo::UtxoEntry;

/// Static per-chain parameters sourced from the wallet config section.
#[derive(Debug, Clone)]
pub struct WalletParam {
    pub currency: String,
    pub title: String,
    pub address: String,
    /// Minimum order leg size in base units; zero disables the check.
    pub dust_amount: u64,
    pub tx_version: u32,
    pub json_version: String,
    pub required_confirmations: u32,
    pub block_time_secs: u32,
}

impl WalletParam {
    pub fn from_section(currency: &str, section: &WalletSection) -> WalletParam {
        WalletParam {
            currency: currency.to_string(),
            title: section.title.clone(),
            address: section.address.clone(),
            dust_amount: section.minimum_amount,
            tx_version: section.tx_version,
            json_version: section.json_version.clone(),
            required_confirmations: section.required_confirmations,
            block_time_secs: section.block_time_secs,
        }
    }
}

/// Everything needed to build one HTLC pay-in.
#[derive(Debug, Clone)]
pub struct HtlcSpec {
    pub secret_hash: [u8; 32],
    pub redeemer_pubkey: Vec<u8>,
    pub refund_pubkey: Vec<u8>,
    pub amount: Amount,
    pub refund_deadline: DateTime<Utc>,
}

/// A broadcast HTLC leg as tracked by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtlcLeg {
    pub currency: String,
    pub pay_in_txid: String,
    #[serde(with = "hex::serde")]
    pub script: Vec<u8>,
    pub amount: Amount,
    pub secret_hash: [u8; 32],
    pub refund_deadline: DateTime<Utc>,
}

/// Opaque chain adapter for one UTXO currency.
#[async_trait]
pub trait WalletConnector: Send + Sync {
    fn currency(&self) -> &str;

    fn param(&self) -> &WalletParam;

    /// Syntactic address validation for this chain.
    fn is_valid_address(&self, address: &str) -> bool;

    /// Request a fresh receive address from the wallet.
    async fn new_token_address(&self) -> CoordinatorResult<String>;

    /// Spendable outputs, minus the excluded (reserved) set.
    async fn unspent(&self, excluded: &[UtxoEntry]) -> CoordinatorResult<Vec<UtxoEntry>>;

    /// Wallet balance in coins, minus the excluded set.
    async fn wallet_balance(&self, excluded: &[UtxoEntry]) -> CoordinatorResult<f64>;

    /// Whether the outpoint is still unspent on chain.
    async fn get_tx_out(&self, entry: &UtxoEntry) -> CoordinatorResult<bool>;

    async fn tx_confirmations(&self, txid: &str) -> CoordinatorResult<u32>;

    async fn block_count(&self) -> CoordinatorResult<u64>;

    /// Hash of the current chain tip, recorded in new orders for block
    /// expiry tracking.
    async fn tip_hash(&self) -> CoordinatorResult<String>;

    /// Build, sign and broadcast the HTLC pay-in spending `inputs`.
    async fn create_htlc_payin(
        &self,
        spec: &HtlcSpec,
        inputs: &[UtxoEntry],
    ) -> CoordinatorResult<HtlcLeg>;

    /// Read a pay-in off chain and check it carries an output locked to
    /// `secret_hash` for exactly `amount`. Returns the leg as found on
    /// chain, or `None` when no output matches.
    async fn inspect_htlc_payin(
        &self,
        pay_in_txid: &str,
        secret_hash: &[u8; 32],
        amount: Amount,
    ) -> CoordinatorResult<Option<HtlcLeg>>;

    /// Spend an HTLC leg with the revealed secret.
    async fn redeem_htlc(
        &self,
        leg: &HtlcLeg,
        secret: &[u8; 32],
        to_address: &str,
    ) -> CoordinatorResult<String>;

    /// Reclaim an HTLC leg after its refund deadline.
    async fn refund_htlc(&self, leg: &HtlcLeg, to_address: &str) -> CoordinatorResult<String>;

    /// Look for a revealed secret in spends of the leg.
    async fn watch_secret(&self, leg: &HtlcLeg) -> CoordinatorResult<Option<[u8; 32]>>;
}

/// Manages connectors for all configured currencies
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: DashMap<String, Arc<dyn WalletConnector>>,
    /// Currencies advertised by the service-node network, beyond the local set.
    network_services: DashMap<String, ()>,
}

impl ConnectorRegistry {
    pub fn new() -> ConnectorRegistry {
        ConnectorRegistry::default()
    }

    pub fn add(&self, connector: Arc<dyn WalletConnector>) {
        info!("wallet connector registered for {}", connector.currency());
        self.connectors.insert(connector.currency().to_string(), connector);
    }

    pub fn remove(&self, currency: &str) {
        self.connectors.remove(currency);
    }

    pub fn connector_by_currency(&self, currency: &str) -> Option<Arc<dyn WalletConnector>> {
        self.connectors.get(currency).map(|c| c.clone())
    }

    /// Locally tradable currencies.
    pub fn available_currencies(&self) -> Vec<String> {
        let mut list: Vec<String> = self.connectors.iter().map(|e| e.key().clone()).collect();
        list.sort();
        list
    }

    pub fn all(&self) -> Vec<Arc<dyn WalletConnector>> {
        self.connectors.iter().map(|e| e.value().clone()).collect()
    }

    pub fn add_network_service(&self, currency: impl Into<String>) {
        self.network_services.insert(currency.into(), ());
    }

    /// Currencies seen on the network, local ones included.
    pub fn network_currencies(&self) -> Vec<String> {
        let mut set: std::collections::BTreeSet<String> =
            self.connectors.iter().map(|e| e.key().clone()).collect();
        set.extend(self.network_services.iter().map(|e| e.key().clone()));
        set.into_iter().collect()
    }

    /// Health check for all connectors
    pub async fn health_check(&self) -> Vec<(String, bool)> {
        let snapshot: Vec<(String, Arc<dyn WalletConnector>)> = self
            .connectors
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut results = Vec::new();
        for (currency, connector) in snapshot {
            let healthy = match connector.block_count().await {
                Ok(_) => true,
                Err(e) => {
                    error!("health check failed for {}: {}", currency, e);
                    false
                }
            };
            crate::metrics::record_chain_health(&currency, healthy);
            results.push((currency, healthy));
        }
        results
    }
}

/// Scripted in-memory connector used by the test suites.
#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::error::CoordinatorError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    pub struct MockConnector {
        param: WalletParam,
        pub utxos: Mutex<Vec<UtxoEntry>>,
        pub confirmations: Mutex<HashMap<String, u32>>,
        pub spent: Mutex<HashSet<(String, u32)>>,
        pub revealed: Mutex<HashMap<String, [u8; 32]>>,
        /// Broadcast HTLC legs by pay-in txid, the mock's view of the chain.
        pub legs: Mutex<HashMap<String, HtlcLeg>>,
        pub height: AtomicU64,
        payin_seq: AtomicU64,
    }

    impl MockConnector {
        pub fn new(currency: &str) -> MockConnector {
            MockConnector {
                param: WalletParam {
                    currency: currency.to_string(),
                    title: currency.to_string(),
                    address: String::new(),
                    dust_amount: 0,
                    tx_version: 1,
                    json_version: String::new(),
                    required_confirmations: 1,
                    block_time_secs: 60,
                },
                utxos: Mutex::new(Vec::new()),
                confirmations: Mutex::new(HashMap::new()),
                spent: Mutex::new(HashSet::new()),
                revealed: Mutex::new(HashMap::new()),
                legs: Mutex::new(HashMap::new()),
                height: AtomicU64::new(100),
                payin_seq: AtomicU64::new(0),
            }
        }

        pub fn fund(&self, txid: &str, vout: u32, amount: f64, address: &str) {
            self.utxos.lock().unwrap().push(UtxoEntry {
                txid: txid.to_string(),
                vout,
                amount,
                address: address.to_string(),
                script_pub_key: String::new(),
                confirmations: 10,
                raw_address: address.as_bytes().to_vec(),
                signature: Vec::new(),
            });
        }
    }

    #[async_trait]
    impl WalletConnector for MockConnector {
        fn currency(&self) -> &str {
            &self.param.currency
        }

        fn param(&self) -> &WalletParam {
            &self.param
        }

        fn is_valid_address(&self, address: &str) -> bool {
            !address.is_empty() && address.len() >= 8
        }

        async fn new_token_address(&self) -> CoordinatorResult<String> {
            Ok(format!("{}-fresh-address", self.param.currency))
        }

        async fn unspent(&self, excluded: &[UtxoEntry]) -> CoordinatorResult<Vec<UtxoEntry>> {
            let excluded: HashSet<&UtxoEntry> = excluded.iter().collect();
            Ok(self
                .utxos
                .lock()
                .unwrap()
                .iter()
                .filter(|u| !excluded.contains(u))
                .cloned()
                .collect())
        }

        async fn wallet_balance(&self, excluded: &[UtxoEntry]) -> CoordinatorResult<f64> {
            Ok(self.unspent(excluded).await?.iter().map(|u| u.amount).sum())
        }

        async fn get_tx_out(&self, entry: &UtxoEntry) -> CoordinatorResult<bool> {
            Ok(!self.spent.lock().unwrap().contains(&(entry.txid.clone(), entry.vout)))
        }

        async fn tx_confirmations(&self, txid: &str) -> CoordinatorResult<u32> {
            Ok(*self.confirmations.lock().unwrap().get(txid).unwrap_or(&0))
        }

        async fn block_count(&self) -> CoordinatorResult<u64> {
            Ok(self.height.load(Ordering::Relaxed))
        }

        async fn tip_hash(&self) -> CoordinatorResult<String> {
            Ok(format!("{:064x}", self.height.load(Ordering::Relaxed)))
        }

        async fn create_htlc_payin(
            &self,
            spec: &HtlcSpec,
            _inputs: &[UtxoEntry],
        ) -> CoordinatorResult<HtlcLeg> {
            let seq = self.payin_seq.fetch_add(1, Ordering::Relaxed);
            let txid = format!("{}-payin-{}", self.param.currency, seq);
            self.confirmations.lock().unwrap().insert(txid.clone(), 0);
            let leg = HtlcLeg {
                currency: self.param.currency.clone(),
                pay_in_txid: txid.clone(),
                script: spec.secret_hash.to_vec(),
                amount: spec.amount,
                secret_hash: spec.secret_hash,
                refund_deadline: spec.refund_deadline,
            };
            self.legs.lock().unwrap().insert(txid, leg.clone());
            Ok(leg)
        }

        async fn inspect_htlc_payin(
            &self,
            pay_in_txid: &str,
            secret_hash: &[u8; 32],
            amount: Amount,
        ) -> CoordinatorResult<Option<HtlcLeg>> {
            let legs = self.legs.lock().unwrap();
            Ok(legs
                .get(pay_in_txid)
                .filter(|leg| leg.secret_hash == *secret_hash && leg.amount == amount)
                .cloned())
        }

        async fn redeem_htlc(
            &self,
            leg: &HtlcLeg,
            secret: &[u8; 32],
            _to_address: &str,
        ) -> CoordinatorResult<String> {
            self.revealed.lock().unwrap().insert(leg.pay_in_txid.clone(), *secret);
            Ok(format!("redeem-{}", leg.pay_in_txid))
        }

        async fn refund_htlc(&self, leg: &HtlcLeg, _to_address: &str) -> CoordinatorResult<String> {
            if Utc::now() < leg.refund_deadline {
                return Err(CoordinatorError::InvalidState(
                    "refund before deadline".to_string(),
                ));
            }
            Ok(format!("refund-{}", leg.pay_in_txid))
        }

        async fn watch_secret(&self, leg: &HtlcLeg) -> CoordinatorResult<Option<[u8; 32]>> {
            Ok(self.revealed.lock().unwrap().get(&leg.pay_in_txid).copied())
        }
    }
}
