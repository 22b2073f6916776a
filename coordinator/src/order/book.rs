//! Concurrent order book
//!
//! Two maps: active orders and historical (terminal) orders. Descriptors are
//! shared as `Arc<Mutex<_>>` handles; callers take the map lock briefly to
//! obtain a handle, drop it, then lock the descriptor. No chain or peer I/O
//! happens under either lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::amount::{ask_price, bid_price, price_eq, Amount};
use crate::order::descr::{OrderDescr, OrderId, OrderState};

/// Terminal orders stay visible in listings for this long.
const TERMINAL_VISIBILITY_SECS: i64 = 60;

pub type OrderHandle = Arc<Mutex<OrderDescr>>;

/// A row of the order book at some detail level.
#[derive(Debug, Clone)]
pub enum BookEntry {
    /// Level 1 and 2: price level with aggregated size and order count.
    Level { price: f64, size: Amount, count: usize },
    /// Level 3: one entry per order.
    PerOrder { price: f64, size: Amount, id: OrderId },
    /// Level 4: best price with every order id sharing it.
    BestWithIds { price: f64, size: Amount, ids: Vec<OrderId> },
}

/// Order book query result.
#[derive(Debug, Clone)]
pub struct OrderBookView {
    pub detail: u32,
    pub maker: String,
    pub taker: String,
    pub asks: Vec<BookEntry>,
    pub bids: Vec<BookEntry>,
}

/// Record returned by [`OrderBook::flush_cancelled`].
#[derive(Debug, Clone)]
pub struct FlushedOrder {
    pub id: OrderId,
    pub txtime: DateTime<Utc>,
    pub use_count: usize,
}

/// Active and historical orders with their query surface.
#[derive(Default)]
pub struct OrderBook {
    active: RwLock<HashMap<OrderId, OrderHandle>>,
    history: RwLock<HashMap<OrderId, OrderHandle>>,
}

impl OrderBook {
    pub fn new() -> OrderBook {
        OrderBook::default()
    }

    pub async fn insert(&self, descr: OrderDescr) -> OrderHandle {
        let id = descr.id.clone();
        let handle = Arc::new(Mutex::new(descr));
        self.active.write().await.insert(id, handle.clone());
        handle
    }

    /// Look up a handle, active first, then history.
    pub async fn get(&self, id: &OrderId) -> Option<OrderHandle> {
        if let Some(h) = self.active.read().await.get(id) {
            return Some(h.clone());
        }
        self.history.read().await.get(id).cloned()
    }

    /// Move a terminal order out of the active map.
    ///
    /// The handle stays shared, so views held by the driver remain valid.
    pub async fn move_to_history(&self, id: &OrderId) {
        let handle = self.active.write().await.remove(id);
        if let Some(handle) = handle {
            debug!(order = %id, "order moved to history");
            self.history.write().await.insert(id.clone(), handle);
        }
    }

    /// Snapshot of all orders, skipping terminal ones older than a minute.
    pub async fn list_orders(&self) -> Vec<OrderDescr> {
        let now = Utc::now();
        let mut out = Vec::new();
        for map in [&self.active, &self.history] {
            for handle in map.read().await.values() {
                let descr = handle.lock().expect("order mutex poisoned").clone();
                if descr.state.is_terminal()
                    && (now - descr.updated).num_seconds() > TERMINAL_VISIBILITY_SECS
                {
                    continue;
                }
                out.push(descr);
            }
        }
        out
    }

    /// Local orders: active plus finished/cancelled history, deduplicated,
    /// ascending by update time.
    pub async fn my_orders(&self) -> Vec<OrderDescr> {
        let mut out: Vec<OrderDescr> = Vec::new();
        for handle in self.active.read().await.values() {
            let descr = handle.lock().expect("order mutex poisoned").clone();
            if descr.local {
                out.push(descr);
            }
        }
        for handle in self.history.read().await.values() {
            let descr = handle.lock().expect("order mutex poisoned").clone();
            if descr.local
                && matches!(descr.state, OrderState::Finished | OrderState::Cancelled)
            {
                out.push(descr);
            }
        }
        out.sort_by_key(|d| d.updated);
        let mut seen = std::collections::HashSet::new();
        out.retain(|d| seen.insert(d.id.clone()));
        out
    }

    /// Completed trades of a pair, newest first. With `combined` the inverse
    /// direction is included.
    pub async fn fills(&self, maker: &str, taker: &str, combined: bool) -> Vec<OrderDescr> {
        let mut out: Vec<OrderDescr> = Vec::new();
        for handle in self.history.read().await.values() {
            let descr = handle.lock().expect("order mutex poisoned").clone();
            if descr.state != OrderState::Finished {
                continue;
            }
            let direct = descr.from_currency == maker && descr.to_currency == taker;
            let inverse = descr.from_currency == taker && descr.to_currency == maker;
            if direct || (combined && inverse) {
                out.push(descr);
            }
        }
        out.sort_by(|a, b| b.updated.cmp(&a.updated));
        out
    }

    /// Snapshot of finished orders for the series aggregator.
    pub async fn finished_orders(&self) -> Vec<OrderDescr> {
        let mut out: Vec<OrderDescr> = Vec::new();
        for handle in self.history.read().await.values() {
            let descr = handle.lock().expect("order mutex poisoned").clone();
            if descr.state == OrderState::Finished {
                out.push(descr);
            }
        }
        out.sort_by_key(|d| d.updated);
        out
    }

    /// The aggregated order book for a pair.
    ///
    /// Asks are orders selling `maker` for `taker`; bids are the inverse
    /// direction. Both vectors are sorted descending by their price, which
    /// puts the best ask (lowest) at the tail and the best bid (highest) at
    /// the head.
    pub async fn order_book(
        &self,
        detail: u32,
        maker: &str,
        taker: &str,
        max_orders: usize,
    ) -> OrderBookView {
        let max_orders = max_orders.max(1);
        let mut asks: Vec<OrderDescr> = Vec::new();
        let mut bids: Vec<OrderDescr> = Vec::new();

        for handle in self.active.read().await.values() {
            let descr = handle.lock().expect("order mutex poisoned").clone();
            if descr.state != OrderState::Pending
                || descr.from_amount.is_zero()
                || descr.to_amount.is_zero()
            {
                continue;
            }
            if descr.from_currency == maker && descr.to_currency == taker {
                asks.push(descr);
            } else if descr.from_currency == taker && descr.to_currency == maker {
                bids.push(descr);
            }
        }

        asks.sort_by(|a, b| {
            ask_of(b).partial_cmp(&ask_of(a)).unwrap_or(std::cmp::Ordering::Equal)
        });
        bids.sort_by(|a, b| {
            bid_of(b).partial_cmp(&bid_of(a)).unwrap_or(std::cmp::Ordering::Equal)
        });

        let (ask_rows, bid_rows) = match detail {
            1 => (best_level(&asks, true), best_level(&bids, false)),
            2 => (aggregated_levels(&asks, true, max_orders), aggregated_levels(&bids, false, max_orders)),
            3 => (per_order_levels(&asks, true, max_orders), per_order_levels(&bids, false, max_orders)),
            _ => (best_with_ids(&asks, true), best_with_ids(&bids, false)),
        };

        OrderBookView {
            detail,
            maker: maker.to_string(),
            taker: taker.to_string(),
            asks: ask_rows,
            bids: bid_rows,
        }
    }

    /// Drop cancelled orders older than `min_age` and report what was flushed.
    ///
    /// `use_count` is the number of outstanding handle references at flush
    /// time, useful for spotting leaked descriptors.
    pub async fn flush_cancelled(&self, min_age: Duration) -> Vec<FlushedOrder> {
        let now = Utc::now();
        let mut flushed = Vec::new();
        for map in [&self.active, &self.history] {
            let mut guard = map.write().await;
            let ids: Vec<OrderId> = guard
                .iter()
                .filter(|(_, handle)| {
                    let descr = handle.lock().expect("order mutex poisoned");
                    descr.state == OrderState::Cancelled && now - descr.updated >= min_age
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in ids {
                if let Some(handle) = guard.remove(&id) {
                    let txtime = handle.lock().expect("order mutex poisoned").updated;
                    flushed.push(FlushedOrder {
                        id,
                        txtime,
                        use_count: Arc::strong_count(&handle),
                    });
                }
            }
        }
        flushed
    }
}

fn ask_of(d: &OrderDescr) -> f64 {
    ask_price(d.from_amount, d.to_amount)
}

fn bid_of(d: &OrderDescr) -> f64 {
    bid_price(d.from_amount, d.to_amount)
}

fn price_of(d: &OrderDescr, is_ask: bool) -> f64 {
    if is_ask {
        ask_of(d)
    } else {
        bid_of(d)
    }
}

fn size_of(d: &OrderDescr, is_ask: bool) -> Amount {
    // an ask is sized in the maker currency it sells, a bid in the maker
    // currency it buys
    if is_ask {
        d.from_amount
    } else {
        d.to_amount
    }
}

/// Level 1: the single best price with its order count.
fn best_level(sorted: &[OrderDescr], is_ask: bool) -> Vec<BookEntry> {
    let best = if is_ask { sorted.last() } else { sorted.first() };
    let Some(best) = best else { return Vec::new() };
    let best_price = price_of(best, is_ask);
    let count = sorted
        .iter()
        .filter(|d| price_eq(price_of(d, is_ask), best_price))
        .count();
    vec![BookEntry::Level { price: best_price, size: size_of(best, is_ask), count }]
}

/// Level 2: aggregated price levels, best side of the sort respected.
fn aggregated_levels(sorted: &[OrderDescr], is_ask: bool, max_orders: usize) -> Vec<BookEntry> {
    let bound = max_orders.min(sorted.len());
    // best asks live at the tail of the descending sort, best bids at the head
    let window: Vec<&OrderDescr> = if is_ask {
        sorted[sorted.len() - bound..].iter().collect()
    } else {
        sorted[..bound].iter().collect()
    };

    let mut rows = Vec::new();
    let mut i = 0;
    while i < window.len() {
        let price = price_of(window[i], is_ask);
        let mut size = size_of(window[i], is_ask);
        let mut j = i + 1;
        while j < window.len() && price_eq(price_of(window[j], is_ask), price) {
            size = Amount(size.as_units() + size_of(window[j], is_ask).as_units());
            j += 1;
        }
        let count = sorted
            .iter()
            .filter(|d| price_eq(price_of(d, is_ask), price))
            .count();
        rows.push(BookEntry::Level { price, size, count });
        i = j;
    }
    rows
}

/// Level 3: the full book, one row per order.
fn per_order_levels(sorted: &[OrderDescr], is_ask: bool, max_orders: usize) -> Vec<BookEntry> {
    let bound = max_orders.min(sorted.len());
    let window: Vec<&OrderDescr> = if is_ask {
        sorted[sorted.len() - bound..].iter().collect()
    } else {
        sorted[..bound].iter().collect()
    };
    window
        .into_iter()
        .map(|d| BookEntry::PerOrder {
            price: price_of(d, is_ask),
            size: size_of(d, is_ask),
            id: d.id.clone(),
        })
        .collect()
}

/// Level 4: level 1 plus every order id sharing the best price.
fn best_with_ids(sorted: &[OrderDescr], is_ask: bool) -> Vec<BookEntry> {
    let best = if is_ask { sorted.last() } else { sorted.first() };
    let Some(best) = best else { return Vec::new() };
    let best_price = price_of(best, is_ask);
    let ids: Vec<OrderId> = sorted
        .iter()
        .filter(|d| price_eq(price_of(d, is_ask), best_price))
        .map(|d| d.id.clone())
        .collect();
    vec![BookEntry::BestWithIds { price: best_price, size: size_of(best, is_ask), ids }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::format_price;

    fn pending(from: &str, from_amt: &str, to: &str, to_amt: &str) -> OrderDescr {
        let mut d = OrderDescr::new_maker(
            from,
            Amount::from_decimal(from_amt).unwrap(),
            &format!("{}-addr-{}", from, from_amt),
            to,
            Amount::from_decimal(to_amt).unwrap(),
            &format!("{}-addr-{}", to, to_amt),
            1,
            "00",
        );
        d.state = OrderState::Pending;
        d
    }

    #[tokio::test]
    async fn level1_best_bid_and_ask() {
        let book = OrderBook::new();
        // asks at 0.0010, 0.0010 and 0.0012; bid at 0.0009
        book.insert(pending("BLOCK", "1000", "LTC", "1")).await;
        book.insert(pending("BLOCK", "2000", "LTC", "2")).await;
        book.insert(pending("BLOCK", "1000", "LTC", "1.2")).await;
        book.insert(pending("LTC", "0.9", "BLOCK", "1000")).await;

        let view = book.order_book(1, "BLOCK", "LTC", 50).await;
        assert_eq!(view.asks.len(), 1);
        match &view.asks[0] {
            BookEntry::Level { price, count, .. } => {
                assert_eq!(format_price(*price), "0.00100000");
                assert_eq!(*count, 2);
            }
            other => panic!("unexpected entry {:?}", other),
        }
        match &view.bids[0] {
            BookEntry::Level { price, count, .. } => {
                assert_eq!(format_price(*price), "0.00090000");
                assert_eq!(*count, 1);
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[tokio::test]
    async fn level2_aggregates_equal_prices() {
        let book = OrderBook::new();
        book.insert(pending("BLOCK", "1000", "LTC", "1")).await;
        book.insert(pending("BLOCK", "2000", "LTC", "2")).await;
        book.insert(pending("BLOCK", "1000", "LTC", "1.2")).await;

        let view = book.order_book(2, "BLOCK", "LTC", 50).await;
        assert_eq!(view.asks.len(), 2);
        // rows follow the descending sort: 0.0012 first, the best level last
        match &view.asks[0] {
            BookEntry::Level { price, count, .. } => {
                assert_eq!(format_price(*price), "0.00120000");
                assert_eq!(*count, 1);
            }
            other => panic!("unexpected entry {:?}", other),
        }
        match &view.asks[1] {
            BookEntry::Level { price, size, count } => {
                assert_eq!(format_price(*price), "0.00100000");
                assert_eq!(size.to_decimal(), "3000");
                assert_eq!(*count, 2);
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[tokio::test]
    async fn level3_carries_order_ids() {
        let book = OrderBook::new();
        let h = book.insert(pending("BLOCK", "1000", "LTC", "1")).await;
        let id = h.lock().unwrap().id.clone();
        let view = book.order_book(3, "BLOCK", "LTC", 50).await;
        match &view.asks[0] {
            BookEntry::PerOrder { id: got, .. } => assert_eq!(*got, id),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[tokio::test]
    async fn level4_lists_ids_at_best_price() {
        let book = OrderBook::new();
        book.insert(pending("BLOCK", "1000", "LTC", "1")).await;
        book.insert(pending("BLOCK", "2000", "LTC", "2")).await;
        book.insert(pending("BLOCK", "1000", "LTC", "1.2")).await;
        let view = book.order_book(4, "BLOCK", "LTC", 50).await;
        match &view.asks[0] {
            BookEntry::BestWithIds { ids, .. } => assert_eq!(ids.len(), 2),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[tokio::test]
    async fn fills_combined_includes_inverse() {
        let book = OrderBook::new();
        let mut a = pending("BLOCK", "1000", "LTC", "1");
        a.state = OrderState::Finished;
        let mut b = pending("LTC", "1", "BLOCK", "1000");
        b.state = OrderState::Finished;
        let ida = a.id.clone();
        let idb = b.id.clone();
        book.insert(a).await;
        book.insert(b).await;
        book.move_to_history(&ida).await;
        book.move_to_history(&idb).await;

        assert_eq!(book.fills("BLOCK", "LTC", true).await.len(), 2);
        assert_eq!(book.fills("BLOCK", "LTC", false).await.len(), 1);
    }

    #[tokio::test]
    async fn flush_cancelled_is_age_gated_and_one_shot() {
        let book = OrderBook::new();
        let mut d = pending("BLOCK", "1000", "LTC", "1");
        d.state = OrderState::Cancelled;
        d.updated = Utc::now() - Duration::milliseconds(5000);
        let id = d.id.clone();
        book.insert(d).await;

        assert!(book.flush_cancelled(Duration::milliseconds(10_000)).await.is_empty());
        let flushed = book.flush_cancelled(Duration::milliseconds(4000)).await;
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].id, id);
        assert!(book.flush_cancelled(Duration::milliseconds(0)).await.is_empty());
    }

    #[tokio::test]
    async fn my_orders_dedup_and_sorted() {
        let book = OrderBook::new();
        let mut a = pending("BLOCK", "1000", "LTC", "1");
        a.local = true;
        let mut b = pending("LTC", "5", "BLOCK", "4000");
        b.local = true;
        b.updated = a.updated - Duration::seconds(10);
        let mut c = pending("LTC", "7", "BLOCK", "4000");
        c.local = false;
        book.insert(a.clone()).await;
        book.insert(b.clone()).await;
        book.insert(c).await;

        let mine = book.my_orders().await;
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].id, b.id);
        assert_eq!(mine[1].id, a.id);
    }
}
