//! OHLCV aggregation over the completed-order stream

use serde::Deserialize;

use crate::amount::{ask_price, Amount};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::order::descr::{OrderDescr, OrderId, OrderState};

/// Interval lengths the aggregator accepts, in seconds.
pub const SUPPORTED_GRANULARITIES: [i64; 6] = [60, 300, 900, 3600, 21_600, 86_400];

/// Default number of intervals returned.
pub const DEFAULT_INTERVAL_LIMIT: usize = 60;

/// Upper bound on intervals per query.
pub const MAX_INTERVAL_LIMIT: usize = 4320;

/// Where within the interval the reported timestamp sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalTimestamp {
    #[default]
    AtStart,
    AtEnd,
}

impl IntervalTimestamp {
    pub fn parse(s: &str) -> CoordinatorResult<IntervalTimestamp> {
        match s {
            "at_start" => Ok(IntervalTimestamp::AtStart),
            "at_end" => Ok(IntervalTimestamp::AtEnd),
            other => Err(CoordinatorError::InvalidParameters(format!(
                "interval_timestamp must be one of [at_start | at_end], got {}",
                other
            ))),
        }
    }
}

/// Parameters of one history query.
#[derive(Debug, Clone)]
pub struct AggregateQuery {
    pub maker: String,
    pub taker: String,
    pub granularity: i64,
    pub start: i64,
    pub end: i64,
    pub with_order_ids: bool,
    pub with_inverse: bool,
    pub limit: usize,
    pub interval_timestamp: IntervalTimestamp,
}

impl AggregateQuery {
    pub fn validate(&self) -> CoordinatorResult<()> {
        if !SUPPORTED_GRANULARITIES.contains(&self.granularity) {
            return Err(CoordinatorError::InvalidParameters(format!(
                "unsupported granularity {}, supported: {}",
                self.granularity,
                supported_seconds_csv()
            )));
        }
        if self.start >= self.end {
            return Err(CoordinatorError::InvalidParameters(
                "start time must precede end time".to_string(),
            ));
        }
        if self.limit == 0 || self.limit > MAX_INTERVAL_LIMIT {
            return Err(CoordinatorError::InvalidParameters(format!(
                "limit must be within [1, {}]",
                MAX_INTERVAL_LIMIT
            )));
        }
        Ok(())
    }

    /// Timestamp reported for a bucket ending at `time_end`.
    pub fn report_time(&self, time_end: i64) -> i64 {
        match self.interval_timestamp {
            IntervalTimestamp::AtStart => time_end - self.granularity,
            IntervalTimestamp::AtEnd => time_end,
        }
    }
}

pub fn supported_seconds_csv() -> String {
    SUPPORTED_GRANULARITIES
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One open-high-low-close-volume bucket.
#[derive(Debug, Clone)]
pub struct OhlcBucket {
    pub time_end: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub from_volume: Amount,
    pub to_volume: Amount,
    pub order_ids: Vec<OrderId>,
}

/// Aggregate a time-sorted stream of finished orders into OHLCV buckets.
///
/// Orders land in bucket `⌊(t − start) / granularity⌋` for `start <= t < end`.
/// Inverse-pair orders contribute with inverted price and swapped volumes when
/// the query folds them in. Empty buckets are omitted.
pub fn aggregate_series(
    orders: &[OrderDescr],
    query: &AggregateQuery,
) -> CoordinatorResult<Vec<OhlcBucket>> {
    query.validate()?;

    let mut buckets: Vec<OhlcBucket> = Vec::new();
    for descr in orders {
        if descr.state != OrderState::Finished {
            continue;
        }
        let t = descr.updated.timestamp();
        if t < query.start || t >= query.end {
            continue;
        }

        let direct = descr.from_currency == query.maker && descr.to_currency == query.taker;
        let inverse = descr.from_currency == query.taker && descr.to_currency == query.maker;
        if !direct && !(query.with_inverse && inverse) {
            continue;
        }

        let (price, from_volume, to_volume) = if direct {
            (ask_price(descr.from_amount, descr.to_amount), descr.from_amount, descr.to_amount)
        } else {
            (ask_price(descr.to_amount, descr.from_amount), descr.to_amount, descr.from_amount)
        };

        let idx = (t - query.start) / query.granularity;
        let time_end = query.start + (idx + 1) * query.granularity;

        match buckets.last_mut() {
            Some(bucket) if bucket.time_end == time_end => {
                bucket.high = bucket.high.max(price);
                bucket.low = bucket.low.min(price);
                bucket.close = price;
                bucket.from_volume = Amount(bucket.from_volume.as_units() + from_volume.as_units());
                bucket.to_volume = Amount(bucket.to_volume.as_units() + to_volume.as_units());
                if query.with_order_ids {
                    bucket.order_ids.push(descr.id.clone());
                }
            }
            _ => {
                if buckets.len() == query.limit {
                    break;
                }
                buckets.push(OhlcBucket {
                    time_end,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    from_volume,
                    to_volume,
                    order_ids: if query.with_order_ids {
                        vec![descr.id.clone()]
                    } else {
                        Vec::new()
                    },
                });
            }
        }
    }

    Ok(buckets)
}
