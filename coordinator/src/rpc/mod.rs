//! HTTP RPC surface
//!
//! A single JSON endpoint dispatches the `dx*` command set, with names and
//! result keys kept wire-compatible with the legacy protocol. Errors are
//! always `{error, code, name}` where `name` is the command that failed.

use std::str::FromStr;
use std::sync::Arc;

use axum::{extract::State, routing::get, routing::post, Json, Router};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::amount::{format_price, valid_precision, Amount};
use crate::config::{ApiConfig, Settings};
use crate::driver::SwapDriver;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::exchange::Exchange;
use crate::order::{
    aggregate_series, AggregateQuery, BookEntry, IntervalTimestamp, OrderBook, OrderDescr,
    OrderId, OrderState,
};
use crate::order::series::DEFAULT_INTERVAL_LIMIT;
use crate::trading::{BlockStore, TradeRow};
use crate::wallet::ConnectorRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub exchange: Arc<Exchange>,
    pub registry: Arc<ConnectorRegistry>,
    pub book: Arc<OrderBook>,
    pub driver: Arc<SwapDriver>,
    pub blocks: Arc<BlockStore>,
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Run the HTTP RPC server
pub async fn run_server(config: ApiConfig, state: AppState) -> CoordinatorResult<()> {
    let app = Router::new()
        .route("/", post(rpc_handler))
        .route("/health", get(health_check))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting RPC server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Unknown(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CoordinatorError::Unknown(e.to_string()))?;

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn rpc_handler(State(state): State<AppState>, Json(req): Json<RpcRequest>) -> Json<Value> {
    Json(dispatch(&state, &req.method, &req.params).await)
}

/// Route one command, folding errors into the wire envelope.
pub async fn dispatch(state: &AppState, method: &str, params: &[Value]) -> Value {
    let result = match method {
        "dxGetLocalTokens" => dx_get_local_tokens(state, params).await,
        "dxGetNetworkTokens" => dx_get_network_tokens(state, params).await,
        "dxGetNewTokenAddress" => dx_get_new_token_address(state, params).await,
        "dxLoadXBridgeConf" => dx_load_xbridge_conf(state, params).await,
        "dxGetOrders" => dx_get_orders(state, params).await,
        "dxGetOrder" => dx_get_order(state, params).await,
        "dxMakeOrder" => dx_make_order(state, params).await,
        "dxTakeOrder" => dx_take_order(state, params).await,
        "dxCancelOrder" => dx_cancel_order(state, params).await,
        "dxFlushCancelledOrders" => dx_flush_cancelled_orders(state, params).await,
        "dxGetOrderBook" => dx_get_order_book(state, params).await,
        "dxGetOrderHistory" => dx_get_order_history(state, params).await,
        "dxGetOrderFills" => dx_get_order_fills(state, params).await,
        "dxGetMyOrders" => dx_get_my_orders(state, params).await,
        "dxGetTokenBalances" => dx_get_token_balances(state, params).await,
        "dxGetLockedUtxos" => dx_get_locked_utxos(state, params).await,
        "gettradingdata" => get_trading_data(state, params).await,
        _ => Err(CoordinatorError::InvalidParameters(format!("unknown method {}", method))),
    };
    match result {
        Ok(value) => value,
        Err(e) => make_error(&e, method),
    }
}

/// Standard error envelope with a stable code.
fn make_error(err: &CoordinatorError, method: &str) -> Value {
    json!({
        "error": err.to_string(),
        "code": err.code(),
        "name": method,
    })
}

pub fn iso8601(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ----------------------------------------------------------------------
// parameter helpers

fn no_params(params: &[Value]) -> CoordinatorResult<()> {
    if params.is_empty() {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidParameters(
            "This function does not accept any parameters".to_string(),
        ))
    }
}

fn str_param(params: &[Value], idx: usize, usage: &str) -> CoordinatorResult<String> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CoordinatorError::InvalidParameters(usage.to_string()))
}

fn int_param(params: &[Value], idx: usize, usage: &str) -> CoordinatorResult<i64> {
    params
        .get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| CoordinatorError::InvalidParameters(usage.to_string()))
}

fn bool_param(params: &[Value], idx: usize, default: bool) -> CoordinatorResult<bool> {
    match params.get(idx) {
        None => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| CoordinatorError::InvalidParameters("expected a boolean".to_string())),
    }
}

fn order_id_param(params: &[Value], idx: usize, usage: &str) -> CoordinatorResult<OrderId> {
    OrderId::from_str(&str_param(params, idx, usage)?)
}

/// Explicit `dryrun` literal; a misspelling must not execute the order.
fn dryrun_param(params: &[Value], idx: usize) -> CoordinatorResult<bool> {
    match params.get(idx) {
        None => Ok(false),
        Some(v) => {
            let word = v.as_str().unwrap_or_default();
            if word == "dryrun" {
                Ok(true)
            } else {
                Err(CoordinatorError::InvalidParameters(word.to_string()))
            }
        }
    }
}

// ----------------------------------------------------------------------
// serialization helpers

fn order_json(descr: &OrderDescr) -> Value {
    json!({
        "id": descr.id.to_string(),
        "maker": descr.from_currency,
        "maker_size": descr.from_amount.to_decimal(),
        "taker": descr.to_currency,
        "taker_size": descr.to_amount.to_decimal(),
        "updated_at": iso8601(descr.updated),
        "created_at": iso8601(descr.created),
        "status": descr.state.as_str(),
    })
}

/// Ensure the wallet has enough unreserved value on `currency`.
async fn check_funds(state: &AppState, currency: &str, amount: Amount, address: &str)
    -> CoordinatorResult<()>
{
    let conn = state
        .registry
        .connector_by_currency(currency)
        .ok_or_else(|| CoordinatorError::NoSession(currency.to_string()))?;
    let excluded = state.exchange.all_locked_utxos();
    let available: f64 = conn
        .unspent(&excluded)
        .await?
        .iter()
        .map(|u| u.amount)
        .sum();
    if available < amount.as_f64() {
        return Err(CoordinatorError::InsufficientFunds(address.to_string()));
    }
    Ok(())
}

// ----------------------------------------------------------------------
// commands

async fn dx_get_local_tokens(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    no_params(params)?;
    Ok(json!(state.registry.available_currencies()))
}

async fn dx_get_network_tokens(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    no_params(params)?;
    Ok(json!(state.registry.network_currencies()))
}

async fn dx_get_new_token_address(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    if params.len() != 1 {
        return Err(CoordinatorError::InvalidParameters("(ticker)".to_string()));
    }
    let currency = str_param(params, 0, "(ticker)")?;
    let mut res: Vec<String> = Vec::new();
    if let Some(conn) = state.registry.connector_by_currency(&currency) {
        if let Ok(addr) = conn.new_token_address().await {
            if !addr.is_empty() {
                res.push(addr);
            }
        }
    }
    Ok(json!(res))
}

async fn dx_load_xbridge_conf(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    no_params(params)?;
    match Settings::load() {
        Ok(settings) => {
            state.exchange.reload_wallets(&settings).await;
            Ok(json!(true))
        }
        Err(_) => Ok(json!(false)),
    }
}

async fn dx_get_orders(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    no_params(params)?;
    let mut rows = Vec::new();
    for descr in state.book.list_orders().await {
        // skip orders whose chains we cannot serve
        if state.registry.connector_by_currency(&descr.from_currency).is_none()
            || state.registry.connector_by_currency(&descr.to_currency).is_none()
        {
            continue;
        }
        rows.push(order_json(&descr));
    }
    Ok(Value::Array(rows))
}

async fn dx_get_order(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    if params.len() != 1 {
        return Err(CoordinatorError::InvalidParameters("(id)".to_string()));
    }
    let id = order_id_param(params, 0, "(id)")?;
    let handle = state
        .book
        .get(&id)
        .await
        .ok_or_else(|| CoordinatorError::TransactionNotFound(id.to_string()))?;
    let descr = handle.lock().expect("order mutex poisoned").clone();

    if state.registry.connector_by_currency(&descr.from_currency).is_none() {
        return Err(CoordinatorError::NoSession(descr.from_currency));
    }
    if state.registry.connector_by_currency(&descr.to_currency).is_none() {
        return Err(CoordinatorError::NoSession(descr.to_currency));
    }
    Ok(order_json(&descr))
}

async fn dx_make_order(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    const USAGE: &str = "(maker) (maker size) (maker address) (taker) (taker size) \
                         (taker address) (type) (dryrun)[optional]";
    if params.len() < 7 || params.len() > 8 {
        return Err(CoordinatorError::InvalidParameters(USAGE.to_string()));
    }

    let maker_size = str_param(params, 1, USAGE)?;
    if !valid_precision(&maker_size) {
        return Err(CoordinatorError::InvalidParameters(
            "maker size is too precise, maximum precision supported is 8 digits".to_string(),
        ));
    }
    let taker_size = str_param(params, 4, USAGE)?;
    if !valid_precision(&taker_size) {
        return Err(CoordinatorError::InvalidParameters(
            "taker size is too precise, maximum precision supported is 8 digits".to_string(),
        ));
    }

    let from_currency = str_param(params, 0, USAGE)?;
    let from_amount = Amount::from_decimal(&maker_size)?;
    let from_address = str_param(params, 2, USAGE)?;
    let to_currency = str_param(params, 3, USAGE)?;
    let to_amount = Amount::from_decimal(&taker_size)?;
    let to_address = str_param(params, 5, USAGE)?;
    let order_type = str_param(params, 6, USAGE)?;

    if order_type != "exact" {
        return Err(CoordinatorError::InvalidParameters(
            "Only the exact type is supported at this time.".to_string(),
        ));
    }
    if from_address == to_address {
        return Err(CoordinatorError::InvalidParameters(format!(
            "maker address and taker address cannot be the same: {}",
            from_address
        )));
    }
    if !from_amount.within_bounds() || !to_amount.within_bounds() {
        return Err(CoordinatorError::InvalidParameters(
            "order size is outside the supported range".to_string(),
        ));
    }

    let conn_from = state
        .registry
        .connector_by_currency(&from_currency)
        .ok_or_else(|| CoordinatorError::NoSession(from_currency.clone()))?;
    let conn_to = state
        .registry
        .connector_by_currency(&to_currency)
        .ok_or_else(|| CoordinatorError::NoSession(to_currency.clone()))?;
    if !conn_from.is_valid_address(&from_address) {
        return Err(CoordinatorError::InvalidAddress(from_address));
    }
    if !conn_to.is_valid_address(&to_address) {
        return Err(CoordinatorError::InvalidAddress(to_address));
    }

    let dryrun = dryrun_param(params, 7)?;

    check_funds(state, &from_currency, from_amount, &from_address).await?;

    if dryrun {
        return Ok(json!({
            "id": OrderId::ZERO.to_string(),
            "maker": from_currency,
            "maker_size": from_amount.to_decimal(),
            "maker_address": from_address,
            "taker": to_currency,
            "taker_size": to_amount.to_decimal(),
            "taker_address": to_address,
            "status": "created",
        }));
    }

    let descr = state
        .driver
        .send_order(
            &from_currency,
            from_amount,
            &from_address,
            &to_currency,
            to_amount,
            &to_address,
        )
        .await?;

    Ok(json!({
        "id": descr.id.to_string(),
        "maker_address": descr.from_address,
        "maker": descr.from_currency,
        "maker_size": descr.from_amount.to_decimal(),
        "taker_address": descr.to_address,
        "taker": descr.to_currency,
        "taker_size": descr.to_amount.to_decimal(),
        "created_at": iso8601(descr.created),
        "updated_at": iso8601(descr.updated),
        "block_id": descr.block_hash,
        "status": "created",
    }))
}

async fn dx_take_order(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    const USAGE: &str = "(id) (address from) (address to) [optional](dryrun)";
    if params.len() != 3 && params.len() != 4 {
        return Err(CoordinatorError::InvalidParameters(USAGE.to_string()));
    }

    let id = order_id_param(params, 0, USAGE)?;
    let from_address = str_param(params, 1, USAGE)?;
    let to_address = str_param(params, 2, USAGE)?;

    if from_address == to_address {
        return Err(CoordinatorError::InvalidParameters(format!(
            "address from and address to cannot be the same: {}",
            from_address
        )));
    }
    let dryrun = dryrun_param(params, 3)?;

    let handle = state
        .book
        .get(&id)
        .await
        .ok_or_else(|| CoordinatorError::TransactionNotFound(id.to_string()))?;
    let descr = handle.lock().expect("order mutex poisoned").clone();
    let view = descr.taker_view();

    check_funds(state, &view.from_currency, view.from_amount, &from_address).await?;

    if descr.local {
        return Err(CoordinatorError::InvalidParameters(
            "unable to accept your own order".to_string(),
        ));
    }

    // the taker receives the order's `from` leg and funds its `to` leg
    let conn_to = state
        .registry
        .connector_by_currency(&descr.from_currency)
        .ok_or_else(|| CoordinatorError::NoSession(descr.from_currency.clone()))?;
    let conn_from = state
        .registry
        .connector_by_currency(&descr.to_currency)
        .ok_or_else(|| CoordinatorError::NoSession(descr.to_currency.clone()))?;
    if !conn_to.is_valid_address(&to_address) {
        return Err(CoordinatorError::InvalidAddress(format!(
            ": {} address is bad, are you using the correct address?",
            descr.from_currency
        )));
    }
    if !conn_from.is_valid_address(&from_address) {
        return Err(CoordinatorError::InvalidAddress(format!(
            ": {} address is bad, are you using the correct address?",
            descr.to_currency
        )));
    }

    if dryrun {
        return Ok(json!({
            "id": OrderId::ZERO.to_string(),
            "maker": descr.from_currency,
            "maker_size": descr.from_amount.to_decimal(),
            "taker": descr.to_currency,
            "taker_size": descr.to_amount.to_decimal(),
            "updated_at": iso8601(Utc::now()),
            "created_at": iso8601(descr.created),
            "status": "filled",
        }));
    }

    let updated = state.driver.accept_order(&id, &from_address, &to_address).await?;

    Ok(json!({
        "id": id.to_string(),
        "maker": view.from_currency,
        "maker_size": view.from_amount.to_decimal(),
        "taker": view.to_currency,
        "taker_size": view.to_amount.to_decimal(),
        "updated_at": iso8601(updated.updated),
        "created_at": iso8601(updated.created),
        "status": updated.state.as_str(),
    }))
}

async fn dx_cancel_order(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    if params.len() != 1 {
        return Err(CoordinatorError::InvalidParameters("(id)".to_string()));
    }
    let id = order_id_param(params, 0, "(id)")?;
    info!(order = %id, "rpc cancel order");

    let handle = state
        .book
        .get(&id)
        .await
        .ok_or_else(|| CoordinatorError::TransactionNotFound(id.to_string()))?;
    {
        let descr = handle.lock().expect("order mutex poisoned");
        if descr.state >= OrderState::Created {
            return Err(CoordinatorError::InvalidState(format!(
                "order is already {}",
                descr.state.as_str()
            )));
        }
    }

    let descr = state.driver.cancel_order(&id).await?;

    if state.registry.connector_by_currency(&descr.from_currency).is_none() {
        return Err(CoordinatorError::NoSession(descr.from_currency));
    }
    if state.registry.connector_by_currency(&descr.to_currency).is_none() {
        return Err(CoordinatorError::NoSession(descr.to_currency));
    }

    Ok(json!({
        "id": descr.id.to_string(),
        "maker": descr.from_currency,
        "maker_size": descr.from_amount.to_decimal(),
        "maker_address": descr.from_address,
        "taker": descr.to_currency,
        "taker_size": descr.to_amount.to_decimal(),
        "taker_address": descr.to_address,
        "refund_tx": descr.refund_tx.unwrap_or_default(),
        "updated_at": iso8601(descr.updated),
        "created_at": iso8601(descr.created),
        "status": descr.state.as_str(),
    }))
}

async fn dx_flush_cancelled_orders(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    if params.len() > 1 {
        return Err(CoordinatorError::InvalidParameters("(ageMillis)".to_string()));
    }
    let age_millis = if params.is_empty() { 0 } else { int_param(params, 0, "(ageMillis)")? };
    if age_millis < 0 {
        return Err(CoordinatorError::InvalidParameters("(ageMillis)".to_string()));
    }

    let now = Utc::now();
    let flushed = state.book.flush_cancelled(Duration::milliseconds(age_millis)).await;
    let micros = (Utc::now() - now).num_microseconds().unwrap_or(0);

    let rows: Vec<Value> = flushed
        .iter()
        .map(|f| {
            json!({
                "id": f.id.to_string(),
                "txtime": iso8601(f.txtime),
                "use_count": f.use_count,
            })
        })
        .collect();

    Ok(json!({
        "ageMillis": age_millis,
        "now": iso8601(now),
        "durationMicrosec": micros,
        "flushedOrders": rows,
    }))
}

async fn dx_get_order_book(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    const USAGE: &str = "(detail level, 1-4) (maker) (taker) (max orders, default=50)[optional]";
    if params.len() < 3 || params.len() > 4 {
        return Err(CoordinatorError::InvalidParameters(USAGE.to_string()));
    }
    let detail = int_param(params, 0, USAGE)?;
    let maker = str_param(params, 1, USAGE)?;
    let taker = str_param(params, 2, USAGE)?;
    let max_orders = if params.len() == 4 { int_param(params, 3, USAGE)?.max(1) as usize } else { 50 };

    if !(1..=4).contains(&detail) {
        return Err(CoordinatorError::InvalidDetailLevel);
    }

    let view = state.book.order_book(detail as u32, &maker, &taker, max_orders).await;

    let render = |entries: &[BookEntry]| -> Value {
        let mut rows = Vec::new();
        for entry in entries {
            match entry {
                BookEntry::Level { price, size, count } => rows.push(json!([
                    format_price(*price),
                    size.to_decimal(),
                    count,
                ])),
                BookEntry::PerOrder { price, size, id } => rows.push(json!([
                    format_price(*price),
                    size.to_decimal(),
                    id.to_string(),
                ])),
                // level 4 flattens the single best row into the side array
                BookEntry::BestWithIds { price, size, ids } => {
                    rows.push(json!(format_price(*price)));
                    rows.push(json!(size.to_decimal()));
                    rows.push(json!(ids.iter().map(|i| i.to_string()).collect::<Vec<_>>()));
                }
            }
        }
        Value::Array(rows)
    };

    Ok(json!({
        "detail": detail,
        "maker": view.maker,
        "taker": view.taker,
        "asks": render(&view.asks),
        "bids": render(&view.bids),
    }))
}

async fn dx_get_order_history(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    const USAGE: &str = "(maker) (taker) (start time) (end time) (granularity) \
                         (order_ids, default=false)[optional] \
                         (with_inverse, default=false)[optional] \
                         (limit)[optional] \
                         (interval_timestamp, one of [at_start | at_end])[optional]";
    if params.len() < 5 || params.len() > 9 {
        return Err(CoordinatorError::InvalidParameters(USAGE.to_string()));
    }

    let query = AggregateQuery {
        maker: str_param(params, 0, USAGE)?,
        taker: str_param(params, 1, USAGE)?,
        granularity: int_param(params, 4, USAGE)?,
        start: int_param(params, 2, USAGE)?,
        end: int_param(params, 3, USAGE)?,
        with_order_ids: bool_param(params, 5, false)?,
        with_inverse: bool_param(params, 6, false)?,
        limit: match params.get(7) {
            None => DEFAULT_INTERVAL_LIMIT,
            Some(v) => v
                .as_u64()
                .ok_or_else(|| CoordinatorError::InvalidParameters(USAGE.to_string()))?
                as usize,
        },
        interval_timestamp: match params.get(8) {
            None => IntervalTimestamp::AtStart,
            Some(v) => IntervalTimestamp::parse(v.as_str().unwrap_or_default())?,
        },
    };

    let orders = state.book.finished_orders().await;
    let buckets = aggregate_series(&orders, &query)?;

    let rows: Vec<Value> = buckets
        .iter()
        .map(|b| {
            let time = DateTime::<Utc>::from_timestamp(query.report_time(b.time_end), 0)
                .map(iso8601)
                .unwrap_or_default();
            let mut row = vec![
                json!(time),
                json!(b.low),
                json!(b.high),
                json!(b.open),
                json!(b.close),
                json!(b.from_volume.as_f64()),
            ];
            if query.with_order_ids {
                row.push(json!(b.order_ids.iter().map(|i| i.to_string()).collect::<Vec<_>>()));
            }
            Value::Array(row)
        })
        .collect();
    Ok(Value::Array(rows))
}

async fn dx_get_order_fills(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    const USAGE: &str = "(maker) (taker) (combined, default=true)[optional]";
    if params.len() != 2 && params.len() != 3 {
        return Err(CoordinatorError::InvalidParameters(USAGE.to_string()));
    }
    let maker = str_param(params, 0, USAGE)?;
    let taker = str_param(params, 1, USAGE)?;
    let combined = bool_param(params, 2, true)?;

    let rows: Vec<Value> = state
        .book
        .fills(&maker, &taker, combined)
        .await
        .iter()
        .map(|d| {
            json!({
                "id": d.id.to_string(),
                "time": iso8601(d.updated),
                "maker": d.from_currency,
                "maker_size": d.from_amount.to_decimal(),
                "taker": d.to_currency,
                "taker_size": d.to_amount.to_decimal(),
            })
        })
        .collect();
    Ok(Value::Array(rows))
}

async fn dx_get_my_orders(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    no_params(params)?;
    let rows: Vec<Value> = state
        .book
        .my_orders()
        .await
        .iter()
        .map(|d| {
            json!({
                "id": d.id.to_string(),
                "maker": d.from_currency,
                "maker_size": d.from_amount.to_decimal(),
                "maker_address": d.from_address,
                "taker": d.to_currency,
                "taker_size": d.to_amount.to_decimal(),
                "taker_address": d.to_address,
                "updated_at": iso8601(d.updated),
                "created_at": iso8601(d.created),
                "status": d.state.as_str(),
            })
        })
        .collect();
    Ok(Value::Array(rows))
}

async fn dx_get_token_balances(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    no_params(params)?;
    let excluded = state.exchange.all_locked_utxos();
    let mut balances = serde_json::Map::new();
    for conn in state.registry.all() {
        // skip wallets that are not reachable right now
        match conn.wallet_balance(&excluded).await {
            Ok(balance) if balance >= 0.0 => {
                balances.insert(conn.currency().to_string(), json!(format_price(balance)));
            }
            _ => {}
        }
    }
    Ok(Value::Object(balances))
}

async fn dx_get_locked_utxos(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    if params.len() > 1 {
        return Err(CoordinatorError::InvalidParameters(
            "required transaction id or empty param".to_string(),
        ));
    }
    if !state.exchange.is_started().await {
        return Err(CoordinatorError::NotExchangeNode);
    }

    let id = if params.is_empty() {
        OrderId::ZERO
    } else {
        order_id_param(params, 0, "(id)")?
    };

    let items = state
        .exchange
        .utxo_items(&id)
        .ok_or_else(|| CoordinatorError::TransactionNotFound(id.to_string()))?;
    let utxos: Vec<String> = items.iter().map(|e| e.to_string()).collect();

    if id.is_zero() {
        return Ok(json!({ "all_locked_utxo": utxos }));
    }

    if let Some(handle) = state.exchange.pending_transaction(&id).await {
        let key = handle.lock().expect("order mutex poisoned").from_currency.clone();
        let mut obj = serde_json::Map::new();
        obj.insert("id".to_string(), json!(id.to_string()));
        obj.insert(key, json!(utxos));
        return Ok(Value::Object(obj));
    }
    if let Some(handle) = state.exchange.transaction(&id).await {
        let key = {
            let order = handle.lock().expect("order mutex poisoned");
            format!("{}_and_{}", order.from_currency, order.to_currency)
        };
        let mut obj = serde_json::Map::new();
        obj.insert("id".to_string(), json!(id.to_string()));
        obj.insert(key, json!(utxos));
        return Ok(Value::Object(obj));
    }
    Err(CoordinatorError::TransactionNotFound(id.to_string()))
}

async fn get_trading_data(state: &AppState, params: &[Value]) -> CoordinatorResult<Value> {
    if params.len() > 2 {
        return Err(CoordinatorError::InvalidParameters(
            "(blocks)[optional] (errors)[optional]".to_string(),
        ));
    }
    let max_blocks = match params.first() {
        None => u32::MAX,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| CoordinatorError::InvalidParameters("blocks must be a number".into()))?
            .min(u32::MAX as u64) as u32,
    };
    let show_errors = bool_param(params, 1, false)?;

    let rows: Vec<Value> = state
        .blocks
        .trading_data(max_blocks, show_errors)
        .await
        .into_iter()
        .map(|row| match row {
            TradeRow::Valid {
                timestamp,
                txid,
                snode_pubkey,
                xid,
                from_currency,
                from_amount,
                to_currency,
                to_amount,
            } => json!({
                "timestamp": timestamp,
                "txid": txid,
                "to": snode_pubkey,
                "xid": xid,
                "from": from_currency,
                "fromAmount": from_amount,
                "to_currency": to_currency,
                "toAmount": to_amount,
            }),
            TradeRow::Error { timestamp, txid, reason } => json!({
                "timestamp": timestamp,
                "txid": txid,
                "xid": reason,
            }),
        })
        .collect();
    Ok(Value::Array(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Role;
    use crate::protocol::SwapMessage;
    use crate::wallet::mock::MockConnector;
    use std::collections::HashMap;
    use tokio::sync::broadcast;

    fn settings() -> Settings {
        let mut wallets = HashMap::new();
        for c in ["LTC", "BLOCK"] {
            wallets.insert(
                c.to_string(),
                crate::config::WalletSection {
                    title: c.to_string(),
                    address: String::new(),
                    ip: "127.0.0.1".into(),
                    port: "1".into(),
                    username: "u".into(),
                    password: "p".into(),
                    minimum_amount: 0,
                    tx_version: 1,
                    json_version: String::new(),
                    required_confirmations: 1,
                    block_time_secs: 60,
                },
            );
        }
        Settings {
            coordinator: crate::config::CoordinatorConfig {
                enable_exchange: true,
                order_inputs_check_interval_secs: 900,
                poll_interval_ms: 1000,
                sweep_interval_secs: 30,
                max_retries: 2,
                retry_delay_ms: 1,
            },
            api: ApiConfig { host: "127.0.0.1".into(), port: 0 },
            metrics: crate::config::MetricsConfig { enabled: false, port: 0 },
            wallets,
        }
    }

    fn test_state() -> (AppState, broadcast::Receiver<SwapMessage>) {
        let settings = settings();
        let ltc = Arc::new(MockConnector::new("LTC"));
        let block = Arc::new(MockConnector::new("BLOCK"));
        ltc.fund("ltc-utxo-1", 0, 30.0, "maker-ltc-address");
        block.fund("block-utxo-1", 0, 1200.0, "taker-block-address");

        let registry = Arc::new(ConnectorRegistry::new());
        registry.add(ltc);
        registry.add(block);
        let exchange = Arc::new(Exchange::new(&settings));
        let book = Arc::new(OrderBook::new());
        let (net_tx, rx) = broadcast::channel(256);
        let driver = Arc::new(SwapDriver::new(
            exchange.clone(),
            registry.clone(),
            book.clone(),
            net_tx,
            settings.coordinator,
        ));
        (
            AppState {
                exchange,
                registry,
                book,
                driver,
                blocks: Arc::new(BlockStore::new()),
            },
            rx,
        )
    }

    async fn pump(state: &AppState, rx: &mut broadcast::Receiver<SwapMessage>) {
        while let Ok(msg) = rx.try_recv() {
            state.driver.handle_message(msg).await.unwrap();
        }
    }

    async fn make_order(state: &AppState) -> String {
        let res = dispatch(
            state,
            "dxMakeOrder",
            &[
                json!("LTC"),
                json!("25"),
                json!("maker-ltc-address"),
                json!("BLOCK"),
                json!("1000"),
                json!("maker-block-address"),
                json!("exact"),
            ],
        )
        .await;
        assert_eq!(res["status"], "created", "make failed: {}", res);
        res["id"].as_str().unwrap().to_string()
    }

    fn foreign_pending(from: &str, from_amt: &str, to: &str, to_amt: &str) -> OrderDescr {
        let mut d = OrderDescr::new_maker(
            from,
            Amount::from_decimal(from_amt).unwrap(),
            &format!("{}-foreign-{}", from, from_amt),
            to,
            Amount::from_decimal(to_amt).unwrap(),
            &format!("{}-foreign-{}", to, to_amt),
            100,
            "00",
        );
        d.local = false;
        d.role = Role::Maker;
        d.state = OrderState::Pending;
        d
    }

    #[tokio::test]
    async fn make_then_cancel_releases_everything() {
        let (state, mut rx) = test_state();
        let id = make_order(&state).await;
        assert_eq!(id.len(), 64);
        pump(&state, &mut rx).await;

        // reservation is visible while the order is pending
        let locked = dispatch(&state, "dxGetLockedUtxos", &[json!(id)]).await;
        assert!(locked["LTC"].is_array(), "{}", locked);

        let cancelled = dispatch(&state, "dxCancelOrder", &[json!(id)]).await;
        assert_eq!(cancelled["status"], "cancelled");
        assert!(cancelled.get("refund_tx").is_some());

        let locked = dispatch(&state, "dxGetLockedUtxos", &[json!(id)]).await;
        assert_eq!(locked["code"], 1005);

        // cancel of a cancelled order reports the state
        let again = dispatch(&state, "dxCancelOrder", &[json!(id)]).await;
        assert_eq!(again["code"], 1012);
    }

    #[tokio::test]
    async fn take_dryrun_leaves_order_untouched() {
        let (state, _rx) = test_state();
        let descr = foreign_pending("LTC", "25", "BLOCK", "1000");
        let id = descr.id.to_string();
        state.book.insert(descr).await;

        let res = dispatch(
            &state,
            "dxTakeOrder",
            &[
                json!(id),
                json!("taker-block-address"),
                json!("taker-ltc-address"),
                json!("dryrun"),
            ],
        )
        .await;
        assert_eq!(res["status"], "filled");
        assert_eq!(res["id"], OrderId::ZERO.to_string());

        let order = dispatch(&state, "dxGetOrder", &[json!(id)]).await;
        assert_eq!(order["status"], "pending");
    }

    #[tokio::test]
    async fn misspelled_dryrun_does_not_execute() {
        let (state, _rx) = test_state();
        let descr = foreign_pending("LTC", "25", "BLOCK", "1000");
        let id = descr.id.to_string();
        state.book.insert(descr).await;

        let res = dispatch(
            &state,
            "dxTakeOrder",
            &[
                json!(id),
                json!("taker-block-address"),
                json!("taker-ltc-address"),
                json!("dryrnu"),
            ],
        )
        .await;
        assert_eq!(res["code"], 1009);
        let order = dispatch(&state, "dxGetOrder", &[json!(id)]).await;
        assert_eq!(order["status"], "pending");
    }

    #[tokio::test]
    async fn own_order_cannot_be_taken() {
        let (state, mut rx) = test_state();
        let id = make_order(&state).await;
        pump(&state, &mut rx).await;

        let res = dispatch(
            &state,
            "dxTakeOrder",
            &[json!(id), json!("taker-block-address"), json!("taker-ltc-address")],
        )
        .await;
        assert_eq!(res["code"], 1009);
        assert_eq!(res["error"], "invalid parameters: unable to accept your own order");
    }

    #[tokio::test]
    async fn order_book_level_one() {
        let (state, _rx) = test_state();
        // asks at 0.0010 (x2) and 0.0012, one bid at 0.0009
        state.book.insert(foreign_pending("BLOCK", "1000", "LTC", "1")).await;
        state.book.insert(foreign_pending("BLOCK", "2000", "LTC", "2")).await;
        state.book.insert(foreign_pending("BLOCK", "1000", "LTC", "1.2")).await;
        state.book.insert(foreign_pending("LTC", "0.9", "BLOCK", "1000")).await;

        let res = dispatch(
            &state,
            "dxGetOrderBook",
            &[json!(1), json!("BLOCK"), json!("LTC")],
        )
        .await;
        assert_eq!(res["detail"], 1);
        let asks = res["asks"].as_array().unwrap();
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0][0], "0.00100000");
        assert_eq!(asks[0][2], 2);
        let bids = res["bids"].as_array().unwrap();
        assert_eq!(bids[0][0], "0.00090000");
        assert_eq!(bids[0][1], "1000");
        assert_eq!(bids[0][2], 1);
    }

    #[tokio::test]
    async fn order_book_rejects_bad_level() {
        let (state, _rx) = test_state();
        let res = dispatch(
            &state,
            "dxGetOrderBook",
            &[json!(5), json!("BLOCK"), json!("LTC")],
        )
        .await;
        assert_eq!(res["code"], 1016);
    }

    #[tokio::test]
    async fn order_history_buckets() {
        let (state, _rx) = test_state();
        for (t, to_amt) in [(1000i64, "20"), (1250, "30")] {
            let mut d = foreign_pending("BLOCK", "10", "LTC", to_amt);
            d.state = OrderState::Finished;
            d.updated = chrono::TimeZone::timestamp_opt(&Utc, t, 0).unwrap();
            let id = d.id.clone();
            state.book.insert(d).await;
            state.book.move_to_history(&id).await;
        }

        let res = dispatch(
            &state,
            "dxGetOrderHistory",
            &[json!("BLOCK"), json!("LTC"), json!(900), json!(1500), json!(300)],
        )
        .await;
        let rows = res.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        // [time, low, high, open, close, volume]
        assert_eq!(rows[0][3], 2.0);
        assert_eq!(rows[1][3], 3.0);

        let res = dispatch(
            &state,
            "dxGetOrderHistory",
            &[json!("BLOCK"), json!("LTC"), json!(900), json!(1500), json!(120)],
        )
        .await;
        assert_eq!(res["code"], 1009);
    }

    #[tokio::test]
    async fn flush_cancelled_is_one_shot() {
        let (state, mut rx) = test_state();
        let id = make_order(&state).await;
        pump(&state, &mut rx).await;
        dispatch(&state, "dxCancelOrder", &[json!(id)]).await;

        // too fresh to flush
        let res = dispatch(&state, "dxFlushCancelledOrders", &[json!(4000)]).await;
        assert!(res["flushedOrders"].as_array().unwrap().is_empty());

        // age the cancelled order past the threshold
        {
            let oid = id.parse::<OrderId>().unwrap();
            let handle = state.book.get(&oid).await.unwrap();
            handle.lock().unwrap().updated = Utc::now() - Duration::milliseconds(5000);
        }
        let res = dispatch(&state, "dxFlushCancelledOrders", &[json!(4000)]).await;
        let flushed = res["flushedOrders"].as_array().unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0]["id"], id);

        let res = dispatch(&state, "dxFlushCancelledOrders", &[json!(4000)]).await;
        assert!(res["flushedOrders"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn make_order_boundary_errors() {
        let (state, _rx) = test_state();

        // too precise
        let res = dispatch(
            &state,
            "dxMakeOrder",
            &[
                json!("LTC"),
                json!("0.000000001"),
                json!("maker-ltc-address"),
                json!("BLOCK"),
                json!("1000"),
                json!("maker-block-address"),
                json!("exact"),
            ],
        )
        .await;
        assert_eq!(res["code"], 1009);

        // same address on both legs
        let res = dispatch(
            &state,
            "dxMakeOrder",
            &[
                json!("LTC"),
                json!("25"),
                json!("maker-ltc-address"),
                json!("BLOCK"),
                json!("1000"),
                json!("maker-ltc-address"),
                json!("exact"),
            ],
        )
        .await;
        assert_eq!(res["code"], 1009);

        // above the maximum size
        let res = dispatch(
            &state,
            "dxMakeOrder",
            &[
                json!("LTC"),
                json!("100000001"),
                json!("maker-ltc-address"),
                json!("BLOCK"),
                json!("1000"),
                json!("maker-block-address"),
                json!("exact"),
            ],
        )
        .await;
        assert_eq!(res["code"], 1009);

        // unknown wallet
        let res = dispatch(
            &state,
            "dxMakeOrder",
            &[
                json!("DOGE"),
                json!("25"),
                json!("maker-doge-address"),
                json!("BLOCK"),
                json!("1000"),
                json!("maker-block-address"),
                json!("exact"),
            ],
        )
        .await;
        assert_eq!(res["code"], 1002);
    }

    #[tokio::test]
    async fn balances_exclude_reserved_utxos() {
        let (state, mut rx) = test_state();
        let before = dispatch(&state, "dxGetTokenBalances", &[]).await;
        assert_eq!(before["LTC"], "30.00000000");

        make_order(&state).await;
        pump(&state, &mut rx).await;
        let after = dispatch(&state, "dxGetTokenBalances", &[]).await;
        assert_eq!(after["LTC"], "0.00000000");
    }

    #[tokio::test]
    async fn my_orders_lists_local_only() {
        let (state, mut rx) = test_state();
        let id = make_order(&state).await;
        pump(&state, &mut rx).await;
        state.book.insert(foreign_pending("BLOCK", "1000", "LTC", "1")).await;

        let res = dispatch(&state, "dxGetMyOrders", &[]).await;
        let rows = res.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], id);
        assert_eq!(rows[0]["maker_address"], "maker-ltc-address");
    }

    #[tokio::test]
    async fn local_tokens_and_rejected_params() {
        let (state, _rx) = test_state();
        let res = dispatch(&state, "dxGetLocalTokens", &[]).await;
        assert_eq!(res, json!(["BLOCK", "LTC"]));

        let res = dispatch(&state, "dxGetLocalTokens", &[json!("x")]).await;
        assert_eq!(res["code"], 1009);
        assert_eq!(res["name"], "dxGetLocalTokens");
    }

    #[tokio::test]
    async fn locked_utxos_requires_exchange_role() {
        let mut settings = settings();
        settings.coordinator.enable_exchange = false;
        let (state, _rx) = test_state();
        let plain = AppState {
            exchange: Arc::new(Exchange::new(&settings)),
            ..state
        };
        let res = dispatch(&plain, "dxGetLockedUtxos", &[]).await;
        assert_eq!(res["code"], 1013);
    }

    #[tokio::test]
    async fn fills_after_completion() {
        let (state, _rx) = test_state();
        let mut d = foreign_pending("BLOCK", "10", "LTC", "20");
        d.state = OrderState::Finished;
        let id = d.id.clone();
        state.book.insert(d).await;
        state.book.move_to_history(&id).await;

        let res = dispatch(&state, "dxGetOrderFills", &[json!("BLOCK"), json!("LTC")]).await;
        assert_eq!(res.as_array().unwrap().len(), 1);
        let res = dispatch(&state, "dxGetOrderFills", &[json!("LTC"), json!("BLOCK")]).await;
        assert_eq!(res.as_array().unwrap().len(), 1);
        let res = dispatch(
            &state,
            "dxGetOrderFills",
            &[json!("LTC"), json!("BLOCK"), json!(false)],
        )
        .await;
        assert!(res.as_array().unwrap().is_empty());
    }
}
