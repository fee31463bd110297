// ===============================
// src/domain.rs
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : domain.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> Decimal { match self { Side::Buy => Decimal::ONE, Side::Sell => Decimal::NEGATIVE_ONE } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType { Market, Limit }
impl OrderType {
    pub fn as_str(&self) -> &'static str { match self { OrderType::Market => "market", OrderType::Limit => "limit" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce { Gtc, Ioc, Day }

/// What a strategy wants to happen. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub client_order_id: Option<String>,
}

impl OrderIntent {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            time_in_force: TimeInForce::Gtc,
            client_order_id: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self { order_type: OrderType::Limit, limit_price: Some(price), ..Self::market(symbol, side, quantity) }
    }

    pub fn with_tif(self, time_in_force: TimeInForce) -> Self { Self { time_in_force, ..self } }

    pub fn with_client_id(self, id: impl Into<String>) -> Self { Self { client_order_id: Some(id.into()), ..self } }

    /// Positive for buys, negative for sells.
    pub fn signed_quantity(&self) -> Decimal { self.side.sign() * self.quantity }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { New, Submitted, PartiallyFilled, Filled, Canceled, Rejected, Expired }

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired)
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub intent: OrderIntent,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Decimal,
    pub reject_reason: Option<String>,
}

impl Order {
    pub fn remaining(&self) -> Decimal { self.intent.quantity - self.filled_qty }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liquidity { Maker, Taker }

impl Liquidity {
    pub fn as_str(&self) -> &'static str { match self { Liquidity::Maker => "maker", Liquidity::Taker => "taker" } }
}

impl FromStr for Liquidity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "maker" => Ok(Liquidity::Maker),
            "taker" => Ok(Liquidity::Taker),
            other => Err(format!("unknown liquidity flag '{other}'")),
        }
    }
}

/// One matching event. `base_price` is the pre-slippage price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub fill_id: String,
    pub symbol: String,
    pub side: Side,
    pub base_price: Decimal,
    pub price: Decimal,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub slippage_bps: Decimal,
    pub liquidity: Liquidity,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub cash: Decimal,
    pub equity: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub positions: BTreeMap<String, Position>,
}

impl Account {
    pub fn position_qty(&self, symbol: &str) -> Decimal {
        self.positions.get(symbol).map(|p| p.quantity).unwrap_or(Decimal::ZERO)
    }
}

/// OHLCV sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub symbol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderEventKind { Submitted, Fill, Cancelled, Rejected, Expired }

/// Append-only lifecycle entry kept per order for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: String,
    pub kind: OrderEventKind,
    pub ts: DateTime<Utc>,
    pub fill: Option<Fill>,
    pub reason: Option<String>,
}
