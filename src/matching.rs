// ===============================
// src/matching.rs (paper venue: FIFO inventory + PnL)
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : matching.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Simulated venue yang deterministik:
// - inventory per symbol = arena of lots, dikonsumsi dari depan (index head)
// - slippage & fee (maker/taker) dalam bps
// - cash, realized PnL, mark terakhir per symbol
// - event log per order (submitted / fill / cancelled / rejected / expired)
//
use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::clock::SharedClock;
use crate::domain::{
    Account, Fill, Liquidity, Order, OrderEvent, OrderEventKind, OrderIntent, OrderStatus, OrderType,
    Position, Side, TimeInForce,
};
use crate::metrics::{FILLS, ORDERS};

const BPS: Decimal = dec!(0.0001);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub starting_cash: Decimal,
    pub slippage_bps: Decimal,
    pub maker_fee_bps: Decimal,
    pub taker_fee_bps: Decimal,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            starting_cash: dec!(1000000),
            slippage_bps: Decimal::ZERO,
            maker_fee_bps: Decimal::ZERO,
            taker_fee_bps: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lot {
    qty: Decimal,
    price: Decimal,
}

/// Lots live in a Vec; everything before `head` is fully consumed.
#[derive(Debug, Default)]
struct Inventory {
    lots: Vec<Lot>,
    head: usize,
}

impl Inventory {
    fn live(&self) -> &[Lot] { &self.lots[self.head..] }

    fn quantity(&self) -> Decimal { self.live().iter().map(|l| l.qty).sum() }

    fn cost(&self) -> Decimal { self.live().iter().map(|l| l.qty * l.price).sum() }

    fn avg_price(&self) -> Decimal {
        let q = self.quantity();
        if q.is_zero() { Decimal::ZERO } else { self.cost() / q }
    }

    fn push(&mut self, qty: Decimal, price: Decimal) { self.lots.push(Lot { qty, price }); }

    /// Take `qty` from the oldest lots; returns gross realized PnL at `price`.
    /// Caller checks `qty <= quantity()` first.
    fn consume(&mut self, mut qty: Decimal, price: Decimal) -> Decimal {
        let mut realized = Decimal::ZERO;
        while qty > Decimal::ZERO && self.head < self.lots.len() {
            let lot = &mut self.lots[self.head];
            let take = qty.min(lot.qty);
            realized += (price - lot.price) * take;
            lot.qty -= take;
            qty -= take;
            if lot.qty.is_zero() {
                self.head += 1;
            }
        }
        self.compact();
        realized
    }

    fn compact(&mut self) {
        if self.head >= 32 && self.head * 2 >= self.lots.len() {
            self.lots.drain(..self.head);
            self.head = 0;
        }
    }
}

pub struct MatchingBroker {
    cfg: BrokerConfig,
    clock: SharedClock,
    cash: Decimal,
    realized_pnl: Decimal,
    inventory: BTreeMap<String, Inventory>,
    marks: HashMap<String, Decimal>,
    orders: HashMap<String, Order>,
    // resting orders in arrival order
    open: Vec<String>,
    events: HashMap<String, Vec<OrderEvent>>,
    pending_fills: Vec<Fill>,
    order_seq: u64,
    fill_seq: u64,
}

impl MatchingBroker {
    pub fn new(cfg: BrokerConfig, clock: SharedClock) -> Self {
        Self {
            cash: cfg.starting_cash,
            cfg,
            clock,
            realized_pnl: Decimal::ZERO,
            inventory: BTreeMap::new(),
            marks: HashMap::new(),
            orders: HashMap::new(),
            open: Vec::new(),
            events: HashMap::new(),
            pending_fills: Vec::new(),
            order_seq: 0,
            fill_seq: 0,
        }
    }

    pub fn submit_order(&mut self, intent: OrderIntent) -> Result<Order, BrokerError> {
        if intent.quantity <= Decimal::ZERO {
            return Err(BrokerError::Validation(format!("quantity must be positive, got {}", intent.quantity)));
        }
        if intent.symbol.trim().is_empty() {
            return Err(BrokerError::Validation("symbol is empty".into()));
        }
        if intent.order_type == OrderType::Limit {
            match intent.limit_price {
                Some(p) if p > Decimal::ZERO => {}
                _ => return Err(BrokerError::Validation("limit order needs a positive limit price".into())),
            }
        }

        self.order_seq += 1;
        let id = format!("MB-{:06}", self.order_seq);
        let order = Order {
            id: id.clone(),
            intent,
            status: OrderStatus::Submitted,
            filled_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            reject_reason: None,
        };
        self.orders.insert(id.clone(), order.clone());
        self.push_event(&id, OrderEventKind::Submitted, None, None);
        debug!(order_id = %id, symbol = %order.intent.symbol, side = order.intent.side.as_str(), qty = %order.intent.quantity, "order submitted");
        Ok(order)
    }

    /// Manual fill against an existing order. `price` is pre-slippage.
    pub fn record_fill(&mut self, order_id: &str, price: Decimal, quantity: Decimal, liquidity: &str) -> Result<Fill, BrokerError> {
        let liquidity: Liquidity = liquidity.parse().map_err(BrokerError::Validation)?;
        self.fill_order(order_id, price, quantity, liquidity, None)
    }

    pub fn cancel_order(&mut self, order_id: &str) -> Result<Order, BrokerError> {
        let order = self.orders.get_mut(order_id).ok_or_else(|| BrokerError::UnknownOrder(order_id.to_string()))?;
        match order.status {
            OrderStatus::Filled | OrderStatus::Canceled => return Ok(order.clone()),
            OrderStatus::Rejected | OrderStatus::Expired => {
                return Err(BrokerError::InvalidTransition { id: order_id.to_string(), status: order.status, action: "cancel" });
            }
            _ => {}
        }
        order.status = OrderStatus::Canceled;
        let snapshot = order.clone();
        self.open.retain(|id| id != order_id);
        self.push_event(order_id, OrderEventKind::Cancelled, None, None);
        ORDERS.with_label_values(&["canceled"]).inc();
        Ok(snapshot)
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> { self.orders.get(order_id) }

    pub fn open_orders(&self) -> Vec<Order> {
        self.open.iter().filter_map(|id| self.orders.get(id).cloned()).collect()
    }

    pub fn events_for_order(&self, order_id: &str) -> Vec<OrderEvent> {
        self.events.get(order_id).cloned().unwrap_or_default()
    }

    pub fn mark(&self, symbol: &str) -> Option<Decimal> { self.marks.get(symbol).copied() }

    pub fn position_qty(&self, symbol: &str) -> Decimal {
        self.inventory.get(symbol).map(|i| i.quantity()).unwrap_or(Decimal::ZERO)
    }

    pub fn account_snapshot(&self) -> Account {
        let mut positions = BTreeMap::new();
        let mut unrealized = Decimal::ZERO;
        let mut marked = Decimal::ZERO;
        for (symbol, inv) in &self.inventory {
            let qty = inv.quantity();
            if qty.is_zero() {
                continue;
            }
            let avg = inv.avg_price();
            let mark = self.marks.get(symbol).copied().unwrap_or(avg);
            let upnl = (mark * qty) - inv.cost();
            unrealized += upnl;
            marked += mark * qty;
            positions.insert(symbol.clone(), Position { symbol: symbol.clone(), quantity: qty, avg_price: avg, unrealized_pnl: upnl });
        }
        Account {
            cash: self.cash,
            equity: self.cash + marked,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: unrealized,
            positions,
        }
    }

    /// Prime inventory after a restart. Each position becomes one lot at its
    /// average price, marked where the saved unrealized PnL puts it. Cash is
    /// rebuilt from `starting_cash + realized_pnl - cost`, so equity carries
    /// over from the previous session.
    pub fn bootstrap_positions(&mut self, positions: &BTreeMap<String, Position>, realized_pnl: Decimal) {
        self.inventory.clear();
        let mut cost = Decimal::ZERO;
        for (symbol, pos) in positions {
            if pos.quantity <= Decimal::ZERO {
                if !pos.quantity.is_zero() {
                    warn!(%symbol, qty = %pos.quantity, "skip short position on bootstrap; inventory is long-only");
                }
                continue;
            }
            let mut inv = Inventory::default();
            inv.push(pos.quantity, pos.avg_price);
            cost += pos.quantity * pos.avg_price;
            self.inventory.insert(symbol.clone(), inv);
            let mark = pos.avg_price + pos.unrealized_pnl / pos.quantity;
            self.marks.insert(symbol.clone(), if mark > Decimal::ZERO { mark } else { pos.avg_price });
        }
        self.realized_pnl = realized_pnl;
        self.cash = self.cfg.starting_cash + realized_pnl - cost;
        info!(symbols = self.inventory.len(), cash = %self.cash, realized = %realized_pnl, "broker bootstrapped from saved state");
    }

    // ---------- internals ----------

    fn push_event(&mut self, order_id: &str, kind: OrderEventKind, fill: Option<Fill>, reason: Option<String>) {
        let ev = OrderEvent { order_id: order_id.to_string(), kind, ts: self.clock.now(), fill, reason };
        self.events.entry(order_id.to_string()).or_default().push(ev);
    }

    fn finish(&mut self, order_id: &str, status: OrderStatus, reason: &str) -> Option<Order> {
        let order = self.orders.get_mut(order_id)?;
        order.status = status;
        order.reject_reason = Some(reason.to_string());
        let snapshot = order.clone();
        self.open.retain(|id| id != order_id);
        let kind = if status == OrderStatus::Expired { OrderEventKind::Expired } else { OrderEventKind::Rejected };
        self.push_event(order_id, kind, None, Some(reason.to_string()));
        ORDERS.with_label_values(&[status.as_str()]).inc();
        Some(snapshot)
    }

    /// Quantity already promised to resting sells for `symbol`.
    fn committed_sells(&self, symbol: &str) -> Decimal {
        self.open
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| o.intent.symbol == symbol && o.intent.side == Side::Sell)
            .map(|o| o.remaining())
            .sum()
    }

    fn fill_order(
        &mut self,
        order_id: &str,
        base_price: Decimal,
        quantity: Decimal,
        liquidity: Liquidity,
        limit_cap: Option<Decimal>,
    ) -> Result<Fill, BrokerError> {
        let order = self.orders.get(order_id).ok_or_else(|| BrokerError::UnknownOrder(order_id.to_string()))?;
        if order.status.is_terminal() {
            return Err(BrokerError::InvalidTransition { id: order_id.to_string(), status: order.status, action: "fill" });
        }
        if quantity <= Decimal::ZERO || base_price <= Decimal::ZERO {
            return Err(BrokerError::Validation(format!("fill needs positive price and quantity, got {quantity} @ {base_price}")));
        }
        if quantity > order.remaining() {
            return Err(BrokerError::Validation(format!("fill {quantity} exceeds remaining {}", order.remaining())));
        }

        let side = order.intent.side;
        let symbol = order.intent.symbol.clone();
        if side == Side::Sell {
            let held = self.position_qty(&symbol);
            if quantity > held {
                return Err(BrokerError::InsufficientInventory { symbol, held, requested: quantity });
            }
        }

        let slip = base_price * self.cfg.slippage_bps * BPS;
        let mut price = match side { Side::Buy => base_price + slip, Side::Sell => base_price - slip };
        if let Some(limit) = limit_cap {
            price = match side { Side::Buy => price.min(limit), Side::Sell => price.max(limit) };
        }
        let fee_bps = match liquidity { Liquidity::Maker => self.cfg.maker_fee_bps, Liquidity::Taker => self.cfg.taker_fee_bps };
        let notional = price * quantity;
        let fee = notional * fee_bps * BPS;

        let inv = self.inventory.entry(symbol.clone()).or_default();
        match side {
            Side::Buy => {
                inv.push(quantity, price);
                self.cash -= notional + fee;
            }
            Side::Sell => {
                self.realized_pnl += inv.consume(quantity, price);
                self.cash += notional - fee;
            }
        }
        self.realized_pnl -= fee;
        self.marks.insert(symbol.clone(), price);

        self.fill_seq += 1;
        let fill = Fill {
            order_id: order_id.to_string(),
            fill_id: format!("MB-FILL-{:06}", self.fill_seq),
            symbol: symbol.clone(),
            side,
            base_price,
            price,
            quantity,
            fee,
            slippage_bps: self.cfg.slippage_bps,
            liquidity,
            ts: self.clock.now(),
        };

        if let Some(order) = self.orders.get_mut(order_id) {
            let filled = order.filled_qty + quantity;
            order.avg_fill_price = (order.avg_fill_price * order.filled_qty + price * quantity) / filled;
            order.filled_qty = filled;
            order.status = if order.remaining().is_zero() { OrderStatus::Filled } else { OrderStatus::PartiallyFilled };
            if order.status == OrderStatus::Filled {
                self.open.retain(|id| id != order_id);
                ORDERS.with_label_values(&["filled"]).inc();
            }
        }
        self.push_event(order_id, OrderEventKind::Fill, Some(fill.clone()), None);
        self.pending_fills.push(fill.clone());
        FILLS.with_label_values(&[&symbol, liquidity.as_str()]).inc();
        debug!(%order_id, %symbol, %price, qty = %quantity, %fee, "fill recorded");
        Ok(fill)
    }

    /// Limits trade only when the mark crosses them.
    fn tradable(order: &Order, mark: Decimal) -> bool {
        match (order.intent.order_type, order.intent.limit_price) {
            (OrderType::Limit, Some(limit)) => match order.intent.side {
                Side::Buy => mark <= limit,
                Side::Sell => mark >= limit,
            },
            _ => true,
        }
    }

    fn try_match(&mut self, order_id: &str, mark: Decimal, liquidity: Liquidity) -> Result<bool, BrokerError> {
        let Some(order) = self.orders.get(order_id) else { return Ok(false) };
        if !Self::tradable(order, mark) {
            return Ok(false);
        }
        let qty = order.remaining();
        let (cap, liquidity) = match order.intent.order_type {
            OrderType::Limit => (order.intent.limit_price, liquidity),
            OrderType::Market => (None, Liquidity::Taker),
        };
        self.fill_order(order_id, mark, qty, liquidity, cap)?;
        Ok(true)
    }
}

impl Broker for MatchingBroker {
    fn place_order(&mut self, intent: OrderIntent) -> Result<Order, BrokerError> {
        let order = self.submit_order(intent)?;
        let id = order.id.clone();
        let symbol = order.intent.symbol.clone();

        if order.intent.side == Side::Sell {
            let free = self.position_qty(&symbol) - self.committed_sells(&symbol);
            if order.intent.quantity > free {
                warn!(order_id = %id, %symbol, %free, qty = %order.intent.quantity, "sell rejected: insufficient inventory");
                return Ok(self.finish(&id, OrderStatus::Rejected, "insufficient_inventory").unwrap_or(order));
            }
        }

        let filled = match self.marks.get(&symbol).copied() {
            Some(mark) => self.try_match(&id, mark, Liquidity::Taker)?,
            None => false,
        };
        if !filled {
            if order.intent.time_in_force == TimeInForce::Ioc {
                return Ok(self.finish(&id, OrderStatus::Expired, "ioc_not_filled").unwrap_or(order));
            }
            self.open.push(id.clone());
        }
        ORDERS.with_label_values(&["placed"]).inc();
        Ok(self.orders.get(&id).cloned().unwrap_or(order))
    }

    fn cancel_order(&mut self, order_id: &str) -> Result<Order, BrokerError> { MatchingBroker::cancel_order(self, order_id) }

    fn poll_fills(&mut self) -> Result<Vec<Fill>, BrokerError> { Ok(std::mem::take(&mut self.pending_fills)) }

    fn positions(&self) -> Result<Vec<Position>, BrokerError> {
        Ok(self.account_snapshot().positions.into_values().collect())
    }

    fn account(&self) -> Result<Account, BrokerError> { Ok(self.account_snapshot()) }

    fn bootstrap_positions(&mut self, positions: &BTreeMap<String, Position>, realized_pnl: Decimal) -> Result<(), BrokerError> {
        MatchingBroker::bootstrap_positions(self, positions, realized_pnl);
        Ok(())
    }

    fn knows_order(&self, order_id: &str) -> bool { self.orders.contains_key(order_id) }

    fn on_market_data(&mut self, symbol: &str, price: Decimal, ts: DateTime<Utc>) -> Result<(), BrokerError> {
        if price <= Decimal::ZERO {
            return Err(BrokerError::Validation(format!("mark for {symbol} must be positive, got {price}")));
        }
        self.marks.insert(symbol.to_string(), price);
        let resting: Vec<String> = self
            .open
            .iter()
            .filter(|id| self.orders.get(*id).map(|o| o.intent.symbol == symbol).unwrap_or(false))
            .cloned()
            .collect();
        for id in resting {
            match self.try_match(&id, price, Liquidity::Maker) {
                Ok(_) => {}
                Err(BrokerError::InsufficientInventory { .. }) => {
                    self.finish(&id, OrderStatus::Rejected, "insufficient_inventory");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(%symbol, %price, %ts, "mark updated");
        Ok(())
    }
}
