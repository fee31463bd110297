// ===============================
// src/broker.rs (venue capability)
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : broker.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Satu trait untuk semua venue. Runner hanya bicara lewat `Broker`, jadi
// paper venue (MatchingBroker) dan adapter live bisa ditukar tanpa ubah loop.
//
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{Account, Fill, Order, OrderIntent, OrderStatus, Position};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("unknown order {0}")]
    UnknownOrder(String),
    #[error("order {id} is {status}, cannot {action}")]
    InvalidTransition { id: String, status: OrderStatus, action: &'static str },
    #[error("insufficient inventory for {symbol}: held {held}, requested {requested}")]
    InsufficientInventory { symbol: String, held: Decimal, requested: Decimal },
    #[error("venue '{0}' is not implemented")]
    NotImplemented(String),
}

pub trait Broker: Send {
    /// Submit an intent. Venue-side rejections come back as an order with
    /// status `rejected`; only malformed input is an `Err`.
    fn place_order(&mut self, intent: OrderIntent) -> Result<Order, BrokerError>;
    fn cancel_order(&mut self, order_id: &str) -> Result<Order, BrokerError>;
    /// Drain fills produced since the previous poll.
    fn poll_fills(&mut self) -> Result<Vec<Fill>, BrokerError>;
    fn positions(&self) -> Result<Vec<Position>, BrokerError>;
    fn account(&self) -> Result<Account, BrokerError>;
    fn on_market_data(&mut self, symbol: &str, price: Decimal, ts: DateTime<Utc>) -> Result<(), BrokerError>;
    /// Restore holdings and realized PnL persisted by a previous session.
    /// Venues that keep their own book ignore it.
    fn bootstrap_positions(&mut self, _positions: &BTreeMap<String, Position>, _realized_pnl: Decimal) -> Result<(), BrokerError> {
        Ok(())
    }
    /// Whether the venue still has this order id on its book.
    fn knows_order(&self, _order_id: &str) -> bool { false }
}

/// Placeholder for venues without an adapter yet.
#[derive(Debug, Clone)]
pub struct UnsupportedBroker {
    pub venue: String,
}

impl UnsupportedBroker {
    pub fn new(venue: impl Into<String>) -> Self { Self { venue: venue.into() } }

    fn err(&self) -> BrokerError { BrokerError::NotImplemented(self.venue.clone()) }
}

impl Broker for UnsupportedBroker {
    fn place_order(&mut self, _intent: OrderIntent) -> Result<Order, BrokerError> { Err(self.err()) }
    fn cancel_order(&mut self, _order_id: &str) -> Result<Order, BrokerError> { Err(self.err()) }
    fn poll_fills(&mut self) -> Result<Vec<Fill>, BrokerError> { Err(self.err()) }
    fn positions(&self) -> Result<Vec<Position>, BrokerError> { Err(self.err()) }
    fn account(&self) -> Result<Account, BrokerError> { Err(self.err()) }
    fn on_market_data(&mut self, _symbol: &str, _price: Decimal, _ts: DateTime<Utc>) -> Result<(), BrokerError> {
        Err(self.err())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use rust_decimal_macros::dec;

    #[test]
    fn unsupported_venue_fails_every_call() {
        let mut b = UnsupportedBroker::new("ib");
        let err = b.place_order(OrderIntent::market("AAPL", Side::Buy, dec!(1))).unwrap_err();
        assert!(matches!(err, BrokerError::NotImplemented(ref v) if v == "ib"));
        assert!(b.poll_fills().is_err());
        assert!(b.account().is_err());
        assert!(b.on_market_data("AAPL", dec!(1), Utc::now()).is_err());
        // nothing to restore on a venue without a book
        assert!(b.bootstrap_positions(&BTreeMap::new(), Decimal::ZERO).is_ok());
        assert!(!b.knows_order("MB-000001"));
    }
}
