// ===============================
// tests/fifo_props.rs
// ===============================
//
// Property test: akuntansi FIFO broker dan sliding window router.
//
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use runner_core_rust::broker::Broker;
use runner_core_rust::clock::ManualClock;
use runner_core_rust::domain::{OrderIntent, OrderStatus, Side};
use runner_core_rust::matching::{BrokerConfig, MatchingBroker};
use runner_core_rust::router::{OrderRequest, OrderRouter};

fn price_strategy() -> impl Strategy<Value = Decimal> {
    (100i64..50_000i64).prop_map(|x| Decimal::new(x, 2)) // 1.00 .. 500.00
}

fn qty_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..500i64).prop_map(|x| Decimal::new(x, 2))
}

// (price, qty, buy?)
fn step_strategy() -> impl Strategy<Value = (Decimal, Decimal, bool)> { (price_strategy(), qty_strategy(), any::<bool>()) }

proptest! {
    /// Held quantity always equals buys minus sells, and equity reconciles
    /// with cash + realized + unrealized PnL after fees.
    #[test]
    fn fifo_inventory_reconciles(steps in prop::collection::vec(step_strategy(), 1..40)) {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(t0));
        let cfg = BrokerConfig { starting_cash: dec!(1000000), slippage_bps: dec!(2), maker_fee_bps: dec!(1), taker_fee_bps: dec!(5) };
        let start = cfg.starting_cash;
        let mut broker = MatchingBroker::new(cfg, clock.clone());
        let mut expected = Decimal::ZERO;

        for (i, (price, qty, buy)) in steps.into_iter().enumerate() {
            let ts = t0 + Duration::minutes(i as i64);
            clock.set(ts);
            broker.on_market_data("X", price, ts).unwrap();
            let (side, qty) = if buy { (Side::Buy, qty) } else { (Side::Sell, qty.min(expected)) };
            if qty <= Decimal::ZERO {
                continue;
            }
            let order = broker.place_order(OrderIntent::market("X", side, qty)).unwrap();
            prop_assert_eq!(order.status, OrderStatus::Filled);
            expected += if buy { qty } else { -qty };
            prop_assert_eq!(broker.position_qty("X"), expected);

            let acct = broker.account().unwrap();
            prop_assert_eq!(acct.equity, start + acct.realized_pnl + acct.unrealized_pnl);
            prop_assert!(acct.position_qty("X") >= Decimal::ZERO);
        }
    }

    /// Accepted submissions never exceed the per-strategy limit inside any
    /// one-second window.
    #[test]
    fn router_rate_window_holds(limit in 1u32..8, gaps in prop::collection::vec(0i64..600, 1..60)) {
        let mut router = OrderRouter::new(limit, 10_000).unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mut now = t0;
        let mut accepted = Vec::new();

        for (i, gap) in gaps.into_iter().enumerate() {
            now += Duration::milliseconds(gap);
            let decision = router.submit(
                OrderRequest {
                    strategy_id: "s".into(),
                    symbol: "X".into(),
                    quantity: dec!(1),
                    price: dec!(10),
                    client_order_id: format!("c{i}"),
                    idempotency_key: None,
                    timestamp: Some(now),
                },
                now,
            );
            if decision.accepted {
                accepted.push(now);
            } else {
                prop_assert_eq!(decision.reason.as_str(), "rate_limited");
            }
        }

        for t in &accepted {
            let in_window = accepted.iter().filter(|a| **a <= *t && **a >= *t - Duration::seconds(1)).count();
            prop_assert!(in_window <= limit as usize, "{} accepted within 1s of {}", in_window, t);
        }
    }
}
