// ===============================
// src/strategy.rs
// ===============================
/*
=============================================================================
Project : runner_core_rust — scheduled strategy runner with paper execution
Module  : strategy.rs
Version : 0.1.0
License : MIT

Summary : Runs order-intent strategies on a cadence scheduler, gates every
          order through risk limits and an idempotent rate-limited router,
          fills against a FIFO paper venue, and checkpoints state, trades,
          metrics and session reports per run directory.
=============================================================================
*/
//
// Generator order intent. Runner memanggil `generate(bars, current_qty)` per
// bar; generator menyimpan history sendiri kalau butuh.
//
// Disediakan:
// - closure apa saja dengan signature FnMut(&[Bar], Decimal) -> Vec<OrderIntent>
// - MeanReversion (demo): SMA N-bar, beli di bawah fair - edge, jual di atas
//   fair + edge. Long-only, jual dibatasi posisi yang ada.
//
use std::collections::VecDeque;

use rust_decimal::Decimal;
use tracing::debug;

use crate::domain::{Bar, OrderIntent, Side};

pub trait OrderIntentGenerator: Send {
    fn generate(&mut self, bars: &[Bar], current_qty: Decimal) -> Vec<OrderIntent>;
}

impl<F> OrderIntentGenerator for F
where
    F: FnMut(&[Bar], Decimal) -> Vec<OrderIntent> + Send,
{
    fn generate(&mut self, bars: &[Bar], current_qty: Decimal) -> Vec<OrderIntent> { self(bars, current_qty) }
}

// -----------------------------------------------------------------------------
// MEAN-REVERSION
//    Ide: close < SMA*(1 - edge) -> Buy ; close > SMA*(1 + edge) -> Sell
//    Risiko: saat trending kuat bisa melawan arus (risk guard di risk.rs).
// -----------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct MeanReversion {
    window: VecDeque<Decimal>,
    sum: Decimal,
    w: usize,
    edge_bps: Decimal,
    trade_qty: Decimal,
    max_position: Decimal,
}

impl MeanReversion {
    pub fn new(w: usize, edge_bps: Decimal, trade_qty: Decimal, max_position: Decimal) -> Self {
        let w = w.max(1);
        Self { window: VecDeque::with_capacity(w), sum: Decimal::ZERO, w, edge_bps, trade_qty, max_position }
    }

    fn fair(&self) -> Option<Decimal> {
        if self.window.len() >= self.w { Some(self.sum / Decimal::from(self.w as u64)) } else { None }
    }

    fn on_bar(&mut self, bar: &Bar, current_qty: Decimal) -> Option<OrderIntent> {
        if self.window.len() == self.w {
            if let Some(x) = self.window.pop_front() { self.sum -= x; }
        }
        self.window.push_back(bar.close);
        self.sum += bar.close;

        let fair = self.fair()?;
        let band = fair * self.edge_bps / Decimal::from(10_000);
        if bar.close < fair - band {
            let room = if self.max_position > Decimal::ZERO { self.max_position - current_qty } else { self.trade_qty };
            let qty = self.trade_qty.min(room);
            if qty > Decimal::ZERO {
                return Some(OrderIntent::market(bar.symbol.clone(), Side::Buy, qty));
            }
        } else if bar.close > fair + band && current_qty > Decimal::ZERO {
            return Some(OrderIntent::market(bar.symbol.clone(), Side::Sell, self.trade_qty.min(current_qty)));
        }
        None
    }
}

impl OrderIntentGenerator for MeanReversion {
    fn generate(&mut self, bars: &[Bar], current_qty: Decimal) -> Vec<OrderIntent> {
        let mut out = Vec::new();
        let mut qty = current_qty;
        for bar in bars {
            if let Some(intent) = self.on_bar(bar, qty) {
                qty += intent.signed_quantity();
                debug!(symbol = %bar.symbol, side = intent.side.as_str(), qty = %intent.quantity, close = %bar.close, "mean-reversion signal");
                out.push(intent);
            }
        }
        out
    }
}
