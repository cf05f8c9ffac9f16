//! Local order book for delta-fed venues.
//!
//! Venues that stream incremental changes (Bybit, Coinbase, Kucoin) need a
//! book to apply them to. Only the owning stream task ever touches an
//! instance; it is never shared.

use crate::models::{BookLevel, BookSnapshot};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct LocalBook {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
}

impl LocalBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all levels. Used when a reconnect forces a fresh snapshot seed.
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// Replace the whole book, for venues that push full-depth frames.
    pub fn replace(&mut self, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) {
        self.bids = bids.into_iter().filter(|(_, v)| !v.is_zero()).collect();
        self.asks = asks.into_iter().filter(|(_, v)| !v.is_zero()).collect();
    }

    /// Apply one delta. A zero volume removes the level.
    pub fn apply_bid(&mut self, price: Decimal, volume: Decimal) {
        if volume.is_zero() {
            self.bids.remove(&price);
        } else {
            self.bids.insert(price, volume);
        }
    }

    pub fn apply_ask(&mut self, price: Decimal, volume: Decimal) {
        if volume.is_zero() {
            self.asks.remove(&price);
        } else {
            self.asks.insert(price, volume);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Top-10 view: bids descending, asks ascending.
    pub fn top10(&self) -> BookSnapshot {
        let bids = self
            .bids
            .iter()
            .rev()
            .take(10)
            .map(|(&price, &volume)| BookLevel { price, volume })
            .collect();
        let asks = self
            .asks
            .iter()
            .take(10)
            .map(|(&price, &volume)| BookLevel { price, volume })
            .collect();
        BookSnapshot { bids, asks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_apply_and_remove() {
        let mut book = LocalBook::new();
        book.apply_bid(dec!(100), dec!(1));
        book.apply_bid(dec!(99), dec!(2));
        book.apply_ask(dec!(101), dec!(3));

        let snap = book.top10();
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.asks.len(), 1);

        // Zero volume removes the level.
        book.apply_bid(dec!(100), dec!(0));
        let snap = book.top10();
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.bids[0].price, dec!(99));
    }

    #[test]
    fn test_top10_ordering_and_truncation() {
        let mut book = LocalBook::new();
        for i in 1..=15i64 {
            book.apply_bid(Decimal::from(i), dec!(1));
            book.apply_ask(Decimal::from(100 + i), dec!(1));
        }

        let snap = book.top10();
        assert_eq!(snap.bids.len(), 10);
        assert_eq!(snap.asks.len(), 10);
        // Best bid is the highest price, best ask the lowest.
        assert_eq!(snap.bids[0].price, dec!(15));
        assert_eq!(snap.bids[9].price, dec!(6));
        assert_eq!(snap.asks[0].price, dec!(101));
        assert_eq!(snap.asks[9].price, dec!(110));
    }

    #[test]
    fn test_replace_drops_zero_levels() {
        let mut book = LocalBook::new();
        book.apply_bid(dec!(50), dec!(9));
        book.replace(
            vec![(dec!(100), dec!(1)), (dec!(99), dec!(0))],
            vec![(dec!(101), dec!(2))],
        );

        let snap = book.top10();
        assert_eq!(snap.bids.len(), 1);
        assert_eq!(snap.bids[0].price, dec!(100));
        assert_eq!(snap.asks[0].price, dec!(101));
    }
}
