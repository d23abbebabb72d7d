//! One side of an order book.
//!
//! A ladder is a price-unique set of (price, quantity) levels kept sorted
//! best-first: bids descending, asks ascending. Snapshot and delta entries
//! share the single [`Ladder::apply`] path; a delta is just upserts/deletes
//! layered on current state. Order within one batch is commutative since
//! prices are unique.

use serde::Serialize;

use super::wire::{ChangeType, DeltaLevel, SnapshotLevel};

/// A single (price, quantity) level. Quantity is always positive; a
/// zero-quantity update removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceLevel {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone)]
pub struct Ladder {
    side: BookSide,
    levels: Vec<PriceLevel>,
}

impl Ladder {
    pub fn new(side: BookSide) -> Self {
        Self {
            side,
            levels: Vec::new(),
        }
    }

    /// Apply one batch of delta entries. Returns whether any level actually
    /// changed (a delete of an absent price does not count).
    pub fn apply(&mut self, entries: &[DeltaLevel]) -> bool {
        let mut changed = false;
        for entry in entries {
            let mutated = match entry.change_type {
                ChangeType::Delete => self.remove(entry.price),
                ChangeType::Upsert => {
                    if entry.quantity <= 0.0 {
                        self.remove(entry.price)
                    } else {
                        self.upsert(entry.price, entry.quantity)
                    }
                }
            };
            changed |= mutated;
        }
        changed
    }

    /// Apply snapshot levels (upsert-only).
    pub fn apply_snapshot(&mut self, levels: &[SnapshotLevel]) -> bool {
        let mut changed = false;
        for level in levels {
            if level.quantity > 0.0 {
                changed |= self.upsert(level.price, level.quantity);
            }
        }
        changed
    }

    fn upsert(&mut self, price: f64, quantity: f64) -> bool {
        match self.position(price) {
            Ok(i) => {
                if self.levels[i].quantity == quantity {
                    false
                } else {
                    self.levels[i].quantity = quantity;
                    true
                }
            }
            Err(i) => {
                self.levels.insert(i, PriceLevel { price, quantity });
                true
            }
        }
    }

    fn remove(&mut self, price: f64) -> bool {
        match self.position(price) {
            Ok(i) => {
                self.levels.remove(i);
                true
            }
            Err(_) => false,
        }
    }

    /// Binary search by price under this side's best-first ordering.
    fn position(&self, price: f64) -> Result<usize, usize> {
        self.levels.binary_search_by(|level| match self.side {
            BookSide::Ask => level.price.total_cmp(&price),
            BookSide::Bid => price.total_cmp(&level.price),
        })
    }

    /// Levels in best-first order.
    pub fn levels(&self) -> &[PriceLevel] {
        &self.levels
    }

    #[inline]
    pub fn best(&self) -> Option<PriceLevel> {
        self.levels.first().copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn clear(&mut self) {
        self.levels.clear();
    }
}
