//! Ordered index of active positions.
//!
//! Positions are keyed by their nominal collateral ratio (`collateral /
//! debt`, independent of price) so the order survives price moves. The
//! index is decoupled from position storage: it only knows ids and keys.
//! Ties are broken by account id to keep iteration deterministic.
//!
//! Callers may pass an [`InsertHint`] naming the expected neighbours. The
//! ordered set places entries itself, so a hint is only checked and a
//! stale one logged. It never changes the resulting index.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::core::position::AccountId;
use crate::error::{Error, Result};
use crate::utils::math::FixedPoint;

/// Expected neighbours of an insertion point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InsertHint {
    /// Position that should come right before the new entry
    pub prev: Option<AccountId>,
    /// Position that should come right after the new entry
    pub next: Option<AccountId>,
}

/// Active positions sorted by nominal ratio, lowest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedPositions {
    order: BTreeSet<(FixedPoint, AccountId)>,
    keys: BTreeMap<AccountId, FixedPoint>,
}

impl SortedPositions {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a position that is not yet indexed
    pub fn insert(&mut self, id: AccountId, key: FixedPoint, hint: Option<InsertHint>) -> Result<()> {
        if self.keys.contains_key(&id) {
            return Err(Error::InvalidPositionState {
                id: id.to_string(),
                status: "indexed".into(),
                expected: "not indexed".into(),
            });
        }

        if let Some(hint) = hint {
            if !self.valid_insert_position(key, id, &hint) {
                tracing::debug!(%id, ?hint, "stale insert hint");
            }
        }

        self.order.insert((key, id));
        self.keys.insert(id, key);
        Ok(())
    }

    /// Remove a position, returning its key
    pub fn remove(&mut self, id: AccountId) -> Result<FixedPoint> {
        let key = self
            .keys
            .remove(&id)
            .ok_or_else(|| Error::PositionNotFound(id.to_string()))?;
        self.order.remove(&(key, id));
        Ok(key)
    }

    /// Move an indexed position to a new key
    pub fn reinsert(&mut self, id: AccountId, key: FixedPoint, hint: Option<InsertHint>) -> Result<()> {
        self.remove(id)?;
        self.insert(id, key, hint)
    }

    /// Check whether a position is indexed
    pub fn contains(&self, id: AccountId) -> bool {
        self.keys.contains_key(&id)
    }

    /// Key a position was indexed under
    pub fn key_of(&self, id: AccountId) -> Option<FixedPoint> {
        self.keys.get(&id).copied()
    }

    /// Position with the lowest ratio
    pub fn lowest(&self) -> Option<(AccountId, FixedPoint)> {
        self.order.iter().next().map(|(key, id)| (*id, *key))
    }

    /// Position with the highest ratio
    pub fn highest(&self) -> Option<(AccountId, FixedPoint)> {
        self.order.iter().next_back().map(|(key, id)| (*id, *key))
    }

    /// Ids in ascending ratio order
    pub fn iter(&self) -> impl Iterator<Item = AccountId> + '_ {
        self.order.iter().map(|(_, id)| *id)
    }

    /// Neighbours an entry with `key` would be inserted between
    pub fn find_insert_position(&self, key: FixedPoint, id: AccountId) -> InsertHint {
        InsertHint {
            prev: self.order.range(..(key, id)).next_back().map(|(_, p)| *p),
            next: self.order.range((key, id)..).find(|(_, n)| *n != id).map(|(_, n)| *n),
        }
    }

    /// True if `hint` brackets `(key, id)` with adjacent neighbours
    pub fn valid_insert_position(&self, key: FixedPoint, id: AccountId, hint: &InsertHint) -> bool {
        *hint == self.find_insert_position(key, id)
    }

    /// Get number of indexed positions
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pct: u64) -> FixedPoint {
        FixedPoint::from_percentage(pct)
    }

    #[test]
    fn test_sorted_positions() {
        let mut sorted = SortedPositions::new();
        let (a, b, c) = (AccountId(1), AccountId(2), AccountId(3));

        sorted.insert(b, key(150), None).unwrap();
        sorted.insert(a, key(120), None).unwrap();
        sorted.insert(c, key(200), None).unwrap();

        assert_eq!(sorted.lowest(), Some((a, key(120))));
        assert_eq!(sorted.highest(), Some((c, key(200))));
        assert_eq!(sorted.iter().collect::<Vec<_>>(), vec![a, b, c]);
        assert!(sorted.contains(b));
        assert_eq!(sorted.len(), 3);
    }

    #[test]
    fn test_reinsert_and_remove() {
        let mut sorted = SortedPositions::new();
        let (a, b) = (AccountId(1), AccountId(2));
        sorted.insert(a, key(120), None).unwrap();
        sorted.insert(b, key(150), None).unwrap();

        sorted.reinsert(a, key(300), None).unwrap();
        assert_eq!(sorted.lowest(), Some((b, key(150))));

        assert_eq!(sorted.remove(b).unwrap(), key(150));
        assert!(!sorted.contains(b));
        assert!(sorted.remove(b).is_err());
        assert!(sorted.insert(a, key(100), None).is_err());
    }

    #[test]
    fn test_insert_hints() {
        let mut sorted = SortedPositions::new();
        let (a, b, c) = (AccountId(1), AccountId(2), AccountId(3));
        sorted.insert(a, key(120), None).unwrap();
        sorted.insert(c, key(200), None).unwrap();

        let hint = sorted.find_insert_position(key(150), b);
        assert_eq!(hint, InsertHint { prev: Some(a), next: Some(c) });

        sorted.insert(b, key(150), Some(hint)).unwrap();
        assert!(!sorted.valid_insert_position(key(150), AccountId(5), &hint));

        // A wrong hint still inserts in the right place
        let d = AccountId(4);
        sorted
            .insert(d, key(110), Some(InsertHint { prev: Some(c), next: None }))
            .unwrap();
        assert_eq!(sorted.lowest(), Some((d, key(110))));
    }

    #[test]
    fn test_hints_do_not_change_index_state() {
        let (a, b, c) = (AccountId(1), AccountId(2), AccountId(3));
        let mut plain = SortedPositions::new();
        let mut hinted = SortedPositions::new();
        for sorted in [&mut plain, &mut hinted] {
            sorted.insert(a, key(120), None).unwrap();
            sorted.insert(c, key(200), None).unwrap();
        }

        plain.insert(b, key(150), None).unwrap();
        let good = hinted.find_insert_position(key(150), b);
        hinted.insert(b, key(150), Some(good)).unwrap();
        let stale = InsertHint { prev: Some(c), next: Some(a) };
        plain.reinsert(a, key(500), None).unwrap();
        hinted.reinsert(a, key(500), Some(stale)).unwrap();

        assert_eq!(plain, hinted);
        assert_eq!(
            bincode::serialize(&plain).unwrap(),
            bincode::serialize(&hinted).unwrap()
        );
    }

    #[test]
    fn test_ties_ordered_by_id() {
        let mut sorted = SortedPositions::new();
        sorted.insert(AccountId(9), key(150), None).unwrap();
        sorted.insert(AccountId(3), key(150), None).unwrap();
        assert_eq!(sorted.iter().collect::<Vec<_>>(), vec![AccountId(3), AccountId(9)]);
    }
}
