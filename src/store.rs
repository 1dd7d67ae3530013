// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::controller::Rank;

/// Identifies a unit of work being tracked for progress. Assigned by the
/// caller when registering a source; stable for the source's lifetime.
pub type ObjectId = i32;

// Sentinel: no new reading in this slot since it was last consumed.
const NO_READING: f64 = -1.0;

/// One reading delivered out of the store.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressReading {
    pub object_id: ObjectId,
    pub text: String,
    pub fraction: f64,
}

// One row per tracked object: a progress slot and a text slot per worker
// rank known so far. Rows are created lazily on first report and grow
// when a higher rank reports.
#[derive(Clone, Debug)]
struct ProgressRow {
    object_id: ObjectId,
    progress: Vec<f64>,
    text: Vec<String>,
}

impl ProgressRow {
    fn new(object_id: ObjectId, slots: usize) -> Self {
        let slots = slots.max(1);
        ProgressRow {
            object_id,
            progress: vec![NO_READING; slots],
            text: vec![String::new(); slots],
        }
    }

    fn set(&mut self, slot: usize, text: &str, fraction: f64) {
        if slot >= self.progress.len() {
            self.progress.resize(slot + 1, NO_READING);
            self.text.resize(slot + 1, String::new());
        }
        self.progress[slot] = fraction;
        self.text[slot] = text.to_string();
    }

    // The slot holding the smallest live reading, if any.
    fn min_live_slot(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (slot, &p) in self.progress.iter().enumerate() {
            if p >= 0.0 && best.map_or(true, |b| p < self.progress[b]) {
                best = Some(slot);
            }
        }
        best
    }

    fn drained(&self) -> bool {
        self.progress.iter().all(|&p| p < 0.0)
    }
}

/// Merges sparse, asynchronously arriving per-rank progress readings into
/// one deliverable value per tracked operation.
///
/// The merge policy is conservative: the slowest rank determines visible
/// progress, so the reported value never overstates completion, and a
/// 100% reading is delivered exactly once per slot. Rows whose every slot
/// has been consumed (or was never populated) are reclaimed.
///
/// Owned exclusively by one handler per process; never shared.
#[derive(Debug, Default)]
pub struct ProgressStore {
    rows: Vec<ProgressRow>,
    ranks: usize,
}

impl ProgressStore {
    pub fn new(ranks: usize) -> Self {
        ProgressStore {
            rows: Vec::new(),
            ranks: ranks.max(1),
        }
    }

    /// Upsert slot 0 of the row for `id`, creating the row (sized to the
    /// known rank count, all slots unset) if needed.
    pub fn add_local_progress(&mut self, id: ObjectId, text: &str, fraction: f64) {
        self.upsert(0, id, text, fraction);
    }

    /// Upsert slot `rank`, growing the row if this rank was unknown;
    /// intervening slots stay unset.
    pub fn add_remote_progress(&mut self, rank: Rank, id: ObjectId, text: &str, fraction: f64) {
        self.upsert(rank, id, text, fraction);
    }

    fn upsert(&mut self, slot: usize, id: ObjectId, text: &str, fraction: f64) {
        let index = match self.rows.iter().position(|r| r.object_id == id) {
            Some(i) => i,
            None => {
                self.rows.push(ProgressRow::new(id, self.ranks));
                self.rows.len() - 1
            }
        };
        self.rows[index].set(slot, text, fraction);
    }

    /// Deliver the next reading: scan rows in insertion order and report
    /// the minimum live slot of the first row that has one.
    ///
    /// Non-idempotent: a consumed reading at or above 1.0 resets its slot,
    /// and a fully drained row is removed.
    pub fn try_get_progress(&mut self) -> Option<ProgressReading> {
        let (index, slot) = self
            .rows
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.min_live_slot().map(|s| (i, s)))?;
        let row = &mut self.rows[index];
        let fraction = row.progress[slot];
        let reading = ProgressReading {
            object_id: row.object_id,
            text: row.text[slot].clone(),
            fraction,
        };
        if fraction >= 1.0 {
            row.progress[slot] = NO_READING;
        }
        if row.drained() {
            self.rows.remove(index);
        }
        Some(reading)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.rows.iter().any(|r| r.object_id == id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimum_wins_across_ranks() {
        let mut store = ProgressStore::new(3);
        store.add_local_progress(42, "Filter A", 0.2);
        store.add_remote_progress(1, 42, "Filter A", 0.5);
        store.add_remote_progress(2, 42, "Filter A", 0.1);
        let r = store.try_get_progress().unwrap();
        assert_eq!(
            r,
            ProgressReading {
                object_id: 42,
                text: "Filter A".to_string(),
                fraction: 0.1
            }
        );
    }

    #[test]
    fn reading_never_exceeds_minimum_live_slot() {
        let mut store = ProgressStore::new(4);
        store.add_local_progress(7, "a", 0.9);
        store.add_remote_progress(3, 7, "b", 0.3);
        for _ in 0..5 {
            let r = store.try_get_progress().unwrap();
            assert!(r.fraction <= 0.3);
        }
    }

    #[test]
    fn hundred_percent_is_reported_once_per_slot() {
        let mut store = ProgressStore::new(1);
        store.add_local_progress(1, "done", 1.0);
        let r = store.try_get_progress().unwrap();
        assert_eq!(r.fraction, 1.0);
        // The slot was reset; with no other live slot the row is gone.
        assert!(store.try_get_progress().is_none());
        assert!(!store.contains(1));
        // A new report revives tracking.
        store.add_local_progress(1, "again", 0.5);
        assert_eq!(store.try_get_progress().unwrap().fraction, 0.5);
    }

    #[test]
    fn row_is_removed_only_when_every_slot_drained() {
        let mut store = ProgressStore::new(2);
        store.add_local_progress(5, "x", 1.0);
        store.add_remote_progress(1, 5, "y", 0.4);
        // Minimum is the live rank-1 slot, so the completed slot 0 is not
        // consumed yet and the row stays.
        assert_eq!(store.try_get_progress().unwrap().fraction, 0.4);
        store.add_remote_progress(1, 5, "y", 1.0);
        assert_eq!(store.try_get_progress().unwrap().fraction, 1.0);
        // Slot 1 reset, slot 0 still holds its 1.0 reading.
        assert_eq!(store.try_get_progress().unwrap().fraction, 1.0);
        assert!(store.is_empty());
    }

    #[test]
    fn rows_drain_in_registration_order() {
        let mut store = ProgressStore::new(1);
        store.add_local_progress(10, "first", 0.5);
        store.add_local_progress(20, "second", 0.1);
        assert_eq!(store.try_get_progress().unwrap().object_id, 10);
        // Completing the first row unmasks the second.
        store.add_local_progress(10, "first", 1.0);
        assert_eq!(store.try_get_progress().unwrap().object_id, 10);
        assert_eq!(store.try_get_progress().unwrap().object_id, 20);
    }

    #[test]
    fn remote_rank_beyond_known_count_grows_the_row() {
        let mut store = ProgressStore::new(2);
        store.add_remote_progress(5, 9, "late join", 0.7);
        let r = store.try_get_progress().unwrap();
        assert_eq!(r.fraction, 0.7);
        assert_eq!(r.text, "late join");
    }

    #[test]
    fn empty_store_yields_nothing() {
        let mut store = ProgressStore::new(3);
        assert!(store.try_get_progress().is_none());
        assert!(store.is_empty());
    }
}
