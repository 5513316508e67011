//! Time-bounded record cache.
//!
//! Records are kept ordered by `(time, block_number, log_index)`. Appending in
//! time order is O(1); late records are placed by binary search.

use rust_decimal::Decimal;
use std::collections::VecDeque;

/// One decoded on-chain occurrence carrying an amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Unix seconds of the block that carried the event.
    pub time: u64,
    pub amount: Decimal,
    pub block_number: u64,
    pub log_index: u64,
}

impl EventRecord {
    fn sort_key(&self) -> (u64, u64, u64) {
        (self.time, self.block_number, self.log_index)
    }
}

/// Sum and count over the records currently in a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aggregate {
    pub sum: Decimal,
    pub count: usize,
}

/// Rolling window over [`EventRecord`]s.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    window_secs: u64,
    records: VecDeque<EventRecord>,
}

impl RollingWindow {
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            records: VecDeque::new(),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    pub fn insert(&mut self, record: EventRecord) {
        let in_order = self
            .records
            .back()
            .map_or(true, |last| last.sort_key() <= record.sort_key());
        if in_order {
            self.records.push_back(record);
        } else {
            let key = record.sort_key();
            let pos = self.records.partition_point(|r| r.sort_key() <= key);
            self.records.insert(pos, record);
        }
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = EventRecord>) {
        for record in records {
            self.insert(record);
        }
    }

    /// Drop records with `time <= reference_time - window`.
    ///
    /// # Returns
    /// Number of records removed. Nothing is removed while
    /// `reference_time < window`.
    pub fn prune(&mut self, reference_time: u64) -> usize {
        let Some(cutoff) = reference_time.checked_sub(self.window_secs) else {
            return 0;
        };
        self.pop_through(cutoff)
    }

    /// Drop records with `time <= time`.
    pub fn retain_after(&mut self, time: u64) -> usize {
        self.pop_through(time)
    }

    fn pop_through(&mut self, time: u64) -> usize {
        let mut removed = 0;
        while self.records.front().is_some_and(|r| r.time <= time) {
            self.records.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn aggregate(&self) -> Aggregate {
        Aggregate {
            sum: self.records.iter().map(|r| r.amount).sum(),
            count: self.records.len(),
        }
    }

    /// Sum and count over records with `time <= time`. Later records stay
    /// in the window but are not counted.
    pub fn aggregate_until(&self, time: u64) -> Aggregate {
        let end = self.records.partition_point(|r| r.time <= time);
        Aggregate {
            sum: self.records.range(..end).map(|r| r.amount).sum(),
            count: end,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.records.iter()
    }
}
