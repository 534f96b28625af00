use std::collections::{BTreeMap, VecDeque};

use rust_decimal::Decimal;

/// How many gapped diffs a book retains while waiting for continuity.
const GAP_BUFFER: usize = 3;

/// One incremental update from a venue that streams diffs.
///
/// Continuity contract: the Nth diff's `id` must equal the previous
/// applied id + 1.
#[derive(Debug, Clone)]
pub struct BookDiff {
    pub id: u64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Diff (and possibly buffered successors) applied.
    Applied,
    /// Gap ahead of this diff; held in the buffer.
    Buffered,
    /// Already covered by the current book; dropped.
    Ignored,
    /// Continuity cannot be rebuilt. The caller must resubscribe,
    /// which re-snapshots. The book is reset.
    Resync,
}

/// Per-connection orderbook: one sorted map per side.
///
/// Owned exclusively by the collector that feeds it; nothing here is
/// shared or locked. Only the top of each side ever leaves this struct
/// (projected into a Quote).
#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
    initialized: bool,
    pending: VecDeque<BookDiff>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole book from a venue snapshot.
    pub fn apply_snapshot(
        &mut self,
        last_update_id: u64,
        bids: &[(Decimal, Decimal)],
        asks: &[(Decimal, Decimal)],
    ) {
        self.bids.clear();
        self.asks.clear();
        self.pending.clear();
        for &(price, volume) in bids {
            if !volume.is_zero() {
                self.bids.insert(price, volume);
            }
        }
        for &(price, volume) in asks {
            if !volume.is_zero() {
                self.asks.insert(price, volume);
            }
        }
        self.last_update_id = last_update_id;
        self.initialized = true;
    }

    /// Applies one incremental update, enforcing id continuity.
    ///
    /// A zero volume deletes the level; anything else upserts it.
    pub fn apply_diff(&mut self, diff: BookDiff) -> ApplyOutcome {
        if !self.initialized {
            // Diff raced ahead of the snapshot; the snapshot that is
            // still in flight supersedes it.
            return ApplyOutcome::Ignored;
        }
        if diff.id <= self.last_update_id {
            return ApplyOutcome::Ignored;
        }
        if diff.id == self.last_update_id + 1 {
            self.apply_levels(&diff);
            self.last_update_id = diff.id;
            self.drain_pending();
            return ApplyOutcome::Applied;
        }

        // Gap: hold on to the diff and wait for the hole to fill.
        self.pending.push_back(diff);
        if self.pending.len() > GAP_BUFFER {
            self.reset();
            return ApplyOutcome::Resync;
        }
        ApplyOutcome::Buffered
    }

    /// Applies buffered diffs that have become contiguous.
    fn drain_pending(&mut self) {
        loop {
            let next = self.last_update_id + 1;
            // Anything the book has since covered is dead weight.
            self.pending.retain(|d| d.id >= next);

            let Some(pos) = self.pending.iter().position(|d| d.id == next) else {
                return;
            };
            let diff = self.pending.remove(pos).expect("position just found");
            self.apply_levels(&diff);
            self.last_update_id = diff.id;
        }
    }

    fn apply_levels(&mut self, diff: &BookDiff) {
        for &(price, volume) in &diff.bids {
            if volume.is_zero() {
                self.bids.remove(&price);
            } else {
                self.bids.insert(price, volume);
            }
        }
        for &(price, volume) in &diff.asks {
            if volume.is_zero() {
                self.asks.remove(&price);
            } else {
                self.asks.insert(price, volume);
            }
        }
    }

    fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.pending.clear();
        self.initialized = false;
        self.last_update_id = 0;
    }

    /// Replaces one full side. Used by venues that stream each side as
    /// a complete list instead of diffs.
    pub fn replace_bids(&mut self, levels: &[(Decimal, Decimal)]) {
        self.bids.clear();
        for &(price, volume) in levels {
            if !volume.is_zero() {
                self.bids.insert(price, volume);
            }
        }
        self.initialized = true;
    }

    pub fn replace_asks(&mut self, levels: &[(Decimal, Decimal)]) {
        self.asks.clear();
        for &(price, volume) in levels {
            if !volume.is_zero() {
                self.asks.insert(price, volume);
            }
        }
        self.initialized = true;
    }

    /// Highest bid.
    pub fn top_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(p, v)| (*p, *v))
    }

    /// Lowest ask.
    pub fn top_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, v)| (*p, *v))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn diff(id: u64, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) -> BookDiff {
        BookDiff { id, bids, asks }
    }

    fn snapshot_book() -> OrderBook {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            100,
            &[(dec!(2000), dec!(10)), (dec!(1999), dec!(4))],
            &[(dec!(2001), dec!(8)), (dec!(2002), dec!(3))],
        );
        book
    }

    #[test]
    fn snapshot_projects_top_of_each_side() {
        let book = snapshot_book();
        assert_eq!(book.top_bid(), Some((dec!(2000), dec!(10))));
        assert_eq!(book.top_ask(), Some((dec!(2001), dec!(8))));
    }

    #[test]
    fn zero_volume_deletes_level() {
        let mut book = snapshot_book();
        let out = book.apply_diff(diff(
            101,
            vec![(dec!(2000), dec!(0)), (dec!(1999.5), dec!(7))],
            vec![],
        ));
        assert_eq!(out, ApplyOutcome::Applied);
        // 2000 removed, 1999.5 inserted above 1999.
        assert_eq!(book.top_bid(), Some((dec!(1999.5), dec!(7))));
        assert_eq!(book.last_update_id(), 101);
    }

    #[test]
    fn out_of_order_diffs_rebuild_through_buffer() {
        let mut book = snapshot_book();

        // 103 and 102 swapped in flight.
        assert_eq!(
            book.apply_diff(diff(103, vec![(dec!(1998), dec!(1))], vec![])),
            ApplyOutcome::Buffered
        );
        assert_eq!(
            book.apply_diff(diff(102, vec![(dec!(2000), dec!(11))], vec![])),
            ApplyOutcome::Buffered
        );
        assert_eq!(
            book.apply_diff(diff(101, vec![], vec![(dec!(2001), dec!(9))])),
            ApplyOutcome::Applied
        );

        assert_eq!(book.last_update_id(), 103);
        assert_eq!(book.top_bid(), Some((dec!(2000), dec!(11))));
        assert_eq!(book.top_ask(), Some((dec!(2001), dec!(9))));
    }

    #[test]
    fn unfillable_gap_forces_resync() {
        let mut book = snapshot_book();

        // 102 is lost for good; 103..106 can never become contiguous.
        assert_eq!(book.apply_diff(diff(103, vec![], vec![])), ApplyOutcome::Buffered);
        assert_eq!(book.apply_diff(diff(104, vec![], vec![])), ApplyOutcome::Buffered);
        assert_eq!(book.apply_diff(diff(105, vec![], vec![])), ApplyOutcome::Buffered);
        assert_eq!(book.apply_diff(diff(106, vec![], vec![])), ApplyOutcome::Resync);

        assert!(!book.is_initialized());
        assert_eq!(book.top_bid(), None);
    }

    #[test]
    fn stale_and_pre_snapshot_diffs_are_ignored() {
        let mut book = OrderBook::new();
        assert_eq!(
            book.apply_diff(diff(5, vec![(dec!(1), dec!(1))], vec![])),
            ApplyOutcome::Ignored
        );

        let mut book = snapshot_book();
        assert_eq!(book.apply_diff(diff(100, vec![], vec![])), ApplyOutcome::Ignored);
        assert_eq!(book.apply_diff(diff(40, vec![], vec![])), ApplyOutcome::Ignored);
    }

    #[test]
    fn diffs_equal_resnapshot_of_same_state() {
        // Snapshot + contiguous diffs must land on the same top as a
        // fresh snapshot of the final state.
        let mut incremental = snapshot_book();
        incremental.apply_diff(diff(101, vec![(dec!(2000), dec!(0))], vec![]));
        incremental.apply_diff(diff(102, vec![(dec!(1999), dec!(7))], vec![(dec!(2001), dec!(0))]));

        let mut fresh = OrderBook::new();
        fresh.apply_snapshot(102, &[(dec!(1999), dec!(7))], &[(dec!(2002), dec!(3))]);

        assert_eq!(incremental.top_bid(), fresh.top_bid());
        assert_eq!(incremental.top_ask(), fresh.top_ask());
    }

    #[test]
    fn side_replacement_for_split_channel_venues() {
        let mut book = OrderBook::new();
        book.replace_bids(&[(dec!(2000), dec!(10)), (dec!(1999), dec!(4))]);
        assert_eq!(book.top_ask(), None);

        book.replace_asks(&[(dec!(2001), dec!(8))]);
        assert_eq!(book.top_bid(), Some((dec!(2000), dec!(10))));
        assert_eq!(book.top_ask(), Some((dec!(2001), dec!(8))));

        // Next push replaces the side wholesale.
        book.replace_bids(&[(dec!(1998), dec!(2))]);
        assert_eq!(book.top_bid(), Some((dec!(1998), dec!(2))));
    }
}
