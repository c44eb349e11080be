// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use anyhow::anyhow;

use stor_actors_runtime::runtime::Policy;

use super::{Deadline, SectorOnChainInfo};

const fn div_rounding_up(dividend: u64, divisor: u64) -> u64 {
    dividend / divisor + (dividend % divisor > 0) as u64
}

struct DeadlineAssignmentInfo {
    index: usize,
    live_sectors: u64,
    total_sectors: u64,
}

impl DeadlineAssignmentInfo {
    fn partitions_after_assignment(&self, partition_size: u64) -> u64 {
        div_rounding_up(
            self.total_sectors + 1, // after assignment
            partition_size,
        )
    }

    fn compact_partitions_after_assignment(&self, partition_size: u64) -> u64 {
        div_rounding_up(
            self.live_sectors + 1, // after assignment
            partition_size,
        )
    }

    fn is_full_now(&self, partition_size: u64) -> bool {
        self.total_sectors % partition_size == 0
    }

    fn max_partitions_reached(&self, partition_size: u64, max_partitions: u64) -> bool {
        self.total_sectors >= partition_size * max_partitions
    }
}

fn cmp(a: &DeadlineAssignmentInfo, b: &DeadlineAssignmentInfo, partition_size: u64) -> Ordering {
    // When assigning partitions to deadlines, we're trying to optimize the
    // following:
    //
    // First, avoid increasing the maximum number of partitions in any
    // deadline, across all deadlines, after compaction. This would
    // necessitate buying a new GPU.
    //
    // Second, avoid forcing the miner to repeatedly compact partitions. A
    // miner would be "forced" to compact a partition when a the number of
    // partitions in any given deadline goes above the current maximum
    // number of partitions across all deadlines, and compacting that
    // deadline would then reduce the number of partitions, reducing the
    // maximum.
    //
    // At the moment, the only "optimal" solution for the first case is to
    // assign a sector to the deadline with the fewest number of sectors in a
    // non-full partition (or, if all partitions are full, the deadline with
    // the fewest partitions). This will cause partitions to fill up in
    // lock-step, more or less.
    //
    // The only "optimal" solution for the second case is the same. Given two
    // otherwise-equal deadlines, we want to fill up the deadline with the
    // fewest number of partitions after compaction.

    // Compare by compact partitions, then by total partitions after assignment.
    a.compact_partitions_after_assignment(partition_size)
        .cmp(&b.compact_partitions_after_assignment(partition_size))
        .then_with(|| {
            a.partitions_after_assignment(partition_size)
                .cmp(&b.partitions_after_assignment(partition_size))
        })
        // Then, break ties by preferring the deadline with a partially-filled
        // final partition (filling it up takes priority over opening a new one).
        .then_with(|| a.is_full_now(partition_size).cmp(&b.is_full_now(partition_size)))
        // Then prefer the deadline with the fewest live sectors, and finally
        // break remaining ties deterministically by deadline index.
        .then_with(|| a.live_sectors.cmp(&b.live_sectors))
        .then_with(|| a.total_sectors.cmp(&b.total_sectors))
        .then_with(|| a.index.cmp(&b.index))
}

/// Assigns partitions to deadlines, first filling partial partitions, then
/// adding new partitions to deadlines with the fewest live sectors.
/// Returns one vector per deadline (the same length as the input), naming the
/// sectors assigned to each.
pub fn assign_deadlines(
    policy: &Policy,
    max_partitions: u64,
    partition_size: u64,
    deadlines: &[Option<Deadline>],
    sectors: Vec<SectorOnChainInfo>,
) -> anyhow::Result<Vec<Vec<SectorOnChainInfo>>> {
    struct Entry {
        partition_size: u64,
        info: DeadlineAssignmentInfo,
    }

    impl PartialEq for Entry {
        fn eq(&self, other: &Self) -> bool {
            self.cmp(other) == Ordering::Equal
        }
    }

    impl Eq for Entry {}

    impl PartialOrd for Entry {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Entry {
        fn cmp(&self, other: &Self) -> Ordering {
            // we're using a max heap instead of a min heap, so flip the ordering
            cmp(&other.info, &self.info, self.partition_size)
        }
    }

    let mut heap: BinaryHeap<Entry> = deadlines
        .iter()
        .enumerate()
        .filter_map(|(index, deadline)| deadline.as_ref().map(|dl| (index, dl)))
        .map(|(index, deadline)| Entry {
            partition_size,
            info: DeadlineAssignmentInfo {
                index,
                live_sectors: deadline.live_sectors,
                total_sectors: deadline.total_sectors,
            },
        })
        .collect();

    assert!(!heap.is_empty());

    let mut changes = vec![Vec::new(); policy.wpost_period_deadlines as usize];

    for sector in sectors {
        // Peeking mutably re-sifts the modified root when the guard drops,
        // keeping the heap ordered for the next sector.
        let mut entry = heap.peek_mut().unwrap();
        let info = &mut entry.info;

        if info.max_partitions_reached(partition_size, max_partitions) {
            return Err(anyhow!(
                "max partitions limit {} reached for all deadlines",
                max_partitions
            ));
        }

        changes[info.index].push(sector);
        info.live_sectors += 1;
        info.total_sectors += 1;
    }

    Ok(changes)
}
