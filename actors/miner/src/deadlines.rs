// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::anyhow;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::SectorNumber;
use stor_actors_runtime::runtime::Policy;

use super::{DeadlineInfo, Deadlines, Partition};
use crate::new_deadline_info;

/// Returns deadline-related calculations for a deadline in some proving period and the current epoch.
pub fn new_deadline_info_from_offset_and_epoch(
    policy: &Policy,
    period_start_seed: ChainEpoch,
    curr_epoch: ChainEpoch,
) -> DeadlineInfo {
    let q = crate::QuantSpec { unit: policy.wpost_proving_period, offset: period_start_seed };
    let current_period_start = q.quantize_down(curr_epoch);
    let current_deadline_idx =
        ((curr_epoch - current_period_start) / policy.wpost_challenge_window) as u64;
    new_deadline_info(policy, current_period_start, current_deadline_idx, curr_epoch)
}

/// Computes deadline information for a fault or recovery declaration.
/// If the deadline has not yet elapsed, the declaration is taken as being for the current proving period.
/// If the deadline has elapsed, it's instead taken as being for the next proving period after the current epoch.
pub fn declaration_deadline_info(
    policy: &Policy,
    period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> anyhow::Result<DeadlineInfo> {
    if deadline_idx >= policy.wpost_period_deadlines {
        return Err(anyhow!(
            "invalid deadline {}, must be < {}",
            deadline_idx,
            policy.wpost_period_deadlines
        ));
    }

    let deadline =
        new_deadline_info(policy, period_start, deadline_idx, current_epoch).next_not_elapsed();
    Ok(deadline)
}

/// Checks that a fault or recovery declaration at a specific deadline is outside the exclusion window for the deadline.
pub fn validate_fr_declaration_deadline(deadline: &DeadlineInfo) -> anyhow::Result<()> {
    if deadline.fault_cutoff_passed() {
        Err(anyhow!("late fault or recovery declaration"))
    } else {
        Ok(())
    }
}

/// Validates that a partition contains the given sectors.
pub fn validate_partition_contains_sectors(
    partition: &Partition,
    sectors: &fvm_ipld_bitfield::BitField,
) -> anyhow::Result<()> {
    // Check that the declared sectors are actually assigned to the partition.
    if partition.sectors.contains_all(sectors) {
        Ok(())
    } else {
        Err(anyhow!("not all sectors are assigned to the partition"))
    }
}

/// Determines whether a deadline may be mutated: it must be at least one challenge
/// window before the deadline's next open.
pub fn deadline_is_mutable(
    policy: &Policy,
    proving_period_start: ChainEpoch,
    deadline_idx: u64,
    current_epoch: ChainEpoch,
) -> bool {
    // Get the next non-elapsed deadline (i.e., the next time we care about
    // mutations to the deadline).
    let deadline_info = new_deadline_info(policy, proving_period_start, deadline_idx, current_epoch)
        .next_not_elapsed();

    // Ensure that the current epoch is at least one challenge window before
    // that deadline opens.
    current_epoch < deadline_info.open - policy.wpost_challenge_window
}

/// Locates the deadline and partition to which a sector is currently assigned.
pub fn find_sector<BS: Blockstore>(
    store: &BS,
    deadlines: &Deadlines,
    sector_number: SectorNumber,
) -> anyhow::Result<(u64, u64)> {
    for deadline_idx in 0..deadlines.due.len() {
        let deadline = deadlines.load_deadline(store, deadline_idx as u64)?;
        let partitions = deadline.partitions_amt(store)?;

        let mut partition_idx = None;

        partitions.for_each_while(|i, partition| {
            if partition.sectors.get(sector_number) {
                partition_idx = Some(i);
                Ok(false)
            } else {
                Ok(true)
            }
        })?;

        if let Some(partition_idx) = partition_idx {
            return Ok((deadline_idx as u64, partition_idx));
        }
    }

    Err(anyhow!("sector {} not due at any deadline", sector_number))
}
