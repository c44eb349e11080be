// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::BTreeSet;

use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_shared::econ::TokenAmount;

use stor_actors_runtime::runtime::Policy;
use stor_actors_runtime::MessageAccumulator;

use crate::{PowerPair, Sectors, State};

/// An accumulation of the aggregate facts checked while traversing miner state.
pub struct StateSummary {
    pub live_power: PowerPair,
    pub faulty_power: PowerPair,
    pub live_sectors: u64,
    pub sector_count: u64,
}

/// Checks the miner state invariants that can be verified from state alone,
/// accumulating any failures into the returned message accumulator.
pub fn check_state_invariants<BS: Blockstore>(
    policy: &Policy,
    state: &State,
    store: &BS,
    balance: &TokenAmount,
) -> (StateSummary, MessageAccumulator) {
    let acc = MessageAccumulator::default();

    // Balances.
    acc.require_no_error(state.check_balance_invariants(balance), "balance invariants broken");

    let mut live_power = PowerPair::zero();
    let mut faulty_power = PowerPair::zero();
    let mut live_sectors_count: u64 = 0;

    // All sectors in the sector store.
    let mut all_sector_numbers = BTreeSet::<u64>::new();
    let mut sector_count: u64 = 0;
    match Sectors::load(store, &state.sectors) {
        Ok(sectors) => {
            let ret = sectors.amt.for_each(|sector_number, sector| {
                all_sector_numbers.insert(sector_number);
                sector_count += 1;
                acc.require(
                    sector.sector_number == sector_number,
                    format!(
                        "sector {} is keyed under number {}",
                        sector.sector_number, sector_number
                    ),
                );
                Ok(())
            });
            acc.require_no_error(ret, "error iterating sectors");
        }
        Err(e) => acc.add(format!("error loading sectors: {e}")),
    }

    // Deadlines and partitions.
    let mut seen_sectors = BitField::new();
    match state.load_deadlines(store) {
        Ok(deadlines) => {
            acc.require(
                deadlines.due.len() as u64 == policy.wpost_period_deadlines,
                format!(
                    "expected {} deadlines, found {}",
                    policy.wpost_period_deadlines,
                    deadlines.due.len()
                ),
            );
            let ret = deadlines.for_each(store, |deadline_idx, deadline| {
                let acc = acc.with_prefix(format!("deadline {deadline_idx}: "));

                let mut deadline_live: u64 = 0;
                let mut deadline_total: u64 = 0;
                let mut deadline_faulty_power = PowerPair::zero();

                let partitions = deadline.partitions_amt(store)?;
                partitions.for_each(|partition_idx, partition| {
                    let acc = acc.with_prefix(format!("partition {partition_idx}: "));

                    acc.require_no_error(partition.validate_state(), "invalid partition state");

                    // A sector may appear in at most one partition.
                    acc.require(
                        !seen_sectors.contains_any(&partition.sectors),
                        "sectors already seen in another partition",
                    );
                    seen_sectors |= &partition.sectors;

                    let live = partition.live_sectors();
                    deadline_live += live.len();
                    deadline_total += partition.sectors.len();
                    deadline_faulty_power += &partition.faulty_power;

                    live_power += &partition.live_power;
                    faulty_power += &partition.faulty_power;
                    live_sectors_count += live.len();

                    Ok(())
                })?;

                acc.require(
                    deadline.live_sectors == deadline_live,
                    format!(
                        "deadline live sectors {} != partition sum {}",
                        deadline.live_sectors, deadline_live
                    ),
                );
                acc.require(
                    deadline.total_sectors == deadline_total,
                    format!(
                        "deadline total sectors {} != partition sum {}",
                        deadline.total_sectors, deadline_total
                    ),
                );
                acc.require(
                    deadline.faulty_power == deadline_faulty_power,
                    "deadline faulty power does not match partition sum",
                );

                Ok(())
            });
            acc.require_no_error(ret, "error iterating deadlines");
        }
        Err(e) => acc.add(format!("error loading deadlines: {e}")),
    }

    // Every partition-assigned sector must exist in the store, and vice versa
    // (sectors are only deleted when their partition is compacted).
    for sector_number in seen_sectors.iter() {
        acc.require(
            all_sector_numbers.contains(&sector_number),
            format!("partition sector {sector_number} missing from sector store"),
        );
    }

    (
        StateSummary {
            live_power,
            faulty_power,
            live_sectors: live_sectors_count,
            sector_count,
        },
        acc,
    )
}
