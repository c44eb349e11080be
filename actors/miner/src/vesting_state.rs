// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::iter;

use fvm_ipld_encoding::tuple::*;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use itertools::{EitherOrBoth, Itertools};
use num_traits::Zero;

use super::{QuantSpec, VestSpec};

/// Represents miner funds that will vest at the given epoch.
#[derive(Debug, Serialize_tuple, Deserialize_tuple, Clone, PartialEq, Eq)]
pub struct VestingFund {
    pub epoch: ChainEpoch,
    pub amount: TokenAmount,
}

/// Represents the vesting table state for the miner.
/// It is a slice of (VestingEpoch, VestingAmount).
/// The slice will always be sorted by the VestingEpoch.
#[derive(Debug, Serialize_tuple, Deserialize_tuple, Default, Clone, PartialEq, Eq)]
pub struct VestingFunds {
    pub funds: Vec<VestingFund>,
}

impl VestingFunds {
    pub fn new() -> Self {
        Default::default()
    }

    /// Unlocks all vesting funds that have vested before the provided epoch.
    /// Returns the amount unlocked.
    pub fn unlock_vested_funds(&mut self, current_epoch: ChainEpoch) -> TokenAmount {
        // Short-circuit to avoid a rewrite of the table when nothing has vested.
        match self.funds.first() {
            Some(fund) if fund.epoch < current_epoch => (),
            _ => return TokenAmount::zero(),
        }

        let i = self
            .funds
            .iter()
            .position(|fund| fund.epoch >= current_epoch)
            .unwrap_or(self.funds.len());

        self.funds.drain(..i).map(|fund| fund.amount).sum()
    }

    /// Adds locked funds and unlocks everything that has already vested.
    pub fn add_locked_funds(
        &mut self,
        current_epoch: ChainEpoch,
        vesting_sum: &TokenAmount,
        proving_period_start: ChainEpoch,
        spec: &VestSpec,
    ) {
        // Quantization is aligned with when regular cron will be invoked, in the last epoch of deadlines.
        let vest_begin = current_epoch + spec.initial_delay; // Nothing unlocks here, this is just the start of the clock.
        let mut vested_so_far = TokenAmount::zero();

        let quant = QuantSpec { unit: spec.quantization, offset: proving_period_start };

        let mut epoch = vest_begin;

        // The release schedule is a linear ramp from `vest_begin`, quantized to
        // reduce the number of table entries.
        let new_funds = iter::from_fn(|| {
            if vested_so_far >= *vesting_sum {
                return None;
            }

            epoch += spec.step_duration;

            let vest_epoch = quant.quantize_up(epoch);

            let elapsed = vest_epoch - vest_begin;
            let target_vest = if elapsed < spec.vest_period {
                // Linear vesting
                (vesting_sum * elapsed).div_floor(spec.vest_period)
            } else {
                vesting_sum.clone()
            };

            let vest_this_time = &target_vest - &vested_so_far;
            vested_so_far = target_vest;

            Some(VestingFund { epoch: vest_epoch, amount: vest_this_time })
        });

        // Take the old funds array and replace it with a new one.
        let old_funds = std::mem::take(&mut self.funds);

        // Fill back in the funds array, merging existing and new schedule.
        self.funds = old_funds
            .into_iter()
            .merge_join_by(new_funds, |a, b| a.epoch.cmp(&b.epoch))
            .map(|item| match item {
                EitherOrBoth::Left(a) => a,
                EitherOrBoth::Right(b) => b,
                EitherOrBoth::Both(a, b) => {
                    VestingFund { epoch: a.epoch, amount: a.amount + b.amount }
                }
            })
            .collect();
    }

    /// Unlocks globally unvested funds, drawing from entries in vesting-epoch
    /// order up to at most the specified target. Returns the amount unlocked.
    pub fn unlock_unvested_funds(
        &mut self,
        current_epoch: ChainEpoch,
        target: &TokenAmount,
    ) -> TokenAmount {
        let mut amount_unlocked = TokenAmount::zero();
        let mut last_index_to_remove = None;
        let mut start_index_for_remove = 0;

        // Retain funds that should have vested and remove unvested funds.
        for (i, fund) in self.funds.iter_mut().enumerate() {
            if amount_unlocked >= *target {
                break;
            }

            if fund.epoch >= current_epoch {
                let unlock_amount = std::cmp::min(target - &amount_unlocked, fund.amount.clone());
                amount_unlocked += &unlock_amount;
                let new_amount = &fund.amount - &unlock_amount;

                if new_amount.is_zero() {
                    last_index_to_remove = Some(i);
                } else {
                    fund.amount = new_amount;
                }
            } else if start_index_for_remove == i {
                start_index_for_remove = i + 1;
            }
        }

        // Remove fully unlocked entries.
        if let Some(end) = last_index_to_remove {
            self.funds.drain(start_index_for_remove..=end);
        }

        amount_unlocked
    }
}
