// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp::{self, max};

use fvm_shared::bigint::{BigInt, Integer};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::StoragePower;
use lazy_static::lazy_static;
use num_traits::Zero;

use stor_actors_runtime::network::EPOCHS_IN_DAY;
use stor_actors_runtime::reward::math::PRECISION;
use stor_actors_runtime::reward::{smooth, FilterEstimate};
use stor_actors_runtime::EXPECTED_LEADERS_PER_EPOCH;

/// Projection period of expected sector block reward for deposit required to pre-commit a sector.
/// This deposit is lost if the pre-commitment is not timely followed up by a commitment proof.
const PRE_COMMIT_DEPOSIT_FACTOR: u64 = 20;

/// Projection period of expected sector block rewards for storage pledge required to commit a sector.
/// This pledge is lost if a sector is terminated before its full committed lifetime.
pub const INITIAL_PLEDGE_FACTOR: u64 = 20;

pub const PRE_COMMIT_DEPOSIT_PROJECTION_PERIOD: ChainEpoch =
    (PRE_COMMIT_DEPOSIT_FACTOR as ChainEpoch) * EPOCHS_IN_DAY;
pub const INITIAL_PLEDGE_PROJECTION_PERIOD: ChainEpoch =
    (INITIAL_PLEDGE_FACTOR as ChainEpoch) * EPOCHS_IN_DAY;

lazy_static! {
    /// Multiplier of share of circulating money supply for consensus pledge required to commit a sector.
    /// This pledge is lost if a sector is terminated before its full committed lifetime.
    pub static ref INITIAL_PLEDGE_LOCK_TARGET: (BigInt, BigInt) = (BigInt::from(3), BigInt::from(10));
}

/// Projection period of expected daily sector block reward penalised when a fault is declared "on time".
/// This guarantees that a miner pays back at least the expected block reward earned since the last successful PoSt.
/// The network conservatively assumes the sector was faulty since the last time it was proven.
/// This penalty is currently overly punitive for continued faults.
/// FF = BR(t, DeclaredFaultProjectionPeriod)
const DECLARED_FAULT_FACTOR_NUM: i64 = 214;
const DECLARED_FAULT_FACTOR_DENOM: i64 = 100;
pub const DECLARED_FAULT_PROJECTION_PERIOD: ChainEpoch =
    (EPOCHS_IN_DAY * DECLARED_FAULT_FACTOR_NUM) / DECLARED_FAULT_FACTOR_DENOM;

/// Projection period of expected daily sector block reward penalised for faults
/// that have not been declared in advance.
/// This fee is higher than the declared-fault fee for two reasons:
/// (1) it guarantees that a miner is incentivized to declare a fault early
/// (2) a miner storing less than (1-spacegap) of a sector, not declaring it as
/// faulty and hoping to get challenged on the stored parts would on expectation
/// not earn positive rewards.
/// SP = BR(t, UndeclaredFaultProjectionPeriod)
pub const UNDECLARED_FAULT_PROJECTION_PERIOD: ChainEpoch = 5 * EPOCHS_IN_DAY;

/// Maximum number of days of BR a terminated sector can be penalized
pub const TERMINATION_LIFETIME_CAP: ChainEpoch = 70;

/// Number of whole per-winner rewards covered by consensus fault penalty
const CONSENSUS_FAULT_FACTOR: u64 = 5;

/// This is the BR(t) value of the given sector for the current epoch.
/// It is the expected reward this sector would pay out over a t-day period.
/// BR(t) = CurrEpochReward(t) * SectorQualityAdjustedPower * EpochsInDay / TotalNetworkQualityAdjustedPower(t)
pub fn expected_reward_for_power(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
    projection_duration: ChainEpoch,
) -> TokenAmount {
    let network_qa_power_smoothed = network_qa_power_estimate.estimate();

    if network_qa_power_smoothed.is_zero() {
        return TokenAmount::from_atto(reward_estimate.estimate());
    }

    let expected_reward_for_proving_period = smooth::extrapolated_cum_sum_of_ratio(
        projection_duration,
        0,
        reward_estimate,
        network_qa_power_estimate,
    );
    let br128 = qa_sector_power * expected_reward_for_proving_period; // Q.0 * Q.128 => Q.128
    let br = br128 >> PRECISION;

    // negative BR is clamped at 0
    TokenAmount::from_atto(max(br, BigInt::zero()))
}

/// This is the FF(t) penalty for a sector expected to be in the fault state either because the
/// fault was declared or because it has been previously detected by the network.
/// FF(t) = DeclaredFaultFactor * BR(t)
pub fn pledge_penalty_for_declared_fault(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        DECLARED_FAULT_PROJECTION_PERIOD,
    )
}

/// This is the SP(t) penalty for a newly faulty sector that has not been declared.
/// SP(t) = UndeclaredFaultFactor * BR(t)
pub fn pledge_penalty_for_undeclared_fault(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        UNDECLARED_FAULT_PROJECTION_PERIOD,
    )
}

/// Penalty to locked pledge collateral for the termination of a sector before scheduled expiry.
/// SectorAge is the time between the sector's activation and termination.
/// replaced_day_reward and replaced_sector_age are the day reward and age of the replaced sector
/// in a capacity upgrade. They must be zero if no upgrade occurred.
#[allow(clippy::too_many_arguments)]
pub fn pledge_penalty_for_termination(
    day_reward: &TokenAmount,
    sector_age: ChainEpoch,
    twenty_day_reward_at_activation: &TokenAmount,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
    reward_estimate: &FilterEstimate,
    replaced_day_reward: &TokenAmount,
    replaced_sector_age: ChainEpoch,
) -> TokenAmount {
    // max(SP(t), BR(StartEpoch, 20d) + BR(StartEpoch, 1d) * min(SectorAgeInDays, 70))
    // and sectorAgeInDays = sectorAge / EpochsInDay
    let lifetime_cap = TERMINATION_LIFETIME_CAP * EPOCHS_IN_DAY;
    let capped_sector_age = cmp::min(sector_age, lifetime_cap);

    // expected reward for lifetime of new sector (epochs*AttoFIL/day)
    let mut expected_reward = day_reward * capped_sector_age;

    // if lifetime under cap and this sector replaced capacity, add expected reward for old sector's lifetime up to cap
    let relevant_replaced_age = cmp::min(replaced_sector_age, lifetime_cap - capped_sector_age);
    expected_reward += replaced_day_reward * relevant_replaced_age;

    cmp::max(
        pledge_penalty_for_undeclared_fault(
            reward_estimate,
            network_qa_power_estimate,
            qa_sector_power,
        ),
        twenty_day_reward_at_activation
            + TokenAmount::from_atto(expected_reward.atto().div_floor(&BigInt::from(EPOCHS_IN_DAY))),
    )
}

/// Computes the PreCommit deposit given sector qa weight and current network conditions.
/// PreCommit Deposit = BR(PreCommitDepositProjectionPeriod)
pub fn pre_commit_deposit_for_power(
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    qa_sector_power: &StoragePower,
) -> TokenAmount {
    expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_sector_power,
        PRE_COMMIT_DEPOSIT_PROJECTION_PERIOD,
    )
}

/// Computes the pledge requirement for committing new quality-adjusted power to the network, given
/// the current network total and baseline power, per-epoch reward, and circulating token supply.
/// The pledge comprises two parts:
/// - storage pledge, aka IP base: a multiple of the reward expected to be earned by newly-committed power
/// - pledge share, aka additional IP: a pro-rata fraction of the circulating money supply
///
/// IP = IPBase(t) + AdditionalIP(t)
/// IPBase(t) = BR(t, InitialPledgeProjectionPeriod)
/// AdditionalIP(t) = LockTarget(t)*PledgeShare(t)
/// LockTarget = (LockTargetFactorNum / LockTargetFactorDenom) * FILCirculatingSupply(t)
/// PledgeShare(t) = sectorQAPower / max(BaselinePower(t), NetworkQAPower(t))
pub fn initial_pledge_for_power(
    qa_power: &StoragePower,
    baseline_power: &StoragePower,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    circulating_supply: &TokenAmount,
) -> TokenAmount {
    let ip_base = expected_reward_for_power(
        reward_estimate,
        network_qa_power_estimate,
        qa_power,
        INITIAL_PLEDGE_PROJECTION_PERIOD,
    );

    let lock_target_num = &INITIAL_PLEDGE_LOCK_TARGET.0 * circulating_supply.atto();
    let lock_target_denom = &INITIAL_PLEDGE_LOCK_TARGET.1;
    let pledge_share_num = qa_power;
    let network_qa_power = network_qa_power_estimate.estimate();

    // use qa_power in case others are zero
    let pledge_share_denom = cmp::max(cmp::max(&network_qa_power, baseline_power), qa_power);

    let additional_ip_num = lock_target_num * pledge_share_num;
    let additional_ip_denom = lock_target_denom * pledge_share_denom;
    let additional_ip = additional_ip_num.div_floor(&additional_ip_denom);

    ip_base + TokenAmount::from_atto(additional_ip)
}

pub fn consensus_fault_penalty(this_epoch_reward: TokenAmount) -> TokenAmount {
    (this_epoch_reward * CONSENSUS_FAULT_FACTOR).div_floor(EXPECTED_LEADERS_PER_EPOCH)
}
