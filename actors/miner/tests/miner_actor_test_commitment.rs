use fvm_shared::clock::ChainEpoch;
use fvm_shared::error::ExitCode;
use num_traits::Zero;

use stor_actor_miner::{
    pre_commit_deposit_for_power, qa_power_for_weight, Actor, ExpirationQueue, Method,
};
use stor_actors_runtime::test_utils::*;
use stor_actors_runtime::DealWeight;

mod util;
use util::*;

// an expiration ~10 days greater than effective min expiration taking into account 30 days max
// between pre and prove commit
const DEFAULT_SECTOR_EXPIRATION: u64 = 190;

const PERIOD_OFFSET: ChainEpoch = 658;

#[test]
fn happy_path_commit_proves_and_activates_a_sector() {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    rt.set_epoch(PERIOD_OFFSET + 1);

    h.construct_and_verify(&rt);
    let deadline = h.get_deadline_info(&rt);

    // Commit a sector to the period end plus many whole periods.
    let precommit_epoch = *rt.epoch.borrow();
    let expiration =
        deadline.period_end() + DEFAULT_SECTOR_EXPIRATION as i64 * rt.policy.wpost_proving_period;

    let sector_no = 100;
    let params = h.make_pre_commit_params(sector_no, precommit_epoch - 1, expiration, vec![]);
    let precommit = h.pre_commit_sector(&rt, params);

    // The pre-commit deposit matches the projection for the sector's power.
    let duration = expiration - precommit_epoch;
    let qa_power = qa_power_for_weight(
        h.sector_size,
        duration,
        &DealWeight::zero(),
        &DealWeight::zero(),
    );
    let expected_deposit = pre_commit_deposit_for_power(
        &h.epoch_reward_smooth,
        &h.epoch_qa_power_smooth,
        &qa_power,
    );
    assert_eq!(expected_deposit, precommit.pre_commit_deposit);

    let state = h.get_state(&rt);
    assert!(state.pre_commit_deposits.is_positive());
    assert_eq!(expected_deposit, state.pre_commit_deposits);

    // Prove and confirm after the challenge delay has passed.
    h.advance_to_epoch_with_cron(&rt, precommit_epoch + rt.policy.pre_commit_challenge_delay + 1);
    let activation_epoch = *rt.epoch.borrow();

    let sector = h.prove_commit_sector_and_confirm(
        &rt,
        &precommit,
        h.make_prove_commit_params(sector_no),
    );

    // Pre-commit is consumed, the deposit returned, and the pledge locked.
    assert!(!h.has_precommit(&rt, sector_no));
    let state = h.get_state(&rt);
    assert!(state.pre_commit_deposits.is_zero());
    assert!(state.initial_pledge.is_positive());
    assert_eq!(sector.initial_pledge, state.initial_pledge);

    assert_eq!(activation_epoch, sector.activation);
    assert_eq!(expiration, sector.expiration);

    // The sector is assigned to exactly one deadline/partition, and its
    // expiration is scheduled at the quantized epoch for that deadline.
    let (dlidx, pidx) = h.find_sector(&rt, sector_no);
    let partition = get_partition(&rt, &state, dlidx, pidx);
    assert!(partition.sectors.get(sector_no));
    assert!(partition.unproven.get(sector_no));
    assert!(partition.faults.is_empty());

    let quant = state.quant_spec_for_deadline(&rt.policy, dlidx);
    let quantized_expiration = quant.quantize_up(expiration);

    let queue = ExpirationQueue::new(&rt.store, &partition.expirations_epochs, quant).unwrap();
    let entry = queue
        .amt
        .get(quantized_expiration as u64)
        .unwrap()
        .cloned()
        .expect("expected expiration set at quantized epoch");
    assert_bitfield_equals(&entry.on_time_sectors, &[sector_no]);
    assert!(entry.early_sectors.is_empty());
    assert_eq!(sector.initial_pledge, entry.on_time_pledge);

    h.check_state(&rt);
}

#[test]
fn rejects_pre_commit_of_duplicate_sector_number() {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    rt.set_epoch(PERIOD_OFFSET + 1);

    h.construct_and_verify(&rt);

    let sectors = h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![]);
    let sector_no = sectors[0].sector_number;

    // Attempt to pre-commit the same sector number again.
    let epoch = *rt.epoch.borrow();
    let deadline = h.get_deadline_info(&rt);
    let expiration =
        deadline.period_end() + DEFAULT_SECTOR_EXPIRATION as i64 * rt.policy.wpost_proving_period;
    let params = h.make_pre_commit_params(sector_no, epoch - 1, expiration, vec![]);

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    h.expect_query_network_info(&rt);
    rt.expect_validate_caller_addr(h.caller_addrs());

    let result = rt.call::<Actor>(Method::PreCommitSector as u64, ipld_block(&params));
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "already been allocated", result);
    rt.reset();
    h.check_state(&rt);
}

#[test]
fn rejects_expiration_below_minimum_lifetime() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    rt.set_epoch(PERIOD_OFFSET + 1);

    h.construct_and_verify(&rt);

    let epoch = *rt.epoch.borrow();
    // Total lifetime just under the minimum.
    let expiration = epoch + rt.policy.min_sector_expiration - 10;
    let params = h.make_pre_commit_params(100, epoch - 1, expiration, vec![]);

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    h.expect_query_network_info(&rt);
    rt.expect_validate_caller_addr(h.caller_addrs());

    let result = rt.call::<Actor>(Method::PreCommitSector as u64, ipld_block(&params));
    expect_abort(ExitCode::USR_ILLEGAL_ARGUMENT, result);
    rt.reset();
}

#[test]
fn rejects_pre_commit_with_stale_seal_randomness() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    let epoch = rt.policy.max_pre_commit_randomness_lookback + PERIOD_OFFSET + 10;
    rt.set_epoch(epoch);

    h.construct_and_verify(&rt);

    let deadline = h.get_deadline_info(&rt);
    let expiration =
        deadline.period_end() + DEFAULT_SECTOR_EXPIRATION as i64 * rt.policy.wpost_proving_period;

    let challenge = epoch - rt.policy.max_pre_commit_randomness_lookback - 1;
    let params = h.make_pre_commit_params(100, challenge, expiration, vec![]);

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    h.expect_query_network_info(&rt);
    rt.expect_validate_caller_addr(h.caller_addrs());

    let result = rt.call::<Actor>(Method::PreCommitSector as u64, ipld_block(&params));
    expect_abort_contains_message(ExitCode::USR_ILLEGAL_ARGUMENT, "too old", result);
    rt.reset();
}

#[test]
fn insufficient_balance_for_pre_commit_deposit_aborts() {
    let h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    // No balance at all.
    rt.set_epoch(PERIOD_OFFSET + 1);

    h.construct_and_verify(&rt);

    let epoch = *rt.epoch.borrow();
    let deadline = h.get_deadline_info(&rt);
    let expiration =
        deadline.period_end() + DEFAULT_SECTOR_EXPIRATION as i64 * rt.policy.wpost_proving_period;
    let params = h.make_pre_commit_params(100, epoch - 1, expiration, vec![]);

    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    h.expect_query_network_info(&rt);
    rt.expect_validate_caller_addr(h.caller_addrs());

    let result = rt.call::<Actor>(Method::PreCommitSector as u64, ipld_block(&params));
    expect_abort(ExitCode::USR_INSUFFICIENT_FUNDS, result);
    rt.reset();
}

#[test]
fn expired_pre_commit_is_cleaned_up_and_deposit_burnt() {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    rt.set_epoch(PERIOD_OFFSET + 1);

    h.construct_and_verify(&rt);

    let precommit_epoch = *rt.epoch.borrow();
    let deadline = h.get_deadline_info(&rt);
    let expiration =
        deadline.period_end() + DEFAULT_SECTOR_EXPIRATION as i64 * rt.policy.wpost_proving_period;
    let params = h.make_pre_commit_params(h.next_sector_no, precommit_epoch - 1, expiration, vec![]);
    let precommit = h.pre_commit_sector(&rt, params);
    h.next_sector_no += 1;

    // Advance past the maximum prove-commit duration without proving. The
    // cleanup sweep runs in a deadline cron after the expiry epoch, burning
    // the deposit.
    let expiry_epoch = precommit_epoch
        + stor_actor_miner::max_prove_commit_duration(&rt.policy, h.seal_proof_type).unwrap()
        + 1;

    let mut dlinfo = h.deadline(&rt);
    while dlinfo.last() < expiry_epoch {
        dlinfo = h.advance_deadline(&rt, CronConfig::empty());
    }
    // The cron at this deadline end performs the cleanup.
    let cfg = CronConfig {
        expired_precommit_penalty: precommit.pre_commit_deposit.clone(),
        ..Default::default()
    };
    h.advance_deadline(&rt, cfg);

    assert!(!h.has_precommit(&rt, precommit.info.sector_number));
    let state = h.get_state(&rt);
    assert!(state.pre_commit_deposits.is_zero());

    h.check_state(&rt);
}
