use fvm_ipld_bitfield::BitField;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;

use stor_actor_miner::{
    pledge_penalty_for_termination, power_for_sectors, qa_power_for_sector, Actor, Method,
    TerminateSectorsParams, TerminationDeclaration,
};
use stor_actors_runtime::test_utils::*;

mod util;
use util::*;

const DEFAULT_SECTOR_EXPIRATION: u64 = 190;
const PERIOD_OFFSET: ChainEpoch = 658;

#[test]
fn removes_sector_with_correct_accounting() {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    rt.set_epoch(PERIOD_OFFSET + 1);

    h.construct_and_verify(&rt);

    let sectors = h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![]);
    let sector = &sectors[0];
    assert!(h.get_state(&rt).initial_pledge.is_positive());

    // Prove the sector once so it is fully active.
    let (dlidx, pidx) = h.find_sector(&rt, sector.sector_number);
    let dlinfo = h.advance_to_deadline(&rt, dlidx);
    let partitions =
        vec![stor_actor_miner::PoStPartition { index: pidx, skipped: BitField::new() }];
    h.submit_window_post(&rt, &dlinfo, partitions, sectors.clone(), PoStConfig::empty());
    h.advance_deadline(&rt, CronConfig::empty());

    // Now terminate it, expecting the termination fee to be burnt and the
    // pledge requirement released.
    let epoch = *rt.epoch.borrow();
    let sector_age = epoch - sector.activation;
    let sector_power = qa_power_for_sector(h.sector_size, sector);
    let expected_fee = pledge_penalty_for_termination(
        &sector.expected_day_reward,
        sector_age,
        &sector.expected_storage_pledge,
        &h.epoch_qa_power_smooth,
        &sector_power,
        &h.epoch_reward_smooth,
        &TokenAmount::zero(),
        0,
    );

    let mut sector_bf = BitField::new();
    sector_bf.set(sector.sector_number);

    let (power_delta, pledge_delta) = h.terminate_sectors(&rt, &sector_bf, expected_fee);
    assert_eq!(-power_for_sectors(h.sector_size, &sectors), power_delta);
    assert_eq!(-sector.initial_pledge.clone(), pledge_delta);

    // The sector is gone from the partition's live set, the pledge
    // requirement is released, and no early termination work remains.
    let state = h.get_state(&rt);
    assert!(state.initial_pledge.is_zero());
    assert!(state.early_terminations.is_empty());

    let partition = get_partition(&rt, &state, dlidx, pidx);
    assert!(partition.terminated.get(sector.sector_number));
    assert!(partition.live_sectors().is_empty());
    assert!(partition.faults.is_empty());

    h.check_state(&rt);
}

#[test]
fn cannot_terminate_a_faulty_unrecovered_sector_twice() {
    let mut h = ActorHarness::new(PERIOD_OFFSET);
    let rt = h.new_runtime();
    rt.set_balance(big_balance());
    rt.set_epoch(PERIOD_OFFSET + 1);

    h.construct_and_verify(&rt);

    let sectors = h.commit_and_prove_sectors(&rt, 1, DEFAULT_SECTOR_EXPIRATION, vec![]);
    let sector = &sectors[0];

    let (dlidx, pidx) = h.find_sector(&rt, sector.sector_number);
    let dlinfo = h.advance_to_deadline(&rt, dlidx);
    let partitions =
        vec![stor_actor_miner::PoStPartition { index: pidx, skipped: BitField::new() }];
    h.submit_window_post(&rt, &dlinfo, partitions, sectors.clone(), PoStConfig::empty());
    h.advance_deadline(&rt, CronConfig::empty());

    let epoch = *rt.epoch.borrow();
    let sector_age = epoch - sector.activation;
    let sector_power = qa_power_for_sector(h.sector_size, sector);
    let expected_fee = pledge_penalty_for_termination(
        &sector.expected_day_reward,
        sector_age,
        &sector.expected_storage_pledge,
        &h.epoch_qa_power_smooth,
        &sector_power,
        &h.epoch_reward_smooth,
        &TokenAmount::zero(),
        0,
    );

    let mut sector_bf = BitField::new();
    sector_bf.set(sector.sector_number);
    h.terminate_sectors(&rt, &sector_bf, expected_fee);

    // Terminating the now-dead sector again fails: it is no longer live.
    rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, h.worker);
    rt.expect_validate_caller_addr(h.caller_addrs());

    let params = TerminateSectorsParams {
        terminations: vec![TerminationDeclaration {
            deadline: dlidx,
            partition: pidx,
            sectors: sector_bf,
        }],
    };
    let result = rt.call::<Actor>(Method::TerminateSectors as u64, ipld_block(&params));
    expect_abort(fvm_shared::error::ExitCode::USR_ILLEGAL_STATE, result);
    rt.reset();

    h.check_state(&rt);
}
