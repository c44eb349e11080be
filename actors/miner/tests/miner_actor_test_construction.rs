use fvm_ipld_encoding::BytesDe;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use num_traits::Zero;

use stor_actor_miner::{Actor, Method, MinerConstructorParams, State};
use stor_actors_runtime::test_utils::*;
use stor_actors_runtime::INIT_ACTOR_ADDR;

mod util;
use util::*;

#[test]
fn simple_construction() {
    let h = ActorHarness::new(2222);
    let rt = h.new_runtime();

    h.construct_and_verify(&rt);

    let state: State = h.get_state(&rt);
    let info = state.get_info(&rt.store).unwrap();

    assert_eq!(h.owner, info.owner);
    assert_eq!(h.worker, info.worker);
    assert_eq!(h.control_addrs, info.control_addresses);
    assert_eq!(vec![0], info.peer_id);
    assert_eq!(h.seal_proof_type, info.seal_proof_type);
    assert_eq!(h.sector_size, info.sector_size);
    assert_eq!(h.partition_size, info.window_post_partition_sectors);
    assert_eq!(TokenAmount::zero(), state.pre_commit_deposits);
    assert_eq!(TokenAmount::zero(), state.locked_funds);
    assert_eq!(TokenAmount::zero(), state.initial_pledge);
    assert_eq!(TokenAmount::zero(), state.fee_debt);

    // The proving period start is the next period boundary from the construction
    // epoch, strictly in the future.
    assert_eq!(2222, state.proving_period_start);
    assert_eq!(0, state.current_deadline);
    assert!(state.early_terminations.is_empty());

    let deadlines = state.load_deadlines(&rt.store).unwrap();
    assert_eq!(rt.policy.wpost_period_deadlines as usize, deadlines.due.len());
    deadlines
        .for_each(&rt.store, |_, deadline| {
            assert_eq!(0, deadline.live_sectors);
            assert_eq!(0, deadline.total_sectors);
            assert!(deadline.post_submissions.is_empty());
            assert!(deadline.early_terminations.is_empty());
            Ok(())
        })
        .unwrap();

    h.check_state(&rt);
}

#[test]
fn control_addresses_are_resolved_during_construction() {
    let h = ActorHarness::new(2222);
    let rt = h.new_runtime();

    h.construct_and_verify(&rt);

    let (owner, worker, control_addrs) = h.get_control_addresses(&rt);
    assert_eq!(h.owner, owner);
    assert_eq!(h.worker, worker);
    assert_eq!(h.control_addrs, control_addrs);
}

#[test]
fn fails_if_control_addresses_exceeds_maximum_length() {
    let h = ActorHarness::new(100);
    let rt = h.new_runtime();

    let mut control_addrs = Vec::new();
    for i in 0..=rt.policy.max_control_addresses {
        control_addrs.push(Address::new_id(i as u64));
    }

    let params = MinerConstructorParams {
        owner: h.owner,
        worker: h.worker,
        control_addresses: control_addrs,
        seal_proof_type: h.seal_proof_type,
        peer_id: vec![0],
        multi_addresses: vec![],
    };

    rt.set_caller(*INIT_ACTOR_CODE_ID, INIT_ACTOR_ADDR);
    rt.expect_validate_caller_addr(vec![INIT_ACTOR_ADDR]);

    let result = rt.call::<Actor>(Method::Constructor as u64, ipld_block(&params));
    expect_abort(ExitCode::USR_ILLEGAL_ARGUMENT, result);
    rt.reset();
}

#[test]
fn fails_if_peer_id_too_large() {
    let h = ActorHarness::new(100);
    let rt = h.new_runtime();

    let params = MinerConstructorParams {
        owner: h.owner,
        worker: h.worker,
        control_addresses: vec![],
        seal_proof_type: h.seal_proof_type,
        peer_id: vec![0; rt.policy.max_peer_id_length + 1],
        multi_addresses: vec![],
    };

    rt.set_caller(*INIT_ACTOR_CODE_ID, INIT_ACTOR_ADDR);
    rt.expect_validate_caller_addr(vec![INIT_ACTOR_ADDR]);

    let result = rt.call::<Actor>(Method::Constructor as u64, ipld_block(&params));
    expect_abort(ExitCode::USR_ILLEGAL_ARGUMENT, result);
    rt.reset();
}

#[test]
fn fails_if_multiaddrs_contains_empty_element() {
    let h = ActorHarness::new(100);
    let rt = h.new_runtime();

    let params = MinerConstructorParams {
        owner: h.owner,
        worker: h.worker,
        control_addresses: vec![],
        seal_proof_type: h.seal_proof_type,
        peer_id: vec![0],
        multi_addresses: vec![BytesDe(vec![])],
    };

    rt.set_caller(*INIT_ACTOR_CODE_ID, INIT_ACTOR_ADDR);
    rt.expect_validate_caller_addr(vec![INIT_ACTOR_ADDR]);

    let result = rt.call::<Actor>(Method::Constructor as u64, ipld_block(&params));
    expect_abort(ExitCode::USR_ILLEGAL_ARGUMENT, result);
    rt.reset();
}

#[test]
fn can_change_peer_id_and_multiaddrs() {
    let h = ActorHarness::new(100);
    let rt = h.new_runtime();

    h.construct_and_verify(&rt);

    h.set_peer_id(&rt, b"new-peer".to_vec());
    h.set_multiaddrs(&rt, vec![BytesDe(b"addr1".to_vec()), BytesDe(b"addr2".to_vec())]);

    h.check_state(&rt);
}
