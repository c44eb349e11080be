use fvm_ipld_bitfield::BitField;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::{BytesDe, CborStore};
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::{RegisteredSealProof, SectorNumber, SectorSize};
use multihash_codetable::Code::Blake2b256;
use num_traits::Zero;

use stor_actor_miner::{
    MinerInfo, Partition, SectorOnChainInfo, SectorPreCommitInfo, SectorPreCommitOnChainInfo,
    State, TerminationResult, VestingFunds, NO_QUANTIZATION,
};
use stor_actors_runtime::runtime::Policy;
use stor_actors_runtime::test_blockstores::MemoryBlockstore;
use stor_actors_runtime::test_utils::make_sealed_cid;

mod util;
use util::assert_bitfield_equals;

pub struct StateHarness {
    pub st: State,
    pub store: MemoryBlockstore,
}

impl StateHarness {
    pub fn new(period_boundary: ChainEpoch) -> Self {
        Self::new_with_policy(&Policy::default(), period_boundary)
    }

    pub fn new_with_policy(policy: &Policy, period_boundary: ChainEpoch) -> Self {
        // store init
        let store = MemoryBlockstore::default();
        // state field init
        let owner = Address::new_id(1);
        let worker = Address::new_id(2);

        let info = MinerInfo::new(
            owner,
            worker,
            vec![],
            "peer".as_bytes().to_vec(),
            vec![BytesDe("foobar".as_bytes().to_vec()), BytesDe("imaminer".as_bytes().to_vec())],
            RegisteredSealProof::StackedDRG32GiBV1,
        )
        .unwrap();
        let info_cid = store.put_cbor(&info, Blake2b256).unwrap();

        let st = State::new(policy, &store, info_cid, period_boundary, 0).unwrap();
        StateHarness { st, store }
    }
}

fn new_precommit_on_chain(
    sector_number: SectorNumber,
    deposit: TokenAmount,
    epoch: ChainEpoch,
) -> SectorPreCommitOnChainInfo {
    SectorPreCommitOnChainInfo {
        info: SectorPreCommitInfo {
            seal_proof: RegisteredSealProof::StackedDRG32GiBV1,
            sector_number,
            sealed_cid: make_sealed_cid(b"commr"),
            seal_rand_epoch: 1,
            deal_ids: vec![],
            expiration: 100_000,
            replace_capacity: false,
            replace_sector_deadline: 0,
            replace_sector_partition: 0,
            replace_sector_number: 0,
        },
        pre_commit_deposit: deposit,
        pre_commit_epoch: epoch,
        deal_weight: BigInt::zero(),
        verified_deal_weight: BigInt::zero(),
    }
}

#[test]
fn pre_commit_store_round_trips() {
    let mut h = StateHarness::new(0);

    let pc = new_precommit_on_chain(1, TokenAmount::from_atto(1), 1);
    h.st.put_precommitted_sector(&h.store, pc.clone()).unwrap();

    let found = h.st.get_precommitted_sector(&h.store, 1).unwrap().unwrap();
    assert_eq!(pc, found);
    assert!(h.st.get_precommitted_sector(&h.store, 2).unwrap().is_none());

    h.st.delete_precommitted_sectors(&h.store, &[1]).unwrap();
    assert!(h.st.get_precommitted_sector(&h.store, 1).unwrap().is_none());
}

#[test]
fn put_same_precommit_twice_fails() {
    let mut h = StateHarness::new(0);

    let pc = new_precommit_on_chain(1, TokenAmount::from_atto(1), 1);
    h.st.put_precommitted_sector(&h.store, pc.clone()).unwrap();
    assert!(h.st.put_precommitted_sector(&h.store, pc).is_err());
}

#[test]
fn sector_number_allocation_is_exclusive() {
    let mut h = StateHarness::new(0);

    h.st.allocate_sector_number(&h.store, 100).unwrap();
    // The same number can never be re-allocated.
    assert!(h.st.allocate_sector_number(&h.store, 100).is_err());
    // Others are unaffected.
    h.st.allocate_sector_number(&h.store, 101).unwrap();
}

#[test]
fn mask_sector_numbers_blocks_future_allocation() {
    let mut h = StateHarness::new(0);

    let mask = BitField::try_from_bits(0..=200u64).unwrap();
    h.st.mask_sector_numbers(&h.store, &mask).unwrap();

    assert!(h.st.allocate_sector_number(&h.store, 150).is_err());
    h.st.allocate_sector_number(&h.store, 201).unwrap();
}

#[test]
fn vesting_funds_store_empty_at_construction() {
    let h = StateHarness::new(0);
    let vesting = h.store.get_cbor::<VestingFunds>(&h.st.vesting_funds).unwrap().unwrap();
    assert!(vesting.funds.is_empty());
}

#[test]
fn penalize_funds_in_priority_order_records_shortfall_as_fee_debt() {
    let mut h = StateHarness::new(0);

    // Nothing is vesting; an unpayable penalty becomes fee debt.
    let target = TokenAmount::from_atto(1000);
    let unlocked = TokenAmount::from_atto(400);
    let (from_vesting, from_balance) =
        h.st.penalize_funds_in_priority_order(&h.store, 0, &target, &unlocked).unwrap();

    assert!(from_vesting.is_zero());
    assert_eq!(TokenAmount::from_atto(400), from_balance);
    assert_eq!(TokenAmount::from_atto(600), h.st.fee_debt);
}

#[test]
fn repay_debts_requires_full_coverage() {
    let mut h = StateHarness::new(0);
    h.st.fee_debt = TokenAmount::from_atto(1000);

    // Balance (all unlocked) is insufficient.
    assert!(h.st.repay_debts(&TokenAmount::from_atto(999)).is_err());
    assert_eq!(TokenAmount::from_atto(1000), h.st.fee_debt);

    // Sufficient balance clears the debt.
    let to_burn = h.st.repay_debts(&TokenAmount::from_atto(2000)).unwrap();
    assert_eq!(TokenAmount::from_atto(1000), to_burn);
    assert!(h.st.fee_debt.is_zero());
}

#[test]
fn partition_early_terminations_pop_respects_limit() {
    let store = MemoryBlockstore::new();
    let mut partition = Partition::new(&store).unwrap();

    let quant = NO_QUANTIZATION;
    let sector_size = SectorSize::_32GiB;

    let sectors: Vec<SectorOnChainInfo> = (1..=4u64)
        .map(|i| SectorOnChainInfo {
            sector_number: i,
            seal_proof: RegisteredSealProof::StackedDRG32GiBV1,
            sealed_cid: make_sealed_cid(b"commr"),
            deal_ids: vec![],
            activation: 0,
            expiration: 1000,
            deal_weight: BigInt::zero(),
            verified_deal_weight: BigInt::zero(),
            initial_pledge: TokenAmount::from_atto(100),
            expected_day_reward: TokenAmount::zero(),
            expected_storage_pledge: TokenAmount::zero(),
            replaced_sector_age: 0,
            replaced_day_reward: TokenAmount::zero(),
        })
        .collect();

    partition.add_sectors(&store, true, &sectors, sector_size, quant).unwrap();

    // Terminate all four ahead of schedule, queueing early termination work.
    let mut sectors_store = stor_actor_miner::Sectors::load(
        &store,
        &fvm_ipld_amt::Amt::<SectorOnChainInfo, _>::new_with_bit_width(&store, 5)
            .flush()
            .unwrap(),
    )
    .unwrap();
    sectors_store.store(sectors.clone()).unwrap();

    let all = BitField::try_from_bits(1..=4u64).unwrap();
    partition.terminate_sectors(&store, &sectors_store, 55, &all, sector_size, quant).unwrap();

    // Pop with a limit smaller than the queue: returns a partial batch and
    // signals more work remaining.
    let (result, has_more): (TerminationResult, bool) =
        partition.pop_early_terminations(&store, 3).unwrap();
    assert_eq!(3, result.sectors_processed);
    assert!(has_more);
    let (_, sectors_popped) = result.iter().next().map(|(e, bf)| (e, bf.clone())).unwrap();
    assert_bitfield_equals(&sectors_popped, &[1, 2, 3]);

    // The rest drains on a second call.
    let (result, has_more): (TerminationResult, bool) =
        partition.pop_early_terminations(&store, 3).unwrap();
    assert_eq!(1, result.sectors_processed);
    assert!(!has_more);
}
