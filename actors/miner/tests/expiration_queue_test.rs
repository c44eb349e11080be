use fvm_ipld_amt::Amt;
use fvm_ipld_bitfield::BitField;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorSize;
use num_traits::Zero;

use stor_actor_miner::{
    power_for_sectors, ExpirationQueue, ExpirationSet, PowerPair, QuantSpec, SectorOnChainInfo,
    NO_QUANTIZATION,
};
use stor_actors_runtime::test_blockstores::MemoryBlockstore;
use stor_actors_runtime::test_utils::make_sealed_cid;

mod util;
use util::assert_bitfield_equals;

const SECTOR_SIZE: SectorSize = SectorSize::_32GiB;
const TEST_AMT_BITWIDTH: u32 = 3;

fn test_sector(
    expiration: ChainEpoch,
    sector_number: u64,
    weight: u64,
    vweight: u64,
    pledge: u64,
) -> SectorOnChainInfo {
    SectorOnChainInfo {
        expiration,
        sector_number,
        deal_weight: BigInt::from(weight),
        verified_deal_weight: BigInt::from(vweight),
        initial_pledge: TokenAmount::from_atto(pledge),
        sealed_cid: make_sealed_cid(format!("commr-{}", sector_number).as_bytes()),
        ..default_sector()
    }
}

fn default_sector() -> SectorOnChainInfo {
    SectorOnChainInfo {
        sector_number: 0,
        seal_proof: fvm_shared::sector::RegisteredSealProof::StackedDRG32GiBV1,
        sealed_cid: make_sealed_cid(b"commr"),
        deal_ids: vec![],
        activation: 0,
        expiration: 0,
        deal_weight: BigInt::zero(),
        verified_deal_weight: BigInt::zero(),
        initial_pledge: TokenAmount::zero(),
        expected_day_reward: TokenAmount::zero(),
        expected_storage_pledge: TokenAmount::zero(),
        replaced_sector_age: 0,
        replaced_day_reward: TokenAmount::zero(),
    }
}

fn sectors() -> Vec<SectorOnChainInfo> {
    vec![
        test_sector(2, 1, 50, 60, 1000),
        test_sector(3, 2, 51, 61, 1001),
        test_sector(7, 3, 52, 62, 1002),
        test_sector(8, 4, 53, 63, 1003),
        test_sector(11, 5, 54, 64, 1004),
        test_sector(13, 6, 55, 65, 1005),
    ]
}

fn empty_expiration_queue_with_quantizing(
    store: &MemoryBlockstore,
    quant: QuantSpec,
) -> ExpirationQueue<'_, MemoryBlockstore> {
    let cid = Amt::<(), _>::new_with_bit_width(store, TEST_AMT_BITWIDTH).flush().unwrap();
    ExpirationQueue::new(store, &cid, quant).unwrap()
}

#[test]
fn added_sectors_are_grouped_by_quantized_expiration() {
    let store = MemoryBlockstore::new();
    let mut queue =
        empty_expiration_queue_with_quantizing(&store, QuantSpec { unit: 5, offset: 3 });

    let (sector_numbers, power, pledge) =
        queue.add_active_sectors(&sectors(), SECTOR_SIZE).unwrap();

    assert_bitfield_equals(&sector_numbers, &[1, 2, 3, 4, 5, 6]);
    assert_eq!(power, power_for_sectors(SECTOR_SIZE, &sectors()));
    assert_eq!(pledge, TokenAmount::from_atto(6015));

    // Sectors are grouped at quantized epochs 3, 8, 13.
    let set = queue.amt.get(3).unwrap().unwrap();
    assert_bitfield_equals(&set.on_time_sectors, &[1, 2]);
    let set = queue.amt.get(8).unwrap().unwrap();
    assert_bitfield_equals(&set.on_time_sectors, &[3, 4]);
    let set = queue.amt.get(13).unwrap().unwrap();
    assert_bitfield_equals(&set.on_time_sectors, &[5, 6]);
}

#[test]
fn pop_until_aggregates_and_removes() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_expiration_queue_with_quantizing(&store, NO_QUANTIZATION);

    queue.add_active_sectors(&sectors(), SECTOR_SIZE).unwrap();

    let popped = queue.pop_until(7).unwrap();
    assert_bitfield_equals(&popped.on_time_sectors, &[1, 2, 3]);
    assert!(popped.early_sectors.is_empty());
    assert_eq!(TokenAmount::from_atto(1000 + 1001 + 1002), popped.on_time_pledge);

    // Remaining sectors are intact.
    let popped = queue.pop_until(20).unwrap();
    assert_bitfield_equals(&popped.on_time_sectors, &[4, 5, 6]);
    assert_eq!(0, queue.amt.count());
}

#[test]
fn reschedule_as_faults_moves_later_expirations_early() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_expiration_queue_with_quantizing(&store, NO_QUANTIZATION);

    let sectors = sectors();
    queue.add_active_sectors(&sectors, SECTOR_SIZE).unwrap();

    // Fault sectors 4, 5, 6 with a fault expiration of 9: sector 4 expires
    // on-time at 8 (before), sectors 5 and 6 are rescheduled early to 9.
    let faulted = &sectors[3..];
    let power = queue.reschedule_as_faults(9, faulted, SECTOR_SIZE).unwrap();
    assert_eq!(power, power_for_sectors(SECTOR_SIZE, faulted));

    // Sector 4's set at 8 now has faulty power.
    let set = queue.amt.get(8).unwrap().unwrap();
    assert_bitfield_equals(&set.on_time_sectors, &[4]);
    assert_eq!(
        power_for_sectors(SECTOR_SIZE, &sectors[3..4]),
        set.faulty_power
    );

    // Sectors 5 and 6 moved to an early entry at 9.
    let set = queue.amt.get(9).unwrap().unwrap();
    assert_bitfield_equals(&set.early_sectors, &[5, 6]);
    assert!(set.on_time_sectors.is_empty());
    assert_eq!(
        power_for_sectors(SECTOR_SIZE, &sectors[4..]),
        set.faulty_power
    );
    // Early sectors carry no on-time pledge.
    assert!(set.on_time_pledge.is_zero());

    // The old entries no longer hold them.
    assert!(queue.amt.get(11).unwrap().is_none());
    assert!(queue.amt.get(13).unwrap().is_none());
}

#[test]
fn reschedule_recovered_restores_on_time_schedule() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_expiration_queue_with_quantizing(&store, NO_QUANTIZATION);

    let sectors = sectors();
    queue.add_active_sectors(&sectors, SECTOR_SIZE).unwrap();

    let faulted: Vec<_> = sectors[4..].to_vec();
    queue.reschedule_as_faults(9, &faulted, SECTOR_SIZE).unwrap();

    let recovered_power = queue.reschedule_recovered(faulted.clone(), SECTOR_SIZE).unwrap();
    assert_eq!(recovered_power, power_for_sectors(SECTOR_SIZE, &faulted));

    // Sectors are back at their declared expirations with active power.
    let set = queue.amt.get(11).unwrap().unwrap();
    assert_bitfield_equals(&set.on_time_sectors, &[5]);
    assert!(set.faulty_power.is_zero());
    let set = queue.amt.get(13).unwrap().unwrap();
    assert_bitfield_equals(&set.on_time_sectors, &[6]);
    assert!(set.faulty_power.is_zero());
}

#[test]
fn remove_sectors_splits_active_and_faulty() {
    let store = MemoryBlockstore::new();
    let mut queue = empty_expiration_queue_with_quantizing(&store, NO_QUANTIZATION);

    let sectors = sectors();
    queue.add_active_sectors(&sectors, SECTOR_SIZE).unwrap();

    // Fault sector 6 early to epoch 9.
    queue.reschedule_as_faults(9, &sectors[5..], SECTOR_SIZE).unwrap();

    let mut faults = BitField::new();
    faults.set(6);
    let recovering = BitField::new();

    // Remove sectors 1 (active) and 6 (faulty, early).
    let to_remove = vec![sectors[0].clone(), sectors[5].clone()];
    let (removed, recovering_power) =
        queue.remove_sectors(&to_remove, &faults, &recovering, SECTOR_SIZE).unwrap();

    assert_bitfield_equals(&removed.on_time_sectors, &[1]);
    assert_bitfield_equals(&removed.early_sectors, &[6]);
    assert_eq!(
        power_for_sectors(SECTOR_SIZE, &sectors[0..1]),
        removed.active_power
    );
    assert_eq!(
        power_for_sectors(SECTOR_SIZE, &sectors[5..]),
        removed.faulty_power
    );
    assert!(recovering_power.is_zero());
}

#[test]
fn expiration_set_add_and_remove_are_inverse() {
    let mut set = ExpirationSet::empty();

    let on_time = BitField::try_from_bits([1, 2]).unwrap();
    let early = BitField::try_from_bits([3]).unwrap();
    let pledge = TokenAmount::from_atto(100);
    let active = PowerPair::new(BigInt::from(1024), BigInt::from(10240));
    let faulty = PowerPair::new(BigInt::from(512), BigInt::from(5120));

    set.add(&on_time, &early, &pledge, &active, &faulty);
    assert_eq!(3, set.len());
    assert!(!set.is_empty());

    set.remove(&on_time, &early, &pledge, &active, &faulty).unwrap();
    assert!(set.is_empty());
    assert!(set.on_time_pledge.is_zero());
    assert!(set.active_power.is_zero());
    assert!(set.faulty_power.is_zero());
}

#[test]
fn expiration_set_remove_fails_when_not_contained() {
    let mut set = ExpirationSet::empty();

    let on_time = BitField::try_from_bits([1]).unwrap();
    set.add(&on_time, &BitField::new(), &TokenAmount::zero(), &PowerPair::zero(), &PowerPair::zero());

    let missing = BitField::try_from_bits([9]).unwrap();
    let res = set.remove(
        &missing,
        &BitField::new(),
        &TokenAmount::zero(),
        &PowerPair::zero(),
        &PowerPair::zero(),
    );
    assert!(res.is_err());
}
