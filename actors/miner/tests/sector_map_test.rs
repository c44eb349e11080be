use fvm_ipld_bitfield::BitField;

use stor_actor_miner::{DeadlineSectorMap, PartitionSectorMap};

fn bf(bits: &[u64]) -> BitField {
    BitField::try_from_bits(bits.iter().copied()).unwrap()
}

#[test]
fn add_merges_sector_sets() {
    let mut map = DeadlineSectorMap::new();

    map.add(0, 1, bf(&[1, 2])).unwrap();
    map.add(0, 1, bf(&[3])).unwrap();
    map.add(1, 0, bf(&[4])).unwrap();

    let (partitions, sectors) = map.count().unwrap();
    assert_eq!(2, partitions);
    assert_eq!(4, sectors);
}

#[test]
fn iteration_is_ordered_by_index() {
    let mut map = DeadlineSectorMap::new();

    map.add(3, 0, bf(&[1])).unwrap();
    map.add(0, 0, bf(&[2])).unwrap();
    map.add(7, 0, bf(&[3])).unwrap();

    let deadlines: Vec<u64> = map.iter().map(|(dl, _)| dl).collect();
    assert_eq!(vec![0, 3, 7], deadlines);
}

#[test]
fn check_enforces_partition_limit() {
    let mut map = DeadlineSectorMap::new();

    for partition in 0..5 {
        map.add(0, partition, bf(&[partition])).unwrap();
    }

    assert!(map.check(5, 100).is_ok());
    assert!(map.check(4, 100).is_err());
}

#[test]
fn check_enforces_sector_limit() {
    let mut map = DeadlineSectorMap::new();

    map.add(0, 0, bf(&[0, 1, 2, 3, 4, 5])).unwrap();

    assert!(map.check(100, 6).is_ok());
    assert!(map.check(100, 5).is_err());
}

#[test]
fn partition_map_counts_and_merges() {
    let mut map = PartitionSectorMap::default();

    map.add(0, bf(&[1, 2])).unwrap();
    map.add(0, bf(&[2, 3])).unwrap();
    map.add_values(1, vec![4, 5]).unwrap();

    let (partitions, sectors) = map.count().unwrap();
    assert_eq!(2, partitions);
    // Sector 2 counted once after merging.
    assert_eq!(5, sectors);
}
