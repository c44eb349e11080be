// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use fvm_shared::clock::ChainEpoch;
use fvm_shared::sector::SectorNumber;

/// A trait for runtime policy configuration
pub trait RuntimePolicy {
    fn policy(&self) -> &Policy;
}

/// The policy itself
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Policy {
    // --- proving periods and deadlines ---
    /// The period over which all a miner's active sectors will be challenged.
    pub wpost_proving_period: ChainEpoch,
    /// The duration of a deadline's challenge window, the period before a deadline when the challenge is available.
    pub wpost_challenge_window: ChainEpoch,
    /// The number of non-overlapping PoSt deadlines in each proving period.
    pub wpost_period_deadlines: u64,
    /// Lookback from the deadline's challenge window opening from which to sample chain randomness for the challenge seed.
    pub wpost_challenge_lookback: ChainEpoch,
    /// Minimum period before a deadline's challenge window opens that a fault must be declared for that deadline.
    pub fault_declaration_cutoff: ChainEpoch,
    /// The maximum age of a fault before the sector is terminated.
    pub fault_max_age: ChainEpoch,
    /// Staging period for a miner worker key change.
    pub worker_key_change_delay: ChainEpoch,
    /// Number of epochs between publishing the precommit and when the challenge for interactive PoRep is drawn.
    pub pre_commit_challenge_delay: ChainEpoch,
    /// Maximum amount of epochs the seal randomness of a pre-commitment may lag the current epoch.
    pub max_pre_commit_randomness_lookback: ChainEpoch,

    // --- limits ---
    /// The maximum number of sector infos that may be required to be loaded in a single invocation.
    pub addressed_sectors_max: u64,
    /// The maximum number of partitions that may be required to be loaded in a single invocation.
    pub addressed_partitions_max: u64,
    /// The maximum number of partitions that may be assigned to a single deadline.
    pub max_partitions_per_deadline: u64,
    /// Maximum number of control addresses a miner may register.
    pub max_control_addresses: usize,
    /// MaxPeerIDLength is the maximum length allowed for any on-chain peer ID.
    pub max_peer_id_length: usize,
    /// MaxMultiaddrData is the maximum amount of data that can be stored in multiaddrs.
    pub max_multiaddr_data: usize,
    /// Maximum size of a single prove-commit proof, in bytes.
    pub max_prove_commit_size: usize,
    /// The maximum number of sector numbers addressable in a single invocation
    /// (which implies also the max infos that may be loaded at once).
    /// One upper bound on this is the max size of a storage block: 1MiB supports 130k at 8 bytes each,
    /// though bitfields can compress this.
    pub max_sector_number: SectorNumber,

    // --- sector lifetime ---
    /// Minimum number of epochs past the current epoch a sector may be set to expire.
    pub min_sector_expiration: ChainEpoch,
    /// Maximum number of epochs past the current epoch a sector may be set to expire.
    pub max_sector_expiration_extension: ChainEpoch,

    // --- penalties ---
    /// A miner is ineligible to commit new sectors for this long after a reported consensus fault.
    pub consensus_fault_ineligibility_duration: ChainEpoch,

    /// Allowed post proof types for new miners
    pub chain_finality: ChainEpoch,
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            wpost_proving_period: policy_constants::WPOST_PROVING_PERIOD,
            wpost_challenge_window: policy_constants::WPOST_CHALLENGE_WINDOW,
            wpost_period_deadlines: policy_constants::WPOST_PERIOD_DEADLINES,
            wpost_challenge_lookback: policy_constants::WPOST_CHALLENGE_LOOKBACK,
            fault_declaration_cutoff: policy_constants::FAULT_DECLARATION_CUTOFF,
            fault_max_age: policy_constants::FAULT_MAX_AGE,
            worker_key_change_delay: policy_constants::WORKER_KEY_CHANGE_DELAY,
            pre_commit_challenge_delay: policy_constants::PRE_COMMIT_CHALLENGE_DELAY,
            max_pre_commit_randomness_lookback:
                policy_constants::MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK,
            addressed_sectors_max: policy_constants::ADDRESSED_SECTORS_MAX,
            addressed_partitions_max: policy_constants::ADDRESSED_PARTITIONS_MAX,
            max_partitions_per_deadline: policy_constants::MAX_PARTITIONS_PER_DEADLINE,
            max_control_addresses: policy_constants::MAX_CONTROL_ADDRESSES,
            max_peer_id_length: policy_constants::MAX_PEER_ID_LENGTH,
            max_multiaddr_data: policy_constants::MAX_MULTIADDR_DATA,
            max_prove_commit_size: policy_constants::MAX_PROVE_COMMIT_SIZE,
            max_sector_number: policy_constants::MAX_SECTOR_NUMBER,
            min_sector_expiration: policy_constants::MIN_SECTOR_EXPIRATION,
            max_sector_expiration_extension: policy_constants::MAX_SECTOR_EXPIRATION_EXTENSION,
            consensus_fault_ineligibility_duration:
                policy_constants::CONSENSUS_FAULT_INELIGIBILITY_DURATION,
            chain_finality: policy_constants::CHAIN_FINALITY,
        }
    }
}

pub mod policy_constants {
    use fvm_shared::clock::ChainEpoch;
    use fvm_shared::sector::SectorNumber;

    use crate::builtin::*;

    pub const WPOST_PROVING_PERIOD: ChainEpoch = EPOCHS_IN_DAY;
    pub const WPOST_CHALLENGE_WINDOW: ChainEpoch = 30 * 60 / EPOCH_DURATION_IN_SECONDS;
    pub const WPOST_PERIOD_DEADLINES: u64 = 48;
    pub const WPOST_CHALLENGE_LOOKBACK: ChainEpoch = 20;
    pub const FAULT_DECLARATION_CUTOFF: ChainEpoch = WPOST_CHALLENGE_LOOKBACK + 50;
    pub const FAULT_MAX_AGE: ChainEpoch = WPOST_PROVING_PERIOD * 14;

    // Finality is a harsh delay for a miner who has lost their worker key, as the miner will miss
    // Window PoSts until the change is complete.
    pub const WORKER_KEY_CHANGE_DELAY: ChainEpoch = CHAIN_FINALITY;

    pub const PRE_COMMIT_CHALLENGE_DELAY: ChainEpoch = 150;

    pub const MAX_PRE_COMMIT_RANDOMNESS_LOOKBACK: ChainEpoch =
        CHAIN_FINALITY + PRE_COMMIT_CHALLENGE_DELAY;

    pub const ADDRESSED_SECTORS_MAX: u64 = 10_000;
    pub const ADDRESSED_PARTITIONS_MAX: u64 = 200;
    pub const MAX_PARTITIONS_PER_DEADLINE: u64 = 3000;

    pub const MAX_CONTROL_ADDRESSES: usize = 10;
    pub const MAX_PEER_ID_LENGTH: usize = 128;
    pub const MAX_MULTIADDR_DATA: usize = 1024;
    pub const MAX_PROVE_COMMIT_SIZE: usize = 1024;

    pub const MAX_SECTOR_NUMBER: SectorNumber = i64::MAX as u64;

    pub const MIN_SECTOR_EXPIRATION: ChainEpoch = 180 * EPOCHS_IN_DAY;
    pub const MAX_SECTOR_EXPIRATION_EXTENSION: ChainEpoch = 540 * EPOCHS_IN_DAY;

    pub const CONSENSUS_FAULT_INELIGIBILITY_DURATION: ChainEpoch = CHAIN_FINALITY;

    pub const CHAIN_FINALITY: ChainEpoch = 900;
}
