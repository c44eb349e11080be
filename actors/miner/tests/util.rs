#![allow(dead_code)]

use cid::Cid;
use fvm_ipld_bitfield::BitField;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::{BytesDe, CborStore, RawBytes};
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    PoStProof, RegisteredPoStProof, RegisteredSealProof, SealVerifyInfo, SectorID, SectorInfo,
    SectorNumber, SectorSize, StoragePower, WindowPoStVerifyInfo,
};
use fvm_shared::METHOD_SEND;
use num_traits::Zero;
use rand::prelude::*;

use stor_actor_miner::ext::market::{
    ActivateDealsParams, ComputeDataCommitmentParams, ComputeDataCommitmentReturn,
    OnMinerSectorsTerminateParams, VerifyDealsForActivationParams, VerifyDealsForActivationReturn,
    ACTIVATE_DEALS_METHOD, COMPUTE_DATA_COMMITMENT_METHOD, ON_MINER_SECTORS_TERMINATE_METHOD,
    VERIFY_DEALS_FOR_ACTIVATION_METHOD,
};
use stor_actor_miner::ext::power::{
    CurrentTotalPowerReturn, EnrollCronEventParams, UpdateClaimedPowerParams,
    CURRENT_TOTAL_POWER_METHOD, ENROLL_CRON_EVENT_METHOD, SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
    UPDATE_CLAIMED_POWER_METHOD, UPDATE_PLEDGE_TOTAL_METHOD,
};
use stor_actor_miner::ext::reward::THIS_EPOCH_REWARD_METHOD;
use stor_actor_miner::ext::account::PUBKEY_ADDRESS_METHOD;
use stor_actor_miner::{
    initial_pledge_for_power, new_deadline_info, next_proving_period_start, power_for_sectors,
    qa_power_for_weight, Actor, ChangeMultiaddrsParams, ChangePeerIDParams,
    ConfirmSectorProofsParams, CronEventPayload, DeadlineInfo, DeclareFaultsParams,
    DeclareFaultsRecoveredParams, FaultDeclaration, GetControlAddressesReturn,
    MinerConstructorParams as ConstructorParams, Method, PoStPartition, PowerPair,
    ProveCommitSectorParams, RecoveryDeclaration, SectorOnChainInfo, SectorPreCommitInfo,
    SectorPreCommitOnChainInfo, State, SubmitWindowedPoStParams, TerminateSectorsParams,
    TerminateSectorsReturn, TerminationDeclaration, WithdrawBalanceParams,
    CRON_EVENT_PROCESS_EARLY_TERMINATIONS, CRON_EVENT_PROVING_DEADLINE,
};
use stor_actors_runtime::cbor::{serialize, serialize_vec};
use stor_actors_runtime::reward::{FilterEstimate, ThisEpochRewardReturn};
use stor_actors_runtime::runtime::{DomainSeparationTag, Runtime};
use stor_actors_runtime::test_utils::*;
use stor_actors_runtime::{
    ActorError, BURNT_FUNDS_ACTOR_ADDR, INIT_ACTOR_ADDR, REWARD_ACTOR_ADDR,
    STORAGE_MARKET_ACTOR_ADDR, STORAGE_POWER_ACTOR_ADDR,
};

const RECEIVER_ID: u64 = 1000;

pub fn new_bls_addr(s: u8) -> Address {
    let seed = [s; 32];
    let mut rng: StdRng = SeedableRng::from_seed(seed);
    let mut key = [0u8; 48];
    rng.fill_bytes(&mut key);
    Address::new_bls(&key).unwrap()
}

pub struct ActorHarness {
    pub receiver: Address,
    pub owner: Address,
    pub worker: Address,
    pub worker_key: Address,

    pub control_addrs: Vec<Address>,

    pub seal_proof_type: RegisteredSealProof,
    pub window_post_proof_type: RegisteredPoStProof,
    pub sector_size: SectorSize,
    pub partition_size: u64,
    pub period_offset: ChainEpoch,
    pub next_sector_no: SectorNumber,

    pub network_pledge: TokenAmount,
    pub network_raw_power: StoragePower,
    pub network_qa_power: StoragePower,
    pub baseline_power: StoragePower,

    pub epoch_reward_smooth: FilterEstimate,
    pub epoch_qa_power_smooth: FilterEstimate,
}

impl ActorHarness {
    pub fn new(proving_period_offset: ChainEpoch) -> ActorHarness {
        let owner = Address::new_id(100);
        let worker = Address::new_id(101);
        let control_addrs = vec![Address::new_id(999), Address::new_id(998)];
        let worker_key = new_bls_addr(0);
        let receiver = Address::new_id(RECEIVER_ID);
        let reward = TokenAmount::from_whole(10);
        let power = StoragePower::from(1i128 << 50);
        let proof_type = RegisteredSealProof::StackedDRG32GiBV1;

        ActorHarness {
            receiver,
            owner,
            worker,
            worker_key,
            control_addrs,

            seal_proof_type: proof_type,
            window_post_proof_type: proof_type.registered_window_post_proof().unwrap(),
            sector_size: proof_type.sector_size().unwrap(),
            partition_size: proof_type.window_post_partitions_sector().unwrap(),

            period_offset: proving_period_offset,
            next_sector_no: 100,

            network_pledge: &reward * 1000,
            network_raw_power: power.clone(),
            network_qa_power: power.clone(),
            baseline_power: power.clone(),

            epoch_reward_smooth: FilterEstimate::new(reward.atto().clone(), BigInt::zero()),
            epoch_qa_power_smooth: FilterEstimate::new(power, BigInt::zero()),
        }
    }

    pub fn get_state(&self, rt: &MockRuntime) -> State {
        rt.get_state::<State>()
    }

    pub fn new_runtime(&self) -> MockRuntime {
        let rt = MockRuntime::new(self.receiver);

        rt.set_address_actor_type(self.owner, *ACCOUNT_ACTOR_CODE_ID);
        rt.set_address_actor_type(self.worker, *ACCOUNT_ACTOR_CODE_ID);
        for addr in &self.control_addrs {
            rt.set_address_actor_type(*addr, *ACCOUNT_ACTOR_CODE_ID);
        }

        let mut rt = rt;
        rt.hash_func = fixed_hasher(self.period_offset);
        rt
    }

    pub fn caller_addrs(&self) -> Vec<Address> {
        let mut addrs = self.control_addrs.clone();
        addrs.push(self.worker);
        addrs.push(self.owner);
        addrs
    }

    /// The epoch at which the miner's current proving period starts, for the given epoch.
    pub fn period_start(&self, rt: &MockRuntime) -> ChainEpoch {
        next_proving_period_start(&rt.policy, *rt.epoch.borrow(), self.period_offset)
    }

    pub fn construct_and_verify(&self, rt: &MockRuntime) {
        let params = ConstructorParams {
            owner: self.owner,
            worker: self.worker,
            control_addresses: self.control_addrs.clone(),
            seal_proof_type: self.seal_proof_type,
            peer_id: vec![0],
            multi_addresses: vec![],
        };

        rt.set_caller(*INIT_ACTOR_CODE_ID, INIT_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![INIT_ACTOR_ADDR]);
        // The worker is an ID address, so the constructor will look up the BLS key.
        rt.expect_send(
            self.worker,
            PUBKEY_ADDRESS_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&self.worker_key).unwrap(),
            ExitCode::OK,
        );

        let period_start = self.period_start(rt);
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            ENROLL_CRON_EVENT_METHOD,
            make_enroll_cron_params(period_start - 1, CRON_EVENT_PROVING_DEADLINE),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        let result = rt
            .call::<Actor>(Method::Constructor as u64, ipld_block(&params))
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    pub fn get_control_addresses(&self, rt: &MockRuntime) -> (Address, Address, Vec<Address>) {
        rt.expect_validate_caller_any();

        let result = rt.call::<Actor>(Method::ControlAddresses as u64, None).unwrap();
        rt.verify();

        let value: GetControlAddressesReturn = result.unwrap().deserialize().unwrap();
        (value.owner, value.worker, value.control_addresses)
    }

    pub fn set_peer_id(&self, rt: &MockRuntime, new_id: Vec<u8>) {
        let params = ChangePeerIDParams { new_id: new_id.clone() };

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let result = rt.call::<Actor>(Method::ChangePeerID as u64, ipld_block(&params)).unwrap();
        expect_empty(result);
        rt.verify();

        let state = self.get_state(rt);
        let info = state.get_info(&rt.store).unwrap();

        assert_eq!(new_id, info.peer_id);
    }

    pub fn set_multiaddrs(&self, rt: &MockRuntime, new_multiaddrs: Vec<BytesDe>) {
        let params = ChangeMultiaddrsParams { new_multi_addrs: new_multiaddrs.clone() };

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let result =
            rt.call::<Actor>(Method::ChangeMultiaddrs as u64, ipld_block(&params)).unwrap();
        expect_empty(result);
        rt.verify();

        let state = self.get_state(rt);
        let info = state.get_info(&rt.store).unwrap();

        assert_eq!(new_multiaddrs, info.multi_address);
    }

    pub fn expect_query_network_info(&self, rt: &MockRuntime) {
        let current_power = CurrentTotalPowerReturn {
            raw_byte_power: self.network_raw_power.clone(),
            quality_adj_power: self.network_qa_power.clone(),
            pledge_collateral: self.network_pledge.clone(),
            quality_adj_power_smoothed: self.epoch_qa_power_smooth.clone(),
        };
        let current_reward = ThisEpochRewardReturn {
            this_epoch_reward_smoothed: self.epoch_reward_smooth.clone(),
            this_epoch_baseline_power: self.baseline_power.clone(),
        };
        rt.expect_send(
            REWARD_ACTOR_ADDR,
            THIS_EPOCH_REWARD_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&current_reward).unwrap(),
            ExitCode::OK,
        );
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            CURRENT_TOTAL_POWER_METHOD,
            None,
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&current_power).unwrap(),
            ExitCode::OK,
        );
    }

    pub fn make_pre_commit_params(
        &self,
        sector_no: u64,
        challenge: ChainEpoch,
        expiration: ChainEpoch,
        sector_deal_ids: Vec<DealID>,
    ) -> SectorPreCommitInfo {
        SectorPreCommitInfo {
            seal_proof: self.seal_proof_type,
            sector_number: sector_no,
            sealed_cid: make_sealed_cid(b"commr"),
            seal_rand_epoch: challenge,
            deal_ids: sector_deal_ids,
            expiration,
            // unused
            replace_capacity: false,
            replace_sector_deadline: 0,
            replace_sector_partition: 0,
            replace_sector_number: 0,
        }
    }

    pub fn make_prove_commit_params(&self, sector_no: u64) -> ProveCommitSectorParams {
        ProveCommitSectorParams { sector_number: sector_no, proof: vec![0u8; 192] }
    }

    pub fn pre_commit_sector(
        &self,
        rt: &MockRuntime,
        params: SectorPreCommitInfo,
    ) -> SectorPreCommitOnChainInfo {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        self.expect_query_network_info(rt);
        rt.expect_validate_caller_addr(self.caller_addrs());

        if !params.deal_ids.is_empty() {
            let vdparams = VerifyDealsForActivationParams {
                deal_ids: params.deal_ids.clone(),
                sector_start: *rt.epoch.borrow(),
                sector_expiry: params.expiration,
            };
            rt.expect_send(
                STORAGE_MARKET_ACTOR_ADDR,
                VERIFY_DEALS_FOR_ACTIVATION_METHOD,
                IpldBlock::serialize_cbor(&vdparams).unwrap(),
                TokenAmount::zero(),
                IpldBlock::serialize_cbor(&VerifyDealsForActivationReturn {
                    deal_weight: BigInt::zero(),
                    verified_deal_weight: BigInt::zero(),
                })
                .unwrap(),
                ExitCode::OK,
            );
        }

        let sector_number = params.sector_number;
        let result =
            rt.call::<Actor>(Method::PreCommitSector as u64, ipld_block(&params)).unwrap();
        expect_empty(result);
        rt.verify();

        self.get_precommit(rt, sector_number)
    }

    pub fn get_precommit(
        &self,
        rt: &MockRuntime,
        sector_number: SectorNumber,
    ) -> SectorPreCommitOnChainInfo {
        let state = self.get_state(rt);
        state.get_precommitted_sector(&rt.store, sector_number).unwrap().unwrap()
    }

    pub fn has_precommit(&self, rt: &MockRuntime, sector_number: SectorNumber) -> bool {
        let state = self.get_state(rt);
        state.get_precommitted_sector(&rt.store, sector_number).unwrap().is_some()
    }

    pub fn get_sector(&self, rt: &MockRuntime, sector_number: SectorNumber) -> SectorOnChainInfo {
        let state = self.get_state(rt);
        state.get_sector(&rt.store, sector_number).unwrap().unwrap()
    }

    pub fn prove_commit_sector_and_confirm(
        &self,
        rt: &MockRuntime,
        pc: &SectorPreCommitOnChainInfo,
        params: ProveCommitSectorParams,
    ) -> SectorOnChainInfo {
        let sector_number = params.sector_number;
        self.prove_commit_sector(rt, pc, params);
        self.confirm_sector_proofs_valid(rt, vec![pc.clone()]);

        self.get_sector(rt, sector_number)
    }

    pub fn prove_commit_sector(
        &self,
        rt: &MockRuntime,
        pc: &SectorPreCommitOnChainInfo,
        params: ProveCommitSectorParams,
    ) {
        let commd = make_unsealed_cid(b"commd");
        let seal_rand = [1u8; 32];
        let seal_int_rand = [2u8; 32];
        let interactive_epoch = pc.pre_commit_epoch + rt.policy.pre_commit_challenge_delay;

        // Prepare for and receive call to ProveCommitSector
        let entropy = serialize_vec(&self.receiver, "address").unwrap();
        rt.expect_get_randomness_from_tickets(
            DomainSeparationTag::SealRandomness,
            pc.info.seal_rand_epoch,
            entropy.clone(),
            seal_rand,
        );
        rt.expect_get_randomness_from_beacon(
            DomainSeparationTag::InteractiveSealChallengeSeed,
            interactive_epoch,
            entropy,
            seal_int_rand,
        );

        let cdc_params = ComputeDataCommitmentParams {
            deal_ids: pc.info.deal_ids.clone(),
            sector_type: pc.info.seal_proof,
        };
        rt.expect_send(
            STORAGE_MARKET_ACTOR_ADDR,
            COMPUTE_DATA_COMMITMENT_METHOD,
            IpldBlock::serialize_cbor(&cdc_params).unwrap(),
            TokenAmount::zero(),
            IpldBlock::serialize_cbor(&ComputeDataCommitmentReturn { commd }).unwrap(),
            ExitCode::OK,
        );

        let actor_id = RECEIVER_ID;
        let seal = SealVerifyInfo {
            registered_proof: pc.info.seal_proof,
            sector_id: SectorID { miner: actor_id, number: pc.info.sector_number },
            deal_ids: pc.info.deal_ids.clone(),
            randomness: Randomness(seal_rand.into()),
            interactive_randomness: Randomness(seal_int_rand.into()),
            proof: params.proof.clone(),
            sealed_cid: pc.info.sealed_cid,
            unsealed_cid: commd,
        };
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
            IpldBlock::serialize_cbor(&seal).unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        rt.expect_validate_caller_any();
        let result =
            rt.call::<Actor>(Method::ProveCommitSector as u64, ipld_block(&params)).unwrap();
        expect_empty(result);
        rt.verify();
    }

    pub fn confirm_sector_proofs_valid(
        &self,
        rt: &MockRuntime,
        pcs: Vec<SectorPreCommitOnChainInfo>,
    ) {
        self.expect_query_network_info(rt);

        let mut all_sector_numbers = Vec::new();
        let mut valid_pcs = Vec::new();
        for pc in &pcs {
            all_sector_numbers.push(pc.info.sector_number);

            if !pc.info.deal_ids.is_empty() {
                let params = ActivateDealsParams {
                    deal_ids: pc.info.deal_ids.clone(),
                    sector_expiry: pc.info.expiration,
                };
                rt.expect_send(
                    STORAGE_MARKET_ACTOR_ADDR,
                    ACTIVATE_DEALS_METHOD,
                    IpldBlock::serialize_cbor(&params).unwrap(),
                    TokenAmount::zero(),
                    None,
                    ExitCode::OK,
                );
            }
            valid_pcs.push(pc);
        }

        if !valid_pcs.is_empty() {
            let mut expected_pledge = TokenAmount::zero();
            let mut expected_qa_power = StoragePower::zero();
            let mut expected_raw_power = StoragePower::zero();

            for pc in valid_pcs {
                let duration = pc.info.expiration - *rt.epoch.borrow();
                if duration >= rt.policy.min_sector_expiration {
                    let qa_power_delta = qa_power_for_weight(
                        self.sector_size,
                        duration,
                        &pc.deal_weight,
                        &pc.verified_deal_weight,
                    );
                    expected_qa_power += &qa_power_delta;
                    expected_raw_power += self.sector_size as u64;
                    expected_pledge += initial_pledge_for_power(
                        &qa_power_delta,
                        &self.baseline_power,
                        &self.epoch_reward_smooth,
                        &self.epoch_qa_power_smooth,
                        &rt.total_fil_circ_supply(),
                    );
                }
            }

            if !expected_qa_power.is_zero() || !expected_raw_power.is_zero() {
                rt.expect_send(
                    STORAGE_POWER_ACTOR_ADDR,
                    UPDATE_CLAIMED_POWER_METHOD,
                    IpldBlock::serialize_cbor(&UpdateClaimedPowerParams {
                        raw_byte_delta: expected_raw_power,
                        quality_adjusted_delta: expected_qa_power,
                    })
                    .unwrap(),
                    TokenAmount::zero(),
                    None,
                    ExitCode::OK,
                );
            }

            if !expected_pledge.is_zero() {
                rt.expect_send(
                    STORAGE_POWER_ACTOR_ADDR,
                    UPDATE_PLEDGE_TOTAL_METHOD,
                    IpldBlock::serialize_cbor(&expected_pledge).unwrap(),
                    TokenAmount::zero(),
                    None,
                    ExitCode::OK,
                );
            }
        }

        rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);

        let params = ConfirmSectorProofsParams { sectors: all_sector_numbers };
        rt.call::<Actor>(Method::ConfirmSectorProofsValid as u64, ipld_block(&params)).unwrap();
        rt.verify();
    }

    /// Pre-commits and then proves a number of sectors.
    /// The sectors will expire at the end of `lifetime_periods` proving periods after now.
    pub fn commit_and_prove_sectors(
        &mut self,
        rt: &MockRuntime,
        num_sectors: usize,
        lifetime_periods: u64,
        deal_ids: Vec<DealID>,
    ) -> Vec<SectorOnChainInfo> {
        let precommit_epoch = *rt.epoch.borrow();
        let deadline = self.get_deadline_info(rt);
        let expiration =
            deadline.period_end() + lifetime_periods as i64 * rt.policy.wpost_proving_period;

        let mut precommits = Vec::with_capacity(num_sectors);
        for i in 0..num_sectors {
            let sector_no = self.next_sector_no;
            let mut sector_deal_ids = vec![];
            if !deal_ids.is_empty() {
                sector_deal_ids.push(deal_ids[i]);
            }
            let params = self.make_pre_commit_params(
                sector_no,
                precommit_epoch - 1,
                expiration,
                sector_deal_ids,
            );
            let precommit = self.pre_commit_sector(rt, params);
            precommits.push(precommit);
            self.next_sector_no += 1;
        }

        self.advance_to_epoch_with_cron(
            rt,
            precommit_epoch + rt.policy.pre_commit_challenge_delay + 1,
        );

        let mut info = Vec::with_capacity(num_sectors);
        for pc in precommits {
            let sector = self.prove_commit_sector_and_confirm(
                rt,
                &pc,
                self.make_prove_commit_params(pc.info.sector_number),
            );
            info.push(sector);
        }
        rt.reset();
        info
    }

    pub fn get_deadline_info(&self, rt: &MockRuntime) -> DeadlineInfo {
        let state = self.get_state(rt);
        state.deadline_info(&rt.policy, *rt.epoch.borrow())
    }

    /// Returns the deadline and partition index to which the given sector is assigned.
    pub fn find_sector(&self, rt: &MockRuntime, sector_number: SectorNumber) -> (u64, u64) {
        let state = self.get_state(rt);
        let deadlines = state.load_deadlines(&rt.store).unwrap();
        stor_actor_miner::find_sector(&rt.store, &deadlines, sector_number).unwrap()
    }

    /// Steps through deadline cron events until the current epoch reaches `epoch`.
    pub fn advance_to_epoch_with_cron(&self, rt: &MockRuntime, epoch: ChainEpoch) {
        let mut deadline = self.get_deadline_info(rt);
        while deadline.last() < epoch {
            self.advance_deadline(rt, CronConfig::empty());
            deadline = self.get_deadline_info(rt);
        }
        rt.set_epoch(epoch);
    }

    /// Advances to the open of the given deadline, running any deadline crons on the way.
    pub fn advance_to_deadline(&self, rt: &MockRuntime, dlidx: u64) -> DeadlineInfo {
        let mut dlinfo = self.deadline(rt);
        while dlinfo.index != dlidx || !dlinfo.is_open() {
            if dlinfo.index == dlidx && *rt.epoch.borrow() < dlinfo.open {
                // The proving period hasn't started yet; jump straight to the
                // window's open without any intervening crons.
                rt.set_epoch(dlinfo.open);
                dlinfo = self.deadline(rt);
            } else {
                dlinfo = self.advance_deadline(rt, CronConfig::empty());
            }
        }
        dlinfo
    }

    pub fn deadline(&self, rt: &MockRuntime) -> DeadlineInfo {
        let state = self.get_state(rt);
        state.deadline_info(&rt.policy, *rt.epoch.borrow())
    }

    /// Fast-forwards to the end of the current deadline, runs its cron handler, and
    /// advances the epoch to the start of the next deadline.
    pub fn advance_deadline(&self, rt: &MockRuntime, mut cfg: CronConfig) -> DeadlineInfo {
        let state = self.get_state(rt);
        let deadline = new_deadline_info(
            &rt.policy,
            state.proving_period_start,
            state.current_deadline,
            *rt.epoch.borrow(),
        );

        // Advance to the epoch when the cron fires (the last epoch of the deadline).
        rt.set_epoch(deadline.last());
        cfg.expected_enrollment = deadline.last() + rt.policy.wpost_challenge_window;
        self.on_deadline_cron(rt, cfg);
        rt.set_epoch(deadline.next_open());

        let state = self.get_state(rt);
        new_deadline_info(
            &rt.policy,
            state.proving_period_start,
            state.current_deadline,
            *rt.epoch.borrow(),
        )
    }

    pub fn on_deadline_cron(&self, rt: &MockRuntime, cfg: CronConfig) {
        rt.expect_validate_caller_addr(vec![STORAGE_POWER_ACTOR_ADDR]);
        self.expect_query_network_info(rt);

        // Preamble
        let mut power_delta = PowerPair::zero();
        if let Some(detected) = cfg.detected_faults_power_delta.clone() {
            power_delta += &detected;
        }
        if let Some(expiring) = cfg.expired_sectors_power_delta.clone() {
            power_delta += &expiring;
        }

        if !power_delta.is_zero() {
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                UPDATE_CLAIMED_POWER_METHOD,
                IpldBlock::serialize_cbor(&UpdateClaimedPowerParams {
                    raw_byte_delta: power_delta.raw,
                    quality_adjusted_delta: power_delta.qa,
                })
                .unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }

        let mut penalty_total = TokenAmount::zero();
        penalty_total += &cfg.continued_faults_penalty;
        penalty_total += &cfg.expired_precommit_penalty;
        if !penalty_total.is_zero() {
            rt.expect_send(
                BURNT_FUNDS_ACTOR_ADDR,
                METHOD_SEND,
                None,
                penalty_total.clone(),
                None,
                ExitCode::OK,
            );
        }

        let mut pledge_delta = TokenAmount::zero();
        pledge_delta -= &cfg.expired_sectors_pledge_delta.clone();
        pledge_delta -= cfg.penalty_from_vesting();
        pledge_delta -= &cfg.vesting_pledge_delta;
        if !pledge_delta.is_zero() {
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                UPDATE_PLEDGE_TOTAL_METHOD,
                IpldBlock::serialize_cbor(&pledge_delta).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }

        // Re-enrollment for next deadline.
        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            ENROLL_CRON_EVENT_METHOD,
            make_enroll_cron_params(cfg.expected_enrollment, CRON_EVENT_PROVING_DEADLINE),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        rt.set_caller(*POWER_ACTOR_CODE_ID, STORAGE_POWER_ACTOR_ADDR);
        let params = CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE };
        rt.call::<Actor>(Method::OnDeferredCronEvent as u64, ipld_block(&params)).unwrap();
        rt.verify();
    }

    pub fn make_post_proofs(&self) -> Vec<PoStProof> {
        let proof = PoStProof {
            post_proof: self.window_post_proof_type,
            proof_bytes: b"proof1".to_vec(),
        };
        vec![proof]
    }

    pub fn submit_window_post(
        &self,
        rt: &MockRuntime,
        deadline: &DeadlineInfo,
        partitions: Vec<PoStPartition>,
        infos: Vec<SectorOnChainInfo>,
        cfg: PoStConfig,
    ) {
        let chain_commit_rand = [10u8; 32];
        let challenge_rand = [11u8; 32];

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        self.expect_query_network_info(rt);
        rt.expect_validate_caller_addr(self.caller_addrs());

        rt.expect_get_randomness_from_tickets(
            DomainSeparationTag::PoStChainCommit,
            deadline.challenge,
            Vec::new(),
            chain_commit_rand,
        );

        let proofs = self.make_post_proofs();

        if !infos.is_empty() {
            let entropy = serialize_vec(&self.receiver, "address").unwrap();
            rt.expect_get_randomness_from_beacon(
                DomainSeparationTag::WindowedPoStChallengeSeed,
                deadline.challenge,
                entropy,
                challenge_rand,
            );

            let vi = WindowPoStVerifyInfo {
                randomness: Randomness(challenge_rand.into()),
                proofs: proofs.clone(),
                challenged_sectors: infos
                    .iter()
                    .map(|s| SectorInfo {
                        proof: s.seal_proof,
                        sector_number: s.sector_number,
                        sealed_cid: s.sealed_cid,
                    })
                    .collect(),
                prover: RECEIVER_ID,
            };
            let exit_code = match cfg.verification_exit {
                Some(exit_code) => exit_code,
                None => ExitCode::OK,
            };
            rt.expect_verify_post(vi, exit_code);
        }

        if let Some(power_delta) = cfg.expected_power_delta {
            if !power_delta.is_zero() {
                rt.expect_send(
                    STORAGE_POWER_ACTOR_ADDR,
                    UPDATE_CLAIMED_POWER_METHOD,
                    IpldBlock::serialize_cbor(&UpdateClaimedPowerParams {
                        raw_byte_delta: power_delta.raw,
                        quality_adjusted_delta: power_delta.qa,
                    })
                    .unwrap(),
                    TokenAmount::zero(),
                    None,
                    ExitCode::OK,
                );
            }
        }

        if !cfg.expected_penalty.is_zero() {
            rt.expect_send(
                BURNT_FUNDS_ACTOR_ADDR,
                METHOD_SEND,
                None,
                cfg.expected_penalty.clone(),
                None,
                ExitCode::OK,
            );
        }

        if !cfg.expected_pledge_delta.is_zero() {
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                UPDATE_PLEDGE_TOTAL_METHOD,
                IpldBlock::serialize_cbor(&cfg.expected_pledge_delta).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }

        let params = SubmitWindowedPoStParams {
            deadline: deadline.index,
            partitions,
            proofs,
            chain_commit_rand: Randomness(chain_commit_rand.into()),
        };

        let result = rt
            .call::<Actor>(Method::SubmitWindowedPoSt as u64, ipld_block(&params))
            .unwrap();
        expect_empty(result);
        rt.verify();
    }

    pub fn declare_faults(
        &self,
        rt: &MockRuntime,
        fault_sector_infos: &[SectorOnChainInfo],
    ) -> PowerPair {
        let state = self.get_state(rt);

        let ss = fault_sector_infos[0].seal_proof.sector_size().unwrap();
        let expected_delta = power_for_sectors(ss, fault_sector_infos);
        let expected_raw_delta = -expected_delta.raw.clone();
        let expected_qa_delta = -expected_delta.qa.clone();

        // Find the sectors' deadline and partition.
        let deadlines = state.load_deadlines(&rt.store).unwrap();
        let (dlidx, pidx) = stor_actor_miner::find_sector(
            &rt.store,
            &deadlines,
            fault_sector_infos[0].sector_number,
        )
        .unwrap();

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        rt.expect_send(
            STORAGE_POWER_ACTOR_ADDR,
            UPDATE_CLAIMED_POWER_METHOD,
            IpldBlock::serialize_cbor(&UpdateClaimedPowerParams {
                raw_byte_delta: expected_raw_delta.clone(),
                quality_adjusted_delta: expected_qa_delta.clone(),
            })
            .unwrap(),
            TokenAmount::zero(),
            None,
            ExitCode::OK,
        );

        // Calculate params from faulted sector infos
        let params = DeclareFaultsParams {
            faults: vec![FaultDeclaration {
                deadline: dlidx,
                partition: pidx,
                sectors: bitfield_from_sectors(fault_sector_infos),
            }],
        };

        let result = rt.call::<Actor>(Method::DeclareFaults as u64, ipld_block(&params)).unwrap();
        expect_empty(result);
        rt.verify();

        PowerPair { raw: expected_raw_delta, qa: expected_qa_delta }
    }

    pub fn declare_recoveries(
        &self,
        rt: &MockRuntime,
        dlidx: u64,
        pidx: u64,
        recovery_sectors: BitField,
        expected_debt_repaid: TokenAmount,
    ) -> Result<Option<IpldBlock>, ActorError> {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        if expected_debt_repaid.is_positive() {
            rt.expect_send(
                BURNT_FUNDS_ACTOR_ADDR,
                METHOD_SEND,
                None,
                expected_debt_repaid,
                None,
                ExitCode::OK,
            );
        }

        // Calculate params from faulted sector infos
        let params = DeclareFaultsRecoveredParams {
            recoveries: vec![RecoveryDeclaration {
                deadline: dlidx,
                partition: pidx,
                sectors: recovery_sectors,
            }],
        };

        let ret = rt.call::<Actor>(Method::DeclareFaultsRecovered as u64, ipld_block(&params));
        if ret.is_ok() {
            rt.verify();
        } else {
            rt.reset();
        }
        ret
    }

    pub fn terminate_sectors(
        &self,
        rt: &MockRuntime,
        sectors: &BitField,
        expected_fee: TokenAmount,
    ) -> (PowerPair, TokenAmount) {
        let state = self.get_state(rt);
        let sector_infos = state.load_sector_infos(&rt.store, sectors).unwrap();

        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.worker);
        rt.expect_validate_caller_addr(self.caller_addrs());

        let mut deal_ids = Vec::new();
        let mut sector_power = PowerPair::zero();
        let mut pledge_delta = TokenAmount::zero();
        for sector in &sector_infos {
            deal_ids.extend_from_slice(&sector.deal_ids);
            sector_power += &power_for_sectors(self.sector_size, std::slice::from_ref(sector));
            pledge_delta -= &sector.initial_pledge;
        }

        // The termination fee is burned, drawn from vesting funds then balance;
        // nothing is vesting in these tests so it all comes from balance.
        self.expect_query_network_info(rt);
        if !expected_fee.is_zero() {
            rt.expect_send(
                BURNT_FUNDS_ACTOR_ADDR,
                METHOD_SEND,
                None,
                expected_fee.clone(),
                None,
                ExitCode::OK,
            );
        }
        if !pledge_delta.is_zero() {
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                UPDATE_PLEDGE_TOTAL_METHOD,
                IpldBlock::serialize_cbor(&pledge_delta).unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }
        if !deal_ids.is_empty() {
            rt.expect_send(
                STORAGE_MARKET_ACTOR_ADDR,
                ON_MINER_SECTORS_TERMINATE_METHOD,
                IpldBlock::serialize_cbor(&OnMinerSectorsTerminateParams {
                    epoch: *rt.epoch.borrow(),
                    deal_ids,
                })
                .unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }
        if !sector_power.is_zero() {
            rt.expect_send(
                STORAGE_POWER_ACTOR_ADDR,
                UPDATE_CLAIMED_POWER_METHOD,
                IpldBlock::serialize_cbor(&UpdateClaimedPowerParams {
                    raw_byte_delta: -sector_power.raw.clone(),
                    quality_adjusted_delta: -sector_power.qa.clone(),
                })
                .unwrap(),
                TokenAmount::zero(),
                None,
                ExitCode::OK,
            );
        }

        // Build termination declarations, grouped by deadline/partition.
        let state = self.get_state(rt);
        let deadlines = state.load_deadlines(&rt.store).unwrap();
        let mut terminations: Vec<TerminationDeclaration> = Vec::new();
        for sector in sectors.iter() {
            let (deadline, partition) =
                stor_actor_miner::find_sector(&rt.store, &deadlines, sector).unwrap();
            match terminations
                .iter_mut()
                .find(|t| t.deadline == deadline && t.partition == partition)
            {
                Some(t) => t.sectors.set(sector),
                None => terminations.push(TerminationDeclaration {
                    deadline,
                    partition,
                    sectors: {
                        let mut bf = BitField::new();
                        bf.set(sector);
                        bf
                    },
                }),
            }
        }

        let params = TerminateSectorsParams { terminations };

        let ret = rt.call::<Actor>(Method::TerminateSectors as u64, ipld_block(&params)).unwrap();
        let ret: TerminateSectorsReturn = ret.unwrap().deserialize().unwrap();
        assert!(ret.done);
        rt.verify();

        (-sector_power, pledge_delta)
    }

    pub fn withdraw_funds(
        &self,
        rt: &MockRuntime,
        amount_requested: &TokenAmount,
        expected_withdrawn: &TokenAmount,
        expected_debt_repaid: &TokenAmount,
    ) -> Result<(), ActorError> {
        rt.set_caller(*ACCOUNT_ACTOR_CODE_ID, self.owner);
        rt.expect_validate_caller_addr(vec![self.owner]);

        if expected_withdrawn.is_positive() {
            rt.expect_send(
                self.owner,
                METHOD_SEND,
                None,
                expected_withdrawn.clone(),
                None,
                ExitCode::OK,
            );
        }

        if expected_debt_repaid.is_positive() {
            rt.expect_send(
                BURNT_FUNDS_ACTOR_ADDR,
                METHOD_SEND,
                None,
                expected_debt_repaid.clone(),
                None,
                ExitCode::OK,
            );
        }

        let params = WithdrawBalanceParams { amount_requested: amount_requested.clone() };
        let ret = rt.call::<Actor>(Method::WithdrawBalance as u64, ipld_block(&params));
        match ret {
            Ok(_) => {
                rt.verify();
                Ok(())
            }
            Err(e) => {
                rt.reset();
                Err(e)
            }
        }
    }

    pub fn check_state(&self, rt: &MockRuntime) {
        let state = self.get_state(rt);
        let (_, acc) = stor_actor_miner::testing::check_state_invariants(
            &rt.policy,
            &state,
            &rt.store,
            &rt.balance.borrow(),
        );
        acc.assert_empty();
    }
}

#[derive(Default)]
pub struct PoStConfig {
    pub expected_power_delta: Option<PowerPair>,
    pub expected_penalty: TokenAmount,
    pub expected_pledge_delta: TokenAmount,
    pub verification_exit: Option<ExitCode>,
}

impl PoStConfig {
    pub fn empty() -> PoStConfig {
        Default::default()
    }

    pub fn with_expected_power_delta(power_delta: &PowerPair) -> PoStConfig {
        PoStConfig {
            expected_power_delta: Some(power_delta.clone()),
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct CronConfig {
    pub expected_enrollment: ChainEpoch,
    pub detected_faults_power_delta: Option<PowerPair>,
    pub expired_sectors_power_delta: Option<PowerPair>,
    pub expired_sectors_pledge_delta: TokenAmount,
    pub continued_faults_penalty: TokenAmount,
    pub expired_precommit_penalty: TokenAmount,
    pub vesting_pledge_delta: TokenAmount,
}

impl CronConfig {
    pub fn empty() -> CronConfig {
        Default::default()
    }

    pub fn with_continued_faults_penalty(fault_fee: TokenAmount) -> CronConfig {
        CronConfig { continued_faults_penalty: fault_fee, ..Default::default() }
    }

    pub fn with_detected_faults_power_delta_and_continued_faults_penalty(
        power_delta: &PowerPair,
        fault_fee: TokenAmount,
    ) -> CronConfig {
        CronConfig {
            detected_faults_power_delta: Some(power_delta.clone()),
            continued_faults_penalty: fault_fee,
            ..Default::default()
        }
    }

    /// The portion of penalties drawn from the vesting table (none in tests
    /// that have no vesting funds).
    fn penalty_from_vesting(&self) -> TokenAmount {
        TokenAmount::zero()
    }
}

pub fn make_enroll_cron_params(epoch: ChainEpoch, event_type: i64) -> Option<IpldBlock> {
    let payload = serialize(&CronEventPayload { event_type }, "cron payload").unwrap();
    IpldBlock::serialize_cbor(&EnrollCronEventParams { event_epoch: epoch, payload }).unwrap()
}

pub fn bitfield_from_sectors(sectors: &[SectorOnChainInfo]) -> BitField {
    BitField::try_from_bits(sectors.iter().map(|s| s.sector_number)).unwrap()
}

pub fn big_balance() -> TokenAmount {
    TokenAmount::from_whole(10_000_000)
}

#[allow(dead_code)]
pub fn to_deal_id(seed: u64) -> DealID {
    seed
}

// Helper so tests can refer to raw bytes deterministically.
pub fn make_piece_cid(input: &[u8]) -> Cid {
    make_unsealed_cid(input)
}

pub fn assert_bitfield_equals(bf: &BitField, bits: &[u64]) {
    let expected = BitField::try_from_bits(bits.iter().copied()).unwrap();
    assert_eq!(&expected, bf);
}

#[allow(dead_code)]
pub fn empty_raw_bytes() -> RawBytes {
    RawBytes::default()
}

#[allow(dead_code)]
pub fn get_deadline(rt: &MockRuntime, state: &State, dlidx: u64) -> stor_actor_miner::Deadline {
    let deadlines = state.load_deadlines(&rt.store).unwrap();
    deadlines.load_deadline(&rt.store, dlidx).unwrap()
}

#[allow(dead_code)]
pub fn get_partition(
    rt: &MockRuntime,
    state: &State,
    dlidx: u64,
    pidx: u64,
) -> stor_actor_miner::Partition {
    get_deadline(rt, state, dlidx).load_partition(&rt.store, pidx).unwrap()
}

#[allow(dead_code)]
pub fn load_vesting_funds(rt: &MockRuntime, state: &State) -> stor_actor_miner::VestingFunds {
    rt.store.get_cbor(&state.vesting_funds).unwrap().unwrap()
}
