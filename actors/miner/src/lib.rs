// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp;
use std::collections::BTreeMap;
use std::ops::Neg;

use anyhow::Error;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use cid::Cid;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::CborStore;
use fvm_shared::address::{Address, Payload, Protocol};
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::Randomness;
use fvm_shared::sector::{
    RegisteredSealProof, SealVerifyInfo, SectorID, SectorInfo, SectorNumber, SectorSize,
    WindowPoStVerifyInfo,
};
use fvm_shared::{MethodNum, METHOD_CONSTRUCTOR, METHOD_SEND};
use log::{info, warn};
use multihash_codetable::Code::Blake2b256;
use num_derive::FromPrimitive;
use num_traits::{FromPrimitive, Zero};

pub use bitfield_queue::*;
pub use deadline_assignment::*;
pub use deadline_info::*;
pub use deadline_state::*;
pub use deadlines::*;
pub use expiration_queue::*;
pub use monies::*;
pub use partition_state::*;
pub use policy::*;
pub use quantize::*;
pub use sector_map::*;
pub use sectors::*;
pub use state::*;
pub use termination::*;
pub use types::*;
pub use vesting_state::*;

use stor_actors_runtime::cbor::{serialize, serialize_vec};
use stor_actors_runtime::reward::{FilterEstimate, ThisEpochRewardReturn};
use stor_actors_runtime::runtime::builtins::Type;
use stor_actors_runtime::runtime::policy_constants::MAX_SECTOR_NUMBER;
use stor_actors_runtime::runtime::{ActorCode, DomainSeparationTag, Policy, Runtime};
use stor_actors_runtime::{
    actor_error, deserialize_block, ActorContext, ActorDowncast, ActorError, AsActorError,
    BURNT_FUNDS_ACTOR_ADDR, CALLER_TYPES_SIGNABLE, INIT_ACTOR_ADDR, REWARD_ACTOR_ADDR,
    STORAGE_MARKET_ACTOR_ADDR, STORAGE_POWER_ACTOR_ADDR,
};

mod bitfield_queue;
mod deadline_assignment;
mod deadline_info;
mod deadline_state;
mod deadlines;
mod expiration_queue;
#[doc(hidden)]
pub mod ext;
mod monies;
mod partition_state;
mod policy;
mod quantize;
mod sector_map;
mod sectors;
mod state;
mod termination;
pub mod testing;
mod types;
mod vesting_state;

/// Storage Miner actor methods available
#[derive(FromPrimitive)]
#[repr(u64)]
pub enum Method {
    Constructor = METHOD_CONSTRUCTOR,
    ControlAddresses = 2,
    ChangeWorkerAddress = 3,
    ChangePeerID = 4,
    SubmitWindowedPoSt = 5,
    PreCommitSector = 6,
    ProveCommitSector = 7,
    ExtendSectorExpiration = 8,
    TerminateSectors = 9,
    DeclareFaults = 10,
    DeclareFaultsRecovered = 11,
    OnDeferredCronEvent = 12,
    CheckSectorProven = 13,
    AddLockedFund = 14,
    ReportConsensusFault = 15,
    WithdrawBalance = 16,
    ConfirmSectorProofsValid = 17,
    ChangeMultiaddrs = 18,
    CompactPartitions = 19,
    CompactSectorNumbers = 20,
}

pub const ERR_BALANCE_INVARIANTS_BROKEN: ExitCode = ExitCode::new(1000);

/// Miner Actor
pub struct Actor;

impl Actor {
    pub fn constructor(
        rt: &impl Runtime,
        params: MinerConstructorParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(std::iter::once(&INIT_ACTOR_ADDR))?;

        check_control_addresses(rt.policy(), &params.control_addresses)?;
        check_peer_info(rt.policy(), &params.peer_id, &params.multi_addresses)?;

        if !can_pre_commit_seal_proof(params.seal_proof_type) {
            return Err(actor_error!(
                illegal_argument,
                "proof type {:?} not allowed for new miner actors",
                params.seal_proof_type
            ));
        }

        let owner = resolve_control_address(rt, params.owner)?;
        let worker = resolve_worker_address(rt, params.worker)?;
        let control_addresses: Vec<_> = params
            .control_addresses
            .into_iter()
            .map(|address| resolve_control_address(rt, address))
            .collect::<Result<_, _>>()?;

        let policy = rt.policy();
        let current_epoch = rt.curr_epoch();
        let blake2b = |b: &[u8]| rt.hash_blake2b(b);
        let offset =
            assign_proving_period_offset(policy, rt.message().receiver(), current_epoch, blake2b)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_SERIALIZATION,
                        "failed to assign proving period offset",
                    )
                })?;

        let period_start = next_proving_period_start(policy, current_epoch, offset);
        if period_start <= current_epoch {
            return Err(actor_error!(
                illegal_state,
                "computed proving period start {} before current epoch {}",
                period_start,
                current_epoch
            ));
        }

        let info = MinerInfo::new(
            owner,
            worker,
            control_addresses,
            params.peer_id,
            params.multi_addresses,
            params.seal_proof_type,
        )?;
        let info_cid = rt.store().put_cbor(&info, Blake2b256).map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to store miner info")
        })?;

        let st = State::new(policy, rt.store(), info_cid, period_start, 0)?;
        rt.create(&st)?;

        // Register first cron callback for epoch before the first proving period starts.
        enroll_cron_event(
            rt,
            period_start - 1,
            CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE },
        )?;

        Ok(())
    }

    /// Returns the "controlling" addresses: the owner, the worker, and all control addresses
    fn control_addresses(rt: &impl Runtime) -> Result<GetControlAddressesReturn, ActorError> {
        rt.validate_immediate_caller_accept_any()?;
        let state: State = rt.state()?;
        let info = get_miner_info(rt.store(), &state)?;
        Ok(GetControlAddressesReturn {
            owner: info.owner,
            worker: info.worker,
            control_addresses: info.control_addresses,
        })
    }

    /// Will ALWAYS overwrite the existing control addresses with the control addresses passed in the params.
    /// If an empty addresses vector is passed, the control addresses will be cleared.
    /// A worker change will be scheduled if the worker passed in the params is different from the existing worker.
    fn change_worker_address(
        rt: &impl Runtime,
        params: ChangeWorkerAddressParams,
    ) -> Result<(), ActorError> {
        check_control_addresses(rt.policy(), &params.new_control_addresses)?;

        let new_worker = resolve_worker_address(rt, params.new_worker)?;
        let control_addresses: Vec<Address> = params
            .new_control_addresses
            .into_iter()
            .map(|address| resolve_control_address(rt, address))
            .collect::<Result<_, _>>()?;

        let mut effective_epoch = ChainEpoch::default();
        let worker_changed = rt.transaction(|state: &mut State, rt| {
            let mut info = get_miner_info(rt.store(), state)?;

            // Only the Owner is allowed to change the new_worker and control addresses.
            rt.validate_immediate_caller_is(std::iter::once(&info.owner))?;

            // save the new control addresses
            info.control_addresses = control_addresses;

            // save new_worker addr key change request.
            // This may replace another pending key change.
            let worker_changed = new_worker != info.worker;
            if worker_changed {
                effective_epoch = rt.curr_epoch() + rt.policy().worker_key_change_delay;
                info.pending_worker_key =
                    Some(WorkerKeyChange { new_worker, effective_at: effective_epoch });
            }

            state.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
            })?;

            Ok(worker_changed)
        })?;

        // We only need to enroll a cron event when the worker key changes;
        // control addresses are changed immediately.
        if worker_changed {
            enroll_cron_event(
                rt,
                effective_epoch,
                CronEventPayload { event_type: CRON_EVENT_WORKER_KEY_CHANGE },
            )?;
        }

        Ok(())
    }

    fn change_peer_id(rt: &impl Runtime, params: ChangePeerIDParams) -> Result<(), ActorError> {
        check_peer_info(rt.policy(), &params.new_id, &[])?;

        rt.transaction(|state: &mut State, rt| {
            let mut info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            info.peer_id = params.new_id;
            state.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
            })?;

            Ok(())
        })
    }

    fn change_multiaddresses(
        rt: &impl Runtime,
        params: ChangeMultiaddrsParams,
    ) -> Result<(), ActorError> {
        check_peer_info(rt.policy(), &[], &params.new_multi_addrs)?;

        rt.transaction(|state: &mut State, rt| {
            let mut info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            info.multi_address = params.new_multi_addrs;
            state.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not save miner info")
            })?;

            Ok(())
        })
    }

    /// Invoked by miner's worker address to submit their fallback post
    fn submit_windowed_post(
        rt: &impl Runtime,
        mut params: SubmitWindowedPoStParams,
    ) -> Result<(), ActorError> {
        let current_epoch = rt.curr_epoch();

        if params.deadline >= rt.policy().wpost_period_deadlines {
            return Err(actor_error!(
                illegal_argument,
                "invalid deadline {} of {}",
                params.deadline,
                rt.policy().wpost_period_deadlines
            ));
        }

        // Get the total power/reward. We need these to compute penalties.
        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_total = request_current_total_power(rt)?;

        let (post_result, penalty_total, pledge_delta) =
            rt.transaction(|state: &mut State, rt| {
                let info = get_miner_info(rt.store(), state)?;

                rt.validate_immediate_caller_is(
                    info.control_addresses.iter().chain(&[info.worker, info.owner]),
                )?;

                // Verify that the miner has passed 0 or 1 proofs. If they've
                // passed 1, verify that it's a good proof.
                //
                // This can be 0 if the miner isn't actually proving anything,
                // just skipping all sectors.
                let window_post_proof_type =
                    info.seal_proof_type.registered_window_post_proof().map_err(|e| {
                        actor_error!(illegal_state, "failed to determine window PoSt type: {}", e)
                    })?;
                if params.proofs.len() > 1 {
                    return Err(actor_error!(
                        illegal_argument,
                        "expected at most one proof, got {}",
                        params.proofs.len()
                    ));
                } else if params.proofs.len() == 1
                    && params.proofs[0].post_proof != window_post_proof_type
                {
                    return Err(actor_error!(
                        illegal_argument,
                        "expected proof of type {:?}, got {:?}",
                        window_post_proof_type,
                        params.proofs[0].post_proof
                    ));
                }

                // Validate that the miner didn't try to prove too many partitions at once.
                let submission_partition_limit =
                    load_partitions_sectors_max(rt.policy(), info.window_post_partition_sectors);
                if params.partitions.len() as u64 > submission_partition_limit {
                    return Err(actor_error!(
                        illegal_argument,
                        "too many partitions {}, limit {}",
                        params.partitions.len(),
                        submission_partition_limit
                    ));
                }

                let current_deadline = state.deadline_info(rt.policy(), current_epoch);

                // Check that the miner state indicates that the current proving deadline has started.
                // This should only fail if the cron actor wasn't invoked, and matters only in case that it hasn't been
                // invoked for a whole proving period, and hence the missed PoSt submissions from the prior occurrence
                // of this deadline haven't been processed yet.
                if !current_deadline.is_open() {
                    return Err(actor_error!(
                        illegal_state,
                        "proving period {} not yet open at {}",
                        current_deadline.period_start,
                        current_epoch
                    ));
                }

                // The miner may only submit a proof for the current deadline.
                if params.deadline != current_deadline.index {
                    return Err(actor_error!(
                        illegal_argument,
                        "invalid deadline {} at epoch {}, expected {}",
                        params.deadline,
                        current_epoch,
                        current_deadline.index
                    ));
                }

                // Verify that the PoSt was committed to the chain at the challenge epoch.
                let comm_rand = rt.get_randomness_from_tickets(
                    DomainSeparationTag::PoStChainCommit,
                    current_deadline.challenge,
                    &[],
                )?;
                if Randomness(comm_rand.into()) != params.chain_commit_rand {
                    return Err(actor_error!(
                        illegal_argument,
                        "post commit randomness mismatched"
                    ));
                }

                let sectors = Sectors::load(rt.store(), &state.sectors).map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors")
                })?;

                let mut deadlines = state.load_deadlines(rt.store())?;

                let mut deadline =
                    deadlines.load_deadline(rt.store(), params.deadline).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", params.deadline),
                        )
                    })?;

                // Record proven sectors/partitions, returning updates to power and the final set of sectors
                // proven/skipped.
                //
                // NOTE: This function does not actually check the proofs but does assume that they'll be
                // successfully validated. The actual proof verification is done below in verify_windowed_post.
                //
                // If proof verification fails, the this deadline MUST NOT be saved and this function should
                // be aborted.
                let policy = rt.policy();
                let fault_expiration = current_deadline.last() + policy.fault_max_age;
                let post_result = deadline
                    .record_proven_sectors(
                        rt.store(),
                        &sectors,
                        info.sector_size,
                        current_deadline.quant_spec(),
                        fault_expiration,
                        &mut params.partitions,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!(
                                "failed to process post submission for deadline {}",
                                params.deadline
                            ),
                        )
                    })?;

                // Load sector infos for proof, substituting a known-good sector for known-faulty sectors.
                // Note: this is slightly sub-optimal, loading info for the recovering sectors again after they were already
                // loaded above.
                let sector_infos = sectors
                    .load_for_proof(&post_result.sectors, &post_result.ignored_sectors)
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            "failed to load proven sector info",
                        )
                    })?;

                // Skip verification if all sectors are faults.
                // We still need to allow this call to succeed so the miner can declare a whole partition as skipped.
                if !sector_infos.is_empty() {
                    if params.proofs.is_empty() {
                        // The miner _was_ supposed to prove something, but didn't.
                        return Err(actor_error!(
                            illegal_argument,
                            "no proofs submitted in window PoSt for {} sectors",
                            sector_infos.len()
                        ));
                    }

                    // Verify the proof.
                    // A failed verification doesn't immediately cause a penalty; the miner can try again.
                    verify_windowed_post(
                        rt,
                        current_deadline.challenge,
                        &sector_infos,
                        params.proofs.clone(),
                    )?;
                }

                // Penalize new skipped faults and retracted recoveries as undeclared faults.
                // These pay a higher fee than faults declared before the deadline challenge window opened.
                let undeclared_penalty_power = post_result.penalty_power();
                let mut undeclared_penalty_target = pledge_penalty_for_undeclared_fault(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &undeclared_penalty_power.qa,
                );
                // Subtract the "ongoing" fault fee from the amount charged now, since it will be charged at
                // the end-of-deadline cron.
                undeclared_penalty_target -= pledge_penalty_for_declared_fault(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &undeclared_penalty_power.qa,
                );

                // Penalize recoveries as declared faults (a lower fee than the undeclared, above).
                // It sounds odd, but because faults are penalized in arrears, at the _end_ of the faulty period, we must
                // penalize recovered sectors here because they won't be penalized by the end-of-deadline cron for the
                // immediately-prior faulty period.
                let declared_penalty_target = pledge_penalty_for_declared_fault(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &post_result.recovered_power.qa,
                );

                // Note: We could delay this charge until end of deadline, but that would require more accounting state.
                let total_penalty_target = undeclared_penalty_target + declared_penalty_target;
                let unlocked_balance =
                    state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                        actor_error!(illegal_state, "failed to compute unlocked balance: {}", e)
                    })?;
                let (penalty_from_vesting, penalty_from_balance) = state
                    .penalize_funds_in_priority_order(
                        rt.store(),
                        current_epoch,
                        &total_penalty_target,
                        &unlocked_balance,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            "failed to unlock penalty",
                        )
                    })?;
                let penalty_total = &penalty_from_vesting + &penalty_from_balance;
                let pledge_delta = penalty_from_vesting.neg();

                deadlines
                    .update_deadline(rt.store(), params.deadline, &deadline)
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to update deadline {}", params.deadline),
                        )
                    })?;

                state.save_deadlines(rt.store(), deadlines).map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
                })?;

                Ok((post_result, penalty_total, pledge_delta))
            })?;

        // Restore power for recovered sectors. Remove power for new faults.
        // NOTE: It would be permissible to delay the power loss until the deadline closes, but that would require
        // additional accounting state.
        request_update_power(rt, post_result.power_delta)?;
        // Burn penalties.
        burn_funds(rt, penalty_total)?;
        notify_pledge_changed(rt, &pledge_delta)?;
        Ok(())
    }

    /// Proposals must be posted on chain via the market actor's PublishStorageDeals before PreCommitSector.
    fn pre_commit_sector(
        rt: &impl Runtime,
        params: SectorPreCommitInfo,
    ) -> Result<(), ActorError> {
        if !can_pre_commit_seal_proof(params.seal_proof) {
            return Err(actor_error!(
                illegal_argument,
                "unsupported seal proof type: {:?}",
                params.seal_proof
            ));
        }
        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(
                actor_error!(illegal_argument; "sector number {} out of range 0..(2^63-1)", params.sector_number),
            );
        }
        if !is_sealed_sector(&params.sealed_cid) {
            return Err(actor_error!(illegal_argument; "sealed CID had wrong prefix"));
        }
        if params.seal_rand_epoch >= rt.curr_epoch() {
            return Err(actor_error!(
                illegal_argument,
                "seal challenge epoch {} must be before now {}",
                params.seal_rand_epoch,
                rt.curr_epoch()
            ));
        }

        let challenge_earliest =
            rt.curr_epoch() - rt.policy().max_pre_commit_randomness_lookback;
        if params.seal_rand_epoch < challenge_earliest {
            return Err(actor_error!(
                illegal_argument,
                "seal challenge epoch {} too old, must be after {}",
                params.seal_rand_epoch,
                challenge_earliest
            ));
        }

        // Require sector lifetime meets minimum by assuming activation happens at last epoch permitted for seal proof.
        // This could make sector maximum lifetime validation more lenient if the maximum sector limit isn't hit first.
        let max_activation = rt.curr_epoch()
            + max_prove_commit_duration(rt.policy(), params.seal_proof).ok_or_else(
                || actor_error!(illegal_argument, "unsupported seal proof type {:?}", params.seal_proof),
            )?;
        validate_expiration(
            rt.policy(),
            rt.curr_epoch(),
            max_activation,
            params.expiration,
            params.seal_proof,
        )?;

        if params.replace_capacity && params.deal_ids.is_empty() {
            return Err(
                actor_error!(illegal_argument; "cannot replace sector without committing deals"),
            );
        }
        if params.replace_sector_deadline >= rt.policy().wpost_period_deadlines {
            return Err(
                actor_error!(illegal_argument; "invalid deadline {}", params.replace_sector_deadline),
            );
        }
        if params.replace_sector_number > MAX_SECTOR_NUMBER {
            return Err(
                actor_error!(illegal_argument; "invalid sector number {}", params.replace_sector_number),
            );
        }

        // gather information from other actors
        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_total = request_current_total_power(rt)?;
        let deal_weight =
            request_deal_weights(rt, &params.deal_ids, rt.curr_epoch(), params.expiration)?;

        let mut fee_to_burn = TokenAmount::zero();
        let newly_vested = rt.transaction(|state: &mut State, rt| {
            let newly_vested = state.unlock_vested_funds(rt.store(), rt.curr_epoch()).map_err(
                |e| e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest funds"),
            )?;

            // available balance already accounts for fee debt so it is correct to call
            // this before repay_debts_or_abort. We would have to
            // subtract fee debt explicitly if we called this after.
            let available_balance =
                state.get_available_balance(&rt.current_balance()).map_err(|e| {
                    actor_error!(illegal_state, "failed to calculate available balance: {}", e)
                })?;
            fee_to_burn = repay_debts_or_abort(rt, state)?;

            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            if consensus_fault_active(&info, rt.curr_epoch()) {
                return Err(actor_error!(
                    forbidden,
                    "precommit not allowed during active consensus fault"
                ));
            }

            if params.seal_proof != info.seal_proof_type {
                return Err(actor_error!(
                    illegal_argument,
                    "sector seal proof {:?} must match miner seal proof type {:?}",
                    params.seal_proof,
                    info.seal_proof_type
                ));
            }

            let deal_count_max = sector_deals_max(info.sector_size);
            if params.deal_ids.len() as u64 > deal_count_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many deals for sector {} > {}",
                    params.deal_ids.len(),
                    deal_count_max
                ));
            }

            state.allocate_sector_number(rt.store(), params.sector_number).map_err(|e| {
                e.wrap(format!("failed to allocate sector id {}", params.sector_number))
            })?;

            // This sector check is redundant given the allocated sectors
            // bitfield, but the belt-and-suspenders check is cheap.
            let sector_found =
                state.has_sector_number(rt.store(), params.sector_number).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to check sector {}", params.sector_number),
                    )
                })?;
            if sector_found {
                return Err(actor_error!(
                    illegal_state,
                    "sector {} already committed",
                    params.sector_number
                ));
            }

            let deposit_minimum = if params.replace_capacity {
                let replace_sector = validate_replace_sector(state, rt.store(), &params)?;
                // Note the replaced sector's initial pledge as a lower bound for the new sector's deposit
                replace_sector.initial_pledge
            } else {
                TokenAmount::zero()
            };

            let duration = params.expiration - rt.curr_epoch();
            let sector_weight = qa_power_for_weight(
                info.sector_size,
                duration,
                &deal_weight.deal_weight,
                &deal_weight.verified_deal_weight,
            );
            let deposit_req = cmp::max(
                pre_commit_deposit_for_power(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &sector_weight,
                ),
                deposit_minimum,
            );

            if available_balance < deposit_req {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds for pre-commit deposit: {}",
                    deposit_req
                ));
            }

            state.add_pre_commit_deposit(&deposit_req).map_err(|e| {
                actor_error!(illegal_state, "failed to add pre-commit deposit {}: {}", deposit_req, e)
            })?;

            state
                .put_precommitted_sector(
                    rt.store(),
                    SectorPreCommitOnChainInfo {
                        info: params.clone(),
                        pre_commit_deposit: deposit_req,
                        pre_commit_epoch: rt.curr_epoch(),
                        deal_weight: deal_weight.deal_weight.clone(),
                        verified_deal_weight: deal_weight.verified_deal_weight.clone(),
                    },
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to write pre-committed sector {}", params.sector_number),
                    )
                })?;

            // add precommit expiry to the queue
            let max_seal_duration =
                max_prove_commit_duration(rt.policy(), params.seal_proof).ok_or_else(|| {
                    actor_error!(
                        illegal_argument,
                        "no max seal duration set for proof type: {:?}",
                        params.seal_proof
                    )
                })?;

            // The +1 here is critical for the batch verification of proofs. Without it, if a proof arrived exactly on the
            // due epoch, ProveCommitSector would accept it, then the expiry event would remove it, and then
            // ConfirmSectorProofsValid would fail to find it.
            let expiry_bound = rt.curr_epoch() + max_seal_duration + 1;

            state
                .add_pre_commit_expiry(rt.store(), expiry_bound, params.sector_number)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to add pre-commit expiry to queue",
                    )
                })?;

            Ok(newly_vested)
        })?;

        burn_funds(rt, fee_to_burn)?;
        notify_pledge_changed(rt, &newly_vested.neg())?;

        Ok(())
    }

    /// Checks state of the corresponding sector pre-commitment, then schedules the proof to be verified in bulk
    /// by the power actor.
    /// If valid, the power actor will call ConfirmSectorProofsValid at the end of the same epoch as this message.
    fn prove_commit_sector(
        rt: &impl Runtime,
        params: ProveCommitSectorParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_accept_any()?;

        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(illegal_argument, "sector number greater than maximum"));
        }

        if params.proof.len() > rt.policy().max_prove_commit_size {
            return Err(actor_error!(
                illegal_argument,
                "sector prove-commit proof of size {} exceeds max size of {}",
                params.proof.len(),
                rt.policy().max_prove_commit_size
            ));
        }

        let sector_number = params.sector_number;

        let st: State = rt.state()?;
        let precommit = st
            .get_precommitted_sector(rt.store(), sector_number)
            .map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    format!("failed to load pre-committed sector {}", sector_number),
                )
            })?
            .ok_or_else(|| actor_error!(not_found, "no pre-committed sector {}", sector_number))?;

        let max_seal_duration = max_prove_commit_duration(rt.policy(), precommit.info.seal_proof)
            .ok_or_else(|| {
            actor_error!(
                illegal_state,
                "no max seal duration for proof type: {:?}",
                precommit.info.seal_proof
            )
        })?;
        let prove_commit_due = precommit.pre_commit_epoch + max_seal_duration;
        if rt.curr_epoch() > prove_commit_due {
            return Err(actor_error!(
                illegal_argument,
                "commitment proof for {} too late at {}, due {}",
                sector_number,
                rt.curr_epoch(),
                prove_commit_due
            ));
        }

        let svi = get_verify_info(
            rt,
            SealVerifyParams {
                sealed_cid: precommit.info.sealed_cid,
                interactive_epoch: precommit.pre_commit_epoch
                    + rt.policy().pre_commit_challenge_delay,
                seal_rand_epoch: precommit.info.seal_rand_epoch,
                proof: params.proof,
                deal_ids: precommit.info.deal_ids.clone(),
                sector_number: precommit.info.sector_number,
                registered_seal_proof: precommit.info.seal_proof,
            },
        )?;

        rt.send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::SUBMIT_POREP_FOR_BULK_VERIFY_METHOD,
            IpldBlock::serialize_cbor(&svi)?,
            TokenAmount::zero(),
        )
        .context("failed to submit proof for bulk verification")?;
        Ok(())
    }

    fn confirm_sector_proofs_valid(
        rt: &impl Runtime,
        params: ConfirmSectorProofsParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(std::iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        // This should be enforced by the power actor. We log here just in case
        // something goes wrong.
        if params.sectors.len() > ext::power::MAX_MINER_PROVE_COMMITS_PER_EPOCH {
            warn!(
                "confirmed more prove commits in an epoch than permitted: {} > {}",
                params.sectors.len(),
                ext::power::MAX_MINER_PROVE_COMMITS_PER_EPOCH
            );
        }

        // get network stats from other actors
        let reward_stats = request_current_epoch_block_reward(rt)?;
        let power_total = request_current_total_power(rt)?;
        let circulating_supply = rt.total_fil_circ_supply();

        // 1. Activate deals, skipping pre-commits with invalid deals.
        //    - calls the market actor.
        // 2. Reschedule replacement sector expiration.
        //    - loads and saves sectors
        //    - loads and saves deadlines/partitions
        // 3. Add new sectors.
        //    - loads and saves sectors.
        //    - loads and saves deadlines/partitions
        //
        // Ideally, we'd combine some of these operations, but at least we have
        // a constant number of them.
        let state: State = rt.state()?;
        let store = rt.store();
        let info = get_miner_info(store, &state)?;

        //
        // Activate storage deals.
        //

        // This skips missing pre-commits.
        let precommitted_sectors = state
            .find_precommitted_sectors(store, &params.sectors)
            .map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    "failed to load pre-committed sectors",
                )
            })?;

        // Committed-capacity sectors licensed for early removal by new sectors being proven.
        let mut replace_sectors = DeadlineSectorMap::new();
        // Pre-commits for new sectors.
        let mut pre_commits = Vec::with_capacity(precommitted_sectors.len());

        for pre_commit in precommitted_sectors {
            if !pre_commit.info.deal_ids.is_empty() {
                // Check (and activate) storage deals associated to sector. Abort if checks failed.
                let res = rt.send(
                    &STORAGE_MARKET_ACTOR_ADDR,
                    ext::market::ACTIVATE_DEALS_METHOD,
                    IpldBlock::serialize_cbor(&ext::market::ActivateDealsParams {
                        deal_ids: pre_commit.info.deal_ids.clone(),
                        sector_expiry: pre_commit.info.expiration,
                    })?,
                    TokenAmount::zero(),
                );

                if res.is_err() {
                    info!(
                        "failed to activate deals on sector {}, dropping from prove commit set",
                        pre_commit.info.sector_number,
                    );
                    continue;
                }
            }

            if pre_commit.info.replace_capacity {
                replace_sectors
                    .add_values(
                        pre_commit.info.replace_sector_deadline,
                        pre_commit.info.replace_sector_partition,
                        &[pre_commit.info.replace_sector_number],
                    )
                    .map_err(|e| {
                        actor_error!(
                            illegal_argument,
                            "failed to record sectors for replacement: {}",
                            e
                        )
                    })?;
            }

            pre_commits.push(pre_commit);
        }

        // When all prove commits have failed abort early
        if pre_commits.is_empty() {
            return Err(actor_error!(illegal_argument, "all prove commits failed to validate"));
        }

        let (total_pledge, newly_vested, new_power) = rt.transaction(|state: &mut State, rt| {
            let store = rt.store();

            // Schedule expiration for replaced sectors to the end of their next deadline window.
            // They can't be removed right now because we want to challenge them immediately before termination.
            let replaced = state
                .reschedule_sector_expirations(
                    rt.policy(),
                    store,
                    rt.curr_epoch(),
                    info.sector_size,
                    replace_sectors,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to replace sector expirations",
                    )
                })?;

            let replaced_by_sector_number: BTreeMap<SectorNumber, SectorOnChainInfo> =
                replaced.into_iter().map(|s| (s.sector_number, s)).collect();

            let mut new_sector_numbers = Vec::<SectorNumber>::with_capacity(pre_commits.len());
            let mut total_pre_commit_deposit = TokenAmount::zero();
            let mut total_pledge = TokenAmount::zero();
            let mut new_sectors = Vec::<SectorOnChainInfo>::new();

            for pre_commit in pre_commits {
                // compute initial pledge
                let activation = rt.curr_epoch();
                let duration = pre_commit.info.expiration - activation;

                // This should have been caught in precommit, but don't let other sectors fail because of it.
                if duration < rt.policy().min_sector_expiration {
                    warn!(
                        "precommit {} has lifetime {} less than minimum {}. ignoring",
                        pre_commit.info.sector_number,
                        duration,
                        rt.policy().min_sector_expiration,
                    );
                    continue;
                }

                let power = qa_power_for_weight(
                    info.sector_size,
                    duration,
                    &pre_commit.deal_weight,
                    &pre_commit.verified_deal_weight,
                );

                let day_reward = expected_reward_for_power(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &power,
                    stor_actors_runtime::network::EPOCHS_IN_DAY,
                );

                // The storage pledge is recorded for use in computing the penalty if this sector is terminated
                // before its declared expiration.
                // It's not capped to 1 FIL, so can exceed the actual initial pledge requirement.
                let storage_pledge = expected_reward_for_power(
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &power,
                    INITIAL_PLEDGE_PROJECTION_PERIOD,
                );

                let initial_pledge = initial_pledge_for_power(
                    &power,
                    &reward_stats.this_epoch_baseline_power,
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &circulating_supply,
                );

                total_pre_commit_deposit += &pre_commit.pre_commit_deposit;
                total_pledge += &initial_pledge;

                let (replaced_sector_age, replaced_day_reward) = replaced_sector_parameters(
                    rt.curr_epoch(),
                    &pre_commit,
                    &replaced_by_sector_number,
                )?;

                let new_sector_info = SectorOnChainInfo {
                    sector_number: pre_commit.info.sector_number,
                    seal_proof: pre_commit.info.seal_proof,
                    sealed_cid: pre_commit.info.sealed_cid,
                    deal_ids: pre_commit.info.deal_ids,
                    expiration: pre_commit.info.expiration,
                    activation,
                    deal_weight: pre_commit.deal_weight,
                    verified_deal_weight: pre_commit.verified_deal_weight,
                    initial_pledge,
                    expected_day_reward: day_reward,
                    expected_storage_pledge: storage_pledge,
                    replaced_sector_age,
                    replaced_day_reward,
                };

                new_sector_numbers.push(new_sector_info.sector_number);
                new_sectors.push(new_sector_info);
            }

            state.put_sectors(store, new_sectors.clone()).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to put new sectors")
            })?;

            state
                .delete_precommitted_sectors(store, &new_sector_numbers)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to delete precommited sectors",
                    )
                })?;

            let new_power = state
                .assign_sectors_to_deadlines(
                    rt.policy(),
                    store,
                    rt.curr_epoch(),
                    new_sectors,
                    info.window_post_partition_sectors,
                    info.sector_size,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to assign new sectors to deadlines",
                    )
                })?;

            let newly_vested = state
                .unlock_vested_funds(store, rt.curr_epoch())
                .map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest new funds")
                })?;

            // Unlock deposit for successful proofs, make it available for lock-up as initial pledge.
            state
                .add_pre_commit_deposit(&total_pre_commit_deposit.clone().neg())
                .map_err(|e| {
                    actor_error!(illegal_state, "failed to release pre-commit deposits: {}", e)
                })?;

            let available_balance =
                state.get_available_balance(&rt.current_balance()).map_err(|e| {
                    actor_error!(illegal_state, "failed to calculate available balance: {}", e)
                })?;
            if available_balance < total_pledge {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds for aggregate initial pledge requirement {}, available: {}",
                    total_pledge,
                    available_balance
                ));
            }

            state.add_initial_pledge(&total_pledge).map_err(|e| {
                actor_error!(illegal_state, "failed to add initial pledge: {}", e)
            })?;

            state.check_balance_invariants(&rt.current_balance()).map_err(balance_invariants_broken)?;

            Ok((total_pledge, newly_vested, new_power))
        })?;

        // Request power and pledge update for activated sector.
        request_update_power(rt, new_power)?;
        notify_pledge_changed(rt, &(total_pledge - newly_vested))?;

        Ok(())
    }

    fn check_sector_proven(
        rt: &impl Runtime,
        params: CheckSectorProvenParams,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_accept_any()?;

        if params.sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(illegal_argument, "sector number out of range"));
        }

        let st: State = rt.state()?;

        match st.get_sector(rt.store(), params.sector_number) {
            Err(e) => Err(actor_error!(
                illegal_state,
                "failed to load proven sector {}: {}",
                params.sector_number,
                e
            )),
            Ok(None) => {
                Err(actor_error!(not_found, "sector {} not proven", params.sector_number))
            }
            Ok(Some(_sector)) => Ok(()),
        }
    }

    /// Changes the expiration epoch for a sector to a new, later one.
    /// The sector must not be terminated or faulty.
    /// The sector's power is recomputed for the new expiration.
    fn extend_sector_expiration(
        rt: &impl Runtime,
        params: ExtendSectorExpirationParams,
    ) -> Result<(), ActorError> {
        {
            let policy = rt.policy();
            if params.extensions.len() as u64 > policy.addressed_partitions_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many declarations {}, max {}",
                    params.extensions.len(),
                    policy.addressed_partitions_max
                ));
            }
        }

        // limit the number of sectors declared at once
        let mut sector_count: u64 = 0;
        for decl in &params.extensions {
            if decl.deadline >= rt.policy().wpost_period_deadlines {
                return Err(actor_error!(
                    illegal_argument,
                    "deadline {} not in range 0..{}",
                    decl.deadline,
                    rt.policy().wpost_period_deadlines
                ));
            }

            match sector_count.checked_add(decl.sectors.len()) {
                Some(sum) => sector_count = sum,
                None => {
                    return Err(actor_error!(illegal_argument, "sector bitfield integer overflow"));
                }
            }
        }

        {
            let policy = rt.policy();
            if sector_count > policy.addressed_sectors_max {
                return Err(actor_error!(
                    illegal_argument,
                    "too many sectors for declaration {}, max {}",
                    sector_count,
                    policy.addressed_sectors_max
                ));
            }
        }

        let curr_epoch = rt.curr_epoch();

        let (power_delta, pledge_delta) = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let store = rt.store();

            let mut deadlines = state.load_deadlines(store)?;

            // Group declarations by deadline, and remember iteration order.
            let mut decls_by_deadline = BTreeMap::<u64, Vec<&ExpirationExtension>>::new();
            for decl in &params.extensions {
                decls_by_deadline.entry(decl.deadline).or_default().push(decl);
            }

            let mut sectors = Sectors::load(rt.store(), &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let mut power_delta = PowerPair::zero();
            let mut pledge_delta = TokenAmount::zero();

            for (&deadline_idx, decls) in &decls_by_deadline {
                let policy = rt.policy();
                let mut deadline =
                    deadlines.load_deadline(store, deadline_idx).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", deadline_idx),
                        )
                    })?;

                let mut partitions = deadline.partitions_amt(store).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to load partitions for deadline {}", deadline_idx),
                    )
                })?;

                let quant = state.quant_spec_for_deadline(policy, deadline_idx);

                for decl in decls {
                    let mut partition = partitions
                        .get(decl.partition)
                        .map_err(|e| {
                            e.downcast_default(
                                ExitCode::USR_ILLEGAL_STATE,
                                format!("failed to load partition {:?}", decl.partition),
                            )
                        })?
                        .cloned()
                        .ok_or_else(|| {
                            actor_error!(
                                not_found,
                                "no such deadline {} partition {}",
                                deadline_idx,
                                decl.partition
                            )
                        })?;

                    let old_sectors = sectors.load_sector(&decl.sectors)?;
                    let new_sectors: Vec<SectorOnChainInfo> = old_sectors
                        .iter()
                        .map(|sector| {
                            // This can happen if the sector should have already expired, but hasn't
                            // because the end of its deadline hasn't passed yet.
                            if sector.expiration < curr_epoch {
                                return Err(actor_error!(
                                    forbidden,
                                    "cannot extend expiration for expired sector {} at {}",
                                    sector.sector_number,
                                    sector.expiration
                                ));
                            }
                            if decl.new_expiration < sector.expiration {
                                return Err(actor_error!(
                                    illegal_argument,
                                    "cannot reduce sector {} expiration to {} from {}",
                                    sector.sector_number,
                                    decl.new_expiration,
                                    sector.expiration
                                ));
                            }

                            validate_expiration(
                                policy,
                                curr_epoch,
                                sector.activation,
                                decl.new_expiration,
                                sector.seal_proof,
                            )?;

                            let mut sector = sector.clone();
                            sector.expiration = decl.new_expiration;
                            Ok(sector)
                        })
                        .collect::<Result<_, _>>()?;

                    // Overwrite sector infos.
                    sectors.store(new_sectors.clone()).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to update sectors {:?}", decl.sectors),
                        )
                    })?;

                    // Remove old sectors from partition and assign new sectors.
                    let (partition_power_delta, partition_pledge_delta) = partition
                        .replace_sectors(store, &old_sectors, &new_sectors, info.sector_size, quant)
                        .map_err(|e| {
                            e.downcast_default(
                                ExitCode::USR_ILLEGAL_STATE,
                                format!(
                                    "failed to replace sector expirations at deadline {} partition {}",
                                    deadline_idx, decl.partition
                                ),
                            )
                        })?;

                    power_delta += &partition_power_delta;
                    pledge_delta += partition_pledge_delta; // expected to be zero, see note below.

                    partitions.set(decl.partition, partition).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to save partition {}", decl.partition),
                        )
                    })?;
                }

                deadline.partitions = partitions.flush().map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to save partitions for deadline {}", deadline_idx),
                    )
                })?;

                deadlines.update_deadline(store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to save deadline {}", deadline_idx),
                    )
                })?;
            }

            state.sectors = sectors.amt.flush().map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save sectors")
            })?;
            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok((power_delta, pledge_delta))
        })?;

        request_update_power(rt, power_delta)?;
        // Note: the pledge delta is expected to be zero, since pledge is not re-calculated for the extension.
        // But in case that ever changes, we can do the right thing here.
        notify_pledge_changed(rt, &pledge_delta)?;
        Ok(())
    }

    /// Marks some sectors as terminated at the present epoch, earlier than their
    /// scheduled termination, and adds these sectors to the early termination queue.
    /// This method then processes up to AddressedSectorsMax sectors and
    /// AddressedPartitionsMax partitions from the early termination queue,
    /// terminating deals, paying fines, and returning pledge collateral. While
    /// sectors remain in this queue:
    ///
    ///  1. The miner will be unable to withdraw funds.
    ///  2. The chain will process up to AddressedSectorsMax sectors and
    ///     AddressedPartitionsMax per epoch until the queue is empty.
    ///
    /// The sectors are immediately ignored for Window PoSt proofs, and should be
    /// masked in the same way as faulty sectors. A miner terminating sectors in the
    /// current deadline must be careful to compute an appropriate Window PoSt proof
    /// for the sectors that will be active at the time the PoSt is submitted.
    ///
    /// This function may be invoked with no new sectors to explicitly process the
    /// next batch of sectors.
    fn terminate_sectors(
        rt: &impl Runtime,
        params: TerminateSectorsParams,
    ) -> Result<TerminateSectorsReturn, ActorError> {
        // Note: this cannot terminate pre-committed but un-proven sectors.
        // They must be allowed to expire (and deposit burnt).
        let mut to_process = DeadlineSectorMap::new();

        for term in params.terminations {
            let deadline = term.deadline;
            let partition = term.partition;

            to_process.add(deadline, partition, term.sectors).map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "failed to process deadline {}, partition {}: {}",
                    deadline,
                    partition,
                    e
                )
            })?;
        }

        {
            let policy = rt.policy();
            to_process
                .check(policy.addressed_partitions_max, policy.addressed_sectors_max)
                .map_err(|e| {
                    actor_error!(illegal_argument, "cannot process requested parameters: {}", e)
                })?;
        }

        let (had_early_terminations, power_delta) = rt.transaction(|state: &mut State, rt| {
            let had_early_terminations = have_pending_early_terminations(state);

            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let store = rt.store();
            let curr_epoch = rt.curr_epoch();
            let mut power_delta = PowerPair::zero();

            let mut deadlines = state.load_deadlines(store)?;

            // We're only reading the sectors, so there's no need to save this back.
            // However, we still want to avoid re-loading this array per-partition.
            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors")
            })?;

            for (deadline_idx, partition_sectors) in to_process.iter() {
                let quant = state.quant_spec_for_deadline(rt.policy(), deadline_idx);
                let mut deadline =
                    deadlines.load_deadline(store, deadline_idx).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", deadline_idx),
                        )
                    })?;

                let removed_power = deadline
                    .terminate_sectors(
                        store,
                        &sectors,
                        curr_epoch,
                        partition_sectors,
                        info.sector_size,
                        quant,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to terminate sectors in deadline {}", deadline_idx),
                        )
                    })?;

                state.early_terminations.set(deadline_idx);
                power_delta -= &removed_power;

                deadlines.update_deadline(store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to update deadline {}", deadline_idx),
                    )
                })?;
            }

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok((had_early_terminations, power_delta))
        })?;

        // Now, try to process these sectors.
        let more = process_early_terminations(rt)?;

        if more && !had_early_terminations {
            // We have remaining terminations, and we didn't _previously_
            // have early terminations to process, schedule a cron job.
            // NOTE: This isn't quite correct. If we repeatedly fill, empty,
            // fill, and empty, the queue, we'll keep scheduling new cron
            // jobs. However, in practice, that shouldn't be all that bad.
            schedule_early_termination_work(rt)?;
        }

        request_update_power(rt, power_delta)?;

        Ok(TerminateSectorsReturn { done: !more })
    }

    fn declare_faults(rt: &impl Runtime, params: DeclareFaultsParams) -> Result<(), ActorError> {
        let mut to_process = DeadlineSectorMap::new();

        for term in params.faults {
            let deadline = term.deadline;
            let partition = term.partition;

            to_process.add(deadline, partition, term.sectors).map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "failed to process deadline {}, partition {}: {}",
                    deadline,
                    partition,
                    e
                )
            })?;
        }

        {
            let policy = rt.policy();
            to_process
                .check(policy.addressed_partitions_max, policy.addressed_sectors_max)
                .map_err(|e| {
                    actor_error!(illegal_argument, "cannot process requested parameters: {}", e)
                })?;
        }

        let power_delta = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let store = rt.store();

            let mut deadlines = state.load_deadlines(store)?;

            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let mut power_delta = PowerPair::zero();

            for (deadline_idx, partition_map) in to_process.iter() {
                let policy = rt.policy();
                let target_deadline = declaration_deadline_info(
                    policy,
                    state.proving_period_start,
                    deadline_idx,
                    rt.curr_epoch(),
                )
                .map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "invalid fault declaration deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                validate_fr_declaration_deadline(&target_deadline).map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "failed fault declaration at deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                let mut deadline =
                    deadlines.load_deadline(store, deadline_idx).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", deadline_idx),
                        )
                    })?;

                let fault_expiration_epoch = target_deadline.last() + policy.fault_max_age;

                let deadline_power_delta = deadline
                    .record_faults(
                        store,
                        &sectors,
                        info.sector_size,
                        target_deadline.quant_spec(),
                        fault_expiration_epoch,
                        partition_map,
                    )
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to declare faults for deadline {}", deadline_idx),
                        )
                    })?;

                deadlines.update_deadline(store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to store deadline {} partitions", deadline_idx),
                    )
                })?;

                power_delta += &deadline_power_delta;
            }

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok(power_delta)
        })?;

        // Remove power for new faulty sectors.
        // NOTE: It would be permissible to delay the power loss until the deadline closes, but that would require
        // additional accounting state.
        request_update_power(rt, power_delta)?;

        // Payment of penalty for declared faults is deferred to the deadline cron.
        Ok(())
    }

    fn declare_faults_recovered(
        rt: &impl Runtime,
        params: DeclareFaultsRecoveredParams,
    ) -> Result<(), ActorError> {
        let mut to_process = DeadlineSectorMap::new();

        for term in params.recoveries {
            let deadline = term.deadline;
            let partition = term.partition;

            to_process.add(deadline, partition, term.sectors).map_err(|e| {
                actor_error!(
                    illegal_argument,
                    "failed to process deadline {}, partition {}: {}",
                    deadline,
                    partition,
                    e
                )
            })?;
        }

        {
            let policy = rt.policy();
            to_process
                .check(policy.addressed_partitions_max, policy.addressed_sectors_max)
                .map_err(|e| {
                    actor_error!(illegal_argument, "cannot process requested parameters: {}", e)
                })?;
        }

        let fee_to_burn = rt.transaction(|state: &mut State, rt| {
            // Verify unlocked funds cover both InitialPledgeRequirement and FeeDebt
            // and repay fee debt now.
            let fee_to_burn = repay_debts_or_abort(rt, state)?;

            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            if consensus_fault_active(&info, rt.curr_epoch()) {
                return Err(actor_error!(
                    forbidden,
                    "recovery not allowed during active consensus fault"
                ));
            }

            let store = rt.store();

            let mut deadlines = state.load_deadlines(store)?;

            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            for (deadline_idx, partition_map) in to_process.iter() {
                let policy = rt.policy();
                let target_deadline = declaration_deadline_info(
                    policy,
                    state.proving_period_start,
                    deadline_idx,
                    rt.curr_epoch(),
                )
                .map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "invalid recovery declaration deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                validate_fr_declaration_deadline(&target_deadline).map_err(|e| {
                    actor_error!(
                        illegal_argument,
                        "failed recovery declaration at deadline {}: {}",
                        deadline_idx,
                        e
                    )
                })?;

                let mut deadline =
                    deadlines.load_deadline(store, deadline_idx).map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to load deadline {}", deadline_idx),
                        )
                    })?;

                deadline
                    .declare_faults_recovered(store, &sectors, info.sector_size, partition_map)
                    .map_err(|e| {
                        e.downcast_default(
                            ExitCode::USR_ILLEGAL_STATE,
                            format!("failed to declare recoveries for deadline {}", deadline_idx),
                        )
                    })?;

                deadlines.update_deadline(store, deadline_idx, &deadline).map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to store deadline {}", deadline_idx),
                    )
                })?;
            }

            state.save_deadlines(store, deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok(fee_to_burn)
        })?;

        burn_funds(rt, fee_to_burn)?;

        // Power is not restored yet, but when the recovered sectors are successfully PoSted.
        Ok(())
    }

    /// Compacts a number of partitions at one deadline by removing terminated sectors, re-ordering the remaining sectors,
    /// and assigning them to new partitions so as to completely fill all but one partition with live sectors.
    /// The addressed partitions are removed from the deadline, and new ones appended.
    /// The final partition in the deadline is always included in the compaction, whether or not explicitly requested.
    /// Removed sectors are removed from state entirely.
    /// May not be invoked if the deadline has any un-processed early terminations.
    fn compact_partitions(
        rt: &impl Runtime,
        params: CompactPartitionsParams,
    ) -> Result<(), ActorError> {
        if params.deadline >= rt.policy().wpost_period_deadlines {
            return Err(actor_error!(illegal_argument, "invalid deadline {}", params.deadline));
        }

        let partition_count = params.partitions.len();

        rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            let policy = rt.policy();
            if !deadline_is_mutable(
                policy,
                state.proving_period_start,
                params.deadline,
                rt.curr_epoch(),
            ) {
                return Err(actor_error!(
                    forbidden,
                    "cannot compact deadline {} during its challenge window or the prior challenge window",
                    params.deadline
                ));
            }

            let submission_partition_limit =
                load_partitions_sectors_max(policy, info.window_post_partition_sectors);
            if partition_count > submission_partition_limit {
                return Err(actor_error!(
                    illegal_argument,
                    "too many partitions {}, limit {}",
                    partition_count,
                    submission_partition_limit
                ));
            }

            let quant = state.quant_spec_for_deadline(policy, params.deadline);
            let mut deadlines = state.load_deadlines(rt.store())?;

            let mut deadline = deadlines.load_deadline(rt.store(), params.deadline).map_err(
                |e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to load deadline {}", params.deadline),
                    )
                },
            )?;

            let (live, dead, removed_power) = deadline
                .remove_partitions(rt.store(), &params.partitions, quant)
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        format!("failed to remove partitions from deadline {}", params.deadline),
                    )
                })?;

            state.delete_sectors(rt.store(), &dead).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to delete dead sectors")
            })?;

            let sectors = state.load_sector_infos(rt.store(), &live).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load moved sectors")
            })?;

            let proven = true;
            let added_power = deadline
                .add_sectors(
                    rt.store(),
                    info.window_post_partition_sectors,
                    proven,
                    &sectors,
                    info.sector_size,
                    quant,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to add back moved sectors",
                    )
                })?;

            if removed_power != added_power {
                return Err(actor_error!(
                    illegal_state,
                    "power changed when compacting partitions: was {:?}, is now {:?}",
                    removed_power,
                    added_power
                ));
            }

            deadlines.update_deadline(rt.store(), params.deadline, &deadline).map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    format!("failed to update deadline {}", params.deadline),
                )
            })?;

            state.save_deadlines(rt.store(), deadlines).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to save deadlines")
            })?;

            Ok(())
        })?;

        Ok(())
    }

    /// Compacts sector number allocations to reduce the size of the allocated sector
    /// number bitfield.
    ///
    /// When allocating sector numbers sequentially, or in sequential groups, this
    /// bitfield should remain fairly small. However, if the bitfield grows large
    /// enough such that PreCommitSector fails (or becomes expensive), this method
    /// can be called to mask out (throw away) entire ranges of unused sector IDs.
    /// For example, if sectors 1-99 and 101-200 have been allocated, sector number
    /// 99 can be masked out to collapse these two ranges into one.
    fn compact_sector_numbers(
        rt: &impl Runtime,
        params: CompactSectorNumbersParams,
    ) -> Result<(), ActorError> {
        let last_sector_number = params
            .mask_sector_numbers
            .last()
            .ok_or_else(|| actor_error!(illegal_argument, "invalid mask bitfield"))?;

        if last_sector_number > MAX_SECTOR_NUMBER {
            return Err(actor_error!(
                illegal_argument,
                "masked sector number {} exceeded max sector number",
                last_sector_number
            ));
        }

        rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses.iter().chain(&[info.worker, info.owner]),
            )?;

            state.mask_sector_numbers(rt.store(), &params.mask_sector_numbers)
        })?;

        Ok(())
    }

    /// Locks up some amount of the miner's unlocked balance (including funds received alongside the invoking message).
    fn add_locked_fund(rt: &impl Runtime, amount_to_lock: TokenAmount) -> Result<(), ActorError> {
        if amount_to_lock.is_negative() {
            return Err(actor_error!(
                illegal_argument,
                "cannot lock up a negative amount of funds"
            ));
        }

        let newly_vested = rt.transaction(|state: &mut State, rt| {
            let info = get_miner_info(rt.store(), state)?;

            rt.validate_immediate_caller_is(
                info.control_addresses
                    .iter()
                    .chain(&[info.worker, info.owner, REWARD_ACTOR_ADDR]),
            )?;

            // This may lock up unlocked balance that was covering InitialPledgeRequirements.
            // This ensures that the amount to lock is always locked up if the miner account
            // can cover it.
            let unlocked_balance =
                state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                    actor_error!(illegal_state, "failed to calculate unlocked balance: {}", e)
                })?;
            if unlocked_balance < amount_to_lock {
                return Err(actor_error!(
                    insufficient_funds,
                    "insufficient funds to lock, available: {}, requested: {}",
                    unlocked_balance,
                    amount_to_lock
                ));
            }

            let newly_vested = state
                .add_locked_funds(
                    rt.store(),
                    rt.curr_epoch(),
                    &amount_to_lock,
                    &REWARD_VESTING_SPEC,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to lock funds in vesting table",
                    )
                })?;

            Ok(newly_vested)
        })?;

        notify_pledge_changed(rt, &(amount_to_lock - newly_vested))?;

        Ok(())
    }

    fn report_consensus_fault(
        rt: &impl Runtime,
        params: ReportConsensusFaultParams,
    ) -> Result<(), ActorError> {
        // Note: only the first report of any fault is processed because it sets the
        // ConsensusFaultElapsed state variable to an epoch after the fault, and reports prior to
        // that epoch are no longer valid
        rt.validate_immediate_caller_type(CALLER_TYPES_SIGNABLE.iter())?;
        let reporter = rt.message().caller();

        let fault = rt
            .verify_consensus_fault(&params.header1, &params.header2, &params.header_extra)
            .map_err(|e| {
                actor_error!(illegal_argument, "fault not verified: {}", e)
            })?
            .ok_or_else(|| actor_error!(illegal_argument, "No consensus fault found"))?;
        if fault.target != rt.message().receiver() {
            return Err(actor_error!(
                illegal_argument,
                "fault by {} reported to miner {}",
                fault.target,
                rt.message().receiver()
            ));
        }

        // Elapsed since the fault (i.e. since the higher of the two blocks)
        let fault_age = rt.curr_epoch() - fault.epoch;
        if fault_age <= 0 {
            return Err(actor_error!(
                illegal_argument,
                "invalid fault epoch {} ahead of current {}",
                fault.epoch,
                rt.curr_epoch()
            ));
        }

        // Penalize miner consensus fault fee
        // Give a portion of this to the reporter as reward
        let reward_stats = request_current_epoch_block_reward(rt)?;

        // The policy amounts we should burn and send to reporter
        // These may differ from actual funds send when miner goes into fee debt
        let fault_penalty = consensus_fault_penalty(TokenAmount::from_atto(
            reward_stats.this_epoch_reward_smoothed.estimate(),
        ));
        let slasher_reward = reward_for_consensus_slash_report(fault_age, &fault_penalty);

        let mut pledge_delta = TokenAmount::zero();

        let (burn_amount, reward_amount) = rt.transaction(|st: &mut State, rt| {
            // The amounts actually sent to burnt funds and reporter
            let unlocked_balance = st.get_unlocked_balance(&rt.current_balance()).map_err(
                |e| actor_error!(illegal_state, "failed to compute unlocked balance: {}", e),
            )?;
            let (penalty_from_vesting, penalty_from_balance) = st
                .penalize_funds_in_priority_order(
                    rt.store(),
                    rt.curr_epoch(),
                    &fault_penalty,
                    &unlocked_balance,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to unlock unvested funds",
                    )
                })?;

            // Burn the amount actually payable. Any difference in this and `fault_penalty` already
            // recorded as FeeDebt
            let mut burn_amount = &penalty_from_vesting + &penalty_from_balance;
            pledge_delta -= penalty_from_vesting;

            // clamp reward at funds burnt
            let reward_amount = cmp::min(&burn_amount, &slasher_reward).clone();
            burn_amount -= &reward_amount;

            let mut info = get_miner_info(rt.store(), st)?;

            // Mark the miner as ineligible for future block elections and
            // certain methods for the ineligibility duration.
            info.consensus_fault_elapsed =
                rt.curr_epoch() + rt.policy().consensus_fault_ineligibility_duration;

            st.save_info(rt.store(), &info).map_err(|e| {
                e.downcast_default(ExitCode::USR_SERIALIZATION, "failed to save miner info")
            })?;

            Ok((burn_amount, reward_amount))
        })?;

        if let Err(e) =
            rt.send(&reporter, METHOD_SEND, None, reward_amount)
        {
            log::error!("failed to send reward: {}", e.msg());
        }

        burn_funds(rt, burn_amount)?;
        notify_pledge_changed(rt, &pledge_delta)?;

        Ok(())
    }

    fn withdraw_balance(
        rt: &impl Runtime,
        params: WithdrawBalanceParams,
    ) -> Result<(), ActorError> {
        if params.amount_requested.is_negative() {
            return Err(actor_error!(
                illegal_argument,
                "negative fund requested for withdrawal: {}",
                params.amount_requested
            ));
        }

        let (owner, newly_vested, fee_to_burn, available_balance, state) =
            rt.transaction(|state: &mut State, rt| {
                let info = get_miner_info(rt.store(), state)?;

                // Only the owner is allowed to withdraw the balance as it belongs to/is controlled by the owner
                // and not the worker.
                rt.validate_immediate_caller_is(std::iter::once(&info.owner))?;

                // Ensure we don't have any pending terminations.
                if !state.early_terminations.is_empty() {
                    return Err(actor_error!(
                        forbidden,
                        "cannot withdraw funds while {} deadlines have terminated sectors \
                        with outstanding fees",
                        state.early_terminations.len()
                    ));
                }

                // Unlock vested funds so we can spend them.
                let newly_vested =
                    state.unlock_vested_funds(rt.store(), rt.curr_epoch()).map_err(|e| {
                        e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest fund")
                    })?;

                // available balance already accounts for fee debt so it is correct to call
                // this before repay_debts_or_abort. We would have to
                // subtract fee debt explicitly if we called this after.
                let available_balance =
                    state.get_available_balance(&rt.current_balance()).map_err(|e| {
                        actor_error!(
                            illegal_state,
                            "failed to calculate available balance: {}",
                            e
                        )
                    })?;

                // Verify unlocked funds cover both InitialPledgeRequirement and FeeDebt
                // and repay fee debt now.
                let fee_to_burn = repay_debts_or_abort(rt, state)?;

                Ok((info.owner, newly_vested, fee_to_burn, available_balance, state.clone()))
            })?;

        let amount_withdrawn = cmp::min(&available_balance, &params.amount_requested);
        if amount_withdrawn.is_negative() {
            return Err(actor_error!(
                illegal_state,
                "negative amount to withdraw: {}",
                amount_withdrawn
            ));
        }

        if amount_withdrawn.is_positive() {
            rt.send(&owner, METHOD_SEND, None, amount_withdrawn.clone())?;
        }

        burn_funds(rt, fee_to_burn)?;
        notify_pledge_changed(rt, &newly_vested.neg())?;

        state
            .check_balance_invariants(&rt.current_balance())
            .map_err(balance_invariants_broken)?;
        Ok(())
    }

    fn on_deferred_cron_event(
        rt: &impl Runtime,
        payload: CronEventPayload,
    ) -> Result<(), ActorError> {
        rt.validate_immediate_caller_is(std::iter::once(&STORAGE_POWER_ACTOR_ADDR))?;

        match payload.event_type {
            CRON_EVENT_PROVING_DEADLINE => handle_proving_deadline(rt)?,
            CRON_EVENT_WORKER_KEY_CHANGE => commit_worker_key_change(rt)?,
            CRON_EVENT_PROCESS_EARLY_TERMINATIONS => {
                if process_early_terminations(rt)? {
                    schedule_early_termination_work(rt)?
                }
            }
            _ => {
                // A failure to process any given event should not prevent
                // subsequent events from being processed; unrecognized event
                // types are simply ignored.
                warn!("unknown cron event type: {}", payload.event_type);
            }
        };

        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Utility functions & helpers
////////////////////////////////////////////////////////////////////////////////

/// Invoked at the end of the last epoch for each proving deadline.
fn handle_proving_deadline(rt: &impl Runtime) -> Result<(), ActorError> {
    let curr_epoch = rt.curr_epoch();

    let epoch_reward = request_current_epoch_block_reward(rt)?;
    let power_total = request_current_total_power(rt)?;

    let mut had_early_terminations = false;

    let mut power_delta_total = PowerPair::zero();
    let mut penalty_total = TokenAmount::zero();
    let mut pledge_delta_total = TokenAmount::zero();

    let state: State = rt.transaction(|state: &mut State, rt| {
        let policy = rt.policy();

        // Vest locked funds.
        // This happens first so that any subsequent penalties are taken
        // from locked vesting funds before funds free this epoch.
        let newly_vested = state
            .unlock_vested_funds(rt.store(), curr_epoch)
            .map_err(|e| e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to vest funds"))?;
        pledge_delta_total -= &newly_vested;

        // Expire pre-committed sectors.
        let deposit_to_burn = state
            .cleanup_expired_pre_commits(rt.store(), curr_epoch)
            .map_err(|e| {
                e.downcast_default(
                    ExitCode::USR_ILLEGAL_STATE,
                    "failed to expire pre-committed sectors",
                )
            })?;
        penalty_total += &deposit_to_burn;

        // Record whether or not we _had_ early terminations in the queue before this method.
        // That way, don't re-schedule a cron callback if one is already scheduled.
        had_early_terminations = have_pending_early_terminations(state);

        let result = state.advance_deadline(policy, rt.store(), curr_epoch).map_err(|e| {
            e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to advance deadline")
        })?;

        // Charge detected faults as undeclared.
        let undeclared_penalty = pledge_penalty_for_undeclared_fault(
            &epoch_reward.this_epoch_reward_smoothed,
            &power_total.quality_adj_power_smoothed,
            &result.detected_faulty_power.qa,
        );

        // Charge the rest of the still-faulty power as declared.
        let declared_penalty = pledge_penalty_for_declared_fault(
            &epoch_reward.this_epoch_reward_smoothed,
            &power_total.quality_adj_power_smoothed,
            &(&result.total_faulty_power.qa - &result.detected_faulty_power.qa),
        );

        power_delta_total += &result.power_delta;
        pledge_delta_total += &result.pledge_delta;

        let penalty_target = undeclared_penalty + declared_penalty;
        if !penalty_target.is_zero() {
            let unlocked_balance =
                state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                    actor_error!(illegal_state, "failed to compute unlocked balance: {}", e)
                })?;
            let (penalty_from_vesting, penalty_from_balance) = state
                .penalize_funds_in_priority_order(
                    rt.store(),
                    curr_epoch,
                    &penalty_target,
                    &unlocked_balance,
                )
                .map_err(|e| {
                    e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to unlock penalty")
                })?;
            penalty_total += &penalty_from_vesting;
            penalty_total += &penalty_from_balance;
            pledge_delta_total -= &penalty_from_vesting;
        }

        Ok(state.clone())
    })?;

    // Remove power for new faults, and burn penalties.
    request_update_power(rt, power_delta_total)?;
    burn_funds(rt, penalty_total)?;
    notify_pledge_changed(rt, &pledge_delta_total)?;

    // Schedule cron callback for next deadline's last epoch.
    let new_deadline_info = state.deadline_info(rt.policy(), curr_epoch);
    enroll_cron_event(
        rt,
        new_deadline_info.last(),
        CronEventPayload { event_type: CRON_EVENT_PROVING_DEADLINE },
    )?;

    // Record whether or not we _have_ early terminations now.
    let has_early_terminations = have_pending_early_terminations(&state);

    // If we didn't have pending early terminations before, but we do now,
    // handle them at the next epoch.
    if !had_early_terminations && has_early_terminations {
        // First, try to process some of these terminations.
        if process_early_terminations(rt)? {
            // If that doesn't work, just defer till the next epoch.
            schedule_early_termination_work(rt)?;
        }

        // Note: _don't_ process early terminations if we had a cron
        // callback already scheduled. In that case, we'll already have
        // processed AddressedSectorsMax terminations this epoch.
    }

    Ok(())
}

/// Processes pending early terminations, burning termination fees, releasing
/// pledge, and notifying the market actor of terminated deals.
/// Returns true if there is still termination work outstanding.
fn process_early_terminations(rt: &impl Runtime) -> Result</* more */ bool, ActorError> {
    let reward_stats = request_current_epoch_block_reward(rt)?;
    let power_total = request_current_total_power(rt)?;

    let (result, more, deals_to_terminate, penalty, pledge_delta) =
        rt.transaction(|state: &mut State, rt| {
            let store = rt.store();
            let policy = rt.policy();

            let (result, more) = state
                .pop_early_terminations(
                    store,
                    policy.addressed_partitions_max,
                    policy.addressed_sectors_max,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to pop early terminations",
                    )
                })?;

            // Nothing to do, don't waste any time.
            // This can happen if we end up processing early terminations
            // before the cron callback fires.
            if result.is_empty() {
                return Ok((
                    result,
                    more,
                    Vec::new(),
                    TokenAmount::zero(),
                    TokenAmount::zero(),
                ));
            }

            let info = get_miner_info(rt.store(), state)?;
            let sectors = Sectors::load(store, &state.sectors).map_err(|e| {
                e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "failed to load sectors array")
            })?;

            let mut total_initial_pledge = TokenAmount::zero();
            let mut deals_to_terminate =
                Vec::<ext::market::OnMinerSectorsTerminateParams>::with_capacity(
                    result.sectors.len(),
                );
            let mut penalty = TokenAmount::zero();

            for (epoch, sector_numbers) in result.iter() {
                let sectors = sectors
                    .load_sector(sector_numbers)
                    .map_err(|e| e.wrap("failed to load sector infos"))?;

                penalty += termination_penalty(
                    info.sector_size,
                    epoch,
                    &reward_stats.this_epoch_reward_smoothed,
                    &power_total.quality_adj_power_smoothed,
                    &sectors,
                );

                // estimate ~one deal per sector.
                let mut deal_ids = Vec::<DealID>::with_capacity(sectors.len());
                for sector in sectors {
                    deal_ids.extend(sector.deal_ids);
                    total_initial_pledge += sector.initial_pledge;
                }

                let params = ext::market::OnMinerSectorsTerminateParams { epoch, deal_ids };
                deals_to_terminate.push(params);
            }

            // Unlock funds for penalties.
            // We're intentionally reducing the penalty paid to what we have.
            let unlocked_balance =
                state.get_unlocked_balance(&rt.current_balance()).map_err(|e| {
                    actor_error!(illegal_state, "failed to compute unlocked balance: {}", e)
                })?;
            let (penalty_from_vesting, penalty_from_balance) = state
                .penalize_funds_in_priority_order(
                    store,
                    rt.curr_epoch(),
                    &penalty,
                    &unlocked_balance,
                )
                .map_err(|e| {
                    e.downcast_default(
                        ExitCode::USR_ILLEGAL_STATE,
                        "failed to unlock unvested funds",
                    )
                })?;

            let penalty = &penalty_from_vesting + &penalty_from_balance;

            // Remove pledge requirement.
            state.add_initial_pledge(&total_initial_pledge.clone().neg()).map_err(|e| {
                actor_error!(illegal_state, "failed to release initial pledge: {}", e)
            })?;
            let pledge_delta = (total_initial_pledge + penalty_from_vesting).neg();

            Ok((result, more, deals_to_terminate, penalty, pledge_delta))
        })?;

    // We didn't do anything, abort.
    if result.is_empty() {
        return Ok(more);
    }

    // Burn penalty.
    burn_funds(rt, penalty)?;

    // Return pledge.
    notify_pledge_changed(rt, &pledge_delta)?;

    // Terminate deals.
    for params in deals_to_terminate {
        request_terminate_deals(rt, params.epoch, params.deal_ids)?;
    }

    // reschedule cron worker, if necessary.
    Ok(more)
}

fn validate_expiration(
    policy: &Policy,
    curr_epoch: ChainEpoch,
    activation: ChainEpoch,
    expiration: ChainEpoch,
    seal_proof: RegisteredSealProof,
) -> Result<(), ActorError> {
    // Expiration must be after activation. Check this explicitly to avoid an underflow below.
    if expiration <= activation {
        return Err(actor_error!(
            illegal_argument,
            "sector expiration {} must be after activation {}",
            expiration,
            activation
        ));
    }

    // expiration cannot be less than minimum after activation
    if expiration - activation < policy.min_sector_expiration {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, total sector lifetime ({}) must exceed {} after activation {}",
            expiration,
            expiration - activation,
            policy.min_sector_expiration,
            activation
        ));
    }

    // expiration cannot exceed MaxSectorExpirationExtension from now
    if expiration > curr_epoch + policy.max_sector_expiration_extension {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, cannot be more than {} past current epoch {}",
            expiration,
            policy.max_sector_expiration_extension,
            curr_epoch
        ));
    }

    // total sector lifetime cannot exceed SectorMaximumLifetime for the sector's seal proof
    let max_lifetime = seal_proof_sector_maximum_lifetime(seal_proof).ok_or_else(|| {
        actor_error!(illegal_argument, "unrecognized seal proof type {:?}", seal_proof)
    })?;
    if expiration - activation > max_lifetime {
        return Err(actor_error!(
            illegal_argument,
            "invalid expiration {}, total sector lifetime ({}) cannot exceed {} after activation {}",
            expiration,
            expiration - activation,
            max_lifetime,
            activation
        ));
    }

    Ok(())
}

fn validate_replace_sector<BS>(
    state: &State,
    store: &BS,
    params: &SectorPreCommitInfo,
) -> Result<SectorOnChainInfo, ActorError>
where
    BS: fvm_ipld_blockstore::Blockstore,
{
    let replace_sector = state
        .get_sector(store, params.replace_sector_number)
        .map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                format!("failed to load sector {}", params.replace_sector_number),
            )
        })?
        .ok_or_else(|| {
            actor_error!(
                not_found,
                "no such sector {} to replace",
                params.replace_sector_number
            )
        })?;

    if !replace_sector.deal_ids.is_empty() {
        return Err(actor_error!(
            illegal_argument,
            "cannot replace sector {} which has deals",
            params.replace_sector_number
        ));
    }

    if params.seal_proof != replace_sector.seal_proof {
        return Err(actor_error!(
            illegal_argument,
            "cannot replace sector {} seal proof {:?} with seal proof {:?}",
            params.replace_sector_number,
            replace_sector.seal_proof,
            params.seal_proof
        ));
    }

    if params.expiration < replace_sector.expiration {
        return Err(actor_error!(
            illegal_argument,
            "cannot replace sector {} expiration {} with sooner expiration {}",
            params.replace_sector_number,
            replace_sector.expiration,
            params.expiration
        ));
    }

    state
        .check_sector_health(
            store,
            params.replace_sector_deadline,
            params.replace_sector_partition,
            params.replace_sector_number,
        )
        .map_err(|e| {
            e.downcast_default(
                ExitCode::USR_ILLEGAL_STATE,
                format!("failed to replace sector {}", params.replace_sector_number),
            )
        })?;

    Ok(replace_sector)
}

fn enroll_cron_event(
    rt: &impl Runtime,
    event_epoch: ChainEpoch,
    cb: CronEventPayload,
) -> Result<(), ActorError> {
    let payload = serialize(&cb, "cron payload")?;
    let ser_params =
        IpldBlock::serialize_cbor(&ext::power::EnrollCronEventParams { event_epoch, payload })?;
    rt.send(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::ENROLL_CRON_EVENT_METHOD,
        ser_params,
        TokenAmount::zero(),
    )
    .context("failed to enroll cron event")?;
    Ok(())
}

fn request_update_power(rt: &impl Runtime, delta: PowerPair) -> Result<(), ActorError> {
    if delta.is_zero() {
        return Ok(());
    }

    let delta_clone = delta.clone();

    rt.send(
        &STORAGE_POWER_ACTOR_ADDR,
        ext::power::UPDATE_CLAIMED_POWER_METHOD,
        IpldBlock::serialize_cbor(&ext::power::UpdateClaimedPowerParams {
            raw_byte_delta: delta.raw,
            quality_adjusted_delta: delta.qa,
        })?,
        TokenAmount::zero(),
    )
    .map_err(|e| e.wrap(format!("failed to update power with {:?}", delta_clone)))?;

    Ok(())
}

fn request_terminate_deals(
    rt: &impl Runtime,
    epoch: ChainEpoch,
    deal_ids: Vec<DealID>,
) -> Result<(), ActorError> {
    const MAX_LENGTH: usize = ext::market::MAX_SECTOR_TERMINATION_DEALS;

    for chunk in deal_ids.chunks(MAX_LENGTH) {
        rt.send(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::ON_MINER_SECTORS_TERMINATE_METHOD,
            IpldBlock::serialize_cbor(&ext::market::OnMinerSectorsTerminateParams {
                epoch,
                deal_ids: chunk.to_vec(),
            })?,
            TokenAmount::zero(),
        )
        .context("failed to terminate deals")?;
    }

    Ok(())
}

fn schedule_early_termination_work(rt: &impl Runtime) -> Result<(), ActorError> {
    info!("scheduling early terminations with cron...");
    enroll_cron_event(
        rt,
        rt.curr_epoch() + 1,
        CronEventPayload { event_type: CRON_EVENT_PROCESS_EARLY_TERMINATIONS },
    )
}

fn have_pending_early_terminations(state: &State) -> bool {
    let no_early_terminations = state.early_terminations.is_empty();
    !no_early_terminations
}

fn verify_windowed_post(
    rt: &impl Runtime,
    challenge_epoch: ChainEpoch,
    sectors: &[SectorOnChainInfo],
    proofs: Vec<fvm_shared::sector::PoStProof>,
) -> Result<(), ActorError> {
    let miner_actor_id: u64 = if let Payload::ID(i) = rt.message().receiver().payload() {
        *i
    } else {
        return Err(actor_error!(
            illegal_state,
            "runtime provided non-ID receiver address {}",
            rt.message().receiver()
        ));
    };

    // Regenerate challenge randomness, which must match that generated for the proof.
    let entropy = serialize_vec(&rt.message().receiver(), "address for window post challenge")?;
    let randomness = rt.get_randomness_from_beacon(
        DomainSeparationTag::WindowedPoStChallengeSeed,
        challenge_epoch,
        &entropy,
    )?;

    let challenged_sectors = sectors
        .iter()
        .map(|s| SectorInfo {
            proof: s.seal_proof,
            sector_number: s.sector_number,
            sealed_cid: s.sealed_cid,
        })
        .collect();

    // get public inputs
    let pv_info = WindowPoStVerifyInfo {
        randomness: Randomness(randomness.into()),
        proofs,
        challenged_sectors,
        prover: miner_actor_id,
    };

    // verify the post proof
    rt.verify_post(&pv_info).map_err(|e| {
        e.downcast_default(ExitCode::USR_ILLEGAL_ARGUMENT, "invalid PoSt")
    })?;

    Ok(())
}

struct SealVerifyParams {
    sealed_cid: Cid,
    interactive_epoch: ChainEpoch,
    seal_rand_epoch: ChainEpoch,
    proof: Vec<u8>,
    deal_ids: Vec<DealID>,
    sector_number: SectorNumber,
    registered_seal_proof: RegisteredSealProof,
}

fn get_verify_info(
    rt: &impl Runtime,
    params: SealVerifyParams,
) -> Result<SealVerifyInfo, ActorError> {
    if rt.curr_epoch() <= params.interactive_epoch {
        return Err(actor_error!(forbidden, "too early to prove sector"));
    }

    let commd = request_unsealed_sector_cid(rt, params.registered_seal_proof, &params.deal_ids)?;

    let miner_actor_id: u64 = if let Payload::ID(i) = rt.message().receiver().payload() {
        *i
    } else {
        return Err(actor_error!(
            illegal_state,
            "runtime provided non-ID receiver address {}",
            rt.message().receiver()
        ));
    };

    let entropy = serialize_vec(&rt.message().receiver(), "address for get verify info")?;
    let randomness = rt.get_randomness_from_tickets(
        DomainSeparationTag::SealRandomness,
        params.seal_rand_epoch,
        &entropy,
    )?;
    let interactive_randomness = rt.get_randomness_from_beacon(
        DomainSeparationTag::InteractiveSealChallengeSeed,
        params.interactive_epoch,
        &entropy,
    )?;

    Ok(SealVerifyInfo {
        registered_proof: params.registered_seal_proof,
        sector_id: SectorID { miner: miner_actor_id, number: params.sector_number },
        deal_ids: params.deal_ids,
        interactive_randomness: Randomness(interactive_randomness.into()),
        proof: params.proof,
        randomness: Randomness(randomness.into()),
        sealed_cid: params.sealed_cid,
        unsealed_cid: commd,
    })
}

/// Requests the storage market actor compute the unsealed sector CID from a sector's deals.
fn request_unsealed_sector_cid(
    rt: &impl Runtime,
    sector_type: RegisteredSealProof,
    deal_ids: &[DealID],
) -> Result<Cid, ActorError> {
    let ret = rt
        .send(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::COMPUTE_DATA_COMMITMENT_METHOD,
            IpldBlock::serialize_cbor(&ext::market::ComputeDataCommitmentParams {
                deal_ids: deal_ids.to_vec(),
                sector_type,
            })?,
            TokenAmount::zero(),
        )
        .context("failed request for unsealed sector CIDs")?;
    let computed: ext::market::ComputeDataCommitmentReturn = deserialize_block(ret)?;
    Ok(computed.commd)
}

fn request_deal_weights(
    rt: &impl Runtime,
    deal_ids: &[DealID],
    sector_start: ChainEpoch,
    sector_expiry: ChainEpoch,
) -> Result<ext::market::VerifyDealsForActivationReturn, ActorError> {
    // Short-circuit if there are no deals in the sector.
    if deal_ids.is_empty() {
        return Ok(ext::market::VerifyDealsForActivationReturn {
            deal_weight: Default::default(),
            verified_deal_weight: Default::default(),
        });
    }

    let ret = rt
        .send(
            &STORAGE_MARKET_ACTOR_ADDR,
            ext::market::VERIFY_DEALS_FOR_ACTIVATION_METHOD,
            IpldBlock::serialize_cbor(&ext::market::VerifyDealsForActivationParams {
                deal_ids: deal_ids.to_vec(),
                sector_start,
                sector_expiry,
            })?,
            TokenAmount::zero(),
        )
        .context("failed to verify deals and get deal weight")?;

    deserialize_block(ret)
}

fn commit_worker_key_change(rt: &impl Runtime) -> Result<(), ActorError> {
    rt.transaction(|state: &mut State, rt| {
        let mut info = get_miner_info(rt.store(), state)?;

        // A previously scheduled key change could have been replaced with a new key change request
        // scheduled in the future. This case should be treated as a no-op.
        match &info.pending_worker_key {
            Some(pending_worker_key) if pending_worker_key.effective_at <= rt.curr_epoch() => {
                info.worker = pending_worker_key.new_worker;
                info.pending_worker_key = None;
            }
            _ => return Ok(()),
        }

        state.save_info(rt.store(), &info).map_err(|e| {
            e.downcast_default(ExitCode::USR_SERIALIZATION, "failed to save miner info")
        })?;

        Ok(())
    })
}

/// Requests the current epoch target block reward from the reward actor.
/// return value includes reward, smoothed estimate of reward, and baseline power
fn request_current_epoch_block_reward(
    rt: &impl Runtime,
) -> Result<ThisEpochRewardReturn, ActorError> {
    let ret = rt
        .send(
            &REWARD_ACTOR_ADDR,
            ext::reward::THIS_EPOCH_REWARD_METHOD,
            Default::default(),
            TokenAmount::zero(),
        )
        .context("failed to check epoch baseline power")?;

    deserialize_block(ret)
}

/// Requests the current network total power and pledge from the power actor.
fn request_current_total_power(
    rt: &impl Runtime,
) -> Result<ext::power::CurrentTotalPowerReturn, ActorError> {
    let ret = rt
        .send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::CURRENT_TOTAL_POWER_METHOD,
            Default::default(),
            TokenAmount::zero(),
        )
        .context("failed to check current power")?;

    deserialize_block(ret)
}

/// Resolves an address to an ID address and verifies that it is address of an account or multisig actor.
fn resolve_control_address(rt: &impl Runtime, raw: Address) -> Result<Address, ActorError> {
    let resolved = rt
        .resolve_address(&raw)
        .ok_or_else(|| actor_error!(illegal_argument, "unable to resolve address: {}", raw))?;

    let owner_code = rt
        .get_actor_code_cid(&resolved)
        .ok_or_else(|| actor_error!(illegal_argument, "no code for address: {}", resolved))?;

    let is_principal = rt
        .resolve_builtin_actor_type(&owner_code)
        .map_or(false, |typ| CALLER_TYPES_SIGNABLE.contains(&typ));

    if !is_principal {
        return Err(actor_error!(
            illegal_argument,
            "owner actor type must be a principal, was {}",
            owner_code
        ));
    }

    Ok(Address::new_id(resolved))
}

/// Resolves an address to an ID address and verifies that it is address of an account actor with an associated BLS key.
/// The worker must be BLS since the worker key will be used alongside a BLS-VRF.
fn resolve_worker_address(rt: &impl Runtime, raw: Address) -> Result<Address, ActorError> {
    let resolved = rt
        .resolve_address(&raw)
        .ok_or_else(|| actor_error!(illegal_argument, "unable to resolve address: {}", raw))?;

    let worker_code = rt
        .get_actor_code_cid(&resolved)
        .ok_or_else(|| actor_error!(illegal_argument, "no code for address: {}", resolved))?;
    let is_account =
        rt.resolve_builtin_actor_type(&worker_code) == Some(Type::Account);
    if !is_account {
        return Err(actor_error!(
            illegal_argument,
            "worker actor type must be an account, was {}",
            worker_code
        ));
    }

    if raw.protocol() != Protocol::BLS {
        let ret = rt.send(
            &Address::new_id(resolved),
            ext::account::PUBKEY_ADDRESS_METHOD,
            None,
            TokenAmount::zero(),
        )?;
        let pub_key: Address = deserialize_block(ret).map_err(|e| {
            e.wrap(format!("failed to deserialize address result: {:?}", resolved))
        })?;
        if pub_key.protocol() != Protocol::BLS {
            return Err(actor_error!(
                illegal_argument,
                "worker account {} must have BLS pubkey, was {}",
                resolved,
                pub_key.protocol()
            ));
        }
    }
    Ok(Address::new_id(resolved))
}

fn burn_funds(rt: &impl Runtime, amount: TokenAmount) -> Result<(), ActorError> {
    log::debug!("storage provder {} burn {}", rt.message().receiver(), amount);
    if amount.is_positive() {
        rt.send(&BURNT_FUNDS_ACTOR_ADDR, METHOD_SEND, None, amount)
            .context("failed to burn funds")?;
    }
    Ok(())
}

fn notify_pledge_changed(rt: &impl Runtime, pledge_delta: &TokenAmount) -> Result<(), ActorError> {
    if !pledge_delta.is_zero() {
        rt.send(
            &STORAGE_POWER_ACTOR_ADDR,
            ext::power::UPDATE_PLEDGE_TOTAL_METHOD,
            IpldBlock::serialize_cbor(pledge_delta)?,
            TokenAmount::zero(),
        )
        .context("failed to update total pledge")?;
    }
    Ok(())
}

/// Assigns proving period offset randomly in the range [0, WPoStProvingPeriod) by hashing
/// the actor's address and current epoch.
pub fn assign_proving_period_offset(
    policy: &Policy,
    addr: Address,
    current_epoch: ChainEpoch,
    blake2b: impl FnOnce(&[u8]) -> [u8; 32],
) -> anyhow::Result<ChainEpoch> {
    let mut my_addr = serialize_vec(&addr, "address")?;
    my_addr.write_i64::<BigEndian>(current_epoch)?;

    let digest = blake2b(&my_addr);

    let mut offset: u64 = BigEndian::read_u64(&digest);
    offset %= policy.wpost_proving_period as u64;

    // Conversion from i64 to u64 is safe because it's % WPOST_PROVING_PERIOD which is i64
    Ok(offset as ChainEpoch)
}

/// Computes the epoch at which a proving period should start such that it is greater than the current epoch, and
/// has a defined offset from being an exact multiple of WPoStProvingPeriod.
/// A miner is exempt from Window PoSt until the first full proving period starts.
pub fn next_proving_period_start(
    policy: &Policy,
    current_epoch: ChainEpoch,
    offset: ChainEpoch,
) -> ChainEpoch {
    let curr_modulus = current_epoch % policy.wpost_proving_period;

    let period_progress = if curr_modulus >= offset {
        curr_modulus - offset
    } else {
        policy.wpost_proving_period - (offset - curr_modulus)
    };

    current_epoch - period_progress + policy.wpost_proving_period
}

/// Computes the aggregate fee payable for terminating the given sectors at the given epoch.
fn termination_penalty(
    sector_size: SectorSize,
    current_epoch: ChainEpoch,
    reward_estimate: &FilterEstimate,
    network_qa_power_estimate: &FilterEstimate,
    sectors: &[SectorOnChainInfo],
) -> TokenAmount {
    let mut total_fee = TokenAmount::zero();

    for sector in sectors {
        let sector_power = qa_power_for_sector(sector_size, sector);
        let fee = pledge_penalty_for_termination(
            &sector.expected_day_reward,
            current_epoch - sector.activation,
            &sector.expected_storage_pledge,
            network_qa_power_estimate,
            &sector_power,
            reward_estimate,
            &sector.replaced_day_reward,
            sector.replaced_sector_age,
        );
        total_fee += fee;
    }

    total_fee
}

fn consensus_fault_active(info: &MinerInfo, curr_epoch: ChainEpoch) -> bool {
    // For penalization period to last for exactly finality epochs
    // consensus faults are active until currEpoch exceeds ConsensusFaultElapsed
    curr_epoch <= info.consensus_fault_elapsed
}

fn get_miner_info<BS>(store: &BS, state: &State) -> Result<MinerInfo, ActorError>
where
    BS: fvm_ipld_blockstore::Blockstore,
{
    state
        .get_info(store)
        .map_err(|e| e.downcast_default(ExitCode::USR_ILLEGAL_STATE, "could not read miner info"))
}

/// Repays all fee debt and then verifies that the miner has amount needed to cover
/// the pledge requirement after burning all fee debt. If not aborts.
/// Returns an amount that must be burnt by the actor.
/// Note that this call does not compute recent vesting so reported unlocked balance
/// may be slightly lower than the true amount. Computing vesting here would be
/// almost always redundant since vesting is quantized to ~daily units. Vesting
/// will be at most one proving period old if computed in the cron callback.
fn repay_debts_or_abort(rt: &impl Runtime, state: &mut State) -> Result<TokenAmount, ActorError> {
    let curr_balance = rt.current_balance();
    let to_burn = state.repay_debts(&curr_balance).map_err(|e| {
        e.downcast_default(
            ExitCode::USR_INSUFFICIENT_FUNDS,
            "unlocked balance can not repay fee debt",
        )
    })?;

    // IP requirements must be checked against balance after the fee debt repayment.
    // The to_burn fee debt repayment will be burned so subtract it from the working balance.
    let curr_balance = curr_balance - &to_burn;
    if !state.meets_initial_pledge_condition(&curr_balance) {
        return Err(actor_error!(
            insufficient_funds,
            "unlocked balance does not cover pledge requirements"
        ));
    }

    Ok(to_burn)
}

fn check_control_addresses(
    policy: &Policy,
    control_addresses: &[Address],
) -> Result<(), ActorError> {
    if control_addresses.len() > policy.max_control_addresses {
        return Err(actor_error!(
            illegal_argument,
            "control addresses length {} exceeds max control addresses length {}",
            control_addresses.len(),
            policy.max_control_addresses
        ));
    }

    Ok(())
}

fn check_peer_info(
    policy: &Policy,
    peer_id: &[u8],
    multiaddrs: &[fvm_ipld_encoding::BytesDe],
) -> Result<(), ActorError> {
    if peer_id.len() > policy.max_peer_id_length {
        return Err(actor_error!(
            illegal_argument,
            "peer ID size of {} exceeds maximum size of {}",
            peer_id.len(),
            policy.max_peer_id_length
        ));
    }

    let mut total_size = 0;
    for ma in multiaddrs {
        if ma.0.is_empty() {
            return Err(actor_error!(illegal_argument, "invalid empty multiaddr"));
        }
        total_size += ma.0.len();
    }

    if total_size > policy.max_multiaddr_data {
        return Err(actor_error!(
            illegal_argument,
            "multiaddr size of {} exceeds maximum of {}",
            total_size,
            policy.max_multiaddr_data
        ));
    }

    Ok(())
}

fn replaced_sector_parameters(
    curr_epoch: ChainEpoch,
    precommit: &SectorPreCommitOnChainInfo,
    replaced_by_num: &BTreeMap<SectorNumber, SectorOnChainInfo>,
) -> Result<(ChainEpoch, TokenAmount), ActorError> {
    if !precommit.info.replace_capacity {
        return Ok(Default::default());
    }

    let replaced = replaced_by_num.get(&precommit.info.replace_sector_number).ok_or_else(|| {
        actor_error!(
            not_found,
            "no such sector {} to replace",
            precommit.info.replace_sector_number
        )
    })?;

    // The sector will actually be active for the period between activation and its next
    // proving deadline, but this covers the period for which we will be looking to the old sector
    // for termination fees.
    Ok((
        cmp::max(0, curr_epoch - replaced.activation),
        replaced.expected_day_reward.clone(),
    ))
}

fn balance_invariants_broken(e: Error) -> ActorError {
    ActorError::unchecked(
        ERR_BALANCE_INVARIANTS_BROKEN,
        format!("balance invariants broken: {}", e),
    )
}

impl ActorCode for Actor {
    fn invoke_method<RT>(
        rt: &RT,
        method: MethodNum,
        params: Option<IpldBlock>,
    ) -> Result<Option<IpldBlock>, ActorError>
    where
        RT: Runtime,
    {
        match FromPrimitive::from_u64(method) {
            Some(Method::Constructor) => {
                Self::constructor(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::ControlAddresses) => {
                let res = Self::control_addresses(rt)?;
                Ok(IpldBlock::serialize_cbor(&res)?)
            }
            Some(Method::ChangeWorkerAddress) => {
                Self::change_worker_address(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::ChangePeerID) => {
                Self::change_peer_id(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::SubmitWindowedPoSt) => {
                Self::submit_windowed_post(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::PreCommitSector) => {
                Self::pre_commit_sector(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::ProveCommitSector) => {
                Self::prove_commit_sector(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::ExtendSectorExpiration) => {
                Self::extend_sector_expiration(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::TerminateSectors) => {
                let ret = Self::terminate_sectors(rt, deserialize_params(params)?)?;
                Ok(IpldBlock::serialize_cbor(&ret)?)
            }
            Some(Method::DeclareFaults) => {
                Self::declare_faults(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::DeclareFaultsRecovered) => {
                Self::declare_faults_recovered(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::OnDeferredCronEvent) => {
                Self::on_deferred_cron_event(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::CheckSectorProven) => {
                Self::check_sector_proven(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::AddLockedFund) => {
                Self::add_locked_fund(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::ReportConsensusFault) => {
                Self::report_consensus_fault(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::WithdrawBalance) => {
                Self::withdraw_balance(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::ConfirmSectorProofsValid) => {
                Self::confirm_sector_proofs_valid(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::ChangeMultiaddrs) => {
                Self::change_multiaddresses(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::CompactPartitions) => {
                Self::compact_partitions(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            Some(Method::CompactSectorNumbers) => {
                Self::compact_sector_numbers(rt, deserialize_params(params)?)?;
                Ok(None)
            }
            None => Err(actor_error!(unhandled_message, "Invalid method")),
        }
    }
}

fn deserialize_params<T: serde::de::DeserializeOwned>(
    params: Option<IpldBlock>,
) -> Result<T, ActorError> {
    params
        .ok_or_else(|| actor_error!(serialization, "method expects arguments"))?
        .deserialize()
        .map_err(|e| ActorError::from(e).wrap("failed to deserialize method parameters"))
}
