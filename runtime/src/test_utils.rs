// Copyright 2019-2022 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cell::{Ref, RefCell};
use std::collections::{HashMap, VecDeque};

use cid::multihash::Multihash;
use cid::Cid;
use fvm_ipld_blockstore::Blockstore;
use fvm_ipld_encoding::ipld_block::IpldBlock;
use fvm_ipld_encoding::{CborStore, CBOR};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::consensus::ConsensusFault;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::randomness::RANDOMNESS_LENGTH;
use fvm_shared::sector::{SealVerifyInfo, WindowPoStVerifyInfo};
use fvm_shared::{ActorID, MethodNum};
use lazy_static::lazy_static;
use multihash_codetable::Code;
use num_traits::Zero;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::runtime::builtins::Type;
use crate::runtime::{
    DomainSeparationTag, MessageInfo, Policy, Primitives, Runtime, RuntimePolicy, Verifier,
};
use crate::test_blockstores::MemoryBlockstore;
use crate::{actor_error, ActorError};

lazy_static! {
    pub static ref SYSTEM_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/system");
    pub static ref INIT_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/init");
    pub static ref CRON_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/cron");
    pub static ref ACCOUNT_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/account");
    pub static ref POWER_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/storagepower");
    pub static ref MINER_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/storageminer");
    pub static ref MARKET_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/storagemarket");
    pub static ref PAYCH_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/paymentchannel");
    pub static ref MULTISIG_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/multisig");
    pub static ref REWARD_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/reward");
    pub static ref VERIFREG_ACTOR_CODE_ID: Cid = make_builtin(b"fil/test/verifiedregistry");

    /// Map of all builtin actor code CIDs to their type.
    pub static ref ACTOR_TYPES: HashMap<Cid, Type> = {
        let mut map = HashMap::new();
        map.insert(*SYSTEM_ACTOR_CODE_ID, Type::System);
        map.insert(*INIT_ACTOR_CODE_ID, Type::Init);
        map.insert(*CRON_ACTOR_CODE_ID, Type::Cron);
        map.insert(*ACCOUNT_ACTOR_CODE_ID, Type::Account);
        map.insert(*POWER_ACTOR_CODE_ID, Type::Power);
        map.insert(*MINER_ACTOR_CODE_ID, Type::Miner);
        map.insert(*MARKET_ACTOR_CODE_ID, Type::Market);
        map.insert(*PAYCH_ACTOR_CODE_ID, Type::PaymentChannel);
        map.insert(*MULTISIG_ACTOR_CODE_ID, Type::Multisig);
        map.insert(*REWARD_ACTOR_CODE_ID, Type::Reward);
        map.insert(*VERIFREG_ACTOR_CODE_ID, Type::VerifiedRegistry);
        map
    };
}

const IPLD_RAW: u64 = 0x55;

/// Returns an identity CID for bz.
pub fn make_identity_cid(bz: &[u8]) -> Cid {
    Cid::new_v1(IPLD_RAW, Multihash::wrap(0, bz).expect("name too long"))
}

fn make_builtin(bz: &[u8]) -> Cid {
    make_identity_cid(bz)
}

/// Enumeration of expected randomness seeds, in request order.
#[derive(Clone, Debug)]
pub struct ExpectRandomness {
    tag: DomainSeparationTag,
    epoch: ChainEpoch,
    entropy: Vec<u8>,
    out: [u8; RANDOMNESS_LENGTH],
}

#[derive(Clone, Debug)]
pub struct ExpectedMessage {
    pub to: Address,
    pub method: MethodNum,
    pub params: Option<IpldBlock>,
    pub value: TokenAmount,

    // returns from applying expectedMessage
    pub send_return: Option<IpldBlock>,
    pub exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectedVerifyPoSt {
    post: WindowPoStVerifyInfo,
    exit_code: ExitCode,
}

#[derive(Clone, Debug)]
pub struct ExpectedVerifyConsensusFault {
    require_correct_input: bool,
    block_header_1: Vec<u8>,
    block_header_2: Vec<u8>,
    block_header_extra: Vec<u8>,
    fault: Option<ConsensusFault>,
    exit_code: ExitCode,
}

#[derive(Default)]
pub struct Expectations {
    pub expect_validate_caller_any: bool,
    pub expect_validate_caller_addr: Option<Vec<Address>>,
    pub expect_validate_caller_type: Option<Vec<Type>>,
    pub expect_sends: VecDeque<ExpectedMessage>,
    pub expect_get_randomness_tickets: VecDeque<ExpectRandomness>,
    pub expect_get_randomness_beacon: VecDeque<ExpectRandomness>,
    pub expect_verify_post: Option<ExpectedVerifyPoSt>,
    pub expect_verify_consensus_fault: Option<ExpectedVerifyConsensusFault>,
}

impl Expectations {
    fn reset(&mut self) {
        *self = Default::default();
    }

    fn verify(&mut self) {
        assert!(!self.expect_validate_caller_any, "expected ValidateCallerAny, not received");
        assert!(
            self.expect_validate_caller_addr.is_none(),
            "expected ValidateCallerAddr {:?}, not received",
            self.expect_validate_caller_addr
        );
        assert!(
            self.expect_validate_caller_type.is_none(),
            "expected ValidateCallerType {:?}, not received",
            self.expect_validate_caller_type
        );
        assert!(
            self.expect_sends.is_empty(),
            "expected all message to be send, unsent messages {:?}",
            self.expect_sends
        );
        assert!(
            self.expect_get_randomness_tickets.is_empty(),
            "expect_get_randomness_tickets: {:?}, not received",
            self.expect_get_randomness_tickets
        );
        assert!(
            self.expect_get_randomness_beacon.is_empty(),
            "expect_get_randomness_beacon: {:?}, not received",
            self.expect_get_randomness_beacon
        );
        assert!(
            self.expect_verify_post.is_none(),
            "expect_verify_post: {:?}, not received",
            self.expect_verify_post
        );
        assert!(
            self.expect_verify_consensus_fault.is_none(),
            "expect_verify_consensus_fault: {:?}, not received",
            self.expect_verify_consensus_fault
        );
    }
}

pub struct MockRuntime {
    pub epoch: RefCell<ChainEpoch>,
    pub caller: RefCell<Address>,
    pub caller_type: RefCell<Cid>,
    pub receiver: Address,
    pub balance: RefCell<TokenAmount>,
    pub value_received: RefCell<TokenAmount>,
    pub circulating_supply: RefCell<TokenAmount>,
    pub id_addresses: RefCell<HashMap<Address, Address>>,
    pub actor_code_cids: RefCell<HashMap<ActorID, Cid>>,
    pub policy: Policy,
    pub hash_func: Box<dyn Fn(&[u8]) -> [u8; 32]>,

    // State
    pub state: RefCell<Option<Cid>>,
    pub in_transaction: RefCell<bool>,

    // Expectations
    pub expectations: RefCell<Expectations>,

    pub store: MemoryBlockstore,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new(Address::new_id(0))
    }
}

impl MockRuntime {
    pub fn new(receiver: Address) -> Self {
        Self {
            epoch: RefCell::new(0),
            caller: RefCell::new(Address::new_id(0)),
            caller_type: RefCell::new(Cid::default()),
            receiver,
            balance: RefCell::new(TokenAmount::zero()),
            value_received: RefCell::new(TokenAmount::zero()),
            circulating_supply: RefCell::new(TokenAmount::zero()),
            id_addresses: Default::default(),
            actor_code_cids: Default::default(),
            policy: Policy::default(),
            hash_func: Box::new(blake2b_256),
            state: RefCell::new(None),
            in_transaction: RefCell::new(false),
            expectations: Default::default(),
            store: MemoryBlockstore::default(),
        }
    }

    /// Invokes a method on the actor's exported code, as the VM dispatcher would.
    pub fn call<A: crate::runtime::ActorCode>(
        &self,
        method_num: MethodNum,
        params: Option<IpldBlock>,
    ) -> Result<Option<IpldBlock>, ActorError> {
        A::invoke_method(self, method_num, params)
    }

    ///// Runtime access for tests /////

    pub fn set_caller(&self, code_id: Cid, address: Address) {
        assert!(address.id().is_ok(), "caller must be a resolved ID address");
        self.caller.replace(address);
        self.caller_type.replace(code_id);
    }

    pub fn set_value(&self, value: TokenAmount) {
        self.value_received.replace(value);
    }

    pub fn set_balance(&self, amount: TokenAmount) {
        self.balance.replace(amount);
    }

    pub fn add_balance(&self, amount: TokenAmount) {
        *self.balance.borrow_mut() += amount;
    }

    pub fn set_epoch(&self, epoch: ChainEpoch) -> ChainEpoch {
        self.epoch.replace(epoch);
        epoch
    }

    pub fn set_circulating_supply(&self, circ_supply: TokenAmount) {
        self.circulating_supply.replace(circ_supply);
    }

    pub fn add_id_address(&self, source: Address, target: Address) {
        assert!(target.id().is_ok(), "target must use ID address protocol");
        self.id_addresses.borrow_mut().insert(source, target);
    }

    pub fn set_address_actor_type(&self, address: Address, actor_type: Cid) {
        let id = address.id().expect("address must be a resolved ID address");
        self.actor_code_cids.borrow_mut().insert(id, actor_type);
    }

    pub fn get_state<T: DeserializeOwned>(&self) -> T {
        self.state_internal().unwrap()
    }

    pub fn replace_state<T: Serialize>(&self, obj: &T) {
        self.state.replace(Some(self.store.put_cbor(obj, Code::Blake2b256).unwrap()));
    }

    ///// Expectations /////

    pub fn expect_validate_caller_any(&self) {
        self.expectations.borrow_mut().expect_validate_caller_any = true;
    }

    pub fn expect_validate_caller_addr(&self, addr: Vec<Address>) {
        assert!(!addr.is_empty(), "addrs must be non-empty");
        self.expectations.borrow_mut().expect_validate_caller_addr = Some(addr);
    }

    pub fn expect_validate_caller_type(&self, types: Vec<Type>) {
        assert!(!types.is_empty(), "types must be non-empty");
        self.expectations.borrow_mut().expect_validate_caller_type = Some(types);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn expect_send(
        &self,
        to: Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
        send_return: Option<IpldBlock>,
        exit_code: ExitCode,
    ) {
        self.expectations.borrow_mut().expect_sends.push_back(ExpectedMessage {
            to,
            method,
            params,
            value,
            send_return,
            exit_code,
        })
    }

    pub fn expect_get_randomness_from_tickets(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: Vec<u8>,
        out: [u8; RANDOMNESS_LENGTH],
    ) {
        let a = ExpectRandomness { tag, epoch, entropy, out };
        self.expectations.borrow_mut().expect_get_randomness_tickets.push_back(a);
    }

    pub fn expect_get_randomness_from_beacon(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: Vec<u8>,
        out: [u8; RANDOMNESS_LENGTH],
    ) {
        let a = ExpectRandomness { tag, epoch, entropy, out };
        self.expectations.borrow_mut().expect_get_randomness_beacon.push_back(a);
    }

    pub fn expect_verify_post(&self, post: WindowPoStVerifyInfo, exit_code: ExitCode) {
        let a = ExpectedVerifyPoSt { post, exit_code };
        self.expectations.borrow_mut().expect_verify_post = Some(a);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn expect_verify_consensus_fault(
        &self,
        h1: Vec<u8>,
        h2: Vec<u8>,
        extra: Vec<u8>,
        fault: Option<ConsensusFault>,
        exit_code: ExitCode,
    ) {
        self.expectations.borrow_mut().expect_verify_consensus_fault =
            Some(ExpectedVerifyConsensusFault {
                require_correct_input: true,
                block_header_1: h1,
                block_header_2: h2,
                block_header_extra: extra,
                fault,
                exit_code,
            });
    }

    ///// Private helpers /////

    fn require_in_call(&self) {
        // All calls in the mock are "in call"; kept for signature parity with the VM runtime.
    }

    fn state_internal<T: DeserializeOwned>(&self) -> Result<T, ActorError> {
        let state_cid =
            self.state.borrow().ok_or_else(|| actor_error!(illegal_state, "state not created"))?;
        Ok(self.store.get_cbor(&state_cid).unwrap().unwrap())
    }

    /// Verifies that all mock expectations have been consumed.
    pub fn verify(&self) {
        self.expectations.borrow_mut().verify()
    }

    pub fn reset(&self) {
        self.expectations.borrow_mut().reset();
    }
}

impl MessageInfo for MockRuntime {
    fn caller(&self) -> Address {
        *self.caller.borrow()
    }
    fn receiver(&self) -> Address {
        self.receiver
    }
    fn value_received(&self) -> TokenAmount {
        self.value_received.borrow().clone()
    }
}

impl Runtime for MockRuntime {
    type Blockstore = MemoryBlockstore;

    fn message(&self) -> &dyn MessageInfo {
        self.require_in_call();
        self
    }

    fn curr_epoch(&self) -> ChainEpoch {
        self.require_in_call();
        *self.epoch.borrow()
    }

    fn validate_immediate_caller_accept_any(&self) -> Result<(), ActorError> {
        self.require_in_call();
        let mut expectations = self.expectations.borrow_mut();
        assert!(
            expectations.expect_validate_caller_any,
            "unexpected validate-caller-any invocation"
        );
        expectations.expect_validate_caller_any = false;
        Ok(())
    }

    fn validate_immediate_caller_is<'a, I>(&self, addresses: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Address>,
    {
        self.require_in_call();

        let addrs: Vec<Address> = addresses.into_iter().cloned().collect();

        let mut expectations = self.expectations.borrow_mut();
        assert!(
            expectations.expect_validate_caller_addr.is_some(),
            "unexpected validate caller addrs"
        );

        let expected_addrs = expectations.expect_validate_caller_addr.as_ref().unwrap();
        assert_eq!(
            &addrs, expected_addrs,
            "unexpected validate caller addrs {:?}, expected {:?}",
            addrs, &expectations.expect_validate_caller_addr
        );

        for expected in &addrs {
            if self.message().caller() == *expected {
                expectations.expect_validate_caller_addr = None;
                return Ok(());
            }
        }
        expectations.expect_validate_caller_addr = None;
        Err(actor_error!(forbidden;
                "caller address {:?} forbidden, allowed: {:?}",
                self.message().caller(), &addrs
        ))
    }

    fn validate_immediate_caller_type<'a, I>(&self, types: I) -> Result<(), ActorError>
    where
        I: IntoIterator<Item = &'a Type>,
    {
        self.require_in_call();
        let types: Vec<Type> = types.into_iter().cloned().collect();

        let mut expectations = self.expectations.borrow_mut();
        assert!(
            expectations.expect_validate_caller_type.is_some(),
            "unexpected validate caller code"
        );

        let expected_caller_type = expectations.expect_validate_caller_type.as_ref().unwrap();
        assert_eq!(
            &types, expected_caller_type,
            "unexpected validate caller code {:?}, expected {:?}",
            types, expected_caller_type,
        );

        if let Some(call_type) = ACTOR_TYPES.get(&self.caller_type.borrow()) {
            for expected in &types {
                if expected == call_type {
                    expectations.expect_validate_caller_type = None;
                    return Ok(());
                }
            }
        }

        expectations.expect_validate_caller_type = None;
        Err(actor_error!(forbidden; "caller type {:?} forbidden, allowed: {:?}",
                self.caller_type, types))
    }

    fn current_balance(&self) -> TokenAmount {
        self.require_in_call();
        self.balance.borrow().clone()
    }

    fn resolve_address(&self, address: &Address) -> Option<ActorID> {
        self.require_in_call();
        if let Ok(id) = address.id() {
            return Some(id);
        }

        self.id_addresses.borrow().get(address).and_then(|a| a.id().ok())
    }

    fn get_actor_code_cid(&self, id: &ActorID) -> Option<Cid> {
        self.require_in_call();
        self.actor_code_cids.borrow().get(id).cloned()
    }

    fn resolve_builtin_actor_type(&self, code_id: &Cid) -> Option<Type> {
        self.require_in_call();
        ACTOR_TYPES.get(code_id).cloned()
    }

    fn get_randomness_from_tickets(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError> {
        let expected = self
            .expectations
            .borrow_mut()
            .expect_get_randomness_tickets
            .pop_front()
            .expect("unexpected call to get_randomness_from_tickets");

        assert!(epoch <= *self.epoch.borrow(), "attempt to get randomness from future");
        assert_eq!(
            expected.tag, tag,
            "unexpected domain separation tag, expected: {:?}, actual: {:?}",
            expected.tag, tag
        );
        assert_eq!(
            expected.epoch, epoch,
            "unexpected epoch, expected: {:?}, actual: {:?}",
            expected.epoch, epoch
        );
        assert_eq!(
            expected.entropy, entropy,
            "unexpected entropy, expected {:?}, actual: {:?}",
            expected.entropy, entropy
        );

        Ok(expected.out)
    }

    fn get_randomness_from_beacon(
        &self,
        tag: DomainSeparationTag,
        epoch: ChainEpoch,
        entropy: &[u8],
    ) -> Result<[u8; RANDOMNESS_LENGTH], ActorError> {
        let expected = self
            .expectations
            .borrow_mut()
            .expect_get_randomness_beacon
            .pop_front()
            .expect("unexpected call to get_randomness_from_beacon");

        assert!(epoch <= *self.epoch.borrow(), "attempt to get randomness from future");
        assert_eq!(
            expected.tag, tag,
            "unexpected domain separation tag, expected: {:?}, actual: {:?}",
            expected.tag, tag
        );
        assert_eq!(
            expected.epoch, epoch,
            "unexpected epoch, expected: {:?}, actual: {:?}",
            expected.epoch, epoch
        );
        assert_eq!(
            expected.entropy, entropy,
            "unexpected entropy, expected {:?}, actual: {:?}",
            expected.entropy, entropy
        );

        Ok(expected.out)
    }

    fn create<T: Serialize>(&self, obj: &T) -> Result<(), ActorError> {
        if self.state.borrow().is_some() {
            return Err(actor_error!(illegal_state; "state already constructed"));
        }
        self.state.replace(Some(self.store.put_cbor(obj, Code::Blake2b256).unwrap()));
        Ok(())
    }

    fn state<T: DeserializeOwned>(&self) -> Result<T, ActorError> {
        self.state_internal()
    }

    fn transaction<S, RT, F>(&self, f: F) -> Result<RT, ActorError>
    where
        S: Serialize + DeserializeOwned,
        F: FnOnce(&mut S, &Self) -> Result<RT, ActorError>,
    {
        if *self.in_transaction.borrow() {
            return Err(actor_error!(assertion_failed; "nested transaction"));
        }
        let mut read_only = self.state_internal()?;
        self.in_transaction.replace(true);
        let ret = f(&mut read_only, self);
        if ret.is_ok() {
            self.replace_state(&read_only);
        }
        self.in_transaction.replace(false);
        ret
    }

    fn store(&self) -> &Self::Blockstore {
        &self.store
    }

    fn send(
        &self,
        to: &Address,
        method: MethodNum,
        params: Option<IpldBlock>,
        value: TokenAmount,
    ) -> Result<Option<IpldBlock>, ActorError> {
        self.require_in_call();
        assert!(
            !*self.in_transaction.borrow(),
            "side-effect within transaction: send to {} method {}",
            to,
            method
        );

        let expected_msg = self
            .expectations
            .borrow_mut()
            .expect_sends
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected send to: {:?} method: {:?}", to, method));

        assert_eq!(expected_msg.to, *to, "expected message to: {:?}, was: {:?}", expected_msg.to, to);
        assert_eq!(
            expected_msg.method, method,
            "expected method: {:?}, was: {:?}",
            expected_msg.method, method
        );
        assert_eq!(
            expected_msg.params, params,
            "expected message params: {:?}, was: {:?}",
            expected_msg.params, params
        );
        assert_eq!(
            expected_msg.value, value,
            "expected message value: {:?}, was: {:?}",
            expected_msg.value, value
        );

        {
            let mut balance = self.balance.borrow_mut();
            if value > *balance {
                return Err(ActorError::unchecked(
                    ExitCode::SYS_SENDER_STATE_INVALID,
                    format!("cannot send value: {:?} exceeds balance: {:?}", value, *balance),
                ));
            }
            *balance -= value;
        }

        if expected_msg.exit_code != ExitCode::OK {
            return Err(ActorError::unchecked(
                expected_msg.exit_code,
                "Expected message Fail".to_string(),
            ));
        }
        Ok(expected_msg.send_return)
    }

    fn total_fil_circ_supply(&self) -> TokenAmount {
        self.circulating_supply.borrow().clone()
    }
}

impl Primitives for MockRuntime {
    fn hash_blake2b(&self, data: &[u8]) -> [u8; 32] {
        (self.hash_func)(data)
    }
}

impl Verifier for MockRuntime {
    fn verify_seal(&self, _seal: &SealVerifyInfo) -> anyhow::Result<()> {
        // Seal proofs are verified in bulk by the power actor, never inline.
        Ok(())
    }

    fn verify_post(&self, post: &WindowPoStVerifyInfo) -> anyhow::Result<()> {
        let mut expectations = self.expectations.borrow_mut();
        let exp = expectations
            .expect_verify_post
            .take()
            .expect("unexpected call to verify_post");

        assert_eq!(exp.post, *post, "unexpected PoSt verification params");

        if exp.exit_code != ExitCode::OK {
            anyhow::bail!(ActorError::unchecked(exp.exit_code, "Expected Failure".to_string()));
        }
        Ok(())
    }

    fn verify_consensus_fault(
        &self,
        h1: &[u8],
        h2: &[u8],
        extra: &[u8],
    ) -> anyhow::Result<Option<ConsensusFault>> {
        let exp = self
            .expectations
            .borrow_mut()
            .expect_verify_consensus_fault
            .take()
            .expect("unexpected call to verify_consensus_fault");

        if exp.require_correct_input {
            assert_eq!(exp.block_header_1, h1, "unexpected header 1");
            assert_eq!(exp.block_header_2, h2, "unexpected header 2");
            assert_eq!(exp.block_header_extra, extra, "unexpected header extra");
        }

        if exp.exit_code != ExitCode::OK {
            anyhow::bail!(ActorError::unchecked(exp.exit_code, "Expected Failure".to_string()));
        }

        Ok(exp.fault)
    }
}

impl RuntimePolicy for MockRuntime {
    fn policy(&self) -> &Policy {
        &self.policy
    }
}

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    blake2b_simd::Params::new()
        .hash_length(32)
        .to_state()
        .update(data)
        .finalize()
        .as_bytes()
        .try_into()
        .unwrap()
}

/// Returns a hash function that ignores its input and produces a digest whose
/// leading bytes encode the given value big-endian. Tests use this to pin
/// otherwise address-derived randomized offsets.
pub fn fixed_hasher(offset: i64) -> Box<dyn Fn(&[u8]) -> [u8; 32]> {
    let hash = move |_: &[u8]| -> [u8; 32] {
        let mut result = [0u8; 32];
        for (i, b) in offset.to_be_bytes().iter().enumerate() {
            result[i] = *b;
        }
        result
    };
    Box::new(hash)
}

/// Fake CBOR-encoded params wrapper for tests.
pub fn ipld_block<T: Serialize + ?Sized>(value: &T) -> Option<IpldBlock> {
    Some(IpldBlock {
        codec: CBOR,
        data: fvm_ipld_encoding::to_vec(value).expect("failed to serialize test params"),
    })
}

pub fn expect_empty(res: Option<IpldBlock>) {
    assert!(res.is_none(), "expected empty return, got {:?}", res);
}

/// Asserts that a result failed with the expected exit code.
pub fn expect_abort<T: std::fmt::Debug>(exit_code: ExitCode, res: Result<T, ActorError>) {
    let err = res.expect_err(&format!("expected abort with code {}", exit_code));
    assert_eq!(
        exit_code,
        err.exit_code(),
        "expected abort with code {}, got {}: {}",
        exit_code,
        err.exit_code(),
        err.msg()
    );
}

/// Asserts that a result failed with the expected exit code and that the error
/// message contains the given substring.
pub fn expect_abort_contains_message<T: std::fmt::Debug>(
    exit_code: ExitCode,
    message: &str,
    res: Result<T, ActorError>,
) {
    let err = res.expect_err(&format!("expected abort with code {}", exit_code));
    assert_eq!(
        exit_code,
        err.exit_code(),
        "expected abort with code {}, got {}: {}",
        exit_code,
        err.exit_code(),
        err.msg()
    );
    assert!(
        err.msg().contains(message),
        "expected error message to contain {}, was {}",
        message,
        err.msg()
    );
}

const FIL_COMMITMENT_SEALED: u64 = 0xf102;
const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;
const POSEIDON_BLS12_381_A1_FC1: u64 = 0xb401;
const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

/// Builds a CID with the correct prefix for a sealed sector commitment (CommR).
pub fn make_sealed_cid(input: &[u8]) -> Cid {
    let h = blake2b_256(input);
    Cid::new_v1(
        FIL_COMMITMENT_SEALED,
        Multihash::wrap(POSEIDON_BLS12_381_A1_FC1, &h).expect("invalid multihash"),
    )
}

/// Builds a CID with the correct prefix for an unsealed sector commitment (CommD).
pub fn make_unsealed_cid(input: &[u8]) -> Cid {
    let h = blake2b_256(input);
    Cid::new_v1(
        FIL_COMMITMENT_UNSEALED,
        Multihash::wrap(SHA2_256_TRUNC254_PADDED, &h).expect("invalid multihash"),
    )
}
