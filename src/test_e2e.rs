//! Customer and merchant as two parties exchanging protocol messages. The
//! merchant runs as an actor thread in front of a [`MerchantService`]; the
//! customer drives the protocol from the test thread.

use crate::channels_mpc::{ChannelMPCState, ChannelMPCToken, CustomerMPCState, RevokedState, TransactionFeeInfo};
use crate::channels_util::{ChannelStatus, FundingTxInfo};
use crate::database::{HashMapDatabase, MaskedTxMPCInputs, StateDatabase};
use crate::error::{ZkChannelError, ZkResult};
use crate::fixed_size_array::{FixedSizeArray16, FixedSizeArray32};
use crate::mpc;
use crate::mpc_session::LocalMpcCoordinator;
use crate::service::MerchantService;
use crate::util::{compute_prevout, reverse_bytes};
use crate::wire::{ProtocolMessage, ProtocolResponse, WIRE_VERSION};
use rand::{RngCore, SeedableRng};
use rand_xorshift::XorShiftRng;
use secp256k1::PublicKey;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Reply = ProtocolResponse<Option<ProtocolMessage>>;

struct Merchant {
    service: Arc<MerchantService<HashMapDatabase>>,
    coordinator: Arc<LocalMpcCoordinator>,
    requests: Option<Sender<ProtocolMessage>>,
    replies: Receiver<Reply>,
    handle: Option<JoinHandle<()>>,
}

impl Merchant {
    fn start(mpc_timeout: Duration) -> Merchant {
        let mut rng = XorShiftRng::seed_from_u64(0x5dbe62598d313d86);
        let mut channel_state = ChannelMPCState::new(String::from("channel"), 1487, 546, 546, 1000, false);
        let merch_state = mpc::init_merchant(&mut rng, String::new(), &mut channel_state, "Bob");
        let coordinator = Arc::new(LocalMpcCoordinator::new());
        let service = Arc::new(
            MerchantService::new(merch_state, channel_state, HashMapDatabase::default(), coordinator.clone())
                .with_mpc_timeout(mpc_timeout),
        );

        let (req_tx, req_rx) = mpsc::channel::<ProtocolMessage>();
        let (resp_tx, resp_rx) = mpsc::channel::<Reply>();
        let actor = service.clone();
        let handle = thread::spawn(move || {
            let mut rng = XorShiftRng::seed_from_u64(0x62593e545d8d86be);
            for msg in req_rx {
                let session = match &msg {
                    ProtocolMessage::PaymentRequest { session_id, .. } => Some(*session_id),
                    _ => None,
                };
                let reply = actor.handle_message(&mut rng, msg);
                let accepted = reply.is_ok();
                if resp_tx.send(reply.into()).is_err() {
                    break;
                }
                // an accepted payment request is followed by the merchant's side of the mpc
                if let (true, Some(session_id)) = (accepted, session) {
                    let masks = actor
                        .pay_update(&mut rng, session_id.0)
                        .map(|masks| Some(ProtocolMessage::MaskedTxInputs { session_id, masks }));
                    if resp_tx.send(masks.into()).is_err() {
                        break;
                    }
                }
            }
        });

        Merchant {
            service,
            coordinator,
            requests: Some(req_tx),
            replies: resp_rx,
            handle: Some(handle),
        }
    }

    fn offer(&self) -> ProtocolMessage {
        ProtocolMessage::ChannelOffer {
            version: WIRE_VERSION,
            channel_state: self.service.channel_state().clone(),
            pk_m: self.service.pk_m(),
        }
    }

    fn send(&self, msg: ProtocolMessage) -> ZkResult<Option<ProtocolMessage>> {
        let requests = self.requests.as_ref().expect("merchant is running");
        requests.send(msg).expect("merchant hung up");
        self.recv()
    }

    fn recv(&self) -> ZkResult<Option<ProtocolMessage>> {
        self.replies.recv().expect("merchant hung up").into_result()
    }
}

impl Drop for Merchant {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Customer {
    rng: XorShiftRng,
    channel_state: ChannelMPCState,
    token: ChannelMPCToken,
    state: CustomerMPCState,
    escrow_txid_le: [u8; 32],
}

fn fee_info() -> TransactionFeeInfo {
    TransactionFeeInfo::default()
}

fn establish(merchant: &Merchant, seed: u64, cust_bal: i64, merch_bal: i64) -> Customer {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let info = fee_info();
    let (channel_state, pk_m): (ChannelMPCState, PublicKey) = merchant.offer().into_channel_offer().unwrap();
    let (mut token, mut state) = mpc::init_customer(&mut rng, &pk_m, cust_bal, merch_bal, &info, "Alice").unwrap();

    let mut escrow_txid_be = [0u8; 32];
    rng.fill_bytes(&mut escrow_txid_be);
    let escrow_txid_le = reverse_bytes(&escrow_txid_be);

    let (cust_sig, merch_txid_be, merch_prevout) =
        mpc::customer_sign_merch_close_tx(&channel_state, &token, &escrow_txid_le, &state).unwrap();
    let (escrow_sig, merch_sig) = match merchant
        .send(ProtocolMessage::MerchCloseSignature {
            escrow_txid_le: FixedSizeArray32(escrow_txid_le),
            init_state: state.get_initial_cust_state().unwrap(),
            fee_cc: info.fee_cc,
            cust_sig: hex::encode(&cust_sig),
        })
        .unwrap()
    {
        Some(ProtocolMessage::InitCustCloseSignatures { escrow_sig, merch_sig }) => {
            (hex::decode(escrow_sig).unwrap(), hex::decode(merch_sig).unwrap())
        }
        other => panic!("unexpected reply: {:?}", other),
    };

    let funding_tx = FundingTxInfo {
        init_cust_bal: state.cust_balance,
        init_merch_bal: state.merch_balance,
        escrow_txid: FixedSizeArray32(escrow_txid_be),
        escrow_prevout: FixedSizeArray32(compute_prevout(&escrow_txid_be, 0)),
        merch_txid: FixedSizeArray32(merch_txid_be),
        merch_prevout: FixedSizeArray32(merch_prevout),
        fee_mc: info.fee_mc,
        min_fee: info.min_fee,
        max_fee: info.max_fee,
    };
    state.set_funding_tx_info(&mut token, &funding_tx).unwrap();
    let (init_state, init_hash) = mpc::get_initial_state(&state).unwrap();
    match merchant
        .send(ProtocolMessage::InitialState {
            channel_token: token.clone(),
            init_state,
            init_hash: FixedSizeArray32(init_hash),
        })
        .unwrap()
    {
        Some(ProtocolMessage::StatusUpdate { status, .. }) => assert_eq!(status, ChannelStatus::PendingOpen),
        other => panic!("unexpected reply: {:?}", other),
    }

    mpc::customer_verify_init_cust_close_txs(&channel_state, &token, &escrow_sig, &merch_sig, &mut state).unwrap();
    mpc::customer_mark_open_channel(&mut state).unwrap();
    // escrow is on chain
    let ack = merchant
        .send(ProtocolMessage::StatusUpdate {
            escrow_txid_le: FixedSizeArray32(escrow_txid_le),
            status: ChannelStatus::Open,
        })
        .unwrap();
    assert!(ack.is_none());

    let s0 = mpc::activate_customer(&state).unwrap();
    match merchant
        .send(ProtocolMessage::ActivateRequest {
            channel_token: token.clone(),
            s0,
        })
        .unwrap()
    {
        Some(ProtocolMessage::PayToken0 { pay_token }) => mpc::activate_customer_finalize(pay_token.0, &mut state).unwrap(),
        other => panic!("unexpected reply: {:?}", other),
    }

    Customer {
        rng,
        channel_state,
        token,
        state,
        escrow_txid_le,
    }
}

/// Sends the payment request; on acceptance returns the session id, the pay
/// token mask commitment and the revoked state for the old state.
fn request(merchant: &Merchant, cust: &mut Customer, amount: i64) -> ZkResult<([u8; 16], [u8; 32], RevokedState)> {
    let (_, rev_state, rev_lock_com, session_id) =
        mpc::pay_prepare_customer(&mut cust.rng, &cust.channel_state, amount, &mut cust.state)?;
    let reply = merchant.send(ProtocolMessage::PaymentRequest {
        session_id: FixedSizeArray16(session_id),
        nonce: rev_state.nonce,
        rev_lock_com: FixedSizeArray32(rev_lock_com),
        amount,
        justification: None,
    });
    match reply {
        Ok(Some(ProtocolMessage::PayMaskCommitment { pay_token_mask_com })) => {
            Ok((session_id, pay_token_mask_com.0, rev_state))
        }
        Ok(other) => panic!("unexpected reply: {:?}", other),
        Err(e) => {
            mpc::pay_abort_customer(&mut cust.state)?;
            Err(e)
        }
    }
}

fn run_mpc(merchant: &Merchant, cust: &mut Customer, session_id: [u8; 16], com: [u8; 32]) -> MaskedTxMPCInputs {
    mpc::pay_update_customer(
        &cust.channel_state,
        &cust.token,
        com,
        merchant.coordinator.as_ref(),
        Duration::from_secs(10),
        &mut cust.state,
    )
    .unwrap();
    match merchant.recv().unwrap() {
        Some(ProtocolMessage::MaskedTxInputs { session_id: sid, masks }) => {
            assert_eq!(sid.0, session_id);
            masks
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

fn revoke(merchant: &Merchant, cust: &mut Customer, session_id: [u8; 16], rev_state: RevokedState) -> ZkResult<()> {
    match merchant.send(ProtocolMessage::Revocation {
        session_id: FixedSizeArray16(session_id),
        rev_state,
    })? {
        Some(ProtocolMessage::PayTokenMask { pt_mask, pt_mask_r }) => {
            mpc::pay_unmask_pay_token_customer(pt_mask.0, pt_mask_r.0, &mut cust.state)
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

fn pay(merchant: &Merchant, cust: &mut Customer, amount: i64) {
    let (session_id, com, rev_state) = request(merchant, cust, amount).unwrap();
    let masks = run_mpc(merchant, cust, session_id, com);
    let revoked = mpc::pay_unmask_sigs_customer(&cust.channel_state, &cust.token, &masks, &mut cust.state).unwrap();
    assert_eq!(revoked, rev_state);
    revoke(merchant, cust, session_id, revoked).unwrap();
}

fn is_rejected_with(r: ZkResult<impl std::fmt::Debug>, needle: &str) -> bool {
    match r {
        Err(ZkChannelError::Remote(e)) => e.contains(needle),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn establish_unlink_and_pay() {
    let merchant = Merchant::start(Duration::from_secs(10));
    let mut alice = establish(&merchant, 0x8d863e545dbe6259, 1000000, 1000000);
    assert_eq!(
        merchant.service.get_channel_status(&alice.escrow_txid_le).unwrap(),
        ChannelStatus::Open
    );
    let total = alice.state.cust_balance + alice.state.merch_balance;

    let (unlink_lock, unlink_secret) = alice.state.get_rev_pair();
    pay(&merchant, &mut alice, 0);
    assert_eq!(alice.state.cust_balance, 1000000);

    let (prev_lock, prev_secret) = alice.state.get_rev_pair();
    pay(&merchant, &mut alice, 10);
    assert_eq!(alice.state.cust_balance, 1000000 - 10);
    assert_eq!(alice.state.merch_balance, 1000000 + 10);
    assert_eq!(alice.state.cust_balance + alice.state.merch_balance, total);
    assert!(alice.state.has_tokens());

    assert_eq!(merchant.service.check_rev_lock(&unlink_lock).unwrap(), Some(unlink_secret));
    assert_eq!(merchant.service.check_rev_lock(&prev_lock).unwrap(), Some(prev_secret));
    let (current_lock, _) = alice.state.get_rev_pair();
    assert_eq!(merchant.service.check_rev_lock(&current_lock).unwrap(), None);
    assert_eq!(merchant.coordinator.pending_sessions(), 0);
}

#[test]
fn tampered_revocation_is_not_recorded() {
    let merchant = Merchant::start(Duration::from_secs(10));
    let mut alice = establish(&merchant, 0x3e545d8d86be6259, 1000000, 1000000);
    pay(&merchant, &mut alice, 0);

    let (session_id, com, _) = request(&merchant, &mut alice, 10).unwrap();
    let masks = run_mpc(&merchant, &mut alice, session_id, com);
    let revoked = mpc::pay_unmask_sigs_customer(&alice.channel_state, &alice.token, &masks, &mut alice.state).unwrap();

    let mut tampered = revoked.clone();
    tampered.rev_secret.0[0] ^= 0x01;
    assert!(is_rejected_with(
        revoke(&merchant, &mut alice, session_id, tampered),
        "rev_secret"
    ));
    let lock_hex = hex::encode(revoked.rev_lock.0);
    let nonce_hex = hex::encode(revoked.nonce.0);
    merchant.service.with_db(|db| {
        assert!(!db.check_rev_lock_map(&lock_hex).unwrap());
        assert!(!db.check_spent_map(&nonce_hex).unwrap());
    });
    assert!(alice.state.payment_in_progress());

    revoke(&merchant, &mut alice, session_id, revoked.clone()).unwrap();
    assert!(alice.state.has_tokens());
    assert_eq!(merchant.service.check_rev_lock(&revoked.rev_lock.0).unwrap(), Some(revoked.rev_secret.0));
}

#[test]
fn mpc_timeout_then_retry() {
    let merchant = Merchant::start(Duration::from_secs(2));
    let mut alice = establish(&merchant, 0x86be62593e545d8d, 1000000, 1000000);
    pay(&merchant, &mut alice, 0);
    let before = alice.state.get_current_state().unwrap();

    // the customer never joins the mpc
    let (_, _, rev_state) = request(&merchant, &mut alice, 10).unwrap();
    assert!(is_rejected_with(merchant.recv(), "timed out"));
    mpc::pay_abort_customer(&mut alice.state).unwrap();
    assert_eq!(alice.state.get_current_state().unwrap(), before);
    assert!(alice.state.has_tokens());

    let nonce_hex = hex::encode(rev_state.nonce.0);
    merchant.service.with_db(|db| {
        assert!(!db.check_spent_map(&nonce_hex).unwrap());
    });

    // same nonce, fresh session
    pay(&merchant, &mut alice, 10);
    assert_eq!(alice.state.cust_balance, 1000000 - 10);
    merchant.service.with_db(|db| {
        assert!(db.check_spent_map(&nonce_hex).unwrap());
    });
}

#[test]
fn unlink_requires_a_known_nonce() {
    let merchant = Merchant::start(Duration::from_secs(10));
    let mut alice = establish(&merchant, 0x5d8d86be62593e54, 1000000, 1000000);

    let mut rng = XorShiftRng::seed_from_u64(17);
    let mut session_id = [0u8; 16];
    let mut nonce = [0u8; 16];
    rng.fill_bytes(&mut session_id);
    rng.fill_bytes(&mut nonce);
    let r = merchant.send(ProtocolMessage::PaymentRequest {
        session_id: FixedSizeArray16(session_id),
        nonce: FixedSizeArray16(nonce),
        rev_lock_com: FixedSizeArray32([0u8; 32]),
        amount: 0,
        justification: None,
    });
    assert!(is_rejected_with(r, "previously known nonce"));

    // the real one still works
    pay(&merchant, &mut alice, 0);
    assert!(alice.state.has_tokens());
}

#[test]
fn spent_nonce_is_rejected() {
    let merchant = Merchant::start(Duration::from_secs(10));
    let mut alice = establish(&merchant, 0x62593e54d8d86be5, 1000000, 1000000);
    pay(&merchant, &mut alice, 0);

    let (session_id, com, rev_state) = request(&merchant, &mut alice, 10).unwrap();
    let masks = run_mpc(&merchant, &mut alice, session_id, com);
    let revoked = mpc::pay_unmask_sigs_customer(&alice.channel_state, &alice.token, &masks, &mut alice.state).unwrap();
    revoke(&merchant, &mut alice, session_id, revoked).unwrap();

    // replay the old nonce under a new session
    let mut rng = XorShiftRng::seed_from_u64(23);
    let mut replay = [0u8; 16];
    rng.fill_bytes(&mut replay);
    let r = merchant.send(ProtocolMessage::PaymentRequest {
        session_id: FixedSizeArray16(replay),
        nonce: rev_state.nonce,
        rev_lock_com: rev_state.rev_lock_com,
        amount: 5,
        justification: None,
    });
    assert!(is_rejected_with(r, "spent"));
    assert_eq!(alice.state.cust_balance, 1000000 - 10);
}
