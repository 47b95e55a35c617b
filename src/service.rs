//! Merchant front end serving many channels at once.
//!
//! Payment rounds are serialized per nonce and status operations per escrow
//! txid; independent channels never wait on each other. The store mutex is
//! only held around individual store calls, never across the MPC. Whenever
//! both are needed, the merchant state lock is taken before the store lock.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use secp256k1::PublicKey;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channels_mpc::{
    ChannelMPCState, ChannelMPCToken, InitCustState, MerchantMPCState, MutualCloseRequest, RevokedState,
};
use crate::channels_util::{ChannelStatus, FundingTxInfo};
use crate::database::{MaskedTxMPCInputs, StateDatabase};
use crate::error::{ZkChannelError, ZkResult};
use crate::fixed_size_array::{FixedSizeArray16, FixedSizeArray32};
use crate::mpc;
use crate::mpc_session::{MpcCoordinator, PartyInputs};
use crate::transactions::SignedTransaction;
use crate::util::{compute_prevout, reverse_bytes};
use crate::wallet::{State, NONCE_LEN};
use crate::wire::ProtocolMessage;

pub const DEFAULT_MPC_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MerchantService<D: StateDatabase> {
    merch_state: RwLock<MerchantMPCState>,
    channel_state: ChannelMPCState,
    db: Mutex<D>,
    coordinator: Arc<dyn MpcCoordinator>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    mpc_timeout: Duration,
}

impl<D: StateDatabase> MerchantService<D> {
    pub fn new(
        merch_state: MerchantMPCState,
        channel_state: ChannelMPCState,
        db: D,
        coordinator: Arc<dyn MpcCoordinator>,
    ) -> Self {
        MerchantService {
            merch_state: RwLock::new(merch_state),
            channel_state,
            db: Mutex::new(db),
            coordinator,
            locks: DashMap::new(),
            mpc_timeout: DEFAULT_MPC_TIMEOUT,
        }
    }

    pub fn with_mpc_timeout(mut self, timeout: Duration) -> Self {
        self.mpc_timeout = timeout;
        self
    }

    pub fn channel_state(&self) -> &ChannelMPCState {
        &self.channel_state
    }

    pub fn pk_m(&self) -> PublicKey {
        self.merch_state.read().pk_m
    }

    /// Snapshot of the merchant state, e.g. for persisting.
    pub fn merch_state(&self) -> MerchantMPCState {
        self.merch_state.read().clone()
    }

    /// Runs `f` against the store while holding the store lock.
    pub fn with_db<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut D) -> T,
    {
        f(&mut *self.db.lock())
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    fn release_key(&self, key: &str) {
        self.locks.remove_if(key, |_, l| Arc::strong_count(l) == 1);
    }

    /// Runs `f` while holding the lock for `key`.
    fn locked<T, F>(&self, key: &str, f: F) -> ZkResult<T>
    where
        F: FnOnce() -> ZkResult<T>,
    {
        let lock = self.key_lock(key);
        let r = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.release_key(key);
        r
    }

    // establishment

    pub fn verify_merch_close_tx(
        &self,
        escrow_txid_le: &[u8; 32],
        cust_pk: &PublicKey,
        cust_bal: i64,
        merch_bal: i64,
        fee_mc: i64,
        cust_sig: &[u8],
    ) -> ZkResult<([u8; 32], [u8; 32])> {
        let key = hex::encode(reverse_bytes(escrow_txid_le));
        self.locked(&key, || {
            let mut merch_state = self.merch_state.write();
            let mut db = self.db.lock();
            mpc::merchant_verify_merch_close_tx(
                &mut *db,
                &self.channel_state,
                escrow_txid_le,
                cust_pk,
                cust_bal,
                merch_bal,
                fee_mc,
                cust_sig,
                &mut merch_state,
            )
        })
    }

    pub fn validate_initial_state(
        &self,
        channel_token: &ChannelMPCToken,
        init_state: &InitCustState,
        init_hash: [u8; 32],
    ) -> ZkResult<bool> {
        let key = hex::encode(channel_token.escrow_txid_be());
        self.locked(&key, || {
            let mut merch_state = self.merch_state.write();
            let mut db = self.db.lock();
            mpc::validate_channel_params(&mut *db, channel_token, init_state, init_hash, &mut merch_state)
        })
    }

    pub fn sign_init_cust_close_txs(
        &self,
        funding_tx: &FundingTxInfo,
        rev_lock: [u8; 32],
        cust_pk: PublicKey,
        cust_close_pk: PublicKey,
        fee_cc: i64,
    ) -> ZkResult<(Vec<u8>, Vec<u8>)> {
        mpc::merchant_sign_init_cust_close_txs(
            &self.channel_state,
            funding_tx,
            rev_lock,
            cust_pk,
            cust_close_pk,
            fee_cc,
            &self.merch_state.read(),
        )
    }

    pub fn mark_open(&self, escrow_txid_le: [u8; 32]) -> ZkResult<()> {
        let key = hex::encode(reverse_bytes(&escrow_txid_le));
        self.locked(&key, || mpc::merchant_mark_open_channel(&mut *self.db.lock(), escrow_txid_le))
    }

    pub fn activate(&self, channel_token: &ChannelMPCToken, s0: &State) -> ZkResult<[u8; 32]> {
        let key = hex::encode(channel_token.escrow_txid_be());
        self.locked(&key, || {
            let merch_state = self.merch_state.read();
            let mut db = self.db.lock();
            mpc::activate_merchant(&mut *db, channel_token, s0, &merch_state)
        })
    }

    // payment

    pub fn pay_prepare<R: Rng>(
        &self,
        csprng: &mut R,
        session_id: [u8; 16],
        nonce: [u8; NONCE_LEN],
        rev_lock_com: [u8; 32],
        amount: i64,
        justification: Option<String>,
    ) -> ZkResult<[u8; 32]> {
        let key = hex::encode(nonce);
        self.locked(&key, || {
            let merch_state = self.merch_state.read();
            let mut db = self.db.lock();
            mpc::pay_prepare_merchant(
                csprng,
                &mut *db,
                session_id,
                nonce,
                rev_lock_com,
                amount,
                justification,
                &merch_state,
            )
        })
    }

    /// Merchant half of the MPC for a prepared session. Returns the masks the
    /// customer needs to unmask its closing signatures.
    pub fn pay_update<R: Rng>(&self, csprng: &mut R, session_id: [u8; 16]) -> ZkResult<MaskedTxMPCInputs> {
        let session_hex = hex::encode(session_id);
        let nonce = self.db.lock().load_session_state(&session_hex)?.nonce;
        let key = hex::encode(nonce.0);
        self.locked(&key, || {
            let input = {
                let merch_state = self.merch_state.read();
                let mut db = self.db.lock();
                merch_state.prepare_mpc_inputs(csprng, &mut *db, &self.channel_state, session_id)?
            };
            debug!(session = %session_hex, "running mpc");
            let result = self.coordinator.execute(
                &session_id,
                PartyInputs::Merchant(Box::new(input.clone())),
                self.mpc_timeout,
            );
            let merch_state = self.merch_state.read();
            let mut db = self.db.lock();
            merch_state.finish_mpc(&mut *db, session_id, &input, result)?;
            mpc::pay_confirm_mpc_result(&mut *db, session_id, &merch_state)
        })
    }

    pub fn pay_validate_rev_lock(
        &self,
        session_id: [u8; 16],
        rev_state: &RevokedState,
    ) -> ZkResult<([u8; 32], [u8; 16])> {
        let key = hex::encode(rev_state.get_nonce());
        self.locked(&key, || {
            let merch_state = self.merch_state.read();
            let mut db = self.db.lock();
            mpc::pay_validate_rev_lock_merchant(&mut *db, session_id, rev_state, &merch_state)
        })
    }

    // status and closing

    pub fn get_channel_status(&self, escrow_txid_le: &[u8; 32]) -> ZkResult<ChannelStatus> {
        mpc::merchant_get_channel_status(&mut *self.db.lock(), escrow_txid_le)
    }

    pub fn change_channel_status(&self, escrow_txid_le: &[u8; 32], status: ChannelStatus) -> ZkResult<ChannelStatus> {
        let key = hex::encode(reverse_bytes(escrow_txid_le));
        self.locked(&key, || mpc::merchant_change_channel_status(&mut *self.db.lock(), escrow_txid_le, status))
    }

    pub fn clear_channel_status(&self, escrow_txid_le: &[u8; 32]) -> ZkResult<()> {
        let key = hex::encode(reverse_bytes(escrow_txid_le));
        self.locked(&key, || mpc::merchant_clear_channel_status(&mut *self.db.lock(), escrow_txid_le))
    }

    pub fn list_channels(&self) -> ZkResult<Vec<(String, ZkResult<ChannelStatus>)>> {
        mpc::merchant_list_channels(&mut *self.db.lock())
    }

    pub fn force_close(&self, escrow_txid_le: &[u8; 32]) -> ZkResult<SignedTransaction> {
        let key = hex::encode(reverse_bytes(escrow_txid_le));
        self.locked(&key, || {
            let merch_state = self.merch_state.read();
            let mut db = self.db.lock();
            mpc::force_merchant_close(&mut *db, escrow_txid_le, &merch_state)
        })
    }

    pub fn check_rev_lock(&self, rev_lock: &[u8; 32]) -> ZkResult<Option<[u8; 32]>> {
        let merch_state = self.merch_state.read();
        let mut db = self.db.lock();
        mpc::merchant_check_rev_lock(&mut *db, rev_lock, &merch_state)
    }

    /// Penalizes a revoked cust-close seen on chain. Returns `None` when the
    /// lock was never revoked.
    pub fn dispute<R: Rng>(
        &self,
        csprng: &mut R,
        escrow_txid_le: &[u8; 32],
        close_txid_le: &[u8; 32],
        input_amount: i64,
        claim_amount: i64,
        rev_lock: &[u8; 32],
        cust_close_pk: &PublicKey,
    ) -> ZkResult<Option<(SignedTransaction, PublicKey)>> {
        let rev_secret = match self.check_rev_lock(rev_lock)? {
            Some(s) => s,
            None => return Ok(None),
        };
        let (output_pk, _) = crate::util::generate_keypair(csprng);
        let key = hex::encode(reverse_bytes(escrow_txid_le));
        let signed = self.locked(&key, || {
            let merch_state = self.merch_state.read();
            let mut db = self.db.lock();
            mpc::merchant_sign_dispute_tx(
                &mut *db,
                &self.channel_state,
                escrow_txid_le,
                close_txid_le,
                input_amount,
                claim_amount,
                &output_pk,
                rev_lock,
                &rev_secret,
                cust_close_pk,
                &merch_state,
            )
        })?;
        warn!(escrow = %key, rev_lock = %hex::encode(rev_lock), "revoked close disputed");
        Ok(Some((signed, output_pk)))
    }

    pub fn sign_mutual_close(
        &self,
        escrow_txid_le: &[u8; 32],
        cust_close_pk: &PublicKey,
        request: &MutualCloseRequest,
    ) -> ZkResult<SignedTransaction> {
        let key = hex::encode(reverse_bytes(escrow_txid_le));
        self.locked(&key, || {
            let merch_state = self.merch_state.read();
            let mut db = self.db.lock();
            mpc::merchant_sign_mutual_close_tx(&mut *db, escrow_txid_le, cust_close_pk, request, &merch_state)
        })
    }

    /// Dispatches one customer message. A status update needs no reply and
    /// returns `Ok(None)`.
    pub fn handle_message<R: Rng>(&self, csprng: &mut R, msg: ProtocolMessage) -> ZkResult<Option<ProtocolMessage>> {
        match msg {
            ProtocolMessage::MerchCloseSignature {
                escrow_txid_le,
                init_state,
                fee_cc,
                cust_sig,
            } => {
                let cust_sig = hex::decode(&cust_sig)?;
                let (merch_txid_be, merch_prevout) = self.verify_merch_close_tx(
                    &escrow_txid_le.0,
                    &init_state.pk_c,
                    init_state.cust_bal,
                    init_state.merch_bal,
                    init_state.fee_mc,
                    &cust_sig,
                )?;
                let escrow_txid_be = reverse_bytes(&escrow_txid_le.0);
                let funding_tx = FundingTxInfo {
                    init_cust_bal: init_state.cust_bal,
                    init_merch_bal: init_state.merch_bal,
                    escrow_txid: FixedSizeArray32(escrow_txid_be),
                    escrow_prevout: FixedSizeArray32(compute_prevout(&escrow_txid_be, 0)),
                    merch_txid: FixedSizeArray32(merch_txid_be),
                    merch_prevout: FixedSizeArray32(merch_prevout),
                    fee_mc: init_state.fee_mc,
                    min_fee: init_state.min_fee,
                    max_fee: init_state.max_fee,
                };
                let (escrow_sig, merch_sig) = self.sign_init_cust_close_txs(
                    &funding_tx,
                    init_state.rev_lock.0,
                    init_state.pk_c,
                    init_state.close_pk,
                    fee_cc,
                )?;
                Ok(Some(ProtocolMessage::InitCustCloseSignatures {
                    escrow_sig: hex::encode(escrow_sig),
                    merch_sig: hex::encode(merch_sig),
                }))
            }
            ProtocolMessage::InitialState {
                channel_token,
                init_state,
                init_hash,
            } => {
                self.validate_initial_state(&channel_token, &init_state, init_hash.0)?;
                let status = self.get_channel_status(&channel_token.escrow_txid.0)?;
                Ok(Some(ProtocolMessage::StatusUpdate {
                    escrow_txid_le: channel_token.escrow_txid,
                    status,
                }))
            }
            ProtocolMessage::ActivateRequest { channel_token, s0 } => {
                let pay_token = self.activate(&channel_token, &s0)?;
                info!(escrow = %hex::encode(channel_token.escrow_txid_be()), "channel activated");
                Ok(Some(ProtocolMessage::PayToken0 {
                    pay_token: FixedSizeArray32(pay_token),
                }))
            }
            ProtocolMessage::PaymentRequest {
                session_id,
                nonce,
                rev_lock_com,
                amount,
                justification,
            } => {
                let com = self.pay_prepare(csprng, session_id.0, nonce.0, rev_lock_com.0, amount, justification)?;
                Ok(Some(ProtocolMessage::PayMaskCommitment {
                    pay_token_mask_com: FixedSizeArray32(com),
                }))
            }
            ProtocolMessage::Revocation { session_id, rev_state } => {
                let (pt_mask, pt_mask_r) = self.pay_validate_rev_lock(session_id.0, &rev_state)?;
                Ok(Some(ProtocolMessage::PayTokenMask {
                    pt_mask: FixedSizeArray32(pt_mask),
                    pt_mask_r: FixedSizeArray16(pt_mask_r),
                }))
            }
            ProtocolMessage::MutualCloseSignature {
                escrow_txid_le,
                cust_close_pk,
                state,
                pay_token,
                cust_bal,
                merch_bal,
                cust_sig,
            } => {
                let request = MutualCloseRequest {
                    state,
                    pay_token,
                    cust_bal,
                    merch_bal,
                    cust_sig: hex::decode(&cust_sig)?,
                };
                let signed = self.sign_mutual_close(&escrow_txid_le.0, &cust_close_pk, &request)?;
                info!(txid = %hex::encode(signed.txid_le), "mutual close ready for broadcast");
                Ok(Some(ProtocolMessage::StatusUpdate {
                    escrow_txid_le,
                    status: self.get_channel_status(&escrow_txid_le.0)?,
                }))
            }
            ProtocolMessage::StatusUpdate { escrow_txid_le, status } => {
                self.change_channel_status(&escrow_txid_le.0, status)?;
                Ok(None)
            }
            other => Err(ZkChannelError::Validation(format!(
                "unexpected message for merchant: {}",
                message_name(&other)
            ))),
        }
    }
}

fn message_name(msg: &ProtocolMessage) -> &'static str {
    match msg {
        ProtocolMessage::ChannelOffer { .. } => "ChannelOffer",
        ProtocolMessage::InitialState { .. } => "InitialState",
        ProtocolMessage::MerchCloseSignature { .. } => "MerchCloseSignature",
        ProtocolMessage::InitCustCloseSignatures { .. } => "InitCustCloseSignatures",
        ProtocolMessage::ActivateRequest { .. } => "ActivateRequest",
        ProtocolMessage::PayToken0 { .. } => "PayToken0",
        ProtocolMessage::PaymentRequest { .. } => "PaymentRequest",
        ProtocolMessage::PayMaskCommitment { .. } => "PayMaskCommitment",
        ProtocolMessage::MaskedTxInputs { .. } => "MaskedTxInputs",
        ProtocolMessage::Revocation { .. } => "Revocation",
        ProtocolMessage::PayTokenMask { .. } => "PayTokenMask",
        ProtocolMessage::MutualCloseSignature { .. } => "MutualCloseSignature",
        ProtocolMessage::StatusUpdate { .. } => "StatusUpdate",
    }
}
