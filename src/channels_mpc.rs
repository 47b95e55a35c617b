use rand::Rng;
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channels_util::{ChannelStatus, FundingTxInfo, PaymentStatus, ProtocolStatus};
use crate::database::{MaskedMPCInputs, MaskedTxMPCInputs, SessionState, StateDatabase};
use crate::error::{ZkChannelError, ZkResult};
use crate::fixed_size_array::{FixedSizeArray16, FixedSizeArray32, FixedSizeArray64};
use crate::mpc_session::{
    CustomerMpcInput, MaskedMPCOutputs, MaskedResult, MerchantMpcInput, MpcCoordinator,
    PartyInputs,
};
use crate::transactions::btc::{
    complete_cust_close_transaction, complete_escrow_spend, cust_close_transactions_for_state,
    customer_sign_claim_transaction, customer_sign_merch_close_transaction,
    form_merch_close_transaction, form_mutual_close_transaction,
    merchant_sign_cust_claim_transaction, merchant_sign_dispute_transaction,
    merchant_sign_merch_claim_transaction, merchant_sign_merch_close_transaction,
    ClosePublicKeys, CustCloseTxs,
};
use crate::transactions::{decode_signature, sign_sighash, verify_sighash_signature, SignedTransaction};
use crate::util::{
    compute_commitment, compute_prevout, compute_rev_lock, generate_keypair, hash_to_slice,
    hmac_sign, hmac_verify, is_valid_rev_secret, public_key_from_bytes, reverse_bytes, xor_in_place,
};
use crate::wallet::{balance_floor, State, NONCE_LEN};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMPCToken {
    pub pk_c: Option<PublicKey>,
    pub pk_m: PublicKey,
    // little-endian, as they appear on the wire
    pub escrow_txid: FixedSizeArray32,
    pub merch_txid: FixedSizeArray32,
}

impl ChannelMPCToken {
    pub fn set_customer_pk(&mut self, pk_c: PublicKey) {
        self.pk_c = Some(pk_c);
    }

    pub fn is_init(&self) -> bool {
        self.pk_c.is_some()
    }

    pub fn compute_channel_id(&self) -> ZkResult<[u8; 32]> {
        if self.pk_c.is_none() {
            return Err(ZkChannelError::Validation("pk_c is not initialized yet".to_string()));
        }
        let input = serde_json::to_vec(&self)?;
        Ok(hash_to_slice(&input))
    }

    pub fn escrow_txid_be(&self) -> [u8; 32] {
        reverse_bytes(&self.escrow_txid.0)
    }
}

impl fmt::Display for ChannelMPCToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pkc_hex = match self.pk_c {
            Some(n) => hex::encode(n.serialize().to_vec()),
            None => "None".to_string(),
        };
        write!(
            f,
            "ChannelMPCToken : (\npkc={}\npkm={}\nescrow_txid={}\nmerch_txid={}\n)",
            pkc_hex,
            hex::encode(self.pk_m.serialize().to_vec()),
            self.escrow_txid,
            self.merch_txid
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionFeeInfo {
    pub bal_min_cust: i64,
    pub bal_min_merch: i64,
    pub val_cpfp: i64,
    pub fee_cc: i64,
    pub fee_mc: i64,
    pub min_fee: i64,
    pub max_fee: i64,
}

impl Default for TransactionFeeInfo {
    fn default() -> Self {
        let dust_limit = 546;
        TransactionFeeInfo {
            bal_min_cust: dust_limit,
            bal_min_merch: dust_limit,
            val_cpfp: 1000,
            fee_cc: 1000,
            fee_mc: 1000,
            min_fee: 0,
            max_fee: 10000,
        }
    }
}

impl fmt::Display for TransactionFeeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TransactionFeeInfo : (\nbal_min_cust={}\nbal_min_merch={}\nval_cpfp={}\nfee_cc={}\nfee_mc={}\nmin_fee={}\nmax_fee={}\n)",
            self.bal_min_cust, self.bal_min_merch, self.val_cpfp, self.fee_cc, self.fee_mc, self.min_fee, self.max_fee
        )
    }
}

/// Public channel parameters both parties agree on before funding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMPCState {
    bal_min_cust: i64,
    bal_min_merch: i64,
    val_cpfp: i64,
    key_com: FixedSizeArray32,
    pub name: String,
    pub third_party: bool,
    pub merch_payout_pk: Option<PublicKey>,
    pub merch_dispute_pk: Option<PublicKey>,
    pub self_delay: u16,
}

impl ChannelMPCState {
    pub fn new(
        name: String,
        self_delay: u16,
        bal_min_cust: i64,
        bal_min_merch: i64,
        val_cpfp: i64,
        third_party_support: bool,
    ) -> ChannelMPCState {
        ChannelMPCState {
            bal_min_cust,
            bal_min_merch,
            val_cpfp,
            key_com: FixedSizeArray32([0u8; 32]),
            name,
            third_party: third_party_support,
            merch_payout_pk: None,
            merch_dispute_pk: None,
            self_delay,
        }
    }

    pub fn get_bal_min_cust(&self) -> i64 {
        self.bal_min_cust
    }

    pub fn get_bal_min_merch(&self) -> i64 {
        self.bal_min_merch
    }

    pub fn get_val_cpfp(&self) -> i64 {
        self.val_cpfp
    }

    pub fn get_key_com(&self) -> [u8; 32] {
        self.key_com.0
    }

    pub fn set_key_com(&mut self, key_com: [u8; 32]) {
        self.key_com = FixedSizeArray32(key_com);
    }

    pub fn set_merchant_public_keys(&mut self, merch_payout_pk: PublicKey, merch_dispute_pk: PublicKey) {
        self.merch_payout_pk = Some(merch_payout_pk);
        self.merch_dispute_pk = Some(merch_dispute_pk);
    }

    pub fn get_merch_payout_pk(&self) -> ZkResult<PublicKey> {
        self.merch_payout_pk
            .ok_or_else(|| ZkChannelError::Validation("merchant payout pk not set".to_string()))
    }

    pub fn get_merch_dispute_pk(&self) -> ZkResult<PublicKey> {
        self.merch_dispute_pk
            .ok_or_else(|| ZkChannelError::Validation("merchant dispute pk not set".to_string()))
    }
}

/// What the customer reveals to the merchant at channel establishment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitCustState {
    pub pk_c: PublicKey,
    pub close_pk: PublicKey,
    pub nonce: FixedSizeArray16,
    pub rev_lock: FixedSizeArray32,
    pub cust_bal: i64,
    pub merch_bal: i64,
    pub min_fee: i64,
    pub max_fee: i64,
    pub fee_mc: i64,
}

impl fmt::Display for InitCustState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "InitCustState : (\npkc={}\nnonce={}\nrev_lock={}\n)",
            hex::encode(self.pk_c.serialize().to_vec()),
            self.nonce,
            self.rev_lock
        )
    }
}

/// Opening of the previous state's revocation commitment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevokedState {
    pub nonce: FixedSizeArray16,
    pub rev_lock_com: FixedSizeArray32,
    pub rev_lock: FixedSizeArray32,
    pub rev_secret: FixedSizeArray32,
    pub t: FixedSizeArray16,
}

impl RevokedState {
    pub fn new(
        nonce: [u8; NONCE_LEN],
        rev_lock_com: [u8; 32],
        rev_lock: [u8; 32],
        rev_secret: [u8; 32],
        t: [u8; 16],
    ) -> Self {
        RevokedState {
            nonce: FixedSizeArray16(nonce),
            rev_lock_com: FixedSizeArray32(rev_lock_com),
            rev_lock: FixedSizeArray32(rev_lock),
            rev_secret: FixedSizeArray32(rev_secret),
            t: FixedSizeArray16(t),
        }
    }

    pub fn get_nonce(&self) -> [u8; NONCE_LEN] {
        self.nonce.0
    }

    pub fn get_rev_lock_com(&self) -> [u8; 32] {
        self.rev_lock_com.0
    }

    pub fn get_rev_lock(&self) -> [u8; 32] {
        self.rev_lock.0
    }

    pub fn get_rev_secret(&self) -> [u8; 32] {
        self.rev_secret.0
    }

    pub fn get_randomness(&self) -> [u8; 16] {
        self.t.0
    }
}

/// A payment the customer has started but not yet committed to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct PendingPayment {
    prior_status: ProtocolStatus,
    session_id: FixedSizeArray16,
    amount: i64,
    new_state: State,
    new_rev_lock: FixedSizeArray32,
    new_rev_secret: FixedSizeArray32,
    revoked: RevokedState,
    pay_token_mask_com: Option<FixedSizeArray32>,
    masked_outputs: Option<MaskedMPCOutputs>,
    // set once both unmasked close signatures verify; from then on the
    // revocation for the old state may be in the merchant's hands
    close_escrow_signature: Option<String>,
    close_merch_signature: Option<String>,
}

impl PendingPayment {
    fn signatures_verified(&self) -> bool {
        self.close_escrow_signature.is_some() && self.close_merch_signature.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerMPCState {
    pub name: String,
    pub pk_c: PublicKey,
    sk_c: FixedSizeArray32,
    pub cust_balance: i64,
    pub merch_balance: i64,
    fee_cc: i64,
    rev_lock: FixedSizeArray32,
    rev_secret: FixedSizeArray32,
    state: Option<State>,
    index: u32,
    pay_token: Option<FixedSizeArray32>,
    payout_sk: FixedSizeArray32,
    pub payout_pk: PublicKey,
    close_escrow_signature: Option<String>,
    close_merch_signature: Option<String>,
    pending: Option<PendingPayment>,
    pub protocol_status: ProtocolStatus,
    channel_status: ChannelStatus,
}

fn random_bytes_16<R: Rng>(csprng: &mut R) -> [u8; 16] {
    let mut buf = [0u8; 16];
    csprng.fill_bytes(&mut buf);
    buf
}

fn random_bytes_32<R: Rng>(csprng: &mut R) -> [u8; 32] {
    let mut buf = [0u8; 32];
    csprng.fill_bytes(&mut buf);
    buf
}

fn secret_key(label: &str, sk: &FixedSizeArray32) -> ZkResult<SecretKey> {
    Ok(public_key_from_bytes(label, &sk.0)?.1)
}

fn compact_signature_from_hex(label: &str, sig: &Option<String>) -> ZkResult<[u8; 64]> {
    let sig = sig
        .as_ref()
        .ok_or_else(|| ZkChannelError::Validation(format!("{} close signature not available", label)))?;
    let bytes = hex::decode(sig)?;
    if bytes.len() != 64 {
        return Err(ZkChannelError::Validation(format!("{} close signature has wrong length", label)));
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Joins the merchant-held `r` half with the unmasked `s` half and checks the
/// result against `sighash`.
fn unmask_signature(
    r: &[u8; 32],
    masked_s: &[u8; 32],
    mask: &[u8; 32],
    sighash: &[u8; 32],
    pk_m: &PublicKey,
) -> ZkResult<String> {
    let mut s = *masked_s;
    xor_in_place(&mut s, mask);
    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(r);
    compact[32..].copy_from_slice(&s);
    let sig = Signature::from_compact(&compact)
        .map_err(|e| ZkChannelError::InvalidSignature(format!("malformed close signature: {}", e)))?;
    verify_sighash_signature(sighash, &sig, pk_m)?;
    Ok(hex::encode(&compact[..]))
}

impl CustomerMPCState {
    pub fn new<R: Rng>(csprng: &mut R, cust_bal: i64, merch_bal: i64, fee_cc: i64, name: String) -> Self {
        let (pk_c, sk_c) = generate_keypair(csprng);
        let (payout_pk, payout_sk) = generate_keypair(csprng);

        // revocation pair for the initial state
        let rev_secret = random_bytes_32(csprng);
        let rev_lock = compute_rev_lock(&rev_secret);

        CustomerMPCState {
            name,
            pk_c,
            sk_c: FixedSizeArray32(sk_c.secret_bytes()),
            cust_balance: cust_bal,
            merch_balance: merch_bal,
            fee_cc,
            rev_lock: FixedSizeArray32(rev_lock),
            rev_secret: FixedSizeArray32(rev_secret),
            state: None,
            index: 0,
            pay_token: None,
            payout_sk: FixedSizeArray32(payout_sk.secret_bytes()),
            payout_pk,
            close_escrow_signature: None,
            close_merch_signature: None,
            pending: None,
            protocol_status: ProtocolStatus::New,
            channel_status: ChannelStatus::None,
        }
    }

    pub fn load_external_wallet(
        &mut self,
        channel_token: &mut ChannelMPCToken,
        cust_sk: [u8; 32],
        pay_sk: [u8; 32],
    ) -> ZkResult<()> {
        if self.protocol_status != ProtocolStatus::New {
            return Err(ZkChannelError::InvalidStatus {
                op: "load_external_wallet",
                status: self.protocol_status.to_string(),
            });
        }
        let (pk_c, _) = public_key_from_bytes("cust_sk", &cust_sk)?;
        let (payout_pk, _) = public_key_from_bytes("pay_sk", &pay_sk)?;

        channel_token.set_customer_pk(pk_c);
        self.sk_c = FixedSizeArray32(cust_sk);
        self.pk_c = pk_c;
        self.payout_sk = FixedSizeArray32(pay_sk);
        self.payout_pk = payout_pk;
        Ok(())
    }

    pub fn get_secret_key(&self) -> [u8; 32] {
        self.sk_c.0
    }

    pub fn get_close_secret_key(&self) -> [u8; 32] {
        self.payout_sk.0
    }

    pub fn get_fee_cc(&self) -> i64 {
        self.fee_cc
    }

    pub fn get_channel_status(&self) -> ChannelStatus {
        self.channel_status
    }

    pub fn change_channel_status(&mut self, next: ChannelStatus) -> ZkResult<()> {
        self.channel_status = self.channel_status.transition(next)?;
        debug!(customer = %self.name, status = %self.channel_status, "channel status changed");
        Ok(())
    }

    pub fn generate_init_state<R: Rng>(
        &mut self,
        csprng: &mut R,
        pk_m: &PublicKey,
        min_fee: i64,
        max_fee: i64,
        fee_mc: i64,
    ) -> ZkResult<ChannelMPCToken> {
        if self.state.is_some() {
            return Err(ZkChannelError::Validation("initial state already generated".to_string()));
        }
        if min_fee > max_fee || self.fee_cc < min_fee || self.fee_cc > max_fee {
            return Err(ZkChannelError::Validation(format!(
                "fee_cc {} outside of fee range [{}, {}]",
                self.fee_cc, min_fee, max_fee
            )));
        }

        let nonce = random_bytes_16(csprng);
        let state = State {
            nonce: FixedSizeArray16(nonce),
            rev_lock: self.rev_lock,
            bc: self.cust_balance,
            bm: self.merch_balance,
            escrow_txid: FixedSizeArray32([0u8; 32]),
            merch_txid: FixedSizeArray32([0u8; 32]),
            escrow_prevout: FixedSizeArray32([0u8; 32]),
            merch_prevout: FixedSizeArray32([0u8; 32]),
            min_fee,
            max_fee,
            fee_mc,
        };

        self.state = Some(state);
        Ok(ChannelMPCToken {
            pk_c: Some(self.pk_c),
            pk_m: *pk_m,
            escrow_txid: FixedSizeArray32([0u8; 32]),
            merch_txid: FixedSizeArray32([0u8; 32]),
        })
    }

    pub fn get_rev_pair(&self) -> ([u8; 32], [u8; 32]) {
        (self.rev_lock.0, self.rev_secret.0)
    }

    pub fn get_current_state(&self) -> ZkResult<State> {
        self.state
            .ok_or_else(|| ZkChannelError::Validation("customer initial state has not been created".to_string()))
    }

    pub fn has_tokens(&self) -> bool {
        self.pay_token.is_some()
    }

    pub fn payment_in_progress(&self) -> bool {
        self.pending.is_some()
    }

    pub fn get_payment_count(&self) -> u32 {
        self.index
    }

    pub fn set_funding_tx_info(&mut self, channel_token: &mut ChannelMPCToken, tx: &FundingTxInfo) -> ZkResult<()> {
        let mut s = self.get_current_state()?;
        if self.protocol_status != ProtocolStatus::New {
            return Err(ZkChannelError::InvalidStatus {
                op: "set_funding_tx_info",
                status: self.protocol_status.to_string(),
            });
        }
        s.escrow_txid = tx.escrow_txid;
        s.escrow_prevout = tx.escrow_prevout;
        s.merch_txid = tx.merch_txid;
        s.merch_prevout = tx.merch_prevout;
        s.bc = tx.init_cust_bal;
        s.bm = tx.init_merch_bal;
        s.min_fee = tx.min_fee;
        s.max_fee = tx.max_fee;
        s.fee_mc = tx.fee_mc;
        self.state = Some(s);
        self.cust_balance = s.bc;
        self.merch_balance = s.bm;

        channel_token.escrow_txid = FixedSizeArray32(reverse_bytes(&tx.escrow_txid.0));
        channel_token.merch_txid = FixedSizeArray32(reverse_bytes(&tx.merch_txid.0));
        Ok(())
    }

    pub fn get_initial_cust_state(&self) -> ZkResult<InitCustState> {
        let s = self.get_current_state()?;
        Ok(InitCustState {
            pk_c: self.pk_c,
            close_pk: self.payout_pk,
            nonce: s.nonce,
            rev_lock: s.rev_lock,
            cust_bal: s.bc,
            merch_bal: s.bm,
            min_fee: s.min_fee,
            max_fee: s.max_fee,
            fee_mc: s.fee_mc,
        })
    }

    pub fn get_pubkeys(&self, channel_state: &ChannelMPCState, channel_token: &ChannelMPCToken) -> ZkResult<ClosePublicKeys> {
        Ok(ClosePublicKeys {
            cust_pk: self.pk_c,
            cust_close_pk: self.payout_pk,
            merch_pk: channel_token.pk_m,
            merch_close_pk: channel_state.get_merch_payout_pk()?,
            merch_disp_pk: channel_state.get_merch_dispute_pk()?,
            rev_lock: self.rev_lock,
        })
    }

    /// Unsigned cust-close transactions (from escrow and from merch-close) for `state`.
    pub fn construct_close_transactions(
        &self,
        channel_state: &ChannelMPCState,
        channel_token: &ChannelMPCToken,
        state: &State,
    ) -> ZkResult<CustCloseTxs> {
        let pubkeys = self.get_pubkeys(channel_state, channel_token)?;
        cust_close_transactions_for_state(
            state,
            &pubkeys,
            channel_state.self_delay,
            self.fee_cc,
            channel_state.get_val_cpfp(),
        )
    }

    /// Customer's signature on merch-close. Also returns the merch-close
    /// txid (big-endian) and its prevout for `FundingTxInfo`.
    pub fn sign_merch_close_tx(
        &self,
        channel_state: &ChannelMPCState,
        channel_token: &ChannelMPCToken,
        escrow_txid_le: &[u8; 32],
    ) -> ZkResult<(Vec<u8>, [u8; 32], [u8; 32])> {
        let s = self.get_current_state()?;
        let (sighash, tx) = form_merch_close_transaction(
            escrow_txid_le,
            &self.pk_c,
            &channel_token.pk_m,
            &channel_state.get_merch_payout_pk()?,
            s.bc,
            s.bm,
            s.fee_mc,
            channel_state.get_val_cpfp(),
            channel_state.self_delay,
        )?;
        let sk_c = secret_key("cust_sk", &self.sk_c)?;
        let sig = customer_sign_merch_close_transaction(&sk_c, &sighash)?;
        let merch_txid_be = tx.txid_be();
        Ok((sig, merch_txid_be, compute_prevout(&merch_txid_be, 0)))
    }

    /// Checks the merchant's signatures on the initial cust-close transactions
    /// and stores them in compact form.
    pub fn sign_initial_closing_transaction(
        &mut self,
        channel_state: &ChannelMPCState,
        channel_token: &ChannelMPCToken,
        escrow_sig: &[u8],
        merch_sig: &[u8],
    ) -> ZkResult<()> {
        if self.protocol_status != ProtocolStatus::New {
            return Err(ZkChannelError::InvalidStatus {
                op: "sign_initial_closing_transaction",
                status: self.protocol_status.to_string(),
            });
        }
        let s = self.get_current_state()?;
        let txs = self.construct_close_transactions(channel_state, channel_token, &s)?;

        let escrow_sig = decode_signature(escrow_sig)?;
        verify_sighash_signature(&txs.escrow_sighash, &escrow_sig, &channel_token.pk_m)?;
        let merch_sig = decode_signature(merch_sig)?;
        verify_sighash_signature(&txs.merch_sighash, &merch_sig, &channel_token.pk_m)?;

        self.close_escrow_signature = Some(hex::encode(&escrow_sig.serialize_compact()[..]));
        self.close_merch_signature = Some(hex::encode(&merch_sig.serialize_compact()[..]));
        self.change_channel_status(ChannelStatus::PendingOpen)?;
        self.protocol_status = ProtocolStatus::Initialized;
        Ok(())
    }

    pub fn store_initial_pay_token(&mut self, pay_token: [u8; 32]) -> ZkResult<()> {
        if self.protocol_status != ProtocolStatus::Initialized {
            return Err(ZkChannelError::InvalidStatus {
                op: "store_initial_pay_token",
                status: self.protocol_status.to_string(),
            });
        }
        if self.channel_status != ChannelStatus::Open {
            return Err(ZkChannelError::InvalidStatus {
                op: "store_initial_pay_token",
                status: self.channel_status.to_string(),
            });
        }
        self.pay_token = Some(FixedSizeArray32(pay_token));
        self.protocol_status = ProtocolStatus::Activated;
        Ok(())
    }

    ///
    /// prepare_payment() - picks a fresh nonce and revocation pair for the next state
    /// and commits to the current revocation lock.
    /// output: new state, revoked state for the old one, and a session id
    ///
    pub fn prepare_payment<R: Rng>(
        &mut self,
        csprng: &mut R,
        channel_state: &ChannelMPCState,
        amount: i64,
    ) -> ZkResult<(State, RevokedState, [u8; 16])> {
        if self.pending.is_some() {
            return Err(ZkChannelError::PaymentInProgress);
        }
        match self.protocol_status {
            ProtocolStatus::Activated if amount >= 0 => (),
            ProtocolStatus::Ready if amount != 0 => (),
            s => {
                return Err(ZkChannelError::InvalidStatus {
                    op: "prepare_payment",
                    status: s.to_string(),
                })
            }
        }
        if self.channel_status != ChannelStatus::Open {
            return Err(ZkChannelError::InvalidStatus {
                op: "prepare_payment",
                status: self.channel_status.to_string(),
            });
        }
        if !self.has_tokens() {
            return Err(ZkChannelError::Validation("no pay token for the current state".to_string()));
        }

        let old_state = self.get_current_state()?;
        let (new_bc, new_bm) = old_state.apply_payment(amount)?;
        let cust_floor = balance_floor(&[channel_state.get_bal_min_cust(), self.fee_cc, channel_state.get_val_cpfp()])?;
        let merch_floor = balance_floor(&[channel_state.get_bal_min_merch(), old_state.fee_mc, channel_state.get_val_cpfp()])?;
        if new_bc < cust_floor {
            return Err(ZkChannelError::InsufficientBalance(format!(
                "customer balance {} would fall below {}",
                new_bc, cust_floor
            )));
        }
        if new_bm < merch_floor {
            return Err(ZkChannelError::InsufficientBalance(format!(
                "merchant balance {} would fall below {}",
                new_bm, merch_floor
            )));
        }

        let t = random_bytes_16(csprng);
        let rev_lock_com = compute_commitment(&self.rev_lock.0, &t);
        let revoked = RevokedState::new(old_state.get_nonce(), rev_lock_com, self.rev_lock.0, self.rev_secret.0, t);

        let new_rev_secret = random_bytes_32(csprng);
        let new_rev_lock = compute_rev_lock(&new_rev_secret);
        let mut new_state = old_state;
        new_state.nonce = FixedSizeArray16(random_bytes_16(csprng));
        new_state.rev_lock = FixedSizeArray32(new_rev_lock);
        new_state.bc = new_bc;
        new_state.bm = new_bm;

        let session_id = random_bytes_16(csprng);
        self.pending = Some(PendingPayment {
            prior_status: self.protocol_status,
            session_id: FixedSizeArray16(session_id),
            amount,
            new_state,
            new_rev_lock: FixedSizeArray32(new_rev_lock),
            new_rev_secret: FixedSizeArray32(new_rev_secret),
            revoked: revoked.clone(),
            pay_token_mask_com: None,
            masked_outputs: None,
            close_escrow_signature: None,
            close_merch_signature: None,
        });
        self.protocol_status = ProtocolStatus::PaymentInProgress;
        debug!(customer = %self.name, amount, session = %hex::encode(session_id), "payment prepared");
        Ok((new_state, revoked, session_id))
    }

    fn pending_mut(&mut self, op: &'static str) -> ZkResult<&mut PendingPayment> {
        let status = self.protocol_status;
        match self.pending.as_mut() {
            Some(p) if status == ProtocolStatus::PaymentInProgress => Ok(p),
            _ => Err(ZkChannelError::InvalidStatus {
                op,
                status: status.to_string(),
            }),
        }
    }

    pub fn build_mpc_input(
        &mut self,
        channel_state: &ChannelMPCState,
        channel_token: &ChannelMPCToken,
        pay_token_mask_com: [u8; 32],
    ) -> ZkResult<CustomerMpcInput> {
        let old_state = self.get_current_state()?;
        let old_pay_token = self
            .pay_token
            .ok_or_else(|| ZkChannelError::Validation("no pay token for the current state".to_string()))?;
        let fee_cc = self.fee_cc;
        let (cust_pk, cust_close_pk) = (self.pk_c, self.payout_pk);
        let pending = self.pending_mut("build_mpc_input")?;
        if pending.masked_outputs.is_some() {
            return Err(ZkChannelError::Validation("mpc already ran for this payment".to_string()));
        }
        pending.pay_token_mask_com = Some(FixedSizeArray32(pay_token_mask_com));

        Ok(CustomerMpcInput {
            old_state,
            new_state: pending.new_state,
            old_pay_token,
            t: pending.revoked.t,
            rev_lock_com: pending.revoked.rev_lock_com,
            pay_token_mask_com: FixedSizeArray32(pay_token_mask_com),
            key_com: FixedSizeArray32(channel_state.get_key_com()),
            amount: pending.amount,
            fee_cc,
            val_cpfp: channel_state.get_val_cpfp(),
            bal_min_cust: channel_state.get_bal_min_cust(),
            bal_min_merch: channel_state.get_bal_min_merch(),
            self_delay: channel_state.self_delay,
            cust_pk,
            cust_close_pk,
            merch_pk: channel_token.pk_m,
            merch_close_pk: channel_state.get_merch_payout_pk()?,
            merch_disp_pk: channel_state.get_merch_dispute_pk()?,
        })
    }

    pub fn store_mpc_result(&mut self, outputs: MaskedMPCOutputs) -> ZkResult<()> {
        let pending = self.pending_mut("store_mpc_result")?;
        pending.masked_outputs = Some(outputs);
        Ok(())
    }

    pub fn get_session_id(&self) -> Option<[u8; 16]> {
        self.pending.as_ref().map(|p| p.session_id.0)
    }

    ///
    /// execute_mpc_context() - runs the customer side of the payment MPC.
    /// A failed or timed-out session leaves the committed state untouched and
    /// drops the in-flight payment.
    ///
    pub fn execute_mpc_context(
        &mut self,
        channel_state: &ChannelMPCState,
        channel_token: &ChannelMPCToken,
        pay_token_mask_com: [u8; 32],
        coordinator: &dyn MpcCoordinator,
        timeout: Duration,
    ) -> ZkResult<()> {
        let input = self.build_mpc_input(channel_state, channel_token, pay_token_mask_com)?;
        let session_id = self.get_session_id().unwrap_or_default();
        match coordinator.execute(&session_id, PartyInputs::Customer(Box::new(input)), timeout) {
            Ok(MaskedResult::Customer(out)) => self.store_mpc_result(out),
            Ok(MaskedResult::Merchant(_)) => {
                self.abort_payment()?;
                Err(ZkChannelError::MpcFailure("received the merchant's outputs".to_string()))
            }
            Err(e) => {
                warn!(customer = %self.name, error = %e, "mpc failed, dropping payment");
                self.abort_payment()?;
                Err(e)
            }
        }
    }

    /// Unmasks and checks both close signatures for the new state. Failure
    /// aborts the payment.
    pub fn unmask_and_verify_transactions(
        &mut self,
        channel_state: &ChannelMPCState,
        channel_token: &ChannelMPCToken,
        mask_bytes: &MaskedTxMPCInputs,
    ) -> ZkResult<()> {
        let (new_state, outputs) = {
            let pending = self.pending_mut("unmask_and_verify_transactions")?;
            let outputs = pending
                .masked_outputs
                .ok_or_else(|| ZkChannelError::Validation("mpc has not produced outputs yet".to_string()))?;
            (pending.new_state, outputs)
        };

        let checked = self
            .construct_close_transactions(channel_state, channel_token, &new_state)
            .and_then(|txs| {
                let escrow_sig = unmask_signature(
                    &mask_bytes.r_escrow_sig.0,
                    &outputs.escrow_masked.0,
                    &mask_bytes.get_escrow_mask(),
                    &txs.escrow_sighash,
                    &channel_token.pk_m,
                )?;
                let merch_sig = unmask_signature(
                    &mask_bytes.r_merch_sig.0,
                    &outputs.merch_masked.0,
                    &mask_bytes.get_merch_mask(),
                    &txs.merch_sighash,
                    &channel_token.pk_m,
                )?;
                Ok((escrow_sig, merch_sig))
            });

        match checked {
            Ok((escrow_sig, merch_sig)) => {
                let pending = self.pending_mut("unmask_and_verify_transactions")?;
                pending.close_escrow_signature = Some(escrow_sig);
                pending.close_merch_signature = Some(merch_sig);
                Ok(())
            }
            Err(e) => {
                warn!(customer = %self.name, error = %e, "close signatures did not verify, aborting payment");
                self.abort_payment()?;
                Err(e)
            }
        }
    }

    /// Revocation for the old state. Only released once the new state's close
    /// signatures are in hand.
    pub fn get_revoked_state(&mut self) -> ZkResult<RevokedState> {
        let pending = self.pending_mut("get_revoked_state")?;
        if !pending.signatures_verified() {
            return Err(ZkChannelError::Validation(
                "close signatures for the new state have not been verified".to_string(),
            ));
        }
        Ok(pending.revoked.clone())
    }

    fn commit_pending(&mut self, pending: PendingPayment, pay_token: Option<[u8; 32]>) {
        self.state = Some(pending.new_state);
        self.rev_lock = pending.new_rev_lock;
        self.rev_secret = pending.new_rev_secret;
        self.cust_balance = pending.new_state.bc;
        self.merch_balance = pending.new_state.bm;
        self.close_escrow_signature = pending.close_escrow_signature;
        self.close_merch_signature = pending.close_merch_signature;
        self.pay_token = pay_token.map(FixedSizeArray32);
        self.index += 1;
        self.protocol_status = ProtocolStatus::Ready;
    }

    /// Last step of a payment. A pay mask that does not open its commitment
    /// still moves the customer to the new state (the old one is revoked) but
    /// without a pay token, so the channel can only be closed.
    pub fn unmask_and_verify_pay_token(&mut self, pt_mask: [u8; 32], pt_mask_r: [u8; 16]) -> ZkResult<()> {
        let pending = self.pending_mut("unmask_and_verify_pay_token")?.clone();
        if !pending.signatures_verified() {
            return Err(ZkChannelError::Validation(
                "close signatures for the new state have not been verified".to_string(),
            ));
        }
        self.pending = None;

        let com = pending.pay_token_mask_com.map(|c| c.0);
        let masked = pending.masked_outputs.map(|o| o.pt_masked.0);
        match (com, masked) {
            (Some(com), Some(mut pay_token)) if compute_commitment(&pt_mask, &pt_mask_r) == com => {
                xor_in_place(&mut pay_token, &pt_mask);
                self.commit_pending(pending, Some(pay_token));
                info!(customer = %self.name, index = self.index, "payment complete");
                Ok(())
            }
            _ => {
                self.commit_pending(pending, None);
                warn!(customer = %self.name, "pay token mask did not open, channel can only be closed");
                Err(ZkChannelError::Validation(
                    "pay token mask does not open the commitment; only closing is possible".to_string(),
                ))
            }
        }
    }

    /// Drops the in-flight payment. Once the old state may have been revoked
    /// the new state is adopted instead, without a pay token.
    pub fn abort_payment(&mut self) -> ZkResult<()> {
        let pending = match self.pending.take() {
            Some(p) => p,
            None => return Ok(()),
        };
        if pending.signatures_verified() {
            warn!(customer = %self.name, "aborting after revocation, adopting new state without pay token");
            self.commit_pending(pending, None);
        } else {
            self.protocol_status = pending.prior_status;
        }
        Ok(())
    }

    ///
    /// customer_close() - signs the cust-close transaction for the latest state
    /// spending either the escrow or merch-close output.
    ///
    pub fn customer_close(
        &mut self,
        channel_state: &ChannelMPCState,
        channel_token: &ChannelMPCToken,
        from_escrow: bool,
    ) -> ZkResult<SignedTransaction> {
        match self.channel_status {
            ChannelStatus::Open | ChannelStatus::MerchantInitClose | ChannelStatus::CustomerInitClose => (),
            s => {
                return Err(ZkChannelError::InvalidStatus {
                    op: "customer_close",
                    status: s.to_string(),
                })
            }
        }
        // the old state may already be revoked
        if self.pending.as_ref().map_or(false, |p| p.signatures_verified()) {
            self.abort_payment()?;
        }
        let s = self.get_current_state()?;
        let txs = self.construct_close_transactions(channel_state, channel_token, &s)?;
        let (tx, sig) = match from_escrow {
            true => (txs.escrow_tx, compact_signature_from_hex("escrow", &self.close_escrow_signature)?),
            false => (txs.merch_tx, compact_signature_from_hex("merch", &self.close_merch_signature)?),
        };
        let sk_c = secret_key("cust_sk", &self.sk_c)?;
        let signed = complete_cust_close_transaction(tx, &sig, &sk_c, from_escrow)?;

        if self.channel_status != ChannelStatus::CustomerInitClose {
            self.change_channel_status(ChannelStatus::CustomerInitClose)?;
        }
        self.pending = None;
        self.protocol_status = ProtocolStatus::Closing;
        info!(customer = %self.name, txid = %hex::encode(signed.txid_be), from_escrow, "cust-close signed");
        Ok(signed)
    }

    /// Signs a mutual close paying out `cust_bal` / `merch_bal` from the escrow.
    /// The merchant is paid its full balance of the current state and the fee
    /// comes out of the customer's side. The request carries the current
    /// state and its pay token so the merchant can check the split.
    pub fn sign_mutual_close_tx(
        &mut self,
        channel_state: &ChannelMPCState,
        channel_token: &ChannelMPCToken,
        cust_bal: i64,
        merch_bal: i64,
    ) -> ZkResult<MutualCloseRequest> {
        if self.channel_status != ChannelStatus::Open || self.pending.is_some() {
            return Err(ZkChannelError::InvalidStatus {
                op: "sign_mutual_close_tx",
                status: self.channel_status.to_string(),
            });
        }
        let pay_token = self.pay_token.ok_or_else(|| ZkChannelError::InvalidStatus {
            op: "sign_mutual_close_tx",
            status: "no pay token for the current state".to_string(),
        })?;
        let s = self.get_current_state()?;
        if merch_bal != s.bm || cust_bal > s.bc {
            return Err(ZkChannelError::Validation(
                "mutual close split does not match the current state".to_string(),
            ));
        }
        let escrow_amount = s
            .bc
            .checked_add(s.bm)
            .ok_or_else(|| ZkChannelError::Validation("amount overflow".to_string()))?;
        let (sighash, _) = form_mutual_close_transaction(
            &channel_token.escrow_txid.0,
            escrow_amount,
            &self.pk_c,
            &channel_token.pk_m,
            &self.payout_pk,
            &channel_state.get_merch_payout_pk()?,
            cust_bal,
            merch_bal,
        )?;
        let cust_sig = sign_sighash(&sighash, &secret_key("cust_sk", &self.sk_c)?)?;
        self.change_channel_status(ChannelStatus::PendingClose)?;
        self.protocol_status = ProtocolStatus::Closing;
        Ok(MutualCloseRequest {
            state: s,
            pay_token,
            cust_bal,
            merch_bal,
            cust_sig,
        })
    }

    /// Sweeps the to_customer output of a confirmed cust-close after the delay.
    pub fn sign_claim_tx(
        &self,
        channel_state: &ChannelMPCState,
        close_txid_le: &[u8; 32],
        input_amount: i64,
        claim_amount: i64,
        output_pk: &PublicKey,
    ) -> ZkResult<SignedTransaction> {
        let s = self.get_current_state()?;
        customer_sign_claim_transaction(
            close_txid_le,
            0,
            input_amount,
            claim_amount,
            channel_state.self_delay,
            output_pk,
            &s.rev_lock.0,
            &channel_state.get_merch_dispute_pk()?,
            &secret_key("pay_sk", &self.payout_sk)?,
        )
    }

    pub fn confirm_close(&mut self) -> ZkResult<()> {
        self.change_channel_status(ChannelStatus::ConfirmedClose)?;
        self.protocol_status = ProtocolStatus::Closed;
        Ok(())
    }
}

/// A customer-signed mutual close together with the state it pays out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutualCloseRequest {
    pub state: State,
    pub pay_token: FixedSizeArray32,
    pub cust_bal: i64,
    pub merch_bal: i64,
    pub cust_sig: Vec<u8>,
}

/// What the merchant keeps to broadcast merch-close later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MerchCloseTx {
    pub cust_pk: PublicKey,
    pub bc: i64,
    pub bm: i64,
    pub fee_mc: i64,
    pub cust_sig: String,
    pub self_delay: u16,
    pub val_cpfp: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MerchantMPCState {
    id: String,
    pub pk_m: PublicKey,
    sk_m: FixedSizeArray32,
    hmac_key: FixedSizeArray64,
    hmac_key_r: FixedSizeArray16,
    payout_sk: FixedSizeArray32,
    pub payout_pk: PublicKey,
    dispute_sk: FixedSizeArray32,
    pub dispute_pk: PublicKey,
    // keyed by hex of the big-endian escrow txid
    pub close_tx: HashMap<String, MerchCloseTx>,
    pub db_url: String,
}

fn check_channel_status(db: &mut dyn StateDatabase, escrow_txid: &String, op: &'static str, expected: ChannelStatus) -> ZkResult<()> {
    let status = db.get_channel_status(escrow_txid)?;
    if status != expected {
        return Err(ZkChannelError::InvalidStatus {
            op,
            status: status.to_string(),
        });
    }
    Ok(())
}

impl MerchantMPCState {
    pub fn new<R: Rng>(csprng: &mut R, db_url: String, channel: &mut ChannelMPCState, id: String) -> Self {
        let (pk_m, sk_m) = generate_keypair(csprng);

        let mut hmac_key_buf = [0u8; 64];
        csprng.fill_bytes(&mut hmac_key_buf);
        let key_com_r = random_bytes_16(csprng);
        channel.set_key_com(compute_commitment(&hmac_key_buf, &key_com_r));

        let (payout_pk, payout_sk) = generate_keypair(csprng);
        let (dispute_pk, dispute_sk) = generate_keypair(csprng);
        channel.set_merchant_public_keys(payout_pk, dispute_pk);

        MerchantMPCState {
            id,
            pk_m,
            sk_m: FixedSizeArray32(sk_m.secret_bytes()),
            hmac_key: FixedSizeArray64::new(hmac_key_buf),
            hmac_key_r: FixedSizeArray16(key_com_r),
            payout_sk: FixedSizeArray32(payout_sk.secret_bytes()),
            payout_pk,
            dispute_sk: FixedSizeArray32(dispute_sk.secret_bytes()),
            dispute_pk,
            close_tx: HashMap::new(),
            db_url,
        }
    }

    pub fn load_external_wallet(
        &mut self,
        channel: &mut ChannelMPCState,
        merch_sk: [u8; 32],
        pay_sk: [u8; 32],
        disp_sk: [u8; 32],
    ) -> ZkResult<()> {
        let (pk_m, _) = public_key_from_bytes("merch_sk", &merch_sk)?;
        let (payout_pk, _) = public_key_from_bytes("pay_sk", &pay_sk)?;
        let (dispute_pk, _) = public_key_from_bytes("disp_sk", &disp_sk)?;

        channel.set_merchant_public_keys(payout_pk, dispute_pk);
        self.sk_m = FixedSizeArray32(merch_sk);
        self.pk_m = pk_m;
        self.payout_sk = FixedSizeArray32(pay_sk);
        self.payout_pk = payout_pk;
        self.dispute_sk = FixedSizeArray32(disp_sk);
        self.dispute_pk = dispute_pk;
        Ok(())
    }

    pub fn get_id(&self) -> &str {
        &self.id
    }

    pub fn get_secret_key(&self) -> [u8; 32] {
        self.sk_m.0
    }

    pub fn get_close_secret_key(&self) -> [u8; 32] {
        self.payout_sk.0
    }

    pub fn get_dispute_secret_key(&self) -> [u8; 32] {
        self.dispute_sk.0
    }

    /// Rebuilds s0 from the customer's initial state and the token txids and
    /// records it for activation.
    pub fn validate_channel_params(
        &mut self,
        db: &mut dyn StateDatabase,
        channel_token: &ChannelMPCToken,
        init_state: &InitCustState,
        init_state_hash: [u8; 32],
    ) -> ZkResult<bool> {
        let channel_id = hex::encode(channel_token.compute_channel_id()?);
        let pk_c = channel_token
            .pk_c
            .ok_or_else(|| ZkChannelError::Validation("cannot validate channel token: pk_c not set".to_string()))?;
        ensure_valid!(pk_c == init_state.pk_c, "init state pk_c does not match channel token pk_c");
        ensure_valid!(channel_token.pk_m == self.pk_m, "channel token pk_m does not match merch state pk_m");
        ensure_valid!(
            init_state.min_fee <= init_state.max_fee,
            "init state fee range is empty"
        );

        let escrow_txid_be = reverse_bytes(&channel_token.escrow_txid.0);
        let merch_txid_be = reverse_bytes(&channel_token.merch_txid.0);
        let s0 = State {
            bc: init_state.cust_bal,
            bm: init_state.merch_bal,
            nonce: init_state.nonce,
            rev_lock: init_state.rev_lock,
            escrow_txid: FixedSizeArray32(escrow_txid_be),
            escrow_prevout: FixedSizeArray32(compute_prevout(&escrow_txid_be, 0)),
            merch_txid: FixedSizeArray32(merch_txid_be),
            merch_prevout: FixedSizeArray32(compute_prevout(&merch_txid_be, 0)),
            min_fee: init_state.min_fee,
            max_fee: init_state.max_fee,
            fee_mc: init_state.fee_mc,
        };
        if init_state_hash != s0.compute_hash() {
            debug!(state = %s0, "rebuilt initial state");
            return Err(ZkChannelError::Validation("initial state not well-formed".to_string()));
        }

        db.store_activation_state(&channel_id, &s0)?;
        db.update_unlink_set(&hex::encode(s0.get_nonce()))?;
        Ok(true)
    }

    /// Checks the customer's merch-close signature and keeps the transaction
    /// for a later force close. Marks the channel PendingOpen.
    pub fn verify_merch_close_tx(
        &mut self,
        db: &mut dyn StateDatabase,
        channel_state: &ChannelMPCState,
        escrow_txid_le: &[u8; 32],
        cust_pk: &PublicKey,
        cust_bal: i64,
        merch_bal: i64,
        fee_mc: i64,
        cust_sig: &[u8],
    ) -> ZkResult<([u8; 32], [u8; 32])> {
        ensure_valid!(cust_bal > 0 && merch_bal >= 0, "invalid initial balances");
        let (sighash, tx) = form_merch_close_transaction(
            escrow_txid_le,
            cust_pk,
            &self.pk_m,
            &self.payout_pk,
            cust_bal,
            merch_bal,
            fee_mc,
            channel_state.get_val_cpfp(),
            channel_state.self_delay,
        )?;
        let sig = decode_signature(cust_sig)?;
        verify_sighash_signature(&sighash, &sig, cust_pk)?;

        let escrow_txid = hex::encode(reverse_bytes(escrow_txid_le));
        db.transition_channel_status(&escrow_txid, ChannelStatus::PendingOpen)?;
        self.close_tx.insert(
            escrow_txid,
            MerchCloseTx {
                cust_pk: *cust_pk,
                bc: cust_bal,
                bm: merch_bal,
                fee_mc,
                cust_sig: hex::encode(cust_sig),
                self_delay: channel_state.self_delay,
                val_cpfp: channel_state.get_val_cpfp(),
            },
        );
        let merch_txid_be = tx.txid_be();
        Ok((merch_txid_be, compute_prevout(&merch_txid_be, 0)))
    }

    /// Signs both initial cust-close transactions for s0. Signatures are
    /// DER-encoded with the sighash byte appended.
    pub fn sign_initial_closing_transaction(
        &self,
        channel_state: &ChannelMPCState,
        funding_tx: &FundingTxInfo,
        rev_lock: [u8; 32],
        cust_pk: PublicKey,
        cust_close_pk: PublicKey,
        fee_cc: i64,
    ) -> ZkResult<(Vec<u8>, Vec<u8>)> {
        ensure_valid!(
            fee_cc >= funding_tx.min_fee && fee_cc <= funding_tx.max_fee,
            "fee_cc outside of the agreed fee range"
        );
        let s0 = State {
            nonce: FixedSizeArray16::default(),
            rev_lock: FixedSizeArray32(rev_lock),
            bc: funding_tx.init_cust_bal,
            bm: funding_tx.init_merch_bal,
            escrow_txid: funding_tx.escrow_txid,
            escrow_prevout: funding_tx.escrow_prevout,
            merch_txid: funding_tx.merch_txid,
            merch_prevout: funding_tx.merch_prevout,
            min_fee: funding_tx.min_fee,
            max_fee: funding_tx.max_fee,
            fee_mc: funding_tx.fee_mc,
        };
        let pubkeys = ClosePublicKeys {
            cust_pk,
            cust_close_pk,
            merch_pk: self.pk_m,
            merch_close_pk: self.payout_pk,
            merch_disp_pk: self.dispute_pk,
            rev_lock: FixedSizeArray32(rev_lock),
        };
        let txs = cust_close_transactions_for_state(
            &s0,
            &pubkeys,
            channel_state.self_delay,
            fee_cc,
            channel_state.get_val_cpfp(),
        )?;
        let sk_m = secret_key("merch_sk", &self.sk_m)?;
        let escrow_sig = sign_sighash(&txs.escrow_sighash, &sk_m)?;
        let merch_sig = sign_sighash(&txs.merch_sighash, &sk_m)?;
        Ok((escrow_sig, merch_sig))
    }

    pub fn activate_channel(
        &self,
        db: &mut dyn StateDatabase,
        channel_token: &ChannelMPCToken,
        s0: &State,
    ) -> ZkResult<[u8; 32]> {
        let escrow_txid = hex::encode(channel_token.escrow_txid_be());
        check_channel_status(db, &escrow_txid, "activate_channel", ChannelStatus::Open)?;

        let channel_id = hex::encode(channel_token.compute_channel_id()?);
        let init_state = db.get_activation_state(&channel_id)?.ok_or_else(|| {
            ZkChannelError::NotFound("could not find initial state given channel token".to_string())
        })?;
        ensure_valid!(
            s0.compute_hash() == init_state.compute_hash(),
            "initial state on activation does not match stored state"
        );

        hmac_sign(&self.hmac_key.get_bytes(), &s0.serialize_compact())
    }

    ///
    /// generate_pay_mask_commitment() - opens a payment session and commits to a fresh pay token mask.
    /// output: commitment to the mask
    ///
    pub fn generate_pay_mask_commitment<R: Rng>(
        &self,
        csprng: &mut R,
        db: &mut dyn StateDatabase,
        session_id: [u8; 16],
        nonce: [u8; NONCE_LEN],
        rev_lock_com: [u8; 32],
        amount: i64,
        justification: Option<String>,
    ) -> ZkResult<[u8; 32]> {
        let nonce_hex = hex::encode(nonce);
        let session_hex = hex::encode(session_id);

        // unlink is only defined for a nonce from activation
        if amount == 0 && !db.is_member_unlink_set(&nonce_hex)? {
            return Err(ZkChannelError::Validation(
                "can only run unlink with previously known nonce".to_string(),
            ));
        }
        if amount < 0 && justification.as_deref().map_or(true, |j| j.trim().is_empty()) {
            return Err(ZkChannelError::Validation(
                "negative payment requires a justification".to_string(),
            ));
        }
        if db.check_spent_map(&nonce_hex)? {
            return Err(ZkChannelError::Validation(format!("nonce {} has been spent already", nonce_hex)));
        }
        if let Some(other) = db.get_session_for_nonce(&nonce_hex)? {
            if other != session_hex {
                // a round that never reached the MPC (or failed it) may be replaced
                let replaceable = !db.check_session_id(&other)? || {
                    let status = db.load_session_state(&other)?.status;
                    status == PaymentStatus::Prepare || status == PaymentStatus::Error
                };
                if !replaceable {
                    return Err(ZkChannelError::PaymentInProgress);
                }
                debug!(nonce = %nonce_hex, old_session = %other, "replacing an unfinished round");
                db.clear_masked_mpc_inputs(&other)?;
                db.clear_session_state(&other)?;
                db.unbind_nonce(&nonce_hex)?;
            }
        }

        let session = SessionState {
            nonce: FixedSizeArray16(nonce),
            rev_lock_com: FixedSizeArray32(rev_lock_com),
            amount,
            status: PaymentStatus::Prepare,
        };
        if !db.save_new_session_state(&session_hex, &session)? {
            return Err(ZkChannelError::Validation(format!("session {} already exists", session_hex)));
        }
        db.bind_nonce_to_session(&nonce_hex, &session_hex)?;

        let pay_mask = random_bytes_32(csprng);
        let pay_mask_r = random_bytes_16(csprng);
        db.update_nonce_mask_map(&nonce_hex, pay_mask, pay_mask_r)?;
        if let Some(j) = justification {
            info!(session = %session_hex, amount, justification = %j, "refund requested");
        }
        Ok(compute_commitment(&pay_mask, &pay_mask_r))
    }

    /// Loads the session and assembles the merchant's private MPC inputs with
    /// fresh signature masks.
    pub fn prepare_mpc_inputs<R: Rng>(
        &self,
        csprng: &mut R,
        db: &mut dyn StateDatabase,
        channel_state: &ChannelMPCState,
        session_id: [u8; 16],
    ) -> ZkResult<MerchantMpcInput> {
        let session_hex = hex::encode(session_id);
        let session = db.load_session_state(&session_hex)?;
        if session.status != PaymentStatus::Prepare {
            return Err(ZkChannelError::InvalidStatus {
                op: "prepare_mpc_inputs",
                status: session.status.to_string(),
            });
        }
        let nonce_hex = hex::encode(session.nonce.0);
        if db.check_spent_map(&nonce_hex)? {
            return Err(ZkChannelError::Validation(format!("nonce {} has been spent already", nonce_hex)));
        }
        let (pay_mask, pay_mask_r) = db.get_mask_map_from_nonce(&nonce_hex)?;

        Ok(MerchantMpcInput {
            nonce: session.nonce,
            rev_lock_com: session.rev_lock_com,
            pay_token_mask_com: FixedSizeArray32(compute_commitment(&pay_mask, &pay_mask_r)),
            amount: session.amount,
            key_com: FixedSizeArray32(channel_state.get_key_com()),
            hmac_key: self.hmac_key,
            key_com_r: self.hmac_key_r,
            pay_mask: FixedSizeArray32(pay_mask),
            pay_mask_r: FixedSizeArray16(pay_mask_r),
            escrow_mask: FixedSizeArray32(random_bytes_32(csprng)),
            merch_mask: FixedSizeArray32(random_bytes_32(csprng)),
            merch_sk: self.sk_m,
            merch_close_pk: self.payout_pk,
            merch_disp_pk: self.dispute_pk,
            val_cpfp: channel_state.get_val_cpfp(),
            bal_min_cust: channel_state.get_bal_min_cust(),
            bal_min_merch: channel_state.get_bal_min_merch(),
            self_delay: channel_state.self_delay,
        })
    }

    /// Records the outcome of the MPC for `session_id`. On failure the session
    /// is marked as errored and the error is returned.
    pub fn finish_mpc(
        &self,
        db: &mut dyn StateDatabase,
        session_id: [u8; 16],
        input: &MerchantMpcInput,
        result: ZkResult<MaskedResult>,
    ) -> ZkResult<()> {
        let session_hex = hex::encode(session_id);
        let mut session = db.load_session_state(&session_hex)?;
        let out = match result {
            Ok(MaskedResult::Merchant(out)) => out,
            Ok(MaskedResult::Customer(_)) => {
                session.status = PaymentStatus::Error;
                db.update_session_state(&session_hex, &session)?;
                return Err(ZkChannelError::MpcFailure("received the customer's outputs".to_string()));
            }
            Err(e) => {
                warn!(session = %session_hex, error = %e, "mpc failed");
                session.status = PaymentStatus::Error;
                db.update_session_state(&session_hex, &session)?;
                return Err(e);
            }
        };

        let mask_bytes = MaskedMPCInputs {
            pt_mask: input.pay_mask,
            pt_mask_r: input.pay_mask_r,
            escrow_mask: input.escrow_mask,
            merch_mask: input.merch_mask,
            r_escrow_sig: out.r_escrow_sig,
            r_merch_sig: out.r_merch_sig,
        };
        db.update_masked_mpc_inputs(&session_hex, &mask_bytes)?;
        session.status = PaymentStatus::Update;
        db.update_session_state(&session_hex, &session)?;
        Ok(())
    }

    pub fn execute_mpc_context<R: Rng>(
        &self,
        csprng: &mut R,
        db: &mut dyn StateDatabase,
        channel_state: &ChannelMPCState,
        session_id: [u8; 16],
        coordinator: &dyn MpcCoordinator,
        timeout: Duration,
    ) -> ZkResult<()> {
        let input = self.prepare_mpc_inputs(csprng, db, channel_state, session_id)?;
        let result = coordinator.execute(&session_id, PartyInputs::Merchant(Box::new(input.clone())), timeout);
        self.finish_mpc(db, session_id, &input, result)
    }

    /// Signature masks for a session whose MPC succeeded.
    pub fn get_masked_tx_inputs(&self, db: &mut dyn StateDatabase, session_id: [u8; 16]) -> ZkResult<MaskedTxMPCInputs> {
        let session_hex = hex::encode(session_id);
        let session = db.load_session_state(&session_hex)?;
        if session.status != PaymentStatus::Update {
            return Err(ZkChannelError::InvalidStatus {
                op: "pay_confirm_mpc_result",
                status: session.status.to_string(),
            });
        }
        Ok(db.get_masked_mpc_inputs(&session_hex)?.get_tx_masks())
    }

    ///
    /// verify_revoked_state() - checks the customer's revocation of the old state.
    /// output: pay token mask and its commitment randomness
    ///
    pub fn verify_revoked_state(
        &self,
        db: &mut dyn StateDatabase,
        session_id: [u8; 16],
        rev_state: &RevokedState,
    ) -> ZkResult<([u8; 32], [u8; 16])> {
        let session_hex = hex::encode(session_id);
        let session = db.load_session_state(&session_hex)?;
        if session.status != PaymentStatus::Update {
            return Err(ZkChannelError::InvalidStatus {
                op: "verify_revoked_state",
                status: session.status.to_string(),
            });
        }
        ensure_valid!(rev_state.nonce == session.nonce, "revoked state nonce does not match the session");
        ensure_valid!(
            rev_state.rev_lock_com == session.rev_lock_com
                && compute_commitment(&rev_state.rev_lock.0, &rev_state.t.0) == session.rev_lock_com.0,
            "rev_lock_com commitment did not open to specified rev_lock"
        );
        ensure_valid!(
            is_valid_rev_secret(&rev_state.rev_lock.0, &rev_state.rev_secret.0),
            "rev_secret does not open rev_lock"
        );

        let rev_lock_hex = hex::encode(rev_state.rev_lock.0);
        if db.check_rev_lock_map(&rev_lock_hex)? {
            return Err(ZkChannelError::Validation(
                "attempting to revoke with a rev_lock that is already revoked".to_string(),
            ));
        }
        let masks = db.get_masked_mpc_inputs(&session_hex)?;

        // rev-lock entry first, then the spent nonce
        db.update_rev_lock_map(&rev_lock_hex, &hex::encode(rev_state.rev_secret.0))?;
        let nonce_hex = hex::encode(session.nonce.0);
        if !db.update_spent_map(&nonce_hex, &rev_lock_hex)? {
            return Err(ZkChannelError::Validation(format!("nonce {} has been spent already", nonce_hex)));
        }
        if db.is_member_unlink_set(&nonce_hex)? {
            db.remove_from_unlink_set(&nonce_hex)?;
        }
        db.unbind_nonce(&nonce_hex)?;
        db.remove_nonce_mask(&nonce_hex)?;
        db.clear_masked_mpc_inputs(&session_hex)?;
        db.clear_session_state(&session_hex)?;
        info!(session = %session_hex, amount = session.amount, "payment accepted");
        Ok((masks.pt_mask.0, masks.pt_mask_r.0))
    }

    /// Signed merch-close for a funded channel.
    pub fn get_closing_tx(&self, escrow_txid_le: &[u8; 32]) -> ZkResult<SignedTransaction> {
        let escrow_txid = hex::encode(reverse_bytes(escrow_txid_le));
        let record = self
            .close_tx
            .get(&escrow_txid)
            .ok_or_else(|| ZkChannelError::NotFound(format!("no merch-close tx for escrow {}", escrow_txid)))?;
        let (_, tx) = form_merch_close_transaction(
            escrow_txid_le,
            &record.cust_pk,
            &self.pk_m,
            &self.payout_pk,
            record.bc,
            record.bm,
            record.fee_mc,
            record.val_cpfp,
            record.self_delay,
        )?;
        let cust_sig = hex::decode(&record.cust_sig)?;
        merchant_sign_merch_close_transaction(tx, &record.cust_pk, &cust_sig, &secret_key("merch_sk", &self.sk_m)?)
    }

    pub fn check_rev_lock(&self, db: &mut dyn StateDatabase, rev_lock: &[u8; 32]) -> ZkResult<Option<[u8; 32]>> {
        match db.get_rev_secret(&hex::encode(rev_lock))? {
            Some(secret) => Ok(Some(crate::database::decode_rev_secret(&secret)?)),
            None => Ok(None),
        }
    }

    /// Spends the to_customer output of a revoked cust-close.
    pub fn sign_dispute_tx(
        &self,
        channel_state: &ChannelMPCState,
        close_txid_le: &[u8; 32],
        input_amount: i64,
        claim_amount: i64,
        output_pk: &PublicKey,
        rev_lock: &[u8; 32],
        rev_secret: &[u8; 32],
        cust_close_pk: &PublicKey,
    ) -> ZkResult<SignedTransaction> {
        merchant_sign_dispute_transaction(
            close_txid_le,
            0,
            input_amount,
            claim_amount,
            channel_state.self_delay,
            output_pk,
            rev_lock,
            rev_secret,
            cust_close_pk,
            &secret_key("disp_sk", &self.dispute_sk)?,
        )
    }

    /// Sweeps the merchant's output of a cust-close transaction.
    pub fn sign_cust_claim_tx(
        &self,
        close_txid_le: &[u8; 32],
        input_amount: i64,
        claim_amount: i64,
        output_pk: &PublicKey,
    ) -> ZkResult<SignedTransaction> {
        merchant_sign_cust_claim_transaction(
            close_txid_le,
            1,
            input_amount,
            claim_amount,
            output_pk,
            &secret_key("pay_sk", &self.payout_sk)?,
        )
    }

    /// Sweeps merch-close after the delay if the customer never responded.
    pub fn sign_merch_claim_tx(
        &self,
        channel_state: &ChannelMPCState,
        escrow_txid_le: &[u8; 32],
        merch_close_txid_le: &[u8; 32],
        input_amount: i64,
        claim_amount: i64,
        output_pk: &PublicKey,
    ) -> ZkResult<SignedTransaction> {
        let escrow_txid = hex::encode(reverse_bytes(escrow_txid_le));
        let record = self
            .close_tx
            .get(&escrow_txid)
            .ok_or_else(|| ZkChannelError::NotFound(format!("no merch-close tx for escrow {}", escrow_txid)))?;
        merchant_sign_merch_claim_transaction(
            merch_close_txid_le,
            0,
            input_amount,
            claim_amount,
            channel_state.self_delay,
            &record.cust_pk,
            &self.pk_m,
            output_pk,
            &secret_key("pay_sk", &self.payout_sk)?,
        )
    }

    /// Completes a mutual close signed by the customer. The split must come
    /// from `state`, certified by its pay token and not yet revoked: the
    /// merchant receives exactly `state.bm` and the fee is taken from the
    /// customer's side.
    pub fn sign_mutual_close_tx(
        &self,
        db: &mut dyn StateDatabase,
        escrow_txid_le: &[u8; 32],
        state: &State,
        pay_token: &[u8; 32],
        cust_close_pk: &PublicKey,
        cust_bal: i64,
        merch_bal: i64,
        cust_sig: &[u8],
    ) -> ZkResult<SignedTransaction> {
        let escrow_txid = hex::encode(reverse_bytes(escrow_txid_le));
        check_channel_status(db, &escrow_txid, "sign_mutual_close_tx", ChannelStatus::Open)?;
        let record = self
            .close_tx
            .get(&escrow_txid)
            .ok_or_else(|| ZkChannelError::NotFound(format!("no channel for escrow {}", escrow_txid)))?;

        if !hmac_verify(&self.hmac_key.get_bytes(), &state.serialize_compact(), pay_token) {
            return Err(ZkChannelError::InvalidSignature(
                "pay token does not certify the closing state".to_string(),
            ));
        }
        ensure_valid!(state.escrow_txid.0 == reverse_bytes(escrow_txid_le), "state belongs to another channel");
        if db.check_spent_map(&hex::encode(state.get_nonce()))? {
            return Err(ZkChannelError::Validation("closing state has been revoked".to_string()));
        }
        let escrow_amount = record
            .bc
            .checked_add(record.bm)
            .ok_or_else(|| ZkChannelError::Validation("amount overflow".to_string()))?;
        ensure_valid!(
            state.bc.checked_add(state.bm) == Some(escrow_amount),
            "closing state does not conserve the escrow amount"
        );
        ensure_valid!(
            merch_bal == state.bm && cust_bal <= state.bc,
            "mutual close split {}/{} does not match the state {}/{}",
            cust_bal,
            merch_bal,
            state.bc,
            state.bm
        );

        let (sighash, tx) = form_mutual_close_transaction(
            escrow_txid_le,
            escrow_amount,
            &record.cust_pk,
            &self.pk_m,
            cust_close_pk,
            &self.payout_pk,
            cust_bal,
            merch_bal,
        )?;
        let sig = decode_signature(cust_sig)?;
        verify_sighash_signature(&sighash, &sig, &record.cust_pk)?;
        let merch_sig = sign_sighash(&sighash, &secret_key("merch_sk", &self.sk_m)?)?;
        let signed = complete_escrow_spend(tx, merch_sig, cust_sig.to_vec());
        db.transition_channel_status(&escrow_txid, ChannelStatus::PendingClose)?;
        info!(escrow = %escrow_txid, cust_bal, merch_bal, "mutual close signed");
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::HashMapDatabase;
    use crate::mpc_session::{ideal_functionality, LocalMpcCoordinator};
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    const FEE_CC: i64 = 1000;
    const FEE_MC: i64 = 1000;

    fn generate_test_txs<R: Rng>(csprng: &mut R, b0_cust: i64, b0_merch: i64, fee_mc: i64) -> FundingTxInfo {
        let escrow_txid = random_bytes_32(csprng);
        let merch_txid = random_bytes_32(csprng);
        FundingTxInfo {
            init_cust_bal: b0_cust,
            init_merch_bal: b0_merch,
            escrow_txid: FixedSizeArray32(escrow_txid),
            escrow_prevout: FixedSizeArray32(compute_prevout(&escrow_txid, 0)),
            merch_txid: FixedSizeArray32(merch_txid),
            merch_prevout: FixedSizeArray32(compute_prevout(&merch_txid, 0)),
            fee_mc,
            min_fee: 0,
            max_fee: 10000,
        }
    }

    struct Fixture {
        rng: XorShiftRng,
        db: HashMapDatabase,
        channel_state: ChannelMPCState,
        channel_token: ChannelMPCToken,
        merch_state: MerchantMPCState,
        cust_state: CustomerMPCState,
    }

    /// Channel established and activated on both sides.
    fn open_channel(b0_cust: i64, b0_merch: i64) -> Fixture {
        let mut rng = XorShiftRng::seed_from_u64(0x5dbe62598d313d86);
        let mut db = HashMapDatabase::default();
        let mut channel_state = ChannelMPCState::new(String::from("Channel A <-> B"), 1487, 546, 546, 1000, false);
        let mut merch_state = MerchantMPCState::new(&mut rng, String::new(), &mut channel_state, String::from("Merchant B"));
        let mut cust_state = CustomerMPCState::new(&mut rng, b0_cust, b0_merch, FEE_CC, String::from("Customer"));

        let mut channel_token = cust_state
            .generate_init_state(&mut rng, &merch_state.pk_m, 0, 10000, FEE_MC)
            .unwrap();
        let mut funding_tx = generate_test_txs(&mut rng, b0_cust, b0_merch, FEE_MC);

        // merch-close is bound to the escrow txid
        let escrow_txid_le = reverse_bytes(&funding_tx.escrow_txid.0);
        channel_token.escrow_txid = FixedSizeArray32(escrow_txid_le);
        let (cust_sig, merch_txid_be, merch_prevout) = cust_state
            .sign_merch_close_tx(&channel_state, &channel_token, &escrow_txid_le)
            .unwrap();
        funding_tx.merch_txid = FixedSizeArray32(merch_txid_be);
        funding_tx.merch_prevout = FixedSizeArray32(merch_prevout);
        let (m_txid, m_prevout) = merch_state
            .verify_merch_close_tx(&mut db, &channel_state, &escrow_txid_le, &cust_state.pk_c, b0_cust, b0_merch, FEE_MC, &cust_sig)
            .unwrap();
        assert_eq!(m_txid, merch_txid_be);
        assert_eq!(m_prevout, merch_prevout);

        cust_state.set_funding_tx_info(&mut channel_token, &funding_tx).unwrap();
        let init_state = cust_state.get_initial_cust_state().unwrap();
        let init_hash = cust_state.get_current_state().unwrap().compute_hash();
        assert!(merch_state
            .validate_channel_params(&mut db, &channel_token, &init_state, init_hash)
            .unwrap());

        let (rev_lock, _) = cust_state.get_rev_pair();
        let (escrow_sig, merch_sig) = merch_state
            .sign_initial_closing_transaction(&channel_state, &funding_tx, rev_lock, cust_state.pk_c, cust_state.payout_pk, FEE_CC)
            .unwrap();
        cust_state
            .sign_initial_closing_transaction(&channel_state, &channel_token, &escrow_sig, &merch_sig)
            .unwrap();
        assert_eq!(cust_state.protocol_status, ProtocolStatus::Initialized);

        let escrow_txid = hex::encode(funding_tx.escrow_txid.0);
        db.transition_channel_status(&escrow_txid, ChannelStatus::Open).unwrap();
        cust_state.change_channel_status(ChannelStatus::Open).unwrap();

        let s0 = cust_state.get_current_state().unwrap();
        let pay_token = merch_state.activate_channel(&mut db, &channel_token, &s0).unwrap();
        cust_state.store_initial_pay_token(pay_token).unwrap();
        assert_eq!(cust_state.protocol_status, ProtocolStatus::Activated);

        Fixture {
            rng,
            db,
            channel_state,
            channel_token,
            merch_state,
            cust_state,
        }
    }

    /// Runs one payment end to end through the ideal functionality.
    fn pay(f: &mut Fixture, amount: i64, justification: Option<String>) -> ZkResult<()> {
        let (new_state, revoked, session_id) = f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, amount)?;
        let pay_mask_com = f.merch_state.generate_pay_mask_commitment(
            &mut f.rng,
            &mut f.db,
            session_id,
            revoked.get_nonce(),
            revoked.get_rev_lock_com(),
            amount,
            justification,
        )?;
        let cust_input = f.cust_state.build_mpc_input(&f.channel_state, &f.channel_token, pay_mask_com)?;
        assert_eq!(cust_input.new_state, new_state);
        let merch_input = f.merch_state.prepare_mpc_inputs(&mut f.rng, &mut f.db, &f.channel_state, session_id)?;
        let (cust_out, merch_out) = ideal_functionality(&cust_input, &merch_input)?;
        f.merch_state
            .finish_mpc(&mut f.db, session_id, &merch_input, Ok(MaskedResult::Merchant(merch_out)))?;
        f.cust_state.store_mpc_result(cust_out)?;

        let masks = f.merch_state.get_masked_tx_inputs(&mut f.db, session_id)?;
        f.cust_state
            .unmask_and_verify_transactions(&f.channel_state, &f.channel_token, &masks)?;
        let rev_state = f.cust_state.get_revoked_state()?;
        let (pt_mask, pt_mask_r) = f.merch_state.verify_revoked_state(&mut f.db, session_id, &rev_state)?;
        f.cust_state.unmask_and_verify_pay_token(pt_mask, pt_mask_r)
    }

    rusty_fork_test! {
    #[test]
    fn mpc_channel_util_customer_works() {
        let mut f = open_channel(1000000, 1000000);
        let s0 = f.cust_state.get_current_state().unwrap();
        let (old_lock, old_secret) = f.cust_state.get_rev_pair();

        // unlink
        pay(&mut f, 0, None).unwrap();
        assert_eq!(f.cust_state.protocol_status, ProtocolStatus::Ready);
        assert!(!f.db.is_member_unlink_set(&hex::encode(s0.get_nonce())).unwrap());

        pay(&mut f, 10, None).unwrap();
        let s2 = f.cust_state.get_current_state().unwrap();
        assert_eq!(s2.bc, 1000000 - 10);
        assert_eq!(s2.bm, 1000000 + 10);
        assert_eq!(f.cust_state.get_payment_count(), 2);
        assert!(f.cust_state.has_tokens());

        // the initial state is revoked and its secret recorded
        let secret = f.merch_state.check_rev_lock(&mut f.db, &old_lock).unwrap();
        assert_eq!(secret, Some(old_secret));
        assert!(f.db.check_spent_map(&hex::encode(s0.get_nonce())).unwrap());
    }
    }

    #[test]
    fn refund_requires_justification() {
        let mut f = open_channel(1000000, 1000000);
        pay(&mut f, 0, None).unwrap();

        let (_, revoked, session_id) = f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, -10).unwrap();
        let err = f
            .merch_state
            .generate_pay_mask_commitment(&mut f.rng, &mut f.db, session_id, revoked.get_nonce(), revoked.get_rev_lock_com(), -10, None)
            .unwrap_err();
        assert!(err.to_string().contains("justification"));
        f.cust_state.abort_payment().unwrap();
        assert_eq!(f.cust_state.protocol_status, ProtocolStatus::Ready);

        pay(&mut f, -10, Some("returned goods".to_string())).unwrap();
        assert_eq!(f.cust_state.cust_balance, 1000000 + 10);
    }

    #[test]
    fn payment_rules_on_customer_side() {
        let mut f = open_channel(1000000, 1000000);

        // only unlink or a positive payment is allowed right after activation
        assert!(f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, -1).is_err());
        pay(&mut f, 0, None).unwrap();
        // a second unlink is not
        assert!(f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 0).is_err());

        // balance floor: bal_min_cust + fee_cc + val_cpfp
        let too_much = 1000000 - (546 + FEE_CC + 1000) + 1;
        match f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, too_much) {
            Err(ZkChannelError::InsufficientBalance(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }

        for extreme in [i64::MIN, i64::MAX].iter() {
            match f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, *extreme) {
                Err(ZkChannelError::Validation(_)) => (),
                other => panic!("unexpected: {:?}", other),
            }
        }

        f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 5).unwrap();
        match f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 5) {
            Err(ZkChannelError::PaymentInProgress) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn failed_mpc_keeps_old_state() {
        let mut f = open_channel(1000000, 1000000);
        pay(&mut f, 0, None).unwrap();
        let before = f.cust_state.get_current_state().unwrap();

        let coordinator = LocalMpcCoordinator::new();
        let (_, _, _) = f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 10).unwrap();
        let err = f
            .cust_state
            .execute_mpc_context(&f.channel_state, &f.channel_token, [0u8; 32], &coordinator, Duration::from_millis(50))
            .unwrap_err();
        match err {
            ZkChannelError::MpcTimeout(_) => (),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(f.cust_state.get_current_state().unwrap(), before);
        assert_eq!(f.cust_state.protocol_status, ProtocolStatus::Ready);
        assert!(!f.cust_state.payment_in_progress());
    }

    #[test]
    fn bad_signature_masks_abort_payment() {
        let mut f = open_channel(1000000, 1000000);
        pay(&mut f, 0, None).unwrap();
        let before = f.cust_state.get_current_state().unwrap();

        let (_, revoked, session_id) = f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 10).unwrap();
        let com = f
            .merch_state
            .generate_pay_mask_commitment(&mut f.rng, &mut f.db, session_id, revoked.get_nonce(), revoked.get_rev_lock_com(), 10, None)
            .unwrap();
        let cust_input = f.cust_state.build_mpc_input(&f.channel_state, &f.channel_token, com).unwrap();
        let merch_input = f.merch_state.prepare_mpc_inputs(&mut f.rng, &mut f.db, &f.channel_state, session_id).unwrap();
        let (cust_out, merch_out) = ideal_functionality(&cust_input, &merch_input).unwrap();
        f.cust_state.store_mpc_result(cust_out).unwrap();

        let mut masks = MaskedTxMPCInputs {
            escrow_mask: merch_input.escrow_mask,
            merch_mask: merch_input.merch_mask,
            r_escrow_sig: merch_out.r_escrow_sig,
            r_merch_sig: merch_out.r_merch_sig,
        };
        masks.escrow_mask.0[0] ^= 0x01;
        assert!(f
            .cust_state
            .unmask_and_verify_transactions(&f.channel_state, &f.channel_token, &masks)
            .is_err());
        assert_eq!(f.cust_state.get_current_state().unwrap(), before);
        assert_eq!(f.cust_state.protocol_status, ProtocolStatus::Ready);
    }

    #[test]
    fn bad_pay_mask_allows_only_close() {
        let mut f = open_channel(1000000, 1000000);
        pay(&mut f, 0, None).unwrap();

        let (_, revoked, session_id) = f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 10).unwrap();
        let com = f
            .merch_state
            .generate_pay_mask_commitment(&mut f.rng, &mut f.db, session_id, revoked.get_nonce(), revoked.get_rev_lock_com(), 10, None)
            .unwrap();
        let cust_input = f.cust_state.build_mpc_input(&f.channel_state, &f.channel_token, com).unwrap();
        let merch_input = f.merch_state.prepare_mpc_inputs(&mut f.rng, &mut f.db, &f.channel_state, session_id).unwrap();
        let (cust_out, merch_out) = ideal_functionality(&cust_input, &merch_input).unwrap();
        f.merch_state
            .finish_mpc(&mut f.db, session_id, &merch_input, Ok(MaskedResult::Merchant(merch_out)))
            .unwrap();
        f.cust_state.store_mpc_result(cust_out).unwrap();
        let masks = f.merch_state.get_masked_tx_inputs(&mut f.db, session_id).unwrap();
        f.cust_state
            .unmask_and_verify_transactions(&f.channel_state, &f.channel_token, &masks)
            .unwrap();
        let rev_state = f.cust_state.get_revoked_state().unwrap();
        let (mut pt_mask, pt_mask_r) = f.merch_state.verify_revoked_state(&mut f.db, session_id, &rev_state).unwrap();
        pt_mask[3] ^= 0xff;

        assert!(f.cust_state.unmask_and_verify_pay_token(pt_mask, pt_mask_r).is_err());
        assert!(!f.cust_state.has_tokens());
        assert_eq!(f.cust_state.get_current_state().unwrap().bc, 1000000 - 10);
        assert!(f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 1).is_err());

        let signed = f.cust_state.customer_close(&f.channel_state, &f.channel_token, true).unwrap();
        assert!(!signed.tx.is_empty());
        assert_eq!(f.cust_state.get_channel_status(), ChannelStatus::CustomerInitClose);
    }

    #[test]
    fn revoked_state_checks() {
        let mut f = open_channel(1000000, 1000000);
        pay(&mut f, 0, None).unwrap();

        let (_, revoked, session_id) = f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 10).unwrap();
        // revocation before the mpc ran is refused
        let com = f
            .merch_state
            .generate_pay_mask_commitment(&mut f.rng, &mut f.db, session_id, revoked.get_nonce(), revoked.get_rev_lock_com(), 10, None)
            .unwrap();
        assert!(f.merch_state.verify_revoked_state(&mut f.db, session_id, &revoked).is_err());

        let cust_input = f.cust_state.build_mpc_input(&f.channel_state, &f.channel_token, com).unwrap();
        let merch_input = f.merch_state.prepare_mpc_inputs(&mut f.rng, &mut f.db, &f.channel_state, session_id).unwrap();
        let (_, merch_out) = ideal_functionality(&cust_input, &merch_input).unwrap();
        f.merch_state
            .finish_mpc(&mut f.db, session_id, &merch_input, Ok(MaskedResult::Merchant(merch_out)))
            .unwrap();

        let mut bad = revoked.clone();
        bad.rev_secret.0[0] ^= 0x01;
        assert!(f.merch_state.verify_revoked_state(&mut f.db, session_id, &bad).is_err());
        assert!(!f.db.check_rev_lock_map(&hex::encode(bad.rev_lock.0)).unwrap());
        assert!(!f.db.check_spent_map(&hex::encode(bad.nonce.0)).unwrap());

        assert!(f.merch_state.verify_revoked_state(&mut f.db, session_id, &revoked).is_ok());
    }

    #[test]
    fn rev_secret_recorded_before_nonce_is_spent() {
        let mut f = open_channel(1000000, 1000000);
        pay(&mut f, 0, None).unwrap();

        let (_, revoked, session_id) = f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 10).unwrap();
        let com = f
            .merch_state
            .generate_pay_mask_commitment(&mut f.rng, &mut f.db, session_id, revoked.get_nonce(), revoked.get_rev_lock_com(), 10, None)
            .unwrap();
        let cust_input = f.cust_state.build_mpc_input(&f.channel_state, &f.channel_token, com).unwrap();
        let merch_input = f.merch_state.prepare_mpc_inputs(&mut f.rng, &mut f.db, &f.channel_state, session_id).unwrap();
        let (_, merch_out) = ideal_functionality(&cust_input, &merch_input).unwrap();
        f.merch_state
            .finish_mpc(&mut f.db, session_id, &merch_input, Ok(MaskedResult::Merchant(merch_out)))
            .unwrap();

        // the nonce gets spent by a competing revocation first
        let nonce_hex = hex::encode(revoked.get_nonce());
        assert!(f.db.update_spent_map(&nonce_hex, &hex::encode([0xeeu8; 32])).unwrap());
        assert!(f.merch_state.verify_revoked_state(&mut f.db, session_id, &revoked).is_err());

        // the old state can still be disputed
        let secret = f.merch_state.check_rev_lock(&mut f.db, &revoked.rev_lock.0).unwrap();
        assert_eq!(secret, Some(revoked.rev_secret.0));
    }

    #[test]
    fn merchant_close_and_claims() {
        let mut f = open_channel(1000000, 1000000);
        let escrow_txid_le = f.channel_token.escrow_txid.0;
        let signed = f.merch_state.get_closing_tx(&escrow_txid_le).unwrap();
        assert_eq!(signed.txid_be, f.cust_state.get_current_state().unwrap().merch_txid.0);

        let (out_pk, _) = generate_keypair(&mut f.rng);
        let claim = f
            .merch_state
            .sign_merch_claim_tx(&f.channel_state, &escrow_txid_le, &signed.txid_le, 2000000 - FEE_MC - 1000, 1990000, &out_pk)
            .unwrap();
        assert!(!claim.tx.is_empty());
    }

    #[test]
    fn mutual_close() {
        let mut f = open_channel(1000000, 1000000);
        let req = f
            .cust_state
            .sign_mutual_close_tx(&f.channel_state, &f.channel_token, 999000, 1000000)
            .unwrap();
        assert_eq!(f.cust_state.get_channel_status(), ChannelStatus::PendingClose);
        assert_eq!(req.state, f.cust_state.get_current_state().unwrap());
        let escrow_txid_le = f.channel_token.escrow_txid.0;
        let payout_pk = f.cust_state.payout_pk;
        // a different split does not verify
        assert!(f
            .merch_state
            .sign_mutual_close_tx(&mut f.db, &escrow_txid_le, &req.state, &req.pay_token.0, &payout_pk, 999001, 1000000, &req.cust_sig)
            .is_err());
        let signed = f
            .merch_state
            .sign_mutual_close_tx(&mut f.db, &escrow_txid_le, &req.state, &req.pay_token.0, &payout_pk, req.cust_bal, req.merch_bal, &req.cust_sig)
            .unwrap();
        assert!(!signed.tx.is_empty());
        let escrow_txid = hex::encode(reverse_bytes(&escrow_txid_le));
        assert_eq!(f.db.get_channel_status(&escrow_txid).unwrap(), ChannelStatus::PendingClose);
    }

    #[test]
    fn mutual_close_requires_certified_unrevoked_state() {
        let mut f = open_channel(1000000, 1000000);
        let s0 = f.cust_state.get_current_state().unwrap();
        let s0_token = f.cust_state.pay_token.unwrap();
        pay(&mut f, 0, None).unwrap();
        pay(&mut f, 10, None).unwrap();

        let escrow_txid_le = f.channel_token.escrow_txid.0;
        let escrow_txid = hex::encode(reverse_bytes(&escrow_txid_le));
        let payout_pk = f.cust_state.payout_pk;
        let req = f
            .cust_state
            .sign_mutual_close_tx(&f.channel_state, &f.channel_token, 1000000 - 10 - 1000, 1000000 + 10)
            .unwrap();

        // forged pay token
        let mut forged = req.pay_token;
        forged.0[0] ^= 0x01;
        match f.merch_state.sign_mutual_close_tx(
            &mut f.db, &escrow_txid_le, &req.state, &forged.0, &payout_pk, req.cust_bal, req.merch_bal, &req.cust_sig,
        ) {
            Err(ZkChannelError::InvalidSignature(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }

        // balances edited after the merchant certified the state
        let mut inflated = req.state.clone();
        inflated.bc += 10;
        inflated.bm -= 10;
        match f.merch_state.sign_mutual_close_tx(
            &mut f.db, &escrow_txid_le, &inflated, &req.pay_token.0, &payout_pk, req.cust_bal, req.merch_bal, &req.cust_sig,
        ) {
            Err(ZkChannelError::InvalidSignature(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }

        // merchant shorted relative to the state
        match f.merch_state.sign_mutual_close_tx(
            &mut f.db, &escrow_txid_le, &req.state, &req.pay_token.0, &payout_pk, req.cust_bal + 10, req.merch_bal - 10, &req.cust_sig,
        ) {
            Err(ZkChannelError::Validation(msg)) => assert!(msg.contains("does not match the state")),
            other => panic!("unexpected: {:?}", other),
        }

        // a genuinely certified but revoked state
        match f.merch_state.sign_mutual_close_tx(
            &mut f.db, &escrow_txid_le, &s0, &s0_token.0, &payout_pk, 999000, 1000000, &req.cust_sig,
        ) {
            Err(ZkChannelError::Validation(msg)) => assert!(msg.contains("revoked")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(f.db.get_channel_status(&escrow_txid).unwrap(), ChannelStatus::Open);

        f.merch_state
            .sign_mutual_close_tx(&mut f.db, &escrow_txid_le, &req.state, &req.pay_token.0, &payout_pk, req.cust_bal, req.merch_bal, &req.cust_sig)
            .unwrap();
        assert_eq!(f.db.get_channel_status(&escrow_txid).unwrap(), ChannelStatus::PendingClose);
    }

    #[test]
    fn completed_payment_leaves_no_session_records() {
        let mut f = open_channel(1000000, 1000000);
        pay(&mut f, 0, None).unwrap();
        pay(&mut f, 10, None).unwrap();
        pay(&mut f, 25, None).unwrap();

        assert!(f.db.session_map.is_empty());
        assert!(f.db.nonce_session_map.is_empty());
        assert!(f.db.nonce_mask_map.is_empty());
        assert!(f.db.mask_mpc_bytes.is_empty());
        assert_eq!(f.db.spent_lock_map.len(), 3);
    }

    #[test]
    fn abandoned_prepare_can_be_replaced() {
        let mut f = open_channel(1000000, 1000000);
        pay(&mut f, 0, None).unwrap();

        let (_, revoked, first_session) = f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 10).unwrap();
        f.merch_state
            .generate_pay_mask_commitment(&mut f.rng, &mut f.db, first_session, revoked.get_nonce(), revoked.get_rev_lock_com(), 10, None)
            .unwrap();
        // customer walks away before the mpc
        f.cust_state.abort_payment().unwrap();

        let (_, retry, second_session) = f.cust_state.prepare_payment(&mut f.rng, &f.channel_state, 10).unwrap();
        assert_eq!(retry.get_nonce(), revoked.get_nonce());
        assert_ne!(second_session, first_session);
        f.merch_state
            .generate_pay_mask_commitment(&mut f.rng, &mut f.db, second_session, retry.get_nonce(), retry.get_rev_lock_com(), 10, None)
            .unwrap();
        assert!(!f.db.check_session_id(&hex::encode(first_session)).unwrap());
        assert_eq!(
            f.db.get_session_for_nonce(&hex::encode(retry.get_nonce())).unwrap(),
            Some(hex::encode(second_session))
        );

        // once the mpc has run the session is no longer replaceable
        let com = f.db.get_mask_map_from_nonce(&hex::encode(retry.get_nonce())).unwrap();
        let cust_input = f
            .cust_state
            .build_mpc_input(&f.channel_state, &f.channel_token, compute_commitment(&com.0, &com.1))
            .unwrap();
        let merch_input = f.merch_state.prepare_mpc_inputs(&mut f.rng, &mut f.db, &f.channel_state, second_session).unwrap();
        let (_, merch_out) = ideal_functionality(&cust_input, &merch_input).unwrap();
        f.merch_state
            .finish_mpc(&mut f.db, second_session, &merch_input, Ok(MaskedResult::Merchant(merch_out)))
            .unwrap();
        match f.merch_state.generate_pay_mask_commitment(
            &mut f.rng, &mut f.db, [9u8; 16], retry.get_nonce(), retry.get_rev_lock_com(), 10, None,
        ) {
            Err(ZkChannelError::PaymentInProgress) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn mpc_test_serialization() {
        let f = open_channel(100000, 100000);
        let ser_cust = serde_json::to_string(&f.cust_state).unwrap();
        let cust_back: CustomerMPCState = serde_json::from_str(&ser_cust).unwrap();
        assert_eq!(cust_back, f.cust_state);

        let ser_merch = serde_json::to_string(&f.merch_state).unwrap();
        let merch_back: MerchantMPCState = serde_json::from_str(&ser_merch).unwrap();
        assert_eq!(merch_back, f.merch_state);

        let ser_token = serde_json::to_string(&f.channel_token).unwrap();
        let token_back: ChannelMPCToken = serde_json::from_str(&ser_token).unwrap();
        assert_eq!(token_back, f.channel_token);
    }
}
