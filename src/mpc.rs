pub use crate::channels_mpc::{
    ChannelMPCState, ChannelMPCToken, CustomerMPCState, InitCustState, MerchantMPCState,
    MutualCloseRequest, RevokedState, TransactionFeeInfo,
};
pub use crate::channels_util::{ChannelStatus, FundingTxInfo, PaymentStatus, ProtocolStatus};
use crate::database::{MaskedTxMPCInputs, StateDatabase};
use crate::error::{ZkChannelError, ZkResult};
pub use crate::mpc_session::MpcCoordinator;
pub use crate::transactions::SignedTransaction;
use crate::util::reverse_bytes;
pub use crate::wallet::{State, NONCE_LEN};
use rand::Rng;
use secp256k1::PublicKey;
use std::time::Duration;
use tracing::info;

fn escrow_key(escrow_txid_le: &[u8; 32]) -> String {
    hex::encode(reverse_bytes(escrow_txid_le))
}

///
/// init_merchant() - takes as input the public params, merchant balance and keypair.
/// Generates merchant data which consists of channel token and merchant state.
/// output: merchant state
///
pub fn init_merchant<R: Rng>(
    csprng: &mut R,
    db_url: String,
    channel_state: &mut ChannelMPCState,
    name: &str,
) -> MerchantMPCState {
    MerchantMPCState::new(csprng, db_url, channel_state, String::from(name))
}

///
/// init_customer() - takes as input the merchant's public key, and initial balance for customer and merchant.
/// Generate initial customer channel state and channel token.
/// A zero merchant balance is topped up to the merchant's minimum from the customer's side.
/// output: a channel token and customer state
///
pub fn init_customer<R: Rng>(
    csprng: &mut R,
    pk_m: &PublicKey,
    b0_cust: i64,
    b0_merch: i64,
    tx_fee_info: &TransactionFeeInfo,
    name: &str,
) -> ZkResult<(ChannelMPCToken, CustomerMPCState)> {
    ensure_valid!(b0_cust > 0, "initial customer balance must be positive: {}", b0_cust);
    ensure_valid!(b0_merch >= 0, "initial merchant balance cannot be negative: {}", b0_merch);

    let (b0_cust, b0_merch) = match b0_merch {
        0 => {
            let merch_floor = tx_fee_info.bal_min_merch + tx_fee_info.fee_mc + tx_fee_info.val_cpfp;
            (b0_cust - merch_floor, merch_floor)
        }
        _ => (b0_cust, b0_merch),
    };
    let cust_floor = tx_fee_info.bal_min_cust + tx_fee_info.fee_cc + tx_fee_info.val_cpfp;
    if b0_cust < cust_floor {
        return Err(ZkChannelError::InsufficientBalance(format!(
            "initial customer balance {} is below {}",
            b0_cust, cust_floor
        )));
    }

    let mut cust_state = CustomerMPCState::new(csprng, b0_cust, b0_merch, tx_fee_info.fee_cc, String::from(name));
    let channel_token = cust_state.generate_init_state(
        csprng,
        pk_m,
        tx_fee_info.min_fee,
        tx_fee_info.max_fee,
        tx_fee_info.fee_mc,
    )?;
    Ok((channel_token, cust_state))
}

///
/// get_initial_state() - takes as input the customer state
/// output: initial cust state and expected hash
///
pub fn get_initial_state(cust_state: &CustomerMPCState) -> ZkResult<(InitCustState, [u8; 32])> {
    let init_state = cust_state.get_initial_cust_state()?;
    let init_state_hash = cust_state.get_current_state()?.compute_hash();
    Ok((init_state, init_state_hash))
}

///
/// validate_channel_params() - takes as input the channel token, initial state and verifies that they are well-formed
/// output: true or false
///
pub fn validate_channel_params(
    db: &mut dyn StateDatabase,
    channel_token: &ChannelMPCToken,
    init_state: &InitCustState,
    init_hash: [u8; 32],
    merch_state: &mut MerchantMPCState,
) -> ZkResult<bool> {
    merch_state.validate_channel_params(db, channel_token, init_state, init_hash)
}

///
/// customer_sign_merch_close_tx() - customer signature on the merch-close tx spending the escrow.
/// output: signature, merch-close txid (big-endian) and merch-close prevout
///
pub fn customer_sign_merch_close_tx(
    channel_state: &ChannelMPCState,
    channel_token: &ChannelMPCToken,
    escrow_txid_le: &[u8; 32],
    cust_state: &CustomerMPCState,
) -> ZkResult<(Vec<u8>, [u8; 32], [u8; 32])> {
    cust_state.sign_merch_close_tx(channel_state, channel_token, escrow_txid_le)
}

///
/// merchant_verify_merch_close_tx() - verifies the customer's signature on merch-close and stores it.
/// The channel moves to PendingOpen.
/// output: merch-close txid (big-endian) and prevout
///
pub fn merchant_verify_merch_close_tx(
    db: &mut dyn StateDatabase,
    channel_state: &ChannelMPCState,
    escrow_txid_le: &[u8; 32],
    cust_pk: &PublicKey,
    cust_bal: i64,
    merch_bal: i64,
    fee_mc: i64,
    cust_sig: &[u8],
    merch_state: &mut MerchantMPCState,
) -> ZkResult<([u8; 32], [u8; 32])> {
    merch_state.verify_merch_close_tx(db, channel_state, escrow_txid_le, cust_pk, cust_bal, merch_bal, fee_mc, cust_sig)
}

///
/// merchant_sign_init_cust_close_txs() - signs the initial cust-close txs (from escrow and from merch-close).
/// output: (escrow_sig, merch_sig)
///
pub fn merchant_sign_init_cust_close_txs(
    channel_state: &ChannelMPCState,
    funding_tx: &FundingTxInfo,
    rev_lock: [u8; 32],
    cust_pk: PublicKey,
    cust_close_pk: PublicKey,
    fee_cc: i64,
    merch_state: &MerchantMPCState,
) -> ZkResult<(Vec<u8>, Vec<u8>)> {
    merch_state.sign_initial_closing_transaction(channel_state, funding_tx, rev_lock, cust_pk, cust_close_pk, fee_cc)
}

///
/// customer_verify_init_cust_close_txs() - verifies the merchant's signatures on the initial cust-close txs
/// no output
///
pub fn customer_verify_init_cust_close_txs(
    channel_state: &ChannelMPCState,
    channel_token: &ChannelMPCToken,
    escrow_sig: &[u8],
    merch_sig: &[u8],
    cust_state: &mut CustomerMPCState,
) -> ZkResult<()> {
    cust_state.sign_initial_closing_transaction(channel_state, channel_token, escrow_sig, merch_sig)
}

///
/// customer_mark_open_channel() - changes channel status in customer state
///
pub fn customer_mark_open_channel(cust_state: &mut CustomerMPCState) -> ZkResult<()> {
    cust_state.change_channel_status(ChannelStatus::Open)
}

///
/// merchant_mark_open_channel() - changes channel status for a given escrow-txid.
/// fails if not in pending open state and assumes escrow-txid has been broadcast on chain
///
pub fn merchant_mark_open_channel(db: &mut dyn StateDatabase, escrow_txid_le: [u8; 32]) -> ZkResult<()> {
    db.transition_channel_status(&escrow_key(&escrow_txid_le), ChannelStatus::Open)?;
    Ok(())
}

///
/// activate_customer() - takes as input the customer state.
/// Prepare to activate the channel for the customer (call activate_customer_finalize to finalize activation)
/// output: initial state
///
pub fn activate_customer(cust_state: &CustomerMPCState) -> ZkResult<State> {
    if cust_state.protocol_status != ProtocolStatus::Initialized {
        return Err(ZkChannelError::InvalidStatus {
            op: "activate_customer",
            status: cust_state.protocol_status.to_string(),
        });
    }
    let channel_status = cust_state.get_channel_status();
    if channel_status != ChannelStatus::Open {
        return Err(ZkChannelError::InvalidStatus {
            op: "activate_customer",
            status: channel_status.to_string(),
        });
    }
    cust_state.get_current_state()
}

///
/// activate_merchant() - takes as input a channel token, the intial state, and the merchant state.
/// Activate the channel for the merchant
/// output: intial pay token
///
pub fn activate_merchant(
    db: &mut dyn StateDatabase,
    channel_token: &ChannelMPCToken,
    s0: &State,
    merch_state: &MerchantMPCState,
) -> ZkResult<[u8; 32]> {
    merch_state.activate_channel(db, channel_token, s0)
}

///
/// activate_customer_finalize() - takes as input the initial pay token and the customer state.
/// Finalize activation of the channel for customer
/// no output
///
pub fn activate_customer_finalize(pay_token_0: [u8; 32], cust_state: &mut CustomerMPCState) -> ZkResult<()> {
    cust_state.store_initial_pay_token(pay_token_0)
}

///
/// pay_prepare_customer() - takes as input an rng, the channel state, the payment amount, and the customer state.
/// Prepare payment for customer
/// output: new state (after payment), revoked state for the old one, revocation lock commitment and session id
/// (only send revocation lock commitment, nonce and session id to merchant)
///
pub fn pay_prepare_customer<R: Rng>(
    csprng: &mut R,
    channel_state: &ChannelMPCState,
    amount: i64,
    cust_state: &mut CustomerMPCState,
) -> ZkResult<(State, RevokedState, [u8; 32], [u8; 16])> {
    let (new_state, rev_state, session_id) = cust_state.prepare_payment(csprng, channel_state, amount)?;
    let rev_lock_com = rev_state.get_rev_lock_com();
    Ok((new_state, rev_state, rev_lock_com, session_id))
}

///
/// pay_prepare_merchant() - takes as input an rng, the nonce of the old state, rev lock commitment, amount and the merchant state.
/// Prepare payment for merchant. Negative amounts need a justification.
/// output: commitment of the payment token mask
///
pub fn pay_prepare_merchant<R: Rng>(
    csprng: &mut R,
    db: &mut dyn StateDatabase,
    session_id: [u8; 16],
    nonce: [u8; NONCE_LEN],
    rev_lock_com: [u8; 32],
    amount: i64,
    justification: Option<String>,
    merch_state: &MerchantMPCState,
) -> ZkResult<[u8; 32]> {
    merch_state.generate_pay_mask_commitment(csprng, db, session_id, nonce, rev_lock_com, amount, justification)
}

///
/// pay_update_customer() - takes as input the channel state, the channel token, a commitment for the mask
/// for the pay token, the mpc coordinator and the customer state.
/// Run the MPC for a payment for the Customer
/// output: success, or error (the payment is dropped and the old state kept)
///
pub fn pay_update_customer(
    channel_state: &ChannelMPCState,
    channel_token: &ChannelMPCToken,
    pay_token_mask_com: [u8; 32],
    coordinator: &dyn MpcCoordinator,
    timeout: Duration,
    cust_state: &mut CustomerMPCState,
) -> ZkResult<()> {
    cust_state.execute_mpc_context(channel_state, channel_token, pay_token_mask_com, coordinator, timeout)
}

///
/// pay_update_merchant() - takes as input an rng, the channel state, the session id, the mpc coordinator
/// and the merchant state.
/// Run the MPC for a payment for the Merchant
/// output: success, or error (the session is marked as failed)
///
pub fn pay_update_merchant<R: Rng>(
    csprng: &mut R,
    db: &mut dyn StateDatabase,
    channel_state: &ChannelMPCState,
    session_id: [u8; 16],
    coordinator: &dyn MpcCoordinator,
    timeout: Duration,
    merch_state: &MerchantMPCState,
) -> ZkResult<()> {
    merch_state.execute_mpc_context(csprng, db, channel_state, session_id, coordinator, timeout)
}

///
/// pay_confirm_mpc_result() - takes as input a db, session identifier and merch state
/// output: masked input if the mpc result was successful and there is a masked input for a given session_id
///
pub fn pay_confirm_mpc_result(
    db: &mut dyn StateDatabase,
    session_id: [u8; 16],
    merch_state: &MerchantMPCState,
) -> ZkResult<MaskedTxMPCInputs> {
    db.is_connected()?;
    merch_state.get_masked_tx_inputs(db, session_id)
}

///
/// pay_unmask_sigs_customer() - takes as input the transaction masks and the customer state.
/// Unmask the transactions received from the MPC
/// output: the revoked state to send to the merchant
///
pub fn pay_unmask_sigs_customer(
    channel_state: &ChannelMPCState,
    channel_token: &ChannelMPCToken,
    mask_bytes: &MaskedTxMPCInputs,
    cust_state: &mut CustomerMPCState,
) -> ZkResult<RevokedState> {
    cust_state.unmask_and_verify_transactions(channel_state, channel_token, mask_bytes)?;
    cust_state.get_revoked_state()
}

///
/// pay_validate_rev_lock_merchant() - takes as input the session id, the revoked state and the merchant state.
/// Verify the revocation lock commitment
/// output: the pay token mask and randomness
///
pub fn pay_validate_rev_lock_merchant(
    db: &mut dyn StateDatabase,
    session_id: [u8; 16],
    rev_state: &RevokedState,
    merch_state: &MerchantMPCState,
) -> ZkResult<([u8; 32], [u8; 16])> {
    merch_state.verify_revoked_state(db, session_id, rev_state)
}

///
/// pay_unmask_pay_token_customer() - takes as input the paytoken mask and the customer state.
/// Verify the paytoken mask commitment and unmask paytoken
///
pub fn pay_unmask_pay_token_customer(
    pt_mask_bytes: [u8; 32],
    pt_mask_r: [u8; 16],
    cust_state: &mut CustomerMPCState,
) -> ZkResult<()> {
    cust_state.unmask_and_verify_pay_token(pt_mask_bytes, pt_mask_r)
}

///
/// pay_abort_customer() - drops an in-flight payment on the customer side
///
pub fn pay_abort_customer(cust_state: &mut CustomerMPCState) -> ZkResult<()> {
    cust_state.abort_payment()
}

///
/// force_customer_close() - takes as input the channel_state, channel_token, from_escrow and customer state.
/// signs the closing tx on the current state of the channel
/// output: cust-close signed tx from escrow-tx or merch-close-tx
///
pub fn force_customer_close(
    channel_state: &ChannelMPCState,
    channel_token: &ChannelMPCToken,
    from_escrow: bool,
    cust_state: &mut CustomerMPCState,
) -> ZkResult<SignedTransaction> {
    cust_state.customer_close(channel_state, channel_token, from_escrow)
}

///
/// force_merchant_close() - takes as input the escrow txid and merchant state.
/// signs the merch-close-tx tx on the current state of the channel
/// output: merch-close signed tx on a given channel (identified by the escrow-txid)
///
pub fn force_merchant_close(
    db: &mut dyn StateDatabase,
    escrow_txid_le: &[u8; 32],
    merch_state: &MerchantMPCState,
) -> ZkResult<SignedTransaction> {
    let escrow_txid = escrow_key(escrow_txid_le);
    let signed = merch_state.get_closing_tx(escrow_txid_le)?;
    if db.get_channel_status(&escrow_txid)? != ChannelStatus::MerchantInitClose {
        db.transition_channel_status(&escrow_txid, ChannelStatus::MerchantInitClose)?;
    }
    info!(escrow = %escrow_txid, txid = %hex::encode(signed.txid_be), "merch-close signed");
    Ok(signed)
}

///
/// customer_sign_mutual_close_tx() - customer signature on a mutual close with the given payouts
/// output: the signature with the state and pay token it closes on
///
pub fn customer_sign_mutual_close_tx(
    channel_state: &ChannelMPCState,
    channel_token: &ChannelMPCToken,
    cust_bal: i64,
    merch_bal: i64,
    cust_state: &mut CustomerMPCState,
) -> ZkResult<MutualCloseRequest> {
    cust_state.sign_mutual_close_tx(channel_state, channel_token, cust_bal, merch_bal)
}

///
/// merchant_sign_mutual_close_tx() - checks the closing state against its pay token, verifies the
/// customer's signature and completes the mutual close
/// output: signed mutual close tx
///
pub fn merchant_sign_mutual_close_tx(
    db: &mut dyn StateDatabase,
    escrow_txid_le: &[u8; 32],
    cust_close_pk: &PublicKey,
    request: &MutualCloseRequest,
    merch_state: &MerchantMPCState,
) -> ZkResult<SignedTransaction> {
    merch_state.sign_mutual_close_tx(
        db,
        escrow_txid_le,
        &request.state,
        &request.pay_token.0,
        cust_close_pk,
        request.cust_bal,
        request.merch_bal,
        &request.cust_sig,
    )
}

///
/// merchant_check_rev_lock() - looks up the revocation secret for a rev_lock seen on chain
/// output: the secret if the lock has been revoked
///
pub fn merchant_check_rev_lock(
    db: &mut dyn StateDatabase,
    rev_lock: &[u8; 32],
    merch_state: &MerchantMPCState,
) -> ZkResult<Option<[u8; 32]>> {
    merch_state.check_rev_lock(db, rev_lock)
}

///
/// merchant_sign_dispute_tx() - spends the customer's output of a revoked cust-close.
/// The channel moves to Disputed.
///
pub fn merchant_sign_dispute_tx(
    db: &mut dyn StateDatabase,
    channel_state: &ChannelMPCState,
    escrow_txid_le: &[u8; 32],
    close_txid_le: &[u8; 32],
    input_amount: i64,
    claim_amount: i64,
    output_pk: &PublicKey,
    rev_lock: &[u8; 32],
    rev_secret: &[u8; 32],
    cust_close_pk: &PublicKey,
    merch_state: &MerchantMPCState,
) -> ZkResult<SignedTransaction> {
    let signed = merch_state.sign_dispute_tx(
        channel_state,
        close_txid_le,
        input_amount,
        claim_amount,
        output_pk,
        rev_lock,
        rev_secret,
        cust_close_pk,
    )?;
    db.transition_channel_status(&escrow_key(escrow_txid_le), ChannelStatus::Disputed)?;
    Ok(signed)
}

///
/// merchant_sign_cust_claim_tx() - sweeps the merchant output of a cust-close tx
///
pub fn merchant_sign_cust_claim_tx(
    close_txid_le: &[u8; 32],
    input_amount: i64,
    claim_amount: i64,
    output_pk: &PublicKey,
    merch_state: &MerchantMPCState,
) -> ZkResult<SignedTransaction> {
    merch_state.sign_cust_claim_tx(close_txid_le, input_amount, claim_amount, output_pk)
}

///
/// merchant_sign_merch_claim_tx() - sweeps merch-close once the delay has passed
///
pub fn merchant_sign_merch_claim_tx(
    channel_state: &ChannelMPCState,
    escrow_txid_le: &[u8; 32],
    merch_close_txid_le: &[u8; 32],
    input_amount: i64,
    claim_amount: i64,
    output_pk: &PublicKey,
    merch_state: &MerchantMPCState,
) -> ZkResult<SignedTransaction> {
    merch_state.sign_merch_claim_tx(channel_state, escrow_txid_le, merch_close_txid_le, input_amount, claim_amount, output_pk)
}

///
/// customer_sign_claim_tx() - sweeps the customer output of cust-close once the delay has passed
///
pub fn customer_sign_claim_tx(
    channel_state: &ChannelMPCState,
    close_txid_le: &[u8; 32],
    input_amount: i64,
    claim_amount: i64,
    output_pk: &PublicKey,
    cust_state: &CustomerMPCState,
) -> ZkResult<SignedTransaction> {
    cust_state.sign_claim_tx(channel_state, close_txid_le, input_amount, claim_amount, output_pk)
}

///
/// customer_change_channel_status() - moves the customer's view of the channel along the status table
///
pub fn customer_change_channel_status(cust_state: &mut CustomerMPCState, status: ChannelStatus) -> ZkResult<()> {
    cust_state.change_channel_status(status)
}

///
/// customer_confirm_close() - marks the channel closed once the closing tx is confirmed
///
pub fn customer_confirm_close(cust_state: &mut CustomerMPCState) -> ZkResult<()> {
    cust_state.confirm_close()
}

pub fn merchant_get_channel_status(db: &mut dyn StateDatabase, escrow_txid_le: &[u8; 32]) -> ZkResult<ChannelStatus> {
    db.get_channel_status(&escrow_key(escrow_txid_le))
}

pub fn merchant_change_channel_status(
    db: &mut dyn StateDatabase,
    escrow_txid_le: &[u8; 32],
    status: ChannelStatus,
) -> ZkResult<ChannelStatus> {
    db.transition_channel_status(&escrow_key(escrow_txid_le), status)
}

///
/// merchant_clear_channel_status() - forgets a channel that is unknown or confirmed closed
///
pub fn merchant_clear_channel_status(db: &mut dyn StateDatabase, escrow_txid_le: &[u8; 32]) -> ZkResult<()> {
    db.clear_channel_status(&escrow_key(escrow_txid_le))
}

/// Known channels as (escrow txid big-endian hex, status). Quarantined
/// channels are reported with their error instead of a status.
pub fn merchant_list_channels(db: &mut dyn StateDatabase) -> ZkResult<Vec<(String, ZkResult<ChannelStatus>)>> {
    let ids = db.list_channel_ids()?;
    Ok(ids
        .into_iter()
        .map(|id| {
            let status = db.get_channel_status(&id);
            (id, status)
        })
        .collect())
}
