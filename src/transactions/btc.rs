use std::convert::TryFrom;

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_IF,
    OP_PUSHNUM_2, OP_RETURN, OP_SHA256,
};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{ScriptBuf, Sequence, WPubkeyHash};
use secp256k1::ecdsa::Signature;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    decode_signature, encode_signature, p2pkh_script_code, sign_sighash, tx_input, tx_output,
    verify_sighash_signature, SignedTransaction, SpendTx,
};
use crate::error::{ZkChannelError, ZkResult};
use crate::fixed_size_array::FixedSizeArray32;
use crate::util::{compute_prevout, is_valid_rev_secret, reverse_bytes};
use crate::wallet::State;

/// Public keys needed to rebuild a customer-close transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClosePublicKeys {
    pub cust_pk: PublicKey,
    pub cust_close_pk: PublicKey,
    pub merch_pk: PublicKey,
    pub merch_close_pk: PublicKey,
    pub merch_disp_pk: PublicKey,
    pub rev_lock: FixedSizeArray32,
}

/// Amounts and fees of a channel at a given state.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CloseAmounts {
    pub cust_bal: i64,
    pub merch_bal: i64,
    pub fee_cc: i64,
    pub fee_mc: i64,
    pub val_cpfp: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FundingInputType {
    P2wpkh,
    P2shP2wpkh,
}

/// The customer UTXO that funds the escrow.
#[derive(Clone, Debug)]
pub struct FundingInput {
    pub txid_le: [u8; 32],
    pub index: u32,
    pub input_sats: i64,
    pub input_type: FundingInputType,
    pub sk: SecretKey,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChangeOutput {
    PublicKey(PublicKey),
    KeyHash([u8; 20]),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscrowTx {
    pub signed_tx: Option<Vec<u8>>,
    pub txid_be: [u8; 32],
    pub txid_le: [u8; 32],
    pub prevout: [u8; 32],
}

//////////////////////////////////// scripts ////////////////////////////////////

fn push_bytes(bytes: &[u8]) -> ZkResult<PushBytesBuf> {
    PushBytesBuf::try_from(bytes.to_vec())
        .map_err(|e| ZkChannelError::Validation(format!("script push too large: {}", e)))
}

fn btc_key(pk: &PublicKey) -> bitcoin::PublicKey {
    bitcoin::PublicKey::new(*pk)
}

fn push_escrow_multisig(builder: Builder, merch_pk: &PublicKey, cust_pk: &PublicKey) -> Builder {
    builder
        .push_opcode(OP_PUSHNUM_2)
        .push_key(&btc_key(merch_pk))
        .push_key(&btc_key(cust_pk))
        .push_opcode(OP_PUSHNUM_2)
        .push_opcode(OP_CHECKMULTISIG)
}

/// `OP_2 <merch_pk> <cust_pk> OP_2 OP_CHECKMULTISIG`
pub fn escrow_redeem_script(merch_pk: &PublicKey, cust_pk: &PublicKey) -> ScriptBuf {
    push_escrow_multisig(Builder::new(), merch_pk, cust_pk).into_script()
}

//    OP_IF
//      OP_2 <merch_pk> <cust_pk> OP_2 OP_CHECKMULTISIG
//    OP_ELSE
//      <to_self_delay> OP_CHECKSEQUENCEVERIFY OP_DROP <merch_close_pk> OP_CHECKSIG
//    OP_ENDIF
pub fn merch_close_redeem_script(
    merch_pk: &PublicKey,
    cust_pk: &PublicKey,
    merch_close_pk: &PublicKey,
    self_delay: u16,
) -> ScriptBuf {
    let builder = Builder::new().push_opcode(OP_IF);
    push_escrow_multisig(builder, merch_pk, cust_pk)
        .push_opcode(OP_ELSE)
        .push_int(self_delay as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_key(&btc_key(merch_close_pk))
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script()
}

//    OP_IF
//      OP_SHA256 <rev_lock> OP_EQUALVERIFY <merch_disp_pk>
//    OP_ELSE
//      <to_self_delay> OP_CHECKSEQUENCEVERIFY OP_DROP <cust_close_pk>
//    OP_ENDIF
//    OP_CHECKSIG
pub fn cust_close_redeem_script(
    rev_lock: &[u8; 32],
    merch_disp_pk: &PublicKey,
    cust_close_pk: &PublicKey,
    self_delay: u16,
) -> ZkResult<ScriptBuf> {
    Ok(Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_SHA256)
        .push_slice(push_bytes(rev_lock)?)
        .push_opcode(OP_EQUALVERIFY)
        .push_key(&btc_key(merch_disp_pk))
        .push_opcode(OP_ELSE)
        .push_int(self_delay as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_key(&btc_key(cust_close_pk))
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}

pub fn p2wsh_script_pubkey(redeem_script: &ScriptBuf) -> ScriptBuf {
    ScriptBuf::new_v0_p2wsh(&redeem_script.wscript_hash())
}

pub fn p2wpkh_script_pubkey(pk: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_v0_p2wpkh(&WPubkeyHash::hash(&pk.serialize()))
}

/// `OP_RETURN <rev_lock || cust_close_pk>`
pub fn op_return_script(rev_lock: &[u8; 32], cust_close_pk: &PublicKey) -> ZkResult<ScriptBuf> {
    let mut data = rev_lock.to_vec();
    data.extend_from_slice(&cust_close_pk.serialize());
    Ok(Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(push_bytes(&data)?)
        .into_script())
}

fn public_key(sk: &SecretKey) -> PublicKey {
    let secp = Secp256k1::signing_only();
    PublicKey::from_secret_key(&secp, sk)
}

fn checked_total(a: i64, b: i64) -> ZkResult<i64> {
    a.checked_add(b)
        .ok_or_else(|| ZkChannelError::Validation("amount overflow".to_string()))
}

///////////////////////////////////// escrow /////////////////////////////////////

/// Builds the unsigned escrow transaction: a 2-of-2 output of
/// `cust_bal + merch_bal` plus change.
pub fn form_escrow_transaction(
    input: &FundingInput,
    cust_pk: &PublicKey,
    merch_pk: &PublicKey,
    change: &ChangeOutput,
    cust_bal: i64,
    merch_bal: i64,
    tx_fee: i64,
) -> ZkResult<([u8; 32], SpendTx)> {
    let funding_pk = public_key(&input.sk);
    let mut utxo = tx_input(&input.txid_le, input.index, Sequence::MAX);
    if input.input_type == FundingInputType::P2shP2wpkh {
        let redeem_script = p2wpkh_script_pubkey(&funding_pk);
        utxo.script_sig = Builder::new()
            .push_slice(push_bytes(redeem_script.as_bytes())?)
            .into_script();
    }

    let escrow_amount = checked_total(cust_bal, merch_bal)?;
    let escrow_script = escrow_redeem_script(merch_pk, cust_pk);
    let mut outputs = vec![tx_output(escrow_amount, p2wsh_script_pubkey(&escrow_script))?];

    let change_sats = input
        .input_sats
        .checked_sub(checked_total(escrow_amount, tx_fee)?)
        .ok_or_else(|| ZkChannelError::Validation("amount overflow".to_string()))?;
    if change_sats > 0 {
        let script_pubkey = match change {
            ChangeOutput::PublicKey(pk) => p2wpkh_script_pubkey(pk),
            ChangeOutput::KeyHash(h) => ScriptBuf::new_v0_p2wpkh(&WPubkeyHash::from_byte_array(*h)),
        };
        outputs.push(tx_output(change_sats, script_pubkey)?);
    } else if change_sats < 0 {
        return Err(ZkChannelError::InsufficientBalance(format!(
            "funding input {} cannot cover escrow {} and fee {}",
            input.input_sats, escrow_amount, tx_fee
        )));
    }

    let tx = SpendTx::new(utxo, input.input_sats, p2pkh_script_code(&funding_pk), outputs);
    tx.check_balance(tx_fee)?;
    Ok((tx.sighash()?, tx))
}

/// Unsigned variant: only the txid and prevout needed downstream.
pub fn escrow_transaction_info(tx: &SpendTx) -> EscrowTx {
    let txid_be = tx.txid_be();
    EscrowTx {
        signed_tx: None,
        txid_be,
        txid_le: tx.txid_le(),
        prevout: compute_prevout(&txid_be, 0),
    }
}

pub fn sign_escrow_transaction(
    input: &FundingInput,
    cust_pk: &PublicKey,
    merch_pk: &PublicKey,
    change: &ChangeOutput,
    cust_bal: i64,
    merch_bal: i64,
    tx_fee: i64,
) -> ZkResult<EscrowTx> {
    let (sighash, tx) =
        form_escrow_transaction(input, cust_pk, merch_pk, change, cust_bal, merch_bal, tx_fee)?;
    let sig = sign_sighash(&sighash, &input.sk)?;
    let funding_pk = public_key(&input.sk);

    let mut info = escrow_transaction_info(&tx);
    let signed = tx.finalize(vec![sig, funding_pk.serialize().to_vec()]);
    info.signed_tx = Some(signed.tx);
    debug!(txid = %hex::encode(info.txid_le), "signed escrow transaction");
    Ok(info)
}

/////////////////////////////////// merch-close ///////////////////////////////////

/// Merch-close spends the escrow to the timelocked merch-close output plus a
/// CPFP output to `merch_close_pk`.
pub fn form_merch_close_transaction(
    escrow_txid_le: &[u8; 32],
    cust_pk: &PublicKey,
    merch_pk: &PublicKey,
    merch_close_pk: &PublicKey,
    cust_bal: i64,
    merch_bal: i64,
    fee_mc: i64,
    val_cpfp: i64,
    self_delay: u16,
) -> ZkResult<([u8; 32], SpendTx)> {
    let total = checked_total(cust_bal, merch_bal)?;
    let input = tx_input(escrow_txid_le, 0, Sequence::MAX);

    let merch_close_script = merch_close_redeem_script(merch_pk, cust_pk, merch_close_pk, self_delay);
    let outputs = vec![
        tx_output(total - fee_mc - val_cpfp, p2wsh_script_pubkey(&merch_close_script))?,
        tx_output(val_cpfp, p2wpkh_script_pubkey(merch_close_pk))?,
    ];

    let tx = SpendTx::new(input, total, escrow_redeem_script(merch_pk, cust_pk), outputs);
    tx.check_balance(fee_mc)?;
    Ok((tx.sighash()?, tx))
}

pub fn customer_sign_merch_close_transaction(cust_sk: &SecretKey, sighash: &[u8; 32]) -> ZkResult<Vec<u8>> {
    sign_sighash(sighash, cust_sk)
}

/// Adds both signatures to a 2-of-2 escrow spend (merchant signature first).
pub fn complete_escrow_spend(tx: SpendTx, merch_sig: Vec<u8>, cust_sig: Vec<u8>) -> SignedTransaction {
    let script = tx.script_code.to_bytes();
    tx.finalize(vec![Vec::new(), merch_sig, cust_sig, script])
}

/// Merchant-side completion of merch-close: checks the customer signature
/// against the rebuilt sighash before adding its own.
pub fn merchant_sign_merch_close_transaction(
    tx: SpendTx,
    cust_pk: &PublicKey,
    cust_sig: &[u8],
    merch_sk: &SecretKey,
) -> ZkResult<SignedTransaction> {
    let sighash = tx.sighash()?;
    let sig = decode_signature(cust_sig)?;
    verify_sighash_signature(&sighash, &sig, cust_pk)?;
    let merch_sig = sign_sighash(&sighash, merch_sk)?;
    Ok(complete_escrow_spend(tx, merch_sig, encode_signature(&sig)))
}

/////////////////////////////////// cust-close ///////////////////////////////////

/// Builds a customer-close transaction spending either the escrow output or
/// the merch-close output.
///
/// Outputs: `[to_customer (revocable, timelocked), to_merchant, OP_RETURN, CPFP]`.
pub fn create_cust_close_transaction(
    prev_txid_le: &[u8; 32],
    pubkeys: &ClosePublicKeys,
    self_delay: u16,
    amounts: &CloseAmounts,
    from_escrow: bool,
) -> ZkResult<([u8; 32], SpendTx)> {
    let total = checked_total(amounts.cust_bal, amounts.merch_bal)?;
    let (input_amount, script_code, to_merchant) = match from_escrow {
        true => (
            total,
            escrow_redeem_script(&pubkeys.merch_pk, &pubkeys.cust_pk),
            amounts.merch_bal,
        ),
        false => (
            total - amounts.fee_mc - amounts.val_cpfp,
            merch_close_redeem_script(
                &pubkeys.merch_pk,
                &pubkeys.cust_pk,
                &pubkeys.merch_close_pk,
                self_delay,
            ),
            amounts.merch_bal - amounts.fee_mc - amounts.val_cpfp,
        ),
    };

    let to_customer_script = cust_close_redeem_script(
        &pubkeys.rev_lock.0,
        &pubkeys.merch_disp_pk,
        &pubkeys.cust_close_pk,
        self_delay,
    )?;
    let outputs = vec![
        tx_output(
            amounts.cust_bal - amounts.fee_cc - amounts.val_cpfp,
            p2wsh_script_pubkey(&to_customer_script),
        )?,
        tx_output(to_merchant, p2wpkh_script_pubkey(&pubkeys.merch_close_pk))?,
        tx_output(0, op_return_script(&pubkeys.rev_lock.0, &pubkeys.cust_close_pk)?)?,
        tx_output(amounts.val_cpfp, p2wpkh_script_pubkey(&pubkeys.cust_close_pk))?,
    ];

    let input = tx_input(prev_txid_le, 0, Sequence::MAX);
    let tx = SpendTx::new(input, input_amount, script_code, outputs);
    tx.check_balance(amounts.fee_cc)?;
    Ok((tx.sighash()?, tx))
}

/// Unsigned cust-close transactions for one channel state.
#[derive(Clone, Debug)]
pub struct CustCloseTxs {
    pub escrow_sighash: [u8; 32],
    pub escrow_tx: SpendTx,
    pub merch_sighash: [u8; 32],
    pub merch_tx: SpendTx,
}

/// Builds both cust-close transactions (from escrow and from merch-close)
/// for `state`. The revocation lock is taken from `state`.
pub fn cust_close_transactions_for_state(
    state: &State,
    pubkeys: &ClosePublicKeys,
    self_delay: u16,
    fee_cc: i64,
    val_cpfp: i64,
) -> ZkResult<CustCloseTxs> {
    let mut keys = pubkeys.clone();
    keys.rev_lock = state.rev_lock;
    let amounts = CloseAmounts {
        cust_bal: state.bc,
        merch_bal: state.bm,
        fee_cc,
        fee_mc: state.fee_mc,
        val_cpfp,
    };
    let escrow_txid_le = reverse_bytes(&state.escrow_txid.0);
    let merch_txid_le = reverse_bytes(&state.merch_txid.0);
    let (escrow_sighash, escrow_tx) =
        create_cust_close_transaction(&escrow_txid_le, &keys, self_delay, &amounts, true)?;
    let (merch_sighash, merch_tx) =
        create_cust_close_transaction(&merch_txid_le, &keys, self_delay, &amounts, false)?;
    Ok(CustCloseTxs {
        escrow_sighash,
        escrow_tx,
        merch_sighash,
        merch_tx,
    })
}

/// Signs the customer side of a cust-close transaction and attaches the
/// merchant's compact signature.
pub fn complete_cust_close_transaction(
    tx: SpendTx,
    merch_sig_compact: &[u8; 64],
    cust_sk: &SecretKey,
    from_escrow: bool,
) -> ZkResult<SignedTransaction> {
    let sighash = tx.sighash()?;
    let merch_sig = encode_signature(&Signature::from_compact(merch_sig_compact)?);
    let cust_sig = sign_sighash(&sighash, cust_sk)?;
    let script = tx.script_code.to_bytes();
    let witness = match from_escrow {
        true => vec![Vec::new(), merch_sig, cust_sig, script],
        // select the OP_IF (multisig) branch of merch-close
        false => vec![Vec::new(), merch_sig, cust_sig, vec![0x01], script],
    };
    Ok(tx.finalize(witness))
}

////////////////////////////////////// claims //////////////////////////////////////

fn single_output_spend(
    prev_txid_le: &[u8; 32],
    index: u32,
    input_amount: i64,
    claim_amount: i64,
    script_code: ScriptBuf,
    sequence: Sequence,
    output_pk: &PublicKey,
) -> ZkResult<([u8; 32], SpendTx)> {
    let input = tx_input(prev_txid_le, index, sequence);
    let outputs = vec![tx_output(claim_amount, p2wpkh_script_pubkey(output_pk))?];
    let tx = SpendTx::new(input, input_amount, script_code, outputs);
    tx.check_balance(input_amount - claim_amount)?;
    Ok((tx.sighash()?, tx))
}

/// Customer sweeps its cust-close output after the self-delay.
pub fn customer_sign_claim_transaction(
    close_txid_le: &[u8; 32],
    index: u32,
    input_amount: i64,
    claim_amount: i64,
    self_delay: u16,
    output_pk: &PublicKey,
    rev_lock: &[u8; 32],
    merch_disp_pk: &PublicKey,
    cust_close_sk: &SecretKey,
) -> ZkResult<SignedTransaction> {
    let cust_close_pk = public_key(cust_close_sk);
    let script = cust_close_redeem_script(rev_lock, merch_disp_pk, &cust_close_pk, self_delay)?;
    let (sighash, tx) = single_output_spend(
        close_txid_le,
        index,
        input_amount,
        claim_amount,
        script.clone(),
        Sequence::from_height(self_delay),
        output_pk,
    )?;
    let sig = sign_sighash(&sighash, cust_close_sk)?;
    Ok(tx.finalize(vec![sig, Vec::new(), script.into_bytes()]))
}

/// Merchant claims its P2WPKH output of a cust-close transaction (no delay).
pub fn merchant_sign_cust_claim_transaction(
    close_txid_le: &[u8; 32],
    index: u32,
    input_amount: i64,
    claim_amount: i64,
    output_pk: &PublicKey,
    merch_close_sk: &SecretKey,
) -> ZkResult<SignedTransaction> {
    let merch_close_pk = public_key(merch_close_sk);
    let (sighash, tx) = single_output_spend(
        close_txid_le,
        index,
        input_amount,
        claim_amount,
        p2pkh_script_code(&merch_close_pk),
        Sequence::MAX,
        output_pk,
    )?;
    let sig = sign_sighash(&sighash, merch_close_sk)?;
    Ok(tx.finalize(vec![sig, merch_close_pk.serialize().to_vec()]))
}

/// Merchant sweeps the merch-close output after the self-delay.
pub fn merchant_sign_merch_claim_transaction(
    merch_close_txid_le: &[u8; 32],
    index: u32,
    input_amount: i64,
    claim_amount: i64,
    self_delay: u16,
    cust_pk: &PublicKey,
    merch_pk: &PublicKey,
    output_pk: &PublicKey,
    merch_close_sk: &SecretKey,
) -> ZkResult<SignedTransaction> {
    let merch_close_pk = public_key(merch_close_sk);
    let script = merch_close_redeem_script(merch_pk, cust_pk, &merch_close_pk, self_delay);
    let (sighash, tx) = single_output_spend(
        merch_close_txid_le,
        index,
        input_amount,
        claim_amount,
        script.clone(),
        Sequence::from_height(self_delay),
        output_pk,
    )?;
    let sig = sign_sighash(&sighash, merch_close_sk)?;
    Ok(tx.finalize(vec![sig, Vec::new(), script.into_bytes()]))
}

/// Penalty spend of a revoked cust-close output through the revocation
/// branch. Fails unless `rev_secret` opens `rev_lock`.
pub fn merchant_sign_dispute_transaction(
    close_txid_le: &[u8; 32],
    index: u32,
    input_amount: i64,
    claim_amount: i64,
    self_delay: u16,
    output_pk: &PublicKey,
    rev_lock: &[u8; 32],
    rev_secret: &[u8; 32],
    cust_close_pk: &PublicKey,
    merch_disp_sk: &SecretKey,
) -> ZkResult<SignedTransaction> {
    if !is_valid_rev_secret(rev_lock, rev_secret) {
        return Err(ZkChannelError::Validation(
            "revocation secret does not open the revocation lock".to_string(),
        ));
    }
    let merch_disp_pk = public_key(merch_disp_sk);
    let script = cust_close_redeem_script(rev_lock, &merch_disp_pk, cust_close_pk, self_delay)?;
    let (sighash, tx) = single_output_spend(
        close_txid_le,
        index,
        input_amount,
        claim_amount,
        script.clone(),
        Sequence::MAX,
        output_pk,
    )?;
    let sig = sign_sighash(&sighash, merch_disp_sk)?;
    Ok(tx.finalize(vec![sig, rev_secret.to_vec(), vec![0x01], script.into_bytes()]))
}

/////////////////////////////////// mutual close ///////////////////////////////////

/// Cooperative close: no timelocks, both balances paid directly.
pub fn form_mutual_close_transaction(
    escrow_txid_le: &[u8; 32],
    escrow_amount: i64,
    cust_pk: &PublicKey,
    merch_pk: &PublicKey,
    cust_close_pk: &PublicKey,
    merch_close_pk: &PublicKey,
    cust_bal: i64,
    merch_bal: i64,
) -> ZkResult<([u8; 32], SpendTx)> {
    let input = tx_input(escrow_txid_le, 0, Sequence::MAX);
    let outputs = vec![
        tx_output(cust_bal, p2wpkh_script_pubkey(cust_close_pk))?,
        tx_output(merch_bal, p2wpkh_script_pubkey(merch_close_pk))?,
    ];
    let fee = escrow_amount - checked_total(cust_bal, merch_bal)?;
    let tx = SpendTx::new(input, escrow_amount, escrow_redeem_script(merch_pk, cust_pk), outputs);
    tx.check_balance(fee)?;
    Ok((tx.sighash()?, tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hash_to_slice;

    fn pk(hex_str: &str) -> PublicKey {
        PublicKey::from_slice(&hex::decode(hex_str).unwrap()).unwrap()
    }

    fn keypair(b: u8) -> (SecretKey, PublicKey) {
        let sk = SecretKey::from_slice(&[b; 32]).unwrap();
        (sk, public_key(&sk))
    }

    fn close_pubkeys(rev_lock: [u8; 32]) -> ClosePublicKeys {
        ClosePublicKeys {
            cust_pk: keypair(1).1,
            cust_close_pk: keypair(2).1,
            merch_pk: keypair(3).1,
            merch_close_pk: keypair(4).1,
            merch_disp_pk: keypair(5).1,
            rev_lock: FixedSizeArray32(rev_lock),
        }
    }

    fn amounts() -> CloseAmounts {
        CloseAmounts {
            cust_bal: 1_000_000,
            merch_bal: 1_000_000,
            fee_cc: 1000,
            fee_mc: 1000,
            val_cpfp: 1000,
        }
    }

    #[test]
    fn escrow_redeem_script_matches_known_vector() {
        let merch_pk = pk("024596d7b33733c28101dbc6c85901dffaed0cdac63ab0b2ea141217d1990ad4b1");
        let cust_pk = pk("027160fb5e48252f02a00066dfa823d15844ad93e04f9c9b746e1f28ed4a1eaddb");
        let script = escrow_redeem_script(&merch_pk, &cust_pk);
        assert_eq!(
            hex::encode(script.as_bytes()),
            "5221024596d7b33733c28101dbc6c85901dffaed0cdac63ab0b2ea141217d1990ad4b121027160fb5e48252f02a00066dfa823d15844ad93e04f9c9b746e1f28ed4a1eaddb52ae"
        );
    }

    #[test]
    fn p2wsh_scriptpubkey_matches_known_vector() {
        let pubkey1 = pk("023da092f6980e58d2c037173180e9a465476026ee50f96695963e8efe436f54eb");
        let pubkey2 = pk("030e9f7b623d2ccc7c9bd44d66d5ce21ce504c0acf6385a132cec6d3c39fa711c1");
        let script = escrow_redeem_script(&pubkey1, &pubkey2);
        assert_eq!(
            hex::encode(p2wsh_script_pubkey(&script).as_bytes()),
            "0020c015c4a6be010e21657068fc2e6a9d02b27ebe4d490a25846f7237f104d1a3cd"
        );
    }

    #[test]
    fn delay_pushes_are_minimal() {
        let (_, cust_pk) = keypair(1);
        let (_, merch_pk) = keypair(3);
        let (_, merch_close_pk) = keypair(4);
        // OP_IF (1) + multisig (71) + OP_ELSE (1)
        let delay_at = 73;

        let script = merch_close_redeem_script(&merch_pk, &cust_pk, &merch_close_pk, 1487);
        assert_eq!(&script.as_bytes()[delay_at..delay_at + 5], &[0x02, 0xcf, 0x05, 0xb2, 0x75]);

        let script = merch_close_redeem_script(&merch_pk, &cust_pk, &merch_close_pk, 16);
        assert_eq!(&script.as_bytes()[delay_at..delay_at + 2], &[0x60, 0xb2]);

        let script = merch_close_redeem_script(&merch_pk, &cust_pk, &merch_close_pk, 128);
        assert_eq!(&script.as_bytes()[delay_at..delay_at + 4], &[0x02, 0x80, 0x00, 0xb2]);
    }

    #[test]
    fn escrow_tx_balances_with_change() {
        let (sk, cust_pk) = keypair(7);
        let (_, merch_pk) = keypair(8);
        let input = FundingInput {
            txid_le: [0x42; 32],
            index: 0,
            input_sats: 100_000_000,
            input_type: FundingInputType::P2shP2wpkh,
            sk,
        };
        let change = ChangeOutput::PublicKey(keypair(9).1);
        let escrow =
            sign_escrow_transaction(&input, &cust_pk, &merch_pk, &change, 1_000_000, 1_000_000, 1000)
                .unwrap();
        assert!(escrow.signed_tx.is_some());
        assert_eq!(escrow.prevout, compute_prevout(&escrow.txid_be, 0));

        let (_, unsigned) =
            form_escrow_transaction(&input, &cust_pk, &merch_pk, &change, 1_000_000, 1_000_000, 1000)
                .unwrap();
        assert_eq!(unsigned.output_amount(1), Some(100_000_000 - 2_000_000 - 1000));
        // nested segwit carries the redeem script push in script_sig
        assert_eq!(unsigned.tx.input[0].script_sig.len(), 23);
        // unsigned construction already fixes the txid
        assert_eq!(escrow_transaction_info(&unsigned).txid_le, escrow.txid_le);

        let too_small = FundingInput { input_sats: 1_500_000, ..input };
        assert!(form_escrow_transaction(&too_small, &cust_pk, &merch_pk, &change, 1_000_000, 1_000_000, 1000).is_err());
    }

    #[test]
    fn merch_close_requires_valid_customer_signature() {
        let (cust_sk, cust_pk) = keypair(1);
        let (merch_sk, merch_pk) = keypair(3);
        let (_, merch_close_pk) = keypair(4);
        let (sighash, tx) = form_merch_close_transaction(
            &[0x11; 32], &cust_pk, &merch_pk, &merch_close_pk, 1_000_000, 1_000_000, 1000, 1000, 1487,
        )
        .unwrap();
        assert_eq!(tx.output_amount(0), Some(2_000_000 - 2000));

        let cust_sig = customer_sign_merch_close_transaction(&cust_sk, &sighash).unwrap();
        let signed =
            merchant_sign_merch_close_transaction(tx.clone(), &cust_pk, &cust_sig, &merch_sk).unwrap();
        assert_eq!(signed.txid_le, tx.txid_le());

        // a signature by the wrong key is rejected
        let (other_sk, _) = keypair(12);
        let bad_sig = customer_sign_merch_close_transaction(&other_sk, &sighash).unwrap();
        assert!(merchant_sign_merch_close_transaction(tx, &cust_pk, &bad_sig, &merch_sk).is_err());
    }

    #[test]
    fn cust_close_outputs_and_amounts() {
        let keys = close_pubkeys([0x33; 32]);
        let a = amounts();
        let (_, from_escrow) = create_cust_close_transaction(&[0x21; 32], &keys, 1487, &a, true).unwrap();
        assert_eq!(from_escrow.input_amount, 2_000_000);
        assert_eq!(from_escrow.output_amount(0), Some(1_000_000 - 2000));
        assert_eq!(from_escrow.output_amount(1), Some(1_000_000));
        assert_eq!(from_escrow.output_amount(2), Some(0));
        let op_return = from_escrow.tx.output[2].script_pubkey.as_bytes();
        assert_eq!(op_return[0], 0x6a);
        assert_eq!(&op_return[2..34], &[0x33; 32]);
        assert_eq!(from_escrow.output_amount(3), Some(1000));

        let (_, from_merch) = create_cust_close_transaction(&[0x22; 32], &keys, 1487, &a, false).unwrap();
        assert_eq!(from_merch.input_amount, 2_000_000 - 2000);
        assert_eq!(from_merch.output_amount(1), Some(1_000_000 - 2000));

        let broke = CloseAmounts { cust_bal: 1500, ..a };
        match create_cust_close_transaction(&[0x21; 32], &keys, 1487, &broke, true) {
            Err(ZkChannelError::NegativeOutput(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn dispute_requires_matching_secret() {
        let secret = [0x55u8; 32];
        let rev_lock = hash_to_slice(&secret);
        let (disp_sk, _) = keypair(5);
        let (_, cust_close_pk) = keypair(2);
        let (_, out_pk) = keypair(6);

        let ok = merchant_sign_dispute_transaction(
            &[0x44; 32], 0, 997_000, 996_000, 1487, &out_pk, &rev_lock, &secret, &cust_close_pk, &disp_sk,
        );
        assert!(ok.is_ok());

        let wrong = merchant_sign_dispute_transaction(
            &[0x44; 32], 0, 997_000, 996_000, 1487, &out_pk, &rev_lock, &[0x56u8; 32], &cust_close_pk, &disp_sk,
        );
        assert!(wrong.is_err());
    }

    #[test]
    fn claim_cannot_exceed_input() {
        let (close_sk, _) = keypair(4);
        let (_, out_pk) = keypair(6);
        match merchant_sign_cust_claim_transaction(&[0x44; 32], 1, 1000, 1001, &out_pk, &close_sk) {
            Err(ZkChannelError::AmountMismatch { input: 1000, outputs: 1001, fee: -1 }) => (),
            other => panic!("unexpected: {:?}", other),
        }
        let ok = merchant_sign_cust_claim_transaction(&[0x44; 32], 1, 1000, 900, &out_pk, &close_sk).unwrap();
        assert!(!ok.tx.is_empty());
    }

    #[test]
    fn claim_inputs_carry_the_delay() {
        let (cust_close_sk, _) = keypair(2);
        let (_, merch_disp_pk) = keypair(5);
        let (_, out_pk) = keypair(6);
        let signed = customer_sign_claim_transaction(
            &[0x44; 32], 0, 997_000, 996_000, 1487, &out_pk, &[0x33; 32], &merch_disp_pk, &cust_close_sk,
        )
        .unwrap();
        // version(4) marker/flag(2) n_in(1) outpoint(36) script_sig(1) => sequence
        let seq = &signed.tx[44..48];
        assert_eq!(seq, &1487u32.to_le_bytes());
        assert_ne!(seq, &Sequence::MAX.0.to_le_bytes());
    }

    #[test]
    fn mutual_close_rejects_overspend() {
        let keys = close_pubkeys([0u8; 32]);
        let r = form_mutual_close_transaction(
            &[0x01; 32], 2_000_000, &keys.cust_pk, &keys.merch_pk, &keys.cust_close_pk,
            &keys.merch_close_pk, 1_500_000, 600_000,
        );
        assert!(r.is_err());
        let (_, tx) = form_mutual_close_transaction(
            &[0x01; 32], 2_000_000, &keys.cust_pk, &keys.merch_pk, &keys.cust_close_pk,
            &keys.merch_close_pk, 1_499_000, 500_000,
        )
        .unwrap();
        assert_eq!(tx.total_output().unwrap(), 1_999_000);
    }
}
