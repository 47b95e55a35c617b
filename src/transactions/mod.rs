//! Segwit (v0) transaction assembly on top of `bitcoin`.
//!
//! Every protocol transaction spends a single input. [`SpendTx`] carries the
//! `bitcoin::Transaction` together with the spent amount and the BIP143
//! script code, so the sighash can be recomputed by either party. Txids are
//! reported in two byte orders: `txid_be` is the raw double-SHA256 of the
//! stripped serialization (the order used inside outpoints), `txid_le` is the
//! reversed display order.

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

use crate::error::{ZkChannelError, ZkResult};
use crate::util::reverse_bytes;

pub mod btc;

pub const TX_VERSION: i32 = 2;

/// An unsigned single-input spend.
#[derive(Clone, Debug, PartialEq)]
pub struct SpendTx {
    pub tx: Transaction,
    pub input_amount: i64,
    pub script_code: ScriptBuf,
}

/// A fully signed transaction ready for broadcast.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub tx: Vec<u8>,
    pub txid_be: [u8; 32],
    pub txid_le: [u8; 32],
}

impl SignedTransaction {
    pub fn to_hex(&self) -> String {
        hex::encode(&self.tx)
    }
}

/// Outpoint for a txid given in display (little-endian) order.
pub fn outpoint(prev_txid_le: &[u8; 32], index: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array(reverse_bytes(prev_txid_le)),
        vout: index,
    }
}

pub fn tx_input(prev_txid_le: &[u8; 32], index: u32, sequence: Sequence) -> TxIn {
    TxIn {
        previous_output: outpoint(prev_txid_le, index),
        script_sig: ScriptBuf::new(),
        sequence,
        witness: Witness::new(),
    }
}

/// Output of `amount` satoshis; negative amounts are rejected.
pub fn tx_output(amount: i64, script_pubkey: ScriptBuf) -> ZkResult<TxOut> {
    if amount < 0 {
        return Err(ZkChannelError::NegativeOutput(amount));
    }
    Ok(TxOut {
        value: amount as u64,
        script_pubkey,
    })
}

impl SpendTx {
    pub fn new(input: TxIn, input_amount: i64, script_code: ScriptBuf, outputs: Vec<TxOut>) -> Self {
        SpendTx {
            tx: Transaction {
                version: TX_VERSION,
                lock_time: LockTime::ZERO,
                input: vec![input],
                output: outputs,
            },
            input_amount,
            script_code,
        }
    }

    pub fn output_amount(&self, index: usize) -> Option<i64> {
        self.tx.output.get(index).map(|o| o.value as i64)
    }

    pub fn total_output(&self) -> ZkResult<i64> {
        let mut total: i64 = 0;
        for o in self.tx.output.iter() {
            total = total
                .checked_add(o.value as i64)
                .ok_or_else(|| ZkChannelError::Validation("amount overflow".to_string()))?;
        }
        Ok(total)
    }

    /// Requires `input = sum(outputs) + fee` exactly.
    pub fn check_balance(&self, fee: i64) -> ZkResult<()> {
        let outputs = self.total_output()?;
        if fee < 0 || outputs.checked_add(fee) != Some(self.input_amount) {
            return Err(ZkChannelError::AmountMismatch {
                input: self.input_amount,
                outputs,
                fee,
            });
        }
        Ok(())
    }

    /// BIP143 digest (SIGHASH_ALL) of the single input.
    pub fn sighash(&self) -> ZkResult<[u8; 32]> {
        if self.input_amount < 0 {
            return Err(ZkChannelError::NegativeOutput(self.input_amount));
        }
        let sighash = SighashCache::new(&self.tx)
            .segwit_signature_hash(
                0,
                &self.script_code,
                self.input_amount as u64,
                EcdsaSighashType::All,
            )
            .map_err(|e| ZkChannelError::Validation(format!("sighash failed: {}", e)))?;
        Ok(sighash.to_byte_array())
    }

    pub fn txid_be(&self) -> [u8; 32] {
        self.tx.txid().to_byte_array()
    }

    pub fn txid_le(&self) -> [u8; 32] {
        reverse_bytes(&self.txid_be())
    }

    /// Attaches the witness stack and serializes.
    pub fn finalize(mut self, witness: Vec<Vec<u8>>) -> SignedTransaction {
        self.tx.input[0].witness = Witness::from_slice(&witness);
        finalize_transaction(&self.tx)
    }
}

pub fn finalize_transaction(tx: &Transaction) -> SignedTransaction {
    let txid_be = tx.txid().to_byte_array();
    SignedTransaction {
        tx: encode::serialize(tx),
        txid_be,
        txid_le: reverse_bytes(&txid_be),
    }
}

fn sighash_type_byte() -> u8 {
    EcdsaSighashType::All.to_u32() as u8
}

/// Signs a sighash digest, returning `DER || SIGHASH_ALL`.
pub fn sign_sighash(sighash: &[u8; 32], sk: &SecretKey) -> ZkResult<Vec<u8>> {
    let secp = Secp256k1::signing_only();
    let msg = Message::from_slice(sighash)?;
    Ok(encode_signature(&secp.sign_ecdsa(&msg, sk)))
}

/// Signs a sighash digest, returning the 64-byte compact `r || s` form.
pub fn sign_sighash_compact(sighash: &[u8; 32], sk: &SecretKey) -> ZkResult<[u8; 64]> {
    let secp = Secp256k1::signing_only();
    let msg = Message::from_slice(sighash)?;
    Ok(secp.sign_ecdsa(&msg, sk).serialize_compact())
}

/// Parses `DER || SIGHASH_ALL`.
pub fn decode_signature(sig: &[u8]) -> ZkResult<Signature> {
    match sig.split_last() {
        Some((flag, der)) if *flag == sighash_type_byte() => Ok(Signature::from_der(der)?),
        Some((flag, _)) => Err(ZkChannelError::InvalidSignature(format!(
            "unsupported sighash flag: {:#04x}",
            flag
        ))),
        None => Err(ZkChannelError::InvalidSignature("empty signature".to_string())),
    }
}

pub fn encode_signature(sig: &Signature) -> Vec<u8> {
    let mut out = sig.serialize_der().to_vec();
    out.push(sighash_type_byte());
    out
}

pub fn verify_sighash_signature(sighash: &[u8; 32], sig: &Signature, pk: &PublicKey) -> ZkResult<()> {
    let secp = Secp256k1::verification_only();
    let msg = Message::from_slice(sighash)?;
    secp.verify_ecdsa(&msg, sig, pk)
        .map_err(|e| ZkChannelError::InvalidSignature(e.to_string()))
}

/// The script code of a P2WPKH spend (the P2PKH template).
pub fn p2pkh_script_code(pk: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::hash(&pk.serialize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend(amount: i64) -> SpendTx {
        let input = tx_input(&[1u8; 32], 0, Sequence::MAX);
        let out = tx_output(amount, ScriptBuf::new()).unwrap();
        SpendTx::new(input, 10_000, ScriptBuf::new(), vec![out])
    }

    #[test]
    fn balance_check_is_exact() {
        let tx = spend(9_000);
        assert!(tx.check_balance(1_000).is_ok());
        match tx.check_balance(999) {
            Err(ZkChannelError::AmountMismatch { input, outputs, fee }) => {
                assert_eq!((input, outputs, fee), (10_000, 9_000, 999));
            }
            other => panic!("unexpected: {:?}", other),
        }

        match tx_output(-1, ScriptBuf::new()) {
            Err(ZkChannelError::NegativeOutput(-1)) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn outpoint_uses_internal_byte_order() {
        let mut txid_le = [0u8; 32];
        txid_le[0] = 0xaa;
        let op = outpoint(&txid_le, 3);
        assert_eq!(op.txid.to_byte_array()[31], 0xaa);
        // display order of a Txid is the little-endian form
        assert_eq!(op.txid.to_string(), hex::encode(txid_le));
        assert_eq!(op.vout, 3);
    }

    #[test]
    fn txid_ignores_witness() {
        let tx = spend(4_000);
        let txid = tx.txid_be();
        let unsigned = encode::serialize(&tx.tx);
        let signed = tx.clone().finalize(vec![vec![0x01, 0x02], vec![]]);
        assert_eq!(txid, signed.txid_be);
        assert_ne!(unsigned, signed.tx);
        // marker and flag follow the version
        assert_eq!(&signed.tx[4..6], &[0x00, 0x01]);
        assert_eq!(signed.txid_le, reverse_bytes(&txid));
    }

    #[test]
    fn sighash_commits_to_the_input_amount() {
        let tx = spend(9_000);
        let mut other = tx.clone();
        other.input_amount = 10_001;
        assert_ne!(tx.sighash().unwrap(), other.sighash().unwrap());
    }

    #[test]
    fn signatures_roundtrip_through_der() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x11u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let sighash = spend(9_000).sighash().unwrap();

        let sig_bytes = sign_sighash(&sighash, &sk).unwrap();
        assert_eq!(*sig_bytes.last().unwrap(), 0x01);
        let sig = decode_signature(&sig_bytes).unwrap();
        assert!(verify_sighash_signature(&sighash, &sig, &pk).is_ok());
        assert!(verify_sighash_signature(&[7u8; 32], &sig, &pk).is_err());

        let mut bad_flag = sig_bytes.clone();
        *bad_flag.last_mut().unwrap() = 0x03;
        assert!(decode_signature(&bad_flag).is_err());
    }
}
