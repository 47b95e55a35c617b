use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ZkChannelError, ZkResult};
use crate::fixed_size_array::{FixedSizeArray16, FixedSizeArray32};
use crate::util::hash_to_slice;

pub const NONCE_LEN: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub nonce: FixedSizeArray16, // 128-bits
    pub rev_lock: FixedSizeArray32,
    pub bc: i64,
    pub bm: i64,
    pub escrow_txid: FixedSizeArray32,
    pub escrow_prevout: FixedSizeArray32,
    pub merch_txid: FixedSizeArray32,
    pub merch_prevout: FixedSizeArray32,
    pub min_fee: i64,
    pub max_fee: i64,
    pub fee_mc: i64,
}

impl State {
    pub fn serialize_compact(&self) -> Vec<u8> {
        let mut output_buf = Vec::with_capacity(NONCE_LEN + 32 * 5 + 8 * 5);
        output_buf.extend_from_slice(&self.nonce.0);
        output_buf.extend_from_slice(&self.rev_lock.0);
        output_buf.extend_from_slice(&self.bc.to_be_bytes());
        output_buf.extend_from_slice(&self.bm.to_be_bytes());
        output_buf.extend_from_slice(&self.merch_txid.0);
        output_buf.extend_from_slice(&self.escrow_txid.0);
        output_buf.extend_from_slice(&self.merch_prevout.0);
        output_buf.extend_from_slice(&self.escrow_prevout.0);
        output_buf.extend_from_slice(&self.min_fee.to_be_bytes());
        output_buf.extend_from_slice(&self.max_fee.to_be_bytes());
        output_buf.extend_from_slice(&self.fee_mc.to_be_bytes());
        output_buf
    }

    pub fn compute_hash(&self) -> [u8; 32] {
        hash_to_slice(&self.serialize_compact())
    }

    pub fn get_nonce(&self) -> [u8; NONCE_LEN] {
        self.nonce.0
    }

    pub fn get_rev_lock(&self) -> [u8; 32] {
        self.rev_lock.0
    }

    /// Balances `(bc, bm)` after the customer pays `amount` to the merchant.
    pub fn apply_payment(&self, amount: i64) -> ZkResult<(i64, i64)> {
        match (self.bc.checked_sub(amount), self.bm.checked_add(amount)) {
            (Some(bc), Some(bm)) => Ok((bc, bm)),
            _ => Err(ZkChannelError::Validation(format!(
                "payment of {} overflows balances {}/{}",
                amount, self.bc, self.bm
            ))),
        }
    }

    /// True when `next` differs from `self` only in the fields a payment of
    /// `amount` is allowed to change.
    pub fn is_successor(&self, next: &State, amount: i64) -> ZkResult<bool> {
        let (bc, bm) = self.apply_payment(amount)?;
        Ok(next.bc == bc
            && next.bm == bm
            && next.escrow_txid == self.escrow_txid
            && next.escrow_prevout == self.escrow_prevout
            && next.merch_txid == self.merch_txid
            && next.merch_prevout == self.merch_prevout
            && next.min_fee == self.min_fee
            && next.max_fee == self.max_fee
            && next.fee_mc == self.fee_mc
            && next.nonce != self.nonce
            && next.rev_lock != self.rev_lock)
    }
}

/// Sum of the components of a balance floor.
pub fn balance_floor(parts: &[i64]) -> ZkResult<i64> {
    parts.iter().try_fold(0i64, |acc, p| {
        acc.checked_add(*p)
            .ok_or_else(|| ZkChannelError::Validation("balance floor overflows".to_string()))
    })
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "State : (\nnonce={}\nrev_lock={}\nbc={}\nbm={}\nescrow_txid={}\nescrow_prevout={}\nmerch_txid={}\nmerch_prevout={}\nmin_fee={}\nmax_fee={}\nfee_mc={}\n)",
            self.nonce,
            self.rev_lock,
            self.bc,
            self.bm,
            self.escrow_txid,
            self.escrow_prevout,
            self.merch_txid,
            self.merch_prevout,
            self.min_fee,
            self.max_fee,
            self.fee_mc
        )
    }
}
