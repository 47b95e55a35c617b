//! Customer <-> merchant messages.
//!
//! Every message is a serde JSON document; byte arrays travel as hex
//! strings and balances as JSON integers. Replies are wrapped in
//! [`ProtocolResponse`], whose `error` field short-circuits handling on the
//! receiving side before any state is touched.

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::channels_mpc::{ChannelMPCState, ChannelMPCToken, InitCustState, RevokedState};
use crate::channels_util::ChannelStatus;
use crate::database::MaskedTxMPCInputs;
use crate::error::{ZkChannelError, ZkResult};
use crate::fixed_size_array::{FixedSizeArray16, FixedSizeArray32};
use crate::wallet::State;

pub const WIRE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolResponse<T> {
    pub payload: Option<T>,
    pub error: String,
}

impl<T> ProtocolResponse<T> {
    pub fn ok(payload: T) -> Self {
        ProtocolResponse {
            payload: Some(payload),
            error: String::new(),
        }
    }

    pub fn err(error: String) -> Self {
        ProtocolResponse {
            payload: None,
            error,
        }
    }

    pub fn is_err(&self) -> bool {
        !self.error.is_empty()
    }

    pub fn into_result(self) -> ZkResult<T> {
        if !self.error.is_empty() {
            return Err(ZkChannelError::Remote(self.error));
        }
        self.payload
            .ok_or_else(|| ZkChannelError::Remote("response carried no payload".to_string()))
    }
}

impl<T> From<ZkResult<T>> for ProtocolResponse<T> {
    fn from(r: ZkResult<T>) -> Self {
        match r {
            Ok(p) => ProtocolResponse::ok(p),
            Err(e) => ProtocolResponse::err(e.to_string()),
        }
    }
}

/// One step of the two-party protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum ProtocolMessage {
    /// merchant -> customer: channel parameters and escrow key
    ChannelOffer {
        version: u32,
        channel_state: ChannelMPCState,
        pk_m: PublicKey,
    },
    /// customer -> merchant
    InitialState {
        channel_token: ChannelMPCToken,
        init_state: InitCustState,
        init_hash: FixedSizeArray32,
    },
    /// customer -> merchant: signature on merch-close, with the balances and
    /// keys it was formed from
    MerchCloseSignature {
        escrow_txid_le: FixedSizeArray32,
        init_state: InitCustState,
        fee_cc: i64,
        cust_sig: String,
    },
    /// merchant -> customer: signatures on the initial cust-close txs
    InitCustCloseSignatures {
        escrow_sig: String,
        merch_sig: String,
    },
    ActivateRequest {
        channel_token: ChannelMPCToken,
        s0: State,
    },
    PayToken0 {
        pay_token: FixedSizeArray32,
    },
    PaymentRequest {
        session_id: FixedSizeArray16,
        nonce: FixedSizeArray16,
        rev_lock_com: FixedSizeArray32,
        amount: i64,
        justification: Option<String>,
    },
    PayMaskCommitment {
        pay_token_mask_com: FixedSizeArray32,
    },
    MaskedTxInputs {
        session_id: FixedSizeArray16,
        masks: MaskedTxMPCInputs,
    },
    Revocation {
        session_id: FixedSizeArray16,
        rev_state: RevokedState,
    },
    PayTokenMask {
        pt_mask: FixedSizeArray32,
        pt_mask_r: FixedSizeArray16,
    },
    MutualCloseSignature {
        escrow_txid_le: FixedSizeArray32,
        cust_close_pk: PublicKey,
        state: State,
        pay_token: FixedSizeArray32,
        cust_bal: i64,
        merch_bal: i64,
        cust_sig: String,
    },
    StatusUpdate {
        escrow_txid_le: FixedSizeArray32,
        status: ChannelStatus,
    },
}

impl ProtocolMessage {
    /// Unpacks a channel offer, rejecting any other message and any offer
    /// made under a different wire version.
    pub fn into_channel_offer(self) -> ZkResult<(ChannelMPCState, PublicKey)> {
        match self {
            ProtocolMessage::ChannelOffer {
                version,
                channel_state,
                pk_m,
            } => {
                check_wire_version(version)?;
                Ok((channel_state, pk_m))
            }
            _ => Err(ZkChannelError::Validation("expected a channel offer".to_string())),
        }
    }
}

pub fn check_wire_version(version: u32) -> ZkResult<()> {
    if version != WIRE_VERSION {
        return Err(ZkChannelError::Validation(format!(
            "unsupported wire version {} (expected {})",
            version, WIRE_VERSION
        )));
    }
    Ok(())
}
