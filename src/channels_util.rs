use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{ZkChannelError, ZkResult};
use crate::fixed_size_array::FixedSizeArray32;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FundingTxInfo {
    pub init_cust_bal: i64,
    pub init_merch_bal: i64,
    pub escrow_txid: FixedSizeArray32, // big-endian
    pub escrow_prevout: FixedSizeArray32,
    pub merch_txid: FixedSizeArray32, // big-endian
    pub merch_prevout: FixedSizeArray32,
    pub fee_mc: i64,
    pub min_fee: i64,
    pub max_fee: i64,
}

/// Customer-side progress through the protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum ProtocolStatus {
    New,
    Initialized,
    Activated,
    Ready,
    PaymentInProgress,
    Closing,
    Closed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ChannelStatus {
    None,
    PendingOpen,
    Open,
    MerchantInitClose,
    CustomerInitClose,
    Disputed,
    PendingClose,
    ConfirmedClose,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        ChannelStatus::None
    }
}

impl ChannelStatus {
    pub fn can_transition_to(self, next: ChannelStatus) -> bool {
        use ChannelStatus::*;
        match (self, next) {
            (None, PendingOpen) => true,
            (PendingOpen, Open) => true,
            (Open, CustomerInitClose) | (Open, MerchantInitClose) | (Open, PendingClose) => true,
            (MerchantInitClose, CustomerInitClose) | (MerchantInitClose, PendingClose) => true,
            (CustomerInitClose, Disputed) | (CustomerInitClose, PendingClose) => true,
            (Disputed, PendingClose) => true,
            (PendingClose, ConfirmedClose) => true,
            _ => false,
        }
    }

    /// Checks `self => next` against the transition table.
    pub fn transition(self, next: ChannelStatus) -> ZkResult<ChannelStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ZkChannelError::TransitionNotAllowed {
                from: self,
                to: next,
            })
        }
    }

    /// Entries in these states may be dropped from bookkeeping.
    pub fn is_clearable(self) -> bool {
        self == ChannelStatus::None || self == ChannelStatus::ConfirmedClose
    }

    pub fn is_closing(self) -> bool {
        use ChannelStatus::*;
        match self {
            MerchantInitClose | CustomerInitClose | Disputed | PendingClose | ConfirmedClose => true,
            _ => false,
        }
    }
}

impl FromStr for ChannelStatus {
    type Err = ZkChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ChannelStatus::*;
        match s {
            "None" => Ok(None),
            "PendingOpen" => Ok(PendingOpen),
            "Open" => Ok(Open),
            "MerchantInitClose" => Ok(MerchantInitClose),
            "CustomerInitClose" => Ok(CustomerInitClose),
            "Disputed" => Ok(Disputed),
            "PendingClose" => Ok(PendingClose),
            "ConfirmedClose" => Ok(ConfirmedClose),
            _ => Err(ZkChannelError::Validation(format!(
                "unknown channel status: {:?}",
                s
            ))),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum PaymentStatus {
    Prepare,
    Update,
    Error,
}
