use thiserror::Error;

use crate::channels_util::ChannelStatus;

/// Errors surfaced by the channel protocol.
///
/// Validation failures never mutate state and may be retried with corrected
/// input. Sequence errors name the offending status so callers can tell an
/// illegal transition from a transient failure.
#[derive(Debug, Error)]
pub enum ZkChannelError {
    #[error("transition not allowed: `{from}` => `{to}`")]
    TransitionNotAllowed { from: ChannelStatus, to: ChannelStatus },

    #[error("invalid status for {op}(): {status}")]
    InvalidStatus { op: &'static str, status: String },

    #[error("a payment is already in progress for this channel")]
    PaymentInProgress,

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("amount mismatch: input {input} != outputs {outputs} + fee {fee}")]
    AmountMismatch { input: i64, outputs: i64, fee: i64 },

    #[error("output amount cannot be negative: {0}")]
    NegativeOutput(i64),

    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("mpc session {0} timed out")]
    MpcTimeout(String),

    #[error("mpc execution failed: {0}")]
    MpcFailure(String),

    #[error("channel {0} is quarantined")]
    Quarantined(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("secp256k1 error: {0}")]
    Secp256k1(#[from] secp256k1::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for ZkChannelError {
    fn from(e: redis::RedisError) -> Self {
        ZkChannelError::Database(e.to_string())
    }
}

pub type ZkResult<T> = Result<T, ZkChannelError>;

/// Bails out of the current function with a `Validation` error when the
/// condition does not hold.
#[macro_export]
macro_rules! ensure_valid {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::ZkChannelError::Validation(format!($($arg)+)));
        }
    };
}
