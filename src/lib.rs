//! zkChannels protocol core: anonymous payment channels between a customer
//! and a merchant over a Bitcoin-style escrow.
//!
//! The customer holds a signed state and a pay token; each payment runs a
//! two-party computation that yields merchant signatures on the customer's
//! next closing transactions and a fresh pay token, without revealing to the
//! merchant which channel paid. Revoked states can be punished on chain.
//!
//! The entry points for callers are in [`mpc`] (one function per protocol
//! step) and [`service`] (a concurrent merchant front end).
#![allow(clippy::too_many_arguments)]

#[macro_use]
extern crate enum_display_derive;

#[cfg(test)]
#[macro_use]
extern crate rusty_fork;

#[macro_use]
pub mod error;

pub mod channels_mpc;
pub mod channels_util;
pub mod database;
pub mod fixed_size_array;
pub mod mpc;
pub mod mpc_session;
pub mod service;
pub mod transactions;
pub mod util;
pub mod wallet;
pub mod wire;

#[cfg(test)]
mod test_e2e;

pub use error::{ZkChannelError, ZkResult};
pub use fixed_size_array::{FixedSizeArray16, FixedSizeArray32, FixedSizeArray64};
pub use service::MerchantService;
