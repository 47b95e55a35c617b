//! Two-party computation for a payment round.
//!
//! The MPC engine is consumed as a black box through [`MpcCoordinator`]:
//! each party submits its private inputs under a shared session id and gets
//! back only its own masked outputs. [`LocalMpcCoordinator`] evaluates the
//! ideal functionality in-process once both parties have arrived, and
//! [`serve_mpc`] / [`TcpMpcCoordinator`] expose the same rendezvous over TCP.

use bufstream::BufStream;
use parking_lot::{Condvar, Mutex};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ZkChannelError, ZkResult};
use crate::fixed_size_array::{FixedSizeArray16, FixedSizeArray32, FixedSizeArray64};
use crate::transactions::btc::{cust_close_transactions_for_state, ClosePublicKeys};
use crate::transactions::sign_sighash_compact;
use crate::util::{compute_commitment, hmac_sign, hmac_verify, xor_in_place};
use crate::wallet::{balance_floor, State};
use crate::wire::ProtocolResponse;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomerMpcInput {
    pub old_state: State,
    pub new_state: State,
    pub old_pay_token: FixedSizeArray32,
    pub t: FixedSizeArray16,
    pub rev_lock_com: FixedSizeArray32,
    pub pay_token_mask_com: FixedSizeArray32,
    pub key_com: FixedSizeArray32,
    pub amount: i64,
    pub fee_cc: i64,
    pub val_cpfp: i64,
    pub bal_min_cust: i64,
    pub bal_min_merch: i64,
    pub self_delay: u16,
    pub cust_pk: PublicKey,
    pub cust_close_pk: PublicKey,
    pub merch_pk: PublicKey,
    pub merch_close_pk: PublicKey,
    pub merch_disp_pk: PublicKey,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MerchantMpcInput {
    pub nonce: FixedSizeArray16,
    pub rev_lock_com: FixedSizeArray32,
    pub pay_token_mask_com: FixedSizeArray32,
    pub amount: i64,
    pub key_com: FixedSizeArray32,
    pub hmac_key: FixedSizeArray64,
    pub key_com_r: FixedSizeArray16,
    pub pay_mask: FixedSizeArray32,
    pub pay_mask_r: FixedSizeArray16,
    pub escrow_mask: FixedSizeArray32,
    pub merch_mask: FixedSizeArray32,
    pub merch_sk: FixedSizeArray32,
    pub merch_close_pk: PublicKey,
    pub merch_disp_pk: PublicKey,
    pub val_cpfp: i64,
    pub bal_min_cust: i64,
    pub bal_min_merch: i64,
    pub self_delay: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PartyInputs {
    Customer(Box<CustomerMpcInput>),
    Merchant(Box<MerchantMpcInput>),
}

impl PartyInputs {
    fn party(&self) -> &'static str {
        match self {
            PartyInputs::Customer(_) => "customer",
            PartyInputs::Merchant(_) => "merchant",
        }
    }
}

/// Customer view: `s` halves of both close signatures and the pay token,
/// each XOR-masked with merchant-chosen masks.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskedMPCOutputs {
    pub pt_masked: FixedSizeArray32,
    pub escrow_masked: FixedSizeArray32,
    pub merch_masked: FixedSizeArray32,
}

/// Merchant view: the `r` halves of both close signatures.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MerchantMpcOutput {
    pub r_escrow_sig: FixedSizeArray32,
    pub r_merch_sig: FixedSizeArray32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MaskedResult {
    Customer(MaskedMPCOutputs),
    Merchant(MerchantMpcOutput),
}

pub trait MpcCoordinator: Send + Sync {
    fn execute(
        &self,
        session_id: &[u8; 16],
        inputs: PartyInputs,
        timeout: Duration,
    ) -> ZkResult<MaskedResult>;
}

fn fail(msg: &str) -> ZkChannelError {
    ZkChannelError::MpcFailure(msg.to_string())
}

fn split_signature(sig: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&sig[..32]);
    s.copy_from_slice(&sig[32..]);
    (r, s)
}

/// The function both parties jointly compute. Any failed check aborts the
/// round for both sides.
pub fn ideal_functionality(
    cust: &CustomerMpcInput,
    merch: &MerchantMpcInput,
) -> ZkResult<(MaskedMPCOutputs, MerchantMpcOutput)> {
    let hmac_key = merch.hmac_key.get_bytes();

    // 1. merchant key opens the published key commitment
    if compute_commitment(&hmac_key, &merch.key_com_r.0) != cust.key_com.0 || cust.key_com != merch.key_com {
        return Err(fail("hmac key does not open the key commitment"));
    }

    // 2. old pay token
    if !hmac_verify(&hmac_key, &cust.old_state.serialize_compact(), &cust.old_pay_token.0) {
        return Err(fail("invalid pay token for the old state"));
    }

    // 3. nonce
    if cust.old_state.nonce != merch.nonce {
        return Err(fail("old state nonce does not match the session nonce"));
    }

    // 4. rev lock commitment
    if compute_commitment(&cust.old_state.rev_lock.0, &cust.t.0) != cust.rev_lock_com.0
        || cust.rev_lock_com != merch.rev_lock_com
    {
        return Err(fail("rev_lock_com does not open to the old rev_lock"));
    }

    // 5. pay mask commitment
    if compute_commitment(&merch.pay_mask.0, &merch.pay_mask_r.0) != merch.pay_token_mask_com.0
        || cust.pay_token_mask_com != merch.pay_token_mask_com
    {
        return Err(fail("pay mask does not open the pay mask commitment"));
    }
    if cust.amount != merch.amount {
        return Err(fail("parties disagree on the payment amount"));
    }

    // 6. balance update rules
    let old = &cust.old_state;
    let new = &cust.new_state;
    if !old.is_successor(new, cust.amount)? {
        return Err(fail("new state is not a valid successor of the old state"));
    }
    if cust.fee_cc < new.min_fee || cust.fee_cc > new.max_fee {
        return Err(fail("fee_cc outside of the agreed fee range"));
    }
    if cust.val_cpfp != merch.val_cpfp
        || cust.bal_min_cust != merch.bal_min_cust
        || cust.bal_min_merch != merch.bal_min_merch
        || cust.self_delay != merch.self_delay
    {
        return Err(fail("parties disagree on channel fee parameters"));
    }
    if new.bc < balance_floor(&[merch.bal_min_cust, cust.fee_cc, merch.val_cpfp])?
        || new.bm < balance_floor(&[merch.bal_min_merch, new.fee_mc, merch.val_cpfp])?
    {
        return Err(fail("new balances fall below the channel minimums"));
    }

    // 7. sign the new cust-close txs under the merchant's keys
    let merch_sk = SecretKey::from_slice(&merch.merch_sk.0)?;
    let secp = Secp256k1::signing_only();
    let merch_pk = PublicKey::from_secret_key(&secp, &merch_sk);
    if merch_pk != cust.merch_pk
        || merch.merch_close_pk != cust.merch_close_pk
        || merch.merch_disp_pk != cust.merch_disp_pk
    {
        return Err(fail("parties disagree on merchant public keys"));
    }
    let pubkeys = ClosePublicKeys {
        cust_pk: cust.cust_pk,
        cust_close_pk: cust.cust_close_pk,
        merch_pk,
        merch_close_pk: merch.merch_close_pk,
        merch_disp_pk: merch.merch_disp_pk,
        rev_lock: new.rev_lock,
    };
    let txs = cust_close_transactions_for_state(new, &pubkeys, merch.self_delay, cust.fee_cc, merch.val_cpfp)?;
    let (r_escrow, mut s_escrow) = split_signature(&sign_sighash_compact(&txs.escrow_sighash, &merch_sk)?);
    let (r_merch, mut s_merch) = split_signature(&sign_sighash_compact(&txs.merch_sighash, &merch_sk)?);

    let mut pay_token = hmac_sign(&hmac_key, &new.serialize_compact())?;
    xor_in_place(&mut pay_token, &merch.pay_mask.0);
    xor_in_place(&mut s_escrow, &merch.escrow_mask.0);
    xor_in_place(&mut s_merch, &merch.merch_mask.0);

    Ok((
        MaskedMPCOutputs {
            pt_masked: FixedSizeArray32(pay_token),
            escrow_masked: FixedSizeArray32(s_escrow),
            merch_masked: FixedSizeArray32(s_merch),
        },
        MerchantMpcOutput {
            r_escrow_sig: FixedSizeArray32(r_escrow),
            r_merch_sig: FixedSizeArray32(r_merch),
        },
    ))
}

#[derive(Default)]
struct Rendezvous {
    customer: Option<CustomerMpcInput>,
    merchant: Option<MerchantMpcInput>,
    customer_result: Option<ZkResult<MaskedMPCOutputs>>,
    merchant_result: Option<ZkResult<MerchantMpcOutput>>,
    evaluated: bool,
}

impl Rendezvous {
    fn take_result(&mut self, customer: bool) -> Option<ZkResult<MaskedResult>> {
        if customer {
            self.customer_result
                .take()
                .map(|r| r.map(MaskedResult::Customer))
        } else {
            self.merchant_result
                .take()
                .map(|r| r.map(MaskedResult::Merchant))
        }
    }

    fn is_drained(&self) -> bool {
        self.evaluated && self.customer_result.is_none() && self.merchant_result.is_none()
    }
}

/// In-process ideal functionality: both parties call `execute` with the same
/// session id (typically from two threads) and each blocks until the other
/// arrives or the timeout expires.
#[derive(Default)]
pub struct LocalMpcCoordinator {
    sessions: Mutex<HashMap<String, Rendezvous>>,
    arrived: Condvar,
}

impl LocalMpcCoordinator {
    pub fn new() -> Self {
        LocalMpcCoordinator::default()
    }

    /// Number of sessions waiting for a counterpart.
    pub fn pending_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl MpcCoordinator for LocalMpcCoordinator {
    fn execute(
        &self,
        session_id: &[u8; 16],
        inputs: PartyInputs,
        timeout: Duration,
    ) -> ZkResult<MaskedResult> {
        let key = hex::encode(session_id);
        let is_customer = match inputs {
            PartyInputs::Customer(_) => true,
            PartyInputs::Merchant(_) => false,
        };
        let deadline = Instant::now() + timeout;
        debug!(session = %key, party = inputs.party(), "joining mpc session");

        let mut sessions = self.sessions.lock();
        {
            let slot = sessions.entry(key.clone()).or_insert_with(Rendezvous::default);
            if slot.evaluated {
                return Err(fail("mpc session already evaluated"));
            }
            match inputs {
                PartyInputs::Customer(c) => {
                    if slot.customer.is_some() {
                        return Err(fail("customer already joined this session"));
                    }
                    slot.customer = Some(*c);
                }
                PartyInputs::Merchant(m) => {
                    if slot.merchant.is_some() {
                        return Err(fail("merchant already joined this session"));
                    }
                    slot.merchant = Some(*m);
                }
            }

            if let (Some(c), Some(m)) = (slot.customer.take(), slot.merchant.take()) {
                match ideal_functionality(&c, &m) {
                    Ok((cust_out, merch_out)) => {
                        slot.customer_result = Some(Ok(cust_out));
                        slot.merchant_result = Some(Ok(merch_out));
                    }
                    Err(e) => {
                        warn!(session = %key, error = %e, "mpc evaluation failed");
                        slot.customer_result = Some(Err(ZkChannelError::MpcFailure(e.to_string())));
                        slot.merchant_result = Some(Err(ZkChannelError::MpcFailure(e.to_string())));
                    }
                }
                slot.evaluated = true;
                self.arrived.notify_all();
            }
        }

        loop {
            let result = match sessions.get_mut(&key) {
                Some(slot) => slot.take_result(is_customer),
                None => return Err(ZkChannelError::MpcTimeout(key)),
            };
            if let Some(r) = result {
                if sessions.get(&key).map(|s| s.is_drained()).unwrap_or(false) {
                    sessions.remove(&key);
                }
                return r;
            }
            if self.arrived.wait_until(&mut sessions, deadline).timed_out() {
                let late = sessions.get_mut(&key).and_then(|s| s.take_result(is_customer));
                if let Some(r) = late {
                    if sessions.get(&key).map(|s| s.is_drained()).unwrap_or(false) {
                        sessions.remove(&key);
                    }
                    return r;
                }
                sessions.remove(&key);
                warn!(session = %key, "mpc session timed out");
                return Err(ZkChannelError::MpcTimeout(key));
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MpcRequest {
    session_id: FixedSizeArray16,
    timeout_ms: u64,
    inputs: PartyInputs,
}

/// Client side of [`serve_mpc`].
pub struct TcpMpcCoordinator {
    pub addr: String,
}

impl TcpMpcCoordinator {
    pub fn new(addr: String) -> Self {
        TcpMpcCoordinator { addr }
    }
}

impl MpcCoordinator for TcpMpcCoordinator {
    fn execute(
        &self,
        session_id: &[u8; 16],
        inputs: PartyInputs,
        timeout: Duration,
    ) -> ZkResult<MaskedResult> {
        let stream = TcpStream::connect(&self.addr)?;
        // leave the server room to report its own timeout
        stream.set_read_timeout(Some(timeout + Duration::from_secs(5)))?;
        let mut buf_stream = BufStream::new(stream);

        let req = MpcRequest {
            session_id: FixedSizeArray16(*session_id),
            timeout_ms: timeout.as_millis() as u64,
            inputs,
        };
        let mut line = serde_json::to_string(&req)?;
        line.push('\n');
        buf_stream.write_all(line.as_bytes())?;
        buf_stream.flush()?;

        let mut reply = String::new();
        if let Err(e) = buf_stream.read_line(&mut reply) {
            return match e.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                    Err(ZkChannelError::MpcTimeout(hex::encode(session_id)))
                }
                _ => Err(e.into()),
            };
        }
        let resp: ProtocolResponse<MaskedResult> = serde_json::from_str(reply.trim_end())?;
        match resp.into_result() {
            Err(ZkChannelError::Remote(e)) if e.contains("timed out") => {
                Err(ZkChannelError::MpcTimeout(hex::encode(session_id)))
            }
            Err(ZkChannelError::Remote(e)) => Err(ZkChannelError::MpcFailure(e)),
            other => other,
        }
    }
}

fn handle_mpc_connection(stream: TcpStream, coordinator: Arc<LocalMpcCoordinator>) -> ZkResult<()> {
    let mut buf_stream = BufStream::new(stream);
    let mut line = String::new();
    buf_stream.read_line(&mut line)?;
    let resp: ProtocolResponse<MaskedResult> = match serde_json::from_str::<MpcRequest>(line.trim_end()) {
        Ok(req) => coordinator
            .execute(
                &req.session_id.0,
                req.inputs,
                Duration::from_millis(req.timeout_ms),
            )
            .into(),
        Err(e) => ProtocolResponse::err(e.to_string()),
    };
    let mut out = serde_json::to_string(&resp)?;
    out.push('\n');
    buf_stream.write_all(out.as_bytes())?;
    buf_stream.flush()?;
    Ok(())
}

/// Accepts MPC parties forever, one thread per connection.
pub fn serve_mpc(listener: TcpListener, coordinator: Arc<LocalMpcCoordinator>) -> ZkResult<()> {
    info!(addr = ?listener.local_addr().ok(), "mpc server listening");
    for stream in listener.incoming() {
        let stream = stream?;
        let coordinator = coordinator.clone();
        thread::spawn(move || {
            if let Err(e) = handle_mpc_connection(stream, coordinator) {
                warn!(error = %e, "mpc connection failed");
            }
        });
    }
    Ok(())
}
