use redis::{Commands, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::channels_util::{ChannelStatus, PaymentStatus};
use crate::error::{ZkChannelError, ZkResult};
use crate::fixed_size_array::{FixedSizeArray16, FixedSizeArray32};
use crate::wallet::State;

fn create_db_connection(url: &str) -> redis::RedisResult<Connection> {
    let client = redis::Client::open(url)?;
    let con = client.get_connection()?;

    Ok(con)
}

/// Everything the merchant learns about a payment round before the MPC runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub nonce: FixedSizeArray16,
    pub rev_lock_com: FixedSizeArray32,
    pub amount: i64,
    pub status: PaymentStatus,
}

/// Merchant-side MPC inputs released to the customer after a successful round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskedMPCInputs {
    pub pt_mask: FixedSizeArray32,
    pub pt_mask_r: FixedSizeArray16,
    pub escrow_mask: FixedSizeArray32,
    pub merch_mask: FixedSizeArray32,
    pub r_escrow_sig: FixedSizeArray32,
    pub r_merch_sig: FixedSizeArray32,
}

impl MaskedMPCInputs {
    pub fn get_tx_masks(&self) -> MaskedTxMPCInputs {
        MaskedTxMPCInputs {
            escrow_mask: self.escrow_mask,
            merch_mask: self.merch_mask,
            r_escrow_sig: self.r_escrow_sig,
            r_merch_sig: self.r_merch_sig,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaskedTxMPCInputs {
    pub escrow_mask: FixedSizeArray32,
    pub merch_mask: FixedSizeArray32,
    pub r_escrow_sig: FixedSizeArray32,
    pub r_merch_sig: FixedSizeArray32,
}

impl MaskedTxMPCInputs {
    pub fn get_escrow_mask(&self) -> [u8; 32] {
        self.escrow_mask.0
    }

    pub fn get_merch_mask(&self) -> [u8; 32] {
        self.merch_mask.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayMaskMap {
    pub mask: FixedSizeArray32,
    pub r: FixedSizeArray16,
}

/// Merchant bookkeeping. All keys are hex strings.
///
/// Channel status is kept as raw strings so that a corrupt record can be
/// detected and the channel quarantined rather than failing every read.
pub trait StateDatabase: Send {
    fn new(prefix: &str, url: String) -> ZkResult<Self>
    where
        Self: Sized;
    fn is_connected(&mut self) -> ZkResult<()>;

    // sessions
    fn check_session_id(&mut self, session_id: &String) -> ZkResult<bool>;
    /// Returns false (and stores nothing) if the session id already exists.
    fn save_new_session_state(&mut self, session_id: &String, session: &SessionState) -> ZkResult<bool>;
    fn load_session_state(&mut self, session_id: &String) -> ZkResult<SessionState>;
    fn update_session_state(&mut self, session_id: &String, session: &SessionState) -> ZkResult<()>;
    fn clear_session_state(&mut self, session_id: &String) -> ZkResult<()>;

    // nonce => session id
    /// Binds a nonce to a session. Returns false if the nonce is already
    /// bound to a different session.
    fn bind_nonce_to_session(&mut self, nonce: &String, session_id: &String) -> ZkResult<bool>;
    fn get_session_for_nonce(&mut self, nonce: &String) -> ZkResult<Option<String>>;
    fn unbind_nonce(&mut self, nonce: &String) -> ZkResult<()>;

    // spent map: nonce => rev_lock
    fn update_spent_map(&mut self, nonce: &String, rev_lock: &String) -> ZkResult<bool>;
    fn check_spent_map(&mut self, nonce: &String) -> ZkResult<bool>;

    // rev lock map: rev_lock => rev_secret
    fn update_rev_lock_map(&mut self, rev_lock: &String, rev_secret: &String) -> ZkResult<bool>;
    fn check_rev_lock_map(&mut self, rev_lock: &String) -> ZkResult<bool>;
    fn get_rev_secret(&mut self, rev_lock: &String) -> ZkResult<Option<String>>;

    // unlink set
    fn update_unlink_set(&mut self, nonce: &String) -> ZkResult<bool>;
    fn get_unlink_set(&mut self) -> ZkResult<HashSet<String>>;
    fn is_member_unlink_set(&mut self, nonce: &String) -> ZkResult<bool>;
    fn remove_from_unlink_set(&mut self, nonce: &String) -> ZkResult<bool>;

    // nonce => pay mask
    fn update_nonce_mask_map(&mut self, nonce: &String, mask: [u8; 32], r: [u8; 16]) -> ZkResult<()>;
    fn get_mask_map_from_nonce(&mut self, nonce: &String) -> ZkResult<([u8; 32], [u8; 16])>;
    fn remove_nonce_mask(&mut self, nonce: &String) -> ZkResult<()>;

    // session id => masked mpc inputs
    fn update_masked_mpc_inputs(&mut self, session_id: &String, mask_bytes: &MaskedMPCInputs) -> ZkResult<()>;
    fn get_masked_mpc_inputs(&mut self, session_id: &String) -> ZkResult<MaskedMPCInputs>;
    fn clear_masked_mpc_inputs(&mut self, session_id: &String) -> ZkResult<()>;

    // channel id => initial state
    fn store_activation_state(&mut self, channel_id: &String, s0: &State) -> ZkResult<()>;
    fn get_activation_state(&mut self, channel_id: &String) -> ZkResult<Option<State>>;

    // escrow txid => raw channel status
    fn get_raw_channel_status(&mut self, escrow_txid: &String) -> ZkResult<Option<String>>;
    fn put_raw_channel_status(&mut self, escrow_txid: &String, status: &str) -> ZkResult<()>;
    /// Atomically replaces the stored value if it equals `expected`
    /// (`None` meaning absent).
    fn cas_raw_channel_status(&mut self, escrow_txid: &String, expected: Option<&str>, status: &str) -> ZkResult<bool>;
    fn delete_channel_status(&mut self, escrow_txid: &String) -> ZkResult<()>;
    fn list_channel_ids(&mut self) -> ZkResult<Vec<String>>;

    // quarantine set
    fn quarantine_channel(&mut self, escrow_txid: &String) -> ZkResult<()>;
    fn is_quarantined(&mut self, escrow_txid: &String) -> ZkResult<bool>;

    fn clear_state(&mut self) -> ZkResult<()>;

    /// Absent channels report `ChannelStatus::None`.
    fn get_channel_status(&mut self, escrow_txid: &String) -> ZkResult<ChannelStatus> {
        if self.is_quarantined(escrow_txid)? {
            return Err(ZkChannelError::Quarantined(escrow_txid.clone()));
        }
        match self.get_raw_channel_status(escrow_txid)? {
            None => Ok(ChannelStatus::None),
            Some(raw) => match raw.parse::<ChannelStatus>() {
                Ok(s) => Ok(s),
                Err(e) => {
                    warn!(channel = %escrow_txid, error = %e, "corrupt channel status record, quarantining");
                    self.quarantine_channel(escrow_txid)?;
                    Err(ZkChannelError::Quarantined(escrow_txid.clone()))
                }
            },
        }
    }

    fn set_channel_status(&mut self, escrow_txid: &String, status: ChannelStatus) -> ZkResult<()> {
        if self.is_quarantined(escrow_txid)? {
            return Err(ZkChannelError::Quarantined(escrow_txid.clone()));
        }
        self.put_raw_channel_status(escrow_txid, &status.to_string())
    }

    /// Moves `escrow_txid` to `next` if the transition table allows it and
    /// no concurrent writer changed the status in between.
    fn transition_channel_status(&mut self, escrow_txid: &String, next: ChannelStatus) -> ZkResult<ChannelStatus> {
        let current = self.get_channel_status(escrow_txid)?;
        let next = current.transition(next)?;
        let expected = match current {
            ChannelStatus::None => None,
            s => Some(s.to_string()),
        };
        if !self.cas_raw_channel_status(escrow_txid, expected.as_deref(), &next.to_string())? {
            let now = self.get_channel_status(escrow_txid)?;
            return Err(ZkChannelError::TransitionNotAllowed { from: now, to: next });
        }
        debug!(channel = %escrow_txid, from = %current, to = %next, "channel status changed");
        Ok(next)
    }

    /// Removes a closed (or unknown) channel. Clearing twice is a no-op.
    fn clear_channel_status(&mut self, escrow_txid: &String) -> ZkResult<()> {
        let current = self.get_channel_status(escrow_txid)?;
        if !current.is_clearable() {
            return Err(ZkChannelError::InvalidStatus {
                op: "clear_channel_status",
                status: current.to_string(),
            });
        }
        self.delete_channel_status(escrow_txid)
    }
}

pub struct RedisDatabase {
    pub conn: redis::Connection,
    session_map_key: String,
    nonce_session_map_key: String,
    unlink_set_key: String,
    spent_map_key: String,
    rev_lock_map_key: String,
    nonce_mask_map_key: String,
    masked_bytes_key: String,
    activate_map_key: String,
    channel_status_key: String,
    quarantine_set_key: String,
}

impl RedisDatabase {
    fn all_keys(&self) -> Vec<String> {
        vec![
            self.session_map_key.clone(),
            self.nonce_session_map_key.clone(),
            self.unlink_set_key.clone(),
            self.spent_map_key.clone(),
            self.rev_lock_map_key.clone(),
            self.nonce_mask_map_key.clone(),
            self.masked_bytes_key.clone(),
            self.activate_map_key.clone(),
            self.channel_status_key.clone(),
            self.quarantine_set_key.clone(),
        ]
    }
}

impl StateDatabase for RedisDatabase {
    fn new(prefix: &str, url: String) -> ZkResult<Self> {
        let conn = create_db_connection(&url)?;
        Ok(RedisDatabase {
            conn,
            session_map_key: format!("{}:hashmap:session", prefix),
            nonce_session_map_key: format!("{}:hashmap:nonce_session", prefix),
            unlink_set_key: format!("{}:hashset:unlink", prefix),
            spent_map_key: format!("{}:hashmap:spent", prefix),
            rev_lock_map_key: format!("{}:hashmap:revlock", prefix),
            nonce_mask_map_key: format!("{}:hashmap:nonce_paymasks", prefix),
            masked_bytes_key: format!("{}:hashmap:masked_bytes", prefix),
            activate_map_key: format!("{}:hashmap:activate", prefix),
            channel_status_key: format!("{}:hashmap:channel_status", prefix),
            quarantine_set_key: format!("{}:hashset:quarantine", prefix),
        })
    }

    fn is_connected(&mut self) -> ZkResult<()> {
        let _: String = redis::cmd("PING").query(&mut self.conn)?;
        Ok(())
    }

    fn check_session_id(&mut self, session_id: &String) -> ZkResult<bool> {
        Ok(self.conn.hexists(&self.session_map_key, session_id)?)
    }

    fn save_new_session_state(&mut self, session_id: &String, session: &SessionState) -> ZkResult<bool> {
        let json = serde_json::to_string(session)?;
        Ok(self.conn.hset_nx(&self.session_map_key, session_id, json)?)
    }

    fn load_session_state(&mut self, session_id: &String) -> ZkResult<SessionState> {
        let json: Option<String> = self.conn.hget(&self.session_map_key, session_id)?;
        match json {
            Some(j) => Ok(serde_json::from_str(&j)?),
            None => Err(ZkChannelError::NotFound(format!("session {}", session_id))),
        }
    }

    fn update_session_state(&mut self, session_id: &String, session: &SessionState) -> ZkResult<()> {
        let json = serde_json::to_string(session)?;
        let _: i32 = self.conn.hset(&self.session_map_key, session_id, json)?;
        Ok(())
    }

    fn clear_session_state(&mut self, session_id: &String) -> ZkResult<()> {
        let _: i32 = self.conn.hdel(&self.session_map_key, session_id)?;
        Ok(())
    }

    fn bind_nonce_to_session(&mut self, nonce: &String, session_id: &String) -> ZkResult<bool> {
        let added: bool = self.conn.hset_nx(&self.nonce_session_map_key, nonce, session_id)?;
        if added {
            return Ok(true);
        }
        let bound: Option<String> = self.conn.hget(&self.nonce_session_map_key, nonce)?;
        Ok(bound.as_ref() == Some(session_id))
    }

    fn get_session_for_nonce(&mut self, nonce: &String) -> ZkResult<Option<String>> {
        Ok(self.conn.hget(&self.nonce_session_map_key, nonce)?)
    }

    fn unbind_nonce(&mut self, nonce: &String) -> ZkResult<()> {
        let _: i32 = self.conn.hdel(&self.nonce_session_map_key, nonce)?;
        Ok(())
    }

    // spent map calls
    fn update_spent_map(&mut self, nonce: &String, rev_lock: &String) -> ZkResult<bool> {
        let s: i32 = self.conn.hset(&self.spent_map_key, nonce, rev_lock)?;
        Ok(s >= 1)
    }

    fn check_spent_map(&mut self, nonce: &String) -> ZkResult<bool> {
        Ok(self.conn.hexists(&self.spent_map_key, nonce)?)
    }

    // rev_lock map calls
    fn update_rev_lock_map(&mut self, rev_lock: &String, rev_secret: &String) -> ZkResult<bool> {
        let s: i32 = self.conn.hset(&self.rev_lock_map_key, rev_lock, rev_secret)?;
        Ok(s >= 1)
    }

    fn check_rev_lock_map(&mut self, rev_lock: &String) -> ZkResult<bool> {
        Ok(self.conn.hexists(&self.rev_lock_map_key, rev_lock)?)
    }

    fn get_rev_secret(&mut self, rev_lock: &String) -> ZkResult<Option<String>> {
        Ok(self.conn.hget(&self.rev_lock_map_key, rev_lock)?)
    }

    // unlink set calls
    fn update_unlink_set(&mut self, nonce: &String) -> ZkResult<bool> {
        let added: i32 = self.conn.sadd(&self.unlink_set_key, nonce)?;
        Ok(added >= 1)
    }

    fn get_unlink_set(&mut self) -> ZkResult<HashSet<String>> {
        Ok(self.conn.smembers(&self.unlink_set_key)?)
    }

    fn is_member_unlink_set(&mut self, nonce: &String) -> ZkResult<bool> {
        Ok(self.conn.sismember(&self.unlink_set_key, nonce)?)
    }

    fn remove_from_unlink_set(&mut self, nonce: &String) -> ZkResult<bool> {
        let removed: i32 = self.conn.srem(&self.unlink_set_key, nonce)?;
        Ok(removed >= 1)
    }

    fn update_nonce_mask_map(&mut self, nonce: &String, mask: [u8; 32], r: [u8; 16]) -> ZkResult<()> {
        let m = PayMaskMap {
            mask: FixedSizeArray32(mask),
            r: FixedSizeArray16(r),
        };
        let json = serde_json::to_string(&m)?;
        let _: i32 = self.conn.hset(&self.nonce_mask_map_key, nonce, json)?;
        Ok(())
    }

    fn get_mask_map_from_nonce(&mut self, nonce: &String) -> ZkResult<([u8; 32], [u8; 16])> {
        let json: Option<String> = self.conn.hget(&self.nonce_mask_map_key, nonce)?;
        match json {
            Some(j) => {
                let m: PayMaskMap = serde_json::from_str(&j)?;
                Ok((m.mask.0, m.r.0))
            }
            None => Err(ZkChannelError::NotFound(format!("pay mask for nonce {}", nonce))),
        }
    }

    fn remove_nonce_mask(&mut self, nonce: &String) -> ZkResult<()> {
        let _: i32 = self.conn.hdel(&self.nonce_mask_map_key, nonce)?;
        Ok(())
    }

    fn update_masked_mpc_inputs(&mut self, session_id: &String, mask_bytes: &MaskedMPCInputs) -> ZkResult<()> {
        let json = serde_json::to_string(mask_bytes)?;
        let _: i32 = self.conn.hset(&self.masked_bytes_key, session_id, json)?;
        Ok(())
    }

    fn get_masked_mpc_inputs(&mut self, session_id: &String) -> ZkResult<MaskedMPCInputs> {
        let json: Option<String> = self.conn.hget(&self.masked_bytes_key, session_id)?;
        match json {
            Some(j) => Ok(serde_json::from_str(&j)?),
            None => Err(ZkChannelError::NotFound(format!("masked inputs for session {}", session_id))),
        }
    }

    fn clear_masked_mpc_inputs(&mut self, session_id: &String) -> ZkResult<()> {
        let _: i32 = self.conn.hdel(&self.masked_bytes_key, session_id)?;
        Ok(())
    }

    fn store_activation_state(&mut self, channel_id: &String, s0: &State) -> ZkResult<()> {
        let json = serde_json::to_string(s0)?;
        let _: i32 = self.conn.hset(&self.activate_map_key, channel_id, json)?;
        Ok(())
    }

    fn get_activation_state(&mut self, channel_id: &String) -> ZkResult<Option<State>> {
        let json: Option<String> = self.conn.hget(&self.activate_map_key, channel_id)?;
        match json {
            Some(j) => Ok(Some(serde_json::from_str(&j)?)),
            None => Ok(None),
        }
    }

    fn get_raw_channel_status(&mut self, escrow_txid: &String) -> ZkResult<Option<String>> {
        Ok(self.conn.hget(&self.channel_status_key, escrow_txid)?)
    }

    fn put_raw_channel_status(&mut self, escrow_txid: &String, status: &str) -> ZkResult<()> {
        let _: i32 = self.conn.hset(&self.channel_status_key, escrow_txid, status)?;
        Ok(())
    }

    fn cas_raw_channel_status(&mut self, escrow_txid: &String, expected: Option<&str>, status: &str) -> ZkResult<bool> {
        let key = self.channel_status_key.clone();
        let swapped: bool = redis::transaction(&mut self.conn, &[key.as_str()], |con, pipe| {
            let current: Option<String> = con.hget(&key, escrow_txid)?;
            if current.as_deref() != expected {
                return Ok(Some(false));
            }
            let done: Option<()> = pipe.hset(&key, escrow_txid, status).ignore().query(con)?;
            Ok(done.map(|_| true))
        })?;
        Ok(swapped)
    }

    fn delete_channel_status(&mut self, escrow_txid: &String) -> ZkResult<()> {
        let _: i32 = self.conn.hdel(&self.channel_status_key, escrow_txid)?;
        Ok(())
    }

    fn list_channel_ids(&mut self) -> ZkResult<Vec<String>> {
        let mut ids: Vec<String> = self.conn.hkeys(&self.channel_status_key)?;
        ids.sort();
        Ok(ids)
    }

    fn quarantine_channel(&mut self, escrow_txid: &String) -> ZkResult<()> {
        let _: i32 = self.conn.sadd(&self.quarantine_set_key, escrow_txid)?;
        Ok(())
    }

    fn is_quarantined(&mut self, escrow_txid: &String) -> ZkResult<bool> {
        Ok(self.conn.sismember(&self.quarantine_set_key, escrow_txid)?)
    }

    fn clear_state(&mut self) -> ZkResult<()> {
        for key in self.all_keys() {
            let _: i32 = self.conn.del(&key)?;
        }
        Ok(())
    }
}

/// In-memory store for tests and single-process use.
#[derive(Default)]
pub struct HashMapDatabase {
    pub session_map: HashMap<String, SessionState>,
    pub nonce_session_map: HashMap<String, String>,
    pub nonce_mask_map: HashMap<String, PayMaskMap>,
    pub unlink_map: HashSet<String>,
    pub spent_lock_map: HashMap<String, String>,
    pub rev_lock_map: HashMap<String, String>,
    pub mask_mpc_bytes: HashMap<String, MaskedMPCInputs>,
    pub activate_map: HashMap<String, State>,
    pub channel_status_map: HashMap<String, String>,
    pub quarantine_set: HashSet<String>,
}

impl StateDatabase for HashMapDatabase {
    fn new(_prefix: &str, _url: String) -> ZkResult<Self> {
        Ok(HashMapDatabase::default())
    }

    fn is_connected(&mut self) -> ZkResult<()> {
        Ok(())
    }

    fn check_session_id(&mut self, session_id: &String) -> ZkResult<bool> {
        Ok(self.session_map.contains_key(session_id))
    }

    fn save_new_session_state(&mut self, session_id: &String, session: &SessionState) -> ZkResult<bool> {
        if self.session_map.contains_key(session_id) {
            return Ok(false);
        }
        self.session_map.insert(session_id.clone(), session.clone());
        Ok(true)
    }

    fn load_session_state(&mut self, session_id: &String) -> ZkResult<SessionState> {
        self.session_map
            .get(session_id)
            .cloned()
            .ok_or_else(|| ZkChannelError::NotFound(format!("session {}", session_id)))
    }

    fn update_session_state(&mut self, session_id: &String, session: &SessionState) -> ZkResult<()> {
        self.session_map.insert(session_id.clone(), session.clone());
        Ok(())
    }

    fn clear_session_state(&mut self, session_id: &String) -> ZkResult<()> {
        self.session_map.remove(session_id);
        Ok(())
    }

    fn bind_nonce_to_session(&mut self, nonce: &String, session_id: &String) -> ZkResult<bool> {
        match self.nonce_session_map.get(nonce) {
            Some(bound) => Ok(bound == session_id),
            None => {
                self.nonce_session_map.insert(nonce.clone(), session_id.clone());
                Ok(true)
            }
        }
    }

    fn get_session_for_nonce(&mut self, nonce: &String) -> ZkResult<Option<String>> {
        Ok(self.nonce_session_map.get(nonce).cloned())
    }

    fn unbind_nonce(&mut self, nonce: &String) -> ZkResult<()> {
        self.nonce_session_map.remove(nonce);
        Ok(())
    }

    fn update_spent_map(&mut self, nonce: &String, rev_lock: &String) -> ZkResult<bool> {
        Ok(self.spent_lock_map.insert(nonce.clone(), rev_lock.clone()).is_none())
    }

    fn check_spent_map(&mut self, nonce: &String) -> ZkResult<bool> {
        Ok(self.spent_lock_map.contains_key(nonce))
    }

    fn update_rev_lock_map(&mut self, rev_lock: &String, rev_secret: &String) -> ZkResult<bool> {
        Ok(self.rev_lock_map.insert(rev_lock.clone(), rev_secret.clone()).is_none())
    }

    fn check_rev_lock_map(&mut self, rev_lock: &String) -> ZkResult<bool> {
        Ok(self.rev_lock_map.contains_key(rev_lock))
    }

    fn get_rev_secret(&mut self, rev_lock: &String) -> ZkResult<Option<String>> {
        Ok(self.rev_lock_map.get(rev_lock).cloned())
    }

    fn update_unlink_set(&mut self, nonce: &String) -> ZkResult<bool> {
        Ok(self.unlink_map.insert(nonce.clone()))
    }

    fn get_unlink_set(&mut self) -> ZkResult<HashSet<String>> {
        Ok(self.unlink_map.clone())
    }

    fn is_member_unlink_set(&mut self, nonce: &String) -> ZkResult<bool> {
        Ok(self.unlink_map.contains(nonce))
    }

    fn remove_from_unlink_set(&mut self, nonce: &String) -> ZkResult<bool> {
        Ok(self.unlink_map.remove(nonce))
    }

    fn update_nonce_mask_map(&mut self, nonce: &String, mask: [u8; 32], r: [u8; 16]) -> ZkResult<()> {
        self.nonce_mask_map.insert(
            nonce.clone(),
            PayMaskMap {
                mask: FixedSizeArray32(mask),
                r: FixedSizeArray16(r),
            },
        );
        Ok(())
    }

    fn get_mask_map_from_nonce(&mut self, nonce: &String) -> ZkResult<([u8; 32], [u8; 16])> {
        match self.nonce_mask_map.get(nonce) {
            Some(m) => Ok((m.mask.0, m.r.0)),
            None => Err(ZkChannelError::NotFound(format!("pay mask for nonce {}", nonce))),
        }
    }

    fn remove_nonce_mask(&mut self, nonce: &String) -> ZkResult<()> {
        self.nonce_mask_map.remove(nonce);
        Ok(())
    }

    fn update_masked_mpc_inputs(&mut self, session_id: &String, mask_bytes: &MaskedMPCInputs) -> ZkResult<()> {
        self.mask_mpc_bytes.insert(session_id.clone(), mask_bytes.clone());
        Ok(())
    }

    fn get_masked_mpc_inputs(&mut self, session_id: &String) -> ZkResult<MaskedMPCInputs> {
        self.mask_mpc_bytes
            .get(session_id)
            .cloned()
            .ok_or_else(|| ZkChannelError::NotFound(format!("masked inputs for session {}", session_id)))
    }

    fn clear_masked_mpc_inputs(&mut self, session_id: &String) -> ZkResult<()> {
        self.mask_mpc_bytes.remove(session_id);
        Ok(())
    }

    fn store_activation_state(&mut self, channel_id: &String, s0: &State) -> ZkResult<()> {
        self.activate_map.insert(channel_id.clone(), *s0);
        Ok(())
    }

    fn get_activation_state(&mut self, channel_id: &String) -> ZkResult<Option<State>> {
        Ok(self.activate_map.get(channel_id).cloned())
    }

    fn get_raw_channel_status(&mut self, escrow_txid: &String) -> ZkResult<Option<String>> {
        Ok(self.channel_status_map.get(escrow_txid).cloned())
    }

    fn put_raw_channel_status(&mut self, escrow_txid: &String, status: &str) -> ZkResult<()> {
        self.channel_status_map.insert(escrow_txid.clone(), status.to_string());
        Ok(())
    }

    fn cas_raw_channel_status(&mut self, escrow_txid: &String, expected: Option<&str>, status: &str) -> ZkResult<bool> {
        if self.channel_status_map.get(escrow_txid).map(|s| s.as_str()) != expected {
            return Ok(false);
        }
        self.channel_status_map.insert(escrow_txid.clone(), status.to_string());
        Ok(true)
    }

    fn delete_channel_status(&mut self, escrow_txid: &String) -> ZkResult<()> {
        self.channel_status_map.remove(escrow_txid);
        Ok(())
    }

    fn list_channel_ids(&mut self) -> ZkResult<Vec<String>> {
        let mut ids: Vec<String> = self.channel_status_map.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn quarantine_channel(&mut self, escrow_txid: &String) -> ZkResult<()> {
        self.quarantine_set.insert(escrow_txid.clone());
        Ok(())
    }

    fn is_quarantined(&mut self, escrow_txid: &String) -> ZkResult<bool> {
        Ok(self.quarantine_set.contains(escrow_txid))
    }

    fn clear_state(&mut self) -> ZkResult<()> {
        *self = HashMapDatabase::default();
        Ok(())
    }
}

/// Decodes a stored rev secret back into bytes.
pub fn decode_rev_secret(rev_secret_hex: &str) -> ZkResult<[u8; 32]> {
    crate::util::decode_hex_32("rev_secret", rev_secret_hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hash_to_slice;

    fn exercise_db(db: &mut dyn StateDatabase) {
        db.clear_state().unwrap();

        let b = hex::encode([1u8; 32]);
        let c = hex::encode([2u8; 32]);
        assert!(db.update_unlink_set(&b).unwrap());
        assert!(db.update_unlink_set(&c).unwrap());
        assert_eq!(db.get_unlink_set().unwrap().len(), 2);
        assert!(db.is_member_unlink_set(&c).unwrap());
        assert!(db.remove_from_unlink_set(&c).unwrap());
        assert!(!db.is_member_unlink_set(&c).unwrap());

        let nonce1 = hex::encode([2u8; 16]);
        let nonce2 = hex::encode([5u8; 16]);
        let rev_lock = hex::encode([4u8; 32]);
        db.update_spent_map(&nonce1, &rev_lock).unwrap();
        assert!(db.check_spent_map(&nonce1).unwrap());
        assert!(!db.check_spent_map(&nonce2).unwrap());

        let rev_sec1 = hex::encode([6u8; 32]);
        let rev_lock1 = hex::encode(hash_to_slice(&[6u8; 32]));
        db.update_rev_lock_map(&rev_lock1, &rev_sec1).unwrap();
        assert!(db.check_rev_lock_map(&rev_lock1).unwrap());
        // rev locks never land in the spent map
        assert!(!db.check_spent_map(&rev_lock1).unwrap());
        assert_eq!(db.get_rev_secret(&rev_lock1).unwrap(), Some(rev_sec1));
        assert_eq!(db.get_rev_secret(&rev_lock).unwrap(), None);

        let sid = hex::encode([9u8; 16]);
        let session = SessionState {
            nonce: FixedSizeArray16([2u8; 16]),
            rev_lock_com: FixedSizeArray32([3u8; 32]),
            amount: 10,
            status: PaymentStatus::Prepare,
        };
        assert!(db.save_new_session_state(&sid, &session).unwrap());
        assert!(!db.save_new_session_state(&sid, &session).unwrap());
        assert_eq!(db.load_session_state(&sid).unwrap(), session);

        assert!(db.bind_nonce_to_session(&nonce1, &sid).unwrap());
        assert!(db.bind_nonce_to_session(&nonce1, &sid).unwrap());
        assert!(!db.bind_nonce_to_session(&nonce1, &hex::encode([8u8; 16])).unwrap());

        db.update_nonce_mask_map(&nonce1, [1u8; 32], [2u8; 16]).unwrap();
        assert_eq!(db.get_mask_map_from_nonce(&nonce1).unwrap(), ([1u8; 32], [2u8; 16]));
        db.remove_nonce_mask(&nonce1).unwrap();
        assert!(db.get_mask_map_from_nonce(&nonce1).is_err());
        db.remove_nonce_mask(&nonce1).unwrap();

        let masks = MaskedMPCInputs {
            pt_mask: FixedSizeArray32([1u8; 32]),
            pt_mask_r: FixedSizeArray16([2u8; 16]),
            escrow_mask: FixedSizeArray32([3u8; 32]),
            merch_mask: FixedSizeArray32([4u8; 32]),
            r_escrow_sig: FixedSizeArray32([5u8; 32]),
            r_merch_sig: FixedSizeArray32([6u8; 32]),
        };
        db.update_masked_mpc_inputs(&sid, &masks).unwrap();
        assert_eq!(db.get_masked_mpc_inputs(&sid).unwrap(), masks);
        db.clear_masked_mpc_inputs(&sid).unwrap();
        assert!(db.get_masked_mpc_inputs(&sid).is_err());
    }

    fn exercise_status(db: &mut dyn StateDatabase) {
        db.clear_state().unwrap();
        let id = hex::encode([7u8; 32]);
        assert_eq!(db.get_channel_status(&id).unwrap(), ChannelStatus::None);
        db.transition_channel_status(&id, ChannelStatus::PendingOpen).unwrap();

        let err = db.transition_channel_status(&id, ChannelStatus::ConfirmedClose).unwrap_err();
        assert_eq!(err.to_string(), "transition not allowed: `PendingOpen` => `ConfirmedClose`");
        assert_eq!(db.get_channel_status(&id).unwrap(), ChannelStatus::PendingOpen);

        // a concurrent writer got in first
        assert!(!db.cas_raw_channel_status(&id, Some("Open"), "PendingClose").unwrap());
        assert!(db.clear_channel_status(&id).is_err());

        for s in &[ChannelStatus::Open, ChannelStatus::PendingClose, ChannelStatus::ConfirmedClose] {
            db.transition_channel_status(&id, *s).unwrap();
        }
        assert_eq!(db.list_channel_ids().unwrap(), vec![id.clone()]);
        db.clear_channel_status(&id).unwrap();
        db.clear_channel_status(&id).unwrap();
        assert!(db.list_channel_ids().unwrap().is_empty());
    }

    #[test]
    fn hashmap_database_works() {
        let mut db = HashMapDatabase::new("test", String::new()).unwrap();
        exercise_db(&mut db);
        exercise_status(&mut db);
    }

    #[test]
    fn corrupt_status_quarantines_channel() {
        let mut db = HashMapDatabase::new("test", String::new()).unwrap();
        let bad = hex::encode([1u8; 32]);
        let good = hex::encode([2u8; 32]);
        db.put_raw_channel_status(&bad, "Opn").unwrap();
        db.set_channel_status(&good, ChannelStatus::Open).unwrap();

        match db.get_channel_status(&bad) {
            Err(ZkChannelError::Quarantined(id)) => assert_eq!(id, bad),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(db.is_quarantined(&bad).unwrap());
        assert!(db.transition_channel_status(&bad, ChannelStatus::PendingClose).is_err());
        assert_eq!(db.get_channel_status(&good).unwrap(), ChannelStatus::Open);
    }

    #[test]
    #[ignore] // needs a redis server on localhost
    fn redis_database_works() {
        let mut db = RedisDatabase::new("test", "redis://127.0.0.1/".to_string()).unwrap();
        exercise_db(&mut db);
        exercise_status(&mut db);
        db.clear_state().unwrap();
    }
}
