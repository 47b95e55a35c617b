use hmac::{Hmac, Mac};
use rand::Rng;
use ripemd160::Ripemd160;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::error::{ZkChannelError, ZkResult};

type HmacSha256 = Hmac<Sha256>;

pub const COMMITMENT_RANDOMNESS_LEN: usize = 16;

pub fn hash_to_slice(input_buf: &[u8]) -> [u8; 32] {
    let sha2_digest = Sha256::digest(input_buf);
    let mut hash_buf = [0u8; 32];
    hash_buf.copy_from_slice(&sha2_digest);
    hash_buf
}

/// SHA256(SHA256(x)), used for the prevout digests kept in channel state.
pub fn double_sha256(input_buf: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(input_buf);
    hash_to_slice(&first)
}

pub fn compute_hash160(input_buf: &[u8]) -> [u8; 20] {
    let sha2_hash_buf = hash_to_slice(input_buf);
    let mut ripemd_hasher = Ripemd160::new();
    ripemd_hasher.input(sha2_hash_buf);
    let md = ripemd_hasher.result();

    let mut hash_buf = [0u8; 20];
    hash_buf.copy_from_slice(&md);
    hash_buf
}

pub fn hmac_sign(key: &[u8], message: &[u8]) -> ZkResult<[u8; 32]> {
    let mut mac = HmacSha256::new_varkey(key)
        .map_err(|_| ZkChannelError::Validation("invalid hmac key length".to_string()))?;
    mac.input(message);
    let sha2_mac = mac.result().code();
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&sha2_mac);
    Ok(tag)
}

/// Constant-time check of an HMAC tag.
pub fn hmac_verify(key: &[u8], message: &[u8], tag: &[u8; 32]) -> bool {
    let mut mac = match HmacSha256::new_varkey(key) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.input(message);
    mac.verify(tag).is_ok()
}

/// Hash commitment `SHA256(value || r)`.
pub fn compute_commitment(value: &[u8], r: &[u8; COMMITMENT_RANDOMNESS_LEN]) -> [u8; 32] {
    let mut input_buf = Vec::with_capacity(value.len() + r.len());
    input_buf.extend_from_slice(value);
    input_buf.extend_from_slice(r);
    hash_to_slice(&input_buf)
}

pub fn open_commitment(com: &[u8; 32], value: &[u8], r: &[u8; COMMITMENT_RANDOMNESS_LEN]) -> bool {
    &compute_commitment(value, r) == com
}

/// The revocation lock for a secret: `SHA256(rev_secret)`.
pub fn compute_rev_lock(rev_secret: &[u8; 32]) -> [u8; 32] {
    hash_to_slice(rev_secret)
}

pub fn is_valid_rev_secret(rev_lock: &[u8; 32], rev_secret: &[u8; 32]) -> bool {
    &compute_rev_lock(rev_secret) == rev_lock
}

pub fn xor_in_place(a: &mut [u8], b: &[u8]) {
    for (b1, b2) in a.iter_mut().zip(b.iter()) {
        *b1 ^= *b2;
    }
}

pub fn reverse_bytes(input: &[u8; 32]) -> [u8; 32] {
    let mut out = *input;
    out.reverse();
    out
}

/// Outpoint digest of a single-input spend: `SHA256d(txid_be || index_le)`.
pub fn compute_prevout(txid_be: &[u8; 32], index: u32) -> [u8; 32] {
    let mut prevout_preimage: Vec<u8> = Vec::with_capacity(36);
    prevout_preimage.extend_from_slice(txid_be);
    prevout_preimage.extend_from_slice(&index.to_le_bytes());
    double_sha256(&prevout_preimage)
}

/// Fresh secp256k1 keypair; rejection-samples the (negligible) invalid range.
pub fn generate_keypair<R: Rng>(csprng: &mut R) -> (PublicKey, SecretKey) {
    let secp = Secp256k1::signing_only();
    loop {
        let mut seckey = [0u8; 32];
        csprng.fill_bytes(&mut seckey);
        if let Ok(sk) = SecretKey::from_slice(&seckey) {
            return (PublicKey::from_secret_key(&secp, &sk), sk);
        }
    }
}

pub fn public_key_from_bytes(label: &str, sk: &[u8; 32]) -> ZkResult<(PublicKey, SecretKey)> {
    let secp = Secp256k1::signing_only();
    let sk = SecretKey::from_slice(sk)
        .map_err(|e| ZkChannelError::Validation(format!("invalid {}: {}", label, e)))?;
    Ok((PublicKey::from_secret_key(&secp, &sk), sk))
}

pub fn decode_hex_32(label: &str, s: &str) -> ZkResult<[u8; 32]> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 32 {
        return Err(ZkChannelError::Validation(format!(
            "{} must be 32 bytes, got {}",
            label,
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn decode_hex_16(label: &str, s: &str) -> ZkResult<[u8; 16]> {
    let bytes = hex::decode(s)?;
    if bytes.len() != 16 {
        return Err(ZkChannelError::Validation(format!(
            "{} must be 16 bytes, got {}",
            label,
            bytes.len()
        )));
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(out)
}
