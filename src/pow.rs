//! Proof-of-work admission.
//!
//! The nonce search is capped by a configurable ceiling, returning an
//! explicit error rather than searching forever.

use crate::config::SidechannelConfig;
use crate::crypto::{canonicalize, leading_zero_bits, sha256_hex};
use crate::error::PowError;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PowProof {
    pub nonce: u64,
    pub difficulty: u32,
}

/// `_powBase(payload, nonce)`: canonical serialization of exactly
/// {id, channel, from, origin, message, ts, nonce}.
fn pow_base(
    id: &str,
    channel: &str,
    from: Option<&str>,
    origin: Option<&str>,
    message: &serde_json::Value,
    ts: i64,
    nonce: u64,
) -> String {
    let value = json!({
        "id": id,
        "channel": channel,
        "from": from,
        "origin": origin,
        "message": message,
        "ts": ts,
        "nonce": nonce,
    });
    canonicalize(&value)
}

/// Find the smallest nonce >= 0 such that the leading zero bits of
/// SHA-256(powBase) >= difficulty, bounded by `max_attempts`.
#[allow(clippy::too_many_arguments)]
pub fn attach(
    id: &str,
    channel: &str,
    from: Option<&str>,
    origin: Option<&str>,
    message: &serde_json::Value,
    ts: i64,
    difficulty: u32,
    max_attempts: u64,
) -> Result<PowProof, PowError> {
    for nonce in 0..max_attempts {
        let base = pow_base(id, channel, from, origin, message, ts, nonce);
        let digest = sha256_hex(&base);
        if leading_zero_bits(&digest) >= difficulty {
            return Ok(PowProof { nonce, difficulty });
        }
    }
    Err(PowError::CeilingExceeded { max_attempts, difficulty })
}

/// Recompute with the currently configured difficulty; the payload's
/// claimed difficulty is not trusted (local policy is authoritative).
#[allow(clippy::too_many_arguments)]
pub fn check(
    id: &str,
    channel: &str,
    from: Option<&str>,
    origin: Option<&str>,
    message: &serde_json::Value,
    ts: i64,
    proof: Option<&PowProof>,
    required_difficulty: u32,
) -> bool {
    if required_difficulty == 0 {
        return true;
    }
    let Some(proof) = proof else { return false };
    let base = pow_base(id, channel, from, origin, message, ts, proof.nonce);
    let digest = sha256_hex(&base);
    leading_zero_bits(&digest) >= required_difficulty
}

/// Whether PoW is required for `channel`, per the three-way channel
/// policy.
pub fn is_required(config: &SidechannelConfig, channel: &str) -> bool {
    config.channel_requires_pow(channel)
}
