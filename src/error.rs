//! Typed errors per component.
//!
//! Per the error handling design: admission failures (invite, PoW, rate,
//! owner-write, duplicate, welcome) never propagate as errors — they are
//! silent drops, optionally logged at debug. Only `start` (autopost) and
//! `broadcast` (sidechannel) raise errors to the caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("value is not canonically encodable")]
    NotEncodable,
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

#[derive(Error, Debug)]
pub enum PowError {
    #[error("no nonce under {max_attempts} attempts met difficulty {difficulty}")]
    CeilingExceeded { max_attempts: u64, difficulty: u32 },
}

#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("payload serializes to {actual} bytes, exceeding max_message_bytes {max}")]
    TooLarge { actual: usize, max: usize },
    #[error("channel {0:?} was denied by invite policy")]
    ChannelDenied(String),
    #[error("pow ceiling exceeded while attaching proof of work")]
    Pow(#[from] PowError),
    #[error("payload is not JSON-encodable: {0}")]
    Encoding(String),
}

#[derive(Error, Debug)]
pub enum AutopostError {
    #[error("unknown tool {0:?}, expected OFFER_POST or RFQ_POST")]
    UnknownTool(String),
    #[error("interval_sec {0} out of range [1, 86400]")]
    BadInterval(u64),
    #[error("ttl_sec {0} out of range [10, 604800]")]
    BadTtl(u64),
    #[error("valid_until_unix horizon {0}s out of range [10, 604800] from now")]
    BadHorizon(i64),
    #[error("name {0:?} collides after 20 candidate attempts")]
    NameCollision(String),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("channel name must be a trimmed, non-empty string")]
    EmptyName,
    #[error("channel {0:?} denied: invite required and local peer is not an inviter or invitee")]
    InviteDenied(String),
}
